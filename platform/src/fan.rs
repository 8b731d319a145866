// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! The AS7816 fan tray CPLD, controlling four dual-rotor fan modules.

use crate::bus::BusClient;
use crate::cache::CachedSnapshot;
use crate::cache::RefreshPolicy;
use crate::cache::Snapshot;
use crate::registry::BusDevice;
use crate::BusAddress;
use crate::Error;
use slog::debug;
use std::time::Duration;
use switch_platform_decode::fan;
use switch_platform_decode::FanDirection;

/// The usual location of the fan tray CPLD.
pub const FAN_TRAY_BUS: u16 = 17;
pub const FAN_TRAY_ADDRESS: u8 = 0x68;

/// The number of fan modules in the tray.
pub const NUM_FANS: u8 = 4;

pub const PRESENCE_REGISTER: u8 = 0x80;
pub const DIRECTION_REGISTER: u8 = 0x81;
pub const DUTY_REGISTER: u8 = 0x87;
pub const FRONT_RPM_BASE: u8 = 0x90;
pub const REAR_RPM_BASE: u8 = 0x98;

/// Writing zero here stops the CPLD from overriding the commanded duty.
pub const WATCHDOG_REGISTER: u8 = 0x28;

/// Every register held in the tray's snapshot.
pub const FAN_REGISTERS: [u8; 11] = [
    PRESENCE_REGISTER,
    DIRECTION_REGISTER,
    DUTY_REGISTER,
    FRONT_RPM_BASE,
    FRONT_RPM_BASE + 1,
    FRONT_RPM_BASE + 2,
    FRONT_RPM_BASE + 3,
    REAR_RPM_BASE,
    REAR_RPM_BASE + 1,
    REAR_RPM_BASE + 2,
    REAR_RPM_BASE + 3,
];

/// The state of one fan module.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FanStatus {
    /// The 1-based fan number.
    pub fan: u8,
    pub present: bool,
    pub direction: FanDirection,
    pub front_rpm: u32,
    pub rear_rpm: u32,
    pub fault: bool,
}

/// The fan tray CPLD.
#[derive(Debug)]
pub struct FanTray {
    client: BusClient,
    snapshot: CachedSnapshot<u8, u8>,
}

impl BusDevice for FanTray {
    fn address(&self) -> BusAddress {
        self.client.address()
    }
}

fn check_fan(fan: u8) -> Result<(), Error> {
    if (1..=NUM_FANS).contains(&fan) {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "fans are numbered 1 to {NUM_FANS}, found {fan}"
        )))
    }
}

impl FanTray {
    pub fn new(client: BusClient, interval: Duration) -> Self {
        let snapshot =
            CachedSnapshot::new(FAN_REGISTERS, interval, RefreshPolicy::Strict, client.log());
        Self { client, snapshot }
    }

    fn refresh(&self) -> Result<Snapshot<u8, u8>, Error> {
        self.snapshot.refresh(|reg| self.client.read_byte(reg))
    }

    fn fan_status(snapshot: &Snapshot<u8, u8>, fan: u8) -> Result<FanStatus, Error> {
        let index = fan - 1;
        let front = snapshot.get(FRONT_RPM_BASE + index);
        let rear = snapshot.get(REAR_RPM_BASE + index);
        Ok(FanStatus {
            fan,
            present: fan::is_present(snapshot.get(PRESENCE_REGISTER), index)?,
            direction: fan::direction(snapshot.get(DIRECTION_REGISTER), index)?,
            front_rpm: fan::rpm_from_register(front),
            rear_rpm: fan::rpm_from_register(rear),
            fault: fan::is_fault(front, rear),
        })
    }

    /// Return the state of the 1-based fan `fan`.
    pub fn status(&self, fan: u8) -> Result<FanStatus, Error> {
        check_fan(fan)?;
        Self::fan_status(&self.refresh()?, fan)
    }

    /// Return the state of every fan, from a single snapshot.
    pub fn status_all(&self) -> Result<Vec<FanStatus>, Error> {
        let snapshot = self.refresh()?;
        (1..=NUM_FANS)
            .map(|fan| Self::fan_status(&snapshot, fan))
            .collect()
    }

    pub fn is_present(&self, fan: u8) -> Result<bool, Error> {
        self.status(fan).map(|s| s.present)
    }

    pub fn direction(&self, fan: u8) -> Result<FanDirection, Error> {
        self.status(fan).map(|s| s.direction)
    }

    pub fn front_rpm(&self, fan: u8) -> Result<u32, Error> {
        self.status(fan).map(|s| s.front_rpm)
    }

    pub fn rear_rpm(&self, fan: u8) -> Result<u32, Error> {
        self.status(fan).map(|s| s.rear_rpm)
    }

    pub fn is_fault(&self, fan: u8) -> Result<bool, Error> {
        self.status(fan).map(|s| s.fault)
    }

    /// Return true if any fan has a stopped rotor.
    pub fn any_fault(&self) -> Result<bool, Error> {
        Ok(self.status_all()?.iter().any(|s| s.fault))
    }

    /// The duty cycle shared by every fan, in percent.
    pub fn duty(&self) -> Result<u32, Error> {
        Ok(fan::duty_from_register(self.refresh()?.get(DUTY_REGISTER)))
    }

    /// Command the duty cycle of every fan, in percent.
    pub fn set_duty(&self, duty: u32) -> Result<(), Error> {
        let raw = fan::duty_to_register(duty)?;
        self.snapshot.write(|| {
            self.client.write_byte(WATCHDOG_REGISTER, 0)?;
            self.client.write_byte(DUTY_REGISTER, raw)
        })?;
        debug!(self.client.log(), "set fan duty"; "duty" => duty, "register" => raw);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::FanTray;
    use super::DUTY_REGISTER;
    use super::WATCHDOG_REGISTER;
    use crate::bus::BusClient;
    use crate::config::RetryPolicy;
    use crate::sim::SimulatedBus;
    use crate::BusAddress;
    use crate::BusError;
    use crate::Error;
    use std::sync::Arc;
    use std::time::Duration;
    use switch_platform_decode::FanDirection;

    fn setup() -> (Arc<SimulatedBus>, BusAddress, FanTray) {
        let log = slog::Logger::root(slog::Discard, slog::o!());
        let address = BusAddress::new(17, 0x68).unwrap();
        let bus = Arc::new(SimulatedBus::new());
        // Fan 4 missing, fan 2 blowing back to front.
        bus.set_byte(address, 0x80, 0x08);
        bus.set_byte(address, 0x81, 0x02);
        bus.set_byte(address, 0x87, 0x05);
        bus.set_bytes(address, 0x90, &[120, 118, 121, 0]);
        bus.set_bytes(address, 0x98, &[100, 99, 0, 0]);
        let client = BusClient::new(bus.clone(), address, RetryPolicy::once(), &log);
        (bus, address, FanTray::new(client, Duration::from_secs(60)))
    }

    #[test]
    fn test_status() {
        let (_bus, _address, tray) = setup();
        let fan1 = tray.status(1).unwrap();
        assert!(fan1.present);
        assert_eq!(fan1.direction, FanDirection::FrontToBack);
        assert_eq!(fan1.front_rpm, 12_000);
        assert_eq!(fan1.rear_rpm, 10_000);
        assert!(!fan1.fault);

        assert_eq!(tray.direction(2).unwrap(), FanDirection::BackToFront);
        assert!(tray.is_fault(3).unwrap());
        assert!(!tray.is_present(4).unwrap());
        assert!(tray.any_fault().unwrap());
        assert_eq!(tray.duty().unwrap(), 40);
    }

    #[test]
    fn test_fan_numbers() {
        let (_bus, _address, tray) = setup();
        assert!(matches!(tray.status(0), Err(Error::InvalidArgument(_))));
        assert!(tray.status(5).is_err());
        assert_eq!(tray.status_all().unwrap().len(), 4);
    }

    #[test]
    fn test_snapshot_is_shared() {
        let (bus, address, tray) = setup();
        tray.status_all().unwrap();
        tray.duty().unwrap();
        tray.front_rpm(2).unwrap();
        assert_eq!(bus.read_count_at(address, 0x9B), 1);
    }

    #[test]
    fn test_failed_refresh_is_an_error() {
        let (bus, address, tray) = setup();
        bus.inject_fault(address, 0x92, BusError::Nack, 1);
        assert!(matches!(tray.status(1), Err(Error::Bus { register: 0x92, .. })));
        assert!(tray.status(1).is_ok());
    }

    #[test]
    fn test_set_duty_disables_watchdog_first() {
        let (bus, address, tray) = setup();
        tray.duty().unwrap();
        tray.set_duty(100).unwrap();
        assert_eq!(
            bus.writes(),
            vec![
                (address, WATCHDOG_REGISTER, vec![0]),
                (address, DUTY_REGISTER, vec![0x0F]),
            ]
        );
        assert_eq!(tray.duty().unwrap(), 100);
        assert!(matches!(tray.set_duty(101), Err(Error::Decode(_))));
    }
}
