// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! The front-panel LEDs, whose fields live in the CPLD's LED registers.

use crate::cache::CachedSnapshot;
use crate::cache::RefreshPolicy;
use crate::cpld::Cpld;
use crate::registry::DeviceRegistry;
use crate::BusAddress;
use crate::Error;
use slog::debug;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;
use switch_platform_decode::led;
use switch_platform_decode::led::LED_REGISTERS;
use switch_platform_types::LedKind;
use switch_platform_types::LedMode;

/// The board's status LEDs.
#[derive(Debug)]
pub struct Leds {
    cpld: Arc<Cpld>,
    snapshot: CachedSnapshot<u8, u8>,
    log: Logger,
}

impl Leds {
    /// Attach to the LEDs of the CPLD registered at `cpld`.
    pub fn attach(
        registry: &DeviceRegistry<Cpld>,
        cpld: BusAddress,
        interval: Duration,
        policy: RefreshPolicy,
        log: &Logger,
    ) -> Result<Self, Error> {
        let cpld = registry.find(cpld)?;
        Ok(Self::new(cpld, interval, policy, log))
    }

    pub fn new(cpld: Arc<Cpld>, interval: Duration, policy: RefreshPolicy, log: &Logger) -> Self {
        let log = log.new(slog::o!("device" => "leds"));
        let snapshot = CachedSnapshot::new(LED_REGISTERS, interval, policy, &log);
        Self { cpld, snapshot, log }
    }

    /// Return the mode of one LED.
    pub fn get(&self, kind: LedKind) -> Result<LedMode, Error> {
        let field = led::field(kind);
        let snapshot = self.snapshot.refresh(|reg| self.cpld.read(reg))?;
        Ok(led::decode(kind, snapshot.get(field.register)))
    }

    /// Return the mode of every LED, in board order.
    pub fn get_all(&self) -> Result<Vec<(LedKind, LedMode)>, Error> {
        let snapshot = self.snapshot.refresh(|reg| self.cpld.read(reg))?;
        Ok(LedKind::ALL
            .into_iter()
            .map(|kind| (kind, led::decode(kind, snapshot.get(led::field(kind).register))))
            .collect())
    }

    /// Show `mode` on one LED, leaving the others sharing its register as
    /// they are.
    pub fn set(&self, kind: LedKind, mode: LedMode) -> Result<(), Error> {
        if !led::supports(kind, mode) {
            return Err(Error::Decode(switch_platform_decode::Error::InvalidMode {
                kind,
                mode,
            }));
        }
        let field = led::field(kind);
        let value = self.snapshot.write(|| {
            self.cpld
                .modify(field.register, |raw| Ok(led::encode(kind, mode, raw)?))
        })?;
        debug!(
            self.log,
            "set LED";
            "led" => %kind,
            "mode" => %mode,
            "register" => field.register,
            "value" => value,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Leds;
    use crate::bus::BusClient;
    use crate::cache::RefreshPolicy;
    use crate::config::RetryPolicy;
    use crate::cpld::Cpld;
    use crate::registry::DeviceRegistry;
    use crate::sim::SimulatedBus;
    use crate::BusAddress;
    use crate::Error;
    use std::sync::Arc;
    use std::time::Duration;
    use switch_platform_types::LedKind;
    use switch_platform_types::LedMode;

    fn setup() -> (Arc<SimulatedBus>, BusAddress, Leds) {
        let log = slog::Logger::root(slog::Discard, slog::o!());
        let address = BusAddress::new(0, 0x60).unwrap();
        let bus = Arc::new(SimulatedBus::new());
        bus.set_byte(address, 0x0A, 0x1C);
        bus.set_byte(address, 0x0B, 0x0F);
        let client = BusClient::new(bus.clone(), address, RetryPolicy::once(), &log);
        let registry = DeviceRegistry::new(&log);
        registry
            .register(address, Arc::new(Cpld::new(client)))
            .unwrap();
        let leds = Leds::attach(
            &registry,
            address,
            Duration::from_secs(60),
            RefreshPolicy::Strict,
            &log,
        )
        .unwrap();
        (bus, address, leds)
    }

    #[test]
    fn test_attach_requires_cpld() {
        let log = slog::Logger::root(slog::Discard, slog::o!());
        let registry = DeviceRegistry::new(&log);
        let res = Leds::attach(
            &registry,
            BusAddress::new(0, 0x60).unwrap(),
            Duration::ZERO,
            RefreshPolicy::Strict,
            &log,
        );
        assert!(matches!(res, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_get_reads_snapshot_once() {
        let (bus, address, leds) = setup();
        assert_eq!(leds.get(LedKind::Loc).unwrap(), LedMode::Off);
        assert_eq!(leds.get(LedKind::Diag).unwrap(), LedMode::Off);
        assert_eq!(leds.get(LedKind::Psu2).unwrap(), LedMode::Off);
        assert_eq!(bus.read_count_at(address, 0x0A), 1);
        assert_eq!(bus.read_count(), 4);
    }

    #[test]
    fn test_set_then_get() {
        let (bus, address, leds) = setup();
        leds.set(LedKind::Diag, LedMode::GreenBlink).unwrap();
        assert_eq!(bus.byte(address, 0x0A), Some(0x58));
        assert_eq!(leds.get(LedKind::Diag).unwrap(), LedMode::GreenBlink);
        // The neighbouring LOC field is untouched.
        assert_eq!(leds.get(LedKind::Loc).unwrap(), LedMode::Off);

        leds.set(LedKind::Psu1, LedMode::Green).unwrap();
        assert_eq!(bus.byte(address, 0x0B), Some(0x0E));
        assert_eq!(leds.get(LedKind::Psu1).unwrap(), LedMode::Green);
        assert_eq!(leds.get(LedKind::Psu2).unwrap(), LedMode::Off);
    }

    #[test]
    fn test_set_unsupported_mode_writes_nothing() {
        let (bus, _address, leds) = setup();
        assert!(leds.set(LedKind::Fan1, LedMode::Amber).is_err());
        assert!(bus.writes().is_empty());
    }

    #[test]
    fn test_get_all() {
        let (bus, address, leds) = setup();
        bus.set_byte(address, 0x0E, 0x84);
        let all = leds.get_all().unwrap();
        assert_eq!(all.len(), LedKind::ALL.len());
        assert!(all.contains(&(LedKind::Fan2, LedMode::Red)));
        assert!(all.contains(&(LedKind::Fan4, LedMode::Green)));
    }
}
