// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! The CPR-4011-4Mxx power supply, a PMBus device.
//!
//! Telemetry is reported in milli-units: millivolts, milliamps, milliwatts
//! and milli-degrees Celsius. Fan duty is a percentage and fan speed is in
//! RPM.

use crate::bus::BusClient;
use crate::cache::CachedSnapshot;
use crate::cache::RefreshPolicy;
use crate::cache::Snapshot;
use crate::registry::BusDevice;
use crate::BusAddress;
use crate::Error;
use slog::debug;
use std::time::Duration;
use switch_platform_decode::pmbus;
use switch_platform_decode::pmbus::MILLI;
use switch_platform_decode::pmbus::RAW;

/// The addresses a CPR-4011 may answer at.
pub const PSU_ADDRESSES: [u8; 4] = [0x3c, 0x3d, 0x3e, 0x3f];

pub const VOUT_MODE: u8 = 0x20;
pub const STATUS_FANS_1_2: u8 = 0x81;
pub const READ_VIN: u8 = 0x88;
pub const READ_IIN: u8 = 0x89;
pub const READ_VOUT: u8 = 0x8b;
pub const READ_IOUT: u8 = 0x8c;
pub const READ_TEMPERATURE_1: u8 = 0x8d;
pub const READ_TEMPERATURE_2: u8 = 0x8e;
pub const READ_FAN_SPEED_1: u8 = 0x90;
pub const READ_FAN_SPEED_2: u8 = 0x91;
pub const READ_POUT: u8 = 0x96;
pub const READ_PIN: u8 = 0x97;
pub const FAN_COMMAND_1: u8 = 0x3b;
pub const FAN_COMMAND_2: u8 = 0x3c;

/// Registers read a byte at a time.
pub const BYTE_REGISTERS: [u8; 2] = [VOUT_MODE, STATUS_FANS_1_2];

/// Registers read a word at a time.
pub const WORD_REGISTERS: [u8; 12] = [
    READ_VIN,
    READ_VOUT,
    READ_IIN,
    READ_IOUT,
    READ_POUT,
    READ_PIN,
    READ_TEMPERATURE_1,
    READ_TEMPERATURE_2,
    FAN_COMMAND_1,
    FAN_COMMAND_2,
    READ_FAN_SPEED_1,
    READ_FAN_SPEED_2,
];

/// One of the two fans of the supply.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PsuFan {
    Fan1,
    Fan2,
}

impl PsuFan {
    const fn fault_bit(&self) -> u8 {
        match self {
            PsuFan::Fan1 => 7,
            PsuFan::Fan2 => 6,
        }
    }

    const fn duty_register(&self) -> u8 {
        match self {
            PsuFan::Fan1 => FAN_COMMAND_1,
            PsuFan::Fan2 => FAN_COMMAND_2,
        }
    }

    const fn speed_register(&self) -> u8 {
        match self {
            PsuFan::Fan1 => READ_FAN_SPEED_1,
            PsuFan::Fan2 => READ_FAN_SPEED_2,
        }
    }
}

/// Decoded values from one snapshot of the supply.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize,
)]
#[cfg_attr(feature = "api-traits", derive(schemars::JsonSchema))]
pub struct PsuReading {
    pub vin: i64,
    pub vout: i64,
    pub iin: i64,
    pub iout: i64,
    pub pin: i64,
    pub pout: i64,
    pub temp1: i64,
    pub temp2: i64,
    pub fan1_duty: i64,
    pub fan1_speed: i64,
    pub fan1_fault: bool,
    pub fan2_fault: bool,
}

impl PsuReading {
    fn from_snapshot(snapshot: &Snapshot<u8, u16>) -> Self {
        let linear = |reg| pmbus::linear11(snapshot.get(reg), MILLI);
        // The byte registers are held in the low half of the word.
        let vout_mode = snapshot.get(VOUT_MODE) as u8;
        let fan_fault = snapshot.get(STATUS_FANS_1_2) as u8;
        Self {
            vin: linear(READ_VIN),
            vout: pmbus::linear16(vout_mode, snapshot.get(READ_VOUT), MILLI),
            iin: linear(READ_IIN),
            iout: linear(READ_IOUT),
            pin: linear(READ_PIN),
            pout: linear(READ_POUT),
            temp1: linear(READ_TEMPERATURE_1),
            temp2: linear(READ_TEMPERATURE_2),
            fan1_duty: pmbus::linear11(snapshot.get(FAN_COMMAND_1), RAW),
            fan1_speed: pmbus::linear11(snapshot.get(READ_FAN_SPEED_1), RAW),
            fan1_fault: fan_fault & (1 << PsuFan::Fan1.fault_bit()) != 0,
            fan2_fault: fan_fault & (1 << PsuFan::Fan2.fault_bit()) != 0,
        }
    }
}

/// A CPR-4011-4Mxx power supply.
///
/// Registers which fail to read keep their previous value, so a supply
/// which is briefly unreachable still reports its last telemetry.
#[derive(Debug)]
pub struct Psu {
    client: BusClient,
    snapshot: CachedSnapshot<u8, u16>,
}

impl BusDevice for Psu {
    fn address(&self) -> BusAddress {
        self.client.address()
    }
}

impl Psu {
    pub fn new(client: BusClient, interval: Duration) -> Result<Self, Error> {
        let address = client.address().address();
        if !PSU_ADDRESSES.contains(&address) {
            return Err(Error::InvalidArgument(format!(
                "CPR-4011 does not answer at 0x{address:02x}"
            )));
        }
        let keys = BYTE_REGISTERS.into_iter().chain(WORD_REGISTERS);
        let snapshot = CachedSnapshot::new(keys, interval, RefreshPolicy::Lenient, client.log());
        Ok(Self { client, snapshot })
    }

    fn refresh(&self) -> Result<Snapshot<u8, u16>, Error> {
        self.snapshot.refresh(|reg| {
            if BYTE_REGISTERS.contains(&reg) {
                self.client.read_byte(reg).map(u16::from)
            } else {
                self.client.read_word(reg)
            }
        })
    }

    /// Return every value from a fresh or cached snapshot.
    pub fn reading(&self) -> Result<PsuReading, Error> {
        Ok(PsuReading::from_snapshot(&self.refresh()?))
    }

    fn linear(&self, reg: u8) -> Result<i64, Error> {
        Ok(pmbus::linear11(self.refresh()?.get(reg), MILLI))
    }

    pub fn vin(&self) -> Result<i64, Error> {
        self.linear(READ_VIN)
    }

    pub fn vout(&self) -> Result<i64, Error> {
        let snapshot = self.refresh()?;
        Ok(pmbus::linear16(
            snapshot.get(VOUT_MODE) as u8,
            snapshot.get(READ_VOUT),
            MILLI,
        ))
    }

    pub fn iin(&self) -> Result<i64, Error> {
        self.linear(READ_IIN)
    }

    pub fn iout(&self) -> Result<i64, Error> {
        self.linear(READ_IOUT)
    }

    pub fn pin(&self) -> Result<i64, Error> {
        self.linear(READ_PIN)
    }

    pub fn pout(&self) -> Result<i64, Error> {
        self.linear(READ_POUT)
    }

    pub fn temp1(&self) -> Result<i64, Error> {
        self.linear(READ_TEMPERATURE_1)
    }

    pub fn temp2(&self) -> Result<i64, Error> {
        self.linear(READ_TEMPERATURE_2)
    }

    /// The commanded duty cycle of a fan, in percent.
    pub fn fan_duty(&self, fan: PsuFan) -> Result<i64, Error> {
        Ok(pmbus::linear11(self.refresh()?.get(fan.duty_register()), RAW))
    }

    /// The measured speed of a fan, in RPM.
    pub fn fan_speed(&self, fan: PsuFan) -> Result<i64, Error> {
        Ok(pmbus::linear11(self.refresh()?.get(fan.speed_register()), RAW))
    }

    pub fn fan_fault(&self, fan: PsuFan) -> Result<bool, Error> {
        let raw = self.refresh()?.get(STATUS_FANS_1_2);
        Ok(raw & (1 << fan.fault_bit()) != 0)
    }

    /// Command the duty cycle of a fan, in percent.
    pub fn set_fan_duty(&self, fan: PsuFan, duty: u8) -> Result<(), Error> {
        if duty > 100 {
            return Err(Error::Decode(switch_platform_decode::Error::InvalidDuty(
                u32::from(duty),
            )));
        }
        self.snapshot
            .write(|| self.client.write_word(fan.duty_register(), u16::from(duty)))?;
        debug!(self.client.log(), "set PSU fan duty"; "fan" => ?fan, "duty" => duty);
        Ok(())
    }
}
