// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Fan-tray register fields: duty cycle, speed, direction and presence.

use crate::bitfield_enum;
use crate::utils::extract_bit;
use crate::Error;

/// The mask of the 4-bit PWM field in the duty-cycle register.
pub const DUTY_CYCLE_MASK: u8 = 0x0F;

/// The largest duty cycle, in percent.
pub const MAX_DUTY_CYCLE: u32 = 100;

/// The number of RPM represented by one count of a speed register.
pub const RPM_PER_COUNT: u32 = 100;

bitfield_enum! {
    name = FanDirection,
    description = "The direction of airflow through a fan module.",
    bits = 0:0,
    variants = {
        0b0, FrontToBack, "F2B",
        0b1, BackToFront, "B2F",
    },
}

/// Decode the duty-cycle register into a percentage.
///
/// Only the low nibble is meaningful. Zero is off and `0xF` is full speed;
/// every other step is 6% wide starting from 16%.
pub const fn duty_from_register(raw: u8) -> u32 {
    match raw & DUTY_CYCLE_MASK {
        0 => 0,
        DUTY_CYCLE_MASK => MAX_DUTY_CYCLE,
        x => (x as u32) * 6 + 10,
    }
}

/// Encode a duty-cycle percentage into the register's PWM field.
///
/// Values from 0 to 100 inclusive are accepted; anything larger is an
/// error.
pub const fn duty_to_register(duty: u32) -> Result<u8, Error> {
    if duty > MAX_DUTY_CYCLE {
        return Err(Error::InvalidDuty(duty));
    }
    let raw = if duty < 16 {
        0
    } else if duty >= MAX_DUTY_CYCLE {
        DUTY_CYCLE_MASK
    } else {
        ((duty - 10) / 6) as u8
    };
    Ok(raw)
}

/// Convert a tachometer register into RPM.
pub const fn rpm_from_register(raw: u8) -> u32 {
    raw as u32 * RPM_PER_COUNT
}

/// Return the airflow direction of fan `index` from the direction register.
pub fn direction(raw: u8, index: u8) -> Result<FanDirection, Error> {
    let bit = extract_bit(raw, index)?;
    FanDirection::try_from(u8::from(bit))
}

/// Return true if fan `index` is present. The presence register is
/// active-low.
pub const fn is_present(raw: u8, index: u8) -> Result<bool, Error> {
    match extract_bit(raw, index) {
        Ok(bit) => Ok(!bit),
        Err(e) => Err(e),
    }
}

/// A fan module is faulted if either of its rotors has stopped.
pub const fn is_fault(front_raw: u8, rear_raw: u8) -> bool {
    rpm_from_register(front_raw) == 0 || rpm_from_register(rear_raw) == 0
}
