// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! The front-panel LED table.
//!
//! Each LED occupies a field of one of four CPLD registers. A mode is shown by
//! writing that mode's bit pattern into the field. The DIAG LED is the one
//! exception: it blinks when bit 6 is set, which lies outside its field, so
//! that bit takes priority when decoding and must be managed when encoding.

use crate::Error;
use switch_platform_types::LedKind;
use switch_platform_types::LedMode;

/// The CPLD registers which hold LED fields, in refresh order.
pub const LED_REGISTERS: [u8; 4] = [0x0A, 0x0B, 0x0E, 0x0F];

/// The DIAG LED's blink bit.
pub const DIAG_BLINK_BIT: u8 = 0x40;

// Setting DIAG to blink writes this pattern after clearing `DIAG_BLINK_CLEAR`.
const DIAG_BLINK_PATTERN: u8 = 0x48;
const DIAG_BLINK_CLEAR: u8 = 0x4C;

static_assertions::const_assert_eq!(DIAG_BLINK_PATTERN & DIAG_BLINK_BIT, DIAG_BLINK_BIT);
static_assertions::const_assert_eq!(DIAG_BLINK_CLEAR & DIAG_BLINK_PATTERN, DIAG_BLINK_PATTERN);

/// The location of an LED's field within the CPLD.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LedField {
    /// The CPLD register holding the field.
    pub register: u8,
    /// The bits of the register occupied by the field.
    pub mask: u8,
}

/// Return the register and mask holding the field for an LED.
pub const fn field(kind: LedKind) -> LedField {
    let (register, mask) = match kind {
        LedKind::Loc => (0x0A, 0x30),
        LedKind::Diag => (0x0A, 0x0C),
        LedKind::Fan => (0x0A, 0x03),
        LedKind::Psu1 => (0x0B, 0x03),
        LedKind::Psu2 => (0x0B, 0x0C),
        LedKind::Fan2 => (0x0E, 0xC0),
        LedKind::Fan3 => (0x0E, 0x30),
        LedKind::Fan4 => (0x0E, 0x0C),
        LedKind::Fan5 => (0x0E, 0x03),
        LedKind::Fan1 => (0x0F, 0x03),
    };
    LedField { register, mask }
}

/// Return the bit pattern an LED shows a mode with, or `None` if the LED
/// does not support that mode.
///
/// The DIAG blink pattern is returned including its out-of-field blink bit.
pub const fn pattern(kind: LedKind, mode: LedMode) -> Option<u8> {
    use LedKind::*;
    use LedMode::*;
    match (kind, mode) {
        (Loc, Amber) => Some(0x00),
        (Loc, Off) => Some(0x10),
        (Loc, AmberBlink) => Some(0x20),

        (Diag, Green) => Some(0x08),
        (Diag, Amber) => Some(0x04),
        (Diag, Off) => Some(0x0C),
        (Diag, GreenBlink) => Some(DIAG_BLINK_PATTERN),

        (Fan | Psu1, Green) => Some(0x02),
        (Fan | Psu1, Amber) => Some(0x01),
        (Fan | Psu1, Off) => Some(0x03),
        (Fan | Psu1, Auto) => Some(0x00),

        (Psu2, Green) => Some(0x08),
        (Psu2, Amber) => Some(0x04),
        (Psu2, Off) => Some(0x0C),
        (Psu2, Auto) => Some(0x00),

        (Fan1 | Fan5, Green) => Some(0x01),
        (Fan1 | Fan5, Red) => Some(0x02),
        (Fan2, Green) => Some(0x40),
        (Fan2, Red) => Some(0x80),
        (Fan3, Green) => Some(0x10),
        (Fan3, Red) => Some(0x20),
        (Fan4, Green) => Some(0x04),
        (Fan4, Red) => Some(0x08),
        (Fan1 | Fan2 | Fan3 | Fan4 | Fan5, Off) => Some(0x00),

        _ => None,
    }
}

/// Return true if `kind` can display `mode`.
pub const fn supports(kind: LedKind, mode: LedMode) -> bool {
    pattern(kind, mode).is_some()
}

/// Decode the mode of an LED from the value of its register.
///
/// If the field holds no known pattern, the LED is reported as `Off`.
pub fn decode(kind: LedKind, raw: u8) -> LedMode {
    if kind == LedKind::Diag && raw & DIAG_BLINK_BIT != 0 {
        return LedMode::GreenBlink;
    }
    let LedField { mask, .. } = field(kind);
    LedMode::ALL
        .into_iter()
        .find(|mode| {
            !(kind == LedKind::Diag && mode.is_blink())
                && pattern(kind, *mode) == Some(raw & mask)
        })
        .unwrap_or(LedMode::Off)
}

/// Encode `mode` for an LED into the current register value `raw`, leaving
/// bits outside the LED's field untouched.
pub fn encode(kind: LedKind, mode: LedMode, raw: u8) -> Result<u8, Error> {
    let Some(bits) = pattern(kind, mode) else {
        return Err(Error::InvalidMode { kind, mode });
    };
    let LedField { mask, .. } = field(kind);
    if kind == LedKind::Diag {
        if mode == LedMode::GreenBlink {
            return Ok(DIAG_BLINK_PATTERN | (raw & !DIAG_BLINK_CLEAR));
        }
        let cleared = raw & !DIAG_BLINK_BIT;
        return Ok(bits | (cleared & !mask));
    }
    Ok(bits | (raw & !mask))
}
