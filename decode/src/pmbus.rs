// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! PMBus numeric formats used by the power supplies.

use crate::utils::twos_complement;
use crate::Error;

/// Scale a value into milli-units (mV, mA, m°C).
pub const MILLI: i64 = 1_000;

/// Scale a power value into micro-watts.
pub const MICRO: i64 = 1_000_000;

/// Leave a value unscaled (percent, RPM).
pub const RAW: i64 = 1;

const EXPONENT_BITS: u8 = 5;
const MANTISSA_BITS: u8 = 11;
const MANTISSA_MASK: u16 = 0x07FF;

/// The mask of the exponent field in `VOUT_MODE`.
pub const VOUT_MODE_EXPONENT_MASK: u8 = 0x1F;

/// The smallest and largest LINEAR11 exponents.
pub const EXPONENT_RANGE: core::ops::RangeInclusive<i8> = -16..=15;

/// The smallest and largest LINEAR11 mantissas.
pub const MANTISSA_RANGE: core::ops::RangeInclusive<i16> = -1024..=1023;

fn shift(value: i64, exponent: i32) -> i64 {
    if exponent >= 0 {
        value << exponent
    } else {
        // Arithmetic shift, truncating toward negative infinity.
        value >> -exponent
    }
}

/// Split a LINEAR11 word into its exponent and mantissa.
pub fn linear11_parts(raw: u16) -> (i32, i32) {
    // Neither field width can be rejected.
    let exponent = twos_complement(raw >> MANTISSA_BITS, EXPONENT_BITS).unwrap_or_default();
    let mantissa = twos_complement(raw & MANTISSA_MASK, MANTISSA_BITS).unwrap_or_default();
    (exponent, mantissa)
}

/// Decode a LINEAR11 word, multiplying the mantissa by `scale` before the
/// exponent is applied.
pub fn linear11(raw: u16, scale: i64) -> i64 {
    let (exponent, mantissa) = linear11_parts(raw);
    shift(i64::from(mantissa) * scale, exponent)
}

/// Encode an exponent and mantissa as a LINEAR11 word.
pub fn encode_linear11(exponent: i8, mantissa: i16) -> Result<u16, Error> {
    if !EXPONENT_RANGE.contains(&exponent) || !MANTISSA_RANGE.contains(&mantissa) {
        return Err(Error::InvalidLinear { exponent, mantissa });
    }
    let e = (exponent as u16) & 0x1F;
    let m = (mantissa as u16) & MANTISSA_MASK;
    Ok((e << MANTISSA_BITS) | m)
}

/// Decode an output voltage in the LINEAR16 format.
///
/// The exponent comes from the low five bits of the `VOUT_MODE` register,
/// and `raw` is an unsigned mantissa.
pub fn linear16(vout_mode: u8, raw: u16, scale: i64) -> i64 {
    let exponent = twos_complement(u16::from(vout_mode & VOUT_MODE_EXPONENT_MASK), EXPONENT_BITS)
        .unwrap_or_default();
    shift(i64::from(raw) * scale, exponent)
}
