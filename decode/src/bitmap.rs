// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Per-port bitmaps spread over consecutive CPLD registers.
//!
//! The port CPLD reports one bit per transceiver port, eight ports per
//! register. Register `base + n` holds ports `8n` through `8n + 7`, with the
//! lowest port in bit 0.

use crate::utils::extract_bit;
use crate::utils::with_bit;
use crate::Error;
use switch_platform_types::InvalidPort;
use switch_platform_types::PortMask;
use switch_platform_types::NUM_PORTS;

/// The number of registers making up one 32-port bitmap.
pub const BITMAP_REGISTERS: usize = 4;

static_assertions::const_assert_eq!(BITMAP_REGISTERS * 8, NUM_PORTS as usize);

/// The level at which a bitmap field is asserted.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(
    any(feature = "api-traits", test),
    derive(serde::Deserialize, serde::Serialize)
)]
#[cfg_attr(any(feature = "api-traits", test), serde(rename_all = "snake_case"))]
pub enum Polarity {
    /// A set bit means the condition holds.
    #[default]
    ActiveHigh,
    /// A clear bit means the condition holds.
    ActiveLow,
}

impl Polarity {
    /// Return whether a condition holds given the raw bit value.
    pub const fn is_asserted(&self, bit: bool) -> bool {
        match self {
            Polarity::ActiveHigh => bit,
            Polarity::ActiveLow => !bit,
        }
    }

    /// Return the raw bit value which expresses `asserted`.
    pub const fn to_bit(&self, asserted: bool) -> bool {
        self.is_asserted(asserted)
    }
}

/// The register and bit carrying `port` in a bitmap starting at `base`.
pub const fn locate(base: u8, port: u8) -> Result<(u8, u8), Error> {
    if port >= NUM_PORTS {
        return Err(Error::InvalidPort(InvalidPort(port)));
    }
    Ok((base.wrapping_add(port / 8), port % 8))
}

/// Decode a bitmap from its registers, returning the ports for which the
/// field is asserted.
pub fn decode(regs: [u8; BITMAP_REGISTERS], polarity: Polarity) -> PortMask {
    let raw = u32::from_le_bytes(regs);
    match polarity {
        Polarity::ActiveHigh => PortMask(raw),
        Polarity::ActiveLow => PortMask(!raw),
    }
}

/// Return whether a single port's field is asserted, given the register that
/// holds it.
pub fn is_asserted(reg: u8, port: u8, polarity: Polarity) -> Result<bool, Error> {
    let bit = extract_bit(reg, port % 8)?;
    Ok(polarity.is_asserted(bit))
}

/// Return `reg` updated so that `port`'s field reads as `asserted`, leaving
/// the other seven ports untouched.
pub fn encode(reg: u8, port: u8, asserted: bool, polarity: Polarity) -> Result<u8, Error> {
    with_bit(reg, port % 8, polarity.to_bit(asserted))
}
