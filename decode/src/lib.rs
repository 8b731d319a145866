// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Decode and encode the packed registers of switch platform devices.
//!
//! Everything in this crate is a pure function of register contents: the
//! front-panel LED table, the CPLD presence and reset bitmaps, PMBus LINEAR11
//! telemetry, the fan-tray duty-cycle field, the SFF-8024 identifiers found in
//! transceiver EEPROMs, and the numbers printed by the BMC console.

pub mod bitmap;
pub mod fan;
pub mod ident;
pub mod led;
pub mod pmbus;
pub mod text;
pub mod utils;

pub use bitmap::Polarity;
pub use fan::FanDirection;
pub use ident::Identifier;
pub use ident::PortType;
pub use ident::Vendor;
use switch_platform_types::InvalidPort;
use switch_platform_types::LedKind;
use switch_platform_types::LedMode;
use thiserror::Error;

/// An error decoding or encoding register data.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum Error {
    #[error("Bit index out of range")]
    BitOutOfRange,

    #[error("Invalid bit field value")]
    InvalidBitField,

    #[error("Two's complement field width must be 1-16 bits, found {0}")]
    InvalidFieldWidth(u8),

    #[error("LED '{kind}' does not support mode '{mode}'")]
    InvalidMode { kind: LedKind, mode: LedMode },

    #[error("Invalid fan duty cycle: {0}%")]
    InvalidDuty(u32),

    #[error("LINEAR11 exponent {exponent} or mantissa {mantissa} out of range")]
    InvalidLinear { exponent: i8, mantissa: i16 },

    #[error("Malformed response: expected {expected} values, found {found}")]
    MalformedResponse { expected: usize, found: usize },

    #[error("Memory map parsing failed")]
    ParseFailed,

    #[error(transparent)]
    InvalidPort(#[from] InvalidPort),
}
