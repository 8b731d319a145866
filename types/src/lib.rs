// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Types shared by the switch platform drivers, for addressing bus devices,
//! transceiver ports, EEPROM regions and front-panel LEDs.

pub mod address;
pub mod led;
pub mod memory;
pub mod port;

pub use address::BusAddress;
pub use led::LedKind;
pub use led::InvalidBrightness;
pub use led::LedMode;
pub use memory::MemoryRead;
pub use memory::MemoryWrite;
pub use memory::EEPROM_SIZE;
pub use port::InvalidPort;
pub use port::PortMask;
pub use port::PortStatus;
use serde::Deserialize;
use serde::Serialize;

/// The number of transceiver ports addressed by a single port CPLD.
pub const NUM_PORTS: u8 = 32;

/// An error constructing one of the shared addressing types.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, thiserror::Error)]
pub enum Error {
    /// An attempt to reference an invalid transceiver port.
    #[error("Invalid transceiver port: {0}")]
    InvalidPort(u8),

    /// An I2C address that does not fit in 7 bits.
    #[error("Invalid 7-bit bus address: 0x{0:02x}")]
    InvalidAddress(u8),

    /// An access to memory outside of the 256-byte EEPROM map.
    #[error("Invalid memory access: offset {offset}, length {len}")]
    InvalidMemoryAccess { offset: u8, len: u16 },
}

impl From<InvalidPort> for Error {
    fn from(p: InvalidPort) -> Self {
        Error::InvalidPort(p.0)
    }
}
