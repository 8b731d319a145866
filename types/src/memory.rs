// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Descriptions of accesses to a transceiver's EEPROM.
//!
//! SFP and QSFP modules expose a flat 256-byte memory map at each of their
//! two-wire addresses. Both access types here validate that the region they
//! describe lies entirely within that map, so that drivers never issue a bus
//! transaction which would wrap around the end of the device.

use crate::Error;
use serde::Deserialize;
use serde::Serialize;

/// The size of one transceiver memory map, in bytes.
pub const EEPROM_SIZE: u16 = 256;

fn validate(offset: u8, len: u16) -> Result<(), Error> {
    if u16::from(offset) + len > EEPROM_SIZE {
        return Err(Error::InvalidMemoryAccess { offset, len });
    }
    Ok(())
}

/// A read of a region of a transceiver's memory map.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[cfg_attr(feature = "api-traits", derive(schemars::JsonSchema))]
pub struct MemoryRead {
    offset: u8,
    len: u16,
}

impl MemoryRead {
    /// Construct a new read of `len` bytes starting at `offset`.
    pub fn new(offset: u8, len: u16) -> Result<Self, Error> {
        validate(offset, len)?;
        Ok(Self { offset, len })
    }

    /// A read of the entire memory map.
    pub const fn whole_map() -> Self {
        Self {
            offset: 0,
            len: EEPROM_SIZE,
        }
    }

    pub fn offset(&self) -> u8 {
        self.offset
    }

    pub fn len(&self) -> u16 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A write to a region of a transceiver's memory map.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[cfg_attr(feature = "api-traits", derive(schemars::JsonSchema))]
pub struct MemoryWrite {
    offset: u8,
    len: u16,
}

impl MemoryWrite {
    /// Construct a new write of `len` bytes starting at `offset`.
    pub fn new(offset: u8, len: u16) -> Result<Self, Error> {
        validate(offset, len)?;
        Ok(Self { offset, len })
    }

    pub fn offset(&self) -> u8 {
        self.offset
    }

    pub fn len(&self) -> u16 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
