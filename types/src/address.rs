// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Addresses of devices on the board's I2C buses.

use crate::Error;
use serde::Deserialize;
use serde::Serialize;

/// The address of the main board CPLD, which carries the LED, presence and
/// reset registers.
pub const CPLD_ADDRESS: u8 = 0x60;

/// The two-wire address of a transceiver's serial ID EEPROM ("A0").
pub const SFP_EEPROM_ADDRESS: u8 = 0x50;

/// The two-wire address of an SFP's diagnostic monitoring page ("A2").
pub const SFP_DDM_ADDRESS: u8 = 0x51;

/// A device on an I2C bus: the bus number and the device's 7-bit address.
///
/// This is displayed the way the kernel names I2C clients, e.g., `7-0059`.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[cfg_attr(feature = "api-traits", derive(schemars::JsonSchema))]
pub struct BusAddress {
    bus: u16,
    address: u8,
}

impl BusAddress {
    /// The largest valid 7-bit address.
    pub const MAX_ADDRESS: u8 = 0x7F;

    /// Construct a new bus address, failing if `address` needs more than 7
    /// bits.
    pub const fn new(bus: u16, address: u8) -> Result<Self, Error> {
        if address > Self::MAX_ADDRESS {
            Err(Error::InvalidAddress(address))
        } else {
            Ok(Self { bus, address })
        }
    }

    pub const fn bus(&self) -> u16 {
        self.bus
    }

    pub const fn address(&self) -> u8 {
        self.address
    }

    /// Return the address of another device on the same bus.
    pub const fn sibling(&self, address: u8) -> Result<Self, Error> {
        Self::new(self.bus, address)
    }
}

impl core::fmt::Display for BusAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{}-{:04x}", self.bus, self.address)
    }
}

impl core::str::FromStr for BusAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bus, address) = s
            .split_once('-')
            .ok_or_else(|| format!("expected <bus>-<address>, found '{s}'"))?;
        let bus = bus
            .parse::<u16>()
            .map_err(|e| format!("invalid bus number '{bus}': {e}"))?;
        let address = address.trim_start_matches("0x");
        let address = u8::from_str_radix(address, 16)
            .map_err(|e| format!("invalid device address '{address}': {e}"))?;
        Self::new(bus, address).map_err(|e| e.to_string())
    }
}
