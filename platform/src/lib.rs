// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! A host-side interface to the board devices of Accton/Edgecore switches.
//!
//! Every device here is reached through a register bus: the CPLDs carrying
//! the LED, transceiver presence and reset registers, the I2C channel
//! multiplexers, transceiver EEPROMs, the PMBus power supplies and the fan
//! tray. Devices which are only visible to the board's BMC are read over its
//! serial console instead.
//!
//! Reads of device telemetry go through a [`cache::CachedSnapshot`], which
//! refreshes a fixed set of registers at most once per interval. Sibling
//! drivers find the shared CPLD through a [`registry::DeviceRegistry`].

pub mod bmc;
pub mod bus;
pub mod cache;
pub mod config;
pub mod cpld;
pub mod eeprom;
pub mod fan;
#[cfg(target_os = "linux")]
pub mod i2cdev;
pub mod led;
pub mod mux;
pub mod platform;
pub mod psu;
pub mod registry;
pub mod results;
pub mod serial;
pub mod sfp;
pub mod sim;
pub mod thermal;

pub use config::Config;
pub use config::ConfigBuilder;
pub use platform::Platform;
pub use serial::SessionError;
pub use switch_platform_decode::Error as DecodeError;
pub use switch_platform_types::BusAddress;
pub use switch_platform_types::Error as TypesError;
pub use switch_platform_types::InvalidPort;
pub use switch_platform_types::LedKind;
pub use switch_platform_types::LedMode;
pub use switch_platform_types::PortMask;
use thiserror::Error;

#[usdt::provider(provider = "switch_platform")]
mod probes {
    fn bus__read(bus: u16, address: u8, register: u8, attempt: u32) {}
    fn bus__write(bus: u16, address: u8, register: u8, attempt: u32) {}
    fn bus__error(bus: u16, address: u8, register: u8, reason: &str) {}
    fn bmc__login(attempt: u32, max_attempts: u32) {}
    fn bmc__transaction__start(command: &str, attempt: u32) {}
    fn bmc__transaction__done(command: &str, n_bytes: u64) {}
}

/// A failed transaction on a register bus.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum BusError {
    #[error("Device did not acknowledge")]
    Nack,

    #[error("Bus I/O error: {0}")]
    Io(nix::errno::Errno),

    #[error("Short transfer: expected {expected} bytes, transferred {actual}")]
    ShortTransfer { expected: usize, actual: usize },
}

/// An error accessing a switch platform device.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Bus error accessing register 0x{register:02x} of {address}")]
    Bus {
        address: BusAddress,
        register: u8,
        #[source]
        source: BusError,
    },

    #[error("No device registered at {0}")]
    NotFound(BusAddress),

    #[error("A device is already registered at {0}")]
    AddressInUse(BusAddress),

    #[error("BMC session failed")]
    Session(#[from] SessionError),

    #[error("Error decoding register data")]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Types(#[from] TypesError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("No module present in port {0}")]
    NotPresent(u8),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl From<InvalidPort> for Error {
    fn from(p: InvalidPort) -> Self {
        Error::Types(TypesError::from(p))
    }
}

/// The reason an operation on a single transceiver port failed.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum PortError {
    #[error("No module present")]
    NotPresent,

    #[error("Bus error: {0}")]
    Bus(BusError),

    #[error("{0}")]
    Failed(String),
}

impl From<Error> for PortError {
    fn from(e: Error) -> Self {
        match e {
            Error::NotPresent(_) => PortError::NotPresent,
            Error::Bus { source, .. } => PortError::Bus(source),
            other => PortError::Failed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::BusError;
    use super::Error;
    use super::PortError;
    use crate::BusAddress;
    use crate::InvalidPort;

    #[test]
    fn test_port_error_from_error() {
        let address = BusAddress::new(1, 0x50).unwrap();
        let e = Error::Bus {
            address,
            register: 0,
            source: BusError::Nack,
        };
        assert_eq!(PortError::from(e), PortError::Bus(BusError::Nack));
        assert_eq!(PortError::from(Error::NotPresent(3)), PortError::NotPresent);
        assert!(matches!(
            PortError::from(Error::from(InvalidPort(40))),
            PortError::Failed(_)
        ));
    }

    #[test]
    fn test_bus_error_display() {
        let address = BusAddress::new(7, 0x59).unwrap();
        let e = Error::Bus {
            address,
            register: 0x88,
            source: BusError::Nack,
        };
        assert_eq!(
            e.to_string(),
            "Bus error accessing register 0x88 of 7-0059"
        );
    }
}
