// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! A register bus over the Linux `i2c-dev` interface.
//!
//! Each adapter appears as `/dev/i2c-N`. A transaction selects the target
//! address with the `I2C_SLAVE` ioctl and then issues one SMBus transfer with
//! `I2C_SMBUS`.

use crate::bus::RegisterBus;
use crate::bus::BLOCK_MAX;
use crate::BusAddress;
use crate::BusError;
use nix::errno::Errno;
use nix::libc;
use std::collections::BTreeMap;
use std::fs::File;
use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::PoisonError;

const I2C_SLAVE: libc::c_ulong = 0x0703;
const I2C_SMBUS: libc::c_ulong = 0x0720;

const I2C_SMBUS_WRITE: u8 = 0;
const I2C_SMBUS_READ: u8 = 1;

const I2C_SMBUS_BYTE_DATA: u32 = 2;
const I2C_SMBUS_WORD_DATA: u32 = 3;
const I2C_SMBUS_I2C_BLOCK_DATA: u32 = 8;

// One length byte, 32 data bytes, and one for a PEC.
const I2C_SMBUS_BLOCK_SIZE: usize = BLOCK_MAX + 2;

nix::ioctl_write_int_bad!(i2c_set_slave, I2C_SLAVE);
nix::ioctl_write_ptr_bad!(i2c_smbus, I2C_SMBUS, SmbusIoctlData);

#[repr(C)]
union SmbusData {
    byte: u8,
    word: u16,
    block: [u8; I2C_SMBUS_BLOCK_SIZE],
}

#[repr(C)]
struct SmbusIoctlData {
    read_write: u8,
    command: u8,
    size: u32,
    data: *mut SmbusData,
}

fn bus_error(errno: Errno) -> BusError {
    match errno {
        Errno::ENXIO | Errno::EREMOTEIO => BusError::Nack,
        other => BusError::Io(other),
    }
}

/// The I2C adapters of a Linux host.
#[derive(Debug)]
pub struct I2cDevBus {
    dev_dir: PathBuf,
    // Open adapters, by bus number. The lock is held across the address
    // selection and the transfer.
    adapters: Mutex<BTreeMap<u16, File>>,
}

impl Default for I2cDevBus {
    fn default() -> Self {
        Self::new()
    }
}

impl I2cDevBus {
    pub fn new() -> Self {
        Self::with_dev_dir("/dev")
    }

    /// Look for adapter device nodes in `dev_dir` rather than `/dev`.
    pub fn with_dev_dir(dev_dir: impl Into<PathBuf>) -> Self {
        Self {
            dev_dir: dev_dir.into(),
            adapters: Mutex::new(BTreeMap::new()),
        }
    }

    fn transfer(
        &self,
        device: BusAddress,
        read_write: u8,
        command: u8,
        size: u32,
        data: &mut SmbusData,
    ) -> Result<(), BusError> {
        let mut adapters = self.adapters.lock().unwrap_or_else(PoisonError::into_inner);
        let file = match adapters.entry(device.bus()) {
            std::collections::btree_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::btree_map::Entry::Vacant(e) => {
                let path = self.dev_dir.join(format!("i2c-{}", device.bus()));
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(path)
                    .map_err(|e| {
                        BusError::Io(Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)))
                    })?;
                e.insert(file)
            }
        };
        let fd = file.as_raw_fd();
        let args = SmbusIoctlData {
            read_write,
            command,
            size,
            data: data as *mut SmbusData,
        };
        // Safety: `fd` is an open adapter, and `args` points at a buffer
        // large enough for any SMBus transfer, which outlives both calls.
        unsafe {
            i2c_set_slave(fd, libc::c_int::from(device.address())).map_err(bus_error)?;
            i2c_smbus(fd, &args).map_err(bus_error)?;
        }
        Ok(())
    }
}

impl RegisterBus for I2cDevBus {
    fn read_byte(&self, device: BusAddress, register: u8) -> Result<u8, BusError> {
        let mut data = SmbusData { byte: 0 };
        self.transfer(device, I2C_SMBUS_READ, register, I2C_SMBUS_BYTE_DATA, &mut data)?;
        // Safety: every bit pattern is a valid `u8`.
        Ok(unsafe { data.byte })
    }

    fn write_byte(&self, device: BusAddress, register: u8, value: u8) -> Result<(), BusError> {
        let mut data = SmbusData { byte: value };
        self.transfer(device, I2C_SMBUS_WRITE, register, I2C_SMBUS_BYTE_DATA, &mut data)
    }

    fn read_word(&self, device: BusAddress, register: u8) -> Result<u16, BusError> {
        let mut data = SmbusData { word: 0 };
        self.transfer(device, I2C_SMBUS_READ, register, I2C_SMBUS_WORD_DATA, &mut data)?;
        // Safety: every bit pattern is a valid `u16`.
        Ok(unsafe { data.word })
    }

    fn write_word(&self, device: BusAddress, register: u8, value: u16) -> Result<(), BusError> {
        let mut data = SmbusData { word: value };
        self.transfer(device, I2C_SMBUS_WRITE, register, I2C_SMBUS_WORD_DATA, &mut data)
    }

    fn read_block(
        &self,
        device: BusAddress,
        register: u8,
        buf: &mut [u8],
    ) -> Result<usize, BusError> {
        let want = buf.len().min(BLOCK_MAX);
        let mut block = [0u8; I2C_SMBUS_BLOCK_SIZE];
        // The length to read goes in the first byte.
        block[0] = want as u8;
        let mut data = SmbusData { block };
        self.transfer(
            device,
            I2C_SMBUS_READ,
            register,
            I2C_SMBUS_I2C_BLOCK_DATA,
            &mut data,
        )?;
        // Safety: every bit pattern is a valid byte array.
        let block = unsafe { data.block };
        let n = usize::from(block[0]).min(want);
        buf[..n].copy_from_slice(&block[1..=n]);
        Ok(n)
    }

    fn write_block(&self, device: BusAddress, register: u8, data: &[u8]) -> Result<(), BusError> {
        if data.len() > BLOCK_MAX {
            return Err(BusError::ShortTransfer {
                expected: data.len(),
                actual: BLOCK_MAX,
            });
        }
        let mut block = [0u8; I2C_SMBUS_BLOCK_SIZE];
        block[0] = data.len() as u8;
        block[1..=data.len()].copy_from_slice(data);
        let mut data = SmbusData { block };
        self.transfer(
            device,
            I2C_SMBUS_WRITE,
            register,
            I2C_SMBUS_I2C_BLOCK_DATA,
            &mut data,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::bus_error;
    use super::I2cDevBus;
    use crate::bus::RegisterBus;
    use crate::BusAddress;
    use crate::BusError;
    use nix::errno::Errno;

    #[test]
    fn test_missing_adapter() {
        let dir = tempfile::tempdir().unwrap();
        let bus = I2cDevBus::with_dev_dir(dir.path());
        let device = BusAddress::new(3, 0x50).unwrap();
        assert_eq!(
            bus.read_byte(device, 0),
            Err(BusError::Io(Errno::ENOENT))
        );
    }

    #[test]
    fn test_oversized_block_write() {
        let bus = I2cDevBus::new();
        let device = BusAddress::new(3, 0x50).unwrap();
        assert!(matches!(
            bus.write_block(device, 0, &[0; 33]),
            Err(BusError::ShortTransfer { .. })
        ));
    }

    #[test]
    fn test_nack_errnos() {
        assert_eq!(bus_error(Errno::ENXIO), BusError::Nack);
        assert_eq!(bus_error(Errno::EREMOTEIO), BusError::Nack);
        assert_eq!(bus_error(Errno::EBUSY), BusError::Io(Errno::EBUSY));
    }
}
