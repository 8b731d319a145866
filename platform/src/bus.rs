// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Register access to devices on an SMBus, with bounded retries.

use crate::config::RetryPolicy;
use crate::probes;
use crate::BusAddress;
use crate::BusError;
use crate::Error;
use slog::debug;
use slog::warn;
use slog::Logger;
use std::sync::Arc;

/// The largest payload of a single SMBus block transaction.
pub const BLOCK_MAX: usize = 32;

/// The primitive SMBus transactions used by every driver.
///
/// Implementations perform exactly one attempt per call. Retries are the
/// business of [`BusClient`].
pub trait RegisterBus: Send + Sync {
    fn read_byte(&self, device: BusAddress, register: u8) -> Result<u8, BusError>;

    fn write_byte(&self, device: BusAddress, register: u8, value: u8) -> Result<(), BusError>;

    fn read_word(&self, device: BusAddress, register: u8) -> Result<u16, BusError>;

    fn write_word(&self, device: BusAddress, register: u8, value: u16) -> Result<(), BusError>;

    /// Read up to `buf.len()` bytes, at most [`BLOCK_MAX`], starting at
    /// `register`. Return the number of bytes read.
    fn read_block(
        &self,
        device: BusAddress,
        register: u8,
        buf: &mut [u8],
    ) -> Result<usize, BusError>;

    /// Write `data`, at most [`BLOCK_MAX`] bytes, starting at `register`.
    fn write_block(&self, device: BusAddress, register: u8, data: &[u8]) -> Result<(), BusError>;
}

/// Call `op` until it succeeds or `policy` is exhausted, sleeping between
/// attempts. `op` is passed the 1-based attempt number.
///
/// The error from the last attempt is returned.
pub fn with_retry<T, E>(
    policy: RetryPolicy,
    mut op: impl FnMut(u32) -> Result<T, E>,
) -> Result<T, E> {
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(t) => return Ok(t),
            Err(e) if attempt >= policy.max_attempts => return Err(e),
            Err(_) => {
                attempt += 1;
                if !policy.delay.is_zero() {
                    std::thread::sleep(policy.delay);
                }
            }
        }
    }
}

/// A handle to one device on a register bus.
///
/// Every access is retried according to the client's [`RetryPolicy`]. All
/// failures are treated alike: a NACK is retried just as an I/O error is.
#[derive(Clone)]
pub struct BusClient {
    bus: Arc<dyn RegisterBus>,
    address: BusAddress,
    retry: RetryPolicy,
    log: Logger,
}

impl core::fmt::Debug for BusClient {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("BusClient")
            .field("address", &self.address)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl BusClient {
    pub fn new(
        bus: Arc<dyn RegisterBus>,
        address: BusAddress,
        retry: RetryPolicy,
        log: &Logger,
    ) -> Self {
        let log = log.new(slog::o!("address" => address.to_string()));
        Self {
            bus,
            address,
            retry,
            log,
        }
    }

    pub fn address(&self) -> BusAddress {
        self.address
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// Return the underlying bus, for building clients of sibling devices.
    pub fn bus(&self) -> &Arc<dyn RegisterBus> {
        &self.bus
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn read_byte(&self, register: u8) -> Result<u8, Error> {
        self.transact("read_byte", register, false, || {
            self.bus.read_byte(self.address, register)
        })
    }

    pub fn write_byte(&self, register: u8, value: u8) -> Result<(), Error> {
        self.transact("write_byte", register, true, || {
            self.bus.write_byte(self.address, register, value)
        })
    }

    pub fn read_word(&self, register: u8) -> Result<u16, Error> {
        self.transact("read_word", register, false, || {
            self.bus.read_word(self.address, register)
        })
    }

    pub fn write_word(&self, register: u8, value: u16) -> Result<(), Error> {
        self.transact("write_word", register, true, || {
            self.bus.write_word(self.address, register, value)
        })
    }

    /// Read a block of up to [`BLOCK_MAX`] bytes, returning the number read.
    pub fn read_block(&self, register: u8, buf: &mut [u8]) -> Result<usize, Error> {
        self.transact("read_block", register, false, || {
            self.bus.read_block(self.address, register, buf)
        })
    }

    pub fn write_block(&self, register: u8, data: &[u8]) -> Result<(), Error> {
        self.transact("write_block", register, true, || {
            self.bus.write_block(self.address, register, data)
        })
    }

    fn transact<T>(
        &self,
        op: &'static str,
        register: u8,
        is_write: bool,
        mut f: impl FnMut() -> Result<T, BusError>,
    ) -> Result<T, Error> {
        let bus = self.address.bus();
        let address = self.address.address();
        with_retry(self.retry, |attempt| {
            if is_write {
                probes::bus__write!(|| (bus, address, register, attempt));
            } else {
                probes::bus__read!(|| (bus, address, register, attempt));
            }
            f().map_err(|e| {
                let reason = e.to_string();
                probes::bus__error!(|| (bus, address, register, reason.as_str()));
                debug!(
                    self.log,
                    "bus transaction failed";
                    "op" => op,
                    "register" => register,
                    "attempt" => attempt,
                    "reason" => &reason,
                );
                e
            })
        })
        .map_err(|source| {
            warn!(
                self.log,
                "bus transaction failed, retries exhausted";
                "op" => op,
                "register" => register,
                "attempts" => self.retry.max_attempts,
                "reason" => %source,
            );
            Error::Bus {
                address: self.address,
                register,
                source,
            }
        })
    }
}
