// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! The port CPLD, which carries transceiver presence and reset for 32 ports.

use crate::bus::BusClient;
use crate::registry::BusDevice;
use crate::BusAddress;
use crate::Error;
use slog::debug;
use std::sync::Mutex;
use std::sync::PoisonError;
use switch_platform_decode::bitmap;
use switch_platform_decode::bitmap::Polarity;
use switch_platform_decode::bitmap::BITMAP_REGISTERS;
use switch_platform_types::PortMask;
use switch_platform_types::PortStatus;

/// The register holding the CPLD's firmware version.
pub const VERSION_REGISTER: u8 = 0x01;

/// The first of the four presence registers.
pub const PRESENCE_BASE: u8 = 0x30;

/// The first of the four reset registers.
pub const RESET_BASE: u8 = 0x04;

/// Where a CPLD keeps its per-port bitmaps, and their polarity.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CpldLayout {
    pub presence_base: u8,
    pub presence_polarity: Polarity,
    pub reset_base: u8,
    pub reset_polarity: Polarity,
}

impl Default for CpldLayout {
    /// The layout of the AS7712 and AS7716 CPLD, where both fields are
    /// active-low.
    fn default() -> Self {
        Self {
            presence_base: PRESENCE_BASE,
            presence_polarity: Polarity::ActiveLow,
            reset_base: RESET_BASE,
            reset_polarity: Polarity::ActiveLow,
        }
    }
}

/// Parse a raw register write of the form `0x<register> 0x<value>`.
pub fn parse_access(s: &str) -> Result<(u8, u8), Error> {
    let invalid = || Error::InvalidArgument(format!("expected '0x<reg> 0x<value>', found '{s}'"));
    let mut fields = s.split_whitespace();
    let (Some(reg), Some(value)) = (fields.next(), fields.next()) else {
        return Err(invalid());
    };
    let parse = |field: &str| {
        field
            .strip_prefix("0x")
            .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            .ok_or_else(invalid)
    };
    Ok((parse(reg)?, parse(value)?))
}

/// A CPLD with transceiver presence and reset bitmaps.
#[derive(Debug)]
pub struct Cpld {
    client: BusClient,
    layout: CpldLayout,
    // Serializes read-modify-write sequences.
    lock: Mutex<()>,
}

impl BusDevice for Cpld {
    fn address(&self) -> BusAddress {
        self.client.address()
    }
}

impl Cpld {
    pub fn new(client: BusClient) -> Self {
        Self::with_layout(client, CpldLayout::default())
    }

    pub fn with_layout(client: BusClient, layout: CpldLayout) -> Self {
        Self {
            client,
            layout,
            lock: Mutex::new(()),
        }
    }

    pub fn layout(&self) -> CpldLayout {
        self.layout
    }

    pub fn client(&self) -> &BusClient {
        &self.client
    }

    pub fn version(&self) -> Result<u8, Error> {
        self.client.read_byte(VERSION_REGISTER)
    }

    pub fn read(&self, register: u8) -> Result<u8, Error> {
        self.client.read_byte(register)
    }

    pub fn write(&self, register: u8, value: u8) -> Result<(), Error> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.client.write_byte(register, value)
    }

    /// Apply a raw write written as `0x<register> 0x<value>`.
    pub fn access(&self, command: &str) -> Result<(), Error> {
        let (register, value) = parse_access(command)?;
        debug!(
            self.client.log(),
            "raw CPLD write";
            "register" => register,
            "value" => value,
        );
        self.write(register, value)
    }

    /// Replace the value of `register` with `f` of its current value, with
    /// no other change to the CPLD in between. Return the value written.
    pub fn modify(
        &self,
        register: u8,
        f: impl FnOnce(u8) -> Result<u8, Error>,
    ) -> Result<u8, Error> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let old = self.client.read_byte(register)?;
        let new = f(old)?;
        self.client.write_byte(register, new)?;
        Ok(new)
    }

    fn read_bitmap(&self, base: u8) -> Result<[u8; BITMAP_REGISTERS], Error> {
        let mut regs = [0u8; BITMAP_REGISTERS];
        for (offset, reg) in (0u8..).zip(regs.iter_mut()) {
            *reg = self.client.read_byte(base.wrapping_add(offset))?;
        }
        Ok(regs)
    }

    /// Return true if a module is seated in `port`.
    pub fn present(&self, port: u8) -> Result<bool, Error> {
        let (register, _) = bitmap::locate(self.layout.presence_base, port)?;
        let raw = self.client.read_byte(register)?;
        Ok(bitmap::is_asserted(raw, port, self.layout.presence_polarity)?)
    }

    /// Return the ports with a module seated.
    pub fn presence(&self) -> Result<PortMask, Error> {
        let regs = self.read_bitmap(self.layout.presence_base)?;
        Ok(bitmap::decode(regs, self.layout.presence_polarity))
    }

    /// Return the presence of every port as four hex bytes, port 1 first,
    /// with a set bit meaning present.
    pub fn present_all(&self) -> Result<String, Error> {
        let [a, b, c, d] = self.presence()?.0.to_le_bytes();
        Ok(format!("{a:02x} {b:02x} {c:02x} {d:02x}"))
    }

    /// Return true if `port` is held in reset.
    pub fn reset(&self, port: u8) -> Result<bool, Error> {
        let (register, _) = bitmap::locate(self.layout.reset_base, port)?;
        let raw = self.client.read_byte(register)?;
        Ok(bitmap::is_asserted(raw, port, self.layout.reset_polarity)?)
    }

    /// Return the ports held in reset.
    pub fn resets(&self) -> Result<PortMask, Error> {
        let regs = self.read_bitmap(self.layout.reset_base)?;
        Ok(bitmap::decode(regs, self.layout.reset_polarity))
    }

    /// Place `port` in reset, or release it.
    pub fn set_reset(&self, port: u8, reset: bool) -> Result<(), Error> {
        let (register, _) = bitmap::locate(self.layout.reset_base, port)?;
        let polarity = self.layout.reset_polarity;
        self.modify(register, |raw| {
            Ok(bitmap::encode(raw, port, reset, polarity)?)
        })?;
        debug!(self.client.log(), "set port reset"; "port" => port, "reset" => reset);
        Ok(())
    }

    /// Return the presence and reset state of `port`.
    pub fn status(&self, port: u8) -> Result<PortStatus, Error> {
        let mut status = PortStatus::empty();
        status.set(PortStatus::PRESENT, self.present(port)?);
        status.set(PortStatus::RESET, self.reset(port)?);
        Ok(status)
    }
}
