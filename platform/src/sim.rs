// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! An in-memory register bus.
//!
//! The simulated bus holds a 256-byte register file for each device, plus a
//! separate set of 16-bit registers for PMBus-style devices whose word
//! registers sit at adjacent addresses. Faults can be injected per register,
//! and every transaction is counted so tests can check how much bus traffic
//! an operation caused.

use crate::bus::RegisterBus;
use crate::bus::BLOCK_MAX;
use crate::BusAddress;
use crate::BusError;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

#[derive(Clone, Copy, Debug)]
enum Remaining {
    Times(u32),
    Always,
}

#[derive(Clone, Copy, Debug)]
struct Fault {
    error: BusError,
    remaining: Remaining,
}

#[derive(Debug)]
struct Device {
    bytes: [u8; 256],
    words: BTreeMap<u8, u16>,
    queued: BTreeMap<u8, VecDeque<u8>>,
}

impl Default for Device {
    fn default() -> Self {
        Self {
            bytes: [0; 256],
            words: BTreeMap::new(),
            queued: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    devices: BTreeMap<BusAddress, Device>,
    faults: BTreeMap<(BusAddress, u8), Fault>,
    reads: BTreeMap<(BusAddress, u8), usize>,
    writes: Vec<(BusAddress, u8, Vec<u8>)>,
}

impl Inner {
    // Record an attempted access, and fail it if the device is absent or a
    // fault is pending on the register.
    fn access(&mut self, device: BusAddress, register: u8) -> Result<&mut Device, BusError> {
        if let Some(fault) = self.faults.get_mut(&(device, register)) {
            let error = fault.error;
            match &mut fault.remaining {
                Remaining::Always => return Err(error),
                Remaining::Times(n) => {
                    *n -= 1;
                    if *n == 0 {
                        self.faults.remove(&(device, register));
                    }
                    return Err(error);
                }
            }
        }
        self.devices.get_mut(&device).ok_or(BusError::Nack)
    }

    fn count_read(&mut self, device: BusAddress, register: u8) {
        *self.reads.entry((device, register)).or_default() += 1;
    }
}

/// A register bus backed by memory.
#[derive(Debug, Default)]
pub struct SimulatedBus {
    inner: Mutex<Inner>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a device with all registers zeroed. Accesses to addresses with
    /// no device are NACKed.
    pub fn add_device(&self, device: BusAddress) {
        self.lock().devices.entry(device).or_default();
    }

    pub fn remove_device(&self, device: BusAddress) {
        self.lock().devices.remove(&device);
    }

    /// Set a byte register, attaching the device if needed.
    pub fn set_byte(&self, device: BusAddress, register: u8, value: u8) {
        self.lock().devices.entry(device).or_default().bytes[usize::from(register)] = value;
    }

    /// Set consecutive byte registers starting at `register`.
    pub fn set_bytes(&self, device: BusAddress, register: u8, values: &[u8]) {
        let mut inner = self.lock();
        let dev = inner.devices.entry(device).or_default();
        let start = usize::from(register);
        let end = (start + values.len()).min(dev.bytes.len());
        dev.bytes[start..end].copy_from_slice(&values[..end - start]);
    }

    /// Set a 16-bit register, attaching the device if needed.
    pub fn set_word(&self, device: BusAddress, register: u8, value: u16) {
        self.lock()
            .devices
            .entry(device)
            .or_default()
            .words
            .insert(register, value);
    }

    /// Queue values returned by successive byte reads of `register`, before
    /// reads fall back to the register's stored value.
    pub fn queue_bytes(&self, device: BusAddress, register: u8, values: &[u8]) {
        self.lock()
            .devices
            .entry(device)
            .or_default()
            .queued
            .entry(register)
            .or_default()
            .extend(values);
    }

    pub fn byte(&self, device: BusAddress, register: u8) -> Option<u8> {
        self.lock()
            .devices
            .get(&device)
            .map(|d| d.bytes[usize::from(register)])
    }

    pub fn word(&self, device: BusAddress, register: u8) -> Option<u16> {
        self.lock()
            .devices
            .get(&device)
            .and_then(|d| d.words.get(&register).copied())
    }

    /// Fail the next `times` accesses to a register with `error`.
    pub fn inject_fault(&self, device: BusAddress, register: u8, error: BusError, times: u32) {
        if times == 0 {
            return;
        }
        self.lock().faults.insert(
            (device, register),
            Fault {
                error,
                remaining: Remaining::Times(times),
            },
        );
    }

    /// Fail every access to a register with `error`, until the faults are
    /// cleared.
    pub fn inject_persistent_fault(&self, device: BusAddress, register: u8, error: BusError) {
        self.lock().faults.insert(
            (device, register),
            Fault {
                error,
                remaining: Remaining::Always,
            },
        );
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// The total number of read transactions attempted, including failures.
    pub fn read_count(&self) -> usize {
        self.lock().reads.values().sum()
    }

    /// The number of read transactions attempted at one register.
    pub fn read_count_at(&self, device: BusAddress, register: u8) -> usize {
        self.lock()
            .reads
            .get(&(device, register))
            .copied()
            .unwrap_or(0)
    }

    /// Every successful write, in order, as (device, register, data). Words
    /// are recorded little-endian.
    pub fn writes(&self) -> Vec<(BusAddress, u8, Vec<u8>)> {
        self.lock().writes.clone()
    }
}

impl RegisterBus for SimulatedBus {
    fn read_byte(&self, device: BusAddress, register: u8) -> Result<u8, BusError> {
        let mut inner = self.lock();
        inner.count_read(device, register);
        let dev = inner.access(device, register)?;
        if let Some(value) = dev.queued.get_mut(&register).and_then(|q| q.pop_front()) {
            return Ok(value);
        }
        Ok(dev.bytes[usize::from(register)])
    }

    fn write_byte(&self, device: BusAddress, register: u8, value: u8) -> Result<(), BusError> {
        let mut inner = self.lock();
        let dev = inner.access(device, register)?;
        dev.bytes[usize::from(register)] = value;
        inner.writes.push((device, register, vec![value]));
        Ok(())
    }

    fn read_word(&self, device: BusAddress, register: u8) -> Result<u16, BusError> {
        let mut inner = self.lock();
        inner.count_read(device, register);
        let dev = inner.access(device, register)?;
        if let Some(word) = dev.words.get(&register) {
            return Ok(*word);
        }
        let lo = dev.bytes[usize::from(register)];
        let hi = dev.bytes[usize::from(register.wrapping_add(1))];
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn write_word(&self, device: BusAddress, register: u8, value: u16) -> Result<(), BusError> {
        let mut inner = self.lock();
        let dev = inner.access(device, register)?;
        dev.words.insert(register, value);
        inner
            .writes
            .push((device, register, value.to_le_bytes().to_vec()));
        Ok(())
    }

    fn read_block(
        &self,
        device: BusAddress,
        register: u8,
        buf: &mut [u8],
    ) -> Result<usize, BusError> {
        let mut inner = self.lock();
        inner.count_read(device, register);
        let dev = inner.access(device, register)?;
        let start = usize::from(register);
        let len = buf.len().min(BLOCK_MAX).min(dev.bytes.len() - start);
        buf[..len].copy_from_slice(&dev.bytes[start..start + len]);
        Ok(len)
    }

    fn write_block(&self, device: BusAddress, register: u8, data: &[u8]) -> Result<(), BusError> {
        let mut inner = self.lock();
        let dev = inner.access(device, register)?;
        let start = usize::from(register);
        let len = data.len().min(BLOCK_MAX).min(dev.bytes.len() - start);
        if len < data.len() {
            return Err(BusError::ShortTransfer {
                expected: data.len(),
                actual: len,
            });
        }
        dev.bytes[start..start + len].copy_from_slice(data);
        inner.writes.push((device, register, data.to_vec()));
        Ok(())
    }
}
