// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Chunked transfers to and from transceiver EEPROMs.
//!
//! An SMBus block transaction moves at most 32 bytes, so larger accesses are
//! split into chunks of that size. Each chunk is retried on its own. If a
//! chunk still fails after its last attempt, the transfer stops there: the
//! bytes moved so far are returned, and the caller compares the count with
//! what it asked for. Only a transfer which moved nothing returns an error.

use crate::bus::with_retry;
use crate::bus::BusClient;
use crate::bus::BLOCK_MAX;
use crate::config::RetryPolicy;
use crate::Error;
use slog::warn;
use switch_platform_types::MemoryRead;
use switch_platform_types::MemoryWrite;

/// A trait for splitting an arbitrary-sized access into limited chunks.
pub trait ChunkedAccess: Sized {
    /// The size of a single chunk, in bytes.
    const SIZE: u16;

    /// A dummy constant asserting that `SIZE` is valid.
    const _DUMMY: () = assert!(Self::SIZE > 0 && Self::SIZE as usize <= BLOCK_MAX);

    /// Return a single access of the provided size.
    fn build_one(offset: u8, len: u16) -> Result<Self, Error>;

    /// Split a single large access into many, using `Self::build_one()`.
    fn build_many(offset: u8, len: u16) -> Result<Vec<Self>, Error> {
        // Reading to the end of the map puts the stop at 256, which does not
        // fit in a `u8`.
        let stop = u16::from(offset) + len;
        Self::build_one(offset, len)?;
        (u16::from(offset)..stop)
            .step_by(usize::from(Self::SIZE))
            .map(|new_offset| {
                let new_len = Self::SIZE.min(stop - new_offset);
                // `new_offset` is below `stop`, which is at most 256.
                Self::build_one(new_offset as u8, new_len)
            })
            .collect()
    }
}

impl ChunkedAccess for MemoryRead {
    const SIZE: u16 = BLOCK_MAX as u16;

    fn build_one(offset: u8, len: u16) -> Result<Self, Error> {
        Self::new(offset, len).map_err(Error::from)
    }
}

impl ChunkedAccess for MemoryWrite {
    const SIZE: u16 = BLOCK_MAX as u16;

    fn build_one(offset: u8, len: u16) -> Result<Self, Error> {
        Self::new(offset, len).map_err(Error::from)
    }
}

/// The EEPROM at one two-wire address of a transceiver.
#[derive(Clone, Debug)]
pub struct Eeprom {
    client: BusClient,
    retry: RetryPolicy,
}

impl Eeprom {
    /// Create an EEPROM accessor.
    ///
    /// `client` performs single attempts; each chunk is retried with
    /// `retry`.
    pub fn new(client: BusClient, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    pub fn client(&self) -> &BusClient {
        &self.client
    }

    /// Read `len` bytes starting at `offset`.
    ///
    /// The result may be shorter than `len` if a chunk failed after some
    /// data had been read.
    pub fn read(&self, offset: u8, len: u16) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(usize::from(len));
        for chunk in MemoryRead::build_many(offset, len)? {
            let mut buf = [0u8; BLOCK_MAX];
            let want = usize::from(chunk.len());
            let res = with_retry(self.retry, |_| {
                self.client.read_block(chunk.offset(), &mut buf[..want])
            });
            match res {
                Ok(n) => {
                    out.extend_from_slice(&buf[..n.min(want)]);
                    if n < want {
                        warn!(
                            self.client.log(),
                            "short EEPROM read";
                            "offset" => chunk.offset(),
                            "expected" => want,
                            "actual" => n,
                        );
                        break;
                    }
                }
                Err(e) if out.is_empty() => return Err(e),
                Err(e) => {
                    warn!(
                        self.client.log(),
                        "EEPROM read stopped early";
                        "offset" => chunk.offset(),
                        "read" => out.len(),
                        "reason" => %e,
                    );
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Read the whole 256-byte map.
    pub fn read_map(&self) -> Result<Vec<u8>, Error> {
        let whole = MemoryRead::whole_map();
        self.read(whole.offset(), whole.len())
    }

    /// Write `data` starting at `offset`, returning the number of bytes
    /// written.
    pub fn write(&self, offset: u8, data: &[u8]) -> Result<usize, Error> {
        let len = u16::try_from(data.len()).map_err(|_| {
            Error::InvalidArgument(format!("write of {} bytes is too large", data.len()))
        })?;
        let mut written = 0;
        for chunk in MemoryWrite::build_many(offset, len)? {
            let start = usize::from(chunk.offset() - offset);
            let bytes = &data[start..start + usize::from(chunk.len())];
            let res = with_retry(self.retry, |_| self.client.write_block(chunk.offset(), bytes));
            match res {
                Ok(()) => written += bytes.len(),
                Err(e) if written == 0 => return Err(e),
                Err(e) => {
                    warn!(
                        self.client.log(),
                        "EEPROM write stopped early";
                        "offset" => chunk.offset(),
                        "written" => written,
                        "reason" => %e,
                    );
                    break;
                }
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::ChunkedAccess;
    use super::Eeprom;
    use crate::bus::BusClient;
    use crate::config::RetryPolicy;
    use crate::sim::SimulatedBus;
    use crate::BusAddress;
    use crate::BusError;
    use crate::Error;
    use std::sync::Arc;
    use std::time::Duration;
    use switch_platform_types::MemoryRead;
    use switch_platform_types::MemoryWrite;

    fn setup() -> (Arc<SimulatedBus>, BusAddress, Eeprom) {
        let log = slog::Logger::root(slog::Discard, slog::o!());
        let address = BusAddress::new(2, 0x50).unwrap();
        let bus = Arc::new(SimulatedBus::new());
        let map: Vec<u8> = (0..=255).collect();
        bus.set_bytes(address, 0, &map);
        let client = BusClient::new(bus.clone(), address, RetryPolicy::once(), &log);
        let eeprom = Eeprom::new(client, RetryPolicy::new(3, Duration::ZERO));
        (bus, address, eeprom)
    }

    #[test]
    fn test_build_many() {
        let chunks = MemoryRead::build_many(0, 256).unwrap();
        assert_eq!(chunks.len(), 8);
        assert!(chunks.iter().all(|c| c.len() == 32));

        let chunks = MemoryRead::build_many(250, 6).unwrap();
        assert_eq!(chunks, vec![MemoryRead::new(250, 6).unwrap()]);

        let chunks = MemoryWrite::build_many(20, 40).unwrap();
        let spans: Vec<_> = chunks.iter().map(|c| (c.offset(), c.len())).collect();
        assert_eq!(spans, vec![(20, 32), (52, 8)]);

        assert!(MemoryRead::build_many(0, 0).unwrap().is_empty());
    }

    #[test]
    fn test_build_many_rejects_past_end() {
        assert!(matches!(
            MemoryRead::build_many(250, 7),
            Err(Error::Types(_))
        ));
        assert!(MemoryWrite::build_many(1, 256).is_err());
    }

    #[test]
    fn test_read_whole_map() {
        let (bus, address, eeprom) = setup();
        let map = eeprom.read_map().unwrap();
        assert_eq!(map, (0..=255).collect::<Vec<u8>>());
        assert_eq!(bus.read_count_at(address, 0xE0), 1);
    }

    #[test]
    fn test_read_retries_each_chunk() {
        let (bus, address, eeprom) = setup();
        bus.inject_fault(address, 32, BusError::Nack, 2);
        let data = eeprom.read(0, 64).unwrap();
        assert_eq!(data.len(), 64);
        assert_eq!(bus.read_count_at(address, 32), 3);
    }

    #[test]
    fn test_read_returns_partial_data() {
        let (bus, address, eeprom) = setup();
        bus.inject_persistent_fault(address, 64, BusError::Nack);
        let data = eeprom.read(0, 128).unwrap();
        assert_eq!(data, (0..64).collect::<Vec<u8>>());
        // The transfer stops at the failed chunk.
        assert_eq!(bus.read_count_at(address, 96), 0);
    }

    #[test]
    fn test_read_fails_if_nothing_read() {
        let (bus, address, eeprom) = setup();
        bus.inject_persistent_fault(address, 0, BusError::Nack);
        assert!(matches!(
            eeprom.read(0, 16),
            Err(Error::Bus {
                register: 0,
                source: BusError::Nack,
                ..
            })
        ));
    }

    #[test]
    fn test_write_counts_bytes() {
        let (bus, address, eeprom) = setup();
        let data = [0xAAu8; 40];
        assert_eq!(eeprom.write(100, &data).unwrap(), 40);
        assert_eq!(bus.byte(address, 139), Some(0xAA));
        assert_eq!(bus.writes().len(), 2);

        bus.inject_persistent_fault(address, 132, BusError::Nack);
        assert_eq!(eeprom.write(100, &data).unwrap(), 32);
        assert!(eeprom.write(250, &data).is_err());
    }
}
