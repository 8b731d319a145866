// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! The I2C channel multiplexers built into the AS5712 CPLDs.
//!
//! A CPLD multiplexer routes its upstream bus to one of its downstream
//! channels, selected by writing the channel number to a single register.
//! Writing `0xFF` disconnects every channel.

use crate::bus::BusClient;
use crate::registry::BusDevice;
use crate::BusAddress;
use crate::Error;
use slog::debug;
use std::sync::Mutex;
use std::sync::PoisonError;

/// The channel-select register.
pub const CHANNEL_SELECT_REGISTER: u8 = 0x02;

/// The value which disconnects every channel.
pub const DESELECT: u8 = 0xFF;

/// The CPLDs of the AS5712, distinguished by how many channels they switch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CpldModel {
    Cpld1,
    Cpld2,
    Cpld3,
}

impl CpldModel {
    pub const fn channel_count(&self) -> u8 {
        match self {
            CpldModel::Cpld1 => 0,
            CpldModel::Cpld2 => 24,
            CpldModel::Cpld3 => 30,
        }
    }
}

/// A CPLD channel multiplexer.
#[derive(Debug)]
pub struct CpldMux {
    client: BusClient,
    model: CpldModel,
    // The channel most recently selected, or `DESELECT`.
    selected: Mutex<u8>,
}

impl BusDevice for CpldMux {
    fn address(&self) -> BusAddress {
        self.client.address()
    }
}

impl CpldMux {
    pub fn new(client: BusClient, model: CpldModel) -> Self {
        Self {
            client,
            model,
            selected: Mutex::new(DESELECT),
        }
    }

    pub fn model(&self) -> CpldModel {
        self.model
    }

    /// Return the selected channel, if any.
    pub fn selected(&self) -> Option<u8> {
        let selected = *self.selected.lock().unwrap_or_else(PoisonError::into_inner);
        (selected != DESELECT).then_some(selected)
    }

    /// Route the upstream bus to `channel`.
    ///
    /// Selecting the channel which is already selected causes no bus
    /// traffic.
    pub fn select(&self, channel: u8) -> Result<(), Error> {
        if channel >= self.model.channel_count() {
            return Err(Error::InvalidArgument(format!(
                "{:?} has {} channels, cannot select channel {channel}",
                self.model,
                self.model.channel_count(),
            )));
        }
        let mut selected = self.selected.lock().unwrap_or_else(PoisonError::into_inner);
        if *selected == channel {
            return Ok(());
        }
        self.client.write_byte(CHANNEL_SELECT_REGISTER, channel)?;
        *selected = channel;
        debug!(self.client.log(), "selected mux channel"; "channel" => channel);
        Ok(())
    }

    /// Disconnect every channel.
    ///
    /// This always writes to the device, whatever was last selected.
    pub fn deselect(&self) -> Result<(), Error> {
        let mut selected = self.selected.lock().unwrap_or_else(PoisonError::into_inner);
        *selected = DESELECT;
        self.client.write_byte(CHANNEL_SELECT_REGISTER, DESELECT)
    }
}

#[cfg(test)]
mod tests {
    use super::CpldModel;
    use super::CpldMux;
    use super::CHANNEL_SELECT_REGISTER;
    use super::DESELECT;
    use crate::bus::BusClient;
    use crate::config::RetryPolicy;
    use crate::sim::SimulatedBus;
    use crate::BusAddress;
    use crate::BusError;
    use crate::Error;
    use std::sync::Arc;

    fn setup(model: CpldModel) -> (Arc<SimulatedBus>, BusAddress, CpldMux) {
        let log = slog::Logger::root(slog::Discard, slog::o!());
        let address = BusAddress::new(0, 0x61).unwrap();
        let bus = Arc::new(SimulatedBus::new());
        bus.add_device(address);
        let client = BusClient::new(bus.clone(), address, RetryPolicy::once(), &log);
        (bus, address, CpldMux::new(client, model))
    }

    #[test]
    fn test_select_same_channel_writes_once() {
        let (bus, address, mux) = setup(CpldModel::Cpld2);
        mux.select(5).unwrap();
        mux.select(5).unwrap();
        assert_eq!(bus.writes(), vec![(address, CHANNEL_SELECT_REGISTER, vec![5])]);
        assert_eq!(mux.selected(), Some(5));

        mux.select(6).unwrap();
        assert_eq!(bus.writes().len(), 2);
    }

    #[test]
    fn test_deselect_always_writes() {
        let (bus, _address, mux) = setup(CpldModel::Cpld3);
        mux.deselect().unwrap();
        mux.deselect().unwrap();
        assert_eq!(bus.writes().len(), 2);
        assert_eq!(mux.selected(), None);

        // After deselecting, the previous channel must be written again.
        mux.select(29).unwrap();
        mux.deselect().unwrap();
        mux.select(29).unwrap();
        let values: Vec<_> = bus.writes().into_iter().map(|w| w.2[0]).collect();
        assert_eq!(values, vec![DESELECT, DESELECT, 29, DESELECT, 29]);
    }

    #[test]
    fn test_channel_counts() {
        let (_bus, _address, mux) = setup(CpldModel::Cpld2);
        assert!(matches!(mux.select(24), Err(Error::InvalidArgument(_))));
        let (_bus, _address, mux) = setup(CpldModel::Cpld1);
        assert!(mux.select(0).is_err());
        assert_eq!(CpldModel::Cpld3.channel_count(), 30);
    }

    #[test]
    fn test_failed_select_is_not_remembered() {
        let (bus, address, mux) = setup(CpldModel::Cpld2);
        bus.inject_fault(address, CHANNEL_SELECT_REGISTER, BusError::Nack, 1);
        assert!(mux.select(3).is_err());
        assert_eq!(mux.selected(), None);
        mux.select(3).unwrap();
        assert_eq!(mux.selected(), Some(3));
    }
}
