// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! A registry of live devices, keyed by bus address.
//!
//! Several drivers need a device owned by another: the LED and transceiver
//! drivers reach their registers through the CPLD. The owner registers its
//! device here when it attaches and removes it when it detaches, and the
//! other drivers look it up by address.

use crate::BusAddress;
use crate::Error;
use slog::debug;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

/// A device which knows its own bus address.
pub trait BusDevice: Send + Sync {
    fn address(&self) -> BusAddress;
}

/// A lock-protected map from bus address to a shared device handle.
///
/// The registry holds a reference to each device, but never owns it in the
/// sense of controlling its lifetime: the device stays alive as long as any
/// handle to it does.
#[derive(Debug)]
pub struct DeviceRegistry<D: ?Sized> {
    devices: Mutex<BTreeMap<BusAddress, Arc<D>>>,
    log: Logger,
}

impl<D: ?Sized> DeviceRegistry<D> {
    pub fn new(log: &Logger) -> Self {
        Self {
            devices: Mutex::new(BTreeMap::new()),
            log: log.new(slog::o!("component" => "registry")),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<BusAddress, Arc<D>>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `device` at `address`.
    ///
    /// Fails with [`Error::AddressInUse`] if another device is already
    /// registered there.
    pub fn register(&self, address: BusAddress, device: Arc<D>) -> Result<(), Error> {
        let mut devices = self.lock();
        if devices.contains_key(&address) {
            return Err(Error::AddressInUse(address));
        }
        devices.insert(address, device);
        debug!(self.log, "registered device"; "address" => %address);
        Ok(())
    }

    /// Return the device registered at `address`.
    pub fn find(&self, address: BusAddress) -> Result<Arc<D>, Error> {
        self.lock()
            .get(&address)
            .cloned()
            .ok_or(Error::NotFound(address))
    }

    /// Return the addresses of every registered device, in order.
    pub fn addresses(&self) -> Vec<BusAddress> {
        self.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl<D: BusDevice + ?Sized> DeviceRegistry<D> {
    /// Remove `device` from the registry.
    ///
    /// Fails with [`Error::NotFound`] unless this very device, not merely
    /// another at the same address, is registered.
    pub fn unregister(&self, device: &Arc<D>) -> Result<(), Error> {
        let address = device.address();
        let mut devices = self.lock();
        match devices.get(&address) {
            Some(registered) if Arc::ptr_eq(registered, device) => {
                devices.remove(&address);
                debug!(self.log, "unregistered device"; "address" => %address);
                Ok(())
            }
            _ => Err(Error::NotFound(address)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::BusDevice;
    use super::DeviceRegistry;
    use crate::BusAddress;
    use crate::Error;
    use std::sync::Arc;

    #[derive(Debug)]
    struct Dummy(BusAddress);

    impl BusDevice for Dummy {
        fn address(&self) -> BusAddress {
            self.0
        }
    }

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn addr(bus: u16, address: u8) -> BusAddress {
        BusAddress::new(bus, address).unwrap()
    }

    #[test]
    fn test_find_after_register() {
        let registry = DeviceRegistry::new(&test_logger());
        let cpld = Arc::new(Dummy(addr(0, 0x60)));
        registry.register(cpld.address(), cpld.clone()).unwrap();
        let found = registry.find(addr(0, 0x60)).unwrap();
        assert!(Arc::ptr_eq(&found, &cpld));
    }

    #[test]
    fn test_find_after_unregister() {
        let registry = DeviceRegistry::new(&test_logger());
        let cpld = Arc::new(Dummy(addr(0, 0x60)));
        registry.register(cpld.address(), cpld.clone()).unwrap();
        registry.unregister(&cpld).unwrap();
        assert!(matches!(
            registry.find(addr(0, 0x60)),
            Err(Error::NotFound(a)) if a == addr(0, 0x60)
        ));
        assert!(matches!(registry.unregister(&cpld), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_duplicate_registration() {
        let registry = DeviceRegistry::new(&test_logger());
        let a = Arc::new(Dummy(addr(0, 0x60)));
        let b = Arc::new(Dummy(addr(0, 0x60)));
        registry.register(a.address(), a.clone()).unwrap();
        assert!(matches!(
            registry.register(b.address(), b.clone()),
            Err(Error::AddressInUse(_))
        ));

        // Removing an impostor leaves the registered device in place.
        assert!(registry.unregister(&b).is_err());
        assert!(Arc::ptr_eq(&registry.find(a.address()).unwrap(), &a));
    }

    #[test]
    fn test_same_address_on_different_buses() {
        let registry = DeviceRegistry::new(&test_logger());
        for bus in 0..3 {
            let d = Arc::new(Dummy(addr(bus, 0x60)));
            registry.register(d.address(), d).unwrap();
        }
        assert_eq!(registry.len(), 3);
        assert_eq!(
            registry.addresses(),
            vec![addr(0, 0x60), addr(1, 0x60), addr(2, 0x60)]
        );
    }

    #[test]
    fn test_concurrent_use() {
        let registry = Arc::new(DeviceRegistry::new(&test_logger()));
        let threads: Vec<_> = (0..8u16)
            .map(|bus| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let devices: Vec<_> = (0x50..0x58)
                        .map(|a| Arc::new(Dummy(addr(bus, a))))
                        .collect();
                    for d in devices.iter() {
                        registry.register(d.address(), d.clone()).unwrap();
                        assert!(Arc::ptr_eq(&registry.find(d.address()).unwrap(), d));
                    }
                    // Remove every other device.
                    for d in devices.iter().step_by(2) {
                        registry.unregister(d).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(registry.len(), 8 * 4);
        for bus in 0..8 {
            for a in 0x50..0x58u8 {
                assert_eq!(registry.find(addr(bus, a)).is_ok(), a % 2 == 1);
            }
        }
    }
}
