// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Transceiver cages.
//!
//! Each cage is wired to its own downstream bus, where the module answers at
//! the standard two-wire addresses. Presence and reset are not visible on
//! that bus at all: they are bits in the port CPLD, which the cage finds in
//! the device registry.

use crate::bus::BusClient;
use crate::bus::RegisterBus;
use crate::cache::CachedSnapshot;
use crate::cache::RefreshPolicy;
use crate::config::Config;
use crate::config::RetryPolicy;
use crate::cpld::Cpld;
use crate::eeprom::Eeprom;
use crate::registry::DeviceRegistry;
use crate::BusAddress;
use crate::Error;
use slog::debug;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use switch_platform_decode::ident;
use switch_platform_decode::PortType;
use switch_platform_decode::Vendor;
use switch_platform_types::address::SFP_DDM_ADDRESS;
use switch_platform_types::address::SFP_EEPROM_ADDRESS;
use switch_platform_types::port::front_port_number;
use switch_platform_types::PortStatus;
use switch_platform_types::NUM_PORTS;

/// The SFF-8636 byte holding the latched RX loss-of-signal flags.
pub const QSFP_RX_LOS: u8 = 3;

/// The SFF-8636 byte holding the latched TX fault flags.
pub const QSFP_TX_FAULT: u8 = 4;

/// The SFF-8636 byte holding the TX disable controls.
pub const QSFP_TX_DISABLE: u8 = 86;

/// The status bytes refreshed together, in read order.
pub const QSFP_STATUS_REGISTERS: [u8; 3] = [QSFP_TX_FAULT, QSFP_TX_DISABLE, QSFP_RX_LOS];

/// The mask of the four per-lane bits in each status byte.
pub const LANE_MASK: u8 = 0x0F;

/// The number of lanes of a QSFP module.
pub const QSFP_LANES: u8 = 4;

/// The kind of driver bound to a cage.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SfpKind {
    /// An SFP cage exposing only the serial ID page.
    Msa,
    /// An SFP cage which also exposes the diagnostic page at `0x51`.
    Ddm,
    /// A QSFP cage, with per-lane TX and RX status.
    Qsfp,
}

impl core::fmt::Display for SfpKind {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let s = match self {
            SfpKind::Msa => "sfp",
            SfpKind::Ddm => "sfp-ddm",
            SfpKind::Qsfp => "qsfp",
        };
        write!(f, "{s}")
    }
}

/// The per-lane status of a QSFP module. Bit `n` of each field is lane `n`.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize,
)]
#[cfg_attr(feature = "api-traits", derive(schemars::JsonSchema))]
pub struct LaneStatus {
    pub tx_fault: u8,
    pub tx_disable: u8,
    pub rx_los: u8,
}

impl LaneStatus {
    /// Return true if every lane's transmitter is disabled.
    pub fn all_tx_disabled(&self) -> bool {
        self.tx_disable & LANE_MASK == LANE_MASK
    }
}

#[derive(Debug)]
enum Variant {
    Msa,
    Ddm {
        diag: Eeprom,
    },
    Qsfp {
        status: CachedSnapshot<u8, u8>,
        settle: Duration,
    },
}

/// One transceiver cage.
#[derive(Debug)]
pub struct SfpPort {
    index: u8,
    cpld: Arc<Cpld>,
    // Single-byte accesses to the serial ID page.
    client: BusClient,
    eeprom: Eeprom,
    variant: Variant,
    log: Logger,
}

impl SfpPort {
    /// Attach to the cage at CPLD port `index`, whose module sits on bus
    /// `port_bus`.
    pub fn attach(
        bus: Arc<dyn RegisterBus>,
        registry: &DeviceRegistry<Cpld>,
        cpld: BusAddress,
        index: u8,
        port_bus: u16,
        kind: SfpKind,
        config: &Config,
        log: &Logger,
    ) -> Result<Self, Error> {
        if index >= NUM_PORTS {
            return Err(Error::from(switch_platform_types::InvalidPort(index)));
        }
        let cpld = registry.find(cpld)?;
        let log = log.new(slog::o!(
            "device" => "sfp",
            "kind" => kind.to_string(),
            "port" => front_port_number(index),
        ));
        // Chunks are retried by the EEPROM accessor, so each bus call it
        // makes is a single attempt.
        let eeprom_at = |address| -> Result<Eeprom, Error> {
            let address = BusAddress::new(port_bus, address)?;
            let client = BusClient::new(bus.clone(), address, RetryPolicy::once(), &log);
            Ok(Eeprom::new(client, config.eeprom_retry))
        };
        let eeprom = eeprom_at(SFP_EEPROM_ADDRESS)?;
        let client = BusClient::new(
            bus.clone(),
            BusAddress::new(port_bus, SFP_EEPROM_ADDRESS)?,
            config.eeprom_retry,
            &log,
        );
        let variant = match kind {
            SfpKind::Msa => Variant::Msa,
            SfpKind::Ddm => Variant::Ddm {
                diag: eeprom_at(SFP_DDM_ADDRESS)?,
            },
            SfpKind::Qsfp => Variant::Qsfp {
                status: CachedSnapshot::new(
                    QSFP_STATUS_REGISTERS,
                    config.refresh_interval,
                    RefreshPolicy::Strict,
                    &log,
                ),
                settle: config.qsfp_status_delay,
            },
        };
        debug!(log, "attached transceiver cage"; "bus" => port_bus);
        Ok(Self {
            index,
            cpld,
            client,
            eeprom,
            variant,
            log,
        })
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    /// The 1-based number printed on the front panel.
    pub fn port_number(&self) -> u16 {
        front_port_number(self.index)
    }

    pub fn kind(&self) -> SfpKind {
        match self.variant {
            Variant::Msa => SfpKind::Msa,
            Variant::Ddm { .. } => SfpKind::Ddm,
            Variant::Qsfp { .. } => SfpKind::Qsfp,
        }
    }

    pub fn is_present(&self) -> Result<bool, Error> {
        self.cpld.present(self.index)
    }

    pub fn is_reset(&self) -> Result<bool, Error> {
        self.cpld.reset(self.index)
    }

    pub fn set_reset(&self, reset: bool) -> Result<(), Error> {
        self.cpld.set_reset(self.index, reset)
    }

    pub fn status(&self) -> Result<PortStatus, Error> {
        self.cpld.status(self.index)
    }

    fn ensure_present(&self) -> Result<(), Error> {
        if self.is_present()? {
            Ok(())
        } else {
            Err(Error::NotPresent(self.index))
        }
    }

    /// Classify the module seated in the cage.
    ///
    /// An empty cage is [`PortType::NotPresent`]. A module whose EEPROM
    /// cannot be read, or which this cage does not support, is
    /// [`PortType::Invalid`].
    pub fn port_type(&self) -> Result<PortType, Error> {
        if !self.is_present()? {
            return Ok(PortType::NotPresent);
        }
        let port_type = match self.variant {
            Variant::Msa | Variant::Ddm { .. } => self
                .eeprom
                .read(ident::IDENTIFIER_OFFSET, u16::from(ident::SFP_COMPLIANCE_OFFSET) + 1)
                .and_then(|buf| match buf[..] {
                    [id, _, _, compliance, ..] => Ok(PortType::from_sfp(id, compliance)),
                    _ => Err(Error::Decode(
                        switch_platform_decode::Error::MalformedResponse {
                            expected: 4,
                            found: buf.len(),
                        },
                    )),
                }),
            Variant::Qsfp { .. } => self
                .client
                .read_byte(ident::IDENTIFIER_OFFSET)
                .map(PortType::from_qsfp),
        };
        Ok(port_type.unwrap_or_else(|e| {
            warn!(self.log, "failed to read module identifier"; "reason" => %e);
            PortType::Invalid
        }))
    }

    /// Read `len` bytes of the module's serial ID EEPROM.
    pub fn read_eeprom(&self, offset: u8, len: u16) -> Result<Vec<u8>, Error> {
        self.ensure_present()?;
        self.eeprom.read(offset, len)
    }

    /// Write to the module's serial ID EEPROM, returning the bytes written.
    pub fn write_eeprom(&self, offset: u8, data: &[u8]) -> Result<usize, Error> {
        self.ensure_present()?;
        self.eeprom.write(offset, data)
    }

    /// Read the vendor information from the module's EEPROM.
    pub fn vendor(&self) -> Result<Vendor, Error> {
        let map = self.read_eeprom(0, switch_platform_types::EEPROM_SIZE)?;
        let vendor = match self.variant {
            Variant::Qsfp { .. } => Vendor::from_qsfp_map(&map)?,
            _ => Vendor::from_sfp_map(&map)?,
        };
        Ok(vendor)
    }

    /// Return true if the SFP advertises digital diagnostic monitoring,
    /// that is, whether its diagnostic page at `0x51` can be used.
    pub fn ddm_implemented(&self) -> Result<bool, Error> {
        if let Variant::Qsfp { .. } = self.variant {
            return Err(self.unsupported("ddm_implemented"));
        }
        self.ensure_present()?;
        let raw = self.client.read_byte(ident::SFP_DIAG_MONITORING_OFFSET)?;
        Ok(ident::ddm_implemented(raw))
    }

    /// Read `len` bytes of the SFP's diagnostic page at `0x51`.
    pub fn read_diag(&self, offset: u8, len: u16) -> Result<Vec<u8>, Error> {
        let Variant::Ddm { diag } = &self.variant else {
            return Err(self.unsupported("read_diag"));
        };
        self.ensure_present()?;
        diag.read(offset, len)
    }

    fn unsupported(&self, op: &str) -> Error {
        Error::Unsupported(format!("{op} on {} cage", self.kind()))
    }

    fn qsfp_status(&self) -> Result<(&CachedSnapshot<u8, u8>, Duration), Error> {
        match &self.variant {
            Variant::Qsfp { status, settle } => Ok((status, *settle)),
            _ => Err(self.unsupported("lane status")),
        }
    }

    /// Return the per-lane TX fault, TX disable and RX LOS flags.
    ///
    /// The fault and LOS flags latch, so each byte is read twice: the first
    /// read clears any stale latch, and the second, after a short delay,
    /// reports the current state.
    pub fn lane_status(&self) -> Result<LaneStatus, Error> {
        let (status, settle) = self.qsfp_status()?;
        self.ensure_present()?;
        let client = &self.client;
        let snapshot = status.refresh_batch(|| {
            for reg in QSFP_STATUS_REGISTERS {
                client.read_byte(reg)?;
            }
            if !settle.is_zero() {
                std::thread::sleep(settle);
            }
            let mut values = BTreeMap::new();
            for reg in QSFP_STATUS_REGISTERS {
                values.insert(reg, client.read_byte(reg)? & LANE_MASK);
            }
            Ok(values)
        })?;
        Ok(LaneStatus {
            tx_fault: snapshot.get(QSFP_TX_FAULT),
            tx_disable: snapshot.get(QSFP_TX_DISABLE),
            rx_los: snapshot.get(QSFP_RX_LOS),
        })
    }

    /// Disable or enable the transmitter of one lane, or of every lane if
    /// `lane` is `None`.
    pub fn set_tx_disable(&self, lane: Option<u8>, disable: bool) -> Result<(), Error> {
        let (status, _) = self.qsfp_status()?;
        let mask = match lane {
            None => LANE_MASK,
            Some(lane) if lane < QSFP_LANES => 1 << lane,
            Some(lane) => {
                return Err(Error::InvalidArgument(format!(
                    "QSFP modules have {QSFP_LANES} lanes, found lane {lane}"
                )))
            }
        };
        self.ensure_present()?;
        let client = &self.client;
        status.write(|| {
            let raw = client.read_byte(QSFP_TX_DISABLE)?;
            let value = if disable { raw | mask } else { raw & !mask };
            client.write_byte(QSFP_TX_DISABLE, value)
        })?;
        debug!(
            self.log,
            "set TX disable";
            "lane" => ?lane,
            "disable" => disable,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::LaneStatus;
    use super::SfpKind;
    use super::SfpPort;
    use super::QSFP_RX_LOS;
    use super::QSFP_TX_DISABLE;
    use super::QSFP_TX_FAULT;
    use crate::bus::BusClient;
    use crate::config::ConfigBuilder;
    use crate::config::RetryPolicy;
    use crate::cpld::Cpld;
    use crate::registry::DeviceRegistry;
    use crate::sim::SimulatedBus;
    use crate::BusAddress;
    use crate::BusError;
    use crate::Error;
    use std::sync::Arc;
    use std::time::Duration;
    use switch_platform_decode::PortType;

    const PORT_BUS: u16 = 10;

    struct Fixture {
        bus: Arc<SimulatedBus>,
        cpld: BusAddress,
        module: BusAddress,
        registry: DeviceRegistry<Cpld>,
    }

    impl Fixture {
        fn new() -> Self {
            let log = slog::Logger::root(slog::Discard, slog::o!());
            let cpld = BusAddress::new(0, 0x60).unwrap();
            let module = BusAddress::new(PORT_BUS, 0x50).unwrap();
            let bus = Arc::new(SimulatedBus::new());
            // Port 2 present, nothing in reset.
            bus.set_bytes(cpld, 0x30, &[0xFB, 0xFF, 0xFF, 0xFF]);
            bus.set_bytes(cpld, 0x04, &[0xFF; 4]);
            bus.add_device(module);
            let client = BusClient::new(bus.clone(), cpld, RetryPolicy::once(), &log);
            let registry = DeviceRegistry::new(&log);
            registry.register(cpld, Arc::new(Cpld::new(client))).unwrap();
            Self {
                bus,
                cpld,
                module,
                registry,
            }
        }

        fn port(&self, index: u8, kind: SfpKind) -> SfpPort {
            let log = slog::Logger::root(slog::Discard, slog::o!());
            let config = ConfigBuilder::new()
                .eeprom_retry(RetryPolicy::new(3, Duration::ZERO))
                .qsfp_status_delay(Duration::ZERO)
                .build()
                .unwrap();
            SfpPort::attach(
                self.bus.clone(),
                &self.registry,
                self.cpld,
                index,
                PORT_BUS,
                kind,
                &config,
                &log,
            )
            .unwrap()
        }
    }

    #[test]
    fn test_port_number_is_one_based() {
        let f = Fixture::new();
        assert_eq!(f.port(2, SfpKind::Msa).port_number(), 3);
    }

    #[test]
    fn test_port_type_not_present() {
        let f = Fixture::new();
        let port = f.port(0, SfpKind::Msa);
        assert_eq!(port.port_type().unwrap(), PortType::NotPresent);
        assert!(matches!(port.read_eeprom(0, 1), Err(Error::NotPresent(0))));
    }

    #[test]
    fn test_sfp_port_type() {
        let f = Fixture::new();
        let port = f.port(2, SfpKind::Msa);
        f.bus.set_bytes(f.module, 0, &[0x03, 0x04, 0x07, 0x10]);
        assert_eq!(port.port_type().unwrap(), PortType::SfpPlus);
        f.bus.set_byte(f.module, 3, 0x00);
        assert_eq!(port.port_type().unwrap(), PortType::Sfp);
        f.bus.set_byte(f.module, 0, 0x11);
        assert_eq!(port.port_type().unwrap(), PortType::Invalid);
    }

    #[test]
    fn test_unreadable_module_is_invalid() {
        let f = Fixture::new();
        let port = f.port(2, SfpKind::Qsfp);
        f.bus.inject_persistent_fault(f.module, 0, BusError::Nack);
        assert_eq!(port.port_type().unwrap(), PortType::Invalid);
    }

    #[test]
    fn test_qsfp28_port_type() {
        let f = Fixture::new();
        let port = f.port(2, SfpKind::Qsfp);
        f.bus.set_byte(f.module, 0, 0x11);
        assert_eq!(port.port_type().unwrap(), PortType::Qsfp28);
        f.bus.set_byte(f.module, 0, 0x0d);
        assert_eq!(port.port_type().unwrap(), PortType::QsfpPlus);
    }

    #[test]
    fn test_ddm_implemented_on_sfp_cages() {
        let f = Fixture::new();
        f.bus.set_byte(f.module, 92, 0x68);
        assert!(f.port(2, SfpKind::Msa).ddm_implemented().unwrap());
        assert!(f.port(2, SfpKind::Ddm).ddm_implemented().unwrap());
        f.bus.set_byte(f.module, 92, 0x00);
        assert!(!f.port(2, SfpKind::Msa).ddm_implemented().unwrap());
        assert!(matches!(
            f.port(2, SfpKind::Qsfp).ddm_implemented(),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            f.port(2, SfpKind::Msa).read_diag(96, 2),
            Err(Error::Unsupported(_))
        ));

        let diag = BusAddress::new(PORT_BUS, 0x51).unwrap();
        f.bus.set_bytes(diag, 96, &[0x1a, 0x2b]);
        assert_eq!(
            f.port(2, SfpKind::Ddm).read_diag(96, 2).unwrap(),
            vec![0x1a, 0x2b]
        );
    }

    #[test]
    fn test_register_reads_are_retried() {
        let f = Fixture::new();
        let port = f.port(2, SfpKind::Ddm);
        f.bus.set_byte(f.module, 92, 0x68);
        f.bus.inject_fault(f.module, 92, BusError::Nack, 1);
        assert!(port.ddm_implemented().unwrap());
        assert_eq!(f.bus.read_count_at(f.module, 92), 2);

        let port = f.port(2, SfpKind::Qsfp);
        f.bus.set_byte(f.module, QSFP_TX_DISABLE, 0x00);
        f.bus.inject_fault(f.module, QSFP_TX_DISABLE, BusError::Nack, 2);
        port.set_tx_disable(Some(0), true).unwrap();
        assert_eq!(f.bus.byte(f.module, QSFP_TX_DISABLE), Some(0x01));
    }

    #[test]
    fn test_lane_status_reads_twice_and_caches() {
        let f = Fixture::new();
        let port = f.port(2, SfpKind::Qsfp);
        // Latched flags are reported by the first read only.
        f.bus.queue_bytes(f.module, QSFP_RX_LOS, &[0x0F]);
        f.bus.set_byte(f.module, QSFP_RX_LOS, 0x02);
        f.bus.set_byte(f.module, QSFP_TX_FAULT, 0xF1);
        f.bus.set_byte(f.module, QSFP_TX_DISABLE, 0x00);

        let status = port.lane_status().unwrap();
        assert_eq!(
            status,
            LaneStatus {
                tx_fault: 0x01,
                tx_disable: 0x00,
                rx_los: 0x02,
            }
        );
        assert_eq!(f.bus.read_count_at(f.module, QSFP_RX_LOS), 2);

        port.lane_status().unwrap();
        assert_eq!(f.bus.read_count_at(f.module, QSFP_RX_LOS), 2);
    }

    #[test]
    fn test_set_tx_disable() {
        let f = Fixture::new();
        let port = f.port(2, SfpKind::Qsfp);
        f.bus.set_byte(f.module, QSFP_TX_DISABLE, 0x30);

        port.set_tx_disable(Some(1), true).unwrap();
        assert_eq!(f.bus.byte(f.module, QSFP_TX_DISABLE), Some(0x32));
        assert_eq!(port.lane_status().unwrap().tx_disable, 0x02);

        port.set_tx_disable(None, true).unwrap();
        assert!(port.lane_status().unwrap().all_tx_disabled());

        port.set_tx_disable(None, false).unwrap();
        assert_eq!(f.bus.byte(f.module, QSFP_TX_DISABLE), Some(0x30));

        assert!(port.set_tx_disable(Some(4), true).is_err());
        assert!(matches!(
            f.port(2, SfpKind::Msa).set_tx_disable(None, true),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_lane_status_serdes() {
        let s = "{\"tx_fault\":1,\"tx_disable\":15,\"rx_los\":0}";
        let expected = LaneStatus {
            tx_fault: 0x01,
            tx_disable: 0x0F,
            rx_los: 0x00,
        };
        assert_eq!(expected, serde_json::from_str(s).unwrap());
        assert_eq!(serde_json::to_string(&expected).unwrap().as_str(), s);
        assert!(expected.all_tx_disabled());
    }

    #[test]
    fn test_reset_through_cpld() {
        let f = Fixture::new();
        let port = f.port(9, SfpKind::Qsfp);
        port.set_reset(true).unwrap();
        assert_eq!(f.bus.byte(f.cpld, 0x05), Some(0xFD));
        assert!(port.is_reset().unwrap());
    }

    #[test]
    fn test_vendor() {
        let f = Fixture::new();
        let port = f.port(2, SfpKind::Msa);
        let mut map = [b' '; 256];
        map[0] = 0x03;
        map[20..28].copy_from_slice(b"ACME    ");
        map[37..40].copy_from_slice(&[0xa8, 0x40, 0x25]);
        map[40..46].copy_from_slice(b"XR-10G");
        f.bus.set_bytes(f.module, 0, &map);
        let vendor = port.vendor().unwrap();
        assert_eq!(vendor.name, "ACME");
        assert_eq!(vendor.part, "XR-10G");
        assert_eq!(vendor.oui.to_string(), "a8-40-25");
    }
}
