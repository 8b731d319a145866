// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! The devices of one switch, and operations over sets of its ports.

use crate::bus::BusClient;
use crate::bus::RegisterBus;
use crate::cpld::Cpld;
use crate::fan::FanTray;
use crate::led::Leds;
use crate::mux::CpldModel;
use crate::mux::CpldMux;
use crate::psu::Psu;
use crate::registry::DeviceRegistry;
use crate::results::AckResult;
use crate::results::PortResult;
use crate::results::PortTypeResult;
use crate::results::ReadResult;
use crate::results::StatusResult;
use crate::results::VendorResult;
use crate::sfp::LaneStatus;
use crate::sfp::SfpKind;
use crate::sfp::SfpPort;
use crate::BusAddress;
use crate::Config;
use crate::Error;
use crate::PortMask;
use slog::debug;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use switch_platform_types::MemoryRead;

/// How long a module is held in reset by [`Platform::reset`].
///
/// SFF-8679 requires `ResetL` to be held for at least `t_reset_init`, 10us.
pub const T_RESET_INIT: Duration = Duration::from_micros(10);

/// The result of reading the lane status of a set of QSFP ports.
pub type LaneStatusResult = PortResult<LaneStatus>;

/// The board devices of a switch, all reached through one register bus.
pub struct Platform {
    config: Config,
    bus: Arc<dyn RegisterBus>,
    cplds: DeviceRegistry<Cpld>,
    muxes: DeviceRegistry<CpldMux>,
    ports: BTreeMap<u8, SfpPort>,
    log: Logger,
}

impl core::fmt::Debug for Platform {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Platform")
            .field("config", &self.config)
            .field("cplds", &self.cplds.addresses())
            .field("ports", &self.attached_ports())
            .finish_non_exhaustive()
    }
}

impl Platform {
    /// Create a platform with no devices attached.
    pub fn new(config: Config, bus: Arc<dyn RegisterBus>, log: Logger) -> Self {
        if let Err(e) = usdt::register_probes() {
            warn!(log, "failed to register DTrace probes"; "reason" => ?e);
        }
        let cplds = DeviceRegistry::new(&log.new(slog::o!("registry" => "cpld")));
        let muxes = DeviceRegistry::new(&log.new(slog::o!("registry" => "mux")));
        Self {
            config,
            bus,
            cplds,
            muxes,
            ports: BTreeMap::new(),
            log,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &Arc<dyn RegisterBus> {
        &self.bus
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn cplds(&self) -> &DeviceRegistry<Cpld> {
        &self.cplds
    }

    fn client(&self, address: BusAddress) -> BusClient {
        BusClient::new(self.bus.clone(), address, self.config.bus_retry, &self.log)
    }

    /// Bind the port CPLD at `address`, making it visible to the LEDs and
    /// transceiver cages.
    pub fn attach_cpld(&self, address: BusAddress) -> Result<Arc<Cpld>, Error> {
        let cpld = Arc::new(Cpld::new(self.client(address)));
        self.cplds.register(address, cpld.clone())?;
        debug!(self.log, "attached CPLD"; "address" => %address);
        Ok(cpld)
    }

    /// Release the CPLD at `address`.
    ///
    /// Cages and LEDs already attached keep their reference to it.
    pub fn detach_cpld(&self, address: BusAddress) -> Result<(), Error> {
        let cpld = self.cplds.find(address)?;
        self.cplds.unregister(&cpld)
    }

    /// Bind a channel multiplexer CPLD at `address`.
    pub fn attach_mux(
        &self,
        address: BusAddress,
        model: CpldModel,
    ) -> Result<Arc<CpldMux>, Error> {
        let mux = Arc::new(CpldMux::new(self.client(address), model));
        self.muxes.register(address, mux.clone())?;
        Ok(mux)
    }

    pub fn mux(&self, address: BusAddress) -> Result<Arc<CpldMux>, Error> {
        self.muxes.find(address)
    }

    /// Return the LEDs of the CPLD at `cpld`.
    pub fn leds(&self, cpld: BusAddress) -> Result<Leds, Error> {
        Leds::attach(
            &self.cplds,
            cpld,
            self.config.refresh_interval,
            self.config.refresh_policy,
            &self.log,
        )
    }

    pub fn fan_tray(&self, address: BusAddress) -> FanTray {
        FanTray::new(self.client(address), self.config.refresh_interval)
    }

    pub fn psu(&self, address: BusAddress) -> Result<Psu, Error> {
        Psu::new(self.client(address), self.config.refresh_interval)
    }

    /// Attach the cage at CPLD port `index`, whose module sits on bus
    /// `port_bus`.
    pub fn attach_port(
        &mut self,
        cpld: BusAddress,
        index: u8,
        port_bus: u16,
        kind: SfpKind,
    ) -> Result<(), Error> {
        if self.ports.contains_key(&index) {
            return Err(Error::InvalidArgument(format!(
                "port {index} is already attached"
            )));
        }
        let port = SfpPort::attach(
            self.bus.clone(),
            &self.cplds,
            cpld,
            index,
            port_bus,
            kind,
            &self.config,
            &self.log,
        )?;
        self.ports.insert(index, port);
        Ok(())
    }

    /// Return the mask of attached ports.
    pub fn attached_ports(&self) -> PortMask {
        let mut mask = PortMask::empty();
        for index in self.ports.keys() {
            // Cages are only attached at valid indices.
            let _ = mask.set(*index);
        }
        mask
    }

    /// Return the cage at port `index`.
    pub fn port(&self, index: u8) -> Result<&SfpPort, Error> {
        self.ports.get(&index).ok_or_else(|| {
            Error::InvalidArgument(format!("no transceiver cage attached at port {index}"))
        })
    }

    /// Report the CPLD status of a set of ports.
    pub fn status(&self, ports: PortMask) -> StatusResult {
        PortResult::collect(ports, |ix| self.port(ix)?.status())
    }

    /// Classify the modules in a set of ports.
    pub fn port_type(&self, ports: PortMask) -> PortTypeResult {
        PortResult::collect(ports, |ix| self.port(ix)?.port_type())
    }

    /// Read a region of the EEPROM of a set of ports.
    pub fn read(&self, ports: PortMask, read: MemoryRead) -> ReadResult {
        PortResult::collect(ports, |ix| {
            self.port(ix)?.read_eeprom(read.offset(), read.len())
        })
    }

    /// Write `data` to the EEPROM of each of a set of ports.
    pub fn write(&self, ports: PortMask, offset: u8, data: &[u8]) -> AckResult {
        PortResult::collect(ports, |ix| {
            let written = self.port(ix)?.write_eeprom(offset, data)?;
            if written == data.len() {
                Ok(())
            } else {
                Err(Error::InvalidArgument(format!(
                    "wrote {written} of {} bytes",
                    data.len()
                )))
            }
        })
    }

    /// Read the vendor information of a set of ports.
    pub fn vendor(&self, ports: PortMask) -> VendorResult {
        PortResult::collect(ports, |ix| self.port(ix)?.vendor())
    }

    /// Read the lane status of a set of QSFP ports.
    pub fn lane_status(&self, ports: PortMask) -> LaneStatusResult {
        PortResult::collect(ports, |ix| self.port(ix)?.lane_status())
    }

    /// Disable or enable transmitters on a set of QSFP ports.
    ///
    /// With `lane` as `None`, every lane of each port is changed.
    pub fn set_tx_disable(&self, ports: PortMask, lane: Option<u8>, disable: bool) -> AckResult {
        PortResult::collect(ports, |ix| self.port(ix)?.set_tx_disable(lane, disable))
    }

    pub fn assert_reset(&self, ports: PortMask) -> AckResult {
        PortResult::collect(ports, |ix| self.port(ix)?.set_reset(true))
    }

    pub fn deassert_reset(&self, ports: PortMask) -> AckResult {
        PortResult::collect(ports, |ix| self.port(ix)?.set_reset(false))
    }

    /// Pulse reset on a set of ports.
    ///
    /// Ports which fail to enter reset are not released from it.
    pub fn reset(&self, ports: PortMask) -> AckResult {
        let AckResult {
            ports, failures, ..
        } = self.assert_reset(ports);
        std::thread::sleep(T_RESET_INIT);
        let AckResult {
            ports,
            failures: new_failures,
            ..
        } = self.deassert_reset(ports);
        AckResult::ack(ports, failures.merge(&new_failures))
    }
}

#[cfg(test)]
mod tests {
    use super::Platform;
    use crate::config::ConfigBuilder;
    use crate::config::RetryPolicy;
    use crate::mux::CpldModel;
    use crate::sfp::SfpKind;
    use crate::sim::SimulatedBus;
    use crate::BusAddress;
    use crate::Error;
    use crate::PortError;
    use crate::PortMask;
    use std::sync::Arc;
    use std::time::Duration;
    use switch_platform_decode::PortType;
    use switch_platform_types::MemoryRead;
    use switch_platform_types::PortStatus;

    const CPLD: BusAddress = match BusAddress::new(0, 0x60) {
        Ok(a) => a,
        Err(_) => panic!(),
    };

    // Ports 0 and 1 are attached. Only port 1 holds a module, a QSFP28.
    fn setup() -> (Arc<SimulatedBus>, Platform) {
        let log = slog::Logger::root(slog::Discard, slog::o!());
        let bus = Arc::new(SimulatedBus::new());
        bus.set_bytes(CPLD, 0x30, &[0xFD, 0xFF, 0xFF, 0xFF]);
        bus.set_bytes(CPLD, 0x04, &[0xFF; 4]);
        let module = BusAddress::new(11, 0x50).unwrap();
        let mut map = vec![0u8; 256];
        map[0] = 0x11;
        bus.set_bytes(module, 0, &map);
        bus.add_device(BusAddress::new(10, 0x50).unwrap());

        let config = ConfigBuilder::new()
            .bus_retry(RetryPolicy::once())
            .eeprom_retry(RetryPolicy::once())
            .qsfp_status_delay(Duration::ZERO)
            .build()
            .unwrap();
        let mut platform = Platform::new(config, bus.clone(), log);
        platform.attach_cpld(CPLD).unwrap();
        platform.attach_port(CPLD, 0, 10, SfpKind::Qsfp).unwrap();
        platform.attach_port(CPLD, 1, 11, SfpKind::Qsfp).unwrap();
        (bus, platform)
    }

    #[test]
    fn test_attach() {
        let (_bus, mut platform) = setup();
        assert_eq!(platform.attached_ports(), PortMask(0b11));
        assert!(matches!(
            platform.attach_cpld(CPLD),
            Err(Error::AddressInUse(_))
        ));
        assert!(platform.attach_port(CPLD, 1, 11, SfpKind::Qsfp).is_err());
        let other = BusAddress::new(0, 0x61).unwrap();
        assert!(matches!(
            platform.attach_port(other, 2, 12, SfpKind::Msa),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_status() {
        let (_bus, platform) = setup();
        let result = platform.status(PortMask(0b11));
        assert_eq!(result.ports, PortMask(0b11));
        assert!(!result.data[0].contains(PortStatus::PRESENT));
        assert!(result.data[1].contains(PortStatus::PRESENT));
        assert!(result.failures.ports.is_empty());
    }

    #[test]
    fn test_port_type_reports_empty_cage() {
        let (_bus, platform) = setup();
        let result = platform.port_type(PortMask(0b11));
        assert_eq!(result.data, vec![PortType::NotPresent, PortType::Qsfp28]);
    }

    #[test]
    fn test_read_collects_failures() {
        let (_bus, platform) = setup();
        let result = platform.read(PortMask(0b111), MemoryRead::new(0, 1).unwrap());
        assert_eq!(result.ports, PortMask(0b10));
        assert_eq!(result.data, vec![vec![0x11]]);
        assert_eq!(result.failures.ports, PortMask(0b101));
        assert_eq!(result.failures.nth(0), Some(&PortError::NotPresent));
        assert!(matches!(result.failures.nth(2), Some(PortError::Failed(_))));
    }

    #[test]
    fn test_reset_pulses_each_port() {
        let (bus, platform) = setup();
        let result = platform.reset(PortMask(0b10));
        assert_eq!(result.ports, PortMask(0b10));
        assert!(result.failures.ports.is_empty());
        let resets: Vec<_> = bus
            .writes()
            .into_iter()
            .filter(|(address, register, _)| *address == CPLD && *register == 0x04)
            .map(|(_, _, value)| value)
            .collect();
        assert_eq!(resets, vec![vec![0xFD], vec![0xFF]]);
    }

    #[test]
    fn test_set_tx_disable() {
        let (bus, platform) = setup();
        let module = BusAddress::new(11, 0x50).unwrap();
        let result = platform.set_tx_disable(PortMask(0b10), Some(2), true);
        assert!(result.failures.ports.is_empty());
        assert_eq!(bus.byte(module, 86), Some(0b0100));
        let status = platform.lane_status(PortMask(0b10));
        assert_eq!(status.data[0].tx_disable, 0b0100);
    }

    #[test]
    fn test_detach_cpld_keeps_ports() {
        let (_bus, platform) = setup();
        platform.detach_cpld(CPLD).unwrap();
        assert!(platform.cplds().is_empty());
        assert_eq!(platform.status(PortMask(0b10)).ports, PortMask(0b10));
        assert!(platform.leds(CPLD).is_err());
    }

    #[test]
    fn test_mux_registry() {
        let (_bus, platform) = setup();
        let address = BusAddress::new(0, 0x62).unwrap();
        platform.attach_mux(address, CpldModel::Cpld2).unwrap();
        assert!(platform.mux(address).is_ok());
        assert!(platform.attach_mux(address, CpldModel::Cpld2).is_err());
    }
}
