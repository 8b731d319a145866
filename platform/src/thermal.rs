// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Fan speed control from board temperatures.

use crate::bmc::BmcSensors;
use crate::fan::FanTray;
use crate::Error;
use slog::debug;
use slog::info;
use slog::Logger;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

/// The duty cycle used whenever a fan has failed.
pub const MAX_DUTY: u32 = 100;

/// The duty cycle for each band of average temperature, in milli-degrees
/// Celsius. Both bounds are exclusive.
pub const FAN_POLICY: [(u32, i64, i64); 5] = [
    (52, 0, 43_000),
    (64, 43_000, 46_000),
    (76, 46_000, 52_000),
    (88, 52_000, 57_000),
    (MAX_DUTY, 57_000, i64::MAX),
];

/// Return the duty cycle for an average temperature, or `None` if it lies
/// in no band and the current duty should be kept.
pub fn duty_for_temperature(average: i64) -> Option<u32> {
    FAN_POLICY
        .iter()
        .rev()
        .find(|(_, low, high)| average > *low && average < *high)
        .map(|(duty, _, _)| *duty)
}

/// Something which reports temperatures in milli-degrees Celsius.
pub trait TempSource: Send + Sync {
    fn temperatures(&self) -> Result<Vec<i64>, Error>;
}

/// Temperatures read from hwmon `temp*_input` files.
#[derive(Clone, Debug)]
pub struct HwmonTempSource {
    paths: Vec<PathBuf>,
}

impl HwmonTempSource {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }

    /// Find every `temp*_input` file of the hwmon devices under `root`,
    /// usually `/sys/class/hwmon`.
    pub fn discover(root: impl AsRef<Path>) -> Result<Self, Error> {
        let mut paths = Vec::new();
        for device in std::fs::read_dir(root)? {
            let device = device?.path();
            let Ok(entries) = std::fs::read_dir(&device) else {
                continue;
            };
            for entry in entries {
                let path = entry?.path();
                let is_input = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("temp") && name.ends_with("_input"));
                if is_input {
                    paths.push(path);
                }
            }
        }
        paths.sort();
        Ok(Self { paths })
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl TempSource for HwmonTempSource {
    fn temperatures(&self) -> Result<Vec<i64>, Error> {
        self.paths
            .iter()
            .map(|path| {
                let text = std::fs::read_to_string(path)?;
                text.trim().parse::<i64>().map_err(|e| {
                    Error::InvalidArgument(format!("{}: {e}", path.display()))
                })
            })
            .collect()
    }
}

impl TempSource for BmcSensors {
    fn temperatures(&self) -> Result<Vec<i64>, Error> {
        self.thermals()
    }
}

/// Sets the fan tray's duty cycle from the average board temperature.
pub struct ThermalMonitor {
    fans: Arc<FanTray>,
    temps: Box<dyn TempSource>,
    log: Logger,
}

impl ThermalMonitor {
    pub fn new(fans: Arc<FanTray>, temps: Box<dyn TempSource>, log: &Logger) -> Self {
        let log = log.new(slog::o!("unit" => "thermal-monitor"));
        Self { fans, temps, log }
    }

    /// Evaluate the policy once, returning the duty cycle written, if it
    /// changed.
    pub fn step(&self) -> Result<Option<u32>, Error> {
        let current = self.fans.duty()?;
        let target = if self.fans.any_fault()? {
            Some(MAX_DUTY)
        } else {
            let temps = self.temps.temperatures()?;
            if temps.is_empty() {
                return Err(Error::InvalidConfig(String::from(
                    "no temperature sensors",
                )));
            }
            let average = temps.iter().sum::<i64>() / temps.len() as i64;
            debug!(self.log, "average temperature"; "millidegrees" => average);
            duty_for_temperature(average)
        };
        match target {
            Some(duty) if duty != current => {
                self.fans.set_duty(duty)?;
                info!(self.log, "changed fan duty"; "from" => current, "to" => duty);
                Ok(Some(duty))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::duty_for_temperature;
    use super::HwmonTempSource;
    use super::TempSource;
    use super::ThermalMonitor;
    use crate::bus::BusClient;
    use crate::config::RetryPolicy;
    use crate::fan::FanTray;
    use crate::sim::SimulatedBus;
    use crate::BusAddress;
    use crate::Error;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn test_duty_for_temperature() {
        assert_eq!(duty_for_temperature(30_000), Some(52));
        assert_eq!(duty_for_temperature(44_000), Some(64));
        assert_eq!(duty_for_temperature(50_000), Some(76));
        assert_eq!(duty_for_temperature(56_999), Some(88));
        assert_eq!(duty_for_temperature(80_000), Some(100));
        // Exactly on a boundary, or below freezing, keeps the current duty.
        assert_eq!(duty_for_temperature(43_000), None);
        assert_eq!(duty_for_temperature(-5_000), None);
    }

    struct FixedTemps(Mutex<Vec<i64>>);

    impl TempSource for FixedTemps {
        fn temperatures(&self) -> Result<Vec<i64>, Error> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    fn setup(temps: Vec<i64>) -> (Arc<SimulatedBus>, BusAddress, ThermalMonitor) {
        let log = slog::Logger::root(slog::Discard, slog::o!());
        let address = BusAddress::new(17, 0x68).unwrap();
        let bus = Arc::new(SimulatedBus::new());
        bus.set_byte(address, 0x87, 0x07);
        bus.set_bytes(address, 0x90, &[100; 4]);
        bus.set_bytes(address, 0x98, &[100; 4]);
        let client = BusClient::new(bus.clone(), address, RetryPolicy::once(), &log);
        let fans = Arc::new(FanTray::new(client, Duration::ZERO));
        let monitor = ThermalMonitor::new(fans, Box::new(FixedTemps(Mutex::new(temps))), &log);
        (bus, address, monitor)
    }

    #[test]
    fn test_monitor_writes_only_on_change() {
        let (bus, address, monitor) = setup(vec![44_000, 46_000, 44_500]);
        // 0x07 reads back as 52%.
        assert_eq!(monitor.step().unwrap(), Some(64));
        assert_eq!(bus.byte(address, 0x87), Some(0x09));
        let writes = bus.writes().len();
        assert_eq!(monitor.step().unwrap(), None);
        assert_eq!(bus.writes().len(), writes);
    }

    #[test]
    fn test_monitor_fan_fault_runs_full_speed() {
        let (bus, address, monitor) = setup(vec![30_000]);
        bus.set_byte(address, 0x9A, 0);
        assert_eq!(monitor.step().unwrap(), Some(100));
        assert_eq!(bus.byte(address, 0x87), Some(0x0F));
    }

    #[test]
    fn test_monitor_needs_sensors() {
        let (_bus, _address, monitor) = setup(vec![]);
        assert!(matches!(monitor.step(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_hwmon_discover() {
        let dir = tempfile::tempdir().unwrap();
        for (hwmon, files) in [
            ("hwmon0", &["temp1_input", "temp2_input", "name"][..]),
            ("hwmon1", &["temp1_input", "temp1_max"][..]),
        ] {
            let device = dir.path().join(hwmon);
            std::fs::create_dir(&device).unwrap();
            for (i, file) in files.iter().enumerate() {
                std::fs::write(device.join(file), format!("{}\n", 40_000 + i * 1000)).unwrap();
            }
        }
        let source = HwmonTempSource::discover(dir.path()).unwrap();
        assert_eq!(source.paths().len(), 3);
        assert_eq!(source.temperatures().unwrap(), vec![40_000, 41_000, 40_000]);
    }

    #[test]
    fn test_hwmon_bad_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp1_input");
        std::fs::write(&path, "hot\n").unwrap();
        let source = HwmonTempSource::new(vec![path]);
        assert!(matches!(
            source.temperatures(),
            Err(Error::InvalidArgument(_))
        ));
    }
}
