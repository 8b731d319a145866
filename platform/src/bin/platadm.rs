// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use itertools::Itertools;
use slog::info;
use slog::warn;
use slog::Drain;
use slog::Level;
use slog::Logger;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use switch_platform::bmc::BmcChannel;
use switch_platform::bmc::BmcSensors;
use switch_platform::bus::RegisterBus;
use switch_platform::config::BmcConfigBuilder;
use switch_platform::config::RetryPolicy;
use switch_platform::fan::FAN_TRAY_ADDRESS;
use switch_platform::fan::FAN_TRAY_BUS;
use switch_platform::psu::PsuFan;
use switch_platform::results::FailedPorts;
use switch_platform::serial::TtyOpener;
use switch_platform::sfp::SfpKind;
use switch_platform::sim::SimulatedBus;
use switch_platform::thermal::HwmonTempSource;
use switch_platform::thermal::TempSource;
use switch_platform::thermal::ThermalMonitor;
use switch_platform::BusAddress;
use switch_platform::ConfigBuilder;
use switch_platform::LedKind;
use switch_platform::LedMode;
use switch_platform::Platform;
use switch_platform::PortMask;
use switch_platform_types::MemoryRead;
use tabled::Table;
use tabled::Tabled;

fn parse_log_level(s: &str) -> Result<Level, String> {
    s.parse().map_err(|_| String::from("invalid log level"))
}

/// Administer the board devices of an Accton/Edgecore switch.
///
/// This tool talks to the port CPLD, transceiver modules, power supplies and
/// fan tray over the host's I2C adapters, and to the sensors behind the BMC
/// over its serial console.
#[derive(Parser)]
#[command(version, about, long_about)]
struct Args {
    #[command(subcommand)]
    cmd: Cmd,

    /// The port CPLD, as `<bus>-<address>`.
    #[arg(short, long, default_value = "0-0060")]
    cpld: BusAddress,

    /// The comma-separated list of CPLD port indices to address.
    ///
    /// The default is all ports.
    #[arg(short, long, use_value_delimiter = true)]
    ports: Option<Vec<u8>>,

    /// The I2C bus of the module in port 0. Each port's module sits on the
    /// next bus.
    #[arg(long, default_value_t = 18)]
    port_bus_base: u16,

    /// The kind of transceiver cage on every port.
    #[arg(long, value_enum, default_value_t = CageKind::Qsfp)]
    port_kind: CageKind,

    /// The maximum number of attempts for each register access.
    #[arg(
        short,
        long,
        default_value_t = 3,
        value_parser = clap::value_parser!(u32).range(1..=10)
    )]
    attempts: u32,

    /// Run against a simulated board instead of the host's I2C adapters.
    #[arg(long)]
    simulate: bool,

    /// The log-level.
    #[arg(
        short,
        long,
        default_value_t = Level::Info,
        value_parser = parse_log_level
    )]
    log_level: Level,
}

#[derive(Clone, Copy, ValueEnum)]
enum CageKind {
    Sfp,
    SfpDdm,
    Qsfp,
}

impl From<CageKind> for SfpKind {
    fn from(k: CageKind) -> Self {
        match k {
            CageKind::Sfp => SfpKind::Msa,
            CageKind::SfpDdm => SfpKind::Ddm,
            CageKind::Qsfp => SfpKind::Qsfp,
        }
    }
}

#[derive(Subcommand)]
enum Cmd {
    /// Access the port CPLD directly.
    Cpld {
        #[command(subcommand)]
        cmd: CpldCmd,
    },

    /// Read or set the front-panel LEDs.
    Led {
        #[command(subcommand)]
        cmd: LedCmd,
    },

    /// Operate on the addressed transceiver ports.
    Port {
        #[command(subcommand)]
        cmd: PortCmd,
    },

    /// Read or control the fan tray.
    Fan {
        #[command(subcommand)]
        cmd: FanCmd,
    },

    /// Report the telemetry of a power supply.
    Psu {
        /// The power supply, as `<bus>-<address>`.
        #[arg(default_value = "10-003c")]
        address: BusAddress,
    },

    /// Report the sensors read through the BMC console.
    Bmc {
        /// The console's character device.
        #[arg(long, default_value = "/dev/ttyACM0")]
        tty: PathBuf,
    },

    /// Run the thermal fan policy.
    Monitor {
        /// The directory holding the hwmon devices.
        #[arg(long, default_value = "/sys/class/hwmon")]
        hwmon: PathBuf,

        /// Read temperatures through the BMC console on this device,
        /// instead of from hwmon.
        #[arg(long)]
        bmc_tty: Option<PathBuf>,

        /// Seconds between evaluations of the policy.
        #[arg(long)]
        interval: Option<u64>,

        /// Stop after this many evaluations.
        #[arg(long)]
        iterations: Option<u64>,
    },
}

#[derive(Subcommand)]
enum CpldCmd {
    /// Print the CPLD firmware version.
    Version,
    /// Print the presence bitmap, port 1 first.
    Presence,
    /// Print the ports held in reset.
    Resets,
    /// Write a register, given as `0x<register> 0x<value>`.
    Access { command: String },
}

#[derive(Subcommand)]
enum LedCmd {
    /// Print the mode of every LED.
    Get,
    /// Set the mode of one LED.
    Set {
        #[arg(value_enum)]
        kind: LedKind,
        #[arg(value_enum)]
        mode: LedMode,
    },
}

#[derive(Subcommand)]
enum PortCmd {
    /// Print presence and reset state.
    Status,
    /// Classify the seated modules.
    Type,
    /// Print vendor information.
    Vendor,
    /// Read the serial ID EEPROM.
    Read { offset: u8, len: u16 },
    /// Pulse reset.
    Reset,
    /// Print QSFP per-lane status.
    Lanes,
    /// Disable, or with `--enable` enable, QSFP transmitters.
    TxDisable {
        /// The lane to change. The default is every lane.
        #[arg(long)]
        lane: Option<u8>,
        #[arg(long)]
        enable: bool,
    },
}

#[derive(Subcommand)]
enum FanCmd {
    /// Print the state of every fan.
    Status,
    /// Set the duty cycle of every fan, in percent.
    Duty { duty: u32 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = slog::LevelFilter::new(drain, args.log_level).fuse();
    let log = slog::Logger::root(drain, slog::o!());

    let config = ConfigBuilder::new()
        .bus_retry(RetryPolicy::new(args.attempts, Duration::from_millis(10)))
        .build()?;
    let bus = open_bus(&args)?;
    let mut platform = Platform::new(config, bus, log.clone());
    platform
        .attach_cpld(args.cpld)
        .context("failed to attach port CPLD")?;

    let ports = match &args.ports {
        Some(ix) => PortMask::from_indices(ix)?,
        None => PortMask::all(),
    };
    for index in ports.to_indices() {
        platform.attach_port(
            args.cpld,
            index,
            args.port_bus_base + u16::from(index),
            args.port_kind.into(),
        )?;
    }

    match args.cmd {
        Cmd::Cpld { cmd } => {
            let cpld = platform.cplds().find(args.cpld)?;
            match cmd {
                CpldCmd::Version => println!("0x{:02x}", cpld.version()?),
                CpldCmd::Presence => println!("{}", cpld.present_all()?),
                CpldCmd::Resets => {
                    println!("{}", cpld.resets()?.to_indices().join(","));
                }
                CpldCmd::Access { command } => cpld.access(&command)?,
            }
        }
        Cmd::Led { cmd } => {
            let leds = platform.leds(args.cpld)?;
            match cmd {
                LedCmd::Get => {
                    let rows = leds.get_all()?.into_iter().map(|(kind, mode)| LedRow {
                        led: kind.to_string(),
                        mode: mode.to_string(),
                    });
                    println!("{}", Table::new(rows));
                }
                LedCmd::Set { kind, mode } => leds.set(kind, mode)?,
            }
        }
        Cmd::Port { cmd } => port_cmd(&platform, ports, cmd)?,
        Cmd::Fan { cmd } => {
            let address = BusAddress::new(FAN_TRAY_BUS, FAN_TRAY_ADDRESS)?;
            let tray = platform.fan_tray(address);
            match cmd {
                FanCmd::Status => {
                    let rows = tray.status_all()?.into_iter().map(|s| FanRow {
                        fan: s.fan,
                        present: s.present,
                        direction: s.direction.to_string(),
                        front_rpm: s.front_rpm,
                        rear_rpm: s.rear_rpm,
                        fault: s.fault,
                    });
                    println!("{}", Table::new(rows));
                    println!("duty: {}%", tray.duty()?);
                }
                FanCmd::Duty { duty } => tray.set_duty(duty)?,
            }
        }
        Cmd::Psu { address } => {
            let psu = platform.psu(address)?;
            let r = psu.reading()?;
            let rows = vec![
                SensorRow::new("vin", r.vin, "mV"),
                SensorRow::new("vout", r.vout, "mV"),
                SensorRow::new("iin", r.iin, "mA"),
                SensorRow::new("iout", r.iout, "mA"),
                SensorRow::new("pin", r.pin, "mW"),
                SensorRow::new("pout", r.pout, "mW"),
                SensorRow::new("temp1", r.temp1, "m°C"),
                SensorRow::new("temp2", r.temp2, "m°C"),
                SensorRow::new("fan1 speed", psu.fan_speed(PsuFan::Fan1)?, "RPM"),
                SensorRow::new("fan1 duty", psu.fan_duty(PsuFan::Fan1)?, "%"),
            ];
            println!("{}", Table::new(rows));
            if r.fan1_fault || r.fan2_fault {
                warn!(log, "PSU fan fault"; "fan1" => r.fan1_fault, "fan2" => r.fan2_fault);
            }
        }
        Cmd::Bmc { tty } => {
            let sensors = open_bmc(tty, &platform, &log)?;
            let mut rows = Vec::new();
            for (i, t) in sensors.thermals()?.into_iter().enumerate() {
                rows.push(SensorRow::new(&format!("thermal{}", i + 1), t, "m°C"));
            }
            let fans = sensors.fans_upper()?.into_iter().chain(sensors.fans_lower()?);
            for (i, rpm) in fans.enumerate() {
                rows.push(SensorRow::new(&format!("fan{}", i + 1), rpm, "RPM"));
            }
            for psu in [1, 2] {
                let r = sensors.psu(psu)?;
                for (name, value, unit) in [
                    ("vin", r.vin, "mV"),
                    ("vout", r.vout, "mV"),
                    ("iin", r.iin, "mA"),
                    ("iout", r.iout, "mA"),
                    ("pin", r.pin, "uW"),
                    ("pout", r.pout, "uW"),
                ] {
                    rows.push(SensorRow::new(&format!("psu{psu} {name}"), value, unit));
                }
            }
            println!("{}", Table::new(rows));
        }
        Cmd::Monitor {
            hwmon,
            bmc_tty,
            interval,
            iterations,
        } => {
            let temps: Box<dyn TempSource> = match bmc_tty {
                Some(tty) => Box::new(open_bmc(tty, &platform, &log)?),
                None => Box::new(HwmonTempSource::discover(&hwmon).with_context(|| {
                    format!("failed to find hwmon sensors in {}", hwmon.display())
                })?),
            };
            let address = BusAddress::new(FAN_TRAY_BUS, FAN_TRAY_ADDRESS)?;
            let tray = Arc::new(platform.fan_tray(address));
            let period = interval
                .map(Duration::from_secs)
                .unwrap_or(platform.config().monitor_interval);
            let monitor = ThermalMonitor::new(tray, temps, &log);
            run_monitor(monitor, period, iterations, &log).await?;
        }
    }
    Ok(())
}

fn open_bus(args: &Args) -> anyhow::Result<Arc<dyn RegisterBus>> {
    if args.simulate {
        return Ok(Arc::new(simulated_board(args)?));
    }
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(switch_platform::i2cdev::I2cDevBus::new()))
    }
    #[cfg(not(target_os = "linux"))]
    {
        anyhow::bail!("I2C adapters are only supported on Linux, use --simulate")
    }
}

fn open_bmc(tty: PathBuf, platform: &Platform, log: &Logger) -> anyhow::Result<BmcSensors> {
    let config = BmcConfigBuilder::new().path(&tty).build()?;
    let channel = BmcChannel::new(Box::new(TtyOpener::new(tty)), config, log);
    Ok(BmcSensors::new(
        channel,
        platform.config().bmc_refresh_interval,
    ))
}

async fn run_monitor(
    monitor: ThermalMonitor,
    period: Duration,
    iterations: Option<u64>,
    log: &Logger,
) -> anyhow::Result<()> {
    let monitor = Arc::new(monitor);
    let mut interval = tokio::time::interval(period);
    let mut count = 0;
    loop {
        interval.tick().await;
        let m = monitor.clone();
        match tokio::task::spawn_blocking(move || m.step()).await? {
            Ok(Some(duty)) => info!(log, "fan duty changed"; "duty" => duty),
            Ok(None) => {}
            Err(e) => warn!(log, "thermal policy failed"; "reason" => %e),
        }
        count += 1;
        if iterations.is_some_and(|n| count >= n) {
            return Ok(());
        }
    }
}

// A board with a QSFP28 module in port 0, four healthy fans, and one power
// supply.
fn simulated_board(args: &Args) -> anyhow::Result<SimulatedBus> {
    let bus = SimulatedBus::new();
    let cpld = args.cpld;
    bus.set_byte(cpld, 0x01, 0x0a);
    bus.set_bytes(cpld, 0x30, &[0xFE, 0xFF, 0xFF, 0xFF]);
    bus.set_bytes(cpld, 0x04, &[0xFF; 4]);

    for index in 0..switch_platform_types::NUM_PORTS {
        bus.add_device(BusAddress::new(args.port_bus_base + u16::from(index), 0x50)?);
    }
    let module = BusAddress::new(args.port_bus_base, 0x50)?;
    let mut map = vec![0x20u8; 256];
    map[..128].fill(0);
    map[0] = 0x11;
    map[128] = 0x11;
    map[148..152].copy_from_slice(b"ACME");
    map[165..168].copy_from_slice(&[0xa8, 0x40, 0x25]);
    map[168..176].copy_from_slice(b"QSFP-100");
    map[184..186].copy_from_slice(b"A0");
    map[196..204].copy_from_slice(b"SN000001");
    map[212..220].copy_from_slice(b"230101  ");
    bus.set_bytes(module, 0, &map);

    let fans = BusAddress::new(FAN_TRAY_BUS, FAN_TRAY_ADDRESS)?;
    bus.set_byte(fans, 0x80, 0x00);
    bus.set_byte(fans, 0x81, 0x00);
    bus.set_byte(fans, 0x87, 0x07);
    bus.set_bytes(fans, 0x90, &[120; 4]);
    bus.set_bytes(fans, 0x98, &[100; 4]);

    let psu = BusAddress::new(10, 0x3c)?;
    bus.set_byte(psu, 0x20, 0x17);
    bus.set_word(psu, 0x88, 0xF398);
    bus.set_word(psu, 0x89, 0xF00A);
    bus.set_word(psu, 0x8b, 0x1800);
    bus.set_word(psu, 0x8c, 0xF00C);
    bus.set_word(psu, 0x8d, 0xE0A0);
    bus.set_word(psu, 0x8e, 0xE0B0);
    bus.set_word(psu, 0x90, 0x1C65);
    bus.set_word(psu, 0x3b, 0x0032);
    bus.set_word(psu, 0x96, 0x0A58);
    bus.set_word(psu, 0x97, 0x0A70);
    Ok(bus)
}

#[derive(Tabled)]
struct LedRow {
    led: String,
    mode: String,
}

#[derive(Tabled)]
struct FanRow {
    fan: u8,
    present: bool,
    direction: String,
    front_rpm: u32,
    rear_rpm: u32,
    fault: bool,
}

#[derive(Tabled)]
struct SensorRow {
    sensor: String,
    value: i64,
    unit: String,
}

impl SensorRow {
    fn new(sensor: &str, value: i64, unit: &str) -> Self {
        Self {
            sensor: sensor.to_string(),
            value,
            unit: unit.to_string(),
        }
    }
}

#[derive(Tabled)]
struct PortRow {
    port: u16,
    data: String,
}

fn print_ports<T>(ports: PortMask, data: Vec<T>, f: impl Fn(T) -> String) {
    let rows = ports.to_indices().zip(data).map(|(ix, item)| PortRow {
        port: switch_platform_types::port::front_port_number(ix),
        data: f(item),
    });
    println!("{}", Table::new(rows));
}

fn print_failures(failures: &FailedPorts) {
    for (ix, e) in failures.iter() {
        eprintln!(
            "port {}: {e}",
            switch_platform_types::port::front_port_number(ix)
        );
    }
}

fn port_cmd(platform: &Platform, ports: PortMask, cmd: PortCmd) -> anyhow::Result<()> {
    match cmd {
        PortCmd::Status => {
            let r = platform.status(ports);
            print_ports(r.ports, r.data, |s| s.to_string());
            print_failures(&r.failures);
        }
        PortCmd::Type => {
            let r = platform.port_type(ports);
            print_ports(r.ports, r.data, |t| t.to_string());
            print_failures(&r.failures);
        }
        PortCmd::Vendor => {
            let r = platform.vendor(ports);
            print_ports(r.ports, r.data, |v| v.to_string());
            print_failures(&r.failures);
        }
        PortCmd::Read { offset, len } => {
            let read = MemoryRead::new(offset, len)?;
            let r = platform.read(ports, read);
            print_ports(r.ports, r.data, |bytes| {
                bytes.iter().map(|b| format!("{b:02x}")).join(" ")
            });
            print_failures(&r.failures);
        }
        PortCmd::Reset => print_failures(&platform.reset(ports).failures),
        PortCmd::Lanes => {
            let r = platform.lane_status(ports);
            print_ports(r.ports, r.data, |l| {
                format!(
                    "tx_fault={:04b} tx_disable={:04b} rx_los={:04b}",
                    l.tx_fault, l.tx_disable, l.rx_los
                )
            });
            print_failures(&r.failures);
        }
        PortCmd::TxDisable { lane, enable } => {
            print_failures(&platform.set_tx_disable(ports, lane, !enable).failures)
        }
    }
    Ok(())
}
