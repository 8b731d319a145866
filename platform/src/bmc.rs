// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Sensors read through the BMC's serial console.
//!
//! On the Wedge100BF the thermal sensors, fan tachometers and power supplies
//! hang off the BMC, and the host reaches them by logging in to the BMC's
//! shell and running commands. Each transaction opens the console, logs in
//! if needed, runs one command and closes the console again.

use crate::cache::CachedSnapshot;
use crate::cache::RefreshPolicy;
use crate::config::BmcConfig;
use crate::probes;
use crate::serial::SerialOpener;
use crate::serial::SerialPort;
use crate::serial::SessionError;
use crate::Error;
use slog::debug;
use slog::trace;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;
use switch_platform_decode::pmbus;
use switch_platform_decode::pmbus::MICRO;
use switch_platform_decode::pmbus::MILLI;
use switch_platform_decode::text;

/// The number of thermal sensors visible to the BMC.
pub const THERMAL_COUNT: usize = 8;

/// The number of fan tachometers on each of the two fan boards.
pub const FAN_COUNT: usize = 10;

pub const PMBUS_READ_VIN: u8 = 0x88;
pub const PMBUS_READ_IIN: u8 = 0x89;
pub const PMBUS_READ_VOUT: u8 = 0x8b;
pub const PMBUS_READ_IOUT: u8 = 0x8c;
pub const PMBUS_READ_POUT: u8 = 0x96;
pub const PMBUS_READ_PIN: u8 = 0x97;

/// The first and last registers of the PSU register dump.
pub const PMBUS_DUMP_START: u8 = PMBUS_READ_VIN;
pub const PMBUS_DUMP_END: u8 = PMBUS_READ_PIN;

/// The registers kept from a PSU dump.
pub const PSU_REGISTERS: [u8; 6] = [
    PMBUS_READ_VIN,
    PMBUS_READ_VOUT,
    PMBUS_READ_IIN,
    PMBUS_READ_IOUT,
    PMBUS_READ_PIN,
    PMBUS_READ_POUT,
];

/// The state of a console session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelState {
    Closed,
    Opening,
    Configuring,
    LoginChallenge,
    Authenticating,
    Ready,
    Transacting,
}

/// A command run on the BMC to read one group of sensors.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum BmcCommand {
    Thermal,
    FanUpper,
    FanLower,
    Psu1,
    Psu2,
}

impl BmcCommand {
    /// The shell command, without its line terminator.
    pub const fn command(&self) -> &'static str {
        match self {
            BmcCommand::Thermal => "cat /sys/bus/i2c/drivers/*/*/temp*_input",
            BmcCommand::FanUpper => "cat /sys/bus/i2c/devices/8-0033/fan*_input",
            BmcCommand::FanLower => "cat /sys/bus/i2c/devices/9-0033/fan*_input",
            BmcCommand::Psu1 => "i2cset -y 7 0x70 0 2; i2cdump -y -r 0x88-0x97 7 0x59 w",
            BmcCommand::Psu2 => "i2cset -y 7 0x70 0 1; i2cdump -y -r 0x88-0x97 7 0x5a w",
        }
    }

    /// The number of values the command's output must contain.
    pub const fn value_count(&self) -> usize {
        match self {
            BmcCommand::Thermal => THERMAL_COUNT,
            BmcCommand::FanUpper | BmcCommand::FanLower => FAN_COUNT,
            BmcCommand::Psu1 | BmcCommand::Psu2 => {
                (PMBUS_DUMP_END - PMBUS_DUMP_START) as usize + 1
            }
        }
    }
}

/// The serial console of the BMC.
pub struct BmcChannel {
    opener: Box<dyn SerialOpener>,
    config: BmcConfig,
    // Held for the whole of a transaction.
    state: Mutex<ChannelState>,
    log: Logger,
}

impl core::fmt::Debug for BmcChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("BmcChannel")
            .field("path", &self.config.path)
            .field("state", &self.state.try_lock().map(|s| *s).ok())
            .finish_non_exhaustive()
    }
}

fn pause(delay: Duration) {
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
}

impl BmcChannel {
    pub fn new(opener: Box<dyn SerialOpener>, config: BmcConfig, log: &Logger) -> Self {
        let log = log.new(slog::o!(
            "device" => "bmc",
            "path" => config.path.display().to_string(),
        ));
        Self {
            opener,
            config,
            state: Mutex::new(ChannelState::Closed),
            log,
        }
    }

    pub fn config(&self) -> &BmcConfig {
        &self.config
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: &mut ChannelState, next: ChannelState) {
        trace!(self.log, "session state"; "from" => ?*state, "to" => ?next);
        *state = next;
    }

    /// Run `command` on the BMC and return its output, including the echoed
    /// command and the trailing prompt.
    ///
    /// The console is closed afterwards, whether or not the command
    /// succeeded.
    pub fn transaction(&self, command: &str) -> Result<String, Error> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let result = self.run(&mut state, command);
        self.set_state(&mut state, ChannelState::Closed);
        match &result {
            Ok(response) => {
                probes::bmc__transaction__done!(|| (command, response.len() as u64));
            }
            Err(e) => warn!(
                self.log,
                "BMC transaction failed";
                "command" => command,
                "reason" => %e,
            ),
        }
        result.map_err(Error::from)
    }

    fn run(&self, state: &mut ChannelState, command: &str) -> Result<String, SessionError> {
        self.set_state(state, ChannelState::Opening);
        let mut port = self.opener.open()?;
        self.set_state(state, ChannelState::Configuring);
        port.configure(self.config.baud_rate)?;
        self.drain(port.as_mut())?;
        self.login(state, port.as_mut())?;

        self.set_state(state, ChannelState::Transacting);
        let line = format!("{command}\r\n");
        let sends = self.config.command_retries + 1;
        for attempt in 1..=sends {
            probes::bmc__transaction__start!(|| (command, attempt));
            let response = self.send(port.as_mut(), &line, self.config.response_delay)?;
            if response.contains(&self.config.prompt) {
                debug!(
                    self.log,
                    "BMC command complete";
                    "command" => command,
                    "bytes" => response.len(),
                );
                return Ok(truncate(response, self.config.buffer_size));
            }
            debug!(
                self.log,
                "no prompt after command";
                "command" => command,
                "attempt" => attempt,
            );
        }
        Err(SessionError::Timeout(sends))
    }

    // Read out anything left over from earlier sessions.
    fn drain(&self, port: &mut dyn SerialPort) -> Result<(), SessionError> {
        port.flush_input()?;
        let mut buf = vec![0u8; self.config.buffer_size];
        while port.read(&mut buf)? > 0 {}
        Ok(())
    }

    fn login(
        &self,
        state: &mut ChannelState,
        port: &mut dyn SerialPort,
    ) -> Result<(), SessionError> {
        let retry = self.config.login_retry;
        for attempt in 1..=retry.max_attempts {
            probes::bmc__login!(|| (attempt, retry.max_attempts));
            self.set_state(state, ChannelState::LoginChallenge);
            match self.try_login(state, port) {
                Ok(true) => {
                    self.set_state(state, ChannelState::Ready);
                    debug!(self.log, "logged in to BMC"; "attempt" => attempt);
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => debug!(
                    self.log,
                    "login attempt failed";
                    "attempt" => attempt,
                    "reason" => %e,
                ),
            }
            pause(retry.delay);
        }
        Err(SessionError::Login(retry.max_attempts))
    }

    fn try_login(
        &self,
        state: &mut ChannelState,
        port: &mut dyn SerialPort,
    ) -> Result<bool, SessionError> {
        let response = self.send(port, "\r\r", Duration::ZERO)?;
        if response.contains(&self.config.prompt) {
            return Ok(true);
        }
        if !response.contains(&self.config.login_marker) {
            return Ok(false);
        }
        self.set_state(state, ChannelState::Authenticating);
        let user = format!("{}\r", self.config.user);
        let response = self.send(port, &user, self.config.user_delay)?;
        if !response.contains(&self.config.password_marker) {
            return Ok(false);
        }
        let password = format!("{}\r", self.config.password);
        let response = self.send(port, &password, Duration::ZERO)?;
        Ok(response.contains(&self.config.prompt))
    }

    // Write `text`, wait for `delay`, and read the response.
    //
    // Reads continue until the console goes quiet, so nothing of this
    // response is left for the next one. At most `read_limit` bytes are
    // kept. If nothing at all arrives, the empty response is returned once
    // the receive retries run out.
    fn send(
        &self,
        port: &mut dyn SerialPort,
        text: &str,
        delay: Duration,
    ) -> Result<String, SessionError> {
        port.write_all(text.as_bytes())?;
        pause(delay);
        let mut response = Vec::new();
        let mut buf = vec![0u8; self.config.buffer_size];
        let mut received = 0;
        let mut idle = 0;
        loop {
            let n = port.read(&mut buf)?;
            if n > 0 {
                received += n;
                let room = self.config.read_limit.saturating_sub(response.len());
                response.extend_from_slice(&buf[..n.min(room)]);
                continue;
            }
            if received > 0 {
                break;
            }
            idle += 1;
            if idle >= self.config.rx_retry.max_attempts {
                break;
            }
            pause(self.config.rx_retry.delay);
        }
        if received > response.len() {
            debug!(
                self.log,
                "console response over read limit";
                "received" => received,
                "kept" => response.len(),
            );
        }
        let response = String::from_utf8_lossy(&response).into_owned();
        trace!(
            self.log,
            "console response";
            "sent" => text.trim_end(),
            "received" => &response,
        );
        Ok(response)
    }
}

// Cut `response` to at most `max` bytes, on a character boundary.
fn truncate(mut response: String, max: usize) -> String {
    if response.len() > max {
        let mut end = max;
        while !response.is_char_boundary(end) {
            end -= 1;
        }
        response.truncate(end);
    }
    response
}

/// The telemetry of one power supply, in millivolts, milliamps and
/// microwatts.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize,
)]
#[cfg_attr(feature = "api-traits", derive(schemars::JsonSchema))]
pub struct BmcPsuReading {
    pub vin: i64,
    pub vout: i64,
    pub iin: i64,
    pub iout: i64,
    pub pin: i64,
    pub pout: i64,
}

/// Decode the PSU registers from the output of an `i2cdump` word dump.
pub fn parse_psu_dump(text: &str) -> Result<BTreeMap<u8, i64>, Error> {
    let count = BmcCommand::Psu1.value_count();
    let words = text::extract_hex_words(text, count)?;
    Ok(PSU_REGISTERS
        .into_iter()
        .map(|reg| {
            let raw = words[usize::from(reg - PMBUS_DUMP_START)];
            let scale = match reg {
                PMBUS_READ_PIN | PMBUS_READ_POUT => MICRO,
                _ => MILLI,
            };
            (reg, pmbus::linear11(raw, scale))
        })
        .collect())
}

/// Decode `count` decimal values from a `cat` of sysfs inputs.
pub fn parse_values(text: &str, count: usize) -> Result<BTreeMap<u8, i64>, Error> {
    Ok((0u8..)
        .zip(text::extract_numbers(text, count)?)
        .collect())
}

/// The sensors behind the BMC, each group cached on its own.
#[derive(Debug)]
pub struct BmcSensors {
    channel: BmcChannel,
    snapshots: BTreeMap<BmcCommand, CachedSnapshot<u8, i64>>,
}

impl BmcSensors {
    pub fn new(channel: BmcChannel, interval: Duration) -> Self {
        let log = channel.log.clone();
        let group =
            |keys: Vec<u8>| CachedSnapshot::new(keys, interval, RefreshPolicy::Strict, &log);
        let indices = |count: usize| (0u8..).take(count).collect::<Vec<_>>();
        let snapshots = BTreeMap::from([
            (BmcCommand::Thermal, group(indices(THERMAL_COUNT))),
            (BmcCommand::FanUpper, group(indices(FAN_COUNT))),
            (BmcCommand::FanLower, group(indices(FAN_COUNT))),
            (BmcCommand::Psu1, group(PSU_REGISTERS.to_vec())),
            (BmcCommand::Psu2, group(PSU_REGISTERS.to_vec())),
        ]);
        Self { channel, snapshots }
    }

    pub fn channel(&self) -> &BmcChannel {
        &self.channel
    }

    fn query(&self, command: BmcCommand) -> Result<crate::cache::Snapshot<u8, i64>, Error> {
        let snapshot = self
            .snapshots
            .get(&command)
            .ok_or_else(|| Error::Unsupported(format!("{command:?}")))?;
        snapshot.refresh_batch(|| {
            let response = self.channel.transaction(command.command())?;
            let body = text::strip_echo(&response, command.command());
            match command {
                BmcCommand::Psu1 | BmcCommand::Psu2 => parse_psu_dump(body),
                _ => parse_values(body, command.value_count()),
            }
        })
    }

    fn values(&self, command: BmcCommand) -> Result<Vec<i64>, Error> {
        Ok(self.query(command)?.iter().map(|(_, v)| v).collect())
    }

    /// The thermal sensor readings, in milli-degrees Celsius.
    pub fn thermals(&self) -> Result<Vec<i64>, Error> {
        self.values(BmcCommand::Thermal)
    }

    /// The upper fan board's tachometers, in RPM.
    pub fn fans_upper(&self) -> Result<Vec<i64>, Error> {
        self.values(BmcCommand::FanUpper)
    }

    /// The lower fan board's tachometers, in RPM.
    pub fn fans_lower(&self) -> Result<Vec<i64>, Error> {
        self.values(BmcCommand::FanLower)
    }

    /// The telemetry of power supply 1 or 2.
    pub fn psu(&self, psu: u8) -> Result<BmcPsuReading, Error> {
        let command = match psu {
            1 => BmcCommand::Psu1,
            2 => BmcCommand::Psu2,
            other => {
                return Err(Error::InvalidArgument(format!(
                    "power supplies are numbered 1 and 2, found {other}"
                )))
            }
        };
        let snapshot = self.query(command)?;
        Ok(BmcPsuReading {
            vin: snapshot.get(PMBUS_READ_VIN),
            vout: snapshot.get(PMBUS_READ_VOUT),
            iin: snapshot.get(PMBUS_READ_IIN),
            iout: snapshot.get(PMBUS_READ_IOUT),
            pin: snapshot.get(PMBUS_READ_PIN),
            pout: snapshot.get(PMBUS_READ_POUT),
        })
    }
}
