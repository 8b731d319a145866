// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Configuration of the platform drivers and the BMC console.

use crate::cache::RefreshPolicy;
use crate::Error;
use std::path::PathBuf;
use std::time::Duration;

/// How many times, and how far apart, an operation is attempted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// The total number of attempts, including the first.
    pub max_attempts: u32,
    /// The delay between consecutive attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// A policy which makes a single attempt.
    pub const fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    fn validate(&self, what: &str) -> Result<(), Error> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidConfig(format!(
                "{what} must allow at least one attempt"
            )));
        }
        Ok(())
    }
}

/// Return the default retry policy for register accesses.
pub const fn default_bus_retry() -> RetryPolicy {
    RetryPolicy::new(10, Duration::from_millis(60))
}

/// Return the default retry policy for each chunk of an EEPROM transfer.
pub const fn default_eeprom_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(100))
}

/// Return the default interval for which register snapshots stay fresh.
pub const fn default_refresh_interval() -> Duration {
    Duration::from_millis(1500)
}

/// Return the default interval for which sensors read from the BMC stay
/// fresh.
pub const fn default_bmc_refresh_interval() -> Duration {
    Duration::from_secs(5)
}

/// Return the default delay between the two reads of a QSFP status byte.
pub const fn default_qsfp_status_delay() -> Duration {
    Duration::from_millis(200)
}

/// Return the default interval between runs of the thermal fan policy.
pub const fn default_monitor_interval() -> Duration {
    Duration::from_secs(10)
}

pub const fn default_refresh_policy() -> RefreshPolicy {
    RefreshPolicy::Strict
}

/// Configuration for the register-backed drivers of a [`crate::Platform`].
///
/// The [`ConfigBuilder`] constructs this with the defaults the board
/// drivers have always used.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// The retry policy for single register accesses.
    pub bus_retry: RetryPolicy,

    /// The retry policy for each chunk of an EEPROM transfer.
    pub eeprom_retry: RetryPolicy,

    /// The interval for which register snapshots stay fresh.
    pub refresh_interval: Duration,

    /// The interval for which BMC sensor readings stay fresh.
    pub bmc_refresh_interval: Duration,

    /// The delay between the two reads of a latched QSFP status byte.
    pub qsfp_status_delay: Duration,

    /// The interval between runs of the thermal fan policy.
    pub monitor_interval: Duration,

    /// How snapshots handle a failed register read.
    ///
    /// Power supplies always use [`RefreshPolicy::Lenient`], regardless of
    /// this setting.
    pub refresh_policy: RefreshPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus_retry: default_bus_retry(),
            eeprom_retry: default_eeprom_retry(),
            refresh_interval: default_refresh_interval(),
            bmc_refresh_interval: default_bmc_refresh_interval(),
            qsfp_status_delay: default_qsfp_status_delay(),
            monitor_interval: default_monitor_interval(),
            refresh_policy: default_refresh_policy(),
        }
    }
}

/// A builder interface for generating driver configuration.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    bus_retry: Option<RetryPolicy>,
    eeprom_retry: Option<RetryPolicy>,
    refresh_interval: Option<Duration>,
    bmc_refresh_interval: Option<Duration>,
    qsfp_status_delay: Option<Duration>,
    monitor_interval: Option<Duration>,
    refresh_policy: Option<RefreshPolicy>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the retry policy for single register accesses.
    pub fn bus_retry(mut self, retry: RetryPolicy) -> Self {
        self.bus_retry = Some(retry);
        self
    }

    /// Set the retry policy for each chunk of an EEPROM transfer.
    pub fn eeprom_retry(mut self, retry: RetryPolicy) -> Self {
        self.eeprom_retry = Some(retry);
        self
    }

    /// Set the interval for which register snapshots stay fresh.
    ///
    /// An interval of zero refreshes on every access.
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = Some(interval);
        self
    }

    pub fn bmc_refresh_interval(mut self, interval: Duration) -> Self {
        self.bmc_refresh_interval = Some(interval);
        self
    }

    pub fn qsfp_status_delay(mut self, delay: Duration) -> Self {
        self.qsfp_status_delay = Some(delay);
        self
    }

    pub fn monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = Some(interval);
        self
    }

    pub fn refresh_policy(mut self, policy: RefreshPolicy) -> Self {
        self.refresh_policy = Some(policy);
        self
    }

    /// Build a `Config` from `self`.
    pub fn build(self) -> Result<Config, Error> {
        let config = Config {
            bus_retry: self.bus_retry.unwrap_or_else(default_bus_retry),
            eeprom_retry: self.eeprom_retry.unwrap_or_else(default_eeprom_retry),
            refresh_interval: self
                .refresh_interval
                .unwrap_or_else(default_refresh_interval),
            bmc_refresh_interval: self
                .bmc_refresh_interval
                .unwrap_or_else(default_bmc_refresh_interval),
            qsfp_status_delay: self
                .qsfp_status_delay
                .unwrap_or_else(default_qsfp_status_delay),
            monitor_interval: self
                .monitor_interval
                .unwrap_or_else(default_monitor_interval),
            refresh_policy: self.refresh_policy.unwrap_or_else(default_refresh_policy),
        };
        config.bus_retry.validate("bus retry policy")?;
        config.eeprom_retry.validate("EEPROM retry policy")?;
        if config.monitor_interval.is_zero() {
            return Err(Error::InvalidConfig(String::from(
                "monitor interval must be non-zero",
            )));
        }
        Ok(config)
    }
}

pub fn default_bmc_path() -> PathBuf {
    PathBuf::from("/dev/ttyACM0")
}

pub const fn default_baud_rate() -> u32 {
    57600
}

pub fn default_prompt() -> String {
    String::from("@bmc:")
}

pub fn default_login_marker() -> String {
    String::from("bmc login:")
}

pub fn default_password_marker() -> String {
    String::from("Password:")
}

pub fn default_user() -> String {
    String::from("root")
}

pub fn default_password() -> String {
    String::from("0penBmc")
}

/// Return the default policy for the whole login handshake.
pub const fn default_login_retry() -> RetryPolicy {
    RetryPolicy::new(20, Duration::from_millis(50))
}

/// Return the default delay between sending the user name and reading the
/// password prompt.
pub const fn default_user_delay() -> Duration {
    Duration::from_millis(300)
}

/// Return the default number of times a command is re-sent while the
/// prompt is missing from the response.
pub const fn default_command_retries() -> u32 {
    3
}

/// Return the default delay between sending a command and reading its
/// response.
pub const fn default_response_delay() -> Duration {
    Duration::from_millis(200)
}

/// Return the default policy for reads which find no data waiting.
pub const fn default_rx_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(50))
}

/// Return the default size of the response buffer, in bytes.
pub const fn default_buffer_size() -> usize {
    256
}

/// Return the default number of bytes of console output searched for the
/// prompt.
pub const fn default_read_limit() -> usize {
    1024
}

/// Configuration of the BMC serial console.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BmcConfig {
    /// The path to the console's character device.
    pub path: PathBuf,
    pub baud_rate: u32,
    /// Text which appears in the shell prompt once logged in.
    pub prompt: String,
    /// Text which appears when the console asks for a user name.
    pub login_marker: String,
    /// Text which appears when the console asks for a password.
    pub password_marker: String,
    pub user: String,
    pub password: String,
    pub login_retry: RetryPolicy,
    pub user_delay: Duration,
    pub command_retries: u32,
    pub response_delay: Duration,
    pub rx_retry: RetryPolicy,
    /// Responses longer than this are truncated.
    pub buffer_size: usize,
    /// The prompt must appear within this many bytes of a response.
    pub read_limit: usize,
}

impl Default for BmcConfig {
    fn default() -> Self {
        Self {
            path: default_bmc_path(),
            baud_rate: default_baud_rate(),
            prompt: default_prompt(),
            login_marker: default_login_marker(),
            password_marker: default_password_marker(),
            user: default_user(),
            password: default_password(),
            login_retry: default_login_retry(),
            user_delay: default_user_delay(),
            command_retries: default_command_retries(),
            response_delay: default_response_delay(),
            rx_retry: default_rx_retry(),
            buffer_size: default_buffer_size(),
            read_limit: default_read_limit(),
        }
    }
}

/// A builder interface for generating BMC console configuration.
#[derive(Debug, Default)]
pub struct BmcConfigBuilder {
    path: Option<PathBuf>,
    baud_rate: Option<u32>,
    prompt: Option<String>,
    user: Option<String>,
    password: Option<String>,
    login_retry: Option<RetryPolicy>,
    user_delay: Option<Duration>,
    command_retries: Option<u32>,
    response_delay: Option<Duration>,
    rx_retry: Option<RetryPolicy>,
    buffer_size: Option<usize>,
    read_limit: Option<usize>,
}

impl BmcConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the path to the console's character device.
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = Some(baud_rate);
        self
    }

    pub fn prompt(mut self, prompt: impl AsRef<str>) -> Self {
        self.prompt = Some(String::from(prompt.as_ref()));
        self
    }

    pub fn user(mut self, user: impl AsRef<str>) -> Self {
        self.user = Some(String::from(user.as_ref()));
        self
    }

    pub fn password(mut self, password: impl AsRef<str>) -> Self {
        self.password = Some(String::from(password.as_ref()));
        self
    }

    /// Set how many times, and how far apart, the whole login handshake is
    /// attempted.
    pub fn login_retry(mut self, retry: RetryPolicy) -> Self {
        self.login_retry = Some(retry);
        self
    }

    /// Set how long to wait for the password prompt after sending the user
    /// name.
    pub fn user_delay(mut self, delay: Duration) -> Self {
        self.user_delay = Some(delay);
        self
    }

    pub fn command_retries(mut self, retries: u32) -> Self {
        self.command_retries = Some(retries);
        self
    }

    pub fn response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = Some(delay);
        self
    }

    pub fn rx_retry(mut self, retry: RetryPolicy) -> Self {
        self.rx_retry = Some(retry);
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    pub fn read_limit(mut self, limit: usize) -> Self {
        self.read_limit = Some(limit);
        self
    }

    /// Build a `BmcConfig` from `self`.
    pub fn build(self) -> Result<BmcConfig, Error> {
        let config = BmcConfig {
            path: self.path.unwrap_or_else(default_bmc_path),
            baud_rate: self.baud_rate.unwrap_or_else(default_baud_rate),
            prompt: self.prompt.unwrap_or_else(default_prompt),
            login_marker: default_login_marker(),
            password_marker: default_password_marker(),
            user: self.user.unwrap_or_else(default_user),
            password: self.password.unwrap_or_else(default_password),
            login_retry: self.login_retry.unwrap_or_else(default_login_retry),
            user_delay: self.user_delay.unwrap_or_else(default_user_delay),
            command_retries: self
                .command_retries
                .unwrap_or_else(default_command_retries),
            response_delay: self.response_delay.unwrap_or_else(default_response_delay),
            rx_retry: self.rx_retry.unwrap_or_else(default_rx_retry),
            buffer_size: self.buffer_size.unwrap_or_else(default_buffer_size),
            read_limit: self.read_limit.unwrap_or_else(default_read_limit),
        };
        if config.prompt.is_empty() {
            return Err(Error::InvalidConfig(String::from(
                "BMC prompt must not be empty",
            )));
        }
        if config.buffer_size < config.prompt.len() {
            return Err(Error::InvalidConfig(format!(
                "response buffer of {} bytes cannot hold the prompt",
                config.buffer_size
            )));
        }
        if config.read_limit < config.buffer_size {
            return Err(Error::InvalidConfig(format!(
                "read limit of {} bytes is below the response buffer of {} bytes",
                config.read_limit, config.buffer_size
            )));
        }
        config.login_retry.validate("BMC login retry policy")?;
        config.rx_retry.validate("BMC receive retry policy")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::BmcConfigBuilder;
    use super::Config;
    use super::ConfigBuilder;
    use super::RetryPolicy;
    use crate::cache::RefreshPolicy;
    use crate::Error;
    use std::time::Duration;

    #[test]
    fn test_config_builder_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.bus_retry.max_attempts, 10);
        assert_eq!(config.bus_retry.delay, Duration::from_millis(60));
        assert_eq!(config.eeprom_retry.max_attempts, 3);
        assert_eq!(config.refresh_interval, Duration::from_millis(1500));
        assert_eq!(config.refresh_policy, RefreshPolicy::Strict);
    }

    #[test]
    fn test_config_builder_rejects_zero_attempts() {
        let res = ConfigBuilder::new()
            .bus_retry(RetryPolicy::new(0, Duration::ZERO))
            .build();
        assert!(matches!(res, Err(Error::InvalidConfig(_))));
        assert!(ConfigBuilder::new()
            .monitor_interval(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn test_config_builder_overrides() {
        let config = ConfigBuilder::new()
            .refresh_interval(Duration::ZERO)
            .refresh_policy(RefreshPolicy::Lenient)
            .bus_retry(RetryPolicy::once())
            .build()
            .unwrap();
        assert!(config.refresh_interval.is_zero());
        assert_eq!(config.refresh_policy, RefreshPolicy::Lenient);
        assert_eq!(config.bus_retry, RetryPolicy::once());
    }

    #[test]
    fn test_bmc_config_builder() {
        let config = BmcConfigBuilder::new().build().unwrap();
        assert_eq!(config.path.to_str(), Some("/dev/ttyACM0"));
        assert_eq!(config.baud_rate, 57600);
        assert_eq!(config.prompt, "@bmc:");
        assert_eq!(config.login_retry.max_attempts, 20);
        assert_eq!(config.login_retry.delay, Duration::from_millis(50));
        assert_eq!(config.user_delay, Duration::from_millis(300));
        assert_eq!(config.buffer_size, 256);
        assert_eq!(config.read_limit, 1024);

        assert!(BmcConfigBuilder::new().prompt("").build().is_err());
        assert!(BmcConfigBuilder::new().buffer_size(2).build().is_err());
        assert!(BmcConfigBuilder::new().read_limit(128).build().is_err());
        assert!(BmcConfigBuilder::new()
            .login_retry(RetryPolicy::new(0, Duration::ZERO))
            .build()
            .is_err());
    }
}
