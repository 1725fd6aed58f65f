//! Daemon configuration, loaded from a TOML file.
//!
//! ## Example
//!
//! ```toml
//! [serial]
//! port = "/dev/ttyACM0"
//! baudrate = 115200
//!
//! [queue]
//! instruction_timeout_ms = 10000
//! failure_threshold = 3
//!
//! [telemetry]
//! interval_ms = 2000
//! ```
//!
//! ```rust
//! use printer_link::config::Config;
//! let config: Config = toml::from_str("[serial]\nport = \"/dev/ttyACM0\"").unwrap();
//! assert_eq!(config.serial.port, "/dev/ttyACM0");
//! assert_eq!(config.serial.baudrate, 115200);
//! assert!(config.validate().is_ok());
//! ```
//!
//! Every section and field is optional and falls back to the defaults below.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub printer: PrinterConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SerialConfig {
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baudrate: default_baudrate(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// How long a sent instruction may wait for its response.
    #[serde(default = "default_instruction_timeout_ms")]
    pub instruction_timeout_ms: u64,
    /// Read poll used while no instruction is in flight.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    /// Consecutive failures before the link is reported as degraded.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Front-priority sends allowed in a row while normal work waits.
    /// Zero disables the bound.
    #[serde(default = "default_max_consecutive_front")]
    pub max_consecutive_front: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            instruction_timeout_ms: default_instruction_timeout_ms(),
            idle_poll_ms: default_idle_poll_ms(),
            failure_threshold: default_failure_threshold(),
            max_consecutive_front: default_max_consecutive_front(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl QueueConfig {
    pub fn instruction_timeout(&self) -> Duration {
        Duration::from_millis(self.instruction_timeout_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    /// Delay before the next send after `attempt` transport failures in a row.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
        let delay = self.backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StateConfig {
    /// `error_count` above this raises an attention condition.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    #[serde(default = "default_history_length")]
    pub history_length: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            error_threshold: default_error_threshold(),
            history_length: default_history_length(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_telemetry_interval_ms")]
    pub interval_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_telemetry_interval_ms(),
        }
    }
}

impl TelemetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrinterConfig {
    #[serde(default = "default_minimum_firmware")]
    pub minimum_firmware: String,
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            minimum_firmware: default_minimum_firmware(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_http_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.port.is_empty() {
            return Err(ConfigError::Invalid("serial.port must not be empty".to_string()));
        }
        if self.serial.baudrate == 0 {
            return Err(ConfigError::Invalid("serial.baudrate must be > 0".to_string()));
        }
        if self.queue.instruction_timeout_ms == 0 {
            return Err(ConfigError::Invalid("queue.instruction_timeout_ms must be > 0".to_string()));
        }
        if self.queue.idle_poll_ms == 0 {
            return Err(ConfigError::Invalid("queue.idle_poll_ms must be > 0".to_string()));
        }
        if self.queue.failure_threshold == 0 {
            return Err(ConfigError::Invalid("queue.failure_threshold must be > 0".to_string()));
        }
        if self.queue.backoff_base_ms > self.queue.backoff_max_ms {
            return Err(ConfigError::Invalid(
                "queue.backoff_base_ms must not exceed queue.backoff_max_ms".to_string(),
            ));
        }
        if self.state.history_length == 0 {
            return Err(ConfigError::Invalid("state.history_length must be > 0".to_string()));
        }
        if self.telemetry.interval_ms == 0 {
            return Err(ConfigError::Invalid("telemetry.interval_ms must be > 0".to_string()));
        }
        if self.logging.level.parse::<tracing::Level>().is_err() {
            return Err(ConfigError::Invalid(format!("Unknown log level '{}'", self.logging.level)));
        }
        Ok(())
    }
}

fn default_port() -> String { "/dev/ttyAMA0".to_string() }
fn default_baudrate() -> u32 { 115200 }
fn default_instruction_timeout_ms() -> u64 { 10_000 }
fn default_idle_poll_ms() -> u64 { 100 }
fn default_failure_threshold() -> u32 { 3 }
fn default_max_consecutive_front() -> u32 { 8 }
fn default_backoff_base_ms() -> u64 { 250 }
fn default_backoff_max_ms() -> u64 { 5_000 }
fn default_error_threshold() -> u32 { 3 }
fn default_history_length() -> usize { 10 }
fn default_telemetry_interval_ms() -> u64 { 2_000 }
fn default_minimum_firmware() -> String { "3.10.0".to_string() }
fn default_address() -> String { "0.0.0.0".to_string() }
fn default_http_port() -> u16 { 8080 }
fn default_log_level() -> String { "info".to_string() }

pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        tracing::error!("Failed to read config file '{}': {}", path, e);
        ConfigError::Io(e)
    })?;
    let config: Config = toml::from_str(&contents).map_err(|e| {
        tracing::error!("Failed to parse config TOML: {}", e);
        ConfigError::Toml(e)
    })?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.instruction_timeout(), Duration::from_secs(10));
        assert_eq!(config.http.port, 8080);
    }

    #[test]
    fn test_partial_sections_fill_defaults() {
        let config: Config = toml::from_str(
            r#"
            [queue]
            failure_threshold = 5

            [state]
            history_length = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.queue.failure_threshold, 5);
        assert_eq!(config.queue.max_consecutive_front, 8);
        assert_eq!(config.state.history_length, 4);
        assert_eq!(config.state.error_threshold, 3);
        assert_eq!(config.serial.baudrate, 115200);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.queue.failure_threshold = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.logging.level = "chatty".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let queue = QueueConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            ..QueueConfig::default()
        };
        assert_eq!(queue.backoff(0), Duration::ZERO);
        assert_eq!(queue.backoff(1), Duration::from_millis(100));
        assert_eq!(queue.backoff(3), Duration::from_millis(400));
        assert_eq!(queue.backoff(5), Duration::from_millis(1_000));
        assert_eq!(queue.backoff(80), Duration::from_millis(1_000));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[serial]\nport = \"/dev/ttyUSB1\"\nbaudrate = 250000").unwrap();
        let config = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.serial.port, "/dev/ttyUSB1");
        assert_eq!(config.serial.baudrate, 250000);

        let missing = load_config("/nonexistent/printer-link.toml");
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
