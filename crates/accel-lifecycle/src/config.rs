//! Configuration for the accelerator lifecycle layer.
//!
//! Configuration is layered:
//! 1. `config/accel.toml` (optional base settings)
//! 2. `config/accel.{ACCEL_LIFECYCLE_ENV}.toml` (optional, per environment)
//! 3. Environment variables prefixed `ACCEL_LIFECYCLE__`, `__` separated
//!    (e.g. `ACCEL_LIFECYCLE__LOGGING__LEVEL=debug`)
//!
//! Which device indices exist is never configured here; that comes from the
//! compute runtime.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{LifecycleError, LifecycleResult};

/// One mebibyte in bytes.
pub const MIB: u64 = 1024 * 1024;

/// One gibibyte in bytes.
pub const GIB: u64 = 1024 * MIB;

/// Default MemoryGuard safety margin (512 MiB).
pub const DEFAULT_BUFFER_BYTES: u64 = 512 * MIB;

/// Upper bound accepted for `default_buffer_bytes` (1 TiB).
pub const MAX_BUFFER_BYTES: u64 = 1024 * GIB;

const VALID_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
const VALID_FORMATS: &[&str] = &["pretty", "compact", "json"];

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is not set.
    pub level: String,
    /// Output format: "pretty", "compact" or "json".
    pub format: String,
    /// Include file/line in log lines.
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            include_location: false,
        }
    }
}

/// Monitoring backend configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// When false the backend is never started and every reading is
    /// reported as unknown.
    pub enabled: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Safety margin added to every pre-flight memory requirement that
    /// does not carry its own.
    pub default_buffer_bytes: u64,
    /// Memory growth across a session above this many bytes is reported
    /// as a suspected leak.
    pub leak_tolerance_bytes: u64,
    /// Make the session's device current for the session's duration.
    pub bind_current_device: bool,
    pub monitoring: MonitoringConfig,
    pub logging: LoggingConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            default_buffer_bytes: DEFAULT_BUFFER_BYTES,
            leak_tolerance_bytes: 0,
            bind_current_device: false,
            monitoring: MonitoringConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl LifecycleConfig {
    /// Load configuration from files and environment.
    pub fn load() -> LifecycleResult<Self> {
        let env =
            std::env::var("ACCEL_LIFECYCLE_ENV").unwrap_or_else(|_| "development".to_string());

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/accel").required(false))
            .add_source(config::File::with_name(&format!("config/accel.{}", env)).required(false))
            .add_source(
                config::Environment::with_prefix("ACCEL_LIFECYCLE")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: LifecycleConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> LifecycleResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            LifecycleError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: LifecycleConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> LifecycleResult<()> {
        let level = self.logging.level.to_ascii_lowercase();
        if !VALID_LEVELS.contains(&level.as_str()) {
            return Err(LifecycleError::InvalidConfig(format!(
                "logging.level must be one of {:?}, got {:?}",
                VALID_LEVELS, self.logging.level
            )));
        }

        if !VALID_FORMATS.contains(&self.logging.format.as_str()) {
            return Err(LifecycleError::InvalidConfig(format!(
                "logging.format must be one of {:?}, got {:?}",
                VALID_FORMATS, self.logging.format
            )));
        }

        if self.default_buffer_bytes > MAX_BUFFER_BYTES {
            return Err(LifecycleError::InvalidConfig(format!(
                "default_buffer_bytes = {} exceeds 1 TiB; the value is in bytes, not MB",
                self.default_buffer_bytes
            )));
        }

        Ok(())
    }
}
