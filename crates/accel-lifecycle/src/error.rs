//! Error types for accelerator lifecycle operations.
//!
//! Every failure carries the device id and, where relevant, the memory
//! figures involved, so callers can tell "no runtime", "wrong device" and
//! "not enough memory" apart without parsing messages.
//!
//! Degraded monitoring and suspected leaks are NOT errors. They surface as
//! values (`AdmissionStatus::Unknown`, `SessionReport::leak_suspected`) and
//! as `tracing` warnings.

use thiserror::Error;

/// Result type alias for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Runtime result code for device out-of-memory (`CUDA_ERROR_OUT_OF_MEMORY`).
pub const RUNTIME_OUT_OF_MEMORY: i32 = 2;

/// Errors raised by the accelerator lifecycle layer.
#[derive(Debug, Error)]
pub enum LifecycleError {
    // ========== Acquisition Errors ==========
    /// The compute runtime reports zero visible devices.
    #[error("Compute runtime unavailable: no visible accelerator devices")]
    RuntimeUnavailable,

    /// Requested device id is outside the visible range.
    #[error("Device {device_id} not found ({visible} visible device(s))")]
    DeviceNotFound { device_id: u32, visible: u32 },

    /// Pre-flight memory check failed.
    #[error(
        "Insufficient memory on device {device_id}: required {required} bytes, available {available} bytes"
    )]
    InsufficientMemory {
        device_id: u32,
        required: u64,
        available: u64,
    },

    // ========== Backend Errors ==========
    /// A compute runtime (driver) call failed.
    #[error("{operation} failed on device {device_id:?}: {message} (code {code})")]
    RuntimeCall {
        operation: &'static str,
        device_id: Option<u32>,
        code: i32,
        message: String,
    },

    /// Monitoring backend failed to start or to answer a query.
    ///
    /// Only backend implementations return this; the monitoring lifecycle
    /// turns it into degraded mode.
    #[error("Monitoring backend error: {0}")]
    Monitoring(String),

    // ========== Configuration Errors ==========
    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl LifecycleError {
    /// Build a `RuntimeCall` error.
    pub fn runtime_call(
        operation: &'static str,
        device_id: Option<u32>,
        code: i32,
        message: impl Into<String>,
    ) -> Self {
        Self::RuntimeCall {
            operation,
            device_id,
            code,
            message: message.into(),
        }
    }

    /// Device id the error refers to, if any.
    #[must_use]
    pub fn device_id(&self) -> Option<u32> {
        match self {
            Self::DeviceNotFound { device_id, .. } | Self::InsufficientMemory { device_id, .. } => {
                Some(*device_id)
            }
            Self::RuntimeCall { device_id, .. } => *device_id,
            _ => None,
        }
    }

    /// Whether retrying later may succeed.
    ///
    /// True for memory pressure, which other workloads can relieve: an
    /// `InsufficientMemory` rejection or a runtime call that ran out of
    /// device memory. Missing devices, bad configuration and other runtime
    /// faults are permanent. This layer never retries on its own.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InsufficientMemory { .. } => true,
            Self::RuntimeCall { code, .. } => *code == RUNTIME_OUT_OF_MEMORY,
            _ => false,
        }
    }
}

impl From<config::ConfigError> for LifecycleError {
    fn from(err: config::ConfigError) -> Self {
        LifecycleError::Config(err.to_string())
    }
}

impl From<toml::de::Error> for LifecycleError {
    fn from(err: toml::de::Error) -> Self {
        LifecycleError::Config(err.to_string())
    }
}
