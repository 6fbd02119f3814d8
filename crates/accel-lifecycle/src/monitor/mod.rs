//! Monitoring backend seam.
//!
//! The monitoring backend is optional. It gives out-of-band used/total
//! memory per device index. When it is absent every reading is the
//! `(0, 0)` sentinel, which callers must read as "unknown".
//!
//! Backends are selected once at initialization through a
//! [`MonitorFactory`] rather than through availability checks at every
//! call site.

#[cfg(feature = "nvml")]
pub mod nvml;

use std::sync::Arc;

use crate::error::{LifecycleError, LifecycleResult};

#[cfg(feature = "nvml")]
pub use nvml::NvmlMonitor;

/// Out-of-band per-device memory readings.
pub trait MemoryMonitor: Send + Sync {
    /// Start the backend. Called at most once per lifecycle generation.
    fn start(&self) -> LifecycleResult<()>;

    /// Stop the backend. Only called after a successful `start`.
    fn stop(&self) -> LifecycleResult<()>;

    /// `(used_bytes, total_bytes)` for `device_index`.
    fn memory(&self, device_index: u32) -> LifecycleResult<(u64, u64)>;

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;
}

/// Builds the monitoring backend for each lifecycle generation.
pub type MonitorFactory = Arc<dyn Fn() -> Box<dyn MemoryMonitor> + Send + Sync>;

/// Backend stand-in when no monitoring library is present.
///
/// `start` always fails, which puts the lifecycle into degraded mode.
#[derive(Debug, Default, Clone)]
pub struct UnavailableMonitor {
    reason: String,
}

impl UnavailableMonitor {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl MemoryMonitor for UnavailableMonitor {
    fn start(&self) -> LifecycleResult<()> {
        Err(LifecycleError::Monitoring(self.reason.clone()))
    }

    fn stop(&self) -> LifecycleResult<()> {
        Ok(())
    }

    fn memory(&self, _device_index: u32) -> LifecycleResult<(u64, u64)> {
        Ok((0, 0))
    }

    fn backend_name(&self) -> &'static str {
        "unavailable"
    }
}

/// Factory for the best monitoring backend compiled into this build.
///
/// With the `nvml` feature this builds [`NvmlMonitor`]; otherwise an
/// [`UnavailableMonitor`].
pub fn default_monitor_factory() -> MonitorFactory {
    #[cfg(feature = "nvml")]
    {
        Arc::new(|| Box::new(NvmlMonitor::new()) as Box<dyn MemoryMonitor>)
    }

    #[cfg(not(feature = "nvml"))]
    {
        disabled_monitor_factory("no monitoring backend compiled in (enable the `nvml` feature)")
    }
}

/// Factory that never provides a working backend.
pub fn disabled_monitor_factory(reason: &str) -> MonitorFactory {
    let reason = reason.to_string();
    Arc::new(move || Box::new(UnavailableMonitor::new(reason.clone())) as Box<dyn MemoryMonitor>)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_monitor_refuses_to_start() {
        let monitor = UnavailableMonitor::new("library missing");
        let err = monitor.start().unwrap_err();
        assert!(err.to_string().contains("library missing"));
        assert_eq!(monitor.memory(3).unwrap(), (0, 0));
    }

    #[test]
    fn test_disabled_factory_builds_unavailable() {
        let factory = disabled_monitor_factory("off");
        let monitor = factory();
        assert_eq!(monitor.backend_name(), "unavailable");
        assert!(monitor.start().is_err());
    }
}
