//! NVML monitoring backend.
//!
//! `nvml-wrapper` loads `libnvidia-ml` at runtime, so a build with the
//! `nvml` feature still starts on hosts without an NVIDIA driver: `start`
//! fails and the lifecycle runs degraded.

#![cfg(feature = "nvml")]

use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{LifecycleError, LifecycleResult};

fn init_error(err: NvmlError) -> LifecycleError {
    match err {
        NvmlError::LibloadingError(_) | NvmlError::LibraryNotFound | NvmlError::DriverNotLoaded => {
            LifecycleError::Monitoring(format!("NVML not available: {}", err))
        }
        NvmlError::NoPermission => LifecycleError::Monitoring(
            "No permission to access NVML. Run with root or add user to nvidia group.".to_string(),
        ),
        other => LifecycleError::Monitoring(format!("NVML init error: {:?}", other)),
    }
}

/// Monitoring backend reading device memory through NVML.
///
/// Holds the NVML handle between `start` and `stop`.
#[derive(Debug, Default)]
pub struct NvmlMonitor {
    nvml: Mutex<Option<Nvml>>,
}

impl NvmlMonitor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl super::MemoryMonitor for NvmlMonitor {
    fn start(&self) -> LifecycleResult<()> {
        let mut slot = self.nvml.lock();
        if slot.is_some() {
            return Ok(());
        }
        let nvml = Nvml::init().map_err(init_error)?;
        debug!(target: "accel_lifecycle::monitor", "NVML initialized");
        *slot = Some(nvml);
        Ok(())
    }

    fn stop(&self) -> LifecycleResult<()> {
        match self.nvml.lock().take() {
            Some(nvml) => nvml
                .shutdown()
                .map_err(|e| LifecycleError::Monitoring(format!("NVML shutdown failed: {:?}", e))),
            None => Ok(()),
        }
    }

    fn memory(&self, device_index: u32) -> LifecycleResult<(u64, u64)> {
        let slot = self.nvml.lock();
        let nvml = slot
            .as_ref()
            .ok_or_else(|| LifecycleError::Monitoring("NVML not started".to_string()))?;

        let device = nvml.device_by_index(device_index).map_err(|e| {
            LifecycleError::Monitoring(format!("NVML device {}: {:?}", device_index, e))
        })?;
        let info = device.memory_info().map_err(|e| {
            LifecycleError::Monitoring(format!(
                "NVML memory query on device {}: {:?}",
                device_index, e
            ))
        })?;

        Ok((info.used, info.total))
    }

    fn backend_name(&self) -> &'static str {
        "nvml"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::lifecycle::MonitoringLifecycle;
    use crate::monitor::{MemoryMonitor, MonitorFactory};

    #[test]
    fn test_memory_before_start_is_monitoring_error() {
        let monitor = NvmlMonitor::new();
        assert!(matches!(
            monitor.memory(0),
            Err(LifecycleError::Monitoring(_))
        ));
        assert!(monitor.stop().is_ok(), "stop without start is a no-op");
    }

    #[test]
    fn test_lifecycle_initializes_with_or_without_driver() {
        let factory: MonitorFactory =
            Arc::new(|| Box::new(NvmlMonitor::new()) as Box<dyn MemoryMonitor>);
        let lifecycle = MonitoringLifecycle::new(factory);

        let state = lifecycle.initialize();
        assert!(state.initialized, "missing NVML must degrade, not fail");
        if !state.backend_available {
            assert_eq!(lifecycle.read(0), (0, 0));
        }
        lifecycle.shutdown();
    }

    #[test]
    #[ignore = "requires an NVIDIA driver"]
    fn test_nvml_reads_device_zero() {
        let monitor = NvmlMonitor::new();
        monitor.start().expect("NVML init failed");
        let (used, total) = monitor.memory(0).expect("memory query failed");
        assert!(total > 0, "total memory should be > 0");
        assert!(used <= total, "used should be <= total");
        monitor.stop().expect("NVML shutdown failed");
    }
}
