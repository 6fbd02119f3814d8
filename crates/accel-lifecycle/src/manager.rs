//! Upward façade for orchestration and model-serving code.
//!
//! [`DeviceManager`] wires the compute runtime, the monitoring lifecycle,
//! inventory, guard and cache controller together under one
//! [`LifecycleConfig`]. Every operation initializes monitoring implicitly;
//! callers never have to check whether `initialize` ran.
//!
//! ```
//! use std::sync::Arc;
//! use accel_lifecycle::config::LifecycleConfig;
//! use accel_lifecycle::lifecycle::MonitoringLifecycle;
//! use accel_lifecycle::manager::DeviceManager;
//! use accel_lifecycle::sim::{SimulatedMonitor, SimulatedRuntime};
//!
//! let sim = Arc::new(SimulatedRuntime::uniform(2, 16 << 30));
//! let lifecycle = Arc::new(MonitoringLifecycle::new(
//!     SimulatedMonitor::new(sim.clone()).factory(),
//! ));
//! let manager = DeviceManager::new(sim.clone(), lifecycle, LifecycleConfig::default());
//!
//! manager.ensure_available(1, 1 << 30).unwrap();
//! let (answer, report) = manager
//!     .with_session(1, |_session| {
//!         sim.allocate(1, 1 << 30)?;
//!         sim.free(1, 1 << 30);
//!         Ok::<_, accel_lifecycle::LifecycleError>(42)
//!     })
//!     .unwrap();
//! assert_eq!(answer, 42);
//! assert!(!report.leak_suspected);
//! ```

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use crate::cache::{ActiveDeviceGuard, ClearSummary};
use crate::config::LifecycleConfig;
use crate::error::{LifecycleError, LifecycleResult};
use crate::guard::{AdmissionStatus, MemoryGuard, MemoryRequirement};
use crate::inventory::{DeviceInventory, DeviceMemoryInfo, MemorySnapshot};
use crate::lifecycle::{MonitoringLifecycle, MonitoringState};
use crate::monitor::disabled_monitor_factory;
use crate::runtime::{default_runtime, ComputeRuntime};
use crate::session::{AllocationSession, SessionOptions, SessionReport};

/// Entry point for device lifecycle operations.
#[derive(Debug, Clone)]
pub struct DeviceManager {
    lifecycle: Arc<MonitoringLifecycle>,
    inventory: DeviceInventory,
    guard: MemoryGuard,
    config: LifecycleConfig,
}

impl DeviceManager {
    /// Manager over explicit backends.
    pub fn new(
        runtime: Arc<dyn ComputeRuntime>,
        lifecycle: Arc<MonitoringLifecycle>,
        config: LifecycleConfig,
    ) -> Self {
        let inventory = DeviceInventory::new(runtime, lifecycle.clone());
        let guard = MemoryGuard::new(inventory.clone(), config.default_buffer_bytes);
        Self {
            lifecycle,
            inventory,
            guard,
            config,
        }
    }

    /// Manager over the backends compiled into this build.
    ///
    /// Uses the process-wide monitoring lifecycle, or a lifecycle that
    /// never starts a backend when `monitoring.enabled` is false.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` when `config` fails validation.
    pub fn from_config(config: LifecycleConfig) -> LifecycleResult<Self> {
        config.validate()?;

        let lifecycle = if config.monitoring.enabled {
            MonitoringLifecycle::global()
        } else {
            Arc::new(MonitoringLifecycle::new(disabled_monitor_factory(
                "monitoring disabled by configuration",
            )))
        };
        let runtime = default_runtime();

        info!(
            target: "accel_lifecycle::manager",
            runtime = runtime.backend_name(),
            monitoring_enabled = config.monitoring.enabled,
            default_buffer_bytes = config.default_buffer_bytes,
            "Device manager created"
        );
        Ok(Self::new(runtime, lifecycle, config))
    }

    /// Start monitoring; idempotent.
    pub fn initialize(&self) -> MonitoringState {
        self.lifecycle.initialize()
    }

    /// Stop monitoring; idempotent.
    pub fn shutdown(&self) {
        self.lifecycle.shutdown();
    }

    pub fn list_devices(&self) -> LifecycleResult<Vec<u32>> {
        self.initialize();
        self.inventory.list_devices()
    }

    /// `(used, total)` for `device_id`; see [`DeviceInventory::get_memory`].
    pub fn get_memory(&self, device_id: u32) -> LifecycleResult<MemorySnapshot> {
        self.initialize();
        self.inventory.get_memory(device_id)
    }

    pub fn get_memory_info(&self, device_id: u32) -> LifecycleResult<DeviceMemoryInfo> {
        self.initialize();
        self.inventory.get_memory_info(device_id)
    }

    pub fn get_memory_info_all(&self) -> LifecycleResult<Vec<DeviceMemoryInfo>> {
        self.initialize();
        self.inventory.get_memory_info_all()
    }

    /// Telemetry document: runtime name, monitoring flags, every device.
    pub fn telemetry(&self) -> LifecycleResult<serde_json::Value> {
        let devices = self.get_memory_info_all()?;
        Ok(json!({
            "runtime": self.inventory.runtime().backend_name(),
            "monitoring": self.lifecycle.state(),
            "devices": devices,
        }))
    }

    /// Admission check with the configured default buffer.
    pub fn ensure_available(
        &self,
        device_id: u32,
        required_bytes: u64,
    ) -> LifecycleResult<AdmissionStatus> {
        self.initialize();
        self.guard.ensure_available(device_id, required_bytes)
    }

    /// Admission check with an explicit buffer.
    pub fn ensure_available_with(
        &self,
        device_id: u32,
        requirement: MemoryRequirement,
    ) -> LifecycleResult<AdmissionStatus> {
        self.initialize();
        self.guard.ensure_available_with(device_id, requirement)
    }

    /// Session with options from the configuration.
    pub fn acquire(&self, device_id: u32) -> LifecycleResult<AllocationSession> {
        self.acquire_with(device_id, self.session_options())
    }

    /// Session with explicit options.
    ///
    /// Monitoring is initialized by the session once the device is
    /// validated, so a rejected device leaves monitoring state unchanged.
    pub fn acquire_with(
        &self,
        device_id: u32,
        options: SessionOptions,
    ) -> LifecycleResult<AllocationSession> {
        AllocationSession::acquire(self.inventory.clone(), device_id, options)
    }

    /// Run `workload` inside a session on `device_id`.
    ///
    /// The session is released after the workload whatever its outcome.
    /// On success the workload's value comes back with the session report.
    /// Release problems are only logged, so the workload's own error is
    /// what the caller sees.
    pub fn with_session<T, E, F>(
        &self,
        device_id: u32,
        workload: F,
    ) -> Result<(T, SessionReport), E>
    where
        F: FnOnce(&AllocationSession) -> Result<T, E>,
        E: From<LifecycleError>,
    {
        let session = self.acquire(device_id)?;
        let result = workload(&session);
        let report = session.into_report();
        result.map(|value| (value, report))
    }

    /// Release cached memory on one device, or every device when `None`.
    pub fn clear(&self, device_id: Option<u32>) -> LifecycleResult<ClearSummary> {
        self.initialize();
        self.inventory.clear_cache(device_id)
    }

    /// Make `device_id` current until the guard drops.
    pub fn set_active_device(&self, device_id: u32) -> LifecycleResult<ActiveDeviceGuard> {
        self.initialize();
        self.inventory.cache().set_active_device(device_id)
    }

    #[must_use]
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            bind_current_device: self.config.bind_current_device,
            leak_tolerance_bytes: self.config.leak_tolerance_bytes,
        }
    }

    #[must_use]
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    #[must_use]
    pub fn inventory(&self) -> &DeviceInventory {
        &self.inventory
    }

    #[must_use]
    pub fn lifecycle(&self) -> &Arc<MonitoringLifecycle> {
        &self.lifecycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIB;
    use crate::sim::{SimulatedMonitor, SimulatedRuntime};

    fn manager(config: LifecycleConfig) -> (DeviceManager, Arc<SimulatedRuntime>, SimulatedMonitor) {
        let sim = Arc::new(SimulatedRuntime::uniform(2, 4096 * MIB));
        let monitor = SimulatedMonitor::new(sim.clone());
        let lifecycle = Arc::new(MonitoringLifecycle::new(monitor.factory()));
        (DeviceManager::new(sim.clone(), lifecycle, config), sim, monitor)
    }

    #[test]
    fn test_operations_initialize_implicitly() {
        let (manager, _, monitor) = manager(LifecycleConfig::default());
        assert!(!manager.lifecycle().state().initialized);

        manager.list_devices().unwrap();
        manager.get_memory(0).unwrap();
        manager.clear(None).unwrap();
        assert!(manager.lifecycle().state().initialized);
        assert_eq!(monitor.start_count(), 1);
    }

    #[test]
    fn test_default_buffer_comes_from_config() {
        let config = LifecycleConfig {
            default_buffer_bytes: 1024 * MIB,
            ..LifecycleConfig::default()
        };
        let (manager, _, _) = manager(config);
        // 4096 free: 3072 + 1024 fits exactly, 3073 + 1024 does not
        assert!(manager.ensure_available(0, 3072 * MIB).is_ok());
        assert!(matches!(
            manager.ensure_available(0, 3073 * MIB),
            Err(LifecycleError::InsufficientMemory { .. })
        ));
    }

    #[test]
    fn test_session_options_follow_config() {
        let config = LifecycleConfig {
            bind_current_device: true,
            leak_tolerance_bytes: 7,
            ..LifecycleConfig::default()
        };
        let (manager, _, _) = manager(config);
        let options = manager.session_options();
        assert!(options.bind_current_device);
        assert_eq!(options.leak_tolerance_bytes, 7);
    }

    #[test]
    fn test_with_session_returns_workload_value() {
        let (manager, sim, _) = manager(LifecycleConfig::default());
        let (value, report) = manager
            .with_session(1, |session| Ok::<_, LifecycleError>(session.device_id()))
            .unwrap();
        assert_eq!(value, 1);
        assert_eq!(report.device_id, 1);
        assert_eq!(report.delta_bytes, 0);
        assert_eq!(sim.clear_count(1), 1);
    }

    #[test]
    fn test_from_config_rejects_invalid() {
        let config = LifecycleConfig {
            default_buffer_bytes: u64::MAX,
            ..LifecycleConfig::default()
        };
        assert!(matches!(
            DeviceManager::from_config(config),
            Err(LifecycleError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_from_config_with_monitoring_disabled() {
        let mut config = LifecycleConfig::default();
        config.monitoring.enabled = false;
        let manager = DeviceManager::from_config(config).unwrap();
        let state = manager.initialize();
        assert!(state.initialized);
        assert!(!state.backend_available);
        assert!(!Arc::ptr_eq(manager.lifecycle(), &MonitoringLifecycle::global()));
    }
}
