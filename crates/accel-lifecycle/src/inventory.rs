//! Device enumeration and point-in-time memory readings.
//!
//! Readings come from the monitoring lifecycle and are never cached. The
//! `(0, 0)` reading means "unknown" (monitoring degraded), never "device
//! has zero capacity"; check [`MemorySnapshot::is_known`] before using it.

use std::sync::Arc;

use serde::Serialize;

use crate::cache::{CacheController, ClearSummary};
use crate::config::{GIB, MIB};
use crate::error::{LifecycleError, LifecycleResult};
use crate::lifecycle::MonitoringLifecycle;
use crate::runtime::ComputeRuntime;

const KIB: u64 = 1024;

/// One `(used, total)` reading for a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemorySnapshot {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl MemorySnapshot {
    /// The "unknown" sentinel.
    pub const UNKNOWN: MemorySnapshot = MemorySnapshot {
        used_bytes: 0,
        total_bytes: 0,
    };

    #[inline]
    #[must_use]
    pub fn new(used_bytes: u64, total_bytes: u64) -> Self {
        Self {
            used_bytes,
            total_bytes,
        }
    }

    /// `total - used`, clamped at zero.
    #[inline]
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.used_bytes)
    }

    /// False for the `(0, 0)` sentinel.
    #[inline]
    #[must_use]
    pub fn is_known(&self) -> bool {
        *self != Self::UNKNOWN
    }
}

impl From<(u64, u64)> for MemorySnapshot {
    fn from((used_bytes, total_bytes): (u64, u64)) -> Self {
        Self::new(used_bytes, total_bytes)
    }
}

/// Telemetry view of one device, in MiB.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceMemoryInfo {
    pub device_id: u32,
    pub used_mb: u64,
    pub total_mb: u64,
    pub free_mb: u64,
    /// `used / total * 100`; 0.0 when unknown.
    pub utilization_pct: f64,
    /// False when monitoring is degraded and the figures are placeholders.
    pub known: bool,
}

impl DeviceMemoryInfo {
    #[must_use]
    pub fn from_snapshot(device_id: u32, snapshot: MemorySnapshot) -> Self {
        let utilization_pct = if snapshot.total_bytes == 0 {
            0.0
        } else {
            snapshot.used_bytes as f64 / snapshot.total_bytes as f64 * 100.0
        };
        Self {
            device_id,
            used_mb: snapshot.used_bytes / MIB,
            total_mb: snapshot.total_bytes / MIB,
            free_mb: snapshot.free_bytes() / MIB,
            utilization_pct,
            known: snapshot.is_known(),
        }
    }
}

/// Answers "which devices exist" and "what is their memory state now".
#[derive(Clone)]
pub struct DeviceInventory {
    runtime: Arc<dyn ComputeRuntime>,
    monitoring: Arc<MonitoringLifecycle>,
    cache: CacheController,
}

impl std::fmt::Debug for DeviceInventory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceInventory")
            .field("runtime", &self.runtime.backend_name())
            .field("monitoring", &self.monitoring.state())
            .finish()
    }
}

impl DeviceInventory {
    pub fn new(runtime: Arc<dyn ComputeRuntime>, monitoring: Arc<MonitoringLifecycle>) -> Self {
        let cache = CacheController::new(runtime.clone());
        Self {
            runtime,
            monitoring,
            cache,
        }
    }

    /// Ids of every visible device; empty when none are visible.
    ///
    /// # Errors
    ///
    /// Only when the runtime fails to report its device count.
    pub fn list_devices(&self) -> LifecycleResult<Vec<u32>> {
        Ok((0..self.runtime.device_count()?).collect())
    }

    /// Current reading for `device_id`; [`MemorySnapshot::UNKNOWN`] when
    /// monitoring is degraded.
    ///
    /// # Errors
    ///
    /// `DeviceNotFound` when `device_id` is outside the visible range.
    pub fn get_memory(&self, device_id: u32) -> LifecycleResult<MemorySnapshot> {
        let visible = self.runtime.device_count()?;
        if device_id >= visible {
            return Err(LifecycleError::DeviceNotFound { device_id, visible });
        }
        Ok(self.monitoring.read(device_id).into())
    }

    /// Telemetry snapshot for `device_id`.
    pub fn get_memory_info(&self, device_id: u32) -> LifecycleResult<DeviceMemoryInfo> {
        let snapshot = self.get_memory(device_id)?;
        Ok(DeviceMemoryInfo::from_snapshot(device_id, snapshot))
    }

    /// Telemetry snapshot for every visible device.
    pub fn get_memory_info_all(&self) -> LifecycleResult<Vec<DeviceMemoryInfo>> {
        self.list_devices()?
            .into_iter()
            .map(|id| self.get_memory_info(id))
            .collect()
    }

    /// Release cached memory on one device, or all when `None`.
    ///
    /// See [`CacheController::clear`].
    pub fn clear_cache(&self, device_id: Option<u32>) -> LifecycleResult<ClearSummary> {
        self.cache.clear(device_id)
    }

    #[must_use]
    pub fn cache(&self) -> &CacheController {
        &self.cache
    }

    #[must_use]
    pub fn runtime(&self) -> &Arc<dyn ComputeRuntime> {
        &self.runtime
    }

    #[must_use]
    pub fn monitoring(&self) -> &Arc<MonitoringLifecycle> {
        &self.monitoring
    }
}

/// Format bytes as a human-readable string.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= GIB {
        format!("{:.2}GB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2}MB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2}KB", bytes as f64 / KIB as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::disabled_monitor_factory;
    use crate::runtime::NullRuntime;
    use crate::sim::{SimulatedMonitor, SimulatedRuntime};

    fn sim_inventory(devices: usize) -> (DeviceInventory, Arc<SimulatedRuntime>) {
        let sim = Arc::new(SimulatedRuntime::uniform(devices, 8 * GIB));
        let monitoring = Arc::new(MonitoringLifecycle::new(
            SimulatedMonitor::new(sim.clone()).factory(),
        ));
        monitoring.initialize();
        (DeviceInventory::new(sim.clone(), monitoring), sim)
    }

    #[test]
    fn test_list_devices() {
        let (inventory, _) = sim_inventory(3);
        assert_eq!(inventory.list_devices().unwrap(), vec![0, 1, 2]);

        let empty = DeviceInventory::new(
            Arc::new(NullRuntime),
            Arc::new(MonitoringLifecycle::new(disabled_monitor_factory("off"))),
        );
        assert!(empty.list_devices().unwrap().is_empty());
    }

    #[test]
    fn test_get_memory_reads_backend() {
        let (inventory, sim) = sim_inventory(2);
        sim.allocate(1, 2 * GIB).unwrap();
        let snapshot = inventory.get_memory(1).unwrap();
        assert_eq!(snapshot, MemorySnapshot::new(2 * GIB, 8 * GIB));
        assert_eq!(snapshot.free_bytes(), 6 * GIB);
        assert!(snapshot.is_known());
    }

    #[test]
    fn test_get_memory_out_of_range() {
        let (inventory, _) = sim_inventory(2);
        let err = inventory.get_memory(2).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::DeviceNotFound {
                device_id: 2,
                visible: 2
            }
        ));
    }

    #[test]
    fn test_get_memory_degraded_is_unknown() {
        let sim = Arc::new(SimulatedRuntime::uniform(1, 8 * GIB));
        sim.allocate(0, GIB).unwrap();
        let monitoring = Arc::new(MonitoringLifecycle::new(disabled_monitor_factory("absent")));
        monitoring.initialize();
        let inventory = DeviceInventory::new(sim, monitoring);

        let snapshot = inventory.get_memory(0).unwrap();
        assert_eq!(snapshot, MemorySnapshot::UNKNOWN);
        assert!(!snapshot.is_known());
    }

    #[test]
    fn test_memory_info_conversion() {
        let info = DeviceMemoryInfo::from_snapshot(0, MemorySnapshot::new(GIB, 4 * GIB));
        assert_eq!(info.used_mb, 1024);
        assert_eq!(info.total_mb, 4096);
        assert_eq!(info.free_mb, 3072);
        assert!((info.utilization_pct - 25.0).abs() < f64::EPSILON);
        assert!(info.known);

        let unknown = DeviceMemoryInfo::from_snapshot(3, MemorySnapshot::UNKNOWN);
        assert_eq!(unknown.utilization_pct, 0.0);
        assert!(!unknown.known);
    }

    #[test]
    fn test_free_bytes_saturates() {
        let odd = MemorySnapshot::new(10, 5);
        assert_eq!(odd.free_bytes(), 0);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2048), "2.00KB");
        assert_eq!(format_bytes(500 * MIB), "500.00MB");
        assert_eq!(format_bytes(3 * GIB / 2), "1.50GB");
    }
}
