//! Simulated compute runtime and monitoring backend.
//!
//! An in-process device model with a caching allocator: freed memory
//! stays reserved (and counted as used by the monitor) until
//! `release_cached` runs, as with real device allocators. Used by the test
//! suite and by hosts that want to exercise orchestration code without an
//! accelerator.
//!
//! ```
//! use std::sync::Arc;
//! use accel_lifecycle::sim::{SimulatedMonitor, SimulatedRuntime};
//! use accel_lifecycle::runtime::ComputeRuntime;
//! use accel_lifecycle::monitor::MemoryMonitor;
//!
//! let runtime = Arc::new(SimulatedRuntime::uniform(1, 1024));
//! let monitor = SimulatedMonitor::new(runtime.clone());
//! runtime.allocate(0, 256).unwrap();
//! runtime.free(0, 256);
//! assert_eq!(monitor.memory(0).unwrap(), (256, 1024)); // still cached
//! runtime.release_cached(0).unwrap();
//! assert_eq!(monitor.memory(0).unwrap(), (0, 1024));
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{LifecycleError, LifecycleResult, RUNTIME_OUT_OF_MEMORY};
use crate::monitor::{MemoryMonitor, MonitorFactory};
use crate::runtime::ComputeRuntime;

/// Simulated generic failure code.
const SIM_INJECTED_FAILURE: i32 = 999;

#[derive(Debug, Clone, Default)]
struct SimDevice {
    total: u64,
    allocated: u64,
    cached: u64,
    context_bytes: u64,
    context_created: bool,
    clears: usize,
    syncs: usize,
    fail_clear: bool,
    failing_syncs: usize,
}

impl SimDevice {
    fn used(&self) -> u64 {
        self.allocated + self.cached + if self.context_created { self.context_bytes } else { 0 }
    }

    fn touch_context(&mut self) {
        self.context_created = true;
    }
}

/// In-process device model implementing [`ComputeRuntime`].
#[derive(Debug)]
pub struct SimulatedRuntime {
    devices: Mutex<Vec<SimDevice>>,
    current: Mutex<Option<u32>>,
}

impl SimulatedRuntime {
    /// Devices with the given total capacities (bytes).
    pub fn new(totals: &[u64]) -> Self {
        Self {
            devices: Mutex::new(
                totals
                    .iter()
                    .map(|&total| SimDevice {
                        total,
                        ..Default::default()
                    })
                    .collect(),
            ),
            current: Mutex::new(None),
        }
    }

    /// `count` devices of `total` bytes each.
    pub fn uniform(count: usize, total: u64) -> Self {
        Self::new(&vec![total; count])
    }

    /// Emulate a driver that lazily creates a per-device context of
    /// `bytes` the first time work is synchronized or the device is made
    /// current.
    pub fn with_lazy_context(self, bytes: u64) -> Self {
        for device in self.devices.lock().iter_mut() {
            device.context_bytes = bytes;
        }
        self
    }

    fn with_device<T>(
        &self,
        device: u32,
        f: impl FnOnce(&mut SimDevice) -> LifecycleResult<T>,
    ) -> LifecycleResult<T> {
        let mut devices = self.devices.lock();
        match devices.get_mut(device as usize) {
            Some(d) => f(d),
            None => {
                let visible = devices.len() as u32;
                Err(LifecycleError::DeviceNotFound {
                    device_id: device,
                    visible,
                })
            }
        }
    }

    /// Allocate `bytes` on `device`, reusing cached memory first.
    ///
    /// # Errors
    ///
    /// `DeviceNotFound`, or `RuntimeCall` (out of memory) when the
    /// allocation does not fit.
    pub fn allocate(&self, device: u32, bytes: u64) -> LifecycleResult<()> {
        self.with_device(device, |d| {
            if d.cached >= bytes {
                d.cached -= bytes;
            } else {
                let fresh = bytes - d.cached;
                let free = d.total.saturating_sub(d.used());
                if fresh > free {
                    return Err(LifecycleError::runtime_call(
                        "allocate",
                        Some(device),
                        RUNTIME_OUT_OF_MEMORY,
                        format!("out of memory: requested {} bytes, {} free", bytes, free),
                    ));
                }
                d.cached = 0;
            }
            d.allocated += bytes;
            Ok(())
        })
    }

    /// Free `bytes` on `device`; the memory stays cached until released.
    pub fn free(&self, device: u32, bytes: u64) {
        let _ = self.with_device(device, |d| {
            let freed = bytes.min(d.allocated);
            d.allocated -= freed;
            d.cached += freed;
            Ok(())
        });
    }

    /// Make `release_cached` fail on `device`.
    pub fn fail_clear_on(&self, device: u32, fail: bool) {
        let _ = self.with_device(device, |d| {
            d.fail_clear = fail;
            Ok(())
        });
    }

    /// Make the next `count` `synchronize` calls on `device` fail.
    pub fn fail_next_syncs(&self, device: u32, count: usize) {
        let _ = self.with_device(device, |d| {
            d.failing_syncs = count;
            Ok(())
        });
    }

    /// Bytes in use on `device` (live + cached + driver context).
    #[must_use]
    pub fn used_bytes(&self, device: u32) -> u64 {
        self.with_device(device, |d| Ok(d.used())).unwrap_or(0)
    }

    /// Cached-but-unused bytes on `device`.
    #[must_use]
    pub fn cached_bytes(&self, device: u32) -> u64 {
        self.with_device(device, |d| Ok(d.cached)).unwrap_or(0)
    }

    /// Number of `release_cached` attempts on `device`.
    #[must_use]
    pub fn clear_count(&self, device: u32) -> usize {
        self.with_device(device, |d| Ok(d.clears)).unwrap_or(0)
    }

    /// Number of `synchronize` calls on `device`.
    #[must_use]
    pub fn sync_count(&self, device: u32) -> usize {
        self.with_device(device, |d| Ok(d.syncs)).unwrap_or(0)
    }

    fn reading(&self, device: u32) -> LifecycleResult<(u64, u64)> {
        self.with_device(device, |d| Ok((d.used(), d.total)))
    }
}

impl ComputeRuntime for SimulatedRuntime {
    fn device_count(&self) -> LifecycleResult<u32> {
        Ok(self.devices.lock().len() as u32)
    }

    fn current_device(&self) -> LifecycleResult<Option<u32>> {
        Ok(*self.current.lock())
    }

    fn set_current_device(&self, device: Option<u32>) -> LifecycleResult<()> {
        if let Some(d) = device {
            self.with_device(d, |dev| {
                dev.touch_context();
                Ok(())
            })?;
        }
        *self.current.lock() = device;
        Ok(())
    }

    fn synchronize(&self, device: u32) -> LifecycleResult<()> {
        self.with_device(device, |d| {
            d.syncs += 1;
            if d.failing_syncs > 0 {
                d.failing_syncs -= 1;
                return Err(LifecycleError::runtime_call(
                    "synchronize",
                    Some(device),
                    SIM_INJECTED_FAILURE,
                    "injected failure",
                ));
            }
            d.touch_context();
            Ok(())
        })
    }

    fn release_cached(&self, device: u32) -> LifecycleResult<()> {
        self.with_device(device, |d| {
            d.clears += 1;
            if d.fail_clear {
                return Err(LifecycleError::runtime_call(
                    "release_cached",
                    Some(device),
                    SIM_INJECTED_FAILURE,
                    "injected failure",
                ));
            }
            d.cached = 0;
            Ok(())
        })
    }

    fn backend_name(&self) -> &'static str {
        "simulated"
    }
}

#[derive(Debug, Default)]
struct MonitorStats {
    starts: AtomicUsize,
    stops: AtomicUsize,
}

/// Monitoring backend reading a [`SimulatedRuntime`].
///
/// Clones share their start/stop counters, so a factory built from one
/// instance reports every generation's starts.
#[derive(Debug, Clone)]
pub struct SimulatedMonitor {
    runtime: Arc<SimulatedRuntime>,
    stats: Arc<MonitorStats>,
    present: bool,
}

impl SimulatedMonitor {
    /// Working backend over `runtime`.
    pub fn new(runtime: Arc<SimulatedRuntime>) -> Self {
        Self {
            runtime,
            stats: Arc::new(MonitorStats::default()),
            present: true,
        }
    }

    /// Backend whose library is "missing": `start` fails.
    pub fn absent(runtime: Arc<SimulatedRuntime>) -> Self {
        Self {
            present: false,
            ..Self::new(runtime)
        }
    }

    /// Factory handing out clones of this monitor.
    pub fn factory(&self) -> MonitorFactory {
        let monitor = self.clone();
        Arc::new(move || Box::new(monitor.clone()) as Box<dyn MemoryMonitor>)
    }

    /// Successful `start` calls across all clones.
    #[must_use]
    pub fn start_count(&self) -> usize {
        self.stats.starts.load(Ordering::SeqCst)
    }

    /// `stop` calls across all clones.
    #[must_use]
    pub fn stop_count(&self) -> usize {
        self.stats.stops.load(Ordering::SeqCst)
    }
}

impl MemoryMonitor for SimulatedMonitor {
    fn start(&self) -> LifecycleResult<()> {
        if !self.present {
            return Err(LifecycleError::Monitoring(
                "simulated monitoring library not found".to_string(),
            ));
        }
        self.stats.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> LifecycleResult<()> {
        self.stats.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn memory(&self, device_index: u32) -> LifecycleResult<(u64, u64)> {
        if !self.present {
            return Ok((0, 0));
        }
        self.runtime
            .reading(device_index)
            .map_err(|e| LifecycleError::Monitoring(e.to_string()))
    }

    fn backend_name(&self) -> &'static str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caching_allocator_reuses_cache() {
        let sim = SimulatedRuntime::uniform(1, 1000);
        sim.allocate(0, 400).unwrap();
        sim.free(0, 400);
        assert_eq!(sim.cached_bytes(0), 400);
        assert_eq!(sim.used_bytes(0), 400);

        sim.allocate(0, 300).unwrap();
        assert_eq!(sim.cached_bytes(0), 100);
        assert_eq!(sim.used_bytes(0), 400);
    }

    #[test]
    fn test_out_of_memory() {
        let sim = SimulatedRuntime::uniform(1, 1000);
        sim.allocate(0, 900).unwrap();
        let err = sim.allocate(0, 200).unwrap_err();
        assert!(matches!(err, LifecycleError::RuntimeCall { code: 2, .. }));
        assert!(err.is_retryable());
        assert_eq!(sim.used_bytes(0), 900);
    }

    #[test]
    fn test_lazy_context_appears_on_first_sync() {
        let sim = SimulatedRuntime::uniform(1, 1000).with_lazy_context(64);
        assert_eq!(sim.used_bytes(0), 0);
        sim.synchronize(0).unwrap();
        assert_eq!(sim.used_bytes(0), 64);
        sim.synchronize(0).unwrap();
        assert_eq!(sim.used_bytes(0), 64);
    }

    #[test]
    fn test_injected_clear_failure_keeps_cache() {
        let sim = SimulatedRuntime::uniform(1, 1000);
        sim.allocate(0, 100).unwrap();
        sim.free(0, 100);
        sim.fail_clear_on(0, true);
        assert!(sim.release_cached(0).is_err());
        assert_eq!(sim.cached_bytes(0), 100);
        assert_eq!(sim.clear_count(0), 1);
    }

    #[test]
    fn test_injected_sync_failures_count_down() {
        let sim = SimulatedRuntime::uniform(1, 1000).with_lazy_context(64);
        sim.fail_next_syncs(0, 1);
        assert!(sim.synchronize(0).is_err());
        assert_eq!(sim.used_bytes(0), 0, "failed sync must not create the context");
        assert!(sim.synchronize(0).is_ok());
        assert_eq!(sim.sync_count(0), 2);
        assert_eq!(sim.used_bytes(0), 64);
    }

    #[test]
    fn test_absent_monitor_reads_unknown() {
        let sim = Arc::new(SimulatedRuntime::uniform(1, 1000));
        let monitor = SimulatedMonitor::absent(sim);
        assert!(monitor.start().is_err());
        assert_eq!(monitor.memory(0).unwrap(), (0, 0));
        assert_eq!(monitor.start_count(), 0);
    }

    #[test]
    fn test_monitor_rejects_unknown_index() {
        let sim = Arc::new(SimulatedRuntime::uniform(1, 1000));
        let monitor = SimulatedMonitor::new(sim);
        assert!(matches!(
            monitor.memory(3),
            Err(LifecycleError::Monitoring(_))
        ));
    }
}
