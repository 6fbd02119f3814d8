//! Scoped acquire → use → release of one device.
//!
//! An [`AllocationSession`] records a baseline reading on acquire, and on
//! release clears the device cache, takes a final reading and compares
//! the two. Release runs exactly once: from [`AllocationSession::release`]
//! or from `Drop`, whichever comes first, so normal completion, early
//! return, `?` propagation and unwinding panics all release.
//!
//! Growth across a session is reported as a *suspected* leak through a
//! `tracing` warning and [`SessionReport::leak_suspected`]. It is never an
//! error: drivers legitimately allocate lazily (contexts, module images)
//! during a first workload.
//!
//! Sessions on the same device are not mutually exclusive; baselines of
//! overlapping sessions see each other's allocations.

use std::marker::PhantomData;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::ActiveDeviceGuard;
use crate::error::LifecycleResult;
use crate::inventory::{format_bytes, DeviceInventory, MemorySnapshot};
use crate::runtime::check_device;

/// Session state machine. `Released` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Acquired,
    Released,
}

/// Per-session knobs, usually taken from `LifecycleConfig`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// Make the device current for the session, restoring the previous
    /// current device on release.
    pub bind_current_device: bool,
    /// Growth up to this many bytes is not reported as a leak.
    pub leak_tolerance_bytes: u64,
}

/// Outcome of a released session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    pub device_id: u32,
    pub baseline: MemorySnapshot,
    pub final_snapshot: MemorySnapshot,
    /// `final.used - baseline.used`; 0 when either reading is unknown.
    pub delta_bytes: i64,
    pub leak_suspected: bool,
}

/// One guarded use of a device. Releases on drop.
///
/// Not `Send`: a bound current device must be restored on the thread
/// that bound it.
#[must_use = "the session releases as soon as it is dropped"]
pub struct AllocationSession {
    inventory: DeviceInventory,
    device_id: u32,
    options: SessionOptions,
    state: SessionState,
    baseline: Option<MemorySnapshot>,
    report: Option<SessionReport>,
    device_guard: Option<ActiveDeviceGuard>,
    _not_send: PhantomData<*const ()>,
}

impl AllocationSession {
    /// Acquire `device_id`.
    ///
    /// Validates the device before touching the monitoring lifecycle, so
    /// a rejected acquisition leaves monitoring state as it was. After
    /// validation the lifecycle is initialized (idempotent) and the
    /// baseline recorded.
    ///
    /// A failed acquisition still runs a best-effort cache clear whose
    /// own failure is only logged.
    ///
    /// # Errors
    ///
    /// - `RuntimeUnavailable` when the runtime sees no devices
    /// - `DeviceNotFound` when `device_id` is out of range
    /// - runtime failures while binding the current device
    pub fn acquire(
        inventory: DeviceInventory,
        device_id: u32,
        options: SessionOptions,
    ) -> LifecycleResult<Self> {
        let mut session = Self {
            inventory,
            device_id,
            options,
            state: SessionState::Created,
            baseline: None,
            report: None,
            device_guard: None,
            _not_send: PhantomData,
        };

        // On error the session drops in Created state, which runs cleanup.
        session.enter()?;
        Ok(session)
    }

    fn enter(&mut self) -> LifecycleResult<()> {
        check_device(self.inventory.runtime().as_ref(), self.device_id)?;
        self.inventory.monitoring().initialize();

        if self.options.bind_current_device {
            self.device_guard = Some(ActiveDeviceGuard::switch(
                self.inventory.runtime().clone(),
                self.device_id,
            )?);
        }

        // Settle the driver context before the baseline; release
        // synchronizes too, and lazy context creation there would read as
        // growth across the session.
        self.inventory.runtime().synchronize(self.device_id)?;

        let baseline = self.inventory.get_memory(self.device_id)?;
        self.baseline = Some(baseline);
        self.state = SessionState::Acquired;

        debug!(
            target: "accel_lifecycle::session",
            device_id = self.device_id,
            baseline_used = baseline.used_bytes,
            baseline_known = baseline.is_known(),
            "Session acquired"
        );
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Reading taken on acquire.
    #[must_use]
    pub fn baseline(&self) -> Option<MemorySnapshot> {
        self.baseline
    }

    /// Whether the session holds the runtime's current device.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.device_guard.is_some()
    }

    /// Release now.
    ///
    /// Returns the report on the first call after a successful acquire and
    /// `None` on every later call. Cleanup failures are logged, never
    /// returned.
    pub fn release(&mut self) -> Option<SessionReport> {
        match self.state {
            SessionState::Released => None,
            SessionState::Created => {
                self.state = SessionState::Released;
                self.cleanup_failed_acquire();
                None
            }
            SessionState::Acquired => {
                self.state = SessionState::Released;
                let report = self.finish();
                self.report = Some(report);
                self.restore_device();
                Some(report)
            }
        }
    }

    /// Release if still acquired and return the session's report.
    ///
    /// Unlike [`release`](Self::release) this also yields the report when
    /// the session was already released earlier.
    pub fn into_report(mut self) -> SessionReport {
        let _ = self.release();
        self.report.unwrap_or(SessionReport {
            device_id: self.device_id,
            baseline: MemorySnapshot::UNKNOWN,
            final_snapshot: MemorySnapshot::UNKNOWN,
            delta_bytes: 0,
            leak_suspected: false,
        })
    }

    fn cleanup_failed_acquire(&mut self) {
        if let Err(e) = self.inventory.clear_cache(Some(self.device_id)) {
            debug!(
                target: "accel_lifecycle::session",
                device_id = self.device_id,
                error = %e,
                "Cleanup after failed acquisition could not clear cache"
            );
        }
        self.restore_device();
    }

    fn finish(&mut self) -> SessionReport {
        if let Err(e) = self.inventory.clear_cache(Some(self.device_id)) {
            warn!(
                target: "accel_lifecycle::session",
                device_id = self.device_id,
                error = %e,
                "Cache clear on release failed"
            );
        }

        let final_snapshot = match self.inventory.get_memory(self.device_id) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    target: "accel_lifecycle::session",
                    device_id = self.device_id,
                    error = %e,
                    "Final memory reading failed"
                );
                MemorySnapshot::UNKNOWN
            }
        };
        let baseline = self.baseline.unwrap_or(MemorySnapshot::UNKNOWN);

        let comparable = baseline.is_known() && final_snapshot.is_known();
        let delta_bytes = if comparable {
            signed_delta(final_snapshot.used_bytes, baseline.used_bytes)
        } else {
            0
        };
        let tolerance = i64::try_from(self.options.leak_tolerance_bytes).unwrap_or(i64::MAX);
        let leak_suspected = comparable && delta_bytes > tolerance;

        if leak_suspected {
            warn!(
                target: "accel_lifecycle::session",
                device_id = self.device_id,
                delta_bytes,
                "Suspected device memory leak: used memory grew by {} across session",
                format_bytes(delta_bytes.unsigned_abs())
            );
        } else {
            info!(
                target: "accel_lifecycle::session",
                device_id = self.device_id,
                delta_bytes,
                "Session released"
            );
        }

        SessionReport {
            device_id: self.device_id,
            baseline,
            final_snapshot,
            delta_bytes,
            leak_suspected,
        }
    }

    fn restore_device(&mut self) {
        if let Some(guard) = self.device_guard.take() {
            if let Err(e) = guard.restore() {
                warn!(
                    target: "accel_lifecycle::session",
                    device_id = self.device_id,
                    error = %e,
                    "Failed to restore previous current device"
                );
            }
        }
    }
}

fn signed_delta(after: u64, before: u64) -> i64 {
    if after >= before {
        i64::try_from(after - before).unwrap_or(i64::MAX)
    } else {
        i64::try_from(before - after).map_or(i64::MIN, |d| -d)
    }
}

impl std::fmt::Debug for AllocationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationSession")
            .field("device_id", &self.device_id)
            .field("state", &self.state)
            .field("baseline", &self.baseline)
            .field("bound", &self.device_guard.is_some())
            .finish()
    }
}

impl Drop for AllocationSession {
    fn drop(&mut self) {
        // Drop must not panic
        let _ = self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LifecycleError;
    use crate::lifecycle::MonitoringLifecycle;
    use crate::runtime::ComputeRuntime;
    use crate::sim::{SimulatedMonitor, SimulatedRuntime};
    use std::sync::Arc;

    const GIB: u64 = 1 << 30;

    fn setup(devices: usize) -> (DeviceInventory, Arc<SimulatedRuntime>) {
        let sim = Arc::new(SimulatedRuntime::uniform(devices, 8 * GIB));
        let monitoring = Arc::new(MonitoringLifecycle::new(
            SimulatedMonitor::new(sim.clone()).factory(),
        ));
        (DeviceInventory::new(sim.clone(), monitoring), sim)
    }

    #[test]
    fn test_acquire_release_no_growth() {
        let (inventory, sim) = setup(1);
        let mut session =
            AllocationSession::acquire(inventory, 0, SessionOptions::default()).unwrap();
        assert_eq!(session.state(), SessionState::Acquired);

        let report = session.release().expect("first release reports");
        assert_eq!(report.delta_bytes, 0);
        assert!(!report.leak_suspected);
        assert_eq!(session.state(), SessionState::Released);
        assert_eq!(sim.clear_count(0), 1);
    }

    #[test]
    fn test_double_release_is_noop() {
        let (inventory, sim) = setup(1);
        let mut session =
            AllocationSession::acquire(inventory, 0, SessionOptions::default()).unwrap();
        assert!(session.release().is_some());
        assert!(session.release().is_none());
        drop(session);
        assert_eq!(sim.clear_count(0), 1);
    }

    #[test]
    fn test_cached_memory_is_not_a_leak() {
        let (inventory, sim) = setup(1);
        let mut session =
            AllocationSession::acquire(inventory, 0, SessionOptions::default()).unwrap();
        sim.allocate(0, GIB).unwrap();
        sim.free(0, GIB);
        let report = session.release().unwrap();
        assert_eq!(report.delta_bytes, 0);
        assert!(!report.leak_suspected);
    }

    #[test]
    fn test_live_allocation_is_suspected_leak() {
        let (inventory, sim) = setup(1);
        let mut session =
            AllocationSession::acquire(inventory, 0, SessionOptions::default()).unwrap();
        sim.allocate(0, 64 * 1024 * 1024).unwrap();
        let report = session.release().unwrap();
        assert_eq!(report.delta_bytes, 64 * 1024 * 1024);
        assert!(report.leak_suspected);
    }

    #[test]
    fn test_shrink_is_negative_delta() {
        let (inventory, sim) = setup(1);
        sim.allocate(0, GIB).unwrap();
        let mut session =
            AllocationSession::acquire(inventory, 0, SessionOptions::default()).unwrap();
        sim.free(0, GIB);
        let report = session.release().unwrap();
        assert_eq!(report.delta_bytes, -(GIB as i64));
        assert!(!report.leak_suspected);
    }

    fn lazy_context_inventory(context_bytes: u64) -> (DeviceInventory, Arc<SimulatedRuntime>) {
        let sim = Arc::new(SimulatedRuntime::uniform(1, 8 * GIB).with_lazy_context(context_bytes));
        let monitoring = Arc::new(MonitoringLifecycle::new(
            SimulatedMonitor::new(sim.clone()).factory(),
        ));
        (DeviceInventory::new(sim.clone(), monitoring), sim)
    }

    #[test]
    fn test_first_session_lazy_context_is_not_a_leak() {
        let (inventory, sim) = lazy_context_inventory(300 * 1024 * 1024);
        let mut session =
            AllocationSession::acquire(inventory, 0, SessionOptions::default()).unwrap();
        assert_eq!(sim.used_bytes(0), 300 * 1024 * 1024, "context created on acquire");

        let report = session.release().unwrap();
        assert_eq!(report.delta_bytes, 0);
        assert!(!report.leak_suspected);
    }

    #[test]
    fn test_tolerance_absorbs_small_growth() {
        let (inventory, sim) = lazy_context_inventory(4096);
        let options = SessionOptions {
            leak_tolerance_bytes: 4096,
            ..SessionOptions::default()
        };
        let mut session = AllocationSession::acquire(inventory, 0, options).unwrap();
        sim.allocate(0, 4096).unwrap();
        let report = session.release().unwrap();
        assert_eq!(report.delta_bytes, 4096);
        assert!(!report.leak_suspected);
    }

    #[test]
    fn test_failed_acquire_after_bind_cleans_up() {
        let (inventory, sim) = setup(2);
        sim.set_current_device(Some(0)).unwrap();
        sim.fail_next_syncs(1, 1);
        let options = SessionOptions {
            bind_current_device: true,
            ..SessionOptions::default()
        };

        let err = AllocationSession::acquire(inventory, 1, options).unwrap_err();
        assert!(
            matches!(err, LifecycleError::RuntimeCall { operation: "synchronize", device_id: Some(1), .. }),
            "original error must surface, got {err:?}"
        );
        assert_eq!(sim.clear_count(1), 1, "best-effort clear must run once");
        assert_eq!(sim.current_device().unwrap(), Some(0));
    }

    #[test]
    fn test_failed_cleanup_does_not_mask_acquire_error() {
        let (inventory, sim) = setup(1);
        sim.fail_next_syncs(0, 2);
        sim.fail_clear_on(0, true);

        let err = AllocationSession::acquire(inventory, 0, SessionOptions::default()).unwrap_err();
        assert!(matches!(err, LifecycleError::RuntimeCall { operation: "synchronize", .. }));
    }

    #[test]
    fn test_into_report_after_release_returns_same_report() {
        let (inventory, sim) = setup(1);
        let mut session =
            AllocationSession::acquire(inventory, 0, SessionOptions::default()).unwrap();
        sim.allocate(0, 1024).unwrap();
        let first = session.release().unwrap();
        assert_eq!(session.into_report(), first);
        assert_eq!(sim.clear_count(0), 1);
    }

    #[test]
    fn test_invalid_device_fails_and_leaves_monitoring_untouched() {
        let (inventory, _) = setup(2);
        let monitoring = inventory.monitoring().clone();
        let before = monitoring.state();

        let err = AllocationSession::acquire(inventory, 5, SessionOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::DeviceNotFound {
                device_id: 5,
                visible: 2
            }
        ));
        assert_eq!(monitoring.state(), before);
    }

    #[test]
    fn test_no_devices_is_runtime_unavailable() {
        let (inventory, _) = setup(0);
        let err = AllocationSession::acquire(inventory, 0, SessionOptions::default()).unwrap_err();
        assert!(matches!(err, LifecycleError::RuntimeUnavailable));
    }

    #[test]
    fn test_bound_session_restores_current_device() {
        let (inventory, sim) = setup(2);
        sim.set_current_device(Some(0)).unwrap();
        let options = SessionOptions {
            bind_current_device: true,
            ..SessionOptions::default()
        };
        {
            let session = AllocationSession::acquire(inventory, 1, options).unwrap();
            assert!(session.is_bound());
            assert_eq!(sim.current_device().unwrap(), Some(1));
        }
        assert_eq!(sim.current_device().unwrap(), Some(0));
    }

    #[test]
    fn test_signed_delta_extremes() {
        assert_eq!(signed_delta(5, 3), 2);
        assert_eq!(signed_delta(3, 5), -2);
        assert_eq!(signed_delta(u64::MAX, 0), i64::MAX);
        assert_eq!(signed_delta(0, u64::MAX), i64::MIN);
    }
}
