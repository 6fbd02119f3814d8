//! Cached device memory release and scoped current-device switching.
//!
//! # Current-device constraint
//!
//! [`ActiveDeviceGuard`] switches the runtime's implicit current device and
//! restores the previous one on drop. The underlying convention is global
//! state the runtime does not synchronize: using guards on *different*
//! devices from several threads at once is undefined at the runtime level
//! and must be serialized by the caller. The guard is `!Send` so a restore
//! always happens on the thread that made the switch.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::LifecycleResult;
use crate::runtime::{check_device, ComputeRuntime};

/// Outcome of a cache clear.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClearSummary {
    /// Devices whose cache was released.
    pub cleared: Vec<u32>,
    /// Devices that failed, with the error message.
    pub failed: Vec<(u32, String)>,
}

impl ClearSummary {
    /// True when no device failed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Stateless cache operations over a compute runtime.
#[derive(Clone)]
pub struct CacheController {
    runtime: Arc<dyn ComputeRuntime>,
}

impl std::fmt::Debug for CacheController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheController")
            .field("runtime", &self.runtime.backend_name())
            .finish()
    }
}

impl CacheController {
    pub fn new(runtime: Arc<dyn ComputeRuntime>) -> Self {
        Self { runtime }
    }

    /// Release cached memory on one device, or on every visible device
    /// when `target` is `None`.
    ///
    /// Outstanding work is synchronized first, so readings taken right
    /// after this returns are accurate.
    ///
    /// # Errors
    ///
    /// Single-device mode propagates the failure (`DeviceNotFound`,
    /// `RuntimeUnavailable`, `RuntimeCall`). All-devices mode only fails
    /// if the device count cannot be read; per-device failures are logged
    /// and listed in [`ClearSummary::failed`] without stopping the sweep.
    pub fn clear(&self, target: Option<u32>) -> LifecycleResult<ClearSummary> {
        match target {
            Some(device) => {
                self.clear_device(device)?;
                Ok(ClearSummary {
                    cleared: vec![device],
                    failed: Vec::new(),
                })
            }
            None => self.clear_all(),
        }
    }

    /// Synchronize and release cached memory on `device`.
    pub fn clear_device(&self, device: u32) -> LifecycleResult<()> {
        check_device(self.runtime.as_ref(), device)?;
        self.runtime.synchronize(device)?;
        self.runtime.release_cached(device)?;
        debug!(
            target: "accel_lifecycle::cache",
            device_id = device,
            "Released cached device memory"
        );
        Ok(())
    }

    fn clear_all(&self) -> LifecycleResult<ClearSummary> {
        let count = self.runtime.device_count()?;
        let mut summary = ClearSummary::default();

        for device in 0..count {
            match self.clear_device(device) {
                Ok(()) => summary.cleared.push(device),
                Err(e) => {
                    warn!(
                        target: "accel_lifecycle::cache",
                        device_id = device,
                        error = %e,
                        "Cache clear failed; continuing with remaining devices"
                    );
                    summary.failed.push((device, e.to_string()));
                }
            }
        }

        Ok(summary)
    }

    /// Make `device` current until the returned guard drops.
    ///
    /// # Errors
    ///
    /// `RuntimeUnavailable`/`DeviceNotFound` for an invalid device, or the
    /// runtime's failure reading or switching the current device.
    pub fn set_active_device(&self, device: u32) -> LifecycleResult<ActiveDeviceGuard> {
        ActiveDeviceGuard::switch(self.runtime.clone(), device)
    }
}

/// Restores the previous current device when dropped.
#[must_use = "the previous device is restored as soon as the guard drops"]
pub struct ActiveDeviceGuard {
    runtime: Arc<dyn ComputeRuntime>,
    device: u32,
    previous: Option<u32>,
    restored: bool,
    _not_send: PhantomData<*const ()>,
}

impl ActiveDeviceGuard {
    pub(crate) fn switch(runtime: Arc<dyn ComputeRuntime>, device: u32) -> LifecycleResult<Self> {
        check_device(runtime.as_ref(), device)?;
        let previous = runtime.current_device()?;
        runtime.set_current_device(Some(device))?;
        debug!(
            target: "accel_lifecycle::cache",
            device_id = device,
            previous = ?previous,
            "Switched current device"
        );
        Ok(Self {
            runtime,
            device,
            previous,
            restored: false,
            _not_send: PhantomData,
        })
    }

    /// Device made current by this guard.
    #[inline]
    #[must_use]
    pub fn device(&self) -> u32 {
        self.device
    }

    /// Device that was current before, restored on drop.
    #[inline]
    #[must_use]
    pub fn previous(&self) -> Option<u32> {
        self.previous
    }

    /// Restore now and report the outcome instead of logging it.
    pub fn restore(mut self) -> LifecycleResult<()> {
        self.restored = true;
        self.runtime.set_current_device(self.previous)
    }
}

impl std::fmt::Debug for ActiveDeviceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveDeviceGuard")
            .field("device", &self.device)
            .field("previous", &self.previous)
            .finish()
    }
}

impl Drop for ActiveDeviceGuard {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        self.restored = true;
        // Drop must not panic
        if let Err(e) = self.runtime.set_current_device(self.previous) {
            warn!(
                target: "accel_lifecycle::cache",
                device_id = self.device,
                previous = ?self.previous,
                error = %e,
                "Failed to restore previous current device"
            );
        }
    }
}
