//! Compute runtime seam.
//!
//! The compute runtime executes work on devices and owns their cached
//! memory. This layer needs four capabilities from it: the visible device
//! count, a process-wide "current device", releasing cached-but-unused
//! memory per device, and synchronizing outstanding work per device.
//!
//! # Current device
//!
//! Runtimes following the implicit current-device convention keep it as
//! global state the runtime itself does not synchronize. Callers switching
//! it from several threads onto different devices must serialize that
//! themselves; see [`crate::cache::ActiveDeviceGuard`].

#[cfg(feature = "cuda")]
pub mod cuda;

use std::sync::Arc;

use crate::error::{LifecycleError, LifecycleResult};

#[cfg(feature = "cuda")]
pub use cuda::CudaRuntime;

/// Operations consumed from the compute runtime.
///
/// All calls are synchronous and block on the driver.
pub trait ComputeRuntime: Send + Sync {
    /// Number of visible devices. Zero is a valid answer, not an error.
    fn device_count(&self) -> LifecycleResult<u32>;

    /// Device currently selected for implicit-device calls, if any.
    fn current_device(&self) -> LifecycleResult<Option<u32>>;

    /// Select `device` for implicit-device calls; `None` clears the binding.
    fn set_current_device(&self, device: Option<u32>) -> LifecycleResult<()>;

    /// Wait for all outstanding work on `device` to finish.
    fn synchronize(&self, device: u32) -> LifecycleResult<()>;

    /// Return cached-but-unused memory on `device` to the driver.
    fn release_cached(&self, device: u32) -> LifecycleResult<()>;

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;
}

/// Check `device` against the runtime's visible range.
///
/// # Errors
///
/// - `RuntimeUnavailable` if the runtime sees no devices
/// - `DeviceNotFound` if `device` is out of range
pub fn check_device(runtime: &dyn ComputeRuntime, device: u32) -> LifecycleResult<()> {
    let visible = runtime.device_count()?;
    if visible == 0 {
        return Err(LifecycleError::RuntimeUnavailable);
    }
    if device >= visible {
        return Err(LifecycleError::DeviceNotFound {
            device_id: device,
            visible,
        });
    }
    Ok(())
}

/// Runtime for hosts without an accelerator runtime: sees no devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRuntime;

impl NullRuntime {
    fn not_found(device: u32) -> LifecycleError {
        LifecycleError::DeviceNotFound {
            device_id: device,
            visible: 0,
        }
    }
}

impl ComputeRuntime for NullRuntime {
    fn device_count(&self) -> LifecycleResult<u32> {
        Ok(0)
    }

    fn current_device(&self) -> LifecycleResult<Option<u32>> {
        Ok(None)
    }

    fn set_current_device(&self, device: Option<u32>) -> LifecycleResult<()> {
        match device {
            None => Ok(()),
            Some(d) => Err(Self::not_found(d)),
        }
    }

    fn synchronize(&self, device: u32) -> LifecycleResult<()> {
        Err(Self::not_found(device))
    }

    fn release_cached(&self, device: u32) -> LifecycleResult<()> {
        Err(Self::not_found(device))
    }

    fn backend_name(&self) -> &'static str {
        "none"
    }
}

/// Pick the best compute runtime compiled into this build.
///
/// With the `cuda` feature this is [`CudaRuntime`] if the driver
/// initializes; otherwise [`NullRuntime`].
pub fn default_runtime() -> Arc<dyn ComputeRuntime> {
    #[cfg(feature = "cuda")]
    {
        match CudaRuntime::new() {
            Ok(runtime) => return Arc::new(runtime),
            Err(e) => {
                tracing::warn!(
                    target: "accel_lifecycle::runtime",
                    error = %e,
                    "CUDA driver unavailable, running without accelerator runtime"
                );
            }
        }
    }

    tracing::debug!(
        target: "accel_lifecycle::runtime",
        "No accelerator runtime compiled in or available; using null runtime"
    );
    Arc::new(NullRuntime)
}
