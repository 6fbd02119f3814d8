//! CUDA Driver API compute runtime.
//!
//! # Contexts
//!
//! Each device's primary context is retained lazily on first use and
//! released when the runtime is dropped. Primary contexts are shared with
//! every other Driver/Runtime API user in the process, so retaining them
//! never creates competing contexts.
//!
//! # Current device
//!
//! `cuCtxSetCurrent` binds a context to the *calling thread*. The
//! current-device convention exposed here is therefore per thread at the
//! driver level, but callers must still treat it as unsynchronized shared
//! state: nothing stops two guards on one thread from interleaving.

#![cfg(feature = "cuda")]

use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Once;

use parking_lot::Mutex;

use crate::error::{LifecycleError, LifecycleResult};
use crate::ffi::cuda_driver::{
    cuCtxGetCurrent, cuCtxGetDevice, cuCtxSetCurrent, cuCtxSynchronize, cuDeviceGet,
    cuDeviceGetCount, cuDeviceGetDefaultMemPool, cuDevicePrimaryCtxRelease_v2,
    cuDevicePrimaryCtxRetain, cuInit, cuMemPoolTrimTo, cuda_result_to_string, is_cuda_success,
    CUcontext, CUdevice, CUmemoryPool, CUresult, CUDA_ERROR_NOT_SUPPORTED, CUDA_ERROR_NO_DEVICE,
    CUDA_SUCCESS,
};
use crate::runtime::{check_device, ComputeRuntime};

/// Global once-guard for CUDA driver initialization.
static CUDA_INIT: Once = Once::new();

/// Result of CUDA initialization (CUresult = c_int = i32).
static CUDA_INIT_RESULT: AtomicI32 = AtomicI32::new(CUDA_SUCCESS);

fn driver_init() -> LifecycleResult<()> {
    CUDA_INIT.call_once(|| {
        // SAFETY: cuInit(0) is thread-safe and idempotent
        let result = unsafe { cuInit(0) };
        CUDA_INIT_RESULT.store(result, Ordering::Release);
    });

    match CUDA_INIT_RESULT.load(Ordering::Acquire) {
        CUDA_SUCCESS => Ok(()),
        CUDA_ERROR_NO_DEVICE => Err(LifecycleError::RuntimeUnavailable),
        code => Err(LifecycleError::runtime_call(
            "cuInit",
            None,
            code,
            cuda_result_to_string(code),
        )),
    }
}

fn check(result: CUresult, operation: &'static str, device: Option<u32>) -> LifecycleResult<()> {
    if is_cuda_success(result) {
        Ok(())
    } else {
        Err(LifecycleError::runtime_call(
            operation,
            device,
            result,
            cuda_result_to_string(result),
        ))
    }
}

/// A retained primary context.
struct PrimaryContext {
    device: CUdevice,
    context: CUcontext,
}

// SAFETY: primary contexts may be used from any thread; the raw pointer is
// only an identifier handed back to the driver.
unsafe impl Send for PrimaryContext {}

/// Compute runtime backed by the CUDA Driver API.
pub struct CudaRuntime {
    contexts: Mutex<HashMap<u32, PrimaryContext>>,
}

impl std::fmt::Debug for CudaRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaRuntime")
            .field("retained_contexts", &self.contexts.lock().len())
            .finish()
    }
}

impl CudaRuntime {
    /// Initialize the driver (once per process) and build a runtime.
    ///
    /// # Errors
    ///
    /// - `RuntimeUnavailable` if the driver reports no devices
    /// - `RuntimeCall` if `cuInit` fails for another reason
    pub fn new() -> LifecycleResult<Self> {
        driver_init()?;
        Ok(Self {
            contexts: Mutex::new(HashMap::new()),
        })
    }

    /// Retain (once) and return the primary context of `device`.
    fn context(&self, device: u32) -> LifecycleResult<CUcontext> {
        let mut contexts = self.contexts.lock();
        if let Some(primary) = contexts.get(&device) {
            return Ok(primary.context);
        }

        let mut handle: CUdevice = 0;
        // SAFETY: driver initialized, pointer valid
        check(
            unsafe { cuDeviceGet(&mut handle, device as i32) },
            "cuDeviceGet",
            Some(device),
        )?;

        let mut context: CUcontext = ptr::null_mut();
        // SAFETY: handle is a valid device, pointer valid
        check(
            unsafe { cuDevicePrimaryCtxRetain(&mut context, handle) },
            "cuDevicePrimaryCtxRetain",
            Some(device),
        )?;

        contexts.insert(
            device,
            PrimaryContext {
                device: handle,
                context,
            },
        );
        Ok(context)
    }

    /// Run `f` with `device`'s context current, restoring the previous one.
    fn with_device<T>(
        &self,
        device: u32,
        f: impl FnOnce() -> LifecycleResult<T>,
    ) -> LifecycleResult<T> {
        check_device(self, device)?;
        let context = self.context(device)?;

        let mut previous: CUcontext = ptr::null_mut();
        // SAFETY: pointer valid
        check(
            unsafe { cuCtxGetCurrent(&mut previous) },
            "cuCtxGetCurrent",
            Some(device),
        )?;
        // SAFETY: context retained above
        check(
            unsafe { cuCtxSetCurrent(context) },
            "cuCtxSetCurrent",
            Some(device),
        )?;

        let result = f();

        // SAFETY: previous was current on this thread a moment ago (or null)
        let restore = unsafe { cuCtxSetCurrent(previous) };
        if restore != CUDA_SUCCESS {
            tracing::warn!(
                target: "accel_lifecycle::runtime::cuda",
                device_id = device,
                error = %cuda_result_to_string(restore),
                "Failed to restore previous CUDA context"
            );
        }

        result
    }
}

impl ComputeRuntime for CudaRuntime {
    fn device_count(&self) -> LifecycleResult<u32> {
        let mut count: i32 = 0;
        // SAFETY: driver initialized in new(), pointer valid
        check(unsafe { cuDeviceGetCount(&mut count) }, "cuDeviceGetCount", None)?;
        Ok(count.max(0) as u32)
    }

    fn current_device(&self) -> LifecycleResult<Option<u32>> {
        let mut context: CUcontext = ptr::null_mut();
        // SAFETY: pointer valid
        check(unsafe { cuCtxGetCurrent(&mut context) }, "cuCtxGetCurrent", None)?;
        if context.is_null() {
            return Ok(None);
        }

        let mut device: CUdevice = 0;
        // SAFETY: a context is current, pointer valid
        check(unsafe { cuCtxGetDevice(&mut device) }, "cuCtxGetDevice", None)?;
        Ok(Some(device.max(0) as u32))
    }

    fn set_current_device(&self, device: Option<u32>) -> LifecycleResult<()> {
        let context = match device {
            Some(d) => {
                check_device(self, d)?;
                self.context(d)?
            }
            None => ptr::null_mut(),
        };
        // SAFETY: context is retained or null
        check(unsafe { cuCtxSetCurrent(context) }, "cuCtxSetCurrent", device)
    }

    fn synchronize(&self, device: u32) -> LifecycleResult<()> {
        self.with_device(device, || {
            // SAFETY: device context is current
            check(unsafe { cuCtxSynchronize() }, "cuCtxSynchronize", Some(device))
        })
    }

    fn release_cached(&self, device: u32) -> LifecycleResult<()> {
        self.with_device(device, || {
            let mut handle: CUdevice = 0;
            // SAFETY: ordinal checked by with_device, pointer valid
            check(
                unsafe { cuDeviceGet(&mut handle, device as i32) },
                "cuDeviceGet",
                Some(device),
            )?;

            let mut pool: CUmemoryPool = ptr::null_mut();
            // SAFETY: handle is a valid device, pointer valid
            let result = unsafe { cuDeviceGetDefaultMemPool(&mut pool, handle) };
            if result == CUDA_ERROR_NOT_SUPPORTED {
                // No stream-ordered pool on this device/driver: nothing cached.
                tracing::debug!(
                    target: "accel_lifecycle::runtime::cuda",
                    device_id = device,
                    "Default memory pool not supported; nothing to trim"
                );
                return Ok(());
            }
            check(result, "cuDeviceGetDefaultMemPool", Some(device))?;

            // SAFETY: pool obtained from the driver above
            check(
                unsafe { cuMemPoolTrimTo(pool, 0) },
                "cuMemPoolTrimTo",
                Some(device),
            )
        })
    }

    fn backend_name(&self) -> &'static str {
        "cuda"
    }
}

impl Drop for CudaRuntime {
    fn drop(&mut self) {
        for (ordinal, primary) in self.contexts.get_mut().drain() {
            // SAFETY: each entry holds exactly one retain
            let result = unsafe { cuDevicePrimaryCtxRelease_v2(primary.device) };
            if result != CUDA_SUCCESS {
                // Drop must not panic
                tracing::warn!(
                    target: "accel_lifecycle::runtime::cuda",
                    device_id = ordinal,
                    error = %cuda_result_to_string(result),
                    "cuDevicePrimaryCtxRelease_v2 failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "requires a CUDA device"]
    fn test_cuda_runtime_enumerates_and_restores_context() {
        let runtime = CudaRuntime::new().expect("CUDA init failed");
        let count = runtime.device_count().expect("device count");
        assert!(count > 0, "expected at least one device");

        let before = runtime.current_device().expect("current device");
        runtime.synchronize(0).expect("synchronize");
        runtime.release_cached(0).expect("release cached");
        assert_eq!(runtime.current_device().expect("current device"), before);
    }

    #[test]
    #[ignore = "requires a CUDA device"]
    fn test_cuda_runtime_invalid_ordinal() {
        let runtime = CudaRuntime::new().expect("CUDA init failed");
        let err = runtime.synchronize(999).unwrap_err();
        assert!(matches!(err, LifecycleError::DeviceNotFound { device_id: 999, .. }));
    }
}
