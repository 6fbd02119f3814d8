//! CUDA Driver API FFI bindings.
//!
//! Low-level bindings to libcuda.so covering device enumeration, primary
//! context management, synchronization and default memory pool trimming.
//!
//! The Driver API is used instead of the Runtime API: it needs no toolkit
//! at link time beyond the driver itself, and `cuDeviceGetCount` is cheap
//! enough to call on every query.

use std::ffi::c_void;
use std::os::raw::{c_int, c_uint};

// =============================================================================
// TYPE ALIASES
// =============================================================================

/// CUDA result code. 0 = success, non-zero = error.
pub type CUresult = c_int;

/// CUDA device handle (ordinal-based).
pub type CUdevice = c_int;

/// CUDA context handle (opaque pointer).
pub type CUcontext = *mut c_void;

/// CUDA memory pool handle (opaque pointer).
pub type CUmemoryPool = *mut c_void;

// =============================================================================
// RESULT CODES
// =============================================================================

/// CUDA operation completed successfully.
pub const CUDA_SUCCESS: CUresult = 0;

/// Invalid value passed to an API call.
pub const CUDA_ERROR_INVALID_VALUE: CUresult = 1;

/// Device out of memory.
pub const CUDA_ERROR_OUT_OF_MEMORY: CUresult = 2;

/// CUDA driver not initialized. Call cuInit() first.
pub const CUDA_ERROR_NOT_INITIALIZED: CUresult = 3;

/// Driver is shutting down.
pub const CUDA_ERROR_DEINITIALIZED: CUresult = 4;

/// No CUDA-capable device is available.
pub const CUDA_ERROR_NO_DEVICE: CUresult = 100;

/// Invalid device ordinal passed to cuDeviceGet.
pub const CUDA_ERROR_INVALID_DEVICE: CUresult = 101;

/// Operation not supported (e.g. memory pools on pre-11.2 drivers).
pub const CUDA_ERROR_NOT_SUPPORTED: CUresult = 801;

// =============================================================================
// FFI DECLARATIONS
// =============================================================================

#[link(name = "cuda")]
extern "C" {
    /// Initialize the CUDA driver. Must precede every other call.
    /// Thread-safe if called with same flags (0).
    pub fn cuInit(flags: c_uint) -> CUresult;

    /// Get a CUDA device handle by ordinal.
    pub fn cuDeviceGet(device: *mut CUdevice, ordinal: c_int) -> CUresult;

    /// Get the number of visible CUDA devices.
    pub fn cuDeviceGetCount(count: *mut c_int) -> CUresult;

    // =========================================================================
    // CONTEXT MANAGEMENT
    // =========================================================================

    /// Retain the device's primary context, creating it if needed.
    ///
    /// Every successful retain must be paired with a release.
    pub fn cuDevicePrimaryCtxRetain(pctx: *mut CUcontext, dev: CUdevice) -> CUresult;

    /// Release a primary context reference obtained by retain.
    pub fn cuDevicePrimaryCtxRelease_v2(dev: CUdevice) -> CUresult;

    /// Get the current CUDA context for the calling thread (null if none).
    pub fn cuCtxGetCurrent(pctx: *mut CUcontext) -> CUresult;

    /// Set the current CUDA context for the calling thread (null unbinds).
    pub fn cuCtxSetCurrent(ctx: CUcontext) -> CUresult;

    /// Get the device of the current context.
    pub fn cuCtxGetDevice(device: *mut CUdevice) -> CUresult;

    /// Block until all outstanding work in the current context completes.
    pub fn cuCtxSynchronize() -> CUresult;

    // =========================================================================
    // MEMORY
    // =========================================================================

    /// Get the default stream-ordered memory pool of a device.
    pub fn cuDeviceGetDefaultMemPool(pool: *mut CUmemoryPool, dev: CUdevice) -> CUresult;

    /// Release cached pool memory back to the OS, keeping at least
    /// `min_bytes_to_keep` reserved.
    pub fn cuMemPoolTrimTo(pool: CUmemoryPool, min_bytes_to_keep: usize) -> CUresult;
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Check if a CUDA result indicates success.
#[inline]
#[must_use]
pub const fn is_cuda_success(result: CUresult) -> bool {
    result == CUDA_SUCCESS
}

/// Get human-readable error message for CUDA result codes.
#[must_use]
pub fn cuda_result_to_string(result: CUresult) -> String {
    match result {
        CUDA_SUCCESS => "CUDA_SUCCESS (0): Operation completed successfully".to_string(),
        CUDA_ERROR_INVALID_VALUE => "CUDA_ERROR_INVALID_VALUE (1): Invalid value".to_string(),
        CUDA_ERROR_OUT_OF_MEMORY => "CUDA_ERROR_OUT_OF_MEMORY (2): Out of memory".to_string(),
        CUDA_ERROR_NOT_INITIALIZED => {
            "CUDA_ERROR_NOT_INITIALIZED (3): cuInit() not called".to_string()
        }
        CUDA_ERROR_DEINITIALIZED => {
            "CUDA_ERROR_DEINITIALIZED (4): Driver shutting down".to_string()
        }
        CUDA_ERROR_NO_DEVICE => "CUDA_ERROR_NO_DEVICE (100): No CUDA-capable device".to_string(),
        CUDA_ERROR_INVALID_DEVICE => {
            "CUDA_ERROR_INVALID_DEVICE (101): Invalid device ordinal".to_string()
        }
        CUDA_ERROR_NOT_SUPPORTED => {
            "CUDA_ERROR_NOT_SUPPORTED (801): Operation not supported".to_string()
        }
        code => format!("CUDA_ERROR_UNKNOWN ({}): Unknown error code", code),
    }
}
