//! CUDA Driver API bindings - the only `extern "C"` declarations in the crate.
//!
//! # Safety
//!
//! All functions in these modules are unsafe FFI. Callers must ensure:
//! - `cuInit()` succeeded before any other call
//! - Valid device ordinals are passed to device functions
//! - Output pointers are valid for writes
//!
//! # Feature Flags
//!
//! - `cuda`: CUDA Driver API (links libcuda)
//!
//! NVML is reached through `nvml-wrapper`, which loads the library at
//! runtime and needs no bindings here.

#[cfg(feature = "cuda")]
pub mod cuda_driver;
