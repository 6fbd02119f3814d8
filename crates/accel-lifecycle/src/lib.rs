#![deny(deprecated)]

//! Accelerator (GPU) resource lifecycle management.
//!
//! This crate provides the acquire/release/monitoring primitive that
//! model-serving code uses to share accelerator devices between threads:
//! - Process-wide monitoring backend lifecycle with graceful degradation
//! - Device inventory and point-in-time memory readings
//! - Pre-flight memory admission checks
//! - Scoped allocation sessions with leak detection on release
//! - Cache release and scoped current-device switching
//!
//! # Backends
//!
//! | Feature | Provides |
//! |---------|----------|
//! | `cuda`  | [`runtime::CudaRuntime`] over the CUDA Driver API |
//! | `nvml`  | [`monitor::NvmlMonitor`] over NVML (`nvml-wrapper`, loaded at runtime) |
//!
//! Without features the runtime sees no devices and monitoring is
//! degraded. The [`sim`] module provides in-process backends for tests.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use accel_lifecycle::{DeviceManager, LifecycleConfig, MonitoringLifecycle};
//! use accel_lifecycle::sim::{SimulatedMonitor, SimulatedRuntime};
//!
//! let sim = Arc::new(SimulatedRuntime::uniform(1, 8 << 30));
//! let lifecycle = Arc::new(MonitoringLifecycle::new(
//!     SimulatedMonitor::new(sim.clone()).factory(),
//! ));
//! let manager = DeviceManager::new(sim.clone(), lifecycle, LifecycleConfig::default());
//!
//! let mut session = manager.acquire(0).unwrap();
//! sim.allocate(0, 1 << 20).unwrap();
//! sim.free(0, 1 << 20);
//! let report = session.release().unwrap();
//! assert!(!report.leak_suspected);
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod ffi;
pub mod guard;
pub mod inventory;
pub mod lifecycle;
pub mod logging;
pub mod manager;
pub mod monitor;
pub mod runtime;
pub mod session;
pub mod sim;

pub use cache::{ActiveDeviceGuard, CacheController, ClearSummary};
pub use config::{LifecycleConfig, LoggingConfig, MonitoringConfig};
pub use error::{LifecycleError, LifecycleResult};
pub use guard::{AdmissionStatus, MemoryGuard, MemoryRequirement};
pub use inventory::{format_bytes, DeviceInventory, DeviceMemoryInfo, MemorySnapshot};
pub use lifecycle::{MonitoringLifecycle, MonitoringState};
pub use logging::init_logging;
pub use manager::DeviceManager;
pub use monitor::{MemoryMonitor, MonitorFactory, UnavailableMonitor};
pub use runtime::{default_runtime, ComputeRuntime, NullRuntime};
pub use session::{AllocationSession, SessionOptions, SessionReport, SessionState};
