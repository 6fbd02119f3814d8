//! Process-wide monitoring backend lifecycle.
//!
//! `initialize` and `shutdown` are idempotent and safe from any thread.
//! A missing or failing backend never fails `initialize`: the lifecycle
//! records `backend_available = false`, logs a warning, and every reading
//! degrades to the `(0, 0)` "unknown" sentinel.
//!
//! # Example
//!
//! ```
//! use accel_lifecycle::lifecycle::MonitoringLifecycle;
//! use accel_lifecycle::monitor::disabled_monitor_factory;
//!
//! let lifecycle = MonitoringLifecycle::new(disabled_monitor_factory("no backend"));
//! let state = lifecycle.initialize();
//! assert!(state.initialized);
//! assert!(!state.backend_available);
//! assert_eq!(lifecycle.read(0), (0, 0));
//! lifecycle.shutdown();
//! assert!(!lifecycle.state().initialized);
//! ```

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::monitor::{default_monitor_factory, MemoryMonitor, MonitorFactory};

/// Flags describing the monitoring backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitoringState {
    /// `initialize` has run since the last `shutdown`.
    pub initialized: bool,
    /// The backend started and readings are real.
    pub backend_available: bool,
}

struct Inner {
    state: MonitoringState,
    backend: Option<Box<dyn MemoryMonitor>>,
}

/// Guarded monitoring state plus the active backend.
pub struct MonitoringLifecycle {
    factory: MonitorFactory,
    inner: Mutex<Inner>,
}

static GLOBAL: OnceLock<Arc<MonitoringLifecycle>> = OnceLock::new();

impl MonitoringLifecycle {
    /// Independent lifecycle whose backend is built by `factory`.
    pub fn new(factory: MonitorFactory) -> Self {
        Self {
            factory,
            inner: Mutex::new(Inner {
                state: MonitoringState::default(),
                backend: None,
            }),
        }
    }

    /// The process-wide lifecycle, created on first use with the default
    /// backend for this build.
    pub fn global() -> Arc<MonitoringLifecycle> {
        GLOBAL
            .get_or_init(|| Arc::new(MonitoringLifecycle::new(default_monitor_factory())))
            .clone()
    }

    /// Start the backend unless already initialized.
    ///
    /// Returns the resulting state. Never fails.
    pub fn initialize(&self) -> MonitoringState {
        let mut inner = self.inner.lock();
        if inner.state.initialized {
            return inner.state;
        }

        let backend = (self.factory)();
        match backend.start() {
            Ok(()) => {
                info!(
                    target: "accel_lifecycle::monitoring",
                    backend = backend.backend_name(),
                    "Monitoring backend started"
                );
                inner.backend = Some(backend);
                inner.state.backend_available = true;
            }
            Err(e) => {
                warn!(
                    target: "accel_lifecycle::monitoring",
                    backend = backend.backend_name(),
                    error = %e,
                    "Monitoring backend unavailable; memory readings degrade to unknown (0, 0)"
                );
                inner.backend = None;
                inner.state.backend_available = false;
            }
        }
        inner.state.initialized = true;
        inner.state
    }

    /// Stop the backend and reset, so a later `initialize` starts afresh.
    ///
    /// No-op when not initialized.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        if !inner.state.initialized {
            return;
        }

        if let Some(backend) = inner.backend.take() {
            match backend.stop() {
                Ok(()) => debug!(
                    target: "accel_lifecycle::monitoring",
                    backend = backend.backend_name(),
                    "Monitoring backend stopped"
                ),
                Err(e) => warn!(
                    target: "accel_lifecycle::monitoring",
                    backend = backend.backend_name(),
                    error = %e,
                    "Monitoring backend stop failed; state reset anyway"
                ),
            }
        }
        inner.state = MonitoringState::default();
    }

    /// Copy of the current flags.
    #[must_use]
    pub fn state(&self) -> MonitoringState {
        self.inner.lock().state
    }

    /// Whether readings are real (backend started).
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.inner.lock().state.backend_available
    }

    /// `(used_bytes, total_bytes)` for `device_index`, or `(0, 0)` when the
    /// backend is unavailable or the query fails.
    #[must_use]
    pub fn read(&self, device_index: u32) -> (u64, u64) {
        let inner = self.inner.lock();
        let Some(backend) = inner.backend.as_ref() else {
            return (0, 0);
        };

        match backend.memory(device_index) {
            Ok(reading) => reading,
            Err(e) => {
                warn!(
                    target: "accel_lifecycle::monitoring",
                    device_id = device_index,
                    error = %e,
                    "Memory query failed; reporting unknown"
                );
                (0, 0)
            }
        }
    }
}

impl std::fmt::Debug for MonitoringLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MonitoringLifecycle")
            .field("state", &inner.state)
            .field(
                "backend",
                &inner.backend.as_ref().map(|b| b.backend_name()),
            )
            .finish()
    }
}
