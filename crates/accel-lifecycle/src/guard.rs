//! Pre-flight admission check before a workload commits to a device.
//!
//! # Advisory only
//!
//! [`MemoryGuard::ensure_available`] reads free memory and compares it
//! with the requirement. It does not reserve anything: another allocation
//! on the same device between the check and the workload can still
//! exhaust memory. Callers needing exclusivity must hold their own
//! per-device lock around check and workload.

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::DEFAULT_BUFFER_BYTES;
use crate::error::{LifecycleError, LifecycleResult};
use crate::inventory::{format_bytes, DeviceInventory};

/// Memory a workload needs plus a safety margin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryRequirement {
    pub required_bytes: u64,
    pub buffer_bytes: u64,
}

impl MemoryRequirement {
    /// Requirement with the default 512 MiB buffer.
    #[must_use]
    pub fn new(required_bytes: u64) -> Self {
        Self::with_buffer(required_bytes, DEFAULT_BUFFER_BYTES)
    }

    #[must_use]
    pub fn with_buffer(required_bytes: u64, buffer_bytes: u64) -> Self {
        Self {
            required_bytes,
            buffer_bytes,
        }
    }

    /// `required + buffer`, saturating.
    #[inline]
    #[must_use]
    pub fn total(&self) -> u64 {
        self.required_bytes.saturating_add(self.buffer_bytes)
    }
}

/// Result of a passed admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdmissionStatus {
    /// Enough free memory was observed.
    Admitted { free_bytes: u64 },
    /// Monitoring is degraded; the check was skipped.
    Unknown,
}

impl AdmissionStatus {
    #[must_use]
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionStatus::Admitted { .. })
    }
}

/// Admission checks over a [`DeviceInventory`].
#[derive(Debug, Clone)]
pub struct MemoryGuard {
    inventory: DeviceInventory,
    default_buffer_bytes: u64,
}

impl MemoryGuard {
    pub fn new(inventory: DeviceInventory, default_buffer_bytes: u64) -> Self {
        Self {
            inventory,
            default_buffer_bytes,
        }
    }

    /// [`ensure_available_with`](Self::ensure_available_with) using the
    /// configured default buffer.
    pub fn ensure_available(
        &self,
        device_id: u32,
        required_bytes: u64,
    ) -> LifecycleResult<AdmissionStatus> {
        self.ensure_available_with(
            device_id,
            MemoryRequirement::with_buffer(required_bytes, self.default_buffer_bytes),
        )
    }

    /// Check that `device_id` has at least `requirement.total()` bytes free.
    ///
    /// `free == required + buffer` is admitted. When monitoring is
    /// degraded the `(0, 0)` reading is not treated as zero capacity: the
    /// check is skipped and [`AdmissionStatus::Unknown`] returned.
    ///
    /// The device cache is released afterwards whatever the outcome; a
    /// failure there is logged and never replaces the check's result.
    ///
    /// # Errors
    ///
    /// - `DeviceNotFound` for a device outside the visible range
    /// - `InsufficientMemory { required: required + buffer, available: free }`
    pub fn ensure_available_with(
        &self,
        device_id: u32,
        requirement: MemoryRequirement,
    ) -> LifecycleResult<AdmissionStatus> {
        let outcome = self.check(device_id, requirement);

        if let Err(e) = self.inventory.clear_cache(Some(device_id)) {
            debug!(
                target: "accel_lifecycle::guard",
                device_id,
                error = %e,
                "Post-check cache clear failed"
            );
        }

        outcome
    }

    fn check(
        &self,
        device_id: u32,
        requirement: MemoryRequirement,
    ) -> LifecycleResult<AdmissionStatus> {
        let snapshot = self.inventory.get_memory(device_id)?;

        if !snapshot.is_known() {
            warn!(
                target: "accel_lifecycle::guard",
                device_id,
                required = requirement.total(),
                "Memory reading unknown (monitoring degraded); skipping admission check"
            );
            return Ok(AdmissionStatus::Unknown);
        }

        let free = snapshot.free_bytes();
        let needed = requirement.total();
        if free < needed {
            warn!(
                target: "accel_lifecycle::guard",
                device_id,
                required = needed,
                available = free,
                "Insufficient device memory: need {}, {} free",
                format_bytes(needed),
                format_bytes(free)
            );
            return Err(LifecycleError::InsufficientMemory {
                device_id,
                required: needed,
                available: free,
            });
        }

        debug!(
            target: "accel_lifecycle::guard",
            device_id,
            required = needed,
            available = free,
            "Admission check passed"
        );
        Ok(AdmissionStatus::Admitted { free_bytes: free })
    }
}
