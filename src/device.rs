//! Per-device VRAM accounting.
//!
//! Grounded on `pool/core/memory_governor.rs::MemoryGovernor`: a structured,
//! mutex-guarded ledger of reserved bytes per device, simplified to the
//! explicit `try_reserve`/`release` contract §4.1 requires (no RAII guard —
//! the spec's invariant is that orchestrators release explicitly on stage
//! completion, with *no* implicit release on early return or cancellation).

use parking_lot::Mutex;
use std::collections::HashMap;

/// An accelerator device: a fixed total VRAM capacity and a cap on what
/// fraction of it the scheduler is allowed to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Device {
    pub id: u32,
    pub total_vram_bytes: u64,
    /// `max_usage_fraction` expressed in basis points (1..=10000) to avoid
    /// float equality pitfalls in the invariant checks; `85%` is `8500`.
    pub max_usage_bps: u32,
}

impl Device {
    pub fn new(id: u32, total_vram_bytes: u64, max_usage_percent: u8) -> Self {
        Self {
            id,
            total_vram_bytes,
            max_usage_bps: (max_usage_percent as u32) * 100,
        }
    }

    pub fn capacity_bytes(&self) -> u64 {
        (self.total_vram_bytes as u128 * self.max_usage_bps as u128 / 10_000) as u64
    }
}

/// Per-device atomic accounting, per §4.1.
///
/// `reserved` is monotone between a `try_reserve` and its matching
/// `release`: nothing in this type releases memory on its own.
pub struct VramTracker {
    devices: Vec<Device>,
    reserved: Mutex<HashMap<u32, u64>>,
}

impl VramTracker {
    pub fn new(devices: Vec<Device>) -> Self {
        let reserved = devices.iter().map(|d| (d.id, 0u64)).collect();
        Self {
            devices,
            reserved: Mutex::new(reserved),
        }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    fn device(&self, device_id: u32) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == device_id)
    }

    /// `capacity(d) * max_fraction - reserved(d)`.
    pub fn available(&self, device_id: u32) -> u64 {
        let Some(device) = self.device(device_id) else {
            return 0;
        };
        let reserved = *self.reserved.lock().get(&device_id).unwrap_or(&0);
        device.capacity_bytes().saturating_sub(reserved)
    }

    /// Atomic test-and-modify: reserves `bytes` on `device_id` iff doing so
    /// would not exceed the device's capacity.
    pub fn try_reserve(&self, device_id: u32, bytes: u64) -> bool {
        let Some(device) = self.device(device_id) else {
            return false;
        };
        let mut reserved = self.reserved.lock();
        let current = *reserved.get(&device_id).unwrap_or(&0);
        if current.saturating_add(bytes) > device.capacity_bytes() {
            return false;
        }
        reserved.insert(device_id, current + bytes);
        log::debug!(
            "device {}: reserved +{} bytes (total reserved {} / {} cap)",
            device_id,
            bytes,
            current + bytes,
            device.capacity_bytes()
        );
        true
    }

    /// `reserved(d) = max(0, reserved(d) - bytes)`. No-op if `device_id` is
    /// unknown (defensive against a caller releasing after reconfiguration).
    pub fn release(&self, device_id: u32, bytes: u64) {
        let mut reserved = self.reserved.lock();
        if let Some(current) = reserved.get_mut(&device_id) {
            *current = current.saturating_sub(bytes);
            log::debug!("device {}: released {} bytes (now {})", device_id, bytes, current);
        }
    }

    /// `floor(available(d) / per_instance_bytes)`.
    pub fn max_instances(&self, device_id: u32, per_instance_bytes: u64) -> usize {
        if per_instance_bytes == 0 {
            return 0;
        }
        (self.available(device_id) / per_instance_bytes) as usize
    }

    pub fn reserved_bytes(&self, device_id: u32) -> u64 {
        *self.reserved.lock().get(&device_id).unwrap_or(&0)
    }
}
