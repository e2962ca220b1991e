//! Static stage metadata.
//!
//! Per the design notes, the shared-vs-exclusive sharing rule and the VRAM
//! footprint are captured as compile-time facts about a [`Stage`], not
//! discovered at runtime.

use serde::{Deserialize, Serialize};

/// One of the four inference pipelines this scheduler admits work for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    Tagging,
    Captioning,
    Embedding,
    FaceDetection,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Tagging,
        Stage::Captioning,
        Stage::Embedding,
        Stage::FaceDetection,
    ];

    /// Lower loads first.
    pub const fn priority(self) -> u8 {
        match self {
            Stage::Tagging => 1,
            Stage::FaceDetection => 1,
            Stage::Embedding => 2,
            Stage::Captioning => 3,
        }
    }

    /// `true` for stages whose backend may be invoked concurrently from any
    /// number of worker threads against a single loaded pool; `false` for
    /// stages that require exclusive per-worker ownership of the backend.
    pub const fn is_shared(self) -> bool {
        !matches!(self, Stage::Captioning)
    }

    /// VRAM footprint, in bytes, of a shared pool (one load, N workers) for
    /// shared-pool stages. Captioning is exclusive-instance and uses
    /// [`Stage::per_instance_vram_bytes`] instead.
    pub const fn shared_pool_vram_bytes(self) -> Option<u64> {
        match self {
            Stage::Tagging => Some(2_600 * 1024 * 1024),
            Stage::Embedding => Some(7_600 * 1024 * 1024),
            Stage::FaceDetection => Some(1_800 * 1024 * 1024),
            Stage::Captioning => None,
        }
    }

    /// VRAM footprint, in bytes, of a single exclusive model instance.
    pub const fn per_instance_vram_bytes(self) -> Option<u64> {
        match self {
            Stage::Captioning => Some(5_600 * 1024 * 1024),
            _ => None,
        }
    }

    /// Default worker count for a shared-pool stage's admitted allocation.
    pub const fn default_shared_workers(self) -> usize {
        8
    }

    /// Default sub-worker count per encoder for the embedding stage's
    /// multi-encoder fan-out (§4.8 step 3's default K=3, down to K=1);
    /// `None` for every stage that isn't fan-out-shaped.
    pub const fn fanout_workers_per_encoder(self) -> Option<usize> {
        match self {
            Stage::Embedding => Some(3),
            _ => None,
        }
    }

    /// Default cursor-paginator batch size, tuned to backend throughput
    /// (smaller batches smooth backpressure for slower per-job backends).
    pub const fn default_batch_size(self) -> usize {
        match self {
            Stage::Tagging | Stage::Embedding => 1000,
            Stage::Captioning | Stage::FaceDetection => 500,
        }
    }
}

/// `Solo` if exactly one stage is enabled for a run, `Concurrent` otherwise.
/// Informational to stages; the allocation-string configuration input
/// differs per mode (see [`crate::config::AllocationConfig`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationMode {
    Solo,
    Concurrent,
}

impl AllocationMode {
    pub fn for_enabled_stages(enabled: &[Stage]) -> Self {
        if enabled.len() == 1 {
            AllocationMode::Solo
        } else {
            AllocationMode::Concurrent
        }
    }
}

/// A single `(Stage, Device, worker_count, model_count)` admission record.
/// For shared pools `model_count == 1`; for exclusive instances
/// `model_count == worker_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub stage: Stage,
    pub device_id: u32,
    pub worker_count: usize,
    pub model_count: usize,
    pub vram_bytes: u64,
}

/// The aggregated set of per-device allocations admitted for one stage.
#[derive(Debug, Clone)]
pub struct ServiceAllocation {
    pub stage: Stage,
    pub mode: AllocationMode,
    pub allocations: Vec<Allocation>,
}

impl ServiceAllocation {
    pub fn total_workers(&self) -> usize {
        self.allocations.iter().map(|a| a.worker_count).sum()
    }

    pub fn total_models(&self) -> usize {
        self.allocations.iter().map(|a| a.model_count).sum()
    }

    pub fn total_vram_bytes(&self) -> u64 {
        self.allocations.iter().map(|a| a.vram_bytes).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }
}
