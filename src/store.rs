//! The persistence contract this crate consumes.
//!
//! Out of scope per spec §1 ("Persistence — an external data store"); only
//! its contract is specified here, as an async trait object collaborators
//! implement. `async-trait` matches the teacher's async-trait-object usage
//! in its capability traits.

use crate::stage::Stage;
use async_trait::async_trait;

/// Minimal view of an image row needed to build a [`crate::queue::Job`].
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub id: u64,
    pub path: std::path::PathBuf,
    pub prompt: String,
    pub negative_prompt: String,
}

/// A single detected face, as written by the face-detection stage.
#[derive(Debug, Clone)]
pub struct FaceRecord {
    pub bbox: (f32, f32, f32, f32),
    pub confidence: f32,
    pub embedding: Option<Vec<f32>>,
    pub landmarks: Option<Vec<(f32, f32)>>,
}

/// Optional extra metadata accompanying a caption write.
#[derive(Debug, Clone, Default)]
pub struct CaptionMetadata {
    pub source: Option<String>,
    pub prompt_used: Option<String>,
    pub tokens: Option<u32>,
    pub duration_ms: Option<u64>,
}

/// The persisted, cross-restart worker state for a stage (§6, last
/// paragraph). `running` is rewritten to `paused` on process start by the
/// orchestrator that owns this store — the system never auto-resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistedStatus {
    Stopped,
    Running,
    Paused,
}

#[derive(Debug, Clone)]
pub struct PersistedWorkerState {
    pub status: PersistedStatus,
    pub models_loaded: bool,
    pub total_processed: u64,
    pub total_failed: u64,
    pub last_error: Option<String>,
}

/// Abstract store operations consumed by the orchestrator, exactly as
/// enumerated in spec §6.
#[async_trait]
pub trait Store: Send + Sync {
    async fn count_pending(&self, stage: Stage) -> Result<u64, String>;

    /// Returns ids strictly greater than `last_id`, ascending, bounded by
    /// `batch`.
    async fn fetch_pending(&self, stage: Stage, batch: usize, last_id: u64) -> Result<Vec<u64>, String>;

    async fn get_image(&self, id: u64) -> Result<Option<ImageRecord>, String>;

    async fn clear_needs_flag(&self, stage: Stage, ids: &[u64]) -> Result<(), String>;

    async fn write_tags(&self, image_id: u64, tags: &[(String, f32)], source: &str) -> Result<(), String>;

    async fn write_caption(&self, image_id: u64, text: &str) -> Result<(), String>;

    async fn write_caption_with_metadata(
        &self,
        image_id: u64,
        text: &str,
        metadata: &CaptionMetadata,
    ) -> Result<(), String>;

    async fn write_faces(&self, image_id: u64, faces: &[FaceRecord]) -> Result<(), String>;

    async fn write_embeddings(
        &self,
        image_id: u64,
        text_vec: &[f32],
        vision_vec: &[f32],
        is_representative: bool,
    ) -> Result<(), String>;

    /// Sets the `needs_*` flag only for rows without existing results
    /// unless `skip_already_processed` is `false`. Returns the number of
    /// rows actually queued.
    async fn smart_queue(&self, stage: Stage, ids: &[u64], skip_already_processed: bool) -> Result<u64, String>;

    async fn read_worker_state(&self, stage: Stage) -> Result<Option<PersistedWorkerState>, String>;

    async fn write_worker_state(&self, stage: Stage, state: &PersistedWorkerState) -> Result<(), String>;
}
