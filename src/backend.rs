//! The model-pool / model-instance abstraction (§4.5, §4.6).
//!
//! Grounds on `capability/traits.rs` (one trait per ML capability, default
//! methods for the common bookkeeping) and Design Notes §9's guidance to
//! model the pool-vs-instance split as a sealed variant over a common
//! capability set, rather than runtime dynamic dispatch discovered per call.

use crate::error::StageError;
use crate::queue::Job;
use async_trait::async_trait;

/// A detected face, face embedding optional, per §3.
#[derive(Debug, Clone)]
pub struct FaceDetection {
    pub bbox: (f32, f32, f32, f32),
    pub confidence: f32,
    pub embedding: Option<Vec<f32>>,
    pub landmarks: Option<Vec<(f32, f32)>>,
}

/// The two encoder outputs that together make an embedding result (§3).
/// `EncoderKind` is deliberately a 2-variant enum (§9 OQ3): a third/fourth
/// encoder would extend this enum and widen the fan-out join's expected
/// completion count in `crate::fanout`, but no such machinery is built
/// ahead of need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderKind {
    Text,
    Vision,
}

#[derive(Debug, Clone)]
pub struct EmbeddingBundle {
    pub text_vec: Vec<f32>,
    pub vision_vec: Vec<f32>,
}

/// The stage-specific payload of a completed [`crate::queue::Job`].
#[derive(Debug, Clone)]
pub enum StagePayload {
    Tags(Vec<(String, f32)>),
    Caption(String),
    Faces(Vec<FaceDetection>),
    Embedding(EmbeddingBundle),
}

/// The outcome a worker hands back to its orchestrator — never written to
/// the store directly, per §4.7.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub image_id: u64,
    pub success: bool,
    pub error: Option<String>,
    pub payload: Option<StagePayload>,
}

impl JobOutcome {
    pub fn ok(image_id: u64, payload: StagePayload) -> Self {
        Self {
            image_id,
            success: true,
            error: None,
            payload: Some(payload),
        }
    }

    pub fn failed(image_id: u64, err: StageError) -> Self {
        Self {
            image_id,
            success: false,
            error: Some(err.to_string()),
            payload: None,
        }
    }
}

/// A backend loaded once per device and shared by any number of concurrent
/// workers. Implementations must be re-entrant: the contract explicitly
/// permits concurrent invocation from any thread (§4.5).
#[async_trait]
pub trait SharedBackend: Send + Sync {
    async fn initialize(&self) -> Result<(), String>;
    fn is_ready(&self) -> bool;
    fn vram_footprint_bytes(&self) -> u64;
    /// Idempotent: a second call after the first returns `is_ready() ==
    /// false` unconditionally.
    async fn shutdown(&self);
    async fn produce(&self, job: &Job) -> Result<StagePayload, StageError>;
}

/// A backend owned exclusively by one worker; concurrent calls across
/// workers are undefined by contract (§4.6) — enforced here by requiring
/// `&mut self` so the type system prevents aliased concurrent access.
#[async_trait]
pub trait ExclusiveBackend: Send {
    async fn initialize(&mut self) -> Result<(), String>;
    fn is_ready(&self) -> bool;
    fn vram_footprint_bytes(&self) -> u64;
    async fn shutdown(&mut self);
    async fn produce(&mut self, job: &Job) -> Result<StagePayload, StageError>;
}

/// The pool-vs-instance distinction as a sealed variant with a common
/// capability set, per Design Notes §9.
pub enum StageBackend<P, I> {
    Pool(std::sync::Arc<P>),
    Instance(I),
}

impl<P: SharedBackend, I: ExclusiveBackend> StageBackend<P, I> {
    pub fn vram_footprint_bytes(&self) -> u64 {
        match self {
            StageBackend::Pool(p) => p.vram_footprint_bytes(),
            StageBackend::Instance(i) => i.vram_footprint_bytes(),
        }
    }

    pub fn is_ready(&self) -> bool {
        match self {
            StageBackend::Pool(p) => p.is_ready(),
            StageBackend::Instance(i) => i.is_ready(),
        }
    }
}
