//! Hand-rolled test collaborators: a mock [`Store`] and mock backends.
//!
//! The teacher reaches for `mockall`/`mockito` for its HTTP-shaped
//! capabilities, but its own in-process tests (`capability/registry/tests.rs`)
//! hand-roll simple collaborators rather than mock them — this module
//! follows that lighter convention since `Store`/`SharedBackend` here are
//! small enough not to need a mocking framework. Also backs the `cli` demo
//! binary, which has no real inference backend to wire up.

use crate::backend::{ExclusiveBackend, FaceDetection, SharedBackend, StagePayload};
use crate::embedding_stage::EmbeddingBackendFactory;
use crate::fanout::{TextEncoder, VisionEncoder};
use crate::queue::Job;
use crate::stage::Stage;
use crate::stage_orchestrator::BackendFactory;
use crate::store::{CaptionMetadata, FaceRecord, ImageRecord, PersistedWorkerState, Store};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// An in-memory `Store` seeded with a fixed set of image rows. Writes are
/// captured for test assertions.
#[derive(Default)]
pub struct MockStore {
    images: Mutex<HashMap<u64, ImageRecord>>,
    needs_flag: Mutex<HashMap<(Stage, u64), bool>>,
    pub tags_written: Mutex<Vec<(u64, Vec<(String, f32)>, String)>>,
    pub captions_written: Mutex<Vec<(u64, String, CaptionMetadata)>>,
    pub faces_written: Mutex<Vec<(u64, Vec<FaceRecord>)>>,
    pub embeddings_written: Mutex<Vec<(u64, Vec<f32>, Vec<f32>, bool)>>,
    pub worker_states: Mutex<HashMap<Stage, PersistedWorkerState>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds one row and marks it pending for every stage passed.
    pub fn seed(&self, record: ImageRecord, pending_for: &[Stage]) {
        let id = record.id;
        self.images.lock().insert(id, record);
        for &stage in pending_for {
            self.needs_flag.lock().insert((stage, id), true);
        }
    }

    pub fn clear_flag_count(&self, stage: Stage) -> usize {
        self.needs_flag.lock().iter().filter(|((s, _), v)| *s == stage && !**v).count()
    }
}

#[async_trait]
impl Store for MockStore {
    async fn count_pending(&self, stage: Stage) -> Result<u64, String> {
        Ok(self.needs_flag.lock().iter().filter(|((s, _), v)| *s == stage && **v).count() as u64)
    }

    async fn fetch_pending(&self, stage: Stage, batch: usize, last_id: u64) -> Result<Vec<u64>, String> {
        let mut ids: Vec<u64> = self
            .needs_flag
            .lock()
            .iter()
            .filter(|((s, id), v)| *s == stage && **v && *id > last_id)
            .map(|((_, id), _)| *id)
            .collect();
        ids.sort_unstable();
        ids.truncate(batch);
        Ok(ids)
    }

    async fn get_image(&self, id: u64) -> Result<Option<ImageRecord>, String> {
        Ok(self.images.lock().get(&id).cloned())
    }

    async fn clear_needs_flag(&self, stage: Stage, ids: &[u64]) -> Result<(), String> {
        let mut flags = self.needs_flag.lock();
        for &id in ids {
            flags.insert((stage, id), false);
        }
        Ok(())
    }

    async fn write_tags(&self, image_id: u64, tags: &[(String, f32)], source: &str) -> Result<(), String> {
        self.tags_written.lock().push((image_id, tags.to_vec(), source.to_string()));
        Ok(())
    }

    async fn write_caption(&self, image_id: u64, text: &str) -> Result<(), String> {
        self.write_caption_with_metadata(image_id, text, &CaptionMetadata::default()).await
    }

    async fn write_caption_with_metadata(
        &self,
        image_id: u64,
        text: &str,
        metadata: &CaptionMetadata,
    ) -> Result<(), String> {
        self.captions_written.lock().push((image_id, text.to_string(), metadata.clone()));
        Ok(())
    }

    async fn write_faces(&self, image_id: u64, faces: &[FaceRecord]) -> Result<(), String> {
        self.faces_written.lock().push((image_id, faces.to_vec()));
        Ok(())
    }

    async fn write_embeddings(
        &self,
        image_id: u64,
        text_vec: &[f32],
        vision_vec: &[f32],
        is_representative: bool,
    ) -> Result<(), String> {
        self.embeddings_written
            .lock()
            .push((image_id, text_vec.to_vec(), vision_vec.to_vec(), is_representative));
        Ok(())
    }

    async fn smart_queue(&self, stage: Stage, ids: &[u64], skip_already_processed: bool) -> Result<u64, String> {
        let mut flags = self.needs_flag.lock();
        let mut queued = 0u64;
        for &id in ids {
            let already = flags.get(&(stage, id)).copied().unwrap_or(false);
            if skip_already_processed && already {
                continue;
            }
            flags.insert((stage, id), true);
            queued += 1;
        }
        Ok(queued)
    }

    async fn read_worker_state(&self, stage: Stage) -> Result<Option<PersistedWorkerState>, String> {
        Ok(self.worker_states.lock().get(&stage).cloned())
    }

    async fn write_worker_state(&self, stage: Stage, state: &PersistedWorkerState) -> Result<(), String> {
        self.worker_states.lock().insert(stage, state.clone());
        Ok(())
    }
}

/// A shared-pool backend that returns canned payloads and counts calls.
pub struct MockPoolBackend {
    ready: AtomicBool,
    vram_bytes: u64,
    produce: Box<dyn Fn(&Job) -> Result<StagePayload, crate::error::StageError> + Send + Sync>,
    pub calls: std::sync::atomic::AtomicU64,
}

impl MockPoolBackend {
    pub fn tagging(vram_bytes: u64) -> Self {
        Self::new(vram_bytes, |job| {
            Ok(StagePayload::Tags(vec![(format!("tag-for-{}", job.image_id), 0.9)]))
        })
    }

    pub fn new<F>(vram_bytes: u64, produce: F) -> Self
    where
        F: Fn(&Job) -> Result<StagePayload, crate::error::StageError> + Send + Sync + 'static,
    {
        Self {
            ready: AtomicBool::new(false),
            vram_bytes,
            produce: Box::new(produce),
            calls: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl SharedBackend for MockPoolBackend {
    async fn initialize(&self) -> Result<(), String> {
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn vram_footprint_bytes(&self) -> u64 {
        self.vram_bytes
    }

    async fn shutdown(&self) {
        self.ready.store(false, Ordering::Release);
    }

    async fn produce(&self, job: &Job) -> Result<StagePayload, crate::error::StageError> {
        self.calls.fetch_add(1, Ordering::AcqRel);
        (self.produce)(job)
    }
}

/// An exclusive-instance backend (e.g. for captioning) that returns a fixed
/// caption text.
pub struct MockInstanceBackend {
    ready: bool,
    vram_bytes: u64,
}

impl MockInstanceBackend {
    pub fn captioning(vram_bytes: u64) -> Self {
        Self { ready: false, vram_bytes }
    }
}

#[async_trait]
impl ExclusiveBackend for MockInstanceBackend {
    async fn initialize(&mut self) -> Result<(), String> {
        self.ready = true;
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn vram_footprint_bytes(&self) -> u64 {
        self.vram_bytes
    }

    async fn shutdown(&mut self) {
        self.ready = false;
    }

    async fn produce(&mut self, job: &Job) -> Result<StagePayload, crate::error::StageError> {
        Ok(StagePayload::Caption(format!("a caption for image {}", job.image_id)))
    }
}

pub struct MockFaceBackend {
    ready: AtomicBool,
    vram_bytes: u64,
}

impl MockFaceBackend {
    pub fn new(vram_bytes: u64) -> Self {
        Self { ready: AtomicBool::new(false), vram_bytes }
    }
}

#[async_trait]
impl SharedBackend for MockFaceBackend {
    async fn initialize(&self) -> Result<(), String> {
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn vram_footprint_bytes(&self) -> u64 {
        self.vram_bytes
    }

    async fn shutdown(&self) {
        self.ready.store(false, Ordering::Release);
    }

    async fn produce(&self, _job: &Job) -> Result<StagePayload, crate::error::StageError> {
        Ok(StagePayload::Faces(vec![FaceDetection {
            bbox: (0.1, 0.1, 0.5, 0.5),
            confidence: 0.99,
            embedding: None,
            landmarks: None,
        }]))
    }
}

/// A factory that always succeeds, producing the mock backend a closure
/// builds per call — enough indirection to exercise
/// [`crate::stage_orchestrator::StageOrchestrator::start`] without a real
/// inference backend.
pub struct ClosureBackendFactory<P, I> {
    build_pool: Box<dyn Fn(u32) -> P + Send + Sync>,
    build_instance: Box<dyn Fn(u32) -> I + Send + Sync>,
}

impl<P, I> ClosureBackendFactory<P, I> {
    pub fn new<FP, FI>(build_pool: FP, build_instance: FI) -> Self
    where
        FP: Fn(u32) -> P + Send + Sync + 'static,
        FI: Fn(u32) -> I + Send + Sync + 'static,
    {
        Self {
            build_pool: Box::new(build_pool),
            build_instance: Box::new(build_instance),
        }
    }
}

#[async_trait]
impl<P, I> BackendFactory<P, I> for ClosureBackendFactory<P, I>
where
    P: SharedBackend,
    I: ExclusiveBackend,
{
    async fn build_pool(&self, device_id: u32) -> Result<P, String> {
        Ok((self.build_pool)(device_id))
    }

    async fn build_instance(&self, device_id: u32) -> Result<I, String> {
        Ok((self.build_instance)(device_id))
    }
}

/// A text encoder that returns a canned vector sized off the input text —
/// enough to exercise the fan-out join without a real model.
pub struct MockTextEncoder;

#[async_trait]
impl TextEncoder for MockTextEncoder {
    async fn encode(&self, text: &str) -> Result<Vec<f32>, crate::error::StageError> {
        Ok(vec![text.len() as f32])
    }
}

/// A vision encoder that returns a fixed canned vector, ignoring the image
/// path entirely.
pub struct MockVisionEncoder;

#[async_trait]
impl VisionEncoder for MockVisionEncoder {
    async fn encode(&self, _image_path: &std::path::Path) -> Result<Vec<f32>, crate::error::StageError> {
        Ok(vec![1.0, 2.0, 3.0])
    }
}

/// The embedding-stage counterpart to [`ClosureBackendFactory`]: a factory
/// that always succeeds, building a closure-supplied text/vision encoder
/// pair per call.
pub struct ClosureEmbeddingFactory<T, V> {
    build_text: Box<dyn Fn(u32) -> T + Send + Sync>,
    build_vision: Box<dyn Fn(u32) -> V + Send + Sync>,
}

impl<T, V> ClosureEmbeddingFactory<T, V> {
    pub fn new<FT, FV>(build_text: FT, build_vision: FV) -> Self
    where
        FT: Fn(u32) -> T + Send + Sync + 'static,
        FV: Fn(u32) -> V + Send + Sync + 'static,
    {
        Self {
            build_text: Box::new(build_text),
            build_vision: Box::new(build_vision),
        }
    }
}

#[async_trait]
impl<T, V> EmbeddingBackendFactory<T, V> for ClosureEmbeddingFactory<T, V>
where
    T: TextEncoder,
    V: VisionEncoder,
{
    async fn build_text(&self, device_id: u32) -> Result<T, String> {
        Ok((self.build_text)(device_id))
    }

    async fn build_vision(&self, device_id: u32) -> Result<V, String> {
        Ok((self.build_vision)(device_id))
    }
}

pub fn sample_image(id: u64, prompt: &str) -> ImageRecord {
    ImageRecord {
        id,
        path: std::path::PathBuf::from(format!("/tmp/images/{id}.png")),
        prompt: prompt.to_string(),
        negative_prompt: String::new(),
    }
}
