//! Multi-encoder fan-out/join for the embedding stage (§4.8).
//!
//! Grounds on `concurrency/mod.rs::OneshotChannel` for the completion
//! promise and on the `DashMap`-indexed worker registries
//! (`IMAGE_EMBEDDING_WORKERS` in `pool/capabilities/image_embedding.rs`),
//! generalized here to index pending joins by `image_id` rather than
//! workers by `registry_key`. Uses a oneshot + atomic counter instead of a
//! mutex in the hot path, per Design Notes §9.

use crate::backend::{EmbeddingBundle, EncoderKind};
use crate::error::StageError;
use crate::pagination::embedding_text_input;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::oneshot;

/// The text-semantic encoder (e.g. BGE). Shared pool, re-entrant.
#[async_trait]
pub trait TextEncoder: Send + Sync {
    async fn encode(&self, text: &str) -> Result<Vec<f32>, StageError>;
}

/// The visual encoder (e.g. CLIP-Vision). Shared pool, re-entrant.
#[async_trait]
pub trait VisionEncoder: Send + Sync {
    async fn encode(&self, image_path: &Path) -> Result<Vec<f32>, StageError>;
}

/// Expected number of encoder completions per image. Two today
/// (text + vision); see [`EncoderKind`] for where a third would slot in.
const EXPECTED_COMPLETIONS: usize = 2;

struct JoinSlots {
    text: Option<Vec<f32>>,
    vision: Option<Vec<f32>>,
}

/// Transient per-image join state. Destroyed once the completion promise
/// fires (the `DashMap` entry is removed right after).
struct PendingJoin {
    remaining: AtomicUsize,
    slots: Mutex<JoinSlots>,
    completion: Mutex<Option<oneshot::Sender<Option<EmbeddingBundle>>>>,
}

impl PendingJoin {
    fn new(completion: oneshot::Sender<Option<EmbeddingBundle>>) -> Self {
        Self {
            remaining: AtomicUsize::new(EXPECTED_COMPLETIONS),
            slots: Mutex::new(JoinSlots { text: None, vision: None }),
            completion: Mutex::new(Some(completion)),
        }
    }

    /// Returns `Some(bundle_or_none)` once every encoder has completed;
    /// `None` while completions are still outstanding.
    fn complete_slot(&self, kind: EncoderKind, value: Option<Vec<f32>>) -> Option<Option<EmbeddingBundle>> {
        {
            let mut slots = self.slots.lock();
            match kind {
                EncoderKind::Text => slots.text = value,
                EncoderKind::Vision => slots.vision = value,
            }
        }

        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return None;
        }

        let slots = self.slots.lock();
        let bundle = match (&slots.text, &slots.vision) {
            (Some(t), Some(v)) => Some(EmbeddingBundle {
                text_vec: t.clone(),
                vision_vec: v.clone(),
            }),
            // Partial completion with at least one `None` collapses to a
            // failed/empty result, per §3.
            _ => None,
        };
        Some(bundle)
    }
}

struct EncoderJob {
    image_id: u64,
    text_input: String,
    image_path: std::path::PathBuf,
}

/// Owns the two per-encoder queues, spawns K sub-workers per encoder, and
/// tracks in-flight joins by image id.
pub struct EmbeddingFanout {
    text_queue: Arc<crate::queue::WorkQueue>,
    vision_queue: Arc<crate::queue::WorkQueue>,
    joins: Arc<DashMap<u64, Arc<PendingJoin>>>,
}

impl EmbeddingFanout {
    /// Spawns `workers_per_encoder` sub-workers against each of `text` and
    /// `vision` (default K=3 for throughput; K=1 is a correctness-
    /// preserving lower bound, per §4.8 step 3).
    pub fn spawn<T, V>(
        text: Arc<T>,
        vision: Arc<V>,
        workers_per_encoder: usize,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Self
    where
        T: TextEncoder + 'static,
        V: VisionEncoder + 'static,
    {
        let text_queue = Arc::new(crate::queue::WorkQueue::with_default_capacity());
        let vision_queue = Arc::new(crate::queue::WorkQueue::with_default_capacity());
        let joins: Arc<DashMap<u64, Arc<PendingJoin>>> = Arc::new(DashMap::new());

        for worker_idx in 0..workers_per_encoder.max(1) {
            let queue = Arc::clone(&text_queue);
            let joins = Arc::clone(&joins);
            let text = Arc::clone(&text);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_encoder_sub_worker(worker_idx, queue, joins, cancel, EncoderKind::Text, move |job| {
                    let text = Arc::clone(&text);
                    let input = job.text_input.clone();
                    async move { text.encode(&input).await }
                })
                .await;
            });
        }

        for worker_idx in 0..workers_per_encoder.max(1) {
            let queue = Arc::clone(&vision_queue);
            let joins = Arc::clone(&joins);
            let vision = Arc::clone(&vision);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_encoder_sub_worker(worker_idx, queue, joins, cancel, EncoderKind::Vision, move |job| {
                    let vision = Arc::clone(&vision);
                    let path = job.image_path.clone();
                    async move { vision.encode(&path).await }
                })
                .await;
            });
        }

        Self {
            text_queue,
            vision_queue,
            joins,
        }
    }

    /// Dispatches one image to both encoders and returns a receiver that
    /// resolves once both have completed (§4.8 steps 4-6).
    pub fn dispatch(
        &self,
        image_id: u64,
        prompt: &str,
        negative_prompt: &str,
        image_path: std::path::PathBuf,
    ) -> oneshot::Receiver<Option<EmbeddingBundle>> {
        let (tx, rx) = oneshot::channel();
        self.joins.insert(image_id, Arc::new(PendingJoin::new(tx)));

        let text_input = embedding_text_input(prompt, negative_prompt);
        let _ = self.text_queue.push(crate::queue::Job {
            image_id,
            image_path: image_path.clone(),
            auxiliary_input: Some(text_input),
        });
        let _ = self.vision_queue.push(crate::queue::Job {
            image_id,
            image_path,
            auxiliary_input: None,
        });

        rx
    }

    pub fn shutdown(&self) {
        self.text_queue.complete();
        self.vision_queue.complete();
    }
}

async fn run_encoder_sub_worker<F, Fut>(
    worker_idx: usize,
    queue: Arc<crate::queue::WorkQueue>,
    joins: Arc<DashMap<u64, Arc<PendingJoin>>>,
    cancel: tokio_util::sync::CancellationToken,
    kind: EncoderKind,
    encode: F,
) where
    F: Fn(EncoderJob) -> Fut,
    Fut: std::future::Future<Output = Result<Vec<f32>, StageError>>,
{
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let job = match queue.recv_timeout(std::time::Duration::from_millis(500)) {
            Ok(job) => job,
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                if queue.is_closed() && queue.is_empty() {
                    break;
                }
                continue;
            }
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
        };

        let image_id = job.image_id;
        let encoder_job = EncoderJob {
            image_id,
            text_input: job.auxiliary_input.clone().unwrap_or_default(),
            image_path: job.image_path.clone(),
        };

        let result = encode(encoder_job).await.ok();

        let join = joins.get(&image_id).map(|entry| Arc::clone(entry.value()));
        if let Some(join) = join {
            if let Some(bundle_or_none) = join.complete_slot(kind, result) {
                joins.remove(&image_id);
                if let Some(sender) = join.completion.lock().take() {
                    let _ = sender.send(bundle_or_none);
                }
            }
        }
    }
    log::debug!("{:?} encoder sub-worker {} exiting", kind, worker_idx);
}
