//! The per-stage state machine (§4.9): `Idle → Starting → Running ↔ Paused
//! → Stopping → Stopped`.
//!
//! Grounds on the teacher's pool lifecycle (`pool/core/spawn.rs`'s
//! spawn-lock pattern for cold start, `pool/maintenance.rs`'s polling
//! maintenance loop for the drain-or-timeout shape) generalized from "one
//! pool of one capability" to "one orchestrator owning a queue, a pool or a
//! set of instances, N workers, and a result writer."

use crate::backend::{ExclusiveBackend, JobOutcome, SharedBackend, StageBackend, StagePayload};
use crate::error::OrchestratorError;
use crate::events::Event;
use crate::pagination::populate_queue;
use crate::progress::ProgressTracker;
use crate::queue::WorkQueue;
use crate::stage::{Allocation, ServiceAllocation, Stage};
use crate::store::{CaptionMetadata, PersistedStatus, PersistedWorkerState, Store};
use crate::worker::spawn_worker;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Bound on how long `stop` waits for in-flight workers to finish, per §5's
/// 5-10s grace period.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Idle,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
}

/// Builds the backend(s) a stage needs, one call per `(device, role)` pair
/// at `start` time. Kept separate from `SharedBackend`/`ExclusiveBackend` so
/// orchestrators don't need to know how backends are constructed, only how
/// to drive them.
#[async_trait]
pub trait BackendFactory<P, I>: Send + Sync
where
    P: SharedBackend,
    I: ExclusiveBackend,
{
    async fn build_pool(&self, device_id: u32) -> Result<P, String>;
    async fn build_instance(&self, device_id: u32) -> Result<I, String>;
}

struct RunningHandles {
    queue: Arc<WorkQueue>,
    backend_footprints: Vec<(u32, u64)>,
}

/// Drives one stage end to end: builds its backend(s), populates its
/// queue, runs its workers, writes results, and answers pause/resume/stop.
pub struct StageOrchestrator<P, I> {
    stage: Stage,
    store: Arc<dyn Store>,
    vram: Arc<crate::device::VramTracker>,
    events: Option<mpsc::UnboundedSender<Event>>,
    status: Mutex<StageStatus>,
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
    progress: Mutex<Option<Arc<ProgressTracker>>>,
    running: Mutex<Option<RunningHandles>>,
    stopped_tx: watch::Sender<bool>,
    tagger_source: String,
    _marker: std::marker::PhantomData<(P, I)>,
}

impl<P, I> StageOrchestrator<P, I>
where
    P: SharedBackend + 'static,
    I: ExclusiveBackend + 'static,
{
    pub fn new(
        stage: Stage,
        store: Arc<dyn Store>,
        vram: Arc<crate::device::VramTracker>,
        events: Option<mpsc::UnboundedSender<Event>>,
        parent_cancel: &CancellationToken,
        tagger_source: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            store,
            vram,
            events,
            status: Mutex::new(StageStatus::Idle),
            paused: Arc::new(AtomicBool::new(false)),
            cancel: parent_cancel.child_token(),
            progress: Mutex::new(None),
            running: Mutex::new(None),
            stopped_tx: watch::channel(false).0,
            tagger_source: tagger_source.into(),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub async fn status(&self) -> StageStatus {
        *self.status.lock().await
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// `Idle → Starting → Running`, or `Starting → Stopped` on backend
    /// init failure. Builds every backend named in `allocation`, spawns the
    /// queue populator, spawns one worker per allocated slot.
    pub async fn start(
        self: &Arc<Self>,
        allocation: ServiceAllocation,
        factory: Arc<dyn BackendFactory<P, I>>,
        batch_size: usize,
    ) -> Result<(), OrchestratorError> {
        {
            let mut status = self.status.lock().await;
            if *status != StageStatus::Idle {
                return Err(OrchestratorError::AlreadyRunning(self.stage));
            }
            *status = StageStatus::Starting;
        }

        // §6 closing paragraph: a persisted `running` status means the
        // previous process died mid-run without getting to update it. Never
        // auto-resume from that — start paused and let an operator resume.
        let restore_as_paused = matches!(
            self.store.read_worker_state(self.stage).await.ok().flatten().map(|s| s.status),
            Some(PersistedStatus::Running)
        );

        let queue = Arc::new(WorkQueue::with_default_capacity());
        let total_pending = self.store.count_pending(self.stage).await.map_err(OrchestratorError::Store)?;
        let progress = Arc::new(ProgressTracker::new(self.stage, total_pending, self.events.clone()));
        *self.progress.lock().await = Some(Arc::clone(&progress));

        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel::<JobOutcome>();
        let mut workers = Vec::new();
        let mut footprints = Vec::new();

        for Allocation { device_id, worker_count, model_count, vram_bytes, .. } in &allocation.allocations {
            let device_id = *device_id;
            footprints.push((device_id, *vram_bytes));

            if self.stage.is_shared() {
                let pool = match factory.build_pool(device_id).await {
                    Ok(p) => p,
                    Err(reason) => return self.fail_start(device_id, reason).await,
                };
                if let Err(reason) = pool.initialize().await {
                    return self.fail_start(device_id, reason).await;
                }
                let pool = Arc::new(pool);
                for worker_idx in 0..*worker_count {
                    let backend = StageBackend::<P, I>::Pool(Arc::clone(&pool));
                    workers.push(spawn_worker(
                        worker_idx,
                        backend,
                        Arc::clone(&queue),
                        Arc::clone(&self.paused),
                        self.cancel.clone(),
                        outcomes_tx.clone(),
                    ));
                }
            } else {
                for worker_idx in 0..*model_count {
                    let mut instance = match factory.build_instance(device_id).await {
                        Ok(i) => i,
                        Err(reason) => return self.fail_start(device_id, reason).await,
                    };
                    if let Err(reason) = instance.initialize().await {
                        return self.fail_start(device_id, reason).await;
                    }
                    let backend = StageBackend::<P, I>::Instance(instance);
                    workers.push(spawn_worker(
                        worker_idx,
                        backend,
                        Arc::clone(&queue),
                        Arc::clone(&self.paused),
                        self.cancel.clone(),
                        outcomes_tx.clone(),
                    ));
                }
            }
        }
        drop(outcomes_tx);

        let populator = tokio::spawn(populate_queue(
            Arc::clone(&self.store),
            self.stage,
            Arc::clone(&queue),
            Arc::clone(&progress),
            batch_size,
        ));

        let collector = self.spawn_collector(outcomes_rx, Arc::clone(&progress));

        *self.running.lock().await = Some(RunningHandles {
            queue: Arc::clone(&queue),
            backend_footprints: footprints,
        });
        if restore_as_paused {
            self.paused.store(true, Ordering::Release);
            *self.status.lock().await = StageStatus::Paused;
            self.emit_status("paused", true, true);
            self.persist_status(PersistedStatus::Paused).await;
            log::info!(
                "{:?} restored a persisted 'running' state from a prior process; starting paused",
                self.stage
            );
        } else {
            *self.status.lock().await = StageStatus::Running;
            self.emit_status("running", true, false);
            self.persist_status(PersistedStatus::Running).await;
        }

        self.spawn_finisher(populator, workers, collector);
        Ok(())
    }

    /// Awaits the populator, then the workers (bounded by
    /// [`STOP_GRACE_PERIOD`]), then the collector, then runs [`Self::finish`].
    /// Drives both the unprompted "queue drained" transition and a
    /// `stop()`-triggered one through the same single cleanup path — whoever
    /// gets there first performs it, via `running`'s `take`.
    fn spawn_finisher(
        self: &Arc<Self>,
        populator: JoinHandle<()>,
        workers: Vec<JoinHandle<()>>,
        collector: JoinHandle<()>,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _ = populator.await;

            let wait_workers = async {
                for handle in workers {
                    let _ = handle.await;
                }
            };
            if tokio::time::timeout(STOP_GRACE_PERIOD, wait_workers).await.is_err() {
                log::warn!("{:?} stop exceeded grace period; abandoning stragglers", this.stage);
            }

            collector.abort();
            let _ = collector.await;

            this.finish().await;
        });
    }

    /// Single cleanup path for both the natural "queue drained" completion
    /// and a manual [`Self::stop`]: releases VRAM, marks `Stopped`, persists,
    /// emits `ServiceCompleted`. Idempotent via `running`'s `take` — the
    /// loser of the race (if both happen to fire) finds `None` and no-ops.
    async fn finish(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        for (device_id, bytes) in running.backend_footprints {
            self.vram.release(device_id, bytes);
        }

        *self.status.lock().await = StageStatus::Stopped;
        self.persist_status(PersistedStatus::Stopped).await;
        if let Some(tx) = &self.events {
            let _ = tx.send(Event::ServiceCompleted(self.stage));
        }
        self.emit_status("stopped", false, false);
        let _ = self.stopped_tx.send(true);
    }

    async fn fail_start(self: &Arc<Self>, device_id: u32, reason: String) -> Result<(), OrchestratorError> {
        *self.status.lock().await = StageStatus::Stopped;
        self.persist_status(PersistedStatus::Stopped).await;
        Err(OrchestratorError::BackendInit {
            stage: self.stage,
            device: device_id,
            reason,
        })
    }

    fn spawn_collector(
        self: &Arc<Self>,
        outcomes_rx: mpsc::UnboundedReceiver<JobOutcome>,
        progress: Arc<ProgressTracker>,
    ) -> JoinHandle<()> {
        tokio::spawn(drain_outcomes(
            outcomes_rx,
            progress,
            Arc::clone(&self.store),
            self.stage,
            self.tagger_source.clone(),
        ))
    }

    pub async fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        *self.status.lock().await = StageStatus::Paused;
        self.emit_status("paused", true, true);
        self.persist_status(PersistedStatus::Paused).await;
    }

    pub async fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        *self.status.lock().await = StageStatus::Running;
        self.emit_status("running", true, false);
        self.persist_status(PersistedStatus::Running).await;
    }

    /// `Running|Paused → Stopping → Stopped`: cancels the worker/populator
    /// cancellation token, closes the queue so a worker blocked on `recv`
    /// wakes immediately, then waits for [`Self::spawn_finisher`]'s cleanup
    /// (shared with the unprompted "queue drained" path) to land, bounded by
    /// [`STOP_GRACE_PERIOD`] plus a short margin as a backstop.
    pub async fn stop(&self) -> Result<(), OrchestratorError> {
        *self.status.lock().await = StageStatus::Stopping;
        self.cancel.cancel();

        if let Some(running) = self.running.lock().await.as_ref() {
            running.queue.complete();
        }

        let mut stopped = self.stopped_tx.subscribe();
        if *stopped.borrow() {
            return Ok(());
        }
        if tokio::time::timeout(STOP_GRACE_PERIOD + Duration::from_secs(2), stopped.changed())
            .await
            .is_err()
        {
            log::warn!("{:?} stop: finisher did not report completion in time; finishing directly", self.stage);
            self.finish().await;
        }
        Ok(())
    }

    /// Reserved VRAM for this stage's currently running allocation, if any
    /// — informational only; the stage itself is the sole caller of
    /// `VramTracker::release` (via [`Self::finish`]), so callers must not
    /// release these bytes again.
    pub async fn released_vram(&self) -> Vec<(u32, u64)> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| r.backend_footprints.clone())
            .unwrap_or_default()
    }

    fn emit_status(&self, text: &str, is_running: bool, is_paused: bool) {
        if let Some(tx) = &self.events {
            let _ = tx.send(Event::StatusChanged {
                stage: self.stage,
                text: text.to_string(),
                is_running,
                is_paused,
            });
        }
    }

    async fn persist_status(&self, status: PersistedStatus) {
        let state = PersistedWorkerState {
            status,
            models_loaded: status != PersistedStatus::Stopped,
            total_processed: self.progress.lock().await.as_ref().map(|p| p.progress()).unwrap_or(0),
            total_failed: 0,
            last_error: None,
        };
        if let Err(e) = self.store.write_worker_state(self.stage, &state).await {
            log::error!("{:?} failed to persist worker state: {}", self.stage, e);
        }
    }
}

/// Drains a stage's outcome channel, writing each result to the store and
/// recording progress, until every sender has been dropped. Shared by
/// [`StageOrchestrator`]'s worker pool and
/// [`crate::embedding_stage::EmbeddingStageOrchestrator`]'s fan-out
/// dispatcher — both funnel `JobOutcome`s through the same sink.
pub(crate) async fn drain_outcomes(
    mut outcomes_rx: mpsc::UnboundedReceiver<JobOutcome>,
    progress: Arc<ProgressTracker>,
    store: Arc<dyn Store>,
    stage: Stage,
    tagger_source: String,
) {
    while let Some(outcome) = outcomes_rx.recv().await {
        write_job_outcome(store.as_ref(), stage, &tagger_source, &outcome).await;
        progress.record_completion();
    }
}

/// Writes one job's outcome to the store and clears its `needs_*` flag,
/// with the §9 Open Question 1 asymmetry preserved: embedding's failed join
/// does not clear the flag, every other stage's failure does.
pub(crate) async fn write_job_outcome(store: &dyn Store, stage: Stage, tagger_source: &str, outcome: &JobOutcome) {
    let image_id = outcome.image_id;
    if outcome.success {
        if let Some(payload) = &outcome.payload {
            let result = match payload {
                StagePayload::Tags(tags) => store.write_tags(image_id, tags, tagger_source).await,
                StagePayload::Caption(text) => {
                    store.write_caption_with_metadata(image_id, text, &CaptionMetadata::default()).await
                }
                StagePayload::Faces(faces) => {
                    let records = faces
                        .iter()
                        .map(|f| crate::store::FaceRecord {
                            bbox: f.bbox,
                            confidence: f.confidence,
                            embedding: f.embedding.clone(),
                            landmarks: f.landmarks.clone(),
                        })
                        .collect::<Vec<_>>();
                    store.write_faces(image_id, &records).await
                }
                StagePayload::Embedding(bundle) => {
                    store.write_embeddings(image_id, &bundle.text_vec, &bundle.vision_vec, true).await
                }
            };
            if let Err(e) = result {
                log::error!("{:?} store write failed for image {}: {}", stage, image_id, e);
            }
        }
    } else if let Some(err) = &outcome.error {
        log::warn!("{:?} backend error for image {}: {}", stage, image_id, err);
    }

    let should_clear = outcome.success || stage != Stage::Embedding;
    if should_clear {
        if let Err(e) = store.clear_needs_flag(stage, &[image_id]).await {
            log::error!("{:?} clear_needs_flag failed for image {}: {}", stage, image_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_are_simple_enum_values() {
        assert_ne!(StageStatus::Idle, StageStatus::Running);
        assert_eq!(StageStatus::Paused, StageStatus::Paused);
    }
}
