//! Wires [`crate::fanout::EmbeddingFanout`] behind the same [`StageControl`]
//! seam [`crate::stage_orchestrator::StageOrchestrator`] gives the other
//! three stages (§4.8, §4.9).
//!
//! Embedding doesn't fit `StageOrchestrator<P, I>`'s one-`produce`-call
//! worker model: each job needs two encoder calls joined together before a
//! result exists, not one backend call. This mirrors that orchestrator's
//! state machine, progress tracking, and single-cleanup-path shape, but
//! drives [`crate::fanout::EmbeddingFanout`] as its workhorse in place of
//! `spawn_worker`/`run_pool_worker`, and feeds `JobOutcome`s into the same
//! `drain_outcomes` sink the other stages use.

use crate::backend::{JobOutcome, StagePayload};
use crate::error::{OrchestratorError, StageError};
use crate::events::Event;
use crate::fanout::{EmbeddingFanout, TextEncoder, VisionEncoder};
use crate::global_orchestrator::StageControl;
use crate::progress::ProgressTracker;
use crate::stage::{ServiceAllocation, Stage};
use crate::stage_orchestrator::{drain_outcomes, StageStatus, STOP_GRACE_PERIOD};
use crate::store::{PersistedStatus, PersistedWorkerState, Store};
use crate::worker::PAUSE_POLL_INTERVAL;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Builds the text/vision encoder pair the embedding stage needs, once per
/// `start` call — the fan-out equivalent of
/// [`crate::stage_orchestrator::BackendFactory`].
#[async_trait]
pub trait EmbeddingBackendFactory<T, V>: Send + Sync
where
    T: TextEncoder,
    V: VisionEncoder,
{
    async fn build_text(&self, device_id: u32) -> Result<T, String>;
    async fn build_vision(&self, device_id: u32) -> Result<V, String>;
}

struct RunningEmbedding {
    fanout: Arc<EmbeddingFanout>,
    backend_footprints: Vec<(u32, u64)>,
}

/// Drives the embedding stage end to end: pages pending rows, dispatches
/// each to a shared [`EmbeddingFanout`], and writes results once both
/// encoders join. Only builds against the first device in its allocation —
/// `EmbeddingFanout` pairs one encoder pool per orchestrator rather than one
/// per device, and nothing in this pipeline's scenarios exercises embedding
/// spread across more than one device.
pub struct EmbeddingStageOrchestrator<T, V> {
    store: Arc<dyn Store>,
    vram: Arc<crate::device::VramTracker>,
    events: Option<mpsc::UnboundedSender<Event>>,
    status: Mutex<StageStatus>,
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
    progress: Mutex<Option<Arc<ProgressTracker>>>,
    running: Mutex<Option<RunningEmbedding>>,
    stopped_tx: watch::Sender<bool>,
    _marker: std::marker::PhantomData<(T, V)>,
}

impl<T, V> EmbeddingStageOrchestrator<T, V>
where
    T: TextEncoder + 'static,
    V: VisionEncoder + 'static,
{
    pub fn new(
        store: Arc<dyn Store>,
        vram: Arc<crate::device::VramTracker>,
        events: Option<mpsc::UnboundedSender<Event>>,
        parent_cancel: &CancellationToken,
    ) -> Self {
        Self {
            store,
            vram,
            events,
            status: Mutex::new(StageStatus::Idle),
            paused: Arc::new(AtomicBool::new(false)),
            cancel: parent_cancel.child_token(),
            progress: Mutex::new(None),
            running: Mutex::new(None),
            stopped_tx: watch::channel(false).0,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn stage(&self) -> Stage {
        Stage::Embedding
    }

    pub async fn status(&self) -> StageStatus {
        *self.status.lock().await
    }

    /// Builds the encoder pair from `factory`, spawns the fan-out, and
    /// starts the cursor-paginator dispatch loop. `allocation`'s first
    /// device's `worker_count` is used as the fan-out's sub-workers-per-
    /// encoder count (§4.8 step 3).
    pub async fn start(
        self: &Arc<Self>,
        allocation: ServiceAllocation,
        factory: Arc<dyn EmbeddingBackendFactory<T, V>>,
        batch_size: usize,
    ) -> Result<(), OrchestratorError> {
        {
            let mut status = self.status.lock().await;
            if *status != StageStatus::Idle {
                return Err(OrchestratorError::AlreadyRunning(Stage::Embedding));
            }
            *status = StageStatus::Starting;
        }

        let restore_as_paused = matches!(
            self.store.read_worker_state(Stage::Embedding).await.ok().flatten().map(|s| s.status),
            Some(PersistedStatus::Running)
        );

        let total_pending = self.store.count_pending(Stage::Embedding).await.map_err(OrchestratorError::Store)?;
        let progress = Arc::new(ProgressTracker::new(Stage::Embedding, total_pending, self.events.clone()));
        *self.progress.lock().await = Some(Arc::clone(&progress));

        let Some(first) = allocation.allocations.first().copied() else {
            *self.status.lock().await = StageStatus::Stopped;
            self.persist_status(PersistedStatus::Stopped).await;
            return Ok(());
        };
        let footprints: Vec<(u32, u64)> = allocation.allocations.iter().map(|a| (a.device_id, a.vram_bytes)).collect();
        let workers_per_encoder = first.worker_count.max(1);

        let text = match factory.build_text(first.device_id).await {
            Ok(t) => t,
            Err(reason) => return self.fail_start(first.device_id, reason).await,
        };
        let vision = match factory.build_vision(first.device_id).await {
            Ok(v) => v,
            Err(reason) => return self.fail_start(first.device_id, reason).await,
        };

        let fanout = Arc::new(EmbeddingFanout::spawn(Arc::new(text), Arc::new(vision), workers_per_encoder, self.cancel.clone()));

        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel::<JobOutcome>();
        let dispatcher = self.spawn_dispatcher(Arc::clone(&fanout), Arc::clone(&progress), batch_size, workers_per_encoder, outcomes_tx);
        let collector = tokio::spawn(drain_outcomes(
            outcomes_rx,
            Arc::clone(&progress),
            Arc::clone(&self.store),
            Stage::Embedding,
            String::new(),
        ));

        *self.running.lock().await = Some(RunningEmbedding { fanout, backend_footprints: footprints });

        if restore_as_paused {
            self.paused.store(true, Ordering::Release);
            *self.status.lock().await = StageStatus::Paused;
            self.emit_status("paused", true, true);
            self.persist_status(PersistedStatus::Paused).await;
            log::info!("embedding restored a persisted 'running' state from a prior process; starting paused");
        } else {
            *self.status.lock().await = StageStatus::Running;
            self.emit_status("running", true, false);
            self.persist_status(PersistedStatus::Running).await;
        }

        self.spawn_finisher(dispatcher, collector);
        Ok(())
    }

    /// Cursor-paginates pending embedding rows and dispatches each to the
    /// fan-out, bounding concurrent in-flight joins with a semaphore sized
    /// off `workers_per_encoder` rather than spawning unboundedly.
    fn spawn_dispatcher(
        self: &Arc<Self>,
        fanout: Arc<EmbeddingFanout>,
        progress: Arc<ProgressTracker>,
        batch_size: usize,
        workers_per_encoder: usize,
        outcomes: mpsc::UnboundedSender<JobOutcome>,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(workers_per_encoder.max(1) * 4));
            let mut job_handles = Vec::new();
            let mut last_id: u64 = 0;

            'outer: loop {
                while this.paused.load(Ordering::Acquire) {
                    if this.cancel.is_cancelled() {
                        break 'outer;
                    }
                    tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
                }
                if this.cancel.is_cancelled() {
                    break;
                }

                let batch = match this.store.fetch_pending(Stage::Embedding, batch_size, last_id).await {
                    Ok(ids) => ids,
                    Err(e) => {
                        log::error!("embedding cursor paginator failed: {}", e);
                        break;
                    }
                };
                if batch.is_empty() {
                    break;
                }
                let short = batch.len() < batch_size;
                let max_id = *batch.iter().max().unwrap();

                for id in batch {
                    if this.cancel.is_cancelled() {
                        break 'outer;
                    }
                    let record = match this.store.get_image(id).await {
                        Ok(Some(r)) => r,
                        Ok(None) => {
                            progress.record_skip();
                            continue;
                        }
                        Err(e) => {
                            log::error!("embedding get_image failed for {}: {}", id, e);
                            continue;
                        }
                    };
                    // Embedding needs both a prompt (text encoder input) and
                    // an image (vision encoder input); missing either means
                    // there's nothing to dispatch.
                    if record.prompt.is_empty() || record.path.as_os_str().is_empty() {
                        progress.record_skip();
                        continue;
                    }

                    let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                        break 'outer;
                    };
                    let rx = fanout.dispatch(id, &record.prompt, &record.negative_prompt, record.path.clone());
                    let outcomes = outcomes.clone();
                    job_handles.push(tokio::spawn(async move {
                        let outcome = match rx.await {
                            Ok(Some(bundle)) => JobOutcome::ok(id, StagePayload::Embedding(bundle)),
                            Ok(None) => JobOutcome::failed(id, StageError::Backend("embedding join incomplete".to_string())),
                            Err(_) => JobOutcome::failed(id, StageError::Cancelled),
                        };
                        let _ = outcomes.send(outcome);
                        drop(permit);
                    }));
                }

                last_id = max_id;
                if short {
                    break;
                }
            }

            let wait_jobs = async {
                for handle in job_handles {
                    let _ = handle.await;
                }
            };
            if tokio::time::timeout(STOP_GRACE_PERIOD, wait_jobs).await.is_err() {
                log::warn!("embedding dispatcher: in-flight joins exceeded grace period; abandoning stragglers");
            }
        })
    }

    fn spawn_finisher(self: &Arc<Self>, dispatcher: JoinHandle<()>, collector: JoinHandle<()>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _ = dispatcher.await;
            let _ = collector.await;
            this.finish().await;
        });
    }

    async fn finish(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.fanout.shutdown();
        for (device_id, bytes) in running.backend_footprints {
            self.vram.release(device_id, bytes);
        }

        *self.status.lock().await = StageStatus::Stopped;
        self.persist_status(PersistedStatus::Stopped).await;
        if let Some(tx) = &self.events {
            let _ = tx.send(Event::ServiceCompleted(Stage::Embedding));
        }
        self.emit_status("stopped", false, false);
        let _ = self.stopped_tx.send(true);
    }

    async fn fail_start(self: &Arc<Self>, device_id: u32, reason: String) -> Result<(), OrchestratorError> {
        *self.status.lock().await = StageStatus::Stopped;
        self.persist_status(PersistedStatus::Stopped).await;
        Err(OrchestratorError::BackendInit {
            stage: Stage::Embedding,
            device: device_id,
            reason,
        })
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

    pub async fn stop(&self) -> Result<(), OrchestratorError> {
        *self.status.lock().await = StageStatus::Stopping;
        self.cancel.cancel();

        if let Some(running) = self.running.lock().await.as_ref() {
            running.fanout.shutdown();
        }

        let mut stopped = self.stopped_tx.subscribe();
        if *stopped.borrow() {
            return Ok(());
        }
        if tokio::time::timeout(STOP_GRACE_PERIOD + std::time::Duration::from_secs(2), stopped.changed())
            .await
            .is_err()
        {
            log::warn!("embedding stop: finisher did not report completion in time; finishing directly");
            self.finish().await;
        }
        Ok(())
    }

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
                stage: Stage::Embedding,
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
        if let Err(e) = self.store.write_worker_state(Stage::Embedding, &state).await {
            log::error!("embedding failed to persist worker state: {}", e);
        }
    }
}

/// Binds one [`EmbeddingStageOrchestrator`] to its factory and batch size,
/// behind the type-erased [`StageControl`] seam — the embedding counterpart
/// to [`crate::global_orchestrator::StageRuntime`].
pub struct EmbeddingStageRuntime<T, V> {
    pub orchestrator: Arc<EmbeddingStageOrchestrator<T, V>>,
    pub factory: Arc<dyn EmbeddingBackendFactory<T, V>>,
    pub batch_size: usize,
}

#[async_trait]
impl<T, V> StageControl for EmbeddingStageRuntime<T, V>
where
    T: TextEncoder + 'static,
    V: VisionEncoder + 'static,
{
    fn stage(&self) -> Stage {
        Stage::Embedding
    }

    async fn start(&self, allocation: ServiceAllocation) -> Result<(), OrchestratorError> {
        self.orchestrator.start(allocation, Arc::clone(&self.factory), self.batch_size).await
    }

    async fn pause(&self) {
        self.orchestrator.pause().await;
    }

    async fn resume(&self) {
        self.orchestrator.resume().await;
    }

    async fn stop(&self) -> Result<(), OrchestratorError> {
        self.orchestrator.stop().await
    }

    async fn status(&self) -> StageStatus {
        self.orchestrator.status().await
    }

    async fn released_vram(&self) -> Vec<(u32, u64)> {
        self.orchestrator.released_vram().await
    }
}
