//! End-to-end scenarios from the testable-properties section: simple
//! tagging, concurrent tagging+captioning under a tight VRAM budget,
//! embedding fan-out correctness, pause/resume, deferred-stage admission
//! after completion, and graceful stop under load.

use gpu_pipeline_scheduler::backend::{EncoderKind, ExclusiveBackend, SharedBackend, StagePayload};
use gpu_pipeline_scheduler::device::{Device, VramTracker};
use gpu_pipeline_scheduler::embedding_stage::{EmbeddingStageOrchestrator, EmbeddingStageRuntime};
use gpu_pipeline_scheduler::error::StageError;
use gpu_pipeline_scheduler::fanout::{EmbeddingFanout, TextEncoder, VisionEncoder};
use gpu_pipeline_scheduler::global_orchestrator::{GlobalOrchestrator, StageControl, StageRuntime};
use gpu_pipeline_scheduler::mock::{
    sample_image, ClosureBackendFactory, ClosureEmbeddingFactory, MockInstanceBackend, MockPoolBackend, MockStore,
    MockTextEncoder, MockVisionEncoder,
};
use gpu_pipeline_scheduler::stage::Stage;
use gpu_pipeline_scheduler::stage_orchestrator::{StageOrchestrator, StageStatus};
use gpu_pipeline_scheduler::store::{PersistedStatus, PersistedWorkerState, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn tagging_runtime(
    store: Arc<dyn Store>,
    vram: Arc<VramTracker>,
    cancel: &CancellationToken,
    events: Option<tokio::sync::mpsc::UnboundedSender<gpu_pipeline_scheduler::events::Event>>,
) -> Arc<StageRuntime<MockPoolBackend, MockInstanceBackend>> {
    let orchestrator = Arc::new(StageOrchestrator::new(
        Stage::Tagging,
        store,
        vram,
        events,
        cancel,
        "tagging",
    ));
    let footprint = Stage::Tagging.shared_pool_vram_bytes().unwrap();
    let factory = Arc::new(ClosureBackendFactory::new(
        move |_device_id: u32| MockPoolBackend::tagging(footprint),
        |_device_id: u32| unreachable!("tagging is shared-pool"),
    ));
    Arc::new(StageRuntime {
        orchestrator,
        factory,
        batch_size: Stage::Tagging.default_batch_size(),
    })
}

fn captioning_runtime(
    store: Arc<dyn Store>,
    vram: Arc<VramTracker>,
    cancel: &CancellationToken,
    events: Option<tokio::sync::mpsc::UnboundedSender<gpu_pipeline_scheduler::events::Event>>,
) -> Arc<StageRuntime<MockPoolBackend, MockInstanceBackend>> {
    let orchestrator = Arc::new(StageOrchestrator::new(
        Stage::Captioning,
        store,
        vram,
        events,
        cancel,
        "captioning",
    ));
    let footprint = Stage::Captioning.per_instance_vram_bytes().unwrap();
    let factory = Arc::new(ClosureBackendFactory::new(
        |_device_id: u32| MockPoolBackend::tagging(0),
        move |_device_id: u32| MockInstanceBackend::captioning(footprint),
    ));
    Arc::new(StageRuntime {
        orchestrator,
        factory,
        batch_size: Stage::Captioning.default_batch_size(),
    })
}

async fn wait_for_completion(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<gpu_pipeline_scheduler::events::Event>,
) {
    use gpu_pipeline_scheduler::events::Event;
    loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some(Event::AllServicesCompleted)) => return,
            Ok(Some(_)) => continue,
            Ok(None) => return,
            Err(_) => return,
        }
    }
}

/// Scenario 1: simple tagging — one device, 100 pending, a single shared
/// pool admitted with the default worker count.
#[tokio::test]
async fn scenario_1_simple_tagging() {
    let store = Arc::new(MockStore::new());
    for id in 0..100 {
        store.seed(sample_image(id, "a photo"), &[Stage::Tagging]);
    }
    let vram = Arc::new(VramTracker::new(vec![Device::new(0, 32 * 1024 * 1024 * 1024, 85)]));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let orchestrator = GlobalOrchestrator::spawn(
        Arc::clone(&vram),
        Arc::clone(&store) as Arc<dyn Store>,
        None,
        Some(tx),
    );
    let cancel = orchestrator.cancellation_token();

    let tagging = tagging_runtime(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::clone(&vram),
        &cancel,
        Some(orchestrator.stage_events_sender()),
    );
    orchestrator.admit(vec![tagging.clone() as Arc<dyn StageControl>]).await.unwrap();

    wait_for_completion(&mut rx).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(store.tags_written.lock().len(), 100);
    assert_eq!(vram.reserved_bytes(0), 0);
}

/// Scenario 2: concurrent tagging + captioning on a tight budget — both
/// stages admit, tagging gets the shared-pool default and captioning gets
/// `floor(available / per_instance)` instances.
#[tokio::test]
async fn scenario_2_concurrent_tight_budget() {
    let store = Arc::new(MockStore::new());
    for id in 0..50 {
        store.seed(sample_image(id, "a photo"), &[Stage::Tagging, Stage::Captioning]);
    }
    // 16 GB * 85% = 13.6 GB available. Tagging reserves 2.6 GB (per stage.rs
    // constants), leaving 11.0 GB; captioning's 5.6 GB/instance gives 1.
    let vram = Arc::new(VramTracker::new(vec![Device::new(0, 16 * 1024 * 1024 * 1024, 85)]));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let orchestrator = GlobalOrchestrator::spawn(
        Arc::clone(&vram),
        Arc::clone(&store) as Arc<dyn Store>,
        None,
        Some(tx),
    );
    let cancel = orchestrator.cancellation_token();

    let events = Some(orchestrator.stage_events_sender());
    let tagging = tagging_runtime(Arc::clone(&store) as Arc<dyn Store>, Arc::clone(&vram), &cancel, events.clone());
    let captioning =
        captioning_runtime(Arc::clone(&store) as Arc<dyn Store>, Arc::clone(&vram), &cancel, events);
    orchestrator
        .admit(vec![
            tagging.clone() as Arc<dyn StageControl>,
            captioning.clone() as Arc<dyn StageControl>,
        ])
        .await
        .unwrap();

    wait_for_completion(&mut rx).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(store.tags_written.lock().len(), 50);
    assert_eq!(store.captions_written.lock().len(), 50);
}

struct StaticTextEncoder;
#[async_trait::async_trait]
impl TextEncoder for StaticTextEncoder {
    async fn encode(&self, text: &str) -> Result<Vec<f32>, StageError> {
        Ok(vec![text.len() as f32])
    }
}

struct StaticVisionEncoder;
#[async_trait::async_trait]
impl VisionEncoder for StaticVisionEncoder {
    async fn encode(&self, _path: &std::path::Path) -> Result<Vec<f32>, StageError> {
        Ok(vec![1.0, 2.0, 3.0])
    }
}

/// Scenario 3: embedding fan-out correctness — one image lacks a prompt
/// and is skipped before dispatch; the other two each produce a bundle
/// from both encoders.
#[tokio::test]
async fn scenario_3_embedding_fanout_correctness() {
    let cancel = CancellationToken::new();
    let fanout = EmbeddingFanout::spawn(Arc::new(StaticTextEncoder), Arc::new(StaticVisionEncoder), 2, cancel.clone());

    let images = [(1u64, "a cat"), (2, ""), (3, "a dog")];
    let mut receivers = Vec::new();
    let mut skipped = 0;
    for (id, prompt) in images {
        if prompt.is_empty() {
            skipped += 1;
            continue;
        }
        let rx = fanout.dispatch(id, prompt, "", std::path::PathBuf::from(format!("/tmp/{id}.png")));
        receivers.push((id, rx));
    }

    let mut bundles = 0;
    for (_, rx) in receivers {
        if let Ok(Some(bundle)) = rx.await {
            assert_eq!(bundle.vision_vec, vec![1.0, 2.0, 3.0]);
            bundles += 1;
        }
    }

    assert_eq!(skipped, 1);
    assert_eq!(bundles, 2);
    fanout.shutdown();
}

/// Scenario 4: pause and resume — progress is monotone and eventually
/// reaches the full pending count after a pause/resume cycle.
#[tokio::test]
async fn scenario_4_pause_and_resume() {
    let store = Arc::new(MockStore::new());
    for id in 0..200 {
        store.seed(sample_image(id, "a photo"), &[Stage::Tagging]);
    }
    let vram = Arc::new(VramTracker::new(vec![Device::new(0, 32 * 1024 * 1024 * 1024, 85)]));
    let cancel = CancellationToken::new();
    let tagging = tagging_runtime(Arc::clone(&store) as Arc<dyn Store>, Arc::clone(&vram), &cancel, None);

    let mut allocations = Vec::new();
    for device in vram.devices() {
        let footprint = Stage::Tagging.shared_pool_vram_bytes().unwrap();
        assert!(vram.try_reserve(device.id, footprint));
        allocations.push(gpu_pipeline_scheduler::stage::Allocation {
            stage: Stage::Tagging,
            device_id: device.id,
            worker_count: 2,
            model_count: 1,
            vram_bytes: footprint,
        });
    }
    let allocation = gpu_pipeline_scheduler::stage::ServiceAllocation {
        stage: Stage::Tagging,
        mode: gpu_pipeline_scheduler::stage::AllocationMode::Solo,
        allocations,
    };

    (tagging.clone() as Arc<dyn StageControl>).start(allocation).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let before_pause = store.tags_written.lock().len();

    (tagging.clone() as Arc<dyn StageControl>).pause().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let during_pause = store.tags_written.lock().len();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let still_during_pause = store.tags_written.lock().len();
    assert_eq!(during_pause, still_during_pause, "no progress while paused");

    (tagging.clone() as Arc<dyn StageControl>).resume().await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    (tagging.clone() as Arc<dyn StageControl>).stop().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let after = store.tags_written.lock().len();
    assert!(after >= before_pause);
    assert_eq!(vram.reserved_bytes(0), 0);
}

/// Scenario 5: a deferred stage is admitted once an earlier stage
/// completes and releases VRAM. The device is sized so captioning's one
/// instance fits alone but not alongside tagging's shared pool, forcing a
/// real deferral-then-retry through the orchestrator's own completion
/// watcher rather than a manually-triggered hook.
#[tokio::test]
async fn scenario_5_deferred_stage_admitted_after_completion() {
    let store = Arc::new(MockStore::new());
    for id in 0..5 {
        store.seed(sample_image(id, "a photo"), &[Stage::Tagging]);
    }
    for id in 5..10 {
        store.seed(sample_image(id, "a photo"), &[Stage::Captioning]);
    }
    let captioning_footprint = Stage::Captioning.per_instance_vram_bytes().unwrap();
    let capacity_bytes = captioning_footprint + 100 * 1024 * 1024;
    let total_vram_bytes = (capacity_bytes as f64 / 0.85) as u64 + 1;
    let vram = Arc::new(VramTracker::new(vec![Device::new(0, total_vram_bytes, 85)]));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let orchestrator = GlobalOrchestrator::spawn(
        Arc::clone(&vram),
        Arc::clone(&store) as Arc<dyn Store>,
        None,
        Some(tx),
    );
    let cancel = orchestrator.cancellation_token();

    let events = Some(orchestrator.stage_events_sender());
    let tagging = tagging_runtime(Arc::clone(&store) as Arc<dyn Store>, Arc::clone(&vram), &cancel, events.clone());
    let captioning =
        captioning_runtime(Arc::clone(&store) as Arc<dyn Store>, Arc::clone(&vram), &cancel, events);
    orchestrator
        .admit(vec![
            tagging.clone() as Arc<dyn StageControl>,
            captioning.clone() as Arc<dyn StageControl>,
        ])
        .await
        .unwrap();

    // Captioning has nowhere to fit alongside tagging's shared pool yet.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        (captioning.clone() as Arc<dyn StageControl>).status().await,
        StageStatus::Idle,
        "captioning should be deferred until tagging releases VRAM"
    );

    wait_for_completion(&mut rx).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(store.tags_written.lock().len(), 5);
    assert_eq!(store.captions_written.lock().len(), 5, "captioning must have been admitted on retry");
    assert_eq!(vram.reserved_bytes(0), 0);
}

/// Scenario 6: graceful stop under load — every worker exits and all VRAM
/// is released within the stop timeout.
#[tokio::test]
async fn scenario_6_graceful_stop_under_load() {
    let store = Arc::new(MockStore::new());
    for id in 0..5000 {
        store.seed(sample_image(id, "a photo"), &[Stage::Tagging, Stage::Captioning]);
    }
    let vram = Arc::new(VramTracker::new(vec![Device::new(0, 64 * 1024 * 1024 * 1024, 85)]));
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let orchestrator = GlobalOrchestrator::spawn(
        Arc::clone(&vram),
        Arc::clone(&store) as Arc<dyn Store>,
        None,
        Some(tx),
    );
    let cancel = orchestrator.cancellation_token();

    let events = Some(orchestrator.stage_events_sender());
    let tagging = tagging_runtime(Arc::clone(&store) as Arc<dyn Store>, Arc::clone(&vram), &cancel, events.clone());
    let captioning =
        captioning_runtime(Arc::clone(&store) as Arc<dyn Store>, Arc::clone(&vram), &cancel, events);
    orchestrator
        .admit(vec![
            tagging as Arc<dyn StageControl>,
            captioning as Arc<dyn StageControl>,
        ])
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    orchestrator.stop_all().await.unwrap();

    assert_eq!(vram.reserved_bytes(0), 0);
}

fn embedding_runtime(
    store: Arc<dyn Store>,
    vram: Arc<VramTracker>,
    cancel: &CancellationToken,
    events: Option<tokio::sync::mpsc::UnboundedSender<gpu_pipeline_scheduler::events::Event>>,
) -> Arc<EmbeddingStageRuntime<MockTextEncoder, MockVisionEncoder>> {
    let orchestrator = Arc::new(EmbeddingStageOrchestrator::new(store, vram, events, cancel));
    let factory = Arc::new(ClosureEmbeddingFactory::new(
        |_device_id: u32| MockTextEncoder,
        |_device_id: u32| MockVisionEncoder,
    ));
    Arc::new(EmbeddingStageRuntime {
        orchestrator,
        factory,
        batch_size: Stage::Embedding.default_batch_size(),
    })
}

/// Scenario 3b: the multi-encoder fan-out runs through the real
/// `GlobalOrchestrator`/admission path, not just standalone against
/// `EmbeddingFanout` directly (scenario 3 covers that in isolation). One
/// row with an empty prompt must be skipped before dispatch; the rest must
/// produce a written embedding bundle and fully release VRAM on
/// completion.
#[tokio::test]
async fn scenario_3b_embedding_through_global_orchestrator() {
    let store = Arc::new(MockStore::new());
    for id in 0..9 {
        store.seed(sample_image(id, "a prompt"), &[Stage::Embedding]);
    }
    store.seed(sample_image(9, ""), &[Stage::Embedding]);

    let vram = Arc::new(VramTracker::new(vec![Device::new(0, 32 * 1024 * 1024 * 1024, 85)]));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let orchestrator = GlobalOrchestrator::spawn(
        Arc::clone(&vram),
        Arc::clone(&store) as Arc<dyn Store>,
        None,
        Some(tx),
    );
    let cancel = orchestrator.cancellation_token();

    let embedding = embedding_runtime(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::clone(&vram),
        &cancel,
        Some(orchestrator.stage_events_sender()),
    );
    orchestrator.admit(vec![embedding.clone() as Arc<dyn StageControl>]).await.unwrap();

    wait_for_completion(&mut rx).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let written = embedding.orchestrator.status().await;
    assert_eq!(written, StageStatus::Stopped);
    assert_eq!(store.embeddings_written.lock().len(), 9, "the empty-prompt row must be skipped");
    assert_eq!(vram.reserved_bytes(0), 0);
}

/// Scenario 7: a worker state persisted as `Running` by a prior process is
/// restored as `Paused`, never auto-resumed, on the next `start`.
#[tokio::test]
async fn scenario_7_restores_running_persisted_state_as_paused() {
    let store = Arc::new(MockStore::new());
    for id in 0..10 {
        store.seed(sample_image(id, "a photo"), &[Stage::Tagging]);
    }
    store
        .write_worker_state(
            Stage::Tagging,
            &PersistedWorkerState {
                status: PersistedStatus::Running,
                models_loaded: true,
                total_processed: 3,
                total_failed: 0,
                last_error: None,
            },
        )
        .await
        .unwrap();

    let vram = Arc::new(VramTracker::new(vec![Device::new(0, 32 * 1024 * 1024 * 1024, 85)]));
    let cancel = CancellationToken::new();
    let tagging = tagging_runtime(Arc::clone(&store) as Arc<dyn Store>, Arc::clone(&vram), &cancel, None);

    let footprint = Stage::Tagging.shared_pool_vram_bytes().unwrap();
    assert!(vram.try_reserve(0, footprint));
    let allocation = gpu_pipeline_scheduler::stage::ServiceAllocation {
        stage: Stage::Tagging,
        mode: gpu_pipeline_scheduler::stage::AllocationMode::Solo,
        allocations: vec![gpu_pipeline_scheduler::stage::Allocation {
            stage: Stage::Tagging,
            device_id: 0,
            worker_count: 2,
            model_count: 1,
            vram_bytes: footprint,
        }],
    };

    (tagging.clone() as Arc<dyn StageControl>).start(allocation).await.unwrap();

    assert_eq!(
        (tagging.clone() as Arc<dyn StageControl>).status().await,
        StageStatus::Paused,
        "a persisted 'running' state must restore as paused, never auto-resumed"
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.tags_written.lock().len(), 0, "no progress should occur before an explicit resume");

    (tagging.clone() as Arc<dyn StageControl>).resume().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(store.tags_written.lock().len() > 0, "resume must let work proceed");

    (tagging.clone() as Arc<dyn StageControl>).stop().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(vram.reserved_bytes(0), 0);
}
