//! Stateless worker loop (§4.7).
//!
//! Grounds on `pool/capabilities/image_embedding.rs::image_embedding_worker`
//! (request/shutdown/health `crossbeam::select!` loop), generalized from
//! "N request-channel types, one per RPC" to "one `Job` channel, checked
//! against a pause flag and a cancellation token" since this spec has one
//! logical operation per stage rather than four.
//!
//! Workers never write to the store, never own a channel, and never touch
//! the database — that separation is what lets the same loop drive both
//! shared-pool and exclusive-instance stages (§4.7, closing paragraph).

use crate::backend::{ExclusiveBackend, JobOutcome, SharedBackend, StageBackend};
use crate::queue::WorkQueue;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long a worker sleeps between checks of the pause flag while paused,
/// per §4.7 step 2 and the suspension-point list in §5.
pub const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Drives one worker's loop against a shared-pool backend. Multiple
/// instances of this function may run concurrently over the same `backend`
/// `Arc`, which is exactly what "shared" means for this stage.
pub async fn run_pool_worker<P: SharedBackend>(
    worker_id: usize,
    backend: Arc<P>,
    queue: Arc<WorkQueue>,
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
    outcomes: tokio::sync::mpsc::UnboundedSender<JobOutcome>,
) {
    loop {
        if !wait_while_paused(&paused, &cancel).await {
            break;
        }

        let job = match queue.recv_timeout(PAUSE_POLL_INTERVAL) {
            Ok(job) => job,
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                if queue.is_closed() && queue.is_empty() {
                    break;
                }
                continue;
            }
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
        };

        if cancel.is_cancelled() {
            log::debug!("pool worker {} cancelled, dropping in-flight job", worker_id);
            break;
        }

        let image_id = job.image_id;
        let outcome = match backend.produce(&job).await {
            Ok(payload) => JobOutcome::ok(image_id, payload),
            Err(e) => JobOutcome::failed(image_id, e),
        };

        if outcomes.send(outcome).is_err() {
            break;
        }
    }
    log::debug!("pool worker {} exiting", worker_id);
}

/// Drives one worker's loop against an exclusively-owned instance. The
/// instance is moved into this function and never shared.
pub async fn run_instance_worker<I: ExclusiveBackend>(
    worker_id: usize,
    mut backend: I,
    queue: Arc<WorkQueue>,
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
    outcomes: tokio::sync::mpsc::UnboundedSender<JobOutcome>,
) {
    loop {
        if !wait_while_paused(&paused, &cancel).await {
            break;
        }

        let job = match queue.recv_timeout(PAUSE_POLL_INTERVAL) {
            Ok(job) => job,
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                if queue.is_closed() && queue.is_empty() {
                    break;
                }
                continue;
            }
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
        };

        if cancel.is_cancelled() {
            log::debug!("instance worker {} cancelled, dropping in-flight job", worker_id);
            break;
        }

        let image_id = job.image_id;
        let outcome = match backend.produce(&job).await {
            Ok(payload) => JobOutcome::ok(image_id, payload),
            Err(e) => JobOutcome::failed(image_id, e),
        };

        if outcomes.send(outcome).is_err() {
            break;
        }
    }
    backend.shutdown().await;
    log::debug!("instance worker {} exiting", worker_id);
}

/// Returns `false` if cancellation arrived while waiting (caller should
/// exit the loop immediately); `true` once the worker is clear to proceed.
async fn wait_while_paused(paused: &AtomicBool, cancel: &CancellationToken) -> bool {
    while paused.load(Ordering::Acquire) {
        if cancel.is_cancelled() {
            return false;
        }
        tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
    }
    !cancel.is_cancelled()
}

/// Either flavor of worker handle, generic over the sealed pool/instance
/// variant, for call sites that dispatch without caring which kind they
/// hold.
pub fn spawn_worker<P, I>(
    worker_id: usize,
    backend: StageBackend<P, I>,
    queue: Arc<WorkQueue>,
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
    outcomes: tokio::sync::mpsc::UnboundedSender<JobOutcome>,
) -> tokio::task::JoinHandle<()>
where
    P: SharedBackend + 'static,
    I: ExclusiveBackend + 'static,
{
    match backend {
        StageBackend::Pool(p) => tokio::spawn(run_pool_worker(worker_id, p, queue, paused, cancel, outcomes)),
        StageBackend::Instance(i) => {
            tokio::spawn(run_instance_worker(worker_id, i, queue, paused, cancel, outcomes))
        }
    }
}
