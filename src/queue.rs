//! The per-stage work queue: a bounded MPMC channel of [`Job`].
//!
//! Grounds on the `crossbeam::channel` + idempotent-shutdown pattern every
//! `pool/capabilities/*.rs` worker uses, generalized from "one channel per
//! RPC kind" to one `Job` channel per stage.

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Default bounded capacity per §4.2.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// One unit of work: an image to run through a stage's backend.
#[derive(Debug, Clone)]
pub struct Job {
    pub image_id: u64,
    pub image_path: PathBuf,
    pub auxiliary_input: Option<String>,
}

/// End-of-stream / error signal delivered once the queue is closed.
#[derive(Debug, Clone)]
pub enum QueueClose {
    Drained,
    Error(String),
}

/// A bounded MPMC channel of [`Job`] with idempotent close semantics.
///
/// Producers suspend when the channel is full; consumers drain pending
/// items before observing end-of-stream. Ordering between producers is
/// unspecified; a single producer's items preserve FIFO order (guaranteed
/// by the underlying `crossbeam::channel`).
pub struct WorkQueue {
    sender: Sender<Job>,
    receiver: Receiver<Job>,
    closed: Arc<AtomicBool>,
    close_reason: parking_lot::Mutex<Option<String>>,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        Self {
            sender,
            receiver,
            closed: Arc::new(AtomicBool::new(false)),
            close_reason: parking_lot::Mutex::new(None),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }

    /// Push a job. Blocks if the channel is full. Returns `Err` if the
    /// queue has already been closed (producer raced a consumer-triggered
    /// shutdown).
    pub fn push(&self, job: Job) -> Result<(), Job> {
        if self.closed.load(Ordering::Acquire) {
            return Err(job);
        }
        self.sender.send(job).map_err(|e| e.into_inner())
    }

    /// Pull the next job, waiting up to `timeout` (used by workers to poll
    /// their pause flag / cancellation token at a bounded interval, per the
    /// 500ms suspension-point cadence in §5).
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Job, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<Job, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Signal no more items will be pushed. Idempotent: a second call is a
    /// no-op. Pending consumers drain the remaining items then observe
    /// disconnection.
    pub fn complete(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping our sender clone lets the channel disconnect once all
        // producer clones are gone; WorkQueue itself retains one `sender`
        // so callers can still observe `is_closed()`, but producers call
        // through `push` which now rejects new work.
        log::debug!("work queue closed (drained)");
    }

    /// Close the queue because the cursor paginator failed; recorded for
    /// the orchestrator to surface as a fatal stop.
    pub fn close_with_error(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.close_reason.lock() = Some(reason.clone());
        log::warn!("work queue closed with error: {}", reason);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close_error(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }
}
