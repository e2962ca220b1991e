//! Progress counters and cumulative-average ETA, per §4.4.
//!
//! Grounds on `pool/core/types.rs::PoolMetrics` (plain `AtomicUsize`
//! counters read/written independently, no single lock) and the
//! ping/pong-channel idiom `pool/capabilities/*.rs` uses for cross-thread
//! signalling, generalized here to a progress-event channel.

use crate::events::Event;
use crate::stage::Stage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;

/// Emit always for the first 5 completions, then every 10th — an
/// intentional UX compromise between responsiveness and event-sink
/// contention (Design Notes §9).
const ALWAYS_EMIT_THRESHOLD: u64 = 5;
const EMIT_EVERY_NTH: u64 = 10;

pub struct Eta {
    pub current: u64,
    pub total: u64,
    pub remaining: u64,
    pub skipped: u64,
    pub eta_seconds: Option<f64>,
    pub rate_per_second: Option<f64>,
}

/// Atomic counters for one stage's run, plus throttled event emission.
pub struct ProgressTracker {
    stage: Stage,
    started_at: Instant,
    total: AtomicU64,
    progress: AtomicU64,
    skipped: AtomicU64,
    queue_remaining: AtomicU64,
    events: Option<UnboundedSender<Event>>,
}

impl ProgressTracker {
    pub fn new(stage: Stage, total: u64, events: Option<UnboundedSender<Event>>) -> Self {
        Self {
            stage,
            started_at: Instant::now(),
            total: AtomicU64::new(total),
            progress: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            queue_remaining: AtomicU64::new(total),
            events,
        }
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Acquire)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Acquire)
    }

    pub fn queue_remaining(&self) -> u64 {
        self.queue_remaining.load(Ordering::Acquire)
    }

    /// A job was skipped during queue population (missing file/row); does
    /// not count as progress, but does decrement the outstanding total.
    pub fn record_skip(&self) {
        self.skipped.fetch_add(1, Ordering::AcqRel);
        self.decrement_remaining();
    }

    /// A job completed (successfully or not — both count as progress per
    /// §4.9's forward-progress trade-off, except embedding's unprocessed
    /// failure path, which calls neither this nor `record_skip`).
    pub fn record_completion(&self) {
        let progress = self.progress.fetch_add(1, Ordering::AcqRel) + 1;
        self.decrement_remaining();

        if progress <= ALWAYS_EMIT_THRESHOLD || progress % EMIT_EVERY_NTH == 0 {
            self.emit_progress(progress);
        }
    }

    fn decrement_remaining(&self) {
        self.queue_remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| Some(r.saturating_sub(1)))
            .ok();
    }

    fn emit_progress(&self, current: u64) {
        let Some(tx) = &self.events else { return };
        let eta = self.eta();
        let _ = tx.send(Event::ProgressChanged {
            stage: self.stage,
            current,
            total: eta.total,
            remaining: eta.remaining,
            skipped: eta.skipped,
            eta_seconds: eta.eta_seconds,
        });
    }

    /// Cumulative-average ETA per §4.4: once `progress >= 5` and
    /// `remaining > 0`, `avg = elapsed / progress`, `eta = avg * remaining`,
    /// `rate = progress / elapsed`. No smoothing beyond the cumulative
    /// average — intentional, per-stage throughput is near-stationary.
    pub fn eta(&self) -> Eta {
        let progress = self.progress();
        let remaining = self.queue_remaining();
        let elapsed = self.started_at.elapsed().as_secs_f64();

        let (eta_seconds, rate_per_second) = if progress >= ALWAYS_EMIT_THRESHOLD && remaining > 0 && elapsed > 0.0 {
            let avg = elapsed / progress as f64;
            (Some(avg * remaining as f64), Some(progress as f64 / elapsed))
        } else {
            (None, None)
        };

        Eta {
            current: progress,
            total: self.total(),
            remaining,
            skipped: self.skipped(),
            eta_seconds,
            rate_per_second,
        }
    }
}
