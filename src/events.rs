//! Event surface emitted to callers (§6).
//!
//! Concretized as an `mpsc`-channel payload type — the distilled spec names
//! an event surface without naming a transport; every interface the teacher
//! exposes is channel-shaped, so this follows suit.

use crate::stage::Stage;

#[derive(Debug, Clone)]
pub enum Event {
    ProgressChanged {
        stage: Stage,
        current: u64,
        total: u64,
        remaining: u64,
        skipped: u64,
        eta_seconds: Option<f64>,
    },
    StatusChanged {
        stage: Stage,
        text: String,
        is_running: bool,
        is_paused: bool,
    },
    ServiceCompleted(Stage),
    AllServicesCompleted,
    QueueCountsChanged,
}
