//! Crate-wide error types.
//!
//! Two error shapes coexist here, mirroring the split the teacher crate
//! keeps between its memory governor (a `thiserror`-derived enum) and its
//! pool layer (a hand-rolled `Display` enum): [`OrchestratorError`] is the
//! crate's top-level, propagated error; [`StageError`] is the smaller,
//! per-stage-operation error surfaced by workers and backends.

use std::fmt;

/// Top-level error propagated out of the global and per-stage orchestrators.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("store operation failed: {0}")]
    Store(String),

    #[error("backend initialization failed for stage {stage:?} on device {device}: {reason}")]
    BackendInit {
        stage: crate::stage::Stage,
        device: u32,
        reason: String,
    },

    #[error("cursor paginator failed: {0}")]
    Pagination(String),

    #[error("stage {0:?} is already running")]
    AlreadyRunning(crate::stage::Stage),

    #[error("no device configured")]
    NoDevices,
}

/// Error surfaced by a worker or backend while producing a single job's
/// result. Never used for admission/resource-exhaustion, which is not an
/// error but a deferred-stage event (see [`crate::events::Event`]).
#[derive(Debug, Clone)]
pub enum StageError {
    /// The image row or its backing file could not be found.
    MissingInput(String),
    /// The backend raised during inference.
    Backend(String),
    /// The worker was cancelled mid-job.
    Cancelled,
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingInput(msg) => write!(f, "missing input: {}", msg),
            Self::Backend(msg) => write!(f, "backend error: {}", msg),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for StageError {}
