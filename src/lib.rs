//! Dynamic multi-stage GPU resource orchestrator and worker-pool scheduler.
//!
//! See [`global_orchestrator::GlobalOrchestrator`] for the admission
//! algorithm and [`stage_orchestrator::StageOrchestrator`] for the
//! per-stage worker-pool state machine. Actual model inference, the real
//! persistence engine, and configuration loading are out of scope — this
//! crate consumes them behind the [`backend`] and [`store`] traits.

pub mod backend;
pub mod cli;
pub mod config;
pub mod device;
pub mod embedding_stage;
pub mod error;
pub mod events;
pub mod fanout;
pub mod global_orchestrator;
pub mod mock;
pub mod pagination;
pub mod progress;
pub mod queue;
pub mod stage;
pub mod stage_orchestrator;
pub mod store;
pub mod worker;

/// Installs a process-wide default for the crate's logging expectations —
/// callers that embed this scheduler rather than running the demo binary
/// are expected to have already configured `log`'s global logger
/// themselves; this is a convenience for callers that haven't.
pub fn init_scheduler() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .try_init();
}
