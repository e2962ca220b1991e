//! Demo binary wiring a mock store and mock backends through the scheduler.
//!
//! Grounds on the teacher's `src/main.rs`: `env_logger` init, `#[tokio::main]`,
//! `CliArgs::from_env()` / `CliRunner::new(...)` / `runner.run().await`.

use gpu_pipeline_scheduler::cli::{CliArgs, CliRunner};
use log::error;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = CliArgs::from_env();

    let mut runner = match CliRunner::new(args) {
        Ok(r) => r,
        Err(e) => {
            error!("failed to initialize scheduler: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runner.run().await {
        error!("scheduler run failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
