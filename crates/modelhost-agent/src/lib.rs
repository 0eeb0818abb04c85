//! # modelhost-agent
//!
//! The modelhost controller daemon (`modelhostd`).
//!
//! This crate wires the engine supervisor, readiness prober and GPU sampler
//! into a launch orchestrator, publishes everything that changes on an
//! in-process event bus and serves it over HTTP and Server-Sent Events.

pub mod agent;
pub mod api;
pub mod bus;
pub mod orchestrator;
pub mod snapshot;
pub mod sse;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;

pub use agent::{Agent, AgentBuilder};
pub use api::{router, ApiError, ApiState};
pub use bus::{BusStats, EventBus, Subscription};
pub use orchestrator::{LaunchOrchestrator, OrchestratorSettings};
pub use snapshot::SnapshotStore;

use modelhost_core::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Failures that stop the daemon from starting or keep it from running
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("invalid daemon setup: {0}")]
    Setup(String),

    #[error(transparent)]
    Core(#[from] modelhost_core::Error),

    #[error("engine control: {0}")]
    Runtime(#[from] modelhost_runtime::RuntimeError),

    #[error("gpu telemetry: {0}")]
    Gpu(#[from] modelhost_gpu::GpuError),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// Install the global tracing subscriber described by `logging`
///
/// A `RUST_LOG` directive wins over `logging.level`. Fails if a subscriber
/// is already installed.
pub fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(logging.show_target)
        .with_thread_ids(logging.show_thread_ids)
        .with_line_number(logging.show_line_numbers);

    let installed = if logging.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| AgentError::Setup(format!("tracing subscriber: {}", e)))
}
