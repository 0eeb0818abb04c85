//! # modelhost-runtime
//!
//! Control of the single GPU inference engine process (vLLM or SGLang).
//!
//! This crate provides:
//! - Building engine command lines from recipes ([`LaunchSpec`])
//! - The process supervisor that owns at most one engine process
//! - Readiness probing of the engine's health endpoint
//! - Scraping and aggregation of the engine's Prometheus metrics
//!
//! The engine itself is opaque: it is started as a subprocess and observed
//! only through its exit status, its output and its HTTP endpoints.
//!
//! ## Example
//!
//! ```rust,no_run
//! use modelhost_core::{Backend, BackendsConfig, Recipe};
//! use modelhost_runtime::{EngineSupervisor, LaunchSpec, ProcessSupervisor, SupervisorConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let recipe = Recipe::new("llama-8b", "/models/llama-3.1-8b", Backend::Vllm);
//! let spec = LaunchSpec::from_recipe(&recipe, BackendsConfig::default().get(recipe.backend));
//!
//! let supervisor = ProcessSupervisor::new(SupervisorConfig::default());
//! let process = supervisor.start(&spec).await?;
//! println!("engine pid {}", process.pid);
//! supervisor.stop().await?;
//! # Ok(())
//! # }
//! ```

use thiserror::Error;

pub mod backend;
pub mod metrics;
pub mod probe;
pub mod supervisor;

// Re-export main types
pub use backend::LaunchSpec;
pub use metrics::{parse_prometheus, EngineCounters, MetricsAggregator, MetricsScraper, MetricsTracker};
pub use probe::{HttpReadinessProber, ProbeTarget, ReadinessOutcome, ReadinessProbe};
pub use supervisor::{
    EngineSupervisor, ProcessExit, ProcessSupervisor, SupervisorConfig, SupervisorEvent,
};

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Failures of engine control
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The engine process could not be started, or died during startup
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),

    /// The engine started but never became healthy
    #[error("Readiness timeout: {0}")]
    ReadinessTimeout(String),

    /// The engine exited unexpectedly
    #[error("Process crashed: {0}")]
    ProcessCrashed(String),

    /// A process is already supervised
    #[error("Engine already running with pid {0}")]
    AlreadyRunning(u32),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl From<RuntimeError> for modelhost_core::Error {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::AlreadyRunning(pid) => {
                modelhost_core::Error::already_exists(format!("engine process {}", pid))
            }
            RuntimeError::Configuration(msg) => modelhost_core::Error::config(msg),
            RuntimeError::Timeout(msg) | RuntimeError::ReadinessTimeout(msg) => {
                modelhost_core::Error::timeout(msg)
            }
            other => modelhost_core::Error::runtime_control(other.to_string()),
        }
    }
}
