//! # modelhost-core
//!
//! Shared vocabulary of modelhost, a single-host controller that swaps
//! GPU-resident inference engines on demand:
//!
//! - The process, GPU, metrics and launch-session data model
//! - The event envelope published on the controller's event bus
//! - Recipe definitions and the `RecipeStore` interface
//! - Configuration schema and layered loading
//! - The `Error` type every crate converts into

pub mod config;
pub mod error;
pub mod event;
pub mod recipe;
pub mod traits;
pub mod types;

pub use config::{
    BackendConfig, BackendsConfig, Config, EventsConfig, GpuConfig, LaunchConfig, LoggingConfig,
    MetricsConfig, RecipesConfig, ServerConfig,
};
pub use error::{Error, Result};
pub use event::{Event, EventCategory, EventPayload};
pub use recipe::{InMemoryRecipeStore, Recipe, YamlRecipeStore};
pub use traits::RecipeStore;
pub use types::{
    Backend, GpuSnapshot, LaunchSession, LaunchStage, LifetimeMetrics, LogLine, LogStream,
    MetricsSnapshot, PeakMetrics, ProcessInfo, RecipeId, SessionId, StatusSnapshot,
};
