//! Error type shared by every modelhost crate
//!
//! Launch failures are not errors at this level: spawn failures, readiness
//! timeouts and crashes end a launch session in the `error` stage and are
//! reported on the event bus. `Error` covers what a caller must handle
//! directly, and knows how it should look over HTTP.

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("{0} not found")]
    NotFound(String),

    /// The engine slot is taken
    #[error("already running: {0}")]
    AlreadyExists(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("bad request: {0}")]
    InvalidRequest(String),

    #[error("internal: {0}")]
    Internal(String),

    /// Starting, stopping or talking to the engine process failed
    #[error("engine control failed: {0}")]
    RuntimeControl(String),

    #[error("gpu telemetry failed: {0}")]
    GpuTelemetry(String),

    /// A recipe is malformed or the recipe store is unreadable
    #[error("recipe: {0}")]
    Recipe(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("config source: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn runtime_control(msg: impl Into<String>) -> Self {
        Self::RuntimeControl(msg.into())
    }

    pub fn gpu_telemetry(msg: impl Into<String>) -> Self {
        Self::GpuTelemetry(msg.into())
    }

    pub fn recipe(msg: impl Into<String>) -> Self {
        Self::Recipe(msg.into())
    }

    /// Stable name sent to API clients next to the message
    pub fn category(&self) -> &'static str {
        match self {
            Error::InvalidConfiguration(_) | Error::Config(_) => "configuration",
            Error::NotFound(_) => "not_found",
            Error::AlreadyExists(_) => "already_exists",
            Error::Timeout(_) => "timeout",
            Error::InvalidRequest(_) => "invalid_request",
            Error::RuntimeControl(_) => "runtime_control",
            Error::GpuTelemetry(_) => "gpu_telemetry",
            Error::Recipe(_) => "recipe",
            Error::Io(_) => "io",
            Error::Json(_) | Error::Yaml(_) => "serialization",
            Error::Internal(_) | Error::Other(_) => "internal",
        }
    }

    pub fn to_http_status(&self) -> u16 {
        match self {
            Error::InvalidRequest(_) | Error::Recipe(_) => 400,
            Error::NotFound(_) => 404,
            Error::AlreadyExists(_) => 409,
            Error::RuntimeControl(_) | Error::GpuTelemetry(_) => 502,
            Error::Timeout(_) => 504,
            _ => 500,
        }
    }
}
