//! Daemon configuration
//!
//! One YAML document with a section per subsystem. Every field has a default,
//! so an empty file is a valid configuration.

use crate::types::Backend;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for the modelhost daemon
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,

    /// Launch orchestration timing
    pub launch: LaunchConfig,

    /// GPU sampling configuration
    pub gpu: GpuConfig,

    /// Engine metrics scraping configuration
    pub metrics: MetricsConfig,

    /// Event bus and SSE configuration
    pub events: EventsConfig,

    /// Per-backend command templates
    pub backends: BackendsConfig,

    /// Recipe source
    pub recipes: RecipesConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Layer `MODELHOST__*` environment variables over a YAML file over the
    /// defaults. The file is `path` if given, else `$MODELHOST_CONFIG`, else
    /// the first of `./modelhost.yaml` and `/etc/modelhost/config.yaml` found.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // Start with defaults
        builder = builder.add_source(config::Config::try_from(&Self::default())?);

        // An explicitly named file must exist; the fallbacks are optional
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()));
        } else if let Ok(config_path) = std::env::var("MODELHOST_CONFIG") {
            builder = builder.add_source(config::File::with_name(&config_path).required(false));
        } else {
            for path in &["./modelhost.yaml", "/etc/modelhost/config.yaml"] {
                builder = builder.add_source(config::File::with_name(path).required(false));
            }
        }

        // MODELHOST__LAUNCH__READINESS_TIMEOUT_SECONDS=120
        builder = builder.add_source(
            config::Environment::with_prefix("MODELHOST")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let parsed: Self = config.try_deserialize()?;

        parsed.validate()?;

        Ok(parsed)
    }

    /// Load configuration from a specific file, ignoring the environment
    pub fn load_from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from(path));

        let config = builder.build()?;
        let parsed: Self = config.try_deserialize()?;
        parsed.validate()?;

        Ok(parsed)
    }

    /// Reject values that would stall a loop or disable a buffer
    pub fn validate(&self) -> Result<()> {
        self.launch.validate()?;
        self.gpu.validate()?;
        self.metrics.validate()?;
        self.events.validate()?;
        self.backends.validate()?;

        Ok(())
    }

    /// Render as YAML, used by `modelhostd config`
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the API and SSE gateway listen on
    pub bind_addr: SocketAddr,

    /// Stop the supervised engine when the daemon shuts down
    pub evict_on_shutdown: bool,

    /// Allow cross-origin requests (web dashboard served elsewhere)
    pub cors_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            evict_on_shutdown: true,
            cors_enabled: true,
        }
    }
}

/// Launch orchestration timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Upper bound on the `waiting` stage
    pub readiness_timeout_seconds: u64,

    /// Interval between health probes
    pub readiness_poll_interval_ms: u64,

    /// Time between SIGTERM and SIGKILL when stopping the engine
    pub stop_grace_seconds: u64,

    /// How long a terminal session stays visible before it is cleared
    pub terminal_grace_seconds: u64,

    /// A process that exits within this window counts as a failed spawn
    pub spawn_check_ms: u64,

    /// Default bound for `GET /wait-ready`
    pub wait_ready_default_seconds: u64,
}

impl LaunchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.readiness_timeout_seconds == 0 {
            return Err(Error::config("launch.readiness_timeout_seconds must be > 0"));
        }
        if self.readiness_poll_interval_ms == 0 {
            return Err(Error::config("launch.readiness_poll_interval_ms must be > 0"));
        }
        if self.stop_grace_seconds == 0 {
            return Err(Error::config("launch.stop_grace_seconds must be > 0"));
        }
        if self.wait_ready_default_seconds == 0 {
            return Err(Error::config("launch.wait_ready_default_seconds must be > 0"));
        }
        Ok(())
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_seconds)
    }

    pub fn readiness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_seconds)
    }

    pub fn terminal_grace(&self) -> Duration {
        Duration::from_secs(self.terminal_grace_seconds)
    }

    pub fn spawn_check(&self) -> Duration {
        Duration::from_millis(self.spawn_check_ms)
    }

    pub fn wait_ready_default(&self) -> Duration {
        Duration::from_secs(self.wait_ready_default_seconds)
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            readiness_timeout_seconds: 600,
            readiness_poll_interval_ms: 500,
            stop_grace_seconds: 10,
            terminal_grace_seconds: 5,
            spawn_check_ms: 300,
            wait_ready_default_seconds: 30,
        }
    }
}

/// GPU sampling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    /// Disable to run on hosts without a GPU driver
    pub enabled: bool,

    /// Sampling interval in milliseconds
    pub sample_interval_ms: u64,

    /// nvidia-smi executable
    pub nvidia_smi_path: String,

    /// Bound on a single nvidia-smi invocation
    pub query_timeout_seconds: u64,

    /// Use synthetic devices instead of querying the driver
    pub mock: bool,
}

impl GpuConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sample_interval_ms == 0 {
            return Err(Error::config("gpu.sample_interval_ms must be > 0"));
        }
        if self.query_timeout_seconds == 0 {
            return Err(Error::config("gpu.query_timeout_seconds must be > 0"));
        }
        if !self.mock && self.nvidia_smi_path.trim().is_empty() {
            return Err(Error::config("gpu.nvidia_smi_path cannot be empty"));
        }
        Ok(())
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_seconds)
    }
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval_ms: 1000,
            nvidia_smi_path: "nvidia-smi".to_string(),
            query_timeout_seconds: 5,
            mock: false,
        }
    }
}

/// Engine metrics scraping configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,

    /// Scrape interval in milliseconds
    pub scrape_interval_ms: u64,

    /// Bound on a single scrape request
    pub scrape_timeout_ms: u64,
}

impl MetricsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.scrape_interval_ms == 0 {
            return Err(Error::config("metrics.scrape_interval_ms must be > 0"));
        }
        if self.scrape_timeout_ms == 0 {
            return Err(Error::config("metrics.scrape_timeout_ms must be > 0"));
        }
        Ok(())
    }

    pub fn scrape_interval(&self) -> Duration {
        Duration::from_millis(self.scrape_interval_ms)
    }

    pub fn scrape_timeout(&self) -> Duration {
        Duration::from_millis(self.scrape_timeout_ms)
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scrape_interval_ms: 1000,
            scrape_timeout_ms: 2000,
        }
    }
}

/// Event bus and SSE configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Events buffered per subscriber before the oldest are dropped
    pub subscriber_buffer: usize,

    /// SSE keep-alive interval in seconds
    pub keep_alive_seconds: u64,
}

impl EventsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.subscriber_buffer == 0 {
            return Err(Error::config("events.subscriber_buffer must be > 0"));
        }
        if self.keep_alive_seconds == 0 {
            return Err(Error::config("events.keep_alive_seconds must be > 0"));
        }
        Ok(())
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_seconds)
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
            keep_alive_seconds: 15,
        }
    }
}

/// How to start one engine backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Executable followed by any leading arguments
    pub command: Vec<String>,

    /// Port used when a recipe does not set one
    pub default_port: u16,

    /// Path polled by the readiness prober
    pub health_path: String,
}

impl BackendConfig {
    pub fn validate(&self, name: &str) -> Result<()> {
        match self.command.first() {
            Some(program) if !program.trim().is_empty() => {}
            _ => {
                return Err(Error::config(format!(
                    "backends.{}.command cannot be empty",
                    name
                )))
            }
        }
        if self.default_port == 0 {
            return Err(Error::config(format!(
                "backends.{}.default_port must be > 0",
                name
            )));
        }
        if !self.health_path.starts_with('/') {
            return Err(Error::config(format!(
                "backends.{}.health_path must start with '/'",
                name
            )));
        }
        Ok(())
    }
}

/// Per-backend command templates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    pub vllm: BackendConfig,
    pub sglang: BackendConfig,
}

impl BackendsConfig {
    pub fn get(&self, backend: Backend) -> &BackendConfig {
        match backend {
            Backend::Vllm => &self.vllm,
            Backend::Sglang => &self.sglang,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.vllm.validate("vllm")?;
        self.sglang.validate("sglang")
    }
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            vllm: BackendConfig {
                command: vec!["vllm".to_string()],
                default_port: Backend::Vllm.default_port(),
                health_path: "/health".to_string(),
            },
            sglang: BackendConfig {
                command: vec![
                    "python".to_string(),
                    "-m".to_string(),
                    "sglang.launch_server".to_string(),
                ],
                default_port: Backend::Sglang.default_port(),
                health_path: "/health".to_string(),
            },
        }
    }
}

/// Recipe source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecipesConfig {
    /// YAML file holding a list of recipes; no recipes are available when unset
    pub path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive; `RUST_LOG` wins when set
    pub level: String,

    /// `text`, or `json` for one object per line
    pub format: String,

    /// Include the log target (module path)
    pub show_target: bool,

    pub show_thread_ids: bool,

    pub show_line_numbers: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            show_target: false,
            show_thread_ids: false,
            show_line_numbers: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.bind_addr.port(), 8080);
        assert_eq!(config.launch.readiness_timeout(), Duration::from_secs(600));
        assert_eq!(config.launch.readiness_poll_interval(), Duration::from_millis(500));
        assert_eq!(config.events.subscriber_buffer, 256);
        assert!(config.server.evict_on_shutdown);
    }

    #[test]
    fn test_zero_values_rejected() {
        let mut config = Config::default();


        config.launch.readiness_poll_interval_ms = 0;
        assert!(config.validate().is_err());
        config.launch = LaunchConfig::default();

        config.events.subscriber_buffer = 0;
        assert!(config.validate().is_err());
        config.events = EventsConfig::default();

        config.backends.vllm.command.clear();
        assert!(config.validate().is_err());
        config.backends = BackendsConfig::default();

        config.backends.sglang.health_path = "health".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backend_lookup() {
        let backends = BackendsConfig::default();
        assert_eq!(backends.get(Backend::Vllm).default_port, 8000);
        assert_eq!(backends.get(Backend::Sglang).default_port, 30000);
        assert_eq!(backends.get(Backend::Sglang).command[0], "python");
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            "server:\n  bind_addr: 0.0.0.0:9000\nlaunch:\n  readiness_timeout_seconds: 30\n"
        )
        .unwrap();

        let config = Config::load_from_file(file.path()).unwrap();
        assert_eq!(config.server.bind_addr.port(), 9000);
        assert_eq!(config.launch.readiness_timeout_seconds, 30);
        // Untouched sections keep their defaults
        assert_eq!(config.launch.readiness_poll_interval_ms, 500);
        assert_eq!(config.gpu.sample_interval_ms, 1000);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(file, "gpu:\n  sample_interval_ms: 0\n").unwrap();
        assert!(Config::load_from_file(file.path()).is_err());
    }

    #[test]
    fn test_yaml_and_json_forms() {
        let config = Config::default();

        let yaml = config.to_yaml().unwrap();
        let deserialized: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config, deserialized);

        let json = serde_json::to_string(&config).unwrap();
        let deserialized: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(config.launch, deserialized.launch);
    }
}
