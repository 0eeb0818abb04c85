//! Core type definitions for modelhost

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a recipe (a named model-serving configuration)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipeId(String);

impl RecipeId {
    /// Create a new RecipeId from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the string representation of the RecipeId
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RecipeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for RecipeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Unique identifier of one launch session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a random SessionId
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the string representation of the SessionId
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Model-serving engines that can be supervised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// vLLM OpenAI-compatible server
    Vllm,
    /// SGLang runtime server
    Sglang,
}

impl Backend {
    /// Port the engine listens on when the recipe does not pin one
    pub fn default_port(&self) -> u16 {
        match self {
            Backend::Vllm => 8000,
            Backend::Sglang => 30000,
        }
    }

    /// Prefix used by the engine for its Prometheus metric names
    pub fn metrics_prefix(&self) -> &'static str {
        match self {
            Backend::Vllm => "vllm:",
            Backend::Sglang => "sglang:",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Vllm => "vllm",
            Backend::Sglang => "sglang",
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vllm" => Ok(Backend::Vllm),
            "sglang" => Ok(Backend::Sglang),
            _ => Err(format!("Unknown backend: {}", s)),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The one engine process currently owned by the supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub backend: Backend,
    pub model_path: String,
    pub port: u16,
    pub served_model_name: String,
    /// Recipe the process was launched from, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe_id: Option<RecipeId>,
    pub started_at: DateTime<Utc>,
}

/// Point-in-time telemetry for one GPU device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuSnapshot {
    pub index: u32,
    pub name: String,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub utilization_pct: f64,
    /// Not every driver reports temperature
    pub temp_c: Option<f64>,
    pub power_draw_w: Option<f64>,
}

impl GpuSnapshot {
    /// Memory utilization as a percentage (0-100)
    pub fn memory_used_pct(&self) -> f64 {
        if self.memory_total_mb == 0 {
            0.0
        } else {
            (self.memory_used_mb as f64 / self.memory_total_mb as f64) * 100.0
        }
    }
}

/// Engine-reported throughput and latency figures for one scrape window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Requests currently being decoded
    pub running_requests: u32,

    /// Requests queued and waiting for a slot
    pub pending_requests: u32,

    pub prompt_tokens_per_sec: f64,

    pub generation_tokens_per_sec: f64,

    /// KV-cache occupancy as a percentage (0-100)
    pub kv_cache_usage_pct: Option<f64>,

    /// Mean time-to-first-token over the scrape window, in milliseconds
    pub ttft_ms: Option<f64>,

    /// Cumulative engine counters as last reported
    pub prompt_tokens_total: u64,
    pub generation_tokens_total: u64,

    pub timestamp: Option<DateTime<Utc>>,
}

/// Best values observed since the controller started
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeakMetrics {
    pub generation_tokens_per_sec: f64,
    pub prompt_tokens_per_sec: f64,
    pub running_requests: u32,
    pub min_ttft_ms: Option<f64>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Totals accumulated across every engine process the controller supervised
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifetimeMetrics {
    pub prompt_tokens: u64,
    pub generation_tokens: u64,
    pub launches: u64,
    /// Seconds some engine process has been running
    pub uptime_secs: u64,
    pub since: DateTime<Utc>,
}

impl Default for LifetimeMetrics {
    fn default() -> Self {
        Self {
            prompt_tokens: 0,
            generation_tokens: 0,
            launches: 0,
            uptime_secs: 0,
            since: Utc::now(),
        }
    }
}

/// Stage of a launch session
///
/// Non-terminal stages are always visited in declaration order; a session
/// ends in exactly one of `Ready`, `Cancelled` or `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchStage {
    Preempting,
    Evicting,
    Launching,
    Waiting,
    Ready,
    Cancelled,
    Error,
}

impl LaunchStage {
    /// Whether the session can no longer advance
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LaunchStage::Ready | LaunchStage::Cancelled | LaunchStage::Error
        )
    }

    /// Rough completion fraction reported to observers
    pub fn progress(&self) -> Option<f32> {
        match self {
            LaunchStage::Preempting => Some(0.05),
            LaunchStage::Evicting => Some(0.15),
            LaunchStage::Launching => Some(0.3),
            LaunchStage::Waiting => Some(0.5),
            LaunchStage::Ready => Some(1.0),
            LaunchStage::Cancelled | LaunchStage::Error => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchStage::Preempting => "preempting",
            LaunchStage::Evicting => "evicting",
            LaunchStage::Launching => "launching",
            LaunchStage::Waiting => "waiting",
            LaunchStage::Ready => "ready",
            LaunchStage::Cancelled => "cancelled",
            LaunchStage::Error => "error",
        }
    }
}

impl fmt::Display for LaunchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The orchestrator's working record for one launch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchSession {
    pub id: SessionId,
    pub recipe_id: RecipeId,
    pub stage: LaunchStage,
    pub message: String,
    pub progress: Option<f32>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LaunchSession {
    /// Start a new session in the `preempting` stage
    pub fn new(recipe_id: RecipeId) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::generate(),
            recipe_id,
            stage: LaunchStage::Preempting,
            message: "Preempting in-flight launches".to_string(),
            progress: LaunchStage::Preempting.progress(),
            started_at: now,
            updated_at: now,
        }
    }

    /// Move to `stage`, replacing the message
    pub fn advance(&mut self, stage: LaunchStage, message: impl Into<String>) {
        self.stage = stage;
        self.message = message.into();
        self.progress = stage.progress().or(self.progress);
        self.updated_at = Utc::now();
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

/// Process status as reported by `GET /status` and the `status` event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub process: Option<ProcessInfo>,
    pub inference_port: Option<u16>,
}

impl StatusSnapshot {
    pub fn from_process(process: Option<ProcessInfo>) -> Self {
        Self {
            running: process.is_some(),
            inference_port: process.as_ref().map(|p| p.port),
            process,
        }
    }
}

/// Which pipe an engine log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One line of engine output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub pid: u32,
    pub stream: LogStream,
    pub line: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recipe_id() {
        let id = RecipeId::new("llama-8b");
        assert_eq!(id.as_str(), "llama-8b");
        assert_eq!(id.to_string(), "llama-8b");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"llama-8b\"");
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!("vllm".parse::<Backend>().unwrap(), Backend::Vllm);
        assert_eq!("SGLang".parse::<Backend>().unwrap(), Backend::Sglang);
        assert!("tgi".parse::<Backend>().is_err());
        assert_eq!(Backend::Vllm.default_port(), 8000);
        assert_eq!(Backend::Sglang.default_port(), 30000);
    }

    #[test]
    fn test_stage_ordering() {
        assert!(LaunchStage::Preempting < LaunchStage::Evicting);
        assert!(LaunchStage::Evicting < LaunchStage::Launching);
        assert!(LaunchStage::Launching < LaunchStage::Waiting);
        assert!(!LaunchStage::Waiting.is_terminal());
        assert!(LaunchStage::Ready.is_terminal());
        assert!(LaunchStage::Cancelled.is_terminal());
        assert!(LaunchStage::Error.is_terminal());
        assert_eq!(
            serde_json::to_string(&LaunchStage::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }

    #[test]
    fn test_session_advance() {
        let mut session = LaunchSession::new(RecipeId::new("a"));
        assert_eq!(session.stage, LaunchStage::Preempting);

        session.advance(LaunchStage::Waiting, "Waiting for engine");
        assert_eq!(session.stage, LaunchStage::Waiting);
        assert_eq!(session.progress, Some(0.5));

        // Terminal failure keeps the last known progress
        session.advance(LaunchStage::Error, "boom");
        assert_eq!(session.progress, Some(0.5));
        assert!(session.is_terminal());
    }

    #[test]
    fn test_status_from_process() {
        assert_eq!(StatusSnapshot::from_process(None), StatusSnapshot::default());

        let status = StatusSnapshot::from_process(Some(ProcessInfo {
            pid: 42,
            backend: Backend::Vllm,
            model_path: "/models/a".to_string(),
            port: 8001,
            served_model_name: "a".to_string(),
            recipe_id: None,
            started_at: Utc::now(),
        }));
        assert!(status.running);
        assert_eq!(status.inference_port, Some(8001));
    }

    #[test]
    fn test_gpu_memory_pct() {
        let gpu = GpuSnapshot {
            index: 0,
            name: "Test GPU".to_string(),
            memory_used_mb: 2048,
            memory_total_mb: 8192,
            utilization_pct: 10.0,
            temp_c: None,
            power_draw_w: None,
        };
        assert_eq!(gpu.memory_used_pct(), 25.0);
    }
}
