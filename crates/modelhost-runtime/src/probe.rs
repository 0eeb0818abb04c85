//! Readiness probing of the engine's health endpoint

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of a readiness wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessOutcome {
    /// The health endpoint answered with a success status
    Ready,
    /// No successful answer before the deadline
    Timeout,
    /// The bound process is gone
    Crashed,
    /// The owning launch was cancelled
    Cancelled,
}

impl fmt::Display for ReadinessOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessOutcome::Ready => write!(f, "ready"),
            ReadinessOutcome::Timeout => write!(f, "timeout"),
            ReadinessOutcome::Crashed => write!(f, "crashed"),
            ReadinessOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What to probe and for how long
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeTarget {
    pub port: u16,
    pub health_path: String,
    pub timeout: Duration,
}

impl ProbeTarget {
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.port, self.health_path)
    }
}

/// Waits for an engine to become healthy
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Poll until ready, timed out, crashed (per `alive`) or cancelled
    async fn wait_ready(
        &self,
        target: &ProbeTarget,
        alive: &(dyn Fn() -> bool + Send + Sync),
        cancel: &CancellationToken,
    ) -> ReadinessOutcome;
}

/// Polls `GET http://127.0.0.1:{port}{health_path}` at a fixed interval
#[derive(Debug, Clone)]
pub struct HttpReadinessProber {
    client: Client,
    poll_interval: Duration,
    request_timeout: Duration,
}

impl HttpReadinessProber {
    pub fn new(poll_interval: Duration) -> crate::Result<Self> {
        let request_timeout = poll_interval.max(Duration::from_millis(250));
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| {
                crate::RuntimeError::Configuration(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            poll_interval,
            request_timeout,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Single health check
    pub async fn check_once(&self, url: &str, limit: Duration) -> bool {
        let request = self.client.get(url).timeout(limit.min(self.request_timeout));
        match request.send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                debug!("Health check {} returned {}", url, response.status());
                false
            }
            Err(e) => {
                debug!("Health check {} failed: {}", url, e);
                false
            }
        }
    }
}

#[async_trait]
impl ReadinessProbe for HttpReadinessProber {
    async fn wait_ready(
        &self,
        target: &ProbeTarget,
        alive: &(dyn Fn() -> bool + Send + Sync),
        cancel: &CancellationToken,
    ) -> ReadinessOutcome {
        let url = target.url();
        let deadline = Instant::now() + target.timeout;
        let mut attempts = 0u64;

        info!(
            "Waiting up to {:?} for engine health at {}",
            target.timeout, url
        );

        loop {
            if cancel.is_cancelled() {
                debug!("Readiness wait for {} cancelled", url);
                return ReadinessOutcome::Cancelled;
            }
            if !alive() {
                warn!("Engine died while waiting for {}", url);
                return ReadinessOutcome::Crashed;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("Engine not healthy after {} probes of {}", attempts, url);
                return ReadinessOutcome::Timeout;
            }

            attempts += 1;
            let healthy = tokio::select! {
                _ = cancel.cancelled() => return ReadinessOutcome::Cancelled,
                healthy = self.check_once(&url, remaining) => healthy,
            };
            if healthy {
                info!("Engine healthy at {} after {} probes", url, attempts);
                return ReadinessOutcome::Ready;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::select! {
                _ = cancel.cancelled() => return ReadinessOutcome::Cancelled,
                _ = tokio::time::sleep(self.poll_interval.min(remaining)) => {}
            }
        }
    }
}
