//! GPU monitoring with last-good fallback

use crate::sampler::GpuSampler;

use modelhost_core::GpuSnapshot;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Wraps a sampler so a failed query never reaches the publishing loop
///
/// A failure is logged as recoverable and the previous snapshot is returned
/// (empty if no sample has ever succeeded).
pub struct GpuMonitor {
    inner: Arc<dyn GpuSampler>,
    last: RwLock<Vec<GpuSnapshot>>,
    consecutive_failures: AtomicU64,
}

impl GpuMonitor {
    /// Create a new GPU monitor
    pub fn new(inner: Arc<dyn GpuSampler>) -> Self {
        info!("Creating GPU monitor for sampler: {}", inner.name());
        Self {
            inner,
            last: RwLock::new(Vec::new()),
            consecutive_failures: AtomicU64::new(0),
        }
    }

    /// Sample all devices, falling back to the previous snapshot on error
    pub async fn sample(&self) -> Vec<GpuSnapshot> {
        match self.inner.sample().await {
            Ok(gpus) => {
                let failures = self.consecutive_failures.swap(0, Ordering::Relaxed);
                if failures > 0 {
                    info!(
                        "GPU sampler {} recovered after {} failures",
                        self.inner.name(),
                        failures
                    );
                }
                *self.last.write().await = gpus.clone();
                gpus
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                // Warn once per outage, then keep quiet
                if failures == 1 {
                    warn!("GPU sample via {} failed: {}", self.inner.name(), e);
                } else {
                    debug!(
                        "GPU sample via {} failed ({} in a row): {}",
                        self.inner.name(),
                        failures,
                        e
                    );
                }
                self.last.read().await.clone()
            }
        }
    }

    /// Most recent successful sample
    pub async fn last(&self) -> Vec<GpuSnapshot> {
        self.last.read().await.clone()
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn sampler_name(&self) -> &str {
        self.inner.name()
    }
}
