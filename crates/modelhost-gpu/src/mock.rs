//! Mock GPU sampler for testing

use crate::sampler::GpuSampler;
use crate::{GpuError, Result};

use async_trait::async_trait;
use modelhost_core::GpuSnapshot;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// Synthetic devices with slowly varying utilization
///
/// Scripted failures can be queued with [`MockSampler::fail_next`] to exercise
/// fallback paths.
pub struct MockSampler {
    device_count: u32,
    ticks: AtomicU64,
    failures: Mutex<VecDeque<String>>,
}

impl MockSampler {
    pub fn new(device_count: u32) -> Self {
        Self {
            device_count,
            ticks: AtomicU64::new(0),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Make the next sample fail with a driver error
    pub fn fail_next(&self, message: impl Into<String>) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push_back(message.into());
        }
    }

    fn next_failure(&self) -> Option<String> {
        self.failures.lock().ok().and_then(|mut f| f.pop_front())
    }
}

#[async_trait]
impl GpuSampler for MockSampler {
    async fn sample(&self) -> Result<Vec<GpuSnapshot>> {
        if let Some(message) = self.next_failure() {
            return Err(GpuError::DriverError(message));
        }

        let tick = self.ticks.fetch_add(1, Ordering::Relaxed);
        let gpus: Vec<GpuSnapshot> = (0..self.device_count)
            .map(|i| {
                let phase = (tick + i as u64) % 10;
                GpuSnapshot {
                    index: i,
                    name: format!("Mock GPU {}", i),
                    memory_total_mb: 24 * 1024,
                    memory_used_mb: 2048 + (i as u64 * 512),
                    utilization_pct: 40.0 + (phase as f64 * 5.0),
                    temp_c: Some(55.0 + (i as f64 * 5.0)),
                    power_draw_w: Some(150.0 + (i as f64 * 25.0)),
                }
            })
            .collect();

        debug!("Produced {} mock GPU snapshots", gpus.len());
        Ok(gpus)
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_sampler() {
        let sampler = MockSampler::new(2);
        let gpus = sampler.sample().await.unwrap();
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[1].index, 1);
        assert!(gpus[0].memory_used_mb < gpus[0].memory_total_mb);

        sampler.fail_next("driver gone");
        assert!(sampler.sample().await.is_err());
        assert!(sampler.sample().await.is_ok());
    }
}
