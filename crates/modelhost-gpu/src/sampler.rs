//! GPU sampler interface

use crate::Result;
use async_trait::async_trait;
use modelhost_core::GpuSnapshot;

/// Source of point-in-time GPU telemetry
///
/// Implementations are stateless poll-and-return; scheduling is the caller's
/// concern.
#[async_trait]
pub trait GpuSampler: Send + Sync {
    /// Sample every visible device, ordered by index
    async fn sample(&self) -> Result<Vec<GpuSnapshot>>;

    /// Short name used in logs
    fn name(&self) -> &str;
}
