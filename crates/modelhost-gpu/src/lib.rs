//! # modelhost-gpu
//!
//! GPU telemetry sampling for the modelhost controller.
//!
//! This crate provides:
//! - The [`GpuSampler`] interface: one call returns a snapshot of every device
//! - An `nvidia-smi` backed sampler for NVIDIA hosts
//! - [`GpuMonitor`], which never fails a sample: on a driver error it logs and
//!   hands back the previous snapshot instead
//! - A mock sampler producing synthetic devices (feature `mock`)
//!
//! ## Example
//!
//! ```rust,no_run
//! use modelhost_gpu::{GpuMonitor, NvidiaSmiSampler};
//! use std::time::Duration;
//!
//! # async fn run() {
//! let sampler = NvidiaSmiSampler::new("nvidia-smi", Duration::from_secs(5));
//! let monitor = GpuMonitor::new(std::sync::Arc::new(sampler));
//! let gpus = monitor.sample().await;
//! println!("Found {} GPUs", gpus.len());
//! # }
//! ```

use thiserror::Error;

pub mod monitor;
pub mod nvidia_smi;
pub mod sampler;

// Mock implementation for testing and GPU-less hosts
#[cfg(any(feature = "mock", test))]
pub mod mock;

pub use monitor::GpuMonitor;
pub use nvidia_smi::NvidiaSmiSampler;
pub use sampler::GpuSampler;

#[cfg(any(feature = "mock", test))]
pub use mock::MockSampler;

pub type Result<T> = std::result::Result<T, GpuError>;

/// Why a telemetry sample could not be taken
#[derive(Error, Debug)]
pub enum GpuError {
    /// The sampler binary is missing or could not be started
    #[error("GPU telemetry unavailable: {0}")]
    Unavailable(String),

    /// The driver answered with an error
    #[error("Driver error: {0}")]
    DriverError(String),

    #[error("Sampler timed out: {0}")]
    Timeout(String),

    #[error("Failed to parse telemetry: {0}")]
    Parse(String),
}

impl From<GpuError> for modelhost_core::Error {
    fn from(err: GpuError) -> Self {
        modelhost_core::Error::gpu_telemetry(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = GpuError::Parse("bad row".to_string());
        assert_eq!(error.to_string(), "Failed to parse telemetry: bad row");

        let core: modelhost_core::Error = GpuError::Unavailable("no devices".to_string()).into();
        assert_eq!(core.category(), "gpu_telemetry");
        assert_eq!(core.to_http_status(), 502);
    }
}
