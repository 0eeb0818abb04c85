//! NVIDIA telemetry via `nvidia-smi`

use crate::sampler::GpuSampler;
use crate::{GpuError, Result};

use async_trait::async_trait;
use modelhost_core::GpuSnapshot;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const QUERY_FIELDS: &str =
    "index,name,memory.used,memory.total,utilization.gpu,temperature.gpu,power.draw";

/// Samples devices by shelling out to `nvidia-smi --query-gpu`
#[derive(Debug, Clone)]
pub struct NvidiaSmiSampler {
    program: String,
    timeout: Duration,
}

impl NvidiaSmiSampler {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    async fn query(&self) -> Result<String> {
        let mut command = Command::new(&self.program);
        command
            .arg(format!("--query-gpu={}", QUERY_FIELDS))
            .arg("--format=csv,noheader,nounits")
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                GpuError::Timeout(format!("{} did not answer within {:?}", self.program, self.timeout))
            })?
            .map_err(|e| GpuError::Unavailable(format!("failed to run {}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(GpuError::DriverError(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl GpuSampler for NvidiaSmiSampler {
    async fn sample(&self) -> Result<Vec<GpuSnapshot>> {
        let stdout = self.query().await?;
        let gpus = parse_query_output(&stdout)?;
        debug!("Sampled {} GPUs via {}", gpus.len(), self.program);
        Ok(gpus)
    }

    fn name(&self) -> &str {
        "nvidia-smi"
    }
}

/// Parse `--format=csv,noheader,nounits` output, one device per line
pub fn parse_query_output(output: &str) -> Result<Vec<GpuSnapshot>> {
    let mut gpus = output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_row)
        .collect::<Result<Vec<_>>>()?;
    gpus.sort_by_key(|gpu| gpu.index);
    Ok(gpus)
}

fn parse_row(line: &str) -> Result<GpuSnapshot> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != 7 {
        return Err(GpuError::Parse(format!(
            "expected 7 fields, got {}: {:?}",
            fields.len(),
            line
        )));
    }

    let required = |idx: usize, what: &str| -> Result<f64> {
        optional(fields[idx]).ok_or_else(|| {
            GpuError::Parse(format!("missing {} in row {:?}", what, line))
        })
    };

    Ok(GpuSnapshot {
        index: required(0, "index")? as u32,
        name: fields[1].to_string(),
        memory_used_mb: required(2, "memory.used")? as u64,
        memory_total_mb: required(3, "memory.total")? as u64,
        // Utilization is unsupported on some virtualized devices
        utilization_pct: optional(fields[4]).unwrap_or(0.0),
        temp_c: optional(fields[5]),
        power_draw_w: optional(fields[6]),
    })
}

/// `[N/A]`, `[Not Supported]` and friends read as absent
fn optional(field: &str) -> Option<f64> {
    if field.starts_with('[') || field.eq_ignore_ascii_case("n/a") {
        return None;
    }
    field.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_two_devices() {
        let output = "1, NVIDIA RTX A6000, 1024, 49140, 3, 41, 27.50\n\
                      0, NVIDIA GeForce RTX 4090, 20480, 24564, 97, 71, 412.33\n";
        let gpus = parse_query_output(output).unwrap();

        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].index, 0);
        assert_eq!(gpus[0].name, "NVIDIA GeForce RTX 4090");
        assert_eq!(gpus[0].memory_used_mb, 20480);
        assert_eq!(gpus[0].memory_total_mb, 24564);
        assert_eq!(gpus[0].utilization_pct, 97.0);
        assert_eq!(gpus[0].temp_c, Some(71.0));
        assert_eq!(gpus[0].power_draw_w, Some(412.33));
        assert_eq!(gpus[1].index, 1);
    }

    #[test]
    fn test_parse_unsupported_fields() {
        let output = "0, Tesla T4, 300, 15360, [N/A], [N/A], [Not Supported]\n";
        let gpus = parse_query_output(output).unwrap();

        assert_eq!(gpus[0].utilization_pct, 0.0);
        assert_eq!(gpus[0].temp_c, None);
        assert_eq!(gpus[0].power_draw_w, None);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_query_output("0, GPU, 1, 2\n").is_err());
        assert!(parse_query_output("0, GPU, [N/A], 2, 3, 4, 5\n").is_err());
        assert!(parse_query_output("\n\n").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let sampler = NvidiaSmiSampler::new(
            "/nonexistent/modelhost-nvidia-smi",
            Duration::from_secs(1),
        );
        let err = sampler.sample().await.unwrap_err();
        assert!(matches!(err, GpuError::Unavailable(_)));
    }
}
