//! Host resource snapshot recorded alongside registered models.

use serde::{Deserialize, Serialize};
use std::process::Command;
use std::time::Duration;
use sysinfo::{CpuExt, System, SystemExt};
use tracing::debug;

/// Utilisation at or above this percentage is reported as `warning`.
pub const HEALTH_THRESHOLD: f32 = 80.0;

/// Marker used when the GPU cannot be queried.
pub const GPU_UNAVAILABLE: &str = "unavailable";

const CPU_SAMPLE_INTERVAL: Duration = Duration::from_millis(200);

/// `fulfilled` below the threshold, `warning` otherwise.
pub fn health_label(percent: f32) -> &'static str {
    if percent < HEALTH_THRESHOLD {
        "fulfilled"
    } else {
        "warning"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    /// GPU utilisation as reported by the driver, or [`GPU_UNAVAILABLE`]
    pub gpu: String,
}

impl ResourceSnapshot {
    /// Sample CPU, memory and GPU utilisation. Blocks for a short CPU
    /// sampling interval.
    pub fn capture() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        std::thread::sleep(CPU_SAMPLE_INTERVAL);
        sys.refresh_cpu();
        sys.refresh_memory();

        let cpu_percent = sys.global_cpu_info().cpu_usage();
        let memory_percent = if sys.total_memory() == 0 {
            0.0
        } else {
            (sys.used_memory() as f64 / sys.total_memory() as f64 * 100.0) as f32
        };

        Self {
            cpu_percent,
            memory_percent,
            gpu: query_gpu(),
        }
    }

    pub fn cpu_health(&self) -> &'static str {
        health_label(self.cpu_percent)
    }

    pub fn memory_health(&self) -> &'static str {
        health_label(self.memory_percent)
    }
}

fn query_gpu() -> String {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=utilization.gpu",
            "--format=csv,noheader,nounits",
        ])
        .output();

    match output {
        Ok(out) if out.status.success() => {
            let text = String::from_utf8_lossy(&out.stdout);
            match text.lines().next().map(str::trim).filter(|l| !l.is_empty()) {
                Some(first) => format!("{first}%"),
                None => GPU_UNAVAILABLE.to_string(),
            }
        }
        Ok(out) => {
            debug!(status = %out.status, "nvidia-smi returned failure");
            GPU_UNAVAILABLE.to_string()
        }
        Err(e) => {
            debug!(error = %e, "nvidia-smi not available");
            GPU_UNAVAILABLE.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_label_threshold() {
        assert_eq!(health_label(0.0), "fulfilled");
        assert_eq!(health_label(79.9), "fulfilled");
        assert_eq!(health_label(80.0), "warning");
        assert_eq!(health_label(100.0), "warning");
    }

    #[test]
    fn test_capture_is_bounded() {
        let snapshot = ResourceSnapshot::capture();
        assert!(snapshot.memory_percent >= 0.0 && snapshot.memory_percent <= 100.0);
        assert!(!snapshot.gpu.is_empty());
    }
}
