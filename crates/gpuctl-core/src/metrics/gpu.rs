//! GPU telemetry. Prefers `nvml-wrapper`, falls back
//! to shelling out to `nvidia-smi` when NVML is unavailable.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GpuSnapshot {
    pub index: u32,
    pub name: String,
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub memory_free_bytes: u64,
    pub utilization_percent: Option<f32>,
    pub temperature_celsius: Option<f32>,
    pub power_draw_watts: Option<f32>,
    pub power_limit_watts: Option<f32>,
}

pub trait GpuSource: Send + Sync {
    fn read(&self) -> Vec<GpuSnapshot>;
}

/// Picks the best available source at startup: NVML if the `nvml` feature
/// is compiled in and a driver is present, else an `nvidia-smi` subprocess
/// reader, else a source that reports zero GPUs.
pub fn detect_source() -> Box<dyn GpuSource> {
    #[cfg(feature = "nvml")]
    {
        if let Some(source) = NvmlSource::try_new() {
            return Box::new(source);
        }
    }
    Box::new(NvidiaSmiSource)
}

#[cfg(feature = "nvml")]
pub struct NvmlSource {
    nvml: nvml_wrapper::Nvml,
}

#[cfg(feature = "nvml")]
impl NvmlSource {
    fn try_new() -> Option<Self> {
        nvml_wrapper::Nvml::init().ok().map(|nvml| NvmlSource { nvml })
    }
}

#[cfg(feature = "nvml")]
impl GpuSource for NvmlSource {
    fn read(&self) -> Vec<GpuSnapshot> {
        let Ok(count) = self.nvml.device_count() else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(count as usize);
        for i in 0..count {
            let Ok(device) = self.nvml.device_by_index(i) else {
                continue;
            };
            let name = device.name().unwrap_or_else(|_| "NVIDIA GPU".to_string());
            let mem = device.memory_info().ok();
            let util = device.utilization_rates().ok().map(|u| u.gpu as f32);
            let temp = device
                .temperature(nvml_wrapper::enum_wrappers::device::TemperatureSensor::Gpu)
                .ok()
                .map(|t| t as f32);
            let power = device.power_usage().ok().map(|mw| mw as f32 / 1000.0);
            let power_limit = device
                .power_management_limit()
                .ok()
                .map(|mw| mw as f32 / 1000.0);
            out.push(GpuSnapshot {
                index: i,
                name,
                memory_total_bytes: mem.as_ref().map(|m| m.total).unwrap_or(0),
                memory_used_bytes: mem.as_ref().map(|m| m.used).unwrap_or(0),
                memory_free_bytes: mem.as_ref().map(|m| m.free).unwrap_or(0),
                utilization_percent: util,
                temperature_celsius: temp,
                power_draw_watts: power,
                power_limit_watts: power_limit,
            });
        }
        out
    }
}

/// Parses `nvidia-smi --query-gpu=... --format=csv,noheader,nounits`.
pub struct NvidiaSmiSource;

const QUERY_FIELDS: &str = "index,name,memory.total,memory.used,memory.free,utilization.gpu,temperature.gpu,power.draw,power.limit";

impl GpuSource for NvidiaSmiSource {
    fn read(&self) -> Vec<GpuSnapshot> {
        let output = std::process::Command::new("nvidia-smi")
            .arg(format!("--query-gpu={QUERY_FIELDS}"))
            .arg("--format=csv,noheader,nounits")
            .output();
        let Ok(output) = output else {
            return Vec::new();
        };
        if !output.status.success() {
            return Vec::new();
        }
        parse_nvidia_smi_csv(&String::from_utf8_lossy(&output.stdout))
    }
}

fn parse_nvidia_smi_csv(text: &str) -> Vec<GpuSnapshot> {
    let mut out = Vec::new();
    for line in text.lines() {
        let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
        if parts.len() < 9 {
            continue;
        }
        let Ok(index) = parts[0].parse::<u32>() else {
            continue;
        };
        let mib = |s: &str| s.parse::<u64>().ok().map(|mb| mb * 1024 * 1024).unwrap_or(0);
        out.push(GpuSnapshot {
            index,
            name: parts[1].to_string(),
            memory_total_bytes: mib(parts[2]),
            memory_used_bytes: mib(parts[3]),
            memory_free_bytes: mib(parts[4]),
            utilization_percent: parts[5].parse().ok(),
            temperature_celsius: parts[6].parse().ok(),
            power_draw_watts: parts[7].parse().ok(),
            power_limit_watts: parts[8].parse().ok(),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_csv_rows() {
        let csv = "0, NVIDIA A100, 81920, 1024, 80896, 12, 45, 75.50, 400.00\n";
        let snaps = parse_nvidia_smi_csv(csv);
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].index, 0);
        assert_eq!(snaps[0].name, "NVIDIA A100");
        assert_eq!(snaps[0].memory_total_bytes, 81920 * 1024 * 1024);
        assert_eq!(snaps[0].utilization_percent, Some(12.0));
        assert_eq!(snaps[0].power_draw_watts, Some(75.5));
    }

    #[test]
    fn skips_malformed_rows() {
        let csv = "not,enough,fields\n";
        assert!(parse_nvidia_smi_csv(csv).is_empty());
    }
}
