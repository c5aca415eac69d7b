use async_trait::async_trait;

use super::{AcceleratorReading, Collector, CollectorError, Dimension, Reading};

const MIB: u64 = 1024 * 1024;

/// Accelerator readings from every vendor path that responds: NVIDIA via
/// nvidia-smi, AMD via the amdgpu sysfs interface. Hosts without vendor
/// tooling yield an empty list, not an error.
pub struct GpuCollector;

impl GpuCollector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GpuCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Collector for GpuCollector {
    fn dimension(&self) -> Dimension {
        Dimension::Gpu
    }

    async fn sample(&self) -> Result<Reading, CollectorError> {
        let mut all = Vec::new();
        all.extend(sample_nvidia().await);
        all.extend(sample_amdgpu_sysfs("/sys/class/drm"));
        Ok(Reading::Accelerators(all))
    }
}

/// Query all NVIDIA GPUs via nvidia-smi. Returns one reading per GPU;
/// empty when the binary is absent or errors.
async fn sample_nvidia() -> Vec<AcceleratorReading> {
    let output = match tokio::process::Command::new("nvidia-smi")
        .args([
            "--query-gpu=uuid,name,utilization.gpu,memory.used,memory.total,temperature.gpu",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .await
    {
        Ok(o) if o.status.success() => o,
        _ => return vec![],
    };

    parse_nvidia_csv(&String::from_utf8_lossy(&output.stdout))
}

pub(crate) fn parse_nvidia_csv(stdout: &str) -> Vec<AcceleratorReading> {
    stdout
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
            if parts.len() < 5 {
                return None;
            }
            let used_mib: u64 = parts[3].parse().ok()?;
            let total_mib: u64 = parts[4].parse().ok()?;
            Some(AcceleratorReading {
                id: parts[0].to_string(),
                vendor: "nvidia".to_string(),
                model: parts[1].to_string(),
                utilization_percent: parts[2].parse().ok()?,
                memory_used_bytes: used_mib * MIB,
                memory_total_bytes: total_mib * MIB,
                temperature_c: parts.get(5).and_then(|s| s.parse().ok()),
            })
        })
        .collect()
}

/// Enumerate AMD GPUs via the kernel sysfs interface. No CLI tools
/// needed. Reads /sys/class/drm/card*/device/mem_info_vram_* and
/// gpu_busy_percent.
fn sample_amdgpu_sysfs(drm_root: &str) -> Vec<AcceleratorReading> {
    let mut results = Vec::new();
    let drm_dir = match std::fs::read_dir(drm_root) {
        Ok(d) => d,
        Err(_) => return results,
    };

    let mut card_indices: Vec<u32> = Vec::new();
    for entry in drm_dir.flatten() {
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        // Match "card0", "card1", etc — skip "card0-DP-1" style entries
        if let Some(rest) = name_str.strip_prefix("card") {
            if let Ok(idx) = rest.parse::<u32>() {
                card_indices.push(idx);
            }
        }
    }
    card_indices.sort();

    for card_idx in card_indices {
        let device_path = format!("{drm_root}/card{card_idx}/device");

        let vram_total = match read_sysfs_u64(&format!("{device_path}/mem_info_vram_total")) {
            Some(v) => v,
            None => continue, // Not an amdgpu card
        };
        let vram_used = read_sysfs_u64(&format!("{device_path}/mem_info_vram_used")).unwrap_or(0);
        let busy = read_sysfs_u64(&format!("{device_path}/gpu_busy_percent")).unwrap_or(0);

        results.push(AcceleratorReading {
            id: format!("amdgpu-card{card_idx}"),
            vendor: "amd".to_string(),
            model: "amdgpu".to_string(),
            utilization_percent: busy as f64,
            memory_used_bytes: vram_used,
            memory_total_bytes: vram_total,
            temperature_c: None,
        });
    }

    results
}

/// Read a u64 from a sysfs file (trimmed). Returns None if the file
/// doesn't exist or parse fails.
fn read_sysfs_u64(path: &str) -> Option<u64> {
    std::fs::read_to_string(path)
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
}
