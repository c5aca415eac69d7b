use std::time::Duration;

use async_trait::async_trait;

use super::{Collector, CollectorError, Dimension, Reading};

/// Delta window for one CPU sample. Short enough to fit well inside the
/// sampler's per-collector timeout, long enough for /proc/stat jiffies
/// to advance.
const OBSERVATION_WINDOW: Duration = Duration::from_millis(100);

/// CPU utilization across all cores, from two aggregate /proc/stat
/// readings taken `OBSERVATION_WINDOW` apart.
pub struct CpuCollector {
    path: String,
}

impl CpuCollector {
    pub fn new() -> Self {
        Self {
            path: "/proc/stat".to_string(),
        }
    }

    fn read_times(&self) -> Result<CpuTimes, CollectorError> {
        let contents = std::fs::read_to_string(&self.path).map_err(|source| CollectorError::Io {
            path: self.path.clone(),
            source,
        })?;
        parse_proc_stat(&contents).ok_or_else(|| CollectorError::Parse {
            path: self.path.clone(),
            detail: "no aggregate cpu line".to_string(),
        })
    }
}

impl Default for CpuCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Collector for CpuCollector {
    fn dimension(&self) -> Dimension {
        Dimension::Cpu
    }

    async fn sample(&self) -> Result<Reading, CollectorError> {
        let before = self.read_times()?;
        tokio::time::sleep(OBSERVATION_WINDOW).await;
        let after = self.read_times()?;

        Ok(Reading::CpuPercent(busy_percent(&before, &after)))
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct CpuTimes {
    idle: u64,
    total: u64,
}

/// Extract idle and total jiffies from the aggregate "cpu " line.
/// Idle includes iowait — time the CPU spent waiting on disk is not busy.
pub(crate) fn parse_proc_stat(contents: &str) -> Option<CpuTimes> {
    let line = contents.lines().find(|l| l.starts_with("cpu "))?;

    // cpu  user nice system idle iowait irq softirq steal ...
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .filter_map(|s| s.parse().ok())
        .collect();

    if fields.len() < 4 {
        return None;
    }

    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total: u64 = fields.iter().sum();

    Some(CpuTimes { idle, total })
}

pub(crate) fn busy_percent(before: &CpuTimes, after: &CpuTimes) -> f64 {
    let d_total = after.total.saturating_sub(before.total);
    let d_idle = after.idle.saturating_sub(before.idle);
    if d_total == 0 {
        return 0.0;
    }
    (d_total - d_idle) as f64 / d_total as f64 * 100.0
}
