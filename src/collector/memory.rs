use async_trait::async_trait;

use super::{Collector, CollectorError, Dimension, Reading};

/// Physical memory usage from /proc/meminfo.
///
/// Used = MemTotal − MemAvailable, which accounts for reclaimable page
/// cache the way the kernel itself reports headroom.
pub struct MemoryCollector {
    path: String,
}

impl MemoryCollector {
    pub fn new() -> Self {
        Self {
            path: "/proc/meminfo".to_string(),
        }
    }
}

impl Default for MemoryCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Collector for MemoryCollector {
    fn dimension(&self) -> Dimension {
        Dimension::Memory
    }

    async fn sample(&self) -> Result<Reading, CollectorError> {
        let contents = std::fs::read_to_string(&self.path).map_err(|source| CollectorError::Io {
            path: self.path.clone(),
            source,
        })?;

        let percent = parse_meminfo(&contents).ok_or_else(|| CollectorError::Parse {
            path: self.path.clone(),
            detail: "missing MemTotal or MemAvailable".to_string(),
        })?;

        Ok(Reading::MemoryPercent(percent))
    }
}

pub(crate) fn parse_meminfo(contents: &str) -> Option<f64> {
    let mut total_kb: Option<u64> = None;
    let mut available_kb: Option<u64> = None;

    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kb = parse_kb(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kb = parse_kb(rest);
        }
        if total_kb.is_some() && available_kb.is_some() {
            break;
        }
    }

    let total = total_kb?;
    let available = available_kb?;
    if total == 0 {
        return None;
    }

    let used = total.saturating_sub(available);
    Some(used as f64 / total as f64 * 100.0)
}

fn parse_kb(rest: &str) -> Option<u64> {
    rest.split_whitespace().next()?.parse().ok()
}
