pub mod cpu;
pub mod disk;
pub mod gpu;
pub mod input;
pub mod memory;
pub mod network;

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The metric dimensions the idleness predicate evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Cpu,
    Memory,
    Network,
    Disk,
    Input,
    Gpu,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Cpu => "cpu",
            Dimension::Memory => "memory",
            Dimension::Network => "network",
            Dimension::Disk => "disk",
            Dimension::Input => "input",
            Dimension::Gpu => "gpu",
        }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("unexpected format in {path}: {detail}")]
    Parse { path: String, detail: String },

    #[error("probe {probe} failed: {detail}")]
    Probe { probe: String, detail: String },
}

/// One accelerator's reading within a snapshot. The `id` is stable for
/// the lifetime of the host (device UUID or sysfs card index).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceleratorReading {
    pub id: String,
    pub vendor: String,
    pub model: String,
    pub utilization_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub temperature_c: Option<f64>,
}

/// A single collector's normalized result.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    CpuPercent(f64),
    MemoryPercent(f64),
    NetworkKbps(f64),
    DiskKbps(f64),
    /// Seconds since the last human input event; `None` when no probe is
    /// available on this host (the dimension is then treated as satisfied).
    InputIdle(Option<u64>),
    Accelerators(Vec<AcceleratorReading>),
}

/// A metric collector samples one dimension and returns a normalized
/// reading or a recoverable error. Collectors are called concurrently by
/// the sampler, so rate caches live behind interior mutability.
#[async_trait]
pub trait Collector: Send + Sync {
    fn dimension(&self) -> Dimension;

    async fn sample(&self) -> Result<Reading, CollectorError>;
}

/// Converts a cumulative byte counter into a KB/s rate between calls.
///
/// The first observation seeds the counter and reports 0. Observations
/// spaced closer than `MIN_INTERVAL` return the previous rate rather
/// than dividing by a near-zero window.
#[derive(Debug)]
pub struct RateWindow {
    state: Mutex<RateState>,
}

#[derive(Debug)]
struct RateState {
    prev: Option<(u64, Instant)>,
    last_rate: f64,
}

const MIN_INTERVAL: Duration = Duration::from_millis(1);

impl RateWindow {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RateState {
                prev: None,
                last_rate: 0.0,
            }),
        }
    }

    pub fn observe(&self, bytes: u64) -> f64 {
        self.observe_at(bytes, Instant::now())
    }

    fn observe_at(&self, bytes: u64, now: Instant) -> f64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let Some((prev_bytes, prev_at)) = state.prev else {
            state.prev = Some((bytes, now));
            return 0.0;
        };

        let elapsed = now.saturating_duration_since(prev_at);
        if elapsed < MIN_INTERVAL {
            return state.last_rate;
        }

        // Counter resets (interface bounce, device removal) read as 0 delta.
        let delta = bytes.saturating_sub(prev_bytes);
        let rate = delta as f64 / 1024.0 / elapsed.as_secs_f64();

        state.prev = Some((bytes, now));
        state.last_rate = rate;
        rate
    }
}

impl Default for RateWindow {
    fn default() -> Self {
        Self::new()
    }
}
