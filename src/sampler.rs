use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, warn};

use crate::collector::{AcceleratorReading, Collector, Dimension, Reading};
use crate::config::ConfigStore;
use crate::idle::{FireDecision, StateHandle};

/// Ceiling for the per-collector timeout; the effective timeout is
/// min(this, interval / 4).
const COLLECTOR_TIMEOUT_CAP: Duration = Duration::from_millis(250);

/// Consecutive failures after which a probe is reported as persistent
/// via STATUS.
const PERSISTENT_FAILURE_TICKS: u32 = 5;

/// A complete, immutable reading of all metric dimensions at one
/// instant. Produced solely by the sampler; never mutated after
/// publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default = "Utc::now")]
    pub taken_at: DateTime<Utc>,

    /// CPU percent across all cores, 0–100.
    #[serde(default)]
    pub cpu_percent: f64,

    /// Physical memory used percent, 0–100.
    #[serde(default)]
    pub memory_percent: f64,

    /// Aggregate network throughput, KB/s (rx + tx, all interfaces).
    #[serde(default)]
    pub network_kbps: f64,

    /// Aggregate disk I/O, KB/s (read + write, all devices).
    #[serde(default)]
    pub disk_kbps: f64,

    /// Seconds since the last keyboard or pointer event; 0 when the
    /// probe is unsupported.
    #[serde(default)]
    pub input_idle_secs: u64,

    /// False when no input probe is available on this host.
    #[serde(default = "default_true")]
    pub input_supported: bool,

    /// Ordered accelerator readings; empty when none are present.
    #[serde(default)]
    pub accelerators: Vec<AcceleratorReading>,

    /// Dimensions whose collector failed or timed out this tick. A
    /// blocked dimension can never satisfy the idleness predicate.
    #[serde(default)]
    pub blocked: Vec<Dimension>,
}

fn default_true() -> bool {
    true
}

/// Drives the collectors on a steady cadence, assembles snapshots,
/// steps the idleness state machine, and publishes the latest snapshot
/// for the control socket.
pub struct Sampler {
    collectors: Vec<Box<dyn Collector>>,
    config: ConfigStore,
    state: StateHandle,
    fire_tx: mpsc::Sender<FireDecision>,
    latest_tx: watch::Sender<Option<Snapshot>>,
    running: RwLock<bool>,
    failures: RwLock<HashMap<Dimension, u32>>,
}

impl Sampler {
    pub fn new(
        collectors: Vec<Box<dyn Collector>>,
        config: ConfigStore,
        state: StateHandle,
        fire_tx: mpsc::Sender<FireDecision>,
    ) -> Self {
        let (latest_tx, _) = watch::channel(None);
        Self {
            collectors,
            config,
            state,
            fire_tx,
            latest_tx,
            running: RwLock::new(true),
            failures: RwLock::new(HashMap::new()),
        }
    }

    /// The full standard collector set.
    pub fn default_collectors() -> Vec<Box<dyn Collector>> {
        vec![
            Box::new(crate::collector::cpu::CpuCollector::new()),
            Box::new(crate::collector::memory::MemoryCollector::new()),
            Box::new(crate::collector::network::NetworkCollector::new()),
            Box::new(crate::collector::disk::DiskCollector::new()),
            Box::new(crate::collector::input::InputCollector::new()),
            Box::new(crate::collector::gpu::GpuCollector::new()),
        ]
    }

    /// Most recent published snapshot, if any tick has completed.
    pub fn latest(&self) -> Option<Snapshot> {
        self.latest_tx.borrow().clone()
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Pause the sampling loop; the process and socket stay up.
    pub async fn pause(&self) {
        *self.running.write().await = false;
        debug!("Sampler paused");
    }

    /// Resume the sampling loop.
    pub async fn resume(&self) {
        *self.running.write().await = true;
        debug!("Sampler resumed");
    }

    /// Dimensions whose probe has failed for several consecutive ticks.
    pub async fn persistent_failures(&self) -> Vec<Dimension> {
        let failures = self.failures.read().await;
        let mut dims: Vec<Dimension> = failures
            .iter()
            .filter(|(_, &count)| count >= PERSISTENT_FAILURE_TICKS)
            .map(|(&dim, _)| dim)
            .collect();
        dims.sort_by_key(|d| d.as_str());
        dims
    }

    /// The sampling loop. Runs until the task is cancelled at shutdown.
    /// Interval changes (via config reload) take effect on the next tick.
    pub async fn run(&self) {
        let mut current_interval = self.config.current().await.sample_interval();
        let mut ticker = tokio::time::interval(current_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            if !*self.running.read().await {
                continue;
            }

            let config = self.config.current().await;
            let started = tokio::time::Instant::now();

            let snapshot = self.collect_once(&config).await;

            if let Some(fire) = self
                .state
                .observe(&snapshot, &config.thresholds, config.naptime())
                .await
            {
                if self.fire_tx.send(fire).await.is_err() {
                    warn!("Action coordinator is gone; fire decision dropped");
                }
            }

            // Publication is atomic: readers only ever see full snapshots.
            let _ = self.latest_tx.send_replace(Some(snapshot));

            // A tick that overran its interval means the cadence clock
            // skipped one or more slots; that counts as non-idle.
            if started.elapsed() > current_interval {
                warn!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    interval_ms = current_interval.as_millis() as u64,
                    "Sampling tick overran the interval; skipped tick treated as activity"
                );
                self.state.note_skip().await;
            }

            let configured = config.sample_interval();
            if configured != current_interval {
                current_interval = configured;
                ticker = tokio::time::interval(current_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                debug!(interval_secs = current_interval.as_secs(), "Sampling interval changed");
            }
        }
    }

    /// Run every enabled collector under its timeout and assemble one
    /// snapshot. Failures and timeouts land in `blocked`.
    pub async fn collect_once(&self, config: &crate::config::SnoozeConfig) -> Snapshot {
        let timeout = per_collector_timeout(config.sample_interval());

        let enabled = self
            .collectors
            .iter()
            .filter(|c| config.gpu_sampling_enabled || c.dimension() != Dimension::Gpu);

        let outcomes = futures::future::join_all(enabled.map(|collector| async move {
            let dimension = collector.dimension();
            let outcome = tokio::time::timeout(timeout, collector.sample()).await;
            (dimension, outcome)
        }))
        .await;

        let mut snapshot = Snapshot {
            taken_at: Utc::now(),
            cpu_percent: 0.0,
            memory_percent: 0.0,
            network_kbps: 0.0,
            disk_kbps: 0.0,
            input_idle_secs: 0,
            input_supported: false,
            accelerators: Vec::new(),
            blocked: Vec::new(),
        };

        for (dimension, outcome) in outcomes {
            match outcome {
                Ok(Ok(reading)) => {
                    self.clear_failure(dimension).await;
                    apply_reading(&mut snapshot, reading);
                }
                Ok(Err(e)) => {
                    warn!(dimension = %dimension, error = %e, "Collector failed; dimension blocks idleness");
                    self.bump_failure(dimension).await;
                    snapshot.blocked.push(dimension);
                }
                Err(_) => {
                    warn!(dimension = %dimension, timeout_ms = timeout.as_millis() as u64, "Collector timed out; dimension blocks idleness");
                    self.bump_failure(dimension).await;
                    snapshot.blocked.push(dimension);
                }
            }
        }

        snapshot
    }

    async fn bump_failure(&self, dimension: Dimension) {
        let mut failures = self.failures.write().await;
        let count = failures.entry(dimension).or_insert(0);
        *count += 1;
        if *count == PERSISTENT_FAILURE_TICKS {
            warn!(dimension = %dimension, ticks = *count, "Probe failure is persistent");
        }
    }

    async fn clear_failure(&self, dimension: Dimension) {
        self.failures.write().await.remove(&dimension);
    }
}

fn apply_reading(snapshot: &mut Snapshot, reading: Reading) {
    match reading {
        Reading::CpuPercent(v) => snapshot.cpu_percent = v,
        Reading::MemoryPercent(v) => snapshot.memory_percent = v,
        Reading::NetworkKbps(v) => snapshot.network_kbps = v,
        Reading::DiskKbps(v) => snapshot.disk_kbps = v,
        Reading::InputIdle(Some(secs)) => {
            snapshot.input_idle_secs = secs;
            snapshot.input_supported = true;
        }
        Reading::InputIdle(None) => {
            snapshot.input_idle_secs = 0;
            snapshot.input_supported = false;
        }
        Reading::Accelerators(list) => snapshot.accelerators = list,
    }
}

fn per_collector_timeout(interval: Duration) -> Duration {
    COLLECTOR_TIMEOUT_CAP.min(interval / 4)
}
