use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::Thresholds;
use crate::sampler::Snapshot;

/// The idleness state machine. `IdleFired` is latched: only the action
/// coordinator may demote it (back to `IdlePending`) under its bounded
/// retry policy, and nothing resets it to `Active` short of a restart.
#[derive(Debug, Clone, PartialEq)]
pub enum IdleState {
    Active,
    IdlePending {
        idle_since: DateTime<Utc>,
    },
    IdleFired {
        idle_since: DateTime<Utc>,
        reason: String,
        snapshot: Snapshot,
    },
}

impl IdleState {
    pub fn name(&self) -> &'static str {
        match self {
            IdleState::Active => "ACTIVE",
            IdleState::IdlePending { .. } => "IDLE_PENDING",
            IdleState::IdleFired { .. } => "IDLE_FIRED",
        }
    }

    pub fn idle_since(&self) -> Option<DateTime<Utc>> {
        match self {
            IdleState::Active => None,
            IdleState::IdlePending { idle_since } => Some(*idle_since),
            IdleState::IdleFired { idle_since, .. } => Some(*idle_since),
        }
    }
}

/// Handed to the action coordinator when the machine transitions to
/// `IdleFired`.
#[derive(Debug, Clone)]
pub struct FireDecision {
    pub idle_since: DateTime<Utc>,
    pub reason: String,
    pub snapshot: Snapshot,
}

/// One dimension's verdict against its threshold, phrased for the
/// reason string ("cpu 2.0% < 10.0%").
#[derive(Debug, Clone, Serialize)]
pub struct DimensionCheck {
    pub dimension: crate::collector::Dimension,
    pub detail: String,
    pub idle: bool,
}

/// The predicate result for one snapshot: idle iff every dimension is.
#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    pub idle: bool,
    pub checks: Vec<DimensionCheck>,
}

impl Evaluation {
    /// Comma-joined per-dimension details, used in reasons and SIMULATE output.
    pub fn detail_line(&self) -> String {
        self.checks
            .iter()
            .map(|c| c.detail.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Evaluate the idleness predicate for one snapshot.
///
/// Upper-bounded dimensions use strict `<` and input idle uses `>=`, so
/// a dimension exactly at its ceiling is non-idle. A dimension whose
/// collector failed this tick (`snapshot.blocked`) is non-idle: only a
/// cleanly-successful reading may satisfy the predicate.
pub fn evaluate(snapshot: &Snapshot, thresholds: &Thresholds) -> Evaluation {
    use crate::collector::Dimension;

    let mut checks = Vec::with_capacity(6);

    let mut push = |dimension: Dimension, detail: String, idle: bool| {
        checks.push(DimensionCheck {
            dimension,
            detail,
            idle,
        });
    };

    let blocked = |d: Dimension| snapshot.blocked.contains(&d);

    if blocked(Dimension::Cpu) {
        push(Dimension::Cpu, "cpu blocked (probe error)".into(), false);
    } else {
        let idle = snapshot.cpu_percent < thresholds.cpu_percent;
        push(
            Dimension::Cpu,
            format!(
                "cpu {:.1}% {} {:.1}%",
                snapshot.cpu_percent,
                if idle { "<" } else { ">=" },
                thresholds.cpu_percent
            ),
            idle,
        );
    }

    if blocked(Dimension::Memory) {
        push(
            Dimension::Memory,
            "memory blocked (probe error)".into(),
            false,
        );
    } else {
        let idle = snapshot.memory_percent < thresholds.memory_percent;
        push(
            Dimension::Memory,
            format!(
                "memory {:.1}% {} {:.1}%",
                snapshot.memory_percent,
                if idle { "<" } else { ">=" },
                thresholds.memory_percent
            ),
            idle,
        );
    }

    if blocked(Dimension::Network) {
        push(
            Dimension::Network,
            "network blocked (probe error)".into(),
            false,
        );
    } else {
        let idle = snapshot.network_kbps < thresholds.network_kbps;
        push(
            Dimension::Network,
            format!(
                "network {:.1}KB/s {} {:.1}KB/s",
                snapshot.network_kbps,
                if idle { "<" } else { ">=" },
                thresholds.network_kbps
            ),
            idle,
        );
    }

    if blocked(Dimension::Disk) {
        push(Dimension::Disk, "disk blocked (probe error)".into(), false);
    } else {
        let idle = snapshot.disk_kbps < thresholds.disk_kbps;
        push(
            Dimension::Disk,
            format!(
                "disk {:.1}KB/s {} {:.1}KB/s",
                snapshot.disk_kbps,
                if idle { "<" } else { ">=" },
                thresholds.disk_kbps
            ),
            idle,
        );
    }

    if blocked(Dimension::Input) {
        push(
            Dimension::Input,
            "input blocked (probe error)".into(),
            false,
        );
    } else if !snapshot.input_supported {
        push(Dimension::Input, "input unsupported".into(), true);
    } else {
        let idle = snapshot.input_idle_secs >= thresholds.input_idle_secs;
        push(
            Dimension::Input,
            format!(
                "input idle {}s {} {}s",
                snapshot.input_idle_secs,
                if idle { ">=" } else { "<" },
                thresholds.input_idle_secs
            ),
            idle,
        );
    }

    if blocked(Dimension::Gpu) {
        push(Dimension::Gpu, "gpu blocked (probe error)".into(), false);
    } else if snapshot.accelerators.is_empty() {
        push(Dimension::Gpu, "gpu none present".into(), true);
    } else {
        // Every accelerator must be under the ceiling; report the busiest.
        let max = snapshot
            .accelerators
            .iter()
            .map(|a| a.utilization_percent)
            .fold(f64::NEG_INFINITY, f64::max);
        let idle = snapshot
            .accelerators
            .iter()
            .all(|a| a.utilization_percent < thresholds.gpu_percent);
        push(
            Dimension::Gpu,
            format!(
                "gpu {:.1}% {} {:.1}% ({} devices)",
                max,
                if idle { "<" } else { ">=" },
                thresholds.gpu_percent,
                snapshot.accelerators.len()
            ),
            idle,
        );
    }

    Evaluation {
        idle: checks.iter().all(|c| c.idle),
        checks,
    }
}

fn fire_reason(evaluation: &Evaluation, idle_since: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = now.signed_duration_since(idle_since);
    format!(
        "idle for {}m{}s: {}",
        elapsed.num_minutes(),
        elapsed.num_seconds() % 60,
        evaluation.detail_line()
    )
}

/// Shared handle to the idleness state. Stepped only from the sampler;
/// the coordinator demotes/relatches it and the control socket reads it.
///
/// Cloning is cheap — clones share the same underlying data via Arc.
#[derive(Debug, Clone)]
pub struct StateHandle {
    state: Arc<RwLock<IdleState>>,
}

impl Default for StateHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StateHandle {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(IdleState::Active)),
        }
    }

    pub async fn current(&self) -> IdleState {
        self.state.read().await.clone()
    }

    /// Step the machine with a fresh snapshot. Returns a `FireDecision`
    /// exactly when the transition into `IdleFired` happens.
    pub async fn observe(
        &self,
        snapshot: &Snapshot,
        thresholds: &Thresholds,
        naptime: Duration,
    ) -> Option<FireDecision> {
        let evaluation = evaluate(snapshot, thresholds);
        let now = snapshot.taken_at;

        let mut state = self.state.write().await;
        match &*state {
            IdleState::Active => {
                if evaluation.idle {
                    info!(idle_since = %now, "Host went idle");
                    *state = IdleState::IdlePending { idle_since: now };
                }
                None
            }
            IdleState::IdlePending { idle_since } => {
                let idle_since = *idle_since;
                if !evaluation.idle {
                    debug!("Activity observed, idle window reset");
                    *state = IdleState::Active;
                    return None;
                }
                if now.signed_duration_since(idle_since) < naptime {
                    return None;
                }

                let reason = fire_reason(&evaluation, idle_since, now);
                info!(%reason, "Naptime elapsed, firing");
                *state = IdleState::IdleFired {
                    idle_since,
                    reason: reason.clone(),
                    snapshot: snapshot.clone(),
                };
                Some(FireDecision {
                    idle_since,
                    reason,
                    snapshot: snapshot.clone(),
                })
            }
            // Terminal until restart; the coordinator may demote explicitly.
            IdleState::IdleFired { .. } => None,
        }
    }

    /// A skipped tick counts as a non-idle observation (fail-safe).
    pub async fn note_skip(&self) {
        let mut state = self.state.write().await;
        if matches!(&*state, IdleState::IdlePending { .. }) {
            debug!("Tick skipped, idle window reset");
            *state = IdleState::Active;
        }
    }

    /// Demote `IdleFired` back to `IdlePending`, preserving `idle_since`,
    /// so the next tick re-evaluates. Used by the coordinator after a
    /// recoverable stop failure.
    pub async fn demote_to_pending(&self) {
        let mut state = self.state.write().await;
        if let IdleState::IdleFired { idle_since, .. } = &*state {
            let idle_since = *idle_since;
            *state = IdleState::IdlePending { idle_since };
        }
    }

    /// Whether one more idle tick would fire: in `IdlePending` with the
    /// latest snapshot idle and the naptime reached within `interval`.
    pub async fn would_fire_within(
        &self,
        latest: Option<&Snapshot>,
        thresholds: &Thresholds,
        naptime: Duration,
        interval: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        let state = self.state.read().await;
        let IdleState::IdlePending { idle_since } = &*state else {
            return false;
        };
        let Some(snapshot) = latest else {
            return false;
        };
        if !evaluate(snapshot, thresholds).idle {
            return false;
        }
        now.signed_duration_since(*idle_since) + interval >= naptime
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{AcceleratorReading, Dimension};
    use crate::sampler::Snapshot;

    fn idle_snapshot(at: DateTime<Utc>) -> Snapshot {
        Snapshot {
            taken_at: at,
            cpu_percent: 2.0,
            memory_percent: 15.0,
            network_kbps: 1.0,
            disk_kbps: 0.0,
            input_idle_secs: 1200,
            input_supported: true,
            accelerators: vec![],
            blocked: vec![],
        }
    }

    fn busy_snapshot(at: DateTime<Utc>) -> Snapshot {
        Snapshot {
            cpu_percent: 80.0,
            ..idle_snapshot(at)
        }
    }

    fn thresholds() -> Thresholds {
        Thresholds {
            cpu_percent: 10.0,
            memory_percent: 30.0,
            network_kbps: 50.0,
            disk_kbps: 100.0,
            input_idle_secs: 900,
            gpu_percent: 5.0,
        }
    }

    fn accel(util: f64) -> AcceleratorReading {
        AcceleratorReading {
            id: "GPU-0".into(),
            vendor: "nvidia".into(),
            model: "A10G".into(),
            utilization_percent: util,
            memory_used_bytes: 0,
            memory_total_bytes: 1 << 30,
            temperature_c: None,
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-15T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn secs(s: i64) -> Duration {
        Duration::seconds(s)
    }

    // ── Group A: predicate ──

    #[test]
    fn all_under_threshold_is_idle() {
        let eval = evaluate(&idle_snapshot(t0()), &thresholds());
        assert!(eval.idle);
        assert_eq!(eval.checks.len(), 6);
        assert!(eval.checks.iter().all(|c| c.idle));
    }

    #[test]
    fn any_dimension_over_blocks() {
        let t = thresholds();
        for mutate in [
            (|s: &mut Snapshot| s.cpu_percent = 50.0) as fn(&mut Snapshot),
            |s| s.memory_percent = 90.0,
            |s| s.network_kbps = 500.0,
            |s| s.disk_kbps = 900.0,
            |s| s.input_idle_secs = 10,
        ] {
            let mut snapshot = idle_snapshot(t0());
            mutate(&mut snapshot);
            assert!(!evaluate(&snapshot, &t).idle);
        }
    }

    #[test]
    fn exactly_at_ceiling_is_not_idle() {
        let t = thresholds();

        let mut snapshot = idle_snapshot(t0());
        snapshot.cpu_percent = t.cpu_percent;
        assert!(!evaluate(&snapshot, &t).idle);

        let mut snapshot = idle_snapshot(t0());
        snapshot.memory_percent = t.memory_percent;
        assert!(!evaluate(&snapshot, &t).idle);

        let mut snapshot = idle_snapshot(t0());
        snapshot.network_kbps = t.network_kbps;
        assert!(!evaluate(&snapshot, &t).idle);

        let mut snapshot = idle_snapshot(t0());
        snapshot.disk_kbps = t.disk_kbps;
        assert!(!evaluate(&snapshot, &t).idle);
    }

    #[test]
    fn input_exactly_at_floor_is_idle() {
        let t = thresholds();
        let mut snapshot = idle_snapshot(t0());
        snapshot.input_idle_secs = t.input_idle_secs;
        assert!(evaluate(&snapshot, &t).idle);
    }

    #[test]
    fn unsupported_input_is_satisfied() {
        let mut snapshot = idle_snapshot(t0());
        snapshot.input_supported = false;
        snapshot.input_idle_secs = 0;
        assert!(evaluate(&snapshot, &thresholds()).idle);
    }

    #[test]
    fn empty_accelerator_list_is_satisfied() {
        assert!(evaluate(&idle_snapshot(t0()), &thresholds()).idle);
    }

    #[test]
    fn busy_accelerator_blocks() {
        let mut snapshot = idle_snapshot(t0());
        snapshot.accelerators = vec![accel(1.0), accel(97.0)];
        assert!(!evaluate(&snapshot, &thresholds()).idle);
    }

    #[test]
    fn accelerator_exactly_at_ceiling_is_not_idle() {
        let mut snapshot = idle_snapshot(t0());
        snapshot.accelerators = vec![accel(5.0)];
        assert!(!evaluate(&snapshot, &thresholds()).idle);
    }

    #[test]
    fn blocked_dimension_fails_predicate() {
        for dim in [
            Dimension::Cpu,
            Dimension::Memory,
            Dimension::Network,
            Dimension::Disk,
            Dimension::Input,
            Dimension::Gpu,
        ] {
            let mut snapshot = idle_snapshot(t0());
            snapshot.blocked = vec![dim];
            let eval = evaluate(&snapshot, &thresholds());
            assert!(!eval.idle, "blocked {dim} should not be idle");
        }
    }

    #[test]
    fn detail_line_names_all_dimensions() {
        let eval = evaluate(&idle_snapshot(t0()), &thresholds());
        let line = eval.detail_line();
        for name in ["cpu", "memory", "network", "disk", "input", "gpu"] {
            assert!(line.contains(name), "missing {name} in {line}");
        }
    }

    // ── Group B: transitions ──

    #[tokio::test]
    async fn idle_run_fires_after_naptime() {
        let state = StateHandle::new();
        let t = thresholds();
        let naptime = secs(120);

        // Tick 1: ACTIVE -> IDLE_PENDING
        assert!(state
            .observe(&idle_snapshot(t0()), &t, naptime)
            .await
            .is_none());
        assert_eq!(state.current().await.name(), "IDLE_PENDING");
        assert_eq!(state.current().await.idle_since(), Some(t0()));

        // Tick 2: still pending (60s < 120s)
        assert!(state
            .observe(&idle_snapshot(t0() + secs(60)), &t, naptime)
            .await
            .is_none());
        assert_eq!(state.current().await.name(), "IDLE_PENDING");

        // Tick 3: 120s elapsed -> fire
        let fire = state
            .observe(&idle_snapshot(t0() + secs(120)), &t, naptime)
            .await
            .expect("should fire");
        assert_eq!(fire.idle_since, t0());
        assert!(fire.reason.contains("idle for 2m0s"));
        assert_eq!(state.current().await.name(), "IDLE_FIRED");
    }

    #[tokio::test]
    async fn idle_since_is_first_snapshot_of_run() {
        let state = StateHandle::new();
        let t = thresholds();
        let naptime = secs(3600);

        for offset in [0, 60, 120, 180] {
            state
                .observe(&idle_snapshot(t0() + secs(offset)), &t, naptime)
                .await;
            assert_eq!(state.current().await.idle_since(), Some(t0()));
        }
    }

    #[tokio::test]
    async fn activity_resets_idle_since() {
        let state = StateHandle::new();
        let t = thresholds();
        let naptime = secs(3600);

        state.observe(&idle_snapshot(t0()), &t, naptime).await;
        state
            .observe(&idle_snapshot(t0() + secs(60)), &t, naptime)
            .await;

        // Busy snapshot resets to ACTIVE
        state
            .observe(&busy_snapshot(t0() + secs(120)), &t, naptime)
            .await;
        assert_eq!(state.current().await.name(), "ACTIVE");
        assert_eq!(state.current().await.idle_since(), None);

        // Next idle snapshot starts a fresh run
        state
            .observe(&idle_snapshot(t0() + secs(180)), &t, naptime)
            .await;
        assert_eq!(state.current().await.idle_since(), Some(t0() + secs(180)));
    }

    #[tokio::test]
    async fn fires_at_most_once_per_run() {
        let state = StateHandle::new();
        let t = thresholds();
        let naptime = secs(60);

        state.observe(&idle_snapshot(t0()), &t, naptime).await;
        let first = state
            .observe(&idle_snapshot(t0() + secs(60)), &t, naptime)
            .await;
        assert!(first.is_some());

        // Latched: further snapshots (idle or busy) never fire again
        for offset in [120, 180, 240] {
            assert!(state
                .observe(&idle_snapshot(t0() + secs(offset)), &t, naptime)
                .await
                .is_none());
            assert!(state
                .observe(&busy_snapshot(t0() + secs(offset + 30)), &t, naptime)
                .await
                .is_none());
            assert_eq!(state.current().await.name(), "IDLE_FIRED");
        }
    }

    #[tokio::test]
    async fn blocked_dimension_keeps_machine_out_of_fired() {
        let state = StateHandle::new();
        let t = thresholds();
        let naptime = secs(60);

        // CPU probe fails every tick while everything else is idle
        for offset in [0, 60, 120, 180, 240] {
            let mut snapshot = idle_snapshot(t0() + secs(offset));
            snapshot.blocked = vec![Dimension::Cpu];
            assert!(state.observe(&snapshot, &t, naptime).await.is_none());
            assert_eq!(state.current().await.name(), "ACTIVE");
        }
    }

    #[tokio::test]
    async fn skip_resets_pending() {
        let state = StateHandle::new();
        let t = thresholds();

        state.observe(&idle_snapshot(t0()), &t, secs(3600)).await;
        assert_eq!(state.current().await.name(), "IDLE_PENDING");

        state.note_skip().await;
        assert_eq!(state.current().await.name(), "ACTIVE");
    }

    #[tokio::test]
    async fn skip_does_not_unlatch_fired() {
        let state = StateHandle::new();
        let t = thresholds();

        // With naptime 0 the second idle tick fires (the first only
        // enters IDLE_PENDING).
        state.observe(&idle_snapshot(t0()), &t, secs(0)).await;
        state
            .observe(&idle_snapshot(t0() + secs(60)), &t, secs(0))
            .await;
        assert_eq!(state.current().await.name(), "IDLE_FIRED");

        state.note_skip().await;
        assert_eq!(state.current().await.name(), "IDLE_FIRED");
    }

    #[tokio::test]
    async fn demote_preserves_idle_since() {
        let state = StateHandle::new();
        let t = thresholds();
        let naptime = secs(60);

        state.observe(&idle_snapshot(t0()), &t, naptime).await;
        state
            .observe(&idle_snapshot(t0() + secs(60)), &t, naptime)
            .await;
        assert_eq!(state.current().await.name(), "IDLE_FIRED");

        state.demote_to_pending().await;
        let current = state.current().await;
        assert_eq!(current.name(), "IDLE_PENDING");
        assert_eq!(current.idle_since(), Some(t0()));

        // And the next idle tick past naptime re-fires
        let fire = state
            .observe(&idle_snapshot(t0() + secs(120)), &t, naptime)
            .await;
        assert!(fire.is_some());
    }

    #[tokio::test]
    async fn demote_on_non_fired_state_is_noop() {
        let state = StateHandle::new();
        state.demote_to_pending().await;
        assert_eq!(state.current().await.name(), "ACTIVE");
    }

    // ── Group C: prediction ──

    #[tokio::test]
    async fn would_fire_within_one_tick() {
        let state = StateHandle::new();
        let t = thresholds();
        let naptime = secs(120);

        state.observe(&idle_snapshot(t0()), &t, naptime).await;
        let latest = idle_snapshot(t0() + secs(60));
        state.observe(&latest, &t, naptime).await;

        // 60s elapsed + 60s interval >= 120s naptime
        assert!(
            state
                .would_fire_within(Some(&latest), &t, naptime, secs(60), t0() + secs(60))
                .await
        );

        // A 30s interval would not get there yet
        assert!(
            !state
                .would_fire_within(Some(&latest), &t, naptime, secs(30), t0() + secs(60))
                .await
        );
    }

    #[tokio::test]
    async fn would_fire_false_when_active_or_busy() {
        let state = StateHandle::new();
        let t = thresholds();
        let latest = idle_snapshot(t0());

        assert!(
            !state
                .would_fire_within(Some(&latest), &t, secs(120), secs(60), t0())
                .await
        );

        state.observe(&idle_snapshot(t0()), &t, secs(120)).await;
        let busy = busy_snapshot(t0() + secs(60));
        assert!(
            !state
                .would_fire_within(Some(&busy), &t, secs(120), secs(60), t0() + secs(60))
                .await
        );
    }
}
