use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{ConfigStore, SnoozeConfig};
use crate::events::{EventLog, EventResult, SnoozeEvent};
use crate::idle::{FireDecision, StateHandle};
use crate::provider::{InstanceIdentity, PermissionStatus, Provider};

/// Permission verifications older than this are re-run before a stop.
const PERMISSION_TTL_SECS: i64 = 3600;

/// Consecutive `failed-api` outcomes within the window after which the
/// machine stays latched in `IDLE_FIRED` instead of retrying.
const MAX_API_FAILURES: usize = 3;
const FAILURE_WINDOW_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy)]
pub struct PermissionCheck {
    pub status: PermissionStatus,
    pub at: DateTime<Utc>,
}

/// Runs the stop pipeline once per fire: permission pre-check, tagging,
/// stop, durable event emit. The only caller of `stop_instance`; the
/// internal mutex guarantees at-most-one in-flight stop.
pub struct ActionCoordinator {
    provider: Arc<dyn Provider>,
    config: ConfigStore,
    state: StateHandle,
    events: Arc<EventLog>,
    in_flight: Mutex<()>,
    permission: RwLock<Option<PermissionCheck>>,
    api_failures: RwLock<Vec<DateTime<Utc>>>,
}

impl ActionCoordinator {
    pub fn new(
        provider: Arc<dyn Provider>,
        config: ConfigStore,
        state: StateHandle,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            provider,
            config,
            state,
            events,
            in_flight: Mutex::new(()),
            permission: RwLock::new(None),
            api_failures: RwLock::new(Vec::new()),
        }
    }

    /// Run the permission probes and cache the verdict. Called at
    /// startup, hourly from the recheck task, and from the stop pipeline
    /// when the cache has gone stale.
    pub async fn preflight(&self) -> Result<PermissionStatus, crate::provider::ProviderError> {
        let config = self.config.current().await;
        let tag_probe = config.tagging_enabled.then_some(config.tag_prefix.as_str());

        let status = self.provider.verify_permissions(tag_probe).await?;
        if !status.is_ok() {
            warn!(status = ?status, "Permission pre-flight failed; stops disabled until it passes");
        }

        *self.permission.write().await = Some(PermissionCheck {
            status,
            at: Utc::now(),
        });
        Ok(status)
    }

    /// Last cached pre-flight verdict, for STATUS.
    pub async fn permission_status(&self) -> Option<PermissionStatus> {
        self.permission.read().await.map(|c| c.status)
    }

    /// Consume fire decisions until the sampler side closes.
    pub async fn run(self: Arc<Self>, mut fire_rx: mpsc::Receiver<FireDecision>) {
        while let Some(fire) = fire_rx.recv().await {
            self.handle_fire(fire).await;
        }
    }

    /// Resolves once no stop is in flight. Shutdown waits on this (with
    /// a deadline) so a stop is never cancelled mid-operation.
    pub async fn wait_idle(&self) {
        let _guard = self.in_flight.lock().await;
    }

    /// Execute one fire: pre-check → tag → stop → event. Every path
    /// writes its event before returning.
    pub async fn handle_fire(&self, fire: FireDecision) {
        let Ok(_guard) = self.in_flight.try_lock() else {
            warn!("Stop already in flight; aborting duplicate fire");
            self.emit(&fire, None, BTreeMap::new(), EventResult::AbortedRace, false)
                .await;
            return;
        };

        let config = self.config.current().await;
        let identity = self.provider.discover_identity().await.ok();

        // 1. Permission pre-check (cached up to an hour).
        let status = match self.cached_or_verify().await {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "Permission verification failed; will re-evaluate next tick");
                self.state.demote_to_pending().await;
                self.emit(
                    &fire,
                    identity.as_ref(),
                    BTreeMap::new(),
                    EventResult::FailedPermission,
                    false,
                )
                .await;
                return;
            }
        };
        if !status.is_ok() {
            warn!(status = ?status, "Refusing to stop without sufficient permissions");
            self.state.demote_to_pending().await;
            self.emit(
                &fire,
                identity.as_ref(),
                BTreeMap::new(),
                EventResult::FailedPermission,
                false,
            )
            .await;
            return;
        }

        // 2. Tag. Failures are non-fatal; the stop proceeds.
        let tags = if config.tagging_enabled {
            build_tags(&config, &fire, identity.as_ref())
        } else {
            BTreeMap::new()
        };
        let mut tag_partial = false;
        if !tags.is_empty() {
            if let Err(e) = self.provider.apply_tags(&tags).await {
                warn!(error = %e, "Tagging failed; proceeding to stop");
                tag_partial = true;
            }
        }

        // 3. Stop.
        match self.provider.stop_instance().await {
            Ok(()) => {
                self.api_failures.write().await.clear();
                info!(idle_since = %fire.idle_since, reason = %fire.reason, "Instance stop succeeded");
                self.emit(
                    &fire,
                    identity.as_ref(),
                    tags,
                    EventResult::Succeeded,
                    tag_partial,
                )
                .await;
            }
            Err(e) => {
                let consecutive = self.record_api_failure().await;
                if consecutive >= MAX_API_FAILURES {
                    error!(
                        error = %e,
                        failures = consecutive,
                        "Stop keeps failing; staying latched — operator attention required"
                    );
                } else {
                    warn!(error = %e, failures = consecutive, "Stop failed; will retry after next idle tick");
                    self.state.demote_to_pending().await;
                }
                self.emit(
                    &fire,
                    identity.as_ref(),
                    tags,
                    EventResult::FailedApi,
                    tag_partial,
                )
                .await;
            }
        }
    }

    async fn cached_or_verify(
        &self,
    ) -> Result<PermissionStatus, crate::provider::ProviderError> {
        if let Some(check) = *self.permission.read().await {
            if Utc::now().signed_duration_since(check.at)
                < Duration::seconds(PERMISSION_TTL_SECS)
            {
                return Ok(check.status);
            }
        }
        self.preflight().await
    }

    /// Record a failed-api outcome; returns the number of consecutive
    /// failures within the window.
    async fn record_api_failure(&self) -> usize {
        let now = Utc::now();
        let mut failures = self.api_failures.write().await;
        failures.push(now);
        failures
            .retain(|at| now.signed_duration_since(*at) < Duration::seconds(FAILURE_WINDOW_SECS));
        failures.len()
    }

    async fn emit(
        &self,
        fire: &FireDecision,
        identity: Option<&InstanceIdentity>,
        tags: BTreeMap<String, String>,
        result: EventResult,
        tag_partial: bool,
    ) {
        let event = SnoozeEvent {
            id: Uuid::new_v4(),
            at: Utc::now(),
            instance: identity.cloned(),
            reason: fire.reason.clone(),
            snapshot: fire.snapshot.clone(),
            tags,
            result,
            tag_partial,
        };
        if let Err(e) = self.events.append(&event).await {
            error!(error = %e, "Failed to record snooze event");
        }
    }
}

/// The tag set written at stop time: status, timestamp, reason, and
/// version always; per-dimension readings under detailed tagging;
/// restart authorization when enabled.
fn build_tags(
    config: &SnoozeConfig,
    fire: &FireDecision,
    identity: Option<&InstanceIdentity>,
) -> BTreeMap<String, String> {
    let p = &config.tag_prefix;
    let snapshot = &fire.snapshot;
    let mut tags = BTreeMap::new();

    tags.insert(format!("{p}:Status"), "Stopped".to_string());
    tags.insert(format!("{p}:StopTimestamp"), Utc::now().to_rfc3339());
    tags.insert(format!("{p}:StopReason"), fire.reason.clone());
    tags.insert(
        format!("{p}:Version"),
        env!("CARGO_PKG_VERSION").to_string(),
    );

    if config.detailed_tagging {
        tags.insert(
            format!("{p}:CPUPercent"),
            format!("{:.1}", snapshot.cpu_percent),
        );
        tags.insert(
            format!("{p}:MemoryPercent"),
            format!("{:.1}", snapshot.memory_percent),
        );
        tags.insert(
            format!("{p}:NetworkKBps"),
            format!("{:.1}", snapshot.network_kbps),
        );
        tags.insert(
            format!("{p}:DiskIOKBps"),
            format!("{:.1}", snapshot.disk_kbps),
        );
        tags.insert(
            format!("{p}:InputIdleSecs"),
            snapshot.input_idle_secs.to_string(),
        );
        let gpu_peak = snapshot
            .accelerators
            .iter()
            .map(|a| a.utilization_percent)
            .fold(0.0_f64, f64::max);
        tags.insert(format!("{p}:GPUPercent"), format!("{gpu_peak:.1}"));
        tags.insert(
            format!("{p}:GPUCount"),
            snapshot.accelerators.len().to_string(),
        );
        tags.insert(
            format!("{p}:NaptimeMinutes"),
            config.naptime_minutes.to_string(),
        );
        if let Some(identity) = identity {
            tags.insert(
                format!("{p}:InstanceType"),
                identity.instance_type.clone(),
            );
            tags.insert(format!("{p}:Region"), identity.region.clone());
        }
    }

    if config.restart_authorization {
        tags.insert(format!("{p}:RestartAllowed"), "true".to_string());
        if !config.allowed_restarters.is_empty() {
            tags.insert(
                format!("{p}:AllowedRestarters"),
                config.allowed_restarters.join(","),
            );
        }
    }

    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::testing::MockProvider;
    use crate::provider::ProviderError;
    use crate::sampler::Snapshot;

    fn fire_at(at: DateTime<Utc>) -> FireDecision {
        FireDecision {
            idle_since: at - Duration::minutes(30),
            reason:
                "idle for 30m0s: cpu 2.0% < 10.0%, memory 15.0% < 30.0%, network 1.0KB/s < 50.0KB/s, \
                 disk 0.0KB/s < 100.0KB/s, input idle 1200s >= 900s, gpu none present"
                    .to_string(),
            snapshot: Snapshot {
                taken_at: at,
                cpu_percent: 2.0,
                memory_percent: 15.0,
                network_kbps: 1.0,
                disk_kbps: 0.0,
                input_idle_secs: 1200,
                input_supported: true,
                accelerators: vec![],
                blocked: vec![],
            },
        }
    }

    struct Fixture {
        coordinator: ActionCoordinator,
        mock: Arc<MockProvider>,
        state: StateHandle,
        events: Arc<EventLog>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(config: SnoozeConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(EventLog::open(&dir.path().join("events.jsonl"), 100).unwrap());
        let mock = Arc::new(MockProvider::new());
        let state = StateHandle::new();

        // Drive the state machine into IDLE_FIRED the way the sampler would.
        let thresholds = config.thresholds.clone();
        let t0 = Utc::now();
        state
            .observe(&fire_at(t0).snapshot, &thresholds, Duration::seconds(30))
            .await;
        state
            .observe(
                &Snapshot {
                    taken_at: t0 + Duration::seconds(60),
                    ..fire_at(t0).snapshot
                },
                &thresholds,
                Duration::seconds(30),
            )
            .await;
        assert_eq!(state.current().await.name(), "IDLE_FIRED");

        let coordinator = ActionCoordinator::new(
            mock.clone(),
            ConfigStore::test_store(config),
            state.clone(),
            events.clone(),
        );
        Fixture {
            coordinator,
            mock,
            state,
            events,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn successful_fire_tags_then_stops_then_records() {
        let f = fixture(SnoozeConfig::default()).await;
        f.coordinator.handle_fire(fire_at(Utc::now())).await;

        let calls = f.mock.calls();
        let tag_pos = calls.iter().position(|c| c == "apply_tags").unwrap();
        let stop_pos = calls.iter().position(|c| c == "stop_instance").unwrap();
        assert!(tag_pos < stop_pos, "tags must be applied before stop: {calls:?}");

        let events = f.events.recent(10, None).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].result, EventResult::Succeeded);
        assert!(!events[0].tag_partial);
        assert_eq!(events[0].tags["CloudSnooze:Status"], "Stopped");
        assert!(events[0].tags["CloudSnooze:StopReason"].contains("cpu"));

        // One tag write for the whole fire
        let applied = f.mock.applied_tags.lock().unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0]["CloudSnooze:Status"], "Stopped");
    }

    #[tokio::test]
    async fn stop_called_at_most_once_per_fire() {
        let f = fixture(SnoozeConfig::default()).await;
        f.coordinator.handle_fire(fire_at(Utc::now())).await;
        assert_eq!(f.mock.count("stop_instance"), 1);
    }

    #[tokio::test]
    async fn missing_permission_prevents_stop() {
        let f = fixture(SnoozeConfig::default()).await;
        f.mock
            .permission_script
            .lock()
            .unwrap()
            .push(Ok(PermissionStatus::MissingStop));

        f.coordinator.handle_fire(fire_at(Utc::now())).await;

        assert_eq!(f.mock.count("stop_instance"), 0);
        assert_eq!(f.mock.count("apply_tags"), 0);
        assert_eq!(f.state.current().await.name(), "IDLE_PENDING");

        let events = f.events.recent(10, None).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].result, EventResult::FailedPermission);
        assert_eq!(
            f.coordinator.permission_status().await,
            Some(PermissionStatus::MissingStop)
        );
    }

    #[tokio::test]
    async fn permission_verdict_cached_within_ttl() {
        let f = fixture(SnoozeConfig::default()).await;

        f.coordinator.preflight().await.unwrap();
        assert_eq!(f.mock.count("verify_permissions"), 1);

        f.coordinator.handle_fire(fire_at(Utc::now())).await;
        // Fresh cache — no second verification on the fire path.
        assert_eq!(f.mock.count("verify_permissions"), 1);
    }

    #[tokio::test]
    async fn tag_failure_is_nonfatal() {
        let f = fixture(SnoozeConfig::default()).await;
        f.mock
            .tag_script
            .lock()
            .unwrap()
            .push(Err(ProviderError::Api("tag denied".into())));

        f.coordinator.handle_fire(fire_at(Utc::now())).await;

        assert_eq!(f.mock.count("stop_instance"), 1);
        let events = f.events.recent(10, None).await;
        assert_eq!(events[0].result, EventResult::Succeeded);
        assert!(events[0].tag_partial);
    }

    #[tokio::test]
    async fn api_failure_demotes_for_retry() {
        let f = fixture(SnoozeConfig::default()).await;
        f.mock
            .stop_script
            .lock()
            .unwrap()
            .push(Err(ProviderError::Api("throttled".into())));

        f.coordinator.handle_fire(fire_at(Utc::now())).await;

        assert_eq!(f.state.current().await.name(), "IDLE_PENDING");
        // idle_since preserved for the retry
        assert!(f.state.current().await.idle_since().is_some());
        let events = f.events.recent(10, None).await;
        assert_eq!(events[0].result, EventResult::FailedApi);
    }

    #[tokio::test]
    async fn third_consecutive_api_failure_latches() {
        let f = fixture(SnoozeConfig::default()).await;
        {
            let mut script = f.mock.stop_script.lock().unwrap();
            for _ in 0..3 {
                script.push(Err(ProviderError::Api("throttled".into())));
            }
        }

        for attempt in 0..3 {
            f.coordinator.handle_fire(fire_at(Utc::now())).await;
            if attempt < 2 {
                assert_eq!(f.state.current().await.name(), "IDLE_PENDING");
                // Re-arm the machine as the next idle tick would.
                let config = SnoozeConfig::default();
                f.state
                    .observe(
                        &fire_at(Utc::now()).snapshot,
                        &config.thresholds,
                        Duration::seconds(0),
                    )
                    .await;
                assert_eq!(f.state.current().await.name(), "IDLE_FIRED");
            }
        }

        // Latched: no demotion after the third failure.
        assert_eq!(f.state.current().await.name(), "IDLE_FIRED");
        assert_eq!(f.events.recent(10, None).await.len(), 3);
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let f = fixture(SnoozeConfig::default()).await;
        f.mock
            .stop_script
            .lock()
            .unwrap()
            .push(Err(ProviderError::Api("blip".into())));

        f.coordinator.handle_fire(fire_at(Utc::now())).await;
        f.coordinator.handle_fire(fire_at(Utc::now())).await; // succeeds

        assert!(f.coordinator.api_failures.read().await.is_empty());
    }

    #[tokio::test]
    async fn tagging_disabled_skips_apply() {
        let f = fixture(SnoozeConfig {
            tagging_enabled: false,
            ..SnoozeConfig::default()
        })
        .await;

        f.coordinator.handle_fire(fire_at(Utc::now())).await;

        assert_eq!(f.mock.count("apply_tags"), 0);
        assert_eq!(f.mock.count("stop_instance"), 1);
        let events = f.events.recent(10, None).await;
        assert!(events[0].tags.is_empty());
    }

    #[tokio::test]
    async fn overlapping_fire_records_aborted_race() {
        let f = fixture(SnoozeConfig::default()).await;
        let _held = f.coordinator.in_flight.lock().await;

        f.coordinator.handle_fire(fire_at(Utc::now())).await;

        assert_eq!(f.mock.count("stop_instance"), 0);
        let events = f.events.recent(10, None).await;
        assert_eq!(events[0].result, EventResult::AbortedRace);
    }

    // -----------------------------------------------------------------------
    // build_tags
    // -----------------------------------------------------------------------

    #[test]
    fn basic_tag_set() {
        let config = SnoozeConfig::default();
        let tags = build_tags(&config, &fire_at(Utc::now()), None);

        assert_eq!(tags["CloudSnooze:Status"], "Stopped");
        assert!(tags.contains_key("CloudSnooze:StopTimestamp"));
        assert!(tags["CloudSnooze:StopReason"].contains("idle for"));
        assert_eq!(tags["CloudSnooze:Version"], env!("CARGO_PKG_VERSION"));
        assert!(!tags.contains_key("CloudSnooze:CPUPercent"));
        assert!(!tags.contains_key("CloudSnooze:RestartAllowed"));
    }

    #[test]
    fn detailed_tags_include_readings_and_locality() {
        let config = SnoozeConfig {
            detailed_tagging: true,
            ..SnoozeConfig::default()
        };
        let identity = InstanceIdentity {
            instance_id: "i-0abc123".into(),
            instance_type: "m5.large".into(),
            region: "us-east-1".into(),
            provider: "aws".into(),
        };
        let tags = build_tags(&config, &fire_at(Utc::now()), Some(&identity));

        assert_eq!(tags["CloudSnooze:CPUPercent"], "2.0");
        assert_eq!(tags["CloudSnooze:MemoryPercent"], "15.0");
        assert_eq!(tags["CloudSnooze:NetworkKBps"], "1.0");
        assert_eq!(tags["CloudSnooze:DiskIOKBps"], "0.0");
        assert_eq!(tags["CloudSnooze:InputIdleSecs"], "1200");
        assert_eq!(tags["CloudSnooze:GPUPercent"], "0.0");
        assert_eq!(tags["CloudSnooze:GPUCount"], "0");
        assert_eq!(tags["CloudSnooze:NaptimeMinutes"], "30");
        assert_eq!(tags["CloudSnooze:InstanceType"], "m5.large");
        assert_eq!(tags["CloudSnooze:Region"], "us-east-1");
    }

    #[test]
    fn restart_authorization_tags() {
        let config = SnoozeConfig {
            restart_authorization: true,
            allowed_restarters: vec!["scheduler-svc".into(), "ops-bot".into()],
            ..SnoozeConfig::default()
        };
        let tags = build_tags(&config, &fire_at(Utc::now()), None);

        assert_eq!(tags["CloudSnooze:RestartAllowed"], "true");
        assert_eq!(tags["CloudSnooze:AllowedRestarters"], "scheduler-svc,ops-bot");
    }

    #[test]
    fn custom_prefix_respected() {
        let config = SnoozeConfig {
            tag_prefix: "Nap".into(),
            ..SnoozeConfig::default()
        };
        let tags = build_tags(&config, &fire_at(Utc::now()), None);
        assert!(tags.contains_key("Nap:Status"));
        assert!(!tags.contains_key("CloudSnooze:Status"));
    }
}
