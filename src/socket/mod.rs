pub mod protocol;

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::action::ActionCoordinator;
use crate::config::ConfigStore;
use crate::events::EventLog;
use crate::idle::{self, IdleState, StateHandle};
use crate::provider::{PermissionStatus, Provider};
use crate::sampler::Sampler;
use protocol::{
    HistoryData, HistoryParams, Request, Response, SamplerControlData, SimulateData,
    SimulateParams, StatusData, DEFAULT_HISTORY_LIMIT, ERR_NOT_IMPLEMENTED, ERR_PARSE,
    ERR_UNKNOWN_COMMAND, MAX_HISTORY_LIMIT,
};

/// Concurrent connection cap; excess connections are closed immediately.
const MAX_CONNECTIONS: usize = 32;

/// Requests larger than this are cut off at the cap (and then fail to
/// parse).
const MAX_REQUEST_BYTES: u64 = 64 * 1024;

/// Everything a request handler can touch.
///
/// Cloning is cheap — clones share the same underlying data via Arc.
#[derive(Clone)]
pub struct ControlContext {
    pub config: ConfigStore,
    pub sampler: Arc<Sampler>,
    pub state: StateHandle,
    pub events: Arc<EventLog>,
    pub coordinator: Arc<ActionCoordinator>,
    pub provider: Arc<dyn Provider>,
    /// Serializes the mutating commands (START/STOP/RESTART).
    pub control_lock: Arc<Mutex<()>>,
}

/// The local request/response endpoint for co-located tools. One JSON
/// request per connection, one JSON response back, then close.
pub struct ControlServer {
    ctx: ControlContext,
}

impl ControlServer {
    pub fn new(ctx: ControlContext) -> Self {
        Self { ctx }
    }

    /// Bind the unix socket, replacing a stale file from a previous run,
    /// and restrict it to the service account's group.
    pub fn bind(path: &Path) -> Result<UnixListener> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("failed to bind {}", path.display()))?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
        Ok(listener)
    }

    /// Accept loop. Runs until the task is cancelled at shutdown.
    pub async fn run(&self, listener: UnixListener) {
        let semaphore = Arc::new(Semaphore::new(MAX_CONNECTIONS));

        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Control socket accept failed");
                    continue;
                }
            };

            // At capacity: reject immediately rather than queueing.
            let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                warn!("Control socket at connection cap; rejecting");
                drop(stream);
                continue;
            };

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, ctx).await {
                    debug!(error = %e, "Control connection error");
                }
                drop(permit);
            });
        }
    }
}

async fn handle_connection(mut stream: UnixStream, ctx: ControlContext) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.split();
    let mut reader = BufReader::new(read_half).take(MAX_REQUEST_BYTES);

    let mut buf = Vec::new();
    reader.read_until(b'\n', &mut buf).await?;

    let response = match serde_json::from_slice::<Request>(&buf) {
        Ok(request) => {
            debug!(command = %request.command, "Control request");
            dispatch(request, &ctx).await
        }
        Err(e) => Response::err(format!("{ERR_PARSE}: {e}")),
    };

    let mut out = serde_json::to_vec(&response)
        .unwrap_or_else(|_| br#"{"success":false,"error":"internal-error"}"#.to_vec());
    out.push(b'\n');
    write_half.write_all(&out).await?;
    write_half.shutdown().await?;
    Ok(())
}

async fn dispatch(request: Request, ctx: &ControlContext) -> Response {
    match request.command.as_str() {
        "STATUS" => status(ctx).await,
        "CONFIG_GET" => {
            let config = ctx.config.current().await;
            Response::ok(&*config)
        }
        // Runtime mutation goes through SIGHUP reload only.
        "CONFIG_SET" => Response::err(ERR_NOT_IMPLEMENTED),
        "HISTORY" => history(request.params, ctx).await,
        "START" => {
            let _guard = ctx.control_lock.lock().await;
            ctx.sampler.resume().await;
            Response::ok(SamplerControlData { running: true })
        }
        "STOP" => {
            let _guard = ctx.control_lock.lock().await;
            ctx.sampler.pause().await;
            Response::ok(SamplerControlData { running: false })
        }
        "RESTART" => {
            let _guard = ctx.control_lock.lock().await;
            ctx.sampler.pause().await;
            ctx.sampler.resume().await;
            Response::ok(SamplerControlData { running: true })
        }
        "SIMULATE" => simulate(request.params, ctx).await,
        other => Response::err(format!("{ERR_UNKNOWN_COMMAND}: {other}")),
    }
}

async fn status(ctx: &ControlContext) -> Response {
    let config = ctx.config.current().await;
    let state = ctx.state.current().await;
    let latest = ctx.sampler.latest();
    let now = Utc::now();

    let naptime = config.naptime();
    let interval = chrono::Duration::from_std(config.sample_interval())
        .unwrap_or_else(|_| chrono::Duration::seconds(60));

    let should_snooze = match &state {
        IdleState::IdleFired { .. } => true,
        _ => {
            ctx.state
                .would_fire_within(latest.as_ref(), &config.thresholds, naptime, interval, now)
                .await
        }
    };

    let snooze_reason = match &state {
        IdleState::IdleFired { reason, .. } => Some(reason.clone()),
        _ => latest.as_ref().and_then(|snapshot| {
            let evaluation = idle::evaluate(snapshot, &config.thresholds);
            evaluation.idle.then(|| evaluation.detail_line())
        }),
    };

    let instance = ctx.provider.cached_identity().await;
    let identity_status = if instance.is_some() {
        "ok"
    } else {
        "identity-unknown"
    };

    let permission_status = match ctx.coordinator.permission_status().await {
        None => "unchecked",
        Some(PermissionStatus::Ok) => "ok",
        Some(_) => "permission-missing",
    };

    Response::ok(StatusData {
        version: env!("CARGO_PKG_VERSION").to_string(),
        state: state.name().to_string(),
        idle_since: state.idle_since(),
        should_snooze,
        snooze_reason,
        snapshot: latest,
        instance,
        identity_status: identity_status.to_string(),
        permission_status: permission_status.to_string(),
        sampler_running: ctx.sampler.is_running().await,
        persistent_probe_failures: ctx.sampler.persistent_failures().await,
    })
}

async fn history(params: serde_json::Value, ctx: &ControlContext) -> Response {
    let params: HistoryParams = if params.is_null() {
        HistoryParams::default()
    } else {
        match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return Response::err(format!("{ERR_PARSE}: {e}")),
        }
    };

    let limit = params
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    let events = ctx.events.recent(limit, params.since).await;
    let count = events.len();

    Response::ok(HistoryData { events, count })
}

/// Evaluate a pseudo-snapshot against the active thresholds without
/// touching real state.
async fn simulate(params: serde_json::Value, ctx: &ControlContext) -> Response {
    let params: SimulateParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return Response::err(format!("{ERR_PARSE}: {e}")),
    };

    let config = ctx.config.current().await;
    let evaluation = idle::evaluate(&params.snapshot, &config.thresholds);

    Response::ok(SimulateData {
        would_idle: evaluation.idle,
        detail: evaluation.detail_line(),
    })
}
