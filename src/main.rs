mod action;
mod collector;
mod config;
mod events;
mod idle;
mod provider;
mod sampler;
mod socket;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::action::ActionCoordinator;
use crate::config::{ConfigStore, LogFormat, DEFAULT_CONFIG_PATH};
use crate::events::EventLog;
use crate::idle::StateHandle;
use crate::provider::{Provider, ProviderRegistry};
use crate::sampler::Sampler;
use crate::socket::{ControlContext, ControlServer};

/// Grace period for an in-flight stop at shutdown; the provider call is
/// never cancelled mid-operation.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// How long between background identity discovery retries.
const IDENTITY_RETRY_INTERVAL: Duration = Duration::from_secs(60);

const EXIT_CONFIG: u8 = 2;
const EXIT_PERMISSION: u8 = 3;
const EXIT_ADAPTER: u8 = 4;
const EXIT_UNEXPECTED: u8 = 1;

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env if present (not required)
    dotenvy::dotenv().ok();

    let config_path =
        std::env::var("SNOOZED_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    // Configuration must load before logging is up; failures go to stderr.
    let config_store = match ConfigStore::load(&config_path) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("snoozed: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    init_tracing(&config_store).await;
    info!("Starting snoozed v{}", env!("CARGO_PKG_VERSION"));
    info!(path = %config_path, "Configuration loaded");

    match run(config_store).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(EXIT_UNEXPECTED)
        }
    }
}

async fn init_tracing(config_store: &ConfigStore) {
    let config = config_store.current().await;
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("snoozed={}", config.log_level).into());

    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn run(config_store: ConfigStore) -> Result<ExitCode> {
    let config = config_store.current().await;

    // Resolve the cloud provider (exit 4 on failure)
    let provider: Arc<dyn Provider> = match ProviderRegistry::resolve(
        &config.provider,
        config.provider_config.clone(),
    )
    .await
    {
        Ok(provider) => Arc::from(provider),
        Err(e) => {
            error!(
                error = %e,
                registered = ?ProviderRegistry::names(),
                "Provider adapter initialization failed"
            );
            return Ok(ExitCode::from(EXIT_ADAPTER));
        }
    };
    info!(provider = provider.name(), "Provider adapter initialized");

    // Discover instance identity; keep retrying in the background if the
    // metadata service is unreachable. No stops happen until it resolves.
    match provider.discover_identity().await {
        Ok(identity) => {
            info!(instance_id = %identity.instance_id, "Instance identity cached");
            log_restart_history(provider.as_ref(), &config.tag_prefix).await;
        }
        Err(e) => {
            warn!(error = %e, "Instance identity unavailable; retrying in background");
            let provider = provider.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(IDENTITY_RETRY_INTERVAL);
                interval.tick().await; // first tick is immediate — skip it
                loop {
                    interval.tick().await;
                    if provider.cached_identity().await.is_some() {
                        break;
                    }
                    if let Err(e) = provider.discover_identity().await {
                        warn!(error = %e, "Instance identity still unavailable");
                    }
                }
            });
        }
    }

    // Event log
    let events = Arc::new(
        EventLog::open(&config.event_log_path, config.event_log_capacity)
            .context("failed to open event log")?,
    );
    info!(
        path = %config.event_log_path.display(),
        seeded = events.len().await,
        "Event log open"
    );

    // State machine + fire channel + sampler + coordinator
    let state = StateHandle::new();
    let (fire_tx, fire_rx) = mpsc::channel(4);

    let sampler = Arc::new(Sampler::new(
        Sampler::default_collectors(),
        config_store.clone(),
        state.clone(),
        fire_tx,
    ));

    let coordinator = Arc::new(ActionCoordinator::new(
        provider.clone(),
        config_store.clone(),
        state.clone(),
        events.clone(),
    ));

    // Permission pre-flight (exit 3 only in strict mode; otherwise the
    // daemon stays up, reports the gap, and rechecks hourly)
    match coordinator.preflight().await {
        Ok(status) if status.is_ok() => info!("Permission pre-flight passed"),
        Ok(status) => {
            if config.strict_permissions {
                error!(status = ?status, "Permission pre-flight failed (strict mode)");
                return Ok(ExitCode::from(EXIT_PERMISSION));
            }
            warn!(status = ?status, "Permission pre-flight failed; stops disabled until it passes");
        }
        Err(e) => {
            warn!(error = %e, "Permission pre-flight could not run; will recheck hourly");
        }
    }

    // Mark the instance as running under our tag prefix (best-effort).
    if config.tagging_enabled {
        let mut tags = std::collections::BTreeMap::new();
        tags.insert(format!("{}:Status", config.tag_prefix), "Running".to_string());
        tags.insert(
            format!("{}:Version", config.tag_prefix),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        if let Err(e) = provider.apply_tags(&tags).await {
            warn!(error = %e, "Could not tag instance as running");
        }
    }

    // Hourly permission recheck
    {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));
            interval.tick().await; // first tick is immediate — skip it
            loop {
                interval.tick().await;
                if let Err(e) = coordinator.preflight().await {
                    warn!(error = %e, "Hourly permission recheck failed");
                }
            }
        });
    }

    // Control socket
    let listener = ControlServer::bind(&config.socket_path)?;
    info!(path = %config.socket_path.display(), "Control socket listening");
    let ctx = ControlContext {
        config: config_store.clone(),
        sampler: sampler.clone(),
        state: state.clone(),
        events: events.clone(),
        coordinator: coordinator.clone(),
        provider: provider.clone(),
        control_lock: Arc::new(Mutex::new(())),
    };
    let socket_task = tokio::spawn(async move { ControlServer::new(ctx).run(listener).await });

    // Sampler loop
    let sampler_task = {
        let sampler = sampler.clone();
        tokio::spawn(async move { sampler.run().await })
    };

    // Action coordinator loop
    let coordinator_task = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run(fire_rx).await })
    };

    info!(
        interval_secs = config.sample_interval_secs,
        naptime_minutes = config.naptime_minutes,
        "snoozed is watching for idleness"
    );

    // Signal loop: SIGHUP reloads config, SIGTERM/SIGINT shut down.
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received");
                break;
            }
            _ = sigint.recv() => {
                info!("SIGINT received");
                break;
            }
            _ = sighup.recv() => {
                match config_store.reload().await {
                    Ok(()) => {}
                    Err(e) => warn!(error = %e, "Reload rejected; keeping active configuration"),
                }
            }
        }
    }

    // Shutdown: stop sampling and the socket, drain any in-flight stop.
    sampler_task.abort();
    socket_task.abort();
    if tokio::time::timeout(SHUTDOWN_DRAIN, coordinator.wait_idle())
        .await
        .is_err()
    {
        warn!("In-flight stop did not finish within the shutdown grace period");
    }
    coordinator_task.abort();

    let socket_path = config_store.current().await.socket_path.clone();
    if socket_path.exists() {
        if let Err(e) = std::fs::remove_file(&socket_path) {
            warn!(error = %e, "Failed to remove socket file");
        }
    }

    info!("Shutdown complete");
    Ok(ExitCode::SUCCESS)
}

/// Surface any restart bookkeeping an external restarter left on the
/// instance (the agent reads these mirror tags but never writes them).
async fn log_restart_history(provider: &dyn Provider, prefix: &str) {
    let tags = match provider.read_external_tags(Some(prefix)).await {
        Ok(tags) => tags,
        Err(e) => {
            warn!(error = %e, "Could not read instance tags");
            return;
        }
    };

    let restarted_by = tags.get(&format!("{prefix}:RestartedBy"));
    let restarted_at = tags.get(&format!("{prefix}:RestartTimestamp"));
    let restart_reason = tags.get(&format!("{prefix}:RestartReason"));
    if restarted_by.is_some() || restarted_at.is_some() {
        info!(
            by = restarted_by.map(String::as_str).unwrap_or("unknown"),
            at = restarted_at.map(String::as_str).unwrap_or("unknown"),
            reason = restart_reason.map(String::as_str).unwrap_or(""),
            "Instance was previously restarted by an external service"
        );
    }
}
