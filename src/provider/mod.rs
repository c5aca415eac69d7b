pub mod aws;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Hard timeout for metadata-service reads.
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(2);

/// Hard timeout for control-plane calls (stop, tag, describe).
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("instance identity unavailable: {0}")]
    IdentityUnavailable(String),

    #[error("provider operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider api error: {0}")]
    Api(String),

    #[error("no provider detected and none configured")]
    NoneDetected,

    #[error("unknown provider {0:?}")]
    Unknown(String),

    #[error("provider configuration invalid: {0}")]
    Config(String),
}

impl ProviderError {
    /// Timeouts and generic API errors are worth another attempt;
    /// everything else is deterministic.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Timeout(_) | ProviderError::Api(_))
    }
}

/// The provider's stable identity for the running host, plus enough
/// locality to address it through the control plane. Immutable after
/// the first successful discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceIdentity {
    pub instance_id: String,
    pub instance_type: String,
    pub region: String,
    pub provider: String,
}

/// Outcome of the permission pre-flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionStatus {
    Ok,
    MissingRead,
    MissingStop,
    MissingTag,
}

impl PermissionStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, PermissionStatus::Ok)
    }
}

/// A concrete cloud platform behind five operations. Implementations
/// retry transient failures internally (bounded backoff) and enforce the
/// per-operation timeouts, so callers see each operation as a single
/// bounded call.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Query metadata/identity services; the first success is cached for
    /// the lifetime of the process. Fails with `IdentityUnavailable`
    /// only when no cached value exists.
    async fn discover_identity(&self) -> Result<InstanceIdentity, ProviderError>;

    /// The cached identity, without touching the metadata service.
    async fn cached_identity(&self) -> Option<InstanceIdentity>;

    /// Read-only probe plus, when `tag_probe` carries the tag prefix, a
    /// no-op tag create+delete. Never called on the hot path.
    async fn verify_permissions(
        &self,
        tag_probe: Option<&str>,
    ) -> Result<PermissionStatus, ProviderError>;

    /// Set/overwrite tags on the running instance. Idempotent.
    async fn apply_tags(&self, tags: &BTreeMap<String, String>) -> Result<(), ProviderError>;

    /// Ask the platform to stop this instance. Idempotent with respect
    /// to an already-stopped instance.
    async fn stop_instance(&self) -> Result<(), ProviderError>;

    /// All tags currently on the instance, optionally filtered to a
    /// key prefix.
    async fn read_external_tags(
        &self,
        prefix: Option<&str>,
    ) -> Result<BTreeMap<String, String>, ProviderError>;
}

/// Retry policy for transient provider failures: bounded exponential
/// backoff, max 4 attempts, ~10 s total wait cap.
const MAX_ATTEMPTS: u32 = 4;
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_TOTAL_CAP: Duration = Duration::from_secs(10);

/// Run `op` up to `MAX_ATTEMPTS` times, sleeping between attempts with
/// jittered exponential backoff. Non-transient errors abort immediately.
pub(crate) async fn retry<T, F>(op_name: &str, mut op: F) -> Result<T, ProviderError>
where
    F: AsyncFnMut() -> Result<T, ProviderError>,
{
    let mut waited = Duration::ZERO;

    for attempt in 1..=MAX_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                use rand::RngExt;
                let backoff = BACKOFF_BASE * 2u32.pow(attempt - 1);
                let jitter = Duration::from_millis(rand::rng().random_range(0..100));
                let delay = (backoff + jitter).min(BACKOFF_TOTAL_CAP.saturating_sub(waited));
                warn!(op = op_name, attempt, error = %e, delay_ms = delay.as_millis() as u64, "Provider operation failed, retrying");
                tokio::time::sleep(delay).await;
                waited += delay;
            }
            Err(e) => return Err(e),
        }
    }

    unreachable!("loop returns on final attempt")
}

/// Compile-time set of provider implementations, keyed by name, each
/// with a low-cost detection probe. Configuration picks one by name, or
/// "auto" polls every probe and takes the first positive.
pub struct ProviderRegistry;

struct Registered {
    name: &'static str,
    detect: fn() -> BoxFuture<'static, bool>,
    build: fn(serde_json::Value) -> BoxFuture<'static, Result<Box<dyn Provider>, ProviderError>>,
}

static REGISTRY: &[Registered] = &[Registered {
    name: "aws",
    detect: || Box::pin(aws::AwsProvider::detect()),
    build: |config| Box::pin(async move { aws::AwsProvider::build(&config).await }),
}];

impl ProviderRegistry {
    pub fn names() -> Vec<&'static str> {
        REGISTRY.iter().map(|r| r.name).collect()
    }

    /// Poll each registered provider's probe and return the first that
    /// answers positively.
    pub async fn detect() -> Option<&'static str> {
        for registered in REGISTRY {
            debug!(provider = registered.name, "Probing provider");
            if (registered.detect)().await {
                return Some(registered.name);
            }
        }
        None
    }

    /// Resolve `name` ("auto" to detect) into a concrete adapter.
    pub async fn resolve(
        name: &str,
        config: serde_json::Value,
    ) -> Result<Box<dyn Provider>, ProviderError> {
        let name = if name == "auto" {
            ProviderRegistry::detect()
                .await
                .ok_or(ProviderError::NoneDetected)?
        } else {
            name
        };

        let registered = REGISTRY
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| ProviderError::Unknown(name.to_string()))?;

        (registered.build)(config).await
    }
}
