use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_ec2::error::ProvideErrorMetadata;
use aws_sdk_ec2::types::{Filter, Tag};
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{
    retry, InstanceIdentity, PermissionStatus, Provider, ProviderError, CONTROL_TIMEOUT,
    METADATA_TIMEOUT,
};

const IMDS_BASE: &str = "http://169.254.169.254";
const IMDS_TOKEN_TTL_SECS: &str = "21600";

/// Probe timeout for auto-detection; a real EC2 host answers the token
/// endpoint in single-digit milliseconds.
const DETECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Adapter-specific settings carried in the `provider_config` blob.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AwsSettings {
    /// Region override; when absent the SDK's default chain resolves it
    /// (env, profile, or IMDS).
    pub region: Option<String>,

    /// Metadata service base URL override.
    pub imds_base_url: Option<String>,
}

impl AwsSettings {
    pub fn parse(config: &serde_json::Value) -> Result<Self, ProviderError> {
        if config.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(config.clone())
            .map_err(|e| ProviderError::Config(format!("aws provider_config: {e}")))
    }
}

/// AWS EC2 adapter: identity via IMDSv2, control plane via the EC2 API.
pub struct AwsProvider {
    ec2: aws_sdk_ec2::Client,
    http: reqwest::Client,
    imds_base: String,
    // Read-mostly; written once by the first successful discovery.
    identity: RwLock<Option<InstanceIdentity>>,
}

/// The subset of the instance identity document the agent needs.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityDocument {
    instance_id: String,
    instance_type: String,
    region: String,
}

impl AwsProvider {
    /// Low-cost detection probe: can we fetch an IMDSv2 token quickly?
    pub async fn detect() -> bool {
        let client = match reqwest::Client::builder().timeout(DETECT_TIMEOUT).build() {
            Ok(c) => c,
            Err(_) => return false,
        };
        client
            .put(format!("{IMDS_BASE}/latest/api/token"))
            .header("X-aws-ec2-metadata-token-ttl-seconds", IMDS_TOKEN_TTL_SECS)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    pub async fn build(config: &serde_json::Value) -> Result<Box<dyn Provider>, ProviderError> {
        let settings = AwsSettings::parse(config)?;

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = settings.region.clone() {
            loader = loader.region(aws_config::Region::new(region));
        }
        let sdk_config = loader.load().await;

        let http = reqwest::Client::builder()
            .timeout(METADATA_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Config(format!("http client: {e}")))?;

        info!(
            region = sdk_config.region().map(|r| r.as_ref()).unwrap_or("unresolved"),
            "AWS provider initialized"
        );

        Ok(Box::new(Self {
            ec2: aws_sdk_ec2::Client::new(&sdk_config),
            http,
            imds_base: settings
                .imds_base_url
                .unwrap_or_else(|| IMDS_BASE.to_string()),
            identity: RwLock::new(None),
        }))
    }

    async fn fetch_identity_document(&self) -> Result<IdentityDocument, ProviderError> {
        let token = self
            .http
            .put(format!("{}/latest/api/token", self.imds_base))
            .header("X-aws-ec2-metadata-token-ttl-seconds", IMDS_TOKEN_TTL_SECS)
            .send()
            .await
            .map_err(classify_reqwest)?
            .error_for_status()
            .map_err(classify_reqwest)?
            .text()
            .await
            .map_err(classify_reqwest)?;

        let document = self
            .http
            .get(format!(
                "{}/latest/dynamic/instance-identity/document",
                self.imds_base
            ))
            .header("X-aws-ec2-metadata-token", token.trim())
            .send()
            .await
            .map_err(classify_reqwest)?
            .error_for_status()
            .map_err(classify_reqwest)?
            .json::<IdentityDocument>()
            .await
            .map_err(classify_reqwest)?;

        Ok(document)
    }

    async fn instance_id(&self) -> Result<String, ProviderError> {
        Ok(self.discover_identity().await?.instance_id)
    }
}

fn classify_reqwest(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(METADATA_TIMEOUT)
    } else {
        ProviderError::Api(e.to_string())
    }
}

fn is_unauthorized(code: Option<&str>) -> bool {
    matches!(
        code,
        Some("UnauthorizedOperation") | Some("AccessDenied") | Some("AuthFailure")
    )
}

/// StopInstances against an instance that is already stopped succeeds
/// outright; `IncorrectInstanceState` only appears for states where a
/// stop cannot apply at all, which for this agent's purposes is done.
fn stop_already_effective(code: Option<&str>) -> bool {
    matches!(code, Some("IncorrectInstanceState"))
}

#[async_trait]
impl Provider for AwsProvider {
    fn name(&self) -> &'static str {
        "aws"
    }

    async fn discover_identity(&self) -> Result<InstanceIdentity, ProviderError> {
        if let Some(cached) = self.identity.read().await.clone() {
            return Ok(cached);
        }

        let document = retry("fetch_identity_document", async || {
            self.fetch_identity_document().await
        })
        .await
        .map_err(|e| ProviderError::IdentityUnavailable(e.to_string()))?;

        let identity = InstanceIdentity {
            instance_id: document.instance_id,
            instance_type: document.instance_type,
            region: document.region,
            provider: "aws".to_string(),
        };

        info!(
            instance_id = %identity.instance_id,
            instance_type = %identity.instance_type,
            region = %identity.region,
            "Instance identity discovered"
        );

        let mut cache = self.identity.write().await;
        // First discovery wins; identity is immutable afterwards.
        if cache.is_none() {
            *cache = Some(identity.clone());
        }
        Ok(identity)
    }

    async fn cached_identity(&self) -> Option<InstanceIdentity> {
        self.identity.read().await.clone()
    }

    async fn verify_permissions(
        &self,
        tag_probe: Option<&str>,
    ) -> Result<PermissionStatus, ProviderError> {
        let id = self.instance_id().await?;

        // Read probe
        match timeout(
            CONTROL_TIMEOUT,
            self.ec2.describe_instances().instance_ids(&id).send(),
        )
        .await
        {
            Err(_) => return Err(ProviderError::Timeout(CONTROL_TIMEOUT)),
            Ok(Err(err)) => {
                if is_unauthorized(err.code()) {
                    return Ok(PermissionStatus::MissingRead);
                }
                return Err(ProviderError::Api(err.to_string()));
            }
            Ok(Ok(_)) => {}
        }

        // Stop probe: DryRun never stops anything. "DryRunOperation"
        // is the would-have-succeeded answer.
        match timeout(
            CONTROL_TIMEOUT,
            self.ec2
                .stop_instances()
                .instance_ids(&id)
                .dry_run(true)
                .send(),
        )
        .await
        {
            Err(_) => return Err(ProviderError::Timeout(CONTROL_TIMEOUT)),
            Ok(Err(err)) => match err.code() {
                Some("DryRunOperation") => {}
                code if is_unauthorized(code) => return Ok(PermissionStatus::MissingStop),
                _ => return Err(ProviderError::Api(err.to_string())),
            },
            Ok(Ok(_)) => {}
        }

        // Tag probe: create and remove a scratch key under our prefix.
        if let Some(prefix) = tag_probe {
            let probe_key = format!("{prefix}:PermissionCheck");

            match timeout(
                CONTROL_TIMEOUT,
                self.ec2
                    .create_tags()
                    .resources(&id)
                    .tags(Tag::builder().key(&probe_key).value("ok").build())
                    .send(),
            )
            .await
            {
                Err(_) => return Err(ProviderError::Timeout(CONTROL_TIMEOUT)),
                Ok(Err(err)) => {
                    if is_unauthorized(err.code()) {
                        return Ok(PermissionStatus::MissingTag);
                    }
                    return Err(ProviderError::Api(err.to_string()));
                }
                Ok(Ok(_)) => {}
            }

            let cleanup = timeout(
                CONTROL_TIMEOUT,
                self.ec2
                    .delete_tags()
                    .resources(&id)
                    .tags(Tag::builder().key(&probe_key).build())
                    .send(),
            )
            .await;
            if !matches!(cleanup, Ok(Ok(_))) {
                warn!(key = %probe_key, "Failed to remove permission probe tag");
            }
        }

        debug!("Permission pre-flight passed");
        Ok(PermissionStatus::Ok)
    }

    async fn apply_tags(&self, tags: &BTreeMap<String, String>) -> Result<(), ProviderError> {
        if tags.is_empty() {
            return Ok(());
        }
        let id = self.instance_id().await?;

        retry("create_tags", async || {
            let mut request = self.ec2.create_tags().resources(&id);
            for (key, value) in tags {
                request = request.tags(Tag::builder().key(key).value(value).build());
            }
            match timeout(CONTROL_TIMEOUT, request.send()).await {
                Err(_) => Err(ProviderError::Timeout(CONTROL_TIMEOUT)),
                Ok(Err(err)) => Err(ProviderError::Api(err.to_string())),
                Ok(Ok(_)) => Ok(()),
            }
        })
        .await
    }

    async fn stop_instance(&self) -> Result<(), ProviderError> {
        let id = self.instance_id().await?;

        retry("stop_instances", async || {
            match timeout(
                CONTROL_TIMEOUT,
                self.ec2.stop_instances().instance_ids(&id).send(),
            )
            .await
            {
                Err(_) => Err(ProviderError::Timeout(CONTROL_TIMEOUT)),
                Ok(Err(err)) => {
                    if stop_already_effective(err.code()) {
                        debug!(instance_id = %id, "Instance already stopping or stopped");
                        Ok(())
                    } else {
                        Err(ProviderError::Api(err.to_string()))
                    }
                }
                Ok(Ok(_)) => {
                    info!(instance_id = %id, "Stop requested");
                    Ok(())
                }
            }
        })
        .await
    }

    async fn read_external_tags(
        &self,
        prefix: Option<&str>,
    ) -> Result<BTreeMap<String, String>, ProviderError> {
        let id = self.instance_id().await?;

        let output = retry("describe_tags", async || {
            match timeout(
                CONTROL_TIMEOUT,
                self.ec2
                    .describe_tags()
                    .filters(Filter::builder().name("resource-id").values(&id).build())
                    .send(),
            )
            .await
            {
                Err(_) => Err(ProviderError::Timeout(CONTROL_TIMEOUT)),
                Ok(Err(err)) => Err(ProviderError::Api(err.to_string())),
                Ok(Ok(output)) => Ok(output),
            }
        })
        .await?;

        Ok(output
            .tags()
            .iter()
            .filter_map(|t| Some((t.key()?.to_string(), t.value()?.to_string())))
            .filter(|(k, _)| prefix.is_none_or(|p| k.starts_with(p)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_document_parses() {
        let raw = r#"{
            "accountId": "123456789012",
            "architecture": "x86_64",
            "availabilityZone": "us-west-2b",
            "instanceId": "i-0abcdef1234567890",
            "instanceType": "g5.xlarge",
            "region": "us-west-2",
            "version": "2017-09-30"
        }"#;
        let doc: IdentityDocument = serde_json::from_str(raw).unwrap();
        assert_eq!(doc.instance_id, "i-0abcdef1234567890");
        assert_eq!(doc.instance_type, "g5.xlarge");
        assert_eq!(doc.region, "us-west-2");
    }

    #[test]
    fn settings_parse_null_and_region() {
        let settings = AwsSettings::parse(&serde_json::Value::Null).unwrap();
        assert!(settings.region.is_none());

        let settings =
            AwsSettings::parse(&serde_json::json!({"region": "eu-central-1"})).unwrap();
        assert_eq!(settings.region.as_deref(), Some("eu-central-1"));
    }

    #[test]
    fn settings_reject_unknown_keys() {
        let err = AwsSettings::parse(&serde_json::json!({"regoin": "us-east-1"})).unwrap_err();
        assert!(matches!(err, ProviderError::Config(_)));
    }

    #[test]
    fn unauthorized_codes_classified() {
        assert!(is_unauthorized(Some("UnauthorizedOperation")));
        assert!(is_unauthorized(Some("AccessDenied")));
        assert!(!is_unauthorized(Some("DryRunOperation")));
        assert!(!is_unauthorized(None));
    }

    #[test]
    fn already_stopped_is_effective() {
        assert!(stop_already_effective(Some("IncorrectInstanceState")));
        assert!(!stop_already_effective(Some("UnauthorizedOperation")));
        assert!(!stop_already_effective(None));
    }
}
