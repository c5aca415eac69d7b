use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::collector::Dimension;
use crate::events::SnoozeEvent;
use crate::provider::InstanceIdentity;
use crate::sampler::Snapshot;

pub const ERR_PARSE: &str = "parse-error";
pub const ERR_UNKNOWN_COMMAND: &str = "unknown-command";
pub const ERR_NOT_IMPLEMENTED: &str = "not-implemented";
pub const ERR_INTERNAL: &str = "internal-error";

pub const DEFAULT_HISTORY_LIMIT: usize = 10;
pub const MAX_HISTORY_LIMIT: usize = 100;

/// One JSON request per connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

/// One JSON response back: `{success: true, data}` or
/// `{success: false, error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self {
                success: true,
                data: Some(value),
                error: None,
            },
            Err(e) => Self::err(format!("{ERR_INTERNAL}: {e}")),
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// STATUS payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusData {
    pub version: String,
    pub state: String,
    pub idle_since: Option<DateTime<Utc>>,
    /// Would a stop fire within one more tick?
    pub should_snooze: bool,
    pub snooze_reason: Option<String>,
    pub snapshot: Option<Snapshot>,
    pub instance: Option<InstanceIdentity>,
    /// "ok" or "identity-unknown".
    pub identity_status: String,
    /// "ok", "permission-missing", or "unchecked".
    pub permission_status: String,
    pub sampler_running: bool,
    pub persistent_probe_failures: Vec<Dimension>,
}

/// HISTORY parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryParams {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
}

/// HISTORY payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryData {
    pub events: Vec<SnoozeEvent>,
    pub count: usize,
}

/// SIMULATE parameters: a pseudo-snapshot to evaluate against the
/// active thresholds. Absent fields default to zero readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulateParams {
    pub snapshot: Snapshot,
}

/// SIMULATE payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulateData {
    pub would_idle: bool,
    pub detail: String,
}

/// START/STOP/RESTART payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerControlData {
    pub running: bool,
}
