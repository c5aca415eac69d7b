use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::provider::InstanceIdentity;
use crate::sampler::Snapshot;

/// Outcome of one stop attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventResult {
    Succeeded,
    FailedPermission,
    FailedApi,
    AbortedRace,
}

/// One stop attempt: why the agent acted, what it saw, what happened.
/// Records are append-only; one JSON object per line on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnoozeEvent {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub instance: Option<InstanceIdentity>,
    pub reason: String,
    pub snapshot: Snapshot,
    pub tags: BTreeMap<String, String>,
    pub result: EventResult,
    /// True when tagging was requested but some tag writes failed; the
    /// stop still proceeded.
    #[serde(default)]
    pub tag_partial: bool,
}

struct LogInner {
    ring: VecDeque<SnoozeEvent>,
    capacity: usize,
    file: File,
}

/// Append-only event store: a JSONL file for durability plus a bounded
/// in-memory ring for HISTORY reads. Oldest records beyond capacity are
/// dropped from the ring (the file keeps growing; rotation is external).
pub struct EventLog {
    inner: RwLock<LogInner>,
}

impl EventLog {
    /// Open (or create) the log at `path` and seed the ring with the
    /// newest `capacity` records already on disk.
    pub fn open(path: &Path, capacity: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut ring = VecDeque::with_capacity(capacity);
        if path.exists() {
            let reader = BufReader::new(
                File::open(path).with_context(|| format!("failed to open {}", path.display()))?,
            );
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<SnoozeEvent>(&line) {
                    Ok(event) => {
                        if ring.len() == capacity {
                            ring.pop_front();
                        }
                        ring.push_back(event);
                    }
                    Err(e) => {
                        warn!(error = %e, "Skipping unreadable event record");
                    }
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open {} for append", path.display()))?;

        Ok(Self {
            inner: RwLock::new(LogInner {
                ring,
                capacity,
                file,
            }),
        })
    }

    /// Append one event, durable before return. The coordinator must not
    /// report success until this completes.
    pub async fn append(&self, event: &SnoozeEvent) -> Result<()> {
        let line = serde_json::to_string(event).context("failed to encode event")?;

        let mut inner = self.inner.write().await;
        // Blocking write + fsync of one short line; fine at this rate.
        inner.file.write_all(line.as_bytes())?;
        inner.file.write_all(b"\n")?;
        inner.file.sync_data().context("failed to sync event log")?;

        if inner.ring.len() == inner.capacity {
            inner.ring.pop_front();
        }
        inner.ring.push_back(event.clone());
        Ok(())
    }

    /// Newest-first events, bounded by `limit`, optionally only those at
    /// or after `since`.
    pub async fn recent(&self, limit: usize, since: Option<DateTime<Utc>>) -> Vec<SnoozeEvent> {
        let inner = self.inner.read().await;
        inner
            .ring
            .iter()
            .rev()
            .filter(|e| since.is_none_or(|s| e.at >= s))
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.ring.len()
    }
}
