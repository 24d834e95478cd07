// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, error};

/// Closed catalog of event kinds the engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A record was built and appended to the chain.
    RecordCreated,
    /// A record was submitted to the tax authority.
    RecordSubmitted,
    /// The tax authority accepted a submission.
    RecordAccepted,
    /// The tax authority rejected a submission.
    RecordRejected,
    /// A transport-level failure occurred during submission.
    TransmissionFailed,
    /// The operating mode was locked.
    ModeLocked,
    /// The contingency manager changed state.
    ContingencyTransition,
    /// A reconciliation attempt ran.
    ReconciliationRan,
    /// A recovery pointer was written.
    RecoveryPointerSet,
}

/// Severity of a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Diagnostic detail, not normally surfaced.
    Debug,
    /// Routine operational fact.
    Info,
    /// Attention warranted but no action required.
    Warning,
    /// An error condition occurred.
    Error,
    /// A condition requiring immediate operator attention.
    Critical,
}

/// A single append-only audit entry.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Event {
    /// Kind of event.
    pub event_type: EventType,
    /// Severity level.
    pub severity: Severity,
    /// Human-readable message.
    pub message: String,
    /// Structured, freeform details.
    #[serde(default)]
    pub details: BTreeMap<String, String>,
    /// Sequence number of the record this event relates to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_sequence: Option<u64>,
    /// When the event was recorded.
    pub timestamp: DateTime<FixedOffset>,
}

/// Errors from writing to or reading the event log.
#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    /// The underlying file could not be written or read.
    #[error("event log I/O error: {0}")]
    Io(String),
    /// A stored event line could not be deserialized.
    #[error("corrupt event log entry: {0}")]
    Corrupt(String),
}

/// Filter parameters for [`EventLog::query`].
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Restrict to this event type, if set.
    pub event_type: Option<EventType>,
    /// Restrict to events at or above this severity, if set.
    pub min_severity: Option<Severity>,
    /// Restrict to events at or after this instant, if set.
    pub since: Option<DateTime<FixedOffset>>,
    /// Restrict to events related to this record sequence number, if set.
    pub record_sequence: Option<u64>,
}

/// Append-only audit stream. `log` is the sole write surface; there is no
/// update or delete, mirroring `abp_policy::audit::PolicyAuditor`'s
/// write-once `record` method.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append a new event.
    async fn log(&self, event: Event) -> Result<(), EventLogError>;

    /// Query events matching `filter`, newest first.
    async fn query(&self, filter: &EventFilter) -> Result<Vec<Event>, EventLogError>;
}

/// An [`EventLog`] backed by a single newline-delimited JSON file, with an
/// in-memory mirror for fast querying — the split `abp-daemon::AppState`
/// uses between its `receipts` index and `receipts_dir` durable storage.
pub struct FileEventLog {
    path: PathBuf,
    events: RwLock<Vec<Event>>,
}

impl FileEventLog {
    /// Open (creating if absent) an event log backed by `path`, replaying
    /// any existing entries into memory.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, EventLogError> {
        let path = path.as_ref().to_path_buf();
        let mut events = Vec::new();
        if let Ok(content) = fs::read_to_string(&path).await {
            for (line_no, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let event: Event = serde_json::from_str(line).map_err(|e| {
                    EventLogError::Corrupt(format!("line {}: {e}", line_no + 1))
                })?;
                events.push(event);
            }
        }
        debug!(count = events.len(), "replayed event log");
        Ok(Self {
            path,
            events: RwLock::new(events),
        })
    }
}

#[async_trait]
impl EventLog for FileEventLog {
    async fn log(&self, event: Event) -> Result<(), EventLogError> {
        let mut line = serde_json::to_string(&event)
            .map_err(|e| EventLogError::Io(e.to_string()))?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| EventLogError::Io(e.to_string()))?;
        {
            use tokio::io::AsyncWriteExt;
            file.write_all(line.as_bytes())
                .await
                .map_err(|e| EventLogError::Io(e.to_string()))?;
        }

        self.events.write().await.push(event);
        Ok(())
    }

    async fn query(&self, filter: &EventFilter) -> Result<Vec<Event>, EventLogError> {
        let events = self.events.read().await;
        let mut matched: Vec<Event> = events
            .iter()
            .filter(|e| {
                filter.event_type.map_or(true, |t| e.event_type == t)
                    && filter.min_severity.map_or(true, |s| e.severity >= s)
                    && filter.since.map_or(true, |since| e.timestamp >= since)
                    && filter
                        .record_sequence
                        .map_or(true, |seq| e.record_sequence == Some(seq))
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(matched)
    }
}

/// Log a [`Severity::Critical`] event and also emit a `tracing::error!` so
/// it surfaces in process logs even if the durable store is unavailable.
pub async fn escalate(log: &dyn EventLog, event_type: EventType, message: impl Into<String>, now: DateTime<FixedOffset>) {
    let message = message.into();
    error!(%message, ?event_type, "critical event");
    let event = Event {
        event_type,
        severity: Severity::Critical,
        message,
        details: BTreeMap::new(),
        record_sequence: None,
        timestamp: now,
    };
    if let Err(e) = log.log(event).await {
        error!(error = %e, "failed to persist critical event");
    }
}
