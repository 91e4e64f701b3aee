use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque visitor token handed out by the remote collector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnonymousIdentity(String);

impl AnonymousIdentity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AnonymousIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One recorded arrival at a stand.
///
/// Serialized as `{"stand": 3, "ts": "<rfc3339>"}`, which is both the durable
/// layout and the wire layout of the completion report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visit {
    #[serde(rename = "stand")]
    pub checkpoint: u32,
    #[serde(rename = "ts")]
    pub observed_at: DateTime<Utc>,
}

impl Visit {
    pub fn new(checkpoint: u32, observed_at: DateTime<Utc>) -> Self {
        Self {
            checkpoint,
            observed_at,
        }
    }
}

/// A completion report that has been built but not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingReport {
    #[serde(rename = "reportId", default = "Uuid::new_v4")]
    pub report_id: Uuid,
    #[serde(rename = "anonId")]
    pub identity: AnonymousIdentity,
    pub visits: Vec<Visit>,
    #[serde(rename = "ts")]
    pub queued_at: DateTime<Utc>,
    /// Failed delivery attempts so far, including the initial one.
    #[serde(default)]
    pub attempts: u32,
    #[serde(rename = "lastAttemptAt", default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl PendingReport {
    pub fn new(identity: AnonymousIdentity, visits: Vec<Visit>, queued_at: DateTime<Utc>) -> Self {
        Self {
            report_id: Uuid::new_v4(),
            identity,
            visits,
            queued_at,
            attempts: 1,
            last_attempt_at: Some(queued_at),
        }
    }
}

/// Why a scan did not add a visit to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    OutOfRange,
    Duplicate,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OutOfRange => "out_of_range",
            Self::Duplicate => "duplicate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOutcome {
    pub recorded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<SkipReason>,
}

impl ScanOutcome {
    pub fn recorded() -> Self {
        Self {
            recorded: true,
            reason: None,
        }
    }

    pub fn skipped(reason: SkipReason) -> Self {
        Self {
            recorded: false,
            reason: Some(reason),
        }
    }
}

/// Read-only snapshot of the visitor's progress, one entry per stand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressView {
    pub identity: Option<AnonymousIdentity>,
    pub unique_count: usize,
    pub stand_count: u32,
    pub stands: Vec<(u32, bool)>,
    pub reported: bool,
    pub pending_reports: usize,
}

impl ProgressView {
    pub fn is_complete(&self) -> bool {
        self.unique_count == self.stand_count as usize
    }
}
