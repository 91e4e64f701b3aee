//! Remote collector seam.
//!
//! The collector hands out anonymous identities and accepts completion
//! reports. Responses are decoded into explicit schemas; anything that does
//! not match is a failure.

pub mod http;
pub mod in_memory;

pub use http::HttpCollector;
pub use in_memory::InMemoryCollector;

use crate::core::{AnonymousIdentity, DeliveryFailure, Result, TrackerError, Visit};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const NEW_ANON_ACTION: &str = "newAnon";
pub const REPORT_COMPLETE_ACTION: &str = "reportComplete";

/// Trait for the remote endpoint that assigns identities and collects reports.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Requests a fresh anonymous identity.
    ///
    /// Fails with [`TrackerError::IdentityAssignment`] when the collector is
    /// unreachable or does not return a positive identifier.
    async fn request_identity(&self) -> Result<AnonymousIdentity>;

    /// Sends one completion report. `Ok` means the collector acknowledged it.
    async fn report_completion(
        &self,
        payload: &CompletionPayload,
    ) -> std::result::Result<(), DeliveryFailure>;

    /// Cheap reachability check used by the connectivity monitor.
    async fn probe(&self) -> bool {
        true
    }
}

/// Body of a `reportComplete` POST.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionPayload {
    pub action: String,
    #[serde(rename = "anonId")]
    pub identity: AnonymousIdentity,
    pub visits: Vec<Visit>,
    pub timestamp: DateTime<Utc>,
}

impl CompletionPayload {
    pub fn new(identity: AnonymousIdentity, visits: Vec<Visit>, timestamp: DateTime<Utc>) -> Self {
        Self {
            action: REPORT_COMPLETE_ACTION.to_string(),
            identity,
            visits,
            timestamp,
        }
    }
}

/// Response of `GET ?action=newAnon`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewAnonResponse {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
}

impl NewAnonResponse {
    pub fn into_identity(self) -> Result<AnonymousIdentity> {
        match self.id.as_ref().and_then(serde_json::Value::as_u64) {
            Some(id) if id > 0 => Ok(AnonymousIdentity::new(id.to_string())),
            _ => Err(TrackerError::IdentityAssignment(format!(
                "collector returned no positive id (got {})",
                self.id
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "nothing".to_string())
            ))),
        }
    }
}

/// Acknowledgment schema of a completion report.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CollectorAck {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub status: Option<String>,
}

impl CollectorAck {
    pub fn acknowledged(&self) -> bool {
        self.success == Some(true) || self.status.as_deref() == Some("ok")
    }
}

/// Decodes a report response body into an acknowledgment decision.
pub fn parse_ack(body: &str) -> std::result::Result<(), DeliveryFailure> {
    let ack: CollectorAck =
        serde_json::from_str(body).map_err(|e| DeliveryFailure::Malformed(e.to_string()))?;
    if ack.acknowledged() {
        Ok(())
    } else {
        Err(DeliveryFailure::Rejected)
    }
}
