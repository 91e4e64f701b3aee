use super::DurableStore;
use crate::core::{AnonymousIdentity, PendingReport, Result, Visit};
use std::sync::Arc;
use tracing::{debug, warn};

pub const ANON_ID_KEY: &str = "anonId";
pub const VISITS_KEY: &str = "visits";
pub const REPORTED_KEY: &str = "reported";
pub const PENDING_REPORTS_KEY: &str = "pendingReports";

const REPORT_ID_FIELD: &str = "reportId";

/// Typed view over the four durable keys the tracker owns.
///
/// Cloning is cheap; every clone talks to the same underlying store.
#[derive(Clone)]
pub struct TrackerState {
    store: Arc<dyn DurableStore>,
}

impl TrackerState {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub fn identity(&self) -> Result<Option<AnonymousIdentity>> {
        Ok(self
            .store
            .get(ANON_ID_KEY)?
            .filter(|value| !value.trim().is_empty())
            .map(AnonymousIdentity::new))
    }

    pub fn set_identity(&self, identity: &AnonymousIdentity) -> Result<()> {
        self.store.set(ANON_ID_KEY, identity.as_str())
    }

    /// Stored visits. A corrupt value reads as an empty ledger.
    pub fn visits(&self) -> Result<Vec<Visit>> {
        let Some(raw) = self.store.get(VISITS_KEY)? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&raw) {
            Ok(visits) => Ok(visits),
            Err(err) => {
                warn!(error = %err, "stored visits are unreadable, starting from an empty ledger");
                Ok(Vec::new())
            }
        }
    }

    pub fn set_visits(&self, visits: &[Visit]) -> Result<()> {
        let encoded = serde_json::to_string(visits)?;
        self.store.set(VISITS_KEY, &encoded)
    }

    pub fn reported(&self) -> Result<bool> {
        Ok(self.store.get(REPORTED_KEY)?.as_deref() == Some("true"))
    }

    pub fn set_reported(&self) -> Result<()> {
        self.store.set(REPORTED_KEY, "true")
    }

    /// Queued reports. Unlike visits, a corrupt queue is an error: dropping it
    /// would lose reports that were never acknowledged.
    ///
    /// Entries stored without a `reportId` get one here, and the queue is
    /// written back so the id stays stable across reads.
    pub fn pending_reports(&self) -> Result<Vec<PendingReport>> {
        let Some(raw) = self.store.get(PENDING_REPORTS_KEY)? else {
            return Ok(Vec::new());
        };
        let value: serde_json::Value = serde_json::from_str(&raw)?;
        let missing_ids = value.as_array().map_or(0, |entries| {
            entries
                .iter()
                .filter(|entry| entry.get(REPORT_ID_FIELD).is_none())
                .count()
        });
        let reports: Vec<PendingReport> = serde_json::from_value(value)?;
        if missing_ids > 0 {
            debug!(missing_ids, "assigning ids to queued reports");
            self.set_pending_reports(&reports)?;
        }
        Ok(reports)
    }

    pub fn set_pending_reports(&self, reports: &[PendingReport]) -> Result<()> {
        if reports.is_empty() {
            return self.store.remove(PENDING_REPORTS_KEY);
        }
        let encoded = serde_json::to_string(reports)?;
        self.store.set(PENDING_REPORTS_KEY, &encoded)
    }

    pub fn clear(&self) -> Result<()> {
        self.store.clear()
    }
}
