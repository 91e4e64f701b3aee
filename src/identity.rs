use crate::collector::Collector;
use crate::core::{AnonymousIdentity, Result};
use crate::storage::TrackerState;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

/// Resolves the visitor's anonymous identity, asking the collector at most
/// once per store lifetime.
pub struct IdentityManager {
    state: TrackerState,
    collector: Arc<dyn Collector>,
}

impl IdentityManager {
    pub fn new(state: TrackerState, collector: Arc<dyn Collector>) -> Self {
        Self { state, collector }
    }

    /// Returns the cached identity, or obtains and persists a new one.
    ///
    /// A cache hit performs no network call and no write.
    pub async fn ensure_identity(&self) -> Result<AnonymousIdentity> {
        if let Some(identity) = self.state.identity()? {
            return Ok(identity);
        }

        let identity = self
            .collector
            .request_identity()
            .instrument(info_span!("tracker.identity.assign"))
            .await
            .inspect_err(|err| {
                event!(Level::WARN, error = %err, "identity assignment failed");
            })?;
        self.state.set_identity(&identity)?;
        event!(Level::INFO, anon_id = %identity, "identity assigned");
        Ok(identity)
    }
}
