use crate::core::{AnonymousIdentity, Result, ScanOutcome, SkipReason, TrackerError, Visit};
use crate::storage::TrackerState;
use chrono::Utc;
use std::collections::HashSet;
use tokio::sync::broadcast;
use tracing::{Level, event};

const CHANGE_CHANNEL_CAPACITY: usize = 16;

/// Published after every successful ledger mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerChange {
    pub identity: AnonymousIdentity,
    pub previous_unique: usize,
    pub unique_count: usize,
    pub visits: Vec<Visit>,
}

impl LedgerChange {
    /// True only for the mutation that moved the ledger from N-1 to N stands.
    pub fn completes(&self, stand_count: u32) -> bool {
        let target = stand_count as usize;
        self.unique_count == target && self.previous_unique + 1 == target
    }
}

/// Session-owned record of stand visits, mirrored to the durable store after
/// every mutation. At most one visit per stand; the first recording wins.
pub struct VisitLedger {
    state: TrackerState,
    stand_count: u32,
    visits: Vec<Visit>,
    changes: broadcast::Sender<LedgerChange>,
}

impl VisitLedger {
    /// Rehydrates the ledger from the store.
    pub fn load(state: TrackerState, stand_count: u32) -> Result<Self> {
        let visits = state.visits()?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            state,
            stand_count,
            visits,
            changes,
        })
    }

    /// Subscribes to ledger mutations.
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerChange> {
        self.changes.subscribe()
    }

    pub fn visits(&self) -> &[Visit] {
        &self.visits
    }

    pub fn has_visited(&self, checkpoint: u32) -> bool {
        self.visits.iter().any(|v| v.checkpoint == checkpoint)
    }

    /// Number of distinct stands in the ledger.
    pub fn unique_count(&self) -> usize {
        self.visits
            .iter()
            .map(|v| v.checkpoint)
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn is_complete(&self) -> bool {
        self.unique_count() == self.stand_count as usize
    }

    /// Records a visit to `checkpoint` for `identity`.
    ///
    /// Out-of-range input fails with [`TrackerError::InvalidCheckpoint`] and
    /// leaves the ledger untouched. A repeated stand is a no-op reported as
    /// [`SkipReason::Duplicate`] and publishes nothing.
    pub fn record_visit(
        &mut self,
        identity: &AnonymousIdentity,
        checkpoint: i64,
    ) -> Result<ScanOutcome> {
        let stand = match u32::try_from(checkpoint) {
            Ok(stand) if (1..=self.stand_count).contains(&stand) => stand,
            _ => {
                return Err(TrackerError::InvalidCheckpoint {
                    checkpoint,
                    max: self.stand_count,
                });
            }
        };

        if self.has_visited(stand) {
            event!(Level::DEBUG, stand, "stand already recorded");
            return Ok(ScanOutcome::skipped(SkipReason::Duplicate));
        }

        let previous_unique = self.unique_count();
        self.visits.push(Visit::new(stand, Utc::now()));
        if let Err(err) = self.state.set_visits(&self.visits) {
            self.visits.pop();
            return Err(err);
        }

        let change = LedgerChange {
            identity: identity.clone(),
            previous_unique,
            unique_count: self.unique_count(),
            visits: self.visits.clone(),
        };
        event!(
            Level::INFO,
            stand,
            unique = change.unique_count,
            of = self.stand_count,
            "visit recorded"
        );
        // Fails only when nobody subscribed.
        let _ = self.changes.send(change);
        Ok(ScanOutcome::recorded())
    }

    /// Drops the in-memory visits after the store was cleared.
    pub fn reset(&mut self) {
        self.visits.clear();
    }
}
