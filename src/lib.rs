// ============================================================================
// Stand Tracker Library
// ============================================================================

pub mod core;
pub mod storage;
pub mod config;
pub mod collector;
pub mod identity;
pub mod ledger;
pub mod delivery;
pub mod reconnect;
pub mod tracker;

// Re-export main types for convenience
pub use crate::core::{
    AnonymousIdentity, DeliveryFailure, PendingReport, ProgressView, Result, ScanOutcome,
    SkipReason, TrackerError, Visit,
};
pub use config::{ReplayPolicy, TrackerConfig};
pub use storage::{DurableStore, FileStore, MemoryStore, TrackerState};
pub use collector::{Collector, CollectorAck, CompletionPayload, HttpCollector, InMemoryCollector};
pub use identity::IdentityManager;
pub use ledger::{LedgerChange, VisitLedger};
pub use delivery::{DeliveryEngine, DeliveryOutcome, ReplaySummary};
pub use reconnect::{
    BackgroundTask, ReconnectEvents, ReconnectSignal, spawn_connectivity_monitor,
    spawn_replay_worker,
};
pub use tracker::{StandTracker, TrackerStatus, parse_checkpoint_param};

/// Builds a tracker with an in-memory store and collector.
///
/// Handy for demos and for exercising the state machine without a network.
///
/// # Examples
///
/// ```
/// use stand_tracker::{InMemoryCollector, in_memory_tracker};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// # tokio_test::block_on(async {
/// let collector = InMemoryCollector::new();
/// let mut tracker = in_memory_tracker(collector.clone(), 2)?;
///
/// tracker.start(Some(1)).await?;
/// tracker.scan(2).await?;
///
/// assert!(tracker.is_reported()?);
/// assert_eq!(collector.accepted_reports().len(), 1);
/// # Ok::<(), stand_tracker::TrackerError>(())
/// # })?;
/// # Ok(())
/// # }
/// ```
pub fn in_memory_tracker(collector: InMemoryCollector, stand_count: u32) -> Result<StandTracker> {
    StandTracker::new(
        std::sync::Arc::new(MemoryStore::new()),
        std::sync::Arc::new(collector),
        stand_count,
        ReplayPolicy::immediate(),
    )
}
