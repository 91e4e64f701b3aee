use crate::collector::{Collector, HttpCollector};
use crate::config::{ReplayPolicy, TrackerConfig};
use crate::core::{
    AnonymousIdentity, ProgressView, Result, ScanOutcome, SkipReason, TrackerError,
};
use crate::delivery::{DeliveryEngine, DeliveryOutcome, ReplaySummary};
use crate::identity::IdentityManager;
use crate::ledger::{LedgerChange, VisitLedger};
use crate::storage::{DurableStore, FileStore, TrackerState};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{Level, event};

/// Human-readable state of the session, shown after every operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerStatus {
    Ready,
    Recorded(u32),
    AlreadyRecorded(u32),
    InvalidCode,
    ReportAcknowledged,
    ReportQueued,
    PendingSynced(usize),
    NothingPending,
    PendingStillQueued(usize),
    NetworkError,
    StorageError(String),
    CacheCleared,
}

impl fmt::Display for TrackerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => f.write_str("Ready"),
            Self::Recorded(stand) => write!(f, "Visit to stand {} recorded locally.", stand),
            Self::AlreadyRecorded(stand) => write!(f, "Stand {} was already recorded.", stand),
            Self::InvalidCode => f.write_str("Invalid code: unknown stand."),
            Self::ReportAcknowledged => f.write_str("Completion reported successfully!"),
            Self::ReportQueued => {
                f.write_str("Could not report now; the report will be retried when back online.")
            }
            Self::PendingSynced(1) => f.write_str("A pending report was synchronized."),
            Self::PendingSynced(n) => write!(f, "{} pending reports were synchronized.", n),
            Self::NothingPending => f.write_str("No pending reports."),
            Self::PendingStillQueued(n) => {
                write!(f, "{} pending report(s) could not be delivered yet.", n)
            }
            Self::NetworkError => {
                f.write_str("Network or server error. Will keep trying in the background...")
            }
            Self::StorageError(msg) => write!(f, "Local storage error: {}", msg),
            Self::CacheCleared => f.write_str("Cache cleared."),
        }
    }
}

/// Extracts the stand number from a scanned code.
///
/// Accepts a bare number (`"3"`) or anything carrying a `stand=` query
/// parameter (`"https://host/?stand=3"`, `"?a=1&stand=3"`).
pub fn parse_checkpoint_param(code: &str) -> Option<i64> {
    let code = code.trim();
    if let Ok(number) = code.parse::<i64>() {
        return Some(number);
    }

    let query = code.split_once('?').map_or(code, |(_, query)| query);
    let query = query.split('#').next().unwrap_or_default();
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "stand")
        .and_then(|(_, value)| value.trim().parse::<i64>().ok())
}

/// One visitor session: identity, ledger, delivery and status text.
///
/// All operations run to completion before the next one starts; the durable
/// store is written after every mutation and reread on construction.
pub struct StandTracker {
    state: TrackerState,
    stand_count: u32,
    identity: IdentityManager,
    ledger: VisitLedger,
    delivery: DeliveryEngine,
    changes: broadcast::Receiver<LedgerChange>,
    current: Option<AnonymousIdentity>,
    status: TrackerStatus,
    last_delivery: Option<DeliveryOutcome>,
}

impl StandTracker {
    pub fn new(
        store: Arc<dyn DurableStore>,
        collector: Arc<dyn Collector>,
        stand_count: u32,
        policy: ReplayPolicy,
    ) -> Result<Self> {
        if stand_count == 0 {
            return Err(TrackerError::Config("stand_count must be > 0".to_string()));
        }

        let state = TrackerState::new(store);
        let identity = IdentityManager::new(state.clone(), collector.clone());
        let ledger = VisitLedger::load(state.clone(), stand_count)?;
        let changes = ledger.subscribe();
        let delivery = DeliveryEngine::new(state.clone(), collector, policy, stand_count);
        let current = state.identity()?;

        Ok(Self {
            state,
            stand_count,
            identity,
            ledger,
            delivery,
            changes,
            current,
            status: TrackerStatus::Ready,
            last_delivery: None,
        })
    }

    /// File store in `config.data_dir`, HTTP collector at `config.collector_url`.
    pub fn from_config(config: &TrackerConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(FileStore::open(&config.data_dir)?);
        let collector = Arc::new(HttpCollector::new(config)?);
        Self::new(store, collector, config.stand_count, config.replay.clone())
    }

    pub fn status(&self) -> &TrackerStatus {
        &self.status
    }

    pub fn identity(&self) -> Option<&AnonymousIdentity> {
        self.current.as_ref()
    }

    pub fn unique_count(&self) -> usize {
        self.ledger.unique_count()
    }

    pub fn is_reported(&self) -> Result<bool> {
        self.state.reported()
    }

    pub fn pending_count(&self) -> Result<usize> {
        Ok(self.delivery.pending_reports()?.len())
    }

    /// Outcome of the most recent completion attempt triggered by a scan.
    pub fn last_delivery(&self) -> Option<&DeliveryOutcome> {
        self.last_delivery.as_ref()
    }

    /// Startup path: resolve the identity, then record `checkpoint` if given.
    ///
    /// Identity failures set the network status and are returned; nothing
    /// else is attempted in that case.
    pub async fn start(&mut self, checkpoint: Option<i64>) -> Result<Option<ScanOutcome>> {
        self.ensure_identity().await?;
        match checkpoint {
            Some(checkpoint) => self.scan(checkpoint).await.map(Some),
            None => Ok(None),
        }
    }

    /// Startup path for a raw scanned code. Unparsable codes only set the
    /// invalid-code status.
    pub async fn start_with_code(&mut self, code: &str) -> Result<Option<ScanOutcome>> {
        let parsed = parse_checkpoint_param(code);
        self.ensure_identity().await?;
        match parsed {
            Some(checkpoint) => self.scan(checkpoint).await.map(Some),
            None => {
                self.status = TrackerStatus::InvalidCode;
                Ok(Some(ScanOutcome::skipped(SkipReason::OutOfRange)))
            }
        }
    }

    pub async fn ensure_identity(&mut self) -> Result<AnonymousIdentity> {
        match self.identity.ensure_identity().await {
            Ok(identity) => {
                self.current = Some(identity.clone());
                Ok(identity)
            }
            Err(err) => {
                self.status = status_for_error(&err);
                Err(err)
            }
        }
    }

    /// Records a scan and, when it completes the set, attempts delivery.
    pub async fn scan(&mut self, checkpoint: i64) -> Result<ScanOutcome> {
        let identity = self.ensure_identity().await?;

        let outcome = match self.ledger.record_visit(&identity, checkpoint) {
            Ok(outcome) => outcome,
            Err(TrackerError::InvalidCheckpoint { checkpoint, max }) => {
                event!(Level::INFO, checkpoint, max, "scan outside stand range ignored");
                self.status = TrackerStatus::InvalidCode;
                return Ok(ScanOutcome::skipped(SkipReason::OutOfRange));
            }
            Err(err) => {
                self.status = status_for_error(&err);
                return Err(err);
            }
        };

        self.status = match outcome.reason {
            None => TrackerStatus::Recorded(checkpoint as u32),
            Some(_) => TrackerStatus::AlreadyRecorded(checkpoint as u32),
        };

        self.dispatch_ledger_changes().await?;
        Ok(outcome)
    }

    /// Reconnect path: replays due queue entries.
    pub async fn on_reconnect(&mut self) -> Result<ReplaySummary> {
        let summary = self.delivery.replay_pending().await;
        self.finish_replay(summary)
    }

    /// Manual sync: replays every queue entry regardless of backoff.
    pub async fn sync_now(&mut self) -> Result<ReplaySummary> {
        let summary = self.delivery.replay_pending_now().await;
        self.finish_replay(summary)
    }

    /// Clears identity, ledger, completion flag and pending queue.
    pub fn reset_all(&mut self) -> Result<()> {
        self.state.clear().inspect_err(|err| {
            self.status = status_for_error(err);
        })?;
        self.ledger.reset();
        self.current = None;
        self.last_delivery = None;
        while self.changes.try_recv().is_ok() {}
        self.status = TrackerStatus::CacheCleared;
        event!(Level::INFO, "tracker state cleared");
        Ok(())
    }

    pub fn progress(&self) -> Result<ProgressView> {
        Ok(ProgressView {
            identity: self.current.clone(),
            unique_count: self.ledger.unique_count(),
            stand_count: self.stand_count,
            stands: (1..=self.stand_count)
                .map(|stand| (stand, self.ledger.has_visited(stand)))
                .collect(),
            reported: self.state.reported()?,
            pending_reports: self.pending_count()?,
        })
    }

    async fn dispatch_ledger_changes(&mut self) -> Result<()> {
        loop {
            let change = match self.changes.try_recv() {
                Ok(change) => change,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    event!(Level::WARN, skipped, "ledger notifications lagged");
                    continue;
                }
                Err(_) => return Ok(()),
            };

            if let Some(outcome) = self.delivery.handle_ledger_change(&change).await? {
                self.status = match &outcome {
                    DeliveryOutcome::Acknowledged | DeliveryOutcome::AlreadyReported => {
                        TrackerStatus::ReportAcknowledged
                    }
                    DeliveryOutcome::Queued(_) => TrackerStatus::ReportQueued,
                    DeliveryOutcome::Discarded => TrackerStatus::Ready,
                };
                self.last_delivery = Some(outcome);
            }
        }
    }

    fn finish_replay(&mut self, summary: Result<ReplaySummary>) -> Result<ReplaySummary> {
        let summary = summary.inspect_err(|err| {
            self.status = status_for_error(err);
        })?;
        let remaining = self.pending_count()?;
        self.status = if summary.delivered > 0 {
            TrackerStatus::PendingSynced(summary.delivered)
        } else if remaining > 0 {
            TrackerStatus::PendingStillQueued(remaining)
        } else {
            TrackerStatus::NothingPending
        };
        Ok(summary)
    }
}

fn status_for_error(err: &TrackerError) -> TrackerStatus {
    match err {
        TrackerError::IdentityAssignment(_) | TrackerError::Delivery(_) => {
            TrackerStatus::NetworkError
        }
        TrackerError::InvalidCheckpoint { .. } => TrackerStatus::InvalidCode,
        other => TrackerStatus::StorageError(other.to_string()),
    }
}
