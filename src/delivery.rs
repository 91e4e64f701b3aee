use crate::collector::{Collector, CompletionPayload};
use crate::config::ReplayPolicy;
use crate::core::{AnonymousIdentity, DeliveryFailure, PendingReport, Result, Visit};
use crate::ledger::LedgerChange;
use crate::storage::TrackerState;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

/// Result of one completion attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The collector acknowledged the report; the completion flag is set.
    Acknowledged,
    /// Delivery failed and the report now sits in the pending queue.
    Queued(DeliveryFailure),
    /// The completion flag was already set; nothing was sent.
    AlreadyReported,
    /// The identity was reset while the request was in flight; the result
    /// was dropped without touching the store.
    Discarded,
}

/// Counters for one pass over the pending queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub delivered: usize,
    pub failed: usize,
    /// Entries skipped because their backoff window is still open.
    pub deferred: usize,
    /// Entries removed without sending because their identity already reported.
    pub dropped: usize,
}

impl ReplaySummary {
    pub fn attempted(&self) -> usize {
        self.delivered + self.failed
    }
}

/// Sends completion reports and owns the durable retry queue.
///
/// Failures never escape as errors: they become queue entries. The only
/// errors returned are storage errors.
pub struct DeliveryEngine {
    state: TrackerState,
    collector: Arc<dyn Collector>,
    policy: ReplayPolicy,
    stand_count: u32,
}

impl DeliveryEngine {
    pub fn new(
        state: TrackerState,
        collector: Arc<dyn Collector>,
        policy: ReplayPolicy,
        stand_count: u32,
    ) -> Self {
        Self {
            state,
            collector,
            policy,
            stand_count,
        }
    }

    /// Reacts to a ledger mutation. Returns `None` unless the change moved the
    /// ledger from N-1 to N stands.
    pub async fn handle_ledger_change(
        &self,
        change: &LedgerChange,
    ) -> Result<Option<DeliveryOutcome>> {
        if !change.completes(self.stand_count) {
            return Ok(None);
        }
        let outcome = self
            .attempt_completion(&change.identity, &change.visits)
            .await?;
        Ok(Some(outcome))
    }

    /// Sends the completion report for `identity`, queueing it on failure.
    pub async fn attempt_completion(
        &self,
        identity: &AnonymousIdentity,
        visits: &[Visit],
    ) -> Result<DeliveryOutcome> {
        if self.state.reported()? {
            event!(Level::DEBUG, anon_id = %identity, "completion already reported");
            return Ok(DeliveryOutcome::AlreadyReported);
        }

        let payload = CompletionPayload::new(identity.clone(), visits.to_vec(), Utc::now());
        let span = info_span!("tracker.delivery.attempt", anon_id = %identity);
        let sent = self
            .collector
            .report_completion(&payload)
            .instrument(span)
            .await;

        if !self.is_current(identity)? {
            event!(Level::WARN, anon_id = %identity, "identity reset during delivery, dropping result");
            return Ok(DeliveryOutcome::Discarded);
        }

        match sent {
            Ok(()) => {
                self.acknowledge(identity)?;
                event!(Level::INFO, anon_id = %identity, "completion acknowledged");
                Ok(DeliveryOutcome::Acknowledged)
            }
            Err(failure) => {
                event!(Level::WARN, anon_id = %identity, error = %failure, "completion queued for replay");
                self.enqueue(PendingReport::new(
                    identity.clone(),
                    visits.to_vec(),
                    payload.timestamp,
                ))?;
                Ok(DeliveryOutcome::Queued(failure))
            }
        }
    }

    /// Replays due entries of the pending queue, honouring the backoff policy.
    /// This is the reconnect path.
    pub async fn replay_pending(&self) -> Result<ReplaySummary> {
        self.replay(true).await
    }

    /// Replays every entry regardless of backoff. This is the manual sync path.
    pub async fn replay_pending_now(&self) -> Result<ReplaySummary> {
        self.replay(false).await
    }

    pub fn pending_reports(&self) -> Result<Vec<PendingReport>> {
        self.state.pending_reports()
    }

    async fn replay(&self, respect_backoff: bool) -> Result<ReplaySummary> {
        let pending = self.state.pending_reports()?;
        let mut summary = ReplaySummary::default();
        if pending.is_empty() {
            return Ok(summary);
        }

        let now = Utc::now();
        let current = self.state.identity()?;
        let reported = self.state.reported()?;

        for report in pending {
            if reported && current.as_ref() == Some(&report.identity) {
                self.remove_report(report.report_id)?;
                summary.dropped += 1;
                continue;
            }
            if respect_backoff && !self.is_due(&report, now) {
                summary.deferred += 1;
                continue;
            }

            // Replays carry the time the report was first queued.
            let payload = CompletionPayload::new(
                report.identity.clone(),
                report.visits.clone(),
                report.queued_at,
            );
            let span = info_span!(
                "tracker.delivery.replay",
                anon_id = %report.identity,
                attempts = report.attempts
            );
            match self
                .collector
                .report_completion(&payload)
                .instrument(span)
                .await
            {
                Ok(()) => {
                    self.acknowledge(&report.identity)?;
                    summary.delivered += 1;
                    event!(Level::INFO, anon_id = %report.identity, "pending report delivered");
                }
                Err(failure) => {
                    self.record_failed_attempt(report.report_id, Utc::now())?;
                    summary.failed += 1;
                    event!(Level::WARN, anon_id = %report.identity, error = %failure, "pending report still undeliverable");
                }
            }
        }

        Ok(summary)
    }

    fn is_due(&self, report: &PendingReport, now: DateTime<Utc>) -> bool {
        let Some(last) = report.last_attempt_at else {
            return true;
        };
        let wait_ms = self.policy.backoff_ms(report.attempts);
        let wait = i64::try_from(wait_ms)
            .ok()
            .and_then(Duration::try_milliseconds)
            .unwrap_or(Duration::MAX);
        last.checked_add_signed(wait).is_none_or(|due| now >= due)
    }

    fn is_current(&self, identity: &AnonymousIdentity) -> Result<bool> {
        Ok(self.state.identity()?.as_ref() == Some(identity))
    }

    /// Drops every queued report for `identity` and, if it is still the
    /// session's identity, sets the completion flag.
    fn acknowledge(&self, identity: &AnonymousIdentity) -> Result<()> {
        let mut pending = self.state.pending_reports()?;
        let before = pending.len();
        pending.retain(|report| &report.identity != identity);
        if pending.len() != before {
            self.state.set_pending_reports(&pending)?;
        }
        if self.is_current(identity)? {
            self.state.set_reported()?;
        }
        Ok(())
    }

    /// Queues `report`, replacing any earlier entry for the same identity.
    fn enqueue(&self, report: PendingReport) -> Result<()> {
        let mut pending = self.state.pending_reports()?;
        pending.retain(|existing| existing.identity != report.identity);
        pending.push(report);
        self.state.set_pending_reports(&pending)
    }

    /// Bumps the attempt counter. An entry that vanished meanwhile (reset or
    /// concurrent acknowledgment) stays gone.
    fn record_failed_attempt(&self, report_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut pending = self.state.pending_reports()?;
        let Some(entry) = pending.iter_mut().find(|r| r.report_id == report_id) else {
            return Ok(());
        };
        entry.attempts = entry.attempts.saturating_add(1);
        entry.last_attempt_at = Some(at);
        self.state.set_pending_reports(&pending)
    }

    fn remove_report(&self, report_id: Uuid) -> Result<()> {
        let mut pending = self.state.pending_reports()?;
        pending.retain(|r| r.report_id != report_id);
        self.state.set_pending_reports(&pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::InMemoryCollector;
    use crate::storage::state::PENDING_REPORTS_KEY;
    use crate::storage::{DurableStore, MemoryStore};
    use serde_json::json;

    fn engine(policy: ReplayPolicy) -> (InMemoryCollector, TrackerState, DeliveryEngine) {
        let collector = InMemoryCollector::new();
        let state = TrackerState::new(Arc::new(MemoryStore::new()));
        let engine = DeliveryEngine::new(state.clone(), Arc::new(collector.clone()), policy, 2);
        (collector, state, engine)
    }

    fn visits() -> Vec<Visit> {
        vec![Visit::new(1, Utc::now()), Visit::new(2, Utc::now())]
    }

    fn signed_in(state: &TrackerState, id: &str) -> AnonymousIdentity {
        let identity = AnonymousIdentity::new(id);
        state.set_identity(&identity).unwrap();
        identity
    }

    #[tokio::test]
    async fn test_success_sets_flag() {
        let (collector, state, engine) = engine(ReplayPolicy::immediate());
        let anon = signed_in(&state, "1");

        let outcome = engine.attempt_completion(&anon, &visits()).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Acknowledged);
        assert!(state.reported().unwrap());
        assert!(state.pending_reports().unwrap().is_empty());
        assert_eq!(collector.accepted_reports().len(), 1);

        let again = engine.attempt_completion(&anon, &visits()).await.unwrap();
        assert_eq!(again, DeliveryOutcome::AlreadyReported);
        assert_eq!(collector.report_attempts(), 1);
    }

    #[tokio::test]
    async fn test_failures_queue_one_entry_per_identity() {
        let (collector, state, engine) = engine(ReplayPolicy::immediate());
        let anon = signed_in(&state, "1");
        collector.set_reject_reports(true);

        let first = engine.attempt_completion(&anon, &visits()).await.unwrap();
        assert_eq!(first, DeliveryOutcome::Queued(DeliveryFailure::Rejected));
        collector.set_online(false);
        let second = engine.attempt_completion(&anon, &visits()).await.unwrap();
        assert!(matches!(second, DeliveryOutcome::Queued(DeliveryFailure::Network(_))));

        let pending = state.pending_reports().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].identity, anon);
        assert!(!state.reported().unwrap());
    }

    #[tokio::test]
    async fn test_replay_keeps_failures_and_counts_attempts() {
        let (collector, state, engine) = engine(ReplayPolicy::immediate());
        let anon = signed_in(&state, "1");
        collector.set_online(false);
        engine.attempt_completion(&anon, &visits()).await.unwrap();

        let summary = engine.replay_pending().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(state.pending_reports().unwrap()[0].attempts, 2);

        collector.set_online(true);
        let summary = engine.replay_pending().await.unwrap();
        assert_eq!(summary.delivered, 1);
        assert!(state.pending_reports().unwrap().is_empty());
        assert!(state.reported().unwrap());
    }

    #[tokio::test]
    async fn test_replay_sends_queued_timestamp() {
        let (collector, state, engine) = engine(ReplayPolicy::immediate());
        let anon = signed_in(&state, "1");
        collector.set_online(false);
        engine.attempt_completion(&anon, &visits()).await.unwrap();
        let queued_at = state.pending_reports().unwrap()[0].queued_at;

        collector.set_online(true);
        engine.replay_pending().await.unwrap();
        let accepted = collector.accepted_reports();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].timestamp, queued_at);
        assert_eq!(accepted[0].visits.len(), 2);

        let sent = collector.sent_reports();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], sent[1], "replay must resend the first attempt unchanged");
    }

    #[tokio::test]
    async fn test_entries_without_report_id_still_back_off() {
        let (collector, state, engine) = engine(ReplayPolicy {
            initial_backoff_ms: 600_000,
            max_backoff_ms: 600_000,
        });
        signed_in(&state, "1");
        state
            .store()
            .set(
                PENDING_REPORTS_KEY,
                &json!([{
                    "anonId": "1",
                    "visits": [{"stand": 1, "ts": "2026-03-01T10:00:00Z"}],
                    "ts": "2026-03-01T10:05:00Z"
                }])
                .to_string(),
            )
            .unwrap();
        collector.set_online(false);

        let first = engine.replay_pending().await.unwrap();
        assert_eq!((first.failed, first.deferred), (1, 0));
        let pending = state.pending_reports().unwrap();
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].last_attempt_at.is_some());

        let second = engine.replay_pending().await.unwrap();
        assert_eq!((second.failed, second.deferred), (0, 1));
        assert_eq!(collector.report_attempts(), 1);
    }

    #[tokio::test]
    async fn test_reported_entry_without_report_id_dropped_in_one_pass() {
        let (collector, state, engine) = engine(ReplayPolicy::immediate());
        signed_in(&state, "1");
        state.set_reported().unwrap();
        state
            .store()
            .set(
                PENDING_REPORTS_KEY,
                &json!([{"anonId": "1", "visits": [], "ts": "2026-03-01T10:05:00Z"}]).to_string(),
            )
            .unwrap();

        let summary = engine.replay_pending().await.unwrap();
        assert_eq!(summary.dropped, 1);
        assert!(state.pending_reports().unwrap().is_empty());
        assert_eq!(collector.report_attempts(), 0);
    }

    #[tokio::test]
    async fn test_backoff_defers_reconnect_replay_but_not_manual_sync() {
        let (collector, state, engine) = engine(ReplayPolicy {
            initial_backoff_ms: 60_000,
            max_backoff_ms: 60_000,
        });
        let anon = signed_in(&state, "1");
        collector.set_online(false);
        engine.attempt_completion(&anon, &visits()).await.unwrap();
        collector.set_online(true);

        let summary = engine.replay_pending().await.unwrap();
        assert_eq!(summary.deferred, 1);
        assert_eq!(summary.attempted(), 0);
        assert_eq!(collector.report_attempts(), 1);

        let summary = engine.replay_pending_now().await.unwrap();
        assert_eq!(summary.delivered, 1);
        assert!(state.reported().unwrap());
    }

    #[tokio::test]
    async fn test_replay_delivers_reports_of_previous_identities() {
        let (collector, state, engine) = engine(ReplayPolicy::immediate());
        let old = signed_in(&state, "1");
        collector.set_online(false);
        engine.attempt_completion(&old, &visits()).await.unwrap();

        let current = signed_in(&state, "2");
        collector.set_online(true);
        let summary = engine.replay_pending().await.unwrap();

        assert_eq!(summary.delivered, 1);
        assert!(state.pending_reports().unwrap().is_empty());
        assert!(!state.reported().unwrap(), "flag belongs to {current}, not {old}");
    }

    #[tokio::test]
    async fn test_ledger_change_only_triggers_on_completion() {
        let (collector, state, engine) = engine(ReplayPolicy::immediate());
        let anon = signed_in(&state, "1");

        let partial = LedgerChange {
            identity: anon.clone(),
            previous_unique: 0,
            unique_count: 1,
            visits: visits()[..1].to_vec(),
        };
        assert_eq!(engine.handle_ledger_change(&partial).await.unwrap(), None);
        assert_eq!(collector.report_attempts(), 0);

        let complete = LedgerChange {
            identity: anon,
            previous_unique: 1,
            unique_count: 2,
            visits: visits(),
        };
        assert_eq!(
            engine.handle_ledger_change(&complete).await.unwrap(),
            Some(DeliveryOutcome::Acknowledged)
        );
    }
}
