use super::{Collector, CompletionPayload};
use crate::core::{AnonymousIdentity, DeliveryFailure, Result, TrackerError};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

#[derive(Debug)]
struct InMemoryCollectorState {
    next_id: u64,
    online: bool,
    reject_reports: bool,
    identity_requests: usize,
    sent: Vec<CompletionPayload>,
    accepted: Vec<CompletionPayload>,
}

/// An in-memory implementation of `Collector` for tests and offline demos.
///
/// Simulates the network by flipping an online flag; every call is counted so
/// callers can assert how often the remote side was contacted.
#[derive(Debug, Clone)]
pub struct InMemoryCollector {
    state: Arc<Mutex<InMemoryCollectorState>>,
}

impl Default for InMemoryCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCollector {
    /// Creates an online collector whose first identity is `1`.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first_id: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryCollectorState {
                next_id: first_id,
                online: true,
                reject_reports: false,
                identity_requests: 0,
                sent: Vec::new(),
                accepted: Vec::new(),
            })),
        }
    }

    pub fn set_online(&self, online: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.online = online;
        }
    }

    /// Answer reports with `{"success": false}` while online.
    pub fn set_reject_reports(&self, reject: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.reject_reports = reject;
        }
    }

    pub fn identity_requests(&self) -> usize {
        self.state.lock().map(|s| s.identity_requests).unwrap_or_default()
    }

    pub fn report_attempts(&self) -> usize {
        self.state.lock().map(|s| s.sent.len()).unwrap_or_default()
    }

    /// Every payload handed to the collector, delivered or not.
    pub fn sent_reports(&self) -> Vec<CompletionPayload> {
        self.state
            .lock()
            .map(|s| s.sent.clone())
            .unwrap_or_default()
    }

    pub fn accepted_reports(&self) -> Vec<CompletionPayload> {
        self.state
            .lock()
            .map(|s| s.accepted.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Collector for InMemoryCollector {
    async fn request_identity(&self) -> Result<AnonymousIdentity> {
        let mut state = self.state.lock()?;
        state.identity_requests += 1;
        if !state.online {
            return Err(TrackerError::IdentityAssignment(
                "network error: collector unreachable".to_string(),
            ));
        }
        let id = state.next_id;
        state.next_id += 1;
        Ok(AnonymousIdentity::new(id.to_string()))
    }

    async fn report_completion(
        &self,
        payload: &CompletionPayload,
    ) -> std::result::Result<(), DeliveryFailure> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| DeliveryFailure::Network(e.to_string()))?;
        state.sent.push(payload.clone());
        if !state.online {
            return Err(DeliveryFailure::Network("collector unreachable".to_string()));
        }
        if state.reject_reports {
            return Err(DeliveryFailure::Rejected);
        }
        state.accepted.push(payload.clone());
        Ok(())
    }

    async fn probe(&self) -> bool {
        self.state.lock().map(|s| s.online).unwrap_or(false)
    }
}
