use super::{
    Collector, CompletionPayload, NEW_ANON_ACTION, NewAnonResponse, REPORT_COMPLETE_ACTION,
    parse_ack,
};
use crate::config::TrackerConfig;
use crate::core::{AnonymousIdentity, DeliveryFailure, Result, TrackerError};
use async_trait::async_trait;
use reqwest::Client;
use tracing::{Level, event};

/// Collector reached over HTTP with reqwest.
///
/// Every request carries the configured timeout, so a hung collector turns
/// into a `Network` failure instead of a stuck session.
#[derive(Debug, Clone)]
pub struct HttpCollector {
    client: Client,
    base_url: String,
}

impl HttpCollector {
    pub fn new(config: &TrackerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TrackerError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.collector_url.trim().to_string(),
        })
    }
}

#[async_trait]
impl Collector for HttpCollector {
    async fn request_identity(&self) -> Result<AnonymousIdentity> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[("action", NEW_ANON_ACTION)])
            .send()
            .await
            .map_err(|e| TrackerError::IdentityAssignment(format!("network error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TrackerError::IdentityAssignment(format!(
                "collector answered HTTP {}",
                status.as_u16()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| TrackerError::IdentityAssignment(format!("read body: {}", e)))?;
        let parsed: NewAnonResponse = serde_json::from_str(&body).map_err(|e| {
            TrackerError::IdentityAssignment(format!("malformed newAnon response: {}", e))
        })?;
        parsed.into_identity()
    }

    async fn report_completion(
        &self,
        payload: &CompletionPayload,
    ) -> std::result::Result<(), DeliveryFailure> {
        let response = self
            .client
            .post(&self.base_url)
            .query(&[("action", REPORT_COMPLETE_ACTION)])
            .json(payload)
            .send()
            .await
            .map_err(|e| DeliveryFailure::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            event!(Level::DEBUG, status = status.as_u16(), "report rejected by HTTP status");
            return Err(DeliveryFailure::HttpStatus(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| DeliveryFailure::Network(e.to_string()))?;
        parse_ack(&body)
    }

    async fn probe(&self) -> bool {
        self.client.get(&self.base_url).send().await.is_ok()
    }
}
