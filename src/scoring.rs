//! Client for the external scoring ("accrual") service.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::model::AccrualObservation;

/// What one poll of the scoring service told us.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// HTTP 200 with a decoded body.
    Observed(AccrualObservation),
    /// HTTP 204: the service does not know this order yet.
    NotRegistered,
    /// HTTP 429: back off before asking again.
    RateLimited,
}

/// Failure to get any usable answer out of the scoring service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScoringError {
    #[error("request to scoring service failed: {0}")]
    Transport(String),

    #[error("scoring service answered with unexpected status {0}")]
    UnexpectedStatus(u16),

    #[error("failed to decode scoring response: {0}")]
    Decode(String),
}

/// Asks for the current state of one order.
#[async_trait]
pub trait Scoring: Send + Sync {
    async fn poll(&self, order: &str) -> Result<PollOutcome, ScoringError>;
}

/// [`Scoring`] over HTTP: `GET {base_url}/api/orders/{number}`.
#[derive(Debug, Clone)]
pub struct HttpScoringClient {
    client: Client,
    base_url: String,
}

impl HttpScoringClient {
    /// Build a client with the given per-request timeout.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, ScoringError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ScoringError::Transport(e.to_string()))?;
        Ok(Self::with_client(client, base_url))
    }

    /// Reuse an existing `reqwest` client.
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn order_url(&self, order: &str) -> String {
        format!("{}/api/orders/{order}", self.base_url)
    }
}

#[async_trait]
impl Scoring for HttpScoringClient {
    async fn poll(&self, order: &str) -> Result<PollOutcome, ScoringError> {
        let response = self
            .client
            .get(self.order_url(order))
            .send()
            .await
            .map_err(|e| ScoringError::Transport(e.to_string()))?;

        let status = response.status();
        debug!(order, status = status.as_u16(), "scoring service answered");

        match status {
            StatusCode::OK => response
                .json::<AccrualObservation>()
                .await
                .map(PollOutcome::Observed)
                .map_err(|e| ScoringError::Decode(e.to_string())),
            StatusCode::NO_CONTENT => Ok(PollOutcome::NotRegistered),
            StatusCode::TOO_MANY_REQUESTS => Ok(PollOutcome::RateLimited),
            other => Err(ScoringError::UnexpectedStatus(other.as_u16())),
        }
    }
}
