//! Thin REST collaborator for final-state refetch.
//!
//! When streaming terminally fails (reconnect budget exhausted), the
//! presentation layer refetches the message's final execution record over
//! plain HTTP instead of leaving the view stuck.

use crate::config::normalize_base_url;
use crate::error::{ClientError, Result};
use crate::protocol::ExecutionUpdate;
use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// REST client for the Local Operator backend.
#[derive(Debug, Clone)]
pub struct OperatorApi {
    base_url: String,
    http: reqwest::Client,
}

impl OperatorApi {
    /// Create a client for a backend base URL.
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a client with a custom request timeout.
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| ClientError::Request(error.to_string()))?;
        Ok(Self {
            base_url: normalize_base_url(base_url)?,
            http,
        })
    }

    /// Backend base URL this client talks to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch the current execution record for a message id.
    ///
    /// The payload is the same open-schema record the update frames carry,
    /// so the caller can feed it through the reconciler unchanged.
    pub async fn fetch_execution(&self, message_id: &str) -> Result<ExecutionUpdate> {
        let url = format!("{}/v1/messages/{message_id}/execution", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|error| ClientError::Request(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Http {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<ExecutionUpdate>()
            .await
            .map_err(|error| ClientError::Request(error.to_string()))
    }
}
