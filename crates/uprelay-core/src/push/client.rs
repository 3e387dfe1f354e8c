//! Push server client, used by the distributor for registration and by the
//! delivery listener for the multi-id long-poll.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::debug;

use uprelay_config::DistributorConfig;

use super::types::*;
use crate::ids::ServerId;
use crate::store::SubscriptionSet;

/// Errors from the push server client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("network error: {0}")]
    Network(String),

    #[error("push server does not know id {0}")]
    NotFound(ServerId),

    #[error("push server does not know ids: {}", join_id_list(.0))]
    UnknownIds(Vec<ServerId>),

    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl ClientError {
    /// Whether retrying later might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Network(_) => true,
            ClientError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// HTTP client for one push server.
#[derive(Debug, Clone)]
pub struct PushClient {
    http: Client,
    base_url: String,
    public_url: String,
    request_timeout: Duration,
}

impl PushClient {
    /// Create a client for the server at `base_url` (no trailing slash needed).
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: Client::new(),
            public_url: base_url.clone(),
            base_url,
            request_timeout,
        }
    }

    /// Use `url` instead of the server URL when building endpoint URLs.
    pub fn with_public_url(mut self, url: impl Into<String>) -> Self {
        self.public_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn from_config(config: &DistributorConfig) -> Self {
        Self::new(config.server_url.clone(), config.request_timeout())
            .with_public_url(config.endpoint_base())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Public pusher endpoint for `id`, handed to applications.
    pub fn endpoint_url(&self, id: &ServerId) -> String {
        format!("{}/push/id/{id}", self.public_url)
    }

    fn push_url(&self, id: &ServerId) -> String {
        format!("{}/push/id/{id}", self.base_url)
    }

    /// Multi-id long-poll URL for the given subscription set.
    pub fn listen_url(&self, ids: &SubscriptionSet) -> String {
        format!("{}/client/multi_id/{}", self.base_url, join_id_list(ids))
    }

    fn client_url(&self, id: &ServerId) -> String {
        format!("{}/client/id/{id}", self.base_url)
    }

    /// Ask the server for a fresh server id.
    pub async fn register(&self) -> Result<ServerId, ClientError> {
        let url = format!("{}/client/register", self.base_url);
        debug!(url = %url, "Registering with push server");
        let resp = self
            .http
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(ClientError::Status {
                status: resp.status().as_u16(),
                url,
            });
        }
        let body: RegisterResponse = resp
            .json()
            .await
            .map_err(|e| ClientError::Parse(format!("register: {e}")))?;
        Ok(body.id)
    }

    /// Discovery check: does the server still know `id` and speak version 1?
    pub async fn is_registered(&self, id: &ServerId) -> Result<bool, ClientError> {
        let url = self.push_url(id);
        let resp = self
            .http
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => {
                let body: DiscoveryResponse = resp
                    .json()
                    .await
                    .map_err(|e| ClientError::Parse(format!("discovery: {e}")))?;
                Ok(body.unifiedpush.version == UNIFIEDPUSH_VERSION)
            }
            status => Err(ClientError::Status {
                status: status.as_u16(),
                url,
            }),
        }
    }

    /// Remove `id` from the server. An id the server never knew counts as removed.
    pub async fn unregister(&self, id: &ServerId) -> Result<(), ClientError> {
        let url = self.client_url(id);
        let resp = self
            .http
            .delete(&url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        match resp.status() {
            StatusCode::NOT_FOUND => {
                debug!(id = %id, "Server had already forgotten id");
                Ok(())
            }
            status if status.is_success() => Ok(()),
            status => Err(ClientError::Status {
                status: status.as_u16(),
                url,
            }),
        }
    }

    /// Send a payload through the pusher API, as an application server would.
    pub async fn push(&self, id: &ServerId, payload: Vec<u8>) -> Result<(), ClientError> {
        let url = self.push_url(id);
        let resp = self
            .http
            .post(&url)
            .timeout(self.request_timeout)
            .body(payload)
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(ClientError::NotFound(id.clone())),
            status if status.is_success() => Ok(()),
            status => Err(ClientError::Status {
                status: status.as_u16(),
                url,
            }),
        }
    }

    /// Open the multi-id long-poll for `ids`.
    ///
    /// Returns once response headers arrive; the body is read by the caller
    /// and stays open until dropped.
    pub async fn listen(&self, ids: &SubscriptionSet) -> Result<reqwest::Response, ClientError> {
        let url = self.listen_url(ids);
        debug!(url = %url, "Opening multi-id listen connection");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        match resp.status() {
            StatusCode::NOT_FOUND => {
                let body: ErrorResponse = resp
                    .json()
                    .await
                    .map_err(|e| ClientError::Parse(format!("listen error body: {e}")))?;
                Err(ClientError::UnknownIds(body.ids))
            }
            status if status.is_success() => Ok(resp),
            status => Err(ClientError::Status {
                status: status.as_u16(),
                url,
            }),
        }
    }
}
