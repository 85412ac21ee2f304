//! Discovery client for broker parameter resolution
//!
//! Turns the (environment, company id, device id) triple into a
//! [`BrokerDescriptor`] via two sequential HTTPS exchanges: a GET against
//! the discovery host to locate the agent service, then a POST of the
//! device identity to the agent's `sync` endpoint.
//!
//! Parse failures and transport failures are retried up to the configured
//! attempt count; every other rejection is a server-side decision and is
//! returned immediately.

pub mod protocol;

use protocol::{
    discovery_path, BrokerDescriptor, DiscoveryResponse, SyncOutcome, SyncRequest, SyncResponse,
};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

pub use protocol::DiscoveryError;

// Per-exchange bounds; each attempt performs two exchanges sequentially.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(20);

/// HTTP client for the two-stage discovery protocol
pub struct DiscoveryClient {
    client: Client,
    base_url: Url,
}

impl DiscoveryClient {
    /// Create a client targeting the given discovery host.
    ///
    /// A bare host name is reached over HTTPS; a value with an explicit
    /// scheme is taken verbatim, which lets test environments point the
    /// session at a plain-HTTP mock server.
    pub fn new(discovery_host: &str) -> Result<Self, DiscoveryError> {
        let raw = if discovery_host.contains("://") {
            discovery_host.to_string()
        } else {
            format!("https://{discovery_host}")
        };
        let base_url = Url::parse(&raw)
            .map_err(|_| DiscoveryError::BadAgentUrl(discovery_host.to_string()))?;
        Self::with_base_url(base_url)
    }

    /// Create a client with an explicit base URL (scheme included).
    /// Used by tests to point at a local mock server.
    pub fn with_base_url(base_url: Url) -> Result<Self, DiscoveryError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(RESPONSE_TIMEOUT)
            .build()
            .map_err(|e| DiscoveryError::Transport(e.to_string()))?;
        Ok(Self { client, base_url })
    }

    /// Resolve broker parameters, retrying transient failures.
    ///
    /// `max_tries` must be at least 1. Returns the first OK descriptor,
    /// the first terminal rejection, or `RetriesExhausted` wrapping the
    /// last transient failure.
    pub async fn discover(
        &self,
        environment: &str,
        company_id: &str,
        device_id: &str,
        max_tries: u32,
    ) -> Result<BrokerDescriptor, DiscoveryError> {
        debug_assert!(max_tries >= 1);
        let mut last_error = None;

        for attempt in 1..=max_tries {
            match self.attempt(environment, company_id, device_id).await {
                Ok(descriptor) => {
                    info!(
                        host = %descriptor.host,
                        dtg = %descriptor.data_transfer_group,
                        "Discovery succeeded on attempt {attempt}"
                    );
                    return Ok(descriptor);
                }
                Err(e) if e.is_retryable() && attempt < max_tries => {
                    warn!("Discovery attempt {attempt}/{max_tries} failed, retrying: {e}");
                    last_error = Some(e);
                }
                Err(e) if e.is_retryable() => {
                    return Err(DiscoveryError::RetriesExhausted {
                        attempts: max_tries,
                        last: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        // unreachable with max_tries >= 1, but don't panic on misuse
        Err(DiscoveryError::RetriesExhausted {
            attempts: max_tries,
            last: Box::new(last_error.unwrap_or_else(|| {
                DiscoveryError::Transport("no discovery attempt was made".to_string())
            })),
        })
    }

    /// One full discovery attempt: both exchanges, sequentially
    async fn attempt(
        &self,
        environment: &str,
        company_id: &str,
        device_id: &str,
    ) -> Result<BrokerDescriptor, DiscoveryError> {
        let agent = self.fetch_agent_descriptor(environment, company_id).await?;
        let sync_url = agent.sync_url()?;
        debug!(url = %sync_url, "Posting sync request");
        self.sync(sync_url, company_id, device_id).await
    }

    async fn fetch_agent_descriptor(
        &self,
        environment: &str,
        company_id: &str,
    ) -> Result<DiscoveryResponse, DiscoveryError> {
        let path = discovery_path(company_id, environment);
        let url = self
            .base_url
            .join(&path)
            .map_err(|_| DiscoveryError::BadAgentUrl(path.clone()))?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DiscoveryError::Transport(e.to_string()))?;

        let body = read_body(response).await?;
        // tolerate junk before the JSON object, some proxies prepend it
        let json_start = body.find('{').ok_or_else(|| {
            DiscoveryError::Parse("no JSON object in discovery response".to_string())
        })?;
        serde_json::from_str(&body[json_start..])
            .map_err(|e| DiscoveryError::Parse(e.to_string()))
    }

    async fn sync(
        &self,
        sync_url: Url,
        company_id: &str,
        device_id: &str,
    ) -> Result<BrokerDescriptor, DiscoveryError> {
        let request = SyncRequest {
            company_id,
            device_id,
        };

        let response = self
            .client
            .post(sync_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| DiscoveryError::Transport(e.to_string()))?;

        let body = read_body(response).await?;
        let sync: SyncResponse =
            serde_json::from_str(&body).map_err(|e| DiscoveryError::Parse(e.to_string()))?;

        match SyncOutcome::from_code(sync.d.ec) {
            SyncOutcome::Ok => BrokerDescriptor::from_sync(sync.d),
            outcome => Err(DiscoveryError::Rejected(outcome)),
        }
    }
}

/// Check status and pull the body, treating an empty body as the same
/// retryable condition as a parse failure.
async fn read_body(response: reqwest::Response) -> Result<String, DiscoveryError> {
    let status = response.status();
    if !status.is_success() {
        return Err(DiscoveryError::Http(status.as_u16()));
    }
    let body = response
        .text()
        .await
        .map_err(|e| DiscoveryError::Transport(e.to_string()))?;
    if body.trim().is_empty() {
        return Err(DiscoveryError::Parse("empty response body".to_string()));
    }
    Ok(body)
}
