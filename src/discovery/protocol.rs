//! Wire types for the two-stage discovery exchange
//!
//! Stage one resolves the agent endpoint from the identity triple, stage
//! two posts a sync request to that endpoint and receives either broker
//! connection parameters or a rejection code.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Path template for the first discovery stage.
///
/// `lang` and `ver` identify the SDK protocol revision to the server and
/// are fixed for this implementation.
pub fn discovery_path(company_id: &str, environment: &str) -> String {
    format!("/api/sdk/cpid/{company_id}/lang/M_C/ver/2.0/env/{environment}")
}

/// Stage-one response body: `{"d":{"bu":"<agent base url>"}, ...}`
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryResponse {
    pub d: DiscoveryBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryBody {
    /// Base URL of the agent service, trailing slash included
    #[serde(rename = "bu")]
    pub base_url: String,
}

impl DiscoveryResponse {
    /// Resolve the sync endpoint URL from the advertised base URL
    pub fn sync_url(&self) -> Result<Url, DiscoveryError> {
        let base = Url::parse(&self.d.base_url)
            .map_err(|_| DiscoveryError::BadAgentUrl(self.d.base_url.clone()))?;
        // the base URL ends with a path separator, so a plain join keeps it
        base.join("sync")
            .map_err(|_| DiscoveryError::BadAgentUrl(self.d.base_url.clone()))
    }
}

/// Stage-two request body
#[derive(Debug, Clone, Serialize)]
pub struct SyncRequest<'a> {
    #[serde(rename = "cpId")]
    pub company_id: &'a str,
    #[serde(rename = "uniqueId")]
    pub device_id: &'a str,
}

/// Stage-two raw response body
#[derive(Debug, Clone, Deserialize)]
pub struct SyncResponse {
    pub d: SyncBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncBody {
    /// Server-side outcome code, see [`SyncOutcome`]
    pub ec: i64,
    /// Data transfer group tag, echoed back in telemetry
    #[serde(default)]
    pub dtg: Option<String>,
    /// Broker connection parameters, present when `ec` is 0
    #[serde(default)]
    pub p: Option<BrokerParams>,
}

/// Broker parameter block as it appears on the wire
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerParams {
    #[serde(rename = "h")]
    pub host: String,
    #[serde(rename = "id")]
    pub client_id: String,
    #[serde(rename = "un")]
    pub user_name: String,
    /// Empty for certificate-authenticated devices
    #[serde(rename = "pwd", default)]
    pub password: String,
    #[serde(rename = "pub")]
    pub pub_topic: String,
    #[serde(rename = "sub")]
    pub sub_topic: String,
}

/// Server-side sync outcome discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Ok,
    DeviceNotRegistered,
    AutoRegister,
    DeviceNotFound,
    DeviceInactive,
    DeviceMoved,
    CompanyIdNotFound,
    UnknownDeviceStatus,
}

impl SyncOutcome {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => SyncOutcome::Ok,
            1 => SyncOutcome::DeviceNotRegistered,
            2 => SyncOutcome::AutoRegister,
            3 => SyncOutcome::DeviceNotFound,
            4 => SyncOutcome::DeviceInactive,
            5 => SyncOutcome::DeviceMoved,
            6 => SyncOutcome::CompanyIdNotFound,
            _ => SyncOutcome::UnknownDeviceStatus,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            SyncOutcome::Ok => "ok",
            SyncOutcome::DeviceNotRegistered => "device not registered",
            SyncOutcome::AutoRegister => "device pending auto-registration",
            SyncOutcome::DeviceNotFound => "device not found",
            SyncOutcome::DeviceInactive => "device inactive",
            SyncOutcome::DeviceMoved => "device moved",
            SyncOutcome::CompanyIdNotFound => "company id not found",
            SyncOutcome::UnknownDeviceStatus => "unknown device status from server",
        }
    }
}

/// Broker connection parameters produced by a successful discovery.
///
/// Immutable once constructed; the session discards the whole descriptor
/// and everything derived from it when a rediscovery produces a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerDescriptor {
    pub host: String,
    pub client_id: String,
    pub user_name: String,
    pub password: String,
    pub pub_topic: String,
    pub sub_topic: String,
    pub data_transfer_group: String,
}

impl BrokerDescriptor {
    /// Build a descriptor from a successful sync body.
    ///
    /// Callers must have checked `ec` first; a success code without the
    /// parameter block is a malformed response.
    pub fn from_sync(body: SyncBody) -> Result<Self, DiscoveryError> {
        let params = body.p.ok_or(DiscoveryError::Parse(
            "sync response missing broker parameters".to_string(),
        ))?;
        Ok(Self {
            host: params.host,
            client_id: params.client_id,
            user_name: params.user_name,
            password: params.password,
            pub_topic: params.pub_topic,
            sub_topic: params.sub_topic,
            data_transfer_group: body.dtg.unwrap_or_default(),
        })
    }
}

/// Discovery failure taxonomy.
///
/// `Transport` and `Parse` are the retryable conditions; `Rejected` is a
/// terminal server-side decision and returns immediately.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery transport failure: {0}")]
    Transport(String),
    #[error("discovery returned HTTP {0}")]
    Http(u16),
    #[error("could not parse discovery/sync response: {0}")]
    Parse(String),
    #[error("invalid agent base url: {0}")]
    BadAgentUrl(String),
    #[error("sync rejected by server: {}", .0.describe())]
    Rejected(SyncOutcome),
    #[error("discovery retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<DiscoveryError>,
    },
}

impl DiscoveryError {
    /// Whether another discovery attempt may change the result.
    ///
    /// Parse failures historically stem from responses split across
    /// transport reads; transport failures are transient by definition.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DiscoveryError::Transport(_) | DiscoveryError::Http(_) | DiscoveryError::Parse(_)
        )
    }
}
