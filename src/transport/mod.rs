//! Transport layer for the broker session
//!
//! Abstracts the publish/subscribe transport behind a trait so the
//! session core can be driven by the real MQTT client or by a mock in
//! tests. Requests are fire-and-forget; completion arrives later as a
//! [`TransportEvent`] on the event channel.

use crate::config::SecurityMaterial;
use crate::discovery::protocol::BrokerDescriptor;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;

/// Broker-assigned packet identifier for acknowledged publishes
pub type MessageId = u16;

/// Asynchronous notifications delivered by the transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Connection acknowledged by the broker
    ConnAck { accepted: bool, reason: String },
    /// Subscription acknowledged
    SubAck,
    /// Unsubscription acknowledged
    UnsubAck,
    /// Publish acknowledged, carrying the packet id
    PubAck { message_id: MessageId },
    /// Inbound message on a subscribed topic
    Message { topic: String, payload: bytes::Bytes },
    /// Link closed, either requested or broker-initiated
    Disconnected,
}

/// Discriminator used to match events against the pending operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ConnAck,
    SubAck,
    UnsubAck,
    PubAck,
    Message,
    Disconnected,
}

impl TransportEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TransportEvent::ConnAck { .. } => EventKind::ConnAck,
            TransportEvent::SubAck => EventKind::SubAck,
            TransportEvent::UnsubAck => EventKind::UnsubAck,
            TransportEvent::PubAck { .. } => EventKind::PubAck,
            TransportEvent::Message { .. } => EventKind::Message,
            TransportEvent::Disconnected => EventKind::Disconnected,
        }
    }
}

/// Connection parameters beyond what the broker descriptor carries
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub keep_alive: Option<Duration>,
    /// TLS material presented to the broker during the handshake
    pub security: Option<SecurityMaterial>,
}

/// Transport failures surfaced to the session
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport connect failed: {0}")]
    ConnectFailed(String),
    #[error("transport request failed: {0}")]
    RequestFailed(String),
    #[error("transport is not connected")]
    NotConnected,
}

/// Connect/subscribe/publish/disconnect capable messaging transport.
///
/// Methods only issue the request; the matching acknowledgment arrives
/// as a [`TransportEvent`]. The session bridges the two through its
/// pending-operation slot.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a connection to the broker described by `descriptor`
    async fn connect(
        &self,
        descriptor: &BrokerDescriptor,
        options: ConnectOptions,
    ) -> Result<(), TransportError>;

    /// Request a subscription to `topic` at QoS 1
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Request removal of the subscription to `topic`
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Publish `payload` to `topic` at QoS 1
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Request an orderly disconnect
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Take the event receiver. Yields `Some` exactly once; the receiver
    /// survives reconnects.
    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>>;
}

/// Type alias for the production MQTT transport
pub type MqttTransport = mqtt::MqttTransport;
