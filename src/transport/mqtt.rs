//! MQTT implementation of the transport seam
//!
//! Wraps rumqttc (MQTT 3.1.1, clean session) and pumps its event loop
//! into the transport event channel from a spawned task. The event loop
//! is not allowed to reconnect on its own: the poll task exits on the
//! first connection error and reports `Disconnected`, leaving the
//! reconnection decision to the session.

use super::{ConnectOptions, Transport, TransportError, TransportEvent};
use crate::discovery::protocol::BrokerDescriptor;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, TlsConfiguration,
    Transport as RumqttcTransport,
};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const BROKER_PORT: u16 = 8883;
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);
const EVENT_CHANNEL_CAPACITY: usize = 32;
const REQUEST_CAPACITY: usize = 10;

struct ActiveConnection {
    client: AsyncClient,
    poll_handle: JoinHandle<()>,
}

/// rumqttc-backed transport
pub struct MqttTransport {
    active: Mutex<Option<ActiveConnection>>,
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: std::sync::Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

impl MqttTransport {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            active: Mutex::new(None),
            event_tx,
            event_rx: std::sync::Mutex::new(Some(event_rx)),
        }
    }

    fn build_options(
        descriptor: &BrokerDescriptor,
        options: &ConnectOptions,
    ) -> Result<MqttOptions, TransportError> {
        // the broker only accepts mutually authenticated TLS
        let security = options.security.as_ref().ok_or_else(|| {
            TransportError::ConnectFailed("TLS material is required to connect".to_string())
        })?;

        let mut mqtt_options =
            MqttOptions::new(&descriptor.client_id, &descriptor.host, BROKER_PORT);
        mqtt_options.set_keep_alive(options.keep_alive.unwrap_or(DEFAULT_KEEP_ALIVE));
        mqtt_options.set_clean_session(true);

        if !descriptor.user_name.is_empty() {
            mqtt_options.set_credentials(&descriptor.user_name, &descriptor.password);
        }

        let tls = TlsConfiguration::Simple {
            ca: security.ca_cert.clone(),
            alpn: None,
            client_auth: Some((security.client_cert.clone(), security.private_key.clone())),
        };
        mqtt_options.set_transport(RumqttcTransport::Tls(tls));

        Ok(mqtt_options)
    }

    /// Forward event loop packets until the link dies or the session
    /// drops its receiver.
    async fn pump(mut event_loop: EventLoop, tx: mpsc::Sender<TransportEvent>) {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(packet)) => {
                    if let Some(event) = map_incoming(packet) {
                        if tx.send(event).await.is_err() {
                            debug!("Transport event receiver dropped, stopping poll task");
                            return;
                        }
                    }
                }
                Ok(Event::Outgoing(_)) => {}
                Err(e) => {
                    debug!("MQTT event loop ended: {e}");
                    let _ = tx.send(TransportEvent::Disconnected).await;
                    return;
                }
            }
        }
    }
}

impl Default for MqttTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn map_incoming(packet: Packet) -> Option<TransportEvent> {
    match packet {
        Packet::ConnAck(ack) => Some(TransportEvent::ConnAck {
            accepted: ack.code == ConnectReturnCode::Success,
            reason: format!("{:?}", ack.code),
        }),
        Packet::SubAck(_) => Some(TransportEvent::SubAck),
        Packet::UnsubAck(_) => Some(TransportEvent::UnsubAck),
        Packet::PubAck(ack) => Some(TransportEvent::PubAck {
            message_id: ack.pkid,
        }),
        Packet::Publish(publish) => Some(TransportEvent::Message {
            topic: publish.topic.clone(),
            payload: publish.payload,
        }),
        Packet::Disconnect => Some(TransportEvent::Disconnected),
        _ => None,
    }
}

#[async_trait::async_trait]
impl Transport for MqttTransport {
    async fn connect(
        &self,
        descriptor: &BrokerDescriptor,
        options: ConnectOptions,
    ) -> Result<(), TransportError> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            // stale connection from a torn-down session
            previous.poll_handle.abort();
        }

        info!(host = %descriptor.host, client_id = %descriptor.client_id, "Opening MQTT connection");
        let mqtt_options = Self::build_options(descriptor, &options)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);

        let tx = self.event_tx.clone();
        let poll_handle = tokio::spawn(Self::pump(event_loop, tx));

        *active = Some(ActiveConnection {
            client,
            poll_handle,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let active = self.active.lock().await;
        let conn = active.as_ref().ok_or(TransportError::NotConnected)?;
        conn.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::RequestFailed(e.to_string()))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let active = self.active.lock().await;
        let conn = active.as_ref().ok_or(TransportError::NotConnected)?;
        conn.client
            .unsubscribe(topic)
            .await
            .map_err(|e| TransportError::RequestFailed(e.to_string()))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let active = self.active.lock().await;
        let conn = active.as_ref().ok_or(TransportError::NotConnected)?;
        conn.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::RequestFailed(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut active = self.active.lock().await;
        if let Some(conn) = active.take() {
            if let Err(e) = conn.client.disconnect().await {
                warn!("MQTT disconnect request failed: {e}");
                conn.poll_handle.abort();
            }
            // poll task exits on its own once the link closes
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.event_rx
            .lock()
            .expect("event receiver mutex poisoned")
            .take()
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        // can't run async teardown here; just stop the poll task
        if let Ok(mut active) = self.active.try_lock() {
            if let Some(conn) = active.take() {
                conn.poll_handle.abort();
            }
        }
    }
}
