//! Session supervision over the discovery and transport layers
//!
//! [`IotcSession`] owns the full device lifecycle: resolve broker
//! parameters through discovery, connect and subscribe, route inbound
//! events to the registered handlers, and publish telemetry and acks.
//!
//! Blocking operations are strictly serialized through a single pending
//! slot; issuing a second operation while one is in flight fails with
//! `OperationAlreadyPending` instead of queueing. Server directives
//! (force resync, close) never run on the event router; they are handed
//! to a supervisor task that owns reconnection.

pub(crate) mod pending;

use crate::config::SessionConfig;
use crate::discovery::protocol::BrokerDescriptor;
use crate::discovery::DiscoveryClient;
use crate::error::{SessionError, SessionResult};
use crate::events::{
    classify, AckHandle, CommandEvent, Handlers, OtaEvent, SessionDirective, SessionStatus,
};
use crate::telemetry::{self, TelemetryContext, TelemetryMessage};
use crate::transport::{
    ConnectOptions, EventKind, MessageId, Transport, TransportEvent,
};
use pending::PendingSlot;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

const DIRECTIVE_CAPACITY: usize = 4;

/// Externally observable session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Discovering,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    /// Establishment failed; a fresh `start` call is required
    Failed,
}

/// Device session over a pluggable transport.
///
/// Cheap to clone; all clones drive the same session.
pub struct IotcSession<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for IotcSession<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<T: Transport> {
    config: SessionConfig,
    transport: T,
    handlers: Handlers,
    pending: PendingSlot,
    state: watch::Sender<SessionState>,
    descriptor: Mutex<Option<BrokerDescriptor>>,
    directive_tx: mpsc::Sender<SessionDirective>,
    directive_rx: Mutex<Option<mpsc::Receiver<SessionDirective>>>,
}

impl<T: Transport> IotcSession<T> {
    pub fn new(config: SessionConfig, transport: T) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let (directive_tx, directive_rx) = mpsc::channel(DIRECTIVE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                handlers: Handlers::new(),
                pending: PendingSlot::new(),
                state,
                descriptor: Mutex::new(None),
                directive_tx,
                directive_rx: Mutex::new(Some(directive_rx)),
            }),
        }
    }

    /// Run discovery, connect to the broker, and subscribe to the
    /// devicebound topic. Blocks until the session is live or failed.
    ///
    /// Callable again after a failure or a deliberate disconnect; calling
    /// it on a live or establishing session is a usage error.
    pub async fn start(&self) -> SessionResult<()> {
        match self.state() {
            SessionState::Idle | SessionState::Disconnected | SessionState::Failed => {}
            _ => return Err(SessionError::AlreadyStarted),
        }

        self.inner.set_state(SessionState::Discovering);
        let descriptor = match Inner::discover(&self.inner).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                self.inner.set_state(SessionState::Failed);
                return Err(e);
            }
        };
        self.inner.store_descriptor(descriptor);

        self.spawn_tasks_once()?;
        Inner::connect_and_subscribe(&self.inner).await
    }

    /// Spawn the router and supervisor on the first start only; both run
    /// for the session lifetime and survive reconnects.
    fn spawn_tasks_once(&self) -> SessionResult<()> {
        let mut guard = self
            .inner
            .directive_rx
            .lock()
            .expect("directive receiver lock poisoned");
        if guard.is_some() {
            // events were never claimed; this transport was handed over fresh
            let events = self
                .inner
                .transport
                .take_events()
                .ok_or(SessionError::AlreadyStarted)?;
            let directives = guard.take().expect("checked above");
            tokio::spawn(Inner::route_events(self.inner.clone(), events));
            tokio::spawn(Inner::supervise(self.inner.clone(), directives));
        }
        Ok(())
    }

    /// Publish one telemetry message and wait for the broker ack.
    ///
    /// Returns the broker-assigned message id on success.
    pub async fn publish_telemetry(
        &self,
        message: TelemetryMessage,
    ) -> SessionResult<MessageId> {
        let context = {
            let guard = self
                .inner
                .descriptor
                .lock()
                .expect("descriptor lock poisoned");
            let descriptor = guard.as_ref().ok_or(SessionError::NotConnected)?;
            TelemetryContext {
                company_id: self.inner.config.company_id.clone(),
                device_id: self.inner.config.device_id.clone(),
                environment: self.inner.config.environment.clone(),
                data_transfer_group: descriptor.data_transfer_group.clone(),
            }
        };
        let payload = telemetry::build_telemetry(&context, message)?;
        self.inner.publish_acknowledged(payload).await
    }

    /// Acknowledge a command or OTA event, consuming its handle
    pub async fn publish_ack(
        &self,
        ack: AckHandle,
        success: bool,
        message: Option<&str>,
    ) -> SessionResult<MessageId> {
        let payload = telemetry::build_ack(ack, success, message)?;
        self.inner.publish_acknowledged(payload).await
    }

    /// Publish a pre-serialized payload to the events topic
    pub async fn publish_bytes(&self, payload: Vec<u8>) -> SessionResult<MessageId> {
        self.inner.publish_acknowledged(payload).await
    }

    /// Close the session deliberately. Safe to call when not connected.
    pub async fn disconnect(&self) -> SessionResult<()> {
        Inner::teardown(&self.inner).await;
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions; useful for tests and shutdown logic
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn register_command_handler(
        &self,
        handler: impl Fn(CommandEvent) + Send + Sync + 'static,
    ) {
        self.inner.handlers.set_command(Box::new(handler));
    }

    pub fn register_ota_handler(&self, handler: impl Fn(OtaEvent) + Send + Sync + 'static) {
        self.inner.handlers.set_ota(Box::new(handler));
    }

    pub fn register_status_handler(
        &self,
        handler: impl Fn(SessionStatus) + Send + Sync + 'static,
    ) {
        self.inner.handlers.set_status(Box::new(handler));
    }

    /// Handler for parsed payloads that match no known structure
    pub fn register_message_handler(&self, handler: impl Fn(Value) + Send + Sync + 'static) {
        self.inner.handlers.set_message(Box::new(handler));
    }
}

impl<T: Transport> Inner<T> {
    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    fn store_descriptor(&self, descriptor: BrokerDescriptor) {
        *self.descriptor.lock().expect("descriptor lock poisoned") = Some(descriptor);
    }

    fn current_descriptor(&self) -> SessionResult<BrokerDescriptor> {
        self.descriptor
            .lock()
            .expect("descriptor lock poisoned")
            .clone()
            .ok_or(SessionError::NotConnected)
    }

    async fn discover(inner: &Arc<Self>) -> SessionResult<BrokerDescriptor> {
        let client = DiscoveryClient::new(&inner.config.discovery_host)?;
        let descriptor = client
            .discover(
                &inner.config.environment,
                &inner.config.company_id,
                &inner.config.device_id,
                inner.config.discovery_retry_count,
            )
            .await?;
        Ok(descriptor)
    }

    /// Connect and subscribe using the stored descriptor.
    ///
    /// The handshake steps wait twice the base operation timeout; the
    /// broker has to complete a TLS handshake before it can answer.
    async fn connect_and_subscribe(inner: &Arc<Self>) -> SessionResult<()> {
        let descriptor = inner.current_descriptor()?;
        let handshake_timeout = inner.config.operation_timeout * 2;

        inner.set_state(SessionState::Connecting);
        let options = ConnectOptions {
            keep_alive: Some(inner.config.keep_alive),
            security: inner.config.security.clone(),
        };

        let rx = inner
            .pending
            .register(EventKind::ConnAck)
            .ok_or(SessionError::OperationAlreadyPending)?;
        if let Err(e) = inner.transport.connect(&descriptor, options).await {
            inner.pending.clear();
            inner.fail_connect().await;
            return Err(e.into());
        }
        let event = match inner
            .wait_for(rx, handshake_timeout, "connection acknowledgment")
            .await
        {
            Ok(event) => event,
            Err(e) => {
                inner.fail_connect().await;
                return Err(e);
            }
        };
        match event {
            TransportEvent::ConnAck { accepted: true, .. } => {}
            TransportEvent::ConnAck { reason, .. } => {
                inner.fail_connect().await;
                return Err(SessionError::ConnectionRefused(reason));
            }
            other => {
                debug!("Unexpected event during connect: {:?}", other.kind());
                inner.fail_connect().await;
                return Err(SessionError::ConnectionLost);
            }
        }

        let rx = inner
            .pending
            .register(EventKind::SubAck)
            .ok_or(SessionError::OperationAlreadyPending)?;
        if let Err(e) = inner.transport.subscribe(&descriptor.sub_topic).await {
            inner.pending.clear();
            inner.fail_connect().await;
            return Err(e.into());
        }
        if let Err(e) = inner
            .wait_for(rx, handshake_timeout, "subscription acknowledgment")
            .await
        {
            inner.fail_connect().await;
            return Err(e);
        }

        info!(
            host = %descriptor.host,
            topic = %descriptor.sub_topic,
            "Session connected and subscribed"
        );
        inner.set_state(SessionState::Connected);
        inner.handlers.notify_status(SessionStatus::Connected);
        Ok(())
    }

    /// Publish and wait for the broker's acknowledgment
    async fn publish_acknowledged(&self, payload: Vec<u8>) -> SessionResult<MessageId> {
        if *self.state.borrow() != SessionState::Connected {
            return Err(SessionError::NotConnected);
        }
        let pub_topic = self.current_descriptor()?.pub_topic;

        let rx = self
            .pending
            .register(EventKind::PubAck)
            .ok_or(SessionError::OperationAlreadyPending)?;
        if let Err(e) = self.transport.publish(&pub_topic, payload).await {
            self.pending.clear();
            return Err(e.into());
        }
        let event = self
            .wait_for(rx, self.config.operation_timeout, "publish acknowledgment")
            .await?;
        match event {
            TransportEvent::PubAck { message_id } => Ok(message_id),
            _ => Err(SessionError::ConnectionLost),
        }
    }

    async fn wait_for(
        &self,
        rx: oneshot::Receiver<TransportEvent>,
        deadline: Duration,
        what: &'static str,
    ) -> SessionResult<TransportEvent> {
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(TransportEvent::Disconnected)) => Err(SessionError::ConnectionLost),
            Ok(Ok(event)) => Ok(event),
            // sender dropped without resolving; transport went away
            Ok(Err(_)) => Err(SessionError::ConnectionLost),
            Err(_) => {
                self.pending.clear();
                Err(SessionError::OperationTimeout(what))
            }
        }
    }

    /// Mark a failed connect attempt and release the transport
    async fn fail_connect(&self) {
        self.set_state(SessionState::Failed);
        self.handlers.notify_status(SessionStatus::Failed);
        if let Err(e) = self.transport.disconnect().await {
            debug!("Transport release after failed connect: {e}");
        }
    }

    /// Orderly teardown. State is settled before the transport is told
    /// to disconnect so the router does not report it a second time.
    /// Unsubscribe and disconnect are best effort; failures are logged.
    async fn teardown(&self) {
        let was_connected = *self.state.borrow() == SessionState::Connected;
        self.set_state(SessionState::Disconnecting);
        if was_connected {
            if let Ok(descriptor) = self.current_descriptor() {
                if let Err(e) = self.transport.unsubscribe(&descriptor.sub_topic).await {
                    debug!("Unsubscribe during teardown: {e}");
                }
            }
        }
        self.set_state(SessionState::Disconnected);
        if was_connected {
            self.handlers.notify_status(SessionStatus::Disconnected);
        }
        if let Err(e) = self.transport.disconnect().await {
            debug!("Transport disconnect during teardown: {e}");
        }
    }

    /// Event router task. Runs for the session lifetime; survives
    /// reconnects because the transport event channel does.
    async fn route_events(inner: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match &event {
                TransportEvent::PubAck { message_id } => {
                    inner
                        .handlers
                        .notify_status(SessionStatus::Published(*message_id));
                    if !inner.pending.offer(&event) {
                        debug!(message_id, "Late publish acknowledgment dropped");
                    }
                }
                TransportEvent::Message { topic, payload } => {
                    debug!(%topic, bytes = payload.len(), "Devicebound message");
                    let classified = classify(payload);
                    if let Some(directive) = inner.handlers.dispatch(classified) {
                        if inner.directive_tx.send(directive).await.is_err() {
                            warn!("Supervisor gone, dropping {directive:?}");
                        }
                    }
                }
                TransportEvent::Disconnected => {
                    inner.pending.offer(&event);
                    // only an unexpected loss changes state here; teardown
                    // and failed connects settle the state themselves
                    if *inner.state.borrow() == SessionState::Connected {
                        warn!("Broker connection lost");
                        inner.set_state(SessionState::Disconnected);
                        inner.handlers.notify_status(SessionStatus::Disconnected);
                    }
                }
                _ => {
                    if !inner.pending.offer(&event) {
                        debug!("Unsolicited {:?} dropped", event.kind());
                    }
                }
            }
        }
        debug!("Transport event channel closed, router exiting");
    }

    /// Supervisor task acting on server directives.
    ///
    /// Resync is a full restart of the session: nothing from the previous
    /// discovery is reused, the broker may have moved the device.
    async fn supervise(inner: Arc<Self>, mut directives: mpsc::Receiver<SessionDirective>) {
        while let Some(directive) = directives.recv().await {
            match directive {
                SessionDirective::Close => {
                    info!("Server requested session close");
                    inner.teardown().await;
                }
                SessionDirective::Resync => {
                    info!("Server requested resync, rebuilding the session");
                    inner.teardown().await;
                    inner.set_state(SessionState::Discovering);
                    match Self::discover(&inner).await {
                        Ok(descriptor) => {
                            inner.store_descriptor(descriptor);
                            if let Err(e) = Self::connect_and_subscribe(&inner).await {
                                warn!("Reconnect after resync failed: {e}");
                            }
                        }
                        Err(e) => {
                            warn!("Rediscovery after resync failed: {e}");
                            inner.set_state(SessionState::Failed);
                            inner.handlers.notify_status(SessionStatus::Failed);
                        }
                    }
                }
            }
        }
        debug!("Directive channel closed, supervisor exiting");
    }
}
