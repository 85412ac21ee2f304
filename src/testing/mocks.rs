//! Mock implementations for testing
//!
//! Provides a scripted Transport implementation so session behavior can
//! be tested without a broker. The mock records every request it
//! receives and, by default, answers each one with the matching
//! acknowledgment through the ordinary event channel.

use crate::discovery::protocol::BrokerDescriptor;
use crate::transport::{
    ConnectOptions, MessageId, Transport, TransportError, TransportEvent,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

const EVENT_CAPACITY: usize = 32;

/// Everything the mock observed, in call order
#[derive(Debug, Clone, PartialEq)]
pub enum MockOperation {
    Connect { host: String, client_id: String },
    Subscribe(String),
    Unsubscribe(String),
    Publish { topic: String, payload: Vec<u8> },
    Disconnect,
}

#[derive(Debug, Clone)]
struct Behavior {
    ack_connect: bool,
    refuse_connect: bool,
    ack_subscribe: bool,
    ack_publish: bool,
    fail_requests: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            ack_connect: true,
            refuse_connect: false,
            ack_subscribe: true,
            ack_publish: true,
            fail_requests: false,
        }
    }
}

struct Shared {
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    operations: Mutex<Vec<MockOperation>>,
    behavior: Mutex<Behavior>,
    next_message_id: AtomicU16,
}

/// Scripted transport for session tests.
///
/// Clones share state, so tests keep a clone for inspection and event
/// injection after handing the original to the session.
#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<Shared>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                event_tx,
                event_rx: Mutex::new(Some(event_rx)),
                operations: Mutex::new(Vec::new()),
                behavior: Mutex::new(Behavior::default()),
                next_message_id: AtomicU16::new(1),
            }),
        }
    }

    /// Answer connect requests with a refused ConnAck
    pub fn refuse_connections(&self) {
        self.behavior(|b| b.refuse_connect = true);
    }

    /// Never answer connect requests; forces the caller into its timeout
    pub fn drop_connect_acks(&self) {
        self.behavior(|b| b.ack_connect = false);
    }

    pub fn drop_subscribe_acks(&self) {
        self.behavior(|b| b.ack_subscribe = false);
    }

    pub fn drop_publish_acks(&self) {
        self.behavior(|b| b.ack_publish = false);
    }

    /// Make every request return a transport error
    pub fn fail_requests(&self) {
        self.behavior(|b| b.fail_requests = true);
    }

    pub fn restore_defaults(&self) {
        *self.shared.behavior.lock().expect("behavior lock poisoned") = Behavior::default();
    }

    fn behavior(&self, f: impl FnOnce(&mut Behavior)) {
        f(&mut self.shared.behavior.lock().expect("behavior lock poisoned"));
    }

    fn snapshot_behavior(&self) -> Behavior {
        self.shared
            .behavior
            .lock()
            .expect("behavior lock poisoned")
            .clone()
    }

    fn record(&self, op: MockOperation) {
        self.shared
            .operations
            .lock()
            .expect("operations lock poisoned")
            .push(op);
    }

    /// All recorded operations, in order
    pub fn operations(&self) -> Vec<MockOperation> {
        self.shared
            .operations
            .lock()
            .expect("operations lock poisoned")
            .clone()
    }

    /// Just the published payloads, with their topics
    pub fn publishes(&self) -> Vec<(String, Vec<u8>)> {
        self.operations()
            .into_iter()
            .filter_map(|op| match op {
                MockOperation::Publish { topic, payload } => Some((topic, payload)),
                _ => None,
            })
            .collect()
    }

    pub fn connect_count(&self) -> usize {
        self.operations()
            .iter()
            .filter(|op| matches!(op, MockOperation::Connect { .. }))
            .count()
    }

    /// Push an event into the session as if the broker sent it
    pub async fn inject(&self, event: TransportEvent) {
        self.shared
            .event_tx
            .send(event)
            .await
            .expect("session event channel closed");
    }

    /// Deliver a devicebound message payload
    pub async fn inject_message(&self, topic: &str, payload: &[u8]) {
        self.inject(TransportEvent::Message {
            topic: topic.to_string(),
            payload: bytes::Bytes::copy_from_slice(payload),
        })
        .await;
    }

    async fn emit(&self, event: TransportEvent) {
        // ignore a dropped receiver, some tests never start the session
        let _ = self.shared.event_tx.send(event).await;
    }

    fn next_message_id(&self) -> MessageId {
        self.shared.next_message_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        descriptor: &BrokerDescriptor,
        _options: ConnectOptions,
    ) -> Result<(), TransportError> {
        self.record(MockOperation::Connect {
            host: descriptor.host.clone(),
            client_id: descriptor.client_id.clone(),
        });
        let behavior = self.snapshot_behavior();
        if behavior.fail_requests {
            return Err(TransportError::ConnectFailed("mock failure".to_string()));
        }
        if behavior.refuse_connect {
            self.emit(TransportEvent::ConnAck {
                accepted: false,
                reason: "NotAuthorized".to_string(),
            })
            .await;
        } else if behavior.ack_connect {
            self.emit(TransportEvent::ConnAck {
                accepted: true,
                reason: "Success".to_string(),
            })
            .await;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.record(MockOperation::Subscribe(topic.to_string()));
        let behavior = self.snapshot_behavior();
        if behavior.fail_requests {
            return Err(TransportError::RequestFailed("mock failure".to_string()));
        }
        if behavior.ack_subscribe {
            self.emit(TransportEvent::SubAck).await;
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.record(MockOperation::Unsubscribe(topic.to_string()));
        if self.snapshot_behavior().fail_requests {
            return Err(TransportError::RequestFailed("mock failure".to_string()));
        }
        self.emit(TransportEvent::UnsubAck).await;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.record(MockOperation::Publish {
            topic: topic.to_string(),
            payload,
        });
        let behavior = self.snapshot_behavior();
        if behavior.fail_requests {
            return Err(TransportError::RequestFailed("mock failure".to_string()));
        }
        if behavior.ack_publish {
            let message_id = self.next_message_id();
            self.emit(TransportEvent::PubAck { message_id }).await;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.record(MockOperation::Disconnect);
        self.emit(TransportEvent::Disconnected).await;
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.shared
            .event_rx
            .lock()
            .expect("event receiver lock poisoned")
            .take()
    }
}

/// A broker descriptor with plausible values for tests
pub fn test_descriptor() -> BrokerDescriptor {
    BrokerDescriptor {
        host: "broker.test.invalid".to_string(),
        client_id: "CPID-dev-1".to_string(),
        user_name: "broker.test.invalid/CPID-dev-1".to_string(),
        password: String::new(),
        pub_topic: "devices/CPID-dev-1/messages/events/".to_string(),
        sub_topic: "devices/CPID-dev-1/messages/devicebound/#".to_string(),
        data_transfer_group: "dtg-test".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::EventKind;

    #[tokio::test]
    async fn test_mock_acks_each_request() {
        let transport = MockTransport::new();
        let mut events = transport.take_events().unwrap();

        transport
            .connect(&test_descriptor(), ConnectOptions::default())
            .await
            .unwrap();
        transport.subscribe("some/topic").await.unwrap();
        transport.publish("some/topic", b"x".to_vec()).await.unwrap();

        assert_eq!(events.recv().await.unwrap().kind(), EventKind::ConnAck);
        assert_eq!(events.recv().await.unwrap().kind(), EventKind::SubAck);
        assert_eq!(events.recv().await.unwrap().kind(), EventKind::PubAck);
        assert_eq!(transport.operations().len(), 3);
    }

    #[tokio::test]
    async fn test_mock_silent_mode() {
        let transport = MockTransport::new();
        transport.drop_connect_acks();
        let mut events = transport.take_events().unwrap();

        transport
            .connect(&test_descriptor(), ConnectOptions::default())
            .await
            .unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_ids_increment() {
        let transport = MockTransport::new();
        let mut events = transport.take_events().unwrap();
        transport.publish("t", b"1".to_vec()).await.unwrap();
        transport.publish("t", b"2".to_vec()).await.unwrap();

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert_eq!(first, TransportEvent::PubAck { message_id: 1 });
        assert_eq!(second, TransportEvent::PubAck { message_id: 2 });
    }
}
