//! Inbound event classification and handler dispatch
//!
//! Every message arriving on the devicebound topic is parsed once into a
//! tagged [`InboundEvent`] and dispatched exhaustively. Classification is
//! structural: a download URL always means an OTA update, a command field
//! is interpreted through the `cmdType` discriminator, and payloads with
//! no recognized structure are treated as a close directive from the
//! server.
//!
//! Handlers run on the notification context and must return quickly.
//! Resync and close are never executed inline; they are reported as
//! [`SessionDirective`]s for the session supervisor to act on.

use serde::Deserialize;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::RwLock;
use tracing::{debug, error, warn};

use crate::transport::MessageId;

// cmdType discriminators understood by this device
const CMD_DEVICE_COMMAND: &str = "0x01";
const CMD_DEVICE_OTA: &str = "0x02";
const CMD_FORCE_SYNC: &str = "0x12";
const CMD_CLOSE: &str = "0x99";

/// Classified inbound message
#[derive(Debug)]
pub enum InboundEvent {
    /// Device command with raw command text
    Command(CommandEvent),
    /// Firmware update notice with a download URL
    OtaUpdate(OtaUpdateEvent),
    /// Older backend revision: OTA delivered as plain command text
    OtaLegacyCommand(CommandEvent),
    /// Server instructed the device to rediscover and reconnect
    ForceResync,
    /// Server requested disconnection
    SessionClose,
    /// Parsed but not understood; forwarded to the general handler
    Unclassified(Value),
}

#[derive(Debug)]
pub struct CommandEvent {
    pub command: String,
    pub ack: Option<AckHandle>,
}

#[derive(Debug)]
pub struct OtaUpdateEvent {
    pub download_url: String,
    pub version: Option<String>,
    pub ack: Option<AckHandle>,
}

/// Events handed to the OTA handler
#[derive(Debug)]
pub enum OtaEvent {
    Update(OtaUpdateEvent),
    LegacyCommand(CommandEvent),
}

/// Acknowledgment kinds, encoded into the ack payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Command,
    Ota,
}

/// One-shot acknowledgment token for a command or OTA event.
///
/// Consumed by value when the ack payload is built, so the same event
/// cannot be acknowledged twice.
#[derive(Debug, PartialEq, Eq)]
pub struct AckHandle {
    ack_id: String,
    kind: AckKind,
}

impl AckHandle {
    pub(crate) fn new(ack_id: String, kind: AckKind) -> Self {
        Self { ack_id, kind }
    }

    pub fn ack_id(&self) -> &str {
        &self.ack_id
    }

    pub fn kind(&self) -> AckKind {
        self.kind
    }

    pub(crate) fn into_parts(self) -> (String, AckKind) {
        (self.ack_id, self.kind)
    }
}

/// Session lifecycle notifications delivered to the status handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connected,
    Disconnected,
    Published(MessageId),
    Failed,
}

/// Actions the router cannot take on the notification context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDirective {
    Resync,
    Close,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "cmdType")]
    cmd_type: Option<String>,
    #[serde(alias = "data")]
    d: Option<RawData>,
}

#[derive(Debug, Deserialize)]
struct RawData {
    command: Option<String>,
    #[serde(rename = "ackId")]
    ack_id: Option<String>,
    urls: Option<Vec<RawUrl>>,
    ver: Option<RawVersion>,
}

#[derive(Debug, Deserialize)]
struct RawUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct RawVersion {
    sw: Option<String>,
}

/// Classify a raw devicebound payload into an [`InboundEvent`]
pub fn classify(payload: &[u8]) -> InboundEvent {
    let value: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(e) => {
            warn!("Devicebound payload is not JSON, treating as close directive: {e}");
            return InboundEvent::SessionClose;
        }
    };

    let raw: RawEvent = match serde_json::from_value(value.clone()) {
        Ok(raw) => raw,
        Err(_) => return InboundEvent::SessionClose,
    };

    let cmd_type = match raw.cmd_type.as_deref() {
        Some(t) => t,
        None => return InboundEvent::SessionClose,
    };

    match cmd_type {
        CMD_FORCE_SYNC => return InboundEvent::ForceResync,
        CMD_CLOSE => return InboundEvent::SessionClose,
        _ => {}
    }

    let data = match raw.d {
        Some(data) => data,
        None => return InboundEvent::Unclassified(value),
    };

    // A download URL wins regardless of the discriminator
    if let Some(urls) = &data.urls {
        if let Some(first) = urls.first() {
            return InboundEvent::OtaUpdate(OtaUpdateEvent {
                download_url: first.url.clone(),
                version: data.ver.and_then(|v| v.sw),
                ack: data
                    .ack_id
                    .map(|id| AckHandle::new(id, AckKind::Ota)),
            });
        }
    }

    if let Some(command) = data.command {
        return match cmd_type {
            CMD_DEVICE_OTA => InboundEvent::OtaLegacyCommand(CommandEvent {
                command,
                ack: data.ack_id.map(|id| AckHandle::new(id, AckKind::Ota)),
            }),
            CMD_DEVICE_COMMAND => InboundEvent::Command(CommandEvent {
                command,
                ack: data
                    .ack_id
                    .map(|id| AckHandle::new(id, AckKind::Command)),
            }),
            _ => InboundEvent::Unclassified(value),
        };
    }

    InboundEvent::Unclassified(value)
}

pub type CommandHandler = Box<dyn Fn(CommandEvent) + Send + Sync>;
pub type OtaHandler = Box<dyn Fn(OtaEvent) + Send + Sync>;
pub type StatusHandler = Box<dyn Fn(SessionStatus) + Send + Sync>;
pub type MessageHandler = Box<dyn Fn(Value) + Send + Sync>;

/// Registered application handlers, one slot per kind.
///
/// Re-registering replaces the previous handler. A panicking handler is
/// contained and logged; it never takes the session down.
#[derive(Default)]
pub struct Handlers {
    command: RwLock<Option<CommandHandler>>,
    ota: RwLock<Option<OtaHandler>>,
    status: RwLock<Option<StatusHandler>>,
    message: RwLock<Option<MessageHandler>>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_command(&self, handler: CommandHandler) {
        *self.command.write().expect("handler lock poisoned") = Some(handler);
    }

    pub fn set_ota(&self, handler: OtaHandler) {
        *self.ota.write().expect("handler lock poisoned") = Some(handler);
    }

    pub fn set_status(&self, handler: StatusHandler) {
        *self.status.write().expect("handler lock poisoned") = Some(handler);
    }

    pub fn set_message(&self, handler: MessageHandler) {
        *self.message.write().expect("handler lock poisoned") = Some(handler);
    }

    /// Route one classified event to its handler.
    ///
    /// Returns a directive for events that require session orchestration.
    pub fn dispatch(&self, event: InboundEvent) -> Option<SessionDirective> {
        match event {
            InboundEvent::Command(cmd) => {
                self.invoke(&self.command, cmd, "command");
                None
            }
            InboundEvent::OtaUpdate(update) => {
                self.invoke(&self.ota, OtaEvent::Update(update), "ota");
                None
            }
            InboundEvent::OtaLegacyCommand(cmd) => {
                self.invoke(&self.ota, OtaEvent::LegacyCommand(cmd), "ota");
                None
            }
            InboundEvent::ForceResync => Some(SessionDirective::Resync),
            InboundEvent::SessionClose => Some(SessionDirective::Close),
            InboundEvent::Unclassified(value) => {
                self.invoke(&self.message, value, "message");
                None
            }
        }
    }

    /// Notify the status handler, if one is registered
    pub fn notify_status(&self, status: SessionStatus) {
        self.invoke(&self.status, status, "status");
    }

    fn invoke<E>(&self, slot: &RwLock<Option<Box<dyn Fn(E) + Send + Sync>>>, event: E, name: &str) {
        let guard = slot.read().expect("handler lock poisoned");
        match guard.as_ref() {
            Some(handler) => {
                let result = catch_unwind(AssertUnwindSafe(|| handler(event)));
                if result.is_err() {
                    error!("{name} handler panicked; event dropped");
                }
            }
            None => debug!("No {name} handler registered, dropping event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_classify_device_command() {
        let payload = br#"{"cmdType":"0x01","data":{"command":"led on","ackId":"ack-1"}}"#;
        match classify(payload) {
            InboundEvent::Command(cmd) => {
                assert_eq!(cmd.command, "led on");
                let ack = cmd.ack.unwrap();
                assert_eq!(ack.ack_id(), "ack-1");
                assert_eq!(ack.kind(), AckKind::Command);
            }
            other => panic!("expected Command, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_ota_with_url() {
        let payload = br#"{"cmdType":"0x02","data":{
            "urls":[{"url":"https://fw.example.com/v2.bin","fileName":"v2.bin"}],
            "ver":{"sw":"2.0.0"},"ackId":"ack-2"}}"#;
        match classify(payload) {
            InboundEvent::OtaUpdate(ota) => {
                assert_eq!(ota.download_url, "https://fw.example.com/v2.bin");
                assert_eq!(ota.version.as_deref(), Some("2.0.0"));
                assert_eq!(ota.ack.unwrap().kind(), AckKind::Ota);
            }
            other => panic!("expected OtaUpdate, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_legacy_ota_command() {
        let payload =
            br#"{"cmdType":"0x02","data":{"command":"ota https://fw.example.com/v1.bin"}}"#;
        match classify(payload) {
            InboundEvent::OtaLegacyCommand(cmd) => {
                assert!(cmd.command.starts_with("ota "));
                assert!(cmd.ack.is_none());
            }
            other => panic!("expected OtaLegacyCommand, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_force_sync_and_close() {
        assert!(matches!(
            classify(br#"{"cmdType":"0x12"}"#),
            InboundEvent::ForceResync
        ));
        assert!(matches!(
            classify(br#"{"cmdType":"0x99"}"#),
            InboundEvent::SessionClose
        ));
    }

    #[test]
    fn test_unrecognized_structure_is_close() {
        assert!(matches!(classify(b"not json"), InboundEvent::SessionClose));
        assert!(matches!(
            classify(br#"{"unrelated":true}"#),
            InboundEvent::SessionClose
        ));
    }

    #[test]
    fn test_unknown_discriminator_is_unclassified() {
        let payload = br#"{"cmdType":"0x42","data":{"command":"what"}}"#;
        assert!(matches!(
            classify(payload),
            InboundEvent::Unclassified(_)
        ));
    }

    #[test]
    fn test_dispatch_routes_to_command_handler() {
        let handlers = Handlers::new();
        let seen = Arc::new(AtomicU32::new(0));
        let seen_clone = seen.clone();
        handlers.set_command(Box::new(move |cmd| {
            assert_eq!(cmd.command, "reboot");
            seen_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let directive = handlers.dispatch(InboundEvent::Command(CommandEvent {
            command: "reboot".to_string(),
            ack: None,
        }));
        assert!(directive.is_none());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_returns_directives() {
        let handlers = Handlers::new();
        assert_eq!(
            handlers.dispatch(InboundEvent::ForceResync),
            Some(SessionDirective::Resync)
        );
        assert_eq!(
            handlers.dispatch(InboundEvent::SessionClose),
            Some(SessionDirective::Close)
        );
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let handlers = Handlers::new();
        handlers.set_command(Box::new(|_| panic!("handler bug")));
        let directive = handlers.dispatch(InboundEvent::Command(CommandEvent {
            command: "boom".to_string(),
            ack: None,
        }));
        assert!(directive.is_none());
        // a later event still dispatches
        assert_eq!(
            handlers.dispatch(InboundEvent::SessionClose),
            Some(SessionDirective::Close)
        );
    }

    #[test]
    fn test_reregistering_replaces_handler() {
        let handlers = Handlers::new();
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));

        let c = first.clone();
        handlers.set_status(Box::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        let c = second.clone();
        handlers.set_status(Box::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        handlers.notify_status(SessionStatus::Connected);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
