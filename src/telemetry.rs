//! Outbound payload construction
//!
//! Builds the telemetry envelope around caller-supplied typed fields and
//! the acknowledgment payloads for command/OTA events. Field order is
//! preserved exactly as supplied; nothing is added beyond the envelope.

use crate::events::{AckHandle, AckKind};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

// Protocol revision advertised in every telemetry envelope
const SDK_LANG: &str = "M_C";
const SDK_VERSION: &str = "2.0";

// Ack type discriminators and status codes on the wire
const ACK_TYPE_COMMAND: u8 = 5;
const ACK_TYPE_OTA: u8 = 11;
const ACK_STATUS_COMMAND_OK: u8 = 6;
const ACK_STATUS_OTA_OK: u8 = 7;
const ACK_STATUS_FAILED: u8 = 4;

/// Identity fields stamped onto every telemetry payload.
///
/// The data transfer group comes from discovery and routes the payload
/// server-side; it is replaced together with the broker descriptor on
/// every rediscovery.
#[derive(Debug, Clone)]
pub struct TelemetryContext {
    pub company_id: String,
    pub device_id: String,
    pub environment: String,
    pub data_transfer_group: String,
}

/// Typed scalar accepted as a telemetry field
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryValue {
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl From<&str> for TelemetryValue {
    fn from(v: &str) -> Self {
        TelemetryValue::String(v.to_string())
    }
}

impl From<String> for TelemetryValue {
    fn from(v: String) -> Self {
        TelemetryValue::String(v)
    }
}

impl From<i64> for TelemetryValue {
    fn from(v: i64) -> Self {
        TelemetryValue::Integer(v)
    }
}

impl From<i32> for TelemetryValue {
    fn from(v: i32) -> Self {
        TelemetryValue::Integer(v as i64)
    }
}

impl From<f64> for TelemetryValue {
    fn from(v: f64) -> Self {
        TelemetryValue::Float(v)
    }
}

impl From<bool> for TelemetryValue {
    fn from(v: bool) -> Self {
        TelemetryValue::Bool(v)
    }
}

impl From<TelemetryValue> for Value {
    fn from(v: TelemetryValue) -> Self {
        match v {
            TelemetryValue::String(s) => Value::String(s),
            TelemetryValue::Integer(i) => Value::from(i),
            TelemetryValue::Float(f) => Value::from(f),
            TelemetryValue::Bool(b) => Value::Bool(b),
        }
    }
}

/// Ordered field set for one telemetry report.
///
/// Not retained after serialization; build, serialize, publish, drop.
#[derive(Debug, Default)]
pub struct TelemetryMessage {
    fields: Map<String, Value>,
}

impl TelemetryMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field, replacing any previous value under the same name
    pub fn set(&mut self, name: &str, value: impl Into<TelemetryValue>) -> &mut Self {
        self.fields.insert(name.to_string(), value.into().into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Serialize)]
struct TelemetryEnvelope<'a> {
    cpid: &'a str,
    dtg: &'a str,
    mt: u8,
    sdk: SdkInfo<'a>,
    t: String,
    d: Vec<TelemetryEntry<'a>>,
}

#[derive(Serialize)]
struct SdkInfo<'a> {
    l: &'static str,
    v: &'static str,
    e: &'a str,
}

#[derive(Serialize)]
struct TelemetryEntry<'a> {
    id: &'a str,
    tg: &'static str,
    dt: String,
    d: Map<String, Value>,
}

/// Serialize a telemetry message into its wire payload
pub fn build_telemetry(
    context: &TelemetryContext,
    message: TelemetryMessage,
) -> Result<Vec<u8>, serde_json::Error> {
    let now = timestamp();
    let envelope = TelemetryEnvelope {
        cpid: &context.company_id,
        dtg: &context.data_transfer_group,
        mt: 0,
        sdk: SdkInfo {
            l: SDK_LANG,
            v: SDK_VERSION,
            e: &context.environment,
        },
        t: now.clone(),
        d: vec![TelemetryEntry {
            id: &context.device_id,
            tg: "",
            dt: now,
            d: message.fields,
        }],
    };
    serde_json::to_vec(&envelope)
}

#[derive(Serialize)]
struct AckEnvelope<'a> {
    dt: String,
    d: AckBody<'a>,
}

#[derive(Serialize)]
struct AckBody<'a> {
    #[serde(rename = "ackId")]
    ack_id: String,
    #[serde(rename = "type")]
    ack_type: u8,
    st: u8,
    msg: Option<&'a str>,
}

/// Build an acknowledgment payload, consuming the event's ack handle.
///
/// Taking the handle by value is what makes double-acknowledgment
/// unrepresentable.
pub fn build_ack(
    ack: AckHandle,
    success: bool,
    message: Option<&str>,
) -> Result<Vec<u8>, serde_json::Error> {
    let (ack_id, kind) = ack.into_parts();
    let (ack_type, ok_status) = match kind {
        AckKind::Command => (ACK_TYPE_COMMAND, ACK_STATUS_COMMAND_OK),
        AckKind::Ota => (ACK_TYPE_OTA, ACK_STATUS_OTA_OK),
    };
    let envelope = AckEnvelope {
        dt: timestamp(),
        d: AckBody {
            ack_id,
            ack_type,
            st: if success { ok_status } else { ACK_STATUS_FAILED },
            msg: message,
        },
    };
    serde_json::to_vec(&envelope)
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
