//! Device-side session manager for the IoTConnect platform
//!
//! Takes a device identity (environment, company id, device id), resolves
//! the MQTT broker assignment through the two-stage HTTP discovery
//! protocol, and supervises the broker session: connect, subscribe,
//! publish telemetry and acknowledgments, and react to server directives
//! such as forced resync.
//!
//! # Example
//!
//! ```no_run
//! use iotc_session::config::SessionConfig;
//! use iotc_session::session::IotcSession;
//! use iotc_session::telemetry::TelemetryMessage;
//! use iotc_session::transport::MqttTransport;
//!
//! # async fn run() -> Result<(), iotc_session::error::SessionError> {
//! let config = SessionConfig::for_testing("avnetpoc", "MYCPID", "my-device");
//! let session = IotcSession::new(config, MqttTransport::new());
//! session.start().await?;
//!
//! let mut message = TelemetryMessage::new();
//! message.set("cpu", 33);
//! session.publish_telemetry(message).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod observability;
pub mod session;
pub mod telemetry;
pub mod testing;
pub mod transport;

pub use config::{DeviceConfig, SessionConfig};
pub use discovery::protocol::BrokerDescriptor;
pub use error::{SessionError, SessionResult};
pub use events::{AckHandle, CommandEvent, OtaEvent, SessionStatus};
pub use session::{IotcSession, SessionState};
pub use telemetry::TelemetryMessage;
pub use transport::MqttTransport;
