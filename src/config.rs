//! Configuration loading for the device session
//!
//! Two layers: `DeviceConfig` is the on-disk TOML shape consumed by the
//! binary, `SessionConfig` is what the library actually takes. The split
//! keeps file handling and path resolution out of the session core.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default host for the first discovery stage.
pub const DEFAULT_DISCOVERY_HOST: &str = "discovery.iotconnect.io";

/// Top-level device configuration loaded from TOML
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub device: DeviceSection,
    #[serde(default)]
    pub session: SessionSection,
    pub tls: TlsSection,
    #[serde(default)]
    pub demo: DemoSection,
}

/// Identity triple used by discovery
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Platform environment name (e.g. "avnetpoc")
    pub environment: String,
    /// Company profile id (CPID)
    pub company_id: String,
    /// Unique device id (DUID)
    pub device_id: String,
}

/// Session tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    /// Base timeout for blocking session operations, in seconds.
    /// Connect and subscribe wait twice this long.
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    /// How many times discovery retries the transient parse failure
    #[serde(default = "default_discovery_retry_count")]
    pub discovery_retry_count: u32,
    /// MQTT keep-alive interval in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Discovery host override, mainly for test environments
    #[serde(default = "default_discovery_host")]
    pub discovery_host: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            operation_timeout_secs: default_operation_timeout_secs(),
            discovery_retry_count: default_discovery_retry_count(),
            keep_alive_secs: default_keep_alive_secs(),
            discovery_host: default_discovery_host(),
        }
    }
}

fn default_operation_timeout_secs() -> u64 {
    10
}

fn default_discovery_retry_count() -> u32 {
    3
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_discovery_host() -> String {
    DEFAULT_DISCOVERY_HOST.to_string()
}

/// Paths to the PEM files presented to the broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TlsSection {
    pub ca_cert: PathBuf,
    pub client_cert: PathBuf,
    pub private_key: PathBuf,
}

/// Settings for the demo telemetry loop in the binary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DemoSection {
    #[serde(default = "default_telemetry_interval_secs")]
    pub telemetry_interval_secs: u64,
    #[serde(default = "default_telemetry_iterations")]
    pub telemetry_iterations: u32,
    #[serde(default = "default_app_version")]
    pub app_version: String,
}

impl Default for DemoSection {
    fn default() -> Self {
        Self {
            telemetry_interval_secs: default_telemetry_interval_secs(),
            telemetry_iterations: default_telemetry_iterations(),
            app_version: default_app_version(),
        }
    }
}

fn default_telemetry_interval_secs() -> u64 {
    20
}

fn default_telemetry_iterations() -> u32 {
    10
}

fn default_app_version() -> String {
    "00.00.01".to_string()
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid device id format: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Credential file {path} is invalid: {reason}")]
    InvalidCredential { path: PathBuf, reason: String },
}

impl DeviceConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: DeviceConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_device_id(&self.device.device_id)?;
        if self.device.company_id.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "device.company_id must not be empty".to_string(),
            ));
        }
        if self.device.environment.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "device.environment must not be empty".to_string(),
            ));
        }
        if self.session.discovery_retry_count == 0 {
            return Err(ConfigError::InvalidConfig(
                "session.discovery_retry_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the library-level session configuration, loading credentials
    pub fn to_session_config(&self) -> Result<SessionConfig, ConfigError> {
        let security = SecurityMaterial::load(&self.tls)?;
        Ok(SessionConfig {
            environment: self.device.environment.clone(),
            company_id: self.device.company_id.clone(),
            device_id: self.device.device_id.clone(),
            operation_timeout: Duration::from_secs(self.session.operation_timeout_secs),
            discovery_retry_count: self.session.discovery_retry_count,
            keep_alive: Duration::from_secs(self.session.keep_alive_secs),
            discovery_host: self.session.discovery_host.clone(),
            security: Some(security),
        })
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
environment = "testenv"
company_id = "TESTCPID"
device_id = "test-device-01"

[tls]
ca_cert = "certs/rootca.pem"
client_cert = "certs/client.pem"
private_key = "certs/privkey.pem"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Runtime session configuration consumed by [`crate::session::IotcSession`]
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub environment: String,
    pub company_id: String,
    pub device_id: String,
    pub operation_timeout: Duration,
    pub discovery_retry_count: u32,
    pub keep_alive: Duration,
    pub discovery_host: String,
    /// PEM material handed to the transport on every connect
    pub security: Option<SecurityMaterial>,
}

impl SessionConfig {
    /// Minimal config for tests; no TLS material, short timeouts.
    pub fn for_testing(environment: &str, company_id: &str, device_id: &str) -> Self {
        Self {
            environment: environment.to_string(),
            company_id: company_id.to_string(),
            device_id: device_id.to_string(),
            operation_timeout: Duration::from_millis(200),
            discovery_retry_count: 3,
            keep_alive: Duration::from_secs(30),
            discovery_host: DEFAULT_DISCOVERY_HOST.to_string(),
            security: None,
        }
    }
}

/// PEM buffers presented to the broker during the TLS handshake
#[derive(Debug, Clone)]
pub struct SecurityMaterial {
    pub ca_cert: Vec<u8>,
    pub client_cert: Vec<u8>,
    pub private_key: Vec<u8>,
}

// Anything shorter than this cannot be a PEM body; it is almost always a
// placeholder file that was never replaced with real credentials.
const MIN_CREDENTIAL_LEN: usize = 64;

impl SecurityMaterial {
    /// Read all three PEM files, rejecting obvious placeholders
    pub fn load(tls: &TlsSection) -> Result<Self, ConfigError> {
        Ok(Self {
            ca_cert: read_credential(&tls.ca_cert)?,
            client_cert: read_credential(&tls.client_cert)?,
            private_key: read_credential(&tls.private_key)?,
        })
    }
}

fn read_credential(path: &Path) -> Result<Vec<u8>, ConfigError> {
    let bytes = std::fs::read(path)?;
    if bytes.len() < MIN_CREDENTIAL_LEN {
        return Err(ConfigError::InvalidCredential {
            path: path.to_path_buf(),
            reason: format!("{} bytes is too short to be a PEM file", bytes.len()),
        });
    }
    Ok(bytes)
}

/// Device ids become part of MQTT client ids and REST paths, so keep the
/// character set conservative.
fn validate_device_id(device_id: &str) -> Result<(), ConfigError> {
    let valid_chars = device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if device_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidDeviceId(format!(
            "Device id '{device_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_full_config_parses() {
        let toml_content = r#"
[device]
environment = "avnetpoc"
company_id = "ABCDEF0123456789"
device_id = "wiced-demo-01"

[session]
operation_timeout_secs = 15
discovery_retry_count = 5
keep_alive_secs = 45
discovery_host = "discovery.example.com"

[tls]
ca_cert = "certs/rootca.pem"
client_cert = "certs/client.pem"
private_key = "certs/privkey.pem"

[demo]
telemetry_interval_secs = 5
telemetry_iterations = 3
app_version = "01.02.03"
"#;

        let config: DeviceConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.device.environment, "avnetpoc");
        assert_eq!(config.device.device_id, "wiced-demo-01");
        assert_eq!(config.session.operation_timeout_secs, 15);
        assert_eq!(config.session.discovery_retry_count, 5);
        assert_eq!(config.session.discovery_host, "discovery.example.com");
        assert_eq!(config.demo.telemetry_iterations, 3);
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = DeviceConfig::test_config();
        assert_eq!(config.session.operation_timeout_secs, 10);
        assert_eq!(config.session.discovery_retry_count, 3);
        assert_eq!(config.session.keep_alive_secs, 30);
        assert_eq!(config.session.discovery_host, DEFAULT_DISCOVERY_HOST);
        assert_eq!(config.demo.telemetry_iterations, 10);
    }

    #[test]
    fn test_invalid_device_id() {
        assert!(validate_device_id("bad device!").is_err());
        assert!(validate_device_id("").is_err());
        assert!(validate_device_id("valid-device_123.a").is_ok());
    }

    #[test]
    fn test_zero_retry_count_rejected() {
        let mut config = DeviceConfig::test_config();
        config.session.discovery_retry_count = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[device]
environment = "testenv"
company_id = "CPID"
device_id = "dev-1"

[tls]
ca_cert = "a.pem"
client_cert = "b.pem"
private_key = "c.pem"
"#
        )
        .unwrap();

        let config = DeviceConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.device.company_id, "CPID");
    }

    #[test]
    fn test_short_credential_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rootca.pem");
        std::fs::write(&path, b"placeholder").unwrap();

        let err = read_credential(&path).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCredential { .. }));
    }

    #[test]
    fn test_credential_of_valid_size_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.pem");
        let pem = vec![b'A'; 128];
        std::fs::write(&path, &pem).unwrap();

        assert_eq!(read_credential(&path).unwrap(), pem);
    }
}
