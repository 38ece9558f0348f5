//! Connection configuration for a single device.
//!
//! A [`DeviceConfig`] carries everything the protocol factory needs to build
//! a working protocol/transport pair: host, timeout, credentials (live or
//! hashed), and the [`ConnectionType`] tuple discovered for the device.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::credentials::Credentials;

/// Default per-operation timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Device family string as reported by discovery.
///
/// The `IOT.*` families speak the legacy JSON dialect; the `SMART.*`
/// families speak the JSON-RPC dialect with `multipleRequest` batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceFamily {
    #[serde(rename = "IOT.SMARTPLUGSWITCH")]
    IotSmartPlugSwitch,
    #[serde(rename = "IOT.SMARTBULB")]
    IotSmartBulb,
    #[serde(rename = "IOT.IPCAMERA")]
    IotIpCamera,
    #[serde(rename = "SMART.KASAPLUG")]
    SmartKasaPlug,
    #[serde(rename = "SMART.KASASWITCH")]
    SmartKasaSwitch,
    #[serde(rename = "SMART.KASAHUB")]
    SmartKasaHub,
    #[serde(rename = "SMART.TAPOPLUG")]
    SmartTapoPlug,
    #[serde(rename = "SMART.TAPOBULB")]
    SmartTapoBulb,
    #[serde(rename = "SMART.TAPOSWITCH")]
    SmartTapoSwitch,
    #[serde(rename = "SMART.TAPOHUB")]
    SmartTapoHub,
    #[serde(rename = "SMART.IPCAMERA")]
    SmartIpCamera,
    #[serde(rename = "SMART.TAPODOORBELL")]
    SmartTapoDoorbell,
    #[serde(rename = "SMART.TAPOROBOVAC")]
    SmartTapoRobovac,
    #[serde(rename = "SMART.TAPOCHIME")]
    SmartTapoChime,
}

impl DeviceFamily {
    /// The wire string for this family.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceFamily::IotSmartPlugSwitch => "IOT.SMARTPLUGSWITCH",
            DeviceFamily::IotSmartBulb => "IOT.SMARTBULB",
            DeviceFamily::IotIpCamera => "IOT.IPCAMERA",
            DeviceFamily::SmartKasaPlug => "SMART.KASAPLUG",
            DeviceFamily::SmartKasaSwitch => "SMART.KASASWITCH",
            DeviceFamily::SmartKasaHub => "SMART.KASAHUB",
            DeviceFamily::SmartTapoPlug => "SMART.TAPOPLUG",
            DeviceFamily::SmartTapoBulb => "SMART.TAPOBULB",
            DeviceFamily::SmartTapoSwitch => "SMART.TAPOSWITCH",
            DeviceFamily::SmartTapoHub => "SMART.TAPOHUB",
            DeviceFamily::SmartIpCamera => "SMART.IPCAMERA",
            DeviceFamily::SmartTapoDoorbell => "SMART.TAPODOORBELL",
            DeviceFamily::SmartTapoRobovac => "SMART.TAPOROBOVAC",
            DeviceFamily::SmartTapoChime => "SMART.TAPOCHIME",
        }
    }

    /// Parses a discovery `device_type` string.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "IOT.SMARTPLUGSWITCH" => Some(DeviceFamily::IotSmartPlugSwitch),
            "IOT.SMARTBULB" => Some(DeviceFamily::IotSmartBulb),
            "IOT.IPCAMERA" => Some(DeviceFamily::IotIpCamera),
            "SMART.KASAPLUG" => Some(DeviceFamily::SmartKasaPlug),
            "SMART.KASASWITCH" => Some(DeviceFamily::SmartKasaSwitch),
            "SMART.KASAHUB" => Some(DeviceFamily::SmartKasaHub),
            "SMART.TAPOPLUG" => Some(DeviceFamily::SmartTapoPlug),
            "SMART.TAPOBULB" => Some(DeviceFamily::SmartTapoBulb),
            "SMART.TAPOSWITCH" => Some(DeviceFamily::SmartTapoSwitch),
            "SMART.TAPOHUB" => Some(DeviceFamily::SmartTapoHub),
            "SMART.IPCAMERA" => Some(DeviceFamily::SmartIpCamera),
            "SMART.TAPODOORBELL" => Some(DeviceFamily::SmartTapoDoorbell),
            "SMART.TAPOROBOVAC" => Some(DeviceFamily::SmartTapoRobovac),
            "SMART.TAPOCHIME" => Some(DeviceFamily::SmartTapoChime),
            _ => None,
        }
    }

    /// Whether this family is part of the legacy IOT dialect.
    pub fn is_iot(&self) -> bool {
        self.as_str().starts_with("IOT.")
    }

    /// Camera-dialect families (renamed JSON-RPC wrappers).
    pub fn is_camera_dialect(&self) -> bool {
        matches!(
            self,
            DeviceFamily::SmartIpCamera | DeviceFamily::SmartTapoDoorbell
        )
    }
}

impl std::fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encryption scheme used by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EncryptionType {
    /// Legacy XOR autokey cipher on TCP 9999 (no authentication).
    #[default]
    #[serde(rename = "XOR")]
    Xor,
    /// RSA-negotiated AES session tunnelled through `securePassthrough`.
    #[serde(rename = "AES")]
    Aes,
    /// Seed-exchange handshake with derived AES keys and request sequencing.
    #[serde(rename = "KLAP")]
    Klap,
}

impl std::fmt::Display for EncryptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncryptionType::Xor => write!(f, "XOR"),
            EncryptionType::Aes => write!(f, "AES"),
            EncryptionType::Klap => write!(f, "KLAP"),
        }
    }
}

/// The (family, encryption, login-version, https, port) tuple that selects a
/// protocol/transport pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionType {
    /// Device family reported by discovery.
    pub device_family: DeviceFamily,
    /// Encryption scheme.
    pub encryption_type: EncryptionType,
    /// Login version (`lv` in the discovery schema); 2 hashes the password.
    #[serde(default)]
    pub login_version: Option<u8>,
    /// Whether the device requires HTTPS.
    #[serde(default)]
    pub https: bool,
    /// HTTP port override from the discovery schema.
    #[serde(default)]
    pub http_port: Option<u16>,
}

impl ConnectionType {
    /// Creates a connection type with the given family and encryption.
    pub fn new(device_family: DeviceFamily, encryption_type: EncryptionType) -> Self {
        Self {
            device_family,
            encryption_type,
            login_version: None,
            https: false,
            http_port: None,
        }
    }

    /// Sets the login version.
    pub fn with_login_version(mut self, login_version: u8) -> Self {
        self.login_version = Some(login_version);
        self
    }

    /// Enables HTTPS.
    pub fn with_https(mut self, https: bool) -> Self {
        self.https = https;
        self
    }

    /// Sets the HTTP port.
    pub fn with_http_port(mut self, port: u16) -> Self {
        self.http_port = Some(port);
        self
    }
}

impl Default for ConnectionType {
    fn default() -> Self {
        Self::new(DeviceFamily::IotSmartPlugSwitch, EncryptionType::Xor)
    }
}

/// A cached RSA keypair, base64-encoded DER, persisted on a config so the
/// AES handshake can skip key generation on reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPairData {
    /// Base64 PKCS#8 DER private key.
    pub private_key: String,
    /// Base64 SPKI DER public key.
    pub public_key: String,
}

/// Configuration for connecting to a device.
///
/// Exactly one of `credentials` / `credentials_hash` must be able to
/// authenticate; both may be present, in which case the hash wins for
/// transports that accept it.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// The device hostname or IP address.
    pub host: String,
    /// Optional port override (transport default otherwise).
    pub port_override: Option<u16>,
    /// Per-operation timeout.
    pub timeout: Duration,
    /// Live credentials for KLAP/AES authentication.
    pub credentials: Option<Credentials>,
    /// Opaque transport-specific base64 blob, an alternative to live
    /// credentials.
    pub credentials_hash: Option<String>,
    /// Maximum methods per `multipleRequest` batch; transport default when
    /// unset.
    pub batch_size: Option<usize>,
    /// How to talk to the device.
    pub connection_type: ConnectionType,
    /// Cached RSA keypair for the AES handshake.
    pub aes_keys: Option<KeyPairData>,
}

impl DeviceConfig {
    /// Creates a configuration for `host` with defaults everywhere else.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port_override: None,
            timeout: DEFAULT_TIMEOUT,
            credentials: None,
            credentials_hash: None,
            batch_size: None,
            connection_type: ConnectionType::default(),
            aes_keys: None,
        }
    }

    /// Sets the port override.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port_override = Some(port);
        self
    }

    /// Sets the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets live credentials.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Sets a pre-computed credentials hash.
    pub fn with_credentials_hash(mut self, hash: impl Into<String>) -> Self {
        self.credentials_hash = Some(hash.into());
        self
    }

    /// Sets the connection type.
    pub fn with_connection_type(mut self, connection_type: ConnectionType) -> Self {
        self.connection_type = connection_type;
        self
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// The credentials to authenticate with, blank when none were provided.
    pub fn credentials_or_blank(&self) -> Credentials {
        self.credentials.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_parse_roundtrip() {
        for family in [
            DeviceFamily::IotSmartPlugSwitch,
            DeviceFamily::SmartTapoPlug,
            DeviceFamily::SmartIpCamera,
            DeviceFamily::SmartTapoRobovac,
        ] {
            assert_eq!(DeviceFamily::parse(family.as_str()), Some(family));
        }
        assert_eq!(DeviceFamily::parse("SMART.WIDGET"), None);
    }

    #[test]
    fn test_family_predicates() {
        assert!(DeviceFamily::IotSmartBulb.is_iot());
        assert!(!DeviceFamily::SmartTapoPlug.is_iot());
        assert!(DeviceFamily::SmartIpCamera.is_camera_dialect());
        assert!(DeviceFamily::SmartTapoDoorbell.is_camera_dialect());
        assert!(!DeviceFamily::SmartTapoRobovac.is_camera_dialect());
    }

    #[test]
    fn test_connection_type_builder() {
        let ctype = ConnectionType::new(DeviceFamily::SmartTapoPlug, EncryptionType::Klap)
            .with_login_version(2)
            .with_http_port(8080);
        assert_eq!(ctype.login_version, Some(2));
        assert_eq!(ctype.http_port, Some(8080));
        assert!(!ctype.https);
    }

    #[test]
    fn test_connection_type_serde() {
        let ctype = ConnectionType::new(DeviceFamily::SmartTapoBulb, EncryptionType::Aes);
        let json = serde_json::to_string(&ctype).unwrap();
        assert!(json.contains("SMART.TAPOBULB"));
        assert!(json.contains("AES"));
        let back: ConnectionType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ctype);
    }

    #[test]
    fn test_device_config_defaults() {
        let config = DeviceConfig::new("192.168.1.100");
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert!(config.credentials.is_none());
        assert!(config.credentials_or_blank().is_blank());
    }
}
