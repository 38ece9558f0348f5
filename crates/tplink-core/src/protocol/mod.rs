//! Protocol layer: query semantics on top of a transport.
//!
//! - [`IotProtocol`]: stateless JSON requests for the legacy dialect.
//! - [`SmartProtocol`]: JSON-RPC with `multipleRequest` batching,
//!   pagination, and per-method error attribution.
//! - [`SmartCamProtocol`]: the Smart semantics with the camera firmware's
//!   renamed wrappers (`get`/`set`/`do`, `controlChild`).
//!
//! A protocol owns exactly one transport and serializes `query()` calls
//! behind a mutex, so a handshake re-driven by one caller can never
//! interleave with another caller's passthrough.

pub mod iot;
pub mod smart;
pub mod smartcam;

pub use iot::IotProtocol;
pub use smart::SmartProtocol;
pub use smartcam::SmartCamProtocol;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::{DeviceConfig, DeviceFamily, EncryptionType};
use crate::error::Error;
use crate::transport::{AesTransport, KlapTransport, XorTransport};

/// Default retry budget for a `query()`.
pub const DEFAULT_RETRIES: usize = 3;

/// Backoff between retry attempts for timeouts and retryable errors.
pub(crate) const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// A device query interface.
#[async_trait]
pub trait Protocol: Send + Sync {
    /// Sends a request and returns the decoded response.
    ///
    /// For the Smart dialects the request is an object mapping method names
    /// to parameters; for the IoT dialect it is the legacy nested JSON.
    async fn query(&self, request: Value) -> Result<Value, Error>;

    /// Closes the protocol and its transport.
    async fn close(&self);
}

/// Builds the protocol/transport pair for a device config.
///
/// The `(family, encryption, https)` tuple selects the pair; combinations
/// outside the table are unsupported.
pub fn create_protocol(config: &DeviceConfig) -> Result<Box<dyn Protocol>, Error> {
    use DeviceFamily::*;

    let family = config.connection_type.device_family;
    let encryption = config.connection_type.encryption_type;
    let https = config.connection_type.https;

    let smart = |protocol: SmartProtocol| match config.batch_size {
        Some(batch_size) => protocol.with_batch_size(batch_size),
        None => protocol,
    };
    let smartcam = |protocol: SmartCamProtocol| match config.batch_size {
        Some(batch_size) => protocol.with_batch_size(batch_size),
        None => protocol,
    };

    match (family, encryption) {
        // Camera-dialect families always ride the TLS passthrough.
        (SmartIpCamera | SmartTapoDoorbell, EncryptionType::Aes) => {
            let config = force_https(config);
            Ok(Box::new(smartcam(SmartCamProtocol::new(Box::new(
                AesTransport::new(&config)?,
            )))))
        }
        (SmartTapoRobovac, EncryptionType::Aes) => {
            let config = force_https(config);
            Ok(Box::new(smart(SmartProtocol::new(Box::new(
                AesTransport::new(&config)?,
            )))))
        }
        (IotIpCamera, EncryptionType::Xor) => Err(Error::UnsupportedDevice(
            "IOT cameras speak a separate dialect".into(),
        )),
        (family, EncryptionType::Xor) if family.is_iot() => {
            if https {
                return Err(Error::UnsupportedDevice(
                    "XOR devices do not serve HTTPS".into(),
                ));
            }
            Ok(Box::new(IotProtocol::new(Box::new(XorTransport::new(
                config,
            )?))))
        }
        (family, EncryptionType::Klap) if family.is_iot() => Ok(Box::new(IotProtocol::new(
            Box::new(KlapTransport::new(config, false)?),
        ))),
        (family, EncryptionType::Klap) if !family.is_iot() => Ok(Box::new(smart(
            SmartProtocol::new(Box::new(KlapTransport::new(config, true)?)),
        ))),
        (family, EncryptionType::Aes) if !family.is_iot() => {
            if https {
                Ok(Box::new(smartcam(SmartCamProtocol::new(Box::new(
                    AesTransport::new(config)?,
                )))))
            } else {
                Ok(Box::new(smart(SmartProtocol::new(Box::new(
                    AesTransport::new(config)?,
                )))))
            }
        }
        (family, encryption) => Err(Error::UnsupportedDevice(format!(
            "no protocol for {family} over {encryption}"
        ))),
    }
}

fn force_https(config: &DeviceConfig) -> DeviceConfig {
    let mut config = config.clone();
    config.connection_type.https = true;
    config
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use crate::transport::Transport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Transport driven by a closure over the parsed request, with an
    /// optional run of scripted failures before it.
    pub(crate) struct ScriptedTransport {
        respond: Box<dyn FnMut(Value) -> Value + Send>,
        failures: usize,
        attempts: AtomicUsize,
        error: Option<Box<dyn Fn() -> Error + Send + Sync>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(respond: impl FnMut(Value) -> Value + Send + 'static) -> Self {
            Self {
                respond: Box::new(respond),
                failures: 0,
                attempts: AtomicUsize::new(0),
                error: None,
            }
        }

        pub(crate) fn failing_then(
            failures: usize,
            error: impl Fn() -> Error + Send + Sync + 'static,
            respond: impl FnMut(Value) -> Value + Send + 'static,
        ) -> Self {
            Self {
                respond: Box::new(respond),
                failures,
                attempts: AtomicUsize::new(0),
                error: Some(Box::new(error)),
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn default_port(&self) -> u16 {
            80
        }

        fn credentials_hash(&self) -> Option<String> {
            None
        }

        async fn send(&mut self, request: &str) -> Result<Value, Error> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                let error = self.error.as_ref().expect("failure run configured");
                return Err(error());
            }
            let request: Value = serde_json::from_str(request)?;
            Ok((self.respond)(request))
        }

        async fn reset(&mut self) {}

        async fn close(&mut self) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionType;

    fn config(family: DeviceFamily, encryption: EncryptionType, https: bool) -> DeviceConfig {
        DeviceConfig::new("127.0.0.1").with_connection_type(
            ConnectionType::new(family, encryption).with_https(https),
        )
    }

    #[test]
    fn test_supported_rows() {
        for (family, encryption, https) in [
            (DeviceFamily::IotSmartPlugSwitch, EncryptionType::Xor, false),
            (DeviceFamily::IotSmartBulb, EncryptionType::Klap, false),
            (DeviceFamily::SmartTapoPlug, EncryptionType::Aes, false),
            (DeviceFamily::SmartTapoPlug, EncryptionType::Klap, false),
            (DeviceFamily::SmartTapoPlug, EncryptionType::Klap, true),
            (DeviceFamily::SmartKasaHub, EncryptionType::Aes, true),
            (DeviceFamily::SmartIpCamera, EncryptionType::Aes, false),
            (DeviceFamily::SmartTapoDoorbell, EncryptionType::Aes, true),
            (DeviceFamily::SmartTapoRobovac, EncryptionType::Aes, false),
        ] {
            assert!(
                create_protocol(&config(family, encryption, https)).is_ok(),
                "expected support for {family} {encryption} https={https}"
            );
        }
    }

    #[test]
    fn test_unsupported_rows() {
        for (family, encryption, https) in [
            (DeviceFamily::IotIpCamera, EncryptionType::Xor, false),
            (DeviceFamily::IotSmartBulb, EncryptionType::Xor, true),
            (DeviceFamily::IotSmartBulb, EncryptionType::Aes, false),
        ] {
            assert!(matches!(
                create_protocol(&config(family, encryption, https)),
                Err(Error::UnsupportedDevice(_)),
            ));
        }
    }
}
