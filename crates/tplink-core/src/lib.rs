//! Core library for controlling TP-Link smart home devices over the local
//! network.
//!
//! Covers both device generations end-to-end: the legacy "IOT" dialect
//! (plugs, bulbs, strips, dimmers) and the newer "SMART" dialect (Tapo and
//! newer Kasa plugs, bulbs, switches, hubs, cameras).
//!
//! # Overview
//!
//! Three wire protocols are implemented:
//!
//! 1. **XOR**: length-prefixed autokey stream over TCP 9999, no
//!    authentication. The same cipher, without the length prefix, drives
//!    UDP discovery on port 9999.
//! 2. **AES passthrough**: an RSA handshake agrees a per-session AES key;
//!    JSON requests travel base64-encrypted inside a `securePassthrough`
//!    envelope over HTTP (or permissive TLS for cameras).
//! 3. **KLAP**: a seed-exchange handshake derives AES key, IV, and
//!    signature material; every request carries a strictly increasing
//!    sequence number.
//!
//! Above the wire, the protocol layer batches logical queries into
//! `multipleRequest` calls, paginates list results, attributes per-method
//! errors, and retries through session recovery. Discovery probes both UDP
//! ports, classifies the replies, and assembles a ready-to-use
//! [`DeviceConfig`] per device.
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use tplink_core::{Credentials, Discovery, Protocol, create_protocol};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tplink_core::Error> {
//!     let discovery = Discovery::new()
//!         .with_credentials(Credentials::new("user@example.com", "password"));
//!     let device = discovery.discover_single("192.168.1.100").await?;
//!
//!     let protocol = create_protocol(&device.config)?;
//!     let info = protocol.query(json!({"get_device_info": null})).await?;
//!     println!("{info}");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod credentials;
pub mod crypto;
pub mod discovery;
pub mod emeter;
pub mod error;
pub mod http;
pub mod protocol;
pub mod transport;

pub use config::{ConnectionType, DeviceConfig, DeviceFamily, EncryptionType, KeyPairData};
pub use credentials::{Credentials, DefaultCredentials};
pub use discovery::{DiscoveredDevice, Discovery, DiscoveryReport, DiscoveryResult};
pub use emeter::EmeterStatus;
pub use error::{Error, SmartErrorCode};
pub use protocol::{IotProtocol, Protocol, SmartCamProtocol, SmartProtocol, create_protocol};
pub use transport::{AesTransport, KlapTransport, Transport, TransportState, XorTransport};

/// The version of the tplink-core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
