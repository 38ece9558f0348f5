//! Transport layer: one implementation per wire protocol.
//!
//! - [`XorTransport`]: length-prefixed XOR frames on TCP 9999, or plain JSON
//!   over HTTP when the device exposes port 80.
//! - [`AesTransport`]: RSA handshake, AES session, `securePassthrough`
//!   envelope (plain HTTP or the permissive-TLS variant for cameras).
//! - [`KlapTransport`]: seed-exchange handshake with derived keys and a
//!   per-request sequence number.
//!
//! A transport is single-use per device but serves many `send()` calls. The
//! owning protocol serializes access; transports assume one caller at a
//! time.

pub mod aes;
pub mod klap;
pub mod xor_tcp;

pub use self::aes::AesTransport;
pub use self::klap::KlapTransport;
pub use self::xor_tcp::XorTransport;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Error;

/// Session progress of a stateful transport.
///
/// KLAP collapses login into the second handshake, so only the AES
/// transport passes through `LoginRequired`. Cookie expiry and
/// authentication failures both force `HandshakeRequired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// No session; the next send drives a full handshake.
    HandshakeRequired,
    /// Session keys agreed, device login still outstanding.
    LoginRequired,
    /// Ready for passthrough queries.
    Established,
}

/// A device wire protocol.
#[async_trait]
pub trait Transport: Send {
    /// Port used when the config has no override.
    fn default_port(&self) -> u16;

    /// Opaque base64 blob that can stand in for live credentials on a
    /// future config, when this transport supports one.
    fn credentials_hash(&self) -> Option<String>;

    /// Sends one JSON request and returns the decoded response.
    ///
    /// Stateful transports drive whatever handshake/login is outstanding
    /// before the request itself goes out.
    async fn send(&mut self, request: &str) -> Result<Value, Error>;

    /// Drops session state (keys, cookies, token) but keeps the underlying
    /// client usable for the next handshake.
    async fn reset(&mut self);

    /// Tears the transport down.
    async fn close(&mut self);
}
