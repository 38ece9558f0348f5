//! XOR transport for legacy IOT devices.
//!
//! Dual-mode: raw TCP with the length-prefixed XOR frame on port 9999, or
//! plain JSON tunnelled over HTTP POST `/` when the device exposes port 80
//! instead. No credentials, no session state.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::DeviceConfig;
use crate::crypto::xor;
use crate::error::Error;
use crate::http::HttpClient;
use crate::transport::Transport;

/// Default port for the framed XOR protocol.
pub const DEFAULT_PORT: u16 = 9999;

/// Port that switches the transport into HTTP mode.
const HTTP_FALLBACK_PORT: u16 = 80;

/// Upper bound on a response frame; anything larger is a framing error.
const MAX_FRAME: usize = 1024 * 1024;

/// Transport speaking the legacy XOR protocol.
pub struct XorTransport {
    host: String,
    port: u16,
    timeout: Duration,
    stream: Option<TcpStream>,
    http: Option<HttpClient>,
}

impl XorTransport {
    /// Builds a transport from a device config.
    pub fn new(config: &DeviceConfig) -> Result<Self, Error> {
        let port = config.port_override.unwrap_or(DEFAULT_PORT);
        let http = if port == HTTP_FALLBACK_PORT {
            Some(HttpClient::new(&config.host, port, config.timeout, false)?)
        } else {
            None
        };
        Ok(Self {
            host: config.host.clone(),
            port,
            timeout: config.timeout,
            stream: None,
            http,
        })
    }

    async fn connect(&mut self) -> Result<&mut TcpStream, Error> {
        if self.stream.is_none() {
            let addr = format!("{}:{}", self.host, self.port);
            debug!(addr = %addr, "connecting");
            let stream = timeout(self.timeout, TcpStream::connect(&addr))
                .await
                .map_err(|_| Error::Timeout(format!("connect to {addr} timed out")))?
                .map_err(Error::from)?;
            stream.set_nodelay(true).map_err(Error::from)?;
            self.stream = Some(stream);
        }
        Ok(self.stream.as_mut().expect("stream just set"))
    }

    async fn send_tcp(&mut self, request: &str) -> Result<Value, Error> {
        let io_timeout = self.timeout;
        let frame = xor::encrypt_request(request);
        let stream = self.connect().await?;

        debug!(bytes = frame.len(), "sending framed request");
        timeout(io_timeout, stream.write_all(&frame))
            .await
            .map_err(|_| Error::Timeout("write timed out".into()))?
            .map_err(Error::from)?;

        let mut len_buf = [0u8; 4];
        timeout(io_timeout, stream.read_exact(&mut len_buf))
            .await
            .map_err(|_| Error::Timeout("read timed out".into()))?
            .map_err(Error::from)?;
        let payload_len = u32::from_be_bytes(len_buf) as usize;
        if payload_len > MAX_FRAME {
            return Err(Error::Protocol(format!(
                "response frame too large: {payload_len} bytes"
            )));
        }

        let mut payload = vec![0u8; payload_len];
        timeout(io_timeout, stream.read_exact(&mut payload))
            .await
            .map_err(|_| Error::Timeout("read timed out".into()))?
            .map_err(Error::from)?;
        debug!(bytes = payload_len, "received response");

        let decrypted = xor::decrypt(&payload);
        serde_json::from_str(&decrypted)
            .map_err(|e| Error::Protocol(format!("device sent invalid JSON: {e}")))
    }

    async fn send_http(&mut self, request: &str) -> Result<Value, Error> {
        let body: Value = serde_json::from_str(request)?;
        let http = self.http.as_mut().expect("http mode");
        let (status, value) = http.post_json("/", &body).await?;
        if status != 200 {
            return Err(Error::Protocol(format!(
                "HTTP fallback returned status {status}"
            )));
        }
        Ok(value)
    }
}

#[async_trait]
impl Transport for XorTransport {
    fn default_port(&self) -> u16 {
        DEFAULT_PORT
    }

    fn credentials_hash(&self) -> Option<String> {
        None
    }

    async fn send(&mut self, request: &str) -> Result<Value, Error> {
        if self.http.is_some() {
            return self.send_http(request).await;
        }
        match self.send_tcp(request).await {
            Ok(value) => Ok(value),
            Err(err) => {
                // A failed exchange leaves the socket in an unknown state.
                self.stream = None;
                Err(err)
            }
        }
    }

    async fn reset(&mut self) {
        self.stream = None;
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }
}

impl std::fmt::Debug for XorTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XorTransport")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("connected", &self.stream.is_some())
            .field("http_mode", &self.http.is_some())
            .finish()
    }
}
