//! Minimal HTTP client for device endpoints.
//!
//! Device firmware ships a non-compliant HTTP/1.1 server that rejects
//! lowercase header names, so requests are written by hand over a raw
//! socket with title-case headers instead of going through an HTTP library.
//! Each request opens a fresh connection (most firmware closes the socket
//! per request); what persists across requests is the cookie jar and the
//! post-reset pacing flag.
//!
//! Some firmware drops the connection hard after every response. Once a
//! reset or broken pipe is observed, every subsequent request from the same
//! client is preceded by a fixed 250 ms delay.
//!
//! The HTTPS variant runs `rustls` with peer verification disabled and
//! TLS 1.2 pinned, which is what the devices' self-signed, legacy-cipher
//! stacks require.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::Error;

/// Delay applied after an observed connection reset.
const POST_RESET_GRACE: Duration = Duration::from_millis(250);

/// A parsed HTTP response.
#[derive(Debug)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Raw response body.
    pub body: Vec<u8>,
}

/// Content type of an outgoing POST body.
#[derive(Debug, Clone, Copy)]
pub enum BodyKind {
    /// `application/json`.
    Json,
    /// `application/octet-stream`.
    Octets,
}

impl BodyKind {
    fn header_value(self) -> &'static str {
        match self {
            BodyKind::Json => "application/json",
            BodyKind::Octets => "application/octet-stream",
        }
    }
}

/// HTTP client bound to one device.
pub struct HttpClient {
    host: String,
    port: u16,
    timeout: Duration,
    tls: Option<Arc<rustls::ClientConfig>>,
    cookies: HashMap<String, String>,
    wait_between_requests: bool,
}

impl HttpClient {
    /// Creates a client for `host:port`, with TLS when `https` is set.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        io_timeout: Duration,
        https: bool,
    ) -> Result<Self, Error> {
        let tls = if https {
            Some(Arc::new(permissive_tls_config()?))
        } else {
            None
        };
        Ok(Self {
            host: host.into(),
            port,
            timeout: io_timeout,
            tls,
            cookies: HashMap::new(),
            wait_between_requests: false,
        })
    }

    /// The device host this client talks to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The device port this client talks to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Looks up a cookie captured from a previous response.
    pub fn get_cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// Drops all captured cookies (session reset).
    pub fn clear_cookies(&mut self) {
        self.cookies.clear();
    }

    /// POSTs a JSON body and parses the response as JSON.
    pub async fn post_json(
        &mut self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<(u16, serde_json::Value), Error> {
        let payload = serde_json::to_vec(body)?;
        let response = self.post(path, payload, BodyKind::Json).await?;
        let value = match serde_json::from_slice(&response.body) {
            Ok(value) => value,
            // Error statuses often carry an empty or HTML body; let the
            // caller act on the status instead of failing here.
            Err(_) if response.status != 200 => serde_json::Value::Null,
            Err(e) => {
                return Err(Error::Protocol(format!(
                    "response is not JSON (status {}): {e}",
                    response.status
                )));
            }
        };
        Ok((response.status, value))
    }

    /// POSTs raw bytes and returns the raw response.
    pub async fn post_bytes(&mut self, path: &str, body: Vec<u8>) -> Result<HttpResponse, Error> {
        self.post(path, body, BodyKind::Octets).await
    }

    async fn post(
        &mut self,
        path: &str,
        body: Vec<u8>,
        kind: BodyKind,
    ) -> Result<HttpResponse, Error> {
        if self.wait_between_requests {
            tokio::time::sleep(POST_RESET_GRACE).await;
        }

        let request = self.build_request(path, &body, kind);
        debug!(
            host = %self.host,
            port = self.port,
            path,
            bytes = body.len(),
            tls = self.tls.is_some(),
            "HTTP POST"
        );

        let raw = match self.round_trip(request, body).await {
            Ok(raw) => raw,
            Err(err) => {
                if matches!(err, Error::Connection(_)) {
                    // Firmware quirk: from now on, pace every request.
                    self.wait_between_requests = true;
                }
                return Err(err);
            }
        };

        let header_end = find_header_end(&raw)
            .ok_or_else(|| Error::Protocol("HTTP response has no header terminator".into()))?;
        let headers = String::from_utf8_lossy(&raw[..header_end]).to_string();
        let status = parse_status_code(&headers)
            .ok_or_else(|| Error::Protocol("HTTP response has no status line".into()))?;

        for (name, value) in parse_set_cookies(&headers) {
            self.cookies.insert(name, value);
        }

        let body_start = header_end + 4;
        let body = raw.get(body_start..).unwrap_or_default().to_vec();
        debug!(status, bytes = body.len(), "HTTP response");
        Ok(HttpResponse { status, body })
    }

    fn build_request(&self, path: &str, body: &[u8], kind: BodyKind) -> String {
        let mut request = format!(
            "POST {} HTTP/1.1\r\n\
             Host: {}:{}\r\n\
             Content-Type: {}\r\n\
             Content-Length: {}\r\n\
             Accept: */*\r\n\
             Connection: close\r\n",
            path,
            self.host,
            self.port,
            kind.header_value(),
            body.len()
        );
        if !self.cookies.is_empty() {
            let jar = self
                .cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; ");
            request.push_str(&format!("Cookie: {jar}\r\n"));
        }
        request.push_str("\r\n");
        request
    }

    async fn round_trip(&self, headers: String, body: Vec<u8>) -> Result<Vec<u8>, Error> {
        match &self.tls {
            None => self.round_trip_plain(headers, body).await,
            Some(config) => {
                let config = config.clone();
                let host = self.host.clone();
                let port = self.port;
                let io_timeout = self.timeout;
                tokio::task::spawn_blocking(move || {
                    round_trip_tls(&host, port, &headers, &body, config, io_timeout)
                })
                .await
                .map_err(|e| Error::Connection(format!("TLS task failed: {e}")))?
            }
        }
    }

    async fn round_trip_plain(&self, headers: String, body: Vec<u8>) -> Result<Vec<u8>, Error> {
        let addr = format!("{}:{}", self.host, self.port);
        let mut stream = timeout(self.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Timeout(format!("connect to {addr} timed out")))?
            .map_err(Error::from)?;

        let mut request = headers.into_bytes();
        request.extend_from_slice(&body);
        timeout(self.timeout, stream.write_all(&request))
            .await
            .map_err(|_| Error::Timeout("HTTP write timed out".into()))?
            .map_err(Error::from)?;

        let mut response = Vec::with_capacity(1024);
        let mut buf = [0u8; 4096];
        loop {
            let n = timeout(self.timeout, stream.read(&mut buf))
                .await
                .map_err(|_| Error::Timeout("HTTP read timed out".into()))?
                .map_err(Error::from)?;
            if n == 0 {
                break;
            }
            response.extend_from_slice(&buf[..n]);
            if response_complete(&response) {
                break;
            }
        }

        if find_header_end(&response).is_none() {
            return Err(Error::Connection(
                "connection closed before response headers".into(),
            ));
        }
        Ok(response)
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls.is_some())
            .field("cookies", &self.cookies.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Returns true once the buffered response covers the advertised body.
fn response_complete(response: &[u8]) -> bool {
    let Some(header_end) = find_header_end(response) else {
        return false;
    };
    let headers = String::from_utf8_lossy(&response[..header_end]);
    match parse_content_length(&headers) {
        Some(expected) => response.len() >= header_end + 4 + expected,
        None => false,
    }
}

fn round_trip_tls(
    host: &str,
    port: u16,
    headers: &str,
    body: &[u8],
    config: Arc<rustls::ClientConfig>,
    io_timeout: Duration,
) -> Result<Vec<u8>, Error> {
    let addr = format!("{host}:{port}");
    let socket_addr = addr
        .parse()
        .map_err(|e| Error::Unreachable(format!("invalid address {addr}: {e}")))?;
    let mut tcp = std::net::TcpStream::connect_timeout(&socket_addr, io_timeout)
        .map_err(Error::from)?;
    tcp.set_read_timeout(Some(io_timeout)).map_err(Error::from)?;
    tcp.set_write_timeout(Some(io_timeout)).map_err(Error::from)?;

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| Error::Unreachable(format!("invalid server name: {host}")))?;
    let mut conn = rustls::ClientConnection::new(config, server_name)
        .map_err(|e| Error::Connection(format!("TLS setup failed: {e}")))?;
    let mut stream = rustls::Stream::new(&mut conn, &mut tcp);

    stream.write_all(headers.as_bytes()).map_err(Error::from)?;
    stream.write_all(body).map_err(Error::from)?;
    stream.flush().map_err(Error::from)?;

    let mut response = Vec::with_capacity(4096);
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => response.extend_from_slice(&buf[..n]),
            // Devices often slam the connection shut after the body.
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => break,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(Error::from(e)),
        }
        if response_complete(&response) {
            break;
        }
    }

    if find_header_end(&response).is_none() {
        return Err(Error::Connection(
            "connection closed before response headers".into(),
        ));
    }
    Ok(response)
}

/// Permissive TLS config: no peer verification, TLS 1.2 only.
fn permissive_tls_config() -> Result<rustls::ClientConfig, Error> {
    use rustls::DigitallySignedStruct;
    use rustls::SignatureScheme;
    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::pki_types::{CertificateDer, UnixTime};

    #[derive(Debug)]
    struct AcceptAnyCert;

    impl ServerCertVerifier for AcceptAnyCert {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::RSA_PKCS1_SHA1,
                SignatureScheme::RSA_PSS_SHA256,
            ]
        }
    }

    let config = rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS12])
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    Ok(config)
}

/// Position of `\r\n\r\n` (end of headers).
fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Status code from the first response line.
fn parse_status_code(headers: &str) -> Option<u16> {
    headers
        .lines()
        .next()?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

/// `Content-Length` value, if advertised.
fn parse_content_length(headers: &str) -> Option<usize> {
    for line in headers.lines() {
        if line.to_ascii_lowercase().starts_with("content-length:") {
            return line.split(':').nth(1)?.trim().parse().ok();
        }
    }
    None
}

/// All `Set-Cookie` name/value pairs, attributes dropped.
fn parse_set_cookies(headers: &str) -> Vec<(String, String)> {
    let mut cookies = Vec::new();
    for line in headers.lines() {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        if !name.eq_ignore_ascii_case("set-cookie") {
            continue;
        }
        let Some(pair) = rest.trim().split(';').next() else {
            continue;
        };
        if let Some((cookie_name, value)) = pair.split_once('=') {
            cookies.push((cookie_name.trim().to_string(), value.trim().to_string()));
        }
    }
    cookies
}
