//! KLAP transport.
//!
//! The handshake is a two-stage seed exchange: the client sends 16 random
//! bytes to `/app/handshake1`, the device answers with its own 16-byte seed
//! plus a 32-byte tag over the seeds and the credential hash, and the client
//! confirms with a complementary tag to `/app/handshake2`. Login is folded
//! into that confirmation; there is no separate login state.
//!
//! The server tag doubles as credential discovery: it is checked against the
//! caller's hash first, then each embedded default set, then the blank
//! identity. No match means the credentials are simply wrong, so that
//! surfaces as an authentication error without retry.
//!
//! At runtime every request carries a strictly increasing sequence number in
//! the URL and the IV tail. HTTP 403 means the device discarded the session;
//! the transport drops its side and reports the failure as retryable so the
//! next attempt re-drives the handshake.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use serde_json::Value;
use tracing::debug;

use crate::config::DeviceConfig;
use crate::credentials::{Credentials, DefaultCredentials};
use crate::crypto::KlapEncryptionSession;
use crate::crypto::klap::AuthHash;
use crate::error::Error;
use crate::http::HttpClient;
use crate::transport::Transport;

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 80;

/// Session lifetime assumed when the device sends no TIMEOUT cookie.
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(86_400);

/// Transport speaking KLAP v1 (IOT devices) or v2 (SMART devices).
pub struct KlapTransport {
    http: HttpClient,
    credentials: Credentials,
    v2: bool,
    configured_hash: Option<AuthHash>,
    session: Option<KlapEncryptionSession>,
    session_expires_at: Option<Instant>,
}

impl KlapTransport {
    /// Builds a transport from a device config.
    ///
    /// `v2` selects the SMART-generation hash and tag derivations; IOT
    /// devices negotiate the MD5-based v1 scheme.
    pub fn new(config: &DeviceConfig, v2: bool) -> Result<Self, Error> {
        let port = config
            .port_override
            .or(config.connection_type.http_port)
            .unwrap_or(DEFAULT_PORT);
        let http = HttpClient::new(
            &config.host,
            port,
            config.timeout,
            config.connection_type.https,
        )?;

        let configured_hash = match &config.credentials_hash {
            Some(hash) => {
                let raw = BASE64
                    .decode(hash)
                    .map_err(|e| Error::Protocol(format!("credentials hash is not base64: {e}")))?;
                Some(AuthHash::from_bytes(&raw).ok_or_else(|| {
                    Error::Protocol("credentials hash has invalid length".into())
                })?)
            }
            None => None,
        };

        Ok(Self {
            http,
            credentials: config.credentials_or_blank(),
            v2,
            configured_hash,
            session: None,
            session_expires_at: None,
        })
    }

    fn session_expired(&self) -> bool {
        match self.session_expires_at {
            Some(expires_at) => Instant::now() >= expires_at,
            None => false,
        }
    }

    /// Candidate hashes in validation order: caller's, defaults, blank.
    fn candidate_hashes(&self) -> Vec<(&'static str, AuthHash)> {
        let mut candidates = Vec::new();
        match &self.configured_hash {
            Some(hash) => candidates.push(("configured", hash.clone())),
            None => candidates.push(("user", AuthHash::generate(&self.credentials, self.v2))),
        }
        for default in DefaultCredentials::all() {
            let name = match default {
                DefaultCredentials::Kasa => "kasa default",
                DefaultCredentials::Tapo => "tapo default",
                DefaultCredentials::KasaCamera => "camera default",
            };
            candidates.push((name, AuthHash::generate(&default.credentials(), self.v2)));
        }
        if !self.credentials.is_blank() {
            candidates.push(("blank", AuthHash::generate(&Credentials::blank(), self.v2)));
        }
        candidates
    }

    async fn perform_handshake(&mut self) -> Result<(), Error> {
        self.session = None;
        self.http.clear_cookies();

        let mut local_seed = [0u8; 16];
        rand::rng().fill_bytes(&mut local_seed);

        debug!(host = %self.http.host(), v2 = self.v2, "KLAP handshake1");
        let response = self
            .http
            .post_bytes("/app/handshake1", local_seed.to_vec())
            .await?;
        if response.status != 200 {
            return Err(Error::Protocol(format!(
                "handshake1 returned status {}",
                response.status
            )));
        }
        if response.body.len() != 48 {
            return Err(Error::Protocol(format!(
                "handshake1 response has length {} (expected 48)",
                response.body.len()
            )));
        }

        let mut remote_seed = [0u8; 16];
        remote_seed.copy_from_slice(&response.body[..16]);
        let server_tag = &response.body[16..48];

        let Some((name, auth_hash)) = self
            .candidate_hashes()
            .into_iter()
            .find(|(_, hash)| hash.handshake1_tag(&local_seed, &remote_seed).as_slice() == server_tag)
        else {
            return Err(Error::AuthenticationFailed(
                "server tag matches no known credential set".into(),
            ));
        };
        debug!(credential_set = name, "handshake1 tag verified");

        let payload = auth_hash.handshake2_payload(&local_seed, &remote_seed);
        let response = self
            .http
            .post_bytes("/app/handshake2", payload.to_vec())
            .await?;
        if response.status != 200 {
            // Not an auth failure; the tag already validated the hash.
            return Err(Error::Protocol(format!(
                "handshake2 returned status {}",
                response.status
            )));
        }

        let session_timeout = self
            .http
            .get_cookie("TIMEOUT")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SESSION_TIMEOUT);
        self.session_expires_at = Some(Instant::now() + session_timeout);
        self.session = Some(KlapEncryptionSession::new(
            &local_seed,
            &remote_seed,
            auth_hash.as_bytes(),
        ));
        debug!(host = %self.http.host(), "KLAP session established");
        Ok(())
    }
}

#[async_trait]
impl Transport for KlapTransport {
    fn default_port(&self) -> u16 {
        DEFAULT_PORT
    }

    fn credentials_hash(&self) -> Option<String> {
        let hash = match &self.configured_hash {
            Some(hash) => hash.clone(),
            None => AuthHash::generate(&self.credentials, self.v2),
        };
        Some(BASE64.encode(hash.as_bytes()))
    }

    async fn send(&mut self, request: &str) -> Result<Value, Error> {
        if self.session.is_none() || self.session_expired() {
            self.perform_handshake().await?;
        }
        let Some(session) = self.session.as_mut() else {
            return Err(Error::Protocol("no KLAP session after handshake".into()));
        };
        let (payload, seq) = session.encrypt(request.as_bytes());

        let path = format!("/app/request?seq={seq}");
        debug!(host = %self.http.host(), seq, "KLAP request");
        let response = self.http.post_bytes(&path, payload).await?;

        if response.status == 403 {
            // Device discarded the session; rebuild it on the next call.
            self.session = None;
            return Err(Error::Retryable("device rejected session (403)".into()));
        }
        if response.status != 200 {
            return Err(Error::Protocol(format!(
                "request returned status {}",
                response.status
            )));
        }

        let Some(session) = self.session.as_ref() else {
            return Err(Error::Protocol("no KLAP session after handshake".into()));
        };
        let plain = session.decrypt(&response.body, seq)?;
        serde_json::from_slice(&plain)
            .map_err(|e| Error::Protocol(format!("device sent invalid JSON: {e}")))
    }

    async fn reset(&mut self) {
        self.session = None;
        self.session_expires_at = None;
        self.http.clear_cookies();
    }

    async fn close(&mut self) {
        self.reset().await;
    }
}

impl std::fmt::Debug for KlapTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KlapTransport")
            .field("host", &self.http.host())
            .field("port", &self.http.port())
            .field("v2", &self.v2)
            .field("established", &self.session.is_some())
            .finish()
    }
}
