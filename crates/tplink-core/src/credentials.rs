//! Credentials management for TP-Link devices.
//!
//! Legacy XOR devices take no credentials at all. KLAP and AES devices
//! authenticate with a username/password pair, and may instead accept one of
//! the well-known default sets below when they have never been bound to a
//! cloud account (or were provisioned by the consumer apps).
//!
//! # Security
//!
//! Passwords are stored using [`SecretString`] from the `secrecy` crate to
//! prevent accidental logging or display. Use
//! [`Credentials::expose_password()`] to access the raw value when it is
//! actually needed for authentication.

use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use secrecy::{ExposeSecret, SecretString};

/// Credentials for authenticating with TP-Link devices.
///
/// Blank credentials (empty username and password) are a real identity, not
/// an absence of one: devices that have never been connected to the cloud
/// authenticate against the blank pair.
///
/// # Example
///
/// ```
/// use tplink_core::Credentials;
///
/// let creds = Credentials::new("user@example.com", "password123");
/// assert_eq!(creds.username, "user@example.com");
/// assert!(Credentials::blank().is_blank());
/// ```
#[derive(Clone)]
pub struct Credentials {
    /// The username (typically an email address for TP-Link cloud accounts).
    pub username: String,
    /// The password for the account (protected from accidental logging).
    password: SecretString,
}

impl Credentials {
    /// Creates new credentials with the given username and password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// Creates blank credentials (empty username and password).
    pub fn blank() -> Self {
        Self::new("", "")
    }

    /// Returns `true` if both username and password are empty.
    pub fn is_blank(&self) -> bool {
        self.username.is_empty() && self.password.expose_secret().is_empty()
    }

    /// Exposes the password for authentication purposes.
    ///
    /// Never log or display the returned value.
    pub fn expose_password(&self) -> &str {
        self.password.expose_secret()
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::blank()
    }
}

impl PartialEq for Credentials {
    fn eq(&self, other: &Self) -> bool {
        self.username == other.username
            && self.password.expose_secret() == other.password.expose_secret()
    }
}

impl Eq for Credentials {}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Default credential sets accepted by cloud-provisioned devices.
///
/// Stored base64-encoded, matching how the consumer apps embed them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefaultCredentials {
    /// Consumer Kasa app defaults.
    Kasa,
    /// Consumer Tapo app defaults.
    Tapo,
    /// Kasa camera defaults.
    KasaCamera,
}

impl DefaultCredentials {
    const KASA: (&'static str, &'static str) = ("a2FzYUB0cC1saW5rLm5ldA==", "a2FzYVNldHVw");
    const TAPO: (&'static str, &'static str) = ("dGVzdEB0cC1saW5rLm5ldA==", "dGVzdA==");
    const KASA_CAMERA: (&'static str, &'static str) = ("YWRtaW4=", "YWRtaW4=");

    /// Decodes this set into live [`Credentials`].
    pub fn credentials(self) -> Credentials {
        let (username, password) = match self {
            DefaultCredentials::Kasa => Self::KASA,
            DefaultCredentials::Tapo => Self::TAPO,
            DefaultCredentials::KasaCamera => Self::KASA_CAMERA,
        };
        Credentials::new(decode_embedded(username), decode_embedded(password))
    }

    /// All default credential sets, in the order handshakes try them.
    pub fn all() -> &'static [DefaultCredentials] {
        &[
            DefaultCredentials::Kasa,
            DefaultCredentials::Tapo,
            DefaultCredentials::KasaCamera,
        ]
    }
}

fn decode_embedded(encoded: &str) -> String {
    // Constants above are valid base64 UTF-8 by construction.
    let bytes = BASE64.decode(encoded).unwrap_or_default();
    String::from_utf8(bytes).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_new() {
        let creds = Credentials::new("user@example.com", "password123");
        assert_eq!(creds.username, "user@example.com");
        assert_eq!(creds.expose_password(), "password123");
    }

    #[test]
    fn test_credentials_is_blank() {
        assert!(Credentials::blank().is_blank());
        assert!(Credentials::new("", "").is_blank());
        assert!(!Credentials::new("user", "").is_blank());
        assert!(!Credentials::new("", "pass").is_blank());
    }

    #[test]
    fn test_credentials_equality() {
        let a = Credentials::new("user", "pass");
        let b = Credentials::new("user", "pass");
        let c = Credentials::new("user", "other");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::new("user@example.com", "secret123");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("user@example.com"));
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("secret123"));
    }

    #[test]
    fn test_default_credentials_decode() {
        let kasa = DefaultCredentials::Kasa.credentials();
        assert_eq!(kasa.username, "kasa@tp-link.net");
        assert_eq!(kasa.expose_password(), "kasaSetup");

        let tapo = DefaultCredentials::Tapo.credentials();
        assert_eq!(tapo.username, "test@tp-link.net");
        assert_eq!(tapo.expose_password(), "test");

        let camera = DefaultCredentials::KasaCamera.credentials();
        assert_eq!(camera.username, "admin");
        assert_eq!(camera.expose_password(), "admin");
    }

    #[test]
    fn test_default_credentials_all() {
        assert_eq!(DefaultCredentials::all().len(), 3);
    }
}
