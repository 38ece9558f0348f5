//! AES-128-CBC session for the passthrough transport.
//!
//! The key/IV pair is agreed during the RSA handshake; the session itself is
//! a value object. Ciphertext crosses the wire base64-encoded inside the
//! `securePassthrough` envelope.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::NoPadding};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};

use crate::crypto::padding;
use crate::error::Error;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Symmetric session state for the AES passthrough transport.
#[derive(Clone)]
pub struct AesEncryptionSession {
    key: [u8; 16],
    iv: [u8; 16],
}

impl AesEncryptionSession {
    /// Builds a session from an agreed key and IV.
    pub fn new(key: [u8; 16], iv: [u8; 16]) -> Self {
        Self { key, iv }
    }

    /// Builds a session from the 32-byte handshake block (key ‖ IV).
    pub fn from_key_block(block: &[u8]) -> Result<Self, Error> {
        if block.len() != 32 {
            return Err(Error::Protocol(format!(
                "handshake key block has length {} (expected 32)",
                block.len()
            )));
        }
        let mut key = [0u8; 16];
        let mut iv = [0u8; 16];
        key.copy_from_slice(&block[..16]);
        iv.copy_from_slice(&block[16..]);
        Ok(Self::new(key, iv))
    }

    /// Encrypts a plaintext and returns the base64 ciphertext.
    pub fn encrypt(&self, plaintext: &[u8]) -> String {
        let padded = padding::pad(plaintext);
        let ciphertext = Aes128CbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_vec_mut::<NoPadding>(&padded);
        BASE64.encode(ciphertext)
    }

    /// Decrypts base64 ciphertext.
    ///
    /// Padding removal is tolerant: malformed padding leaves the plaintext
    /// as-is and the JSON layer above rejects it.
    pub fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, Error> {
        let raw = BASE64
            .decode(ciphertext.trim())
            .map_err(|e| Error::Protocol(format!("base64 decode failed: {e}")))?;
        let plain = Aes128CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<NoPadding>(&raw)
            .map_err(|_| Error::Protocol("ciphertext not block-aligned".into()))?;
        Ok(padding::unpad(plain))
    }
}

impl std::fmt::Debug for AesEncryptionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesEncryptionSession")
            .field("key", &"[REDACTED]")
            .field("iv", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> AesEncryptionSession {
        AesEncryptionSession::new([0x11; 16], [0x22; 16])
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let plaintext = br#"{"method":"get_device_info"}"#;
        let ciphertext = session().encrypt(plaintext);
        assert_eq!(session().decrypt(&ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn test_roundtrip_block_aligned_input() {
        let plaintext = [0x41u8; 32];
        let ciphertext = session().encrypt(&plaintext);
        assert_eq!(session().decrypt(&ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn test_from_key_block() {
        let mut block = [0u8; 32];
        block[..16].copy_from_slice(&[0x11; 16]);
        block[16..].copy_from_slice(&[0x22; 16]);
        let from_block = AesEncryptionSession::from_key_block(&block).unwrap();
        let ciphertext = from_block.encrypt(b"hello");
        assert_eq!(session().decrypt(&ciphertext).unwrap(), b"hello");
    }

    #[test]
    fn test_from_key_block_wrong_length() {
        assert!(AesEncryptionSession::from_key_block(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_decrypt_rejects_invalid_base64() {
        assert!(session().decrypt("not base64!!!").is_err());
    }

    #[test]
    fn test_debug_redacts_key_material() {
        let debug = format!("{:?}", session());
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("11"));
    }
}
