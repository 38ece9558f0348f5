//! RSA keypair handling for the AES handshake and discovery probes.
//!
//! The AES transport trades a 1024-bit public key for the session block;
//! discovery embeds a 2048-bit key in the 20002 probe and receives the
//! symmetric discovery key OAEP-encrypted. Keypairs serialize to base64 DER
//! so a config can cache them across reconnects.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::rand_core::OsRng;
use rsa::{Oaep, Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;

use crate::config::KeyPairData;
use crate::error::Error;

/// An RSA keypair with the codecs this protocol family needs.
#[derive(Clone)]
pub struct KeyPair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl KeyPair {
    /// Generates a fresh keypair. Dominates handshake cost, which is why
    /// transports cache the result on the config.
    pub fn generate(bits: usize) -> Result<Self, Error> {
        let mut rng = OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| Error::Protocol(format!("RSA key generation failed: {e}")))?;
        let public_key = RsaPublicKey::from(&private_key);
        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Restores a keypair from base64 DER.
    pub fn from_data(data: &KeyPairData) -> Result<Self, Error> {
        let der = BASE64
            .decode(&data.private_key)
            .map_err(|e| Error::Protocol(format!("cached key is not base64: {e}")))?;
        let private_key = RsaPrivateKey::from_pkcs8_der(&der)
            .map_err(|e| Error::Protocol(format!("cached key is not PKCS#8 DER: {e}")))?;
        let public_key = RsaPublicKey::from(&private_key);
        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Serializes to base64 DER for caching on a config.
    pub fn to_data(&self) -> Result<KeyPairData, Error> {
        let private_der = self
            .private_key
            .to_pkcs8_der()
            .map_err(|e| Error::Protocol(format!("PKCS#8 encoding failed: {e}")))?;
        let public_der = self
            .public_key
            .to_public_key_der()
            .map_err(|e| Error::Protocol(format!("SPKI encoding failed: {e}")))?;
        Ok(KeyPairData {
            private_key: BASE64.encode(private_der.as_bytes()),
            public_key: BASE64.encode(public_der.as_bytes()),
        })
    }

    /// PEM-encoded public key, as embedded in handshake and probe bodies.
    pub fn public_pem(&self) -> Result<String, Error> {
        self.public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::Protocol(format!("PEM encoding failed: {e}")))
    }

    /// Decrypts a PKCS#1 v1.5 blob (AES handshake key block).
    pub fn decrypt_pkcs1(&self, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        self.private_key
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .map_err(|e| Error::Protocol(format!("RSA decryption failed: {e}")))
    }

    /// Decrypts an OAEP-SHA1 blob (encrypted discovery key).
    pub fn decrypt_oaep(&self, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        self.private_key
            .decrypt(Oaep::new::<Sha1>(), ciphertext)
            .map_err(|e| Error::Protocol(format!("RSA-OAEP decryption failed: {e}")))
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::traits::PublicKeyParts;

    #[test]
    fn test_generate_and_cache_roundtrip() {
        let keypair = KeyPair::generate(1024).unwrap();
        let data = keypair.to_data().unwrap();
        let restored = KeyPair::from_data(&data).unwrap();
        assert_eq!(
            keypair.private_key.n().to_bytes_be(),
            restored.private_key.n().to_bytes_be()
        );
    }

    #[test]
    fn test_public_pem_shape() {
        let keypair = KeyPair::generate(1024).unwrap();
        let pem = keypair.public_pem().unwrap();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));
        assert!(pem.trim_end().ends_with("-----END PUBLIC KEY-----"));
    }

    #[test]
    fn test_pkcs1_roundtrip() {
        let keypair = KeyPair::generate(1024).unwrap();
        let mut rng = OsRng;
        let ciphertext = keypair
            .public_key
            .encrypt(&mut rng, Pkcs1v15Encrypt, &[0x42u8; 32])
            .unwrap();
        assert_eq!(keypair.decrypt_pkcs1(&ciphertext).unwrap(), [0x42u8; 32]);
    }

    #[test]
    fn test_oaep_roundtrip() {
        let keypair = KeyPair::generate(2048).unwrap();
        let mut rng = OsRng;
        let ciphertext = keypair
            .public_key
            .encrypt(&mut rng, Oaep::new::<Sha1>(), &[0x17u8; 32])
            .unwrap();
        assert_eq!(keypair.decrypt_oaep(&ciphertext).unwrap(), [0x17u8; 32]);
    }

    #[test]
    fn test_from_data_rejects_garbage() {
        let data = KeyPairData {
            private_key: "AAAA".into(),
            public_key: "AAAA".into(),
        };
        assert!(KeyPair::from_data(&data).is_err());
    }
}
