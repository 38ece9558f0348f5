//! Cryptographic primitives for TP-Link device communication.
//!
//! Covers the legacy XOR autokey cipher, PKCS7 padding (tolerant and
//! strict), the AES-CBC session used by the passthrough transport, the KLAP
//! session derivations, and RSA keypair handling shared by the AES handshake
//! and discovery.

pub mod aes;
pub mod keys;
pub mod klap;
pub mod padding;
pub mod xor;

pub use self::aes::AesEncryptionSession;
pub use self::keys::KeyPair;
pub use self::klap::KlapEncryptionSession;
