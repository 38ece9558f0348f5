//! KLAP handshake derivations and the per-session cipher.
//!
//! Two generations exist. v1 (older IOT firmware) hashes credentials with
//! MD5 and omits the remote seed from the handshake tags; v2 (SMART
//! firmware) hashes with SHA1/SHA256 and mixes both seeds. The session
//! material derived after the handshake is identical in both generations:
//!
//! - `key  = SHA256("lsk" ‖ local ‖ remote ‖ auth)[..16]`
//! - `iv   = SHA256("iv"  ‖ local ‖ remote ‖ auth)[..12]`, sequence seeded
//!   from the last four bytes of the same digest
//! - `sig  = SHA256("ldk" ‖ local ‖ remote ‖ auth)[..28]`
//!
//! Every request increments the sequence; the full IV is the 12-byte base
//! plus the big-endian sequence, and the wire body is
//! `SHA256(sig ‖ seq ‖ ciphertext) ‖ ciphertext`.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::NoPadding};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::credentials::Credentials;
use crate::crypto::padding;
use crate::error::Error;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Credential digest presented during the KLAP handshake.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthHash {
    /// v1: `MD5(MD5(username) ‖ MD5(password))`.
    V1([u8; 16]),
    /// v2: `SHA256(SHA1(username) ‖ SHA1(password))`.
    V2([u8; 32]),
}

impl AuthHash {
    /// Derives the hash for a credential pair.
    pub fn generate(credentials: &Credentials, v2: bool) -> Self {
        let username = credentials.username.as_bytes();
        let password = credentials.expose_password().as_bytes();
        if v2 {
            let mut outer = Sha256::new();
            outer.update(Sha1::digest(username));
            outer.update(Sha1::digest(password));
            AuthHash::V2(outer.finalize().into())
        } else {
            let mut outer = Md5::new();
            outer.update(Md5::digest(username));
            outer.update(Md5::digest(password));
            AuthHash::V1(outer.finalize().into())
        }
    }

    /// Reconstructs a hash from raw bytes (a stored credentials hash).
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes.len() {
            16 => Some(AuthHash::V1(bytes.try_into().ok()?)),
            32 => Some(AuthHash::V2(bytes.try_into().ok()?)),
            _ => None,
        }
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            AuthHash::V1(h) => h,
            AuthHash::V2(h) => h,
        }
    }

    /// Expected server tag in the handshake-1 response.
    pub fn handshake1_tag(&self, local_seed: &[u8; 16], remote_seed: &[u8; 16]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(local_seed);
        if matches!(self, AuthHash::V2(_)) {
            hasher.update(remote_seed);
        }
        hasher.update(self.as_bytes());
        hasher.finalize().into()
    }

    /// Client payload for handshake 2.
    ///
    /// The v1 path deliberately omits the local seed; this matches device
    /// behavior even though the v2 path mixes both seeds.
    pub fn handshake2_payload(&self, local_seed: &[u8; 16], remote_seed: &[u8; 16]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(remote_seed);
        if matches!(self, AuthHash::V2(_)) {
            hasher.update(local_seed);
        }
        hasher.update(self.as_bytes());
        hasher.finalize().into()
    }
}

impl std::fmt::Debug for AuthHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let version = match self {
            AuthHash::V1(_) => "V1",
            AuthHash::V2(_) => "V2",
        };
        write!(f, "AuthHash::{version}([REDACTED])")
    }
}

/// Per-session KLAP cipher.
///
/// Only `seq` mutates after construction; it is incremented before every
/// encryption, so a device that has accepted `seq = k` never sees a
/// client-generated request numbered below `k` again.
pub struct KlapEncryptionSession {
    key: [u8; 16],
    iv_base: [u8; 12],
    sig: [u8; 28],
    seq: i32,
}

impl KlapEncryptionSession {
    /// Derives session material from the handshake seeds and auth hash.
    pub fn new(local_seed: &[u8; 16], remote_seed: &[u8; 16], auth_hash: &[u8]) -> Self {
        let label = |tag: &[u8]| {
            let mut hasher = Sha256::new();
            hasher.update(tag);
            hasher.update(local_seed);
            hasher.update(remote_seed);
            hasher.update(auth_hash);
            let digest: [u8; 32] = hasher.finalize().into();
            digest
        };

        let key_digest = label(b"lsk");
        let iv_digest = label(b"iv");
        let sig_digest = label(b"ldk");

        let mut key = [0u8; 16];
        key.copy_from_slice(&key_digest[..16]);
        let mut iv_base = [0u8; 12];
        iv_base.copy_from_slice(&iv_digest[..12]);
        let mut sig = [0u8; 28];
        sig.copy_from_slice(&sig_digest[..28]);
        let seq = i32::from_be_bytes(iv_digest[28..32].try_into().expect("4-byte slice"));

        Self {
            key,
            iv_base,
            sig,
            seq,
        }
    }

    /// The sequence number of the most recent encryption.
    pub fn seq(&self) -> i32 {
        self.seq
    }

    fn iv_for(&self, seq: i32) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[..12].copy_from_slice(&self.iv_base);
        iv[12..].copy_from_slice(&seq.to_be_bytes());
        iv
    }

    /// Encrypts a request body, returning `(signature ‖ ciphertext, seq)`.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> (Vec<u8>, i32) {
        self.seq = self.seq.wrapping_add(1);
        let seq = self.seq;

        let padded = padding::pad(plaintext);
        let ciphertext = Aes128CbcEnc::new(&self.key.into(), &self.iv_for(seq).into())
            .encrypt_padded_vec_mut::<NoPadding>(&padded);

        let mut hasher = Sha256::new();
        hasher.update(self.sig);
        hasher.update(seq.to_be_bytes());
        hasher.update(&ciphertext);
        let signature: [u8; 32] = hasher.finalize().into();

        let mut out = Vec::with_capacity(32 + ciphertext.len());
        out.extend_from_slice(&signature);
        out.extend_from_slice(&ciphertext);
        (out, seq)
    }

    /// Decrypts a response body (`signature ‖ ciphertext`) for `seq`.
    pub fn decrypt(&self, payload: &[u8], seq: i32) -> Result<Vec<u8>, Error> {
        if payload.len() < 32 {
            return Err(Error::Protocol(format!(
                "KLAP response too short: {} bytes",
                payload.len()
            )));
        }
        let plain = Aes128CbcDec::new(&self.key.into(), &self.iv_for(seq).into())
            .decrypt_padded_vec_mut::<NoPadding>(&payload[32..])
            .map_err(|_| Error::Protocol("KLAP ciphertext not block-aligned".into()))?;
        Ok(padding::unpad(plain))
    }

    #[cfg(test)]
    pub(crate) fn with_seq(mut self, seq: i32) -> Self {
        self.seq = seq;
        self
    }
}

impl std::fmt::Debug for KlapEncryptionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KlapEncryptionSession")
            .field("seq", &self.seq)
            .field("key", &"[REDACTED]")
            .finish()
    }
}
