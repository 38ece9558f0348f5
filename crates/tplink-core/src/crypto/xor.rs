//! XOR autokey cipher for the legacy Smart Home Protocol.
//!
//! Each output byte becomes the key for the next: `out[i] = key ^ in[i];
//! key = out[i]` with a fixed seed of 0xAB. TCP framing prepends a 4-byte
//! big-endian length; UDP discovery omits the prefix.

/// Seed byte for the autokey stream.
const INITIAL_KEY: u8 = 0xAB;

/// Encrypts a request for the TCP wire: 4-byte big-endian length prefix
/// followed by the XOR stream of the payload.
///
/// # Example
///
/// ```
/// use tplink_core::crypto::xor;
///
/// let framed = xor::encrypt_request(r#"{"system":{"get_sysinfo":{}}}"#);
/// assert_eq!(&framed[..4], &[0, 0, 0, 29]);
/// ```
pub fn encrypt_request(plaintext: &str) -> Vec<u8> {
    let payload = plaintext.as_bytes();
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    xor_stream(payload, &mut out);
    out
}

/// Encrypts without the length prefix (UDP discovery probes).
pub fn encrypt_datagram(plaintext: &str) -> Vec<u8> {
    let payload = plaintext.as_bytes();
    let mut out = Vec::with_capacity(payload.len());
    xor_stream(payload, &mut out);
    out
}

fn xor_stream(payload: &[u8], out: &mut Vec<u8>) {
    let mut key = INITIAL_KEY;
    for &byte in payload {
        let cipher = key ^ byte;
        key = cipher;
        out.push(cipher);
    }
}

/// Decrypts a payload (without the length prefix).
///
/// Invalid UTF-8 sequences are replaced with the Unicode replacement
/// character rather than failing; the JSON parser upstream rejects garbage.
pub fn decrypt(ciphertext: &[u8]) -> String {
    let mut key = INITIAL_KEY;
    let mut out = Vec::with_capacity(ciphertext.len());
    for &byte in ciphertext {
        out.push(key ^ byte);
        key = byte;
    }
    String::from_utf8_lossy(&out).to_string()
}
