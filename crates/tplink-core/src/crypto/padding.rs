//! PKCS7 padding for the 16-byte AES block size.
//!
//! Decryption is tolerant by default: malformed padding returns the input
//! unchanged and the JSON layer above treats the garbage as a soft failure.
//! [`unpad_strict`] is available for callers that want corruption surfaced.

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Appends PKCS7 padding up to the next block boundary.
///
/// Always appends between 1 and 16 bytes.
pub fn pad(data: &[u8]) -> Vec<u8> {
    let pad_len = BLOCK_SIZE - (data.len() % BLOCK_SIZE);
    let mut out = Vec::with_capacity(data.len() + pad_len);
    out.extend_from_slice(data);
    out.resize(data.len() + pad_len, pad_len as u8);
    out
}

/// Strips PKCS7 padding, returning the input unchanged when the padding is
/// malformed.
pub fn unpad(data: Vec<u8>) -> Vec<u8> {
    match checked_pad_len(&data) {
        Some(pad_len) => {
            let mut data = data;
            data.truncate(data.len() - pad_len);
            data
        }
        None => data,
    }
}

/// Strips PKCS7 padding, rejecting malformed padding.
pub fn unpad_strict(data: Vec<u8>) -> Result<Vec<u8>, crate::error::Error> {
    match checked_pad_len(&data) {
        Some(pad_len) => {
            let mut data = data;
            data.truncate(data.len() - pad_len);
            Ok(data)
        }
        None => Err(crate::error::Error::Protocol(
            "invalid PKCS7 padding".into(),
        )),
    }
}

fn checked_pad_len(data: &[u8]) -> Option<usize> {
    let &last = data.last()?;
    let pad_len = last as usize;
    if pad_len == 0 || pad_len > BLOCK_SIZE || pad_len > data.len() {
        return None;
    }
    data[data.len() - pad_len..]
        .iter()
        .all(|&b| b == last)
        .then_some(pad_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_roundtrip_aligned() {
        let data = vec![0x42u8; 32];
        let padded = pad(&data);
        assert_eq!(padded.len(), 48);
        assert_eq!(unpad(padded), data);
    }

    #[test]
    fn test_pad_roundtrip_unaligned() {
        for len in [0usize, 1, 15, 17, 31] {
            let data = vec![0x17u8; len];
            let padded = pad(&data);
            assert_eq!(padded.len() % BLOCK_SIZE, 0);
            assert_eq!(unpad(padded), data);
        }
    }

    #[test]
    fn test_unpad_malformed_returns_input() {
        // Last byte claims 5 pad bytes but the run is broken.
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 5];
        assert_eq!(unpad(data.clone()), data);

        // Pad length of zero is never valid.
        let data = vec![0u8; 16];
        assert_eq!(unpad(data.clone()), data);

        // Pad length larger than the block size.
        let data = vec![17u8; 16];
        assert_eq!(unpad(data.clone()), data);
    }

    #[test]
    fn test_unpad_strict_rejects() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 5];
        assert!(unpad_strict(data).is_err());
        assert!(unpad_strict(vec![]).is_err());
        assert_eq!(unpad_strict(pad(b"hello")).unwrap(), b"hello");
    }
}
