use sha2::{Digest, Sha256};
use thiserror::Error;

pub const PREIMAGE_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PreimageError {
    #[error("preimage is not valid hex: {0}")]
    NotHex(String),
    #[error("preimage must be {PREIMAGE_LEN} bytes, got {0}")]
    BadLength(usize),
}

pub fn compute_sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let bytes = hasher.finalize();
    hex::encode(bytes)
}

/// Stable job identity for a paid invoice. The node assigns each invoice a
/// unique label, so redelivered events for the same invoice collapse here.
pub fn dedupe_key(label: &str) -> String {
    compute_sha256_hex(label)
}

/// Checks that `preimage` is a 32 byte value in hex and returns it
/// lowercased, which is the form posted to the ledger service.
pub fn normalize_preimage(preimage: &str) -> Result<String, PreimageError> {
    let trimmed = preimage.trim();
    let bytes = hex::decode(trimmed).map_err(|e| PreimageError::NotHex(e.to_string()))?;
    if bytes.len() != PREIMAGE_LEN {
        return Err(PreimageError::BadLength(bytes.len()));
    }
    Ok(trimmed.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_key_is_deterministic() {
        assert_eq!(dedupe_key("inv-1"), dedupe_key("inv-1"));
        assert_ne!(dedupe_key("inv-1"), dedupe_key("inv-2"));
        assert_eq!(dedupe_key("inv-1").len(), 64);
    }

    #[test]
    fn accepts_32_byte_hex() {
        let raw = "AB".repeat(32);
        assert_eq!(normalize_preimage(&raw).unwrap(), "ab".repeat(32));
    }

    #[test]
    fn rejects_short_or_non_hex() {
        assert_eq!(
            normalize_preimage(&"00".repeat(31)),
            Err(PreimageError::BadLength(31))
        );
        assert!(matches!(
            normalize_preimage("zz"),
            Err(PreimageError::NotHex(_))
        ));
    }
}
