//! Shared encoding helpers for key material, signatures, and certificates.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};

/// Encode bytes as standard base64.
pub fn to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode standard base64 into bytes.
pub fn from_base64(value: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(value)
}

/// Hex-encoded SHA-256 digest, used to fingerprint certificates in logs.
pub fn sha256_fingerprint(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
