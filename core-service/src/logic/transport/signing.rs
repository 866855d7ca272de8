//! Payload Signing
//!
//! HMAC-SHA256 over the exact bytes that go on the wire, hex encoded.
//! Verification is constant-time.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::TransportError;

type HmacSha256 = Hmac<Sha256>;

fn mac(key: &[u8]) -> Result<HmacSha256, TransportError> {
    HmacSha256::new_from_slice(key).map_err(|e| TransportError::Encoding(format!("hmac key: {}", e)))
}

pub fn sign(payload: &[u8], key: &[u8]) -> Result<String, TransportError> {
    let mut mac = mac(key)?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// False on any mismatch, including a malformed signature
pub fn verify(signature_hex: &str, payload: &[u8], key: &[u8]) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = mac(key) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}
