//! Signed envelope as posted by agents

use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::AppError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub alert_id: u64,
    /// base64 of the signed payload bytes
    pub payload: String,
    /// hex HMAC-SHA256 over the decoded payload
    pub hmac: String,
}

impl SignedEnvelope {
    /// Decoded payload bytes once the signature checks out (constant-time compare)
    pub fn open(&self, key: &[u8]) -> Result<Vec<u8>, AppError> {
        let bytes = STANDARD
            .decode(self.payload.trim())
            .map_err(|e| AppError::MalformedEnvelope(format!("payload is not base64: {}", e)))?;
        let expected = hex::decode(self.hmac.trim()).map_err(|_| AppError::SignatureMismatch)?;
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|e| AppError::InternalError(format!("hmac key: {}", e)))?;
        mac.update(&bytes);
        mac.verify_slice(&expected)
            .map_err(|_| AppError::SignatureMismatch)?;
        Ok(bytes)
    }

    #[cfg(test)]
    pub fn seal(alert_id: u64, payload: &[u8], key: &[u8]) -> Self {
        let mut mac = HmacSha256::new_from_slice(key).unwrap();
        mac.update(payload);
        Self {
            alert_id,
            payload: STANDARD.encode(payload),
            hmac: hex::encode(mac.finalize().into_bytes()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_rejects_other_key_and_tampering() {
        let envelope = SignedEnvelope::seal(3, br#"{"id":3}"#, b"k1");
        assert_eq!(envelope.open(b"k1").unwrap(), br#"{"id":3}"#.to_vec());
        assert!(matches!(envelope.open(b"k2"), Err(AppError::SignatureMismatch)));

        let mut tampered = envelope.clone();
        tampered.payload = STANDARD.encode(br#"{"id":4}"#);
        assert!(matches!(tampered.open(b"k1"), Err(AppError::SignatureMismatch)));

        let mut garbage = envelope;
        garbage.hmac = "not-hex".into();
        assert!(matches!(garbage.open(b"k1"), Err(AppError::SignatureMismatch)));
    }
}
