//! On-wire ciphertext envelope and versioned persisted records.
//!
//! The envelope is what leaves the ratchet engine: algorithm + session
//! routing + the AEAD triple (nonce, ciphertext, tag). Binary fields are
//! base64url without padding; the AAD is carried raw since it is not secret.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub algorithm: String,
    pub session_id: String,
    /// 96-bit nonce, base64url.
    pub nonce: String,
    pub ciphertext: String,
    /// 128-bit AEAD tag, base64url.
    pub tag: String,
    /// Associated data, authenticated but not encrypted.
    pub aad: String,
}

impl EncryptedEnvelope {
    pub fn new(
        algorithm: &str,
        session_id: &str,
        nonce: &[u8],
        ciphertext: &[u8],
        tag: &[u8],
        aad: &str,
    ) -> Self {
        Self {
            algorithm: algorithm.to_string(),
            session_id: session_id.to_string(),
            nonce: URL_SAFE_NO_PAD.encode(nonce),
            ciphertext: URL_SAFE_NO_PAD.encode(ciphertext),
            tag: URL_SAFE_NO_PAD.encode(tag),
            aad: aad.to_string(),
        }
    }

    pub fn nonce_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        URL_SAFE_NO_PAD.decode(&self.nonce)
    }

    pub fn ciphertext_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        URL_SAFE_NO_PAD.decode(&self.ciphertext)
    }

    pub fn tag_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        URL_SAFE_NO_PAD.decode(&self.tag)
    }
}

/// Versioned wrapper for every record that hits disk. Readers reject
/// versions they do not understand instead of misparsing them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub version: u8,
    pub record: T,
}

pub const RECORD_VERSION: u8 = 1;

impl<T: Serialize> Versioned<T> {
    pub fn current(record: T) -> Self {
        Self { version: RECORD_VERSION, record }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl<T: DeserializeOwned> Versioned<T> {
    pub fn from_json(s: &str) -> Result<T, RecordError> {
        let v: Versioned<T> = serde_json::from_str(s)?;
        if v.version > RECORD_VERSION {
            return Err(RecordError::UnknownVersion(v.version));
        }
        Ok(v.record)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("unknown record version {0}")]
    UnknownVersion(u8),
    #[error("record parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_base64_roundtrip() {
        let env = EncryptedEnvelope::new("chacha20-poly1305", "s1", &[1u8; 12], &[2u8; 40], &[3u8; 16], "aad");
        assert_eq!(env.nonce_bytes().unwrap(), vec![1u8; 12]);
        assert_eq!(env.ciphertext_bytes().unwrap(), vec![2u8; 40]);
        assert_eq!(env.tag_bytes().unwrap(), vec![3u8; 16]);
    }

    #[test]
    fn versioned_rejects_future_versions() {
        let json = r#"{"version":9,"record":{"algorithm":"a","session_id":"s","nonce":"","ciphertext":"","tag":"","aad":""}}"#;
        let err = Versioned::<EncryptedEnvelope>::from_json(json).unwrap_err();
        assert!(matches!(err, RecordError::UnknownVersion(9)));
    }
}
