//! Per-message encryption descriptor.
//!
//! The descriptor is metadata about how a message was sealed; the ciphertext
//! itself travels in the wire envelope. End-to-end levels MUST carry a
//! key id, nonce, and signature.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionLevel {
    None,
    ServerSide,
    EndToEnd,
    MilitaryGrade,
}

impl EncryptionLevel {
    pub fn is_end_to_end(self) -> bool {
        matches!(self, EncryptionLevel::EndToEnd | EncryptionLevel::MilitaryGrade)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionDescriptor {
    pub level: EncryptionLevel,
    /// e.g. "chacha20-poly1305", "aes-256-gcm".
    pub algorithm: String,
    pub key_id: String,
    /// 96-bit nonce, base64url.
    pub nonce: String,
    /// Ed25519 signature over the ciphertext, base64url.
    pub signature: String,
    /// Fingerprint of the live session key at send time.
    pub session_key_fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_key_fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_key_fingerprint: Option<String>,
    pub perfect_forward_secrecy: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("end-to-end descriptor missing {0}")]
    MissingField(&'static str),
}

impl crate::error::HasErrorKind for DescriptorError {
    fn kind(&self) -> crate::error::ErrorKind {
        crate::error::ErrorKind::InvalidArgument
    }
}

impl EncryptionDescriptor {
    /// Enforce the end-to-end invariant: key_id, nonce, and signature must
    /// all be present when the level claims E2E.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if !self.level.is_end_to_end() {
            return Ok(());
        }
        if self.key_id.is_empty() {
            return Err(DescriptorError::MissingField("key_id"));
        }
        if self.nonce.is_empty() {
            return Err(DescriptorError::MissingField("nonce"));
        }
        if self.signature.is_empty() {
            return Err(DescriptorError::MissingField("signature"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(level: EncryptionLevel) -> EncryptionDescriptor {
        EncryptionDescriptor {
            level,
            algorithm: "chacha20-poly1305".into(),
            key_id: "k1".into(),
            nonce: "AAAAAAAAAAAAAAAA".into(),
            signature: "sig".into(),
            session_key_fingerprint: "fp".into(),
            sender_key_fingerprint: None,
            recipient_key_fingerprint: None,
            perfect_forward_secrecy: true,
        }
    }

    #[test]
    fn e2e_requires_key_id() {
        let mut d = descriptor(EncryptionLevel::EndToEnd);
        d.key_id.clear();
        assert!(d.validate().is_err());
    }

    #[test]
    fn plaintext_level_skips_checks() {
        let mut d = descriptor(EncryptionLevel::None);
        d.key_id.clear();
        d.nonce.clear();
        d.signature.clear();
        assert!(d.validate().is_ok());
    }
}
