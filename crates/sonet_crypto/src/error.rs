use sonet_proto::error::{ErrorKind, HasErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("signature verification failed")]
    SignatureVerification,

    #[error("AEAD encryption failed")]
    AeadEncrypt,

    /// Neutral integrity failure. Deliberately carries no detail about
    /// which of nonce, tag, or aad was wrong.
    #[error("authentication failure")]
    AuthFail,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("ratchet step failed: {0}")]
    RatchetStep(String),

    #[error("no cipher state for chat {0}")]
    UnknownChat(String),

    #[error("no endpoint for user {0} in chat {1}")]
    UnknownEndpoint(String, String),

    #[error("group is at member capacity")]
    GroupFull,

    #[error("unknown group member")]
    UnknownMember,

    #[error("session key exhausted or expired")]
    SessionKeyExhausted,

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}

impl HasErrorKind for CryptoError {
    fn kind(&self) -> ErrorKind {
        match self {
            CryptoError::AuthFail | CryptoError::SignatureVerification => ErrorKind::AuthFail,
            CryptoError::GroupFull => ErrorKind::ResourceExhausted,
            CryptoError::UnknownChat(_) | CryptoError::UnknownMember => ErrorKind::NotFound,
            CryptoError::InvalidKey(_) | CryptoError::Base64Decode(_) => ErrorKind::InvalidArgument,
            CryptoError::UnknownEndpoint(..) => ErrorKind::PermissionDenied,
            _ => ErrorKind::Internal,
        }
    }
}
