//! Error taxonomy.
//!
//! Components keep their own thiserror enums; each maps into one of these
//! kinds so the service layer can translate failures into wire status codes
//! without matching on every concrete error type.

use serde::{Deserialize, Serialize};

/// The seven failure kinds the core distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed request, empty content, bad field.
    InvalidArgument,
    /// Chat or message does not exist.
    NotFound,
    /// Caller is not a participant, or is banned.
    PermissionDenied,
    /// Rate limit hit, queue full, group full.
    ResourceExhausted,
    /// Cryptographic integrity failure. Deliberately carries no detail.
    AuthFail,
    /// Deadline exceeded.
    Timeout,
    /// Invariant violation. A bug, not a caller mistake.
    Internal,
}

/// Implemented by every component error enum.
pub trait HasErrorKind {
    fn kind(&self) -> ErrorKind;
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::NotFound => "not_found",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::AuthFail => "auth_fail",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}
