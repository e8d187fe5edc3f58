//! Group messaging state, RFC 9420 flavoured.
//!
//! The state is deliberately minimal: a left-balanced binary ratchet tree of
//! leaf nodes, the epoch secret chain, and the confirmed transcript hash.
//! Every tree mutation advances the epoch; the epoch is monotone.

mod group;
mod tree;

pub use group::{Commit, GroupChange, GroupCiphertext, KeyPackage, MlsGroup, Welcome};
pub use tree::{LeafNode, RatchetTree};

use serde::{Deserialize, Serialize};

use crate::aead::AeadAlgorithm;

/// Supported cipher suites. Both use X25519 key agreement and Ed25519
/// signatures; they differ in the AEAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CipherSuite {
    X25519ChaCha20Ed25519,
    X25519Aes256GcmEd25519,
}

impl Default for CipherSuite {
    fn default() -> Self {
        CipherSuite::X25519ChaCha20Ed25519
    }
}

impl CipherSuite {
    pub fn aead(self) -> AeadAlgorithm {
        match self {
            CipherSuite::X25519ChaCha20Ed25519 => AeadAlgorithm::ChaCha20Poly1305,
            CipherSuite::X25519Aes256GcmEd25519 => AeadAlgorithm::Aes256Gcm,
        }
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            CipherSuite::X25519ChaCha20Ed25519 => "mls-x25519-chacha20poly1305-ed25519",
            CipherSuite::X25519Aes256GcmEd25519 => "mls-x25519-aes256gcm-ed25519",
        }
    }
}
