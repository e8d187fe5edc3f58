//! Authenticated encryption.
//!
//! All modes use 96-bit nonces and 128-bit tags. Under a given key the
//! nonce MUST be unique; the ratchet derives it deterministically from the
//! message counter, so no randomness is involved on the hot path.
//!
//! The hybrid mode seals to an X25519 public key: an ephemeral keypair is
//! generated, the shared secret is expanded into a ChaCha20-Poly1305 key,
//! and the ephemeral public is carried alongside the ciphertext. Used for
//! Welcome bundles where the recipient has published only an init key.

use aes_gcm::{aead::Payload, Aes256Gcm, KeyInit, Nonce as GcmNonce};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Nonce as ChaNonce};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::kdf;

pub const TAG_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AeadAlgorithm {
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
    /// Ephemeral X25519 key agreement feeding ChaCha20-Poly1305.
    #[serde(rename = "x25519-chacha20-poly1305")]
    HybridX25519ChaCha,
}

impl AeadAlgorithm {
    pub fn wire_name(self) -> &'static str {
        match self {
            AeadAlgorithm::Aes256Gcm => "aes-256-gcm",
            AeadAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305",
            AeadAlgorithm::HybridX25519ChaCha => "x25519-chacha20-poly1305",
        }
    }
}

/// Ciphertext and detached tag, as they travel in the wire envelope.
#[derive(Debug, Clone)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

fn split_tag(mut combined: Vec<u8>) -> Result<Sealed, CryptoError> {
    if combined.len() < TAG_LEN {
        return Err(CryptoError::AeadEncrypt);
    }
    let tag_start = combined.len() - TAG_LEN;
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&combined[tag_start..]);
    combined.truncate(tag_start);
    Ok(Sealed { ciphertext: combined, tag })
}

fn join_tag(ciphertext: &[u8], tag: &[u8]) -> Vec<u8> {
    let mut combined = Vec::with_capacity(ciphertext.len() + tag.len());
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);
    combined
}

/// Seal `plaintext` under `key` with the given 96-bit nonce and AAD.
pub fn seal(
    alg: AeadAlgorithm,
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Sealed, CryptoError> {
    let payload = Payload { msg: plaintext, aad };
    let combined = match alg {
        AeadAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;
            cipher
                .encrypt(GcmNonce::from_slice(nonce), payload)
                .map_err(|_| CryptoError::AeadEncrypt)?
        }
        AeadAlgorithm::ChaCha20Poly1305 => {
            let cipher =
                ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;
            cipher
                .encrypt(ChaNonce::from_slice(nonce), payload)
                .map_err(|_| CryptoError::AeadEncrypt)?
        }
        AeadAlgorithm::HybridX25519ChaCha => return Err(CryptoError::AeadEncrypt),
    };
    split_tag(combined)
}

/// Open a sealed message. Any integrity failure returns a neutral
/// `AuthFail` without saying which field was wrong.
pub fn open(
    alg: AeadAlgorithm,
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let combined = join_tag(ciphertext, tag);
    let payload = Payload { msg: combined.as_slice(), aad };
    let plaintext = match alg {
        AeadAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AuthFail)?;
            cipher
                .decrypt(GcmNonce::from_slice(nonce), payload)
                .map_err(|_| CryptoError::AuthFail)?
        }
        AeadAlgorithm::ChaCha20Poly1305 => {
            let cipher =
                ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AuthFail)?;
            cipher
                .decrypt(ChaNonce::from_slice(nonce), payload)
                .map_err(|_| CryptoError::AuthFail)?
        }
        AeadAlgorithm::HybridX25519ChaCha => return Err(CryptoError::AuthFail),
    };
    Ok(Zeroizing::new(plaintext))
}

// ── Hybrid mode ──────────────────────────────────────────────────────────────

/// A hybrid-sealed blob: the ephemeral public key travels with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridSealed {
    /// Ephemeral X25519 public key, 32 raw bytes.
    pub ephemeral_pub: [u8; 32],
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

/// Seal to a recipient's X25519 public key.
pub fn hybrid_seal(
    recipient_pub: &X25519Public,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<HybridSealed, CryptoError> {
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_pub = X25519Public::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient_pub);

    let key_vec = kdf::derive_key(shared.as_bytes(), "hybrid-seal", ephemeral_pub.as_bytes(), 32)?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&key_vec);

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&kdf::generate_random(NONCE_LEN));

    let sealed = seal(AeadAlgorithm::ChaCha20Poly1305, &key, &nonce, aad, plaintext)?;
    Ok(HybridSealed {
        ephemeral_pub: *ephemeral_pub.as_bytes(),
        nonce,
        ciphertext: sealed.ciphertext,
        tag: sealed.tag,
    })
}

/// Open a hybrid-sealed blob with the recipient's X25519 secret.
pub fn hybrid_open(
    recipient_secret: &StaticSecret,
    aad: &[u8],
    blob: &HybridSealed,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let ephemeral_pub = X25519Public::from(blob.ephemeral_pub);
    let shared = recipient_secret.diffie_hellman(&ephemeral_pub);

    let key_vec = kdf::derive_key(shared.as_bytes(), "hybrid-seal", &blob.ephemeral_pub, 32)
        .map_err(|_| CryptoError::AuthFail)?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&key_vec);

    open(
        AeadAlgorithm::ChaCha20Poly1305,
        &key,
        &blob.nonce,
        aad,
        &blob.ciphertext,
        &blob.tag,
    )
}
