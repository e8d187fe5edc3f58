//! Identity keys and fingerprints.
//!
//! Each endpoint owns a long-term Ed25519 signing key and an X25519 key
//! for Diffie-Hellman. Public keys are base64url on the wire and carry a
//! BLAKE3 fingerprint for display and descriptor binding.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

// ── Public key newtype ───────────────────────────────────────────────────────

/// 32-byte public key, base64url-encoded on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKeyBytes(pub Vec<u8>);

impl PublicKeyBytes {
    pub fn to_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.0)
    }

    pub fn from_b64(s: &str) -> Result<Self, CryptoError> {
        let bytes = URL_SAFE_NO_PAD.decode(s)?;
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "public key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    /// BLAKE3 of the public key, truncated to 160 bits, hex in groups of 4.
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.0);
        let hex = hex::encode(&hash.as_bytes()[..20]);
        hex.as_bytes()
            .chunks(4)
            .map(|c| std::str::from_utf8(c).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Fingerprint of raw symmetric key material, same display format.
pub fn key_fingerprint(material: &[u8]) -> String {
    PublicKeyBytes(blake3::hash(material).as_bytes().to_vec()).fingerprint()
}

// ── Signing identity ─────────────────────────────────────────────────────────

/// Long-term Ed25519 identity. Drop clears memory.
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    #[zeroize(skip)]
    pub public: PublicKeyBytes,
    secret_bytes: [u8; 32],
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public = PublicKeyBytes(signing_key.verifying_key().to_bytes().to_vec());
        Self { public, secret_bytes: signing_key.to_bytes() }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("identity key must be 32 bytes".into()))?;
        let signing_key = SigningKey::from_bytes(&arr);
        let public = PublicKeyBytes(signing_key.verifying_key().to_bytes().to_vec());
        Ok(Self { public, secret_bytes: arr })
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret_bytes
    }

    /// Sign arbitrary bytes; returns the 64-byte raw Ed25519 signature.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        SigningKey::from_bytes(&self.secret_bytes).sign(msg).to_bytes().to_vec()
    }

    pub fn fingerprint(&self) -> String {
        self.public.fingerprint()
    }
}

/// Verify a signature under any Ed25519 public key.
pub fn verify(public_bytes: &[u8], msg: &[u8], sig_bytes: &[u8]) -> Result<(), CryptoError> {
    let vk = VerifyingKey::from_bytes(
        public_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("bad pubkey length".into()))?,
    )
    .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let sig = Signature::from_bytes(
        sig_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("bad signature length".into()))?,
    );
    vk.verify(msg, &sig).map_err(|_| CryptoError::SignatureVerification)
}

// ── X25519 ───────────────────────────────────────────────────────────────────

/// Fresh X25519 keypair.
pub fn x25519_keygen() -> (StaticSecret, X25519Public) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = X25519Public::from(&secret);
    (secret, public)
}

/// Raw Diffie-Hellman.
pub fn x25519_dh(secret: &StaticSecret, public: &X25519Public) -> [u8; 32] {
    *secret.diffie_hellman(public).as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let id = IdentityKeyPair::generate();
        let sig = id.sign(b"payload");
        assert!(verify(&id.public.0, b"payload", &sig).is_ok());
        assert!(verify(&id.public.0, b"other", &sig).is_err());
    }

    #[test]
    fn dh_is_symmetric() {
        let (sa, pa) = x25519_keygen();
        let (sb, pb) = x25519_keygen();
        assert_eq!(x25519_dh(&sa, &pb), x25519_dh(&sb, &pa));
    }

    #[test]
    fn fingerprint_is_grouped_hex() {
        let id = IdentityKeyPair::generate();
        let fp = id.fingerprint();
        assert_eq!(fp.split(' ').count(), 10);
        assert!(fp.split(' ').all(|g| g.len() == 4));
    }

    #[test]
    fn b64_roundtrip_rejects_bad_length() {
        let id = IdentityKeyPair::generate();
        let b64 = id.public.to_b64();
        assert_eq!(PublicKeyBytes::from_b64(&b64).unwrap(), id.public);
        assert!(PublicKeyBytes::from_b64("AAEC").is_err());
    }
}
