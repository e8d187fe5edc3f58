//! Key derivation.
//!
//! HKDF-SHA256 per RFC 5869, with one fixed labeling scheme for every
//! derived key in the system:
//!
//!   info = "sonet/" ‖ label ‖ 0x00 ‖ context
//!
//! Chain evolution for the ratchets:
//!   message_key = HKDF(chain_key, "msg" ‖ LE64(n), 32)
//!   chain_key'  = HKDF(chain_key, "chain", 32)

use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::error::CryptoError;

/// Uniform random bytes from the OS CSPRNG.
pub fn generate_random(n: usize) -> Vec<u8> {
    let mut out = vec![0u8; n];
    rand::rngs::OsRng.fill_bytes(&mut out);
    out
}

/// HKDF-Extract: (salt, ikm) → prk.
pub fn hkdf_extract(salt: Option<&[u8]>, ikm: &[u8]) -> [u8; 32] {
    let (prk, _) = Hkdf::<Sha256>::extract(salt, ikm);
    prk.into()
}

/// HKDF-Expand: (prk, info) → okm of `output.len()` bytes.
pub fn hkdf_expand(prk: &[u8], info: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::from_prk(prk)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// One-shot extract-then-expand. `salt` may be empty.
pub fn hkdf(salt: Option<&[u8]>, ikm: &[u8], info: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Build the fixed info layout for a labeled derivation.
fn labeled_info(label: &str, context: &[u8]) -> Vec<u8> {
    let mut info = Vec::with_capacity(6 + label.len() + 1 + context.len());
    info.extend_from_slice(b"sonet/");
    info.extend_from_slice(label.as_bytes());
    info.push(0x00);
    info.extend_from_slice(context);
    info
}

/// Derive `length` bytes under the "sonet/" labeling scheme.
pub fn derive_key(ikm: &[u8], label: &str, context: &[u8], length: usize) -> Result<Vec<u8>, CryptoError> {
    let mut out = vec![0u8; length];
    hkdf(None, ikm, &labeled_info(label, context), &mut out)?;
    Ok(out)
}

// ── Ratchet chain evolution ──────────────────────────────────────────────────

/// KDF_RK: mix a DH output into the root key.
/// Returns (new_root_key, new_chain_key).
pub fn kdf_rk(root_key: &[u8; 32], dh_output: &[u8]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(root_key), dh_output);
    let mut new_rk = [0u8; 32];
    let mut ck = [0u8; 32];
    hk.expand(&labeled_info("ratchet-root", b""), &mut new_rk)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    hk.expand(&labeled_info("ratchet-chain", b""), &mut ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok((new_rk, ck))
}

/// Message key for position `n` of a chain. Does not advance the chain.
pub fn message_key(chain_key: &[u8; 32], n: u64) -> Result<[u8; 32], CryptoError> {
    let mut mk = [0u8; 32];
    hkdf(
        None,
        chain_key,
        &labeled_info("msg", &n.to_le_bytes()),
        &mut mk,
    )?;
    Ok(mk)
}

/// Advance a chain key one step.
pub fn next_chain_key(chain_key: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
    let mut next = [0u8; 32];
    hkdf(None, chain_key, &labeled_info("chain", b""), &mut next)?;
    Ok(next)
}

/// Deterministic 96-bit AEAD nonce for message `n`: LE64(n) ‖ LE32(0).
/// Uniqueness under a given message key is guaranteed because each key is
/// used for exactly one position.
pub fn message_nonce(n: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&n.to_le_bytes());
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labeled_derivations_are_domain_separated() {
        let ikm = [7u8; 32];
        let a = derive_key(&ikm, "alpha", b"ctx", 32).unwrap();
        let b = derive_key(&ikm, "beta", b"ctx", 32).unwrap();
        let c = derive_key(&ikm, "alpha", b"other", 32).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn extract_expand_matches_one_shot() {
        let prk = hkdf_extract(Some(b"salt"), b"ikm");
        let mut via_prk = [0u8; 32];
        hkdf_expand(&prk, b"info", &mut via_prk).unwrap();
        let mut one_shot = [0u8; 32];
        hkdf(Some(b"salt"), b"ikm", b"info", &mut one_shot).unwrap();
        assert_eq!(via_prk, one_shot);
    }

    #[test]
    fn chain_positions_yield_distinct_keys() {
        let ck = [1u8; 32];
        assert_ne!(message_key(&ck, 0).unwrap(), message_key(&ck, 1).unwrap());
        let ck2 = next_chain_key(&ck).unwrap();
        assert_ne!(ck, ck2);
        assert_ne!(message_key(&ck, 0).unwrap(), message_key(&ck2, 0).unwrap());
    }

    #[test]
    fn nonce_layout() {
        let n = message_nonce(0x0102030405060708);
        assert_eq!(&n[..8], &0x0102030405060708u64.to_le_bytes());
        assert_eq!(&n[8..], &[0u8; 4]);
    }

    #[test]
    fn random_is_not_constant() {
        assert_ne!(generate_random(32), generate_random(32));
    }
}
