//! sonet_crypto — cryptographic primitives and the ratchet engine.
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Decrypt failures are a single neutral `AuthFail` that never says which
//!   field failed, and never mutate ratchet state.
//!
//! # Module layout
//! - `aead`    — AEAD seal/open (AES-256-GCM, ChaCha20-Poly1305, hybrid)
//! - `kdf`     — HKDF extract/expand, the "sonet/" labeling scheme, CSPRNG
//! - `keys`    — Ed25519 identities, X25519 DH, BLAKE3 fingerprints
//! - `ratchet` — Double Ratchet for direct chats
//! - `mls`     — ratchet-tree group state for group chats
//! - `session` — per-(chat, user) session key bookkeeping
//! - `engine`  — per-chat cipher state registry, the crate's public face
//! - `error`   — unified error type

pub mod aead;
pub mod engine;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod mls;
pub mod ratchet;
pub mod session;

pub use engine::RatchetEngine;
pub use error::CryptoError;
