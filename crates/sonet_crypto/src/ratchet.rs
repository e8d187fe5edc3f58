//! Double Ratchet for direct chats.
//!
//! State separation:
//!   RK  — root key (updated on every DH ratchet step)
//!   CKs — sending chain key (updated per message)
//!   CKr — receiving chain key (updated per message)
//!   MK  — message key (derived per position, used once, then discarded)
//!
//! Each party generates a new X25519 ratchet keypair per turn; the DH output
//! is mixed into the root key via HKDF. Old chain material is zeroized:
//! forward secrecy within a chain, post-compromise security across DH steps.
//!
//! Rekey policy: the state reports `rekey_due` once the sending chain has
//! carried `MAX_MESSAGES_PER_CHAIN` messages or `REKEY_INTERVAL` has passed
//! since the last DH step. A DH step can only be *initiated* from the
//! receive side (the peer's root is otherwise unknowable), so the owner of
//! both endpoints — the engine — answers `rekey_due` by re-pairing them.
//!
//! Decrypt NEVER mutates state on failure: the chain is advanced on a
//! scratch copy and committed only after the AEAD tag verifies.

use std::collections::VecDeque;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::aead::{self, AeadAlgorithm, Sealed};
use crate::error::CryptoError;
use crate::kdf;

/// Bound on stored skipped message keys; oldest are evicted on overflow.
pub const MAX_SKIPPED_KEYS: usize = 1000;
/// Sending-chain length that forces a DH rekey.
pub const MAX_MESSAGES_PER_CHAIN: u64 = 1000;
/// Wall-clock age of a chain that forces a DH rekey.
pub const REKEY_INTERVAL_HOURS: i64 = 24;

/// Sent unencrypted alongside every ciphertext so the recipient can advance
/// their ratchet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatchetHeader {
    /// Sender's current DH ratchet public key (base64url).
    pub dh_pub: String,
    /// Message number in the current sending chain.
    pub n: u64,
    /// Length of the previous sending chain, for skip handling.
    pub pn: u64,
}

/// One skipped message key, kept in arrival order for eviction.
#[derive(Clone, Serialize, Deserialize)]
struct SkippedKey {
    dh_pub: String,
    n: u64,
    key: [u8; 32],
}

/// Complete Double Ratchet endpoint state for one side of a direct chat.
#[derive(Clone, Serialize, Deserialize)]
pub struct DoubleRatchet {
    pub chat_id: String,
    pub user_id: String,

    root_key: [u8; 32],

    /// Our current DH ratchet secret. Regenerated on each DH step.
    dh_send_secret: [u8; 32],
    #[serde(with = "pub_key_serde")]
    dh_send_pub: X25519Public,
    send_ck: [u8; 32],
    pub send_n: u64,

    #[serde(with = "option_pub_key_serde")]
    dh_recv_pub: Option<X25519Public>,
    recv_ck: [u8; 32],
    pub recv_n: u64,
    pub prev_send_n: u64,

    skipped: VecDeque<SkippedKey>,

    pub messages_since_rekey: u64,
    pub last_ratchet_at: DateTime<Utc>,
    /// Set by `mark_compromised`; cleared by the next DH step.
    compromised: bool,
}

impl Drop for DoubleRatchet {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.dh_send_secret.zeroize();
        self.send_ck.zeroize();
        self.recv_ck.zeroize();
        for entry in self.skipped.iter_mut() {
            entry.key.zeroize();
        }
    }
}

impl DoubleRatchet {
    /// Initiator side. The shared root is seeded from the identity DH; the
    /// peer's initial ratchet public key is their published ratchet key. The
    /// initiator performs the first DH step immediately, so it can send.
    pub fn initiate(
        chat_id: &str,
        user_id: &str,
        shared_root: [u8; 32],
        peer_ratchet_pub: &X25519Public,
    ) -> Result<Self, CryptoError> {
        let dh_send_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let dh_send_pub = X25519Public::from(&dh_send_secret);

        let dh_out = dh_send_secret.diffie_hellman(peer_ratchet_pub);
        let (root_key, send_ck) = kdf::kdf_rk(&shared_root, dh_out.as_bytes())?;

        Ok(Self {
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            root_key,
            dh_send_secret: dh_send_secret.to_bytes(),
            dh_send_pub,
            send_ck,
            send_n: 0,
            dh_recv_pub: Some(*peer_ratchet_pub),
            recv_ck: [0u8; 32],
            recv_n: 0,
            prev_send_n: 0,
            skipped: VecDeque::new(),
            messages_since_rekey: 0,
            last_ratchet_at: Utc::now(),
            compromised: false,
        })
    }

    /// Responder side. Holds its published ratchet keypair and waits for the
    /// initiator's first message to complete the first DH step.
    pub fn respond(
        chat_id: &str,
        user_id: &str,
        shared_root: [u8; 32],
        my_ratchet_secret: StaticSecret,
    ) -> Self {
        let dh_send_pub = X25519Public::from(&my_ratchet_secret);
        Self {
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            root_key: shared_root,
            dh_send_secret: my_ratchet_secret.to_bytes(),
            dh_send_pub,
            send_ck: [0u8; 32],
            send_n: 0,
            dh_recv_pub: None,
            recv_ck: [0u8; 32],
            recv_n: 0,
            prev_send_n: 0,
            skipped: VecDeque::new(),
            messages_since_rekey: 0,
            last_ratchet_at: Utc::now(),
            compromised: false,
        }
    }

    pub fn our_ratchet_pub(&self) -> X25519Public {
        self.dh_send_pub
    }

    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    /// Zeroize all live key material and refuse further seals until the
    /// engine re-pairs the chat. Skipped keys are dropped: messages they
    /// covered become undecryptable, which is the point of compromise
    /// recovery.
    pub fn mark_compromised(&mut self) {
        self.send_ck.zeroize();
        self.recv_ck.zeroize();
        for entry in self.skipped.iter_mut() {
            entry.key.zeroize();
        }
        self.skipped.clear();
        self.compromised = true;
    }

    pub fn is_compromised(&self) -> bool {
        self.compromised
    }

    /// Whether the chain has outlived its budget. The DH step itself is
    /// driven by the engine, which owns both endpoints.
    pub fn rekey_due(&self) -> bool {
        self.compromised
            || self.messages_since_rekey >= MAX_MESSAGES_PER_CHAIN
            || Utc::now() - self.last_ratchet_at >= Duration::hours(REKEY_INTERVAL_HOURS)
    }

    /// Seal one message. Derives the position key, advances the chain,
    /// seals with the deterministic nonce LE64(n) ‖ LE32(0), and discards
    /// the message key.
    pub fn seal(
        &mut self,
        alg: AeadAlgorithm,
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<(RatchetHeader, [u8; 12], Sealed), CryptoError> {
        if self.compromised {
            return Err(CryptoError::RatchetStep(
                "state marked compromised, awaiting rekey".into(),
            ));
        }

        let n = self.send_n;
        let mut mk = kdf::message_key(&self.send_ck, n)?;
        let next_ck = kdf::next_chain_key(&self.send_ck)?;
        self.send_ck.zeroize();
        self.send_ck = next_ck;
        self.send_n += 1;
        self.messages_since_rekey += 1;

        let nonce = kdf::message_nonce(n);
        let sealed = aead::seal(alg, &mk, &nonce, aad, plaintext);
        mk.zeroize();

        let header = RatchetHeader {
            dh_pub: URL_SAFE_NO_PAD.encode(self.dh_send_pub.as_bytes()),
            n,
            pn: self.prev_send_n,
        };
        Ok((header, nonce, sealed?))
    }

    /// Open one message. All chain advancement happens on a scratch copy;
    /// the copy replaces `self` only after the tag verifies, so a forged or
    /// corrupted message leaves the ratchet untouched.
    pub fn open(
        &mut self,
        alg: AeadAlgorithm,
        header: &RatchetHeader,
        aad: &[u8],
        ciphertext: &[u8],
        tag: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let mut scratch = self.clone();
        let mut mk = scratch.derive_recv_key(header)?;

        let nonce = kdf::message_nonce(header.n);
        let result = aead::open(alg, &mk, &nonce, aad, ciphertext, tag);
        mk.zeroize();

        match result {
            Ok(plaintext) => {
                *self = scratch;
                Ok(plaintext.to_vec())
            }
            Err(_) => Err(CryptoError::AuthFail),
        }
    }

    /// Derive the message key for a received header, advancing this state.
    /// Handles: stored skipped key, DH ratchet on a new peer key, and
    /// skipping over not-yet-received positions.
    fn derive_recv_key(&mut self, header: &RatchetHeader) -> Result<[u8; 32], CryptoError> {
        // Stored skipped key?
        if let Some(idx) = self
            .skipped
            .iter()
            .position(|s| s.dh_pub == header.dh_pub && s.n == header.n)
        {
            let mut entry = self.skipped.remove(idx).expect("index in range");
            let key = entry.key;
            entry.key.zeroize();
            return Ok(key);
        }

        let peer_bytes: [u8; 32] = URL_SAFE_NO_PAD
            .decode(&header.dh_pub)?
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("bad ratchet public key".into()))?;
        let peer = X25519Public::from(peer_bytes);

        let need_dh = match self.dh_recv_pub {
            Some(ref current) => current.as_bytes() != peer.as_bytes(),
            None => true,
        };

        if need_dh {
            // Store keys left in the outgoing chain the peer abandoned.
            if self.dh_recv_pub.is_some() {
                self.skip_to(header.pn)?;
            }
            self.dh_recv_pub = Some(peer);

            let dh_recv = StaticSecret::from(self.dh_send_secret).diffie_hellman(&peer);
            let (new_root, new_recv_ck) = kdf::kdf_rk(&self.root_key, dh_recv.as_bytes())?;
            self.root_key.zeroize();
            self.root_key = new_root;
            self.recv_ck.zeroize();
            self.recv_ck = new_recv_ck;
            self.recv_n = 0;

            // Rotate our sending side against the peer's new key.
            self.prev_send_n = self.send_n;
            self.send_n = 0;
            let new_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
            let new_pub = X25519Public::from(&new_secret);
            let dh_send = new_secret.diffie_hellman(&peer);
            let (new_root2, new_send_ck) = kdf::kdf_rk(&self.root_key, dh_send.as_bytes())?;
            self.root_key.zeroize();
            self.root_key = new_root2;
            self.send_ck.zeroize();
            self.send_ck = new_send_ck;
            self.dh_send_secret.zeroize();
            self.dh_send_secret = new_secret.to_bytes();
            self.dh_send_pub = new_pub;
            self.messages_since_rekey = 0;
            self.last_ratchet_at = Utc::now();
            self.compromised = false;
        }

        self.skip_to(header.n)?;

        let mk = kdf::message_key(&self.recv_ck, self.recv_n)?;
        let next = kdf::next_chain_key(&self.recv_ck)?;
        self.recv_ck.zeroize();
        self.recv_ck = next;
        self.recv_n += 1;
        Ok(mk)
    }

    /// Store message keys for positions recv_n..until, evicting oldest once
    /// the bound is hit.
    fn skip_to(&mut self, until: u64) -> Result<(), CryptoError> {
        if until <= self.recv_n {
            return Ok(());
        }
        let jump = until - self.recv_n;
        if jump > MAX_SKIPPED_KEYS as u64 {
            return Err(CryptoError::RatchetStep(format!(
                "counter jump of {jump} exceeds skipped-key bound"
            )));
        }

        let dh_pub = self
            .dh_recv_pub
            .map(|k| URL_SAFE_NO_PAD.encode(k.as_bytes()))
            .unwrap_or_default();

        while self.recv_n < until {
            let mk = kdf::message_key(&self.recv_ck, self.recv_n)?;
            let next = kdf::next_chain_key(&self.recv_ck)?;
            self.recv_ck.zeroize();
            self.recv_ck = next;
            self.skipped.push_back(SkippedKey {
                dh_pub: dh_pub.clone(),
                n: self.recv_n,
                key: mk,
            });
            self.recv_n += 1;
        }

        while self.skipped.len() > MAX_SKIPPED_KEYS {
            if let Some(mut oldest) = self.skipped.pop_front() {
                oldest.key.zeroize();
            }
        }
        Ok(())
    }
}

// ── Serde helpers for X25519 public keys ─────────────────────────────────────

mod pub_key_serde {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};
    use x25519_dalek::PublicKey as X25519Public;

    pub fn serialize<S: Serializer>(key: &X25519Public, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&URL_SAFE_NO_PAD.encode(key.as_bytes()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<X25519Public, D::Error> {
        let s = String::deserialize(d)?;
        let bytes = URL_SAFE_NO_PAD.decode(&s).map_err(serde::de::Error::custom)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))?;
        Ok(X25519Public::from(arr))
    }
}

mod option_pub_key_serde {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};
    use x25519_dalek::PublicKey as X25519Public;

    pub fn serialize<S: Serializer>(key: &Option<X25519Public>, s: S) -> Result<S::Ok, S::Error> {
        match key {
            Some(k) => s.serialize_some(&URL_SAFE_NO_PAD.encode(k.as_bytes())),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<X25519Public>, D::Error> {
        let opt: Option<String> = Option::deserialize(d)?;
        opt.map(|s| {
            let bytes = URL_SAFE_NO_PAD.decode(&s).map_err(serde::de::Error::custom)?;
            let arr: [u8; 32] = bytes
                .try_into()
                .map_err(|_| serde::de::Error::custom("expected 32 bytes"))?;
            Ok(X25519Public::from(arr))
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::x25519_keygen;

    const ALG: AeadAlgorithm = AeadAlgorithm::ChaCha20Poly1305;

    fn pair() -> (DoubleRatchet, DoubleRatchet) {
        let shared_root = [42u8; 32];
        let (bob_ratchet_secret, bob_ratchet_pub) = x25519_keygen();
        let alice =
            DoubleRatchet::initiate("chat", "alice", shared_root, &bob_ratchet_pub).unwrap();
        let bob = DoubleRatchet::respond("chat", "bob", shared_root, bob_ratchet_secret);
        (alice, bob)
    }

    #[test]
    fn roundtrip_with_turns() {
        let (mut alice, mut bob) = pair();

        for i in 0..3 {
            let msg = format!("alice {i}");
            let (h, _, sealed) = alice.seal(ALG, b"aad", msg.as_bytes()).unwrap();
            let pt = bob.open(ALG, &h, b"aad", &sealed.ciphertext, &sealed.tag).unwrap();
            assert_eq!(pt, msg.as_bytes());
        }

        // Bob replies: triggers a DH ratchet on both ends.
        for i in 0..2 {
            let msg = format!("bob {i}");
            let (h, _, sealed) = bob.seal(ALG, b"aad", msg.as_bytes()).unwrap();
            let pt = alice.open(ALG, &h, b"aad", &sealed.ciphertext, &sealed.tag).unwrap();
            assert_eq!(pt, msg.as_bytes());
        }

        let (h, _, sealed) = alice.seal(ALG, b"aad", b"again").unwrap();
        assert_eq!(
            bob.open(ALG, &h, b"aad", &sealed.ciphertext, &sealed.tag).unwrap(),
            b"again"
        );
    }

    #[test]
    fn out_of_order_consumes_skipped_keys() {
        let (mut alice, mut bob) = pair();

        let (h0, _, s0) = alice.seal(ALG, b"", b"m0").unwrap();
        let (h1, _, s1) = alice.seal(ALG, b"", b"m1").unwrap();
        let (h2, _, s2) = alice.seal(ALG, b"", b"m2").unwrap();

        assert_eq!(bob.open(ALG, &h0, b"", &s0.ciphertext, &s0.tag).unwrap(), b"m0");
        // m2 before m1: one key gets skipped.
        assert_eq!(bob.open(ALG, &h2, b"", &s2.ciphertext, &s2.tag).unwrap(), b"m2");
        assert_eq!(bob.skipped_len(), 1);
        assert_eq!(bob.open(ALG, &h1, b"", &s1.ciphertext, &s1.tag).unwrap(), b"m1");
        assert_eq!(bob.skipped_len(), 0);
    }

    #[test]
    fn forged_tag_leaves_state_untouched() {
        let (mut alice, mut bob) = pair();

        let (h0, _, s0) = alice.seal(ALG, b"", b"first").unwrap();
        bob.open(ALG, &h0, b"", &s0.ciphertext, &s0.tag).unwrap();

        let (h1, _, s1) = alice.seal(ALG, b"", b"second").unwrap();
        let recv_n_before = bob.recv_n;
        let skipped_before = bob.skipped_len();

        let mut bad_tag = s1.tag;
        bad_tag[3] ^= 0x01;
        let err = bob.open(ALG, &h1, b"", &s1.ciphertext, &bad_tag).unwrap_err();
        assert!(matches!(err, CryptoError::AuthFail));
        assert_eq!(bob.recv_n, recv_n_before);
        assert_eq!(bob.skipped_len(), skipped_before);

        // The genuine message still decrypts afterwards.
        assert_eq!(bob.open(ALG, &h1, b"", &s1.ciphertext, &s1.tag).unwrap(), b"second");
    }

    #[test]
    fn skipped_keys_stay_bounded() {
        let (mut alice, mut bob) = pair();

        // First message establishes Bob's receiving chain.
        let (h, _, s) = alice.seal(ALG, b"", b"head").unwrap();
        bob.open(ALG, &h, b"", &s.ciphertext, &s.tag).unwrap();

        // Two batches of 600 undelivered messages, each followed by one that
        // arrives. 1200 skipped positions exceed the bound, so the oldest
        // 200 are evicted.
        for _ in 0..600 {
            alice.seal(ALG, b"", b"lost").unwrap();
        }
        let (h1, _, s1) = alice.seal(ALG, b"", b"delivered-1").unwrap();
        bob.open(ALG, &h1, b"", &s1.ciphertext, &s1.tag).unwrap();
        assert_eq!(bob.skipped_len(), 600);

        for _ in 0..600 {
            alice.seal(ALG, b"", b"lost").unwrap();
        }
        let (h2, _, s2) = alice.seal(ALG, b"", b"delivered-2").unwrap();
        bob.open(ALG, &h2, b"", &s2.ciphertext, &s2.tag).unwrap();
        assert_eq!(bob.skipped_len(), MAX_SKIPPED_KEYS);
    }

    #[test]
    fn oversized_jump_is_rejected_without_mutation() {
        let (mut alice, mut bob) = pair();
        let (h, _, s) = alice.seal(ALG, b"", b"head").unwrap();
        bob.open(ALG, &h, b"", &s.ciphertext, &s.tag).unwrap();

        // A counter far beyond the skipped-key bound must be refused before
        // any chain advancement happens.
        let (mut h_far, _, s_far) = alice.seal(ALG, b"", b"far").unwrap();
        h_far.n = MAX_SKIPPED_KEYS as u64 + 5;
        let recv_n_before = bob.recv_n;
        assert!(bob.open(ALG, &h_far, b"", &s_far.ciphertext, &s_far.tag).is_err());
        assert_eq!(bob.recv_n, recv_n_before);
    }

    #[test]
    fn rekey_due_after_chain_budget() {
        let (mut alice, mut bob) = pair();
        assert!(!alice.rekey_due());
        alice.messages_since_rekey = MAX_MESSAGES_PER_CHAIN;
        assert!(alice.rekey_due());

        // A natural DH turn resets the budget on both sides.
        let (h, _, s) = alice.seal(ALG, b"", b"a").unwrap();
        bob.open(ALG, &h, b"", &s.ciphertext, &s.tag).unwrap();
        let (h, _, s) = bob.seal(ALG, b"", b"b").unwrap();
        alice.open(ALG, &h, b"", &s.ciphertext, &s.tag).unwrap();
        assert!(!alice.rekey_due());
        assert_eq!(alice.messages_since_rekey, 0);
    }

    #[test]
    fn compromised_state_refuses_to_seal() {
        let (mut alice, mut bob) = pair();
        let (h, _, s) = alice.seal(ALG, b"", b"a").unwrap();
        bob.open(ALG, &h, b"", &s.ciphertext, &s.tag).unwrap();

        alice.mark_compromised();
        assert!(alice.is_compromised());
        assert!(alice.rekey_due());
        assert!(matches!(
            alice.seal(ALG, b"", b"blocked").unwrap_err(),
            CryptoError::RatchetStep(_)
        ));
    }

    #[test]
    fn state_survives_serde() {
        let (mut alice, mut bob) = pair();
        let (h, _, s) = alice.seal(ALG, b"", b"before").unwrap();
        bob.open(ALG, &h, b"", &s.ciphertext, &s.tag).unwrap();

        let json = serde_json::to_string(&bob).unwrap();
        let mut restored: DoubleRatchet = serde_json::from_str(&json).unwrap();

        let (h, _, s) = alice.seal(ALG, b"", b"after").unwrap();
        assert_eq!(
            restored.open(ALG, &h, b"", &s.ciphertext, &s.tag).unwrap(),
            b"after"
        );
    }
}
