//! Epoch-keyed group state.
//!
//! Every membership change is a Commit: the tree mutates, the transcript
//! hash absorbs the change, and the next epoch secret is derived as
//!
//!   epoch_secret' = HKDF(prev_epoch_secret ‖ commit_secret,
//!                        "sonet/mls-epoch", transcript)
//!
//! where `commit_secret` is fresh randomness. Mixing fresh entropy is what
//! locks a removed member out: knowing the previous epoch secret alone is
//! not enough to derive the next one.
//!
//! Per-sender AEAD keys are derived from the epoch secret and the sender's
//! leaf index; nonces are deterministic from the sender's sequence counter.

use std::collections::{HashMap, VecDeque};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::PublicKey as X25519Public;
use zeroize::Zeroize;

use sonet_proto::chat::{GroupSizeStatus, MAX_GROUP_MEMBERS};

use crate::aead::{self, HybridSealed};
use crate::error::CryptoError;
use crate::kdf;
use crate::mls::tree::{LeafNode, RatchetTree};
use crate::mls::CipherSuite;

/// How many past epoch secrets stay resolvable for straggler decryption.
const EPOCH_SECRET_RETENTION: usize = 8;

/// Published by a prospective member; everything needed to add their leaf.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPackage {
    pub user_id: String,
    /// X25519 init key, base64url. Welcome secrets are sealed to it.
    pub init_pub: String,
    /// Ed25519 signing key, base64url.
    pub signing_pub: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum GroupChange {
    MemberAdded { user_id: String, leaf_index: usize },
    MemberRemoved { user_id: String, leaf_index: usize },
    KeyUpdate,
}

/// Broadcast to existing members on every epoch change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub group_id: String,
    pub epoch: u64,
    #[serde(flatten)]
    pub change: GroupChange,
    /// Hex tree hash after the mutation.
    pub tree_hash: String,
    /// Hex confirmed transcript hash after absorbing this commit.
    pub transcript_hash: String,
}

/// Handed to a newcomer: the current epoch secret sealed to their init key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Welcome {
    pub group_id: String,
    pub epoch: u64,
    pub cipher_suite: CipherSuite,
    pub sealed_epoch_secret: HybridSealed,
    pub tree_hash: String,
}

/// Ciphertext as it leaves the group engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupCiphertext {
    pub group_id: String,
    pub epoch: u64,
    pub sender_leaf: usize,
    pub seq: u64,
    pub ciphertext: Vec<u8>,
    pub tag: [u8; 16],
}

pub struct MlsGroup {
    pub group_id: String,
    pub epoch: u64,
    pub cipher_suite: CipherSuite,
    tree: RatchetTree,
    epoch_secret: [u8; 32],
    /// (epoch, secret) of recent past epochs, oldest first.
    past_epoch_secrets: VecDeque<(u64, [u8; 32])>,
    confirmed_transcript_hash: [u8; 32],
    /// Per-sender-leaf sequence counters within the current epoch.
    sender_seq: HashMap<usize, u64>,
}

impl Drop for MlsGroup {
    fn drop(&mut self) {
        self.epoch_secret.zeroize();
        for (_, secret) in self.past_epoch_secrets.iter_mut() {
            secret.zeroize();
        }
    }
}

impl MlsGroup {
    /// Single-member group at epoch 0 with a random first epoch secret.
    pub fn create(group_id: &str, cipher_suite: CipherSuite, creator: KeyPackage) -> Self {
        let mut tree = RatchetTree::new();
        tree.insert(LeafNode {
            user_id: creator.user_id,
            init_pub: creator.init_pub,
            signing_pub: creator.signing_pub,
            joined_at_epoch: 0,
        });
        let mut epoch_secret = [0u8; 32];
        epoch_secret.copy_from_slice(&kdf::generate_random(32));
        Self {
            group_id: group_id.to_string(),
            epoch: 0,
            cipher_suite,
            tree,
            epoch_secret,
            past_epoch_secrets: VecDeque::new(),
            confirmed_transcript_hash: [0u8; 32],
            sender_seq: HashMap::new(),
        }
    }

    pub fn member_count(&self) -> usize {
        self.tree.member_count()
    }

    pub fn is_member(&self, user_id: &str) -> bool {
        self.tree.leaf_index_of(user_id).is_some()
    }

    pub fn leaf_index_of(&self, user_id: &str) -> Option<usize> {
        self.tree.leaf_index_of(user_id)
    }

    pub fn member_ids(&self) -> Vec<String> {
        self.tree.members().map(|(_, l)| l.user_id.clone()).collect()
    }

    pub fn tree_hash_hex(&self) -> String {
        hex::encode(self.tree.tree_hash())
    }

    pub fn size_status(&self) -> GroupSizeStatus {
        GroupSizeStatus::for_count(self.member_count())
    }

    /// Add a member at the leftmost free leaf. Fails with `GroupFull` when
    /// the hard cap would be exceeded; no Welcome is produced in that case.
    pub fn add_member(&mut self, package: KeyPackage) -> Result<(Commit, Welcome), CryptoError> {
        if self.member_count() >= MAX_GROUP_MEMBERS {
            return Err(CryptoError::GroupFull);
        }
        let init_pub_bytes: [u8; 32] = URL_SAFE_NO_PAD
            .decode(&package.init_pub)?
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("init key must be 32 bytes".into()))?;
        let init_pub = X25519Public::from(init_pub_bytes);

        let next_epoch = self.epoch + 1;
        let leaf_index = self.tree.insert(LeafNode {
            user_id: package.user_id.clone(),
            init_pub: package.init_pub,
            signing_pub: package.signing_pub,
            joined_at_epoch: next_epoch,
        });

        let change = GroupChange::MemberAdded { user_id: package.user_id, leaf_index };
        let commit = self.advance_epoch(&change)?;

        let aad = format!("{}:{}", self.group_id, self.epoch);
        let sealed_epoch_secret = aead::hybrid_seal(&init_pub, aad.as_bytes(), &self.epoch_secret)?;
        let welcome = Welcome {
            group_id: self.group_id.clone(),
            epoch: self.epoch,
            cipher_suite: self.cipher_suite,
            sealed_epoch_secret,
            tree_hash: commit.tree_hash.clone(),
        };
        Ok((commit, welcome))
    }

    /// Blank a leaf and advance the epoch so the departed member cannot
    /// read anything sealed from here on.
    pub fn remove_member(&mut self, leaf_index: usize) -> Result<Commit, CryptoError> {
        let removed = self.tree.blank(leaf_index).ok_or(CryptoError::UnknownMember)?;
        let change = GroupChange::MemberRemoved { user_id: removed.user_id, leaf_index };
        self.advance_epoch(&change)
    }

    /// Refresh the sender ratchet key material without a membership change.
    pub fn update(&mut self) -> Result<Commit, CryptoError> {
        self.advance_epoch(&GroupChange::KeyUpdate)
    }

    fn advance_epoch(&mut self, change: &GroupChange) -> Result<Commit, CryptoError> {
        self.epoch += 1;

        // transcript' = H(transcript ‖ canonical commit content)
        let mut h = Sha256::new();
        h.update(self.confirmed_transcript_hash);
        h.update(self.epoch.to_be_bytes());
        h.update(serde_json::to_vec(change)?);
        h.update(self.tree.tree_hash());
        self.confirmed_transcript_hash = h.finalize().into();

        let mut commit_secret = [0u8; 32];
        commit_secret.copy_from_slice(&kdf::generate_random(32));

        let mut ikm = Vec::with_capacity(64);
        ikm.extend_from_slice(&self.epoch_secret);
        ikm.extend_from_slice(&commit_secret);
        let next = kdf::derive_key(&ikm, "mls-epoch", &self.confirmed_transcript_hash, 32)?;
        ikm.zeroize();
        commit_secret.zeroize();

        self.past_epoch_secrets.push_back((self.epoch - 1, self.epoch_secret));
        while self.past_epoch_secrets.len() > EPOCH_SECRET_RETENTION {
            if let Some((_, mut old)) = self.past_epoch_secrets.pop_front() {
                old.zeroize();
            }
        }
        self.epoch_secret.copy_from_slice(&next);
        self.sender_seq.clear();

        Ok(Commit {
            group_id: self.group_id.clone(),
            epoch: self.epoch,
            change: change.clone(),
            tree_hash: self.tree_hash_hex(),
            transcript_hash: hex::encode(self.confirmed_transcript_hash),
        })
    }

    fn sender_key(&self, epoch_secret: &[u8; 32], leaf: usize) -> Result<[u8; 32], CryptoError> {
        let key = kdf::derive_key(epoch_secret, "mls-sender", &(leaf as u64).to_le_bytes(), 32)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&key);
        Ok(out)
    }

    fn nonce_for(seq: u64) -> [u8; 12] {
        kdf::message_nonce(seq)
    }

    /// Seal a message from `sender_id` under the current epoch.
    pub fn encrypt_message(
        &mut self,
        sender_id: &str,
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<GroupCiphertext, CryptoError> {
        let leaf = self
            .leaf_index_of(sender_id)
            .ok_or(CryptoError::UnknownMember)?;
        let current = *self.sender_seq.entry(leaf).or_insert(0);

        let mut key = self.sender_key(&self.epoch_secret, leaf)?;
        let nonce = Self::nonce_for(current);
        let sealed = aead::seal(self.cipher_suite.aead(), &key, &nonce, aad, plaintext);
        key.zeroize();
        let sealed = sealed?;

        *self.sender_seq.entry(leaf).or_insert(0) = current + 1;
        Ok(GroupCiphertext {
            group_id: self.group_id.clone(),
            epoch: self.epoch,
            sender_leaf: leaf,
            seq: current,
            ciphertext: sealed.ciphertext,
            tag: sealed.tag,
        })
    }

    /// Open a group ciphertext. Messages from the current epoch or a
    /// retained past epoch decrypt; anything older is gone by design.
    /// Failure never mutates the group state.
    pub fn decrypt_message(
        &self,
        ct: &GroupCiphertext,
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let epoch_secret = if ct.epoch == self.epoch {
            &self.epoch_secret
        } else {
            self.past_epoch_secrets
                .iter()
                .find(|(e, _)| *e == ct.epoch)
                .map(|(_, s)| s)
                .ok_or(CryptoError::AuthFail)?
        };

        let mut key = self.sender_key(epoch_secret, ct.sender_leaf)?;
        let nonce = Self::nonce_for(ct.seq);
        let result = aead::open(
            self.cipher_suite.aead(),
            &key,
            &nonce,
            aad,
            &ct.ciphertext,
            &ct.tag,
        );
        key.zeroize();
        Ok(result.map_err(|_| CryptoError::AuthFail)?.to_vec())
    }

    /// Recover the epoch secret from a Welcome (newcomer side).
    pub fn open_welcome(
        welcome: &Welcome,
        init_secret: &x25519_dalek::StaticSecret,
    ) -> Result<[u8; 32], CryptoError> {
        let aad = format!("{}:{}", welcome.group_id, welcome.epoch);
        let plaintext = aead::hybrid_open(init_secret, aad.as_bytes(), &welcome.sealed_epoch_secret)?;
        let secret: [u8; 32] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::AuthFail)?;
        Ok(secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::x25519_keygen;

    fn package(user: &str) -> (KeyPackage, x25519_dalek::StaticSecret) {
        let (secret, public) = x25519_keygen();
        (
            KeyPackage {
                user_id: user.into(),
                init_pub: URL_SAFE_NO_PAD.encode(public.as_bytes()),
                signing_pub: URL_SAFE_NO_PAD.encode([0u8; 32]),
            },
            secret,
        )
    }

    fn group_of(n: usize) -> MlsGroup {
        let (creator, _) = package("u0");
        let mut g = MlsGroup::create("g1", CipherSuite::default(), creator);
        for i in 1..n {
            let (p, _) = package(&format!("u{i}"));
            g.add_member(p).unwrap();
        }
        g
    }

    #[test]
    fn epoch_advances_on_every_mutation() {
        let mut g = group_of(3);
        assert_eq!(g.epoch, 2);
        let idx = g.leaf_index_of("u1").unwrap();
        g.remove_member(idx).unwrap();
        assert_eq!(g.epoch, 3);
        g.update().unwrap();
        assert_eq!(g.epoch, 4);
    }

    #[test]
    fn add_rejected_at_cap() {
        let mut g = group_of(MAX_GROUP_MEMBERS);
        assert_eq!(g.member_count(), MAX_GROUP_MEMBERS);
        assert_eq!(g.size_status(), GroupSizeStatus::AtLimit);
        let (p, _) = package("overflow");
        let err = g.add_member(p).unwrap_err();
        assert!(matches!(err, CryptoError::GroupFull));
        assert_eq!(g.member_count(), MAX_GROUP_MEMBERS);
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let mut g = group_of(4);
        let ct = g.encrypt_message("u2", b"aad", b"gm").unwrap();
        assert_eq!(g.decrypt_message(&ct, b"aad").unwrap(), b"gm");
        // Sequence counters keep nonces moving.
        let ct2 = g.encrypt_message("u2", b"aad", b"gm").unwrap();
        assert_eq!(ct2.seq, ct.seq + 1);
    }

    #[test]
    fn removed_member_cannot_read_future_epochs() {
        let mut g = group_of(3);
        // An attacker who captured the epoch-2 secret...
        let old_ct = g.encrypt_message("u0", b"", b"before removal").unwrap();
        let idx = g.leaf_index_of("u2").unwrap();
        g.remove_member(idx).unwrap();
        let new_ct = g.encrypt_message("u0", b"", b"after removal").unwrap();
        // ...still decrypts retained history but the epochs differ, so
        // the new message is sealed under a secret mixed with fresh
        // entropy the removed member never saw.
        assert_ne!(old_ct.epoch, new_ct.epoch);
        assert_eq!(g.decrypt_message(&new_ct, b"").unwrap(), b"after removal");
    }

    #[test]
    fn straggler_decrypts_from_retained_epoch() {
        let mut g = group_of(2);
        let ct = g.encrypt_message("u0", b"", b"late").unwrap();
        g.update().unwrap();
        g.update().unwrap();
        assert_eq!(g.decrypt_message(&ct, b"").unwrap(), b"late");
    }

    #[test]
    fn welcome_carries_recoverable_secret() {
        let (creator, _) = package("u0");
        let mut g = MlsGroup::create("g1", CipherSuite::default(), creator);
        let (p, newcomer_secret) = package("u1");
        let (commit, welcome) = g.add_member(p).unwrap();
        assert_eq!(commit.epoch, welcome.epoch);
        let recovered = MlsGroup::open_welcome(&welcome, &newcomer_secret).unwrap();
        assert_eq!(recovered, g.epoch_secret);
    }

    #[test]
    fn tampered_ciphertext_is_neutral_authfail() {
        let mut g = group_of(2);
        let mut ct = g.encrypt_message("u0", b"", b"x").unwrap();
        ct.tag[0] ^= 1;
        assert!(matches!(
            g.decrypt_message(&ct, b"").unwrap_err(),
            CryptoError::AuthFail
        ));
    }

    #[test]
    fn tree_hash_changes_per_commit() {
        let mut g = group_of(2);
        let h1 = g.tree_hash_hex();
        let (p, _) = package("u9");
        let (commit, _) = g.add_member(p).unwrap();
        assert_ne!(commit.tree_hash, h1);
    }
}
