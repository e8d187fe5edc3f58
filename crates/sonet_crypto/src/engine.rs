//! Per-chat cipher state registry — the ratchet engine's public face.
//!
//! One mutex per chat. Every operation is CPU-bound and holds the chat
//! lock only for the derivation itself; nothing here suspends or does I/O.
//!
//! Direct chats hold one Double Ratchet endpoint per participant, seeded
//! from an X25519 identity exchange. Group chats hold one MLS state.
//! The ratchet header (and, for groups, the epoch framing) travels inside
//! the envelope's AAD, so it is authenticated by the AEAD tag without
//! widening the wire envelope.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

use sonet_proto::chat::GroupSizeStatus;
use sonet_proto::encryption::{EncryptionDescriptor, EncryptionLevel};
use sonet_proto::envelope::EncryptedEnvelope;

use crate::aead::AeadAlgorithm;
use crate::error::CryptoError;
use crate::kdf;
use crate::keys::{x25519_dh, x25519_keygen, IdentityKeyPair};
use crate::mls::{CipherSuite, Commit, GroupCiphertext, KeyPackage, MlsGroup, Welcome};
use crate::ratchet::{DoubleRatchet, RatchetHeader};
use crate::session::SessionKey;

/// Authenticated framing carried in the envelope AAD.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EnvelopeAad {
    chat_id: String,
    sender_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    header: Option<RatchetHeader>,
    #[serde(skip_serializing_if = "Option::is_none")]
    group: Option<GroupFraming>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GroupFraming {
    epoch: u64,
    sender_leaf: usize,
    seq: u64,
}

/// One participant's server-held endpoint in a direct chat.
struct DirectEndpoint {
    ratchet: DoubleRatchet,
    identity: IdentityKeyPair,
    session_key: SessionKey,
}

struct DirectState {
    endpoints: HashMap<String, DirectEndpoint>,
}

struct GroupState {
    mls: MlsGroup,
    identities: HashMap<String, IdentityKeyPair>,
    session_keys: HashMap<String, SessionKey>,
}

enum ChatCipherState {
    Direct(DirectState),
    Group(GroupState),
}

/// Registry of per-chat cipher state. Cheap to clone and share.
#[derive(Clone, Default)]
pub struct RatchetEngine {
    chats: Arc<RwLock<HashMap<String, Arc<Mutex<ChatCipherState>>>>>,
}

const DIRECT_ALG: AeadAlgorithm = AeadAlgorithm::ChaCha20Poly1305;

impl RatchetEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn chat_state(&self, chat_id: &str) -> Result<Arc<Mutex<ChatCipherState>>, CryptoError> {
        self.chats
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(chat_id)
            .cloned()
            .ok_or_else(|| CryptoError::UnknownChat(chat_id.to_string()))
    }

    pub fn has_chat(&self, chat_id: &str) -> bool {
        self.chats
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(chat_id)
    }

    /// Remove all cipher state for a chat, zeroizing on drop.
    pub fn evict_chat(&self, chat_id: &str) {
        self.chats
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(chat_id);
    }

    // ── Direct chats ─────────────────────────────────────────────────────

    /// Establish both endpoints of a direct chat. The shared root comes
    /// from an X25519 exchange between the two identities; the second
    /// participant publishes the initial ratchet key, the first performs
    /// the opening DH step.
    pub fn init_direct(&self, chat_id: &str, user_a: &str, user_b: &str) -> Result<(), CryptoError> {
        let (a_dh_secret, a_dh_pub) = x25519_keygen();
        let (b_dh_secret, b_dh_pub) = x25519_keygen();
        let shared = x25519_dh(&a_dh_secret, &b_dh_pub);
        debug_assert_eq!(shared, x25519_dh(&b_dh_secret, &a_dh_pub));

        let root_vec = kdf::derive_key(&shared, "direct-root", chat_id.as_bytes(), 32)?;
        let mut shared_root = [0u8; 32];
        shared_root.copy_from_slice(&root_vec);

        let (b_ratchet_secret, b_ratchet_pub) = x25519_keygen();
        let a_ratchet = DoubleRatchet::initiate(chat_id, user_a, shared_root, &b_ratchet_pub)?;
        let b_ratchet = DoubleRatchet::respond(chat_id, user_b, shared_root, b_ratchet_secret);

        let mut endpoints = HashMap::new();
        for (user, ratchet) in [(user_a, a_ratchet), (user_b, b_ratchet)] {
            let mut material = [0u8; 32];
            material.copy_from_slice(&kdf::generate_random(32));
            endpoints.insert(
                user.to_string(),
                DirectEndpoint {
                    ratchet,
                    identity: IdentityKeyPair::generate(),
                    session_key: SessionKey::mint(chat_id, user, DIRECT_ALG.wire_name(), material),
                },
            );
        }

        self.chats
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                chat_id.to_string(),
                Arc::new(Mutex::new(ChatCipherState::Direct(DirectState { endpoints }))),
            );
        tracing::debug!(chat_id, "direct ratchet pair established");
        Ok(())
    }

    // ── Group chats ──────────────────────────────────────────────────────

    /// Create a group with its first member. Per-member init keys are
    /// generated server-side; the Welcome path stays exercised end to end.
    pub fn init_group(
        &self,
        chat_id: &str,
        creator_id: &str,
        cipher_suite: CipherSuite,
    ) -> Result<(), CryptoError> {
        let (_, init_pub) = x25519_keygen();
        let identity = IdentityKeyPair::generate();
        let package = KeyPackage {
            user_id: creator_id.to_string(),
            init_pub: URL_SAFE_NO_PAD.encode(init_pub.as_bytes()),
            signing_pub: identity.public.to_b64(),
        };
        let mls = MlsGroup::create(chat_id, cipher_suite, package);

        let mut material = [0u8; 32];
        material.copy_from_slice(&kdf::generate_random(32));
        let mut state = GroupState {
            mls,
            identities: HashMap::new(),
            session_keys: HashMap::new(),
        };
        state.identities.insert(creator_id.to_string(), identity);
        state.session_keys.insert(
            creator_id.to_string(),
            SessionKey::mint(chat_id, creator_id, cipher_suite.aead().wire_name(), material),
        );

        self.chats
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(chat_id.to_string(), Arc::new(Mutex::new(ChatCipherState::Group(state))));
        tracing::debug!(chat_id, creator_id, "group state created");
        Ok(())
    }

    pub fn add_group_member(
        &self,
        chat_id: &str,
        user_id: &str,
    ) -> Result<(Commit, Welcome), CryptoError> {
        let state = self.chat_state(chat_id)?;
        let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *guard {
            ChatCipherState::Group(group) => {
                let (_, init_pub) = x25519_keygen();
                let identity = IdentityKeyPair::generate();
                let package = KeyPackage {
                    user_id: user_id.to_string(),
                    init_pub: URL_SAFE_NO_PAD.encode(init_pub.as_bytes()),
                    signing_pub: identity.public.to_b64(),
                };
                let (commit, welcome) = group.mls.add_member(package)?;

                let mut material = [0u8; 32];
                material.copy_from_slice(&kdf::generate_random(32));
                group.identities.insert(user_id.to_string(), identity);
                group.session_keys.insert(
                    user_id.to_string(),
                    SessionKey::mint(
                        chat_id,
                        user_id,
                        group.mls.cipher_suite.aead().wire_name(),
                        material,
                    ),
                );
                Ok((commit, welcome))
            }
            ChatCipherState::Direct(_) => Err(CryptoError::RatchetStep(
                "membership changes require a group chat".into(),
            )),
        }
    }

    pub fn remove_group_member(&self, chat_id: &str, user_id: &str) -> Result<Commit, CryptoError> {
        let state = self.chat_state(chat_id)?;
        let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *guard {
            ChatCipherState::Group(group) => {
                let leaf = group
                    .mls
                    .leaf_index_of(user_id)
                    .ok_or(CryptoError::UnknownMember)?;
                let commit = group.mls.remove_member(leaf)?;
                group.identities.remove(user_id);
                group.session_keys.remove(user_id);
                Ok(commit)
            }
            ChatCipherState::Direct(_) => Err(CryptoError::RatchetStep(
                "membership changes require a group chat".into(),
            )),
        }
    }

    pub fn update_group(&self, chat_id: &str) -> Result<Commit, CryptoError> {
        let state = self.chat_state(chat_id)?;
        let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *guard {
            ChatCipherState::Group(group) => group.mls.update(),
            ChatCipherState::Direct(_) => Err(CryptoError::RatchetStep(
                "key update requires a group chat".into(),
            )),
        }
    }

    pub fn group_size_status(&self, chat_id: &str) -> Result<GroupSizeStatus, CryptoError> {
        let state = self.chat_state(chat_id)?;
        let guard = state.lock().unwrap_or_else(|e| e.into_inner());
        match &*guard {
            ChatCipherState::Group(group) => Ok(group.mls.size_status()),
            ChatCipherState::Direct(_) => Ok(GroupSizeStatus::Optimal),
        }
    }

    // ── Encrypt / decrypt ────────────────────────────────────────────────

    /// Seal `plaintext` from `sender_id`, producing the wire envelope and
    /// the message's encryption descriptor.
    pub fn encrypt(
        &self,
        chat_id: &str,
        sender_id: &str,
        plaintext: &[u8],
    ) -> Result<(EncryptedEnvelope, EncryptionDescriptor), CryptoError> {
        let state = self.chat_state(chat_id)?;
        let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *guard {
            ChatCipherState::Direct(direct) => {
                Self::encrypt_direct(chat_id, sender_id, plaintext, direct)
            }
            ChatCipherState::Group(group) => {
                Self::encrypt_group(chat_id, sender_id, plaintext, group)
            }
        }
    }

    fn rotate_session_key(key: &mut SessionKey, chat_id: &str, user_id: &str, alg: &str) {
        let mut material = [0u8; 32];
        material.copy_from_slice(&kdf::generate_random(32));
        *key = SessionKey::mint(chat_id, user_id, alg, material);
    }

    /// Re-establish a direct pair: fresh identity DH, fresh ratchet
    /// keypairs, fresh session keys. Long-term identities stay. The engine
    /// owns both endpoints under the chat mutex, so the swap is atomic —
    /// this is how chain budgets, key expiry, and compromise marks are
    /// answered, since a lone endpoint cannot initiate a sound DH step.
    fn rekey_pair(chat_id: &str, direct: &mut DirectState) -> Result<(), CryptoError> {
        let mut users: Vec<String> = direct.endpoints.keys().cloned().collect();
        users.sort();
        let (user_a, user_b) = match (users.first(), users.get(1)) {
            (Some(a), Some(b)) => (a.clone(), b.clone()),
            _ => return Err(CryptoError::RatchetStep("direct pair incomplete".into())),
        };

        let (a_dh_secret, a_dh_pub) = x25519_keygen();
        let (b_dh_secret, b_dh_pub) = x25519_keygen();
        let shared = x25519_dh(&a_dh_secret, &b_dh_pub);
        debug_assert_eq!(shared, x25519_dh(&b_dh_secret, &a_dh_pub));
        let root_vec = kdf::derive_key(&shared, "direct-root", chat_id.as_bytes(), 32)?;
        let mut shared_root = [0u8; 32];
        shared_root.copy_from_slice(&root_vec);

        let (b_ratchet_secret, b_ratchet_pub) = x25519_keygen();
        let a_ratchet = DoubleRatchet::initiate(chat_id, &user_a, shared_root, &b_ratchet_pub)?;
        let b_ratchet = DoubleRatchet::respond(chat_id, &user_b, shared_root, b_ratchet_secret);

        for (user, ratchet) in [(user_a, a_ratchet), (user_b, b_ratchet)] {
            let endpoint = direct
                .endpoints
                .get_mut(&user)
                .ok_or_else(|| CryptoError::UnknownEndpoint(user.clone(), chat_id.into()))?;
            endpoint.ratchet = ratchet;
            Self::rotate_session_key(&mut endpoint.session_key, chat_id, &user, DIRECT_ALG.wire_name());
        }
        tracing::debug!(chat_id, "direct pair rekeyed");
        Ok(())
    }

    fn encrypt_direct(
        chat_id: &str,
        sender_id: &str,
        plaintext: &[u8],
        direct: &mut DirectState,
    ) -> Result<(EncryptedEnvelope, EncryptionDescriptor), CryptoError> {
        let needs_rekey = match direct.endpoints.get(sender_id) {
            Some(ep) => ep.ratchet.rekey_due() || ep.session_key.is_exhausted(),
            None => return Err(CryptoError::UnknownEndpoint(sender_id.into(), chat_id.into())),
        };
        if needs_rekey {
            Self::rekey_pair(chat_id, direct)?;
        }

        let recipient_fingerprint = direct
            .endpoints
            .iter()
            .find(|(user, _)| user.as_str() != sender_id)
            .map(|(_, ep)| ep.identity.fingerprint());

        let endpoint = direct
            .endpoints
            .get_mut(sender_id)
            .ok_or_else(|| CryptoError::UnknownEndpoint(sender_id.into(), chat_id.into()))?;
        endpoint.session_key.register_message()?;

        // The header is only known after the seal (a due rekey rotates the
        // ratchet key inside it), so the envelope AAD carries it outside the
        // AEAD input. Tampering with it changes the derived message key and
        // fails the tag check; chat binding is verified on decrypt.
        let (header, nonce, sealed) = endpoint.ratchet.seal(DIRECT_ALG, b"", plaintext)?;

        let aad = EnvelopeAad {
            chat_id: chat_id.to_string(),
            sender_id: sender_id.to_string(),
            header: Some(header),
            group: None,
        };
        let aad_json = serde_json::to_string(&aad)?;

        let signature = endpoint.identity.sign(&sealed.ciphertext);
        let envelope = EncryptedEnvelope::new(
            DIRECT_ALG.wire_name(),
            &endpoint.session_key.session_id,
            &nonce,
            &sealed.ciphertext,
            &sealed.tag,
            &aad_json,
        );
        let descriptor = EncryptionDescriptor {
            level: EncryptionLevel::EndToEnd,
            algorithm: DIRECT_ALG.wire_name().to_string(),
            key_id: endpoint.session_key.session_id.clone(),
            nonce: envelope.nonce.clone(),
            signature: URL_SAFE_NO_PAD.encode(&signature),
            session_key_fingerprint: endpoint.session_key.fingerprint(),
            sender_key_fingerprint: Some(endpoint.identity.fingerprint()),
            recipient_key_fingerprint: recipient_fingerprint,
            perfect_forward_secrecy: true,
        };
        Ok((envelope, descriptor))
    }

    fn encrypt_group(
        chat_id: &str,
        sender_id: &str,
        plaintext: &[u8],
        group: &mut GroupState,
    ) -> Result<(EncryptedEnvelope, EncryptionDescriptor), CryptoError> {
        let alg = group.mls.cipher_suite.aead();
        let session_key = group
            .session_keys
            .get_mut(sender_id)
            .ok_or_else(|| CryptoError::UnknownEndpoint(sender_id.into(), chat_id.into()))?;
        if session_key.is_exhausted() {
            Self::rotate_session_key(session_key, chat_id, sender_id, alg.wire_name());
            group.mls.update()?;
        }
        session_key.register_message()?;
        let key_id = session_key.session_id.clone();
        let session_fingerprint = session_key.fingerprint();

        let ct = group.mls.encrypt_message(sender_id, b"", plaintext)?;
        let aad = EnvelopeAad {
            chat_id: chat_id.to_string(),
            sender_id: sender_id.to_string(),
            header: None,
            group: Some(GroupFraming {
                epoch: ct.epoch,
                sender_leaf: ct.sender_leaf,
                seq: ct.seq,
            }),
        };
        let aad_json = serde_json::to_string(&aad)?;

        let identity = group
            .identities
            .get(sender_id)
            .ok_or_else(|| CryptoError::UnknownEndpoint(sender_id.into(), chat_id.into()))?;
        let signature = identity.sign(&ct.ciphertext);
        let nonce = kdf::message_nonce(ct.seq);

        let envelope = EncryptedEnvelope::new(
            alg.wire_name(),
            &key_id,
            &nonce,
            &ct.ciphertext,
            &ct.tag,
            &aad_json,
        );
        let descriptor = EncryptionDescriptor {
            level: EncryptionLevel::EndToEnd,
            algorithm: alg.wire_name().to_string(),
            key_id,
            nonce: envelope.nonce.clone(),
            signature: URL_SAFE_NO_PAD.encode(&signature),
            session_key_fingerprint: session_fingerprint,
            sender_key_fingerprint: Some(identity.fingerprint()),
            recipient_key_fingerprint: None,
            perfect_forward_secrecy: true,
        };
        Ok((envelope, descriptor))
    }

    /// Open an envelope for `recipient_id`. Direct chats advance the
    /// recipient's receiving chain; group chats resolve the epoch key.
    /// Failure is a neutral `AuthFail` and never mutates state.
    pub fn decrypt(
        &self,
        chat_id: &str,
        recipient_id: &str,
        envelope: &EncryptedEnvelope,
    ) -> Result<Vec<u8>, CryptoError> {
        let aad: EnvelopeAad = serde_json::from_str(&envelope.aad)?;
        if aad.chat_id != chat_id {
            return Err(CryptoError::AuthFail);
        }
        let ciphertext = envelope.ciphertext_bytes()?;
        let tag = envelope.tag_bytes()?;

        let state = self.chat_state(chat_id)?;
        let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *guard {
            ChatCipherState::Direct(direct) => {
                let header = aad.header.as_ref().ok_or(CryptoError::AuthFail)?;
                let endpoint = direct
                    .endpoints
                    .get_mut(recipient_id)
                    .ok_or_else(|| CryptoError::UnknownEndpoint(recipient_id.into(), chat_id.into()))?;
                endpoint
                    .ratchet
                    .open(DIRECT_ALG, header, b"", &ciphertext, &tag)
            }
            ChatCipherState::Group(group) => {
                if !group.mls.is_member(recipient_id) {
                    return Err(CryptoError::UnknownEndpoint(
                        recipient_id.into(),
                        chat_id.into(),
                    ));
                }
                let framing = aad.group.as_ref().ok_or(CryptoError::AuthFail)?;
                let mut tag_arr = [0u8; 16];
                if tag.len() != 16 {
                    return Err(CryptoError::AuthFail);
                }
                tag_arr.copy_from_slice(&tag);
                let ct = GroupCiphertext {
                    group_id: chat_id.to_string(),
                    epoch: framing.epoch,
                    sender_leaf: framing.sender_leaf,
                    seq: framing.seq,
                    ciphertext,
                    tag: tag_arr,
                };
                group.mls.decrypt_message(&ct, b"")
            }
        }
    }

    /// Zeroize current key material for a chat and force a fresh ratchet
    /// on the next send.
    pub fn mark_key_compromised(&self, chat_id: &str) -> Result<(), CryptoError> {
        let state = self.chat_state(chat_id)?;
        let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *guard {
            ChatCipherState::Direct(direct) => {
                for endpoint in direct.endpoints.values_mut() {
                    endpoint.ratchet.mark_compromised();
                }
                Ok(())
            }
            ChatCipherState::Group(group) => group.mls.update().map(|_| ()),
        }
    }

    // ── Introspection for the service and tests ──────────────────────────

    pub fn receiving_number(&self, chat_id: &str, user_id: &str) -> Result<u64, CryptoError> {
        let state = self.chat_state(chat_id)?;
        let guard = state.lock().unwrap_or_else(|e| e.into_inner());
        match &*guard {
            ChatCipherState::Direct(direct) => direct
                .endpoints
                .get(user_id)
                .map(|ep| ep.ratchet.recv_n)
                .ok_or_else(|| CryptoError::UnknownEndpoint(user_id.into(), chat_id.into())),
            ChatCipherState::Group(_) => Ok(0),
        }
    }

    pub fn skipped_key_count(&self, chat_id: &str, user_id: &str) -> Result<usize, CryptoError> {
        let state = self.chat_state(chat_id)?;
        let guard = state.lock().unwrap_or_else(|e| e.into_inner());
        match &*guard {
            ChatCipherState::Direct(direct) => direct
                .endpoints
                .get(user_id)
                .map(|ep| ep.ratchet.skipped_len())
                .ok_or_else(|| CryptoError::UnknownEndpoint(user_id.into(), chat_id.into())),
            ChatCipherState::Group(_) => Ok(0),
        }
    }
}
