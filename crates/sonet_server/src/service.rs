//! The messaging service: validation, orchestration, wire status mapping.
//!
//! Every operation validates in a fixed order, then drives the ratchet
//! engine, the store, the indexer, and the hub. Failures map onto the wire
//! status codes; nothing below this layer knows about them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use sonet_crypto::mls::CipherSuite;
use sonet_hub::hub::InboundHandler;
use sonet_hub::rate_limit::SlidingWindow;
use sonet_index::batch::IndexOp;
use sonet_index::IndexDoc;
use sonet_proto::api::*;
use sonet_proto::events::{EventKind, WireEvent};
use sonet_proto::message::{Message, MessageStatus, MessageType};
use sonet_proto::{Chat, ChatKind, GroupSizeStatus, MAX_GROUP_MEMBERS};
use sonet_store::MessageMutation;

use crate::core::MessagingCore;

#[derive(Clone)]
pub struct MessagingService {
    core: Arc<MessagingCore>,
    /// Per-user sliding windows for the RPC send path. Stream-path rate
    /// limiting (and banning) lives on the connection in the hub.
    send_windows: Arc<Mutex<HashMap<String, SlidingWindow>>>,
}

impl MessagingService {
    pub fn new(core: Arc<MessagingCore>) -> Self {
        Self { core, send_windows: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub fn core(&self) -> &Arc<MessagingCore> {
        &self.core
    }

    async fn check_send_rate(&self, user_id: &str) -> bool {
        let limit = self.core.config.limits.message_rate_limit;
        let mut windows = self.send_windows.lock().await;
        windows
            .entry(user_id.to_string())
            .or_insert_with(|| SlidingWindow::new(limit, std::time::Duration::from_secs(60)))
            .check()
    }

    // ── SendMessage ──────────────────────────────────────────────────────

    pub async fn send_message(&self, req: SendMessageRequest) -> SendMessageResponse {
        if req.chat_id.is_empty() || req.sender_id.is_empty() {
            return SendMessageResponse { status: Status::missing_fields("chat_id, sender_id"), message: None };
        }
        if req.content.is_empty() {
            return SendMessageResponse { status: Status::missing_fields("content"), message: None };
        }
        let Some(chat) = self.core.chats.get(&req.chat_id).await else {
            return SendMessageResponse { status: Status::chat_not_found(&req.chat_id), message: None };
        };
        if !chat.is_participant(&req.sender_id) {
            return SendMessageResponse { status: Status::not_participant(&req.sender_id), message: None };
        }
        if !self.check_send_rate(&req.sender_id).await {
            return SendMessageResponse { status: Status::rate_limited(), message: None };
        }
        let max = self.core.config.limits.max_content_bytes;
        if req.content.len() > max {
            return SendMessageResponse { status: Status::too_large(max), message: None };
        }

        // Ciphertext before storage; a crypto failure stores nothing.
        let (envelope, descriptor) =
            match self.core.engine.encrypt(&req.chat_id, &req.sender_id, req.content.as_bytes()) {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(chat_id = %req.chat_id, error = %e, "encryption failed");
                    return SendMessageResponse { status: Status::crypto_failure(), message: None };
                }
            };
        if descriptor.validate().is_err() {
            return SendMessageResponse { status: Status::crypto_failure(), message: None };
        }

        let mut message = Message::new(&req.chat_id, &req.sender_id, req.content.clone(), req.message_type);
        message.status = MessageStatus::Sent;
        message.reply_to_message_id = req.reply_to_message_id.clone();
        message.thread_id = req.thread_id.clone();
        message.encryption = Some(descriptor);

        let stored = match self.core.store.append(&req.chat_id, message).await {
            Ok(stored) => stored,
            Err(e) => {
                use sonet_proto::error::{ErrorKind, HasErrorKind};
                let status = match e.kind() {
                    ErrorKind::NotFound => Status::chat_not_found(&req.chat_id),
                    _ => Status::missing_fields(&e.to_string()),
                };
                return SendMessageResponse { status, message: None };
            }
        };

        // Advance the recipient side of a direct ratchet so out-of-band
        // state (receive counters, skipped keys) tracks delivery.
        if chat.kind == ChatKind::Direct {
            for participant in chat.participant_ids.iter().filter(|p| **p != req.sender_id) {
                if let Err(e) = self.core.engine.decrypt(&req.chat_id, participant, &envelope) {
                    tracing::warn!(chat_id = %req.chat_id, recipient = %participant, error = %e,
                        "recipient decrypt failed");
                }
            }
        }

        let _ = self
            .core
            .index_writer
            .submit(IndexOp::Index(index_doc_for(&stored)))
            .await;

        let event = WireEvent::for_chat(
            EventKind::NewMessage,
            &req.chat_id,
            serde_json::json!({ "message": &stored, "envelope": &envelope }),
        )
        .from_user(&req.sender_id);
        if let Err(e) = self.core.hub.publish(event).await {
            tracing::warn!(chat_id = %req.chat_id, error = %e, "fan-out failed");
        }

        SendMessageResponse { status: Status::ok(), message: Some(stored) }
    }

    // ── GetMessages ──────────────────────────────────────────────────────

    pub async fn get_messages(&self, req: GetMessagesRequest) -> GetMessagesResponse {
        let Some(chat) = self.core.chats.get(&req.chat_id).await else {
            return GetMessagesResponse {
                status: Status::chat_not_found(&req.chat_id),
                messages: Vec::new(),
                next_cursor: None,
            };
        };
        if !chat.is_participant(&req.requester_id) {
            return GetMessagesResponse {
                status: Status::not_participant(&req.requester_id),
                messages: Vec::new(),
                next_cursor: None,
            };
        }
        match self.core.store.get(&req.chat_id, req.cursor.as_deref(), req.limit).await {
            Ok(page) => GetMessagesResponse {
                status: Status::ok(),
                messages: page.messages,
                next_cursor: page.next_cursor,
            },
            Err(e) => GetMessagesResponse {
                status: Status::missing_fields(&e.to_string()),
                messages: Vec::new(),
                next_cursor: None,
            },
        }
    }

    // ── CreateChat ───────────────────────────────────────────────────────

    /// Idempotent on (sorted participants, kind): the same set always
    /// resolves to the same chat.
    pub async fn create_chat(&self, req: CreateChatRequest) -> CreateChatResponse {
        if req.participant_ids.is_empty() || req.creator_id.is_empty() {
            return CreateChatResponse { status: Status::missing_fields("participant_ids, creator_id"), chat: None };
        }
        let mut participants = req.participant_ids.clone();
        if !participants.contains(&req.creator_id) {
            participants.push(req.creator_id.clone());
        }
        if req.kind == ChatKind::Group && participants.len() > MAX_GROUP_MEMBERS {
            return CreateChatResponse { status: Status::group_full(), chat: None };
        }

        let chat = match Chat::new(req.kind, participants, req.name.clone()) {
            Ok(chat) => chat,
            Err(e) => return CreateChatResponse { status: Status::missing_fields(&e.to_string()), chat: None },
        };

        let dedup_key = Chat::dedup_key(chat.kind, &chat.participant_ids);
        if let Some(existing) = self.core.chats.lookup_dedup(&dedup_key).await {
            return CreateChatResponse { status: Status::ok(), chat: Some(existing) };
        }

        // Ratchet state first; a chat without cipher state must not exist.
        let init = match chat.kind {
            ChatKind::Direct => {
                let mut ids = chat.participant_ids.iter();
                let (a, b) = (ids.next().cloned().unwrap_or_default(), ids.next().cloned().unwrap_or_default());
                self.core.engine.init_direct(&chat.chat_id, &a, &b)
            }
            ChatKind::Group => {
                self.core
                    .engine
                    .init_group(&chat.chat_id, &req.creator_id, CipherSuite::default())
                    .and_then(|()| {
                        for member in chat.participant_ids.iter().filter(|p| **p != req.creator_id) {
                            self.core.engine.add_group_member(&chat.chat_id, member)?;
                        }
                        Ok(())
                    })
            }
        };
        if let Err(e) = init {
            tracing::error!(chat_id = %chat.chat_id, error = %e, "ratchet init failed");
            return CreateChatResponse { status: Status::crypto_failure(), chat: None };
        }

        self.core.store.register_chat(&chat.chat_id).await;
        self.core.chats.insert(chat.clone(), dedup_key).await;
        if let Some(db) = &self.core.db {
            if let Err(e) = db.upsert_chat(&chat).await {
                tracing::warn!(chat_id = %chat.chat_id, error = %e, "chat persistence failed");
            }
        }

        let event = WireEvent::for_chat(
            EventKind::ChatCreated,
            &chat.chat_id,
            serde_json::json!({ "chat": &chat }),
        )
        .from_user(&req.creator_id);
        let _ = self.core.hub.publish(event).await;

        CreateChatResponse { status: Status::ok(), chat: Some(chat) }
    }

    // ── GetChats ─────────────────────────────────────────────────────────

    pub async fn get_chats(&self, req: GetChatsRequest) -> GetChatsResponse {
        if req.user_id.is_empty() {
            return GetChatsResponse { status: Status::missing_fields("user_id"), chats: Vec::new() };
        }
        GetChatsResponse { status: Status::ok(), chats: self.core.chats.for_user(&req.user_id).await }
    }

    // ── SetTyping ────────────────────────────────────────────────────────

    pub async fn set_typing(&self, req: SetTypingRequest) -> SetTypingResponse {
        let Some(chat) = self.core.chats.get(&req.chat_id).await else {
            return SetTypingResponse { status: Status::chat_not_found(&req.chat_id) };
        };
        if !chat.is_participant(&req.user_id) {
            return SetTypingResponse { status: Status::not_participant(&req.user_id) };
        }
        match self.core.hub.set_typing(&req.chat_id, &req.user_id, req.is_typing).await {
            Ok(()) => SetTypingResponse { status: Status::ok() },
            Err(e) => SetTypingResponse { status: Status::missing_fields(&e.to_string()) },
        }
    }

    // ── Capabilities ─────────────────────────────────────────────────────

    pub fn capabilities(&self) -> CapabilitiesResponse {
        CapabilitiesResponse {
            max_group_members: MAX_GROUP_MEMBERS,
            practical_group_members: self.core.config.limits.practical_members(),
            max_content_bytes: self.core.config.limits.max_content_bytes,
            cipher_suites: vec![
                CipherSuite::X25519ChaCha20Ed25519.wire_name().to_string(),
                CipherSuite::X25519Aes256GcmEd25519.wire_name().to_string(),
            ],
        }
    }

    // ── Edits, deletes, reactions ────────────────────────────────────────

    pub async fn edit_message(
        &self,
        chat_id: &str,
        message_id: &str,
        editor_id: &str,
        new_content: String,
    ) -> Status {
        let Some(chat) = self.core.chats.get(chat_id).await else {
            return Status::chat_not_found(chat_id);
        };
        if !chat.is_participant(editor_id) {
            return Status::not_participant(editor_id);
        }
        match self.core.store.get_message(chat_id, message_id).await {
            Ok(message) if message.sender_id != editor_id => {
                return Status::not_participant(editor_id);
            }
            Err(e) => return Status::missing_fields(&e.to_string()),
            Ok(_) => {}
        }
        match self
            .core
            .store
            .update(chat_id, message_id, MessageMutation::Edit { new_content })
            .await
        {
            Ok(updated) => {
                let _ = self
                    .core
                    .index_writer
                    .submit(IndexOp::Update(index_doc_for(&updated)))
                    .await;
                let event = WireEvent::for_chat(
                    EventKind::MessageEdited,
                    chat_id,
                    serde_json::json!({ "message": updated }),
                )
                .from_user(editor_id);
                let _ = self.core.hub.publish(event).await;
                Status::ok()
            }
            Err(e) => Status::missing_fields(&e.to_string()),
        }
    }

    pub async fn delete_message(&self, chat_id: &str, message_id: &str, requester_id: &str) -> Status {
        let Some(chat) = self.core.chats.get(chat_id).await else {
            return Status::chat_not_found(chat_id);
        };
        if !chat.is_participant(requester_id) {
            return Status::not_participant(requester_id);
        }
        match self.core.store.delete(chat_id, message_id, requester_id).await {
            Ok(_) => {
                // Straight to the index: a deleted message must be gone
                // before the next query.
                let _ = self
                    .core
                    .index_writer
                    .submit(IndexOp::Remove(message_id.to_string()))
                    .await;
                let event = WireEvent::for_chat(
                    EventKind::MessageDeleted,
                    chat_id,
                    serde_json::json!({ "message_id": message_id }),
                )
                .from_user(requester_id);
                let _ = self.core.hub.publish(event).await;
                Status::ok()
            }
            Err(e) => Status::missing_fields(&e.to_string()),
        }
    }

    pub async fn add_reaction(&self, chat_id: &str, message_id: &str, user_id: &str, emoji: &str) -> Status {
        let Some(chat) = self.core.chats.get(chat_id).await else {
            return Status::chat_not_found(chat_id);
        };
        if !chat.is_participant(user_id) {
            return Status::not_participant(user_id);
        }
        let mutation = MessageMutation::AddReaction { user_id: user_id.to_string(), emoji: emoji.to_string() };
        match self.core.store.update(chat_id, message_id, mutation).await {
            Ok(updated) => {
                let _ = self
                    .core
                    .index_writer
                    .submit(IndexOp::Update(index_doc_for(&updated)))
                    .await;
                Status::ok()
            }
            Err(e) => Status::missing_fields(&e.to_string()),
        }
    }

    // ── Membership ───────────────────────────────────────────────────────

    /// Add a participant; group membership changes advance the MLS epoch
    /// and emit the Welcome to the newcomer transparently.
    pub async fn add_participant(&self, chat_id: &str, user_id: &str) -> Status {
        let Some(mut chat) = self.core.chats.get(chat_id).await else {
            return Status::chat_not_found(chat_id);
        };
        if chat.kind != ChatKind::Group {
            return Status::missing_fields("membership changes require a group chat");
        }
        if chat.participant_ids.contains(user_id) {
            return Status::ok();
        }
        if chat.participant_ids.len() >= MAX_GROUP_MEMBERS {
            return Status::group_full();
        }
        match self.core.engine.add_group_member(chat_id, user_id) {
            Ok((commit, _welcome)) => {
                chat.participant_ids.insert(user_id.to_string());
                chat.updated_at = chrono::Utc::now();
                self.core.chats.update(chat).await;
                let event = WireEvent::for_chat(
                    EventKind::ParticipantAdded,
                    chat_id,
                    serde_json::json!({ "user_id": user_id, "epoch": commit.epoch }),
                );
                let _ = self.core.hub.publish(event).await;
                Status::ok()
            }
            Err(sonet_crypto::CryptoError::GroupFull) => Status::group_full(),
            Err(e) => Status::missing_fields(&e.to_string()),
        }
    }

    pub async fn remove_participant(&self, chat_id: &str, user_id: &str) -> Status {
        let Some(mut chat) = self.core.chats.get(chat_id).await else {
            return Status::chat_not_found(chat_id);
        };
        if chat.kind != ChatKind::Group {
            return Status::missing_fields("membership changes require a group chat");
        }
        if !chat.participant_ids.contains(user_id) {
            return Status::ok();
        }
        match self.core.engine.remove_group_member(chat_id, user_id) {
            Ok(commit) => {
                chat.participant_ids.remove(user_id);
                chat.updated_at = chrono::Utc::now();
                self.core.chats.update(chat).await;
                let event = WireEvent::for_chat(
                    EventKind::ParticipantRemoved,
                    chat_id,
                    serde_json::json!({ "user_id": user_id, "epoch": commit.epoch }),
                );
                let _ = self.core.hub.publish(event).await;
                Status::ok()
            }
            Err(e) => Status::missing_fields(&e.to_string()),
        }
    }

    pub async fn group_size_status(&self, chat_id: &str) -> Option<GroupSizeStatus> {
        self.core.engine.group_size_status(chat_id).ok()
    }
}

/// Stream frames with domain semantics: message sends and read receipts.
#[async_trait]
impl InboundHandler for MessagingService {
    /// A `NEW_MESSAGE` frame goes through the same validation pipeline as
    /// the unary RPC; the stream reports the resulting wire status.
    async fn on_send_message(
        &self,
        user_id: &str,
        chat_id: &str,
        content: &str,
        message_type: MessageType,
        reply_to_message_id: Option<String>,
        thread_id: Option<String>,
    ) -> Status {
        self.send_message(SendMessageRequest {
            chat_id: chat_id.to_string(),
            sender_id: user_id.to_string(),
            content: content.to_string(),
            message_type,
            reply_to_message_id,
            thread_id,
        })
        .await
        .status
    }

    async fn on_read_receipt(&self, user_id: &str, chat_id: &str, message_id: &str, device_id: &str) {
        let Some(chat) = self.core.chats.get(chat_id).await else {
            return;
        };
        if !chat.is_participant(user_id) {
            return;
        }
        let mutation = MessageMutation::MarkRead {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
        };
        match self.core.store.update(chat_id, message_id, mutation).await {
            Ok(_) => {
                let event = WireEvent::for_chat(
                    EventKind::MessageRead,
                    chat_id,
                    serde_json::json!({ "message_id": message_id, "user_id": user_id }),
                )
                .from_user(user_id);
                let _ = self.core.hub.publish(event).await;
            }
            Err(e) => {
                tracing::debug!(chat_id, message_id, error = %e, "read receipt ignored");
            }
        }
    }
}

fn index_doc_for(message: &Message) -> IndexDoc {
    IndexDoc {
        message_id: message.message_id.clone(),
        chat_id: message.chat_id.clone(),
        user_id: message.sender_id.clone(),
        content: message.content.clone(),
        message_type: message.message_type,
        thread_id: message.thread_id.clone(),
        timestamp: message.created_at,
        engagement_score: (message.read_receipts.len() as f64 / 10.0).min(1.0),
        is_important: matches!(
            message.priority,
            sonet_proto::message::MessagePriority::Urgent | sonet_proto::message::MessagePriority::Critical
        ),
        reaction_count: message.reactions.len(),
        has_attachments: !message.attachments.is_empty(),
        starred: false,
        pinned: false,
    }
}
