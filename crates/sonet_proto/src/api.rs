//! RPC surface types.
//!
//! Every response carries a `Status { code, message }`. Code 0 is success;
//! the non-zero codes are fixed by the wire contract and never reused.

use serde::{Deserialize, Serialize};

use crate::chat::{Chat, ChatKind};
use crate::message::{Message, MessageType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub code: i32,
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Self { code: 0, message: "ok".into() }
    }
    pub fn missing_fields(detail: &str) -> Self {
        Self { code: 1, message: format!("missing fields: {detail}") }
    }
    pub fn not_participant(user_id: &str) -> Self {
        Self { code: 2, message: format!("{user_id} is not a participant") }
    }
    pub fn rate_limited() -> Self {
        Self { code: 3, message: "rate limited".into() }
    }
    pub fn too_large(limit: usize) -> Self {
        Self { code: 4, message: format!("content exceeds {limit} bytes") }
    }
    pub fn crypto_failure() -> Self {
        Self { code: 5, message: "encryption failure".into() }
    }
    pub fn chat_not_found(chat_id: &str) -> Self {
        Self { code: 6, message: format!("chat {chat_id} not found") }
    }
    pub fn group_full() -> Self {
        Self { code: 7, message: "group is at member capacity".into() }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

// ── SendMessage ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
}

// ── GetMessages ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetMessagesRequest {
    pub chat_id: String,
    pub requester_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetMessagesResponse {
    pub status: Status,
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Cursor for the next page; absent when the page is the last one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

// ── CreateChat ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChatRequest {
    #[serde(rename = "type")]
    pub kind: ChatKind,
    pub creator_id: String,
    pub participant_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChatResponse {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat: Option<Chat>,
}

// ── GetChats ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetChatsRequest {
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetChatsResponse {
    pub status: Status,
    #[serde(default)]
    pub chats: Vec<Chat>,
}

// ── SetTyping ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetTypingRequest {
    pub chat_id: String,
    pub user_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetTypingResponse {
    pub status: Status,
}

// ── Capabilities ─────────────────────────────────────────────────────────────

/// Server capability advertisement, including the negotiated practical
/// group member limit (never above the 500 hard cap).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitiesResponse {
    pub max_group_members: usize,
    pub practical_group_members: usize,
    pub max_content_bytes: usize,
    pub cipher_suites: Vec<String>,
}
