//! The message envelope and its lifecycle.
//!
//! Status forms a monotonic DAG:
//!   pending → sent → delivered → read
//!   pending → failed
//!   any     → deleted
//! Transitions outside the DAG are rejected by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::encryption::EncryptionDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Image,
    Video,
    Audio,
    File,
    Location,
    VoiceNote,
    Sticker,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
    Deleted,
}

impl MessageStatus {
    /// Whether `self → next` is a legal DAG edge.
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        match (self, next) {
            (_, Deleted) => true,
            (Pending, Sent) | (Sent, Delivered) | (Delivered, Read) => true,
            (Pending, Failed) => true,
            // Skipping forward along the happy path is legal: a read receipt
            // may arrive before the delivery ack.
            (Pending, Delivered) | (Pending, Read) | (Sent, Read) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Urgent,
    Critical,
}

impl Default for MessagePriority {
    fn default() -> Self {
        MessagePriority::Normal
    }
}

/// One reaction from one user. A user may react with several distinct emoji.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub user_id: String,
    pub emoji: String,
    pub reacted_at: DateTime<Utc>,
}

/// At most one receipt per (user_id, device_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub user_id: String,
    pub device_id: String,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub attachment_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
    /// BLAKE3 content hash, hex. Dedup key and integrity check.
    pub content_hash: String,
    pub storage_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardInfo {
    pub original_chat_id: String,
    pub original_message_id: String,
    pub original_sender_id: String,
    pub forwarded_at: DateTime<Utc>,
}

/// One entry of edit history: hash of the content that was replaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditRevision {
    pub edited_at: DateTime<Utc>,
    /// BLAKE3 of the previous content, hex.
    pub content_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub chat_id: String,
    pub sender_id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub status: MessageStatus,
    #[serde(default)]
    pub priority: MessagePriority,
    /// Plaintext for unencrypted levels; empty once soft-deleted. Encrypted
    /// messages carry ciphertext in the envelope, not here.
    #[serde(default)]
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_position: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reactions: Vec<Reaction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_info: Option<ForwardInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub read_receipts: Vec<ReadReceipt>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edit_history: Vec<EditRevision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_edited_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionDescriptor>,
}

impl Message {
    /// A fresh pending message. Ids and timestamps are stamped by the store
    /// on append; this constructor fills the fields validation needs.
    pub fn new(chat_id: &str, sender_id: &str, content: String, message_type: MessageType) -> Self {
        let now = Utc::now();
        Self {
            message_id: String::new(),
            chat_id: chat_id.to_string(),
            sender_id: sender_id.to_string(),
            message_type,
            status: MessageStatus::Pending,
            priority: MessagePriority::default(),
            content,
            created_at: now,
            updated_at: now,
            expires_at: None,
            scheduled_at: None,
            reply_to_message_id: None,
            thread_id: None,
            thread_position: None,
            attachments: Vec::new(),
            reactions: Vec::new(),
            forward_info: None,
            read_receipts: Vec::new(),
            edit_history: Vec::new(),
            last_edited_at: None,
            encryption: None,
        }
    }

    /// Record a read receipt, keeping at most one per (user, device).
    pub fn upsert_read_receipt(&mut self, user_id: &str, device_id: &str, at: DateTime<Utc>) {
        if let Some(existing) = self
            .read_receipts
            .iter_mut()
            .find(|r| r.user_id == user_id && r.device_id == device_id)
        {
            existing.read_at = at;
            return;
        }
        self.read_receipts.push(ReadReceipt {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            read_at: at,
        });
    }

    pub fn content_hash(content: &str) -> String {
        hex::encode(blake3::hash(content.as_bytes()).as_bytes())
    }
}
