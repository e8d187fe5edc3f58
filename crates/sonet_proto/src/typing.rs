//! Transient typing indicators.
//!
//! Indicators live only in the hub's per-chat typing state and expire on
//! their own; nothing here is persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypingActivity {
    Typing,
    RecordingAudio,
    RecordingVideo,
    UploadingFile,
    Thinking,
    Editing,
}

impl Default for TypingActivity {
    fn default() -> Self {
        TypingActivity::Typing
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingIndicator {
    pub typing_id: String,
    pub user_id: String,
    pub chat_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,
    #[serde(default)]
    pub activity: TypingActivity,
    #[serde(default)]
    pub context: String,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub device_id: String,
}

impl TypingIndicator {
    pub fn new(user_id: &str, chat_id: &str, ttl: chrono::Duration) -> Self {
        let now = Utc::now();
        Self {
            typing_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            chat_id: chat_id.to_string(),
            thread_id: None,
            reply_to_message_id: None,
            activity: TypingActivity::default(),
            context: String::new(),
            started_at: now,
            last_update: now,
            expires_at: now + ttl,
            device_id: String::new(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Refresh the expiry window on repeated typing activity.
    pub fn touch(&mut self, ttl: chrono::Duration) {
        let now = Utc::now();
        self.last_update = now;
        self.expires_at = now + ttl;
    }
}

/// Aggregated per-chat typing state as pushed to subscribers, deduplicated
/// by (user_id, chat_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTypingState {
    pub chat_id: String,
    pub typing_user_ids: Vec<String>,
    pub updated_at: DateTime<Utc>,
}
