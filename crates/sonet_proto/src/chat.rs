//! Conversation identity.
//!
//! A chat is either a direct pair (exactly two participants) or a group
//! (2..=500). Membership changes are explicit operations upstream; they
//! never happen as a side effect of message flow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::ErrorKind;

/// Hard cap on group membership. Adds beyond this fail.
pub const MAX_GROUP_MEMBERS: usize = 500;
/// Soft threshold at which group size is flagged as a warning.
pub const GROUP_WARN_THRESHOLD: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub chat_id: String,
    pub kind: ChatKind,
    /// Sorted, deduplicated. Direct chats hold exactly two entries.
    pub participant_ids: BTreeSet<String>,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("direct chat requires exactly two participants, got {0}")]
    BadDirectParticipants(usize),
    #[error("group chat requires 2..={MAX_GROUP_MEMBERS} participants, got {0}")]
    BadGroupParticipants(usize),
    #[error("user {0} is not a participant of chat {1}")]
    NotParticipant(String, String),
}

impl crate::error::HasErrorKind for ChatError {
    fn kind(&self) -> ErrorKind {
        match self {
            ChatError::BadDirectParticipants(_) => ErrorKind::InvalidArgument,
            ChatError::BadGroupParticipants(n) if *n > MAX_GROUP_MEMBERS => {
                ErrorKind::ResourceExhausted
            }
            ChatError::BadGroupParticipants(_) => ErrorKind::InvalidArgument,
            ChatError::NotParticipant(..) => ErrorKind::PermissionDenied,
        }
    }
}

impl Chat {
    /// Validate the participant set against the chat kind and build the chat.
    pub fn new(
        kind: ChatKind,
        participants: impl IntoIterator<Item = String>,
        name: Option<String>,
    ) -> Result<Self, ChatError> {
        let participant_ids: BTreeSet<String> =
            participants.into_iter().filter(|p| !p.is_empty()).collect();
        match kind {
            ChatKind::Direct if participant_ids.len() != 2 => {
                return Err(ChatError::BadDirectParticipants(participant_ids.len()));
            }
            ChatKind::Group
                if participant_ids.len() < 2 || participant_ids.len() > MAX_GROUP_MEMBERS =>
            {
                return Err(ChatError::BadGroupParticipants(participant_ids.len()));
            }
            _ => {}
        }
        let now = Utc::now();
        Ok(Self {
            chat_id: uuid::Uuid::new_v4().to_string(),
            kind,
            participant_ids,
            name,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.participant_ids.contains(user_id)
    }

    /// Deduplication key for idempotent creation: same sorted participant
    /// set + kind always produces the same key.
    pub fn dedup_key(kind: ChatKind, participants: &BTreeSet<String>) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(match kind {
            ChatKind::Direct => b"direct\x00",
            ChatKind::Group => b"group\x00",
        });
        for p in participants {
            hasher.update(p.as_bytes());
            hasher.update(b"\x00");
        }
        hex::encode(&hasher.finalize().as_bytes()[..16])
    }

    pub fn size_status(&self) -> GroupSizeStatus {
        GroupSizeStatus::for_count(self.participant_ids.len())
    }
}

/// Health bands for group membership counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupSizeStatus {
    Optimal,
    Good,
    Warning,
    AtLimit,
}

impl GroupSizeStatus {
    pub fn for_count(n: usize) -> Self {
        match n {
            0..=250 => GroupSizeStatus::Optimal,
            251..=400 => GroupSizeStatus::Good,
            n if n >= MAX_GROUP_MEMBERS => GroupSizeStatus::AtLimit,
            _ => GroupSizeStatus::Warning,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_requires_two() {
        let err = Chat::new(
            ChatKind::Direct,
            ["alice".to_string(), "bob".into(), "carol".into()],
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ChatError::BadDirectParticipants(3)));
    }

    #[test]
    fn group_cap_enforced() {
        let members: Vec<String> = (0..501).map(|i| format!("u{i}")).collect();
        let err = Chat::new(ChatKind::Group, members, None).unwrap_err();
        assert!(matches!(err, ChatError::BadGroupParticipants(501)));
    }

    #[test]
    fn duplicate_participants_collapse() {
        let chat = Chat::new(
            ChatKind::Direct,
            ["alice".to_string(), "bob".into(), "alice".into()],
            None,
        )
        .unwrap();
        assert_eq!(chat.participant_ids.len(), 2);
    }

    #[test]
    fn size_status_bands() {
        assert_eq!(GroupSizeStatus::for_count(10), GroupSizeStatus::Optimal);
        assert_eq!(GroupSizeStatus::for_count(250), GroupSizeStatus::Optimal);
        assert_eq!(GroupSizeStatus::for_count(251), GroupSizeStatus::Good);
        assert_eq!(GroupSizeStatus::for_count(400), GroupSizeStatus::Good);
        assert_eq!(GroupSizeStatus::for_count(401), GroupSizeStatus::Warning);
        assert_eq!(GroupSizeStatus::for_count(500), GroupSizeStatus::AtLimit);
    }

    #[test]
    fn dedup_key_ignores_order() {
        let a: BTreeSet<String> = ["alice".to_string(), "bob".into()].into();
        let b: BTreeSet<String> = ["bob".to_string(), "alice".into()].into();
        assert_eq!(
            Chat::dedup_key(ChatKind::Direct, &a),
            Chat::dedup_key(ChatKind::Direct, &b)
        );
        assert_ne!(
            Chat::dedup_key(ChatKind::Direct, &a),
            Chat::dedup_key(ChatKind::Group, &a)
        );
    }
}
