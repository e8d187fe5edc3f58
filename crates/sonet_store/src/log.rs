//! The per-chat append-only log.
//!
//! Retrieval order within a chat is strictly `(created_at, message_id)`;
//! ties on the clock are broken by the id. Pagination cursors are message
//! ids; between calls with the same cursor the returned subset is a prefix
//! of one consistent ordering because reads iterate a snapshot taken under
//! the chat lock.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};

use sonet_proto::message::{EditRevision, Message, MessageStatus};

use crate::db::StoreDb;
use crate::error::StoreError;

const DEFAULT_PAGE_LIMIT: usize = 50;
const MAX_PAGE_LIMIT: usize = 500;

#[derive(Debug, Clone)]
pub struct Page {
    pub messages: Vec<Message>,
    /// Cursor for the next page; `None` when this page exhausted the log.
    pub next_cursor: Option<String>,
}

/// Mutations accepted by `update`.
#[derive(Debug, Clone)]
pub enum MessageMutation {
    Status(MessageStatus),
    Edit { new_content: String },
    AddReaction { user_id: String, emoji: String },
    RemoveReaction { user_id: String, emoji: String },
    MarkRead { user_id: String, device_id: String },
}

#[derive(Default)]
struct ChatLog {
    /// Append order == retrieval order; appends keep `created_at` monotone.
    messages: Vec<Message>,
    by_id: HashMap<String, usize>,
}

#[derive(Clone, Default)]
pub struct MessageStore {
    chats: Arc<RwLock<HashMap<String, Arc<Mutex<ChatLog>>>>>,
    db: Option<StoreDb>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write-through persistence. The in-memory log stays authoritative.
    pub fn with_persistence(db: StoreDb) -> Self {
        Self { chats: Arc::default(), db: Some(db) }
    }

    /// Register a chat so appends can find its log.
    pub async fn register_chat(&self, chat_id: &str) {
        self.chats
            .write()
            .await
            .entry(chat_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ChatLog::default())));
    }

    async fn chat_log(&self, chat_id: &str) -> Result<Arc<Mutex<ChatLog>>, StoreError> {
        self.chats
            .read()
            .await
            .get(chat_id)
            .cloned()
            .ok_or_else(|| StoreError::ChatNotFound(chat_id.to_string()))
    }

    /// Append a message. Assigns a fresh id if the message has none and
    /// stamps both timestamps now, clamped so `created_at` never runs
    /// backwards within the chat.
    pub async fn append(&self, chat_id: &str, mut message: Message) -> Result<Message, StoreError> {
        let log = self.chat_log(chat_id).await?;
        let stored = {
            let mut log = log.lock().await;

            if let Some(reply_to) = &message.reply_to_message_id {
                if !log.by_id.contains_key(reply_to) {
                    return Err(StoreError::ReplyOutsideChat(reply_to.clone()));
                }
            }

            if message.message_id.is_empty() {
                message.message_id = uuid::Uuid::new_v4().to_string();
            }
            let now = Utc::now();
            let created = match log.messages.last() {
                Some(prev) if prev.created_at > now => prev.created_at,
                _ => now,
            };
            message.chat_id = chat_id.to_string();
            message.created_at = created;
            message.updated_at = created;

            let index = log.messages.len();
            log.by_id.insert(message.message_id.clone(), index);
            log.messages.push(message.clone());
            message
        };

        if let Some(db) = &self.db {
            db.upsert_message(&stored).await?;
        }
        Ok(stored)
    }

    /// Chronological page, newest-first. `cursor` is the id of the last
    /// message the caller has seen; the page continues strictly past it.
    pub async fn get(
        &self,
        chat_id: &str,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Page, StoreError> {
        let log = self.chat_log(chat_id).await?;
        let log = log.lock().await;
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);

        // Newest-first walk over the append-ordered snapshot.
        let start_from = match cursor {
            None => log.messages.len(),
            Some(c) => *log
                .by_id
                .get(c)
                .ok_or_else(|| StoreError::InvalidCursor(c.to_string()))?,
        };

        let messages: Vec<Message> = log.messages[..start_from]
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect();
        // More remains only when the walk stopped short of the oldest entry.
        let next_cursor = if start_from > limit {
            messages.last().map(|m| m.message_id.clone())
        } else {
            None
        };
        Ok(Page { messages, next_cursor })
    }

    /// Oldest-first view of the whole chat; invariant checks and tests.
    pub async fn all_oldest_first(&self, chat_id: &str) -> Result<Vec<Message>, StoreError> {
        let log = self.chat_log(chat_id).await?;
        let log = log.lock().await;
        Ok(log.messages.clone())
    }

    pub async fn get_message(&self, chat_id: &str, message_id: &str) -> Result<Message, StoreError> {
        let log = self.chat_log(chat_id).await?;
        let log = log.lock().await;
        let idx = *log
            .by_id
            .get(message_id)
            .ok_or_else(|| StoreError::MessageNotFound(message_id.to_string()))?;
        Ok(log.messages[idx].clone())
    }

    /// Apply a mutation. Status moves are checked against the DAG; edits
    /// record the replaced content's hash in the history.
    pub async fn update(
        &self,
        chat_id: &str,
        message_id: &str,
        mutation: MessageMutation,
    ) -> Result<Message, StoreError> {
        let log = self.chat_log(chat_id).await?;
        let updated = {
            let mut log = log.lock().await;
            let idx = *log
                .by_id
                .get(message_id)
                .ok_or_else(|| StoreError::MessageNotFound(message_id.to_string()))?;
            let message = &mut log.messages[idx];
            let now = Utc::now();

            match mutation {
                MessageMutation::Status(next) => {
                    if message.status == next {
                        // Idempotent: re-applying the current status is a no-op.
                    } else if message.status.can_transition_to(next) {
                        message.status = next;
                    } else {
                        return Err(StoreError::IllegalTransition {
                            from: message.status,
                            to: next,
                        });
                    }
                }
                MessageMutation::Edit { new_content } => {
                    let replaced_hash = Message::content_hash(&message.content);
                    message.edit_history.push(EditRevision {
                        edited_at: now,
                        content_hash: replaced_hash,
                    });
                    message.content = new_content;
                    message.last_edited_at = Some(now);
                }
                MessageMutation::AddReaction { user_id, emoji } => {
                    let exists = message
                        .reactions
                        .iter()
                        .any(|r| r.user_id == user_id && r.emoji == emoji);
                    if !exists {
                        message.reactions.push(sonet_proto::message::Reaction {
                            user_id,
                            emoji,
                            reacted_at: now,
                        });
                    }
                }
                MessageMutation::RemoveReaction { user_id, emoji } => {
                    message
                        .reactions
                        .retain(|r| !(r.user_id == user_id && r.emoji == emoji));
                }
                MessageMutation::MarkRead { user_id, device_id } => {
                    message.upsert_read_receipt(&user_id, &device_id, now);
                    if message.status.can_transition_to(MessageStatus::Read) {
                        message.status = MessageStatus::Read;
                    }
                }
            }
            message.updated_at = now;
            message.clone()
        };

        if let Some(db) = &self.db {
            db.upsert_message(&updated).await?;
        }
        Ok(updated)
    }

    /// Soft delete: content cleared, entry retained with status `deleted`.
    pub async fn delete(
        &self,
        chat_id: &str,
        message_id: &str,
        requester_id: &str,
    ) -> Result<Message, StoreError> {
        let log = self.chat_log(chat_id).await?;
        let deleted = {
            let mut log = log.lock().await;
            let idx = *log
                .by_id
                .get(message_id)
                .ok_or_else(|| StoreError::MessageNotFound(message_id.to_string()))?;
            let message = &mut log.messages[idx];
            tracing::debug!(chat_id, message_id, requester_id, "soft-deleting message");
            message.content.clear();
            message.attachments.clear();
            message.status = MessageStatus::Deleted;
            message.updated_at = Utc::now();
            message.clone()
        };

        if let Some(db) = &self.db {
            db.upsert_message(&deleted).await?;
        }
        Ok(deleted)
    }

    pub async fn message_count(&self, chat_id: &str) -> Result<usize, StoreError> {
        let log = self.chat_log(chat_id).await?;
        let log = log.lock().await;
        Ok(log.messages.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonet_proto::message::MessageType;

    fn msg(chat: &str, sender: &str, content: &str) -> Message {
        Message::new(chat, sender, content.into(), MessageType::Text)
    }

    async fn store_with_chat(chat: &str) -> MessageStore {
        let store = MessageStore::new();
        store.register_chat(chat).await;
        store
    }

    #[tokio::test]
    async fn append_orders_by_created_at_then_id() {
        let store = store_with_chat("c").await;
        let m1 = store.append("c", msg("c", "a", "one")).await.unwrap();
        let m2 = store.append("c", msg("c", "a", "two")).await.unwrap();
        assert!(m1.created_at <= m2.created_at);

        let all = store.all_oldest_first("c").await.unwrap();
        assert_eq!(all[0].message_id, m1.message_id);
        assert_eq!(all[1].message_id, m2.message_id);
    }

    #[tokio::test]
    async fn pagination_is_a_consistent_prefix() {
        let store = store_with_chat("c").await;
        let mut ids = Vec::new();
        for i in 0..7 {
            let m = store.append("c", msg("c", "a", &format!("m{i}"))).await.unwrap();
            ids.push(m.message_id);
        }

        // Newest-first pages of 3.
        let p1 = store.get("c", None, Some(3)).await.unwrap();
        assert_eq!(p1.messages.len(), 3);
        assert_eq!(p1.messages[0].message_id, ids[6]);
        let cursor = p1.next_cursor.clone().unwrap();
        assert_eq!(cursor, ids[4]);

        let p2 = store.get("c", Some(&cursor), Some(3)).await.unwrap();
        assert_eq!(p2.messages[0].message_id, ids[3]);

        // Re-reading with the same cursor yields the same prefix.
        let p2_again = store.get("c", Some(&cursor), Some(3)).await.unwrap();
        let a: Vec<_> = p2.messages.iter().map(|m| &m.message_id).collect();
        let b: Vec<_> = p2_again.messages.iter().map(|m| &m.message_id).collect();
        assert_eq!(a, b);

        let cursor2 = p2.next_cursor.clone().unwrap();
        let p3 = store.get("c", Some(&cursor2), Some(3)).await.unwrap();
        assert_eq!(p3.messages.len(), 1);
        assert!(p3.next_cursor.is_none());
    }

    #[tokio::test]
    async fn status_dag_is_enforced() {
        let store = store_with_chat("c").await;
        let m = store.append("c", msg("c", "a", "x")).await.unwrap();

        store
            .update("c", &m.message_id, MessageMutation::Status(MessageStatus::Sent))
            .await
            .unwrap();
        store
            .update("c", &m.message_id, MessageMutation::Status(MessageStatus::Delivered))
            .await
            .unwrap();
        let err = store
            .update("c", &m.message_id, MessageMutation::Status(MessageStatus::Sent))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn soft_delete_retains_entry() {
        let store = store_with_chat("c").await;
        let m = store.append("c", msg("c", "a", "secret")).await.unwrap();
        store.delete("c", &m.message_id, "a").await.unwrap();

        let fetched = store.get_message("c", &m.message_id).await.unwrap();
        assert_eq!(fetched.status, MessageStatus::Deleted);
        assert!(fetched.content.is_empty());
        assert_eq!(store.message_count("c").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn edit_records_history_hash() {
        let store = store_with_chat("c").await;
        let m = store.append("c", msg("c", "a", "first")).await.unwrap();
        let edited = store
            .update(
                "c",
                &m.message_id,
                MessageMutation::Edit { new_content: "second".into() },
            )
            .await
            .unwrap();
        assert_eq!(edited.content, "second");
        assert!(edited.last_edited_at.is_some());
        assert_eq!(edited.edit_history.len(), 1);
        assert_eq!(
            edited.edit_history[0].content_hash,
            Message::content_hash("first")
        );
    }

    #[tokio::test]
    async fn reply_must_reference_same_chat() {
        let store = store_with_chat("c").await;
        store.register_chat("other").await;
        let target = store.append("other", msg("other", "a", "hi")).await.unwrap();

        let mut reply = msg("c", "b", "re");
        reply.reply_to_message_id = Some(target.message_id.clone());
        assert!(matches!(
            store.append("c", reply).await.unwrap_err(),
            StoreError::ReplyOutsideChat(_)
        ));
    }

    #[tokio::test]
    async fn unknown_chat_is_not_found() {
        let store = MessageStore::new();
        assert!(matches!(
            store.get("ghost", None, None).await.unwrap_err(),
            StoreError::ChatNotFound(_)
        ));
    }
}
