//! Typing aggregation.
//!
//! Indicators are deduplicated by (user, chat) and expire on their own.
//! Subscribers receive a coalesced `ChatTypingState` at most once per
//! emission interval per chat, so a pathological typist cannot flood the
//! fan-out path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Mutex;

use sonet_proto::typing::{ChatTypingState, TypingIndicator};

use crate::config::HubConfig;

#[derive(Default)]
struct ChatTyping {
    /// user_id → live indicator.
    by_user: HashMap<String, TypingIndicator>,
    last_emitted: Option<Instant>,
}

#[derive(Clone, Default)]
pub struct TypingAggregator {
    chats: Arc<Mutex<HashMap<String, ChatTyping>>>,
}

impl TypingAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record typing activity. Returns the coalesced state to broadcast if
    /// the emission interval has elapsed (or typing just stopped).
    pub async fn set_typing(
        &self,
        chat_id: &str,
        user_id: &str,
        is_typing: bool,
        config: &HubConfig,
    ) -> Option<ChatTypingState> {
        let ttl = chrono::Duration::from_std(config.typing_timeout).unwrap_or_else(|_| chrono::Duration::seconds(6));
        let mut chats = self.chats.lock().await;
        let chat = chats.entry(chat_id.to_string()).or_default();

        if is_typing {
            match chat.by_user.get_mut(user_id) {
                // Dedup by (user, chat): repeated starts refresh the expiry.
                Some(indicator) => indicator.touch(ttl),
                None => {
                    chat.by_user
                        .insert(user_id.to_string(), TypingIndicator::new(user_id, chat_id, ttl));
                }
            }
        } else {
            chat.by_user.remove(user_id);
        }

        Self::prune(chat);

        // Stop events always emit (they end the indicator immediately);
        // start events coalesce to the interval.
        let due = !is_typing
            || chat
                .last_emitted
                .is_none_or(|t| t.elapsed() >= config.typing_emit_interval);
        if !due {
            return None;
        }
        chat.last_emitted = Some(Instant::now());
        Some(Self::state_of(chat_id, chat))
    }

    /// Live (unexpired) typing users for a chat.
    pub async fn typing_state(&self, chat_id: &str) -> ChatTypingState {
        let mut chats = self.chats.lock().await;
        match chats.get_mut(chat_id) {
            Some(chat) => {
                Self::prune(chat);
                Self::state_of(chat_id, chat)
            }
            None => ChatTypingState {
                chat_id: chat_id.to_string(),
                typing_user_ids: Vec::new(),
                updated_at: Utc::now(),
            },
        }
    }

    /// Periodic sweep; returns the chats whose state changed by expiry so
    /// the hub can broadcast the quiesced state.
    pub async fn sweep(&self) -> Vec<ChatTypingState> {
        let mut emitted = Vec::new();
        let mut chats = self.chats.lock().await;
        chats.retain(|chat_id, chat| {
            let before = chat.by_user.len();
            Self::prune(chat);
            if chat.by_user.len() != before {
                emitted.push(Self::state_of(chat_id, chat));
            }
            !chat.by_user.is_empty() || chat.last_emitted.is_some()
        });
        emitted
    }

    fn prune(chat: &mut ChatTyping) {
        let now = Utc::now();
        chat.by_user.retain(|_, indicator| !indicator.is_expired(now));
    }

    fn state_of(chat_id: &str, chat: &ChatTyping) -> ChatTypingState {
        let mut typing_user_ids: Vec<String> = chat.by_user.keys().cloned().collect();
        typing_user_ids.sort();
        ChatTypingState {
            chat_id: chat_id.to_string(),
            typing_user_ids,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HubConfig {
        HubConfig {
            typing_emit_interval: std::time::Duration::from_millis(0),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn start_twice_is_one_indicator() {
        let agg = TypingAggregator::new();
        let cfg = config();
        agg.set_typing("c1", "alice", true, &cfg).await;
        let state = agg.set_typing("c1", "alice", true, &cfg).await.unwrap();
        assert_eq!(state.typing_user_ids, vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn stop_removes_immediately() {
        let agg = TypingAggregator::new();
        let cfg = config();
        agg.set_typing("c1", "alice", true, &cfg).await;
        let state = agg.set_typing("c1", "alice", false, &cfg).await.unwrap();
        assert!(state.typing_user_ids.is_empty());
    }

    #[tokio::test]
    async fn expired_indicators_never_appear() {
        let agg = TypingAggregator::new();
        let cfg = HubConfig {
            typing_timeout: std::time::Duration::from_millis(0),
            typing_emit_interval: std::time::Duration::from_millis(0),
            ..Default::default()
        };
        agg.set_typing("c1", "alice", true, &cfg).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let state = agg.typing_state("c1").await;
        assert!(state.typing_user_ids.is_empty());
    }

    #[tokio::test]
    async fn coalescing_suppresses_rapid_start_events() {
        let agg = TypingAggregator::new();
        let cfg = HubConfig {
            typing_emit_interval: std::time::Duration::from_secs(60),
            ..Default::default()
        };
        assert!(agg.set_typing("c1", "alice", true, &cfg).await.is_some());
        // Within the interval: aggregated silently.
        assert!(agg.set_typing("c1", "bob", true, &cfg).await.is_none());
        // Stop still emits.
        assert!(agg.set_typing("c1", "alice", false, &cfg).await.is_some());
    }

    #[tokio::test]
    async fn sweep_reports_expiry() {
        let agg = TypingAggregator::new();
        let cfg = HubConfig {
            typing_timeout: std::time::Duration::from_millis(0),
            typing_emit_interval: std::time::Duration::from_millis(0),
            ..Default::default()
        };
        agg.set_typing("c1", "alice", true, &cfg).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let changed = agg.sweep().await;
        assert_eq!(changed.len(), 1);
        assert!(changed[0].typing_user_ids.is_empty());
    }
}
