//! The realtime hub: subscriptions, fan-out, rate limiting, presence.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use sonet_proto::api::Status;
use sonet_proto::events::{EventKind, WireEvent};
use sonet_proto::message::MessageType;
use sonet_proto::presence::ConnectionStatus;

use crate::auth::AuthPredicate;
use crate::config::HubConfig;
use crate::connection::Connection;
use crate::error::HubError;
use crate::registry::ConnectionRegistry;
use crate::typing::TypingAggregator;

/// Chat membership lookup the hub needs for subscription checks and
/// recipient resolution. Implemented by the messaging service.
#[async_trait]
pub trait ChatDirectory: Send + Sync {
    async fn participants(&self, chat_id: &str) -> Option<BTreeSet<String>>;
    async fn chats_for_user(&self, user_id: &str) -> Vec<String>;
}

/// Inbound stream frames that need domain logic (message sends, read
/// receipts) are forwarded here; the hub stays free of store knowledge.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// A `NEW_MESSAGE` client frame. Returns the wire status the stream
    /// reports back on failure.
    #[allow(clippy::too_many_arguments)]
    async fn on_send_message(
        &self,
        user_id: &str,
        chat_id: &str,
        content: &str,
        message_type: MessageType,
        reply_to_message_id: Option<String>,
        thread_id: Option<String>,
    ) -> Status;

    async fn on_read_receipt(&self, user_id: &str, chat_id: &str, message_id: &str, device_id: &str);
}

/// No-op handler for tests.
pub struct IgnoreInbound;

#[async_trait]
impl InboundHandler for IgnoreInbound {
    async fn on_send_message(
        &self,
        _: &str,
        _: &str,
        _: &str,
        _: MessageType,
        _: Option<String>,
        _: Option<String>,
    ) -> Status {
        Status::ok()
    }

    async fn on_read_receipt(&self, _: &str, _: &str, _: &str, _: &str) {}
}

/// Sink for offline recipients. The default discards.
#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn notify(&self, user_id: &str, summary: &str);
}

pub struct NoPush;

#[async_trait]
impl PushNotifier for NoPush {
    async fn notify(&self, _user_id: &str, _summary: &str) {}
}

/// Optional display-data lookup. Never on the critical path: presence
/// events are enriched when an implementation is wired, and silence is a
/// valid answer.
#[async_trait]
pub trait ProfileLookup: Send + Sync {
    async fn display_name(&self, user_id: &str) -> Option<String>;
}

pub struct NoProfiles;

#[async_trait]
impl ProfileLookup for NoProfiles {
    async fn display_name(&self, _user_id: &str) -> Option<String> {
        None
    }
}

pub struct RealtimeHub {
    pub config: HubConfig,
    registry: ConnectionRegistry,
    typing: TypingAggregator,
    auth: Arc<dyn AuthPredicate>,
    directory: Arc<dyn ChatDirectory>,
    push: Arc<dyn PushNotifier>,
    profiles: Arc<dyn ProfileLookup>,
    pub events_dropped: AtomicU64,
    pub connections_disconnected_slow: AtomicU64,
}

impl RealtimeHub {
    pub fn new(
        config: HubConfig,
        auth: Arc<dyn AuthPredicate>,
        directory: Arc<dyn ChatDirectory>,
    ) -> Self {
        Self {
            config,
            registry: ConnectionRegistry::new(),
            typing: TypingAggregator::new(),
            auth,
            directory,
            push: Arc::new(NoPush),
            profiles: Arc::new(NoProfiles),
            events_dropped: AtomicU64::new(0),
            connections_disconnected_slow: AtomicU64::new(0),
        }
    }

    pub fn with_push(mut self, push: Arc<dyn PushNotifier>) -> Self {
        self.push = push;
        self
    }

    pub fn with_profiles(mut self, profiles: Arc<dyn ProfileLookup>) -> Self {
        self.profiles = profiles;
        self
    }

    // ── Connection lifecycle ─────────────────────────────────────────────

    /// Register a fresh connection in `CONNECTING`; the websocket task owns
    /// the returned queue receiver.
    pub fn open_connection(
        &self,
    ) -> (Arc<Connection>, tokio::sync::mpsc::Receiver<WireEvent>) {
        let (conn, rx) = Connection::new(
            self.config.queue_capacity,
            self.config.message_rate_limit,
            std::time::Duration::from_secs(60),
        );
        let conn = Arc::new(conn);
        self.registry.insert(conn.clone());
        let _ = conn.transition(ConnectionStatus::Connected);
        tracing::debug!(connection_id = %conn.connection_id, "connection opened");
        (conn, rx)
    }

    /// Run the auth predicate and promote the connection. On success the
    /// connection is indexed under its user and presence is announced.
    pub async fn authenticate(
        &self,
        connection_id: &str,
        user_id: &str,
        session_token: &str,
        device_id: &str,
    ) -> Result<(), HubError> {
        let conn = self
            .registry
            .get(connection_id)
            .ok_or_else(|| HubError::ConnectionNotFound(connection_id.to_string()))?;

        if !self.auth.authenticate(user_id, session_token).await {
            let _ = conn.transition(ConnectionStatus::Failed);
            self.registry.remove(connection_id);
            return Err(HubError::NotAuthenticated);
        }

        conn.transition(ConnectionStatus::Authenticated)?;
        conn.bind_identity(user_id, device_id, session_token);
        self.registry.index_user(user_id, connection_id);
        tracing::info!(connection_id, user_id, "connection authenticated");

        // Presence fan-out is droppable traffic by design.
        let display_name = self.profiles.display_name(user_id).await;
        for chat_id in self.directory.chats_for_user(user_id).await {
            let event = WireEvent::for_chat(
                EventKind::OnlineStatusChanged,
                &chat_id,
                serde_json::json!({
                    "user_id": user_id,
                    "online_status": "online",
                    "display_name": display_name,
                }),
            )
            .from_user(user_id);
            let _ = self.publish(event).await;
        }
        Ok(())
    }

    /// Tear down a connection; safe to call twice.
    pub fn disconnect(&self, connection_id: &str) {
        if let Some(conn) = self.registry.remove(connection_id) {
            let _ = conn.transition(ConnectionStatus::Disconnecting);
            let _ = conn.transition(ConnectionStatus::Disconnected);
            tracing::debug!(connection_id, "connection closed");
        }
    }

    /// Evict unauthenticated connections that sat past the timeout.
    pub fn evict_idle(&self) {
        let deadline = chrono::Utc::now()
            - chrono::Duration::from_std(self.config.connection_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        for conn in self.registry.all() {
            if !conn.is_authenticated() && conn.connected_at < deadline {
                tracing::debug!(connection_id = %conn.connection_id, "evicting idle unauthenticated connection");
                self.disconnect(&conn.connection_id);
            }
        }
    }

    // ── Subscriptions ────────────────────────────────────────────────────

    pub async fn subscribe(&self, connection_id: &str, chat_id: &str) -> Result<(), HubError> {
        let conn = self
            .registry
            .get(connection_id)
            .ok_or_else(|| HubError::ConnectionNotFound(connection_id.to_string()))?;
        if !conn.is_authenticated() {
            return Err(HubError::NotAuthenticated);
        }
        let participants = self
            .directory
            .participants(chat_id)
            .await
            .ok_or_else(|| HubError::ChatNotFound(chat_id.to_string()))?;
        let user_id = conn.user_id();
        if !participants.contains(&user_id) {
            return Err(HubError::NotParticipant(user_id, chat_id.to_string()));
        }
        conn.subscribe(chat_id);
        Ok(())
    }

    pub fn unsubscribe(&self, connection_id: &str, chat_id: &str) -> Result<(), HubError> {
        let conn = self
            .registry
            .get(connection_id)
            .ok_or_else(|| HubError::ConnectionNotFound(connection_id.to_string()))?;
        conn.unsubscribe(chat_id);
        Ok(())
    }

    // ── Fan-out ──────────────────────────────────────────────────────────

    /// Deliver an event to its recipients. Chat events go to every
    /// participant; targeted events to one user. A connection with explicit
    /// subscriptions only receives chats it subscribed to; one that never
    /// subscribed receives all of its user's chats.
    pub async fn publish(&self, event: WireEvent) -> Result<usize, HubError> {
        let recipients: Vec<String> = if let Some(target) = &event.target_user_id {
            vec![target.clone()]
        } else if let Some(chat_id) = &event.chat_id {
            self.directory
                .participants(chat_id)
                .await
                .ok_or_else(|| HubError::ChatNotFound(chat_id.to_string()))?
                .into_iter()
                .collect()
        } else {
            return Ok(0);
        };

        let mut delivered = 0usize;
        for user_id in &recipients {
            let connections = self.registry.connections_for_user(user_id);

            if connections.is_empty() {
                if event.kind == EventKind::NewMessage {
                    self.push.notify(user_id, "New message").await;
                }
                continue;
            }

            for conn in connections {
                if let Some(chat_id) = &event.chat_id {
                    if conn.subscription_count() > 0 && !conn.is_subscribed(chat_id) {
                        continue;
                    }
                }
                match conn.enqueue(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(HubError::QueueFull) => {
                        if event.kind.droppable() {
                            self.events_dropped.fetch_add(1, Ordering::Relaxed);
                        } else {
                            // Message events are never silently dropped: the
                            // slowest consumer loses its connection and
                            // re-syncs from the store on reconnect.
                            self.connections_disconnected_slow.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(
                                connection_id = %conn.connection_id,
                                "queue full on reliable event, disconnecting slow consumer"
                            );
                            self.disconnect(&conn.connection_id);
                        }
                    }
                    Err(_) => {
                        self.disconnect(&conn.connection_id);
                    }
                }
            }
        }
        Ok(delivered)
    }

    // ── Rate limiting ────────────────────────────────────────────────────

    /// Account one inbound message against the connection's window. Repeat
    /// violators transition to `BANNED` and are dropped.
    pub fn check_rate(&self, connection_id: &str) -> Result<(), HubError> {
        let conn = self
            .registry
            .get(connection_id)
            .ok_or_else(|| HubError::ConnectionNotFound(connection_id.to_string()))?;
        let (allowed, violations) = {
            let mut window = conn.rate.lock().unwrap_or_else(|e| e.into_inner());
            (window.check(), window.violations)
        };
        if allowed {
            return Ok(());
        }
        if violations >= self.config.ban_after_violations {
            tracing::warn!(connection_id, violations, "banning connection");
            let _ = conn.transition(ConnectionStatus::Banned);
            self.registry.remove(connection_id);
            return Err(HubError::Banned);
        }
        Err(HubError::RateLimited)
    }

    // ── Typing ───────────────────────────────────────────────────────────

    pub async fn set_typing(
        &self,
        chat_id: &str,
        user_id: &str,
        is_typing: bool,
    ) -> Result<(), HubError> {
        let participants = self
            .directory
            .participants(chat_id)
            .await
            .ok_or_else(|| HubError::ChatNotFound(chat_id.to_string()))?;
        if !participants.contains(user_id) {
            return Err(HubError::NotParticipant(user_id.to_string(), chat_id.to_string()));
        }

        if let Some(state) = self
            .typing
            .set_typing(chat_id, user_id, is_typing, &self.config)
            .await
        {
            let kind = if is_typing {
                EventKind::TypingStarted
            } else {
                EventKind::TypingStopped
            };
            let event = WireEvent::for_chat(kind, chat_id, serde_json::to_value(&state).unwrap_or_default())
                .from_user(user_id);
            self.publish(event).await?;
        }
        Ok(())
    }

    pub async fn typing_state(&self, chat_id: &str) -> sonet_proto::typing::ChatTypingState {
        self.typing.typing_state(chat_id).await
    }

    /// One maintenance pass: idle eviction + typing expiry broadcast.
    pub async fn maintenance_tick(&self) {
        self.evict_idle();
        for state in self.typing.sweep().await {
            let chat_id = state.chat_id.clone();
            let event = WireEvent::for_chat(
                EventKind::TypingStopped,
                &chat_id,
                serde_json::to_value(&state).unwrap_or_default(),
            );
            let _ = self.publish(event).await;
        }
    }

    // ── Introspection ────────────────────────────────────────────────────

    pub fn connection_count(&self) -> usize {
        self.registry.connection_count()
    }

    pub fn connections_for_user(&self, user_id: &str) -> Vec<Arc<Connection>> {
        self.registry.connections_for_user(user_id)
    }

    pub fn user_is_online(&self, user_id: &str) -> bool {
        self.registry.user_is_online(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAll;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    struct StaticDirectory {
        chats: Mutex<HashMap<String, BTreeSet<String>>>,
    }

    impl StaticDirectory {
        fn with(chats: &[(&str, &[&str])]) -> Arc<Self> {
            let map = chats
                .iter()
                .map(|(chat, users)| {
                    (
                        chat.to_string(),
                        users.iter().map(|u| u.to_string()).collect(),
                    )
                })
                .collect();
            Arc::new(Self { chats: Mutex::new(map) })
        }
    }

    #[async_trait]
    impl ChatDirectory for StaticDirectory {
        async fn participants(&self, chat_id: &str) -> Option<BTreeSet<String>> {
            self.chats.lock().await.get(chat_id).cloned()
        }
        async fn chats_for_user(&self, user_id: &str) -> Vec<String> {
            self.chats
                .lock()
                .await
                .iter()
                .filter(|(_, users)| users.contains(user_id))
                .map(|(chat, _)| chat.clone())
                .collect()
        }
    }

    fn hub_with(chats: &[(&str, &[&str])]) -> RealtimeHub {
        RealtimeHub::new(HubConfig::default(), Arc::new(AllowAll), StaticDirectory::with(chats))
    }

    async fn authed_conn(
        hub: &RealtimeHub,
        user: &str,
    ) -> (Arc<Connection>, tokio::sync::mpsc::Receiver<WireEvent>) {
        let (conn, rx) = hub.open_connection();
        hub.authenticate(&conn.connection_id, user, "tok", "dev")
            .await
            .unwrap();
        (conn, rx)
    }

    #[tokio::test]
    async fn publish_reaches_all_participant_connections() {
        let hub = hub_with(&[("c1", &["alice", "bob"])]);
        let (_a, mut rx_a) = authed_conn(&hub, "alice").await;
        let (_b1, mut rx_b1) = authed_conn(&hub, "bob").await;
        let (_b2, mut rx_b2) = authed_conn(&hub, "bob").await;

        let event = WireEvent::for_chat(EventKind::NewMessage, "c1", serde_json::json!({"x": 1}));
        let delivered = hub.publish(event).await.unwrap();
        assert_eq!(delivered, 3);

        for rx in [&mut rx_a, &mut rx_b1, &mut rx_b2] {
            // Skip presence noise from authentication.
            loop {
                let ev = rx.try_recv().expect("event queued");
                if ev.kind == EventKind::NewMessage {
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn explicit_subscriptions_filter_chats() {
        let hub = hub_with(&[("c1", &["alice", "bob"]), ("c2", &["alice", "bob"])]);
        let (conn, mut rx) = authed_conn(&hub, "alice").await;
        hub.subscribe(&conn.connection_id, "c1").await.unwrap();

        hub.publish(WireEvent::for_chat(EventKind::NewMessage, "c2", serde_json::json!({})))
            .await
            .unwrap();
        hub.publish(WireEvent::for_chat(EventKind::NewMessage, "c1", serde_json::json!({})))
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if ev.kind == EventKind::NewMessage {
                kinds.push(ev.chat_id.unwrap());
            }
        }
        assert_eq!(kinds, vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn subscribe_requires_participation() {
        let hub = hub_with(&[("c1", &["alice", "bob"])]);
        let (conn, _rx) = authed_conn(&hub, "carol").await;
        let err = hub.subscribe(&conn.connection_id, "c1").await.unwrap_err();
        assert!(matches!(err, HubError::NotParticipant(..)));
    }

    #[tokio::test]
    async fn slow_consumer_is_disconnected_on_reliable_overflow() {
        let mut config = HubConfig::default();
        config.queue_capacity = 1;
        let hub = RealtimeHub::new(
            config,
            Arc::new(AllowAll),
            StaticDirectory::with(&[("c1", &["alice"])]),
        );
        let (conn, _rx) = authed_conn(&hub, "alice").await;
        // The presence event from authentication already fills the
        // capacity-1 queue, and nothing drains it.
        let ev = WireEvent::for_chat(EventKind::NewMessage, "c1", serde_json::json!({}));
        hub.publish(ev).await.unwrap();
        assert_eq!(hub.connections_disconnected_slow.load(Ordering::Relaxed), 1);
        assert!(hub.connections_for_user("alice").is_empty());
        let _ = conn;
    }

    #[tokio::test]
    async fn droppable_overflow_only_drops() {
        let mut config = HubConfig::default();
        config.queue_capacity = 1;
        config.typing_emit_interval = std::time::Duration::from_millis(0);
        let hub = RealtimeHub::new(
            config,
            Arc::new(AllowAll),
            StaticDirectory::with(&[("c1", &["alice", "bob"])]),
        );
        let (_conn, mut rx) = authed_conn(&hub, "alice").await;
        while rx.try_recv().is_ok() {}

        hub.publish(WireEvent::for_chat(EventKind::NewMessage, "c1", serde_json::json!({})))
            .await
            .unwrap();
        // Queue now full; typing traffic is sacrificed silently.
        hub.set_typing("c1", "bob", true).await.unwrap();
        assert!(hub.events_dropped.load(Ordering::Relaxed) >= 1);
        assert_eq!(hub.connections_for_user("alice").len(), 1);
    }

    #[tokio::test]
    async fn rate_limit_bans_after_repeat_violations() {
        let mut config = HubConfig::default();
        config.message_rate_limit = 1;
        config.ban_after_violations = 2;
        let hub = RealtimeHub::new(
            config,
            Arc::new(AllowAll),
            StaticDirectory::with(&[("c1", &["alice"])]),
        );
        let (conn, _rx) = authed_conn(&hub, "alice").await;

        assert!(hub.check_rate(&conn.connection_id).is_ok());
        assert!(matches!(
            hub.check_rate(&conn.connection_id).unwrap_err(),
            HubError::RateLimited
        ));
        assert!(matches!(
            hub.check_rate(&conn.connection_id).unwrap_err(),
            HubError::Banned
        ));
        assert_eq!(conn.status(), ConnectionStatus::Banned);
        assert!(hub.connections_for_user("alice").is_empty());
    }

    #[tokio::test]
    async fn failed_auth_drops_connection() {
        struct DenyAll;
        #[async_trait]
        impl AuthPredicate for DenyAll {
            async fn authenticate(&self, _: &str, _: &str) -> bool {
                false
            }
        }
        let hub = RealtimeHub::new(
            HubConfig::default(),
            Arc::new(DenyAll),
            StaticDirectory::with(&[]),
        );
        let (conn, _rx) = hub.open_connection();
        let err = hub
            .authenticate(&conn.connection_id, "alice", "bad", "dev")
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::NotAuthenticated));
        assert_eq!(hub.connection_count(), 0);
    }
}
