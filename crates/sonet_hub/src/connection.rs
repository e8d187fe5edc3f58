//! Per-connection state.
//!
//! A connection is a bounded outbound queue plus the state machine and
//! counters of §presence. The websocket task owns the receiving half of
//! the queue; everything else reaches the connection through this handle.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use sonet_proto::events::WireEvent;
use sonet_proto::presence::{ConnectionStatus, OnlineStatus};

use crate::error::HubError;
use crate::rate_limit::SlidingWindow;

pub struct Connection {
    pub connection_id: String,
    /// Empty until AUTH succeeds.
    user_id: StdMutex<String>,
    device_id: StdMutex<String>,
    session_token: StdMutex<String>,
    status: StdMutex<ConnectionStatus>,
    online_status: StdMutex<OnlineStatus>,
    pub connected_at: DateTime<Utc>,

    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,

    subscriptions: StdMutex<HashSet<String>>,
    sender: mpsc::Sender<WireEvent>,
    pub rate: StdMutex<SlidingWindow>,
}

impl Connection {
    pub fn new(
        queue_capacity: usize,
        rate_limit: usize,
        rate_window: std::time::Duration,
    ) -> (Self, mpsc::Receiver<WireEvent>) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let conn = Self {
            connection_id: uuid::Uuid::new_v4().to_string(),
            user_id: StdMutex::new(String::new()),
            device_id: StdMutex::new(String::new()),
            session_token: StdMutex::new(String::new()),
            status: StdMutex::new(ConnectionStatus::Connecting),
            online_status: StdMutex::new(OnlineStatus::Offline),
            connected_at: Utc::now(),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            subscriptions: StdMutex::new(HashSet::new()),
            sender: tx,
            rate: StdMutex::new(SlidingWindow::new(rate_limit, rate_window)),
        };
        (conn, rx)
    }

    pub fn user_id(&self) -> String {
        self.user_id.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn device_id(&self) -> String {
        self.device_id.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn online_status(&self) -> OnlineStatus {
        *self.online_status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_online_status(&self, status: OnlineStatus) {
        *self.online_status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    pub fn is_authenticated(&self) -> bool {
        self.status() == ConnectionStatus::Authenticated
    }

    /// Drive the state machine. Illegal edges are refused, so a banned or
    /// disconnected connection can never come back to life.
    pub fn transition(&self, next: ConnectionStatus) -> Result<(), HubError> {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if !status.can_transition_to(next) {
            return Err(HubError::NotAuthenticated);
        }
        *status = next;
        Ok(())
    }

    /// Bind identity after the auth predicate accepted the token.
    pub fn bind_identity(&self, user_id: &str, device_id: &str, session_token: &str) {
        *self.user_id.lock().unwrap_or_else(|e| e.into_inner()) = user_id.to_string();
        *self.device_id.lock().unwrap_or_else(|e| e.into_inner()) = device_id.to_string();
        *self.session_token.lock().unwrap_or_else(|e| e.into_inner()) = session_token.to_string();
        self.set_online_status(OnlineStatus::Online);
    }

    pub fn subscribe(&self, chat_id: &str) {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(chat_id.to_string());
    }

    pub fn unsubscribe(&self, chat_id: &str) {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(chat_id);
    }

    pub fn is_subscribed(&self, chat_id: &str) -> bool {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(chat_id)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Enqueue without blocking. `QueueFull` surfaces backpressure to the
    /// fan-out policy; the hub decides whether to drop or disconnect.
    pub fn enqueue(&self, event: WireEvent) -> Result<(), HubError> {
        match self.sender.try_send(event) {
            Ok(()) => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(HubError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(HubError::ConnectionNotFound(self.connection_id.clone()))
            }
        }
    }

    pub fn queue_capacity_remaining(&self) -> usize {
        self.sender.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonet_proto::events::EventKind;

    fn connection(capacity: usize) -> (Connection, mpsc::Receiver<WireEvent>) {
        Connection::new(capacity, 60, std::time::Duration::from_secs(60))
    }

    #[test]
    fn lifecycle_happy_path() {
        let (conn, _rx) = connection(4);
        assert_eq!(conn.status(), ConnectionStatus::Connecting);
        conn.transition(ConnectionStatus::Connected).unwrap();
        conn.transition(ConnectionStatus::Authenticated).unwrap();
        conn.bind_identity("alice", "phone", "tok");
        assert!(conn.is_authenticated());
        assert_eq!(conn.user_id(), "alice");
        assert_eq!(conn.online_status(), OnlineStatus::Online);

        conn.transition(ConnectionStatus::Disconnecting).unwrap();
        conn.transition(ConnectionStatus::Disconnected).unwrap();
        assert!(conn.transition(ConnectionStatus::Connected).is_err());
    }

    #[test]
    fn banned_is_terminal() {
        let (conn, _rx) = connection(4);
        conn.transition(ConnectionStatus::Connected).unwrap();
        conn.transition(ConnectionStatus::Banned).unwrap();
        assert!(conn.transition(ConnectionStatus::Authenticated).is_err());
    }

    #[test]
    fn queue_overflow_is_reported() {
        let (conn, mut rx) = connection(2);
        let ev = || WireEvent::new(EventKind::NewMessage, serde_json::json!({}));
        conn.enqueue(ev()).unwrap();
        conn.enqueue(ev()).unwrap();
        assert!(matches!(conn.enqueue(ev()), Err(HubError::QueueFull)));

        rx.try_recv().unwrap();
        conn.enqueue(ev()).unwrap();
    }

    #[test]
    fn subscriptions_toggle() {
        let (conn, _rx) = connection(2);
        conn.subscribe("c1");
        assert!(conn.is_subscribed("c1"));
        conn.unsubscribe("c1");
        assert!(!conn.is_subscribed("c1"));
    }
}
