//! Websocket wire format.
//!
//! One JSON envelope per frame. Server → client pushes are `WireEvent`s;
//! client → server frames are the small `ClientFrame` union (AUTH first,
//! then typing / receipts / subscriptions).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::MessageType;

/// Every event type the hub can push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    NewMessage,
    MessageEdited,
    MessageDeleted,
    MessageRead,
    MessageDelivered,
    TypingStarted,
    TypingStopped,
    UserJoinedChat,
    UserLeftChat,
    ChatCreated,
    ChatUpdated,
    ChatDeleted,
    ParticipantAdded,
    ParticipantRemoved,
    ParticipantRoleChanged,
    OnlineStatusChanged,
    CallInitiated,
    CallEnded,
    SystemNotification,
}

impl EventKind {
    /// Low-priority events may be dropped under backpressure; message
    /// events are never silently dropped.
    pub fn droppable(self) -> bool {
        matches!(
            self,
            EventKind::TypingStarted
                | EventKind::TypingStopped
                | EventKind::OnlineStatusChanged
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEvent {
    pub event_id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<String>,
    pub data: Value,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

impl WireEvent {
    pub fn new(kind: EventKind, data: Value) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            kind,
            chat_id: None,
            user_id: None,
            target_user_id: None,
            data,
            timestamp: Utc::now().timestamp_millis(),
            priority: None,
        }
    }

    pub fn for_chat(kind: EventKind, chat_id: &str, data: Value) -> Self {
        let mut ev = Self::new(kind, data);
        ev.chat_id = Some(chat_id.to_string());
        ev
    }

    pub fn from_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn to_user(mut self, target: &str) -> Self {
        self.target_user_id = Some(target.to_string());
        self
    }
}

// ── Client → server frames ───────────────────────────────────────────────────

/// First frame after socket open MUST be `AUTH`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPayload {
    pub user_id: String,
    pub session_token: String,
    pub device_id: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub app_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientFrame {
    #[serde(rename = "AUTH")]
    Auth(AuthPayload),
    /// Inbound message send over the stream; mirrors the `new_message`
    /// member of the wire union. The sender is the authenticated user,
    /// never a frame field.
    #[serde(rename = "NEW_MESSAGE")]
    SendMessage {
        chat_id: String,
        content: String,
        #[serde(default = "default_message_type", rename = "type")]
        message_type: MessageType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to_message_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
    },
    #[serde(rename = "SUBSCRIBE")]
    Subscribe { chat_id: String },
    #[serde(rename = "UNSUBSCRIBE")]
    Unsubscribe { chat_id: String },
    #[serde(rename = "TYPING")]
    Typing {
        chat_id: String,
        is_typing: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
    },
    #[serde(rename = "READ_RECEIPT")]
    ReadReceipt {
        chat_id: String,
        message_id: String,
        device_id: String,
    },
    #[serde(rename = "PING")]
    Ping,
}

fn default_message_type() -> MessageType {
    MessageType::Text
}

/// Handshake replies. Everything after a successful AUTH is a `WireEvent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum HandshakeReply {
    #[serde(rename = "AUTH_OK")]
    AuthOk {},
    #[serde(rename = "ERROR")]
    Error { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_wire_names() {
        let ev = WireEvent::for_chat(EventKind::NewMessage, "c1", serde_json::json!({}));
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""type":"NEW_MESSAGE""#));
        assert!(json.contains(r#""chat_id":"c1""#));
    }

    #[test]
    fn auth_frame_parses() {
        let json = r#"{"type":"AUTH","data":{"user_id":"u1","session_token":"t","device_id":"d1","platform":"ios","app_version":"1.0"}}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        match frame {
            ClientFrame::Auth(p) => assert_eq!(p.user_id, "u1"),
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn send_message_frame_parses_with_default_type() {
        let json = r#"{"type":"NEW_MESSAGE","data":{"chat_id":"c1","content":"hi"}}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        match frame {
            ClientFrame::SendMessage { chat_id, content, message_type, .. } => {
                assert_eq!(chat_id, "c1");
                assert_eq!(content, "hi");
                assert_eq!(message_type, MessageType::Text);
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn droppable_classes() {
        assert!(EventKind::TypingStarted.droppable());
        assert!(EventKind::OnlineStatusChanged.droppable());
        assert!(!EventKind::NewMessage.droppable());
        assert!(!EventKind::MessageDeleted.droppable());
    }
}
