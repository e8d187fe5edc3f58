//! sonet_proto — protocol types shared by every crate in the messaging core.
//!
//! # Module layout
//! - `chat`       — conversations: direct pairs and groups up to 500 members
//! - `message`    — message envelope, status DAG, reactions, receipts, edits
//! - `encryption` — per-message encryption descriptor
//! - `envelope`   — on-wire ciphertext envelope + versioned persisted records
//! - `events`     — websocket event envelope and client frames
//! - `typing`     — transient typing indicators
//! - `presence`   — connection and online status vocabulary
//! - `api`        — RPC request/response pairs and wire status codes
//! - `error`      — the error taxonomy every component maps into

pub mod api;
pub mod chat;
pub mod encryption;
pub mod envelope;
pub mod error;
pub mod events;
pub mod message;
pub mod presence;
pub mod typing;

pub use chat::{Chat, ChatKind, GroupSizeStatus, MAX_GROUP_MEMBERS};
pub use error::{ErrorKind, HasErrorKind};
pub use events::{EventKind, WireEvent};
pub use message::{Message, MessageStatus, MessageType};
