//! sonet_hub — websocket connections, subscriptions, and event fan-out.
//!
//! The hub owns every live connection. Publishers hand it a `WireEvent`;
//! it resolves the recipient set, snapshots the matching authenticated
//! connections under a shared lookup, releases, and enqueues on each
//! connection's bounded queue. Per (chat, connection) delivery keeps
//! publish order because each connection drains one FIFO queue.
//!
//! # Module layout
//! - `config`     — hub tunables
//! - `auth`       — the caller-supplied authentication predicate
//! - `connection` — per-connection state machine and bounded queue handle
//! - `registry`   — connection table, indexed by connection id and user id
//! - `hub`        — subscriptions, fan-out, bans, presence
//! - `typing`     — per-chat typing aggregation with coalesced emission
//! - `rate_limit` — sliding-window message rate limiting
//! - `ws`         — the axum websocket endpoint (AUTH handshake, pumps)

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod rate_limit;
pub mod registry;
pub mod typing;
pub mod ws;

pub use auth::AuthPredicate;
pub use config::HubConfig;
pub use connection::Connection;
pub use error::HubError;
pub use hub::{ChatDirectory, InboundHandler, ProfileLookup, PushNotifier, RealtimeHub};
