//! sonet_store — append-only ordered message log, one per chat.
//!
//! The in-memory log is the source of truth for reads; appends serialize
//! on a per-chat mutex, which makes `created_at` monotonic per chat on a
//! single node. A sqlite layer persists every accepted write as a
//! versioned record; it is write-through and never consulted on the read
//! path.

pub mod db;
pub mod error;
pub mod log;
pub mod models;

pub use db::StoreDb;
pub use error::StoreError;
pub use log::{MessageMutation, MessageStore, Page};
