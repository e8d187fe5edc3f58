//! sonet_server — the outward-facing messaging service.
//!
//! # Module layout
//! - `config`  — sonet.toml + SONET_* environment configuration
//! - `core`    — the `MessagingCore` component registry
//! - `service` — the six public operations and their orchestration
//! - `http`    — JSON RPC surface and the /ws stream endpoint

pub mod config;
pub mod core;
pub mod http;
pub mod service;

pub use core::MessagingCore;
pub use service::MessagingService;
