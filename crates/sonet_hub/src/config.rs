//! Hub tunables.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Unauthenticated connections are evicted after this long.
    pub connection_timeout: Duration,
    /// Keepalive ping cadence; a missed ping starts the disconnect.
    pub ping_interval: Duration,
    /// Typing indicators expire this long after their last update.
    pub typing_timeout: Duration,
    /// Coalesced typing-state emission happens at most this often per chat.
    pub typing_emit_interval: Duration,
    /// Bound on each connection's pending outbound queue.
    pub queue_capacity: usize,
    /// Messages per minute per connection.
    pub message_rate_limit: usize,
    /// Rate-limit violations before the connection is banned.
    pub ban_after_violations: u32,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(25),
            typing_timeout: Duration::from_secs(6),
            typing_emit_interval: Duration::from_millis(500),
            queue_capacity: 256,
            message_rate_limit: 60,
            ban_after_violations: 5,
        }
    }
}
