//! Per-(chat, user) session key bookkeeping.
//!
//! A session key names the symmetric material a chat endpoint is currently
//! sealing under. The ratchet owns the actual chain; this record carries
//! the identity, budget, and expiry the encryption descriptor is validated
//! against. Expired or over-budget keys are refused for new encryptions but
//! stay resolvable for decryption until explicitly evicted.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::keys::key_fingerprint;

pub const DEFAULT_MAX_MESSAGES: u64 = 1000;
pub const DEFAULT_LIFETIME_HOURS: i64 = 24;

#[derive(Clone, Serialize, Deserialize)]
pub struct SessionKey {
    pub session_id: String,
    pub chat_id: String,
    pub user_id: String,
    pub algorithm: String,
    key_material: [u8; 32],
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub message_count: u64,
    pub max_messages: u64,
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.key_material.zeroize();
    }
}

impl SessionKey {
    pub fn mint(chat_id: &str, user_id: &str, algorithm: &str, key_material: [u8; 32]) -> Self {
        let now = Utc::now();
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            algorithm: algorithm.to_string(),
            key_material,
            created_at: now,
            expires_at: now + Duration::hours(DEFAULT_LIFETIME_HOURS),
            message_count: 0,
            max_messages: DEFAULT_MAX_MESSAGES,
        }
    }

    pub fn fingerprint(&self) -> String {
        key_fingerprint(&self.key_material)
    }

    pub fn is_exhausted(&self) -> bool {
        self.message_count >= self.max_messages || Utc::now() >= self.expires_at
    }

    /// Account one encryption against the budget. Refused once exhausted;
    /// the caller must mint a replacement first.
    pub fn register_message(&mut self) -> Result<(), CryptoError> {
        if self.is_exhausted() {
            return Err(CryptoError::SessionKeyExhausted);
        }
        self.message_count += 1;
        Ok(())
    }
}
