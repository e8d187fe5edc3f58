//! Sqlite persistence via sqlx.
//!
//! WAL journal mode and foreign-key enforcement are configured at
//! connection time, not inside a migration — SQLite forbids changing
//! `journal_mode` inside a transaction and sqlx wraps every migration in
//! one.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};

use sonet_proto::envelope::Versioned;
use sonet_proto::message::Message;
use sonet_proto::Chat;

use crate::error::StoreError;
use crate::models::{ChatRow, MessageRow};

/// Persistence handle. Cheap to clone (pool is Arc internally).
#[derive(Clone)]
pub struct StoreDb {
    pub pool: SqlitePool,
}

impl StoreDb {
    /// Open (or create) the database and run pending migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(opts).await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(Self { pool })
    }

    pub async fn upsert_chat(&self, chat: &Chat) -> Result<(), StoreError> {
        let record = Versioned::current(chat.clone()).to_json()?;
        sqlx::query(
            "INSERT INTO chats (id, kind, record, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET record = excluded.record,
                                           updated_at = excluded.updated_at",
        )
        .bind(&chat.chat_id)
        .bind(match chat.kind {
            sonet_proto::ChatKind::Direct => "direct",
            sonet_proto::ChatKind::Group => "group",
        })
        .bind(record)
        .bind(chat.created_at)
        .bind(chat.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_message(&self, message: &Message) -> Result<(), StoreError> {
        let record = Versioned::current(message.clone()).to_json()?;
        sqlx::query(
            "INSERT INTO messages (id, chat_id, sender_id, status, record, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status,
                                           record = excluded.record,
                                           updated_at = excluded.updated_at",
        )
        .bind(&message.message_id)
        .bind(&message.chat_id)
        .bind(&message.sender_id)
        .bind(serde_json::to_string(&message.status)?.trim_matches('"').to_string())
        .bind(record)
        .bind(message.created_at)
        .bind(message.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Recover a chat's messages in `(created_at, id)` order.
    pub async fn load_messages(&self, chat_id: &str) -> Result<Vec<Message>, StoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, chat_id, sender_id, status, record, created_at, updated_at
             FROM messages WHERE chat_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Versioned::<Message>::from_json(&row.record).map_err(StoreError::from))
            .collect()
    }

    pub async fn load_chats(&self) -> Result<Vec<Chat>, StoreError> {
        let rows: Vec<ChatRow> = sqlx::query_as(
            "SELECT id, kind, record, created_at, updated_at FROM chats ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Versioned::<Chat>::from_json(&row.record).map_err(StoreError::from))
            .collect()
    }

    /// Persist an opaque per-(chat, user) ratchet snapshot.
    pub async fn save_ratchet_snapshot(
        &self,
        chat_id: &str,
        user_id: &str,
        record: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO ratchet_snapshots (chat_id, user_id, record, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(chat_id, user_id) DO UPDATE SET record = excluded.record,
                                                         updated_at = excluded.updated_at",
        )
        .bind(chat_id)
        .bind(user_id)
        .bind(record)
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

impl From<sonet_proto::envelope::RecordError> for StoreError {
    fn from(e: sonet_proto::envelope::RecordError) -> Self {
        match e {
            sonet_proto::envelope::RecordError::Parse(inner) => StoreError::Record(inner),
            other => StoreError::Migration(other.to_string()),
        }
    }
}
