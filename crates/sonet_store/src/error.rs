use sonet_proto::error::{ErrorKind, HasErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("chat {0} not found")]
    ChatNotFound(String),

    #[error("message {0} not found")]
    MessageNotFound(String),

    #[error("illegal status transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: sonet_proto::MessageStatus,
        to: sonet_proto::MessageStatus,
    },

    #[error("invalid cursor {0}")]
    InvalidCursor(String),

    #[error("reply references message {0} outside this chat")]
    ReplyOutsideChat(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("record serialisation error: {0}")]
    Record(#[from] serde_json::Error),
}

impl HasErrorKind for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            StoreError::ChatNotFound(_) | StoreError::MessageNotFound(_) => ErrorKind::NotFound,
            StoreError::IllegalTransition { .. }
            | StoreError::InvalidCursor(_)
            | StoreError::ReplyOutsideChat(_) => ErrorKind::InvalidArgument,
            StoreError::Database(_) | StoreError::Migration(_) | StoreError::Record(_) => {
                ErrorKind::Internal
            }
        }
    }
}
