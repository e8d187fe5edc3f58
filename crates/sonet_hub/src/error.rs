use sonet_proto::error::{ErrorKind, HasErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("connection {0} not found")]
    ConnectionNotFound(String),

    #[error("connection is not authenticated")]
    NotAuthenticated,

    #[error("user {0} is not a participant of chat {1}")]
    NotParticipant(String, String),

    #[error("chat {0} not found")]
    ChatNotFound(String),

    #[error("rate limited")]
    RateLimited,

    #[error("connection is banned")]
    Banned,

    #[error("outbound queue full")]
    QueueFull,
}

impl HasErrorKind for HubError {
    fn kind(&self) -> ErrorKind {
        match self {
            HubError::ConnectionNotFound(_) | HubError::ChatNotFound(_) => ErrorKind::NotFound,
            HubError::NotAuthenticated | HubError::NotParticipant(..) | HubError::Banned => {
                ErrorKind::PermissionDenied
            }
            HubError::RateLimited | HubError::QueueFull => ErrorKind::ResourceExhausted,
        }
    }
}
