use sonet_proto::error::{ErrorKind, HasErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("empty query")]
    EmptyQuery,

    #[error("pending update queue is full")]
    QueueFull,

    #[error("index writer is shut down")]
    ShutDown,
}

impl HasErrorKind for IndexError {
    fn kind(&self) -> ErrorKind {
        match self {
            IndexError::EmptyQuery => ErrorKind::InvalidArgument,
            IndexError::QueueFull => ErrorKind::ResourceExhausted,
            IndexError::ShutDown => ErrorKind::Internal,
        }
    }
}
