use thiserror::Error;

use crate::queue::{QueueError, TransportError};
use crate::serializer::SerializeError;
use crate::storage::StorageError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over canonical capability errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Serialize(#[from] SerializeError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            // a plugged serializer failing is a programmer error
            Error::Serialize(_) => Transience::Permanent,
            Error::Storage(_) => Transience::Retryable,
            Error::Queue(QueueError::Storage(_)) => Transience::Retryable,
            Error::Queue(_) => Transience::Permanent,
            // retryability of transport errors is the retry policy's call
            Error::Transport(_) => Transience::Unknown,
            Error::Config(_) => Transience::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transience_classification() {
        let serialize: Error = SerializeError::Malformed {
            reason: "bad tag".into(),
        }
        .into();
        assert_eq!(serialize.transience(), Transience::Permanent);

        let storage: Error = StorageError::Internal("lock poisoned").into();
        assert!(storage.transience().is_retryable());

        let transport: Error = TransportError::new("NetworkError", "reset").into();
        assert_eq!(transport.transience(), Transience::Unknown);
    }
}
