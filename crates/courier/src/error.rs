//! Error taxonomy shared by transports, locks, and the persistence stores.

use std::error::Error as StdError;

use thiserror::Error;

/// Boxed source error, usually a database driver error.
pub type BoxedError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors surfaced by [`Transport`](crate::Transport) implementations.
///
/// The split matters to callers:
///
/// - [`TransportError::MalformedMessage`] and [`TransportError::SchemaDrift`]
///   are fatal for the offending message or queue. Retrying does not help.
/// - [`TransportError::Cancelled`] means the caller's cancellation token
///   fired mid-operation; nothing was leased or sent.
/// - [`TransportError::Db`] is an infrastructure failure and should bubble
///   up to the worker loop's backoff handling.
///
/// Transient lock conflicts never reach the caller: a receive that loses a
/// row race returns `Ok(None)` instead.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A reserved header carried a value the transport cannot interpret,
    /// e.g. a non-integer priority or a deferral without a recipient.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The operation was cancelled by the caller's token.
    #[error("operation cancelled")]
    Cancelled(#[source] Option<BoxedError>),

    /// A queue table exists but does not have the expected shape.
    #[error("schema mismatch for `{0}`")]
    SchemaDrift(String),

    /// `receive` was called on a transport configured without an input
    /// queue.
    #[error("transport is send-only (no input queue configured)")]
    SendOnly,

    /// Any other database failure.
    #[error("database operation failed")]
    Db(#[source] BoxedError),
}

impl TransportError {
    /// Wrap a driver error as a [`TransportError::Db`].
    pub fn db(err: impl StdError + Send + Sync + 'static) -> Self {
        TransportError::Db(Box::new(err))
    }

    /// Wrap a driver error observed while the caller's token was cancelled.
    pub fn cancelled(err: impl StdError + Send + Sync + 'static) -> Self {
        TransportError::Cancelled(Some(Box::new(err)))
    }
}

/// Errors surfaced by [`ExclusiveAccessLock`](crate::ExclusiveAccessLock)
/// implementations. A contended lock is not an error: `acquire` returns
/// `Ok(false)`.
#[derive(Debug, Error)]
pub enum LockError {
    /// The operation was cancelled by the caller's token.
    #[error("lock operation cancelled")]
    Cancelled,

    /// Any database failure.
    #[error("lock operation failed")]
    Db(#[source] BoxedError),
}

impl LockError {
    /// Wrap a driver error as a [`LockError::Db`].
    pub fn db(err: impl StdError + Send + Sync + 'static) -> Self {
        LockError::Db(Box::new(err))
    }
}

/// Optimistic-concurrency conflict raised by saga stores when the persisted
/// revision no longer matches the revision the update was based on.
///
/// Callers typically reload the saga data and re-run the handler.
#[derive(Debug, Error)]
#[error("saga {saga_id} was updated concurrently (expected revision {expected_revision})")]
pub struct ConcurrencyError {
    /// The saga whose update lost the race.
    pub saga_id: uuid::Uuid,
    /// The revision the failed update was based on.
    pub expected_revision: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_errors_keep_their_source() {
        let err = TransportError::db(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "no route to host",
        ));
        let source = StdError::source(&err).expect("source preserved");
        assert!(source.to_string().contains("no route to host"));
    }

    #[test]
    fn cancellation_without_source_displays() {
        let err = TransportError::Cancelled(None);
        assert_eq!(err.to_string(), "operation cancelled");
        assert!(StdError::source(&err).is_none());
    }
}
