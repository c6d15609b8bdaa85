//! The transport contract.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::message::TransportMessage;
use crate::scope::TransactionScope;

/// A durable message transport.
///
/// Implementations move [`TransportMessage`]s between named queues with
/// at-least-once delivery. Both `send` and `receive` are transactional
/// against the passed-in [`TransactionScope`]:
///
/// - `send` never writes immediately; messages are buffered on the scope
///   and flushed atomically when the scope commits.
/// - a message returned by `receive` is acked (removed) when the scope
///   commits and nacked (made redeliverable) when it aborts.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The queue this transport receives from, or `None` for a send-only
    /// transport.
    fn address(&self) -> Option<&str>;

    /// Create the queue named `address` if it does not already exist.
    /// Safe to call concurrently from multiple processes.
    async fn create_queue(&self, address: &str) -> Result<(), TransportError>;

    /// Buffer `message` for delivery to `destination` when `scope` commits.
    ///
    /// Fails fast with [`TransportError::MalformedMessage`] when a reserved
    /// header cannot be interpreted; nothing is buffered in that case.
    async fn send(
        &self,
        destination: &str,
        message: TransportMessage,
        scope: &Arc<TransactionScope>,
    ) -> Result<(), TransportError>;

    /// Lease the next deliverable message from the input queue, or `None`
    /// when the queue is momentarily empty (or a row race was lost and the
    /// caller should simply poll again).
    async fn receive(
        &self,
        scope: &Arc<TransactionScope>,
        cancel: &CancellationToken,
    ) -> Result<Option<TransportMessage>, TransportError>;
}
