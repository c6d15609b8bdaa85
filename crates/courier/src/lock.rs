//! Distributed exclusive-access lock contract.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::LockError;

/// An advisory, TTL-bounded distributed lock keyed by caller-chosen strings.
///
/// Used by saga pipelines to serialize concurrent processing of the same
/// saga instance: the key is derived from the saga type plus correlation
/// property, acquired before handling and released after.
///
/// The lock is advisory on two counts: nothing stops a holder that ignores
/// the protocol, and a lock held past its TTL may be reclaimed by the
/// expiry sweeper. Holders must not assume mutual exclusion beyond the TTL.
#[async_trait]
pub trait ExclusiveAccessLock: Send + Sync {
    /// Try to take the lock for `key`. Returns `false` when someone else
    /// holds it. Never blocks waiting for the lock.
    async fn acquire(&self, key: &str, cancel: &CancellationToken) -> Result<bool, LockError>;

    /// Whether `key` is currently locked (by anyone).
    async fn is_held(&self, key: &str) -> Result<bool, LockError>;

    /// Release the lock for `key`. Returns `true` when a lock was actually
    /// released, `false` when none was held.
    async fn release(&self, key: &str) -> Result<bool, LockError>;
}
