//! Per-operation transaction scope.
//!
//! A [`TransactionScope`] is the unit of atomicity the bus hands to
//! transports and handlers: a key/value item bag plus ordered lists of
//! commit, abort, and dispose callbacks. Transports use it to defer work
//! until the outcome of the surrounding operation is known — outgoing
//! messages are buffered in the item bag and flushed by an on-commit
//! callback, and a received message registers its ack (delete) and nack
//! (release lease) there.
//!
//! Completion is explicit and idempotent: call [`TransactionScope::complete`]
//! to commit, [`TransactionScope::abort`] to roll back. Dropping a scope
//! that was never completed counts as an abort; since `Drop` cannot await,
//! the abort callbacks are spawned onto the runtime on a best-effort basis.

use std::any::Any;
use std::future::Future;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use futures::future::BoxFuture;
use tracing::{debug, warn};

type CommitCallback = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;
type AbortCallback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;
type DisposeCallback = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Pending,
    Committed,
    Aborted,
}

/// Transaction context carried through one send/receive/handle operation.
///
/// Shared by `Arc`; all methods take `&self`.
pub struct TransactionScope {
    items: DashMap<String, Arc<dyn Any + Send + Sync>>,
    on_committed: Mutex<Vec<CommitCallback>>,
    on_aborted: Mutex<Vec<AbortCallback>>,
    on_disposed: Mutex<Vec<DisposeCallback>>,
    outcome: Mutex<Outcome>,
}

impl Default for TransactionScope {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionScope {
    /// Create a fresh, pending scope.
    pub fn new() -> Self {
        Self {
            items: DashMap::new(),
            on_committed: Mutex::new(Vec::new()),
            on_aborted: Mutex::new(Vec::new()),
            on_disposed: Mutex::new(Vec::new()),
            outcome: Mutex::new(Outcome::Pending),
        }
    }

    /// Fetch a typed item previously stored under `key`.
    pub fn get_item<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        let entry = self.items.get(key)?;
        Arc::clone(entry.value()).downcast::<T>().ok()
    }

    /// Fetch the item under `key`, inserting `init()` if absent.
    ///
    /// This is how transports attach lazily-created per-scope state such as
    /// an outgoing message buffer.
    pub fn get_or_insert_item_with<T, F>(&self, key: &str, init: F) -> Arc<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        let entry = self
            .items
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(init()) as Arc<dyn Any + Send + Sync>);
        Arc::clone(entry.value())
            .downcast::<T>()
            .unwrap_or_else(|_| panic!("scope item {key:?} registered with a different type"))
    }

    /// Register a callback to run when the scope commits.
    ///
    /// Callbacks run in registration order inside [`complete`](Self::complete);
    /// the first failure aborts completion.
    pub fn on_committed<F, Fut>(&self, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_committed
            .lock()
            .expect("scope mutex poisoned")
            .push(Box::new(move || Box::pin(callback())));
    }

    /// Register a callback to run when the scope aborts.
    ///
    /// Abort callbacks are infallible by contract: they must handle their
    /// own errors (typically by logging), because an abort path has no one
    /// left to report to.
    pub fn on_aborted<F, Fut>(&self, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_aborted
            .lock()
            .expect("scope mutex poisoned")
            .push(Box::new(move || Box::pin(callback())));
    }

    /// Register a synchronous callback to run when the scope is dropped,
    /// regardless of outcome.
    pub fn on_disposed<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_disposed
            .lock()
            .expect("scope mutex poisoned")
            .push(Box::new(callback));
    }

    /// Commit the scope: run all commit callbacks in registration order.
    ///
    /// On the first callback failure the scope flips to aborted, the abort
    /// callbacks run, and the error is returned. Calling `complete` on an
    /// already-settled scope is a no-op.
    pub async fn complete(&self) -> anyhow::Result<()> {
        {
            let outcome = self.outcome.lock().expect("scope mutex poisoned");
            if *outcome != Outcome::Pending {
                debug!(?outcome, "scope already settled; complete() is a no-op");
                return Ok(());
            }
        }

        let callbacks: Vec<CommitCallback> =
            std::mem::take(&mut *self.on_committed.lock().expect("scope mutex poisoned"));
        for callback in callbacks {
            if let Err(err) = callback().await {
                *self.outcome.lock().expect("scope mutex poisoned") = Outcome::Aborted;
                self.run_abort_callbacks().await;
                return Err(err);
            }
        }

        *self.outcome.lock().expect("scope mutex poisoned") = Outcome::Committed;
        Ok(())
    }

    /// Abort the scope: run all abort callbacks. Idempotent.
    pub async fn abort(&self) {
        {
            let mut outcome = self.outcome.lock().expect("scope mutex poisoned");
            if *outcome != Outcome::Pending {
                return;
            }
            *outcome = Outcome::Aborted;
        }
        self.run_abort_callbacks().await;
    }

    async fn run_abort_callbacks(&self) {
        let callbacks: Vec<AbortCallback> =
            std::mem::take(&mut *self.on_aborted.lock().expect("scope mutex poisoned"));
        for callback in callbacks {
            callback().await;
        }
    }

    fn is_pending(&self) -> bool {
        *self.outcome.lock().expect("scope mutex poisoned") == Outcome::Pending
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if self.is_pending() {
            *self.outcome.lock().expect("scope mutex poisoned") = Outcome::Aborted;
            let callbacks: Vec<AbortCallback> =
                std::mem::take(&mut *self.on_aborted.lock().expect("scope mutex poisoned"));
            if !callbacks.is_empty() {
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            for callback in callbacks {
                                callback().await;
                            }
                        });
                    }
                    Err(_) => warn!(
                        callbacks = callbacks.len(),
                        "scope dropped outside a runtime; abort callbacks skipped"
                    ),
                }
            }
        }

        let disposed: Vec<DisposeCallback> =
            std::mem::take(&mut *self.on_disposed.lock().expect("scope mutex poisoned"));
        for callback in disposed {
            callback();
        }
    }
}

impl std::fmt::Debug for TransactionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionScope")
            .field("items", &self.items.len())
            .field("outcome", &*self.outcome.lock().expect("scope mutex poisoned"))
            .finish()
    }
}
