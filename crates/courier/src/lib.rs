//! # Courier core
//!
//! Backend-agnostic contracts of the courier message bus: what a transport
//! is, how transactional scopes work, and which persistence collaborators
//! the bus runtime expects.
//!
//! ## Core concepts
//!
//! Courier separates **delivery** from **handling**:
//! - [`TransportMessage`] = an opaque payload plus a reserved-header map
//! - [`TransactionScope`] = the atomicity boundary of one operation
//! - [`Transport`] = durable queues with at-least-once delivery
//!
//! The key principle: **nothing observable happens until the scope
//! commits**. Sends are buffered, receives are leased, and the commit of
//! the scope is the single point where the world changes.
//!
//! ## Architecture
//!
//! ```text
//! Producer                              Worker loop
//!     │ send(dest, msg, scope)              │ receive(scope)
//!     ▼                                     ▼
//! TransactionScope ──────────────── TransactionScope
//!     │ buffer msg                          │ lease row
//!     │                                     │
//!     ▼ scope.complete()                    ▼ scope.complete() / abort()
//! flush batch INSERT                 DELETE row / clear lease
//! ```
//!
//! ## Key invariants
//!
//! 1. **Scope atomicity** — all messages sent in a scope appear together,
//!    or not at all
//! 2. **At-least-once** — a leased message is either acked or becomes
//!    redeliverable once its lease expires
//! 3. **Ordering-key serialization** — messages sharing an ordering key are
//!    processed one at a time across the fleet
//!
//! Concrete backends live in sibling crates (e.g. `courier-mysql`) and plug
//! in through the traits re-exported here.

// Core modules
mod error;
mod lock;
mod message;
mod scope;
mod transport;

// Persistence collaborator seams
pub mod stores;

// Re-export error types
pub use crate::error::{BoxedError, ConcurrencyError, LockError, TransportError};

// Re-export message types and the reserved header protocol
pub use crate::message::{
    decode_headers, encode_headers, headers, TransportMessage, MAGIC_DEFERRAL_ADDRESS,
};

// Re-export scope types
pub use crate::scope::TransactionScope;

// Re-export the transport contract
pub use crate::transport::Transport;

// Re-export the distributed lock contract
pub use crate::lock::ExclusiveAccessLock;

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
