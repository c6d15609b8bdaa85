//! Persistence collaborator traits: sagas, subscriptions, timeouts, and the
//! data bus.
//!
//! These seams exist so the bus runtime can be wired against any backend
//! that shares a connection provider with the transport. The traits are
//! deliberately policy-light and return `anyhow::Result`; backend-specific
//! conflicts surface as typed errors inside the `anyhow` chain (see
//! [`ConcurrencyError`](crate::error::ConcurrencyError)).

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Durable state of one long-running workflow instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaData {
    /// Stable identity of the saga instance.
    pub id: Uuid,
    /// Optimistic-concurrency revision, starting at 0 and incremented on
    /// every successful update.
    pub revision: i32,
    /// Serialized saga state. Opaque to the store.
    pub data: Vec<u8>,
}

/// One correlation property under which a saga instance can be looked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationProperty {
    /// Property name, e.g. `"order_id"`.
    pub name: String,
    /// Stringified property value.
    pub value: String,
}

/// Store of saga instances with indexed correlation lookup and optimistic
/// concurrency on `revision`.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Find the saga of `saga_type` whose correlation property
    /// `property_name` equals `property_value`.
    async fn find(
        &self,
        saga_type: &str,
        property_name: &str,
        property_value: &str,
    ) -> Result<Option<SagaData>>;

    /// Insert a brand-new saga instance along with its correlation index
    /// entries. Fails if the id is already present.
    async fn insert(
        &self,
        saga_type: &str,
        data: &SagaData,
        correlation: &[CorrelationProperty],
    ) -> Result<()>;

    /// Update an existing saga, bumping its revision. Raises
    /// [`ConcurrencyError`](crate::error::ConcurrencyError) inside the error
    /// chain when the persisted revision does not match `data.revision`.
    async fn update(
        &self,
        saga_type: &str,
        data: &SagaData,
        correlation: &[CorrelationProperty],
    ) -> Result<()>;

    /// Delete a saga and its correlation index entries, subject to the same
    /// revision check as [`update`](Self::update).
    async fn delete(&self, data: &SagaData) -> Result<()>;
}

/// Topic → subscriber-address registry.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Addresses currently subscribed to `topic`.
    async fn subscribers(&self, topic: &str) -> Result<Vec<String>>;

    /// Register `address` as a subscriber of `topic`. Idempotent.
    async fn register(&self, topic: &str, address: &str) -> Result<()>;

    /// Remove the subscription. Idempotent.
    async fn unregister(&self, topic: &str, address: &str) -> Result<()>;

    /// Whether this store is shared by all endpoints, making broker-less
    /// multicast possible.
    fn is_centralized(&self) -> bool;
}

/// A message parked until its due time.
#[derive(Debug, Clone)]
pub struct DueMessage {
    /// Header map of the deferred message.
    pub headers: HashMap<String, String>,
    /// Body of the deferred message.
    pub body: Vec<u8>,
}

/// Store of deferred messages dequeued by due time.
#[async_trait]
pub trait TimeoutStore: Send + Sync {
    /// Park a message until `due_time`.
    async fn defer(
        &self,
        due_time: DateTime<Utc>,
        headers: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<()>;

    /// Atomically remove and return all messages due at or before now.
    async fn due(&self) -> Result<Vec<DueMessage>>;
}

/// Store of large binary attachments referenced from messages by id.
#[async_trait]
pub trait DataBusStore: Send + Sync {
    /// Persist an attachment under `id` with optional metadata.
    async fn save(
        &self,
        id: &str,
        data: &[u8],
        metadata: &HashMap<String, String>,
    ) -> Result<()>;

    /// Read an attachment, updating its last-read time.
    async fn read(&self, id: &str) -> Result<Vec<u8>>;
}
