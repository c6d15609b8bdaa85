//! MySQL implementation of the courier message bus persistence layer.
//!
//! This crate turns a single MySQL-compatible database into the complete
//! runtime state of the bus: a durable priority queue per logical
//! destination, a distributed exclusive-access lock table, and bindings for
//! the saga / subscription / timeout / data-bus collaborator stores.
//!
//! # Features
//!
//! - Lease-based delivery with `SELECT … FOR UPDATE` row claiming
//! - Priority, deferral (visibility delay), and TTL, all carried in
//!   reserved headers
//! - Optional per-ordering-key single-flight delivery across the fleet
//! - Automatic lease renewal for long-running handlers
//! - Background cleanup of expired rows in ID-bounded batches
//! - Advisory TTL lock table with duplicate-key acquisition semantics
//!
//! # Queue table schema
//!
//! One table per logical queue:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS `queue_name` (
//!     `id` BIGINT NOT NULL AUTO_INCREMENT,
//!     `priority` INT NOT NULL DEFAULT 0,
//!     `visible` DATETIME(6) NOT NULL,
//!     `expiration` DATETIME(6) NOT NULL,
//!     `ordering_key` VARCHAR(200) NULL,
//!     `headers` LONGBLOB NOT NULL,
//!     `body` LONGBLOB NOT NULL,
//!     `leased_until` DATETIME(6) NULL,
//!     `leased_by` VARCHAR(200) NULL,
//!     `leased_at` DATETIME(6) NULL,
//!     PRIMARY KEY (`id`),
//!     KEY `ix_receive` (`priority` DESC, `visible` ASC, `id` ASC, `expiration` ASC, `leased_until` DESC),
//!     KEY `ix_expiration` (`expiration`),
//!     KEY `ix_ordering_key` (`ordering_key`, `leased_until`)
//! )
//! ```
//!
//! A row is deliverable when `visible < NOW(6)`, `expiration > NOW(6)`, and
//! its lease is absent or expired past the configured tolerance. Delivery
//! order is `priority DESC, visible ASC, id ASC`.
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use courier_core::{TransactionScope, Transport};
//! use courier_mysql::{MySqlConnectionOptions, MySqlConnectionProvider,
//!                     MySqlTransport, MySqlTransportOptions};
//!
//! let provider = Arc::new(
//!     MySqlConnectionProvider::connect(MySqlConnectionOptions::new(dsn)).await?,
//! );
//! let transport =
//!     MySqlTransport::new(provider, MySqlTransportOptions::for_queue("work")).await?;
//!
//! let scope = Arc::new(TransactionScope::new());
//! if let Some(message) = transport.receive(&scope, &cancel).await? {
//!     // ... handle ...
//!     scope.complete().await?;
//! }
//! ```

use std::time::Duration;

use courier_core::TransportError;
use sqlx::mysql::MySqlDatabaseError;

pub mod connection;
pub mod lock;
pub mod schema;
pub mod stores;
mod table_name;
pub mod transport;

pub use connection::{
    DbConnection, IsolationLevel, MySqlConnectionOptions, MySqlConnectionProvider,
    COMMAND_SEPARATOR,
};
pub use lock::{MySqlExclusiveLock, MySqlLockOptions};
pub use table_name::TableName;
pub use transport::{MySqlTransport, MySqlTransportOptions};

/// MySQL error numbers this crate reacts to.
pub mod error_codes {
    /// Duplicate key: lock already taken, saga id already inserted.
    pub const ER_DUP_ENTRY: u32 = 1062;
    /// Lock deadlock: the receive race was lost, retry or yield.
    pub const ER_LOCK_DEADLOCK: u32 = 1213;
    /// Database already exists.
    pub const ER_DB_CREATE_EXISTS: u32 = 1007;
    /// Unknown table on DROP.
    pub const ER_BAD_TABLE: u32 = 1051;
    /// Multiple primary keys defined.
    pub const ER_MULTIPLE_PRI_KEY: u32 = 1068;
}

/// The MySQL server error number behind a sqlx error, if there is one.
pub fn mysql_error_number(err: &sqlx::Error) -> Option<u32> {
    err.as_database_error()
        .and_then(|db| db.try_downcast_ref::<MySqlDatabaseError>())
        .map(|mysql| u32::from(mysql.number()))
}

/// Whether a transport error is a MySQL lock deadlock (1213).
pub(crate) fn is_deadlock(err: &TransportError) -> bool {
    let source = match err {
        TransportError::Db(source) => source,
        TransportError::Cancelled(Some(source)) => source,
        _ => return false,
    };
    source
        .downcast_ref::<sqlx::Error>()
        .and_then(mysql_error_number)
        == Some(error_codes::ER_LOCK_DEADLOCK)
}

/// A `std::time::Duration` as whole microseconds for
/// `INTERVAL ? MICROSECOND` arithmetic.
pub(crate) fn as_micros(duration: Duration) -> i64 {
    i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn micros_conversion_saturates() {
        assert_eq!(as_micros(Duration::from_millis(1)), 1_000);
        assert_eq!(as_micros(Duration::MAX), i64::MAX);
    }

    #[test]
    fn non_database_errors_have_no_number() {
        assert_eq!(mysql_error_number(&sqlx::Error::RowNotFound), None);
        assert!(!is_deadlock(&TransportError::SendOnly));
        assert!(!is_deadlock(&TransportError::db(sqlx::Error::RowNotFound)));
    }
}
