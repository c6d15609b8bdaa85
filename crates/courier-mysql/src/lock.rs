//! Distributed exclusive-access lock backed by one MySQL table.
//!
//! Acquisition is INSERT-or-fail: a probing SELECT answers the common
//! already-held case cheaply, and the duplicate-key error (1062) on the
//! INSERT settles the race when two processes probe at the same moment.
//! Locks released on the normal path are deleted explicitly; a background
//! sweeper deletes rows whose TTL lapsed so a crashed holder cannot wedge
//! its keys forever.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{CancellationToken, ExclusiveAccessLock, LockError};
use sqlx::Row;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::connection::MySqlConnectionProvider;
use crate::table_name::TableName;
use crate::{as_micros, error_codes, mysql_error_number};

/// Most expired locks deleted per sweep.
const SWEEP_BATCH: usize = 100;

/// Configuration of a [`MySqlExclusiveLock`].
#[derive(Debug, Clone)]
pub struct MySqlLockOptions {
    /// Table holding the locks. One table per lock service.
    pub table_name: String,
    /// Auto-release deadline stamped on acquisition. Holders release
    /// explicitly on the normal path; the TTL only catches crashed holders.
    pub lock_ttl: Duration,
    /// Cadence of the expired-lock sweeper.
    pub sweep_interval: Duration,
    /// Create the lock table on service start.
    pub ensure_table_is_created: bool,
}

impl Default for MySqlLockOptions {
    fn default() -> Self {
        Self {
            table_name: "locks".to_string(),
            lock_ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            ensure_table_is_created: true,
        }
    }
}

/// Advisory lock service over a `(lock_key, expiration)` table.
pub struct MySqlExclusiveLock {
    provider: Arc<MySqlConnectionProvider>,
    table: TableName,
    lock_ttl: Duration,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MySqlExclusiveLock {
    /// Create the lock service, creating its table if configured, and start
    /// the expired-lock sweeper.
    pub async fn new(
        provider: Arc<MySqlConnectionProvider>,
        options: MySqlLockOptions,
    ) -> Result<Self, LockError> {
        let table = TableName::parse(&options.table_name).map_err(LockError::db)?;

        if options.ensure_table_is_created {
            let mut conn = provider.begin().await.map_err(LockError::db)?;
            conn.execute_commands(&lock_table_ddl(&table))
                .await
                .map_err(LockError::db)?;
            conn.complete().await.map_err(LockError::db)?;
            info!(table = %table, "lock table ready");
        }

        let shutdown = CancellationToken::new();
        let sweeper = spawn_sweeper(
            Arc::clone(&provider),
            table.clone(),
            options.sweep_interval,
            shutdown.clone(),
        );

        Ok(Self {
            provider,
            table,
            lock_ttl: options.lock_ttl,
            shutdown,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// Stop the sweeper.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let sweeper = self.sweeper.lock().expect("sweeper mutex poisoned").take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
    }

    async fn try_acquire(&self, key: &str) -> Result<bool, LockError> {
        let mut conn = self.provider.begin().await.map_err(LockError::db)?;

        let held = sqlx::query(&format!(
            "SELECT `lock_key` FROM {} WHERE `lock_key` = ?",
            self.table.qualified()
        ))
        .bind(key)
        .fetch_optional(conn.conn())
        .await
        .map_err(LockError::db)?;
        if held.is_some() {
            conn.complete().await.map_err(LockError::db)?;
            return Ok(false);
        }

        let inserted = sqlx::query(&format!(
            "INSERT INTO {} (`lock_key`, `expiration`) \
             VALUES (?, DATE_ADD(NOW(6), INTERVAL ? MICROSECOND))",
            self.table.qualified()
        ))
        .bind(key)
        .bind(as_micros(self.lock_ttl))
        .execute(conn.conn())
        .await;

        match inserted {
            Ok(_) => {
                conn.complete().await.map_err(LockError::db)?;
                debug!(key, "lock acquired");
                Ok(true)
            }
            // Lost the race between the probe and the insert.
            Err(err) if mysql_error_number(&err) == Some(error_codes::ER_DUP_ENTRY) => Ok(false),
            Err(err) => Err(LockError::db(err)),
        }
    }
}

#[async_trait]
impl ExclusiveAccessLock for MySqlExclusiveLock {
    async fn acquire(&self, key: &str, cancel: &CancellationToken) -> Result<bool, LockError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LockError::Cancelled),
            acquired = self.try_acquire(key) => acquired,
        }
    }

    async fn is_held(&self, key: &str) -> Result<bool, LockError> {
        let mut conn = self.provider.begin().await.map_err(LockError::db)?;
        let row = sqlx::query(&format!(
            "SELECT `lock_key` FROM {} WHERE `lock_key` = ?",
            self.table.qualified()
        ))
        .bind(key)
        .fetch_optional(conn.conn())
        .await
        .map_err(LockError::db)?;
        conn.complete().await.map_err(LockError::db)?;
        Ok(row.is_some())
    }

    async fn release(&self, key: &str) -> Result<bool, LockError> {
        let mut conn = self.provider.begin().await.map_err(LockError::db)?;
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE `lock_key` = ?",
            self.table.qualified()
        ))
        .bind(key)
        .execute(conn.conn())
        .await
        .map_err(LockError::db)?;
        conn.complete().await.map_err(LockError::db)?;
        Ok(result.rows_affected() == 1)
    }
}

fn lock_table_ddl(table: &TableName) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            `lock_key` VARCHAR(255) NOT NULL,
            `expiration` DATETIME(6) NOT NULL,
            PRIMARY KEY (`lock_key`),
            KEY `ix_expiration` (`expiration`)
        )
        "#,
        table.qualified()
    )
}

fn spawn_sweeper(
    provider: Arc<MySqlConnectionProvider>,
    table: TableName,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match sweep_expired(&provider, &table).await {
                        Ok(0) => {}
                        Ok(released) => info!(table = %table, released, "released expired locks"),
                        Err(err) => warn!(table = %table, error = %err, "expired-lock sweep failed"),
                    }
                }
            }
        }
        debug!(table = %table, "lock sweeper stopped");
    })
}

/// Delete up to [`SWEEP_BATCH`] locks whose TTL has lapsed. Returns how
/// many were deleted.
async fn sweep_expired(
    provider: &MySqlConnectionProvider,
    table: &TableName,
) -> Result<usize, LockError> {
    let mut conn = provider.begin().await.map_err(LockError::db)?;
    let keys: Vec<String> = sqlx::query(&format!(
        "SELECT `lock_key` FROM {} WHERE `expiration` < NOW(6) LIMIT {SWEEP_BATCH}",
        table.qualified()
    ))
    .fetch_all(conn.conn())
    .await
    .map_err(LockError::db)?
    .iter()
    .map(|row| row.get::<String, _>("lock_key"))
    .collect();

    if keys.is_empty() {
        conn.complete().await.map_err(LockError::db)?;
        return Ok(0);
    }

    let placeholders = vec!["?"; keys.len()].join(", ");
    let delete_sql = format!(
        "DELETE FROM {} WHERE `lock_key` IN ({placeholders})",
        table.qualified()
    );
    let mut delete = sqlx::query(&delete_sql);
    for key in &keys {
        delete = delete.bind(key);
    }
    delete
        .execute(conn.conn())
        .await
        .map_err(LockError::db)?;
    conn.complete().await.map_err(LockError::db)?;
    Ok(keys.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_documented_values() {
        let options = MySqlLockOptions::default();
        assert_eq!(options.table_name, "locks");
        assert_eq!(options.lock_ttl, Duration::from_secs(86_400));
        assert_eq!(options.sweep_interval, Duration::from_secs(300));
        assert!(options.ensure_table_is_created);
    }

    #[test]
    fn ddl_declares_key_and_expiration() {
        let ddl = lock_table_ddl(&TableName::new("locks"));
        assert!(ddl.contains("`lock_key` VARCHAR(255) NOT NULL"));
        assert!(ddl.contains("PRIMARY KEY (`lock_key`)"));
        assert!(ddl.contains("KEY `ix_expiration` (`expiration`)"));
    }
}
