//! Periodic cleanup of queue tables: delete TTL-expired rows and, when
//! configured, reclaim abandoned leases.
//!
//! Deletes are ID-targeted in batches of at most 100 rows: the task first
//! collects ids over the expiration index (no locks held on live rows),
//! then deletes exactly those ids by primary key. That keeps the cleanup
//! from ever lock-scanning ranges a concurrent receiver is traversing.

use std::sync::Arc;
use std::time::Duration;

use courier_core::TransportError;
use sqlx::Row;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::as_micros;
use crate::connection::MySqlConnectionProvider;
use crate::table_name::TableName;

/// Hard cap on rows touched per pass.
const SWEEP_BATCH: usize = 100;

pub(super) fn spawn(
    provider: Arc<MySqlConnectionProvider>,
    queue: TableName,
    interval: Duration,
    ack_timeout: Option<Duration>,
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
                    if let Err(err) = sweep(&provider, &queue, ack_timeout).await {
                        warn!(queue = %queue, error = %err, "message cleanup pass failed");
                    }
                }
            }
        }
        debug!(queue = %queue, "message cleanup task stopped");
    })
}

/// One full cleanup cycle: repeat each pass until it affects no rows.
async fn sweep(
    provider: &MySqlConnectionProvider,
    queue: &TableName,
    ack_timeout: Option<Duration>,
) -> Result<(), TransportError> {
    let mut total = 0usize;
    loop {
        let deleted = delete_expired_batch(provider, queue).await?;
        if deleted == 0 {
            break;
        }
        total += deleted;
    }
    if total > 0 {
        debug!(queue = %queue, total, "deleted expired messages");
    }

    if let Some(ack_timeout) = ack_timeout {
        loop {
            let reclaimed = reclaim_stuck_batch(provider, queue, ack_timeout).await?;
            if reclaimed == 0 {
                break;
            }
            warn!(queue = %queue, reclaimed, "reclaimed leases past the ack timeout");
        }
    }
    Ok(())
}

/// Delete up to [`SWEEP_BATCH`] rows whose TTL has passed. Returns how many
/// were deleted.
async fn delete_expired_batch(
    provider: &MySqlConnectionProvider,
    queue: &TableName,
) -> Result<usize, TransportError> {
    let mut conn = provider.begin().await?;
    let ids: Vec<i64> = sqlx::query(&format!(
        "SELECT `id` FROM {} WHERE `expiration` < NOW(6) LIMIT {SWEEP_BATCH}",
        queue.qualified()
    ))
    .fetch_all(conn.conn())
    .await
    .map_err(TransportError::db)?
    .iter()
    .map(|row| row.get::<i64, _>("id"))
    .collect();

    if ids.is_empty() {
        conn.complete().await?;
        return Ok(0);
    }

    sqlx::query(&format!(
        "DELETE FROM {} WHERE `id` IN ({})",
        queue.qualified(),
        id_list(&ids)
    ))
    .execute(conn.conn())
    .await
    .map_err(TransportError::db)?;
    conn.complete().await?;
    Ok(ids.len())
}

/// Clear the lease on up to [`SWEEP_BATCH`] rows that became visible more
/// than `ack_timeout` ago yet still carry a lease. Returns how many were
/// reclaimed.
async fn reclaim_stuck_batch(
    provider: &MySqlConnectionProvider,
    queue: &TableName,
    ack_timeout: Duration,
) -> Result<usize, TransportError> {
    let mut conn = provider.begin().await?;
    let ids: Vec<i64> = sqlx::query(&format!(
        "SELECT `id` FROM {} \
         WHERE `visible` < DATE_SUB(NOW(6), INTERVAL ? MICROSECOND) \
           AND `leased_until` IS NOT NULL \
         LIMIT {SWEEP_BATCH}",
        queue.qualified()
    ))
    .bind(as_micros(ack_timeout))
    .fetch_all(conn.conn())
    .await
    .map_err(TransportError::db)?
    .iter()
    .map(|row| row.get::<i64, _>("id"))
    .collect();

    if ids.is_empty() {
        conn.complete().await?;
        return Ok(0);
    }

    sqlx::query(&format!(
        "UPDATE {} SET `leased_until` = NULL, `leased_by` = NULL, `leased_at` = NULL \
         WHERE `id` IN ({})",
        queue.qualified(),
        id_list(&ids)
    ))
    .execute(conn.conn())
    .await
    .map_err(TransportError::db)?;
    conn.complete().await?;
    Ok(ids.len())
}

/// Render ids as a SQL `IN` list. The ids came out of the table's BIGINT
/// primary key, so splicing them is safe.
fn id_list(ids: &[i64]) -> String {
    ids.iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_list_renders_comma_separated() {
        assert_eq!(id_list(&[1, 2, 30]), "1, 2, 30");
        assert_eq!(id_list(&[42]), "42");
    }
}
