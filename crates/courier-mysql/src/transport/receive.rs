//! The lease-based receive path.
//!
//! One receive attempt is one transaction: an index-ordered
//! `SELECT … LIMIT 1 FOR UPDATE` picks the next deliverable row and locks
//! it, a PK-targeted `UPDATE` stamps the lease, and the commit publishes
//! the lease to other workers. Under repeatable read this pair cannot
//! double-lease: a competing receiver either waits on the row lock and then
//! skips the row (its lease is now in the future), or hits a deadlock,
//! which surfaces here as an empty receive so the worker loop just polls
//! again.

use std::sync::Arc;

use courier_core::{
    decode_headers, CancellationToken, TransactionScope, TransportError, TransportMessage,
};
use sqlx::Row;
use tracing::{debug, warn};

use super::MySqlTransport;
use crate::connection::MySqlConnectionProvider;
use crate::table_name::TableName;
use crate::{as_micros, is_deadlock};

struct LeasedMessage {
    id: i64,
    message: TransportMessage,
}

pub(super) async fn receive(
    transport: &MySqlTransport,
    scope: &Arc<TransactionScope>,
    cancel: &CancellationToken,
) -> Result<Option<TransportMessage>, TransportError> {
    let queue = transport.input_queue().ok_or(TransportError::SendOnly)?.clone();

    let _permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(TransportError::Cancelled(None)),
        permit = Arc::clone(transport.receive_gate()).acquire_owned() => {
            permit.expect("receive gate is never closed")
        }
    };

    let attempt = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(TransportError::Cancelled(None)),
        result = lease_next(transport, &queue) => result,
    };

    let leased = match attempt {
        Ok(leased) => leased,
        Err(err) if is_deadlock(&err) => {
            debug!(queue = %queue, "deadlock while leasing; yielding to the competing receiver");
            return Ok(None);
        }
        Err(TransportError::Db(source)) if cancel.is_cancelled() => {
            return Err(TransportError::Cancelled(Some(source)));
        }
        Err(err) => return Err(err),
    };

    Ok(leased.map(|leased| {
        register_settlement(transport, scope, queue, leased.id);
        leased.message
    }))
}

/// Lease the next deliverable row, if any. Runs in its own transaction.
async fn lease_next(
    transport: &MySqlTransport,
    queue: &TableName,
) -> Result<Option<LeasedMessage>, TransportError> {
    let options = transport.options();
    let mut conn = transport.provider().begin().await?;

    let row = sqlx::query(&select_sql(queue, options.ordering_key_enabled))
        .bind(as_micros(options.lease_tolerance))
        .fetch_optional(conn.conn())
        .await
        .map_err(TransportError::db)?;

    let Some(row) = row else {
        conn.complete().await?;
        return Ok(None);
    };

    let id: i64 = row.get("id");
    let headers_blob: Vec<u8> = row.get("headers");
    let body: Vec<u8> = row.get("body");

    let leased_by = clamp_identity((options.leased_by_factory)());
    sqlx::query(&lease_sql(queue))
        .bind(as_micros(options.lease_interval))
        .bind(&leased_by)
        .bind(id)
        .execute(conn.conn())
        .await
        .map_err(TransportError::db)?;

    conn.complete().await?;

    let message = TransportMessage::new(decode_headers(&headers_blob)?, body);
    Ok(Some(LeasedMessage { id, message }))
}

/// Wire the leased row to the scope's outcome: commit deletes it, abort
/// releases the lease for redelivery. Also starts the lease auto-renewer
/// when one is configured; both outcomes stop it.
fn register_settlement(
    transport: &MySqlTransport,
    scope: &Arc<TransactionScope>,
    queue: TableName,
    id: i64,
) {
    let options = transport.options();
    if let Some(renew_interval) = options.lease_auto_renew_interval {
        transport.renewals().start(
            Arc::clone(transport.provider()),
            queue.clone(),
            id,
            renew_interval,
            options.lease_interval,
        );
    }

    let renewals = Arc::clone(transport.renewals());
    let provider = Arc::clone(transport.provider());
    let ack_queue = queue.clone();
    scope.on_committed(move || async move {
        renewals.stop(id);
        ack(provider, ack_queue, id).await;
        Ok(())
    });

    let renewals = Arc::clone(transport.renewals());
    let provider = Arc::clone(transport.provider());
    scope.on_aborted(move || async move {
        renewals.stop(id);
        nack(provider, queue, id).await;
    });
}

/// Delete an acked row. Deadlocks retry until the delete lands; any other
/// error is logged and swallowed — the lease will lapse and the message
/// will be redelivered, which is the at-least-once contract.
async fn ack(provider: Arc<MySqlConnectionProvider>, queue: TableName, id: i64) {
    loop {
        match try_ack(&provider, &queue, id).await {
            Ok(()) => return,
            Err(err) if is_deadlock(&err) => {
                debug!(id, queue = %queue, "deadlock deleting acked message; retrying");
            }
            Err(err) => {
                warn!(
                    id,
                    queue = %queue,
                    error = %err,
                    "failed to delete acked message; it will be redelivered after the lease expires"
                );
                return;
            }
        }
    }
}

async fn try_ack(
    provider: &MySqlConnectionProvider,
    queue: &TableName,
    id: i64,
) -> Result<(), TransportError> {
    let mut conn = provider.begin().await?;
    sqlx::query(&format!("DELETE FROM {} WHERE `id` = ?", queue.qualified()))
        .bind(id)
        .execute(conn.conn())
        .await
        .map_err(TransportError::db)?;
    conn.complete().await
}

/// Clear the lease of a nacked row so it becomes deliverable again
/// immediately instead of after the lease lapses. Same retry policy as
/// [`ack`].
async fn nack(provider: Arc<MySqlConnectionProvider>, queue: TableName, id: i64) {
    loop {
        match try_nack(&provider, &queue, id).await {
            Ok(()) => return,
            Err(err) if is_deadlock(&err) => {
                debug!(id, queue = %queue, "deadlock releasing lease; retrying");
            }
            Err(err) => {
                warn!(
                    id,
                    queue = %queue,
                    error = %err,
                    "failed to release lease; the message becomes deliverable once the lease expires"
                );
                return;
            }
        }
    }
}

async fn try_nack(
    provider: &MySqlConnectionProvider,
    queue: &TableName,
    id: i64,
) -> Result<(), TransportError> {
    let mut conn = provider.begin().await?;
    sqlx::query(&format!(
        "UPDATE {} SET `leased_until` = NULL, `leased_by` = NULL, `leased_at` = NULL WHERE `id` = ?",
        queue.qualified()
    ))
    .bind(id)
    .execute(conn.conn())
    .await
    .map_err(TransportError::db)?;
    conn.complete().await
}

fn select_sql(queue: &TableName, ordering_key_enabled: bool) -> String {
    let table = queue.qualified();
    let ordering_clause = if ordering_key_enabled {
        format!(
            " AND (`m`.`ordering_key` IS NULL OR NOT EXISTS ( \
               SELECT 1 FROM {table} AS `held` \
               WHERE `held`.`ordering_key` = `m`.`ordering_key` \
                 AND `held`.`leased_until` > NOW(6) \
                 AND `held`.`id` <> `m`.`id`))"
        )
    } else {
        String::new()
    };
    format!(
        "SELECT `m`.`id`, `m`.`headers`, `m`.`body` \
         FROM {table} AS `m` \
         WHERE `m`.`visible` < NOW(6) \
           AND `m`.`expiration` > NOW(6) \
           AND (`m`.`leased_until` IS NULL \
                OR DATE_ADD(`m`.`leased_until`, INTERVAL ? MICROSECOND) < NOW(6)){ordering_clause} \
         ORDER BY `m`.`priority` DESC, `m`.`visible` ASC, `m`.`id` ASC \
         LIMIT 1 \
         FOR UPDATE"
    )
}

fn lease_sql(queue: &TableName) -> String {
    format!(
        "UPDATE {} SET \
         `leased_until` = DATE_ADD(NOW(6), INTERVAL ? MICROSECOND), \
         `leased_at` = NOW(6), \
         `leased_by` = ? \
         WHERE `id` = ?",
        queue.qualified()
    )
}

/// Fit a worker identity into the `leased_by` column, respecting UTF-8
/// boundaries.
fn clamp_identity(mut identity: String) -> String {
    const MAX: usize = 200;
    if identity.len() > MAX {
        let mut end = MAX;
        while !identity.is_char_boundary(end) {
            end -= 1;
        }
        identity.truncate(end);
    }
    identity
}
