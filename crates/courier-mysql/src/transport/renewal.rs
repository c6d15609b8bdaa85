//! Automatic lease renewal for in-flight messages.

use std::sync::Arc;
use std::time::Duration;

use courier_core::TransportError;
use dashmap::DashMap;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::as_micros;
use crate::connection::MySqlConnectionProvider;
use crate::table_name::TableName;

/// The set of renewal tasks for messages currently being handled in this
/// process, keyed by row id. Each receive with auto-renewal configured
/// starts one; scope commit/abort stops it.
pub(crate) struct RenewalRegistry {
    active: DashMap<i64, CancellationToken>,
}

impl RenewalRegistry {
    pub(crate) fn new() -> Self {
        Self {
            active: DashMap::new(),
        }
    }

    /// Start renewing the lease on row `id` every `renew_interval`.
    pub(crate) fn start(
        &self,
        provider: Arc<MySqlConnectionProvider>,
        queue: TableName,
        id: i64,
        renew_interval: Duration,
        lease_interval: Duration,
    ) {
        let stop = CancellationToken::new();
        if let Some(previous) = self.active.insert(id, stop.clone()) {
            // Can only happen if a lease expired and the same row was
            // re-received by this process while the old handler still runs.
            warn!(id, "replacing an existing lease renewer");
            previous.cancel();
        }
        tokio::spawn(renew_loop(
            provider,
            queue,
            id,
            renew_interval,
            lease_interval,
            stop,
        ));
    }

    /// Stop the renewer for row `id`, if one is running.
    pub(crate) fn stop(&self, id: i64) {
        if let Some((_, stop)) = self.active.remove(&id) {
            stop.cancel();
        }
    }

    /// Stop all renewers. Used on transport shutdown.
    pub(crate) fn shutdown(&self) {
        for entry in self.active.iter() {
            entry.value().cancel();
        }
        self.active.clear();
    }
}

async fn renew_loop(
    provider: Arc<MySqlConnectionProvider>,
    queue: TableName,
    id: i64,
    renew_interval: Duration,
    lease_interval: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(renew_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the lease was just stamped.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                match renew_once(&provider, &queue, id, lease_interval).await {
                    Ok(()) => debug!(id, queue = %queue, "lease renewed"),
                    // The handler keeps running either way; losing the lease
                    // means the message may be redelivered elsewhere, which
                    // at-least-once delivery permits.
                    Err(err) => warn!(id, queue = %queue, error = %err, "lease renewal failed"),
                }
            }
        }
    }
    debug!(id, queue = %queue, "lease renewal stopped");
}

async fn renew_once(
    provider: &MySqlConnectionProvider,
    queue: &TableName,
    id: i64,
    lease_interval: Duration,
) -> Result<(), TransportError> {
    let mut conn = provider.begin().await?;
    sqlx::query(&format!(
        "UPDATE {} SET `leased_until` = DATE_ADD(NOW(6), INTERVAL ? MICROSECOND) WHERE `id` = ?",
        queue.qualified()
    ))
    .bind(as_micros(lease_interval))
    .bind(id)
    .execute(conn.conn())
    .await
    .map_err(TransportError::db)?;
    conn.complete().await
}
