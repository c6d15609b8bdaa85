//! The MySQL transport: one table per queue, polling receivers, lease-based
//! at-least-once delivery.

mod receive;
mod renewal;
mod send;
mod sweeper;

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{TransactionScope, Transport, TransportError, TransportMessage};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connection::MySqlConnectionProvider;
use crate::schema;
use crate::table_name::TableName;

use renewal::RenewalRegistry;

/// Columns every queue table must carry. Used to detect schema drift when
/// the table already exists.
const REQUIRED_COLUMNS: &[&str] = &[
    "id",
    "priority",
    "visible",
    "expiration",
    "headers",
    "body",
    "leased_until",
    "leased_by",
    "leased_at",
];

/// Configuration of a [`MySqlTransport`].
#[derive(Clone)]
pub struct MySqlTransportOptions {
    /// Queue to receive from. `None` makes the transport send-only.
    pub input_queue_name: Option<String>,
    /// Drop the input queue table when the transport shuts down.
    pub auto_delete_queue: bool,
    /// Create the input queue table (and upgrade older ones) on startup.
    pub ensure_tables_are_created: bool,
    /// How long a received message stays leased before another worker may
    /// reclaim it.
    pub lease_interval: Duration,
    /// Grace period past `lease_interval` before reclamation, absorbing
    /// clock skew between workers.
    pub lease_tolerance: Duration,
    /// When set, leases of in-flight messages are re-stamped on this cadence
    /// until the scope settles. Typically about half of `lease_interval`.
    pub lease_auto_renew_interval: Option<Duration>,
    /// Produces the `leased_by` identity recorded on leased rows.
    pub leased_by_factory: Arc<dyn Fn() -> String + Send + Sync>,
    /// When set, the cleanup task also clears leases on rows that became
    /// visible longer ago than this. Meant for deployments running with
    /// very short leases; leave unset to rely on `lease_interval` +
    /// `lease_tolerance` expiry alone.
    pub message_ack_timeout: Option<Duration>,
    /// Cadence of the expired-message cleanup task.
    pub expired_messages_cleanup_interval: Duration,
    /// Enforce per-ordering-key single-flight delivery on the receive path.
    pub ordering_key_enabled: bool,
    /// Cap on simultaneous `receive` calls within this process.
    pub receive_concurrency: usize,
}

impl Default for MySqlTransportOptions {
    fn default() -> Self {
        Self {
            input_queue_name: None,
            auto_delete_queue: false,
            ensure_tables_are_created: true,
            lease_interval: Duration::from_secs(5 * 60),
            lease_tolerance: Duration::from_secs(30),
            lease_auto_renew_interval: None,
            leased_by_factory: Arc::new(default_leased_by),
            message_ack_timeout: None,
            expired_messages_cleanup_interval: Duration::from_secs(20),
            ordering_key_enabled: true,
            receive_concurrency: 20,
        }
    }
}

impl MySqlTransportOptions {
    /// Options for a transport receiving from `input_queue_name`.
    pub fn for_queue(input_queue_name: impl Into<String>) -> Self {
        Self {
            input_queue_name: Some(input_queue_name.into()),
            ..Default::default()
        }
    }
}

impl fmt::Debug for MySqlTransportOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MySqlTransportOptions")
            .field("input_queue_name", &self.input_queue_name)
            .field("auto_delete_queue", &self.auto_delete_queue)
            .field("ensure_tables_are_created", &self.ensure_tables_are_created)
            .field("lease_interval", &self.lease_interval)
            .field("lease_tolerance", &self.lease_tolerance)
            .field("lease_auto_renew_interval", &self.lease_auto_renew_interval)
            .field("message_ack_timeout", &self.message_ack_timeout)
            .field(
                "expired_messages_cleanup_interval",
                &self.expired_messages_cleanup_interval,
            )
            .field("ordering_key_enabled", &self.ordering_key_enabled)
            .field("receive_concurrency", &self.receive_concurrency)
            .finish()
    }
}

fn default_leased_by() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

/// MySQL implementation of [`Transport`].
///
/// See the crate docs for the table layout and delivery model.
pub struct MySqlTransport {
    provider: Arc<MySqlConnectionProvider>,
    options: MySqlTransportOptions,
    input_queue: Option<TableName>,
    address: Option<String>,
    receive_gate: Arc<Semaphore>,
    renewals: Arc<RenewalRegistry>,
    shutdown: CancellationToken,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl MySqlTransport {
    /// Create a transport. When the options name an input queue, its table
    /// is created/upgraded (if `ensure_tables_are_created`) and the cleanup
    /// task is started.
    pub async fn new(
        provider: Arc<MySqlConnectionProvider>,
        options: MySqlTransportOptions,
    ) -> Result<Self, TransportError> {
        let input_queue = options
            .input_queue_name
            .as_deref()
            .map(TableName::parse)
            .transpose()?;
        let address = options.input_queue_name.clone();

        let transport = Self {
            receive_gate: Arc::new(Semaphore::new(options.receive_concurrency)),
            renewals: Arc::new(RenewalRegistry::new()),
            shutdown: CancellationToken::new(),
            cleanup_task: Mutex::new(None),
            provider,
            options,
            input_queue,
            address,
        };

        if let Some(queue) = transport.input_queue.clone() {
            if transport.options.ensure_tables_are_created {
                transport.ensure_table_is_created(&queue).await?;
            }
            let task = sweeper::spawn(
                Arc::clone(&transport.provider),
                queue,
                transport.options.expired_messages_cleanup_interval,
                transport.options.message_ack_timeout,
                transport.shutdown.clone(),
            );
            *transport.cleanup_task.lock().expect("cleanup task mutex poisoned") = Some(task);
        }

        Ok(transport)
    }

    /// Create the queue table for `table` if missing, or additively upgrade
    /// an existing one. Retried once, which settles the race where two
    /// processes create the same queue concurrently.
    pub async fn ensure_table_is_created(&self, table: &TableName) -> Result<(), TransportError> {
        match self.try_ensure_table(table).await {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(table = %table, error = %first, "queue table creation failed; retrying once");
                self.try_ensure_table(table).await
            }
        }
    }

    async fn try_ensure_table(&self, table: &TableName) -> Result<(), TransportError> {
        let mut conn = self.provider.begin().await?;

        let exists = conn.table_names().await?.iter().any(|t| t == table);
        if exists {
            let columns = conn.columns(table.schema(), table.name()).await?;
            for required in REQUIRED_COLUMNS {
                if !columns.contains_key(*required) {
                    return Err(TransportError::SchemaDrift(format!(
                        "{table} exists but lacks column `{required}`"
                    )));
                }
            }
            // Tables from before the ordering-key feature get the column and
            // its index added in place.
            schema::create_column_if_not_exists(&mut conn, table, "ordering_key", "VARCHAR(200) NULL")
                .await?;
            schema::create_index_if_not_exists(
                &mut conn,
                table,
                "ix_ordering_key",
                "`ordering_key`, `leased_until`",
            )
            .await?;
            conn.complete().await?;
            return Ok(());
        }

        info!(table = %table, "creating queue table");
        conn.execute_commands(&queue_table_ddl(table)).await?;
        conn.complete().await?;
        Ok(())
    }

    /// Stop background tasks and, when `auto_delete_queue` is set, drop the
    /// input queue table (retried once).
    pub async fn shutdown(&self) -> Result<(), TransportError> {
        self.shutdown.cancel();
        self.renewals.shutdown();
        let task = self.cleanup_task.lock().expect("cleanup task mutex poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }

        if self.options.auto_delete_queue {
            if let Some(queue) = &self.input_queue {
                if let Err(first) = self.drop_queue(queue).await {
                    warn!(table = %queue, error = %first, "queue drop failed; retrying once");
                    self.drop_queue(queue).await?;
                }
            }
        }
        Ok(())
    }

    async fn drop_queue(&self, table: &TableName) -> Result<(), TransportError> {
        let mut conn = self.provider.begin().await?;
        conn.execute_commands(&format!("DROP TABLE IF EXISTS {}", table.qualified()))
            .await?;
        conn.complete().await
    }

    pub(crate) fn provider(&self) -> &Arc<MySqlConnectionProvider> {
        &self.provider
    }

    pub(crate) fn options(&self) -> &MySqlTransportOptions {
        &self.options
    }

    pub(crate) fn input_queue(&self) -> Option<&TableName> {
        self.input_queue.as_ref()
    }

    pub(crate) fn receive_gate(&self) -> &Arc<Semaphore> {
        &self.receive_gate
    }

    pub(crate) fn renewals(&self) -> &Arc<RenewalRegistry> {
        &self.renewals
    }
}

#[async_trait]
impl Transport for MySqlTransport {
    fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    async fn create_queue(&self, address: &str) -> Result<(), TransportError> {
        let table = TableName::parse(address)?;
        self.ensure_table_is_created(&table).await
    }

    async fn send(
        &self,
        destination: &str,
        message: TransportMessage,
        scope: &Arc<TransactionScope>,
    ) -> Result<(), TransportError> {
        send::send(self, destination, message, scope).await
    }

    async fn receive(
        &self,
        scope: &Arc<TransactionScope>,
        cancel: &courier_core::CancellationToken,
    ) -> Result<Option<TransportMessage>, TransportError> {
        receive::receive(self, scope, cancel).await
    }
}

/// DDL for one queue table, indexes inline. The receive index covers the
/// deliverability predicate and the ORDER BY in one traversal; the
/// expiration index serves the cleanup task's batched scans.
fn queue_table_ddl(table: &TableName) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            `id` BIGINT NOT NULL AUTO_INCREMENT,
            `priority` INT NOT NULL DEFAULT 0,
            `visible` DATETIME(6) NOT NULL,
            `expiration` DATETIME(6) NOT NULL,
            `ordering_key` VARCHAR(200) NULL,
            `headers` LONGBLOB NOT NULL,
            `body` LONGBLOB NOT NULL,
            `leased_until` DATETIME(6) NULL,
            `leased_by` VARCHAR(200) NULL,
            `leased_at` DATETIME(6) NULL,
            PRIMARY KEY (`id`),
            KEY `ix_receive` (`priority` DESC, `visible` ASC, `id` ASC, `expiration` ASC, `leased_until` DESC),
            KEY `ix_expiration` (`expiration`),
            KEY `ix_ordering_key` (`ordering_key`, `leased_until`)
        )
        "#,
        table.qualified()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddl_contains_required_columns_and_indexes() {
        let ddl = queue_table_ddl(&TableName::parse("bus.q1").unwrap());
        assert!(ddl.trim_start().starts_with("CREATE TABLE IF NOT EXISTS `bus`.`q1`"));
        for column in REQUIRED_COLUMNS {
            assert!(ddl.contains(&format!("`{column}`")), "missing {column}");
        }
        assert!(ddl.contains("KEY `ix_receive` (`priority` DESC, `visible` ASC, `id` ASC"));
        assert!(ddl.contains("KEY `ix_expiration` (`expiration`)"));
        assert!(ddl.contains("KEY `ix_ordering_key`"));
    }

    #[test]
    fn default_options_match_documented_values() {
        let options = MySqlTransportOptions::default();
        assert_eq!(options.lease_interval, Duration::from_secs(300));
        assert_eq!(options.lease_tolerance, Duration::from_secs(30));
        assert_eq!(options.message_ack_timeout, None);
        assert_eq!(
            options.expired_messages_cleanup_interval,
            Duration::from_secs(20)
        );
        assert_eq!(options.receive_concurrency, 20);
        assert!(options.lease_auto_renew_interval.is_none());
        assert!(!(options.leased_by_factory)().contains('\0'));
    }

}
