//! MySQL bindings of the persistence collaborator stores.
//!
//! All four stores ride the same [`MySqlConnectionProvider`] as the
//! transport. They are intentionally thin: the interesting concurrency
//! lives in the transport and the lock service, while these stores are
//! straight-line SQL with one twist each — optimistic concurrency for
//! sagas, column-width discovery for subscriptions, `FOR UPDATE` dequeue
//! for timeouts.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::stores::{
    CorrelationProperty, DataBusStore, DueMessage, SagaData, SagaStore, SubscriptionStore,
    TimeoutStore,
};
use courier_core::{decode_headers, encode_headers, ConcurrencyError};
use sqlx::Row;
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::connection::MySqlConnectionProvider;
use crate::table_name::TableName;

/// Width limits of the saga correlation index columns.
const SAGA_TYPE_MAX: usize = 40;
const CORRELATION_KEY_MAX: usize = 200;
const CORRELATION_VALUE_MAX: usize = 200;

/// Saga store over a data table and a correlation index table.
pub struct MySqlSagaStore {
    provider: Arc<MySqlConnectionProvider>,
    data_table: TableName,
    index_table: TableName,
}

impl MySqlSagaStore {
    /// Create a store over `data_table` and `index_table`.
    pub fn new(
        provider: Arc<MySqlConnectionProvider>,
        data_table: &str,
        index_table: &str,
    ) -> Result<Self> {
        Ok(Self {
            provider,
            data_table: TableName::parse(data_table)?,
            index_table: TableName::parse(index_table)?,
        })
    }

    /// Create both tables if missing.
    pub async fn ensure_tables_are_created(&self) -> Result<()> {
        let mut conn = self.provider.begin().await?;
        conn.execute_commands(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {data} (
                `id` CHAR(36) NOT NULL,
                `revision` INT NOT NULL,
                `data` LONGBLOB NOT NULL,
                PRIMARY KEY (`id`)
            )
            ----
            CREATE TABLE IF NOT EXISTS {index} (
                `saga_type` VARCHAR({SAGA_TYPE_MAX}) NOT NULL,
                `key` VARCHAR({CORRELATION_KEY_MAX}) NOT NULL,
                `value` VARCHAR({CORRELATION_VALUE_MAX}) NOT NULL,
                `saga_id` CHAR(36) NOT NULL,
                PRIMARY KEY (`saga_type`, `key`, `value`, `saga_id`),
                KEY `ix_saga_id` (`saga_id`)
            )
            "#,
            data = self.data_table.qualified(),
            index = self.index_table.qualified(),
        ))
        .await?;
        conn.complete().await?;
        Ok(())
    }

    fn check_widths(saga_type: &str, correlation: &[CorrelationProperty]) -> Result<()> {
        if saga_type.len() > SAGA_TYPE_MAX {
            bail!("saga type {saga_type:?} exceeds {SAGA_TYPE_MAX} characters");
        }
        for property in correlation {
            if property.name.len() > CORRELATION_KEY_MAX {
                bail!("correlation property name {:?} exceeds {CORRELATION_KEY_MAX} characters", property.name);
            }
            if property.value.len() > CORRELATION_VALUE_MAX {
                bail!("correlation value for {:?} exceeds {CORRELATION_VALUE_MAX} characters", property.name);
            }
        }
        Ok(())
    }

    async fn replace_index(
        &self,
        conn: &mut crate::connection::DbConnection,
        saga_type: &str,
        saga_id: Uuid,
        correlation: &[CorrelationProperty],
    ) -> Result<()> {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE `saga_id` = ?",
            self.index_table.qualified()
        ))
        .bind(saga_id.to_string())
        .execute(conn.conn())
        .await?;

        for property in correlation {
            sqlx::query(&format!(
                "INSERT INTO {} (`saga_type`, `key`, `value`, `saga_id`) VALUES (?, ?, ?, ?)",
                self.index_table.qualified()
            ))
            .bind(saga_type)
            .bind(&property.name)
            .bind(&property.value)
            .bind(saga_id.to_string())
            .execute(conn.conn())
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SagaStore for MySqlSagaStore {
    async fn find(
        &self,
        saga_type: &str,
        property_name: &str,
        property_value: &str,
    ) -> Result<Option<SagaData>> {
        let mut conn = self.provider.begin().await?;

        // Correlating on the saga id itself skips the index table.
        let row = if property_name.eq_ignore_ascii_case("id") {
            sqlx::query(&format!(
                "SELECT `id`, `revision`, `data` FROM {} WHERE `id` = ?",
                self.data_table.qualified()
            ))
            .bind(property_value)
            .fetch_optional(conn.conn())
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT `d`.`id`, `d`.`revision`, `d`.`data` \
                 FROM {data} AS `d` \
                 JOIN {index} AS `i` ON `i`.`saga_id` = `d`.`id` \
                 WHERE `i`.`saga_type` = ? AND `i`.`key` = ? AND `i`.`value` = ?",
                data = self.data_table.qualified(),
                index = self.index_table.qualified(),
            ))
            .bind(saga_type)
            .bind(property_name)
            .bind(property_value)
            .fetch_optional(conn.conn())
            .await?
        };
        conn.complete().await?;

        row.map(|row| {
            let id: String = row.get("id");
            Ok(SagaData {
                id: Uuid::parse_str(&id).context("saga id is not a UUID")?,
                revision: row.get("revision"),
                data: row.get("data"),
            })
        })
        .transpose()
    }

    async fn insert(
        &self,
        saga_type: &str,
        data: &SagaData,
        correlation: &[CorrelationProperty],
    ) -> Result<()> {
        Self::check_widths(saga_type, correlation)?;
        let mut conn = self.provider.begin().await?;

        let inserted = sqlx::query(&format!(
            "INSERT INTO {} (`id`, `revision`, `data`) VALUES (?, ?, ?)",
            self.data_table.qualified()
        ))
        .bind(data.id.to_string())
        .bind(data.revision)
        .bind(&data.data)
        .execute(conn.conn())
        .await;

        if let Err(err) = inserted {
            if crate::mysql_error_number(&err) == Some(crate::error_codes::ER_DUP_ENTRY) {
                return Err(ConcurrencyError {
                    saga_id: data.id,
                    expected_revision: data.revision,
                }
                .into());
            }
            return Err(err.into());
        }

        self.replace_index(&mut conn, saga_type, data.id, correlation)
            .await?;
        conn.complete().await?;
        Ok(())
    }

    async fn update(
        &self,
        saga_type: &str,
        data: &SagaData,
        correlation: &[CorrelationProperty],
    ) -> Result<()> {
        Self::check_widths(saga_type, correlation)?;
        let mut conn = self.provider.begin().await?;

        let updated = sqlx::query(&format!(
            "UPDATE {} SET `revision` = ?, `data` = ? WHERE `id` = ? AND `revision` = ?",
            self.data_table.qualified()
        ))
        .bind(data.revision + 1)
        .bind(&data.data)
        .bind(data.id.to_string())
        .bind(data.revision)
        .execute(conn.conn())
        .await?;

        if updated.rows_affected() == 0 {
            return Err(ConcurrencyError {
                saga_id: data.id,
                expected_revision: data.revision,
            }
            .into());
        }

        self.replace_index(&mut conn, saga_type, data.id, correlation)
            .await?;
        conn.complete().await?;
        Ok(())
    }

    async fn delete(&self, data: &SagaData) -> Result<()> {
        let mut conn = self.provider.begin().await?;

        let deleted = sqlx::query(&format!(
            "DELETE FROM {} WHERE `id` = ? AND `revision` = ?",
            self.data_table.qualified()
        ))
        .bind(data.id.to_string())
        .bind(data.revision)
        .execute(conn.conn())
        .await?;
        if deleted.rows_affected() == 0 {
            return Err(ConcurrencyError {
                saga_id: data.id,
                expected_revision: data.revision,
            }
            .into());
        }

        sqlx::query(&format!(
            "DELETE FROM {} WHERE `saga_id` = ?",
            self.index_table.qualified()
        ))
        .bind(data.id.to_string())
        .execute(conn.conn())
        .await?;
        conn.complete().await?;
        Ok(())
    }
}

/// Subscription registry over a `(topic, address)` table.
pub struct MySqlSubscriptionStore {
    provider: Arc<MySqlConnectionProvider>,
    table: TableName,
    centralized: bool,
    /// `(topic, address)` column widths, discovered on first use.
    widths: OnceCell<(usize, usize)>,
}

impl MySqlSubscriptionStore {
    /// Create a store over `table`. `centralized` declares whether all
    /// endpoints share this database.
    pub fn new(
        provider: Arc<MySqlConnectionProvider>,
        table: &str,
        centralized: bool,
    ) -> Result<Self> {
        Ok(Self {
            provider,
            table: TableName::parse(table)?,
            centralized,
            widths: OnceCell::new(),
        })
    }

    /// Create the table if missing.
    pub async fn ensure_table_is_created(&self) -> Result<()> {
        let mut conn = self.provider.begin().await?;
        conn.execute_commands(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                `topic` VARCHAR(200) NOT NULL,
                `address` VARCHAR(200) NOT NULL,
                PRIMARY KEY (`topic`, `address`)
            )
            "#,
            self.table.qualified()
        ))
        .await?;
        conn.complete().await?;
        Ok(())
    }

    async fn widths(&self) -> Result<(usize, usize)> {
        self.widths
            .get_or_try_init(|| async {
                let mut conn = self.provider.begin().await?;
                let rows = sqlx::query(
                    "SELECT COLUMN_NAME, \
                            CAST(CHARACTER_MAXIMUM_LENGTH AS SIGNED) AS CHARACTER_MAXIMUM_LENGTH \
                     FROM INFORMATION_SCHEMA.COLUMNS \
                     WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_NAME = ?",
                )
                .bind(self.table.schema())
                .bind(self.table.name())
                .fetch_all(conn.conn())
                .await?;
                conn.complete().await?;

                let mut topic = 0usize;
                let mut address = 0usize;
                for row in rows {
                    let column: String = row.get("COLUMN_NAME");
                    let length: Option<i64> = row.get("CHARACTER_MAXIMUM_LENGTH");
                    match (column.to_lowercase().as_str(), length) {
                        ("topic", Some(length)) => topic = length as usize,
                        ("address", Some(length)) => address = length as usize,
                        _ => {}
                    }
                }
                if topic == 0 || address == 0 {
                    bail!("table {} lacks topic/address columns", self.table);
                }
                Ok((topic, address))
            })
            .await
            .copied()
    }
}

#[async_trait]
impl SubscriptionStore for MySqlSubscriptionStore {
    async fn subscribers(&self, topic: &str) -> Result<Vec<String>> {
        let mut conn = self.provider.begin().await?;
        let rows = sqlx::query(&format!(
            "SELECT `address` FROM {} WHERE `topic` = ?",
            self.table.qualified()
        ))
        .bind(topic)
        .fetch_all(conn.conn())
        .await?;
        conn.complete().await?;
        Ok(rows.iter().map(|row| row.get("address")).collect())
    }

    async fn register(&self, topic: &str, address: &str) -> Result<()> {
        let (topic_max, address_max) = self.widths().await?;
        if topic.len() > topic_max {
            bail!("topic {topic:?} exceeds the column width of {topic_max}");
        }
        if address.len() > address_max {
            bail!("address {address:?} exceeds the column width of {address_max}");
        }

        let mut conn = self.provider.begin().await?;
        sqlx::query(&format!(
            "INSERT IGNORE INTO {} (`topic`, `address`) VALUES (?, ?)",
            self.table.qualified()
        ))
        .bind(topic)
        .bind(address)
        .execute(conn.conn())
        .await?;
        conn.complete().await?;
        Ok(())
    }

    async fn unregister(&self, topic: &str, address: &str) -> Result<()> {
        let mut conn = self.provider.begin().await?;
        sqlx::query(&format!(
            "DELETE FROM {} WHERE `topic` = ? AND `address` = ?",
            self.table.qualified()
        ))
        .bind(topic)
        .bind(address)
        .execute(conn.conn())
        .await?;
        conn.complete().await?;
        Ok(())
    }

    fn is_centralized(&self) -> bool {
        self.centralized
    }
}

/// Deferred-message store dequeued by due time.
pub struct MySqlTimeoutStore {
    provider: Arc<MySqlConnectionProvider>,
    table: TableName,
}

impl MySqlTimeoutStore {
    /// Create a store over `table`.
    pub fn new(provider: Arc<MySqlConnectionProvider>, table: &str) -> Result<Self> {
        Ok(Self {
            provider,
            table: TableName::parse(table)?,
        })
    }

    /// Create the table if missing.
    pub async fn ensure_table_is_created(&self) -> Result<()> {
        let mut conn = self.provider.begin().await?;
        conn.execute_commands(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                `id` BIGINT NOT NULL AUTO_INCREMENT,
                `due_time` DATETIME(6) NOT NULL,
                `headers` LONGBLOB NOT NULL,
                `body` LONGBLOB NOT NULL,
                PRIMARY KEY (`id`),
                KEY `ix_due_time` (`due_time`)
            )
            "#,
            self.table.qualified()
        ))
        .await?;
        conn.complete().await?;
        Ok(())
    }
}

#[async_trait]
impl TimeoutStore for MySqlTimeoutStore {
    async fn defer(
        &self,
        due_time: DateTime<Utc>,
        headers: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<()> {
        let mut conn = self.provider.begin().await?;
        sqlx::query(&format!(
            "INSERT INTO {} (`due_time`, `headers`, `body`) VALUES (?, ?, ?)",
            self.table.qualified()
        ))
        .bind(due_time)
        .bind(encode_headers(headers))
        .bind(body)
        .execute(conn.conn())
        .await?;
        conn.complete().await?;
        Ok(())
    }

    async fn due(&self) -> Result<Vec<DueMessage>> {
        let mut conn = self.provider.begin().await?;

        // Lock the due rows so two dispatchers cannot double-deliver.
        let rows = sqlx::query(&format!(
            "SELECT `id`, `headers`, `body` FROM {} \
             WHERE `due_time` <= NOW(6) ORDER BY `due_time` FOR UPDATE",
            self.table.qualified()
        ))
        .fetch_all(conn.conn())
        .await?;
        if rows.is_empty() {
            conn.complete().await?;
            return Ok(Vec::new());
        }

        let mut due = Vec::with_capacity(rows.len());
        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            ids.push(row.get::<i64, _>("id").to_string());
            due.push(DueMessage {
                headers: decode_headers(&row.get::<Vec<u8>, _>("headers"))?,
                body: row.get("body"),
            });
        }

        sqlx::query(&format!(
            "DELETE FROM {} WHERE `id` IN ({})",
            self.table.qualified(),
            ids.join(", ")
        ))
        .execute(conn.conn())
        .await?;
        conn.complete().await?;
        Ok(due)
    }
}

/// Attachment store for payloads too large to travel in message bodies.
pub struct MySqlDataBusStore {
    provider: Arc<MySqlConnectionProvider>,
    table: TableName,
}

impl MySqlDataBusStore {
    /// Create a store over `table`.
    pub fn new(provider: Arc<MySqlConnectionProvider>, table: &str) -> Result<Self> {
        Ok(Self {
            provider,
            table: TableName::parse(table)?,
        })
    }

    /// Create the table if missing.
    pub async fn ensure_table_is_created(&self) -> Result<()> {
        let mut conn = self.provider.begin().await?;
        conn.execute_commands(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                `id` VARCHAR(200) NOT NULL,
                `meta` LONGBLOB NOT NULL,
                `data` LONGBLOB NOT NULL,
                `creation_time` DATETIME(6) NOT NULL,
                `last_read_time` DATETIME(6) NULL,
                PRIMARY KEY (`id`)
            )
            "#,
            self.table.qualified()
        ))
        .await?;
        conn.complete().await?;
        Ok(())
    }
}

#[async_trait]
impl DataBusStore for MySqlDataBusStore {
    async fn save(
        &self,
        id: &str,
        data: &[u8],
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        let mut conn = self.provider.begin().await?;
        sqlx::query(&format!(
            "INSERT INTO {} (`id`, `meta`, `data`, `creation_time`, `last_read_time`) \
             VALUES (?, ?, ?, NOW(6), NULL)",
            self.table.qualified()
        ))
        .bind(id)
        .bind(encode_headers(metadata))
        .bind(data)
        .execute(conn.conn())
        .await?;
        conn.complete().await?;
        Ok(())
    }

    async fn read(&self, id: &str) -> Result<Vec<u8>> {
        let mut conn = self.provider.begin().await?;
        sqlx::query(&format!(
            "UPDATE {} SET `last_read_time` = NOW(6) WHERE `id` = ?",
            self.table.qualified()
        ))
        .bind(id)
        .execute(conn.conn())
        .await?;

        let row = sqlx::query(&format!(
            "SELECT `data` FROM {} WHERE `id` = ?",
            self.table.qualified()
        ))
        .bind(id)
        .fetch_optional(conn.conn())
        .await?
        .with_context(|| format!("no attachment stored under {id:?}"))?;
        conn.complete().await?;
        Ok(row.get("data"))
    }
}
