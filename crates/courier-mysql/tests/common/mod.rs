//! Shared plumbing for the database-backed tests.
//!
//! These tests need a real MySQL server. Point `COURIER_MYSQL_TEST_DSN` at
//! a throwaway schema and run with `--ignored`:
//!
//! ```text
//! COURIER_MYSQL_TEST_DSN=mysql://root@localhost/courier_test \
//!     cargo test -p courier-mysql -- --ignored
//! ```

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use courier_core::{headers, TransportMessage};
use courier_mysql::{MySqlConnectionOptions, MySqlConnectionProvider};

pub fn test_dsn() -> String {
    std::env::var("COURIER_MYSQL_TEST_DSN")
        .expect("set COURIER_MYSQL_TEST_DSN to run the database tests")
}

pub async fn provider() -> Arc<MySqlConnectionProvider> {
    let options = MySqlConnectionOptions::new(test_dsn());
    Arc::new(
        MySqlConnectionProvider::connect(options)
            .await
            .expect("failed to connect to the test database"),
    )
}

/// A table name other tests cannot collide with.
pub fn unique_name(prefix: &str) -> String {
    format!("{prefix}_{:08x}", fastrand::u32(..))
}

/// Build a message with a fresh message id, `body`, and extra headers.
pub fn message(body: &str, extra: &[(&str, String)]) -> TransportMessage {
    let mut map = HashMap::new();
    map.insert(
        headers::MESSAGE_ID.to_string(),
        uuid::Uuid::new_v4().to_string(),
    );
    for (key, value) in extra {
        map.insert((*key).to_string(), value.clone());
    }
    TransportMessage::new(map, body.as_bytes().to_vec())
}

pub fn body_of(message: &TransportMessage) -> String {
    String::from_utf8(message.body.clone()).expect("test bodies are UTF-8")
}

pub fn message_id(message: &TransportMessage) -> String {
    message
        .headers
        .get(headers::MESSAGE_ID)
        .expect("test messages carry an id")
        .clone()
}

pub async fn drop_table(provider: &MySqlConnectionProvider, table: &str) {
    sqlx::query(&format!("DROP TABLE IF EXISTS `{table}`"))
        .execute(provider.pool())
        .await
        .expect("failed to drop test table");
}

pub async fn count_rows(provider: &MySqlConnectionProvider, table: &str) -> i64 {
    use sqlx::Row;
    sqlx::query(&format!("SELECT COUNT(*) AS n FROM `{table}`"))
        .fetch_one(provider.pool())
        .await
        .expect("failed to count rows")
        .get("n")
}
