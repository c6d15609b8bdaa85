//! Schema helper and collaborator-store behavior against a live MySQL
//! server.

mod common;

use std::collections::HashMap;

use courier_core::stores::{
    CorrelationProperty, DataBusStore, SagaData, SagaStore, SubscriptionStore, TimeoutStore,
};
use courier_core::ConcurrencyError;
use courier_mysql::stores::{
    MySqlDataBusStore, MySqlSagaStore, MySqlSubscriptionStore, MySqlTimeoutStore,
};
use courier_mysql::{schema, TableName};

use common::{drop_table, provider, unique_name};

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a MySQL server (set COURIER_MYSQL_TEST_DSN)"]
async fn connection_reports_tables_columns_and_indexes() {
    let provider = provider().await;
    let table = unique_name("meta");

    let mut conn = provider.begin().await.unwrap();
    conn.execute_commands(&format!(
        "CREATE TABLE `{table}` (\
           `id` BIGINT NOT NULL AUTO_INCREMENT, \
           `payload` LONGBLOB NOT NULL, \
           PRIMARY KEY (`id`), \
           KEY `ix_payload_probe` (`id`, `payload`(16)))"
    ))
    .await
    .unwrap();
    conn.complete().await.unwrap();

    let mut conn = provider.begin().await.unwrap();
    let tables = conn.table_names().await.unwrap();
    assert!(tables.contains(&TableName::new(table.to_uppercase())));

    let columns = conn.columns(None, &table).await.unwrap();
    assert_eq!(columns.get("id").map(String::as_str), Some("bigint"));
    assert_eq!(columns.get("payload").map(String::as_str), Some("longblob"));

    let indexes = conn.indexes(None, &table).await.unwrap();
    assert_eq!(
        indexes.get("ix_payload_probe").map(String::as_str),
        Some("id, payload")
    );
    conn.complete().await.unwrap();

    drop_table(&provider, &table).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a MySQL server (set COURIER_MYSQL_TEST_DSN)"]
async fn ddl_helpers_are_idempotent() {
    let provider = provider().await;
    let table_name = unique_name("ddl");
    let table = TableName::new(table_name.clone());

    let mut conn = provider.begin().await.unwrap();
    conn.execute_commands(&format!(
        "CREATE TABLE `{table_name}` (`id` BIGINT NOT NULL, PRIMARY KEY (`id`))"
    ))
    .await
    .unwrap();

    // Both calls succeed; the second is a no-op.
    schema::create_column_if_not_exists(&mut conn, &table, "note", "VARCHAR(50) NULL")
        .await
        .unwrap();
    schema::create_column_if_not_exists(&mut conn, &table, "note", "VARCHAR(50) NULL")
        .await
        .unwrap();
    schema::create_index_if_not_exists(&mut conn, &table, "ix_note", "`note`")
        .await
        .unwrap();
    schema::create_index_if_not_exists(&mut conn, &table, "ix_note", "`note`")
        .await
        .unwrap();

    let columns = conn.columns(None, &table_name).await.unwrap();
    assert!(columns.contains_key("note"));
    let indexes = conn.indexes(None, &table_name).await.unwrap();
    assert!(indexes.contains_key("ix_note"));

    schema::drop_index_if_exists(&mut conn, &table, "ix_note").await.unwrap();
    schema::drop_index_if_exists(&mut conn, &table, "ix_note").await.unwrap();
    schema::drop_column_if_exists(&mut conn, &table, "note").await.unwrap();
    schema::drop_column_if_exists(&mut conn, &table, "note").await.unwrap();

    let columns = conn.columns(None, &table_name).await.unwrap();
    assert!(!columns.contains_key("note"));
    conn.complete().await.unwrap();

    drop_table(&provider, &table_name).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a MySQL server (set COURIER_MYSQL_TEST_DSN)"]
async fn saga_store_enforces_optimistic_concurrency() {
    let provider = provider().await;
    let data_table = unique_name("sagas");
    let index_table = unique_name("saga_index");
    let store = MySqlSagaStore::new(provider.clone(), &data_table, &index_table).unwrap();
    store.ensure_tables_are_created().await.unwrap();

    let saga = SagaData {
        id: uuid::Uuid::new_v4(),
        revision: 0,
        data: b"state-v0".to_vec(),
    };
    let correlation = vec![CorrelationProperty {
        name: "order_id".to_string(),
        value: "order-42".to_string(),
    }];

    store.insert("OrderSaga", &saga, &correlation).await.unwrap();

    let found = store
        .find("OrderSaga", "order_id", "order-42")
        .await
        .unwrap()
        .expect("saga is indexed by its correlation property");
    assert_eq!(found.id, saga.id);
    assert_eq!(found.revision, 0);
    assert_eq!(found.data, b"state-v0");

    let by_id = store
        .find("OrderSaga", "Id", &saga.id.to_string())
        .await
        .unwrap()
        .expect("saga is addressable by id");
    assert_eq!(by_id.id, saga.id);

    // First writer wins; the stale second update reports the conflict.
    let mut fresh = found.clone();
    fresh.data = b"state-v1".to_vec();
    store.update("OrderSaga", &fresh, &correlation).await.unwrap();

    let stale = found;
    let err = store
        .update("OrderSaga", &stale, &correlation)
        .await
        .unwrap_err();
    assert!(err.downcast_ref::<ConcurrencyError>().is_some());

    let reloaded = store
        .find("OrderSaga", "order_id", "order-42")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.revision, 1);
    store.delete(&reloaded).await.unwrap();
    assert!(store
        .find("OrderSaga", "order_id", "order-42")
        .await
        .unwrap()
        .is_none());

    drop_table(&provider, &data_table).await;
    drop_table(&provider, &index_table).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a MySQL server (set COURIER_MYSQL_TEST_DSN)"]
async fn duplicate_saga_insert_is_a_conflict() {
    let provider = provider().await;
    let data_table = unique_name("sagas");
    let index_table = unique_name("saga_index");
    let store = MySqlSagaStore::new(provider.clone(), &data_table, &index_table).unwrap();
    store.ensure_tables_are_created().await.unwrap();

    let saga = SagaData {
        id: uuid::Uuid::new_v4(),
        revision: 0,
        data: b"state".to_vec(),
    };
    store.insert("OrderSaga", &saga, &[]).await.unwrap();
    let err = store.insert("OrderSaga", &saga, &[]).await.unwrap_err();
    assert!(err.downcast_ref::<ConcurrencyError>().is_some());

    drop_table(&provider, &data_table).await;
    drop_table(&provider, &index_table).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a MySQL server (set COURIER_MYSQL_TEST_DSN)"]
async fn subscriptions_register_idempotently() {
    let provider = provider().await;
    let table = unique_name("subscriptions");
    let store = MySqlSubscriptionStore::new(provider.clone(), &table, true).unwrap();
    store.ensure_table_is_created().await.unwrap();
    assert!(store.is_centralized());

    store.register("orders", "billing").await.unwrap();
    store.register("orders", "billing").await.unwrap();
    store.register("orders", "shipping").await.unwrap();

    let mut subscribers = store.subscribers("orders").await.unwrap();
    subscribers.sort();
    assert_eq!(subscribers, vec!["billing", "shipping"]);

    store.unregister("orders", "billing").await.unwrap();
    assert_eq!(store.subscribers("orders").await.unwrap(), vec!["shipping"]);

    drop_table(&provider, &table).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a MySQL server (set COURIER_MYSQL_TEST_DSN)"]
async fn due_timeouts_are_dequeued_once() {
    let provider = provider().await;
    let table = unique_name("timeouts");
    let store = MySqlTimeoutStore::new(provider.clone(), &table).unwrap();
    store.ensure_table_is_created().await.unwrap();

    let mut headers = HashMap::new();
    headers.insert("k".to_string(), "v".to_string());
    store
        .defer(chrono::Utc::now() - chrono::Duration::seconds(5), &headers, b"due")
        .await
        .unwrap();
    store
        .defer(chrono::Utc::now() + chrono::Duration::hours(1), &headers, b"later")
        .await
        .unwrap();

    let due = store.due().await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].body, b"due");
    assert_eq!(due[0].headers.get("k").map(String::as_str), Some("v"));

    // The due row is consumed; the future one stays parked.
    assert!(store.due().await.unwrap().is_empty());
    assert_eq!(common::count_rows(&provider, &table).await, 1);

    drop_table(&provider, &table).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a MySQL server (set COURIER_MYSQL_TEST_DSN)"]
async fn data_bus_roundtrips_attachments() {
    let provider = provider().await;
    let table = unique_name("attachments");
    let store = MySqlDataBusStore::new(provider.clone(), &table).unwrap();
    store.ensure_table_is_created().await.unwrap();

    let mut meta = HashMap::new();
    meta.insert("content-type".to_string(), "text/plain".to_string());
    store.save("att-1", b"big payload", &meta).await.unwrap();

    assert_eq!(store.read("att-1").await.unwrap(), b"big payload");
    assert!(store.read("att-missing").await.is_err());

    drop_table(&provider, &table).await;
}
