//! Exclusive-access lock behavior against a live MySQL server.

mod common;

use std::time::Duration;

use courier_core::{CancellationToken, ExclusiveAccessLock};
use courier_mysql::{MySqlExclusiveLock, MySqlLockOptions};

use common::{drop_table, provider, unique_name};

async fn lock_service(table: &str, configure: impl FnOnce(&mut MySqlLockOptions)) -> MySqlExclusiveLock {
    let mut options = MySqlLockOptions {
        table_name: table.to_string(),
        ..Default::default()
    };
    configure(&mut options);
    MySqlExclusiveLock::new(provider().await, options)
        .await
        .expect("failed to create lock service")
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a MySQL server (set COURIER_MYSQL_TEST_DSN)"]
async fn acquire_release_roundtrip() {
    let table = unique_name("locks");
    let locks = lock_service(&table, |_| {}).await;
    let cancel = CancellationToken::new();

    assert!(locks.acquire("k", &cancel).await.unwrap());
    assert!(!locks.acquire("k", &cancel).await.unwrap());
    assert!(locks.is_held("k").await.unwrap());

    assert!(locks.release("k").await.unwrap());
    assert!(!locks.is_held("k").await.unwrap());
    assert!(locks.acquire("k", &cancel).await.unwrap());

    // Releasing a key nobody holds reports false.
    assert!(locks.release("k").await.unwrap());
    assert!(!locks.release("k").await.unwrap());

    locks.shutdown().await;
    drop_table(provider().await.as_ref(), &table).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a MySQL server (set COURIER_MYSQL_TEST_DSN)"]
async fn distinct_keys_do_not_contend() {
    let table = unique_name("locks");
    let locks = lock_service(&table, |_| {}).await;
    let cancel = CancellationToken::new();

    assert!(locks.acquire("saga/1", &cancel).await.unwrap());
    assert!(locks.acquire("saga/2", &cancel).await.unwrap());
    assert!(!locks.acquire("saga/1", &cancel).await.unwrap());

    locks.shutdown().await;
    drop_table(provider().await.as_ref(), &table).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a MySQL server (set COURIER_MYSQL_TEST_DSN)"]
async fn expired_locks_are_swept_and_become_acquirable() {
    let table = unique_name("locks");
    let locks = lock_service(&table, |options| {
        options.lock_ttl = Duration::from_secs(1);
        options.sweep_interval = Duration::from_millis(500);
    })
    .await;
    let cancel = CancellationToken::new();

    assert!(locks.acquire("crashed-holder", &cancel).await.unwrap());
    tokio::time::sleep(Duration::from_secs(3)).await;

    // The sweeper removed the expired row, so the key is free again.
    assert!(locks.acquire("crashed-holder", &cancel).await.unwrap());

    locks.shutdown().await;
    drop_table(provider().await.as_ref(), &table).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a MySQL server (set COURIER_MYSQL_TEST_DSN)"]
async fn cancelled_acquire_reports_cancellation() {
    let table = unique_name("locks");
    let locks = lock_service(&table, |_| {}).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = locks.acquire("k", &cancel).await.unwrap_err();
    assert!(matches!(err, courier_core::LockError::Cancelled));

    locks.shutdown().await;
    drop_table(provider().await.as_ref(), &table).await;
}
