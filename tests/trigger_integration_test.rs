// ABOUTME: Integration tests for the change trigger engine against a live SQL Server
// ABOUTME: Covers the full lifecycle: insert, delete, batching, competing workers, stuck and failing handlers

use std::env;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use sql_change_trigger::{
    mssql, ChangeExecutor, SqlChange, SqlChangeOperation, TriggerConfig, TriggerListener,
};

/// Target server for these tests. Change tracking must already be enabled on
/// the database (`ALTER DATABASE ... SET CHANGE_TRACKING = ON`).
fn get_test_url() -> Option<String> {
    env::var("TEST_MSSQL_URL").ok()
}

fn test_table_name(suffix: &str) -> String {
    format!("trigger_test_{}", suffix)
}

async fn exec(client: &mut mssql::MssqlClient, sql: &str) -> anyhow::Result<()> {
    client.execute(sql, &[]).await?;
    Ok(())
}

/// Create a change-tracked test table with (Id int primary key, Name nvarchar).
async fn setup_test_table(
    client: &mut mssql::MssqlClient,
    table_name: &str,
) -> anyhow::Result<()> {
    exec(
        client,
        &format!("IF OBJECT_ID(N'dbo.{table_name}', 'U') IS NOT NULL DROP TABLE dbo.{table_name};"),
    )
    .await?;
    exec(
        client,
        &format!(
            "CREATE TABLE dbo.{table_name} (Id int NOT NULL PRIMARY KEY, Name nvarchar(100));"
        ),
    )
    .await?;
    exec(
        client,
        &format!(
            "ALTER TABLE dbo.{table_name} ENABLE CHANGE_TRACKING WITH (TRACK_COLUMNS_UPDATED = OFF);"
        ),
    )
    .await?;
    Ok(())
}

async fn cleanup_test_table(client: &mut mssql::MssqlClient, table_name: &str) {
    let _ = exec(
        client,
        &format!("IF OBJECT_ID(N'dbo.{table_name}', 'U') IS NOT NULL DROP TABLE dbo.{table_name};"),
    )
    .await;
}

/// Collects every change delivered to it.
#[derive(Default)]
struct CollectingExecutor {
    seen: Mutex<Vec<SqlChange<Value>>>,
}

impl CollectingExecutor {
    fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    fn snapshot(&self) -> Vec<SqlChange<Value>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChangeExecutor<Value> for CollectingExecutor {
    async fn try_execute(
        &self,
        changes: Vec<SqlChange<Value>>,
        _cancellation: CancellationToken,
    ) -> anyhow::Result<()> {
        self.seen.lock().unwrap().extend(changes);
        Ok(())
    }
}

/// Fails every invocation, counting how often it was called.
#[derive(Default)]
struct FailingExecutor {
    invocations: Mutex<u32>,
}

impl FailingExecutor {
    fn invocations(&self) -> u32 {
        *self.invocations.lock().unwrap()
    }
}

#[async_trait]
impl ChangeExecutor<Value> for FailingExecutor {
    async fn try_execute(
        &self,
        _changes: Vec<SqlChange<Value>>,
        _cancellation: CancellationToken,
    ) -> anyhow::Result<()> {
        *self.invocations.lock().unwrap() += 1;
        anyhow::bail!("simulated handler failure")
    }
}

/// Never returns until the engine cancels it.
#[derive(Default)]
struct StuckExecutor {
    was_cancelled: Mutex<bool>,
}

impl StuckExecutor {
    fn was_cancelled(&self) -> bool {
        *self.was_cancelled.lock().unwrap()
    }
}

#[async_trait]
impl ChangeExecutor<Value> for StuckExecutor {
    async fn try_execute(
        &self,
        _changes: Vec<SqlChange<Value>>,
        cancellation: CancellationToken,
    ) -> anyhow::Result<()> {
        cancellation.cancelled().await;
        *self.was_cancelled.lock().unwrap() = true;
        anyhow::bail!("cancelled by the engine")
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(250)).await;
    }
    false
}

fn fast_config() -> TriggerConfig {
    TriggerConfig {
        polling_interval: Duration::from_millis(500),
        lease_interval: Duration::from_secs(2),
        ..TriggerConfig::default()
    }
}

/// Test: a single inserted row is delivered exactly once and not re-delivered
/// after the sync version advances.
#[tokio::test]
#[ignore]
async fn test_single_insert_delivered_once() {
    let url = get_test_url().expect("TEST_MSSQL_URL must be set");
    let mut client = mssql::connect(&url).await.expect("connect failed");
    let table_name = test_table_name("single_insert");
    setup_test_table(&mut client, &table_name)
        .await
        .expect("setup failed");
    exec(
        &mut client,
        &format!("INSERT INTO dbo.{table_name} (Id, Name) VALUES (7, N'widget');"),
    )
    .await
    .expect("insert failed");

    let executor = Arc::new(CollectingExecutor::default());
    let monitor = TriggerListener::new(
        url.clone(),
        format!("dbo.{table_name}"),
        "single_insert_fn",
        executor.clone() as Arc<dyn ChangeExecutor<Value>>,
        fast_config(),
    )
    .expect("listener construction failed")
    .start()
    .await
    .expect("listener start failed");

    let delivered = wait_until(Duration::from_secs(30), || executor.count() == 1).await;
    assert!(delivered, "insert change was not delivered");

    let seen = executor.snapshot();
    assert_eq!(seen[0].operation, SqlChangeOperation::Insert);
    assert_eq!(seen[0].item["Id"], Value::String("7".to_string()));
    assert_eq!(seen[0].item["Name"], Value::String("widget".to_string()));

    // No re-delivery once the batch is released and the sync version advances
    sleep(Duration::from_secs(3)).await;
    assert_eq!(executor.count(), 1, "change was delivered twice");

    monitor.stop();
    monitor.join().await;
    cleanup_test_table(&mut client, &table_name).await;
}

/// Test: a deleted row is delivered with only its primary-key fields.
#[tokio::test]
#[ignore]
async fn test_delete_payload_contains_only_primary_key() {
    let url = get_test_url().expect("TEST_MSSQL_URL must be set");
    let mut client = mssql::connect(&url).await.expect("connect failed");
    let table_name = test_table_name("delete_payload");
    setup_test_table(&mut client, &table_name)
        .await
        .expect("setup failed");
    exec(
        &mut client,
        &format!("INSERT INTO dbo.{table_name} (Id, Name) VALUES (3, N'doomed');"),
    )
    .await
    .expect("insert failed");

    let executor = Arc::new(CollectingExecutor::default());
    let monitor = TriggerListener::new(
        url.clone(),
        format!("dbo.{table_name}"),
        "delete_payload_fn",
        executor.clone() as Arc<dyn ChangeExecutor<Value>>,
        fast_config(),
    )
    .expect("listener construction failed")
    .start()
    .await
    .expect("listener start failed");

    let inserted = wait_until(Duration::from_secs(30), || executor.count() == 1).await;
    assert!(inserted, "insert change was not delivered");

    exec(
        &mut client,
        &format!("DELETE FROM dbo.{table_name} WHERE Id = 3;"),
    )
    .await
    .expect("delete failed");

    let deleted = wait_until(Duration::from_secs(30), || executor.count() == 2).await;
    assert!(deleted, "delete change was not delivered");

    let seen = executor.snapshot();
    assert_eq!(seen[1].operation, SqlChangeOperation::Delete);
    let payload = seen[1].item.as_object().expect("payload must be an object");
    assert_eq!(payload.get("Id"), Some(&Value::String("3".to_string())));
    assert!(
        !payload.contains_key("Name"),
        "delete payload must not carry non-key columns"
    );

    monitor.stop();
    monitor.join().await;
    cleanup_test_table(&mut client, &table_name).await;
}

/// Test: more rows than one batch holds are delivered across ticks without
/// loss or duplication.
#[tokio::test]
#[ignore]
async fn test_batch_boundary_delivers_all_rows() {
    let url = get_test_url().expect("TEST_MSSQL_URL must be set");
    let mut client = mssql::connect(&url).await.expect("connect failed");
    let table_name = test_table_name("batch_boundary");
    setup_test_table(&mut client, &table_name)
        .await
        .expect("setup failed");

    // Separate statements so every row gets its own change version
    for id in 1..=11 {
        exec(
            &mut client,
            &format!("INSERT INTO dbo.{table_name} (Id, Name) VALUES ({id}, N'row{id}');"),
        )
        .await
        .expect("insert failed");
    }

    let executor = Arc::new(CollectingExecutor::default());
    let monitor = TriggerListener::new(
        url.clone(),
        format!("dbo.{table_name}"),
        "batch_boundary_fn",
        executor.clone() as Arc<dyn ChangeExecutor<Value>>,
        fast_config(),
    )
    .expect("listener construction failed")
    .start()
    .await
    .expect("listener start failed");

    let delivered = wait_until(Duration::from_secs(60), || executor.count() >= 11).await;
    assert!(delivered, "not all rows were delivered");

    sleep(Duration::from_secs(3)).await;
    let seen = executor.snapshot();
    assert_eq!(seen.len(), 11, "rows were re-delivered");
    let mut ids: Vec<i32> = seen
        .iter()
        .map(|change| change.item["Id"].as_str().unwrap().parse().unwrap())
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, (1..=11).collect::<Vec<i32>>());

    monitor.stop();
    monitor.join().await;
    cleanup_test_table(&mut client, &table_name).await;
}

/// Test: two monitors sharing a function id deliver one new row exactly once
/// between them.
#[tokio::test]
#[ignore]
async fn test_competing_monitors_deliver_once() {
    let url = get_test_url().expect("TEST_MSSQL_URL must be set");
    let mut client = mssql::connect(&url).await.expect("connect failed");
    let table_name = test_table_name("competing");
    setup_test_table(&mut client, &table_name)
        .await
        .expect("setup failed");

    let first = Arc::new(CollectingExecutor::default());
    let second = Arc::new(CollectingExecutor::default());
    let monitor_a = TriggerListener::new(
        url.clone(),
        format!("dbo.{table_name}"),
        "competing_fn",
        first.clone() as Arc<dyn ChangeExecutor<Value>>,
        fast_config(),
    )
    .expect("listener construction failed")
    .start()
    .await
    .expect("first listener start failed");
    let monitor_b = TriggerListener::new(
        url.clone(),
        format!("dbo.{table_name}"),
        "competing_fn",
        second.clone() as Arc<dyn ChangeExecutor<Value>>,
        fast_config(),
    )
    .expect("listener construction failed")
    .start()
    .await
    .expect("second listener start failed");

    exec(
        &mut client,
        &format!("INSERT INTO dbo.{table_name} (Id, Name) VALUES (5, N'contested');"),
    )
    .await
    .expect("insert failed");

    let delivered =
        wait_until(Duration::from_secs(30), || first.count() + second.count() >= 1).await;
    assert!(delivered, "change was not delivered by either monitor");

    // Give the losing monitor several poll ticks to (incorrectly) re-deliver
    sleep(Duration::from_secs(4)).await;
    assert_eq!(
        first.count() + second.count(),
        1,
        "competing monitors both delivered the same change"
    );

    monitor_a.stop();
    monitor_b.stop();
    monitor_a.join().await;
    monitor_b.join().await;
    cleanup_test_table(&mut client, &table_name).await;
}

/// Test: a handler that never returns is cancelled once it exhausts its
/// lease-renewal budget, and the monitor goes back to polling.
#[tokio::test]
#[ignore]
async fn test_stuck_handler_is_cancelled() {
    let url = get_test_url().expect("TEST_MSSQL_URL must be set");
    let mut client = mssql::connect(&url).await.expect("connect failed");
    let table_name = test_table_name("stuck_handler");
    setup_test_table(&mut client, &table_name)
        .await
        .expect("setup failed");
    exec(
        &mut client,
        &format!("INSERT INTO dbo.{table_name} (Id, Name) VALUES (1, N'tarpit');"),
    )
    .await
    .expect("insert failed");

    let executor = Arc::new(StuckExecutor::default());
    let config = TriggerConfig {
        polling_interval: Duration::from_millis(500),
        lease_interval: Duration::from_secs(2),
        max_lease_renewal_count: 2,
        ..TriggerConfig::default()
    };
    let monitor = TriggerListener::new(
        url.clone(),
        format!("dbo.{table_name}"),
        "stuck_handler_fn",
        executor.clone() as Arc<dyn ChangeExecutor<Value>>,
        config,
    )
    .expect("listener construction failed")
    .start()
    .await
    .expect("listener start failed");

    // Two renewals at one second each, then the cancel fires
    let cancelled = wait_until(Duration::from_secs(30), || executor.was_cancelled()).await;
    assert!(cancelled, "stuck handler was never cancelled");

    monitor.stop();
    monitor.join().await;
    cleanup_test_table(&mut client, &table_name).await;
}

/// Test: a row whose handler always fails is retried until the attempt limit
/// and then abandoned.
#[tokio::test]
#[ignore]
async fn test_failing_row_is_abandoned_after_attempt_limit() {
    let url = get_test_url().expect("TEST_MSSQL_URL must be set");
    let mut client = mssql::connect(&url).await.expect("connect failed");
    let table_name = test_table_name("failing_row");
    setup_test_table(&mut client, &table_name)
        .await
        .expect("setup failed");
    exec(
        &mut client,
        &format!("INSERT INTO dbo.{table_name} (Id, Name) VALUES (1, N'poison');"),
    )
    .await
    .expect("insert failed");

    let executor = Arc::new(FailingExecutor::default());
    let config = TriggerConfig {
        polling_interval: Duration::from_millis(500),
        lease_interval: Duration::from_secs(2),
        max_attempt_count: 2,
        ..TriggerConfig::default()
    };
    let monitor = TriggerListener::new(
        url.clone(),
        format!("dbo.{table_name}"),
        "failing_row_fn",
        executor.clone() as Arc<dyn ChangeExecutor<Value>>,
        config,
    )
    .expect("listener construction failed")
    .start()
    .await
    .expect("listener start failed");

    let exhausted = wait_until(Duration::from_secs(60), || executor.invocations() >= 2).await;
    assert!(exhausted, "failing row was not retried");

    // Leases keep expiring, but the attempt filter must keep the row out now
    sleep(Duration::from_secs(6)).await;
    assert_eq!(
        executor.invocations(),
        2,
        "abandoned row was retried past the attempt limit"
    );

    monitor.stop();
    monitor.join().await;
    cleanup_test_table(&mut client, &table_name).await;
}

/// Test: initialization is idempotent - a second listener for the same
/// (function, table) starts cleanly against the existing coordination tables.
#[tokio::test]
#[ignore]
async fn test_initialization_is_idempotent() {
    let url = get_test_url().expect("TEST_MSSQL_URL must be set");
    let mut client = mssql::connect(&url).await.expect("connect failed");
    let table_name = test_table_name("idempotent");
    setup_test_table(&mut client, &table_name)
        .await
        .expect("setup failed");

    let first = TriggerListener::new(
        url.clone(),
        format!("dbo.{table_name}"),
        "idempotent_fn",
        Arc::new(CollectingExecutor::default()) as Arc<dyn ChangeExecutor<Value>>,
        fast_config(),
    )
    .expect("listener construction failed")
    .start()
    .await
    .expect("first start failed");

    let second = TriggerListener::new(
        url.clone(),
        format!("dbo.{table_name}"),
        "idempotent_fn",
        Arc::new(CollectingExecutor::default()) as Arc<dyn ChangeExecutor<Value>>,
        fast_config(),
    )
    .expect("listener construction failed")
    .start()
    .await
    .expect("second start must not fail on existing coordination tables");

    first.stop();
    second.stop();
    first.join().await;
    second.join().await;
    cleanup_test_table(&mut client, &table_name).await;
}

/// Test: a missing table is refused at initialization.
#[tokio::test]
#[ignore]
async fn test_missing_table_is_refused() {
    let url = get_test_url().expect("TEST_MSSQL_URL must be set");

    let result = TriggerListener::new(
        url,
        "dbo.table_that_does_not_exist",
        "missing_table_fn",
        Arc::new(CollectingExecutor::default()) as Arc<dyn ChangeExecutor<Value>>,
        fast_config(),
    )
    .expect("listener construction failed")
    .start()
    .await;

    assert!(matches!(
        result,
        Err(sql_change_trigger::Error::TableNotFound(_))
    ));
}

/// Test: a table without a primary key is refused at initialization.
#[tokio::test]
#[ignore]
async fn test_table_without_primary_key_is_refused() {
    let url = get_test_url().expect("TEST_MSSQL_URL must be set");
    let mut client = mssql::connect(&url).await.expect("connect failed");
    let table_name = test_table_name("heap");
    let _ = exec(
        &mut client,
        &format!("IF OBJECT_ID(N'dbo.{table_name}', 'U') IS NOT NULL DROP TABLE dbo.{table_name};"),
    )
    .await;
    exec(
        &mut client,
        &format!("CREATE TABLE dbo.{table_name} (Id int NOT NULL, Name nvarchar(100));"),
    )
    .await
    .expect("setup failed");

    let result = TriggerListener::new(
        url.clone(),
        format!("dbo.{table_name}"),
        "heap_fn",
        Arc::new(CollectingExecutor::default()) as Arc<dyn ChangeExecutor<Value>>,
        fast_config(),
    )
    .expect("listener construction failed")
    .start()
    .await;

    assert!(matches!(
        result,
        Err(sql_change_trigger::Error::NoPrimaryKey(_))
    ));

    cleanup_test_table(&mut client, &table_name).await;
}
