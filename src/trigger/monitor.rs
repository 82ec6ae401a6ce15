// ABOUTME: The long-running change monitor - polling and lease-renewal loops
// ABOUTME: Coordinates competing workers through the worker table and advances the shared sync version

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tiberius::Query;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::TriggerConfig;
use crate::error::{Error, Result};
use crate::executor::ChangeExecutor;
use crate::mssql::{self, quote_ident, MssqlClient};
use crate::trigger::batch::{build_changes, recompute_last_sync_version, BatchRow};
use crate::trigger::init::{TableMetadata, GLOBAL_STATE_TABLE, MIN_VALID_VERSION_SQL};

/// Where the monitor currently is in its poll/process cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MonitorState {
    CheckingForChanges,
    ProcessingChanges,
}

/// The row batch shared between the polling and lease-renewal loops.
///
/// Guarded by a single mutex; held across lease renewal and across
/// release/clear, but never across the handler invocation itself.
struct RowBatchState {
    state: MonitorState,
    rows: Vec<BatchRow>,
    lease_renewal_count: u32,
    executor_cancellation: CancellationToken,
}

impl RowBatchState {
    fn new() -> Self {
        Self {
            state: MonitorState::CheckingForChanges,
            rows: Vec::new(),
            lease_renewal_count: 0,
            executor_cancellation: CancellationToken::new(),
        }
    }
}

fn clear_rows_locked(shared: &mut RowBatchState) {
    shared.rows.clear();
    shared.lease_renewal_count = 0;
    shared.state = MonitorState::CheckingForChanges;
}

/// Handle to a running change monitor.
///
/// `stop` cancels the polling loop and returns immediately; the polling
/// loop's terminal cleanup cancels the renewal loop so both tasks always die
/// together. `join` awaits that termination.
pub struct ChangeMonitor {
    cancellation: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ChangeMonitor {
    /// Signal the monitor to stop. Returns immediately; an in-flight handler
    /// runs to completion or is cancelled by the renewal limit.
    pub fn stop(&self) {
        self.cancellation.cancel();
    }

    /// Whether `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Wait for both monitor loops to terminate.
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Spawn the polling and lease-renewal loops for a resolved table.
pub(crate) fn spawn<T>(worker: MonitorWorker<T>) -> ChangeMonitor
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    let cancellation = CancellationToken::new();
    let renewal_cancellation = CancellationToken::new();
    let worker = Arc::new(worker);

    let polling_task = {
        let worker = Arc::clone(&worker);
        let cancellation = cancellation.clone();
        let renewal_cancellation = renewal_cancellation.clone();
        tokio::spawn(async move {
            worker
                .run_change_consumption(cancellation, renewal_cancellation)
                .await;
        })
    };
    let renewal_task = tokio::spawn(async move {
        worker.run_lease_renewal(renewal_cancellation).await;
    });

    ChangeMonitor {
        cancellation,
        tasks: vec![polling_task, renewal_task],
    }
}

/// Per-table monitor state shared by both loops.
pub(crate) struct MonitorWorker<T> {
    connection_string: String,
    config: TriggerConfig,
    table: Arc<TableMetadata>,
    executor: Arc<dyn ChangeExecutor<T>>,
    shared: Mutex<RowBatchState>,
}

impl<T> MonitorWorker<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    pub(crate) fn new(
        connection_string: String,
        config: TriggerConfig,
        table: Arc<TableMetadata>,
        executor: Arc<dyn ChangeExecutor<T>>,
    ) -> Self {
        Self {
            connection_string,
            config,
            table,
            executor,
            shared: Mutex::new(RowBatchState::new()),
        }
    }

    /// The polling loop: one tick per polling interval until cancelled.
    /// Nothing escapes a tick - every failure is logged and the loop keeps
    /// going. The terminal cleanup cancels the renewal loop.
    async fn run_change_consumption(
        &self,
        cancellation: CancellationToken,
        renewal_cancellation: CancellationToken,
    ) {
        tracing::info!(
            "change monitor started for {} (worker table {})",
            self.table.user_table_name,
            self.table.worker_table_name
        );

        loop {
            if cancellation.is_cancelled() {
                break;
            }
            self.run_poll_tick().await;
            tokio::select! {
                _ = cancellation.cancelled() => break,
                _ = tokio::time::sleep(self.config.polling_interval) => {}
            }
        }

        renewal_cancellation.cancel();
        tracing::info!(
            "change monitor stopped for {}",
            self.table.user_table_name
        );
    }

    async fn run_poll_tick(&self) {
        {
            let shared = self.shared.lock().await;
            if shared.state != MonitorState::CheckingForChanges {
                return;
            }
        }

        let rows = match self.acquire_changes().await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(
                    "failed to acquire changes for {}: {}",
                    self.table.user_table_name,
                    e
                );
                self.clear_rows().await;
                return;
            }
        };
        if rows.is_empty() {
            return;
        }
        tracing::info!(
            "acquired {} change(s) for {} (versions {}..{})",
            rows.len(),
            self.table.user_table_name,
            rows.first().map(|r| r.change_version).unwrap_or_default(),
            rows.last().map(|r| r.change_version).unwrap_or_default()
        );

        let executor_cancellation = {
            let mut shared = self.shared.lock().await;
            shared.rows = rows.clone();
            shared.state = MonitorState::ProcessingChanges;
            shared.executor_cancellation.clone()
        };

        let changes = match build_changes::<T>(&self.table, &rows) {
            Ok(changes) => changes,
            Err(e) => {
                tracing::error!(
                    "failed to decode change batch for {}: {}",
                    self.table.user_table_name,
                    e
                );
                self.clear_rows().await;
                return;
            }
        };

        // The mutex is not held here: the renewal loop must be able to renew
        // these leases while the handler runs
        match self.executor.try_execute(changes, executor_cancellation).await {
            Ok(()) => self.release_rows().await,
            Err(e) => {
                tracing::error!(
                    "handler failed for {} ({} row(s)): {:#}; leases will expire and another worker may retry",
                    self.table.user_table_name,
                    rows.len(),
                    e
                );
                self.clear_rows().await;
            }
        }
    }

    /// One acquire-changes transaction: advance the floor if the stored sync
    /// version trails what change tracking still retains, select candidates,
    /// and take leases on them.
    async fn acquire_changes(&self) -> Result<Vec<BatchRow>> {
        let mut client = mssql::connect(&self.connection_string).await?;
        mssql::begin_repeatable_read(&mut client).await?;
        match self.acquire_changes_in_txn(&mut client).await {
            Ok(rows) => {
                mssql::commit(&mut client).await?;
                Ok(rows)
            }
            Err(e) => {
                let _ = mssql::rollback(&mut client).await;
                Err(e)
            }
        }
    }

    async fn acquire_changes_in_txn(&self, client: &mut MssqlClient) -> Result<Vec<BatchRow>> {
        let table = &self.table;

        let row = client
            .query(MIN_VALID_VERSION_SQL, &[&table.user_table_id])
            .await?
            .into_row()
            .await?;
        let min_valid_version = match row {
            Some(row) => row.try_get::<i64, _>(0)?,
            None => None,
        }
        .ok_or_else(|| Error::ChangeTrackingNotEnabled(table.user_table_name.clone()))?;

        let select_sql = format!(
            "SELECT [LastSyncVersion] FROM {GLOBAL_STATE_TABLE} \
             WHERE [UserFunctionID] = @P1 AND [UserTableID] = @P2;"
        );
        let row = client
            .query(
                select_sql,
                &[&table.user_function_id, &table.user_table_id],
            )
            .await?
            .into_row()
            .await?
            .ok_or_else(|| Error::SyncStateMissing(table.user_table_name.clone()))?;
        let mut last_sync_version = row
            .try_get::<i64, _>(0)?
            .ok_or_else(|| Error::SyncStateMissing(table.user_table_name.clone()))?;

        if last_sync_version < min_valid_version {
            tracing::warn!(
                "stored sync version {} for {} trails the minimum valid version {}; advancing",
                last_sync_version,
                table.user_table_name,
                min_valid_version
            );
            let update_sql = format!(
                "UPDATE {GLOBAL_STATE_TABLE} SET [LastSyncVersion] = @P1 \
                 WHERE [UserFunctionID] = @P2 AND [UserTableID] = @P3;"
            );
            client
                .execute(
                    update_sql,
                    &[
                        &min_valid_version,
                        &table.user_function_id,
                        &table.user_table_id,
                    ],
                )
                .await?;
            last_sync_version = min_valid_version;
        }

        let candidate_sql =
            build_candidate_query(table, self.config.batch_size, self.config.max_attempt_count);
        let rows = client
            .query(candidate_sql, &[&last_sync_version])
            .await?
            .into_first_result()
            .await?;
        let batch: Vec<BatchRow> = rows
            .iter()
            .map(|row| BatchRow::from_sql_row(row, table))
            .collect::<Result<_>>()?;

        for row in &batch {
            let lease_sql = build_acquire_lease_statement(
                table,
                row.change_version,
                self.config.lease_interval_secs(),
            );
            let mut query = Query::new(lease_sql);
            for value in &row.pk_values {
                query.bind(value.clone());
            }
            query.execute(client).await?;
        }

        Ok(batch)
    }

    /// The lease-renewal loop: every half lease interval, extend the leases
    /// of the batch being processed and cancel the handler once it exceeds
    /// its renewal budget.
    async fn run_lease_renewal(&self, cancellation: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => break,
                _ = tokio::time::sleep(self.config.lease_renewal_interval()) => {}
            }

            let mut shared = self.shared.lock().await;
            if shared.state != MonitorState::ProcessingChanges {
                continue;
            }

            if let Err(e) = self.renew_leases(&shared.rows).await {
                tracing::warn!(
                    "failed to renew leases for {}: {}",
                    self.table.user_table_name,
                    e
                );
            }

            // Counted whether or not the renewal reached the database: the
            // budget bounds wall-clock time, not successful renewals
            shared.lease_renewal_count += 1;
            if shared.lease_renewal_count == self.config.max_lease_renewal_count
                && !cancellation.is_cancelled()
            {
                tracing::error!(
                    "handler for {} exceeded {} lease renewals; cancelling its execution",
                    self.table.user_table_name,
                    self.config.max_lease_renewal_count
                );
                shared.executor_cancellation.cancel();
                shared.executor_cancellation = CancellationToken::new();
            }
        }
    }

    /// Extend the lease of every row in the current batch. Deliberately not
    /// wrapped in a transaction: a concurrent cleanup deleting a
    /// just-processed row must not roll the other renewals back.
    async fn renew_leases(&self, rows: &[BatchRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut client = mssql::connect(&self.connection_string).await?;
        let renew_sql =
            build_renew_leases_statement(&self.table, self.config.lease_interval_secs());
        for row in rows {
            let mut query = Query::new(renew_sql.clone());
            for value in &row.pk_values {
                query.bind(value.clone());
            }
            query.execute(&mut client).await?;
        }
        Ok(())
    }

    /// Release the batch after a successful handler call and advance the
    /// shared sync version if every competing worker has drained.
    async fn release_rows(&self) {
        let mut shared = self.shared.lock().await;
        if let Err(e) = self.release_and_advance(&shared.rows).await {
            tracing::warn!(
                "failed to release leases for {}: {}; leases will expire and the rows will be reprocessed",
                self.table.user_table_name,
                e
            );
        }
        clear_rows_locked(&mut shared);
    }

    async fn release_and_advance(&self, rows: &[BatchRow]) -> Result<()> {
        let new_last_sync_version = match recompute_last_sync_version(rows) {
            Some(version) => version,
            None => return Ok(()),
        };

        let mut client = mssql::connect(&self.connection_string).await?;
        mssql::begin_repeatable_read(&mut client).await?;
        match self
            .release_in_txn(&mut client, rows, new_last_sync_version)
            .await
        {
            Ok(()) => mssql::commit(&mut client).await,
            Err(e) => {
                let _ = mssql::rollback(&mut client).await;
                Err(e)
            }
        }
    }

    async fn release_in_txn(
        &self,
        client: &mut MssqlClient,
        rows: &[BatchRow],
        new_last_sync_version: i64,
    ) -> Result<()> {
        let table = &self.table;

        for row in rows {
            let release_sql = build_release_rows_statement(table, row.change_version);
            let mut query = Query::new(release_sql);
            for value in &row.pk_values {
                query.bind(value.clone());
            }
            query.execute(client).await?;
        }

        let select_sql = format!(
            "SELECT [LastSyncVersion] FROM {GLOBAL_STATE_TABLE} WITH (TABLOCKX) \
             WHERE [UserFunctionID] = @P1 AND [UserTableID] = @P2;"
        );
        let row = client
            .query(
                select_sql,
                &[&table.user_function_id, &table.user_table_id],
            )
            .await?
            .into_row()
            .await?
            .ok_or_else(|| Error::SyncStateMissing(table.user_table_name.clone()))?;
        let current_last_sync_version = row
            .try_get::<i64, _>(0)?
            .ok_or_else(|| Error::SyncStateMissing(table.user_table_name.clone()))?;

        let count_sql = build_unprocessed_count_query(
            table,
            new_last_sync_version,
            self.config.max_attempt_count,
        );
        let row = client
            .query(count_sql, &[&current_last_sync_version])
            .await?
            .into_row()
            .await?;
        let unprocessed_changes = match row {
            Some(row) => row.try_get::<i64, _>(0)?.unwrap_or(0),
            None => 0,
        };

        if unprocessed_changes == 0 && current_last_sync_version < new_last_sync_version {
            let update_sql = format!(
                "UPDATE {GLOBAL_STATE_TABLE} SET [LastSyncVersion] = @P1 \
                 WHERE [UserFunctionID] = @P2 AND [UserTableID] = @P3;"
            );
            client
                .execute(
                    update_sql,
                    &[
                        &new_last_sync_version,
                        &table.user_function_id,
                        &table.user_table_id,
                    ],
                )
                .await?;
            let cleanup_sql = format!(
                "DELETE FROM {} WHERE [ChangeVersion] <= {};",
                table.worker_table_name, new_last_sync_version
            );
            let cleaned = client.execute(cleanup_sql, &[]).await?.total();
            tracing::info!(
                "advanced sync version for {} from {} to {} ({} worker row(s) cleaned up)",
                table.user_table_name,
                current_last_sync_version,
                new_last_sync_version,
                cleaned
            );
        }

        Ok(())
    }

    async fn clear_rows(&self) {
        let mut shared = self.shared.lock().await;
        clear_rows_locked(&mut shared);
    }
}

/// Positional-parameter match on the worker table's primary key, one
/// placeholder per key column in key order.
fn pk_param_filter(table: &TableMetadata, alias: Option<&str>) -> String {
    table
        .pk_columns
        .iter()
        .enumerate()
        .map(|(index, pk)| {
            let column = quote_ident(&pk.name);
            match alias {
                Some(alias) => format!("{alias}.{column} = @P{}", index + 1),
                None => format!("{column} = @P{}", index + 1),
            }
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn pk_join_condition(table: &TableMetadata, left: &str, right: &str) -> String {
    table
        .pk_columns
        .iter()
        .map(|pk| {
            let column = quote_ident(&pk.name);
            format!("{left}.{column} = {right}.{column}")
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Candidate selection for one polling tick.
///
/// A change qualifies when no worker has claimed it, a worker claimed an
/// older version of it and finished, or the claiming worker's lease has
/// expired - and it has not burned through its attempt budget. Column values
/// are projected as text; deleted rows yield NULL for every non-key column.
fn build_candidate_query(
    table: &TableMetadata,
    batch_size: usize,
    max_attempt_count: i32,
) -> String {
    let mut projection: Vec<String> = table
        .pk_columns
        .iter()
        .map(|pk| {
            let column = quote_ident(&pk.name);
            format!("CONVERT(NVARCHAR(MAX), c.{column}) AS {column}")
        })
        .collect();
    projection.extend(table.non_key_columns.iter().map(|name| {
        let column = quote_ident(name);
        format!("CONVERT(NVARCHAR(MAX), u.{column}) AS {column}")
    }));
    projection.push("c.[SYS_CHANGE_VERSION]".to_string());
    projection.push("c.[SYS_CHANGE_OPERATION]".to_string());

    format!(
        "SELECT TOP ({batch_size}) {projection}\n\
         FROM CHANGETABLE(CHANGES {user_table}, @P1) AS c\n\
         LEFT OUTER JOIN {worker_table} AS w WITH (TABLOCKX) ON {worker_join}\n\
         LEFT OUTER JOIN {user_table} AS u ON {user_join}\n\
         WHERE ((w.[ChangeVersion] IS NULL)\n    \
             OR (w.[ChangeVersion] < c.[SYS_CHANGE_VERSION] AND w.[LeaseExpirationTime] IS NULL)\n    \
             OR (w.[LeaseExpirationTime] < SYSDATETIME()))\n  \
           AND (w.[AttemptCount] IS NULL OR w.[AttemptCount] < {max_attempt_count})\n\
         ORDER BY c.[SYS_CHANGE_VERSION] ASC;",
        projection = projection.join(", "),
        user_table = table.user_table_name,
        worker_table = table.worker_table_name,
        worker_join = pk_join_condition(table, "w", "c"),
        user_join = pk_join_condition(table, "u", "c"),
    )
}

/// Take (or refresh) the lease on one candidate row.
///
/// The attempt count is incremented here, before the handler ever runs, so
/// retries stay bounded even when a worker crashes mid-batch. Runs under an
/// exclusive table lock inside the acquire transaction, which is what makes
/// exactly one competing worker the claimant.
fn build_acquire_lease_statement(
    table: &TableMetadata,
    change_version: i64,
    lease_interval_secs: u64,
) -> String {
    let pk_columns = table
        .pk_columns
        .iter()
        .map(|pk| quote_ident(&pk.name))
        .collect::<Vec<_>>()
        .join(", ");
    let pk_placeholders = (1..=table.pk_columns.len())
        .map(|index| format!("@P{index}"))
        .collect::<Vec<_>>()
        .join(", ");
    let pk_filter = pk_param_filter(table, None);

    format!(
        "IF NOT EXISTS (SELECT 1 FROM {worker} WITH (TABLOCKX) WHERE {pk_filter})\n\
         INSERT INTO {worker} WITH (TABLOCKX) ({pk_columns}, [ChangeVersion], [AttemptCount], [LeaseExpirationTime])\n\
         VALUES ({pk_placeholders}, {change_version}, 1, DATEADD(second, {lease_interval_secs}, SYSDATETIME()))\n\
         ELSE\n\
         UPDATE {worker} WITH (TABLOCKX)\n\
         SET [ChangeVersion] = {change_version}, [AttemptCount] = [AttemptCount] + 1,\n    \
             [LeaseExpirationTime] = DATEADD(second, {lease_interval_secs}, SYSDATETIME())\n\
         WHERE {pk_filter};",
        worker = table.worker_table_name,
    )
}

fn build_renew_leases_statement(table: &TableMetadata, lease_interval_secs: u64) -> String {
    format!(
        "UPDATE {worker} WITH (TABLOCKX)\n\
         SET [LeaseExpirationTime] = DATEADD(second, {lease_interval_secs}, SYSDATETIME())\n\
         WHERE {pk_filter};",
        worker = table.worker_table_name,
        pk_filter = pk_param_filter(table, None),
    )
}

/// Mark one batch row processed: record its version, reset the attempt
/// budget and drop the lease. Guarded so a newer claim is never clobbered.
fn build_release_rows_statement(table: &TableMetadata, change_version: i64) -> String {
    format!(
        "UPDATE {worker} WITH (TABLOCKX)\n\
         SET [ChangeVersion] = {change_version}, [AttemptCount] = 0, [LeaseExpirationTime] = NULL\n\
         WHERE {pk_filter} AND [ChangeVersion] <= {change_version};",
        worker = table.worker_table_name,
        pk_filter = pk_param_filter(table, None),
    )
}

/// Count changes at or below the proposed new sync version that no worker
/// has fully processed yet. A change only counts as processed when a worker
/// row records exactly its version with no outstanding lease; rows abandoned
/// at the attempt limit are excluded so they cannot block advancement
/// forever.
fn build_unprocessed_count_query(
    table: &TableMetadata,
    new_last_sync_version: i64,
    max_attempt_count: i32,
) -> String {
    format!(
        "SELECT COUNT_BIG(*)\n\
         FROM CHANGETABLE(CHANGES {user_table}, @P1) AS c\n\
         LEFT OUTER JOIN {worker_table} AS w WITH (TABLOCKX) ON {worker_join}\n\
         WHERE c.[SYS_CHANGE_VERSION] <= {new_last_sync_version}\n  \
           AND (w.[ChangeVersion] IS NULL OR w.[ChangeVersion] <> c.[SYS_CHANGE_VERSION] OR w.[LeaseExpirationTime] IS NOT NULL)\n  \
           AND (w.[AttemptCount] IS NULL OR w.[AttemptCount] <> {max_attempt_count});",
        user_table = table.user_table_name,
        worker_table = table.worker_table_name,
        worker_join = pk_join_condition(table, "w", "c"),
    )
}
