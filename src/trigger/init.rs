// ABOUTME: One-shot trigger initialization - table discovery and coordination DDL
// ABOUTME: Resolves the user table, creates the shared state tables, then starts the monitor

use std::sync::Arc;

use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

use crate::config::TriggerConfig;
use crate::error::{Error, Result};
use crate::executor::ChangeExecutor;
use crate::mssql::{self, quote_ident, MssqlClient};
use crate::trigger::monitor::{self, ChangeMonitor, MonitorWorker};

/// Reserved schema holding every coordination table of this engine.
pub(crate) const SCHEMA_NAME: &str = "change_trigger";

/// Shared registry of (function, table) -> last fully processed sync version.
pub(crate) const GLOBAL_STATE_TABLE: &str = "[change_trigger].[GlobalState]";

pub(crate) const MIN_VALID_VERSION_SQL: &str = "SELECT CHANGE_TRACKING_MIN_VALID_VERSION(@P1);";

const CREATE_SCHEMA_SQL: &str = "\
IF SCHEMA_ID(N'change_trigger') IS NULL
    EXEC ('CREATE SCHEMA [change_trigger]');";

const CREATE_GLOBAL_STATE_SQL: &str = "\
IF OBJECT_ID(N'[change_trigger].[GlobalState]', 'U') IS NULL
CREATE TABLE [change_trigger].[GlobalState] (
    [UserFunctionID] char(16) NOT NULL,
    [UserTableID] int NOT NULL,
    [LastSyncVersion] bigint NOT NULL,
    PRIMARY KEY ([UserFunctionID], [UserTableID])
);";

const SEED_GLOBAL_STATE_SQL: &str = "\
IF NOT EXISTS (
    SELECT 1 FROM [change_trigger].[GlobalState]
    WHERE [UserFunctionID] = @P1 AND [UserTableID] = @P2
)
INSERT INTO [change_trigger].[GlobalState] ([UserFunctionID], [UserTableID], [LastSyncVersion])
VALUES (@P1, @P2, @P3);";

const PK_COLUMNS_QUERY: &str = "\
SELECT c.name AS [column_name], t.name AS [type_name],
       c.max_length AS [max_length], c.[precision] AS [precision], c.scale AS [scale]
FROM sys.indexes AS i
INNER JOIN sys.index_columns AS ic ON i.object_id = ic.object_id AND i.index_id = ic.index_id
INNER JOIN sys.columns AS c ON ic.object_id = c.object_id AND ic.column_id = c.column_id
INNER JOIN sys.types AS t ON c.user_type_id = t.user_type_id
WHERE i.is_primary_key = 1 AND i.object_id = @P1
ORDER BY ic.key_ordinal;";

const ALL_COLUMNS_QUERY: &str = "\
SELECT c.name AS [column_name]
FROM sys.columns AS c
WHERE c.object_id = @P1
ORDER BY c.column_id;";

/// A primary-key column with its DDL-precise type rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKeyColumn {
    pub name: String,
    pub sql_type: String,
}

/// Catalog identity of the monitored table, resolved once at initialization
/// and canonical for the rest of the session.
#[derive(Debug, Clone)]
pub struct TableMetadata {
    /// Stable object id of the user table
    pub user_table_id: i32,
    /// Bracket-quoted `[schema].[table]`, built from catalog-sourced names
    pub user_table_name: String,
    /// Bracket-quoted name of this (function, table)'s worker table
    pub worker_table_name: String,
    /// 16-hex-char folded function identity stored in the global state table
    pub user_function_id: String,
    /// Primary-key columns in key ordinal order
    pub pk_columns: Vec<PrimaryKeyColumn>,
    /// Remaining columns in catalog order
    pub non_key_columns: Vec<String>,
}

impl TableMetadata {
    /// All user-table column names: primary key first, then the rest in
    /// catalog order.
    pub fn user_table_columns(&self) -> impl Iterator<Item = &str> {
        self.pk_columns
            .iter()
            .map(|pk| pk.name.as_str())
            .chain(self.non_key_columns.iter().map(String::as_str))
    }
}

/// Render a catalog type into DDL text.
///
/// Character and binary types carry their declared length (`(max)` when the
/// catalog reports -1); numeric and decimal carry precision and scale; every
/// other type is rendered bare.
fn render_column_type(type_name: &str, max_length: i16, precision: u8, scale: u8) -> String {
    match type_name {
        "varchar" | "nvarchar" | "nchar" | "char" | "binary" | "varbinary" => {
            if max_length == -1 {
                format!("{type_name}(max)")
            } else {
                format!("{type_name}({max_length})")
            }
        }
        "numeric" | "decimal" => format!("{type_name}({precision},{scale})"),
        _ => type_name.to_string(),
    }
}

/// Fold an arbitrary caller-supplied function id into the 16-hex-char
/// identity stored in the global state table and embedded in the worker
/// table name.
fn function_key(user_function_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_function_id.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

fn build_worker_table_ddl(table: &TableMetadata) -> String {
    let pk_definitions = table
        .pk_columns
        .iter()
        .map(|pk| format!("{} {} NOT NULL", quote_ident(&pk.name), pk.sql_type))
        .collect::<Vec<_>>()
        .join(",\n    ");
    let pk_names = table
        .pk_columns
        .iter()
        .map(|pk| quote_ident(&pk.name))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "IF OBJECT_ID(N'{worker}', 'U') IS NULL\n\
         CREATE TABLE {worker} (\n    \
             {pk_definitions},\n    \
             [ChangeVersion] bigint NOT NULL,\n    \
             [AttemptCount] int NOT NULL,\n    \
             [LeaseExpirationTime] datetime2,\n    \
             PRIMARY KEY ({pk_names})\n\
         );",
        worker = table.worker_table_name,
    )
}

/// Bootstraps a change trigger for one user table.
///
/// `start` performs the one-shot initialization sequence - table resolution,
/// schema discovery, coordination DDL, sync-version seeding - and hands the
/// resolved metadata to a freshly spawned [`ChangeMonitor`]. Initialization
/// is idempotent: every DDL statement and the seed insert are guarded, so
/// re-running it never disturbs an in-flight monitor elsewhere.
pub struct TriggerListener<T> {
    connection_string: String,
    user_table_name: String,
    user_function_id: String,
    executor: Arc<dyn ChangeExecutor<T>>,
    config: TriggerConfig,
}

impl<T> TriggerListener<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        connection_string: impl Into<String>,
        user_table_name: impl Into<String>,
        user_function_id: impl Into<String>,
        executor: Arc<dyn ChangeExecutor<T>>,
        config: TriggerConfig,
    ) -> Result<Self> {
        let connection_string = connection_string.into();
        let user_table_name = user_table_name.into();
        let user_function_id = user_function_id.into();

        if connection_string.trim().is_empty() {
            return Err(Error::Config("connection string is empty".to_string()));
        }
        if user_table_name.trim().is_empty() {
            return Err(Error::Config("user table name is empty".to_string()));
        }
        if user_function_id.trim().is_empty() {
            return Err(Error::Config("user function id is empty".to_string()));
        }
        config.validate()?;

        Ok(Self {
            connection_string,
            user_table_name,
            user_function_id,
            executor,
            config,
        })
    }

    /// Initialize the coordination tables and start the change monitor.
    pub async fn start(self) -> Result<ChangeMonitor> {
        tracing::info!(
            "starting change trigger for table '{}' ({})",
            self.user_table_name,
            mssql::redact_connection_string(&self.connection_string)
        );

        let mut client = mssql::connect_with_retry(&self.connection_string).await?;
        let table = self.discover_table(&mut client).await?;
        self.create_coordination_tables(&mut client, &table).await?;

        tracing::info!(
            "initialized change trigger for {} (object id {}); worker table {}",
            table.user_table_name,
            table.user_table_id,
            table.worker_table_name
        );

        let worker = MonitorWorker::new(
            self.connection_string,
            self.config,
            Arc::new(table),
            self.executor,
        );
        Ok(monitor::spawn(worker))
    }

    /// Resolve the table's catalog identity: object id, canonical quoted
    /// name, primary-key columns (with DDL-precise types) and the remaining
    /// columns in catalog order.
    async fn discover_table(&self, client: &mut MssqlClient) -> Result<TableMetadata> {
        let row = client
            .query("SELECT OBJECT_ID(@P1, N'U');", &[&self.user_table_name])
            .await?
            .into_row()
            .await?;
        let user_table_id = match row {
            Some(row) => row.try_get::<i32, _>(0)?,
            None => None,
        }
        .ok_or_else(|| Error::TableNotFound(self.user_table_name.clone()))?;

        // Re-read the canonical schema and table name so query text only ever
        // embeds catalog-sourced identifiers
        let row = client
            .query(
                "SELECT OBJECT_SCHEMA_NAME(@P1), OBJECT_NAME(@P1);",
                &[&user_table_id],
            )
            .await?
            .into_row()
            .await?
            .ok_or_else(|| Error::TableNotFound(self.user_table_name.clone()))?;
        let schema = row
            .try_get::<&str, _>(0)?
            .ok_or_else(|| Error::TableNotFound(self.user_table_name.clone()))?
            .to_string();
        let name = row
            .try_get::<&str, _>(1)?
            .ok_or_else(|| Error::TableNotFound(self.user_table_name.clone()))?
            .to_string();
        let user_table_name = format!("{}.{}", quote_ident(&schema), quote_ident(&name));

        let rows = client
            .query(PK_COLUMNS_QUERY, &[&user_table_id])
            .await?
            .into_first_result()
            .await?;
        let mut pk_columns = Vec::with_capacity(rows.len());
        for row in &rows {
            let column_name = row
                .try_get::<&str, _>("column_name")?
                .ok_or_else(|| Error::Decode("primary key column name is null".to_string()))?
                .to_string();
            let type_name = row
                .try_get::<&str, _>("type_name")?
                .ok_or_else(|| Error::Decode("primary key type name is null".to_string()))?;
            let max_length = row.try_get::<i16, _>("max_length")?.unwrap_or(0);
            let precision = row.try_get::<u8, _>("precision")?.unwrap_or(0);
            let scale = row.try_get::<u8, _>("scale")?.unwrap_or(0);
            pk_columns.push(PrimaryKeyColumn {
                name: column_name,
                sql_type: render_column_type(type_name, max_length, precision, scale),
            });
        }
        if pk_columns.is_empty() {
            return Err(Error::NoPrimaryKey(self.user_table_name.clone()));
        }

        let rows = client
            .query(ALL_COLUMNS_QUERY, &[&user_table_id])
            .await?
            .into_first_result()
            .await?;
        let mut non_key_columns = Vec::new();
        for row in &rows {
            let column_name = row
                .try_get::<&str, _>("column_name")?
                .ok_or_else(|| Error::Decode("column name is null".to_string()))?
                .to_string();
            if !pk_columns.iter().any(|pk| pk.name == column_name) {
                non_key_columns.push(column_name);
            }
        }

        let user_function_id = function_key(&self.user_function_id);
        let worker_table_name = format!(
            "[{}].[Worker_{}_{}]",
            SCHEMA_NAME, user_function_id, user_table_id
        );

        Ok(TableMetadata {
            user_table_id,
            user_table_name,
            worker_table_name,
            user_function_id,
            pk_columns,
            non_key_columns,
        })
    }

    /// Create the reserved schema, global state table and worker table, and
    /// seed the sync-version row, all in one RepeatableRead transaction.
    async fn create_coordination_tables(
        &self,
        client: &mut MssqlClient,
        table: &TableMetadata,
    ) -> Result<()> {
        mssql::begin_repeatable_read(client).await?;
        match self.create_tables_in_txn(client, table).await {
            Ok(()) => mssql::commit(client).await,
            Err(e) => {
                let _ = mssql::rollback(client).await;
                Err(e)
            }
        }
    }

    async fn create_tables_in_txn(
        &self,
        client: &mut MssqlClient,
        table: &TableMetadata,
    ) -> Result<()> {
        client.execute(CREATE_SCHEMA_SQL, &[]).await?;
        client.execute(CREATE_GLOBAL_STATE_SQL, &[]).await?;

        // A NULL minimum valid version means change tracking is off for the
        // table; refuse to seed rather than inserting into a NOT NULL column
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

        client
            .execute(
                SEED_GLOBAL_STATE_SQL,
                &[
                    &table.user_function_id,
                    &table.user_table_id,
                    &min_valid_version,
                ],
            )
            .await?;
        client.execute(build_worker_table_ddl(table), &[]).await?;
        Ok(())
    }
}
