// ABOUTME: In-memory model of one polled change batch
// ABOUTME: Decodes change-tracking rows into typed handler payloads and recomputes the sync watermark

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::executor::{SqlChange, SqlChangeOperation};
use crate::trigger::init::TableMetadata;

pub(crate) const SYS_CHANGE_VERSION: &str = "SYS_CHANGE_VERSION";
pub(crate) const SYS_CHANGE_OPERATION: &str = "SYS_CHANGE_OPERATION";

/// One candidate row selected by a polling tick.
///
/// Column values are carried as strings (the catalog rendering produced by
/// the candidate query); they are the canonical wire form between the
/// database and the handler. Deleted rows only carry primary-key values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRow {
    /// Change version reported for this row
    pub change_version: i64,
    /// Raw operation code from change tracking ("I", "U" or "D")
    pub operation: String,
    /// Primary-key values in primary-key column order
    pub pk_values: Vec<String>,
    /// All selected column values, keyed by column name
    pub values: HashMap<String, Option<String>>,
}

impl BatchRow {
    /// Decode one result row of the candidate query.
    pub(crate) fn from_sql_row(row: &tiberius::Row, table: &TableMetadata) -> Result<Self> {
        let change_version = row
            .try_get::<i64, _>(SYS_CHANGE_VERSION)?
            .ok_or_else(|| Error::Decode("row is missing SYS_CHANGE_VERSION".to_string()))?;
        let operation = row
            .try_get::<&str, _>(SYS_CHANGE_OPERATION)?
            .ok_or_else(|| Error::Decode("row is missing SYS_CHANGE_OPERATION".to_string()))?
            .trim()
            .to_string();

        let mut values = HashMap::new();
        for column in table.user_table_columns() {
            let value: Option<&str> = row.try_get::<&str, _>(column)?;
            values.insert(column.to_string(), value.map(str::to_string));
        }
        values.insert(
            SYS_CHANGE_VERSION.to_string(),
            Some(change_version.to_string()),
        );
        values.insert(SYS_CHANGE_OPERATION.to_string(), Some(operation.clone()));

        let pk_values = table
            .pk_columns
            .iter()
            .map(|pk| {
                values.get(pk.name.as_str()).cloned().flatten().ok_or_else(|| {
                    Error::Decode(format!("primary key column '{}' is null", pk.name))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            change_version,
            operation,
            pk_values,
            values,
        })
    }
}

/// Decode a polled batch into the ordered handler payload.
///
/// Inserts and updates carry every user-table column; deletes carry only the
/// primary-key columns. Each payload round-trips through JSON into the
/// handler's row type.
pub(crate) fn build_changes<T>(table: &TableMetadata, rows: &[BatchRow]) -> Result<Vec<SqlChange<T>>>
where
    T: DeserializeOwned,
{
    rows.iter()
        .map(|row| {
            let operation = SqlChangeOperation::from_tracking_code(&row.operation)?;

            let mut payload = serde_json::Map::new();
            let columns: Vec<&str> = match operation {
                SqlChangeOperation::Delete => {
                    table.pk_columns.iter().map(|pk| pk.name.as_str()).collect()
                }
                _ => table.user_table_columns().collect(),
            };
            for column in columns {
                let value = row.values.get(column).cloned().flatten();
                payload.insert(
                    column.to_string(),
                    match value {
                        Some(text) => Value::String(text),
                        None => Value::Null,
                    },
                );
            }

            let item: T = serde_json::from_value(Value::Object(payload))?;
            Ok(SqlChange { operation, item })
        })
        .collect()
}

/// Recompute the sync version a successfully processed batch permits.
///
/// The batch is size-capped, so further changes at its largest version may
/// exist that this worker has not seen; with two or more distinct versions
/// the second-largest is the highest safe candidate. Returns `None` for an
/// empty batch.
pub fn recompute_last_sync_version(rows: &[BatchRow]) -> Option<i64> {
    let mut versions: Vec<i64> = rows.iter().map(|row| row.change_version).collect();
    versions.sort_unstable();
    versions.dedup();
    match versions.len() {
        0 => None,
        1 => Some(versions[0]),
        n => Some(versions[n - 2]),
    }
}
