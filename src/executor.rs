// ABOUTME: The consumed handler interface - typed row changes dispatched per batch
// ABOUTME: Handlers get a cancellation token and must honor it when the engine aborts them

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Kind of row-level change reported by change tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlChangeOperation {
    Insert,
    Update,
    Delete,
}

impl SqlChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlChangeOperation::Insert => "insert",
            SqlChangeOperation::Update => "update",
            SqlChangeOperation::Delete => "delete",
        }
    }

    /// Decode a `SYS_CHANGE_OPERATION` code.
    pub(crate) fn from_tracking_code(code: &str) -> Result<Self> {
        match code {
            "I" => Ok(SqlChangeOperation::Insert),
            "U" => Ok(SqlChangeOperation::Update),
            "D" => Ok(SqlChangeOperation::Delete),
            other => Err(Error::UnknownOperation(other.to_string())),
        }
    }
}

/// One row-level change delivered to the handler.
///
/// For inserts and updates `item` carries the full row; for deletes only the
/// primary-key fields are populated (the row no longer exists in the user
/// table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlChange<T> {
    pub operation: SqlChangeOperation,
    pub item: T,
}

/// User-supplied batch handler.
///
/// `try_execute` is invoked once per acquired batch. Returning `Ok(())`
/// releases the batch's leases and lets the shared sync version advance;
/// returning an error abandons the attempt so the leases expire and another
/// worker retries. A long-running handler must watch `cancellation` - the
/// engine cancels it when the handler has outlived its renewal budget.
#[async_trait]
pub trait ChangeExecutor<T>: Send + Sync {
    async fn try_execute(
        &self,
        changes: Vec<SqlChange<T>>,
        cancellation: CancellationToken,
    ) -> anyhow::Result<()>;
}
