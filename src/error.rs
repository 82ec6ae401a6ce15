// ABOUTME: Error types for the change-trigger engine
// ABOUTME: Separates refusal-to-start errors from runtime database failures

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("table '{0}' was not found in the target database")]
    TableNotFound(String),

    #[error("table '{0}' has no primary key")]
    NoPrimaryKey(String),

    #[error("change tracking is not enabled on table '{0}'")]
    ChangeTrackingNotEnabled(String),

    #[error("sync state row is missing for table '{0}'")]
    SyncStateMissing(String),

    #[error("failed to decode change row: {0}")]
    Decode(String),

    #[error("unknown change operation code '{0}'")]
    UnknownOperation(String),

    #[error("database error: {0}")]
    Database(#[from] tiberius::error::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
