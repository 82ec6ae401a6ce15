// ABOUTME: Change trigger module - initialization and the long-running monitor
// ABOUTME: Watches one change-tracked table and dispatches leased batches to a handler

pub mod batch;
pub mod init;
pub mod monitor;

pub use batch::{recompute_last_sync_version, BatchRow};
pub use init::{PrimaryKeyColumn, TableMetadata, TriggerListener};
pub use monitor::ChangeMonitor;
