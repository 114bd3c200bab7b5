//! Source-database boundary.
//!
//! This crate defines the operation-level traits the pipeline runs against
//! ([`SourceDb`], [`SourceConnector`], [`ChangeConduit`]), the Firebird
//! implementation of those traits, and the [`Instrumenter`] that installs
//! and tears down the change-log machinery.
//!
//! The traits are object-safe on purpose: the intake thread and every
//! worker hold a `Box<dyn SourceDb>` without knowing whether it speaks to a
//! live Firebird server or to the in-memory fake used by the tests.

use std::collections::HashMap;
use std::time::Duration;

use till_schemas::{Change, SqlValue};

pub mod firebird;
mod instrument;

pub use firebird::{FirebirdConnector, FirebirdParams};
pub use instrument::Instrumenter;

/// Name of the change-log table written by the recording triggers.
pub const CHANGE_LOG_TABLE: &str = "CHANGES_LOG";
/// Sequence assigning `LOG_ID` values.
pub const CHANGE_LOG_SEQUENCE: &str = "SEQ_CHANGES_LOG";
/// Named database event posted after every change-log insert.
pub const INTAKE_EVENT: &str = "INTAKE_SIGNAL";

/// Pk column of the change log, used by the intake cursor query.
pub const CHANGE_LOG_PK: &str = "LOG_ID";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors surfaced by a source-database implementation.
///
/// The pipeline treats every variant as retryable at the loop level except
/// where a component's contract says otherwise (teardown, recovery
/// assertion); the distinction is made by the caller, not encoded here.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Connecting (or re-connecting) failed.
    #[error("source connect failed: {0}")]
    Connect(String),
    /// A query or statement failed after a connection was established.
    #[error("source database error: {0}")]
    Database(String),
    /// A change-log row could not be decoded into a [`Change`].
    #[error("change log row invalid: {0}")]
    BadLogRow(String),
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Outcome of one conduit wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The intake signal fired.
    Signal,
    /// The wait elapsed without a signal; callers drain the cursor anyway.
    Timeout,
}

/// Subscription to the intake signal.
///
/// Implementations block the calling thread. A conduit belongs to exactly
/// one intake loop and is re-created after a database error.
pub trait ChangeConduit: Send {
    fn wait(&mut self, timeout: Duration) -> Result<Wake, SourceError>;
}

/// One open source-database connection.
///
/// Exclusively owned by one thread at a time; nothing here is `Sync`.
pub trait SourceDb: Send {
    /// Names of all user tables (system tables excluded), trimmed.
    fn table_names(&mut self) -> Result<Vec<String>, SourceError>;

    /// Primary-key columns per table, for every table that declares a
    /// PRIMARY KEY constraint.
    fn primary_key_columns(&mut self) -> Result<HashMap<String, Vec<String>>, SourceError>;

    /// Declared type name of one column (`"INTEGER"`, `"VARCHAR"`, ...).
    fn column_type(&mut self, table: &str, column: &str) -> Result<String, SourceError>;

    /// Create the boolean domain, the change-log table, its sequence and
    /// the intake trigger. Called only when [`CHANGE_LOG_TABLE`] is absent.
    fn create_change_log(&mut self) -> Result<(), SourceError>;

    /// Install the recording trigger `TABLE_{table_id}_CHANGES` on `table`.
    fn create_table_trigger(
        &mut self,
        table: &str,
        table_id: i32,
        pk_column: &str,
    ) -> Result<(), SourceError>;

    /// Drop the recording trigger for `table_id`.
    fn drop_table_trigger(&mut self, table_id: i32) -> Result<(), SourceError>;

    /// Drop the intake trigger, change-log table, sequence and domain.
    fn drop_change_log(&mut self) -> Result<(), SourceError>;

    /// All rows with `LOG_ID >= from_log_id AND PROCESSED = 0`, ordered by
    /// `LOG_ID` ascending.
    fn unprocessed_changes(&mut self, from_log_id: i64) -> Result<Vec<Change>, SourceError>;

    /// Current image of one row, positional in table column order, or
    /// `None` when the row no longer exists.
    fn fetch_row(
        &mut self,
        table: &str,
        pk_column: &str,
        pk_val: i32,
    ) -> Result<Option<Vec<SqlValue>>, SourceError>;

    /// Set `PROCESSED = 1` on one log row.
    fn mark_processed(&mut self, log_id: i64) -> Result<(), SourceError>;

    /// Delete every `PROCESSED = 1` row; returns the count removed.
    fn delete_processed(&mut self) -> Result<u64, SourceError>;

    /// Total rows currently in the change log.
    fn change_log_count(&mut self) -> Result<i64, SourceError>;

    /// Post the intake signal so a blocked conduit wakes up.
    fn post_wake_event(&mut self) -> Result<(), SourceError>;
}

/// Factory for connections and conduits.
///
/// Shared by the supervisor, the intake thread and every worker; each call
/// to [`SourceConnector::connect`] yields an independent connection.
pub trait SourceConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn SourceDb>, SourceError>;
    fn conduit(&self) -> Result<Box<dyn ChangeConduit>, SourceError>;
}
