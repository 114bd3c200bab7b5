//! The TillStream pipeline: intake thread, worker pool, startup recovery
//! and the supervisor that wires them together.
//!
//! Data flow: recording trigger → `CHANGES_LOG` row → intake signal →
//! [`intake`] thread → bounded in-process queue → [`worker`] → row
//! hydration → cloud sender (or local buffer) → `PROCESSED = 1`.
//!
//! Delivery is at-least-once keyed on `log_id`; the worker pool does not
//! preserve log order across workers; consumers reorder and dedupe.

use till_cloud::CloudError;
use till_source::SourceError;

pub mod intake;
pub mod pipeline;
pub mod recovery;
pub mod supervisor;
pub mod worker;

pub use supervisor::{AgentState, RunOptions, StatusSnapshot, StopFlag, Supervisor};

/// Pipeline-level errors.
///
/// Worker loops log these and move on (the change stays unprocessed for
/// the next startup recovery); the recovery pass and the supervisor treat
/// them as fatal.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// A change-log row references a table id that is not in this
    /// process's maps (instrumentation changed under a non-empty log).
    #[error("change log references unknown table id {0}")]
    UnknownTable(i32),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    /// The change log still held rows after the recovery pass drained and
    /// deleted everything it knew about.
    #[error("change log not empty after recovery ({0} rows); a writer was active during startup")]
    DirtyLogAfterRecovery(i64),
}
