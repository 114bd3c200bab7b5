//! Startup recovery: drain the backlog, then prove the log is clean.
//!
//! Runs after instrumentation and before the intake thread exists. Every
//! row still `PROCESSED = 0`, whatever a previous process left behind,
//! goes through the same delivery routine the workers use, in `LOG_ID`
//! order. Processed rows are then deleted in bulk, and the log must come
//! out empty: a row appearing during recovery means another writer was
//! active, which this agent treats as a fatal startup condition.

use tracing::info;

use till_cloud::CloudClient;
use till_schemas::TableMaps;
use till_source::SourceDb;

use crate::pipeline::deliver_change;
use crate::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Rows re-driven through the delivery routine.
    pub replayed: usize,
    /// Processed rows deleted at the end of the pass.
    pub deleted: u64,
}

pub fn run(
    db: &mut dyn SourceDb,
    maps: &TableMaps,
    cloud: Option<&CloudClient>,
) -> Result<RecoveryReport, AgentError> {
    let leftovers = db.unprocessed_changes(0)?;
    if !leftovers.is_empty() {
        info!(count = leftovers.len(), "processing leftover mutations");
    }

    for change in &leftovers {
        deliver_change(db, maps, cloud, change)?;
    }

    info!("deleting processed mutations");
    let deleted = db.delete_processed()?;

    let remaining = db.change_log_count()?;
    if remaining != 0 {
        return Err(AgentError::DirtyLogAfterRecovery(remaining));
    }

    Ok(RecoveryReport {
        replayed: leftovers.len(),
        deleted,
    })
}
