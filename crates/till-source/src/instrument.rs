//! Change-log installation and teardown.
//!
//! Setup is idempotent: the change log is created only when missing, and
//! the per-table triggers use CREATE OR ALTER semantics in the Firebird
//! implementation. A table is instrumented only when it has exactly one
//! primary-key column of declared type INTEGER; everything else is skipped
//! and never appears in the returned maps.

use tracing::{debug, info, warn};

use till_schemas::TableMaps;

use crate::{SourceDb, SourceError, CHANGE_LOG_TABLE};

pub struct Instrumenter<'a> {
    db: &'a mut dyn SourceDb,
}

impl<'a> Instrumenter<'a> {
    pub fn new(db: &'a mut dyn SourceDb) -> Self {
        Self { db }
    }

    /// Install the change log (if absent) and one recording trigger per
    /// eligible table. Returns the table maps for this process.
    ///
    /// Trigger installation failures are logged and the table is dropped
    /// from the maps; they never fail the setup.
    pub fn setup(&mut self) -> Result<TableMaps, SourceError> {
        let tables = self.db.table_names()?;

        if tables.iter().any(|t| t == CHANGE_LOG_TABLE) {
            info!("change log table found, skipping creation");
        } else {
            info!("no change log table detected, creating one");
            self.db.create_change_log()?;
        }

        let pk_columns = self.db.primary_key_columns()?;
        let mut maps = TableMaps::new();

        for table in &tables {
            if table == CHANGE_LOG_TABLE {
                continue;
            }
            let Some(cols) = pk_columns.get(table) else {
                debug!(%table, "skipped: no primary key");
                continue;
            };
            if cols.len() != 1 {
                debug!(%table, columns = cols.len(), "skipped: composite primary key");
                continue;
            }
            let pk = &cols[0];
            let declared = self.db.column_type(table, pk)?;
            if declared != "INTEGER" {
                debug!(%table, pk_type = %declared, "skipped: non-integer primary key");
                continue;
            }

            let table_id = maps.insert(table, pk);
            if let Err(err) = self.db.create_table_trigger(table, table_id, pk) {
                warn!(%table, %err, "unable to create recording trigger, skipping table");
                maps.remove(table_id);
            }
        }

        info!(instrumented = maps.len(), "instrumentation complete");
        Ok(maps)
    }

    /// Drop every recording trigger, then the intake trigger, change-log
    /// table, sequence and domain. Any failure is returned to the caller
    /// and aborts the process.
    ///
    /// Eligible tables are re-derived with the same filter as [`setup`],
    /// so the trigger names line up with what a previous setup installed.
    ///
    /// [`setup`]: Instrumenter::setup
    pub fn reset_state(&mut self) -> Result<(), SourceError> {
        info!("resetting instrumentation state");

        let tables = self.db.table_names()?;
        let pk_columns = self.db.primary_key_columns()?;

        let mut table_id = 0;
        for table in &tables {
            if table == CHANGE_LOG_TABLE {
                continue;
            }
            let Some(cols) = pk_columns.get(table) else { continue };
            if cols.len() != 1 || self.db.column_type(table, &cols[0])? != "INTEGER" {
                continue;
            }

            if let Err(err) = self.db.drop_table_trigger(table_id) {
                warn!(%table, table_id, %err, "unable to drop recording trigger");
                return Err(err);
            }
            table_id += 1;
        }
        info!(dropped = table_id, "dropped all recording triggers");

        self.db.drop_change_log()?;
        info!("state reset successfully");
        Ok(())
    }
}
