//! The per-change delivery routine shared by workers and startup recovery.

use tracing::debug;

use till_cloud::CloudClient;
use till_schemas::{Change, Mutation, TableMaps};
use till_source::SourceDb;

use crate::AgentError;

/// Hydrate one change, hand it to the sender, then mark the log row
/// processed.
///
/// INSERT/UPDATE read the current row image by primary key; a row that
/// vanished in between is delivered with a null `row_data`. DELETE never
/// touches the source table. `cloud` is `None` when cloud sync is
/// disabled; the change is then only marked processed.
///
/// A send that ends up in the local buffer counts as delivered here; the
/// sweeper owns it from that point on.
pub fn deliver_change(
    db: &mut dyn SourceDb,
    maps: &TableMaps,
    cloud: Option<&CloudClient>,
    change: &Change,
) -> Result<(), AgentError> {
    let table = maps
        .table_for_id(change.table_id)
        .ok_or(AgentError::UnknownTable(change.table_id))?;
    let pk_column = maps
        .pk_for_table(table)
        .ok_or(AgentError::UnknownTable(change.table_id))?;

    if let Some(cloud) = cloud {
        let timestamp = change.unix_timestamp();
        match change.mutation {
            Mutation::Insert | Mutation::Update => {
                let row = db.fetch_row(table, pk_column, change.pk_val)?;
                if row.is_none() {
                    debug!(
                        log_id = change.log_id,
                        table,
                        pk_val = change.pk_val,
                        "row vanished before hydration, delivering null row"
                    );
                }
                match change.mutation {
                    Mutation::Insert => cloud.send_insert(table, row, timestamp)?,
                    _ => cloud.send_update(table, row, timestamp)?,
                };
            }
            Mutation::Delete => {
                cloud.send_delete(table, pk_column, change.pk_val, timestamp)?;
            }
        }
    }

    db.mark_processed(change.log_id)?;
    Ok(())
}
