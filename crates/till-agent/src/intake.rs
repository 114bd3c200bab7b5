//! The intake thread: drains the change log into the in-process queue.
//!
//! One long-lived thread owning one source connection and one conduit.
//! Every wake (signal or interval) runs the cursor query
//! `LOG_ID >= cursor AND PROCESSED = 0` and pushes the decoded changes
//! onto the bounded queue; the cursor advances only after a successful
//! push, so a database error never skips a row. Database errors tear down
//! the connection and conduit, wait briefly, and reconnect.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{debug, error, info};

use till_schemas::Change;
use till_source::{SourceConnector, SourceDb};

use crate::supervisor::StopFlag;

/// Delay before reopening the connection after a database error.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub struct IntakeHandle {
    handle: JoinHandle<()>,
}

impl IntakeHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub(crate) fn into_join_handle(self) -> JoinHandle<()> {
        self.handle
    }
}

pub fn spawn(
    connector: Arc<dyn SourceConnector>,
    start_position: i64,
    poll_interval: Duration,
    queue: Sender<Change>,
    stop: StopFlag,
) -> IntakeHandle {
    let handle = std::thread::Builder::new()
        .name("till-intake".to_string())
        .spawn(move || run(connector, start_position, poll_interval, queue, stop))
        .expect("spawn intake thread");
    IntakeHandle { handle }
}

fn run(
    connector: Arc<dyn SourceConnector>,
    start_position: i64,
    poll_interval: Duration,
    queue: Sender<Change>,
    stop: StopFlag,
) {
    info!(position = start_position, "starting intake on the change log");
    let mut cursor = start_position;

    'reconnect: while !stop.is_set() {
        let mut db = match connector.connect() {
            Ok(db) => db,
            Err(err) => {
                error!(%err, "intake could not connect, retrying");
                stop.wait(RECONNECT_DELAY);
                continue;
            }
        };
        let mut conduit = match connector.conduit() {
            Ok(c) => c,
            Err(err) => {
                error!(%err, "intake could not open its conduit, retrying");
                stop.wait(RECONNECT_DELAY);
                continue;
            }
        };

        // Drain immediately after (re)connecting: the signal may have
        // fired while we were away.
        loop {
            if stop.is_set() {
                break 'reconnect;
            }
            match drain(db.as_mut(), &mut cursor, &queue) {
                Ok(true) => {}
                // Queue disconnected: the workers are gone, we are done.
                Ok(false) => break 'reconnect,
                Err(err) => {
                    error!(%err, "database error in intake loop, reconnecting");
                    drop(conduit);
                    drop(db);
                    stop.wait(RECONNECT_DELAY);
                    continue 'reconnect;
                }
            }
            if stop.is_set() {
                break 'reconnect;
            }
            if let Err(err) = conduit.wait(poll_interval) {
                error!(%err, "conduit error in intake loop, reconnecting");
                drop(conduit);
                drop(db);
                stop.wait(RECONNECT_DELAY);
                continue 'reconnect;
            }
        }
    }

    info!("stopping changes intake");
}

/// Push every unprocessed row at or past the cursor. Returns `Ok(false)`
/// when the queue has no receivers left.
fn drain(
    db: &mut dyn SourceDb,
    cursor: &mut i64,
    queue: &Sender<Change>,
) -> Result<bool, till_source::SourceError> {
    let rows = db.unprocessed_changes(*cursor)?;
    if rows.is_empty() {
        return Ok(true);
    }
    debug!(position = *cursor, count = rows.len(), "intake picked up changes");

    for change in rows {
        let next = change.log_id + 1;
        // Blocks when the queue is full: back-pressure on purpose.
        if queue.send(change).is_err() {
            return Ok(false);
        }
        *cursor = next;
    }
    Ok(true)
}
