//! The worker pool: N threads draining the shared change queue.
//!
//! Shutdown is signalled by closing the channel: once every sender is
//! dropped the workers finish the remaining messages and exit on
//! disconnect. A failed change is logged and left `PROCESSED = 0`; the
//! next startup's recovery pass re-drives it.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Receiver;
use tracing::{error, info};

use till_cloud::CloudClient;
use till_schemas::{Change, TableMaps};
use till_source::SourceConnector;

use crate::pipeline::deliver_change;

pub fn spawn_workers(
    count: usize,
    connector: Arc<dyn SourceConnector>,
    maps: Arc<TableMaps>,
    cloud: Option<Arc<CloudClient>>,
    queue: Receiver<Change>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|worker_id| {
            let connector = Arc::clone(&connector);
            let maps = Arc::clone(&maps);
            let cloud = cloud.clone();
            let queue = queue.clone();
            std::thread::Builder::new()
                .name(format!("till-worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, connector, maps, cloud, queue))
                .expect("spawn worker thread")
        })
        .collect()
}

fn worker_loop(
    worker_id: usize,
    connector: Arc<dyn SourceConnector>,
    maps: Arc<TableMaps>,
    cloud: Option<Arc<CloudClient>>,
    queue: Receiver<Change>,
) {
    let mut db = match connector.connect() {
        Ok(db) => db,
        Err(err) => {
            error!(worker_id, %err, "worker could not open its connection, exiting");
            return;
        }
    };
    info!(worker_id, "worker started");

    // recv() errors only when the channel is closed and drained.
    while let Ok(change) = queue.recv() {
        let log_id = change.log_id;
        if let Err(err) = deliver_change(db.as_mut(), &maps, cloud.as_deref(), &change) {
            error!(
                worker_id,
                log_id,
                %err,
                "change left unprocessed, will be re-driven on next start"
            );
        }
    }

    info!(worker_id, "worker exiting");
}
