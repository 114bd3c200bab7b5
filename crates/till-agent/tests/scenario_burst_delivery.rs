//! Burst of mixed mutations across a small worker pool.
//!
//! GREEN when:
//! - 50 round-robin INSERT/UPDATE/DELETE mutations produce exactly 50
//!   POSTs (at-least-once with a healthy endpoint means exactly once).
//! - The change log holds log ids 1..=50, all marked processed.
//! - A restart's recovery pass deletes the processed backlog and leaves
//!   the log empty.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use httpmock::prelude::*;

use till_agent::{AgentState, RunOptions, Supervisor};
use till_config::{AgentConfig, CloudConfig, DatabaseConfig, WorkerConfig};
use till_schemas::SqlValue;
use till_testkit::MemorySource;

fn agent_config(endpoint: String) -> AgentConfig {
    AgentConfig {
        database: DatabaseConfig {
            path: "testkit".into(),
            user: "sysdba".into(),
            password: "masterkey".into(),
            charset: "UTF8".into(),
        },
        workers: WorkerConfig {
            count: 4,
            intake_position: 0,
            queue_capacity: 8,
            poll_interval: Duration::from_millis(20),
        },
        cloud: CloudConfig {
            enabled: true,
            endpoint,
            api_key: None,
            buffer_path: ":memory:".into(),
            background_retry: false,
        },
    }
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn run_agent(
    source: &MemorySource,
    endpoint: String,
) -> (
    Arc<Supervisor>,
    till_agent::StopFlag,
    std::thread::JoinHandle<anyhow::Result<()>>,
) {
    let supervisor = Arc::new(Supervisor::with_connector(
        agent_config(endpoint),
        Arc::new(source.clone()),
    ));
    let stop = supervisor.stop_handle();
    let runner = {
        let supervisor = Arc::clone(&supervisor);
        std::thread::spawn(move || supervisor.run(RunOptions::default()))
    };
    wait_until("agent running", || supervisor.snapshot().state == AgentState::Running);
    (supervisor, stop, runner)
}

#[test]
fn fifty_mutations_four_workers_exactly_fifty_posts() {
    let server = MockServer::start();
    let ingest = server.mock(|when, then| {
        when.method(POST).path("/api/changes");
        then.status(200);
    });

    let source = MemorySource::new();
    source.add_table("USERS", &["ID", "NAME"], "ID", "INTEGER");

    let (_, stop, runner) = run_agent(&source, server.url("/api/changes"));

    for i in 0..50i32 {
        let pk = i / 3 + 1;
        match i % 3 {
            0 => source.insert_row(
                "USERS",
                pk,
                vec![SqlValue::Int(pk as i64), SqlValue::Text(format!("user-{pk}"))],
            ),
            1 => source.update_row(
                "USERS",
                pk,
                vec![SqlValue::Int(pk as i64), SqlValue::Text(format!("user-{pk}v2"))],
            ),
            _ => source.delete_row("USERS", pk),
        }
    }

    wait_until("all 50 changes processed", || {
        let log = source.change_log();
        log.len() == 50 && log.iter().all(|c| c.processed)
    });
    wait_until("all 50 posts arrived", || ingest.hits() == 50);

    // Contiguous log ids in commit order, no duplicates.
    let ids: BTreeSet<i64> = source.change_log().iter().map(|c| c.log_id).collect();
    assert_eq!(ids, (1..=50).collect::<BTreeSet<i64>>());

    stop.set();
    runner.join().unwrap().unwrap();
    assert_eq!(ingest.hits(), 50, "no duplicate deliveries after drain");

    // "Restart": the next run's recovery pass clears the processed rows.
    let (_, stop2, runner2) = run_agent(&source, server.url("/api/changes"));
    assert_eq!(source.log_len(), 0, "recovery left the change log empty");
    assert_eq!(ingest.hits(), 50, "processed rows are never re-delivered");
    stop2.set();
    runner2.join().unwrap().unwrap();
}
