//! Supervisor lifecycle: state sequence, bounded shutdown, reset flags.
//!
//! GREEN when:
//! - The status callback sees the lifecycle in order: connecting →
//!   schema_ready → recovering → running → draining → stopped.
//! - After the stop flag is set, the whole agent drains and joins within
//!   a bounded time.
//! - --reset-and-exit tears the instrumentation down and returns without
//!   entering the pipeline.
//! - Fatal startup conditions surface as Err and an error status.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use httpmock::prelude::*;

use till_agent::{AgentState, RunOptions, Supervisor};
use till_config::{AgentConfig, CloudConfig, DatabaseConfig, WorkerConfig};
use till_schemas::{Mutation, SqlValue};
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
            count: 3,
            intake_position: 0,
            queue_capacity: 16,
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
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn lifecycle_states_are_seen_in_order_and_shutdown_is_bounded() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/api/changes");
        then.status(200);
    });

    let source = MemorySource::new();
    source.add_table("USERS", &["ID"], "ID", "INTEGER");

    let seen: Arc<Mutex<Vec<AgentState>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let supervisor = Arc::new(
        Supervisor::with_connector(
            agent_config(server.url("/api/changes")),
            Arc::new(source.clone()),
        )
        .on_status_change(Box::new(move |snap| {
            let mut states = sink.lock().unwrap();
            if states.last() != Some(&snap.state) {
                states.push(snap.state);
            }
        })),
    );
    let stop = supervisor.stop_handle();
    let runner = {
        let supervisor = Arc::clone(&supervisor);
        std::thread::spawn(move || supervisor.run(RunOptions::default()))
    };
    wait_until("agent running", || {
        supervisor.snapshot().state == AgentState::Running
    });

    source.insert_row("USERS", 1, vec![SqlValue::Int(1)]);
    wait_until("change processed", || {
        source.change_log().iter().all(|c| c.processed)
    });

    let drain_started = Instant::now();
    stop.set();
    runner.join().unwrap().unwrap();
    assert!(
        drain_started.elapsed() < Duration::from_secs(10),
        "shutdown exceeded its bound"
    );

    let states = seen.lock().unwrap().clone();
    let expected = [
        AgentState::Connecting,
        AgentState::SchemaReady,
        AgentState::Recovering,
        AgentState::Running,
        AgentState::Draining,
        AgentState::Stopped,
    ];
    // Every expected state appears, in order (pending-count refreshes may
    // repeat states in between; dedup handled by the callback above).
    let mut cursor = 0;
    for state in states.iter() {
        if cursor < expected.len() && *state == expected[cursor] {
            cursor += 1;
        }
    }
    assert_eq!(
        cursor,
        expected.len(),
        "lifecycle out of order, saw: {states:?}"
    );
}

#[test]
fn reset_and_exit_tears_down_and_returns() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/api/changes");
        then.status(200);
    });

    let source = MemorySource::new();
    source.add_table("USERS", &["ID"], "ID", "INTEGER");

    // First run installs the instrumentation.
    let supervisor = Arc::new(Supervisor::with_connector(
        agent_config(server.url("/api/changes")),
        Arc::new(source.clone()),
    ));
    let stop = supervisor.stop_handle();
    let runner = {
        let supervisor = Arc::clone(&supervisor);
        std::thread::spawn(move || supervisor.run(RunOptions::default()))
    };
    wait_until("agent running", || {
        supervisor.snapshot().state == AgentState::Running
    });
    assert!(source.has_change_log());
    assert_eq!(source.trigger_count(), 1);
    stop.set();
    runner.join().unwrap().unwrap();

    // Second run with --reset-and-exit only tears down.
    let resetter = Supervisor::with_connector(
        agent_config(server.url("/api/changes")),
        Arc::new(source.clone()),
    );
    resetter
        .run(RunOptions {
            reset: false,
            reset_and_exit: true,
        })
        .unwrap();

    assert!(!source.has_change_log());
    assert_eq!(source.trigger_count(), 0);
}

#[test]
fn dirty_log_at_startup_is_fatal_and_reported() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/api/changes");
        then.status(200);
    });

    let source = MemorySource::new();
    source.add_table("USERS", &["ID"], "ID", "INTEGER");
    // A leftover row that nothing can resolve: recovery must refuse to
    // start the pipeline over it.
    source.seed_log_row(1, 42, Mutation::Insert, false);

    let supervisor = Supervisor::with_connector(
        agent_config(server.url("/api/changes")),
        Arc::new(source.clone()),
    );
    let err = supervisor.run(RunOptions::default()).unwrap_err();
    assert!(err.to_string().contains("recovery"));

    let snap = supervisor.snapshot();
    assert_eq!(snap.state, AgentState::Error);
    assert_eq!(snap.error_count, 1);
    assert_eq!(snap.recent_errors.len(), 1);
}
