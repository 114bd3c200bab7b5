//! Lifecycle orchestration: setup, recovery, steady state, graceful drain.
//!
//! The supervisor owns one administrative connection (used for teardown,
//! instrumentation, recovery and the shutdown wake event), the stop flag,
//! and a status cell the embedding process can observe through a
//! callback. It is the only component that initiates shutdown.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use till_buffer::LocalBuffer;
use till_cloud::{CloudClient, SenderOptions};
use till_config::AgentConfig;
use till_source::{FirebirdConnector, FirebirdParams, Instrumenter, SourceConnector};

use crate::{intake, recovery, worker};

/// Bound on waiting for the intake thread at shutdown; past it the thread
/// is abandoned.
const INTAKE_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Steady-state supervision tick (status refresh, intake liveness check).
const SUPERVISE_INTERVAL: Duration = Duration::from_millis(500);
/// Errors kept for status reporting.
const ERROR_RING_SIZE: usize = 10;

// ---------------------------------------------------------------------------
// Stop flag
// ---------------------------------------------------------------------------

/// Cloneable, wakeable shutdown signal shared by every pipeline thread.
#[derive(Clone)]
pub struct StopFlag {
    inner: Arc<StopInner>,
}

struct StopInner {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl StopFlag {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StopInner {
                stopped: Mutex::new(false),
                cv: Condvar::new(),
            }),
        }
    }

    pub fn set(&self) {
        *self
            .inner
            .stopped
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = true;
        self.inner.cv.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self
            .inner
            .stopped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for `timeout` unless the flag is (or becomes) set; returns
    /// whether it is set.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = self
            .inner
            .stopped
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .inner
            .cv
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Initializing,
    Connecting,
    SchemaReady,
    Recovering,
    Running,
    Draining,
    Stopped,
    Error,
}

impl AgentState {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Initializing => "initializing",
            AgentState::Connecting => "connecting",
            AgentState::SchemaReady => "schema_ready",
            AgentState::Recovering => "recovering",
            AgentState::Running => "running",
            AgentState::Draining => "draining",
            AgentState::Stopped => "stopped",
            AgentState::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ErrorEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Point-in-time view of the agent, handed to the status callback and
/// returned by [`Supervisor::snapshot`].
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub state: AgentState,
    pub message: String,
    /// Envelopes waiting in the local buffer (`-1` when unknown).
    pub pending_events: i64,
    pub error_count: u64,
    /// The most recent errors, oldest first, capped at ten.
    pub recent_errors: Vec<ErrorEntry>,
}

pub type StatusCallback = Box<dyn Fn(&StatusSnapshot) + Send + Sync>;

struct StatusCell {
    snapshot: Mutex<StatusSnapshot>,
    callback: Option<StatusCallback>,
}

impl StatusCell {
    fn new(callback: Option<StatusCallback>) -> Self {
        Self {
            snapshot: Mutex::new(StatusSnapshot {
                state: AgentState::Initializing,
                message: String::new(),
                pending_events: 0,
                error_count: 0,
                recent_errors: Vec::new(),
            }),
            callback,
        }
    }

    fn update(&self, f: impl FnOnce(&mut StatusSnapshot)) {
        let published = {
            let mut snap = self
                .snapshot
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            f(&mut snap);
            snap.clone()
        };
        if let Some(cb) = &self.callback {
            cb(&published);
        }
    }

    fn read(&self) -> StatusSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// CLI-level run options.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Tear instrumentation down before the normal startup sequence.
    pub reset: bool,
    /// Tear instrumentation down, then exit without starting.
    pub reset_and_exit: bool,
}

pub struct Supervisor {
    config: AgentConfig,
    connector: Arc<dyn SourceConnector>,
    stop: StopFlag,
    status: StatusCell,
}

impl Supervisor {
    /// Supervisor over a live Firebird database.
    pub fn new(config: AgentConfig) -> Self {
        let params = FirebirdParams::from_dsn(
            &config.database.path,
            &config.database.user,
            &config.database.password,
            &config.database.charset,
        );
        let connector = Arc::new(FirebirdConnector::new(params, config.workers.poll_interval));
        Self::with_connector(config, connector)
    }

    /// Supervisor over any source implementation (tests use the in-memory
    /// fake).
    pub fn with_connector(config: AgentConfig, connector: Arc<dyn SourceConnector>) -> Self {
        Self {
            config,
            connector,
            stop: StopFlag::new(),
            status: StatusCell::new(None),
        }
    }

    /// Install a status callback (GUI hook). Replaces any previous one.
    pub fn on_status_change(mut self, callback: StatusCallback) -> Self {
        self.status = StatusCell::new(Some(callback));
        self
    }

    /// Handle for signal handlers and embedding code to request shutdown.
    pub fn stop_handle(&self) -> StopFlag {
        self.stop.clone()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.status.read()
    }

    fn set_state(&self, state: AgentState, message: impl Into<String>) {
        let message = message.into();
        info!(state = state.as_str(), "{message}");
        self.status.update(|snap| {
            snap.state = state;
            snap.message = message;
        });
    }

    fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.status.update(|snap| {
            snap.error_count += 1;
            let mut ring: VecDeque<ErrorEntry> = snap.recent_errors.drain(..).collect();
            ring.push_back(ErrorEntry {
                at: Utc::now(),
                message: message.clone(),
            });
            while ring.len() > ERROR_RING_SIZE {
                ring.pop_front();
            }
            snap.recent_errors = ring.into_iter().collect();
        });
    }

    /// Run the agent until shutdown is requested (or a fatal error).
    ///
    /// Returns `Ok` after a clean drain; any `Err` is fatal and the
    /// process should exit nonzero.
    pub fn run(&self, opts: RunOptions) -> Result<()> {
        match self.run_inner(opts) {
            Ok(()) => {
                self.set_state(AgentState::Stopped, "agent stopped");
                Ok(())
            }
            Err(err) => {
                self.record_error(format!("{err:#}"));
                self.set_state(AgentState::Error, format!("{err:#}"));
                Err(err)
            }
        }
    }

    fn run_inner(&self, opts: RunOptions) -> Result<()> {
        self.set_state(
            AgentState::Connecting,
            format!("connecting to {}", self.config.database.path),
        );
        let mut admin = self
            .connector
            .connect()
            .context("source database connection failed")?;

        if opts.reset || opts.reset_and_exit {
            Instrumenter::new(admin.as_mut())
                .reset_state()
                .context("state reset failed")?;
            if opts.reset_and_exit {
                info!("state reset complete, exiting");
                return Ok(());
            }
        }

        let maps = Instrumenter::new(admin.as_mut())
            .setup()
            .context("instrumentation setup failed")?;
        self.set_state(
            AgentState::SchemaReady,
            format!("{} tables instrumented", maps.len()),
        );
        let maps = Arc::new(maps);

        let cloud = self.build_cloud_client()?;

        self.set_state(AgentState::Recovering, "re-driving unprocessed changes");
        let report = recovery::run(admin.as_mut(), &maps, cloud.as_deref())
            .context("startup recovery failed")?;
        if report.replayed > 0 || report.deleted > 0 {
            info!(
                replayed = report.replayed,
                deleted = report.deleted,
                "recovery complete"
            );
        }

        let (tx, rx) = crossbeam_channel::bounded(self.config.workers.queue_capacity);
        let intake = intake::spawn(
            Arc::clone(&self.connector),
            self.config.workers.intake_position,
            self.config.workers.poll_interval,
            tx.clone(),
            self.stop.clone(),
        );
        let workers = worker::spawn_workers(
            self.config.workers.count,
            Arc::clone(&self.connector),
            Arc::clone(&maps),
            cloud.clone(),
            rx,
        );

        self.set_state(AgentState::Running, "agent running");

        let mut outcome = Ok(());
        while !self.stop.wait(SUPERVISE_INTERVAL) {
            if let Some(cloud) = &cloud {
                let pending = cloud.pending_count();
                self.status.update(|snap| snap.pending_events = pending);
            }
            if intake.is_finished() {
                outcome = Err(anyhow!("change intake thread died unexpectedly"));
                break;
            }
        }

        // Drain. Errors past this point are logged and swallowed.
        self.set_state(AgentState::Draining, "draining queue and shutting down");
        self.stop.set();
        if let Err(err) = admin.post_wake_event() {
            warn!(%err, "unable to post wake event during shutdown");
        }
        drop(tx);

        join_with_timeout(intake.into_join_handle(), INTAKE_JOIN_TIMEOUT, "till-intake");
        for handle in workers {
            join_thread(handle);
        }

        if let Some(cloud) = &cloud {
            cloud.close();
            let pending = cloud.pending_count();
            if pending > 0 {
                info!(pending, "attempting to flush buffered events");
                let flushed = cloud.flush_buffer();
                info!(flushed, "flush complete");
            }
        }

        outcome
    }

    fn build_cloud_client(&self) -> Result<Option<Arc<CloudClient>>> {
        if !self.config.cloud.enabled {
            info!("cloud sync is disabled");
            return Ok(None);
        }

        let buffer = Arc::new(
            LocalBuffer::open(&self.config.cloud.buffer_path)
                .with_context(|| format!("open local buffer {}", self.config.cloud.buffer_path))?,
        );
        let mut options = SenderOptions::new(self.config.cloud.endpoint.clone());
        options.api_key = self.config.cloud.api_key.clone();
        options.background_retry = self.config.cloud.background_retry;

        let cloud = Arc::new(
            CloudClient::new(options, buffer).context("cloud sync client setup failed")?,
        );
        info!(endpoint = %self.config.cloud.endpoint, "cloud sync client initialized");

        let pending = cloud.pending_count();
        if pending > 0 {
            info!(pending, "found buffered events from previous runs");
            self.status.update(|snap| snap.pending_events = pending);
        }
        Ok(Some(cloud))
    }
}

// ---------------------------------------------------------------------------
// Join helpers
// ---------------------------------------------------------------------------

fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration, name: &str) {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(thread = name, ?timeout, "thread did not exit in time, abandoning");
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    if handle.join().is_err() {
        error!(thread = name, "thread panicked");
    }
}

fn join_thread(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        error!("worker thread panicked");
    }
}
