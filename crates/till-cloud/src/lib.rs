//! Upstream delivery: HTTPS sender with local-buffer fallback.
//!
//! The live path serializes one event per POST and retries inline with
//! bounded exponential backoff; when retries are exhausted the payload is
//! parked in the [`LocalBuffer`] and a background sweeper (one attempt per
//! envelope per cycle) drains it whenever the endpoint comes back.
//! Callers therefore never see a delivery error: `send` returns `true`
//! (delivered now) or `false` (buffered for later), and only
//! serialization or buffer-store failures are `Err`.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use till_buffer::{BufferError, LocalBuffer};
use till_schemas::{ChangeEvent, SqlValue};

mod retry;

pub use retry::RetryPolicy;

/// Period of the background sweeper.
pub const BACKGROUND_RETRY_INTERVAL: Duration = Duration::from_secs(30);
/// Envelopes attempted per sweeper cycle.
const SWEEP_LIMIT: usize = 50;
/// Envelopes attempted by one flush call.
const FLUSH_LIMIT: usize = 1000;
/// Read timeout of one delivery attempt.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout of the reporting-only health probe.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

const USER_AGENT: &str = concat!("TillStream/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    /// A payload contained something JSON cannot express.
    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    /// The HTTP client could not be constructed.
    #[error("http client setup failed: {0}")]
    Setup(String),
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Sender configuration, separate from the process-wide config record so
/// tests can shrink the retry policy and sweep interval.
#[derive(Debug, Clone)]
pub struct SenderOptions {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub policy: RetryPolicy,
    pub background_retry: bool,
    pub retry_interval: Duration,
}

impl SenderOptions {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            policy: RetryPolicy::default(),
            background_retry: true,
            retry_interval: BACKGROUND_RETRY_INTERVAL,
        }
    }
}

/// Operator-visible buffer snapshot.
#[derive(Debug, Clone)]
pub struct BufferStats {
    pub pending_count: i64,
    pub endpoint: String,
    pub connected: bool,
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// The part of the sender shared with the sweeper thread.
struct Transport {
    http: reqwest::blocking::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl Transport {
    /// One POST attempt. `Err` carries operator-readable failure text.
    fn attempt(&self, body: &str) -> Result<(), String> {
        let mut req = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_string());
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        match req.send() {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if matches!(status, 200 | 201 | 202) {
                    Ok(())
                } else {
                    warn!(status, "unexpected response status");
                    Err(format!("HTTP {status}"))
                }
            }
            Err(err) => Err(err.to_string()),
        }
    }

    fn health_check(&self) -> bool {
        let url = format!("{}/health", self.endpoint.trim_end_matches('/'));
        match self.http.get(url).timeout(HEALTH_TIMEOUT).send() {
            Ok(resp) => resp.status().as_u16() == 200,
            Err(_) => false,
        }
    }
}

/// Drain up to `limit` envelopes, one attempt each. Returns sent count.
fn sweep(transport: &Transport, buffer: &LocalBuffer, limit: usize, stop: Option<&StopSignal>) -> usize {
    let pending = match buffer.get_pending(limit) {
        Ok(p) => p,
        Err(err) => {
            error!(%err, "unable to read local buffer");
            return 0;
        }
    };
    if pending.is_empty() {
        return 0;
    }
    info!(count = pending.len(), "retrying buffered events");

    let mut sent = 0;
    for envelope in pending {
        if stop.is_some_and(StopSignal::is_set) {
            break;
        }
        match transport.attempt(&envelope.payload) {
            Ok(()) => {
                if let Err(err) = buffer.mark_sent(envelope.id) {
                    error!(id = envelope.id, %err, "sent but could not remove from buffer");
                } else {
                    debug!(id = envelope.id, "buffered event delivered");
                    sent += 1;
                }
            }
            Err(reason) => {
                if let Err(err) = buffer.mark_failed(envelope.id, &reason) {
                    error!(id = envelope.id, %err, "unable to record retry failure");
                }
            }
        }
    }
    sent
}

// ---------------------------------------------------------------------------
// Stop signal
// ---------------------------------------------------------------------------

struct StopSignal {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl StopSignal {
    fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn is_set(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self) {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cv.notify_all();
    }

    /// Wait for `timeout` or until set; returns true when set.
    fn wait(&self, timeout: Duration) -> bool {
        let guard = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

// ---------------------------------------------------------------------------
// CloudClient
// ---------------------------------------------------------------------------

pub struct CloudClient {
    transport: Arc<Transport>,
    policy: RetryPolicy,
    buffer: Arc<LocalBuffer>,
    sweeper: Mutex<Option<Sweeper>>,
}

struct Sweeper {
    stop: Arc<StopSignal>,
    handle: JoinHandle<()>,
}

impl CloudClient {
    pub fn new(options: SenderOptions, buffer: Arc<LocalBuffer>) -> Result<Self, CloudError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| CloudError::Setup(e.to_string()))?;

        let transport = Arc::new(Transport {
            http,
            endpoint: options.endpoint,
            api_key: options.api_key,
        });

        let sweeper = if options.background_retry {
            Some(spawn_sweeper(
                Arc::clone(&transport),
                Arc::clone(&buffer),
                options.retry_interval,
            ))
        } else {
            None
        };

        Ok(Self {
            transport,
            policy: options.policy,
            buffer,
            sweeper: Mutex::new(sweeper),
        })
    }

    /// Deliver one event: inline retries, then park in the buffer.
    ///
    /// `Ok(true)` delivered now, `Ok(false)` buffered for the sweeper.
    pub fn send(&self, event: &ChangeEvent) -> Result<bool, CloudError> {
        let body = serde_json::to_string(event)?;

        let mut failed_attempts = 0;
        loop {
            match self.transport.attempt(&body) {
                Ok(()) => {
                    if failed_attempts > 0 {
                        info!(attempts = failed_attempts + 1, "sent after retrying");
                    }
                    return Ok(true);
                }
                Err(reason) => {
                    failed_attempts += 1;
                    if failed_attempts >= self.policy.max_retries {
                        let id = self.buffer.add(&body, Some("Max retries exceeded"))?;
                        let pending = self.buffer.count_pending().unwrap_or(-1);
                        warn!(
                            id,
                            pending,
                            last_error = %reason,
                            "delivery failed, event buffered for retry"
                        );
                        return Ok(false);
                    }
                    let delay = self.policy.delay_for(failed_attempts);
                    debug!(
                        attempt = failed_attempts,
                        max = self.policy.max_retries,
                        ?delay,
                        %reason,
                        "delivery attempt failed, backing off"
                    );
                    std::thread::sleep(delay);
                }
            }
        }
    }

    pub fn send_insert(
        &self,
        table: &str,
        row_data: Option<Vec<SqlValue>>,
        timestamp: f64,
    ) -> Result<bool, CloudError> {
        self.send(&ChangeEvent::Insert {
            table: table.to_string(),
            row_data,
            timestamp,
        })
    }

    pub fn send_update(
        &self,
        table: &str,
        row_data: Option<Vec<SqlValue>>,
        timestamp: f64,
    ) -> Result<bool, CloudError> {
        self.send(&ChangeEvent::Update {
            table: table.to_string(),
            row_data,
            timestamp,
        })
    }

    pub fn send_delete(
        &self,
        table: &str,
        primary_key: &str,
        value: i32,
        timestamp: f64,
    ) -> Result<bool, CloudError> {
        self.send(&ChangeEvent::Delete {
            table: table.to_string(),
            primary_key: primary_key.to_string(),
            value,
            timestamp,
        })
    }

    /// One immediate attempt for every buffered envelope (oldest first,
    /// up to 1000); returns how many were delivered. Drain-on-shutdown.
    pub fn flush_buffer(&self) -> usize {
        sweep(&self.transport, &self.buffer, FLUSH_LIMIT, None)
    }

    pub fn buffer_stats(&self) -> BufferStats {
        BufferStats {
            pending_count: self.buffer.count_pending().unwrap_or(-1),
            endpoint: self.transport.endpoint.clone(),
            connected: self.transport.health_check(),
        }
    }

    /// Pending-envelope count without touching the network.
    pub fn pending_count(&self) -> i64 {
        self.buffer.count_pending().unwrap_or(-1)
    }

    /// Reporting-only reachability probe (`GET {endpoint}/health`).
    pub fn test_connection(&self) -> bool {
        self.transport.health_check()
    }

    /// Stop the sweeper thread and wait for it. Idempotent.
    pub fn close(&self) {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.stop.set();
            if sweeper.handle.join().is_err() {
                error!("sweeper thread panicked");
            }
            debug!("cloud client closed");
        }
    }
}

impl Drop for CloudClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_sweeper(transport: Arc<Transport>, buffer: Arc<LocalBuffer>, interval: Duration) -> Sweeper {
    let stop = Arc::new(StopSignal::new());
    let thread_stop = Arc::clone(&stop);

    let handle = std::thread::Builder::new()
        .name("till-sweeper".to_string())
        .spawn(move || {
            debug!("background retry thread started");
            loop {
                sweep(&transport, &buffer, SWEEP_LIMIT, Some(thread_stop.as_ref()));
                if thread_stop.wait(interval) {
                    break;
                }
            }
            debug!("background retry thread stopped");
        })
        .expect("spawn sweeper thread");

    Sweeper { stop, handle }
}
