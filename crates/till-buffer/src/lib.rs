//! Persistent local buffer for payloads that failed remote delivery.
//!
//! A single SQLite file holds one `pending_changes` table used as a FIFO:
//! the sender appends on send failure, the retry sweeper drains oldest
//! first. Every operation is durable before it returns, so an envelope
//! survives a crash at any point: it is either fully written or absent.

use std::sync::{Mutex, PoisonError};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

/// Durable FIFO of undelivered payloads.
///
/// Thread safety: every operation takes an internal lock, so a single
/// `LocalBuffer` can be shared freely between the sender and the sweeper.
/// A `":memory:"` path keeps one shared connection alive (the store would
/// otherwise vanish between calls); file paths open a fresh connection per
/// call so the file handle is never held across operations.
pub struct LocalBuffer {
    inner: Mutex<Store>,
}

struct Store {
    path: String,
    /// Only populated for in-memory stores.
    shared: Option<Connection>,
}

/// One buffered payload, as returned by [`LocalBuffer::get_pending`].
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedEnvelope {
    pub id: i64,
    /// Serialized event JSON, exactly as handed to `add`.
    pub payload: String,
    /// ISO-8601 UTC insertion time; the FIFO sort key.
    pub created_at: String,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub last_retry_at: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("buffer store error: {0}")]
    Store(#[from] rusqlite::Error),
}

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS pending_changes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    retry_count INTEGER DEFAULT 0,
    last_error TEXT,
    last_retry_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_created_at ON pending_changes(created_at);
";

impl LocalBuffer {
    /// Open (and initialize if needed) the buffer at `path`.
    ///
    /// `":memory:"` creates a private in-memory store, used by tests.
    pub fn open(path: &str) -> Result<Self, BufferError> {
        let shared = if path == ":memory:" {
            let conn = Connection::open_in_memory()?;
            conn.execute_batch(SCHEMA)?;
            Some(conn)
        } else {
            let conn = Connection::open(path)?;
            conn.execute_batch(SCHEMA)?;
            None
        };

        Ok(Self {
            inner: Mutex::new(Store {
                path: path.to_string(),
                shared,
            }),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    ) -> Result<T, BufferError> {
        let store = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match &store.shared {
            Some(conn) => Ok(f(conn)?),
            None => {
                let conn = Connection::open(&store.path)?;
                Ok(f(&conn)?)
            }
        }
    }

    /// Append a payload; returns its buffer id. Durable on return.
    pub fn add(&self, payload: &str, error: Option<&str>) -> Result<i64, BufferError> {
        let created_at = now_iso();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pending_changes (payload, created_at, last_error) VALUES (?1, ?2, ?3)",
                params![payload, created_at, error],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Oldest `limit` envelopes, `created_at` ascending (ties by id).
    pub fn get_pending(&self, limit: usize) -> Result<Vec<BufferedEnvelope>, BufferError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, payload, created_at, retry_count, last_error, last_retry_at \
                 FROM pending_changes ORDER BY created_at ASC, id ASC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok(BufferedEnvelope {
                    id: row.get(0)?,
                    payload: row.get(1)?,
                    created_at: row.get(2)?,
                    retry_count: row.get(3)?,
                    last_error: row.get(4)?,
                    last_retry_at: row.get(5)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Remove a successfully delivered envelope.
    pub fn mark_sent(&self, id: i64) -> Result<(), BufferError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM pending_changes WHERE id = ?1", params![id])?;
            Ok(())
        })
    }

    /// Record one more failed attempt; the envelope stays queued.
    pub fn mark_failed(&self, id: i64, error: &str) -> Result<(), BufferError> {
        let retried_at = now_iso();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE pending_changes \
                 SET retry_count = retry_count + 1, last_error = ?1, last_retry_at = ?2 \
                 WHERE id = ?3",
                params![error, retried_at, id],
            )?;
            Ok(())
        })
    }

    pub fn count_pending(&self) -> Result<i64, BufferError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM pending_changes", [], |row| row.get(0))
        })
    }

    /// Drop every envelope; returns how many were removed.
    pub fn clear(&self) -> Result<usize, BufferError> {
        let n = self.with_conn(|conn| conn.execute("DELETE FROM pending_changes", []))?;
        if n > 0 {
            debug!(dropped = n, "cleared local buffer");
        }
        Ok(n)
    }

    /// Peek one envelope by id (diagnostics only).
    pub fn get(&self, id: i64) -> Result<Option<BufferedEnvelope>, BufferError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, payload, created_at, retry_count, last_error, last_retry_at \
                 FROM pending_changes WHERE id = ?1",
                params![id],
                |row| {
                    Ok(BufferedEnvelope {
                        id: row.get(0)?,
                        payload: row.get(1)?,
                        created_at: row.get(2)?,
                        retry_count: row.get(3)?,
                        last_error: row.get(4)?,
                        last_retry_at: row.get(5)?,
                    })
                },
            )
            .optional()
        })
    }
}

fn now_iso() -> String {
    chrono::Utc::now()
        .naive_utc()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_get_preserves_payload() {
        let buf = LocalBuffer::open(":memory:").unwrap();
        let id = buf.add(r#"{"type":"INSERT"}"#, None).unwrap();
        let pending = buf.get_pending(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].payload, r#"{"type":"INSERT"}"#);
        assert_eq!(pending[0].retry_count, 0);
        assert_eq!(pending[0].last_error, None);
    }

    #[test]
    fn add_records_initial_error() {
        let buf = LocalBuffer::open(":memory:").unwrap();
        buf.add("{}", Some("Max retries exceeded")).unwrap();
        let pending = buf.get_pending(1).unwrap();
        assert_eq!(pending[0].last_error.as_deref(), Some("Max retries exceeded"));
    }

    #[test]
    fn mark_sent_removes_only_that_envelope() {
        let buf = LocalBuffer::open(":memory:").unwrap();
        let a = buf.add("a", None).unwrap();
        let b = buf.add("b", None).unwrap();
        buf.mark_sent(a).unwrap();
        let pending = buf.get_pending(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b);
    }

    #[test]
    fn mark_failed_increments_and_keeps() {
        let buf = LocalBuffer::open(":memory:").unwrap();
        let id = buf.add("a", None).unwrap();
        buf.mark_failed(id, "connection refused").unwrap();
        buf.mark_failed(id, "timeout").unwrap();
        let env = buf.get(id).unwrap().unwrap();
        assert_eq!(env.retry_count, 2);
        assert_eq!(env.last_error.as_deref(), Some("timeout"));
        assert!(env.last_retry_at.is_some());
        assert_eq!(buf.count_pending().unwrap(), 1);
    }

    #[test]
    fn clear_reports_removed_count() {
        let buf = LocalBuffer::open(":memory:").unwrap();
        for i in 0..5 {
            buf.add(&format!("p{i}"), None).unwrap();
        }
        assert_eq!(buf.clear().unwrap(), 5);
        assert_eq!(buf.count_pending().unwrap(), 0);
    }
}
