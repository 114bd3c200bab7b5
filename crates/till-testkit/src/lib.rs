//! In-memory fake source database for pipeline tests.
//!
//! [`MemorySource`] implements the `till-source` traits over shared
//! in-process state: tables are maps of integer pk → row, the change log
//! is a vector, and the recording triggers are simulated by the mutation
//! helpers (`insert_row` / `update_row` / `delete_row`), which append a
//! log row and fire the intake signal exactly like their SQL counterparts.
//!
//! Deterministic on purpose: tables enumerate in name order, log ids come
//! from a plain counter. No network, no files.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use till_schemas::{Change, Mutation, SqlValue};
use till_source::{
    ChangeConduit, SourceConnector, SourceDb, SourceError, Wake, CHANGE_LOG_PK, CHANGE_LOG_TABLE,
};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct TableState {
    /// Column names in declaration order.
    columns: Vec<String>,
    /// Declared primary-key columns with their type names.
    pk_columns: Vec<(String, String)>,
    /// Rows keyed by integer primary key.
    rows: BTreeMap<i32, Vec<SqlValue>>,
}

struct DbState {
    tables: BTreeMap<String, TableState>,
    has_change_log: bool,
    change_log: Vec<Change>,
    next_log_id: i64,
    /// Installed recording triggers: table_id → table name.
    triggers: BTreeMap<i32, String>,
    /// Tables whose trigger DDL is made to fail.
    broken_trigger_tables: BTreeSet<String>,
    /// Bumped by every intake signal; conduits wake on a bump.
    signal_seq: u64,
}

struct SharedState {
    db: Mutex<DbState>,
    signal: Condvar,
}

impl SharedState {
    fn lock(&self) -> MutexGuard<'_, DbState> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fire_intake_signal(&self, db: &mut DbState) {
        db.signal_seq += 1;
        self.signal.notify_all();
    }
}

// ---------------------------------------------------------------------------
// MemorySource, the test's "database server" handle
// ---------------------------------------------------------------------------

/// Fake source database. Clone handles freely; they all see one state.
#[derive(Clone)]
pub struct MemorySource {
    state: Arc<SharedState>,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SharedState {
                db: Mutex::new(DbState {
                    tables: BTreeMap::new(),
                    has_change_log: false,
                    change_log: Vec::new(),
                    next_log_id: 1,
                    triggers: BTreeMap::new(),
                    broken_trigger_tables: BTreeSet::new(),
                    signal_seq: 0,
                }),
                signal: Condvar::new(),
            }),
        }
    }

    /// Declare a user table with a single primary-key column.
    pub fn add_table(&self, name: &str, columns: &[&str], pk_column: &str, pk_type: &str) {
        self.add_table_with_pks(name, columns, &[(pk_column, pk_type)]);
    }

    /// Declare a user table with arbitrary primary-key columns (possibly
    /// none, possibly composite) for eligibility tests.
    pub fn add_table_with_pks(&self, name: &str, columns: &[&str], pks: &[(&str, &str)]) {
        let mut db = self.state.lock();
        db.tables.insert(
            name.to_string(),
            TableState {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                pk_columns: pks
                    .iter()
                    .map(|(c, t)| (c.to_string(), t.to_string()))
                    .collect(),
                rows: BTreeMap::new(),
            },
        );
    }

    /// Make trigger DDL fail for `table`.
    pub fn break_trigger_for(&self, table: &str) {
        self.state.lock().broken_trigger_tables.insert(table.to_string());
    }

    // -- trigger-simulating mutations --------------------------------------

    /// INSERT: stores the row and, when the table is instrumented, appends
    /// a change-log row and fires the intake signal.
    pub fn insert_row(&self, table: &str, pk_val: i32, row: Vec<SqlValue>) {
        let mut db = self.state.lock();
        if let Some(t) = db.tables.get_mut(table) {
            assert_eq!(row.len(), t.columns.len(), "row width mismatch for {table}");
            t.rows.insert(pk_val, row);
        }
        self.record_mutation(&mut db, table, pk_val, Mutation::Insert);
    }

    /// UPDATE: replaces the row image, then records the mutation.
    pub fn update_row(&self, table: &str, pk_val: i32, row: Vec<SqlValue>) {
        let mut db = self.state.lock();
        if let Some(t) = db.tables.get_mut(table) {
            assert_eq!(row.len(), t.columns.len(), "row width mismatch for {table}");
            t.rows.insert(pk_val, row);
        }
        self.record_mutation(&mut db, table, pk_val, Mutation::Update);
    }

    /// DELETE: removes the row, then records the mutation.
    pub fn delete_row(&self, table: &str, pk_val: i32) {
        let mut db = self.state.lock();
        if let Some(t) = db.tables.get_mut(table) {
            t.rows.remove(&pk_val);
        }
        self.record_mutation(&mut db, table, pk_val, Mutation::Delete);
    }

    /// Remove a row without firing any trigger. Reproduces the hydration
    /// race where a row vanishes between mutation and SELECT.
    pub fn vanish_row(&self, table: &str, pk_val: i32) {
        let mut db = self.state.lock();
        if let Some(t) = db.tables.get_mut(table) {
            t.rows.remove(&pk_val);
        }
    }

    fn record_mutation(&self, db: &mut DbState, table: &str, pk_val: i32, mutation: Mutation) {
        let table_id = db
            .triggers
            .iter()
            .find(|(_, t)| t.as_str() == table)
            .map(|(id, _)| *id);
        let Some(table_id) = table_id else { return };

        let log_id = db.next_log_id;
        db.next_log_id += 1;
        db.change_log.push(Change {
            log_id,
            pk_val,
            table_id,
            mutation,
            occurred_at: chrono::Utc::now().naive_utc(),
            processed: false,
        });
        self.state.fire_intake_signal(db);
    }

    // -- inspection helpers -------------------------------------------------

    pub fn change_log(&self) -> Vec<Change> {
        self.state.lock().change_log.clone()
    }

    pub fn log_len(&self) -> usize {
        self.state.lock().change_log.len()
    }

    pub fn trigger_count(&self) -> usize {
        self.state.lock().triggers.len()
    }

    pub fn has_change_log(&self) -> bool {
        self.state.lock().has_change_log
    }

    /// Seed an unprocessed log row directly (simulated crash leftovers).
    pub fn seed_log_row(&self, pk_val: i32, table_id: i32, mutation: Mutation, processed: bool) -> i64 {
        let mut db = self.state.lock();
        let log_id = db.next_log_id;
        db.next_log_id += 1;
        db.change_log.push(Change {
            log_id,
            pk_val,
            table_id,
            mutation,
            occurred_at: chrono::Utc::now().naive_utc(),
            processed,
        });
        log_id
    }
}

impl SourceConnector for MemorySource {
    fn connect(&self) -> Result<Box<dyn SourceDb>, SourceError> {
        Ok(Box::new(MemoryDb {
            state: Arc::clone(&self.state),
        }))
    }

    fn conduit(&self) -> Result<Box<dyn ChangeConduit>, SourceError> {
        let last_seen = self.state.lock().signal_seq;
        Ok(Box::new(MemoryConduit {
            state: Arc::clone(&self.state),
            last_seen,
        }))
    }
}

// ---------------------------------------------------------------------------
// Conduit
// ---------------------------------------------------------------------------

struct MemoryConduit {
    state: Arc<SharedState>,
    last_seen: u64,
}

impl ChangeConduit for MemoryConduit {
    fn wait(&mut self, timeout: Duration) -> Result<Wake, SourceError> {
        let db = self.state.lock();
        let last_seen = self.last_seen;
        let (db, timed_out) = self
            .state
            .signal
            .wait_timeout_while(db, timeout, |db| db.signal_seq == last_seen)
            .unwrap_or_else(PoisonError::into_inner);
        self.last_seen = db.signal_seq;
        if timed_out.timed_out() {
            Ok(Wake::Timeout)
        } else {
            Ok(Wake::Signal)
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

struct MemoryDb {
    state: Arc<SharedState>,
}

impl SourceDb for MemoryDb {
    fn table_names(&mut self) -> Result<Vec<String>, SourceError> {
        let db = self.state.lock();
        let mut names: Vec<String> = db.tables.keys().cloned().collect();
        if db.has_change_log {
            names.push(CHANGE_LOG_TABLE.to_string());
        }
        Ok(names)
    }

    fn primary_key_columns(&mut self) -> Result<HashMap<String, Vec<String>>, SourceError> {
        let db = self.state.lock();
        let mut out = HashMap::new();
        for (name, table) in &db.tables {
            if !table.pk_columns.is_empty() {
                out.insert(
                    name.clone(),
                    table.pk_columns.iter().map(|(c, _)| c.clone()).collect(),
                );
            }
        }
        if db.has_change_log {
            out.insert(CHANGE_LOG_TABLE.to_string(), vec![CHANGE_LOG_PK.to_string()]);
        }
        Ok(out)
    }

    fn column_type(&mut self, table: &str, column: &str) -> Result<String, SourceError> {
        let db = self.state.lock();
        if table == CHANGE_LOG_TABLE {
            return Ok("INTEGER".to_string());
        }
        db.tables
            .get(table)
            .and_then(|t| {
                t.pk_columns
                    .iter()
                    .find(|(c, _)| c == column)
                    .map(|(_, ty)| ty.clone())
            })
            .ok_or_else(|| SourceError::Database(format!("no column {table}.{column}")))
    }

    fn create_change_log(&mut self) -> Result<(), SourceError> {
        let mut db = self.state.lock();
        if db.has_change_log {
            return Err(SourceError::Database("CHANGES_LOG already exists".into()));
        }
        db.has_change_log = true;
        db.next_log_id = 1;
        Ok(())
    }

    fn create_table_trigger(
        &mut self,
        table: &str,
        table_id: i32,
        _pk_column: &str,
    ) -> Result<(), SourceError> {
        let mut db = self.state.lock();
        if db.broken_trigger_tables.contains(table) {
            return Err(SourceError::Database(format!("trigger DDL rejected for {table}")));
        }
        // CREATE OR ALTER semantics: re-installing is not an error.
        db.triggers.insert(table_id, table.to_string());
        Ok(())
    }

    fn drop_table_trigger(&mut self, table_id: i32) -> Result<(), SourceError> {
        let mut db = self.state.lock();
        match db.triggers.remove(&table_id) {
            Some(_) => Ok(()),
            None => Err(SourceError::Database(format!(
                "trigger TABLE_{table_id}_CHANGES does not exist"
            ))),
        }
    }

    fn drop_change_log(&mut self) -> Result<(), SourceError> {
        let mut db = self.state.lock();
        if !db.has_change_log {
            return Err(SourceError::Database("CHANGES_LOG does not exist".into()));
        }
        db.has_change_log = false;
        db.change_log.clear();
        db.next_log_id = 1;
        Ok(())
    }

    fn unprocessed_changes(&mut self, from_log_id: i64) -> Result<Vec<Change>, SourceError> {
        let db = self.state.lock();
        Ok(db
            .change_log
            .iter()
            .filter(|c| c.log_id >= from_log_id && !c.processed)
            .cloned()
            .collect())
    }

    fn fetch_row(
        &mut self,
        table: &str,
        _pk_column: &str,
        pk_val: i32,
    ) -> Result<Option<Vec<SqlValue>>, SourceError> {
        let db = self.state.lock();
        let t = db
            .tables
            .get(table)
            .ok_or_else(|| SourceError::Database(format!("no such table {table}")))?;
        Ok(t.rows.get(&pk_val).cloned())
    }

    fn mark_processed(&mut self, log_id: i64) -> Result<(), SourceError> {
        let mut db = self.state.lock();
        for c in db.change_log.iter_mut() {
            if c.log_id == log_id {
                c.processed = true;
            }
        }
        Ok(())
    }

    fn delete_processed(&mut self) -> Result<u64, SourceError> {
        let mut db = self.state.lock();
        let before = db.change_log.len();
        db.change_log.retain(|c| !c.processed);
        Ok((before - db.change_log.len()) as u64)
    }

    fn change_log_count(&mut self) -> Result<i64, SourceError> {
        Ok(self.state.lock().change_log.len() as i64)
    }

    fn post_wake_event(&mut self) -> Result<(), SourceError> {
        let mut db = self.state.lock();
        self.state.fire_intake_signal(&mut db);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instrumented() -> MemorySource {
        let source = MemorySource::new();
        source.add_table("USERS", &["ID", "NAME"], "ID", "INTEGER");
        let mut db = source.connect().unwrap();
        db.create_change_log().unwrap();
        db.create_table_trigger("USERS", 0, "ID").unwrap();
        source
    }

    #[test]
    fn mutations_append_contiguous_log_ids() {
        let source = instrumented();
        source.insert_row("USERS", 1, vec![SqlValue::Int(1), SqlValue::Text("a".into())]);
        source.update_row("USERS", 1, vec![SqlValue::Int(1), SqlValue::Text("b".into())]);
        source.delete_row("USERS", 1);

        let log = source.change_log();
        let ids: Vec<i64> = log.iter().map(|c| c.log_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(log[0].mutation, Mutation::Insert);
        assert_eq!(log[2].mutation, Mutation::Delete);
        assert!(log.iter().all(|c| !c.processed));
    }

    #[test]
    fn uninstrumented_table_logs_nothing() {
        let source = MemorySource::new();
        source.add_table("USERS", &["ID"], "ID", "INTEGER");
        source.insert_row("USERS", 1, vec![SqlValue::Int(1)]);
        assert_eq!(source.log_len(), 0);
    }

    #[test]
    fn conduit_wakes_on_mutation_and_on_posted_event() {
        let source = instrumented();
        let mut conduit = source.conduit().unwrap();

        // No signal yet: times out.
        assert_eq!(conduit.wait(Duration::from_millis(10)).unwrap(), Wake::Timeout);

        source.insert_row("USERS", 7, vec![SqlValue::Int(7), SqlValue::Null]);
        assert_eq!(conduit.wait(Duration::from_millis(10)).unwrap(), Wake::Signal);

        let mut db = source.connect().unwrap();
        db.post_wake_event().unwrap();
        assert_eq!(conduit.wait(Duration::from_millis(10)).unwrap(), Wake::Signal);
    }

    #[test]
    fn processed_rows_are_deleted_in_bulk() {
        let source = instrumented();
        source.insert_row("USERS", 1, vec![SqlValue::Int(1), SqlValue::Null]);
        source.insert_row("USERS", 2, vec![SqlValue::Int(2), SqlValue::Null]);

        let mut db = source.connect().unwrap();
        db.mark_processed(1).unwrap();
        assert_eq!(db.delete_processed().unwrap(), 1);
        assert_eq!(db.change_log_count().unwrap(), 1);
        assert_eq!(db.unprocessed_changes(0).unwrap()[0].log_id, 2);
    }
}
