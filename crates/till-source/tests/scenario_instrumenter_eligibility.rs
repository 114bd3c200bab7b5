//! Instrumenter setup / teardown behavior.
//!
//! GREEN when:
//! - Only tables with a single INTEGER primary key are instrumented.
//! - The change log itself is never instrumented and only created when absent.
//! - A trigger-DDL failure skips that table without failing setup, and the
//!   surviving ids stay contiguous.
//! - Running setup twice is equivalent to running it once.
//! - reset_state drops one recording trigger per eligible table, then the
//!   change log, and surfaces drop failures as errors.

use std::collections::{HashMap, HashSet};

use till_schemas::{Change, SqlValue};
use till_source::{Instrumenter, SourceDb, SourceError, CHANGE_LOG_TABLE};

#[derive(Default)]
struct StubDb {
    tables: Vec<String>,
    pks: HashMap<String, Vec<String>>,
    types: HashMap<(String, String), String>,
    fail_trigger_for: HashSet<String>,
    fail_trigger_drop: bool,

    log_creations: usize,
    triggers: HashMap<i32, String>,
    dropped_triggers: Vec<i32>,
    log_dropped: bool,
}

impl StubDb {
    fn with_table(mut self, name: &str, pk_cols: &[(&str, &str)]) -> Self {
        self.tables.push(name.to_string());
        if !pk_cols.is_empty() {
            self.pks.insert(
                name.to_string(),
                pk_cols.iter().map(|(c, _)| c.to_string()).collect(),
            );
            for (col, ty) in pk_cols {
                self.types
                    .insert((name.to_string(), col.to_string()), ty.to_string());
            }
        }
        self
    }
}

impl SourceDb for StubDb {
    fn table_names(&mut self) -> Result<Vec<String>, SourceError> {
        Ok(self.tables.clone())
    }

    fn primary_key_columns(&mut self) -> Result<HashMap<String, Vec<String>>, SourceError> {
        Ok(self.pks.clone())
    }

    fn column_type(&mut self, table: &str, column: &str) -> Result<String, SourceError> {
        self.types
            .get(&(table.to_string(), column.to_string()))
            .cloned()
            .ok_or_else(|| SourceError::Database(format!("no column {table}.{column}")))
    }

    fn create_change_log(&mut self) -> Result<(), SourceError> {
        self.log_creations += 1;
        self.tables.push(CHANGE_LOG_TABLE.to_string());
        Ok(())
    }

    fn create_table_trigger(
        &mut self,
        table: &str,
        table_id: i32,
        _pk_column: &str,
    ) -> Result<(), SourceError> {
        if self.fail_trigger_for.contains(table) {
            return Err(SourceError::Database(format!("DDL rejected for {table}")));
        }
        self.triggers.insert(table_id, table.to_string());
        Ok(())
    }

    fn drop_table_trigger(&mut self, table_id: i32) -> Result<(), SourceError> {
        if self.fail_trigger_drop {
            return Err(SourceError::Database("drop rejected".into()));
        }
        self.dropped_triggers.push(table_id);
        Ok(())
    }

    fn drop_change_log(&mut self) -> Result<(), SourceError> {
        self.log_dropped = true;
        Ok(())
    }

    fn unprocessed_changes(&mut self, _from: i64) -> Result<Vec<Change>, SourceError> {
        Ok(Vec::new())
    }

    fn fetch_row(
        &mut self,
        _table: &str,
        _pk: &str,
        _pk_val: i32,
    ) -> Result<Option<Vec<SqlValue>>, SourceError> {
        Ok(None)
    }

    fn mark_processed(&mut self, _log_id: i64) -> Result<(), SourceError> {
        Ok(())
    }

    fn delete_processed(&mut self) -> Result<u64, SourceError> {
        Ok(0)
    }

    fn change_log_count(&mut self) -> Result<i64, SourceError> {
        Ok(0)
    }

    fn post_wake_event(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}

fn eligible_fixture() -> StubDb {
    StubDb::default()
        .with_table("USERS", &[("ID", "INTEGER")])
        .with_table("ORDERS", &[("ORDER_ID", "INTEGER")])
        .with_table("NOTES", &[("GUID", "VARCHAR")])
        .with_table("PAIRS", &[("A", "INTEGER"), ("B", "INTEGER")])
        .with_table("LOOSE", &[])
}

#[test]
fn only_single_integer_pk_tables_are_instrumented() {
    let mut db = eligible_fixture();
    let maps = Instrumenter::new(&mut db).setup().unwrap();

    assert_eq!(maps.len(), 2);
    assert_eq!(maps.pk_for_table("USERS"), Some("ID"));
    assert_eq!(maps.pk_for_table("ORDERS"), Some("ORDER_ID"));
    assert_eq!(maps.pk_for_table("NOTES"), None);
    assert_eq!(maps.pk_for_table("PAIRS"), None);
    assert_eq!(maps.pk_for_table("LOOSE"), None);

    // The change log was absent, so it was created exactly once.
    assert_eq!(db.log_creations, 1);
    // One trigger per instrumented table, ids 0 and 1.
    assert_eq!(db.triggers.get(&0).map(String::as_str), Some("USERS"));
    assert_eq!(db.triggers.get(&1).map(String::as_str), Some("ORDERS"));
}

#[test]
fn change_log_table_is_never_instrumented() {
    let mut db = StubDb::default().with_table("USERS", &[("ID", "INTEGER")]);
    db.tables.push(CHANGE_LOG_TABLE.to_string());
    db.pks
        .insert(CHANGE_LOG_TABLE.to_string(), vec!["LOG_ID".to_string()]);
    db.types.insert(
        (CHANGE_LOG_TABLE.to_string(), "LOG_ID".to_string()),
        "INTEGER".to_string(),
    );

    let maps = Instrumenter::new(&mut db).setup().unwrap();
    assert_eq!(maps.len(), 1);
    assert_eq!(maps.pk_for_table(CHANGE_LOG_TABLE), None);
    assert_eq!(db.log_creations, 0);
}

#[test]
fn trigger_failure_skips_table_and_keeps_ids_contiguous() {
    let mut db = StubDb::default()
        .with_table("USERS", &[("ID", "INTEGER")])
        .with_table("BROKEN", &[("ID", "INTEGER")])
        .with_table("ORDERS", &[("ORDER_ID", "INTEGER")]);
    db.fail_trigger_for.insert("BROKEN".to_string());

    let maps = Instrumenter::new(&mut db).setup().unwrap();

    assert_eq!(maps.len(), 2);
    assert_eq!(maps.pk_for_table("BROKEN"), None);
    // BROKEN's id was released and reused; delivered ids are 0 and 1.
    assert_eq!(maps.table_for_id(0), Some("USERS"));
    assert_eq!(maps.table_for_id(1), Some("ORDERS"));
    assert_eq!(maps.table_for_id(2), None);
}

#[test]
fn setup_twice_is_idempotent() {
    let mut db = eligible_fixture();
    let first = Instrumenter::new(&mut db).setup().unwrap();
    let second = Instrumenter::new(&mut db).setup().unwrap();

    assert_eq!(db.log_creations, 1);
    assert_eq!(first.len(), second.len());
    for (id, table) in first.iter() {
        assert_eq!(second.table_for_id(id), Some(table));
    }
}

#[test]
fn reset_drops_triggers_then_change_log() {
    let mut db = eligible_fixture();
    Instrumenter::new(&mut db).setup().unwrap();

    Instrumenter::new(&mut db).reset_state().unwrap();
    assert_eq!(db.dropped_triggers, vec![0, 1]);
    assert!(db.log_dropped);
}

#[test]
fn reset_failure_is_fatal() {
    let mut db = eligible_fixture();
    Instrumenter::new(&mut db).setup().unwrap();
    db.fail_trigger_drop = true;

    assert!(Instrumenter::new(&mut db).reset_state().is_err());
    assert!(!db.log_dropped);
}
