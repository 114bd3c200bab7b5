//! Firebird implementation of the source-database traits.
//!
//! Every piece of Firebird SQL in the agent lives in this module: the
//! `RDB$` catalog queries, the change-log DDL, the recording-trigger
//! bodies and the cursor/hydration queries. The rest of the pipeline only
//! sees the traits.
//!
//! The driver (rsfbclient, pure-rust protocol) has no event-subscription
//! API, so [`FirebirdConnector::conduit`] returns a bounded-interval
//! conduit: `wait` simply elapses and the intake loop drains its cursor on
//! every wake. The intake trigger still posts the named event so that
//! event-capable consumers of the same database keep working.

use std::collections::HashMap;
use std::time::Duration;

use rsfbclient::charset::{self, Charset};
use rsfbclient::{Execute, FbError, Queryable, Row, SimpleConnection, SqlType};
use tracing::debug;

use till_schemas::{Change, Mutation, SqlValue};

use crate::{
    ChangeConduit, SourceConnector, SourceDb, SourceError, Wake, CHANGE_LOG_PK, CHANGE_LOG_SEQUENCE,
    CHANGE_LOG_TABLE, INTAKE_EVENT,
};

// ---------------------------------------------------------------------------
// Connection parameters
// ---------------------------------------------------------------------------

/// Resolved Firebird connection parameters.
#[derive(Debug, Clone)]
pub struct FirebirdParams {
    pub host: String,
    pub port: u16,
    pub db_name: String,
    pub user: String,
    pub password: String,
    pub charset: String,
}

impl FirebirdParams {
    /// Build parameters from a DSN-style path.
    ///
    /// `path` is either a plain database file path (local server) or
    /// `host:/path/to/db.fdb`. A single character before the colon is a
    /// Windows drive letter, not a host.
    pub fn from_dsn(path: &str, user: &str, password: &str, charset: &str) -> Self {
        let (host, db_name) = match path.split_once(':') {
            Some((head, rest)) if head.len() > 1 => (head.to_string(), rest.to_string()),
            _ => ("localhost".to_string(), path.to_string()),
        };
        Self {
            host,
            port: 3050,
            db_name,
            user: user.to_string(),
            password: password.to_string(),
            charset: charset.to_string(),
        }
    }

    fn charset(&self) -> Charset {
        match self.charset.to_ascii_uppercase().as_str() {
            "UTF8" | "UTF-8" => charset::UTF_8,
            "ISO8859_1" => charset::ISO_8859_1,
            "WIN1252" => charset::WIN_1252,
            "WIN1251" => charset::WIN_1251,
            "ASCII" => charset::ASCII,
            other => {
                debug!(charset = other, "unknown charset name, defaulting to UTF8");
                charset::UTF_8
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

pub struct FirebirdConnector {
    params: FirebirdParams,
    poll_interval: Duration,
}

impl FirebirdConnector {
    pub fn new(params: FirebirdParams, poll_interval: Duration) -> Self {
        Self {
            params,
            poll_interval,
        }
    }
}

impl SourceConnector for FirebirdConnector {
    fn connect(&self) -> Result<Box<dyn SourceDb>, SourceError> {
        let conn: SimpleConnection = rsfbclient::builder_pure_rust()
            .host(&self.params.host)
            .port(self.params.port)
            .db_name(&self.params.db_name)
            .user(&self.params.user)
            .pass(&self.params.password)
            .charset(self.params.charset())
            .connect()
            .map_err(|e| SourceError::Connect(e.to_string()))?
            .into();
        Ok(Box::new(FirebirdDb { conn }))
    }

    fn conduit(&self) -> Result<Box<dyn ChangeConduit>, SourceError> {
        Ok(Box::new(PollConduit {
            interval: self.poll_interval,
        }))
    }
}

/// Interval-based stand-in for a Firebird event subscription.
struct PollConduit {
    interval: Duration,
}

impl ChangeConduit for PollConduit {
    fn wait(&mut self, timeout: Duration) -> Result<Wake, SourceError> {
        std::thread::sleep(timeout.min(self.interval));
        Ok(Wake::Timeout)
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

pub struct FirebirdDb {
    conn: SimpleConnection,
}

fn db_err(e: FbError) -> SourceError {
    SourceError::Database(e.to_string())
}

impl FirebirdDb {
    fn execute_ddl(&mut self, sql: &str) -> Result<(), SourceError> {
        self.conn.execute(sql, ()).map(|_| ()).map_err(db_err)
    }
}

impl SourceDb for FirebirdDb {
    fn table_names(&mut self) -> Result<Vec<String>, SourceError> {
        let rows: Vec<(String,)> = self
            .conn
            .query(
                "SELECT RDB$RELATION_NAME FROM RDB$RELATIONS WHERE RDB$SYSTEM_FLAG = 0",
                (),
            )
            .map_err(db_err)?;
        Ok(rows.into_iter().map(|(name,)| name.trim().to_string()).collect())
    }

    fn primary_key_columns(&mut self) -> Result<HashMap<String, Vec<String>>, SourceError> {
        let rows: Vec<(String, String)> = self
            .conn
            .query(
                "SELECT rc.RDB$RELATION_NAME, sg.RDB$FIELD_NAME \
                 FROM RDB$INDICES ix \
                 LEFT JOIN RDB$INDEX_SEGMENTS sg ON ix.RDB$INDEX_NAME = sg.RDB$INDEX_NAME \
                 LEFT JOIN RDB$RELATION_CONSTRAINTS rc ON rc.RDB$INDEX_NAME = ix.RDB$INDEX_NAME \
                 WHERE rc.RDB$CONSTRAINT_TYPE = 'PRIMARY KEY' \
                 ORDER BY rc.RDB$RELATION_NAME, sg.RDB$FIELD_POSITION",
                (),
            )
            .map_err(db_err)?;

        let mut by_table: HashMap<String, Vec<String>> = HashMap::new();
        for (table, column) in rows {
            by_table
                .entry(table.trim().to_string())
                .or_default()
                .push(column.trim().to_string());
        }
        Ok(by_table)
    }

    fn column_type(&mut self, table: &str, column: &str) -> Result<String, SourceError> {
        let rows: Vec<(String,)> = self
            .conn
            .query(
                "SELECT CASE f.RDB$FIELD_TYPE \
                 WHEN 261 THEN 'BLOB' \
                 WHEN 14 THEN 'CHAR' \
                 WHEN 40 THEN 'CSTRING' \
                 WHEN 11 THEN 'D_FLOAT' \
                 WHEN 27 THEN 'DOUBLE' \
                 WHEN 10 THEN 'FLOAT' \
                 WHEN 16 THEN 'INT64' \
                 WHEN 8 THEN 'INTEGER' \
                 WHEN 9 THEN 'QUAD' \
                 WHEN 7 THEN 'SMALLINT' \
                 WHEN 12 THEN 'DATE' \
                 WHEN 13 THEN 'TIME' \
                 WHEN 35 THEN 'TIMESTAMP' \
                 WHEN 37 THEN 'VARCHAR' \
                 ELSE 'UNKNOWN' END \
                 FROM RDB$RELATION_FIELDS r \
                 LEFT JOIN RDB$FIELDS f ON r.RDB$FIELD_SOURCE = f.RDB$FIELD_NAME \
                 WHERE r.RDB$RELATION_NAME = ? AND r.RDB$FIELD_NAME = ?",
                (table, column),
            )
            .map_err(db_err)?;

        match rows.into_iter().next() {
            Some((ty,)) => Ok(ty.trim().to_string()),
            None => Err(SourceError::Database(format!(
                "no such column {column} on table {table}"
            ))),
        }
    }

    fn create_change_log(&mut self) -> Result<(), SourceError> {
        // Smallint 0/1 domain; the target servers predate the native type.
        self.execute_ddl(
            "CREATE DOMAIN BOOLEAN AS SMALLINT CHECK (value is null or value in (0, 1))",
        )?;
        self.execute_ddl(&format!(
            "CREATE TABLE {CHANGE_LOG_TABLE}(\
             LOG_ID int not null primary key, \
             PK_VAL int not null, \
             TABLE_ID int not null, \
             MUTATION varchar(31), \
             OCCURRED_AT TIMESTAMP, \
             PROCESSED BOOLEAN DEFAULT 0)"
        ))?;
        self.execute_ddl(&format!("CREATE SEQUENCE {CHANGE_LOG_SEQUENCE}"))?;
        self.execute_ddl(&format!(
            "CREATE OR ALTER TRIGGER INTAKE_TRIGGER \
             FOR {CHANGE_LOG_TABLE} \
             ACTIVE AFTER INSERT POSITION 10 \
             AS BEGIN \
             POST_EVENT '{INTAKE_EVENT}'; \
             END"
        ))
    }

    fn create_table_trigger(
        &mut self,
        table: &str,
        table_id: i32,
        pk_column: &str,
    ) -> Result<(), SourceError> {
        self.execute_ddl(&format!(
            "CREATE OR ALTER TRIGGER TABLE_{table_id}_CHANGES \
             FOR {table} \
             ACTIVE AFTER INSERT OR UPDATE OR DELETE POSITION 10 \
             AS \
             DECLARE VARIABLE primary_key_value INTEGER; \
             DECLARE VARIABLE mutation VARCHAR(6); \
             BEGIN \
             primary_key_value = CASE \
                 WHEN INSERTING THEN NEW.{pk_column} \
                 WHEN UPDATING THEN NEW.{pk_column} \
                 WHEN DELETING THEN OLD.{pk_column} \
                 END; \
             mutation = CASE \
                 WHEN INSERTING THEN 'INSERT' \
                 WHEN UPDATING THEN 'UPDATE' \
                 WHEN DELETING THEN 'DELETE' \
                 END; \
             INSERT INTO {CHANGE_LOG_TABLE} (LOG_ID, PK_VAL, TABLE_ID, MUTATION, OCCURRED_AT) \
                 VALUES (NEXT VALUE FOR {CHANGE_LOG_SEQUENCE}, :primary_key_value, {table_id}, :mutation, current_timestamp); \
             END"
        ))
    }

    fn drop_table_trigger(&mut self, table_id: i32) -> Result<(), SourceError> {
        self.execute_ddl(&format!("DROP TRIGGER TABLE_{table_id}_CHANGES"))
    }

    fn drop_change_log(&mut self) -> Result<(), SourceError> {
        self.execute_ddl("DROP TRIGGER INTAKE_TRIGGER")?;
        self.execute_ddl(&format!("DROP TABLE {CHANGE_LOG_TABLE}"))?;
        self.execute_ddl(&format!("DROP SEQUENCE {CHANGE_LOG_SEQUENCE}"))?;
        self.execute_ddl("DROP DOMAIN BOOLEAN")
    }

    fn unprocessed_changes(&mut self, from_log_id: i64) -> Result<Vec<Change>, SourceError> {
        let rows: Vec<(i32, i32, i32, Option<String>, Option<chrono::NaiveDateTime>, i32)> = self
            .conn
            .query(
                &format!(
                    "SELECT LOG_ID, PK_VAL, TABLE_ID, MUTATION, OCCURRED_AT, PROCESSED \
                     FROM {CHANGE_LOG_TABLE} \
                     WHERE {CHANGE_LOG_PK} >= ? AND PROCESSED = 0 \
                     ORDER BY {CHANGE_LOG_PK}"
                ),
                (from_log_id as i32,),
            )
            .map_err(db_err)?;

        rows.into_iter()
            .map(|(log_id, pk_val, table_id, mutation, occurred_at, processed)| {
                let mutation: Mutation = mutation
                    .ok_or_else(|| SourceError::BadLogRow(format!("log {log_id}: null mutation")))?
                    .parse()
                    .map_err(|e| SourceError::BadLogRow(format!("log {log_id}: {e}")))?;
                let occurred_at = occurred_at.ok_or_else(|| {
                    SourceError::BadLogRow(format!("log {log_id}: null timestamp"))
                })?;
                Ok(Change {
                    log_id: log_id as i64,
                    pk_val,
                    table_id,
                    mutation,
                    occurred_at,
                    processed: processed != 0,
                })
            })
            .collect()
    }

    fn fetch_row(
        &mut self,
        table: &str,
        pk_column: &str,
        pk_val: i32,
    ) -> Result<Option<Vec<SqlValue>>, SourceError> {
        let rows: Vec<Row> = self
            .conn
            .query(
                &format!("SELECT * FROM {table} WHERE {pk_column} = ?"),
                (pk_val,),
            )
            .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .next()
            .map(|row| row.cols.into_iter().map(|col| from_sql_type(col.value)).collect()))
    }

    fn mark_processed(&mut self, log_id: i64) -> Result<(), SourceError> {
        self.conn
            .execute(
                &format!("UPDATE {CHANGE_LOG_TABLE} SET PROCESSED = 1 WHERE {CHANGE_LOG_PK} = ?"),
                (log_id as i32,),
            )
            .map(|_| ())
            .map_err(db_err)
    }

    fn delete_processed(&mut self) -> Result<u64, SourceError> {
        self.conn
            .execute(
                &format!("DELETE FROM {CHANGE_LOG_TABLE} WHERE PROCESSED = 1"),
                (),
            )
            .map(|n| n as u64)
            .map_err(db_err)
    }

    fn change_log_count(&mut self) -> Result<i64, SourceError> {
        let rows: Vec<(i64,)> = self
            .conn
            .query(&format!("SELECT COUNT(*) FROM {CHANGE_LOG_TABLE}"), ())
            .map_err(db_err)?;
        Ok(rows.first().map(|(n,)| *n).unwrap_or(0))
    }

    fn post_wake_event(&mut self) -> Result<(), SourceError> {
        self.execute_ddl(&format!(
            "EXECUTE BLOCK AS BEGIN POST_EVENT '{INTAKE_EVENT}'; END"
        ))
    }
}

/// Driver scalar → pipeline scalar. Fixed-point comes out of the driver as
/// floating already; everything else maps one to one.
fn from_sql_type(value: SqlType) -> SqlValue {
    match value {
        SqlType::Integer(v) => SqlValue::Int(v),
        SqlType::Floating(v) => SqlValue::Float(v),
        SqlType::Text(v) => SqlValue::Text(v),
        SqlType::Binary(v) => SqlValue::Bytes(v),
        SqlType::Timestamp(v) => SqlValue::Timestamp(v),
        SqlType::Boolean(v) => SqlValue::Bool(v),
        SqlType::Null => SqlValue::Null,
        #[allow(unreachable_patterns)]
        _ => SqlValue::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dsn_with_host_prefix() {
        let p = FirebirdParams::from_dsn("posserver:/var/db/till.fdb", "sysdba", "mk", "UTF8");
        assert_eq!(p.host, "posserver");
        assert_eq!(p.db_name, "/var/db/till.fdb");
    }

    #[test]
    fn dsn_with_drive_letter_is_local() {
        let p = FirebirdParams::from_dsn("C:/pos/data.fdb", "sysdba", "mk", "UTF8");
        assert_eq!(p.host, "localhost");
        assert_eq!(p.db_name, "C:/pos/data.fdb");
    }

    #[test]
    fn plain_path_is_local() {
        let p = FirebirdParams::from_dsn("/var/db/till.fdb", "sysdba", "mk", "UTF8");
        assert_eq!(p.host, "localhost");
        assert_eq!(p.db_name, "/var/db/till.fdb");
    }
}
