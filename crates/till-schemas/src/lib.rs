//! Shared data model for the TillStream agent.
//!
//! Everything that crosses a crate boundary lives here: the in-memory
//! [`Change`] record read from the change log, the tagged scalar
//! [`SqlValue`] produced at the database driver boundary, the outbound
//! [`ChangeEvent`] wire payload, and the read-only [`TableMaps`] built at
//! instrumentation time.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Mutation
// ---------------------------------------------------------------------------

/// Kind of row mutation captured by a recording trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mutation {
    Insert,
    Update,
    Delete,
}

impl Mutation {
    /// String form stored in `CHANGES_LOG.MUTATION` and sent as the wire
    /// `type` discriminator.
    pub fn as_str(self) -> &'static str {
        match self {
            Mutation::Insert => "INSERT",
            Mutation::Update => "UPDATE",
            Mutation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `MUTATION` column value that is not one of INSERT/UPDATE/DELETE.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown mutation kind: {0:?}")]
pub struct UnknownMutation(pub String);

impl FromStr for Mutation {
    type Err = UnknownMutation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "INSERT" => Ok(Mutation::Insert),
            "UPDATE" => Ok(Mutation::Update),
            "DELETE" => Ok(Mutation::Delete),
            other => Err(UnknownMutation(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Change
// ---------------------------------------------------------------------------

/// One `CHANGES_LOG` row, decoded.
///
/// `log_id` is assigned by the source-database sequence and is strictly
/// increasing in commit order; it is the consumer-side dedup key.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub log_id: i64,
    /// Integer primary-key value of the mutated row.
    pub pk_val: i32,
    /// Instrumenter-assigned table id; resolved via [`TableMaps`].
    pub table_id: i32,
    pub mutation: Mutation,
    /// Source-database clock at trigger time.
    pub occurred_at: NaiveDateTime,
    pub processed: bool,
}

impl Change {
    /// Wire timestamp: Unix seconds, fractional.
    pub fn unix_timestamp(&self) -> f64 {
        self.occurred_at.and_utc().timestamp_micros() as f64 / 1_000_000.0
    }
}

// ---------------------------------------------------------------------------
// SqlValue
// ---------------------------------------------------------------------------

/// A single hydrated row cell, tagged at the driver boundary.
///
/// JSON form (positional inside `row_data`): integers and floats as JSON
/// numbers, text as strings, timestamps as ISO-8601 strings, binary as
/// lossy UTF-8 strings, `Null` as `null`. Fixed-point decimals are
/// converted to `Float` by the driver before they reach this type.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(NaiveDateTime),
    Bool(bool),
    Null,
}

impl Serialize for SqlValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SqlValue::Int(v) => serializer.serialize_i64(*v),
            SqlValue::Float(v) => serializer.serialize_f64(*v),
            SqlValue::Text(v) => serializer.serialize_str(v),
            SqlValue::Bytes(v) => serializer.serialize_str(&String::from_utf8_lossy(v)),
            SqlValue::Timestamp(v) => serializer.serialize_str(&v.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            SqlValue::Bool(v) => serializer.serialize_bool(*v),
            SqlValue::Null => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for SqlValue {
    /// Lossy by construction: timestamps and binary come back as `Text`
    /// because the wire format does not distinguish them from strings.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Ok(match raw {
            serde_json::Value::Null => SqlValue::Null,
            serde_json::Value::Bool(b) => SqlValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    SqlValue::Int(i)
                } else {
                    SqlValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => SqlValue::Text(s),
            other => return Err(de::Error::custom(format!("unsupported row cell: {other}"))),
        })
    }
}

// ---------------------------------------------------------------------------
// ChangeEvent
// ---------------------------------------------------------------------------

/// Outbound wire payload, one POST body per event.
///
/// INSERT and UPDATE carry the post-image as a positional `row_data` array
/// (`null` when the row vanished between mutation and hydration); DELETE
/// carries only the primary-key column name and value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChangeEvent {
    #[serde(rename = "INSERT")]
    Insert {
        table: String,
        row_data: Option<Vec<SqlValue>>,
        timestamp: f64,
    },
    #[serde(rename = "UPDATE")]
    Update {
        table: String,
        row_data: Option<Vec<SqlValue>>,
        timestamp: f64,
    },
    #[serde(rename = "DELETE")]
    Delete {
        table: String,
        primary_key: String,
        value: i32,
        timestamp: f64,
    },
}

impl ChangeEvent {
    pub fn table(&self) -> &str {
        match self {
            ChangeEvent::Insert { table, .. }
            | ChangeEvent::Update { table, .. }
            | ChangeEvent::Delete { table, .. } => table,
        }
    }

    pub fn mutation(&self) -> Mutation {
        match self {
            ChangeEvent::Insert { .. } => Mutation::Insert,
            ChangeEvent::Update { .. } => Mutation::Update,
            ChangeEvent::Delete { .. } => Mutation::Delete,
        }
    }
}

// ---------------------------------------------------------------------------
// TableMaps
// ---------------------------------------------------------------------------

/// Read-only table metadata produced by instrumentation setup.
///
/// Only tables with a single INTEGER primary-key column appear here; the
/// change log itself never does.
#[derive(Debug, Clone, Default)]
pub struct TableMaps {
    id_to_table: HashMap<i32, String>,
    table_to_pk: HashMap<String, String>,
}

impl TableMaps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table under the next id. Returns the assigned id.
    pub fn insert(&mut self, table: &str, pk_column: &str) -> i32 {
        let id = self.id_to_table.len() as i32;
        self.id_to_table.insert(id, table.to_string());
        self.table_to_pk.insert(table.to_string(), pk_column.to_string());
        id
    }

    /// Drop a table that failed trigger installation after registration.
    pub fn remove(&mut self, id: i32) {
        if let Some(table) = self.id_to_table.remove(&id) {
            self.table_to_pk.remove(&table);
        }
    }

    pub fn table_for_id(&self, id: i32) -> Option<&str> {
        self.id_to_table.get(&id).map(String::as_str)
    }

    pub fn pk_for_table(&self, table: &str) -> Option<&str> {
        self.table_to_pk.get(table).map(String::as_str)
    }

    /// Iterate `(table_id, table_name)` pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (i32, &str)> {
        self.id_to_table.iter().map(|(id, t)| (*id, t.as_str()))
    }

    pub fn len(&self) -> usize {
        self.id_to_table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_table.is_empty()
    }
}
