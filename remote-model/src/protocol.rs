//! JSON wire protocol for model patches.
//!
//! Every WebSocket text frame carries exactly one object tagged by its
//! `operation` field:
//! ```text
//! server → client                      client → server
//! ─────────────────────────────────    ───────────────────────
//! data            items                changeData  items {k: r}
//! rowData         items, key           remove      items [k]
//! inserted        items {k: r}         insert      items {k: r} | [r]
//! rowsInserted    start, items [r]
//! removed         items [k]
//! rowsRemoved     start, end
//! dataChanged     items {k: r}
//! rowDataChanged  start, end, items [r]
//! ```
//!
//! Range offsets are 0-based and `end` is inclusive.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Records keyed by the string value of their key field.
///
/// Iteration follows insertion order.
pub type KeyedItems = Map<String, Value>;

/// Payload of a full snapshot or an insert request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Items {
    Keyed(KeyedItems),
    Ordered(Vec<Value>),
}

impl Items {
    /// Number of records carried.
    pub fn len(&self) -> usize {
        match self {
            Items::Keyed(map) => map.len(),
            Items::Ordered(list) => list.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation")]
pub enum PatchMessage {
    /// Full snapshot
    #[serde(rename = "data")]
    Data { items: Items },
    /// Full snapshot naming its key field
    #[serde(rename = "rowData")]
    RowData { items: Items, key: String },
    #[serde(rename = "inserted")]
    Inserted { items: KeyedItems },
    #[serde(rename = "rowsInserted")]
    RowsInserted { start: usize, items: Vec<Value> },
    #[serde(rename = "removed")]
    Removed { items: Vec<String> },
    #[serde(rename = "rowsRemoved")]
    RowsRemoved { start: usize, end: usize },
    #[serde(rename = "dataChanged")]
    DataChanged { items: KeyedItems },
    #[serde(rename = "rowDataChanged")]
    RowDataChanged {
        start: usize,
        end: usize,
        items: Vec<Value>,
    },
    /// Edit request from a client
    #[serde(rename = "changeData")]
    ChangeData { items: KeyedItems },
    /// Remove request from a client
    #[serde(rename = "remove")]
    Remove { items: Vec<String> },
    /// Insert request from a client
    #[serde(rename = "insert")]
    Insert { items: Items },
}

impl PatchMessage {
    /// Create an edit request for a single record.
    pub fn change_data(key: String, record: Value) -> Self {
        let mut items = KeyedItems::new();
        items.insert(key, record);
        PatchMessage::ChangeData { items }
    }

    /// Create a remove request for a single key.
    pub fn remove(key: impl Into<String>) -> Self {
        PatchMessage::Remove {
            items: vec![key.into()],
        }
    }

    /// Create an insert request for a record that already carries its key.
    pub fn insert_keyed(key: String, record: Value) -> Self {
        let mut items = KeyedItems::new();
        items.insert(key, record);
        PatchMessage::Insert {
            items: Items::Keyed(items),
        }
    }

    /// Create an insert request for a record the remote must assign a key to.
    pub fn insert_unkeyed(record: Value) -> Self {
        PatchMessage::Insert {
            items: Items::Ordered(vec![record]),
        }
    }

    /// Wire name of this message's operation.
    pub fn operation(&self) -> &'static str {
        match self {
            PatchMessage::Data { .. } => "data",
            PatchMessage::RowData { .. } => "rowData",
            PatchMessage::Inserted { .. } => "inserted",
            PatchMessage::RowsInserted { .. } => "rowsInserted",
            PatchMessage::Removed { .. } => "removed",
            PatchMessage::RowsRemoved { .. } => "rowsRemoved",
            PatchMessage::DataChanged { .. } => "dataChanged",
            PatchMessage::RowDataChanged { .. } => "rowDataChanged",
            PatchMessage::ChangeData { .. } => "changeData",
            PatchMessage::Remove { .. } => "remove",
            PatchMessage::Insert { .. } => "insert",
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Read the key of `record` from its `key_field`.
///
/// Strings are taken verbatim; numbers and booleans use their JSON text,
/// with integral floats written without a fraction (`1.0` is `"1"`).
pub fn record_key(record: &Value, key_field: &str) -> Result<String, ProtocolError> {
    let value = record
        .get(key_field)
        .ok_or_else(|| ProtocolError::MissingKey(key_field.to_string()))?;
    key_text(value).ok_or_else(|| ProtocolError::InvalidKey(value.to_string()))
}

/// Same as [`record_key`] but `None` when the record has no key field.
pub fn try_record_key(record: &Value, key_field: &str) -> Result<Option<String>, ProtocolError> {
    match record.get(key_field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => key_text(value)
            .map(Some)
            .ok_or_else(|| ProtocolError::InvalidKey(value.to_string())),
    }
}

fn key_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(match n.as_f64() {
            // Exact below 2^53
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 => {
                (f as i64).to_string()
            }
            _ => n.to_string(),
        }),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    /// A well-formed message that this side of the connection never accepts
    UnexpectedOperation(&'static str),
    /// Key field present but not a string, number or boolean
    InvalidKey(String),
    MissingKey(String),
    ConnectionClosed,
    Transport(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::UnexpectedOperation(op) => write!(f, "Unexpected operation: {op}"),
            Self::InvalidKey(v) => write!(f, "Invalid key value: {v}"),
            Self::MissingKey(field) => write!(f, "Record has no key field '{field}'"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Transport(e) => write!(f, "Transport error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
