//! Local mirror of the remote collection and patch application.
//!
//! A snapshot is either keyed (key → record, insertion ordered) or ordered
//! (position addressed). The representation is fixed by the first full
//! replace; every later operation asserts it.
//!
//! ```text
//! FullReplace ──► Keyed ◄── KeyedInsert / KeyedRemove / KeyedChange
//!            └──► Ordered ◄── RangeInsert / RangeRemove / RangeChange
//! ```

use serde_json::Value;

use crate::protocol::{Items, KeyedItems, PatchMessage, ProtocolError};

/// Representation of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Keyed,
    Ordered,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Keyed => write!(f, "keyed"),
            Mode::Ordered => write!(f, "ordered"),
        }
    }
}

/// One incremental change to a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    FullReplace {
        items: Items,
        key_field: Option<String>,
    },
    KeyedInsert(KeyedItems),
    RangeInsert {
        start: usize,
        items: Vec<Value>,
    },
    KeyedRemove(Vec<String>),
    /// Removes `start..=end`
    RangeRemove {
        start: usize,
        end: usize,
    },
    /// Overwrites existing keys only
    KeyedChange(KeyedItems),
    /// Replaces `start..=end` with `items`
    RangeChange {
        start: usize,
        end: usize,
        items: Vec<Value>,
    },
}

impl Operation {
    /// Mode this operation requires, `None` for a full replace.
    pub fn required_mode(&self) -> Option<Mode> {
        match self {
            Operation::FullReplace { .. } => None,
            Operation::KeyedInsert(_) | Operation::KeyedRemove(_) | Operation::KeyedChange(_) => {
                Some(Mode::Keyed)
            }
            Operation::RangeInsert { .. }
            | Operation::RangeRemove { .. }
            | Operation::RangeChange { .. } => Some(Mode::Ordered),
        }
    }
}

impl TryFrom<PatchMessage> for Operation {
    type Error = ProtocolError;

    /// Convert a server-to-client message. Client requests are rejected.
    fn try_from(msg: PatchMessage) -> Result<Self, Self::Error> {
        let op = match msg {
            PatchMessage::Data { items } => Operation::FullReplace {
                items,
                key_field: None,
            },
            PatchMessage::RowData { items, key } => Operation::FullReplace {
                items,
                key_field: Some(key),
            },
            PatchMessage::Inserted { items } => Operation::KeyedInsert(items),
            PatchMessage::RowsInserted { start, items } => Operation::RangeInsert { start, items },
            PatchMessage::Removed { items } => Operation::KeyedRemove(items),
            PatchMessage::RowsRemoved { start, end } => Operation::RangeRemove { start, end },
            PatchMessage::DataChanged { items } => Operation::KeyedChange(items),
            PatchMessage::RowDataChanged { start, end, items } => {
                Operation::RangeChange { start, end, items }
            }
            other @ (PatchMessage::ChangeData { .. }
            | PatchMessage::Remove { .. }
            | PatchMessage::Insert { .. }) => {
                return Err(ProtocolError::UnexpectedOperation(other.operation()));
            }
        };
        Ok(op)
    }
}

/// Errors from applying an operation to a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyError {
    /// Incremental operation before any full snapshot
    NoSnapshot,
    ModeMismatch { expected: Mode, found: Mode },
    RangeOutOfBounds { start: usize, end: usize, len: usize },
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSnapshot => write!(f, "Incremental operation received before a full snapshot"),
            Self::ModeMismatch { expected, found } => {
                write!(f, "Operation requires a {expected} snapshot but the snapshot is {found}")
            }
            Self::RangeOutOfBounds { start, end, len } => {
                write!(f, "Range {start}..={end} out of bounds for {len} records")
            }
        }
    }
}

impl std::error::Error for ApplyError {}

/// The local copy of the remote collection.
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    Keyed(KeyedItems),
    Ordered(Vec<Value>),
}

impl Snapshot {
    pub fn mode(&self) -> Mode {
        match self {
            Snapshot::Keyed(_) => Mode::Keyed,
            Snapshot::Ordered(_) => Mode::Ordered,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Snapshot::Keyed(map) => map.len(),
            Snapshot::Ordered(list) => list.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records in publish order: the list itself, or map values in key
    /// iteration order.
    pub fn values(&self) -> Vec<Value> {
        match self {
            Snapshot::Keyed(map) => map.values().cloned().collect(),
            Snapshot::Ordered(list) => list.clone(),
        }
    }

    /// Apply an operation in place.
    ///
    /// A full replace swaps the contents but may not change the mode.
    /// On error the snapshot is left untouched.
    pub fn apply(&mut self, op: Operation) -> Result<(), ApplyError> {
        match (self, op) {
            (this, Operation::FullReplace { items, .. }) => {
                let next = Snapshot::from(items);
                if next.mode() != this.mode() {
                    return Err(ApplyError::ModeMismatch {
                        expected: this.mode(),
                        found: next.mode(),
                    });
                }
                *this = next;
            }
            (Snapshot::Keyed(map), Operation::KeyedInsert(items)) => {
                for (key, record) in items {
                    map.insert(key, record);
                }
            }
            (Snapshot::Keyed(map), Operation::KeyedRemove(keys)) => {
                for key in keys {
                    map.shift_remove(&key);
                }
            }
            (Snapshot::Keyed(map), Operation::KeyedChange(items)) => {
                for (key, record) in items {
                    if let Some(slot) = map.get_mut(&key) {
                        *slot = record;
                    }
                }
            }
            (Snapshot::Ordered(list), Operation::RangeInsert { start, items }) => {
                if start > list.len() {
                    return Err(ApplyError::RangeOutOfBounds {
                        start,
                        end: start,
                        len: list.len(),
                    });
                }
                list.splice(start..start, items);
            }
            (Snapshot::Ordered(list), Operation::RangeRemove { start, end }) => {
                check_span(start, end, list.len())?;
                list.drain(start..=end);
            }
            (Snapshot::Ordered(list), Operation::RangeChange { start, end, items }) => {
                check_span(start, end, list.len())?;
                list.splice(start..=end, items);
            }
            (this, op) => {
                let found = this.mode();
                let expected = op.required_mode().unwrap_or(found);
                return Err(ApplyError::ModeMismatch { expected, found });
            }
        }
        Ok(())
    }
}

impl From<Items> for Snapshot {
    fn from(items: Items) -> Self {
        match items {
            Items::Keyed(map) => Snapshot::Keyed(map),
            Items::Ordered(list) => Snapshot::Ordered(list),
        }
    }
}

fn check_span(start: usize, end: usize, len: usize) -> Result<(), ApplyError> {
    if start > end || end >= len {
        return Err(ApplyError::RangeOutOfBounds { start, end, len });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keyed(pairs: &[(&str, Value)]) -> KeyedItems {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn ordered(values: &[&str]) -> Snapshot {
        Snapshot::Ordered(values.iter().map(|v| json!(v)).collect())
    }

    #[test]
    fn test_keyed_insert_appends_in_order() {
        let mut snap = Snapshot::Keyed(keyed(&[("1", json!({"id": "1", "v": "a"}))]));
        snap.apply(Operation::KeyedInsert(keyed(&[("2", json!({"id": "2", "v": "b"}))])))
            .unwrap();
        assert_eq!(
            snap.values(),
            vec![json!({"id": "1", "v": "a"}), json!({"id": "2", "v": "b"})]
        );
    }

    #[test]
    fn test_keyed_insert_overwrites_in_place() {
        let mut snap = Snapshot::Keyed(keyed(&[("1", json!("a")), ("2", json!("b"))]));
        snap.apply(Operation::KeyedInsert(keyed(&[("1", json!("z"))]))).unwrap();
        assert_eq!(snap.values(), vec![json!("z"), json!("b")]);
    }

    #[test]
    fn test_keyed_remove_keeps_order_and_ignores_unknown() {
        let mut snap = Snapshot::Keyed(keyed(&[
            ("1", json!("a")),
            ("2", json!("b")),
            ("3", json!("c")),
        ]));
        snap.apply(Operation::KeyedRemove(vec!["1".into(), "missing".into()]))
            .unwrap();
        assert_eq!(snap.values(), vec![json!("b"), json!("c")]);
    }

    #[test]
    fn test_keyed_change_never_creates_keys() {
        let mut snap = Snapshot::Keyed(keyed(&[("1", json!({"id": "1", "v": "old"}))]));
        snap.apply(Operation::KeyedChange(keyed(&[("9", json!({"id": "9", "v": "new"}))])))
            .unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.values(), vec![json!({"id": "1", "v": "old"})]);

        snap.apply(Operation::KeyedChange(keyed(&[("1", json!({"id": "1", "v": "new"}))])))
            .unwrap();
        assert_eq!(snap.values(), vec![json!({"id": "1", "v": "new"})]);
    }

    #[test]
    fn test_range_remove_inclusive() {
        let mut snap = ordered(&["a", "b", "c", "d"]);
        snap.apply(Operation::RangeRemove { start: 1, end: 2 }).unwrap();
        assert_eq!(snap, ordered(&["a", "d"]));
    }

    #[test]
    fn test_range_insert_shifts_right() {
        let mut snap = ordered(&["a", "d"]);
        snap.apply(Operation::RangeInsert {
            start: 1,
            items: vec![json!("x"), json!("y")],
        })
        .unwrap();
        assert_eq!(snap, ordered(&["a", "x", "y", "d"]));
    }

    #[test]
    fn test_range_insert_at_end() {
        let mut snap = ordered(&["a"]);
        snap.apply(Operation::RangeInsert {
            start: 1,
            items: vec![json!("b")],
        })
        .unwrap();
        assert_eq!(snap, ordered(&["a", "b"]));
    }

    #[test]
    fn test_range_change_net_splice() {
        let mut snap = ordered(&["a", "b", "c", "d"]);
        snap.apply(Operation::RangeChange {
            start: 1,
            end: 2,
            items: vec![json!("x")],
        })
        .unwrap();
        assert_eq!(snap, ordered(&["a", "x", "d"]));
    }

    #[test]
    fn test_range_change_equals_remove_then_insert() {
        let base = ordered(&["a", "b", "c", "d", "e"]);
        let replacement = vec![json!("x"), json!("y")];

        let mut composite = base.clone();
        composite
            .apply(Operation::RangeRemove { start: 1, end: 2 })
            .unwrap();
        composite
            .apply(Operation::RangeInsert {
                start: 1,
                items: replacement.clone(),
            })
            .unwrap();

        let mut direct = base;
        direct
            .apply(Operation::RangeChange {
                start: 1,
                end: 2,
                items: replacement,
            })
            .unwrap();

        assert_eq!(composite, direct);
    }

    #[test]
    fn test_range_out_of_bounds_leaves_snapshot() {
        let mut snap = ordered(&["a", "b"]);
        let err = snap
            .apply(Operation::RangeRemove { start: 1, end: 2 })
            .unwrap_err();
        assert_eq!(err, ApplyError::RangeOutOfBounds { start: 1, end: 2, len: 2 });

        assert!(snap.apply(Operation::RangeRemove { start: 1, end: 0 }).is_err());
        assert!(snap
            .apply(Operation::RangeInsert { start: 3, items: vec![] })
            .is_err());
        assert_eq!(snap, ordered(&["a", "b"]));
    }

    #[test]
    fn test_mode_mismatch() {
        let mut snap = ordered(&["a"]);
        let err = snap
            .apply(Operation::KeyedRemove(vec!["a".into()]))
            .unwrap_err();
        assert_eq!(
            err,
            ApplyError::ModeMismatch {
                expected: Mode::Keyed,
                found: Mode::Ordered,
            }
        );

        let mut snap = Snapshot::Keyed(KeyedItems::new());
        assert!(snap.apply(Operation::RangeRemove { start: 0, end: 0 }).is_err());
    }

    #[test]
    fn test_full_replace_same_mode() {
        let mut snap = ordered(&["a", "b"]);
        snap.apply(Operation::FullReplace {
            items: Items::Ordered(vec![json!("z")]),
            key_field: None,
        })
        .unwrap();
        assert_eq!(snap, ordered(&["z"]));

        let err = snap
            .apply(Operation::FullReplace {
                items: Items::Keyed(KeyedItems::new()),
                key_field: None,
            })
            .unwrap_err();
        assert!(matches!(err, ApplyError::ModeMismatch { .. }));
    }

    #[test]
    fn test_operation_from_message() {
        let op = Operation::try_from(PatchMessage::RowsRemoved { start: 0, end: 1 }).unwrap();
        assert_eq!(op, Operation::RangeRemove { start: 0, end: 1 });

        let op = Operation::try_from(PatchMessage::RowData {
            items: Items::Ordered(vec![]),
            key: "name".into(),
        })
        .unwrap();
        assert_eq!(
            op,
            Operation::FullReplace {
                items: Items::Ordered(vec![]),
                key_field: Some("name".into()),
            }
        );

        let err = Operation::try_from(PatchMessage::remove("1")).unwrap_err();
        assert_eq!(err, ProtocolError::UnexpectedOperation("remove"));
    }
}
