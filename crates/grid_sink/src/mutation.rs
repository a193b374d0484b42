//! Mutation values, write operations, and co-located mutation groups.
//!
//! A [`MutationGroup`] is the atomic unit of the whole pipeline: it is
//! partitioned, batched, and submitted as one piece, never split.

use crate::error::{Result, SinkError};

/// Scalar value carried by one mutated column or key part.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Bytes(Vec<u8>),
    /// Nanoseconds since the Unix epoch.
    TimestampNanos(i64),
}

impl Value {
    /// Returns `true` for the explicit null value.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// Write flavors understood by the target store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Insert,
    Update,
    InsertOrUpdate,
    Replace,
}

impl WriteKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::InsertOrUpdate => "insert_or_update",
            Self::Replace => "replace",
        }
    }
}

/// Contiguous key range addressed by a range delete.
///
/// `start` and `end` may be prefixes of the full primary key.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeyRange {
    pub start: Vec<Value>,
    pub end: Vec<Value>,
    pub start_closed: bool,
    pub end_closed: bool,
}

/// Set of point keys and ranges addressed by one delete mutation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeySet {
    /// Fully-specified primary keys, each in schema key order.
    pub keys: Vec<Vec<Value>>,
    /// Key ranges; presence of any range makes the delete non-point.
    pub ranges: Vec<KeyRange>,
}

impl KeySet {
    /// Key set naming exactly one primary key.
    pub fn point(key: Vec<Value>) -> Self {
        Self {
            keys: vec![key],
            ranges: Vec::new(),
        }
    }

    /// Key set covering one range.
    pub fn range(range: KeyRange) -> Self {
        Self {
            keys: Vec::new(),
            ranges: vec![range],
        }
    }

    /// A point delete names exactly one key and no ranges. Only point
    /// deletes have a derivable partition key.
    pub fn is_point(&self) -> bool {
        self.keys.len() == 1 && self.ranges.is_empty()
    }
}

/// One row-level operation against one table. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Insert/update/upsert/replace with explicit column assignments.
    Write {
        kind: WriteKind,
        table: String,
        /// Column assignments in caller order; key columns must be present.
        columns: Vec<(String, Value)>,
    },
    /// Delete addressed by point keys and/or ranges.
    Delete { table: String, key_set: KeySet },
}

impl Mutation {
    pub fn insert(table: impl Into<String>, columns: Vec<(String, Value)>) -> Self {
        Self::Write {
            kind: WriteKind::Insert,
            table: table.into(),
            columns,
        }
    }

    pub fn update(table: impl Into<String>, columns: Vec<(String, Value)>) -> Self {
        Self::Write {
            kind: WriteKind::Update,
            table: table.into(),
            columns,
        }
    }

    pub fn insert_or_update(table: impl Into<String>, columns: Vec<(String, Value)>) -> Self {
        Self::Write {
            kind: WriteKind::InsertOrUpdate,
            table: table.into(),
            columns,
        }
    }

    pub fn replace(table: impl Into<String>, columns: Vec<(String, Value)>) -> Self {
        Self::Write {
            kind: WriteKind::Replace,
            table: table.into(),
            columns,
        }
    }

    pub fn delete(table: impl Into<String>, key_set: KeySet) -> Self {
        Self::Delete {
            table: table.into(),
            key_set,
        }
    }

    /// Delete naming exactly one primary key.
    pub fn point_delete(table: impl Into<String>, key: Vec<Value>) -> Self {
        Self::Delete {
            table: table.into(),
            key_set: KeySet::point(key),
        }
    }

    /// Table this mutation addresses, as written by the caller.
    pub fn table(&self) -> &str {
        match self {
            Self::Write { table, .. } => table,
            Self::Delete { table, .. } => table,
        }
    }

    /// Short operation label used in logs.
    pub fn op_label(&self) -> &'static str {
        match self {
            Self::Write { kind, .. } => kind.as_str(),
            Self::Delete { .. } => "delete",
        }
    }
}

/// Non-empty ordered sequence of mutations that must land together.
///
/// The first mutation is the primary; its table and key derive the group's
/// partition assignment. The group is never split across partitions or
/// batches.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationGroup {
    mutations: Vec<Mutation>,
}

impl MutationGroup {
    /// Group holding a single mutation.
    pub fn new(primary: Mutation) -> Self {
        Self {
            mutations: vec![primary],
        }
    }

    /// Group with a designated primary followed by attached mutations.
    pub fn with_attached(primary: Mutation, attached: Vec<Mutation>) -> Self {
        let mut mutations = Vec::with_capacity(1 + attached.len());
        mutations.push(primary);
        mutations.extend(attached);
        Self { mutations }
    }

    /// Builds a group from an ordered mutation list, rejecting empty input.
    pub fn from_mutations(mutations: Vec<Mutation>) -> Result<Self> {
        if mutations.is_empty() {
            return Err(SinkError::Config(
                "mutation group must contain at least one mutation".to_string(),
            ));
        }
        Ok(Self { mutations })
    }

    /// The mutation whose key determines the group's partition.
    pub fn primary(&self) -> &Mutation {
        &self.mutations[0]
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    /// Always `false`; construction rejects empty groups.
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn into_mutations(self) -> Vec<Mutation> {
        self.mutations
    }
}

impl IntoIterator for MutationGroup {
    type Item = Mutation;
    type IntoIter = std::vec::IntoIter<Mutation>;

    fn into_iter(self) -> Self::IntoIter {
        self.mutations.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_group_is_rejected() {
        let err = MutationGroup::from_mutations(Vec::new()).unwrap_err();
        assert!(matches!(err, SinkError::Config(_)));
    }

    #[test]
    fn primary_is_first_mutation() {
        let group = MutationGroup::with_attached(
            Mutation::insert("orders", vec![("id".to_string(), Value::Int64(1))]),
            vec![Mutation::point_delete("order_lines", vec![Value::Int64(1)])],
        );
        assert_eq!(group.len(), 2);
        assert_eq!(group.primary().table(), "orders");
    }

    #[test]
    fn point_classification() {
        assert!(KeySet::point(vec![Value::Int64(7)]).is_point());
        assert!(!KeySet::range(KeyRange::default()).is_point());
        let multi = KeySet {
            keys: vec![vec![Value::Int64(1)], vec![Value::Int64(2)]],
            ranges: Vec::new(),
        };
        assert!(!multi.is_point());
    }
}
