//! Read-only schema snapshot for the target store.
//!
//! The snapshot is fetched (or constructed) once per run, validated
//! eagerly, and shared read-only with every pipeline stage. It is the
//! authority for key order when encoding partition keys and for index
//! fan-out when counting mutated cells.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SinkError};

/// Column types understood by the key and payload codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Bool,
    Int64,
    Float64,
    Utf8,
    Bytes,
    TimestampNanos,
}

/// One column definition within a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub column_type: ColumnType,
    #[serde(default)]
    pub nullable: bool,
}

/// One primary-key component with its sort direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPart {
    pub column: String,
    #[serde(default)]
    pub descending: bool,
}

/// Secondary index over a subset of a table's columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    pub columns: Vec<String>,
}

/// One table definition inside the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    pub key_parts: Vec<KeyPart>,
    #[serde(default)]
    pub indexes: Vec<IndexDescriptor>,
}

impl TableDescriptor {
    /// Looks up a column by exact name.
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|column| column.name == name)
    }

    /// Number of cells mutated in the base table plus every secondary
    /// index when `column` is written: 1 for the row cell plus one per
    /// index referencing the column.
    pub fn cells_mutated_per_column(&self, column: &str) -> u64 {
        let index_cells = self
            .indexes
            .iter()
            .filter(|index| index.columns.iter().any(|c| c == column))
            .count() as u64;
        1 + index_cells
    }

    /// Number of cells mutated when an entire row is deleted.
    pub fn cells_mutated_per_row(&self) -> u64 {
        self.columns
            .iter()
            .map(|column| self.cells_mutated_per_column(&column.name))
            .sum()
    }

    /// Validates required descriptor fields before the snapshot is built.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SinkError::Config(
                "table descriptor has empty name".to_string(),
            ));
        }
        if self.columns.is_empty() {
            return Err(SinkError::Config(format!(
                "table '{}' declares no columns",
                self.name
            )));
        }
        let mut seen = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            if column.name.trim().is_empty() {
                return Err(SinkError::Config(format!(
                    "table '{}' has a column with empty name",
                    self.name
                )));
            }
            if seen.contains(&column.name.as_str()) {
                return Err(SinkError::Config(format!(
                    "table '{}' declares column '{}' more than once",
                    self.name, column.name
                )));
            }
            seen.push(column.name.as_str());
        }
        if self.key_parts.is_empty() {
            return Err(SinkError::Config(format!(
                "table '{}' declares no primary key",
                self.name
            )));
        }
        for part in &self.key_parts {
            if self.column(&part.column).is_none() {
                return Err(SinkError::Config(format!(
                    "table '{}' key part references unknown column '{}'",
                    self.name, part.column
                )));
            }
        }
        for index in &self.indexes {
            if index.name.trim().is_empty() {
                return Err(SinkError::Config(format!(
                    "table '{}' has an index with empty name",
                    self.name
                )));
            }
            for column in &index.columns {
                if self.column(column).is_none() {
                    return Err(SinkError::Config(format!(
                        "index '{}' on table '{}' references unknown column '{}'",
                        index.name, self.name, column
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Normalizes a table name for lookups and partition ids.
pub fn normalize_table_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// Immutable snapshot of the target store's table definitions.
///
/// Built once, then broadcast behind an `Arc` to all pipeline stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSchema {
    /// Tables keyed by normalized name.
    tables: BTreeMap<String, TableDescriptor>,
}

impl StoreSchema {
    /// Builds and validates a snapshot from table descriptors.
    pub fn new(tables: Vec<TableDescriptor>) -> Result<Self> {
        let mut by_name = BTreeMap::new();
        for table in tables {
            table.validate()?;
            let normalized = normalize_table_name(&table.name);
            if by_name.insert(normalized.clone(), table).is_some() {
                return Err(SinkError::Config(format!(
                    "schema declares table '{normalized}' more than once"
                )));
            }
        }
        Ok(Self { tables: by_name })
    }

    /// Looks up a table by normalized name.
    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.get(&normalize_table_name(name))
    }

    /// Looks up a table, failing with `SchemaMismatch` when absent.
    pub fn require_table(&self, name: &str) -> Result<&TableDescriptor> {
        let normalized = normalize_table_name(name);
        self.tables.get(&normalized).ok_or_else(|| {
            SinkError::schema_mismatch(&normalized, "table not present in schema snapshot")
        })
    }

    /// Number of tables in the snapshot.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Parses a snapshot from its JSON transport form, re-running the
    /// same validation as [`StoreSchema::new`] since transport bypasses
    /// the constructor.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let schema: Self = serde_json::from_slice(bytes)
            .map_err(|err| SinkError::Config(format!("invalid schema snapshot json: {err}")))?;
        for (key, table) in &schema.tables {
            table.validate()?;
            if key != &normalize_table_name(&table.name) {
                return Err(SinkError::Config(format!(
                    "schema snapshot key '{}' does not match table name '{}'",
                    key, table.name
                )));
            }
        }
        Ok(schema)
    }

    /// Serializes the snapshot for transport or persistence.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|err| SinkError::Config(format!("encode schema snapshot json: {err}")))
    }
}
