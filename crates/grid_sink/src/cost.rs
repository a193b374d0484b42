//! Size and mutated-cell estimation used for batch admission.
//!
//! Both estimates are deliberately cheap: they bound transactions against
//! the store's payload and cell ceilings, they do not have to be exact.

use crate::error::Result;
use crate::mutation::{Mutation, MutationGroup, Value};
use crate::schema::StoreSchema;

/// Estimated payload bytes for one scalar value.
fn value_size(value: &Value) -> u64 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Int64(_) | Value::Float64(_) | Value::TimestampNanos(_) => 8,
        Value::Utf8(text) => text.len() as u64,
        Value::Bytes(bytes) => bytes.len() as u64,
    }
}

fn key_values_size(values: &[Value]) -> u64 {
    values.iter().map(value_size).sum()
}

/// Estimated payload bytes for one mutation group.
pub fn estimated_size(group: &MutationGroup) -> u64 {
    group
        .mutations()
        .iter()
        .map(|mutation| match mutation {
            Mutation::Write { columns, .. } => {
                columns.iter().map(|(_, value)| value_size(value)).sum()
            }
            Mutation::Delete { key_set, .. } => {
                let keys: u64 = key_set.keys.iter().map(|key| key_values_size(key)).sum();
                let ranges: u64 = key_set
                    .ranges
                    .iter()
                    .map(|range| key_values_size(&range.start) + key_values_size(&range.end))
                    .sum();
                keys + ranges
            }
        })
        .sum()
}

/// Number of cells the store mutates for one group, including secondary
/// index cells.
///
/// Writes charge the per-column weight of every assigned column. Point
/// deletes charge full-row weight per named key. Range deletes have no
/// general estimate and charge nothing; the partitioner already isolates
/// them into single-group batches.
pub fn count_cells(schema: &StoreSchema, group: &MutationGroup) -> Result<u64> {
    let mut cells = 0u64;
    for mutation in group.mutations() {
        let table = schema.require_table(mutation.table())?;
        match mutation {
            Mutation::Write { columns, .. } => {
                for (name, _) in columns {
                    cells += table.cells_mutated_per_column(name);
                }
            }
            Mutation::Delete { key_set, .. } => {
                cells += key_set.keys.len() as u64 * table.cells_mutated_per_row();
            }
        }
    }
    Ok(cells)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::{KeyRange, KeySet};
    use crate::schema::{ColumnDescriptor, ColumnType, IndexDescriptor, KeyPart, TableDescriptor};

    fn schema() -> StoreSchema {
        StoreSchema::new(vec![TableDescriptor {
            name: "orders".to_string(),
            columns: vec![
                ColumnDescriptor {
                    name: "order_id".to_string(),
                    column_type: ColumnType::Int64,
                    nullable: false,
                },
                ColumnDescriptor {
                    name: "status".to_string(),
                    column_type: ColumnType::Utf8,
                    nullable: true,
                },
            ],
            key_parts: vec![KeyPart {
                column: "order_id".to_string(),
                descending: false,
            }],
            indexes: vec![IndexDescriptor {
                name: "orders_by_status".to_string(),
                columns: vec!["status".to_string()],
            }],
        }])
        .unwrap()
    }

    #[test]
    fn write_size_sums_value_payloads() {
        let group = MutationGroup::new(Mutation::insert(
            "orders",
            vec![
                ("order_id".to_string(), Value::Int64(1)),
                ("status".to_string(), Value::Utf8("open".to_string())),
            ],
        ));
        assert_eq!(estimated_size(&group), 8 + 4);
    }

    #[test]
    fn delete_size_sums_key_payloads() {
        let group = MutationGroup::new(Mutation::delete(
            "orders",
            KeySet {
                keys: vec![vec![Value::Int64(1)]],
                ranges: vec![KeyRange {
                    start: vec![Value::Int64(0)],
                    end: vec![Value::Int64(9)],
                    start_closed: true,
                    end_closed: false,
                }],
            },
        ));
        assert_eq!(estimated_size(&group), 8 + 16);
    }

    #[test]
    fn write_cells_include_index_fanout() {
        let schema = schema();
        let group = MutationGroup::new(Mutation::insert(
            "orders",
            vec![
                ("order_id".to_string(), Value::Int64(1)),
                ("status".to_string(), Value::Utf8("open".to_string())),
            ],
        ));
        // order_id weighs 1, indexed status weighs 2.
        assert_eq!(count_cells(&schema, &group).unwrap(), 3);
    }

    #[test]
    fn point_delete_charges_full_row_per_key() {
        let schema = schema();
        let group = MutationGroup::new(Mutation::delete(
            "orders",
            KeySet {
                keys: vec![vec![Value::Int64(1)], vec![Value::Int64(2)]],
                ranges: Vec::new(),
            },
        ));
        assert_eq!(count_cells(&schema, &group).unwrap(), 2 * 3);
    }

    #[test]
    fn range_delete_charges_nothing() {
        let schema = schema();
        let group = MutationGroup::new(Mutation::delete(
            "orders",
            KeySet::range(KeyRange {
                start: vec![Value::Int64(0)],
                end: vec![Value::Int64(100)],
                start_closed: true,
                end_closed: false,
            }),
        ));
        assert_eq!(count_cells(&schema, &group).unwrap(), 0);
    }
}
