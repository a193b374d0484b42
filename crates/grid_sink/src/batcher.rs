//! Greedy bin-packing of one partition's mutation groups into
//! transaction-sized batches.
//!
//! Batching is strictly sequential within a partition; the caller runs
//! partitions in parallel. Groups are decoded here (they arrive in wire
//! form from the shuffle), costed, and packed in arrival order. A group is
//! never split and never reordered.

use crate::cost::{count_cells, estimated_size};
use crate::encoder::{decode_group, SerializedGroup};
use crate::error::Result;
use crate::mutation::MutationGroup;
use crate::schema::StoreSchema;

/// Byte and cell ceilings for one transaction attempt.
#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    pub max_bytes: u64,
    pub max_cells: u64,
}

/// One transaction-sized unit: ordered mutation groups plus their
/// admission totals.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub groups: Vec<MutationGroup>,
    pub size_bytes: u64,
    pub cell_count: u64,
}

impl Batch {
    /// Whether this batch exceeds either ceiling. Only possible for a
    /// single group too large to fit any batch; such a group is emitted
    /// alone rather than split.
    pub fn is_oversize(&self, limits: BatchLimits) -> bool {
        self.size_bytes > limits.max_bytes || self.cell_count > limits.max_cells
    }

    /// Total mutations across all groups.
    pub fn mutation_count(&self) -> usize {
        self.groups.iter().map(|group| group.len()).sum()
    }
}

/// Packs one partition's serialized groups into batches.
///
/// A group that would push the running batch over either cap closes the
/// batch first; the group then opens the next one. A group that exceeds a
/// cap on its own is emitted as a singleton batch over the cap.
/// Concatenating the emitted batches reproduces the input order exactly.
pub fn pack_groups(
    schema: &StoreSchema,
    serialized: Vec<SerializedGroup>,
    limits: BatchLimits,
) -> Result<Vec<Batch>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut size_bytes = 0u64;
    let mut cell_count = 0u64;

    for wire in serialized {
        let group = decode_group(schema, &wire.payload)?;
        let group_size = estimated_size(&group);
        let group_cells = count_cells(schema, &group)?;

        let overflows = size_bytes.saturating_add(group_size) > limits.max_bytes
            || cell_count.saturating_add(group_cells) > limits.max_cells;
        if overflows && !current.is_empty() {
            batches.push(Batch {
                groups: std::mem::take(&mut current),
                size_bytes,
                cell_count,
            });
            size_bytes = 0;
            cell_count = 0;
        }

        current.push(group);
        size_bytes += group_size;
        cell_count += group_cells;
    }

    if !current.is_empty() {
        batches.push(Batch {
            groups: current,
            size_bytes,
            cell_count,
        });
    }
    Ok(batches)
}
