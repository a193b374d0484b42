//! Partition-id assignment from sampled key boundaries.
//!
//! Partition ids are opaque grouping keys for the shuffle between
//! serialization and batching, not store shards. Keyed groups land in
//! `<table>#<bucket>`; keyless (range or multi-key delete) groups get a
//! fresh unique id so they ride alone through batching and submission.

use uuid::Uuid;

use crate::encoder::SerializedGroup;
use crate::sampler::KeySample;

/// Opaque grouping key produced by [`assign_partition`].
pub type PartitionId = String;

/// Assigns the partition id for one serialized group.
///
/// The bucket is the insertion index of the group's key in the table's
/// ordered boundary list (first boundary >= key), so intra-table key
/// locality survives without a global sort. Deterministic for keyed groups
/// under a fixed sample; keyless groups draw a random unique id every call.
pub fn assign_partition(sample: &KeySample, group: &SerializedGroup) -> PartitionId {
    if group.is_ungroupable() {
        return Uuid::new_v4().to_string();
    }
    let bucket = match sample.boundaries(&group.table) {
        Some(bounds) => match bounds.binary_search_by(|b| b.as_slice().cmp(group.key.as_slice())) {
            Ok(idx) | Err(idx) => idx,
        },
        // A table absent from the sample had no keyed groups when the
        // sample was built; everything collapses into one bucket.
        None => 0,
    };
    format!("{}#{bucket}", group.table)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn sample_with(table: &str, bounds: Vec<Vec<u8>>) -> KeySample {
        let mut map = BTreeMap::new();
        map.insert(table.to_string(), bounds);
        KeySample::from_boundaries(map)
    }

    fn keyed(table: &str, key: &[u8]) -> SerializedGroup {
        SerializedGroup {
            table: table.to_string(),
            key: key.to_vec(),
            payload: vec![0x01],
        }
    }

    fn keyless(table: &str) -> SerializedGroup {
        SerializedGroup {
            table: table.to_string(),
            key: Vec::new(),
            payload: vec![0x01],
        }
    }

    #[test]
    fn keyed_assignment_is_deterministic() {
        let sample = sample_with("orders", vec![vec![0x10], vec![0x20], vec![0x30]]);
        let group = keyed("orders", &[0x15]);
        let first = assign_partition(&sample, &group);
        let second = assign_partition(&sample, &group);
        assert_eq!(first, second);
        assert_eq!(first, "orders#1");
    }

    #[test]
    fn miss_uses_insertion_index() {
        let sample = sample_with("orders", vec![vec![0x10], vec![0x20], vec![0x30]]);
        assert_eq!(assign_partition(&sample, &keyed("orders", &[0x05])), "orders#0");
        assert_eq!(assign_partition(&sample, &keyed("orders", &[0x20])), "orders#1");
        assert_eq!(assign_partition(&sample, &keyed("orders", &[0x2F])), "orders#2");
        assert_eq!(assign_partition(&sample, &keyed("orders", &[0x99])), "orders#3");
    }

    #[test]
    fn unsampled_table_collapses_to_bucket_zero() {
        let sample = sample_with("orders", vec![vec![0x10]]);
        assert_eq!(assign_partition(&sample, &keyed("events", &[0x42])), "events#0");
    }

    #[test]
    fn keyless_groups_are_isolated() {
        let sample = sample_with("orders", vec![vec![0x10]]);
        let a = assign_partition(&sample, &keyless("orders"));
        let b = assign_partition(&sample, &keyless("orders"));
        assert_ne!(a, b);
        assert!(!a.contains('#'));
    }
}
