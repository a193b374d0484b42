//! Approximate per-table quantile sampling over observed key bytes.
//!
//! The sampler sees every encoded partition key exactly once, retains a
//! bounded subsample per table, and emits ordered boundary keys that the
//! partitioner binary-searches. Publication of the finished [`KeySample`]
//! is the pipeline's synchronization barrier: nothing partitions until the
//! whole key stream has been observed.

use std::collections::BTreeMap;

/// Per-table reservoir with stride-doubling compaction.
///
/// Keys are accepted every `stride` observations. When the retained buffer
/// reaches the cap it is sorted and thinned to every second key and the
/// stride doubles, so memory stays bounded while the subsample remains
/// approximately uniform over the stream.
#[derive(Debug, Default)]
struct TableSampler {
    stride: u64,
    observed: u64,
    retained: Vec<Vec<u8>>,
}

impl TableSampler {
    fn new() -> Self {
        Self {
            stride: 1,
            observed: 0,
            retained: Vec::new(),
        }
    }

    fn observe(&mut self, key: &[u8], cap: usize) {
        if self.observed % self.stride == 0 {
            self.retained.push(key.to_vec());
            if self.retained.len() >= cap {
                self.compact();
            }
        }
        self.observed = self.observed.wrapping_add(1);
    }

    fn compact(&mut self) {
        self.retained.sort_unstable();
        let mut keep = false;
        self.retained.retain(|_| {
            keep = !keep;
            keep
        });
        self.stride = self.stride.saturating_mul(2);
    }

    /// Emits `n` ordered boundaries approximating the j/n quantiles of the
    /// retained subsample. Duplicates are legal when the sample is small or
    /// heavily skewed.
    fn boundaries(mut self, n: usize) -> Vec<Vec<u8>> {
        if self.retained.is_empty() || n == 0 {
            return Vec::new();
        }
        self.retained.sort_unstable();
        let last = self.retained.len() - 1;
        (1..=n)
            .map(|j| self.retained[j * last / n].clone())
            .collect()
    }
}

/// Collects keys for every table in one pass over the serialized stream.
#[derive(Debug)]
pub struct BoundarySampler {
    max_retained_keys: usize,
    tables: BTreeMap<String, TableSampler>,
}

impl BoundarySampler {
    /// `max_retained_keys` bounds the in-memory subsample per table.
    pub fn new(max_retained_keys: usize) -> Self {
        Self {
            max_retained_keys: max_retained_keys.max(1),
            tables: BTreeMap::new(),
        }
    }

    /// Feeds one observed key. Empty keys belong to ungroupable deletes,
    /// which never consult boundaries, and are skipped.
    pub fn observe(&mut self, table: &str, key: &[u8]) {
        if key.is_empty() {
            return;
        }
        self.tables
            .entry(table.to_string())
            .or_insert_with(TableSampler::new)
            .observe(key, self.max_retained_keys);
    }

    /// Number of keys currently retained across all tables.
    pub fn retained_len(&self) -> usize {
        self.tables.values().map(|t| t.retained.len()).sum()
    }

    /// Finishes sampling and publishes the immutable boundary map.
    pub fn finish(self, num_samples: usize) -> KeySample {
        let boundaries = self
            .tables
            .into_iter()
            .map(|(table, sampler)| (table, sampler.boundaries(num_samples)))
            .collect();
        KeySample { boundaries }
    }
}

/// Immutable per-table partition boundaries, computed once per run and
/// broadcast read-only to every downstream stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySample {
    boundaries: BTreeMap<String, Vec<Vec<u8>>>,
}

impl KeySample {
    /// Ordered boundary list for `table`, if any keys were observed.
    pub fn boundaries(&self, table: &str) -> Option<&[Vec<u8>]> {
        self.boundaries.get(table).map(|b| b.as_slice())
    }

    /// Number of tables with sampled boundaries.
    pub fn table_count(&self) -> usize {
        self.boundaries.len()
    }

    /// Builds a sample directly from boundary lists. Primarily a test
    /// seam; production samples come from [`BoundarySampler::finish`].
    pub fn from_boundaries(boundaries: BTreeMap<String, Vec<Vec<u8>>>) -> Self {
        Self { boundaries }
    }
}
