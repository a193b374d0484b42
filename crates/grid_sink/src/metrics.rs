//! In-process counters for sink pipeline behavior.
//!
//! Counters are lock-free so hot stages can update them without
//! coordination; readers take an immutable snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregated counters across one or more pipeline runs.
#[derive(Debug, Default)]
pub struct SinkMetrics {
    /// Mutation groups serialized into pipeline wire form.
    groups_serialized: AtomicU64,
    /// Keys fed to the boundary sampler.
    keys_sampled: AtomicU64,
    /// Distinct partitions produced by assignment.
    partitions_created: AtomicU64,
    /// Keyless groups isolated into unique partitions.
    unbatchable_groups: AtomicU64,
    /// Batches emitted by the bin-packer.
    batches_emitted: AtomicU64,
    /// Batches emitted above a cap (single oversized group).
    oversize_batches: AtomicU64,
    /// Whole-batch transaction attempts.
    batch_write_attempts: AtomicU64,
    /// Whole-batch transaction failures.
    batch_write_failures: AtomicU64,
    /// Per-group transaction attempts after degradation.
    group_write_attempts: AtomicU64,
    /// Per-group transaction failures.
    group_write_failures: AtomicU64,
    /// Groups reported on the failed side output.
    groups_failed: AtomicU64,
    /// Estimated bytes submitted in committed transactions.
    bytes_submitted: AtomicU64,
    /// Estimated cells submitted in committed transactions.
    cells_submitted: AtomicU64,
}

/// Immutable snapshot view of [`SinkMetrics`].
#[derive(Debug, Clone, Copy)]
pub struct SinkMetricsSnapshot {
    pub groups_serialized: u64,
    pub keys_sampled: u64,
    pub partitions_created: u64,
    pub unbatchable_groups: u64,
    pub batches_emitted: u64,
    pub oversize_batches: u64,
    pub batch_write_attempts: u64,
    pub batch_write_failures: u64,
    pub group_write_attempts: u64,
    pub group_write_failures: u64,
    pub groups_failed: u64,
    pub bytes_submitted: u64,
    pub cells_submitted: u64,
}

impl SinkMetrics {
    pub fn record_group_serialized(&self) {
        self.groups_serialized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_key_sampled(&self) {
        self.keys_sampled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_partitions_created(&self, count: u64) {
        self.partitions_created.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_unbatchable_group(&self) {
        self.unbatchable_groups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_emitted(&self, oversize: bool) {
        self.batches_emitted.fetch_add(1, Ordering::Relaxed);
        if oversize {
            self.oversize_batches.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_batch_write_attempt(&self) {
        self.batch_write_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_write_failure(&self) {
        self.batch_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_group_write_attempt(&self) {
        self.group_write_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_group_write_failure(&self) {
        self.group_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_group_failed(&self) {
        self.groups_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_submitted(&self, bytes: u64, cells: u64) {
        self.bytes_submitted.fetch_add(bytes, Ordering::Relaxed);
        self.cells_submitted.fetch_add(cells, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SinkMetricsSnapshot {
        SinkMetricsSnapshot {
            groups_serialized: self.groups_serialized.load(Ordering::Relaxed),
            keys_sampled: self.keys_sampled.load(Ordering::Relaxed),
            partitions_created: self.partitions_created.load(Ordering::Relaxed),
            unbatchable_groups: self.unbatchable_groups.load(Ordering::Relaxed),
            batches_emitted: self.batches_emitted.load(Ordering::Relaxed),
            oversize_batches: self.oversize_batches.load(Ordering::Relaxed),
            batch_write_attempts: self.batch_write_attempts.load(Ordering::Relaxed),
            batch_write_failures: self.batch_write_failures.load(Ordering::Relaxed),
            group_write_attempts: self.group_write_attempts.load(Ordering::Relaxed),
            group_write_failures: self.group_write_failures.load(Ordering::Relaxed),
            groups_failed: self.groups_failed.load(Ordering::Relaxed),
            bytes_submitted: self.bytes_submitted.load(Ordering::Relaxed),
            cells_submitted: self.cells_submitted.load(Ordering::Relaxed),
        }
    }

    /// Renders counters as `name=value` lines for logs and the workload
    /// binary's final report.
    pub fn render_text(&self) -> String {
        let s = self.snapshot();
        format!(
            "sink_groups_serialized={}\nsink_keys_sampled={}\nsink_partitions_created={}\nsink_unbatchable_groups={}\nsink_batches_emitted={}\nsink_oversize_batches={}\nsink_batch_write_attempts={}\nsink_batch_write_failures={}\nsink_group_write_attempts={}\nsink_group_write_failures={}\nsink_groups_failed={}\nsink_bytes_submitted={}\nsink_cells_submitted={}\n",
            s.groups_serialized,
            s.keys_sampled,
            s.partitions_created,
            s.unbatchable_groups,
            s.batches_emitted,
            s.oversize_batches,
            s.batch_write_attempts,
            s.batch_write_failures,
            s.group_write_attempts,
            s.group_write_failures,
            s.groups_failed,
            s.bytes_submitted,
            s.cells_submitted,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_counts() {
        let metrics = SinkMetrics::default();
        metrics.record_group_serialized();
        metrics.record_group_serialized();
        metrics.record_key_sampled();
        metrics.record_batch_emitted(true);
        metrics.record_submitted(128, 4);

        let s = metrics.snapshot();
        assert_eq!(s.groups_serialized, 2);
        assert_eq!(s.keys_sampled, 1);
        assert_eq!(s.batches_emitted, 1);
        assert_eq!(s.oversize_batches, 1);
        assert_eq!(s.bytes_submitted, 128);
        assert_eq!(s.cells_submitted, 4);
    }

    #[test]
    fn render_text_is_line_per_counter() {
        let metrics = SinkMetrics::default();
        metrics.record_batch_write_attempt();
        let text = metrics.render_text();
        assert!(text.contains("sink_batch_write_attempts=1\n"));
        assert_eq!(text.lines().count(), 13);
    }
}
