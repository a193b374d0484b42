//! GridSink: batched mutation writing for a horizontally-partitioned,
//! strongly-consistent transactional store.
//!
//! The store caps every transaction by payload bytes and mutated-cell
//! count, so submitting one transaction per mutation does not scale. This
//! crate forms few, size-bounded transactions instead:
//! - sample the observed key space per table,
//! - range-partition mutation groups against the sample,
//! - greedily bin-pack each partition into capped batches,
//! - submit batches with a configurable partial-failure policy.
//!
//! [`pipeline::write_grouped`] is the composition root; the stages are
//! usable on their own for callers embedding the sink in a larger runner.

use std::str::FromStr;

pub mod batcher;
pub mod cost;
pub mod encoder;
pub mod error;
pub mod metrics;
pub mod mutation;
pub mod partition;
pub mod pipeline;
pub mod sampler;
pub mod schema;
pub mod writer;

pub use batcher::{Batch, BatchLimits};
pub use encoder::SerializedGroup;
pub use error::{is_duplicate_key_violation_message, Result, SinkError, WriteFailure};
pub use metrics::{SinkMetrics, SinkMetricsSnapshot};
pub use mutation::{KeyRange, KeySet, Mutation, MutationGroup, Value, WriteKind};
pub use pipeline::{write_grouped, write_mutations, WriteSummary};
pub use sampler::{BoundarySampler, KeySample};
pub use schema::{
    ColumnDescriptor, ColumnType, IndexDescriptor, KeyPart, StoreSchema, TableDescriptor,
};
pub use writer::{BatchOutcome, BatchWriter, StoreClient, StoreSession};

/// Default transaction payload ceiling (1 MiB).
const DEFAULT_BATCH_SIZE_BYTES: u64 = 1024 * 1024;
/// Default mutated-cell ceiling per transaction.
const DEFAULT_MAX_CELLS_PER_BATCH: u64 = 5_000;
/// Default number of boundary keys sampled per table.
const DEFAULT_NUM_SAMPLES: usize = 1_000;
/// Default cap on keys held in memory per table while sampling.
const DEFAULT_MAX_SAMPLED_KEYS: usize = 1_000_000;

/// Partial-failure policy applied when a whole-batch transaction fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    /// A failed batch fails the run.
    #[default]
    FailFast,
    /// A failed batch degrades to per-group transactions; individually
    /// failed groups are reported on a side output, never dropped.
    ReportFailures,
}

impl FailureMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FailFast => "fail_fast",
            Self::ReportFailures => "report_failures",
        }
    }
}

impl FromStr for FailureMode {
    type Err = SinkError;

    /// Parses the configuration surface spelling, case-insensitively.
    /// Unknown values are a construction-time configuration error.
    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fail_fast" => Ok(Self::FailFast),
            "report_failures" => Ok(Self::ReportFailures),
            _ => Err(SinkError::Config(format!(
                "unknown failure mode '{}'",
                raw.trim()
            ))),
        }
    }
}

/// Immutable sink configuration, validated when built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkConfig {
    batch_size_bytes: u64,
    max_cells_per_batch: u64,
    num_samples: usize,
    max_sampled_keys: usize,
    failure_mode: FailureMode,
    max_parallel_partitions: usize,
}

impl SinkConfig {
    /// Starts a builder preloaded with the defaults.
    pub fn builder() -> SinkConfigBuilder {
        SinkConfigBuilder::default()
    }

    /// Loads configuration from `GRID_SINK_*` environment variables,
    /// falling back to defaults, with the same eager validation as the
    /// builder.
    pub fn from_env() -> Result<Self> {
        let mut builder = Self::builder()
            .with_batch_size_bytes(parse_u64(
                std::env::var("GRID_SINK_BATCH_SIZE_BYTES").ok(),
                DEFAULT_BATCH_SIZE_BYTES,
            )?)
            .with_max_cells_per_batch(parse_u64(
                std::env::var("GRID_SINK_MAX_CELLS_PER_BATCH").ok(),
                DEFAULT_MAX_CELLS_PER_BATCH,
            )?)
            .with_num_samples(parse_usize(
                std::env::var("GRID_SINK_NUM_SAMPLES").ok(),
                DEFAULT_NUM_SAMPLES,
            )?)
            .with_max_sampled_keys(parse_usize(
                std::env::var("GRID_SINK_MAX_SAMPLED_KEYS").ok(),
                DEFAULT_MAX_SAMPLED_KEYS,
            )?);
        if let Ok(raw) = std::env::var("GRID_SINK_FAILURE_MODE") {
            builder = builder.with_failure_mode(raw.parse()?);
        }
        if let Ok(raw) = std::env::var("GRID_SINK_MAX_PARALLEL_PARTITIONS") {
            builder = builder.with_max_parallel_partitions(parse_usize(Some(raw), 0)?);
        }
        builder.build()
    }

    pub fn batch_size_bytes(&self) -> u64 {
        self.batch_size_bytes
    }

    pub fn max_cells_per_batch(&self) -> u64 {
        self.max_cells_per_batch
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn max_sampled_keys(&self) -> usize {
        self.max_sampled_keys
    }

    pub fn failure_mode(&self) -> FailureMode {
        self.failure_mode
    }

    pub fn max_parallel_partitions(&self) -> usize {
        self.max_parallel_partitions
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            batch_size_bytes: DEFAULT_BATCH_SIZE_BYTES,
            max_cells_per_batch: DEFAULT_MAX_CELLS_PER_BATCH,
            num_samples: DEFAULT_NUM_SAMPLES,
            max_sampled_keys: DEFAULT_MAX_SAMPLED_KEYS,
            failure_mode: FailureMode::FailFast,
            max_parallel_partitions: default_parallelism(),
        }
    }
}

/// Fluent builder for [`SinkConfig`]; `build` validates eagerly so an
/// invalid configuration never reaches a running pipeline.
#[derive(Debug, Clone)]
pub struct SinkConfigBuilder {
    config: SinkConfig,
}

impl Default for SinkConfigBuilder {
    fn default() -> Self {
        Self {
            config: SinkConfig::default(),
        }
    }
}

impl SinkConfigBuilder {
    pub fn with_batch_size_bytes(mut self, batch_size_bytes: u64) -> Self {
        self.config.batch_size_bytes = batch_size_bytes;
        self
    }

    pub fn with_max_cells_per_batch(mut self, max_cells_per_batch: u64) -> Self {
        self.config.max_cells_per_batch = max_cells_per_batch;
        self
    }

    pub fn with_num_samples(mut self, num_samples: usize) -> Self {
        self.config.num_samples = num_samples;
        self
    }

    pub fn with_max_sampled_keys(mut self, max_sampled_keys: usize) -> Self {
        self.config.max_sampled_keys = max_sampled_keys;
        self
    }

    pub fn with_failure_mode(mut self, failure_mode: FailureMode) -> Self {
        self.config.failure_mode = failure_mode;
        self
    }

    pub fn with_max_parallel_partitions(mut self, max_parallel_partitions: usize) -> Self {
        self.config.max_parallel_partitions = max_parallel_partitions;
        self
    }

    /// Validates and freezes the configuration.
    pub fn build(self) -> Result<SinkConfig> {
        let config = self.config;
        if config.batch_size_bytes == 0 {
            return Err(SinkError::Config(
                "batch_size_bytes must be greater than zero".to_string(),
            ));
        }
        if config.max_cells_per_batch == 0 {
            return Err(SinkError::Config(
                "max_cells_per_batch must be greater than zero".to_string(),
            ));
        }
        if config.num_samples == 0 {
            return Err(SinkError::Config(
                "num_samples must be greater than zero".to_string(),
            ));
        }
        if config.max_sampled_keys < config.num_samples {
            return Err(SinkError::Config(format!(
                "max_sampled_keys ({}) must be at least num_samples ({})",
                config.max_sampled_keys, config.num_samples
            )));
        }
        if config.max_parallel_partitions == 0 {
            return Err(SinkError::Config(
                "max_parallel_partitions must be greater than zero".to_string(),
            ));
        }
        Ok(config)
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|parallelism| parallelism.get())
        .unwrap_or(4)
        .max(1)
}

/// Parses an optional `u64` with fallback default.
fn parse_u64(value: Option<String>, default_value: u64) -> Result<u64> {
    match value {
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|_| SinkError::Config(format!("invalid u64 value: {raw}"))),
        None => Ok(default_value),
    }
}

/// Parses an optional `usize` with fallback default.
fn parse_usize(value: Option<String>, default_value: usize) -> Result<usize> {
    match value {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| SinkError::Config(format!("invalid usize value: {raw}"))),
        None => Ok(default_value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_store_ceilings() {
        let config = SinkConfig::default();
        assert_eq!(config.batch_size_bytes(), 1024 * 1024);
        assert_eq!(config.max_cells_per_batch(), 5_000);
        assert_eq!(config.num_samples(), 1_000);
        assert_eq!(config.max_sampled_keys(), 1_000_000);
        assert_eq!(config.failure_mode(), FailureMode::FailFast);
        assert!(config.max_parallel_partitions() >= 1);
    }

    #[test]
    fn builder_chains_produce_an_immutable_value() {
        let config = SinkConfig::builder()
            .with_batch_size_bytes(1000)
            .with_max_cells_per_batch(50)
            .with_failure_mode(FailureMode::ReportFailures)
            .build()
            .unwrap();
        assert_eq!(config.batch_size_bytes(), 1000);
        assert_eq!(config.max_cells_per_batch(), 50);
        assert_eq!(config.failure_mode(), FailureMode::ReportFailures);
    }

    #[test]
    fn zero_caps_are_rejected_at_build() {
        assert!(SinkConfig::builder()
            .with_batch_size_bytes(0)
            .build()
            .is_err());
        assert!(SinkConfig::builder()
            .with_max_cells_per_batch(0)
            .build()
            .is_err());
        assert!(SinkConfig::builder().with_num_samples(0).build().is_err());
        assert!(SinkConfig::builder()
            .with_max_parallel_partitions(0)
            .build()
            .is_err());
    }

    #[test]
    fn sample_cap_must_cover_sample_count() {
        let err = SinkConfig::builder()
            .with_num_samples(100)
            .with_max_sampled_keys(10)
            .build()
            .unwrap_err();
        assert!(matches!(err, SinkError::Config(_)));
    }

    #[test]
    fn failure_mode_parses_known_spellings() {
        assert_eq!(
            "fail_fast".parse::<FailureMode>().unwrap(),
            FailureMode::FailFast
        );
        assert_eq!(
            "FAIL-FAST".parse::<FailureMode>().unwrap(),
            FailureMode::FailFast
        );
        assert_eq!(
            " report_failures ".parse::<FailureMode>().unwrap(),
            FailureMode::ReportFailures
        );
    }

    #[test]
    fn unknown_failure_mode_is_a_construction_error() {
        let err = "retry_forever".parse::<FailureMode>().unwrap_err();
        assert!(matches!(err, SinkError::Config(_)));
        assert!(err.to_string().contains("retry_forever"));
    }
}
