//! End-to-end driver wiring the sampler, partitioner, batcher, and writer.
//!
//! Stages communicate through immutable broadcast values (`Arc<StoreSchema>`,
//! `Arc<KeySample>`); the only synchronization point is the sampling barrier,
//! after which partitions proceed independently. Batching is sequential
//! within a partition and parallel across partitions, bounded by a
//! semaphore.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info};

use crate::batcher::{pack_groups, BatchLimits};
use crate::encoder::{serialize_group, SerializedGroup};
use crate::error::{Result, SinkError};
use crate::metrics::SinkMetrics;
use crate::mutation::{Mutation, MutationGroup};
use crate::partition::{assign_partition, PartitionId};
use crate::sampler::BoundarySampler;
use crate::schema::StoreSchema;
use crate::writer::{BatchWriter, StoreClient};
use crate::SinkConfig;

/// Final accounting for one pipeline run.
#[derive(Debug, Default)]
pub struct WriteSummary {
    /// Groups that committed, in whole-batch or per-group transactions.
    pub groups_written: u64,
    /// Transactions that committed.
    pub transactions_committed: u64,
    /// Side output: groups that failed individually under
    /// `FailureMode::ReportFailures`. Always empty under `FailFast`.
    pub failed: Vec<MutationGroup>,
}

/// Per-partition accounting accumulated into the summary.
#[derive(Debug, Default, Clone, Copy)]
struct PartitionOutcome {
    groups_written: u64,
    transactions_committed: u64,
}

/// Wraps bare mutations into singleton groups and writes them.
pub async fn write_mutations(
    mutations: Vec<Mutation>,
    schema: Arc<StoreSchema>,
    client: Arc<dyn StoreClient>,
    config: SinkConfig,
    metrics: Arc<SinkMetrics>,
) -> Result<WriteSummary> {
    let groups = mutations.into_iter().map(MutationGroup::new).collect();
    write_grouped(groups, schema, client, config, metrics).await
}

/// Runs the full pipeline over an already-grouped mutation stream.
pub async fn write_grouped(
    groups: Vec<MutationGroup>,
    schema: Arc<StoreSchema>,
    client: Arc<dyn StoreClient>,
    config: SinkConfig,
    metrics: Arc<SinkMetrics>,
) -> Result<WriteSummary> {
    info!(
        groups = groups.len(),
        tables = schema.len(),
        failure_mode = ?config.failure_mode(),
        "starting grouped write"
    );

    // Serialize and sample in one pass. The sample publishes only after
    // the entire stream has been observed; partitioning must not start
    // before that barrier.
    let mut sampler = BoundarySampler::new(config.max_sampled_keys());
    let mut serialized = Vec::with_capacity(groups.len());
    for group in &groups {
        let wire = serialize_group(&schema, group)?;
        if !wire.is_ungroupable() {
            metrics.record_key_sampled();
        }
        sampler.observe(&wire.table, &wire.key);
        metrics.record_group_serialized();
        serialized.push(wire);
    }
    let sample = Arc::new(sampler.finish(config.num_samples()));
    debug!(tables = sample.table_count(), "key sample published");

    // Group by partition id, preserving arrival order within a partition.
    let mut partitions: HashMap<PartitionId, Vec<SerializedGroup>> = HashMap::new();
    for wire in serialized {
        if wire.is_ungroupable() {
            metrics.record_unbatchable_group();
        }
        let partition_id = assign_partition(&sample, &wire);
        partitions.entry(partition_id).or_default().push(wire);
    }
    metrics.record_partitions_created(partitions.len() as u64);
    debug!(partitions = partitions.len(), "partition assignment complete");

    // Batch and write each partition independently.
    let limits = BatchLimits {
        max_bytes: config.batch_size_bytes(),
        max_cells: config.max_cells_per_batch(),
    };
    let semaphore = Arc::new(Semaphore::new(config.max_parallel_partitions()));
    let (failed_tx, mut failed_rx) = mpsc::unbounded_channel();
    let mut tasks = Vec::with_capacity(partitions.len());
    for (partition_id, partition_groups) in partitions {
        let schema = schema.clone();
        let client = client.clone();
        let metrics = metrics.clone();
        let failed_tx = failed_tx.clone();
        let semaphore = semaphore.clone();
        let failure_mode = config.failure_mode();
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| SinkError::Task("partition semaphore closed".to_string()))?;
            let batches = pack_groups(&schema, partition_groups, limits)?;
            if batches.is_empty() {
                return Ok(PartitionOutcome::default());
            }
            let writer = BatchWriter::connect(
                client.as_ref(),
                schema,
                failure_mode,
                metrics.clone(),
                failed_tx,
            )
            .await?;
            let mut outcome = PartitionOutcome::default();
            let batch_count = batches.len();
            for batch in batches {
                metrics.record_batch_emitted(batch.is_oversize(limits));
                let batch_outcome = writer.write_batch(batch).await?;
                outcome.groups_written += batch_outcome.groups_written;
                outcome.transactions_committed += batch_outcome.transactions_committed;
            }
            debug!(partition = %partition_id, batches = batch_count, "partition drained");
            Ok::<PartitionOutcome, SinkError>(outcome)
        }));
    }
    drop(failed_tx);

    let mut summary = WriteSummary::default();
    let mut first_error: Option<SinkError> = None;
    for task in tasks {
        if first_error.is_some() {
            task.abort();
            let _ = task.await;
            continue;
        }
        match task.await {
            Ok(Ok(outcome)) => {
                summary.groups_written += outcome.groups_written;
                summary.transactions_committed += outcome.transactions_committed;
            }
            Ok(Err(err)) => first_error = Some(err),
            Err(join_err) => first_error = Some(SinkError::Task(join_err.to_string())),
        }
    }
    if let Some(err) = first_error {
        return Err(err);
    }

    while let Some(group) = failed_rx.recv().await {
        summary.failed.push(group);
    }

    info!(
        groups_written = summary.groups_written,
        transactions_committed = summary.transactions_committed,
        groups_failed = summary.failed.len(),
        "grouped write complete"
    );
    Ok(summary)
}
