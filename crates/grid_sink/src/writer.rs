//! Batch submission against the store with a partial-failure policy.
//!
//! A writer owns one live store session for its whole lifetime; the
//! session is released when the writer drops, on every exit path. The
//! happy path submits a whole batch as a single at-least-once transaction.
//! Because the store offers no rollback, a failed batch is either fatal
//! (`FailFast`) or decomposed into per-group transactions whose individual
//! failures land on a side channel (`ReportFailures`).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::batcher::Batch;
use crate::cost::{count_cells, estimated_size};
use crate::encoder::encode_key;
use crate::error::{is_duplicate_key_violation_message, Result, SinkError, WriteFailure};
use crate::metrics::SinkMetrics;
use crate::mutation::{Mutation, MutationGroup};
use crate::schema::StoreSchema;
use crate::FailureMode;

/// Factory for live store sessions.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Opens a session. Each writer instance connects exactly once and
    /// holds the session until it is dropped.
    async fn connect(&self) -> Result<Box<dyn StoreSession>>;
}

/// One live connection to the store.
#[async_trait]
pub trait StoreSession: Send + Sync {
    /// Submits all mutations as one transaction attempt.
    ///
    /// Semantics are at-least-once: an error may mean the write already
    /// applied, and no reconciliation is performed here. Deadlines and
    /// cancellation are the session's own concern.
    async fn write_at_least_once(
        &self,
        mutations: &[Mutation],
    ) -> std::result::Result<(), WriteFailure>;
}

/// Result of writing one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Groups that committed, in the batch transaction or individually.
    pub groups_written: u64,
    /// Groups reported on the failed side output.
    pub groups_failed: u64,
    /// Transactions that committed while handling this batch.
    pub transactions_committed: u64,
}

/// Pure policy decision applied after a failed whole-batch attempt.
fn degrade_to_per_group(mode: FailureMode) -> bool {
    matches!(mode, FailureMode::ReportFailures)
}

/// Submits batches for one partition over a single store session.
pub struct BatchWriter {
    session: Box<dyn StoreSession>,
    schema: Arc<StoreSchema>,
    failure_mode: FailureMode,
    metrics: Arc<SinkMetrics>,
    failed_tx: mpsc::UnboundedSender<MutationGroup>,
}

impl BatchWriter {
    /// Connects one session up front; the session lives as long as the
    /// writer and is released on drop.
    pub async fn connect(
        client: &dyn StoreClient,
        schema: Arc<StoreSchema>,
        failure_mode: FailureMode,
        metrics: Arc<SinkMetrics>,
        failed_tx: mpsc::UnboundedSender<MutationGroup>,
    ) -> Result<Self> {
        let session = client.connect().await?;
        Ok(Self {
            session,
            schema,
            failure_mode,
            metrics,
            failed_tx,
        })
    }

    /// Writes one batch.
    ///
    /// The whole batch commits as one transaction on success, so unrelated
    /// groups share fate on that attempt. That co-commit is an
    /// implementation artifact of batching, not a guarantee; only
    /// within-group atomicity is promised, and under `ReportFailures` a
    /// failed batch is decomposed into per-group transactions.
    pub async fn write_batch(&self, batch: Batch) -> Result<BatchOutcome> {
        let mutations: Vec<Mutation> = batch
            .groups
            .iter()
            .flat_map(|group| group.mutations().iter().cloned())
            .collect();

        self.metrics.record_batch_write_attempt();
        match self.session.write_at_least_once(&mutations).await {
            Ok(()) => {
                self.metrics.record_submitted(batch.size_bytes, batch.cell_count);
                debug!(
                    groups = batch.groups.len(),
                    bytes = batch.size_bytes,
                    cells = batch.cell_count,
                    "batch committed"
                );
                Ok(BatchOutcome {
                    groups_written: batch.groups.len() as u64,
                    groups_failed: 0,
                    transactions_committed: 1,
                })
            }
            Err(failure) => {
                self.metrics.record_batch_write_failure();
                if !degrade_to_per_group(self.failure_mode) {
                    error!(
                        groups = batch.groups.len(),
                        error = %failure,
                        "batch write failed; failing fast"
                    );
                    return Err(SinkError::Write(failure));
                }
                warn!(
                    groups = batch.groups.len(),
                    error = %failure,
                    "batch write failed; retrying groups individually"
                );
                self.write_groups_individually(batch.groups).await
            }
        }
    }

    /// Degraded path: one transaction per group; failures are logged with
    /// table and key context and reported on the side channel.
    async fn write_groups_individually(&self, groups: Vec<MutationGroup>) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        for group in groups {
            self.metrics.record_group_write_attempt();
            match self.session.write_at_least_once(group.mutations()).await {
                Ok(()) => {
                    let cells = count_cells(&self.schema, &group)?;
                    self.metrics.record_submitted(estimated_size(&group), cells);
                    outcome.groups_written += 1;
                    outcome.transactions_committed += 1;
                }
                Err(failure) => {
                    self.metrics.record_group_write_failure();
                    self.metrics.record_group_failed();
                    let primary = group.primary();
                    warn!(
                        table = primary.table(),
                        op = primary.op_label(),
                        key = %self.group_key_context(&group),
                        duplicate_key = is_duplicate_key_violation_message(&failure.message),
                        retryable = failure.retryable,
                        error = %failure,
                        "mutation group write failed; emitting on failed side output"
                    );
                    outcome.groups_failed += 1;
                    if self.failed_tx.send(group).is_err() {
                        // Receiver gone means nobody can observe the failure.
                        return Err(SinkError::Task(
                            "failed-group side channel is closed".to_string(),
                        ));
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Key context for failure logs, enabling manual replay.
    fn group_key_context(&self, group: &MutationGroup) -> String {
        match encode_key(&self.schema, group.primary()) {
            Ok(Some(key)) => hex::encode(key),
            Ok(None) => "unkeyed".to_string(),
            Err(_) => "unavailable".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::mutation::Value;
    use crate::schema::{ColumnDescriptor, ColumnType, KeyPart, TableDescriptor};

    fn schema() -> Arc<StoreSchema> {
        Arc::new(
            StoreSchema::new(vec![TableDescriptor {
                name: "orders".to_string(),
                columns: vec![ColumnDescriptor {
                    name: "id".to_string(),
                    column_type: ColumnType::Int64,
                    nullable: false,
                }],
                key_parts: vec![KeyPart {
                    column: "id".to_string(),
                    descending: false,
                }],
                indexes: Vec::new(),
            }])
            .unwrap(),
        )
    }

    fn group(id: i64) -> MutationGroup {
        MutationGroup::new(Mutation::insert(
            "orders",
            vec![("id".to_string(), Value::Int64(id))],
        ))
    }

    fn batch_of(groups: Vec<MutationGroup>) -> Batch {
        Batch {
            size_bytes: groups.len() as u64 * 8,
            cell_count: groups.len() as u64,
            groups,
        }
    }

    /// Session rejecting any transaction that touches a poison id.
    struct PoisonedSession {
        poison: i64,
    }

    #[async_trait]
    impl StoreSession for PoisonedSession {
        async fn write_at_least_once(
            &self,
            mutations: &[Mutation],
        ) -> std::result::Result<(), WriteFailure> {
            let poisoned = mutations.iter().any(|m| match m {
                Mutation::Write { columns, .. } => {
                    columns.iter().any(|(_, v)| *v == Value::Int64(self.poison))
                }
                Mutation::Delete { .. } => false,
            });
            if poisoned {
                return Err(WriteFailure::new(
                    "duplicate key value violates unique constraint 'orders_pkey'",
                    false,
                ));
            }
            Ok(())
        }
    }

    struct PoisonedClient {
        poison: i64,
        connects: AtomicU64,
    }

    #[async_trait]
    impl StoreClient for PoisonedClient {
        async fn connect(&self) -> Result<Box<dyn StoreSession>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(PoisonedSession {
                poison: self.poison,
            }))
        }
    }

    async fn writer_with(
        client: &PoisonedClient,
        mode: FailureMode,
    ) -> (BatchWriter, mpsc::UnboundedReceiver<MutationGroup>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = BatchWriter::connect(
            client,
            schema(),
            mode,
            Arc::new(SinkMetrics::default()),
            tx,
        )
        .await
        .unwrap();
        (writer, rx)
    }

    #[tokio::test]
    async fn clean_batch_commits_as_one_transaction() {
        let client = PoisonedClient {
            poison: -1,
            connects: AtomicU64::new(0),
        };
        let (writer, _rx) = writer_with(&client, FailureMode::FailFast).await;
        let outcome = writer
            .write_batch(batch_of(vec![group(1), group(2), group(3)]))
            .await
            .unwrap();
        assert_eq!(outcome.groups_written, 3);
        assert_eq!(outcome.transactions_committed, 1);
        assert_eq!(outcome.groups_failed, 0);
        assert_eq!(client.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fail_fast_propagates_the_batch_failure() {
        let client = PoisonedClient {
            poison: 2,
            connects: AtomicU64::new(0),
        };
        let (writer, mut rx) = writer_with(&client, FailureMode::FailFast).await;
        let err = writer
            .write_batch(batch_of(vec![group(1), group(2)]))
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Write(_)));
        assert!(rx.try_recv().is_err(), "fail-fast must not emit side output");
    }

    #[tokio::test]
    async fn report_failures_degrades_to_per_group() {
        let client = PoisonedClient {
            poison: 2,
            connects: AtomicU64::new(0),
        };
        let (writer, mut rx) = writer_with(&client, FailureMode::ReportFailures).await;
        let outcome = writer
            .write_batch(batch_of(vec![group(1), group(2), group(3)]))
            .await
            .unwrap();
        assert_eq!(outcome.groups_written, 2);
        assert_eq!(outcome.groups_failed, 1);
        assert_eq!(outcome.transactions_committed, 2);

        let failed = rx.try_recv().unwrap();
        assert_eq!(failed, group(2));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn policy_decision_is_pure() {
        assert!(!degrade_to_per_group(FailureMode::FailFast));
        assert!(degrade_to_per_group(FailureMode::ReportFailures));
    }
}
