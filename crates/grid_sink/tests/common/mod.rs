//! Shared helpers for integration tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use grid_sink::{
    ColumnDescriptor, ColumnType, IndexDescriptor, KeyPart, Mutation, MutationGroup, Result,
    StoreClient, StoreSchema, StoreSession, TableDescriptor, Value, WriteFailure,
};

/// In-memory store recording every committed transaction.
///
/// Transactions touching a rejected id fail with a duplicate-key error,
/// which lets tests script both whole-batch and per-group failures.
pub struct MemoryStore {
    transactions: Mutex<Vec<Vec<Mutation>>>,
    rejected_ids: HashSet<i64>,
    connects: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Self::rejecting(HashSet::new())
    }

    pub fn rejecting(rejected_ids: HashSet<i64>) -> Arc<Self> {
        Arc::new(Self {
            transactions: Mutex::new(Vec::new()),
            rejected_ids,
            connects: AtomicU64::new(0),
        })
    }

    /// Snapshot of committed transactions in commit order.
    pub fn transactions(&self) -> Vec<Vec<Mutation>> {
        self.transactions.lock().unwrap().clone()
    }

    /// Number of sessions opened against this store.
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    fn touches_rejected_id(&self, mutation: &Mutation) -> bool {
        match mutation {
            Mutation::Write { columns, .. } => columns
                .iter()
                .any(|(name, value)| name == "id" && self.is_rejected(value)),
            Mutation::Delete { key_set, .. } => key_set
                .keys
                .iter()
                .any(|key| key.first().is_some_and(|value| self.is_rejected(value))),
        }
    }

    fn is_rejected(&self, value: &Value) -> bool {
        matches!(value, Value::Int64(id) if self.rejected_ids.contains(id))
    }
}

/// Client handle cloning the shared store into each session.
pub struct MemoryClient {
    pub store: Arc<MemoryStore>,
}

struct MemorySession {
    store: Arc<MemoryStore>,
}

#[async_trait]
impl StoreClient for MemoryClient {
    async fn connect(&self) -> Result<Box<dyn StoreSession>> {
        self.store.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            store: self.store.clone(),
        }))
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn write_at_least_once(
        &self,
        mutations: &[Mutation],
    ) -> std::result::Result<(), WriteFailure> {
        if mutations.iter().any(|m| self.store.touches_rejected_id(m)) {
            return Err(WriteFailure::new(
                "duplicate key value violates unique constraint 'items_pkey'",
                false,
            ));
        }
        self.store
            .transactions
            .lock()
            .unwrap()
            .push(mutations.to_vec());
        Ok(())
    }
}

/// Single-table schema used by most scenarios: `items(id, payload)` with a
/// secondary index over `payload`.
pub fn items_schema() -> Arc<StoreSchema> {
    Arc::new(
        StoreSchema::new(vec![TableDescriptor {
            name: "items".to_string(),
            columns: vec![
                ColumnDescriptor {
                    name: "id".to_string(),
                    column_type: ColumnType::Int64,
                    nullable: false,
                },
                ColumnDescriptor {
                    name: "payload".to_string(),
                    column_type: ColumnType::Bytes,
                    nullable: true,
                },
            ],
            key_parts: vec![KeyPart {
                column: "id".to_string(),
                descending: false,
            }],
            indexes: vec![IndexDescriptor {
                name: "items_by_payload".to_string(),
                columns: vec!["payload".to_string()],
            }],
        }])
        .expect("items schema is valid"),
    )
}

/// Insert group with a payload sized so the group estimates to
/// `8 + payload_bytes` bytes.
pub fn item_group(id: i64, payload_bytes: usize) -> MutationGroup {
    MutationGroup::new(Mutation::insert(
        "items",
        vec![
            ("id".to_string(), Value::Int64(id)),
            ("payload".to_string(), Value::Bytes(vec![0x42; payload_bytes])),
        ],
    ))
}

/// Extracts the `id` values written by one transaction, in order.
pub fn written_ids(transaction: &[Mutation]) -> Vec<i64> {
    transaction
        .iter()
        .filter_map(|mutation| match mutation {
            Mutation::Write { columns, .. } => columns.iter().find_map(|(name, value)| {
                match (name.as_str(), value) {
                    ("id", Value::Int64(id)) => Some(*id),
                    _ => None,
                }
            }),
            Mutation::Delete { .. } => None,
        })
        .collect()
}
