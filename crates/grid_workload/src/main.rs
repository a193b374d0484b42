//! Workload generator for exercising the grid_sink write pipeline.
//!
//! This binary builds a synthetic schema, generates a seeded stream of
//! mutation groups, drives the batching pipeline against an in-memory
//! store with injectable transaction failures, and prints the run summary
//! plus sink counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use grid_sink::{
    write_grouped, ColumnDescriptor, ColumnType, FailureMode, IndexDescriptor, KeyPart, KeyRange,
    KeySet, Mutation, MutationGroup, SinkConfig, SinkMetrics, StoreClient, StoreSchema,
    StoreSession, TableDescriptor, Value, WriteFailure,
};
use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "grid-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Number of tables in the generated schema.
    #[arg(long, default_value_t = 2)]
    tables: usize,

    /// Number of mutation groups to generate.
    #[arg(long, default_value_t = 10_000)]
    groups: usize,

    /// Payload bytes per generated row.
    #[arg(long, default_value_t = 64)]
    value_bytes: usize,

    /// Percent of groups that are point deletes.
    #[arg(long, default_value_t = 5)]
    delete_pct: u8,

    /// Percent of groups that are range deletes (isolated by the sink).
    #[arg(long, default_value_t = 1)]
    range_delete_pct: u8,

    /// Percent of store transactions that fail with an injected error.
    #[arg(long, default_value_t = 0)]
    fail_pct: u8,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Failure handling mode (`fail_fast` or `report_failures`).
    #[arg(long, default_value = "fail_fast")]
    failure_mode: String,

    /// Transaction payload cap in bytes.
    #[arg(long, default_value_t = 1024 * 1024)]
    batch_size_bytes: u64,

    /// Transaction mutated-cell cap.
    #[arg(long, default_value_t = 5_000)]
    max_cells_per_batch: u64,

    /// Boundary keys sampled per table.
    #[arg(long, default_value_t = 1_000)]
    num_samples: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("grid_sink=info,grid_workload=info")),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(run) => run_workload(run).await,
    }
}

async fn run_workload(args: RunArgs) -> Result<()> {
    let seed = if args.seed == 0 {
        rand::random()
    } else {
        args.seed
    };
    info!(seed, groups = args.groups, tables = args.tables, "generating workload");

    let schema = Arc::new(build_schema(args.tables.max(1))?);
    let mut rng = SmallRng::seed_from_u64(seed);
    let groups = generate_groups(&args, &mut rng);

    let failure_mode: FailureMode = args
        .failure_mode
        .parse()
        .context("parse --failure-mode")?;
    let config = SinkConfig::builder()
        .with_batch_size_bytes(args.batch_size_bytes)
        .with_max_cells_per_batch(args.max_cells_per_batch)
        .with_num_samples(args.num_samples)
        .with_failure_mode(failure_mode)
        .build()
        .context("build sink configuration")?;

    let store = Arc::new(FlakyStore::new(args.fail_pct, seed));
    let client = Arc::new(FlakyClient {
        store: store.clone(),
    });
    let metrics = Arc::new(SinkMetrics::default());

    let started = Instant::now();
    let summary = write_grouped(groups, schema, client, config, metrics.clone())
        .await
        .context("run grid_sink pipeline")?;
    let elapsed = started.elapsed();

    println!("elapsed_ms={}", elapsed.as_millis());
    println!("groups_written={}", summary.groups_written);
    println!("transactions_committed={}", summary.transactions_committed);
    println!("groups_failed={}", summary.failed.len());
    println!("store_transactions={}", store.committed_transactions());
    println!("store_mutations={}", store.committed_mutations());
    print!("{}", metrics.render_text());
    Ok(())
}

/// Builds `table_0..table_n` with an int64 key, a payload column, and a
/// secondary index over the payload.
fn build_schema(tables: usize) -> Result<StoreSchema> {
    let descriptors = (0..tables)
        .map(|idx| TableDescriptor {
            name: format!("table_{idx}"),
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
                ColumnDescriptor {
                    name: "updated_at".to_string(),
                    column_type: ColumnType::TimestampNanos,
                    nullable: false,
                },
            ],
            key_parts: vec![KeyPart {
                column: "id".to_string(),
                descending: false,
            }],
            indexes: vec![IndexDescriptor {
                name: format!("table_{idx}_by_payload"),
                columns: vec!["payload".to_string()],
            }],
        })
        .collect();
    StoreSchema::new(descriptors).context("build workload schema")
}

/// Generates the mutation-group stream according to the CLI mix.
fn generate_groups(args: &RunArgs, rng: &mut SmallRng) -> Vec<MutationGroup> {
    let tables = args.tables.max(1);
    let id_space = (args.groups as i64 * 10).max(1);
    let mut clock_ns: i64 = 1_700_000_000_000_000_000;
    (0..args.groups)
        .map(|_| {
            let table = format!("table_{}", rng.gen_range(0..tables));
            let roll = rng.gen_range(0..100u8);
            clock_ns += rng.gen_range(1..1_000_000);
            if roll < args.range_delete_pct {
                let start = rng.gen_range(0..id_space);
                let end = rng.gen_range(start..=id_space);
                MutationGroup::new(Mutation::delete(
                    table,
                    KeySet::range(KeyRange {
                        start: vec![Value::Int64(start)],
                        end: vec![Value::Int64(end)],
                        start_closed: true,
                        end_closed: false,
                    }),
                ))
            } else if roll < args.range_delete_pct.saturating_add(args.delete_pct) {
                MutationGroup::new(Mutation::point_delete(
                    table,
                    vec![Value::Int64(rng.gen_range(0..id_space))],
                ))
            } else {
                let mut payload = vec![0u8; args.value_bytes];
                rng.fill_bytes(&mut payload);
                MutationGroup::new(Mutation::insert_or_update(
                    table,
                    vec![
                        ("id".to_string(), Value::Int64(rng.gen_range(0..id_space))),
                        ("payload".to_string(), Value::Bytes(payload)),
                        ("updated_at".to_string(), Value::TimestampNanos(clock_ns)),
                    ],
                ))
            }
        })
        .collect()
}

/// In-memory store that fails a configurable fraction of transactions.
struct FlakyStore {
    fail_pct: u8,
    rng: Mutex<SmallRng>,
    transactions: AtomicU64,
    mutations: AtomicU64,
}

impl FlakyStore {
    fn new(fail_pct: u8, seed: u64) -> Self {
        Self {
            fail_pct: fail_pct.min(100),
            rng: Mutex::new(SmallRng::seed_from_u64(seed ^ 0x9E37_79B9_7F4A_7C15)),
            transactions: AtomicU64::new(0),
            mutations: AtomicU64::new(0),
        }
    }

    fn committed_transactions(&self) -> u64 {
        self.transactions.load(Ordering::Relaxed)
    }

    fn committed_mutations(&self) -> u64 {
        self.mutations.load(Ordering::Relaxed)
    }
}

/// Client handle sharing one [`FlakyStore`] across sessions.
struct FlakyClient {
    store: Arc<FlakyStore>,
}

struct FlakySession {
    store: Arc<FlakyStore>,
}

#[async_trait]
impl StoreClient for FlakyClient {
    async fn connect(&self) -> grid_sink::Result<Box<dyn StoreSession>> {
        Ok(Box::new(FlakySession {
            store: self.store.clone(),
        }))
    }
}

#[async_trait]
impl StoreSession for FlakySession {
    async fn write_at_least_once(
        &self,
        mutations: &[Mutation],
    ) -> std::result::Result<(), WriteFailure> {
        let inject = {
            let mut rng = self
                .store
                .rng
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            self.store.fail_pct > 0 && rng.gen_range(0..100u8) < self.store.fail_pct
        };
        if inject {
            return Err(WriteFailure::new("injected transaction failure", true));
        }
        self.store.transactions.fetch_add(1, Ordering::Relaxed);
        self.store
            .mutations
            .fetch_add(mutations.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}
