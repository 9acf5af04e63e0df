//! regsync Worker Binary
//!
//! Single-process driver for the aggregation engines. Messages are published
//! to an in-process queue and drained by a pool of consumers until idle, so
//! continuations and chain hand-offs run in the same process. A chain
//! hand-off is verified by a different consumer picking up the next
//! partition, which is why the pool never runs fewer than two.
//!
//! # Environment Variables
//!
//! - `REGSYNC_DATA_DIR`: local root for the object store (default: ./data)
//! - `REGSYNC_BUCKET`: S3 bucket; when set, the object store is S3 configured
//!   from the standard `AWS_*` variables
//! - `REGSYNC_ROOT`: key prefix inside the object store (default: regsync)
//! - `REGSYNC_AGGREGATE_DB`: SQLite path of the read store
//!   (default: <data dir>/aggregates.db)
//! - `REGSYNC_CONSUMERS`: concurrent queue consumers, at least 2 (default: 2)
//! - `REGSYNC_IDLE_MS`: how long the queue stays empty before the worker
//!   exits (default: 500)
//! - `REGSYNC_*`: engine settings, see `EngineConfig::from_env`
//!
//! # Example
//!
//! ```bash
//! regsync-worker load rows.jsonl
//! regsync-worker schedule --job rebuild --chain
//! regsync-worker sync TX
//! regsync-worker rollup --metrics
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::ObjectStore;
use regsync_core::{PartitionId, SourceRow};
use regsync_engine::{
    ConsumerPool, EngineConfig, EngineContext, InMemoryWorkQueue, ScheduledJob, Scheduler, WorkMessage,
    WorkQueue,
};
use regsync_store::{AggregateStore, ParquetSourceReader, RecentMirror, SqliteAggregateStore};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "regsync-worker")]
#[command(about = "Incremental aggregation worker", long_about = None)]
struct Cli {
    #[arg(long, env = "REGSYNC_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    #[arg(long, env = "REGSYNC_BUCKET")]
    bucket: Option<String>,

    #[arg(long, env = "REGSYNC_ROOT", default_value = "regsync")]
    root: String,

    #[arg(long, env = "REGSYNC_AGGREGATE_DB")]
    aggregate_db: Option<PathBuf>,

    /// Concurrent queue consumers (at least 2)
    #[arg(long, env = "REGSYNC_CONSUMERS", default_value_t = 2)]
    consumers: usize,

    /// Milliseconds the queue must stay empty before exiting
    #[arg(long, env = "REGSYNC_IDLE_MS", default_value_t = 500)]
    idle_ms: u64,

    /// Print Prometheus metrics on exit
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fan out one message per partition, or start a sequential rebuild chain
    Schedule {
        #[arg(long, value_enum)]
        job: JobArg,
        /// Rebuild partitions one after another instead of fanning out
        #[arg(long)]
        chain: bool,
    },
    /// Delta-sync one partition
    Sync { partition: String },
    /// Rebuild one partition from scratch
    Rebuild {
        partition: String,
        #[arg(long)]
        chain: bool,
    },
    /// Recompute the national record
    Rollup,
    /// Append source rows from a JSON-lines file to the lake
    Load { file: PathBuf },
}

#[derive(Clone, Copy, ValueEnum)]
enum JobArg {
    Sync,
    Rebuild,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info".to_string())
        .parse()
        .unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    regsync_observability::init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env().context("invalid engine configuration")?;
    info!(worker_id = %config.worker_id, "regsync worker starting");

    let object_store: Arc<dyn ObjectStore> = match &cli.bucket {
        Some(bucket) => {
            info!(bucket = %bucket, "using S3 object store");
            Arc::new(AmazonS3Builder::from_env().with_bucket_name(bucket).build()?)
        }
        None => {
            std::fs::create_dir_all(&cli.data_dir)
                .with_context(|| format!("creating {}", cli.data_dir.display()))?;
            info!(dir = %cli.data_dir.display(), "using local object store");
            Arc::new(LocalFileSystem::new_with_prefix(&cli.data_dir)?)
        }
    };

    let source = Arc::new(ParquetSourceReader::new(
        object_store.clone(),
        cli.root.clone(),
    ));

    if let Commands::Load { file } = &cli.command {
        let text = std::fs::read_to_string(file)
            .with_context(|| format!("reading {}", file.display()))?;
        let rows = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str::<SourceRow>)
            .collect::<Result<Vec<_>, _>>()
            .context("parsing source rows")?;
        let files = source.write_rows(&rows).await?;
        info!(rows = rows.len(), files, "loaded source rows");
        return finish(cli.metrics);
    }

    let db_path = cli
        .aggregate_db
        .clone()
        .unwrap_or_else(|| cli.data_dir.join("aggregates.db"));
    let sqlite = Arc::new(SqliteAggregateStore::new(&db_path).await?);
    let aggregates: Arc<dyn AggregateStore> = sqlite.clone();
    let mirror: Arc<dyn RecentMirror> = sqlite;
    let queue = Arc::new(InMemoryWorkQueue::new());

    let ctx = EngineContext::new(
        config,
        object_store,
        &cli.root,
        source,
        aggregates,
        mirror,
        queue.clone(),
    );

    match cli.command {
        Commands::Schedule { job, chain } => {
            let scheduler = Scheduler::new(ctx.clone());
            match (job, chain) {
                (JobArg::Rebuild, true) => {
                    scheduler.start_chain().await?;
                }
                (JobArg::Sync, true) => anyhow::bail!("--chain only applies to rebuilds"),
                (JobArg::Sync, false) => {
                    scheduler.fan_out(ScheduledJob::Sync).await?;
                }
                (JobArg::Rebuild, false) => {
                    scheduler.fan_out(ScheduledJob::Rebuild).await?;
                }
            }
        }
        Commands::Sync { partition } => {
            queue
                .publish(&WorkMessage::Sync {
                    partition: PartitionId::new(partition),
                })
                .await?;
        }
        Commands::Rebuild { partition, chain } => {
            queue
                .publish(&WorkMessage::Rebuild {
                    partition: PartitionId::new(partition),
                    chain,
                })
                .await?;
        }
        Commands::Rollup => queue.publish(&WorkMessage::NationalRollup).await?,
        Commands::Load { .. } => {}
    }

    let summary = drain(ctx, cli.consumers, Duration::from_millis(cli.idle_ms)).await?;

    finish(cli.metrics)?;
    if summary.failed > 0 {
        anyhow::bail!("{} messages failed", summary.failed);
    }
    Ok(())
}

async fn drain(ctx: EngineContext, consumers: usize, idle: Duration) -> anyhow::Result<regsync_engine::DrainSummary> {
    let pool = ConsumerPool::new(ctx, consumers);
    info!(consumers = pool.size(), "draining queue");
    let summary = pool.run(idle).await?;
    info!(handled = summary.handled, failed = summary.failed, "queue drained");
    Ok(summary)
}

fn finish(print_metrics: bool) -> anyhow::Result<()> {
    if print_metrics {
        print!("{}", regsync_observability::exporter::render()?);
    }
    Ok(())
}
