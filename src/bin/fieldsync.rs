use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use fieldsync::{
    DrainOutcome, LocalQueue, LocalQueueOptions, PgRemoteStore, SyncConfig, Synchronizer,
    notify::Notifier,
    schema::{SchemaManager, SchemaPlan},
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "fieldsync", version, about = "Inspect and drain a fieldsync queue")]
struct Cli {
    /// SQLite file holding the pending-mutation queue.
    #[arg(long, env = "FIELDSYNC_QUEUE", default_value = "fieldsync-queue.db")]
    queue: PathBuf,

    /// Postgres connection string for the remote document table. Falls back to DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,

    /// Schema holding the remote document table.
    #[arg(long, default_value = "public")]
    schema: String,

    #[arg(long, default_value = fieldsync::schema::DEFAULT_REMOTE_TABLE)]
    table: String,

    /// Per-call timeout for remote operations, in seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List pending mutations
    Status,

    /// Apply pending mutations to the remote table once
    Drain,

    /// Drop every pending mutation (recovery only)
    Clear,

    /// Show planned DDL for the remote table without applying
    SchemaPlan,

    /// Create the remote table and indexes as needed
    SchemaSync,

    /// Drain once, then print counters in Prometheus text format
    Metrics,
}

#[tokio::main]
async fn main() -> fieldsync::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let queue = open_queue(&cli.queue).await?;
            let pending = queue.get_all().await?;
            if pending.is_empty() {
                println!("No pending mutations.");
            } else {
                println!("Pending mutations ({}):", pending.len());
                for m in pending {
                    let error = m.last_error.as_deref().unwrap_or("-");
                    println!(
                        "{:>5}  {:<6} {}/{}  retries={} last_error={}",
                        m.seq, m.action, m.collection, m.id, m.retry_count, error
                    );
                }
            }
        }
        Commands::Clear => {
            let queue = open_queue(&cli.queue).await?;
            let removed = queue.clear().await?;
            println!("Removed {removed} pending mutation(s).");
        }
        Commands::SchemaPlan => {
            let mgr = schema_manager(&cli).await?;
            print_plan(&mgr.plan().await?);
        }
        Commands::SchemaSync => {
            let mgr = schema_manager(&cli).await?;
            let plan = mgr.sync().await?;
            if plan.is_empty() {
                println!("No changes needed.");
            } else {
                println!("Applied changes:");
                print_plan(&plan);
            }
        }
        Commands::Drain | Commands::Metrics => {
            let queue = open_queue(&cli.queue).await?;
            let url = database_url(&cli);
            let remote = PgRemoteStore::connect(&url)
                .await?
                .with_table(&cli.schema, &cli.table);
            let config = SyncConfig {
                remote_timeout: cli.timeout_secs.map(Duration::from_secs),
                ..SyncConfig::default()
            };
            let sync = Synchronizer::new(queue, Arc::new(remote), config);
            let outcome = sync.drain().await?;

            if matches!(cli.command, Commands::Metrics) {
                print!("{}", fieldsync::metrics::render_prometheus());
            } else if let DrainOutcome::Completed(report) = outcome {
                println!(
                    "Applied {}, failed {}, skipped {}, dropped {}.",
                    report.success_count,
                    report.failure_count,
                    report.skipped_count,
                    report.dropped_count
                );
            }
        }
    }

    Ok(())
}

async fn open_queue(path: &Path) -> fieldsync::Result<LocalQueue> {
    LocalQueue::connect(LocalQueueOptions::file(path), Notifier::default()).await
}

fn database_url(cli: &Cli) -> String {
    match cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok())
    {
        Some(u) => u,
        None => {
            eprintln!("error: --database-url or env DATABASE_URL is required");
            std::process::exit(2);
        }
    }
}

async fn schema_manager(cli: &Cli) -> fieldsync::Result<SchemaManager> {
    let pool = sqlx::PgPool::connect(&database_url(cli)).await?;
    Ok(SchemaManager::new(pool)
        .with_schema(&cli.schema)
        .with_table(&cli.table))
}

fn print_plan(plan: &SchemaPlan) {
    if plan.actions().is_empty() {
        println!("No pending DDL actions.");
        return;
    }

    println!("DDL actions ({}):", plan.actions().len());
    for (i, action) in plan.actions().iter().enumerate() {
        println!("{}. {}", i + 1, action.description());
        println!("{}\n", action.sql());
    }
}
