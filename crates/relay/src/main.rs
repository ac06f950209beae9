//! Outbox relay: drains the Postgres outbox onto Redis Streams.
//!
//! | Command | Description |
//! |---------|-------------|
//! | `astra-relay run` | Apply migrations, then drain the outbox until Ctrl-C |
//! | `astra-relay migrate` | Apply migrations and exit |
//! | `astra-relay redrive --all` / `redrive <id>...` | Move FAILED rows back to PENDING |
//! | `astra-relay stats` | Print outbox row counts per status |
//! | `astra-relay streams` | Print every registered stream name |

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::info;

use astra_events::{AdapterRegistry, EventBus, Registry};
use astra_infra::event_bus::RedisStreamStore;
use astra_infra::outbox::MIGRATOR;
use astra_infra::{AstraConfig, ConfigLoader, OutboxId, OutboxProcessor, OutboxStore, PostgresOutbox};

#[derive(Parser, Debug)]
#[command(name = "astra-relay")]
#[command(about = "Transactional outbox relay for cross-domain events")]
#[command(version)]
struct Cli {
    /// Path to configuration file (default: ./astra.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drain the outbox until interrupted
    Run,
    /// Apply database migrations
    Migrate,
    /// Move FAILED outbox rows back to PENDING
    Redrive {
        /// Redrive every FAILED row
        #[arg(long, conflicts_with = "ids")]
        all: bool,
        /// Outbox row ids
        ids: Vec<OutboxId>,
    },
    /// Print outbox row counts per status
    Stats,
    /// Print every registered stream name
    Streams,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_config_path(path);
    }
    let config = loader.load().context("loading configuration")?;
    astra_observability::init(&config.log);

    match cli.command {
        Command::Run => run(&config).await,
        Command::Migrate => {
            let pool = connect_db(&config).await?;
            MIGRATOR.run(&pool).await.context("applying migrations")?;
            info!("migrations applied");
            Ok(())
        }
        Command::Redrive { all, ids } => {
            if !all && ids.is_empty() {
                bail!("pass --all or at least one outbox id");
            }
            let outbox = PostgresOutbox::new(connect_db(&config).await?);
            let moved = if all {
                outbox.redrive_all_failed().await?
            } else {
                outbox.redrive(&ids).await?
            };
            println!("redrove {moved} row(s)");
            Ok(())
        }
        Command::Stats => {
            let outbox = PostgresOutbox::new(connect_db(&config).await?);
            let stats = outbox.stats().await?;
            println!("pending:   {}", stats.pending);
            println!("published: {}", stats.published);
            println!("failed:    {}", stats.failed);
            Ok(())
        }
        Command::Streams => {
            for stream in Registry::standard().all_streams() {
                println!("{stream}");
            }
            Ok(())
        }
    }
}

async fn connect_db(config: &AstraConfig) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .context("connecting to postgres")
}

async fn run(config: &AstraConfig) -> anyhow::Result<()> {
    let pool = connect_db(config).await?;
    MIGRATOR.run(&pool).await.context("applying migrations")?;

    let registry = Arc::new(Registry::standard());
    let store = RedisStreamStore::new(&config.redis.url)?;
    let bus = Arc::new(EventBus::new(store, registry.clone(), config.redis.bus_config()));
    bus.connect().await.context("connecting to redis")?;

    let adapters = Arc::new(AdapterRegistry::standard(
        registry,
        config.producer.producer_id(),
    ));
    let processor = Arc::new(OutboxProcessor::new(
        PostgresOutbox::new(pool.clone()),
        adapters,
        bus.clone(),
    ));

    let cancel = CancellationToken::new();
    let drain = processor.spawn(
        config.outbox.batch_size,
        config.outbox.interval(),
        cancel.clone(),
    );
    info!(
        producer = %config.producer.producer_id(),
        health = ?bus.health_check().await.status,
        "relay running"
    );

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested");
    cancel.cancel();
    drain.await.context("joining outbox processor")?;

    let metrics = bus.get_metrics();
    info!(
        published = metrics.events_published,
        failed = metrics.events_failed,
        average_latency_ms = metrics.average_latency_ms,
        "relay stopped"
    );
    bus.disconnect().await;
    pool.close().await;
    Ok(())
}
