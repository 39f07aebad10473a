//! fnqueue CLI: inspect queue kind catalogs and exercise worker pools.

use clap::{Parser, Subcommand};
use fnqueue::config::Config;
use fnqueue::engine::QueueService;
use fnqueue::fanout::FanOut;
use fnqueue::kind::{KindCatalog, KindSpec};
use fnqueue::model::PoolSnapshot;
use fnqueue::telemetry::{TelemetryConfig, init_telemetry};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Parser)]
#[command(name = "fnqueue", about = "Typed in-process work queues")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List queue kinds declared in a catalog directory
    Kinds {
        /// Directory containing kind TOML files (defaults to FNQUEUE_KINDS_DIR)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Push synthetic work through one kind's pool
    Run {
        /// Kind name from the catalog
        #[arg(long)]
        kind: String,
        /// Directory containing kind TOML files (defaults to FNQUEUE_KINDS_DIR)
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Number of items
        #[arg(long, default_value_t = 20)]
        items: usize,
        /// Simulated work per item
        #[arg(long, default_value_t = 250)]
        delay_ms: u64,
        /// Make the item at this index fail
        #[arg(long)]
        fail_at: Option<usize>,
        /// Print pool snapshots as JSON
        #[arg(long)]
        json: bool,
    },
    /// Process synthetic items in fixed-size batches
    Batch {
        /// Number of items
        #[arg(long, default_value_t = 100)]
        items: usize,
        /// Items per batch
        #[arg(long, default_value_t = 10)]
        batch_size: usize,
        /// Simulated work per item
        #[arg(long, default_value_t = 10)]
        delay_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig::from(&config))?;

    match cli.command {
        Command::Kinds { dir } => cmd_kinds(&config, dir),
        Command::Run {
            kind,
            dir,
            items,
            delay_ms,
            fail_at,
            json,
        } => cmd_run(&config, dir, kind, items, delay_ms, fail_at, json).await,
        Command::Batch {
            items,
            batch_size,
            delay_ms,
        } => cmd_batch(&config, items, batch_size, delay_ms).await,
    }
}

fn load_catalog(config: &Config, dir: Option<PathBuf>) -> anyhow::Result<KindCatalog> {
    let dir = dir
        .or_else(|| config.kinds_dir.clone())
        .ok_or_else(|| anyhow::anyhow!("no kinds directory: pass --dir or set FNQUEUE_KINDS_DIR"))?;
    Ok(KindCatalog::load_from_dir(&dir)?)
}

fn cmd_kinds(config: &Config, dir: Option<PathBuf>) -> anyhow::Result<()> {
    let catalog = load_catalog(config, dir)?;
    if catalog.is_empty() {
        println!("No queue kinds found.");
        return Ok(());
    }

    println!("{:<24}  {:<11}  DEDICATED", "KIND", "MAX_WORKERS");
    println!("{}", "-".repeat(48));
    for spec in catalog.iter() {
        println!(
            "{:<24}  {:<11}  {}",
            spec.name,
            spec.max_workers,
            if spec.dedicated_thread { "yes" } else { "no" }
        );
    }
    println!("\n{} kind(s)", catalog.len());
    Ok(())
}

async fn cmd_run(
    config: &Config,
    dir: Option<PathBuf>,
    kind: String,
    items: usize,
    delay_ms: u64,
    fail_at: Option<usize>,
    json: bool,
) -> anyhow::Result<()> {
    let catalog = load_catalog(config, dir)?;
    let spec: KindSpec = catalog
        .get(&kind)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("unknown queue kind '{kind}'"))?;

    let service = QueueService::new(config.service.clone())?;
    let pool = service.pool_for(&spec)?;
    let fan_out = FanOut::from_config(&config.service);
    let delay = Duration::from_millis(delay_ms);
    let started = Instant::now();

    let result = fan_out
        .process_queued(
            &pool,
            0..items,
            |i| async move {
                tokio::time::sleep(delay).await;
                if Some(i) == fail_at {
                    anyhow::bail!("item {i} failed on request");
                }
                Ok(())
            },
            |latch| {
                info!(
                    remaining = latch.current(),
                    total = latch.initial(),
                    active_workers = pool.active_workers(),
                    "progress"
                );
                Ok(())
            },
        )
        .await;

    let elapsed = started.elapsed();
    print_snapshots(&service.snapshots(), json)?;
    service.dispose();

    result?;
    println!("\n{items} item(s) through '{kind}' in {}ms", elapsed.as_millis());
    Ok(())
}

async fn cmd_batch(
    config: &Config,
    items: usize,
    batch_size: usize,
    delay_ms: u64,
) -> anyhow::Result<()> {
    let fan_out = FanOut::from_config(&config.service);
    let delay = Duration::from_millis(delay_ms);
    let started = Instant::now();

    fan_out
        .process_batches(
            0..items,
            batch_size,
            |batch, latch| async move {
                for _ in batch {
                    tokio::time::sleep(delay).await;
                    latch.signal()?;
                }
                Ok::<(), anyhow::Error>(())
            },
            |latch| {
                info!(remaining = latch.current(), total = latch.initial(), "progress");
                Ok(())
            },
        )
        .await?;

    println!(
        "{items} item(s) in batches of {batch_size} in {}ms",
        started.elapsed().as_millis()
    );
    Ok(())
}

fn print_snapshots(snapshots: &[PoolSnapshot], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(snapshots)?);
        return Ok(());
    }
    println!(
        "{:<24}  {:<6}  {:<6}  {:<6}  DEDICATED",
        "KIND", "MAX", "ACTIVE", "QUEUED"
    );
    println!("{}", "-".repeat(60));
    for snap in snapshots {
        println!(
            "{:<24}  {:<6}  {:<6}  {:<6}  {}",
            snap.kind,
            snap.max_workers,
            snap.active_workers,
            snap.queued,
            if snap.dedicated_thread { "yes" } else { "no" }
        );
    }
    Ok(())
}
