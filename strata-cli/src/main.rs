//! Strata maintenance CLI
//!
//! Runs rollup or merge over a whole tree, or over a single metric.
//!
//! Usage:
//!   strata-maint --root /var/lib/strata rollup
//!   strata-maint --root /var/lib/strata --metric servers.web01.cpu merge

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use strata_core::lock::RunLock;
use strata_core::tree::Tree;
use strata_core::{merge_node, rollup_node, run_batch, MaintenanceConfig, Operation, Timestamp};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Strata maintenance - rollup and merge for time-series slice trees
#[derive(Parser, Debug)]
#[command(name = "strata-maint", author, version, about)]
struct Args {
    /// Root of the storage tree
    #[arg(long, env = "STRATA_ROOT", default_value = ".")]
    root: PathBuf,

    /// Run lock file (overrides config)
    #[arg(long)]
    lock: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Worker pool size (overrides config)
    #[arg(long)]
    workers: Option<usize>,

    /// Process a single metric, by filesystem or dotted path
    #[arg(long)]
    metric: Option<String>,

    /// Reference time in Unix seconds (default: now)
    #[arg(long)]
    as_of: Option<Timestamp>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Roll aged-out points into coarser precisions
    Rollup,
    /// Defragment slices of each precision
    Merge,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

fn init_logging(debug: bool, format: LogFormat) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(debug);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(args: &Args) -> Result<MaintenanceConfig> {
    let mut config = match &args.config {
        Some(path) => MaintenanceConfig::from_file(path)?,
        None => MaintenanceConfig::default(),
    };
    if let Some(lock) = &args.lock {
        config.lock_path = lock.clone();
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug, args.log_format);

    let config = load_config(&args).context("invalid configuration")?;
    let tree = Tree::open(&args.root).with_context(|| format!("cannot open tree at {:?}", args.root))?;
    let as_of = args.as_of.unwrap_or_else(|| chrono::Utc::now().timestamp());
    let op = match args.command {
        Command::Rollup => Operation::Rollup { as_of },
        Command::Merge => Operation::Merge,
    };

    info!("Strata maintenance v{} starting", strata_core::VERSION);
    info!("Tree: {:?}", tree.root());

    let lock_path = config.lock_path.clone();
    let timeout = config.lock_timeout();
    let _lock = tokio::task::spawn_blocking(move || RunLock::acquire(lock_path, timeout))
        .await
        .context("lock task failed")?
        .context("another maintenance run holds the lock")?;

    if let Some(metric) = &args.metric {
        let result = match op {
            Operation::Rollup { as_of } => rollup_node(metric, tree.root(), as_of, &config).map(|r| r.node),
            Operation::Merge => merge_node(metric, tree.root(), &config).map(|r| r.node),
        };
        match result {
            Ok(node) => info!("{} done", node),
            Err(e) if e.is_run_fatal() => return Err(e.into()),
            Err(e) => error!("{} failed: {}", metric, e),
        }
        return Ok(());
    }

    let nodes = tree.nodes().context("node discovery failed")?;
    let store = Arc::new(tree.store(config.max_slice_gap));
    let summary = run_batch(store, nodes, op, Arc::new(config)).await;
    info!(
        "{} nodes found, {} succeeded, {} failed, {:.3}s",
        summary.found,
        summary.succeeded,
        summary.failed,
        summary.elapsed.as_secs_f64()
    );
    Ok(())
}
