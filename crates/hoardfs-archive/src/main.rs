#![warn(missing_docs)]

//! `hfsd`: the HoardFS archive daemon.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hoardfs_archive::{
    ArchiveError, DaemonConfig, DataIndex, IndexConnector, IoRegistry, MemoryIndex, SchedulerState,
    UpdateLoop,
};
use hoardfs_sched::{EmptyPool, Pool, WorkerPool};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Command line options.
#[derive(Parser, Debug)]
#[command(name = "hfsd", about = "HoardFS archive daemon", version)]
struct Cli {
    /// Config file (TOML or JSON)
    #[arg(short, long, env = "HFSD_CONFIG")]
    config: Option<PathBuf>,

    /// Data index snapshot, overriding the config
    #[arg(long)]
    index: Option<PathBuf>,

    /// Worker threads, overriding the config
    #[arg(short, long)]
    workers: Option<usize>,

    /// Run a single update pass and wait for its work to finish
    #[arg(long)]
    once: bool,

    /// Run all tasks in the update thread
    #[arg(long)]
    serial: bool,

    /// Initialise active nodes before the first pass
    #[arg(long)]
    init: bool,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => DaemonConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => DaemonConfig::default(),
    };
    if let Some(workers) = cli.workers {
        config.num_workers = workers;
    }
    if cli.index.is_some() {
        config.index_snapshot = cli.index.clone();
    }
    init_logging(config.log_json);
    tracing::info!("hfsd starting");

    let index: Arc<dyn DataIndex> = match &config.index_snapshot {
        Some(path) => Arc::new(
            MemoryIndex::load(path).with_context(|| format!("loading index {}", path.display()))?,
        ),
        None => {
            tracing::warn!("No index snapshot configured; starting with an empty index");
            Arc::new(MemoryIndex::new())
        }
    };

    let state = SchedulerState::new(&config)?;
    let serial = cli.serial || config.num_workers == 0;
    let pool: Arc<dyn Pool> = if serial {
        Arc::new(EmptyPool::new(
            Arc::clone(state.queue()),
            state.abort().clone(),
        ))
    } else {
        Arc::new(WorkerPool::new(
            config.num_workers,
            Arc::clone(state.queue()),
            state.abort().clone(),
            Arc::new(IndexConnector(Arc::clone(&index))),
            config.poll_interval(),
        ))
    };

    let mut updater = UpdateLoop::new(
        Arc::clone(&index),
        Arc::clone(&state),
        IoRegistry::builtin(),
        Arc::clone(&pool),
        serial,
    );
    if cli.init {
        for name in updater.init_nodes()? {
            tracing::warn!("Node {} could not be initialised", name);
        }
    }

    let result = updater.run(config.update_interval(), cli.once);
    state.queue().close();
    pool.shutdown();
    result?;
    tracing::info!("hfsd finished");
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<ArchiveError>() {
                Some(ArchiveError::Aborted(reason)) => tracing::error!("Aborted: {}", reason),
                _ => tracing::error!("{:#}", err),
            }
            eprintln!("hfsd: {:#}", err);
            ExitCode::FAILURE
        }
    }
}
