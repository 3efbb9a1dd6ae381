use std::error::Error;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use shmem::writer::{Producer, WriterConfig};
use shmem::{LogTransfers, ShmemLibError, ShutdownToken, WorkerExit};

#[derive(clap::Parser)]
#[clap(about = "Creates the shared table and fills it from producer threads")]
struct Opts {
    /// Number of producer threads (0 uses the default)
    thread_count: Option<usize>,
    /// Lower bound of the delay between two items, in microseconds
    min_delay_us: Option<u64>,
    /// Upper bound of the delay between two items, in microseconds
    max_delay_us: Option<u64>,
    #[clap(short = 'c', long = "config")]
    config: Option<String>,
    /// Items each thread produces before stopping on its own
    #[clap(long = "max-items")]
    max_items: Option<u64>,
    /// Remove the named shared resources and exit
    #[clap(long)]
    purge: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    shmem::init_tracing();
    let opts: Opts = Opts::parse();
    let mut cfg: WriterConfig = match &opts.config {
        Some(path) => shmem::load_config(path)?,
        None => WriterConfig::default(),
    };
    if let Some(n) = opts.thread_count {
        cfg.workers.thread_count = n;
    }
    if let Some(us) = opts.min_delay_us {
        cfg.workers.min_delay_us = us;
    }
    if let Some(us) = opts.max_delay_us {
        cfg.workers.max_delay_us = us;
    }
    if opts.max_items.is_some() {
        cfg.workers.max_items = opts.max_items;
    }

    if opts.purge {
        shmem::purge(&cfg.shmem.names())?;
        return Ok(());
    }

    let token = ShutdownToken::new();
    token.listen_for_signals()?;
    let producer = match Producer::new(&cfg, &token) {
        Ok(producer) => producer,
        Err(ShmemLibError::Cancelled) => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    run(producer)?;
    Ok(())
}

fn run(producer: Producer) -> Result<(), Box<dyn Error>> {
    let pool = producer.start(Arc::new(LogTransfers))?;
    info!(
        "[producer] running with {} thread(s). Press Ctrl+C to stop.",
        pool.worker_count()
    );
    for report in pool.join() {
        match report.exit {
            WorkerExit::Drained => info!(
                "[producer #{}] stopped after {} item(s)",
                report.worker_id, report.items
            ),
            WorkerExit::Failed(e) => error!("[producer #{}] failed: {}", report.worker_id, e),
        }
    }
    let teardown = producer.close()?;
    info!("[producer] cleaned up ({:?})", teardown);
    Ok(())
}
