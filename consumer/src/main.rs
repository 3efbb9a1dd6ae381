use std::error::Error;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use shmem::reader::{Consumer, ReaderConfig};
use shmem::{LogTransfers, ShmemLibError, ShutdownToken, WorkerExit};

#[derive(clap::Parser)]
#[clap(about = "Attaches to the shared table and drains it from consumer threads")]
struct Opts {
    /// Number of consumer threads (0 uses the default)
    thread_count: Option<usize>,
    /// Lower bound of the delay between two items, in microseconds
    min_delay_us: Option<u64>,
    /// Upper bound of the delay between two items, in microseconds
    max_delay_us: Option<u64>,
    #[clap(short = 'c', long = "config")]
    config: Option<String>,
    /// Items each thread consumes before stopping on its own
    #[clap(long = "max-items")]
    max_items: Option<u64>,
    /// Remove the named shared resources and exit
    #[clap(long)]
    purge: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    shmem::init_tracing();
    let opts: Opts = Opts::parse();
    let mut cfg: ReaderConfig = match &opts.config {
        Some(path) => shmem::load_config(path)?,
        None => ReaderConfig::default(),
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
    let consumer = match Consumer::new(&cfg, &token) {
        Ok(consumer) => consumer,
        Err(ShmemLibError::Cancelled) => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    run(consumer)?;
    Ok(())
}

fn run(consumer: Consumer) -> Result<(), Box<dyn Error>> {
    let pool = consumer.start(Arc::new(LogTransfers))?;
    info!(
        "[consumer] running with {} thread(s). Press Ctrl+C to stop.",
        pool.worker_count()
    );
    for report in pool.join() {
        match report.exit {
            WorkerExit::Drained => info!(
                "[consumer #{}] stopped after {} item(s)",
                report.worker_id, report.items
            ),
            WorkerExit::Failed(e) => error!("[consumer #{}] failed: {}", report.worker_id, e),
        }
    }
    let teardown = consumer.close()?;
    info!("[consumer] cleaned up ({:?})", teardown);
    Ok(())
}
