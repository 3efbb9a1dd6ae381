pub mod core;
pub mod errors;
pub mod reader;
pub mod worker;
pub mod writer;

#[cfg(test)]
mod tests;

pub use crate::core::{
    attacher_context, load_config, owner_context, purge, ResourceNames, SharedQueue, ShmemConfig,
    ShutdownToken, Teardown, TABLE_CAPACITY,
};
pub use crate::errors::ShmemLibError;
pub use crate::worker::{
    AfterTransfer, BoundedQueue, LogTransfers, Role, Transfer, WorkerConfig, WorkerExit,
    WorkerPool, WorkerReport, WorkerState,
};

/// Installs the `tracing` subscriber used by the binaries.
///
/// `RUST_LOG` overrides the default `info` filter.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
