use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};

use super::core::*;
use super::errors::ShmemLibError;
use super::worker::{AfterTransfer, Role, Transfer, WaitContext, WorkerConfig, WorkerPool};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub shmem: ShmemConfig,
    pub workers: WorkerConfig,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            shmem: ShmemConfig::default(),
            workers: WorkerConfig::producer(),
        }
    }
}

impl SharedQueue {
    /// Produces one item if a slot is free right now.
    pub fn try_push(&self) -> Result<Option<Transfer>, ShmemLibError> {
        let empty = &self.triad().empty;
        if !empty
            .try_wait()
            .map_err(|e| ShmemLibError::semaphore("sem_trywait", empty.name(), e))?
        {
            return Ok(None);
        }
        let guard = match self.lock() {
            Ok(guard) => guard,
            Err(e) => {
                self.give_back(empty);
                return Err(e);
            }
        };
        self.produce(guard).map(Some)
    }

    /// wait(empty) -> wait(mutex) -> push -> post(mutex) -> post(full)
    pub fn push(&self, cx: &WaitContext) -> Result<Option<Transfer>, ShmemLibError> {
        let empty = &self.triad().empty;
        if !cx.acquire(empty)? {
            return Ok(None);
        }
        let guard = match self.lock_cancellable(cx) {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                self.give_back(empty);
                return Ok(None);
            }
            Err(e) => {
                self.give_back(empty);
                return Err(e);
            }
        };
        self.produce(guard).map(Some)
    }

    fn produce(&self, mut guard: TableGuard<'_>) -> Result<Transfer, ShmemLibError> {
        let transfer = {
            let table = guard.table();
            let item = table.allocate_id();
            table.push(item);
            Transfer {
                item,
                snapshot: table.snapshot(),
            }
        };
        self.finish(guard, &self.triad().full)?;
        Ok(transfer)
    }
}

/// Owner-role process: creates the shared table and runs producer threads.
pub struct Producer {
    cfg: WriterConfig,
    queue: Arc<SharedQueue>,
    token: ShutdownToken,
}

impl Producer {
    pub fn new(cfg: &WriterConfig, token: &ShutdownToken) -> Result<Producer, ShmemLibError> {
        let queue = owner_context(&cfg.shmem, token)?;
        Ok(Producer {
            cfg: cfg.clone(),
            queue: Arc::new(queue),
            token: token.clone(),
        })
    }

    pub fn start(&self, observer: Arc<dyn AfterTransfer>) -> Result<WorkerPool, ShmemLibError> {
        WorkerPool::spawn(
            Role::Producer,
            Arc::clone(&self.queue),
            &self.cfg.workers,
            &self.token,
            observer,
        )
    }

    /// Detaches once every worker has been joined.
    pub fn close(self) -> Result<Teardown, ShmemLibError> {
        Arc::try_unwrap(self.queue)
            .map_err(|_| ShmemLibError::WorkersRunning)?
            .close()
    }
}
