use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};

use super::core::*;
use super::errors::ShmemLibError;
use super::worker::{AfterTransfer, Role, Transfer, WaitContext, WorkerConfig, WorkerPool};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub shmem: ShmemConfig,
    pub workers: WorkerConfig,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        ReaderConfig {
            shmem: ShmemConfig::default(),
            workers: WorkerConfig::consumer(),
        }
    }
}

impl SharedQueue {
    /// Consumes one item if one is queued right now.
    pub fn try_pop(&self) -> Result<Option<Transfer>, ShmemLibError> {
        let full = &self.triad().full;
        if !full
            .try_wait()
            .map_err(|e| ShmemLibError::semaphore("sem_trywait", full.name(), e))?
        {
            return Ok(None);
        }
        let guard = match self.lock() {
            Ok(guard) => guard,
            Err(e) => {
                self.give_back(full);
                return Err(e);
            }
        };
        self.consume(guard).map(Some)
    }

    /// wait(full) -> wait(mutex) -> pop -> post(mutex) -> post(empty)
    pub fn pop(&self, cx: &WaitContext) -> Result<Option<Transfer>, ShmemLibError> {
        let full = &self.triad().full;
        if !cx.acquire(full)? {
            return Ok(None);
        }
        let guard = match self.lock_cancellable(cx) {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                self.give_back(full);
                return Ok(None);
            }
            Err(e) => {
                self.give_back(full);
                return Err(e);
            }
        };
        self.consume(guard).map(Some)
    }

    fn consume(&self, mut guard: TableGuard<'_>) -> Result<Transfer, ShmemLibError> {
        let transfer = {
            let table = guard.table();
            let item = table.pop();
            Transfer {
                item,
                snapshot: table.snapshot(),
            }
        };
        self.finish(guard, &self.triad().empty)?;
        Ok(transfer)
    }
}

/// Attacher-role process: waits for the producer's table and runs consumer threads.
pub struct Consumer {
    cfg: ReaderConfig,
    queue: Arc<SharedQueue>,
    token: ShutdownToken,
}

impl Consumer {
    pub fn new(cfg: &ReaderConfig, token: &ShutdownToken) -> Result<Consumer, ShmemLibError> {
        let queue = attacher_context(&cfg.shmem, token)?;
        Ok(Consumer {
            cfg: cfg.clone(),
            queue: Arc::new(queue),
            token: token.clone(),
        })
    }

    pub fn start(&self, observer: Arc<dyn AfterTransfer>) -> Result<WorkerPool, ShmemLibError> {
        WorkerPool::spawn(
            Role::Consumer,
            Arc::clone(&self.queue),
            &self.cfg.workers,
            &self.token,
            observer,
        )
    }

    pub fn close(self) -> Result<Teardown, ShmemLibError> {
        Arc::try_unwrap(self.queue)
            .map_err(|_| ShmemLibError::WorkersRunning)?
            .close()
    }
}
