use std::cell::Cell;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::Rng;
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::core::semaphore::NamedSemaphore;
use crate::core::{ShutdownToken, TableSnapshot};
use crate::errors::ShmemLibError;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Producer,
    Consumer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Producer => write!(f, "producer"),
            Role::Consumer => write!(f, "consumer"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    // a wait was interrupted by a signal and is being retried
    Retrying,
    Stopping,
    Terminated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub thread_count: usize,
    pub min_delay_us: u64,
    pub max_delay_us: u64,
    /// Items each worker moves before stopping on its own. `None` runs until shutdown.
    pub max_items: Option<u64>,
    /// Upper bound on how long any wait goes without looking at the shutdown token.
    pub poll_interval_ms: u64,
}

pub const DEFAULT_THREAD_COUNT: usize = 2;
pub const DEFAULT_MIN_DELAY_US: u64 = 20_000;
pub const DEFAULT_PRODUCER_MAX_DELAY_US: u64 = 80_000;
pub const DEFAULT_CONSUMER_MAX_DELAY_US: u64 = 90_000;

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig::producer()
    }
}

impl WorkerConfig {
    pub fn producer() -> WorkerConfig {
        WorkerConfig {
            thread_count: DEFAULT_THREAD_COUNT,
            min_delay_us: DEFAULT_MIN_DELAY_US,
            max_delay_us: DEFAULT_PRODUCER_MAX_DELAY_US,
            max_items: None,
            poll_interval_ms: 50,
        }
    }

    pub fn consumer() -> WorkerConfig {
        WorkerConfig {
            max_delay_us: DEFAULT_CONSUMER_MAX_DELAY_US,
            ..WorkerConfig::producer()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn next_delay(&self) -> Duration {
        let micros = if self.max_delay_us <= self.min_delay_us {
            self.min_delay_us
        } else {
            rand::thread_rng().gen_range(self.min_delay_us..=self.max_delay_us)
        };
        Duration::from_micros(micros)
    }
}

/// Per-worker view of the shutdown token plus the worker's current state.
///
/// Not shared between threads; every worker owns its own.
pub struct WaitContext {
    token: ShutdownToken,
    poll_interval: Duration,
    state: Cell<WorkerState>,
    retries: Cell<u64>,
}

impl WaitContext {
    pub fn new(token: ShutdownToken, poll_interval: Duration) -> WaitContext {
        WaitContext {
            token,
            poll_interval,
            state: Cell::new(WorkerState::Running),
            retries: Cell::new(0),
        }
    }

    pub fn token(&self) -> &ShutdownToken {
        &self.token
    }

    pub fn state(&self) -> WorkerState {
        self.state.get()
    }

    pub fn retries(&self) -> u64 {
        self.retries.get()
    }

    fn set_state(&self, next: WorkerState) {
        let current = self.state.get();
        if current == WorkerState::Terminated || current == next {
            return;
        }
        self.state.set(next);
    }

    /// Takes one unit from `sem`, waking up every poll interval to look at the token.
    ///
    /// Returns `Ok(false)` once shutdown was requested. Interrupted waits are retried.
    pub fn acquire(&self, sem: &NamedSemaphore) -> Result<bool, ShmemLibError> {
        loop {
            if self.token.is_cancelled() {
                self.set_state(WorkerState::Stopping);
                return Ok(false);
            }
            match sem.wait_timeout(self.poll_interval) {
                Ok(true) => {
                    self.set_state(WorkerState::Running);
                    return Ok(true);
                }
                Ok(false) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.set_state(WorkerState::Retrying);
                    self.retries.set(self.retries.get() + 1);
                    debug!(semaphore = sem.name(), "wait interrupted; retrying");
                }
                Err(e) => return Err(ShmemLibError::semaphore("sem_timedwait", sem.name(), e)),
            }
        }
    }
}

/// One item moved through the table, with the bookkeeping seen under the mutex.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Transfer {
    pub item: i32,
    pub snapshot: TableSnapshot,
}

/// A bounded queue of producer-assigned ids.
///
/// Blocking variants return `Ok(None)` when shutdown was requested before the
/// item could be moved; `try_*` variants return `Ok(None)` when the queue is
/// full (push) or empty (pop).
pub trait BoundedQueue: Send + Sync {
    fn capacity(&self) -> usize;
    fn try_push(&self) -> Result<Option<Transfer>, ShmemLibError>;
    fn push(&self, cx: &WaitContext) -> Result<Option<Transfer>, ShmemLibError>;
    fn try_pop(&self) -> Result<Option<Transfer>, ShmemLibError>;
    fn pop(&self, cx: &WaitContext) -> Result<Option<Transfer>, ShmemLibError>;
}

/// Called after every transfer, outside the critical section.
pub trait AfterTransfer: Send + Sync {
    fn apply(&self, role: Role, worker_id: usize, transfer: &Transfer);
}

pub struct LogTransfers;

impl AfterTransfer for LogTransfers {
    fn apply(&self, role: Role, worker_id: usize, transfer: &Transfer) {
        let verb = match role {
            Role::Producer => "produced",
            Role::Consumer => "consumed",
        };
        info!(
            "[{} #{}] {} item {} | count={}",
            role, worker_id, verb, transfer.item, transfer.snapshot.count
        );
    }
}

#[derive(Debug)]
pub enum WorkerExit {
    /// Stopped after shutdown or after reaching its item limit.
    Drained,
    Failed(ShmemLibError),
}

#[derive(Debug)]
pub struct WorkerReport {
    pub role: Role,
    pub worker_id: usize,
    pub items: u64,
    pub retries: u64,
    pub state: WorkerState,
    pub exit: WorkerExit,
}

/// The producer/consumer loop. Returns once the worker is `Terminated`.
pub fn run_worker<Q>(
    role: Role,
    worker_id: usize,
    queue: &Q,
    cfg: &WorkerConfig,
    cx: &WaitContext,
    observer: &dyn AfterTransfer,
) -> WorkerReport
where
    Q: BoundedQueue + ?Sized,
{
    let mut items = 0u64;
    let exit = loop {
        if cx.token().is_cancelled() || cfg.max_items.map_or(false, |max| items >= max) {
            cx.set_state(WorkerState::Stopping);
            break WorkerExit::Drained;
        }
        let moved = match role {
            Role::Producer => queue.push(cx),
            Role::Consumer => queue.pop(cx),
        };
        match moved {
            Ok(Some(transfer)) => {
                items += 1;
                observer.apply(role, worker_id, &transfer);
                cx.token().sleep(cfg.next_delay(), cx.poll_interval);
            }
            // shutdown observed inside a wait; the loop top turns it into Stopping
            Ok(None) => continue,
            Err(e) => {
                error!(%role, worker_id, error = %e, "worker failed");
                break WorkerExit::Failed(e);
            }
        }
    };
    cx.set_state(WorkerState::Terminated);
    WorkerReport {
        role,
        worker_id,
        items,
        retries: cx.retries(),
        state: cx.state(),
        exit,
    }
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<WorkerReport>>,
}

impl WorkerPool {
    /// Spawns `cfg.thread_count` workers of one role over a shared queue.
    pub fn spawn<Q>(
        role: Role,
        queue: Arc<Q>,
        cfg: &WorkerConfig,
        token: &ShutdownToken,
        observer: Arc<dyn AfterTransfer>,
    ) -> Result<WorkerPool, ShmemLibError>
    where
        Q: BoundedQueue + 'static,
    {
        let count = if cfg.thread_count == 0 {
            DEFAULT_THREAD_COUNT
        } else {
            cfg.thread_count
        };
        let mut handles = Vec::with_capacity(count);
        for worker_id in 0..count {
            let queue = Arc::clone(&queue);
            let observer = Arc::clone(&observer);
            let cfg = cfg.clone();
            let cx = WaitContext::new(token.clone(), cfg.poll_interval());
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", role, worker_id))
                .spawn(move || run_worker(role, worker_id, &*queue, &cfg, &cx, &*observer));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => error!(%role, worker_id, error = %e, "failed to spawn worker"),
            }
        }
        if handles.is_empty() {
            return Err(ShmemLibError::Logic(format!("no {} worker could be started", role)));
        }
        Ok(WorkerPool { handles })
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Waits for every worker to terminate.
    pub fn join(self) -> Vec<WorkerReport> {
        self.handles
            .into_iter()
            .filter_map(|handle| match handle.join() {
                Ok(report) => Some(report),
                Err(_) => {
                    error!("worker panicked");
                    None
                }
            })
            .collect()
    }
}
