use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{debug, error, info, warn};

use crate::errors::ShmemLibError;
use crate::worker::{BoundedQueue, Transfer, WaitContext};

pub mod region;
pub mod semaphore;
pub mod table;

use region::{ControlRegion, Table, TableRegion};
use semaphore::NamedSemaphore;
pub use table::{SharedTable, TableSnapshot, TABLE_CAPACITY};

pub static DEFAULT_INSTANCE: &str = "demo";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmemConfig {
    /// Suffix of every named resource; two runs with the same instance share state.
    pub instance: String,
    pub attach_backoff_initial_ms: u64,
    pub attach_backoff_max_ms: u64,
    /// 0 waits for the owner forever.
    pub attach_timeout_ms: u64,
    /// How long an owner waits for a retired instance to finish its teardown
    /// before removing the leftovers itself.
    pub reclaim_after_ms: u64,
}

impl Default for ShmemConfig {
    fn default() -> Self {
        ShmemConfig {
            instance: DEFAULT_INSTANCE.to_string(),
            attach_backoff_initial_ms: 50,
            attach_backoff_max_ms: 1_000,
            attach_timeout_ms: 0,
            reclaim_after_ms: 2_000,
        }
    }
}

impl ShmemConfig {
    pub fn names(&self) -> ResourceNames {
        ResourceNames::for_instance(&self.instance)
    }
}

/// Loads a TOML config, writing the defaults first if the file does not exist.
pub fn load_config<T>(path: impl AsRef<Path>) -> Result<T, ShmemLibError>
where
    T: Serialize + DeserializeOwned + Default,
{
    Ok(confy::load_path(path)?)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    pub control: String,
    pub region: String,
    pub empty: String,
    pub full: String,
    pub mutex: String,
}

impl ResourceNames {
    pub fn for_instance(instance: &str) -> ResourceNames {
        ResourceNames {
            control: format!("/pc_shm_ctl_{}", instance),
            region: format!("/pc_shm_table_{}", instance),
            empty: format!("/pc_sem_empty_{}", instance),
            full: format!("/pc_sem_full_{}", instance),
            mutex: format!("/pc_sem_mutex_{}", instance),
        }
    }
}

/// Cooperative shutdown flag shared by the lifecycle manager and every worker.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    closing: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> ShutdownToken {
        ShutdownToken::default()
    }

    pub fn cancel(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.closing.load(Ordering::Relaxed)
    }

    /// Sleeps for `duration` in slices of at most `slice`. Returns `false` if cancelled.
    pub fn sleep(&self, duration: Duration, slice: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(slice.min(deadline - now));
        }
    }

    /// Cancels the token on SIGHUP, SIGINT, SIGQUIT or SIGTERM.
    pub fn listen_for_signals(&self) -> Result<(), ShmemLibError> {
        let mut signals =
            Signals::new([SIGHUP, SIGINT, SIGQUIT, SIGTERM]).map_err(ShmemLibError::SignalHook)?;
        let token = self.clone();
        thread::Builder::new()
            .name("signals".to_string())
            .spawn(move || {
                if let Some(signal) = signals.forever().next() {
                    info!(signal, "shutdown requested");
                    token.cancel();
                }
            })?;
        Ok(())
    }
}

/// The three named semaphores coordinating the table.
pub struct Triad {
    pub empty: NamedSemaphore,
    pub full: NamedSemaphore,
    pub mutex: NamedSemaphore,
}

impl Triad {
    fn create(names: &ResourceNames) -> Result<Triad, ShmemLibError> {
        Ok(Triad {
            empty: NamedSemaphore::create(&names.empty, TABLE_CAPACITY as u32)?,
            full: NamedSemaphore::create(&names.full, 0)?,
            mutex: NamedSemaphore::create(&names.mutex, 1)?,
        })
    }

    fn open(names: &ResourceNames) -> Result<Triad, ShmemLibError> {
        Ok(Triad {
            empty: NamedSemaphore::open(&names.empty)?,
            full: NamedSemaphore::open(&names.full)?,
            mutex: NamedSemaphore::open(&names.mutex)?,
        })
    }
}

/// Outcome of closing a [`SharedQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Other parties are still attached; nothing was removed.
    Detached { remaining: u32 },
    /// This was the last party; regions and semaphores were unlinked.
    Removed,
}

/// An attached handle to the shared table and its semaphores.
pub struct SharedQueue {
    control: ControlRegion,
    table: TableRegion,
    triad: Triad,
    names: ResourceNames,
    closed: bool,
}

/// Scope guard for the critical section. The mutex is posted when the guard
/// goes away, including on early returns and panics.
pub struct TableGuard<'a> {
    queue: &'a SharedQueue,
    released: bool,
}

impl<'a> TableGuard<'a> {
    pub fn table(&mut self) -> &mut Table {
        // The guard exists only while the mutex is held.
        unsafe { self.queue.table.table_mut() }
    }

    pub fn release(mut self) -> Result<(), ShmemLibError> {
        self.released = true;
        self.queue
            .triad
            .mutex
            .post()
            .map_err(|e| ShmemLibError::semaphore("sem_post", self.queue.triad.mutex.name(), e))
    }
}

impl<'a> Drop for TableGuard<'a> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.queue.triad.mutex.post() {
                error!(error = %e, "failed to release the table mutex");
            }
        }
    }
}

impl SharedQueue {
    pub fn names(&self) -> &ResourceNames {
        &self.names
    }

    pub fn triad(&self) -> &Triad {
        &self.triad
    }

    pub fn attached(&self) -> u32 {
        self.control.block().attached()
    }

    /// Takes the mutex with a plain blocking wait, retrying interrupted waits.
    ///
    /// This wait does not look at the shutdown token. The mutex is only held for
    /// a single critical section, which bounds it; workers go through
    /// [`SharedQueue::lock_cancellable`] instead.
    pub(crate) fn lock(&self) -> Result<TableGuard<'_>, ShmemLibError> {
        loop {
            match self.triad.mutex.wait() {
                Ok(()) => {
                    return Ok(TableGuard {
                        queue: self,
                        released: false,
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(ShmemLibError::semaphore(
                        "sem_wait",
                        self.triad.mutex.name(),
                        e,
                    ))
                }
            }
        }
    }

    /// Takes the mutex through the worker's cancellable wait. `None` if cancelled.
    pub fn lock_cancellable(
        &self,
        cx: &WaitContext,
    ) -> Result<Option<TableGuard<'_>>, ShmemLibError> {
        if !cx.acquire(&self.triad.mutex)? {
            return Ok(None);
        }
        Ok(Some(TableGuard {
            queue: self,
            released: false,
        }))
    }

    /// Runs `f` inside the critical section.
    pub fn with_table<R, F>(&self, f: F) -> Result<R, ShmemLibError>
    where
        F: FnOnce(&mut Table) -> R,
    {
        let mut guard = self.lock()?;
        let result = f(guard.table());
        guard.release()?;
        Ok(result)
    }

    pub fn snapshot(&self) -> Result<TableSnapshot, ShmemLibError> {
        self.with_table(|table| table.snapshot())
    }

    // Gives back a counting-semaphore unit taken before a failed or cancelled mutex wait.
    pub(crate) fn give_back(&self, sem: &NamedSemaphore) {
        if let Err(e) = sem.post() {
            error!(semaphore = sem.name(), error = %e, "failed to return a slot");
        }
    }

    /// Leaves the critical section after a push or pop, then posts `signal`.
    ///
    /// `signal` is posted even when releasing the mutex failed, since the table
    /// already holds the change it announces.
    pub(crate) fn finish(
        &self,
        guard: TableGuard<'_>,
        signal: &NamedSemaphore,
    ) -> Result<(), ShmemLibError> {
        let released = guard.release();
        if let Err(e) = &released {
            error!(error = %e, "failed to release the table mutex");
        }
        let posted = signal
            .post()
            .map_err(|e| ShmemLibError::semaphore("sem_post", signal.name(), e));
        if let Err(e) = &posted {
            error!(semaphore = signal.name(), error = %e, "failed to announce a transfer");
        }
        released.and(posted)
    }

    /// Detaches from the instance. The last party to detach removes every named resource.
    pub fn close(mut self) -> Result<Teardown, ShmemLibError> {
        self.detach()
    }

    fn detach(&mut self) -> Result<Teardown, ShmemLibError> {
        if self.closed {
            return Ok(Teardown::Detached {
                remaining: self.attached(),
            });
        }
        self.closed = true;
        if !self.control.block().detach() {
            let remaining = self.attached();
            info!(region = %self.names.region, remaining, "detached");
            return Ok(Teardown::Detached { remaining });
        }
        remove_resources(&self.names)?;
        info!(region = %self.names.region, "last party detached; removed shared resources");
        Ok(Teardown::Removed)
    }
}

impl Drop for SharedQueue {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            error!(error = %e, "failed to tear down shared resources");
        }
    }
}

impl BoundedQueue for SharedQueue {
    fn capacity(&self) -> usize {
        TABLE_CAPACITY
    }

    fn try_push(&self) -> Result<Option<Transfer>, ShmemLibError> {
        SharedQueue::try_push(self)
    }

    fn push(&self, cx: &WaitContext) -> Result<Option<Transfer>, ShmemLibError> {
        SharedQueue::push(self, cx)
    }

    fn try_pop(&self) -> Result<Option<Transfer>, ShmemLibError> {
        SharedQueue::try_pop(self)
    }

    fn pop(&self, cx: &WaitContext) -> Result<Option<Transfer>, ShmemLibError> {
        SharedQueue::pop(self, cx)
    }
}

// Exponential backoff between attempts to create or join an instance.
struct Backoff {
    started: Instant,
    timeout: Option<Duration>,
    delay: Duration,
    max: Duration,
}

impl Backoff {
    fn new(cfg: &ShmemConfig) -> Backoff {
        let max = Duration::from_millis(cfg.attach_backoff_max_ms.max(1));
        Backoff {
            started: Instant::now(),
            timeout: match cfg.attach_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            delay: Duration::from_millis(cfg.attach_backoff_initial_ms.max(1)).min(max),
            max,
        }
    }

    fn delay(&self) -> Duration {
        self.delay
    }

    // Sleeps for the current delay and doubles it.
    fn wait(&mut self, token: &ShutdownToken, names: &ResourceNames) -> Result<(), ShmemLibError> {
        if let Some(timeout) = self.timeout {
            if self.started.elapsed() >= timeout {
                return Err(ShmemLibError::AttachTimeout(names.region.clone()));
            }
        }
        if !token.sleep(self.delay, Duration::from_millis(50)) {
            return Err(ShmemLibError::Cancelled);
        }
        self.delay = (self.delay * 2).min(self.max);
        Ok(())
    }
}

/// Creates the instance, or joins it as an attacher when it already exists.
///
/// A retired instance is still being removed by its last party. The owner waits
/// for its names to disappear, and removes them itself only when that teardown
/// has made no progress for `reclaim_after_ms`.
pub fn owner_context(
    cfg: &ShmemConfig,
    token: &ShutdownToken,
) -> Result<SharedQueue, ShmemLibError> {
    let names = cfg.names();
    let reclaim_after = Duration::from_millis(cfg.reclaim_after_ms);
    let mut backoff = Backoff::new(cfg);
    let mut retired_since: Option<Instant> = None;
    loop {
        if token.is_cancelled() {
            return Err(ShmemLibError::Cancelled);
        }
        if let Some(control) = ControlRegion::create(&names.control)? {
            return initialize(control, names);
        }
        match ControlRegion::open(&names.control) {
            Ok(existing) if existing.block().is_retired() => {
                let since = *retired_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= reclaim_after && existing.block().claim_reclaim() {
                    warn!(control = %names.control, "reclaiming an abandoned teardown");
                    remove_resources(&names)?;
                    retired_since = None;
                    continue;
                }
                debug!(control = %names.control, "previous instance is still tearing down");
            }
            Ok(_) => {
                retired_since = None;
                if let Some(queue) = try_attach(&names)? {
                    info!(
                        region = %names.region,
                        attached = queue.attached(),
                        "shared table exists; attached"
                    );
                    return Ok(queue);
                }
            }
            // removed or not sized yet; the next create or open settles it
            Err(ShmemLibError::SharedMemory(_))
            | Err(ShmemLibError::RegionSize { found: 0, .. }) => {
                retired_since = None;
            }
            Err(e) => return Err(e),
        }
        backoff.wait(token, &names)?;
    }
}

fn initialize(control: ControlRegion, names: ResourceNames) -> Result<SharedQueue, ShmemLibError> {
    if !control.initialize() {
        return Err(ShmemLibError::Logic(format!(
            "freshly created control region {} was already claimed",
            names.control
        )));
    }
    let created = TableRegion::create(&names.region)
        .and_then(|table| Ok((table, Triad::create(&names)?)));
    let (table, triad) = match created {
        Ok(parts) => parts,
        Err(e) => {
            // Never published, so nobody else holds these names.
            if let Err(cleanup) = remove_resources(&names) {
                error!(error = %cleanup, "failed to remove a half-initialized instance");
            }
            return Err(e);
        }
    };
    control.publish_ready();
    info!(region = %names.region, capacity = TABLE_CAPACITY, "initialized shared table");
    Ok(SharedQueue {
        control,
        table,
        triad,
        names,
        closed: false,
    })
}

/// Opens an existing instance by name, backing off until every resource exists.
pub fn attacher_context(
    cfg: &ShmemConfig,
    token: &ShutdownToken,
) -> Result<SharedQueue, ShmemLibError> {
    let names = cfg.names();
    let mut backoff = Backoff::new(cfg);
    loop {
        if token.is_cancelled() {
            return Err(ShmemLibError::Cancelled);
        }
        match try_attach(&names)? {
            Some(queue) => {
                info!(
                    region = %names.region,
                    attached = queue.attached(),
                    "attached to shared table"
                );
                return Ok(queue);
            }
            None => debug!(
                region = %names.region,
                delay = ?backoff.delay(),
                "shared resources not ready"
            ),
        }
        backoff.wait(token, &names)?;
    }
}

// `Ok(None)` means "not there yet, try again later".
fn try_attach(names: &ResourceNames) -> Result<Option<SharedQueue>, ShmemLibError> {
    let control = match ControlRegion::open(&names.control) {
        Ok(control) => control,
        Err(ShmemLibError::SharedMemory(e)) => {
            debug!(error = %e, "control region not available");
            return Ok(None);
        }
        // created but not sized by its creator yet
        Err(ShmemLibError::RegionSize { found: 0, .. }) => return Ok(None),
        Err(e) => return Err(e),
    };
    if !control.block().is_ready() || control.block().is_retired() {
        return Ok(None);
    }
    control.validate()?;
    // Published, so a table of the wrong size is a foreign layout, not a race.
    let table = match TableRegion::open(&names.region) {
        Ok(table) => table,
        Err(ShmemLibError::SharedMemory(e)) => {
            debug!(error = %e, "table region removed after the control region was read");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };
    let triad = match Triad::open(names) {
        Ok(triad) => triad,
        Err(ShmemLibError::Semaphore { source, .. })
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            return Ok(None)
        }
        Err(e) => return Err(e),
    };
    if !control.block().attach() {
        return Ok(None);
    }
    Ok(Some(SharedQueue {
        control,
        table,
        triad,
        names: names.clone(),
        closed: false,
    }))
}

// The control region goes last: its name is what keeps a new owner out.
fn remove_resources(names: &ResourceNames) -> Result<(), ShmemLibError> {
    semaphore::unlink(&names.empty)?;
    semaphore::unlink(&names.full)?;
    semaphore::unlink(&names.mutex)?;
    region::unlink(&names.region)?;
    region::unlink(&names.control)
}

/// Unconditionally removes every named resource of an instance.
///
/// Meant for leftovers of crashed runs; running workers lose their queue.
pub fn purge(names: &ResourceNames) -> Result<(), ShmemLibError> {
    remove_resources(names)?;
    warn!(region = %names.region, "purged shared resources");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_instance() {
        let names = ResourceNames::for_instance("demo");
        assert_eq!(names.control, "/pc_shm_ctl_demo");
        assert_eq!(names.region, "/pc_shm_table_demo");
        assert_eq!(names.empty, "/pc_sem_empty_demo");
        assert_eq!(names.full, "/pc_sem_full_demo");
        assert_eq!(names.mutex, "/pc_sem_mutex_demo");
        assert_eq!(ShmemConfig::default().names(), names);
    }

    #[test]
    fn token_sleep_stops_early_when_cancelled() {
        let token = ShutdownToken::new();
        assert!(token.sleep(Duration::from_millis(5), Duration::from_millis(1)));
        token.cancel();
        let start = Instant::now();
        assert!(!token.sleep(Duration::from_secs(5), Duration::from_millis(10)));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(token.clone().is_cancelled());
    }

    #[test]
    fn config_round_trips_through_toml_file() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("shmem.toml");
        std::fs::write(&path, "instance = \"bench\"\nattach_timeout_ms = 250\n")?;
        let cfg: ShmemConfig = load_config(&path)?;
        assert_eq!(cfg.instance, "bench");
        assert_eq!(cfg.attach_timeout_ms, 250);
        assert_eq!(cfg.attach_backoff_initial_ms, 50);
        assert_eq!(cfg.reclaim_after_ms, 2_000);
        Ok(())
    }

    #[test]
    fn missing_config_file_is_created_with_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("fresh.toml");
        let cfg: ShmemConfig = load_config(&path)?;
        assert_eq!(cfg.instance, DEFAULT_INSTANCE);
        assert!(path.exists());
        Ok(())
    }

    #[test]
    fn new_owner_waits_for_a_retiring_party() -> Result<(), Box<dyn std::error::Error>> {
        let mut cfg = crate::tests::unique_config();
        cfg.reclaim_after_ms = 10_000;
        let token = ShutdownToken::new();
        let names = cfg.names();

        // The last party has retired the instance but not removed any name yet.
        let mut retiring = owner_context(&cfg, &token)?;
        assert!(retiring.control.block().detach());
        retiring.closed = true;

        let successor = {
            let cfg = cfg.clone();
            let token = token.clone();
            thread::spawn(move || owner_context(&cfg, &token))
        };
        thread::sleep(Duration::from_millis(100));
        assert!(!successor.is_finished(), "owner took over a live teardown");
        assert!(NamedSemaphore::open(&names.mutex).is_ok());

        // The retiring party finishes, strictly after the successor started waiting.
        remove_resources(&names)?;
        drop(retiring);

        let owner = successor.join().expect("owner thread panicked")?;
        assert_eq!(owner.attached(), 1);
        let attached = attacher_context(&cfg, &token)?;
        assert_eq!(owner.attached(), 2);
        assert_eq!(owner.try_push()?.map(|t| t.item), Some(0));
        assert_eq!(attached.try_pop()?.map(|t| t.item), Some(0));

        assert_eq!(attached.close()?, Teardown::Detached { remaining: 1 });
        assert_eq!(owner.close()?, Teardown::Removed);
        assert!(ControlRegion::open(&names.control).is_err());
        Ok(())
    }

    #[test]
    fn finish_posts_both_semaphores_when_one_fails() -> Result<(), Box<dyn std::error::Error>> {
        let cfg = crate::tests::unique_config();
        let token = ShutdownToken::new();
        let mut queue = owner_context(&cfg, &token)?;
        let saturated_name = format!("{}_saturated", queue.names.mutex);
        let saturated = NamedSemaphore::create(&saturated_name, i32::MAX as u32)?;

        // Announcing overflows; the mutex is released anyway.
        let guard = queue.lock()?;
        assert!(queue.finish(guard, &saturated).is_err());
        assert_eq!(queue.triad.mutex.value()?, 1);

        // Releasing overflows; the announcement still goes out.
        let mutex = std::mem::replace(&mut queue.triad.mutex, saturated);
        let guard = TableGuard {
            queue: &queue,
            released: false,
        };
        assert!(queue.finish(guard, &queue.triad.full).is_err());
        assert_eq!(queue.triad.full.value()?, 1);

        queue.triad.mutex = mutex;
        semaphore::unlink(&saturated_name)?;
        assert_eq!(queue.close()?, Teardown::Removed);
        Ok(())
    }

    #[test]
    fn owner_wait_observes_shutdown() -> Result<(), Box<dyn std::error::Error>> {
        let mut cfg = crate::tests::unique_config();
        cfg.reclaim_after_ms = 10_000;
        cfg.attach_timeout_ms = 0;
        let token = ShutdownToken::new();

        let mut retiring = owner_context(&cfg, &token)?;
        assert!(retiring.control.block().detach());
        retiring.closed = true;

        let canceller = {
            let token = token.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(40));
                token.cancel();
            })
        };
        let start = Instant::now();
        let result = owner_context(&cfg, &token);
        canceller.join().expect("canceller panicked");
        assert!(matches!(result, Err(ShmemLibError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(1));

        remove_resources(&retiring.names)?;
        Ok(())
    }
}
