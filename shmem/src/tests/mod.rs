use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::core::{ShmemConfig, TableSnapshot, TABLE_CAPACITY};
use crate::worker::{AfterTransfer, Role, Transfer, WorkerConfig};


// Every test gets its own set of names so tests can run in parallel.
pub(crate) fn unique_config() -> ShmemConfig {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    ShmemConfig {
        instance: format!(
            "test_{}_{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        ),
        attach_backoff_initial_ms: 5,
        attach_backoff_max_ms: 20,
        attach_timeout_ms: 2_000,
        reclaim_after_ms: 100,
    }
}

pub(crate) fn fast_workers(thread_count: usize, max_items: Option<u64>) -> WorkerConfig {
    WorkerConfig {
        thread_count,
        min_delay_us: 0,
        max_delay_us: 200,
        max_items,
        poll_interval_ms: 10,
    }
}

#[derive(Default)]
pub(crate) struct Recorder {
    transfers: Mutex<Vec<(Role, usize, Transfer)>>,
}

impl AfterTransfer for Recorder {
    fn apply(&self, role: Role, worker_id: usize, transfer: &Transfer) {
        self.transfers
            .lock()
            .unwrap()
            .push((role, worker_id, *transfer));
    }
}

impl Recorder {
    pub(crate) fn items(&self, role: Role) -> Vec<i32> {
        self.transfers
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _, _)| *r == role)
            .map(|(_, _, t)| t.item)
            .collect()
    }

    pub(crate) fn snapshots(&self) -> Vec<TableSnapshot> {
        self.transfers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, t)| t.snapshot)
            .collect()
    }

    pub(crate) fn assert_consistent(&self) {
        for snapshot in self.snapshots() {
            assert!(
                snapshot.is_consistent(TABLE_CAPACITY),
                "inconsistent snapshot {:?}",
                snapshot
            );
        }
    }
}
