//! The mapped shared regions and the only place that aliases their memory.
//!
//! Each instance maps two regions:
//!
//! ```text
//! /pc_shm_ctl_I     ControlBlock  magic | state | attached | capacity   (4 x u32)
//! /pc_shm_table_I   SharedTable   items[N] | head | tail | count | next_id
//! ```
//!
//! The table region is exactly the plain 4·N+16 byte record and nothing else.
//! Control fields are atomics and may be touched at any time. The table is
//! reachable only through [`TableRegion::table_mut`], whose caller must hold
//! the triad's mutex.

use std::cell::UnsafeCell;
use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};

use shared_memory::{Shmem, ShmemConf, ShmemError};

use super::table::{SharedTable, TABLE_CAPACITY};
use crate::errors::ShmemLibError;

pub type Table = SharedTable<TABLE_CAPACITY>;

/// "PCTB"
pub const REGION_MAGIC: u32 = 0x5043_5442;

pub const STATE_UNINIT: u32 = 0;
pub const STATE_INITIALIZING: u32 = 1;
pub const STATE_READY: u32 = 2;

// Set in `attached` by the last party to detach; nobody may attach afterwards.
const RETIRED: u32 = 1 << 31;
// Set next to RETIRED by the one owner that takes over an abandoned teardown.
const RECLAIMING: u32 = 1 << 30;
const FLAGS: u32 = RETIRED | RECLAIMING;

#[repr(C)]
pub struct ControlBlock {
    pub magic: AtomicU32,
    pub state: AtomicU32,
    attached: AtomicU32,
    pub capacity: AtomicU32,
}

pub const CONTROL_SIZE: usize = mem::size_of::<ControlBlock>();
pub const TABLE_SIZE: usize = mem::size_of::<Table>();

impl ControlBlock {
    /// Registers one more attached handle. Fails once the instance is retired.
    pub fn attach(&self) -> bool {
        let mut current = self.attached.load(Ordering::Acquire);
        loop {
            if current & RETIRED != 0 {
                return false;
            }
            match self.attached.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drops one attached handle. Returns `true` for the last one, which retires the instance.
    pub fn detach(&self) -> bool {
        let mut current = self.attached.load(Ordering::Acquire);
        loop {
            if current & RETIRED != 0 || current == 0 {
                return false;
            }
            let next = if current == 1 { RETIRED } else { current - 1 };
            match self.attached.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next == RETIRED,
                Err(actual) => current = actual,
            }
        }
    }

    /// Claims the removal of a retired instance whose last party never finished it.
    ///
    /// At most one caller ever gets `true` for a given control region.
    pub fn claim_reclaim(&self) -> bool {
        self.attached
            .compare_exchange(
                RETIRED,
                RETIRED | RECLAIMING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn attached(&self) -> u32 {
        self.attached.load(Ordering::Acquire) & !FLAGS
    }

    pub fn is_retired(&self) -> bool {
        self.attached.load(Ordering::Acquire) & RETIRED != 0
    }

    pub fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_READY
    }
}

// Exclusive create. `Ok(None)` when the name already exists.
fn map_new(name: &str, size: usize) -> Result<Option<Shmem>, ShmemLibError> {
    match ShmemConf::new().size(size).os_id(name).create() {
        Ok(mut shmem) => {
            shmem.set_owner(false);
            Ok(Some(shmem))
        }
        Err(ShmemError::MappingIdExists) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// Opens a fully sized region. Names are never unlinked by dropping the mapping.
fn map_existing(name: &str, expected: usize) -> Result<Shmem, ShmemLibError> {
    let mut shmem = ShmemConf::new().os_id(name).open()?;
    shmem.set_owner(false);
    if shmem.len() != expected {
        return Err(ShmemLibError::RegionSize {
            name: name.to_string(),
            expected,
            found: shmem.len(),
        });
    }
    Ok(shmem)
}

/// Mapping of the control region: the one-shot initialization marker and the
/// liveness count of one instance.
pub struct ControlRegion {
    shmem: Shmem,
}

// Atomics only.
unsafe impl Send for ControlRegion {}
unsafe impl Sync for ControlRegion {}

impl ControlRegion {
    /// Creates the control region exclusively. `Ok(None)` when the name already exists.
    ///
    /// Winning this create is what makes a process the initializer of the instance.
    pub fn create(name: &str) -> Result<Option<ControlRegion>, ShmemLibError> {
        Ok(map_new(name, CONTROL_SIZE)?.map(|shmem| ControlRegion { shmem }))
    }

    pub fn open(name: &str) -> Result<ControlRegion, ShmemLibError> {
        Ok(ControlRegion {
            shmem: map_existing(name, CONTROL_SIZE)?,
        })
    }

    pub fn block(&self) -> &ControlBlock {
        // The mapping is page aligned and exactly CONTROL_SIZE bytes long.
        unsafe { &*(self.shmem.as_ptr() as *const ControlBlock) }
    }

    pub fn name(&self) -> &str {
        self.shmem.get_os_id()
    }

    /// Claims the one-shot initialization.
    ///
    /// Returns `false` if the region was already claimed by someone else.
    pub fn initialize(&self) -> bool {
        let block = self.block();
        if block
            .state
            .compare_exchange(
                STATE_UNINIT,
                STATE_INITIALIZING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        block.magic.store(REGION_MAGIC, Ordering::Relaxed);
        block.capacity.store(TABLE_CAPACITY as u32, Ordering::Relaxed);
        block.attached.store(1, Ordering::Relaxed);
        true
    }

    pub fn publish_ready(&self) {
        self.block().state.store(STATE_READY, Ordering::Release);
    }

    pub fn validate(&self) -> Result<(), ShmemLibError> {
        let block = self.block();
        let magic = block.magic.load(Ordering::Acquire);
        if magic != REGION_MAGIC {
            return Err(ShmemLibError::BadMagic(magic));
        }
        let found = block.capacity.load(Ordering::Acquire) as usize;
        if found != TABLE_CAPACITY {
            return Err(ShmemLibError::CapacityMismatch {
                expected: TABLE_CAPACITY,
                found,
            });
        }
        Ok(())
    }
}

/// Mapping of the table region.
pub struct TableRegion {
    shmem: Shmem,
}

// The table is guarded by the cross-process mutex.
unsafe impl Send for TableRegion {}
unsafe impl Sync for TableRegion {}

impl TableRegion {
    /// Creates the table region with an empty table, replacing a leftover of the same name.
    ///
    /// Only the process that won the control region's initialization calls this.
    pub fn create(name: &str) -> Result<TableRegion, ShmemLibError> {
        let shmem = match map_new(name, TABLE_SIZE)? {
            Some(shmem) => shmem,
            None => {
                tracing::warn!(name, "removing stale table region");
                unlink(name)?;
                map_new(name, TABLE_SIZE)?.ok_or_else(|| {
                    ShmemLibError::Logic(format!(
                        "table region {} was re-created concurrently",
                        name
                    ))
                })?
            }
        };
        let region = TableRegion { shmem };
        // Not reachable by anyone else until the control region says READY.
        unsafe {
            *region.table_mut() = Table::new();
        }
        Ok(region)
    }

    pub fn open(name: &str) -> Result<TableRegion, ShmemLibError> {
        Ok(TableRegion {
            shmem: map_existing(name, TABLE_SIZE)?,
        })
    }

    /// # Safety
    ///
    /// The caller must hold the triad's mutex for as long as the reference lives,
    /// or be the creator before the instance was published as ready.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn table_mut(&self) -> &mut Table {
        let cell = &*(self.shmem.as_ptr() as *const UnsafeCell<Table>);
        &mut *cell.get()
    }
}

/// Removes a named region without mapping it. Already gone is not an error.
pub fn unlink(name: &str) -> Result<(), ShmemLibError> {
    let c = std::ffi::CString::new(name)
        .map_err(|_| ShmemLibError::InvalidName(name.to_string()))?;
    if unsafe { libc::shm_unlink(c.as_ptr()) } == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOENT) {
            return Err(err.into());
        }
    }
    Ok(())
}
