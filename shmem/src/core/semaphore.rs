use std::ffi::CString;
use std::io;
use std::time::Duration;

use crate::errors::ShmemLibError;

const SEM_MODE: libc::c_uint = 0o666;

/// Handle to a POSIX named semaphore.
///
/// Dropping the handle closes it; the name stays until [`unlink`] is called.
#[derive(Debug)]
pub struct NamedSemaphore {
    name: String,
    sem: *mut libc::sem_t,
}

// sem_t handles are designed for concurrent use from any thread.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

fn c_name(name: &str) -> Result<CString, ShmemLibError> {
    if !name.starts_with('/') || name[1..].contains('/') || name.len() < 2 {
        return Err(ShmemLibError::InvalidName(name.to_string()));
    }
    CString::new(name).map_err(|_| ShmemLibError::InvalidName(name.to_string()))
}

impl NamedSemaphore {
    /// Creates the semaphore exclusively with `initial` units.
    ///
    /// A semaphore left behind by an earlier run under the same name is
    /// unlinked first, so the new one always starts from `initial`.
    pub fn create(name: &str, initial: u32) -> Result<NamedSemaphore, ShmemLibError> {
        let c = c_name(name)?;
        let mut sem = Self::open_exclusive(&c, initial);
        if sem.is_none() && io::Error::last_os_error().raw_os_error() == Some(libc::EEXIST) {
            tracing::warn!(name, "removing stale semaphore");
            unlink(name)?;
            sem = Self::open_exclusive(&c, initial);
        }
        match sem {
            Some(sem) => Ok(NamedSemaphore {
                name: name.to_string(),
                sem,
            }),
            None => Err(ShmemLibError::semaphore(
                "sem_open",
                name,
                io::Error::last_os_error(),
            )),
        }
    }

    fn open_exclusive(c: &CString, initial: u32) -> Option<*mut libc::sem_t> {
        let sem = unsafe {
            libc::sem_open(
                c.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                SEM_MODE,
                initial as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            None
        } else {
            Some(sem)
        }
    }

    /// Opens an existing semaphore. `ErrorKind::NotFound` means it does not exist yet.
    pub fn open(name: &str) -> Result<NamedSemaphore, ShmemLibError> {
        let c = c_name(name)?;
        let sem = unsafe { libc::sem_open(c.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(ShmemLibError::semaphore(
                "sem_open",
                name,
                io::Error::last_os_error(),
            ));
        }
        Ok(NamedSemaphore {
            name: name.to_string(),
            sem,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocks until a unit is taken. Interrupted waits surface as `ErrorKind::Interrupted`.
    pub fn wait(&self) -> io::Result<()> {
        if unsafe { libc::sem_wait(self.sem) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Returns `Ok(false)` when no unit is available.
    pub fn try_wait(&self) -> io::Result<bool> {
        if unsafe { libc::sem_trywait(self.sem) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) => Ok(false),
            _ => Err(err),
        }
    }

    /// Waits at most `timeout`. Returns `Ok(false)` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> io::Result<bool> {
        let deadline = deadline_after(timeout)?;
        if unsafe { libc::sem_timedwait(self.sem, &deadline) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ETIMEDOUT) => Ok(false),
            _ => Err(err),
        }
    }

    pub fn post(&self) -> io::Result<()> {
        if unsafe { libc::sem_post(self.sem) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn value(&self) -> io::Result<i32> {
        let mut value: libc::c_int = 0;
        if unsafe { libc::sem_getvalue(self.sem, &mut value) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(value)
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}

/// Removes a named semaphore. A name that is already gone is not an error.
pub fn unlink(name: &str) -> Result<(), ShmemLibError> {
    let c = c_name(name)?;
    if unsafe { libc::sem_unlink(c.as_ptr()) } == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOENT) {
            return Err(ShmemLibError::semaphore("sem_unlink", name, err));
        }
    }
    Ok(())
}

// sem_timedwait takes an absolute CLOCK_REALTIME deadline.
fn deadline_after(timeout: Duration) -> io::Result<libc::timespec> {
    let mut now: libc::timespec = unsafe { std::mem::zeroed() };
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } == -1 {
        return Err(io::Error::last_os_error());
    }
    let nanos = now.tv_nsec as u64 + u64::from(timeout.subsec_nanos());
    now.tv_sec += (timeout.as_secs() + nanos / 1_000_000_000) as libc::time_t;
    now.tv_nsec = (nanos % 1_000_000_000) as libc::c_long;
    Ok(now)
}
