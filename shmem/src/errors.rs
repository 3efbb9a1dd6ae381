use std::{fmt, io};

#[derive(Debug)]
pub enum ShmemLibError {
    SharedMemory(shared_memory::ShmemError),
    Semaphore {
        op: &'static str,
        name: String,
        source: io::Error,
    },
    Io(io::Error),
    SignalHook(io::Error), // signal_hook errors are io::Error
    Config(confy::ConfyError),
    InvalidName(String),
    CapacityMismatch { expected: usize, found: usize },
    RegionSize {
        name: String,
        expected: usize,
        found: usize,
    },
    BadMagic(u32),
    AttachTimeout(String),
    Cancelled,
    WorkersRunning,
    Logic(String),
}

impl ShmemLibError {
    pub(crate) fn semaphore(op: &'static str, name: &str, source: io::Error) -> ShmemLibError {
        ShmemLibError::Semaphore {
            op,
            name: name.to_string(),
            source,
        }
    }
}

impl fmt::Display for ShmemLibError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShmemLibError::SharedMemory(e) => write!(f, "Shared memory error: {}", e),
            ShmemLibError::Semaphore { op, name, source } => {
                write!(f, "Semaphore error: {}({}): {}", op, name, source)
            }
            ShmemLibError::Io(e) => write!(f, "IO error: {}", e),
            ShmemLibError::SignalHook(e) => write!(f, "Signal handling error: {}", e),
            ShmemLibError::Config(e) => write!(f, "Config error: {}", e),
            ShmemLibError::InvalidName(s) => write!(f, "Invalid resource name: {:?}", s),
            ShmemLibError::CapacityMismatch { expected, found } => write!(
                f,
                "Shared table capacity mismatch: expected {}, found {}",
                expected, found
            ),
            ShmemLibError::RegionSize {
                name,
                expected,
                found,
            } => write!(
                f,
                "Shared region {} is {} bytes, expected {}",
                name, found, expected
            ),
            ShmemLibError::BadMagic(m) => {
                write!(f, "Shared region has an unknown layout (magic {:#010x})", m)
            }
            ShmemLibError::AttachTimeout(s) => write!(f, "Timed out attaching to {}", s),
            ShmemLibError::Cancelled => write!(f, "Shutdown requested"),
            ShmemLibError::WorkersRunning => {
                write!(f, "Shared queue is still referenced by running workers")
            }
            ShmemLibError::Logic(s) => write!(f, "Logic error: {}", s),
        }
    }
}

impl std::error::Error for ShmemLibError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShmemLibError::SharedMemory(e) => Some(e),
            ShmemLibError::Semaphore { source, .. } => Some(source),
            ShmemLibError::Io(e) => Some(e),
            ShmemLibError::SignalHook(e) => Some(e),
            ShmemLibError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<shared_memory::ShmemError> for ShmemLibError {
    fn from(err: shared_memory::ShmemError) -> Self {
        ShmemLibError::SharedMemory(err)
    }
}

impl From<io::Error> for ShmemLibError {
    fn from(err: io::Error) -> Self {
        ShmemLibError::Io(err)
    }
}

impl From<confy::ConfyError> for ShmemLibError {
    fn from(err: confy::ConfyError) -> Self {
        ShmemLibError::Config(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn semaphore_error_names_the_operation() {
        let err = ShmemLibError::semaphore(
            "sem_post",
            "/pc_sem_full_demo",
            io::Error::from_raw_os_error(libc::EOVERFLOW),
        );
        let text = err.to_string();
        assert!(text.contains("sem_post(/pc_sem_full_demo)"), "{}", text);
        assert!(err.source().is_some());
    }

    #[test]
    fn region_size_reports_both_sizes() {
        let err = ShmemLibError::RegionSize {
            name: "/pc_shm_table_demo".to_string(),
            expected: 24,
            found: 40,
        };
        assert_eq!(
            err.to_string(),
            "Shared region /pc_shm_table_demo is 40 bytes, expected 24"
        );
    }

    #[test]
    fn cancelled_has_no_source() {
        assert!(ShmemLibError::Cancelled.source().is_none());
    }
}
