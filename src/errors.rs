use crate::addr::Addr;
use std::fmt;

/// Reasons a region or transaction operation fails.
///
/// Every variant except `CreateFailed` is a transient conflict: the caller
/// may begin a fresh transaction and retry. No variant is fatal to the
/// region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StmError {
    /// Region construction was given invalid parameters.
    CreateFailed,
    /// A read observed a locked word or a version newer than the
    /// transaction's read-version.
    ReadConflict { addr: Addr },
    /// Commit could not acquire every write-set lock.
    LockConflict { addr: Addr },
    /// Read-set validation at commit observed a lock or a newer version.
    StaleRead { addr: Addr },
}

impl StmError {
    /// Whether retrying with a fresh transaction can succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, StmError::CreateFailed)
    }
}

impl fmt::Display for StmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StmError::CreateFailed => write!(f, "region creation failed"),
            StmError::ReadConflict { addr } => {
                write!(f, "read conflict at {:#x}", addr)
            }
            StmError::LockConflict { addr } => {
                write!(f, "write lock conflict at {:#x}", addr)
            }
            StmError::StaleRead { addr } => {
                write!(f, "stale read set at {:#x}", addr)
            }
        }
    }
}

impl std::error::Error for StmError {}

/// Outcome of a failed transactional allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The segment directory is exhausted. The transaction remains usable.
    NoMemory,
    /// The allocation invalidated the transaction. Reserved; the current
    /// allocator never produces it.
    Abort,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::NoMemory => write!(f, "segment directory exhausted"),
            AllocError::Abort => write!(f, "allocation aborted the transaction"),
        }
    }
}

impl std::error::Error for AllocError {}
