//! Kernel error types
//!
//! One error enum shared by the memory manager and its callers. Variants
//! carry enough context to diagnose a failure from a log line alone.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Pool, address-range, or descriptor allocation failed.
    InsufficientResources,
    /// The physical page allocator could not satisfy the request.
    NoMemory {
        pages: usize,
    },
    /// Malformed caller input (null buffer, bad vector count, ...).
    InvalidParameter,
    /// A user-mode address range escapes the user/kernel boundary, or a
    /// copy primitive faulted.
    AccessViolation {
        addr: usize,
    },
    /// The buffer cannot hold the requested bytes and cannot be extended
    /// far enough.
    BufferTooSmall {
        required: usize,
        available: usize,
    },
    /// A data-movement request ran past the end of the fragment list.
    IncorrectBufferSize,
    /// The pager made no progress; retry the same page. Never surfaced to
    /// callers of the I/O buffer API.
    TryAgain,
}

/// Result type alias for kernel operations
pub type Result<T> = core::result::Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientResources => write!(f, "Insufficient resources"),
            Self::NoMemory { pages } => {
                write!(f, "Out of physical memory: {} pages requested", pages)
            }
            Self::InvalidParameter => write!(f, "Invalid parameter"),
            Self::AccessViolation { addr } => write!(f, "Access violation at {:#x}", addr),
            Self::BufferTooSmall {
                required,
                available,
            } => {
                write!(
                    f,
                    "Buffer too small: {} bytes required, {} available",
                    required, available
                )
            }
            Self::IncorrectBufferSize => write!(f, "Operation ran past the end of the buffer"),
            Self::TryAgain => write!(f, "No progress made, try again"),
        }
    }
}
