//! Run-level tracking
//!
//! The memory manager's blocking entry points (page locking, mapping,
//! extension) may suspend on paging I/O and therefore require the caller to
//! be at the lowest run level. The current level is raised by interrupt entry
//! code and restored on exit; this module only tracks and asserts it.

use core::sync::atomic::{AtomicU8, Ordering};

/// Hardware run levels, lowest first.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunLevel {
    /// Normal thread context; blocking and preemption are allowed.
    Low = 0,
    /// Dispatcher context; blocking is not allowed.
    Dispatch = 1,
    /// Interrupt context.
    Interrupt = 2,
}

static CURRENT_RUN_LEVEL: AtomicU8 = AtomicU8::new(RunLevel::Low as u8);

/// Get the current run level.
pub fn current_run_level() -> RunLevel {
    match CURRENT_RUN_LEVEL.load(Ordering::Relaxed) {
        0 => RunLevel::Low,
        1 => RunLevel::Dispatch,
        _ => RunLevel::Interrupt,
    }
}

/// Set the current run level, returning the previous one.
pub fn set_run_level(level: RunLevel) -> RunLevel {
    let previous = CURRENT_RUN_LEVEL.swap(level as u8, Ordering::Relaxed);
    match previous {
        0 => RunLevel::Low,
        1 => RunLevel::Dispatch,
        _ => RunLevel::Interrupt,
    }
}

/// Debug-assert that the caller may block on paging I/O.
#[inline]
pub fn assert_dispatchable() {
    debug_assert_eq!(
        current_run_level(),
        RunLevel::Low,
        "operation that may block called above run level Low"
    );
}
