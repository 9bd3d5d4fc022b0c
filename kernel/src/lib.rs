//! OspreyOS Kernel Library
//!
//! Core kernel services for OspreyOS. The centerpiece of this crate is the
//! memory manager's I/O buffer subsystem ([`mm::iobuf`]): the descriptor that
//! block, filesystem, network, and DMA paths use to describe memory in
//! flight, together with the collaborator seams it depends on (physical
//! allocator, kernel virtual space, pager, page cache, user copy primitives).

#![no_std]

extern crate alloc;

// On bare-metal targets use the kernel heap allocator.
// On host builds (unit tests, coverage), delegate to the system allocator so
// that test code using Vec/String/alloc compiles and runs.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Get a reference to the global allocator
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn get_allocator() -> &'static LockedHeap {
    &ALLOCATOR
}

// Host target: use the system allocator so unit tests can allocate normally.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

pub mod error;
pub mod irq;
pub mod mm;
