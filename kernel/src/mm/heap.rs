//! Kernel heap bring-up
//!
//! The heap is the pool that I/O buffer descriptors and their fragment and
//! page-slot tables live in. On bare metal the global allocator is a
//! [`linked_list_allocator::LockedHeap`] initialized here; host builds run on
//! the system allocator and need no bring-up.

/// Kernel heap size (4 MB initially)
pub const HEAP_SIZE: usize = 4 * 1024 * 1024;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
static mut HEAP_MEMORY: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

/// Initialize the kernel heap.
///
/// Must be called once, before the first descriptor allocation.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn init() {
    // Use raw pointers to avoid static mut refs warning
    let heap_start = core::ptr::addr_of_mut!(HEAP_MEMORY) as *mut u8;
    log::debug!("heap: {} KB at {:p}", HEAP_SIZE / 1024, heap_start);

    // SAFETY: HEAP_MEMORY is a static array reserved exclusively for the
    // heap, and init runs once before any allocation.
    unsafe {
        crate::get_allocator().lock().init(heap_start, HEAP_SIZE);
    }
}

/// Initialize the kernel heap.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn init() {
    // Host builds allocate from the system allocator.
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::{boxed::Box, vec::Vec};

    #[test]
    fn test_heap_allocation() {
        let x = Box::new(42);
        assert_eq!(*x, 42);

        let mut v = Vec::new();
        for i in 0..100 {
            v.push(i);
        }
        assert_eq!(v.len(), 100);
    }
}
