//! Page cache entries
//!
//! A page cache entry is a shared, reference-counted page of cached file
//! data. I/O buffers borrow cache pages by holding an `Arc<PageCacheEntry>`
//! per page slot, so taking and releasing a reference are `Arc::clone` and
//! drop; a slot can never leak its reference.
//!
//! The entry carries an advisory virtual-address hint. A buffer that maps a
//! cache-backed page publishes the chosen address so later users can reuse
//! the mapping; publication never replaces an existing hint, and the cache
//! keeps ownership of hinted mappings (the buffer's unmap skips them).

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use super::{PhysicalAddress, VirtualAddress};

/// One page of cached data.
#[derive(Debug)]
pub struct PageCacheEntry {
    physical: PhysicalAddress,
    /// Advisory mapping hint; 0 means unset.
    virtual_hint: AtomicU64,
}

impl PageCacheEntry {
    /// Create an entry for a cached page. The physical address must be page
    /// aligned.
    pub fn new(physical: PhysicalAddress) -> Arc<Self> {
        debug_assert!(physical.is_page_aligned());
        Arc::new(Self {
            physical,
            virtual_hint: AtomicU64::new(0),
        })
    }

    /// Create an entry that is already mapped at `address`.
    pub fn new_mapped(physical: PhysicalAddress, address: VirtualAddress) -> Arc<Self> {
        let entry = Self::new(physical);
        entry.virtual_hint.store(address.as_u64(), Ordering::Release);
        entry
    }

    pub fn physical_address(&self) -> PhysicalAddress {
        self.physical
    }

    /// The published mapping hint, if any.
    pub fn virtual_address(&self) -> Option<VirtualAddress> {
        match self.virtual_hint.load(Ordering::Acquire) {
            0 => None,
            addr => Some(VirtualAddress::new(addr)),
        }
    }

    /// Publish a mapping hint. Only an unset hint can be won; a racing
    /// publisher that loses simply keeps using its own mapping. Returns
    /// whether this caller's address was installed.
    pub fn publish_virtual_address(&self, address: VirtualAddress) -> bool {
        debug_assert_ne!(address.as_u64(), 0);
        self.virtual_hint
            .compare_exchange(0, address.as_u64(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_counting_is_arc() {
        let entry = PageCacheEntry::new(PhysicalAddress::new(0x4000));
        assert_eq!(Arc::strong_count(&entry), 1);

        let borrowed = Arc::clone(&entry);
        assert_eq!(Arc::strong_count(&entry), 2);
        assert_eq!(borrowed.physical_address(), PhysicalAddress::new(0x4000));

        drop(borrowed);
        assert_eq!(Arc::strong_count(&entry), 1);
    }

    #[test]
    fn test_hint_publishes_once() {
        let entry = PageCacheEntry::new(PhysicalAddress::new(0x8000));
        assert_eq!(entry.virtual_address(), None);

        assert!(entry.publish_virtual_address(VirtualAddress::new(0x9000)));
        // A second publisher loses and the hint is unchanged.
        assert!(!entry.publish_virtual_address(VirtualAddress::new(0xA000)));
        assert_eq!(entry.virtual_address(), Some(VirtualAddress::new(0x9000)));
    }

    #[test]
    fn test_new_mapped_carries_hint() {
        let entry =
            PageCacheEntry::new_mapped(PhysicalAddress::new(0x8000), VirtualAddress::new(0xB000));
        assert_eq!(entry.virtual_address(), Some(VirtualAddress::new(0xB000)));
        assert!(!entry.publish_virtual_address(VirtualAddress::new(0xC000)));
    }
}
