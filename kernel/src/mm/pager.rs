//! Image-section pager seam
//!
//! Wrapping pageable memory into an I/O buffer requires paging the data in
//! and pinning it. The pager owns that machinery; the buffer code only needs
//! section lookup and a page-in that returns the pinned page.

use alloc::sync::Arc;

use super::{page_cache::PageCacheEntry, MemorySpace, PhysicalAddress, VirtualAddress};
use crate::error::{KernelError, Result};

/// The span of one image section in an address space.
#[derive(Debug, Clone, Copy)]
pub struct SectionRange {
    pub base: VirtualAddress,
    pub size: usize,
    pub id: u64,
}

impl SectionRange {
    /// First address past the section.
    pub fn end(&self) -> VirtualAddress {
        self.base.add(self.size)
    }
}

/// A page the pager brought into memory and pinned for the caller.
pub struct LockedPage {
    /// Page-aligned base of the pinned page.
    pub physical: PhysicalAddress,
    /// Set when the page lives in the page cache. The reference is
    /// transferred to the caller; dropping it releases the page back to the
    /// cache's discretion.
    pub cache_entry: Option<Arc<PageCacheEntry>>,
}

/// Contract between the I/O buffer code and the image-section pager.
pub trait Pager: Sync {
    /// Find the section covering `address` in the given address space, or
    /// `None` when the address is backed by non-pageable memory.
    fn lookup_section(&self, address: VirtualAddress, space: MemorySpace) -> Option<SectionRange>;

    /// Page in and pin the page at `page_offset` pages into `section`.
    ///
    /// May return [`KernelError::TryAgain`], in which case the caller retries
    /// the same page; the retry carries no progress cost.
    fn page_in(&self, section: &SectionRange, page_offset: usize) -> Result<LockedPage>;
}

/// Pager for contexts without pageable memory. Every lookup misses, so
/// wrapped buffers resolve through the translation map instead.
pub struct NoPager;

impl Pager for NoPager {
    fn lookup_section(&self, _address: VirtualAddress, _space: MemorySpace) -> Option<SectionRange> {
        None
    }

    fn page_in(&self, _section: &SectionRange, _page_offset: usize) -> Result<LockedPage> {
        Err(KernelError::InvalidParameter)
    }
}
