//! I/O buffer management
//!
//! An I/O buffer describes a region of memory being transferred between a
//! device or subsystem and kernel- or user-mode memory. It carries both views
//! of the same bytes — virtual addresses for the mapper and data movers,
//! physical addresses for DMA — as a table of physically contiguous
//! [`Fragment`]s, plus an optional per-page table of page-cache references so
//! cached pages can be borrowed by I/O without copying.
//!
//! The descriptor is owned by exactly one caller at a time and performs no
//! internal locking; handing a buffer between threads is the caller's
//! business. Constructors, mapping, data movement, device validation, and
//! teardown each live in their own submodule.

mod copy;
mod create;
mod extend;
mod map;
mod release;
#[cfg(test)]
pub(crate) mod testutil;

pub use create::{IoVec, IoVectorSource};

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use super::page_cache::PageCacheEntry;
use super::{
    is_aligned, l1_data_cache_line_size, registered_cache_line_size, MemorySpace,
    PhysicalAddress, VirtualAddress, PAGE_SHIFT, PAGE_SIZE,
};

/// Largest I/O vector array accepted by [`IoBuffer::create_from_vector`].
pub const MAX_IO_VECTOR_COUNT: usize = 1024;

/// One physically contiguous run of memory.
///
/// Sizes are byte-granular: every fragment except the first and last of a
/// wrapped user buffer covers whole pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    /// Mapping of the run, when it has one.
    pub virtual_address: Option<VirtualAddress>,
    /// Physical base of the run; `None` for purely virtual descriptions
    /// (paged pool, unlocked wraps).
    pub physical_address: Option<PhysicalAddress>,
    /// Length of the run in bytes.
    pub size: usize,
}

impl Fragment {
    /// First physical address past the run, when physical.
    pub fn physical_end(&self) -> Option<PhysicalAddress> {
        self.physical_address.map(|pa| pa.offset(self.size as u64))
    }

    /// First virtual address past the run, when mapped.
    pub fn virtual_end(&self) -> Option<VirtualAddress> {
        self.virtual_address.map(|va| va.add(self.size))
    }

    /// Whether `pa` continues this run physically.
    fn extends_physically(&self, pa: PhysicalAddress) -> bool {
        self.physical_end() == Some(pa)
    }
}

/// How the described pages were obtained; drives per-page teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Nothing to do per page (paged pool, unlocked wraps, vectors).
    Borrowed,
    /// Pages allocated by this subsystem; freed on release unless a cache
    /// entry borrowed the slot.
    Owned,
    /// Caller memory pinned page by page; each page holds either a cache
    /// reference or a page lock.
    Locked,
    /// Every described page must carry a cache-entry reference.
    CacheBacked,
}

/// Shape of the buffer's virtual mapping once fully mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualLayout {
    /// Every fragment is mapped, not necessarily adjacently.
    Scattered,
    /// Fragments are adjacent in virtual memory; the buffer is addressable
    /// as one span.
    Contiguous,
}

/// An I/O buffer descriptor.
#[derive(Debug)]
pub struct IoBuffer {
    fragments: Vec<Fragment>,
    /// Fragment table capacity fixed at construction.
    max_fragment_count: usize,
    /// Per logical page: the cache entry backing it, if any. Empty for
    /// buffers that can never carry cache pages; otherwise exactly one slot
    /// per page of capacity.
    cache_slots: Vec<Option<Arc<PageCacheEntry>>>,
    /// Sum of fragment sizes.
    total_size: usize,
    /// Logical cursor: all public offsets are applied after it.
    current_offset: usize,
    backing: Backing,
    /// At least one page slot may reference a cache entry.
    cache_backed: bool,
    mapped: Option<VirtualLayout>,
    /// The virtual ranges were allocated here and must be released on free.
    unmap_on_free: bool,
    /// The buffer may grow by whole pages.
    extendable: bool,
    space: MemorySpace,
    /// Descriptor resides in non-paged pool.
    non_paged: bool,
    /// Descriptor storage belongs to the caller.
    structure_not_owned: bool,
    /// Anchor for the descriptor-embedded data of paged buffers; the first
    /// fragment's virtual address points into it.
    #[allow(dead_code)]
    paged_storage: Option<Box<[u8]>>,
}

impl IoBuffer {
    /// A descriptor with no tables and nothing owned.
    fn empty() -> Self {
        Self {
            fragments: Vec::new(),
            max_fragment_count: 0,
            cache_slots: Vec::new(),
            total_size: 0,
            current_offset: 0,
            backing: Backing::Borrowed,
            cache_backed: false,
            mapped: None,
            unmap_on_free: false,
            extendable: false,
            space: MemorySpace::Kernel,
            non_paged: false,
            structure_not_owned: false,
            paged_storage: None,
        }
    }

    /// Total described bytes.
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Bytes remaining past the cursor.
    pub fn size_remaining(&self) -> usize {
        self.total_size - self.current_offset
    }

    /// The cursor: the point at which all I/O begins.
    pub fn current_offset(&self) -> usize {
        self.current_offset
    }

    /// Move the cursor forward.
    pub fn advance(&mut self, bytes: usize) {
        self.current_offset += bytes;
        debug_assert!(self.current_offset <= self.total_size);
    }

    /// Move the cursor backward.
    pub fn rewind(&mut self, bytes: usize) {
        debug_assert!(bytes <= self.current_offset);
        self.current_offset -= bytes;
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    pub fn max_fragment_count(&self) -> usize {
        self.max_fragment_count
    }

    /// Pages of slot capacity for cache-capable buffers, 0 otherwise.
    pub fn page_count(&self) -> usize {
        self.cache_slots.len()
    }

    pub fn backing(&self) -> Backing {
        self.backing
    }

    pub fn space(&self) -> MemorySpace {
        self.space
    }

    pub fn is_cache_backed(&self) -> bool {
        self.cache_backed
    }

    pub fn is_extendable(&self) -> bool {
        self.extendable
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    pub fn is_virtually_contiguous(&self) -> bool {
        self.mapped == Some(VirtualLayout::Contiguous)
    }

    pub fn is_non_paged(&self) -> bool {
        self.non_paged
    }

    pub fn is_structure_owned(&self) -> bool {
        !self.structure_not_owned
    }

    /// Logical page index backing `absolute_offset`. This is the one place
    /// that correlates byte offsets with the page-slot table.
    fn page_index_for_offset(&self, absolute_offset: usize) -> usize {
        absolute_offset >> PAGE_SHIFT
    }

    /// The cache slot at a logical page index, tolerating buffers without a
    /// slot table.
    fn slot(&self, page_index: usize) -> Option<&Arc<PageCacheEntry>> {
        self.cache_slots.get(page_index).and_then(|slot| slot.as_ref())
    }

    /// Locate the fragment containing `absolute_offset`.
    fn fragment_at_offset(&self, absolute_offset: usize) -> Option<(usize, usize)> {
        let mut start = 0;
        for (index, fragment) in self.fragments.iter().enumerate() {
            let end = start + fragment.size;
            if absolute_offset < end {
                return Some((index, absolute_offset - start));
            }

            start = end;
        }

        None
    }

    /// Physical address at `absolute_offset`, without cursor adjustment.
    fn physical_at_absolute(&self, absolute_offset: usize) -> Option<PhysicalAddress> {
        let (index, within) = self.fragment_at_offset(absolute_offset)?;
        self.fragments[index]
            .physical_address
            .map(|pa| pa.offset(within as u64))
    }

    /// Physical address at `offset` past the cursor, or `None` when the
    /// offset is out of range or the fragment has no physical view.
    pub fn physical_address_at(&self, offset: usize) -> Option<PhysicalAddress> {
        self.physical_at_absolute(self.current_offset + offset)
    }

    /// Append one page described by a cache entry, or by a physical address
    /// with an optional mapping. Grows the last fragment when the page
    /// continues it both physically and virtually (or both sides are
    /// unmapped); otherwise opens a new fragment. Always grows the buffer by
    /// exactly one page.
    pub fn append_page(
        &mut self,
        entry: Option<&Arc<PageCacheEntry>>,
        virtual_address: Option<VirtualAddress>,
        physical_address: Option<PhysicalAddress>,
    ) {
        debug_assert!(self.extendable);
        debug_assert!(entry.is_none() || physical_address.is_none());
        debug_assert!(entry.is_none() || !self.cache_slots.is_empty());
        debug_assert!(self.fragments.len() < self.max_fragment_count);
        debug_assert!(is_aligned(self.total_size, PAGE_SIZE));

        let (physical, mapping) = match entry {
            Some(entry) => (entry.physical_address(), entry.virtual_address()),
            None => (
                physical_address.expect("append_page needs a cache entry or a physical address"),
                virtual_address,
            ),
        };

        let merged = match self.fragments.last_mut() {
            Some(last) if last.extends_physically(physical) => {
                let virtually_compatible = match (last.virtual_end(), mapping) {
                    (None, None) => true,
                    (Some(end), Some(va)) => end == va,
                    _ => false,
                };

                if virtually_compatible {
                    last.size += PAGE_SIZE;
                    true
                } else {
                    false
                }
            }
            _ => false,
        };

        if !merged {
            self.fragments.push(Fragment {
                virtual_address: mapping,
                physical_address: Some(physical),
                size: PAGE_SIZE,
            });
        }

        if let Some(entry) = entry {
            debug_assert!(self.cache_backed);
            let page_index = self.page_index_for_offset(self.total_size);
            debug_assert!(page_index < self.cache_slots.len());
            debug_assert!(self.cache_slots[page_index].is_none());
            self.cache_slots[page_index] = Some(Arc::clone(entry));
        }

        self.total_size += PAGE_SIZE;
    }

    /// Associate a cache entry with an already-described page. The entry's
    /// physical address must match the buffer's at that offset.
    pub fn set_page_cache_entry(&mut self, offset: usize, entry: &Arc<PageCacheEntry>) {
        let absolute = self.current_offset + offset;
        debug_assert!(is_aligned(absolute, PAGE_SIZE));
        debug_assert_eq!(self.space, MemorySpace::Kernel);

        let page_index = self.page_index_for_offset(absolute);
        debug_assert!(page_index < self.cache_slots.len());
        debug_assert!(self.cache_slots[page_index].is_none());
        debug_assert_eq!(
            self.physical_at_absolute(absolute),
            Some(entry.physical_address())
        );

        self.cache_slots[page_index] = Some(Arc::clone(entry));
        self.cache_backed = true;
    }

    /// The cache entry backing the page at `offset` past the cursor, if any.
    pub fn page_cache_entry_at(&self, offset: usize) -> Option<&Arc<PageCacheEntry>> {
        if !self.cache_backed {
            return None;
        }

        let absolute = self.current_offset + offset;
        debug_assert!(is_aligned(absolute, PAGE_SIZE));
        debug_assert_eq!(self.space, MemorySpace::Kernel);
        self.slot(self.page_index_for_offset(absolute))
    }
}

impl Drop for IoBuffer {
    fn drop(&mut self) {
        // Cache references release themselves with the slot table. Owned
        // pages, page locks, and mapped ranges need an explicit free().
        let holds_resources = !self.fragments.is_empty()
            && (matches!(self.backing, Backing::Owned | Backing::Locked) || self.unmap_on_free);
        if holds_resources {
            log::warn!(
                "I/O buffer dropped with {} fragments still holding resources; free() it",
                self.fragments.len()
            );
        }
    }
}

static IO_BUFFER_ALIGNMENT: AtomicUsize = AtomicUsize::new(0);

/// Required alignment for buffers that devices flush: the larger of the L1
/// data cache line and any registered external cache line. Snapshotted on
/// first use; racing initializers all compute the same value.
pub fn io_buffer_alignment() -> usize {
    let mut alignment = IO_BUFFER_ALIGNMENT.load(Ordering::Relaxed);
    if alignment == 0 {
        alignment = l1_data_cache_line_size().max(registered_cache_line_size());
        IO_BUFFER_ALIGNMENT.store(alignment, Ordering::Relaxed);
    }

    alignment
}
