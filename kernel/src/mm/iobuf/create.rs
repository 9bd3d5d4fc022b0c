//! I/O buffer constructors
//!
//! Six ways a buffer comes to exist: freshly allocated non-paged memory,
//! paged pool, an empty extendable shell, wrapping existing kernel or user
//! memory (optionally locking it page by page through the pager), an I/O
//! vector array, and caller-storage initialization for single-page stubs.

use alloc::vec;
use alloc::vec::Vec;

use super::{Backing, Fragment, IoBuffer, VirtualLayout, MAX_IO_VECTOR_COUNT};
use crate::error::{KernelError, Result};
use crate::irq;
use crate::mm::virt::{MapFlags, UnmapFlags};
use crate::mm::pager::SectionRange;
use crate::mm::{
    align_down, align_up, MemoryContext, MemorySpace, PhysicalAddress, VirtualAddress, PAGE_SHIFT,
    PAGE_SIZE,
};

/// I/O vectors staged on the stack before the copy needs a heap allocation.
const LOCAL_IO_VECTOR_COUNT: usize = 8;

/// One entry of an I/O vector array, as handed in by vectored I/O syscalls.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IoVec {
    pub base: VirtualAddress,
    pub length: usize,
}

impl IoVec {
    const EMPTY: Self = Self {
        base: VirtualAddress::new(0),
        length: 0,
    };
}

/// Where an I/O vector array lives.
pub enum IoVectorSource<'a> {
    /// Already in kernel memory.
    Kernel(&'a [IoVec]),
    /// In the current process's user memory; copied in before use.
    User { base: VirtualAddress, count: usize },
}

impl IoBuffer {
    /// Allocate memory for use as an I/O buffer. The memory stays mapped
    /// until the buffer is freed.
    ///
    /// `alignment` defaults to the page size and is always rounded up to at
    /// least a page; the size is rounded up to the alignment. May block on
    /// the physical and virtual allocators.
    #[allow(clippy::too_many_arguments)]
    pub fn allocate_non_paged(
        ctx: &MemoryContext<'_>,
        min_physical: PhysicalAddress,
        max_physical: PhysicalAddress,
        alignment: usize,
        size: usize,
        physically_contiguous: bool,
        write_through: bool,
        non_cached: bool,
    ) -> Result<IoBuffer> {
        irq::assert_dispatchable();

        let alignment = if alignment == 0 {
            PAGE_SIZE
        } else {
            align_up(alignment, PAGE_SIZE)
        };

        let aligned_size = align_up(size, alignment);
        let page_count = aligned_size >> PAGE_SHIFT;
        let max_fragment_count = if physically_contiguous { 1 } else { page_count };

        let mut buffer = IoBuffer::empty();
        buffer.fragments = Vec::with_capacity(max_fragment_count);
        buffer.max_fragment_count = max_fragment_count;
        // Any buffer might end up cached later; size the slot table now.
        buffer.cache_slots = vec![None; page_count];
        buffer.total_size = aligned_size;
        buffer.non_paged = true;

        // Reserve a kernel address range covering the whole buffer.
        let base = ctx
            .virt
            .reserve_range(aligned_size, PAGE_SIZE)
            .map_err(|_| KernelError::InsufficientResources)?;

        let mut map_flags = MapFlags::PRESENT | MapFlags::GLOBAL;
        if write_through {
            map_flags |= MapFlags::WRITE_THROUGH;
        }

        if non_cached {
            map_flags |= MapFlags::CACHE_DISABLE;
        }

        // Physically back and map the range. Contiguous buffers are one run;
        // otherwise each run is one alignment unit.
        let run_size = if physically_contiguous {
            aligned_size
        } else {
            alignment
        };

        if let Err(error) = ctx
            .virt
            .map_range(base, aligned_size, alignment, run_size, map_flags)
        {
            ctx.virt.free_range(
                base,
                aligned_size,
                UnmapFlags::FREE_PHYSICAL_PAGES | UnmapFlags::INVALIDATE_TLB,
            );
            return Err(error);
        }

        // Walk the new mappings, coalescing physically contiguous pages.
        if physically_contiguous {
            let physical = ctx.virt.virtual_to_physical(base);
            debug_assert!(physical.is_some());
            buffer.fragments.push(Fragment {
                virtual_address: Some(base),
                physical_address: physical,
                size: aligned_size,
            });
        } else {
            let mut address = base;
            for _ in 0..page_count {
                let physical = ctx.virt.virtual_to_physical(address);
                debug_assert!(physical.is_some());
                if let Some(physical) = physical {
                    match buffer.fragments.last_mut() {
                        Some(last) if last.extends_physically(physical) => {
                            last.size += PAGE_SIZE;
                        }
                        _ => buffer.fragments.push(Fragment {
                            virtual_address: Some(address),
                            physical_address: Some(physical),
                            size: PAGE_SIZE,
                        }),
                    }
                }

                address = address.add(PAGE_SIZE);
            }
        }

        // The allocator takes no physical range; verify afterward and treat
        // a miss as allocation failure.
        if !fragments_within(&buffer.fragments, min_physical, max_physical) {
            ctx.virt.free_range(
                base,
                aligned_size,
                UnmapFlags::FREE_PHYSICAL_PAGES | UnmapFlags::INVALIDATE_TLB,
            );
            return Err(KernelError::NoMemory { pages: page_count });
        }

        buffer.backing = Backing::Owned;
        buffer.mapped = Some(VirtualLayout::Contiguous);
        buffer.unmap_on_free = true;
        log::trace!(
            "iobuf: allocated {} non-paged bytes in {} fragments at {:#x}",
            aligned_size,
            buffer.fragments.len(),
            base.as_u64()
        );

        Ok(buffer)
    }

    /// Allocate a pageable I/O buffer. One fragment, no physical view, data
    /// embedded in the descriptor allocation.
    pub fn allocate_paged(size: usize) -> IoBuffer {
        let storage = vec![0u8; size].into_boxed_slice();
        let address = VirtualAddress::new(storage.as_ptr() as u64);

        let mut buffer = IoBuffer::empty();
        buffer.paged_storage = Some(storage);
        buffer.fragments = Vec::with_capacity(1);
        buffer.fragments.push(Fragment {
            virtual_address: Some(address),
            physical_address: None,
            size,
        });
        buffer.max_fragment_count = 1;
        buffer.total_size = size;
        buffer.mapped = Some(VirtualLayout::Contiguous);
        buffer
    }

    /// Allocate an uninitialized buffer that the caller fills in with pages,
    /// assuming a fragment may be needed for every page of `size` (rounded up
    /// to whole pages). When `cache_backed`, the per-page slot table is sized
    /// too and appended pages may carry cache references.
    pub fn allocate_uninitialized(size: usize, cache_backed: bool) -> IoBuffer {
        let size = align_up(size, PAGE_SIZE);
        let page_count = size >> PAGE_SHIFT;

        let mut buffer = IoBuffer::empty();
        buffer.fragments = Vec::with_capacity(page_count);
        buffer.max_fragment_count = page_count;
        buffer.non_paged = true;
        buffer.extendable = true;
        if cache_backed {
            buffer.cache_slots = vec![None; page_count];
            buffer.cache_backed = true;
            buffer.backing = Backing::CacheBacked;
        }

        buffer
    }

    /// Create an I/O buffer from an existing memory buffer.
    ///
    /// Without `lock_memory` the result is one virtual-only fragment. With
    /// it, every page is brought in and pinned: pageable pages go through the
    /// pager (which may hand back a page-cache reference that the buffer then
    /// holds), non-pageable ones resolve through the translation map. May
    /// block on paging I/O.
    pub fn create(
        ctx: &MemoryContext<'_>,
        memory: VirtualAddress,
        size: usize,
        non_paged: bool,
        lock_memory: bool,
        space: MemorySpace,
    ) -> Result<IoBuffer> {
        irq::assert_dispatchable();

        let end = memory
            .as_u64()
            .checked_add(size as u64)
            .ok_or(KernelError::AccessViolation {
                addr: memory.as_usize(),
            })?;

        match space {
            MemorySpace::Kernel => debug_assert!(ctx.layout.is_kernel(memory)),
            MemorySpace::User => {
                if !ctx.layout.user_range_valid(memory, size) {
                    return Err(KernelError::AccessViolation {
                        addr: memory.as_usize(),
                    });
                }
            }
        }

        let mut buffer = IoBuffer::empty();
        buffer.non_paged = non_paged;
        buffer.space = space;
        buffer.total_size = size;
        buffer.mapped = Some(VirtualLayout::Contiguous);

        if !lock_memory {
            buffer.fragments = Vec::with_capacity(1);
            buffer.max_fragment_count = 1;
            buffer.fragments.push(Fragment {
                virtual_address: Some(memory),
                physical_address: None,
                size,
            });
            return Ok(buffer);
        }

        // Worst case: one fragment per page, and a cache slot for each page
        // the pager hands back from the cache.
        let page_count = (align_up(end as usize, PAGE_SIZE)
            - align_down(memory.as_usize(), PAGE_SIZE))
            >> PAGE_SHIFT;
        buffer.fragments = Vec::with_capacity(page_count);
        buffer.max_fragment_count = page_count;
        buffer.cache_slots = vec![None; page_count];
        buffer.backing = Backing::Locked;

        let end = VirtualAddress::new(end);
        let mut current = memory;
        let mut page_index = 0;
        let mut section: Option<SectionRange> = None;
        while current < end {
            // Refresh the section when there is none or a boundary was just
            // crossed. A miss means the page is non-pageable.
            let need_lookup = match &section {
                Some(range) => range.end() <= current,
                None => true,
            };

            if need_lookup {
                section = ctx.pager.lookup_section(current, space);
            }

            let physical = match &section {
                Some(range) => {
                    debug_assert!(range.base == range.base.page_base());
                    let page_offset =
                        ((current.page_base().as_u64() - range.base.as_u64()) >> PAGE_SHIFT) as usize;
                    match ctx.pager.page_in(range, page_offset) {
                        Ok(locked) => {
                            if let Some(entry) = locked.cache_entry {
                                buffer.cache_slots[page_index] = Some(entry);
                                buffer.cache_backed = true;
                            }

                            // The locked page is page aligned; keep the
                            // sub-page offset of the wrapped address.
                            locked
                                .physical
                                .offset((current.as_u64() - current.page_base().as_u64()) as u64)
                        }
                        Err(KernelError::TryAgain) => continue,
                        Err(error) => {
                            buffer.release_resources(ctx);
                            return Err(error);
                        }
                    }
                }
                None => match ctx.virt.virtual_to_physical(current) {
                    Some(physical) => physical,
                    None => {
                        buffer.release_resources(ctx);
                        return Err(KernelError::InvalidParameter);
                    }
                },
            };

            // Fragment runs to the next page boundary, clipped at the end;
            // only the first and last fragments may be partial pages.
            let next = core::cmp::min(
                align_up(current.as_usize() + 1, PAGE_SIZE) as u64,
                end.as_u64(),
            );
            let fragment_size = (next - current.as_u64()) as usize;
            debug_assert!(fragment_size != 0);

            match buffer.fragments.last_mut() {
                Some(last) if last.extends_physically(physical) => last.size += fragment_size,
                _ => buffer.fragments.push(Fragment {
                    virtual_address: Some(current),
                    physical_address: Some(physical),
                    size: fragment_size,
                }),
            }

            current = VirtualAddress::new(next);
            page_index += 1;
        }

        Ok(buffer)
    }

    /// Create a paged user-mode I/O buffer from an I/O vector array.
    /// Zero-length entries are skipped and abutting entries coalesced.
    pub fn create_from_vector(
        ctx: &MemoryContext<'_>,
        source: IoVectorSource<'_>,
    ) -> Result<IoBuffer> {
        irq::assert_dispatchable();

        let count = match &source {
            IoVectorSource::Kernel(vectors) => vectors.len(),
            IoVectorSource::User { count, .. } => *count,
        };

        if count == 0 || count > MAX_IO_VECTOR_COUNT {
            return Err(KernelError::InvalidParameter);
        }

        let mut local = [IoVec::EMPTY; LOCAL_IO_VECTOR_COUNT];
        let mut heap: Vec<IoVec> = Vec::new();
        let vectors: &[IoVec] = match source {
            IoVectorSource::Kernel(vectors) => vectors,
            IoVectorSource::User { base, count } => {
                let staged: &mut [IoVec] = if count < LOCAL_IO_VECTOR_COUNT {
                    &mut local[..count]
                } else {
                    heap.resize(count, IoVec::EMPTY);
                    &mut heap[..]
                };

                // SAFETY: staged is a live slice of `count` plain-old-data
                // IoVecs; viewing it as bytes for the user copy is sound.
                let bytes = unsafe {
                    core::slice::from_raw_parts_mut(
                        staged.as_mut_ptr().cast::<u8>(),
                        count * core::mem::size_of::<IoVec>(),
                    )
                };
                ctx.user.copy_from_user(bytes, base)?;
                staged
            }
        };

        let mut buffer = IoBuffer::empty();
        buffer.fragments = Vec::with_capacity(count);
        buffer.max_fragment_count = count;
        buffer.space = MemorySpace::User;
        buffer.mapped = Some(VirtualLayout::Scattered);

        let mut total = 0;
        for vector in vectors {
            if !ctx.layout.user_range_valid(vector.base, vector.length) {
                return Err(KernelError::AccessViolation {
                    addr: vector.base.as_usize(),
                });
            }

            if vector.length == 0 {
                continue;
            }

            match buffer.fragments.last_mut() {
                Some(last) if last.virtual_end() == Some(vector.base) => {
                    last.size += vector.length;
                }
                _ => buffer.fragments.push(Fragment {
                    virtual_address: Some(vector.base),
                    physical_address: None,
                    size: vector.length,
                }),
            }

            total += vector.length;
        }

        buffer.total_size = total;
        Ok(buffer)
    }

    /// Initialize a single-fragment I/O buffer in caller storage from a
    /// virtual/physical address pair. The range must span at most one page.
    /// The returned descriptor is marked as caller-owned storage.
    pub fn init_in_place(
        ctx: &MemoryContext<'_>,
        virtual_address: Option<VirtualAddress>,
        physical_address: Option<PhysicalAddress>,
        size: usize,
        cache_backed: bool,
        memory_locked: bool,
    ) -> IoBuffer {
        let base = virtual_address.map_or(0, |va| va.as_usize());
        debug_assert!(
            align_up(base + size, PAGE_SIZE) - align_down(base, PAGE_SIZE) <= PAGE_SIZE,
            "in-place buffers span at most one page"
        );

        let mut buffer = IoBuffer::empty();
        buffer.structure_not_owned = true;
        buffer.fragments = Vec::with_capacity(1);
        buffer.max_fragment_count = 1;

        if cache_backed {
            buffer.cache_slots = vec![None; 1];
            buffer.cache_backed = true;
            buffer.extendable = true;
            buffer.backing = Backing::CacheBacked;
        } else if memory_locked {
            buffer.backing = Backing::Locked;
        }

        let mut physical = physical_address;
        if let Some(address) = virtual_address {
            buffer.mapped = Some(VirtualLayout::Contiguous);
            if physical.is_none() {
                physical = ctx.virt.virtual_to_physical(address);
                debug_assert!(physical.is_some());
            }
        }

        if let Some(physical) = physical {
            debug_assert!(size != 0);
            buffer.total_size = size;
            buffer.fragments.push(Fragment {
                virtual_address,
                physical_address: Some(physical),
                size,
            });
        }

        buffer
    }
}

/// Whether every fragment's physical run lies inside `[min, max)`.
fn fragments_within(
    fragments: &[Fragment],
    min_physical: PhysicalAddress,
    max_physical: PhysicalAddress,
) -> bool {
    fragments.iter().all(|fragment| {
        match fragment.physical_address {
            Some(pa) => {
                pa >= min_physical
                    && pa
                        .as_u64()
                        .checked_add(fragment.size as u64)
                        .is_some_and(|end| end <= max_physical.as_u64())
            }
            None => false,
        }
    })
}
