//! Mapping and unmapping of I/O buffers
//!
//! Mapping is lazy: constructors leave cache-backed and extended pages
//! unmapped, and the data movers call [`IoBuffer::map`] on demand. Unmapping
//! is cache-aware: a page whose virtual address matches its cache entry's
//! published hint belongs to the cache and outlives the buffer.

use alloc::vec::Vec;

use super::{IoBuffer, VirtualLayout};
use crate::error::{KernelError, Result};
use crate::irq;
use crate::mm::virt::{MapFlags, UnmapFlags};
use crate::mm::{is_aligned, MemoryContext, MemorySpace, VirtualAddress, PAGE_SHIFT, PAGE_SIZE};

impl IoBuffer {
    /// Ensure the buffer is mapped, virtually contiguously when asked.
    ///
    /// Fast paths: a buffer whose fragments already satisfy the request only
    /// has its state updated. A contiguous request over a buffer mapped
    /// non-contiguously releases the old mappings and re-maps everything
    /// into one range. Otherwise only runs of unmapped fragments get fresh
    /// ranges; already-mapped fragments are left alone. May block on the
    /// virtual allocator.
    pub fn map(
        &mut self,
        ctx: &MemoryContext<'_>,
        write_through: bool,
        non_cached: bool,
        virtually_contiguous: bool,
    ) -> Result<()> {
        irq::assert_dispatchable();
        debug_assert!(!self.fragments.is_empty());

        if virtually_contiguous {
            if self.mapped == Some(VirtualLayout::Contiguous) {
                debug_assert!(self.is_buffer_mapped(true));
                return Ok(());
            }

            if self.is_buffer_mapped(true) {
                self.mapped = Some(VirtualLayout::Contiguous);
                return Ok(());
            }
        } else {
            if self.mapped.is_some() {
                debug_assert!(self.is_buffer_mapped(false));
                return Ok(());
            }

            if self.is_buffer_mapped(false) {
                self.mapped = Some(VirtualLayout::Scattered);
                return Ok(());
            }
        }

        // User buffers arrive mapped; this routine never allocates user
        // addresses.
        if self.space == MemorySpace::User {
            return Err(KernelError::InvalidParameter);
        }

        let mut flags = MapFlags::PRESENT | MapFlags::GLOBAL;
        if write_through {
            flags |= MapFlags::WRITE_THROUGH;
        }

        if non_cached {
            flags |= MapFlags::CACHE_DISABLE;
        }

        if virtually_contiguous {
            // Release scattered mappings before covering the whole buffer
            // with one range.
            if self.mapped.is_some() {
                self.unmap_internal(ctx);
            }

            self.map_fragment_run(ctx, 0, self.fragments.len(), flags)?;
            self.mapped = Some(VirtualLayout::Contiguous);
        } else {
            // Batch consecutive unmapped fragments into one range each.
            let mut completed: Vec<(usize, usize, VirtualAddress, usize)> = Vec::new();
            let mut run_start = 0;
            let mut in_run = false;
            for index in 0..=self.fragments.len() {
                let mapped_here = match self.fragments.get(index) {
                    Some(fragment) => fragment.virtual_address.is_some(),
                    None => true,
                };

                if mapped_here {
                    if in_run {
                        let count = index - run_start;
                        match self.map_fragment_run(ctx, run_start, count, flags) {
                            Ok((base, size)) => completed.push((run_start, count, base, size)),
                            Err(error) => {
                                // Unwind the ranges this call reserved.
                                for (start, count, base, size) in completed {
                                    for fragment in &mut self.fragments[start..start + count] {
                                        fragment.virtual_address = None;
                                    }

                                    ctx.virt.free_range(base, size, UnmapFlags::INVALIDATE_TLB);
                                }

                                return Err(error);
                            }
                        }

                        in_run = false;
                    }
                } else if !in_run {
                    run_start = index;
                    in_run = true;
                }
            }

            self.mapped = Some(VirtualLayout::Scattered);
        }

        self.unmap_on_free = true;
        self.publish_cache_hints();
        Ok(())
    }

    /// Map `count` fragments starting at `start` into one fresh range.
    /// Returns the reserved range.
    fn map_fragment_run(
        &mut self,
        ctx: &MemoryContext<'_>,
        start: usize,
        count: usize,
        flags: MapFlags,
    ) -> Result<(VirtualAddress, usize)> {
        debug_assert!(count != 0);
        debug_assert!(start + count <= self.fragments.len());

        let size: usize = self.fragments[start..start + count]
            .iter()
            .map(|fragment| fragment.size)
            .sum();
        debug_assert!(size != 0);
        debug_assert!(is_aligned(size, PAGE_SIZE));

        let base = ctx
            .virt
            .reserve_range(size, PAGE_SIZE)
            .map_err(|_| KernelError::InsufficientResources)?;

        let mut address = base;
        for fragment in &mut self.fragments[start..start + count] {
            let physical = fragment
                .physical_address
                .expect("only physically described fragments can be mapped");
            debug_assert!(physical.is_page_aligned());
            debug_assert!(is_aligned(fragment.size, PAGE_SIZE));

            fragment.virtual_address = Some(address);
            let mut offset = 0u64;
            while offset < fragment.size as u64 {
                ctx.virt.map_page(physical.offset(offset), address, flags);
                address = address.add(PAGE_SIZE);
                offset += PAGE_SIZE as u64;
            }
        }

        Ok((base, size))
    }

    /// Offer this buffer's addresses to cache entries that have none yet.
    /// Losing the publication race is fine; the loser keeps its own mapping.
    fn publish_cache_hints(&self) {
        if !self.cache_backed {
            return;
        }

        let mut page_index = 0;
        for fragment in &self.fragments {
            debug_assert!(is_aligned(fragment.size, PAGE_SIZE));
            let pages = fragment.size >> PAGE_SHIFT;
            for page in 0..pages {
                if let (Some(entry), Some(address)) = (self.slot(page_index), fragment.virtual_address) {
                    let _ = entry.publish_virtual_address(address.add(page << PAGE_SHIFT));
                }

                page_index += 1;
            }
        }
    }

    /// Whether every fragment is mapped, and adjacently when asked.
    pub(crate) fn is_buffer_mapped(&self, virtually_contiguous: bool) -> bool {
        let mut expected = match self.fragments.first().and_then(|f| f.virtual_address) {
            Some(address) => address,
            None => return false,
        };

        for fragment in &self.fragments {
            match fragment.virtual_address {
                None => return false,
                Some(address) => {
                    if virtually_contiguous && address != expected {
                        return false;
                    }

                    expected = address.add(fragment.size);
                }
            }
        }

        true
    }

    /// Release the buffer's mappings.
    ///
    /// Cache-backed buffers are walked page by page: an address that matches
    /// its cache entry's hint is owned by the cache and skipped; everything
    /// else coalesces into maximal runs, each released with one range free.
    /// Fragment virtual addresses are stale afterward; callers either
    /// rewrite them (contiguous remap) or discard the buffer.
    pub(crate) fn unmap_internal(&mut self, ctx: &MemoryContext<'_>) {
        debug_assert!(self.unmap_on_free);

        fn flush(ctx: &MemoryContext<'_>, range: (u64, u64)) {
            ctx.virt.free_range(
                VirtualAddress::new(range.0),
                (range.1 - range.0) as usize,
                UnmapFlags::INVALIDATE_TLB,
            );
        }

        let cache_aware = self.cache_backed;
        let mut pending: Option<(u64, u64)> = None;
        let mut page_index = 0;
        for fragment in &self.fragments {
            let base = match fragment.virtual_address {
                Some(address) => address,
                None => {
                    // Keep the slot walk aligned with the fragment walk.
                    if cache_aware {
                        page_index += fragment.size >> PAGE_SHIFT;
                    }

                    continue;
                }
            };

            if cache_aware {
                debug_assert!(is_aligned(fragment.size, PAGE_SIZE));
                let pages = fragment.size >> PAGE_SHIFT;
                for page in 0..pages {
                    let address = base.add(page << PAGE_SHIFT).as_u64();
                    let cache_owned = self
                        .slot(page_index)
                        .and_then(|entry| entry.virtual_address())
                        .is_some_and(|hint| hint.as_u64() == address);
                    page_index += 1;

                    if cache_owned {
                        // The cache keeps this mapping.
                        if let Some(range) = pending.take() {
                            flush(ctx, range);
                        }

                        continue;
                    }

                    match &mut pending {
                        Some((_, end)) if *end == address => *end += PAGE_SIZE as u64,
                        Some(range) => {
                            let done = *range;
                            *range = (address, address + PAGE_SIZE as u64);
                            flush(ctx, done);
                        }
                        None => pending = Some((address, address + PAGE_SIZE as u64)),
                    }
                }
            } else {
                let start = base.as_u64();
                let end = start + fragment.size as u64;
                match &mut pending {
                    Some((_, pending_end)) if *pending_end == start => *pending_end = end,
                    Some(range) => {
                        let done = *range;
                        *range = (start, end);
                        flush(ctx, done);
                    }
                    None => pending = Some((start, end)),
                }
            }
        }

        if let Some(range) = pending {
            flush(ctx, range);
        }

        self.mapped = None;
        self.unmap_on_free = false;
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::super::testutil::TestEnv;
    use super::*;
    use crate::mm::{PhysicalAddress, PAGE_SIZE};

    #[test]
    fn test_map_scattered_then_contiguous() {
        let env = TestEnv::new();
        let ctx = env.ctx();

        let mut buffer = IoBuffer::allocate_uninitialized(2 * PAGE_SIZE, false);
        buffer.append_page(None, None, Some(PhysicalAddress::new(0x10000)));
        buffer.append_page(None, None, Some(PhysicalAddress::new(0x20000)));
        assert!(!buffer.is_mapped());

        buffer
            .map(&ctx, false, false, false)
            .expect("mapping two fragments should succeed");
        assert!(buffer.is_mapped());
        assert!(!buffer.is_virtually_contiguous());
        assert!(buffer.fragments().iter().all(|f| f.virtual_address.is_some()));

        buffer
            .map(&ctx, false, false, true)
            .expect("contiguous remap should succeed");
        assert!(buffer.is_virtually_contiguous());
        let first = buffer.fragments()[0];
        let second = buffer.fragments()[1];
        assert_eq!(first.virtual_end(), second.virtual_address);

        // The scattered ranges were released by the remap; only the
        // contiguous one remains.
        assert_eq!(env.space.reserved_bytes_outstanding(), 2 * PAGE_SIZE);

        buffer.free(&ctx);
        assert_eq!(env.space.reserved_bytes_outstanding(), 0);
    }

    #[test]
    fn test_map_is_idempotent_and_lazy() {
        let env = TestEnv::new();
        let ctx = env.ctx();

        let memory = vec![0u8; PAGE_SIZE];
        let base = crate::mm::VirtualAddress::new(memory.as_ptr() as u64);
        let mut wrapped = IoBuffer::create(&ctx, base, PAGE_SIZE, true, false, crate::mm::MemorySpace::Kernel)
            .expect("wrap should succeed");

        // Already virtually contiguous: both requests are no-ops.
        wrapped
            .map(&ctx, false, false, true)
            .expect("fast path should succeed");
        wrapped
            .map(&ctx, false, false, false)
            .expect("fast path should succeed");
        assert_eq!(env.space.reserved_bytes_outstanding(), 0);

        wrapped.free(&ctx);
    }

    #[test]
    fn test_map_batches_only_unmapped_runs() {
        let env = TestEnv::new();
        let ctx = env.ctx();

        let mut buffer = IoBuffer::allocate_uninitialized(3 * PAGE_SIZE, false);
        buffer.append_page(None, None, Some(PhysicalAddress::new(0x10000)));
        buffer.append_page(
            None,
            Some(VirtualAddress::new(0x7700_0000)),
            Some(PhysicalAddress::new(0x30000)),
        );
        buffer.append_page(None, None, Some(PhysicalAddress::new(0x50000)));
        assert_eq!(buffer.fragment_count(), 3);

        buffer
            .map(&ctx, false, false, false)
            .expect("mapping the unmapped runs should succeed");

        // The pre-mapped middle fragment kept its address.
        assert_eq!(
            buffer.fragments()[1].virtual_address,
            Some(VirtualAddress::new(0x7700_0000))
        );
        // Two separate ranges were reserved for fragments 0 and 2.
        assert_eq!(env.space.reserved_bytes_outstanding(), 2 * PAGE_SIZE);

        // A contiguity request now releases those and re-maps everything
        // into a single range.
        buffer
            .map(&ctx, false, false, true)
            .expect("contiguous remap should succeed");
        assert!(buffer.is_virtually_contiguous());
        assert!(buffer.is_buffer_mapped(true));
        assert_eq!(env.space.reserved_bytes_outstanding(), 3 * PAGE_SIZE);

        buffer.free(&ctx);
        assert_eq!(env.space.reserved_bytes_outstanding(), 0);
    }

    #[test]
    fn test_map_flags_reach_the_mapper() {
        let env = TestEnv::new();
        let ctx = env.ctx();

        let mut buffer = IoBuffer::allocate_uninitialized(PAGE_SIZE, false);
        buffer.append_page(None, None, Some(PhysicalAddress::new(0x10000)));
        buffer
            .map(&ctx, true, true, false)
            .expect("mapping should succeed");

        let address = buffer.fragments()[0]
            .virtual_address
            .expect("fragment was just mapped");
        let flags = env
            .space
            .mapping_flags(address)
            .expect("translation should exist");
        assert!(flags.contains(MapFlags::PRESENT | MapFlags::GLOBAL));
        assert!(flags.contains(MapFlags::WRITE_THROUGH));
        assert!(flags.contains(MapFlags::CACHE_DISABLE));

        buffer.free(&ctx);
    }

    #[test]
    fn test_map_rejects_user_buffers_that_need_mapping() {
        let mut env = TestEnv::new();
        env.layout = TestEnv::user_layout();
        let ctx = env.ctx();

        let vectors = [super::super::IoVec {
            base: VirtualAddress::new(0x1000),
            length: 100,
        }];
        let mut buffer =
            IoBuffer::create_from_vector(&ctx, super::super::IoVectorSource::Kernel(&vectors))
                .expect("vector creation should succeed");

        // Scattered is satisfied (VA-only fragments are mapped), but a
        // contiguity request would need kernel addresses.
        buffer
            .map(&ctx, false, false, false)
            .expect("user buffers are already mapped");
        let err = buffer
            .map(&ctx, false, false, true)
            .expect_err("contiguous mapping of a user buffer must be rejected");
        assert_eq!(err, KernelError::InvalidParameter);

        buffer.free(&ctx);
    }

    #[test]
    fn test_mapping_publishes_hints_only_to_empty_entries() {
        let env = TestEnv::new();
        let ctx = env.ctx();

        let hinted = crate::mm::page_cache::PageCacheEntry::new_mapped(
            PhysicalAddress::new(0x10000),
            VirtualAddress::new(0x6600_0000),
        );
        let unhinted = env.cache_entry(PhysicalAddress::new(0x30000));

        let mut buffer = IoBuffer::allocate_uninitialized(2 * PAGE_SIZE, true);
        buffer.append_page(Some(&hinted), None, None);
        buffer.append_page(Some(&unhinted), None, None);

        buffer
            .map(&ctx, false, false, false)
            .expect("mapping cache pages should succeed");

        // The empty hint was filled with this buffer's address.
        let second_va = buffer.fragments()[1].virtual_address;
        assert_eq!(unhinted.virtual_address(), second_va);
        // The existing hint was never overwritten.
        assert_eq!(
            hinted.virtual_address(),
            Some(VirtualAddress::new(0x6600_0000))
        );

        buffer.free(&ctx);
    }

    #[test]
    fn test_unmap_skips_cache_owned_addresses() {
        let env = TestEnv::new();
        let ctx = env.ctx();

        let first = env.cache_entry(PhysicalAddress::new(0x10000));
        let second = env.cache_entry(PhysicalAddress::new(0x30000));

        let mut buffer = IoBuffer::allocate_uninitialized(2 * PAGE_SIZE, true);
        buffer.append_page(Some(&first), None, None);
        buffer.append_page(Some(&second), None, None);
        buffer
            .map(&ctx, false, false, false)
            .expect("mapping should succeed");

        // Both hints were published, so both pages now belong to the cache.
        assert_eq!(env.space.reserved_bytes_outstanding(), 2 * PAGE_SIZE);
        buffer.free(&ctx);
        assert_eq!(env.space.reserved_bytes_outstanding(), 2 * PAGE_SIZE);
    }

    #[test]
    fn test_unmap_frees_addresses_the_cache_does_not_own() {
        let env = TestEnv::new();
        let ctx = env.ctx();

        // This entry already has a mapping elsewhere, so the buffer's own
        // mapping of it is released on free.
        let foreign = crate::mm::page_cache::PageCacheEntry::new_mapped(
            PhysicalAddress::new(0x10000),
            VirtualAddress::new(0x6600_0000),
        );
        let adopted = env.cache_entry(PhysicalAddress::new(0x30000));

        let mut buffer = IoBuffer::allocate_uninitialized(2 * PAGE_SIZE, true);
        buffer.append_page(Some(&foreign), None, None);
        buffer.append_page(Some(&adopted), None, None);
        buffer
            .map(&ctx, false, false, false)
            .expect("mapping should succeed");

        buffer.free(&ctx);
        // The adopted page's address stays with the cache; the foreign
        // page's mapping was released.
        assert_eq!(env.space.reserved_bytes_outstanding(), PAGE_SIZE);
    }
}
