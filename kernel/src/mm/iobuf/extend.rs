//! Extension and device validation
//!
//! Extension appends freshly allocated physical pages to an extendable
//! buffer, in whole-page units. Validation checks a buffer against a
//! device's DMA constraints (physical range, alignment, contiguity) and,
//! when the buffer cannot satisfy them, hands back a fresh one that does;
//! re-staging the data is the caller's business.

use alloc::vec::Vec;

use super::{Backing, Fragment, IoBuffer};
use crate::error::{KernelError, Result};
use crate::irq;
use crate::mm::{
    align_up, is_aligned, pages_for, MemoryContext, MemorySpace, PhysicalAddress, PAGE_SHIFT,
    PAGE_SIZE,
};

/// Whether `[base, base + size)` lies inside `[min, max)`.
fn run_within(
    base: PhysicalAddress,
    size: usize,
    min_physical: PhysicalAddress,
    max_physical: PhysicalAddress,
) -> bool {
    base >= min_physical
        && base
            .as_u64()
            .checked_add(size as u64)
            .is_some_and(|end| end <= max_physical.as_u64())
}

impl IoBuffer {
    /// Grow the buffer by `ceil(size / page)` pages of freshly allocated
    /// physical memory, appended to the last fragment where physically
    /// possible. Legal only on extendable buffers. On success the buffer
    /// owns pages and is no longer considered mapped; on failure nothing
    /// changes. May block on the physical allocator.
    pub fn extend(
        &mut self,
        ctx: &MemoryContext<'_>,
        min_physical: PhysicalAddress,
        max_physical: PhysicalAddress,
        alignment: usize,
        size: usize,
        physically_contiguous: bool,
    ) -> Result<()> {
        irq::assert_dispatchable();
        debug_assert!(self.extendable);

        // Worst case, every new page needs its own fragment.
        let page_count = pages_for(size);
        let available = self.max_fragment_count - self.fragments.len();
        if page_count > available {
            return Err(KernelError::BufferTooSmall {
                required: page_count,
                available,
            });
        }

        let original_total = self.total_size;
        let original_count = self.fragments.len();
        let original_last_size = self.fragments.last().map(|fragment| fragment.size);

        let mut appended: Vec<PhysicalAddress> = Vec::new();
        let outcome = self.extend_append(
            ctx,
            min_physical,
            max_physical,
            alignment,
            page_count,
            physically_contiguous,
            &mut appended,
        );

        if let Err(error) = outcome {
            for page in appended {
                ctx.phys.free_page(page);
            }

            self.fragments.truncate(original_count);
            if let (Some(size), Some(last)) = (original_last_size, self.fragments.last_mut()) {
                last.size = size;
            }

            self.total_size = original_total;
            return Err(error);
        }

        // The appended pages are not mapped, so the buffer as a whole no
        // longer is; and it now owns memory that must be freed on release.
        self.mapped = None;
        self.backing = Backing::Owned;
        log::trace!(
            "iobuf: extended by {} pages to {} bytes",
            page_count,
            self.total_size
        );

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn extend_append(
        &mut self,
        ctx: &MemoryContext<'_>,
        min_physical: PhysicalAddress,
        max_physical: PhysicalAddress,
        alignment: usize,
        page_count: usize,
        physically_contiguous: bool,
        appended: &mut Vec<PhysicalAddress>,
    ) -> Result<()> {
        if physically_contiguous {
            let run = ctx
                .phys
                .allocate_pages(page_count, alignment)
                .ok_or(KernelError::NoMemory { pages: page_count })?;
            if !run_within(run, page_count << PAGE_SHIFT, min_physical, max_physical) {
                for page in 0..page_count {
                    ctx.phys.free_page(run.offset((page as u64) << PAGE_SHIFT));
                }

                return Err(KernelError::NoMemory { pages: page_count });
            }

            for page in 0..page_count {
                appended.push(run.offset((page as u64) << PAGE_SHIFT));
            }

            self.append_owned_run(run, page_count << PAGE_SHIFT);
            self.total_size += page_count << PAGE_SHIFT;
        } else {
            for _ in 0..page_count {
                let page = ctx
                    .phys
                    .allocate_pages(1, alignment)
                    .ok_or(KernelError::NoMemory { pages: 1 })?;
                if !run_within(page, PAGE_SIZE, min_physical, max_physical) {
                    ctx.phys.free_page(page);
                    return Err(KernelError::NoMemory { pages: 1 });
                }

                appended.push(page);
                self.append_owned_run(page, PAGE_SIZE);
                self.total_size += PAGE_SIZE;
            }
        }

        Ok(())
    }

    /// Attach a fresh physical run to the last fragment when it is unmapped
    /// and physically adjacent; otherwise open a new fragment.
    fn append_owned_run(&mut self, base: PhysicalAddress, size: usize) {
        match self.fragments.last_mut() {
            Some(last) if last.virtual_address.is_none() && last.extends_physically(base) => {
                last.size += size;
            }
            _ => {
                debug_assert!(self.fragments.len() < self.max_fragment_count);
                self.fragments.push(Fragment {
                    virtual_address: None,
                    physical_address: Some(base),
                    size,
                });
            }
        }
    }

    /// Validate the buffer for a device transfer of `size` bytes starting at
    /// the cursor. When the described pages cannot satisfy the constraints
    /// (user-mode memory, physical range, alignment, contiguity), a fresh
    /// non-paged buffer satisfying them is returned in place of this one;
    /// the caller re-stages data into it. A satisfiable shortfall on an
    /// extendable buffer is extended in place.
    pub fn validate(
        &mut self,
        ctx: &MemoryContext<'_>,
        min_physical: PhysicalAddress,
        max_physical: PhysicalAddress,
        alignment: usize,
        size: usize,
        physically_contiguous: bool,
    ) -> Result<Option<IoBuffer>> {
        let alignment = alignment.max(1);

        // A buffer that cannot fit the transfer and cannot grow is a hard
        // failure, not a replacement.
        if !self.extendable && self.current_offset + size > self.total_size {
            return Err(KernelError::BufferTooSmall {
                required: size,
                available: self.size_remaining(),
            });
        }

        // DMA cannot reach user-mode pages.
        let mut needs_replacement = self.space == MemorySpace::User;

        // Check the described pages, unless the cursor sits at the end (a
        // pure extension).
        if !needs_replacement && self.current_offset != self.total_size {
            let end = (self.current_offset + size).min(self.total_size);
            let mut offset = self.current_offset;
            let mut previous_end = None;
            while offset < end {
                let (index, within) = self
                    .fragment_at_offset(offset)
                    .expect("offset is below total_size");
                let fragment = &self.fragments[index];

                let start = match fragment.physical_address {
                    Some(physical) => physical.offset(within as u64),
                    None => {
                        needs_replacement = true;
                        break;
                    }
                };

                if physically_contiguous
                    && previous_end.is_some()
                    && previous_end != Some(start)
                {
                    needs_replacement = true;
                    break;
                }

                // The window runs to the fragment's end even when the
                // transfer stops short of it.
                let window = fragment.size - within;
                if !is_aligned(start.as_usize(), alignment) || !is_aligned(window, alignment) {
                    needs_replacement = true;
                    break;
                }

                let window_end = start.offset(window as u64);
                if start < min_physical || window_end.as_u64() > max_physical.as_u64() {
                    needs_replacement = true;
                    break;
                }

                previous_end = Some(window_end);
                offset += window;
            }
        }

        // The described pages pass; grow the buffer if the transfer needs
        // more bytes than it holds.
        if !needs_replacement
            && self.extendable
            && self.current_offset + size > self.total_size
        {
            // An extension can only be physically contiguous with the rest
            // if it starts at the very end.
            if physically_contiguous && self.current_offset != self.total_size {
                needs_replacement = true;
            } else {
                let shortfall = self.current_offset + size - self.total_size;
                self.extend(
                    ctx,
                    min_physical,
                    max_physical,
                    alignment,
                    shortfall,
                    physically_contiguous,
                )?;
                return Ok(None);
            }
        }

        if needs_replacement {
            let replacement = IoBuffer::allocate_non_paged(
                ctx,
                min_physical,
                max_physical,
                alignment,
                size,
                physically_contiguous,
                false,
                false,
            )?;
            return Ok(Some(replacement));
        }

        Ok(None)
    }

    /// Validate a buffer for a cached I/O of `size` bytes: it must exist, be
    /// cache-backed and extendable, have its cursor aligned at end-of-buffer,
    /// and have fragment slots for the extension. Otherwise a fresh
    /// uninitialized cache-backed buffer (sized up to `alignment`) is
    /// returned in its place.
    pub fn validate_for_cached_io(
        buffer: Option<&IoBuffer>,
        size: usize,
        alignment: usize,
    ) -> Result<Option<IoBuffer>> {
        let alignment = alignment.max(1);
        let needs_new = match buffer {
            None => true,
            Some(buffer) => {
                if !buffer.cache_backed || !buffer.extendable {
                    true
                } else if !is_aligned(buffer.current_offset, alignment)
                    || buffer.current_offset != buffer.total_size
                {
                    true
                } else {
                    pages_for(size) > buffer.max_fragment_count - buffer.fragments.len()
                }
            }
        };

        if needs_new {
            let size = align_up(size, alignment);
            return Ok(Some(IoBuffer::allocate_uninitialized(size, true)));
        }

        Ok(None)
    }
}
