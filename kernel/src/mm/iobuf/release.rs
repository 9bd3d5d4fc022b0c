//! I/O buffer teardown
//!
//! All per-page ownership decisions happen here and nowhere else: owned
//! pages are freed unless a cache entry borrowed the slot, purely
//! cache-backed pages must carry an entry, and locked pages are either
//! released to the cache or unlocked. Cache references themselves are
//! `Arc`s in the slot table and release when the slots clear.

use super::{Backing, IoBuffer};
use crate::mm::{is_aligned, pages_for, MemoryContext, MemorySpace, PAGE_SHIFT, PAGE_SIZE};

impl IoBuffer {
    /// Destroy the buffer. Memory allocated with the buffer is released;
    /// borrowed memory is unlocked or returned to the cache per page.
    pub fn free(mut self, ctx: &MemoryContext<'_>) {
        self.release_resources(ctx);
    }

    /// Release the buffer's resources and clear its mutable state for
    /// re-use. The fragment and slot tables keep their capacity; the
    /// buffer's nature (backing class, extendability) is preserved.
    pub fn reset(&mut self, ctx: &MemoryContext<'_>) {
        debug_assert_ne!(self.space, MemorySpace::User);
        self.release_resources(ctx);
    }

    /// Release mappings, pages, locks, and cache references. Leaves the
    /// descriptor empty but structurally intact.
    pub(crate) fn release_resources(&mut self, ctx: &MemoryContext<'_>) {
        self.current_offset = 0;

        if self.unmap_on_free {
            self.unmap_internal(ctx);
        }

        match self.backing {
            Backing::Owned => {
                // Free each page unless a cache entry holds the slot; the
                // cache decides that page's fate when the reference drops.
                let mut page_index = 0;
                for fragment in &self.fragments {
                    debug_assert!(is_aligned(fragment.size, PAGE_SIZE));
                    let physical = match fragment.physical_address {
                        Some(physical) => physical,
                        None => continue,
                    };
                    debug_assert!(physical.is_page_aligned());

                    for page in 0..(fragment.size >> PAGE_SHIFT) {
                        if self.slot(page_index).is_none() {
                            ctx.phys
                                .free_page(physical.offset((page as u64) << PAGE_SHIFT));
                        }

                        page_index += 1;
                    }
                }
            }
            Backing::CacheBacked => {
                // Every page must carry an entry; the references drop with
                // the slot table below.
                let mut page_index = 0;
                for fragment in &self.fragments {
                    debug_assert!(is_aligned(fragment.size, PAGE_SIZE));
                    for _ in 0..(fragment.size >> PAGE_SHIFT) {
                        debug_assert!(
                            self.slot(page_index).is_some(),
                            "cache-backed page without a cache entry"
                        );
                        page_index += 1;
                    }
                }
            }
            Backing::Locked => {
                // The first fragment's physical address may start mid-page:
                // round down and cover the whole span.
                let mut page_index = 0;
                for fragment in &self.fragments {
                    let physical = match fragment.physical_address {
                        Some(physical) => physical,
                        None => {
                            page_index += pages_for(fragment.size);
                            continue;
                        }
                    };

                    let base = physical.page_base();
                    let pages = pages_for(fragment.size + physical.page_offset());
                    for page in 0..pages {
                        if self.slot(page_index).is_none() {
                            ctx.phys
                                .unlock_pages(base.offset((page as u64) << PAGE_SHIFT), 1);
                        }

                        page_index += 1;
                    }
                }
            }
            Backing::Borrowed => {}
        }

        // Dropping the slots releases the cache references.
        for slot in self.cache_slots.iter_mut() {
            *slot = None;
        }

        self.fragments.clear();
        self.total_size = 0;
        self.mapped = None;
        self.unmap_on_free = false;
    }
}
