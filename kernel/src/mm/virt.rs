//! Kernel virtual address space seam
//!
//! The I/O buffer subsystem reserves and releases kernel address ranges and
//! installs page mappings through the [`VirtualSpace`] trait.
//! [`KernelAddressSpace`] is the reference implementation: a reservation
//! accountant plus a software translation map. Reservations are backed by
//! real allocations, so addresses handed out here are dereferenceable — this
//! is what lets mapped buffers move actual bytes in host unit tests.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;
use spin::Mutex;

use super::{align_up, is_aligned, PhysicalAddress, PhysicalAllocator, VirtualAddress, PAGE_SHIFT, PAGE_SIZE};
use crate::error::{KernelError, Result};

bitflags! {
    /// Attributes applied when installing a page mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const PRESENT = 1 << 0;
        const GLOBAL = 1 << 1;
        const WRITE_THROUGH = 1 << 2;
        const CACHE_DISABLE = 1 << 3;
    }
}

bitflags! {
    /// Options for releasing an address range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UnmapFlags: u32 {
        /// Also free the physical pages mapped within the range.
        const FREE_PHYSICAL_PAGES = 1 << 0;
        /// Invalidate stale translations on other processors.
        const INVALIDATE_TLB = 1 << 1;
    }
}

/// Contract between the memory manager's I/O paths and the kernel virtual
/// address space.
pub trait VirtualSpace: Sync {
    /// Reserve `size` bytes of kernel address space aligned to `alignment`.
    fn reserve_range(&self, size: usize, alignment: usize) -> Result<VirtualAddress>;

    /// Release `[base, base + size)`. The range may cover any part of one or
    /// more prior reservations.
    fn free_range(&self, base: VirtualAddress, size: usize, flags: UnmapFlags);

    /// Install a translation for one page.
    fn map_page(&self, page: PhysicalAddress, at: VirtualAddress, flags: MapFlags);

    /// Back `[base, base + size)` with freshly allocated physical runs of
    /// `run_size` bytes, each aligned to `run_alignment`, and map them.
    /// On failure nothing remains mapped or allocated.
    fn map_range(
        &self,
        base: VirtualAddress,
        size: usize,
        run_alignment: usize,
        run_size: usize,
        flags: MapFlags,
    ) -> Result<()>;

    /// Translate a mapped kernel virtual address.
    fn virtual_to_physical(&self, address: VirtualAddress) -> Option<PhysicalAddress>;
}

struct Reservation {
    size: usize,
    /// Bytes of this reservation released so far.
    freed: usize,
    /// Keeps the reserved bytes alive and dereferenceable.
    _backing: Vec<u8>,
}

#[derive(Default)]
struct SpaceInner {
    /// Aligned base -> reservation.
    reservations: BTreeMap<u64, Reservation>,
    /// Page VA -> (page PA, mapping flags).
    translations: BTreeMap<u64, (u64, MapFlags)>,
}

/// Reservation accounting and software translations for the kernel space.
pub struct KernelAddressSpace<'a> {
    phys: &'a dyn PhysicalAllocator,
    inner: Mutex<SpaceInner>,
}

impl<'a> KernelAddressSpace<'a> {
    pub fn new(phys: &'a dyn PhysicalAllocator) -> Self {
        Self {
            phys,
            inner: Mutex::new(SpaceInner::default()),
        }
    }

    /// Bytes reserved and not yet released. Fully released reservations are
    /// retired; partially released ones count their remaining bytes.
    pub fn reserved_bytes_outstanding(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .reservations
            .values()
            .map(|r| r.size - r.freed)
            .sum()
    }

    /// Number of live page translations.
    pub fn translation_count(&self) -> usize {
        self.inner.lock().translations.len()
    }

    /// Mapping flags recorded for a page, if mapped.
    pub fn mapping_flags(&self, address: VirtualAddress) -> Option<MapFlags> {
        let inner = self.inner.lock();
        inner
            .translations
            .get(&address.page_base().as_u64())
            .map(|&(_, flags)| flags)
    }
}

impl VirtualSpace for KernelAddressSpace<'_> {
    fn reserve_range(&self, size: usize, alignment: usize) -> Result<VirtualAddress> {
        debug_assert!(is_aligned(size, PAGE_SIZE));
        debug_assert!(alignment <= PAGE_SIZE);
        if size == 0 {
            return Err(KernelError::InvalidParameter);
        }

        // Over-allocate so the base can be aligned to a page boundary.
        let backing = vec![0u8; size + PAGE_SIZE];
        let base = align_up(backing.as_ptr() as usize, PAGE_SIZE) as u64;

        let mut inner = self.inner.lock();
        inner.reservations.insert(
            base,
            Reservation {
                size,
                freed: 0,
                _backing: backing,
            },
        );

        Ok(VirtualAddress::new(base))
    }

    fn free_range(&self, base: VirtualAddress, size: usize, flags: UnmapFlags) {
        let start = base.as_u64();
        let end = start + size as u64;

        let mut inner = self.inner.lock();

        // Tear down translations in the range first.
        let mut page = base.page_base().as_u64();
        while page < end {
            if let Some((pa, _)) = inner.translations.remove(&page) {
                if flags.contains(UnmapFlags::FREE_PHYSICAL_PAGES) {
                    self.phys.free_page(PhysicalAddress::new(pa));
                }
            }

            page += PAGE_SIZE as u64;
        }

        // Account the released bytes against every overlapping reservation.
        let mut retired = Vec::new();
        for (&res_base, reservation) in inner.reservations.iter_mut() {
            let res_end = res_base + reservation.size as u64;
            let overlap_start = start.max(res_base);
            let overlap_end = end.min(res_end);
            if overlap_start >= overlap_end {
                continue;
            }

            reservation.freed += (overlap_end - overlap_start) as usize;
            debug_assert!(reservation.freed <= reservation.size);
            if reservation.freed == reservation.size {
                retired.push(res_base);
            }
        }

        for res_base in retired {
            inner.reservations.remove(&res_base);
        }
    }

    fn map_page(&self, page: PhysicalAddress, at: VirtualAddress, flags: MapFlags) {
        debug_assert!(page.is_page_aligned());
        debug_assert!(at == at.page_base());
        self.inner
            .lock()
            .translations
            .insert(at.as_u64(), (page.as_u64(), flags));
    }

    fn map_range(
        &self,
        base: VirtualAddress,
        size: usize,
        run_alignment: usize,
        run_size: usize,
        flags: MapFlags,
    ) -> Result<()> {
        debug_assert!(is_aligned(run_size, PAGE_SIZE));
        debug_assert!(is_aligned(size, run_size));

        let pages_per_run = run_size >> PAGE_SHIFT;
        let mut mapped_runs: Vec<PhysicalAddress> = Vec::new();

        for run_offset in (0..size).step_by(run_size) {
            let run = match self.phys.allocate_pages(pages_per_run, run_alignment) {
                Some(run) => run,
                None => {
                    // Undo this call's work so the caller sees no side effects.
                    let mut inner = self.inner.lock();
                    for (index, &run) in mapped_runs.iter().enumerate() {
                        for page in 0..pages_per_run {
                            let va = base.as_u64()
                                + (index * run_size) as u64
                                + ((page as u64) << PAGE_SHIFT);
                            inner.translations.remove(&va);
                            self.phys
                                .free_page(run.offset((page as u64) << PAGE_SHIFT));
                        }
                    }

                    return Err(KernelError::NoMemory {
                        pages: pages_per_run,
                    });
                }
            };

            for page in 0..pages_per_run {
                self.map_page(
                    run.offset((page as u64) << PAGE_SHIFT),
                    base.add(run_offset + (page << PAGE_SHIFT)),
                    flags,
                );
            }

            mapped_runs.push(run);
        }

        Ok(())
    }

    fn virtual_to_physical(&self, address: VirtualAddress) -> Option<PhysicalAddress> {
        let inner = self.inner.lock();
        let page = address.page_base().as_u64();
        let offset = address.as_u64() - page;
        inner
            .translations
            .get(&page)
            .map(|&(pa, _)| PhysicalAddress::new(pa + offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::phys::BitmapFrameAllocator;

    #[test]
    fn test_reserve_returns_aligned_live_memory() {
        let phys = BitmapFrameAllocator::new();
        let space = KernelAddressSpace::new(&phys);

        let base = space
            .reserve_range(2 * PAGE_SIZE, PAGE_SIZE)
            .expect("reservation from the host heap should succeed");
        assert_eq!(base, base.page_base());

        // The reservation is real memory: writing through it must be sound.
        // SAFETY: base points at a live reservation of 2 pages owned by
        // `space`, and nothing else references it.
        unsafe {
            core::ptr::write_bytes(base.as_mut_ptr::<u8>(), 0xA5, 2 * PAGE_SIZE);
            assert_eq!(*base.add(PAGE_SIZE).as_ptr::<u8>(), 0xA5);
        }

        assert_eq!(space.reserved_bytes_outstanding(), 2 * PAGE_SIZE);
        space.free_range(base, 2 * PAGE_SIZE, UnmapFlags::INVALIDATE_TLB);
        assert_eq!(space.reserved_bytes_outstanding(), 0);
    }

    #[test]
    fn test_partial_free_keeps_reservation_accounted() {
        let phys = BitmapFrameAllocator::new();
        let space = KernelAddressSpace::new(&phys);

        let base = space
            .reserve_range(3 * PAGE_SIZE, PAGE_SIZE)
            .expect("reservation should succeed");
        space.free_range(base, PAGE_SIZE, UnmapFlags::INVALIDATE_TLB);
        assert_eq!(space.reserved_bytes_outstanding(), 2 * PAGE_SIZE);
        space.free_range(base.add(PAGE_SIZE), 2 * PAGE_SIZE, UnmapFlags::INVALIDATE_TLB);
        assert_eq!(space.reserved_bytes_outstanding(), 0);
    }

    #[test]
    fn test_map_range_backs_reserved_range() {
        let phys = BitmapFrameAllocator::new();
        phys.add_region(PhysicalAddress::new(0x100000), 4);
        let space = KernelAddressSpace::new(&phys);

        let base = space
            .reserve_range(2 * PAGE_SIZE, PAGE_SIZE)
            .expect("reservation should succeed");
        space
            .map_range(
                base,
                2 * PAGE_SIZE,
                PAGE_SIZE,
                2 * PAGE_SIZE,
                MapFlags::PRESENT | MapFlags::GLOBAL,
            )
            .expect("backing a 2-page range from a 4-frame region should succeed");

        let first = space
            .virtual_to_physical(base)
            .expect("first page should be mapped");
        let second = space
            .virtual_to_physical(base.add(PAGE_SIZE))
            .expect("second page should be mapped");
        assert_eq!(second.as_u64(), first.as_u64() + PAGE_SIZE as u64);

        // Sub-page offsets survive translation.
        let inside = space
            .virtual_to_physical(base.add(5))
            .expect("offset translation should resolve");
        assert_eq!(inside.as_u64(), first.as_u64() + 5);
    }

    #[test]
    fn test_map_range_failure_unwinds() {
        let phys = BitmapFrameAllocator::new();
        phys.add_region(PhysicalAddress::new(0x100000), 1);
        let space = KernelAddressSpace::new(&phys);

        let base = space
            .reserve_range(2 * PAGE_SIZE, PAGE_SIZE)
            .expect("reservation should succeed");
        let err = space
            .map_range(base, 2 * PAGE_SIZE, PAGE_SIZE, PAGE_SIZE, MapFlags::PRESENT)
            .expect_err("backing 2 pages from a 1-frame region must fail");
        assert_eq!(err, KernelError::NoMemory { pages: 1 });

        // The failed call released its partial work.
        assert_eq!(space.translation_count(), 0);
        assert_eq!(phys.free_frames(), 1);
    }

    #[test]
    fn test_free_range_releases_physical_pages_on_request() {
        let phys = BitmapFrameAllocator::new();
        phys.add_region(PhysicalAddress::new(0x200000), 2);
        let space = KernelAddressSpace::new(&phys);

        let base = space
            .reserve_range(2 * PAGE_SIZE, PAGE_SIZE)
            .expect("reservation should succeed");
        space
            .map_range(base, 2 * PAGE_SIZE, PAGE_SIZE, PAGE_SIZE, MapFlags::PRESENT)
            .expect("mapping should succeed");
        assert_eq!(phys.free_frames(), 0);

        space.free_range(
            base,
            2 * PAGE_SIZE,
            UnmapFlags::FREE_PHYSICAL_PAGES | UnmapFlags::INVALIDATE_TLB,
        );
        assert_eq!(phys.free_frames(), 2);
        assert_eq!(space.translation_count(), 0);
    }
}
