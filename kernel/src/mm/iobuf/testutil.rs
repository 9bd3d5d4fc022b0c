//! Shared collaborator doubles for I/O buffer tests
//!
//! Tests wire a [`MemoryContext`] from the in-crate bitmap allocator and
//! kernel address space (configured with regions at literal physical
//! addresses), a scripted pager, and a byte-copying user-access double that
//! can inject faults. Everything is leaked to `'static` because contexts
//! only hold borrows.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;

use crate::error::{KernelError, Result};
use crate::mm::page_cache::PageCacheEntry;
use crate::mm::pager::{LockedPage, Pager, SectionRange};
use crate::mm::phys::BitmapFrameAllocator;
use crate::mm::user::UserAccess;
use crate::mm::virt::{KernelAddressSpace, MapFlags, VirtualSpace};
use crate::mm::{
    AddressLayout, MemoryContext, MemorySpace, PhysicalAddress, VirtualAddress, PAGE_SIZE,
};

pub(crate) struct TestEnv {
    pub phys: &'static BitmapFrameAllocator,
    pub space: &'static KernelAddressSpace<'static>,
    pub pager: &'static TestPager,
    pub user: &'static TestUserAccess,
    pub layout: AddressLayout,
}

impl TestEnv {
    /// Every host address counts as kernel space.
    pub fn kernel_layout() -> AddressLayout {
        AddressLayout {
            user_limit: 0,
            kernel_base: 0,
        }
    }

    /// Every host address counts as user space.
    pub fn user_layout() -> AddressLayout {
        AddressLayout {
            user_limit: u64::MAX,
            kernel_base: u64::MAX,
        }
    }

    pub fn new() -> Self {
        let phys: &'static BitmapFrameAllocator = Box::leak(Box::new(BitmapFrameAllocator::new()));
        let space = Box::leak(Box::new(KernelAddressSpace::new(phys)));
        let pager = Box::leak(Box::new(TestPager::new(phys)));
        let user = Box::leak(Box::new(TestUserAccess::default()));
        Self {
            phys,
            space,
            pager,
            user,
            layout: Self::kernel_layout(),
        }
    }

    pub fn ctx(&self) -> MemoryContext<'static> {
        MemoryContext::new(self.phys, self.space, self.pager, self.user, self.layout)
    }

    pub fn cache_entry(&self, physical: PhysicalAddress) -> Arc<PageCacheEntry> {
        PageCacheEntry::new(physical)
    }

    /// Reserve real, page-aligned memory and install the given physical
    /// translation for each of its pages. Returns the base address.
    pub fn map_test_pages(&self, pages: &[u64]) -> VirtualAddress {
        let base = self
            .space
            .reserve_range(pages.len() * PAGE_SIZE, PAGE_SIZE)
            .expect("test reservation should succeed");
        for (index, &pa) in pages.iter().enumerate() {
            self.space.map_page(
                PhysicalAddress::new(pa),
                base.add(index * PAGE_SIZE),
                MapFlags::PRESENT | MapFlags::GLOBAL,
            );
        }

        base
    }
}

enum PageScript {
    Cache(Arc<PageCacheEntry>),
    Anonymous(PhysicalAddress),
    Fail(KernelError),
}

/// Pager double scripted per (section, page offset).
pub(crate) struct TestPager {
    phys: &'static BitmapFrameAllocator,
    sections: Mutex<Vec<SectionRange>>,
    scripts: Mutex<BTreeMap<(u64, usize), PageScript>>,
    try_agains: Mutex<BTreeMap<(u64, usize), u32>>,
    calls: AtomicUsize,
}

impl TestPager {
    fn new(phys: &'static BitmapFrameAllocator) -> Self {
        Self {
            phys,
            sections: Mutex::new(Vec::new()),
            scripts: Mutex::new(BTreeMap::new()),
            try_agains: Mutex::new(BTreeMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn add_section(&self, base: VirtualAddress, size: usize, id: u64) {
        self.sections.lock().push(SectionRange { base, size, id });
    }

    /// The page lives in the page cache; page-in hands out a reference.
    pub fn script_cache_page(&self, id: u64, page_offset: usize, entry: &Arc<PageCacheEntry>) {
        self.scripts
            .lock()
            .insert((id, page_offset), PageScript::Cache(Arc::clone(entry)));
    }

    /// The page is anonymous; page-in pins it in the allocator.
    pub fn script_anonymous_page(&self, id: u64, page_offset: usize, physical: PhysicalAddress) {
        self.scripts
            .lock()
            .insert((id, page_offset), PageScript::Anonymous(physical));
    }

    pub fn script_failure(&self, id: u64, page_offset: usize, error: KernelError) {
        self.scripts
            .lock()
            .insert((id, page_offset), PageScript::Fail(error));
    }

    /// Make the next `count` page-ins of this page report try-again.
    pub fn script_try_agains(&self, id: u64, page_offset: usize, count: u32) {
        self.try_agains.lock().insert((id, page_offset), count);
    }

    pub fn page_in_calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Pager for TestPager {
    fn lookup_section(&self, address: VirtualAddress, _space: MemorySpace) -> Option<SectionRange> {
        self.sections
            .lock()
            .iter()
            .copied()
            .find(|section| section.base <= address && address < section.end())
    }

    fn page_in(&self, section: &SectionRange, page_offset: usize) -> Result<LockedPage> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let key = (section.id, page_offset);

        if let Some(remaining) = self.try_agains.lock().get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(KernelError::TryAgain);
            }
        }

        match self.scripts.lock().get(&key) {
            Some(PageScript::Cache(entry)) => Ok(LockedPage {
                physical: entry.physical_address(),
                cache_entry: Some(Arc::clone(entry)),
            }),
            Some(PageScript::Anonymous(physical)) => {
                self.phys.lock_pages(*physical, 1);
                Ok(LockedPage {
                    physical: *physical,
                    cache_entry: None,
                })
            }
            Some(PageScript::Fail(error)) => Err(*error),
            None => Err(KernelError::InvalidParameter),
        }
    }
}

/// User-access double: test "user" addresses are live host allocations, so
/// the copies are real; faults are injected on demand.
#[derive(Default)]
pub(crate) struct TestUserAccess {
    fail_next: AtomicBool,
    to_user: AtomicUsize,
    from_user: AtomicUsize,
}

impl TestUserAccess {
    /// Make the next user copy fault.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::Relaxed);
    }

    pub fn to_user_calls(&self) -> usize {
        self.to_user.load(Ordering::Relaxed)
    }

    #[allow(dead_code)]
    pub fn from_user_calls(&self) -> usize {
        self.from_user.load(Ordering::Relaxed)
    }
}

impl UserAccess for TestUserAccess {
    fn copy_to_user(&self, dst: VirtualAddress, src: &[u8]) -> Result<()> {
        if self.fail_next.swap(false, Ordering::Relaxed) {
            return Err(KernelError::AccessViolation {
                addr: dst.as_usize(),
            });
        }

        self.to_user.fetch_add(1, Ordering::Relaxed);
        // SAFETY: test user addresses are live host allocations sized for
        // the copy.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_mut_ptr::<u8>(), src.len());
        }

        Ok(())
    }

    fn copy_from_user(&self, dst: &mut [u8], src: VirtualAddress) -> Result<()> {
        if self.fail_next.swap(false, Ordering::Relaxed) {
            return Err(KernelError::AccessViolation {
                addr: src.as_usize(),
            });
        }

        self.from_user.fetch_add(1, Ordering::Relaxed);
        // SAFETY: test user addresses are live host allocations sized for
        // the copy.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr::<u8>(), dst.as_mut_ptr(), dst.len());
        }

        Ok(())
    }
}
