//! The nested paging structures (NPT) mapping guest physical memory to host
//! physical memory.

use x86::bits64::paging::LARGE_PAGE_SIZE;

use crate::hypervisor::{
    allocator::PhysicalAllocator, error::HvError, paging_structures::PageTable,
    support::round_up_by,
};

/// The nested paging structures, translating guest physical addresses to host
/// physical addresses.
#[derive(Debug, derive_deref::Deref)]
pub(crate) struct NestedPageTables(PageTable);

impl NestedPageTables {
    pub(crate) fn new(allocator: &mut PhysicalAllocator) -> Result<Self, HvError> {
        Ok(Self(PageTable::create_root(allocator)?))
    }

    /// Maps `size` bytes of guest physical memory starting at zero onto the
    /// host physical memory at `host_pa`, in 2MB pages.
    ///
    /// The first 2MB page is the exception: it maps to host physical address
    /// zero so that the guest sees the legacy regions like VGA memory.
    pub(crate) fn map_guest_memory(
        &mut self,
        allocator: &mut PhysicalAllocator,
        host_pa: u64,
        size: u64,
    ) -> Result<(), HvError> {
        let page_size = LARGE_PAGE_SIZE as u64;
        let count = round_up_by(size, page_size) / page_size;
        for index in 0..count {
            let guest_pa = index * page_size;
            let pa = if index == 0 { 0 } else { host_pa + guest_pa };
            self.0.map(allocator, guest_pa, pa, true)?;
        }
        log::info!("Nested paging structures created at {:#x}", self.root());
        self.dump();
        Ok(())
    }
}
