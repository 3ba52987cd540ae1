//! This module implements the lifecycle of the single guest: creation, the
//! VM-entry and the report of the #VMEXIT that follows.

use x86::bits64::paging::{BASE_PAGE_SHIFT, BASE_PAGE_SIZE, LARGE_PAGE_SIZE};

use super::{
    allocator::PhysicalAllocator,
    amd::{
        consistency,
        exit::{ExitReport, VmExitReason},
        npts::NestedPageTables,
        vmcb::{Vmcb, build_control_area, build_state_save_area},
    },
    direct_map::DirectMap,
    elf,
    error::HvError,
    host::Extension,
    paging_structures::{Entry, Table},
    support::round_up_by,
};

/// Where the multiboot information structure is placed in guest memory.
pub(crate) const BOOT_INFO_OFFSET: u64 = 0x2_d0e0;

/// The number of page tables installed at the guest's initial CR3.
const BOOT_PAGE_TABLE_COUNT: u64 = 3;

/// Where the guest is in its single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub(crate) enum VmState {
    Created,
    Running,
    Exited,
}

/// The guest. There is exactly one.
#[derive(Debug)]
pub(crate) struct Vm {
    dm: DirectMap,
    vmcb_pa: u64,
    npt: NestedPageTables,
    guest_memory_pa: u64,
    guest_memory_size: u64,
    boot_info_pa: u64,
    state: VmState,
}

impl Vm {
    /// Builds the VMCB and the guest memory with the image at
    /// `guest_image_start` loaded into it.
    pub(crate) fn create(
        allocator: &mut PhysicalAllocator,
        guest_image_start: u64,
        guest_image_size: u64,
        guest_memory_size: u64,
    ) -> Result<Self, HvError> {
        let dm = allocator.direct_map();

        let vmcb_pa = allocator.allocate_zeroed(1, 1)?;
        // Safety: the VMCB page was just allocated, and nothing else refers to
        // it until `Vm` is returned.
        let vmcb = unsafe { dm.as_mut::<Vmcb>(vmcb_pa) };
        build_control_area(vmcb, allocator)?;
        log::info!("Nested paging enabled");

        // Guest memory is mapped with 2MB pages and so must be 2MB aligned.
        let page_size = LARGE_PAGE_SIZE as u64;
        let guest_memory_size = round_up_by(guest_memory_size, page_size);
        if guest_memory_size < BOOT_INFO_OFFSET.max(boot_page_tables_end()) {
            return Err(HvError::GuestMemoryTooSmall {
                size: guest_memory_size,
            });
        }
        let guest_memory_pa = allocator.allocate_zeroed(
            guest_memory_size >> BASE_PAGE_SHIFT,
            page_size >> BASE_PAGE_SHIFT,
        )?;
        log::info!("Guest memory at {guest_memory_pa:#x} ({guest_memory_size:#x} bytes)");

        let mut npt = NestedPageTables::new(allocator)?;
        npt.map_guest_memory(allocator, guest_memory_pa, guest_memory_size)?;

        // Safety: the image was stashed out of reach of the allocator, and guest
        // memory was just allocated. The ranges do not overlap.
        let entry_point = unsafe {
            elf::load(
                dm.bytes(guest_image_start, guest_image_size as usize),
                dm.bytes_mut(guest_memory_pa, guest_memory_size as usize),
            )?
        };
        build_state_save_area(vmcb, entry_point, npt.root());

        let boot_info_pa = guest_memory_pa + BOOT_INFO_OFFSET;
        log::info!("Multiboot information at {boot_info_pa:#x}");

        install_boot_page_tables(dm, guest_memory_pa, vmcb.state_save_area.cr3);
        log::info!("New virtual machine created");

        Ok(Self {
            dm,
            vmcb_pa,
            npt,
            guest_memory_pa,
            guest_memory_size,
            boot_info_pa,
            state: VmState::Created,
        })
    }

    /// Checks the VMCB, runs the guest until #VMEXIT and reports why it exited.
    /// The guest is not resumed.
    pub(crate) fn boot<E: Extension>(&mut self, extension: &mut E) -> Result<ExitReport, HvError> {
        if self.state != VmState::Created {
            return Err(HvError::InvalidVmState { state: self.state });
        }

        log::info!("Booting guest operating system...");
        log::debug!(
            "Guest memory {:#x}-{:#x}, multiboot information at {:#x}",
            self.guest_memory_pa,
            self.guest_memory_pa + self.guest_memory_size,
            self.boot_info_pa
        );
        let report = consistency::check(self.vmcb()).inspect_err(|_| self.vmcb().dump())?;
        if report.is_fully_verified() {
            log::info!("VMCB consistency checks passed");
        } else {
            for message in report.unverified() {
                log::warn!("Entering the guest without checking: {message}");
            }
        }

        self.state = VmState::Running;
        extension.run(self.vmcb_pa);
        self.state = VmState::Exited;

        let report = ExitReport::capture(self.vmcb());
        report.log();
        if report.reason == VmExitReason::NestedPageFault {
            match self.npt.translate(report.exit_info2) {
                Ok(pa) => log::info!("The faulting address is backed by {pa:#x}"),
                Err(e) => log::info!("The faulting address is not mapped: {e}"),
            }
        }
        Ok(report)
    }

    pub(crate) fn vmcb(&self) -> &Vmcb {
        // Safety: the VMCB page is owned by `self`. The processor writes it
        // only during `Extension::run`, when no reference is alive.
        unsafe { self.dm.as_ref::<Vmcb>(self.vmcb_pa) }
    }
}

#[cfg(test)]
impl Vm {
    pub(crate) fn state(&self) -> VmState {
        self.state
    }

    pub(crate) fn vmcb_pa(&self) -> u64 {
        self.vmcb_pa
    }

    pub(crate) fn vmcb_mut(&mut self) -> &mut Vmcb {
        // Safety: see `vmcb`.
        unsafe { self.dm.as_mut::<Vmcb>(self.vmcb_pa) }
    }

    pub(crate) fn nested_page_tables(&self) -> &NestedPageTables {
        &self.npt
    }

    /// The host physical address of guest physical address zero, before
    /// the first 2MB page is redirected to host physical address zero.
    pub(crate) fn guest_memory_pa(&self) -> u64 {
        self.guest_memory_pa
    }

    pub(crate) fn guest_memory(&self) -> &[u8] {
        // Safety: guest memory is owned by `self`.
        unsafe {
            self.dm
                .bytes(self.guest_memory_pa, self.guest_memory_size as usize)
        }
    }

    /// The host physical address of the multiboot information structure.
    pub(crate) fn boot_info_pa(&self) -> u64 {
        self.boot_info_pa
    }
}

const fn boot_page_tables_end() -> u64 {
    super::amd::vmcb::GUEST_INITIAL_CR3 + BOOT_PAGE_TABLE_COUNT * BASE_PAGE_SIZE as u64
}

/// Installs paging structures identity mapping the first 4MB at `cr3` in guest
/// memory, so that the guest runs with paging enabled from its first
/// instruction.
fn install_boot_page_tables(dm: DirectMap, guest_memory_pa: u64, cr3: u64) {
    let page_size = BASE_PAGE_SIZE as u64;
    let base = guest_memory_pa + cr3;
    // Safety: the range is in guest memory, which the guest does not run yet.
    unsafe { dm.fill(base, 0, (BOOT_PAGE_TABLE_COUNT * page_size) as usize) };

    let table_entry = |table_pa: u64| {
        let mut entry = Entry::default();
        entry.set_present(true);
        entry.set_writable(true);
        entry.set_pfn(table_pa >> BASE_PAGE_SHIFT);
        entry
    };
    // Safety: see above. Each page is referenced once.
    let (pml4, pdpt, pd) = unsafe {
        (
            dm.as_mut::<Table>(base),
            dm.as_mut::<Table>(base + page_size),
            dm.as_mut::<Table>(base + page_size * 2),
        )
    };
    pml4.entries[0] = table_entry(cr3 + page_size);
    pdpt.entries[0] = table_entry(cr3 + page_size * 2);
    pd.entries[0] = Entry::large_page(0, false);
    pd.entries[1] = Entry::large_page(LARGE_PAGE_SIZE as u64, false);
    log::info!("Temporary page table for virtual machine created at {cr3:#x}");
}
