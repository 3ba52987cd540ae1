//! This module implements the hypervisor bootstrap: from the boot-time memory
//! map to the first #VMEXIT of the guest.

mod allocator;
pub(crate) mod amd;
pub(crate) mod cpu;
pub(crate) mod direct_map;
mod elf;
mod error;
pub(crate) mod host;
pub(crate) mod memory_map;
mod paging_structures;
pub(crate) mod panic;
mod serial_logger;
mod support;
#[cfg(test)]
mod test_support;
mod vm;
mod x86_instructions;

use self::{
    allocator::PhysicalAllocator,
    amd::exit::ExitReport,
    direct_map::DirectMap,
    error::HvError,
    host::Extension,
    memory_map::{MemoryRegion, PhysicalLayout},
    vm::Vm,
};

/// The default size of the region reserved for the hypervisor image, the
/// allocation bitmap and the initial stack (4MB).
pub const DEFAULT_HEAP_SIZE: u64 = 1 << 22;

/// The default size of the guest physical memory (4MB).
pub const DEFAULT_GUEST_MEMORY_SIZE: u64 = 1 << 22;

/// Tunables of the bootstrap. Parsing them from the kernel command line is up
/// to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootOptions {
    /// The end of the hypervisor heap, ie, physical memory below this address
    /// is never handed out by the allocator.
    pub heap_size: u64,

    /// The size of the guest physical memory. Rounded up to 2MB.
    pub guest_memory_size: u64,
}

impl Default for BootOptions {
    fn default() -> Self {
        Self {
            heap_size: DEFAULT_HEAP_SIZE,
            guest_memory_size: DEFAULT_GUEST_MEMORY_SIZE,
        }
    }
}

/// The physical range of the guest kernel image the boot loader loaded as a
/// module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestModule {
    /// The physical address of the first byte of the image.
    pub start: u64,
    /// The physical address following the last byte of the image.
    pub end: u64,
}

impl GuestModule {
    fn len(&self) -> u64 {
        self.end - self.start
    }
}

/// What the boot loader hands over to the hypervisor.
#[derive(Debug, Clone, Copy)]
pub struct BootInfo<'a> {
    /// The normalized physical memory map.
    pub regions: &'a [MemoryRegion],

    /// The guest kernel image, if the boot loader loaded one.
    pub guest_module: Option<GuestModule>,

    /// The physical address following the last byte of the hypervisor image.
    /// The allocation bitmap is placed right after it.
    pub vmm_image_end: u64,
}

/// Creates the guest described by `boot_info` and runs it until its first
/// #VMEXIT, then halts the processor.
///
/// This is the only place an error turns into the unrecoverable halt.
pub fn start_vmm<E: Extension>(
    boot_info: &BootInfo<'_>,
    options: &BootOptions,
    dm: DirectMap,
    extension: &mut E,
) -> ! {
    serial_logger::init(log::LevelFilter::Info);
    log::info!("Starting the hypervisor");

    match bootstrap(boot_info, options, dm, extension) {
        Ok((_vm, report)) => log::info!("Stopped after the first #VMEXIT: {}", report.reason),
        Err(e) => log::error!("FATAL FAILURE: {e}"),
    }
    x86_instructions::halt()
}

/// Sets up memory management and the guest, enables SVM and runs one
/// VM-entry/#VMEXIT cycle.
fn bootstrap<E: Extension>(
    boot_info: &BootInfo<'_>,
    options: &BootOptions,
    dm: DirectMap,
    extension: &mut E,
) -> Result<(Vm, ExitReport), HvError> {
    let mut layout = PhysicalLayout::new(boot_info.regions, options.heap_size);
    log::info!(
        "{:#x} pages available, max page {:#x}",
        layout.total_pages,
        layout.max_page
    );

    // The allocator may hand out the frames the boot loader put the module
    // at. Move the image somewhere the allocator never touches first.
    let module = boot_info.guest_module.ok_or(HvError::NoGuestImage)?;
    stash_guest_image(dm, boot_info.regions, &mut layout, &module)?;

    let mut allocator =
        PhysicalAllocator::new(dm, boot_info.regions, &mut layout, boot_info.vmm_image_end)?;

    let cpu = extension.identify();
    log::info!("Vendor ID: {}", cpu.vendor());
    cpu.validate()?;

    // "The VMRUN instruction saves some host processor state information in
    //  the host state-save area in main memory at the physical address
    //  specified in the VM_HSAVE_PA MSR".
    // See: 15.5.1 Basic Operation
    let host_save_area = allocator.allocate_zeroed(1, 1)?;
    extension.enable(host_save_area);
    log::info!("AMD SVM extension is enabled");

    let mut vm = Vm::create(
        &mut allocator,
        layout.guest_image_start,
        layout.guest_image_size,
        options.guest_memory_size,
    )?;
    let report = vm.boot(extension)?;
    Ok((vm, report))
}

/// Copies the guest image to the first RAM location at or above the heap end
/// that can hold it, and records the new location in `layout`.
fn stash_guest_image(
    dm: DirectMap,
    regions: &[MemoryRegion],
    layout: &mut PhysicalLayout,
    module: &GuestModule,
) -> Result<(), HvError> {
    let len = module.len();
    let start = find_region_for_guest_image(regions, layout.heap_end, len)?;

    // Safety: both ranges are RAM covered by the direct map, and nothing
    // refers to them yet.
    unsafe { dm.copy(start, module.start, len as usize) };

    layout.guest_image_start = start;
    layout.guest_image_size = len;
    log::info!("Guest image stashed at {start:#x} ({len:#x} bytes)");
    Ok(())
}

fn find_region_for_guest_image(
    regions: &[MemoryRegion],
    heap_end: u64,
    len: u64,
) -> Result<u64, HvError> {
    regions
        .iter()
        .filter(|region| region.is_ram() && region.length >= len)
        .find_map(|region| {
            if region.base < heap_end && heap_end + len < region.end() {
                Some(heap_end)
            } else if region.base >= heap_end {
                Some(region.base)
            } else {
                None
            }
        })
        .ok_or(HvError::NoRoomForGuestImage { len })
}

#[cfg(test)]
mod tests {
    use super::{
        BootInfo, BootOptions, GuestModule, bootstrap, find_region_for_guest_image,
        test_support::{FakeSvm, TestMemory, elf32_image},
    };
    use crate::hypervisor::{
        amd::exit::VmExitReason,
        error::HvError,
        memory_map::{MemoryRegion, RegionKind},
        vm::VmState,
    };

    #[test]
    fn guest_image_goes_to_heap_end_when_the_region_spans_it() {
        let regions = [
            MemoryRegion::new(0, 0x9_f000, RegionKind::Ram),
            MemoryRegion::new(0x10_0000, 0x100_0000, RegionKind::Ram),
        ];
        let start = find_region_for_guest_image(&regions, 0x40_0000, 0x1_0000).unwrap();
        assert_eq!(start, 0x40_0000);
    }

    #[test]
    fn guest_image_goes_to_the_next_region_above_heap_end() {
        let regions = [
            MemoryRegion::new(0x10_0000, 0x30_0000, RegionKind::Ram),
            MemoryRegion::new(0x80_0000, 0x80_0000, RegionKind::Reserved),
            MemoryRegion::new(0x100_0000, 0x80_0000, RegionKind::Ram),
        ];
        let start = find_region_for_guest_image(&regions, 0x40_0000, 0x1_0000).unwrap();
        assert_eq!(start, 0x100_0000);
    }

    #[test]
    fn guest_image_too_large_is_fatal() {
        let regions = [MemoryRegion::new(0x10_0000, 0x10_0000, RegionKind::Ram)];
        assert_eq!(
            find_region_for_guest_image(&regions, 0x40_0000, 0x20_0000),
            Err(HvError::NoRoomForGuestImage { len: 0x20_0000 })
        );
    }

    #[test]
    fn bootstrap_runs_the_guest_once() {
        let memory = TestMemory::new(TestMemory::VM_SIZE);
        let image = elf32_image(0x1000, 0x2000, 0x10_0000);

        // Let the module sit in the low RAM region, as a boot loader would.
        let module_start = 0x1_0000;
        memory.write(module_start, &image);

        let regions = memory.regions();
        let boot_info = BootInfo {
            regions: &regions,
            guest_module: Some(GuestModule {
                start: module_start,
                end: module_start + image.len() as u64,
            }),
            vmm_image_end: TestMemory::VMM_IMAGE_END,
        };
        let mut svm = FakeSvm::new(memory.dm(), 0x400, 0b101, 0x3000);

        let (vm, report) =
            bootstrap(&boot_info, &BootOptions::default(), memory.dm(), &mut svm).unwrap();
        assert!(svm.enabled_with.is_some());
        assert_eq!(svm.runs, 1);
        assert_eq!(vm.state(), VmState::Exited);
        assert_eq!(report.reason, VmExitReason::NestedPageFault);
        assert_eq!(report.exit_info2, 0x3000);
        assert_eq!(report.rip, 0x10_0000);
    }

    #[test]
    fn bootstrap_without_guest_image_is_fatal() {
        let memory = TestMemory::new(TestMemory::DEFAULT_SIZE);
        let regions = memory.regions();
        let boot_info = BootInfo {
            regions: &regions,
            guest_module: None,
            vmm_image_end: TestMemory::VMM_IMAGE_END,
        };
        let mut svm = FakeSvm::new(memory.dm(), 0, 0, 0);
        let result = bootstrap(&boot_info, &BootOptions::default(), memory.dm(), &mut svm);
        assert!(matches!(result, Err(HvError::NoGuestImage)));
        assert_eq!(svm.runs, 0);
    }

    #[test]
    fn bootstrap_rejects_processors_without_svm() {
        let memory = TestMemory::new(TestMemory::VM_SIZE);
        let image = elf32_image(0x1000, 0x1000, 0);
        memory.write(0x1_0000, &image);
        let regions = memory.regions();
        let boot_info = BootInfo {
            regions: &regions,
            guest_module: Some(GuestModule {
                start: 0x1_0000,
                end: 0x1_0000 + image.len() as u64,
            }),
            vmm_image_end: TestMemory::VMM_IMAGE_END,
        };
        let mut svm = FakeSvm::new(memory.dm(), 0, 0, 0);
        svm.cpu.svm = false;

        let result = bootstrap(&boot_info, &BootOptions::default(), memory.dm(), &mut svm);
        assert!(matches!(result, Err(HvError::UnsupportedProcessor { .. })));
        assert!(svm.enabled_with.is_none());
    }
}
