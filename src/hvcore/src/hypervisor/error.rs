//! The error type every fallible operation of the hypervisor returns.

use super::{elf::ElfError, paging_structures::Level, vm::VmState};

/// An unrecoverable condition detected during the bootstrap. Propagated up to
/// [`start_vmm`](super::start_vmm), which reports it and halts the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub(crate) enum HvError {
    #[error("no space for the hypervisor heap: heap start {heap_start:#x} >= heap end {heap_end:#x}")]
    NoHeapSpace { heap_start: u64, heap_end: u64 },

    #[error("out of physical memory: {count} frame(s) aligned to {align}")]
    OutOfMemory { count: u64, align: u64 },

    #[error("invalid allocation request: {count} frame(s) aligned to {align}")]
    InvalidAllocation { count: u64, align: u64 },

    #[error("{level} entry for {vaddr:#x} not present")]
    NotPresent { level: Level, vaddr: u64 },

    #[error("Not 2 Mbyte page size: {vaddr:#x}")]
    NotLargePage { vaddr: u64 },

    #[error("VMCB consistency check failed: {message}")]
    ConsistencyCheck { message: &'static str },

    #[error("unsupported processor: {reason}")]
    UnsupportedProcessor { reason: &'static str },

    #[error("no guest image was loaded by the boot loader")]
    NoGuestImage,

    #[error("no RAM region can hold the guest image of {len:#x} bytes")]
    NoRoomForGuestImage { len: u64 },

    #[error("guest memory of {size:#x} bytes cannot hold the boot structures")]
    GuestMemoryTooSmall { size: u64 },

    #[error("invalid guest image: {0}")]
    Elf(#[from] ElfError),

    #[error("the VM cannot boot in the {state} state")]
    InvalidVmState { state: VmState },
}
