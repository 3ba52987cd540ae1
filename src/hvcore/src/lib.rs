//! A single-guest hypervisor bootstrap for AMD processors.
//!
//! The crate manages physical memory of a machine with no underlying OS,
//! builds long-mode and nested page tables mapping 2MB pages, prepares a VMCB
//! for one guest kernel and runs it until the first #VMEXIT.
#![no_std]

#[cfg(test)]
extern crate std;

mod hypervisor;

pub use hypervisor::{
    BootInfo, BootOptions, DEFAULT_GUEST_MEMORY_SIZE, DEFAULT_HEAP_SIZE, GuestModule,
    amd::svm::Svm,
    cpu::CpuInfo,
    direct_map::{DirectMap, VMM_OFFSET},
    host::Extension,
    memory_map::{MemoryRegion, RegionKind},
    panic::panic_impl,
    start_vmm,
};

#[cfg(test)]
#[ctor::ctor]
fn init_test_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
