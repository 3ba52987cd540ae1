//! The boundary between the hypervisor logic and the processor.

use super::cpu::CpuInfo;

/// Represents an implementation of a hardware-assisted virtualization extension.
pub trait Extension {
    /// Identifies the processor.
    fn identify(&self) -> CpuInfo;

    /// Enables the hardware-assisted virtualization extension. The host
    /// state is saved to the page at `host_save_area_pa` on VM-entry.
    fn enable(&mut self, host_save_area_pa: u64);

    /// Runs the guest described by the VMCB at `vmcb_pa` until #VMEXIT occurs.
    fn run(&mut self, vmcb_pa: u64);
}
