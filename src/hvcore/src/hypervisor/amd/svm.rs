//! Enabling SVM and entering the guest with VMRUN.

use core::arch::asm;

use crate::hypervisor::{
    cpu::CpuInfo,
    host::Extension,
    x86_instructions::{rdmsr, wrmsr},
};

use super::vmcb::EFER_SVME;

/// The VM_HSAVE_PA MSR.
///
/// See: 15.30.4 VM_HSAVE_PA MSR (C001_0117h)
const SVM_MSR_VM_HSAVE_PA: u32 = 0xc001_0117;

/// AMD Secure Virtual Machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct Svm;

impl Extension for Svm {
    fn identify(&self) -> CpuInfo {
        CpuInfo::identify()
    }

    fn enable(&mut self, host_save_area_pa: u64) {
        // Enable SVM. We assume the processor is compatible with this.
        // See: 15.4 Enabling SVM
        wrmsr(x86::msr::IA32_EFER, rdmsr(x86::msr::IA32_EFER) | EFER_SVME);

        // Need to specify the address of the host state-save area before executing
        // the VMRUN instruction. The host state-save area is where the processor
        // saves the host (ie, current) register values on execution of `VMRUN`.
        //
        // "The VMRUN instruction saves some host processor state information in
        //  the host state-save area in main memory at the physical address
        //  specified in the VM_HSAVE_PA MSR".
        // See: 15.5.1 Basic Operation
        wrmsr(SVM_MSR_VM_HSAVE_PA, host_save_area_pa);
    }

    fn run(&mut self, vmcb_pa: u64) {
        // VMRUN loads the guest state from the VMCB and returns to the next
        // instruction on #VMEXIT. Only RAX, RSP and RIP of the host are restored
        // by the processor, so every other general purpose register is
        // clobbered. RBX and RBP cannot be named as operands and are saved here.
        unsafe {
            asm!(
                "push rbx",
                "push rbp",
                "vmrun rax",
                "pop rbp",
                "pop rbx",
                inout("rax") vmcb_pa => _,
                out("rcx") _,
                out("rdx") _,
                out("rsi") _,
                out("rdi") _,
                out("r8") _,
                out("r9") _,
                out("r10") _,
                out("r11") _,
                out("r12") _,
                out("r13") _,
                out("r14") _,
                out("r15") _,
            );
        }
    }
}
