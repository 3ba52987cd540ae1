//! Decoding of #VMEXIT.
//!
//! See: Appendix C SVM Intercept Exit Codes

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use super::vmcb::Vmcb;

/// Exit codes 96 to 136, the intercepts other than the control and debug
/// register accesses and the exceptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, derive_more::Display)]
#[repr(u64)]
pub(crate) enum Intercept {
    #[display("INTR")]
    Intr = 96,
    #[display("NMI")]
    Nmi = 97,
    #[display("SMI")]
    Smi = 98,
    #[display("INIT")]
    Init = 99,
    #[display("VINTR")]
    Vintr = 100,
    #[display("CR0_SEL_WRITE")]
    Cr0SelWrite = 101,
    #[display("IDTR_READ")]
    IdtrRead = 102,
    #[display("GDTR_READ")]
    GdtrRead = 103,
    #[display("LDTR_READ")]
    LdtrRead = 104,
    #[display("TR_READ")]
    TrRead = 105,
    #[display("IDTR_WRITE")]
    IdtrWrite = 106,
    #[display("GDTR_WRITE")]
    GdtrWrite = 107,
    #[display("LDTR_WRITE")]
    LdtrWrite = 108,
    #[display("TR_WRITE")]
    TrWrite = 109,
    #[display("RDTSC")]
    Rdtsc = 110,
    #[display("RDPMC")]
    Rdpmc = 111,
    #[display("PUSHF")]
    Pushf = 112,
    #[display("POPF")]
    Popf = 113,
    #[display("CPUID")]
    Cpuid = 114,
    #[display("RSM")]
    Rsm = 115,
    #[display("IRET")]
    Iret = 116,
    #[display("SWINT")]
    Swint = 117,
    #[display("INVD")]
    Invd = 118,
    #[display("PAUSE")]
    Pause = 119,
    #[display("HLT")]
    Hlt = 120,
    #[display("INVLPG")]
    Invlpg = 121,
    #[display("INVLPGA")]
    Invlpga = 122,
    #[display("IOIO")]
    Ioio = 123,
    #[display("MSR")]
    Msr = 124,
    #[display("TASK_SWITCH")]
    TaskSwitch = 125,
    #[display("FERR_FREEZE")]
    FerrFreeze = 126,
    #[display("SHUTDOWN")]
    Shutdown = 127,
    #[display("VMRUN")]
    Vmrun = 128,
    #[display("VMMCALL")]
    Vmmcall = 129,
    #[display("VMLOAD")]
    Vmload = 130,
    #[display("VMSAVE")]
    Vmsave = 131,
    #[display("STGI")]
    Stgi = 132,
    #[display("CLGI")]
    Clgi = 133,
    #[display("SKINIT")]
    Skinit = 134,
    #[display("RDTSCP")]
    Rdtscp = 135,
    #[display("ICEBP")]
    Icebp = 136,
}

const VMEXIT_EXCEPTION_PF: u64 = 64 + 14;
const VMEXIT_NPF: u64 = 0x400;
const VMEXIT_INVALID: u64 = u64::MAX;

/// Why the guest exited, decoded from EXITCODE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub(crate) enum VmExitReason {
    #[display("CR{_0}_READ")]
    CrRead(u8),
    #[display("CR{_0}_WRITE")]
    CrWrite(u8),
    #[display("DR{_0}_READ")]
    DrRead(u8),
    #[display("DR{_0}_WRITE")]
    DrWrite(u8),
    #[display("EXCP (page fault)")]
    PageFault,
    #[display("EXCP ({})", exception_name(*_0))]
    Exception(u8),
    #[display("{_0}")]
    Intercept(Intercept),
    #[display("NPF (nested-paging: host-level page fault)")]
    NestedPageFault,
    #[display("INVALID")]
    Invalid,
    #[display("{_0:#x}")]
    Unknown(u64),
}

impl From<u64> for VmExitReason {
    fn from(exit_code: u64) -> Self {
        match exit_code {
            0..=15 => Self::CrRead(exit_code as u8),
            16..=31 => Self::CrWrite(exit_code as u8 - 16),
            32..=47 => Self::DrRead(exit_code as u8 - 32),
            48..=63 => Self::DrWrite(exit_code as u8 - 48),
            VMEXIT_EXCEPTION_PF => Self::PageFault,
            64..=95 => Self::Exception(exit_code as u8 - 64),
            VMEXIT_NPF => Self::NestedPageFault,
            VMEXIT_INVALID => Self::Invalid,
            _ => Intercept::from_u64(exit_code).map_or(Self::Unknown(exit_code), Self::Intercept),
        }
    }
}

impl VmExitReason {
    /// Returns whether EXITINFO1 holds a page fault error code and EXITINFO2
    /// the faulting address.
    pub(crate) fn is_page_fault(&self) -> bool {
        matches!(self, Self::PageFault | Self::NestedPageFault)
    }
}

fn exception_name(vector: u8) -> &'static str {
    match vector {
        0 => "divide-by-zero-error",
        1 => "debug",
        2 => "non-maskable-interrupt",
        3 => "breakpoint",
        4 => "overflow",
        5 => "bound-range",
        6 => "invalid-opcode",
        7 => "device-not-available",
        8 => "double-fault",
        10 => "invalid-tss",
        11 => "segment-not-present",
        12 => "stack",
        13 => "general-protection",
        14 => "page-fault",
        16 => "x87 floating-point exception-pending",
        17 => "alignment-check",
        18 => "machine-check",
        19 => "simd floating-point",
        _ => "reserved",
    }
}

bitfield::bitfield! {
    /// The error code of a (nested) page fault, held in EXITINFO1.
    ///
    /// See: 8.4.2 Page-Fault Error Code
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub(crate) struct PageFaultErrorCode(u64);
    impl Debug;
    pub(crate) protection_violation, _: 0;
    pub(crate) write, _: 1;
    pub(crate) user, _: 2;
}

impl PageFaultErrorCode {
    pub(crate) fn cause(&self) -> &'static str {
        if self.protection_violation() {
            "page fault was caused by a page-protection violation"
        } else {
            "page fault was caused by a not-present page"
        }
    }

    pub(crate) fn access(&self) -> &'static str {
        if self.write() {
            "memory access was write"
        } else {
            "memory access was read"
        }
    }

    pub(crate) fn mode(&self) -> &'static str {
        if self.user() {
            "an access in user mode caused the page fault"
        } else {
            "an access in supervisor mode caused the page fault"
        }
    }
}

/// The guest state worth looking at after #VMEXIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExitReport {
    pub(crate) reason: VmExitReason,
    pub(crate) rip: u64,
    pub(crate) cpl: u8,
    pub(crate) cr0: u64,
    pub(crate) cr3: u64,
    pub(crate) cr4: u64,
    pub(crate) rflags: u64,
    pub(crate) efer: u64,
    pub(crate) cs_attrib: u16,
    pub(crate) ds_attrib: u16,
    pub(crate) exit_info1: u64,
    pub(crate) exit_info2: u64,
}

impl ExitReport {
    pub(crate) fn capture(vmcb: &Vmcb) -> Self {
        let control = &vmcb.control_area;
        let state = &vmcb.state_save_area;
        Self {
            reason: VmExitReason::from(control.exit_code),
            rip: state.rip,
            cpl: state.cpl,
            cr0: state.cr0,
            cr3: state.cr3,
            cr4: state.cr4,
            rflags: state.rflags,
            efer: state.efer,
            cs_attrib: state.cs.attrib,
            ds_attrib: state.ds.attrib,
            exit_info1: control.exit_info1,
            exit_info2: control.exit_info2,
        }
    }

    /// The page fault error code, for exits caused by page faults.
    pub(crate) fn error_code(&self) -> Option<PageFaultErrorCode> {
        self.reason
            .is_page_fault()
            .then_some(PageFaultErrorCode(self.exit_info1))
    }

    pub(crate) fn log(&self) {
        log::info!("#VMEXIT: {}", self.reason);
        log::info!("VMCB: rip={:#x}", self.rip);
        log::info!("cpl={:#x}", self.cpl);
        log::info!(
            "cr0={:#x}, cr3={:#x}, cr4={:#x}",
            self.cr0,
            self.cr3,
            self.cr4
        );
        log::info!("rflags={:#x}, efer={:#x}", self.rflags, self.efer);
        log::info!(
            "cs.attrs={:#x}, ds.attrs={:#x}",
            self.cs_attrib,
            self.ds_attrib
        );
        if let Some(error_code) = self.error_code() {
            log::info!(
                "error_code={:#x}, fault address={:#x}",
                self.exit_info1,
                self.exit_info2
            );
            log::info!("{}", error_code.cause());
            log::info!("{}", error_code.access());
            log::info!("{}", error_code.mode());
        } else {
            log::info!(
                "exitinfo1={:#x}, exitinfo2={:#x}",
                self.exit_info1,
                self.exit_info2
            );
        }
    }
}
