//! The virtual machine control block (VMCB) and how the guest's initial state
//! is written into it.

use x86::{
    bits64::{paging::BASE_PAGE_SHIFT, rflags::RFlags},
    controlregs::{Cr0, Cr4},
};

use crate::hypervisor::{allocator::PhysicalAllocator, error::HvError, support::page_up};

pub(crate) const EFER_LME: u64 = 1 << 8;
pub(crate) const EFER_LMA: u64 = 1 << 10;
pub(crate) const EFER_SVME: u64 = 1 << 12;

pub(crate) const SVM_INTERCEPT_MISC2_VMRUN: u32 = 1 << 0;
const SVM_NP_ENABLE_NP_ENABLE: u64 = 1 << 0;

/// The value a multiboot-compliant OS expects in EAX on entry.
pub(crate) const MULTIBOOT_BOOTLOADER_MAGIC: u64 = 0x2bad_b002;

/// The guest CR3 on entry. Points to the temporary paging structures installed
/// in guest memory.
pub(crate) const GUEST_INITIAL_CR3: u64 = 0x20_3000;

/// PA0-PA3 = WB, WT, UC-, UC, repeated.
pub(crate) const GUEST_PAT: u64 = 0x0007_0406_0007_0406;

/// The size of the I/O permissions map.
///
/// See: 15.10.1 I/O Permissions Map
pub(crate) const IOPM_SIZE: u64 = 12 << 10;

/// The size of the MSR permissions map.
///
/// See: 15.11 MSR Intercepts
pub(crate) const MSRPM_SIZE: u64 = 8 << 10;

/// The virtual machine control block (VMCB), which describes a virtual machine
/// (guest) to be executed.
///
/// See: Appendix B Layout of VMCB
#[derive(Debug, Default)]
#[repr(C, align(4096))]
pub(crate) struct Vmcb {
    pub(crate) control_area: ControlArea,
    pub(crate) state_save_area: StateSaveArea,
}
const _: () = assert!(size_of::<Vmcb>() == 0x1000);

/// The "metadata" area where we can specify what operations to intercept and
/// can read details of #VMEXIT.
///
/// See: Table B-1. VMCB Layout, Control Area
#[derive(derivative::Derivative)]
#[derivative(Debug, Default)]
#[repr(C)]
pub(crate) struct ControlArea {
    pub(crate) intercept_cr_read: u16,   // +0x000
    pub(crate) intercept_cr_write: u16,  // +0x002
    pub(crate) intercept_dr_read: u16,   // +0x004
    pub(crate) intercept_dr_write: u16,  // +0x006
    pub(crate) intercept_exception: u32, // +0x008
    pub(crate) intercept_misc1: u32,     // +0x00c
    pub(crate) intercept_misc2: u32,     // +0x010
    pub(crate) intercept_misc3: u32,     // +0x014
    #[derivative(Debug = "ignore", Default(value = "[0; 36]"))]
    _padding1: [u8; 0x03c - 0x018], // +0x018
    pub(crate) pause_filter_threshold: u16, // +0x03c
    pub(crate) pause_filter_count: u16,  // +0x03e
    pub(crate) iopm_base_pa: u64,        // +0x040
    pub(crate) msrpm_base_pa: u64,       // +0x048
    pub(crate) tsc_offset: u64,          // +0x050
    pub(crate) guest_asid: u32,          // +0x058
    pub(crate) tlb_control: u32,         // +0x05c
    pub(crate) vintr: u64,               // +0x060
    pub(crate) interrupt_shadow: u64,    // +0x068
    pub(crate) exit_code: u64,           // +0x070
    pub(crate) exit_info1: u64,          // +0x078
    pub(crate) exit_info2: u64,          // +0x080
    pub(crate) exit_int_info: u64,       // +0x088
    pub(crate) np_enable: u64,           // +0x090
    pub(crate) avic_apic_bar: u64,       // +0x098
    pub(crate) guest_pa_pf_ghcb: u64,    // +0x0a0
    pub(crate) event_inj: u64,           // +0x0a8
    pub(crate) ncr3: u64,                // +0x0b0
    pub(crate) lbr_virtualization_enable: u64, // +0x0b8
    pub(crate) vmcb_clean: u32,          // +0x0c0
    _reserved: u32,               // +0x0c4
    pub(crate) nrip: u64,                // +0x0c8
    pub(crate) num_of_bytes_fetched: u8, // +0x0d0
    pub(crate) guest_instruction_bytes: [u8; 15], // +0x0d1
    #[derivative(Debug = "ignore", Default(value = "[0; 800]"))]
    _padding2: [u8; 0x400 - 0x0e0], // +0x0e0
}
const _: () = assert!(size_of::<ControlArea>() == 0x400);

/// A segment register in the state save area.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub(crate) struct Segment {
    pub(crate) selector: u16,
    pub(crate) attrib: u16,
    pub(crate) limit: u32,
    pub(crate) base: u64,
}
const _: () = assert!(size_of::<Segment>() == 0x10);

impl Segment {
    /// A flat segment (base 0, maximum limit) with the given attributes.
    pub(crate) fn flat(attrib: SegmentAttribute) -> Self {
        Self {
            selector: 0,
            attrib: attrib.0,
            limit: 0xf_ffff,
            base: 0,
        }
    }

    pub(crate) fn attributes(&self) -> SegmentAttribute {
        SegmentAttribute(self.attrib)
    }
}

bitfield::bitfield! {
    /// The packed form of the segment descriptor attributes the VMCB holds.
    ///
    /// See: 15.5.1 Basic Operation, "Segment State in the VMCB"
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub(crate) struct SegmentAttribute(u16);
    impl Debug;
    pub(crate) segment_type, set_segment_type: 3, 0;
    pub(crate) s, set_s: 4;
    pub(crate) dpl, set_dpl: 6, 5;
    pub(crate) p, set_p: 7;
    pub(crate) avl, set_avl: 8;
    pub(crate) l, set_l: 9;
    pub(crate) db, set_db: 10;
    pub(crate) g, set_g: 11;
}

impl SegmentAttribute {
    /// Present, non-system, long mode, execute/read code segment.
    pub(crate) fn long_mode_code() -> Self {
        let mut attrib = Self(0);
        attrib.set_segment_type(0xa);
        attrib.set_s(true);
        attrib.set_p(true);
        attrib.set_l(true);
        attrib
    }

    /// Present, non-system, read/write data segment.
    pub(crate) fn data() -> Self {
        let mut attrib = Self(0);
        attrib.set_segment_type(0x2);
        attrib.set_s(true);
        attrib.set_p(true);
        attrib
    }
}

/// The area to specify and read guest register values.
///
/// See: Table B-2. VMCB Layout, State Save Area
#[derive(derivative::Derivative)]
#[derivative(Debug, Default)]
#[repr(C)]
pub(crate) struct StateSaveArea {
    pub(crate) es: Segment,    // +0x000
    pub(crate) cs: Segment,    // +0x010
    pub(crate) ss: Segment,    // +0x020
    pub(crate) ds: Segment,    // +0x030
    pub(crate) fs: Segment,    // +0x040
    pub(crate) gs: Segment,    // +0x050
    pub(crate) gdtr: Segment,  // +0x060
    pub(crate) ldtr: Segment,  // +0x070
    pub(crate) idtr: Segment,  // +0x080
    pub(crate) tr: Segment,    // +0x090
    #[derivative(Debug = "ignore", Default(value = "[0; 43]"))]
    _padding1: [u8; 0x0cb - 0x0a0], // +0x0a0
    pub(crate) cpl: u8,        // +0x0cb
    #[derivative(Debug = "ignore")]
    _padding2: u32,     // +0x0cc
    pub(crate) efer: u64,      // +0x0d0
    #[derivative(Debug = "ignore", Default(value = "[0; 112]"))]
    _padding3: [u8; 0x148 - 0x0d8], // +0x0d8
    pub(crate) cr4: u64,       // +0x148
    pub(crate) cr3: u64,       // +0x150
    pub(crate) cr0: u64,       // +0x158
    pub(crate) dr7: u64,       // +0x160
    pub(crate) dr6: u64,       // +0x168
    pub(crate) rflags: u64,    // +0x170
    pub(crate) rip: u64,       // +0x178
    #[derivative(Debug = "ignore", Default(value = "[0; 88]"))]
    _padding4: [u8; 0x1d8 - 0x180], // +0x180
    pub(crate) rsp: u64,       // +0x1d8
    pub(crate) s_cet: u64,     // +0x1e0
    pub(crate) ssp: u64,       // +0x1e8
    pub(crate) isst_addr: u64, // +0x1f0
    pub(crate) rax: u64,       // +0x1f8
    pub(crate) star: u64,      // +0x200
    pub(crate) lstar: u64,     // +0x208
    pub(crate) cstar: u64,     // +0x210
    pub(crate) sf_mask: u64,   // +0x218
    pub(crate) kernel_gs_base: u64, // +0x220
    pub(crate) sysenter_cs: u64,  // +0x228
    pub(crate) sysenter_esp: u64, // +0x230
    pub(crate) sysenter_eip: u64, // +0x238
    pub(crate) cr2: u64,       // +0x240
    #[derivative(Debug = "ignore", Default(value = "[0; 32]"))]
    _padding5: [u8; 0x268 - 0x248], // +0x248
    pub(crate) gpat: u64,      // +0x268
    pub(crate) dbg_ctl: u64,   // +0x270
    pub(crate) br_from: u64,   // +0x278
    pub(crate) br_to: u64,     // +0x280
    pub(crate) last_excep_from: u64, // +0x288
    pub(crate) last_excep_to: u64,   // +0x290
    #[derivative(Debug = "ignore", Default(value = "[0; 71]"))]
    _padding6: [u8; 0x2df - 0x298], // +0x298
    pub(crate) spec_ctl: u64,  // +0x2e0
    #[derivative(Debug = "ignore", Default(value = "[0; 0x918]"))]
    _padding7: [u8; 0x1000 - 0x400 - 0x2e8], // +0x2e8
}
const _: () = assert!(size_of::<StateSaveArea>() == 0x1000 - 0x400);

/// The TLB_CONTROL field values.
///
/// See: 15.16.2 TLB Flush
#[allow(dead_code)]
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum TlbControl {
    DoNotFlush = 0x0,
    FlushAll = 0x1,
    FlushGuests = 0x3,
    FlushGuestsNonGlobal = 0x7,
}

impl Vmcb {
    /// Logs the control area and the state save area, including every segment
    /// register.
    pub(crate) fn dump(&self) {
        let control = &self.control_area;
        let state = &self.state_save_area;
        log::info!("Dumping guest's current state");
        log::info!(
            "cr_intercepts = {:#x}/{:#x} dr_intercepts = {:#x}/{:#x} exception_intercepts = {:#x}",
            control.intercept_cr_read,
            control.intercept_cr_write,
            control.intercept_dr_read,
            control.intercept_dr_write,
            control.intercept_exception
        );
        log::info!(
            "misc1_intercepts = {:#x} misc2_intercepts = {:#x}",
            control.intercept_misc1,
            control.intercept_misc2
        );
        log::info!(
            "iopm_base_pa = {:#x} msrpm_base_pa = {:#x} tsc_offset = {:#x}",
            control.iopm_base_pa,
            control.msrpm_base_pa,
            control.tsc_offset
        );
        log::info!(
            "tlb_control = {:#x} vintr = {:#x} interrupt_shadow = {:#x}",
            control.tlb_control,
            control.vintr,
            control.interrupt_shadow
        );
        log::info!(
            "exitcode = {:#x} exitintinfo = {:#x}",
            control.exit_code,
            control.exit_int_info
        );
        log::info!(
            "exitinfo1 = {:#x} exitinfo2 = {:#x}",
            control.exit_info1,
            control.exit_info2
        );
        log::info!(
            "np_enable = {:#x} ncr3 = {:#x} guest_asid = {:#x}",
            control.np_enable,
            control.ncr3,
            control.guest_asid
        );
        log::info!(
            "cpl = {:#x} efer = {:#x} star = {:#x} lstar = {:#x}",
            state.cpl,
            state.efer,
            state.star,
            state.lstar
        );
        log::info!("CR0 = {:#x} CR2 = {:#x}", state.cr0, state.cr2);
        log::info!("CR3 = {:#x} CR4 = {:#x}", state.cr3, state.cr4);
        log::info!("RSP = {:#x} RIP = {:#x}", state.rsp, state.rip);
        log::info!("RAX = {:#x} RFLAGS = {:#x}", state.rax, state.rflags);
        log::info!("DR6 = {:#x} DR7 = {:#x}", state.dr6, state.dr7);
        log::info!("CSTAR = {:#x} SFMask = {:#x}", state.cstar, state.sf_mask);
        log::info!(
            "KernGSBase = {:#x} PAT = {:#x}",
            state.kernel_gs_base,
            state.gpat
        );
        for (name, segment) in [
            ("CS", &state.cs),
            ("DS", &state.ds),
            ("SS", &state.ss),
            ("ES", &state.es),
            ("FS", &state.fs),
            ("GS", &state.gs),
            ("GDTR", &state.gdtr),
            ("LDTR", &state.ldtr),
            ("IDTR", &state.idtr),
            ("TR", &state.tr),
        ] {
            log::info!(
                "{name}: sel={:#x}, attr={:#x}, limit={:#x}, base={:#x}",
                segment.selector,
                segment.attrib,
                segment.limit,
                segment.base
            );
        }
    }
}

/// Sets up interception and nested paging. The permission maps are allocated
/// here and intercept every port and MSR.
pub(crate) fn build_control_area(
    vmcb: &mut Vmcb,
    allocator: &mut PhysicalAllocator,
) -> Result<(), HvError> {
    let control = &mut vmcb.control_area;

    // Enable nested paging. The nested PML4 is set with the guest state.
    // See: 15.25.3 Enabling Nested Paging
    control.np_enable = SVM_NP_ENABLE_NP_ENABLE;
    control.tlb_control = TlbControl::FlushAll as _;
    control.tsc_offset = 0;

    // Address Space Identifier (ASID) is useful when the given logical processor
    // runs more than one guests. We do not but still need to set non-zero value.
    // See: 15.16 TLB Control
    control.guest_asid = 1;

    // "The VMRUN instruction must be intercepted, or the consistency check
    //  fails."
    // See: 15.5.1 Basic Operation
    control.intercept_misc2 = SVM_INTERCEPT_MISC2_VMRUN;

    control.iopm_base_pa = create_intercept_table(allocator, IOPM_SIZE)?;
    control.msrpm_base_pa = create_intercept_table(allocator, MSRPM_SIZE)?;
    log::debug!(
        "IOPM at {:#x}, MSRPM at {:#x}",
        control.iopm_base_pa,
        control.msrpm_base_pa
    );
    Ok(())
}

/// Sets the guest state a multiboot-compliant OS expects on entry, and the
/// addresses the guest starts executing and translating at.
pub(crate) fn build_state_save_area(vmcb: &mut Vmcb, entry_point: u64, nested_cr3: u64) {
    let state = &mut vmcb.state_save_area;

    // Must be equal to SS.DPL.
    state.cpl = 0;
    state.rax = MULTIBOOT_BOOTLOADER_MAGIC;
    // The OS image must create its own stack as soon as it needs one.
    state.rsp = 0;

    // Multiboot requires PG clear here. Both PE and PG are set, and the
    // temporary paging structures at `GUEST_INITIAL_CR3` back this.
    // TODO: Confirm whether the guest entry code tolerates PG=0 and drop it.
    state.cr0 = (Cr0::CR0_PROTECTED_MODE | Cr0::CR0_ENABLE_PAGING).bits() as u64;
    state.cr3 = GUEST_INITIAL_CR3;
    state.cr4 = (Cr4::CR4_ENABLE_PAE | Cr4::CR4_ENABLE_GLOBAL_PAGES).bits() as u64;
    // VM and IF must be clear.
    state.rflags = RFlags::FLAGS_A1.bits();
    state.gpat = GUEST_PAT;
    state.efer = EFER_LME | EFER_LMA | EFER_SVME;

    state.cs = Segment::flat(SegmentAttribute::long_mode_code());
    let data = Segment::flat(SegmentAttribute::data());
    state.ss = data;
    state.ds = data;
    state.es = data;
    state.fs = data;
    state.gs = data;

    state.rip = entry_point;
    vmcb.control_area.ncr3 = nested_cr3;
}

/// Allocates a permissions map of `size` bytes that intercepts everything and
/// returns its physical address.
pub(crate) fn create_intercept_table(
    allocator: &mut PhysicalAllocator,
    size: u64,
) -> Result<u64, HvError> {
    let pa = allocator.allocate(page_up(size) >> BASE_PAGE_SHIFT, 1)? << BASE_PAGE_SHIFT;
    // Safety: the frames were just allocated and nothing refers to them.
    unsafe { allocator.direct_map().fill(pa, 0xff, size as usize) };
    Ok(pa)
}
