//! Simulated physical memory and hardware for unit tests.

use std::{vec, vec::Vec};

use x86::bits64::paging::BASE_PAGE_SIZE;

use super::{
    allocator::PhysicalAllocator,
    amd::vmcb::Vmcb,
    cpu::{CpuInfo, tests::amd_with_svm},
    direct_map::DirectMap,
    elf::{PF_R, PF_X, PT_LOAD},
    host::Extension,
    memory_map::{MemoryRegion, PhysicalLayout, RegionKind},
};

/// The structure representing a single memory page (4KB).
#[derive(Clone)]
#[repr(C, align(4096))]
struct Page(#[allow(dead_code)] [u8; BASE_PAGE_SIZE]);

impl Default for Page {
    fn default() -> Self {
        Self([0; BASE_PAGE_SIZE])
    }
}

/// A page-aligned host buffer standing in for physical memory starting at
/// address zero. The direct map offset is the buffer's address, so physical
/// addresses are used exactly as on hardware.
pub(crate) struct TestMemory {
    pages: Vec<Page>,
    dm: DirectMap,
}

impl TestMemory {
    pub(crate) const DEFAULT_SIZE: u64 = 0x100_0000;
    pub(crate) const VM_SIZE: u64 = 0x200_0000;
    pub(crate) const VMM_IMAGE_END: u64 = 0x20_0000;
    pub(crate) const HEAP_END: u64 = 0x40_0000;

    pub(crate) fn new(size: u64) -> Self {
        let mut pages = vec![Page::default(); (size / 0x1000) as usize];
        let base = pages.as_mut_ptr() as u64;
        Self {
            pages,
            dm: unsafe { DirectMap::new(base) },
        }
    }

    pub(crate) fn dm(&self) -> DirectMap {
        self.dm
    }

    pub(crate) fn size(&self) -> u64 {
        self.pages.len() as u64 * 0x1000
    }

    /// Low RAM, the legacy hole, then RAM up to the end of the buffer.
    pub(crate) fn regions(&self) -> [MemoryRegion; 3] {
        [
            MemoryRegion::new(0, 0x9_f000, RegionKind::Ram),
            MemoryRegion::new(0x9_f000, 0x6_1000, RegionKind::Reserved),
            MemoryRegion::new(0x10_0000, self.size() - 0x10_0000, RegionKind::Ram),
        ]
    }

    pub(crate) fn layout(&self) -> PhysicalLayout {
        PhysicalLayout::new(&self.regions(), Self::HEAP_END)
    }

    pub(crate) fn allocator(&self) -> PhysicalAllocator {
        self.allocator_with(&mut self.layout())
    }

    pub(crate) fn allocator_with(&self, layout: &mut PhysicalLayout) -> PhysicalAllocator {
        PhysicalAllocator::new(self.dm, &self.regions(), layout, Self::VMM_IMAGE_END).unwrap()
    }

    pub(crate) fn write(&self, pa: u64, bytes: &[u8]) {
        assert!(pa + bytes.len() as u64 <= self.size());
        unsafe { self.dm.bytes_mut(pa, bytes.len()) }.copy_from_slice(bytes);
    }
}

/// SVM that exits immediately with the given exit code and information.
pub(crate) struct FakeSvm {
    dm: DirectMap,
    exit_code: u64,
    exit_info1: u64,
    exit_info2: u64,
    pub(crate) cpu: CpuInfo,
    pub(crate) enabled_with: Option<u64>,
    pub(crate) last_vmcb_pa: Option<u64>,
    pub(crate) runs: usize,
}

impl FakeSvm {
    pub(crate) fn new(dm: DirectMap, exit_code: u64, exit_info1: u64, exit_info2: u64) -> Self {
        Self {
            dm,
            exit_code,
            exit_info1,
            exit_info2,
            cpu: amd_with_svm(),
            enabled_with: None,
            last_vmcb_pa: None,
            runs: 0,
        }
    }
}

impl Extension for FakeSvm {
    fn identify(&self) -> CpuInfo {
        self.cpu
    }

    fn enable(&mut self, host_save_area_pa: u64) {
        self.enabled_with = Some(host_save_area_pa);
    }

    fn run(&mut self, vmcb_pa: u64) {
        let vmcb = unsafe { self.dm.as_mut::<Vmcb>(vmcb_pa) };
        vmcb.control_area.exit_code = self.exit_code;
        vmcb.control_area.exit_info1 = self.exit_info1;
        vmcb.control_area.exit_info2 = self.exit_info2;
        self.last_vmcb_pa = Some(vmcb_pa);
        self.runs += 1;
    }
}

/// A program header of a generated ELF image. The file contents of the n-th
/// segment are bytes of value n + 1.
#[derive(Clone, Copy)]
pub(crate) struct Segment {
    flags: u32,
    paddr: u64,
    filesz: u64,
    memsz: u64,
}

impl Segment {
    pub(crate) fn new(flags: u32, paddr: u64, filesz: u64, memsz: u64) -> Self {
        Self {
            flags,
            paddr,
            filesz,
            memsz,
        }
    }
}

/// An ELF32 image with one executable segment at physical address zero whose
/// contents start at file offset 0x1000.
pub(crate) fn elf32_image(filesz: u64, memsz: u64, entry: u64) -> Vec<u8> {
    elf_image(false, &[Segment::new(PF_R | PF_X, 0, filesz, memsz)], entry)
}

/// Generates a little-endian executable. Segment contents are laid out from
/// file offset 0x1000, each starting on a page boundary.
pub(crate) fn elf_image(elf64: bool, segments: &[Segment], entry: u64) -> Vec<u8> {
    let (ehsize, phentsize) = if elf64 { (0x40, 0x38) } else { (0x34, 0x20) };
    let mut image = vec![0u8; 0x1000];

    image[..4].copy_from_slice(b"\x7fELF");
    image[4] = if elf64 { 2 } else { 1 };
    image[5] = 1;
    image[6] = 1;
    put(&mut image, 0x10, 2u16.to_le_bytes());
    put(&mut image, 0x12, if elf64 { 62u16 } else { 3u16 }.to_le_bytes());
    put(&mut image, 0x14, 1u32.to_le_bytes());
    if elf64 {
        put(&mut image, 0x18, entry.to_le_bytes());
        put(&mut image, 0x20, (ehsize as u64).to_le_bytes());
        put(&mut image, 0x34, (ehsize as u16).to_le_bytes());
        put(&mut image, 0x36, (phentsize as u16).to_le_bytes());
        put(&mut image, 0x38, (segments.len() as u16).to_le_bytes());
    } else {
        put(&mut image, 0x18, (entry as u32).to_le_bytes());
        put(&mut image, 0x1c, (ehsize as u32).to_le_bytes());
        put(&mut image, 0x28, (ehsize as u16).to_le_bytes());
        put(&mut image, 0x2a, (phentsize as u16).to_le_bytes());
        put(&mut image, 0x2c, (segments.len() as u16).to_le_bytes());
    }

    for (index, segment) in segments.iter().enumerate() {
        let offset = image.len() as u64;
        let header = ehsize + index * phentsize;
        if elf64 {
            put(&mut image, header, PT_LOAD.to_le_bytes());
            put(&mut image, header + 0x04, segment.flags.to_le_bytes());
            put(&mut image, header + 0x08, offset.to_le_bytes());
            put(&mut image, header + 0x10, segment.paddr.to_le_bytes());
            put(&mut image, header + 0x18, segment.paddr.to_le_bytes());
            put(&mut image, header + 0x20, segment.filesz.to_le_bytes());
            put(&mut image, header + 0x28, segment.memsz.to_le_bytes());
            put(&mut image, header + 0x30, 0x1000u64.to_le_bytes());
        } else {
            put(&mut image, header, PT_LOAD.to_le_bytes());
            put(&mut image, header + 0x04, (offset as u32).to_le_bytes());
            put(&mut image, header + 0x08, (segment.paddr as u32).to_le_bytes());
            put(&mut image, header + 0x0c, (segment.paddr as u32).to_le_bytes());
            put(&mut image, header + 0x10, (segment.filesz as u32).to_le_bytes());
            put(&mut image, header + 0x14, (segment.memsz as u32).to_le_bytes());
            put(&mut image, header + 0x18, segment.flags.to_le_bytes());
            put(&mut image, header + 0x1c, 0x1000u32.to_le_bytes());
        }

        let contents_end = image.len() + segment.filesz as usize;
        image.resize(contents_end, index as u8 + 1);
        image.resize(contents_end.next_multiple_of(0x1000), 0);
    }
    image
}

fn put<const N: usize>(image: &mut [u8], offset: usize, bytes: [u8; N]) {
    image[offset..offset + N].copy_from_slice(&bytes);
}
