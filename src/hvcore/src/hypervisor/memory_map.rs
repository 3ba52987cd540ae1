//! The normalized physical memory map and the layout derived from it.

use super::support::{pfn_down, pfn_up};

/// The type of a physical memory region, as reported by the BIOS (E820).
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum RegionKind {
    /// Usable RAM (type 1).
    #[display("RAM")]
    Ram,
    /// Reserved by the firmware (type 2).
    #[display("Reserved")]
    Reserved,
    /// ACPI tables, reclaimable once they are read (type 3).
    #[display("ACPI")]
    Acpi,
    /// ACPI non-volatile storage (type 4).
    #[display("NVS")]
    Nvs,
    /// Any other type code.
    #[display("Unknown({_0})")]
    Other(u32),
}

impl From<u32> for RegionKind {
    fn from(value: u32) -> Self {
        match value {
            1 => Self::Ram,
            2 => Self::Reserved,
            3 => Self::Acpi,
            4 => Self::Nvs,
            other => Self::Other(other),
        }
    }
}

/// A range of the physical address space, as handed over by the boot loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// The physical address of the first byte.
    pub base: u64,
    /// The size in bytes.
    pub length: u64,
    /// What the range is used for.
    pub kind: RegionKind,
}

impl MemoryRegion {
    /// Creates a region of `length` bytes at `base`.
    pub const fn new(base: u64, length: u64, kind: RegionKind) -> Self {
        Self { base, length, kind }
    }

    /// The physical address following the last byte of the region.
    pub const fn end(&self) -> u64 {
        self.base + self.length
    }

    /// Returns whether the allocator may hand out frames of this region.
    pub fn is_ram(&self) -> bool {
        self.kind == RegionKind::Ram
    }
}

/// The number of whole pages of RAM.
pub(crate) fn total_pages(regions: &[MemoryRegion]) -> u64 {
    regions
        .iter()
        .filter(|region| region.is_ram())
        .map(|region| region.length >> 12)
        .sum()
}

/// One past the highest page frame number backed by RAM.
pub(crate) fn max_page(regions: &[MemoryRegion]) -> u64 {
    regions
        .iter()
        .filter(|region| region.is_ram())
        .filter(|region| pfn_up(region.base) < pfn_down(region.end()))
        .map(|region| pfn_down(region.end()))
        .max()
        .unwrap_or(0)
}

/// Where things live in physical memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PhysicalLayout {
    /// One past the highest usable page frame number.
    pub(crate) max_page: u64,
    pub(crate) total_pages: u64,
    /// The first byte after the allocation bitmap. Set by the allocator.
    pub(crate) heap_start: u64,
    /// Nothing below this address is handed out by the allocator.
    pub(crate) heap_end: u64,
    /// Where the guest image was stashed. Set before the allocator is
    /// initialized so it can keep the range out.
    pub(crate) guest_image_start: u64,
    pub(crate) guest_image_size: u64,
}

impl PhysicalLayout {
    pub(crate) fn new(regions: &[MemoryRegion], heap_end: u64) -> Self {
        Self {
            max_page: max_page(regions),
            total_pages: total_pages(regions),
            heap_end,
            ..Self::default()
        }
    }

    /// The physical address following the last byte of the guest image.
    pub(crate) fn guest_image_end(&self) -> u64 {
        self.guest_image_start + self.guest_image_size
    }
}
