//! This module implements the 4-level paging structures with 2MB leaves, used
//! both for the address space of the hypervisor and for nested paging.

use bit_field::BitField;
use x86::bits64::paging::{BASE_PAGE_SHIFT, LARGE_PAGE_SIZE};

use super::{allocator::PhysicalAllocator, direct_map::DirectMap, error::HvError};

const LARGE_PAGE_SHIFT: u64 = 21;
const ENTRY_COUNT: usize = 512;

/// A level of the paging structures. Only the levels used with 2MB pages
/// exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub(crate) enum Level {
    #[display("PML4")]
    Pml4 = 4,
    #[display("PDP")]
    Pdp = 3,
    #[display("PD")]
    Pd = 2,
}

impl Level {
    /// The position of the lowest address bit that indexes this level.
    pub(crate) const fn shift(self) -> usize {
        match self {
            Self::Pml4 => 39,
            Self::Pdp => 30,
            Self::Pd => 21,
        }
    }

    /// Returns the index of the entry translating `vaddr` at this level.
    pub(crate) fn index(self, vaddr: u64) -> usize {
        let shift = self.shift();
        vaddr.get_bits(shift..shift + 9) as usize
    }

    /// The level the entries of this level point to, or `None` for the level
    /// holding 2MB pages.
    pub(crate) const fn lower(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdp),
            Self::Pdp => Some(Self::Pd),
            Self::Pd => None,
        }
    }

    pub(crate) const fn is_leaf(self) -> bool {
        self.lower().is_none()
    }
}

bitfield::bitfield! {
    /// A paging-structure entry. How the address bits read depends on the level
    /// the entry sits at, which is always known from the walk.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub(crate) struct Entry(u64);
    impl Debug;
    pub(crate) present, set_present: 0;
    pub(crate) writable, set_writable: 1;
    pub(crate) user, set_user: 2;
    pub(crate) large, set_large: 7;
    pub(crate) pfn, set_pfn: 51, 12;
    pub(crate) large_pfn, set_large_pfn: 51, 21;
}

impl Entry {
    /// An entry pointing to the next-level table at `table_pa`.
    pub(crate) fn table(table_pa: u64) -> Self {
        let mut entry = Self(0);
        entry.set_present(true);
        entry.set_writable(true);
        entry.set_user(true);
        entry.set_pfn(table_pa >> BASE_PAGE_SHIFT);
        entry
    }

    /// An entry mapping the 2MB page at `pa`.
    pub(crate) fn large_page(pa: u64, user: bool) -> Self {
        let mut entry = Self(0);
        entry.set_present(true);
        entry.set_writable(true);
        entry.set_user(user);
        entry.set_large(true);
        entry.set_large_pfn(pa >> LARGE_PAGE_SHIFT);
        entry
    }

    /// The physical address this entry points to when it sits at `level`.
    pub(crate) fn address(&self, level: Level) -> u64 {
        if level.is_leaf() {
            self.large_pfn() << LARGE_PAGE_SHIFT
        } else {
            self.pfn() << BASE_PAGE_SHIFT
        }
    }
}

/// A page of 512 entries.
#[derive(Debug, Clone, Copy)]
#[repr(C, align(4096))]
pub(crate) struct Table {
    pub(crate) entries: [Entry; ENTRY_COUNT],
}
const _: () = assert!(size_of::<Table>() == 0x1000);

/// A set of paging structures identified by the physical address of its PML4.
///
/// Every table is a frame taken from the physical allocator and owned by this
/// set. Tables are never freed.
#[derive(Debug)]
pub(crate) struct PageTable {
    dm: DirectMap,
    root: u64,
}

impl PageTable {
    /// Allocates an empty PML4.
    pub(crate) fn create_root(allocator: &mut PhysicalAllocator) -> Result<Self, HvError> {
        let root = allocator.allocate_zeroed(1, 1)?;
        Ok(Self {
            dm: allocator.direct_map(),
            root,
        })
    }

    /// The physical address of the PML4.
    pub(crate) fn root(&self) -> u64 {
        self.root
    }

    /// Maps the 2MB page at `vaddr` to the physical address `paddr`, allocating
    /// intermediate tables as needed.
    pub(crate) fn map(
        &mut self,
        allocator: &mut PhysicalAllocator,
        vaddr: u64,
        paddr: u64,
        user: bool,
    ) -> Result<(), HvError> {
        self.map_level(allocator, self.root, Level::Pml4, vaddr, paddr, user)
    }

    fn map_level(
        &mut self,
        allocator: &mut PhysicalAllocator,
        table_pa: u64,
        level: Level,
        vaddr: u64,
        paddr: u64,
        user: bool,
    ) -> Result<(), HvError> {
        // Safety: `table_pa` is a table owned by `self`, and `&mut self`
        // guarantees nothing else refers to it.
        let table = unsafe { self.dm.as_mut::<Table>(table_pa) };
        let entry = &mut table.entries[level.index(vaddr)];

        let Some(lower) = level.lower() else {
            *entry = Entry::large_page(paddr, user);
            return Ok(());
        };
        if !entry.present() {
            *entry = Entry::table(allocator.allocate_zeroed(1, 1)?);
        }
        let next = entry.address(level);
        self.map_level(allocator, next, lower, vaddr, paddr, user)
    }

    /// Returns the physical address `vaddr` is mapped to.
    pub(crate) fn translate(&self, vaddr: u64) -> Result<u64, HvError> {
        self.translate_level(self.root, Level::Pml4, vaddr)
    }

    fn translate_level(&self, table_pa: u64, level: Level, vaddr: u64) -> Result<u64, HvError> {
        let entry = self.table(table_pa).entries[level.index(vaddr)];
        if !entry.present() {
            return Err(HvError::NotPresent { level, vaddr });
        }
        match level.lower() {
            Some(lower) => self.translate_level(entry.address(level), lower, vaddr),
            None if entry.large() => {
                Ok(entry.address(level) + (vaddr & (LARGE_PAGE_SIZE as u64 - 1)))
            }
            None => Err(HvError::NotLargePage { vaddr }),
        }
    }

    /// Calls `visitor` with every present entry, parents before children.
    pub(crate) fn walk<F: FnMut(Level, usize, Entry)>(&self, mut visitor: F) {
        self.walk_level(self.root, Level::Pml4, &mut visitor);
    }

    fn walk_level<F>(&self, table_pa: u64, level: Level, visitor: &mut F)
    where
        F: FnMut(Level, usize, Entry),
    {
        for (index, entry) in self.table(table_pa).entries.iter().enumerate() {
            if !entry.present() {
                continue;
            }
            visitor(level, index, *entry);
            if let Some(lower) = level.lower() {
                self.walk_level(entry.address(level), lower, visitor);
            }
        }
    }

    /// Logs every present entry.
    pub(crate) fn dump(&self) {
        log::debug!("Paging structures at {:#x}", self.root);
        self.walk(|level, index, entry| {
            let indent = match level {
                Level::Pml4 => "",
                Level::Pdp => "  ",
                Level::Pd => "    ",
            };
            log::debug!(
                "{indent}{level}[{index:3}] {:#018x} {}{}{}",
                entry.address(level),
                if entry.writable() { "W" } else { "-" },
                if entry.user() { "U" } else { "S" },
                if entry.large() { " 2MB" } else { "" },
            );
        });
    }

    fn table(&self, table_pa: u64) -> &Table {
        // Safety: `table_pa` is a table owned by `self`, and no mutable
        // reference to it can exist while `self` is borrowed.
        unsafe { self.dm.as_ref::<Table>(table_pa) }
    }
}
