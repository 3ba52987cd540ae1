//! This module implements the boot-time physical frame allocator. One bit per
//! page frame in `[0, max_page)` tracks whether the frame is handed out. Frames
//! are never freed: everything allocated here lives as long as the hypervisor.

use bitvec::prelude::*;
use x86::bits64::paging::{BASE_PAGE_SHIFT, BASE_PAGE_SIZE};

use super::{
    direct_map::DirectMap,
    error::HvError,
    memory_map::{MemoryRegion, PhysicalLayout},
    support::{page_down, page_up},
};

const BITS_PER_WORD: u64 = u64::BITS as u64;

/// The bitmap frame allocator. Owns the allocation bitmap placed right after
/// the hypervisor image.
#[derive(Debug)]
pub(crate) struct PhysicalAllocator {
    dm: DirectMap,
    bitmap_pa: u64,
    bitmap_words: usize,
    max_page: u64,
}

impl PhysicalAllocator {
    /// Places the allocation bitmap at the page following `image_end`, marks
    /// every frame allocated, then frees the RAM in `regions` except the heap
    /// and the guest image. Updates `layout.heap_start` to the end of the
    /// bitmap.
    pub(crate) fn new(
        dm: DirectMap,
        regions: &[MemoryRegion],
        layout: &mut PhysicalLayout,
        image_end: u64,
    ) -> Result<Self, HvError> {
        let bitmap_pa = page_up(image_end);

        // One spare word so that marking up to `max_page` never runs past the
        // end of the bitmap.
        let bitmap_size = page_up(layout.max_page / 8 + size_of::<u64>() as u64);
        layout.heap_start = bitmap_pa + bitmap_size;
        if layout.heap_start >= layout.heap_end {
            return Err(HvError::NoHeapSpace {
                heap_start: layout.heap_start,
                heap_end: layout.heap_end,
            });
        }

        let mut allocator = Self {
            dm,
            bitmap_pa,
            bitmap_words: (bitmap_size / 8) as usize,
            max_page: layout.max_page,
        };
        allocator.words_mut().fill(!0);

        for region in regions.iter().filter(|region| region.is_ram()) {
            let mut start = region.base;
            let end = region.end();

            if start < layout.heap_end {
                start = layout.heap_end;
            }
            if start < layout.guest_image_end() && end > layout.guest_image_start {
                start = layout.guest_image_end();
            }
            allocator.free_range(start, end);
        }

        log::debug!(
            "Allocation bitmap at {bitmap_pa:#x} ({bitmap_size:#x} bytes), heap {:#x}-{:#x}",
            layout.heap_start,
            layout.heap_end
        );
        Ok(allocator)
    }

    /// Allocates `count` contiguous frames whose first frame number is a
    /// multiple of `align`, and returns that frame number.
    pub(crate) fn allocate(&mut self, count: u64, align: u64) -> Result<u64, HvError> {
        if count == 0 || align == 0 {
            return Err(HvError::InvalidAllocation { count, align });
        }

        let max_page = self.max_page;
        let found = (0..)
            .step_by(align as usize)
            .take_while(|&pfn| pfn + count < max_page)
            .find(|&pfn| self.is_free_range(pfn, count));
        let Some(pfn) = found else {
            return Err(HvError::OutOfMemory { count, align });
        };

        self.mark_range(pfn, count, true);
        log::trace!("Allocated {count:#x} frame(s) at {pfn:#x}");
        Ok(pfn)
    }

    /// Allocates frames like [`PhysicalAllocator::allocate`] and zero-fills
    /// them. Returns the physical address of the first frame.
    pub(crate) fn allocate_zeroed(&mut self, count: u64, align: u64) -> Result<u64, HvError> {
        let pa = self.allocate(count, align)? << BASE_PAGE_SHIFT;
        // Safety: the frames were free until now, so nothing refers to them.
        unsafe { self.dm.fill(pa, 0, count as usize * BASE_PAGE_SIZE) };
        Ok(pa)
    }

    /// Returns whether the frame `pfn` is unavailable for allocation.
    #[cfg(test)]
    pub(crate) fn is_allocated(&self, pfn: u64) -> bool {
        pfn >= self.max_page || self.bits()[pfn as usize]
    }

    /// The direct map the bitmap and the allocated frames are accessed through.
    pub(crate) fn direct_map(&self) -> DirectMap {
        self.dm
    }

    fn free_range(&mut self, start: u64, end: u64) {
        let start = page_up(start);
        let end = page_down(end);
        if end <= start {
            return;
        }
        self.mark_range(
            start >> BASE_PAGE_SHIFT,
            (end - start) >> BASE_PAGE_SHIFT,
            false,
        );
    }

    fn is_free_range(&self, pfn: u64, count: u64) -> bool {
        self.bits()[pfn as usize..(pfn + count) as usize].not_any()
    }

    /// Sets (`allocated == true`) or clears the bits of the frames
    /// `[first, first + count)`, one word at a time.
    fn mark_range(&mut self, first: u64, count: u64, allocated: bool) {
        let last = first + count;
        let start_word = (first / BITS_PER_WORD) as usize;
        let end_word = (last / BITS_PER_WORD) as usize;
        // All bits at and above the first frame's bit.
        let head = !0u64 << (first % BITS_PER_WORD);
        // All bits below the bit of the frame following the last one.
        let tail = (1u64 << (last % BITS_PER_WORD)) - 1;

        let update = |word: &mut u64, mask: u64| {
            if allocated {
                *word |= mask;
            } else {
                *word &= !mask;
            }
        };

        let words = self.words_mut();
        if start_word == end_word {
            update(&mut words[start_word], head & tail);
        } else {
            update(&mut words[start_word], head);
            for word in &mut words[start_word + 1..end_word] {
                update(word, !0);
            }
            update(&mut words[end_word], tail);
        }
    }

    fn words(&self) -> &[u64] {
        // Safety: the bitmap is owned by this allocator and only accessed
        // through it.
        unsafe {
            core::slice::from_raw_parts(
                self.dm.ptr::<u64>(self.bitmap_pa).as_ptr(),
                self.bitmap_words,
            )
        }
    }

    fn words_mut(&mut self) -> &mut [u64] {
        // Safety: see `words`.
        unsafe {
            core::slice::from_raw_parts_mut(
                self.dm.ptr::<u64>(self.bitmap_pa).as_ptr(),
                self.bitmap_words,
            )
        }
    }

    fn bits(&self) -> &BitSlice<u64, Lsb0> {
        self.words().view_bits::<Lsb0>()
    }
}

#[cfg(test)]
mod tests {
    use super::PhysicalAllocator;
    use crate::hypervisor::{
        error::HvError,
        memory_map::{MemoryRegion, PhysicalLayout, RegionKind},
        test_support::TestMemory,
    };

    fn new_allocator(memory: &TestMemory) -> (PhysicalAllocator, PhysicalLayout) {
        let regions = memory.regions();
        let mut layout = memory.layout();
        let allocator = PhysicalAllocator::new(
            memory.dm(),
            &regions,
            &mut layout,
            TestMemory::VMM_IMAGE_END,
        )
        .unwrap();
        (allocator, layout)
    }

    #[test]
    fn heap_starts_after_bitmap() {
        let memory = TestMemory::new(TestMemory::DEFAULT_SIZE);
        let (_, layout) = new_allocator(&memory);
        // 0x1000 pages need 0x200 bytes of bitmap plus a spare word, one page.
        assert_eq!(layout.heap_start, TestMemory::VMM_IMAGE_END + 0x1000);
    }

    #[test]
    fn no_heap_space() {
        let memory = TestMemory::new(TestMemory::DEFAULT_SIZE);
        let regions = memory.regions();
        let mut layout = memory.layout();
        layout.heap_end = TestMemory::VMM_IMAGE_END + 0x1000;
        let result =
            PhysicalAllocator::new(memory.dm(), &regions, &mut layout, TestMemory::VMM_IMAGE_END);
        assert!(matches!(result, Err(HvError::NoHeapSpace { .. })));
    }

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let memory = TestMemory::new(TestMemory::DEFAULT_SIZE);
        let (mut allocator, _) = new_allocator(&memory);

        let requests = [(1, 1), (3, 1), (512, 512), (2, 4), (1, 1), (100, 8), (70, 64)];
        let mut ranges = std::vec::Vec::new();
        for (count, align) in requests {
            let pfn = allocator.allocate(count, align).unwrap();
            assert_eq!(pfn % align, 0);
            for &(other, other_count) in &ranges {
                assert!(pfn + count <= other || other + other_count <= pfn);
            }
            ranges.push((pfn, count));
        }
        for &(pfn, count) in &ranges {
            assert!((pfn..pfn + count).all(|pfn| allocator.is_allocated(pfn)));
        }
    }

    #[test]
    fn excluded_frames_are_never_returned() {
        let memory = TestMemory::new(TestMemory::DEFAULT_SIZE);
        let regions = [
            MemoryRegion::new(0, 0x9_f000, RegionKind::Ram),
            MemoryRegion::new(0x9_f000, 0x6_1000, RegionKind::Reserved),
            MemoryRegion::new(0x10_0000, 0x50_0000, RegionKind::Ram),
            MemoryRegion::new(0x60_0000, 0x10_0000, RegionKind::Acpi),
            MemoryRegion::new(0x70_0000, 0x90_0000, RegionKind::Ram),
        ];
        let mut layout = PhysicalLayout::new(&regions, 0x40_0000);
        layout.guest_image_start = 0x40_0000;
        layout.guest_image_size = 0x8_0800;
        let mut allocator =
            PhysicalAllocator::new(memory.dm(), &regions, &mut layout, TestMemory::VMM_IMAGE_END)
                .unwrap();

        // Heap and guest image, then the ACPI region.
        assert!((0..0x481).all(|pfn| allocator.is_allocated(pfn)));
        assert!((0x481..0x600).all(|pfn| !allocator.is_allocated(pfn)));
        assert!((0x600..0x700).all(|pfn| allocator.is_allocated(pfn)));

        while let Ok(pfn) = allocator.allocate(1, 1) {
            assert!(pfn >= 0x481);
            assert!(!(0x600..0x700).contains(&pfn));
        }
    }

    #[test]
    fn oversized_request_fails_without_side_effects() {
        let memory = TestMemory::new(TestMemory::DEFAULT_SIZE);
        let (mut allocator, layout) = new_allocator(&memory);

        let before: std::vec::Vec<bool> =
            (0..layout.max_page).map(|pfn| allocator.is_allocated(pfn)).collect();
        assert_eq!(
            allocator.allocate(layout.max_page, 1),
            Err(HvError::OutOfMemory { count: layout.max_page, align: 1 })
        );
        let after: std::vec::Vec<bool> =
            (0..layout.max_page).map(|pfn| allocator.is_allocated(pfn)).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn invalid_requests() {
        let memory = TestMemory::new(TestMemory::DEFAULT_SIZE);
        let (mut allocator, _) = new_allocator(&memory);
        assert!(matches!(allocator.allocate(0, 1), Err(HvError::InvalidAllocation { .. })));
        assert!(matches!(allocator.allocate(1, 0), Err(HvError::InvalidAllocation { .. })));
    }

    #[test]
    fn marking_spans_several_words() {
        let memory = TestMemory::new(TestMemory::DEFAULT_SIZE);
        let (mut allocator, _) = new_allocator(&memory);

        // The heap ends at frame 0x400; start mid-word to exercise the head,
        // body and tail masks.
        allocator.mark_range(0x408, 0x40, false);
        allocator.mark_range(0x410, 0x90, true);
        assert!((0x400..0x410).all(|pfn| !allocator.is_allocated(pfn)));
        assert!((0x410..0x4a0).all(|pfn| allocator.is_allocated(pfn)));
        assert!(!allocator.is_allocated(0x4a0));

        allocator.mark_range(0x411, 3, false);
        assert!(allocator.is_allocated(0x410));
        assert!((0x411..0x414).all(|pfn| !allocator.is_allocated(pfn)));
        assert!(allocator.is_allocated(0x414));
    }

    #[test]
    fn zeroed_allocation() {
        let memory = TestMemory::new(TestMemory::DEFAULT_SIZE);
        let (mut allocator, _) = new_allocator(&memory);
        let dm = memory.dm();
        unsafe { dm.fill(0x40_0000, 0xcc, 0x2000) };
        let pa = allocator.allocate_zeroed(2, 1).unwrap();
        assert_eq!(pa, 0x40_0000);
        assert!(unsafe { dm.bytes(pa, 0x2000) }.iter().all(|&b| b == 0));
    }
}
