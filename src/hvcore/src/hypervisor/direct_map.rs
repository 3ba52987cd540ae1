//! The fixed-offset mapping of the physical address space into the virtual
//! address space of the hypervisor.
//!
//! Every pointer-like value exchanged between components is a physical
//! address. It is turned into a usable pointer only here, by adding the offset.

use core::ptr::NonNull;

/// The virtual address physical address zero is mapped at.
pub const VMM_OFFSET: u64 = 0xffff_8300_0000_0000;

/// Converts between physical and virtual addresses with `va = pa + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectMap {
    offset: u64,
}

impl DirectMap {
    /// Creates a direct map at `offset`.
    ///
    /// # Safety
    ///
    /// The whole physical address range the allocator manages must be mapped
    /// read/write at `offset` for as long as the returned value is used.
    pub const unsafe fn new(offset: u64) -> Self {
        Self { offset }
    }

    /// The direct map the hypervisor runs with.
    ///
    /// # Safety
    ///
    /// See [`DirectMap::new`].
    pub const unsafe fn vmm() -> Self {
        unsafe { Self::new(VMM_OFFSET) }
    }

    /// The virtual address physical address zero is mapped at.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns the virtual address of the physical address `pa`.
    pub fn va(&self, pa: u64) -> u64 {
        pa.wrapping_add(self.offset)
    }

    /// Returns the physical address of the virtual address `va`.
    pub fn pa(&self, va: u64) -> u64 {
        va.wrapping_sub(self.offset)
    }

    pub(crate) fn ptr<T>(&self, pa: u64) -> NonNull<T> {
        let ptr = self.va(pa) as *mut T;
        debug_assert!(ptr.is_aligned());
        // Safety: the offset maps no physical address to the null address.
        unsafe { NonNull::new_unchecked(ptr) }
    }

    /// Returns a shared reference to `T` at the physical address `pa`.
    ///
    /// # Safety
    ///
    /// `pa` must hold an initialized `T` and no mutable reference to it may be
    /// alive for `'a`.
    pub(crate) unsafe fn as_ref<'a, T>(&self, pa: u64) -> &'a T {
        unsafe { self.ptr::<T>(pa).as_ref() }
    }

    /// Returns a mutable reference to `T` at the physical address `pa`.
    ///
    /// # Safety
    ///
    /// `pa` must hold an initialized `T` and no other reference to it may be
    /// alive for `'a`.
    pub(crate) unsafe fn as_mut<'a, T>(&self, pa: u64) -> &'a mut T {
        unsafe { self.ptr::<T>(pa).as_mut() }
    }

    /// Views `len` bytes of physical memory at `pa`.
    ///
    /// # Safety
    ///
    /// No mutable reference to the range may be alive for `'a`.
    pub(crate) unsafe fn bytes<'a>(&self, pa: u64, len: usize) -> &'a [u8] {
        unsafe { core::slice::from_raw_parts(self.ptr::<u8>(pa).as_ptr(), len) }
    }

    /// Views `len` bytes of physical memory at `pa` mutably.
    ///
    /// # Safety
    ///
    /// No other reference to the range may be alive for `'a`.
    pub(crate) unsafe fn bytes_mut<'a>(&self, pa: u64, len: usize) -> &'a mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.ptr::<u8>(pa).as_ptr(), len) }
    }

    /// Fills `len` bytes of physical memory at `pa` with `value`.
    ///
    /// # Safety
    ///
    /// No reference to the range may be alive.
    pub(crate) unsafe fn fill(&self, pa: u64, value: u8, len: usize) {
        unsafe { self.ptr::<u8>(pa).as_ptr().write_bytes(value, len) };
    }

    /// Copies `len` bytes from `src` to `dst`, both physical. The ranges may
    /// overlap.
    ///
    /// # Safety
    ///
    /// No reference to either range may be alive.
    pub(crate) unsafe fn copy(&self, dst: u64, src: u64, len: usize) {
        unsafe {
            core::ptr::copy(
                self.ptr::<u8>(src).as_ptr(),
                self.ptr::<u8>(dst).as_ptr(),
                len,
            );
        }
    }
}
