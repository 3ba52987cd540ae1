//! Page and page frame number arithmetic.

use x86::bits64::paging::{BASE_PAGE_SHIFT, BASE_PAGE_SIZE};

/// Rounds `addr` up to the next page boundary.
pub(crate) const fn page_up(addr: u64) -> u64 {
    round_up_by(addr, BASE_PAGE_SIZE as u64)
}

/// Rounds `addr` down to the page boundary.
pub(crate) const fn page_down(addr: u64) -> u64 {
    addr & !(BASE_PAGE_SIZE as u64 - 1)
}

/// The page frame number of the first page starting at or above `addr`.
pub(crate) const fn pfn_up(addr: u64) -> u64 {
    page_up(addr) >> BASE_PAGE_SHIFT
}

/// The page frame number of the page containing `addr`.
pub(crate) const fn pfn_down(addr: u64) -> u64 {
    addr >> BASE_PAGE_SHIFT
}

/// Rounds `number` up to a multiple of `size`, which must be a power of two.
pub(crate) const fn round_up_by(number: u64, size: u64) -> u64 {
    (number + size - 1) & !(size - 1)
}
