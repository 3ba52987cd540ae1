//! The panic handler implementation.

use super::x86_instructions::halt;

/// Reports the panic and halts the processor. To be called from the
/// `#[panic_handler]` of the binary the hypervisor is linked into.
pub fn panic_impl(info: &core::panic::PanicInfo<'_>) -> ! {
    log::error!("{info}");
    halt()
}
