use core::ptr;

use crate::RegisterInterface;

/// The real System Control Space, accessed through volatile loads and stores.
pub struct Mmio {
    _private: (),
}

impl Mmio {
    /// ### Safety
    /// The caller must be running on a Cortex-M core with an FPB and must not
    /// create a second `Mmio` that races this one.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl RegisterInterface for Mmio {
    #[inline(always)]
    fn read_word_32(&self, address: u32) -> u32 {
        unsafe { ptr::read_volatile(address as *const u32) }
    }

    #[inline(always)]
    fn write_word_32(&mut self, address: u32, value: u32) {
        unsafe { ptr::write_volatile(address as *mut u32, value) };
    }

    #[inline(always)]
    fn sync(&mut self) {
        cortex_m::asm::dsb();
        cortex_m::asm::isb();
    }
}
