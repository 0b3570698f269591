#![cfg_attr(not(any(test, feature = "std")), no_std)]

//! Register-level access to the Flash Patch and Breakpoint unit and the
//! debug control block.
//!
//! Everything above this crate talks to hardware through [`RegisterInterface`],
//! so the same engine code runs against [`Mmio`] on target and against
//! [`MockRegisters`] on the host.

#[cfg(target_arch = "arm")]
pub use crate::mmio::Mmio;
pub use crate::{
    mock::MockRegisters,
    registers::{Demcr, Dfsr, Dhcsr, FpComp, FpCtrl, FpRemap, Replace},
};

#[cfg(target_arch = "arm")]
mod mmio;
mod mock;
pub mod registers;

/// Upper bound on code comparators the engine will drive.
pub const MAX_COMPARATORS: usize = 8;

/// A memory-mapped register with a fixed address.
pub trait CoreRegister: From<u32> + Into<u32> + Copy {
    const ADDRESS: u32;
    const NAME: &'static str;
}

/// Word access to the System Control Space plus the barrier pair that makes
/// register writes visible to instruction fetch.
pub trait RegisterInterface {
    fn read_word_32(&self, address: u32) -> u32;
    fn write_word_32(&mut self, address: u32, value: u32);

    /// `dsb` followed by `isb`
    fn sync(&mut self);

    fn read<R: CoreRegister>(&self) -> R {
        R::from(self.read_word_32(R::ADDRESS))
    }

    fn write<R: CoreRegister>(&mut self, register: R) {
        self.write_word_32(R::ADDRESS, register.into());
    }

    /// Read comparator `n`
    fn read_comp(&self, n: usize) -> FpComp {
        FpComp::from(self.read_word_32(FpComp::address_of(n)))
    }

    /// Write comparator `n`
    fn write_comp(&mut self, n: usize, comp: FpComp) {
        self.write_word_32(FpComp::address_of(n), comp.into());
    }
}

impl<T: RegisterInterface + ?Sized> RegisterInterface for &mut T {
    fn read_word_32(&self, address: u32) -> u32 {
        (**self).read_word_32(address)
    }

    fn write_word_32(&mut self, address: u32, value: u32) {
        (**self).write_word_32(address, value)
    }

    fn sync(&mut self) {
        (**self).sync()
    }
}
