//! Flash-resident indirection stubs.
//!
//! Stub `n` loads `TRAMPOLINE_TARGETS[n]` and, when it is non-zero, jumps
//! there with `r0`-`r3` untouched, so it can stand in for the original
//! function. A zero target makes the stub return to its caller.

use core::{
    ptr,
    sync::atomic::{AtomicBool, Ordering},
};

use fpb_hal::MAX_COMPARATORS;
use fpb_shared::with_thumb;

use crate::{Result, err::Error};

pub const MAX_TRAMPOLINES: usize = MAX_COMPARATORS;

/// RAM slots read by the stubs, one raw target per stub.
#[repr(C, align(32))]
pub struct TargetTable {
    targets: [u32; MAX_TRAMPOLINES],
}

static mut TRAMPOLINE_TARGETS: TargetTable = TargetTable::new();
static TARGETS_TAKEN: AtomicBool = AtomicBool::new(false);

impl TargetTable {
    pub const fn new() -> Self {
        Self {
            targets: [0; MAX_TRAMPOLINES],
        }
    }

    /// Hand out the table the stubs read. Returns `None` after the first call.
    pub fn take() -> Option<&'static mut Self> {
        if TARGETS_TAKEN.swap(true, Ordering::AcqRel) {
            return None;
        }

        // SAFETY: the flag above guarantees a single mutable reference
        Some(unsafe { &mut *(&raw mut TRAMPOLINE_TARGETS) })
    }

    fn get(&self, slot: usize) -> u32 {
        unsafe { ptr::read_volatile(&self.targets[slot]) }
    }

    fn set(&mut self, slot: usize, target: u32) {
        unsafe { ptr::write_volatile(&mut self.targets[slot], target) };
    }
}

impl Default for TargetTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_arch = "arm")]
mod stubs {
    use core::arch::naked_asm;

    use super::{MAX_TRAMPOLINES, TRAMPOLINE_TARGETS};

    macro_rules! stub {
        ($name:ident, $slot:literal) => {
            /// Tail-jump to this slot's target, or return if it is zero.
            ///
            /// Clobbers only `ip` and the flags, both caller-saved.
            #[unsafe(naked)]
            unsafe extern "C" fn $name() {
                naked_asm!(
                    "movw ip, :lower16:{targets}",
                    "movt ip, :upper16:{targets}",
                    "ldr ip, [ip, #{offset}]",
                    "cmp ip, #0",
                    "it ne",
                    "bxne ip",
                    "bx lr",
                    targets = sym TRAMPOLINE_TARGETS,
                    offset = const $slot * 4,
                );
            }
        };
    }

    stub!(trampoline_0, 0);
    stub!(trampoline_1, 1);
    stub!(trampoline_2, 2);
    stub!(trampoline_3, 3);
    stub!(trampoline_4, 4);
    stub!(trampoline_5, 5);
    stub!(trampoline_6, 6);
    stub!(trampoline_7, 7);

    const STUBS: [unsafe extern "C" fn(); MAX_TRAMPOLINES] = [
        trampoline_0,
        trampoline_1,
        trampoline_2,
        trampoline_3,
        trampoline_4,
        trampoline_5,
        trampoline_6,
        trampoline_7,
    ];

    pub fn address(slot: usize) -> u32 {
        STUBS[slot] as usize as u32
    }
}

#[cfg(not(target_arch = "arm"))]
mod stubs {
    /// Where the stubs would sit in Flash; lets host builds plan patches.
    const HOST_STUB_BASE: u32 = 0x0000_F000;
    const HOST_STUB_SIZE: u32 = 16;

    pub fn address(slot: usize) -> u32 {
        HOST_STUB_BASE + slot as u32 * HOST_STUB_SIZE
    }
}

/// Target management for the first `count` stubs.
///
/// Only a table built by [`TrampolineTable::global`] is wired to the stubs;
/// one built over another [`TargetTable`] is detached and serves planning
/// and tests.
pub struct TrampolineTable<'a> {
    targets: &'a mut TargetTable,
    count: usize,
}

impl<'a> TrampolineTable<'a> {
    fn new(targets: &'a mut TargetTable, count: usize) -> Self {
        Self {
            targets,
            count: count.min(MAX_TRAMPOLINES),
        }
    }

    /// A table over caller storage that the stubs never read. Host builds
    /// only, for simulating a plan; on target use [`TrampolineTable::global`].
    #[cfg(not(target_arch = "arm"))]
    pub fn detached(targets: &'a mut TargetTable, count: usize) -> Self {
        Self::new(targets, count)
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Route stub `slot` to `target_address`. The Thumb bit is forced so the
    /// stub's `bx` stays in Thumb state.
    pub fn set_target(&mut self, slot: usize, target_address: u32) -> Result<()> {
        self.check_slot(slot)?;

        let target = if target_address == 0 { 0 } else { with_thumb(target_address) };
        self.targets.set(slot, target);
        Ok(())
    }

    /// Make stub `slot` return immediately.
    pub fn clear_target(&mut self, slot: usize) -> Result<()> {
        self.check_slot(slot)?;
        self.targets.set(slot, 0);
        Ok(())
    }

    pub fn get_target(&self, slot: usize) -> Result<u32> {
        self.check_slot(slot)?;
        Ok(self.targets.get(slot))
    }

    /// Entry point of stub `slot`, Thumb bit set.
    pub fn get_stub_address(&self, slot: usize) -> Result<u32> {
        self.check_slot(slot)?;
        Ok(with_thumb(stubs::address(slot)))
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        if slot < self.count {
            Ok(())
        } else {
            Err(Error::InvalidSlot(slot))
        }
    }
}

impl TrampolineTable<'static> {
    /// The table the stubs read. Returns `None` after the first call.
    pub fn global(count: usize) -> Option<Self> {
        TargetTable::take().map(|targets| Self::new(targets, count))
    }
}
