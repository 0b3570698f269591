//! Comparator bookkeeping for the remap strategy.
//!
//! Each code comparator owns one word of the [`RemapTable`]. In remap mode the
//! word holds a `b.w` to the redirect target; in instruction-patch mode it
//! holds the replacement halfword in the half the comparator selects.

use core::{
    cmp::min,
    ptr,
    sync::atomic::{AtomicBool, Ordering},
};

use fpb_hal::{FpComp, FpCtrl, FpRemap, MAX_COMPARATORS, RegisterInterface, Replace};
use fpb_shared::{console_printfln, is_code_address, strip_thumb};

use crate::{Result, err::Error, thumb::encode_b_w, trampoline::TrampolineTable};

/// RAM table the FPB fetches substituted words from.
///
/// FP_REMAP drops the low five address bits, hence the alignment.
#[repr(C, align(32))]
pub struct RemapTable {
    entries: [u32; MAX_COMPARATORS],
}

static mut REMAP_TABLE: RemapTable = RemapTable::new();
static REMAP_TAKEN: AtomicBool = AtomicBool::new(false);

impl RemapTable {
    pub const fn new() -> Self {
        Self {
            entries: [0; MAX_COMPARATORS],
        }
    }

    /// Hand out the process-wide table. Returns `None` after the first call.
    pub fn take() -> Option<&'static mut Self> {
        if REMAP_TAKEN.swap(true, Ordering::AcqRel) {
            return None;
        }

        // SAFETY: the flag above guarantees a single mutable reference
        Some(unsafe { &mut *(&raw mut REMAP_TABLE) })
    }

    /// Bus address of the first entry
    pub fn base(&self) -> u32 {
        self.entries.as_ptr() as usize as u32
    }

    pub fn get(&self, slot: usize) -> u32 {
        unsafe { ptr::read_volatile(&self.entries[slot]) }
    }

    fn set(&mut self, slot: usize, word: u32) {
        unsafe { ptr::write_volatile(&mut self.entries[slot], word) };
    }

    fn clear(&mut self) {
        for slot in 0..MAX_COMPARATORS {
            self.set(slot, 0);
        }
    }
}

impl Default for RemapTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Software view of one code comparator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// Matched address, Thumb bit clear
    pub original_address: u32,
    /// Redirect target, Thumb bit clear. Zero for instruction patches.
    pub target_address: u32,
    pub enabled: bool,
    /// Comparator mode, `None` while the slot is cleared
    pub replace: Option<Replace>,
}

impl Slot {
    pub fn is_configured(&self) -> bool {
        self.replace.is_some()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct EngineState {
    initialized: bool,
    revision: u8,
    num_code: u8,
    num_lit: u8,
    slots: [Slot; MAX_COMPARATORS],
}

/// Immutable copy of the engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    pub initialized: bool,
    pub revision: u8,
    pub num_code: u8,
    pub num_lit: u8,
    pub slots: [Slot; MAX_COMPARATORS],
    /// Remap table words, one per slot
    pub remap: [u32; MAX_COMPARATORS],
}

impl StateSnapshot {
    /// Slots the hardware actually provides
    pub fn active_slots(&self) -> &[Slot] {
        &self.slots[..self.num_code as usize]
    }
}

/// FPB remap driver.
pub struct PatchRegistry<'a, R: RegisterInterface> {
    regs: R,
    remap: &'a mut RemapTable,
    state: EngineState,
}

impl<'a, R: RegisterInterface> PatchRegistry<'a, R> {
    pub fn new(regs: R, remap: &'a mut RemapTable) -> Self {
        Self {
            regs,
            remap,
            state: EngineState::default(),
        }
    }

    pub fn registers(&self) -> &R {
        &self.regs
    }

    /// Discover the comparators, clear them, point FP_REMAP at the table and
    /// switch the unit on.
    pub fn init(&mut self) -> Result<()> {
        let ctrl: FpCtrl = self.regs.read();
        let num_code = ctrl.num_code();
        if num_code == 0 || !ctrl.supports_remap() {
            return Err(Error::Unsupported);
        }

        self.clear_comparators(&ctrl);
        self.remap.clear();
        self.regs.write(FpRemap::with_base(self.remap.base()));
        self.regs.write(FpCtrl::enabled());
        self.regs.sync();

        self.state = EngineState {
            initialized: true,
            revision: ctrl.rev() as u8,
            num_code: min(num_code as usize, MAX_COMPARATORS) as u8,
            num_lit: ctrl.num_lit() as u8,
            slots: Default::default(),
        };

        console_printfln!(
            "fpb: {} code, {} literal comparators",
            self.state.num_code,
            self.state.num_lit
        );
        Ok(())
    }

    /// Clear every comparator and switch the unit off.
    pub fn deinit(&mut self) {
        let ctrl: FpCtrl = self.regs.read();

        self.clear_comparators(&ctrl);
        self.regs.write(FpCtrl::disabled());
        self.remap.clear();
        self.regs.sync();

        self.state = EngineState::default();
        console_printfln!("fpb: disabled");
    }

    /// Redirect `original_address` to `target_address` with a `b.w` placed
    /// in the remap table.
    ///
    /// Remap replaces a whole word, so an original that starts on a
    /// halfword boundary fails with [`Error::Misaligned`]. Redirect such
    /// functions with [`BareRedirector::set_redirect`](crate::BareRedirector::set_redirect),
    /// whose breakpoints match either halfword.
    pub fn set_patch(&mut self, slot: usize, original_address: u32, target_address: u32) -> Result<()> {
        self.check_slot(slot)?;
        let original = Self::check_original(original_address)?;
        let target = strip_thumb(target_address);

        let branch = encode_b_w(original, target).map_err(|_| Error::InvalidAddress(target_address))?;
        self.install(slot, original, branch.as_word(), Replace::Remap, target);

        console_printfln!("fpb: slot {} 0x{:08x} -> 0x{:08x}", slot, original, target);
        Ok(())
    }

    /// Redirect through the slot's trampoline stub, for targets a `b.w`
    /// cannot reach from `original_address`.
    pub fn set_patch_indirect(
        &mut self,
        slot: usize,
        original_address: u32,
        target_address: u32,
        trampolines: &mut TrampolineTable<'_>,
    ) -> Result<()> {
        self.check_slot(slot)?;
        let original = Self::check_original(original_address)?;

        let stub = trampolines.get_stub_address(slot)?;
        let branch = encode_b_w(original, stub).map_err(|_| Error::InvalidAddress(stub))?;
        trampolines.set_target(slot, target_address)?;
        self.install(slot, original, branch.as_word(), Replace::Remap, strip_thumb(target_address));

        console_printfln!(
            "fpb: slot {} 0x{:08x} -> stub 0x{:08x} -> 0x{:08x}",
            slot,
            original,
            stub,
            target_address
        );
        Ok(())
    }

    /// Substitute the halfword at `address` (lower) or `address + 2` (upper).
    pub fn set_instruction_patch(&mut self, slot: usize, address: u32, new_halfword: u16, is_upper: bool) -> Result<()> {
        self.check_slot(slot)?;
        let address = Self::check_original(address)?;

        let (word, replace) = if is_upper {
            ((new_halfword as u32) << 16, Replace::Upper)
        } else {
            (new_halfword as u32, Replace::Lower)
        };
        self.install(slot, address, word, replace, 0);

        console_printfln!("fpb: slot {} 0x{:08x} <- 0x{:04x}", slot, address, new_halfword);
        Ok(())
    }

    /// Zero the comparator, its remap word and the slot state.
    pub fn clear_patch(&mut self, slot: usize) -> Result<()> {
        self.check_slot(slot)?;

        self.regs.write_comp(slot, FpComp::from(0));
        self.remap.set(slot, 0);
        self.regs.sync();

        if self.state.slots[slot].is_configured() {
            console_printfln!("fpb: slot {} cleared", slot);
        }
        self.state.slots[slot] = Slot::default();
        Ok(())
    }

    /// Flip only the comparator's enable bit, keeping address and mode.
    pub fn enable_comparator(&mut self, slot: usize, enable: bool) -> Result<()> {
        self.check_slot(slot)?;

        if !self.state.slots[slot].is_configured() {
            return if enable { Err(Error::InvalidSlot(slot)) } else { Ok(()) };
        }

        let mut comp = self.regs.read_comp(slot);
        comp.set_enable(enable);
        self.regs.write_comp(slot, comp);
        self.regs.sync();

        self.state.slots[slot].enabled = enable;
        Ok(())
    }

    pub fn get_state(&self) -> StateSnapshot {
        let mut remap = [0; MAX_COMPARATORS];
        for (slot, word) in remap.iter_mut().enumerate() {
            *word = self.remap.get(slot);
        }

        StateSnapshot {
            initialized: self.state.initialized,
            revision: self.state.revision,
            num_code: self.state.num_code,
            num_lit: self.state.num_lit,
            slots: self.state.slots,
            remap,
        }
    }

    /// Whether the hardware offers remap-capable code comparators.
    pub fn is_supported(&self) -> bool {
        let ctrl: FpCtrl = self.regs.read();
        ctrl.num_code() > 0 && ctrl.supports_remap()
    }

    pub fn num_code_comparators(&self) -> u8 {
        self.state.num_code
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        if !self.state.initialized {
            return Err(Error::NotInitialized);
        }

        if slot >= self.state.num_code as usize {
            return Err(Error::InvalidSlot(slot));
        }

        Ok(())
    }

    fn check_original(address: u32) -> Result<u32> {
        if !is_code_address(address) {
            return Err(Error::InvalidAddress(address));
        }

        let address = strip_thumb(address);
        if address & 0b10 != 0 {
            return Err(Error::Misaligned(address));
        }

        Ok(address)
    }

    /// Program `slot` with the comparator off while its remap word changes.
    fn install(&mut self, slot: usize, original: u32, word: u32, replace: Replace, target: u32) {
        self.regs.write_comp(slot, FpComp::from(0));
        self.regs.sync();

        self.remap.set(slot, word);
        self.regs.sync();

        self.regs.write_comp(slot, FpComp::matching(original, replace));
        self.regs.sync();

        self.state.slots[slot] = Slot {
            original_address: original,
            target_address: target,
            enabled: true,
            replace: Some(replace),
        };
    }

    fn clear_comparators(&mut self, ctrl: &FpCtrl) {
        let total = ctrl.num_code() + ctrl.num_lit();
        for n in 0..total as usize {
            self.regs.write_comp(n, FpComp::from(0));
        }
    }
}
