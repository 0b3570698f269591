//! Bare-metal variant: the engine owns the FPB and the DebugMonitor vector.

use core::{cell::RefCell, cmp::min};

use derive_more::IsVariant;
use fpb_hal::{Demcr, Dfsr, Dhcsr, FpComp, FpCtrl, MAX_COMPARATORS, RegisterInterface};
use fpb_shared::{console_printfln, is_code_address, strip_thumb};

use crate::{
    Result,
    debugmon::{FRAME_PC, Outcome, RedirectEntry, RedirectTable, StackFrame},
    err::Error,
};

/// What to do when a breakpoint fires at a PC without a redirect.
///
/// Resuming at that PC would hit the same comparator again forever.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, IsVariant)]
pub enum MissPolicy {
    /// Disable the matching comparator, single-step, then re-enable it
    #[default]
    StepOver,
    /// Leave the frame alone and report [`Outcome::Unmatched`]
    Leave,
}

pub struct BareRedirector<R: RegisterInterface> {
    regs: R,
    policy: MissPolicy,
    initialized: bool,
    /// FP_CTRL.REV; non-zero means BPADDR-style comparators
    revision: u8,
    num_code: u8,
    num_lit: u8,
    table: RedirectTable,
    /// Comparator switched off while a step is in flight
    stepping: Option<usize>,
}

impl<R: RegisterInterface> BareRedirector<R> {
    pub fn new(regs: R, policy: MissPolicy) -> Self {
        Self {
            regs,
            policy,
            initialized: false,
            revision: 0,
            num_code: 0,
            num_lit: 0,
            table: RedirectTable::new(),
            stepping: None,
        }
    }

    pub fn registers(&self) -> &R {
        &self.regs
    }

    pub fn registers_mut(&mut self) -> &mut R {
        &mut self.regs
    }

    /// Turn on tracing and the DebugMonitor exception, then arm the FPB as a
    /// pure breakpoint source.
    pub fn init(&mut self) -> Result<()> {
        let ctrl: FpCtrl = self.regs.read();
        let num_code = ctrl.num_code();
        if num_code == 0 {
            return Err(Error::Unsupported);
        }

        let mut demcr: Demcr = self.regs.read();
        demcr.set_trcena(true);
        self.regs.write(demcr);

        // Ignored when a debugger already owns C_DEBUGEN
        let mut dhcsr: Dhcsr = self.regs.read();
        dhcsr.set_c_debugen(true);
        dhcsr.enable_write();
        self.regs.write(dhcsr);

        demcr.set_mon_en(true);
        demcr.set_mon_step(false);
        self.regs.write(demcr);

        self.clear_comparators(&ctrl);
        self.regs.write(FpCtrl::enabled());
        self.regs.sync();

        self.revision = ctrl.rev() as u8;
        self.num_code = min(num_code as usize, MAX_COMPARATORS) as u8;
        self.num_lit = ctrl.num_lit() as u8;
        self.table.clear_all();
        self.stepping = None;
        self.initialized = true;

        console_printfln!("debugmon: {} breakpoint comparators", self.num_code);
        Ok(())
    }

    /// Disarm every comparator and the DebugMonitor exception.
    pub fn deinit(&mut self) {
        let ctrl: FpCtrl = self.regs.read();
        self.clear_comparators(&ctrl);
        self.regs.write(FpCtrl::disabled());

        let mut demcr: Demcr = self.regs.read();
        demcr.set_mon_en(false);
        demcr.set_mon_step(false);
        self.regs.write(demcr);
        self.regs.sync();

        self.table.clear_all();
        self.stepping = None;
        self.initialized = false;
        self.num_code = 0;
        self.num_lit = 0;
        console_printfln!("debugmon: disabled");
    }

    /// Breakpoint `original_address` and resume at `redirect_address`
    /// instead. An active slot is cleared first.
    pub fn set_redirect(&mut self, slot: usize, original_address: u32, redirect_address: u32) -> Result<()> {
        self.check_slot(slot)?;
        if !self.is_v2() && !is_code_address(original_address) {
            return Err(Error::InvalidAddress(original_address));
        }

        if self.table.get(slot).enabled {
            self.disarm(slot);
        }

        let entry = RedirectEntry::active(original_address, redirect_address);
        self.table.set(slot, entry);

        let comp = if self.is_v2() {
            FpComp::breakpoint_v2(entry.original_address)
        } else {
            FpComp::breakpoint(entry.original_address)
        };
        self.regs.write_comp(slot, comp);
        self.regs.sync();

        console_printfln!(
            "debugmon: slot {} 0x{:08x} -> 0x{:08x}",
            slot,
            entry.original_address,
            entry.redirect_address
        );
        Ok(())
    }

    pub fn clear_redirect(&mut self, slot: usize) -> Result<()> {
        self.check_slot(slot)?;
        self.disarm(slot);
        self.regs.sync();
        Ok(())
    }

    /// Redirect for `address`, with or without its Thumb bit.
    pub fn get_redirect(&self, address: u32) -> Option<u32> {
        self.table.lookup(address)
    }

    pub fn entry(&self, slot: usize) -> Option<RedirectEntry> {
        (slot < self.num_code as usize).then(|| self.table.get(slot))
    }

    pub fn num_code_comparators(&self) -> u8 {
        self.num_code
    }

    pub fn num_literal_comparators(&self) -> u8 {
        self.num_lit
    }

    /// DebugMonitor exception body. `frame` is the stacked context of the
    /// interrupted code.
    ///
    /// Runs in exception context: no logging, no blocking.
    pub fn handler(&mut self, frame: &mut StackFrame) -> Outcome {
        let dfsr: Dfsr = self.regs.read();

        if let Some(slot) = self.stepping
            && dfsr.halted()
        {
            self.regs.write(Dfsr::clear_halted());
            let mut comp = self.regs.read_comp(slot);
            comp.set_enable(true);
            self.regs.write_comp(slot, comp);
            self.set_step(false);
            self.stepping = None;
            self.regs.sync();
            return Outcome::Rearmed(slot);
        }

        if !dfsr.bkpt() {
            return Outcome::NotOurs;
        }
        self.regs.write(Dfsr::clear_bkpt());

        let pc = frame[FRAME_PC];
        if let Some(redirect) = self.table.lookup(pc) {
            frame[FRAME_PC] = redirect;
            self.regs.sync();
            return Outcome::Redirected(redirect);
        }

        let outcome = match (self.policy, self.matching_comparator(pc)) {
            (MissPolicy::StepOver, Some(slot)) => {
                let mut comp = self.regs.read_comp(slot);
                comp.set_enable(false);
                self.regs.write_comp(slot, comp);
                self.set_step(true);
                self.stepping = Some(slot);
                Outcome::SteppingOver(slot)
            }
            _ => Outcome::Unmatched,
        };
        self.regs.sync();
        outcome
    }

    fn is_v2(&self) -> bool {
        self.revision != 0
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }

        if slot >= self.num_code as usize {
            return Err(Error::InvalidSlot(slot));
        }

        Ok(())
    }

    fn disarm(&mut self, slot: usize) {
        self.regs.write_comp(slot, FpComp::from(0));
        self.table.clear(slot);

        if self.stepping == Some(slot) {
            self.stepping = None;
            self.set_step(false);
        }
    }

    fn set_step(&mut self, step: bool) {
        let mut demcr: Demcr = self.regs.read();
        demcr.set_mon_step(step);
        self.regs.write(demcr);
    }

    fn matching_comparator(&self, pc: u32) -> Option<usize> {
        let pc = strip_thumb(pc);
        (0..self.num_code as usize).find(|&n| {
            let comp = self.regs.read_comp(n);
            if !comp.enable() {
                return false;
            }

            if self.is_v2() {
                u32::from(comp) & !1 == pc
            } else {
                comp.address() == pc & !0b11
            }
        })
    }

    fn clear_comparators(&mut self, ctrl: &FpCtrl) {
        let total = ctrl.num_code() + ctrl.num_lit();
        for n in 0..total as usize {
            self.regs.write_comp(n, FpComp::from(0));
        }
    }
}

/// Home for a redirector reached from both thread code and the DebugMonitor
/// exception. Every access runs in a critical section, which masks the
/// exception, so the two sides never hold the redirector at once.
pub struct SharedRedirector<R: RegisterInterface> {
    inner: RefCell<Option<BareRedirector<R>>>,
}

// SAFETY: single core; `inner` is only touched inside `critical`
unsafe impl<R: RegisterInterface> Sync for SharedRedirector<R> {}

impl<R: RegisterInterface> SharedRedirector<R> {
    pub const fn new() -> Self {
        Self {
            inner: RefCell::new(None),
        }
    }

    /// Park `redirector` here and return the one it replaces.
    pub fn install(&self, redirector: BareRedirector<R>) -> Option<BareRedirector<R>> {
        critical(|| self.inner.replace(Some(redirector)))
    }

    pub fn uninstall(&self) -> Option<BareRedirector<R>> {
        critical(|| self.inner.take())
    }

    /// Run `f` on the installed redirector with the exception masked.
    ///
    /// `None` if nothing is installed or `f` re-enters this call.
    pub fn with<T>(&self, f: impl FnOnce(&mut BareRedirector<R>) -> T) -> Option<T> {
        critical(|| {
            let mut inner = self.inner.try_borrow_mut().ok()?;
            inner.as_mut().map(f)
        })
    }

    /// Exception-side entry point.
    pub fn dispatch(&self, frame: &mut StackFrame) -> Outcome {
        self.with(|redirector| redirector.handler(frame)).unwrap_or(Outcome::NotOurs)
    }
}

impl<R: RegisterInterface> Default for SharedRedirector<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_arch = "arm")]
fn critical<T>(f: impl FnOnce() -> T) -> T {
    cortex_m::interrupt::free(|_| f())
}

#[cfg(not(target_arch = "arm"))]
fn critical<T>(f: impl FnOnce() -> T) -> T {
    f()
}

#[cfg(target_arch = "arm")]
pub use self::vector::REDIRECTOR;

#[cfg(target_arch = "arm")]
mod vector {
    use core::arch::naked_asm;

    use fpb_hal::Mmio;

    use super::SharedRedirector;
    use crate::debugmon::StackFrame;

    /// Redirector served by the DebugMonitor vector. Install one with
    /// [`SharedRedirector::install`] and reconfigure it through
    /// [`SharedRedirector::with`].
    pub static REDIRECTOR: SharedRedirector<Mmio> = SharedRedirector::new();

    /// Pick the stack the core pushed the frame on, per EXC_RETURN bit 2.
    #[allow(non_snake_case)]
    #[unsafe(naked)]
    #[unsafe(no_mangle)]
    unsafe extern "C" fn DebugMonitor() {
        naked_asm!(
            "tst lr, #4",
            "ite eq",
            "mrseq r0, msp",
            "mrsne r0, psp",
            "b {entry}",
            entry = sym debug_monitor_entry,
        );
    }

    extern "C" fn debug_monitor_entry(frame: &mut StackFrame) {
        REDIRECTOR.dispatch(frame);
    }
}

#[cfg(test)]
mod tests {
    use fpb_hal::{MockRegisters, Replace};
    use pretty_assertions::assert_eq;

    use super::*;

    fn frame_at(pc: u32) -> StackFrame {
        [0xA0, 0xA1, 0xA2, 0xA3, 0xC0, 0x0800_0101, pc, 0x0100_0000]
    }

    fn redirector(mock: &mut MockRegisters, policy: MissPolicy) -> BareRedirector<&mut MockRegisters> {
        let mut redirector = BareRedirector::new(mock, policy);
        redirector.init().unwrap();
        redirector
    }

    #[test]
    fn init_arms_the_monitor() {
        let mut mock = MockRegisters::new(6, 2);
        let redirector = redirector(&mut mock, MissPolicy::StepOver);

        let regs = redirector.registers();
        assert!(regs.demcr().trcena());
        assert!(regs.demcr().mon_en());
        assert!(regs.dhcsr().c_debugen());
        assert!(regs.ctrl().enable());
        assert!(regs.is_synced());
        assert_eq!(redirector.num_code_comparators(), 6);
        assert_eq!(redirector.num_literal_comparators(), 2);
    }

    #[test]
    fn init_tolerates_attached_debugger() {
        let mut mock = MockRegisters::new(4, 0).with_debugger();
        let redirector = redirector(&mut mock, MissPolicy::StepOver);
        assert!(redirector.registers().demcr().mon_en());
    }

    #[test]
    fn init_without_comparators() {
        let mut mock = MockRegisters::new(0, 0);
        let mut redirector = BareRedirector::new(&mut mock, MissPolicy::StepOver);
        assert_eq!(redirector.init(), Err(Error::Unsupported));
        assert!(!redirector.registers().demcr().mon_en());
    }

    #[test]
    fn set_redirect_requires_init_and_slot() {
        let mut mock = MockRegisters::new(4, 0);
        let mut redirector = BareRedirector::new(&mut mock, MissPolicy::StepOver);
        assert_eq!(redirector.set_redirect(0, 0x0800_1000, 0x2000_1000), Err(Error::NotInitialized));

        redirector.init().unwrap();
        assert_eq!(redirector.set_redirect(4, 0x0800_1000, 0x2000_1000), Err(Error::InvalidSlot(4)));
        assert_eq!(redirector.clear_redirect(4), Err(Error::InvalidSlot(4)));
        assert_eq!(
            redirector.set_redirect(0, 0x2000_0000, 0x2000_1000),
            Err(Error::InvalidAddress(0x2000_0000))
        );
    }

    #[test]
    fn redirect_lookup_ignores_thumb_bit() {
        let mut mock = MockRegisters::new(4, 0);
        let mut redirector = redirector(&mut mock, MissPolicy::StepOver);

        redirector.set_redirect(0, 0x0800_1000, 0x2000_1000).unwrap();
        assert_eq!(redirector.get_redirect(0x0800_1000), Some(0x2000_1001));
        assert_eq!(redirector.get_redirect(0x0800_1001), Some(0x2000_1001));
        assert_eq!(redirector.get_redirect(0x0800_2000), None);

        let comp = redirector.registers().comparator(0);
        assert_eq!(comp.replace(), Replace::Both);
        assert_eq!(comp.address(), 0x0800_1000);
        assert!(comp.enable());
        assert!(redirector.registers().is_synced());
    }

    #[test]
    fn resetting_an_active_slot_replaces_it() {
        let mut mock = MockRegisters::new(4, 0);
        let mut redirector = redirector(&mut mock, MissPolicy::StepOver);

        redirector.set_redirect(1, 0x0800_1000, 0x2000_1000).unwrap();
        redirector.set_redirect(1, 0x0800_3000, 0x2000_3000).unwrap();

        assert_eq!(redirector.get_redirect(0x0800_1000), None);
        assert_eq!(redirector.get_redirect(0x0800_3000), Some(0x2000_3001));

        let armed = (0..4).filter(|&n| redirector.registers().comparator(n).enable()).count();
        assert_eq!(armed, 1);
        assert_eq!(redirector.registers().comparator(1).address(), 0x0800_3000);
    }

    #[test]
    fn clearing_one_slot_keeps_the_other() {
        let mut mock = MockRegisters::new(4, 0);
        let mut redirector = redirector(&mut mock, MissPolicy::StepOver);

        redirector.set_redirect(0, 0x0800_1000, 0x2000_1000).unwrap();
        redirector.set_redirect(1, 0x0800_2000, 0x2000_2000).unwrap();
        let comp1 = redirector.registers().comparator(1);

        redirector.clear_redirect(0).unwrap();
        redirector.clear_redirect(0).unwrap();

        assert_eq!(u32::from(redirector.registers().comparator(0)), 0);
        assert_eq!(redirector.registers().comparator(1), comp1);
        assert_eq!(redirector.get_redirect(0x0800_1000), None);
        assert_eq!(redirector.get_redirect(0x0800_2000), Some(0x2000_2001));
        assert_eq!(redirector.entry(1), Some(RedirectEntry::active(0x0800_2000, 0x2000_2000)));
        assert_eq!(redirector.entry(4), None);
    }

    #[test]
    fn handler_ignores_other_debug_events() {
        let mut mock = MockRegisters::new(4, 0);
        let mut redirector = redirector(&mut mock, MissPolicy::StepOver);
        redirector.set_redirect(0, 0x0800_1000, 0x2000_1000).unwrap();

        let writes = redirector.registers().write_count();
        let mut frame = frame_at(0x0800_1000);
        assert_eq!(redirector.handler(&mut frame), Outcome::NotOurs);
        assert_eq!(frame, frame_at(0x0800_1000));
        assert_eq!(redirector.registers().write_count(), writes);
    }

    #[test]
    fn handler_rewrites_stacked_pc() {
        let mut mock = MockRegisters::new(4, 0);
        mock.raise_breakpoint();
        let mut redirector = redirector(&mut mock, MissPolicy::StepOver);
        redirector.set_redirect(2, 0x0800_1000, 0x2000_1000).unwrap();

        let mut frame = frame_at(0x0800_1000);
        assert_eq!(redirector.handler(&mut frame), Outcome::Redirected(0x2000_1001));

        let mut expected = frame_at(0x0800_1000);
        expected[FRAME_PC] = 0x2000_1001;
        assert_eq!(frame, expected);
        assert!(!redirector.registers().dfsr().bkpt());
        assert!(redirector.registers().is_synced());
    }

    #[test]
    fn unmatched_breakpoint_is_left_alone() {
        let mut mock = MockRegisters::new(4, 0);
        mock.raise_breakpoint();
        let mut redirector = redirector(&mut mock, MissPolicy::Leave);
        redirector.set_redirect(0, 0x0800_1000, 0x2000_1000).unwrap();

        let mut frame = frame_at(0x0800_1002);
        assert_eq!(redirector.handler(&mut frame), Outcome::Unmatched);
        assert_eq!(frame, frame_at(0x0800_1002));
        assert!(redirector.registers().comparator(0).enable());
        assert!(!redirector.registers().dfsr().bkpt());
    }

    #[test]
    fn unmatched_breakpoint_is_stepped_over() {
        let mut mock = MockRegisters::new(4, 0);
        mock.raise_breakpoint();
        let mut redirector = redirector(&mut mock, MissPolicy::StepOver);
        redirector.set_redirect(0, 0x0800_1000, 0x2000_1000).unwrap();

        // the comparator covers both halfwords of the word
        let mut frame = frame_at(0x0800_1002);
        assert_eq!(redirector.handler(&mut frame), Outcome::SteppingOver(0));
        assert_eq!(frame, frame_at(0x0800_1002));
        assert!(!redirector.registers().comparator(0).enable());
        assert!(redirector.registers().demcr().mon_step());

        // nothing latched yet: the step has not retired
        let mut frame = frame_at(0x0800_1004);
        assert_eq!(redirector.handler(&mut frame), Outcome::NotOurs);
        assert!(redirector.registers().demcr().mon_step());
    }

    #[test]
    fn step_completion_rearms_comparator() {
        let mut mock = MockRegisters::new(4, 0);
        mock.raise_breakpoint();
        let mut redirector = redirector(&mut mock, MissPolicy::StepOver);
        redirector.set_redirect(3, 0x0800_1000, 0x2000_1000).unwrap();

        let mut frame = frame_at(0x0800_1002);
        assert_eq!(redirector.handler(&mut frame), Outcome::SteppingOver(3));
        assert!(!redirector.registers().comparator(3).enable());
        assert_eq!(redirector.entry(3).map(|e| e.enabled), Some(true));

        redirector.registers_mut().raise_step();
        let mut frame = frame_at(0x0800_1004);
        assert_eq!(redirector.handler(&mut frame), Outcome::Rearmed(3));
        assert_eq!(frame, frame_at(0x0800_1004));

        let regs = redirector.registers();
        assert!(regs.comparator(3).enable());
        assert!(!regs.demcr().mon_step());
        assert!(!regs.dfsr().halted());
        assert!(regs.is_synced());
    }

    #[test]
    fn clearing_a_stepping_slot_cancels_the_step() {
        let mut mock = MockRegisters::new(4, 0);
        mock.raise_breakpoint();
        let mut redirector = redirector(&mut mock, MissPolicy::StepOver);
        redirector.set_redirect(0, 0x0800_1000, 0x2000_1000).unwrap();

        let mut frame = frame_at(0x0800_1002);
        assert!(redirector.handler(&mut frame).is_stepping_over());
        redirector.clear_redirect(0).unwrap();
        assert!(!redirector.registers().demcr().mon_step());

        redirector.registers_mut().raise_step();
        assert_eq!(redirector.handler(&mut frame), Outcome::NotOurs);
        assert!(!redirector.registers().comparator(0).enable());
    }

    #[test]
    fn breakpoint_without_comparator() {
        let mut mock = MockRegisters::new(4, 0);
        mock.raise_breakpoint();
        let mut redirector = redirector(&mut mock, MissPolicy::StepOver);

        // e.g. a `bkpt` instruction compiled into the image
        let mut frame = frame_at(0x0800_5000);
        assert_eq!(redirector.handler(&mut frame), Outcome::Unmatched);
        assert!(!redirector.registers().demcr().mon_step());
    }

    #[test]
    fn second_revision_comparators() {
        let mut mock = MockRegisters::v8m(8, 0);
        mock.raise_breakpoint();
        let mut redirector = redirector(&mut mock, MissPolicy::StepOver);

        redirector.set_redirect(0, 0x2000_4001, 0x0800_1000).unwrap();
        assert_eq!(u32::from(redirector.registers().comparator(0)), 0x2000_4001);

        let mut frame = frame_at(0x2000_4000);
        assert_eq!(redirector.handler(&mut frame), Outcome::Redirected(0x0800_1001));
        assert_eq!(frame[FRAME_PC], 0x0800_1001);
    }

    #[test]
    fn deinit_disarms_the_monitor() {
        let mut mock = MockRegisters::new(4, 0);
        let mut redirector = redirector(&mut mock, MissPolicy::StepOver);
        redirector.set_redirect(0, 0x0800_1000, 0x2000_1000).unwrap();

        redirector.deinit();
        assert_eq!(u32::from(redirector.registers().comparator(0)), 0);
        assert!(!redirector.registers().ctrl().enable());
        assert!(!redirector.registers().demcr().mon_en());
        assert_eq!(redirector.get_redirect(0x0800_1000), None);
        assert_eq!(redirector.set_redirect(0, 0x0800_1000, 0x2000_1000), Err(Error::NotInitialized));
    }

    static SHARED: SharedRedirector<MockRegisters> = SharedRedirector::new();

    #[test]
    fn installed_redirector_stays_configurable() {
        let mut frame = frame_at(0x0800_1000);
        assert_eq!(SHARED.dispatch(&mut frame), Outcome::NotOurs);
        assert_eq!(SHARED.with(|r| r.num_code_comparators()), None);

        let mut redirector = BareRedirector::new(MockRegisters::new(4, 0), MissPolicy::StepOver);
        redirector.init().unwrap();
        assert!(SHARED.install(redirector).is_none());

        SHARED.with(|r| r.set_redirect(0, 0x0800_1000, 0x2000_1000)).unwrap().unwrap();
        SHARED.with(|r| r.registers_mut().raise_breakpoint()).unwrap();
        assert_eq!(SHARED.dispatch(&mut frame), Outcome::Redirected(0x2000_1001));
        assert_eq!(frame[FRAME_PC], 0x2000_1001);

        SHARED.with(|r| r.clear_redirect(0)).unwrap().unwrap();
        SHARED.with(|r| r.registers_mut().raise_breakpoint()).unwrap();
        let mut frame = frame_at(0x0800_1000);
        assert_eq!(SHARED.dispatch(&mut frame), Outcome::Unmatched);
        assert_eq!(frame, frame_at(0x0800_1000));

        let redirector = SHARED.uninstall().unwrap();
        assert_eq!(u32::from(redirector.registers().comparator(0)), 0);
        assert_eq!(SHARED.with(|r| r.get_redirect(0x0800_1000)), None);
    }

    #[test]
    fn reentrant_access_is_refused() {
        let shared = SharedRedirector::new();
        shared.install(BareRedirector::new(MockRegisters::new(2, 0), MissPolicy::Leave));

        let nested = shared.with(|_| shared.with(|r| r.num_code_comparators()));
        assert_eq!(nested, Some(None));
    }
}
