//! RTOS variant: the scheduler owns the DebugMonitor exception and hands out
//! debugpoints; each one calls back with the stacked frame.

use core::{cell::Cell, cmp::min};

use derive_more::IsVariant;
use fpb_hal::MAX_COMPARATORS;
use fpb_shared::console_printfln;

use crate::{
    Result,
    debugmon::{FRAME_PC, Outcome, RedirectEntry, RedirectTable, StackFrame},
    err::Error,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, IsVariant)]
pub enum DebugpointKind {
    Breakpoint,
    Watchpoint,
}

/// Called from the scheduler's DebugMonitor handler with the `user_data`
/// given to [`DebugpointHost::add`].
pub type DebugpointCallback = fn(user_data: *mut (), frame: &mut StackFrame);

/// Debugpoint service of the host RTOS.
pub trait DebugpointHost {
    type Handle: Copy;

    /// Breakpoint comparators the host can hand out
    fn comparator_count(&self) -> u8;

    fn add(
        &mut self,
        address: u32,
        kind: DebugpointKind,
        callback: DebugpointCallback,
        user_data: *mut (),
    ) -> Result<Self::Handle>;

    fn remove(&mut self, handle: Self::Handle) -> Result<()>;
}

/// Redirects through host debugpoints. Each debugpoint carries a pointer to
/// its slot in `table`, which therefore outlives the redirector.
pub struct RtosRedirector<'a, H: DebugpointHost> {
    host: H,
    table: &'a RedirectTable,
    handles: [Option<H::Handle>; MAX_COMPARATORS],
    count: usize,
    initialized: bool,
}

impl<'a, H: DebugpointHost> RtosRedirector<'a, H> {
    pub fn new(host: H, table: &'a RedirectTable) -> Self {
        Self {
            host,
            table,
            handles: [None; MAX_COMPARATORS],
            count: 0,
            initialized: false,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn init(&mut self) -> Result<()> {
        let count = self.host.comparator_count();
        if count == 0 {
            return Err(Error::Unsupported);
        }

        self.count = min(count as usize, MAX_COMPARATORS);
        self.table.clear_all();
        self.initialized = true;

        console_printfln!("debugmon: {} host debugpoints", self.count);
        Ok(())
    }

    /// Release every debugpoint still held. On a host refusal the
    /// redirector stays initialized and the call can be repeated.
    pub fn deinit(&mut self) -> Result<()> {
        let mut result = Ok(());
        for slot in 0..self.count {
            if let Err(e) = self.release(slot) {
                result = Err(e);
            }
        }
        result?;

        self.initialized = false;
        self.count = 0;
        Ok(())
    }

    /// Breakpoint `original_address` and resume at `redirect_address`. An
    /// active slot gives its debugpoint back before the new one is added.
    pub fn set_redirect(&mut self, slot: usize, original_address: u32, redirect_address: u32) -> Result<()> {
        self.check_slot(slot)?;
        self.release(slot)?;

        let entry = RedirectEntry::active(original_address, redirect_address);
        self.table.set(slot, entry);

        let user_data = self.table.entry_ptr(slot) as *mut ();
        match self.host.add(entry.original_address, DebugpointKind::Breakpoint, on_debugpoint, user_data) {
            Ok(handle) => self.handles[slot] = Some(handle),
            Err(e) => {
                self.table.clear(slot);
                return Err(e);
            }
        }

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
        self.release(slot)
    }

    pub fn get_redirect(&self, address: u32) -> Option<u32> {
        self.table.lookup(address)
    }

    /// The host dispatches to the debugpoint callbacks; nothing is left to do
    /// here.
    pub fn handler(&mut self, _frame: &mut StackFrame) -> Outcome {
        Outcome::NotOurs
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }

        if slot >= self.count {
            return Err(Error::InvalidSlot(slot));
        }

        Ok(())
    }

    /// Give the slot's debugpoint back. The handle is kept if the host
    /// refuses, so a later call can retry.
    fn release(&mut self, slot: usize) -> Result<()> {
        if let Some(handle) = self.handles[slot] {
            self.host.remove(handle)?;
            self.handles[slot] = None;
        }
        self.table.clear(slot);
        Ok(())
    }
}

impl<H: DebugpointHost> Drop for RtosRedirector<'_, H> {
    /// Debugpoints carry pointers into the borrowed table; none may outlive it.
    fn drop(&mut self) {
        for slot in 0..self.count {
            let _ = self.release(slot);
        }
    }
}

impl<T: DebugpointHost + ?Sized> DebugpointHost for &mut T {
    type Handle = T::Handle;

    fn comparator_count(&self) -> u8 {
        (**self).comparator_count()
    }

    fn add(
        &mut self,
        address: u32,
        kind: DebugpointKind,
        callback: DebugpointCallback,
        user_data: *mut (),
    ) -> Result<Self::Handle> {
        (**self).add(address, kind, callback, user_data)
    }

    fn remove(&mut self, handle: Self::Handle) -> Result<()> {
        (**self).remove(handle)
    }
}

fn on_debugpoint(user_data: *mut (), frame: &mut StackFrame) {
    // SAFETY: `user_data` is a slot of the `RedirectTable` borrowed by the
    // redirector that registered this callback
    let entry = unsafe { &*(user_data as *const Cell<RedirectEntry>) }.get();
    if entry.matches(frame[FRAME_PC]) {
        frame[FRAME_PC] = entry.redirect_address;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    struct Debugpoint {
        handle: u32,
        address: u32,
        kind: DebugpointKind,
        callback: DebugpointCallback,
        user_data: *mut (),
    }

    /// Host that keeps its debugpoints in a list and fires them on demand.
    struct MockHost {
        comparators: u8,
        next_handle: u32,
        points: Vec<Debugpoint>,
        full: bool,
        /// Removals to refuse before complying again
        refuse_remove: usize,
    }

    impl MockHost {
        fn new(comparators: u8) -> Self {
            Self {
                comparators,
                next_handle: 1,
                points: Vec::new(),
                full: false,
                refuse_remove: 0,
            }
        }

        fn active(&self) -> usize {
            self.points.len()
        }

        /// Run the callbacks a breakpoint at `pc` would trigger.
        fn hit(&self, frame: &mut StackFrame) {
            let pc = frame[FRAME_PC] & !1;
            for point in self.points.iter().filter(|p| p.address == pc) {
                (point.callback)(point.user_data, frame);
            }
        }
    }

    impl DebugpointHost for MockHost {
        type Handle = u32;

        fn comparator_count(&self) -> u8 {
            self.comparators
        }

        fn add(
            &mut self,
            address: u32,
            kind: DebugpointKind,
            callback: DebugpointCallback,
            user_data: *mut (),
        ) -> Result<u32> {
            if self.full || self.points.len() >= self.comparators as usize {
                return Err(Error::Debugpoint);
            }

            let handle = self.next_handle;
            self.next_handle += 1;
            self.points.push(Debugpoint {
                handle,
                address,
                kind,
                callback,
                user_data,
            });
            Ok(handle)
        }

        fn remove(&mut self, handle: u32) -> Result<()> {
            if self.refuse_remove > 0 {
                self.refuse_remove -= 1;
                return Err(Error::Debugpoint);
            }

            let index = self.points.iter().position(|p| p.handle == handle).ok_or(Error::Debugpoint)?;
            self.points.remove(index);
            Ok(())
        }
    }

    fn frame_at(pc: u32) -> StackFrame {
        [1, 2, 3, 4, 12, 0x0800_0201, pc, 0x0100_0000]
    }

    #[test]
    fn init_needs_host_comparators() {
        let table = RedirectTable::new();
        let mut redirector = RtosRedirector::new(MockHost::new(0), &table);
        assert_eq!(redirector.init(), Err(Error::Unsupported));
        assert_eq!(redirector.set_redirect(0, 0x0800_1000, 0x2000_1000), Err(Error::NotInitialized));
    }

    #[test]
    fn redirect_registers_one_breakpoint() {
        let table = RedirectTable::new();
        let mut redirector = RtosRedirector::new(MockHost::new(4), &table);
        redirector.init().unwrap();

        redirector.set_redirect(0, 0x0800_1001, 0x2000_1000).unwrap();
        assert_eq!(redirector.get_redirect(0x0800_1001), Some(0x2000_1001));

        let point = &redirector.host().points[0];
        assert_eq!(point.address, 0x0800_1000);
        assert!(point.kind.is_breakpoint());
        assert_eq!(redirector.set_redirect(4, 0x0800_1000, 0x2000_1000), Err(Error::InvalidSlot(4)));
    }

    #[test]
    fn resetting_a_slot_keeps_one_debugpoint() {
        let table = RedirectTable::new();
        let mut redirector = RtosRedirector::new(MockHost::new(4), &table);
        redirector.init().unwrap();

        redirector.set_redirect(2, 0x0800_1000, 0x2000_1000).unwrap();
        redirector.set_redirect(2, 0x0800_1000, 0x2000_3000).unwrap();
        redirector.set_redirect(2, 0x0800_1000, 0x2000_5000).unwrap();

        assert_eq!(redirector.host().active(), 1);
        assert_eq!(redirector.get_redirect(0x0800_1000), Some(0x2000_5001));
    }

    #[test]
    fn callback_rewrites_matching_frame() {
        let table = RedirectTable::new();
        let mut redirector = RtosRedirector::new(MockHost::new(4), &table);
        redirector.init().unwrap();
        redirector.set_redirect(0, 0x0800_1000, 0x2000_1000).unwrap();
        redirector.set_redirect(1, 0x0800_2000, 0x2000_2000).unwrap();

        let mut frame = frame_at(0x0800_2000);
        redirector.host().hit(&mut frame);

        let mut expected = frame_at(0x0800_2000);
        expected[FRAME_PC] = 0x2000_2001;
        assert_eq!(frame, expected);

        let mut frame = frame_at(0x0800_3000);
        redirector.host().hit(&mut frame);
        assert_eq!(frame, frame_at(0x0800_3000));
    }

    #[test]
    fn callback_ignores_stale_pc() {
        let table = RedirectTable::new();
        table.set(0, RedirectEntry::active(0x0800_1000, 0x2000_1000));

        let mut frame = frame_at(0x0800_1004);
        on_debugpoint(table.entry_ptr(0) as *mut (), &mut frame);
        assert_eq!(frame, frame_at(0x0800_1004));

        table.clear(0);
        let mut frame = frame_at(0x0800_1000);
        on_debugpoint(table.entry_ptr(0) as *mut (), &mut frame);
        assert_eq!(frame, frame_at(0x0800_1000));
    }

    #[test]
    fn clear_releases_the_debugpoint() {
        let table = RedirectTable::new();
        let mut redirector = RtosRedirector::new(MockHost::new(4), &table);
        redirector.init().unwrap();
        redirector.set_redirect(0, 0x0800_1000, 0x2000_1000).unwrap();
        redirector.set_redirect(1, 0x0800_2000, 0x2000_2000).unwrap();

        redirector.clear_redirect(0).unwrap();
        redirector.clear_redirect(0).unwrap();
        assert_eq!(redirector.host().active(), 1);
        assert_eq!(redirector.get_redirect(0x0800_1000), None);
        assert_eq!(redirector.get_redirect(0x0800_2000), Some(0x2000_2001));

        redirector.deinit().unwrap();
        assert_eq!(redirector.host().active(), 0);
        assert_eq!(redirector.get_redirect(0x0800_2000), None);
    }

    #[test]
    fn host_refusal_leaves_slot_empty() {
        let table = RedirectTable::new();
        let mut host = MockHost::new(4);
        host.full = true;
        let mut redirector = RtosRedirector::new(host, &table);
        redirector.init().unwrap();

        assert_eq!(redirector.set_redirect(0, 0x0800_1000, 0x2000_1000), Err(Error::Debugpoint));
        assert_eq!(redirector.get_redirect(0x0800_1000), None);
        assert_eq!(redirector.host().active(), 0);
    }

    #[test]
    fn handler_is_a_no_op() {
        let table = RedirectTable::new();
        let mut redirector = RtosRedirector::new(MockHost::new(4), &table);
        redirector.init().unwrap();
        redirector.set_redirect(0, 0x0800_1000, 0x2000_1000).unwrap();

        let mut frame = frame_at(0x0800_1000);
        assert_eq!(redirector.handler(&mut frame), Outcome::NotOurs);
        assert_eq!(frame, frame_at(0x0800_1000));
    }

    #[test]
    fn refused_removal_keeps_the_handle() {
        let table = RedirectTable::new();
        let mut host = MockHost::new(4);
        let mut redirector = RtosRedirector::new(&mut host, &table);
        redirector.init().unwrap();
        redirector.set_redirect(0, 0x0800_1000, 0x2000_1000).unwrap();

        redirector.host.refuse_remove = 1;
        assert_eq!(redirector.set_redirect(0, 0x0800_2000, 0x2000_2000), Err(Error::Debugpoint));
        assert_eq!(redirector.host().active(), 1);
        assert_eq!(redirector.get_redirect(0x0800_1000), Some(0x2000_1001));

        redirector.set_redirect(0, 0x0800_2000, 0x2000_2000).unwrap();
        assert_eq!(redirector.host().active(), 1);
        assert_eq!(redirector.host().points[0].address, 0x0800_2000);
        assert_eq!(redirector.get_redirect(0x0800_1000), None);
    }

    #[test]
    fn refused_deinit_can_be_retried() {
        let table = RedirectTable::new();
        let mut host = MockHost::new(4);
        let mut redirector = RtosRedirector::new(&mut host, &table);
        redirector.init().unwrap();
        redirector.set_redirect(0, 0x0800_1000, 0x2000_1000).unwrap();
        redirector.set_redirect(1, 0x0800_2000, 0x2000_2000).unwrap();

        redirector.host.refuse_remove = 1;
        assert_eq!(redirector.deinit(), Err(Error::Debugpoint));
        assert_eq!(redirector.host().active(), 1);
        assert_eq!(redirector.clear_redirect(0), Ok(()));

        redirector.deinit().unwrap();
        assert_eq!(redirector.host().active(), 0);
    }

    #[test]
    fn dropping_the_redirector_releases_debugpoints() {
        let table = RedirectTable::new();
        let mut host = MockHost::new(4);
        {
            let mut redirector = RtosRedirector::new(&mut host, &table);
            redirector.init().unwrap();
            redirector.set_redirect(0, 0x0800_1000, 0x2000_1000).unwrap();
            redirector.set_redirect(3, 0x0800_4000, 0x2000_4000).unwrap();
            assert_eq!(redirector.host().active(), 2);
        }

        assert_eq!(host.active(), 0);
        assert_eq!(table.lookup(0x0800_1000), None);
    }
}
