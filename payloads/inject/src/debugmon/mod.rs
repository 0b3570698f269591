//! Redirection through the DebugMonitor exception, for FPBs that can only
//! raise breakpoints.
//!
//! A comparator breakpoints the original address; the exception handler then
//! rewrites the stacked PC so the exception return lands on the redirect.

use core::cell::Cell;

use derive_ctor::ctor;
use derive_more::IsVariant;
use fpb_hal::MAX_COMPARATORS;
use fpb_shared::{strip_thumb, with_thumb};

pub mod bare;
pub mod rtos;

/// Registers the core pushes on exception entry, lowest address first.
pub type StackFrame = [u32; 8];

pub const FRAME_R0: usize = 0;
pub const FRAME_R1: usize = 1;
pub const FRAME_R2: usize = 2;
pub const FRAME_R3: usize = 3;
pub const FRAME_R12: usize = 4;
pub const FRAME_LR: usize = 5;
pub const FRAME_PC: usize = 6;
pub const FRAME_XPSR: usize = 7;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ctor)]
pub struct RedirectEntry {
    /// Breakpointed address, Thumb bit clear
    pub original_address: u32,
    /// Resume address, Thumb bit set
    pub redirect_address: u32,
    pub enabled: bool,
}

impl RedirectEntry {
    pub const EMPTY: Self = Self {
        original_address: 0,
        redirect_address: 0,
        enabled: false,
    };

    /// Enabled entry with the Thumb bit normalized on both ends.
    pub fn active(original_address: u32, redirect_address: u32) -> Self {
        Self::new(strip_thumb(original_address), with_thumb(redirect_address), true)
    }

    pub fn matches(&self, address: u32) -> bool {
        self.enabled && self.original_address == strip_thumb(address)
    }
}

/// Redirect entries, one per slot.
///
/// Entries sit in [`Cell`]s so the exception handler and the RTOS callbacks
/// can read them through shared references while thread code updates them.
pub struct RedirectTable {
    entries: [Cell<RedirectEntry>; MAX_COMPARATORS],
}

// SAFETY: single core; entries are written from thread context only and each
// entry is a plain `Copy` value read whole by the exception path.
unsafe impl Sync for RedirectTable {}

impl RedirectTable {
    pub const fn new() -> Self {
        Self {
            entries: [const { Cell::new(RedirectEntry::EMPTY) }; MAX_COMPARATORS],
        }
    }

    pub fn get(&self, slot: usize) -> RedirectEntry {
        self.entries[slot].get()
    }

    /// Redirect for `address`, with or without its Thumb bit.
    pub fn lookup(&self, address: u32) -> Option<u32> {
        self.entries
            .iter()
            .map(Cell::get)
            .find(|entry| entry.matches(address))
            .map(|entry| entry.redirect_address)
    }

    fn set(&self, slot: usize, entry: RedirectEntry) {
        self.entries[slot].set(entry);
    }

    fn clear(&self, slot: usize) {
        self.entries[slot].set(RedirectEntry::EMPTY);
    }

    fn clear_all(&self) {
        for entry in &self.entries {
            entry.set(RedirectEntry::EMPTY);
        }
    }

    fn entry_ptr(&self, slot: usize) -> *const Cell<RedirectEntry> {
        &self.entries[slot]
    }
}

impl Default for RedirectTable {
    fn default() -> Self {
        Self::new()
    }
}

/// What the exception handler did with one DebugMonitor entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IsVariant)]
pub enum Outcome {
    /// DFSR.BKPT was clear, the event belongs to someone else
    NotOurs,
    /// Stacked PC rewritten to this address
    Redirected(u32),
    /// No redirect for the PC; the matching comparator is off and a single
    /// step is armed
    SteppingOver(usize),
    /// The step finished and the comparator is back on
    Rearmed(usize),
    /// No redirect and nothing to step over; the frame is untouched
    Unmatched,
}
