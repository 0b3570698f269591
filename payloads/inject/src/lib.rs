#![cfg_attr(not(any(test, feature = "std")), no_std)]

//! Runtime function redirection on Cortex-M through the Flash Patch and
//! Breakpoint unit.
//!
//! Two strategies share one slot model. On FPB version 1 the
//! [`PatchRegistry`] remaps instruction fetches onto branches held in a RAM
//! table. Where remap is missing, the [`debugmon`] redirectors breakpoint
//! the original address and rewrite the stacked PC from the DebugMonitor
//! exception.

pub use crate::{
    debugmon::{
        Outcome, RedirectEntry, RedirectTable, StackFrame,
        bare::{BareRedirector, MissPolicy, SharedRedirector},
        rtos::{DebugpointHost, DebugpointKind, RtosRedirector},
    },
    err::Error,
    registry::{PatchRegistry, RemapTable, Slot, StateSnapshot},
    trampoline::{MAX_TRAMPOLINES, TargetTable, TrampolineTable},
};

pub mod debugmon;
mod err;
mod registry;
pub mod thumb;
mod trampoline;

pub type Result<T> = core::result::Result<T, Error>;
