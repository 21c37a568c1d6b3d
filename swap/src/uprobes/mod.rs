//! User-space probe engine
//!
//! Makes an instruction of another process trap, and makes a function of
//! another process trap again when it returns.
//!
//! ## Trampolines
//!
//! Each armed probe owns one slot in the process's slot area:
//!
//! ```text
//!  slot + 0          slot + 16   slot + 32
//!  ┌─────────────────┬──────┬──────────┐
//!  │ original insn   │ int3 │ (unused) │
//!  │ copy (16 bytes) │      │          │
//!  └─────────────────┴──────┴──────────┘
//! ```
//!
//! The original instruction is replaced by `int3`. On a hit the thread is
//! single-stepped through the copy and [`engine::post_single_step`] moves it
//! back to the original code. Instructions that prove safe get a `jmp` back
//! planted right after the copy and later hits skip single-stepping.
//!
//! Return probes hijack the return address so the function returns onto
//! the `int3` at `slot + 16`.
//!
//! ## Modules
//!
//! - [`insn`]: opcode classification (boostability, fixup class)
//! - [`regs`]: i386 register file and stack arguments
//! - [`slots`]: trampoline slot allocator
//! - [`uretprobe`]: return instances, hijack and disarm
//! - [`engine`]: [`ProbeEngine`], registration and trap handling

pub mod engine;
pub mod insn;
pub mod regs;
pub mod slots;
pub mod uretprobe;

pub use engine::{post_single_step, Boost, EngineStats, ProbeEngine, ProbeKey};
pub use regs::{Regs, MAX_ARGS};
pub use uretprobe::{DisarmOutcome, UretprobeInstance};

use crate::domain::{Pid, Tid};
use crate::memory::ProcessMemory;

/// Everything a handler sees of the trapped thread
pub struct TrapContext<'a> {
    pub pid: Pid,
    pub tid: Tid,
    pub regs: &'a mut Regs,
    pub mem: &'a dyn ProcessMemory,
}

/// What the trap handler did with the thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapAction {
    /// The breakpoint does not belong to any probe
    NotOurs,
    /// TF set, thread continues at the trampoline copy
    SingleStep,
    /// Thread runs the copy directly and jumps back
    Boosted,
    /// A handler sent the thread somewhere else
    Redirected,
    /// Thread continues at the (fixed-up) instruction pointer
    Resume,
}

/// Function-entry handler
pub trait UprobeHandler: Send + Sync {
    /// Runs before [`entry`](Self::entry), which is called either way.
    ///
    /// Returning an address single-steps the thread from there instead of
    /// from the trampoline copy; no fixups apply afterwards.
    fn pre_entry(&self, _ctx: &mut TrapContext<'_>) -> Option<u64> {
        None
    }

    fn entry(&self, ctx: &mut TrapContext<'_>, args: &[u64; MAX_ARGS]);
}

impl<F> UprobeHandler for F
where
    F: Fn(&mut TrapContext<'_>, &[u64; MAX_ARGS]) + Send + Sync,
{
    fn entry(&self, ctx: &mut TrapContext<'_>, args: &[u64; MAX_ARGS]) {
        self(ctx, args);
    }
}

/// Decision of a return probe's entry handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    /// Keep the instance and execute the function normally
    Continue,
    /// The handler moved `regs.ip`; keep the instance, do not single-step
    Redirected,
    /// Do not track this call
    Skip,
}

/// Decision of a return probe's return handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnOutcome {
    /// Continue at the original return address
    Resume,
    /// The handler restored a saved register file; the original return
    /// address goes back into its stack slot
    Restored,
}

/// A pending return as handed to [`UretprobeHandler`]; `redirected_to` is
/// always `None` at entry
#[derive(Debug)]
pub struct ReturnInstance<'a> {
    pub func: u64,
    pub orig_ret: u64,
    pub stack_slot: u64,
    pub redirected_to: Option<u64>,
    pub data: &'a mut [u8],
}

/// Function-return handler
pub trait UretprobeHandler: Send + Sync {
    fn entry(&self, _ctx: &mut TrapContext<'_>, _ri: &mut ReturnInstance<'_>) -> EntryOutcome {
        EntryOutcome::Continue
    }

    fn ret(&self, ctx: &mut TrapContext<'_>, ri: &mut ReturnInstance<'_>) -> ReturnOutcome;
}
