//! Return-probe instances
//!
//! Every hit of a return probe's entry creates one [`UretprobeInstance`]:
//! the word at `[sp]` (the caller's return address) is saved and replaced
//! with the address of the probe's return-break `int3`, so the function
//! returns into the trampoline instead of its caller.

use log::debug;

use super::regs::Regs;
use crate::domain::{FatalProbeError, Pid, Tid};
use crate::memory::ProcessMemory;

/// One in-flight call of a function carrying a return probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UretprobeInstance {
    /// Address of the owning probe
    pub probe: u64,
    pub tid: Tid,
    /// Return address the function was called with
    pub orig_ret: u64,
    /// Stack address holding the (hijacked) return address
    pub stack_slot: u64,
    /// Where the entry handler sent the call, if it redirected it
    pub redirected_to: Option<u64>,
    /// Per-instance private data, sized at registration
    pub data: Vec<u8>,
}

/// Result of removing the trampoline from one pending return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisarmOutcome {
    /// The slot still held the trampoline; the original address is back
    Restored,
    /// The slot no longer held the trampoline; nothing was written
    NotFound,
}

/// Hijack the return address at `[sp]`
///
/// # Errors
/// A fault on either the read or the write is fatal for this activation;
/// after a failed read nothing has been written.
pub fn prepare_instance(
    mem: &dyn ProcessMemory,
    pid: Pid,
    tid: Tid,
    regs: &Regs,
    probe: u64,
    tramp: u64,
    data_size: usize,
) -> Result<UretprobeInstance, FatalProbeError> {
    let fatal = |fault| FatalProbeError { pid, addr: probe, fault };
    let orig_ret = mem.read_word(pid, regs.sp).map_err(fatal)?;
    mem.write_word(pid, regs.sp, tramp).map_err(fatal)?;
    debug!("{tid} return from {probe:#x} to {orig_ret:#x} hijacked at {:#x}", regs.sp);

    Ok(UretprobeInstance {
        probe,
        tid,
        orig_ret,
        stack_slot: regs.sp,
        redirected_to: None,
        data: vec![0; data_size],
    })
}

/// Put the original return address back if the trampoline is still pending
///
/// # Errors
/// A fault on the stack slot is fatal; the instance is unusable afterwards.
pub fn disarm_instance(
    mem: &dyn ProcessMemory,
    pid: Pid,
    instance: &UretprobeInstance,
    tramp: u64,
) -> Result<DisarmOutcome, FatalProbeError> {
    let fatal = |fault| FatalProbeError { pid, addr: instance.probe, fault };
    let current = mem.read_word(pid, instance.stack_slot).map_err(fatal)?;
    if current != tramp {
        debug!(
            "{} stack slot {:#x} holds {current:#x}, trampoline already gone",
            instance.tid, instance.stack_slot
        );
        return Ok(DisarmOutcome::NotFound);
    }
    mem.write_word(pid, instance.stack_slot, instance.orig_ret).map_err(fatal)?;
    Ok(DisarmOutcome::Restored)
}
