//! Call hijacking that makes a target load a handler library
//!
//! When a probed function is entered and the process is ready, the call is
//! turned into a call of the in-process `dlopen`: the two first stack
//! arguments are replaced by the handler path and `RTLD_NOW`, and the
//! thread jumps to the loader entry. The return probe fires when `dlopen`
//! returns; the hijacked call is then put back exactly as it was, and the
//! thread re-enters the original function.

use log::{debug, warn};

use super::control::BinRegistry;
use super::pd::{HandlerDescriptor, HandlerState, ProcessDescriptor, SavedCall};
use crate::domain::LoaderError;
use crate::memory::{PatchSet, ProcessMemory, VmaLookup};
use crate::uprobes::TrapContext;

/// Offset of `r_state` inside the i386 `struct r_debug`
pub const R_STATE_OFFSET: u64 = 12;
/// `r_state` value while no `dlopen`/`dlclose` is in progress
pub const RT_CONSISTENT: u64 = 0;
pub const RTLD_NOW: u64 = 2;

/// Whether a call returning to `caller` may be hijacked
///
/// The dynamic linker must be mapped and idle, and the caller must not
/// live in an ignored binary. A caller outside any known mapping is
/// allowed.
#[must_use]
pub fn is_ready(
    mem: &dyn ProcessMemory,
    vma: &dyn VmaLookup,
    bins: &BinRegistry,
    pd: &ProcessDescriptor,
    r_debug_offset: u64,
    caller: u64,
) -> bool {
    if pd.loader_base == 0 {
        return false;
    }

    let r_state = pd.loader_base + r_debug_offset + R_STATE_OFFSET;
    match mem.read_word(pd.pid, r_state) {
        Ok(RT_CONSISTENT) => {}
        Ok(state) => {
            debug!("{}: linker busy (r_state {state})", pd.pid);
            return false;
        }
        Err(fault) => {
            debug!("{}: linker state unreadable: {fault}", pd.pid);
            return false;
        }
    }

    let ignored = vma
        .mapping_at(pd.pid, caller)
        .and_then(|m| m.dentry)
        .is_some_and(|dentry| bins.contains(&dentry));
    if ignored {
        debug!("{}: call from ignored binary at {caller:#x}", pd.pid);
    }
    !ignored
}

/// Turn the trapped call into `dlopen(path, RTLD_NOW)`
///
/// Returns `false` without touching anything when `hd` has no path in the
/// target or is not waiting to be loaded.
///
/// # Errors
/// [`LoaderError::Fault`] if the arguments cannot be read or replaced; the
/// call is left as it was.
pub fn not_loaded_entry(
    ctx: &mut TrapContext<'_>,
    hd: &mut HandlerDescriptor,
    loader_entry: u64,
) -> Result<bool, LoaderError> {
    let Some(path_addr) = hd.path_addr else {
        return Ok(false);
    };
    if hd.state() != HandlerState::NotLoaded {
        return Ok(false);
    }

    let pid = ctx.pid;
    let (slot0, slot1) = (ctx.regs.arg_slot(0), ctx.regs.arg_slot(1));
    let args = [ctx.mem.read_word(pid, slot0)?, ctx.mem.read_word(pid, slot1)?];

    let mut patch = PatchSet::new();
    patch.stage_word(slot0, path_addr).stage_word(slot1, RTLD_NOW);
    patch.commit(ctx.mem, pid)?;

    hd.begin_loading(SavedCall { regs: *ctx.regs, args });
    ctx.regs.ip = loader_entry;
    Ok(true)
}

/// Finish a load started by [`not_loaded_entry`]
///
/// Returns the new handler state, or `None` when this return does not
/// belong to a load of `hd`.
///
/// # Errors
/// [`LoaderError::Fault`] if the original arguments cannot be put back;
/// the handler then stays `Loading`.
pub fn loading_return(
    ctx: &mut TrapContext<'_>,
    hd: &mut HandlerDescriptor,
    redirected_to: Option<u64>,
    loader_entry: u64,
) -> Result<Option<HandlerState>, LoaderError> {
    if hd.state() != HandlerState::Loading || redirected_to != Some(loader_entry) {
        return Ok(None);
    }
    let Some(saved) = hd.saved_call().copied() else {
        return Ok(None);
    };

    let mut patch = PatchSet::new();
    patch
        .stage_word(saved.regs.arg_slot(0), saved.args[0])
        .stage_word(saved.regs.arg_slot(1), saved.args[1]);
    patch.commit(ctx.mem, ctx.pid)?;

    let handle = ctx.regs.return_value();
    *ctx.regs = saved.regs;
    hd.finish_loading(handle);
    if handle == 0 {
        warn!("{}: loading {} failed, {} attempts left", ctx.pid, hd.path.display(), hd.attempts());
    }
    Ok(Some(hd.state()))
}

/// Give a failed handler another chance; `true` if it will be retried
pub fn failed_return(hd: &mut HandlerDescriptor) -> bool {
    hd.retry()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Dentry, Pid, Tid};
    use crate::memory::{Mapping, MapsSnapshot, ScratchMemory};
    use crate::uprobes::Regs;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    const PID: Pid = Pid(300);
    const LD_BASE: u64 = 0xb770_0000;
    const R_DEBUG: u64 = 0x2_1000;
    const SP: u64 = 0xbfff_f000;
    const PATH_ADDR: u64 = 0xb780_0000;
    const DLOPEN: u64 = LD_BASE + 0x1_2340;

    fn process() -> (ScratchMemory, ProcessDescriptor) {
        let mem = ScratchMemory::new();
        mem.map_zeroed(PID, LD_BASE + R_DEBUG, 32);
        let mut stack = 0x0804_8123u32.to_le_bytes().to_vec();
        stack.extend_from_slice(&0x1111u32.to_le_bytes());
        stack.extend_from_slice(&0x2222u32.to_le_bytes());
        stack.resize(32, 0);
        mem.map(PID, SP, &stack);

        let mut pd = ProcessDescriptor::new(PID);
        pd.loader_base = LD_BASE;
        let mut hd = HandlerDescriptor::new(Dentry { dev: 1, ino: 9 }, PathBuf::from("/h.so"), 2);
        hd.path_addr = Some(PATH_ADDR);
        pd.handlers.push(hd);
        (mem, pd)
    }

    #[test]
    fn test_ready_requires_consistent_linker() {
        let (mem, mut pd) = process();
        let (vma, bins) = (MapsSnapshot::new(), BinRegistry::new());
        assert!(is_ready(&mem, &vma, &bins, &pd, R_DEBUG, 0x0804_8123));

        mem.write_word(PID, LD_BASE + R_DEBUG + R_STATE_OFFSET, 1).unwrap();
        assert!(!is_ready(&mem, &vma, &bins, &pd, R_DEBUG, 0x0804_8123));

        pd.loader_base = 0;
        assert!(!is_ready(&mem, &vma, &bins, &pd, R_DEBUG, 0x0804_8123));
    }

    #[test]
    fn test_ready_rejects_ignored_caller() {
        let (mem, pd) = process();
        let bin = NamedTempFile::new().unwrap();
        let bins = BinRegistry::new();
        bins.add_ignored_binary(bin.path()).unwrap();
        let vma = MapsSnapshot::new();
        vma.insert(
            PID,
            Mapping {
                start: 0x0804_8000,
                end: 0x0804_9000,
                perms: "r-xp".into(),
                offset: 0,
                dentry: Some(Dentry::of(bin.path()).unwrap()),
                path: Some(bin.path().to_path_buf()),
            },
        );

        assert!(!is_ready(&mem, &vma, &bins, &pd, R_DEBUG, 0x0804_8123));
        assert!(is_ready(&mem, &vma, &bins, &pd, R_DEBUG, 0x0900_0000));
    }

    #[test]
    fn test_hijack_and_restore() {
        let (mem, mut pd) = process();
        let entry_regs = Regs { ip: 0x0805_0000, sp: SP, ax: 0x77, ..Regs::default() };
        let mut regs = entry_regs;
        let hd = &mut pd.handlers[0];

        let mut ctx = TrapContext { pid: PID, tid: Tid(301), regs: &mut regs, mem: &mem };
        assert!(not_loaded_entry(&mut ctx, hd, DLOPEN).unwrap());
        assert_eq!(regs.ip, DLOPEN);
        assert_eq!(mem.read_word(PID, SP + 4).unwrap(), PATH_ADDR);
        assert_eq!(mem.read_word(PID, SP + 8).unwrap(), RTLD_NOW);
        assert_eq!(hd.state(), HandlerState::Loading);

        // dlopen returned a handle
        regs.ip = 0x0804_8123;
        regs.sp = SP + 4;
        regs.ax = 0x0806_1000;
        let mut ctx = TrapContext { pid: PID, tid: Tid(301), regs: &mut regs, mem: &mem };
        let state = loading_return(&mut ctx, hd, Some(DLOPEN), DLOPEN).unwrap();
        assert_eq!(state, Some(HandlerState::Loaded));
        assert_eq!(regs, entry_regs);
        assert_eq!(mem.read_word(PID, SP + 4).unwrap(), 0x1111);
        assert_eq!(mem.read_word(PID, SP + 8).unwrap(), 0x2222);
        assert_eq!(hd.handle, 0x0806_1000);
    }

    #[test]
    fn test_failed_load_is_retried() {
        let (mem, mut pd) = process();
        let mut regs = Regs { ip: 0x0805_0000, sp: SP, ..Regs::default() };
        let hd = &mut pd.handlers[0];

        let mut ctx = TrapContext { pid: PID, tid: Tid(301), regs: &mut regs, mem: &mem };
        not_loaded_entry(&mut ctx, hd, DLOPEN).unwrap();
        regs.ax = 0;
        let mut ctx = TrapContext { pid: PID, tid: Tid(301), regs: &mut regs, mem: &mem };
        assert_eq!(
            loading_return(&mut ctx, hd, Some(DLOPEN), DLOPEN).unwrap(),
            Some(HandlerState::Failed)
        );
        assert!(failed_return(hd));
        assert_eq!(hd.state(), HandlerState::NotLoaded);
    }

    #[test]
    fn test_return_from_elsewhere_is_not_a_load() {
        let (mem, mut pd) = process();
        let mut regs = Regs { ip: 0x0805_0000, sp: SP, ..Regs::default() };
        let hd = &mut pd.handlers[0];
        let mut ctx = TrapContext { pid: PID, tid: Tid(301), regs: &mut regs, mem: &mem };
        not_loaded_entry(&mut ctx, hd, DLOPEN).unwrap();

        let mut ctx = TrapContext { pid: PID, tid: Tid(301), regs: &mut regs, mem: &mem };
        assert_eq!(loading_return(&mut ctx, hd, None, DLOPEN).unwrap(), None);
        assert_eq!(hd.state(), HandlerState::Loading);
    }

    #[test]
    fn test_unwritable_stack_keeps_call() {
        let (mem, mut pd) = process();
        mem.unmap(PID, SP);
        mem.map_read_only(PID, SP, &[0; 32]);
        let mut regs = Regs { ip: 0x0805_0000, sp: SP, ..Regs::default() };
        let hd = &mut pd.handlers[0];

        let mut ctx = TrapContext { pid: PID, tid: Tid(301), regs: &mut regs, mem: &mem };
        assert!(matches!(not_loaded_entry(&mut ctx, hd, DLOPEN), Err(LoaderError::Fault(_))));
        assert_eq!(regs.ip, 0x0805_0000);
        assert_eq!(hd.state(), HandlerState::NotLoaded);
    }
}
