//! Probe registration and trap handling
//!
//! [`ProbeEngine`] owns one probe table per attached process. Trap handlers
//! run on behalf of the trapped thread; handler callbacks are invoked with
//! no engine lock held so they may call back into the engine.
//!
//! # Fault model
//!
//! A memory fault while arming (slot write, `int3` placement, return
//! hijack, return restore) is a [`FatalProbeError`]. Arming is staged in a
//! [`PatchSet`], so a failed registration leaves the target untouched. A
//! fault inside a trap aborts that activation: the probe is disarmed and
//! the thread re-executes the original instruction.

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::insn::{
    can_boost, is_relative_call, jmp_op, Fixup, BREAKPOINT_INSN, MAX_INSN_SIZE, RELATIVE_JUMP_SIZE,
    TF_MASK,
};
use super::regs::Regs;
use super::slots::{SlotArea, RET_BREAK_OFFSET, SLOT_SIZE};
use super::uretprobe::{disarm_instance, prepare_instance, DisarmOutcome, UretprobeInstance};
use super::{
    EntryOutcome, ReturnInstance, ReturnOutcome, TrapAction, TrapContext, UprobeHandler,
    UretprobeHandler,
};
use crate::domain::{Fault, FatalProbeError, Pid, ProbeError, Tid};
use crate::memory::{PatchSet, ProcessMemory};

/// Identity of a probe: address in a given process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeKey {
    pub pid: Pid,
    pub addr: u64,
}

/// Whether the trampoline copy may run without single-stepping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boost {
    /// Candidate; decided after the first single-step
    Unknown,
    /// A jump back follows the copy
    Boosted,
    Never,
}

#[derive(Clone)]
enum ProbeKind {
    Entry(Option<Arc<dyn UprobeHandler>>),
    Return { handler: Arc<dyn UretprobeHandler>, data_size: usize, maxactive: usize },
}

struct Uprobe {
    insn: [u8; MAX_INSN_SIZE],
    slot: u64,
    boost: Boost,
    kind: ProbeKind,
    nmissed: u64,
}

impl Uprobe {
    fn ret_break(&self) -> u64 {
        self.slot + RET_BREAK_OFFSET as u64
    }
}

/// Per-thread state for the single-step window only
struct ControlBlock {
    probe: u64,
    copy: u64,
    insn: [u8; MAX_INSN_SIZE],
    saved_flags: u64,
    redirected: bool,
}

struct PendingReturn {
    ri: UretprobeInstance,
    /// The entry handler skipped the call but the hijack could not be undone
    silent: bool,
}

struct ProcessProbes {
    slots: SlotArea,
    probes: HashMap<u64, Uprobe>,
    /// Return-break address -> probe address
    ret_breaks: HashMap<u64, u64>,
    pending: Vec<PendingReturn>,
    control: HashMap<Tid, ControlBlock>,
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub hits: u64,
    pub single_steps: u64,
    pub boosted: u64,
    pub return_hits: u64,
    /// Return-probe hits dropped for exceeding `maxactive`
    pub missed: u64,
    pub faults: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    single_steps: AtomicU64,
    boosted: AtomicU64,
    return_hits: AtomicU64,
    missed: AtomicU64,
    faults: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub struct ProbeEngine {
    mem: Arc<dyn ProcessMemory>,
    processes: RwLock<HashMap<Pid, Arc<Mutex<ProcessProbes>>>>,
    counters: Counters,
}

enum Hit {
    Entry(u64),
    Return(u64),
}

impl ProbeEngine {
    #[must_use]
    pub fn new(mem: Arc<dyn ProcessMemory>) -> Self {
        Self { mem, processes: RwLock::new(HashMap::new()), counters: Counters::default() }
    }

    #[must_use]
    pub fn memory(&self) -> &Arc<dyn ProcessMemory> {
        &self.mem
    }

    /// Start managing `pid`, using `[slot_base, slot_base + len)` for trampolines
    ///
    /// # Errors
    /// [`ProbeError::AlreadyAttached`] if `pid` is already managed
    pub fn attach_process(&self, pid: Pid, slot_base: u64, len: usize) -> Result<(), ProbeError> {
        let mut processes = self.processes.write();
        if processes.contains_key(&pid) {
            return Err(ProbeError::AlreadyAttached(pid));
        }
        let slots = SlotArea::new(slot_base, len);
        info!("Attached {pid}: {} trampoline slots at {slot_base:#x}", slots.capacity());
        processes.insert(
            pid,
            Arc::new(Mutex::new(ProcessProbes {
                slots,
                probes: HashMap::new(),
                ret_breaks: HashMap::new(),
                pending: Vec::new(),
                control: HashMap::new(),
            })),
        );
        Ok(())
    }

    /// Forget an exited process without touching its memory
    pub fn detach_process(&self, pid: Pid) -> bool {
        let removed = self.processes.write().remove(&pid).is_some();
        if removed {
            info!("Detached {pid}");
        }
        removed
    }

    #[must_use]
    pub fn is_attached(&self, pid: Pid) -> bool {
        self.processes.read().contains_key(&pid)
    }

    /// Arm an entry probe; `None` only counts hits
    ///
    /// # Errors
    /// See [`ProbeEngine::register_uretprobe`]
    pub fn register_uprobe(
        &self,
        pid: Pid,
        addr: u64,
        handler: Option<Arc<dyn UprobeHandler>>,
    ) -> Result<ProbeKey, ProbeError> {
        self.register(pid, addr, ProbeKind::Entry(handler))
    }

    /// Arm a return probe with `data_size` bytes of per-call data and at
    /// most `maxactive` calls tracked at once
    ///
    /// # Errors
    /// - [`ProbeError::RelativeCall`] if the instruction is a `call rel32`
    /// - [`ProbeError::Fatal`] if the instruction cannot be read or the
    ///   patch cannot be applied (nothing is left behind)
    /// - [`ProbeError::SlotsExhausted`], [`ProbeError::AlreadyRegistered`],
    ///   [`ProbeError::NotAttached`]
    pub fn register_uretprobe(
        &self,
        pid: Pid,
        addr: u64,
        handler: Arc<dyn UretprobeHandler>,
        data_size: usize,
        maxactive: usize,
    ) -> Result<ProbeKey, ProbeError> {
        self.register(pid, addr, ProbeKind::Return { handler, data_size, maxactive })
    }

    fn process(&self, pid: Pid) -> Option<Arc<Mutex<ProcessProbes>>> {
        self.processes.read().get(&pid).cloned()
    }

    fn register(&self, pid: Pid, addr: u64, kind: ProbeKind) -> Result<ProbeKey, ProbeError> {
        let proc = self.process(pid).ok_or(ProbeError::NotAttached(pid))?;
        let mut probes = proc.lock();
        if probes.probes.contains_key(&addr) {
            return Err(ProbeError::AlreadyRegistered { pid, addr });
        }

        let fatal = |fault| ProbeError::from(FatalProbeError { pid, addr, fault });
        let raw = self.mem.read(pid, addr, MAX_INSN_SIZE).map_err(fatal)?;
        if is_relative_call(&raw) {
            return Err(ProbeError::RelativeCall { addr });
        }
        let mut insn = [0u8; MAX_INSN_SIZE];
        insn.copy_from_slice(&raw);

        let slot = probes.slots.alloc().ok_or(ProbeError::SlotsExhausted(pid))?;
        let mut tramp = [0u8; SLOT_SIZE];
        tramp[..MAX_INSN_SIZE].copy_from_slice(&insn);
        tramp[RET_BREAK_OFFSET] = BREAKPOINT_INSN;

        let mut patch = PatchSet::new();
        patch.stage(slot, tramp.to_vec()).stage(addr, vec![BREAKPOINT_INSN]);
        if let Err(fault) = patch.commit(self.mem.as_ref(), pid) {
            probes.slots.free(slot);
            error!("Arming probe at {addr:#x} in {pid} failed: {fault}");
            return Err(fatal(fault));
        }

        let boost = if can_boost(&insn) { Boost::Unknown } else { Boost::Never };
        let uprobe = Uprobe { insn, slot, boost, kind, nmissed: 0 };
        let is_return = matches!(uprobe.kind, ProbeKind::Return { .. });
        if is_return {
            probes.ret_breaks.insert(uprobe.ret_break(), addr);
        }
        probes.probes.insert(addr, uprobe);
        info!(
            "Armed {} probe at {addr:#x} in {pid} (slot {slot:#x}, {boost:?})",
            if is_return { "return" } else { "entry" }
        );
        Ok(ProbeKey { pid, addr })
    }

    /// Disarm a probe, restoring the original instruction and every return
    /// still pending through its trampoline
    ///
    /// The probe is gone from the table even when an error is returned.
    ///
    /// # Errors
    /// - [`ProbeError::NotRegistered`] for an unknown key
    /// - [`ProbeError::Fatal`] if a restore faulted
    pub fn unregister(&self, key: ProbeKey) -> Result<(), ProbeError> {
        let proc = self.process(key.pid).ok_or(ProbeError::NotAttached(key.pid))?;
        let mut probes = proc.lock();
        self.disarm(&mut probes, key)
    }

    fn disarm(&self, probes: &mut ProcessProbes, key: ProbeKey) -> Result<(), ProbeError> {
        let ProbeKey { pid, addr } = key;
        let uprobe = probes.probes.remove(&addr).ok_or(ProbeError::NotRegistered { pid, addr })?;
        let tramp = uprobe.ret_break();
        let mut result = Ok(());

        let (mine, rest): (Vec<_>, Vec<_>) =
            probes.pending.drain(..).partition(|p| p.ri.probe == addr);
        probes.pending = rest;
        let mut restored = 0;
        for pending in &mine {
            match disarm_instance(self.mem.as_ref(), pid, &pending.ri, tramp) {
                Ok(DisarmOutcome::Restored) => restored += 1,
                Ok(DisarmOutcome::NotFound) => {}
                Err(e) => {
                    warn!("{e}");
                    result = Err(e.into());
                }
            }
        }

        if let Err(fault) = self.mem.write(pid, addr, &uprobe.insn[..1]) {
            warn!("Restoring instruction at {addr:#x} in {pid} failed: {fault}");
            result = Err(FatalProbeError { pid, addr, fault }.into());
        }
        probes.ret_breaks.remove(&tramp);
        probes.slots.free(uprobe.slot);
        info!(
            "Disarmed probe at {addr:#x} in {pid} ({restored}/{} pending returns restored)",
            mine.len()
        );
        result
    }

    /// Handle an `int3` trap of `tid`; `regs.ip` points past the breakpoint
    ///
    /// # Errors
    /// [`ProbeError::Fatal`] if the activation faulted; the probe has been
    /// disarmed and the thread re-executes the original instruction.
    /// [`ProbeError::OrphanReturn`] for a return with no pending instance.
    pub fn handle_breakpoint(
        &self,
        pid: Pid,
        tid: Tid,
        regs: &mut Regs,
    ) -> Result<TrapAction, ProbeError> {
        let Some(proc) = self.process(pid) else {
            return Ok(TrapAction::NotOurs);
        };
        let bp = regs.ip.wrapping_sub(1);
        let hit = {
            let probes = proc.lock();
            if let Some(&func) = probes.ret_breaks.get(&bp) {
                Some(Hit::Return(func))
            } else if probes.probes.contains_key(&bp) {
                Some(Hit::Entry(bp))
            } else {
                None
            }
        };
        let Some(hit) = hit else {
            return Ok(self.stale_trap(pid, tid, regs, bp));
        };

        let result = match hit {
            Hit::Entry(addr) => self.entry_hit(&proc, pid, tid, regs, addr),
            Hit::Return(func) => self.return_hit(&proc, pid, tid, regs, func),
        };
        if let Err(ProbeError::Fatal(e)) = &result {
            bump(&self.counters.faults);
            error!("{e}; disarming probe");
            let mut probes = proc.lock();
            if let Err(e) = self.disarm(&mut probes, ProbeKey { pid, addr: e.addr }) {
                debug!("Disarm after fault: {e}");
            }
        }
        result
    }

    /// A trap with no probe at `bp`: if the `int3` is gone the probe was
    /// removed while the thread was trapping on it, so it re-executes the
    /// restored instruction
    fn stale_trap(&self, pid: Pid, tid: Tid, regs: &mut Regs, bp: u64) -> TrapAction {
        match self.mem.read(pid, bp, 1) {
            Ok(byte) if byte.first().is_some_and(|&b| b != BREAKPOINT_INSN) => {
                debug!("{tid}: trap at {bp:#x} from a removed probe, rewinding");
                regs.ip = bp;
                TrapAction::Resume
            }
            _ => TrapAction::NotOurs,
        }
    }

    fn entry_hit(
        &self,
        proc: &Mutex<ProcessProbes>,
        pid: Pid,
        tid: Tid,
        regs: &mut Regs,
        addr: u64,
    ) -> Result<TrapAction, ProbeError> {
        bump(&self.counters.hits);
        regs.ip = addr;

        let (kind, tramp) = {
            let probes = proc.lock();
            match probes.probes.get(&addr) {
                Some(p) => (p.kind.clone(), p.ret_break()),
                None => return Ok(TrapAction::Resume),
            }
        };

        match kind {
            ProbeKind::Entry(None) => self.start_step(proc, tid, regs, addr, None),
            ProbeKind::Entry(Some(handler)) => {
                let args = regs.read_args(self.mem.as_ref(), pid);
                let mut ctx = TrapContext { pid, tid, regs: &mut *regs, mem: self.mem.as_ref() };
                let target = handler.pre_entry(&mut ctx);
                match args {
                    Ok(args) => handler.entry(&mut ctx, &args),
                    Err(fault) => warn!("{tid} at {addr:#x}: arguments unreadable: {fault}"),
                }
                self.start_step(proc, tid, regs, addr, target)
            }
            ProbeKind::Return { handler, data_size, maxactive } => {
                {
                    let mut probes = proc.lock();
                    let active = probes.pending.iter().filter(|p| p.ri.probe == addr).count();
                    if active >= maxactive {
                        if let Some(p) = probes.probes.get_mut(&addr) {
                            p.nmissed += 1;
                        }
                        bump(&self.counters.missed);
                        drop(probes);
                        return self.start_step(proc, tid, regs, addr, None);
                    }
                }

                let mut ri =
                    prepare_instance(self.mem.as_ref(), pid, tid, regs, addr, tramp, data_size)?;
                let mut view = ReturnInstance {
                    func: addr,
                    orig_ret: ri.orig_ret,
                    stack_slot: ri.stack_slot,
                    redirected_to: None,
                    data: &mut ri.data,
                };
                let mut ctx = TrapContext { pid, tid, regs: &mut *regs, mem: self.mem.as_ref() };
                let outcome = handler.entry(&mut ctx, &mut view);

                match outcome {
                    EntryOutcome::Continue => {
                        proc.lock().pending.push(PendingReturn { ri, silent: false });
                        self.start_step(proc, tid, regs, addr, None)
                    }
                    EntryOutcome::Redirected => {
                        ri.redirected_to = Some(regs.ip);
                        debug!("{tid} redirected from {addr:#x} to {:#x}", regs.ip);
                        proc.lock().pending.push(PendingReturn { ri, silent: false });
                        Ok(TrapAction::Redirected)
                    }
                    EntryOutcome::Skip => {
                        if let Err(e) = disarm_instance(self.mem.as_ref(), pid, &ri, tramp) {
                            warn!("{e}; keeping the return silent");
                            proc.lock().pending.push(PendingReturn { ri, silent: true });
                        }
                        self.start_step(proc, tid, regs, addr, None)
                    }
                }
            }
        }
    }

    fn start_step(
        &self,
        proc: &Mutex<ProcessProbes>,
        tid: Tid,
        regs: &mut Regs,
        addr: u64,
        target: Option<u64>,
    ) -> Result<TrapAction, ProbeError> {
        let mut probes = proc.lock();
        let Some(uprobe) = probes.probes.get(&addr) else {
            // Disarmed meanwhile: the original instruction is back
            regs.ip = addr;
            return Ok(TrapAction::Resume);
        };

        if target.is_none() && uprobe.boost == Boost::Boosted {
            regs.ip = uprobe.slot;
            bump(&self.counters.boosted);
            return Ok(TrapAction::Boosted);
        }

        let cb = ControlBlock {
            probe: addr,
            copy: target.unwrap_or(uprobe.slot),
            insn: uprobe.insn,
            saved_flags: regs.flags & TF_MASK,
            redirected: target.is_some(),
        };
        regs.ip = cb.copy;
        regs.flags |= TF_MASK;
        probes.control.insert(tid, cb);
        bump(&self.counters.single_steps);
        Ok(TrapAction::SingleStep)
    }

    fn return_hit(
        &self,
        proc: &Mutex<ProcessProbes>,
        pid: Pid,
        tid: Tid,
        regs: &mut Regs,
        func: u64,
    ) -> Result<TrapAction, ProbeError> {
        bump(&self.counters.return_hits);

        let (pending, handler) = {
            let mut probes = proc.lock();
            // `ret` popped the hijacked slot
            let popped = regs.sp.wrapping_sub(crate::memory::WORD_SIZE as u64);
            let matches = |p: &PendingReturn| p.ri.tid == tid && p.ri.probe == func;
            let idx = probes
                .pending
                .iter()
                .rposition(|p| matches(p) && p.ri.stack_slot == popped)
                .or_else(|| probes.pending.iter().rposition(matches))
                .ok_or(ProbeError::OrphanReturn { tid, addr: func })?;
            let pending = probes.pending.remove(idx);

            // Frames below the returning one were unwound without returning
            let before = probes.pending.len();
            probes
                .pending
                .retain(|p| p.ri.tid != tid || p.ri.stack_slot >= pending.ri.stack_slot);
            let stale = before - probes.pending.len();
            if stale > 0 {
                debug!("{tid}: dropped {stale} abandoned return instances");
            }

            let handler = match probes.probes.get(&func).map(|p| &p.kind) {
                Some(ProbeKind::Return { handler, .. }) => Some(Arc::clone(handler)),
                _ => None,
            };
            (pending, handler)
        };

        let PendingReturn { mut ri, silent } = pending;
        let outcome = match handler.filter(|_| !silent) {
            Some(handler) => {
                let mut info = ReturnInstance {
                    func,
                    orig_ret: ri.orig_ret,
                    stack_slot: ri.stack_slot,
                    redirected_to: ri.redirected_to,
                    data: &mut ri.data,
                };
                let mut ctx = TrapContext { pid, tid, regs: &mut *regs, mem: self.mem.as_ref() };
                handler.ret(&mut ctx, &mut info)
            }
            None => ReturnOutcome::Resume,
        };

        match outcome {
            ReturnOutcome::Resume => regs.ip = ri.orig_ret,
            ReturnOutcome::Restored => {
                self.mem
                    .write_word(pid, ri.stack_slot, ri.orig_ret)
                    .map_err(|fault| FatalProbeError { pid, addr: func, fault })?;
            }
        }
        Ok(TrapAction::Resume)
    }

    /// Handle the debug trap ending a single-step of `tid`
    ///
    /// # Errors
    /// - [`ProbeError::NoSingleStep`] if `tid` was not stepping a probe
    /// - [`ProbeError::Fatal`] if the stack fixup faulted
    pub fn handle_single_step(
        &self,
        pid: Pid,
        tid: Tid,
        regs: &mut Regs,
    ) -> Result<TrapAction, ProbeError> {
        let proc = self.process(pid).ok_or(ProbeError::NotAttached(pid))?;
        let mut probes = proc.lock();
        let cb = probes.control.remove(&tid).ok_or(ProbeError::NoSingleStep(tid))?;
        regs.flags = (regs.flags & !TF_MASK) | cb.saved_flags;
        if cb.redirected {
            return Ok(TrapAction::Resume);
        }

        // A probe disarmed during the step must not get a jump planted
        let mut boost = probes.probes.get(&cb.probe).map_or(Boost::Never, |p| p.boost);
        post_single_step(
            self.mem.as_ref(),
            pid,
            regs,
            &cb.insn,
            cb.copy,
            cb.probe,
            cb.saved_flags,
            &mut boost,
        )
        .map_err(|fault| FatalProbeError { pid, addr: cb.probe, fault })?;

        if let Some(p) = probes.probes.get_mut(&cb.probe) {
            if p.boost != boost {
                debug!("Probe at {:#x} in {pid}: {:?} -> {boost:?}", cb.probe, p.boost);
                p.boost = boost;
            }
        }
        Ok(TrapAction::Resume)
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let c = &self.counters;
        EngineStats {
            hits: c.hits.load(Ordering::Relaxed),
            single_steps: c.single_steps.load(Ordering::Relaxed),
            boosted: c.boosted.load(Ordering::Relaxed),
            return_hits: c.return_hits.load(Ordering::Relaxed),
            missed: c.missed.load(Ordering::Relaxed),
            faults: c.faults.load(Ordering::Relaxed),
        }
    }

    /// Return-probe hits dropped for this probe because of `maxactive`
    #[must_use]
    pub fn nmissed(&self, key: ProbeKey) -> Option<u64> {
        let proc = self.process(key.pid)?;
        let probes = proc.lock();
        probes.probes.get(&key.addr).map(|p| p.nmissed)
    }

    #[must_use]
    pub fn boost_state(&self, key: ProbeKey) -> Option<Boost> {
        let proc = self.process(key.pid)?;
        let probes = proc.lock();
        probes.probes.get(&key.addr).map(|p| p.boost)
    }

    /// Trampoline slot of a registered probe
    #[must_use]
    pub fn slot_of(&self, key: ProbeKey) -> Option<u64> {
        let proc = self.process(key.pid)?;
        let probes = proc.lock();
        probes.probes.get(&key.addr).map(|p| p.slot)
    }

    #[must_use]
    pub fn pending_returns(&self, pid: Pid) -> usize {
        self.process(pid).map_or(0, |proc| proc.lock().pending.len())
    }

    /// Whether `tid` is single-stepping a copied instruction
    #[must_use]
    pub fn in_single_step(&self, pid: Pid, tid: Tid) -> bool {
        self.process(pid).is_some_and(|proc| proc.lock().control.contains_key(&tid))
    }

    #[must_use]
    pub fn probe_count(&self, pid: Pid) -> usize {
        self.process(pid).map_or(0, |proc| proc.lock().probes.len())
    }
}

/// Move a thread that single-stepped the copy at `copy` back to `orig`
///
/// Applies the instruction-class fixup to the return address on the stack
/// and to `regs.ip`, and settles `boost`: when the copy ends with room for
/// a jump, one back to the original code is planted after it.
///
/// # Errors
/// Returns a [`Fault`] if the stack fixup cannot be applied. A failed jump
/// write only marks the probe [`Boost::Never`].
#[allow(clippy::too_many_arguments)]
pub fn post_single_step(
    mem: &dyn ProcessMemory,
    pid: Pid,
    regs: &mut Regs,
    insn: &[u8],
    copy: u64,
    orig: u64,
    saved_flags: u64,
    boost: &mut Boost,
) -> Result<(), Fault> {
    let relocate_tos = |regs: &Regs| -> Result<(), Fault> {
        let tos = mem.read_word(pid, regs.sp)?;
        mem.write_word(pid, regs.sp, orig.wrapping_add(tos.wrapping_sub(copy)))
    };

    match Fixup::classify(insn) {
        Fixup::PushFlags => {
            let tos = mem.read_word(pid, regs.sp)?;
            mem.write_word(pid, regs.sp, (tos & !TF_MASK) | saved_flags)?;
        }
        Fixup::IpAbsolute | Fixup::JmpIndirect => {
            *boost = Boost::Boosted;
            return Ok(());
        }
        Fixup::CallRelative => relocate_tos(regs)?,
        Fixup::CallAbsolute | Fixup::CallIndirect => {
            relocate_tos(regs)?;
            return Ok(());
        }
        Fixup::Default => {}
    }

    if *boost == Boost::Unknown {
        let len = regs.ip.wrapping_sub(copy);
        if regs.ip > copy && len + (RELATIVE_JUMP_SIZE as u64) < MAX_INSN_SIZE as u64 {
            let jump = jmp_op(regs.ip, orig.wrapping_add(len));
            match mem.write(pid, regs.ip, &jump) {
                Ok(()) => *boost = Boost::Boosted,
                Err(fault) => {
                    warn!("Planting boost jump failed: {fault}");
                    *boost = Boost::Never;
                }
            }
        } else {
            *boost = Boost::Never;
        }
    }

    regs.ip = orig.wrapping_add(regs.ip.wrapping_sub(copy));
    Ok(())
}
