//! Trap delivery for live processes
//!
//! The engine patches `int3` into the target; something has to catch the
//! resulting `SIGTRAP`s and hand them over. [`Tracer`] seizes every thread
//! of the target with ptrace (new threads are picked up through
//! `PTRACE_O_TRACECLONE`), turns each trap stop into a
//! [`ProbeEngine::handle_breakpoint`] or [`ProbeEngine::handle_single_step`]
//! call and writes the resulting registers back.
//!
//! ptrace requests must come from the thread that seized the tracee, so a
//! `Tracer` lives on one dedicated thread for its whole life.
//!
//! Host support: x86-64, tracing i386 (or x86-64) targets.

#![allow(unsafe_code)] // ptrace and waitpid require unsafe

use log::{debug, info, warn};
use std::collections::HashSet;
use std::io;
use std::sync::Arc;

use crate::domain::{Pid, ProbeError, Tid};
use crate::uprobes::{ProbeEngine, Regs, TrapAction};

/// `si_code` of a trap raised by `int3`
const SI_KERNEL: i32 = 0x80;
const TF_MASK: u64 = 0x100;
/// Stops waited for per thread while releasing it
const MAX_RELEASE_STOPS: usize = 8;

/// Called with the id of every traced thread that exits
pub type ExitHook = Box<dyn FnMut(Tid) + Send>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TracerStats {
    pub breakpoints: u64,
    pub single_steps: u64,
    /// Traps no probe claimed, re-delivered to the target
    pub foreign: u64,
    pub threads_seen: u64,
}

pub struct Tracer {
    pid: Pid,
    threads: HashSet<Tid>,
    engine: Arc<ProbeEngine>,
    stats: TracerStats,
    on_exit: Option<ExitHook>,
}

fn check(ret: libc::c_long) -> io::Result<libc::c_long> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

#[allow(clippy::cast_possible_wrap)]
fn ptrace(request: libc::c_uint, tid: Tid, addr: usize, data: usize) -> io::Result<libc::c_long> {
    // SAFETY: every caller passes either plain integers or pointers to
    // live, correctly sized structures for `request`
    check(unsafe {
        libc::ptrace(request, tid.0 as libc::pid_t, addr as *mut libc::c_void, data as *mut libc::c_void)
    })
}

fn regs_from(raw: &libc::user_regs_struct) -> Regs {
    Regs {
        ip: raw.rip,
        sp: raw.rsp,
        bp: raw.rbp,
        ax: raw.rax,
        bx: raw.rbx,
        cx: raw.rcx,
        dx: raw.rdx,
        si: raw.rsi,
        di: raw.rdi,
        flags: raw.eflags,
    }
}

fn regs_into(regs: &Regs, raw: &mut libc::user_regs_struct) {
    raw.rip = regs.ip;
    raw.rsp = regs.sp;
    raw.rbp = regs.bp;
    raw.rax = regs.ax;
    raw.rbx = regs.bx;
    raw.rcx = regs.cx;
    raw.rdx = regs.dx;
    raw.rsi = regs.si;
    raw.rdi = regs.di;
    raw.eflags = regs.flags;
}

/// Run one trap stop through the engine; returns the signal to deliver
///
/// `from_int3` tells a breakpoint from a single-step trap. A step trap the
/// engine has no record of gets its trap flag cleared.
fn dispatch_trap(engine: &ProbeEngine, pid: Pid, tid: Tid, regs: &mut Regs, from_int3: bool) -> libc::c_int {
    let result = if from_int3 {
        engine.handle_breakpoint(pid, tid, regs)
    } else {
        engine.handle_single_step(pid, tid, regs)
    };
    match result {
        Ok(TrapAction::NotOurs) => libc::SIGTRAP,
        Ok(_) => 0,
        Err(ProbeError::NoSingleStep(_)) => {
            // Probe removed while the thread was stepping
            warn!("{tid}: single step with no pending probe at {:#x}", regs.ip);
            regs.flags &= !TF_MASK;
            0
        }
        Err(e) => {
            warn!("{tid}: {e}");
            0
        }
    }
}

/// Threads of `pid` as listed in `/proc/<pid>/task`
fn list_threads(pid: Pid) -> io::Result<Vec<Tid>> {
    let mut tids = Vec::new();
    for entry in std::fs::read_dir(format!("/proc/{}/task", pid.0))? {
        if let Some(tid) = entry?.file_name().to_str().and_then(|s| s.parse().ok()) {
            tids.push(Tid(tid));
        }
    }
    Ok(tids)
}

impl Tracer {
    /// Seize every thread of `pid`
    ///
    /// # Errors
    /// Returns the error of the first thread that could not be seized;
    /// threads seized before it are released again
    pub fn seize(pid: Pid, engine: Arc<ProbeEngine>) -> io::Result<Self> {
        let mut tracer = Self {
            pid,
            threads: HashSet::new(),
            engine,
            stats: TracerStats::default(),
            on_exit: None,
        };
        for tid in list_threads(pid)? {
            let options = libc::PTRACE_O_TRACECLONE as usize;
            if let Err(e) = ptrace(libc::PTRACE_SEIZE, tid, 0, options) {
                // Threads may exit between listing and seizing
                if e.raw_os_error() == Some(libc::ESRCH) {
                    continue;
                }
                tracer.detach();
                return Err(e);
            }
            tracer.threads.insert(tid);
            tracer.stats.threads_seen += 1;
        }
        info!("Seized {} threads of {pid}", tracer.threads.len());
        Ok(tracer)
    }

    /// Call `hook` for every thread that exits from now on
    #[must_use]
    pub fn with_exit_hook(mut self, hook: ExitHook) -> Self {
        self.on_exit = Some(hook);
        self
    }

    #[must_use]
    pub fn stats(&self) -> TracerStats {
        self.stats
    }

    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Handle every stop that is already pending; returns how many
    ///
    /// Returns 0 once every thread has exited.
    ///
    /// # Errors
    /// Returns an error if a ptrace request on a live thread fails
    pub fn pump(&mut self) -> io::Result<usize> {
        let mut handled = 0;
        while !self.threads.is_empty() {
            let mut status = 0;
            // SAFETY: status is a valid out-pointer
            let ret = unsafe { libc::waitpid(-1, &mut status, libc::__WALL | libc::WNOHANG) };
            if ret == 0 {
                break;
            }
            if ret == -1 {
                let e = io::Error::last_os_error();
                if e.raw_os_error() == Some(libc::ECHILD) {
                    self.threads.clear();
                    break;
                }
                return Err(e);
            }
            #[allow(clippy::cast_sign_loss)]
            let tid = Tid(ret as u32);
            handled += 1;

            if libc::WIFEXITED(status) || libc::WIFSIGNALED(status) {
                debug!("{tid} exited");
                self.thread_gone(tid);
                continue;
            }
            if !libc::WIFSTOPPED(status) {
                continue;
            }
            if let Err(e) = self.on_stop(tid, status) {
                // The thread may have been killed while stopped
                if e.raw_os_error() == Some(libc::ESRCH) {
                    self.thread_gone(tid);
                    continue;
                }
                return Err(e);
            }
        }
        Ok(handled)
    }

    fn thread_gone(&mut self, tid: Tid) {
        if self.threads.remove(&tid) {
            if let Some(hook) = self.on_exit.as_mut() {
                hook(tid);
            }
        }
    }

    fn on_stop(&mut self, tid: Tid, status: libc::c_int) -> io::Result<()> {
        let sig = libc::WSTOPSIG(status);
        let event = status >> 16;

        if event == libc::PTRACE_EVENT_CLONE {
            let mut new_tid: libc::c_ulong = 0;
            ptrace(libc::PTRACE_GETEVENTMSG, tid, 0, std::ptr::addr_of_mut!(new_tid) as usize)?;
            #[allow(clippy::cast_possible_truncation)]
            let new_tid = Tid(new_tid as u32);
            if self.threads.insert(new_tid) {
                self.stats.threads_seen += 1;
                debug!("{tid} cloned {new_tid}");
            }
            return self.resume(tid, 0);
        }
        if event != 0 {
            // PTRACE_EVENT_STOP and friends carry no signal to deliver
            return self.resume(tid, 0);
        }
        if sig != libc::SIGTRAP {
            return self.resume(tid, sig);
        }

        let deliver = self.settle_trap(tid)?;
        self.resume(tid, deliver)
    }

    /// Hand the trap `tid` is stopped in to the engine and write the
    /// registers back; returns the signal to deliver
    fn settle_trap(&mut self, tid: Tid) -> io::Result<libc::c_int> {
        // SAFETY: zeroed siginfo_t is a valid out-buffer
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        ptrace(libc::PTRACE_GETSIGINFO, tid, 0, std::ptr::addr_of_mut!(info) as usize)?;
        // SAFETY: zeroed user_regs_struct is a valid out-buffer
        let mut raw: libc::user_regs_struct = unsafe { std::mem::zeroed() };
        ptrace(libc::PTRACE_GETREGS, tid, 0, std::ptr::addr_of_mut!(raw) as usize)?;
        let mut regs = regs_from(&raw);

        let from_int3 = info.si_code == SI_KERNEL;
        if from_int3 {
            self.stats.breakpoints += 1;
        } else {
            self.stats.single_steps += 1;
        }
        let deliver = dispatch_trap(&self.engine, self.pid, tid, &mut regs, from_int3);
        if deliver == libc::SIGTRAP {
            self.stats.foreign += 1;
        }
        regs_into(&regs, &mut raw);
        ptrace(libc::PTRACE_SETREGS, tid, 0, std::ptr::addr_of!(raw) as usize)?;
        Ok(deliver)
    }

    #[allow(clippy::cast_sign_loss)]
    fn resume(&self, tid: Tid, sig: libc::c_int) -> io::Result<()> {
        ptrace(libc::PTRACE_CONT, tid, 0, sig as usize).map(|_| ())
    }

    /// Stop and release every thread
    ///
    /// Probes should be unregistered first; a released thread that hits a
    /// leftover `int3` gets a fatal `SIGTRAP`. Traps that were already
    /// pending are settled through the engine before letting go, and a
    /// thread in the middle of a single step is stepped to completion.
    pub fn detach(&mut self) {
        for tid in std::mem::take(&mut self.threads) {
            if let Err(e) = self.release(tid) {
                debug!("Detaching {tid}: {e}");
            }
        }
        debug!("Released {}", self.pid);
    }

    #[allow(clippy::cast_sign_loss)]
    fn release(&mut self, tid: Tid) -> io::Result<()> {
        ptrace(libc::PTRACE_INTERRUPT, tid, 0, 0)?;
        let mut deliver = 0;
        for _ in 0..MAX_RELEASE_STOPS {
            let mut status = 0;
            // SAFETY: status is a valid out-pointer
            #[allow(clippy::cast_possible_wrap)]
            let ret = unsafe { libc::waitpid(tid.0 as libc::pid_t, &mut status, libc::__WALL) };
            if ret == -1 {
                return Err(io::Error::last_os_error());
            }
            if libc::WIFEXITED(status) || libc::WIFSIGNALED(status) {
                return Ok(());
            }
            if !libc::WIFSTOPPED(status) {
                continue;
            }
            let sig = libc::WSTOPSIG(status);
            if status >> 16 == 0 {
                deliver = if sig == libc::SIGTRAP { self.settle_trap(tid)? } else { sig };
            }
            if !self.engine.in_single_step(self.pid, tid) {
                break;
            }
            // TF is set and the copy has not run yet
            self.resume(tid, 0)?;
        }
        ptrace(libc::PTRACE_DETACH, tid, 0, deliver as usize).map(|_| ())
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.detach();
        }
    }
}
