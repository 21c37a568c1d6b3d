//! # eBPF mmap watcher
//!
//! Return probe on the kernel's memory-mapping primitive. For every mapping
//! created by a monitored process the start address is published to
//! userspace, which resolves it against `/proc/<pid>/maps` and feeds the
//! loader's mmap interception.
//!
//! ## Programs
//!
//! - **Kretprobe**: `do_mmap_ret` - fires when `do_mmap()` returns
//!
//! ## Maps (Shared with Userspace)
//!
//! - `EVENTS` - Ring buffer (256KB) of [`MmapEvent`]
//! - `MONITORED_PIDS` - TGIDs selected for instrumentation
//!
//! ## Build
//!
//! ```bash
//! cargo run -p xtask -- build-ebpf
//! ```

#![no_std]
#![no_main]
#![allow(unused_unsafe)]

use aya_ebpf::{
    helpers::{bpf_get_current_pid_tgid, bpf_ktime_get_ns},
    macros::{kretprobe, map},
    maps::{HashMap, RingBuf},
    programs::RetProbeContext,
};
use aya_log_ebpf::debug;
use swap_common::{MmapEvent, MAX_MONITORED_PIDS};

/// Highest value `do_mmap` returns for an error (`-MAX_ERRNO`)
const MAX_ERRNO: u64 = 4095;

/// Ring buffer for mapping events
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(256 * 1024, 0);

/// Map: TGID → 1 for every process selected for instrumentation
#[map]
static MONITORED_PIDS: HashMap<u32, u8> = HashMap::with_max_entries(MAX_MONITORED_PIDS, 0);

/// Number of events dropped because the ring buffer was full
#[map]
static DROPPED_EVENTS: HashMap<u32, u64> = HashMap::with_max_entries(1, 0);

/// Hook: return of `do_mmap()`
#[kretprobe]
pub fn do_mmap_ret(ctx: RetProbeContext) -> u32 {
    match try_do_mmap_ret(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_do_mmap_ret(ctx: &RetProbeContext) -> Result<(), i64> {
    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };
    let pid = (pid_tgid >> 32) as u32;
    let tid = pid_tgid as u32;

    if unsafe { MONITORED_PIDS.get(&pid).is_none() } {
        return Ok(());
    }

    let addr: u64 = ctx.ret().ok_or(1i64)?;
    // Errors come back as -errno cast to an address
    if addr > u64::MAX - MAX_ERRNO {
        return Ok(());
    }

    let event = MmapEvent { pid, tid, addr, timestamp_ns: unsafe { bpf_ktime_get_ns() } };

    if EVENTS.output(&event, 0).is_err() {
        debug!(ctx, "mmap event dropped for pid {}", pid);
        unsafe {
            let key = 0u32;
            let current = DROPPED_EVENTS.get(&key).copied().unwrap_or(0);
            let _ = DROPPED_EVENTS.insert(&key, &(current + 1), 0);
        }
        return Err(1);
    }

    Ok(())
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
