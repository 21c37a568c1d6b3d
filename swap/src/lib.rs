//! # swap - Dynamic Instrumentation of Running Processes
//!
//! swap places probes into a running process without restarting it: it
//! copies probed instructions into trampolines, redirects function returns
//! through a breakpoint, gets the target's own dynamic linker to load
//! handler libraries, and streams what the probes observe through a
//! sub-buffered trace device.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Monitored Process                          │
//! │     int3 at probed addresses, trampolines in a slot area        │
//! └──────────┬──────────────────────────────────┬───────────────────┘
//!            │ SIGTRAP (ptrace)                 │ do_mmap return
//!            ▼                                  ▼
//! ┌──────────────────────┐          ┌───────────────────────────────┐
//! │  tracer → uprobes    │          │  eBPF kretprobe (swap-ebpf)   │
//! │  trampoline engine   │          │  MmapEvent ring buffer        │
//! └──────────┬───────────┘          └───────────────┬───────────────┘
//!            │ entry / return handlers              │ mappings
//!            ▼                                      ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │   loader (dlopen redirection)        wsp (web page tracking)    │
//! └──────────────────────────────┬──────────────────────────────────┘
//!                                │ framed records
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  device: sub-buffer pool, coalesced wake-ups, read/splice/ioctl │
//! └──────────────────────────────┬──────────────────────────────────┘
//!                                ▼
//!                     record decode → JSON lines
//! ```
//!
//! ## Module Structure
//!
//! - [`uprobes`]: trampoline engine for entry and return probes (i386 ABI)
//!   - `insn`: boostability and fixup classification
//!   - `engine`: registration, breakpoint and single-step handling
//!   - `uretprobe`: return address hijack and disarm
//!
//! - [`loader`]: loads handler libraries into monitored processes by
//!   redirecting a probed call into the target's `dlopen`
//!   - `control`: ignore list of binaries
//!   - `pd`: per-process and per-handler descriptors
//!   - `redirect`: the redirection state machine
//!
//! - [`device`]: the trace device a single reader drains
//! - [`wsp`]: WebKit resource load tracking on top of entry probes
//! - [`record`]: trace record framing, decoding and JSON export
//! - [`memory`]: cross-process memory access and VMA lookup
//! - [`mmap_watch`]: eBPF mapping interception feeding the loader
//! - [`tracer`]: ptrace trap delivery for live targets
//! - [`domain`]: identity types (Pid, Tid, Dentry) and errors
//! - [`cli`], [`preflight`]: the `swap` binary's front end
//!
//! ## Typical Usage
//!
//! ```bash
//! # Load a handler into a running process and record the trace
//! sudo swap watch --pid <PID> --linker /lib/ld-linux.so.2 \
//!     --dlopen-offset 0x1c40 --r-debug-offset 0x21a0c \
//!     --hook 0x08049a10 --data-area 0x0804c000 --slot-area 0x0804d000 \
//!     --handler /usr/lib/libprobe.so --output trace.bin
//!
//! # Decode it
//! swap decode trace.bin
//! ```

pub mod cli;
pub mod device;
pub mod domain;
pub mod loader;
pub mod memory;
pub mod mmap_watch;
pub mod preflight;
pub mod record;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod tracer;
pub mod uprobes;
pub mod wsp;
