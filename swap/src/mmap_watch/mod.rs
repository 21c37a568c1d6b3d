//! # Mapping interception through eBPF
//!
//! A `do_mmap` return probe (the `swap-ebpf` crate) reports every mapping a
//! monitored process creates. Userspace resolves the returned address
//! against `/proc/<pid>/maps` and hands the [`Mapping`] to
//! [`Loader::on_mmap`](crate::loader::Loader::on_mmap).
//!
//! ## Functions
//!
//! - [`load_mmap_watcher()`] - Load the compiled eBPF object from disk
//! - [`attach_mmap_probe()`] - Attach the kretprobe to `do_mmap`
//! - [`monitor_pid()`] - Add a TGID to `MONITORED_PIDS`
//! - [`parse_mmap_event()`] / [`resolve_mmap_event()`] - Ring buffer item to mapping
//!
//! Build the object with `cargo xtask build-ebpf`.

use anyhow::{Context, Result};
use aya::{
    maps::{HashMap, MapData, RingBuf},
    programs::KProbe,
    Ebpf,
};
use aya_log::EbpfLogger;
use log::{debug, info, warn};
use std::path::Path;
use swap_common::MmapEvent;

use crate::domain::Pid;
use crate::memory::{Mapping, VmaLookup};

/// Where `cargo xtask build-ebpf` leaves the object
pub const DEFAULT_OBJECT_PATH: &str = "target/bpfel-unknown-none/release/swap";

/// Kernel function the return probe sits on
pub const MMAP_FUNCTION: &str = "do_mmap";

/// Load the eBPF object
///
/// # Errors
/// Returns an error if the file is missing or the kernel rejects it
pub fn load_mmap_watcher(object_path: &Path) -> Result<Ebpf> {
    let bpf = Ebpf::load_file(object_path).with_context(|| {
        format!(
            "Failed to load eBPF object {} (run `cargo xtask build-ebpf` first)",
            object_path.display()
        )
    })?;
    Ok(bpf)
}

/// Initialize eBPF logger
pub fn init_ebpf_logger(bpf: &mut Ebpf) {
    if let Err(e) = EbpfLogger::init(bpf) {
        warn!("Failed to initialize eBPF logger: {e}");
    }
}

/// Attach the `do_mmap` return probe
///
/// # Errors
/// Returns an error if the program is missing or cannot be attached
pub fn attach_mmap_probe(bpf: &mut Ebpf) -> Result<()> {
    let program: &mut KProbe = bpf
        .program_mut("do_mmap_ret")
        .context("do_mmap_ret program not found")?
        .try_into()?;
    program.load()?;
    program.attach(MMAP_FUNCTION, 0).with_context(|| format!("Failed to attach to {MMAP_FUNCTION}"))?;
    info!("Attached kretprobe: {MMAP_FUNCTION}");
    Ok(())
}

/// Report mappings of `pid` from now on
///
/// # Errors
/// Returns an error if the `MONITORED_PIDS` map is missing or full
pub fn monitor_pid(bpf: &mut Ebpf, pid: Pid) -> Result<()> {
    let mut map: HashMap<_, u32, u8> = HashMap::try_from(
        bpf.map_mut("MONITORED_PIDS").context("MONITORED_PIDS map not found")?,
    )?;
    map.insert(pid.0, 1, 0)?;
    info!("Watching mappings of {pid}");
    Ok(())
}

/// Take the event ring buffer out of the loaded object
///
/// # Errors
/// Returns an error if the `EVENTS` map is missing
pub fn take_events(bpf: &mut Ebpf) -> Result<RingBuf<MapData>> {
    Ok(RingBuf::try_from(bpf.take_map("EVENTS").context("EVENTS map not found")?)?)
}

/// Decode one ring buffer item
#[must_use]
pub fn parse_mmap_event(bytes: &[u8]) -> Option<MmapEvent> {
    if bytes.len() < std::mem::size_of::<MmapEvent>() {
        warn!("Received incomplete mmap event ({} bytes)", bytes.len());
        return None;
    }
    // SAFETY: length checked above and the eBPF side writes a MmapEvent
    #[allow(unsafe_code)]
    let event = unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<MmapEvent>()) };
    Some(event)
}

/// Find the file mapping an event refers to
///
/// Anonymous mappings and mappings that vanished before the lookup yield
/// `None`.
#[must_use]
pub fn resolve_mmap_event(vma: &dyn VmaLookup, event: &MmapEvent) -> Option<Mapping> {
    let pid = Pid(event.pid);
    let Some(mapping) = vma.mapping_at(pid, event.addr) else {
        debug!("{pid}: mapping at {:#x} already gone", event.addr);
        return None;
    };
    mapping.dentry.is_some().then_some(mapping)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Dentry;
    use crate::memory::MapsSnapshot;
    use std::path::PathBuf;

    fn raw(event: &MmapEvent) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&event.pid.to_le_bytes());
        out.extend_from_slice(&event.tid.to_le_bytes());
        out.extend_from_slice(&event.addr.to_le_bytes());
        out.extend_from_slice(&event.timestamp_ns.to_le_bytes());
        out
    }

    #[test]
    fn test_parse_mmap_event() {
        let event = MmapEvent { pid: 42, tid: 43, addr: 0xb770_0000, timestamp_ns: 99 };
        assert_eq!(parse_mmap_event(&raw(&event)), Some(event));
        assert_eq!(parse_mmap_event(&raw(&event)[..12]), None);
    }

    #[test]
    fn test_resolve_skips_anonymous_mappings() {
        let vma = MapsSnapshot::new();
        let file = Mapping {
            start: 0xb770_0000,
            end: 0xb772_0000,
            perms: "r-xp".into(),
            offset: 0,
            dentry: Some(Dentry { dev: 0x801, ino: 262_150 }),
            path: Some(PathBuf::from("/lib/ld-linux.so.2")),
        };
        vma.insert(Pid(42), file.clone());
        vma.insert(
            Pid(42),
            Mapping { start: 0xb780_0000, end: 0xb780_1000, perms: "rw-p".into(), offset: 0, dentry: None, path: None },
        );

        let at = |addr| MmapEvent { pid: 42, tid: 42, addr, timestamp_ns: 0 };
        assert_eq!(resolve_mmap_event(&vma, &at(0xb770_0000)), Some(file));
        assert_eq!(resolve_mmap_event(&vma, &at(0xb780_0000)), None);
        assert_eq!(resolve_mmap_event(&vma, &at(0x1000)), None);
    }
}
