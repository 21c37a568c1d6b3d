//! `/proc/<pid>/mem` backend
//!
//! Positional reads and writes on the tracee's memory file. Requires the
//! caller to be allowed to ptrace the target (root, or same uid with a
//! permissive `ptrace_scope`).

use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use super::ProcessMemory;
use crate::domain::{Fault, Pid};

/// Live-process memory access with one cached handle per process
#[derive(Default)]
pub struct ProcMem {
    handles: Mutex<HashMap<Pid, Arc<File>>>,
}

impl ProcMem {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the cached handle of an exited or detached process
    pub fn forget(&self, pid: Pid) {
        self.handles.lock().remove(&pid);
    }

    fn handle(&self, pid: Pid) -> Option<Arc<File>> {
        let mut handles = self.handles.lock();
        if let Some(file) = handles.get(&pid) {
            return Some(Arc::clone(file));
        }
        let path = format!("/proc/{}/mem", pid.0);
        match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => {
                let file = Arc::new(file);
                handles.insert(pid, Arc::clone(&file));
                Some(file)
            }
            Err(e) => {
                debug!("Failed to open {path}: {e}");
                None
            }
        }
    }
}

impl ProcessMemory for ProcMem {
    fn read(&self, pid: Pid, addr: u64, len: usize) -> Result<Vec<u8>, Fault> {
        let file = self.handle(pid).ok_or_else(|| Fault::read(pid, addr, len))?;
        let mut buf = vec![0u8; len];
        file.read_exact_at(&mut buf, addr).map_err(|e| {
            debug!("read {len}@{addr:#x} in {pid}: {e}");
            Fault::read(pid, addr, len)
        })?;
        Ok(buf)
    }

    fn write(&self, pid: Pid, addr: u64, bytes: &[u8]) -> Result<(), Fault> {
        let file = self.handle(pid).ok_or_else(|| Fault::write(pid, addr, bytes.len()))?;
        file.write_all_at(bytes, addr).map_err(|e| {
            debug!("write {}@{addr:#x} in {pid}: {e}", bytes.len());
            Fault::write(pid, addr, bytes.len())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::cast_possible_truncation)]
    fn test_read_own_memory() {
        let marker: [u8; 8] = *b"SWAPMARK";
        let addr = std::ptr::addr_of!(marker) as u64;
        let mem = ProcMem::new();

        // Reading our own /proc/self/mem is allowed without privileges
        if let Ok(bytes) = mem.read(Pid(std::process::id()), addr, marker.len()) {
            assert_eq!(bytes, marker);
        }
    }

    #[test]
    fn test_missing_process_faults() {
        let mem = ProcMem::new();
        let err = mem.read(Pid(999_999_999), 0x1000, 4).unwrap_err();
        assert_eq!(err, Fault::read(Pid(999_999_999), 0x1000, 4));
    }
}
