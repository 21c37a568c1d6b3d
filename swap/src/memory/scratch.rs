//! In-process image of sparse target address spaces
//!
//! Regions are mapped explicitly per process; any access touching an
//! unmapped byte faults, and writes to read-only regions fault. Used for
//! dry runs of patch sequences and throughout the tests.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use super::ProcessMemory;
use crate::domain::{Fault, Pid};

struct Region {
    bytes: Vec<u8>,
    writable: bool,
}

#[derive(Default)]
pub struct ScratchMemory {
    spaces: RwLock<HashMap<Pid, BTreeMap<u64, Region>>>,
    writes: AtomicU64,
}

impl ScratchMemory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a writable region initialised with `bytes`
    pub fn map(&self, pid: Pid, addr: u64, bytes: &[u8]) {
        self.insert(pid, addr, bytes, true);
    }

    /// Map a zero-filled writable region
    pub fn map_zeroed(&self, pid: Pid, addr: u64, len: usize) {
        self.insert(pid, addr, &vec![0u8; len], true);
    }

    /// Map a region that faults on every write
    pub fn map_read_only(&self, pid: Pid, addr: u64, bytes: &[u8]) {
        self.insert(pid, addr, bytes, false);
    }

    /// Remove the region starting at `addr`
    pub fn unmap(&self, pid: Pid, addr: u64) {
        if let Some(space) = self.spaces.write().get_mut(&pid) {
            space.remove(&addr);
        }
    }

    /// Number of successful write calls so far
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn insert(&self, pid: Pid, addr: u64, bytes: &[u8], writable: bool) {
        self.spaces
            .write()
            .entry(pid)
            .or_default()
            .insert(addr, Region { bytes: bytes.to_vec(), writable });
    }
}

/// Find the region holding `[addr, addr + len)` entirely
fn locate(space: &BTreeMap<u64, Region>, addr: u64, len: usize) -> Option<(u64, &Region)> {
    let (&start, region) = space.range(..=addr).next_back()?;
    let offset = usize::try_from(addr - start).ok()?;
    (offset.checked_add(len)? <= region.bytes.len()).then_some((start, region))
}

impl ProcessMemory for ScratchMemory {
    fn read(&self, pid: Pid, addr: u64, len: usize) -> Result<Vec<u8>, Fault> {
        let spaces = self.spaces.read();
        let (start, region) = spaces
            .get(&pid)
            .and_then(|space| locate(space, addr, len))
            .ok_or_else(|| Fault::read(pid, addr, len))?;
        #[allow(clippy::cast_possible_truncation)]
        let offset = (addr - start) as usize;
        Ok(region.bytes[offset..offset + len].to_vec())
    }

    fn write(&self, pid: Pid, addr: u64, bytes: &[u8]) -> Result<(), Fault> {
        let mut spaces = self.spaces.write();
        let fault = || Fault::write(pid, addr, bytes.len());
        let space = spaces.get_mut(&pid).ok_or_else(fault)?;
        let (start, writable) = locate(space, addr, bytes.len())
            .map(|(start, region)| (start, region.writable))
            .ok_or_else(fault)?;
        if !writable {
            return Err(fault());
        }
        let region = space.get_mut(&start).ok_or_else(fault)?;
        #[allow(clippy::cast_possible_truncation)]
        let offset = (addr - start) as usize;
        region.bytes[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
