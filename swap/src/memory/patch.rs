//! Staged, all-or-nothing patches of a target address space
//!
//! A [`PatchSet`] collects every write a probe activation needs. `commit`
//! first snapshots the original contents of every range (any unreadable
//! range aborts before anything is written), then applies the writes in
//! order. If a write faults, ranges already written are restored from the
//! snapshot before the fault is returned, so a target never keeps half of a
//! trampoline.

use log::{error, warn};

use super::ProcessMemory;
use crate::domain::{Fault, Pid};

#[derive(Debug, Default, Clone)]
pub struct PatchSet {
    writes: Vec<(u64, Vec<u8>)>,
}

impl PatchSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `bytes` for `addr`
    pub fn stage(&mut self, addr: u64, bytes: impl Into<Vec<u8>>) -> &mut Self {
        self.writes.push((addr, bytes.into()));
        self
    }

    /// Queue one target word
    #[allow(clippy::cast_possible_truncation)]
    pub fn stage_word(&mut self, addr: u64, value: u64) -> &mut Self {
        self.stage(addr, (value as u32).to_le_bytes().to_vec())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Apply every staged write or none of them
    ///
    /// # Errors
    /// Returns the first [`Fault`]; the target is left as it was found
    pub fn commit(self, mem: &dyn ProcessMemory, pid: Pid) -> Result<(), Fault> {
        let mut originals = Vec::with_capacity(self.writes.len());
        for (addr, bytes) in &self.writes {
            originals.push(mem.read(pid, *addr, bytes.len())?);
        }

        for (done, (addr, bytes)) in self.writes.iter().enumerate() {
            if let Err(fault) = mem.write(pid, *addr, bytes) {
                warn!("Patch of {pid} failed at {addr:#x}, rolling back {done} writes");
                // Undo in reverse so overlapping ranges end up original
                for ((undo_addr, _), original) in
                    self.writes[..done].iter().zip(&originals[..done]).rev()
                {
                    if let Err(e) = mem.write(pid, *undo_addr, original) {
                        error!("Rollback of {pid} at {undo_addr:#x} failed: {e}");
                    }
                }
                return Err(fault);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ScratchMemory;

    #[test]
    fn test_commit_applies_all_writes() {
        let mem = ScratchMemory::new();
        mem.map_zeroed(Pid(1), 0x1000, 16);

        let mut patch = PatchSet::new();
        patch.stage(0x1000, vec![0xcc]).stage_word(0x1004, 0xdead_beef);
        assert_eq!(patch.len(), 2);
        patch.commit(&mem, Pid(1)).unwrap();

        assert_eq!(mem.read(Pid(1), 0x1000, 1).unwrap(), vec![0xcc]);
        assert_eq!(mem.read_word(Pid(1), 0x1004).unwrap(), 0xdead_beef);
    }

    #[test]
    fn test_failed_write_rolls_back() {
        let mem = ScratchMemory::new();
        mem.map(Pid(1), 0x1000, &[0x55; 8]);
        mem.map_read_only(Pid(1), 0x2000, &[0x90; 8]);

        let mut patch = PatchSet::new();
        patch.stage(0x1000, vec![0xcc; 4]).stage(0x2000, vec![0xcc]);
        let fault = patch.commit(&mem, Pid(1)).unwrap_err();

        assert_eq!(fault, Fault::write(Pid(1), 0x2000, 1));
        assert_eq!(mem.read(Pid(1), 0x1000, 8).unwrap(), vec![0x55; 8]);
    }

    #[test]
    fn test_unreadable_range_writes_nothing() {
        let mem = ScratchMemory::new();
        mem.map(Pid(1), 0x1000, &[0x55; 8]);

        let mut patch = PatchSet::new();
        patch.stage(0x1000, vec![0xcc]).stage(0x9000, vec![0xcc]);
        assert!(patch.commit(&mem, Pid(1)).is_err());
        assert_eq!(mem.write_count(), 0);
    }
}
