//! Trampoline slot allocator
//!
//! Each monitored process donates one executable area; it is cut into
//! fixed-size slots, one per armed probe.

use super::insn::MAX_INSN_SIZE;

/// Bytes per trampoline slot
pub const SLOT_SIZE: usize = 32;

/// Offset of the return-break `int3` inside a slot
pub const RET_BREAK_OFFSET: usize = MAX_INSN_SIZE;

#[derive(Debug)]
pub struct SlotArea {
    base: u64,
    used: Vec<bool>,
}

impl SlotArea {
    /// Area of `len` bytes at `base`; a trailing partial slot is unused
    #[must_use]
    pub fn new(base: u64, len: usize) -> Self {
        Self { base, used: vec![false; len / SLOT_SIZE] }
    }

    /// Take the lowest free slot
    pub fn alloc(&mut self) -> Option<u64> {
        let idx = self.used.iter().position(|u| !u)?;
        self.used[idx] = true;
        Some(self.base + (idx * SLOT_SIZE) as u64)
    }

    /// Return a slot; unknown addresses are ignored
    pub fn free(&mut self, slot: u64) {
        if let Some(idx) = self.index_of(slot) {
            self.used[idx] = false;
        }
    }

    /// Whether `addr` falls inside the area
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + (self.used.len() * SLOT_SIZE) as u64
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.used.len()
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.used.iter().filter(|u| **u).count()
    }

    fn index_of(&self, slot: u64) -> Option<usize> {
        if !self.contains(slot) {
            return None;
        }
        let offset = usize::try_from(slot - self.base).ok()?;
        (offset % SLOT_SIZE == 0).then_some(offset / SLOT_SIZE)
    }
}
