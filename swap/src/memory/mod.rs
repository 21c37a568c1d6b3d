//! Cross-process memory access
//!
//! Everything that reads or patches a monitored process goes through the
//! [`ProcessMemory`] capability, never through raw pointers:
//! - [`ProcMem`]: live processes via `/proc/<pid>/mem`
//! - [`ScratchMemory`]: an in-process image of sparse address spaces
//! - [`PatchSet`]: staged multi-range patches committed all-or-nothing
//! - [`maps`]: VMA lookup from `/proc/<pid>/maps`

pub mod maps;
pub mod patch;
pub mod proc_mem;
pub mod scratch;

pub use maps::{find_binary_range, parse_maps, Mapping, MapsSnapshot, MemoryRange, ProcMaps, VmaLookup};
pub use patch::PatchSet;
pub use proc_mem::ProcMem;
pub use scratch::ScratchMemory;

use crate::domain::{Fault, Pid};

/// Size of a word in the target ABI (i386)
pub const WORD_SIZE: usize = 4;

/// Read/write access to another process's address space
pub trait ProcessMemory: Send + Sync {
    /// Read `len` bytes at `addr`
    ///
    /// # Errors
    /// Returns a [`Fault`] if any byte of the range is inaccessible
    fn read(&self, pid: Pid, addr: u64, len: usize) -> Result<Vec<u8>, Fault>;

    /// Write `bytes` at `addr`
    ///
    /// # Errors
    /// Returns a [`Fault`] if the range is not writable
    fn write(&self, pid: Pid, addr: u64, bytes: &[u8]) -> Result<(), Fault>;

    /// Read one target word (4 bytes, little-endian)
    ///
    /// # Errors
    /// Returns a [`Fault`] if the word is inaccessible
    fn read_word(&self, pid: Pid, addr: u64) -> Result<u64, Fault> {
        let raw = self.read(pid, addr, WORD_SIZE)?;
        let mut word = [0u8; WORD_SIZE];
        word.copy_from_slice(&raw[..WORD_SIZE]);
        Ok(u64::from(u32::from_le_bytes(word)))
    }

    /// Write one target word; only the low 32 bits of `value` are stored
    ///
    /// # Errors
    /// Returns a [`Fault`] if the word is not writable
    #[allow(clippy::cast_possible_truncation)]
    fn write_word(&self, pid: Pid, addr: u64, value: u64) -> Result<(), Fault> {
        self.write(pid, addr, &(value as u32).to_le_bytes())
    }
}
