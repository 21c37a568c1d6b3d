//! i386 user register file as seen by trap handlers

use crate::domain::{Fault, Pid};
use crate::memory::{ProcessMemory, WORD_SIZE};

/// Number of stack arguments handed to entry handlers
pub const MAX_ARGS: usize = 6;

/// Saved user registers of the trapped thread
///
/// Handlers may modify any field; the trap returns with the modified set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Regs {
    pub ip: u64,
    pub sp: u64,
    pub bp: u64,
    pub ax: u64,
    pub bx: u64,
    pub cx: u64,
    pub dx: u64,
    pub si: u64,
    pub di: u64,
    pub flags: u64,
}

impl Regs {
    /// Stack address of argument `n` (cdecl, return address at `[sp]`)
    #[must_use]
    pub fn arg_slot(&self, n: usize) -> u64 {
        self.sp + (WORD_SIZE * (n + 1)) as u64
    }

    #[must_use]
    pub fn return_value(&self) -> u64 {
        self.ax
    }

    pub fn set_return_value(&mut self, value: u64) {
        self.ax = value;
    }

    /// Read the first [`MAX_ARGS`] arguments off the user stack
    ///
    /// # Errors
    /// Returns a [`Fault`] if the stack cannot be read
    pub fn read_args(&self, mem: &dyn ProcessMemory, pid: Pid) -> Result<[u64; MAX_ARGS], Fault> {
        let raw = mem.read(pid, self.arg_slot(0), WORD_SIZE * MAX_ARGS)?;
        let mut args = [0u64; MAX_ARGS];
        for (arg, word) in args.iter_mut().zip(raw.chunks_exact(WORD_SIZE)) {
            let mut bytes = [0u8; WORD_SIZE];
            bytes.copy_from_slice(word);
            *arg = u64::from(u32::from_le_bytes(bytes));
        }
        Ok(args)
    }
}
