//! Structured error types for swap
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Each subsystem gets its own enum; user-visible codes are negative errno
//! values as the device and control files report them.

use super::types::{Pid, Tid};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Direction of a failed cross-process memory access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Read,
    Write,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::Read => f.write_str("read"),
            FaultKind::Write => f.write_str("write"),
        }
    }
}

/// A cross-process memory access could not complete
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} of {len} bytes at {addr:#x} in {pid} failed")]
pub struct Fault {
    pub pid: Pid,
    pub addr: u64,
    pub len: usize,
    pub kind: FaultKind,
}

impl Fault {
    #[must_use]
    pub fn read(pid: Pid, addr: u64, len: usize) -> Self {
        Self { pid, addr, len, kind: FaultKind::Read }
    }

    #[must_use]
    pub fn write(pid: Pid, addr: u64, len: usize) -> Self {
        Self { pid, addr, len, kind: FaultKind::Write }
    }
}

/// Memory fault while arming or patching a probe.
///
/// The probe's activation is abandoned; nothing of the patch is left behind
/// in the target.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("probe at {addr:#x} in {pid} aborted: {fault}")]
pub struct FatalProbeError {
    pub pid: Pid,
    pub addr: u64,
    #[source]
    pub fault: Fault,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error(transparent)]
    Fatal(#[from] FatalProbeError),

    #[error("instruction at {addr:#x} is a relative call and cannot be probed")]
    RelativeCall { addr: u64 },

    #[error("process {0} is not attached to the probe engine")]
    NotAttached(Pid),

    #[error("process {0} is already attached to the probe engine")]
    AlreadyAttached(Pid),

    #[error("no free trampoline slot left in {0}")]
    SlotsExhausted(Pid),

    #[error("probe already registered at {addr:#x} in {pid}")]
    AlreadyRegistered { pid: Pid, addr: u64 },

    #[error("no probe registered at {addr:#x} in {pid}")]
    NotRegistered { pid: Pid, addr: u64 },

    #[error("no single-step pending for {0}")]
    NoSingleStep(Tid),

    #[error("{tid} returned through the trampoline of {addr:#x} with no pending instance")]
    OrphanReturn { tid: Tid, addr: u64 },
}

impl ProbeError {
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProbeError::Fatal(_))
    }
}

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("binary {} is already ignored", .0.display())]
    AlreadyIgnored(PathBuf),

    #[error("cannot resolve {}: {source}", .path.display())]
    Lookup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("handler {} is already registered", .0.display())]
    HandlerExists(PathBuf),

    #[error("handler path {} cannot be passed to the target", .0.display())]
    InvalidPath(PathBuf),

    #[error("process {0} is not instrumented")]
    UnknownProcess(Pid),

    #[error("process {0} is already instrumented")]
    ProcessExists(Pid),

    #[error("handler paths for {pid} need {needed} bytes, data area holds {size}")]
    DataAreaFull { pid: Pid, needed: usize, size: usize },

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Fault(#[from] Fault),
}

impl LoaderError {
    /// Negative errno reported through the control files
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            LoaderError::AlreadyIgnored(_) | LoaderError::HandlerExists(_) => -libc::EALREADY,
            LoaderError::Lookup { .. } => -libc::ENOENT,
            LoaderError::InvalidPath(_) => -libc::EINVAL,
            LoaderError::UnknownProcess(_) => -libc::ESRCH,
            LoaderError::ProcessExists(_) => -libc::EEXIST,
            LoaderError::DataAreaFull { .. } => -libc::ENOSPC,
            LoaderError::Probe(_) | LoaderError::Fault(_) => -libc::EFAULT,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("no data available, operation would block")]
    WouldBlock,

    #[error("interrupted by a pending signal")]
    Interrupted,

    #[error("sub-buffer geometry {size}x{count} exceeds the device limits")]
    NoSpace { size: u32, count: u32 },

    #[error("cannot allocate {size}x{count} sub-buffers")]
    NoMemory { size: u32, count: u32 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("buffer is not initialized")]
    NotInitialized,

    #[error("buffer is already initialized")]
    AlreadyInitialized,

    #[error("device is already open")]
    Busy,

    #[error("record of {len} bytes does not fit a {max}-byte sub-buffer")]
    RecordTooLarge { len: usize, max: usize },

    #[error("unknown ioctl command {0:#x}")]
    UnknownCommand(u32),

    #[error("no message handler registered")]
    NoMsgHandler,

    #[error("pipe rejected spliced pages: {0}")]
    Pipe(String),
}

impl DeviceError {
    /// Negative errno as returned from the device entry points
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            DeviceError::WouldBlock => -libc::EAGAIN,
            DeviceError::Interrupted => -libc::EINTR,
            DeviceError::NoSpace { .. } | DeviceError::RecordTooLarge { .. } => -libc::ENOSPC,
            DeviceError::NoMemory { .. } => -libc::ENOMEM,
            DeviceError::InvalidArgument(_)
            | DeviceError::NotInitialized
            | DeviceError::NoMsgHandler => -libc::EINVAL,
            DeviceError::AlreadyInitialized | DeviceError::Busy => -libc::EBUSY,
            DeviceError::UnknownCommand(_) => -libc::ENOTTY,
            DeviceError::Pipe(_) => -libc::EPIPE,
        }
    }
}

/// A drained trace stream could not be split into records
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("truncated record header at offset {0}")]
    TruncatedHeader(usize),

    #[error("record at offset {offset} declares {len} payload bytes, {available} available")]
    TruncatedPayload { offset: usize, len: usize, available: usize },

    #[error("malformed {kind} payload of {len} bytes")]
    Malformed { kind: &'static str, len: usize },
}

#[derive(Error, Debug)]
pub enum WspError {
    #[error("resource {id}: illegal transition {from} -> {to}")]
    IllegalTransition { id: u32, from: &'static str, to: &'static str },

    #[error("no live resource for {ptr:#x}")]
    NotFound { ptr: u64 },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("symbol {name} not found in {}", .path.display())]
    SymbolNotFound { name: String, path: PathBuf },

    #[error("failed to parse ELF {}: {reason}", .path.display())]
    Elf { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Probe(#[from] ProbeError),
}

impl WspError {
    /// Negative errno reported through the control files
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            WspError::NotFound { .. } | WspError::SymbolNotFound { .. } => -libc::ENOENT,
            WspError::Io(_) | WspError::Probe(_) => -libc::EFAULT,
            _ => -libc::EINVAL,
        }
    }
}
