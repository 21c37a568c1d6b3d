//! # Shared Data Structures (eBPF ↔ Userspace)
//!
//! Types and constants shared between the kernel-side mmap watcher and the
//! `swap` daemon, plus the numeric ABI of the trace device (ioctl codes,
//! record message ids). All cross-boundary structs are `#[repr(C)]`.
//!
//! ## Key Types
//!
//! - [`MmapEvent`] - A mapping created by a monitored process (ring buffer payload)
//! - [`BufferInitialize`] - Argument block of the `BUFFER_INITIALIZE` ioctl
//! - [`RecordHeader`] - Header prepended to every trace record in the device buffer

#![no_std]

// ============================================================================
// mmap watcher
// ============================================================================

/// Emitted by the `do_mmap` return probe for every successful mapping made by
/// a process listed in the `MONITORED_PIDS` map.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MmapEvent {
    /// Process ID (TGID in Linux terms)
    pub pid: u32,

    /// Thread that performed the mapping
    pub tid: u32,

    /// Start address returned by `do_mmap`
    pub addr: u64,

    /// Timestamp in nanoseconds (`bpf_ktime_get_ns()`, monotonic since boot)
    pub timestamp_ns: u64,
}

/// Maximum number of processes the watcher filters on.
pub const MAX_MONITORED_PIDS: u32 = 1024;

// ============================================================================
// Trace device ioctl ABI
// ============================================================================

const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;

const IOC_NONE: u32 = 0;
const IOC_WRITE: u32 = 1;

const fn ioc(dir: u32, ty: u32, nr: u32, size: u32) -> u32 {
    (dir << IOC_DIRSHIFT) | (ty << IOC_TYPESHIFT) | (nr << IOC_NRSHIFT) | (size << IOC_SIZESHIFT)
}

/// `_IO(type, nr)`
#[must_use]
pub const fn io(ty: u32, nr: u32) -> u32 {
    ioc(IOC_NONE, ty, nr, 0)
}

/// `_IOW(type, nr, size)`
#[must_use]
pub const fn iow(ty: u32, nr: u32, size: u32) -> u32 {
    ioc(IOC_WRITE, ty, nr, size)
}

/// ioctl magic of the trace device
pub const SWAP_DRIVER_IOC_MAGIC: u32 = 0xAF;

/// Argument block of [`SWAP_DRIVER_BUFFER_INITIALIZE`]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferInitialize {
    /// Sub-buffer size in bytes
    pub size: u32,
    /// Number of sub-buffers
    pub count: u32,
}

#[allow(clippy::cast_possible_truncation)]
const BUFFER_INITIALIZE_SIZE: u32 = core::mem::size_of::<BufferInitialize>() as u32;

pub const SWAP_DRIVER_BUFFER_INITIALIZE: u32 =
    iow(SWAP_DRIVER_IOC_MAGIC, 1, BUFFER_INITIALIZE_SIZE);
pub const SWAP_DRIVER_BUFFER_UNINITIALIZE: u32 = io(SWAP_DRIVER_IOC_MAGIC, 2);
pub const SWAP_DRIVER_NEXT_BUFFER_TO_READ: u32 = io(SWAP_DRIVER_IOC_MAGIC, 3);
pub const SWAP_DRIVER_FLUSH_BUFFER: u32 = io(SWAP_DRIVER_IOC_MAGIC, 4);
/// The argument is a user pointer (4 bytes on the i386 ABI)
pub const SWAP_DRIVER_MSG: u32 = iow(SWAP_DRIVER_IOC_MAGIC, 5, 4);
pub const SWAP_DRIVER_WAKE_UP: u32 = io(SWAP_DRIVER_IOC_MAGIC, 6);

/// Largest accepted sub-buffer (64 KiB)
pub const MAXIMUM_SUBBUFFER_SIZE: u32 = 64 * 1024;

/// Largest accepted sub-buffer count
pub const MAXIMUM_SUBBUFFER_COUNT: u32 = 1_000_000;

// ============================================================================
// Trace records
// ============================================================================

/// Header prepended to every record written into the trace device buffer.
///
/// Serialized little-endian, field by field, without padding
/// ([`RECORD_HEADER_LEN`] bytes).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecordHeader {
    /// One of the `MSG_*` constants
    pub msg_id: u32,
    /// Per-writer sequence number
    pub seq: u32,
    /// Monotonic timestamp (nanoseconds)
    pub timestamp_ns: u64,
    /// Payload length following the header
    pub len: u32,
}

pub const RECORD_HEADER_LEN: usize = 20;

impl RecordHeader {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; RECORD_HEADER_LEN] {
        let mut out = [0u8; RECORD_HEADER_LEN];
        out[0..4].copy_from_slice(&self.msg_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.seq.to_le_bytes());
        out[8..16].copy_from_slice(&self.timestamp_ns.to_le_bytes());
        out[16..20].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    #[must_use]
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() < RECORD_HEADER_LEN {
            return None;
        }
        let word = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&raw[8..16]);
        Some(Self {
            msg_id: word(0),
            seq: word(4),
            timestamp_ns: u64::from_le_bytes(ts),
            len: word(16),
        })
    }
}

/// Loader mapped into a monitored process. Payload: pid u32, base u64.
pub const MSG_LOADER_BASE: u32 = 0x0001;

/// Handler library loaded. Payload: pid u32, base u64, handle u64, path.
pub const MSG_HANDLER_LOADED: u32 = 0x0002;

/// Handler load attempt failed. Payload: pid u32, attempts left u32, path.
pub const MSG_HANDLER_FAILED: u32 = 0x0003;

/// Web page / resource lifecycle edge. Payload: see `swap::wsp::msg`.
pub const MSG_WSP: u32 = 0x0010;

#[cfg(feature = "user")]
use aya::Pod;

// Pod lets userspace read these straight out of eBPF maps and ring buffers
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for MmapEvent {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ioctl_codes_match_linux_encoding() {
        assert_eq!(SWAP_DRIVER_BUFFER_UNINITIALIZE, 0xAF02);
        assert_eq!(SWAP_DRIVER_WAKE_UP, 0xAF06);
        // _IOW: dir=1 in the top two bits, size 8 in bits 16..30
        assert_eq!(SWAP_DRIVER_BUFFER_INITIALIZE, 0x4008_AF01);
        assert_eq!(SWAP_DRIVER_MSG, 0x4004_AF05);
    }

    #[test]
    fn test_record_header_layout() {
        let header = RecordHeader { msg_id: 0x10, seq: 7, timestamp_ns: 0x0102, len: 3 };
        let raw = header.to_bytes();
        assert_eq!(&raw[0..4], &[0x10, 0, 0, 0]);
        assert_eq!(RecordHeader::from_bytes(&raw), Some(header));
        assert_eq!(RecordHeader::from_bytes(&raw[..10]), None);
    }
}
