//! Trace records
//!
//! Every message handed to the trace device is framed as a
//! [`RecordHeader`] followed by `len` payload bytes. Producers only see
//! the [`RecordSink`] trait; the device's `TraceWriter` is the production
//! sink and [`RecordLog`] keeps records in memory.
//!
//! [`RecordReader`] splits a drained byte stream back into records and
//! [`Event::decode`] gives their payloads meaning.

pub mod export;

pub use export::JsonLinesExporter;
pub use swap_common::{
    RecordHeader, MSG_HANDLER_FAILED, MSG_HANDLER_LOADED, MSG_LOADER_BASE, MSG_WSP,
    RECORD_HEADER_LEN,
};

use parking_lot::Mutex;
use serde::Serialize;
use std::path::Path;

use crate::domain::{Pid, RecordError};
use crate::wsp::msg::WspMessage;

/// Destination of trace records
pub trait RecordSink: Send + Sync {
    /// Append one record; a sink that cannot keep it drops it silently
    fn emit(&self, msg_id: u32, payload: &[u8]);
}

/// In-memory sink
#[derive(Default)]
pub struct RecordLog {
    records: Mutex<Vec<(u32, Vec<u8>)>>,
}

impl RecordLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every record emitted so far
    #[must_use]
    pub fn drain(&self) -> Vec<(u32, Vec<u8>)> {
        std::mem::take(&mut *self.records.lock())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl RecordSink for RecordLog {
    fn emit(&self, msg_id: u32, payload: &[u8]) {
        self.records.lock().push((msg_id, payload.to_vec()));
    }
}

/// Monotonic clock in nanoseconds, same base as `bpf_ktime_get_ns()`
#[must_use]
#[allow(unsafe_code, clippy::cast_sign_loss)]
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: ts is a valid, writable timespec
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

/// One framed record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub header: RecordHeader,
    pub payload: Vec<u8>,
}

/// Iterator over the records of a drained stream
///
/// Stops after the first framing error.
pub struct RecordReader<'a> {
    buf: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> RecordReader<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0, failed: false }
    }
}

impl Iterator for RecordReader<'_> {
    type Item = Result<Record, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.buf.len() {
            return None;
        }
        let offset = self.pos;
        let Some(header) = RecordHeader::from_bytes(&self.buf[offset..]) else {
            self.failed = true;
            return Some(Err(RecordError::TruncatedHeader(offset)));
        };
        let start = offset + RECORD_HEADER_LEN;
        let len = header.len as usize;
        let available = self.buf.len() - start;
        if len > available {
            self.failed = true;
            return Some(Err(RecordError::TruncatedPayload { offset, len, available }));
        }
        self.pos = start + len;
        Some(Ok(Record { header, payload: self.buf[start..self.pos].to_vec() }))
    }
}

/// Decoded record payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    LoaderBase { pid: u32, base: u64 },
    HandlerLoaded { pid: u32, base: u64, handle: u64, path: String },
    HandlerFailed { pid: u32, attempts_left: u32, path: String },
    Wsp(WspMessage),
    Unknown { len: usize },
}

fn le_u32(raw: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(raw.get(at..at + 4)?.try_into().ok()?))
}

fn le_u64(raw: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_le_bytes(raw.get(at..at + 8)?.try_into().ok()?))
}

impl Event {
    /// Interpret a record payload
    ///
    /// # Errors
    /// [`RecordError::Malformed`] if a known message id has a payload of
    /// the wrong shape
    pub fn decode(msg_id: u32, payload: &[u8]) -> Result<Self, RecordError> {
        let malformed = |kind: &'static str| RecordError::Malformed { kind, len: payload.len() };
        match msg_id {
            MSG_LOADER_BASE => {
                let pid = le_u32(payload, 0).ok_or_else(|| malformed("loader base"))?;
                let base = le_u64(payload, 4).ok_or_else(|| malformed("loader base"))?;
                Ok(Event::LoaderBase { pid, base })
            }
            MSG_HANDLER_LOADED => {
                let fields = le_u32(payload, 0).zip(le_u64(payload, 4)).zip(le_u64(payload, 12));
                let ((pid, base), handle) = fields.ok_or_else(|| malformed("handler loaded"))?;
                let path = String::from_utf8_lossy(&payload[20..]).into_owned();
                Ok(Event::HandlerLoaded { pid, base, handle, path })
            }
            MSG_HANDLER_FAILED => {
                let fields = le_u32(payload, 0).zip(le_u32(payload, 4));
                let (pid, attempts_left) = fields.ok_or_else(|| malformed("handler failed"))?;
                let path = String::from_utf8_lossy(&payload[8..]).into_owned();
                Ok(Event::HandlerFailed { pid, attempts_left, path })
            }
            MSG_WSP => WspMessage::decode(payload).map(Event::Wsp).ok_or_else(|| malformed("wsp")),
            _ => Ok(Event::Unknown { len: payload.len() }),
        }
    }
}

#[must_use]
pub fn loader_base_payload(pid: Pid, base: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    out.extend_from_slice(&pid.0.to_le_bytes());
    out.extend_from_slice(&base.to_le_bytes());
    out
}

#[must_use]
pub fn handler_loaded_payload(pid: Pid, base: u64, handle: u64, path: &Path) -> Vec<u8> {
    let path = path.to_string_lossy();
    let mut out = Vec::with_capacity(20 + path.len());
    out.extend_from_slice(&pid.0.to_le_bytes());
    out.extend_from_slice(&base.to_le_bytes());
    out.extend_from_slice(&handle.to_le_bytes());
    out.extend_from_slice(path.as_bytes());
    out
}

#[must_use]
pub fn handler_failed_payload(pid: Pid, attempts_left: u32, path: &Path) -> Vec<u8> {
    let path = path.to_string_lossy();
    let mut out = Vec::with_capacity(8 + path.len());
    out.extend_from_slice(&pid.0.to_le_bytes());
    out.extend_from_slice(&attempts_left.to_le_bytes());
    out.extend_from_slice(path.as_bytes());
    out
}
