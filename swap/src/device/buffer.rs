//! Sub-buffer pool behind the trace device
//!
//! Producers append whole records to the sub-buffer being filled; a record
//! that does not fit seals it and starts the next one, so records never
//! straddle sub-buffers. Sealed sub-buffers queue up for the single reader,
//! which claims them one at a time. Memory is allocated when a sub-buffer is
//! first filled, not at initialization: the accepted geometry goes up to
//! 64 GiB.
//!
//! ```text
//!  free ──write──▶ filling ──seal──▶ ready ──claim──▶ claimed ──consume──▶ free
//! ```

use bytes::{Bytes, BytesMut};
use log::debug;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use swap_common::{BufferInitialize, MAXIMUM_SUBBUFFER_COUNT, MAXIMUM_SUBBUFFER_SIZE};

use crate::domain::DeviceError;

/// Result of one producer write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    /// `false` if every sub-buffer was in use and the record was lost
    pub stored: bool,
    /// A sub-buffer became ready for the reader
    pub sealed: bool,
}

/// Zero-copy reference to part of one page of a claimed sub-buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialPage {
    /// Offset of `data` inside its page
    pub offset: usize,
    pub data: Bytes,
}

impl PartialPage {
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

struct Claimed {
    data: Bytes,
    pos: usize,
}

#[derive(Default)]
struct PoolInner {
    filling: Option<BytesMut>,
    ready: VecDeque<Bytes>,
    claimed: Option<Claimed>,
}

impl PoolInner {
    fn in_use(&self) -> usize {
        usize::from(self.filling.is_some()) + self.ready.len() + usize::from(self.claimed.is_some())
    }

    /// Queue the sub-buffer being filled if it holds anything
    fn seal(&mut self) -> bool {
        match self.filling.take() {
            Some(buf) if !buf.is_empty() => {
                self.ready.push_back(buf.freeze());
                true
            }
            other => {
                self.filling = other;
                false
            }
        }
    }

    fn claim(&mut self) -> Option<&mut Claimed> {
        if self.claimed.is_none() {
            self.claimed = self.ready.pop_front().map(|data| Claimed { data, pos: 0 });
        }
        self.claimed.as_mut()
    }

    fn consume(&mut self, n: usize) {
        if let Some(c) = &mut self.claimed {
            c.pos += n;
            if c.pos >= c.data.len() {
                self.claimed = None;
            }
        }
    }
}

pub struct BufferPool {
    subbuf_size: usize,
    subbuf_count: usize,
    inner: Mutex<PoolInner>,
    lost: AtomicU64,
    allocated: AtomicU64,
}

/// Check a `BUFFER_INITIALIZE` geometry before anything is allocated
///
/// # Errors
/// - [`DeviceError::NoSpace`] above 64 KiB per sub-buffer or 1,000,000
///   sub-buffers
/// - [`DeviceError::InvalidArgument`] for a zero size or count
pub fn validate_geometry(init: BufferInitialize) -> Result<(), DeviceError> {
    let BufferInitialize { size, count } = init;
    if size > MAXIMUM_SUBBUFFER_SIZE || count > MAXIMUM_SUBBUFFER_COUNT {
        return Err(DeviceError::NoSpace { size, count });
    }
    if size == 0 || count == 0 {
        return Err(DeviceError::InvalidArgument(format!("sub-buffer geometry {size}x{count}")));
    }
    Ok(())
}

impl BufferPool {
    /// # Errors
    /// See [`validate_geometry`]; [`DeviceError::NoMemory`] if the total
    /// size is not addressable
    pub fn new(init: BufferInitialize) -> Result<Self, DeviceError> {
        validate_geometry(init)?;
        let BufferInitialize { size, count } = init;
        let subbuf_size = size as usize;
        let subbuf_count = count as usize;
        if subbuf_size.checked_mul(subbuf_count).is_none() {
            return Err(DeviceError::NoMemory { size, count });
        }
        debug!("Sub-buffer pool {size}x{count} created");
        Ok(Self {
            subbuf_size,
            subbuf_count,
            inner: Mutex::new(PoolInner::default()),
            lost: AtomicU64::new(0),
            allocated: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn subbuf_size(&self) -> usize {
        self.subbuf_size
    }

    #[must_use]
    pub fn subbuf_count(&self) -> usize {
        self.subbuf_count
    }

    /// Append one record
    ///
    /// # Errors
    /// [`DeviceError::RecordTooLarge`] if the record cannot fit any
    /// sub-buffer
    pub fn write(&self, record: &[u8]) -> Result<WriteOutcome, DeviceError> {
        if record.len() > self.subbuf_size {
            return Err(DeviceError::RecordTooLarge { len: record.len(), max: self.subbuf_size });
        }
        let mut inner = self.inner.lock();
        let mut sealed = false;
        if inner.filling.as_ref().is_some_and(|buf| buf.len() + record.len() > self.subbuf_size) {
            sealed = inner.seal();
        }

        if inner.filling.is_none() {
            if inner.in_use() >= self.subbuf_count {
                self.lost.fetch_add(1, Ordering::Relaxed);
                return Ok(WriteOutcome { stored: false, sealed });
            }
            inner.filling = Some(BytesMut::with_capacity(self.subbuf_size));
            self.allocated.fetch_add(self.subbuf_size as u64, Ordering::Relaxed);
        }
        if let Some(buf) = inner.filling.as_mut() {
            buf.extend_from_slice(record);
        }
        Ok(WriteOutcome { stored: true, sealed })
    }

    /// Seal the partially filled sub-buffer; `true` if one was queued
    pub fn flush(&self) -> bool {
        self.inner.lock().seal()
    }

    /// Drop what is left of the claimed sub-buffer and claim the next one
    ///
    /// Returns `true` if a sub-buffer is now claimed.
    pub fn next_buffer_to_read(&self) -> bool {
        let mut inner = self.inner.lock();
        if let Some(c) = inner.claimed.take() {
            debug!("Discarding {} unread bytes", c.data.len() - c.pos);
        }
        inner.claim().is_some()
    }

    /// Whether a read would find data without blocking
    #[must_use]
    pub fn has_data(&self) -> bool {
        let inner = self.inner.lock();
        inner.claimed.is_some() || !inner.ready.is_empty()
    }

    /// Copy claimed bytes into `buf`, claiming a sub-buffer if needed
    pub fn read_into(&self, buf: &mut [u8]) -> usize {
        let mut inner = self.inner.lock();
        let Some(c) = inner.claim() else {
            return 0;
        };
        let n = buf.len().min(c.data.len() - c.pos);
        buf[..n].copy_from_slice(&c.data[c.pos..c.pos + n]);
        inner.consume(n);
        n
    }

    /// Page references covering up to `len` claimed bytes, at most
    /// `max_pages` of them
    ///
    /// Nothing is consumed; call [`BufferPool::consume`] with what the pipe
    /// accepted.
    #[must_use]
    pub fn splice_pages(&self, len: usize, max_pages: usize, page_size: usize) -> Vec<PartialPage> {
        let mut inner = self.inner.lock();
        let Some(c) = inner.claim() else {
            return Vec::new();
        };
        let end = c.data.len().min(c.pos.saturating_add(len));
        let mut pages = Vec::new();
        let mut at = c.pos;
        while at < end && pages.len() < max_pages {
            let offset = at % page_size;
            let stop = end.min(at - offset + page_size);
            pages.push(PartialPage { offset, data: c.data.slice(at..stop) });
            at = stop;
        }
        pages
    }

    /// Mark `n` claimed bytes as read
    pub fn consume(&self, n: usize) {
        self.inner.lock().consume(n);
    }

    /// Records dropped because every sub-buffer was in use
    #[must_use]
    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    /// Bytes allocated for sub-buffers so far
    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Sub-buffers queued for the reader
    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.inner.lock().ready.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(size: u32, count: u32) -> BufferPool {
        BufferPool::new(BufferInitialize { size, count }).unwrap()
    }

    #[test]
    fn test_geometry_bounds() {
        let too_big = BufferInitialize { size: 65537, count: 1 };
        assert!(matches!(BufferPool::new(too_big), Err(DeviceError::NoSpace { .. })));
        let too_many = BufferInitialize { size: 4096, count: 1_000_001 };
        assert!(matches!(BufferPool::new(too_many), Err(DeviceError::NoSpace { .. })));
        assert!(BufferPool::new(BufferInitialize { size: 0, count: 4 }).is_err());

        // Largest geometry is accepted and allocates nothing up front
        let max = pool(65536, 1_000_000);
        assert_eq!(max.allocated_bytes(), 0);
    }

    #[test]
    fn test_records_never_straddle() {
        let pool = pool(16, 4);
        assert_eq!(pool.write(&[1; 10]).unwrap(), WriteOutcome { stored: true, sealed: false });
        assert_eq!(pool.write(&[2; 10]).unwrap(), WriteOutcome { stored: true, sealed: true });
        assert_eq!(pool.ready_count(), 1);

        let mut buf = [0u8; 64];
        assert_eq!(pool.read_into(&mut buf), 10);
        assert_eq!(&buf[..10], &[1; 10]);
        assert!(!pool.has_data());

        assert!(pool.flush());
        assert_eq!(pool.read_into(&mut buf), 10);
        assert_eq!(&buf[..10], &[2; 10]);
        assert!(matches!(pool.write(&[0; 17]), Err(DeviceError::RecordTooLarge { .. })));
    }

    #[test]
    fn test_full_pool_loses_records() {
        let pool = pool(8, 2);
        pool.write(&[1; 8]).unwrap();
        pool.write(&[2; 8]).unwrap();
        let outcome = pool.write(&[3; 8]).unwrap();
        assert_eq!(outcome, WriteOutcome { stored: false, sealed: true });
        assert_eq!(pool.lost(), 1);

        // Reading frees a sub-buffer again
        let mut buf = [0u8; 8];
        pool.read_into(&mut buf);
        assert!(pool.write(&[3; 8]).unwrap().stored);
    }

    #[test]
    fn test_partial_reads_and_next_buffer() {
        let pool = pool(8, 4);
        pool.write(&[1, 2, 3, 4]).unwrap();
        pool.flush();
        pool.write(&[5, 6]).unwrap();
        pool.flush();

        let mut buf = [0u8; 3];
        assert_eq!(pool.read_into(&mut buf), 3);
        assert_eq!(buf, [1, 2, 3]);
        // Skip the rest of the first sub-buffer
        assert!(pool.next_buffer_to_read());
        assert_eq!(pool.read_into(&mut buf), 2);
        assert_eq!(&buf[..2], &[5, 6]);
        assert!(!pool.next_buffer_to_read());
    }

    #[test]
    fn test_splice_pages_follow_page_boundaries() {
        let pool = pool(65536, 2);
        let record: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        pool.write(&record).unwrap();
        pool.flush();

        let pages = pool.splice_pages(usize::MAX, 16, 4096);
        let lens: Vec<_> = pages.iter().map(PartialPage::len).collect();
        assert_eq!(lens, vec![4096, 4096, 1808]);
        assert!(pages.iter().all(|p| p.offset == 0));

        pool.consume(5000);
        let pages = pool.splice_pages(100, 16, 4096);
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].offset, 5000 - 4096);
        assert_eq!(pages[0].data[..], record[5000..5100]);
    }

    #[test]
    fn test_splice_page_limit() {
        let pool = pool(65536, 1);
        pool.write(&[7; 65536]).unwrap();
        pool.flush();
        assert_eq!(pool.splice_pages(usize::MAX, 16, 1024).len(), 16);
    }
}
