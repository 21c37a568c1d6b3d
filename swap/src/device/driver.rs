//! The trace device: one reader, any number of producers
//!
//! [`SwapDevice::open`] hands out the single [`DeviceFile`]; producers hold
//! [`TraceWriter`]s. Readers block until a sub-buffer is ready unless the
//! file is non-blocking or a signal is pending.

use log::{debug, info, warn};
use parking_lot::RwLock;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use super::buffer::{BufferPool, PartialPage, WriteOutcome};
use super::ioctl::{BufferInitialize, IoctlCommand};
use super::wake::{WaitQueue, WakeCoalescer};
use crate::domain::DeviceError;
use crate::record::{monotonic_ns, RecordHeader, RecordSink, RECORD_HEADER_LEN};

pub const PAGE_SIZE: usize = 4096;
/// Pages handed to a pipe per splice call
pub const PIPE_DEF_BUFFERS: usize = 16;

/// Receiver of `MSG` ioctl blobs
pub trait MsgHandler: Send + Sync {
    /// # Errors
    /// Whatever the handler rejects the blob with
    fn handle(&self, blob: &[u8]) -> Result<(), DeviceError>;
}

impl<F> MsgHandler for F
where
    F: Fn(&[u8]) -> Result<(), DeviceError> + Send + Sync,
{
    fn handle(&self, blob: &[u8]) -> Result<(), DeviceError> {
        self(blob)
    }
}

/// Destination of spliced pages
pub trait PipeSink {
    /// Take as many of `pages` as fit; returns the bytes accepted
    ///
    /// # Errors
    /// [`DeviceError::Pipe`] if the pipe is unusable
    fn splice_pages(&mut self, pages: &[PartialPage]) -> Result<usize, DeviceError>;
}

/// Pipe holding page references, `capacity` pages at most
#[derive(Debug)]
pub struct PagePipe {
    pub pages: Vec<PartialPage>,
    capacity: usize,
}

impl PagePipe {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { pages: Vec::new(), capacity }
    }

    /// Drain the pipe's contents into one contiguous buffer
    #[must_use]
    pub fn take_bytes(&mut self) -> Vec<u8> {
        self.pages.drain(..).flat_map(|p| p.data.to_vec()).collect()
    }
}

impl PipeSink for PagePipe {
    fn splice_pages(&mut self, pages: &[PartialPage]) -> Result<usize, DeviceError> {
        let room = self.capacity.saturating_sub(self.pages.len());
        if room == 0 && !pages.is_empty() {
            return Err(DeviceError::Pipe("pipe full".into()));
        }
        let taken = &pages[..room.min(pages.len())];
        self.pages.extend_from_slice(taken);
        Ok(taken.iter().map(PartialPage::len).sum())
    }
}

/// Pipe whose far end is a writer (an output file)
pub struct WriterPipe<W: Write> {
    writer: W,
}

impl<W: Write> WriterPipe<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> PipeSink for WriterPipe<W> {
    fn splice_pages(&mut self, pages: &[PartialPage]) -> Result<usize, DeviceError> {
        let mut total = 0;
        for page in pages {
            self.writer.write_all(&page.data).map_err(|e| DeviceError::Pipe(e.to_string()))?;
            total += page.len();
        }
        Ok(total)
    }
}

/// Pending-signal flag of a reader; raising it interrupts a sleeping read
#[derive(Clone)]
pub struct SignalHandle {
    pending: Arc<AtomicBool>,
    queue: Arc<WaitQueue>,
}

impl SignalHandle {
    pub fn raise(&self) {
        self.pending.store(true, Ordering::Release);
        self.queue.wake_all();
    }

    fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }
}

pub struct SwapDevice {
    pool: RwLock<Option<Arc<BufferPool>>>,
    queue: Arc<WaitQueue>,
    coalescer: WakeCoalescer,
    opened: AtomicBool,
    msg_handler: RwLock<Option<Arc<dyn MsgHandler>>>,
    seq: AtomicU32,
}

impl SwapDevice {
    /// Device whose wake-ups run on a worker thread
    #[must_use]
    pub fn new() -> Arc<Self> {
        let queue = Arc::new(WaitQueue::new());
        Arc::new(Self::with_coalescer(WakeCoalescer::spawn(Arc::clone(&queue)), queue))
    }

    /// Device whose deferred wake-ups only run through
    /// [`SwapDevice::run_pending_wake`]
    #[must_use]
    pub fn manual() -> Arc<Self> {
        let queue = Arc::new(WaitQueue::new());
        Arc::new(Self::with_coalescer(WakeCoalescer::manual(Arc::clone(&queue)), queue))
    }

    fn with_coalescer(coalescer: WakeCoalescer, queue: Arc<WaitQueue>) -> Self {
        Self {
            pool: RwLock::new(None),
            queue,
            coalescer,
            opened: AtomicBool::new(false),
            msg_handler: RwLock::new(None),
            seq: AtomicU32::new(0),
        }
    }

    /// Open the device for reading
    ///
    /// # Errors
    /// [`DeviceError::Busy`] while another file is open
    pub fn open(self: &Arc<Self>, nonblocking: bool) -> Result<DeviceFile, DeviceError> {
        if self.opened.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(DeviceError::Busy);
        }
        debug!("Device opened ({})", if nonblocking { "non-blocking" } else { "blocking" });
        Ok(DeviceFile {
            dev: Arc::clone(self),
            nonblocking,
            signal: SignalHandle {
                pending: Arc::new(AtomicBool::new(false)),
                queue: Arc::clone(&self.queue),
            },
        })
    }

    /// Register the single `MSG` handler, replacing any previous one
    pub fn set_msg_handler(&self, handler: Arc<dyn MsgHandler>) {
        if self.msg_handler.write().replace(handler).is_some() {
            info!("Replaced message handler");
        }
    }

    #[must_use]
    pub fn writer(self: &Arc<Self>) -> TraceWriter {
        TraceWriter { dev: Arc::clone(self) }
    }

    /// Create the sub-buffer pool
    ///
    /// # Errors
    /// [`DeviceError::AlreadyInitialized`], or a geometry rejected by
    /// [`BufferPool::new`]
    pub fn initialize(&self, init: BufferInitialize) -> Result<(), DeviceError> {
        let mut pool = self.pool.write();
        if pool.is_some() {
            return Err(DeviceError::AlreadyInitialized);
        }
        *pool = Some(Arc::new(BufferPool::new(init)?));
        info!("Trace buffer initialized: {} x {} bytes", init.count, init.size);
        Ok(())
    }

    /// Drop the pool; blocked readers wake up empty-handed
    ///
    /// # Errors
    /// [`DeviceError::NotInitialized`]
    pub fn uninitialize(&self) -> Result<(), DeviceError> {
        let pool = self.pool.write().take().ok_or(DeviceError::NotInitialized)?;
        if pool.lost() > 0 {
            warn!("Trace buffer dropped {} records", pool.lost());
        }
        self.queue.wake_all();
        Ok(())
    }

    #[must_use]
    pub fn pool(&self) -> Option<Arc<BufferPool>> {
        self.pool.read().clone()
    }

    /// Run a deferred wake-up (manual devices)
    pub fn run_pending_wake(&self) -> bool {
        self.coalescer.run_pending()
    }

    #[must_use]
    pub fn wait_queue(&self) -> &Arc<WaitQueue> {
        &self.queue
    }

    #[must_use]
    pub fn wake_scheduled(&self) -> u64 {
        self.coalescer.scheduled()
    }
}

/// The open reader side of the device
pub struct DeviceFile {
    dev: Arc<SwapDevice>,
    nonblocking: bool,
    signal: SignalHandle,
}

impl DeviceFile {
    pub fn set_nonblocking(&mut self, nonblocking: bool) {
        self.nonblocking = nonblocking;
    }

    #[must_use]
    pub fn signal_handle(&self) -> SignalHandle {
        self.signal.clone()
    }

    /// Wait until the pool has a readable sub-buffer
    ///
    /// `None` means the pool is gone.
    fn wait_for_data(&self) -> Result<Option<Arc<BufferPool>>, DeviceError> {
        loop {
            let seen = self.dev.queue.generation();
            let Some(pool) = self.dev.pool() else {
                return Ok(None);
            };
            if pool.has_data() {
                return Ok(Some(pool));
            }
            if self.nonblocking {
                return Err(DeviceError::WouldBlock);
            }
            if self.signal.take() {
                return Err(DeviceError::Interrupted);
            }
            drop(pool);
            self.dev.queue.wait_from(seen);
        }
    }

    /// Copy up to `buf.len()` bytes of the claimed sub-buffer
    ///
    /// Returns 0 if the buffer is not initialized.
    ///
    /// # Errors
    /// [`DeviceError::WouldBlock`] (non-blocking, no data) or
    /// [`DeviceError::Interrupted`] (signal while sleeping)
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        match self.wait_for_data()? {
            Some(pool) => Ok(pool.read_into(buf)),
            None => Ok(0),
        }
    }

    /// Hand up to `len` bytes to `pipe` as page references, without copying
    ///
    /// # Errors
    /// As [`DeviceFile::read`], plus whatever the pipe rejects with
    pub fn splice(&self, pipe: &mut dyn PipeSink, len: usize) -> Result<usize, DeviceError> {
        let Some(pool) = self.wait_for_data()? else {
            return Ok(0);
        };
        let pages = pool.splice_pages(len, PIPE_DEF_BUFFERS, PAGE_SIZE);
        if pages.is_empty() {
            return Ok(0);
        }
        let accepted = pipe.splice_pages(&pages)?;
        pool.consume(accepted);
        Ok(accepted)
    }

    /// # Errors
    /// The decoded command's error; see [`DeviceError::errno`] for codes
    pub fn ioctl(&self, cmd: u32, arg: &[u8]) -> Result<(), DeviceError> {
        let dev = &self.dev;
        match IoctlCommand::decode(cmd, arg)? {
            IoctlCommand::BufferInitialize(init) => dev.initialize(init),
            IoctlCommand::BufferUninitialize => dev.uninitialize(),
            IoctlCommand::NextBufferToRead => {
                let pool = dev.pool().ok_or(DeviceError::NotInitialized)?;
                pool.next_buffer_to_read();
                Ok(())
            }
            IoctlCommand::FlushBuffer => {
                let pool = dev.pool().ok_or(DeviceError::NotInitialized)?;
                if pool.flush() {
                    dev.queue.wake_all();
                }
                Ok(())
            }
            IoctlCommand::Msg(blob) => {
                let handler = dev.msg_handler.read().clone().ok_or(DeviceError::NoMsgHandler)?;
                handler.handle(&blob)
            }
            IoctlCommand::WakeUp => {
                dev.coalescer.request();
                Ok(())
            }
        }
    }
}

impl Drop for DeviceFile {
    fn drop(&mut self) {
        self.dev.opened.store(false, Ordering::Release);
        debug!("Device closed");
    }
}

/// Producer handle: frames records and wakes the reader lazily
#[derive(Clone)]
pub struct TraceWriter {
    dev: Arc<SwapDevice>,
}

impl TraceWriter {
    /// Frame and append one record
    ///
    /// # Errors
    /// [`DeviceError::NotInitialized`] without a pool;
    /// [`DeviceError::RecordTooLarge`] if the framed record cannot fit
    pub fn write_record(&self, msg_id: u32, payload: &[u8]) -> Result<WriteOutcome, DeviceError> {
        let pool = self.dev.pool().ok_or(DeviceError::NotInitialized)?;
        let len = u32::try_from(payload.len()).map_err(|_| DeviceError::RecordTooLarge {
            len: payload.len(),
            max: pool.subbuf_size(),
        })?;
        let header = RecordHeader {
            msg_id,
            seq: self.dev.seq.fetch_add(1, Ordering::Relaxed),
            timestamp_ns: monotonic_ns(),
            len,
        };
        let mut record = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
        record.extend_from_slice(&header.to_bytes());
        record.extend_from_slice(payload);

        let outcome = pool.write(&record)?;
        if outcome.sealed {
            self.wake_reader();
        }
        Ok(outcome)
    }

    /// Non-blocking wake request, safe from any producer context
    pub fn wake_reader(&self) {
        self.dev.coalescer.request();
    }
}

impl RecordSink for TraceWriter {
    fn emit(&self, msg_id: u32, payload: &[u8]) {
        match self.write_record(msg_id, payload) {
            Ok(WriteOutcome { stored: false, .. }) => debug!("Record {msg_id:#x} lost, buffer full"),
            Ok(_) => {}
            Err(e) => debug!("Record {msg_id:#x} dropped: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ioctl::{
        encode_buffer_initialize, SWAP_DRIVER_BUFFER_INITIALIZE, SWAP_DRIVER_FLUSH_BUFFER,
        SWAP_DRIVER_MSG, SWAP_DRIVER_WAKE_UP,
    };
    use crate::record::{RecordReader, MSG_WSP};
    use parking_lot::Mutex;
    use std::time::Duration;

    fn init(file: &DeviceFile, size: u32, count: u32) -> Result<(), DeviceError> {
        let arg = encode_buffer_initialize(BufferInitialize { size, count });
        file.ioctl(SWAP_DRIVER_BUFFER_INITIALIZE, &arg)
    }

    #[test]
    fn test_single_opener() {
        let dev = SwapDevice::manual();
        let file = dev.open(false).unwrap();
        assert!(matches!(dev.open(false), Err(DeviceError::Busy)));
        drop(file);
        assert!(dev.open(true).is_ok());
    }

    #[test]
    fn test_initialize_bounds() {
        let dev = SwapDevice::manual();
        let file = dev.open(true).unwrap();
        assert_eq!(init(&file, 65537, 1).unwrap_err().errno(), -libc::ENOSPC);
        assert_eq!(init(&file, 4096, 1_000_001).unwrap_err().errno(), -libc::ENOSPC);
        assert!(dev.pool().is_none());

        init(&file, 65536, 1_000_000).unwrap();
        assert_eq!(dev.pool().unwrap().allocated_bytes(), 0);
        assert_eq!(init(&file, 16, 1).unwrap_err(), DeviceError::AlreadyInitialized);
    }

    #[test]
    fn test_nonblocking_read_would_block() {
        let dev = SwapDevice::manual();
        let file = dev.open(true).unwrap();
        init(&file, 4096, 4).unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(file.read(&mut buf).unwrap_err(), DeviceError::WouldBlock);
    }

    #[test]
    fn test_blocking_read_woken_by_wake_up() {
        let dev = SwapDevice::new();
        let file = dev.open(false).unwrap();
        init(&file, 4096, 4).unwrap();

        let n = std::thread::scope(|s| {
            let reader = s.spawn(|| {
                let mut buf = [0u8; 64];
                let n = file.read(&mut buf).unwrap();
                assert_eq!(&buf[..n], b"queued");
                n
            });
            std::thread::sleep(Duration::from_millis(30));
            // Sealing alone wakes nobody
            let pool = dev.pool().unwrap();
            pool.write(b"queued").unwrap();
            assert!(pool.flush());
            file.ioctl(SWAP_DRIVER_WAKE_UP, &[]).unwrap();
            reader.join().unwrap()
        });
        assert_eq!(n, 6);
        assert_eq!(dev.wake_scheduled(), 1);
    }

    #[test]
    fn test_signal_interrupts_sleeping_reader() {
        let dev = SwapDevice::manual();
        let file = dev.open(false).unwrap();
        init(&file, 4096, 4).unwrap();
        let signal = file.signal_handle();

        let raiser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            signal.raise();
        });
        let mut buf = [0u8; 8];
        assert_eq!(file.read(&mut buf).unwrap_err(), DeviceError::Interrupted);
        raiser.join().unwrap();
    }

    #[test]
    fn test_read_without_pool_returns_zero() {
        let dev = SwapDevice::manual();
        let file = dev.open(false).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(file.read(&mut buf).unwrap(), 0);
        assert_eq!(file.ioctl(SWAP_DRIVER_FLUSH_BUFFER, &[]).unwrap_err(), DeviceError::NotInitialized);
    }

    #[test]
    fn test_writer_frames_records_and_coalesces_wakes() {
        let dev = SwapDevice::manual();
        let file = dev.open(true).unwrap();
        init(&file, 64, 8).unwrap();
        let writer = dev.writer();

        // 20-byte header + 20-byte payload: one record per sub-buffer
        for _ in 0..4 {
            writer.write_record(MSG_WSP, &[9; 20]).unwrap();
        }
        assert_eq!(dev.pool().unwrap().ready_count(), 3);
        assert_eq!(dev.wake_scheduled(), 1);
        assert!(dev.run_pending_wake());
        assert_eq!(dev.wait_queue().wakeups(), 1);

        let mut stream = Vec::new();
        let mut buf = [0u8; 64];
        while let Ok(n) = file.read(&mut buf) {
            stream.extend_from_slice(&buf[..n]);
        }
        let seqs: Vec<u32> =
            RecordReader::new(&stream).map(|r| r.unwrap().header.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_splice_hands_out_pages() {
        let dev = SwapDevice::manual();
        let file = dev.open(true).unwrap();
        init(&file, 65536, 2).unwrap();
        let pool = dev.pool().unwrap();
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 253) as u8).collect();
        pool.write(&data).unwrap();
        pool.flush();

        let mut pipe = PagePipe::new(3);
        assert_eq!(file.splice(&mut pipe, usize::MAX).unwrap(), 3 * PAGE_SIZE);
        assert_eq!(pipe.take_bytes(), data[..3 * PAGE_SIZE]);

        let mut out = WriterPipe::new(Vec::new());
        let rest = file.splice(&mut out, usize::MAX).unwrap();
        assert_eq!(rest, 20_000 - 3 * PAGE_SIZE);
        assert_eq!(out.into_inner(), data[3 * PAGE_SIZE..]);
        assert_eq!(file.splice(&mut pipe, 1).unwrap_err(), DeviceError::WouldBlock);
    }

    #[test]
    fn test_msg_handler() {
        let dev = SwapDevice::manual();
        let file = dev.open(true).unwrap();
        assert_eq!(file.ioctl(SWAP_DRIVER_MSG, b"x").unwrap_err().errno(), -libc::EINVAL);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        dev.set_msg_handler(Arc::new(move |blob: &[u8]| -> Result<(), DeviceError> {
            sink.lock().extend_from_slice(blob);
            Ok(())
        }));
        file.ioctl(SWAP_DRIVER_MSG, b"app=1").unwrap();
        assert_eq!(*seen.lock(), b"app=1");
        // WAKE_UP is deferred like any producer request
        file.ioctl(SWAP_DRIVER_WAKE_UP, &[]).unwrap();
        file.ioctl(SWAP_DRIVER_WAKE_UP, &[]).unwrap();
        assert_eq!(dev.wait_queue().wakeups(), 0);
        assert_eq!(dev.wake_scheduled(), 1);
        assert!(dev.run_pending_wake());
        assert_eq!(dev.wait_queue().wakeups(), 1);
    }
}
