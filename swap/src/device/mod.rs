//! Trace device
//!
//! Carries framed trace records from probe handlers to a single consumer.
//!
//! - [`buffer`]: sub-buffer pool, records never straddle sub-buffers
//! - [`wake`]: reader wait queue and coalesced producer wake-ups
//! - [`ioctl`]: command set (`BUFFER_INITIALIZE`, `FLUSH_BUFFER`, `MSG`, ...)
//! - [`driver`]: [`SwapDevice`], the reader's [`DeviceFile`] with
//!   `read`/`splice`/`ioctl`, and the producer's [`TraceWriter`]

pub mod buffer;
pub mod driver;
pub mod ioctl;
pub mod wake;

pub use buffer::{BufferPool, PartialPage, WriteOutcome};
pub use driver::{
    DeviceFile, MsgHandler, PagePipe, PipeSink, SignalHandle, SwapDevice, TraceWriter,
    WriterPipe, PAGE_SIZE, PIPE_DEF_BUFFERS,
};
pub use ioctl::{encode_buffer_initialize, BufferInitialize, IoctlCommand};
pub use wake::{WaitQueue, WakeCoalescer};
