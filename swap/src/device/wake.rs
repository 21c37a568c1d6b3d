//! Reader wait queue and producer wake-up coalescing
//!
//! Producers never touch the wait queue. [`WakeCoalescer::request`] sets an
//! atomic flag and, on the flag's rising edge only, posts one work item to
//! a single-slot channel. The worker clears the flag and wakes the queue,
//! so any number of requests made before it runs cost one wake-up.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Interruptible sleep for the device reader
///
/// Sleepers snapshot the generation, re-check their condition, then wait
/// for the generation to move; a wake between the check and the wait is
/// never lost.
#[derive(Default)]
pub struct WaitQueue {
    generation: Mutex<u64>,
    cond: Condvar,
    wakeups: AtomicU64,
}

impl WaitQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    /// Block until a wake-up after `seen`
    pub fn wait_from(&self, seen: u64) {
        let mut generation = self.generation.lock();
        while *generation == seen {
            self.cond.wait(&mut generation);
        }
    }

    pub fn wake_all(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.wakeups.fetch_add(1, Ordering::Relaxed);
        self.cond.notify_all();
    }

    /// Wake-up cycles so far
    #[must_use]
    pub fn wakeups(&self) -> u64 {
        self.wakeups.load(Ordering::Relaxed)
    }
}

fn run_work(pending: &AtomicBool, queue: &WaitQueue) -> bool {
    if pending.swap(false, Ordering::AcqRel) {
        queue.wake_all();
        return true;
    }
    false
}

/// Deferred, coalesced wake-up of a [`WaitQueue`]
pub struct WakeCoalescer {
    pending: Arc<AtomicBool>,
    queue: Arc<WaitQueue>,
    work: Option<Sender<()>>,
    /// Held here in manual mode, by the worker otherwise
    manual_rx: Option<Receiver<()>>,
    worker: Option<JoinHandle<()>>,
    scheduled: AtomicU64,
}

impl WakeCoalescer {
    /// Coalescer with a dedicated worker thread
    #[must_use]
    pub fn spawn(queue: Arc<WaitQueue>) -> Self {
        let (tx, rx) = bounded::<()>(1);
        let pending = Arc::new(AtomicBool::new(false));
        let worker = {
            let pending = Arc::clone(&pending);
            let queue = Arc::clone(&queue);
            std::thread::Builder::new()
                .name("swap-wake".into())
                .spawn(move || {
                    for () in &rx {
                        run_work(&pending, &queue);
                    }
                    debug!("Wake worker exiting");
                })
                .map_err(|e| warn!("Failed to spawn wake worker, falling back to manual: {e}"))
                .ok()
        };
        match worker {
            Some(handle) => Self {
                pending,
                queue,
                work: Some(tx),
                manual_rx: None,
                worker: Some(handle),
                scheduled: AtomicU64::new(0),
            },
            None => Self::manual(queue),
        }
    }

    /// Coalescer whose work item only runs through [`WakeCoalescer::run_pending`]
    #[must_use]
    pub fn manual(queue: Arc<WaitQueue>) -> Self {
        let (tx, rx) = bounded::<()>(1);
        Self {
            pending: Arc::new(AtomicBool::new(false)),
            queue,
            work: Some(tx),
            manual_rx: Some(rx),
            worker: None,
            scheduled: AtomicU64::new(0),
        }
    }

    /// Ask for the reader to be woken; never blocks
    pub fn request(&self) {
        if self.pending.swap(true, Ordering::AcqRel) {
            return;
        }
        self.scheduled.fetch_add(1, Ordering::Relaxed);
        if let Some(work) = &self.work {
            match work.try_send(()) {
                // Already queued work will see the flag
                Ok(()) | Err(TrySendError::Full(())) => {}
                Err(TrySendError::Disconnected(())) => warn!("Wake worker is gone"),
            }
        }
    }

    /// Run the queued work item, if any (manual mode)
    ///
    /// Returns `true` if the queue was woken.
    pub fn run_pending(&self) -> bool {
        match &self.manual_rx {
            Some(rx) if rx.try_recv().is_ok() => run_work(&self.pending, &self.queue),
            _ => false,
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Rising edges of the pending flag so far
    #[must_use]
    pub fn scheduled(&self) -> u64 {
        self.scheduled.load(Ordering::Relaxed)
    }
}

impl Drop for WakeCoalescer {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop
        self.work.take();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("Wake worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_requests_coalesce_into_one_wakeup() {
        let queue = Arc::new(WaitQueue::new());
        let coalescer = WakeCoalescer::manual(Arc::clone(&queue));

        for _ in 0..1000 {
            coalescer.request();
        }
        assert!(coalescer.is_pending());
        assert_eq!(coalescer.scheduled(), 1);

        assert!(coalescer.run_pending());
        assert!(!coalescer.is_pending());
        assert_eq!(queue.wakeups(), 1);
        assert!(!coalescer.run_pending());
        assert_eq!(queue.wakeups(), 1);

        // The next burst schedules again
        coalescer.request();
        coalescer.request();
        assert_eq!(coalescer.scheduled(), 2);
        assert!(coalescer.run_pending());
        assert_eq!(queue.wakeups(), 2);
    }

    #[test]
    fn test_wait_from_returns_after_wake() {
        let queue = Arc::new(WaitQueue::new());
        let seen = queue.generation();
        let sleeper = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.wait_from(seen))
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.wake_all();
        sleeper.join().unwrap();

        // A stale snapshot does not sleep
        queue.wait_from(seen);
    }

    #[test]
    fn test_worker_wakes_queue() {
        let queue = Arc::new(WaitQueue::new());
        let coalescer = WakeCoalescer::spawn(Arc::clone(&queue));
        coalescer.request();

        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.wakeups() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(queue.wakeups(), 1);
        drop(coalescer);
    }
}
