use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError, TrySendError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSendError {
    Full,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRecvError {
    Empty,
    Disconnected,
    Timeout,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub depth: usize,
    pub peak_depth: usize,
    pub capacity: usize,
}

impl QueueStats {
    pub fn is_full(&self) -> bool {
        self.depth >= self.capacity
    }
}

#[derive(Debug)]
struct QueueCounters {
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    capacity: usize,
}

impl QueueCounters {
    fn new(capacity: usize) -> Self {
        Self {
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
            capacity,
        }
    }

    fn reserve(&self) -> usize {
        self.depth.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn commit(&self, depth: usize) {
        self.peak_depth.fetch_max(depth, Ordering::Relaxed);
    }

    fn on_recv(&self) {
        let _ = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |depth| {
                depth.checked_sub(1)
            });
    }

    fn snapshot(&self) -> QueueStats {
        QueueStats {
            depth: self.depth.load(Ordering::Relaxed),
            peak_depth: self.peak_depth.load(Ordering::Relaxed),
            capacity: self.capacity,
        }
    }
}

/// Sending half of a bounded channel whose depth can be read from either
/// side without locking.
#[derive(Debug)]
pub struct BoundedQueueTx<T> {
    inner: SyncSender<T>,
    counters: Arc<QueueCounters>,
}

impl<T> Clone for BoundedQueueTx<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            counters: Arc::clone(&self.counters),
        }
    }
}

#[derive(Debug)]
pub struct BoundedQueueRx<T> {
    inner: Receiver<T>,
    counters: Arc<QueueCounters>,
}

impl<T> BoundedQueueTx<T> {
    pub fn try_send(&self, value: T) -> Result<(), QueueSendError> {
        // Count before handing the value over so the receiver never sees a
        // depth lower than what it can pull.
        let depth = self.counters.reserve();
        match self.inner.try_send(value) {
            Ok(()) => {
                self.counters.commit(depth);
                Ok(())
            }
            Err(err) => {
                self.counters.on_recv();
                match err {
                    TrySendError::Full(_) => Err(QueueSendError::Full),
                    TrySendError::Disconnected(_) => Err(QueueSendError::Disconnected),
                }
            }
        }
    }

    pub fn depth(&self) -> usize {
        self.counters.depth.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> QueueStats {
        self.counters.snapshot()
    }
}

impl<T> BoundedQueueRx<T> {
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, QueueRecvError> {
        match self.inner.recv_timeout(timeout) {
            Ok(item) => {
                self.counters.on_recv();
                Ok(item)
            }
            Err(RecvTimeoutError::Timeout) => Err(QueueRecvError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(QueueRecvError::Disconnected),
        }
    }

    pub fn try_recv(&self) -> Result<T, QueueRecvError> {
        match self.inner.try_recv() {
            Ok(item) => {
                self.counters.on_recv();
                Ok(item)
            }
            Err(TryRecvError::Empty) => Err(QueueRecvError::Empty),
            Err(TryRecvError::Disconnected) => Err(QueueRecvError::Disconnected),
        }
    }

    /// Empties the queue, returning whatever was pending.
    pub fn drain(&self) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(item) = self.try_recv() {
            out.push(item);
        }
        out
    }

    pub fn depth(&self) -> usize {
        self.counters.depth.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> QueueStats {
        self.counters.snapshot()
    }
}

pub fn bounded_queue<T>(capacity: usize) -> (BoundedQueueTx<T>, BoundedQueueRx<T>) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::sync_channel(capacity);
    let counters = Arc::new(QueueCounters::new(capacity));
    (
        BoundedQueueTx {
            inner: tx,
            counters: Arc::clone(&counters),
        },
        BoundedQueueRx {
            inner: rx,
            counters,
        },
    )
}

/// A fixed pool of output buffers shared between the producing worker and
/// the consumer that recycles them.
#[derive(Debug)]
pub struct InFlightCredits {
    capacity: usize,
    used: AtomicUsize,
}

impl InFlightCredits {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            used: AtomicUsize::new(0),
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < self.capacity).then_some(used + 1)
            })
            .is_ok()
    }

    pub fn release(&self, count: usize) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(count))
            });
    }

    pub fn snapshot(&self) -> (usize, usize) {
        (self.used.load(Ordering::Acquire), self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_stats_track_depth_and_peak() {
        let (tx, rx) = bounded_queue::<usize>(2);
        tx.try_send(1).unwrap();
        tx.try_send(2).unwrap();
        assert_eq!(tx.try_send(3), Err(QueueSendError::Full));

        let stats = tx.stats();
        assert_eq!(stats.depth, 2);
        assert_eq!(stats.peak_depth, 2);
        assert!(stats.is_full());

        assert_eq!(rx.try_recv().unwrap(), 1);
        let stats_after = rx.stats();
        assert_eq!(stats_after.depth, 1);
        assert_eq!(stats_after.peak_depth, 2);
        assert!(!stats_after.is_full());
    }

    #[test]
    fn drain_empties_queue() {
        let (tx, rx) = bounded_queue::<u8>(4);
        tx.try_send(7).unwrap();
        tx.try_send(8).unwrap();
        assert_eq!(rx.drain(), vec![7, 8]);
        assert_eq!(rx.depth(), 0);
        assert_eq!(rx.try_recv(), Err(QueueRecvError::Empty));
    }

    #[test]
    fn recv_timeout_reports_timeout_and_disconnect() {
        let (tx, rx) = bounded_queue::<u8>(1);
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(1)),
            Err(QueueRecvError::Timeout)
        );
        drop(tx);
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(1)),
            Err(QueueRecvError::Disconnected)
        );
    }

    #[test]
    fn inflight_credits_work() {
        let credits = InFlightCredits::new(2);
        assert!(credits.try_acquire());
        assert!(credits.try_acquire());
        assert!(!credits.try_acquire());
        assert_eq!(credits.snapshot(), (2, 2));
        credits.release(1);
        assert!(credits.try_acquire());
        credits.release(5);
        assert_eq!(credits.snapshot(), (0, 2));
    }
}
