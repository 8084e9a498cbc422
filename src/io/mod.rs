use crate::error::{RecvError, SendError, TryRecvError};
use crate::utils::CancelToken;
use crossbeam::channel as cbchan;
use crossbeam::utils::Backoff;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Bounded semaphore-gated FIFO shared between worker threads.
///
/// This is the hand-off primitive for the publisher queue, the deferred-put
/// queue and the lossless in-process transport: blocking `put`/`get` with
/// timeout variants, and a `release` that wakes every waiting getter so
/// workers can unwind during shutdown.
///
/// Waits escalate spin → yield → sleep instead of parking on a condvar, so
/// the hot path stays allocation- and syscall-free.
pub struct Fifo<T> {
    tx: cbchan::Sender<T>,
    rx: cbchan::Receiver<T>,
    released: Arc<AtomicBool>,
    never_cancel: CancelToken,
}

impl<T> Clone for Fifo<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            released: self.released.clone(),
            never_cancel: self.never_cancel.clone(),
        }
    }
}

impl<T: Send + 'static> Fifo<T> {
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = cbchan::bounded::<T>(capacity.max(1));
        Self {
            tx,
            rx,
            released: Arc::new(AtomicBool::new(false)),
            never_cancel: CancelToken::new_root(),
        }
    }

    #[inline]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Release the fifo: pending items are still drained, after which every
    /// `get` returns `Disconnected` and every `put` is refused.
    pub fn release(&self) {
        self.released.store(true, Ordering::Release);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Non-blocking put.
    #[inline]
    pub fn try_put(&self, v: T) -> Result<(), SendError<T>> {
        if self.is_released() {
            return Err(SendError::released(Some(v)));
        }
        match self.tx.try_send(v) {
            Ok(()) => Ok(()),
            Err(cbchan::TrySendError::Full(v)) => Err(SendError::full(Some(v))),
            Err(cbchan::TrySendError::Disconnected(v)) => Err(SendError::released(Some(v))),
        }
    }

    /// Blocking put, bounded by cancellation and an optional timeout.
    pub fn put(
        &self,
        mut v: T,
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> Result<(), SendError<T>> {
        let start = Instant::now();
        let backoff = Backoff::new();
        let mut spins: u32 = 0;

        loop {
            if self.is_released() {
                return Err(SendError::released(Some(v)));
            }
            if cancel.is_cancelled() {
                return Err(SendError::cancelled(Some(v)));
            }
            if let Some(t) = timeout
                && start.elapsed() >= t
            {
                return Err(SendError::timeout(Some(v)));
            }

            match self.tx.try_send(v) {
                Ok(()) => return Ok(()),
                Err(cbchan::TrySendError::Full(vv)) => {
                    v = vv;
                    spins = spins.saturating_add(1);
                    if spins < 64 {
                        backoff.spin();
                    } else if spins < 256 {
                        backoff.snooze();
                    } else {
                        thread::sleep(Duration::from_micros(2));
                    }
                }
                Err(cbchan::TrySendError::Disconnected(vv)) => {
                    return Err(SendError::released(Some(vv)));
                }
            }
        }
    }

    #[inline]
    pub fn try_get(&self) -> Result<T, TryRecvError> {
        match self.rx.try_recv() {
            Ok(v) => Ok(v),
            Err(cbchan::TryRecvError::Empty) => {
                if self.is_released() {
                    Err(TryRecvError::Disconnected)
                } else {
                    Err(TryRecvError::Empty)
                }
            }
            Err(cbchan::TryRecvError::Disconnected) => Err(TryRecvError::Disconnected),
        }
    }

    /// Blocking get. Returns `Disconnected` once the fifo is released and
    /// drained, `Cancelled`/`Timeout` per the bounds given.
    pub fn get(&self, cancel: &CancelToken, timeout: Option<Duration>) -> Result<T, RecvError> {
        let start = Instant::now();
        let backoff = Backoff::new();
        let mut spins: u32 = 0;

        loop {
            match self.try_get() {
                Ok(v) => return Ok(v),
                Err(TryRecvError::Disconnected) => return Err(RecvError::Disconnected),
                Err(TryRecvError::Empty) => {}
            }

            if cancel.is_cancelled() {
                return Err(RecvError::Cancelled);
            }
            if let Some(t) = timeout
                && start.elapsed() >= t
            {
                return Err(RecvError::Timeout);
            }

            spins = spins.saturating_add(1);
            if spins < 64 {
                backoff.spin();
            } else if spins < 256 {
                backoff.snooze();
            } else {
                thread::sleep(Duration::from_micros(2));
            }
        }
    }

    /// Get bounded by a timeout only.
    #[inline]
    pub fn timed_get(&self, timeout: Duration) -> Result<T, RecvError> {
        self.get(&self.never_cancel, Some(timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_preserves_order() {
        let q = Fifo::bounded(8);
        for i in 0..5 {
            q.try_put(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(q.timed_get(Duration::from_millis(100)).unwrap(), i);
        }
    }

    #[test]
    fn full_fifo_rejects_try_put() {
        let q = Fifo::bounded(2);
        q.try_put(1).unwrap();
        q.try_put(2).unwrap();
        let err = q.try_put(3).unwrap_err();
        assert_eq!(err.reason, crate::error::SendFailReason::Full);
        assert_eq!(err.value, Some(3));
    }

    #[test]
    fn release_drains_then_disconnects() {
        let q = Fifo::bounded(4);
        q.try_put("a").unwrap();
        q.release();
        assert_eq!(q.timed_get(Duration::from_millis(50)).unwrap(), "a");
        assert_eq!(
            q.timed_get(Duration::from_millis(50)).unwrap_err(),
            RecvError::Disconnected
        );
        assert!(q.try_put("b").is_err());
    }

    #[test]
    fn timed_get_times_out_when_empty() {
        let q: Fifo<u8> = Fifo::bounded(1);
        let start = Instant::now();
        assert_eq!(
            q.timed_get(Duration::from_millis(30)).unwrap_err(),
            RecvError::Timeout
        );
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn blocking_get_sees_cross_thread_put() {
        let q = Fifo::bounded(1);
        let q2 = q.clone();
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            q2.try_put(42u32).unwrap();
        });
        assert_eq!(q.timed_get(Duration::from_secs(1)).unwrap(), 42);
        h.join().unwrap();
    }

    #[test]
    fn cancelled_get_returns_cancelled() {
        let q: Fifo<u8> = Fifo::bounded(1);
        let cancel = CancelToken::new_root();
        cancel.cancel();
        assert_eq!(q.get(&cancel, None).unwrap_err(), RecvError::Cancelled);
    }
}
