use core::{future::poll_fn, task::Poll};

use portable_atomic::{AtomicUsize, Ordering};

use atomic_waker::AtomicWaker;

/// A synchronization primitive, which allows queueing a number signals, to be awaited.
///
/// The data path never blocks. Whenever it runs out of a resource, it puts a signal into one of
/// these, so that a worker can retry once it makes sense.
pub struct SignalQueue {
    waker: AtomicWaker,
    queued_signals: AtomicUsize,
}
impl SignalQueue {
    pub const fn new() -> Self {
        Self {
            waker: AtomicWaker::new(),
            queued_signals: AtomicUsize::new(0),
        }
    }
    /// Increments the queue signals by one.
    pub fn put(&self) {
        self.queued_signals.fetch_add(1, Ordering::Relaxed);
        self.waker.wake();
    }
    /// Reset the amount of signals in the queue back to zero.
    pub fn reset(&self) {
        self.queued_signals.store(0, Ordering::Relaxed);
    }
    /// The amount of signals currently queued.
    pub fn pending(&self) -> usize {
        self.queued_signals.load(Ordering::Relaxed)
    }
    /// Take a signal without waiting.
    pub fn try_take(&self) -> bool {
        self.queued_signals
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |queued| {
                queued.checked_sub(1)
            })
            .is_ok()
    }
    /// Take all queued signals at once, returning how many there were.
    pub fn take_all(&self) -> usize {
        self.queued_signals.swap(0, Ordering::Relaxed)
    }
    /// Asynchronously wait for the next signal.
    pub async fn next(&self) {
        poll_fn(|cx| {
            if self.try_take() {
                Poll::Ready(())
            } else {
                self.waker.register(cx.waker());
                // A signal may have arrived between the check and the registration.
                if self.try_take() {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            }
        })
        .await
    }
}
impl Default for SignalQueue {
    fn default() -> Self {
        Self::new()
    }
}
