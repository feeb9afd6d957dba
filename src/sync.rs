use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// A clonable counter that can be awaited down to zero.
///
/// Publishers increment it when they take a reference to a subscriber
/// connection and decrement it once the delivery handoff is observable;
/// the connection's close path waits for zero before tearing down. Also
/// used to await completion of fan-out shard tasks.
#[derive(Clone)]
pub struct BlockingCounter {
    inner: Arc<Inner>,
}

struct Inner {
    count: Mutex<u64>,
    zero: Condvar,
}

impl BlockingCounter {
    pub fn new(initial: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                count: Mutex::new(initial),
                zero: Condvar::new(),
            }),
        }
    }

    pub fn inc(&self) {
        *self.inner.count.lock() += 1;
    }

    pub fn dec(&self) {
        let mut count = self.inner.count.lock();
        debug_assert!(*count > 0, "counter underflow");
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.inner.zero.notify_all();
        }
    }

    /// Block until the counter reaches zero.
    pub fn wait(&self) {
        let mut count = self.inner.count.lock();
        while *count > 0 {
            self.inner.zero.wait(&mut count);
        }
    }

    pub fn get(&self) -> u64 {
        *self.inner.count.lock()
    }
}

impl Default for BlockingCounter {
    fn default() -> Self {
        Self::new(0)
    }
}
