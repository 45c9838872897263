use crate::PlatformSemaphore;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static NEXT_SEMAPHORE_ID: AtomicU64 = AtomicU64::new(1);

/// Binary semaphore built on a mutex and condition variable.
pub struct FakeSemaphore {
    id: u64,
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl FakeSemaphore {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SEMAPHORE_ID.fetch_add(1, Ordering::Relaxed),
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        })
    }
}

impl PlatformSemaphore for FakeSemaphore {
    fn id(&self) -> u64 {
        self.id
    }

    fn signal(&self) {
        *self.signaled.lock() = true;
        self.cond.notify_all();
    }

    fn reset(&self) {
        *self.signaled.lock() = false;
    }

    fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }

    fn wait(&self, timeout: Duration) -> bool {
        let mut signaled = self.signaled.lock();
        if !*signaled {
            let _ = self.cond.wait_while_for(&mut signaled, |s| !*s, timeout);
        }
        *signaled
    }
}
