use gpu_platform::PlatformInterrupt;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

struct Line {
    pending: bool,
    /// Cleared on delivery, set again by `complete`.
    armed: bool,
    shutdown: bool,
}

/// Level-style interrupt line: one delivery per [`complete`](PlatformInterrupt::complete).
pub struct SimInterrupt {
    line: Mutex<Line>,
    cond: Condvar,
}

impl SimInterrupt {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            line: Mutex::new(Line {
                pending: false,
                armed: true,
                shutdown: false,
            }),
            cond: Condvar::new(),
        })
    }

    /// Assert the line. Called by the device model.
    pub fn raise(&self) {
        self.line.lock().pending = true;
        self.cond.notify_all();
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.line.lock().pending
    }
}

impl PlatformInterrupt for SimInterrupt {
    fn wait(&self) -> bool {
        let mut line = self.line.lock();
        self.cond
            .wait_while(&mut line, |l| !(l.pending && l.armed) && !l.shutdown);
        if line.shutdown {
            return false;
        }
        line.pending = false;
        line.armed = false;
        true
    }

    fn complete(&self) {
        self.line.lock().armed = true;
        self.cond.notify_all();
    }

    fn signal(&self) {
        self.line.lock().shutdown = true;
        self.cond.notify_all();
    }
}
