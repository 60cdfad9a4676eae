//! One-shot latch: opened once, waited on with a bound.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

pub(crate) struct Latch {
    opened: Mutex<bool>,
    cv: Condvar,
}

impl Latch {
    pub fn new() -> Latch {
        Latch {
            opened: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn open(&self) {
        *self.opened.lock() = true;
        self.cv.notify_all();
    }

    pub fn is_open(&self) -> bool {
        *self.opened.lock()
    }

    /// Wait until the latch opens. Returns false on timeout.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut opened = self.opened.lock();
        while !*opened {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.cv.wait_for(&mut opened, deadline - now);
        }
        true
    }
}
