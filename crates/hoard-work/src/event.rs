use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Manual-reset event: once set, every waiter passes until `reset`.
#[derive(Default)]
pub struct Event {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.condvar.notify_all();
    }

    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.signaled.lock()
    }

    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.condvar.wait(&mut signaled);
        }
    }

    /// Returns false if the timeout elapsed before the event was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut signaled = self.signaled.lock();
        if *signaled {
            return true;
        }
        let _ = self
            .condvar
            .wait_while_for(&mut signaled, |signaled| !*signaled, timeout);
        *signaled
    }
}
