//! Small synchronization primitives for the device lifecycle.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// An auto-reset event.
///
/// `signal` releases exactly one waiter (or the next one to arrive); the
/// event then rearms itself. Used for the start/stop acknowledgements and the
/// worker wakeup, where every signal pairs with exactly one wait.
#[derive(Default)]
pub(crate) struct AutoResetEvent {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl AutoResetEvent {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Signals the event, releasing one pending or future waiter.
    pub(crate) fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cond.notify_one();
    }

    /// Blocks until the event is signaled, then rearms it.
    pub(crate) fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.cond.wait(&mut signaled);
        }
        *signaled = false;
    }

    /// Blocks until the event is signaled or `timeout` elapses.
    ///
    /// Returns true if the event was consumed, false on timeout.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut signaled = self.signaled.lock();
        while !*signaled {
            if self.cond.wait_until(&mut signaled, deadline).timed_out() {
                break;
            }
        }
        let was_signaled = *signaled;
        *signaled = false;
        was_signaled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_signal_before_wait_is_consumed() {
        let event = AutoResetEvent::new();
        event.signal();
        assert!(event.wait_timeout(Duration::from_millis(0)));
        // Rearmed: a second wait times out.
        assert!(!event.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_wait_timeout_expires() {
        let event = AutoResetEvent::new();
        let started = Instant::now();
        assert!(!event.wait_timeout(Duration::from_millis(10)));
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_cross_thread_wakeup() {
        let event = Arc::new(AutoResetEvent::new());
        let waiter = {
            let event = Arc::clone(&event);
            std::thread::spawn(move || event.wait())
        };
        std::thread::sleep(Duration::from_millis(5));
        event.signal();
        waiter.join().unwrap();
    }

    #[test]
    fn test_each_signal_releases_one_waiter() {
        let event = Arc::new(AutoResetEvent::new());
        event.signal();
        event.signal(); // coalesces with the first; still one release
        assert!(event.wait_timeout(Duration::from_millis(0)));
        assert!(!event.wait_timeout(Duration::from_millis(1)));
    }
}
