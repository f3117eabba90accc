use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    time::Duration,
};

use super::clock::{Clock, Monotonic, Time};

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

/// Cooperative cancellation shared between a worker thread and its owner
///
/// Cancelling wakes every thread currently sleeping through [`CancellationToken::sleep`]
/// or [`CancellationToken::sleep_until`], so worker shutdown never waits for a full
/// timer period.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<Inner>);

impl CancellationToken {
    /// Create a new, not yet cancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake all sleepers
    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        let _guard = self.0.lock.lock().unwrap();
        self.0.cond.notify_all();
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` or until cancelled
    ///
    /// Returns `true` if the token got cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let guard = self.0.lock.lock().unwrap();
        if self.is_cancelled() {
            return true;
        }
        let _ = self
            .0
            .cond
            .wait_timeout_while(guard, duration, |_| !self.is_cancelled())
            .unwrap();
        self.is_cancelled()
    }

    /// Sleep until the absolute monotonic `deadline` or until cancelled
    ///
    /// Returns `true` if the token got cancelled.
    pub fn sleep_until(&self, clock: &Clock<Monotonic>, deadline: Time<Monotonic>) -> bool {
        loop {
            let now = clock.now();
            if now >= deadline {
                return self.is_cancelled();
            }
            if self.sleep(now.duration_since(deadline)) {
                return true;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use super::CancellationToken;

    #[test]
    fn sleep_runs_to_timeout() {
        let token = CancellationToken::new();
        let start = Instant::now();
        assert!(!token.sleep(Duration::from_millis(10)));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn cancel_wakes_sleeper() {
        let token = CancellationToken::new();
        let sleeper = token.clone();
        let start = Instant::now();
        let handle = std::thread::spawn(move || sleeper.sleep(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(handle.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
