use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Counting semaphore used as the start barrier of an iteration.
///
/// Every sink takes one permit before it opens its pipe; the iteration
/// runner releases one permit per stream once all runners are launched.
#[derive(Debug, Default)]
pub struct StartGate {
    permits: Mutex<usize>,
    available: Condvar,
}

impl StartGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn release(&self, count: usize) {
        let Ok(mut permits) = self.permits.lock() else {
            return;
        };
        *permits += count;
        self.available.notify_all();
    }

    pub fn try_acquire(&self) -> bool {
        let Ok(mut permits) = self.permits.lock() else {
            return false;
        };
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Returns `false` if no permit became available within `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let Ok(permits) = self.permits.lock() else {
            return false;
        };
        let Ok((mut permits, _)) = self
            .available
            .wait_timeout_while(permits, timeout, |p| *p == 0)
        else {
            return false;
        };
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Blocks for a permit, giving up once `stop` is raised.
    pub fn acquire_unless(&self, stop: &AtomicBool) -> bool {
        while !stop.load(Ordering::Acquire) {
            if self.acquire_timeout(Duration::from_millis(100)) {
                return true;
            }
        }
        false
    }

    pub fn available(&self) -> usize {
        self.permits.lock().map(|p| *p).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn permits_are_counted() {
        let gate = StartGate::new();
        assert!(!gate.try_acquire());
        gate.release(2);
        assert_eq!(gate.available(), 2);
        assert!(gate.try_acquire());
        assert!(gate.try_acquire());
        assert!(!gate.try_acquire());
    }

    #[test]
    fn release_wakes_every_waiter() {
        let gate = StartGate::shared();
        let stop = Arc::new(AtomicBool::new(false));
        let waiters = (0..4)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let stop = Arc::clone(&stop);
                thread::spawn(move || gate.acquire_unless(&stop))
            })
            .collect::<Vec<_>>();
        thread::sleep(Duration::from_millis(50));
        gate.release(4);
        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
        assert_eq!(gate.available(), 0);
    }

    #[test]
    fn stop_flag_abandons_wait() {
        let gate = StartGate::shared();
        let stop = Arc::new(AtomicBool::new(false));
        let waiter = {
            let gate = Arc::clone(&gate);
            let stop = Arc::clone(&stop);
            thread::spawn(move || gate.acquire_unless(&stop))
        };
        stop.store(true, Ordering::Release);
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn acquire_timeout_expires() {
        let gate = StartGate::new();
        assert!(!gate.acquire_timeout(Duration::from_millis(10)));
    }
}
