use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Counting semaphore built on a parking mutex and condition variable.
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            available: Condvar::new(),
        }
    }

    pub fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.available.notify_one();
    }

    /// Blocks until a permit is available, then takes it.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.available.wait(&mut count);
        }
        *count -= 1;
    }

    /// Takes a permit without blocking. Returns `false` when none is available.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    pub fn permits(&self) -> usize {
        *self.count.lock()
    }
}

/// Level-triggered wait on a shared counter, replacing a spin/yield loop.
#[derive(Debug, Default)]
pub(crate) struct Gate {
    lock: Mutex<()>,
    changed: Condvar,
}

impl Gate {
    pub(crate) fn notify_all(&self) {
        let _guard = self.lock.lock();
        self.changed.notify_all();
    }

    /// Parks until `ready` returns true. `ready` is re-evaluated on every
    /// notification and at least once per millisecond.
    pub(crate) fn wait_until(&self, mut ready: impl FnMut() -> bool) {
        let mut guard = self.lock.lock();
        while !ready() {
            self.changed
                .wait_for(&mut guard, Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn try_wait_does_not_block_when_empty() {
        let sem = Semaphore::new(1);
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
        sem.post();
        assert_eq!(sem.permits(), 1);
    }

    #[test]
    fn post_releases_waiting_thread() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.wait())
        };
        sem.post();
        waiter.join().expect("waiter thread panicked");
        assert_eq!(sem.permits(), 0);
    }
}
