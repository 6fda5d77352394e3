// src/sync.rs
//! Scoped locking and a counting semaphore for the task queue.
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if another thread panicked while
/// holding it. The queues guarded here stay structurally valid across a
/// panic, so poisoning carries no information for them.
#[inline]
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counting semaphore built from a mutex and a condition variable.
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    /// Block until a permit is available, then take it.
    pub fn wait(&self) {
        let mut permits = lock(&self.permits);
        while *permits == 0 {
            permits = self
                .available
                .wait(permits)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *permits -= 1;
    }

    pub fn post(&self) {
        self.post_n(1);
    }

    pub fn post_n(&self, n: usize) {
        let mut permits = lock(&self.permits);
        *permits += n;
        if n == 1 {
            self.available.notify_one();
        } else {
            self.available.notify_all();
        }
    }
}
