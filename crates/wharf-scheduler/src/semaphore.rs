//! A hand-rolled counting semaphore bounding `max_parallel` concurrent worker threads.
//!
//! The claim loop's fan-out isn't level-synchronized (packages become ready continuously
//! as their dependencies finish), so a fixed-size chunk-and-join batch doesn't fit; a
//! semaphore lets workers start the instant a slot frees up.

use std::sync::{Arc, Condvar, Mutex};

struct Inner {
    available: Mutex<usize>,
    condvar: Condvar,
}

#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<Inner>,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self { inner: Arc::new(Inner { available: Mutex::new(permits), condvar: Condvar::new() }) }
    }

    /// Blocks until a permit is available, returning a guard that releases it on drop.
    pub fn acquire(&self) -> SemaphorePermit {
        let mut available = self.inner.available.lock().unwrap();
        while *available == 0 {
            available = self.inner.condvar.wait(available).unwrap();
        }
        *available -= 1;
        SemaphorePermit { inner: Arc::clone(&self.inner) }
    }
}

pub struct SemaphorePermit {
    inner: Arc<Inner>,
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        let mut available = self.inner.available.lock().unwrap();
        *available += 1;
        self.inner.condvar.notify_one();
    }
}
