//! Handle pools
//!
//! LOMs (and other hot-path handles) are acquired and released in large
//! numbers; pooling keeps them off the allocator. Freed handles are reset
//! before they are parked.

use parking_lot::Mutex;

pub struct Pool<T> {
    free: Mutex<Vec<Box<T>>>,
    max: usize,
}

impl<T: Default> Pool<T> {
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max,
        }
    }

    pub fn alloc(&self) -> Box<T> {
        self.free.lock().pop().unwrap_or_default()
    }

    /// Reset and park; drops the handle when the pool is full.
    pub fn free(&self, mut item: Box<T>, reset: impl FnOnce(&mut T)) {
        reset(&mut item);
        let mut free = self.free.lock();
        if free.len() < self.max {
            free.push(item);
        }
    }

    #[must_use]
    pub fn parked(&self) -> usize {
        self.free.lock().len()
    }
}
