//! Striped name-locker
//!
//! A fixed-size array of lock shards indexed by the uname's 64-bit
//! digest — not one lock per object. Readers-writer semantics; digest
//! collisions merely over-serialize, which is harmless.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;

const SHARD_COUNT: usize = 256;

#[derive(Default)]
struct LockState {
    readers: u32,
    writer: bool,
    waiters: u32,
}

struct Shard {
    m: Mutex<HashMap<u64, LockState>>,
    cv: Condvar,
}

pub struct NameLocker {
    shards: Vec<Shard>,
}

impl Default for NameLocker {
    fn default() -> Self {
        Self::new()
    }
}

impl NameLocker {
    #[must_use]
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Shard {
                m: Mutex::new(HashMap::new()),
                cv: Condvar::new(),
            })
            .collect();
        Self { shards }
    }

    fn shard(&self, digest: u64) -> &Shard {
        &self.shards[(digest as usize) & (SHARD_COUNT - 1)]
    }

    /// Block until the lock is acquired.
    pub fn lock(&self, digest: u64, exclusive: bool) {
        let shard = self.shard(digest);
        let mut m = shard.m.lock();
        loop {
            let st = m.entry(digest).or_default();
            let free = if exclusive {
                !st.writer && st.readers == 0
            } else {
                !st.writer
            };
            if free {
                if exclusive {
                    st.writer = true;
                } else {
                    st.readers += 1;
                }
                return;
            }
            st.waiters += 1;
            shard.cv.wait(&mut m);
            m.entry(digest).or_default().waiters -= 1;
        }
    }

    /// Non-blocking acquire; `false` when busy.
    pub fn try_lock(&self, digest: u64, exclusive: bool) -> bool {
        let shard = self.shard(digest);
        let mut m = shard.m.lock();
        let st = m.entry(digest).or_default();
        if exclusive {
            if st.writer || st.readers > 0 {
                return false;
            }
            st.writer = true;
        } else {
            if st.writer {
                return false;
            }
            st.readers += 1;
        }
        true
    }

    pub fn unlock(&self, digest: u64, exclusive: bool) {
        let shard = self.shard(digest);
        let mut m = shard.m.lock();
        let st = m.get_mut(&digest).expect("unlock of a lock never taken");
        if exclusive {
            debug_assert!(st.writer);
            st.writer = false;
        } else {
            debug_assert!(st.readers > 0);
            st.readers -= 1;
        }
        let idle = !st.writer && st.readers == 0;
        let waiters = st.waiters;
        if idle && waiters == 0 {
            m.remove(&digest);
        }
        drop(m);
        if waiters > 0 {
            shard.cv.notify_all();
        }
    }

    /// Exclusive → shared without a release window.
    pub fn downgrade(&self, digest: u64) {
        let shard = self.shard(digest);
        let mut m = shard.m.lock();
        let st = m.get_mut(&digest).expect("downgrade of a lock never taken");
        debug_assert!(st.writer);
        st.writer = false;
        st.readers += 1;
        let waiters = st.waiters;
        drop(m);
        if waiters > 0 {
            shard.cv.notify_all();
        }
    }
}

/// RAII guard for scoped acquisition.
pub struct LockGuard<'a> {
    locker: &'a NameLocker,
    digest: u64,
    exclusive: bool,
}

impl<'a> LockGuard<'a> {
    pub fn lock(locker: &'a NameLocker, digest: u64, exclusive: bool) -> Self {
        locker.lock(digest, exclusive);
        Self {
            locker,
            digest,
            exclusive,
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.locker.unlock(self.digest, self.exclusive);
    }
}
