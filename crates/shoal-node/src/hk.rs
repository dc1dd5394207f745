//! Housekeeper: named periodic tasks
//!
//! One registry, one timer loop. Log flushing, SDM idle eviction,
//! capacity polling and registry GC all hang off this instead of each
//! spawning a private ticker.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

type HkFn = Box<dyn FnMut() + Send>;

struct Task {
    name: &'static str,
    every: Duration,
    next: Instant,
    f: HkFn,
}

#[derive(Default)]
pub struct Housekeeper {
    tasks: Mutex<Vec<Task>>,
}

impl Housekeeper {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, name: &'static str, every: Duration, f: impl FnMut() + Send + 'static) {
        debug!(name, ?every, "housekeeper: registered");
        self.tasks.lock().push(Task {
            name,
            every,
            next: Instant::now() + every,
            f: Box::new(f),
        });
    }

    /// Run everything due; returns the number of tasks that fired.
    pub fn tick(&self) -> usize {
        let now = Instant::now();
        let mut fired = 0;
        let mut tasks = self.tasks.lock();
        for task in tasks.iter_mut() {
            if now >= task.next {
                (task.f)();
                task.next = now + task.every;
                fired += 1;
            }
        }
        fired
    }

    /// Background loop; lives until the node exits.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                this.tick();
            }
        })
    }

    #[must_use]
    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.lock().iter().map(|t| t.name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_due_tasks_fire_on_cadence() {
        let hk = Housekeeper::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        hk.register("test-task", Duration::ZERO, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let slow = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&slow);
        hk.register("slow-task", Duration::from_secs(3600), move || {
            s.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(hk.tick(), 1);
        assert_eq!(hk.tick(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(slow.load(Ordering::SeqCst), 0, "not due for an hour");
        assert_eq!(hk.task_names(), ["test-task", "slow-task"]);
    }
}
