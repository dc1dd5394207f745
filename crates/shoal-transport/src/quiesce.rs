//! Quiescence polling
//!
//! Long-running jobs call [`quiesce`] to wait until their callback
//! reports a full window of inactivity (or a terminal verdict).

use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuiRes {
    /// Traffic seen; the inactivity window restarts.
    Active,
    /// Nothing in flight this tick.
    Inactive,
    /// Terminal: the callback decided we are done.
    Done,
    /// Terminal: the associated xaction aborted.
    Aborted,
    /// The total budget elapsed without a full quiet window.
    Timeout,
}

/// Poll `cb` every `tick` until it stays `Inactive` for a full
/// `window`, it returns a terminal verdict, or `total` elapses.
pub async fn quiesce(
    total: Duration,
    window: Duration,
    tick: Duration,
    mut cb: impl FnMut(Duration) -> QuiRes,
) -> QuiRes {
    let started = Instant::now();
    let mut quiet_since: Option<Instant> = None;
    loop {
        let elapsed = started.elapsed();
        if elapsed >= total {
            return QuiRes::Timeout;
        }
        match cb(elapsed) {
            QuiRes::Done => return QuiRes::Done,
            QuiRes::Aborted => return QuiRes::Aborted,
            QuiRes::Timeout => return QuiRes::Timeout,
            QuiRes::Active => quiet_since = None,
            QuiRes::Inactive => {
                let since = *quiet_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= window {
                    return QuiRes::Done;
                }
            }
        }
        tokio::time::sleep(tick).await;
    }
}
