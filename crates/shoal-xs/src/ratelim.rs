//! Rate limiting for copy and prefetch traffic
//!
//! Frontend-facing work draws from a bursty token bucket configured per
//! bucket; backend GET/PUT traffic adds an adaptive delay that reacts to
//! 429/503 from the provider and decays on success.

use parking_lot::Mutex;
use shoal_common::types::RateLimitConf;
use std::time::{Duration, Instant};

pub struct TokenBucket {
    inner: Mutex<BucketState>,
    per_sec: f64,
    cap: f64,
}

struct BucketState {
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    /// `None` when the config disables limiting.
    #[must_use]
    pub fn from_conf(conf: &RateLimitConf) -> Option<Self> {
        if !conf.enabled || conf.per_sec == 0 {
            return None;
        }
        let cap = f64::from(conf.burst.max(1));
        Some(Self {
            inner: Mutex::new(BucketState {
                tokens: cap,
                last: Instant::now(),
            }),
            per_sec: f64::from(conf.per_sec),
            cap,
        })
    }

    /// Take one token; returns how long the caller must wait first.
    #[must_use]
    pub fn acquire(&self) -> Duration {
        let mut st = self.inner.lock();
        let now = Instant::now();
        st.tokens = (st.tokens + now.duration_since(st.last).as_secs_f64() * self.per_sec)
            .min(self.cap);
        st.last = now;
        if st.tokens >= 1.0 {
            st.tokens -= 1.0;
            Duration::ZERO
        } else {
            let deficit = 1.0 - st.tokens;
            st.tokens = 0.0;
            Duration::from_secs_f64(deficit / self.per_sec)
        }
    }
}

const ADAPTIVE_FLOOR: Duration = Duration::from_millis(100);
const ADAPTIVE_CEIL: Duration = Duration::from_secs(30);

/// Backoff that doubles on 429/503 and halves on success.
#[derive(Default)]
pub struct AdaptiveLim {
    delay: Mutex<Duration>,
}

impl AdaptiveLim {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn current(&self) -> Duration {
        *self.delay.lock()
    }

    pub fn on_transient_err(&self) {
        let mut d = self.delay.lock();
        *d = if d.is_zero() {
            ADAPTIVE_FLOOR
        } else {
            (*d * 2).min(ADAPTIVE_CEIL)
        };
    }

    pub fn on_ok(&self) {
        let mut d = self.delay.lock();
        if *d < ADAPTIVE_FLOOR {
            *d = Duration::ZERO;
        } else {
            *d /= 2;
        }
    }

    pub async fn pace(&self) {
        let d = self.current();
        if !d.is_zero() {
            tokio::time::sleep(d).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_burst_then_throttle() {
        let tb = TokenBucket::from_conf(&RateLimitConf {
            enabled: true,
            burst: 3,
            per_sec: 10,
        })
        .unwrap();
        assert_eq!(tb.acquire(), Duration::ZERO);
        assert_eq!(tb.acquire(), Duration::ZERO);
        assert_eq!(tb.acquire(), Duration::ZERO);
        let wait = tb.acquire();
        assert!(wait > Duration::ZERO && wait <= Duration::from_millis(110));
    }

    #[test]
    fn test_disabled_conf() {
        assert!(TokenBucket::from_conf(&RateLimitConf::default()).is_none());
    }

    #[test]
    fn test_adaptive_doubles_and_decays() {
        let lim = AdaptiveLim::new();
        assert!(lim.current().is_zero());
        lim.on_transient_err();
        assert_eq!(lim.current(), ADAPTIVE_FLOOR);
        lim.on_transient_err();
        assert_eq!(lim.current(), ADAPTIVE_FLOOR * 2);
        for _ in 0..20 {
            lim.on_transient_err();
        }
        assert_eq!(lim.current(), ADAPTIVE_CEIL, "capped");
        lim.on_ok();
        assert_eq!(lim.current(), ADAPTIVE_CEIL / 2);
        for _ in 0..20 {
            lim.on_ok();
        }
        assert!(lim.current().is_zero(), "fully decayed");
    }
}
