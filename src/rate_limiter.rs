//! Dual sliding-window limiter for outbound API calls.
//!
//! Each admitted call is stamped into a 1-second and a 60-second window.
//! A call is admitted only when both windows have room; otherwise the caller
//! sleeps in fixed increments and re-checks. Admission is never refused.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::RateLimitConfig;

const SHORT_HORIZON: Duration = Duration::from_secs(1);
const LONG_HORIZON: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct RateWindow {
    horizon: Duration,
    max: usize,
    calls: VecDeque<Instant>,
}

impl RateWindow {
    fn new(horizon: Duration, max: usize) -> Self {
        Self {
            horizon,
            // A zero budget would block forever.
            max: max.max(1),
            calls: VecDeque::new(),
        }
    }

    /// Drop every stamp at or beyond the horizon.
    fn evict(&mut self, now: Instant) {
        while let Some(&oldest) = self.calls.front() {
            if now.duration_since(oldest) >= self.horizon {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }

    fn has_capacity(&self) -> bool {
        self.calls.len() < self.max
    }
}

#[derive(Debug)]
struct Windows {
    second: RateWindow,
    minute: RateWindow,
}

impl Windows {
    /// Evict, then stamp `now` into both windows if both have room.
    fn try_admit(&mut self, now: Instant) -> bool {
        self.second.evict(now);
        self.minute.evict(now);
        if self.second.has_capacity() && self.minute.has_capacity() {
            self.second.calls.push_back(now);
            self.minute.calls.push_back(now);
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    windows: Mutex<Windows>,
    poll_interval: Duration,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            windows: Mutex::new(Windows {
                second: RateWindow::new(SHORT_HORIZON, config.per_second),
                minute: RateWindow::new(LONG_HORIZON, config.per_minute),
            }),
            poll_interval: config.poll_interval.max(Duration::from_millis(1)),
        }
    }

    /// Wait until both windows have spare capacity, then record the call.
    ///
    /// The check and the stamp happen under one lock, so concurrent callers
    /// can never overshoot a window between them.
    pub async fn admit(&self) {
        let mut waited = false;
        loop {
            if self.windows.lock().try_admit(Instant::now()) {
                if waited {
                    tracing::debug!("outbound call admitted after waiting for rate window");
                }
                return;
            }
            waited = true;
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Current number of stamps in the (1s, 60s) windows.
    pub fn window_len(&self) -> (usize, usize) {
        let mut windows = self.windows.lock();
        let now = Instant::now();
        windows.second.evict(now);
        windows.minute.evict(now);
        (windows.second.calls.len(), windows.minute.calls.len())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter(per_second: usize, per_minute: usize) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            per_second,
            per_minute,
            poll_interval: Duration::from_millis(100),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn third_call_waits_for_the_second_window() {
        let limiter = limiter(2, 300);
        let start = Instant::now();

        limiter.admit().await;
        limiter.admit().await;
        assert!(start.elapsed() < Duration::from_millis(100));

        limiter.admit().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_millis(1200));
    }

    #[tokio::test(start_paused = true)]
    async fn minute_window_caps_sustained_bursts() {
        let limiter = limiter(100, 5);
        let start = Instant::now();

        for _ in 0..5 {
            limiter.admit().await;
        }
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(limiter.window_len(), (5, 5));

        limiter.admit().await;
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn no_trailing_window_is_ever_exceeded() {
        let limiter = Arc::new(limiter(3, 10));
        let stamps = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for _ in 0..25 {
            let limiter = limiter.clone();
            let stamps = stamps.clone();
            tasks.push(tokio::spawn(async move {
                limiter.admit().await;
                stamps.lock().push(Instant::now());
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut stamps = stamps.lock().clone();
        stamps.sort();
        assert_eq!(stamps.len(), 25);
        for (i, &t) in stamps.iter().enumerate() {
            let in_second = stamps[i..]
                .iter()
                .take_while(|&&s| s.duration_since(t) < SHORT_HORIZON)
                .count();
            let in_minute = stamps[i..]
                .iter()
                .take_while(|&&s| s.duration_since(t) < LONG_HORIZON)
                .count();
            assert!(in_second <= 3, "{in_second} calls within one second");
            assert!(in_minute <= 10, "{in_minute} calls within one minute");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn old_stamps_are_evicted() {
        let limiter = limiter(2, 300);
        limiter.admit().await;
        limiter.admit().await;
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.window_len(), (0, 2));
    }

    #[test]
    fn zero_limits_are_clamped() {
        let window = RateWindow::new(SHORT_HORIZON, 0);
        assert!(window.has_capacity());
    }
}
