//! Sliding-window request throttling.
//!
//! Keeps the dispatcher under a provider's per-minute cap and spaces
//! consecutive requests by at least the per-second interval.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::constants::rate_limit::WINDOW_MS;

#[derive(Debug, Default)]
struct Window {
    requests: VecDeque<Instant>,
    last: Option<Instant>,
}

impl Window {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.requests.front() {
            if *front + window <= now {
                self.requests.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Request throttle for one provider
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    window: Duration,
    state: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            window: Duration::from_millis(WINDOW_MS),
            state: Mutex::new(Window::default()),
        }
    }

    /// A limiter that never waits
    pub fn unlimited() -> Self {
        Self::new(RateLimitConfig {
            requests_per_minute: 0,
            requests_per_second: 0,
        })
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// How long a request issued at `now` would have to wait.
    pub fn wait_time_at(&self, now: Instant) -> Duration {
        let mut state = self.state.lock();
        self.compute_wait(&mut state, now)
    }

    fn compute_wait(&self, state: &mut Window, now: Instant) -> Duration {
        state.prune(now, self.window);

        let mut wait = Duration::ZERO;

        let cap = self.config.requests_per_minute as usize;
        if cap > 0 && state.requests.len() >= cap {
            // The request that has to leave the window before one more fits
            let gate = state.requests[state.requests.len() - cap];
            wait = (gate + self.window).saturating_duration_since(now);
        }

        if let Some(last) = state.last {
            let spacing = (last + self.config.min_interval()).saturating_duration_since(now);
            wait = wait.max(spacing);
        }

        wait
    }

    /// Record a request at `now` if it may proceed; otherwise return the wait.
    pub fn try_acquire_at(&self, now: Instant) -> Result<(), Duration> {
        let mut state = self.state.lock();
        let wait = self.compute_wait(&mut state, now);
        if wait.is_zero() {
            state.requests.push_back(now);
            state.last = Some(now);
            Ok(())
        } else {
            Err(wait)
        }
    }

    /// Wait until a request may proceed, then record it.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire_at(Instant::now()) {
                Ok(()) => return,
                Err(wait) => {
                    log::debug!("Rate limit reached, waiting {}ms", wait.as_millis());
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Requests recorded in the current window
    pub fn requests_in_window(&self) -> usize {
        let mut state = self.state.lock();
        state.prune(Instant::now(), self.window);
        state.requests.len()
    }

    /// Forget all recorded requests
    pub fn reset(&self) {
        *self.state.lock() = Window::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rpm: u32, rps: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            requests_per_minute: rpm,
            requests_per_second: rps,
        })
    }

    #[test]
    fn test_minimum_spacing() {
        let rl = limiter(0, 2);
        let t0 = Instant::now();
        assert!(rl.try_acquire_at(t0).is_ok());
        assert_eq!(
            rl.try_acquire_at(t0 + Duration::from_millis(100)),
            Err(Duration::from_millis(400))
        );
        assert!(rl.try_acquire_at(t0 + Duration::from_millis(500)).is_ok());
    }

    #[test]
    fn test_minute_window_cap() {
        let rl = limiter(3, 0);
        let t0 = Instant::now();
        for i in 0..3 {
            assert!(rl.try_acquire_at(t0 + Duration::from_secs(i)).is_ok());
        }
        // Fourth request must wait until the first leaves the window
        let now = t0 + Duration::from_secs(10);
        assert_eq!(rl.wait_time_at(now), Duration::from_secs(50));
        assert!(rl.try_acquire_at(t0 + Duration::from_secs(60)).is_ok());
    }

    #[test]
    fn test_unlimited_never_waits() {
        let rl = RateLimiter::unlimited();
        let t0 = Instant::now();
        for _ in 0..100 {
            assert!(rl.try_acquire_at(t0).is_ok());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_sleeps_out_the_wait() {
        let rl = limiter(0, 1);
        let start = Instant::now();
        rl.acquire().await;
        rl.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert_eq!(rl.requests_in_window(), 2);

        rl.reset();
        assert_eq!(rl.requests_in_window(), 0);
    }
}
