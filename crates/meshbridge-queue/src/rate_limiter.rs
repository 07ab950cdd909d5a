//! Token-bucket rate limiter.
//!
//! `acquire` refills based on elapsed time, then either takes the tokens
//! immediately or sleeps until enough have accumulated. A non-positive rate,
//! or `enabled = false`, makes every acquire a no-op and
//! `available_tokens()` return the `-1.0` "unlimited" sentinel.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

struct State {
    tokens: f64,
    last_update: Instant,
}

pub struct TokenBucket {
    rate: f64,
    burst: f64,
    enabled: bool,
    state: Mutex<State>,
}

impl TokenBucket {
    pub fn new(rate: f64, burst: f64, enabled: bool) -> Self {
        Self {
            rate,
            burst,
            enabled,
            state: Mutex::new(State { tokens: burst, last_update: Instant::now() }),
        }
    }

    fn disabled(&self) -> bool {
        !self.enabled || self.rate <= 0.0
    }

    fn refill(&self, state: &mut State) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_update).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_update = now;
    }

    pub fn available_tokens(&self) -> f64 {
        if self.disabled() {
            return -1.0;
        }
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    /// Block until `tokens` are available, then consume them.
    pub async fn acquire(&self, tokens: f64) {
        if self.disabled() {
            return;
        }
        loop {
            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state);
                if state.tokens >= tokens {
                    state.tokens -= tokens;
                    return;
                }
                let deficit = tokens - state.tokens;
                Duration::from_secs_f64(deficit / self.rate)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_bucket_reports_unlimited() {
        let bucket = TokenBucket::new(2.0, 5.0, false);
        assert_eq!(bucket.available_tokens(), -1.0);
    }

    #[test]
    fn nonpositive_rate_is_unlimited() {
        let bucket = TokenBucket::new(0.0, 5.0, true);
        assert_eq!(bucket.available_tokens(), -1.0);
    }

    #[tokio::test]
    async fn acquire_consumes_burst_immediately() {
        let bucket = TokenBucket::new(10.0, 3.0, true);
        let start = Instant::now();
        bucket.acquire(1.0).await;
        bucket.acquire(1.0).await;
        bucket.acquire(1.0).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
