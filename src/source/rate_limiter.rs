//! Rate limiter using token bucket algorithm.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Token bucket rate limiter
pub struct RateLimiter {
    state: Arc<Mutex<RateLimiterState>>,
}

struct RateLimiterState {
    tokens: f64,
    last_update: Instant,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
    min_delay: Duration,
    max_delay: Duration,
}

impl RateLimiter {
    /// Create a new rate limiter
    ///
    /// # Arguments
    /// * `requests_per_minute` - Maximum requests per minute
    /// * `min_delay` - Minimum pause before each request
    /// * `max_delay` - Upper bound of the jittered pause
    pub fn new(requests_per_minute: u32, min_delay: Duration, max_delay: Duration) -> Self {
        let max_tokens = f64::from(requests_per_minute.max(1));
        let refill_rate = max_tokens / 60.0;

        Self {
            state: Arc::new(Mutex::new(RateLimiterState {
                tokens: max_tokens,
                last_update: Instant::now(),
                max_tokens,
                refill_rate,
                min_delay,
                max_delay: max_delay.max(min_delay),
            })),
        }
    }

    /// Acquire a token, waiting if necessary
    pub async fn acquire(&self) {
        let delay = {
            let mut state = self.state.lock().await;
            state.next_delay(Instant::now(), jitter())
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

impl RateLimiterState {
    fn next_delay(&mut self, now: Instant, jitter: f64) -> Duration {
        // Refill tokens
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            let delay_range = self.max_delay - self.min_delay;
            self.min_delay + delay_range.mul_f64(jitter)
        } else {
            // Wait for token to become available
            let wait_time = (1.0 - self.tokens) / self.refill_rate;
            self.tokens = 0.0;
            Duration::from_secs_f64(wait_time) + self.min_delay
        }
    }
}

/// Pseudo-random jitter factor in [0.0, 1.0)
fn jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    f64::from(nanos % 1000) / 1000.0
}
