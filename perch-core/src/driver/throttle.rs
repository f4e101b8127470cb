//! Outbound rate limiting and reconnect backoff.

use std::time::Duration;

use rand::Rng;

/// Token bucket: `burst` messages at once, then one per `refill` seconds.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    burst: f64,
    refill: f64,
    tokens: f64,
    updated: f64,
}

impl TokenBucket {
    pub fn new(burst: u32, refill: f64, now: f64) -> Self {
        let burst = f64::from(burst.max(1));
        Self { burst, refill: refill.max(0.0), tokens: burst, updated: now }
    }

    /// Pick up configuration changes without losing the current level.
    pub fn reconfigure(&mut self, burst: u32, refill: f64) {
        self.burst = f64::from(burst.max(1));
        self.refill = refill.max(0.0);
        self.tokens = self.tokens.min(self.burst);
    }

    fn update(&mut self, now: f64) {
        if self.refill == 0.0 {
            self.tokens = self.burst;
        } else if now > self.updated {
            self.tokens = (self.tokens + (now - self.updated) / self.refill).min(self.burst);
        }
        self.updated = now;
    }

    /// Take a token if one is available.
    pub fn try_take(&mut self, now: f64) -> bool {
        self.update(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Seconds until the next token.
    pub fn wait(&mut self, now: f64) -> f64 {
        self.update(now);
        if self.tokens >= 1.0 { 0.0 } else { (1.0 - self.tokens) * self.refill }
    }
}

/// Exponential reconnect delay with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    maximum: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, maximum: Duration) -> Self {
        Self { initial, maximum: maximum.max(initial), current: initial }
    }

    /// The delay to wait now; doubles (plus up to 25% jitter) for next time.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let quarter = delay.as_millis() as u64 / 4;
        let jitter = if quarter == 0 { 0 } else { rand::thread_rng().gen_range(0..quarter) };
        self.current = (delay * 2 + Duration::from_millis(jitter)).min(self.maximum);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
