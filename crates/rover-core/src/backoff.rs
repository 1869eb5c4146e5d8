use std::time::Duration;

use rand::Rng;

/// Capped exponential reconnect delay with optional full jitter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2.0,
            cap: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl Backoff {
    /// Upper bound of the delay after `failures` consecutive failures.
    /// Non-decreasing in `failures` and never above `cap`.
    pub fn ceiling(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = if self.factor.is_finite() && self.factor >= 1.0 {
            self.factor
        } else {
            1.0
        };
        let exp = factor.powi(failures.saturating_sub(1).min(64) as i32);
        let cap_ms = self.cap.as_millis() as f64;
        let raw_ms = self.base.as_millis() as f64 * exp;
        let ms = if raw_ms.is_finite() { raw_ms.min(cap_ms) } else { cap_ms };
        Duration::from_millis(ms.max(0.0) as u64)
    }

    /// Delay to wait before the next attempt. With jitter the value is drawn
    /// uniformly from `[0, ceiling]`.
    pub fn delay(&self, failures: u32) -> Duration {
        let ceiling = self.ceiling(failures);
        if !self.jitter || ceiling.is_zero() {
            return ceiling;
        }
        let ms = ceiling.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(0..=ms))
    }
}
