use std::time::Duration;

use rand::Rng;

/// Delay before the n-th retry is `base * factor^(n - 1)`, capped at `cap`.
///
/// With a non-zero jitter `j` every delay is scaled by a random factor in `[1 - j, 1 + j]`
/// before the cap applies.
///
/// ```
/// use backoff::strategy::exponential::Exponential;
/// use std::time::Duration;
///
/// let delays: Vec<_> = Exponential::new(Duration::from_millis(100), Duration::from_millis(350), 2.0)
///     .take(4)
///     .collect();
/// assert_eq!(delays, [100, 200, 350, 350].map(Duration::from_millis));
/// ```
#[derive(Debug, Clone)]
pub struct Exponential {
    base: Duration,
    cap: Duration,
    factor: f64,
    jitter: f64,
    retry: i32,
}

impl Exponential {
    pub fn new(base: Duration, cap: Duration, factor: f64) -> Self {
        Self {
            base,
            cap,
            factor,
            jitter: 0.0,
            retry: 0,
        }
    }

    /// Randomize each delay by up to `jitter` (clamped into `0.0..=1.0`) in either direction.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    fn delay(&self) -> Duration {
        let millis = self.base.as_millis() as f64 * self.factor.powi(self.retry - 1);
        let millis = if self.jitter == 0.0 {
            millis
        } else {
            millis * rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter)
        };

        if !millis.is_finite() || millis >= self.cap.as_millis() as f64 {
            return self.cap;
        }
        Duration::from_millis(millis.max(0.0) as u64)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        self.retry = self.retry.saturating_add(1);
        Some(self.delay())
    }
}
