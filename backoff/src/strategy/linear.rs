use std::time::Duration;

/// Delay before the n-th retry is `step * n`, so 1s, 2s, 3s... for a one second step.
#[derive(Debug, Clone)]
pub struct Linear {
    step: Duration,
    retry: u32,
}

impl Linear {
    pub fn new(step: Duration) -> Self {
        Self { step, retry: 0 }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }
}

impl Iterator for Linear {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        self.retry = self.retry.saturating_add(1);
        Some(self.step.saturating_mul(self.retry))
    }
}
