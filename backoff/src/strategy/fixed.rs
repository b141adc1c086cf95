use std::time::Duration;

/// Yields the same interval forever.
#[derive(Debug, Clone)]
pub struct Interval {
    delay: Duration,
}

impl Interval {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }
}

impl Iterator for Interval {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.delay)
    }
}

impl From<Duration> for Interval {
    fn from(delay: Duration) -> Self {
        Self::new(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_delay() {
        let mut interval = Interval::from_millis(250);
        assert_eq!(interval.next(), Some(Duration::from_millis(250)));
        assert_eq!(interval.next(), Some(Duration::from_millis(250)));
        assert_eq!(interval.take(3).count(), 3);
    }
}
