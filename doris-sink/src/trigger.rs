use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::buffer::BatchBuffer;
use crate::config::LoadOptions;

/// Which threshold made a flush due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Rows,
    Bytes,
    Interval,
    /// An explicit flush or close.
    Requested,
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlushReason::Rows => write!(f, "rows"),
            FlushReason::Bytes => write!(f, "bytes"),
            FlushReason::Interval => write!(f, "interval"),
            FlushReason::Requested => write!(f, "requested"),
        }
    }
}

/// Flush policy: row count, byte size or age of the current generation, whichever comes first.
#[derive(Debug, Clone)]
pub struct FlushTrigger {
    max_rows: usize,
    max_bytes: usize,
    interval: Option<Duration>,
}

impl FlushTrigger {
    pub fn new(options: &LoadOptions) -> Self {
        Self {
            max_rows: options.batch_rows(),
            max_bytes: options.batch_bytes(),
            interval: options.batch_interval(),
        }
    }

    /// Returns why the buffer must be flushed at `now`, if it must. An empty buffer never is.
    pub fn evaluate(&self, buffer: &BatchBuffer, now: Instant) -> Option<FlushReason> {
        if buffer.is_empty() {
            return None;
        }
        if buffer.len() >= self.max_rows {
            return Some(FlushReason::Rows);
        }
        if buffer.bytes() >= self.max_bytes {
            return Some(FlushReason::Bytes);
        }
        match self.deadline(buffer) {
            Some(deadline) if now >= deadline => Some(FlushReason::Interval),
            _ => None,
        }
    }

    /// Instant the interval fires for the current generation. `None` when the buffer is empty or
    /// time based flushing is off.
    pub fn deadline(&self, buffer: &BatchBuffer) -> Option<Instant> {
        let interval = self.interval?;
        buffer.started_at().map(|started| started + interval)
    }
}
