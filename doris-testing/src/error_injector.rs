//! Fault injection for the mock stream load endpoint.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Controller for injecting failures into the mock BE.
///
/// Server errors are checked before the label is looked up, rejections before the rows are
/// parsed and lost responses after the commit.
#[derive(Debug, Default)]
pub struct ErrorInjector {
    /// Answer the next N loads with `500 Internal Server Error` without committing.
    fail_next_loads: AtomicUsize,
    /// Reject the next N loads as a schema/data quality failure.
    reject_next_loads: AtomicUsize,
    /// Commit the next N loads but answer `500`, as if the response was lost.
    lose_next_responses: AtomicUsize,
    /// Send redirects without a `Location` header.
    drop_redirect_location: AtomicBool,
    /// Artificial load latency in milliseconds.
    load_latency_ms: AtomicU64,
}

impl ErrorInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next N loads with a server error.
    pub fn fail_loads(&self, count: usize) {
        self.fail_next_loads.store(count, Ordering::Relaxed);
    }

    /// Reject the next N loads with a data quality error.
    pub fn reject_loads(&self, count: usize) {
        self.reject_next_loads.store(count, Ordering::Relaxed);
    }

    /// Commit the next N loads, then answer with a server error.
    pub fn lose_responses(&self, count: usize) {
        self.lose_next_responses.store(count, Ordering::Relaxed);
    }

    pub fn drop_redirect_location(&self, drop: bool) {
        self.drop_redirect_location.store(drop, Ordering::Relaxed);
    }

    pub fn set_load_latency(&self, ms: u64) {
        self.load_latency_ms.store(ms, Ordering::Relaxed);
    }

    pub(crate) fn should_fail_load(&self) -> bool {
        Self::decrement_counter(&self.fail_next_loads)
    }

    pub(crate) fn should_reject_load(&self) -> bool {
        Self::decrement_counter(&self.reject_next_loads)
    }

    pub(crate) fn should_lose_response(&self) -> bool {
        Self::decrement_counter(&self.lose_next_responses)
    }

    pub(crate) fn should_drop_redirect_location(&self) -> bool {
        self.drop_redirect_location.load(Ordering::Relaxed)
    }

    pub(crate) fn load_latency(&self) -> Option<Duration> {
        match self.load_latency_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Returns true and decrements when the counter is positive.
    fn decrement_counter(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1))
            .is_ok()
    }
}
