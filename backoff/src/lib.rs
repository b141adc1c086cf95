//! Retry an async [Operation] with a delay schedule between attempts.
//!
//! A schedule is any `Iterator<Item = Duration>`: every yielded duration grants one more attempt
//! after cooling off for that long. The [strategy] module has the common shapes (fixed, linear,
//! exponential), and `Iterator::take` bounds them.
//!
//! ```
//! use backoff::retry::Retry;
//! use backoff::strategy::fixed;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let result = Retry::new(
//!     fixed::Interval::from_millis(1).take(2),
//!     |attempt: usize| async move { if attempt < 2 { Err("not yet") } else { Ok(attempt) } },
//!     |_: &&str| true,
//! )
//! .await;
//! assert_eq!(result, Ok(2));
//! # }
//! ```

use std::future::Future;

pub mod retry;
pub mod strategy;

/// An operation that can be (re)started. `attempt` is 1 for the first run and grows by one on
/// every retry.
pub trait Operation {
    type Item;
    type Error;
    type Future: Future<Output = Result<Self::Item, Self::Error>>;

    fn run(&mut self, attempt: usize) -> Self::Future;
}

impl<I, E, T, F> Operation for F
where
    F: FnMut(usize) -> T,
    T: Future<Output = Result<I, E>>,
{
    type Item = I;
    type Error = E;
    type Future = T;

    fn run(&mut self, attempt: usize) -> Self::Future {
        self(attempt)
    }
}

/// Decides whether a failed attempt may be retried.
pub trait Condition<E> {
    fn can_retry(&mut self, error: &E) -> bool;
}

impl<E, F> Condition<E> for F
where
    F: FnMut(&E) -> bool,
{
    fn can_retry(&mut self, error: &E) -> bool {
        self(error)
    }
}
