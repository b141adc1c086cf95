use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project::pin_project;
use tokio::time::{Instant, Sleep, sleep_until};

use crate::{Condition, Operation};

/// Why a [Retry] gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// The [Condition] rejected the error, no further attempt was made.
    Aborted { error: E, attempts: usize },
    /// Every attempt failed with a retryable error and the schedule ran dry.
    Exhausted { error: E, attempts: usize },
}

impl<E> RetryError<E> {
    /// Number of times the operation was run.
    pub fn attempts(&self) -> usize {
        match self {
            RetryError::Aborted { attempts, .. } | RetryError::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    /// The error returned by the last attempt.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Aborted { error, .. } | RetryError::Exhausted { error, .. } => error,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Aborted { error, attempts } => {
                write!(f, "aborted after {attempts} attempt(s): {error}")
            }
            RetryError::Exhausted { error, attempts } => {
                write!(f, "exhausted after {attempts} attempt(s): {error}")
            }
        }
    }
}

/// The future flips between running the operation and sleeping off the delay handed out by the
/// schedule:
/// ```no_rust
/// Running --(Ok)--------------------------------------> Ready(Ok)
///    |
///    +--(Err, !can_retry)-----------------------------> Ready(Aborted)
///    |
///    +--(Err, can_retry)--> schedule.next()
///                              |-- None ---------------> Ready(Exhausted)
///                              +-- Some(d) --> Sleeping(d) --> Running(attempt + 1)
/// ```
#[pin_project(project = StateProj)]
enum State<F> {
    Running(#[pin] F),
    Sleeping(#[pin] Sleep),
}

/// Runs an [Operation] until it succeeds, the [Condition] refuses the error, or the schedule ends.
#[pin_project]
pub struct Retry<I, O, C>
where
    O: Operation,
{
    #[pin]
    state: State<O::Future>,
    schedule: I,
    operation: O,
    condition: C,
    attempt: usize,
}

impl<I, O, C> Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    pub fn new<S>(schedule: S, mut operation: O, condition: C) -> Self
    where
        S: IntoIterator<IntoIter = I, Item = Duration>,
    {
        Self {
            state: State::Running(operation.run(1)),
            schedule: schedule.into_iter(),
            operation,
            condition,
            attempt: 1,
        }
    }

    fn on_error(mut self: Pin<&mut Self>, error: O::Error) -> Option<RetryError<O::Error>> {
        let mut this = self.as_mut().project();
        let attempts = *this.attempt;
        if !this.condition.can_retry(&error) {
            return Some(RetryError::Aborted { error, attempts });
        }
        match this.schedule.next() {
            None => Some(RetryError::Exhausted { error, attempts }),
            Some(delay) => {
                this.state
                    .set(State::Sleeping(sleep_until(Instant::now() + delay)));
                None
            }
        }
    }

    fn restart(mut self: Pin<&mut Self>) {
        let mut this = self.as_mut().project();
        *this.attempt += 1;
        let future = this.operation.run(*this.attempt);
        this.state.set(State::Running(future));
    }
}

impl<I, O, C> Future for Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    type Output = Result<O::Item, RetryError<O::Error>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            match self.as_mut().project().state.project() {
                StateProj::Running(fut) => match fut.poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(item)) => return Poll::Ready(Ok(item)),
                    Poll::Ready(Err(error)) => {
                        if let Some(failure) = self.as_mut().on_error(error) {
                            return Poll::Ready(Err(failure));
                        }
                    }
                },
                StateProj::Sleeping(sleep) => match sleep.poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(()) => self.as_mut().restart(),
                },
            }
        }
    }
}
