//! Delay schedules for [crate::retry::Retry]. Every strategy is an endless iterator, bound it with
//! `Iterator::take` to cap the number of retries.

/// Same delay before every retry.
pub mod fixed;

/// Delay grows by a constant step: `step * retry`.
pub mod linear;

/// Delay grows geometrically up to a cap, optionally jittered.
pub mod exponential;
