//! Time-related traits & structs.
//!
//! A target provides the current time by implementing [`Monotonic`] on top of
//! whatever hardware counter it has. The [`TimerQueue`] turns that single
//! compare-match interrupt into any number of concurrent [`Delay`] and
//! [`Timeout`] futures.

#![no_std]
#![deny(missing_docs)]

use core::ops::{Add, Sub};

pub mod timer_queue;

pub use timer_queue::{Delay, Timeout, TimerQueue};

/// This indicates that there was a timeout.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct TimeoutError;

/// A monotonic clock / counter definition.
///
/// # Correctness
///
/// The trait enforces that proper time-math is implemented between `Instant` and `Duration`. This
/// is a requirement on the time library that the user chooses to use.
pub trait Monotonic {
    /// The type for instant, defining an instant in time.
    ///
    /// **Note:** In all APIs that take instants, this type will be used.
    type Instant: Ord
        + Copy
        + Add<Self::Duration, Output = Self::Instant>
        + Sub<Self::Duration, Output = Self::Instant>
        + Sub<Self::Instant, Output = Self::Duration>;

    /// The type for duration, defining a duration of time.
    ///
    /// **Note:** In all APIs that take durations, this type will be used.
    type Duration: Copy;

    /// Get the current time.
    fn now() -> Self::Instant;

    /// Set the compare value of the timer interrupt.
    ///
    /// **Note:** This method does not need to handle race conditions of the monotonic, the timer
    /// queue checks this.
    fn set_compare(instant: Self::Instant);

    /// Clear the compare interrupt flag.
    fn clear_compare_flag();

    /// Pend the timer's interrupt.
    fn pend_interrupt();

    /// Optional. Runs on interrupt before any timer queue handling.
    fn on_interrupt() {}

    /// Optional. This is used to save power, this is called when the timer queue is not empty.
    ///
    /// Enabling and disabling the monotonic needs to propagate to `now` so that an instant
    /// based of `now()` is still valid.
    ///
    /// NOTE: This may be called more than once.
    fn enable_timer() {}

    /// Optional. This is used to save power, this is called when the timer queue is empty.
    ///
    /// Enabling and disabling the monotonic needs to propagate to `now` so that an instant
    /// based of `now()` is still valid.
    ///
    /// NOTE: This may be called more than once.
    fn disable_timer() {}
}
