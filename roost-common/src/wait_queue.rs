//! Priority-ordered wait queues built on the intrusive sorted list.

use core::fmt;
use core::task::Waker;

pub use crate::list::{Link, SortedLinkedList};

/// The scheduling priority of a task.
///
/// Higher levels are more urgent. Wait queues hand out permits and slots to
/// the highest level first, and tasks at the same level are served in the
/// order they started waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority(u8);

impl Priority {
    /// Create a priority from a numeric level.
    pub const fn new(level: u8) -> Self {
        Self(level)
    }

    /// The numeric level of this priority.
    pub const fn level(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A task parked on a wait queue.
#[derive(Debug, Clone)]
pub struct Waiter {
    /// The priority the task waits with.
    pub priority: Priority,
    /// The waker that resumes the task.
    pub waker: Waker,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}

// Reversed on purpose: the list keeps its smallest element at the head, and
// the head must be the waiter that is woken first.
impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        other.priority.partial_cmp(&self.priority)
    }
}

/// A wait queue that pops the highest-priority waiter first.
///
/// Waiters at the same priority are popped in insertion order.
pub type WaitQueue = SortedLinkedList<Waiter>;

/// A wait queue link holding a [`Waiter`].
pub type WaitQueueLink = Link<Waiter>;
