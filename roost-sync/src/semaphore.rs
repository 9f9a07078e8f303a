//! A counting semaphore that wakes waiters in priority order.
//!
//! Permits are handed to the highest-priority waiter first; waiters at the
//! same priority are served in the order they started waiting. A release that
//! finds a waiter hands the permit straight to it instead of going through
//! the counter, so a later arrival can never steal a permit from a task that
//! was already woken.
//!
//! Example usage:
//!
//! ```rust
//! use roost_sync::{semaphore::Semaphore, Priority};
//!
//! // Three permits, all drained at startup.
//! static GUARD: Semaphore = Semaphore::new(3, 0);
//!
//! async fn worker() {
//!     GUARD.acquire(Priority::new(2)).await;
//!     // The permit is held from here on; some other part of the system
//!     // calls `GUARD.release()` to replenish the pool.
//! }
//! ```

use core::future::poll_fn;
use core::pin::Pin;
use core::sync::atomic::{fence, AtomicU16, Ordering};
use core::task::Poll;

use roost_common::dropper::OnDrop;
use roost_common::wait_queue::{Link, Priority, WaitQueue, Waiter};

/// Lets the closures in `acquire` share the pointer to the wait-queue link
/// across contexts.
#[derive(Clone)]
struct LinkPtr(*mut Option<Link<Waiter>>);

impl LinkPtr {
    /// This will dereference the pointer stored within and give out an `&mut`.
    unsafe fn get(&mut self) -> &mut Option<Link<Waiter>> {
        &mut *self.0
    }
}

unsafe impl Send for LinkPtr {}
unsafe impl Sync for LinkPtr {}

/// A counting semaphore with a priority-ordered wait queue.
pub struct Semaphore {
    wait_queue: WaitQueue,
    count: AtomicU16,
    capacity: u16,
}

impl Semaphore {
    /// Create a new semaphore.
    ///
    /// `initial` permits are available from the start. Panics when `capacity`
    /// is zero or `initial` exceeds it; for a `static` the panic surfaces at
    /// compile time.
    pub const fn new(capacity: u16, initial: u16) -> Self {
        assert!(capacity > 0, "a semaphore needs at least one permit");
        assert!(initial <= capacity, "initial permits exceed the capacity");

        Self {
            wait_queue: WaitQueue::new(),
            count: AtomicU16::new(initial),
            capacity,
        }
    }

    /// Wait with the given priority until a permit is handed out.
    ///
    /// Dropping the returned future takes the caller out of the wait queue
    /// again. If the drop races with a release that already picked this
    /// waiter, the permit is passed on instead of getting lost.
    pub async fn acquire(&self, priority: Priority) {
        let mut link_ptr: Option<Link<Waiter>> = None;

        // Make this future `Drop`-safe.
        // SAFETY(link_ptr): Shadow the original definition of `link_ptr` so we can't abuse it.
        let mut link_ptr = LinkPtr(&mut link_ptr as *mut Option<Link<Waiter>>);

        let mut link_ptr2 = link_ptr.clone();
        let dropper = OnDrop::new(|| {
            // SAFETY: We only run this closure and dereference the pointer if we have
            // exited the `poll_fn` below in the `drop(dropper)` call. The other dereference
            // of this pointer is in the `poll_fn`.
            critical_section::with(|_| {
                fence(Ordering::SeqCst);

                if let Some(link) = unsafe { link_ptr2.get() } {
                    if link.is_popped() {
                        // A release already picked this waiter. The permit
                        // belongs to a future that will never resume, so
                        // pass it on.
                        self.release();
                    } else {
                        self.wait_queue.delete(link as *const _ as usize);
                    }
                }
            });
        });

        poll_fn(|cx| {
            critical_section::with(|_| {
                fence(Ordering::SeqCst);

                // SAFETY: This pointer is only dereferenced here and on drop of the future
                // which happens outside this `poll_fn`'s stack frame.
                let link = unsafe { link_ptr.get() };
                if let Some(link) = link {
                    if link.is_popped() {
                        // A release handed its permit directly to this waiter,
                        // the counter was never touched.
                        return Poll::Ready(());
                    }
                } else {
                    let count = self.count.load(Ordering::Relaxed);

                    // No waiter is ahead of us and a permit is available.
                    if self.wait_queue.is_empty() && count > 0 {
                        self.count.store(count - 1, Ordering::Relaxed);

                        return Poll::Ready(());
                    }

                    // Place the link in the wait queue on first run.
                    let link_ref = link.insert(Link::new(Waiter {
                        priority,
                        waker: cx.waker().clone(),
                    }));

                    // SAFETY(new_unchecked): The address to the link is stable as it is defined
                    // outside this stack frame.
                    // SAFETY(insert): `link_ref` lifetime comes from `link_ptr` that is shadowed,
                    // and we make sure in `dropper` that the link is removed from the queue
                    // before dropping `link_ptr` AND `dropper` makes sure that the shadowed
                    // `link_ptr` lives until the end of the stack frame.
                    let _ = unsafe { self.wait_queue.insert(Pin::new_unchecked(link_ref)) };
                }

                Poll::Pending
            })
        })
        .await;

        // The permit is ours now, the cleanup that passes it on must not run.
        dropper.defuse();
    }

    /// Take a permit without waiting.
    ///
    /// Fails when no permit is available or when other tasks are already
    /// queued up, so it never overtakes a waiter.
    pub fn try_acquire(&self) -> bool {
        critical_section::with(|_| {
            fence(Ordering::SeqCst);

            let count = self.count.load(Ordering::Relaxed);

            if self.wait_queue.is_empty() && count > 0 {
                self.count.store(count - 1, Ordering::Relaxed);

                true
            } else {
                false
            }
        })
    }

    /// Return one permit.
    ///
    /// If a task is waiting, the permit is handed straight to the
    /// highest-priority waiter and the counter stays untouched. Otherwise the
    /// counter goes up by one, saturating at the capacity.
    pub fn release(&self) {
        self.release_inner();
    }

    /// Return one permit from interrupt context.
    ///
    /// Never blocks. Returns the priority of the waiter that was woken, if
    /// any, so the caller can decide whether a reschedule is due.
    pub fn release_from_interrupt(&self) -> Option<Priority> {
        self.release_inner()
    }

    fn release_inner(&self) -> Option<Priority> {
        critical_section::with(|_| {
            fence(Ordering::SeqCst);

            if let Some(waiter) = self.wait_queue.pop() {
                // Hand the permit directly to the next in queue.
                let priority = waiter.priority;
                waiter.waker.wake();

                Some(priority)
            } else {
                let count = self.count.load(Ordering::Relaxed);

                if count < self.capacity {
                    self.count.store(count + 1, Ordering::Relaxed);
                }

                None
            }
        })
    }

    /// The number of permits currently available.
    ///
    /// This is a snapshot; it can be outdated as soon as it is read.
    pub fn count(&self) -> u16 {
        self.count.load(Ordering::Relaxed)
    }

    /// The largest number of permits this semaphore can hold.
    pub fn capacity(&self) -> u16 {
        self.capacity
    }
}


#[cfg(test)]
mod stress_test {
    use super::*;

    #[tokio::test]
    async fn stress_semaphore() {
        const NUM_RUNS: usize = 10_000;
        const PERMITS: u16 = 3;

        static SEM: Semaphore = Semaphore::new(PERMITS, PERMITS);
        static IN_FLIGHT: AtomicU16 = AtomicU16::new(0);

        let mut v = std::vec::Vec::new();

        for i in 0..NUM_RUNS {
            v.push(tokio::spawn(async move {
                SEM.acquire(Priority::new((i % 4) as u8)).await;

                let holders = IN_FLIGHT.fetch_add(1, Ordering::SeqCst) + 1;
                assert!(holders <= PERMITS);

                tokio::task::yield_now().await;

                IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
                SEM.release();
            }));
        }

        for v in v {
            v.await.unwrap();
        }

        assert_eq!(SEM.count(), PERMITS);
    }
}
