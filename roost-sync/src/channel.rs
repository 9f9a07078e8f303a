//! An async aware MPSC channel that can be used on no-alloc systems.
//!
//! Messages are delivered in send order, with one exception: an interrupt
//! handler can push a message to the *front* of the queue so the receiver
//! sees it next. Senders that wait for room are served in priority order,
//! and a freed slot is handed directly to the frontmost waiter so a later
//! sender can never steal it.

use core::{
    future::poll_fn,
    mem::MaybeUninit,
    pin::Pin,
    ptr,
    sync::atomic::{fence, Ordering},
    task::{Poll, Waker},
};

#[doc(hidden)]
pub use critical_section;

use heapless::Deque;

use roost_common::{
    dropper::OnDrop,
    list::{Link, SortedLinkedList},
    unsafecell::UnsafeCell,
    wait_queue::{Priority, WaitQueue, Waiter},
};

#[cfg(feature = "defmt-03")]
use crate::defmt;

/// A sender parked because the queue was full.
#[derive(Clone)]
struct SendWaiter {
    priority: Priority,
    waker: Waker,
    free_slot_ptr: FreeSlotPtr,
}

impl PartialEq for SendWaiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}

// Reversed on purpose: the list keeps its smallest element at the head, and
// the head must be the sender that is granted a slot first.
impl PartialOrd for SendWaiter {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        other.priority.partial_cmp(&self.priority)
    }
}

type SendWaitQueue = SortedLinkedList<SendWaiter>;

/// A free slot.
#[derive(Debug)]
struct FreeSlot(u8);

/// A pointer to a free slot.
///
/// This struct exists to enforce lifetime/safety requirements, and to ensure
/// that [`FreeSlot`]s can only be created/updated by this module.
#[derive(Clone)]
struct FreeSlotPtr(*mut Option<FreeSlot>);

impl FreeSlotPtr {
    /// SAFETY: `inner` must be valid until the [`Link`] containing this [`FreeSlotPtr`] is popped.
    /// Additionally, this [`FreeSlotPtr`] must have exclusive access to the data pointed to by
    /// `inner`.
    unsafe fn new(inner: *mut Option<FreeSlot>) -> Self {
        Self(inner)
    }

    /// Take the value out of this slot.
    ///
    /// SAFETY: the pointer in this [`FreeSlotPtr`] must be valid for writes.
    unsafe fn take(&mut self, cs: critical_section::CriticalSection) -> Option<FreeSlot> {
        self.replace(None, cs)
    }

    /// Replace the value of this slot with `new_value`, and return
    /// the old value.
    ///
    /// SAFETY: the pointer in this [`FreeSlotPtr`] must be valid for writes, and `new_value` must
    /// be obtained from `freeq`.
    unsafe fn replace(
        &mut self,
        new_value: Option<FreeSlot>,
        _cs: critical_section::CriticalSection,
    ) -> Option<FreeSlot> {
        // SAFETY: we are in a critical section.
        unsafe { core::ptr::replace(self.0, new_value) }
    }
}

unsafe impl Send for FreeSlotPtr {}

unsafe impl Sync for FreeSlotPtr {}

/// Lets the closures in `send` and `recv` share the pointer to their
/// wait-queue link across contexts.
struct LinkPtr<T>(*mut Option<Link<T>>);

impl<T> LinkPtr<T> {
    /// This will dereference the pointer stored within and give out an `&mut`.
    unsafe fn get(&mut self) -> &mut Option<Link<T>> {
        &mut *self.0
    }
}

impl<T> Clone for LinkPtr<T> {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

unsafe impl<T> Send for LinkPtr<T> {}

unsafe impl<T> Sync for LinkPtr<T> {}

/// An MPSC channel for use in no-alloc systems. `N` sets the size of the queue.
///
/// This channel uses critical sections, however there are extremely small and all `memcpy`
/// operations of `T` are done without critical sections.
pub struct Channel<T, const N: usize> {
    // Here are all indexes that are not used in `slots` and ready to be allocated.
    freeq: UnsafeCell<Deque<u8, N>>,
    // Here are indexes to slots that are ready to be dequeued by the receiver.
    readyq: UnsafeCell<Deque<u8, N>>,
    // A parked receiver waits here, with the priority it is waiting at.
    recv_wait_queue: WaitQueue,
    // Storage for N `T`s, so we don't memcpy around a lot of `T`s.
    slots: [UnsafeCell<MaybeUninit<T>>; N],
    // If there is no room in the queue a `Sender` can wait for there to be place in the queue.
    send_wait_queue: SendWaitQueue,
    // Keep track of the receiver.
    receiver_dropped: UnsafeCell<bool>,
    // Keep track of the number of senders.
    num_senders: UnsafeCell<usize>,
}

unsafe impl<T, const N: usize> Send for Channel<T, N> {}

unsafe impl<T, const N: usize> Sync for Channel<T, N> {}

impl<T, const N: usize> Channel<T, N> {
    const _CHECK: () = assert!(N < 256, "This queue support a maximum of 255 entries");

    /// Create a new channel.
    pub const fn new() -> Self {
        let _ = Self::_CHECK;

        Self {
            freeq: UnsafeCell::new(Deque::new()),
            readyq: UnsafeCell::new(Deque::new()),
            recv_wait_queue: WaitQueue::new(),
            slots: [const { UnsafeCell::new(MaybeUninit::uninit()) }; N],
            send_wait_queue: SendWaitQueue::new(),
            receiver_dropped: UnsafeCell::new(false),
            num_senders: UnsafeCell::new(0),
        }
    }

    /// Split the queue into a `Sender`/`Receiver` pair.
    pub fn split(&mut self) -> (Sender<'_, T, N>, Receiver<'_, T, N>) {
        // Fill free queue
        for idx in 0..N as u8 {
            self.freeq.with_mut(|freeq| {
                let freeq = unsafe { &mut *freeq };
                assert!(!freeq.is_full());

                // SAFETY: This safe as the loop goes from 0 to the capacity of the underlying queue.
                unsafe {
                    freeq.push_back_unchecked(idx);
                }
            });
        }

        self.freeq.with(|freeq| {
            assert!(unsafe { &*freeq }.is_full());
        });

        // There is now 1 sender
        self.num_senders.with_mut(|v| unsafe {
            *v = 1;
        });

        (Sender(self), Receiver(self))
    }

    fn freeq<F, R>(&self, _cs: critical_section::CriticalSection, f: F) -> R
    where
        F: FnOnce(&mut Deque<u8, N>) -> R,
    {
        self.freeq.with_mut(|freeq| {
            let queue = unsafe { &mut *freeq };
            f(queue)
        })
    }

    fn readyq<F, R>(&self, _cs: critical_section::CriticalSection, f: F) -> R
    where
        F: FnOnce(&mut Deque<u8, N>) -> R,
    {
        self.readyq.with_mut(|readyq| {
            let queue = unsafe { &mut *readyq };
            f(queue)
        })
    }

    fn receiver_dropped<F, R>(&self, _cs: critical_section::CriticalSection, f: F) -> R
    where
        F: FnOnce(&mut bool) -> R,
    {
        self.receiver_dropped.with_mut(|receiver_dropped| {
            let receiver_dropped = unsafe { &mut *receiver_dropped };
            f(receiver_dropped)
        })
    }

    fn num_senders<F, R>(&self, _cs: critical_section::CriticalSection, f: F) -> R
    where
        F: FnOnce(&mut usize) -> R,
    {
        self.num_senders.with_mut(|num_senders| {
            let num_senders = unsafe { &mut *num_senders };
            f(num_senders)
        })
    }

    /// Wake the receiver if it is parked, and report the priority it was
    /// waiting at.
    fn wake_receiver(&self) -> Option<Priority> {
        critical_section::with(|_| {
            if let Some(waiter) = self.recv_wait_queue.pop() {
                let priority = waiter.priority;
                waiter.waker.wake();

                Some(priority)
            } else {
                None
            }
        })
    }

    /// Return free slot `slot` to the channel.
    ///
    /// This will do one of two things:
    /// 1. If there are any waiting `send`-ers, wake the highest-priority one and hand it `slot`.
    /// 2. else, insert `slot` into the free queue.
    ///
    /// SAFETY: `slot` must be obtained from this exact channel instance.
    unsafe fn return_free_slot(&self, slot: FreeSlot) {
        critical_section::with(|cs| {
            fence(Ordering::SeqCst);

            // If a sender is waiting in the wait queue, wake the first one up & hand it the free slot.
            if let Some(SendWaiter {
                waker,
                mut free_slot_ptr,
                ..
            }) = self.send_wait_queue.pop()
            {
                // SAFETY: `free_slot_ptr` is valid for writes: we are in a critical
                // section & the `FreeSlotPtr` lives for at least the duration of the wait queue link.
                unsafe { free_slot_ptr.replace(Some(slot), cs) };
                waker.wake();
            } else {
                self.freeq(cs, |freeq| {
                    assert!(!freeq.is_full());
                    // SAFETY: `freeq` is not full.
                    unsafe { freeq.push_back_unchecked(slot.0) };
                });
            }
        });
    }
}

/// Creates a split channel with `'static` lifetime.
#[macro_export]
macro_rules! make_channel {
    ($type:ty, $size:expr) => {{
        static mut CHANNEL: $crate::channel::Channel<$type, $size> =
            $crate::channel::Channel::new();

        static CHECK: $crate::portable_atomic::AtomicU8 = $crate::portable_atomic::AtomicU8::new(0);

        $crate::channel::critical_section::with(|_| {
            if CHECK.load(::core::sync::atomic::Ordering::Relaxed) != 0 {
                panic!("call to the same `make_channel` instance twice");
            }

            CHECK.store(1, ::core::sync::atomic::Ordering::Relaxed);
        });

        // SAFETY: This is safe as we hide the static mut from others to access it.
        // Only this point is where the mutable access happens.
        #[allow(static_mut_refs)]
        unsafe {
            CHANNEL.split()
        }
    }};
}

// -------- Sender

/// Error state for when the receiver has been dropped.
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct NoReceiver<T>(pub T);

/// Errors that `try_send` and `send_front_from_interrupt` can have.
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum TrySendError<T> {
    /// Error state for when the receiver has been dropped.
    NoReceiver(T),
    /// Error state when the queue is full.
    Full(T),
}

impl<T> core::fmt::Debug for NoReceiver<T>
where
    T: core::fmt::Debug,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "NoReceiver({:?})", self.0)
    }
}

impl<T> core::fmt::Debug for TrySendError<T>
where
    T: core::fmt::Debug,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TrySendError::NoReceiver(v) => write!(f, "NoReceiver({v:?})"),
            TrySendError::Full(v) => write!(f, "Full({v:?})"),
        }
    }
}

impl<T> PartialEq for TrySendError<T>
where
    T: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TrySendError::NoReceiver(v1), TrySendError::NoReceiver(v2)) => v1.eq(v2),
            (TrySendError::NoReceiver(_), TrySendError::Full(_)) => false,
            (TrySendError::Full(_), TrySendError::NoReceiver(_)) => false,
            (TrySendError::Full(v1), TrySendError::Full(v2)) => v1.eq(v2),
        }
    }
}

/// A `Sender` can send to the channel and can be cloned.
pub struct Sender<'a, T, const N: usize>(&'a Channel<T, N>);

unsafe impl<T, const N: usize> Send for Sender<'_, T, N> {}

impl<T, const N: usize> core::fmt::Debug for Sender<'_, T, N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Sender")
    }
}

#[cfg(feature = "defmt-03")]
impl<T, const N: usize> defmt::Format for Sender<'_, T, N> {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "Sender",)
    }
}

impl<T, const N: usize> Sender<'_, T, N> {
    #[inline(always)]
    fn send_footer(&mut self, slot: FreeSlot, val: T) {
        let idx = slot.0;

        // Write the value to the slots, note; this memcpy is not under a critical section.
        unsafe {
            let ptr = (&raw const self.0.slots[0]).add(idx as usize);
            let ptr = ptr as *mut UnsafeCell<MaybeUninit<T>>;
            ptr::write(ptr, UnsafeCell::new(MaybeUninit::new(val)));
        }

        // Write the value into the ready queue.
        critical_section::with(|cs| {
            assert!(!self.0.readyq(cs, |q| q.is_full()));
            unsafe { self.0.readyq(cs, |q| q.push_back_unchecked(idx)) }
        });

        fence(Ordering::SeqCst);

        // If the receiver is parked, wake it.
        self.0.wake_receiver();
    }

    /// Try to send a value, non-blocking. If the channel is full this will return an error.
    pub fn try_send(&mut self, val: T) -> Result<(), TrySendError<T>> {
        // No receiver available.
        if self.is_closed() {
            return Err(TrySendError::NoReceiver(val));
        }

        // A non-empty free queue means no sender is parked: freed slots are
        // handed to parked senders before they ever reach the queue.
        let idx =
            if let Some(idx) = critical_section::with(|cs| self.0.freeq(cs, |q| q.pop_front())) {
                idx
            } else {
                return Err(TrySendError::Full(val));
            };

        self.send_footer(FreeSlot(idx), val);

        Ok(())
    }

    /// Push a value to the front of the queue so the receiver dequeues it
    /// next, non-blocking. For use in interrupt handlers.
    ///
    /// If the channel is full the value is handed back in the error. On
    /// success the priority a parked receiver was waiting at is returned, so
    /// the caller can decide whether a reschedule is in order.
    pub fn send_front_from_interrupt(&mut self, val: T) -> Result<Option<Priority>, TrySendError<T>> {
        // No receiver available.
        if self.is_closed() {
            return Err(TrySendError::NoReceiver(val));
        }

        let idx =
            if let Some(idx) = critical_section::with(|cs| self.0.freeq(cs, |q| q.pop_front())) {
                idx
            } else {
                return Err(TrySendError::Full(val));
            };

        // Write the value to the slots, note; this memcpy is not under a critical section.
        unsafe {
            let ptr = (&raw const self.0.slots[0]).add(idx as usize);
            let ptr = ptr as *mut UnsafeCell<MaybeUninit<T>>;
            ptr::write(ptr, UnsafeCell::new(MaybeUninit::new(val)));
        }

        // The front of the ready queue, so it overtakes the whole backlog.
        critical_section::with(|cs| {
            assert!(!self.0.readyq(cs, |q| q.is_full()));
            unsafe { self.0.readyq(cs, |q| q.push_front_unchecked(idx)) }
        });

        fence(Ordering::SeqCst);

        Ok(self.0.wake_receiver())
    }

    /// Send a value, waiting with the given priority if there is no place
    /// left in the queue. Room is granted to the highest-priority waiting
    /// sender first.
    ///
    /// If the receiver does not exist this will return an error.
    pub async fn send(&mut self, val: T, priority: Priority) -> Result<(), NoReceiver<T>> {
        let mut free_slot_ptr: Option<FreeSlot> = None;
        let mut link_ptr: Option<Link<SendWaiter>> = None;

        // Make this future `Drop`-safe.
        // SAFETY(link_ptr): Shadow the original definition of `link_ptr` so we can't abuse it.
        let mut link_ptr = LinkPtr(core::ptr::addr_of_mut!(link_ptr));
        // SAFETY(new): `free_slot_ptr` is alive until at least after `link_ptr` is popped.
        let mut free_slot_ptr = unsafe { FreeSlotPtr::new(core::ptr::addr_of_mut!(free_slot_ptr)) };

        let mut link_ptr2 = link_ptr.clone();
        let mut free_slot_ptr2 = free_slot_ptr.clone();
        let dropper = OnDrop::new(|| {
            // SAFETY: We only run this closure and dereference the pointer if we have
            // exited the `poll_fn` below in the `drop(dropper)` call. The other dereference
            // of this pointer is in the `poll_fn`.
            critical_section::with(|cs| {
                if let Some(link) = unsafe { link_ptr2.get() } {
                    if !link.is_popped() {
                        self.0.send_wait_queue.delete(link as *const _ as usize);
                    }
                }

                // Return a slot that was handed to us but that we never used.
                if let Some(freed_slot) = unsafe { free_slot_ptr2.take(cs) } {
                    // SAFETY: `freed_slot` is a free slot in our referenced channel.
                    unsafe { self.0.return_free_slot(freed_slot) };
                }
            });
        });

        let idx = poll_fn(|cx| {
            //  Do all this in one critical section, else there can be race conditions
            critical_section::with(|cs| {
                fence(Ordering::SeqCst);

                if self.0.receiver_dropped(cs, |v| *v) {
                    return Poll::Ready(Err(()));
                }

                // SAFETY: This pointer is only dereferenced here and on drop of the future
                // which happens outside this `poll_fn`'s stack frame.
                let link = unsafe { link_ptr.get() };

                // We are already in the wait queue.
                if let Some(link) = link {
                    if link.is_popped() {
                        // SAFETY: `free_slot_ptr` is valid for writes until the end of this future.
                        let slot = unsafe { free_slot_ptr.take(cs) };

                        // If our link is popped, then:
                        // 1. a freed slot was handed to us, or
                        // 2. the receiver was dropped and the wakeup carried no slot,
                        //    which the closed check above already answered.
                        if let Some(slot) = slot {
                            Poll::Ready(Ok(slot))
                        } else {
                            Poll::Ready(Err(()))
                        }
                    } else {
                        Poll::Pending
                    }
                }
                // A free slot is available.
                else if let Some(idx) = self.0.freeq(cs, |q| q.pop_front()) {
                    Poll::Ready(Ok(FreeSlot(idx)))
                }
                // We are not in the wait queue, and no free slot is available.
                else {
                    // Place the link in the wait queue.
                    let link_ref = link.insert(Link::new(SendWaiter {
                        priority,
                        waker: cx.waker().clone(),
                        free_slot_ptr: free_slot_ptr.clone(),
                    }));

                    // SAFETY(new_unchecked): The address to the link is stable as it is defined
                    // outside this stack frame.
                    // SAFETY(insert): `link_ref` lifetime comes from `link_ptr` and `free_slot_ptr`
                    // that are shadowed and we make sure in `dropper` that the link is removed from
                    // the queue before dropping `link_ptr` AND `dropper` makes sure that the shadowed
                    // `ptr`s live until the end of the stack frame.
                    let _ = unsafe { self.0.send_wait_queue.insert(Pin::new_unchecked(link_ref)) };

                    Poll::Pending
                }
            })
        })
        .await;

        // Make sure the link is removed from the queue.
        drop(dropper);

        if let Ok(slot) = idx {
            self.send_footer(slot, val);

            Ok(())
        } else {
            Err(NoReceiver(val))
        }
    }

    /// Returns true if there is no `Receiver`s.
    pub fn is_closed(&self) -> bool {
        critical_section::with(|cs| self.0.receiver_dropped(cs, |v| *v))
    }

    /// Is the queue full.
    pub fn is_full(&self) -> bool {
        critical_section::with(|cs| self.0.freeq(cs, |q| q.is_empty()))
    }

    /// Is the queue empty.
    pub fn is_empty(&self) -> bool {
        critical_section::with(|cs| self.0.freeq(cs, |q| q.is_full()))
    }

    /// The number of values waiting to be dequeued.
    pub fn len(&self) -> usize {
        critical_section::with(|cs| self.0.readyq(cs, |q| q.len()))
    }
}

impl<T, const N: usize> Drop for Sender<'_, T, N> {
    fn drop(&mut self) {
        // Count down the reference counter
        let num_senders = critical_section::with(|cs| {
            self.0.num_senders(cs, |v| {
                *v -= 1;
                *v
            })
        });

        // If there are no senders, wake the receiver to do error handling.
        if num_senders == 0 {
            self.0.wake_receiver();
        }
    }
}

impl<T, const N: usize> Clone for Sender<'_, T, N> {
    fn clone(&self) -> Self {
        // Count up the reference counter
        critical_section::with(|cs| self.0.num_senders(cs, |v| *v += 1));

        Self(self.0)
    }
}

// -------- Receiver

/// A receiver of the channel. There can only be one receiver at any time.
pub struct Receiver<'a, T, const N: usize>(&'a Channel<T, N>);

unsafe impl<T, const N: usize> Send for Receiver<'_, T, N> {}

impl<T, const N: usize> core::fmt::Debug for Receiver<'_, T, N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Receiver")
    }
}

#[cfg(feature = "defmt-03")]
impl<T, const N: usize> defmt::Format for Receiver<'_, T, N> {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "Receiver",)
    }
}

/// Possible receive errors.
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ReceiveError {
    /// Error state for when all senders has been dropped.
    NoSender,
    /// Error state for when the queue is empty.
    Empty,
}

impl<T, const N: usize> Receiver<'_, T, N> {
    /// Receives a value if there is one in the channel, non-blocking.
    pub fn try_recv(&mut self) -> Result<T, ReceiveError> {
        // Try to get a ready slot.
        let ready_slot = critical_section::with(|cs| self.0.readyq(cs, |q| q.pop_front()));

        if let Some(rs) = ready_slot {
            // Read the value from the slots, note; this memcpy is not under a critical section.
            let r = unsafe {
                let ptr = (&raw const self.0.slots[0]).add(rs as usize);
                ptr::read(ptr).into_inner().assume_init()
            };

            // SAFETY: `rs` is a free slot obtained from this channel.
            unsafe { self.0.return_free_slot(FreeSlot(rs)) };

            Ok(r)
        } else if self.is_closed() {
            Err(ReceiveError::NoSender)
        } else {
            Err(ReceiveError::Empty)
        }
    }

    /// Receives a value, parking with the given priority if the queue is
    /// empty. The priority is reported to interrupt-context senders so they
    /// can tell whether waking this receiver warrants a reschedule.
    ///
    /// If all senders are dropped this will error with `NoSender`.
    pub async fn recv(&mut self, priority: Priority) -> Result<T, ReceiveError> {
        let mut link_ptr: Option<Link<Waiter>> = None;

        // Make this future `Drop`-safe.
        // SAFETY(link_ptr): Shadow the original definition of `link_ptr` so we can't abuse it.
        let mut link_ptr = LinkPtr(core::ptr::addr_of_mut!(link_ptr));

        let mut link_ptr2 = link_ptr.clone();
        let dropper = OnDrop::new(|| {
            // SAFETY: We only run this closure and dereference the pointer if we have
            // exited the `poll_fn` below in the `drop(dropper)` call. The other dereference
            // of this pointer is in the `poll_fn`.
            critical_section::with(|_| {
                if let Some(link) = unsafe { link_ptr2.get() } {
                    if !link.is_popped() {
                        self.0.recv_wait_queue.delete(link as *const _ as usize);
                    }
                }
            });
        });

        let res = poll_fn(|cx| {
            //  Check the queue and park in one critical section, else a send
            //  can slip in between them and its wakeup is lost.
            let ready_slot = critical_section::with(|cs| {
                fence(Ordering::SeqCst);

                // A value is ready to be dequeued.
                if let Some(rs) = self.0.readyq(cs, |q| q.pop_front()) {
                    return Some(Ok(rs));
                }

                // All senders are gone.
                if self.0.num_senders(cs, |v| *v == 0) {
                    return Some(Err(ReceiveError::NoSender));
                }

                // SAFETY: This pointer is only dereferenced here and on drop of the future
                // which happens outside this `poll_fn`'s stack frame.
                let link = unsafe { link_ptr.get() };
                if link.is_none() {
                    // Park on the first run. A wakeup while parked always
                    // means a value or a closed channel, which the checks
                    // above pick up.
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
                    let _ = unsafe { self.0.recv_wait_queue.insert(Pin::new_unchecked(link_ref)) };
                }

                None
            });

            match ready_slot {
                Some(Ok(rs)) => {
                    // Read the value from the slots, note; this memcpy is not under a critical section.
                    let r = unsafe {
                        let ptr = (&raw const self.0.slots[0]).add(rs as usize);
                        ptr::read(ptr).into_inner().assume_init()
                    };

                    // SAFETY: `rs` is a free slot obtained from this channel.
                    unsafe { self.0.return_free_slot(FreeSlot(rs)) };

                    Poll::Ready(Ok(r))
                }
                Some(Err(e)) => Poll::Ready(Err(e)),
                None => Poll::Pending,
            }
        })
        .await;

        // Make sure the link is removed from the queue.
        drop(dropper);

        res
    }

    /// Returns true if there are no `Sender`s.
    pub fn is_closed(&self) -> bool {
        critical_section::with(|cs| self.0.num_senders(cs, |v| *v == 0))
    }

    /// Is the queue full.
    pub fn is_full(&self) -> bool {
        critical_section::with(|cs| self.0.readyq(cs, |q| q.is_full()))
    }

    /// Is the queue empty.
    pub fn is_empty(&self) -> bool {
        critical_section::with(|cs| self.0.readyq(cs, |q| q.is_empty()))
    }

    /// The number of values waiting to be dequeued.
    pub fn len(&self) -> usize {
        critical_section::with(|cs| self.0.readyq(cs, |q| q.len()))
    }
}

impl<T, const N: usize> Drop for Receiver<'_, T, N> {
    fn drop(&mut self) {
        // Mark the receiver as dropped and wake all waiters
        critical_section::with(|cs| self.0.receiver_dropped(cs, |v| *v = true));

        while let Some(waiter) = self.0.send_wait_queue.pop() {
            waiter.waker.wake();
        }
    }
}


#[cfg(test)]
mod stress_test {
    use super::*;

    #[tokio::test]
    async fn stress_channel() {
        const NUM_RUNS: usize = 1_000;
        const QUEUE_SIZE: usize = 10;

        let (s, mut r) = make_channel!(u32, QUEUE_SIZE);
        let mut v = std::vec::Vec::new();

        for i in 0..NUM_RUNS {
            let mut s = s.clone();

            v.push(tokio::spawn(async move {
                s.send(i as _, Priority::new((i % 4) as u8)).await.unwrap();
            }));
        }

        let mut map = std::collections::BTreeSet::new();

        for _ in 0..NUM_RUNS {
            map.insert(r.recv(Priority::new(1)).await.unwrap());
        }

        assert_eq!(map.len(), NUM_RUNS);

        for v in v {
            v.await.unwrap();
        }
    }
}
