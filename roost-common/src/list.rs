//! An intrusive sorted linked list used for wait queues and timer queues.

use core::marker::PhantomPinned;
use core::pin::Pin;
use core::sync::atomic::fence;
use critical_section as cs;
use portable_atomic::{AtomicBool, AtomicPtr, Ordering};

/// An atomic sorted linked list.
///
/// The list is kept in ascending order of `T`; the head holds the smallest
/// element, and elements that compare equal stay in insertion order. Atomicity
/// is guaranteed using very short [`critical_section`]s, so this list is _not_
/// lock free, but it will not deadlock.
pub struct SortedLinkedList<T> {
    head: AtomicPtr<Link<T>>,
}

impl<T> SortedLinkedList<T> {
    /// Create a new linked list.
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Check if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed).is_null()
    }
}

impl<T> Default for SortedLinkedList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: PartialOrd + Clone> SortedLinkedList<T> {
    /// Pop the first element in the list if the closure returns true.
    ///
    /// The closure runs on the head element's value even when it answers no,
    /// so callers can observe the head without popping it.
    pub fn pop_if<F: FnOnce(&T) -> bool>(&self, f: F) -> Option<T> {
        cs::with(|_| {
            // Make sure all previous writes are visible
            fence(Ordering::SeqCst);

            let head = self.head.load(Ordering::Relaxed);

            // SAFETY: `as_ref` is safe as `insert` requires a valid reference to a link
            if let Some(head_ref) = unsafe { head.as_ref() } {
                if f(&head_ref.val) {
                    // Move head to the next element
                    self.head
                        .store(head_ref.next.load(Ordering::Relaxed), Ordering::Relaxed);

                    head_ref.next.store(core::ptr::null_mut(), Ordering::Relaxed);
                    head_ref.popped.store(true, Ordering::Relaxed);

                    // We read the value at head
                    let head_val = head_ref.val.clone();

                    return Some(head_val);
                }
            }
            None
        })
    }

    /// Pop the first element in the list.
    pub fn pop(&self) -> Option<T> {
        self.pop_if(|_| true)
    }

    /// Delete a link at an address. Does nothing if the link is not in the list.
    pub fn delete(&self, addr: usize) {
        cs::with(|_| {
            // Make sure all previous writes are visible
            fence(Ordering::SeqCst);

            let head = self.head.load(Ordering::Relaxed);

            // SAFETY: `as_ref` is safe as `insert` requires a valid reference to a link
            let head_ref = if let Some(head_ref) = unsafe { head.as_ref() } {
                head_ref
            } else {
                // 1. List is empty, do nothing
                return;
            };

            if head as *const _ as usize == addr {
                // 2. Replace head with head.next
                self.head
                    .store(head_ref.next.load(Ordering::Relaxed), Ordering::Relaxed);

                head_ref.next.store(core::ptr::null_mut(), Ordering::Relaxed);

                return;
            }

            // 3. search list for correct node
            let mut curr = head_ref;
            let mut next = head_ref.next.load(Ordering::Relaxed);

            // SAFETY: `as_ref` is safe as `insert` requires a valid reference to a link
            while let Some(next_link) = unsafe { next.as_ref() } {
                // Next is not null

                if next as *const _ as usize == addr {
                    curr.next
                        .store(next_link.next.load(Ordering::Relaxed), Ordering::Relaxed);

                    next_link.next.store(core::ptr::null_mut(), Ordering::Relaxed);

                    return;
                }

                // Continue searching
                curr = next_link;
                next = next_link.next.load(Ordering::Relaxed);
            }
        })
    }

    /// Insert a new link into the linked list.
    /// The return is (updated head, address), where the address of the link is for use
    /// with `delete`.
    ///
    /// # Safety
    ///
    /// The pinned link must live until it is popped or deleted from this list.
    pub unsafe fn insert(&self, val: Pin<&Link<T>>) -> (bool, usize) {
        cs::with(|_| {
            // SAFETY: This datastructure does not move the underlying value.
            let val = val.get_ref();
            let addr = val as *const _ as usize;

            // Make sure all previous writes are visible
            fence(Ordering::SeqCst);

            let head = self.head.load(Ordering::Relaxed);

            // 3 cases to handle

            // 1. List is empty, write to head
            // SAFETY: `as_ref` is safe as `insert` requires a valid reference to a link
            let head_ref = if let Some(head_ref) = unsafe { head.as_ref() } {
                head_ref
            } else {
                self.head
                    .store(val as *const _ as *mut _, Ordering::Relaxed);
                return (true, addr);
            };

            // 2. val needs to go in first
            if val.val < head_ref.val {
                // Set current head as next of `val`
                val.next.store(head, Ordering::Relaxed);

                // `val` is now first in the list
                self.head
                    .store(val as *const _ as *mut _, Ordering::Relaxed);

                return (true, addr);
            }

            // 3. search list for correct place
            let mut curr = head_ref;
            let mut next = head_ref.next.load(Ordering::Relaxed);

            // SAFETY: `as_ref` is safe as `insert` requires a valid reference to a link
            while let Some(next_link) = unsafe { next.as_ref() } {
                // Next is not null

                if val.val < next_link.val {
                    // Replace next with `val`
                    val.next.store(next, Ordering::Relaxed);

                    // Insert `val`
                    curr.next
                        .store(val as *const _ as *mut _, Ordering::Relaxed);

                    return (false, addr);
                }

                // Continue searching
                curr = next_link;
                next = next_link.next.load(Ordering::Relaxed);
            }

            // No next, write link to last position in list
            curr.next
                .store(val as *const _ as *mut _, Ordering::Relaxed);

            (false, addr)
        })
    }
}

/// A link in the linked list.
pub struct Link<T> {
    pub(crate) val: T,
    next: AtomicPtr<Link<T>>,
    popped: AtomicBool,
    _up: PhantomPinned,
}

impl<T> Link<T> {
    /// Create a new link.
    pub const fn new(val: T) -> Self {
        Self {
            val,
            next: AtomicPtr::new(core::ptr::null_mut()),
            popped: AtomicBool::new(false),
            _up: PhantomPinned,
        }
    }

    /// Return true if this link has been popped from the list.
    ///
    /// A popped link is no longer reachable from the list, so its storage may
    /// be reused or dropped.
    pub fn is_popped(&self) -> bool {
        self.popped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Ordered by `key` only, so equal keys exercise the stable-order path.
    #[derive(Clone, Debug)]
    struct Entry {
        key: u8,
        tag: u8,
    }

    impl Entry {
        fn new(key: u8, tag: u8) -> Self {
            Self { key, tag }
        }
    }

    impl PartialEq for Entry {
        fn eq(&self, other: &Self) -> bool {
            self.key == other.key
        }
    }

    impl PartialOrd for Entry {
        fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
            self.key.partial_cmp(&other.key)
        }
    }

    #[test]
    fn insert_sorts_ascending() {
        let list = SortedLinkedList::<Entry>::new();
        assert!(list.is_empty());

        let l3 = Link::new(Entry::new(3, 0));
        let l1 = Link::new(Entry::new(1, 0));
        let l2 = Link::new(Entry::new(2, 0));

        unsafe {
            let (head_updated, _) = list.insert(Pin::new_unchecked(&l3));
            assert!(head_updated);
            let (head_updated, _) = list.insert(Pin::new_unchecked(&l1));
            assert!(head_updated);
            let (head_updated, _) = list.insert(Pin::new_unchecked(&l2));
            assert!(!head_updated);
        }

        assert_eq!(list.pop().unwrap().key, 1);
        assert_eq!(list.pop().unwrap().key, 2);
        assert_eq!(list.pop().unwrap().key, 3);
        assert!(list.pop().is_none());
        assert!(list.is_empty());

        assert!(l1.is_popped());
        assert!(l2.is_popped());
        assert!(l3.is_popped());
    }

    #[test]
    fn equal_keys_keep_insertion_order() {
        let list = SortedLinkedList::<Entry>::new();

        let a = Link::new(Entry::new(5, 1));
        let b = Link::new(Entry::new(5, 2));
        let c = Link::new(Entry::new(5, 3));

        unsafe {
            list.insert(Pin::new_unchecked(&a));
            list.insert(Pin::new_unchecked(&b));
            list.insert(Pin::new_unchecked(&c));
        }

        assert_eq!(list.pop().unwrap().tag, 1);
        assert_eq!(list.pop().unwrap().tag, 2);
        assert_eq!(list.pop().unwrap().tag, 3);
    }

    #[test]
    fn delete_unlinks_nodes() {
        let list = SortedLinkedList::<Entry>::new();

        let a = Link::new(Entry::new(1, 0));
        let b = Link::new(Entry::new(2, 0));
        let c = Link::new(Entry::new(3, 0));

        let (a_addr, b_addr) = unsafe {
            let (_, a_addr) = list.insert(Pin::new_unchecked(&a));
            let (_, b_addr) = list.insert(Pin::new_unchecked(&b));
            list.insert(Pin::new_unchecked(&c));
            (a_addr, b_addr)
        };

        // Delete from the middle, then the head.
        list.delete(b_addr);
        list.delete(a_addr);
        // Deleting something that is not in the list is a no-op.
        list.delete(b_addr);

        assert!(!a.is_popped());
        assert!(!b.is_popped());

        assert_eq!(list.pop().unwrap().key, 3);
        assert!(list.is_empty());
    }

    #[test]
    fn pop_if_observes_head_without_popping() {
        let list = SortedLinkedList::<Entry>::new();

        let a = Link::new(Entry::new(7, 0));
        unsafe { list.insert(Pin::new_unchecked(&a)) };

        let mut seen = None;
        assert!(list
            .pop_if(|e| {
                seen = Some(e.key);
                false
            })
            .is_none());

        assert_eq!(seen, Some(7));
        assert!(!a.is_popped());
        assert!(!list.is_empty());

        assert_eq!(list.pop().unwrap().key, 7);
    }
}
