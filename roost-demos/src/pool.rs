//! A fixed pool of resource slots read round-robin by whoever holds a permit.

use roost_common::unsafecell::UnsafeCell;

/// A fixed array of opaque values with one shared read cursor.
///
/// The cursor belongs to no single reader: whichever task calls [`read_next`]
/// advances it for everyone. The read and the advance happen in one critical
/// section, so concurrent readers get distinct, in-order slots.
///
/// [`read_next`]: SlotPool::read_next
pub struct SlotPool<const N: usize> {
    values: [i32; N],
    cursor: UnsafeCell<usize>,
}

unsafe impl<const N: usize> Sync for SlotPool<N> {}

impl<const N: usize> SlotPool<N> {
    /// Create a pool holding `values`.
    pub const fn new(values: [i32; N]) -> Self {
        assert!(N > 0, "a slot pool cannot be empty");

        Self {
            values,
            cursor: UnsafeCell::new(0),
        }
    }

    /// Read the slot under the cursor and move the cursor one slot forward,
    /// wrapping at the end of the pool.
    ///
    /// Call this only while holding a permit of the semaphore that bounds
    /// access to the pool.
    pub fn read_next(&self) -> i32 {
        critical_section::with(|_| {
            self.cursor.with_mut(|cursor| {
                // SAFETY: the cursor is only touched here, inside the
                // critical section.
                unsafe {
                    let idx = *cursor;
                    *cursor = (idx + 1) % N;
                    self.values[idx]
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_wraps_around() {
        let pool = SlotPool::new([111, 222, 333]);

        // One full cycle visits every slot once, in order.
        assert_eq!(pool.read_next(), 111);
        assert_eq!(pool.read_next(), 222);
        assert_eq!(pool.read_next(), 333);

        // The next read starts the cycle over.
        assert_eq!(pool.read_next(), 111);
    }

    #[test]
    fn single_slot_pool_repeats() {
        let pool = SlotPool::new([7]);

        assert_eq!(pool.read_next(), 7);
        assert_eq!(pool.read_next(), 7);
    }
}
