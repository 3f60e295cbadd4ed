//! Pool of fixed-size scratch buffers for streaming I/O.
//!
//! A [`BufferSlot`] goes back to the pool when dropped, on every exit path.
//! When all slots are out, `acquire` blocks until one is returned. Callers that
//! need two buffers at once take them together with `acquire_pair`, so two
//! half-served callers can never wait on each other.

use std::ops::{Deref, DerefMut};

use parking_lot::{Condvar, Mutex};

struct SlotState {
    free: Vec<Vec<u8>>,
    outstanding: usize,
}

pub struct BufferSlots {
    slot_size: usize,
    max_slots: usize,
    state: Mutex<SlotState>,
    returned: Condvar,
}

impl BufferSlots {
    pub fn new(slot_size: usize, max_slots: usize) -> Self {
        Self {
            slot_size: slot_size.max(1),
            max_slots: max_slots.max(2),
            state: Mutex::new(SlotState {
                free: Vec::new(),
                outstanding: 0,
            }),
            returned: Condvar::new(),
        }
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Take a slot, waiting for one to come back if the pool is exhausted.
    pub fn acquire(&self) -> BufferSlot<'_> {
        let mut buffers = self.take(1);
        self.slot(buffers.pop())
    }

    /// Take two slots in one step. Never holds one while waiting for the other.
    pub fn acquire_pair(&self) -> (BufferSlot<'_>, BufferSlot<'_>) {
        let mut buffers = self.take(2);
        let second = self.slot(buffers.pop());
        let first = self.slot(buffers.pop());
        (first, second)
    }

    fn take(&self, count: usize) -> Vec<Vec<u8>> {
        let mut state = self.state.lock();
        while self.max_slots - state.outstanding < count {
            self.returned.wait(&mut state);
        }
        state.outstanding += count;
        let keep = state.free.len().saturating_sub(count);
        state.free.split_off(keep)
    }

    // Allocation happens outside the lock, and only until the pool is warm.
    fn slot(&self, buffer: Option<Vec<u8>>) -> BufferSlot<'_> {
        let buffer = buffer.unwrap_or_else(|| vec![0u8; self.slot_size]);
        BufferSlot { pool: self, buffer }
    }

    /// Slots currently handed out.
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    fn release(&self, mut buffer: Vec<u8>) {
        buffer.resize(self.slot_size, 0);
        let mut state = self.state.lock();
        state.outstanding -= 1;
        state.free.push(buffer);
        // Pair waiters may need more than this one slot, so everyone rechecks.
        self.returned.notify_all();
    }
}

/// Scoped ownership of one pooled buffer. Starts with `slot_size` bytes.
pub struct BufferSlot<'a> {
    pool: &'a BufferSlots,
    buffer: Vec<u8>,
}

impl Deref for BufferSlot<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buffer
    }
}

impl DerefMut for BufferSlot<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }
}

impl Drop for BufferSlot<'_> {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buffer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_slot_has_fixed_size() {
        let slots = BufferSlots::new(4096, 2);
        let slot = slots.acquire();
        assert_eq!(slot.len(), 4096);
        assert_eq!(slots.outstanding(), 1);
        drop(slot);
        assert_eq!(slots.outstanding(), 0);
    }

    #[test]
    fn test_slot_returned_after_shrink() {
        let slots = BufferSlots::new(128, 2);
        {
            let mut slot = slots.acquire();
            slot.clear();
            slot.extend_from_slice(b"abc");
        }
        let slot = slots.acquire();
        assert_eq!(slot.len(), 128);
    }

    #[test]
    fn test_slot_returned_on_error_path() {
        fn failing(slots: &BufferSlots) -> Result<(), &'static str> {
            let _slot = slots.acquire();
            Err("failed")
        }

        let slots = BufferSlots::new(16, 2);
        assert!(failing(&slots).is_err());
        assert_eq!(slots.outstanding(), 0);
    }

    #[test]
    fn test_pool_never_smaller_than_a_pair() {
        let slots = BufferSlots::new(16, 1);
        let (a, b) = slots.acquire_pair();
        assert_eq!((a.len(), b.len()), (16, 16));
        assert_eq!(slots.outstanding(), 2);
        drop((a, b));
        assert_eq!(slots.outstanding(), 0);
    }

    #[test]
    fn test_pair_waits_for_two_free_slots() {
        let slots = Arc::new(BufferSlots::new(16, 3));
        let first = slots.acquire();
        let second = slots.acquire();

        let s = Arc::clone(&slots);
        let waiter = std::thread::spawn(move || {
            let _pair = s.acquire_pair();
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        assert_eq!(slots.outstanding(), 2);
        drop(first);
        waiter.join().unwrap();
        drop(second);
        assert_eq!(slots.outstanding(), 0);
    }

    #[test]
    fn test_concurrent_pairs_make_progress() {
        let slots = Arc::new(BufferSlots::new(64, 3));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let slots = Arc::clone(&slots);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let (mut a, mut b) = slots.acquire_pair();
                        a[0] = 1;
                        b[0] = 2;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(slots.outstanding(), 0);
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let slots = Arc::new(BufferSlots::new(16, 2));
        let first = slots.acquire();
        let _held = slots.acquire();

        let s = Arc::clone(&slots);
        let waiter = std::thread::spawn(move || {
            let _second = s.acquire();
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        drop(first);
        waiter.join().unwrap();
        assert_eq!(slots.outstanding(), 0);
    }
}
