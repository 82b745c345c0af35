//! Bounded, fixed-capacity free-list pool.
//!
//! Acquiring and releasing slots is wait-free-ish lock-free: a single packed
//! `AtomicU64` head holds `{ version, index }`, CAS'd in a loop. The version
//! half is bumped on every successful operation so that a thread resuming
//! after a stall never mistakes a freed-and-reacquired index for the one it
//! last observed (the classic ABA hazard for free-list head pointers).

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const NIL: u32 = u32::MAX;

fn pack(version: u32, index: u32) -> u64 {
    (u64::from(version) << 32) | u64::from(index)
}

fn unpack(packed: u64) -> (u32, u32) {
    ((packed >> 32) as u32, packed as u32)
}

/// A fixed-size pool of `T` slots handed out by index.
///
/// The pool itself does not know when a `T` is "live"; it only tracks which
/// indices are on the free list. Callers are responsible for resetting slot
/// contents on acquire and for not touching an index after releasing it.
pub struct LockfreePool<T> {
    entries: Box<[UnsafeCell<T>]>,
    next: Box<[AtomicU32]>,
    head: AtomicU64,
}

unsafe impl<T: Send> Sync for LockfreePool<T> {}

impl<T: Default> LockfreePool<T> {
    pub fn new(capacity: u32) -> Self {
        let entries: Box<[UnsafeCell<T>]> = (0..capacity)
            .map(|_| UnsafeCell::new(T::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let next: Box<[AtomicU32]> = (0..capacity)
            .map(|i| AtomicU32::new(if i + 1 < capacity { i + 1 } else { NIL }))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let head = AtomicU64::new(pack(0, if capacity == 0 { NIL } else { 0 }));
        Self { entries, next, head }
    }

    pub fn capacity(&self) -> u32 {
        self.entries.len() as u32
    }

    /// Pop a free index, or `None` if the pool is exhausted.
    pub fn acquire(&self) -> Option<u32> {
        let mut current = self.head.load(Ordering::Acquire);
        loop {
            let (version, index) = unpack(current);
            if index == NIL {
                return None;
            }
            let next_index = self.next[index as usize].load(Ordering::Relaxed);
            let new_head = pack(version.wrapping_add(1), next_index);
            match self
                .head
                .compare_exchange_weak(current, new_head, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(index),
                Err(observed) => current = observed,
            }
        }
    }

    /// Return `index` to the free list.
    ///
    /// The caller must have exclusive ownership of `index` (obtained from
    /// `acquire` and not yet released) and must not access it again until it
    /// is reacquired.
    pub fn release(&self, index: u32) {
        debug_assert!(index < self.capacity());
        let mut current = self.head.load(Ordering::Acquire);
        loop {
            let (version, head_index) = unpack(current);
            self.next[index as usize].store(head_index, Ordering::Relaxed);
            let new_head = pack(version.wrapping_add(1), index);
            match self
                .head
                .compare_exchange_weak(current, new_head, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// # Safety
    /// `index` must currently be held by the caller (see [`Self::release`]).
    pub unsafe fn get(&self, index: u32) -> &T {
        &*self.entries[index as usize].get()
    }

    /// # Safety
    /// Same requirement as [`Self::get`]; the caller must also guarantee no
    /// other reference to this slot is alive concurrently.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self, index: u32) -> &mut T {
        &mut *self.entries[index as usize].get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn acquire_exhausts_and_release_replenishes() {
        let pool: LockfreePool<u32> = LockfreePool::new(2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        pool.release(a);
        assert_eq!(pool.acquire(), Some(a));
        pool.release(b);
        pool.release(a);
    }

    #[test]
    fn writes_through_acquired_slot_are_visible() {
        let pool: LockfreePool<u32> = LockfreePool::new(1);
        let idx = pool.acquire().unwrap();
        unsafe {
            *pool.get_mut(idx) = 42;
            assert_eq!(*pool.get(idx), 42);
        }
    }

    #[test]
    fn concurrent_acquire_release_never_double_hands_out() {
        let pool = Arc::new(LockfreePool::<u32>::new(8));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    if let Some(idx) = pool.acquire() {
                        pool.release(idx);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut seen = Vec::new();
        while let Some(idx) = pool.acquire() {
            seen.push(idx);
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 8);
    }
}
