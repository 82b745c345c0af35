//! Append-only singly-linked chain built over a [`LockfreePool`].
//!
//! Producers race to prepend entries onto the chain with a single
//! `AtomicU32` compare-exchange; the top bit of that word marks the hopper
//! closed. Once closed, no further pushes succeed and the chain may be
//! drained by a single consumer. This is the shape used for barrier
//! successor lists: unbounded fan-in during the barrier's open phase,
//! drained exactly once when it fires.

use std::sync::atomic::{AtomicU32, Ordering};

use super::lockfree_pool::LockfreePool;

const CLOSED_BIT: u32 = 1 << 31;
const NIL: u32 = CLOSED_BIT - 1;

/// A pool entry suitable for chaining through a [`LockfreeHopper`].
///
/// `value` is `Option<T>` rather than a bare `T` so `HopperEntry<T>` is
/// `Default`-constructible (and thus poolable via [`LockfreePool::new`])
/// for any `T`, including unsized-behind-`Arc` types like
/// `Arc<dyn SyncPrimitive>` that have no `Default` impl of their own.
pub struct HopperEntry<T> {
    pub value: Option<T>,
    next: AtomicU32,
}

impl<T> Default for HopperEntry<T> {
    fn default() -> Self {
        Self {
            value: None,
            next: AtomicU32::new(NIL),
        }
    }
}

/// A closeable, append-only chain of indices into a shared pool.
pub struct LockfreeHopper {
    head: AtomicU32,
}

impl Default for LockfreeHopper {
    fn default() -> Self {
        Self::new()
    }
}

impl LockfreeHopper {
    pub fn new() -> Self {
        Self {
            head: AtomicU32::new(NIL),
        }
    }

    /// Whether the hopper has been closed.
    pub fn is_closed(&self) -> bool {
        self.head.load(Ordering::Acquire) & CLOSED_BIT != 0
    }

    /// Prepend `index` (already populated via `pool.get_mut`) onto the
    /// chain. Returns `false` without consuming `index` if already closed;
    /// the caller remains responsible for releasing it back to `pool`.
    pub fn push<T>(&self, pool: &LockfreePool<HopperEntry<T>>, index: u32) -> bool {
        let mut current = self.head.load(Ordering::Acquire);
        loop {
            if current & CLOSED_BIT != 0 {
                return false;
            }
            unsafe { pool.get(index) }.next.store(current, Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(current, index, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Mark the hopper closed. Idempotent; safe to call concurrently with
    /// `push`, which will start failing once this is observed.
    pub fn close(&self) {
        let mut current = self.head.load(Ordering::Acquire);
        loop {
            if current & CLOSED_BIT != 0 {
                return;
            }
            match self.head.compare_exchange_weak(
                current,
                current | CLOSED_BIT,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Close (if not already) and take ownership of draining the chain.
    ///
    /// Only one caller may drain a given hopper; the pool indices yielded
    /// must each be released back to `pool` by the caller once consumed.
    pub fn drain<'a, T>(&self, pool: &'a LockfreePool<HopperEntry<T>>) -> HopperDrain<'a, T> {
        let head = self.head.swap(CLOSED_BIT, Ordering::AcqRel) & !CLOSED_BIT;
        HopperDrain { pool, next: head }
    }
}

pub struct HopperDrain<'a, T> {
    pool: &'a LockfreePool<HopperEntry<T>>,
    next: u32,
}

impl<'a, T> Iterator for HopperDrain<'a, T> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.next == NIL {
            return None;
        }
        let index = self.next;
        self.next = unsafe { self.pool.get(index) }.next.load(Ordering::Acquire);
        Some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_yields_entries_in_reverse_push_order() {
        let pool: LockfreePool<HopperEntry<u32>> = LockfreePool::new(4);
        let hopper = LockfreeHopper::new();

        for value in [1u32, 2, 3] {
            let idx = pool.acquire().unwrap();
            unsafe { pool.get_mut(idx) }.value = Some(value);
            assert!(hopper.push(&pool, idx));
        }

        let drained: Vec<u32> = hopper
            .drain(&pool)
            .map(|idx| unsafe { pool.get(idx) }.value.unwrap())
            .collect();
        assert_eq!(drained, vec![3, 2, 1]);
        assert!(hopper.is_closed());
    }

    #[test]
    fn push_fails_after_close() {
        let pool: LockfreePool<HopperEntry<u32>> = LockfreePool::new(1);
        let hopper = LockfreeHopper::new();
        hopper.close();
        let idx = pool.acquire().unwrap();
        assert!(!hopper.push(&pool, idx));
        pool.release(idx);
    }
}
