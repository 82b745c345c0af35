//! The common interface shared by [`Task`](super::task::Task),
//! [`Barrier`](super::barrier::Barrier) and [`Gate`](super::gate::Gate).
//!
//! All three are reference-counted condition variables at heart: each
//! tracks a number of outstanding conditions and a list of successors to
//! signal once those conditions are all met. What differs between them is
//! the successor storage (bounded vs. unbounded) and what "signalling"
//! ultimately does (run queued work, release a pool slot, wake a thread).
//! A single trait object lets any of them attach to any other as a
//! successor without the caller needing to know which concrete kind it is.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A condition-counted, reference-counted synchronization node.
pub trait SyncPrimitive: Send + Sync {
    /// Increase the number of outstanding conditions by `count`, returning
    /// the count observed immediately before this call.
    fn impose_condition(&self, count: u32) -> u32;

    /// Signal that one previously-imposed condition has been satisfied.
    /// When the last outstanding condition is signalled, the primitive
    /// fires: successors are signalled and any queued work proceeds.
    fn signal_condition(&self);

    /// Register `successor` to be signalled once this primitive fires.
    ///
    /// If this primitive has already fired, `successor` is signalled
    /// immediately instead of being queued.
    fn attach_successor(&self, successor: Arc<dyn SyncPrimitive>);

    fn retain_reference(&self);

    fn release_reference(&self);
}

/// A minimal test-and-test-and-set spin lock.
///
/// Task successor lists are small and held only for the handful of
/// instructions needed to push or drain them, so spinning avoids the cost
/// of parking a thread for what is, in the overwhelmingly common case, an
/// uncontended or briefly-contended critical section.
pub struct SpinLock<T> {
    locked: AtomicUsize,
    value: std::cell::UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinLock<T> {}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> SpinLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            locked: AtomicUsize::new(0),
            value: std::cell::UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        SpinLockGuard { lock: self }
    }
}

impl<T> std::ops::Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> std::ops::DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn spin_lock_serializes_access() {
        let lock = Arc::new(SpinLock::new(0u32));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 8000);
    }
}
