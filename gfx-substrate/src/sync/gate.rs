//! One-shot mutex/condvar primitive.
//!
//! A [`Gate`] is the simplest of the three primitives: it has no successor
//! fan-out machinery of its own, just a boolean that flips once and a
//! condvar to wake anyone blocked on [`Gate::wait`]. It still implements
//! [`SyncPrimitive`] so it can be handed to a [`Task`](super::task::Task) or
//! [`Barrier`](super::barrier::Barrier) as a successor — useful when a
//! caller simply wants to block a thread until a task graph reaches a
//! particular point, rather than queue more work.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::primitive::SyncPrimitive;

pub struct Gate {
    condition_count: AtomicU32,
    reference_count: AtomicU32,
    opened: Mutex<bool>,
    signal: Condvar,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            condition_count: AtomicU32::new(1),
            reference_count: AtomicU32::new(1),
            opened: Mutex::new(false),
            signal: Condvar::new(),
        })
    }

    /// Block the calling thread until the gate opens.
    pub fn wait(&self) {
        let mut opened = self.opened.lock();
        while !*opened {
            self.signal.wait(&mut opened);
        }
    }

    /// Block with a timeout; returns whether the gate had opened by then.
    pub fn wait_timeout(&self, timeout: std::time::Duration) -> bool {
        let mut opened = self.opened.lock();
        if *opened {
            return true;
        }
        let result = self.signal.wait_for(&mut opened, timeout);
        *opened || !result.timed_out()
    }

    pub fn is_open(&self) -> bool {
        *self.opened.lock()
    }
}

impl Default for Gate {
    fn default() -> Self {
        // `Gate::new` returns an `Arc<Gate>` because every other constructor
        // in this module does; `Default` is provided separately for callers
        // embedding a bare `Gate` in their own reference-counted structure.
        Self {
            condition_count: AtomicU32::new(1),
            reference_count: AtomicU32::new(1),
            opened: Mutex::new(false),
            signal: Condvar::new(),
        }
    }
}

impl SyncPrimitive for Gate {
    fn impose_condition(&self, count: u32) -> u32 {
        self.condition_count.fetch_add(count, Ordering::AcqRel)
    }

    fn signal_condition(&self) {
        if self.condition_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            *self.opened.lock() = true;
            self.signal.notify_all();
        }
    }

    fn attach_successor(&self, successor: Arc<dyn SyncPrimitive>) {
        // A gate has no successor list: if already open, signal immediately;
        // otherwise there is nowhere to park the successor, since a thread
        // blocked in `wait` is not represented as a `SyncPrimitive`. Gates
        // are meant to be leaves of a task graph, not interior nodes.
        if self.is_open() {
            successor.signal_condition();
        } else {
            debug_assert!(
                false,
                "Gate does not support deferred successors; wait() on it directly instead"
            );
        }
    }

    fn retain_reference(&self) {
        self.reference_count.fetch_add(1, Ordering::AcqRel);
    }

    fn release_reference(&self) {
        self.reference_count.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_blocks_until_signalled() {
        let gate = Gate::new();
        let waiter = Arc::clone(&gate);
        let handle = thread::spawn(move || waiter.wait());

        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());

        gate.signal_condition();
        handle.join().unwrap();
        assert!(gate.is_open());
    }

    #[test]
    fn wait_timeout_reports_false_when_unopened() {
        let gate = Gate::new();
        assert!(!gate.wait_timeout(Duration::from_millis(20)));
        gate.signal_condition();
        assert!(gate.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn multiple_conditions_require_every_signal() {
        let gate = Gate::new();
        gate.impose_condition(2);
        gate.signal_condition();
        assert!(!gate.is_open());
        gate.signal_condition();
        assert!(!gate.is_open());
        gate.signal_condition();
        assert!(gate.is_open());
    }
}
