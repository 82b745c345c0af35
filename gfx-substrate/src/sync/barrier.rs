//! Fan-in barrier with an unbounded successor list.
//!
//! Unlike [`Task`](super::task::Task), a [`Barrier`] makes no assumption
//! about how many successors will attach to it, so its successor list lives
//! on a [`LockfreeHopper`] threaded through a pool shared by every barrier
//! in a [`BarrierSuccessorPool`] rather than an inline array. Firing drains
//! that chain, releasing each slot back to the shared pool *before*
//! signalling the corresponding successor — a successor's own
//! `signal_condition` can recursively cascade into further firings, and we
//! do not want this barrier still holding pool capacity hostage while that
//! cascade runs.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::collections::{HopperEntry, LockfreeHopper, LockfreePool};

use super::primitive::SyncPrimitive;

/// Backing storage for every barrier's successor chains.
///
/// Construct one of these per sync core (or per thread-group that shares
/// barriers) and pass it to every [`Barrier::new`].
pub struct BarrierSuccessorPool {
    pool: LockfreePool<HopperEntry<Arc<dyn SyncPrimitive>>>,
}

impl BarrierSuccessorPool {
    pub fn new(capacity: u32) -> Arc<Self> {
        Arc::new(Self {
            pool: LockfreePool::new(capacity),
        })
    }
}

/// A one-shot fan-in gate: fires once every imposed condition has been
/// signalled, then signals an unbounded set of successors.
pub struct Barrier {
    successor_pool: Arc<BarrierSuccessorPool>,
    hopper: LockfreeHopper,
    condition_count: AtomicU32,
    reference_count: AtomicU32,
}

impl Barrier {
    /// A barrier with one initial imposed condition, mirroring [`Task`]'s
    /// convention: callers typically `impose_condition` for each known
    /// predecessor, attach those predecessors, and finally `signal_condition`
    /// once to release the setup hold.
    pub fn new(successor_pool: Arc<BarrierSuccessorPool>) -> Arc<Self> {
        Arc::new(Self {
            successor_pool,
            hopper: LockfreeHopper::new(),
            condition_count: AtomicU32::new(1),
            reference_count: AtomicU32::new(1),
        })
    }

    fn fire(&self) {
        self.hopper.close();
        let mut signalled: Vec<Arc<dyn SyncPrimitive>> = Vec::new();
        for index in self.hopper.drain(&self.successor_pool.pool) {
            let successor = unsafe { self.successor_pool.pool.get(index) }
                .value
                .clone()
                .expect("hopper entry pushed without a successor installed");
            self.successor_pool.pool.release(index);
            signalled.push(successor);
        }
        for successor in signalled {
            successor.signal_condition();
        }
    }
}

impl SyncPrimitive for Barrier {
    fn impose_condition(&self, count: u32) -> u32 {
        self.condition_count.fetch_add(count, Ordering::AcqRel)
    }

    fn signal_condition(&self) {
        if self.condition_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.fire();
        }
    }

    fn attach_successor(&self, successor: Arc<dyn SyncPrimitive>) {
        loop {
            let Some(index) = self.successor_pool.pool.acquire() else {
                // Shared successor pool momentarily exhausted; back off and
                // retry rather than silently dropping the successor.
                std::hint::spin_loop();
                continue;
            };
            unsafe { self.successor_pool.pool.get_mut(index) }.value = Some(successor.clone());
            if self.hopper.push(&self.successor_pool.pool, index) {
                return;
            }
            // Hopper already closed (we already fired): release the slot
            // and signal the successor directly instead of queueing it.
            self.successor_pool.pool.release(index);
            successor.signal_condition();
            return;
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
    use crate::sync::task::{Task, WorkerPool};
    use std::sync::mpsc;

    #[test]
    fn fires_successors_only_after_all_conditions_signalled() {
        let successor_pool = BarrierSuccessorPool::new(16);
        let barrier = Barrier::new(Arc::clone(&successor_pool));
        barrier.impose_condition(2);

        let pool = Arc::new(WorkerPool::new(2));
        let (tx, rx) = mpsc::channel();
        let successor = Task::new(Arc::clone(&pool), Box::new(move || tx.send(()).unwrap()));
        successor.impose_condition(1);
        barrier.attach_successor(successor.clone() as Arc<dyn SyncPrimitive>);
        successor.signal_condition();

        barrier.signal_condition(); // release setup hold
        assert!(rx.recv_timeout(std::time::Duration::from_millis(100)).is_err());
        barrier.signal_condition();
        barrier.signal_condition();
        rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn attach_after_fire_signals_immediately() {
        let successor_pool = BarrierSuccessorPool::new(4);
        let barrier = Barrier::new(Arc::clone(&successor_pool));
        barrier.signal_condition();

        let pool = Arc::new(WorkerPool::new(1));
        let (tx, rx) = mpsc::channel();
        let successor = Task::new(Arc::clone(&pool), Box::new(move || tx.send(()).unwrap()));
        successor.impose_condition(1);
        barrier.attach_successor(successor.clone() as Arc<dyn SyncPrimitive>);
        successor.signal_condition();

        rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn many_successors_fan_in_from_a_single_barrier() {
        let successor_pool = BarrierSuccessorPool::new(64);
        let barrier = Barrier::new(Arc::clone(&successor_pool));
        let pool = Arc::new(WorkerPool::new(4));
        let (tx, rx) = mpsc::channel();

        for _ in 0..32 {
            let tx = tx.clone();
            let successor = Task::new(Arc::clone(&pool), Box::new(move || tx.send(()).unwrap()));
            successor.impose_condition(1);
            barrier.attach_successor(successor.clone() as Arc<dyn SyncPrimitive>);
            successor.signal_condition();
        }
        barrier.signal_condition();

        for _ in 0..32 {
            rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        }
    }
}
