//! Worker-pool-dispatched task with a bounded successor list.
//!
//! A [`Task`] wraps a unit of work that runs once every condition imposed on
//! it has been signalled. Firing dispatches the work onto a shared
//! [`WorkerPool`] and, once that work completes, signals every successor in
//! turn. Successor storage is a small inline [`SmallVec`] guarded by a
//! [`SpinLock`], alongside a completion flag the same lock protects: task
//! graphs in practice fan out to a handful of successors, rarely more, so
//! spilling to the heap is the exception rather than the rule. A successor
//! attached after the task has already fired is signalled immediately
//! instead of being queued onto a list nothing will ever drain again.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use once_cell::sync::OnceCell;
use smallvec::SmallVec;

use super::primitive::{SpinLock, SyncPrimitive};

/// Inline capacity for a task's successor list before it spills to the heap.
const INLINE_SUCCESSORS: usize = 4;

type BoxedWork = Box<dyn FnOnce() + Send + 'static>;

/// A pool of OS worker threads that run queued task bodies.
///
/// This is the scheduler backing every [`Task`]; in practice an application
/// constructs one `WorkerPool` and shares it (via `Arc`) across all tasks it
/// creates.
pub struct WorkerPool {
    shared: Arc<WorkerShared>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

struct WorkerShared {
    queue: Mutex<std::collections::VecDeque<BoxedWork>>,
    signal: Condvar,
    shutdown: std::sync::atomic::AtomicBool,
}

impl WorkerPool {
    pub fn new(thread_count: usize) -> Self {
        let shared = Arc::new(WorkerShared {
            queue: Mutex::new(std::collections::VecDeque::new()),
            signal: Condvar::new(),
            shutdown: std::sync::atomic::AtomicBool::new(false),
        });

        let threads = (0..thread_count.max(1))
            .map(|index| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("gfx-substrate-worker-{index}"))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { shared, threads }
    }

    pub fn dispatch(&self, work: BoxedWork) {
        let mut queue = self.shared.queue.lock().unwrap();
        queue.push_back(work);
        self.shared.signal.notify_one();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.signal.notify_all();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<WorkerShared>) {
    loop {
        let mut queue = shared.queue.lock().unwrap();
        loop {
            if let Some(work) = queue.pop_front() {
                drop(queue);
                work();
                break;
            }
            if shared.shutdown.load(Ordering::Acquire) {
                return;
            }
            queue = shared.signal.wait(queue).unwrap();
        }
    }
}

/// Successor list plus completion flag, guarded by a single spin lock so
/// `attach_successor` can check-and-append (or check-and-signal) atomically
/// with respect to `fire` marking the task complete.
#[derive(Default)]
struct Successors {
    complete: bool,
    list: SmallVec<[Arc<dyn SyncPrimitive>; INLINE_SUCCESSORS]>,
}

/// A unit of work gated behind a condition count, dispatched to a
/// [`WorkerPool`] once ready.
pub struct Task {
    self_weak: OnceCell<Weak<Task>>,
    pool: Arc<WorkerPool>,
    condition_count: AtomicU32,
    reference_count: AtomicU32,
    successors: SpinLock<Successors>,
    work: Mutex<Option<BoxedWork>>,
}

impl Task {
    /// Create a task with one initial imposed condition (the work itself
    /// needs one "go ahead" signal, conventionally fired by whoever
    /// submitted it once all of its dependencies are wired up) and the
    /// given body.
    pub fn new(pool: Arc<WorkerPool>, work: BoxedWork) -> Arc<Self> {
        let task = Arc::new(Self {
            self_weak: OnceCell::new(),
            pool,
            condition_count: AtomicU32::new(1),
            reference_count: AtomicU32::new(1),
            successors: SpinLock::new(Successors::default()),
            work: Mutex::new(Some(work)),
        });
        let _ = task.self_weak.set(Arc::downgrade(&task));
        task
    }

    fn fire(&self) {
        let Some(this) = self.self_weak.get().and_then(Weak::upgrade) else {
            return;
        };
        let work = self.work.lock().unwrap().take();
        self.pool.dispatch(Box::new(move || {
            if let Some(work) = work {
                work();
            }
            let successors = {
                let mut successors = this.successors.lock();
                successors.complete = true;
                std::mem::take(&mut successors.list)
            };
            for successor in successors {
                successor.signal_condition();
            }
            this.release_reference();
        }));
    }
}

impl SyncPrimitive for Task {
    fn impose_condition(&self, count: u32) -> u32 {
        self.condition_count.fetch_add(count, Ordering::AcqRel)
    }

    fn signal_condition(&self) {
        if self.condition_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.fire();
        }
    }

    fn attach_successor(&self, successor: Arc<dyn SyncPrimitive>) {
        let mut successors = self.successors.lock();
        if successors.complete {
            drop(successors);
            successor.signal_condition();
        } else {
            successors.list.push(successor);
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
    use std::sync::mpsc;

    #[test]
    fn task_runs_once_all_conditions_signalled() {
        let pool = Arc::new(WorkerPool::new(2));
        let (tx, rx) = mpsc::channel();
        let task = Task::new(
            Arc::clone(&pool),
            Box::new(move || {
                tx.send(()).unwrap();
            }),
        );
        task.impose_condition(1);
        task.signal_condition();
        assert!(rx.recv_timeout(std::time::Duration::from_secs(1)).is_err());
        task.signal_condition();
        rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn successors_fire_after_task_completes() {
        let pool = Arc::new(WorkerPool::new(2));
        let (tx, rx) = mpsc::channel::<&'static str>();

        let tx_successor = tx.clone();
        let successor = Task::new(
            Arc::clone(&pool),
            Box::new(move || {
                tx_successor.send("successor").unwrap();
            }),
        );

        let predecessor = Task::new(
            Arc::clone(&pool),
            Box::new(move || {
                tx.send("predecessor").unwrap();
            }),
        );
        successor.impose_condition(1);
        predecessor.attach_successor(successor.clone() as Arc<dyn SyncPrimitive>);
        successor.signal_condition(); // release the setup hold

        predecessor.signal_condition();

        assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap(), "predecessor");
        assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap(), "successor");
    }

    #[test]
    fn attach_after_completion_signals_immediately() {
        // Drive the `complete` flag directly rather than through
        // `signal_condition`'s asynchronous worker-pool dispatch, so the
        // "already fired" branch of `attach_successor` is exercised
        // deterministically instead of racing a background thread.
        let pool = Arc::new(WorkerPool::new(1));
        let task = Task::new(Arc::clone(&pool), Box::new(|| {}));
        task.successors.lock().complete = true;

        let (tx, rx) = mpsc::channel();
        let successor = Task::new(
            Arc::clone(&pool),
            Box::new(move || {
                tx.send(()).unwrap();
            }),
        );
        successor.impose_condition(1);
        task.attach_successor(successor.clone() as Arc<dyn SyncPrimitive>);
        successor.signal_condition();

        rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert!(task.successors.lock().list.is_empty(), "successor must not be queued once complete");
    }
}
