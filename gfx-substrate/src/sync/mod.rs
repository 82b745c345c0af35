//! CPU-side synchronization core: [`Task`], [`Barrier`] and [`Gate`] share a
//! common condition/reference-counted [`SyncPrimitive`] interface, plus the
//! [`manager`] bridge that lets GPU timeline semaphore moments drive them.

pub mod barrier;
pub mod gate;
pub mod manager;
pub mod primitive;
pub mod task;

pub use barrier::{Barrier, BarrierSuccessorPool};
pub use gate::Gate;
pub use manager::SyncManager;
pub use primitive::{SpinLock, SyncPrimitive};
pub use task::{Task, WorkerPool};
