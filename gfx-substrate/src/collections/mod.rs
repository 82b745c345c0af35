//! Leaf data structures shared by the sync core, staging ring and buffer
//! atlas: none of these know about GPU resources, only about indices and
//! bits.

pub mod buddy_tree;
pub mod indices_stack;
pub mod lockfree_hopper;
pub mod lockfree_pool;
pub mod queue;
pub mod robin_hood_map;

pub use buddy_tree::BuddyTree;
pub use indices_stack::IndicesStack;
pub use lockfree_hopper::{HopperEntry, LockfreeHopper};
pub use lockfree_pool::LockfreePool;
pub use queue::RingQueue;
pub use robin_hood_map::RobinHoodMap;
