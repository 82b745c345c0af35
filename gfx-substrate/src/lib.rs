//! Buddy-allocated buffer atlas, staging ring, and a CPU task/barrier/gate
//! sync core bridged to GPU timeline semaphore moments, layered over a
//! Vulkan-class device.
//!
//! # Layout
//!
//! - [`collections`] — the leaf data structures everything else is built
//!   from: the buddy tree, lock-free pool and hopper, the Robin Hood hash
//!   map, the ring queue and the plain growable stack.
//! - [`timeline`] — timeline semaphore moments: the currency the sync core
//!   and the GPU exchange.
//! - [`sync`] — [`sync::Task`], [`sync::Barrier`], [`sync::Gate`] and the
//!   [`sync::SyncManager`] bridge from GPU moments to CPU signals.
//! - [`staging`] — the host-visible upload ring.
//! - [`atlas`] — the device-local, content-addressed buffer atlas.
//! - [`device`] — the thin `ash` + `gpu-alloc` device wrapper everything
//!   above takes as a parameter rather than owning.

pub mod atlas;
pub mod collections;
pub mod device;
pub mod error;
pub mod staging;
pub mod sync;
pub mod timeline;

pub use atlas::{BufferAtlas, BufferAtlasCreateInfo, ObtainOutcome};
pub use device::Device;
pub use error::{GfxError, Result};
pub use staging::StagingRing;
pub use timeline::{Moment, TimelineSemaphore};
