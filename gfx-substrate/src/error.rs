//! Crate-wide error type.

use thiserror::Error;

/// Everything that can go wrong talking to the Vulkan-class device or
/// operating the substrates built on top of it.
#[derive(Debug, Error)]
pub enum GfxError {
    #[error("vulkan call failed: {0}")]
    Vulkan(#[from] ash::vk::Result),

    #[error("device memory allocation failed: {0}")]
    Allocation(#[from] gpu_alloc::AllocationError),

    #[error("device memory mapping failed: {0}")]
    MapError(#[from] gpu_alloc::MapError),

    #[error("required device feature `{0}` is not supported")]
    MissingFeature(&'static str),

    #[error("buffer atlas exhausted: requested {requested} bytes with no evictable region large enough")]
    AtlasExhausted { requested: u64 },

    #[error("buffer atlas identifier map is full even after evicting every available region")]
    AtlasMapFull,

    #[error("region identifier {0:#x} is not present in the buffer atlas")]
    RegionAbsent(u64),

    #[error("region identifier {0:#x} is present but not yet visible from the requesting accessor slot")]
    RegionNotInitialised(u64),

    #[error("staging ring allocation of {requested} bytes exceeds ring capacity of {capacity} bytes")]
    StagingTooLarge { requested: u64, capacity: u64 },

    #[error("timeline semaphore wait timed out after {0:?}")]
    Timeout(std::time::Duration),
}

pub type Result<T> = std::result::Result<T, GfxError>;
