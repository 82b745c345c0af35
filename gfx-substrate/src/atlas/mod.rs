//! Buffer atlas: a single large device buffer, sub-allocated by a
//! [`BuddyTree`], content-addressed by caller-supplied `u64` identifiers,
//! and evicted oldest-first once a region's retain count drops to zero.
//!
//! Every identified region has exactly one writer: the accessor slot that
//! first obtains it. That slot may freely read and rewrite the region
//! across its own (possibly many) access ranges; every other slot is
//! refused access until the writer's creating range has closed and its
//! last-use moment has elapsed, at which point the region becomes visible
//! to reads from any slot and immutable from then on. Transient regions
//! skip the identifier map entirely and are writer-only for their single
//! access range.

pub mod access_range;
pub mod region;

use ash::vk;

use crate::collections::{BuddyTree, RobinHoodMap};
use crate::device::{Buffer, Device};
use crate::error::{GfxError, Result};
use crate::timeline::Moment;

use access_range::AccessorTable;
use region::{Region, RegionArena, INVALID_INDEX, MAX_RETAIN_COUNT};

const IDENTIFIER_MULTIPLIER: u64 = 0x5851_f42d_4c95_7f2d;
const IDENTIFIER_INCREMENT: u64 = 0x7a41_11ac_0ffe_e60d;

/// Parameters for [`BufferAtlas::create`].
pub struct BufferAtlasCreateInfo {
    pub buffer_usage: vk::BufferUsageFlags,
    pub buffer_size: u64,
    pub required_memory_properties: vk::MemoryPropertyFlags,
    pub desired_memory_properties: vk::MemoryPropertyFlags,
    /// Granularity of the buddy tree; `buffer_size` must be a multiple of
    /// this and regions are rounded up to the next power of two of it.
    pub base_allocation_size: u64,
    /// Number of independent accessor slots this atlas will track,
    /// `1..=255`.
    pub accessor_slot_count: u8,
    /// Whether concurrent callers from multiple threads are possible. When
    /// `false`, callers are trusted to serialize their own access and the
    /// atlas's internal lock is uncontended (and thus effectively free);
    /// when `true` every public operation still takes the same lock, there
    /// being no safe way in Rust to skip it as the source this crate is
    /// modelled on does.
    pub multithreaded: bool,
}

/// Outcome of [`BufferAtlas::obtain_identified_region`]: whether the region
/// already existed or had to be allocated fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObtainOutcome {
    Found,
    Inserted,
}

struct Shared {
    buffer: Buffer,
    granularity: u64,
    buddy: BuddyTree,
    regions: RegionArena,
    identifiers: RobinHoodMap<u32>,
    accessors: AccessorTable,
    identifier_rng: u64,
}

impl Shared {
    fn size_exponent_for(&self, size_bytes: u64) -> u32 {
        let units = size_bytes.div_ceil(self.granularity).max(1);
        32 - ((units - 1) as u32).leading_zeros()
    }

    /// Evict the single oldest zero-retained region, freeing its buddy
    /// allocation and identifier map entry. Returns whether one was found.
    fn evict_oldest_available(&mut self) -> bool {
        let Some(index) = self.regions.available_ring_oldest() else {
            return false;
        };
        let region = self.regions.get(index);
        debug_assert_eq!(region.retain_count, 0);
        debug_assert!(!region.is_transient);
        self.buddy.release(region.offset);
        if region.identifier != 0 {
            self.identifiers.remove(region.identifier);
        }
        self.regions.available_ring_unlink(index);
        self.regions.deallocate(index);
        true
    }

    /// Release every region retained by each just-elapsed access range:
    /// mark each visible to secondary readers, drop one retain, and move it
    /// to the available ring (or straight back to the buddy tree, if
    /// transient) once its retain count hits zero.
    fn release_completed_access_ranges(&mut self, device: &ash::Device) {
        let regions = &mut self.regions;
        let buddy = &mut self.buddy;
        self.accessors.drain_elapsed(device, |range| {
            while let Some(region_index) = range.retained_region_indices.pop() {
                let region = regions.get_mut(region_index);
                region.visible_from_read_accessors = true;
                debug_assert!(region.retain_count > 0);
                region.retain_count -= 1;
                if region.is_transient {
                    debug_assert_eq!(region.retain_count, 0);
                    buddy.release(region.offset);
                    regions.deallocate(region_index);
                } else if region.retain_count == 0 {
                    regions.available_ring_push_newest(region_index);
                }
            }
        });
    }

    /// Retain an already-present region on behalf of `accessor_slot`: valid
    /// if that slot is the writer or the region has become visible to
    /// secondary readers; otherwise the region exists but cannot yet be
    /// read from this slot.
    fn retain_existing(&mut self, accessor_slot: u32, region_index: u32) -> Result<(u64, u64)> {
        let region = self.regions.get(region_index);
        if region.write_accessor_slot as u32 != accessor_slot && !region.visible_from_read_accessors {
            return Err(GfxError::RegionNotInitialised(region.identifier));
        }

        if region.retain_count == 0 {
            self.regions.available_ring_unlink(region_index);
        }

        let region = self.regions.get_mut(region_index);
        debug_assert!(region.retain_count < MAX_RETAIN_COUNT, "region retain count overflow");
        region.retain_count += 1;
        let offset_bytes = u64::from(region.offset) * self.granularity;
        let buddy_size_exponent = self.buddy.query_size_exponent(region.offset);
        let size_bytes = (1u64 << buddy_size_exponent) * self.granularity;

        self.accessors
            .get_mut(accessor_slot)
            .access_range
            .retained_region_indices
            .push(region_index);

        Ok((offset_bytes, size_bytes))
    }

    /// Allocate a fresh region (evicting as needed) for a write on
    /// `accessor_slot`, sized at least `size_bytes`.
    fn allocate_region(&mut self, accessor_slot: u32, size_bytes: u64, identifier: u64, is_transient: bool) -> Result<(u32, u64)> {
        let exponent = self.size_exponent_for(size_bytes);
        let offset = loop {
            if let Some(offset) = self.buddy.acquire(exponent) {
                break offset;
            }
            if !self.evict_oldest_available() {
                return Err(GfxError::AtlasExhausted { requested: size_bytes });
            }
        };

        let region = Region {
            identifier,
            offset,
            prev: INVALID_INDEX,
            next: INVALID_INDEX,
            retain_count: 1,
            write_accessor_slot: accessor_slot as u8,
            visible_from_read_accessors: false,
            is_transient,
        };
        let index = self.regions.allocate(region);
        self.accessors
            .get_mut(accessor_slot)
            .access_range
            .retained_region_indices
            .push(index);
        Ok((index, u64::from(offset) * self.granularity))
    }
}

/// Content-addressed, buddy-suballocated device buffer with per-accessor-slot
/// visibility gating. See the module documentation for the write-visibility
/// model.
pub struct BufferAtlas {
    shared: parking_lot::Mutex<Shared>,
    multithreaded: bool,
}

impl BufferAtlas {
    pub fn create(device: &Device, create_info: &BufferAtlasCreateInfo) -> Result<Self> {
        assert!(
            (1..=255).contains(&create_info.accessor_slot_count),
            "accessor_slot_count must be in 1..=255"
        );
        assert!(
            create_info.base_allocation_size > 0 && create_info.buffer_size % create_info.base_allocation_size == 0,
            "buffer_size must be a multiple of base_allocation_size"
        );
        let units = (create_info.buffer_size / create_info.base_allocation_size) as u32;
        let buffer = device.create_buffer_for_properties(
            create_info.buffer_size,
            create_info.buffer_usage,
            create_info.required_memory_properties,
            create_info.desired_memory_properties,
        )?;

        Ok(Self {
            shared: parking_lot::Mutex::new(Shared {
                buffer,
                granularity: create_info.base_allocation_size,
                buddy: BuddyTree::new(units),
                regions: RegionArena::new(),
                identifiers: RobinHoodMap::new(),
                accessors: AccessorTable::new(create_info.accessor_slot_count),
                identifier_rng: 0x853c_49e6_748f_ea9b,
            }),
            multithreaded: create_info.multithreaded,
        })
    }

    fn lock(&self) -> parking_lot::MutexGuard<'_, Shared> {
        // `multithreaded` only documents the caller's intent; the lock is
        // always taken since there is no sound way to elide it per-instance
        // in safe Rust, and an uncontended `parking_lot` lock is cheap
        // enough that doing so buys nothing measurable.
        let _ = self.multithreaded;
        self.shared.lock()
    }

    pub fn buffer_handle(&self) -> vk::Buffer {
        self.shared.lock().buffer.handle
    }

    /// Advance the internal identifier counter and return a fresh `u64`,
    /// suitable for addressing a newly-written identified region. Zero is
    /// reserved for transient regions and never produced.
    pub fn generate_region_identifier(&self) -> u64 {
        let mut shared = self.lock();
        loop {
            shared.identifier_rng = shared
                .identifier_rng
                .wrapping_mul(IDENTIFIER_MULTIPLIER)
                .wrapping_add(IDENTIFIER_INCREMENT);
            if shared.identifier_rng != 0 {
                return shared.identifier_rng;
            }
        }
    }

    /// Begin an access range on `accessor_slot`. Must be externally paired
    /// with a single [`Self::access_range_end`] before the next `begin` on
    /// the same slot. Lazily releases any access ranges (on any slot) whose
    /// closing moment has since elapsed.
    pub fn access_range_begin(&self, accessor_slot: u32, device: &ash::Device) {
        let mut shared = self.lock();
        shared.release_completed_access_ranges(device);
        shared.accessors.begin(accessor_slot);
    }

    /// Close `accessor_slot`'s open range with the GPU moment marking the
    /// end of its work against the atlas. Regions it retained stay gated
    /// until that moment elapses, released lazily on a subsequent
    /// `access_range_begin` for any slot.
    pub fn access_range_end(&self, accessor_slot: u32, last_use_moment: Moment) {
        let mut shared = self.lock();
        shared.accessors.end(accessor_slot, last_use_moment);
    }

    /// The moment `accessor_slot`'s most recently closed range finished on,
    /// if it has ever closed a range; lets a caller wait on that slot's
    /// prior work without having retained a region of its own.
    pub fn access_range_wait_moment(&self, accessor_slot: u32) -> Option<Moment> {
        let shared = self.lock();
        let moment = shared.accessors.get(accessor_slot).most_recent_wait_moment;
        if moment.is_null() {
            None
        } else {
            Some(moment)
        }
    }

    /// Look up an already-present region by `identifier`, retaining it for
    /// `accessor_slot`'s open access range. Fails with
    /// [`GfxError::RegionAbsent`] if no such region exists, or
    /// [`GfxError::RegionNotInitialised`] if it exists but its writer has
    /// not yet made it visible to this (non-writer) slot.
    ///
    /// Returns `(offset, size)` in bytes.
    pub fn find_identified_region(&self, identifier: u64, accessor_slot: u32) -> Result<(u64, u64)> {
        profiling::scope!("BufferAtlas::find_identified_region");
        debug_assert_ne!(identifier, 0);
        let mut shared = self.lock();
        let Some(&region_index) = shared.identifiers.get(identifier) else {
            return Err(GfxError::RegionAbsent(identifier));
        };
        shared.retain_existing(accessor_slot, region_index)
    }

    /// Find-or-allocate a region addressed by `identifier`, sized at least
    /// `size_bytes`, retaining it for `accessor_slot`'s open access range.
    ///
    /// Returns the outcome (already present vs. freshly allocated) and the
    /// byte offset.
    pub fn obtain_identified_region(&self, identifier: u64, accessor_slot: u32, size_bytes: u64) -> Result<(ObtainOutcome, u64)> {
        profiling::scope!("BufferAtlas::obtain_identified_region");
        debug_assert_ne!(identifier, 0, "0 is reserved for transient regions");
        let mut shared = self.lock();

        if let Some(&region_index) = shared.identifiers.get(identifier) {
            let (offset, _size) = shared.retain_existing(accessor_slot, region_index)?;
            return Ok((ObtainOutcome::Found, offset));
        }

        let exponent = shared.size_exponent_for(size_bytes);
        while !shared.buddy.has_space(exponent) {
            if !shared.evict_oldest_available() {
                return Err(GfxError::AtlasExhausted { requested: size_bytes });
            }
        }

        loop {
            let (region_index, offset) = shared.allocate_region(accessor_slot, size_bytes, identifier, false)?;
            match shared.identifiers.try_insert(identifier, region_index) {
                Ok(_) => return Ok((ObtainOutcome::Inserted, offset)),
                Err(_) => {
                    // The map is capped even after making room in the
                    // buddy tree; undo the allocation we just made and
                    // evict further to see if resizing becomes possible.
                    let unit_offset = shared.regions.get(region_index).offset;
                    shared
                        .accessors
                        .get_mut(accessor_slot)
                        .access_range
                        .retained_region_indices
                        .swap_remove_value(&region_index);
                    shared.regions.deallocate(region_index);
                    shared.buddy.release(unit_offset);
                    if !shared.evict_oldest_available() {
                        return Err(GfxError::AtlasMapFull);
                    }
                }
            }
        }
    }

    /// Allocate a region visible only to its creating access range, never
    /// addressable again beyond the returned offset and never entered into
    /// the identifier map. Freed straight back to the buddy tree when the
    /// range ends.
    pub fn obtain_transient_region(&self, accessor_slot: u32, size_bytes: u64) -> Result<u64> {
        profiling::scope!("BufferAtlas::obtain_transient_region");
        let mut shared = self.lock();
        let exponent = shared.size_exponent_for(size_bytes);
        while !shared.buddy.has_space(exponent) {
            if !shared.evict_oldest_available() {
                return Err(GfxError::AtlasExhausted { requested: size_bytes });
            }
        }
        let (_region_index, offset) = shared.allocate_region(accessor_slot, size_bytes, 0, true)?;
        Ok(offset)
    }

    pub fn access_buffer(&self) -> vk::Buffer {
        self.buffer_handle()
    }

    /// # Safety
    /// No region offset obtained from this atlas may still be referenced
    /// by GPU work when this is called.
    pub unsafe fn destroy(self, device: &Device) -> Result<()> {
        {
            let mut shared = self.shared.lock();
            let regions = &mut shared.regions;
            let buddy = &mut shared.buddy;
            shared.accessors.drain_all(&device.raw, |range| {
                while let Some(region_index) = range.retained_region_indices.pop() {
                    let region = regions.get_mut(region_index);
                    debug_assert!(region.retain_count > 0);
                    region.retain_count -= 1;
                    if region.is_transient {
                        buddy.release(region.offset);
                        regions.deallocate(region_index);
                    } else if region.retain_count == 0 {
                        regions.available_ring_push_newest(region_index);
                    }
                }
            });
            while shared.evict_oldest_available() {}
            debug_assert!(shared.regions.available_ring_is_empty());
        }
        let shared = self.shared.into_inner();
        device.destroy_buffer(shared.buffer)
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn size_exponent_rounds_up_to_power_of_two_units() {
        // Constructing a full `BufferAtlas` needs a live device; the pure
        // sizing arithmetic does not, so it is exercised directly here via
        // a throwaway struct sharing the same granularity.
        struct Sizing {
            granularity: u64,
        }
        impl Sizing {
            fn size_exponent_for(&self, size_bytes: u64) -> u32 {
                let units = size_bytes.div_ceil(self.granularity).max(1);
                32 - ((units - 1) as u32).leading_zeros()
            }
        }
        let sizing = Sizing { granularity: 256 };
        assert_eq!(sizing.size_exponent_for(1), 0);
        assert_eq!(sizing.size_exponent_for(256), 0);
        assert_eq!(sizing.size_exponent_for(257), 1);
        assert_eq!(sizing.size_exponent_for(1024), 2);
    }

    #[test]
    fn identifier_generator_never_yields_zero() {
        let mut rng: u64 = 0x853c_49e6_748f_ea9b;
        for _ in 0..10_000 {
            rng = rng
                .wrapping_mul(super::IDENTIFIER_MULTIPLIER)
                .wrapping_add(super::IDENTIFIER_INCREMENT);
            assert_ne!(rng, 0);
        }
    }
}
