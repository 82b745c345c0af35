//! Access ranges: a batch of atlas operations performed on behalf of one
//! accessor slot (e.g. a frame-in-flight index), closed off with a single
//! GPU moment marking when that slot's work against the atlas finished.
//!
//! Regions retained (created or looked up) during an open access range stay
//! invisible to every other slot — see [`super::region::Region::write_accessor_slot`]
//! and `visible_from_read_accessors` — until the range closes and its
//! last-use moment has elapsed, at which point [`super::BufferAtlas`] walks
//! `retained_region_indices` and releases each one.

use crate::collections::IndicesStack;
use crate::timeline::Moment;

/// One open-or-closed batch of atlas accesses for a single slot.
pub struct AccessRange {
    pub accessor_slot: u32,
    /// [`Moment::NULL`] while the range is open; set by
    /// [`super::BufferAtlas::access_range_end`].
    pub last_use_moment: Moment,
    /// Every region this range retained, released in one pass once
    /// `last_use_moment` has elapsed.
    pub retained_region_indices: IndicesStack<u32>,
}

impl AccessRange {
    fn new(accessor_slot: u32) -> Self {
        Self {
            accessor_slot,
            last_use_moment: Moment::NULL,
            retained_region_indices: IndicesStack::with_capacity(64),
        }
    }

    fn reset(&mut self, accessor_slot: u32) {
        debug_assert!(self.retained_region_indices.is_empty());
        self.accessor_slot = accessor_slot;
        self.last_use_moment = Moment::NULL;
    }
}

/// Per-slot state: the currently open range (if the slot has called
/// `access_range_begin` without a matching `access_range_end` yet) plus the
/// moment that range's predecessor closed with, so callers can wait on it
/// without having retained a region themselves.
pub struct Accessor {
    pub access_range: AccessRange,
    pub active: bool,
    pub most_recent_wait_moment: Moment,
}

impl Accessor {
    fn new() -> Self {
        Self {
            access_range: AccessRange::new(0),
            active: false,
            most_recent_wait_moment: Moment::NULL,
        }
    }
}

/// Fixed-size table of per-slot accessors plus the pools of `AccessRange`
/// value objects recycled between ranges: one pool for idle (reusable)
/// ranges, one for ranges whose closing moment has not yet elapsed.
pub struct AccessorTable {
    accessors: Vec<Accessor>,
    available_ranges: Vec<AccessRange>,
    in_flight_ranges: Vec<AccessRange>,
}

impl AccessorTable {
    pub fn new(accessor_slot_count: u8) -> Self {
        let mut accessors = Vec::with_capacity(accessor_slot_count as usize);
        for _ in 0..accessor_slot_count {
            accessors.push(Accessor::new());
        }
        Self {
            accessors,
            available_ranges: Vec::with_capacity(16),
            in_flight_ranges: Vec::with_capacity(16),
        }
    }

    pub fn slot_count(&self) -> u8 {
        self.accessors.len() as u8
    }

    pub fn get(&self, slot: u32) -> &Accessor {
        &self.accessors[slot as usize]
    }

    pub fn get_mut(&mut self, slot: u32) -> &mut Accessor {
        &mut self.accessors[slot as usize]
    }

    /// Begin a range on `slot`, reusing an idle `AccessRange` value object
    /// if one is available instead of allocating a fresh retained-index
    /// list.
    pub fn begin(&mut self, slot: u32) {
        let accessor = &mut self.accessors[slot as usize];
        debug_assert!(!accessor.active, "access_range_begin called twice without an intervening end");
        match self.available_ranges.pop() {
            Some(mut range) => {
                range.reset(slot);
                accessor.access_range = range;
            }
            None => accessor.access_range = AccessRange::new(slot),
        }
        accessor.active = true;
    }

    /// Close `slot`'s open range with `last_use_moment` and move it onto the
    /// in-flight pool, to be released once that moment elapses.
    pub fn end(&mut self, slot: u32, last_use_moment: Moment) {
        let accessor = &mut self.accessors[slot as usize];
        debug_assert!(accessor.active, "access_range_end called without a matching begin");
        accessor.active = false;
        accessor.most_recent_wait_moment = last_use_moment;
        let mut range = std::mem::replace(&mut accessor.access_range, AccessRange::new(slot));
        range.last_use_moment = last_use_moment;
        self.in_flight_ranges.push(range);
    }

    /// Scan the in-flight pool for ranges whose closing moment has elapsed,
    /// removing them and handing each to `on_elapsed` before recycling it
    /// onto the idle pool. Order among the remaining in-flight ranges is
    /// not preserved (swap-remove), which is fine: nothing indexes into
    /// this pool by position.
    pub fn drain_elapsed(&mut self, device: &ash::Device, mut on_elapsed: impl FnMut(&mut AccessRange)) {
        let mut i = 0;
        while i < self.in_flight_ranges.len() {
            if self.in_flight_ranges[i].last_use_moment.query(device).unwrap_or(false) {
                let mut range = self.in_flight_ranges.swap_remove(i);
                on_elapsed(&mut range);
                range.retained_region_indices.clear();
                self.available_ranges.push(range);
            } else {
                i += 1;
            }
        }
    }

    /// Wait out and release every in-flight range; called on atlas
    /// destruction so no region remains retained by a closed range.
    pub fn drain_all(&mut self, device: &ash::Device, mut on_elapsed: impl FnMut(&mut AccessRange)) {
        for mut range in self.in_flight_ranges.drain(..) {
            let _ = range.last_use_moment.wait(device, std::time::Duration::from_secs(30));
            on_elapsed(&mut range);
        }
        self.available_ranges.clear();
    }

    pub fn in_flight_is_empty(&self) -> bool {
        self.in_flight_ranges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_then_end_moves_range_to_in_flight() {
        let mut table = AccessorTable::new(2);
        table.begin(0);
        table.get_mut(0).access_range.retained_region_indices.push(7);
        assert!(table.get(0).active);

        table.end(0, Moment::NULL);
        assert!(!table.get(0).active);
        assert!(!table.in_flight_is_empty());
        assert!(table.get(0).access_range.retained_region_indices.is_empty());
    }

    #[test]
    fn begin_recycles_idle_range_object() {
        let mut table = AccessorTable::new(1);
        table.begin(0);
        table.end(0, Moment::NULL);
        // `drain_elapsed` needs a live device to query the moment, so this
        // only exercises the pool plumbing up to that point: the range
        // sits in-flight, not yet recycled onto the idle pool.
        assert!(!table.in_flight_is_empty());
        assert!(table.available_ranges.is_empty());
    }
}
