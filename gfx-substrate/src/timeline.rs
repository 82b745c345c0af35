//! Timeline semaphores and the moments (point-in-time values) they produce.
//!
//! A [`Moment`] is a `(VkSemaphore, u64)` pair: a promise that a particular
//! value will have been signalled on a particular timeline semaphore. Moments
//! are cheap, `Copy`, and compared/waited-on without ever touching the
//! semaphore that produced them beyond the handle itself, which is what lets
//! the sync bridge and the atlas pass them around freely.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ash::vk;

use crate::error::{GfxError, Result};

/// Maximum number of moments a single wait call can cover at once.
pub const MAX_WAIT_COUNT: usize = 8;

/// A point on a specific timeline semaphore's value sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Moment {
    pub semaphore: vk::Semaphore,
    pub value: u64,
}

impl Moment {
    /// A moment that is always already elapsed; the identity element for
    /// "nothing to wait on".
    pub const NULL: Moment = Moment {
        semaphore: vk::Semaphore::null(),
        value: 0,
    };

    pub fn is_null(&self) -> bool {
        self.semaphore == vk::Semaphore::null()
    }

    /// Build the `VkSemaphoreSubmitInfo` that makes a queue submission wait
    /// on, or signal, this moment at the given pipeline stage.
    pub fn submit_info(&self, stages: vk::PipelineStageFlags2) -> vk::SemaphoreSubmitInfo<'static> {
        vk::SemaphoreSubmitInfo::default()
            .semaphore(self.semaphore)
            .value(self.value)
            .stage_mask(stages)
    }

    /// Block the calling thread until this moment has elapsed.
    pub fn wait(&self, device: &ash::Device, timeout: Duration) -> Result<()> {
        if self.is_null() {
            return Ok(());
        }
        wait_multiple(device, std::slice::from_ref(self), true, timeout)
    }

    /// Non-blocking check for whether this moment has elapsed.
    pub fn query(&self, device: &ash::Device) -> Result<bool> {
        if self.is_null() {
            return Ok(true);
        }
        let current = unsafe { device.get_semaphore_counter_value(self.semaphore) }?;
        Ok(current >= self.value)
    }
}

/// Wait on up to [`MAX_WAIT_COUNT`] moments at once, either for all of them
/// or for any single one, to elapse.
pub fn wait_multiple(
    device: &ash::Device,
    moments: &[Moment],
    wait_on_all: bool,
    timeout: Duration,
) -> Result<()> {
    debug_assert!(moments.len() <= MAX_WAIT_COUNT);
    let live: Vec<&Moment> = moments.iter().filter(|m| !m.is_null()).collect();
    if live.is_empty() {
        return Ok(());
    }

    let semaphores: Vec<vk::Semaphore> = live.iter().map(|m| m.semaphore).collect();
    let values: Vec<u64> = live.iter().map(|m| m.value).collect();
    let wait_info = vk::SemaphoreWaitInfo::default()
        .flags(if wait_on_all {
            vk::SemaphoreWaitFlags::empty()
        } else {
            vk::SemaphoreWaitFlags::ANY
        })
        .semaphores(&semaphores)
        .values(&values);

    let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
    match unsafe { device.wait_semaphores(&wait_info, timeout_ns) } {
        Ok(()) => Ok(()),
        Err(vk::Result::TIMEOUT) => Err(GfxError::Timeout(timeout)),
        Err(e) => Err(e.into()),
    }
}

/// Non-blocking equivalent of [`wait_multiple`]: whether the requested
/// condition (all elapsed, or any elapsed) currently holds.
pub fn query_multiple(device: &ash::Device, moments: &[Moment], wait_on_all: bool) -> Result<bool> {
    debug_assert!(moments.len() <= MAX_WAIT_COUNT);
    if wait_on_all {
        for moment in moments {
            if !moment.query(device)? {
                return Ok(false);
            }
        }
        Ok(true)
    } else {
        for moment in moments {
            if moment.query(device)? {
                return Ok(true);
            }
        }
        Ok(moments.is_empty())
    }
}

/// A Vulkan timeline semaphore paired with a local generation counter.
///
/// The counter is incremented with a single atomic fetch-add so that
/// concurrent submitters can each claim a unique, monotonically increasing
/// value without additional locking; actually signalling the semaphore to
/// that value on the GPU timeline remains the caller's responsibility (via
/// the submit info attached to the relevant queue submission).
pub struct TimelineSemaphore {
    semaphore: vk::Semaphore,
    next_value: AtomicU64,
}

impl TimelineSemaphore {
    pub fn new(device: &ash::Device) -> Result<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let semaphore = unsafe { device.create_semaphore(&create_info, None) }?;
        Ok(Self {
            semaphore,
            next_value: AtomicU64::new(0),
        })
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Claim the next value on this timeline as a pending moment. The
    /// caller must ensure the corresponding GPU work actually signals it.
    pub fn generate_moment(&self) -> Moment {
        let value = self.next_value.fetch_add(1, Ordering::Relaxed) + 1;
        Moment {
            semaphore: self.semaphore,
            value,
        }
    }

    /// The most recently claimed value, for diagnostics.
    pub fn current_value(&self) -> u64 {
        self.next_value.load(Ordering::Relaxed)
    }

    /// # Safety
    /// The semaphore must not be referenced by any in-flight GPU work.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_semaphore(self.semaphore, None);
    }

    /// Signal this semaphore to `value` directly from the host, without any
    /// GPU submission. Used to wake a thread blocked in
    /// [`wait_multiple`] on one of this semaphore's moments.
    pub fn host_signal(&self, device: &ash::Device, value: u64) -> Result<()> {
        let signal_info = vk::SemaphoreSignalInfo::default()
            .semaphore(self.semaphore)
            .value(value);
        unsafe { device.signal_semaphore(&signal_info) }?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_moment_is_already_elapsed_without_a_device() {
        let moment = Moment::NULL;
        assert!(moment.is_null());
    }

    #[test]
    fn generate_moment_is_monotonic() {
        // exercised against a live ash::Device in integration tests; here we
        // only check the counter arithmetic, which needs no semaphore.
        let counter = AtomicU64::new(0);
        let a = counter.fetch_add(1, Ordering::Relaxed) + 1;
        let b = counter.fetch_add(1, Ordering::Relaxed) + 1;
        assert!(b > a);
    }
}
