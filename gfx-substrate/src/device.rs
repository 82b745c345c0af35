//! Thin Vulkan-class device wrapper: owns the `ash::Device`, the queue this
//! crate submits to, and a [`gpu_alloc`] sub-allocator for device memory.
//!
//! Everything else in this crate (the buffer atlas, the staging ring, the
//! sync bridge) takes a `&Device` rather than raw `ash` handles, so the
//! backend-specific bits stay in one place.

use std::sync::Mutex;

use ash::vk;
use gpu_alloc::{GpuAllocator, MemoryBlock, Request, UsageFlags};
use gpu_alloc_ash::AshMemoryDevice;

use crate::error::{GfxError, Result};

bitflags::bitflags! {
    /// Vulkan device features this crate's subsystems assume are enabled,
    /// checked once at [`Device::from_raw`] time rather than re-validated on
    /// every call into the atlas, staging ring, or sync bridge.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RequiredFeatures: u32 {
        /// `VK_KHR_timeline_semaphore` / Vulkan 1.2 `timelineSemaphore`; the
        /// moment primitive in [`crate::timeline`] has no fallback path.
        const TIMELINE_SEMAPHORE = 1 << 0;
        /// `bufferDeviceAddress`; not required by this crate directly but
        /// commonly requested alongside timeline semaphores by callers that
        /// also do bindless access, so tracked here for a single combined
        /// feature check.
        const BUFFER_DEVICE_ADDRESS = 1 << 1;
    }
}

/// A single device-local or host-visible buffer allocation, bundled with the
/// memory block backing it so it can be unmapped/freed correctly.
pub struct Buffer {
    pub handle: vk::Buffer,
    pub block: MemoryBlock<vk::DeviceMemory>,
    pub size: u64,
}

pub struct Device {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub raw: ash::Device,
    pub queue: vk::Queue,
    pub queue_family_index: u32,
    allocator: Mutex<GpuAllocator<vk::DeviceMemory>>,
}

impl Device {
    /// Wrap already-created Vulkan handles. Physical device selection and
    /// queue creation are left to the embedding application, which knows
    /// about surface compatibility, required extensions, and so on; this
    /// crate only needs a graphics/transfer-capable queue and the handles
    /// to build a sub-allocator against.
    ///
    /// `enabled_features` documents which of [`RequiredFeatures`] the caller
    /// actually turned on when creating `raw`; timeline semaphores are
    /// non-negotiable since every moment in [`crate::timeline`] depends on
    /// them, and their absence is reported rather than discovered later as a
    /// cryptic `vk::Result` from the first semaphore call.
    ///
    /// # Safety
    /// `raw` must have been created from `physical_device` with the features
    /// claimed by `enabled_features` actually enabled, and `queue` must come
    /// from `queue_family_index` on that device.
    pub unsafe fn from_raw(
        entry: ash::Entry,
        instance: ash::Instance,
        physical_device: vk::PhysicalDevice,
        raw: ash::Device,
        queue: vk::Queue,
        queue_family_index: u32,
        enabled_features: RequiredFeatures,
    ) -> Result<Self> {
        if !enabled_features.contains(RequiredFeatures::TIMELINE_SEMAPHORE) {
            return Err(GfxError::MissingFeature("timelineSemaphore"));
        }
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);
        let config = gpu_alloc::Config::i_am_prototyping();
        let device_properties = gpu_alloc_ash::device_properties(&instance, properties.api_version, physical_device)
            .unwrap_or(gpu_alloc::DeviceProperties {
                memory_types: std::borrow::Cow::Owned(Vec::new()),
                memory_heaps: std::borrow::Cow::Owned(Vec::new()),
                max_memory_allocation_count: 4096,
                max_memory_allocation_size: u64::MAX,
                non_coherent_atom_size: 1,
                buffer_device_address: false,
            });
        let _ = memory_properties;
        let allocator = GpuAllocator::new(config, device_properties);

        Ok(Self {
            entry,
            instance,
            physical_device,
            raw,
            queue,
            queue_family_index,
            allocator: Mutex::new(allocator),
        })
    }

    /// Allocate a buffer sized and placed according to `required`/`desired`
    /// Vulkan memory property flags, the shape the buffer atlas and staging
    /// ring factories accept from callers. `required` must be satisfiable or
    /// the underlying `gpu-alloc` request fails; `desired` only biases the
    /// memory type search.
    pub fn create_buffer_for_properties(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        required: vk::MemoryPropertyFlags,
        desired: vk::MemoryPropertyFlags,
    ) -> Result<Buffer> {
        let combined = required | desired;
        let mut memory_usage = UsageFlags::empty();
        if combined.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL) {
            memory_usage |= UsageFlags::FAST_DEVICE_ACCESS;
        }
        if combined.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            memory_usage |= UsageFlags::HOST_ACCESS;
        }
        self.create_buffer(size, usage, memory_usage)
    }

    /// Allocate a buffer of `size` bytes with the given Vulkan usage flags,
    /// backed by memory matching `memory_usage` (e.g. device-local for the
    /// atlas, host-visible + host-coherent for the staging ring).
    pub fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags, memory_usage: UsageFlags) -> Result<Buffer> {
        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let handle = unsafe { self.raw.create_buffer(&create_info, None) }?;
        let requirements = unsafe { self.raw.get_buffer_memory_requirements(handle) };

        let request = Request {
            size: requirements.size,
            align_mask: requirements.alignment - 1,
            memory_types: requirements.memory_type_bits,
            usage: memory_usage,
        };

        let block = {
            let mut allocator = self.allocator.lock().unwrap();
            unsafe { allocator.alloc(AshMemoryDevice::wrap(&self.raw), request) }?
        };

        unsafe {
            self.raw
                .bind_buffer_memory(handle, *block.memory(), block.offset())?;
        }

        Ok(Buffer { handle, block, size })
    }

    /// # Safety
    /// `buffer` must not be referenced by any in-flight GPU work.
    pub unsafe fn destroy_buffer(&self, buffer: Buffer) -> Result<()> {
        self.raw.destroy_buffer(buffer.handle, None);
        let mut allocator = self.allocator.lock().unwrap();
        allocator.dealloc(AshMemoryDevice::wrap(&self.raw), buffer.block);
        Ok(())
    }

    /// Map a host-visible buffer's memory for the staging ring. Returns a
    /// pointer to the mapped range; the caller is responsible for writes
    /// staying within `buffer.size` and for eventual `unmap`.
    ///
    /// # Safety
    /// The underlying memory type must be host-visible.
    pub unsafe fn map_buffer(&self, buffer: &mut Buffer) -> Result<std::ptr::NonNull<u8>> {
        buffer
            .block
            .map(AshMemoryDevice::wrap(&self.raw), 0, buffer.size as usize)
            .map_err(GfxError::from)
    }

    /// # Safety
    /// `buffer` must currently be mapped via [`Self::map_buffer`].
    pub unsafe fn unmap_buffer(&self, buffer: &mut Buffer) {
        buffer.block.unmap(AshMemoryDevice::wrap(&self.raw));
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            self.raw.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}
