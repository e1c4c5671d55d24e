// Buffer manager - vertex, index and uniform buffers
//
// Owns every buffer it creates; callers hold copyable handles. Placement:
// - vertex/index buffers created with initial data are device-local and
//   filled through a staging buffer and an immediate submit
// - uniform buffers and vertex/index buffers created empty are host-visible
//   and persistently mapped, so updates are plain memory writes
//
// Updating a buffer that an in-flight frame still reads is a data race. The
// caller waits on that image's fence or writes a slot not in flight.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use slotmap::SlotMap;
use std::sync::Arc;

use super::VulkanDevice;
use crate::error::{GraphicsError, ReleaseOnError, Result};

slotmap::new_key_type! {
    /// Non-owning reference to a buffer held by a [`BufferManager`].
    pub struct BufferHandle;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    Vertex,
    Index,
    Uniform,
}

impl BufferUsage {
    fn native(self) -> vk::BufferUsageFlags {
        match self {
            Self::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            Self::Index => vk::BufferUsageFlags::INDEX_BUFFER,
            Self::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// GPU-only memory, written through staging copies.
    DeviceLocal,
    /// Mapped for the buffer's whole lifetime.
    HostVisible,
}

impl MemoryKind {
    /// Placement policy for a new buffer.
    pub fn for_usage(usage: BufferUsage, has_initial_data: bool) -> Self {
        match usage {
            BufferUsage::Uniform => Self::HostVisible,
            BufferUsage::Vertex | BufferUsage::Index if has_initial_data => Self::DeviceLocal,
            BufferUsage::Vertex | BufferUsage::Index => Self::HostVisible,
        }
    }

    fn location(self) -> MemoryLocation {
        match self {
            Self::DeviceLocal => MemoryLocation::GpuOnly,
            Self::HostVisible => MemoryLocation::CpuToGpu,
        }
    }
}

#[derive(Debug)]
pub struct VulkanBuffer {
    pub handle: vk::Buffer,
    pub size_bytes: u64,
    pub usage: BufferUsage,
    pub memory_kind: MemoryKind,
    allocation: Allocation,
}

/// `offset..offset + len` must fit in a buffer of `size` bytes.
pub fn check_write(offset: u64, len: u64, size: u64) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(GraphicsError::SizeMismatch { offset, len, size }),
    }
}

/// Command buffer and fence for synchronous transfer work.
struct UploadContext {
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
}

impl UploadContext {
    fn new(device: &VulkanDevice) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(device.graphics_queue_family);
        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let fence_info = vk::FenceCreateInfo::builder();

        let objects = unsafe {
            device
                .device
                .allocate_command_buffers(&alloc_info)
                .and_then(|buffers| Ok((buffers[0], device.device.create_fence(&fence_info, None)?)))
        };

        match objects {
            Ok((command_buffer, fence)) => Ok(Self {
                command_pool,
                command_buffer,
                fence,
            }),
            Err(err) => {
                unsafe { device.device.destroy_command_pool(command_pool, None) };
                Err(err.into())
            }
        }
    }

    fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_fence(self.fence, None);
            device.destroy_command_pool(self.command_pool, None);
        }
    }
}

pub struct BufferManager {
    device: Arc<VulkanDevice>,
    buffers: SlotMap<BufferHandle, VulkanBuffer>,
    /// `None` once [`BufferManager::destroy`] has run.
    upload: Option<UploadContext>,
}

impl BufferManager {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let upload = UploadContext::new(&device)?;
        Ok(Self {
            device,
            buffers: SlotMap::with_key(),
            upload: Some(upload),
        })
    }

    pub fn create_vertex_buffer(&mut self, size_bytes: u64, initial: Option<&[u8]>) -> Result<BufferHandle> {
        self.create_buffer(BufferUsage::Vertex, size_bytes, initial)
    }

    pub fn create_index_buffer(&mut self, size_bytes: u64, initial: Option<&[u8]>) -> Result<BufferHandle> {
        self.create_buffer(BufferUsage::Index, size_bytes, initial)
    }

    pub fn create_uniform_buffer(&mut self, size_bytes: u64) -> Result<BufferHandle> {
        self.create_buffer(BufferUsage::Uniform, size_bytes, None)
    }

    /// Create a buffer placed by [`MemoryKind::for_usage`] and fill it with
    /// `initial` (which may be shorter than the buffer).
    pub fn create_buffer(
        &mut self,
        usage: BufferUsage,
        size_bytes: u64,
        initial: Option<&[u8]>,
    ) -> Result<BufferHandle> {
        if size_bytes == 0 {
            return Err(GraphicsError::InvalidState("buffers must not be empty"));
        }
        if let Some(data) = initial {
            check_write(0, data.len() as u64, size_bytes)?;
        }

        let memory_kind = MemoryKind::for_usage(usage, initial.is_some());
        let mut flags = usage.native();
        if memory_kind == MemoryKind::DeviceLocal {
            flags |= vk::BufferUsageFlags::TRANSFER_DST;
        }

        let (handle, allocation) = self.allocate(size_bytes, flags, memory_kind.location(), "buffer")?;
        let buffer = VulkanBuffer {
            handle,
            size_bytes,
            usage,
            memory_kind,
            allocation,
        };
        let key = self.buffers.insert(buffer);

        if let Some(data) = initial {
            if let Err(err) = self.update_buffer(key, 0, data) {
                let _ = self.delete_buffer(key);
                return Err(err);
            }
        }

        log::debug!(
            "Created {:?} buffer: {} bytes, {:?}",
            usage,
            size_bytes,
            memory_kind
        );
        Ok(key)
    }

    /// Write `data` at `offset`. Host-visible buffers are written through the
    /// mapping; device-local buffers through a staging copy that completes
    /// before this returns.
    pub fn update_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let target = self.buffers.get_mut(buffer).ok_or(GraphicsError::UnknownBuffer)?;
        check_write(offset, data.len() as u64, target.size_bytes)?;
        if data.is_empty() {
            return Ok(());
        }

        match target.memory_kind {
            MemoryKind::HostVisible => {
                let mapped = target
                    .allocation
                    .mapped_slice_mut()
                    .ok_or(GraphicsError::InvalidState("host-visible buffer is not mapped"))?;
                let start = offset as usize;
                mapped[start..start + data.len()].copy_from_slice(data);
                Ok(())
            }
            MemoryKind::DeviceLocal => {
                let dst = target.handle;
                self.staged_copy(dst, offset, data)
            }
        }
    }

    fn staged_copy(&mut self, dst: vk::Buffer, offset: u64, data: &[u8]) -> Result<()> {
        let (staging, mut allocation) = self.allocate(
            data.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            "staging",
        )?;

        let result = match allocation.mapped_slice_mut() {
            Some(mapped) => {
                mapped[..data.len()].copy_from_slice(data);
                let region = vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: offset,
                    size: data.len() as u64,
                };
                self.immediate_submit(|device, cmd| unsafe {
                    device.cmd_copy_buffer(cmd, staging, dst, &[region]);
                })
            }
            None => Err(GraphicsError::InvalidState("staging buffer is not mapped")),
        };

        self.release(staging, allocation);
        result
    }

    /// Record `record` into the upload command buffer, submit it and wait.
    ///
    /// The pool is reset on every path, so a failure part way through never
    /// leaves the command buffer in the recording state.
    pub fn immediate_submit(&self, record: impl FnOnce(&ash::Device, vk::CommandBuffer)) -> Result<()> {
        let device = &self.device.device;
        let upload = self
            .upload
            .as_ref()
            .ok_or(GraphicsError::InvalidState("buffer manager already destroyed"))?;
        let cmd = upload.command_buffer;

        let submitted = unsafe {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(cmd, &begin_info).and_then(|()| {
                record(device, cmd);
                device.end_command_buffer(cmd)?;

                let command_buffers = [cmd];
                let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
                device.queue_submit(self.device.graphics_queue, &[submit_info.build()], upload.fence)?;

                device.wait_for_fences(&[upload.fence], true, u64::MAX)?;
                device.reset_fences(&[upload.fence])
            })
        };

        submitted
            .and_always(|| unsafe {
                device.reset_command_pool(upload.command_pool, vk::CommandPoolResetFlags::empty())
            })
            .map_err(GraphicsError::from)
    }

    fn allocate(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<(vk::Buffer, Allocation)> {
        let device = &self.device.device;

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&buffer_info, None) }?;

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let allocation = self.device.allocator().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(err.into());
            }
        };

        if let Err(err) =
            unsafe { device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) }
        {
            self.release(buffer, allocation);
            return Err(err.into());
        }

        Ok((buffer, allocation))
    }

    fn release(&self, buffer: vk::Buffer, allocation: Allocation) {
        unsafe { self.device.device.destroy_buffer(buffer, None) };
        if let Err(err) = self.device.allocator().free(allocation) {
            log::warn!("Failed to free buffer memory: {}", err);
        }
    }

    /// Destroy a buffer. The caller guarantees no in-flight frame reads it.
    pub fn delete_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        let removed = self.buffers.remove(buffer).ok_or(GraphicsError::UnknownBuffer)?;
        self.release(removed.handle, removed.allocation);
        Ok(())
    }

    pub fn get(&self, buffer: BufferHandle) -> Option<&VulkanBuffer> {
        self.buffers.get(buffer)
    }

    /// Raw Vulkan handle for command recording.
    pub fn raw(&self, buffer: BufferHandle) -> Result<vk::Buffer> {
        self.buffers
            .get(buffer)
            .map(|b| b.handle)
            .ok_or(GraphicsError::UnknownBuffer)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Release every remaining buffer and the upload context. Safe to call
    /// more than once; the manager rejects uploads afterwards.
    pub fn destroy(&mut self) {
        if !self.buffers.is_empty() {
            log::debug!("Releasing {} remaining buffers", self.buffers.len());
        }
        let remaining: Vec<_> = self.buffers.drain().map(|(_, buffer)| buffer).collect();
        for buffer in remaining {
            self.release(buffer.handle, buffer.allocation);
        }
        if let Some(upload) = self.upload.take() {
            upload.destroy(&self.device.device);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_must_fit_the_buffer() {
        assert!(check_write(0, 64, 64).is_ok());
        assert!(check_write(60, 4, 64).is_ok());
        assert!(matches!(
            check_write(60, 8, 64),
            Err(GraphicsError::SizeMismatch { offset: 60, len: 8, size: 64 })
        ));
        assert!(check_write(u64::MAX, 2, 64).is_err());
    }

    #[test]
    fn placement_follows_usage() {
        assert_eq!(MemoryKind::for_usage(BufferUsage::Vertex, true), MemoryKind::DeviceLocal);
        assert_eq!(MemoryKind::for_usage(BufferUsage::Index, true), MemoryKind::DeviceLocal);
        assert_eq!(MemoryKind::for_usage(BufferUsage::Vertex, false), MemoryKind::HostVisible);
        assert_eq!(MemoryKind::for_usage(BufferUsage::Uniform, true), MemoryKind::HostVisible);
    }
}
