// Synchronization primitives
//
// Per-image fences and semaphores, plus a small pool of acquire semaphores.
// The image index is only known after acquire returns, so acquire borrows a
// free semaphore; once that image's fence has signalled, the semaphore the
// image was previously acquired with is free again.

use ash::vk;

use super::VulkanDevice;
use crate::error::Result;

/// Sync objects owned by one swapchain image.
#[derive(Debug)]
pub struct ImageSync {
    pub render_finished: vk::Semaphore,
    /// Signalled when the last submission rendering to this image completes.
    pub in_flight: vk::Fence,
    /// Acquire semaphore used the last time this image was acquired.
    pub acquired_with: Option<vk::Semaphore>,
}

impl ImageSync {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Start signaled so the first wait on a fresh image returns at once
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        let render_finished = unsafe { device.device.create_semaphore(&semaphore_info, None) }?;
        let in_flight = match unsafe { device.device.create_fence(&fence_info, None) } {
            Ok(fence) => fence,
            Err(err) => {
                unsafe { device.device.destroy_semaphore(render_finished, None) };
                return Err(err.into());
            }
        };

        Ok(Self {
            render_finished,
            in_flight,
            acquired_with: None,
        })
    }

    /// Destroy the image's own objects. Returns the acquire semaphore it was
    /// holding so the pool can take it back.
    pub fn destroy(self, device: &ash::Device) -> Option<vk::Semaphore> {
        unsafe {
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight, None);
        }
        self.acquired_with
    }
}

/// Recycled semaphores for `vkAcquireNextImageKHR`.
#[derive(Debug, Default)]
pub struct SemaphorePool {
    free: Vec<vk::Semaphore>,
}

impl SemaphorePool {
    pub fn new(device: &VulkanDevice, count: usize) -> Result<Self> {
        let mut pool = Self::default();
        for _ in 0..count {
            let semaphore = pool.create(device);
            match semaphore {
                Ok(semaphore) => pool.free.push(semaphore),
                Err(err) => {
                    pool.destroy(&device.device);
                    return Err(err);
                }
            }
        }
        Ok(pool)
    }

    fn create(&self, device: &VulkanDevice) -> Result<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::builder();
        Ok(unsafe { device.device.create_semaphore(&info, None) }?)
    }

    /// Take a free semaphore, creating one if every semaphore is in use.
    pub fn take(&mut self, device: &VulkanDevice) -> Result<vk::Semaphore> {
        match self.free.pop() {
            Some(semaphore) => Ok(semaphore),
            None => self.create(device),
        }
    }

    pub fn give_back(&mut self, semaphore: vk::Semaphore) {
        self.free.push(semaphore);
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        for semaphore in self.free.drain(..) {
            unsafe { device.destroy_semaphore(semaphore, None) };
        }
    }
}

