// Swapchain manager - window presentation
//
// Owns the presentable images and everything replicated per image: views,
// command buffers, fences and render-finished semaphores. Recreation tears
// all of it down and rebuilds it for whatever image count the new swapchain
// reports, which may differ from the old one.
//
// State machine:
//   Uninitialized -> Ready -> (AcquireFailed | Stale) -> Ready (recreate)
//   any -> Destroyed (terminal)

use ash::extensions::khr;
use ash::vk;
use std::sync::Arc;

use super::sync::{ImageSync, SemaphorePool};
use super::{FrameSlots, VulkanDevice};
use crate::error::{GraphicsError, Result};
use crate::VK_REQUIRED_IMAGE_COUNT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainState {
    Uninitialized,
    Ready,
    /// Acquire timed out; acquiring again may succeed.
    AcquireFailed,
    /// Out of date or suboptimal; must be recreated before the next acquire.
    Stale,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainEvent {
    Created,
    Acquired,
    AcquireTimedOut,
    OutOfDate,
    Destroyed,
}

impl SwapchainState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::AcquireFailed => "acquire-failed",
            Self::Stale => "stale",
            Self::Destroyed => "destroyed",
        }
    }

    pub fn transition(self, event: SwapchainEvent) -> Result<Self> {
        use SwapchainEvent as E;
        use SwapchainState as S;

        match (self, event) {
            (S::Destroyed, _) => Err(GraphicsError::InvalidState("swapchain is destroyed")),
            (_, E::Destroyed) => Ok(S::Destroyed),
            (_, E::Created) => Ok(S::Ready),
            (S::Uninitialized, _) => Err(GraphicsError::InvalidState("swapchain is not created")),
            (S::Stale, E::Acquired | E::AcquireTimedOut) => Err(GraphicsError::SwapchainOutOfDate),
            (_, E::OutOfDate) => Ok(S::Stale),
            (S::Ready | S::AcquireFailed, E::Acquired) => Ok(S::Ready),
            (S::Ready | S::AcquireFailed, E::AcquireTimedOut) => Ok(S::AcquireFailed),
        }
    }
}

/// Number of images to request: at least [`VK_REQUIRED_IMAGE_COUNT`] and at
/// least the surface minimum. `max_images == 0` means the surface has no upper
/// bound.
pub fn choose_image_count(min_images: u32, max_images: u32) -> Result<u32> {
    let requested = min_images.max(VK_REQUIRED_IMAGE_COUNT);
    if max_images > 0 && requested > max_images {
        return Err(GraphicsError::UnsupportedSurface {
            required: requested,
            max: max_images,
        });
    }
    Ok(requested)
}

/// The preferred mode when the surface supports it, FIFO otherwise.
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Prefer 8-bit BGRA sRGB, fall back to whatever the surface lists first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, requested: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: requested
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: requested
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// An image handed out by [`SwapchainManager::acquire_next_image`].
#[derive(Debug, Clone, Copy)]
pub struct AcquiredImage {
    pub index: u32,
    pub wait_semaphore: vk::Semaphore,
}

pub struct SwapchainManager {
    device: Arc<VulkanDevice>,
    surface: vk::SurfaceKHR,
    surface_loader: khr::Surface,
    loader: khr::Swapchain,
    command_pool: vk::CommandPool,
    preferred_present_mode: vk::PresentModeKHR,

    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: FrameSlots<vk::ImageView>,
    command_buffers: FrameSlots<vk::CommandBuffer>,
    image_sync: FrameSlots<ImageSync>,
    acquire_semaphores: SemaphorePool,
    /// Acquired, but its fence wait timed out. Handed out again by the next
    /// acquire instead of asking the presentation engine for another image.
    pending: Option<AcquiredImage>,

    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    state: SwapchainState,
    current_image: u32,
    frame_number: u64,
}

impl SwapchainManager {
    /// Create the swapchain for `surface`. Per-image command buffers come
    /// from `command_pool`, which must allow individual resets.
    pub fn new(
        device: Arc<VulkanDevice>,
        surface: vk::SurfaceKHR,
        surface_loader: &khr::Surface,
        command_pool: vk::CommandPool,
        extent: vk::Extent2D,
        preferred_present_mode: vk::PresentModeKHR,
    ) -> Result<Self> {
        let loader = khr::Swapchain::new(&device.instance, &device.device);

        let mut manager = Self {
            device,
            surface,
            surface_loader: surface_loader.clone(),
            loader,
            command_pool,
            preferred_present_mode,
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            image_views: FrameSlots::default(),
            command_buffers: FrameSlots::default(),
            image_sync: FrameSlots::default(),
            acquire_semaphores: SemaphorePool::default(),
            pending: None,
            format: vk::SurfaceFormatKHR::default(),
            extent,
            state: SwapchainState::Uninitialized,
            current_image: 0,
            frame_number: 0,
        };

        manager.build(extent)?;
        manager.acquire_semaphores =
            SemaphorePool::new(&manager.device, manager.images.len() + 1)?;
        Ok(manager)
    }

    fn build(&mut self, requested: vk::Extent2D) -> Result<()> {
        let physical_device = self.device.physical_device;
        let (caps, formats, present_modes) = unsafe {
            (
                self.surface_loader
                    .get_physical_device_surface_capabilities(physical_device, self.surface)?,
                self.surface_loader
                    .get_physical_device_surface_formats(physical_device, self.surface)?,
                self.surface_loader
                    .get_physical_device_surface_present_modes(physical_device, self.surface)?,
            )
        };

        let format = choose_surface_format(&formats)
            .ok_or(GraphicsError::InvalidState("surface reports no formats"))?;
        let present_mode = choose_present_mode(&present_modes, self.preferred_present_mode);
        let extent = choose_extent(&caps, requested);
        if extent.width == 0 || extent.height == 0 {
            return Err(GraphicsError::InvalidState("surface has a zero extent"));
        }
        let image_count = choose_image_count(caps.min_image_count, caps.max_image_count)?;

        let old_swapchain = self.swapchain;
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe { self.loader.create_swapchain(&create_info, None) }?;
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(old_swapchain, None) };
        }
        self.swapchain = swapchain;

        let images = unsafe { self.loader.get_swapchain_images(swapchain) }?;
        let count = per_image_count(images.len())?;

        let device = self.device.clone();
        let vk_device = &device.device;

        self.image_views = FrameSlots::try_new(
            count,
            |i| {
                let info = vk::ImageViewCreateInfo::builder()
                    .image(images[i])
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(format.format)
                    .components(vk::ComponentMapping::default())
                    .subresource_range(color_subresource_range());
                unsafe { vk_device.create_image_view(&info, None) }
            },
            |view| unsafe { vk_device.destroy_image_view(view, None) },
        )?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count as u32);
        let command_buffers = unsafe { vk_device.allocate_command_buffers(&alloc_info) }?;
        self.command_buffers = FrameSlots::new(count, |i| command_buffers[i]);

        self.image_sync = FrameSlots::try_new(
            count,
            |_| ImageSync::new(&device),
            |sync| {
                sync.destroy(vk_device);
            },
        )?;

        self.images = images;
        self.format = format;
        self.extent = extent;
        self.current_image = 0;
        self.state = self.state.transition(SwapchainEvent::Created)?;

        log::info!(
            "Swapchain ready: {} images, {}x{}, {:?}, {:?}",
            count,
            extent.width,
            extent.height,
            format.format,
            present_mode
        );
        Ok(())
    }

    /// Destroy everything replicated per image. The swapchain itself stays so
    /// it can be passed as `old_swapchain`.
    fn release_per_image(&mut self) {
        let vk_device = &self.device.device;

        // Its semaphore may still be signalled by the old swapchain, so it is
        // destroyed rather than recycled.
        if let Some(pending) = self.pending.take() {
            unsafe { vk_device.destroy_semaphore(pending.wait_semaphore, None) };
        }

        for sync in self.image_sync.take_all() {
            if let Some(semaphore) = sync.destroy(vk_device) {
                self.acquire_semaphores.give_back(semaphore);
            }
        }

        let command_buffers: Vec<_> = self.command_buffers.take_all().collect();
        if !command_buffers.is_empty() {
            unsafe { vk_device.free_command_buffers(self.command_pool, &command_buffers) };
        }

        for view in self.image_views.take_all() {
            unsafe { vk_device.destroy_image_view(view, None) };
        }

        self.images.clear();
    }

    /// Rebuild the swapchain and all per-image resources for a new extent.
    pub fn recreate(&mut self, extent: vk::Extent2D) -> Result<()> {
        if self.state == SwapchainState::Destroyed {
            return Err(GraphicsError::InvalidState("swapchain is destroyed"));
        }

        self.device.wait_idle()?;
        let previous = self.images.len();
        self.release_per_image();

        if let Err(err) = self.build(extent) {
            self.state = SwapchainState::Stale;
            return Err(err);
        }

        if previous != self.images.len() {
            log::info!("Image count changed: {} -> {}", previous, self.images.len());
        }
        Ok(())
    }

    /// Ask for the next presentable image.
    ///
    /// Fails with `SwapchainOutOfDate` (recreate first) or `Timeout`.
    pub fn acquire_next_image(&mut self, timeout_ns: u64) -> Result<AcquiredImage> {
        if !matches!(self.state, SwapchainState::Ready | SwapchainState::AcquireFailed) {
            self.state.transition(SwapchainEvent::Acquired)?;
        }
        if let Some(pending) = self.pending.take() {
            return Ok(pending);
        }

        let semaphore = self.acquire_semaphores.take(&self.device)?;
        let result = unsafe {
            self.loader
                .acquire_next_image(self.swapchain, timeout_ns, semaphore, vk::Fence::null())
        };

        match result {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    log::debug!("Acquired image {} from a suboptimal swapchain", index);
                }
                self.state = self.state.transition(SwapchainEvent::Acquired)?;
                self.current_image = index;
                Ok(AcquiredImage {
                    index,
                    wait_semaphore: semaphore,
                })
            }
            Err(err) => {
                self.acquire_semaphores.give_back(semaphore);
                let err = GraphicsError::from(err);
                let event = match err {
                    GraphicsError::SwapchainOutOfDate => SwapchainEvent::OutOfDate,
                    GraphicsError::Timeout => SwapchainEvent::AcquireTimedOut,
                    _ => return Err(err),
                };
                self.state = self.state.transition(event)?;
                Err(err)
            }
        }
    }

    /// Wait up to `timeout_ns` for the previous submission rendering to
    /// `image` to finish. Afterwards the semaphore that image was last
    /// acquired with is free.
    ///
    /// On `Timeout` the image stays acquired and the next
    /// [`Self::acquire_next_image`] returns it again.
    pub fn wait_for_image(&mut self, image: AcquiredImage, timeout_ns: u64) -> Result<()> {
        let sync = self
            .image_sync
            .get_mut(image.index as usize)
            .ok_or(GraphicsError::InvalidState("image index out of range"))?;

        let waited = unsafe {
            self.device
                .device
                .wait_for_fences(&[sync.in_flight], true, timeout_ns)
        };
        keep_on_timeout(waited.map_err(GraphicsError::from), image, &mut self.pending)?;

        if let Some(previous) = sync.acquired_with.replace(image.wait_semaphore) {
            self.acquire_semaphores.give_back(previous);
        }
        Ok(())
    }

    /// Queue `image` for presentation once its render-finished semaphore
    /// signals. A suboptimal swapchain is marked stale; out of date fails.
    pub fn present(&mut self, queue: vk::Queue, image: u32) -> Result<()> {
        let wait_semaphores = [self.image_sync[image as usize].render_finished];
        let swapchains = [self.swapchain];
        let image_indices = [image];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.loader.queue_present(queue, &present_info) };
        self.frame_number += 1;

        match result {
            Ok(false) => Ok(()),
            Ok(true) => {
                log::debug!("Swapchain suboptimal after present");
                self.state = self.state.transition(SwapchainEvent::OutOfDate)?;
                Ok(())
            }
            Err(err) => {
                let err = GraphicsError::from_submission(err);
                if err.needs_recreate() {
                    self.state = self.state.transition(SwapchainEvent::OutOfDate)?;
                }
                Err(err)
            }
        }
    }

    /// Mark the swapchain for recreation, e.g. after a window resize.
    pub fn invalidate(&mut self) {
        if let Ok(next) = self.state.transition(SwapchainEvent::OutOfDate) {
            self.state = next;
        }
    }

    pub fn state(&self) -> SwapchainState {
        self.state
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    /// Index of the most recently acquired image.
    pub fn current_image(&self) -> u32 {
        self.current_image
    }

    /// Frames presented since creation.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image(&self, index: u32) -> vk::Image {
        self.images[index as usize]
    }

    pub fn image_view(&self, index: u32) -> vk::ImageView {
        self.image_views[index as usize]
    }

    pub fn command_buffer(&self, index: u32) -> vk::CommandBuffer {
        self.command_buffers[index as usize]
    }

    pub fn image_sync(&self, index: u32) -> &ImageSync {
        &self.image_sync[index as usize]
    }

    /// Number of in-flight fences, one per image.
    pub fn fence_count(&self) -> usize {
        self.image_sync.len()
    }

    /// Tear everything down. The caller has already drained the device.
    pub fn destroy(&mut self) {
        if self.state == SwapchainState::Destroyed {
            return;
        }
        self.release_per_image();
        self.acquire_semaphores.destroy(&self.device.device);
        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(self.swapchain, None) };
            self.swapchain = vk::SwapchainKHR::null();
        }
        self.state = SwapchainState::Destroyed;
        log::info!("Swapchain destroyed");
    }
}

impl Drop for SwapchainManager {
    fn drop(&mut self) {
        if self.state != SwapchainState::Destroyed {
            let _ = self.device.wait_idle();
            self.destroy();
        }
    }
}

/// Park `image` in `pending` when its fence wait timed out.
fn keep_on_timeout(
    waited: Result<()>,
    image: AcquiredImage,
    pending: &mut Option<AcquiredImage>,
) -> Result<()> {
    if matches!(waited, Err(GraphicsError::Timeout)) {
        *pending = Some(image);
    }
    waited
}

/// Number of per-image slots (views, command buffers, fences) for the images
/// a swapchain returned.
pub fn per_image_count(returned: usize) -> Result<usize> {
    if (returned as u32) < VK_REQUIRED_IMAGE_COUNT {
        return Err(GraphicsError::UnsupportedSurface {
            required: VK_REQUIRED_IMAGE_COUNT,
            max: returned as u32,
        });
    }
    Ok(returned)
}

pub fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_count_never_below_required_minimum() {
        assert_eq!(choose_image_count(2, 8).unwrap(), VK_REQUIRED_IMAGE_COUNT);
        assert_eq!(choose_image_count(2, 0).unwrap(), VK_REQUIRED_IMAGE_COUNT);
        assert_eq!(choose_image_count(6, 8).unwrap(), 6);
        for min in 1..=8 {
            assert!(choose_image_count(min, 0).unwrap() >= VK_REQUIRED_IMAGE_COUNT);
        }
    }

    #[test]
    fn surface_with_too_few_images_is_rejected() {
        assert!(matches!(
            choose_image_count(2, 3),
            Err(GraphicsError::UnsupportedSurface { required: 4, max: 3 })
        ));
    }

    #[test]
    fn recreation_cycle() {
        let state = SwapchainState::Uninitialized
            .transition(SwapchainEvent::Created)
            .unwrap();
        assert_eq!(state, SwapchainState::Ready);

        let state = state.transition(SwapchainEvent::OutOfDate).unwrap();
        assert_eq!(state, SwapchainState::Stale);
        assert!(matches!(
            state.transition(SwapchainEvent::Acquired),
            Err(GraphicsError::SwapchainOutOfDate)
        ));

        let state = state.transition(SwapchainEvent::Created).unwrap();
        assert_eq!(state, SwapchainState::Ready);
    }

    #[test]
    fn timeout_allows_retry() {
        let state = SwapchainState::Ready
            .transition(SwapchainEvent::AcquireTimedOut)
            .unwrap();
        assert_eq!(state, SwapchainState::AcquireFailed);
        assert_eq!(
            state.transition(SwapchainEvent::Acquired).unwrap(),
            SwapchainState::Ready
        );
    }

    #[test]
    fn destroyed_is_terminal() {
        let state = SwapchainState::Ready
            .transition(SwapchainEvent::Destroyed)
            .unwrap();
        assert!(state.transition(SwapchainEvent::Created).is_err());
        assert!(state.transition(SwapchainEvent::Acquired).is_err());
    }

    #[test]
    fn acquire_before_create_is_invalid() {
        assert!(matches!(
            SwapchainState::Uninitialized.transition(SwapchainEvent::Acquired),
            Err(GraphicsError::InvalidState(_))
        ));
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_is_clamped_when_surface_leaves_it_open() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: u32::MAX, height: u32::MAX },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 1920, height: 1080 },
            ..Default::default()
        };
        let extent = choose_extent(&caps, vk::Extent2D { width: 4000, height: 600 });
        assert_eq!((extent.width, extent.height), (1920, 600));
    }

    #[test]
    fn surface_format_prefers_srgb() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let pick = |formats: &[vk::SurfaceFormatKHR]| choose_surface_format(formats).map(|f| f.format);
        assert_eq!(pick(&[unorm, srgb]), Some(vk::Format::B8G8R8A8_SRGB));
        assert_eq!(pick(&[unorm]), Some(vk::Format::R8G8B8A8_UNORM));
        assert_eq!(pick(&[]), None);
    }

    #[test]
    fn per_image_slots_track_the_returned_images() {
        assert_eq!(per_image_count(4).unwrap(), 4);
        assert_eq!(per_image_count(5).unwrap(), 5);
        assert!(matches!(
            per_image_count(3),
            Err(GraphicsError::UnsupportedSurface { required: 4, max: 3 })
        ));

        let fences = FrameSlots::new(per_image_count(5).unwrap(), |i| i);
        assert_eq!(fences.len(), 5);
    }

    #[test]
    fn timed_out_wait_keeps_the_image() {
        let image = AcquiredImage {
            index: 2,
            wait_semaphore: vk::Semaphore::null(),
        };
        let mut pending = None;

        assert!(keep_on_timeout(Ok(()), image, &mut pending).is_ok());
        assert!(pending.is_none());

        assert!(keep_on_timeout(Err(GraphicsError::DeviceLost), image, &mut pending).is_err());
        assert!(pending.is_none());

        assert!(matches!(
            keep_on_timeout(Err(GraphicsError::Timeout), image, &mut pending),
            Err(GraphicsError::Timeout)
        ));
        assert_eq!(pending.map(|p| p.index), Some(2));
    }
}
