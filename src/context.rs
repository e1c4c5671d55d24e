// VulkanContext - root aggregate
//
// Owns the device, surface, swapchain, command pool and the registries of
// buffers, shaders and pipelines. All GPU objects created through the context
// are recorded in creation order and destroyed in reverse on shutdown, after
// the device has drained.
//
// Frame loop:
//   resize()      -> mark the swapchain for recreation (zero extent = minimized)
//   draw_frame(f) -> acquire, wait, f(frame), record, submit, present
//   shutdown()    -> wait idle, destroy everything in reverse creation order

use anyhow::Context as _;
use ash::extensions::khr;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use slotmap::SecondaryMap;
use std::sync::Arc;

use crate::backend::{
    load_shader_module, BufferHandle, BufferManager, DrawCall, FrameContext, FrameSubmitter,
    PipelineCompiler, PipelineHandle, PipelineResources, ShaderSet, SwapchainManager,
    SwapchainState, VulkanDevice,
};
use crate::config::Config;
use crate::description::{print_pipeline_description, DeviceLimits, PipelineDescription};
use crate::error::{GraphicsError, Result};

/// Something the context created and must destroy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owned {
    Buffer(BufferHandle),
    Shader(vk::ShaderModule),
    Pipeline(PipelineHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TeardownStep {
    Release(Owned),
    Buffers,
    Swapchain,
    CommandPool,
    Surface,
}

/// Destruction order: objects created through the context newest first, then
/// the context's own objects in reverse of `init`.
fn teardown_plan(creation_order: &[Owned]) -> Vec<TeardownStep> {
    creation_order
        .iter()
        .rev()
        .map(|&owned| TeardownStep::Release(owned))
        .chain([
            TeardownStep::Buffers,
            TeardownStep::Swapchain,
            TeardownStep::CommandPool,
            TeardownStep::Surface,
        ])
        .collect()
}

pub struct VulkanContext {
    submitter: FrameSubmitter,
    resources: SecondaryMap<PipelineHandle, PipelineResources>,
    pipelines: PipelineCompiler,
    buffers: BufferManager,
    swapchain: SwapchainManager,
    command_pool: vk::CommandPool,
    surface: vk::SurfaceKHR,
    surface_loader: khr::Surface,
    device: Arc<VulkanDevice>,

    creation_order: Vec<Owned>,
    extent: vk::Extent2D,
    needs_recreate: bool,
    shut_down: bool,
}

impl VulkanContext {
    /// Bring up the device, surface and swapchain for a window.
    pub fn init(
        display: RawDisplayHandle,
        window: RawWindowHandle,
        extent: vk::Extent2D,
        config: &Config,
    ) -> anyhow::Result<Self> {
        let device = VulkanDevice::new(&config.window.title, display, config.debug.validation_layers)?;

        let surface = unsafe {
            ash_window::create_surface(&device.entry, &device.instance, display, window, None)
        }
        .context("Failed to create window surface")?;
        let surface_loader = khr::Surface::new(&device.entry, &device.instance);

        let supported = unsafe {
            surface_loader.get_physical_device_surface_support(
                device.physical_device,
                device.graphics_queue_family,
                surface,
            )
        }
        .context("Failed to query surface support")?;
        if !supported {
            unsafe { surface_loader.destroy_surface(surface, None) };
            anyhow::bail!("Graphics queue cannot present to this surface");
        }

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(device.graphics_queue_family);
        let command_pool = match unsafe { device.device.create_command_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(err) => {
                unsafe { surface_loader.destroy_surface(surface, None) };
                return Err(err).context("Failed to create command pool");
            }
        };

        let swapchain = SwapchainManager::new(
            device.clone(),
            surface,
            &surface_loader,
            command_pool,
            extent,
            config.present_mode(),
        );
        let swapchain = match swapchain {
            Ok(swapchain) => swapchain,
            Err(err) => {
                unsafe {
                    device.device.destroy_command_pool(command_pool, None);
                    surface_loader.destroy_surface(surface, None);
                }
                return Err(err).context("Failed to create swapchain");
            }
        };

        let buffers = match BufferManager::new(device.clone()) {
            Ok(buffers) => buffers,
            Err(err) => {
                // Frees its command buffers, so it goes before the pool.
                drop(swapchain);
                unsafe {
                    device.device.destroy_command_pool(command_pool, None);
                    surface_loader.destroy_surface(surface, None);
                }
                return Err(err).context("Failed to create buffer manager");
            }
        };
        let pipelines = PipelineCompiler::new(device.clone());
        let submitter = FrameSubmitter::new(config.graphics.clear_color, config.acquire_timeout_ns());

        log::info!(
            "Vulkan context ready: {} swapchain images",
            swapchain.image_count()
        );

        Ok(Self {
            submitter,
            resources: SecondaryMap::new(),
            pipelines,
            buffers,
            swapchain,
            command_pool,
            surface,
            surface_loader,
            device,
            creation_order: Vec::new(),
            extent,
            needs_recreate: false,
            shut_down: false,
        })
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    pub fn limits(&self) -> &DeviceLimits {
        &self.device.limits
    }

    pub fn image_count(&self) -> u32 {
        self.swapchain.image_count()
    }

    pub fn swapchain_state(&self) -> SwapchainState {
        self.swapchain.state()
    }

    pub fn frame_number(&self) -> u64 {
        self.swapchain.frame_number()
    }

    pub fn color_format(&self) -> vk::Format {
        self.swapchain.format()
    }

    // -------------------------------------------------------------------------
    // Buffers
    // -------------------------------------------------------------------------

    pub fn create_vertex_buffer(&mut self, size_bytes: u64, initial: Option<&[u8]>) -> Result<BufferHandle> {
        let handle = self.buffers.create_vertex_buffer(size_bytes, initial)?;
        self.creation_order.push(Owned::Buffer(handle));
        Ok(handle)
    }

    pub fn create_index_buffer(&mut self, size_bytes: u64, initial: Option<&[u8]>) -> Result<BufferHandle> {
        let handle = self.buffers.create_index_buffer(size_bytes, initial)?;
        self.creation_order.push(Owned::Buffer(handle));
        Ok(handle)
    }

    /// Write into a vertex or index buffer.
    ///
    /// The caller guarantees no in-flight frame reads the written range,
    /// e.g. by writing from inside [`Self::draw_frame`] only to data that frame
    /// owns, or after [`VulkanDevice::wait_idle`].
    pub fn update_vertex_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        self.buffers.update_buffer(buffer, offset, data)
    }

    /// Destroy a buffer once the device has finished with it. Draws still
    /// naming it fail with `UnknownBuffer` until the draw list is replaced.
    pub fn delete_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        if !self.creation_order.contains(&Owned::Buffer(buffer)) {
            return Err(GraphicsError::UnknownBuffer);
        }
        self.device.wait_idle()?;
        self.buffers.delete_buffer(buffer)?;
        self.creation_order.retain(|owned| *owned != Owned::Buffer(buffer));
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Shaders and pipelines
    // -------------------------------------------------------------------------

    /// Create a shader module from SPIR-V bytes. The context destroys it on
    /// shutdown unless [`Self::destroy_shader`] is called first.
    pub fn load_shader(&mut self, spirv: &[u8]) -> Result<vk::ShaderModule> {
        let module = load_shader_module(&self.device, spirv)?;
        self.creation_order.push(Owned::Shader(module));
        Ok(module)
    }

    /// Shader modules are only needed while compiling, so this is safe as
    /// soon as every pipeline using `module` exists.
    pub fn destroy_shader(&mut self, module: vk::ShaderModule) {
        let before = self.creation_order.len();
        self.creation_order.retain(|owned| *owned != Owned::Shader(module));
        if self.creation_order.len() != before {
            unsafe { self.device.device.destroy_shader_module(module, None) };
        }
    }

    /// Compile `description` against the swapchain's color format and allocate
    /// its per-image descriptor sets and uniform buffers.
    pub fn create_pipeline(
        &mut self,
        description: &PipelineDescription,
        shaders: &ShaderSet,
    ) -> Result<PipelineHandle> {
        let handle = self
            .pipelines
            .compile(description, shaders, self.swapchain.format())?;

        if let Err(err) = self.allocate_resources(handle) {
            self.pipelines.destroy(handle)?;
            return Err(err);
        }

        self.creation_order.push(Owned::Pipeline(handle));
        Ok(handle)
    }

    fn allocate_resources(&mut self, handle: PipelineHandle) -> Result<()> {
        let pipeline = self.pipelines.get(handle).ok_or(GraphicsError::UnknownPipeline)?;
        let resources = PipelineResources::new(
            &self.device,
            &mut self.buffers,
            pipeline,
            self.swapchain.image_count() as usize,
        )?;
        self.resources.insert(handle, resources);
        Ok(())
    }

    /// Destroy a pipeline and its per-image resources after the device has
    /// drained. Draws using it are removed from the draw list.
    pub fn delete_pipeline(&mut self, pipeline: PipelineHandle) -> Result<()> {
        if self.pipelines.get(pipeline).is_none() {
            return Err(GraphicsError::UnknownPipeline);
        }
        self.device.wait_idle()?;
        self.submitter.forget_pipeline(pipeline);
        self.release_pipeline(pipeline)?;
        self.creation_order.retain(|owned| *owned != Owned::Pipeline(pipeline));
        Ok(())
    }

    fn release_pipeline(&mut self, pipeline: PipelineHandle) -> Result<()> {
        if let Some(mut resources) = self.resources.remove(pipeline) {
            resources.destroy(&self.device, &mut self.buffers);
        }
        self.pipelines.destroy(pipeline)
    }

    /// Human-readable dump of a live pipeline's description.
    pub fn print_pipeline_description(&self, pipeline: PipelineHandle) -> Option<String> {
        self.pipelines
            .get(pipeline)
            .map(|compiled| print_pipeline_description(&compiled.description))
    }

    // -------------------------------------------------------------------------
    // Frames
    // -------------------------------------------------------------------------

    /// Replace the draws recorded into every subsequent frame.
    pub fn bind_draws(&mut self, draws: Vec<DrawCall>) {
        self.submitter.set_draws(draws);
    }

    pub fn draws(&self) -> &[DrawCall] {
        self.submitter.draws()
    }

    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        self.submitter.set_clear_color(color);
    }

    /// New window size. The swapchain is rebuilt before the next frame; a
    /// zero-sized window pauses drawing until it has an area again.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.extent = vk::Extent2D { width, height };
        self.needs_recreate = true;
        self.swapchain.invalidate();
    }

    pub fn is_minimized(&self) -> bool {
        self.extent.width == 0 || self.extent.height == 0
    }

    /// Render one frame with the bound draws.
    pub fn draw(&mut self) -> Result<bool> {
        self.draw_frame(|_| Ok(()))
    }

    /// Render one frame, letting `update` write the acquired image's uniforms
    /// and push constants first.
    ///
    /// Returns `Ok(false)` when nothing was presented: the window is minimized
    /// or the swapchain had to be recreated. `Timeout` is returned to the
    /// caller, who may simply try again.
    pub fn draw_frame<F>(&mut self, update: F) -> Result<bool>
    where
        F: FnOnce(&mut FrameContext<'_>) -> Result<()>,
    {
        if self.shut_down {
            return Err(GraphicsError::InvalidState("context is shut down"));
        }
        if self.is_minimized() {
            return Ok(false);
        }
        if self.needs_recreate || self.swapchain.state() == SwapchainState::Stale {
            self.recreate_swapchain()?;
        }

        let result = self.submitter.submit_frame(
            &self.device,
            &mut self.swapchain,
            &self.pipelines,
            &self.resources,
            &mut self.buffers,
            update,
        );

        match result {
            Ok(image) => {
                log::trace!("Presented image {}", image);
                if self.swapchain.state() == SwapchainState::Stale {
                    self.needs_recreate = true;
                }
                Ok(true)
            }
            Err(err) if err.needs_recreate() => {
                log::debug!("Swapchain out of date, recreating");
                self.needs_recreate = true;
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Rebuild the swapchain and every pipeline's per-image resources for
    /// the current extent. Uniform contents are not carried over.
    fn recreate_swapchain(&mut self) -> Result<()> {
        if self.is_minimized() {
            return Ok(());
        }

        self.swapchain.recreate(self.extent)?;
        let image_count = self.swapchain.image_count() as usize;

        // Every compiled pipeline, so one that lost its resources to an earlier
        // failed recreation gets them back.
        let handles: Vec<_> = self.pipelines.handles().collect();
        for handle in handles {
            if let Some(mut old) = self.resources.remove(handle) {
                old.destroy(&self.device, &mut self.buffers);
            }
            let pipeline = self.pipelines.get(handle).ok_or(GraphicsError::UnknownPipeline)?;
            let resources =
                PipelineResources::new(&self.device, &mut self.buffers, pipeline, image_count)?;
            self.resources.insert(handle, resources);
        }

        self.needs_recreate = false;
        log::info!(
            "Recreated swapchain: {}x{}, {} images",
            self.swapchain.extent().width,
            self.swapchain.extent().height,
            image_count
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    /// Drain the device and destroy everything the context created, newest
    /// first.
    pub fn shutdown(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.shut_down {
            return;
        }
        if let Err(err) = self.device.wait_idle() {
            log::warn!("wait_idle failed during shutdown: {}", err);
        }

        let plan = teardown_plan(&std::mem::take(&mut self.creation_order));
        for step in plan {
            match step {
                TeardownStep::Release(owned) => {
                    let released = match owned {
                        Owned::Pipeline(handle) => self.release_pipeline(handle),
                        Owned::Buffer(handle) => self.buffers.delete_buffer(handle),
                        Owned::Shader(module) => {
                            unsafe { self.device.device.destroy_shader_module(module, None) };
                            Ok(())
                        }
                    };
                    if let Err(err) = released {
                        log::warn!("Failed to release {:?}: {}", owned, err);
                    }
                }
                TeardownStep::Buffers => self.buffers.destroy(),
                TeardownStep::Swapchain => self.swapchain.destroy(),
                TeardownStep::CommandPool => unsafe {
                    self.device.device.destroy_command_pool(self.command_pool, None)
                },
                TeardownStep::Surface => unsafe {
                    self.surface_loader.destroy_surface(self.surface, None)
                },
            }
        }
        self.shut_down = true;
        log::info!("Vulkan context shut down");
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use slotmap::KeyData;

    #[test]
    fn teardown_runs_in_reverse_creation_order() {
        let buffer = BufferHandle::from(KeyData::from_ffi(1));
        let shader = vk::ShaderModule::from_raw(7);
        let pipeline = PipelineHandle::from(KeyData::from_ffi(2));
        let created = [Owned::Buffer(buffer), Owned::Shader(shader), Owned::Pipeline(pipeline)];

        assert_eq!(
            teardown_plan(&created),
            vec![
                TeardownStep::Release(Owned::Pipeline(pipeline)),
                TeardownStep::Release(Owned::Shader(shader)),
                TeardownStep::Release(Owned::Buffer(buffer)),
                TeardownStep::Buffers,
                TeardownStep::Swapchain,
                TeardownStep::CommandPool,
                TeardownStep::Surface,
            ]
        );
    }

    #[test]
    fn empty_context_still_tears_down_its_own_objects() {
        assert_eq!(teardown_plan(&[]).first(), Some(&TeardownStep::Buffers));
        assert_eq!(teardown_plan(&[]).len(), 4);
    }
}
