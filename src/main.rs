// =============================================================================
// vk-pipeline demo - a spinning triangle
// =============================================================================
//
// Describes one pipeline with the builders, compiles it through VulkanContext
// and draws it every frame. A per-image uniform carries a tint and the time;
// a push constant carries the rotation.
//
// FRAME FLOW:
// 1. winit RedrawRequested
// 2. VulkanContext::draw_frame: acquire, wait for the image's fence
// 3. Closure writes that image's uniform and the draw's push constants
// 4. Record, submit, present
//
// Shaders: shaders/triangle.{vert,frag}.spv (built by build.rs when glslc is
// available).

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::fs::File;
use std::sync::Arc;
use std::time::Instant;
use vk_pipeline::{
    Config, DrawCall, GraphicsError, PipelineDescription, PipelineHandle, ResourceBindingBuilder,
    ShaderSet, StageMask, VertexFormat, VertexLayoutBuilder, VertexRate, VulkanContext,
    VulkanDescriptorSetType, VulkanStage,
};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Vertex {
    position: [f32; 2],
    color: [f32; 3],
}

const TRIANGLE: [Vertex; 3] = [
    Vertex { position: [0.0, -0.6], color: [1.0, 0.2, 0.2] },
    Vertex { position: [0.6, 0.5], color: [0.2, 1.0, 0.2] },
    Vertex { position: [-0.6, 0.5], color: [0.2, 0.2, 1.0] },
];

/// Matches `Frame` in the shaders (std140).
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct FrameUniforms {
    tint: [f32; 4],
    time: f32,
    _pad: [f32; 3],
}

fn main() -> Result<()> {
    let config = Config::load();
    init_logging(&config)?;

    log::info!("Starting vk-pipeline demo");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// env_logger at Info (RUST_LOG overrides), optionally into the configured file.
fn init_logging(config: &Config) -> Result<()> {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();

    if config.debug.log_to_file {
        let file = File::create(&config.debug.log_file)
            .with_context(|| format!("Failed to create log file {}", config.debug.log_file))?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

/// Describe the triangle pipeline: one interleaved vertex buffer, a frame
/// uniform visible to both stages and a vertex-stage transform.
fn triangle_description(context: &VulkanContext) -> Result<PipelineDescription> {
    let mut vertices = VertexLayoutBuilder::new();
    vertices.add_vertex_binding(0, std::mem::size_of::<Vertex>() as u32, VertexRate::PerVertex)?;
    vertices.add_vertex_attribute(0, 0, VertexFormat::Float32x2)?;
    vertices.add_vertex_attribute(1, 0, VertexFormat::Float32x3)?;

    let mut resources = ResourceBindingBuilder::new(context.limits());
    resources.add_push_constant(VulkanStage::Vertex, std::mem::size_of::<Mat4>() as u32)?;
    resources.add_descriptor_binding(
        0,
        VulkanDescriptorSetType::UniformBuffer {
            size_bytes: std::mem::size_of::<FrameUniforms>() as u32,
        },
        StageMask::VERTEX | StageMask::FRAGMENT,
    )?;

    Ok(PipelineDescription::new(vertices.finish(), resources.finish())
        .with_stage(VulkanStage::Vertex)
        .with_stage(VulkanStage::Fragment))
}

struct App {
    config: Config,
    window: Option<Arc<Window>>,
    context: Option<VulkanContext>,
    pipeline: Option<PipelineHandle>,
    is_fullscreen: bool,
    started: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        Self {
            config,
            window: None,
            context: None,
            pipeline: None,
            is_fullscreen,
            started: Instant::now(),
        }
    }

    fn init_vulkan(&mut self, window: &Window) -> Result<()> {
        let size = window.inner_size();
        let extent = vk::Extent2D {
            width: size.width,
            height: size.height,
        };
        let mut context = VulkanContext::init(
            window.raw_display_handle(),
            window.raw_window_handle(),
            extent,
            &self.config,
        )?;

        let description = triangle_description(&context)?;
        log::info!("Pipeline:\n{}", vk_pipeline::print_pipeline_description(&description));

        let vert = std::fs::read("shaders/triangle.vert.spv")
            .context("Failed to read shaders/triangle.vert.spv (is glslc installed?)")?;
        let frag = std::fs::read("shaders/triangle.frag.spv")
            .context("Failed to read shaders/triangle.frag.spv (is glslc installed?)")?;
        let shaders = ShaderSet::new()
            .with(VulkanStage::Vertex, context.load_shader(&vert)?)
            .with(VulkanStage::Fragment, context.load_shader(&frag)?);

        let pipeline = context.create_pipeline(&description, &shaders)?;
        for stage in [VulkanStage::Vertex, VulkanStage::Fragment] {
            if let Some(module) = shaders.get(stage) {
                context.destroy_shader(module);
            }
        }

        let vertex_bytes: &[u8] = bytemuck::cast_slice(&TRIANGLE);
        let vertices = context.create_vertex_buffer(vertex_bytes.len() as u64, Some(vertex_bytes))?;
        context.bind_draws(vec![DrawCall::new(pipeline, TRIANGLE.len() as u32)
            .with_vertex_buffer(vertices)
            .with_push_constants(bytemuck::bytes_of(&Mat4::IDENTITY))]);

        self.context = Some(context);
        self.pipeline = Some(pipeline);
        log::info!("Vulkan initialized");
        Ok(())
    }

    /// Returns false when the app should stop.
    fn render_frame(&mut self) -> bool {
        let (Some(context), Some(pipeline)) = (self.context.as_mut(), self.pipeline) else {
            return true;
        };
        let time = self.started.elapsed().as_secs_f32();

        let result = context.draw_frame(|frame| {
            let uniforms = FrameUniforms {
                tint: [1.0, 0.9, 0.8, 1.0],
                time,
                _pad: [0.0; 3],
            };
            frame.write_uniform(pipeline, 0, 0, bytemuck::bytes_of(&uniforms))?;

            let aspect = frame.aspect_ratio();
            let transform = Mat4::from_scale(Vec3::new(1.0 / aspect.max(1.0), 1.0, 1.0))
                * Mat4::from_rotation_z(time);
            frame.set_push_constants(0, bytemuck::bytes_of(&transform))
        });

        match result {
            Ok(_) => true,
            Err(GraphicsError::Timeout) => {
                log::debug!("Acquire timed out, retrying next frame");
                true
            }
            Err(e) if e.is_fatal() => {
                log::error!("Fatal render error: {}", e);
                false
            }
            Err(e) => {
                log::warn!("Frame skipped: {}", e);
                true
            }
        }
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;
            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
        }
    }

    fn shutdown(&mut self) {
        if let Some(context) = self.context.take() {
            context.shutdown();
        }
        self.pipeline = None;
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));
        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_vulkan(&window) {
            log::error!("Failed to initialize Vulkan: {:#}", e);
            self.shutdown();
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown();
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(ref mut context) = self.context {
                    context.resize(size.width, size.height);
                }
            }

            WindowEvent::RedrawRequested => {
                if !self.render_frame() {
                    self.shutdown();
                    event_loop.exit();
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    match event.physical_key {
                        PhysicalKey::Code(KeyCode::Escape) => {
                            log::info!("ESC pressed, exiting...");
                            self.shutdown();
                            event_loop.exit();
                        }
                        PhysicalKey::Code(KeyCode::F11) => self.toggle_fullscreen(),
                        _ => {}
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.shutdown();
    }
}
