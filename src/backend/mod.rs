// Backend module - Vulkan objects behind the pipeline descriptions
//
// Device, buffers, pipelines, swapchain and per-frame submission. Everything
// here is driven through VulkanContext; the pieces are public so hosts with
// their own frame loop can compose them directly.

pub mod buffer;
pub mod descriptors;
pub mod device;
pub mod frame_slots;
pub mod pipeline;
pub mod shader;
pub mod submit;
pub mod swapchain;
pub mod sync;

pub use buffer::{BufferHandle, BufferManager, BufferUsage, MemoryKind, VulkanBuffer};
pub use descriptors::{PipelineResources, UniformSlot};
pub use device::VulkanDevice;
pub use frame_slots::FrameSlots;
pub use pipeline::{
    compile_pipeline, derive_layout, DerivedBinding, DerivedLayout, DerivedPushRange,
    PipelineCompiler, PipelineHandle, PushSegment, VulkanPipeline,
};
pub use shader::{load_shader_module, ShaderSet};
pub use submit::{DrawCall, FrameContext, FrameSubmitter, IndexType};
pub use swapchain::{AcquiredImage, SwapchainEvent, SwapchainManager, SwapchainState};
pub use sync::{ImageSync, SemaphorePool};
