//! Declarative Vulkan pipelines and per-frame resource lifecycle.
//!
//! Build a [`PipelineDescription`] with [`VertexLayoutBuilder`] and
//! [`ResourceBindingBuilder`], compile it through a [`VulkanContext`], then call
//! [`VulkanContext::draw`] once per frame. The context owns the device, the
//! swapchain and every buffer and pipeline it created, and destroys them in
//! reverse creation order on shutdown.

pub mod backend;
pub mod config;
pub mod context;
pub mod description;
pub mod error;

pub use backend::{BufferHandle, DrawCall, FrameContext, IndexType, PipelineHandle, ShaderSet};
pub use config::Config;
pub use context::VulkanContext;
pub use description::{
    print_pipeline_description, DeviceLimits, PipelineDescription, ResourceBindingBuilder,
    StageMask, VertexFormat, VertexLayoutBuilder, VertexRate, VulkanDescriptorSetType,
    VulkanStage,
};
pub use error::{GraphicsError, Result, ValidationError};

/// Minimum number of swapchain images. Per-image arrays sized to this hold
/// for every swapchain the context creates.
pub const VK_REQUIRED_IMAGE_COUNT: u32 = 4;
