// Pipeline descriptions
//
// Everything in here is plain data checked against DeviceLimits. Nothing
// touches the device; the backend consumes these types.

mod format;
mod limits;
mod pipeline;
mod resources;
mod validate;
mod vertex;

pub use format::VertexFormat;
pub use limits::DeviceLimits;
pub use pipeline::{
    print_pipeline_description, BlendMode, CullMode, FixedFunctionState, FrontFace,
    PipelineDescription, PolygonMode, ShaderStageDesc, Topology,
};
pub use resources::{
    ResourceBindingBuilder, ResourceBindings, StageMask, VulkanDescriptorSetEntry,
    VulkanDescriptorSetEntryBinding, VulkanDescriptorSetType, VulkanPushConstantEntry,
    VulkanStage,
};
pub use vertex::{
    VertexBinding, VertexInputDescription, VertexInputEntry, VertexLayoutBuilder, VertexRate,
};
