// Pipeline description
//
// The sole input to pipeline compilation. Plain data: it can be cloned,
// compared, serialized and printed before anything touches the device.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{
    ResourceBindings, VertexInputDescription, VulkanDescriptorSetEntry, VulkanPushConstantEntry,
    VulkanStage,
};

/// A shader stage the pipeline expects, and its entry point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShaderStageDesc {
    pub stage: VulkanStage,
    #[serde(default = "default_entry_point")]
    pub entry_point: String,
}

fn default_entry_point() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    TriangleList,
    TriangleStrip,
    LineList,
    PointList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolygonMode {
    Fill,
    Line,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CullMode {
    None,
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrontFace {
    Clockwise,
    CounterClockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlendMode {
    /// Source replaces destination.
    Opaque,
    /// Straight alpha: `src * a + dst * (1 - a)`.
    Alpha,
    /// `src * a + dst`.
    Additive,
}

/// Rasterization and blend policy.
///
/// Defaults: triangle list, filled polygons, back faces culled, clockwise
/// front faces, opaque writes. Depth testing is always off; pipelines render
/// to a single color attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct FixedFunctionState {
    pub topology: Topology,
    pub polygon_mode: PolygonMode,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub blend: BlendMode,
}

impl Default for FixedFunctionState {
    fn default() -> Self {
        Self {
            topology: Topology::TriangleList,
            polygon_mode: PolygonMode::Fill,
            cull_mode: CullMode::Back,
            front_face: FrontFace::Clockwise,
            blend: BlendMode::Opaque,
        }
    }
}

/// Everything needed to compile one graphics pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineDescription {
    pub shader_stages: Vec<ShaderStageDesc>,
    pub vertex_input: VertexInputDescription,
    pub push_constants: Vec<VulkanPushConstantEntry>,
    pub descriptor_sets: Vec<VulkanDescriptorSetEntry>,
    pub fixed_function: FixedFunctionState,
}

impl PipelineDescription {
    pub fn new(vertex_input: VertexInputDescription, resources: ResourceBindings) -> Self {
        Self {
            shader_stages: Vec::new(),
            vertex_input,
            push_constants: resources.push_constants,
            descriptor_sets: resources.descriptor_sets,
            fixed_function: FixedFunctionState::default(),
        }
    }

    /// Declare a stage with the conventional `main` entry point.
    pub fn with_stage(self, stage: VulkanStage) -> Self {
        self.with_stage_entry(stage, "main")
    }

    pub fn with_stage_entry(mut self, stage: VulkanStage, entry_point: &str) -> Self {
        self.shader_stages.push(ShaderStageDesc {
            stage,
            entry_point: entry_point.to_string(),
        });
        self
    }

    pub fn with_fixed_function(mut self, fixed_function: FixedFunctionState) -> Self {
        self.fixed_function = fixed_function;
        self
    }

    /// Parse a description from TOML. The result is not validated; the
    /// compiler checks it like any other description.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(self)
    }

    /// Number of uniform-buffer bindings across all sets.
    pub fn uniform_buffer_count(&self) -> usize {
        self.descriptor_sets.iter().map(|set| set.bindings.len()).sum()
    }
}

/// Deterministic human-readable dump of a description, one fact per line.
pub fn print_pipeline_description(description: &PipelineDescription) -> String {
    description.to_string()
}

fn none_if_empty(f: &mut fmt::Formatter<'_>, empty: bool) -> fmt::Result {
    if empty {
        writeln!(f, "    (none)")?;
    }
    Ok(())
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TriangleList => "triangle-list",
            Self::TriangleStrip => "triangle-strip",
            Self::LineList => "line-list",
            Self::PointList => "point-list",
        })
    }
}

impl fmt::Display for FixedFunctionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let polygon = match self.polygon_mode {
            PolygonMode::Fill => "fill",
            PolygonMode::Line => "line",
        };
        let cull = match self.cull_mode {
            CullMode::None => "none",
            CullMode::Front => "front",
            CullMode::Back => "back",
        };
        let front_face = match self.front_face {
            FrontFace::Clockwise => "clockwise",
            FrontFace::CounterClockwise => "counter-clockwise",
        };
        let blend = match self.blend {
            BlendMode::Opaque => "opaque",
            BlendMode::Alpha => "alpha",
            BlendMode::Additive => "additive",
        };
        write!(
            f,
            "topology={} polygon={polygon} cull={cull} front-face={front_face} blend={blend}",
            self.topology
        )
    }
}

impl fmt::Display for PipelineDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "pipeline")?;

        writeln!(f, "  shader stages:")?;
        none_if_empty(f, self.shader_stages.is_empty())?;
        for stage in &self.shader_stages {
            writeln!(f, "    {} entry={}", stage.stage, stage.entry_point)?;
        }

        writeln!(f, "  vertex bindings:")?;
        none_if_empty(f, self.vertex_input.bindings.is_empty())?;
        for binding in &self.vertex_input.bindings {
            writeln!(
                f,
                "    binding {}: stride={} rate={}",
                binding.binding_index, binding.stride_bytes, binding.rate
            )?;
        }

        writeln!(f, "  vertex attributes:")?;
        none_if_empty(f, self.vertex_input.attributes.is_empty())?;
        for attribute in &self.vertex_input.attributes {
            writeln!(
                f,
                "    location {}: binding={} format={} offset={}",
                attribute.location, attribute.binding, attribute.format, attribute.offset_bytes
            )?;
        }

        writeln!(f, "  push constants:")?;
        none_if_empty(f, self.push_constants.is_empty())?;
        for range in &self.push_constants {
            writeln!(
                f,
                "    [{}, {}) stages={}",
                range.offset_bytes,
                range.end_bytes(),
                range.stage
            )?;
        }

        writeln!(f, "  descriptor sets:")?;
        none_if_empty(f, self.descriptor_sets.is_empty())?;
        for (set_index, set) in self.descriptor_sets.iter().enumerate() {
            writeln!(f, "    set {set_index}:")?;
            for binding in &set.bindings {
                writeln!(
                    f,
                    "      binding {}: {} stages={}",
                    binding.binding_index, binding.kind, binding.stage
                )?;
            }
        }

        writeln!(f, "  fixed function: {}", self.fixed_function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::{
        DeviceLimits, ResourceBindingBuilder, VertexFormat, VertexLayoutBuilder, VertexRate,
        VulkanDescriptorSetType,
    };

    fn sample() -> PipelineDescription {
        let mut vertex = VertexLayoutBuilder::new();
        vertex.add_vertex_binding(0, 20, VertexRate::PerVertex).unwrap();
        vertex.add_vertex_attribute(0, 0, VertexFormat::Float32x2).unwrap();
        vertex.add_vertex_attribute(1, 0, VertexFormat::Float32x3).unwrap();

        let mut resources = ResourceBindingBuilder::new(&DeviceLimits::default());
        resources.add_push_constant(VulkanStage::Vertex, 64).unwrap();
        resources
            .add_descriptor_binding(
                0,
                VulkanDescriptorSetType::UniformBuffer { size_bytes: 16 },
                VulkanStage::Fragment,
            )
            .unwrap();

        PipelineDescription::new(vertex.finish(), resources.finish())
            .with_stage(VulkanStage::Vertex)
            .with_stage(VulkanStage::Fragment)
    }

    #[test]
    fn print_is_deterministic() {
        let description = sample();
        assert_eq!(
            print_pipeline_description(&description),
            print_pipeline_description(&description)
        );
        assert_eq!(
            print_pipeline_description(&description),
            print_pipeline_description(&description.clone())
        );
    }

    #[test]
    fn print_reflects_field_changes() {
        let description = sample();
        let mut changed = description.clone();
        changed.fixed_function.cull_mode = CullMode::None;
        assert_ne!(
            print_pipeline_description(&description),
            print_pipeline_description(&changed)
        );
    }

    #[test]
    fn empty_description_prints_placeholders() {
        let text = print_pipeline_description(&PipelineDescription::default());
        assert_eq!(text.matches("(none)").count(), 5);
    }

    #[test]
    fn toml_round_trip_preserves_description() {
        let description = sample();
        let text = description.to_toml_string().unwrap();
        let parsed = PipelineDescription::from_toml_str(&text).unwrap();
        assert_eq!(parsed, description);
    }
}
