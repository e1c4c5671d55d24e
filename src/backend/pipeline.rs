// Pipeline compiler
//
// PipelineDescription + shader modules + render-target format in, immutable
// VulkanPipeline out. The description is validated, a plain-data layout is
// derived from it, and only then are device objects created. Every object
// created on the way is destroyed again if a later step fails.
//
// Pipelines render through dynamic rendering into a single color attachment,
// so there is no render pass. Viewport and scissor are dynamic state.

use ash::vk;
use slotmap::SlotMap;
use std::ffi::CString;
use std::sync::Arc;

use super::{ShaderSet, VulkanDevice};
use crate::description::{
    print_pipeline_description, BlendMode, CullMode, FixedFunctionState, FrontFace,
    PipelineDescription, PolygonMode, StageMask, Topology, VertexRate, VulkanDescriptorSetType,
    VulkanStage,
};
use crate::error::{GraphicsError, Result, ValidationError};

slotmap::new_key_type! {
    /// Non-owning reference to a compiled pipeline.
    pub struct PipelineHandle;
}

/// One binding of a derived descriptor-set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DerivedBinding {
    pub binding: u32,
    pub kind: VulkanDescriptorSetType,
    pub stages: StageMask,
}

/// One push-constant range as handed to the pipeline layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DerivedPushRange {
    pub stages: StageMask,
    pub offset: u32,
    pub size: u32,
}

impl DerivedPushRange {
    fn end(&self) -> u32 {
        self.offset + self.size
    }
}

/// Device-independent shape of a pipeline layout. Two descriptions with the
/// same bindings and push constants derive equal layouts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DerivedLayout {
    /// Per descriptor set, bindings sorted by binding index.
    pub set_layouts: Vec<Vec<DerivedBinding>>,
    /// At most one range per stage, sorted by offset.
    pub push_constant_ranges: Vec<DerivedPushRange>,
}

/// A slice of push-constant bytes and the exact stage flags it must be
/// pushed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushSegment {
    pub stages: StageMask,
    pub offset: u32,
    pub size: u32,
}

impl DerivedLayout {
    /// Bytes of push-constant space the layout exposes.
    pub fn push_constant_size(&self) -> u32 {
        self.push_constant_ranges.iter().map(DerivedPushRange::end).max().unwrap_or(0)
    }

    /// Split the first `len` bytes of a push-constant block into segments
    /// that can each be pushed with one `cmd_push_constants` call.
    ///
    /// Every range overlapping a segment covers it entirely, and the segment's
    /// stages are exactly those ranges' stages. Bytes no range covers are
    /// skipped.
    pub fn push_segments(&self, len: u32) -> Vec<PushSegment> {
        let mut cuts = vec![0, len];
        for range in &self.push_constant_ranges {
            cuts.extend([range.offset, range.end()].into_iter().filter(|&c| c < len));
        }
        cuts.sort_unstable();
        cuts.dedup();

        let mut segments: Vec<PushSegment> = Vec::new();
        for window in cuts.windows(2) {
            let (start, end) = (window[0], window[1]);
            let stages = self
                .push_constant_ranges
                .iter()
                .filter(|range| range.offset <= start && end <= range.end())
                .fold(StageMask::empty(), |mask, range| mask | range.stages);
            if stages.is_empty() {
                continue;
            }

            match segments.last_mut() {
                Some(last) if last.stages == stages && last.offset + last.size == start => {
                    last.size += end - start;
                }
                _ => segments.push(PushSegment {
                    stages,
                    offset: start,
                    size: end - start,
                }),
            }
        }
        segments
    }
}

/// Derive the layout of a validated description.
///
/// Vulkan allows a stage in at most one push-constant range, so each stage
/// gets the span covering every range visible to it, and stages with the
/// same span share one range.
pub fn derive_layout(description: &PipelineDescription) -> DerivedLayout {
    let set_layouts = description
        .descriptor_sets
        .iter()
        .map(|set| {
            let mut bindings: Vec<_> = set
                .bindings
                .iter()
                .map(|b| DerivedBinding {
                    binding: b.binding_index,
                    kind: b.kind,
                    stages: b.stage,
                })
                .collect();
            bindings.sort_by_key(|b| b.binding);
            bindings
        })
        .collect();

    let mut push_constant_ranges: Vec<DerivedPushRange> = Vec::new();
    for stage in VulkanStage::ALL {
        let mask = StageMask::from(stage);
        let visible = description
            .push_constants
            .iter()
            .filter(|range| range.stage.contains(mask));

        let span = visible.fold(None, |span: Option<(u32, u32)>, range| {
            let (start, end) = span.unwrap_or((range.offset_bytes, range.end_bytes()));
            Some((start.min(range.offset_bytes), end.max(range.end_bytes())))
        });

        if let Some((start, end)) = span {
            match push_constant_ranges
                .iter_mut()
                .find(|r| r.offset == start && r.end() == end)
            {
                Some(shared) => shared.stages |= mask,
                None => push_constant_ranges.push(DerivedPushRange {
                    stages: mask,
                    offset: start,
                    size: end - start,
                }),
            }
        }
    }
    push_constant_ranges.sort_by_key(|r| (r.offset, r.size));

    DerivedLayout {
        set_layouts,
        push_constant_ranges,
    }
}

pub fn stage_flags(mask: StageMask) -> vk::ShaderStageFlags {
    mask.stages()
        .fold(vk::ShaderStageFlags::empty(), |flags, stage| flags | shader_stage(stage))
}

fn shader_stage(stage: VulkanStage) -> vk::ShaderStageFlags {
    match stage {
        VulkanStage::Vertex => vk::ShaderStageFlags::VERTEX,
        VulkanStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
    }
}

fn input_rate(rate: VertexRate) -> vk::VertexInputRate {
    match rate {
        VertexRate::PerVertex => vk::VertexInputRate::VERTEX,
        VertexRate::PerInstance => vk::VertexInputRate::INSTANCE,
    }
}

pub fn descriptor_type(kind: VulkanDescriptorSetType) -> vk::DescriptorType {
    match kind {
        VulkanDescriptorSetType::UniformBuffer { .. } => vk::DescriptorType::UNIFORM_BUFFER,
    }
}

fn topology(topology: Topology) -> vk::PrimitiveTopology {
    match topology {
        Topology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        Topology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        Topology::LineList => vk::PrimitiveTopology::LINE_LIST,
        Topology::PointList => vk::PrimitiveTopology::POINT_LIST,
    }
}

fn rasterization(state: &FixedFunctionState) -> vk::PipelineRasterizationStateCreateInfo {
    let polygon_mode = match state.polygon_mode {
        PolygonMode::Fill => vk::PolygonMode::FILL,
        PolygonMode::Line => vk::PolygonMode::LINE,
    };
    let cull_mode = match state.cull_mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
    };
    let front_face = match state.front_face {
        FrontFace::Clockwise => vk::FrontFace::CLOCKWISE,
        FrontFace::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
    };

    vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(polygon_mode)
        .line_width(1.0)
        .cull_mode(cull_mode)
        .front_face(front_face)
        .depth_bias_enable(false)
        .build()
}

fn blend_attachment(blend: BlendMode) -> vk::PipelineColorBlendAttachmentState {
    let builder = vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA);

    let state = match blend {
        BlendMode::Opaque => builder.blend_enable(false),
        BlendMode::Alpha => builder
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD),
        BlendMode::Additive => builder
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE)
            .alpha_blend_op(vk::BlendOp::ADD),
    };
    state.build()
}

/// A compiled pipeline and the layout objects it was built with.
#[derive(Debug)]
pub struct VulkanPipeline {
    pub layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
    pub set_layouts: Vec<vk::DescriptorSetLayout>,
    pub derived: DerivedLayout,
    pub description: PipelineDescription,
    pub color_format: vk::Format,
}

impl VulkanPipeline {
    fn destroy(self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
            for set_layout in self.set_layouts.into_iter().rev() {
                device.destroy_descriptor_set_layout(set_layout, None);
            }
        }
    }
}

fn destroy_set_layouts(device: &ash::Device, set_layouts: &[vk::DescriptorSetLayout]) {
    for &set_layout in set_layouts.iter().rev() {
        unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
    }
}

/// Compile one pipeline. Validation failures create nothing; device failures
/// release whatever was created before the error is returned.
pub fn compile_pipeline(
    device: &VulkanDevice,
    description: &PipelineDescription,
    shaders: &ShaderSet,
    color_format: vk::Format,
) -> Result<VulkanPipeline> {
    description.validate(&device.limits)?;

    let mut modules = Vec::with_capacity(description.shader_stages.len());
    for stage in &description.shader_stages {
        let module = shaders
            .get(stage.stage)
            .ok_or(ValidationError::MissingShaderStage(stage.stage))?;
        let entry_point = CString::new(stage.entry_point.as_str())
            .map_err(|_| GraphicsError::InvalidState("shader entry point contains a NUL byte"))?;
        modules.push((stage.stage, module, entry_point));
    }

    log::debug!("Compiling {}", print_pipeline_description(description));

    let derived = derive_layout(description);
    let vk_device = &device.device;

    // (b) descriptor-set layouts
    let mut set_layouts = Vec::with_capacity(derived.set_layouts.len());
    for set in &derived.set_layouts {
        let bindings: Vec<_> = set
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(b.binding)
                    .descriptor_type(descriptor_type(b.kind))
                    .descriptor_count(1)
                    .stage_flags(stage_flags(b.stages))
                    .build()
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);

        match unsafe { vk_device.create_descriptor_set_layout(&info, None) } {
            Ok(set_layout) => set_layouts.push(set_layout),
            Err(err) => {
                destroy_set_layouts(vk_device, &set_layouts);
                return Err(err.into());
            }
        }
    }

    // (c) pipeline layout
    let push_ranges: Vec<_> = derived
        .push_constant_ranges
        .iter()
        .map(|r| vk::PushConstantRange {
            stage_flags: stage_flags(r.stages),
            offset: r.offset,
            size: r.size,
        })
        .collect();
    let layout_info = vk::PipelineLayoutCreateInfo::builder()
        .set_layouts(&set_layouts)
        .push_constant_ranges(&push_ranges);

    let layout = match unsafe { vk_device.create_pipeline_layout(&layout_info, None) } {
        Ok(layout) => layout,
        Err(err) => {
            destroy_set_layouts(vk_device, &set_layouts);
            return Err(err.into());
        }
    };

    // (d) fixed-function state + stages
    let stages: Vec<_> = modules
        .iter()
        .map(|(stage, module, entry_point)| {
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(shader_stage(*stage))
                .module(*module)
                .name(entry_point)
                .build()
        })
        .collect();

    let bindings: Vec<_> = description
        .vertex_input
        .bindings
        .iter()
        .map(|b| vk::VertexInputBindingDescription {
            binding: b.binding_index,
            stride: b.stride_bytes,
            input_rate: input_rate(b.rate),
        })
        .collect();
    let attributes: Vec<_> = description
        .vertex_input
        .attributes
        .iter()
        .map(|a| vk::VertexInputAttributeDescription {
            location: a.location,
            binding: a.binding,
            format: a.format.native(),
            offset: a.offset_bytes,
        })
        .collect();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let fixed = &description.fixed_function;
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(topology(fixed.topology))
        .primitive_restart_enable(false);

    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    let rasterizer = rasterization(fixed);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(false)
        .depth_write_enable(false)
        .stencil_test_enable(false);

    let color_blend_attachments = [blend_attachment(fixed.blend)];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let color_formats = [color_format];
    let mut rendering_info =
        vk::PipelineRenderingCreateInfo::builder().color_attachment_formats(&color_formats);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info)
        .build();

    let created = unsafe {
        vk_device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    };

    let pipeline = match created {
        Ok(pipelines) => pipelines[0],
        Err((pipelines, err)) => {
            unsafe {
                for pipeline in pipelines.into_iter().filter(|p| *p != vk::Pipeline::null()) {
                    vk_device.destroy_pipeline(pipeline, None);
                }
                vk_device.destroy_pipeline_layout(layout, None);
            }
            destroy_set_layouts(vk_device, &set_layouts);
            log::error!("Device rejected pipeline: {:?}", err);
            return Err(match GraphicsError::from(err) {
                GraphicsError::OutOfDeviceMemory => GraphicsError::OutOfDeviceMemory,
                GraphicsError::DeviceLost => GraphicsError::DeviceLost,
                _ => GraphicsError::DeviceCompile(err),
            });
        }
    };

    Ok(VulkanPipeline {
        layout,
        pipeline,
        set_layouts,
        derived,
        description: description.clone(),
        color_format,
    })
}

/// Registry of live pipelines. Sole owner and destructor of every pipeline it
/// compiled.
pub struct PipelineCompiler {
    device: Arc<VulkanDevice>,
    pipelines: SlotMap<PipelineHandle, VulkanPipeline>,
}

impl PipelineCompiler {
    pub fn new(device: Arc<VulkanDevice>) -> Self {
        Self {
            device,
            pipelines: SlotMap::with_key(),
        }
    }

    pub fn compile(
        &mut self,
        description: &PipelineDescription,
        shaders: &ShaderSet,
        color_format: vk::Format,
    ) -> Result<PipelineHandle> {
        let pipeline = compile_pipeline(&self.device, description, shaders, color_format)?;
        log::info!(
            "Compiled pipeline: {} stages, {} descriptor sets, {} push ranges",
            description.shader_stages.len(),
            pipeline.set_layouts.len(),
            pipeline.derived.push_constant_ranges.len()
        );
        Ok(self.pipelines.insert(pipeline))
    }

    pub fn get(&self, handle: PipelineHandle) -> Option<&VulkanPipeline> {
        self.pipelines.get(handle)
    }

    pub fn handles(&self) -> impl Iterator<Item = PipelineHandle> + '_ {
        self.pipelines.keys()
    }

    /// Destroy a pipeline. The caller guarantees no in-flight frame uses it.
    pub fn destroy(&mut self, handle: PipelineHandle) -> Result<()> {
        let pipeline = self.pipelines.remove(handle).ok_or(GraphicsError::UnknownPipeline)?;
        pipeline.destroy(&self.device.device);
        Ok(())
    }
}

impl Drop for PipelineCompiler {
    fn drop(&mut self) {
        let remaining: Vec<_> = self.pipelines.drain().map(|(_, p)| p).collect();
        for pipeline in remaining {
            pipeline.destroy(&self.device.device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::{
        DeviceLimits, ResourceBindingBuilder, VertexInputDescription, VulkanDescriptorSetType,
    };

    fn with_push(ranges: &[(StageMask, u32, u32)]) -> PipelineDescription {
        let mut resources = ResourceBindingBuilder::new(&DeviceLimits::default());
        for &(stage, offset, size) in ranges {
            resources.add_push_constant_range(stage, offset, size).unwrap();
        }
        PipelineDescription::new(VertexInputDescription::default(), resources.finish())
            .with_stage(VulkanStage::Vertex)
    }

    #[test]
    fn separate_stage_ranges_stay_separate() {
        let layout = derive_layout(&with_push(&[
            (StageMask::VERTEX, 0, 64),
            (StageMask::FRAGMENT, 64, 16),
        ]));

        assert_eq!(
            layout.push_constant_ranges,
            vec![
                DerivedPushRange { stages: StageMask::VERTEX, offset: 0, size: 64 },
                DerivedPushRange { stages: StageMask::FRAGMENT, offset: 64, size: 16 },
            ]
        );
    }

    #[test]
    fn ranges_of_one_stage_merge_into_a_span() {
        let layout = derive_layout(&with_push(&[
            (StageMask::VERTEX, 0, 16),
            (StageMask::VERTEX, 16, 16),
        ]));

        assert_eq!(
            layout.push_constant_ranges,
            vec![DerivedPushRange { stages: StageMask::VERTEX, offset: 0, size: 32 }]
        );
    }

    #[test]
    fn identical_spans_share_one_range() {
        let layout = derive_layout(&with_push(&[(StageMask::all(), 0, 32)]));
        assert_eq!(
            layout.push_constant_ranges,
            vec![DerivedPushRange { stages: StageMask::all(), offset: 0, size: 32 }]
        );
    }

    #[test]
    fn push_segments_follow_range_boundaries() {
        let layout = derive_layout(&with_push(&[
            (StageMask::VERTEX, 0, 64),
            (StageMask::FRAGMENT, 64, 16),
        ]));

        assert_eq!(
            layout.push_segments(80),
            vec![
                PushSegment { stages: StageMask::VERTEX, offset: 0, size: 64 },
                PushSegment { stages: StageMask::FRAGMENT, offset: 64, size: 16 },
            ]
        );
        // Short blocks only touch the ranges they reach.
        assert_eq!(
            layout.push_segments(32),
            vec![PushSegment { stages: StageMask::VERTEX, offset: 0, size: 32 }]
        );
    }

    #[test]
    fn push_segments_split_nested_spans() {
        // Vertex sees [0, 64), fragment sees [0, 80): the shared prefix must
        // be pushed with both stages.
        let layout = derive_layout(&with_push(&[
            (StageMask::all(), 0, 64),
            (StageMask::FRAGMENT, 64, 16),
        ]));

        assert_eq!(
            layout.push_segments(80),
            vec![
                PushSegment { stages: StageMask::all(), offset: 0, size: 64 },
                PushSegment { stages: StageMask::FRAGMENT, offset: 64, size: 16 },
            ]
        );
    }

    #[test]
    fn set_bindings_are_sorted() {
        let ubo = VulkanDescriptorSetType::UniformBuffer { size_bytes: 16 };
        let mut resources = ResourceBindingBuilder::new(&DeviceLimits::default());
        resources
            .add_descriptor_binding(3, ubo, VulkanStage::Fragment)
            .unwrap()
            .add_descriptor_binding(1, ubo, VulkanStage::Vertex)
            .unwrap();
        let description =
            PipelineDescription::new(VertexInputDescription::default(), resources.finish());

        let layout = derive_layout(&description);
        let order: Vec<_> = layout.set_layouts[0].iter().map(|b| b.binding).collect();
        assert_eq!(order, vec![1, 3]);
    }

    #[test]
    fn native_stage_flags() {
        assert_eq!(stage_flags(StageMask::VERTEX), vk::ShaderStageFlags::VERTEX);
        assert_eq!(
            stage_flags(StageMask::all()),
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(
            descriptor_type(VulkanDescriptorSetType::UniformBuffer { size_bytes: 4 }),
            vk::DescriptorType::UNIFORM_BUFFER
        );
    }
}
