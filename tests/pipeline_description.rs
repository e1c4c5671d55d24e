// Description building, validation, printing and layout derivation through
// the public API. None of this needs a device.

use vk_pipeline::backend::{derive_layout, DerivedPushRange};
use vk_pipeline::{
    print_pipeline_description, DeviceLimits, PipelineDescription, ResourceBindingBuilder,
    StageMask, ValidationError, VertexFormat, VertexLayoutBuilder, VertexRate,
    VulkanDescriptorSetType, VulkanStage,
};

fn textured_quad() -> PipelineDescription {
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
fn printed_description_matches_golden_output() {
    let expected = "\
pipeline
  shader stages:
    vertex entry=main
    fragment entry=main
  vertex bindings:
    binding 0: stride=20 rate=per-vertex
  vertex attributes:
    location 0: binding=0 format=float32x2 offset=0
    location 1: binding=0 format=float32x3 offset=8
  push constants:
    [0, 64) stages=vertex
  descriptor sets:
    set 0:
      binding 0: uniform-buffer size=16 stages=fragment
  fixed function: topology=triangle-list polygon=fill cull=back front-face=clockwise blend=opaque
";
    assert_eq!(print_pipeline_description(&textured_quad()), expected);
}

#[test]
fn builder_output_validates() {
    assert_eq!(textured_quad().validate(&DeviceLimits::default()), Ok(()));
}

#[test]
fn attributes_exactly_cover_the_stride() {
    let mut vertex = VertexLayoutBuilder::new();
    vertex.add_vertex_binding(0, 36, VertexRate::PerVertex).unwrap();
    let offsets: Vec<u32> = [
        VertexFormat::Float32x3,
        VertexFormat::Float32x3,
        VertexFormat::Float32x2,
        VertexFormat::Unorm8x4,
    ]
    .into_iter()
    .enumerate()
    .map(|(location, format)| vertex.add_vertex_attribute(location as u32, 0, format).unwrap())
    .collect();

    assert_eq!(offsets, vec![0, 12, 24, 32]);
    let last = vertex.description().attributes.last().unwrap();
    assert_eq!(last.end_bytes(), 36);
}

#[test]
fn unknown_binding_leaves_builder_untouched() {
    let mut vertex = VertexLayoutBuilder::new();
    vertex.add_vertex_binding(0, 12, VertexRate::PerVertex).unwrap();
    let before = vertex.description().clone();

    assert_eq!(
        vertex.add_vertex_attribute(0, 3, VertexFormat::Float32x3),
        Err(ValidationError::InvalidBinding { location: 0, binding: 3 })
    );
    assert_eq!(vertex.description(), &before);
}

#[test]
fn push_constants_pack_until_the_limit() {
    let mut resources = ResourceBindingBuilder::new(&DeviceLimits::default());
    let first = resources.add_push_constant(VulkanStage::Vertex, 16).unwrap();
    let second = resources.add_push_constant(VulkanStage::Vertex, 16).unwrap();
    assert_eq!((first.offset_bytes, first.end_bytes()), (0, 16));
    assert_eq!((second.offset_bytes, second.end_bytes()), (16, 32));

    let before = resources.bindings().clone();
    assert_eq!(
        resources.add_push_constant(VulkanStage::Vertex, 100),
        Err(ValidationError::PushConstantOverflow { end: 132, limit: 128 })
    );
    assert_eq!(resources.bindings(), &before);
}

#[test]
fn toml_description_with_stride_overflow_fails_validation() {
    let text = r#"
        [[shader_stages]]
        stage = "vertex"

        [[vertex_input.bindings]]
        binding_index = 0
        stride_bytes = 12
        rate = "per_vertex"

        [[vertex_input.attributes]]
        location = 0
        binding = 0
        format = "float32x3"
        offset_bytes = 0

        [[vertex_input.attributes]]
        location = 1
        binding = 0
        format = "float32x2"
        offset_bytes = 12
    "#;

    let description = PipelineDescription::from_toml_str(text).unwrap();
    assert_eq!(
        description.validate(&DeviceLimits::default()),
        Err(ValidationError::StrideOverflow {
            location: 1,
            binding: 0,
            format: VertexFormat::Float32x2,
            end: 20,
            stride: 12,
        })
    );
}

#[test]
fn serialized_description_reloads_and_validates() {
    let description = textured_quad();
    let text = description.to_toml_string().unwrap();
    let reloaded = PipelineDescription::from_toml_str(&text).unwrap();

    assert_eq!(reloaded, description);
    assert_eq!(reloaded.validate(&DeviceLimits::default()), Ok(()));
    assert_eq!(
        print_pipeline_description(&reloaded),
        print_pipeline_description(&description)
    );
}

#[test]
fn identical_descriptions_derive_identical_layouts() {
    let first = derive_layout(&textured_quad());
    let second = derive_layout(&textured_quad());
    assert_eq!(first, second);

    assert_eq!(
        first.push_constant_ranges,
        vec![DerivedPushRange {
            stages: StageMask::VERTEX,
            offset: 0,
            size: 64,
        }]
    );
    assert_eq!(first.set_layouts.len(), 1);
    assert_eq!(first.set_layouts[0][0].stages, StageMask::FRAGMENT);
}

#[test]
fn stage_order_does_not_change_the_layout() {
    let mut reordered = textured_quad();
    reordered.shader_stages.reverse();
    assert_eq!(derive_layout(&reordered), derive_layout(&textured_quad()));
}

#[test]
fn shared_push_range_is_pushed_with_both_stages() {
    let mut resources = ResourceBindingBuilder::new(&DeviceLimits::default());
    resources
        .add_push_constant(StageMask::VERTEX | StageMask::FRAGMENT, 16)
        .unwrap();
    resources.add_push_constant(VulkanStage::Fragment, 16).unwrap();

    let mut vertex = VertexLayoutBuilder::new();
    vertex.add_vertex_binding(0, 8, VertexRate::PerVertex).unwrap();
    vertex.add_vertex_attribute(0, 0, VertexFormat::Float32x2).unwrap();

    let description = PipelineDescription::new(vertex.finish(), resources.finish())
        .with_stage(VulkanStage::Vertex)
        .with_stage(VulkanStage::Fragment);
    assert_eq!(description.validate(&DeviceLimits::default()), Ok(()));

    let segments = derive_layout(&description).push_segments(32);
    let shape: Vec<_> = segments.iter().map(|s| (s.stages, s.offset, s.size)).collect();
    assert_eq!(
        shape,
        vec![
            (StageMask::VERTEX | StageMask::FRAGMENT, 0, 16),
            (StageMask::FRAGMENT, 16, 16),
        ]
    );
}
