// Description consistency checks run before any device object is created.

use std::collections::HashSet;

use super::{
    DeviceLimits, PipelineDescription, PolygonMode, StageMask, VulkanDescriptorSetType,
    VulkanStage,
};
use crate::error::ValidationError;

impl PipelineDescription {
    /// Check the description is internally consistent and fits `limits`.
    ///
    /// Reports the first problem found, in this order: shader stages, vertex
    /// input, push constants, descriptor sets, fixed-function state.
    pub fn validate(&self, limits: &DeviceLimits) -> Result<(), ValidationError> {
        self.validate_stages()?;
        self.validate_vertex_input(limits)?;
        self.validate_push_constants(limits)?;
        self.validate_descriptor_sets(limits)?;
        self.validate_fixed_function(limits)
    }

    fn validate_fixed_function(&self, limits: &DeviceLimits) -> Result<(), ValidationError> {
        if self.fixed_function.polygon_mode == PolygonMode::Line && !limits.fill_mode_non_solid {
            return Err(ValidationError::UnsupportedPolygonMode(PolygonMode::Line));
        }
        Ok(())
    }

    fn validate_stages(&self) -> Result<(), ValidationError> {
        let mut seen = HashSet::new();
        for desc in &self.shader_stages {
            if !seen.insert(desc.stage) {
                return Err(ValidationError::DuplicateShaderStage(desc.stage));
            }
        }
        if !seen.contains(&VulkanStage::Vertex) {
            return Err(ValidationError::MissingVertexStage);
        }
        Ok(())
    }

    fn validate_vertex_input(&self, limits: &DeviceLimits) -> Result<(), ValidationError> {
        let input = &self.vertex_input;

        let binding_count = input.bindings.len() as u32;
        if binding_count > limits.max_vertex_input_bindings {
            return Err(ValidationError::TooManyVertexBindings {
                count: binding_count,
                limit: limits.max_vertex_input_bindings,
            });
        }

        let mut binding_indices = HashSet::new();
        for binding in &input.bindings {
            if !binding_indices.insert(binding.binding_index) {
                return Err(ValidationError::DuplicateVertexBinding(binding.binding_index));
            }
            if binding.stride_bytes > limits.max_vertex_input_binding_stride {
                return Err(ValidationError::StrideTooLarge {
                    binding: binding.binding_index,
                    stride: binding.stride_bytes,
                    limit: limits.max_vertex_input_binding_stride,
                });
            }
        }

        let attribute_count = input.attributes.len() as u32;
        if attribute_count > limits.max_vertex_input_attributes {
            return Err(ValidationError::TooManyVertexAttributes {
                count: attribute_count,
                limit: limits.max_vertex_input_attributes,
            });
        }

        let mut locations = HashSet::new();
        for attribute in &input.attributes {
            let binding = input.binding(attribute.binding).ok_or(ValidationError::InvalidBinding {
                location: attribute.location,
                binding: attribute.binding,
            })?;
            if !locations.insert(attribute.location) {
                return Err(ValidationError::DuplicateLocation(attribute.location));
            }
            if attribute.end_bytes() > binding.stride_bytes {
                return Err(ValidationError::StrideOverflow {
                    location: attribute.location,
                    binding: attribute.binding,
                    format: attribute.format,
                    end: attribute.end_bytes(),
                    stride: binding.stride_bytes,
                });
            }
        }

        Ok(())
    }

    fn validate_push_constants(&self, limits: &DeviceLimits) -> Result<(), ValidationError> {
        for range in &self.push_constants {
            if range.stage.is_empty() {
                return Err(ValidationError::EmptyStageMask);
            }
            if range.size_bytes == 0 || range.size_bytes % 4 != 0 || range.offset_bytes % 4 != 0 {
                return Err(ValidationError::MisalignedPushConstant {
                    offset: range.offset_bytes,
                    size: range.size_bytes,
                });
            }
            let end = range.offset_bytes as u64 + range.size_bytes as u64;
            if end > limits.max_push_constants_size as u64 {
                return Err(ValidationError::PushConstantOverflow {
                    end: u32::try_from(end).unwrap_or(u32::MAX),
                    limit: limits.max_push_constants_size,
                });
            }
        }

        for stage in VulkanStage::ALL {
            let visible: Vec<_> = self
                .push_constants
                .iter()
                .filter(|range| range.stage.contains(StageMask::from(stage)))
                .collect();
            for (i, first) in visible.iter().enumerate() {
                if let Some(second) = visible[i + 1..].iter().find(|other| first.overlaps(other)) {
                    return Err(ValidationError::PushConstantOverlap {
                        stage,
                        first_offset: first.offset_bytes,
                        first_end: first.end_bytes(),
                        second_offset: second.offset_bytes,
                        second_end: second.end_bytes(),
                    });
                }
            }
        }

        Ok(())
    }

    fn validate_descriptor_sets(&self, limits: &DeviceLimits) -> Result<(), ValidationError> {
        let set_count = self.descriptor_sets.len() as u32;
        if set_count > limits.max_bound_descriptor_sets {
            return Err(ValidationError::TooManyDescriptorSets {
                count: set_count,
                limit: limits.max_bound_descriptor_sets,
            });
        }

        for (set_index, set) in self.descriptor_sets.iter().enumerate() {
            let set_index = set_index as u32;
            let mut indices = HashSet::new();
            for binding in &set.bindings {
                if !indices.insert(binding.binding_index) {
                    return Err(ValidationError::DuplicateBinding {
                        set: set_index,
                        binding: binding.binding_index,
                    });
                }
                if binding.stage.is_empty() {
                    return Err(ValidationError::EmptyStageMask);
                }
                match binding.kind {
                    VulkanDescriptorSetType::UniformBuffer { size_bytes: 0 } => {
                        return Err(ValidationError::EmptyUniformBuffer {
                            set: set_index,
                            binding: binding.binding_index,
                        });
                    }
                    VulkanDescriptorSetType::UniformBuffer { size_bytes }
                        if size_bytes > limits.max_uniform_buffer_range =>
                    {
                        return Err(ValidationError::UniformBufferTooLarge {
                            set: set_index,
                            binding: binding.binding_index,
                            size: size_bytes,
                            limit: limits.max_uniform_buffer_range,
                        });
                    }
                    VulkanDescriptorSetType::UniformBuffer { .. } => {}
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::description::*;
    use crate::error::ValidationError;

    fn with_stages(description: PipelineDescription) -> PipelineDescription {
        description
            .with_stage(VulkanStage::Vertex)
            .with_stage(VulkanStage::Fragment)
    }

    #[test]
    fn line_polygon_mode_needs_the_device_feature() {
        let mut vertex = VertexLayoutBuilder::new();
        vertex.add_vertex_binding(0, 12, VertexRate::PerVertex).unwrap();
        vertex.add_vertex_attribute(0, 0, VertexFormat::Float32x3).unwrap();
        let resources = ResourceBindingBuilder::new(&DeviceLimits::default());
        let wireframe = with_stages(PipelineDescription::new(vertex.finish(), resources.finish()))
            .with_fixed_function(FixedFunctionState {
                polygon_mode: PolygonMode::Line,
                ..FixedFunctionState::default()
            });

        assert_eq!(
            wireframe.validate(&DeviceLimits::default()),
            Err(ValidationError::UnsupportedPolygonMode(PolygonMode::Line))
        );
        assert_eq!(
            wireframe.validate(&DeviceLimits::default().with_fill_mode_non_solid(true)),
            Ok(())
        );
    }

    #[test]
    fn attribute_past_stride_fails_at_validation() {
        let mut vertex = VertexLayoutBuilder::new();
        vertex.add_vertex_binding(0, 12, VertexRate::PerVertex).unwrap();
        assert_eq!(vertex.add_vertex_attribute(0, 0, VertexFormat::Float32x3).unwrap(), 0);
        // The builder accepts it; the compiler must not.
        assert_eq!(vertex.add_vertex_attribute(1, 0, VertexFormat::Float32x2).unwrap(), 12);

        let description = with_stages(PipelineDescription::new(
            vertex.finish(),
            ResourceBindings::default(),
        ));

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
    fn attribute_with_unknown_binding_fails() {
        let mut description = with_stages(PipelineDescription::default());
        description.vertex_input.attributes.push(VertexInputEntry {
            location: 0,
            binding: 2,
            format: VertexFormat::Float32,
            offset_bytes: 0,
        });
        assert_eq!(
            description.validate(&DeviceLimits::default()),
            Err(ValidationError::InvalidBinding { location: 0, binding: 2 })
        );
    }

    #[test]
    fn overlapping_push_constants_for_one_stage_fail() {
        let mut resources = ResourceBindingBuilder::new(&DeviceLimits::default());
        resources.add_push_constant_range(VulkanStage::Vertex, 0, 32).unwrap();
        resources.add_push_constant_range(StageMask::all(), 16, 16).unwrap();

        let description = with_stages(PipelineDescription::new(
            VertexInputDescription::default(),
            resources.finish(),
        ));

        assert_eq!(
            description.validate(&DeviceLimits::default()),
            Err(ValidationError::PushConstantOverlap {
                stage: VulkanStage::Vertex,
                first_offset: 0,
                first_end: 32,
                second_offset: 16,
                second_end: 32,
            })
        );
    }

    #[test]
    fn same_offsets_on_different_stages_are_fine() {
        let mut resources = ResourceBindingBuilder::new(&DeviceLimits::default());
        resources.add_push_constant(VulkanStage::Vertex, 64).unwrap();
        resources.add_push_constant(VulkanStage::Fragment, 64).unwrap();

        let description = with_stages(PipelineDescription::new(
            VertexInputDescription::default(),
            resources.finish(),
        ));
        assert_eq!(description.validate(&DeviceLimits::default()), Ok(()));
    }

    #[test]
    fn sparse_descriptor_bindings_are_accepted() {
        let ubo = VulkanDescriptorSetType::UniformBuffer { size_bytes: 64 };
        let mut resources = ResourceBindingBuilder::new(&DeviceLimits::default());
        resources
            .add_descriptor_binding(0, ubo, VulkanStage::Vertex)
            .unwrap()
            .add_descriptor_binding(5, ubo, VulkanStage::Fragment)
            .unwrap();

        let description = with_stages(PipelineDescription::new(
            VertexInputDescription::default(),
            resources.finish(),
        ));
        assert_eq!(description.validate(&DeviceLimits::default()), Ok(()));
    }

    #[test]
    fn oversized_uniform_buffer_fails() {
        let ubo = VulkanDescriptorSetType::UniformBuffer { size_bytes: 1 << 20 };
        let mut resources = ResourceBindingBuilder::new(&DeviceLimits::default());
        resources.add_descriptor_binding(0, ubo, VulkanStage::Vertex).unwrap();

        let description = with_stages(PipelineDescription::new(
            VertexInputDescription::default(),
            resources.finish(),
        ));
        assert!(matches!(
            description.validate(&DeviceLimits::default()),
            Err(ValidationError::UniformBufferTooLarge { .. })
        ));
    }

    #[test]
    fn vertex_stage_is_required() {
        let description = PipelineDescription::default().with_stage(VulkanStage::Fragment);
        assert_eq!(
            description.validate(&DeviceLimits::default()),
            Err(ValidationError::MissingVertexStage)
        );

        let doubled = PipelineDescription::default()
            .with_stage(VulkanStage::Vertex)
            .with_stage(VulkanStage::Vertex);
        assert_eq!(
            doubled.validate(&DeviceLimits::default()),
            Err(ValidationError::DuplicateShaderStage(VulkanStage::Vertex))
        );
    }

    #[test]
    fn too_many_descriptor_sets_fail() {
        let ubo = VulkanDescriptorSetType::UniformBuffer { size_bytes: 16 };
        let mut resources = ResourceBindingBuilder::new(&DeviceLimits::default());
        for _ in 0..5 {
            resources.next_descriptor_set();
            resources.add_descriptor_binding(0, ubo, VulkanStage::Vertex).unwrap();
        }
        let description = with_stages(PipelineDescription::new(
            VertexInputDescription::default(),
            resources.finish(),
        ));
        assert_eq!(
            description.validate(&DeviceLimits::default()),
            Err(ValidationError::TooManyDescriptorSets { count: 5, limit: 4 })
        );
    }
}
