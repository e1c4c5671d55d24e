// Per-image descriptor sets and uniform buffers of a pipeline
//
// Every uniform-buffer binding gets one buffer per swapchain image so the CPU
// can write image K's uniforms while the GPU still reads image K-1's.

use ash::vk;

use super::{BufferHandle, BufferManager, FrameSlots, VulkanDevice, VulkanPipeline};
use crate::description::VulkanDescriptorSetType;
use crate::error::Result;

/// A uniform buffer backing one (set, binding) for one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformSlot {
    pub set: u32,
    pub binding: u32,
    pub size_bytes: u32,
    pub buffer: BufferHandle,
}

/// How much of each per-image resource a pipeline needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceCounts {
    pub image_slots: usize,
    pub descriptor_sets: usize,
    pub uniform_buffers: usize,
    /// Pool capacity for uniform-buffer descriptors, never zero.
    pub uniform_descriptors: usize,
}

pub fn resource_counts(
    set_count: usize,
    uniform_bindings: usize,
    image_count: usize,
) -> ResourceCounts {
    ResourceCounts {
        image_slots: image_count,
        descriptor_sets: set_count * image_count,
        uniform_buffers: uniform_bindings * image_count,
        uniform_descriptors: uniform_bindings.max(1) * image_count,
    }
}

pub struct PipelineResources {
    pool: vk::DescriptorPool,
    /// Per image, one descriptor set per set of the description.
    sets: FrameSlots<Vec<vk::DescriptorSet>>,
    uniforms: FrameSlots<Vec<UniformSlot>>,
}

impl PipelineResources {
    pub fn new(
        device: &VulkanDevice,
        buffers: &mut BufferManager,
        pipeline: &VulkanPipeline,
        image_count: usize,
    ) -> Result<Self> {
        let mut resources = Self {
            pool: vk::DescriptorPool::null(),
            sets: FrameSlots::default(),
            uniforms: FrameSlots::default(),
        };

        if let Err(err) = resources.populate(device, buffers, pipeline, image_count) {
            resources.destroy(device, buffers);
            return Err(err);
        }
        Ok(resources)
    }

    fn populate(
        &mut self,
        device: &VulkanDevice,
        buffers: &mut BufferManager,
        pipeline: &VulkanPipeline,
        image_count: usize,
    ) -> Result<()> {
        if pipeline.set_layouts.is_empty() {
            self.sets = FrameSlots::new(image_count, |_| Vec::new());
            self.uniforms = FrameSlots::new(image_count, |_| Vec::new());
            return Ok(());
        }

        let counts = resource_counts(
            pipeline.set_layouts.len(),
            pipeline.description.uniform_buffer_count(),
            image_count,
        );
        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: counts.uniform_descriptors as u32,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(counts.descriptor_sets as u32)
            .pool_sizes(&pool_sizes);
        self.pool = unsafe { device.device.create_descriptor_pool(&pool_info, None) }?;

        let mut sets = Vec::with_capacity(counts.image_slots);
        let mut uniforms = Vec::with_capacity(counts.image_slots);
        let mut outcome = Ok(());

        for _ in 0..counts.image_slots {
            let mut image_uniforms = Vec::new();
            let step = self.allocate_image(device, buffers, pipeline, &mut image_uniforms);
            uniforms.push(image_uniforms);
            match step {
                Ok(image_sets) => sets.push(image_sets),
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }

        // Recorded even on failure so destroy() releases what was created.
        self.sets = FrameSlots::from(sets);
        self.uniforms = FrameSlots::from(uniforms);
        outcome
    }

    fn allocate_image(
        &self,
        device: &VulkanDevice,
        buffers: &mut BufferManager,
        pipeline: &VulkanPipeline,
        image_uniforms: &mut Vec<UniformSlot>,
    ) -> Result<Vec<vk::DescriptorSet>> {
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(&pipeline.set_layouts);
        let image_sets = unsafe { device.device.allocate_descriptor_sets(&alloc_info) }?;

        for (set_index, set) in pipeline.description.descriptor_sets.iter().enumerate() {
            for binding in &set.bindings {
                let VulkanDescriptorSetType::UniformBuffer { size_bytes } = binding.kind;
                let buffer = buffers.create_uniform_buffer(size_bytes as u64)?;
                image_uniforms.push(UniformSlot {
                    set: set_index as u32,
                    binding: binding.binding_index,
                    size_bytes,
                    buffer,
                });

                let buffer_info = [vk::DescriptorBufferInfo {
                    buffer: buffers.raw(buffer)?,
                    offset: 0,
                    range: size_bytes as u64,
                }];
                let write = vk::WriteDescriptorSet::builder()
                    .dst_set(image_sets[set_index])
                    .dst_binding(binding.binding_index)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(&buffer_info)
                    .build();
                unsafe { device.device.update_descriptor_sets(&[write], &[]) };
            }
        }

        Ok(image_sets)
    }

    /// Descriptor sets to bind when rendering to `image`, in set order.
    pub fn sets(&self, image: u32) -> &[vk::DescriptorSet] {
        self.sets.get(image as usize).map_or(&[], Vec::as_slice)
    }

    /// Uniform buffer behind (`set`, `binding`) for `image`.
    pub fn uniform(&self, image: u32, set: u32, binding: u32) -> Option<BufferHandle> {
        self.uniforms
            .get(image as usize)?
            .iter()
            .find(|slot| slot.set == set && slot.binding == binding)
            .map(|slot| slot.buffer)
    }

    pub fn image_count(&self) -> usize {
        self.sets.len()
    }

    /// Release the uniform buffers and the pool (which frees the sets).
    pub fn destroy(&mut self, device: &VulkanDevice, buffers: &mut BufferManager) {
        for image_uniforms in self.uniforms.take_all() {
            for slot in image_uniforms.into_iter().rev() {
                let _ = buffers.delete_buffer(slot.buffer);
            }
        }
        self.sets.take_all().for_each(drop);
        if self.pool != vk::DescriptorPool::null() {
            unsafe { device.device.destroy_descriptor_pool(self.pool, None) };
            self.pool = vk::DescriptorPool::null();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_image_resources_follow_the_image_count() {
        let before = resource_counts(2, 3, 4);
        assert_eq!(before.image_slots, 4);
        assert_eq!(before.descriptor_sets, 8);
        assert_eq!(before.uniform_buffers, 12);
        assert_eq!(before.uniform_descriptors, 12);

        let after = resource_counts(2, 3, 5);
        assert_eq!(after.image_slots, 5);
        assert_eq!(after.descriptor_sets, 10);
        assert_eq!(after.uniform_buffers, 15);
        assert_eq!(after.uniform_descriptors, 15);
    }

    #[test]
    fn pool_keeps_room_for_one_uniform_per_image() {
        let counts = resource_counts(1, 0, 5);
        assert_eq!(counts.uniform_buffers, 0);
        assert_eq!(counts.uniform_descriptors, 5);
        assert_eq!(counts.descriptor_sets, 5);
    }
}
