// Frame submitter
//
// One frame: acquire an image, wait until the GPU is done with that image's
// previous frame, let the caller update uniforms and push constants, record
// the image's command buffer, submit and present.
//
// Command buffers are re-recorded every frame from the current draw list, so
// changing draws never requires recreating anything.

use ash::vk;
use slotmap::SecondaryMap;

use super::pipeline::PipelineHandle;
use super::swapchain::color_subresource_range;
use super::{
    BufferHandle, BufferManager, BufferUsage, DerivedLayout, PipelineCompiler,
    PipelineResources, SwapchainManager, VulkanDevice,
};
use crate::description::VertexBinding;
use crate::error::{GraphicsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    U16,
    U32,
}

impl IndexType {
    fn native(self) -> vk::IndexType {
        match self {
            Self::U16 => vk::IndexType::UINT16,
            Self::U32 => vk::IndexType::UINT32,
        }
    }
}

/// One draw recorded into every frame until the draw list changes.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawCall {
    pub pipeline: PipelineHandle,
    /// One per vertex input binding, in the order the description declares
    /// them.
    pub vertex_buffers: Vec<BufferHandle>,
    pub index_buffer: Option<(BufferHandle, IndexType)>,
    /// Vertex count, or index count when an index buffer is set.
    pub count: u32,
    pub instance_count: u32,
    pub push_constants: Vec<u8>,
}

impl DrawCall {
    pub fn new(pipeline: PipelineHandle, count: u32) -> Self {
        Self {
            pipeline,
            vertex_buffers: Vec::new(),
            index_buffer: None,
            count,
            instance_count: 1,
            push_constants: Vec::new(),
        }
    }

    pub fn with_vertex_buffer(mut self, buffer: BufferHandle) -> Self {
        self.vertex_buffers.push(buffer);
        self
    }

    pub fn with_index_buffer(mut self, buffer: BufferHandle, index_type: IndexType) -> Self {
        self.index_buffer = Some((buffer, index_type));
        self
    }

    pub fn with_instances(mut self, instance_count: u32) -> Self {
        self.instance_count = instance_count;
        self
    }

    pub fn with_push_constants(mut self, bytes: &[u8]) -> Self {
        self.push_constants = bytes.to_vec();
        self
    }
}

/// Push-constant bytes must be whole words and fit the pipeline's ranges.
pub fn check_push_constants(layout: &DerivedLayout, len: usize) -> Result<()> {
    let size = layout.push_constant_size() as u64;
    if len % 4 != 0 || len as u64 > size {
        return Err(GraphicsError::SizeMismatch {
            offset: 0,
            len: len as u64,
            size,
        });
    }
    Ok(())
}

/// Binding index for each supplied vertex buffer. Every declared binding
/// needs exactly one buffer created with vertex usage.
pub fn vertex_binding_indices(
    declared: &[VertexBinding],
    supplied: &[BufferUsage],
) -> Result<Vec<u32>> {
    if declared.len() != supplied.len() {
        return Err(GraphicsError::VertexBufferCount {
            expected: declared.len(),
            supplied: supplied.len(),
        });
    }
    declared
        .iter()
        .zip(supplied)
        .map(|(binding, &usage)| {
            check_usage(usage, BufferUsage::Vertex)?;
            Ok(binding.binding_index)
        })
        .collect()
}

pub fn check_usage(found: BufferUsage, expected: BufferUsage) -> Result<()> {
    if found != expected {
        return Err(GraphicsError::BufferUsageMismatch { expected, found });
    }
    Ok(())
}

/// Descriptor sets to bind for `image`. A pipeline with set layouts must have
/// one allocated set per layout for every image.
pub fn descriptor_sets_to_bind(
    expected: usize,
    sets: Option<&[vk::DescriptorSet]>,
    image: u32,
) -> Result<&[vk::DescriptorSet]> {
    if expected == 0 {
        return Ok(&[]);
    }
    match sets {
        Some(sets) if sets.len() == expected => Ok(sets),
        _ => Err(GraphicsError::MissingPipelineResources(image)),
    }
}

/// What the per-frame update callback may touch. Everything here belongs to
/// the acquired image, whose previous frame has already completed.
pub struct FrameContext<'a> {
    image_index: u32,
    frame_number: u64,
    extent: vk::Extent2D,
    buffers: &'a mut BufferManager,
    resources: &'a SecondaryMap<PipelineHandle, PipelineResources>,
    draws: &'a mut [DrawCall],
}

impl<'a> FrameContext<'a> {
    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.extent.width as f32 / self.extent.height.max(1) as f32
    }

    /// Write this image's copy of the uniform at (`set`, `binding`).
    pub fn write_uniform(
        &mut self,
        pipeline: PipelineHandle,
        set: u32,
        binding: u32,
        bytes: &[u8],
    ) -> Result<()> {
        let buffer = self
            .resources
            .get(pipeline)
            .ok_or(GraphicsError::UnknownPipeline)?
            .uniform(self.image_index, set, binding)
            .ok_or(GraphicsError::InvalidState("no uniform buffer at that set and binding"))?;
        self.buffers.update_buffer(buffer, 0, bytes)
    }

    /// Replace the push constants of draw number `draw`.
    pub fn set_push_constants(&mut self, draw: usize, bytes: &[u8]) -> Result<()> {
        let draw = self
            .draws
            .get_mut(draw)
            .ok_or(GraphicsError::InvalidState("draw index out of range"))?;
        draw.push_constants.clear();
        draw.push_constants.extend_from_slice(bytes);
        Ok(())
    }

    pub fn draws(&self) -> &[DrawCall] {
        self.draws
    }

    pub fn buffers(&mut self) -> &mut BufferManager {
        self.buffers
    }
}

pub struct FrameSubmitter {
    clear_color: [f32; 4],
    acquire_timeout_ns: u64,
    draws: Vec<DrawCall>,
}

impl FrameSubmitter {
    pub fn new(clear_color: [f32; 4], acquire_timeout_ns: u64) -> Self {
        Self {
            clear_color,
            acquire_timeout_ns,
            draws: Vec::new(),
        }
    }

    pub fn set_draws(&mut self, draws: Vec<DrawCall>) {
        self.draws = draws;
    }

    pub fn draws(&self) -> &[DrawCall] {
        &self.draws
    }

    /// Drop every draw that uses `pipeline`.
    pub fn forget_pipeline(&mut self, pipeline: PipelineHandle) {
        self.draws.retain(|draw| draw.pipeline != pipeline);
    }

    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        self.clear_color = color;
    }

    /// Render and present one frame, returning the image index used.
    ///
    /// `SwapchainOutOfDate` and `Timeout` leave the swapchain in a state the
    /// caller recovers from; nothing has been submitted in either case.
    #[allow(clippy::too_many_arguments)]
    pub fn submit_frame<F>(
        &mut self,
        device: &VulkanDevice,
        swapchain: &mut SwapchainManager,
        pipelines: &PipelineCompiler,
        resources: &SecondaryMap<PipelineHandle, PipelineResources>,
        buffers: &mut BufferManager,
        update: F,
    ) -> Result<u32>
    where
        F: FnOnce(&mut FrameContext<'_>) -> Result<()>,
    {
        let acquired = swapchain.acquire_next_image(self.acquire_timeout_ns)?;
        swapchain.wait_for_image(acquired, self.acquire_timeout_ns)?;
        let image_index = acquired.index;

        let mut frame = FrameContext {
            image_index,
            frame_number: swapchain.frame_number(),
            extent: swapchain.extent(),
            buffers: &mut *buffers,
            resources,
            draws: &mut self.draws,
        };
        // The acquired image is submitted and presented even when the update or
        // a draw fails, so its semaphore is consumed and the image returned.
        let mut outcome = update(&mut frame);

        let cmd = swapchain.command_buffer(image_index);
        let with_draws = outcome.is_ok();
        let recorded = self.record(
            device, swapchain, pipelines, resources, buffers, image_index, cmd, with_draws,
        );
        match recorded {
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => outcome = outcome.and(Err(err)),
            Ok(()) => {}
        }

        let sync = swapchain.image_sync(image_index);
        let wait_semaphores = [acquired.wait_semaphore];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [cmd];
        let signal_semaphores = [sync.render_finished];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            device.device.reset_fences(&[sync.in_flight])?;
            device
                .device
                .queue_submit(device.graphics_queue, &[submit_info.build()], sync.in_flight)
                .map_err(GraphicsError::from_submission)?;
        }

        swapchain.present(device.graphics_queue, image_index)?;
        outcome.map(|()| image_index)
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        device: &VulkanDevice,
        swapchain: &SwapchainManager,
        pipelines: &PipelineCompiler,
        resources: &SecondaryMap<PipelineHandle, PipelineResources>,
        buffers: &BufferManager,
        image_index: u32,
        cmd: vk::CommandBuffer,
        with_draws: bool,
    ) -> Result<()> {
        let raw = &device.device;
        let image = swapchain.image(image_index);
        let extent = swapchain.extent();

        unsafe {
            raw.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            raw.begin_command_buffer(cmd, &begin_info)?;

            let to_attachment = vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(color_subresource_range())
                .build();
            raw.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_attachment],
            );

            let color_attachment = vk::RenderingAttachmentInfo::builder()
                .image_view(swapchain.image_view(image_index))
                .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: self.clear_color,
                    },
                })
                .build();
            let color_attachments = [color_attachment];
            let render_area = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            };
            let rendering_info = vk::RenderingInfo::builder()
                .render_area(render_area)
                .layer_count(1)
                .color_attachments(&color_attachments);
            raw.cmd_begin_rendering(cmd, &rendering_info);

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            raw.cmd_set_viewport(cmd, 0, &[viewport]);
            raw.cmd_set_scissor(cmd, 0, &[render_area]);

            let recorded = if with_draws {
                self.record_draws(raw, pipelines, resources, buffers, image_index, cmd)
            } else {
                Ok(())
            };

            raw.cmd_end_rendering(cmd);

            let to_present = vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
                .dst_access_mask(vk::AccessFlags::empty())
                .old_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(color_subresource_range())
                .build();
            raw.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_present],
            );

            raw.end_command_buffer(cmd)?;
            recorded
        }
    }

    fn record_draws(
        &self,
        raw: &ash::Device,
        pipelines: &PipelineCompiler,
        resources: &SecondaryMap<PipelineHandle, PipelineResources>,
        buffers: &BufferManager,
        image_index: u32,
        cmd: vk::CommandBuffer,
    ) -> Result<()> {
        for draw in &self.draws {
            let pipeline = pipelines
                .get(draw.pipeline)
                .ok_or(GraphicsError::UnknownPipeline)?;
            check_push_constants(&pipeline.derived, draw.push_constants.len())?;

            let sets = descriptor_sets_to_bind(
                pipeline.set_layouts.len(),
                resources.get(draw.pipeline).map(|r| r.sets(image_index)),
                image_index,
            )?;

            let vertex_buffers = draw
                .vertex_buffers
                .iter()
                .map(|&handle| buffers.get(handle).ok_or(GraphicsError::UnknownBuffer))
                .collect::<Result<Vec<_>>>()?;
            let usages: Vec<_> = vertex_buffers.iter().map(|b| b.usage).collect();
            let slots =
                vertex_binding_indices(&pipeline.description.vertex_input.bindings, &usages)?;

            let index_buffer = match draw.index_buffer {
                Some((handle, index_type)) => {
                    let buffer = buffers.get(handle).ok_or(GraphicsError::UnknownBuffer)?;
                    check_usage(buffer.usage, BufferUsage::Index)?;
                    Some((buffer.handle, index_type))
                }
                None => None,
            };

            unsafe {
                raw.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.pipeline);

                if !sets.is_empty() {
                    raw.cmd_bind_descriptor_sets(
                        cmd,
                        vk::PipelineBindPoint::GRAPHICS,
                        pipeline.layout,
                        0,
                        sets,
                        &[],
                    );
                }

                for (&binding, buffer) in slots.iter().zip(&vertex_buffers) {
                    raw.cmd_bind_vertex_buffers(cmd, binding, &[buffer.handle], &[0]);
                }

                let bytes = draw.push_constants.as_slice();
                for segment in pipeline.derived.push_segments(bytes.len() as u32) {
                    let start = segment.offset as usize;
                    let end = start + segment.size as usize;
                    raw.cmd_push_constants(
                        cmd,
                        pipeline.layout,
                        super::pipeline::stage_flags(segment.stages),
                        segment.offset,
                        &bytes[start..end],
                    );
                }

                match index_buffer {
                    Some((buffer, index_type)) => {
                        raw.cmd_bind_index_buffer(cmd, buffer, 0, index_type.native());
                        raw.cmd_draw_indexed(cmd, draw.count, draw.instance_count, 0, 0, 0);
                    }
                    None => raw.cmd_draw(cmd, draw.count, draw.instance_count, 0, 0),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::pipeline::DerivedPushRange;
    use crate::description::{StageMask, VertexRate};
    use slotmap::KeyData;

    fn binding(binding_index: u32) -> VertexBinding {
        VertexBinding {
            binding_index,
            stride_bytes: 16,
            rate: VertexRate::PerVertex,
        }
    }

    fn layout(ranges: &[(StageMask, u32, u32)]) -> DerivedLayout {
        DerivedLayout {
            set_layouts: Vec::new(),
            push_constant_ranges: ranges
                .iter()
                .map(|&(stages, offset, size)| DerivedPushRange { stages, offset, size })
                .collect(),
        }
    }

    #[test]
    fn push_constants_must_fit_the_layout() {
        let layout = layout(&[(StageMask::VERTEX, 0, 64), (StageMask::FRAGMENT, 64, 16)]);
        assert!(check_push_constants(&layout, 80).is_ok());
        assert!(check_push_constants(&layout, 0).is_ok());
        assert!(matches!(
            check_push_constants(&layout, 84),
            Err(GraphicsError::SizeMismatch { len: 84, size: 80, .. })
        ));
    }

    #[test]
    fn push_constants_are_whole_words() {
        let layout = layout(&[(StageMask::VERTEX, 0, 16)]);
        assert!(check_push_constants(&layout, 6).is_err());
    }

    #[test]
    fn pipeline_without_push_constants_takes_none() {
        let layout = layout(&[]);
        assert!(check_push_constants(&layout, 0).is_ok());
        assert!(check_push_constants(&layout, 4).is_err());
    }

    #[test]
    fn draw_call_builder() {
        let pipeline = PipelineHandle::from(KeyData::from_ffi(1));
        let vertices = BufferHandle::from(KeyData::from_ffi(2));
        let indices = BufferHandle::from(KeyData::from_ffi(3));

        let draw = DrawCall::new(pipeline, 6)
            .with_vertex_buffer(vertices)
            .with_index_buffer(indices, IndexType::U16)
            .with_instances(2)
            .with_push_constants(&[0; 16]);

        assert_eq!(draw.vertex_buffers, vec![vertices]);
        assert_eq!(draw.index_buffer, Some((indices, IndexType::U16)));
        assert_eq!(draw.instance_count, 2);
        assert_eq!(draw.push_constants.len(), 16);
        assert_eq!(DrawCall::new(pipeline, 3).instance_count, 1);
    }

    #[test]
    fn vertex_buffers_follow_declared_binding_indices() {
        let declared = [binding(2), binding(0)];
        let slots =
            vertex_binding_indices(&declared, &[BufferUsage::Vertex, BufferUsage::Vertex]).unwrap();
        assert_eq!(slots, vec![2, 0]);
        assert!(vertex_binding_indices(&[], &[]).unwrap().is_empty());
    }

    #[test]
    fn vertex_buffer_count_must_match_bindings() {
        let declared = [binding(0), binding(1)];
        assert!(matches!(
            vertex_binding_indices(&declared, &[BufferUsage::Vertex]),
            Err(GraphicsError::VertexBufferCount { expected: 2, supplied: 1 })
        ));
        assert!(matches!(
            vertex_binding_indices(&[], &[BufferUsage::Vertex]),
            Err(GraphicsError::VertexBufferCount { expected: 0, supplied: 1 })
        ));
    }

    #[test]
    fn draw_buffers_need_matching_usage() {
        assert!(matches!(
            vertex_binding_indices(&[binding(0)], &[BufferUsage::Uniform]),
            Err(GraphicsError::BufferUsageMismatch {
                expected: BufferUsage::Vertex,
                found: BufferUsage::Uniform,
            })
        ));
        assert!(check_usage(BufferUsage::Index, BufferUsage::Index).is_ok());
        assert!(matches!(
            check_usage(BufferUsage::Vertex, BufferUsage::Index),
            Err(GraphicsError::BufferUsageMismatch { .. })
        ));
    }

    #[test]
    fn pipeline_with_sets_needs_resources_for_the_image() {
        let sets = [vk::DescriptorSet::null(); 2];
        assert_eq!(descriptor_sets_to_bind(2, Some(&sets[..]), 0).unwrap().len(), 2);
        assert!(descriptor_sets_to_bind(0, None, 1).unwrap().is_empty());
        assert!(matches!(
            descriptor_sets_to_bind(2, None, 3),
            Err(GraphicsError::MissingPipelineResources(3))
        ));
        assert!(matches!(
            descriptor_sets_to_bind(2, Some(&sets[..0]), 4),
            Err(GraphicsError::MissingPipelineResources(4))
        ));
    }
}
