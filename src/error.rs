// Error taxonomy
//
// ValidationError covers malformed descriptions (recoverable, fix the input).
// GraphicsError wraps it together with device-level failures.

use ash::vk;
use thiserror::Error;

use crate::backend::BufferUsage;
use crate::description::{PolygonMode, VertexFormat, VulkanStage};

/// A description is internally inconsistent or exceeds a device limit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("attribute at location {location} references unknown vertex binding {binding}")]
    InvalidBinding { location: u32, binding: u32 },

    #[error("vertex attribute location {0} is used more than once")]
    DuplicateLocation(u32),

    #[error("vertex binding {0} is declared more than once")]
    DuplicateVertexBinding(u32),

    #[error(
        "attribute at location {location} ({format}) ends at byte {end}, \
         past the {stride}-byte stride of binding {binding}"
    )]
    StrideOverflow {
        location: u32,
        binding: u32,
        format: VertexFormat,
        end: u32,
        stride: u32,
    },

    #[error("push constant range ending at byte {end} exceeds the device limit of {limit} bytes")]
    PushConstantOverflow { end: u32, limit: u32 },

    #[error("push constant ranges [{first_offset}, {first_end}) and [{second_offset}, {second_end}) overlap for the {stage} stage")]
    PushConstantOverlap {
        stage: VulkanStage,
        first_offset: u32,
        first_end: u32,
        second_offset: u32,
        second_end: u32,
    },

    #[error("push constant range at offset {offset} has zero size or is not 4-byte aligned ({size} bytes)")]
    MisalignedPushConstant { offset: u32, size: u32 },

    #[error("resource is visible to no shader stage")]
    EmptyStageMask,

    #[error("descriptor binding {binding} is declared more than once in set {set}")]
    DuplicateBinding { set: u32, binding: u32 },

    #[error("uniform buffer at set {set} binding {binding} has zero size")]
    EmptyUniformBuffer { set: u32, binding: u32 },

    #[error("uniform buffer at set {set} binding {binding} is {size} bytes, device range limit is {limit}")]
    UniformBufferTooLarge {
        set: u32,
        binding: u32,
        size: u32,
        limit: u32,
    },

    #[error("{count} vertex bindings declared, device supports {limit}")]
    TooManyVertexBindings { count: u32, limit: u32 },

    #[error("{count} vertex attributes declared, device supports {limit}")]
    TooManyVertexAttributes { count: u32, limit: u32 },

    #[error("binding {binding} has a {stride}-byte stride, device supports {limit}")]
    StrideTooLarge { binding: u32, stride: u32, limit: u32 },

    #[error("{count} descriptor sets declared, device supports {limit}")]
    TooManyDescriptorSets { count: u32, limit: u32 },

    #[error("no shader module supplied for the {0} stage")]
    MissingShaderStage(VulkanStage),

    #[error("a graphics pipeline needs a vertex stage")]
    MissingVertexStage,

    #[error("the {0} stage is declared more than once")]
    DuplicateShaderStage(VulkanStage),

    #[error("polygon mode {0:?} needs the fillModeNonSolid device feature")]
    UnsupportedPolygonMode(PolygonMode),
}

/// Everything the pipeline layer can report to the host application.
#[derive(Debug, Error)]
pub enum GraphicsError {
    #[error("invalid pipeline description: {0}")]
    Validation(#[from] ValidationError),

    #[error("device rejected pipeline state: {0}")]
    DeviceCompile(vk::Result),

    #[error("out of device memory")]
    OutOfDeviceMemory,

    #[error("device lost")]
    DeviceLost,

    #[error("swapchain is out of date")]
    SwapchainOutOfDate,

    #[error("timed out waiting for the swapchain")]
    Timeout,

    #[error("write of {len} bytes at offset {offset} exceeds {size}-byte buffer")]
    SizeMismatch { offset: u64, len: u64, size: u64 },

    #[error("buffer handle is not live")]
    UnknownBuffer,

    #[error("draw supplies {supplied} vertex buffers, pipeline declares {expected} bindings")]
    VertexBufferCount { expected: usize, supplied: usize },

    #[error("expected a {expected:?} buffer, got a {found:?} buffer")]
    BufferUsageMismatch {
        expected: BufferUsage,
        found: BufferUsage,
    },

    #[error("pipeline has no descriptor sets for image {0}")]
    MissingPipelineResources(u32),

    #[error("pipeline handle is not live")]
    UnknownPipeline,

    #[error("invalid operation: {0}")]
    InvalidState(&'static str),

    #[error("surface cannot provide {required} images (max {max})")]
    UnsupportedSurface { required: u32, max: u32 },

    #[error("invalid SPIR-V: {0}")]
    InvalidSpirv(#[source] std::io::Error),

    #[error("allocator error: {0}")]
    Allocator(gpu_allocator::AllocationError),

    #[error("vulkan error: {0}")]
    Vulkan(vk::Result),
}

impl GraphicsError {
    /// Errors the host cannot recover from without tearing the context down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DeviceCompile(_)
                | Self::OutOfDeviceMemory
                | Self::DeviceLost
                | Self::Allocator(_)
                | Self::Vulkan(_)
        )
    }

    /// Errors resolved by recreating the swapchain and its per-image resources.
    pub fn needs_recreate(&self) -> bool {
        matches!(self, Self::SwapchainOutOfDate)
    }

    /// Classify a failed queue submit or present. Out of date is recoverable
    /// and memory exhaustion keeps its own kind; anything else leaves the
    /// queue in an unknown state and counts as a lost device.
    pub fn from_submission(result: vk::Result) -> Self {
        match Self::from(result) {
            err @ (Self::SwapchainOutOfDate | Self::OutOfDeviceMemory) => err,
            _ => Self::DeviceLost,
        }
    }
}

impl From<vk::Result> for GraphicsError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR => Self::SwapchainOutOfDate,
            vk::Result::TIMEOUT | vk::Result::NOT_READY => Self::Timeout,
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                Self::OutOfDeviceMemory
            }
            other => Self::Vulkan(other),
        }
    }
}

impl From<gpu_allocator::AllocationError> for GraphicsError {
    fn from(error: gpu_allocator::AllocationError) -> Self {
        match error {
            gpu_allocator::AllocationError::OutOfMemory => Self::OutOfDeviceMemory,
            other => Self::Allocator(other),
        }
    }
}

pub type Result<T, E = GraphicsError> = std::result::Result<T, E>;

/// Cleanup hooks for multi-step object creation.
pub(crate) trait ReleaseOnError<T, E> {
    /// Run `release` if this is an error, then pass the result on.
    fn or_release(self, release: impl FnOnce()) -> std::result::Result<T, E>;

    /// Run `cleanup` whatever the outcome. The first error wins.
    fn and_always(
        self,
        cleanup: impl FnOnce() -> std::result::Result<(), E>,
    ) -> std::result::Result<T, E>;
}

impl<T, E> ReleaseOnError<T, E> for std::result::Result<T, E> {
    fn or_release(self, release: impl FnOnce()) -> std::result::Result<T, E> {
        if self.is_err() {
            release();
        }
        self
    }

    fn and_always(
        self,
        cleanup: impl FnOnce() -> std::result::Result<(), E>,
    ) -> std::result::Result<T, E> {
        let cleaned = cleanup();
        let value = self?;
        cleaned.map(|()| value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vk_results_map_to_taxonomy() {
        assert!(matches!(
            GraphicsError::from(vk::Result::ERROR_OUT_OF_DATE_KHR),
            GraphicsError::SwapchainOutOfDate
        ));
        assert!(matches!(GraphicsError::from(vk::Result::TIMEOUT), GraphicsError::Timeout));
        assert!(matches!(
            GraphicsError::from(vk::Result::ERROR_DEVICE_LOST),
            GraphicsError::DeviceLost
        ));
        assert!(matches!(
            GraphicsError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            GraphicsError::OutOfDeviceMemory
        ));
        assert!(matches!(
            GraphicsError::from(vk::Result::ERROR_INITIALIZATION_FAILED),
            GraphicsError::Vulkan(vk::Result::ERROR_INITIALIZATION_FAILED)
        ));
    }

    #[test]
    fn recovery_classes() {
        assert!(GraphicsError::SwapchainOutOfDate.needs_recreate());
        assert!(!GraphicsError::SwapchainOutOfDate.is_fatal());
        assert!(GraphicsError::DeviceLost.is_fatal());
        assert!(!GraphicsError::Timeout.is_fatal());
        assert!(!GraphicsError::from(ValidationError::DuplicateLocation(0)).is_fatal());
    }

    #[test]
    fn submission_failures_are_fatal_unless_out_of_date() {
        assert!(matches!(
            GraphicsError::from_submission(vk::Result::ERROR_OUT_OF_DATE_KHR),
            GraphicsError::SwapchainOutOfDate
        ));
        assert!(matches!(
            GraphicsError::from_submission(vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            GraphicsError::OutOfDeviceMemory
        ));
        for result in [
            vk::Result::ERROR_SURFACE_LOST_KHR,
            vk::Result::ERROR_DEVICE_LOST,
            vk::Result::ERROR_UNKNOWN,
        ] {
            let err = GraphicsError::from_submission(result);
            assert!(matches!(err, GraphicsError::DeviceLost));
            assert!(err.is_fatal());
        }
    }

    #[test]
    fn release_runs_only_on_error() {
        let mut released = 0;
        let ok: Result<u32> = Ok(7);
        assert_eq!(ok.or_release(|| released += 1).unwrap(), 7);
        assert_eq!(released, 0);

        let failed: Result<u32> = Err(GraphicsError::DeviceLost);
        assert!(failed.or_release(|| released += 1).is_err());
        assert_eq!(released, 1);
    }

    #[test]
    fn cleanup_runs_after_failure_and_keeps_the_first_error() {
        let mut cleaned = false;
        let failed: Result<()> = Err(GraphicsError::OutOfDeviceMemory);
        let result = failed.and_always(|| {
            cleaned = true;
            Err(GraphicsError::DeviceLost)
        });
        assert!(cleaned);
        assert!(matches!(result, Err(GraphicsError::OutOfDeviceMemory)));

        let ok: Result<u32> = Ok(3);
        assert!(matches!(ok.and_always(|| Err(GraphicsError::DeviceLost)), Err(GraphicsError::DeviceLost)));
        let ok: Result<u32> = Ok(3);
        assert_eq!(ok.and_always(|| Ok(())).unwrap(), 3);
    }

    #[test]
    fn allocator_out_of_memory_is_device_memory() {
        let err = GraphicsError::from(gpu_allocator::AllocationError::OutOfMemory);
        assert!(matches!(err, GraphicsError::OutOfDeviceMemory));
    }
}
