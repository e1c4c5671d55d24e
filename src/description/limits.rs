// Device limits injected into builders and the compiler.
//
// Defaults are the minimums every conformant Vulkan implementation guarantees,
// so descriptions validated against them work on any device.

/// The subset of `VkPhysicalDeviceLimits` that descriptions are checked
/// against, plus the optional features a description may depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_push_constants_size: u32,
    pub max_vertex_input_bindings: u32,
    pub max_vertex_input_attributes: u32,
    pub max_vertex_input_binding_stride: u32,
    pub max_bound_descriptor_sets: u32,
    pub max_uniform_buffer_range: u32,
    /// `fillModeNonSolid`: line polygon mode is available.
    pub fill_mode_non_solid: bool,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_push_constants_size: 128,
            max_vertex_input_bindings: 16,
            max_vertex_input_attributes: 16,
            max_vertex_input_binding_stride: 2048,
            max_bound_descriptor_sets: 4,
            max_uniform_buffer_range: 16384,
            fill_mode_non_solid: false,
        }
    }
}

impl DeviceLimits {
    pub fn from_vk(
        limits: &ash::vk::PhysicalDeviceLimits,
        features: &ash::vk::PhysicalDeviceFeatures,
    ) -> Self {
        Self {
            max_push_constants_size: limits.max_push_constants_size,
            max_vertex_input_bindings: limits.max_vertex_input_bindings,
            max_vertex_input_attributes: limits.max_vertex_input_attributes,
            max_vertex_input_binding_stride: limits.max_vertex_input_binding_stride,
            max_bound_descriptor_sets: limits.max_bound_descriptor_sets,
            max_uniform_buffer_range: limits.max_uniform_buffer_range,
            fill_mode_non_solid: features.fill_mode_non_solid == ash::vk::TRUE,
        }
    }

    /// Same limits with a different push-constant budget.
    pub fn with_push_constant_limit(mut self, bytes: u32) -> Self {
        self.max_push_constants_size = bytes;
        self
    }

    pub fn with_fill_mode_non_solid(mut self, supported: bool) -> Self {
        self.fill_mode_non_solid = supported;
        self
    }
}
