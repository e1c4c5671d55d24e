// Vulkan Device - the GraphicsDevice collaborator
//
// Responsibilities:
// - Instance creation with the window system's surface extensions
// - Physical device selection (prefer discrete GPU, Vulkan 1.3 required)
// - Logical device + graphics queue with dynamic rendering enabled
// - Memory allocator setup, shared behind a lock
//
// Everything above this layer talks to the GPU through these handles.

use anyhow::{Context, Result};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::{Mutex, MutexGuard};
use raw_window_handle::RawDisplayHandle;
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

use crate::description::DeviceLimits;
use crate::error::{GraphicsError, ReleaseOnError};

/// Instance, GPU, logical device, graphics queue and allocator. Shared as
/// `Arc<VulkanDevice>` by every manager; the last owner tears it down.
pub struct VulkanDevice {
    // Dropped by hand before the device is destroyed
    allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    pub entry: Entry,

    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,

    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    pub properties: vk::PhysicalDeviceProperties,
    pub limits: DeviceLimits,
}

/// What device selection needs to know about one physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCandidate {
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    /// First queue family with graphics support.
    pub graphics_family: Option<u32>,
}

impl DeviceCandidate {
    /// Rank for selection, or `None` if the device cannot run our pipelines.
    pub fn score(&self) -> Option<u32> {
        if self.api_version < vk::API_VERSION_1_3 {
            return None;
        }
        self.graphics_family?;
        Some(match self.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 10,
            _ => 1,
        })
    }
}

/// Index of the best usable candidate; the first one wins ties.
pub fn select_device(candidates: &[DeviceCandidate]) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .filter_map(|(index, candidate)| candidate.score().map(|score| (index, score)))
        .fold(None, |best: Option<(usize, u32)>, (index, score)| match best {
            Some((_, best_score)) if best_score >= score => best,
            _ => Some((index, score)),
        })
        .map(|(index, _)| index)
}

impl VulkanDevice {
    /// Create the instance, pick a GPU and open a logical device on it.
    ///
    /// `display` decides which surface extensions the instance enables.
    /// Validation is skipped with a warning when the layer is not installed.
    pub fn new(
        app_name: &str,
        display: RawDisplayHandle,
        enable_validation: bool,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let enable_validation = enable_validation && validation_layer_available(&entry);
        let instance = create_instance(&entry, app_name, display, enable_validation)?;
        let debug_utils = if enable_validation {
            let messenger = create_debug_messenger(&entry, &instance)
                .or_release(|| unsafe { instance.destroy_instance(None) })?;
            Some(messenger)
        } else {
            None
        };
        let release_instance = || destroy_instance(&instance, debug_utils.as_ref());

        let (physical_device, graphics_queue_family) =
            pick_physical_device(&instance).or_release(release_instance)?;
        let features = unsafe { instance.get_physical_device_features(physical_device) };
        let (device, graphics_queue) =
            create_logical_device(&instance, physical_device, graphics_queue_family, &features)
                .or_release(release_instance)?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let limits = DeviceLimits::from_vk(&properties.limits, &features);
        log::info!(
            "Selected GPU: {} (Vulkan {}.{}.{}), queue family {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy(),
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version),
            graphics_queue_family
        );
        if !limits.fill_mode_non_solid {
            log::info!("fillModeNonSolid unavailable, line polygon mode disabled");
        }
        log::debug!("Device limits: {:?}", limits);

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create memory allocator")
        .or_release(|| {
            unsafe { device.destroy_device(None) };
            release_instance();
        })?;

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            instance,
            entry,
            graphics_queue,
            graphics_queue_family,
            debug_utils,
            properties,
            limits,
        }))
    }

    /// Exclusive access to the memory allocator.
    pub fn allocator(&self) -> MutexGuard<'_, Allocator> {
        self.allocator.lock()
    }

    /// Drain barrier: block until the GPU has finished all submitted work.
    pub fn wait_idle(&self) -> Result<(), GraphicsError> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device");

        let _ = self.wait_idle();

        unsafe {
            // Allocations hold device memory, so the allocator goes first.
            ManuallyDrop::drop(&mut self.allocator);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Undo `create_instance` and `create_debug_messenger`.
fn destroy_instance(
    instance: &ash::Instance,
    debug_utils: Option<&(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
) {
    unsafe {
        if let Some((loader, messenger)) = debug_utils {
            loader.destroy_debug_utils_messenger(*messenger, None);
        }
        instance.destroy_instance(None);
    }
}

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

fn validation_layer_available(entry: &Entry) -> bool {
    let layers = entry.enumerate_instance_layer_properties().unwrap_or_default();
    let found = layers
        .iter()
        .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER);
    if !found {
        log::warn!("Validation requested but {:?} is not installed", VALIDATION_LAYER);
    }
    found
}

fn create_instance(
    entry: &Entry,
    app_name: &str,
    display: RawDisplayHandle,
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)?;
    let app_info = vk::ApplicationInfo::builder()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"vk-pipeline")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let mut extensions = ash_window::enumerate_required_extensions(display)
        .context("Window system has no Vulkan surface support")?
        .to_vec();
    let mut layers = Vec::new();
    if enable_validation {
        extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        layers.push(VALIDATION_LAYER.as_ptr());
    }

    let create_info = vk::InstanceCreateInfo::builder()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layers);

    unsafe { entry.create_instance(&create_info, None) }.context("Failed to create Vulkan instance")
}

fn create_debug_messenger(
    entry: &Entry,
    instance: &ash::Instance,
) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
    let loader = ash::extensions::ext::DebugUtils::new(entry, instance);
    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    let messenger = unsafe { loader.create_debug_utils_messenger(&create_info, None) }
        .context("Failed to create debug messenger")?;
    Ok((loader, messenger))
}

fn pick_physical_device(instance: &ash::Instance) -> Result<(vk::PhysicalDevice, u32)> {
    let devices = unsafe { instance.enumerate_physical_devices() }?;

    let candidates: Vec<DeviceCandidate> = devices
        .iter()
        .map(|&device| unsafe {
            let props = instance.get_physical_device_properties(device);
            let graphics_family = instance
                .get_physical_device_queue_family_properties(device)
                .iter()
                .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                .map(|index| index as u32);
            DeviceCandidate {
                device_type: props.device_type,
                api_version: props.api_version,
                graphics_family,
            }
        })
        .collect();

    let chosen = select_device(&candidates)
        .with_context(|| format!("None of {} GPUs supports Vulkan 1.3 with a graphics queue", devices.len()))?;
    let family = candidates[chosen]
        .graphics_family
        .context("Selected GPU lost its graphics queue")?;
    Ok((devices[chosen], family))
}

fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    graphics_queue_family: u32,
    available: &vk::PhysicalDeviceFeatures,
) -> Result<(ash::Device, vk::Queue)> {
    let priorities = [1.0];
    let queue_info = vk::DeviceQueueCreateInfo::builder()
        .queue_family_index(graphics_queue_family)
        .queue_priorities(&priorities)
        .build();

    let extensions = [ash::extensions::khr::Swapchain::name().as_ptr()];
    // Line polygon mode is optional; descriptions using it fail validation
    // when the device lacks it.
    let features = vk::PhysicalDeviceFeatures::builder()
        .fill_mode_non_solid(available.fill_mode_non_solid == vk::TRUE);
    // Pipelines render without render passes.
    let mut dynamic_rendering =
        vk::PhysicalDeviceDynamicRenderingFeatures::builder().dynamic_rendering(true);

    let create_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(std::slice::from_ref(&queue_info))
        .enabled_extension_names(&extensions)
        .enabled_features(&features)
        .push_next(&mut dynamic_rendering);

    let device = unsafe { instance.create_device(physical_device, &create_info, None) }
        .context("Failed to create logical device")?;
    let queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };
    Ok((device, queue))
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    kind: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*data).p_message).to_string_lossy();
    let source = if kind.contains(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION) {
        "validation"
    } else if kind.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
        "performance"
    } else {
        "general"
    };

    let level = if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::Level::Error
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::Level::Warn
    } else {
        log::Level::Debug
    };
    log::log!(level, "[Vulkan {}] {}", source, message);

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(device_type: vk::PhysicalDeviceType) -> DeviceCandidate {
        DeviceCandidate {
            device_type,
            api_version: vk::API_VERSION_1_3,
            graphics_family: Some(0),
        }
    }

    #[test]
    fn discrete_gpu_beats_integrated() {
        let candidates = [
            candidate(vk::PhysicalDeviceType::INTEGRATED_GPU),
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU),
            candidate(vk::PhysicalDeviceType::CPU),
        ];
        assert_eq!(select_device(&candidates), Some(1));
    }

    #[test]
    fn old_api_or_missing_queue_is_unusable() {
        let mut old = candidate(vk::PhysicalDeviceType::DISCRETE_GPU);
        old.api_version = vk::API_VERSION_1_2;
        let mut headless = candidate(vk::PhysicalDeviceType::DISCRETE_GPU);
        headless.graphics_family = None;

        assert_eq!(old.score(), None);
        assert_eq!(select_device(&[old, headless]), None);
        assert_eq!(
            select_device(&[old, candidate(vk::PhysicalDeviceType::CPU)]),
            Some(1)
        );
    }

    #[test]
    fn first_of_equal_devices_wins() {
        let gpu = candidate(vk::PhysicalDeviceType::DISCRETE_GPU);
        assert_eq!(select_device(&[gpu, gpu]), Some(0));
        assert_eq!(select_device(&[]), None);
    }
}
