//! Instance creation and physical device probing.

use std::ffi::{c_void, CStr, CString};
use std::sync::Arc;

use ash::vk;

use crate::backend::Backend;
use crate::config::ContextConfig;
use crate::context::{AdapterInfo, AdapterKind, BackendKind, Capabilities};
use crate::error::{GalError, GalResult};

use super::{vk_error, VulkanBackend};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Optional device extensions an adapter exposes.
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct DeviceExtensions {
    pub swapchain: bool,
    pub acceleration_structure: bool,
    pub ray_tracing_pipeline: bool,
    pub ray_query: bool,
}

impl DeviceExtensions {
    fn detect(available: &[vk::ExtensionProperties]) -> Self {
        let has = |name: &CStr| {
            available
                .iter()
                .any(|e| e.extension_name_as_c_str().is_ok_and(|n| n == name))
        };
        Self {
            swapchain: has(ash::khr::swapchain::NAME),
            acceleration_structure: has(ash::khr::acceleration_structure::NAME)
                && has(ash::khr::deferred_host_operations::NAME),
            ray_tracing_pipeline: has(ash::khr::ray_tracing_pipeline::NAME),
            ray_query: has(ash::khr::ray_query::NAME),
        }
    }

    /// Extension names to enable for the supported feature set.
    pub fn names(&self, caps: &Capabilities) -> Vec<*const std::ffi::c_char> {
        let mut names = Vec::new();
        if cfg!(feature = "window") && self.swapchain {
            names.push(ash::khr::swapchain::NAME.as_ptr());
        }
        if caps.acceleration_structures() {
            names.push(ash::khr::acceleration_structure::NAME.as_ptr());
            names.push(ash::khr::deferred_host_operations::NAME.as_ptr());
        }
        if caps.ray_tracing {
            names.push(ash::khr::ray_tracing_pipeline::NAME.as_ptr());
        }
        if caps.ray_query {
            names.push(ash::khr::ray_query::NAME.as_ptr());
        }
        names
    }
}

/// Limits the backend needs beyond [`Capabilities`].
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct DeviceLimits {
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub max_sampler_anisotropy: f32,
    pub sampler_anisotropy: bool,
}

/// A physical device that meets the backend's baseline (Vulkan 1.2 with
/// timeline semaphores and one graphics + compute queue family).
#[derive(Debug, Clone)]
pub(super) struct Adapter {
    pub physical: vk::PhysicalDevice,
    pub queue_family: u32,
    pub extensions: DeviceExtensions,
    pub limits: DeviceLimits,
    pub info: AdapterInfo,
}

/// Loader, instance and the adapters found on it.
pub struct VulkanInstance {
    entry: ash::Entry,
    instance: ash::Instance,
    debug_utils: Option<ash::ext::debug_utils::Instance>,
    messenger: vk::DebugUtilsMessengerEXT,
    surfaces: bool,
    adapters: Vec<Adapter>,
    infos: Vec<AdapterInfo>,
}

impl std::fmt::Debug for VulkanInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanInstance")
            .field("adapters", &self.infos.len())
            .field("debug_utils", &self.debug_utils.is_some())
            .finish_non_exhaustive()
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[vulkan] {message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[vulkan] {message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        log::debug!("[vulkan] {message}");
    } else {
        log::trace!("[vulkan] {message}");
    }
    vk::FALSE
}

impl VulkanInstance {
    pub fn new(config: &ContextConfig) -> GalResult<Arc<Self>> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            GalError::UnsupportedCapability(format!("Vulkan loader not available: {e}"))
        })?;
        let layers = unsafe { entry.enumerate_instance_layer_properties() }
            .map_err(|e| vk_error("enumerate_instance_layer_properties", e))?;
        let extensions = unsafe { entry.enumerate_instance_extension_properties(None) }
            .map_err(|e| vk_error("enumerate_instance_extension_properties", e))?;
        let has_extension = |name: &CStr| {
            extensions
                .iter()
                .any(|e| e.extension_name_as_c_str().is_ok_and(|n| n == name))
        };

        let mut layer_names = Vec::new();
        if config.validation {
            let present = layers
                .iter()
                .any(|l| l.layer_name_as_c_str().is_ok_and(|n| n == VALIDATION_LAYER));
            if present {
                layer_names.push(VALIDATION_LAYER.as_ptr());
            } else {
                log::warn!("validation requested but {VALIDATION_LAYER:?} is not installed");
            }
        }

        let mut extension_names = Vec::new();
        let debug_utils = has_extension(ash::ext::debug_utils::NAME);
        if debug_utils {
            extension_names.push(ash::ext::debug_utils::NAME.as_ptr());
        }
        let mut surfaces = false;
        if cfg!(feature = "window") && has_extension(ash::khr::surface::NAME) {
            surfaces = true;
            extension_names.push(ash::khr::surface::NAME.as_ptr());
            for platform in [
                ash::khr::win32_surface::NAME,
                ash::khr::xlib_surface::NAME,
                ash::khr::xcb_surface::NAME,
                ash::khr::wayland_surface::NAME,
            ] {
                if has_extension(platform) {
                    extension_names.push(platform.as_ptr());
                }
            }
        }

        let app_name = CString::new(config.application_name.replace('\0', ""))
            .map_err(|e| GalError::descriptor(format!("application name: {e}")))?;
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .engine_name(c"Lume")
            .api_version(vk::API_VERSION_1_2);
        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_names)
            .enabled_extension_names(&extension_names);
        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| vk_error("create_instance", e))?;

        let debug_utils = debug_utils.then(|| ash::ext::debug_utils::Instance::new(&entry, &instance));
        let mut messenger = vk::DebugUtilsMessengerEXT::null();
        if let (Some(utils), false) = (&debug_utils, layer_names.is_empty()) {
            let info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(debug_callback));
            match unsafe { utils.create_debug_utils_messenger(&info, None) } {
                Ok(created) => messenger = created,
                Err(e) => log::warn!("debug messenger not created: {e:?}"),
            }
        }

        let mut this = Self {
            entry,
            instance,
            debug_utils,
            messenger,
            surfaces,
            adapters: Vec::new(),
            infos: Vec::new(),
        };
        this.adapters = this.enumerate_adapters(config)?;
        this.infos = this.adapters.iter().map(|a| a.info.clone()).collect();
        log::info!(
            "Vulkan instance created: {} usable adapter(s), validation {}",
            this.infos.len(),
            !layer_names.is_empty()
        );
        Ok(Arc::new(this))
    }

    pub fn adapters(&self) -> &[AdapterInfo] {
        &self.infos
    }

    /// Creates a logical device on adapter `index`.
    pub fn open(self: &Arc<Self>, index: usize, config: &ContextConfig) -> GalResult<Arc<dyn Backend>> {
        let adapter = self
            .adapters
            .get(index)
            .cloned()
            .ok_or_else(|| GalError::descriptor(format!("no Vulkan adapter {index}")))?;
        Ok(Arc::new(VulkanBackend::new(Arc::clone(self), adapter, config)?))
    }

    pub(super) fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub(super) fn raw(&self) -> &ash::Instance {
        &self.instance
    }

    pub(super) fn has_debug_utils(&self) -> bool {
        self.debug_utils.is_some()
    }

    /// Whether surface extensions were enabled on the instance.
    pub(super) fn surfaces(&self) -> bool {
        self.surfaces
    }

    fn enumerate_adapters(&self, config: &ContextConfig) -> GalResult<Vec<Adapter>> {
        let physicals = unsafe { self.instance.enumerate_physical_devices() }
            .map_err(|e| vk_error("enumerate_physical_devices", e))?;
        let mut adapters = Vec::new();
        for physical in physicals {
            match self.describe_adapter(physical, adapters.len(), config) {
                Ok(Some(adapter)) => {
                    log::debug!(
                        "adapter {} '{}': ray tracing {}, ray query {}, bindless {}",
                        adapter.info.index,
                        adapter.info.name,
                        adapter.info.capabilities.ray_tracing,
                        adapter.info.capabilities.ray_query,
                        adapter.info.capabilities.bindless
                    );
                    adapters.push(adapter);
                }
                Ok(None) => {}
                Err(err) => log::warn!("skipping physical device: {err}"),
            }
        }
        Ok(adapters)
    }

    fn describe_adapter(
        &self,
        physical: vk::PhysicalDevice,
        index: usize,
        config: &ContextConfig,
    ) -> GalResult<Option<Adapter>> {
        let instance = &self.instance;
        let basic = unsafe { instance.get_physical_device_properties(physical) };
        let name = basic
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if basic.api_version < vk::API_VERSION_1_2 {
            log::debug!("'{name}' skipped: Vulkan {}.{} < 1.2",
                vk::api_version_major(basic.api_version),
                vk::api_version_minor(basic.api_version));
            return Ok(None);
        }
        let families = unsafe { instance.get_physical_device_queue_family_properties(physical) };
        let Some(queue_family) = families.iter().position(|f| {
            f.queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        }) else {
            log::debug!("'{name}' skipped: no graphics + compute queue family");
            return Ok(None);
        };
        let available = unsafe { instance.enumerate_device_extension_properties(physical) }
            .map_err(|e| vk_error("enumerate_device_extension_properties", e))?;
        let extensions = DeviceExtensions::detect(&available);

        let mut v12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut accel = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut pipeline = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        let mut query = vk::PhysicalDeviceRayQueryFeaturesKHR::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut v12);
        if extensions.acceleration_structure {
            features2 = features2.push_next(&mut accel);
        }
        if extensions.ray_tracing_pipeline {
            features2 = features2.push_next(&mut pipeline);
        }
        if extensions.ray_query {
            features2 = features2.push_next(&mut query);
        }
        unsafe { instance.get_physical_device_features2(physical, &mut features2) };
        let features = features2.features;

        let mut v12_props = vk::PhysicalDeviceVulkan12Properties::default();
        let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut as_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut v12_props);
        if extensions.ray_tracing_pipeline {
            props2 = props2.push_next(&mut rt_props);
        }
        if extensions.acceleration_structure {
            props2 = props2.push_next(&mut as_props);
        }
        unsafe { instance.get_physical_device_properties2(physical, &mut props2) };
        let properties = props2.properties;

        if v12.timeline_semaphore != vk::TRUE {
            log::debug!("'{name}' skipped: no timeline semaphores");
            return Ok(None);
        }
        let acceleration_structures = extensions.acceleration_structure
            && accel.acceleration_structure == vk::TRUE
            && v12.buffer_device_address == vk::TRUE;
        let ray_tracing = acceleration_structures
            && extensions.ray_tracing_pipeline
            && pipeline.ray_tracing_pipeline == vk::TRUE;
        let ray_query =
            acceleration_structures && extensions.ray_query && query.ray_query == vk::TRUE;
        let bindless = [
            v12.runtime_descriptor_array,
            v12.descriptor_binding_partially_bound,
            v12.descriptor_binding_sampled_image_update_after_bind,
            v12.descriptor_binding_storage_image_update_after_bind,
            v12.descriptor_binding_storage_buffer_update_after_bind,
            v12.descriptor_binding_uniform_buffer_update_after_bind,
            v12.descriptor_binding_update_unused_while_pending,
            v12.shader_sampled_image_array_non_uniform_indexing,
            v12.shader_storage_buffer_array_non_uniform_indexing,
        ]
        .iter()
        .all(|&f| f == vk::TRUE);
        let max_bindless_descriptors = if bindless {
            v12_props
                .max_descriptor_set_update_after_bind_sampled_images
                .min(v12_props.max_descriptor_set_update_after_bind_storage_images)
                .min(v12_props.max_descriptor_set_update_after_bind_storage_buffers)
                .min(v12_props.max_per_stage_update_after_bind_resources)
        } else {
            0
        };

        let limits = &properties.limits;
        let storage_render_target = unsafe {
            instance.get_physical_device_format_properties(physical, vk::Format::R8G8B8A8_UNORM)
        }
        .optimal_tiling_features
        .contains(vk::FormatFeatureFlags::STORAGE_IMAGE | vk::FormatFeatureFlags::COLOR_ATTACHMENT);
        let kind = adapter_kind(properties.device_type);
        let capabilities = Capabilities {
            device_name: name.clone(),
            backend: BackendKind::Vulkan,
            adapter_kind: kind,
            ray_query,
            ray_tracing,
            bindless,
            max_bindless_descriptors,
            max_texture_dimension_2d: limits.max_image_dimension2_d,
            max_sample_count: max_sample_count(
                limits.framebuffer_color_sample_counts & limits.framebuffer_depth_sample_counts,
            ),
            max_ray_recursion_depth: if ray_tracing {
                rt_props.max_ray_recursion_depth
            } else {
                0
            },
            storage_render_target,
            scratch_alignment: if acceleration_structures {
                u64::from(as_props.min_acceleration_structure_scratch_offset_alignment).max(1)
            } else {
                1
            },
        };
        if config.max_bindless_descriptors > capabilities.max_bindless_descriptors && bindless {
            log::debug!(
                "'{name}': bindless capacity {} clamped to device limit {}",
                config.max_bindless_descriptors,
                capabilities.max_bindless_descriptors
            );
        }
        Ok(Some(Adapter {
            physical,
            queue_family: queue_family as u32,
            extensions,
            limits: DeviceLimits {
                shader_group_handle_size: rt_props.shader_group_handle_size,
                shader_group_handle_alignment: rt_props.shader_group_handle_alignment.max(1),
                shader_group_base_alignment: rt_props.shader_group_base_alignment.max(1),
                max_sampler_anisotropy: limits.max_sampler_anisotropy,
                sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
            },
            info: AdapterInfo {
                index,
                name,
                kind,
                capabilities,
            },
        }))
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some(utils) = &self.debug_utils {
                if self.messenger != vk::DebugUtilsMessengerEXT::null() {
                    utils.destroy_debug_utils_messenger(self.messenger, None);
                }
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn adapter_kind(device_type: vk::PhysicalDeviceType) -> AdapterKind {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => AdapterKind::Discrete,
        vk::PhysicalDeviceType::INTEGRATED_GPU => AdapterKind::Integrated,
        vk::PhysicalDeviceType::VIRTUAL_GPU => AdapterKind::Virtual,
        vk::PhysicalDeviceType::CPU => AdapterKind::Cpu,
        _ => AdapterKind::Other,
    }
}

/// Highest sample count set in `counts`.
fn max_sample_count(counts: vk::SampleCountFlags) -> u32 {
    let raw = counts.as_raw();
    if raw == 0 {
        1
    } else {
        1 << (31 - raw.leading_zeros())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highest_sample_count_wins() {
        let counts = vk::SampleCountFlags::TYPE_1
            | vk::SampleCountFlags::TYPE_4
            | vk::SampleCountFlags::TYPE_8;
        assert_eq!(max_sample_count(counts), 8);
        assert_eq!(max_sample_count(vk::SampleCountFlags::empty()), 1);
    }

    #[test]
    fn device_types_map_to_adapter_kinds() {
        assert_eq!(
            adapter_kind(vk::PhysicalDeviceType::DISCRETE_GPU),
            AdapterKind::Discrete
        );
        assert_eq!(adapter_kind(vk::PhysicalDeviceType::CPU), AdapterKind::Cpu);
        assert_eq!(adapter_kind(vk::PhysicalDeviceType::OTHER), AdapterKind::Other);
    }

    #[test]
    fn acceleration_structures_need_both_extensions() {
        let mut name = [0 as std::ffi::c_char; vk::MAX_EXTENSION_NAME_SIZE];
        for (dst, &src) in name
            .iter_mut()
            .zip(ash::khr::acceleration_structure::NAME.to_bytes())
        {
            *dst = src as std::ffi::c_char;
        }
        let only_accel = [vk::ExtensionProperties {
            extension_name: name,
            spec_version: 1,
        }];
        assert!(!DeviceExtensions::detect(&only_accel).acceleration_structure);
    }
}
