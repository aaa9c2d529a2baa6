//! Vulkan backend.
//!
//! One logical device per [`VulkanBackend`] on Vulkan 1.2, with a single
//! graphics + compute queue shared by every [`QueueKind`]. Each queue kind
//! signals its own timeline semaphore, which is what submission tokens name.
//! Memory is allocated per resource.

mod accel;
mod adapter;
mod barrier;
mod buffer;
mod descriptor;
mod memory;
mod pipeline;
mod queue;
mod record;
mod render_pass;
mod sampler;
mod swapchain;
mod texture;

use std::ffi::CString;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ash::vk;

use crate::accel::{AccelerationStructureBuildInput, AccelerationStructureKind, BuildSizes};
use crate::backend::{
    Backend, BackendStatistics, DeviceAddress, HandleTable, NativeHandle, ObjectKind, Submission,
};
use crate::binding::{BindingWrite, LayoutSlot};
use crate::buffer::BufferDescriptor;
use crate::config::ContextConfig;
use crate::context::{BackendKind, Capabilities};
use crate::error::{GalError, GalResult};
use crate::pipeline::{
    ComputePipelineDescriptor, GraphicsPipelineDescriptor, RayTracingPipelineDescriptor,
};
use crate::sampler::SamplerDescriptor;
use crate::shader::ShaderStage;
use crate::state::{QueueKind, ResourceState, SubmissionToken};
use crate::swapchain::{NativeSwapchain, SwapchainConfig};
use crate::texture::{TextureDescriptor, TextureRegion, TextureViewDescriptor};

pub use adapter::VulkanInstance;

use accel::StructureEntry;
use adapter::Adapter;
use barrier::StageSupport;
use buffer::BufferEntry;
use descriptor::{LayoutEntry, SetEntry};
use pipeline::{PipelineEntry, ShaderEntry};
use queue::Queues;
use swapchain::SwapchainEntry;
use texture::{TextureEntry, ViewEntry};

/// Maps a Vulkan result onto the error taxonomy.
pub(super) fn vk_error(what: &str, err: vk::Result) -> GalError {
    match err {
        vk::Result::ERROR_DEVICE_LOST => GalError::DeviceLost,
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            GalError::oom(what, 0)
        }
        other => GalError::Backend(format!("{what}: {other:?}")),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) struct VulkanBackend {
    instance: Arc<VulkanInstance>,
    adapter: Adapter,
    caps: Capabilities,
    device: ash::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    queues: Queues,
    stage_support: StageSupport,
    multi_draw_indirect: bool,
    acceleration: Option<ash::khr::acceleration_structure::Device>,
    ray_tracing: Option<ash::khr::ray_tracing_pipeline::Device>,
    debug_utils: Option<ash::ext::debug_utils::Device>,
    #[cfg(feature = "window")]
    surface_loader: Option<ash::khr::surface::Instance>,
    #[cfg(feature = "window")]
    swapchain_loader: Option<ash::khr::swapchain::Device>,
    buffers: HandleTable<BufferEntry>,
    textures: HandleTable<TextureEntry>,
    views: HandleTable<ViewEntry>,
    samplers: HandleTable<vk::Sampler>,
    shaders: HandleTable<ShaderEntry>,
    layouts: HandleTable<LayoutEntry>,
    sets: HandleTable<SetEntry>,
    pipelines: HandleTable<PipelineEntry>,
    structures: HandleTable<StructureEntry>,
    swapchains: HandleTable<SwapchainEntry>,
    stats: Mutex<BackendStatistics>,
}

impl std::fmt::Debug for VulkanBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBackend")
            .field("device", &self.caps.device_name)
            .field("queue_family", &self.adapter.queue_family)
            .field("buffers", &self.buffers.len())
            .field("textures", &self.textures.len())
            .finish_non_exhaustive()
    }
}

impl VulkanBackend {
    pub(super) fn new(
        instance: Arc<VulkanInstance>,
        adapter: Adapter,
        config: &ContextConfig,
    ) -> GalResult<Self> {
        let raw = instance.raw();
        let caps = adapter.info.capabilities.clone();
        let supported = unsafe { raw.get_physical_device_features(adapter.physical) };
        let features = vk::PhysicalDeviceFeatures::default()
            .sampler_anisotropy(adapter.limits.sampler_anisotropy)
            .multi_draw_indirect(supported.multi_draw_indirect == vk::TRUE)
            .fill_mode_non_solid(supported.fill_mode_non_solid == vk::TRUE);

        let mut v12 = vk::PhysicalDeviceVulkan12Features::default()
            .timeline_semaphore(true)
            .buffer_device_address(caps.acceleration_structures());
        if caps.bindless {
            v12 = v12
                .runtime_descriptor_array(true)
                .descriptor_binding_partially_bound(true)
                .descriptor_binding_sampled_image_update_after_bind(true)
                .descriptor_binding_storage_image_update_after_bind(true)
                .descriptor_binding_storage_buffer_update_after_bind(true)
                .descriptor_binding_uniform_buffer_update_after_bind(true)
                .descriptor_binding_update_unused_while_pending(true)
                .shader_sampled_image_array_non_uniform_indexing(true)
                .shader_storage_buffer_array_non_uniform_indexing(true);
        }
        let mut accel_features =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default().acceleration_structure(true);
        let mut pipeline_features =
            vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);
        let mut query_features =
            vk::PhysicalDeviceRayQueryFeaturesKHR::default().ray_query(true);
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .features(features)
            .push_next(&mut v12);
        if caps.acceleration_structures() {
            features2 = features2.push_next(&mut accel_features);
        }
        if caps.ray_tracing {
            features2 = features2.push_next(&mut pipeline_features);
        }
        if caps.ray_query {
            features2 = features2.push_next(&mut query_features);
        }

        let priorities = [1.0f32];
        let queue_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(adapter.queue_family)
            .queue_priorities(&priorities);
        let extension_names = adapter.extensions.names(&caps);
        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_info))
            .enabled_extension_names(&extension_names)
            .push_next(&mut features2);
        let device = unsafe { raw.create_device(adapter.physical, &device_info, None) }
            .map_err(|e| vk_error("create_device", e))?;

        let queues = match Queues::new(&device, adapter.queue_family) {
            Ok(queues) => queues,
            Err(err) => {
                unsafe { device.destroy_device(None) };
                return Err(err);
            }
        };
        let memory_properties =
            unsafe { raw.get_physical_device_memory_properties(adapter.physical) };
        let acceleration = caps
            .acceleration_structures()
            .then(|| ash::khr::acceleration_structure::Device::new(raw, &device));
        let ray_tracing = caps
            .ray_tracing
            .then(|| ash::khr::ray_tracing_pipeline::Device::new(raw, &device));
        let debug_utils = instance
            .has_debug_utils()
            .then(|| ash::ext::debug_utils::Device::new(raw, &device));
        #[cfg(feature = "window")]
        let surface_loader = instance
            .surfaces()
            .then(|| ash::khr::surface::Instance::new(instance.entry(), raw));
        #[cfg(feature = "window")]
        let swapchain_loader = adapter
            .extensions
            .swapchain
            .then(|| ash::khr::swapchain::Device::new(raw, &device));

        log::info!(
            "Vulkan device '{}' opened for '{}' (queue family {}, ray tracing {}, bindless {})",
            caps.device_name,
            config.application_name,
            adapter.queue_family,
            caps.ray_tracing,
            caps.bindless
        );
        Ok(Self {
            stage_support: StageSupport {
                acceleration_structures: caps.acceleration_structures(),
                ray_tracing: caps.ray_tracing,
            },
            multi_draw_indirect: supported.multi_draw_indirect == vk::TRUE,
            caps,
            device,
            memory_properties,
            queues,
            acceleration,
            ray_tracing,
            debug_utils,
            #[cfg(feature = "window")]
            surface_loader,
            #[cfg(feature = "window")]
            swapchain_loader,
            buffers: HandleTable::new("buffer"),
            textures: HandleTable::new("texture"),
            views: HandleTable::new("texture view"),
            samplers: HandleTable::new("sampler"),
            shaders: HandleTable::new("shader"),
            layouts: HandleTable::new("resource layout"),
            sets: HandleTable::new("resource set"),
            pipelines: HandleTable::new("pipeline"),
            structures: HandleTable::new("acceleration structure"),
            swapchains: HandleTable::new("swapchain"),
            stats: Mutex::new(BackendStatistics::default()),
            adapter,
            instance,
        })
    }

    fn add_statistics(&self, delta: &BackendStatistics) {
        let mut stats = lock(&self.stats);
        stats.submissions += delta.submissions;
        stats.transitions += delta.transitions;
        stats.queue_transfers += delta.queue_transfers;
        stats.draws += delta.draws;
        stats.dispatches += delta.dispatches;
        stats.ray_dispatches += delta.ray_dispatches;
        stats.acceleration_structure_builds += delta.acceleration_structure_builds;
    }

    /// Native object behind `handle`, as a raw 64-bit value for debug names.
    fn raw_object(&self, kind: ObjectKind, handle: NativeHandle) -> Option<(vk::ObjectType, u64)> {
        use ash::vk::Handle;
        let found = match kind {
            ObjectKind::Buffer => self
                .buffers
                .with(handle, |b| (vk::ObjectType::BUFFER, b.buffer.as_raw())),
            ObjectKind::Texture => self
                .textures
                .with(handle, |t| (vk::ObjectType::IMAGE, t.image.as_raw())),
            ObjectKind::TextureView => self
                .views
                .with(handle, |v| (vk::ObjectType::IMAGE_VIEW, v.view.as_raw())),
            ObjectKind::Sampler => self
                .samplers
                .with(handle, |s| (vk::ObjectType::SAMPLER, s.as_raw())),
            ObjectKind::Shader => self
                .shaders
                .with(handle, |s| (vk::ObjectType::SHADER_MODULE, s.module.as_raw())),
            ObjectKind::ResourceLayout => self.layouts.with(handle, |l| {
                (vk::ObjectType::DESCRIPTOR_SET_LAYOUT, l.layout.as_raw())
            }),
            ObjectKind::ResourceSet => self
                .sets
                .with(handle, |s| (vk::ObjectType::DESCRIPTOR_SET, s.set.as_raw())),
            ObjectKind::Pipeline => self
                .pipelines
                .with(handle, |p| (vk::ObjectType::PIPELINE, p.pipeline.as_raw())),
            ObjectKind::AccelerationStructure => self.structures.with(handle, |s| {
                (vk::ObjectType::ACCELERATION_STRUCTURE_KHR, s.raw.as_raw())
            }),
        };
        found.ok()
    }
}

impl Backend for VulkanBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Vulkan
    }

    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    fn create_buffer(&self, desc: &BufferDescriptor) -> GalResult<NativeHandle> {
        let entry = self.new_buffer(desc)?;
        Ok(self.buffers.insert(entry))
    }

    fn destroy_buffer(&self, buffer: NativeHandle) {
        if let Some(entry) = self.buffers.remove(buffer) {
            self.free_buffer(&entry);
        }
    }

    fn buffer_device_address(&self, buffer: NativeHandle) -> GalResult<DeviceAddress> {
        self.buffer_address(buffer)
    }

    fn write_buffer(
        &self,
        buffer: NativeHandle,
        state: ResourceState,
        offset: u64,
        data: &[u8],
    ) -> GalResult<()> {
        self.buffer_write(buffer, state, offset, data)
    }

    fn read_buffer(
        &self,
        buffer: NativeHandle,
        state: ResourceState,
        offset: u64,
        out: &mut [u8],
    ) -> GalResult<()> {
        self.buffer_read(buffer, state, offset, out)
    }

    fn create_texture(&self, desc: &TextureDescriptor) -> GalResult<NativeHandle> {
        let entry = self.new_texture(desc)?;
        Ok(self.textures.insert(entry))
    }

    fn destroy_texture(&self, texture: NativeHandle) {
        if let Some(entry) = self.textures.remove(texture) {
            self.free_texture(&entry);
        }
    }

    fn create_texture_view(
        &self,
        texture: NativeHandle,
        desc: &TextureViewDescriptor,
    ) -> GalResult<NativeHandle> {
        let entry = self.new_view(texture, desc)?;
        Ok(self.views.insert(entry))
    }

    fn destroy_texture_view(&self, view: NativeHandle) {
        if let Some(entry) = self.views.remove(view) {
            unsafe { self.device.destroy_image_view(entry.view, None) };
        }
    }

    fn upload_texture(
        &self,
        texture: NativeHandle,
        state: ResourceState,
        region: &TextureRegion,
        data: &[u8],
    ) -> GalResult<ResourceState> {
        self.texture_upload(texture, state, region, data)
    }

    fn generate_mipmaps(
        &self,
        texture: NativeHandle,
        state: ResourceState,
    ) -> GalResult<ResourceState> {
        self.texture_mipmaps(texture, state)
    }

    fn create_sampler(&self, desc: &SamplerDescriptor) -> GalResult<NativeHandle> {
        let sampler = self.new_sampler(desc)?;
        Ok(self.samplers.insert(sampler))
    }

    fn destroy_sampler(&self, sampler: NativeHandle) {
        if let Some(sampler) = self.samplers.remove(sampler) {
            unsafe { self.device.destroy_sampler(sampler, None) };
        }
    }

    fn create_shader(
        &self,
        stage: ShaderStage,
        bytecode: &[u8],
        entry_point: &str,
    ) -> GalResult<NativeHandle> {
        let entry = self.new_shader(stage, bytecode, entry_point)?;
        Ok(self.shaders.insert(entry))
    }

    fn destroy_shader(&self, shader: NativeHandle) {
        if let Some(entry) = self.shaders.remove(shader) {
            unsafe { self.device.destroy_shader_module(entry.module, None) };
        }
    }

    fn create_resource_layout(&self, slots: &[LayoutSlot]) -> GalResult<NativeHandle> {
        let entry = self.new_layout(slots)?;
        Ok(self.layouts.insert(entry))
    }

    fn destroy_resource_layout(&self, layout: NativeHandle) {
        if let Some(entry) = self.layouts.remove(layout) {
            unsafe { self.device.destroy_descriptor_set_layout(entry.layout, None) };
        }
    }

    fn create_resource_set(
        &self,
        layout: NativeHandle,
        writes: &[BindingWrite],
    ) -> GalResult<NativeHandle> {
        let entry = self.new_set(layout, writes)?;
        Ok(self.sets.insert(entry))
    }

    fn update_resource_set(&self, set: NativeHandle, writes: &[BindingWrite]) -> GalResult<()> {
        self.update_set(set, writes)
    }

    fn destroy_resource_set(&self, set: NativeHandle) {
        if let Some(entry) = self.sets.remove(set) {
            self.free_set(&entry);
        }
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDescriptor,
    ) -> GalResult<NativeHandle> {
        let entry = self.new_graphics_pipeline(desc)?;
        Ok(self.pipelines.insert(entry))
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDescriptor) -> GalResult<NativeHandle> {
        let entry = self.new_compute_pipeline(desc)?;
        Ok(self.pipelines.insert(entry))
    }

    fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDescriptor,
    ) -> GalResult<NativeHandle> {
        let entry = self.new_ray_tracing_pipeline(desc)?;
        Ok(self.pipelines.insert(entry))
    }

    fn destroy_pipeline(&self, pipeline: NativeHandle) {
        if let Some(entry) = self.pipelines.remove(pipeline) {
            self.free_pipeline(&entry);
        }
    }

    fn acceleration_structure_build_sizes(
        &self,
        input: &AccelerationStructureBuildInput,
    ) -> GalResult<BuildSizes> {
        self.structure_sizes(input)
    }

    fn create_acceleration_structure(
        &self,
        kind: AccelerationStructureKind,
        buffer: NativeHandle,
        size: u64,
    ) -> GalResult<NativeHandle> {
        let entry = self.new_structure(kind, buffer, size)?;
        Ok(self.structures.insert(entry))
    }

    fn acceleration_structure_device_address(
        &self,
        structure: NativeHandle,
    ) -> GalResult<DeviceAddress> {
        self.structures.with(structure, |s| s.address)
    }

    fn destroy_acceleration_structure(&self, structure: NativeHandle) {
        if let Some(entry) = self.structures.remove(structure) {
            self.free_structure(&entry);
        }
    }

    fn submit(&self, submission: &Submission<'_>) -> GalResult<SubmissionToken> {
        let mut delta = BackendStatistics::default();
        let token = self.queues.submit(
            &self.device,
            submission.queue,
            submission.waits,
            |cmd, garbage| {
                delta = self.record_commands(cmd, submission.commands, garbage)?;
                Ok(())
            },
        )?;
        delta.submissions = 1;
        self.add_statistics(&delta);
        log::trace!(
            "submitted {} commands to {:?} as value {}",
            submission.commands.len(),
            token.queue,
            token.value
        );
        Ok(token)
    }

    fn completed_value(&self, queue: QueueKind) -> GalResult<u64> {
        self.queues.completed(&self.device, queue)
    }

    fn wait(&self, token: SubmissionToken, timeout: Option<Duration>) -> GalResult<bool> {
        self.queues.wait(&self.device, token, timeout)
    }

    fn wait_idle(&self) -> GalResult<()> {
        self.queues.wait_idle(&self.device)
    }

    fn create_swapchain(
        &self,
        config: &SwapchainConfig,
        old: Option<NativeHandle>,
    ) -> GalResult<NativeSwapchain> {
        self.new_swapchain(config, old)
    }

    fn acquire_next_image(&self, swapchain: NativeHandle) -> GalResult<u32> {
        self.next_image(swapchain)
    }

    fn present(&self, swapchain: NativeHandle, image: u32, wait: SubmissionToken) -> GalResult<()> {
        self.present_image(swapchain, image, wait)
    }

    fn destroy_swapchain(&self, swapchain: NativeHandle) {
        self.free_swapchain(swapchain);
    }

    fn set_debug_name(&self, kind: ObjectKind, handle: NativeHandle, name: &str) {
        let Some(debug) = &self.debug_utils else {
            return;
        };
        let Some((object_type, object_handle)) = self.raw_object(kind, handle) else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            log::debug!("debug name {name:?} contains a NUL byte; ignored");
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT {
            object_type,
            object_handle,
            p_object_name: name.as_ptr(),
            ..Default::default()
        };
        if let Err(e) = unsafe { debug.set_debug_utils_object_name(&info) } {
            log::debug!("set_debug_utils_object_name failed: {e:?}");
        }
    }

    fn statistics(&self) -> BackendStatistics {
        *lock(&self.stats)
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        if let Err(err) = self.queues.wait_idle(&self.device) {
            log::error!("Vulkan device did not go idle before teardown: {err}");
        }
        self.release_swapchains();
        for entry in self.pipelines.drain() {
            self.free_pipeline(&entry);
        }
        for entry in self.sets.drain() {
            self.free_set(&entry);
        }
        for entry in self.structures.drain() {
            self.free_structure(&entry);
        }
        unsafe {
            for entry in self.layouts.drain() {
                self.device.destroy_descriptor_set_layout(entry.layout, None);
            }
            for entry in self.shaders.drain() {
                self.device.destroy_shader_module(entry.module, None);
            }
            for sampler in self.samplers.drain() {
                self.device.destroy_sampler(sampler, None);
            }
            for entry in self.views.drain() {
                self.device.destroy_image_view(entry.view, None);
            }
        }
        for entry in self.textures.drain() {
            self.free_texture(&entry);
        }
        for entry in self.buffers.drain() {
            self.free_buffer(&entry);
        }
        self.queues.destroy(&self.device);
        unsafe { self.device.destroy_device(None) };
        log::debug!("Vulkan device '{}' destroyed", self.caps.device_name);
    }
}
