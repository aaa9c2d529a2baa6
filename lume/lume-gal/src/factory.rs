//! Construction of every device object.

use std::sync::Arc;

use crate::accel::{BottomLevelAS, BottomLevelASDescriptor, TopLevelAS, TopLevelASDescriptor};
use crate::backend::{NativeHandle, ObjectKind};
use crate::binding::{ResourceLayout, ResourceLayoutDescriptor, ResourceSet, ResourceSetDescriptor};
use crate::buffer::{Buffer, BufferDescriptor};
use crate::device::DeviceShared;
use crate::error::{GalError, GalResult};
use crate::pipeline::{
    ComputePipelineDescriptor, GraphicsPipelineDescriptor, Pipeline, PipelineKind,
    RayTracingPipelineDescriptor,
};
use crate::resource::Resource;
use crate::sampler::{Sampler, SamplerDescriptor};
use crate::shader::{Shader, ShaderStage};
use crate::state::ResourceState;
use crate::swapchain::{Swapchain, SwapchainDescriptor};
use crate::texture::{Texture, TextureDescriptor, TextureView, TextureViewDescriptor};

/// Creates buffers, textures, samplers, shaders, binding objects, pipelines,
/// acceleration structures and swapchains. Cheap to clone.
#[derive(Clone)]
pub struct ResourceFactory {
    device: Arc<DeviceShared>,
}

impl std::fmt::Debug for ResourceFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceFactory")
            .field("device", &self.device)
            .finish()
    }
}

impl ResourceFactory {
    pub(crate) fn new(device: Arc<DeviceShared>) -> Self {
        Self { device }
    }

    pub(crate) fn device(&self) -> &Arc<DeviceShared> {
        &self.device
    }

    fn name_native(&self, kind: ObjectKind, handle: NativeHandle, label: Option<&str>) {
        if let Some(label) = label {
            self.device.backend().set_debug_name(kind, handle, label);
        }
    }

    pub fn create_buffer(&self, desc: &BufferDescriptor) -> GalResult<Arc<Buffer>> {
        let caps = self.device.capabilities();
        desc.validate(caps)?;
        let backend = self.device.backend();
        let handle = backend.create_buffer(desc)?;
        let address = if desc.needs_device_address(caps) {
            match backend.buffer_device_address(handle) {
                Ok(address) => Some(address),
                Err(err) => {
                    backend.destroy_buffer(handle);
                    return Err(err);
                }
            }
        } else {
            None
        };
        self.name_native(ObjectKind::Buffer, handle, desc.label);
        log::debug!(
            "buffer {:?}: {} B {:?}{}",
            desc.label,
            desc.size,
            desc.usage,
            address.map_or(String::new(), |a| format!(" @ {a:#x}"))
        );
        Ok(Arc::new(Buffer::new(
            self.device.clone(),
            handle,
            desc.clone(),
            address,
        )))
    }

    /// Creates a buffer and fills its first `data.len()` bytes through the update path.
    pub fn create_buffer_init(&self, desc: &BufferDescriptor, data: &[u8]) -> GalResult<Arc<Buffer>> {
        if data.len() as u64 > desc.size {
            return Err(GalError::descriptor(format!(
                "{} bytes of initial data for a {} byte buffer",
                data.len(),
                desc.size
            )));
        }
        let buffer = self.create_buffer(desc)?;
        self.device.write_buffer(&buffer, 0, data)?;
        Ok(buffer)
    }

    pub fn create_texture(&self, desc: &TextureDescriptor) -> GalResult<Arc<Texture>> {
        desc.validate(self.device.capabilities())?;
        let handle = self.device.backend().create_texture(desc)?;
        self.name_native(ObjectKind::Texture, handle, desc.label);
        log::debug!(
            "texture {:?}: {}x{}x{} {:?} mips {} layers {} x{}",
            desc.label,
            desc.width,
            desc.height,
            desc.depth,
            desc.format,
            desc.mip_levels,
            desc.array_layers,
            desc.sample_count
        );
        Ok(Arc::new(Texture::new(
            self.device.clone(),
            handle,
            desc.clone(),
            ResourceState::Undefined,
        )))
    }

    pub fn create_texture_view(
        &self,
        texture: &Arc<Texture>,
        desc: &TextureViewDescriptor,
    ) -> GalResult<Arc<TextureView>> {
        texture.base().ensure_alive()?;
        let resolved = desc.resolve(texture.descriptor())?;
        let handle = self
            .device
            .backend()
            .create_texture_view(texture.native(), &resolved)?;
        self.name_native(ObjectKind::TextureView, handle, desc.label);
        Ok(Arc::new(TextureView::new(handle, texture.clone(), resolved)))
    }

    pub fn create_sampler(&self, desc: &SamplerDescriptor) -> GalResult<Arc<Sampler>> {
        desc.validate()?;
        let handle = self.device.backend().create_sampler(desc)?;
        self.name_native(ObjectKind::Sampler, handle, desc.label);
        Ok(Arc::new(Sampler::new(self.device.clone(), handle, desc.clone())))
    }

    /// Wraps compiled bytecode for `stage`. The bytecode is not inspected.
    pub fn create_shader(
        &self,
        stage: ShaderStage,
        bytecode: &[u8],
        entry_point: &str,
    ) -> GalResult<Arc<Shader>> {
        Shader::validate(stage, bytecode, entry_point)?;
        let caps = self.device.capabilities();
        if stage.is_ray_tracing() && !caps.ray_tracing {
            return Err(GalError::UnsupportedCapability(format!(
                "{stage:?} shaders need ray tracing support on '{}'",
                caps.device_name
            )));
        }
        let handle = self
            .device
            .backend()
            .create_shader(stage, bytecode, entry_point)?;
        Ok(Arc::new(Shader::new(
            self.device.clone(),
            handle,
            stage,
            entry_point,
            bytecode.len(),
        )))
    }

    /// Assigns slots in declaration order. Unbounded slots get the configured
    /// bindless capacity, clamped to the device limit.
    pub fn create_resource_layout(
        &self,
        desc: &ResourceLayoutDescriptor,
    ) -> GalResult<Arc<ResourceLayout>> {
        let slots = desc.resolve(
            self.device.capabilities(),
            self.device.config().max_bindless_descriptors,
        )?;
        let handle = self.device.backend().create_resource_layout(&slots)?;
        self.name_native(ObjectKind::ResourceLayout, handle, desc.label);
        Ok(Arc::new(ResourceLayout::new(
            self.device.clone(),
            handle,
            desc.clone(),
            slots,
        )))
    }

    /// Fails with `BindingMismatch` when an entry's count or kind does not match
    /// its layout slot.
    pub fn create_resource_set(&self, desc: &ResourceSetDescriptor) -> GalResult<Arc<ResourceSet>> {
        let (bound, writes) = desc.resolve()?;
        let handle = self
            .device
            .backend()
            .create_resource_set(desc.layout.native(), &writes)?;
        self.name_native(ObjectKind::ResourceSet, handle, desc.label);
        Ok(Arc::new(ResourceSet::new(
            self.device.clone(),
            handle,
            desc.label,
            desc.layout.clone(),
            bound,
        )))
    }

    /// Creates a graphics pipeline. Its outputs are checked against a framebuffer
    /// the first time it is bound inside a render pass.
    pub fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDescriptor,
    ) -> GalResult<Arc<Pipeline>> {
        desc.validate(self.device.capabilities())?;
        let handle = self.device.backend().create_graphics_pipeline(desc)?;
        self.name_native(ObjectKind::Pipeline, handle, desc.label);
        let shaders = std::iter::once(desc.vertex_shader.clone())
            .chain(desc.fragment_shader.clone())
            .collect();
        Ok(Arc::new(Pipeline::new(
            self.device.clone(),
            handle,
            PipelineKind::Graphics,
            desc.label,
            desc.layouts.clone(),
            Some(desc.outputs.clone()),
            shaders,
        )))
    }

    pub fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDescriptor,
    ) -> GalResult<Arc<Pipeline>> {
        desc.validate()?;
        let handle = self.device.backend().create_compute_pipeline(desc)?;
        self.name_native(ObjectKind::Pipeline, handle, desc.label);
        Ok(Arc::new(Pipeline::new(
            self.device.clone(),
            handle,
            PipelineKind::Compute,
            desc.label,
            desc.layouts.clone(),
            None,
            vec![desc.shader.clone()],
        )))
    }

    /// Creates a ray tracing pipeline together with its shader binding table.
    pub fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDescriptor,
    ) -> GalResult<Arc<Pipeline>> {
        desc.validate(self.device.capabilities())?;
        let handle = self.device.backend().create_ray_tracing_pipeline(desc)?;
        self.name_native(ObjectKind::Pipeline, handle, desc.label);
        Ok(Arc::new(Pipeline::new(
            self.device.clone(),
            handle,
            PipelineKind::RayTracing,
            desc.label,
            desc.layouts.clone(),
            None,
            desc.shaders.clone(),
        )))
    }

    /// Builds a bottom-level structure. Blocks until the build has completed.
    pub fn create_bottom_level_as(
        &self,
        desc: &BottomLevelASDescriptor,
    ) -> GalResult<Arc<BottomLevelAS>> {
        BottomLevelAS::build(self, desc).map(Arc::new)
    }

    /// Builds a top-level structure. Blocks until the build has completed.
    pub fn create_top_level_as(&self, desc: &TopLevelASDescriptor) -> GalResult<Arc<TopLevelAS>> {
        TopLevelAS::build(self, desc).map(Arc::new)
    }

    pub fn create_swapchain(&self, desc: SwapchainDescriptor) -> GalResult<Swapchain> {
        Swapchain::new(self.clone(), desc)
    }
}
