//! Lume GAL: backend-agnostic GPU abstraction layer.
//!
//! One object model for buffers, textures, samplers, shaders, resource layouts and
//! sets (including bindless arrays), pipelines, ray tracing acceleration structures,
//! state-tracked command buffers and swapchains, implemented over a native
//! [`Backend`] chosen once when the [`GraphicsContext`] is created.
//!
//! ```no_run
//! use lume_gal::{BackendKind, BufferDescriptor, BufferUsage, GraphicsContext};
//!
//! # fn main() -> lume_gal::GalResult<()> {
//! let context = GraphicsContext::create(BackendKind::Headless)?;
//! let device = context.create_device()?;
//! let buffer = device
//!     .factory()
//!     .create_buffer(&BufferDescriptor::new(48, BufferUsage::VERTEX))?;
//! buffer.write(0, &[0u8; 48])?;
//! # Ok(())
//! # }
//! ```
//!
//! Backends: `vulkan` (feature `vulkan`, default) and `headless`, which runs every
//! command in host memory and needs no GPU.

pub mod accel;
pub mod arena;
pub mod backend;
pub mod binding;
pub mod buffer;
pub mod command;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod factory;
pub mod format;
pub mod headless;
pub mod pipeline;
pub mod processor;
pub mod resource;
pub mod sampler;
pub mod shader;
pub mod state;
pub mod swapchain;
pub mod texture;

#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use accel::{
    AabbGeometry, AccelerationStructureFlags, BottomLevelAS, BottomLevelASDescriptor, BuildSizes,
    Geometry, GeometryFlags, Instance, InstanceFlags, InstanceRecord, TopLevelAS,
    TopLevelASDescriptor, Transform3x4, TriangleGeometry, IDENTITY_TRANSFORM,
};
pub use arena::{ArenaBlock, MemoryArena, TypedBlock};
pub use backend::{Backend, BackendStatistics, DeviceAddress, NativeHandle};
pub use binding::{
    BindingCount, BindingResource, BufferBinding, ResourceKind, ResourceLayout,
    ResourceLayoutDescriptor, ResourceLayoutElement, ResourceSet, ResourceSetDescriptor, SetEntry,
};
pub use buffer::{Buffer, BufferDescriptor, BufferUsage};
pub use command::{
    ColorAttachment, CommandBuffer, CommandBufferState, DepthAttachment, LoadOp,
    RenderPassDescriptor, ScissorRect, StoreOp, Viewport,
};
pub use config::{ContextConfig, HeadlessProfile};
pub use context::{AdapterInfo, AdapterKind, BackendKind, Capabilities, GraphicsContext};
pub use device::Device;
pub use error::{GalError, GalResult};
pub use factory::ResourceFactory;
pub use format::{IndexFormat, TextureAspect, TextureFormat, VertexFormat};
pub use pipeline::{
    BlendState, ColorTargetState, ComputePipelineDescriptor, DepthStencilState,
    GraphicsPipelineDescriptor, HitGroup, OutputDescription, Pipeline, PipelineKind,
    PrimitiveTopology, RasterizationState, RayTracingPipelineDescriptor, VertexAttribute,
    VertexBinding, VertexInputLayout, VertexInputRate,
};
pub use processor::CommandProcessor;
pub use resource::{Resource, ResourceId};
pub use sampler::{AddressMode, FilterMode, Sampler, SamplerDescriptor};
pub use shader::{Shader, ShaderStage, ShaderStages};
pub use state::{QueueKind, ResourceState, SubmissionToken};
#[cfg(feature = "window")]
pub use swapchain::WindowSurface;
pub use swapchain::{Swapchain, SwapchainDescriptor, SwapchainState, SurfaceTarget};
pub use texture::{
    Texture, TextureDescriptor, TextureDimension, TextureRegion, TextureUsage, TextureView,
    TextureViewDescriptor, TextureViewDimension,
};
