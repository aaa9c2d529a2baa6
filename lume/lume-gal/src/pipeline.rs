//! Graphics, compute and ray tracing pipelines.
//!
//! Pipelines are immutable once created. A graphics pipeline records the
//! [`OutputDescription`] it renders into; compatibility with the framebuffer it is
//! used against is only known at bind time and is checked there.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::backend::{NativeHandle, ObjectKind};
use crate::binding::ResourceLayout;
use crate::context::Capabilities;
use crate::device::DeviceShared;
use crate::error::{GalError, GalResult};
use crate::format::{TextureFormat, VertexFormat};
use crate::resource::{Resource, ResourceBase};
use crate::shader::{Shader, ShaderStage};

/// Attachment formats and sample count a pipeline renders into. The compatibility
/// contract between framebuffers (or the swapchain) and graphics pipelines.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputDescription {
    pub color_formats: Vec<TextureFormat>,
    pub depth_format: Option<TextureFormat>,
    pub sample_count: u32,
}

impl Default for OutputDescription {
    fn default() -> Self {
        Self {
            color_formats: Vec::new(),
            depth_format: None,
            sample_count: 1,
        }
    }
}

impl OutputDescription {
    pub fn new(color_formats: Vec<TextureFormat>, depth_format: Option<TextureFormat>) -> Self {
        Self {
            color_formats,
            depth_format,
            sample_count: 1,
        }
    }

    pub fn is_compatible(&self, other: &OutputDescription) -> bool {
        self == other
    }

    fn validate(&self, caps: &Capabilities) -> GalResult<()> {
        if let Some(format) = self.color_formats.iter().find(|f| f.is_depth()) {
            return Err(GalError::descriptor(format!(
                "depth format {format:?} listed as a color output"
            )));
        }
        if let Some(format) = self.depth_format.filter(|f| !f.is_depth()) {
            return Err(GalError::descriptor(format!(
                "color format {format:?} listed as the depth output"
            )));
        }
        if self.sample_count == 0
            || !self.sample_count.is_power_of_two()
            || self.sample_count > caps.max_sample_count
        {
            return Err(GalError::UnsupportedUsage(format!(
                "output sample count {} not supported",
                self.sample_count
            )));
        }
        Ok(())
    }
}

impl fmt::Display for OutputDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.color_formats)?;
        if let Some(depth) = self.depth_format {
            write!(f, "+{depth:?}")?;
        }
        write!(f, " x{}", self.sample_count)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VertexInputLayout {
    pub bindings: Vec<VertexBinding>,
    pub attributes: Vec<VertexAttribute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: VertexInputRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VertexInputRate {
    #[default]
    Vertex,
    Instance,
}

impl VertexInputLayout {
    fn validate(&self) -> GalResult<()> {
        for (i, binding) in self.bindings.iter().enumerate() {
            if self.bindings[..i].iter().any(|b| b.binding == binding.binding) {
                return Err(GalError::descriptor(format!(
                    "vertex binding {} declared twice",
                    binding.binding
                )));
            }
        }
        for (i, attribute) in self.attributes.iter().enumerate() {
            if self.attributes[..i]
                .iter()
                .any(|a| a.location == attribute.location)
            {
                return Err(GalError::descriptor(format!(
                    "vertex location {} declared twice",
                    attribute.location
                )));
            }
            let binding = self
                .bindings
                .iter()
                .find(|b| b.binding == attribute.binding)
                .ok_or_else(|| {
                    GalError::descriptor(format!(
                        "vertex location {} reads undeclared binding {}",
                        attribute.location, attribute.binding
                    ))
                })?;
            if binding.stride != 0 && attribute.offset + attribute.format.size() > binding.stride {
                return Err(GalError::descriptor(format!(
                    "vertex location {} ({:?} at offset {}) overruns stride {}",
                    attribute.location, attribute.format, attribute.offset, binding.stride
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrimitiveTopology {
    #[default]
    TriangleList,
    TriangleStrip,
    LineList,
    LineStrip,
    PointList,
}

#[derive(Debug, Clone, Default)]
pub struct RasterizationState {
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub polygon_mode: PolygonMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CullMode {
    None,
    #[default]
    Back,
    Front,
    FrontAndBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrontFace {
    #[default]
    CounterClockwise,
    Clockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolygonMode {
    #[default]
    Fill,
    Line,
    Point,
}

/// Blending for one color output. The format comes from the pipeline's outputs.
#[derive(Debug, Clone, Default)]
pub struct ColorTargetState {
    pub blend: Option<BlendState>,
}

#[derive(Debug, Clone)]
pub struct BlendState {
    pub color: BlendComponent,
    pub alpha: BlendComponent,
}

impl BlendState {
    pub const ALPHA_BLENDING: BlendState = BlendState {
        color: BlendComponent {
            src_factor: BlendFactor::SrcAlpha,
            dst_factor: BlendFactor::OneMinusSrcAlpha,
            operation: BlendOp::Add,
        },
        alpha: BlendComponent {
            src_factor: BlendFactor::One,
            dst_factor: BlendFactor::OneMinusSrcAlpha,
            operation: BlendOp::Add,
        },
    };
}

#[derive(Debug, Clone, Copy)]
pub struct BlendComponent {
    pub src_factor: BlendFactor,
    pub dst_factor: BlendFactor,
    pub operation: BlendOp,
}

#[derive(Debug, Clone, Copy)]
pub enum BlendFactor {
    One,
    Zero,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
}

#[derive(Debug, Clone, Copy)]
pub enum BlendOp {
    Add,
    Subtract,
    Min,
    Max,
}

/// Depth test state. The format comes from the pipeline's outputs.
#[derive(Debug, Clone)]
pub struct DepthStencilState {
    pub depth_write_enabled: bool,
    pub depth_compare: CompareOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Debug, Clone)]
pub struct GraphicsPipelineDescriptor {
    pub label: Option<&'static str>,
    pub vertex_shader: Arc<Shader>,
    pub fragment_shader: Option<Arc<Shader>>,
    pub vertex_input: VertexInputLayout,
    pub primitive_topology: PrimitiveTopology,
    pub rasterization: RasterizationState,
    /// One entry per color output, in output order.
    pub color_targets: Vec<ColorTargetState>,
    pub depth_stencil: Option<DepthStencilState>,
    pub outputs: OutputDescription,
    /// Resource layouts in binding-set order.
    pub layouts: Vec<Arc<ResourceLayout>>,
}

impl GraphicsPipelineDescriptor {
    pub(crate) fn validate(&self, caps: &Capabilities) -> GalResult<()> {
        self.vertex_shader.expect_stage(ShaderStage::Vertex)?;
        if let Some(fragment) = &self.fragment_shader {
            fragment.expect_stage(ShaderStage::Fragment)?;
        }
        self.vertex_input.validate()?;
        self.outputs.validate(caps)?;
        if self.color_targets.len() != self.outputs.color_formats.len() {
            return Err(GalError::descriptor(format!(
                "{} color target states for {} color outputs",
                self.color_targets.len(),
                self.outputs.color_formats.len()
            )));
        }
        if self.depth_stencil.is_some() && self.outputs.depth_format.is_none() {
            return Err(GalError::descriptor(
                "depth-stencil state given but outputs have no depth format",
            ));
        }
        check_layouts(&self.layouts)
    }
}

#[derive(Debug, Clone)]
pub struct ComputePipelineDescriptor {
    pub label: Option<&'static str>,
    pub shader: Arc<Shader>,
    pub layouts: Vec<Arc<ResourceLayout>>,
}

impl ComputePipelineDescriptor {
    pub(crate) fn validate(&self) -> GalResult<()> {
        self.shader.expect_stage(ShaderStage::Compute)?;
        check_layouts(&self.layouts)
    }
}

/// Shaders forming one hit group, as indices into `RayTracingPipelineDescriptor::shaders`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HitGroup {
    pub closest_hit: Option<u32>,
    pub any_hit: Option<u32>,
    /// Present for procedural (AABB) geometry.
    pub intersection: Option<u32>,
}

/// Smallest ray hit attribute limit every ray tracing device guarantees.
pub const MAX_RAY_HIT_ATTRIBUTE_SIZE: u32 = 32;

#[derive(Debug, Clone)]
pub struct RayTracingPipelineDescriptor {
    pub label: Option<&'static str>,
    pub shaders: Vec<Arc<Shader>>,
    pub ray_generation: u32,
    pub miss: Vec<u32>,
    pub hit_groups: Vec<HitGroup>,
    pub max_recursion_depth: u32,
    pub max_payload_size: u32,
    pub max_attribute_size: u32,
    pub layouts: Vec<Arc<ResourceLayout>>,
}

impl RayTracingPipelineDescriptor {
    pub(crate) fn validate(&self, caps: &Capabilities) -> GalResult<()> {
        if !caps.ray_tracing {
            return Err(GalError::UnsupportedCapability(format!(
                "ray tracing pipelines are not supported on '{}'",
                caps.device_name
            )));
        }
        if self.max_recursion_depth == 0 || self.max_recursion_depth > caps.max_ray_recursion_depth
        {
            return Err(GalError::UnsupportedUsage(format!(
                "recursion depth {} outside 1..={}",
                self.max_recursion_depth, caps.max_ray_recursion_depth
            )));
        }
        if self.max_attribute_size > MAX_RAY_HIT_ATTRIBUTE_SIZE {
            return Err(GalError::UnsupportedUsage(format!(
                "hit attribute size {} exceeds {MAX_RAY_HIT_ATTRIBUTE_SIZE} bytes",
                self.max_attribute_size
            )));
        }
        self.shader(self.ray_generation, ShaderStage::RayGeneration)?;
        for &miss in &self.miss {
            self.shader(miss, ShaderStage::Miss)?;
        }
        for group in &self.hit_groups {
            if group.closest_hit.is_none() && group.any_hit.is_none() && group.intersection.is_none()
            {
                return Err(GalError::descriptor("hit group references no shader"));
            }
            if let Some(index) = group.closest_hit {
                self.shader(index, ShaderStage::ClosestHit)?;
            }
            if let Some(index) = group.any_hit {
                self.shader(index, ShaderStage::AnyHit)?;
            }
            if let Some(index) = group.intersection {
                self.shader(index, ShaderStage::Intersection)?;
            }
        }
        check_layouts(&self.layouts)
    }

    fn shader(&self, index: u32, stage: ShaderStage) -> GalResult<&Arc<Shader>> {
        let shader = self.shaders.get(index as usize).ok_or_else(|| {
            GalError::descriptor(format!(
                "shader index {index} out of range ({} shaders)",
                self.shaders.len()
            ))
        })?;
        shader.expect_stage(stage)?;
        Ok(shader)
    }

    /// Shader groups in table order: ray generation, misses, then hit groups.
    pub fn group_count(&self) -> u32 {
        1 + self.miss.len() as u32 + self.hit_groups.len() as u32
    }
}

fn check_layouts(layouts: &[Arc<ResourceLayout>]) -> GalResult<()> {
    for layout in layouts {
        layout.base().ensure_alive()?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    Graphics,
    Compute,
    RayTracing,
}

/// Immutable compiled pipeline state.
pub struct Pipeline {
    base: ResourceBase,
    device: Arc<DeviceShared>,
    handle: NativeHandle,
    kind: PipelineKind,
    layouts: Vec<Arc<ResourceLayout>>,
    outputs: Option<OutputDescription>,
    /// Framebuffer outputs already accepted at a previous bind.
    accepted: Mutex<Option<OutputDescription>>,
    _shaders: Vec<Arc<Shader>>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.base.id())
            .field("kind", &self.kind)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub(crate) fn new(
        device: Arc<DeviceShared>,
        handle: NativeHandle,
        kind: PipelineKind,
        label: Option<&'static str>,
        layouts: Vec<Arc<ResourceLayout>>,
        outputs: Option<OutputDescription>,
        shaders: Vec<Arc<Shader>>,
    ) -> Self {
        Self {
            base: ResourceBase::new("pipeline", label),
            device,
            handle,
            kind,
            layouts,
            outputs,
            accepted: Mutex::new(None),
            _shaders: shaders,
        }
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    pub fn layouts(&self) -> &[Arc<ResourceLayout>] {
        &self.layouts
    }

    /// Outputs of a graphics pipeline.
    pub fn outputs(&self) -> Option<&OutputDescription> {
        self.outputs.as_ref()
    }

    pub(crate) fn native(&self) -> NativeHandle {
        self.handle
    }

    /// Checks the pipeline against the framebuffer it is being bound for.
    pub(crate) fn check_outputs(&self, framebuffer: &OutputDescription) -> GalResult<()> {
        let Some(outputs) = &self.outputs else {
            return Ok(());
        };
        let mut accepted = self.accepted.lock().unwrap_or_else(|e| e.into_inner());
        if accepted.as_ref() == Some(framebuffer) {
            return Ok(());
        }
        if !outputs.is_compatible(framebuffer) {
            return Err(GalError::PipelineOutputMismatch {
                pipeline: outputs.to_string(),
                framebuffer: framebuffer.to_string(),
            });
        }
        *accepted = Some(framebuffer.clone());
        Ok(())
    }
}

impl Resource for Pipeline {
    fn base(&self) -> &ResourceBase {
        &self.base
    }

    fn dispose(&self) {
        if self.base.begin_dispose() {
            self.device.wait_for_usage(&self.base);
            self.device.backend().destroy_pipeline(self.handle);
        }
    }

    fn set_name(&self, name: &str) {
        self.base.set_name(name);
        self.device
            .backend()
            .set_debug_name(ObjectKind::Pipeline, self.handle, name);
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_checks_bindings_and_strides() {
        let mut layout = VertexInputLayout {
            bindings: vec![VertexBinding {
                binding: 0,
                stride: 16,
                input_rate: VertexInputRate::Vertex,
            }],
            attributes: vec![VertexAttribute {
                location: 0,
                binding: 0,
                format: VertexFormat::Float32x3,
                offset: 0,
            }],
        };
        assert!(layout.validate().is_ok());

        layout.attributes.push(VertexAttribute {
            location: 1,
            binding: 0,
            format: VertexFormat::Float32x2,
            offset: 12,
        });
        assert!(layout.validate().is_err());

        layout.attributes[1].binding = 3;
        layout.attributes[1].offset = 0;
        assert!(layout.validate().is_err());
    }

    #[test]
    fn output_description_display() {
        let outputs = OutputDescription::new(
            vec![TextureFormat::Bgra8Unorm],
            Some(TextureFormat::D32Float),
        );
        assert_eq!(outputs.to_string(), "[Bgra8Unorm]+D32Float x1");
        assert!(outputs.is_compatible(&outputs.clone()));
        let msaa = OutputDescription {
            sample_count: 4,
            ..outputs.clone()
        };
        assert!(!outputs.is_compatible(&msaa));
    }
}
