//! Shader modules, pipeline layouts and the pipelines built from them.

mod compute;
mod graphics;
mod ray_tracing;

use std::ffi::CString;
use std::sync::Arc;

use ash::vk;

use crate::binding::ResourceLayout;
use crate::error::{GalError, GalResult};
use crate::pipeline::{CompareOp, PipelineKind};
use crate::shader::{Shader, ShaderStage};

use super::{vk_error, VulkanBackend};

pub(super) use graphics::vertex_format_to_vk;
pub(super) use ray_tracing::ShaderBindingTable;

const SPIRV_MAGIC: u32 = 0x0723_0203;

#[derive(Debug, Clone)]
pub(super) struct ShaderEntry {
    pub module: vk::ShaderModule,
    pub stage: ShaderStage,
    pub entry_point: CString,
}

#[derive(Debug, Clone)]
pub(super) struct PipelineEntry {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub kind: PipelineKind,
    /// Compatible pass a graphics pipeline was created against.
    pub render_pass: Option<vk::RenderPass>,
    pub sbt: Option<ShaderBindingTable>,
}

pub(super) fn bind_point(kind: PipelineKind) -> vk::PipelineBindPoint {
    match kind {
        PipelineKind::Graphics => vk::PipelineBindPoint::GRAPHICS,
        PipelineKind::Compute => vk::PipelineBindPoint::COMPUTE,
        PipelineKind::RayTracing => vk::PipelineBindPoint::RAY_TRACING_KHR,
    }
}

pub(super) fn shader_stage_to_vk(stage: ShaderStage) -> vk::ShaderStageFlags {
    match stage {
        ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
        ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        ShaderStage::RayGeneration => vk::ShaderStageFlags::RAYGEN_KHR,
        ShaderStage::Miss => vk::ShaderStageFlags::MISS_KHR,
        ShaderStage::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        ShaderStage::AnyHit => vk::ShaderStageFlags::ANY_HIT_KHR,
        ShaderStage::Intersection => vk::ShaderStageFlags::INTERSECTION_KHR,
        ShaderStage::Callable => vk::ShaderStageFlags::CALLABLE_KHR,
    }
}

pub(super) fn compare_op_to_vk(o: CompareOp) -> vk::CompareOp {
    match o {
        CompareOp::Never => vk::CompareOp::NEVER,
        CompareOp::Less => vk::CompareOp::LESS,
        CompareOp::Equal => vk::CompareOp::EQUAL,
        CompareOp::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareOp::Greater => vk::CompareOp::GREATER,
        CompareOp::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareOp::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareOp::Always => vk::CompareOp::ALWAYS,
    }
}

/// SPIR-V words of `bytecode`, which must be whole little-endian words starting
/// with the SPIR-V magic number.
fn spirv_words(bytecode: &[u8]) -> GalResult<Vec<u32>> {
    if bytecode.len() % 4 != 0 {
        return Err(GalError::descriptor(format!(
            "SPIR-V must be 4-byte aligned, got {} bytes",
            bytecode.len()
        )));
    }
    let words: Vec<u32> = bytecode
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    if words.first() != Some(&SPIRV_MAGIC) {
        return Err(GalError::descriptor("bytecode is not SPIR-V"));
    }
    Ok(words)
}

/// Build failures the driver reports for otherwise valid input.
fn pipeline_error(what: &str, err: vk::Result) -> GalError {
    match err {
        vk::Result::ERROR_INVALID_SHADER_NV => GalError::descriptor(format!("{what}: invalid shader")),
        other => vk_error(what, other),
    }
}

impl VulkanBackend {
    pub(super) fn new_shader(
        &self,
        stage: ShaderStage,
        bytecode: &[u8],
        entry_point: &str,
    ) -> GalResult<ShaderEntry> {
        if stage.is_ray_tracing() && !self.caps.ray_tracing {
            return Err(GalError::UnsupportedCapability(format!(
                "{stage:?} shaders need ray tracing pipelines on '{}'",
                self.caps.device_name
            )));
        }
        let words = spirv_words(bytecode)?;
        let entry_point = CString::new(entry_point)
            .map_err(|e| GalError::descriptor(format!("entry point: {e}")))?;
        let create_info = vk::ShaderModuleCreateInfo::default().code(&words);
        let module = unsafe { self.device.create_shader_module(&create_info, None) }
            .map_err(|e| pipeline_error("create_shader_module", e))?;
        Ok(ShaderEntry {
            module,
            stage,
            entry_point,
        })
    }

    pub(super) fn shader(&self, shader: &Arc<Shader>) -> GalResult<ShaderEntry> {
        self.shaders.get(shader.native())
    }

    /// Pipeline layout over `layouts` in set order.
    fn pipeline_layout(&self, layouts: &[Arc<ResourceLayout>]) -> GalResult<vk::PipelineLayout> {
        let set_layouts = layouts
            .iter()
            .map(|l| self.layouts.with(l.native(), |entry| entry.layout))
            .collect::<GalResult<Vec<_>>>()?;
        let create_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        unsafe { self.device.create_pipeline_layout(&create_info, None) }
            .map_err(|e| vk_error("create_pipeline_layout", e))
    }

    pub(super) fn free_pipeline(&self, entry: &PipelineEntry) {
        unsafe {
            self.device.destroy_pipeline(entry.pipeline, None);
            self.device.destroy_pipeline_layout(entry.layout, None);
            if let Some(pass) = entry.render_pass {
                self.device.destroy_render_pass(pass, None);
            }
            if let Some(sbt) = &entry.sbt {
                self.device.destroy_buffer(sbt.buffer, None);
                self.device.free_memory(sbt.memory, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spirv_needs_whole_words_and_the_magic_number() {
        assert!(spirv_words(&[0x03, 0x02, 0x23]).is_err());
        assert!(spirv_words(&[1, 2, 3, 4]).is_err());
        let words = spirv_words(&[0x03, 0x02, 0x23, 0x07, 0, 0, 1, 0]).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0000]);
    }

    #[test]
    fn ray_tracing_stages_map_to_khr_bits() {
        assert_eq!(
            shader_stage_to_vk(ShaderStage::RayGeneration),
            vk::ShaderStageFlags::RAYGEN_KHR
        );
        assert_eq!(bind_point(PipelineKind::RayTracing), vk::PipelineBindPoint::RAY_TRACING_KHR);
        assert_eq!(compare_op_to_vk(CompareOp::LessOrEqual), vk::CompareOp::LESS_OR_EQUAL);
    }
}
