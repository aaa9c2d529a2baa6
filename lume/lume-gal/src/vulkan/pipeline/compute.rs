//! Vulkan compute pipeline creation.

use ash::vk;

use crate::error::GalResult;
use crate::pipeline::{ComputePipelineDescriptor, PipelineKind};

use super::{pipeline_error, PipelineEntry};
use crate::vulkan::VulkanBackend;

impl VulkanBackend {
    pub(in crate::vulkan) fn new_compute_pipeline(
        &self,
        desc: &ComputePipelineDescriptor,
    ) -> GalResult<PipelineEntry> {
        let shader = self.shader(&desc.shader)?;
        let layout = self.pipeline_layout(&desc.layouts)?;
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader.module)
            .name(&shader.entry_point);
        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);
        let created = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
        };
        let pipeline = match created {
            Ok(pipelines) => pipelines.first().copied(),
            Err((_, e)) => {
                unsafe { self.device.destroy_pipeline_layout(layout, None) };
                return Err(pipeline_error("create_compute_pipelines", e));
            }
        };
        let Some(pipeline) = pipeline else {
            unsafe { self.device.destroy_pipeline_layout(layout, None) };
            return Err(crate::error::GalError::Backend("no compute pipeline created".into()));
        };
        log::debug!("compute pipeline {:?} created", desc.label);
        Ok(PipelineEntry {
            pipeline,
            layout,
            kind: PipelineKind::Compute,
            render_pass: None,
            sbt: None,
        })
    }
}
