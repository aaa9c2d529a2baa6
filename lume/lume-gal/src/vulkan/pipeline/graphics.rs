//! Vulkan graphics pipeline creation.

use ash::vk;

use crate::error::{GalError, GalResult};
use crate::format::VertexFormat;
use crate::pipeline::{
    BlendFactor, BlendOp, BlendState, CullMode, FrontFace, GraphicsPipelineDescriptor,
    PipelineKind, PolygonMode, PrimitiveTopology, VertexInputLayout, VertexInputRate,
};

use super::{compare_op_to_vk, pipeline_error, PipelineEntry};
use crate::vulkan::render_pass::compatible_render_pass;
use crate::vulkan::texture::sample_count_to_vk;
use crate::vulkan::VulkanBackend;

pub(in crate::vulkan) fn vertex_format_to_vk(f: VertexFormat) -> vk::Format {
    match f {
        VertexFormat::Float32 => vk::Format::R32_SFLOAT,
        VertexFormat::Float32x2 => vk::Format::R32G32_SFLOAT,
        VertexFormat::Float32x3 => vk::Format::R32G32B32_SFLOAT,
        VertexFormat::Float32x4 => vk::Format::R32G32B32A32_SFLOAT,
        VertexFormat::Float16x2 => vk::Format::R16G16_SFLOAT,
        VertexFormat::Float16x4 => vk::Format::R16G16B16A16_SFLOAT,
        VertexFormat::Snorm16x2 => vk::Format::R16G16_SNORM,
        VertexFormat::Snorm16x4 => vk::Format::R16G16B16A16_SNORM,
        VertexFormat::Unorm8x4 => vk::Format::R8G8B8A8_UNORM,
        VertexFormat::Uint32 => vk::Format::R32_UINT,
        VertexFormat::Uint32x2 => vk::Format::R32G32_UINT,
        VertexFormat::Uint32x3 => vk::Format::R32G32B32_UINT,
        VertexFormat::Uint32x4 => vk::Format::R32G32B32A32_UINT,
        VertexFormat::Sint32 => vk::Format::R32_SINT,
    }
}

fn vertex_input_descriptions(
    layout: &VertexInputLayout,
) -> (
    Vec<vk::VertexInputBindingDescription>,
    Vec<vk::VertexInputAttributeDescription>,
) {
    let bindings = layout
        .bindings
        .iter()
        .map(|b| {
            vk::VertexInputBindingDescription::default()
                .binding(b.binding)
                .stride(b.stride)
                .input_rate(match b.input_rate {
                    VertexInputRate::Vertex => vk::VertexInputRate::VERTEX,
                    VertexInputRate::Instance => vk::VertexInputRate::INSTANCE,
                })
        })
        .collect();
    let attributes = layout
        .attributes
        .iter()
        .map(|a| {
            vk::VertexInputAttributeDescription::default()
                .location(a.location)
                .binding(a.binding)
                .format(vertex_format_to_vk(a.format))
                .offset(a.offset)
        })
        .collect();
    (bindings, attributes)
}

fn topology_to_vk(t: PrimitiveTopology) -> vk::PrimitiveTopology {
    match t {
        PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
        PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
    }
}

fn polygon_mode_to_vk(p: PolygonMode) -> vk::PolygonMode {
    match p {
        PolygonMode::Fill => vk::PolygonMode::FILL,
        PolygonMode::Line => vk::PolygonMode::LINE,
        PolygonMode::Point => vk::PolygonMode::POINT,
    }
}

fn cull_mode_to_vk(c: CullMode) -> vk::CullModeFlags {
    match c {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Back => vk::CullModeFlags::BACK,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::FrontAndBack => vk::CullModeFlags::FRONT_AND_BACK,
    }
}

fn front_face_to_vk(f: FrontFace) -> vk::FrontFace {
    match f {
        FrontFace::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
        FrontFace::Clockwise => vk::FrontFace::CLOCKWISE,
    }
}

fn blend_factor_to_vk(f: BlendFactor) -> vk::BlendFactor {
    match f {
        BlendFactor::One => vk::BlendFactor::ONE,
        BlendFactor::Zero => vk::BlendFactor::ZERO,
        BlendFactor::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
        BlendFactor::OneMinusSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        BlendFactor::DstAlpha => vk::BlendFactor::DST_ALPHA,
        BlendFactor::OneMinusDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
    }
}

fn blend_op_to_vk(o: BlendOp) -> vk::BlendOp {
    match o {
        BlendOp::Add => vk::BlendOp::ADD,
        BlendOp::Subtract => vk::BlendOp::SUBTRACT,
        BlendOp::Min => vk::BlendOp::MIN,
        BlendOp::Max => vk::BlendOp::MAX,
    }
}

fn blend_attachment(blend: Option<&BlendState>) -> vk::PipelineColorBlendAttachmentState {
    let state = vk::PipelineColorBlendAttachmentState::default()
        .color_write_mask(vk::ColorComponentFlags::RGBA);
    match blend {
        None => state.blend_enable(false),
        Some(b) => state
            .blend_enable(true)
            .src_color_blend_factor(blend_factor_to_vk(b.color.src_factor))
            .dst_color_blend_factor(blend_factor_to_vk(b.color.dst_factor))
            .color_blend_op(blend_op_to_vk(b.color.operation))
            .src_alpha_blend_factor(blend_factor_to_vk(b.alpha.src_factor))
            .dst_alpha_blend_factor(blend_factor_to_vk(b.alpha.dst_factor))
            .alpha_blend_op(blend_op_to_vk(b.alpha.operation)),
    }
}

impl VulkanBackend {
    pub(in crate::vulkan) fn new_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDescriptor,
    ) -> GalResult<PipelineEntry> {
        let vertex = self.shader(&desc.vertex_shader)?;
        let fragment = desc
            .fragment_shader
            .as_ref()
            .map(|s| self.shader(s))
            .transpose()?;

        let mut stages = vec![vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vertex.module)
            .name(&vertex.entry_point)];
        if let Some(fragment) = &fragment {
            stages.push(
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(vk::ShaderStageFlags::FRAGMENT)
                    .module(fragment.module)
                    .name(&fragment.entry_point),
            );
        }

        let (binding_descriptions, attribute_descriptions) =
            vertex_input_descriptions(&desc.vertex_input);
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&binding_descriptions)
            .vertex_attribute_descriptions(&attribute_descriptions);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(topology_to_vk(desc.primitive_topology))
            .primitive_restart_enable(false);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(polygon_mode_to_vk(desc.rasterization.polygon_mode))
            .line_width(1.0)
            .cull_mode(cull_mode_to_vk(desc.rasterization.cull_mode))
            .front_face(front_face_to_vk(desc.rasterization.front_face))
            .depth_bias_enable(false);
        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(sample_count_to_vk(desc.outputs.sample_count));
        let color_blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = desc
            .color_targets
            .iter()
            .map(|t| blend_attachment(t.blend.as_ref()))
            .collect();
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);
        let depth_stencil = match &desc.depth_stencil {
            Some(ds) => vk::PipelineDepthStencilStateCreateInfo::default()
                .depth_test_enable(true)
                .depth_write_enable(ds.depth_write_enabled)
                .depth_compare_op(compare_op_to_vk(ds.depth_compare))
                .depth_bounds_test_enable(false)
                .stencil_test_enable(false),
            None => vk::PipelineDepthStencilStateCreateInfo::default()
                .depth_test_enable(false)
                .depth_write_enable(false)
                .stencil_test_enable(false),
        };
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let render_pass = compatible_render_pass(&self.device, &desc.outputs)?;
        let layout = match self.pipeline_layout(&desc.layouts) {
            Ok(layout) => layout,
            Err(err) => {
                unsafe { self.device.destroy_render_pass(render_pass, None) };
                return Err(err);
            }
        };
        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .color_blend_state(&color_blend)
            .depth_stencil_state(&depth_stencil)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0);
        let created = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, e)| pipeline_error("create_graphics_pipelines", e))
        .and_then(|pipelines| {
            pipelines
                .first()
                .copied()
                .ok_or_else(|| GalError::Backend("no graphics pipeline created".into()))
        });
        let pipeline = match created {
            Ok(pipeline) => pipeline,
            Err(err) => {
                unsafe {
                    self.device.destroy_pipeline_layout(layout, None);
                    self.device.destroy_render_pass(render_pass, None);
                }
                return Err(err);
            }
        };
        log::debug!(
            "graphics pipeline {:?} created for outputs {}",
            desc.label,
            desc.outputs
        );
        Ok(PipelineEntry {
            pipeline,
            layout,
            kind: PipelineKind::Graphics,
            render_pass: Some(render_pass),
            sbt: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{VertexAttribute, VertexBinding};

    #[test]
    fn vertex_layouts_translate_per_binding() {
        let layout = VertexInputLayout {
            bindings: vec![
                VertexBinding {
                    binding: 0,
                    stride: 12,
                    input_rate: VertexInputRate::Vertex,
                },
                VertexBinding {
                    binding: 1,
                    stride: 16,
                    input_rate: VertexInputRate::Instance,
                },
            ],
            attributes: vec![VertexAttribute {
                location: 0,
                binding: 0,
                format: VertexFormat::Float32x3,
                offset: 0,
            }],
        };
        let (bindings, attributes) = vertex_input_descriptions(&layout);
        assert_eq!(bindings[1].input_rate, vk::VertexInputRate::INSTANCE);
        assert_eq!(attributes[0].format, vk::Format::R32G32B32_SFLOAT);
    }

    #[test]
    fn blending_is_off_without_state() {
        assert_eq!(blend_attachment(None).blend_enable, vk::FALSE);
        let alpha = blend_attachment(Some(&BlendState::ALPHA_BLENDING));
        assert_eq!(alpha.blend_enable, vk::TRUE);
        assert_eq!(alpha.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
    }
}
