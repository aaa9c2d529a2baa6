//! Render passes: compatible passes for pipeline creation and transient
//! pass + framebuffer pairs for recorded passes.

use ash::vk;

use crate::command::{ClearValue, LoadOp, NativeAttachment, StoreOp};
use crate::error::{GalError, GalResult};
use crate::format::TextureFormat;
use crate::pipeline::OutputDescription;

use super::queue::Garbage;
use super::texture::{sample_count_to_vk, texture_format_to_vk};
use super::{vk_error, VulkanBackend};

/// One attachment of a single-subpass render pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(super) struct AttachmentSpec {
    pub format: TextureFormat,
    pub samples: u32,
    pub load: LoadOp,
    pub store: StoreOp,
    /// Resolved into a single-sample attachment at the end of the pass.
    pub resolve: bool,
}

impl AttachmentSpec {
    fn from_native(attachment: &NativeAttachment, samples: u32) -> Self {
        Self {
            format: attachment.format,
            samples,
            load: attachment.load,
            store: attachment.store,
            resolve: attachment.resolve.is_some(),
        }
    }
}

fn load_op_to_vk(op: LoadOp) -> vk::AttachmentLoadOp {
    match op {
        LoadOp::Load => vk::AttachmentLoadOp::LOAD,
        LoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
        LoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
    }
}

fn store_op_to_vk(op: StoreOp) -> vk::AttachmentStoreOp {
    match op {
        StoreOp::Store => vk::AttachmentStoreOp::STORE,
        StoreOp::Discard => vk::AttachmentStoreOp::DONT_CARE,
    }
}

/// Attachment descriptions in framebuffer order: colors, depth, then resolve targets.
///
/// Attachments start and end in their attachment layout; the command buffer
/// transitions them around the pass.
fn attachment_descriptions(
    color: &[AttachmentSpec],
    depth: Option<&AttachmentSpec>,
) -> Vec<vk::AttachmentDescription> {
    let mut attachments = Vec::with_capacity(color.len() * 2 + 1);
    for att in color {
        attachments.push(
            vk::AttachmentDescription::default()
                .format(texture_format_to_vk(att.format))
                .samples(sample_count_to_vk(att.samples))
                .load_op(load_op_to_vk(att.load))
                .store_op(store_op_to_vk(att.store))
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
        );
    }
    if let Some(dep) = depth {
        let (stencil_load, stencil_store) = if dep.format.has_stencil() {
            (load_op_to_vk(dep.load), store_op_to_vk(dep.store))
        } else {
            (vk::AttachmentLoadOp::DONT_CARE, vk::AttachmentStoreOp::DONT_CARE)
        };
        attachments.push(
            vk::AttachmentDescription::default()
                .format(texture_format_to_vk(dep.format))
                .samples(sample_count_to_vk(dep.samples))
                .load_op(load_op_to_vk(dep.load))
                .store_op(store_op_to_vk(dep.store))
                .stencil_load_op(stencil_load)
                .stencil_store_op(stencil_store)
                .initial_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
        );
    }
    for att in color.iter().filter(|a| a.resolve) {
        attachments.push(
            vk::AttachmentDescription::default()
                .format(texture_format_to_vk(att.format))
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::DONT_CARE)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
        );
    }
    attachments
}

pub(super) fn create_render_pass(
    device: &ash::Device,
    color: &[AttachmentSpec],
    depth: Option<&AttachmentSpec>,
) -> GalResult<vk::RenderPass> {
    let attachments = attachment_descriptions(color, depth);
    let color_refs: Vec<vk::AttachmentReference> = (0..color.len() as u32)
        .map(|i| {
            vk::AttachmentReference::default()
                .attachment(i)
                .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        })
        .collect();
    let depth_ref = depth.map(|_| {
        vk::AttachmentReference::default()
            .attachment(color.len() as u32)
            .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
    });
    let mut next_resolve = (color.len() + usize::from(depth.is_some())) as u32;
    let resolve_refs: Vec<vk::AttachmentReference> = color
        .iter()
        .map(|att| {
            let attachment = if att.resolve {
                next_resolve += 1;
                next_resolve - 1
            } else {
                vk::ATTACHMENT_UNUSED
            };
            vk::AttachmentReference::default()
                .attachment(attachment)
                .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        })
        .collect();

    let mut subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs);
    if color.iter().any(|a| a.resolve) {
        subpass = subpass.resolve_attachments(&resolve_refs);
    }
    if let Some(d) = &depth_ref {
        subpass = subpass.depth_stencil_attachment(d);
    }

    let create_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(std::slice::from_ref(&subpass));
    unsafe { device.create_render_pass(&create_info, None) }
        .map_err(|e| vk_error("create_render_pass", e))
}

/// A render pass compatible with every framebuffer matching `outputs`.
pub(super) fn compatible_render_pass(
    device: &ash::Device,
    outputs: &OutputDescription,
) -> GalResult<vk::RenderPass> {
    let spec = |format| AttachmentSpec {
        format,
        samples: outputs.sample_count,
        load: LoadOp::DontCare,
        store: StoreOp::Store,
        resolve: false,
    };
    let color: Vec<AttachmentSpec> = outputs.color_formats.iter().copied().map(spec).collect();
    let depth = outputs.depth_format.map(spec);
    create_render_pass(device, &color, depth.as_ref())
}

fn clear_value(value: ClearValue) -> vk::ClearValue {
    match value {
        ClearValue::Color(float32) => vk::ClearValue {
            color: vk::ClearColorValue { float32 },
        },
        ClearValue::DepthStencil { depth, stencil } => vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
        },
    }
}

impl VulkanBackend {
    /// Begins a pass over the given attachments. The transient render pass and
    /// framebuffer are released with the submission.
    pub(super) fn begin_pass(
        &self,
        cmd: vk::CommandBuffer,
        color: &[NativeAttachment],
        depth: Option<&NativeAttachment>,
        extent: [u32; 2],
        sample_count: u32,
        garbage: &mut Vec<Garbage>,
    ) -> GalResult<()> {
        let color_specs: Vec<AttachmentSpec> = color
            .iter()
            .map(|a| AttachmentSpec::from_native(a, sample_count))
            .collect();
        let depth_spec = depth.map(|a| AttachmentSpec::from_native(a, sample_count));

        let view = |texture| {
            self.textures.with(texture, |t| t.attachment)?.ok_or_else(|| {
                GalError::invalid_state("texture attached to a render pass has no attachment view")
            })
        };
        let mut views = Vec::with_capacity(color.len() * 2 + 1);
        for attachment in color {
            views.push(view(attachment.texture)?);
        }
        if let Some(attachment) = depth {
            views.push(view(attachment.texture)?);
        }
        for resolve in color.iter().filter_map(|a| a.resolve) {
            views.push(view(resolve)?);
        }

        let render_pass = create_render_pass(&self.device, &color_specs, depth_spec.as_ref())?;
        garbage.push(Garbage::RenderPass(render_pass));
        let framebuffer_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(&views)
            .width(extent[0])
            .height(extent[1])
            .layers(1);
        let framebuffer = unsafe { self.device.create_framebuffer(&framebuffer_info, None) }
            .map_err(|e| vk_error("create_framebuffer", e))?;
        garbage.push(Garbage::Framebuffer(framebuffer));

        let mut clears: Vec<vk::ClearValue> = color.iter().map(|a| clear_value(a.clear)).collect();
        if let Some(attachment) = depth {
            clears.push(clear_value(attachment.clear));
        }
        let area = vk::Rect2D::default().extent(vk::Extent2D {
            width: extent[0],
            height: extent[1],
        });
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(area)
            .clear_values(&clears);
        unsafe {
            self.device
                .cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);
            // Viewport and scissor are dynamic; default them to the whole pass.
            let viewport = vk::Viewport::default()
                .width(extent[0] as f32)
                .height(extent[1] as f32)
                .max_depth(1.0);
            self.device.cmd_set_viewport(cmd, 0, &[viewport]);
            self.device.cmd_set_scissor(cmd, 0, &[area]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn color(format: TextureFormat, resolve: bool) -> AttachmentSpec {
        AttachmentSpec {
            format,
            samples: if resolve { 4 } else { 1 },
            load: LoadOp::Clear,
            store: StoreOp::Store,
            resolve,
        }
    }

    #[test]
    fn resolve_targets_follow_depth() {
        let depth = AttachmentSpec {
            format: TextureFormat::D24UnormS8Uint,
            samples: 4,
            load: LoadOp::Clear,
            store: StoreOp::Discard,
            resolve: false,
        };
        let attachments = attachment_descriptions(
            &[color(TextureFormat::Rgba8Unorm, true)],
            Some(&depth),
        );
        assert_eq!(attachments.len(), 3);
        assert_eq!(attachments[0].samples, vk::SampleCountFlags::TYPE_4);
        assert_eq!(attachments[1].format, vk::Format::D24_UNORM_S8_UINT);
        assert_eq!(attachments[1].stencil_load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(attachments[2].samples, vk::SampleCountFlags::TYPE_1);
        assert_eq!(attachments[2].store_op, vk::AttachmentStoreOp::STORE);
    }

    #[test]
    fn attachments_keep_their_layout_across_the_pass() {
        let attachments = attachment_descriptions(&[color(TextureFormat::Bgra8Unorm, false)], None);
        assert_eq!(
            attachments[0].initial_layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        assert_eq!(attachments[0].initial_layout, attachments[0].final_layout);
        assert_eq!(load_op_to_vk(LoadOp::DontCare), vk::AttachmentLoadOp::DONT_CARE);
    }
}
