//! Translation of recorded command lists into a Vulkan command buffer.

use std::ffi::CString;

use ash::vk;

use crate::backend::{BackendStatistics, NativeHandle};
use crate::command::{Command, MAX_UPDATE_BUFFER_SIZE};
use crate::error::{GalError, GalResult};
use crate::pipeline::PipelineKind;
use crate::state::{Transition, TransitionTarget};

use super::accel::index_type_to_vk;
use super::barrier::{aspect_to_vk, whole_range, BarrierBatch};
use super::pipeline::{bind_point, PipelineEntry};
use super::queue::Garbage;
use super::texture::{buffer_image_copy, image_copy};
use super::VulkanBackend;

/// Bindings and scopes of the command list being recorded.
struct Recorder<'a> {
    cmd: vk::CommandBuffer,
    garbage: &'a mut Vec<Garbage>,
    pipelines: [Option<PipelineEntry>; 3],
    in_pass: bool,
    debug_depth: u32,
    stats: BackendStatistics,
}

fn slot(kind: PipelineKind) -> usize {
    match kind {
        PipelineKind::Graphics => 0,
        PipelineKind::Compute => 1,
        PipelineKind::RayTracing => 2,
    }
}

/// Whether `vkCmdUpdateBuffer` can write `len` bytes at `offset` directly.
fn inline_update(offset: u64, len: usize) -> bool {
    len <= MAX_UPDATE_BUFFER_SIZE && len % 4 == 0 && offset % 4 == 0
}

impl Recorder<'_> {
    fn pipeline(&self, kind: PipelineKind, what: &str) -> GalResult<&PipelineEntry> {
        self.pipelines[slot(kind)].as_ref().ok_or_else(|| {
            GalError::invalid_state(format!("{what} without a bound {kind:?} pipeline"))
        })
    }
}

impl VulkanBackend {
    /// Records `commands` into `cmd`, returning the work they describe.
    pub(super) fn record_commands(
        &self,
        cmd: vk::CommandBuffer,
        commands: &[Command],
        garbage: &mut Vec<Garbage>,
    ) -> GalResult<BackendStatistics> {
        let mut rec = Recorder {
            cmd,
            garbage,
            pipelines: [None, None, None],
            in_pass: false,
            debug_depth: 0,
            stats: BackendStatistics::default(),
        };
        for command in commands {
            self.record(&mut rec, command)?;
        }
        if rec.in_pass {
            return Err(GalError::invalid_state("command list ends inside a render pass"));
        }
        if rec.debug_depth > 0 {
            log::warn!("{} debug groups left open at end of command list", rec.debug_depth);
            if let Some(debug) = &self.debug_utils {
                for _ in 0..rec.debug_depth {
                    unsafe { debug.cmd_end_debug_utils_label(cmd) };
                }
            }
        }
        Ok(rec.stats)
    }

    fn barrier(&self, rec: &mut Recorder<'_>, transitions: &[Transition]) -> GalResult<()> {
        let mut batch = BarrierBatch::new(self.stage_support);
        for transition in transitions {
            match transition.target {
                TransitionTarget::Buffer(handle) => {
                    let buffer = self.buffers.with(handle, |b| b.buffer)?;
                    batch.buffer(buffer, transition.before, transition.after);
                }
                TransitionTarget::Texture { handle, aspect } => {
                    let image = self.textures.with(handle, |t| t.image)?;
                    batch.image(
                        image,
                        whole_range(aspect_to_vk(aspect)),
                        transition.before,
                        transition.after,
                    );
                }
            }
            rec.stats.transitions += 1;
            if let Some((from, to)) = transition.queue_transfer {
                // Every queue kind shares one family, so ownership needs no transfer.
                log::trace!("queue transfer {from:?} -> {to:?} recorded as a plain barrier");
                rec.stats.queue_transfers += 1;
            }
        }
        batch.record(&self.device, rec.cmd);
        Ok(())
    }

    fn buffer(&self, handle: NativeHandle) -> GalResult<vk::Buffer> {
        self.buffers.with(handle, |b| b.buffer)
    }

    fn record(&self, rec: &mut Recorder<'_>, command: &Command) -> GalResult<()> {
        let cmd = rec.cmd;
        let device = &self.device;
        match command {
            Command::Barrier(transitions) => self.barrier(rec, transitions)?,
            Command::UavBarrier => {
                let mut batch = BarrierBatch::new(self.stage_support);
                batch.unordered_access();
                batch.record(device, cmd);
            }
            Command::PushDebugGroup(name) => {
                rec.debug_depth += 1;
                if let Some(debug) = &self.debug_utils {
                    let name = CString::new(name.replace('\0', " ")).unwrap_or_default();
                    let label = vk::DebugUtilsLabelEXT::default().label_name(&name);
                    unsafe { debug.cmd_begin_debug_utils_label(cmd, &label) };
                }
            }
            Command::PopDebugGroup => {
                if rec.debug_depth == 0 {
                    return Err(GalError::invalid_state("debug group popped without a push"));
                }
                rec.debug_depth -= 1;
                if let Some(debug) = &self.debug_utils {
                    unsafe { debug.cmd_end_debug_utils_label(cmd) };
                }
            }
            Command::BeginRenderPass {
                color,
                depth,
                extent,
                sample_count,
            } => {
                if rec.in_pass {
                    return Err(GalError::invalid_state("render passes cannot nest"));
                }
                self.begin_pass(cmd, color, depth.as_ref(), *extent, *sample_count, rec.garbage)?;
                rec.in_pass = true;
            }
            Command::EndRenderPass => {
                if !rec.in_pass {
                    return Err(GalError::invalid_state("render pass ended without a begin"));
                }
                unsafe { device.cmd_end_render_pass(cmd) };
                rec.in_pass = false;
            }
            Command::SetViewport(v) => {
                let viewport = vk::Viewport {
                    x: v.x,
                    y: v.y,
                    width: v.width,
                    height: v.height,
                    min_depth: v.min_depth,
                    max_depth: v.max_depth,
                };
                unsafe { device.cmd_set_viewport(cmd, 0, &[viewport]) };
            }
            Command::SetScissor(s) => {
                let scissor = vk::Rect2D {
                    offset: vk::Offset2D { x: s.x, y: s.y },
                    extent: vk::Extent2D {
                        width: s.width,
                        height: s.height,
                    },
                };
                unsafe { device.cmd_set_scissor(cmd, 0, &[scissor]) };
            }
            Command::BindPipeline { pipeline, kind } => {
                let entry = self.pipelines.get(*pipeline)?;
                unsafe { device.cmd_bind_pipeline(cmd, bind_point(*kind), entry.pipeline) };
                rec.pipelines[slot(*kind)] = Some(entry);
            }
            Command::BindResourceSet { kind, index, set } => {
                let layout = rec.pipeline(*kind, "resource set bound")?.layout;
                let set = self.sets.with(*set, |s| s.set)?;
                unsafe {
                    device.cmd_bind_descriptor_sets(
                        cmd,
                        bind_point(*kind),
                        layout,
                        *index,
                        &[set],
                        &[],
                    )
                };
            }
            Command::SetVertexBuffer {
                slot,
                buffer,
                offset,
            } => {
                let buffer = self.buffer(*buffer)?;
                unsafe { device.cmd_bind_vertex_buffers(cmd, *slot, &[buffer], &[*offset]) };
            }
            Command::SetIndexBuffer {
                buffer,
                offset,
                format,
            } => {
                let buffer = self.buffer(*buffer)?;
                unsafe {
                    device.cmd_bind_index_buffer(cmd, buffer, *offset, index_type_to_vk(*format))
                };
            }
            Command::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => {
                rec.pipeline(PipelineKind::Graphics, "draw")?;
                unsafe {
                    device.cmd_draw(
                        cmd,
                        *vertex_count,
                        *instance_count,
                        *first_vertex,
                        *first_instance,
                    )
                };
                rec.stats.draws += 1;
            }
            Command::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            } => {
                rec.pipeline(PipelineKind::Graphics, "indexed draw")?;
                unsafe {
                    device.cmd_draw_indexed(
                        cmd,
                        *index_count,
                        *instance_count,
                        *first_index,
                        *vertex_offset,
                        *first_instance,
                    )
                };
                rec.stats.draws += 1;
            }
            Command::DrawIndirect {
                buffer,
                offset,
                draw_count,
                stride,
                indexed,
            } => {
                rec.pipeline(PipelineKind::Graphics, "indirect draw")?;
                let buffer = self.buffer(*buffer)?;
                // Without multi-draw, each draw is issued on its own.
                let (calls, per_call) = if self.multi_draw_indirect {
                    (1, *draw_count)
                } else {
                    (*draw_count, 1)
                };
                for i in 0..calls {
                    let offset = offset + i as u64 * *stride as u64;
                    unsafe {
                        if *indexed {
                            device.cmd_draw_indexed_indirect(cmd, buffer, offset, per_call, *stride)
                        } else {
                            device.cmd_draw_indirect(cmd, buffer, offset, per_call, *stride)
                        }
                    };
                }
                rec.stats.draws += *draw_count as u64;
            }
            Command::Dispatch { x, y, z } => {
                rec.pipeline(PipelineKind::Compute, "dispatch")?;
                unsafe { device.cmd_dispatch(cmd, *x, *y, *z) };
                rec.stats.dispatches += 1;
            }
            Command::DispatchIndirect { buffer, offset } => {
                rec.pipeline(PipelineKind::Compute, "indirect dispatch")?;
                let buffer = self.buffer(*buffer)?;
                unsafe { device.cmd_dispatch_indirect(cmd, buffer, *offset) };
                rec.stats.dispatches += 1;
            }
            Command::DispatchRays {
                width,
                height,
                depth,
            } => {
                let entry = rec.pipeline(PipelineKind::RayTracing, "ray dispatch")?;
                let (Some(sbt), Some(loader)) = (&entry.sbt, &self.ray_tracing) else {
                    return Err(GalError::UnsupportedCapability(
                        "ray dispatch without a shader binding table".into(),
                    ));
                };
                unsafe {
                    loader.cmd_trace_rays(
                        cmd,
                        &sbt.raygen,
                        &sbt.miss,
                        &sbt.hit,
                        &sbt.callable,
                        *width,
                        *height,
                        *depth,
                    )
                };
                rec.stats.ray_dispatches += 1;
            }
            Command::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                let region = vk::BufferCopy::default()
                    .src_offset(*src_offset)
                    .dst_offset(*dst_offset)
                    .size(*size);
                let (src, dst) = (self.buffer(*src)?, self.buffer(*dst)?);
                unsafe { device.cmd_copy_buffer(cmd, src, dst, &[region]) };
            }
            Command::UpdateBuffer {
                buffer,
                offset,
                data,
            } => {
                if data.is_empty() {
                    return Ok(());
                }
                let target = self.buffer(*buffer)?;
                if inline_update(*offset, data.len()) {
                    unsafe { device.cmd_update_buffer(cmd, target, *offset, data) };
                } else {
                    let (staging, memory) = self.staging_buffer(data)?;
                    rec.garbage.push(Garbage::Buffer(staging, memory));
                    let region = vk::BufferCopy::default()
                        .src_offset(0)
                        .dst_offset(*offset)
                        .size(data.len() as u64);
                    unsafe { device.cmd_copy_buffer(cmd, staging, target, &[region]) };
                }
            }
            Command::CopyBufferToTexture {
                buffer,
                offset,
                texture,
                region,
            } => {
                let buffer = self.buffer(*buffer)?;
                let (image, copy) = self
                    .textures
                    .with(*texture, |t| (t.image, buffer_image_copy(t, region, *offset)))?;
                unsafe {
                    device.cmd_copy_buffer_to_image(
                        cmd,
                        buffer,
                        image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[copy],
                    )
                };
            }
            Command::CopyTextureToBuffer {
                texture,
                region,
                buffer,
                offset,
            } => {
                let buffer = self.buffer(*buffer)?;
                let (image, copy) = self
                    .textures
                    .with(*texture, |t| (t.image, buffer_image_copy(t, region, *offset)))?;
                unsafe {
                    device.cmd_copy_image_to_buffer(
                        cmd,
                        image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        buffer,
                        &[copy],
                    )
                };
            }
            Command::CopyTexture {
                src,
                src_region,
                dst,
                dst_region,
            } => {
                let src = self.textures.get(*src)?;
                let dst = self.textures.get(*dst)?;
                let copy = image_copy(&src, src_region, &dst, dst_region);
                unsafe {
                    device.cmd_copy_image(
                        cmd,
                        src.image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst.image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[copy],
                    )
                };
            }
            Command::ResolveTexture { src, dst } => {
                let src = self.textures.get(*src)?;
                let dst = self.textures.get(*dst)?;
                let layers = src.desc.array_layers.min(dst.desc.array_layers);
                let resolve = vk::ImageResolve::default()
                    .src_subresource(src.subresource(0, 0, layers))
                    .dst_subresource(dst.subresource(0, 0, layers))
                    .extent(vk::Extent3D {
                        width: src.desc.width,
                        height: src.desc.height,
                        depth: 1,
                    });
                unsafe {
                    device.cmd_resolve_image(
                        cmd,
                        src.image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst.image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[resolve],
                    )
                };
            }
            Command::BuildAccelerationStructure {
                input,
                destination,
                source,
                scratch_address,
            } => {
                self.record_structure_build(cmd, input, *destination, *source, *scratch_address)?;
                rec.stats.acceleration_structure_builds += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_or_unaligned_updates_go_through_staging() {
        assert!(inline_update(0, 256));
        assert!(inline_update(4, MAX_UPDATE_BUFFER_SIZE));
        assert!(!inline_update(0, 6));
        assert!(!inline_update(2, 8));
        assert!(!inline_update(0, MAX_UPDATE_BUFFER_SIZE + 4));
    }

    #[test]
    fn pipeline_slots_are_distinct() {
        let slots = [
            slot(PipelineKind::Graphics),
            slot(PipelineKind::Compute),
            slot(PipelineKind::RayTracing),
        ];
        assert_eq!(slots, [0, 1, 2]);
    }
}
