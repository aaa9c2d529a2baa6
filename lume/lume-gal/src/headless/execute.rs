//! Inline execution of recorded command lists.

use crate::accel::{
    AccelerationStructureBuildInput, AccelerationStructureFlags, AccelerationStructureKind,
    BuildGeometry, Transform3x4, INSTANCE_RECORD_SIZE,
};
use crate::backend::{BackendStatistics, DeviceAddress, NativeHandle, ObjectKind};
use crate::binding::{NativeBinding, ResourceKind};
use crate::command::{Command, LoadOp, NativeAttachment};
use crate::error::{GalError, GalResult};
use crate::format::IndexFormat;
use crate::pipeline::PipelineKind;
use crate::state::{QueueKind, ResourceState, Transition, TransitionTarget};
use crate::texture::TextureRegion;

use super::accel::{self, Bounds, PrimitiveRecord};
use super::memory::{encode_clear, ADDRESS_ALIGNMENT};
use super::{
    lock, validation, BufferEntry, BuiltStructure, HeadlessBackend, PipelineEntry, TextureEntry,
};

struct Pass {
    color: Vec<NativeAttachment>,
}

/// Bindings and scopes of the command list being executed.
struct Executor {
    queue: QueueKind,
    pipelines: [Option<PipelineEntry>; 3],
    /// `(set, root signature)` per set index at each bind point.
    sets: [Vec<Option<(NativeHandle, NativeHandle)>>; 3],
    index_buffer: Option<IndexFormat>,
    pass: Option<Pass>,
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

impl Executor {
    fn expect_queue(&self, allowed: &[QueueKind], what: &str) -> GalResult<()> {
        if allowed.contains(&self.queue) {
            Ok(())
        } else {
            Err(validation(format!("{what} recorded for the {:?} queue", self.queue)))
        }
    }

    fn expect_pass(&self, what: &str) -> GalResult<()> {
        match self.pass {
            Some(_) => Ok(()),
            None => Err(validation(format!("{what} outside a render pass"))),
        }
    }

    fn expect_no_pass(&self, what: &str) -> GalResult<()> {
        match self.pass {
            Some(_) => Err(validation(format!("{what} inside a render pass"))),
            None => Ok(()),
        }
    }

    fn bind_set(&mut self, kind: PipelineKind, index: u32, set: NativeHandle, layout: NativeHandle) {
        let sets = &mut self.sets[slot(kind)];
        if sets.len() <= index as usize {
            sets.resize(index as usize + 1, None);
        }
        sets[index as usize] = Some((set, layout));
    }

    fn bound_sets(&self, kind: PipelineKind) -> impl Iterator<Item = (NativeHandle, NativeHandle)> + '_ {
        self.sets[slot(kind)].iter().flatten().copied()
    }

    fn pipeline(&self, kind: PipelineKind, what: &str) -> GalResult<&PipelineEntry> {
        self.pipelines[slot(kind)]
            .as_ref()
            .ok_or_else(|| validation(format!("{what} without a bound {kind:?} pipeline")))
    }
}

impl HeadlessBackend {
    /// Runs `commands` to completion, returning the work they performed.
    pub(super) fn execute(
        &self,
        queue: QueueKind,
        commands: &[Command],
    ) -> GalResult<BackendStatistics> {
        let mut exec = Executor {
            queue,
            pipelines: [None, None, None],
            sets: Default::default(),
            index_buffer: None,
            pass: None,
            debug_depth: 0,
            stats: BackendStatistics::default(),
        };
        for command in commands {
            self.run(&mut exec, command)?;
        }
        if exec.pass.is_some() {
            return Err(validation("command list ends inside a render pass"));
        }
        if exec.debug_depth > 0 {
            log::warn!("{} debug groups left open at end of command list", exec.debug_depth);
        }
        Ok(exec.stats)
    }

    fn run(&self, exec: &mut Executor, command: &Command) -> GalResult<()> {
        use QueueKind::{Compute, Graphics};

        match command {
            Command::Barrier(transitions) => {
                for transition in transitions {
                    self.transition(transition)?;
                    exec.stats.transitions += 1;
                    if transition.queue_transfer.is_some() {
                        exec.stats.queue_transfers += 1;
                    }
                }
            }
            Command::UavBarrier => {}
            Command::PushDebugGroup(label) => {
                exec.debug_depth += 1;
                log::trace!("debug group '{label}'");
            }
            Command::PopDebugGroup => {
                exec.debug_depth = exec
                    .debug_depth
                    .checked_sub(1)
                    .ok_or_else(|| validation("debug group popped without a push"))?;
            }
            Command::BeginRenderPass {
                color,
                depth,
                extent,
                sample_count,
            } => {
                exec.expect_queue(&[Graphics], "render pass")?;
                exec.expect_no_pass("render pass")?;
                for attachment in color {
                    self.begin_attachment(attachment, *extent, *sample_count, false)?;
                }
                if let Some(depth) = depth {
                    self.begin_attachment(depth, *extent, *sample_count, true)?;
                }
                exec.pass = Some(Pass {
                    color: color.clone(),
                });
            }
            Command::EndRenderPass => {
                let pass = exec
                    .pass
                    .take()
                    .ok_or_else(|| validation("render pass ended without a begin"))?;
                for attachment in &pass.color {
                    if let Some(resolve) = attachment.resolve {
                        self.resolve_subresource(attachment.texture, resolve)?;
                    }
                }
                exec.sets[slot(PipelineKind::Graphics)].clear();
            }
            Command::SetViewport(viewport) => {
                exec.expect_pass("set viewport")?;
                if viewport.width < 0.0 || viewport.height < 0.0 {
                    return Err(validation(format!("negative viewport {viewport:?}")));
                }
            }
            Command::SetScissor(_) => exec.expect_pass("set scissor")?,
            Command::BindPipeline { pipeline, kind } => {
                let entry = self.pipelines.get(*pipeline)?;
                if entry.kind != *kind {
                    return Err(validation(format!(
                        "{:?} pipeline bound at the {kind:?} bind point",
                        entry.kind
                    )));
                }
                exec.sets[slot(*kind)].truncate(entry.layouts.len());
                exec.pipelines[slot(*kind)] = Some(entry);
            }
            Command::BindResourceSet { kind, index, set } => {
                let pipeline = exec.pipeline(*kind, "resource set bound")?;
                let layout = pipeline.layouts.get(*index as usize).copied().ok_or_else(|| {
                    validation(format!(
                        "set {index} bound to a pipeline with {} layouts",
                        pipeline.layouts.len()
                    ))
                })?;
                self.check_set(*set, layout)?;
                exec.bind_set(*kind, *index, *set, layout);
            }
            Command::SetVertexBuffer {
                slot: binding,
                buffer,
                offset,
            } => {
                exec.expect_pass("vertex buffer bound")?;
                let entry = self.buffer_in(*buffer, ResourceState::VertexBuffer, "vertex")?;
                if *offset >= entry.size {
                    return Err(validation(format!(
                        "vertex buffer {binding} offset {offset} past {} bytes",
                        entry.size
                    )));
                }
            }
            Command::SetIndexBuffer {
                buffer,
                offset,
                format,
            } => {
                exec.expect_pass("index buffer bound")?;
                let entry = self.buffer_in(*buffer, ResourceState::IndexBuffer, "index")?;
                if *offset >= entry.size || offset % format.size() as u64 != 0 {
                    return Err(validation(format!(
                        "index buffer offset {offset} invalid for {format:?}"
                    )));
                }
                exec.index_buffer = Some(*format);
            }
            Command::Draw { .. } => {
                exec.expect_pass("draw")?;
                exec.pipeline(PipelineKind::Graphics, "draw")?;
                self.check_bound_sets(exec, PipelineKind::Graphics)?;
                exec.stats.draws += 1;
            }
            Command::DrawIndexed { .. } => {
                exec.expect_pass("indexed draw")?;
                exec.pipeline(PipelineKind::Graphics, "indexed draw")?;
                if exec.index_buffer.is_none() {
                    return Err(validation("indexed draw without an index buffer"));
                }
                self.check_bound_sets(exec, PipelineKind::Graphics)?;
                exec.stats.draws += 1;
            }
            Command::DrawIndirect {
                buffer,
                offset,
                draw_count,
                stride,
                indexed,
            } => {
                exec.expect_pass("indirect draw")?;
                exec.pipeline(PipelineKind::Graphics, "indirect draw")?;
                if *indexed && exec.index_buffer.is_none() {
                    return Err(validation("indexed indirect draw without an index buffer"));
                }
                let entry = self.buffer_in(*buffer, ResourceState::IndirectArgument, "indirect")?;
                let args = if *indexed { 20 } else { 16 };
                let end = offset + *stride as u64 * draw_count.saturating_sub(1) as u64 + args;
                if *draw_count > 0 && end > entry.size {
                    return Err(validation(format!(
                        "{draw_count} indirect draws read past {} bytes",
                        entry.size
                    )));
                }
                self.check_bound_sets(exec, PipelineKind::Graphics)?;
                exec.stats.draws += *draw_count as u64;
            }
            Command::Dispatch { .. } => {
                exec.expect_queue(&[Graphics, Compute], "dispatch")?;
                exec.expect_no_pass("dispatch")?;
                exec.pipeline(PipelineKind::Compute, "dispatch")?;
                self.check_bound_sets(exec, PipelineKind::Compute)?;
                exec.stats.dispatches += 1;
            }
            Command::DispatchIndirect { buffer, offset } => {
                exec.expect_queue(&[Graphics, Compute], "indirect dispatch")?;
                exec.expect_no_pass("indirect dispatch")?;
                exec.pipeline(PipelineKind::Compute, "indirect dispatch")?;
                let entry = self.buffer_in(*buffer, ResourceState::IndirectArgument, "indirect")?;
                if offset + 12 > entry.size {
                    return Err(validation("indirect dispatch arguments past the buffer end"));
                }
                self.check_bound_sets(exec, PipelineKind::Compute)?;
                exec.stats.dispatches += 1;
            }
            Command::DispatchRays {
                width,
                height,
                depth,
            } => {
                exec.expect_queue(&[Graphics, Compute], "ray dispatch")?;
                exec.expect_no_pass("ray dispatch")?;
                let pipeline = exec.pipeline(PipelineKind::RayTracing, "ray dispatch")?;
                let table = pipeline
                    .shader_table
                    .ok_or_else(|| validation("ray tracing pipeline has no shader table"))?;
                log::trace!(
                    "dispatch rays {width}x{height}x{depth}: miss at {}, hits at {}, stride {}",
                    table.miss_offset,
                    table.hit_offset,
                    table.stride
                );
                self.check_bound_sets(exec, PipelineKind::RayTracing)?;
                exec.stats.ray_dispatches += 1;
            }
            Command::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                exec.expect_no_pass("buffer copy")?;
                let from = self.buffer_in(*src, ResourceState::CopySource, "copy source")?;
                let to = self.buffer_in(*dst, ResourceState::CopyDestination, "copy destination")?;
                check_range(*src_offset, *size, from.size, "copy source")?;
                check_range(*dst_offset, *size, to.size, "copy destination")?;
                self.memory
                    .arena()
                    .copy(from.block, *src_offset, to.block, *dst_offset, *size)?;
            }
            Command::UpdateBuffer {
                buffer,
                offset,
                data,
            } => {
                exec.expect_no_pass("buffer update")?;
                let entry =
                    self.buffer_in(*buffer, ResourceState::CopyDestination, "update target")?;
                check_range(*offset, data.len() as u64, entry.size, "update target")?;
                self.memory.arena().write(entry.block, *offset, data)?;
            }
            Command::CopyBufferToTexture {
                buffer,
                offset,
                texture,
                region,
            } => {
                exec.expect_no_pass("buffer to texture copy")?;
                let from = self.buffer_in(*buffer, ResourceState::CopySource, "copy source")?;
                let to = self.texture_in(*texture, ResourceState::CopyDestination, "copy destination")?;
                let len = region.data_size(to.desc.format);
                check_range(*offset, len, from.size, "copy source")?;
                let texels = self.memory.arena().read_vec(from.block, *offset, len)?;
                self.write_region(&to, region, &texels)?;
            }
            Command::CopyTextureToBuffer {
                texture,
                region,
                buffer,
                offset,
            } => {
                exec.expect_no_pass("texture to buffer copy")?;
                let from = self.texture_in(*texture, ResourceState::CopySource, "copy source")?;
                let to = self.buffer_in(*buffer, ResourceState::CopyDestination, "copy destination")?;
                let texels = self.read_region(&from, region)?;
                check_range(*offset, texels.len() as u64, to.size, "copy destination")?;
                self.memory.arena().write(to.block, *offset, &texels)?;
            }
            Command::CopyTexture {
                src,
                src_region,
                dst,
                dst_region,
            } => {
                exec.expect_no_pass("texture copy")?;
                let from = self.texture_in(*src, ResourceState::CopySource, "copy source")?;
                let to = self.texture_in(*dst, ResourceState::CopyDestination, "copy destination")?;
                if src_region.extent != dst_region.extent
                    || from.desc.format.bytes_per_texel() != to.desc.format.bytes_per_texel()
                {
                    return Err(validation(format!(
                        "texture copy between {:?} {:?} and {:?} {:?}",
                        from.desc.format, src_region.extent, to.desc.format, dst_region.extent
                    )));
                }
                let texels = self.read_region(&from, src_region)?;
                self.write_region(&to, dst_region, &texels)?;
            }
            Command::ResolveTexture { src, dst } => {
                exec.expect_no_pass("resolve")?;
                self.texture_in(*src, ResourceState::ResolveSource, "resolve source")?;
                self.texture_in(*dst, ResourceState::ResolveDestination, "resolve destination")?;
                self.resolve_subresource(*src, *dst)?;
            }
            Command::BuildAccelerationStructure {
                input,
                destination,
                source,
                scratch_address,
            } => {
                exec.expect_queue(&[Graphics, Compute], "acceleration structure build")?;
                exec.expect_no_pass("acceleration structure build")?;
                self.build_structure(input, *destination, *source, *scratch_address)?;
                exec.stats.acceleration_structure_builds += 1;
            }
        }
        Ok(())
    }

    fn transition(&self, transition: &Transition) -> GalResult<()> {
        let apply = |state: &mut ResourceState| {
            if *state != transition.before {
                return Err(*state);
            }
            *state = transition.after;
            Ok(())
        };
        let (kind, handle, result) = match transition.target {
            TransitionTarget::Buffer(handle) => (
                ObjectKind::Buffer,
                handle,
                self.buffers.with_mut(handle, |e| apply(&mut e.state))?,
            ),
            TransitionTarget::Texture { handle, .. } => (
                ObjectKind::Texture,
                handle,
                self.textures.with_mut(handle, |e| apply(&mut e.state))?,
            ),
        };
        result.map_err(|actual| {
            validation(format!(
                "{kind:?} {} transitioned from {:?} but is in {actual:?}",
                self.describe(kind, handle),
                transition.before
            ))
        })
    }

    fn buffer_in(
        &self,
        buffer: NativeHandle,
        expected: ResourceState,
        what: &str,
    ) -> GalResult<BufferEntry> {
        let entry = self.buffer(buffer)?;
        if entry.state != expected {
            return Err(validation(format!(
                "{what} buffer {} is in {:?}, expected {expected:?}",
                self.describe(ObjectKind::Buffer, buffer),
                entry.state
            )));
        }
        Ok(entry)
    }

    fn texture_in(
        &self,
        texture: NativeHandle,
        expected: ResourceState,
        what: &str,
    ) -> GalResult<TextureEntry> {
        let entry = self.texture(texture)?;
        if entry.state != expected {
            return Err(validation(format!(
                "{what} texture {} is in {:?}, expected {expected:?}",
                self.describe(ObjectKind::Texture, texture),
                entry.state
            )));
        }
        Ok(entry)
    }

    fn begin_attachment(
        &self,
        attachment: &NativeAttachment,
        extent: [u32; 2],
        sample_count: u32,
        depth: bool,
    ) -> GalResult<()> {
        let entry = self.texture(attachment.texture)?;
        let allowed: &[ResourceState] = if depth {
            &[ResourceState::DepthWrite, ResourceState::DepthRead]
        } else {
            &[ResourceState::RenderTarget]
        };
        if !allowed.contains(&entry.state) {
            return Err(validation(format!(
                "attachment {} is in {:?}",
                self.describe(ObjectKind::Texture, attachment.texture),
                entry.state
            )));
        }
        if [entry.desc.width, entry.desc.height] != extent
            || entry.desc.sample_count != sample_count
        {
            return Err(validation(format!(
                "attachment {}x{} x{} in a {}x{} x{sample_count} pass",
                entry.desc.width, entry.desc.height, entry.desc.sample_count, extent[0], extent[1]
            )));
        }
        if let Some(resolve) = attachment.resolve {
            self.texture_in(resolve, ResourceState::RenderTarget, "resolve attachment")?;
        }
        if attachment.load == LoadOp::Clear {
            let texel = encode_clear(attachment.format, attachment.clear);
            let block = entry.subresource(0, 0)?;
            self.memory.arena().with_bytes_mut(block, |bytes| {
                for chunk in bytes.chunks_exact_mut(texel.len()) {
                    chunk.copy_from_slice(&texel);
                }
            })?;
        }
        Ok(())
    }

    /// Copies the top subresource of `src` into `dst`; samples are not stored
    /// separately, so a resolve is a plain copy.
    fn resolve_subresource(&self, src: NativeHandle, dst: NativeHandle) -> GalResult<()> {
        let from = self.texture(src)?;
        let to = self.texture(dst)?;
        let region = TextureRegion::whole(&to.desc, 0, 0);
        let texels = self.read_region(&from, &region)?;
        self.write_region(&to, &region, &texels)
    }

    /// Re-validates every set bound at `kind`'s bind point against the states its
    /// resources are in when the work executes.
    fn check_bound_sets(&self, exec: &Executor, kind: PipelineKind) -> GalResult<()> {
        for (set, layout) in exec.bound_sets(kind) {
            self.check_set(set, layout)?;
        }
        Ok(())
    }

    fn check_set(&self, set: NativeHandle, layout: NativeHandle) -> GalResult<()> {
        let table = self.tables.get(set)?;
        if table.root != layout {
            let compatible = self.roots.with(layout, |root| {
                root.slots.len() == table.signature.slots.len()
                    && root
                        .slots
                        .iter()
                        .zip(&table.signature.slots)
                        .all(|(a, b)| a.kind == b.kind && a.capacity == b.capacity)
            })?;
            if !compatible {
                return Err(validation(format!(
                    "resource set {} does not match the pipeline's root signature",
                    self.describe(ObjectKind::ResourceSet, set)
                )));
            }
        }
        let (descriptors, missing) = {
            let heaps = lock(&self.heaps);
            let descriptors: Vec<(ResourceKind, NativeBinding)> = table
                .entries()
                .filter_map(|(kind, heap, index)| heaps.get(heap).get(index).map(|b| (kind, b)))
                .collect();
            let missing = table.required().find_map(|(slot, heap, range)| {
                range
                    .clone()
                    .find(|&i| heaps.get(heap).get(i).is_none())
                    .map(|i| (slot, i - range.start))
            });
            (descriptors, missing)
        };
        if let Some((slot, index)) = missing {
            return Err(validation(format!(
                "resource set {} bound with slot {slot} element {index} unwritten",
                self.describe(ObjectKind::ResourceSet, set)
            )));
        }
        for (kind, binding) in descriptors {
            self.check_descriptor(kind, &binding)?;
        }
        Ok(())
    }

    fn check_descriptor(&self, kind: ResourceKind, binding: &NativeBinding) -> GalResult<()> {
        let Some(required) = kind.required_state() else {
            return Ok(());
        };
        let (object, handle, state) = match *binding {
            NativeBinding::Buffer { buffer, .. } => {
                (ObjectKind::Buffer, buffer, self.buffers.with(buffer, |e| e.state))
            }
            NativeBinding::Texture(texture) => (
                ObjectKind::Texture,
                texture,
                self.textures.with(texture, |e| e.state),
            ),
            NativeBinding::TextureView(view) => {
                let texture = self.views.with(view, |e| e.texture)?;
                (
                    ObjectKind::Texture,
                    texture,
                    self.textures.with(texture, |e| e.state),
                )
            }
            NativeBinding::AccelerationStructure(structure) => {
                let entry = self.structures.get(structure)?;
                if entry.built.is_none() {
                    return Err(validation(format!(
                        "acceleration structure {} bound before it was built",
                        self.describe(ObjectKind::AccelerationStructure, structure)
                    )));
                }
                (
                    ObjectKind::Buffer,
                    entry.buffer,
                    self.buffers.with(entry.buffer, |e| e.state),
                )
            }
            NativeBinding::Sampler(_) => return Ok(()),
        };
        let state = state.map_err(|_| {
            validation(format!(
                "descriptor references destroyed {object:?} #{}",
                handle.raw()
            ))
        })?;
        if state != required {
            return Err(validation(format!(
                "{kind:?} descriptor {object:?} {} is in {state:?}, expected {required:?}",
                self.describe(object, handle)
            )));
        }
        Ok(())
    }

    /// Reads `len` bytes of build input at `address`.
    fn read_input(&self, address: DeviceAddress, len: u64, what: &str) -> GalResult<Vec<u8>> {
        let (buffer, offset) = self.memory.resolve(address, len)?;
        let entry = self.buffer_in(buffer, ResourceState::AccelerationStructureBuildInput, what)?;
        self.memory.arena().read_vec(entry.block, offset, len)
    }

    fn build_structure(
        &self,
        input: &AccelerationStructureBuildInput,
        destination: NativeHandle,
        source: Option<NativeHandle>,
        scratch_address: DeviceAddress,
    ) -> GalResult<()> {
        let target = self.structures.get(destination)?;
        if target.kind != input.kind {
            return Err(validation(format!(
                "{:?} build into a {:?} structure",
                input.kind, target.kind
            )));
        }
        let storage = self.buffer_in(
            target.buffer,
            ResourceState::AccelerationStructureWrite,
            "structure storage",
        )?;

        let sizes = accel::build_sizes(input);
        if sizes.result_size > target.size {
            return Err(GalError::BuildFailure(format!(
                "build needs {} bytes; structure has {}",
                sizes.result_size, target.size
            )));
        }
        let scratch_len = if input.update {
            sizes.update_scratch_size
        } else {
            sizes.scratch_size
        };
        if scratch_address % ADDRESS_ALIGNMENT != 0 {
            return Err(validation(format!(
                "scratch address {scratch_address:#x} is not {ADDRESS_ALIGNMENT}-byte aligned"
            )));
        }
        let (scratch, _) = self.memory.resolve(scratch_address, scratch_len)?;
        self.buffer_in(scratch, ResourceState::AccelerationStructureWrite, "scratch")?;

        let previous = if input.update {
            Some(self.update_source(input, destination, source)?)
        } else {
            None
        };

        let (bytes, primitive_count, bounds) = match input.kind {
            AccelerationStructureKind::BottomLevel => {
                let (records, bounds) = self.primitive_records(input)?;
                let header = accel::header(
                    input.kind,
                    input.flags,
                    records.len() as u32,
                    input.geometries.len() as u32,
                    previous.map_or(0, |p| p.updates + 1),
                    bounds,
                );
                (
                    accel::encode_structure(&header, &records),
                    records.len() as u32,
                    bounds,
                )
            }
            AccelerationStructureKind::TopLevel => {
                let (instances, bounds) = self.instance_records(input)?;
                let header = accel::header(
                    input.kind,
                    input.flags,
                    instances.len() as u32,
                    1,
                    previous.map_or(0, |p| p.updates + 1),
                    bounds,
                );
                (
                    accel::encode_structure(&header, &instances),
                    instances.len() as u32,
                    bounds,
                )
            }
        };
        self.memory.arena().write(storage.block, 0, &bytes)?;
        let built = BuiltStructure {
            primitive_count,
            flags: input.flags,
            bounds,
            updates: previous.map_or(0, |p| p.updates + 1),
        };
        self.structures
            .with_mut(destination, |entry| entry.built = Some(built))?;
        log::trace!(
            "built {:?} {}: {primitive_count} primitives, {} bytes",
            input.kind,
            self.describe(ObjectKind::AccelerationStructure, destination),
            bytes.len()
        );
        Ok(())
    }

    fn update_source(
        &self,
        input: &AccelerationStructureBuildInput,
        destination: NativeHandle,
        source: Option<NativeHandle>,
    ) -> GalResult<BuiltStructure> {
        let source = source.ok_or_else(|| validation("update without a source structure"))?;
        let entry = self.structures.get(source)?;
        if source != destination {
            self.buffer_in(
                entry.buffer,
                ResourceState::AccelerationStructureRead,
                "update source",
            )?;
        }
        let built = entry.built.ok_or_else(|| {
            GalError::BuildFailure("update source was never built".into())
        })?;
        if !built.flags.contains(AccelerationStructureFlags::ALLOW_UPDATE) {
            return Err(GalError::BuildFailure(
                "update source was not built with ALLOW_UPDATE".into(),
            ));
        }
        if built.primitive_count as u64 != input.total_primitives() {
            return Err(GalError::BuildFailure(format!(
                "update changes the primitive count from {} to {}",
                built.primitive_count,
                input.total_primitives()
            )));
        }
        Ok(built)
    }

    fn primitive_records(
        &self,
        input: &AccelerationStructureBuildInput,
    ) -> GalResult<(Vec<PrimitiveRecord>, Bounds)> {
        let mut records = Vec::with_capacity(input.total_primitives() as usize);
        let mut total = Bounds::EMPTY;
        for (geometry, desc) in input.geometries.iter().enumerate() {
            let geometry = geometry as u32;
            match *desc {
                BuildGeometry::Triangles {
                    vertex_address,
                    vertex_format,
                    vertex_stride,
                    max_vertex,
                    index,
                    transform_address,
                    primitive_count,
                    ..
                } => {
                    let vertex_bytes =
                        vertex_stride * max_vertex as u64 + vertex_format.size() as u64;
                    let vertices = self.read_input(vertex_address, vertex_bytes, "vertex")?;
                    let transform = match transform_address {
                        Some(address) => Some(self.read_transform(address)?),
                        None => None,
                    };
                    let indices: Vec<u32> = match index {
                        Some((address, format)) => {
                            let len = primitive_count as u64 * 3 * format.size() as u64;
                            let bytes = self.read_input(address, len, "index")?;
                            decode_indices(format, &bytes)
                        }
                        None => (0..primitive_count * 3).collect(),
                    };
                    for (primitive, triangle) in indices.chunks_exact(3).enumerate() {
                        let mut bounds = Bounds::EMPTY;
                        for &vertex in triangle {
                            if vertex > max_vertex {
                                return Err(GalError::BuildFailure(format!(
                                    "geometry {geometry} references vertex {vertex} past {max_vertex}"
                                )));
                            }
                            let at = (vertex as u64 * vertex_stride) as usize;
                            let position = accel::decode_position(vertex_format, &vertices[at..])?;
                            bounds.add(match &transform {
                                Some(m) => accel::transform_point(m, position),
                                None => position,
                            });
                        }
                        total.union(&bounds);
                        records.push(record(bounds, geometry, primitive as u32));
                    }
                }
                BuildGeometry::Aabbs {
                    address,
                    stride,
                    primitive_count,
                    ..
                } => {
                    if primitive_count == 0 {
                        continue;
                    }
                    let len = stride * (primitive_count as u64 - 1) + 24;
                    let bytes = self.read_input(address, len, "aabb")?;
                    for primitive in 0..primitive_count {
                        let at = (primitive as u64 * stride) as usize;
                        let values: [f32; 6] = bytemuck::pod_read_unaligned(&bytes[at..at + 24]);
                        let mut bounds = Bounds::EMPTY;
                        bounds.add([values[0], values[1], values[2]]);
                        bounds.add([values[3], values[4], values[5]]);
                        total.union(&bounds);
                        records.push(record(bounds, geometry, primitive));
                    }
                }
                BuildGeometry::Instances { .. } => {
                    return Err(GalError::BuildFailure(
                        "instances in a bottom-level build".into(),
                    ))
                }
            }
        }
        Ok((records, total))
    }

    fn read_transform(&self, address: DeviceAddress) -> GalResult<Transform3x4> {
        let bytes = self.read_input(address, 48, "transform")?;
        Ok(bytemuck::pod_read_unaligned(&bytes))
    }

    fn instance_records(
        &self,
        input: &AccelerationStructureBuildInput,
    ) -> GalResult<(Vec<crate::accel::InstanceRecord>, Bounds)> {
        let [BuildGeometry::Instances { address, count }] = input.geometries[..] else {
            return Err(GalError::BuildFailure(
                "a top-level build takes exactly one instance array".into(),
            ));
        };
        let bytes = self.read_input(address, count as u64 * INSTANCE_RECORD_SIZE, "instance")?;
        let instances = accel::decode_instances(&bytes);
        let mut total = Bounds::EMPTY;
        for (i, instance) in instances.iter().enumerate() {
            let blas = lock(&self.structure_addresses)
                .get(&instance.blas_address)
                .copied()
                .ok_or_else(|| {
                    GalError::BuildFailure(format!(
                        "instance {i} references {:#x}, which is not a structure",
                        instance.blas_address
                    ))
                })?;
            let entry = self.structures.get(blas)?;
            let built = match (entry.kind, entry.built) {
                (AccelerationStructureKind::BottomLevel, Some(built)) => built,
                _ => {
                    return Err(GalError::BuildFailure(format!(
                        "instance {i} references an unbuilt or top-level structure"
                    )))
                }
            };
            self.buffer_in(
                entry.buffer,
                ResourceState::AccelerationStructureRead,
                "instanced structure",
            )?;
            total.union(&built.bounds.transformed(&instance.transform));
        }
        Ok((instances, total))
    }
}

fn record(bounds: Bounds, geometry: u32, primitive: u32) -> PrimitiveRecord {
    let (bounds_min, bounds_max) = bounds.to_arrays();
    PrimitiveRecord {
        bounds_min,
        bounds_max,
        geometry,
        primitive,
    }
}

fn decode_indices(format: IndexFormat, bytes: &[u8]) -> Vec<u32> {
    match format {
        IndexFormat::Uint16 => bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]) as u32)
            .collect(),
        IndexFormat::Uint32 => bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    }
}

fn check_range(offset: u64, len: u64, size: u64, what: &str) -> GalResult<()> {
    if offset.checked_add(len).map_or(true, |end| end > size) {
        return Err(validation(format!(
            "{what} range {offset}+{len} outside {size} bytes"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, Submission};
    use crate::buffer::{BufferDescriptor, BufferUsage};
    use crate::config::ContextConfig;

    fn backend() -> HeadlessBackend {
        HeadlessBackend::new(&ContextConfig::default())
    }

    fn submit(backend: &HeadlessBackend, commands: &[Command]) -> GalResult<()> {
        backend
            .submit(&Submission {
                queue: QueueKind::Graphics,
                commands,
                waits: &[],
            })
            .map(|_| ())
    }

    fn barrier(buffer: NativeHandle, before: ResourceState, after: ResourceState) -> Command {
        Command::Barrier(vec![Transition::new(
            TransitionTarget::Buffer(buffer),
            before,
            after,
        )])
    }

    #[test]
    fn copies_require_matching_states() {
        let backend = backend();
        let src = backend
            .create_buffer(&BufferDescriptor::new(16, BufferUsage::COPY_SRC))
            .unwrap();
        let dst = backend
            .create_buffer(&BufferDescriptor::new(16, BufferUsage::COPY_DST))
            .unwrap();
        backend
            .write_buffer(src, ResourceState::Common, 0, &[7; 16])
            .unwrap();
        let copy = Command::CopyBuffer {
            src,
            src_offset: 0,
            dst,
            dst_offset: 0,
            size: 16,
        };
        let err = submit(&backend, &[copy.clone()]).unwrap_err();
        assert!(err.to_string().contains("validation"), "{err}");

        submit(
            &backend,
            &[
                barrier(src, ResourceState::Common, ResourceState::CopySource),
                barrier(dst, ResourceState::Common, ResourceState::CopyDestination),
                copy,
            ],
        )
        .unwrap();
        let mut out = [0u8; 16];
        backend
            .read_buffer(dst, ResourceState::CopyDestination, 0, &mut out)
            .unwrap();
        assert_eq!(out, [7; 16]);
        assert_eq!(backend.statistics().transitions, 2);
    }

    #[test]
    fn transitions_from_the_wrong_state_are_rejected() {
        let backend = backend();
        let buffer = backend
            .create_buffer(&BufferDescriptor::new(16, BufferUsage::STORAGE))
            .unwrap();
        backend.set_debug_name(ObjectKind::Buffer, buffer, "particles");
        let err = submit(
            &backend,
            &[barrier(
                buffer,
                ResourceState::ShaderRead,
                ResourceState::UnorderedAccess,
            )],
        )
        .unwrap_err();
        assert!(matches!(err, GalError::Backend(_)));
        assert!(err.to_string().contains("'particles'"), "{err}");
    }

    #[test]
    fn dispatch_needs_a_compute_pipeline() {
        let backend = backend();
        let err = submit(&backend, &[Command::Dispatch { x: 1, y: 1, z: 1 }]).unwrap_err();
        assert!(err.to_string().contains("Compute pipeline"), "{err}");
    }

    #[test]
    fn unbalanced_render_passes_fail() {
        let backend = backend();
        assert!(submit(&backend, &[Command::EndRenderPass]).is_err());
        assert!(submit(&backend, &[Command::PopDebugGroup]).is_err());
    }

    #[test]
    fn indices_decode_in_both_widths() {
        assert_eq!(decode_indices(IndexFormat::Uint16, &[1, 0, 2, 1]), vec![1, 258]);
        assert_eq!(decode_indices(IndexFormat::Uint32, &[3, 0, 0, 0]), vec![3]);
    }
}
