//! Command recording.
//!
//! A [`CommandBuffer`] records a strictly ordered list of [`Command`]s and tracks, per
//! buffer and texture, the state the recorded work leaves it in. Transitions are only
//! emitted when a use needs a state different from the tracked one; the state a
//! resource must be in when the buffer starts is reconciled against the resource's
//! global state when the buffer is committed (see
//! [`CommandProcessor::commit`](crate::CommandProcessor::commit)).

use std::collections::HashMap;
use std::sync::Arc;

use crate::accel::AccelerationStructureBuildInput;
use crate::backend::{DeviceAddress, NativeHandle};
use crate::binding::ResourceSet;
use crate::buffer::{Buffer, BufferUsage};
use crate::device::DeviceShared;
use crate::error::{GalError, GalResult};
use crate::format::{IndexFormat, TextureFormat};
use crate::pipeline::{OutputDescription, Pipeline, PipelineKind};
use crate::resource::{Resource, ResourceId};
use crate::state::{QueueKind, ResourceState, SubmissionToken, Tracked, TrackedState, Transition};
use crate::texture::{Texture, TextureRegion, TextureUsage};

/// Largest payload accepted by [`CommandBuffer::update_buffer`].
pub const MAX_UPDATE_BUFFER_SIZE: usize = 65536;

const DRAW_INDIRECT_SIZE: u64 = 16;
const DRAW_INDEXED_INDIRECT_SIZE: u64 = 20;
const DISPATCH_INDIRECT_SIZE: u64 = 12;

/// Lifecycle of a command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Closed,
    Submitted,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadOp {
    #[default]
    Clear,
    Load,
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreOp {
    #[default]
    Store,
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

#[derive(Debug, Clone)]
pub struct ColorAttachment {
    pub texture: Arc<Texture>,
    pub load: LoadOp,
    pub clear_color: [f32; 4],
    pub store: StoreOp,
    /// Single-sample texture the attachment is resolved into at the end of the pass.
    pub resolve_target: Option<Arc<Texture>>,
}

impl ColorAttachment {
    pub fn clear(texture: Arc<Texture>, color: [f32; 4]) -> Self {
        Self {
            texture,
            load: LoadOp::Clear,
            clear_color: color,
            store: StoreOp::Store,
            resolve_target: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DepthAttachment {
    pub texture: Arc<Texture>,
    pub load: LoadOp,
    pub clear_depth: f32,
    pub clear_stencil: u32,
    pub store: StoreOp,
}

impl DepthAttachment {
    pub fn clear(texture: Arc<Texture>, depth: f32) -> Self {
        Self {
            texture,
            load: LoadOp::Clear,
            clear_depth: depth,
            clear_stencil: 0,
            store: StoreOp::Store,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RenderPassDescriptor {
    pub label: Option<&'static str>,
    pub color_attachments: Vec<ColorAttachment>,
    pub depth_attachment: Option<DepthAttachment>,
}

impl RenderPassDescriptor {
    /// Checks attachment usages and extents; returns the framebuffer outputs and extent.
    fn validate(&self) -> GalResult<(OutputDescription, [u32; 2])> {
        let mut textures: Vec<&Arc<Texture>> = self
            .color_attachments
            .iter()
            .map(|a| &a.texture)
            .chain(self.depth_attachment.iter().map(|d| &d.texture))
            .collect();
        let first = textures
            .first()
            .copied()
            .ok_or_else(|| GalError::descriptor("render pass has no attachments"))?;
        let extent = [first.width(), first.height()];
        let samples = first.sample_count();
        for texture in &textures {
            texture.base().ensure_alive()?;
            if [texture.width(), texture.height()] != extent || texture.sample_count() != samples {
                return Err(GalError::descriptor(format!(
                    "attachments differ in extent or sample count ({}x{} x{} vs {extent:?} x{samples})",
                    texture.width(),
                    texture.height(),
                    texture.sample_count()
                )));
            }
        }
        for attachment in &self.color_attachments {
            attachment.texture.require_usage(TextureUsage::RENDER_TARGET)?;
            if let Some(resolve) = &attachment.resolve_target {
                resolve.base().ensure_alive()?;
                resolve.require_usage(TextureUsage::RENDER_TARGET)?;
                if samples == 1
                    || resolve.sample_count() != 1
                    || resolve.format() != attachment.texture.format()
                    || [resolve.width(), resolve.height()] != extent
                {
                    return Err(GalError::descriptor(
                        "resolve target must be a single-sample texture matching a multisampled attachment",
                    ));
                }
                textures.push(resolve);
            }
        }
        if let Some(depth) = &self.depth_attachment {
            depth.texture.require_usage(TextureUsage::DEPTH_STENCIL)?;
        }
        for (i, texture) in textures.iter().enumerate() {
            if textures[..i].iter().any(|t| t.id() == texture.id()) {
                return Err(GalError::descriptor(format!(
                    "texture {:?} attached twice",
                    texture.id()
                )));
            }
        }
        let outputs = OutputDescription {
            color_formats: self
                .color_attachments
                .iter()
                .map(|a| a.texture.format())
                .collect(),
            depth_format: self.depth_attachment.as_ref().map(|d| d.texture.format()),
            sample_count: samples,
        };
        Ok((outputs, extent))
    }
}

/// Attachment of a recorded render pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NativeAttachment {
    pub texture: NativeHandle,
    pub format: TextureFormat,
    pub load: LoadOp,
    pub clear: ClearValue,
    pub store: StoreOp,
    pub resolve: Option<NativeHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScissorRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// One recorded operation, in the form handed to the backend.
#[derive(Debug, Clone)]
pub enum Command {
    Barrier(Vec<Transition>),
    /// Orders unordered-access writes against later accesses in the same state.
    UavBarrier,
    PushDebugGroup(String),
    PopDebugGroup,
    BeginRenderPass {
        color: Vec<NativeAttachment>,
        depth: Option<NativeAttachment>,
        extent: [u32; 2],
        sample_count: u32,
    },
    EndRenderPass,
    SetViewport(Viewport),
    SetScissor(ScissorRect),
    BindPipeline {
        pipeline: NativeHandle,
        kind: PipelineKind,
    },
    BindResourceSet {
        kind: PipelineKind,
        index: u32,
        set: NativeHandle,
    },
    SetVertexBuffer {
        slot: u32,
        buffer: NativeHandle,
        offset: u64,
    },
    SetIndexBuffer {
        buffer: NativeHandle,
        offset: u64,
        format: IndexFormat,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    DrawIndirect {
        buffer: NativeHandle,
        offset: u64,
        draw_count: u32,
        stride: u32,
        indexed: bool,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    DispatchIndirect {
        buffer: NativeHandle,
        offset: u64,
    },
    DispatchRays {
        width: u32,
        height: u32,
        depth: u32,
    },
    CopyBuffer {
        src: NativeHandle,
        src_offset: u64,
        dst: NativeHandle,
        dst_offset: u64,
        size: u64,
    },
    UpdateBuffer {
        buffer: NativeHandle,
        offset: u64,
        data: Vec<u8>,
    },
    CopyBufferToTexture {
        buffer: NativeHandle,
        offset: u64,
        texture: NativeHandle,
        region: TextureRegion,
    },
    CopyTextureToBuffer {
        texture: NativeHandle,
        region: TextureRegion,
        buffer: NativeHandle,
        offset: u64,
    },
    CopyTexture {
        src: NativeHandle,
        src_region: TextureRegion,
        dst: NativeHandle,
        dst_region: TextureRegion,
    },
    ResolveTexture {
        src: NativeHandle,
        dst: NativeHandle,
    },
    BuildAccelerationStructure {
        input: Arc<AccelerationStructureBuildInput>,
        destination: NativeHandle,
        /// Structure being refitted when `input.update` is set.
        source: Option<NativeHandle>,
        scratch_address: DeviceAddress,
    },
}

/// A buffer or texture whose state the command buffer tracks.
#[derive(Debug, Clone, Copy)]
pub enum ResourceRef<'a> {
    Buffer(&'a Arc<Buffer>),
    Texture(&'a Arc<Texture>),
}

impl<'a> From<&'a Arc<Buffer>> for ResourceRef<'a> {
    fn from(buffer: &'a Arc<Buffer>) -> Self {
        ResourceRef::Buffer(buffer)
    }
}

impl<'a> From<&'a Arc<Texture>> for ResourceRef<'a> {
    fn from(texture: &'a Arc<Texture>) -> Self {
        ResourceRef::Texture(texture)
    }
}

impl ResourceRef<'_> {
    fn tracked(self) -> Arc<dyn Tracked> {
        match self {
            ResourceRef::Buffer(buffer) => buffer.clone(),
            ResourceRef::Texture(texture) => texture.clone(),
        }
    }
}

/// An acceleration structure build as recorded by the builder.
pub(crate) struct BuildRecord<'a> {
    pub input: Arc<AccelerationStructureBuildInput>,
    pub destination: NativeHandle,
    pub source: Option<NativeHandle>,
    pub result: &'a Arc<Buffer>,
    pub scratch: &'a Arc<Buffer>,
    pub scratch_address: DeviceAddress,
    /// Geometry, transform or instance buffers read by the build.
    pub inputs: &'a [Arc<Buffer>],
    /// Storage of bottom-level structures read by a top-level build.
    pub dependencies: &'a [Arc<Buffer>],
}

/// Tracked use of one resource within a command buffer.
pub(crate) struct ResourceUse {
    pub resource: Arc<dyn Tracked>,
    /// State the buffer expects on entry.
    pub first: ResourceState,
    /// State the recorded work leaves it in.
    pub current: ResourceState,
    pub released_to: Option<QueueKind>,
}

struct RenderScope {
    outputs: OutputDescription,
    /// Index of the barrier command that precedes the pass.
    barrier_slot: usize,
    states: HashMap<ResourceId, ResourceState>,
}

enum Scope {
    None,
    Render(RenderScope),
    Compute,
}

/// Recorded GPU work for one queue.
pub struct CommandBuffer {
    device: Arc<DeviceShared>,
    queue: QueueKind,
    state: CommandBufferState,
    token: Option<SubmissionToken>,
    commands: Vec<Command>,
    uses: Vec<ResourceUse>,
    use_index: HashMap<ResourceId, usize>,
    retained: HashMap<ResourceId, Arc<dyn Resource>>,
    scope: Scope,
    graphics: Option<Arc<Pipeline>>,
    /// Compute or ray tracing pipeline bound outside render passes.
    pipeline: Option<Arc<Pipeline>>,
    /// Sets bound per bind point, by set index; re-applied at every draw and dispatch.
    bound_sets: [Vec<Option<Arc<ResourceSet>>>; 3],
    index_buffer_bound: bool,
}

fn bind_point(kind: PipelineKind) -> usize {
    match kind {
        PipelineKind::Graphics => 0,
        PipelineKind::Compute => 1,
        PipelineKind::RayTracing => 2,
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("queue", &self.queue)
            .field("state", &self.state)
            .field("commands", &self.commands.len())
            .field("resources", &self.uses.len())
            .finish_non_exhaustive()
    }
}

impl CommandBuffer {
    pub(crate) fn new(device: Arc<DeviceShared>, queue: QueueKind) -> Self {
        Self {
            device,
            queue,
            state: CommandBufferState::Initial,
            token: None,
            commands: Vec::new(),
            uses: Vec::new(),
            use_index: HashMap::new(),
            retained: HashMap::new(),
            scope: Scope::None,
            graphics: None,
            pipeline: None,
            bound_sets: Default::default(),
            index_buffer_bound: false,
        }
    }

    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    /// Current state; a submitted buffer reports `Completed` once its work has finished.
    pub fn state(&self) -> CommandBufferState {
        match (self.state, self.token) {
            (CommandBufferState::Submitted, Some(token))
                if self.device.is_complete(token).unwrap_or(false) =>
            {
                CommandBufferState::Completed
            }
            (state, _) => state,
        }
    }

    /// Token of the last commit.
    pub fn token(&self) -> Option<SubmissionToken> {
        self.token
    }

    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn begin(&mut self) -> GalResult<()> {
        match self.state() {
            CommandBufferState::Initial | CommandBufferState::Completed => {
                self.clear();
                self.state = CommandBufferState::Recording;
                Ok(())
            }
            state => Err(GalError::invalid_state(format!(
                "begin() on a {state:?} command buffer"
            ))),
        }
    }

    pub fn end(&mut self) -> GalResult<()> {
        if self.state != CommandBufferState::Recording {
            return Err(GalError::invalid_state(format!(
                "end() on a {:?} command buffer; call begin() first",
                self.state
            )));
        }
        match self.scope {
            Scope::None => {}
            Scope::Render(_) => {
                return Err(GalError::invalid_state("end() with a render pass still open"))
            }
            Scope::Compute => {
                return Err(GalError::invalid_state("end() with a compute pass still open"))
            }
        }
        self.state = CommandBufferState::Closed;
        Ok(())
    }

    /// Discards recorded work. Fails while submitted work is still executing.
    pub fn reset(&mut self) -> GalResult<()> {
        if self.state() == CommandBufferState::Submitted {
            return Err(GalError::invalid_state(
                "reset() while the command buffer is still executing",
            ));
        }
        self.clear();
        self.state = CommandBufferState::Initial;
        Ok(())
    }

    /// Blocks until the last commit has completed.
    pub fn wait(&mut self) -> GalResult<()> {
        if let (CommandBufferState::Submitted, Some(token)) = (self.state, self.token) {
            self.device.wait(token, None)?;
            self.state = CommandBufferState::Completed;
        }
        Ok(())
    }

    pub(crate) fn is_reusable(&self) -> bool {
        self.state() != CommandBufferState::Submitted
    }

    fn clear(&mut self) {
        self.commands.clear();
        self.uses.clear();
        self.use_index.clear();
        self.retained.clear();
        self.scope = Scope::None;
        self.graphics = None;
        self.pipeline = None;
        self.bound_sets = Default::default();
        self.index_buffer_bound = false;
    }

    fn expect_recording(&self) -> GalResult<()> {
        if self.state != CommandBufferState::Recording {
            return Err(GalError::invalid_state(format!(
                "recording into a {:?} command buffer",
                self.state
            )));
        }
        Ok(())
    }

    fn expect_outside_render(&self, what: &str) -> GalResult<()> {
        self.expect_recording()?;
        if matches!(self.scope, Scope::Render(_)) {
            return Err(GalError::invalid_state(format!(
                "{what} is not allowed inside a render pass"
            )));
        }
        Ok(())
    }

    fn expect_render(&self, what: &str) -> GalResult<&Arc<Pipeline>> {
        self.expect_recording()?;
        if !matches!(self.scope, Scope::Render(_)) {
            return Err(GalError::invalid_state(format!(
                "{what} requires an open render pass"
            )));
        }
        self.graphics.as_ref().ok_or_else(|| {
            GalError::invalid_state(format!("{what} requires a bound graphics pipeline"))
        })
    }

    fn expect_queue(&self, allowed: &[QueueKind], what: &str) -> GalResult<()> {
        if !allowed.contains(&self.queue) {
            return Err(GalError::invalid_state(format!(
                "{what} cannot be recorded on the {:?} queue",
                self.queue
            )));
        }
        Ok(())
    }

    fn retain(&mut self, resource: Arc<dyn Resource>) {
        self.retained.entry(resource.id()).or_insert(resource);
    }

    /// Records that the next command uses `resource` in `state`, emitting a
    /// transition only when the tracked state differs.
    fn use_resource(&mut self, resource: Arc<dyn Tracked>, state: ResourceState) -> GalResult<()> {
        resource.base().ensure_alive()?;
        let id = resource.id();
        if let Scope::Render(scope) = &mut self.scope {
            match scope.states.get(&id) {
                Some(&existing) if existing != state => {
                    return Err(GalError::invalid_state(format!(
                        "{} {} used as {existing:?} and {state:?} within one render pass",
                        resource.base().kind(),
                        resource.base().describe()
                    )))
                }
                Some(_) => return Ok(()),
                None => {
                    scope.states.insert(id, state);
                }
            }
        }
        let transition = match self.use_index.get(&id) {
            None => {
                self.use_index.insert(id, self.uses.len());
                self.uses.push(ResourceUse {
                    resource,
                    first: state,
                    current: state,
                    released_to: None,
                });
                None
            }
            Some(&i) => {
                let entry = &mut self.uses[i];
                if let Some(queue) = entry.released_to {
                    return Err(GalError::invalid_state(format!(
                        "{} {} used after its ownership was released to {queue:?}",
                        entry.resource.base().kind(),
                        entry.resource.base().describe()
                    )));
                }
                if entry.current == state {
                    None
                } else {
                    let transition =
                        Transition::new(entry.resource.target(), entry.current, state);
                    entry.current = state;
                    Some(transition)
                }
            }
        };
        if let Some(transition) = transition {
            self.push_transition(transition);
        }
        Ok(())
    }

    /// Appends a transition to the pending barrier batch. Inside a render pass the
    /// batch is the one recorded just before the pass began.
    fn push_transition(&mut self, transition: Transition) {
        log::trace!(
            "{:?}: {:?} -> {:?}",
            transition.target,
            transition.before,
            transition.after
        );
        let batch = match &self.scope {
            Scope::Render(scope) => Some(scope.barrier_slot),
            _ => self
                .commands
                .len()
                .checked_sub(1)
                .filter(|&last| matches!(self.commands[last], Command::Barrier(_))),
        };
        match batch.map(|i| &mut self.commands[i]) {
            Some(Command::Barrier(transitions)) => transitions.push(transition),
            _ => self.commands.push(Command::Barrier(vec![transition])),
        }
    }

    /// Explicitly moves a resource into `state`.
    pub fn transition<'a>(
        &mut self,
        resource: impl Into<ResourceRef<'a>>,
        state: ResourceState,
    ) -> GalResult<()> {
        self.expect_recording()?;
        if state == ResourceState::Undefined {
            return Err(GalError::invalid_state(
                "resources cannot be transitioned to Undefined",
            ));
        }
        self.use_resource(resource.into().tracked(), state)
    }

    /// Records the release half of a queue ownership transfer to `to`. The matching
    /// acquire is recorded when a buffer on `to` that uses the resource is committed.
    pub fn release_ownership<'a>(
        &mut self,
        resource: impl Into<ResourceRef<'a>>,
        to: QueueKind,
    ) -> GalResult<()> {
        self.expect_outside_render("releasing queue ownership")?;
        if to == self.queue {
            return Err(GalError::invalid_state(format!(
                "cannot release ownership to the recording queue {to:?}"
            )));
        }
        let resource = resource.into().tracked();
        let index = *self.use_index.get(&resource.id()).ok_or_else(|| {
            GalError::invalid_state(format!(
                "{} {} released before this command buffer used it",
                resource.base().kind(),
                resource.base().describe()
            ))
        })?;
        let entry = &mut self.uses[index];
        entry.released_to = Some(to);
        let transition = Transition {
            target: entry.resource.target(),
            before: entry.current,
            after: entry.current,
            queue_transfer: Some((self.queue, to)),
        };
        self.push_transition(transition);
        Ok(())
    }

    /// Orders unordered-access writes before later unordered-access work.
    pub fn uav_barrier(&mut self) -> GalResult<()> {
        self.expect_outside_render("a UAV barrier")?;
        self.commands.push(Command::UavBarrier);
        Ok(())
    }

    pub fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) -> GalResult<()> {
        self.expect_recording()?;
        self.expect_queue(&[QueueKind::Graphics], "a render pass")?;
        if !matches!(self.scope, Scope::None) {
            return Err(GalError::invalid_state(
                "begin_render_pass() inside an open pass",
            ));
        }
        let (outputs, extent) = desc.validate()?;
        let barrier_slot = self.commands.len();
        self.commands.push(Command::Barrier(Vec::new()));
        let sample_count = outputs.sample_count;
        self.scope = Scope::Render(RenderScope {
            outputs,
            barrier_slot,
            states: HashMap::new(),
        });
        self.graphics = None;

        let mut color = Vec::with_capacity(desc.color_attachments.len());
        for attachment in &desc.color_attachments {
            self.use_resource(attachment.texture.clone(), ResourceState::RenderTarget)?;
            if let Some(resolve) = &attachment.resolve_target {
                self.use_resource(resolve.clone(), ResourceState::RenderTarget)?;
            }
            color.push(NativeAttachment {
                texture: attachment.texture.native(),
                format: attachment.texture.format(),
                load: attachment.load,
                clear: ClearValue::Color(attachment.clear_color),
                store: attachment.store,
                resolve: attachment.resolve_target.as_ref().map(|t| t.native()),
            });
        }
        let depth = match &desc.depth_attachment {
            Some(attachment) => {
                self.use_resource(attachment.texture.clone(), ResourceState::DepthWrite)?;
                Some(NativeAttachment {
                    texture: attachment.texture.native(),
                    format: attachment.texture.format(),
                    load: attachment.load,
                    clear: ClearValue::DepthStencil {
                        depth: attachment.clear_depth,
                        stencil: attachment.clear_stencil,
                    },
                    store: attachment.store,
                    resolve: None,
                })
            }
            None => None,
        };
        self.commands.push(Command::BeginRenderPass {
            color,
            depth,
            extent,
            sample_count,
        });
        Ok(())
    }

    pub fn end_render_pass(&mut self) -> GalResult<()> {
        self.expect_recording()?;
        let Scope::Render(scope) = std::mem::replace(&mut self.scope, Scope::None) else {
            return Err(GalError::invalid_state("end_render_pass() without an open pass"));
        };
        self.commands.push(Command::EndRenderPass);
        if matches!(&self.commands[scope.barrier_slot], Command::Barrier(t) if t.is_empty()) {
            self.commands.remove(scope.barrier_slot);
        }
        self.graphics = None;
        self.bound_sets[bind_point(PipelineKind::Graphics)].clear();
        Ok(())
    }

    /// Opens a compute scope, shown as a labelled group in native debuggers.
    pub fn begin_compute_pass(&mut self, label: &str) -> GalResult<()> {
        self.expect_recording()?;
        self.expect_queue(&[QueueKind::Graphics, QueueKind::Compute], "a compute pass")?;
        if !matches!(self.scope, Scope::None) {
            return Err(GalError::invalid_state(
                "begin_compute_pass() inside an open pass",
            ));
        }
        self.scope = Scope::Compute;
        self.commands.push(Command::PushDebugGroup(label.to_owned()));
        Ok(())
    }

    pub fn end_compute_pass(&mut self) -> GalResult<()> {
        self.expect_recording()?;
        if !matches!(self.scope, Scope::Compute) {
            return Err(GalError::invalid_state("end_compute_pass() without an open pass"));
        }
        self.scope = Scope::None;
        self.commands.push(Command::PopDebugGroup);
        Ok(())
    }

    /// Binds a pipeline. Graphics pipelines are checked against the open render
    /// pass's outputs the first time they meet them.
    pub fn bind_pipeline(&mut self, pipeline: &Arc<Pipeline>) -> GalResult<()> {
        self.expect_recording()?;
        pipeline.base().ensure_alive()?;
        match pipeline.kind() {
            PipelineKind::Graphics => {
                let Scope::Render(scope) = &self.scope else {
                    return Err(GalError::invalid_state(
                        "graphics pipelines can only be bound inside a render pass",
                    ));
                };
                pipeline.check_outputs(&scope.outputs)?;
                self.graphics = Some(pipeline.clone());
            }
            PipelineKind::Compute | PipelineKind::RayTracing => {
                self.expect_outside_render("binding a compute or ray tracing pipeline")?;
                self.expect_queue(
                    &[QueueKind::Graphics, QueueKind::Compute],
                    "a compute or ray tracing pipeline",
                )?;
                self.pipeline = Some(pipeline.clone());
            }
        }
        self.bound_sets[bind_point(pipeline.kind())].truncate(pipeline.layouts().len());
        self.retain(pipeline.clone());
        self.commands.push(Command::BindPipeline {
            pipeline: pipeline.native(),
            kind: pipeline.kind(),
        });
        Ok(())
    }

    /// Binds `set` at set index `index` of the current pipeline and moves every
    /// resource it holds into the state its slot requires.
    pub fn bind_resource_set(&mut self, index: u32, set: &Arc<ResourceSet>) -> GalResult<()> {
        self.expect_recording()?;
        set.base().ensure_alive()?;
        let pipeline = match self.scope {
            Scope::Render(_) => self.graphics.clone(),
            _ => self.pipeline.clone(),
        }
        .ok_or_else(|| GalError::invalid_state("bind a pipeline before its resource sets"))?;
        let layout = pipeline.layouts().get(index as usize).ok_or_else(|| {
            GalError::binding(format!(
                "set index {index} out of range: pipeline has {} layouts",
                pipeline.layouts().len()
            ))
        })?;
        if !layout.is_compatible(set.layout()) {
            return Err(GalError::binding(format!(
                "resource set layout is incompatible with pipeline layout {index}"
            )));
        }

        self.use_set_resources(set)?;
        self.retain(set.clone());
        let sets = &mut self.bound_sets[bind_point(pipeline.kind())];
        if sets.len() <= index as usize {
            sets.resize(index as usize + 1, None);
        }
        sets[index as usize] = Some(set.clone());
        self.commands.push(Command::BindResourceSet {
            kind: pipeline.kind(),
            index,
            set: set.native(),
        });
        Ok(())
    }

    fn use_set_resources(&mut self, set: &ResourceSet) -> GalResult<()> {
        set.base().ensure_alive()?;
        let mut bindings = Vec::new();
        set.for_each_binding(|kind, resource| bindings.push((kind, resource.clone())));
        for (kind, resource) in bindings {
            self.retain(resource.as_resource());
            if let (Some(tracked), Some(state)) = (resource.tracked(), kind.required_state()) {
                self.use_resource(tracked, state)?;
            }
        }
        Ok(())
    }

    /// Moves the resources of every set bound at `kind`'s bind point back into the
    /// states their slots require. Copies and explicit transitions recorded since the
    /// sets were bound may have moved them.
    fn refresh_bound_sets(&mut self, kind: PipelineKind) -> GalResult<()> {
        let sets: Vec<Arc<ResourceSet>> =
            self.bound_sets[bind_point(kind)].iter().flatten().cloned().collect();
        for set in &sets {
            self.use_set_resources(set)?;
        }
        Ok(())
    }

    pub fn set_viewport(&mut self, viewport: Viewport) -> GalResult<()> {
        self.expect_render("set_viewport()")?;
        self.commands.push(Command::SetViewport(viewport));
        Ok(())
    }

    pub fn set_scissor(&mut self, scissor: ScissorRect) -> GalResult<()> {
        self.expect_render("set_scissor()")?;
        self.commands.push(Command::SetScissor(scissor));
        Ok(())
    }

    pub fn set_vertex_buffer(&mut self, slot: u32, buffer: &Arc<Buffer>, offset: u64) -> GalResult<()> {
        self.expect_recording()?;
        buffer.require_usage(BufferUsage::VERTEX)?;
        buffer.check_range(offset, 0)?;
        self.use_resource(buffer.clone(), ResourceState::VertexBuffer)?;
        self.commands.push(Command::SetVertexBuffer {
            slot,
            buffer: buffer.native(),
            offset,
        });
        Ok(())
    }

    pub fn set_index_buffer(
        &mut self,
        buffer: &Arc<Buffer>,
        offset: u64,
        format: IndexFormat,
    ) -> GalResult<()> {
        self.expect_recording()?;
        buffer.require_usage(BufferUsage::INDEX)?;
        if offset % format.size() as u64 != 0 {
            return Err(GalError::descriptor(format!(
                "index buffer offset {offset} is not aligned to {format:?}"
            )));
        }
        buffer.check_range(offset, 0)?;
        self.use_resource(buffer.clone(), ResourceState::IndexBuffer)?;
        self.index_buffer_bound = true;
        self.commands.push(Command::SetIndexBuffer {
            buffer: buffer.native(),
            offset,
            format,
        });
        Ok(())
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> GalResult<()> {
        self.expect_render("draw()")?;
        self.refresh_bound_sets(PipelineKind::Graphics)?;
        self.commands.push(Command::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
        Ok(())
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> GalResult<()> {
        self.expect_render("draw_indexed()")?;
        if !self.index_buffer_bound {
            return Err(GalError::invalid_state("draw_indexed() without an index buffer"));
        }
        self.refresh_bound_sets(PipelineKind::Graphics)?;
        self.commands.push(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        });
        Ok(())
    }

    pub fn draw_indirect(&mut self, buffer: &Arc<Buffer>, offset: u64, draw_count: u32) -> GalResult<()> {
        self.record_draw_indirect(buffer, offset, draw_count, false)
    }

    pub fn draw_indexed_indirect(
        &mut self,
        buffer: &Arc<Buffer>,
        offset: u64,
        draw_count: u32,
    ) -> GalResult<()> {
        if !self.index_buffer_bound {
            return Err(GalError::invalid_state(
                "draw_indexed_indirect() without an index buffer",
            ));
        }
        self.record_draw_indirect(buffer, offset, draw_count, true)
    }

    fn record_draw_indirect(
        &mut self,
        buffer: &Arc<Buffer>,
        offset: u64,
        draw_count: u32,
        indexed: bool,
    ) -> GalResult<()> {
        self.expect_render("an indirect draw")?;
        buffer.require_usage(BufferUsage::INDIRECT)?;
        let stride = if indexed {
            DRAW_INDEXED_INDIRECT_SIZE
        } else {
            DRAW_INDIRECT_SIZE
        };
        if offset % 4 != 0 {
            return Err(GalError::descriptor("indirect offset must be 4-byte aligned"));
        }
        buffer.check_range(offset, stride * draw_count as u64)?;
        self.use_resource(buffer.clone(), ResourceState::IndirectArgument)?;
        self.refresh_bound_sets(PipelineKind::Graphics)?;
        self.commands.push(Command::DrawIndirect {
            buffer: buffer.native(),
            offset,
            draw_count,
            stride: stride as u32,
            indexed,
        });
        Ok(())
    }

    fn expect_bound(&self, kind: PipelineKind, what: &str) -> GalResult<()> {
        self.expect_outside_render(what)?;
        match &self.pipeline {
            Some(pipeline) if pipeline.kind() == kind => Ok(()),
            _ => Err(GalError::invalid_state(format!(
                "{what} requires a bound {kind:?} pipeline"
            ))),
        }
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> GalResult<()> {
        self.expect_bound(PipelineKind::Compute, "dispatch()")?;
        self.refresh_bound_sets(PipelineKind::Compute)?;
        self.commands.push(Command::Dispatch { x, y, z });
        Ok(())
    }

    pub fn dispatch_indirect(&mut self, buffer: &Arc<Buffer>, offset: u64) -> GalResult<()> {
        self.expect_bound(PipelineKind::Compute, "dispatch_indirect()")?;
        buffer.require_usage(BufferUsage::INDIRECT)?;
        if offset % 4 != 0 {
            return Err(GalError::descriptor("indirect offset must be 4-byte aligned"));
        }
        buffer.check_range(offset, DISPATCH_INDIRECT_SIZE)?;
        self.use_resource(buffer.clone(), ResourceState::IndirectArgument)?;
        self.refresh_bound_sets(PipelineKind::Compute)?;
        self.commands.push(Command::DispatchIndirect {
            buffer: buffer.native(),
            offset,
        });
        Ok(())
    }

    /// Traces `width * height * depth` rays through the bound pipeline's shader
    /// binding table.
    pub fn dispatch_rays(&mut self, width: u32, height: u32, depth: u32) -> GalResult<()> {
        self.expect_bound(PipelineKind::RayTracing, "dispatch_rays()")?;
        if width == 0 || height == 0 || depth == 0 {
            return Err(GalError::descriptor(format!(
                "ray dispatch {width}x{height}x{depth} has a zero dimension"
            )));
        }
        self.refresh_bound_sets(PipelineKind::RayTracing)?;
        self.commands.push(Command::DispatchRays {
            width,
            height,
            depth,
        });
        Ok(())
    }

    pub fn copy_buffer(
        &mut self,
        src: &Arc<Buffer>,
        src_offset: u64,
        dst: &Arc<Buffer>,
        dst_offset: u64,
        size: u64,
    ) -> GalResult<()> {
        self.expect_outside_render("copy_buffer()")?;
        if src.id() == dst.id() {
            return Err(GalError::descriptor("copy_buffer() source and destination are the same buffer"));
        }
        if size == 0 {
            return Err(GalError::descriptor("copy_buffer() of zero bytes"));
        }
        src.check_range(src_offset, size)?;
        dst.check_range(dst_offset, size)?;
        self.use_resource(src.clone(), ResourceState::CopySource)?;
        self.use_resource(dst.clone(), ResourceState::CopyDestination)?;
        self.commands.push(Command::CopyBuffer {
            src: src.native(),
            src_offset,
            dst: dst.native(),
            dst_offset,
            size,
        });
        Ok(())
    }

    /// Writes a small inline payload into `buffer` in command order.
    pub fn update_buffer(&mut self, buffer: &Arc<Buffer>, offset: u64, data: &[u8]) -> GalResult<()> {
        self.expect_outside_render("update_buffer()")?;
        if data.is_empty() || data.len() > MAX_UPDATE_BUFFER_SIZE || data.len() % 4 != 0 {
            return Err(GalError::descriptor(format!(
                "update_buffer() payload of {} bytes must be a non-zero multiple of 4 up to {MAX_UPDATE_BUFFER_SIZE}",
                data.len()
            )));
        }
        if offset % 4 != 0 {
            return Err(GalError::descriptor("update_buffer() offset must be 4-byte aligned"));
        }
        buffer.check_range(offset, data.len() as u64)?;
        self.use_resource(buffer.clone(), ResourceState::CopyDestination)?;
        self.commands.push(Command::UpdateBuffer {
            buffer: buffer.native(),
            offset,
            data: data.to_vec(),
        });
        Ok(())
    }

    pub fn copy_buffer_to_texture(
        &mut self,
        buffer: &Arc<Buffer>,
        offset: u64,
        texture: &Arc<Texture>,
        region: TextureRegion,
    ) -> GalResult<()> {
        self.expect_outside_render("copy_buffer_to_texture()")?;
        texture.require_usage(TextureUsage::COPY_DST)?;
        region.validate(texture.descriptor())?;
        buffer.check_range(offset, region.data_size(texture.format()))?;
        self.use_resource(buffer.clone(), ResourceState::CopySource)?;
        self.use_resource(texture.clone(), ResourceState::CopyDestination)?;
        self.commands.push(Command::CopyBufferToTexture {
            buffer: buffer.native(),
            offset,
            texture: texture.native(),
            region,
        });
        Ok(())
    }

    pub fn copy_texture_to_buffer(
        &mut self,
        texture: &Arc<Texture>,
        region: TextureRegion,
        buffer: &Arc<Buffer>,
        offset: u64,
    ) -> GalResult<()> {
        self.expect_outside_render("copy_texture_to_buffer()")?;
        texture.require_usage(TextureUsage::COPY_SRC)?;
        region.validate(texture.descriptor())?;
        buffer.check_range(offset, region.data_size(texture.format()))?;
        self.use_resource(texture.clone(), ResourceState::CopySource)?;
        self.use_resource(buffer.clone(), ResourceState::CopyDestination)?;
        self.commands.push(Command::CopyTextureToBuffer {
            texture: texture.native(),
            region,
            buffer: buffer.native(),
            offset,
        });
        Ok(())
    }

    /// Copies `src_region` of `src` into `dst` at `dst_region`; extents must match.
    pub fn copy_texture(
        &mut self,
        src: &Arc<Texture>,
        src_region: TextureRegion,
        dst: &Arc<Texture>,
        dst_region: TextureRegion,
    ) -> GalResult<()> {
        self.expect_outside_render("copy_texture()")?;
        if src.id() == dst.id() {
            return Err(GalError::descriptor("copy_texture() within one texture"));
        }
        src.require_usage(TextureUsage::COPY_SRC)?;
        dst.require_usage(TextureUsage::COPY_DST)?;
        if src.format() != dst.format() || src_region.extent != dst_region.extent {
            return Err(GalError::descriptor(format!(
                "copy_texture() between {:?} {:?} and {:?} {:?}",
                src.format(),
                src_region.extent,
                dst.format(),
                dst_region.extent
            )));
        }
        src_region.validate(src.descriptor())?;
        dst_region.validate(dst.descriptor())?;
        self.use_resource(src.clone(), ResourceState::CopySource)?;
        self.use_resource(dst.clone(), ResourceState::CopyDestination)?;
        self.commands.push(Command::CopyTexture {
            src: src.native(),
            src_region,
            dst: dst.native(),
            dst_region,
        });
        Ok(())
    }

    /// Resolves a multisampled texture into a single-sample one of the same format.
    pub fn resolve_texture(&mut self, src: &Arc<Texture>, dst: &Arc<Texture>) -> GalResult<()> {
        self.expect_outside_render("resolve_texture()")?;
        if src.sample_count() == 1
            || dst.sample_count() != 1
            || src.format() != dst.format()
            || (src.width(), src.height()) != (dst.width(), dst.height())
        {
            return Err(GalError::descriptor(
                "resolve_texture() needs a multisampled source and a matching single-sample destination",
            ));
        }
        self.use_resource(src.clone(), ResourceState::ResolveSource)?;
        self.use_resource(dst.clone(), ResourceState::ResolveDestination)?;
        self.commands.push(Command::ResolveTexture {
            src: src.native(),
            dst: dst.native(),
        });
        Ok(())
    }

    pub(crate) fn build_acceleration_structure(&mut self, record: BuildRecord<'_>) -> GalResult<()> {
        self.expect_outside_render("an acceleration structure build")?;
        self.expect_queue(
            &[QueueKind::Graphics, QueueKind::Compute],
            "an acceleration structure build",
        )?;
        for buffer in record.inputs {
            self.use_resource(buffer.clone(), ResourceState::AccelerationStructureBuildInput)?;
        }
        for buffer in record.dependencies {
            self.use_resource(buffer.clone(), ResourceState::AccelerationStructureRead)?;
        }
        self.use_resource(record.result.clone(), ResourceState::AccelerationStructureWrite)?;
        self.use_resource(record.scratch.clone(), ResourceState::AccelerationStructureWrite)?;
        self.commands.push(Command::BuildAccelerationStructure {
            input: record.input,
            destination: record.destination,
            source: record.source,
            scratch_address: record.scratch_address,
        });
        self.use_resource(record.result.clone(), ResourceState::AccelerationStructureRead)
    }

    /// Tracked uses, in first-use order.
    pub(crate) fn uses(&self) -> &[ResourceUse] {
        &self.uses
    }

    /// Hands the recorded commands to a commit.
    pub(crate) fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    /// Publishes final states after a successful submit and marks every referenced
    /// resource as in use until `token` completes.
    pub(crate) fn mark_submitted(&mut self, token: SubmissionToken) {
        for entry in &self.uses {
            entry.resource.state_cell().set(TrackedState {
                state: entry.current,
                owner: Some(self.queue),
                released_to: entry.released_to,
            });
            entry.resource.base().usage.record(token);
        }
        for resource in self.retained.values() {
            resource.base().usage.record(token);
        }
        self.token = Some(token);
        self.state = CommandBufferState::Submitted;
    }

    /// Returns a buffer whose submit failed to the initial state.
    pub(crate) fn mark_failed(&mut self) {
        self.clear();
        self.state = CommandBufferState::Initial;
    }

    /// After a blocking wait, leaves the resources this buffer used idle and
    /// unowned so that any queue may pick them up without an ownership transfer.
    pub(crate) fn settle_ownership(&self) {
        for entry in &self.uses {
            let mut tracked = entry.resource.state_cell().get();
            if tracked.owner == Some(self.queue) && tracked.released_to.is_none() {
                tracked.owner = None;
                entry.resource.state_cell().set(tracked);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{
        BindingResource, ResourceKind, ResourceLayoutDescriptor, ResourceLayoutElement,
        ResourceSetDescriptor, SetEntry,
    };
    use crate::buffer::BufferDescriptor;
    use crate::config::ContextConfig;
    use crate::context::{BackendKind, GraphicsContext};
    use crate::device::Device;
    use crate::pipeline::ComputePipelineDescriptor;
    use crate::shader::{ShaderStage, ShaderStages};

    fn device() -> Device {
        GraphicsContext::create_with_config(BackendKind::Headless, ContextConfig::default())
            .and_then(|context| context.create_device())
            .unwrap()
    }

    fn command_buffer(device: &Device, queue: QueueKind) -> CommandBuffer {
        CommandBuffer::new(device.factory().device().clone(), queue)
    }

    /// A compute pipeline with one read-write storage buffer, its set, and the buffer.
    fn storage_pipeline(device: &Device) -> (Arc<Pipeline>, Arc<ResourceSet>, Arc<Buffer>) {
        let factory = device.factory();
        let layout = factory
            .create_resource_layout(&ResourceLayoutDescriptor {
                label: None,
                elements: vec![ResourceLayoutElement::new(
                    "data",
                    ResourceKind::StorageBufferReadWrite,
                    ShaderStages::COMPUTE,
                )],
            })
            .unwrap();
        let data = factory
            .create_buffer(&BufferDescriptor::new(64, BufferUsage::STORAGE))
            .unwrap();
        let set = factory
            .create_resource_set(&ResourceSetDescriptor {
                label: None,
                layout: layout.clone(),
                entries: vec![SetEntry::Single(BindingResource::buffer(&data))],
            })
            .unwrap();
        let shader = factory
            .create_shader(ShaderStage::Compute, &[0x03, 0x02, 0x23, 0x07, 0, 0, 1, 0], "main")
            .unwrap();
        let pipeline = factory
            .create_compute_pipeline(&ComputePipelineDescriptor {
                label: None,
                shader,
                layouts: vec![layout],
            })
            .unwrap();
        (pipeline, set, data)
    }

    #[test]
    fn begin_is_rejected_until_the_buffer_is_reusable() {
        let device = device();
        let mut commands = command_buffer(&device, QueueKind::Graphics);
        commands.begin().unwrap();
        assert!(matches!(commands.begin(), Err(GalError::InvalidState(_))));
        commands.end().unwrap();
        assert!(matches!(commands.begin(), Err(GalError::InvalidState(_))));

        // A submission whose timeline value has not been reached yet.
        commands.state = CommandBufferState::Submitted;
        commands.token = Some(SubmissionToken {
            queue: QueueKind::Graphics,
            value: u64::MAX,
        });
        assert_eq!(commands.state(), CommandBufferState::Submitted);
        assert!(!commands.is_reusable());
        assert!(matches!(commands.begin(), Err(GalError::InvalidState(_))));
        assert!(matches!(commands.reset(), Err(GalError::InvalidState(_))));
    }

    #[test]
    fn open_compute_scopes_block_end() {
        let device = device();
        let mut commands = command_buffer(&device, QueueKind::Compute);
        commands.begin().unwrap();
        commands.begin_compute_pass("scope").unwrap();
        assert!(matches!(commands.end(), Err(GalError::InvalidState(_))));
        assert_eq!(commands.state(), CommandBufferState::Recording);
        commands.end_compute_pass().unwrap();
        commands.end().unwrap();
        assert_eq!(commands.state(), CommandBufferState::Closed);
    }

    #[test]
    fn dispatch_moves_bound_resources_back_after_a_copy() {
        let device = device();
        let (pipeline, set, data) = storage_pipeline(&device);
        let staging = device
            .factory()
            .create_buffer(&BufferDescriptor::new(64, BufferUsage::STORAGE))
            .unwrap();
        let mut commands = command_buffer(&device, QueueKind::Compute);
        commands.begin().unwrap();
        commands.bind_pipeline(&pipeline).unwrap();
        commands.bind_resource_set(0, &set).unwrap();
        commands.copy_buffer(&staging, 0, &data, 0, 64).unwrap();
        commands.dispatch(1, 1, 1).unwrap();

        let recorded = commands.commands();
        let n = recorded.len();
        assert!(matches!(recorded[n - 1], Command::Dispatch { .. }));
        match &recorded[n - 2] {
            Command::Barrier(transitions) => {
                assert_eq!(transitions.len(), 1);
                assert_eq!(transitions[0].before, ResourceState::CopyDestination);
                assert_eq!(transitions[0].after, ResourceState::UnorderedAccess);
            }
            other => panic!("expected a barrier before the dispatch, got {other:?}"),
        }

        // Nothing moved since; the second dispatch needs no barrier.
        commands.dispatch(1, 1, 1).unwrap();
        assert_eq!(commands.command_count(), n + 1);
    }

    #[test]
    fn execution_rejects_a_dispatch_over_a_moved_resource() {
        let device = device();
        let (pipeline, set, data) = storage_pipeline(&device);
        let staging = device
            .factory()
            .create_buffer(&BufferDescriptor::new(64, BufferUsage::STORAGE))
            .unwrap();
        let mut commands = command_buffer(&device, QueueKind::Compute);
        commands.begin().unwrap();
        commands.bind_pipeline(&pipeline).unwrap();
        commands.bind_resource_set(0, &set).unwrap();
        commands.copy_buffer(&staging, 0, &data, 0, 64).unwrap();
        // Skips the transition `dispatch()` would record.
        commands.commands.push(Command::Dispatch { x: 1, y: 1, z: 1 });
        commands.end().unwrap();

        let err = device
            .command_processor(QueueKind::Compute)
            .commit(&mut commands)
            .unwrap_err();
        assert!(matches!(err, GalError::Backend(_)));
        assert!(err.to_string().contains("expected UnorderedAccess"), "{err}");
        assert_eq!(device.statistics().dispatches, 0);
    }
}
