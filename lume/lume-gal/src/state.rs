//! Resource states, queues and transitions.

use std::sync::Mutex;

use crate::backend::NativeHandle;
use crate::format::TextureAspect;
use crate::resource::Resource;

/// Last-known GPU-visible usage of a buffer or texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// Contents undefined; the initial state of new textures.
    Undefined,
    /// Accessible by any queue; the initial state of new buffers.
    Common,
    VertexBuffer,
    IndexBuffer,
    ConstantBuffer,
    IndirectArgument,
    ShaderRead,
    UnorderedAccess,
    RenderTarget,
    DepthWrite,
    DepthRead,
    CopySource,
    CopyDestination,
    ResolveSource,
    ResolveDestination,
    /// Vertex, index, transform or instance data read by an acceleration structure build.
    AccelerationStructureBuildInput,
    /// Acceleration structure storage read by traversal or as a build source.
    AccelerationStructureRead,
    /// Acceleration structure storage (or scratch) written by a build.
    AccelerationStructureWrite,
    Present,
}

impl ResourceState {
    /// Whether the GPU may write the resource while in this state.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            ResourceState::UnorderedAccess
                | ResourceState::RenderTarget
                | ResourceState::DepthWrite
                | ResourceState::CopyDestination
                | ResourceState::ResolveDestination
                | ResourceState::AccelerationStructureWrite
        )
    }
}

/// Device queue a command buffer is submitted to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueKind {
    Graphics,
    Compute,
    Transfer,
}

impl QueueKind {
    pub const COUNT: usize = 3;
    pub const ALL: [QueueKind; Self::COUNT] =
        [QueueKind::Graphics, QueueKind::Compute, QueueKind::Transfer];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Completion token returned by `CommandProcessor::commit`.
///
/// Values on one queue are monotonic: a token is complete once the queue's
/// completed value reaches `value`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubmissionToken {
    pub queue: QueueKind,
    pub value: u64,
}

/// Native object a transition applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransitionTarget {
    Buffer(NativeHandle),
    Texture {
        handle: NativeHandle,
        aspect: TextureAspect,
    },
}

/// One resource state transition, optionally transferring queue ownership.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub target: TransitionTarget,
    pub before: ResourceState,
    pub after: ResourceState,
    /// `(source, destination)` when ownership moves between queues.
    pub queue_transfer: Option<(QueueKind, QueueKind)>,
}

impl Transition {
    pub fn new(target: TransitionTarget, before: ResourceState, after: ResourceState) -> Self {
        Self {
            target,
            before,
            after,
            queue_transfer: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TrackedState {
    pub state: ResourceState,
    /// Queue that last used the resource, if any.
    pub owner: Option<QueueKind>,
    /// Queue the owner explicitly released the resource to.
    pub released_to: Option<QueueKind>,
}

/// Global last-known state of a buffer or texture, published at commit time.
#[derive(Debug)]
pub(crate) struct StateCell(Mutex<TrackedState>);

impl StateCell {
    pub fn new(initial: ResourceState) -> Self {
        Self(Mutex::new(TrackedState {
            state: initial,
            owner: None,
            released_to: None,
        }))
    }

    pub fn get(&self) -> TrackedState {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, tracked: TrackedState) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = tracked;
    }
}

/// Buffers and textures: resources whose GPU state is tracked across command buffers.
pub(crate) trait Tracked: Resource {
    fn state_cell(&self) -> &StateCell;
    fn target(&self) -> TransitionTarget;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_states() {
        assert!(ResourceState::UnorderedAccess.is_write());
        assert!(ResourceState::AccelerationStructureWrite.is_write());
        assert!(!ResourceState::ShaderRead.is_write());
        assert!(!ResourceState::AccelerationStructureBuildInput.is_write());
    }

    #[test]
    fn queue_indices_are_dense() {
        for (i, queue) in QueueKind::ALL.iter().enumerate() {
            assert_eq!(queue.index(), i);
        }
    }
}
