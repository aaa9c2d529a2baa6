//! Mapping of resource states to pipeline stages, access masks and image layouts,
//! and batching of the resulting barriers.

use ash::vk;

use crate::format::TextureAspect;
use crate::state::ResourceState;

/// Optional stages the device was created with. Stage bits of disabled
/// extensions must never appear in a barrier.
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct StageSupport {
    pub acceleration_structures: bool,
    pub ray_tracing: bool,
}

impl StageSupport {
    fn shaders(self) -> vk::PipelineStageFlags {
        let mut stages = vk::PipelineStageFlags::VERTEX_SHADER
            | vk::PipelineStageFlags::FRAGMENT_SHADER
            | vk::PipelineStageFlags::COMPUTE_SHADER;
        if self.ray_tracing {
            stages |= vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR;
        }
        stages
    }

    fn build(self) -> vk::PipelineStageFlags {
        if self.acceleration_structures {
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR
        } else {
            vk::PipelineStageFlags::ALL_COMMANDS
        }
    }
}

/// How a state is accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct StateAccess {
    pub stages: vk::PipelineStageFlags,
    pub access: vk::AccessFlags,
    pub layout: vk::ImageLayout,
}

pub(super) fn state_access(state: ResourceState, support: StageSupport) -> StateAccess {
    use vk::AccessFlags as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags as S;
    let (stages, access, layout) = match state {
        ResourceState::Undefined => (S::TOP_OF_PIPE, A::empty(), L::UNDEFINED),
        ResourceState::Common => (
            S::ALL_COMMANDS,
            A::MEMORY_READ | A::MEMORY_WRITE,
            L::GENERAL,
        ),
        ResourceState::VertexBuffer => (S::VERTEX_INPUT, A::VERTEX_ATTRIBUTE_READ, L::GENERAL),
        ResourceState::IndexBuffer => (S::VERTEX_INPUT, A::INDEX_READ, L::GENERAL),
        ResourceState::ConstantBuffer => (support.shaders(), A::UNIFORM_READ, L::GENERAL),
        ResourceState::IndirectArgument => {
            (S::DRAW_INDIRECT, A::INDIRECT_COMMAND_READ, L::GENERAL)
        }
        ResourceState::ShaderRead => (
            support.shaders(),
            A::SHADER_READ,
            L::SHADER_READ_ONLY_OPTIMAL,
        ),
        ResourceState::UnorderedAccess => (
            support.shaders(),
            A::SHADER_READ | A::SHADER_WRITE,
            L::GENERAL,
        ),
        ResourceState::RenderTarget => (
            S::COLOR_ATTACHMENT_OUTPUT,
            A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
            L::COLOR_ATTACHMENT_OPTIMAL,
        ),
        ResourceState::DepthWrite => (
            S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ),
        ResourceState::DepthRead => (
            S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS | support.shaders(),
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::SHADER_READ,
            L::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        ),
        ResourceState::CopySource | ResourceState::ResolveSource => {
            (S::TRANSFER, A::TRANSFER_READ, L::TRANSFER_SRC_OPTIMAL)
        }
        ResourceState::CopyDestination | ResourceState::ResolveDestination => {
            (S::TRANSFER, A::TRANSFER_WRITE, L::TRANSFER_DST_OPTIMAL)
        }
        ResourceState::AccelerationStructureBuildInput => {
            (support.build(), A::SHADER_READ, L::GENERAL)
        }
        ResourceState::AccelerationStructureRead if support.acceleration_structures => (
            support.build() | support.shaders(),
            A::ACCELERATION_STRUCTURE_READ_KHR,
            L::GENERAL,
        ),
        ResourceState::AccelerationStructureWrite if support.acceleration_structures => (
            support.build(),
            A::ACCELERATION_STRUCTURE_READ_KHR | A::ACCELERATION_STRUCTURE_WRITE_KHR,
            L::GENERAL,
        ),
        ResourceState::AccelerationStructureRead | ResourceState::AccelerationStructureWrite => (
            S::ALL_COMMANDS,
            A::MEMORY_READ | A::MEMORY_WRITE,
            L::GENERAL,
        ),
        ResourceState::Present => (S::BOTTOM_OF_PIPE, A::empty(), L::PRESENT_SRC_KHR),
    };
    StateAccess {
        stages,
        access,
        layout,
    }
}

pub(super) fn aspect_to_vk(aspect: TextureAspect) -> vk::ImageAspectFlags {
    match aspect {
        TextureAspect::Color => vk::ImageAspectFlags::COLOR,
        TextureAspect::Depth => vk::ImageAspectFlags::DEPTH,
        TextureAspect::DepthStencil => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
    }
}

/// Every mip and layer of the given aspect.
pub(super) fn whole_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(aspect)
        .base_mip_level(0)
        .level_count(vk::REMAINING_MIP_LEVELS)
        .base_array_layer(0)
        .layer_count(vk::REMAINING_ARRAY_LAYERS)
}

/// Barriers collected for one `vkCmdPipelineBarrier`.
#[derive(Debug, Default)]
pub(super) struct BarrierBatch {
    support: StageSupport,
    src_stages: vk::PipelineStageFlags,
    dst_stages: vk::PipelineStageFlags,
    buffers: Vec<vk::BufferMemoryBarrier<'static>>,
    images: Vec<vk::ImageMemoryBarrier<'static>>,
    memory: Option<vk::MemoryBarrier<'static>>,
}

impl BarrierBatch {
    pub fn new(support: StageSupport) -> Self {
        Self {
            support,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.images.is_empty() && self.memory.is_none()
    }

    fn stages(&mut self, before: StateAccess, after: StateAccess) {
        self.src_stages |= before.stages;
        self.dst_stages |= after.stages;
    }

    pub fn buffer(&mut self, buffer: vk::Buffer, before: ResourceState, after: ResourceState) {
        let (from, to) = (
            state_access(before, self.support),
            state_access(after, self.support),
        );
        self.stages(from, to);
        self.buffers.push(
            vk::BufferMemoryBarrier::default()
                .src_access_mask(from.access)
                .dst_access_mask(to.access)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .buffer(buffer)
                .offset(0)
                .size(vk::WHOLE_SIZE),
        );
    }

    pub fn image(
        &mut self,
        image: vk::Image,
        range: vk::ImageSubresourceRange,
        before: ResourceState,
        after: ResourceState,
    ) {
        let (from, to) = (
            state_access(before, self.support),
            state_access(after, self.support),
        );
        self.stages(from, to);
        self.images.push(
            vk::ImageMemoryBarrier::default()
                .src_access_mask(from.access)
                .dst_access_mask(to.access)
                .old_layout(from.layout)
                .new_layout(to.layout)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(range),
        );
    }

    /// Orders shader writes against later shader reads and writes.
    pub fn unordered_access(&mut self) {
        let access = state_access(ResourceState::UnorderedAccess, self.support);
        self.stages(access, access);
        self.memory = Some(
            vk::MemoryBarrier::default()
                .src_access_mask(access.access)
                .dst_access_mask(access.access),
        );
    }

    pub fn record(self, device: &ash::Device, cmd: vk::CommandBuffer) {
        if self.is_empty() {
            return;
        }
        let src = if self.src_stages.is_empty() {
            vk::PipelineStageFlags::TOP_OF_PIPE
        } else {
            self.src_stages
        };
        let dst = if self.dst_stages.is_empty() {
            vk::PipelineStageFlags::BOTTOM_OF_PIPE
        } else {
            self.dst_stages
        };
        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                src,
                dst,
                vk::DependencyFlags::empty(),
                self.memory.as_slice(),
                &self.buffers,
                &self.images,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_states_pick_their_layouts() {
        let support = StageSupport::default();
        assert_eq!(
            state_access(ResourceState::RenderTarget, support).layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            state_access(ResourceState::Present, support).layout,
            vk::ImageLayout::PRESENT_SRC_KHR
        );
        assert_eq!(
            state_access(ResourceState::ResolveDestination, support).layout,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );
    }

    #[test]
    fn disabled_extensions_never_leak_stage_bits() {
        let plain = StageSupport::default();
        for state in [
            ResourceState::ShaderRead,
            ResourceState::AccelerationStructureBuildInput,
            ResourceState::AccelerationStructureWrite,
        ] {
            let stages = state_access(state, plain).stages;
            assert!(!stages.contains(vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR));
            assert!(!stages.contains(vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR));
        }
        let full = StageSupport {
            acceleration_structures: true,
            ray_tracing: true,
        };
        assert!(state_access(ResourceState::AccelerationStructureRead, full)
            .stages
            .contains(vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR));
    }

    #[test]
    fn empty_batches_record_nothing() {
        let mut batch = BarrierBatch::new(StageSupport::default());
        assert!(batch.is_empty());
        batch.unordered_access();
        assert!(!batch.is_empty());
    }
}
