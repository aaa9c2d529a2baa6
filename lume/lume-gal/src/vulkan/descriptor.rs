//! Descriptor set layouts and sets. Each slot is one binding; every set gets its
//! own exactly-sized pool so it can be freed on its own.

use ash::vk;

use crate::backend::NativeHandle;
use crate::binding::{BindingWrite, LayoutSlot, NativeBinding, ResourceKind};
use crate::error::{GalError, GalResult};
use crate::shader::ShaderStages;

use super::{vk_error, VulkanBackend};

#[derive(Debug, Clone)]
pub(super) struct LayoutEntry {
    pub layout: vk::DescriptorSetLayout,
    pub slots: Vec<LayoutSlot>,
    pub update_after_bind: bool,
}

#[derive(Debug, Clone)]
pub(super) struct SetEntry {
    pub pool: vk::DescriptorPool,
    pub set: vk::DescriptorSet,
    pub slots: Vec<LayoutSlot>,
}

pub(super) fn descriptor_type(kind: ResourceKind) -> vk::DescriptorType {
    match kind {
        ResourceKind::ConstantBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        ResourceKind::StorageBufferReadOnly | ResourceKind::StorageBufferReadWrite => {
            vk::DescriptorType::STORAGE_BUFFER
        }
        ResourceKind::SampledTexture => vk::DescriptorType::SAMPLED_IMAGE,
        ResourceKind::StorageTexture => vk::DescriptorType::STORAGE_IMAGE,
        ResourceKind::Sampler => vk::DescriptorType::SAMPLER,
        ResourceKind::AccelerationStructure => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
    }
}

/// Stage flags for `stages`. Ray tracing stages are dropped on devices without
/// ray tracing pipelines, where they are not valid in a layout.
pub(super) fn shader_stages_to_vk(stages: ShaderStages, ray_tracing: bool) -> vk::ShaderStageFlags {
    let pairs = [
        (ShaderStages::VERTEX, vk::ShaderStageFlags::VERTEX),
        (ShaderStages::FRAGMENT, vk::ShaderStageFlags::FRAGMENT),
        (ShaderStages::COMPUTE, vk::ShaderStageFlags::COMPUTE),
        (ShaderStages::RAY_GENERATION, vk::ShaderStageFlags::RAYGEN_KHR),
        (ShaderStages::MISS, vk::ShaderStageFlags::MISS_KHR),
        (ShaderStages::CLOSEST_HIT, vk::ShaderStageFlags::CLOSEST_HIT_KHR),
        (ShaderStages::ANY_HIT, vk::ShaderStageFlags::ANY_HIT_KHR),
        (ShaderStages::INTERSECTION, vk::ShaderStageFlags::INTERSECTION_KHR),
        (ShaderStages::CALLABLE, vk::ShaderStageFlags::CALLABLE_KHR),
    ];
    let mut flags = vk::ShaderStageFlags::empty();
    for (ours, theirs) in pairs {
        if stages.contains(ours) && (ray_tracing || !ShaderStages::RAY_TRACING.contains(ours)) {
            flags |= theirs;
        }
    }
    flags
}

/// Binding flags for `slot`, given whether the device supports descriptor indexing.
fn binding_flags(slot: &LayoutSlot, indexing: bool) -> vk::DescriptorBindingFlags {
    let mut flags = vk::DescriptorBindingFlags::empty();
    if !indexing {
        return flags;
    }
    if slot.array {
        flags |= vk::DescriptorBindingFlags::PARTIALLY_BOUND;
    }
    if slot.bindless && slot.kind != ResourceKind::AccelerationStructure {
        flags |= vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
            | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING;
    }
    flags
}

/// Descriptor counts per type for one set of `slots`.
fn pool_sizes(slots: &[LayoutSlot]) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for slot in slots {
        let ty = descriptor_type(slot.kind);
        match sizes.iter_mut().find(|s| s.ty == ty) {
            Some(size) => size.descriptor_count += slot.capacity,
            None => sizes.push(
                vk::DescriptorPoolSize::default()
                    .ty(ty)
                    .descriptor_count(slot.capacity),
            ),
        }
    }
    sizes
}

impl VulkanBackend {
    pub(super) fn new_layout(&self, slots: &[LayoutSlot]) -> GalResult<LayoutEntry> {
        if !self.caps.acceleration_structures()
            && slots.iter().any(|s| s.kind == ResourceKind::AccelerationStructure)
        {
            return Err(GalError::UnsupportedCapability(format!(
                "acceleration structure bindings need ray tracing or ray query on '{}'",
                self.caps.device_name
            )));
        }
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = slots
            .iter()
            .map(|slot| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(slot.slot)
                    .descriptor_type(descriptor_type(slot.kind))
                    .descriptor_count(slot.capacity)
                    .stage_flags(shader_stages_to_vk(slot.stages, self.caps.ray_tracing))
            })
            .collect();
        let flags: Vec<vk::DescriptorBindingFlags> = slots
            .iter()
            .map(|slot| binding_flags(slot, self.caps.bindless))
            .collect();
        let update_after_bind = flags
            .iter()
            .any(|f| f.contains(vk::DescriptorBindingFlags::UPDATE_AFTER_BIND));
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&flags);
        let mut create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        if flags.iter().any(|f| !f.is_empty()) {
            create_info = create_info.push_next(&mut flags_info);
        }
        if update_after_bind {
            create_info =
                create_info.flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL);
        }
        let layout = unsafe { self.device.create_descriptor_set_layout(&create_info, None) }
            .map_err(|e| vk_error("create_descriptor_set_layout", e))?;
        Ok(LayoutEntry {
            layout,
            slots: slots.to_vec(),
            update_after_bind,
        })
    }

    pub(super) fn new_set(
        &self,
        layout: NativeHandle,
        writes: &[BindingWrite],
    ) -> GalResult<SetEntry> {
        let layout = self.layouts.get(layout)?;
        let sizes = pool_sizes(&layout.slots);
        let mut pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(1)
            .pool_sizes(&sizes);
        if layout.update_after_bind {
            pool_info = pool_info.flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND);
        }
        let pool = unsafe { self.device.create_descriptor_pool(&pool_info, None) }.map_err(|e| {
            match e {
                vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                    GalError::oom("descriptor pool", 0)
                }
                other => vk_error("create_descriptor_pool", other),
            }
        })?;
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(std::slice::from_ref(&layout.layout));
        let set = unsafe { self.device.allocate_descriptor_sets(&allocate_info) }
            .map_err(|e| vk_error("allocate_descriptor_sets", e))
            .and_then(|sets| {
                sets.first()
                    .copied()
                    .ok_or_else(|| GalError::Backend("no descriptor set allocated".into()))
            });
        let entry = match set {
            Ok(set) => SetEntry {
                pool,
                set,
                slots: layout.slots,
            },
            Err(err) => {
                unsafe { self.device.destroy_descriptor_pool(pool, None) };
                return Err(err);
            }
        };
        if let Err(err) = self.write_set(&entry, writes) {
            self.free_set(&entry);
            return Err(err);
        }
        Ok(entry)
    }

    pub(super) fn free_set(&self, entry: &SetEntry) {
        // Destroying the pool frees its set.
        unsafe { self.device.destroy_descriptor_pool(entry.pool, None) };
    }

    pub(super) fn update_set(&self, set: NativeHandle, writes: &[BindingWrite]) -> GalResult<()> {
        let entry = self.sets.get(set)?;
        self.write_set(&entry, writes)
    }

    fn write_set(&self, entry: &SetEntry, writes: &[BindingWrite]) -> GalResult<()> {
        for write in writes {
            self.write_descriptor(entry, write)?;
        }
        Ok(())
    }

    fn write_descriptor(&self, entry: &SetEntry, write: &BindingWrite) -> GalResult<()> {
        let slot = entry
            .slots
            .iter()
            .find(|s| s.slot == write.slot)
            .ok_or_else(|| GalError::binding(format!("layout has no slot {}", write.slot)))?;
        if slot.kind != write.kind || write.index >= slot.capacity {
            return Err(GalError::binding(format!(
                "{:?}[{}] written into slot {} of {} x {:?}",
                write.kind, write.index, write.slot, slot.capacity, slot.kind
            )));
        }
        let base = vk::WriteDescriptorSet::default()
            .dst_set(entry.set)
            .dst_binding(write.slot)
            .dst_array_element(write.index)
            .descriptor_type(descriptor_type(slot.kind));
        let image_layout = if slot.kind == ResourceKind::StorageTexture {
            vk::ImageLayout::GENERAL
        } else {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        };
        match write.binding {
            NativeBinding::Buffer {
                buffer,
                offset,
                size,
            } => {
                let buffer = self.buffers.with(buffer, |b| b.buffer)?;
                let info = [vk::DescriptorBufferInfo::default()
                    .buffer(buffer)
                    .offset(offset)
                    .range(size)];
                unsafe {
                    self.device
                        .update_descriptor_sets(&[base.buffer_info(&info)], &[])
                };
            }
            NativeBinding::Texture(texture) => {
                let view = self.textures.with(texture, |t| t.view)?;
                self.write_image(base, view, image_layout);
            }
            NativeBinding::TextureView(view) => {
                let view = self.views.with(view, |v| v.view)?;
                self.write_image(base, view, image_layout);
            }
            NativeBinding::Sampler(sampler) => {
                let sampler = self.samplers.get(sampler)?;
                let info = [vk::DescriptorImageInfo::default().sampler(sampler)];
                unsafe {
                    self.device
                        .update_descriptor_sets(&[base.image_info(&info)], &[])
                };
            }
            NativeBinding::AccelerationStructure(structure) => {
                let structures = [self.structures.with(structure, |s| s.raw)?];
                let mut info = vk::WriteDescriptorSetAccelerationStructureKHR::default()
                    .acceleration_structures(&structures);
                let write = base.descriptor_count(1).push_next(&mut info);
                unsafe { self.device.update_descriptor_sets(&[write], &[]) };
            }
        }
        Ok(())
    }

    fn write_image(
        &self,
        base: vk::WriteDescriptorSet<'_>,
        view: vk::ImageView,
        layout: vk::ImageLayout,
    ) {
        let info = [vk::DescriptorImageInfo::default()
            .image_view(view)
            .image_layout(layout)];
        unsafe {
            self.device
                .update_descriptor_sets(&[base.image_info(&info)], &[])
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(slot: u32, kind: ResourceKind, capacity: u32, bindless: bool) -> LayoutSlot {
        LayoutSlot {
            slot,
            kind,
            stages: ShaderStages::FRAGMENT,
            capacity,
            array: capacity > 1 || bindless,
            bindless,
        }
    }

    #[test]
    fn pool_sizes_merge_slots_of_one_type() {
        let slots = [
            slot(0, ResourceKind::StorageBufferReadOnly, 1, false),
            slot(1, ResourceKind::StorageBufferReadWrite, 4, false),
            slot(2, ResourceKind::SampledTexture, 1024, true),
        ];
        let sizes = pool_sizes(&slots);
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].ty, vk::DescriptorType::STORAGE_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 5);
        assert_eq!(sizes[1].descriptor_count, 1024);
    }

    #[test]
    fn bindless_slots_update_after_bind() {
        let bindless = slot(0, ResourceKind::SampledTexture, 1024, true);
        let flags = binding_flags(&bindless, true);
        assert!(flags.contains(
            vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
                | vk::DescriptorBindingFlags::PARTIALLY_BOUND
        ));
        assert!(binding_flags(&bindless, false).is_empty());
        let structures = slot(1, ResourceKind::AccelerationStructure, 8, true);
        assert!(!binding_flags(&structures, true)
            .contains(vk::DescriptorBindingFlags::UPDATE_AFTER_BIND));
    }

    #[test]
    fn ray_tracing_stages_need_the_pipeline_extension() {
        let stages = ShaderStages::COMPUTE | ShaderStages::CLOSEST_HIT;
        assert_eq!(
            shader_stages_to_vk(stages, false),
            vk::ShaderStageFlags::COMPUTE
        );
        assert!(shader_stages_to_vk(stages, true).contains(vk::ShaderStageFlags::CLOSEST_HIT_KHR));
    }
}
