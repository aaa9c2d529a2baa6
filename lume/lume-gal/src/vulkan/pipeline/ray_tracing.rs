//! Vulkan ray tracing pipelines and shader binding tables.

use ash::vk;

use crate::error::{GalError, GalResult};
use crate::pipeline::{HitGroup, PipelineKind, RayTracingPipelineDescriptor};

use super::{pipeline_error, shader_stage_to_vk, PipelineEntry};
use crate::vulkan::memory::{self, MemoryLocation};
use crate::vulkan::queue::{destroy_garbage, Garbage};
use crate::vulkan::VulkanBackend;

/// Shader binding table of a ray tracing pipeline, in its own host-visible buffer.
#[derive(Debug, Clone)]
pub(in crate::vulkan) struct ShaderBindingTable {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit: vk::StridedDeviceAddressRegionKHR,
    pub callable: vk::StridedDeviceAddressRegionKHR,
}

fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

/// Offsets of the three table regions: ray generation, misses, hit groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SbtLayout {
    handle_size: u64,
    stride: u64,
    /// `(offset, size)` per region.
    regions: [(u64, u64); 3],
    total: u64,
}

impl SbtLayout {
    fn new(
        handle_size: u32,
        handle_alignment: u32,
        base_alignment: u32,
        miss_count: u32,
        hit_count: u32,
    ) -> Self {
        let handle_size = handle_size as u64;
        let base = base_alignment.max(1) as u64;
        let stride = align_up(handle_size, handle_alignment.max(1) as u64);
        // The ray generation region's stride must equal its size.
        let raygen_size = align_up(stride, base);
        let miss_size = align_up(stride * miss_count as u64, base);
        let hit_size = align_up(stride * hit_count as u64, base);
        let regions = [
            (0, raygen_size),
            (raygen_size, miss_size),
            (raygen_size + miss_size, hit_size),
        ];
        Self {
            handle_size,
            stride,
            regions,
            total: raygen_size + miss_size + hit_size,
        }
    }

    /// Byte offset of handle `index_in_region` within `region`.
    fn group_offset(&self, region: usize, index_in_region: u64) -> u64 {
        self.regions[region].0 + index_in_region * self.stride
    }
}

fn general_group(shader: u32) -> vk::RayTracingShaderGroupCreateInfoKHR<'static> {
    vk::RayTracingShaderGroupCreateInfoKHR::default()
        .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
        .general_shader(shader)
        .closest_hit_shader(vk::SHADER_UNUSED_KHR)
        .any_hit_shader(vk::SHADER_UNUSED_KHR)
        .intersection_shader(vk::SHADER_UNUSED_KHR)
}

/// Groups in table order: ray generation, misses, then hit groups.
fn shader_groups(
    ray_generation: u32,
    miss: &[u32],
    hit_groups: &[HitGroup],
) -> Vec<vk::RayTracingShaderGroupCreateInfoKHR<'static>> {
    let mut groups = Vec::with_capacity(1 + miss.len() + hit_groups.len());
    groups.push(general_group(ray_generation));
    groups.extend(miss.iter().map(|&m| general_group(m)));
    for hit in hit_groups {
        let ty = if hit.intersection.is_some() {
            vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP
        } else {
            vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP
        };
        groups.push(
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(ty)
                .general_shader(vk::SHADER_UNUSED_KHR)
                .closest_hit_shader(hit.closest_hit.unwrap_or(vk::SHADER_UNUSED_KHR))
                .any_hit_shader(hit.any_hit.unwrap_or(vk::SHADER_UNUSED_KHR))
                .intersection_shader(hit.intersection.unwrap_or(vk::SHADER_UNUSED_KHR)),
        );
    }
    groups
}

impl VulkanBackend {
    pub(in crate::vulkan) fn new_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDescriptor,
    ) -> GalResult<PipelineEntry> {
        let loader = self.ray_tracing.as_ref().ok_or_else(|| {
            GalError::UnsupportedCapability(format!(
                "ray tracing pipelines are not supported on '{}'",
                self.caps.device_name
            ))
        })?;
        let shaders = desc
            .shaders
            .iter()
            .map(|s| self.shader(s))
            .collect::<GalResult<Vec<_>>>()?;
        let stages: Vec<vk::PipelineShaderStageCreateInfo> = shaders
            .iter()
            .map(|s| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(shader_stage_to_vk(s.stage))
                    .module(s.module)
                    .name(&s.entry_point)
            })
            .collect();
        let groups = shader_groups(desc.ray_generation, &desc.miss, &desc.hit_groups);

        let layout = self.pipeline_layout(&desc.layouts)?;
        let interface = vk::RayTracingPipelineInterfaceCreateInfoKHR::default()
            .max_pipeline_ray_payload_size(desc.max_payload_size)
            .max_pipeline_ray_hit_attribute_size(desc.max_attribute_size);
        let create_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(desc.max_recursion_depth)
            .library_interface(&interface)
            .layout(layout);
        let created = unsafe {
            loader.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[create_info],
                None,
            )
        }
        .map_err(|(_, e)| pipeline_error("create_ray_tracing_pipelines", e))
        .and_then(|pipelines| {
            pipelines
                .first()
                .copied()
                .ok_or_else(|| GalError::Backend("no ray tracing pipeline created".into()))
        });
        let pipeline = match created {
            Ok(pipeline) => pipeline,
            Err(err) => {
                unsafe { self.device.destroy_pipeline_layout(layout, None) };
                return Err(err);
            }
        };

        match self.shader_binding_table(loader, pipeline, desc) {
            Ok(sbt) => {
                log::debug!(
                    "ray tracing pipeline {:?} created with {} groups",
                    desc.label,
                    groups.len()
                );
                Ok(PipelineEntry {
                    pipeline,
                    layout,
                    kind: PipelineKind::RayTracing,
                    render_pass: None,
                    sbt: Some(sbt),
                })
            }
            Err(err) => {
                unsafe {
                    self.device.destroy_pipeline(pipeline, None);
                    self.device.destroy_pipeline_layout(layout, None);
                }
                Err(err)
            }
        }
    }

    fn shader_binding_table(
        &self,
        loader: &ash::khr::ray_tracing_pipeline::Device,
        pipeline: vk::Pipeline,
        desc: &RayTracingPipelineDescriptor,
    ) -> GalResult<ShaderBindingTable> {
        let limits = &self.adapter.limits;
        let group_count = desc.group_count();
        let layout = SbtLayout::new(
            limits.shader_group_handle_size,
            limits.shader_group_handle_alignment,
            limits.shader_group_base_alignment,
            desc.miss.len() as u32,
            desc.hit_groups.len() as u32,
        );
        let handle_size = layout.handle_size as usize;
        let handles = unsafe {
            loader.get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                group_count,
                handle_size * group_count as usize,
            )
        }
        .map_err(|e| pipeline_error("get_ray_tracing_shader_group_handles", e))?;

        let mut table = vec![0u8; layout.total as usize];
        let mut place = |group: usize, offset: u64| {
            let src = &handles[group * handle_size..(group + 1) * handle_size];
            let offset = offset as usize;
            table[offset..offset + handle_size].copy_from_slice(src);
        };
        place(0, layout.group_offset(0, 0));
        for i in 0..desc.miss.len() {
            place(1 + i, layout.group_offset(1, i as u64));
        }
        for i in 0..desc.hit_groups.len() {
            place(1 + desc.miss.len() + i, layout.group_offset(2, i as u64));
        }

        let (buffer, memory) = self.allocate_buffer(
            layout.total,
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::HostVisible,
            "shader binding table",
        )?;
        if let Err(err) = memory::write_mapped(&self.device, memory, 0, &table) {
            destroy_garbage(&self.device, vec![Garbage::Buffer(buffer, memory)]);
            return Err(err);
        }
        let address = unsafe {
            self.device
                .get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer))
        };
        let region = |index: usize, stride: u64| {
            let (offset, size) = layout.regions[index];
            vk::StridedDeviceAddressRegionKHR {
                device_address: if size == 0 { 0 } else { address + offset },
                stride: if size == 0 { 0 } else { stride },
                size,
            }
        };
        Ok(ShaderBindingTable {
            buffer,
            memory,
            raygen: region(0, layout.regions[0].1),
            miss: region(1, layout.stride),
            hit: region(2, layout.stride),
            callable: vk::StridedDeviceAddressRegionKHR::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_regions_start_on_base_alignment() {
        let layout = SbtLayout::new(32, 32, 64, 2, 1);
        assert_eq!(layout.stride, 32);
        assert_eq!(layout.regions[0], (0, 64));
        assert_eq!(layout.regions[1], (64, 64));
        assert_eq!(layout.regions[2], (128, 64));
        assert_eq!(layout.total, 192);
        assert_eq!(layout.group_offset(1, 1), 96);
    }

    #[test]
    fn handles_are_padded_to_their_alignment() {
        let layout = SbtLayout::new(20, 32, 32, 0, 3);
        assert_eq!(layout.stride, 32);
        assert_eq!(layout.regions[1].1, 0);
        assert_eq!(layout.regions[2], (32, 96));
    }

    #[test]
    fn intersection_shaders_make_procedural_groups() {
        let hit = HitGroup {
            closest_hit: Some(2),
            any_hit: None,
            intersection: Some(3),
        };
        let triangles = HitGroup {
            closest_hit: Some(2),
            ..HitGroup::default()
        };
        let groups = shader_groups(0, &[1], &[hit, triangles]);
        assert_eq!(groups.len(), 4);
        assert_eq!(groups[0].ty, vk::RayTracingShaderGroupTypeKHR::GENERAL);
        assert_eq!(groups[1].general_shader, 1);
        assert_eq!(groups[2].ty, vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP);
        assert_eq!(groups[2].any_hit_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(groups[3].ty, vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP);
    }
}
