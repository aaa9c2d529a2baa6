//! Acceleration structures over `VK_KHR_acceleration_structure`.

use ash::vk;

use crate::accel::{
    AccelerationStructureBuildInput, AccelerationStructureFlags, AccelerationStructureKind,
    BuildGeometry, BuildSizes, GeometryFlags,
};
use crate::backend::{DeviceAddress, NativeHandle};
use crate::error::{GalError, GalResult};
use crate::format::IndexFormat;

use super::pipeline::vertex_format_to_vk;
use super::{vk_error, VulkanBackend};

#[derive(Debug, Clone, Copy)]
pub(super) struct StructureEntry {
    pub raw: vk::AccelerationStructureKHR,
    /// Buffer the structure lives in; owned by the front end.
    pub buffer: NativeHandle,
    pub kind: AccelerationStructureKind,
    pub address: DeviceAddress,
}

pub(super) fn index_type_to_vk(format: IndexFormat) -> vk::IndexType {
    match format {
        IndexFormat::Uint16 => vk::IndexType::UINT16,
        IndexFormat::Uint32 => vk::IndexType::UINT32,
    }
}

fn structure_type(kind: AccelerationStructureKind) -> vk::AccelerationStructureTypeKHR {
    match kind {
        AccelerationStructureKind::BottomLevel => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        AccelerationStructureKind::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
    }
}

fn build_flags(flags: AccelerationStructureFlags) -> vk::BuildAccelerationStructureFlagsKHR {
    let mut out = vk::BuildAccelerationStructureFlagsKHR::empty();
    let pairs = [
        (
            AccelerationStructureFlags::PREFER_FAST_TRACE,
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
        ),
        (
            AccelerationStructureFlags::PREFER_FAST_BUILD,
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD,
        ),
        (
            AccelerationStructureFlags::MINIMIZE_MEMORY,
            vk::BuildAccelerationStructureFlagsKHR::LOW_MEMORY,
        ),
        (
            AccelerationStructureFlags::ALLOW_UPDATE,
            vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE,
        ),
        (
            AccelerationStructureFlags::ALLOW_COMPACTION,
            vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION,
        ),
    ];
    for (ours, theirs) in pairs {
        if flags.contains(ours) {
            out |= theirs;
        }
    }
    out
}

fn geometry_flags(flags: GeometryFlags) -> vk::GeometryFlagsKHR {
    let mut out = vk::GeometryFlagsKHR::empty();
    if flags.contains(GeometryFlags::OPAQUE) {
        out |= vk::GeometryFlagsKHR::OPAQUE;
    }
    if flags.contains(GeometryFlags::NO_DUPLICATE_ANY_HIT_INVOCATION) {
        out |= vk::GeometryFlagsKHR::NO_DUPLICATE_ANY_HIT_INVOCATION;
    }
    out
}

fn device_address(address: DeviceAddress) -> vk::DeviceOrHostAddressConstKHR {
    vk::DeviceOrHostAddressConstKHR {
        device_address: address,
    }
}

/// Native geometry descriptions and their build ranges, one per input geometry.
fn geometries(
    input: &AccelerationStructureBuildInput,
) -> (
    Vec<vk::AccelerationStructureGeometryKHR<'static>>,
    Vec<vk::AccelerationStructureBuildRangeInfoKHR>,
) {
    let mut geometries = Vec::with_capacity(input.geometries.len());
    let mut ranges = Vec::with_capacity(input.geometries.len());
    for geometry in &input.geometries {
        let native = match *geometry {
            BuildGeometry::Triangles {
                vertex_address,
                vertex_format,
                vertex_stride,
                max_vertex,
                index,
                transform_address,
                flags,
                ..
            } => {
                let mut triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                    .vertex_format(vertex_format_to_vk(vertex_format))
                    .vertex_data(device_address(vertex_address))
                    .vertex_stride(vertex_stride)
                    .max_vertex(max_vertex)
                    .index_type(vk::IndexType::NONE_KHR);
                if let Some((address, format)) = index {
                    triangles = triangles
                        .index_type(index_type_to_vk(format))
                        .index_data(device_address(address));
                }
                if let Some(address) = transform_address {
                    triangles = triangles.transform_data(device_address(address));
                }
                vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                    .flags(geometry_flags(flags))
            }
            BuildGeometry::Aabbs {
                address,
                stride,
                flags,
                ..
            } => {
                let aabbs = vk::AccelerationStructureGeometryAabbsDataKHR::default()
                    .data(device_address(address))
                    .stride(stride);
                vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::AABBS)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { aabbs })
                    .flags(geometry_flags(flags))
            }
            BuildGeometry::Instances { address, .. } => {
                let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
                    .array_of_pointers(false)
                    .data(device_address(address));
                vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
            }
        };
        geometries.push(native);
        ranges.push(
            vk::AccelerationStructureBuildRangeInfoKHR::default()
                .primitive_count(geometry.primitive_count()),
        );
    }
    (geometries, ranges)
}

impl VulkanBackend {
    fn acceleration(&self) -> GalResult<&ash::khr::acceleration_structure::Device> {
        self.acceleration.as_ref().ok_or_else(|| {
            GalError::UnsupportedCapability(format!(
                "acceleration structures are not supported on '{}'",
                self.caps.device_name
            ))
        })
    }

    pub(super) fn structure_sizes(
        &self,
        input: &AccelerationStructureBuildInput,
    ) -> GalResult<BuildSizes> {
        let loader = self.acceleration()?;
        if input.geometries.is_empty() {
            return Err(GalError::EmptyBuildInput("geometries"));
        }
        let (geometries, _) = geometries(input);
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(structure_type(input.kind))
            .flags(build_flags(input.flags))
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);
        let counts = input.primitive_counts();
        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &counts,
                &mut sizes,
            )
        };
        Ok(BuildSizes {
            result_size: sizes.acceleration_structure_size,
            scratch_size: sizes.build_scratch_size,
            update_scratch_size: sizes.update_scratch_size,
        })
    }

    pub(super) fn new_structure(
        &self,
        kind: AccelerationStructureKind,
        buffer: NativeHandle,
        size: u64,
    ) -> GalResult<StructureEntry> {
        let loader = self.acceleration()?;
        let entry = self.buffers.get(buffer)?;
        entry.range_check(0, size)?;
        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(entry.buffer)
            .offset(0)
            .size(size)
            .ty(structure_type(kind));
        let raw = unsafe { loader.create_acceleration_structure(&create_info, None) }
            .map_err(|e| vk_error("create_acceleration_structure", e))?;
        let address = unsafe {
            loader.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR::default()
                    .acceleration_structure(raw),
            )
        };
        log::trace!("{kind:?} acceleration structure placed: {size} bytes");
        Ok(StructureEntry {
            raw,
            buffer,
            kind,
            address,
        })
    }

    pub(super) fn free_structure(&self, entry: &StructureEntry) {
        if let Some(loader) = &self.acceleration {
            unsafe { loader.destroy_acceleration_structure(entry.raw, None) };
        }
    }

    /// Records one build (or in-place update) into `cmd`.
    pub(super) fn record_structure_build(
        &self,
        cmd: vk::CommandBuffer,
        input: &AccelerationStructureBuildInput,
        destination: NativeHandle,
        source: Option<NativeHandle>,
        scratch_address: DeviceAddress,
    ) -> GalResult<()> {
        let loader = self.acceleration()?;
        let dst = self.structures.with(destination, |s| s.raw)?;
        let (geometries, ranges) = geometries(input);
        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(structure_type(input.kind))
            .flags(build_flags(input.flags))
            .dst_acceleration_structure(dst)
            .geometries(&geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_address,
            });
        build_info = match (input.update, source) {
            (true, Some(src)) => build_info
                .mode(vk::BuildAccelerationStructureModeKHR::UPDATE)
                .src_acceleration_structure(self.structures.with(src, |s| s.raw)?),
            (true, None) => {
                return Err(GalError::invalid_state("update build without a source structure"))
            }
            (false, _) => build_info.mode(vk::BuildAccelerationStructureModeKHR::BUILD),
        };
        unsafe {
            loader.cmd_build_acceleration_structures(cmd, &[build_info], &[&ranges[..]]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::VertexFormat;

    fn triangle_input(index: Option<(DeviceAddress, IndexFormat)>) -> AccelerationStructureBuildInput {
        AccelerationStructureBuildInput {
            kind: AccelerationStructureKind::BottomLevel,
            flags: AccelerationStructureFlags::PREFER_FAST_TRACE,
            geometries: vec![BuildGeometry::Triangles {
                vertex_address: 0x1000,
                vertex_format: VertexFormat::Float32x3,
                vertex_stride: 12,
                max_vertex: 2,
                index,
                transform_address: None,
                primitive_count: 1,
                flags: GeometryFlags::OPAQUE,
            }],
            update: false,
        }
    }

    #[test]
    fn unindexed_triangles_use_no_index_type() {
        let (geometries, ranges) = geometries(&triangle_input(None));
        assert_eq!(geometries[0].geometry_type, vk::GeometryTypeKHR::TRIANGLES);
        assert_eq!(geometries[0].flags, vk::GeometryFlagsKHR::OPAQUE);
        let triangles = unsafe { geometries[0].geometry.triangles };
        assert_eq!(triangles.index_type, vk::IndexType::NONE_KHR);
        assert_eq!(triangles.vertex_format, vk::Format::R32G32B32_SFLOAT);
        assert_eq!(unsafe { triangles.vertex_data.device_address }, 0x1000);
        assert_eq!(ranges[0].primitive_count, 1);
    }

    #[test]
    fn indexed_triangles_carry_their_index_buffer() {
        let (geometries, _) = geometries(&triangle_input(Some((0x2000, IndexFormat::Uint16))));
        let triangles = unsafe { geometries[0].geometry.triangles };
        assert_eq!(triangles.index_type, vk::IndexType::UINT16);
        assert_eq!(unsafe { triangles.index_data.device_address }, 0x2000);
    }

    #[test]
    fn instances_count_as_primitives() {
        let input = AccelerationStructureBuildInput {
            kind: AccelerationStructureKind::TopLevel,
            flags: AccelerationStructureFlags::ALLOW_UPDATE,
            geometries: vec![BuildGeometry::Instances {
                address: 0x3000,
                count: 4,
            }],
            update: false,
        };
        let (geometries, ranges) = geometries(&input);
        assert_eq!(geometries[0].geometry_type, vk::GeometryTypeKHR::INSTANCES);
        assert_eq!(ranges[0].primitive_count, 4);
        assert_eq!(
            build_flags(input.flags),
            vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE
        );
    }
}
