//! Host-side acceleration structure emulation.
//!
//! A built structure is a header followed by one record per primitive (bottom
//! level) or per instance (top level), written at the start of its storage
//! buffer. The records carry enough geometry to validate builds and bound the
//! scene; no traversal is emulated.

use bytemuck::{Pod, Zeroable};

use crate::accel::{
    AccelerationStructureBuildInput, AccelerationStructureFlags, AccelerationStructureKind,
    BuildSizes, InstanceRecord, Transform3x4, INSTANCE_RECORD_SIZE,
};
use crate::error::{GalError, GalResult};
use crate::format::VertexFormat;

use super::memory::{f16_to_f32, ADDRESS_ALIGNMENT};

pub(crate) const STRUCTURE_MAGIC: u32 = u32::from_le_bytes(*b"LAS1");
/// Bytes reserved for the header at the start of every structure.
pub(crate) const HEADER_SPAN: u64 = 256;
const PRIMITIVE_RECORD_SIZE: u64 = std::mem::size_of::<PrimitiveRecord>() as u64;
const SCRATCH_BASE: u64 = 128;
const SCRATCH_PER_PRIMITIVE: u64 = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub(crate) struct StructureHeader {
    pub magic: u32,
    /// 0 for bottom level, 1 for top level.
    pub kind: u32,
    pub primitive_count: u32,
    pub geometry_count: u32,
    pub flags: u32,
    /// In-place updates applied since the last full build.
    pub updates: u32,
    pub bounds_min: [f32; 3],
    pub bounds_max: [f32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub(crate) struct PrimitiveRecord {
    pub bounds_min: [f32; 3],
    pub bounds_max: [f32; 3],
    pub geometry: u32,
    pub primitive: u32,
}

/// Memory the emulated build needs for `input`.
pub(crate) fn build_sizes(input: &AccelerationStructureBuildInput) -> BuildSizes {
    let count = input.total_primitives();
    let per_record = match input.kind {
        AccelerationStructureKind::BottomLevel => PRIMITIVE_RECORD_SIZE,
        AccelerationStructureKind::TopLevel => INSTANCE_RECORD_SIZE,
    };
    let scratch_size = SCRATCH_BASE + SCRATCH_PER_PRIMITIVE * count;
    BuildSizes {
        result_size: (HEADER_SPAN + per_record * count).next_multiple_of(ADDRESS_ALIGNMENT),
        scratch_size,
        update_scratch_size: scratch_size / 2,
    }
}

/// Axis-aligned bounds; empty until the first point is added.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Bounds {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl Bounds {
    pub const EMPTY: Bounds = Bounds {
        min: [f32::INFINITY; 3],
        max: [f32::NEG_INFINITY; 3],
    };

    pub fn is_empty(&self) -> bool {
        (0..3).any(|i| self.min[i] > self.max[i])
    }

    pub fn add(&mut self, point: [f32; 3]) {
        for i in 0..3 {
            self.min[i] = self.min[i].min(point[i]);
            self.max[i] = self.max[i].max(point[i]);
        }
    }

    pub fn union(&mut self, other: &Bounds) {
        if !other.is_empty() {
            self.add(other.min);
            self.add(other.max);
        }
    }

    /// Bounds of the eight transformed corners.
    pub fn transformed(&self, transform: &Transform3x4) -> Bounds {
        let mut out = Bounds::EMPTY;
        if self.is_empty() {
            return out;
        }
        for corner in 0..8 {
            let point = [
                if corner & 1 == 0 { self.min[0] } else { self.max[0] },
                if corner & 2 == 0 { self.min[1] } else { self.max[1] },
                if corner & 4 == 0 { self.min[2] } else { self.max[2] },
            ];
            out.add(transform_point(transform, point));
        }
        out
    }

    /// Stored form; empty bounds are written as zeros.
    pub fn to_arrays(self) -> ([f32; 3], [f32; 3]) {
        if self.is_empty() {
            ([0.0; 3], [0.0; 3])
        } else {
            (self.min, self.max)
        }
    }
}

pub(crate) fn transform_point(m: &Transform3x4, [x, y, z]: [f32; 3]) -> [f32; 3] {
    [
        m[0] * x + m[1] * y + m[2] * z + m[3],
        m[4] * x + m[5] * y + m[6] * z + m[7],
        m[8] * x + m[9] * y + m[10] * z + m[11],
    ]
}

/// Reads one position of `format` from the start of `bytes`.
pub(crate) fn decode_position(format: VertexFormat, bytes: &[u8]) -> GalResult<[f32; 3]> {
    let f32_at = |i: usize| bytemuck::pod_read_unaligned::<f32>(&bytes[i * 4..i * 4 + 4]);
    let u16_at = |i: usize| u16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]]);
    let snorm = |i: usize| (u16_at(i) as i16 as f32 / i16::MAX as f32).max(-1.0);
    if bytes.len() < format.size() as usize {
        return Err(GalError::BuildFailure(format!(
            "vertex data ends inside a {format:?} position"
        )));
    }
    Ok(match format {
        VertexFormat::Float32x2 => [f32_at(0), f32_at(1), 0.0],
        VertexFormat::Float32x3 | VertexFormat::Float32x4 => [f32_at(0), f32_at(1), f32_at(2)],
        VertexFormat::Float16x2 => [f16_to_f32(u16_at(0)), f16_to_f32(u16_at(1)), 0.0],
        VertexFormat::Float16x4 => [
            f16_to_f32(u16_at(0)),
            f16_to_f32(u16_at(1)),
            f16_to_f32(u16_at(2)),
        ],
        VertexFormat::Snorm16x2 => [snorm(0), snorm(1), 0.0],
        VertexFormat::Snorm16x4 => [snorm(0), snorm(1), snorm(2)],
        other => {
            return Err(GalError::BuildFailure(format!(
                "{other:?} is not a position format"
            )))
        }
    })
}

/// Header describing a finished build.
pub(crate) fn header(
    kind: AccelerationStructureKind,
    flags: AccelerationStructureFlags,
    primitive_count: u32,
    geometry_count: u32,
    updates: u32,
    bounds: Bounds,
) -> StructureHeader {
    let (bounds_min, bounds_max) = bounds.to_arrays();
    StructureHeader {
        magic: STRUCTURE_MAGIC,
        kind: match kind {
            AccelerationStructureKind::BottomLevel => 0,
            AccelerationStructureKind::TopLevel => 1,
        },
        primitive_count,
        geometry_count,
        flags: flags.bits(),
        updates,
        bounds_min,
        bounds_max,
    }
}

/// Serialises a header and its records into the structure's storage layout.
pub(crate) fn encode_structure<R: Pod>(header: &StructureHeader, records: &[R]) -> Vec<u8> {
    let mut bytes = vec![0u8; HEADER_SPAN as usize];
    bytes[..std::mem::size_of::<StructureHeader>()].copy_from_slice(bytemuck::bytes_of(header));
    bytes.extend_from_slice(bytemuck::cast_slice(records));
    bytes
}

pub(crate) fn decode_instances(bytes: &[u8]) -> Vec<InstanceRecord> {
    bytes
        .chunks_exact(INSTANCE_RECORD_SIZE as usize)
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::{BuildGeometry, GeometryFlags, IDENTITY_TRANSFORM};

    fn triangles(count: u32) -> AccelerationStructureBuildInput {
        AccelerationStructureBuildInput {
            kind: AccelerationStructureKind::BottomLevel,
            flags: AccelerationStructureFlags::empty(),
            geometries: vec![BuildGeometry::Triangles {
                vertex_address: 0x1_0000_0000,
                vertex_format: VertexFormat::Float32x3,
                vertex_stride: 12,
                max_vertex: count * 3 - 1,
                index: None,
                transform_address: None,
                primitive_count: count,
                flags: GeometryFlags::OPAQUE,
            }],
            update: false,
        }
    }

    #[test]
    fn sizes_grow_with_primitives() {
        let one = build_sizes(&triangles(1));
        assert_eq!(one.result_size, 512);
        assert_eq!(one.scratch_size, 144);
        assert_eq!(one.update_scratch_size, 72);
        let many = build_sizes(&triangles(100));
        assert_eq!(many.result_size, (256 + 3200u64).next_multiple_of(256));
        assert!(many.scratch_size > one.scratch_size);
    }

    #[test]
    fn instance_sizes_use_native_records() {
        let input = AccelerationStructureBuildInput {
            kind: AccelerationStructureKind::TopLevel,
            flags: AccelerationStructureFlags::empty(),
            geometries: vec![BuildGeometry::Instances {
                address: 0x1_0000_0000,
                count: 1,
            }],
            update: false,
        };
        assert_eq!(build_sizes(&input).result_size, 512);
    }

    #[test]
    fn transformed_bounds_cover_every_corner() {
        let mut bounds = Bounds::EMPTY;
        assert!(bounds.is_empty());
        bounds.add([0.0, 0.0, 0.0]);
        bounds.add([1.0, 2.0, 3.0]);
        let mut shift = IDENTITY_TRANSFORM;
        shift[3] = 10.0;
        let moved = bounds.transformed(&shift);
        assert_eq!(moved.min, [10.0, 0.0, 0.0]);
        assert_eq!(moved.max, [11.0, 2.0, 3.0]);
    }

    #[test]
    fn positions_decode_from_every_position_format() {
        let bytes: Vec<u8> = [1.0f32, 2.0, 3.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        assert_eq!(
            decode_position(VertexFormat::Float32x3, &bytes).unwrap(),
            [1.0, 2.0, 3.0]
        );
        let snorm: Vec<u8> = [i16::MAX, i16::MIN, 0, 0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        assert_eq!(
            decode_position(VertexFormat::Snorm16x4, &snorm).unwrap(),
            [1.0, -1.0, 0.0]
        );
        assert!(decode_position(VertexFormat::Float32x3, &bytes[..8]).is_err());
    }

    #[test]
    fn encoded_structures_start_with_the_header() {
        let header = header(
            AccelerationStructureKind::BottomLevel,
            AccelerationStructureFlags::ALLOW_UPDATE,
            1,
            1,
            0,
            Bounds::EMPTY,
        );
        let record = PrimitiveRecord {
            bounds_min: [0.0; 3],
            bounds_max: [1.0; 3],
            geometry: 0,
            primitive: 0,
        };
        let bytes = encode_structure(&header, &[record]);
        assert_eq!(bytes.len() as u64, HEADER_SPAN + PRIMITIVE_RECORD_SIZE);
        let decoded: StructureHeader =
            bytemuck::pod_read_unaligned(&bytes[..std::mem::size_of::<StructureHeader>()]);
        assert_eq!(decoded.magic, STRUCTURE_MAGIC);
        assert_eq!(decoded.bounds_max, [0.0; 3]);
    }
}
