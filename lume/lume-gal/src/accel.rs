//! Ray tracing acceleration structures.
//!
//! Builds are synchronous: [`ResourceFactory::create_bottom_level_as`] and
//! [`ResourceFactory::create_top_level_as`] record one build on a short-lived compute
//! command buffer, submit it and block until the GPU has finished, so a returned
//! structure can immediately feed a dependent build or a resource set.
//!
//! [`ResourceFactory::create_bottom_level_as`]: crate::ResourceFactory::create_bottom_level_as
//! [`ResourceFactory::create_top_level_as`]: crate::ResourceFactory::create_top_level_as

use std::sync::{Arc, Mutex};

use crate::arena::{MemoryArena, TypedBlock};
use crate::backend::{Backend, DeviceAddress, NativeHandle, ObjectKind};
use crate::buffer::{Buffer, BufferDescriptor, BufferUsage};
use crate::command::{BuildRecord, CommandBuffer};
use crate::context::Capabilities;
use crate::device::DeviceShared;
use crate::error::{GalError, GalResult};
use crate::factory::ResourceFactory;
use crate::format::{IndexFormat, VertexFormat};
use crate::resource::{Resource, ResourceBase};
use crate::state::QueueKind;

bitflags::bitflags! {
    /// Build preferences. `PREFER_FAST_TRACE` and `PREFER_FAST_BUILD` are exclusive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccelerationStructureFlags: u32 {
        const PREFER_FAST_TRACE = 1 << 0;
        const PREFER_FAST_BUILD = 1 << 1;
        const MINIMIZE_MEMORY = 1 << 2;
        /// The structure may later be rebuilt in place.
        const ALLOW_UPDATE = 1 << 3;
        const ALLOW_COMPACTION = 1 << 4;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GeometryFlags: u32 {
        const OPAQUE = 1 << 0;
        /// Any-hit shaders run at most once per primitive.
        const NO_DUPLICATE_ANY_HIT_INVOCATION = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Per-instance options, bit-compatible with native instance records.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InstanceFlags: u8 {
        const TRIANGLE_CULL_DISABLE = 1 << 0;
        const TRIANGLE_FRONT_COUNTERCLOCKWISE = 1 << 1;
        const FORCE_OPAQUE = 1 << 2;
        const FORCE_NO_OPAQUE = 1 << 3;
    }
}

impl AccelerationStructureFlags {
    fn validate(self) -> GalResult<()> {
        if self.contains(Self::PREFER_FAST_TRACE | Self::PREFER_FAST_BUILD) {
            return Err(GalError::descriptor(
                "PREFER_FAST_TRACE and PREFER_FAST_BUILD are mutually exclusive",
            ));
        }
        Ok(())
    }
}

/// Row-major 3x4 affine transform.
pub type Transform3x4 = [f32; 12];

pub const IDENTITY_TRANSFORM: Transform3x4 = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0,
];

/// Largest value of a 24-bit instance field.
const MAX_INSTANCE_FIELD: u32 = (1 << 24) - 1;

/// Triangle mesh geometry read straight from vertex (and optional index) buffers.
#[derive(Debug, Clone)]
pub struct TriangleGeometry {
    pub vertex_buffer: Arc<Buffer>,
    pub vertex_format: VertexFormat,
    pub vertex_stride: u64,
    pub vertex_count: u32,
    pub vertex_offset: u64,
    pub index_buffer: Option<Arc<Buffer>>,
    pub index_format: IndexFormat,
    pub index_count: u32,
    pub index_offset: u64,
    pub transform: Option<Transform3x4>,
    pub flags: GeometryFlags,
}

impl TriangleGeometry {
    /// Non-indexed `Float32x3` positions packed at 12 bytes.
    pub fn new(vertex_buffer: Arc<Buffer>, vertex_count: u32) -> Self {
        Self {
            vertex_buffer,
            vertex_format: VertexFormat::Float32x3,
            vertex_stride: 12,
            vertex_count,
            vertex_offset: 0,
            index_buffer: None,
            index_format: IndexFormat::Uint32,
            index_count: 0,
            index_offset: 0,
            transform: None,
            flags: GeometryFlags::OPAQUE,
        }
    }

    pub fn with_stride(mut self, stride: u64) -> Self {
        self.vertex_stride = stride;
        self
    }

    pub fn with_indices(mut self, buffer: Arc<Buffer>, format: IndexFormat, count: u32) -> Self {
        self.index_buffer = Some(buffer);
        self.index_format = format;
        self.index_count = count;
        self
    }

    pub fn with_transform(mut self, transform: Transform3x4) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn with_flags(mut self, flags: GeometryFlags) -> Self {
        self.flags = flags;
        self
    }

    fn primitive_count(&self) -> u32 {
        match self.index_buffer {
            Some(_) => self.index_count / 3,
            None => self.vertex_count / 3,
        }
    }

    fn resolve(
        &self,
        device: &Arc<DeviceShared>,
        transform_address: Option<DeviceAddress>,
    ) -> GalResult<BuildGeometry> {
        let vertices = &self.vertex_buffer;
        check_buffer(device, vertices, "vertex")?;
        if !self.vertex_format.is_position_format() {
            return Err(GalError::descriptor(format!(
                "{:?} cannot be used for triangle positions",
                self.vertex_format
            )));
        }
        if self.vertex_stride < self.vertex_format.size() as u64 {
            return Err(GalError::descriptor(format!(
                "vertex stride {} is smaller than {:?}",
                self.vertex_stride, self.vertex_format
            )));
        }
        if self.vertex_count == 0 {
            return Err(GalError::EmptyBuildInput("vertices"));
        }
        let span = (self.vertex_count as u64 - 1) * self.vertex_stride
            + self.vertex_format.size() as u64;
        vertices.check_range(self.vertex_offset, span)?;

        let index = match &self.index_buffer {
            Some(indices) => {
                if !Arc::ptr_eq(indices.device(), vertices.device()) {
                    return Err(GalError::descriptor(
                        "index buffer belongs to a different device than its vertex buffer",
                    ));
                }
                check_buffer(device, indices, "index")?;
                if self.index_count == 0 || self.index_count % 3 != 0 {
                    return Err(GalError::descriptor(format!(
                        "index count {} is not a positive multiple of 3",
                        self.index_count
                    )));
                }
                let size = self.index_format.size() as u64;
                if self.index_offset % size != 0 {
                    return Err(GalError::descriptor(format!(
                        "index offset {} is not aligned to {size}",
                        self.index_offset
                    )));
                }
                indices.check_range(self.index_offset, self.index_count as u64 * size)?;
                Some((
                    indices.device_address()? + self.index_offset,
                    self.index_format,
                ))
            }
            None => {
                if self.vertex_count % 3 != 0 {
                    return Err(GalError::descriptor(format!(
                        "{} vertices do not form whole triangles",
                        self.vertex_count
                    )));
                }
                None
            }
        };
        Ok(BuildGeometry::Triangles {
            vertex_address: vertices.device_address()? + self.vertex_offset,
            vertex_format: self.vertex_format,
            vertex_stride: self.vertex_stride,
            max_vertex: self.vertex_count - 1,
            index,
            transform_address,
            primitive_count: self.primitive_count(),
            flags: self.flags,
        })
    }
}

/// Procedural geometry: axis-aligned boxes of six `f32` (min xyz, max xyz).
#[derive(Debug, Clone)]
pub struct AabbGeometry {
    pub buffer: Arc<Buffer>,
    pub stride: u64,
    pub count: u32,
    pub offset: u64,
    pub flags: GeometryFlags,
}

/// Bytes of one packed AABB.
pub const AABB_SIZE: u64 = 24;

impl AabbGeometry {
    pub fn new(buffer: Arc<Buffer>, count: u32) -> Self {
        Self {
            buffer,
            stride: AABB_SIZE,
            count,
            offset: 0,
            flags: GeometryFlags::empty(),
        }
    }

    fn resolve(&self, device: &Arc<DeviceShared>) -> GalResult<BuildGeometry> {
        check_buffer(device, &self.buffer, "AABB")?;
        if self.stride < AABB_SIZE || self.stride % 8 != 0 {
            return Err(GalError::descriptor(format!(
                "AABB stride {} must be a multiple of 8 of at least {AABB_SIZE}",
                self.stride
            )));
        }
        if self.count == 0 {
            return Err(GalError::EmptyBuildInput("aabbs"));
        }
        let span = (self.count as u64 - 1) * self.stride + AABB_SIZE;
        self.buffer.check_range(self.offset, span)?;
        Ok(BuildGeometry::Aabbs {
            address: self.buffer.device_address()? + self.offset,
            stride: self.stride,
            primitive_count: self.count,
            flags: self.flags,
        })
    }
}

#[derive(Debug, Clone)]
pub enum Geometry {
    Triangles(TriangleGeometry),
    Aabbs(AabbGeometry),
}

impl Geometry {
    fn buffers(&self) -> Vec<Arc<Buffer>> {
        match self {
            Geometry::Triangles(t) => std::iter::once(t.vertex_buffer.clone())
                .chain(t.index_buffer.clone())
                .collect(),
            Geometry::Aabbs(a) => vec![a.buffer.clone()],
        }
    }
}

fn check_buffer(device: &Arc<DeviceShared>, buffer: &Buffer, role: &str) -> GalResult<()> {
    buffer.base().ensure_alive()?;
    if !Arc::ptr_eq(buffer.device(), device) {
        return Err(GalError::descriptor(format!(
            "{role} buffer belongs to a different device"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct BottomLevelASDescriptor {
    pub label: Option<&'static str>,
    pub geometries: Vec<Geometry>,
    pub flags: AccelerationStructureFlags,
}

impl Default for BottomLevelASDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            geometries: Vec::new(),
            flags: AccelerationStructureFlags::PREFER_FAST_TRACE,
        }
    }
}

/// One instance of a bottom-level structure placed in a top-level structure.
#[derive(Debug, Clone)]
pub struct Instance {
    pub blas: Arc<BottomLevelAS>,
    pub transform: Transform3x4,
    /// Custom index visible to shaders; 24 bits.
    pub instance_id: u32,
    pub mask: u8,
    /// Hit group contribution to the shader binding table index; 24 bits.
    pub hit_group_offset: u32,
    pub flags: InstanceFlags,
}

impl Instance {
    /// Identity transform, visible to every ray (mask 0xFF).
    pub fn new(blas: Arc<BottomLevelAS>) -> Self {
        Self {
            blas,
            transform: IDENTITY_TRANSFORM,
            instance_id: 0,
            mask: 0xFF,
            hit_group_offset: 0,
            flags: InstanceFlags::empty(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TopLevelASDescriptor {
    pub label: Option<&'static str>,
    pub instances: Vec<Instance>,
    pub flags: AccelerationStructureFlags,
}

impl Default for TopLevelASDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            instances: Vec::new(),
            flags: AccelerationStructureFlags::PREFER_FAST_TRACE,
        }
    }
}

/// Instance record as laid out in a top-level instance buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct InstanceRecord {
    pub transform: Transform3x4,
    /// Instance id in the low 24 bits, mask in the high 8.
    pub id_and_mask: u32,
    /// Hit group offset in the low 24 bits, [`InstanceFlags`] in the high 8.
    pub sbt_offset_and_flags: u32,
    pub blas_address: DeviceAddress,
}

pub const INSTANCE_RECORD_SIZE: u64 = std::mem::size_of::<InstanceRecord>() as u64;

impl InstanceRecord {
    fn encode(instance: &Instance, device: &Arc<DeviceShared>) -> GalResult<Self> {
        instance.blas.base().ensure_alive()?;
        if !Arc::ptr_eq(&instance.blas.device, device) {
            return Err(GalError::descriptor(
                "instance references a structure from a different device",
            ));
        }
        if instance.instance_id > MAX_INSTANCE_FIELD {
            return Err(GalError::descriptor(format!(
                "instance id {} does not fit in 24 bits",
                instance.instance_id
            )));
        }
        if instance.hit_group_offset > MAX_INSTANCE_FIELD {
            return Err(GalError::descriptor(format!(
                "hit group offset {} does not fit in 24 bits",
                instance.hit_group_offset
            )));
        }
        if instance
            .flags
            .contains(InstanceFlags::FORCE_OPAQUE | InstanceFlags::FORCE_NO_OPAQUE)
        {
            return Err(GalError::descriptor(
                "FORCE_OPAQUE and FORCE_NO_OPAQUE are mutually exclusive",
            ));
        }
        Ok(Self {
            transform: instance.transform,
            id_and_mask: instance.instance_id | (instance.mask as u32) << 24,
            sbt_offset_and_flags: instance.hit_group_offset | (instance.flags.bits() as u32) << 24,
            blas_address: instance.blas.device_address(),
        })
    }

    pub fn instance_id(&self) -> u32 {
        self.id_and_mask & MAX_INSTANCE_FIELD
    }

    pub fn mask(&self) -> u8 {
        (self.id_and_mask >> 24) as u8
    }

    pub fn hit_group_offset(&self) -> u32 {
        self.sbt_offset_and_flags & MAX_INSTANCE_FIELD
    }

    pub fn flags(&self) -> InstanceFlags {
        InstanceFlags::from_bits_truncate((self.sbt_offset_and_flags >> 24) as u8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelerationStructureKind {
    BottomLevel,
    TopLevel,
}

/// One geometry of a build, reduced to device addresses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BuildGeometry {
    Triangles {
        vertex_address: DeviceAddress,
        vertex_format: VertexFormat,
        vertex_stride: u64,
        max_vertex: u32,
        index: Option<(DeviceAddress, IndexFormat)>,
        transform_address: Option<DeviceAddress>,
        primitive_count: u32,
        flags: GeometryFlags,
    },
    Aabbs {
        address: DeviceAddress,
        stride: u64,
        primitive_count: u32,
        flags: GeometryFlags,
    },
    Instances {
        address: DeviceAddress,
        count: u32,
    },
}

impl BuildGeometry {
    pub fn primitive_count(&self) -> u32 {
        match *self {
            BuildGeometry::Triangles { primitive_count, .. }
            | BuildGeometry::Aabbs { primitive_count, .. } => primitive_count,
            BuildGeometry::Instances { count, .. } => count,
        }
    }
}

/// Backend-neutral description of one build or update.
#[derive(Debug, Clone, PartialEq)]
pub struct AccelerationStructureBuildInput {
    pub kind: AccelerationStructureKind,
    pub flags: AccelerationStructureFlags,
    pub geometries: Vec<BuildGeometry>,
    /// Refit an existing structure in place instead of building from scratch.
    pub update: bool,
}

impl AccelerationStructureBuildInput {
    pub fn primitive_counts(&self) -> Vec<u32> {
        self.geometries.iter().map(BuildGeometry::primitive_count).collect()
    }

    pub fn total_primitives(&self) -> u64 {
        self.geometries
            .iter()
            .map(|g| g.primitive_count() as u64)
            .sum()
    }
}

/// Memory a build needs, as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildSizes {
    pub result_size: u64,
    pub scratch_size: u64,
    pub update_scratch_size: u64,
}

/// Destroys a native structure unless the build that created it succeeds.
struct PendingStructure<'a> {
    backend: &'a dyn Backend,
    handle: NativeHandle,
    armed: bool,
}

impl<'a> PendingStructure<'a> {
    fn new(backend: &'a dyn Backend, handle: NativeHandle) -> Self {
        Self {
            backend,
            handle,
            armed: true,
        }
    }

    fn finish(mut self) -> NativeHandle {
        self.armed = false;
        self.handle
    }
}

impl Drop for PendingStructure<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.backend.destroy_acceleration_structure(self.handle);
        }
    }
}

fn require_acceleration_structures(caps: &Capabilities) -> GalResult<()> {
    if !caps.acceleration_structures() {
        return Err(GalError::UnsupportedCapability(format!(
            "acceleration structures need ray tracing or ray query support on '{}'",
            caps.device_name
        )));
    }
    Ok(())
}

/// Scratch memory for one build, with its address rounded up to the device alignment.
struct Scratch {
    buffer: Arc<Buffer>,
    address: DeviceAddress,
}

impl Scratch {
    fn new(factory: &ResourceFactory, size: u64) -> GalResult<Self> {
        let alignment = factory.device().capabilities().scratch_alignment.max(1);
        let buffer = factory.create_buffer(
            &BufferDescriptor::new(size.max(1) + alignment, BufferUsage::STORAGE)
                .with_label("acceleration structure scratch"),
        )?;
        let address = buffer.device_address()?.next_multiple_of(alignment);
        Ok(Self { buffer, address })
    }
}

/// Records one build with `record`, submits it on the compute queue and waits.
fn run_build(
    device: &Arc<DeviceShared>,
    record: impl FnOnce(&mut CommandBuffer) -> GalResult<()>,
) -> GalResult<()> {
    let mut commands = CommandBuffer::new(device.clone(), QueueKind::Compute);
    commands.begin()?;
    record(&mut commands)?;
    commands.end()?;
    let token = device.commit(&mut commands).map_err(|e| match e {
        GalError::Backend(msg) => GalError::BuildFailure(msg),
        other => other,
    })?;
    device.wait(token, None)?;
    commands.settle_ownership();
    Ok(())
}

/// Structure built from raw geometry.
pub struct BottomLevelAS {
    base: ResourceBase,
    device: Arc<DeviceShared>,
    handle: NativeHandle,
    result: Arc<Buffer>,
    address: DeviceAddress,
    sizes: BuildSizes,
    flags: AccelerationStructureFlags,
    primitive_count: u64,
}

impl std::fmt::Debug for BottomLevelAS {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BottomLevelAS")
            .field("id", &self.base.id())
            .field("address", &format_args!("{:#x}", self.address))
            .field("primitives", &self.primitive_count)
            .finish_non_exhaustive()
    }
}

impl BottomLevelAS {
    pub(crate) fn build(
        factory: &ResourceFactory,
        desc: &BottomLevelASDescriptor,
    ) -> GalResult<Self> {
        let device = factory.device();
        require_acceleration_structures(device.capabilities())?;
        desc.flags.validate()?;
        if desc.geometries.is_empty() {
            return Err(GalError::EmptyBuildInput("geometries"));
        }
        let triangles = matches!(desc.geometries[0], Geometry::Triangles(_));
        if desc
            .geometries
            .iter()
            .any(|g| matches!(g, Geometry::Triangles(_)) != triangles)
        {
            return Err(GalError::descriptor(
                "a bottom-level structure holds either triangles or AABBs, not both",
            ));
        }

        let transforms: Vec<Transform3x4> = desc
            .geometries
            .iter()
            .filter_map(|g| match g {
                Geometry::Triangles(t) => t.transform,
                Geometry::Aabbs(_) => None,
            })
            .collect();
        let transform_buffer = if transforms.is_empty() {
            None
        } else {
            let buffer = factory.create_buffer(
                &BufferDescriptor::new(
                    (transforms.len() * std::mem::size_of::<Transform3x4>()) as u64,
                    BufferUsage::ACCELERATION_STRUCTURE,
                )
                .with_label("geometry transforms"),
            )?;
            device.write_buffer(&buffer, 0, bytemuck::cast_slice(&transforms))?;
            Some(buffer)
        };

        let mut geometries = Vec::with_capacity(desc.geometries.len());
        let mut inputs: Vec<Arc<Buffer>> = transform_buffer.iter().cloned().collect();
        let mut next_transform = 0u64;
        for geometry in &desc.geometries {
            let resolved = match geometry {
                Geometry::Triangles(t) => {
                    let transform_address = match (&t.transform, &transform_buffer) {
                        (Some(_), Some(buffer)) => {
                            let address = buffer.device_address()?
                                + next_transform * std::mem::size_of::<Transform3x4>() as u64;
                            next_transform += 1;
                            Some(address)
                        }
                        _ => None,
                    };
                    t.resolve(device, transform_address)?
                }
                Geometry::Aabbs(a) => a.resolve(device)?,
            };
            geometries.push(resolved);
            inputs.extend(geometry.buffers());
        }

        let input = Arc::new(AccelerationStructureBuildInput {
            kind: AccelerationStructureKind::BottomLevel,
            flags: desc.flags,
            geometries,
            update: false,
        });
        let backend = device.backend();
        let sizes = backend.acceleration_structure_build_sizes(&input)?;
        log::debug!(
            "BLAS {:?}: {} geometries, {} primitives, result {} B, scratch {} B",
            desc.label,
            input.geometries.len(),
            input.total_primitives(),
            sizes.result_size,
            sizes.scratch_size
        );

        let result = factory.create_buffer(&BufferDescriptor {
            label: desc.label,
            size: sizes.result_size,
            usage: BufferUsage::ACCELERATION_STRUCTURE_STORAGE,
            stride: None,
        })?;
        let scratch = Scratch::new(factory, sizes.scratch_size)?;
        let pending = PendingStructure::new(
            backend,
            backend.create_acceleration_structure(
                AccelerationStructureKind::BottomLevel,
                result.native(),
                sizes.result_size,
            )?,
        );
        run_build(device, |commands| {
            commands.build_acceleration_structure(BuildRecord {
                input: input.clone(),
                destination: pending.handle,
                source: None,
                result: &result,
                scratch: &scratch.buffer,
                scratch_address: scratch.address,
                inputs: &inputs,
                dependencies: &[],
            })
        })?;
        let address = backend.acceleration_structure_device_address(pending.handle)?;
        if address == 0 {
            return Err(GalError::BuildFailure(
                "bottom-level structure has no device address".into(),
            ));
        }
        Ok(Self {
            base: ResourceBase::new("bottom-level acceleration structure", desc.label),
            device: device.clone(),
            handle: pending.finish(),
            result,
            address,
            sizes,
            flags: desc.flags,
            primitive_count: input.total_primitives(),
        })
    }

    pub fn device_address(&self) -> DeviceAddress {
        self.address
    }

    pub fn result_buffer(&self) -> &Arc<Buffer> {
        &self.result
    }

    pub fn build_sizes(&self) -> BuildSizes {
        self.sizes
    }

    pub fn flags(&self) -> AccelerationStructureFlags {
        self.flags
    }

    pub fn primitive_count(&self) -> u64 {
        self.primitive_count
    }

    pub(crate) fn native(&self) -> NativeHandle {
        self.handle
    }
}

impl Resource for BottomLevelAS {
    fn base(&self) -> &ResourceBase {
        &self.base
    }

    fn dispose(&self) {
        if self.base.begin_dispose() {
            self.device.wait_for_usage(&self.base);
            self.device
                .backend()
                .destroy_acceleration_structure(self.handle);
            self.result.dispose();
        }
    }

    fn set_name(&self, name: &str) {
        self.base.set_name(name);
        self.device
            .backend()
            .set_debug_name(ObjectKind::AccelerationStructure, self.handle, name);
    }
}

impl Drop for BottomLevelAS {
    fn drop(&mut self) {
        self.dispose();
    }
}

struct TopLevelInstances {
    /// Keeps every referenced bottom-level structure alive.
    blas: Vec<Arc<BottomLevelAS>>,
    arena: MemoryArena,
    records: TypedBlock<InstanceRecord>,
}

/// Structure indexing instances of bottom-level structures.
pub struct TopLevelAS {
    base: ResourceBase,
    factory: ResourceFactory,
    handle: NativeHandle,
    result: Arc<Buffer>,
    instance_buffer: Arc<Buffer>,
    address: DeviceAddress,
    sizes: BuildSizes,
    flags: AccelerationStructureFlags,
    instances: Mutex<TopLevelInstances>,
}

impl std::fmt::Debug for TopLevelAS {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopLevelAS")
            .field("id", &self.base.id())
            .field("address", &format_args!("{:#x}", self.address))
            .field("instances", &self.instance_count())
            .finish_non_exhaustive()
    }
}

fn encode_instances(
    device: &Arc<DeviceShared>,
    instances: &[Instance],
) -> GalResult<Vec<InstanceRecord>> {
    if instances.is_empty() {
        return Err(GalError::EmptyBuildInput("instances"));
    }
    instances
        .iter()
        .map(|instance| InstanceRecord::encode(instance, device))
        .collect()
}

impl TopLevelAS {
    pub(crate) fn build(factory: &ResourceFactory, desc: &TopLevelASDescriptor) -> GalResult<Self> {
        let device = factory.device();
        require_acceleration_structures(device.capabilities())?;
        desc.flags.validate()?;
        let records = encode_instances(device, &desc.instances)?;
        let count = records.len() as u32;

        let arena = MemoryArena::new("tlas instances");
        let block = arena.allocate_slice(&records)?;
        let instance_buffer = factory.create_buffer(
            &BufferDescriptor::new(
                count as u64 * INSTANCE_RECORD_SIZE,
                BufferUsage::ACCELERATION_STRUCTURE,
            )
            .with_label("tlas instances"),
        )?;
        arena.with_bytes(block.block(), |bytes| {
            device.write_buffer(&instance_buffer, 0, bytes)
        })??;

        let input = Arc::new(AccelerationStructureBuildInput {
            kind: AccelerationStructureKind::TopLevel,
            flags: desc.flags,
            geometries: vec![BuildGeometry::Instances {
                address: instance_buffer.device_address()?,
                count,
            }],
            update: false,
        });
        let backend = device.backend();
        let sizes = backend.acceleration_structure_build_sizes(&input)?;
        log::debug!(
            "TLAS {:?}: {count} instances, result {} B, scratch {} B",
            desc.label,
            sizes.result_size,
            sizes.scratch_size
        );

        let result = factory.create_buffer(&BufferDescriptor {
            label: desc.label,
            size: sizes.result_size,
            usage: BufferUsage::ACCELERATION_STRUCTURE_STORAGE,
            stride: None,
        })?;
        let scratch = Scratch::new(factory, sizes.scratch_size)?;
        let pending = PendingStructure::new(
            backend,
            backend.create_acceleration_structure(
                AccelerationStructureKind::TopLevel,
                result.native(),
                sizes.result_size,
            )?,
        );
        let blas: Vec<Arc<BottomLevelAS>> =
            desc.instances.iter().map(|i| i.blas.clone()).collect();
        let dependencies: Vec<Arc<Buffer>> = blas.iter().map(|b| b.result.clone()).collect();
        run_build(device, |commands| {
            commands.build_acceleration_structure(BuildRecord {
                input: input.clone(),
                destination: pending.handle,
                source: None,
                result: &result,
                scratch: &scratch.buffer,
                scratch_address: scratch.address,
                inputs: std::slice::from_ref(&instance_buffer),
                dependencies: &dependencies,
            })
        })?;
        let address = backend.acceleration_structure_device_address(pending.handle)?;
        Ok(Self {
            base: ResourceBase::new("top-level acceleration structure", desc.label),
            factory: factory.clone(),
            handle: pending.finish(),
            result,
            instance_buffer,
            address,
            sizes,
            flags: desc.flags,
            instances: Mutex::new(TopLevelInstances {
                blas,
                arena,
                records: block,
            }),
        })
    }

    /// Rebuilds the structure in place from new instance data.
    ///
    /// Requires `ALLOW_UPDATE` at creation and the same instance count. The result
    /// buffer, native handle and device address are kept, so resource sets binding
    /// this structure stay valid. Blocks until the update has completed.
    pub fn update(&self, instances: &[Instance]) -> GalResult<()> {
        self.base.ensure_alive()?;
        if !self.flags.contains(AccelerationStructureFlags::ALLOW_UPDATE) {
            return Err(GalError::invalid_state(format!(
                "top-level structure {} was not created with ALLOW_UPDATE",
                self.base.describe()
            )));
        }
        let device = self.factory.device();
        let records = encode_instances(device, instances)?;
        let mut state = self.lock();
        if records.len() != state.records.len() {
            return Err(GalError::descriptor(format!(
                "update supplies {} instances, structure was built with {}",
                records.len(),
                state.records.len()
            )));
        }
        let previous = state.records.to_vec(&state.arena)?;
        let blas: Vec<Arc<BottomLevelAS>> = instances.iter().map(|i| i.blas.clone()).collect();
        if let Err(err) = self.rebuild(device, &state, &records, &blas) {
            // The instance buffer must keep pointing at structures this TLAS holds.
            if let Err(restore) = self.write_records(device, &state, &previous) {
                log::warn!(
                    "restoring instances of {} after a failed update: {restore}",
                    self.base.describe()
                );
            }
            return Err(err);
        }
        state.blas = blas;
        log::debug!("TLAS {} updated in place", self.base.describe());
        Ok(())
    }

    fn write_records(
        &self,
        device: &Arc<DeviceShared>,
        state: &TopLevelInstances,
        records: &[InstanceRecord],
    ) -> GalResult<()> {
        for (i, record) in records.iter().enumerate() {
            state.records.set(&state.arena, i, *record)?;
        }
        state.arena.with_bytes(state.records.block(), |bytes| {
            device.write_buffer(&self.instance_buffer, 0, bytes)
        })?
    }

    /// Writes `records` and refits the structure from them.
    fn rebuild(
        &self,
        device: &Arc<DeviceShared>,
        state: &TopLevelInstances,
        records: &[InstanceRecord],
        blas: &[Arc<BottomLevelAS>],
    ) -> GalResult<()> {
        for structure in blas {
            structure.result.base().ensure_alive()?;
        }
        self.write_records(device, state, records)?;
        let input = Arc::new(AccelerationStructureBuildInput {
            kind: AccelerationStructureKind::TopLevel,
            flags: self.flags,
            geometries: vec![BuildGeometry::Instances {
                address: self.instance_buffer.device_address()?,
                count: records.len() as u32,
            }],
            update: true,
        });
        let scratch = Scratch::new(&self.factory, self.sizes.update_scratch_size)?;
        let dependencies: Vec<Arc<Buffer>> = blas.iter().map(|b| b.result.clone()).collect();
        run_build(device, |commands| {
            commands.build_acceleration_structure(BuildRecord {
                input,
                destination: self.handle,
                source: Some(self.handle),
                result: &self.result,
                scratch: &scratch.buffer,
                scratch_address: scratch.address,
                inputs: std::slice::from_ref(&self.instance_buffer),
                dependencies: &dependencies,
            })
        })
    }

    pub fn instance_count(&self) -> u32 {
        self.lock().records.len() as u32
    }

    /// Bottom-level structures referenced by the current instances.
    pub fn instances(&self) -> Vec<Arc<BottomLevelAS>> {
        self.lock().blas.clone()
    }

    /// Decodes the instance buffer as the GPU sees it.
    pub fn read_instances(&self) -> GalResult<Vec<InstanceRecord>> {
        let bytes = self
            .instance_buffer
            .read(0, self.instance_buffer.size())?;
        Ok(bytes
            .chunks_exact(INSTANCE_RECORD_SIZE as usize)
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    pub fn device_address(&self) -> DeviceAddress {
        self.address
    }

    pub fn result_buffer(&self) -> &Arc<Buffer> {
        &self.result
    }

    pub fn instance_buffer(&self) -> &Arc<Buffer> {
        &self.instance_buffer
    }

    pub fn build_sizes(&self) -> BuildSizes {
        self.sizes
    }

    pub fn flags(&self) -> AccelerationStructureFlags {
        self.flags
    }

    pub(crate) fn native(&self) -> NativeHandle {
        self.handle
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TopLevelInstances> {
        self.instances.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Resource for TopLevelAS {
    fn base(&self) -> &ResourceBase {
        &self.base
    }

    fn dispose(&self) {
        if self.base.begin_dispose() {
            let device = self.factory.device();
            device.wait_for_usage(&self.base);
            device.backend().destroy_acceleration_structure(self.handle);
            self.result.dispose();
            self.instance_buffer.dispose();
        }
    }

    fn set_name(&self, name: &str) {
        self.base.set_name(name);
        self.factory.device().backend().set_debug_name(
            ObjectKind::AccelerationStructure,
            self.handle,
            name,
        );
    }
}

impl Drop for TopLevelAS {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_record_layout_matches_native() {
        assert_eq!(INSTANCE_RECORD_SIZE, 64);
        assert_eq!(std::mem::align_of::<InstanceRecord>(), 8);
    }

    #[test]
    fn instance_record_packs_24_bit_fields() {
        let record = InstanceRecord {
            transform: IDENTITY_TRANSFORM,
            id_and_mask: 0x12_3456 | 0xAB << 24,
            sbt_offset_and_flags: 7 | (InstanceFlags::FORCE_OPAQUE.bits() as u32) << 24,
            blas_address: 0x1_0000_0100,
        };
        assert_eq!(record.instance_id(), 0x12_3456);
        assert_eq!(record.mask(), 0xAB);
        assert_eq!(record.hit_group_offset(), 7);
        assert_eq!(record.flags(), InstanceFlags::FORCE_OPAQUE);
    }

    #[test]
    fn build_preferences_are_exclusive() {
        let flags =
            AccelerationStructureFlags::PREFER_FAST_TRACE | AccelerationStructureFlags::PREFER_FAST_BUILD;
        assert!(matches!(flags.validate(), Err(GalError::InvalidDescriptor(_))));
        assert!(AccelerationStructureFlags::ALLOW_UPDATE.validate().is_ok());
    }

    #[test]
    fn primitive_totals() {
        let input = AccelerationStructureBuildInput {
            kind: AccelerationStructureKind::BottomLevel,
            flags: AccelerationStructureFlags::empty(),
            geometries: vec![
                BuildGeometry::Aabbs {
                    address: 0x100,
                    stride: 24,
                    primitive_count: 4,
                    flags: GeometryFlags::empty(),
                },
                BuildGeometry::Aabbs {
                    address: 0x200,
                    stride: 24,
                    primitive_count: 2,
                    flags: GeometryFlags::OPAQUE,
                },
            ],
            update: false,
        };
        assert_eq!(input.primitive_counts(), vec![4, 2]);
        assert_eq!(input.total_primitives(), 6);
    }
}
