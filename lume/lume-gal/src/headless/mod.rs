//! Headless backend: a root-signature / command-list device emulated in host memory.
//!
//! Every object lives in a handle table; buffer and texture contents live in one
//! budgeted arena. Command lists run to completion inside `submit`, in order, with
//! each command checking that the resources it touches are in the state the
//! front end promised. A state that disagrees is reported as a validation error,
//! the way a native validation layer would.

mod accel;
mod execute;
mod heap;
mod memory;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::accel::{
    AccelerationStructureBuildInput, AccelerationStructureFlags, AccelerationStructureKind,
    BuildSizes,
};
use crate::arena::ArenaBlock;
use crate::backend::{
    Backend, BackendStatistics, DeviceAddress, HandleTable, NativeHandle, ObjectKind, Submission,
};
use crate::binding::{BindingWrite, LayoutSlot, NativeBinding};
use crate::buffer::{BufferDescriptor, BufferUsage};
use crate::config::{ContextConfig, HeadlessProfile};
use crate::context::{AdapterInfo, AdapterKind, BackendKind, Capabilities};
use crate::error::{GalError, GalResult};
use crate::pipeline::{
    ComputePipelineDescriptor, GraphicsPipelineDescriptor, PipelineKind,
    RayTracingPipelineDescriptor,
};
use crate::sampler::SamplerDescriptor;
use crate::shader::ShaderStage;
use crate::state::{QueueKind, ResourceState, SubmissionToken};
use crate::swapchain::{NativeSwapchain, SurfaceTarget, SwapchainConfig};
use crate::texture::{TextureDescriptor, TextureRegion, TextureUsage, TextureViewDescriptor};

use self::accel::Bounds;
use self::heap::{check_binding, DescriptorHeap, DescriptorTable, HeapKind, RootSignature};
use self::memory::{downsample, region_rows, DeviceMemory};

/// Size of one shader group handle in an emulated shader binding table.
const SHADER_GROUP_HANDLE_SIZE: u64 = 32;
/// Alignment of each shader binding table region.
const SHADER_TABLE_ALIGNMENT: u64 = 64;

/// Capabilities and identity of the single headless adapter.
pub fn adapter_info(config: &ContextConfig) -> AdapterInfo {
    let profile = &config.headless;
    AdapterInfo {
        index: 0,
        name: profile.device_name.clone(),
        kind: AdapterKind::Cpu,
        capabilities: capabilities(profile),
    }
}

fn capabilities(profile: &HeadlessProfile) -> Capabilities {
    Capabilities {
        device_name: profile.device_name.clone(),
        backend: BackendKind::Headless,
        adapter_kind: AdapterKind::Cpu,
        ray_query: profile.ray_query,
        ray_tracing: profile.ray_tracing,
        bindless: profile.bindless,
        max_bindless_descriptors: if profile.bindless {
            profile.resource_heap_size
        } else {
            0
        },
        max_texture_dimension_2d: 16384,
        max_sample_count: 8,
        max_ray_recursion_depth: if profile.ray_tracing { 31 } else { 0 },
        storage_render_target: profile.storage_render_target,
        scratch_alignment: memory::ADDRESS_ALIGNMENT,
    }
}

#[derive(Debug, Clone, Copy)]
struct BufferEntry {
    block: ArenaBlock,
    size: u64,
    usage: BufferUsage,
    address: Option<DeviceAddress>,
    state: ResourceState,
}

#[derive(Debug, Clone)]
struct TextureEntry {
    desc: TextureDescriptor,
    /// One block per (layer, mip), layer-major.
    subresources: Vec<ArenaBlock>,
    state: ResourceState,
}

impl TextureEntry {
    fn subresource(&self, mip: u32, layer: u32) -> GalResult<ArenaBlock> {
        self.subresources
            .get((layer * self.desc.mip_levels + mip) as usize)
            .copied()
            .ok_or_else(|| {
                GalError::Backend(format!("texture has no mip {mip} in layer {layer}"))
            })
    }
}

#[derive(Debug, Clone)]
struct ViewEntry {
    texture: NativeHandle,
}

#[derive(Debug, Clone)]
struct ShaderEntry {
    stage: ShaderStage,
    entry_point: String,
}

/// Regions of an emulated shader binding table.
#[derive(Debug, Clone, Copy)]
struct ShaderTable {
    block: ArenaBlock,
    miss_offset: u64,
    hit_offset: u64,
    stride: u64,
}

#[derive(Debug, Clone)]
struct PipelineEntry {
    kind: PipelineKind,
    layouts: Vec<NativeHandle>,
    shader_table: Option<ShaderTable>,
}

#[derive(Debug, Clone, Copy)]
struct BuiltStructure {
    primitive_count: u32,
    flags: AccelerationStructureFlags,
    bounds: Bounds,
    updates: u32,
}

#[derive(Debug, Clone, Copy)]
struct StructureEntry {
    kind: AccelerationStructureKind,
    buffer: NativeHandle,
    size: u64,
    address: DeviceAddress,
    built: Option<BuiltStructure>,
}

#[derive(Debug, Clone)]
struct SwapchainEntry {
    images: Vec<NativeHandle>,
    next: u32,
    presents: u64,
}

#[derive(Debug)]
struct Heaps {
    resource: DescriptorHeap,
    sampler: DescriptorHeap,
}

impl Heaps {
    fn get_mut(&mut self, kind: HeapKind) -> &mut DescriptorHeap {
        match kind {
            HeapKind::Resource => &mut self.resource,
            HeapKind::Sampler => &mut self.sampler,
        }
    }

    fn get(&self, kind: HeapKind) -> &DescriptorHeap {
        match kind {
            HeapKind::Resource => &self.resource,
            HeapKind::Sampler => &self.sampler,
        }
    }
}

/// Backend that needs no GPU. See the module documentation.
pub struct HeadlessBackend {
    caps: Capabilities,
    memory: DeviceMemory,
    buffers: HandleTable<BufferEntry>,
    textures: HandleTable<TextureEntry>,
    views: HandleTable<ViewEntry>,
    samplers: HandleTable<SamplerDescriptor>,
    shaders: HandleTable<ShaderEntry>,
    roots: HandleTable<RootSignature>,
    tables: HandleTable<DescriptorTable>,
    heaps: Mutex<Heaps>,
    pipelines: HandleTable<PipelineEntry>,
    structures: HandleTable<StructureEntry>,
    structure_addresses: Mutex<HashMap<DeviceAddress, NativeHandle>>,
    swapchains: HandleTable<SwapchainEntry>,
    timelines: [AtomicU64; QueueKind::COUNT],
    /// Held while a command list executes; lists never interleave.
    execution: Mutex<()>,
    names: Mutex<HashMap<(ObjectKind, NativeHandle), String>>,
    stats: Mutex<BackendStatistics>,
}

impl std::fmt::Debug for HeadlessBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessBackend")
            .field("device", &self.caps.device_name)
            .field("memory", &self.memory)
            .field("buffers", &self.buffers.len())
            .field("textures", &self.textures.len())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Validation failure raised while executing a command list.
fn validation(msg: impl std::fmt::Display) -> GalError {
    GalError::Backend(format!("validation: {msg}"))
}

impl HeadlessBackend {
    pub fn new(config: &ContextConfig) -> Self {
        let profile = &config.headless;
        log::info!(
            "headless device '{}': {} MiB memory, {} resource / {} sampler descriptors",
            profile.device_name,
            profile.memory_budget >> 20,
            profile.resource_heap_size,
            profile.sampler_heap_size
        );
        Self {
            caps: capabilities(profile),
            memory: DeviceMemory::new(profile.memory_budget),
            buffers: HandleTable::new("buffer"),
            textures: HandleTable::new("texture"),
            views: HandleTable::new("texture view"),
            samplers: HandleTable::new("sampler"),
            shaders: HandleTable::new("shader"),
            roots: HandleTable::new("root signature"),
            tables: HandleTable::new("descriptor table"),
            heaps: Mutex::new(Heaps {
                resource: DescriptorHeap::new("resource", profile.resource_heap_size),
                sampler: DescriptorHeap::new("sampler", profile.sampler_heap_size),
            }),
            pipelines: HandleTable::new("pipeline"),
            structures: HandleTable::new("acceleration structure"),
            structure_addresses: Mutex::new(HashMap::new()),
            swapchains: HandleTable::new("swapchain"),
            timelines: Default::default(),
            execution: Mutex::new(()),
            names: Mutex::new(HashMap::new()),
            stats: Mutex::new(BackendStatistics::default()),
        }
    }

    /// Bytes of emulated device memory currently allocated.
    pub fn memory_in_use(&self) -> u64 {
        self.memory.arena().live_bytes()
    }

    /// Descriptors still free in the resource and sampler heaps.
    pub fn free_descriptors(&self) -> (u32, u32) {
        let heaps = lock(&self.heaps);
        (heaps.resource.available(), heaps.sampler.available())
    }

    /// Debug name of an object, or its handle number.
    fn describe(&self, kind: ObjectKind, handle: NativeHandle) -> String {
        match lock(&self.names).get(&(kind, handle)) {
            Some(name) => format!("'{name}'"),
            None => format!("#{}", handle.raw()),
        }
    }

    fn forget_name(&self, kind: ObjectKind, handle: NativeHandle) {
        lock(&self.names).remove(&(kind, handle));
    }

    fn buffer(&self, handle: NativeHandle) -> GalResult<BufferEntry> {
        self.buffers.get(handle)
    }

    fn texture(&self, handle: NativeHandle) -> GalResult<TextureEntry> {
        self.textures.get(handle)
    }

    fn read_region(&self, texture: &TextureEntry, region: &TextureRegion) -> GalResult<Vec<u8>> {
        let block = texture.subresource(region.mip_level, region.array_layer)?;
        let format = texture.desc.format;
        let rows = region_rows(
            texture.desc.mip_extent(region.mip_level),
            region.origin,
            region.extent,
            format.bytes_per_texel(),
        );
        let mut out = vec![0u8; region.data_size(format) as usize];
        self.memory.arena().with_bytes(block, |bytes| {
            for (texture, packed, len) in rows {
                out[packed..packed + len].copy_from_slice(&bytes[texture..texture + len]);
            }
        })?;
        Ok(out)
    }

    fn write_region(
        &self,
        texture: &TextureEntry,
        region: &TextureRegion,
        data: &[u8],
    ) -> GalResult<()> {
        let block = texture.subresource(region.mip_level, region.array_layer)?;
        let format = texture.desc.format;
        if data.len() as u64 != region.data_size(format) {
            return Err(GalError::Backend(format!(
                "{} bytes for a region of {} bytes",
                data.len(),
                region.data_size(format)
            )));
        }
        let rows = region_rows(
            texture.desc.mip_extent(region.mip_level),
            region.origin,
            region.extent,
            format.bytes_per_texel(),
        );
        self.memory.arena().with_bytes_mut(block, |bytes| {
            for (texture, packed, len) in rows {
                bytes[texture..texture + len].copy_from_slice(&data[packed..packed + len]);
            }
        })
    }

    fn create_texture_entry(&self, desc: &TextureDescriptor) -> GalResult<NativeHandle> {
        let mut subresources = Vec::with_capacity((desc.array_layers * desc.mip_levels) as usize);
        for _layer in 0..desc.array_layers {
            for mip in 0..desc.mip_levels {
                match self.memory.allocate(desc.mip_size(mip)) {
                    Ok(block) => subresources.push(block),
                    Err(err) => {
                        for block in subresources {
                            self.memory.release(block);
                        }
                        return Err(err);
                    }
                }
            }
        }
        Ok(self.textures.insert(TextureEntry {
            desc: desc.clone(),
            subresources,
            state: ResourceState::Undefined,
        }))
    }

    fn ensure_shader(&self, shader: NativeHandle, stage: ShaderStage) -> GalResult<()> {
        let entry = self.shaders.get(shader)?;
        if entry.stage != stage {
            return Err(GalError::Backend(format!(
                "shader '{}' is a {:?} shader, expected {stage:?}",
                entry.entry_point, entry.stage
            )));
        }
        Ok(())
    }

    fn layout_handles(
        &self,
        layouts: &[std::sync::Arc<crate::binding::ResourceLayout>],
    ) -> GalResult<Vec<NativeHandle>> {
        layouts
            .iter()
            .map(|layout| {
                let handle = layout.native();
                self.roots.with(handle, |_| handle)
            })
            .collect()
    }

    fn write_descriptors(&self, table: &DescriptorTable, writes: &[BindingWrite]) -> GalResult<()> {
        let mut located = Vec::with_capacity(writes.len());
        for write in writes {
            check_binding(write.kind, &write.binding)?;
            self.ensure_bindable(&write.binding)?;
            located.push((table.signature.locate(table.bases(), write)?, write.binding));
        }
        let mut heaps = lock(&self.heaps);
        for ((heap, index), binding) in located {
            heaps.get_mut(heap).write(index, binding);
        }
        Ok(())
    }

    fn ensure_bindable(&self, binding: &NativeBinding) -> GalResult<()> {
        match *binding {
            NativeBinding::Buffer {
                buffer,
                offset,
                size,
            } => {
                let entry = self.buffer(buffer)?;
                if offset.checked_add(size).map_or(true, |end| end > entry.size) {
                    return Err(GalError::binding(format!(
                        "buffer range {offset}+{size} outside {} bytes",
                        entry.size
                    )));
                }
                Ok(())
            }
            NativeBinding::Texture(texture) => self.textures.with(texture, |_| ()),
            NativeBinding::TextureView(view) => self.views.with(view, |_| ()),
            NativeBinding::Sampler(sampler) => self.samplers.with(sampler, |_| ()),
            NativeBinding::AccelerationStructure(structure) => {
                let entry = self.structures.get(structure)?;
                if entry.kind != AccelerationStructureKind::TopLevel {
                    return Err(GalError::binding(
                        "only top-level structures can be bound to shaders",
                    ));
                }
                Ok(())
            }
        }
    }

    fn release_table(&self, table: &DescriptorTable) {
        let mut heaps = lock(&self.heaps);
        heaps
            .resource
            .release(table.resource_base, table.signature.resource_count);
        heaps
            .sampler
            .release(table.sampler_base, table.signature.sampler_count);
    }

    fn add_statistics(&self, delta: &BackendStatistics) {
        let mut stats = lock(&self.stats);
        stats.submissions += delta.submissions;
        stats.transitions += delta.transitions;
        stats.queue_transfers += delta.queue_transfers;
        stats.draws += delta.draws;
        stats.dispatches += delta.dispatches;
        stats.ray_dispatches += delta.ray_dispatches;
        stats.acceleration_structure_builds += delta.acceleration_structure_builds;
    }
}

impl Backend for HeadlessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Headless
    }

    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    fn create_buffer(&self, desc: &BufferDescriptor) -> GalResult<NativeHandle> {
        let block = self.memory.allocate(desc.size)?;
        Ok(self.buffers.insert(BufferEntry {
            block,
            size: desc.size,
            usage: desc.usage,
            address: None,
            state: ResourceState::Common,
        }))
    }

    fn destroy_buffer(&self, buffer: NativeHandle) {
        if let Some(entry) = self.buffers.remove(buffer) {
            if let Some(address) = entry.address {
                self.memory.unmap_address(address);
            }
            self.memory.release(entry.block);
            self.forget_name(ObjectKind::Buffer, buffer);
        }
    }

    fn buffer_device_address(&self, buffer: NativeHandle) -> GalResult<DeviceAddress> {
        let entry = self.buffer(buffer)?;
        if let Some(address) = entry.address {
            return Ok(address);
        }
        let address = self.memory.map_address(buffer, entry.size);
        self.buffers.with_mut(buffer, |e| e.address = Some(address))?;
        Ok(address)
    }

    fn write_buffer(
        &self,
        buffer: NativeHandle,
        _state: ResourceState,
        offset: u64,
        data: &[u8],
    ) -> GalResult<()> {
        let entry = self.buffer(buffer)?;
        self.memory.arena().write(entry.block, offset, data)
    }

    fn read_buffer(
        &self,
        buffer: NativeHandle,
        _state: ResourceState,
        offset: u64,
        out: &mut [u8],
    ) -> GalResult<()> {
        let entry = self.buffer(buffer)?;
        self.memory.arena().read(entry.block, offset, out)
    }

    fn create_texture(&self, desc: &TextureDescriptor) -> GalResult<NativeHandle> {
        self.create_texture_entry(desc)
    }

    fn destroy_texture(&self, texture: NativeHandle) {
        if let Some(entry) = self.textures.remove(texture) {
            for block in entry.subresources {
                self.memory.release(block);
            }
            self.forget_name(ObjectKind::Texture, texture);
        }
    }

    fn create_texture_view(
        &self,
        texture: NativeHandle,
        desc: &TextureViewDescriptor,
    ) -> GalResult<NativeHandle> {
        let (mips, layers) = self
            .textures
            .with(texture, |e| (e.desc.mip_levels, e.desc.array_layers))?;
        if desc.base_mip_level >= mips || desc.base_array_layer >= layers {
            return Err(GalError::Backend(format!(
                "view of mip {} layer {} on a texture with {mips} mips and {layers} layers",
                desc.base_mip_level, desc.base_array_layer
            )));
        }
        Ok(self.views.insert(ViewEntry { texture }))
    }

    fn destroy_texture_view(&self, view: NativeHandle) {
        self.views.remove(view);
        self.forget_name(ObjectKind::TextureView, view);
    }

    fn upload_texture(
        &self,
        texture: NativeHandle,
        _state: ResourceState,
        region: &TextureRegion,
        data: &[u8],
    ) -> GalResult<ResourceState> {
        let entry = self.texture(texture)?;
        self.write_region(&entry, region, data)?;
        self.textures
            .with_mut(texture, |e| e.state = ResourceState::ShaderRead)?;
        Ok(ResourceState::ShaderRead)
    }

    fn generate_mipmaps(
        &self,
        texture: NativeHandle,
        _state: ResourceState,
    ) -> GalResult<ResourceState> {
        let entry = self.texture(texture)?;
        let desc = &entry.desc;
        for layer in 0..desc.array_layers {
            for mip in 1..desc.mip_levels {
                let src = entry.subresource(mip - 1, layer)?;
                let dst = entry.subresource(mip, layer)?;
                let source = self.memory.arena().read_vec(src, 0, src.len())?;
                let filtered = downsample(
                    &source,
                    desc.mip_extent(mip - 1),
                    desc.mip_extent(mip),
                    desc.format,
                );
                self.memory.arena().write(dst, 0, &filtered)?;
            }
        }
        self.textures
            .with_mut(texture, |e| e.state = ResourceState::ShaderRead)?;
        Ok(ResourceState::ShaderRead)
    }

    fn create_sampler(&self, desc: &SamplerDescriptor) -> GalResult<NativeHandle> {
        Ok(self.samplers.insert(desc.clone()))
    }

    fn destroy_sampler(&self, sampler: NativeHandle) {
        self.samplers.remove(sampler);
        self.forget_name(ObjectKind::Sampler, sampler);
    }

    fn create_shader(
        &self,
        stage: ShaderStage,
        _bytecode: &[u8],
        entry_point: &str,
    ) -> GalResult<NativeHandle> {
        Ok(self.shaders.insert(ShaderEntry {
            stage,
            entry_point: entry_point.to_owned(),
        }))
    }

    fn destroy_shader(&self, shader: NativeHandle) {
        self.shaders.remove(shader);
        self.forget_name(ObjectKind::Shader, shader);
    }

    fn create_resource_layout(&self, slots: &[LayoutSlot]) -> GalResult<NativeHandle> {
        let signature = RootSignature::new(slots);
        let heaps = lock(&self.heaps);
        if signature.resource_count > heaps.resource.capacity()
            || signature.sampler_count > heaps.sampler.capacity()
        {
            return Err(GalError::UnsupportedUsage(format!(
                "layout needs {} resource and {} sampler descriptors; heaps hold {} and {}",
                signature.resource_count,
                signature.sampler_count,
                heaps.resource.capacity(),
                heaps.sampler.capacity()
            )));
        }
        drop(heaps);
        Ok(self.roots.insert(signature))
    }

    fn destroy_resource_layout(&self, layout: NativeHandle) {
        self.roots.remove(layout);
        self.forget_name(ObjectKind::ResourceLayout, layout);
    }

    fn create_resource_set(
        &self,
        layout: NativeHandle,
        writes: &[BindingWrite],
    ) -> GalResult<NativeHandle> {
        let signature = self.roots.get(layout)?;
        let (resource_base, sampler_base) = {
            let mut heaps = lock(&self.heaps);
            let resource_base = heaps.resource.allocate(signature.resource_count)?;
            match heaps.sampler.allocate(signature.sampler_count) {
                Ok(sampler_base) => (resource_base, sampler_base),
                Err(err) => {
                    heaps
                        .resource
                        .release(resource_base, signature.resource_count);
                    return Err(err);
                }
            }
        };
        let table = DescriptorTable {
            root: layout,
            signature,
            resource_base,
            sampler_base,
        };
        if let Err(err) = self.write_descriptors(&table, writes) {
            self.release_table(&table);
            return Err(err);
        }
        Ok(self.tables.insert(table))
    }

    fn update_resource_set(&self, set: NativeHandle, writes: &[BindingWrite]) -> GalResult<()> {
        let table = self.tables.get(set)?;
        self.write_descriptors(&table, writes)
    }

    fn destroy_resource_set(&self, set: NativeHandle) {
        if let Some(table) = self.tables.remove(set) {
            self.release_table(&table);
            self.forget_name(ObjectKind::ResourceSet, set);
        }
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDescriptor,
    ) -> GalResult<NativeHandle> {
        self.ensure_shader(desc.vertex_shader.native(), ShaderStage::Vertex)?;
        if let Some(fragment) = &desc.fragment_shader {
            self.ensure_shader(fragment.native(), ShaderStage::Fragment)?;
        }
        let layouts = self.layout_handles(&desc.layouts)?;
        Ok(self.pipelines.insert(PipelineEntry {
            kind: PipelineKind::Graphics,
            layouts,
            shader_table: None,
        }))
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDescriptor) -> GalResult<NativeHandle> {
        self.ensure_shader(desc.shader.native(), ShaderStage::Compute)?;
        let layouts = self.layout_handles(&desc.layouts)?;
        Ok(self.pipelines.insert(PipelineEntry {
            kind: PipelineKind::Compute,
            layouts,
            shader_table: None,
        }))
    }

    fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDescriptor,
    ) -> GalResult<NativeHandle> {
        for shader in &desc.shaders {
            self.shaders.with(shader.native(), |_| ())?;
        }
        let layouts = self.layout_handles(&desc.layouts)?;
        // Raygen, miss and hit regions, each aligned; one handle-sized record per group.
        let stride = SHADER_GROUP_HANDLE_SIZE.next_multiple_of(SHADER_TABLE_ALIGNMENT);
        let miss_offset = stride;
        let hit_offset =
            (miss_offset + stride * desc.miss.len() as u64).next_multiple_of(SHADER_TABLE_ALIGNMENT);
        let size = hit_offset + stride * desc.hit_groups.len() as u64;
        let block = self.memory.allocate(size)?;
        let misses = desc.miss.len() as u64;
        // Each record starts with its group index; the rest of the handle is zero.
        let written = (0..desc.group_count()).try_for_each(|group| {
            let g = group as u64;
            let offset = if g == 0 {
                0
            } else if g <= misses {
                miss_offset + stride * (g - 1)
            } else {
                hit_offset + stride * (g - 1 - misses)
            };
            self.memory
                .arena()
                .write(block, offset, &group.to_le_bytes())
        });
        if let Err(err) = written {
            self.memory.release(block);
            return Err(err);
        }
        Ok(self.pipelines.insert(PipelineEntry {
            kind: PipelineKind::RayTracing,
            layouts,
            shader_table: Some(ShaderTable {
                block,
                miss_offset,
                hit_offset,
                stride,
            }),
        }))
    }

    fn destroy_pipeline(&self, pipeline: NativeHandle) {
        if let Some(entry) = self.pipelines.remove(pipeline) {
            if let Some(table) = entry.shader_table {
                self.memory.release(table.block);
            }
            self.forget_name(ObjectKind::Pipeline, pipeline);
        }
    }

    fn acceleration_structure_build_sizes(
        &self,
        input: &AccelerationStructureBuildInput,
    ) -> GalResult<BuildSizes> {
        if input.geometries.is_empty() {
            return Err(GalError::EmptyBuildInput("geometries"));
        }
        Ok(accel::build_sizes(input))
    }

    fn create_acceleration_structure(
        &self,
        kind: AccelerationStructureKind,
        buffer: NativeHandle,
        size: u64,
    ) -> GalResult<NativeHandle> {
        let entry = self.buffer(buffer)?;
        if !entry
            .usage
            .contains(BufferUsage::ACCELERATION_STRUCTURE_STORAGE)
        {
            return Err(GalError::UnsupportedUsage(
                "acceleration structures need ACCELERATION_STRUCTURE_STORAGE buffers".into(),
            ));
        }
        if size > entry.size {
            return Err(GalError::Backend(format!(
                "structure of {size} bytes does not fit a {} byte buffer",
                entry.size
            )));
        }
        let address = self.buffer_device_address(buffer)?;
        let handle = self.structures.insert(StructureEntry {
            kind,
            buffer,
            size,
            address,
            built: None,
        });
        lock(&self.structure_addresses).insert(address, handle);
        Ok(handle)
    }

    fn acceleration_structure_device_address(
        &self,
        structure: NativeHandle,
    ) -> GalResult<DeviceAddress> {
        self.structures.with(structure, |e| e.address)
    }

    fn destroy_acceleration_structure(&self, structure: NativeHandle) {
        if let Some(entry) = self.structures.remove(structure) {
            let mut addresses = lock(&self.structure_addresses);
            if addresses.get(&entry.address) == Some(&structure) {
                addresses.remove(&entry.address);
            }
            drop(addresses);
            self.forget_name(ObjectKind::AccelerationStructure, structure);
        }
    }

    fn submit(&self, submission: &Submission<'_>) -> GalResult<SubmissionToken> {
        let _running = lock(&self.execution);
        for wait in submission.waits {
            if wait.value > self.timelines[wait.queue.index()].load(Ordering::Acquire) {
                return Err(GalError::invalid_state(format!(
                    "submission waits on {:?} value {} which was never submitted",
                    wait.queue, wait.value
                )));
            }
        }
        let mut stats = self.execute(submission.queue, submission.commands)?;
        stats.submissions = 1;
        self.add_statistics(&stats);
        let value = self.timelines[submission.queue.index()].fetch_add(1, Ordering::AcqRel) + 1;
        log::trace!(
            "headless {:?} executed {} commands as value {value}",
            submission.queue,
            submission.commands.len()
        );
        Ok(SubmissionToken {
            queue: submission.queue,
            value,
        })
    }

    fn completed_value(&self, queue: QueueKind) -> GalResult<u64> {
        Ok(self.timelines[queue.index()].load(Ordering::Acquire))
    }

    fn wait(&self, token: SubmissionToken, _timeout: Option<Duration>) -> GalResult<bool> {
        // Work completes inside submit, so any submitted value is already reached.
        let completed = self.completed_value(token.queue)?;
        if token.value > completed {
            return Err(GalError::invalid_state(format!(
                "{:?} value {} was never submitted (last {completed})",
                token.queue, token.value
            )));
        }
        Ok(true)
    }

    fn wait_idle(&self) -> GalResult<()> {
        drop(lock(&self.execution));
        Ok(())
    }

    fn create_swapchain(
        &self,
        config: &SwapchainConfig,
        old: Option<NativeHandle>,
    ) -> GalResult<NativeSwapchain> {
        match config.surface {
            SurfaceTarget::Headless => {}
            #[cfg(feature = "window")]
            SurfaceTarget::Window(_) => {
                return Err(GalError::UnsupportedCapability(
                    "the headless backend cannot present to a window".into(),
                ))
            }
        }
        if let Some(old) = old {
            self.swapchains.with(old, |_| ())?;
        }
        let desc = TextureDescriptor {
            label: Some("swapchain image"),
            ..TextureDescriptor::new_2d(
                config.width,
                config.height,
                config.format,
                TextureUsage::RENDER_TARGET | TextureUsage::COPY_SRC | TextureUsage::COPY_DST,
            )
        };
        let mut images = Vec::with_capacity(config.image_count as usize);
        for _ in 0..config.image_count {
            match self.create_texture_entry(&desc) {
                Ok(image) => images.push(image),
                Err(err) => {
                    for image in images {
                        self.destroy_texture(image);
                    }
                    return Err(err);
                }
            }
        }
        let handle = self.swapchains.insert(SwapchainEntry {
            images: images.clone(),
            next: 0,
            presents: 0,
        });
        Ok(NativeSwapchain {
            handle,
            images,
            format: config.format,
            extent: [config.width, config.height],
        })
    }

    fn acquire_next_image(&self, swapchain: NativeHandle) -> GalResult<u32> {
        self.swapchains.with_mut(swapchain, |entry| {
            let index = entry.next;
            entry.next = (index + 1) % entry.images.len() as u32;
            index
        })
    }

    fn present(&self, swapchain: NativeHandle, image: u32, wait: SubmissionToken) -> GalResult<()> {
        self.wait(wait, None)?;
        let handle = self
            .swapchains
            .with(swapchain, |entry| entry.images.get(image as usize).copied())?
            .ok_or_else(|| GalError::invalid_state(format!("swapchain has no image {image}")))?;
        let state = self.textures.with(handle, |e| e.state)?;
        if state != ResourceState::Present {
            return Err(validation(format!(
                "swapchain image {image} presented in {state:?}"
            )));
        }
        let presents = self.swapchains.with_mut(swapchain, |entry| {
            entry.presents += 1;
            entry.presents
        })?;
        log::trace!("headless present: image {image}, frame {presents}");
        Ok(())
    }

    fn destroy_swapchain(&self, swapchain: NativeHandle) {
        if let Some(entry) = self.swapchains.remove(swapchain) {
            for image in entry.images {
                self.destroy_texture(image);
            }
        }
    }

    fn set_debug_name(&self, kind: ObjectKind, handle: NativeHandle, name: &str) {
        lock(&self.names).insert((kind, handle), name.to_owned());
    }

    fn statistics(&self) -> BackendStatistics {
        *lock(&self.stats)
    }
}

impl Drop for HeadlessBackend {
    fn drop(&mut self) {
        let leaked = self.buffers.len() + self.textures.len();
        if leaked > 0 {
            log::debug!(
                "headless device dropped with {leaked} live buffers and textures ({} bytes)",
                self.memory_in_use()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::TextureFormat;

    fn backend_with(profile: HeadlessProfile) -> HeadlessBackend {
        HeadlessBackend::new(&ContextConfig {
            headless: profile,
            ..ContextConfig::default()
        })
    }

    fn backend() -> HeadlessBackend {
        backend_with(HeadlessProfile::default())
    }

    #[test]
    fn adapter_reflects_the_profile() {
        let config = ContextConfig {
            headless: HeadlessProfile {
                ray_tracing: false,
                ..HeadlessProfile::default()
            },
            ..ContextConfig::default()
        };
        let info = adapter_info(&config);
        assert_eq!(info.name, "Lume Headless Device");
        assert_eq!(info.kind, AdapterKind::Cpu);
        assert!(!info.capabilities.ray_tracing);
        assert!(info.capabilities.ray_query);
        assert!(info.capabilities.acceleration_structures());
    }

    #[test]
    fn memory_budget_is_enforced() {
        let backend = backend_with(HeadlessProfile {
            memory_budget: 1024,
            ..HeadlessProfile::default()
        });
        let first = backend
            .create_buffer(&BufferDescriptor::new(1000, BufferUsage::STORAGE))
            .unwrap();
        let err = backend
            .create_buffer(&BufferDescriptor::new(100, BufferUsage::STORAGE))
            .unwrap_err();
        assert!(matches!(err, GalError::AllocationFailure { .. }));
        backend.destroy_buffer(first);
        assert_eq!(backend.memory_in_use(), 0);
        backend
            .create_buffer(&BufferDescriptor::new(100, BufferUsage::STORAGE))
            .unwrap();
    }

    #[test]
    fn device_addresses_are_stable_and_distinct() {
        let backend = backend();
        let a = backend
            .create_buffer(&BufferDescriptor::new(48, BufferUsage::VERTEX))
            .unwrap();
        let b = backend
            .create_buffer(&BufferDescriptor::new(48, BufferUsage::VERTEX))
            .unwrap();
        let address = backend.buffer_device_address(a).unwrap();
        assert_ne!(address, 0);
        assert_eq!(address % memory::ADDRESS_ALIGNMENT, 0);
        assert_eq!(backend.buffer_device_address(a).unwrap(), address);
        assert_ne!(backend.buffer_device_address(b).unwrap(), address);
    }

    #[test]
    fn texture_regions_round_trip_through_subresources() {
        let backend = backend();
        let desc = TextureDescriptor {
            mip_levels: 2,
            array_layers: 2,
            ..TextureDescriptor::new_2d(4, 4, TextureFormat::R8Unorm, TextureUsage::SAMPLED)
        };
        let texture = backend.create_texture(&desc).unwrap();
        let region = TextureRegion {
            mip_level: 0,
            array_layer: 1,
            origin: [1, 1, 0],
            extent: [2, 2, 1],
        };
        let state = backend
            .upload_texture(texture, ResourceState::Undefined, &region, &[1, 2, 3, 4])
            .unwrap();
        assert_eq!(state, ResourceState::ShaderRead);
        let entry = backend.texture(texture).unwrap();
        assert_eq!(backend.read_region(&entry, &region).unwrap(), vec![1, 2, 3, 4]);
        let whole = TextureRegion::whole(&desc, 0, 1);
        let all = backend.read_region(&entry, &whole).unwrap();
        assert_eq!(all[5], 1);
        assert_eq!(all[10], 4);
        assert_eq!(all.iter().filter(|&&b| b != 0).count(), 4);
    }

    #[test]
    fn descriptor_heaps_are_returned_on_destroy() {
        let backend = backend_with(HeadlessProfile {
            resource_heap_size: 8,
            ..HeadlessProfile::default()
        });
        let slots = [LayoutSlot {
            slot: 0,
            kind: crate::binding::ResourceKind::StorageBufferReadWrite,
            stages: crate::shader::ShaderStages::COMPUTE,
            capacity: 6,
            array: true,
            bindless: false,
        }];
        let layout = backend.create_resource_layout(&slots).unwrap();
        let set = backend.create_resource_set(layout, &[]).unwrap();
        assert_eq!(backend.free_descriptors().0, 2);
        let err = backend.create_resource_set(layout, &[]).unwrap_err();
        assert!(matches!(err, GalError::AllocationFailure { .. }));
        backend.destroy_resource_set(set);
        assert_eq!(backend.free_descriptors().0, 8);
    }

    #[test]
    fn headless_swapchains_cycle_images() {
        let backend = backend();
        let native = backend
            .create_swapchain(
                &SwapchainConfig {
                    surface: SurfaceTarget::Headless,
                    width: 8,
                    height: 8,
                    format: TextureFormat::Bgra8Unorm,
                    image_count: 2,
                    vsync: true,
                },
                None,
            )
            .unwrap();
        assert_eq!(native.images.len(), 2);
        assert_eq!(backend.acquire_next_image(native.handle).unwrap(), 0);
        assert_eq!(backend.acquire_next_image(native.handle).unwrap(), 1);
        assert_eq!(backend.acquire_next_image(native.handle).unwrap(), 0);
        backend.destroy_swapchain(native.handle);
        assert_eq!(backend.memory_in_use(), 0);
    }
}
