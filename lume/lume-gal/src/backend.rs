//! The capability interface every native backend implements.
//!
//! Front-end objects (factory, command buffers, acceleration structure builder)
//! only ever talk to a `dyn Backend`. Native objects are referred to by opaque
//! [`NativeHandle`]s that index backend-owned tables, so the front end never holds
//! a native API type.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::accel::{AccelerationStructureBuildInput, AccelerationStructureKind, BuildSizes};
use crate::binding::{BindingWrite, LayoutSlot};
use crate::buffer::BufferDescriptor;
use crate::command::Command;
use crate::context::{BackendKind, Capabilities};
use crate::error::{GalError, GalResult};
use crate::pipeline::{
    ComputePipelineDescriptor, GraphicsPipelineDescriptor, RayTracingPipelineDescriptor,
};
use crate::sampler::SamplerDescriptor;
use crate::shader::ShaderStage;
use crate::state::{QueueKind, ResourceState, SubmissionToken};
use crate::swapchain::{NativeSwapchain, SwapchainConfig};
use crate::texture::{TextureDescriptor, TextureRegion, TextureViewDescriptor};

/// Opaque reference to a backend-owned native object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeHandle(pub(crate) u64);

impl NativeHandle {
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// GPU-visible address of buffer or acceleration structure memory.
pub type DeviceAddress = u64;

/// Kind of native object, used for debug naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Buffer,
    Texture,
    TextureView,
    Sampler,
    Shader,
    ResourceLayout,
    ResourceSet,
    Pipeline,
    AccelerationStructure,
}

/// One batch of recorded commands handed to a queue.
#[derive(Debug)]
pub struct Submission<'a> {
    pub queue: QueueKind,
    pub commands: &'a [Command],
    /// Work on other queues that must complete before this batch starts.
    pub waits: &'a [SubmissionToken],
}

/// Counters of the work a backend has translated and submitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStatistics {
    pub submissions: u64,
    pub transitions: u64,
    pub queue_transfers: u64,
    pub draws: u64,
    pub dispatches: u64,
    pub ray_dispatches: u64,
    pub acceleration_structure_builds: u64,
}

/// Native backend. Selected once, when the context is created.
pub trait Backend: Send + Sync + Debug {
    fn kind(&self) -> BackendKind;
    fn capabilities(&self) -> &Capabilities;

    fn create_buffer(&self, desc: &BufferDescriptor) -> GalResult<NativeHandle>;
    fn destroy_buffer(&self, buffer: NativeHandle);
    fn buffer_device_address(&self, buffer: NativeHandle) -> GalResult<DeviceAddress>;
    /// Blocking write through the update path. The buffer is left in `state`.
    fn write_buffer(
        &self,
        buffer: NativeHandle,
        state: ResourceState,
        offset: u64,
        data: &[u8],
    ) -> GalResult<()>;
    /// Blocking readback. The buffer is left in `state`.
    fn read_buffer(
        &self,
        buffer: NativeHandle,
        state: ResourceState,
        offset: u64,
        out: &mut [u8],
    ) -> GalResult<()>;

    fn create_texture(&self, desc: &TextureDescriptor) -> GalResult<NativeHandle>;
    fn destroy_texture(&self, texture: NativeHandle);
    fn create_texture_view(
        &self,
        texture: NativeHandle,
        desc: &TextureViewDescriptor,
    ) -> GalResult<NativeHandle>;
    fn destroy_texture_view(&self, view: NativeHandle);
    /// Blocking upload of tightly packed texels into one region. Returns the state the
    /// texture is left in.
    fn upload_texture(
        &self,
        texture: NativeHandle,
        state: ResourceState,
        region: &TextureRegion,
        data: &[u8],
    ) -> GalResult<ResourceState>;
    /// Blocking mip chain generation from mip 0. Returns the state the texture is left in.
    fn generate_mipmaps(
        &self,
        texture: NativeHandle,
        state: ResourceState,
    ) -> GalResult<ResourceState>;

    fn create_sampler(&self, desc: &SamplerDescriptor) -> GalResult<NativeHandle>;
    fn destroy_sampler(&self, sampler: NativeHandle);

    fn create_shader(
        &self,
        stage: ShaderStage,
        bytecode: &[u8],
        entry_point: &str,
    ) -> GalResult<NativeHandle>;
    fn destroy_shader(&self, shader: NativeHandle);

    fn create_resource_layout(&self, slots: &[LayoutSlot]) -> GalResult<NativeHandle>;
    fn destroy_resource_layout(&self, layout: NativeHandle);
    fn create_resource_set(
        &self,
        layout: NativeHandle,
        writes: &[BindingWrite],
    ) -> GalResult<NativeHandle>;
    fn update_resource_set(&self, set: NativeHandle, writes: &[BindingWrite]) -> GalResult<()>;
    fn destroy_resource_set(&self, set: NativeHandle);

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDescriptor)
        -> GalResult<NativeHandle>;
    fn create_compute_pipeline(&self, desc: &ComputePipelineDescriptor) -> GalResult<NativeHandle>;
    fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDescriptor,
    ) -> GalResult<NativeHandle>;
    fn destroy_pipeline(&self, pipeline: NativeHandle);

    fn acceleration_structure_build_sizes(
        &self,
        input: &AccelerationStructureBuildInput,
    ) -> GalResult<BuildSizes>;
    /// Places an acceleration structure of `size` bytes at the start of `buffer`.
    fn create_acceleration_structure(
        &self,
        kind: AccelerationStructureKind,
        buffer: NativeHandle,
        size: u64,
    ) -> GalResult<NativeHandle>;
    fn acceleration_structure_device_address(
        &self,
        structure: NativeHandle,
    ) -> GalResult<DeviceAddress>;
    fn destroy_acceleration_structure(&self, structure: NativeHandle);

    fn submit(&self, submission: &Submission<'_>) -> GalResult<SubmissionToken>;
    /// Highest completed timeline value on `queue`.
    fn completed_value(&self, queue: QueueKind) -> GalResult<u64>;
    /// Blocks until `token` completes. Returns false if `timeout` elapsed first.
    fn wait(&self, token: SubmissionToken, timeout: Option<Duration>) -> GalResult<bool>;
    fn wait_idle(&self) -> GalResult<()>;

    fn create_swapchain(
        &self,
        config: &SwapchainConfig,
        old: Option<NativeHandle>,
    ) -> GalResult<NativeSwapchain>;
    fn acquire_next_image(&self, swapchain: NativeHandle) -> GalResult<u32>;
    /// Presents `image` once the work behind `wait` has completed.
    fn present(&self, swapchain: NativeHandle, image: u32, wait: SubmissionToken) -> GalResult<()>;
    fn destroy_swapchain(&self, swapchain: NativeHandle);

    fn set_debug_name(&self, kind: ObjectKind, handle: NativeHandle, name: &str);
    fn statistics(&self) -> BackendStatistics;
}

/// Backend-side table mapping handles to native objects.
pub(crate) struct HandleTable<T> {
    label: &'static str,
    next: AtomicU64,
    entries: Mutex<HashMap<u64, T>>,
}

impl<T> HandleTable<T> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            next: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, value: T) -> NativeHandle {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(raw, value);
        NativeHandle(raw)
    }

    pub fn remove(&self, handle: NativeHandle) -> Option<T> {
        self.lock().remove(&handle.0)
    }

    pub fn contains(&self, handle: NativeHandle) -> bool {
        self.lock().contains_key(&handle.0)
    }

    pub fn with<R>(&self, handle: NativeHandle, f: impl FnOnce(&T) -> R) -> GalResult<R> {
        let entries = self.lock();
        let entry = entries.get(&handle.0).ok_or_else(|| self.missing(handle))?;
        Ok(f(entry))
    }

    pub fn with_mut<R>(&self, handle: NativeHandle, f: impl FnOnce(&mut T) -> R) -> GalResult<R> {
        let mut entries = self.lock();
        let entry = entries.get_mut(&handle.0).ok_or_else(|| self.missing(handle))?;
        Ok(f(entry))
    }

    /// Removes every entry, e.g. on device teardown.
    pub fn drain(&self) -> Vec<T> {
        self.lock().drain().map(|(_, v)| v).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn missing(&self, handle: NativeHandle) -> GalError {
        GalError::InvalidState(format!("unknown {} handle {}", self.label, handle.0))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, T>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: Clone> HandleTable<T> {
    pub fn get(&self, handle: NativeHandle) -> GalResult<T> {
        self.with(handle, T::clone)
    }
}

impl<T> Debug for HandleTable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleTable")
            .field("label", &self.label)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_unique_and_removable() {
        let table = HandleTable::new("buffer");
        let a = table.insert(10u32);
        let b = table.insert(20u32);
        assert_ne!(a, b);
        assert_eq!(table.get(b).unwrap(), 20);
        table.with_mut(a, |v| *v += 1).unwrap();
        assert_eq!(table.remove(a), Some(11));
        assert!(matches!(table.get(a), Err(GalError::InvalidState(_))));
        assert_eq!(table.len(), 1);
    }
}
