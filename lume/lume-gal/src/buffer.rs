//! GPU buffers, their descriptors and host access.

use std::sync::Arc;

use crate::backend::{DeviceAddress, NativeHandle, ObjectKind};
use crate::context::Capabilities;
use crate::device::DeviceShared;
use crate::error::{GalError, GalResult};
use crate::resource::{Resource, ResourceBase};
use crate::state::{ResourceState, StateCell, Tracked, TransitionTarget};

bitflags::bitflags! {
    /// Buffer usage flags; combine for buffers used in multiple ways (e.g. VERTEX | ACCELERATION_STRUCTURE).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const CONSTANT = 1 << 2;
        const STORAGE = 1 << 3;
        const INDIRECT = 1 << 4;
        /// Read by acceleration structure builds (geometry, transforms, instances).
        const ACCELERATION_STRUCTURE = 1 << 5;
        /// Backing storage of a built acceleration structure.
        const ACCELERATION_STRUCTURE_STORAGE = 1 << 6;
        /// Host-visible memory, written by the CPU every frame.
        const DYNAMIC = 1 << 7;
        const COPY_SRC = 1 << 8;
        const COPY_DST = 1 << 9;
    }
}

impl BufferUsage {
    /// Usages whose buffers get a device address when the device supports
    /// acceleration structures. Vertex and index buffers are included so that mesh
    /// data can feed a build without a copy.
    pub const DEVICE_ADDRESS: BufferUsage = BufferUsage::VERTEX
        .union(BufferUsage::INDEX)
        .union(BufferUsage::STORAGE)
        .union(BufferUsage::ACCELERATION_STRUCTURE)
        .union(BufferUsage::ACCELERATION_STRUCTURE_STORAGE);
}

#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub label: Option<&'static str>,
    pub size: u64,
    pub usage: BufferUsage,
    /// Element size of a structured buffer; must divide `size`.
    pub stride: Option<u64>,
}

impl Default for BufferDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            size: 0,
            usage: BufferUsage::VERTEX,
            stride: None,
        }
    }
}

impl BufferDescriptor {
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self {
            size,
            usage,
            ..Default::default()
        }
    }

    pub fn with_label(mut self, label: &'static str) -> Self {
        self.label = Some(label);
        self
    }

    pub fn with_stride(mut self, stride: u64) -> Self {
        self.stride = Some(stride);
        self
    }

    /// Whether the backend must allocate this buffer with a device address.
    pub fn needs_device_address(&self, caps: &Capabilities) -> bool {
        caps.acceleration_structures() && self.usage.intersects(BufferUsage::DEVICE_ADDRESS)
    }

    pub(crate) fn validate(&self, caps: &Capabilities) -> GalResult<()> {
        if self.size == 0 {
            return Err(GalError::descriptor("buffer size must be non-zero"));
        }
        if self.usage.is_empty() {
            return Err(GalError::descriptor("buffer usage must not be empty"));
        }
        if let Some(stride) = self.stride {
            if stride == 0 || self.size % stride != 0 {
                return Err(GalError::descriptor(format!(
                    "stride {stride} does not evenly divide buffer size {}",
                    self.size
                )));
            }
        }
        let as_usage =
            BufferUsage::ACCELERATION_STRUCTURE | BufferUsage::ACCELERATION_STRUCTURE_STORAGE;
        if self.usage.intersects(as_usage) && !caps.acceleration_structures() {
            return Err(GalError::UnsupportedUsage(format!(
                "{:?} requires ray tracing or ray query support on '{}'",
                self.usage & as_usage,
                caps.device_name
            )));
        }
        if self
            .usage
            .contains(BufferUsage::DYNAMIC | BufferUsage::ACCELERATION_STRUCTURE_STORAGE)
        {
            return Err(GalError::UnsupportedUsage(
                "acceleration structure storage cannot be host-visible".into(),
            ));
        }
        Ok(())
    }
}

/// Linear GPU allocation.
pub struct Buffer {
    base: ResourceBase,
    device: Arc<DeviceShared>,
    handle: NativeHandle,
    desc: BufferDescriptor,
    address: Option<DeviceAddress>,
    state: StateCell,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.base.id())
            .field("name", &self.base.name())
            .field("size", &self.desc.size)
            .field("usage", &self.desc.usage)
            .finish_non_exhaustive()
    }
}

impl Buffer {
    pub(crate) fn new(
        device: Arc<DeviceShared>,
        handle: NativeHandle,
        desc: BufferDescriptor,
        address: Option<DeviceAddress>,
    ) -> Self {
        Self {
            base: ResourceBase::new("buffer", desc.label),
            device,
            handle,
            desc,
            address,
            state: StateCell::new(ResourceState::Common),
        }
    }

    pub fn size(&self) -> u64 {
        self.desc.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.desc.usage
    }

    pub fn stride(&self) -> Option<u64> {
        self.desc.stride
    }

    pub fn descriptor(&self) -> &BufferDescriptor {
        &self.desc
    }

    pub(crate) fn native(&self) -> NativeHandle {
        self.handle
    }

    pub(crate) fn device(&self) -> &Arc<DeviceShared> {
        &self.device
    }

    /// GPU address of the first byte.
    pub fn device_address(&self) -> GalResult<DeviceAddress> {
        self.base.ensure_alive()?;
        self.address.ok_or_else(|| {
            GalError::UnsupportedUsage(format!(
                "buffer {} was not created with a device-address usage",
                self.base.describe()
            ))
        })
    }

    /// Blocking write through the update path.
    pub fn write(&self, offset: u64, data: &[u8]) -> GalResult<()> {
        self.device.write_buffer(self, offset, data)
    }

    /// Blocking readback of `len` bytes.
    pub fn read(&self, offset: u64, len: u64) -> GalResult<Vec<u8>> {
        self.device.read_buffer(self, offset, len)
    }

    pub(crate) fn check_range(&self, offset: u64, len: u64) -> GalResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.desc.size => Ok(()),
            _ => Err(GalError::descriptor(format!(
                "range {offset}+{len} exceeds buffer {} of {} bytes",
                self.base.describe(),
                self.desc.size
            ))),
        }
    }

    pub(crate) fn require_usage(&self, usage: BufferUsage) -> GalResult<()> {
        if !self.desc.usage.intersects(usage) {
            return Err(GalError::UnsupportedUsage(format!(
                "buffer {} lacks {:?} usage (has {:?})",
                self.base.describe(),
                usage,
                self.desc.usage
            )));
        }
        Ok(())
    }
}

impl Resource for Buffer {
    fn base(&self) -> &ResourceBase {
        &self.base
    }

    fn dispose(&self) {
        if self.base.begin_dispose() {
            self.device.wait_for_usage(&self.base);
            self.device.backend().destroy_buffer(self.handle);
        }
    }

    fn set_name(&self, name: &str) {
        self.base.set_name(name);
        self.device
            .backend()
            .set_debug_name(ObjectKind::Buffer, self.handle, name);
    }
}

impl Tracked for Buffer {
    fn state_cell(&self) -> &StateCell {
        &self.state
    }

    fn target(&self) -> TransitionTarget {
        TransitionTarget::Buffer(self.handle)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;

    fn caps(ray_tracing: bool) -> Capabilities {
        let mut config = ContextConfig::default();
        config.headless.ray_tracing = ray_tracing;
        config.headless.ray_query = ray_tracing;
        crate::headless::adapter_info(&config).capabilities
    }

    #[test]
    fn stride_must_divide_size() {
        let desc = BufferDescriptor::new(48, BufferUsage::STORAGE).with_stride(16);
        assert!(desc.validate(&caps(true)).is_ok());
        let desc = BufferDescriptor::new(48, BufferUsage::STORAGE).with_stride(20);
        assert!(matches!(
            desc.validate(&caps(true)),
            Err(GalError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn acceleration_structure_usage_needs_capability() {
        let desc = BufferDescriptor::new(256, BufferUsage::ACCELERATION_STRUCTURE);
        assert!(desc.validate(&caps(true)).is_ok());
        assert!(matches!(
            desc.validate(&caps(false)),
            Err(GalError::UnsupportedUsage(_))
        ));
    }

    #[test]
    fn vertex_buffers_get_addresses_only_with_ray_tracing() {
        let desc = BufferDescriptor::new(48, BufferUsage::VERTEX);
        assert!(desc.needs_device_address(&caps(true)));
        assert!(!desc.needs_device_address(&caps(false)));
        let desc = BufferDescriptor::new(48, BufferUsage::CONSTANT);
        assert!(!desc.needs_device_address(&caps(true)));
    }

    #[test]
    fn zero_size_is_rejected() {
        let desc = BufferDescriptor::new(0, BufferUsage::VERTEX);
        assert!(desc.validate(&caps(true)).is_err());
    }
}
