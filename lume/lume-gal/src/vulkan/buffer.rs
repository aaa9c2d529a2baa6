//! Buffers: one dedicated allocation each, with blocking staged transfers for
//! device-local memory.

use ash::vk;

use crate::backend::{DeviceAddress, NativeHandle};
use crate::buffer::{BufferDescriptor, BufferUsage};
use crate::error::{GalError, GalResult};
use crate::state::ResourceState;

use super::barrier::BarrierBatch;
use super::memory::{self, MemoryLocation};
use super::queue::{destroy_garbage, Garbage};
use super::{vk_error, VulkanBackend};

#[derive(Debug, Clone, Copy)]
pub(super) struct BufferEntry {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: u64,
    pub usage: BufferUsage,
    pub host_visible: bool,
    pub address: Option<DeviceAddress>,
}

impl BufferEntry {
    pub fn range_check(&self, offset: u64, len: u64) -> GalResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(GalError::invalid_state(format!(
                "range {offset}+{len} outside buffer of {} bytes",
                self.size
            ))),
        }
    }
}

pub(super) fn buffer_usage_to_vk(usage: BufferUsage, device_address: bool) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
    let pairs = [
        (BufferUsage::VERTEX, vk::BufferUsageFlags::VERTEX_BUFFER),
        (BufferUsage::INDEX, vk::BufferUsageFlags::INDEX_BUFFER),
        (BufferUsage::CONSTANT, vk::BufferUsageFlags::UNIFORM_BUFFER),
        (BufferUsage::STORAGE, vk::BufferUsageFlags::STORAGE_BUFFER),
        (BufferUsage::INDIRECT, vk::BufferUsageFlags::INDIRECT_BUFFER),
        (
            BufferUsage::ACCELERATION_STRUCTURE,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
        ),
        (
            BufferUsage::ACCELERATION_STRUCTURE_STORAGE,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR,
        ),
    ];
    for (ours, theirs) in pairs {
        if usage.contains(ours) {
            flags |= theirs;
        }
    }
    if device_address {
        flags |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    }
    flags
}

impl VulkanBackend {
    /// Creates and binds a buffer with its own allocation.
    pub(super) fn allocate_buffer(
        &self,
        size: u64,
        flags: vk::BufferUsageFlags,
        location: MemoryLocation,
        what: &str,
    ) -> GalResult<(vk::Buffer, vk::DeviceMemory)> {
        let create_info = vk::BufferCreateInfo::default()
            .size(size.max(1))
            .usage(flags)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&create_info, None) }
            .map_err(|e| vk_error("create_buffer", e))?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let device_address = flags.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS);
        let bound = memory::allocate(
            &self.device,
            &self.memory_properties,
            requirements,
            location,
            device_address,
            what,
        )
        .and_then(|memory| {
            match unsafe { self.device.bind_buffer_memory(buffer, memory, 0) } {
                Ok(()) => Ok(memory),
                Err(e) => {
                    unsafe { self.device.free_memory(memory, None) };
                    Err(vk_error("bind_buffer_memory", e))
                }
            }
        });
        match bound {
            Ok(memory) => Ok((buffer, memory)),
            Err(err) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                Err(err)
            }
        }
    }

    pub(super) fn new_buffer(&self, desc: &BufferDescriptor) -> GalResult<BufferEntry> {
        let acceleration = desc.usage.intersects(
            BufferUsage::ACCELERATION_STRUCTURE | BufferUsage::ACCELERATION_STRUCTURE_STORAGE,
        );
        if acceleration && !self.caps.acceleration_structures() {
            return Err(GalError::UnsupportedUsage(format!(
                "{:?} needs acceleration structure support",
                desc.usage
            )));
        }
        let device_address =
            self.caps.acceleration_structures() && desc.usage.intersects(BufferUsage::DEVICE_ADDRESS);
        let host_visible = desc.usage.contains(BufferUsage::DYNAMIC);
        let location = if host_visible {
            MemoryLocation::HostVisible
        } else {
            MemoryLocation::DeviceLocal
        };
        let what = desc.label.unwrap_or("buffer");
        let (buffer, memory) = self.allocate_buffer(
            desc.size,
            buffer_usage_to_vk(desc.usage, device_address),
            location,
            what,
        )?;
        let address = device_address.then(|| unsafe {
            self.device
                .get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer))
        });
        log::trace!("buffer '{what}' created: {} bytes, {:?}", desc.size, desc.usage);
        Ok(BufferEntry {
            buffer,
            memory,
            size: desc.size,
            usage: desc.usage,
            host_visible,
            address,
        })
    }

    pub(super) fn free_buffer(&self, entry: &BufferEntry) {
        unsafe {
            self.device.destroy_buffer(entry.buffer, None);
            self.device.free_memory(entry.memory, None);
        }
    }

    /// Host-visible transfer buffer holding `data`.
    pub(super) fn staging_buffer(&self, data: &[u8]) -> GalResult<(vk::Buffer, vk::DeviceMemory)> {
        let (buffer, memory) = self.allocate_buffer(
            data.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::HostVisible,
            "staging buffer",
        )?;
        if let Err(err) = memory::write_mapped(&self.device, memory, 0, data) {
            destroy_garbage(&self.device, vec![Garbage::Buffer(buffer, memory)]);
            return Err(err);
        }
        Ok((buffer, memory))
    }

    pub(super) fn buffer_write(
        &self,
        handle: NativeHandle,
        state: ResourceState,
        offset: u64,
        data: &[u8],
    ) -> GalResult<()> {
        let entry = self.buffers.get(handle)?;
        entry.range_check(offset, data.len() as u64)?;
        if data.is_empty() {
            return Ok(());
        }
        if entry.host_visible {
            return memory::write_mapped(&self.device, entry.memory, offset, data);
        }
        let (staging, staging_memory) = self.staging_buffer(data)?;
        let result = self.queues.immediate(&self.device, |cmd, _| {
            self.staged_copy(cmd, entry.buffer, state, ResourceState::CopyDestination, || {
                let region = vk::BufferCopy::default()
                    .src_offset(0)
                    .dst_offset(offset)
                    .size(data.len() as u64);
                unsafe { self.device.cmd_copy_buffer(cmd, staging, entry.buffer, &[region]) };
            });
            Ok(())
        });
        destroy_garbage(&self.device, vec![Garbage::Buffer(staging, staging_memory)]);
        result
    }

    pub(super) fn buffer_read(
        &self,
        handle: NativeHandle,
        state: ResourceState,
        offset: u64,
        out: &mut [u8],
    ) -> GalResult<()> {
        let entry = self.buffers.get(handle)?;
        entry.range_check(offset, out.len() as u64)?;
        if out.is_empty() {
            return Ok(());
        }
        if entry.host_visible {
            return memory::read_mapped(&self.device, entry.memory, offset, out);
        }
        let (staging_buffer, staging_memory) = self.allocate_buffer(
            out.len() as u64,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::HostVisible,
            "readback buffer",
        )?;
        let copied = self.queues.immediate(&self.device, |cmd, _| {
            self.staged_copy(cmd, entry.buffer, state, ResourceState::CopySource, || {
                let region = vk::BufferCopy::default()
                    .src_offset(offset)
                    .dst_offset(0)
                    .size(out.len() as u64);
                unsafe {
                    self.device
                        .cmd_copy_buffer(cmd, entry.buffer, staging_buffer, &[region])
                };
            });
            Ok(())
        });
        let result =
            copied.and_then(|()| memory::read_mapped(&self.device, staging_memory, 0, out));
        destroy_garbage(&self.device, vec![Garbage::Buffer(staging_buffer, staging_memory)]);
        result
    }

    /// Moves `buffer` from `state` into `copy_state`, runs `copy`, and moves it back.
    fn staged_copy(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        state: ResourceState,
        copy_state: ResourceState,
        copy: impl FnOnce(),
    ) {
        let mut before = BarrierBatch::new(self.stage_support);
        before.buffer(buffer, state, copy_state);
        before.record(&self.device, cmd);
        copy();
        let mut after = BarrierBatch::new(self.stage_support);
        after.buffer(buffer, copy_state, state);
        after.record(&self.device, cmd);
    }

    pub(super) fn buffer_address(&self, handle: NativeHandle) -> GalResult<DeviceAddress> {
        self.buffers.with(handle, |entry| entry.address)?.ok_or_else(|| {
            GalError::UnsupportedUsage(
                "buffer has no device address; it needs an addressable usage on a device with acceleration structures".into(),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_buffer_is_a_transfer_endpoint() {
        let flags = buffer_usage_to_vk(BufferUsage::VERTEX, false);
        assert!(flags.contains(vk::BufferUsageFlags::VERTEX_BUFFER));
        assert!(flags.contains(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST));
        assert!(!flags.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
    }

    #[test]
    fn acceleration_usages_map_to_their_khr_flags() {
        let flags = buffer_usage_to_vk(
            BufferUsage::ACCELERATION_STRUCTURE | BufferUsage::ACCELERATION_STRUCTURE_STORAGE,
            true,
        );
        assert!(flags.contains(vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR));
        assert!(flags.contains(vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR));
        assert!(flags.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
    }

    #[test]
    fn ranges_past_the_end_are_rejected() {
        let entry = BufferEntry {
            buffer: vk::Buffer::null(),
            memory: vk::DeviceMemory::null(),
            size: 48,
            usage: BufferUsage::VERTEX,
            host_visible: false,
            address: None,
        };
        assert!(entry.range_check(0, 48).is_ok());
        assert!(entry.range_check(40, 16).is_err());
        assert!(entry.range_check(u64::MAX, 2).is_err());
    }
}
