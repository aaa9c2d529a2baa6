//! Device memory: memory type selection and dedicated allocations.

use ash::vk;

use crate::error::{GalError, GalResult};

use super::vk_error;

/// Where an allocation must live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum MemoryLocation {
    DeviceLocal,
    /// Host-visible and coherent; mapped for every CPU access.
    HostVisible,
}

/// First memory type allowed by `type_bits` that has the properties `location` needs.
/// Device-local requests fall back to any allowed type on devices without a
/// dedicated heap.
pub(super) fn memory_type_index(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    location: MemoryLocation,
) -> Option<u32> {
    let wanted = match location {
        MemoryLocation::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
        MemoryLocation::HostVisible => {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        }
    };
    let allowed = |i: &u32| type_bits & (1 << i) != 0;
    (0..props.memory_type_count)
        .filter(allowed)
        .find(|i| props.memory_types[*i as usize].property_flags.contains(wanted))
        .or_else(|| match location {
            MemoryLocation::DeviceLocal => (0..props.memory_type_count).find(allowed),
            MemoryLocation::HostVisible => None,
        })
}

/// One dedicated allocation sized by `requirements`.
pub(super) fn allocate(
    device: &ash::Device,
    props: &vk::PhysicalDeviceMemoryProperties,
    requirements: vk::MemoryRequirements,
    location: MemoryLocation,
    device_address: bool,
    what: &str,
) -> GalResult<vk::DeviceMemory> {
    let memory_type_index = memory_type_index(props, requirements.memory_type_bits, location)
        .ok_or_else(|| GalError::oom(format!("{what} ({location:?} memory)"), requirements.size))?;
    let mut flags =
        vk::MemoryAllocateFlagsInfo::default().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
    let mut allocate_info = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);
    if device_address {
        allocate_info = allocate_info.push_next(&mut flags);
    }
    unsafe { device.allocate_memory(&allocate_info, None) }.map_err(|e| match e {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            GalError::oom(what, requirements.size)
        }
        other => vk_error("allocate_memory", other),
    })
}

/// Copies `data` into host-visible memory at `offset`.
pub(super) fn write_mapped(
    device: &ash::Device,
    memory: vk::DeviceMemory,
    offset: u64,
    data: &[u8],
) -> GalResult<()> {
    if data.is_empty() {
        return Ok(());
    }
    unsafe {
        let ptr = device
            .map_memory(memory, offset, data.len() as u64, vk::MemoryMapFlags::empty())
            .map_err(|e| vk_error("map_memory", e))?;
        std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.cast::<u8>(), data.len());
        device.unmap_memory(memory);
    }
    Ok(())
}

/// Copies host-visible memory at `offset` into `out`.
pub(super) fn read_mapped(
    device: &ash::Device,
    memory: vk::DeviceMemory,
    offset: u64,
    out: &mut [u8],
) -> GalResult<()> {
    if out.is_empty() {
        return Ok(());
    }
    unsafe {
        let ptr = device
            .map_memory(memory, offset, out.len() as u64, vk::MemoryMapFlags::empty())
            .map_err(|e| vk_error("map_memory", e))?;
        std::ptr::copy_nonoverlapping(ptr.cast::<u8>(), out.as_mut_ptr(), out.len());
        device.unmap_memory(memory);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (i, &flags) in types.iter().enumerate() {
            props.memory_types[i].property_flags = flags;
        }
        props
    }

    #[test]
    fn host_visible_requests_need_coherent_memory() {
        let props = properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);
        assert_eq!(
            memory_type_index(&props, 0b111, MemoryLocation::HostVisible),
            Some(2)
        );
        assert_eq!(memory_type_index(&props, 0b011, MemoryLocation::HostVisible), None);
    }

    #[test]
    fn device_local_falls_back_to_any_allowed_type() {
        let props = properties(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        assert_eq!(
            memory_type_index(&props, 0b11, MemoryLocation::DeviceLocal),
            Some(1)
        );
        assert_eq!(
            memory_type_index(&props, 0b01, MemoryLocation::DeviceLocal),
            Some(0)
        );
    }
}
