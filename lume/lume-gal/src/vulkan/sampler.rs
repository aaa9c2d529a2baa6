//! Vulkan sampler creation.

use ash::vk;

use crate::error::GalResult;
use crate::sampler::{AddressMode, FilterMode, SamplerDescriptor};

use super::pipeline::compare_op_to_vk;
use super::{vk_error, VulkanBackend};

fn filter_to_vk(f: FilterMode) -> vk::Filter {
    match f {
        FilterMode::Nearest => vk::Filter::NEAREST,
        FilterMode::Linear => vk::Filter::LINEAR,
    }
}

fn mipmap_mode_to_vk(f: FilterMode) -> vk::SamplerMipmapMode {
    match f {
        FilterMode::Nearest => vk::SamplerMipmapMode::NEAREST,
        FilterMode::Linear => vk::SamplerMipmapMode::LINEAR,
    }
}

fn address_mode_to_vk(a: AddressMode) -> vk::SamplerAddressMode {
    match a {
        AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        AddressMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        AddressMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
    }
}

impl VulkanBackend {
    pub(super) fn new_sampler(&self, desc: &SamplerDescriptor) -> GalResult<vk::Sampler> {
        // Anisotropy is a device feature; without it the clamp is ignored.
        let anisotropy = desc
            .anisotropy_clamp
            .filter(|_| self.adapter.limits.sampler_anisotropy)
            .map(|c| c.clamp(1.0, self.adapter.limits.max_sampler_anisotropy.max(1.0)));
        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(filter_to_vk(desc.mag_filter))
            .min_filter(filter_to_vk(desc.min_filter))
            .mipmap_mode(mipmap_mode_to_vk(desc.mipmap_filter))
            .address_mode_u(address_mode_to_vk(desc.address_mode_u))
            .address_mode_v(address_mode_to_vk(desc.address_mode_v))
            .address_mode_w(address_mode_to_vk(desc.address_mode_w))
            .min_lod(desc.lod_min_clamp)
            .max_lod(desc.lod_max_clamp)
            .anisotropy_enable(anisotropy.is_some())
            .max_anisotropy(anisotropy.unwrap_or(1.0))
            .compare_enable(desc.compare.is_some())
            .compare_op(desc.compare.map_or(vk::CompareOp::ALWAYS, compare_op_to_vk))
            .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK)
            .unnormalized_coordinates(false);
        unsafe { self.device.create_sampler(&create_info, None) }
            .map_err(|e| vk_error("create_sampler", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_map_one_to_one() {
        assert_eq!(filter_to_vk(FilterMode::Linear), vk::Filter::LINEAR);
        assert_eq!(
            mipmap_mode_to_vk(FilterMode::Nearest),
            vk::SamplerMipmapMode::NEAREST
        );
        assert_eq!(
            address_mode_to_vk(AddressMode::ClampToBorder),
            vk::SamplerAddressMode::CLAMP_TO_BORDER
        );
    }
}
