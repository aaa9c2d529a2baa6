//! Images, their default and attachment views, uploads and mip generation.

use ash::vk;

use crate::backend::NativeHandle;
use crate::error::{GalError, GalResult};
use crate::format::TextureFormat;
use crate::state::ResourceState;
use crate::texture::{
    TextureDescriptor, TextureDimension, TextureRegion, TextureUsage, TextureViewDescriptor,
    TextureViewDimension,
};

use super::barrier::{aspect_to_vk, whole_range, BarrierBatch};
use super::memory::{self, MemoryLocation};
use super::queue::{destroy_garbage, Garbage};
use super::{vk_error, VulkanBackend};

#[derive(Debug, Clone)]
pub(super) struct TextureEntry {
    pub image: vk::Image,
    /// `None` for swapchain images, which the swapchain owns.
    pub memory: Option<vk::DeviceMemory>,
    /// Every mip and layer; what a texture bound directly to a set reads.
    pub view: vk::ImageView,
    /// Mip 0, layer 0 with every aspect, for render passes.
    pub attachment: Option<vk::ImageView>,
    pub desc: TextureDescriptor,
}

impl TextureEntry {
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        aspect_to_vk(self.desc.format.aspect())
    }

    pub fn subresource(&self, mip: u32, layer: u32, layers: u32) -> vk::ImageSubresourceLayers {
        vk::ImageSubresourceLayers::default()
            .aspect_mask(copy_aspect(self.desc.format))
            .mip_level(mip)
            .base_array_layer(layer)
            .layer_count(layers)
    }
}

#[derive(Debug, Clone, Copy)]
pub(super) struct ViewEntry {
    pub view: vk::ImageView,
    pub texture: NativeHandle,
}

pub(super) fn texture_format_to_vk(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::R8Unorm => vk::Format::R8_UNORM,
        TextureFormat::Rg8Unorm => vk::Format::R8G8_UNORM,
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Rgba8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
        TextureFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        TextureFormat::Bgra8UnormSrgb => vk::Format::B8G8R8A8_SRGB,
        TextureFormat::R16Float => vk::Format::R16_SFLOAT,
        TextureFormat::Rg16Float => vk::Format::R16G16_SFLOAT,
        TextureFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        TextureFormat::R32Uint => vk::Format::R32_UINT,
        TextureFormat::R32Float => vk::Format::R32_SFLOAT,
        TextureFormat::Rg32Float => vk::Format::R32G32_SFLOAT,
        TextureFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        TextureFormat::D32Float => vk::Format::D32_SFLOAT,
        TextureFormat::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
        TextureFormat::D32FloatS8Uint => vk::Format::D32_SFLOAT_S8_UINT,
    }
}

/// Inverse of [`texture_format_to_vk`] for the color formats a surface may offer.
pub(super) fn texture_format_from_vk(format: vk::Format) -> Option<TextureFormat> {
    Some(match format {
        vk::Format::R8G8B8A8_UNORM => TextureFormat::Rgba8Unorm,
        vk::Format::R8G8B8A8_SRGB => TextureFormat::Rgba8UnormSrgb,
        vk::Format::B8G8R8A8_UNORM => TextureFormat::Bgra8Unorm,
        vk::Format::B8G8R8A8_SRGB => TextureFormat::Bgra8UnormSrgb,
        vk::Format::R16G16B16A16_SFLOAT => TextureFormat::Rgba16Float,
        _ => return None,
    })
}

pub(super) fn texture_usage_to_vk(usage: TextureUsage, format: TextureFormat) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
    if usage.contains(TextureUsage::SAMPLED) {
        flags |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(TextureUsage::STORAGE) {
        flags |= vk::ImageUsageFlags::STORAGE;
    }
    if usage.intersects(TextureUsage::RENDER_TARGET | TextureUsage::DEPTH_STENCIL) {
        if format.is_depth() {
            flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        } else {
            flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
    }
    flags
}

pub(super) fn sample_count_to_vk(samples: u32) -> vk::SampleCountFlags {
    match samples {
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        16 => vk::SampleCountFlags::TYPE_16,
        32 => vk::SampleCountFlags::TYPE_32,
        64 => vk::SampleCountFlags::TYPE_64,
        _ => vk::SampleCountFlags::TYPE_1,
    }
}

fn image_type(dimension: TextureDimension) -> vk::ImageType {
    match dimension {
        TextureDimension::D1 => vk::ImageType::TYPE_1D,
        TextureDimension::D2 => vk::ImageType::TYPE_2D,
        TextureDimension::D3 => vk::ImageType::TYPE_3D,
    }
}

pub(super) fn view_type(dimension: TextureViewDimension) -> vk::ImageViewType {
    match dimension {
        TextureViewDimension::D1 => vk::ImageViewType::TYPE_1D,
        TextureViewDimension::D2 => vk::ImageViewType::TYPE_2D,
        TextureViewDimension::D2Array => vk::ImageViewType::TYPE_2D_ARRAY,
        TextureViewDimension::Cube => vk::ImageViewType::CUBE,
        TextureViewDimension::CubeArray => vk::ImageViewType::CUBE_ARRAY,
        TextureViewDimension::D3 => vk::ImageViewType::TYPE_3D,
    }
}

/// Aspect read through shader views. Depth-stencil textures are sampled as depth.
fn sampled_aspect(format: TextureFormat) -> vk::ImageAspectFlags {
    if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Copies address one aspect at a time; texel data of depth formats is depth.
fn copy_aspect(format: TextureFormat) -> vk::ImageAspectFlags {
    sampled_aspect(format)
}

fn offset_3d(origin: [u32; 3]) -> vk::Offset3D {
    vk::Offset3D {
        x: origin[0] as i32,
        y: origin[1] as i32,
        z: origin[2] as i32,
    }
}

pub(super) fn extent_3d(extent: [u32; 3]) -> vk::Extent3D {
    vk::Extent3D {
        width: extent[0],
        height: extent[1],
        depth: extent[2],
    }
}

/// Buffer/image copy of one region of tightly packed texels at `offset`.
pub(super) fn buffer_image_copy(
    entry: &TextureEntry,
    region: &TextureRegion,
    offset: u64,
) -> vk::BufferImageCopy {
    vk::BufferImageCopy::default()
        .buffer_offset(offset)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(entry.subresource(region.mip_level, region.array_layer, 1))
        .image_offset(offset_3d(region.origin))
        .image_extent(extent_3d(region.extent))
}

pub(super) fn image_copy(
    src: &TextureEntry,
    src_region: &TextureRegion,
    dst: &TextureEntry,
    dst_region: &TextureRegion,
) -> vk::ImageCopy {
    vk::ImageCopy::default()
        .src_subresource(src.subresource(src_region.mip_level, src_region.array_layer, 1))
        .src_offset(offset_3d(src_region.origin))
        .dst_subresource(dst.subresource(dst_region.mip_level, dst_region.array_layer, 1))
        .dst_offset(offset_3d(dst_region.origin))
        .extent(extent_3d(src_region.extent))
}

fn mip_range(aspect: vk::ImageAspectFlags, base: u32, count: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(aspect)
        .base_mip_level(base)
        .level_count(count)
        .base_array_layer(0)
        .layer_count(vk::REMAINING_ARRAY_LAYERS)
}

/// State uploads and mip generation leave a texture in.
fn settled_state(usage: TextureUsage) -> ResourceState {
    if usage.contains(TextureUsage::SAMPLED) {
        ResourceState::ShaderRead
    } else {
        ResourceState::CopyDestination
    }
}

impl VulkanBackend {
    pub(super) fn new_texture(&self, desc: &TextureDescriptor) -> GalResult<TextureEntry> {
        let format = texture_format_to_vk(desc.format);
        let usage = texture_usage_to_vk(desc.usage, desc.format);
        let ty = image_type(desc.dimension);
        let mut flags = vk::ImageCreateFlags::empty();
        if desc.usage.contains(TextureUsage::CUBEMAP) {
            flags |= vk::ImageCreateFlags::CUBE_COMPATIBLE;
        }
        let supported = unsafe {
            self.instance.raw().get_physical_device_image_format_properties(
                self.adapter.physical,
                format,
                ty,
                vk::ImageTiling::OPTIMAL,
                usage,
                flags,
            )
        };
        match supported {
            Ok(_) => {}
            Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED) => {
                return Err(GalError::UnsupportedUsage(format!(
                    "{:?} with usage {:?} is not supported on '{}'",
                    desc.format, desc.usage, self.caps.device_name
                )))
            }
            Err(e) => return Err(vk_error("get_physical_device_image_format_properties", e)),
        }

        let create_info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(ty)
            .format(format)
            .extent(extent_3d([desc.width, desc.height, desc.depth]))
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(sample_count_to_vk(desc.sample_count))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&create_info, None) }
            .map_err(|e| vk_error("create_image", e))?;
        let what = desc.label.unwrap_or("texture");
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let memory = memory::allocate(
            &self.device,
            &self.memory_properties,
            requirements,
            MemoryLocation::DeviceLocal,
            false,
            what,
        )
        .and_then(|memory| match unsafe { self.device.bind_image_memory(image, memory, 0) } {
            Ok(()) => Ok(memory),
            Err(e) => {
                unsafe { self.device.free_memory(memory, None) };
                Err(vk_error("bind_image_memory", e))
            }
        });
        let memory = match memory {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(err);
            }
        };
        let entry = self.wrap_image(image, Some(memory), desc.clone());
        if entry.is_ok() {
            log::trace!(
                "texture '{what}' created: {}x{}x{} {:?}, {} mips",
                desc.width,
                desc.height,
                desc.depth,
                desc.format,
                desc.mip_levels
            );
        }
        entry
    }

    /// Creates the default views of `image`. On failure the image (and `memory`)
    /// are destroyed unless the image is swapchain-owned.
    pub(super) fn wrap_image(
        &self,
        image: vk::Image,
        memory: Option<vk::DeviceMemory>,
        desc: TextureDescriptor,
    ) -> GalResult<TextureEntry> {
        let mut entry = TextureEntry {
            image,
            memory,
            view: vk::ImageView::null(),
            attachment: None,
            desc,
        };
        let built = (|| -> GalResult<()> {
            let full = TextureViewDescriptor::default().resolve(&entry.desc)?;
            entry.view = self.image_view(&entry, &full, sampled_aspect(entry.desc.format))?;
            let attachment = TextureUsage::RENDER_TARGET | TextureUsage::DEPTH_STENCIL;
            if entry.desc.usage.intersects(attachment)
                && entry.desc.dimension == TextureDimension::D2
            {
                let single = TextureViewDescriptor {
                    mip_level_count: Some(1),
                    array_layer_count: Some(1),
                    dimension: Some(TextureViewDimension::D2),
                    ..Default::default()
                };
                entry.attachment = Some(self.image_view(&entry, &single, entry.aspect())?);
            }
            Ok(())
        })();
        match built {
            Ok(()) => Ok(entry),
            Err(err) => {
                self.free_texture(&entry);
                Err(err)
            }
        }
    }

    fn image_view(
        &self,
        entry: &TextureEntry,
        desc: &TextureViewDescriptor,
        aspect: vk::ImageAspectFlags,
    ) -> GalResult<vk::ImageView> {
        let dimension = desc.dimension.unwrap_or(TextureViewDimension::D2);
        let create_info = vk::ImageViewCreateInfo::default()
            .image(entry.image)
            .view_type(view_type(dimension))
            .format(texture_format_to_vk(entry.desc.format))
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect)
                    .base_mip_level(desc.base_mip_level)
                    .level_count(desc.mip_level_count.unwrap_or(1))
                    .base_array_layer(desc.base_array_layer)
                    .layer_count(desc.array_layer_count.unwrap_or(1)),
            );
        unsafe { self.device.create_image_view(&create_info, None) }
            .map_err(|e| vk_error("create_image_view", e))
    }

    pub(super) fn free_texture(&self, entry: &TextureEntry) {
        unsafe {
            if let Some(attachment) = entry.attachment {
                self.device.destroy_image_view(attachment, None);
            }
            if entry.view != vk::ImageView::null() {
                self.device.destroy_image_view(entry.view, None);
            }
            // Swapchain images are released with their swapchain.
            if let Some(memory) = entry.memory {
                self.device.destroy_image(entry.image, None);
                self.device.free_memory(memory, None);
            }
        }
    }

    pub(super) fn new_view(
        &self,
        texture: NativeHandle,
        desc: &TextureViewDescriptor,
    ) -> GalResult<ViewEntry> {
        let entry = self.textures.get(texture)?;
        let view = self.image_view(&entry, desc, sampled_aspect(entry.desc.format))?;
        Ok(ViewEntry { view, texture })
    }

    pub(super) fn texture_upload(
        &self,
        texture: NativeHandle,
        state: ResourceState,
        region: &TextureRegion,
        data: &[u8],
    ) -> GalResult<ResourceState> {
        let entry = self.textures.get(texture)?;
        let expected = region.data_size(entry.desc.format);
        if data.len() as u64 != expected {
            return Err(GalError::descriptor(format!(
                "upload of {} bytes into a region of {expected} bytes",
                data.len()
            )));
        }
        let settled = settled_state(entry.desc.usage);
        let range = whole_range(entry.aspect());
        let (staging, staging_memory) = self.staging_buffer(data)?;
        let result = self.queues.immediate(&self.device, |cmd, _| {
            let mut before = BarrierBatch::new(self.stage_support);
            before.image(entry.image, range, state, ResourceState::CopyDestination);
            before.record(&self.device, cmd);
            let copy = buffer_image_copy(&entry, region, 0);
            unsafe {
                self.device.cmd_copy_buffer_to_image(
                    cmd,
                    staging,
                    entry.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[copy],
                )
            };
            let mut after = BarrierBatch::new(self.stage_support);
            after.image(entry.image, range, ResourceState::CopyDestination, settled);
            after.record(&self.device, cmd);
            Ok(())
        });
        destroy_garbage(&self.device, vec![Garbage::Buffer(staging, staging_memory)]);
        result.map(|()| settled)
    }

    /// Blits each mip from the one above it with linear filtering.
    pub(super) fn texture_mipmaps(
        &self,
        texture: NativeHandle,
        state: ResourceState,
    ) -> GalResult<ResourceState> {
        let entry = self.textures.get(texture)?;
        let desc = &entry.desc;
        let features = unsafe {
            self.instance.raw().get_physical_device_format_properties(
                self.adapter.physical,
                texture_format_to_vk(desc.format),
            )
        }
        .optimal_tiling_features;
        let needed = vk::FormatFeatureFlags::BLIT_SRC
            | vk::FormatFeatureFlags::BLIT_DST
            | vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR;
        if !features.contains(needed) {
            return Err(GalError::UnsupportedUsage(format!(
                "{:?} cannot be blitted with linear filtering on '{}'",
                desc.format, self.caps.device_name
            )));
        }
        let settled = settled_state(desc.usage);
        let aspect = entry.aspect();
        let mips = desc.mip_levels;
        self.queues.immediate(&self.device, |cmd, _| {
            let mut start = BarrierBatch::new(self.stage_support);
            start.image(entry.image, whole_range(aspect), state, ResourceState::CopyDestination);
            start.record(&self.device, cmd);
            for mip in 1..mips {
                let mut source = BarrierBatch::new(self.stage_support);
                source.image(
                    entry.image,
                    mip_range(aspect, mip - 1, 1),
                    ResourceState::CopyDestination,
                    ResourceState::CopySource,
                );
                source.record(&self.device, cmd);
                let [sw, sh, sd] = desc.mip_extent(mip - 1);
                let [dw, dh, dd] = desc.mip_extent(mip);
                let blit = vk::ImageBlit::default()
                    .src_subresource(entry.subresource(mip - 1, 0, desc.array_layers))
                    .src_offsets([
                        vk::Offset3D::default(),
                        offset_3d([sw, sh, sd]),
                    ])
                    .dst_subresource(entry.subresource(mip, 0, desc.array_layers))
                    .dst_offsets([vk::Offset3D::default(), offset_3d([dw, dh, dd])]);
                unsafe {
                    self.device.cmd_blit_image(
                        cmd,
                        entry.image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        entry.image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[blit],
                        vk::Filter::LINEAR,
                    )
                };
            }
            let mut end = BarrierBatch::new(self.stage_support);
            if mips > 1 {
                end.image(
                    entry.image,
                    mip_range(aspect, 0, mips - 1),
                    ResourceState::CopySource,
                    settled,
                );
            }
            end.image(
                entry.image,
                mip_range(aspect, mips - 1, 1),
                ResourceState::CopyDestination,
                settled,
            );
            end.record(&self.device, cmd);
            Ok(())
        })?;
        log::trace!("generated {mips} mips for {:?}", desc.label);
        Ok(settled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_formats_become_depth_attachments() {
        let flags = texture_usage_to_vk(TextureUsage::DEPTH_STENCIL, TextureFormat::D32Float);
        assert!(flags.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT));
        assert!(!flags.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));
        let flags = texture_usage_to_vk(
            TextureUsage::RENDER_TARGET | TextureUsage::SAMPLED,
            TextureFormat::Rgba16Float,
        );
        assert!(flags.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED));
    }

    #[test]
    fn surface_formats_round_trip_where_known() {
        for format in [
            TextureFormat::Bgra8Unorm,
            TextureFormat::Bgra8UnormSrgb,
            TextureFormat::Rgba8Unorm,
        ] {
            assert_eq!(texture_format_from_vk(texture_format_to_vk(format)), Some(format));
        }
        assert_eq!(texture_format_from_vk(vk::Format::A2B10G10R10_UNORM_PACK32), None);
    }

    #[test]
    fn depth_stencil_is_sampled_through_depth() {
        assert_eq!(
            sampled_aspect(TextureFormat::D24UnormS8Uint),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(sampled_aspect(TextureFormat::R8Unorm), vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn uploads_settle_where_shaders_can_read() {
        assert_eq!(settled_state(TextureUsage::SAMPLED), ResourceState::ShaderRead);
        assert_eq!(settled_state(TextureUsage::STORAGE), ResourceState::CopyDestination);
        assert_eq!(sample_count_to_vk(4), vk::SampleCountFlags::TYPE_4);
    }
}
