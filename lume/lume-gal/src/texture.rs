//! Textures, texture views and their descriptors.

use std::sync::Arc;

use crate::backend::{NativeHandle, ObjectKind};
use crate::context::Capabilities;
use crate::device::DeviceShared;
use crate::error::{GalError, GalResult};
use crate::format::TextureFormat;
use crate::resource::{Resource, ResourceBase};
use crate::state::{ResourceState, StateCell, Tracked, TransitionTarget};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct TextureUsage: u32 {
        const SAMPLED = 1 << 0;
        const STORAGE = 1 << 1;
        const RENDER_TARGET = 1 << 2;
        const DEPTH_STENCIL = 1 << 3;
        /// Array layers are grouped into cube faces (6 per cube).
        const CUBEMAP = 1 << 4;
        const GENERATE_MIPMAPS = 1 << 5;
        const COPY_SRC = 1 << 6;
        const COPY_DST = 1 << 7;
    }
}

/// Texture dimension / type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureDimension {
    D1,
    #[default]
    D2,
    D3,
}

#[derive(Debug, Clone)]
pub struct TextureDescriptor {
    pub label: Option<&'static str>,
    pub width: u32,
    pub height: u32,
    /// Depth of a 3D texture; 1 otherwise.
    pub depth: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
    pub dimension: TextureDimension,
    pub sample_count: u32,
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            width: 1,
            height: 1,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::SAMPLED,
            dimension: TextureDimension::D2,
            sample_count: 1,
        }
    }
}

impl TextureDescriptor {
    /// Single-sample 2D texture with one mip and one layer.
    pub fn new_2d(width: u32, height: u32, format: TextureFormat, usage: TextureUsage) -> Self {
        Self {
            width,
            height,
            format,
            usage,
            ..Default::default()
        }
    }

    /// Number of mips in a full chain down to 1x1.
    pub fn full_mip_chain(&self) -> u32 {
        32 - self.width.max(self.height).max(self.depth).max(1).leading_zeros()
    }

    /// Extent of `mip`, clamped to 1.
    pub fn mip_extent(&self, mip: u32) -> [u32; 3] {
        [
            (self.width >> mip).max(1),
            (self.height >> mip).max(1),
            (self.depth >> mip).max(1),
        ]
    }

    /// Bytes of tightly packed texels in one layer of `mip`.
    pub fn mip_size(&self, mip: u32) -> u64 {
        let [w, h, d] = self.mip_extent(mip);
        w as u64 * h as u64 * d as u64 * self.format.bytes_per_texel() as u64
    }

    pub(crate) fn validate(&self, caps: &Capabilities) -> GalResult<()> {
        if self.width == 0 || self.height == 0 || self.depth == 0 {
            return Err(GalError::descriptor(format!(
                "texture extent {}x{}x{} has a zero dimension",
                self.width, self.height, self.depth
            )));
        }
        if self.width.max(self.height) > caps.max_texture_dimension_2d {
            return Err(GalError::UnsupportedUsage(format!(
                "texture extent {}x{} exceeds device limit {}",
                self.width, self.height, caps.max_texture_dimension_2d
            )));
        }
        if self.mip_levels == 0 || self.mip_levels > self.full_mip_chain() {
            return Err(GalError::descriptor(format!(
                "{} mip levels requested, chain allows 1..={}",
                self.mip_levels,
                self.full_mip_chain()
            )));
        }
        if self.array_layers == 0 {
            return Err(GalError::descriptor("texture needs at least one array layer"));
        }
        if self.dimension == TextureDimension::D3 && self.array_layers > 1 {
            return Err(GalError::descriptor("3D textures cannot have array layers"));
        }
        if self.dimension != TextureDimension::D3 && self.depth != 1 {
            return Err(GalError::descriptor("only 3D textures have depth"));
        }
        if self.dimension == TextureDimension::D1 && self.height != 1 {
            return Err(GalError::descriptor("1D textures have height 1"));
        }
        self.validate_samples(caps)?;
        self.validate_usage(caps)
    }

    fn validate_samples(&self, caps: &Capabilities) -> GalResult<()> {
        let samples = self.sample_count;
        if samples == 0 || !samples.is_power_of_two() || samples > caps.max_sample_count {
            return Err(GalError::UnsupportedUsage(format!(
                "sample count {samples} not supported (max {})",
                caps.max_sample_count
            )));
        }
        if samples > 1 {
            if self.mip_levels != 1 || self.dimension != TextureDimension::D2 {
                return Err(GalError::descriptor(
                    "multisampled textures must be 2D with a single mip",
                ));
            }
            if self.usage.contains(TextureUsage::STORAGE) {
                return Err(GalError::UnsupportedUsage(
                    "multisampled storage textures are not supported".into(),
                ));
            }
        }
        Ok(())
    }

    fn validate_usage(&self, caps: &Capabilities) -> GalResult<()> {
        let usage = self.usage;
        if usage.is_empty() {
            return Err(GalError::descriptor("texture usage must not be empty"));
        }
        if usage.contains(TextureUsage::RENDER_TARGET | TextureUsage::DEPTH_STENCIL) {
            return Err(GalError::descriptor(
                "RENDER_TARGET and DEPTH_STENCIL are mutually exclusive",
            ));
        }
        let attachment = TextureUsage::RENDER_TARGET | TextureUsage::DEPTH_STENCIL;
        if usage.intersects(attachment)
            && usage.contains(TextureUsage::STORAGE)
            && !caps.storage_render_target
        {
            return Err(GalError::UnsupportedUsage(format!(
                "{:?} cannot be combined with STORAGE on '{}'",
                usage & attachment,
                caps.device_name
            )));
        }
        if usage.contains(TextureUsage::DEPTH_STENCIL) != self.format.is_depth()
            && (usage.contains(TextureUsage::DEPTH_STENCIL)
                || usage.contains(TextureUsage::RENDER_TARGET))
        {
            return Err(GalError::descriptor(format!(
                "format {:?} does not match attachment usage {:?}",
                self.format, usage
            )));
        }
        if usage.contains(TextureUsage::STORAGE) && (self.format.is_srgb() || self.format.is_depth())
        {
            return Err(GalError::UnsupportedUsage(format!(
                "format {:?} cannot be used as a storage texture",
                self.format
            )));
        }
        if usage.contains(TextureUsage::CUBEMAP)
            && (self.dimension != TextureDimension::D2
                || self.width != self.height
                || self.array_layers % 6 != 0)
        {
            return Err(GalError::descriptor(
                "cubemaps must be square 2D textures with a multiple of 6 layers",
            ));
        }
        if usage.contains(TextureUsage::GENERATE_MIPMAPS)
            && (self.mip_levels < 2 || self.format.is_depth())
        {
            return Err(GalError::descriptor(
                "GENERATE_MIPMAPS needs a color format and more than one mip",
            ));
        }
        Ok(())
    }
}

/// Sub-range of a texture addressed by copies and uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureRegion {
    pub mip_level: u32,
    pub array_layer: u32,
    pub origin: [u32; 3],
    pub extent: [u32; 3],
}

impl TextureRegion {
    /// The whole of `mip` in `layer`.
    pub fn whole(desc: &TextureDescriptor, mip_level: u32, array_layer: u32) -> Self {
        Self {
            mip_level,
            array_layer,
            origin: [0; 3],
            extent: desc.mip_extent(mip_level),
        }
    }

    /// Bytes of tightly packed texels covering the region.
    pub fn data_size(&self, format: TextureFormat) -> u64 {
        self.extent.iter().map(|&e| e as u64).product::<u64>() * format.bytes_per_texel() as u64
    }

    pub(crate) fn validate(&self, desc: &TextureDescriptor) -> GalResult<()> {
        if self.mip_level >= desc.mip_levels || self.array_layer >= desc.array_layers {
            return Err(GalError::descriptor(format!(
                "region mip {} layer {} outside texture with {} mips and {} layers",
                self.mip_level, self.array_layer, desc.mip_levels, desc.array_layers
            )));
        }
        let limit = desc.mip_extent(self.mip_level);
        for axis in 0..3 {
            if self.extent[axis] == 0 || self.origin[axis] + self.extent[axis] > limit[axis] {
                return Err(GalError::descriptor(format!(
                    "region {:?}+{:?} outside mip extent {:?}",
                    self.origin, self.extent, limit
                )));
            }
        }
        Ok(())
    }
}

/// Multi-dimensional GPU image.
pub struct Texture {
    base: ResourceBase,
    device: Arc<DeviceShared>,
    handle: NativeHandle,
    desc: TextureDescriptor,
    state: StateCell,
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("id", &self.base.id())
            .field("name", &self.base.name())
            .field("extent", &(self.desc.width, self.desc.height, self.desc.depth))
            .field("format", &self.desc.format)
            .finish_non_exhaustive()
    }
}

impl Texture {
    pub(crate) fn new(
        device: Arc<DeviceShared>,
        handle: NativeHandle,
        desc: TextureDescriptor,
        initial: ResourceState,
    ) -> Self {
        Self {
            base: ResourceBase::new("texture", desc.label),
            device,
            handle,
            desc,
            state: StateCell::new(initial),
        }
    }

    pub fn descriptor(&self) -> &TextureDescriptor {
        &self.desc
    }

    pub fn format(&self) -> TextureFormat {
        self.desc.format
    }

    pub fn usage(&self) -> TextureUsage {
        self.desc.usage
    }

    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn sample_count(&self) -> u32 {
        self.desc.sample_count
    }

    pub fn mip_levels(&self) -> u32 {
        self.desc.mip_levels
    }

    pub(crate) fn native(&self) -> NativeHandle {
        self.handle
    }

    pub(crate) fn device(&self) -> &Arc<DeviceShared> {
        &self.device
    }

    pub(crate) fn require_usage(&self, usage: TextureUsage) -> GalResult<()> {
        if !self.desc.usage.intersects(usage) {
            return Err(GalError::UnsupportedUsage(format!(
                "texture {} lacks {:?} usage (has {:?})",
                self.base.describe(),
                usage,
                self.desc.usage
            )));
        }
        Ok(())
    }
}

impl Resource for Texture {
    fn base(&self) -> &ResourceBase {
        &self.base
    }

    fn dispose(&self) {
        if self.base.begin_dispose() {
            self.device.wait_for_usage(&self.base);
            self.device.backend().destroy_texture(self.handle);
        }
    }

    fn set_name(&self, name: &str) {
        self.base.set_name(name);
        self.device
            .backend()
            .set_debug_name(ObjectKind::Texture, self.handle, name);
    }
}

impl Tracked for Texture {
    fn state_cell(&self) -> &StateCell {
        &self.state
    }

    fn target(&self) -> TransitionTarget {
        TransitionTarget::Texture {
            handle: self.handle,
            aspect: self.desc.format.aspect(),
        }
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// How a view interprets its layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureViewDimension {
    D1,
    D2,
    D2Array,
    Cube,
    CubeArray,
    D3,
}

/// Sub-range of a texture. `None` counts extend to the end of the texture.
#[derive(Debug, Clone, Default)]
pub struct TextureViewDescriptor {
    pub label: Option<&'static str>,
    pub base_mip_level: u32,
    pub mip_level_count: Option<u32>,
    pub base_array_layer: u32,
    pub array_layer_count: Option<u32>,
    /// `None` derives the dimension from the texture.
    pub dimension: Option<TextureViewDimension>,
}

impl TextureViewDescriptor {
    /// Fills in defaulted counts and dimension against `desc`.
    pub(crate) fn resolve(&self, desc: &TextureDescriptor) -> GalResult<TextureViewDescriptor> {
        let mips = self
            .mip_level_count
            .unwrap_or(desc.mip_levels.saturating_sub(self.base_mip_level));
        let layers = self
            .array_layer_count
            .unwrap_or(desc.array_layers.saturating_sub(self.base_array_layer));
        if mips == 0 || self.base_mip_level + mips > desc.mip_levels {
            return Err(GalError::descriptor(format!(
                "view mips {}..{} outside texture with {} mips",
                self.base_mip_level,
                self.base_mip_level + mips,
                desc.mip_levels
            )));
        }
        if layers == 0 || self.base_array_layer + layers > desc.array_layers {
            return Err(GalError::descriptor(format!(
                "view layers {}..{} outside texture with {} layers",
                self.base_array_layer,
                self.base_array_layer + layers,
                desc.array_layers
            )));
        }
        let cube = desc.usage.contains(TextureUsage::CUBEMAP);
        let dimension = match self.dimension {
            Some(dimension) => dimension,
            None => match desc.dimension {
                TextureDimension::D1 => TextureViewDimension::D1,
                TextureDimension::D3 => TextureViewDimension::D3,
                TextureDimension::D2 if cube && layers == 6 => TextureViewDimension::Cube,
                TextureDimension::D2 if cube => TextureViewDimension::CubeArray,
                TextureDimension::D2 if layers > 1 => TextureViewDimension::D2Array,
                TextureDimension::D2 => TextureViewDimension::D2,
            },
        };
        let ok = match dimension {
            TextureViewDimension::Cube => cube && layers == 6,
            TextureViewDimension::CubeArray => cube && layers % 6 == 0,
            TextureViewDimension::D2 => desc.dimension == TextureDimension::D2 && layers == 1,
            TextureViewDimension::D2Array => desc.dimension == TextureDimension::D2,
            TextureViewDimension::D1 => desc.dimension == TextureDimension::D1 && layers == 1,
            TextureViewDimension::D3 => desc.dimension == TextureDimension::D3,
        };
        if !ok {
            return Err(GalError::descriptor(format!(
                "view dimension {dimension:?} incompatible with texture {:?} with {layers} layers",
                desc.dimension
            )));
        }
        Ok(TextureViewDescriptor {
            label: self.label,
            base_mip_level: self.base_mip_level,
            mip_level_count: Some(mips),
            base_array_layer: self.base_array_layer,
            array_layer_count: Some(layers),
            dimension: Some(dimension),
        })
    }
}

/// View over part of a texture, bindable in resource sets.
pub struct TextureView {
    base: ResourceBase,
    handle: NativeHandle,
    texture: Arc<Texture>,
    desc: TextureViewDescriptor,
}

impl std::fmt::Debug for TextureView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextureView")
            .field("id", &self.base.id())
            .field("texture", &self.texture.id())
            .field("dimension", &self.desc.dimension)
            .finish_non_exhaustive()
    }
}

impl TextureView {
    pub(crate) fn new(handle: NativeHandle, texture: Arc<Texture>, desc: TextureViewDescriptor) -> Self {
        Self {
            base: ResourceBase::new("texture view", desc.label),
            handle,
            texture,
            desc,
        }
    }

    pub fn texture(&self) -> &Arc<Texture> {
        &self.texture
    }

    pub fn descriptor(&self) -> &TextureViewDescriptor {
        &self.desc
    }

    pub(crate) fn native(&self) -> NativeHandle {
        self.handle
    }
}

impl Resource for TextureView {
    fn base(&self) -> &ResourceBase {
        &self.base
    }

    fn dispose(&self) {
        if self.base.begin_dispose() {
            let device = self.texture.device();
            device.wait_for_usage(&self.base);
            device.backend().destroy_texture_view(self.handle);
        }
    }

    fn set_name(&self, name: &str) {
        self.base.set_name(name);
        self.texture
            .device()
            .backend()
            .set_debug_name(ObjectKind::TextureView, self.handle, name);
    }
}

impl Drop for TextureView {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;

    fn caps() -> Capabilities {
        crate::headless::adapter_info(&ContextConfig::default()).capabilities
    }

    #[test]
    fn storage_and_render_target_are_exclusive_by_default() {
        let desc = TextureDescriptor::new_2d(
            64,
            64,
            TextureFormat::Rgba8Unorm,
            TextureUsage::RENDER_TARGET | TextureUsage::STORAGE,
        );
        assert!(matches!(
            desc.validate(&caps()),
            Err(GalError::UnsupportedUsage(_))
        ));

        let mut permissive = caps();
        permissive.storage_render_target = true;
        assert!(desc.validate(&permissive).is_ok());
    }

    #[test]
    fn depth_usage_requires_depth_format() {
        let desc = TextureDescriptor::new_2d(
            8,
            8,
            TextureFormat::Rgba8Unorm,
            TextureUsage::DEPTH_STENCIL,
        );
        assert!(desc.validate(&caps()).is_err());
        let desc =
            TextureDescriptor::new_2d(8, 8, TextureFormat::D32Float, TextureUsage::DEPTH_STENCIL);
        assert!(desc.validate(&caps()).is_ok());
    }

    #[test]
    fn mip_chain_limits() {
        let mut desc =
            TextureDescriptor::new_2d(256, 64, TextureFormat::Rgba8Unorm, TextureUsage::SAMPLED);
        assert_eq!(desc.full_mip_chain(), 9);
        desc.mip_levels = 9;
        assert!(desc.validate(&caps()).is_ok());
        desc.mip_levels = 10;
        assert!(desc.validate(&caps()).is_err());
        assert_eq!(desc.mip_extent(8), [1, 1, 1]);
        assert_eq!(desc.mip_size(1), 128 * 32 * 4);
    }

    #[test]
    fn cubemap_views_default_to_cube() {
        let desc = TextureDescriptor {
            array_layers: 6,
            usage: TextureUsage::SAMPLED | TextureUsage::CUBEMAP,
            ..TextureDescriptor::new_2d(32, 32, TextureFormat::Rgba16Float, TextureUsage::SAMPLED)
        };
        assert!(desc.validate(&caps()).is_ok());
        let view = TextureViewDescriptor::default().resolve(&desc).unwrap();
        assert_eq!(view.dimension, Some(TextureViewDimension::Cube));
        assert_eq!(view.array_layer_count, Some(6));

        let bad = TextureViewDescriptor {
            base_array_layer: 4,
            array_layer_count: Some(6),
            ..Default::default()
        };
        assert!(bad.resolve(&desc).is_err());
    }

    #[test]
    fn regions_are_checked_against_mip_extent() {
        let desc =
            TextureDescriptor::new_2d(16, 16, TextureFormat::Rgba8Unorm, TextureUsage::SAMPLED);
        let region = TextureRegion::whole(&desc, 0, 0);
        assert!(region.validate(&desc).is_ok());
        assert_eq!(region.data_size(desc.format), 16 * 16 * 4);
        let region = TextureRegion {
            origin: [8, 0, 0],
            ..region
        };
        assert!(region.validate(&desc).is_err());
    }
}
