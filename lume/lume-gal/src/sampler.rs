//! Sampler descriptors and sampler objects.

use std::sync::Arc;

use crate::backend::{NativeHandle, ObjectKind};
use crate::device::DeviceShared;
use crate::error::{GalError, GalResult};
use crate::pipeline::CompareOp;
use crate::resource::{Resource, ResourceBase};

/// Filter mode for sampler min/mag/mip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterMode {
    #[default]
    Nearest,
    Linear,
}

/// Address mode for sampler U/V/W.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressMode {
    #[default]
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
}

#[derive(Debug, Clone)]
pub struct SamplerDescriptor {
    pub label: Option<&'static str>,
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
    pub mipmap_filter: FilterMode,
    pub address_mode_u: AddressMode,
    pub address_mode_v: AddressMode,
    pub address_mode_w: AddressMode,
    pub lod_min_clamp: f32,
    pub lod_max_clamp: f32,
    /// Enables depth comparison sampling (shadow maps).
    pub compare: Option<CompareOp>,
    pub anisotropy_clamp: Option<f32>,
}

impl Default for SamplerDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            min_filter: FilterMode::Linear,
            mag_filter: FilterMode::Linear,
            mipmap_filter: FilterMode::Linear,
            address_mode_u: AddressMode::Repeat,
            address_mode_v: AddressMode::Repeat,
            address_mode_w: AddressMode::Repeat,
            lod_min_clamp: 0.0,
            lod_max_clamp: 1000.0,
            compare: None,
            anisotropy_clamp: None,
        }
    }
}

impl SamplerDescriptor {
    pub(crate) fn validate(&self) -> GalResult<()> {
        if !(self.lod_min_clamp >= 0.0 && self.lod_min_clamp <= self.lod_max_clamp) {
            return Err(GalError::descriptor(format!(
                "lod clamp {}..{} is not an ascending non-negative range",
                self.lod_min_clamp, self.lod_max_clamp
            )));
        }
        if let Some(anisotropy) = self.anisotropy_clamp {
            if !(1.0..=16.0).contains(&anisotropy) {
                return Err(GalError::descriptor(format!(
                    "anisotropy clamp {anisotropy} outside 1..=16"
                )));
            }
        }
        Ok(())
    }
}

pub struct Sampler {
    base: ResourceBase,
    device: Arc<DeviceShared>,
    handle: NativeHandle,
    desc: SamplerDescriptor,
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler")
            .field("id", &self.base.id())
            .field("name", &self.base.name())
            .finish_non_exhaustive()
    }
}

impl Sampler {
    pub(crate) fn new(device: Arc<DeviceShared>, handle: NativeHandle, desc: SamplerDescriptor) -> Self {
        Self {
            base: ResourceBase::new("sampler", desc.label),
            device,
            handle,
            desc,
        }
    }

    pub fn descriptor(&self) -> &SamplerDescriptor {
        &self.desc
    }

    pub(crate) fn native(&self) -> NativeHandle {
        self.handle
    }
}

impl Resource for Sampler {
    fn base(&self) -> &ResourceBase {
        &self.base
    }

    fn dispose(&self) {
        if self.base.begin_dispose() {
            self.device.wait_for_usage(&self.base);
            self.device.backend().destroy_sampler(self.handle);
        }
    }

    fn set_name(&self, name: &str) {
        self.base.set_name(name);
        self.device
            .backend()
            .set_debug_name(ObjectKind::Sampler, self.handle, name);
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lod_and_anisotropy_ranges() {
        assert!(SamplerDescriptor::default().validate().is_ok());
        let desc = SamplerDescriptor {
            lod_min_clamp: 4.0,
            lod_max_clamp: 2.0,
            ..Default::default()
        };
        assert!(desc.validate().is_err());
        let desc = SamplerDescriptor {
            anisotropy_clamp: Some(32.0),
            ..Default::default()
        };
        assert!(desc.validate().is_err());
    }
}
