//! Compiled shader modules. Bytecode is opaque to this crate.

use std::sync::Arc;

use crate::backend::{NativeHandle, ObjectKind};
use crate::device::DeviceShared;
use crate::error::{GalError, GalResult};
use crate::resource::{Resource, ResourceBase};

/// Pipeline stage a shader module is compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
    RayGeneration,
    Miss,
    ClosestHit,
    AnyHit,
    Intersection,
    Callable,
}

impl ShaderStage {
    pub fn is_ray_tracing(self) -> bool {
        self.stages().intersects(ShaderStages::RAY_TRACING)
    }

    pub fn stages(self) -> ShaderStages {
        match self {
            ShaderStage::Vertex => ShaderStages::VERTEX,
            ShaderStage::Fragment => ShaderStages::FRAGMENT,
            ShaderStage::Compute => ShaderStages::COMPUTE,
            ShaderStage::RayGeneration => ShaderStages::RAY_GENERATION,
            ShaderStage::Miss => ShaderStages::MISS,
            ShaderStage::ClosestHit => ShaderStages::CLOSEST_HIT,
            ShaderStage::AnyHit => ShaderStages::ANY_HIT,
            ShaderStage::Intersection => ShaderStages::INTERSECTION,
            ShaderStage::Callable => ShaderStages::CALLABLE,
        }
    }
}

bitflags::bitflags! {
    /// Shader stages that can see a binding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
        const RAY_GENERATION = 1 << 3;
        const MISS = 1 << 4;
        const CLOSEST_HIT = 1 << 5;
        const ANY_HIT = 1 << 6;
        const INTERSECTION = 1 << 7;
        const CALLABLE = 1 << 8;
        const GRAPHICS = Self::VERTEX.bits() | Self::FRAGMENT.bits();
        const RAY_TRACING = Self::RAY_GENERATION.bits()
            | Self::MISS.bits()
            | Self::CLOSEST_HIT.bits()
            | Self::ANY_HIT.bits()
            | Self::INTERSECTION.bits()
            | Self::CALLABLE.bits();
    }
}

/// A compiled shader module plus the entry point used from it.
pub struct Shader {
    base: ResourceBase,
    device: Arc<DeviceShared>,
    handle: NativeHandle,
    stage: ShaderStage,
    entry_point: String,
    bytecode_len: usize,
}

impl std::fmt::Debug for Shader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shader")
            .field("id", &self.base.id())
            .field("stage", &self.stage)
            .field("entry_point", &self.entry_point)
            .field("bytes", &self.bytecode_len)
            .finish()
    }
}

impl Shader {
    pub(crate) fn validate(stage: ShaderStage, bytecode: &[u8], entry_point: &str) -> GalResult<()> {
        if bytecode.is_empty() {
            return Err(GalError::descriptor(format!("{stage:?} shader bytecode is empty")));
        }
        if entry_point.is_empty() || entry_point.contains('\0') {
            return Err(GalError::descriptor(format!(
                "invalid entry point {entry_point:?} for {stage:?} shader"
            )));
        }
        Ok(())
    }

    pub(crate) fn new(
        device: Arc<DeviceShared>,
        handle: NativeHandle,
        stage: ShaderStage,
        entry_point: &str,
        bytecode_len: usize,
    ) -> Self {
        Self {
            base: ResourceBase::new("shader", Some(entry_point)),
            device,
            handle,
            stage,
            entry_point: entry_point.to_owned(),
            bytecode_len,
        }
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub(crate) fn native(&self) -> NativeHandle {
        self.handle
    }

    /// Fails with `InvalidDescriptor` unless the module was compiled for `expected`.
    pub(crate) fn expect_stage(&self, expected: ShaderStage) -> GalResult<()> {
        self.base.ensure_alive()?;
        if self.stage != expected {
            return Err(GalError::descriptor(format!(
                "shader '{}' is a {:?} shader, expected {:?}",
                self.entry_point, self.stage, expected
            )));
        }
        Ok(())
    }
}

impl Resource for Shader {
    fn base(&self) -> &ResourceBase {
        &self.base
    }

    fn dispose(&self) {
        if self.base.begin_dispose() {
            self.device.backend().destroy_shader(self.handle);
        }
    }

    fn set_name(&self, name: &str) {
        self.base.set_name(name);
        self.device
            .backend()
            .set_debug_name(ObjectKind::Shader, self.handle, name);
    }
}

impl Drop for Shader {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_masks() {
        assert!(ShaderStage::ClosestHit.is_ray_tracing());
        assert!(!ShaderStage::Fragment.is_ray_tracing());
        assert!(ShaderStages::GRAPHICS.contains(ShaderStage::Vertex.stages()));
    }

    #[test]
    fn empty_bytecode_is_rejected() {
        assert!(Shader::validate(ShaderStage::Vertex, &[], "main").is_err());
        assert!(Shader::validate(ShaderStage::Vertex, &[1, 2, 3, 4], "").is_err());
        assert!(Shader::validate(ShaderStage::Vertex, &[1, 2, 3, 4], "main").is_ok());
    }
}
