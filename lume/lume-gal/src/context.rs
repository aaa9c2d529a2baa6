//! Entry point: backend selection, adapter enumeration and device creation.

use std::fmt;
use std::sync::Arc;

use crate::backend::Backend;
use crate::config::ContextConfig;
use crate::device::Device;
use crate::error::{GalError, GalResult};
use crate::headless::HeadlessBackend;

/// Native API a context is created on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Descriptor-set / command-buffer model.
    Vulkan,
    /// Root-signature / command-list model executed in host memory.
    Headless,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Vulkan => f.write_str("Vulkan"),
            BackendKind::Headless => f.write_str("Headless"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterKind {
    Discrete,
    Integrated,
    Virtual,
    Cpu,
    Other,
}

/// What a device can do. Queried after creation; never changes.
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub device_name: String,
    pub backend: BackendKind,
    pub adapter_kind: AdapterKind,
    pub ray_query: bool,
    pub ray_tracing: bool,
    /// Runtime-sized, partially bound, update-after-bind descriptor arrays.
    pub bindless: bool,
    pub max_bindless_descriptors: u32,
    pub max_texture_dimension_2d: u32,
    pub max_sample_count: u32,
    pub max_ray_recursion_depth: u32,
    /// Storage usage may be combined with render-target or depth-stencil usage.
    pub storage_render_target: bool,
    /// Alignment required for acceleration structure scratch memory.
    pub scratch_alignment: u64,
}

impl Capabilities {
    /// Whether acceleration structures can be built at all.
    pub fn acceleration_structures(&self) -> bool {
        self.ray_tracing || self.ray_query
    }
}

#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub index: usize,
    pub name: String,
    pub kind: AdapterKind,
    pub capabilities: Capabilities,
}

enum Instance {
    Headless,
    #[cfg(feature = "vulkan")]
    Vulkan(Arc<crate::vulkan::VulkanInstance>),
}

/// Owns the process-wide native state (loader, instance) for one backend.
pub struct GraphicsContext {
    kind: BackendKind,
    config: ContextConfig,
    instance: Instance,
    adapters: Vec<AdapterInfo>,
    selected: usize,
}

impl fmt::Debug for GraphicsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphicsContext")
            .field("kind", &self.kind)
            .field("adapters", &self.adapters.len())
            .field("selected", &self.selected)
            .finish_non_exhaustive()
    }
}

impl GraphicsContext {
    /// Creates a context with configuration taken from the environment.
    pub fn create(kind: BackendKind) -> GalResult<Self> {
        Self::create_with_config(kind, ContextConfig::from_env())
    }

    pub fn create_with_config(kind: BackendKind, config: ContextConfig) -> GalResult<Self> {
        let (instance, adapters) = match kind {
            BackendKind::Headless => (
                Instance::Headless,
                vec![crate::headless::adapter_info(&config)],
            ),
            #[cfg(feature = "vulkan")]
            BackendKind::Vulkan => {
                let instance = crate::vulkan::VulkanInstance::new(&config)?;
                let adapters = instance.adapters().to_vec();
                (Instance::Vulkan(instance), adapters)
            }
            #[cfg(not(feature = "vulkan"))]
            BackendKind::Vulkan => {
                return Err(GalError::UnsupportedCapability(
                    "Vulkan backend not compiled in (enable the `vulkan` feature)".into(),
                ))
            }
        };
        if adapters.is_empty() {
            return Err(GalError::UnsupportedCapability(format!(
                "no {kind} adapter available"
            )));
        }
        let selected = match config.adapter_index {
            Some(index) if index < adapters.len() => index,
            Some(index) => {
                return Err(GalError::descriptor(format!(
                    "adapter {index} requested but only {} present",
                    adapters.len()
                )))
            }
            None => best_adapter(&adapters),
        };
        log::info!(
            "{kind} context created, adapter {} '{}' ({:?})",
            selected,
            adapters[selected].name,
            adapters[selected].kind
        );
        Ok(Self {
            kind,
            config,
            instance,
            adapters,
            selected,
        })
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.kind
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn adapters(&self) -> &[AdapterInfo] {
        &self.adapters
    }

    /// Capabilities of the adapter `create_device` will open.
    pub fn capabilities(&self) -> &Capabilities {
        &self.adapters[self.selected].capabilities
    }

    pub fn device_name(&self) -> &str {
        &self.capabilities().device_name
    }

    pub fn supports_ray_query(&self) -> bool {
        self.capabilities().ray_query
    }

    pub fn supports_ray_tracing(&self) -> bool {
        self.capabilities().ray_tracing
    }

    /// Opens the selected adapter.
    pub fn create_device(&self) -> GalResult<Device> {
        let backend: Arc<dyn Backend> = match &self.instance {
            Instance::Headless => Arc::new(HeadlessBackend::new(&self.config)),
            #[cfg(feature = "vulkan")]
            Instance::Vulkan(instance) => instance.open(self.selected, &self.config)?,
        };
        Ok(Device::new(backend, self.config.clone()))
    }
}

fn best_adapter(adapters: &[AdapterInfo]) -> usize {
    let rank = |kind: AdapterKind| match kind {
        AdapterKind::Discrete => 0,
        AdapterKind::Integrated => 1,
        AdapterKind::Virtual => 2,
        AdapterKind::Other => 3,
        AdapterKind::Cpu => 4,
    };
    adapters
        .iter()
        .min_by_key(|a| (rank(a.kind), a.index))
        .map_or(0, |a| a.index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headless_context_reports_capabilities() {
        let context = GraphicsContext::create(BackendKind::Headless).unwrap();
        assert_eq!(context.backend_kind(), BackendKind::Headless);
        assert_eq!(context.device_name(), "Lume Headless Device");
        assert!(context.supports_ray_query());
        assert!(context.supports_ray_tracing());
        assert_eq!(context.adapters().len(), 1);
    }

    #[test]
    fn missing_adapter_index_is_rejected() {
        let config = ContextConfig {
            adapter_index: Some(3),
            ..ContextConfig::default()
        };
        let err = GraphicsContext::create_with_config(BackendKind::Headless, config).unwrap_err();
        assert!(matches!(err, GalError::InvalidDescriptor(_)));
    }

    #[test]
    fn discrete_adapters_are_preferred() {
        let caps = crate::headless::adapter_info(&ContextConfig::default()).capabilities;
        let adapter = |index, kind| AdapterInfo {
            index,
            name: format!("gpu{index}"),
            kind,
            capabilities: caps.clone(),
        };
        let adapters = [
            adapter(0, AdapterKind::Integrated),
            adapter(1, AdapterKind::Cpu),
            adapter(2, AdapterKind::Discrete),
        ];
        assert_eq!(best_adapter(&adapters), 2);
    }
}
