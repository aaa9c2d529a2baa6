//! Run-time configuration for context and device creation.

/// Options read once when a [`GraphicsContext`](crate::GraphicsContext) is created.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub application_name: String,
    /// Enable the native validation layer. Defaults to on with the `validation` feature.
    pub validation: bool,
    /// Adapter to open; `None` picks the best adapter (discrete first).
    pub adapter_index: Option<usize>,
    /// Capacity given to every unbounded (bindless) layout slot, clamped to the device limit.
    pub max_bindless_descriptors: u32,
    pub headless: HeadlessProfile,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            application_name: "Lume".to_owned(),
            validation: cfg!(feature = "validation"),
            adapter_index: None,
            max_bindless_descriptors: 4096,
            headless: HeadlessProfile::default(),
        }
    }
}

impl ContextConfig {
    /// Defaults overridden by `LUME_VALIDATION=1`, `LUME_ADAPTER=<index>` and
    /// `LUME_MAX_BINDLESS=<count>`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("LUME_VALIDATION") {
            config.validation = matches!(value.as_str(), "1" | "true" | "on");
        }
        if let Some(index) = env_number("LUME_ADAPTER") {
            config.adapter_index = Some(index as usize);
        }
        if let Some(count) = env_number("LUME_MAX_BINDLESS") {
            config.max_bindless_descriptors = count.min(u32::MAX as u64) as u32;
        }
        config
    }
}

fn env_number(key: &str) -> Option<u64> {
    let value = std::env::var(key).ok()?;
    match value.trim().parse() {
        Ok(n) => Some(n),
        Err(_) => {
            log::warn!("ignoring {key}={value:?}: not a number");
            None
        }
    }
}

/// Capabilities simulated by the headless backend.
#[derive(Debug, Clone)]
pub struct HeadlessProfile {
    pub device_name: String,
    pub ray_tracing: bool,
    pub ray_query: bool,
    pub bindless: bool,
    /// Bytes of emulated device memory; allocations past it fail with `AllocationFailure`.
    pub memory_budget: u64,
    /// Size of the shader-visible resource descriptor heap.
    pub resource_heap_size: u32,
    /// Size of the shader-visible sampler heap.
    pub sampler_heap_size: u32,
    pub storage_render_target: bool,
}

impl Default for HeadlessProfile {
    fn default() -> Self {
        Self {
            device_name: "Lume Headless Device".to_owned(),
            ray_tracing: true,
            ray_query: true,
            bindless: true,
            memory_budget: 256 << 20,
            resource_heap_size: 1 << 20,
            sampler_heap_size: 2048,
            storage_render_target: false,
        }
    }
}
