//! Headless device setup shared by the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use lume_gal::{
    BackendKind, ContextConfig, Device, GraphicsContext, Shader, ShaderStage, Texture,
    TextureDescriptor, TextureFormat, TextureUsage,
};

/// Not valid SPIR-V beyond the magic number; the headless backend never parses it.
pub const BYTECODE: &[u8] = &[0x03, 0x02, 0x23, 0x07, 0, 0, 1, 0];

pub fn device_with(config: ContextConfig) -> Device {
    let _ = env_logger::builder().is_test(true).try_init();
    GraphicsContext::create_with_config(BackendKind::Headless, config)
        .and_then(|context| context.create_device())
        .expect("headless device")
}

pub fn device() -> Device {
    device_with(ContextConfig::default())
}

pub fn shader(device: &Device, stage: ShaderStage) -> Arc<Shader> {
    device
        .factory()
        .create_shader(stage, BYTECODE, "main")
        .expect("shader")
}

pub fn render_target(device: &Device, format: TextureFormat) -> Arc<Texture> {
    device
        .factory()
        .create_texture(&TextureDescriptor::new_2d(
            16,
            16,
            format,
            TextureUsage::RENDER_TARGET | TextureUsage::SAMPLED,
        ))
        .expect("render target")
}
