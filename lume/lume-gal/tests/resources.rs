mod common;

use lume_gal::{
    BufferDescriptor, BufferUsage, GalError, QueueKind, Resource, TextureDescriptor,
    TextureFormat, TextureRegion, TextureUsage,
};

use common::device;

#[test]
fn buffer_contents_round_trip() {
    let device = device();
    let buffer = device
        .factory()
        .create_buffer(&BufferDescriptor::new(64, BufferUsage::STORAGE).with_label("roundtrip"))
        .unwrap();
    let data: Vec<u8> = (0..32).collect();
    buffer.write(16, &data).unwrap();
    assert_eq!(buffer.read(16, 32).unwrap(), data);
    assert_eq!(buffer.read(0, 16).unwrap(), vec![0u8; 16]);
}

#[test]
fn dispose_is_idempotent_and_blocks_further_use() {
    let device = device();
    let buffer = device
        .factory()
        .create_buffer(&BufferDescriptor::new(16, BufferUsage::CONSTANT))
        .unwrap();
    buffer.dispose();
    buffer.dispose();
    assert!(buffer.is_disposed());
    assert!(matches!(buffer.write(0, &[0; 4]), Err(GalError::InvalidState(_))));
}

#[test]
fn uploaded_textures_generate_their_mip_chain() {
    let device = device();
    let factory = device.factory();
    let desc = TextureDescriptor {
        label: Some("albedo"),
        mip_levels: 3,
        ..TextureDescriptor::new_2d(
            4,
            4,
            TextureFormat::Rgba8Unorm,
            TextureUsage::SAMPLED
                | TextureUsage::GENERATE_MIPMAPS
                | TextureUsage::COPY_SRC
                | TextureUsage::COPY_DST,
        )
    };
    let texture = factory.create_texture(&desc).unwrap();
    let texels: Vec<u8> = [10u8, 20, 30, 40].repeat(16);
    device
        .upload_texture(&texture, &TextureRegion::whole(&desc, 0, 0), &texels)
        .unwrap();
    device.generate_mipmaps(&texture).unwrap();

    let readback = factory
        .create_buffer(&BufferDescriptor::new(4, BufferUsage::COPY_DST))
        .unwrap();
    let processor = device.command_processor(QueueKind::Graphics);
    let mut commands = processor.command_buffer();
    commands.begin().unwrap();
    commands
        .copy_texture_to_buffer(&texture, TextureRegion::whole(&desc, 2, 0), &readback, 0)
        .unwrap();
    commands.end().unwrap();
    let token = processor.commit(&mut commands).unwrap();
    assert!(device.wait(token, None).unwrap());
    assert_eq!(readback.read(0, 4).unwrap(), vec![10, 20, 30, 40]);

    let plain = factory
        .create_texture(&TextureDescriptor::new_2d(
            4,
            4,
            TextureFormat::Rgba8Unorm,
            TextureUsage::SAMPLED,
        ))
        .unwrap();
    assert!(matches!(
        device.generate_mipmaps(&plain),
        Err(GalError::UnsupportedUsage(_))
    ));
}

#[test]
fn names_are_kept_on_the_resource() {
    let device = device();
    let buffer = device
        .factory()
        .create_buffer(&BufferDescriptor::new(16, BufferUsage::CONSTANT))
        .unwrap();
    assert_eq!(buffer.name(), None);
    buffer.set_name("camera constants");
    assert_eq!(buffer.name().as_deref(), Some("camera constants"));
}
