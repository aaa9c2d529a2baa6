mod common;

use lume_gal::{
    ColorAttachment, GalError, QueueKind, RenderPassDescriptor, Resource, ResourceState,
    SwapchainDescriptor, SwapchainState,
};

use common::device;

#[test]
fn swapchain_resize_to_the_same_size_keeps_handles() {
    let device = device();
    let swapchain = device
        .factory()
        .create_swapchain(SwapchainDescriptor {
            width: 32,
            height: 16,
            image_count: 2,
            ..Default::default()
        })
        .unwrap();
    let ids: Vec<_> = swapchain.back_buffers().iter().map(|t| t.id()).collect();
    let depth = swapchain.depth_texture().map(|t| t.id());

    assert!(!swapchain.resize(32, 16).unwrap());
    let same: Vec<_> = swapchain.back_buffers().iter().map(|t| t.id()).collect();
    assert_eq!(ids, same);
    assert_eq!(swapchain.depth_texture().map(|t| t.id()), depth);

    assert!(swapchain.resize(64, 32).unwrap());
    assert_eq!(swapchain.extent(), [64, 32]);
    assert_eq!(swapchain.state(), SwapchainState::Created);
    let resized: Vec<_> = swapchain.back_buffers().iter().map(|t| t.id()).collect();
    assert_eq!(resized.len(), 2);
    assert!(resized.iter().all(|id| !ids.contains(id)));
}

#[test]
fn presenting_requires_the_present_state() {
    let device = device();
    let swapchain = device
        .factory()
        .create_swapchain(SwapchainDescriptor {
            width: 8,
            height: 8,
            image_count: 2,
            depth_format: None,
            ..Default::default()
        })
        .unwrap();
    let processor = device.command_processor(QueueKind::Graphics);

    let index = swapchain.acquire_next_image().unwrap();
    let back_buffer = swapchain.back_buffer(index).unwrap();
    let mut commands = processor.command_buffer();
    commands.begin().unwrap();
    commands
        .begin_render_pass(&RenderPassDescriptor {
            label: None,
            color_attachments: vec![ColorAttachment::clear(back_buffer.clone(), [1.0; 4])],
            depth_attachment: None,
        })
        .unwrap();
    commands.end_render_pass().unwrap();
    commands.end().unwrap();
    let token = processor.commit(&mut commands).unwrap();
    assert!(matches!(swapchain.present(token), Err(GalError::InvalidState(_))));

    commands.wait().unwrap();
    commands.begin().unwrap();
    commands.transition(&back_buffer, ResourceState::Present).unwrap();
    commands.end().unwrap();
    let token = processor.commit(&mut commands).unwrap();
    swapchain.present(token).unwrap();
    assert_eq!(swapchain.state(), SwapchainState::Presenting);
    assert_eq!(swapchain.acquire_next_image().unwrap(), (index + 1) % 2);
}
