mod common;

use lume_gal::{
    BindingResource, BufferDescriptor, BufferUsage, ColorAttachment, ColorTargetState,
    CommandBufferState, ComputePipelineDescriptor, GalError, GraphicsPipelineDescriptor,
    IndexFormat, OutputDescription, QueueKind, RenderPassDescriptor, ResourceKind,
    ResourceLayoutDescriptor, ResourceLayoutElement, ResourceSetDescriptor, ResourceState,
    SetEntry, ShaderStage, ShaderStages, TextureFormat,
};

use common::{device, render_target, shader};

#[test]
fn end_without_begin_is_rejected() {
    let device = device();
    let mut commands = device.command_processor(QueueKind::Graphics).command_buffer();
    assert!(matches!(commands.end(), Err(GalError::InvalidState(_))));
    assert_eq!(commands.state(), CommandBufferState::Initial);
}

#[test]
fn repeated_states_emit_no_barriers() {
    let device = device();
    let buffer = device
        .factory()
        .create_buffer(&BufferDescriptor::new(64, BufferUsage::STORAGE))
        .unwrap();
    let before = device.statistics();

    let mut commands = device.command_processor(QueueKind::Graphics).command_buffer();
    commands.begin().unwrap();
    commands.update_buffer(&buffer, 0, &[1, 2, 3, 4]).unwrap();
    commands.update_buffer(&buffer, 4, &[5, 6, 7, 8]).unwrap();
    commands.transition(&buffer, ResourceState::ShaderRead).unwrap();
    commands.transition(&buffer, ResourceState::ShaderRead).unwrap();
    commands.end().unwrap();
    // Two updates and one barrier; the repeated transition records nothing.
    assert_eq!(commands.command_count(), 3);

    let token = device
        .command_processor(QueueKind::Graphics)
        .commit(&mut commands)
        .unwrap();
    assert!(device.wait(token, None).unwrap());
    let after = device.statistics();
    // Common -> CopyDestination fix-up at commit, then CopyDestination -> ShaderRead.
    assert_eq!(after.transitions - before.transitions, 2);
    assert_eq!(after.submissions - before.submissions, 1);
    assert_eq!(buffer.read(0, 8).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn released_buffers_move_between_queues() {
    let device = device();
    let buffer = device
        .factory()
        .create_buffer(&BufferDescriptor::new(64, BufferUsage::STORAGE))
        .unwrap();
    let transfer = device.command_processor(QueueKind::Transfer);
    let compute = device.command_processor(QueueKind::Compute);
    let before = device.statistics();

    let mut upload = transfer.command_buffer();
    upload.begin().unwrap();
    upload.update_buffer(&buffer, 0, &[9; 16]).unwrap();
    upload.release_ownership(&buffer, QueueKind::Compute).unwrap();
    upload.end().unwrap();
    transfer.commit(&mut upload).unwrap();

    let mut consume = compute.command_buffer();
    consume.begin().unwrap();
    consume.transition(&buffer, ResourceState::ShaderRead).unwrap();
    consume.end().unwrap();
    let token = compute.commit(&mut consume).unwrap();
    assert_eq!(token.queue, QueueKind::Compute);
    device.wait(token, None).unwrap();

    // Release on the transfer queue, acquire on the compute queue.
    assert_eq!(device.statistics().queue_transfers - before.queue_transfers, 2);
    assert_eq!(buffer.read(0, 16).unwrap(), vec![9; 16]);
}

#[test]
fn mismatched_pipeline_outputs_are_rejected_at_bind() {
    let device = device();
    let factory = device.factory();
    let pipeline = factory
        .create_graphics_pipeline(&GraphicsPipelineDescriptor {
            label: Some("rgba pipeline"),
            vertex_shader: shader(&device, ShaderStage::Vertex),
            fragment_shader: Some(shader(&device, ShaderStage::Fragment)),
            vertex_input: Default::default(),
            primitive_topology: Default::default(),
            rasterization: Default::default(),
            color_targets: vec![ColorTargetState::default()],
            depth_stencil: None,
            outputs: OutputDescription::new(vec![TextureFormat::Rgba8Unorm], None),
            layouts: Vec::new(),
        })
        .unwrap();

    let processor = device.command_processor(QueueKind::Graphics);
    let mut commands = processor.command_buffer();
    commands.begin().unwrap();
    commands
        .begin_render_pass(&RenderPassDescriptor {
            label: None,
            color_attachments: vec![ColorAttachment::clear(
                render_target(&device, TextureFormat::Bgra8Unorm),
                [0.0; 4],
            )],
            depth_attachment: None,
        })
        .unwrap();
    let err = commands.bind_pipeline(&pipeline).unwrap_err();
    assert!(matches!(err, GalError::PipelineOutputMismatch { .. }), "{err}");
    commands.end_render_pass().unwrap();

    commands
        .begin_render_pass(&RenderPassDescriptor {
            label: None,
            color_attachments: vec![ColorAttachment::clear(
                render_target(&device, TextureFormat::Rgba8Unorm),
                [0.0, 0.0, 0.0, 1.0],
            )],
            depth_attachment: None,
        })
        .unwrap();
    commands.bind_pipeline(&pipeline).unwrap();
    commands.draw(3, 1, 0, 0).unwrap();
    commands.end_render_pass().unwrap();
    commands.end().unwrap();
    let token = processor.commit(&mut commands).unwrap();
    device.wait(token, None).unwrap();
    assert_eq!(device.statistics().draws, 1);
}

#[test]
fn compute_dispatch_runs_with_bound_resources() {
    let device = device();
    let factory = device.factory();
    let layout = factory
        .create_resource_layout(&ResourceLayoutDescriptor {
            label: None,
            elements: vec![ResourceLayoutElement::new(
                "data",
                ResourceKind::StorageBufferReadWrite,
                ShaderStages::COMPUTE,
            )],
        })
        .unwrap();
    let data = factory
        .create_buffer(&BufferDescriptor::new(256, BufferUsage::STORAGE))
        .unwrap();
    let set = factory
        .create_resource_set(&ResourceSetDescriptor {
            label: None,
            layout: layout.clone(),
            entries: vec![SetEntry::Single(BindingResource::buffer(&data))],
        })
        .unwrap();
    let pipeline = factory
        .create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some("clear"),
            shader: shader(&device, ShaderStage::Compute),
            layouts: vec![layout],
        })
        .unwrap();

    let processor = device.command_processor(QueueKind::Compute);
    let mut commands = processor.command_buffer();
    commands.begin().unwrap();
    commands.begin_compute_pass("clear").unwrap();
    commands.bind_pipeline(&pipeline).unwrap();
    commands.bind_resource_set(0, &set).unwrap();
    commands.dispatch(4, 1, 1).unwrap();
    commands.end_compute_pass().unwrap();
    commands.end().unwrap();
    let token = processor.commit(&mut commands).unwrap();
    commands.wait().unwrap();
    assert!(device.is_complete(token).unwrap());
    assert_eq!(commands.state(), CommandBufferState::Completed);
    assert_eq!(device.statistics().dispatches, 1);
}

#[test]
fn processors_reuse_finished_command_buffers() {
    let device = device();
    let processor = device.command_processor(QueueKind::Graphics);
    let mut commands = processor.command_buffer();
    commands.begin().unwrap();
    commands.end().unwrap();
    processor.commit(&mut commands).unwrap();
    commands.wait().unwrap();

    processor.recycle(commands);
    assert_eq!(processor.pooled(), 1);
    let reused = processor.command_buffer();
    assert_eq!(processor.pooled(), 0);
    assert_eq!(reused.state(), CommandBufferState::Initial);

    let mut stray = device.command_processor(QueueKind::Compute).command_buffer();
    stray.begin().unwrap();
    stray.end().unwrap();
    assert!(matches!(
        processor.commit(&mut stray),
        Err(GalError::InvalidState(_))
    ));
}

#[test]
fn one_buffer_cannot_take_two_states_inside_a_render_pass() {
    let device = device();
    let mesh = device
        .factory()
        .create_buffer(&BufferDescriptor::new(256, BufferUsage::VERTEX | BufferUsage::INDEX))
        .unwrap();
    let mut commands = device.command_processor(QueueKind::Graphics).command_buffer();
    commands.begin().unwrap();
    commands
        .begin_render_pass(&RenderPassDescriptor {
            label: None,
            color_attachments: vec![ColorAttachment::clear(
                render_target(&device, TextureFormat::Rgba8Unorm),
                [0.0; 4],
            )],
            depth_attachment: None,
        })
        .unwrap();
    commands.set_vertex_buffer(0, &mesh, 0).unwrap();
    commands.set_vertex_buffer(1, &mesh, 128).unwrap();
    assert!(matches!(
        commands.set_index_buffer(&mesh, 0, IndexFormat::Uint16),
        Err(GalError::InvalidState(_))
    ));
    commands.end_render_pass().unwrap();
    commands.end().unwrap();
}

#[test]
fn open_render_passes_block_end_and_unclosed_buffers_cannot_commit() {
    let device = device();
    let processor = device.command_processor(QueueKind::Graphics);
    let mut commands = processor.command_buffer();
    assert!(matches!(
        processor.commit(&mut commands),
        Err(GalError::InvalidState(_))
    ));

    commands.begin().unwrap();
    commands
        .begin_render_pass(&RenderPassDescriptor {
            label: None,
            color_attachments: vec![ColorAttachment::clear(
                render_target(&device, TextureFormat::Rgba8Unorm),
                [0.0; 4],
            )],
            depth_attachment: None,
        })
        .unwrap();
    assert!(matches!(commands.end(), Err(GalError::InvalidState(_))));
    assert!(matches!(
        processor.commit(&mut commands),
        Err(GalError::InvalidState(_))
    ));
    assert_eq!(commands.state(), CommandBufferState::Recording);

    commands.end_render_pass().unwrap();
    commands.end().unwrap();
    let token = processor.commit(&mut commands).unwrap();
    assert!(device.wait(token, None).unwrap());
    assert_eq!(commands.state(), CommandBufferState::Completed);
    assert!(matches!(
        processor.commit(&mut commands),
        Err(GalError::InvalidState(_))
    ));
}
