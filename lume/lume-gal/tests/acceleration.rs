mod common;

use std::sync::Arc;

use lume_gal::{
    AccelerationStructureFlags, BottomLevelAS, BottomLevelASDescriptor, BufferDescriptor,
    BufferUsage, Device, GalError, Geometry, Instance, Resource, TopLevelASDescriptor,
    TriangleGeometry, IDENTITY_TRANSFORM,
};

use common::device;

fn triangle_blas(device: &Device) -> Arc<BottomLevelAS> {
    let vertices: [[f32; 4]; 3] = [
        [0.0, 0.0, 0.0, 0.0],
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
    ];
    let vertex_buffer = device
        .factory()
        .create_buffer(&BufferDescriptor::new(48, BufferUsage::VERTEX))
        .unwrap();
    vertex_buffer.write(0, bytemuck::cast_slice(&vertices)).unwrap();
    device
        .factory()
        .create_bottom_level_as(&BottomLevelASDescriptor {
            geometries: vec![Geometry::Triangles(
                TriangleGeometry::new(vertex_buffer, 3).with_stride(16),
            )],
            ..Default::default()
        })
        .unwrap()
}

#[test]
fn triangle_blas_feeds_a_single_instance_tlas() {
    let device = device();
    let factory = device.factory();
    let vertices: [[f32; 4]; 3] = [
        [0.0, 0.0, 0.0, 0.0],
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
    ];
    let vertex_buffer = factory
        .create_buffer(&BufferDescriptor::new(48, BufferUsage::VERTEX).with_label("triangle"))
        .unwrap();
    vertex_buffer
        .write(0, bytemuck::cast_slice(&vertices))
        .unwrap();

    let blas = factory
        .create_bottom_level_as(&BottomLevelASDescriptor {
            label: Some("triangle"),
            geometries: vec![Geometry::Triangles(
                TriangleGeometry::new(vertex_buffer, 3).with_stride(16),
            )],
            ..Default::default()
        })
        .unwrap();
    assert_ne!(blas.device_address(), 0);
    assert_eq!(blas.primitive_count(), 1);

    let tlas = factory
        .create_top_level_as(&TopLevelASDescriptor {
            label: Some("scene"),
            instances: vec![Instance::new(blas.clone())],
            ..Default::default()
        })
        .unwrap();
    assert_eq!(tlas.instance_count(), 1);
    let records = tlas.read_instances().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].blas_address, blas.device_address());
    assert_eq!(records[0].mask(), 0xFF);
    assert_eq!(records[0].transform, IDENTITY_TRANSFORM);
    assert_eq!(device.statistics().acceleration_structure_builds, 2);
}

#[test]
fn empty_builds_are_rejected() {
    let device = device();
    let blas = device
        .factory()
        .create_bottom_level_as(&BottomLevelASDescriptor::default());
    assert!(matches!(blas, Err(GalError::EmptyBuildInput("geometries"))));
    let tlas = device
        .factory()
        .create_top_level_as(&TopLevelASDescriptor::default());
    assert!(matches!(tlas, Err(GalError::EmptyBuildInput("instances"))));
}

#[test]
fn tlas_updates_keep_the_result_buffer() {
    let device = device();
    let blas = triangle_blas(&device);
    let tlas = device
        .factory()
        .create_top_level_as(&TopLevelASDescriptor {
            instances: vec![Instance::new(blas.clone())],
            flags: AccelerationStructureFlags::PREFER_FAST_TRACE
                | AccelerationStructureFlags::ALLOW_UPDATE,
            ..Default::default()
        })
        .unwrap();
    let result = tlas.result_buffer().id();
    let address = tlas.device_address();

    let mut moved = Instance::new(blas.clone());
    moved.transform[3] = 5.0;
    moved.mask = 0x0F;
    tlas.update(&[moved.clone()]).unwrap();
    assert_eq!(tlas.result_buffer().id(), result);
    assert_eq!(tlas.device_address(), address);
    let records = tlas.read_instances().unwrap();
    assert_eq!(records[0].transform[3], 5.0);
    assert_eq!(records[0].mask(), 0x0F);

    assert!(matches!(
        tlas.update(&[moved.clone(), moved]),
        Err(GalError::InvalidDescriptor(_))
    ));

    let fixed = device
        .factory()
        .create_top_level_as(&TopLevelASDescriptor {
            instances: vec![Instance::new(blas.clone())],
            ..Default::default()
        })
        .unwrap();
    assert!(matches!(
        fixed.update(&[Instance::new(blas)]),
        Err(GalError::InvalidState(_))
    ));
}

#[test]
fn failed_tlas_update_keeps_the_previous_instances() {
    let device = device();
    let kept = triangle_blas(&device);
    let broken = triangle_blas(&device);
    let tlas = device
        .factory()
        .create_top_level_as(&TopLevelASDescriptor {
            instances: vec![Instance::new(kept.clone())],
            flags: AccelerationStructureFlags::ALLOW_UPDATE,
            ..Default::default()
        })
        .unwrap();

    broken.result_buffer().dispose();
    assert!(matches!(
        tlas.update(&[Instance::new(broken.clone())]),
        Err(GalError::InvalidState(_))
    ));
    let records = tlas.read_instances().unwrap();
    assert_eq!(records[0].blas_address, kept.device_address());
    let held = tlas.instances();
    assert_eq!(held.len(), 1);
    assert!(Arc::ptr_eq(&held[0], &kept));
}
