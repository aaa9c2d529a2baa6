mod common;

use lume_gal::{
    BindingResource, BufferDescriptor, BufferUsage, ContextConfig, GalError, ResourceKind,
    ResourceLayoutDescriptor, ResourceLayoutElement, ResourceSetDescriptor, SetEntry, ShaderStages,
    TextureDescriptor, TextureFormat, TextureUsage,
};

use common::{device, device_with};

#[test]
fn resource_sets_reject_wrong_counts_and_kinds() {
    let device = device();
    let factory = device.factory();
    let layout = factory
        .create_resource_layout(&ResourceLayoutDescriptor {
            label: Some("material"),
            elements: vec![
                ResourceLayoutElement::new(
                    "params",
                    ResourceKind::ConstantBuffer,
                    ShaderStages::FRAGMENT,
                ),
                ResourceLayoutElement::new(
                    "textures",
                    ResourceKind::SampledTexture,
                    ShaderStages::FRAGMENT,
                )
                .array(2),
            ],
        })
        .unwrap();
    let params = factory
        .create_buffer(&BufferDescriptor::new(256, BufferUsage::CONSTANT))
        .unwrap();
    let storage = factory
        .create_buffer(&BufferDescriptor::new(256, BufferUsage::STORAGE))
        .unwrap();
    let texture = factory
        .create_texture(&TextureDescriptor::new_2d(
            4,
            4,
            TextureFormat::Rgba8Unorm,
            TextureUsage::SAMPLED,
        ))
        .unwrap();
    let textures = vec![
        BindingResource::Texture(texture.clone()),
        BindingResource::Texture(texture.clone()),
    ];

    let missing_entry = factory.create_resource_set(&ResourceSetDescriptor {
        label: None,
        layout: layout.clone(),
        entries: vec![SetEntry::Single(BindingResource::buffer(&params))],
    });
    assert!(matches!(missing_entry, Err(GalError::BindingMismatch(_))));

    let short_array = factory.create_resource_set(&ResourceSetDescriptor {
        label: None,
        layout: layout.clone(),
        entries: vec![
            SetEntry::Single(BindingResource::buffer(&params)),
            SetEntry::Array(textures[..1].to_vec()),
        ],
    });
    assert!(matches!(short_array, Err(GalError::BindingMismatch(_))));

    let wrong_kind = factory.create_resource_set(&ResourceSetDescriptor {
        label: None,
        layout: layout.clone(),
        entries: vec![
            SetEntry::Single(BindingResource::Texture(texture.clone())),
            SetEntry::Array(textures.clone()),
        ],
    });
    assert!(matches!(wrong_kind, Err(GalError::BindingMismatch(_))));

    let wrong_usage = factory.create_resource_set(&ResourceSetDescriptor {
        label: None,
        layout: layout.clone(),
        entries: vec![
            SetEntry::Single(BindingResource::buffer(&storage)),
            SetEntry::Array(textures.clone()),
        ],
    });
    assert!(matches!(wrong_usage, Err(GalError::BindingMismatch(_))));

    let set = factory
        .create_resource_set(&ResourceSetDescriptor {
            label: Some("material"),
            layout,
            entries: vec![
                SetEntry::Single(BindingResource::buffer(&params)),
                SetEntry::Array(textures),
            ],
        })
        .unwrap();
    assert_eq!(set.populated(1), 2);
}

#[test]
fn bindless_slots_are_populated_by_update() {
    let device = device_with(ContextConfig {
        max_bindless_descriptors: 16,
        ..ContextConfig::default()
    });
    let factory = device.factory();
    let layout = factory
        .create_resource_layout(&ResourceLayoutDescriptor {
            label: Some("bindless textures"),
            elements: vec![ResourceLayoutElement::new(
                "textures",
                ResourceKind::SampledTexture,
                ShaderStages::FRAGMENT,
            )
            .bindless()],
        })
        .unwrap();
    assert_eq!(layout.slots()[0].capacity, 16);
    let set = factory
        .create_resource_set(&ResourceSetDescriptor {
            label: None,
            layout,
            entries: vec![SetEntry::Deferred],
        })
        .unwrap();
    assert_eq!(set.populated(0), 0);

    let texture = factory
        .create_texture(&TextureDescriptor::new_2d(
            8,
            8,
            TextureFormat::Rgba8Unorm,
            TextureUsage::SAMPLED,
        ))
        .unwrap();
    set.update(0, 5, BindingResource::Texture(texture.clone()))
        .unwrap();
    assert_eq!(set.populated(0), 1);
    assert!(set.get(0, 5).is_some());
    assert!(set.get(0, 4).is_none());

    let past_end = set.update(0, 16, BindingResource::Texture(texture));
    assert!(matches!(past_end, Err(GalError::BindingMismatch(_))));
}
