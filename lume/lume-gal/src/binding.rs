//! Binding model: resource layouts and the resource sets instantiated from them.
//!
//! A [`ResourceLayout`] is an ordered list of elements; element `i` is shader slot
//! `i`. Elements may be single bindings, fixed-size arrays, or unbounded (bindless)
//! arrays. A [`ResourceSet`] supplies concrete resources for every slot; array slots
//! can be left empty at creation and filled later with [`ResourceSet::update`].

use std::sync::{Arc, Mutex};

use crate::accel::TopLevelAS;
use crate::backend::{NativeHandle, ObjectKind};
use crate::buffer::{Buffer, BufferUsage};
use crate::context::Capabilities;
use crate::device::DeviceShared;
use crate::error::{GalError, GalResult};
use crate::resource::{Resource, ResourceBase};
use crate::sampler::Sampler;
use crate::shader::ShaderStages;
use crate::state::{ResourceState, Tracked};
use crate::texture::{Texture, TextureUsage, TextureView};

/// What a layout slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    ConstantBuffer,
    StorageBufferReadOnly,
    StorageBufferReadWrite,
    SampledTexture,
    StorageTexture,
    Sampler,
    AccelerationStructure,
}

impl ResourceKind {
    /// State a bound resource of this kind must be in when the GPU reads it.
    pub fn required_state(self) -> Option<ResourceState> {
        match self {
            ResourceKind::ConstantBuffer => Some(ResourceState::ConstantBuffer),
            ResourceKind::StorageBufferReadOnly | ResourceKind::SampledTexture => {
                Some(ResourceState::ShaderRead)
            }
            ResourceKind::StorageBufferReadWrite | ResourceKind::StorageTexture => {
                Some(ResourceState::UnorderedAccess)
            }
            ResourceKind::AccelerationStructure => Some(ResourceState::AccelerationStructureRead),
            ResourceKind::Sampler => None,
        }
    }

    pub fn is_sampler(self) -> bool {
        self == ResourceKind::Sampler
    }
}

/// Number of descriptors behind one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingCount {
    Fixed(u32),
    /// Runtime-sized array; capacity comes from `ContextConfig::max_bindless_descriptors`.
    Unbounded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLayoutElement {
    pub name: &'static str,
    pub kind: ResourceKind,
    pub stages: ShaderStages,
    pub count: BindingCount,
}

impl ResourceLayoutElement {
    pub fn new(name: &'static str, kind: ResourceKind, stages: ShaderStages) -> Self {
        Self {
            name,
            kind,
            stages,
            count: BindingCount::Fixed(1),
        }
    }

    pub fn array(mut self, count: u32) -> Self {
        self.count = BindingCount::Fixed(count);
        self
    }

    pub fn bindless(mut self) -> Self {
        self.count = BindingCount::Unbounded;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResourceLayoutDescriptor {
    pub label: Option<&'static str>,
    pub elements: Vec<ResourceLayoutElement>,
}

/// A layout element after slot assignment and capacity resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutSlot {
    pub slot: u32,
    pub kind: ResourceKind,
    pub stages: ShaderStages,
    /// Descriptors reserved for the slot.
    pub capacity: u32,
    /// Declared as an array (fixed or unbounded); may be partially bound.
    pub array: bool,
    /// Declared unbounded.
    pub bindless: bool,
}

impl ResourceLayoutDescriptor {
    /// Assigns slots in declaration order.
    pub(crate) fn resolve(
        &self,
        caps: &Capabilities,
        max_bindless: u32,
    ) -> GalResult<Vec<LayoutSlot>> {
        let last = self.elements.len().saturating_sub(1);
        let mut slots = Vec::with_capacity(self.elements.len());
        for (i, element) in self.elements.iter().enumerate() {
            if element.stages.is_empty() {
                return Err(GalError::descriptor(format!(
                    "layout element '{}' is visible to no shader stage",
                    element.name
                )));
            }
            if element.kind == ResourceKind::AccelerationStructure
                && !caps.acceleration_structures()
            {
                return Err(GalError::UnsupportedCapability(format!(
                    "layout element '{}' binds an acceleration structure but '{}' has no ray tracing or ray query",
                    element.name, caps.device_name
                )));
            }
            let (capacity, bindless) = match element.count {
                BindingCount::Fixed(0) => {
                    return Err(GalError::binding(format!(
                        "layout element '{}' declares a count of zero",
                        element.name
                    )))
                }
                BindingCount::Fixed(n) => (n, false),
                BindingCount::Unbounded => {
                    if !caps.bindless {
                        return Err(GalError::UnsupportedCapability(format!(
                            "unbounded array '{}' requires bindless support",
                            element.name
                        )));
                    }
                    if i != last {
                        return Err(GalError::binding(format!(
                            "unbounded array '{}' must be the last layout element",
                            element.name
                        )));
                    }
                    (max_bindless.min(caps.max_bindless_descriptors).max(1), true)
                }
            };
            slots.push(LayoutSlot {
                slot: i as u32,
                kind: element.kind,
                stages: element.stages,
                capacity,
                array: bindless || capacity > 1,
                bindless,
            });
        }
        Ok(slots)
    }
}

/// Immutable slot declaration shared by resource sets and pipelines.
pub struct ResourceLayout {
    base: ResourceBase,
    device: Arc<DeviceShared>,
    handle: NativeHandle,
    desc: ResourceLayoutDescriptor,
    slots: Vec<LayoutSlot>,
}

impl std::fmt::Debug for ResourceLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLayout")
            .field("id", &self.base.id())
            .field("slots", &self.slots)
            .finish_non_exhaustive()
    }
}

impl ResourceLayout {
    pub(crate) fn new(
        device: Arc<DeviceShared>,
        handle: NativeHandle,
        desc: ResourceLayoutDescriptor,
        slots: Vec<LayoutSlot>,
    ) -> Self {
        Self {
            base: ResourceBase::new("resource layout", desc.label),
            device,
            handle,
            desc,
            slots,
        }
    }

    pub fn descriptor(&self) -> &ResourceLayoutDescriptor {
        &self.desc
    }

    pub fn slots(&self) -> &[LayoutSlot] {
        &self.slots
    }

    /// Two layouts are interchangeable when their slots are identical.
    pub fn is_compatible(&self, other: &ResourceLayout) -> bool {
        std::ptr::eq(self, other) || self.slots == other.slots
    }

    pub(crate) fn native(&self) -> NativeHandle {
        self.handle
    }
}

impl Resource for ResourceLayout {
    fn base(&self) -> &ResourceBase {
        &self.base
    }

    fn dispose(&self) {
        if self.base.begin_dispose() {
            self.device.backend().destroy_resource_layout(self.handle);
        }
    }

    fn set_name(&self, name: &str) {
        self.base.set_name(name);
        self.device
            .backend()
            .set_debug_name(ObjectKind::ResourceLayout, self.handle, name);
    }
}

impl Drop for ResourceLayout {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Range of a buffer bound to a slot.
#[derive(Debug, Clone)]
pub struct BufferBinding {
    pub buffer: Arc<Buffer>,
    pub offset: u64,
    /// `None` binds to the end of the buffer.
    pub size: Option<u64>,
}

/// Concrete resource supplied for one descriptor.
#[derive(Debug, Clone)]
pub enum BindingResource {
    Buffer(BufferBinding),
    Texture(Arc<Texture>),
    TextureView(Arc<TextureView>),
    Sampler(Arc<Sampler>),
    AccelerationStructure(Arc<TopLevelAS>),
}

impl BindingResource {
    /// Binds the whole buffer.
    pub fn buffer(buffer: &Arc<Buffer>) -> Self {
        BindingResource::Buffer(BufferBinding {
            buffer: buffer.clone(),
            offset: 0,
            size: None,
        })
    }

    fn describe(&self) -> &'static str {
        match self {
            BindingResource::Buffer(_) => "buffer",
            BindingResource::Texture(_) => "texture",
            BindingResource::TextureView(_) => "texture view",
            BindingResource::Sampler(_) => "sampler",
            BindingResource::AccelerationStructure(_) => "acceleration structure",
        }
    }

    /// Checks that this resource can fill a slot of `kind`.
    pub(crate) fn check_kind(&self, kind: ResourceKind) -> GalResult<()> {
        self.as_resource().base().ensure_alive()?;
        let mismatch = || {
            GalError::binding(format!(
                "{} cannot be bound to a {kind:?} slot",
                self.describe()
            ))
        };
        match (kind, self) {
            (ResourceKind::ConstantBuffer, BindingResource::Buffer(b)) => {
                check_buffer_usage(b, BufferUsage::CONSTANT, kind)
            }
            (
                ResourceKind::StorageBufferReadOnly | ResourceKind::StorageBufferReadWrite,
                BindingResource::Buffer(b),
            ) => check_buffer_usage(b, BufferUsage::STORAGE, kind),
            (ResourceKind::SampledTexture, BindingResource::Texture(t)) => {
                check_texture_usage(t, TextureUsage::SAMPLED, kind)
            }
            (ResourceKind::SampledTexture, BindingResource::TextureView(v)) => {
                check_texture_usage(v.texture(), TextureUsage::SAMPLED, kind)
            }
            (ResourceKind::StorageTexture, BindingResource::Texture(t)) => {
                check_texture_usage(t, TextureUsage::STORAGE, kind)
            }
            (ResourceKind::StorageTexture, BindingResource::TextureView(v)) => {
                check_texture_usage(v.texture(), TextureUsage::STORAGE, kind)
            }
            (ResourceKind::Sampler, BindingResource::Sampler(_)) => Ok(()),
            (ResourceKind::AccelerationStructure, BindingResource::AccelerationStructure(_)) => {
                Ok(())
            }
            _ => Err(mismatch()),
        }
    }

    pub(crate) fn native(&self) -> NativeBinding {
        match self {
            BindingResource::Buffer(b) => NativeBinding::Buffer {
                buffer: b.buffer.native(),
                offset: b.offset,
                size: b.size.unwrap_or(b.buffer.size() - b.offset),
            },
            BindingResource::Texture(t) => NativeBinding::Texture(t.native()),
            BindingResource::TextureView(v) => NativeBinding::TextureView(v.native()),
            BindingResource::Sampler(s) => NativeBinding::Sampler(s.native()),
            BindingResource::AccelerationStructure(a) => {
                NativeBinding::AccelerationStructure(a.native())
            }
        }
    }

    pub(crate) fn as_resource(&self) -> Arc<dyn Resource> {
        match self {
            BindingResource::Buffer(b) => b.buffer.clone(),
            BindingResource::Texture(t) => t.clone(),
            BindingResource::TextureView(v) => v.clone(),
            BindingResource::Sampler(s) => s.clone(),
            BindingResource::AccelerationStructure(a) => a.clone(),
        }
    }

    /// The state-tracked resource behind this binding, if any.
    pub(crate) fn tracked(&self) -> Option<Arc<dyn Tracked>> {
        match self {
            BindingResource::Buffer(b) => Some(b.buffer.clone()),
            BindingResource::Texture(t) => Some(t.clone()),
            BindingResource::TextureView(v) => Some(v.texture().clone()),
            BindingResource::Sampler(_) => None,
            BindingResource::AccelerationStructure(a) => Some(a.result_buffer().clone()),
        }
    }
}

fn check_buffer_usage(
    binding: &BufferBinding,
    usage: BufferUsage,
    kind: ResourceKind,
) -> GalResult<()> {
    if !binding.buffer.usage().contains(usage) {
        return Err(GalError::binding(format!(
            "buffer without {usage:?} usage bound to a {kind:?} slot"
        )));
    }
    let size = binding
        .size
        .unwrap_or(binding.buffer.size().saturating_sub(binding.offset));
    if size == 0 {
        return Err(GalError::binding("buffer binding covers zero bytes"));
    }
    binding.buffer.check_range(binding.offset, size)
}

fn check_texture_usage(texture: &Texture, usage: TextureUsage, kind: ResourceKind) -> GalResult<()> {
    if !texture.usage().contains(usage) {
        return Err(GalError::binding(format!(
            "texture without {usage:?} usage bound to a {kind:?} slot"
        )));
    }
    Ok(())
}

/// Native form of a binding, handed to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeBinding {
    Buffer {
        buffer: NativeHandle,
        offset: u64,
        size: u64,
    },
    Texture(NativeHandle),
    TextureView(NativeHandle),
    Sampler(NativeHandle),
    AccelerationStructure(NativeHandle),
}

/// One descriptor write: `binding` into element `index` of `slot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingWrite {
    pub slot: u32,
    pub index: u32,
    pub kind: ResourceKind,
    pub binding: NativeBinding,
}

/// Resources supplied for one slot at set creation.
#[derive(Debug, Clone)]
pub enum SetEntry {
    Single(BindingResource),
    /// The full array for a fixed slot, or a prefix of an unbounded slot.
    Array(Vec<BindingResource>),
    /// Array slot left empty, to be populated with `ResourceSet::update`.
    Deferred,
}

#[derive(Debug, Clone)]
pub struct ResourceSetDescriptor {
    pub label: Option<&'static str>,
    pub layout: Arc<ResourceLayout>,
    pub entries: Vec<SetEntry>,
}

impl ResourceSetDescriptor {
    /// Validates entries against the layout and flattens them into descriptor writes.
    pub(crate) fn resolve(&self) -> GalResult<(Vec<Vec<Option<BindingResource>>>, Vec<BindingWrite>)> {
        self.layout.base.ensure_alive()?;
        let slots = self.layout.slots();
        if self.entries.len() != slots.len() {
            return Err(GalError::binding(format!(
                "layout declares {} slots but {} entries were supplied",
                slots.len(),
                self.entries.len()
            )));
        }
        let mut bound = Vec::with_capacity(slots.len());
        let mut writes = Vec::new();
        for (slot, entry) in slots.iter().zip(&self.entries) {
            let resources: Vec<BindingResource> = match entry {
                SetEntry::Single(resource) if !slot.array => vec![resource.clone()],
                SetEntry::Single(_) => {
                    return Err(GalError::binding(format!(
                        "slot {} is an array of {}; supply an array or defer it",
                        slot.slot, slot.capacity
                    )))
                }
                SetEntry::Array(items) if slot.bindless => {
                    if items.len() > slot.capacity as usize {
                        return Err(GalError::binding(format!(
                            "{} resources exceed bindless slot {} capacity {}",
                            items.len(),
                            slot.slot,
                            slot.capacity
                        )));
                    }
                    items.clone()
                }
                SetEntry::Array(items) => {
                    if items.len() != slot.capacity as usize {
                        return Err(GalError::binding(format!(
                            "slot {} expects {} resources, got {}",
                            slot.slot,
                            slot.capacity,
                            items.len()
                        )));
                    }
                    items.clone()
                }
                SetEntry::Deferred if slot.array => Vec::new(),
                SetEntry::Deferred => {
                    return Err(GalError::binding(format!(
                        "single slot {} cannot be deferred",
                        slot.slot
                    )))
                }
            };
            let mut elements = vec![None; slot.capacity as usize];
            for (index, resource) in resources.into_iter().enumerate() {
                resource.check_kind(slot.kind).map_err(|e| at_slot(e, slot.slot, index))?;
                writes.push(BindingWrite {
                    slot: slot.slot,
                    index: index as u32,
                    kind: slot.kind,
                    binding: resource.native(),
                });
                elements[index] = Some(resource);
            }
            bound.push(elements);
        }
        Ok((bound, writes))
    }
}

fn at_slot(err: GalError, slot: u32, index: usize) -> GalError {
    match err {
        GalError::BindingMismatch(msg) => {
            GalError::BindingMismatch(format!("slot {slot}[{index}]: {msg}"))
        }
        other => other,
    }
}

/// Concrete resources bound to a layout's slots.
pub struct ResourceSet {
    base: ResourceBase,
    device: Arc<DeviceShared>,
    handle: NativeHandle,
    layout: Arc<ResourceLayout>,
    bound: Mutex<Vec<Vec<Option<BindingResource>>>>,
}

impl std::fmt::Debug for ResourceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceSet")
            .field("id", &self.base.id())
            .field("layout", &self.layout.id())
            .finish_non_exhaustive()
    }
}

impl ResourceSet {
    pub(crate) fn new(
        device: Arc<DeviceShared>,
        handle: NativeHandle,
        label: Option<&'static str>,
        layout: Arc<ResourceLayout>,
        bound: Vec<Vec<Option<BindingResource>>>,
    ) -> Self {
        Self {
            base: ResourceBase::new("resource set", label),
            device,
            handle,
            layout,
            bound: Mutex::new(bound),
        }
    }

    pub fn layout(&self) -> &Arc<ResourceLayout> {
        &self.layout
    }

    pub(crate) fn native(&self) -> NativeHandle {
        self.handle
    }

    /// Replaces element `index` of array slot `slot` without recreating the set.
    pub fn update(&self, slot: u32, index: u32, resource: BindingResource) -> GalResult<()> {
        self.update_range(slot, index, std::slice::from_ref(&resource))
    }

    /// Replaces `resources.len()` consecutive elements of array slot `slot`, starting at `first`.
    pub fn update_range(&self, slot: u32, first: u32, resources: &[BindingResource]) -> GalResult<()> {
        self.base.ensure_alive()?;
        let layout_slot = self
            .layout
            .slots()
            .get(slot as usize)
            .copied()
            .ok_or_else(|| GalError::binding(format!("layout has no slot {slot}")))?;
        if !layout_slot.array {
            return Err(GalError::binding(format!(
                "slot {slot} is not an array; create a new set to rebind it"
            )));
        }
        let end = first as u64 + resources.len() as u64;
        if end > layout_slot.capacity as u64 {
            return Err(GalError::binding(format!(
                "update of slot {slot} elements {first}..{end} exceeds capacity {}",
                layout_slot.capacity
            )));
        }
        let mut writes = Vec::with_capacity(resources.len());
        for (i, resource) in resources.iter().enumerate() {
            let index = first + i as u32;
            resource
                .check_kind(layout_slot.kind)
                .map_err(|e| at_slot(e, slot, index as usize))?;
            writes.push(BindingWrite {
                slot,
                index,
                kind: layout_slot.kind,
                binding: resource.native(),
            });
        }
        self.device.backend().update_resource_set(self.handle, &writes)?;

        let mut bound = self.lock();
        for (i, resource) in resources.iter().enumerate() {
            bound[slot as usize][first as usize + i] = Some(resource.clone());
        }
        Ok(())
    }

    /// Element `index` of `slot`, if populated.
    pub fn get(&self, slot: u32, index: u32) -> Option<BindingResource> {
        self.lock()
            .get(slot as usize)
            .and_then(|elements| elements.get(index as usize).cloned().flatten())
    }

    /// Number of populated elements in `slot`.
    pub fn populated(&self, slot: u32) -> usize {
        self.lock()
            .get(slot as usize)
            .map_or(0, |elements| elements.iter().filter(|e| e.is_some()).count())
    }

    /// Calls `f` with every populated binding and the kind of its slot.
    pub(crate) fn for_each_binding(&self, mut f: impl FnMut(ResourceKind, &BindingResource)) {
        let bound = self.lock();
        for (slot, elements) in self.layout.slots().iter().zip(bound.iter()) {
            for resource in elements.iter().flatten() {
                f(slot.kind, resource);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Vec<Option<BindingResource>>>> {
        self.bound.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Resource for ResourceSet {
    fn base(&self) -> &ResourceBase {
        &self.base
    }

    fn dispose(&self) {
        if self.base.begin_dispose() {
            self.device.wait_for_usage(&self.base);
            self.device.backend().destroy_resource_set(self.handle);
        }
    }

    fn set_name(&self, name: &str) {
        self.base.set_name(name);
        self.device
            .backend()
            .set_debug_name(ObjectKind::ResourceSet, self.handle, name);
    }
}

impl Drop for ResourceSet {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;

    fn caps() -> Capabilities {
        crate::headless::adapter_info(&ContextConfig::default()).capabilities
    }

    fn element(kind: ResourceKind) -> ResourceLayoutElement {
        ResourceLayoutElement::new("e", kind, ShaderStages::FRAGMENT)
    }

    #[test]
    fn slots_follow_declaration_order() {
        let desc = ResourceLayoutDescriptor {
            label: None,
            elements: vec![
                element(ResourceKind::ConstantBuffer),
                element(ResourceKind::Sampler).array(4),
                element(ResourceKind::SampledTexture).bindless(),
            ],
        };
        let slots = desc.resolve(&caps(), 1024).unwrap();
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0].slot, 0);
        assert!(!slots[0].array);
        assert_eq!(slots[1].capacity, 4);
        assert!(slots[1].array && !slots[1].bindless);
        assert_eq!(slots[2].capacity, 1024);
        assert!(slots[2].bindless);
    }

    #[test]
    fn zero_counts_are_rejected() {
        let desc = ResourceLayoutDescriptor {
            label: None,
            elements: vec![element(ResourceKind::SampledTexture).array(0)],
        };
        assert!(matches!(
            desc.resolve(&caps(), 16),
            Err(GalError::BindingMismatch(_))
        ));
    }

    #[test]
    fn unbounded_must_come_last() {
        let desc = ResourceLayoutDescriptor {
            label: None,
            elements: vec![
                element(ResourceKind::SampledTexture).bindless(),
                element(ResourceKind::Sampler),
            ],
        };
        assert!(matches!(
            desc.resolve(&caps(), 16),
            Err(GalError::BindingMismatch(_))
        ));
    }

    #[test]
    fn bindless_needs_capability() {
        let mut caps = caps();
        caps.bindless = false;
        let desc = ResourceLayoutDescriptor {
            label: None,
            elements: vec![element(ResourceKind::SampledTexture).bindless()],
        };
        assert!(matches!(
            desc.resolve(&caps, 16),
            Err(GalError::UnsupportedCapability(_))
        ));
    }

    #[test]
    fn acceleration_structure_slots_need_ray_support() {
        let mut caps = caps();
        caps.ray_query = false;
        caps.ray_tracing = false;
        let desc = ResourceLayoutDescriptor {
            label: None,
            elements: vec![element(ResourceKind::AccelerationStructure)],
        };
        assert!(matches!(
            desc.resolve(&caps, 16),
            Err(GalError::UnsupportedCapability(_))
        ));
    }

    #[test]
    fn bindless_capacity_is_clamped_to_device() {
        let mut caps = caps();
        caps.max_bindless_descriptors = 64;
        let desc = ResourceLayoutDescriptor {
            label: None,
            elements: vec![element(ResourceKind::SampledTexture).bindless()],
        };
        assert_eq!(desc.resolve(&caps, 4096).unwrap()[0].capacity, 64);
    }
}
