//! Shader-visible descriptor heaps and the root tables carved out of them.
//!
//! A resource layout becomes a root signature: one range of resource descriptors
//! and one range of sampler descriptors, with a fixed offset per slot. A resource
//! set is a descriptor table: the pair of ranges allocated from the two heaps.

use std::collections::HashMap;
use std::ops::Range;

use crate::binding::{BindingWrite, LayoutSlot, NativeBinding, ResourceKind};
use crate::error::{GalError, GalResult};

/// First-fit allocator of descriptor ranges with sparse storage.
#[derive(Debug)]
pub(crate) struct DescriptorHeap {
    label: &'static str,
    capacity: u32,
    /// Free ranges as (start, len), sorted by start.
    free: Vec<(u32, u32)>,
    descriptors: HashMap<u32, NativeBinding>,
}

impl DescriptorHeap {
    pub fn new(label: &'static str, capacity: u32) -> Self {
        Self {
            label,
            capacity,
            free: vec![(0, capacity)],
            descriptors: HashMap::new(),
        }
    }

    pub fn allocate(&mut self, len: u32) -> GalResult<u32> {
        if len == 0 {
            return Ok(0);
        }
        let index = self
            .free
            .iter()
            .position(|&(_, free)| free >= len)
            .ok_or_else(|| GalError::oom(format!("{} descriptors", self.label), len as u64))?;
        let (start, free) = self.free[index];
        if free == len {
            self.free.remove(index);
        } else {
            self.free[index] = (start + len, free - len);
        }
        Ok(start)
    }

    pub fn release(&mut self, start: u32, len: u32) {
        if len == 0 {
            return;
        }
        self.descriptors.retain(|&i, _| i < start || i >= start + len);
        let index = self.free.partition_point(|&(s, _)| s < start);
        self.free.insert(index, (start, len));
        // Coalesce with the neighbours.
        if index + 1 < self.free.len() {
            let (s, l) = self.free[index];
            let (next, next_len) = self.free[index + 1];
            if s + l == next {
                self.free[index].1 += next_len;
                self.free.remove(index + 1);
            }
        }
        if index > 0 {
            let (prev, prev_len) = self.free[index - 1];
            let (s, l) = self.free[index];
            if prev + prev_len == s {
                self.free[index - 1].1 += l;
                self.free.remove(index);
            }
        }
    }

    pub fn write(&mut self, index: u32, binding: NativeBinding) {
        self.descriptors.insert(index, binding);
    }

    pub fn get(&self, index: u32) -> Option<NativeBinding> {
        self.descriptors.get(&index).copied()
    }

    /// Descriptors not handed out to any table.
    pub fn available(&self) -> u32 {
        self.free.iter().map(|&(_, len)| len).sum()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// Where one layout slot lives inside a descriptor table.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlotRange {
    pub kind: ResourceKind,
    pub offset: u32,
    pub capacity: u32,
    pub partially_bound: bool,
}

impl SlotRange {
    fn heap(&self) -> HeapKind {
        if self.kind.is_sampler() {
            HeapKind::Sampler
        } else {
            HeapKind::Resource
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeapKind {
    Resource,
    Sampler,
}

/// A resource layout translated into per-heap table sizes.
#[derive(Debug, Clone)]
pub(crate) struct RootSignature {
    pub slots: Vec<SlotRange>,
    pub resource_count: u32,
    pub sampler_count: u32,
}

impl RootSignature {
    pub fn new(slots: &[LayoutSlot]) -> Self {
        let mut resource_count = 0;
        let mut sampler_count = 0;
        let slots = slots
            .iter()
            .map(|slot| {
                let counter = if slot.kind.is_sampler() {
                    &mut sampler_count
                } else {
                    &mut resource_count
                };
                let range = SlotRange {
                    kind: slot.kind,
                    offset: *counter,
                    capacity: slot.capacity,
                    partially_bound: slot.array,
                };
                *counter += slot.capacity;
                range
            })
            .collect();
        Self {
            slots,
            resource_count,
            sampler_count,
        }
    }

    /// Heap and absolute descriptor index of `write` in a table based at `bases`.
    pub fn locate(&self, bases: (u32, u32), write: &BindingWrite) -> GalResult<(HeapKind, u32)> {
        let slot = self.slots.get(write.slot as usize).ok_or_else(|| {
            GalError::binding(format!("root signature has no slot {}", write.slot))
        })?;
        if write.kind != slot.kind {
            return Err(GalError::binding(format!(
                "{:?} descriptor written to {:?} slot {}",
                write.kind, slot.kind, write.slot
            )));
        }
        if write.index >= slot.capacity {
            return Err(GalError::binding(format!(
                "descriptor {} outside slot {} capacity {}",
                write.index, write.slot, slot.capacity
            )));
        }
        let heap = slot.heap();
        let base = match heap {
            HeapKind::Resource => bases.0,
            HeapKind::Sampler => bases.1,
        };
        Ok((heap, base + slot.offset + write.index))
    }
}

/// Descriptor table allocated for one resource set.
#[derive(Debug, Clone)]
pub(crate) struct DescriptorTable {
    pub root: crate::backend::NativeHandle,
    pub signature: RootSignature,
    pub resource_base: u32,
    pub sampler_base: u32,
}

impl DescriptorTable {
    pub fn bases(&self) -> (u32, u32) {
        (self.resource_base, self.sampler_base)
    }

    fn base(&self, heap: HeapKind) -> u32 {
        match heap {
            HeapKind::Resource => self.resource_base,
            HeapKind::Sampler => self.sampler_base,
        }
    }

    /// Every (slot kind, heap, absolute index) the table spans.
    pub fn entries(&self) -> impl Iterator<Item = (ResourceKind, HeapKind, u32)> + '_ {
        self.signature.slots.iter().flat_map(move |slot| {
            let start = self.base(slot.heap()) + slot.offset;
            (start..start + slot.capacity).map(move |i| (slot.kind, slot.heap(), i))
        })
    }

    /// Heap ranges of the slots that must be fully populated before the table is bound.
    pub fn required(&self) -> impl Iterator<Item = (u32, HeapKind, Range<u32>)> + '_ {
        self.signature
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.partially_bound)
            .map(|(i, slot)| {
                let start = self.base(slot.heap()) + slot.offset;
                (i as u32, slot.heap(), start..start + slot.capacity)
            })
    }
}

/// Checks that a native binding is of the shape a slot kind expects.
pub(crate) fn check_binding(kind: ResourceKind, binding: &NativeBinding) -> GalResult<()> {
    let ok = match kind {
        ResourceKind::ConstantBuffer
        | ResourceKind::StorageBufferReadOnly
        | ResourceKind::StorageBufferReadWrite => matches!(binding, NativeBinding::Buffer { .. }),
        ResourceKind::SampledTexture | ResourceKind::StorageTexture => matches!(
            binding,
            NativeBinding::Texture(_) | NativeBinding::TextureView(_)
        ),
        ResourceKind::Sampler => matches!(binding, NativeBinding::Sampler(_)),
        ResourceKind::AccelerationStructure => {
            matches!(binding, NativeBinding::AccelerationStructure(_))
        }
    };
    if ok {
        Ok(())
    } else {
        Err(GalError::binding(format!(
            "{binding:?} cannot fill a {kind:?} descriptor"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NativeHandle;
    use crate::shader::ShaderStages;

    fn slot(slot: u32, kind: ResourceKind, capacity: u32) -> LayoutSlot {
        LayoutSlot {
            slot,
            kind,
            stages: ShaderStages::COMPUTE,
            capacity,
            array: capacity > 1,
            bindless: false,
        }
    }

    #[test]
    fn heap_reuses_released_ranges() {
        let mut heap = DescriptorHeap::new("resource", 10);
        let a = heap.allocate(4).unwrap();
        let b = heap.allocate(4).unwrap();
        assert_eq!((a, b), (0, 4));
        assert!(matches!(
            heap.allocate(4),
            Err(GalError::AllocationFailure { .. })
        ));
        heap.release(a, 4);
        heap.release(b, 4);
        assert_eq!(heap.available(), 10);
        assert_eq!(heap.allocate(10).unwrap(), 0);
    }

    #[test]
    fn released_descriptors_are_cleared() {
        let mut heap = DescriptorHeap::new("sampler", 4);
        let start = heap.allocate(2).unwrap();
        heap.write(start + 1, NativeBinding::Sampler(NativeHandle(3)));
        heap.release(start, 2);
        assert_eq!(heap.get(start + 1), None);
    }

    #[test]
    fn samplers_get_their_own_range() {
        let signature = RootSignature::new(&[
            slot(0, ResourceKind::ConstantBuffer, 1),
            slot(1, ResourceKind::Sampler, 2),
            slot(2, ResourceKind::SampledTexture, 8),
        ]);
        assert_eq!(signature.resource_count, 9);
        assert_eq!(signature.sampler_count, 2);
        let write = BindingWrite {
            slot: 2,
            index: 3,
            kind: ResourceKind::SampledTexture,
            binding: NativeBinding::Texture(NativeHandle(1)),
        };
        assert_eq!(
            signature.locate((100, 50), &write).unwrap(),
            (HeapKind::Resource, 104)
        );
        let sampler = BindingWrite {
            slot: 1,
            index: 1,
            kind: ResourceKind::Sampler,
            binding: NativeBinding::Sampler(NativeHandle(2)),
        };
        assert_eq!(
            signature.locate((100, 50), &sampler).unwrap(),
            (HeapKind::Sampler, 51)
        );
    }

    #[test]
    fn writes_outside_a_slot_are_rejected() {
        let signature = RootSignature::new(&[slot(0, ResourceKind::StorageTexture, 2)]);
        let write = BindingWrite {
            slot: 0,
            index: 2,
            kind: ResourceKind::StorageTexture,
            binding: NativeBinding::Texture(NativeHandle(1)),
        };
        assert!(matches!(
            signature.locate((0, 0), &write),
            Err(GalError::BindingMismatch(_))
        ));
        assert!(check_binding(ResourceKind::Sampler, &write.binding).is_err());
    }
}
