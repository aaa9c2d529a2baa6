//! Host memory arena.
//!
//! A [`MemoryArena`] owns a set of zero-initialised, 8-byte aligned blocks for as long
//! as its owner lives. Blocks are addressed through small copyable [`ArenaBlock`]
//! handles; every access goes through bounds-checked accessors, so code that has to
//! hand raw structs to a backend (instance records, descriptor payloads, emulated
//! device memory) never does pointer arithmetic itself. Dropping the arena frees
//! every block it still owns.

use std::marker::PhantomData;
use std::sync::Mutex;

use bytemuck::Pod;

use crate::error::{GalError, GalResult};

/// Alignment guaranteed for the start of every block.
pub const ARENA_ALIGNMENT: usize = 8;

/// Handle to one block of a [`MemoryArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ArenaBlock {
    index: u32,
    generation: u32,
    len: u64,
}

impl ArenaBlock {
    /// Size of the block in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Block holding `len` values of `T`.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct TypedBlock<T> {
    block: ArenaBlock,
    len: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for TypedBlock<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TypedBlock<T> {}

impl<T: Pod> TypedBlock<T> {
    /// Number of `T` elements in the block.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn block(&self) -> ArenaBlock {
        self.block
    }

    /// Reads element `index`.
    pub fn get(&self, arena: &MemoryArena, index: usize) -> GalResult<T> {
        self.check_index(index)?;
        let mut value = T::zeroed();
        arena.read(
            self.block,
            (index * std::mem::size_of::<T>()) as u64,
            bytemuck::bytes_of_mut(&mut value),
        )?;
        Ok(value)
    }

    /// Overwrites element `index`.
    pub fn set(&self, arena: &MemoryArena, index: usize, value: T) -> GalResult<()> {
        self.check_index(index)?;
        arena.write(
            self.block,
            (index * std::mem::size_of::<T>()) as u64,
            bytemuck::bytes_of(&value),
        )
    }

    /// Copies every element out of the arena.
    pub fn to_vec(&self, arena: &MemoryArena) -> GalResult<Vec<T>> {
        let mut out = vec![T::zeroed(); self.len];
        arena.read(self.block, 0, bytemuck::cast_slice_mut(&mut out))?;
        Ok(out)
    }

    fn check_index(&self, index: usize) -> GalResult<()> {
        if index >= self.len {
            return Err(GalError::descriptor(format!(
                "arena element {index} out of bounds (len {})",
                self.len
            )));
        }
        Ok(())
    }
}

#[derive(Default)]
struct Slot {
    generation: u32,
    words: Option<Box<[u64]>>,
}

#[derive(Default)]
struct ArenaInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live_bytes: u64,
}

/// Owner of host memory blocks with a fixed lifetime.
pub struct MemoryArena {
    label: &'static str,
    budget: Option<u64>,
    inner: Mutex<ArenaInner>,
}

impl std::fmt::Debug for MemoryArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryArena")
            .field("label", &self.label)
            .field("live_bytes", &self.live_bytes())
            .finish_non_exhaustive()
    }
}

impl MemoryArena {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            budget: None,
            inner: Mutex::new(ArenaInner::default()),
        }
    }

    /// Arena that refuses allocations once `budget` live bytes are reached.
    pub fn with_budget(label: &'static str, budget: u64) -> Self {
        Self {
            label,
            budget: Some(budget),
            inner: Mutex::new(ArenaInner::default()),
        }
    }

    /// Bytes currently owned by live blocks.
    pub fn live_bytes(&self) -> u64 {
        self.lock().live_bytes
    }

    /// Number of live blocks.
    pub fn block_count(&self) -> usize {
        self.lock().slots.iter().filter(|s| s.words.is_some()).count()
    }

    /// Allocates a zero-filled block of `len` bytes.
    pub fn allocate(&self, len: u64) -> GalResult<ArenaBlock> {
        let mut inner = self.lock();
        if let Some(budget) = self.budget {
            if inner.live_bytes.saturating_add(len) > budget {
                return Err(GalError::oom(self.label, len));
            }
        }
        let words = usize::try_from(len.div_ceil(ARENA_ALIGNMENT as u64))
            .map_err(|_| GalError::oom(self.label, len))?;
        let storage = vec![0u64; words].into_boxed_slice();

        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                inner.slots.push(Slot::default());
                (inner.slots.len() - 1) as u32
            }
        };
        let slot = &mut inner.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        slot.words = Some(storage);
        let generation = slot.generation;
        inner.live_bytes += len;
        Ok(ArenaBlock {
            index,
            generation,
            len,
        })
    }

    /// Allocates a block and fills it with `items`.
    pub fn allocate_slice<T: Pod>(&self, items: &[T]) -> GalResult<TypedBlock<T>> {
        if std::mem::align_of::<T>() > ARENA_ALIGNMENT {
            return Err(GalError::descriptor(format!(
                "arena cannot hold values aligned to {} bytes",
                std::mem::align_of::<T>()
            )));
        }
        let bytes: &[u8] = bytemuck::cast_slice(items);
        let block = self.allocate(bytes.len() as u64)?;
        self.write(block, 0, bytes)?;
        Ok(TypedBlock {
            block,
            len: items.len(),
            _marker: PhantomData,
        })
    }

    /// Frees a block. Releasing a stale handle does nothing.
    pub fn release(&self, block: ArenaBlock) {
        let mut inner = self.lock();
        let Some(slot) = inner.slots.get_mut(block.index as usize) else {
            return;
        };
        if slot.generation != block.generation || slot.words.is_none() {
            return;
        }
        slot.words = None;
        inner.live_bytes -= block.len;
        inner.free.push(block.index);
    }

    /// Copies `data` into the block at `offset`.
    pub fn write(&self, block: ArenaBlock, offset: u64, data: &[u8]) -> GalResult<()> {
        self.with_bytes_mut(block, |bytes| {
            let range = checked_range(block, offset, data.len() as u64)?;
            bytes[range].copy_from_slice(data);
            Ok(())
        })?
    }

    /// Fills `out` from the block at `offset`.
    pub fn read(&self, block: ArenaBlock, offset: u64, out: &mut [u8]) -> GalResult<()> {
        self.with_bytes(block, |bytes| {
            let range = checked_range(block, offset, out.len() as u64)?;
            out.copy_from_slice(&bytes[range]);
            Ok(())
        })?
    }

    /// Reads `len` bytes starting at `offset` into a new vector.
    pub fn read_vec(&self, block: ArenaBlock, offset: u64, len: u64) -> GalResult<Vec<u8>> {
        let mut out = vec![0u8; len as usize];
        self.read(block, offset, &mut out)?;
        Ok(out)
    }

    /// Copies bytes between two blocks of this arena (possibly the same block).
    pub fn copy(
        &self,
        src: ArenaBlock,
        src_offset: u64,
        dst: ArenaBlock,
        dst_offset: u64,
        len: u64,
    ) -> GalResult<()> {
        let staged = self.read_vec(src, src_offset, len)?;
        self.write(dst, dst_offset, &staged)
    }

    /// Runs `f` with a shared view of the whole block.
    pub fn with_bytes<R>(&self, block: ArenaBlock, f: impl FnOnce(&[u8]) -> R) -> GalResult<R> {
        let inner = self.lock();
        let words = live_words(&inner, block)?;
        let bytes: &[u8] = bytemuck::cast_slice(words);
        Ok(f(&bytes[..block.len as usize]))
    }

    /// Runs `f` with a mutable view of the whole block.
    pub fn with_bytes_mut<R>(
        &self,
        block: ArenaBlock,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> GalResult<R> {
        let mut inner = self.lock();
        let slot = inner
            .slots
            .get_mut(block.index as usize)
            .filter(|s| s.generation == block.generation)
            .and_then(|s| s.words.as_deref_mut())
            .ok_or_else(|| GalError::invalid_state("arena block was released"))?;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(slot);
        Ok(f(&mut bytes[..block.len as usize]))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ArenaInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for MemoryArena {
    fn drop(&mut self) {
        let live = self.live_bytes();
        if live > 0 {
            log::debug!("arena '{}' released {} live bytes", self.label, live);
        }
    }
}

fn live_words(inner: &ArenaInner, block: ArenaBlock) -> GalResult<&[u64]> {
    inner
        .slots
        .get(block.index as usize)
        .filter(|s| s.generation == block.generation)
        .and_then(|s| s.words.as_deref())
        .ok_or_else(|| GalError::invalid_state("arena block was released"))
}

fn checked_range(block: ArenaBlock, offset: u64, len: u64) -> GalResult<std::ops::Range<usize>> {
    let end = offset
        .checked_add(len)
        .filter(|end| *end <= block.len)
        .ok_or_else(|| {
            GalError::descriptor(format!(
                "range {offset}..{} exceeds arena block of {} bytes",
                offset.saturating_add(len),
                block.len
            ))
        })?;
    Ok(offset as usize..end as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_are_zeroed_and_bounds_checked() {
        let arena = MemoryArena::new("test");
        let block = arena.allocate(12).unwrap();
        assert_eq!(arena.read_vec(block, 0, 12).unwrap(), vec![0u8; 12]);

        arena.write(block, 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(arena.read_vec(block, 4, 4).unwrap(), vec![1, 2, 3, 4]);

        assert!(matches!(
            arena.write(block, 10, &[0; 4]),
            Err(GalError::InvalidDescriptor(_))
        ));
        assert!(arena.read_vec(block, u64::MAX, 2).is_err());
    }

    #[test]
    fn typed_blocks_round_trip_elements() {
        let arena = MemoryArena::new("typed");
        let block = arena.allocate_slice(&[1u32, 2, 3]).unwrap();
        assert_eq!(block.len(), 3);
        block.set(&arena, 1, 20).unwrap();
        assert_eq!(block.to_vec(&arena).unwrap(), vec![1, 20, 3]);
        assert!(block.get(&arena, 3).is_err());
    }

    #[test]
    fn released_handles_become_stale() {
        let arena = MemoryArena::new("stale");
        let first = arena.allocate(16).unwrap();
        arena.release(first);
        arena.release(first);
        assert_eq!(arena.live_bytes(), 0);

        let second = arena.allocate(16).unwrap();
        assert_ne!(first, second);
        assert!(matches!(
            arena.read_vec(first, 0, 1),
            Err(GalError::InvalidState(_))
        ));
        assert!(arena.read_vec(second, 0, 16).is_ok());
    }

    #[test]
    fn budget_reports_allocation_failure() {
        let arena = MemoryArena::with_budget("budget", 64);
        let block = arena.allocate(48).unwrap();
        assert!(matches!(
            arena.allocate(32),
            Err(GalError::AllocationFailure { size: 32, .. })
        ));
        arena.release(block);
        assert!(arena.allocate(32).is_ok());
    }

    #[test]
    fn copy_within_one_block() {
        let arena = MemoryArena::new("copy");
        let block = arena.allocate(8).unwrap();
        arena.write(block, 0, &[9, 8, 7, 6]).unwrap();
        arena.copy(block, 0, block, 4, 4).unwrap();
        assert_eq!(arena.read_vec(block, 0, 8).unwrap(), vec![9, 8, 7, 6, 9, 8, 7, 6]);
    }
}
