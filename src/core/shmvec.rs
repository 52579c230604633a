//! Reference-counted, resizable typed arrays living in the arena.
//!
//! A `ShmVector<T>` is a handle with value semantics: cloning copies the
//! handle and bumps the shared refcount, dropping releases it, and storage
//! is reclaimed when the last handle goes away. Element mutation follows the
//! single-writer-then-broadcast convention; only `resize` checks uniqueness.

use std::marker::PhantomData;

use crate::core::shm::{Arena, BlockRef};
use crate::{Error, Result};

/// Closed marker for element types that may live in shared memory.
pub trait ShmPod: Copy + Send + Sync + 'static {}

impl ShmPod for u8 {}
impl ShmPod for u32 {}
impl ShmPod for u64 {}
impl ShmPod for i32 {}
impl ShmPod for i64 {}
impl ShmPod for f32 {}
impl ShmPod for f64 {}

pub struct ShmVector<T: ShmPod> {
    arena: Arena,
    block: BlockRef,
    _marker: PhantomData<T>,
}

impl<T: ShmPod> ShmVector<T> {
    /// Allocate a vector of `len` zero-initialised elements (refcount 1).
    pub fn new(arena: &Arena, len: usize) -> Result<Self> {
        let mut v = Self::with_capacity(arena, len)?;
        v.arena.set_block_size(v.block, len * std::mem::size_of::<T>());
        Ok(v)
    }

    /// Allocate an empty vector with room for `capacity` elements.
    pub fn with_capacity(arena: &Arena, capacity: usize) -> Result<Self> {
        let block = arena.allocate(capacity * std::mem::size_of::<T>())?;
        Ok(Self {
            arena: arena.clone(),
            block,
            _marker: PhantomData,
        })
    }

    /// Build a vector from a slice in one step.
    pub fn from_slice(arena: &Arena, data: &[T]) -> Result<Self> {
        let mut v = Self::new(arena, data.len())?;
        v.as_mut_slice().copy_from_slice(data);
        Ok(v)
    }

    /// Adopt a block whose reference was transferred by the sender.
    pub(crate) fn adopt_block(arena: &Arena, block: BlockRef) -> Result<Self> {
        arena.ensure_segment(block.segment)?;
        Ok(Self {
            arena: arena.clone(),
            block,
            _marker: PhantomData,
        })
    }

    pub(crate) fn block(&self) -> BlockRef {
        self.block
    }

    /// Export one reference for transfer to another process. The receiver
    /// adopts it via [`ShmVector::adopt_block`]; a record that is never
    /// imported leaks its reference.
    pub(crate) fn export_handle(&self) -> BlockRef {
        self.arena.ref_inc(self.block);
        self.block
    }

    pub fn len(&self) -> usize {
        self.arena.block_size(self.block) / std::mem::size_of::<T>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.arena.block_capacity(self.block) / std::mem::size_of::<T>()
    }

    /// Shared reference count of the underlying block.
    pub fn refcount(&self) -> u32 {
        self.arena.refcount(self.block)
    }

    pub fn as_slice(&self) -> &[T] {
        unsafe {
            std::slice::from_raw_parts(self.arena.payload_ptr(self.block) as *const T, self.len())
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        unsafe {
            std::slice::from_raw_parts_mut(self.arena.payload_ptr(self.block) as *mut T, self.len())
        }
    }

    /// Resize in place, reallocating when capacity is exceeded.
    ///
    /// Only legal while this handle is the unique owner: a resize under a
    /// shared count would mutate data another process may be reading.
    pub fn resize(&mut self, len: usize) -> Result<()> {
        if self.refcount() != 1 {
            return Err(Error::Protocol(format!(
                "resize of shared vector (refcount {})",
                self.refcount()
            )));
        }
        let elem = std::mem::size_of::<T>();
        if len <= self.capacity() {
            self.arena.set_block_size(self.block, len * elem);
            return Ok(());
        }

        let new_cap = len.max(self.capacity() * 2);
        let new_block = self.arena.allocate(new_cap * elem)?;
        let old_len = self.len();
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.arena.payload_ptr(self.block),
                self.arena.payload_ptr(new_block),
                old_len * elem,
            );
        }
        self.arena.set_block_size(new_block, len * elem);
        self.arena.ref_dec(self.block);
        self.block = new_block;
        Ok(())
    }

    /// Replace the contents with `data`.
    pub fn fill_from(&mut self, data: &[T]) -> Result<()> {
        self.resize(data.len())?;
        self.as_mut_slice().copy_from_slice(data);
        Ok(())
    }

    /// Deep copy into a fresh block, e.g. before mutating a shared input.
    pub fn duplicate(&self) -> Result<Self> {
        Self::from_slice(&self.arena, self.as_slice())
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.as_slice().to_vec()
    }
}

impl<T: ShmPod> Clone for ShmVector<T> {
    fn clone(&self) -> Self {
        self.arena.ref_inc(self.block);
        Self {
            arena: self.arena.clone(),
            block: self.block,
            _marker: PhantomData,
        }
    }
}

impl<T: ShmPod> Drop for ShmVector<T> {
    fn drop(&mut self) {
        self.arena.ref_dec(self.block);
    }
}

impl<T: ShmPod + std::fmt::Debug> std::fmt::Debug for ShmVector<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmVector")
            .field("len", &self.len())
            .field("refcount", &self.refcount())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shm::ArenaConfig;

    fn test_arena() -> Arena {
        Arena::create(ArenaConfig::private("shmvec_test", 64 * 1024)).unwrap()
    }

    #[test]
    fn copy_and_drop_balance() {
        let arena = test_arena();
        {
            let v = ShmVector::<f32>::from_slice(&arena, &[1.0, 2.0, 3.0]).unwrap();
            let a = v.clone();
            let b = a.clone();
            assert_eq!(v.refcount(), 3);
            drop(a);
            assert_eq!(v.refcount(), 2);
            assert_eq!(b.as_slice(), &[1.0, 2.0, 3.0]);
        }
        assert_eq!(arena.live_blocks(), 0);
    }

    #[test]
    fn resize_rejected_while_shared() {
        let arena = test_arena();
        let mut v = ShmVector::<u32>::new(&arena, 4).unwrap();
        let other = v.clone();
        assert!(matches!(v.resize(8), Err(Error::Protocol(_))));
        drop(other);
        v.resize(8).unwrap();
        assert_eq!(v.len(), 8);
    }

    #[test]
    fn resize_preserves_contents() {
        let arena = test_arena();
        let mut v = ShmVector::<i32>::from_slice(&arena, &[7, 8, 9]).unwrap();
        v.resize(100).unwrap();
        assert_eq!(&v.as_slice()[..3], &[7, 8, 9]);
        assert_eq!(v.len(), 100);
        v.resize(2).unwrap();
        assert_eq!(v.as_slice(), &[7, 8]);
        // Shrinking keeps the block; no stale allocations remain.
        assert_eq!(arena.live_blocks(), 1);
    }

    #[test]
    fn duplicate_detaches_from_source() {
        let arena = test_arena();
        let v = ShmVector::<f64>::from_slice(&arena, &[0.5, 1.5]).unwrap();
        let mut copy = v.duplicate().unwrap();
        copy.as_mut_slice()[0] = 9.0;
        assert_eq!(v.as_slice()[0], 0.5);
        assert_eq!(v.refcount(), 1);
        assert_eq!(copy.refcount(), 1);
    }
}
