use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{LaneItem, LaneItemSet, MetadataId};

/// Staging buffer for one lane's share of a batch.
///
/// Allocations fill the buffer from the front and frees from the back, so
/// one allocation serves both. After the input stage the front of the
/// buffer holds the lane's set updates instead.
#[derive(Debug)]
pub struct LaneInput {
    items: Box<[LaneItem]>,
    num_allocs: usize,
    num_frees: usize,
    num_updates: usize,
}

impl LaneInput {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: vec![LaneItem::default(); capacity].into_boxed_slice(),
            num_allocs: 0,
            num_frees: 0,
            num_updates: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.num_allocs + self.num_frees
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn num_allocs(&self) -> usize {
        self.num_allocs
    }

    #[inline]
    pub fn num_frees(&self) -> usize {
        self.num_frees
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Stages an allocation. Returns `true` once the lane is full.
    pub fn add_alloc(&mut self, address: u64, serial_offset: u32, metadata_id: MetadataId) -> bool {
        debug_assert!(!self.is_full());
        self.items[self.num_allocs] = LaneItem::alloc(address, serial_offset, metadata_id);
        self.num_allocs += 1;
        self.is_full()
    }

    /// Stages a free. Returns `true` once the lane is full.
    pub fn add_free(&mut self, address: u64, serial_offset: u32) -> bool {
        debug_assert!(!self.is_full());
        self.num_frees += 1;
        let index = self.capacity() - self.num_frees;
        self.items[index] = LaneItem::free(address, serial_offset);
        self.is_full()
    }

    /// Index of the first free in `items`.
    #[inline]
    pub(crate) fn free_base(&self) -> usize {
        self.capacity() - self.num_frees
    }

    #[inline]
    pub(crate) fn items_mut(&mut self) -> &mut [LaneItem] {
        &mut self.items
    }

    /// The staged allocations and frees, split for independent sorting.
    pub(crate) fn split_mut(&mut self) -> (&mut [LaneItem], &mut [LaneItem]) {
        let free_base = self.free_base();
        let (front, back) = self.items.split_at_mut(free_base);
        (&mut front[..self.num_allocs], back)
    }

    pub(crate) fn set_num_updates(&mut self, num_updates: usize) {
        debug_assert!(num_updates <= self.capacity());
        self.num_updates = num_updates;
    }

    pub fn updates(&self) -> &[LaneItem] {
        &self.items[..self.num_updates]
    }

    pub(crate) fn updates_mut(&mut self) -> &mut [LaneItem] {
        &mut self.items[..self.num_updates]
    }

    pub fn reset(&mut self) {
        self.num_allocs = 0;
        self.num_frees = 0;
        self.num_updates = 0;
    }
}

/// One address partition and its persistent active set.
#[derive(Debug)]
pub struct Lane {
    index: usize,
    active: RwLock<LaneItemSet>,
}

impl Lane {
    pub fn new(index: usize, set_capacity: usize) -> Self {
        Self {
            index,
            active: RwLock::new(LaneItemSet::new(set_capacity)),
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn read(&self) -> RwLockReadGuard<'_, LaneItemSet> {
        self.active.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, LaneItemSet> {
        self.active.write()
    }
}
