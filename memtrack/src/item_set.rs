//! Open-addressing set of live allocations, one per lane.
//!
//! Slots are probed four at a time. Each step builds small bit masks from
//! the four addresses of a group and picks the lowest set bit, so the
//! common path has no data-dependent branches inside a group.
//!
//! Address 0 marks an empty slot and address 1 a tombstone. Removal only
//! leaves tombstones behind; [`LaneItemSet::rehash`] drops them.

use log::error;

use crate::{MetadataId, retiree::AllocStamp};

/// Capacity granularity; iteration skips whole buckets that were never used.
pub const BUCKET_SIZE: usize = 256;

const GROUP: usize = 4;
const EMPTY: u64 = 0;
const TOMB: u64 = 1;
const SET_HASH: u64 = 0xff51_afd7_ed55_8ccd;

#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetEntry {
    address: u64,
    stamp: AllocStamp,
}

impl SetEntry {
    #[inline]
    pub fn address(&self) -> u64 {
        self.address
    }

    #[inline]
    pub fn stamp(&self) -> AllocStamp {
        self.stamp
    }

    #[inline]
    pub fn start_serial(&self) -> u64 {
        self.stamp.start_serial()
    }

    #[inline]
    pub fn metadata_id(&self) -> MetadataId {
        self.stamp.metadata_id()
    }

    #[inline]
    fn is_live(&self) -> bool {
        self.address > TOMB
    }
}

#[inline(always)]
fn group_mask(group: &[SetEntry], pred: impl Fn(u64) -> bool) -> u32 {
    (pred(group[0].address) as u32)
        | (pred(group[1].address) as u32) << 1
        | (pred(group[2].address) as u32) << 2
        | (pred(group[3].address) as u32) << 3
}

#[derive(Debug)]
pub struct LaneItemSet {
    entries: Box<[SetEntry]>,
    // Slots per bucket that are not empty (live or tombstone).
    bucket_used: Box<[u16]>,
    num: usize,
    num_tombs: usize,
    shift: u32,
}

impl LaneItemSet {
    /// Creates a set with at least `capacity` slots, rounded up to a power
    /// of two no smaller than one bucket.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(BUCKET_SIZE).next_power_of_two();
        Self {
            entries: vec![SetEntry::default(); capacity].into_boxed_slice(),
            bucket_used: vec![0; capacity / BUCKET_SIZE].into_boxed_slice(),
            num: 0,
            num_tombs: 0,
            shift: u64::BITS - capacity.trailing_zeros(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Live entries.
    #[inline]
    pub fn num(&self) -> usize {
        self.num
    }

    #[inline]
    pub fn num_tombs(&self) -> usize {
        self.num_tombs
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num == 0
    }

    #[inline]
    fn probe_start(&self, address: u64) -> usize {
        (address.wrapping_mul(SET_HASH) >> self.shift) as usize & !(GROUP - 1)
    }

    pub fn find(&self, address: u64) -> Option<usize> {
        debug_assert!(address > TOMB);
        let mask = self.capacity() - 1;
        let mut index = self.probe_start(address);
        for _ in 0..self.capacity() / GROUP {
            let group = &self.entries[index..index + GROUP];
            let hits = group_mask(group, |a| a == address);
            let stop = hits | group_mask(group, |a| a == EMPTY);
            if stop != 0 {
                let lane = stop.trailing_zeros();
                return (hits & (1 << lane) != 0).then_some(index + lane as usize);
            }
            index = (index + GROUP) & mask;
        }
        debug_assert!(false, "probe wrapped a set without empty slots");
        None
    }

    /// First tombstone or empty slot on `address`'s probe sequence.
    fn free_slot(&self, address: u64) -> usize {
        let mask = self.capacity() - 1;
        let mut index = self.probe_start(address);
        loop {
            let group = &self.entries[index..index + GROUP];
            let free = group_mask(group, |a| a <= TOMB);
            if free != 0 {
                return index + free.trailing_zeros() as usize;
            }
            index = (index + GROUP) & mask;
        }
    }

    /// Inserts a new entry and returns its slot. Does not look for an
    /// existing entry of the same address.
    ///
    /// Refuses the insert when it would leave no empty slot; the tracker's
    /// growth policy is expected to prevent that.
    pub fn add(
        &mut self,
        address: u64,
        start_serial: u64,
        metadata_id: MetadataId,
    ) -> Option<usize> {
        debug_assert!(address > TOMB);
        if self.num + self.num_tombs + 1 >= self.capacity() {
            error!(
                "active set overflow: {} live, {} tombs, capacity {}",
                self.num,
                self.num_tombs,
                self.capacity()
            );
            debug_assert!(false, "active set overflow");
            return None;
        }

        let index = self.free_slot(address);
        let slot = &mut self.entries[index];
        if slot.address == TOMB {
            self.num_tombs -= 1;
        } else {
            self.bucket_used[index / BUCKET_SIZE] += 1;
        }
        *slot = SetEntry {
            address,
            stamp: AllocStamp::new(start_serial, metadata_id),
        };
        self.num += 1;
        Some(index)
    }

    pub fn remove(&mut self, index: usize) {
        let slot = &mut self.entries[index];
        assert!(slot.is_live(), "remove of non-live slot {index}");
        slot.address = TOMB;
        self.num -= 1;
        self.num_tombs += 1;
    }

    pub fn update(&mut self, index: usize, start_serial: u64, metadata_id: MetadataId) {
        let slot = &mut self.entries[index];
        assert!(slot.is_live(), "update of non-live slot {index}");
        slot.stamp = AllocStamp::new(start_serial, metadata_id);
    }

    pub fn entry(&self, index: usize) -> &SetEntry {
        let entry = &self.entries[index];
        debug_assert!(entry.is_live());
        entry
    }

    /// Rebuilds the table with `grow_size` more slots (rounded up to a
    /// power of two), keeping live entries only.
    pub fn rehash(&mut self, grow_size: usize) {
        let mut next = LaneItemSet::new(self.capacity() + grow_size);
        for (_, entry) in self.iter() {
            let index = next.free_slot(entry.address);
            next.entries[index] = entry;
            next.bucket_used[index / BUCKET_SIZE] += 1;
            next.num += 1;
        }
        *self = next;
    }

    pub fn iter(&self) -> SetItems<'_> {
        SetItems { set: self, index: 0 }
    }
}

/// Live entries of a [`LaneItemSet`] with their slot index.
pub struct SetItems<'a> {
    set: &'a LaneItemSet,
    index: usize,
}

impl Iterator for SetItems<'_> {
    type Item = (usize, SetEntry);

    fn next(&mut self) -> Option<Self::Item> {
        let capacity = self.set.capacity();
        while self.index < capacity {
            if self.index % BUCKET_SIZE == 0 && self.set.bucket_used[self.index / BUCKET_SIZE] == 0
            {
                self.index += BUCKET_SIZE;
                continue;
            }
            let index = self.index;
            self.index += 1;
            let entry = self.set.entries[index];
            if entry.is_live() {
                return Some((index, entry));
            }
        }
        None
    }
}
