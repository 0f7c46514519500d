//! Per-lane processing stages.
//!
//! A lane's batch runs `lane_input_job` first, then `lane_update_job` and
//! `lane_retiree_job` independently: the former mutates the active set
//! while the latter only sorts the retirees the input stage produced.
//! `lane_leaks_job` runs once per lane at end of trace.

use std::{cmp::Reverse, collections::BinaryHeap, ops::AddAssign};

use log::trace;

use crate::{LaneInput, LaneItem, LaneItemSet, Retiree, retiree::AllocStamp};

/// Counters collected while processing one lane's batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LaneBatchStats {
    /// Allocations freed within the batch they were made in.
    pub short_allocs: u64,
    /// Frees matched against the active set.
    pub resolved_frees: u64,
    /// Frees of addresses that were never seen allocated.
    pub unmatched_frees: u64,
    pub double_frees: u64,
    /// Allocations replaced by a later allocation of the same address
    /// without an intervening free.
    pub superseded_allocs: u64,
    pub set_inserts: u64,
    pub set_updates: u64,
    pub set_removes: u64,
}

impl AddAssign for LaneBatchStats {
    fn add_assign(&mut self, other: Self) {
        self.short_allocs += other.short_allocs;
        self.resolved_frees += other.resolved_frees;
        self.unmatched_frees += other.unmatched_frees;
        self.double_frees += other.double_frees;
        self.superseded_allocs += other.superseded_allocs;
        self.set_inserts += other.set_inserts;
        self.set_updates += other.set_updates;
        self.set_removes += other.set_removes;
    }
}

/// Matches the batch's frees against its allocations and the active set.
///
/// Emits a retiree per match into `retirees` and leaves the set updates
/// (unmatched allocations, deletions of resolved entries) at the front of
/// `input`.
pub fn lane_input_job(
    input: &mut LaneInput,
    active: &LaneItemSet,
    serial_bias: u64,
    retirees: &mut Vec<Retiree>,
    stats: &mut LaneBatchStats,
) {
    let num_allocs = input.num_allocs();
    let num_frees = input.num_frees();
    let free_base = input.free_base();

    {
        let (allocs, frees) = input.split_mut();
        allocs.sort_unstable_by_key(LaneItem::key);
        frees.sort_unstable_by_key(LaneItem::key);
    }
    retirees.reserve(num_frees);

    let items = input.items_mut();

    // Two-cursor merge. Unmatched items are compacted in place: allocs and
    // deletions of superseded live entries to the front of the buffer,
    // frees to the front of the free region. `ao <= ai` throughout.
    let (mut ai, mut fi) = (0, 0);
    let (mut ao, mut fo) = (0, 0);
    let mut last_alloc = 0;
    while ai < num_allocs && fi < num_frees {
        let alloc = items[ai];
        let free = items[free_base + fi];

        if alloc.address() == free.address() && alloc.key() < free.key() {
            let superseded = ai + 1 < num_allocs && {
                let next = items[ai + 1];
                next.address() == alloc.address() && next.key() < free.key()
            };
            if superseded {
                stats.superseded_allocs += 1;
                ai += 1;
                continue;
            }

            // The first allocation of an address that is still live from
            // an earlier batch supersedes the live entry, unless a free of
            // this batch already closed it.
            let first_alloc = last_alloc != alloc.address();
            let closed_by_free = fo > 0 && items[free_base + fo - 1].address() == alloc.address();
            if first_alloc && !closed_by_free {
                if let Some(index) = active.find(alloc.address()) {
                    trace!("allocation over live address {:#x}", alloc.address());
                    items[ao] = LaneItem::deletion(alloc.address(), alloc.serial_offset(), index);
                    ao += 1;
                    stats.superseded_allocs += 1;
                }
            }

            let start = serial_bias + alloc.serial_offset() as u64;
            let stamp = AllocStamp::new(start, alloc.metadata_id());
            retirees.push(Retiree::new(alloc.address(), stamp, free.serial_offset() + 1));
            stats.short_allocs += 1;
            last_alloc = alloc.address();
            ai += 1;
            fi += 1;
            continue;
        }

        if alloc.key() < free.key() {
            items[ao] = alloc;
            ao += 1;
            last_alloc = alloc.address();
            ai += 1;
        } else {
            if free.address() == last_alloc {
                stats.double_frees += 1;
            } else {
                items[free_base + fo] = free;
                fo += 1;
            }
            fi += 1;
        }
    }

    items.copy_within(ai..num_allocs, ao);
    ao += num_allocs - ai;

    for j in fi..num_frees {
        let free = items[free_base + j];
        if free.address() == last_alloc {
            stats.double_frees += 1;
        } else {
            items[free_base + fo] = free;
            fo += 1;
        }
    }

    // Resolve what is left against the active set. Deletions are written
    // right behind the updates staged so far; the write index never passes
    // the free being read.
    let mut num_updates = ao;
    let mut last_free = 0;
    for j in 0..fo {
        let free = items[free_base + j];
        if free.address() == last_free {
            stats.double_frees += 1;
            continue;
        }
        last_free = free.address();

        match active.find(free.address()) {
            Some(index) => {
                let entry = active.entry(index);
                retirees.push(Retiree::new(
                    free.address(),
                    entry.stamp(),
                    free.serial_offset() + 1,
                ));
                items[num_updates] =
                    LaneItem::deletion(free.address(), free.serial_offset(), index);
                num_updates += 1;
                stats.resolved_frees += 1;
            }
            None => {
                trace!("free of untracked address {:#x}", free.address());
                stats.unmatched_frees += 1;
            }
        }
    }

    input.set_num_updates(num_updates);
}

/// Applies the set updates staged by [`lane_input_job`].
///
/// Updates of one address are coalesced: a deletion followed by a new
/// allocation becomes an in-place update of the deleted slot, and several
/// allocations of the same address keep only the last one.
pub fn lane_update_job(
    input: &mut LaneInput,
    active: &mut LaneItemSet,
    serial_bias: u64,
    stats: &mut LaneBatchStats,
) {
    let updates = input.updates_mut();
    updates.sort_unstable_by_key(|u| (u.address(), !u.has_metadata(), u.serial_offset()));

    let mut i = 0;
    while i < updates.len() {
        let address = updates[i].address();
        let mut end = i + 1;
        while end < updates.len() && updates[end].address() == address {
            end += 1;
        }
        let run = &updates[i..end];
        i = end;

        let num_inserts = run.iter().take_while(|u| u.has_metadata()).count();
        debug_assert!(run.len() <= num_inserts + 1);
        stats.superseded_allocs += num_inserts.saturating_sub(1) as u64;

        let insert = num_inserts.checked_sub(1).map(|k| run[k]);
        let deletion = run.get(num_inserts);

        match (insert, deletion) {
            (Some(insert), Some(deletion)) => {
                let start = serial_bias + insert.serial_offset() as u64;
                active.update(deletion.active_index(), start, insert.metadata_id());
                stats.set_updates += 1;
            }
            (Some(insert), None) => {
                let start = serial_bias + insert.serial_offset() as u64;
                match active.find(address) {
                    Some(index) => {
                        trace!("allocation over live address {address:#x}");
                        active.update(index, start, insert.metadata_id());
                        stats.superseded_allocs += 1;
                        stats.set_updates += 1;
                    }
                    None => {
                        if active.add(address, start, insert.metadata_id()).is_some() {
                            stats.set_inserts += 1;
                        }
                    }
                }
            }
            (None, Some(deletion)) => {
                active.remove(deletion.active_index());
                stats.set_removes += 1;
            }
            (None, None) => unreachable!("empty update run"),
        }
    }
}

/// Orders retirees for hierarchical emission, see [`Retiree::sort_key`].
pub fn lane_retiree_job(retirees: &mut [Retiree], serial_bias: u64, column_shift: u32) {
    retirees.sort_unstable_by_key(|r| r.sort_key(serial_bias, column_shift));
}

/// Closes every allocation still live in `active` as a leak.
///
/// `close_bias` is the serial counter at end of trace; leaks end at the
/// last admitted serial.
pub fn lane_leaks_job(active: &LaneItemSet, close_bias: u64, column_shift: u32) -> Vec<Retiree> {
    let mut leaks: Vec<_> = active
        .iter()
        .map(|(_, entry)| Retiree::leak(entry.address(), entry.stamp()))
        .collect();
    lane_retiree_job(&mut leaks, close_bias, column_shift);
    leaks
}

/// K-way merge of per-lane sorted retiree lists.
///
/// Emits the merged sequence in bundles of at most `bundle_size` and
/// returns the number of retirees emitted.
pub fn merge_retirees(
    lists: &[Vec<Retiree>],
    serial_bias: u64,
    column_shift: u32,
    bundle_size: usize,
    mut emit: impl FnMut(&[Retiree]),
) -> usize {
    let key = |r: &Retiree| r.sort_key(serial_bias, column_shift);

    let mut heap = BinaryHeap::with_capacity(lists.len());
    for (lane, list) in lists.iter().enumerate() {
        if let Some(head) = list.first() {
            heap.push(Reverse((key(head), lane, 0usize)));
        }
    }

    let mut bundle = Vec::with_capacity(bundle_size);
    let mut emitted = 0;
    while let Some(Reverse((_, lane, cursor))) = heap.pop() {
        let list = &lists[lane];
        bundle.push(list[cursor]);
        if let Some(next) = list.get(cursor + 1) {
            heap.push(Reverse((key(next), lane, cursor + 1)));
        }
        if bundle.len() == bundle_size {
            emit(&bundle);
            emitted += bundle.len();
            bundle.clear();
        }
    }
    if !bundle.is_empty() {
        emit(&bundle);
        emitted += bundle.len();
    }
    emitted
}
