//! The allocation tracker.
//!
//! Events are admitted on the caller's thread: each gets the next serial
//! and is staged in the input buffer of the lane its address routes to.
//! When a lane fills up, every lane with pending input is handed to a job
//! graph as one batch. While that graph runs the caller keeps staging
//! into fresh buffers; the results of a batch are merged and delivered to
//! the [`SbifBuilder`] at the next dispatch.

use std::{mem, sync::Arc};

use log::{debug, error, info, trace};
use parking_lot::Mutex;

use crate::{
    Lane, LaneInput, Metadata, MetadataDb, MetadataId, Result, Retiree, TrackerSettings,
    jobs::{
        LaneBatchStats, lane_input_job, lane_leaks_job, lane_retiree_job, lane_update_job,
        merge_retirees,
    },
    lane_item::{ADDRESS_MASK, MAX_BATCH_EVENTS},
    retiree::{MAX_START_SERIAL, RETIREE_ADDRESS_SHIFT},
    sbif::{RetireeContext, SbifBuilder},
    scheduler::{GraphHandle, JobGraph, JobScheduler},
};

const LANE_HASH: u64 = 0xc6a4_a793_5bd1_e995;

const ALIGNMENT_MASK: u64 = (1 << RETIREE_ADDRESS_SHIFT) - 1;

#[inline]
fn is_trackable(address: u64) -> bool {
    address > 1 && address <= ADDRESS_MASK && address & ALIGNMENT_MASK == 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Tracking,
    Finished,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrackerStats {
    /// Admitted events.
    pub events: u64,
    pub allocs: u64,
    pub frees: u64,
    /// Events on untracked addresses, allocations without a metadata id
    /// and events past the last representable serial.
    pub ignored_events: u64,
    pub dispatches: u64,
    /// Active-set rebuilds that grew the set.
    pub rehashes: u64,
    /// Same-size rebuilds dropping tombstones.
    pub compactions: u64,
    pub columns: u64,
    /// Retirees of freed allocations delivered to the builder.
    pub retirees: u64,
    pub leaks: u64,
    pub lanes: LaneBatchStats,
}

// ── Batches ──────────────────────────────────────────────────────────

/// One lane's share of a dispatched batch, shared with its jobs.
struct LaneBatch {
    input: Mutex<LaneInput>,
    retirees: Mutex<Vec<Retiree>>,
    stats: Mutex<LaneBatchStats>,
}

struct BatchWork {
    lanes: Vec<Arc<LaneBatch>>,
    serial_bias: u64,
    /// Serial following the last event of the batch.
    end_serial: u64,
}

struct InFlight {
    handle: GraphHandle,
    work: BatchWork,
}

// ── Tracker ──────────────────────────────────────────────────────────

pub struct Tracker<B: SbifBuilder> {
    settings: TrackerSettings,
    builder: B,
    metadata: Arc<MetadataDb>,
    scheduler: JobScheduler,
    lanes: Vec<Arc<Lane>>,
    inputs: Vec<LaneInput>,
    spare_inputs: Vec<LaneInput>,
    in_flight: Option<InFlight>,
    state: State,
    serial: u64,
    batch_bias: u64,
    column_shift: u32,
    stats: TrackerStats,
}

impl<B: SbifBuilder> Tracker<B> {
    pub fn new(settings: TrackerSettings, builder: B) -> Result<Self> {
        settings.validate()?;

        let lanes = (0..settings.lane_count)
            .map(|index| Arc::new(Lane::new(index, settings.initial_set_capacity)))
            .collect();
        let scheduler = JobScheduler::new(settings.workers);
        debug!(
            "tracker with {} lanes of {} items, {} workers",
            settings.lane_count, settings.lane_capacity, settings.workers
        );

        Ok(Self {
            settings,
            builder,
            metadata: Arc::new(MetadataDb::new()),
            scheduler,
            lanes,
            inputs: Vec::new(),
            spare_inputs: Vec::new(),
            in_flight: None,
            state: State::Idle,
            serial: 0,
            batch_bias: 0,
            column_shift: 0,
            stats: TrackerStats::default(),
        })
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    pub fn metadata(&self) -> &Arc<MetadataDb> {
        &self.metadata
    }

    pub fn builder(&self) -> &B {
        &self.builder
    }

    pub fn into_builder(self) -> B {
        self.builder
    }

    pub fn stats(&self) -> TrackerStats {
        self.stats
    }

    /// Serial the next admitted event will receive.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn column_shift(&self) -> u32 {
        self.column_shift
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    /// Lane an address is routed to. Fixed for the tracker's lifetime.
    #[inline]
    pub fn lane_index(&self, address: u64) -> usize {
        ((address >> 4).wrapping_mul(LANE_HASH) >> 8) as usize & (self.lanes.len() - 1)
    }

    pub fn begin(&mut self) {
        assert_eq!(self.state, State::Idle, "begin called on a started tracker");

        let events_per_column = self
            .builder
            .events_per_column()
            .clamp(1, 1 << 31)
            .next_power_of_two();
        self.column_shift = events_per_column.trailing_zeros();
        self.serial = 0;
        self.batch_bias = 0;
        self.inputs = (0..self.lanes.len())
            .map(|_| LaneInput::new(self.settings.lane_capacity))
            .collect();

        self.builder.begin(Arc::clone(&self.metadata));
        self.state = State::Tracking;
        debug!("tracking started, {events_per_column} events per column");
    }

    /// Admits an allocation and returns its serial. Addresses 0 and 1,
    /// addresses beyond 47 bits and addresses that are not 8 byte aligned
    /// are not tracked.
    pub fn add_alloc(&mut self, address: u64, metadata: &Metadata) -> Option<u64> {
        self.assert_tracking("add_alloc");
        if !self.admits(address) {
            return None;
        }
        let Some(metadata_id) = self.metadata.add(metadata) else {
            self.stats.ignored_events += 1;
            return None;
        };
        self.stats.allocs += 1;
        Some(self.stage(address, Some(metadata_id)))
    }

    /// Admits a free and returns its serial. See [`Tracker::add_alloc`]
    /// for the addresses that are not tracked.
    pub fn add_free(&mut self, address: u64) -> Option<u64> {
        self.assert_tracking("add_free");
        if !self.admits(address) {
            return None;
        }
        self.stats.frees += 1;
        Some(self.stage(address, None))
    }

    /// Flushes pending input, closes live allocations as leaks and ends
    /// the builder.
    pub fn end(&mut self) {
        self.assert_tracking("end");

        self.dispatch(false);
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.handle.wait();
            self.finalize_work(in_flight.work);
        }
        self.collect_leaks();
        self.builder.end();
        self.state = State::Finished;

        let s = &self.stats;
        info!(
            "tracked {} events: {} retirees, {} leaks, {} dispatches, {} unmatched frees",
            s.events, s.retirees, s.leaks, s.dispatches, s.lanes.unmatched_frees
        );
    }

    fn assert_tracking(&self, what: &str) {
        assert_eq!(
            self.state,
            State::Tracking,
            "{what} called outside of begin/end"
        );
    }

    fn admits(&mut self, address: u64) -> bool {
        if !is_trackable(address) {
            trace!("ignoring event on {address:#x}");
            self.stats.ignored_events += 1;
            return false;
        }
        if self.serial > MAX_START_SERIAL {
            self.stats.ignored_events += 1;
            return false;
        }
        true
    }

    fn stage(&mut self, address: u64, metadata_id: Option<MetadataId>) -> u64 {
        let serial = self.serial;
        let offset = (serial - self.batch_bias) as u32;
        let lane = self.lane_index(address);

        let input = &mut self.inputs[lane];
        let full = match metadata_id {
            Some(id) => input.add_alloc(address, offset, id),
            None => input.add_free(address, offset),
        };
        self.serial += 1;
        self.stats.events += 1;
        if self.serial == MAX_START_SERIAL + 1 {
            error!("serial space exhausted after {} events, ignoring the rest", self.serial);
        }

        if full || self.serial - self.batch_bias >= MAX_BATCH_EVENTS as u64 {
            self.dispatch(true);
        }
        serial
    }

    fn take_input(&mut self) -> LaneInput {
        self.spare_inputs
            .pop()
            .unwrap_or_else(|| LaneInput::new(self.settings.lane_capacity))
    }

    /// Grow size for a lane's set before `incoming` allocations are
    /// applied, `Some(0)` to only drop tombstones, `None` to leave it.
    fn rehash_policy(&self, lane: &Lane, incoming: usize, compact: bool) -> Option<usize> {
        let set = lane.read();
        let (num, tombs, capacity) = (set.num(), set.num_tombs(), set.capacity());
        let max_load = self.settings.max_load_percent;

        if (num + tombs + incoming) * 100 > capacity * max_load {
            let target = ((num + incoming) * 100 / max_load + 1)
                .next_power_of_two()
                .max(capacity);
            return Some(target - capacity);
        }
        if compact && tombs * 100 > (num + tombs) * self.settings.max_tomb_percent {
            return Some(0);
        }
        None
    }

    fn dispatch(&mut self, compact: bool) {
        if self.inputs.iter().all(LaneInput::is_empty) {
            return;
        }

        // Lane sets are only touched by one graph at a time.
        let previous = self.in_flight.take().map(|in_flight| {
            in_flight.handle.wait();
            in_flight.work
        });

        let serial_bias = self.batch_bias;
        let column_shift = self.column_shift;
        let mut graph = JobGraph::new();
        let mut batches = Vec::new();
        let mut sync_deps = Vec::new();

        for index in 0..self.lanes.len() {
            if self.inputs[index].is_empty() {
                continue;
            }
            let fresh = self.take_input();
            let input = mem::replace(&mut self.inputs[index], fresh);
            let lane = Arc::clone(&self.lanes[index]);

            let mut deps = Vec::new();
            if let Some(grow) = self.rehash_policy(&lane, input.num_allocs(), compact) {
                if grow > 0 {
                    self.stats.rehashes += 1;
                } else {
                    self.stats.compactions += 1;
                }
                let lane = Arc::clone(&lane);
                deps.push(graph.add("lane_rehash", &[], move || {
                    lane.write().rehash(grow);
                }));
            }

            let batch = Arc::new(LaneBatch {
                input: Mutex::new(input),
                retirees: Mutex::new(Vec::new()),
                stats: Mutex::new(LaneBatchStats::default()),
            });

            let input_job = {
                let lane = Arc::clone(&lane);
                let batch = Arc::clone(&batch);
                graph.add("lane_input", &deps, move || {
                    let mut input = batch.input.lock();
                    let mut retirees = batch.retirees.lock();
                    let mut stats = batch.stats.lock();
                    lane_input_job(&mut input, &lane.read(), serial_bias, &mut retirees, &mut stats);
                    trace!(
                        "lane {}: {} allocs, {} frees, {} retirees",
                        lane.index(),
                        input.num_allocs(),
                        input.num_frees(),
                        retirees.len()
                    );
                })
            };
            let update_job = {
                let batch = Arc::clone(&batch);
                graph.add("lane_update", &[input_job], move || {
                    let mut input = batch.input.lock();
                    let mut stats = batch.stats.lock();
                    lane_update_job(&mut input, &mut lane.write(), serial_bias, &mut stats);
                })
            };
            let retiree_job = {
                let batch = Arc::clone(&batch);
                graph.add("lane_retiree", &[input_job], move || {
                    lane_retiree_job(&mut batch.retirees.lock(), serial_bias, column_shift);
                })
            };

            sync_deps.push(update_job);
            sync_deps.push(retiree_job);
            batches.push(batch);
        }

        let num_lanes = batches.len();
        graph.add("sync", &sync_deps, move || {
            trace!("batch at serial {serial_bias}: {num_lanes} lanes done");
        });

        debug!(
            "dispatch serials {}..{} over {} lanes",
            serial_bias, self.serial, num_lanes
        );
        let handle = self.scheduler.submit(graph);
        self.in_flight = Some(InFlight {
            handle,
            work: BatchWork {
                lanes: batches,
                serial_bias,
                end_serial: self.serial,
            },
        });
        self.batch_bias = self.serial;
        self.stats.dispatches += 1;

        if let Some(work) = previous {
            self.finalize_work(work);
        }
    }

    /// Delivers a completed batch to the builder and recycles its buffers.
    fn finalize_work(&mut self, work: BatchWork) {
        self.cover_serials(work.end_serial);

        let mut lists = Vec::with_capacity(work.lanes.len());
        for batch in &work.lanes {
            let mut input = mem::replace(&mut *batch.input.lock(), LaneInput::new(0));
            input.reset();
            self.spare_inputs.push(input);
            lists.push(mem::take(&mut *batch.retirees.lock()));
            self.stats.lanes += *batch.stats.lock();
        }

        let emitted = self.emit(&lists, work.serial_bias);
        self.stats.retirees += emitted as u64;
    }

    /// Opens columns until the one holding `end_serial - 1` exists.
    fn cover_serials(&mut self, end_serial: u64) {
        let Some(last) = end_serial.checked_sub(1) else {
            return;
        };
        while self.stats.columns << self.column_shift <= last {
            self.builder.add_column();
            self.stats.columns += 1;
        }
    }

    fn emit(&mut self, lists: &[Vec<Retiree>], serial_bias: u64) -> usize {
        let context = RetireeContext {
            serial_bias,
            column_shift: self.column_shift,
        };
        let builder = &mut self.builder;
        merge_retirees(
            lists,
            serial_bias,
            self.column_shift,
            self.settings.bundle_size,
            |bundle| builder.add_retirees(&context, bundle),
        )
    }

    fn collect_leaks(&mut self) {
        let close_bias = self.serial;
        let column_shift = self.column_shift;

        let mut graph = JobGraph::new();
        let mut results = Vec::with_capacity(self.lanes.len());
        for lane in &self.lanes {
            let lane = Arc::clone(lane);
            let result = Arc::new(Mutex::new(Vec::new()));
            let out = Arc::clone(&result);
            graph.add("lane_leaks", &[], move || {
                *out.lock() = lane_leaks_job(&lane.read(), close_bias, column_shift);
            });
            results.push(result);
        }
        self.scheduler.submit(graph).wait();

        let lists: Vec<_> = results.iter().map(|r| mem::take(&mut *r.lock())).collect();
        let leaks = self.emit(&lists, close_bias);
        self.stats.leaks += leaks as u64;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rand::{Rng, SeedableRng, rngs::StdRng};

    use super::*;
    use crate::{
        TrackerCreateInfo,
        sbif::FlatSbif,
        summary::{Interval, RetireeCollector, SbifSummary},
    };

    fn settings(workers: usize, lane_count: usize, lane_capacity: usize) -> TrackerSettings {
        TrackerCreateInfo {
            lane_count: Some(lane_count),
            lane_capacity: Some(lane_capacity),
            initial_set_capacity: Some(256),
            workers: Some(workers),
            bundle_size: Some(64),
            ..Default::default()
        }
        .build()
        .unwrap()
    }

    fn collector_tracker(settings: TrackerSettings) -> Tracker<FlatSbif<RetireeCollector>> {
        let builder = FlatSbif::with_events_per_column(RetireeCollector::new(), 16);
        let mut tracker = Tracker::new(settings, builder).unwrap();
        tracker.begin();
        tracker
    }

    fn finish(mut tracker: Tracker<FlatSbif<RetireeCollector>>) -> (Vec<Interval>, TrackerStats) {
        tracker.end();
        let stats = tracker.stats();
        let collector = tracker.into_builder().into_inner();
        assert!(collector.is_finished());
        let mut intervals = collector.into_intervals();
        intervals.sort_unstable();
        (intervals, stats)
    }

    fn meta(owner: u64, size: u64) -> Metadata {
        Metadata {
            owner,
            size,
            alignment: 8,
            tag: 0,
            is_realloc: false,
        }
    }

    #[test]
    fn scenario_single_pair() {
        let mut tracker = collector_tracker(settings(0, 4, 16));
        let m = meta(1, 16);
        assert_eq!(tracker.add_alloc(0x1000, &m), Some(0));
        assert_eq!(tracker.add_free(0x1000), Some(1));
        let id = tracker.metadata().add(&m).unwrap();
        let (intervals, stats) = finish(tracker);

        assert_eq!(
            intervals,
            vec![Interval {
                address: 0x1000,
                start_serial: 0,
                end_serial: Some(1),
                metadata_id: id,
            }]
        );
        assert_eq!(stats.retirees, 1);
        assert_eq!(stats.leaks, 0);
    }

    #[test]
    fn scenario_leak() {
        let mut tracker = collector_tracker(settings(0, 4, 16));
        tracker.add_alloc(0x2000, &meta(1, 32));
        let (intervals, stats) = finish(tracker);

        assert_eq!(intervals.len(), 1);
        assert_eq!(intervals[0].address, 0x2000);
        assert!(intervals[0].is_leak());
        assert_eq!(stats.leaks, 1);
        assert_eq!(stats.retirees, 0);
    }

    #[test]
    fn scenario_double_alloc() {
        let mut tracker = collector_tracker(settings(2, 4, 16));
        let m = meta(1, 16);
        tracker.add_alloc(0x3000, &m);
        tracker.add_alloc(0x3000, &m);
        tracker.add_free(0x3000);
        let (intervals, stats) = finish(tracker);

        assert_eq!(intervals.len(), 1);
        assert_eq!(intervals[0].start_serial, 1);
        assert_eq!(intervals[0].end_serial, Some(2));
        assert_eq!(stats.lanes.superseded_allocs, 1);
        assert_eq!(stats.leaks, 0);
    }

    #[test]
    fn scenario_double_alloc_across_batches() {
        // One lane of two items: every second event dispatches.
        let mut tracker = collector_tracker(settings(0, 1, 2));
        let m = meta(1, 16);
        tracker.add_alloc(0x3000, &m);
        tracker.add_alloc(0x4000, &m);
        tracker.add_alloc(0x3000, &m);
        tracker.add_alloc(0x5000, &m);
        tracker.add_free(0x3000);
        tracker.add_free(0x4000);
        let (intervals, stats) = finish(tracker);

        let spans: Vec<_> = intervals
            .iter()
            .map(|i| (i.address, i.start_serial, i.end_serial))
            .collect();
        assert_eq!(
            spans,
            vec![
                (0x3000, 2, Some(4)),
                (0x4000, 1, Some(5)),
                (0x5000, 3, None),
            ]
        );
        assert_eq!(stats.lanes.superseded_allocs, 1);
        assert_eq!(stats.dispatches, 3);
    }

    #[test]
    fn scenario_double_alloc_with_free_in_later_batch() {
        // The second alloc and the free share a batch; the first alloc is
        // live in the active set by then.
        let mut tracker = collector_tracker(settings(0, 1, 2));
        let m = meta(1, 16);
        tracker.add_alloc(0x9000, &m);
        tracker.add_alloc(0x7000, &m);
        tracker.add_alloc(0x9000, &m);
        tracker.add_free(0x9000);
        tracker.add_free(0x7000);
        let (intervals, stats) = finish(tracker);

        let spans: Vec<_> = intervals
            .iter()
            .map(|i| (i.address, i.start_serial, i.end_serial))
            .collect();
        assert_eq!(spans, vec![(0x7000, 1, Some(4)), (0x9000, 2, Some(3))]);
        assert_eq!(stats.lanes.superseded_allocs, 1);
        assert_eq!(stats.leaks, 0);
        assert_eq!(stats.retirees, 2);
    }

    #[test]
    fn scenario_unknown_free() {
        let mut tracker = collector_tracker(settings(1, 4, 16));
        tracker.add_free(0x3000);
        let (intervals, stats) = finish(tracker);
        assert!(intervals.is_empty());
        assert_eq!(stats.lanes.unmatched_frees, 1);
    }

    #[test]
    fn distinct_metadata_gets_distinct_ids() {
        let mut tracker = collector_tracker(settings(0, 4, 16));
        let plain = Metadata {
            owner: 5,
            size: 64,
            alignment: 16,
            tag: 2,
            is_realloc: false,
        };
        let realloc = Metadata {
            is_realloc: true,
            ..plain
        };
        tracker.add_alloc(0x100, &plain);
        tracker.add_alloc(0x200, &realloc);
        tracker.add_alloc(0x300, &plain);
        let (intervals, _) = finish(tracker);

        let ids: Vec<_> = intervals.iter().map(|i| i.metadata_id).collect();
        assert_eq!(ids.len(), 3);
        assert_ne!(ids[0], ids[1]);
        assert_eq!(ids[0], ids[2]);
    }

    #[test]
    fn pairs_match_across_batches() {
        let mut tracker = collector_tracker(settings(2, 2, 4));
        let m = meta(1, 16);
        tracker.add_alloc(0x1000, &m);
        for i in 0..100u64 {
            let address = 0x10_0000 + i * 16;
            tracker.add_alloc(address, &m);
            tracker.add_free(address);
        }
        let end = tracker.add_free(0x1000).unwrap();
        assert_eq!(end, 201);
        assert!(tracker.stats().dispatches > 10);
        let (intervals, stats) = finish(tracker);

        let long: Vec<_> = intervals.iter().filter(|i| i.address == 0x1000).collect();
        assert_eq!(long.len(), 1);
        assert_eq!(long[0].start_serial, 0);
        assert_eq!(long[0].end_serial, Some(201));
        assert_eq!(stats.retirees, 101);
        assert_eq!(stats.leaks, 0);
    }

    #[test]
    fn reserved_addresses_take_no_serial() {
        let mut tracker = collector_tracker(settings(0, 4, 16));
        let m = meta(1, 16);
        assert_eq!(tracker.add_alloc(0, &m), None);
        assert_eq!(tracker.add_free(1), None);
        assert_eq!(tracker.add_alloc(0x40, &m), Some(0));
        assert_eq!(tracker.add_free(0), None);
        assert_eq!(tracker.add_alloc(1 << 48, &m), None);
        assert_eq!(tracker.add_free(0x40), Some(1));
        let (intervals, stats) = finish(tracker);
        assert_eq!(intervals.len(), 1);
        assert_eq!(stats.ignored_events, 4);
        assert_eq!(stats.events, 2);
    }

    #[test]
    fn unaligned_addresses_are_ignored() {
        let mut tracker = collector_tracker(settings(0, 4, 16));
        let m = meta(1, 16);
        assert_eq!(tracker.add_alloc(0x1004, &m), None);
        assert_eq!(tracker.add_alloc(0x1000, &m), Some(0));
        assert_eq!(tracker.add_free(0x1004), None);
        assert_eq!(tracker.add_free(0x1000), Some(1));
        let (intervals, stats) = finish(tracker);
        assert_eq!(intervals.len(), 1);
        assert_eq!(intervals[0].address, 0x1000);
        assert_eq!(stats.ignored_events, 2);
        assert_eq!(stats.lanes.unmatched_frees, 0);
    }

    #[test]
    fn allocations_without_metadata_id_are_ignored() {
        let builder = FlatSbif::with_events_per_column(RetireeCollector::new(), 16);
        let mut tracker = Tracker::new(settings(0, 4, 16), builder).unwrap();
        tracker.metadata = Arc::new(MetadataDb::with_max_id(1));
        tracker.begin();
        assert_eq!(tracker.add_alloc(0x100, &meta(1, 16)), Some(0));
        assert_eq!(tracker.add_alloc(0x200, &meta(2, 16)), None);
        assert_eq!(tracker.add_alloc(0x300, &meta(1, 16)), Some(1));
        assert_eq!(tracker.add_free(0x200), Some(2));
        let (intervals, stats) = finish(tracker);

        let addresses: Vec<_> = intervals.iter().map(|i| i.address).collect();
        assert_eq!(addresses, vec![0x100, 0x300]);
        assert_eq!(stats.ignored_events, 1);
        assert_eq!(stats.lanes.unmatched_frees, 1);
    }

    #[test]
    fn events_past_the_last_serial_are_ignored() {
        let builder = FlatSbif::with_events_per_column(RetireeCollector::new(), 1 << 31);
        let mut tracker = Tracker::new(settings(0, 4, 16), builder).unwrap();
        tracker.begin();
        tracker.serial = MAX_START_SERIAL - 1;
        tracker.batch_bias = MAX_START_SERIAL - 1;

        let m = meta(1, 16);
        assert_eq!(tracker.add_alloc(0x1000, &m), Some(MAX_START_SERIAL - 1));
        assert_eq!(tracker.add_alloc(0x2000, &m), Some(MAX_START_SERIAL));
        assert_eq!(tracker.add_free(0x1000), None);
        assert_eq!(tracker.add_alloc(0x3000, &m), None);
        let (intervals, stats) = finish(tracker);

        let spans: Vec<_> = intervals
            .iter()
            .map(|i| (i.address, i.start_serial, i.end_serial))
            .collect();
        assert_eq!(
            spans,
            vec![
                (0x1000, MAX_START_SERIAL - 1, None),
                (0x2000, MAX_START_SERIAL, None),
            ]
        );
        assert_eq!(stats.events, 2);
        assert_eq!(stats.ignored_events, 2);
    }

    #[test]
    fn serials_strictly_increase() {
        let mut tracker = collector_tracker(settings(3, 4, 8));
        let m = meta(1, 16);
        let mut serials = Vec::new();
        for i in 0..500u64 {
            let address = 0x8000 + (i % 37) * 16;
            let serial = if i % 3 == 0 {
                tracker.add_free(address)
            } else {
                tracker.add_alloc(address, &m)
            };
            serials.extend(serial);
        }
        assert_eq!(serials, (0..500).collect::<Vec<_>>());
        tracker.end();
    }

    #[test]
    fn lane_routing_is_stable() {
        let tracker = collector_tracker(settings(0, 8, 16));
        let mut seen = [0usize; 8];
        for i in 0..4096u64 {
            let address = 0x7f00_0000 + i * 16;
            let lane = tracker.lane_index(address);
            assert!(lane < 8);
            assert_eq!(tracker.lane_index(address), lane);
            seen[lane] += 1;
        }
        assert!(seen.iter().all(|&n| n > 0), "unused lanes: {seen:?}");
    }

    #[test]
    fn builder_receives_sorted_bundles_and_columns() {
        let builder = SbifSummary::new(16);
        let mut tracker = Tracker::new(settings(2, 4, 32), builder).unwrap();
        tracker.begin();
        let mut rng = StdRng::seed_from_u64(7);
        let mut live = Vec::new();
        for i in 0..5000u64 {
            if live.is_empty() || rng.random_bool(0.55) {
                let address = 0x1_0000 + i * 16;
                tracker.add_alloc(address, &meta(1, 8 + i % 64));
                live.push(address);
            } else {
                let index = rng.random_range(0..live.len());
                tracker.add_free(live.swap_remove(index));
            }
        }
        let remaining = live.len() as u64;
        tracker.end();

        let stats = tracker.stats();
        let summary = tracker.builder();
        assert_eq!(summary.unsorted_bundles(), 0);
        assert_eq!(summary.leaks(), remaining);
        assert_eq!(summary.retirees(), stats.retirees + stats.leaks);
        // 5000 serials in columns of 16.
        assert_eq!(summary.columns(), 313);
        assert_eq!(stats.columns, 313);
    }

    #[test]
    fn batch_limit_forces_dispatch() {
        let builder = SbifSummary::new(4096);
        let mut settings = settings(0, 2, MAX_BATCH_EVENTS);
        settings.initial_set_capacity = 4096;
        let mut tracker = Tracker::new(settings, builder).unwrap();
        tracker.begin();
        let m = meta(1, 16);
        let pairs = MAX_BATCH_EVENTS as u64 / 2 + 5;
        for i in 0..pairs {
            let address = 0x10_0000 + i * 16;
            tracker.add_alloc(address, &m);
            tracker.add_free(address);
        }
        assert_eq!(tracker.stats().dispatches, 1);
        tracker.end();

        let stats = tracker.stats();
        assert_eq!(stats.dispatches, 2);
        assert_eq!(stats.retirees, pairs);
        assert_eq!(tracker.builder().freed(), pairs);
        assert_eq!(tracker.builder().leaks(), 0);
    }

    #[test]
    fn active_sets_grow_and_compact() {
        let mut tracker = collector_tracker(settings(2, 2, 64));
        let m = meta(1, 16);
        for i in 0..3000u64 {
            tracker.add_alloc(0x10_0000 + i * 16, &m);
        }
        for i in 0..3000u64 {
            tracker.add_free(0x10_0000 + i * 16);
        }
        // A few more allocations let the tombstone-heavy sets compact.
        for i in 0..256u64 {
            tracker.add_alloc(0x90_0000 + i * 16, &m);
        }
        assert!(tracker.stats().rehashes > 0);
        assert!(tracker.stats().compactions > 0);
        for lane in &tracker.lanes {
            let set = lane.read();
            assert!(set.num() + set.num_tombs() < set.capacity());
        }
        let (intervals, stats) = finish(tracker);
        assert_eq!(stats.retirees, 3000);
        assert_eq!(stats.leaks, 256);
        assert_eq!(intervals.len(), 3256);
    }

    #[test]
    #[should_panic(expected = "outside of begin/end")]
    fn events_before_begin_panic() {
        let builder = FlatSbif::new(RetireeCollector::new());
        let mut tracker = Tracker::new(settings(0, 4, 16), builder).unwrap();
        tracker.add_free(0x10);
    }

    #[test]
    #[should_panic(expected = "outside of begin/end")]
    fn events_after_end_panic() {
        let mut tracker = collector_tracker(settings(0, 4, 16));
        tracker.end();
        assert!(tracker.is_finished());
        tracker.add_free(0x10);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut s = settings(0, 4, 16);
        s.lane_count = 3;
        assert!(Tracker::new(s, SbifSummary::new(16)).is_err());
    }

    /// Straightforward single-map tracker the lane pipeline must agree
    /// with on well-formed streams.
    #[derive(Default)]
    struct Reference {
        live: HashMap<u64, (u64, MetadataId)>,
        intervals: Vec<Interval>,
    }

    impl Reference {
        /// An allocation of a live address replaces the live entry.
        fn alloc(&mut self, address: u64, serial: u64, metadata_id: MetadataId) {
            self.live.insert(address, (serial, metadata_id));
        }

        fn free(&mut self, address: u64, serial: u64) {
            let (start, metadata_id) = self.live.remove(&address).unwrap();
            self.intervals.push(Interval {
                address,
                start_serial: start,
                end_serial: Some(serial),
                metadata_id,
            });
        }

        fn finish(mut self) -> Vec<Interval> {
            for (address, (start, metadata_id)) in self.live {
                self.intervals.push(Interval {
                    address,
                    start_serial: start,
                    end_serial: None,
                    metadata_id,
                });
            }
            self.intervals.sort_unstable();
            self.intervals
        }
    }

    fn random_workload(seed: u64, workers: usize) {
        let mut tracker = collector_tracker(settings(workers, 4, 64));
        let mut reference = Reference::default();
        let mut rng = StdRng::seed_from_u64(seed);

        let mut live: Vec<u64> = Vec::new();
        let mut released: Vec<u64> = Vec::new();
        let mut next_address = 0x4_0000u64;
        let mut reallocs = 0u64;

        for _ in 0..20_000 {
            let alloc = live.is_empty() || rng.random_bool(0.52);
            if !live.is_empty() && rng.random_bool(0.01) {
                let address = live[rng.random_range(0..live.len())];
                let m = meta(rng.random_range(0..8), rng.random_range(1..256));
                let serial = tracker.add_alloc(address, &m).unwrap();
                let id = tracker.metadata().add(&m).unwrap();
                reference.alloc(address, serial, id);
                reallocs += 1;
            } else if alloc {
                let address = if !released.is_empty() && rng.random_bool(0.5) {
                    let index = rng.random_range(0..released.len());
                    released.swap_remove(index)
                } else {
                    next_address += 16 * rng.random_range(1..4u64);
                    next_address
                };
                let m = meta(rng.random_range(0..8), rng.random_range(1..256));
                let serial = tracker.add_alloc(address, &m).unwrap();
                let id = tracker.metadata().add(&m).unwrap();
                reference.alloc(address, serial, id);
                live.push(address);
            } else {
                let index = rng.random_range(0..live.len());
                let address = live.swap_remove(index);
                let serial = tracker.add_free(address).unwrap();
                reference.free(address, serial);
                released.push(address);
            }
        }

        let (intervals, stats) = finish(tracker);
        let expected = reference.finish();
        assert_eq!(intervals.len(), expected.len());
        assert_eq!(intervals, expected);
        assert_eq!(stats.lanes.unmatched_frees, 0);
        assert_eq!(stats.lanes.double_frees, 0);
        assert_eq!(stats.lanes.superseded_allocs, reallocs);
        assert_eq!(stats.retirees + stats.leaks, expected.len() as u64);
    }

    #[test]
    fn random_workload_matches_reference_inline() {
        random_workload(1, 0);
        random_workload(2, 0);
    }

    #[test]
    fn random_workload_matches_reference_on_workers() {
        random_workload(3, 1);
        random_workload(4, 4);
    }
}
