//! Concrete consumers of the tracker output.

use std::{fmt, sync::Arc};

use crate::{
    MetadataDb, MetadataId, Retiree,
    sbif::{RetireeContext, RetireeSink, SbifBuilder},
};

/// An allocation lifetime in absolute serials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Interval {
    pub address: u64,
    pub start_serial: u64,
    /// `None` for allocations still live at end of trace.
    pub end_serial: Option<u64>,
    pub metadata_id: MetadataId,
}

impl Interval {
    pub fn from_retiree(retiree: &Retiree, serial_bias: u64) -> Self {
        Self {
            address: retiree.address(),
            start_serial: retiree.start_serial(),
            end_serial: (!retiree.is_leak()).then(|| retiree.end_serial(serial_bias)),
            metadata_id: retiree.metadata_id(),
        }
    }

    pub fn is_leak(&self) -> bool {
        self.end_serial.is_none()
    }
}

/// Sink that keeps every retiree as an [`Interval`].
#[derive(Debug, Default)]
pub struct RetireeCollector {
    intervals: Vec<Interval>,
    bundles: usize,
    begun: bool,
    ended: bool,
}

impl RetireeCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    pub fn leaks(&self) -> impl Iterator<Item = &Interval> {
        self.intervals.iter().filter(|i| i.is_leak())
    }

    pub fn bundles(&self) -> usize {
        self.bundles
    }

    pub fn is_finished(&self) -> bool {
        self.begun && self.ended
    }

    pub fn into_intervals(self) -> Vec<Interval> {
        self.intervals
    }
}

impl RetireeSink for RetireeCollector {
    fn begin(&mut self) {
        self.begun = true;
    }

    fn add_retirees(&mut self, serial_bias: u64, retirees: &[Retiree]) {
        self.bundles += 1;
        self.intervals
            .extend(retirees.iter().map(|r| Interval::from_retiree(r, serial_bias)));
    }

    fn end(&mut self) {
        self.ended = true;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakRecord {
    pub address: u64,
    pub start_serial: u64,
    pub size: u64,
    pub owner: u64,
    pub tag: u32,
}

/// Builder that tallies what it receives instead of encoding it.
#[derive(Debug)]
pub struct SbifSummary {
    events_per_column: u32,
    keep_leaks: bool,
    metadata: Option<Arc<MetadataDb>>,
    columns: u64,
    bundles: u64,
    freed: u64,
    freed_bytes: u64,
    leaks: u64,
    leaked_bytes: u64,
    /// Retirees per column depth.
    depths: Vec<u64>,
    unsorted_bundles: u64,
    leak_records: Vec<LeakRecord>,
}

impl SbifSummary {
    pub fn new(events_per_column: u32) -> Self {
        Self {
            events_per_column,
            keep_leaks: false,
            metadata: None,
            columns: 0,
            bundles: 0,
            freed: 0,
            freed_bytes: 0,
            leaks: 0,
            leaked_bytes: 0,
            depths: Vec::new(),
            unsorted_bundles: 0,
            leak_records: Vec::new(),
        }
    }

    /// Also record every leak individually.
    pub fn keep_leaks(mut self, keep: bool) -> Self {
        self.keep_leaks = keep;
        self
    }

    pub fn columns(&self) -> u64 {
        self.columns
    }

    pub fn bundles(&self) -> u64 {
        self.bundles
    }

    pub fn retirees(&self) -> u64 {
        self.freed + self.leaks
    }

    pub fn freed(&self) -> u64 {
        self.freed
    }

    pub fn freed_bytes(&self) -> u64 {
        self.freed_bytes
    }

    pub fn leaks(&self) -> u64 {
        self.leaks
    }

    pub fn leaked_bytes(&self) -> u64 {
        self.leaked_bytes
    }

    pub fn depth_histogram(&self) -> &[u64] {
        &self.depths
    }

    /// Bundles that did not arrive in `(depth, end, start)` order.
    pub fn unsorted_bundles(&self) -> u64 {
        self.unsorted_bundles
    }

    pub fn leak_records(&self) -> &[LeakRecord] {
        &self.leak_records
    }
}

impl SbifBuilder for SbifSummary {
    fn events_per_column(&self) -> u32 {
        self.events_per_column
    }

    fn begin(&mut self, metadata: Arc<MetadataDb>) {
        self.metadata = Some(metadata);
    }

    fn add_column(&mut self) {
        self.columns += 1;
    }

    fn add_retirees(&mut self, context: &RetireeContext, retirees: &[Retiree]) {
        self.bundles += 1;

        let sorted = retirees.windows(2).all(|w| {
            w[0].sort_key(context.serial_bias, context.column_shift)
                <= w[1].sort_key(context.serial_bias, context.column_shift)
        });
        if !sorted {
            self.unsorted_bundles += 1;
        }

        for retiree in retirees {
            let depth = context.depth(retiree) as usize;
            if depth >= self.depths.len() {
                self.depths.resize(depth + 1, 0);
            }
            self.depths[depth] += 1;

            let entry = self
                .metadata
                .as_ref()
                .and_then(|db| db.get(retiree.metadata_id()));
            let size = entry.map_or(0, |e| e.size());

            if retiree.is_leak() {
                self.leaks += 1;
                self.leaked_bytes += size;
                if self.keep_leaks {
                    self.leak_records.push(LeakRecord {
                        address: retiree.address(),
                        start_serial: retiree.start_serial(),
                        size,
                        owner: entry.map_or(0, |e| e.owner()),
                        tag: entry.map_or(0, |e| e.tag()),
                    });
                }
            } else {
                self.freed += 1;
                self.freed_bytes += size;
            }
        }
    }

    fn end(&mut self) {
        self.leak_records
            .sort_unstable_by_key(|l| (l.start_serial, l.address));
    }
}

impl fmt::Display for SbifSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "columns:        {}", self.columns)?;
        writeln!(f, "bundles:        {}", self.bundles)?;
        writeln!(f, "retirees:       {}", self.retirees())?;
        writeln!(
            f,
            "  freed:        {} ({} bytes)",
            self.freed, self.freed_bytes
        )?;
        writeln!(
            f,
            "  leaked:       {} ({} bytes)",
            self.leaks, self.leaked_bytes
        )?;
        writeln!(f, "depth histogram:")?;
        for (depth, count) in self.depths.iter().enumerate() {
            if *count > 0 {
                writeln!(f, "  {depth:>3}: {count}")?;
            }
        }
        Ok(())
    }
}
