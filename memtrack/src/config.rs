use std::thread;

use crate::{Error, Result, lane_item::MAX_BATCH_EVENTS};

/// Upper bound for the number of lanes.
pub const MAX_LANES: usize = 1024;

/// User-facing tracker configuration. Unset fields fall back to
/// [`TrackerSettings::default`].
#[derive(Debug, Default, Clone)]
pub struct TrackerCreateInfo {
    pub lane_count: Option<usize>,
    /// Items a lane stages before the tracker dispatches a batch.
    pub lane_capacity: Option<usize>,
    pub initial_set_capacity: Option<usize>,
    pub max_load_percent: Option<usize>,
    pub max_tomb_percent: Option<usize>,
    pub bundle_size: Option<usize>,
    /// 0 runs every job inline on the admitting thread.
    pub workers: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    /// Number of address partitions. Must be a power of two.
    pub lane_count: usize,
    /// Capacity of one lane's staging buffer (allocs + frees).
    pub lane_capacity: usize,
    /// Entries each active set starts with, rounded up to whole buckets.
    pub initial_set_capacity: usize,
    /// Load (live + tombs + incoming) in percent of capacity above which
    /// an active set grows before a batch is applied.
    pub max_load_percent: usize,
    /// Tombstone share of occupied slots above which a set is compacted.
    pub max_tomb_percent: usize,
    /// Retirees per hand-off to the builder.
    pub bundle_size: usize,
    pub workers: usize,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        let lane_count = 32;
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(lane_count);
        Self {
            lane_count,
            lane_capacity: 2048,
            initial_set_capacity: 4096,
            max_load_percent: 88,
            max_tomb_percent: 50,
            bundle_size: 2048,
            workers,
        }
    }
}

impl TrackerSettings {
    pub fn validate(&self) -> Result<()> {
        if !self.lane_count.is_power_of_two() || self.lane_count > MAX_LANES {
            return Err(Error::InvalidSettings(
                "lane_count must be a power of two no larger than 1024",
            ));
        }
        if self.lane_capacity < 2 || self.lane_capacity > MAX_BATCH_EVENTS {
            return Err(Error::InvalidSettings(
                "lane_capacity must be between 2 and 131072",
            ));
        }
        if self.initial_set_capacity == 0 {
            return Err(Error::InvalidSettings("initial_set_capacity must be > 0"));
        }
        if !(50..=95).contains(&self.max_load_percent) {
            return Err(Error::InvalidSettings(
                "max_load_percent must be between 50 and 95",
            ));
        }
        if !(1..=100).contains(&self.max_tomb_percent) {
            return Err(Error::InvalidSettings(
                "max_tomb_percent must be between 1 and 100",
            ));
        }
        if self.bundle_size == 0 {
            return Err(Error::InvalidSettings("bundle_size must be > 0"));
        }
        Ok(())
    }
}

impl TrackerCreateInfo {
    pub fn build(&self) -> Result<TrackerSettings> {
        let mut settings = TrackerSettings::default();
        self.lane_count.inspect(|&val| settings.lane_count = val);
        self.lane_capacity.inspect(|&val| settings.lane_capacity = val);
        self.initial_set_capacity
            .inspect(|&val| settings.initial_set_capacity = val);
        self.max_load_percent
            .inspect(|&val| settings.max_load_percent = val);
        self.max_tomb_percent
            .inspect(|&val| settings.max_tomb_percent = val);
        self.bundle_size.inspect(|&val| settings.bundle_size = val);
        self.workers.inspect(|&val| settings.workers = val);
        settings.validate()?;
        Ok(settings)
    }
}
