mod config;
mod error;
mod item_set;
mod jobs;
mod lane;
mod lane_item;
mod metadata;
mod retiree;
mod sbif;
mod scheduler;
mod summary;
mod trace;
mod tracker;

pub use config::{MAX_LANES, TrackerCreateInfo, TrackerSettings};
pub use error::{Error, Result};
pub use item_set::{BUCKET_SIZE, LaneItemSet, SetEntry};
pub use jobs::*;
pub use lane::{Lane, LaneInput};
pub use lane_item::{LaneItem, MAX_BATCH_EVENTS};
pub use metadata::{MAX_METADATA_ID, Metadata, MetadataDb, MetadataEntry, MetadataId};
pub use retiree::{AllocStamp, MAX_START_SERIAL, Retiree, column_depth};
pub use sbif::*;
pub use scheduler::{GraphHandle, JobGraph, JobId, JobScheduler};
pub use summary::*;
pub use trace::*;
pub use tracker::{Tracker, TrackerStats};
