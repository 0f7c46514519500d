//! Output contracts of the tracker.
//!
//! A [`SbifBuilder`] receives retirees grouped by serial columns, sorted
//! so that intervals confined to few columns come first. A
//! [`RetireeSink`] is the flat variant without column bookkeeping;
//! [`FlatSbif`] adapts one to the other.

use std::sync::Arc;

use crate::{MetadataDb, Retiree};

/// Serial frame a bundle of retirees is delivered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetireeContext {
    /// Added to `end_serial_biased - 1` to recover absolute end serials.
    pub serial_bias: u64,
    /// log2 of the number of serials per column.
    pub column_shift: u32,
}

impl RetireeContext {
    #[inline]
    pub fn end_serial(&self, retiree: &Retiree) -> u64 {
        retiree.end_serial(self.serial_bias)
    }

    #[inline]
    pub fn depth(&self, retiree: &Retiree) -> u32 {
        retiree.sort_key(self.serial_bias, self.column_shift).0
    }
}

pub trait SbifBuilder {
    /// Requested column width in serials. Rounded up to a power of two.
    fn events_per_column(&self) -> u32;

    fn begin(&mut self, metadata: Arc<MetadataDb>);

    /// Opens the next column. Called before any retiree ending in it is
    /// delivered.
    fn add_column(&mut self);

    /// Delivers one bundle, sorted by `(depth, end, start)`.
    fn add_retirees(&mut self, context: &RetireeContext, retirees: &[Retiree]);

    fn end(&mut self);
}

pub trait RetireeSink {
    fn begin(&mut self);
    fn add_retirees(&mut self, serial_bias: u64, retirees: &[Retiree]);
    fn end(&mut self);
}

pub const DEFAULT_EVENTS_PER_COLUMN: u32 = 4096;

/// Presents a [`RetireeSink`] as an [`SbifBuilder`].
#[derive(Debug)]
pub struct FlatSbif<S> {
    sink: S,
    events_per_column: u32,
    metadata: Option<Arc<MetadataDb>>,
    columns: u64,
}

impl<S: RetireeSink> FlatSbif<S> {
    pub fn new(sink: S) -> Self {
        Self::with_events_per_column(sink, DEFAULT_EVENTS_PER_COLUMN)
    }

    pub fn with_events_per_column(sink: S, events_per_column: u32) -> Self {
        Self {
            sink,
            events_per_column: events_per_column.max(1),
            metadata: None,
            columns: 0,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn columns(&self) -> u64 {
        self.columns
    }

    /// Metadata table handed over by the tracker, once tracking began.
    pub fn metadata(&self) -> Option<&Arc<MetadataDb>> {
        self.metadata.as_ref()
    }

    pub fn into_inner(self) -> S {
        self.sink
    }
}

impl<S: RetireeSink> SbifBuilder for FlatSbif<S> {
    fn events_per_column(&self) -> u32 {
        self.events_per_column
    }

    fn begin(&mut self, metadata: Arc<MetadataDb>) {
        self.metadata = Some(metadata);
        self.sink.begin();
    }

    fn add_column(&mut self) {
        self.columns += 1;
    }

    fn add_retirees(&mut self, context: &RetireeContext, retirees: &[Retiree]) {
        self.sink.add_retirees(context.serial_bias, retirees);
    }

    fn end(&mut self) {
        self.sink.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retiree::AllocStamp;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
    }

    impl RetireeSink for Recorder {
        fn begin(&mut self) {
            self.calls.push("begin".into());
        }

        fn add_retirees(&mut self, serial_bias: u64, retirees: &[Retiree]) {
            self.calls.push(format!("add {serial_bias} {}", retirees.len()));
        }

        fn end(&mut self) {
            self.calls.push("end".into());
        }
    }

    #[test]
    fn flat_sbif_forwards_to_the_sink() {
        let mut sbif = FlatSbif::with_events_per_column(Recorder::default(), 0);
        assert_eq!(sbif.events_per_column(), 1);
        assert!(sbif.metadata().is_none());

        sbif.begin(Arc::new(MetadataDb::new()));
        sbif.add_column();
        sbif.add_column();
        let ctx = RetireeContext {
            serial_bias: 7,
            column_shift: 2,
        };
        let r = Retiree::new(0x40, AllocStamp::new(1, 1), 3);
        sbif.add_retirees(&ctx, &[r, r]);
        sbif.end();

        assert!(sbif.metadata().is_some());
        assert_eq!(sbif.columns(), 2);
        assert_eq!(sbif.into_inner().calls, vec!["begin", "add 7 2", "end"]);
    }

    #[test]
    fn context_resolves_end_and_depth() {
        let ctx = RetireeContext {
            serial_bias: 16,
            column_shift: 2,
        };
        let r = Retiree::new(0x40, AllocStamp::new(1, 1), 3);
        assert_eq!(ctx.end_serial(&r), 18);
        // Column 0 to column 4.
        assert_eq!(ctx.depth(&r), 3);
    }
}
