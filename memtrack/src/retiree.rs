use crate::{MetadataId, metadata::MAX_METADATA_ID};

/// Low address bits dropped by retirees. Allocations are assumed to be at
/// least 8 byte aligned.
pub const RETIREE_ADDRESS_SHIFT: u32 = 3;

const START_SERIAL_BITS: u32 = 36;
pub const MAX_START_SERIAL: u64 = (1 << START_SERIAL_BITS) - 1;

/// Start serial (36 bits) | metadata id (28 bits) << 36.
///
/// Stored by active-set entries and reused verbatim as the second word of
/// a [`Retiree`].
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocStamp(u64);

impl AllocStamp {
    #[inline]
    pub fn new(start_serial: u64, metadata_id: MetadataId) -> Self {
        debug_assert!(start_serial <= MAX_START_SERIAL);
        debug_assert!(metadata_id <= MAX_METADATA_ID);
        Self(
            (start_serial & MAX_START_SERIAL)
                | ((metadata_id as u64) << START_SERIAL_BITS),
        )
    }

    #[inline]
    pub fn start_serial(&self) -> u64 {
        self.0 & MAX_START_SERIAL
    }

    #[inline]
    pub fn metadata_id(&self) -> MetadataId {
        (self.0 >> START_SERIAL_BITS) as MetadataId
    }
}

/// A matched (or leaked) allocation lifetime.
///
/// `word`: address >> 3 (44 bits) | end serial biased (20 bits) << 44.
/// The end is stored relative to the serial bias the retiree is delivered
/// with, plus one; zero marks a leak that was still open at end of trace.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retiree {
    word: u64,
    stamp: AllocStamp,
}

const _: () = assert!(std::mem::size_of::<Retiree>() == 16);

impl Retiree {
    const ADDRESS_MASK: u64 = (1 << 44) - 1;
    const END_SHIFT: u32 = 44;

    /// Largest biased end a retiree can carry.
    pub const MAX_END_BIASED: u32 = (1 << 20) - 1;

    #[inline]
    pub fn new(address: u64, stamp: AllocStamp, end_serial_biased: u32) -> Self {
        debug_assert!(end_serial_biased <= Self::MAX_END_BIASED);
        let word = ((address >> RETIREE_ADDRESS_SHIFT) & Self::ADDRESS_MASK)
            | ((end_serial_biased as u64) << Self::END_SHIFT);
        Self { word, stamp }
    }

    #[inline]
    pub fn leak(address: u64, stamp: AllocStamp) -> Self {
        Self::new(address, stamp, 0)
    }

    #[inline]
    pub fn address(&self) -> u64 {
        (self.word & Self::ADDRESS_MASK) << RETIREE_ADDRESS_SHIFT
    }

    #[inline]
    pub fn end_serial_biased(&self) -> u32 {
        (self.word >> Self::END_SHIFT) as u32
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
    pub fn is_leak(&self) -> bool {
        self.end_serial_biased() == 0
    }

    /// Serial of the free, or the trace's close point for leaks.
    #[inline]
    pub fn end_serial(&self, serial_bias: u64) -> u64 {
        (serial_bias + self.end_serial_biased() as u64).wrapping_sub(1)
    }

    /// Sort key used for hierarchical emission: column depth first, then
    /// end, then start.
    #[inline]
    pub fn sort_key(&self, serial_bias: u64, column_shift: u32) -> (u32, u32, u64) {
        let depth = column_depth(
            self.start_serial(),
            self.end_serial(serial_bias),
            column_shift,
        );
        (depth, self.end_serial_biased(), self.start_serial())
    }
}

/// Number of significant bits in which the start and end column differ.
/// Zero when both serials fall into the same column.
#[inline]
pub fn column_depth(start_serial: u64, end_serial: u64, column_shift: u32) -> u32 {
    let diff = (start_serial >> column_shift) ^ (end_serial >> column_shift);
    u64::BITS - diff.leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retiree_fields_survive_packing() {
        let stamp = AllocStamp::new(MAX_START_SERIAL, MAX_METADATA_ID);
        let r = Retiree::new(0x7fff_ffff_fff8, stamp, Retiree::MAX_END_BIASED);
        assert_eq!(r.address(), 0x7fff_ffff_fff8);
        assert_eq!(r.start_serial(), MAX_START_SERIAL);
        assert_eq!(r.metadata_id(), MAX_METADATA_ID);
        assert_eq!(r.end_serial_biased(), Retiree::MAX_END_BIASED);
        assert!(!r.is_leak());
    }

    #[test]
    fn end_serial_removes_the_bias() {
        let r = Retiree::new(0x1000, AllocStamp::new(3, 1), 5);
        assert_eq!(r.end_serial(100), 104);

        let leak = Retiree::leak(0x1000, AllocStamp::new(3, 1));
        assert!(leak.is_leak());
        // Leaks close at the last admitted serial.
        assert_eq!(leak.end_serial(10), 9);
    }

    #[test]
    fn depth_counts_differing_column_bits() {
        assert_eq!(column_depth(0, 15, 4), 0);
        assert_eq!(column_depth(0, 16, 4), 1);
        assert_eq!(column_depth(15, 16, 4), 1);
        assert_eq!(column_depth(16, 63, 4), 2);
        assert_eq!(column_depth(0, 1 << 20, 4), 17);
    }

    #[test]
    fn local_intervals_sort_first() {
        let wide = Retiree::new(0x10, AllocStamp::new(0, 1), 1);
        let narrow = Retiree::new(0x20, AllocStamp::new(64, 1), 5);
        // bias 63: wide spans columns 0..=3 (depth 2), narrow stays in column 4.
        assert!(narrow.sort_key(63, 4) < wide.sort_key(63, 4));
    }
}
