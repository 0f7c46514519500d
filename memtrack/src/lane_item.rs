use crate::MetadataId;

/// Serial offsets within one batch fit in this many bits.
pub const SERIAL_OFFSET_BITS: u32 = 17;

/// Largest number of events a single batch may hold.
pub const MAX_BATCH_EVENTS: usize = 1 << SERIAL_OFFSET_BITS;

/// Addresses are tracked with this many significant bits.
pub const ADDRESS_BITS: u32 = 47;

pub const ADDRESS_MASK: u64 = (1 << ADDRESS_BITS) - 1;

/// One staged event of a lane.
///
/// `key`: address (47 bits) << 17 | serial offset within the batch.
/// `payload`: metadata id (low 32 bits) | active-set index (high 32 bits).
///
/// Items order by `key`, so a sorted batch clusters by address and
/// orders by arrival within an address.
///
/// Allocations carry a non-zero metadata id. Frees and active-set
/// deletions carry zero; deletions also record the slot they delete.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaneItem {
    key: u64,
    payload: u64,
}

const _: () = assert!(std::mem::size_of::<LaneItem>() == 16);

impl LaneItem {
    const OFFSET_MASK: u64 = (1 << SERIAL_OFFSET_BITS) - 1;

    #[inline(always)]
    fn pack_key(address: u64, serial_offset: u32) -> u64 {
        debug_assert!(address <= ADDRESS_MASK);
        debug_assert!((serial_offset as u64) <= Self::OFFSET_MASK);
        (address << SERIAL_OFFSET_BITS) | serial_offset as u64
    }

    pub fn alloc(address: u64, serial_offset: u32, metadata_id: MetadataId) -> Self {
        debug_assert_ne!(metadata_id, 0);
        Self {
            key: Self::pack_key(address, serial_offset),
            payload: metadata_id as u64,
        }
    }

    pub fn free(address: u64, serial_offset: u32) -> Self {
        Self {
            key: Self::pack_key(address, serial_offset),
            payload: 0,
        }
    }

    /// A deletion of active-set slot `active_index`.
    pub fn deletion(address: u64, serial_offset: u32, active_index: usize) -> Self {
        Self {
            key: Self::pack_key(address, serial_offset),
            payload: (active_index as u64) << 32,
        }
    }

    #[inline]
    pub fn key(&self) -> u64 {
        self.key
    }

    #[inline]
    pub fn address(&self) -> u64 {
        self.key >> SERIAL_OFFSET_BITS
    }

    #[inline]
    pub fn serial_offset(&self) -> u32 {
        (self.key & Self::OFFSET_MASK) as u32
    }

    #[inline]
    pub fn metadata_id(&self) -> MetadataId {
        self.payload as u32
    }

    #[inline]
    pub fn has_metadata(&self) -> bool {
        self.metadata_id() != 0
    }

    #[inline]
    pub fn active_index(&self) -> usize {
        (self.payload >> 32) as usize
    }
}
