//! Deduplication of allocation metadata into small ids.
//!
//! Every distinct `{owner, size, alignment, tag, is_realloc}` tuple is
//! packed into a 16 byte [`MetadataEntry`] and stored once. The entry's
//! index (biased by one) is the [`MetadataId`] carried by lane items,
//! active-set entries and retirees.

use std::{collections::HashMap, fmt};

use log::{error, warn};
use parking_lot::RwLock;

/// Biased index into the metadata table. Zero never names an entry.
pub type MetadataId = u32;

/// Ids must fit the 28 bit field of retirees and active-set entries.
pub const MAX_METADATA_ID: MetadataId = (1 << 28) - 1;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
const REMIX: u64 = 0x9e37_79b9_7f4a_7c15;

/// Allocation metadata as reported by the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Metadata {
    pub owner: u64,
    pub size: u64,
    pub alignment: u32,
    pub tag: u32,
    pub is_realloc: bool,
}

/// Densely packed metadata record.
///
/// `word`: owner (56 bits) | log2(alignment) (4 bits) | realloc (1 bit) |
/// size & 7 (3 bits). The rest of the size lives in `size_hi`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataEntry {
    word: u64,
    size_hi: u32,
    tag: u32,
}

const _: () = assert!(std::mem::size_of::<MetadataEntry>() == 16);

impl MetadataEntry {
    const OWNER_MASK: u64 = (1 << 56) - 1;
    const ALIGN_SHIFT: u32 = 56;
    const ALIGN_MASK: u64 = 0xf;
    const REALLOC_BIT: u64 = 1 << 60;
    const SIZE_LO_SHIFT: u32 = 61;
    const MAX_SIZE: u64 = ((u32::MAX as u64) << 3) | 7;
    const MAX_ALIGN_LOG2: u32 = 15;

    pub fn pack(metadata: &Metadata) -> Self {
        let owner = if metadata.owner > Self::OWNER_MASK {
            warn!("metadata owner {:#x} exceeds 56 bits", metadata.owner);
            metadata.owner & Self::OWNER_MASK
        } else {
            metadata.owner
        };

        let size = if metadata.size > Self::MAX_SIZE {
            warn!("allocation size {} clamped", metadata.size);
            Self::MAX_SIZE
        } else {
            metadata.size
        };

        let align_log2 = metadata
            .alignment
            .max(1)
            .checked_next_power_of_two()
            .map_or(Self::MAX_ALIGN_LOG2, |a| a.trailing_zeros())
            .min(Self::MAX_ALIGN_LOG2);

        let mut word = owner;
        word |= (align_log2 as u64) << Self::ALIGN_SHIFT;
        if metadata.is_realloc {
            word |= Self::REALLOC_BIT;
        }
        word |= (size & 7) << Self::SIZE_LO_SHIFT;

        Self {
            word,
            size_hi: (size >> 3) as u32,
            tag: metadata.tag,
        }
    }

    #[inline]
    pub fn owner(&self) -> u64 {
        self.word & Self::OWNER_MASK
    }

    #[inline]
    pub fn size(&self) -> u64 {
        ((self.size_hi as u64) << 3) | (self.word >> Self::SIZE_LO_SHIFT)
    }

    #[inline]
    pub fn alignment(&self) -> u32 {
        1 << ((self.word >> Self::ALIGN_SHIFT) & Self::ALIGN_MASK)
    }

    #[inline]
    pub fn tag(&self) -> u32 {
        self.tag
    }

    #[inline]
    pub fn is_realloc(&self) -> bool {
        self.word & Self::REALLOC_BIT != 0
    }

    pub fn unpack(&self) -> Metadata {
        Metadata {
            owner: self.owner(),
            size: self.size(),
            alignment: self.alignment(),
            tag: self.tag(),
            is_realloc: self.is_realloc(),
        }
    }

    fn hash(&self) -> u64 {
        let mut hash = FNV_OFFSET;
        let bytes = self
            .word
            .to_le_bytes()
            .into_iter()
            .chain(self.size_hi.to_le_bytes())
            .chain(self.tag.to_le_bytes());
        for byte in bytes {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        hash
    }
}

struct MetadataDbImpl {
    entries: Vec<MetadataEntry>,
    map: HashMap<u32, u32, ahash::RandomState>,
    collisions: u64,
    max_id: MetadataId,
    exhausted: bool,
}

impl MetadataDbImpl {
    fn new(max_id: MetadataId) -> Self {
        Self {
            entries: Vec::new(),
            map: HashMap::default(),
            collisions: 0,
            max_id,
            exhausted: false,
        }
    }

    fn get_or_add(&mut self, entry: MetadataEntry) -> Option<MetadataId> {
        let mut hash = entry.hash();
        loop {
            let key = hash as u32;
            match self.map.get(&key) {
                None => {
                    let index = self.entries.len() as u32;
                    let id = index + 1;
                    if id > self.max_id {
                        if !self.exhausted {
                            error!("metadata id space exhausted at {} entries", self.entries.len());
                            self.exhausted = true;
                        }
                        return None;
                    }
                    self.entries.push(entry);
                    self.map.insert(key, index);
                    return Some(id);
                }
                Some(&index) if self.entries[index as usize] == entry => {
                    return Some(index + 1);
                }
                Some(_) => {
                    self.collisions += 1;
                    hash = hash.wrapping_mul(REMIX);
                }
            }
        }
    }
}

/// Process-wide metadata table shared by all lanes.
pub struct MetadataDb(RwLock<MetadataDbImpl>);

impl fmt::Debug for MetadataDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let db = self.0.read();
        f.debug_struct("MetadataDb")
            .field("entries", &db.entries.len())
            .field("collisions", &db.collisions)
            .finish()
    }
}

impl Default for MetadataDb {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataDb {
    pub fn new() -> Self {
        Self(RwLock::new(MetadataDbImpl::new(MAX_METADATA_ID)))
    }

    #[cfg(test)]
    pub(crate) fn with_max_id(max_id: MetadataId) -> Self {
        Self(RwLock::new(MetadataDbImpl::new(max_id.min(MAX_METADATA_ID))))
    }

    /// Returns the id of `metadata`, adding it if it is new. `None` once
    /// the id space is exhausted and `metadata` is not stored yet.
    pub fn add(&self, metadata: &Metadata) -> Option<MetadataId> {
        let entry = MetadataEntry::pack(metadata);
        self.0.write().get_or_add(entry)
    }

    pub fn get(&self, id: MetadataId) -> Option<MetadataEntry> {
        let index = id.checked_sub(1)? as usize;
        self.0.read().entries.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.0.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of truncated-key collisions resolved by re-mixing.
    pub fn collisions(&self) -> u64 {
        self.0.read().collisions
    }
}
