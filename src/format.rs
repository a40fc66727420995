//! On-disk file header and the constants that make up the persisted file
//! format contract (the only part of this crate that must stay byte-exact
//! across versions).
//!
//! Grounded in the teacher's `RootHeader`/`RootData` double-buffered,
//! xxHash-checksummed root page (`src/lib.rs`), generalized from "a root
//! page holding a B-tree root" to "a header holding the segment table, the
//! object index location, and the top-root cell".

use crab_node::ObjectId;

use crate::error::Error;

/// Magic bytes identifying this file format.
pub const MAGIC: [u8; 8] = *b"crabtrie";

/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 1;

/// Maximum original (pre-6-bit-expansion) key length, re-exported from
/// `crab-node` since it is part of the format contract.
pub const MAX_KEY_BYTES: usize = crab_node::MAX_KEY_BYTES;

/// Fixed size of each segment, in bytes. Chosen to comfortably hold a few
/// thousand trie nodes before sealing.
pub const SEGMENT_SIZE: usize = 1 << 20;

/// Size of the fixed file header, rounded up to a page boundary so segments
/// start page-aligned.
pub const HEADER_SIZE: usize = 4096;

/// Minimum number of segments a freshly created database is given.
pub const MIN_SEGMENTS: usize = 4;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Tier {
    Hot = 0,
    Warm = 1,
    Cool = 2,
    Cold = 3,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Hot, Tier::Warm, Tier::Cool, Tier::Cold];

    pub fn colder(self) -> Tier {
        match self {
            Tier::Hot => Tier::Warm,
            Tier::Warm => Tier::Cool,
            Tier::Cool | Tier::Cold => Tier::Cold,
        }
    }

    pub fn from_u8(v: u8) -> Option<Tier> {
        match v {
            0 => Some(Tier::Hot),
            1 => Some(Tier::Warm),
            2 => Some(Tier::Cool),
            3 => Some(Tier::Cold),
            _ => None,
        }
    }
}

/// Whether a read path is allowed to bump a node to a hotter tier. An
/// ordinary enum parameter rather than a monomorphized type parameter —
/// the branch it guards is trivial and doesn't warrant generating a copy
/// of every read function per mode.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CacheMode {
    /// Promote the node to [`Tier::Hot`] on access, budget permitting.
    Promote,
    /// Leave tier placement untouched; used by full scans so they don't
    /// evict genuinely hot data to make room for a one-time sweep.
    Passthrough,
}

/// Per-tier sizing requested at open time (number of segments initially
/// reserved for that tier; the allocator grows any tier on demand).
#[derive(Clone, Copy, Debug)]
pub struct TierSizes {
    pub hot: usize,
    pub warm: usize,
    pub cool: usize,
    pub cold: usize,
}

impl Default for TierSizes {
    fn default() -> Self {
        Self {
            hot: 1,
            warm: 1,
            cool: 1,
            cold: 1,
        }
    }
}

/// Packed, checksummed file header. Stored at the start of the file and
/// rewritten only when the segment table grows or the top-root cell
/// changes; both of those are protected by the writer's exclusive lock, so
/// (unlike the teacher's reader/writer root page) there is only one copy,
/// not a double-buffered pair — readers never write it.
#[derive(Clone, Copy, bytemuck::Zeroable, bytemuck::Pod)]
#[repr(C)]
pub struct RawHeader {
    magic: [u8; 8],
    version: u32,
    segment_size: u32,
    segment_count: u32,
    object_index_capacity: u32,
    object_index_offset: u64,
    top_root: u64,
    free_id_head: u64,
    _reserved: [u8; 32],
    hash: u64,
}

pub struct Header {
    pub segment_size: u32,
    pub segment_count: u32,
    pub object_index_capacity: u32,
    pub object_index_offset: u64,
    pub top_root: ObjectId,
    pub free_id_head: u64,
}

impl Header {
    pub fn new(
        segment_count: u32,
        object_index_capacity: u32,
        object_index_offset: u64,
    ) -> Self {
        Self {
            segment_size: SEGMENT_SIZE as u32,
            segment_count,
            object_index_capacity,
            object_index_offset,
            top_root: ObjectId::NULL,
            free_id_head: 0,
        }
    }

    fn to_raw(&self) -> RawHeader {
        let mut raw = RawHeader {
            magic: MAGIC,
            version: FORMAT_VERSION,
            segment_size: self.segment_size,
            segment_count: self.segment_count,
            object_index_capacity: self.object_index_capacity,
            object_index_offset: self.object_index_offset,
            top_root: self.top_root.get(),
            free_id_head: self.free_id_head,
            _reserved: [0; 32],
            hash: 0,
        };
        let bytes = bytemuck::bytes_of(&raw);
        let hash = xxhash_rust::xxh3::xxh3_64(&bytes[..bytes.len() - 8]);
        raw.hash = hash;
        raw
    }

    /// Serialize into a page-sized buffer.
    pub fn store(&self, dst: &mut [u8]) -> Result<(), Error> {
        let raw = self.to_raw();
        let bytes = bytemuck::bytes_of(&raw);
        let Some(slot) = dst.get_mut(..bytes.len()) else {
            return Err(Error::Other("header buffer smaller than RawHeader"));
        };
        slot.copy_from_slice(bytes);
        Ok(())
    }

    /// Parse and checksum-validate a header from the start of the file.
    pub fn load(src: &[u8]) -> Result<Self, Error> {
        let size = std::mem::size_of::<RawHeader>();
        let Some(bytes) = src.get(..size) else {
            return Err(Error::DataCorruption("file shorter than the header"));
        };
        let raw: &RawHeader = bytemuck::from_bytes(bytes);
        if raw.magic != MAGIC {
            return Err(Error::VersionMismatch);
        }
        if raw.version != FORMAT_VERSION {
            return Err(Error::VersionMismatch);
        }
        let expected = xxhash_rust::xxh3::xxh3_64(&bytes[..bytes.len() - 8]);
        if expected != raw.hash {
            return Err(Error::HashFailed {
                offset: 0,
                len: size,
            });
        }
        Ok(Self {
            segment_size: raw.segment_size,
            segment_count: raw.segment_count,
            object_index_capacity: raw.object_index_capacity,
            object_index_offset: raw.object_index_offset,
            top_root: ObjectId::new(raw.top_root),
            free_id_head: raw.free_id_head,
        })
    }
}

const _: () = assert!(std::mem::size_of::<RawHeader>() <= HEADER_SIZE);
