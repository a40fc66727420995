//! The 40-bit object-id → {segment, offset, type, tier, refcount} redirection
//! table. Each entry is packed into a single `u64` and mutated with atomic
//! compare-exchange loops so that `retain`/`release` never need the
//! writer's lock — any reader dropping a root handle can safely touch the
//! same entry the writer is reading.
//!
//! Grounded in the teacher's atomic refcount discipline described for the
//! page-read tracker (`src/lib.rs`'s `PageReadTracker`/`IdTracker`), but
//! the entry itself (segment-id/offset/type/tier/refcount in 8 bytes) is
//! this crate's own encoding of spec's object-index entry.

use std::sync::atomic::{AtomicU64, Ordering};

use crab_node::ObjectId;

use crate::error::Error;
use crate::format::Tier;
use crate::segment::RecordType;

/// Maximum refcount value before saturation; callers must clone to mint a
/// fresh id rather than the index silently widening storage.
pub const MAX_REFCOUNT: u32 = 0xFFF;

const FREE_TAG: u64 = 0x3;
const LOCATION_MASK: u64 = (1u64 << 48) - 1;

#[derive(Clone, Copy, Debug)]
pub struct Location {
    pub segment_id: u32,
    pub offset: u32,
    pub rtype: RecordType,
    pub tier: Tier,
    pub refcount: u32,
}

fn encode(segment_id: u32, offset: u32, rtype: RecordType, tier: Tier, refcount: u32) -> u64 {
    debug_assert!(segment_id <= u16::MAX as u32);
    let location = (segment_id as u64 & 0xFFFF) | ((offset as u64) << 16);
    let tag = rtype.to_u8() as u64 & 0x3;
    let tier_bits = (tier as u64) & 0x3;
    let rc = (refcount as u64).min(MAX_REFCOUNT as u64) & 0xFFF;
    location | (tag << 48) | (tier_bits << 50) | (rc << 52)
}

fn decode(bits: u64) -> Option<Location> {
    let tag = (bits >> 48) & 0x3;
    if tag == FREE_TAG {
        return None;
    }
    let segment_id = (bits & 0xFFFF) as u32;
    let offset = ((bits >> 16) & 0xFFFF_FFFF) as u32;
    let rtype = RecordType::from_u8(tag as u8).expect("tag != FREE_TAG implies 0..=2");
    let tier = Tier::from_u8(((bits >> 50) & 0x3) as u8).unwrap_or(Tier::Cold);
    let refcount = ((bits >> 52) & 0xFFF) as u32;
    Some(Location {
        segment_id,
        offset,
        rtype,
        tier,
        refcount,
    })
}

fn encode_free(next: u64) -> u64 {
    (next & LOCATION_MASK) | (FREE_TAG << 48)
}

fn decode_free(bits: u64) -> Option<u64> {
    if (bits >> 48) & 0x3 == FREE_TAG {
        Some(bits & LOCATION_MASK)
    } else {
        None
    }
}

/// The object index array itself: a slice of atomic cells directly inside
/// the mapping.
pub struct ObjectIndex {
    entries: &'static [AtomicU64],
}

impl ObjectIndex {
    /// # Safety
    /// `entries` must point at a region of the mapping that outlives every
    /// use of the returned `ObjectIndex`, per the same contract as
    /// `StorageInner::get_maps`.
    pub unsafe fn new(entries: &'static [AtomicU64]) -> Self {
        Self { entries }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn cell(&self, id: ObjectId) -> Result<&AtomicU64, Error> {
        self.entries
            .get(id.get() as usize)
            .ok_or(Error::DataCorruption("object id out of index bounds"))
    }

    /// Install a brand-new entry with refcount 1. The slot must currently
    /// be free (the allocator only calls this with an id it just popped
    /// off the free list or never handed out before).
    pub fn install(
        &self,
        id: ObjectId,
        segment_id: u32,
        offset: u32,
        rtype: RecordType,
        tier: Tier,
    ) -> Result<(), Error> {
        let cell = self.cell(id)?;
        cell.store(encode(segment_id, offset, rtype, tier, 1), Ordering::Release);
        Ok(())
    }

    pub fn lookup(&self, id: ObjectId) -> Result<Location, Error> {
        if id.is_null() {
            return Err(Error::DataCorruption("lookup of the null object id"));
        }
        let bits = self.cell(id)?.load(Ordering::Acquire);
        decode(bits).ok_or(Error::DataCorruption("object id refers to a freed slot"))
    }

    /// Atomic refcount increment, saturating at [`MAX_REFCOUNT`]. Returns
    /// the location so the caller can check for saturation and decide to
    /// clone instead.
    pub fn retain(&self, id: ObjectId) -> Result<Location, Error> {
        let cell = self.cell(id)?;
        let mut current = cell.load(Ordering::Acquire);
        loop {
            let Some(loc) = decode(current) else {
                return Err(Error::DataCorruption("retain of a freed object id"));
            };
            let new_rc = (loc.refcount + 1).min(MAX_REFCOUNT);
            let new_bits = encode(loc.segment_id, loc.offset, loc.rtype, loc.tier, new_rc);
            match cell.compare_exchange_weak(
                current,
                new_bits,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(Location {
                        refcount: new_rc,
                        ..loc
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Atomic refcount decrement. Returns `true` if this decrement brought
    /// the count to zero (the caller must then enqueue the id for deferred
    /// reclamation).
    pub fn release(&self, id: ObjectId) -> Result<bool, Error> {
        let cell = self.cell(id)?;
        let mut current = cell.load(Ordering::Acquire);
        loop {
            let Some(loc) = decode(current) else {
                return Err(Error::DataCorruption("release of a freed object id"));
            };
            if loc.refcount == 0 {
                return Err(Error::DataCorruption("refcount underflow"));
            }
            let new_rc = loc.refcount - 1;
            let new_bits = encode(loc.segment_id, loc.offset, loc.rtype, loc.tier, new_rc);
            match cell.compare_exchange_weak(
                current,
                new_bits,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(new_rc == 0),
                Err(actual) => current = actual,
            }
        }
    }

    /// Writer-only: swing an entry's location after compaction copies its
    /// payload forward. The refcount and type are carried over unchanged.
    pub fn relocate(
        &self,
        id: ObjectId,
        new_segment_id: u32,
        new_offset: u32,
        new_tier: Tier,
    ) -> Result<(), Error> {
        let cell = self.cell(id)?;
        let current = cell.load(Ordering::Acquire);
        let loc = decode(current).ok_or(Error::DataCorruption("relocate of a freed object id"))?;
        let new_bits = encode(new_segment_id, new_offset, loc.rtype, new_tier, loc.refcount);
        cell.store(new_bits, Ordering::Release);
        Ok(())
    }

    /// Writer-only: forcibly set the refcount, used by `recursive_retain`
    /// recovery which walks the whole reachable set in a single pass
    /// rather than pairwise increments.
    pub fn set_refcount(&self, id: ObjectId, refcount: u32) -> Result<(), Error> {
        let cell = self.cell(id)?;
        let current = cell.load(Ordering::Acquire);
        let loc = decode(current).ok_or(Error::DataCorruption("set_refcount of a freed slot"))?;
        let new_bits = encode(
            loc.segment_id,
            loc.offset,
            loc.rtype,
            loc.tier,
            refcount.min(MAX_REFCOUNT),
        );
        cell.store(new_bits, Ordering::Release);
        Ok(())
    }

    /// Writer-only: mark a slot free and chain it onto the free list,
    /// returning the previous head so the caller can update the header.
    pub fn free(&self, id: ObjectId, previous_free_head: u64) -> Result<(), Error> {
        let cell = self.cell(id)?;
        cell.store(encode_free(previous_free_head), Ordering::Release);
        Ok(())
    }

    /// Writer-only: read the next-free pointer out of a slot already
    /// marked free (used while popping the free list).
    pub fn free_next(&self, raw_id: u64) -> Result<Option<u64>, Error> {
        let cell = self
            .entries
            .get(raw_id as usize)
            .ok_or(Error::DataCorruption("free id out of index bounds"))?;
        Ok(decode_free(cell.load(Ordering::Acquire)))
    }

    /// True if the slot at `id` is on the free list (never allocated, or
    /// freed and not yet reused).
    pub fn is_free(&self, id: ObjectId) -> bool {
        self.entries
            .get(id.get() as usize)
            .map(|c| decode(c.load(Ordering::Acquire)).is_none())
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_index(cap: usize) -> (Vec<AtomicU64>, ()) {
        (Vec::from_iter((0..cap).map(|_| AtomicU64::new(encode_free(0)))), ())
    }

    unsafe fn as_index(v: &Vec<AtomicU64>) -> ObjectIndex {
        let slice: &'static [AtomicU64] = std::mem::transmute(v.as_slice());
        ObjectIndex::new(slice)
    }

    #[test]
    fn install_lookup_retain_release_roundtrip() {
        let (storage, _) = make_index(8);
        let idx = unsafe { as_index(&storage) };
        let id = ObjectId::new(3);
        idx.install(id, 1, 128, RecordType::ValueBytes, Tier::Hot).unwrap();
        let loc = idx.lookup(id).unwrap();
        assert_eq!(loc.segment_id, 1);
        assert_eq!(loc.offset, 128);
        assert_eq!(loc.refcount, 1);

        idx.retain(id).unwrap();
        assert_eq!(idx.lookup(id).unwrap().refcount, 2);

        assert!(!idx.release(id).unwrap());
        assert!(idx.release(id).unwrap());
    }

    #[test]
    fn refcount_saturates() {
        let (storage, _) = make_index(4);
        let idx = unsafe { as_index(&storage) };
        let id = ObjectId::new(1);
        idx.install(id, 0, 0, RecordType::Inner, Tier::Hot).unwrap();
        for _ in 0..(MAX_REFCOUNT + 10) {
            idx.retain(id).unwrap();
        }
        assert_eq!(idx.lookup(id).unwrap().refcount, MAX_REFCOUNT);
    }

    #[test]
    fn free_list_chains() {
        let (storage, _) = make_index(4);
        let idx = unsafe { as_index(&storage) };
        idx.free(ObjectId::new(1), 0).unwrap();
        idx.free(ObjectId::new(2), 1).unwrap();
        assert!(idx.is_free(ObjectId::new(1)));
        assert!(idx.is_free(ObjectId::new(2)));
        assert_eq!(idx.free_next(2).unwrap(), Some(1));
    }
}
