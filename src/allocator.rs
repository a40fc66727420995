//! The segment allocator: ties the mapping, the segment table, and the
//! object index together, and implements `crab_node`'s `Resolver`/`Writer`
//! seam so the trie engine can operate directly against live storage.
//!
//! Grounded in the teacher's `RawMemory`/`DbCore` (`src/lib.rs`): raw,
//! unbounded-lifetime slices pulled out of the mapping under a mutex,
//! handed out for lock-free reads, with all mutation funneled through the
//! single writer. The teacher's version tracks 4 KiB pages; this one
//! tracks `SEGMENT_SIZE` segments of packed, variable-length node records.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crab_node::{InnerNode, NodeType, ObjectId, Resolver, ValueNode, ValuePayload, Writer as NodeWriter};

use crate::error::Error;
use crate::format::{CacheMode, Tier, SEGMENT_SIZE};
use crate::object_index::{Location, ObjectIndex, MAX_REFCOUNT};
use crate::segment::{RecordType, Segment};
use crate::session::SessionTable;
use crate::storage::StorageInner;

/// One slot per tier tracking the segment currently accepting appends.
#[derive(Default)]
struct OpenHeads {
    by_tier: [Option<u32>; 4],
}

pub struct Allocator {
    storage: Mutex<StorageInner>,
    /// One raw, unbounded-lifetime slice per segment. Only ever grows;
    /// existing entries are never removed, matching the teacher's
    /// `RawMemory::maps` (append-only list of mapped regions).
    segments: Mutex<Vec<&'static mut [u8]>>,
    open: Mutex<OpenHeads>,
    /// Segments that became fully empty after compaction and can be
    /// reinitialized for a fresh tier before growing the file further.
    free_segments: Mutex<Vec<usize>>,
    index: ObjectIndex,
    next_id: AtomicU64,
    free_head: Mutex<u64>,
    /// Ids whose refcount hit zero, tagged with the tick at which that
    /// happened; drained by [`Allocator::reclaim`] once no live session
    /// predates the tag.
    deferred: Mutex<VecDeque<(u64, ObjectId)>>,
    /// Per-object read pins; compaction skips anything with a nonzero count
    /// here, and `is_unique` reports `false` while one is held, so the trie
    /// falls back to copy-on-write instead of calling `edit`.
    pins: Mutex<HashMap<ObjectId, u32>>,
}

impl Allocator {
    /// # Safety
    /// `segments` must be raw slices over the live mapping backing
    /// `storage`, each exactly `SEGMENT_SIZE` bytes, and must not be used
    /// after `storage`'s maps are unmapped.
    pub unsafe fn new(
        storage: StorageInner,
        segments: Vec<&'static mut [u8]>,
        index: ObjectIndex,
        next_id: u64,
        free_head: u64,
    ) -> Self {
        Self {
            storage: Mutex::new(storage),
            segments: Mutex::new(segments),
            open: Mutex::new(OpenHeads::default()),
            free_segments: Mutex::new(Vec::new()),
            index,
            next_id: AtomicU64::new(next_id),
            free_head: Mutex::new(free_head),
            deferred: Mutex::new(VecDeque::new()),
            pins: Mutex::new(HashMap::new()),
        }
    }

    pub fn index(&self) -> &ObjectIndex {
        &self.index
    }

    pub fn segment_count(&self) -> usize {
        self.segments.lock().unwrap().len()
    }

    pub fn free_id_head(&self) -> u64 {
        *self.free_head.lock().unwrap()
    }

    pub fn next_id_watermark(&self) -> u64 {
        self.next_id.load(Ordering::Acquire)
    }

    fn with_segment_ref<T>(&self, idx: usize, f: impl FnOnce(&Segment) -> T) -> Result<T, Error> {
        let mut segments = self.segments.lock().unwrap();
        let mem = segments
            .get_mut(idx)
            .ok_or(Error::DataCorruption("segment index out of bounds"))?;
        let view = unsafe { Segment::new(mem) };
        Ok(f(&view))
    }

    fn with_segment_mut<T>(&self, idx: usize, f: impl FnOnce(&mut Segment) -> T) -> Result<T, Error> {
        let mut segments = self.segments.lock().unwrap();
        let mem = segments
            .get_mut(idx)
            .ok_or(Error::DataCorruption("segment index out of bounds"))?;
        let mut view = unsafe { Segment::new(mem) };
        Ok(f(&mut view))
    }

    /// Open (or grow into) a fresh segment for `tier`, reusing a
    /// compacted-empty segment if one is available.
    fn open_new_segment(&self, tier: Tier) -> Result<usize, Error> {
        if let Some(idx) = self.free_segments.lock().unwrap().pop() {
            self.with_segment_mut(idx, |seg| seg.init(idx as u32, tier))?;
            return Ok(idx);
        }
        let mut storage = self.storage.lock().unwrap();
        let new_bytes = match unsafe { storage.expand(SEGMENT_SIZE)? } {
            crate::storage::ExpandStorage::ReplaceLastMap(slice)
            | crate::storage::ExpandStorage::NewMap(slice) => slice,
        };
        drop(storage);
        let mut segments = self.segments.lock().unwrap();
        let idx = segments.len();
        // `ReplaceLastMap` grows the final mapping in place; the previous
        // entry's slice is now stale (same backing memory, different
        // length) so we only ever append the freshly expanded tail here
        // and treat the whole tail as the new segment's bytes.
        let seg_start = new_bytes.len() - SEGMENT_SIZE;
        segments.push(&mut new_bytes[seg_start..]);
        drop(segments);
        self.with_segment_mut(idx, |seg| seg.init(idx as u32, tier))?;
        Ok(idx)
    }

    fn mint_id(&self) -> Result<ObjectId, Error> {
        let mut head = self.free_head.lock().unwrap();
        if *head != 0 {
            let id = ObjectId::new(*head);
            *head = self.index.free_next(*head)?.unwrap_or(0);
            return Ok(id);
        }
        let raw = self.next_id.fetch_add(1, Ordering::AcqRel);
        if raw > crab_node::MAX_OBJECT_ID {
            return Err(Error::OutOfSpace(0));
        }
        Ok(ObjectId::new(raw))
    }

    /// Allocate a new object, writing `payload` into the hottest tier
    /// segment with room (sealing and opening segments as needed).
    pub fn allocate(&self, rtype: RecordType, payload: &[u8], tier: Tier) -> Result<ObjectId, Error> {
        let id = self.mint_id()?;
        let mut open = self.open.lock().unwrap();
        let tier_slot = &mut open.by_tier[tier as usize];
        loop {
            let idx = match *tier_slot {
                Some(idx) => idx,
                None => self.open_new_segment(tier)?,
            };
            let result = self.with_segment_mut(idx, |seg| seg.append(id, rtype, payload))?;
            match result {
                Ok(offset) => {
                    self.index.install(id, idx as u32, offset, rtype, tier)?;
                    *tier_slot = Some(idx);
                    return Ok(id);
                }
                Err(Error::OutOfSpace(_)) => {
                    self.with_segment_mut(idx, |seg| seg.seal())?;
                    *tier_slot = None;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn lookup(&self, id: ObjectId) -> Result<Location, Error> {
        self.index.lookup(id)
    }

    pub(crate) fn payload_bytes(&self, loc: Location) -> Result<Vec<u8>, Error> {
        self.with_segment_ref(loc.segment_id as usize, |seg| -> Result<Vec<u8>, Error> {
            let len = seg.record_len(loc.offset)?;
            Ok(seg.payload(loc.offset, len)?.to_vec())
        })?
    }

    pub fn retain_id(&self, id: ObjectId) -> Result<(), Error> {
        if id.is_null() {
            return Ok(());
        }
        self.index.retain(id)?;
        Ok(())
    }

    /// Decrement `id`'s refcount; if it reaches zero, enqueue for deferred
    /// reclamation tagged with the current tick (readers holding an older
    /// ancestor handle are unaffected; `reclaim` will not touch this id
    /// until no live session predates `tick`).
    pub fn release_id(&self, id: ObjectId, tick: u64) -> Result<(), Error> {
        if id.is_null() {
            return Ok(());
        }
        if self.index.release(id)? {
            self.deferred.lock().unwrap().push_back((tick, id));
        }
        Ok(())
    }

    /// Take a read pin on `id`: compaction will skip its storage and
    /// `is_unique` will report it non-unique until a matching `unpin`.
    /// Pins nest; the id stays pinned until every `pin` call is matched.
    pub fn pin(&self, id: ObjectId) {
        *self.pins.lock().unwrap().entry(id).or_insert(0) += 1;
    }

    pub fn unpin(&self, id: ObjectId) {
        let mut pins = self.pins.lock().unwrap();
        if let Some(count) = pins.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&id);
            }
        }
    }

    fn is_pinned(&self, id: ObjectId) -> bool {
        self.pins.lock().unwrap().contains_key(&id)
    }

    /// Borrow an object's current encoded bytes directly out of segment
    /// memory, without copying. Only valid to call while `id` is pinned
    /// (via [`Self::pin`]); compaction skips pinned storage outright, and
    /// the trie's `is_unique` check (which gates `edit`) reports a pinned
    /// object as non-unique, so a pin keeps this slice valid until the
    /// matching `unpin`.
    pub fn payload_slice(&self, id: ObjectId) -> Result<&'static [u8], Error> {
        let loc = self.index.lookup(id)?;
        self.with_segment_ref(loc.segment_id as usize, |seg| -> Result<&'static [u8], Error> {
            let len = seg.record_len(loc.offset)?;
            let slice = seg.payload(loc.offset, len)?;
            Ok(unsafe { std::slice::from_raw_parts(slice.as_ptr(), slice.len()) })
        })?
    }

    /// Rewrite an object's encoded bytes in place, keeping its id fixed, for
    /// a caller that has already proven the object unique via `is_unique`
    /// (the trie only calls `edit_inner`/`edit_value` under that guard).
    ///
    /// If the new encoding fits within the record's originally declared
    /// length, the bytes are rewritten in place and the record's length
    /// field is shrunk to match. Otherwise the record can't grow where it
    /// sits (segments are append-only), so the payload is relocated to a
    /// fresh allocation at the new size and `id`'s index entry is
    /// repointed at it — the same relocate-and-free-the-scratch-id pattern
    /// `promote` uses to move a warmed object to a hotter tier.
    pub fn edit(&self, id: ObjectId, rtype: RecordType, bytes: &[u8]) -> Result<(), Error> {
        let loc = self.index.lookup(id)?;
        let existing_len = self.with_segment_ref(loc.segment_id as usize, |seg| {
            seg.record_len(loc.offset)
        })??;
        if bytes.len() as u32 <= existing_len {
            self.with_segment_mut(loc.segment_id as usize, |seg| -> Result<(), Error> {
                let slot = seg.payload_mut(loc.offset, bytes.len() as u32)?;
                slot.copy_from_slice(bytes);
                seg.set_record_len(loc.offset, bytes.len() as u32)
            })??;
            return Ok(());
        }
        let new_id = self.allocate(rtype, bytes, loc.tier)?;
        let new_loc = self.index.lookup(new_id)?;
        self.index.relocate(id, new_loc.segment_id, new_loc.offset, loc.tier)?;
        self.with_segment_mut(loc.segment_id as usize, |seg| seg.mark_dead(existing_len))?;
        let mut head = self.free_head.lock().unwrap();
        self.index.free(new_id, *head)?;
        *head = new_id.get();
        Ok(())
    }

    /// Drain deferred-free entries whose tick predates `min_live_age`,
    /// recursively releasing their children (iteratively, via an explicit
    /// work list, not recursion) and returning their storage to the free
    /// list.
    pub fn reclaim(&self, min_live_age: u64) -> Result<usize, Error> {
        let mut ready = Vec::new();
        {
            let mut deferred = self.deferred.lock().unwrap();
            while let Some(&(tick, _)) = deferred.front() {
                if tick >= min_live_age {
                    break;
                }
                ready.push(deferred.pop_front().unwrap().1);
            }
        }
        let mut work: VecDeque<ObjectId> = ready.into();
        let mut reclaimed = 0;
        while let Some(id) = work.pop_front() {
            if id.is_null() || self.index.is_free(id) {
                continue;
            }
            let loc = self.index.lookup(id)?;
            if loc.refcount != 0 {
                // Resurrected by a retain racing the original free (e.g.
                // a clone-on-saturation bump); nothing to reclaim.
                continue;
            }
            let bytes = self.payload_bytes(loc)?;
            match loc.rtype {
                RecordType::Inner => {
                    let node = InnerNode::decode(&bytes)?;
                    if !node.value.is_null() {
                        self.cascade_release(node.value, &mut work)?;
                    }
                    for child in node.children() {
                        self.cascade_release(*child, &mut work)?;
                    }
                }
                RecordType::ValueBytes => {}
                RecordType::ValueRoots => {
                    let node = ValueNode::decode(&bytes)?;
                    if let ValuePayload::Roots(ids) = node.payload {
                        for rid in ids {
                            self.cascade_release(rid, &mut work)?;
                        }
                    }
                }
            }
            self.with_segment_mut(loc.segment_id as usize, |seg| {
                seg.mark_dead(bytes.len() as u32)
            })?;
            let mut head = self.free_head.lock().unwrap();
            self.index.free(id, *head)?;
            *head = id.get();
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    /// Fold a batch of ids the recovery walk never reached back onto the
    /// free list; unlike [`Self::reclaim`], these need no cascade — an id
    /// unreachable from the top root implies everything it itself points
    /// to is either unreachable too (and already in this same batch) or
    /// shared with something reachable (and thus left untouched).
    pub(crate) fn discard_orphans(&self, ids: &[ObjectId]) -> Result<usize, Error> {
        let mut reclaimed = 0;
        for &id in ids {
            if id.is_null() || self.index.is_free(id) {
                continue;
            }
            let loc = self.index.lookup(id)?;
            let len = self.with_segment_ref(loc.segment_id as usize, |seg| seg.record_len(loc.offset))??;
            self.with_segment_mut(loc.segment_id as usize, |seg| seg.mark_dead(len))?;
            let mut head = self.free_head.lock().unwrap();
            self.index.free(id, *head)?;
            *head = id.get();
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    fn cascade_release(&self, id: ObjectId, work: &mut VecDeque<ObjectId>) -> Result<(), Error> {
        if id.is_null() {
            return Ok(());
        }
        if self.index.release(id)? {
            work.push_back(id);
        }
        Ok(())
    }

    /// Bump `id` to [`Tier::Hot`] if it isn't already there and nothing has
    /// it pinned. Best-effort: a pinned or already-hot object is left
    /// alone rather than treated as an error, since promotion is purely an
    /// access-pattern optimization, never required for correctness.
    pub fn promote(&self, id: ObjectId) -> Result<(), Error> {
        if id.is_null() {
            return Ok(());
        }
        let loc = self.index.lookup(id)?;
        if loc.tier == Tier::Hot || self.is_pinned(id) {
            return Ok(());
        }
        let bytes = self.payload_bytes(loc)?;
        let new_id = self.allocate(loc.rtype, &bytes, Tier::Hot)?;
        let new_loc = self.index.lookup(new_id)?;
        self.index.relocate(id, new_loc.segment_id, new_loc.offset, Tier::Hot)?;
        self.with_segment_mut(loc.segment_id as usize, |seg| {
            seg.mark_dead(bytes.len() as u32)
        })?;
        let mut head = self.free_head.lock().unwrap();
        self.index.free(new_id, *head)?;
        *head = new_id.get();
        Ok(())
    }

    /// Pick the sealed, non-empty segment with the greatest dead-byte
    /// ratio and compact its still-live, unpinned objects into a cooler
    /// tier.
    pub fn compact_one(&self) -> Result<Option<u32>, Error> {
        let segment_count = self.segment_count();
        let mut best: Option<(usize, f64)> = None;
        for idx in 0..segment_count {
            let (sealed, live, ratio) = self.with_segment_ref(idx, |seg| {
                (seg.sealed(), seg.live_count(), seg.dead_ratio())
            })?;
            if !sealed || live == 0 {
                continue;
            }
            if best.map(|(_, r)| ratio > r).unwrap_or(true) {
                best = Some((idx, ratio));
            }
        }
        let Some((idx, _)) = best else {
            return Ok(None);
        };
        self.compact_segment(idx)?;
        Ok(Some(idx as u32))
    }

    fn compact_segment(&self, idx: usize) -> Result<(), Error> {
        let (tier, records) = self.with_segment_ref(idx, |seg| {
            let tier = seg.tier();
            let records: Vec<(ObjectId, RecordType, Vec<u8>)> = seg
                .scan()
                .filter_map(|r| r.ok())
                .map(|r| (r.object_id, r.rtype, r.payload.to_vec()))
                .collect();
            (tier, records)
        })?;
        let dest_tier = tier.colder();
        let mut all_moved = true;
        for (id, rtype, payload) in records {
            if self.index.is_free(id) {
                continue;
            }
            let loc = self.index.lookup(id)?;
            if loc.segment_id as usize != idx {
                // Already relocated by a previous pass.
                continue;
            }
            if self.is_pinned(id) {
                all_moved = false;
                continue;
            }
            let new_id = self.allocate(rtype, &payload, dest_tier)?;
            // `allocate` minted a fresh id; swing the *original* id's
            // index entry to the new location instead, then free the
            // scratch id we just minted.
            let new_loc = self.index.lookup(new_id)?;
            self.index
                .relocate(id, new_loc.segment_id, new_loc.offset, dest_tier)?;
            let mut head = self.free_head.lock().unwrap();
            self.index.free(new_id, *head)?;
            *head = new_id.get();
        }
        if all_moved {
            self.with_segment_mut(idx, |seg| {
                let dead = seg.write_cursor();
                if seg.dead_bytes() < dead {
                    seg.mark_dead(dead - seg.dead_bytes());
                }
            })?;
            self.free_segments.lock().unwrap().push(idx);
        }
        Ok(())
    }
}

/// View adapting a session's access to the allocator into `crab_node`'s
/// `Resolver`/`Writer` seam.
pub struct Engine<'a> {
    pub alloc: &'a Allocator,
    pub sessions: &'a SessionTable,
    pub tier: Tier,
    pub cache_mode: CacheMode,
}

impl Resolver for Engine<'_> {
    fn resolve_inner(&self, id: ObjectId) -> Result<InnerNode, crab_node::Error> {
        if self.cache_mode == CacheMode::Promote {
            let _ = self.alloc.promote(id);
        }
        let loc = self.alloc.lookup(id).map_err(to_node_err)?;
        let bytes = self.alloc.payload_bytes(loc).map_err(to_node_err)?;
        InnerNode::decode(&bytes)
    }

    fn resolve_value(&self, id: ObjectId) -> Result<ValueNode, crab_node::Error> {
        if self.cache_mode == CacheMode::Promote {
            let _ = self.alloc.promote(id);
        }
        let loc = self.alloc.lookup(id).map_err(to_node_err)?;
        let bytes = self.alloc.payload_bytes(loc).map_err(to_node_err)?;
        ValueNode::decode(&bytes)
    }

    fn node_type(&self, id: ObjectId) -> Result<NodeType, crab_node::Error> {
        let loc = self.alloc.lookup(id).map_err(to_node_err)?;
        Ok(loc.rtype.to_node_type())
    }
}

impl NodeWriter for Engine<'_> {
    fn is_unique(&self, id: ObjectId) -> bool {
        self.alloc
            .lookup(id)
            .map(|loc| loc.refcount == 1 && !self.alloc.is_pinned(id))
            .unwrap_or(false)
    }

    fn alloc_inner(&mut self, node: &InnerNode) -> Result<ObjectId, crab_node::Error> {
        self.alloc
            .allocate(RecordType::Inner, &node.encode(), self.tier)
            .map_err(to_node_err)
    }

    fn alloc_value(&mut self, node: &ValueNode) -> Result<ObjectId, crab_node::Error> {
        let rtype = match &node.payload {
            ValuePayload::Bytes(_) => RecordType::ValueBytes,
            ValuePayload::Roots(_) => RecordType::ValueRoots,
        };
        self.alloc
            .allocate(rtype, &node.encode(), self.tier)
            .map_err(to_node_err)
    }

    fn edit_inner(&mut self, id: ObjectId, node: &InnerNode) -> Result<(), crab_node::Error> {
        self.alloc
            .edit(id, RecordType::Inner, &node.encode())
            .map_err(to_node_err)
    }

    fn edit_value(&mut self, id: ObjectId, node: &ValueNode) -> Result<(), crab_node::Error> {
        let rtype = match &node.payload {
            ValuePayload::Bytes(_) => RecordType::ValueBytes,
            ValuePayload::Roots(_) => RecordType::ValueRoots,
        };
        self.alloc.edit(id, rtype, &node.encode()).map_err(to_node_err)
    }

    fn retain(&mut self, id: ObjectId) -> Result<ObjectId, crab_node::Error> {
        if id.is_null() {
            return Ok(id);
        }
        let loc = self.alloc.lookup(id).map_err(to_node_err)?;
        if loc.refcount < MAX_REFCOUNT {
            self.alloc.retain_id(id).map_err(to_node_err)?;
            return Ok(id);
        }
        // Saturated: mint an independent copy and bump the refcounts of
        // everything it now also references.
        match loc.rtype {
            RecordType::Inner => {
                let inn = self.resolve_inner(id)?;
                if !inn.value.is_null() {
                    self.retain(inn.value)?;
                }
                for child in inn.children() {
                    if !child.is_null() {
                        self.retain(*child)?;
                    }
                }
                self.alloc_inner(&inn)
            }
            RecordType::ValueBytes | RecordType::ValueRoots => {
                let vn = self.resolve_value(id)?;
                if let ValuePayload::Roots(ids) = &vn.payload {
                    for rid in ids {
                        if !rid.is_null() {
                            self.retain(*rid)?;
                        }
                    }
                }
                self.alloc_value(&vn)
            }
        }
    }

    fn release(&mut self, id: ObjectId) -> Result<(), crab_node::Error> {
        let tick = self.sessions.current_tick();
        self.alloc.release_id(id, tick).map_err(to_node_err)
    }
}

fn to_node_err(e: Error) -> crab_node::Error {
    match e {
        Error::OutOfSpace(n) => crab_node::Error::OutofSpace(n),
        Error::WriteTooLarge => crab_node::Error::WriteTooLarge,
        Error::KeyTooLong => crab_node::Error::KeyTooLong,
        Error::InvalidRoot => crab_node::Error::InvalidRoot,
        Error::DataCorruption(s) => crab_node::Error::Storage(crab_node::StorageError::Corruption(s)),
        _ => crab_node::Error::Storage(crab_node::StorageError::Io("allocator error")),
    }
}
