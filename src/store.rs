//! The public store API: open a database, start reader/writer sessions,
//! and operate on root handles.
//!
//! Grounded in the teacher's split between a shared `Arc<DbCore>` and the
//! per-handle `ReadTxn`/`WriteTxn`/`CommitUnit` wrappers around it
//! (`src/lib.rs`): one reference-counted core shared by every session, with
//! session-specific state (the epoch stamp, the writer's exclusivity) held
//! in thin per-handle structs.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions, MmapRaw};

use crab_db::Block;
use crab_node::{ObjectId, ValuePayload};

use crate::allocator::{Allocator, Engine};
use crate::error::Error;
use crate::format::{CacheMode, Header, Tier, TierSizes, HEADER_SIZE, MIN_SEGMENTS, SEGMENT_SIZE};
use crate::object_index::ObjectIndex;
use crate::root::RootManager;
use crate::session::{SessionId, SessionKind, SessionTable};
use crate::storage::StorageInner;

/// A handle to a tree snapshot: an owned, retained reference to a node
/// (possibly `ObjectId::NULL`, the empty tree). Must eventually be
/// released via [`ReadSession::release_subtree`]/[`WriteSession::release_subtree`]
/// or installed as the top root, or its refcount leaks until the store is
/// closed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RootHandle(pub(crate) ObjectId);

impl RootHandle {
    pub fn is_empty(&self) -> bool {
        self.0.is_null()
    }
}

/// What a point query found at a key.
#[derive(Debug, Clone)]
pub enum Found {
    Bytes(Block),
    Roots(Vec<RootHandle>),
}

fn payload_to_found(payload: ValuePayload) -> Found {
    match payload {
        ValuePayload::Bytes(b) => Found::Bytes(Block::from(b)),
        ValuePayload::Roots(ids) => Found::Roots(ids.into_iter().map(RootHandle).collect()),
    }
}

/// Per-tier segment counts requested at open time, plus the overall
/// virtual-address-space budget to reserve up front.
#[derive(Clone, Debug)]
pub struct OpenOptions {
    size: Option<usize>,
    tiers: TierSizes,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            size: None,
            tiers: TierSizes::default(),
        }
    }
}

impl OpenOptions {
    /// Reserve at least `size` bytes of address space up front (rounded up
    /// to a whole number of segments). Defaults to [`MIN_SEGMENTS`] segments.
    pub fn size(&mut self, size: usize) -> &mut Self {
        self.size = Some(size);
        self
    }

    /// Number of segments initially reserved per tier.
    pub fn tier_sizes(&mut self, tiers: TierSizes) -> &mut Self {
        self.tiers = tiers;
        self
    }

    pub fn open_anon(&self) -> Result<Store, Error> {
        warn_if_misaligned();
        let total = self.planned_size();
        let map = MmapRaw::from(
            MmapMut::map_anon(total).map_err(|e| Error::AllocFailed {
                requested: total,
                source: e,
            })?,
        );
        let storage = StorageInner::init(map, None);
        Store::from_fresh_storage(storage, total)
    }

    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Store, Error> {
        warn_if_misaligned();
        use fs4::fs_std::FileExt;

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(Error::Open)?;
        file.try_lock_exclusive().map_err(Error::Lock)?;

        let file_size = file.metadata().map_err(Error::Open)?.len() as usize;
        let is_new = file_size == 0;
        let total = self.planned_size().max(file_size);
        if total != file_size {
            file.set_len(total as u64).map_err(|e| Error::ResizeFailed {
                size: file_size,
                requested: total,
                source: e,
            })?;
        }

        let map = MmapOptions::new()
            .len(total)
            .map_raw(&file)
            .map_err(|e| Error::AllocFailed {
                requested: total,
                source: e,
            })?;
        let storage = StorageInner::init(map, Some(file));

        if is_new {
            Store::from_fresh_storage(storage, total)
        } else {
            Store::from_existing_storage(storage)
        }
    }

    fn planned_size(&self) -> usize {
        let tier_floor = self.tiers.hot + self.tiers.warm + self.tiers.cool + self.tiers.cold;
        let segments = self
            .size
            .map(|s| s.div_ceil(SEGMENT_SIZE))
            .unwrap_or(tier_floor)
            .max(MIN_SEGMENTS);
        HEADER_SIZE + object_index_bytes(segments) + segments * SEGMENT_SIZE
    }
}

/// 4096 object-ids worth of index capacity per segment of address space;
/// generous for the 64-ary trie's node-per-few-keys density.
fn object_index_bytes(segment_count: usize) -> usize {
    segment_count * 4096 * 8
}

/// Segments are `remap`/`mprotect`-friendly only if they're a whole number
/// of OS pages; every platform this has been run on uses 4 or 16 KiB
/// pages, both of which divide `SEGMENT_SIZE`'s 1 MiB evenly, so this is
/// expected to never fire. Kept as a loud diagnostic rather than a hard
/// error, matching the teacher's own page-size sanity check on open.
fn warn_if_misaligned() {
    let page = page_size::get();
    if page != 0 && SEGMENT_SIZE % page != 0 {
        log::warn!(
            "segment size {SEGMENT_SIZE} is not a multiple of the OS page size {page}; \
             mapping operations may fall back to less efficient paths"
        );
    }
}

/// The store's shared state. `allocator`, `sessions`, and `root` each do
/// their own fine-grained internal locking (atomic compare-exchange on the
/// object index, short-lived mutexes scoped to a single operation) and are
/// safe to reach concurrently without an outer lock -- that is what lets
/// readers run alongside each other and alongside the writer instead of
/// queuing behind one another. `header_mem` is the one genuinely exclusive
/// resource (a raw mutable slice into the mapping), written only by
/// `persist_header`, so it gets its own narrow mutex rather than dragging
/// every read through a lock it never touches.
struct StoreInner {
    allocator: Allocator,
    sessions: SessionTable,
    root: RootManager,
    header_mem: std::sync::Mutex<&'static mut [u8]>,
    object_index_offset: u64,
    object_index_capacity: u32,
}

#[derive(Clone)]
pub struct Store(Arc<StoreInner>);

impl Store {
    pub fn open_anon() -> Result<Store, Error> {
        OpenOptions::default().open_anon()
    }

    fn from_fresh_storage(mut storage: StorageInner, total: usize) -> Result<Store, Error> {
        let segments = (total - HEADER_SIZE) / SEGMENT_SIZE;
        // This is an approximation: reserve index capacity for the whole
        // region minus the header, consistent with `planned_size`.
        let object_index_capacity = ((segments * 4096 * 8) / 8) as u32;
        let object_index_offset = HEADER_SIZE as u64;
        let object_index_end = object_index_offset as usize + object_index_capacity as usize * 8;
        let segment_area = object_index_end.div_ceil(SEGMENT_SIZE) * SEGMENT_SIZE;
        let available_segments = (total - segment_area) / SEGMENT_SIZE;

        let maps = unsafe { storage.get_maps() };
        let all = maps[0];
        let header_mem: &'static mut [u8] =
            unsafe { std::slice::from_raw_parts_mut(all.as_ptr() as *mut u8, HEADER_SIZE) };
        let index_mem: &'static [std::sync::atomic::AtomicU64] = unsafe {
            std::slice::from_raw_parts(
                all.as_ptr().add(object_index_offset as usize) as *const std::sync::atomic::AtomicU64,
                object_index_capacity as usize,
            )
        };
        for cell in index_mem {
            cell.store(0x3 << 48, Ordering::Relaxed);
        }
        let mut segments: Vec<&'static mut [u8]> = Vec::new();
        for i in 0..available_segments {
            let start = segment_area + i * SEGMENT_SIZE;
            let slice = unsafe {
                std::slice::from_raw_parts_mut(all.as_ptr().add(start) as *mut u8, SEGMENT_SIZE)
            };
            segments.push(slice);
        }

        let index = unsafe { ObjectIndex::new(index_mem) };
        let allocator = unsafe { Allocator::new(storage, segments, index, 1, 0) };

        let header = Header::new(available_segments as u32, object_index_capacity, object_index_offset);
        header.store(header_mem)?;

        let inner = StoreInner {
            allocator,
            sessions: SessionTable::new(),
            root: RootManager::new(ObjectId::NULL),
            header_mem: std::sync::Mutex::new(header_mem),
            object_index_offset,
            object_index_capacity,
        };
        Ok(Store(Arc::new(inner)))
    }

    fn from_existing_storage(mut storage: StorageInner) -> Result<Store, Error> {
        let maps = unsafe { storage.get_maps() };
        let all = maps[0];
        let header = Header::load(all)?;
        let header_mem: &'static mut [u8] =
            unsafe { std::slice::from_raw_parts_mut(all.as_ptr() as *mut u8, HEADER_SIZE) };
        let index_mem: &'static [std::sync::atomic::AtomicU64] = unsafe {
            std::slice::from_raw_parts(
                all.as_ptr().add(header.object_index_offset as usize)
                    as *const std::sync::atomic::AtomicU64,
                header.object_index_capacity as usize,
            )
        };
        let segment_area =
            (header.object_index_offset as usize + header.object_index_capacity as usize * 8)
                .div_ceil(SEGMENT_SIZE)
                * SEGMENT_SIZE;
        let mut segments: Vec<&'static mut [u8]> = Vec::new();
        for i in 0..header.segment_count as usize {
            let start = segment_area + i * SEGMENT_SIZE;
            let slice = unsafe {
                std::slice::from_raw_parts_mut(all.as_ptr().add(start) as *mut u8, SEGMENT_SIZE)
            };
            segments.push(slice);
        }
        let index = unsafe { ObjectIndex::new(index_mem) };
        let next_id = index.capacity() as u64;
        let allocator = unsafe { Allocator::new(storage, segments, index, next_id, header.free_id_head) };

        // The header carries no clean-shutdown flag, so every reopen of a
        // file-backed store runs the same self-healing refcount rebuild a
        // crash recovery would need; on an already-consistent store this
        // only recomputes numbers that were already correct.
        crate::recover::recursive_retain(&allocator, header.top_root)?;

        let inner = StoreInner {
            allocator,
            sessions: SessionTable::new(),
            root: RootManager::new(header.top_root),
            header_mem: std::sync::Mutex::new(header_mem),
            object_index_offset: header.object_index_offset,
            object_index_capacity: header.object_index_capacity,
        };
        Ok(Store(Arc::new(inner)))
    }

    /// Persist the current top root and free-list head into the header.
    /// Called only from the writer's own calls (`set_top_root`), so this
    /// never contends with itself; the lock exists purely to give
    /// `header_mem` a safe mutable borrow.
    fn persist_header(&self) -> Result<(), Error> {
        let segment_count = self.0.allocator.segment_count() as u32;
        let free_head = self.0.allocator.free_id_head();
        let top_root = self.0.root.peek();
        let header = Header {
            segment_size: SEGMENT_SIZE as u32,
            segment_count,
            object_index_capacity: self.0.object_index_capacity,
            object_index_offset: self.0.object_index_offset,
            top_root,
            free_id_head: free_head,
        };
        let mut guard = self.0.header_mem.lock().unwrap();
        header.store(&mut **guard)
    }

    pub fn start_reader(&self) -> Result<ReadSession, Error> {
        let id = self.0.sessions.attach(SessionKind::Reader)?;
        Ok(ReadSession { store: self.clone(), id })
    }

    pub fn start_writer(&self) -> Result<WriteSession, Error> {
        let id = self.0.sessions.attach(SessionKind::Writer)?;
        Ok(WriteSession { store: self.clone(), id })
    }
}

fn engine_of(inner: &StoreInner) -> Engine<'_> {
    engine_with_mode(inner, CacheMode::Promote)
}

fn engine_with_mode(inner: &StoreInner, cache_mode: CacheMode) -> Engine<'_> {
    Engine {
        alloc: &inner.allocator,
        sessions: &inner.sessions,
        tier: Tier::Hot,
        cache_mode,
    }
}

/// Common operations available to both reader and writer sessions. Each
/// method reaches straight into the store's shared state: the allocator,
/// session table, and root manager all synchronize themselves internally
/// at a much finer grain than a single call, so readers run concurrently
/// with each other and with the writer instead of queuing behind one lock.
struct Common {
    store: Store,
    id: SessionId,
}

impl Common {
    fn get_top_root(&self) -> Result<RootHandle, Error> {
        let inner = &self.store.0;
        inner.sessions.enter(self.id);
        let id = inner.root.get(inner.allocator.index());
        inner.sessions.exit(self.id);
        Ok(RootHandle(id?))
    }

    fn get(&self, root: RootHandle, key: &[u8]) -> Result<Option<Found>, Error> {
        let inner = &self.store.0;
        let engine = engine_of(inner);
        inner.sessions.enter(self.id);
        let result = crab_node::lookup(&engine, root.0, key).map_err(Error::from);
        inner.sessions.exit(self.id);
        Ok(result?.map(payload_to_found))
    }

    fn get_bound(
        &self,
        root: RootHandle,
        key: &[u8],
        kind: BoundKind,
    ) -> Result<Option<(Vec<u8>, Found)>, Error> {
        let inner = &self.store.0;
        let engine = engine_of(inner);
        inner.sessions.enter(self.id);
        let result = match kind {
            BoundKind::GreaterEqual => crab_node::get_greater_equal(&engine, root.0, key),
            BoundKind::LessThan => crab_node::get_less_than(&engine, root.0, key),
            BoundKind::MaxInPrefix => crab_node::get_max_in_prefix(&engine, root.0, key),
        }
        .map_err(Error::from);
        inner.sessions.exit(self.id);
        Ok(result?.map(|(k, v)| (k, payload_to_found(v))))
    }

    fn release_subtree(&self, root: RootHandle) -> Result<(), Error> {
        if root.0.is_null() {
            return Ok(());
        }
        let inner = &self.store.0;
        let tick = inner.sessions.current_tick();
        inner.allocator.release_id(root.0, tick)
    }

    fn iter(&self, root: RootHandle, prefix: Option<&[u8]>) -> Result<Iter, Error> {
        let inner = &self.store.0;
        let engine = engine_with_mode(inner, CacheMode::Passthrough);
        let cursor = match prefix {
            Some(p) => crab_node::first_with_prefix(&engine, root.0, &crab_node::to_key6(p))?,
            None => crab_node::first(&engine, root.0)?,
        };
        Ok(Iter {
            store: self.store.clone(),
            id: self.id,
            cursor,
            // Kept in original-byte form: `cursor.current_key` decodes back
            // to original bytes, so the prefix check below must match it in
            // the same encoding rather than the key6-digit form used to
            // position the cursor above.
            prefix: prefix.map(|p| p.to_vec()),
        })
    }

    /// Pin-for-read: resolve `key` under `root` and, if it holds a raw
    /// `Bytes` value, return a zero-copy borrowed view of it that blocks
    /// compaction (and any in-place `edit`) from touching that value's
    /// storage until the guard is dropped. Roots values have nothing to
    /// borrow zero-copy -- their elements are owned, retained ids already
    /// -- so callers needing those should use `get` instead.
    fn pin_bytes(&self, root: RootHandle, key: &[u8]) -> Result<Option<PinnedBytes>, Error> {
        let inner = &self.store.0;
        let engine = engine_of(inner);
        inner.sessions.enter(self.id);
        let found = crab_node::lookup_value_id(&engine, root.0, key).map_err(Error::from);
        inner.sessions.exit(self.id);
        let Some(value_id) = found? else { return Ok(None) };

        let loc = inner.allocator.lookup(value_id)?;
        if loc.rtype != crate::segment::RecordType::ValueBytes {
            return Err(Error::Other("pin_bytes requested on a roots value"));
        }
        inner.allocator.pin(value_id);
        let result = (|| -> Result<PinnedBytes, Error> {
            let encoded = inner.allocator.payload_slice(value_id)?;
            let range = crab_node::ValueNode::bytes_payload_range(encoded).map_err(Error::from)?;
            let slice = &encoded[range];
            Ok(PinnedBytes {
                store: self.store.clone(),
                id: value_id,
                ptr: slice.as_ptr(),
                len: slice.len(),
            })
        })();
        if result.is_err() {
            inner.allocator.unpin(value_id);
        }
        Ok(Some(result?))
    }
}

/// An owned, zero-copy view of a value's encoded bytes, retained against
/// compaction and in-place edits until dropped. Grounded in the teacher's
/// `Block`/`&'static [u8]`-backed read path (`crab-db/src/block.rs`):
/// segment memory is already handed out as unbounded-lifetime slices, so a
/// pin is just a refcount that keeps compaction from relocating the slice
/// out from under this borrow.
pub struct PinnedBytes {
    store: Store,
    id: ObjectId,
    ptr: *const u8,
    len: usize,
}

// Safety: `ptr`/`len` describe an immutable slice of segment memory that
// outlives this guard (the underlying mapping is only ever unmapped when
// the `Store` itself -- which this guard keeps alive via its own clone --
// is dropped), and the pin held in `id` keeps it from being relocated or
// reclaimed for as long as this guard exists.
unsafe impl Send for PinnedBytes {}
unsafe impl Sync for PinnedBytes {}

impl std::ops::Deref for PinnedBytes {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for PinnedBytes {
    fn drop(&mut self) {
        self.store.0.allocator.unpin(self.id);
    }
}

enum BoundKind {
    GreaterEqual,
    LessThan,
    MaxInPrefix,
}

pub struct ReadSession {
    store: Store,
    id: SessionId,
}

impl ReadSession {
    fn common(&self) -> Common {
        Common { store: self.store.clone(), id: self.id }
    }

    pub fn get_top_root(&self) -> Result<RootHandle, Error> {
        self.common().get_top_root()
    }

    pub fn get(&self, root: RootHandle, key: &[u8]) -> Result<Option<Found>, Error> {
        self.common().get(root, key)
    }

    pub fn get_greater_equal(
        &self,
        root: RootHandle,
        key: &[u8],
    ) -> Result<Option<(Vec<u8>, Found)>, Error> {
        self.common().get_bound(root, key, BoundKind::GreaterEqual)
    }

    pub fn get_less_than(
        &self,
        root: RootHandle,
        key: &[u8],
    ) -> Result<Option<(Vec<u8>, Found)>, Error> {
        self.common().get_bound(root, key, BoundKind::LessThan)
    }

    pub fn get_max_in_prefix(
        &self,
        root: RootHandle,
        prefix: &[u8],
    ) -> Result<Option<(Vec<u8>, Found)>, Error> {
        self.common().get_bound(root, prefix, BoundKind::MaxInPrefix)
    }

    pub fn iter(&self, root: RootHandle) -> Result<Iter, Error> {
        self.common().iter(root, None)
    }

    pub fn iter_prefix(&self, root: RootHandle, prefix: &[u8]) -> Result<Iter, Error> {
        self.common().iter(root, Some(prefix))
    }

    pub fn release_subtree(&self, root: RootHandle) -> Result<(), Error> {
        self.common().release_subtree(root)
    }

    /// Pin-for-read a `key`'s raw-bytes value under `root`; see
    /// [`PinnedBytes`].
    pub fn pin_bytes(&self, root: RootHandle, key: &[u8]) -> Result<Option<PinnedBytes>, Error> {
        self.common().pin_bytes(root, key)
    }
}

impl Drop for ReadSession {
    fn drop(&mut self) {
        self.store.0.sessions.detach(self.id);
    }
}

pub struct WriteSession {
    store: Store,
    id: SessionId,
}

impl WriteSession {
    fn common(&self) -> Common {
        Common { store: self.store.clone(), id: self.id }
    }

    pub fn get_top_root(&self) -> Result<RootHandle, Error> {
        self.common().get_top_root()
    }

    pub fn set_top_root(&self, root: RootHandle) -> Result<(), Error> {
        let inner = &self.store.0;
        inner.root.set(inner.allocator.index(), root.0)?;
        self.store.persist_header()
    }

    pub fn get(&self, root: RootHandle, key: &[u8]) -> Result<Option<Found>, Error> {
        self.common().get(root, key)
    }

    pub fn get_greater_equal(
        &self,
        root: RootHandle,
        key: &[u8],
    ) -> Result<Option<(Vec<u8>, Found)>, Error> {
        self.common().get_bound(root, key, BoundKind::GreaterEqual)
    }

    pub fn get_less_than(
        &self,
        root: RootHandle,
        key: &[u8],
    ) -> Result<Option<(Vec<u8>, Found)>, Error> {
        self.common().get_bound(root, key, BoundKind::LessThan)
    }

    pub fn get_max_in_prefix(
        &self,
        root: RootHandle,
        prefix: &[u8],
    ) -> Result<Option<(Vec<u8>, Found)>, Error> {
        self.common().get_bound(root, prefix, BoundKind::MaxInPrefix)
    }

    pub fn iter(&self, root: RootHandle) -> Result<Iter, Error> {
        self.common().iter(root, None)
    }

    pub fn iter_prefix(&self, root: RootHandle, prefix: &[u8]) -> Result<Iter, Error> {
        self.common().iter(root, Some(prefix))
    }

    pub fn release_subtree(&self, root: RootHandle) -> Result<(), Error> {
        self.common().release_subtree(root)
    }

    /// Pin-for-read a `key`'s raw-bytes value under `root`; see
    /// [`PinnedBytes`].
    pub fn pin_bytes(&self, root: RootHandle, key: &[u8]) -> Result<Option<PinnedBytes>, Error> {
        self.common().pin_bytes(root, key)
    }

    /// Insert or overwrite `key` with raw bytes, returning the new root and
    /// the previous value's encoded size, if any.
    pub fn upsert_bytes(
        &self,
        root: RootHandle,
        key: &[u8],
        value: &[u8],
    ) -> Result<(RootHandle, Option<usize>), Error> {
        let inner = &self.store.0;
        let mut engine = engine_of(inner);
        let (new_root, old_size) = crab_node::insert(
            &mut engine,
            root.0,
            true,
            key,
            ValuePayload::Bytes(value.to_vec()),
        )?;
        Ok((RootHandle(new_root), old_size))
    }

    /// Insert or overwrite `key` with a list of nested-snapshot root
    /// handles; each is retained once as part of the cascade.
    pub fn upsert_roots(
        &self,
        root: RootHandle,
        key: &[u8],
        values: &[RootHandle],
    ) -> Result<(RootHandle, Option<usize>), Error> {
        let inner = &self.store.0;
        let mut engine = engine_of(inner);
        for v in values {
            if !v.0.is_null() {
                inner.allocator.retain_id(v.0)?;
            }
        }
        let ids = values.iter().map(|v| v.0).collect();
        let (new_root, old_size) =
            crab_node::insert(&mut engine, root.0, true, key, ValuePayload::Roots(ids))?;
        Ok((RootHandle(new_root), old_size))
    }

    pub fn remove(
        &self,
        root: RootHandle,
        key: &[u8],
    ) -> Result<(RootHandle, Option<usize>), Error> {
        let inner = &self.store.0;
        let mut engine = engine_of(inner);
        let (new_root, old_size) = crab_node::remove(&mut engine, root.0, true, key)?;
        Ok((RootHandle(new_root), old_size))
    }

    /// Run the deferred-free queue forward past every currently-live
    /// session's epoch, physically reclaiming dead objects.
    pub fn reclaim(&self) -> Result<usize, Error> {
        let inner = &self.store.0;
        let min_live = inner.sessions.min_live_age();
        inner.allocator.reclaim(min_live)
    }

    /// Compact a single sealed segment (the one with the greatest dead
    /// ratio); returns the compacted segment's id, if any qualified.
    pub fn compact(&self) -> Result<Option<u32>, Error> {
        self.store.0.allocator.compact_one()
    }
}

impl Drop for WriteSession {
    fn drop(&mut self) {
        self.store.0.sessions.detach(self.id);
    }
}

/// Forward/backward iteration over a snapshot, optionally restricted to a
/// key prefix.
pub struct Iter {
    store: Store,
    id: SessionId,
    cursor: crab_node::Cursor,
    prefix: Option<Vec<u8>>,
}

impl Iter {
    pub fn current(&self) -> Result<Option<(Vec<u8>, Found)>, Error> {
        let engine = engine_with_mode(&self.store.0, CacheMode::Passthrough);
        let key = self.cursor.current_key(&engine)?;
        let Some(key) = key else { return Ok(None) };
        if let Some(prefix) = &self.prefix {
            if !key.starts_with(prefix.as_slice()) {
                return Ok(None);
            }
        }
        let value = self.cursor.current_value(&engine)?;
        Ok(value.map(|v| (crab_node::from_key6(&key), payload_to_found(v))))
    }

    pub fn next(&mut self) -> Result<(), Error> {
        let engine = engine_with_mode(&self.store.0, CacheMode::Passthrough);
        self.cursor.next(&engine)?;
        Ok(())
    }

    pub fn prev(&mut self) -> Result<(), Error> {
        let engine = engine_with_mode(&self.store.0, CacheMode::Passthrough);
        self.cursor.prev(&engine)?;
        Ok(())
    }
}

impl Drop for Iter {
    fn drop(&mut self) {
        let _ = self.id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(iter: &mut Iter) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        while let Some((k, found)) = iter.current().unwrap() {
            let Found::Bytes(b) = found else { panic!("expected bytes") };
            out.push((k, b.to_vec()));
            iter.next().unwrap();
        }
        out
    }

    #[test]
    fn pin_bytes_borrows_the_stored_value_without_copying() {
        let store = Store::open_anon().unwrap();
        let wr = store.start_writer().unwrap();
        let root = wr.get_top_root().unwrap();
        let (root, _) = wr.upsert_bytes(root, b"k", b"pinned-value").unwrap();
        wr.set_top_root(root).unwrap();

        let rd = store.start_reader().unwrap();
        let top = rd.get_top_root().unwrap();
        let pinned = rd.pin_bytes(top, b"k").unwrap().unwrap();
        assert_eq!(&*pinned, b"pinned-value");
        assert!(rd.pin_bytes(top, b"missing").unwrap().is_none());
        drop(pinned);
    }

    #[test]
    fn pin_bytes_on_a_roots_value_is_an_error() {
        let store = Store::open_anon().unwrap();
        let wr = store.start_writer().unwrap();
        let inner_root = wr.get_top_root().unwrap();
        let (inner_root, _) = wr.upsert_bytes(inner_root, b"x", b"y").unwrap();

        let outer_root = wr.get_top_root().unwrap();
        let (outer_root, _) = wr
            .upsert_roots(outer_root, b"nested", &[inner_root])
            .unwrap();
        wr.set_top_root(outer_root).unwrap();

        let rd = store.start_reader().unwrap();
        let top = rd.get_top_root().unwrap();
        assert!(rd.pin_bytes(top, b"nested").unwrap_err().to_string().contains("roots"));
    }

    #[test]
    fn round_trip_insert_and_get() {
        let store = Store::open_anon().unwrap();
        let wr = store.start_writer().unwrap();
        let root = wr.get_top_root().unwrap();
        let (root, old) = wr.upsert_bytes(root, b"apple", b"1").unwrap();
        assert!(old.is_none());
        let (root, old) = wr.upsert_bytes(root, b"apricot", b"2").unwrap();
        assert!(old.is_none());
        wr.set_top_root(root).unwrap();

        let rd = store.start_reader().unwrap();
        let top = rd.get_top_root().unwrap();
        let Found::Bytes(v) = rd.get(top, b"apple").unwrap().unwrap() else {
            panic!("expected bytes")
        };
        assert_eq!(&*v, b"1");
        let Found::Bytes(v) = rd.get(top, b"apricot").unwrap().unwrap() else {
            panic!("expected bytes")
        };
        assert_eq!(&*v, b"2");
        assert!(rd.get(top, b"banana").unwrap().is_none());
    }

    #[test]
    fn overwrite_is_idempotent_and_reports_the_old_size() {
        let store = Store::open_anon().unwrap();
        let wr = store.start_writer().unwrap();
        let root = wr.get_top_root().unwrap();
        let (root, old) = wr.upsert_bytes(root, b"k", b"first").unwrap();
        assert_eq!(old, None);
        let (root, old) = wr.upsert_bytes(root, b"k", b"second").unwrap();
        assert_eq!(old, Some(b"first".len()));
        wr.set_top_root(root).unwrap();

        let rd = store.start_reader().unwrap();
        let top = rd.get_top_root().unwrap();
        let Found::Bytes(v) = rd.get(top, b"k").unwrap().unwrap() else {
            panic!("expected bytes")
        };
        assert_eq!(&*v, b"second");
    }

    #[test]
    fn remove_is_idempotent() {
        let store = Store::open_anon().unwrap();
        let wr = store.start_writer().unwrap();
        let root = wr.get_top_root().unwrap();
        let (root, _) = wr.upsert_bytes(root, b"k", b"v").unwrap();
        let (root, old) = wr.remove(root, b"k").unwrap();
        assert_eq!(old, Some(1));
        let (root, old) = wr.remove(root, b"k").unwrap();
        assert_eq!(old, None);
        wr.set_top_root(root).unwrap();

        let rd = store.start_reader().unwrap();
        let top = rd.get_top_root().unwrap();
        assert!(rd.get(top, b"k").unwrap().is_none());
    }

    #[test]
    fn iteration_yields_keys_in_order() {
        let store = Store::open_anon().unwrap();
        let wr = store.start_writer().unwrap();
        let mut root = wr.get_top_root().unwrap();
        for key in [b"banana".as_slice(), b"apple", b"cherry", b"apricot"] {
            let (r, _) = wr.upsert_bytes(root, key, key).unwrap();
            root = r;
        }
        wr.set_top_root(root).unwrap();

        let rd = store.start_reader().unwrap();
        let top = rd.get_top_root().unwrap();
        let mut iter = rd.iter(top).unwrap();
        let got: Vec<Vec<u8>> = collect(&mut iter).into_iter().map(|(k, _)| k).collect();
        assert_eq!(
            got,
            vec![
                b"apple".to_vec(),
                b"apricot".to_vec(),
                b"banana".to_vec(),
                b"cherry".to_vec(),
            ]
        );
    }

    #[test]
    fn prefix_iteration_filters_to_the_prefix() {
        let store = Store::open_anon().unwrap();
        let wr = store.start_writer().unwrap();
        let mut root = wr.get_top_root().unwrap();
        for key in [b"apple".as_slice(), b"apricot", b"banana"] {
            let (r, _) = wr.upsert_bytes(root, key, key).unwrap();
            root = r;
        }
        wr.set_top_root(root).unwrap();

        let rd = store.start_reader().unwrap();
        let top = rd.get_top_root().unwrap();
        let mut iter = rd.iter_prefix(top, b"ap").unwrap();
        let got: Vec<Vec<u8>> = collect(&mut iter).into_iter().map(|(k, _)| k).collect();
        assert_eq!(got, vec![b"apple".to_vec(), b"apricot".to_vec()]);
    }

    #[test]
    fn empty_string_key_is_a_valid_key() {
        let store = Store::open_anon().unwrap();
        let wr = store.start_writer().unwrap();
        let root = wr.get_top_root().unwrap();
        let (root, _) = wr.upsert_bytes(root, b"", b"root-value").unwrap();
        wr.set_top_root(root).unwrap();

        let rd = store.start_reader().unwrap();
        let top = rd.get_top_root().unwrap();
        let Found::Bytes(v) = rd.get(top, b"").unwrap().unwrap() else {
            panic!("expected bytes")
        };
        assert_eq!(&*v, b"root-value");
    }

    #[test]
    fn old_snapshots_stay_stable_after_further_writes() {
        let store = Store::open_anon().unwrap();
        let wr = store.start_writer().unwrap();
        let root0 = wr.get_top_root().unwrap();
        let (root1, _) = wr.upsert_bytes(root0, b"a", b"1").unwrap();
        let (root2, _) = wr.upsert_bytes(root1, b"b", b"2").unwrap();

        // root1 is a distinct snapshot from root2 and must still only see "a".
        let rd = store.start_reader().unwrap();
        assert!(rd.get(root1, b"b").unwrap().is_none());
        let Found::Bytes(v) = rd.get(root1, b"a").unwrap().unwrap() else {
            panic!("expected bytes")
        };
        assert_eq!(&*v, b"1");
        let Found::Bytes(v) = rd.get(root2, b"b").unwrap().unwrap() else {
            panic!("expected bytes")
        };
        assert_eq!(&*v, b"2");

        wr.release_subtree(root1).unwrap();
        wr.set_top_root(root2).unwrap();
    }

    #[test]
    fn thousand_key_insert_then_remove_evens_across_two_snapshots() {
        let store = Store::open_anon().unwrap();
        let wr = store.start_writer().unwrap();
        let mut root = wr.get_top_root().unwrap();
        for i in 0..1000u32 {
            let key = i.to_be_bytes();
            let (r, _) = wr.upsert_bytes(root, &key, &key).unwrap();
            root = r;
        }
        let r1 = root;

        let mut root2 = r1;
        for i in (0..1000u32).step_by(2) {
            let key = i.to_be_bytes();
            let (r, _) = wr.remove(root2, &key).unwrap();
            root2 = r;
        }

        let rd = store.start_reader().unwrap();
        // R1 still has every key.
        for i in 0..1000u32 {
            let key = i.to_be_bytes();
            assert!(rd.get(r1, &key).unwrap().is_some(), "missing {i} in r1");
        }
        // R2 has only the odd keys.
        for i in 0..1000u32 {
            let key = i.to_be_bytes();
            let present = rd.get(root2, &key).unwrap().is_some();
            assert_eq!(present, i % 2 == 1, "key {i} in r2");
        }

        drop(rd);
        wr.release_subtree(r1).unwrap();
        wr.set_top_root(root2).unwrap();
    }

    #[test]
    fn nested_roots_value_forms_a_tree_of_trees() {
        let store = Store::open_anon().unwrap();
        let wr = store.start_writer().unwrap();

        let inner_root = wr.get_top_root().unwrap();
        let (inner_root, _) = wr.upsert_bytes(inner_root, b"leaf", b"v").unwrap();

        let outer_root = wr.get_top_root().unwrap();
        let (outer_root, _) = wr
            .upsert_roots(outer_root, b"branch", &[inner_root])
            .unwrap();
        wr.set_top_root(outer_root).unwrap();

        let rd = store.start_reader().unwrap();
        let top = rd.get_top_root().unwrap();
        let Found::Roots(nested) = rd.get(top, b"branch").unwrap().unwrap() else {
            panic!("expected nested roots")
        };
        assert_eq!(nested.len(), 1);
        let Found::Bytes(v) = rd.get(nested[0], b"leaf").unwrap().unwrap() else {
            panic!("expected bytes")
        };
        assert_eq!(&*v, b"v");
    }

    #[test]
    fn compaction_does_not_change_observable_contents() {
        let store = Store::open_anon().unwrap();
        let wr = store.start_writer().unwrap();
        let mut root = wr.get_top_root().unwrap();
        // Churn enough distinct keys/values through one segment that some of
        // it ends up dead and eligible for compaction.
        for i in 0..500u32 {
            let key = i.to_be_bytes();
            let (r, _) = wr.upsert_bytes(root, &key, &[0u8; 64]).unwrap();
            root = r;
        }
        for i in 0..250u32 {
            let key = i.to_be_bytes();
            let (r, _) = wr.upsert_bytes(root, &key, &[1u8; 64]).unwrap();
            root = r;
        }
        wr.set_top_root(root).unwrap();
        while wr.compact().unwrap().is_some() {}
        wr.reclaim().unwrap();

        let rd = store.start_reader().unwrap();
        let top = rd.get_top_root().unwrap();
        for i in 0..500u32 {
            let key = i.to_be_bytes();
            let Found::Bytes(v) = rd.get(top, &key).unwrap().unwrap() else {
                panic!("expected bytes")
            };
            let expect = if i < 250 { 1u8 } else { 0u8 };
            assert!(v.iter().all(|&b| b == expect), "key {i} corrupted by compaction");
        }
    }

    #[test]
    fn crash_recovery_discards_unreachable_nodes_and_fixes_refcounts() {
        let store = Store::open_anon().unwrap();
        let wr = store.start_writer().unwrap();
        let root = wr.get_top_root().unwrap();
        let (root, _) = wr.upsert_bytes(root, b"a", b"1").unwrap();
        // Simulate a crash between minting this snapshot and publishing it:
        // `root2` is never installed as the top root, so its nodes (beyond
        // whatever `root` already retained) are reachable from nowhere.
        let (_root2, _) = wr.upsert_bytes(root, b"b", b"2").unwrap();
        wr.set_top_root(root).unwrap();
        drop(wr);

        let top_root = store.0.root.peek();
        let discarded = crate::recover::recursive_retain(&store.0.allocator, top_root).unwrap();
        assert!(discarded > 0);

        let rd = store.start_reader().unwrap();
        let top = rd.get_top_root().unwrap();
        let Found::Bytes(v) = rd.get(top, b"a").unwrap().unwrap() else {
            panic!("expected bytes")
        };
        assert_eq!(&*v, b"1");
        assert!(rd.get(top, b"b").unwrap().is_none());
    }

    proptest::proptest! {
        #[test]
        fn arbitrary_insert_sequences_are_readable_back(
            entries in proptest::collection::vec(
                (proptest::collection::vec(proptest::num::u8::ANY, 0..8),
                 proptest::collection::vec(proptest::num::u8::ANY, 0..8)),
                0..40,
            )
        ) {
            let store = Store::open_anon().unwrap();
            let wr = store.start_writer().unwrap();
            let mut root = wr.get_top_root().unwrap();
            let mut model = std::collections::BTreeMap::new();
            for (k, v) in &entries {
                let (r, _) = wr.upsert_bytes(root, k, v).unwrap();
                root = r;
                model.insert(k.clone(), v.clone());
            }
            wr.set_top_root(root).unwrap();

            let rd = store.start_reader().unwrap();
            let top = rd.get_top_root().unwrap();
            for (k, v) in &model {
                let Found::Bytes(found) = rd.get(top, k).unwrap().unwrap() else {
                    panic!("expected bytes")
                };
                proptest::prop_assert_eq!(&*found, v.as_slice());
            }

            let mut iter = rd.iter(top).unwrap();
            let mut prev: Option<Vec<u8>> = None;
            let mut seen = 0;
            while let Some((k, _)) = iter.current().unwrap() {
                if let Some(p) = &prev {
                    proptest::prop_assert!(p < &k, "iteration order violated at {:?}", k);
                }
                prev = Some(k);
                seen += 1;
                iter.next().unwrap();
            }
            proptest::prop_assert_eq!(seen, model.len());
        }
    }
}
