//! Segment layout: a fixed-size, append-only (while open) region of the
//! mapping that holds packed node records.
//!
//! Grounded in the teacher's page idiom (`src/pages/header.rs`'s
//! `TwoArrayTrailer`, a small `#[repr(C)]` trailer read directly out of
//! mapped bytes) but turned into a single growth direction: unlike a
//! B-tree page with two arrays growing towards each other, a segment has
//! one append-only record stream, so its header sits at the front instead
//! of the back.

use crab_node::NodeType;

use crate::error::Error;
use crate::format::{Tier, SEGMENT_SIZE};

pub const SEGMENT_HEADER_SIZE: usize = std::mem::size_of::<RawSegmentHeader>();

/// Per-record overhead: 5-byte object-id + 1-byte type tag + 4-byte length.
pub const RECORD_HEADER_SIZE: usize = 10;

#[derive(Clone, Copy, bytemuck::Zeroable, bytemuck::Pod)]
#[repr(C)]
pub struct RawSegmentHeader {
    id: u32,
    tier: u8,
    sealed: u8,
    _reserved: u16,
    write_cursor: u32,
    dead_bytes: u32,
    live_count: u32,
}

/// Record type tags as stored on disk; mirrors [`crab_node::NodeType`] plus
/// a tombstone value used only by [`Segment::scan`] bookkeeping.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RecordType {
    Inner,
    ValueBytes,
    ValueRoots,
}

impl RecordType {
    pub fn to_u8(self) -> u8 {
        match self {
            RecordType::Inner => 0,
            RecordType::ValueBytes => 1,
            RecordType::ValueRoots => 2,
        }
    }

    pub fn from_u8(v: u8) -> Option<RecordType> {
        match v {
            0 => Some(RecordType::Inner),
            1 => Some(RecordType::ValueBytes),
            2 => Some(RecordType::ValueRoots),
            _ => None,
        }
    }

    pub fn from_node_type(t: NodeType) -> RecordType {
        match t {
            NodeType::Inner => RecordType::Inner,
            NodeType::ValueBytes => RecordType::ValueBytes,
            NodeType::ValueRoots => RecordType::ValueRoots,
        }
    }

    pub fn to_node_type(self) -> NodeType {
        match self {
            RecordType::Inner => NodeType::Inner,
            RecordType::ValueBytes => NodeType::ValueBytes,
            RecordType::ValueRoots => NodeType::ValueRoots,
        }
    }
}

/// A view over one segment's full `SEGMENT_SIZE` bytes: a header followed
/// by an append-only record stream.
pub struct Segment<'a> {
    mem: &'a mut [u8],
}

impl<'a> Segment<'a> {
    /// # Safety
    /// `mem` must be exactly `SEGMENT_SIZE` bytes, carved out of the
    /// mapping at a segment boundary.
    pub unsafe fn new(mem: &'a mut [u8]) -> Self {
        debug_assert_eq!(mem.len(), SEGMENT_SIZE);
        Self { mem }
    }

    pub fn init(&mut self, id: u32, tier: Tier) {
        *self.header_mut() = RawSegmentHeader {
            id,
            tier: tier as u8,
            sealed: 0,
            _reserved: 0,
            write_cursor: 0,
            dead_bytes: 0,
            live_count: 0,
        };
    }

    fn header(&self) -> &RawSegmentHeader {
        bytemuck::from_bytes(&self.mem[..SEGMENT_HEADER_SIZE])
    }

    fn header_mut(&mut self) -> &mut RawSegmentHeader {
        bytemuck::from_bytes_mut(&mut self.mem[..SEGMENT_HEADER_SIZE])
    }

    pub fn id(&self) -> u32 {
        self.header().id
    }

    pub fn tier(&self) -> Tier {
        Tier::from_u8(self.header().tier).unwrap_or(Tier::Cold)
    }

    pub fn sealed(&self) -> bool {
        self.header().sealed != 0
    }

    pub fn seal(&mut self) {
        self.header_mut().sealed = 1;
    }

    pub fn write_cursor(&self) -> u32 {
        self.header().write_cursor
    }

    pub fn live_count(&self) -> u32 {
        self.header().live_count
    }

    pub fn dead_bytes(&self) -> u32 {
        self.header().dead_bytes
    }

    /// Total body capacity, in bytes.
    pub fn capacity(&self) -> u32 {
        (SEGMENT_SIZE - SEGMENT_HEADER_SIZE) as u32
    }

    /// Bytes still available for a fresh append.
    pub fn remaining(&self) -> u32 {
        self.capacity() - self.write_cursor()
    }

    /// Bytes in this segment occupied by live objects.
    pub fn live_bytes(&self) -> u32 {
        self.write_cursor().saturating_sub(self.dead_bytes())
    }

    /// Fraction of the segment's used space that is dead, in the `[0, 1]`
    /// range; used to pick a compaction target.
    pub fn dead_ratio(&self) -> f64 {
        if self.write_cursor() == 0 {
            return 0.0;
        }
        self.dead_bytes() as f64 / self.write_cursor() as f64
    }

    fn body(&self) -> &[u8] {
        &self.mem[SEGMENT_HEADER_SIZE..]
    }

    fn body_mut(&mut self) -> &mut [u8] {
        &mut self.mem[SEGMENT_HEADER_SIZE..]
    }

    /// Append a record, returning the byte offset (within the segment,
    /// including the header) at which its payload begins.
    pub fn append(
        &mut self,
        object_id: crab_node::ObjectId,
        rtype: RecordType,
        payload: &[u8],
    ) -> Result<u32, Error> {
        let needed = RECORD_HEADER_SIZE + payload.len();
        if needed as u32 > self.remaining() {
            return Err(Error::OutOfSpace(needed));
        }
        let cursor = self.write_cursor() as usize;
        let body = self.body_mut();
        let rec = &mut body[cursor..cursor + needed];
        rec[0..5].copy_from_slice(&object_id.to_le_bytes5());
        rec[5] = rtype.to_u8();
        rec[6..10].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        rec[10..].copy_from_slice(payload);
        let payload_offset = SEGMENT_HEADER_SIZE + cursor + RECORD_HEADER_SIZE;
        let header = self.header_mut();
        header.write_cursor += needed as u32;
        header.live_count += 1;
        Ok(payload_offset as u32)
    }

    /// Read a payload given its offset (as returned by [`append`](Self::append)
    /// or recorded in the object index) and its length.
    pub fn payload(&self, offset: u32, len: u32) -> Result<&[u8], Error> {
        self.mem
            .get(offset as usize..offset as usize + len as usize)
            .ok_or(Error::DataCorruption("object payload out of segment bounds"))
    }

    pub fn payload_mut(&mut self, offset: u32, len: u32) -> Result<&mut [u8], Error> {
        let end = offset as usize + len as usize;
        self.mem
            .get_mut(offset as usize..end)
            .ok_or(Error::DataCorruption("object payload out of segment bounds"))
    }

    /// Recover a payload's length from the record header immediately
    /// preceding it, given only the offset the object index stores.
    pub fn record_len(&self, payload_offset: u32) -> Result<u32, Error> {
        read_record_len(self.mem, payload_offset)
    }

    /// Rewrite the length field belonging to the record whose payload
    /// starts at `payload_offset`, after an in-place edit changed how many
    /// of its payload bytes are actually meaningful.
    pub fn set_record_len(&mut self, payload_offset: u32, new_len: u32) -> Result<(), Error> {
        let start = payload_offset as usize;
        let field = self
            .mem
            .get_mut(start - 4..start)
            .ok_or(Error::DataCorruption("record length field out of bounds"))?;
        field.copy_from_slice(&new_len.to_le_bytes());
        Ok(())
    }

    /// Note that `size` bytes at `payload_offset` (as returned by
    /// [`append`](Self::append)) became dead. Does not reclaim the space;
    /// only compaction does that.
    pub fn mark_dead(&mut self, size: u32) {
        let header = self.header_mut();
        header.dead_bytes += size as u32 + RECORD_HEADER_SIZE as u32;
        header.live_count = header.live_count.saturating_sub(1);
    }

    /// Walk every record currently in the write stream, live or dead. The
    /// object index is the source of truth for liveness; this is used by
    /// compaction to enumerate candidates and by crash recovery to rebuild
    /// an index from segments if one were ever lost (kept symmetrical with
    /// the object index rather than exercised on the normal open path).
    pub fn scan(&self) -> SegmentScan<'_> {
        SegmentScan {
            body: self.body(),
            offset: 0,
            cursor: self.write_cursor() as usize,
        }
    }
}

/// Read the 4-byte length field belonging to the record whose payload
/// starts at `payload_offset` (the layout the object index stores per
/// entry is the payload offset alone; the length lives in the record
/// header immediately before it).
pub fn read_record_len(segment_bytes: &[u8], payload_offset: u32) -> Result<u32, Error> {
    let start = payload_offset as usize;
    let len_bytes = segment_bytes
        .get(start - 4..start)
        .ok_or(Error::DataCorruption("record length field out of bounds"))?;
    Ok(u32::from_le_bytes(len_bytes.try_into().unwrap()))
}

pub struct SegmentScan<'a> {
    body: &'a [u8],
    offset: usize,
    cursor: usize,
}

pub struct ScannedRecord<'a> {
    pub object_id: crab_node::ObjectId,
    pub rtype: RecordType,
    pub payload: &'a [u8],
    /// Offset of the payload from the start of the segment (header included).
    pub payload_offset: u32,
}

impl<'a> Iterator for SegmentScan<'a> {
    type Item = Result<ScannedRecord<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.cursor {
            return None;
        }
        let Some(hdr) = self.body.get(self.offset..self.offset + RECORD_HEADER_SIZE) else {
            self.offset = self.cursor;
            return Some(Err(Error::DataCorruption("truncated record header")));
        };
        let mut id_bytes = [0u8; 5];
        id_bytes.copy_from_slice(&hdr[0..5]);
        let object_id = crab_node::ObjectId::from_le_bytes5(id_bytes);
        let Some(rtype) = RecordType::from_u8(hdr[5]) else {
            self.offset = self.cursor;
            return Some(Err(Error::DataCorruption("unknown record type tag")));
        };
        let len = u32::from_le_bytes([hdr[6], hdr[7], hdr[8], hdr[9]]) as usize;
        let payload_start = self.offset + RECORD_HEADER_SIZE;
        let Some(payload) = self.body.get(payload_start..payload_start + len) else {
            self.offset = self.cursor;
            return Some(Err(Error::DataCorruption("truncated record payload")));
        };
        let payload_offset = (SEGMENT_HEADER_SIZE + payload_start) as u32;
        self.offset = payload_start + len;
        Some(Ok(ScannedRecord {
            object_id,
            rtype,
            payload,
            payload_offset,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crab_node::ObjectId;

    #[test]
    fn append_then_scan_round_trips() {
        let mut buf = vec![0u8; SEGMENT_SIZE];
        let mut seg = unsafe { Segment::new(&mut buf) };
        seg.init(3, Tier::Hot);
        let off1 = seg.append(ObjectId::new(1), RecordType::ValueBytes, b"hello").unwrap();
        let off2 = seg.append(ObjectId::new(2), RecordType::Inner, b"world!").unwrap();
        assert_eq!(seg.payload(off1, 5).unwrap(), b"hello");
        assert_eq!(seg.payload(off2, 6).unwrap(), b"world!");

        let recs: Vec<_> = seg.scan().collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].object_id, ObjectId::new(1));
        assert_eq!(recs[0].payload, b"hello");
        assert_eq!(recs[1].object_id, ObjectId::new(2));
        assert_eq!(recs[1].rtype, RecordType::Inner);
    }

    #[test]
    fn out_of_space_is_reported() {
        let mut buf = vec![0u8; SEGMENT_SIZE];
        let mut seg = unsafe { Segment::new(&mut buf) };
        seg.init(0, Tier::Cold);
        let big = vec![0u8; SEGMENT_SIZE];
        assert!(matches!(
            seg.append(ObjectId::new(1), RecordType::ValueBytes, &big),
            Err(Error::OutOfSpace(_))
        ));
    }

    #[test]
    fn mark_dead_updates_ratio() {
        let mut buf = vec![0u8; SEGMENT_SIZE];
        let mut seg = unsafe { Segment::new(&mut buf) };
        seg.init(0, Tier::Hot);
        seg.append(ObjectId::new(1), RecordType::ValueBytes, b"0123456789").unwrap();
        assert_eq!(seg.dead_ratio(), 0.0);
        seg.mark_dead(10);
        assert!(seg.dead_ratio() > 0.9);
    }
}
