//! Packed, variable-length, self-describing node representations.
//!
//! Every node is encoded as a standalone byte blob handed to the segment
//! allocator; there is no shared page structure between objects. The
//! layout (spec'd in the file-format section) is:
//!
//! ```text
//! type tag (1 byte) | prefix digit count (u16 LE) | packed prefix digits
//! then, for an inner node:
//!     branch bitmap (u64 LE) [ | value object-id (5 bytes) if tag has-value bit set ]
//!     popcount(bitmap) child object-ids (5 bytes each, in bit order)
//! or, for a value-bytes leaf:
//!     payload length (u32 LE) | raw bytes
//! or, for a value-roots leaf:
//!     root count (u32 LE) | that many object-ids (5 bytes each)
//! ```

use crate::key6::{pack_digits, unpack_digits};
use crate::object_id::ObjectId;
use crate::Error;
use alloc::vec::Vec;
use byteorder::{ByteOrder, LittleEndian};

const TAG_KIND_MASK: u8 = 0x03;
const TAG_KIND_INNER: u8 = 0;
const TAG_KIND_VALUE_BYTES: u8 = 1;
const TAG_KIND_VALUE_ROOTS: u8 = 2;
const TAG_HAS_VALUE: u8 = 0x04;

/// The kind of a decoded node, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Inner,
    ValueBytes,
    ValueRoots,
}

impl NodeType {
    /// Peek at a node's type tag without decoding the whole thing.
    pub fn peek(bytes: &[u8]) -> Result<Self, Error> {
        let tag = *bytes.first().ok_or(Error::DataCorruption)?;
        match tag & TAG_KIND_MASK {
            TAG_KIND_INNER => Ok(NodeType::Inner),
            TAG_KIND_VALUE_BYTES => Ok(NodeType::ValueBytes),
            TAG_KIND_VALUE_ROOTS => Ok(NodeType::ValueRoots),
            _ => Err(Error::DataCorruption),
        }
    }
}

fn encode_prefix(out: &mut Vec<u8>, prefix: &[u8]) {
    let len: u16 = prefix.len().try_into().unwrap_or(u16::MAX);
    let mut len_buf = [0u8; 2];
    LittleEndian::write_u16(&mut len_buf, len);
    out.extend_from_slice(&len_buf);
    out.extend_from_slice(&pack_digits(prefix));
}

fn decode_prefix(bytes: &[u8]) -> Result<(Vec<u8>, usize), Error> {
    if bytes.len() < 2 {
        return Err(Error::DataCorruption);
    }
    let digit_count = LittleEndian::read_u16(&bytes[..2]) as usize;
    let packed_len = (digit_count * 6).div_ceil(8);
    let body = bytes.get(2..2 + packed_len).ok_or(Error::DataCorruption)?;
    let prefix = unpack_digits(body, digit_count);
    Ok((prefix, 2 + packed_len))
}

/// A branching trie node: a shared prefix, a 64-way branch bitmap, an
/// optional value attached to the prefix itself, and one child object-id
/// per set bit of the bitmap, in ascending bit order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerNode {
    pub prefix: Vec<u8>,
    pub value: ObjectId,
    branches: u64,
    children: Vec<ObjectId>,
}

impl InnerNode {
    /// Construct a new inner node with no children and no value.
    pub fn new(prefix: Vec<u8>) -> Self {
        Self {
            prefix,
            value: ObjectId::NULL,
            branches: 0,
            children: Vec::new(),
        }
    }

    pub fn branches_bitmap(&self) -> u64 {
        self.branches
    }

    pub fn children(&self) -> &[ObjectId] {
        &self.children
    }

    pub fn has_branch(&self, digit: u8) -> bool {
        debug_assert!(digit < 64);
        self.branches & (1u64 << digit) != 0
    }

    fn index_of(&self, digit: u8) -> usize {
        (self.branches & ((1u64 << digit) - 1)).count_ones() as usize
    }

    pub fn branch(&self, digit: u8) -> Option<ObjectId> {
        if self.has_branch(digit) {
            Some(self.children[self.index_of(digit)])
        } else {
            None
        }
    }

    /// Set (or replace) the child at `digit`.
    pub fn set_branch(&mut self, digit: u8, id: ObjectId) {
        let idx = self.index_of(digit);
        if self.has_branch(digit) {
            self.children[idx] = id;
        } else {
            self.children.insert(idx, id);
            self.branches |= 1u64 << digit;
        }
    }

    /// Remove the child at `digit`, if present.
    pub fn remove_branch(&mut self, digit: u8) -> Option<ObjectId> {
        if !self.has_branch(digit) {
            return None;
        }
        let idx = self.index_of(digit);
        self.branches &= !(1u64 << digit);
        Some(self.children.remove(idx))
    }

    pub fn branch_count(&self) -> usize {
        self.children.len()
    }

    /// The sole remaining (digit, child) pair, if exactly one branch exists.
    pub fn only_branch(&self) -> Option<(u8, ObjectId)> {
        if self.children.len() == 1 {
            let digit = self.branches.trailing_zeros() as u8;
            Some((digit, self.children[0]))
        } else {
            None
        }
    }

    /// Smallest set bit `>= from`, if any (ascending scan helper).
    pub fn lower_bound(&self, from: u8) -> Option<u8> {
        if from >= 64 {
            return None;
        }
        let masked = self.branches & (u64::MAX << from);
        if masked == 0 {
            None
        } else {
            Some(masked.trailing_zeros() as u8)
        }
    }

    /// Largest set bit `<= from`, if any (descending scan helper).
    pub fn reverse_lower_bound(&self, from: u8) -> Option<u8> {
        let masked = if from >= 63 {
            self.branches
        } else {
            self.branches & ((1u64 << (from + 1)) - 1)
        };
        if masked == 0 {
            None
        } else {
            Some(63 - masked.leading_zeros() as u8)
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.children.len() * 5);
        let has_value = !self.value.is_null();
        let mut tag = TAG_KIND_INNER;
        if has_value {
            tag |= TAG_HAS_VALUE;
        }
        out.push(tag);
        encode_prefix(&mut out, &self.prefix);
        let mut bitmap_buf = [0u8; 8];
        LittleEndian::write_u64(&mut bitmap_buf, self.branches);
        out.extend_from_slice(&bitmap_buf);
        if has_value {
            out.extend_from_slice(&self.value.to_le_bytes5());
        }
        for child in &self.children {
            out.extend_from_slice(&child.to_le_bytes5());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let tag = *bytes.first().ok_or(Error::DataCorruption)?;
        if tag & TAG_KIND_MASK != TAG_KIND_INNER {
            return Err(Error::DataCorruption);
        }
        let (prefix, mut off) = decode_prefix(&bytes[1..]).map(|(p, n)| (p, n + 1))?;
        let bitmap = LittleEndian::read_u64(bytes.get(off..off + 8).ok_or(Error::DataCorruption)?);
        off += 8;
        let value = if tag & TAG_HAS_VALUE != 0 {
            let v = read_id(bytes, off)?;
            off += 5;
            v
        } else {
            ObjectId::NULL
        };
        let count = bitmap.count_ones() as usize;
        let mut children = Vec::with_capacity(count);
        for _ in 0..count {
            children.push(read_id(bytes, off)?);
            off += 5;
        }
        Ok(Self {
            prefix,
            value,
            branches: bitmap,
            children,
        })
    }
}

fn read_id(bytes: &[u8], off: usize) -> Result<ObjectId, Error> {
    let slice = bytes.get(off..off + 5).ok_or(Error::DataCorruption)?;
    Ok(ObjectId::from_le_bytes5([
        slice[0], slice[1], slice[2], slice[3], slice[4],
    ]))
}

/// The payload carried by a value (leaf) node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValuePayload {
    Bytes(Vec<u8>),
    Roots(Vec<ObjectId>),
}

/// A trie leaf: the remaining key digits at this position, plus either raw
/// bytes or a list of nested-snapshot object-ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueNode {
    pub key: Vec<u8>,
    pub payload: ValuePayload,
}

impl ValueNode {
    pub fn new(key: Vec<u8>, payload: ValuePayload) -> Self {
        Self { key, payload }
    }

    pub fn data_len(&self) -> usize {
        match &self.payload {
            ValuePayload::Bytes(b) => b.len(),
            ValuePayload::Roots(r) => r.len(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match &self.payload {
            ValuePayload::Bytes(data) => {
                out.push(TAG_KIND_VALUE_BYTES);
                encode_prefix(&mut out, &self.key);
                let mut len_buf = [0u8; 4];
                LittleEndian::write_u32(&mut len_buf, data.len() as u32);
                out.extend_from_slice(&len_buf);
                out.extend_from_slice(data);
            }
            ValuePayload::Roots(ids) => {
                out.push(TAG_KIND_VALUE_ROOTS);
                encode_prefix(&mut out, &self.key);
                let mut len_buf = [0u8; 4];
                LittleEndian::write_u32(&mut len_buf, ids.len() as u32);
                out.extend_from_slice(&len_buf);
                for id in ids {
                    out.extend_from_slice(&id.to_le_bytes5());
                }
            }
        }
        out
    }

    /// The byte range within `encoded` holding a `ValueBytes` leaf's raw
    /// payload, for a caller that wants to borrow it directly rather than
    /// go through `decode` (which copies it into an owned `Vec`). Errors on
    /// anything that isn't a `ValueBytes` encoding.
    pub fn bytes_payload_range(encoded: &[u8]) -> Result<core::ops::Range<usize>, Error> {
        let tag = *encoded.first().ok_or(Error::DataCorruption)?;
        if tag & TAG_KIND_MASK != TAG_KIND_VALUE_BYTES {
            return Err(Error::DataCorruption);
        }
        let (_key, mut off) = decode_prefix(&encoded[1..]).map(|(p, n)| (p, n + 1))?;
        let count = LittleEndian::read_u32(encoded.get(off..off + 4).ok_or(Error::DataCorruption)?) as usize;
        off += 4;
        let end = off.checked_add(count).ok_or(Error::DataCorruption)?;
        if end > encoded.len() {
            return Err(Error::DataCorruption);
        }
        Ok(off..end)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let tag = *bytes.first().ok_or(Error::DataCorruption)?;
        let kind = tag & TAG_KIND_MASK;
        if kind != TAG_KIND_VALUE_BYTES && kind != TAG_KIND_VALUE_ROOTS {
            return Err(Error::DataCorruption);
        }
        let (key, mut off) = decode_prefix(&bytes[1..]).map(|(p, n)| (p, n + 1))?;
        let count = LittleEndian::read_u32(bytes.get(off..off + 4).ok_or(Error::DataCorruption)?) as usize;
        off += 4;
        let payload = if kind == TAG_KIND_VALUE_BYTES {
            let data = bytes.get(off..off + count).ok_or(Error::DataCorruption)?;
            ValuePayload::Bytes(data.to_vec())
        } else {
            let mut ids = Vec::with_capacity(count);
            for _ in 0..count {
                let id = read_id(bytes, off)?;
                if id.is_null() {
                    return Err(Error::InvalidRoot);
                }
                ids.push(id);
                off += 5;
            }
            ValuePayload::Roots(ids)
        };
        Ok(Self { key, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn inner_node_round_trips() {
        let mut n = InnerNode::new(vec![1, 2, 3]);
        n.set_branch(5, ObjectId::new(10));
        n.set_branch(2, ObjectId::new(20));
        n.value = ObjectId::new(99);
        let encoded = n.encode();
        let decoded = InnerNode::decode(&encoded).unwrap();
        assert_eq!(decoded, n);
        assert_eq!(decoded.branch(2), Some(ObjectId::new(20)));
        assert_eq!(decoded.branch(5), Some(ObjectId::new(10)));
        assert_eq!(decoded.branch(3), None);
    }

    #[test]
    fn inner_node_bit_ops() {
        let mut n = InnerNode::new(vec![]);
        n.set_branch(0, ObjectId::new(1));
        n.set_branch(63, ObjectId::new(2));
        n.set_branch(30, ObjectId::new(3));
        assert_eq!(n.lower_bound(1), Some(30));
        assert_eq!(n.lower_bound(31), Some(63));
        assert_eq!(n.lower_bound(64.min(63) + 1), None);
        assert_eq!(n.reverse_lower_bound(62), Some(30));
        assert_eq!(n.reverse_lower_bound(0), Some(0));
        n.remove_branch(30);
        assert_eq!(n.branch_count(), 2);
        assert_eq!(n.branch(30), None);
    }

    #[test]
    fn value_bytes_round_trips() {
        let v = ValueNode::new(vec![1, 2, 3, 4], ValuePayload::Bytes(b"hello".to_vec()));
        let encoded = v.encode();
        assert_eq!(ValueNode::decode(&encoded).unwrap(), v);
        assert_eq!(NodeType::peek(&encoded).unwrap(), NodeType::ValueBytes);
    }

    #[test]
    fn bytes_payload_range_matches_decode() {
        let v = ValueNode::new(vec![5, 6], ValuePayload::Bytes(b"pinned".to_vec()));
        let encoded = v.encode();
        let range = ValueNode::bytes_payload_range(&encoded).unwrap();
        assert_eq!(&encoded[range], b"pinned");
    }

    #[test]
    fn value_roots_round_trips() {
        let v = ValueNode::new(
            vec![],
            ValuePayload::Roots(vec![ObjectId::new(1), ObjectId::new(2)]),
        );
        let encoded = v.encode();
        assert_eq!(ValueNode::decode(&encoded).unwrap(), v);
        assert_eq!(NodeType::peek(&encoded).unwrap(), NodeType::ValueRoots);
    }

    #[test]
    fn value_roots_decode_rejects_a_null_id() {
        let v = ValueNode::new(vec![], ValuePayload::Roots(vec![ObjectId::new(1)]));
        let mut encoded = v.encode();
        let len = encoded.len();
        // Stomp the one encoded id (the last 5 bytes) with nulls.
        encoded[len - 5..].fill(0);
        assert_eq!(ValueNode::decode(&encoded).unwrap_err(), Error::InvalidRoot);
    }
}
