//! Path-stack cursor over a trie snapshot: first/last/next/prev plus
//! bound-seeking constructors (lower_bound/reverse_lower_bound), each
//! optionally restricted to a prefix by the caller re-checking
//! [`Cursor::current_key`] against the prefix after each step.

use crate::node::{NodeType, ValuePayload};
use crate::object_id::ObjectId;
use crate::trie::{common_prefix, Resolver};
use crate::Error;
use alloc::vec::Vec;

/// One level of the cursor's descent. `index == -1` means "positioned at
/// this node's own value" (true for both a value-leaf and an inner node's
/// value slot); `index` in `0..64` means "positioned inside that child
/// branch of an inner node".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub id: ObjectId,
    pub index: i16,
}

/// A cursor over an ordered walk of a trie snapshot. An empty path means
/// "before the first element" / "past the last element" / "no match".
#[derive(Debug, Clone, Default)]
pub struct Cursor {
    path: Vec<Frame>,
}

impl Cursor {
    pub fn empty() -> Self {
        Self { path: Vec::new() }
    }

    pub fn is_valid(&self) -> bool {
        !self.path.is_empty()
    }

    pub fn path(&self) -> &[Frame] {
        &self.path
    }

    /// Reconstruct the full original-byte key at the cursor's position.
    pub fn current_key<R: Resolver>(&self, r: &R) -> Result<Option<Vec<u8>>, Error> {
        if self.path.is_empty() {
            return Ok(None);
        }
        let mut digits = Vec::new();
        for (i, frame) in self.path.iter().enumerate() {
            let last = i + 1 == self.path.len();
            match r.node_type(frame.id)? {
                NodeType::Inner => {
                    let inn = r.resolve_inner(frame.id)?;
                    digits.extend_from_slice(&inn.prefix);
                    if !last {
                        digits.push(frame.index as u8);
                    }
                }
                _ => {
                    let vn = r.resolve_value(frame.id)?;
                    digits.extend_from_slice(&vn.key);
                }
            }
        }
        Ok(Some(crate::key6::from_key6(&digits)))
    }

    /// The payload at the cursor's position, if valid.
    pub fn current_value<R: Resolver>(&self, r: &R) -> Result<Option<ValuePayload>, Error> {
        let Some(frame) = self.path.last() else {
            return Ok(None);
        };
        match r.node_type(frame.id)? {
            NodeType::Inner => {
                let inn = r.resolve_inner(frame.id)?;
                if inn.value.is_null() {
                    Ok(None)
                } else {
                    Ok(Some(r.resolve_value(inn.value)?.payload))
                }
            }
            _ => Ok(Some(r.resolve_value(frame.id)?.payload)),
        }
    }

    pub fn next<R: Resolver>(&mut self, r: &R) -> Result<(), Error> {
        next_impl(r, &mut self.path)
    }

    pub fn prev<R: Resolver>(&mut self, r: &R) -> Result<(), Error> {
        prev_impl(r, &mut self.path)
    }
}

fn is_leaf<R: Resolver>(r: &R, id: ObjectId) -> Result<bool, Error> {
    Ok(!matches!(r.node_type(id)?, NodeType::Inner))
}

/// Descend to the smallest key in the subtree rooted at `id`, pushing
/// frames onto `path` as it goes (used by `first()` and whenever a
/// bound-seek determines "take everything under here").
fn descend_first<R: Resolver>(r: &R, mut id: ObjectId, path: &mut Vec<Frame>) -> Result<(), Error> {
    loop {
        if is_leaf(r, id)? {
            path.push(Frame { id, index: -1 });
            return Ok(());
        }
        let inn = r.resolve_inner(id)?;
        if !inn.value.is_null() {
            path.push(Frame { id, index: -1 });
            return Ok(());
        }
        let lb = inn.lower_bound(0).ok_or(Error::DataCorruption)?;
        path.push(Frame { id, index: lb as i16 });
        id = inn.branch(lb).ok_or(Error::DataCorruption)?;
    }
}

/// Descend to the greatest key in the subtree rooted at `id`.
fn descend_last<R: Resolver>(r: &R, mut id: ObjectId, path: &mut Vec<Frame>) -> Result<(), Error> {
    loop {
        if is_leaf(r, id)? {
            path.push(Frame { id, index: -1 });
            return Ok(());
        }
        let inn = r.resolve_inner(id)?;
        match inn.reverse_lower_bound(63) {
            Some(d) => {
                path.push(Frame { id, index: d as i16 });
                id = inn.branch(d).ok_or(Error::DataCorruption)?;
            }
            None => {
                // No children: must have a value (well-formed non-null node).
                path.push(Frame { id, index: -1 });
                return Ok(());
            }
        }
    }
}

pub fn first<R: Resolver>(r: &R, root: ObjectId) -> Result<Cursor, Error> {
    let mut path = Vec::new();
    if !root.is_null() {
        descend_first(r, root, &mut path)?;
    }
    Ok(Cursor { path })
}

pub fn last<R: Resolver>(r: &R, root: ObjectId) -> Result<Cursor, Error> {
    let mut path = Vec::new();
    if !root.is_null() {
        descend_last(r, root, &mut path)?;
    }
    Ok(Cursor { path })
}

fn next_impl<R: Resolver>(r: &R, path: &mut Vec<Frame>) -> Result<(), Error> {
    loop {
        let Some(frame) = path.last_mut() else {
            return Ok(());
        };
        let id = frame.id;
        if !is_leaf(r, id)? {
            let inn = r.resolve_inner(id)?;
            let start = if frame.index < 0 { 0 } else { frame.index as u16 + 1 };
            if start <= 63 {
                if let Some(d) = inn.lower_bound(start as u8) {
                    frame.index = d as i16;
                    let child = inn.branch(d).ok_or(Error::DataCorruption)?;
                    descend_first(r, child, path)?;
                    return Ok(());
                }
            }
        }
        path.pop();
    }
}

fn prev_impl<R: Resolver>(r: &R, path: &mut Vec<Frame>) -> Result<(), Error> {
    loop {
        let Some(frame) = path.last_mut() else {
            return Ok(());
        };
        let id = frame.id;
        let mut found: Option<i16> = None;
        if !is_leaf(r, id)? {
            let inn = r.resolve_inner(id)?;
            if frame.index > 0 {
                if let Some(d) = inn.reverse_lower_bound(frame.index as u8 - 1) {
                    found = Some(d as i16);
                } else if !inn.value.is_null() {
                    found = Some(-1);
                }
            } else if frame.index == 0 && !inn.value.is_null() {
                found = Some(-1);
            }
        }
        match found {
            Some(-1) => {
                frame.index = -1;
                return Ok(());
            }
            Some(d) => {
                frame.index = d;
                let inn = r.resolve_inner(id)?;
                let child = inn.branch(d as u8).ok_or(Error::DataCorruption)?;
                descend_last(r, child, path)?;
                return Ok(());
            }
            None => {
                path.pop();
            }
        }
    }
}

pub fn lower_bound<R: Resolver>(r: &R, root: ObjectId, mut key: &[u8]) -> Result<Cursor, Error> {
    let mut path = Vec::new();
    let mut cur = root;
    loop {
        if cur.is_null() {
            return Ok(Cursor { path });
        }
        if is_leaf(r, cur)? {
            let vn = r.resolve_value(cur)?;
            if vn.key.as_slice() >= key {
                path.push(Frame { id: cur, index: -1 });
            }
            return Ok(Cursor { path });
        }
        let inn = r.resolve_inner(cur)?;
        let cpre = common_prefix(key, &inn.prefix);
        if key.len() <= cpre {
            // key is fully consumed within (or equal to) this node's prefix:
            // everything at/under this node is >= key.
            descend_first(r, cur, &mut path)?;
            return Ok(Cursor { path });
        }
        if cpre < inn.prefix.len() {
            if inn.prefix[cpre] > key[cpre] {
                descend_first(r, cur, &mut path)?;
            }
            // else: whole subtree < key; nothing found at/under this node.
            return Ok(Cursor { path });
        }
        // cpre == inn.prefix.len() < key.len(): descend via branch digit.
        let digit = key[cpre];
        match inn.lower_bound(digit) {
            Some(b) if b == digit => {
                path.push(Frame { id: cur, index: b as i16 });
                cur = inn.branch(b).ok_or(Error::DataCorruption)?;
                key = &key[cpre + 1..];
            }
            Some(b) => {
                path.push(Frame { id: cur, index: b as i16 });
                let child = inn.branch(b).ok_or(Error::DataCorruption)?;
                descend_first(r, child, &mut path)?;
                return Ok(Cursor { path });
            }
            None => return Ok(Cursor { path }),
        }
    }
}

pub fn reverse_lower_bound<R: Resolver>(
    r: &R,
    root: ObjectId,
    mut key: &[u8],
) -> Result<Cursor, Error> {
    let mut path = Vec::new();
    let mut cur = root;
    loop {
        if cur.is_null() {
            return Ok(Cursor { path });
        }
        if is_leaf(r, cur)? {
            let vn = r.resolve_value(cur)?;
            if vn.key.as_slice() <= key {
                path.push(Frame { id: cur, index: -1 });
            }
            return Ok(Cursor { path });
        }
        let inn = r.resolve_inner(cur)?;
        let cpre = common_prefix(key, &inn.prefix);
        if key.len() <= cpre {
            if inn.prefix.len() == cpre {
                // this node's own accumulated key equals the target exactly.
                if !inn.value.is_null() {
                    path.push(Frame { id: cur, index: -1 });
                }
            }
            // else inn.prefix is longer (node's key > target): nothing qualifies.
            return Ok(Cursor { path });
        }
        if cpre < inn.prefix.len() {
            if inn.prefix[cpre] < key[cpre] {
                descend_last(r, cur, &mut path)?;
            }
            return Ok(Cursor { path });
        }
        let digit = key[cpre];
        match inn.reverse_lower_bound(digit) {
            Some(b) if b == digit => {
                path.push(Frame { id: cur, index: b as i16 });
                cur = inn.branch(b).ok_or(Error::DataCorruption)?;
                key = &key[cpre + 1..];
            }
            Some(b) => {
                path.push(Frame { id: cur, index: b as i16 });
                let child = inn.branch(b).ok_or(Error::DataCorruption)?;
                descend_last(r, child, &mut path)?;
                return Ok(Cursor { path });
            }
            None => {
                if !inn.value.is_null() {
                    path.push(Frame { id: cur, index: -1 });
                }
                return Ok(Cursor { path });
            }
        }
    }
}

/// Least key strictly greater than `key`.
pub fn upper_bound<R: Resolver>(r: &R, root: ObjectId, key: &[u8]) -> Result<Cursor, Error> {
    let mut c = lower_bound(r, root, key)?;
    if let Some(found) = c.current_key(r)? {
        if found == crate::key6::from_key6(key) {
            c.next(r)?;
        }
    }
    Ok(c)
}

/// Smallest key sharing `prefix`, or an empty cursor if none do.
pub fn first_with_prefix<R: Resolver>(
    r: &R,
    root: ObjectId,
    prefix: &[u8],
) -> Result<Cursor, Error> {
    let c = lower_bound(r, root, prefix)?;
    match c.current_key(r)? {
        Some(k) if k.starts_with(&crate::key6::from_key6(prefix)) => Ok(c),
        _ => Ok(Cursor::empty()),
    }
}

/// Greatest key sharing `prefix`, or an empty cursor if none do.
pub fn last_with_prefix<R: Resolver>(
    r: &R,
    root: ObjectId,
    mut prefix: &[u8],
) -> Result<Cursor, Error> {
    let mut path = Vec::new();
    let mut cur = root;
    loop {
        if cur.is_null() {
            return Ok(Cursor { path });
        }
        if is_leaf(r, cur)? {
            let vn = r.resolve_value(cur)?;
            if vn.key.len() >= prefix.len() && &vn.key[..prefix.len()] == prefix {
                path.push(Frame { id: cur, index: -1 });
                return Ok(Cursor { path });
            }
            return Ok(Cursor { path: Vec::new() });
        }
        let inn = r.resolve_inner(cur)?;
        let cpre = common_prefix(prefix, &inn.prefix);
        if inn.prefix.len() >= prefix.len() {
            if cpre == prefix.len() {
                // node's own key already contains the whole prefix.
                descend_last(r, cur, &mut path)?;
                return Ok(Cursor { path });
            }
            return Ok(Cursor { path: Vec::new() });
        }
        if cpre != inn.prefix.len() {
            return Ok(Cursor { path: Vec::new() });
        }
        let digit = prefix[cpre];
        match inn.branch(digit) {
            Some(child) => {
                path.push(Frame { id: cur, index: digit as i16 });
                cur = child;
                prefix = &prefix[cpre + 1..];
            }
            None => return Ok(Cursor { path: Vec::new() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{InnerNode, ValueNode};
    use alloc::collections::BTreeMap;
    use alloc::vec;

    /// An in-memory resolver over a map, for exercising cursor logic without
    /// any allocator machinery.
    struct MapResolver {
        inner: BTreeMap<u64, InnerNode>,
        values: BTreeMap<u64, ValueNode>,
    }

    impl Resolver for MapResolver {
        fn resolve_inner(&self, id: ObjectId) -> Result<InnerNode, Error> {
            self.inner.get(&id.get()).cloned().ok_or(Error::DataCorruption)
        }
        fn resolve_value(&self, id: ObjectId) -> Result<ValueNode, Error> {
            self.values.get(&id.get()).cloned().ok_or(Error::DataCorruption)
        }
        fn node_type(&self, id: ObjectId) -> Result<NodeType, Error> {
            if self.inner.contains_key(&id.get()) {
                Ok(NodeType::Inner)
            } else if let Some(v) = self.values.get(&id.get()) {
                Ok(match v.payload {
                    ValuePayload::Bytes(_) => NodeType::ValueBytes,
                    ValuePayload::Roots(_) => NodeType::ValueRoots,
                })
            } else {
                Err(Error::DataCorruption)
            }
        }
    }

    // Builds: root inner (prefix []) with children at digit 1 -> leaf "a"
    // (key6 of 'a') and digit 2 -> leaf "b". This is a tiny smoke test of
    // traversal order, not a full trie (full coverage lives in trie.rs).
    fn small_tree() -> (MapResolver, ObjectId) {
        let mut inner = BTreeMap::new();
        let mut values = BTreeMap::new();
        let leaf_a = ValueNode::new(vec![], ValuePayload::Bytes(b"A".to_vec()));
        let leaf_b = ValueNode::new(vec![], ValuePayload::Bytes(b"B".to_vec()));
        values.insert(1, leaf_a);
        values.insert(2, leaf_b);
        let mut root_node = InnerNode::new(vec![]);
        root_node.set_branch(1, ObjectId::new(1));
        root_node.set_branch(5, ObjectId::new(2));
        inner.insert(10, root_node);
        (MapResolver { inner, values }, ObjectId::new(10))
    }

    #[test]
    fn first_and_last_and_next() {
        let (r, root) = small_tree();
        let mut c = first(&r, root).unwrap();
        assert_eq!(c.current_value(&r).unwrap(), Some(ValuePayload::Bytes(b"A".to_vec())));
        c.next(&r).unwrap();
        assert_eq!(c.current_value(&r).unwrap(), Some(ValuePayload::Bytes(b"B".to_vec())));
        c.next(&r).unwrap();
        assert!(!c.is_valid());

        let l = last(&r, root).unwrap();
        assert_eq!(l.current_value(&r).unwrap(), Some(ValuePayload::Bytes(b"B".to_vec())));
    }

    #[test]
    fn prev_walks_backward() {
        let (r, root) = small_tree();
        let mut c = last(&r, root).unwrap();
        assert_eq!(c.current_value(&r).unwrap(), Some(ValuePayload::Bytes(b"B".to_vec())));
        c.prev(&r).unwrap();
        assert_eq!(c.current_value(&r).unwrap(), Some(ValuePayload::Bytes(b"A".to_vec())));
        c.prev(&r).unwrap();
        assert!(!c.is_valid());
    }

    #[test]
    fn empty_tree_cursors_are_invalid() {
        let r = MapResolver { inner: BTreeMap::new(), values: BTreeMap::new() };
        assert!(!first(&r, ObjectId::NULL).unwrap().is_valid());
        assert!(!last(&r, ObjectId::NULL).unwrap().is_valid());
    }
}
