//! The radix-trie engine: lookup, copy-on-write insert, delete-with-collapse,
//! and the non-cursor range reads (`get_greater_equal`/`get_less_than`/
//! `get_max_in_prefix`). Everything here works purely in terms of
//! [`ObjectId`]s and the [`Resolver`]/[`Writer`] callbacks; it has no idea
//! where bytes actually live.
//!
//! The three insert cases below (null root, value-leaf root, inner-node
//! root) and the refcount discipline around them (edit in place only when
//! both the caller's handle and the node's own refcount say it is safe;
//! clone and bump every forwarded child edge otherwise) are the same shape
//! as the allocator-level copy-on-write contract the rest of the workspace
//! follows.

use crate::node::{InnerNode, NodeType, ValueNode, ValuePayload};
use crate::object_id::ObjectId;
use crate::{Error, MAX_KEY_BYTES};
use alloc::vec::Vec;

/// Read-only access to nodes by id.
pub trait Resolver {
    fn resolve_inner(&self, id: ObjectId) -> Result<InnerNode, Error>;
    fn resolve_value(&self, id: ObjectId) -> Result<ValueNode, Error>;
    fn node_type(&self, id: ObjectId) -> Result<NodeType, Error>;
}

/// Mutating access: allocation, in-place edits, and refcount bookkeeping.
/// Implementations own the actual storage (segments, object index); this
/// trait is the seam between the trie algorithms and that storage.
pub trait Writer: Resolver {
    /// Whether `id` currently has refcount 1 (a caller-side `unique` flag of
    /// `true` combined with this is what licenses an in-place edit).
    fn is_unique(&self, id: ObjectId) -> bool;
    fn alloc_inner(&mut self, node: &InnerNode) -> Result<ObjectId, Error>;
    fn alloc_value(&mut self, node: &ValueNode) -> Result<ObjectId, Error>;
    /// Overwrite `id`'s stored bytes. Caller must already have established
    /// refcount 1 and exclusive access.
    fn edit_inner(&mut self, id: ObjectId, node: &InnerNode) -> Result<(), Error>;
    fn edit_value(&mut self, id: ObjectId, node: &ValueNode) -> Result<(), Error>;
    /// Increment `id`'s refcount, returning the id to use going forward
    /// (normally `id` itself; a different id if the counter was saturated
    /// and the engine had to clone to get a fresh one).
    fn retain(&mut self, id: ObjectId) -> Result<ObjectId, Error>;
    /// Decrement `id`'s refcount, freeing (and recursively releasing its
    /// own children) if it reaches zero. No-op on `ObjectId::NULL`.
    fn release(&mut self, id: ObjectId) -> Result<(), Error>;
}

/// Length of the shared prefix of two digit sequences.
pub fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

fn check_key_len(key: &[u8]) -> Result<(), Error> {
    if key.len() > MAX_KEY_BYTES {
        Err(Error::KeyTooLong)
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------

pub fn lookup<R: Resolver>(r: &R, root: ObjectId, key: &[u8]) -> Result<Option<ValuePayload>, Error> {
    check_key_len(key)?;
    let digits = crate::key6::to_key6(key);
    lookup_digits(r, root, &digits)
}

fn lookup_digits<R: Resolver>(
    r: &R,
    mut cur: ObjectId,
    mut key: &[u8],
) -> Result<Option<ValuePayload>, Error> {
    loop {
        if cur.is_null() {
            return Ok(None);
        }
        match r.node_type(cur)? {
            NodeType::Inner => {
                let inn = r.resolve_inner(cur)?;
                if inn.prefix == key {
                    return if inn.value.is_null() {
                        Ok(None)
                    } else {
                        Ok(Some(r.resolve_value(inn.value)?.payload))
                    };
                }
                let cpre = common_prefix(key, &inn.prefix);
                if cpre != inn.prefix.len() || key.len() <= cpre {
                    return Ok(None);
                }
                match inn.branch(key[cpre]) {
                    Some(child) => {
                        cur = child;
                        key = &key[cpre + 1..];
                    }
                    None => return Ok(None),
                }
            }
            _ => {
                let vn = r.resolve_value(cur)?;
                return Ok(if vn.key == key { Some(vn.payload) } else { None });
            }
        }
    }
}

/// Like [`lookup`], but returns the value node's own id instead of its
/// resolved payload -- lets a caller pin the leaf and borrow its encoded
/// bytes directly instead of copying them out through `resolve_value`.
pub fn lookup_value_id<R: Resolver>(
    r: &R,
    root: ObjectId,
    key: &[u8],
) -> Result<Option<ObjectId>, Error> {
    check_key_len(key)?;
    let digits = crate::key6::to_key6(key);
    lookup_value_id_digits(r, root, &digits)
}

fn lookup_value_id_digits<R: Resolver>(
    r: &R,
    mut cur: ObjectId,
    mut key: &[u8],
) -> Result<Option<ObjectId>, Error> {
    loop {
        if cur.is_null() {
            return Ok(None);
        }
        match r.node_type(cur)? {
            NodeType::Inner => {
                let inn = r.resolve_inner(cur)?;
                if inn.prefix == key {
                    return Ok(if inn.value.is_null() { None } else { Some(inn.value) });
                }
                let cpre = common_prefix(key, &inn.prefix);
                if cpre != inn.prefix.len() || key.len() <= cpre {
                    return Ok(None);
                }
                match inn.branch(key[cpre]) {
                    Some(child) => {
                        cur = child;
                        key = &key[cpre + 1..];
                    }
                    None => return Ok(None),
                }
            }
            _ => {
                let vn = r.resolve_value(cur)?;
                return Ok(if vn.key == key { Some(cur) } else { None });
            }
        }
    }
}

// ---------------------------------------------------------------------
// Insert
// ---------------------------------------------------------------------

/// Insert or overwrite `key` with `payload` under `root`. `unique` asserts
/// the caller holds the sole live handle to `root` (the write session's own
/// in-progress snapshot, not yet shared) -- combined with the node's own
/// refcount, this licenses in-place edits along the path. Returns the new
/// root and, if a value was overwritten, its previous encoded size.
pub fn insert<W: Writer>(
    w: &mut W,
    root: ObjectId,
    unique: bool,
    key: &[u8],
    payload: ValuePayload,
) -> Result<(ObjectId, Option<usize>), Error> {
    check_key_len(key)?;
    let digits = crate::key6::to_key6(key);
    let mut old_size = None;
    let new_root = add_child(w, root, unique, &digits, payload, &mut old_size)?;
    Ok((new_root, old_size))
}

fn add_child<W: Writer>(
    w: &mut W,
    root: ObjectId,
    unique: bool,
    key: &[u8],
    payload: ValuePayload,
    old_size: &mut Option<usize>,
) -> Result<ObjectId, Error> {
    if root.is_null() {
        return w.alloc_value(&ValueNode::new(key.to_vec(), payload));
    }
    let new_root = match w.node_type(root)? {
        NodeType::ValueBytes | NodeType::ValueRoots => {
            let vn = w.resolve_value(root)?;
            if vn.key != key {
                combine_value_nodes(w, vn, key, payload)?
            } else {
                *old_size = Some(vn.data_len());
                let can_edit = unique && w.is_unique(root);
                set_value(w, root, vn, can_edit, payload)?
            }
        }
        NodeType::Inner => {
            let inn = w.resolve_inner(root)?;
            add_child_inner(w, root, inn, unique, key, payload, old_size)?
        }
    };
    if new_root != root {
        w.release(root)?;
    }
    Ok(new_root)
}

fn set_value<W: Writer>(
    w: &mut W,
    id: ObjectId,
    vn: ValueNode,
    can_edit_in_place: bool,
    payload: ValuePayload,
) -> Result<ObjectId, Error> {
    let node = ValueNode::new(vn.key, payload);
    if can_edit_in_place {
        w.edit_value(id, &node)?;
        Ok(id)
    } else {
        w.alloc_value(&node)
    }
}

/// Split a value leaf whose key diverges from the new key into a fresh
/// inner node holding both. Never touches `old_id`'s refcount; the caller
/// (`add_child`) releases it once it sees the returned id differs.
fn combine_value_nodes<W: Writer>(
    w: &mut W,
    old: ValueNode,
    new_key: &[u8],
    new_payload: ValuePayload,
) -> Result<ObjectId, Error> {
    let cpre = common_prefix(&old.key, new_key);
    let mut node = InnerNode::new(old.key[..cpre].to_vec());

    if cpre == old.key.len() {
        node.value = w.alloc_value(&ValueNode::new(Vec::new(), old.payload))?;
    } else {
        let digit = old.key[cpre];
        let rest = old.key[cpre + 1..].to_vec();
        let id = w.alloc_value(&ValueNode::new(rest, old.payload))?;
        node.set_branch(digit, id);
    }

    if cpre == new_key.len() {
        node.value = w.alloc_value(&ValueNode::new(Vec::new(), new_payload))?;
    } else {
        let digit = new_key[cpre];
        let rest = new_key[cpre + 1..].to_vec();
        let id = w.alloc_value(&ValueNode::new(rest, new_payload))?;
        node.set_branch(digit, id);
    }

    w.alloc_inner(&node)
}

fn add_child_inner<W: Writer>(
    w: &mut W,
    root: ObjectId,
    inn: InnerNode,
    unique: bool,
    key: &[u8],
    payload: ValuePayload,
    old_size: &mut Option<usize>,
) -> Result<ObjectId, Error> {
    if inn.prefix == key {
        let can_edit = unique && w.is_unique(root);
        return set_inner_value(w, root, inn, can_edit, payload, old_size);
    }

    let cpre = common_prefix(key, &inn.prefix);

    if cpre == inn.prefix.len() {
        let digit = key[cpre];
        let rest = &key[cpre + 1..];
        let can_edit = unique && w.is_unique(root);
        if can_edit && inn.has_branch(digit) {
            let cur_b = inn.branch(digit).unwrap();
            let new_b = add_child(w, cur_b, true, rest, payload, old_size)?;
            if new_b != cur_b {
                let mut edited = inn;
                edited.set_branch(digit, new_b);
                w.edit_inner(root, &edited)?;
            }
            Ok(root)
        } else {
            let cur_b = inn.branch(digit).unwrap_or(ObjectId::NULL);
            let new_b = add_child(w, cur_b, false, rest, payload, old_size)?;
            let mut new_inn = inn;
            retain_children(w, &mut new_inn, Some(digit))?;
            retain_value(w, &mut new_inn)?;
            new_inn.set_branch(digit, new_b);
            w.alloc_inner(&new_inn)
        }
    } else if cpre == key.len() {
        split_key_ends_in_prefix(w, inn, cpre, key, payload)
    } else {
        split_diverging(w, inn, cpre, key, payload)
    }
}

fn set_inner_value<W: Writer>(
    w: &mut W,
    id: ObjectId,
    mut node: InnerNode,
    can_edit_in_place: bool,
    payload: ValuePayload,
    old_size: &mut Option<usize>,
) -> Result<ObjectId, Error> {
    if !node.value.is_null() {
        *old_size = Some(w.resolve_value(node.value)?.data_len());
    }
    let new_value_id = w.alloc_value(&ValueNode::new(Vec::new(), payload))?;
    let old_value = node.value;
    node.value = new_value_id;
    let new_id = if can_edit_in_place {
        w.edit_inner(id, &node)?;
        id
    } else {
        retain_children(w, &mut node, None)?;
        w.alloc_inner(&node)?
    };
    if !old_value.is_null() {
        w.release(old_value)?;
    }
    Ok(new_id)
}

fn split_key_ends_in_prefix<W: Writer>(
    w: &mut W,
    inn: InnerNode,
    cpre: usize,
    key: &[u8],
    payload: ValuePayload,
) -> Result<ObjectId, Error> {
    let digit = inn.prefix[cpre];
    let mut demoted = inn;
    demoted.prefix = demoted.prefix[cpre + 1..].to_vec();
    let demoted_id = w.alloc_inner(&demoted)?;

    let mut node = InnerNode::new(key.to_vec());
    node.value = w.alloc_value(&ValueNode::new(Vec::new(), payload))?;
    node.set_branch(digit, demoted_id);
    w.alloc_inner(&node)
}

fn split_diverging<W: Writer>(
    w: &mut W,
    inn: InnerNode,
    cpre: usize,
    key: &[u8],
    payload: ValuePayload,
) -> Result<ObjectId, Error> {
    let old_digit = inn.prefix[cpre];
    let new_digit = key[cpre];
    let mut demoted = inn;
    demoted.prefix = demoted.prefix[cpre + 1..].to_vec();
    let demoted_id = w.alloc_inner(&demoted)?;

    let new_leaf = ValueNode::new(key[cpre + 1..].to_vec(), payload);
    let new_leaf_id = w.alloc_value(&new_leaf)?;

    let mut node = InnerNode::new(key[..cpre].to_vec());
    node.set_branch(old_digit, demoted_id);
    node.set_branch(new_digit, new_leaf_id);
    w.alloc_inner(&node)
}

/// When cloning a node forward (it is shared, or we are adding a branch it
/// never had), every child edge we copy unmodified now has two incoming
/// references (the untouched original and this clone) and must be
/// retained. `skip_digit` excludes the one branch the caller is about to
/// overwrite with a freshly-owned id.
fn retain_children<W: Writer>(
    w: &mut W,
    node: &mut InnerNode,
    skip_digit: Option<u8>,
) -> Result<(), Error> {
    let mut from = 0u8;
    loop {
        let Some(d) = node.lower_bound(from) else { break };
        if Some(d) != skip_digit {
            let id = node.branch(d).unwrap();
            let new_id = w.retain(id)?;
            if new_id != id {
                node.set_branch(d, new_id);
            }
        }
        if d == 63 {
            break;
        }
        from = d + 1;
    }
    Ok(())
}

fn retain_value<W: Writer>(w: &mut W, node: &mut InnerNode) -> Result<(), Error> {
    if !node.value.is_null() {
        let new_id = w.retain(node.value)?;
        if new_id != node.value {
            node.value = new_id;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------

/// Remove `key` from the tree rooted at `root`, collapsing any inner node
/// that drops below its minimum shape (no value and at most one child).
/// Returns the new root (`ObjectId::NULL` if the tree becomes empty) and,
/// if the key was present, its previous encoded size.
pub fn remove<W: Writer>(
    w: &mut W,
    root: ObjectId,
    unique: bool,
    key: &[u8],
) -> Result<(ObjectId, Option<usize>), Error> {
    check_key_len(key)?;
    let digits = crate::key6::to_key6(key);
    let mut old_size = None;
    let new_root = remove_impl(w, root, unique, &digits, &mut old_size)?;
    Ok((new_root, old_size))
}

fn remove_impl<W: Writer>(
    w: &mut W,
    root: ObjectId,
    unique: bool,
    key: &[u8],
    old_size: &mut Option<usize>,
) -> Result<ObjectId, Error> {
    if root.is_null() {
        return Ok(root);
    }
    let new_root = match w.node_type(root)? {
        NodeType::ValueBytes | NodeType::ValueRoots => {
            let vn = w.resolve_value(root)?;
            if vn.key != key {
                root
            } else {
                *old_size = Some(vn.data_len());
                ObjectId::NULL
            }
        }
        NodeType::Inner => {
            let inn = w.resolve_inner(root)?;
            remove_inner(w, root, inn, unique, key, old_size)?
        }
    };
    if new_root != root {
        w.release(root)?;
    }
    Ok(new_root)
}

fn remove_inner<W: Writer>(
    w: &mut W,
    root: ObjectId,
    mut inn: InnerNode,
    unique: bool,
    key: &[u8],
    old_size: &mut Option<usize>,
) -> Result<ObjectId, Error> {
    if inn.prefix == key {
        if inn.value.is_null() {
            return Ok(root);
        }
        *old_size = Some(w.resolve_value(inn.value)?.data_len());
        let can_edit = unique && w.is_unique(root);
        let old_value = inn.value;
        inn.value = ObjectId::NULL;
        return finish_inner_edit(w, root, inn, can_edit, Some(old_value));
    }

    let cpre = common_prefix(key, &inn.prefix);
    if cpre != inn.prefix.len() || key.len() <= cpre {
        return Ok(root);
    }
    let digit = key[cpre];
    let rest = &key[cpre + 1..];
    let Some(cur_b) = inn.branch(digit) else {
        return Ok(root);
    };
    let can_edit = unique && w.is_unique(root);
    let new_b = remove_impl(w, cur_b, can_edit, rest, old_size)?;
    if new_b == cur_b {
        return Ok(root);
    }
    if new_b.is_null() {
        inn.remove_branch(digit);
    } else {
        inn.set_branch(digit, new_b);
    }
    finish_inner_edit(w, root, inn, can_edit, None)
}

/// Commit a locally-mutated inner node: demote to a plain value leaf if it
/// lost its last branch, collapse into its sole remaining child if it has
/// no value, otherwise edit in place or clone as refcounts allow.
/// `release_old_edge` is an id whose one incoming reference from this node
/// was just dropped (the old value, when clearing it) and that this
/// function still owes a release regardless of which path it takes below.
fn finish_inner_edit<W: Writer>(
    w: &mut W,
    root: ObjectId,
    node: InnerNode,
    can_edit_in_place: bool,
    release_old_edge: Option<ObjectId>,
) -> Result<ObjectId, Error> {
    if let Some(old) = release_old_edge {
        if !old.is_null() {
            w.release(old)?;
        }
    }

    if node.branch_count() == 0 {
        if node.value.is_null() {
            return Ok(ObjectId::NULL);
        }
        let payload = w.resolve_value(node.value)?.payload;
        w.release(node.value)?;
        return w.alloc_value(&ValueNode::new(node.prefix, payload));
    }

    if node.value.is_null() {
        if let Some((digit, child)) = node.only_branch() {
            return collapse(w, child, digit, &node.prefix);
        }
    }

    if can_edit_in_place {
        w.edit_inner(root, &node)?;
        Ok(root)
    } else {
        let mut cloned = node;
        retain_children(w, &mut cloned, None)?;
        retain_value(w, &mut cloned)?;
        w.alloc_inner(&cloned)
    }
}

/// Merge a single-child, no-value inner node into that child by prepending
/// the parent's prefix and branch digit onto the child's own key/prefix.
/// Relocates the child's content into a fresh id; never duplicates it, so
/// the old child id is released once the move is complete.
fn collapse<W: Writer>(
    w: &mut W,
    child: ObjectId,
    digit: u8,
    parent_prefix: &[u8],
) -> Result<ObjectId, Error> {
    let new_id = match w.node_type(child)? {
        NodeType::Inner => {
            let mut c = w.resolve_inner(child)?;
            let mut merged = parent_prefix.to_vec();
            merged.push(digit);
            merged.extend_from_slice(&c.prefix);
            c.prefix = merged;
            w.alloc_inner(&c)?
        }
        _ => {
            let mut v = w.resolve_value(child)?;
            let mut merged = parent_prefix.to_vec();
            merged.push(digit);
            merged.extend_from_slice(&v.key);
            v.key = merged;
            w.alloc_value(&v)?
        }
    };
    w.release(child)?;
    Ok(new_id)
}

// ---------------------------------------------------------------------
// Non-cursor range reads
// ---------------------------------------------------------------------

fn read_cursor<R: Resolver>(
    r: &R,
    c: &crate::cursor::Cursor,
) -> Result<Option<(Vec<u8>, ValuePayload)>, Error> {
    match (c.current_key(r)?, c.current_value(r)?) {
        (Some(k), Some(v)) => Ok(Some((k, v))),
        _ => Ok(None),
    }
}

/// Smallest stored key that is `>= key`.
pub fn get_greater_equal<R: Resolver>(
    r: &R,
    root: ObjectId,
    key: &[u8],
) -> Result<Option<(Vec<u8>, ValuePayload)>, Error> {
    check_key_len(key)?;
    let digits = crate::key6::to_key6(key);
    let c = crate::cursor::lower_bound(r, root, &digits)?;
    read_cursor(r, &c)
}

/// Largest stored key that is `< key`.
pub fn get_less_than<R: Resolver>(
    r: &R,
    root: ObjectId,
    key: &[u8],
) -> Result<Option<(Vec<u8>, ValuePayload)>, Error> {
    check_key_len(key)?;
    let digits = crate::key6::to_key6(key);
    let mut c = crate::cursor::reverse_lower_bound(r, root, &digits)?;
    if let Some(found) = c.current_key(r)? {
        if found == key {
            c.prev(r)?;
        }
    }
    read_cursor(r, &c)
}

/// Largest stored key sharing `prefix`.
pub fn get_max_in_prefix<R: Resolver>(
    r: &R,
    root: ObjectId,
    prefix: &[u8],
) -> Result<Option<(Vec<u8>, ValuePayload)>, Error> {
    check_key_len(prefix)?;
    let digits = crate::key6::to_key6(prefix);
    let c = crate::cursor::last_with_prefix(r, root, &digits)?;
    read_cursor(r, &c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap;
    use alloc::vec;
    use core::cell::RefCell;

    /// A trivial in-memory `Writer` for exercising the trie algorithms
    /// without any segment allocator underneath: ids are just incrementing
    /// counters and refcounts live in a side table.
    struct MemWriter {
        inner: BTreeMap<u64, InnerNode>,
        values: BTreeMap<u64, ValueNode>,
        refcounts: BTreeMap<u64, u32>,
        next_id: RefCell<u64>,
    }

    impl MemWriter {
        fn new() -> Self {
            Self {
                inner: BTreeMap::new(),
                values: BTreeMap::new(),
                refcounts: BTreeMap::new(),
                next_id: RefCell::new(1),
            }
        }

        fn fresh_id(&self) -> ObjectId {
            let mut n = self.next_id.borrow_mut();
            let id = ObjectId::new(*n);
            *n += 1;
            id
        }
    }

    impl Resolver for MemWriter {
        fn resolve_inner(&self, id: ObjectId) -> Result<InnerNode, Error> {
            self.inner.get(&id.get()).cloned().ok_or(Error::DataCorruption)
        }
        fn resolve_value(&self, id: ObjectId) -> Result<ValueNode, Error> {
            self.values.get(&id.get()).cloned().ok_or(Error::DataCorruption)
        }
        fn node_type(&self, id: ObjectId) -> Result<NodeType, Error> {
            if self.inner.contains_key(&id.get()) {
                Ok(NodeType::Inner)
            } else {
                match self.values.get(&id.get()) {
                    Some(v) => Ok(match v.payload {
                        ValuePayload::Bytes(_) => NodeType::ValueBytes,
                        ValuePayload::Roots(_) => NodeType::ValueRoots,
                    }),
                    None => Err(Error::DataCorruption),
                }
            }
        }
    }

    impl Writer for MemWriter {
        fn is_unique(&self, id: ObjectId) -> bool {
            self.refcounts.get(&id.get()).copied().unwrap_or(1) == 1
        }
        fn alloc_inner(&mut self, node: &InnerNode) -> Result<ObjectId, Error> {
            let id = self.fresh_id();
            self.inner.insert(id.get(), node.clone());
            self.refcounts.insert(id.get(), 1);
            Ok(id)
        }
        fn alloc_value(&mut self, node: &ValueNode) -> Result<ObjectId, Error> {
            let id = self.fresh_id();
            self.values.insert(id.get(), node.clone());
            self.refcounts.insert(id.get(), 1);
            Ok(id)
        }
        fn edit_inner(&mut self, id: ObjectId, node: &InnerNode) -> Result<(), Error> {
            self.inner.insert(id.get(), node.clone());
            Ok(())
        }
        fn edit_value(&mut self, id: ObjectId, node: &ValueNode) -> Result<(), Error> {
            self.values.insert(id.get(), node.clone());
            Ok(())
        }
        fn retain(&mut self, id: ObjectId) -> Result<ObjectId, Error> {
            if id.is_null() {
                return Ok(id);
            }
            *self.refcounts.entry(id.get()).or_insert(1) += 1;
            Ok(id)
        }
        fn release(&mut self, id: ObjectId) -> Result<(), Error> {
            if id.is_null() {
                return Ok(());
            }
            let count = self.refcounts.entry(id.get()).or_insert(1);
            *count -= 1;
            if *count == 0 {
                if let Some(inn) = self.inner.remove(&id.get()) {
                    if !inn.value.is_null() {
                        self.release(inn.value)?;
                    }
                    for child in inn.children().to_vec() {
                        self.release(child)?;
                    }
                } else {
                    self.values.remove(&id.get());
                }
                self.refcounts.remove(&id.get());
            }
            Ok(())
        }
    }

    #[test]
    fn insert_then_lookup_roundtrips() {
        let mut w = MemWriter::new();
        let mut root = ObjectId::NULL;
        for (k, v) in [("apple", "1"), ("apricot", "2"), ("banana", "3")] {
            let (new_root, _) =
                insert(&mut w, root, true, k.as_bytes(), ValuePayload::Bytes(v.as_bytes().to_vec())).unwrap();
            root = new_root;
        }
        for (k, v) in [("apple", "1"), ("apricot", "2"), ("banana", "3")] {
            let got = lookup(&w, root, k.as_bytes()).unwrap();
            assert_eq!(got, Some(ValuePayload::Bytes(v.as_bytes().to_vec())));
        }
        assert_eq!(lookup(&w, root, b"missing").unwrap(), None);
    }

    #[test]
    fn overwrite_replaces_value_and_reports_old_size() {
        let mut w = MemWriter::new();
        let (root, _) = insert(&mut w, ObjectId::NULL, true, b"k", ValuePayload::Bytes(vec![1, 2, 3])).unwrap();
        let (root, old) = insert(&mut w, root, true, b"k", ValuePayload::Bytes(vec![9])).unwrap();
        assert_eq!(old, Some(3));
        assert_eq!(lookup(&w, root, b"k").unwrap(), Some(ValuePayload::Bytes(vec![9])));
    }

    #[test]
    fn delete_collapses_single_child() {
        let mut w = MemWriter::new();
        let mut root = ObjectId::NULL;
        for k in ["apple", "apricot"] {
            let (new_root, _) =
                insert(&mut w, root, true, k.as_bytes(), ValuePayload::Bytes(vec![1])).unwrap();
            root = new_root;
        }
        let (root, old) = remove(&mut w, root, true, b"apple").unwrap();
        assert_eq!(old, Some(1));
        assert_eq!(lookup(&w, root, b"apple").unwrap(), None);
        assert_eq!(lookup(&w, root, b"apricot").unwrap(), Some(ValuePayload::Bytes(vec![1])));
        // With only one key left, the root should have collapsed down to a
        // plain value leaf rather than a degenerate single-child inner node.
        assert_eq!(w.node_type(root).unwrap(), NodeType::ValueBytes);
    }

    #[test]
    fn delete_everything_empties_the_tree() {
        let mut w = MemWriter::new();
        let (root, _) = insert(&mut w, ObjectId::NULL, true, b"only", ValuePayload::Bytes(vec![7])).unwrap();
        let (root, old) = remove(&mut w, root, true, b"only").unwrap();
        assert_eq!(old, Some(1));
        assert!(root.is_null());
    }

    #[test]
    fn shared_subtree_is_not_mutated_by_unique_insert_on_the_other_owner() {
        let mut w = MemWriter::new();
        let (root_a, _) = insert(&mut w, ObjectId::NULL, true, b"x", ValuePayload::Bytes(vec![1])).unwrap();
        let root_b = w.retain(root_a).unwrap();
        let (root_a2, _) = insert(&mut w, root_a, true, b"y", ValuePayload::Bytes(vec![2])).unwrap();
        assert_eq!(lookup(&w, root_b, b"y").unwrap(), None);
        assert_eq!(lookup(&w, root_a2, b"y").unwrap(), Some(ValuePayload::Bytes(vec![2])));
        assert_eq!(lookup(&w, root_b, b"x").unwrap(), Some(ValuePayload::Bytes(vec![1])));
    }

    #[test]
    fn get_greater_equal_and_less_than() {
        let mut w = MemWriter::new();
        let mut root = ObjectId::NULL;
        for k in ["aa", "cc", "ee"] {
            let (new_root, _) = insert(&mut w, root, true, k.as_bytes(), ValuePayload::Bytes(vec![])).unwrap();
            root = new_root;
        }
        let (k, _) = get_greater_equal(&w, root, b"bb").unwrap().unwrap();
        assert_eq!(k, b"cc");
        let (k, _) = get_greater_equal(&w, root, b"cc").unwrap().unwrap();
        assert_eq!(k, b"cc");
        let (k, _) = get_less_than(&w, root, b"cc").unwrap().unwrap();
        assert_eq!(k, b"aa");
        assert!(get_greater_equal(&w, root, b"zz").unwrap().is_none());
        assert!(get_less_than(&w, root, b"aa").unwrap().is_none());
    }

    #[test]
    fn get_max_in_prefix_finds_the_greatest_match() {
        let mut w = MemWriter::new();
        let mut root = ObjectId::NULL;
        for k in ["app", "apple", "application", "banana"] {
            let (new_root, _) = insert(&mut w, root, true, k.as_bytes(), ValuePayload::Bytes(vec![])).unwrap();
            root = new_root;
        }
        let (k, _) = get_max_in_prefix(&w, root, b"app").unwrap().unwrap();
        assert_eq!(k, b"application");
        assert!(get_max_in_prefix(&w, root, b"zzz").unwrap().is_none());
    }
}
