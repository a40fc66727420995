//! The single top-root cell: an atomic word naming the currently
//! committed snapshot, plus the mutex that serializes publication against
//! concurrent readers retaining it.
//!
//! Grounded in the teacher's `RootData`/`DbCore` (`src/lib.rs`): a
//! `Mutex`-guarded piece of shared state that every reader consults on
//! attach and every writer updates on commit. The teacher's version caches
//! a whole B-tree root page under the lock; this one caches a single
//! 40-bit object-id, since the "root page" here is just a node in the
//! segment arena like any other.

use std::sync::Mutex;

use crab_node::ObjectId;

use crate::error::Error;
use crate::object_index::ObjectIndex;

pub struct RootManager {
    top: Mutex<ObjectId>,
}

impl RootManager {
    pub fn new(initial: ObjectId) -> Self {
        Self {
            top: Mutex::new(initial),
        }
    }

    /// Atomically read the cell and retain the id once on the caller's
    /// behalf; the returned id is owned and must eventually be released.
    pub fn get(&self, index: &ObjectIndex) -> Result<ObjectId, Error> {
        let top = self.top.lock().unwrap();
        if !top.is_null() {
            index.retain(*top)?;
        }
        Ok(*top)
    }

    /// Retain `new_root`, install it as the top root, and release the
    /// previous occupant — all under the same lock, so no reader's
    /// `get` can observe a cell whose retain and this release have raced.
    pub fn set(&self, index: &ObjectIndex, new_root: ObjectId) -> Result<(), Error> {
        let mut top = self.top.lock().unwrap();
        if !new_root.is_null() {
            index.retain(new_root)?;
        }
        let old = *top;
        *top = new_root;
        drop(top);
        if !old.is_null() {
            index.release(old)?;
        }
        Ok(())
    }

    /// Current value without touching any refcount; used when persisting
    /// the header and by recovery.
    pub fn peek(&self) -> ObjectId {
        *self.top.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Tier;
    use crate::segment::RecordType;
    use std::sync::atomic::AtomicU64;

    unsafe fn index(v: &Vec<AtomicU64>) -> ObjectIndex {
        let slice: &'static [AtomicU64] = std::mem::transmute(v.as_slice());
        ObjectIndex::new(slice)
    }

    #[test]
    fn get_retains_and_set_releases_previous() {
        let storage: Vec<AtomicU64> = (0..4).map(|_| AtomicU64::new(0)).collect();
        let idx = unsafe { index(&storage) };
        idx.install(ObjectId::new(1), 0, 0, RecordType::Inner, Tier::Hot).unwrap();
        idx.install(ObjectId::new(2), 0, 100, RecordType::Inner, Tier::Hot).unwrap();

        let mgr = RootManager::new(ObjectId::new(1));
        let got = mgr.get(&idx).unwrap();
        assert_eq!(got, ObjectId::new(1));
        assert_eq!(idx.lookup(ObjectId::new(1)).unwrap().refcount, 2);

        mgr.set(&idx, ObjectId::new(2)).unwrap();
        assert_eq!(idx.lookup(ObjectId::new(2)).unwrap().refcount, 2);
        assert_eq!(idx.lookup(ObjectId::new(1)).unwrap().refcount, 1);
    }
}
