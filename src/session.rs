//! Reader/writer registration and the epoch counter that gates physical
//! reclamation, without stopping readers.
//!
//! Grounded in the teacher's `IdTracker` (`src/lib.rs`): a monotonic
//! "newest" tick, a per-checkout record, and an "oldest still checked out"
//! watermark recomputed on checkin. The teacher tracks transaction ids for
//! a single B-tree root; here the same shape tracks ages for arbitrarily
//! many concurrent reader sessions plus a single writer.

use std::sync::Mutex;

use crate::error::Error;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SessionKind {
    Reader,
    Writer,
}

/// Opaque handle naming a row in the session table.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SessionId(u64);

struct Slot {
    id: u64,
    kind: SessionKind,
    /// `None` means the session is between critical regions and does not
    /// hold back reclamation.
    age: Option<u64>,
}

struct Inner {
    tick: u64,
    next_id: u64,
    writer_active: bool,
    slots: Vec<Slot>,
}

pub struct SessionTable {
    inner: Mutex<Inner>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                tick: 1,
                next_id: 1,
                writer_active: false,
                slots: Vec::new(),
            }),
        }
    }

    pub fn attach(&self, kind: SessionKind) -> Result<SessionId, Error> {
        let mut inner = self.inner.lock().unwrap();
        if kind == SessionKind::Writer && inner.writer_active {
            return Err(Error::WriterBusy);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        if kind == SessionKind::Writer {
            inner.writer_active = true;
        }
        inner.slots.push(Slot { id, kind, age: None });
        Ok(SessionId(id))
    }

    pub fn detach(&self, session: SessionId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) = inner.slots.iter().position(|s| s.id == session.0) {
            let slot = inner.slots.swap_remove(pos);
            if slot.kind == SessionKind::Writer {
                inner.writer_active = false;
            }
        }
    }

    /// Stamp this session's age to the current tick (advancing the tick),
    /// marking it as "live" for the duration of a query or mutation.
    pub fn enter(&self, session: SessionId) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let tick = inner.tick;
        if let Some(slot) = inner.slots.iter_mut().find(|s| s.id == session.0) {
            slot.age = Some(tick);
        }
        tick
    }

    /// Relax this session back to "not live".
    pub fn exit(&self, session: SessionId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.slots.iter_mut().find(|s| s.id == session.0) {
            slot.age = None;
        }
    }

    /// Current global tick, without stamping any session.
    pub fn current_tick(&self) -> u64 {
        self.inner.lock().unwrap().tick
    }

    /// The minimum age among currently-live sessions, or the current tick
    /// if none are live (meaning nothing holds back reclamation).
    pub fn min_live_age(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner
            .slots
            .iter()
            .filter_map(|s| s.age)
            .min()
            .unwrap_or(inner.tick)
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_busy_is_rejected_while_one_is_active() {
        let table = SessionTable::new();
        let w1 = table.attach(SessionKind::Writer).unwrap();
        assert!(matches!(table.attach(SessionKind::Writer), Err(Error::WriterBusy)));
        table.detach(w1);
        assert!(table.attach(SessionKind::Writer).is_ok());
    }

    #[test]
    fn min_live_age_ignores_exited_sessions() {
        let table = SessionTable::new();
        let r1 = table.attach(SessionKind::Reader).unwrap();
        let r2 = table.attach(SessionKind::Reader).unwrap();
        let age1 = table.enter(r1);
        let _age2 = table.enter(r2);
        assert_eq!(table.min_live_age(), age1);
        table.exit(r1);
        assert!(table.min_live_age() > age1);
    }

    #[test]
    fn no_live_sessions_means_nothing_holds_back_reclamation() {
        let table = SessionTable::new();
        let r1 = table.attach(SessionKind::Reader).unwrap();
        table.enter(r1);
        table.exit(r1);
        assert_eq!(table.min_live_age(), table.current_tick());
    }
}
