//! Cursors onto nodes, and the table that hands them out.
//!
//! Each open node has one [`Kcb`] no matter how many times it was opened; the table counts the
//! opens and drops the cursor on the last close. A cursor's lock is taken shared for reads. Work
//! that has to fill the value cache or rewrite cells takes it exclusive, either directly or by
//! running the operation again through [`Kcb::run`].

mod cache;

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace};

use crate::{
    cell::CellIndex,
    error::{HiveError, HiveResult},
    hive::{Hive, HiveId},
};

pub(crate) use cache::{LoadedValue, ValueCache};

/// Handle to an open cursor.
///
/// Ids are generation-checked: once a cursor is closed for the last time, any copy of its id
/// stops resolving, even if the slot is handed to a new cursor later.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KcbId {
    index: u32,
    generation: u32,
}

impl fmt::Display for KcbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kcb#{}.{}", self.index, self.generation)
    }
}

/// Outcome of a lookup that may only be able to finish with the exclusive lock.
#[derive(Debug)]
pub(crate) enum CacheLookup<T> {
    Found(T),
    NotFound,
    NeedExclusive,
}

/// Lock state guarded by a cursor's lock.
#[derive(Default)]
pub(crate) struct KcbState {
    pub deleted: bool,
    pub values: ValueCache,
    /// Cursor whose values this one resolves to, set through a symbolic link
    pub link: Option<(KcbId, Arc<Kcb>)>,
    /// A link was found and the value cache hasn't been switched over to it yet
    pub link_found: bool,
}

/// The lock a cursor operation is currently running under.
pub(crate) enum Access<'a> {
    Shared(RwLockReadGuard<'a, KcbState>),
    Exclusive(RwLockWriteGuard<'a, KcbState>),
}

impl Access<'_> {
    pub fn state(&self) -> &KcbState {
        match self {
            Access::Shared(s) => s,
            Access::Exclusive(s) => s,
        }
    }

    /// The state, if the lock is held exclusive.
    pub fn state_mut(&mut self) -> Option<&mut KcbState> {
        match self {
            Access::Shared(_) => None,
            Access::Exclusive(s) => Some(s),
        }
    }

    /// Fail with [`HiveError::Deleted`] if the node is gone.
    pub fn live(&self) -> HiveResult<()> {
        if self.state().deleted {
            Err(HiveError::Deleted)
        } else {
            Ok(())
        }
    }
}

/// A cursor (key control block): an open node in some hive.
pub(crate) struct Kcb {
    id: KcbId,
    hive: Arc<Hive>,
    cell: AtomicU32,
    pub state: RwLock<KcbState>,
}

impl Kcb {
    pub fn id(&self) -> KcbId {
        self.id
    }

    pub fn hive(&self) -> &Arc<Hive> {
        &self.hive
    }

    /// The node's cell. Only changes under the exclusive cursor lock.
    pub fn cell(&self) -> CellIndex {
        CellIndex::from_raw(self.cell.load(Ordering::Acquire))
    }

    pub fn set_cell(&self, cell: CellIndex) {
        self.cell.store(cell.raw(), Ordering::Release);
    }

    /// Run `op` under the shared lock, and once more under the exclusive lock if it asks for it.
    ///
    /// The exclusive pass can always finish: holding the lock exclusive lets `op` rebuild
    /// whatever it was missing.
    pub fn run<T>(
        &self,
        mut op: impl FnMut(&mut Access<'_>) -> HiveResult<CacheLookup<T>>,
    ) -> HiveResult<T> {
        {
            let mut access = Access::Shared(self.state.read());
            match op(&mut access)? {
                CacheLookup::Found(t) => return Ok(t),
                CacheLookup::NotFound => return Err(HiveError::NotFound),
                CacheLookup::NeedExclusive => {}
            }
        }
        trace!("{} needs its lock exclusive; retrying", self.id);
        let mut access = Access::Exclusive(self.state.write());
        match op(&mut access)? {
            CacheLookup::Found(t) => Ok(t),
            CacheLookup::NotFound => Err(HiveError::NotFound),
            CacheLookup::NeedExclusive => {
                debug_assert!(false, "operation on {} asked to upgrade twice", self.id);
                Err(HiveError::InvalidParameter("cursor lock upgrade didn't settle"))
            }
        }
    }

    /// Run `op` under the exclusive lock.
    pub fn write<T>(&self, op: impl FnOnce(&mut KcbState) -> HiveResult<T>) -> HiveResult<T> {
        let mut state = self.state.write();
        if state.deleted {
            return Err(HiveError::Deleted);
        }
        op(&mut state)
    }

    /// The cursor value operations should act on: the link target if there is one.
    ///
    /// A freshly found link drops this cursor's value cache first, so nothing cached from
    /// before the link can be served through it.
    pub fn value_kcb(self: &Arc<Self>) -> HiveResult<Arc<Kcb>> {
        {
            let state = self.state.read();
            if state.deleted {
                return Err(HiveError::Deleted);
            }
            if !state.link_found {
                return Ok(state.link.as_ref().map_or_else(|| self.clone(), |l| l.1.clone()));
            }
        }
        let mut state = self.state.write();
        if state.link_found {
            state.values.invalidate();
            state.link_found = false;
            debug!("{} now resolves values through its link", self.id);
        }
        Ok(state.link.as_ref().map_or_else(|| self.clone(), |l| l.1.clone()))
    }
}

impl fmt::Debug for Kcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kcb")
            .field("id", &self.id)
            .field("hive", &self.hive.id())
            .field("cell", &self.cell())
            .finish_non_exhaustive()
    }
}

struct Slot {
    generation: u32,
    open: Option<(Arc<Kcb>, usize)>,
}

/// Every open cursor, indexed by id and by the node it points at.
#[derive(Default)]
pub(crate) struct CursorTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_cell: HashMap<(HiveId, CellIndex), u32>,
}

impl CursorTable {
    pub fn get(&self, id: KcbId) -> HiveResult<Arc<Kcb>> {
        match self.slots.get(id.index as usize) {
            Some(Slot {
                generation,
                open: Some((kcb, _)),
            }) if *generation == id.generation => Ok(kcb.clone()),
            _ => Err(HiveError::Deleted),
        }
    }

    /// Open a cursor on `cell`, sharing the existing one if the node is already open.
    pub fn open(&mut self, hive: &Arc<Hive>, cell: CellIndex) -> Arc<Kcb> {
        let key = (hive.id(), cell);
        if let Some(&index) = self.by_cell.get(&key) {
            if let Some((kcb, refs)) = self.slots[index as usize].open.as_mut() {
                *refs += 1;
                return kcb.clone();
            }
        }
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    open: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let kcb = Arc::new(Kcb {
            id: KcbId {
                index,
                generation: slot.generation,
            },
            hive: hive.clone(),
            cell: AtomicU32::new(cell.raw()),
            state: RwLock::new(KcbState::default()),
        });
        slot.open = Some((kcb.clone(), 1));
        self.by_cell.insert(key, index);
        trace!("Opened {} on {:?} in {}", kcb.id, cell, hive.id());
        kcb
    }

    /// Drop one reference. Returns the cursor once the last one is gone.
    pub fn close(&mut self, id: KcbId) -> HiveResult<Option<Arc<Kcb>>> {
        self.get(id)?;
        let slot = &mut self.slots[id.index as usize];
        let Some((_, refs)) = slot.open.as_mut() else {
            return Err(HiveError::Deleted);
        };
        *refs -= 1;
        if *refs > 0 {
            return Ok(None);
        }
        let Some((kcb, _)) = slot.open.take() else {
            return Err(HiveError::Deleted);
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        let key = (kcb.hive.id(), kcb.cell());
        if self.by_cell.get(&key) == Some(&id.index) {
            self.by_cell.remove(&key);
        }
        trace!("Closed {}", id);
        Ok(Some(kcb))
    }

    /// Follow a cursor's node to a new cell.
    pub fn rekey(&mut self, kcb: &Kcb, old: CellIndex) {
        let hive = kcb.hive.id();
        if self.by_cell.get(&(hive, old)) == Some(&kcb.id.index) {
            self.by_cell.remove(&(hive, old));
        }
        self.by_cell.insert((hive, kcb.cell()), kcb.id.index);
    }

    /// Stop handing out `kcb` for its node, which has been deleted.
    pub fn forget(&mut self, kcb: &Kcb) {
        let key = (kcb.hive.id(), kcb.cell());
        if self.by_cell.get(&key) == Some(&kcb.id.index) {
            self.by_cell.remove(&key);
        }
    }

    /// Open cursors on a hive.
    pub fn of_hive(&self, hive: HiveId) -> Vec<Arc<Kcb>> {
        self.slots
            .iter()
            .filter_map(|s| s.open.as_ref())
            .filter(|(kcb, _)| kcb.hive.id() == hive)
            .map(|(kcb, _)| kcb.clone())
            .collect()
    }

    pub fn open_count(&self, hive: HiveId) -> usize {
        self.slots
            .iter()
            .filter_map(|s| s.open.as_ref())
            .filter(|(kcb, _)| kcb.hive.id() == hive)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::config::HiveOptions;

    fn hive(id: u32) -> Arc<Hive> {
        Arc::new(Hive::create(HiveId::new(id), &HiveOptions::default(), None, None).unwrap())
    }

    #[test]
    fn opens_are_shared_and_counted() {
        let h = hive(1);
        let root = h.root();
        let mut table = CursorTable::default();
        let a = table.open(&h, root);
        let b = table.open(&h, root);
        assert_eq!(a.id(), b.id());
        assert_eq!(table.open_count(h.id()), 1);

        assert!(table.close(a.id()).unwrap().is_none());
        let last = table.close(a.id()).unwrap().unwrap();
        assert_eq!(last.id(), a.id());
        assert!(matches!(table.get(a.id()), Err(HiveError::Deleted)));
        assert!(matches!(table.close(a.id()), Err(HiveError::Deleted)));

        // The slot comes back with a new generation
        let c = table.open(&h, root);
        assert_ne!(c.id(), a.id());
        println!("{} then {}", a.id(), c.id());
        assert_eq!(table.of_hive(h.id()).len(), 1);
        assert_eq!(table.open_count(HiveId::new(2)), 0);
    }

    #[test]
    fn rekey_and_forget() {
        let h = hive(1);
        let mut table = CursorTable::default();
        let a = table.open(&h, h.root());
        let moved = CellIndex::from_raw(0x400);
        a.set_cell(moved);
        table.rekey(&a, h.root());
        assert_eq!(table.open(&h, moved).id(), a.id());
        assert_ne!(table.open(&h, h.root()).id(), a.id());

        table.forget(&a);
        let fresh = table.open(&h, moved);
        assert_ne!(fresh.id(), a.id());
        // a is still reachable through its id until closed
        assert!(table.get(a.id()).is_ok());
    }

    #[test]
    fn run_upgrades_once() {
        let h = hive(1);
        let mut table = CursorTable::default();
        let kcb = table.open(&h, h.root());
        let passes = Cell::new(0);
        let out = kcb
            .run(|access| {
                passes.set(passes.get() + 1);
                match access.state_mut() {
                    None => Ok(CacheLookup::NeedExclusive),
                    Some(_) => Ok(CacheLookup::Found(7)),
                }
            })
            .unwrap();
        assert_eq!(out, 7);
        assert_eq!(passes.get(), 2);

        let missing = kcb.run(|_| Ok(CacheLookup::<()>::NotFound));
        assert!(matches!(missing, Err(HiveError::NotFound)));

        kcb.state.write().deleted = true;
        assert!(matches!(kcb.run(|a| a.live().map(|_| CacheLookup::Found(()))), Err(HiveError::Deleted)));
        assert!(matches!(kcb.value_kcb(), Err(HiveError::Deleted)));
    }

    #[test]
    fn links_redirect_values() {
        let h = hive(1);
        let mut table = CursorTable::default();
        let a = table.open(&h, h.root());
        let b = table.open(&h, CellIndex::from_raw(0x400));
        assert!(Arc::ptr_eq(&a.value_kcb().unwrap(), &a));
        {
            let mut state = a.state.write();
            state.link = Some((b.id(), b.clone()));
            state.link_found = true;
        }
        assert!(Arc::ptr_eq(&a.value_kcb().unwrap(), &b));
        assert!(!a.state.read().link_found);
    }
}
