//! The registry: every loaded hive, every open cursor, and the operations on them.

use std::{
    collections::HashMap,
    ffi::OsString,
    fmt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    backend::{FileBackend, StorageBackend},
    alloc::CellSpace,
    buffer::{self, copy_out, MultiValueWriter, NodeInfoClass, ValueEntry, ValueInfoClass},
    cell::{CellIndex, StorageType},
    config::HiveOptions,
    error::{HiveError, HiveResult},
    hive::{Hive, HiveId},
    kcb::{CacheLookup, CursorTable, Kcb, KcbId, LoadedValue},
    now_timestamp,
    tree::{self, validate_name, validate_value_name},
    value::ValueType,
};

/// What changed, as reported to a [`NotifySink`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    ValueSet,
    ValueDeleted,
    NodeCreated,
    NodeDeleted,
    Renamed,
    Moved,
    LastWriteSet,
    UserFlagsSet,
    Compressed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    /// The cursor the change went through; `None` for whole-hive changes
    pub kcb: Option<KcbId>,
    pub hive: HiveId,
    pub cell: CellIndex,
    pub kind: ChangeKind,
}

/// Receives a callback for every successful mutation, before the mutating call returns.
pub trait NotifySink: Send + Sync {
    fn notify(&self, event: &ChangeEvent);
}

impl<F> NotifySink for F
where
    F: Fn(&ChangeEvent) + Send + Sync,
{
    fn notify(&self, event: &ChangeEvent) {
        self(event)
    }
}

/// Operations that consult the [`AccessCheck`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessOp {
    Rename,
    Move,
}

/// Decides whether a rename or move may go ahead. Asked before anything is touched.
pub trait AccessCheck: Send + Sync {
    fn allowed(&self, kcb: KcbId, op: AccessOp) -> bool;
}

/// Allows everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl AccessCheck for AllowAll {
    fn allowed(&self, _kcb: KcbId, _op: AccessOp) -> bool {
        true
    }
}

/// Result of loading a hive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadedHive {
    pub id: HiveId,
    /// Loading had to patch damage; some data may have been lost
    pub self_healed: bool,
}

/// Result of [`Registry::unload_hive_late`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnloadState {
    Done,
    /// Cursors are still open; the hive unloads when the last one closes
    Pending,
}

struct HiveEntry {
    hive: Arc<Hive>,
    unloading: bool,
}

/// Owns loaded hives and the cursors open on them.
///
/// Lock order, outermost first: the hive list, a hive's flusher lock, cursor locks, the hive
/// store, and the cursor table. The hive list is never held while waiting on a flusher lock.
pub struct Registry {
    hives: Mutex<HashMap<HiveId, HiveEntry>>,
    next_hive: AtomicU32,
    cursors: Mutex<CursorTable>,
    notify: Option<Arc<dyn NotifySink>>,
    access: Arc<dyn AccessCheck>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut hives: Vec<HiveId> = self.hives.lock().keys().copied().collect();
        hives.sort();
        f.debug_struct("Registry")
            .field("hives", &hives)
            .finish_non_exhaustive()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            hives: Mutex::new(HashMap::new()),
            next_hive: AtomicU32::new(1),
            cursors: Mutex::new(CursorTable::default()),
            notify: None,
            access: Arc::new(AllowAll),
        }
    }

    pub fn with_notify(mut self, sink: Arc<dyn NotifySink>) -> Self {
        self.notify = Some(sink);
        self
    }

    pub fn with_access_check(mut self, check: Arc<dyn AccessCheck>) -> Self {
        self.access = check;
        self
    }

    fn add_hive(&self, hive: Hive) -> HiveId {
        let id = hive.id();
        self.hives.lock().insert(
            id,
            HiveEntry {
                hive: Arc::new(hive),
                unloading: false,
            },
        );
        id
    }

    fn new_hive_id(&self) -> HiveId {
        HiveId::new(self.next_hive.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a new, empty hive. Without a primary it lives only in memory.
    pub fn create_hive(
        &self,
        options: &HiveOptions,
        primary: Option<Box<dyn StorageBackend>>,
        log: Option<Box<dyn StorageBackend>>,
    ) -> HiveResult<HiveId> {
        let hive = Hive::create(self.new_hive_id(), options, primary, log)?;
        Ok(self.add_hive(hive))
    }

    /// Load a hive, replaying its log if the last flush didn't finish.
    pub fn load_hive(
        &self,
        options: &HiveOptions,
        primary: Box<dyn StorageBackend>,
        log: Option<Box<dyn StorageBackend>>,
    ) -> HiveResult<LoadedHive> {
        let hive = Hive::load(self.new_hive_id(), options, primary, log)?;
        let self_healed = hive.is_self_healed();
        if self_healed {
            warn!("{} was damaged and has been self-healed", hive.id());
        }
        Ok(LoadedHive {
            id: self.add_hive(hive),
            self_healed,
        })
    }

    /// Open the hive file at `path`, with its log next to it at `path.LOG`. An empty or missing
    /// file gets a new hive.
    pub fn open_hive<P: AsRef<Path>>(&self, path: P, options: &HiveOptions) -> HiveResult<LoadedHive> {
        let path = path.as_ref();
        let mut log_path = OsString::from(path.as_os_str());
        log_path.push(".LOG");
        let mut primary = FileBackend::open(path, true)?;
        let log = FileBackend::open(PathBuf::from(log_path), true)?;
        if primary.len().map_err(HiveError::Io)? == 0 {
            let id = self.create_hive(options, Some(Box::new(primary)), Some(Box::new(log)))?;
            info!("Created {} at {}", id, path.display());
            return Ok(LoadedHive {
                id,
                self_healed: false,
            });
        }
        let loaded = self.load_hive(options, Box::new(primary), Some(Box::new(log)))?;
        info!("Loaded {} from {}", loaded.id, path.display());
        Ok(loaded)
    }

    pub fn hive(&self, id: HiveId) -> HiveResult<Arc<Hive>> {
        self.hives
            .lock()
            .get(&id)
            .map(|e| e.hive.clone())
            .ok_or(HiveError::NotFound)
    }

    pub fn flush_hive(&self, id: HiveId) -> HiveResult<()> {
        self.hive(id)?.flush()
    }

    /// Flush every hive. All hives are attempted; the first error is returned.
    pub fn flush_all(&self) -> HiveResult<()> {
        let hives: Vec<Arc<Hive>> = self.hives.lock().values().map(|e| e.hive.clone()).collect();
        let mut result = Ok(());
        for hive in hives {
            if let Err(e) = hive.flush() {
                warn!("Flushing {} failed: {}", hive.id(), e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Flush and unload a hive. Fails with [`HiveError::CannotDelete`] while cursors are open.
    pub fn unload_hive(&self, id: HiveId) -> HiveResult<()> {
        let hive = {
            let mut hives = self.hives.lock();
            let entry = hives.get_mut(&id).ok_or(HiveError::NotFound)?;
            if entry.unloading || self.cursors.lock().open_count(id) > 0 {
                return Err(HiveError::CannotDelete);
            }
            entry.unloading = true;
            entry.hive.clone()
        };
        self.finish_unload(&hive)
    }

    /// Unload a hive now if nothing has it open, or else once its last cursor closes.
    pub fn unload_hive_late(&self, id: HiveId) -> HiveResult<UnloadState> {
        let hive = {
            let mut hives = self.hives.lock();
            let entry = hives.get_mut(&id).ok_or(HiveError::NotFound)?;
            if entry.unloading {
                return Ok(UnloadState::Pending);
            }
            entry.unloading = true;
            let open = self.cursors.lock().open_count(id);
            if open > 0 {
                debug!("{} unloads once {} cursors close", id, open);
                return Ok(UnloadState::Pending);
            }
            entry.hive.clone()
        };
        self.finish_unload(&hive)?;
        Ok(UnloadState::Done)
    }

    /// Flush a hive marked as unloading and drop it. On failure it stays loaded.
    fn finish_unload(&self, hive: &Arc<Hive>) -> HiveResult<()> {
        let id = hive.id();
        if let Err(e) = hive.flush() {
            if let Some(entry) = self.hives.lock().get_mut(&id) {
                entry.unloading = false;
            }
            return Err(e);
        }
        self.hives.lock().remove(&id);
        info!("Unloaded {}", id);
        Ok(())
    }

    fn cursor(&self, id: KcbId) -> HiveResult<Arc<Kcb>> {
        self.cursors.lock().get(id)
    }

    /// Open a cursor, unless the hive is on its way out.
    fn open_cursor(&self, hive: &Arc<Hive>, cell: CellIndex) -> HiveResult<Arc<Kcb>> {
        let hives = self.hives.lock();
        match hives.get(&hive.id()) {
            Some(entry) if !entry.unloading => Ok(self.cursors.lock().open(hive, cell)),
            _ => Err(HiveError::Deleted),
        }
    }

    fn notify(&self, kcb: Option<KcbId>, hive: HiveId, cell: CellIndex, kind: ChangeKind) {
        if let Some(sink) = &self.notify {
            sink.notify(&ChangeEvent {
                kcb,
                hive,
                cell,
                kind,
            });
        }
    }

    /// Open a cursor on a hive's root node.
    pub fn open_root(&self, hive: HiveId) -> HiveResult<KcbId> {
        let hive = self.hive(hive)?;
        let _flusher = hive.flusher.read();
        let root = hive.root();
        Ok(self.open_cursor(&hive, root)?.id())
    }

    /// Open a cursor on the node at a backslash-separated `path` below `from`.
    pub fn open_node(&self, from: KcbId, path: &str) -> HiveResult<KcbId> {
        let from = self.cursor(from)?;
        let hive = from.hive().clone();
        let _flusher = hive.flusher.read();
        let cell = from.run(|access| {
            access.live()?;
            let mut store = hive.store.lock();
            tree::open_path(&mut store.space, from.cell(), path).map(CacheLookup::Found)
        })?;
        Ok(self.open_cursor(&hive, cell)?.id())
    }

    /// Drop a cursor reference. When the last reference to a node goes, so does its cursor, and
    /// a pending unload of its hive may complete.
    pub fn close(&self, id: KcbId) -> HiveResult<()> {
        let Some(kcb) = self.cursors.lock().close(id)? else {
            return Ok(());
        };
        let link = kcb.state.write().link.take();
        if let Some((target, _)) = link {
            self.close(target)?;
        }
        let hive = kcb.hive().id();
        let pending = {
            let hives = self.hives.lock();
            match hives.get(&hive) {
                Some(entry) if entry.unloading && self.cursors.lock().open_count(hive) == 0 => {
                    Some(entry.hive.clone())
                }
                _ => None,
            }
        };
        if let Some(hive) = pending {
            if let Err(e) = self.finish_unload(&hive) {
                warn!("Deferred unload of {} failed: {}", hive.id(), e);
                // Still wanted gone; the next close or unload tries again
                if let Some(entry) = self.hives.lock().get_mut(&hive.id()) {
                    entry.unloading = true;
                }
            }
        }
        Ok(())
    }

    /// Resolve the values of `kcb` through `target` from now on.
    pub fn link_cursor(&self, id: KcbId, target: KcbId) -> HiveResult<()> {
        if id == target {
            return Err(HiveError::InvalidParameter("a cursor can't link to itself"));
        }
        let kcb = self.cursor(id)?;
        let target = self.cursor(target)?;
        if target.state.read().deleted {
            return Err(HiveError::Deleted);
        }
        // The link holds its own reference to the target
        let target = self.open_cursor(target.hive(), target.cell())?;
        let old = {
            let mut state = kcb.state.write();
            if state.deleted {
                drop(state);
                self.close(target.id())?;
                return Err(HiveError::Deleted);
            }
            state.link_found = true;
            state.link.replace((target.id(), target.clone()))
        };
        if let Some((old, _)) = old {
            self.close(old)?;
        }
        debug!("{} links to {}", id, target.id());
        Ok(())
    }

    /// Create a child node and open a cursor on it.
    pub fn create_node(
        &self,
        parent: KcbId,
        name: &str,
        area: StorageType,
        class: &[u8],
    ) -> HiveResult<KcbId> {
        validate_name(name)?;
        let parent = self.cursor(parent)?;
        let hive = parent.hive().clone();
        let _flusher = hive.flusher.read();
        let cell = parent.write(|_| {
            let mut store = hive.store.lock();
            tree::create_node(&mut store.space, parent.cell(), name, area, class, now_timestamp())
        })?;
        let kcb = self.open_cursor(&hive, cell)?;
        self.notify(Some(kcb.id()), hive.id(), cell, ChangeKind::NodeCreated);
        Ok(kcb.id())
    }

    /// Delete the node under a cursor. The cursor stays open but reports
    /// [`HiveError::Deleted`] from then on.
    pub fn delete_node(&self, id: KcbId) -> HiveResult<()> {
        let kcb = self.cursor(id)?;
        let hive = kcb.hive().clone();
        let _flusher = hive.flusher.read();
        let cell = kcb.write(|state| {
            let mut store = hive.store.lock();
            let cell = kcb.cell();
            tree::delete_node(&mut store.space, cell, now_timestamp())?;
            state.deleted = true;
            state.values.invalidate();
            self.cursors.lock().forget(&kcb);
            Ok(cell)
        })?;
        self.notify(Some(id), hive.id(), cell, ChangeKind::NodeDeleted);
        Ok(())
    }

    fn node_info(
        &self,
        id: KcbId,
        read: impl Fn(&mut CellSpace, CellIndex) -> HiveResult<Vec<u8>>,
    ) -> HiveResult<Vec<u8>> {
        let kcb = self.cursor(id)?;
        let hive = kcb.hive().clone();
        let _flusher = hive.flusher.read();
        kcb.run(|access| {
            access.live()?;
            let mut store = hive.store.lock();
            read(&mut store.space, kcb.cell()).map(CacheLookup::Found)
        })
    }

    /// Describe the node under a cursor.
    pub fn query_node(&self, id: KcbId, class: NodeInfoClass, buf: &mut [u8]) -> HiveResult<usize> {
        let record = self.node_info(id, |space, cell| tree::node_record(space, cell, class))?;
        copy_out(buf, &record, class.fixed_len())
    }

    /// Describe the `index`th child of the node, stable children first.
    pub fn enumerate_child(
        &self,
        id: KcbId,
        index: u32,
        class: NodeInfoClass,
        buf: &mut [u8],
    ) -> HiveResult<usize> {
        let record =
            self.node_info(id, |space, cell| tree::child_record(space, cell, index, class))?;
        copy_out(buf, &record, class.fixed_len())
    }

    /// Describe the `index`th value of the node.
    pub fn enumerate_value(
        &self,
        id: KcbId,
        index: usize,
        class: ValueInfoClass,
        buf: &mut [u8],
    ) -> HiveResult<usize> {
        let kcb = self.cursor(id)?.value_kcb()?;
        let hive = kcb.hive().clone();
        let _flusher = hive.flusher.read();
        let v = kcb.run(|access| {
            let mut store = hive.store.lock();
            tree::value_at(access, &mut store.space, kcb.cell(), index)
        })?;
        let record = buffer::value_record(class, &v.name, v.value_type, &v.data);
        copy_out(buf, &record, class.fixed_len())
    }

    /// Describe a value by name.
    pub fn query_value(
        &self,
        id: KcbId,
        name: &str,
        class: ValueInfoClass,
        buf: &mut [u8],
    ) -> HiveResult<usize> {
        let v = self.lookup_value(id, name)?;
        let record = buffer::value_record(class, &v.name, v.value_type, &v.data);
        copy_out(buf, &record, class.fixed_len())
    }

    /// A value's type and data.
    pub fn read_value(&self, id: KcbId, name: &str) -> HiveResult<(ValueType, Vec<u8>)> {
        let v = self.lookup_value(id, name)?;
        Ok((v.value_type, v.data.clone()))
    }

    fn lookup_value(&self, id: KcbId, name: &str) -> HiveResult<Arc<LoadedValue>> {
        validate_value_name(name)?;
        let kcb = self.cursor(id)?.value_kcb()?;
        let hive = kcb.hive().clone();
        let _flusher = hive.flusher.read();
        kcb.run(|access| {
            let mut store = hive.store.lock();
            tree::value_by_name(access, &mut store.space, kcb.cell(), name)
        })
    }

    /// Read several values at once, their data packed into `buf`. Any missing name fails the
    /// whole query.
    pub fn query_multiple_values(
        &self,
        id: KcbId,
        names: &[&str],
        buf: &mut [u8],
    ) -> HiveResult<Vec<ValueEntry>> {
        let kcb = self.cursor(id)?.value_kcb()?;
        let hive = kcb.hive().clone();
        let _flusher = hive.flusher.read();
        let values = kcb.run(|access| {
            let mut store = hive.store.lock();
            let mut out = Vec::with_capacity(names.len());
            for name in names {
                match tree::value_by_name(access, &mut store.space, kcb.cell(), name)? {
                    CacheLookup::Found(v) => out.push(v),
                    CacheLookup::NotFound => return Ok(CacheLookup::NotFound),
                    CacheLookup::NeedExclusive => return Ok(CacheLookup::NeedExclusive),
                }
            }
            Ok(CacheLookup::Found(out))
        })?;
        let mut writer = MultiValueWriter::new(buf);
        for v in &values {
            writer.push(v.value_type, &v.data);
        }
        writer.finish()
    }

    /// Create or replace a value.
    pub fn set_value(&self, id: KcbId, name: &str, value_type: ValueType, data: &[u8]) -> HiveResult<()> {
        validate_value_name(name)?;
        let kcb = self.cursor(id)?.value_kcb()?;
        let hive = kcb.hive().clone();
        let _flusher = hive.flusher.read();
        let changed = kcb.write(|state| {
            let mut store = hive.store.lock();
            tree::set_value(
                &mut store.space,
                state,
                kcb.cell(),
                name,
                value_type,
                data,
                now_timestamp(),
            )
        })?;
        if changed {
            self.notify(Some(kcb.id()), hive.id(), kcb.cell(), ChangeKind::ValueSet);
        }
        Ok(())
    }

    pub fn delete_value(&self, id: KcbId, name: &str) -> HiveResult<()> {
        validate_value_name(name)?;
        let kcb = self.cursor(id)?.value_kcb()?;
        let hive = kcb.hive().clone();
        let _flusher = hive.flusher.read();
        kcb.write(|state| {
            let mut store = hive.store.lock();
            tree::delete_value(&mut store.space, state, kcb.cell(), name, now_timestamp())
        })?;
        self.notify(Some(kcb.id()), hive.id(), kcb.cell(), ChangeKind::ValueDeleted);
        Ok(())
    }

    pub fn set_last_write_time(&self, id: KcbId, ts: u64) -> HiveResult<()> {
        let kcb = self.cursor(id)?;
        let hive = kcb.hive().clone();
        let _flusher = hive.flusher.read();
        kcb.write(|_| {
            let mut store = hive.store.lock();
            tree::set_last_write_time(&mut store.space, kcb.cell(), ts)
        })?;
        self.notify(Some(id), hive.id(), kcb.cell(), ChangeKind::LastWriteSet);
        Ok(())
    }

    pub fn set_user_flags(&self, id: KcbId, flags: u32) -> HiveResult<()> {
        let kcb = self.cursor(id)?;
        let hive = kcb.hive().clone();
        let _flusher = hive.flusher.read();
        kcb.write(|_| {
            let mut store = hive.store.lock();
            tree::set_user_flags(&mut store.space, kcb.cell(), flags, now_timestamp())
        })?;
        self.notify(Some(id), hive.id(), kcb.cell(), ChangeKind::UserFlagsSet);
        Ok(())
    }

    /// Rename the node under a cursor. Every cursor on the node follows it.
    pub fn rename(&self, id: KcbId, new_name: &str) -> HiveResult<()> {
        validate_name(new_name)?;
        self.relocate(id, AccessOp::Rename, |space, cell| {
            tree::rename_node(space, cell, new_name, now_timestamp())
        })
    }

    /// Move the node under a cursor to fresh cells.
    pub fn move_node(&self, id: KcbId) -> HiveResult<()> {
        self.relocate(id, AccessOp::Move, tree::move_node)
    }

    fn relocate(
        &self,
        id: KcbId,
        op: AccessOp,
        f: impl FnOnce(&mut CellSpace, CellIndex) -> HiveResult<CellIndex>,
    ) -> HiveResult<()> {
        let kcb = self.cursor(id)?;
        if !self.access.allowed(id, op) {
            return Err(HiveError::AccessDenied);
        }
        let hive = kcb.hive().clone();
        let _flusher = hive.flusher.read();
        let cell = kcb.write(|state| {
            let mut store = hive.store.lock();
            let old = kcb.cell();
            let new = f(&mut store.space, old)?;
            kcb.set_cell(new);
            state.values.invalidate();
            self.cursors.lock().rekey(&kcb, old);
            Ok(new)
        })?;
        let kind = match op {
            AccessOp::Rename => ChangeKind::Renamed,
            AccessOp::Move => ChangeKind::Moved,
        };
        self.notify(Some(id), hive.id(), cell, kind);
        Ok(())
    }

    /// Rewrite a hive into the smallest image that holds its tree, and write it out.
    pub fn compress(&self, id: HiveId) -> HiveResult<()> {
        let hive = self.hive(id)?;
        let _flusher = hive.flusher.write();
        let kcbs = self.cursors.lock().of_hive(id);
        let mut states: Vec<_> = kcbs.iter().map(|k| k.state.write()).collect();
        let mut store = hive.store.lock();
        let remap = tree::compress_store(&mut store)?;
        let root = store.base.root();
        drop(store);

        let mut table = self.cursors.lock();
        for (kcb, state) in kcbs.iter().zip(states.iter_mut()) {
            state.values.invalidate();
            if state.deleted {
                continue;
            }
            let old = kcb.cell();
            if let Some(new) = remap.get(&old) {
                kcb.set_cell(*new);
                table.rekey(kcb, old);
            }
        }
        drop(table);
        drop(states);
        hive.bump_generation();
        self.notify(None, id, root, ChangeKind::Compressed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use byteorder::{ByteOrder, LittleEndian};

    use super::*;
    use crate::{backend::HeapPool, config::MapMode, error::ErrorKind, HBLOCK_SIZE};

    fn memory_hive() -> (Registry, HiveId, KcbId) {
        let registry = Registry::new();
        let hive = registry.create_hive(&HiveOptions::default(), None, None).unwrap();
        let root = registry.open_root(hive).unwrap();
        (registry, hive, root)
    }

    fn name_of(registry: &Registry, kcb: KcbId) -> String {
        let mut buf = [0u8; 300];
        let n = registry.query_node(kcb, NodeInfoClass::Name, &mut buf).unwrap();
        String::from_utf8(buf[4..n].to_vec()).unwrap()
    }

    #[test]
    fn set_flush_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SYSTEM");
        let options = HiveOptions::default();

        let registry = Registry::new();
        let loaded = registry.open_hive(&path, &options).unwrap();
        let root = registry.open_root(loaded.id).unwrap();
        registry.set_value(root, "Foo", ValueType::STRING, b"bar").unwrap();
        registry.flush_hive(loaded.id).unwrap();
        registry.close(root).unwrap();
        registry.unload_hive(loaded.id).unwrap();
        assert!(matches!(registry.hive(loaded.id), Err(HiveError::NotFound)));

        let loaded = registry.open_hive(&path, &options).unwrap();
        assert!(!loaded.self_healed);
        let root = registry.open_root(loaded.id).unwrap();
        assert_eq!(
            registry.read_value(root, "foo").unwrap(),
            (ValueType::STRING, b"bar".to_vec())
        );
        let mut buf = [0u8; 64];
        let n = registry
            .query_value(root, "Foo", ValueInfoClass::Partial, &mut buf)
            .unwrap();
        assert_eq!(n, 15);
        assert_eq!(LittleEndian::read_u32(&buf[4..8]), ValueType::STRING.0);
        assert_eq!(&buf[12..15], b"bar");
    }

    #[test]
    fn mapped_hive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SOFTWARE");
        let mut mapped = HiveOptions::default();
        mapped.map_mode(MapMode::Mapped);

        let registry = Registry::new();
        let loaded = registry.open_hive(&path, &mapped).unwrap();
        let root = registry.open_root(loaded.id).unwrap();
        registry.set_value(root, "small", ValueType::DWORD, &[1, 0, 0, 0]).unwrap();
        registry.set_value(root, "large", ValueType::BINARY, &[7u8; 6000]).unwrap();
        registry.flush_hive(loaded.id).unwrap();
        registry.close(root).unwrap();
        registry.unload_hive(loaded.id).unwrap();

        // Mutate over mapped views and flush again
        let loaded = registry.open_hive(&path, &mapped).unwrap();
        let root = registry.open_root(loaded.id).unwrap();
        assert_eq!(
            registry.read_value(root, "large").unwrap(),
            (ValueType::BINARY, vec![7u8; 6000])
        );
        registry.set_value(root, "small", ValueType::DWORD, &[2, 0, 0, 0]).unwrap();
        registry.set_value(root, "large", ValueType::BINARY, &[9u8; 9000]).unwrap();
        registry.flush_hive(loaded.id).unwrap();
        registry.close(root).unwrap();
        registry.unload_hive(loaded.id).unwrap();

        let loaded = registry.open_hive(&path, &HiveOptions::default()).unwrap();
        assert!(!loaded.self_healed);
        let root = registry.open_root(loaded.id).unwrap();
        assert_eq!(
            registry.read_value(root, "small").unwrap(),
            (ValueType::DWORD, vec![2, 0, 0, 0])
        );
        assert_eq!(
            registry.read_value(root, "large").unwrap(),
            (ValueType::BINARY, vec![9u8; 9000])
        );
    }

    #[test]
    fn out_of_line_value_shrinks_inline() {
        let (registry, hive, root) = memory_hive();
        let area = StorageType::Stable;
        let h = registry.hive(hive).unwrap();
        let free = h.free_bytes(area);
        registry.set_value(root, "v", ValueType::BINARY, &[3u8; 2000]).unwrap();
        let after_big = h.free_bytes(area);
        registry.set_value(root, "v", ValueType::DWORD, &[1, 2, 3, 4]).unwrap();
        assert_eq!(
            registry.read_value(root, "v").unwrap(),
            (ValueType::DWORD, vec![1, 2, 3, 4])
        );
        // The 2000-byte data cell (2008 with its header) went back
        assert_eq!(h.free_bytes(area), after_big + 2008);
        registry.delete_value(root, "v").unwrap();
        assert_eq!(h.free_bytes(area), free);
    }

    #[test]
    fn rename_under_a_second_cursor() {
        let (registry, _, root) = memory_hive();
        let a = registry.create_node(root, "A", StorageType::Stable, b"").unwrap();
        let b = registry.create_node(a, "B", StorageType::Stable, b"").unwrap();
        registry.set_value(b, "x", ValueType::DWORD, &[1, 0, 0, 0]).unwrap();
        let kid = registry.create_node(b, "kid", StorageType::Stable, b"").unwrap();
        let other = registry.open_node(root, "A\\B").unwrap();

        registry.rename(b, "C").unwrap();
        // The second cursor sees the renamed node, whole
        assert_eq!(name_of(&registry, other), "C");
        assert_eq!(
            registry.read_value(other, "x").unwrap(),
            (ValueType::DWORD, vec![1, 0, 0, 0])
        );
        assert!(matches!(registry.open_node(root, "A\\B"), Err(HiveError::NotFound)));
        let c = registry.open_node(root, "A\\C").unwrap();
        assert_eq!(c, other);
        assert_eq!(registry.open_node(c, "kid").unwrap(), kid);

        // Deleting through one cursor is seen through the other
        registry.delete_node(kid).unwrap();
        let again = registry.open_node(root, "A\\C").unwrap();
        assert!(matches!(registry.open_node(again, "kid"), Err(HiveError::NotFound)));
        assert!(matches!(
            registry.query_node(kid, NodeInfoClass::Basic, &mut [0u8; 64]),
            Err(HiveError::Deleted)
        ));
        registry.close(kid).unwrap();
        assert!(matches!(registry.set_value(kid, "x", ValueType::NONE, b""), Err(HiveError::Deleted)));
    }

    #[test]
    fn failed_rename_leaves_the_image_alone() {
        let mut options = HiveOptions::default();
        options.allocator(Arc::new(HeapPool::with_quota(HBLOCK_SIZE)));
        let registry = Registry::new();
        let hive = registry.create_hive(&options, None, None).unwrap();
        let h = registry.hive(hive).unwrap();
        let root = registry.open_root(hive).unwrap();
        let a = registry.create_node(root, "A", StorageType::Stable, b"").unwrap();

        // Leave too little room for a node with a longer name
        let free = h.free_bytes(StorageType::Stable);
        registry
            .set_value(root, "pad", ValueType::BINARY, &vec![0u8; free - 128])
            .unwrap();
        println!("{} bytes left", h.free_bytes(StorageType::Stable));
        assert!(h.free_bytes(StorageType::Stable) <= 88);

        let before = h.save_image().unwrap();
        let e = registry.rename(a, "a-much-longer-name").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(h.save_image().unwrap(), before);
        assert_eq!(name_of(&registry, a), "A");
        assert_eq!(registry.open_node(root, "A").unwrap(), a);

        registry.delete_value(root, "pad").unwrap();
        registry.rename(a, "a-much-longer-name").unwrap();
        assert_eq!(name_of(&registry, a), "a-much-longer-name");
    }

    #[test]
    fn identical_set_dirties_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        let loaded = registry
            .open_hive(dir.path().join("h"), &HiveOptions::default())
            .unwrap();
        let h = registry.hive(loaded.id).unwrap();
        let root = registry.open_root(loaded.id).unwrap();
        registry.set_value(root, "k", ValueType::BINARY, &[5u8; 100]).unwrap();
        registry.flush_hive(loaded.id).unwrap();
        assert_eq!(h.dirty_sectors(), 0);
        let mut before = [0u8; 16];
        registry.query_node(root, NodeInfoClass::Basic, &mut before).unwrap();

        registry.set_value(root, "K", ValueType::BINARY, &[5u8; 100]).unwrap();
        assert_eq!(h.dirty_sectors(), 0);
        let mut after = [0u8; 16];
        registry.query_node(root, NodeInfoClass::Basic, &mut after).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn cache_agrees_with_the_hive() {
        let (registry, _, root) = memory_hive();
        let names = ["a", "b", "c"];
        for (i, name) in names.iter().enumerate() {
            registry
                .set_value(root, name, ValueType::DWORD, &(i as u32).to_le_bytes())
                .unwrap();
        }
        for round in 0..3u32 {
            let data = vec![round as u8; 10 + round as usize * 3000];
            registry.set_value(root, "b", ValueType::BINARY, &data).unwrap();
            // Cached path
            assert_eq!(registry.read_value(root, "b").unwrap().1, data);
            // And through the multiple-value query
            let mut buf = vec![0u8; 16 * 1024];
            let entries = registry
                .query_multiple_values(root, &["c", "b"], &mut buf)
                .unwrap();
            assert_eq!(entries[0].offset, 0);
            assert_eq!(entries[1].offset, 4);
            assert_eq!(&buf[entries[1].offset..entries[1].offset + entries[1].len], &data[..]);
        }
        registry.delete_value(root, "a").unwrap();
        let mut buf = [0u8; 64];
        let n = registry
            .enumerate_value(root, 0, ValueInfoClass::Basic, &mut buf)
            .unwrap();
        assert_eq!(&buf[12..n], b"b");
        assert!(matches!(
            registry.enumerate_value(root, 2, ValueInfoClass::Basic, &mut buf),
            Err(HiveError::NotFound)
        ));
        assert!(matches!(
            registry.query_multiple_values(root, &["b", "zzz"], &mut buf),
            Err(HiveError::NotFound)
        ));
        let e = registry
            .query_multiple_values(root, &["c", "b"], &mut [0u8; 8])
            .unwrap_err();
        assert_eq!(e.required_size(), Some(4 + 6010));
    }

    #[test]
    fn overwrite_keeps_the_first_spelling() {
        let (registry, _, root) = memory_hive();
        registry.set_value(root, "Foo", ValueType::STRING, b"bar").unwrap();
        registry.set_value(root, "FOO", ValueType::STRING, b"baz").unwrap();

        let value_name = |registry: &Registry| {
            let mut buf = [0u8; 64];
            let n = registry
                .enumerate_value(root, 0, ValueInfoClass::Basic, &mut buf)
                .unwrap();
            String::from_utf8(buf[12..n].to_vec()).unwrap()
        };
        let warm = value_name(&registry);
        registry.cursor(root).unwrap().state.write().values.invalidate();
        let cold = value_name(&registry);
        println!("warm {:?}, cold {:?}", warm, cold);
        assert_eq!(warm, "Foo");
        assert_eq!(cold, "Foo");

        let mut buf = [0u8; 64];
        let n = registry
            .query_value(root, "foo", ValueInfoClass::Full, &mut buf)
            .unwrap();
        assert_eq!(&buf[20..23], b"Foo");
        assert_eq!(&buf[23..n], b"baz");
    }

    #[test]
    fn children_and_buffers() {
        let (registry, _, root) = memory_hive();
        registry.create_node(root, "beta", StorageType::Stable, b"").unwrap();
        registry.create_node(root, "Alpha", StorageType::Stable, b"class!").unwrap();
        registry.create_node(root, "tmp", StorageType::Volatile, b"").unwrap();
        assert!(matches!(
            registry.create_node(root, "ALPHA", StorageType::Stable, b""),
            Err(HiveError::AlreadyExists)
        ));
        assert!(matches!(
            registry.create_node(root, "a\\b", StorageType::Stable, b""),
            Err(HiveError::InvalidParameter(_))
        ));

        let mut buf = [0u8; 64];
        let n = registry
            .enumerate_child(root, 0, NodeInfoClass::Node, &mut buf)
            .unwrap();
        assert_eq!(&buf[24..29], b"Alpha");
        assert_eq!(&buf[29..n], b"class!");
        let n = registry.enumerate_child(root, 2, NodeInfoClass::Name, &mut buf).unwrap();
        assert_eq!(&buf[4..n], b"tmp");
        assert!(matches!(
            registry.enumerate_child(root, 3, NodeInfoClass::Name, &mut buf),
            Err(HiveError::NotFound)
        ));

        let e = registry
            .enumerate_child(root, 0, NodeInfoClass::Basic, &mut [0u8; 8])
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::BufferTooSmall);
        assert_eq!(e.required_size(), Some(21));
        let mut short = [0u8; 18];
        let e = registry
            .enumerate_child(root, 0, NodeInfoClass::Basic, &mut short)
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::BufferOverflow);
        assert_eq!(&short[16..], b"Al");

        let mut full = [0u8; 64];
        registry.query_node(root, NodeInfoClass::Full, &mut full).unwrap();
        assert_eq!(LittleEndian::read_u32(&full[20..24]), 3);
        assert_eq!(LittleEndian::read_u32(&full[28..32]), 6);

        registry.set_user_flags(root, 9).unwrap();
        registry.set_last_write_time(root, 1234).unwrap();
        registry.query_node(root, NodeInfoClass::Basic, &mut full).unwrap();
        assert_eq!(LittleEndian::read_u64(&full[0..8]), 1234);
    }

    #[test]
    fn volatile_nodes_are_not_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h");
        let registry = Registry::new();
        let loaded = registry.open_hive(&path, &HiveOptions::default()).unwrap();
        let root = registry.open_root(loaded.id).unwrap();
        let tmp = registry.create_node(root, "tmp", StorageType::Volatile, b"").unwrap();
        registry.set_value(tmp, "v", ValueType::DWORD, &[1, 2, 3, 4]).unwrap();
        assert!(matches!(
            registry.create_node(tmp, "stable", StorageType::Stable, b""),
            Err(HiveError::InvalidParameter(_))
        ));
        registry.create_node(root, "kept", StorageType::Stable, b"").unwrap();
        registry.flush_hive(loaded.id).unwrap();
        drop(registry);

        let registry = Registry::new();
        let loaded = registry.open_hive(&path, &HiveOptions::default()).unwrap();
        let root = registry.open_root(loaded.id).unwrap();
        assert!(matches!(registry.open_node(root, "tmp"), Err(HiveError::NotFound)));
        registry.open_node(root, "kept").unwrap();
        let mut full = [0u8; 64];
        registry.query_node(root, NodeInfoClass::Full, &mut full).unwrap();
        assert_eq!(LittleEndian::read_u32(&full[20..24]), 1);
    }

    #[test]
    fn compress_keeps_cursors_working() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h");
        let registry = Registry::new();
        let loaded = registry.open_hive(&path, &HiveOptions::default()).unwrap();
        let h = registry.hive(loaded.id).unwrap();
        let root = registry.open_root(loaded.id).unwrap();
        let mut kept = Vec::new();
        for i in 0..40 {
            let k = registry
                .create_node(root, &format!("n{:02}", i), StorageType::Stable, b"")
                .unwrap();
            registry.set_value(k, "data", ValueType::BINARY, &[i as u8; 500]).unwrap();
            if i % 4 == 0 {
                kept.push((i, k));
            } else {
                registry.delete_node(k).unwrap();
                registry.close(k).unwrap();
            }
        }
        registry.flush_hive(loaded.id).unwrap();
        let before = h.length(StorageType::Stable);
        let generation = h.generation();

        registry.compress(loaded.id).unwrap();
        assert_eq!(h.generation(), generation + 1);
        assert!(h.length(StorageType::Stable) < before);
        assert_eq!(h.dirty_sectors(), 0);
        for (i, k) in &kept {
            assert_eq!(registry.read_value(*k, "data").unwrap().1, vec![*i as u8; 500]);
            assert_eq!(name_of(&registry, *k), format!("n{:02}", i));
        }
        let (i, k) = kept[1];
        assert_eq!(registry.open_node(root, &format!("n{:02}", i)).unwrap(), k);
        for (_, k) in kept {
            registry.close(k).unwrap();
        }
        registry.close(root).unwrap();
        drop(h);
        registry.unload_hive(loaded.id).unwrap();

        // What went to disk is the compacted tree
        let loaded = registry.open_hive(&path, &HiveOptions::default()).unwrap();
        let root = registry.open_root(loaded.id).unwrap();
        let n = registry.open_node(root, "n08").unwrap();
        assert_eq!(registry.read_value(n, "data").unwrap().1, vec![8u8; 500]);
        assert!(matches!(registry.open_node(root, "n01"), Err(HiveError::NotFound)));
    }

    #[test]
    fn move_keeps_the_node() {
        let (registry, hive, root) = memory_hive();
        let a = registry.create_node(root, "A", StorageType::Stable, b"").unwrap();
        registry.create_node(a, "kid", StorageType::Stable, b"").unwrap();
        registry.set_value(a, "v", ValueType::STRING, b"moved").unwrap();
        let h = registry.hive(hive).unwrap();
        let image = h.save_image().unwrap();
        registry.move_node(a).unwrap();
        assert_ne!(h.save_image().unwrap(), image);
        assert_eq!(registry.read_value(a, "v").unwrap().1, b"moved");
        registry.open_node(a, "kid").unwrap();
        assert_eq!(registry.open_node(root, "a").unwrap(), a);
        assert!(matches!(registry.move_node(root), Err(HiveError::InvalidParameter(_))));
    }

    #[test]
    fn collaborators() {
        struct DenyMoves;
        impl AccessCheck for DenyMoves {
            fn allowed(&self, _kcb: KcbId, op: AccessOp) -> bool {
                op != AccessOp::Move
            }
        }
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let registry = Registry::new()
            .with_notify(Arc::new(move |e: &ChangeEvent| sink.lock().push(e.kind)))
            .with_access_check(Arc::new(DenyMoves));
        let hive = registry.create_hive(&HiveOptions::default(), None, None).unwrap();
        let root = registry.open_root(hive).unwrap();
        let a = registry.create_node(root, "a", StorageType::Stable, b"").unwrap();
        registry.set_value(a, "v", ValueType::DWORD, &[1, 0, 0, 0]).unwrap();
        registry.set_value(a, "v", ValueType::DWORD, &[1, 0, 0, 0]).unwrap();
        registry.delete_value(a, "v").unwrap();
        registry.rename(a, "b").unwrap();
        let h = registry.hive(hive).unwrap();
        let image = h.save_image().unwrap();
        assert!(matches!(registry.move_node(a), Err(HiveError::AccessDenied)));
        assert_eq!(h.save_image().unwrap(), image);
        registry.delete_node(a).unwrap();
        registry.compress(hive).unwrap();
        assert_eq!(
            *events.lock(),
            [
                ChangeKind::NodeCreated,
                ChangeKind::ValueSet,
                ChangeKind::ValueDeleted,
                ChangeKind::Renamed,
                ChangeKind::NodeDeleted,
                ChangeKind::Compressed,
            ]
        );
    }

    #[test]
    fn late_unload_waits_for_cursors() {
        let (registry, hive, root) = memory_hive();
        let a = registry.create_node(root, "a", StorageType::Stable, b"").unwrap();
        assert!(matches!(registry.unload_hive(hive), Err(HiveError::CannotDelete)));
        assert_eq!(registry.unload_hive_late(hive).unwrap(), UnloadState::Pending);
        assert!(matches!(registry.open_root(hive), Err(HiveError::Deleted)));
        // Existing cursors still work
        registry.set_value(a, "v", ValueType::NONE, b"").unwrap();
        registry.close(root).unwrap();
        assert!(registry.hive(hive).is_ok());
        registry.close(a).unwrap();
        assert!(matches!(registry.hive(hive), Err(HiveError::NotFound)));

        let (registry, hive, root) = memory_hive();
        registry.close(root).unwrap();
        assert_eq!(registry.unload_hive_late(hive).unwrap(), UnloadState::Done);
    }

    #[test]
    fn links_redirect_value_access() {
        let (registry, _, root) = memory_hive();
        let src = registry.create_node(root, "src", StorageType::Stable, b"").unwrap();
        let dst = registry.create_node(root, "dst", StorageType::Stable, b"").unwrap();
        registry.set_value(src, "own", ValueType::DWORD, &[1, 0, 0, 0]).unwrap();
        // Warm the cache before linking
        registry.read_value(src, "own").unwrap();
        registry.set_value(dst, "target", ValueType::DWORD, &[2, 0, 0, 0]).unwrap();

        registry.link_cursor(src, dst).unwrap();
        assert!(matches!(registry.read_value(src, "own"), Err(HiveError::NotFound)));
        assert_eq!(registry.read_value(src, "target").unwrap().1, vec![2, 0, 0, 0]);
        registry.set_value(src, "through", ValueType::DWORD, &[3, 0, 0, 0]).unwrap();
        assert_eq!(registry.read_value(dst, "through").unwrap().1, vec![3, 0, 0, 0]);

        // The link keeps the target cursor alive after its own close
        registry.close(dst).unwrap();
        assert_eq!(registry.read_value(src, "target").unwrap().1, vec![2, 0, 0, 0]);
        registry.close(src).unwrap();
        assert!(matches!(registry.read_value(src, "target"), Err(HiveError::Deleted)));
        assert!(matches!(registry.link_cursor(root, root), Err(HiveError::InvalidParameter(_))));
    }

    #[test]
    fn concurrent_readers_and_writers() {
        let (registry, _, root) = memory_hive();
        let registry = Arc::new(registry);
        let done = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let registry = registry.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    let name = format!("t{}", t);
                    let node = registry.create_node(root, &name, StorageType::Stable, b"").unwrap();
                    for i in 0..50u32 {
                        registry
                            .set_value(node, "n", ValueType::DWORD, &i.to_le_bytes())
                            .unwrap();
                        registry.set_value(root, &name, ValueType::DWORD, &i.to_le_bytes()).unwrap();
                        let (_, data) = registry.read_value(node, "n").unwrap();
                        assert_eq!(data, i.to_le_bytes());
                    }
                    done.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(done.load(Ordering::Relaxed), 4);
        for t in 0..4 {
            let (_, data) = registry.read_value(root, &format!("t{}", t)).unwrap();
            assert_eq!(data, 49u32.to_le_bytes());
        }
    }
}
