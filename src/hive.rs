use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace};

use crate::{
    alloc::CellSpace,
    backend::StorageBackend,
    cell::{CellIndex, StorageType},
    config::HiveOptions,
    error::{HiveError, HiveResult},
    format::{BaseBlock, KEY_HIVE_ENTRY, KEY_NO_DELETE},
    load, log, node, now_timestamp, HBIN_HEADER_SIZE, HBLOCK_SIZE, HSECTOR_SIZE,
};

/// Identifies a hive within a [`Registry`](crate::Registry).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HiveId(u32);

impl HiveId {
    pub(crate) fn new(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for HiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hive#{}", self.0)
    }
}

/// Everything guarded by the hive lock.
pub(crate) struct HiveStore {
    pub base: BaseBlock,
    pub space: CellSpace,
    pub primary: Option<Box<dyn StorageBackend>>,
    pub log: Option<Box<dyn StorageBackend>>,
    pub options: HiveOptions,
}

/// A loaded hive.
///
/// Locking: `flusher` is held shared by anything that reads or dirties cells and exclusive by
/// flushing, shrinking, and compaction. It is always taken before any cursor lock, which in turn
/// comes before `store`.
pub struct Hive {
    id: HiveId,
    pub(crate) flusher: RwLock<()>,
    pub(crate) store: Mutex<HiveStore>,
    generation: AtomicU64,
    self_healed: bool,
}

impl Hive {
    /// Create an empty hive holding just a root node, and write it out if there's a primary.
    pub(crate) fn create(
        id: HiveId,
        options: &HiveOptions,
        primary: Option<Box<dyn StorageBackend>>,
        log: Option<Box<dyn StorageBackend>>,
    ) -> HiveResult<Self> {
        options.validate()?;
        let mut space = CellSpace::new(
            options.allocator.clone(),
            None,
            options.max_log_size,
            options.cluster,
        );
        let ts = now_timestamp();
        let root = node::alloc_node(
            &mut space,
            StorageType::Stable,
            CellIndex::NIL,
            "",
            KEY_HIVE_ENTRY | KEY_NO_DELETE,
            ts,
            CellIndex::NIL,
        )?;
        let base = BaseBlock::new(
            root,
            space.map.length(StorageType::Stable),
            options.cluster,
            ts,
            &options.file_name,
        );
        let mut store = HiveStore {
            base,
            space,
            primary,
            log,
            options: options.clone(),
        };
        if let Some(primary) = store.primary.as_mut() {
            // A fresh hive is all dirty, so this writes the whole image
            write_out(
                primary.as_mut(),
                store.log.as_mut(),
                &mut store.base,
                &mut store.space,
            )?;
        }
        info!("Created hive {} (\"{}\")", id, options.file_name);
        Ok(Self::new(id, store, false))
    }

    /// Load a hive from a primary (and optional log).
    pub(crate) fn load(
        id: HiveId,
        options: &HiveOptions,
        mut primary: Box<dyn StorageBackend>,
        mut log: Option<Box<dyn StorageBackend>>,
    ) -> HiveResult<Self> {
        options.validate()?;
        let image = load::load(primary.as_mut(), log.as_mut(), options)?;
        let store = HiveStore {
            base: image.base,
            space: image.space,
            primary: Some(primary),
            log,
            options: options.clone(),
        };
        Ok(Self::new(id, store, image.healed))
    }

    fn new(id: HiveId, store: HiveStore, self_healed: bool) -> Self {
        Self {
            id,
            flusher: RwLock::new(()),
            store: Mutex::new(store),
            generation: AtomicU64::new(0),
            self_healed,
        }
    }

    pub fn id(&self) -> HiveId {
        self.id
    }

    /// Whether loading had to repair the image.
    pub fn is_self_healed(&self) -> bool {
        self.self_healed
    }

    /// Bumped whenever compaction moves cells around.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn root(&self) -> CellIndex {
        self.store.lock().base.root()
    }

    /// Bytes held in free cells of an area.
    pub fn free_bytes(&self, area: StorageType) -> usize {
        self.store.lock().space.free_bytes(area)
    }

    /// Bytes held in entirely free bins of an area.
    pub fn free_bin_bytes(&self, area: StorageType) -> usize {
        self.store.lock().space.free_bin_bytes(area)
    }

    /// Current size of an area, free bins included.
    pub fn length(&self, area: StorageType) -> u32 {
        self.store.lock().space.map.length(area)
    }

    /// Sectors waiting for the next flush.
    pub fn dirty_sectors(&self) -> usize {
        self.store.lock().space.dirty.count()
    }

    /// Write every dirty sector out: log first, then the primary.
    pub fn flush(&self) -> HiveResult<()> {
        let _flusher = self.flusher.write();
        self.store.lock().flush()
    }

    /// A complete primary image (header and stable bins) of the hive as it is in memory.
    pub fn save_image(&self) -> HiveResult<Vec<u8>> {
        let _flusher = self.flusher.read();
        self.store.lock().image()
    }
}

impl fmt::Debug for Hive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hive")
            .field("id", &self.id)
            .field("generation", &self.generation())
            .field("self_healed", &self.self_healed)
            .finish_non_exhaustive()
    }
}

impl HiveStore {
    pub fn flush(&mut self) -> HiveResult<()> {
        let length = self.space.shrink();
        let Some(primary) = self.primary.as_mut() else {
            // Nothing backs a memory-only hive
            self.base.length = length;
            self.base.update_checksum();
            self.space.dirty.clear_all();
            return Ok(());
        };
        if self.space.dirty.is_clean() && length == self.base.length {
            trace!("Nothing to flush");
            return Ok(());
        }
        write_out(
            primary.as_mut(),
            self.log.as_mut(),
            &mut self.base,
            &mut self.space,
        )
    }

    pub fn image(&mut self) -> HiveResult<Vec<u8>> {
        let area = StorageType::Stable;
        let length = self.space.map.length(area);
        let mut header = self.base;
        header.length = length;
        header.sequence2 = header.sequence1;
        header.update_checksum();
        let mut out = Vec::with_capacity(HBLOCK_SIZE + length as usize);
        out.extend_from_slice(header.as_bytes());
        for (offset, size) in self.space.map.bins(area)? {
            out.extend_from_slice(self.space.map.bytes(area, offset, size as usize)?);
        }
        Ok(out)
    }
}

/// Write the dirty sectors of `space` to `primary`, going through the log first if there is one.
///
/// The primary header goes out with mismatched sequence numbers before any data, and gets them
/// matched again only once all data is down. `base` is only updated on success.
pub(crate) fn write_out(
    primary: &mut dyn StorageBackend,
    log: Option<&mut Box<dyn StorageBackend>>,
    base: &mut BaseBlock,
    space: &mut CellSpace,
) -> HiveResult<()> {
    let area = StorageType::Stable;
    let length = space.map.length(area);
    debug_assert_eq!(space.dirty.len() * HSECTOR_SIZE, length as usize);
    let ts = now_timestamp().max(base.timestamp() + 1);
    let mut header = *base;
    header.sequence1 = base.sequence1.wrapping_add(1);
    header.set_timestamp(ts);
    header.length = length;
    header.update_checksum();

    // The first bin carries the time of the last flush
    space.force_dirty(0, HBIN_HEADER_SIZE as u32);
    let mut first = space.map.bin_header(area, 0)?;
    first.set_timestamp(ts);
    first.write(space.map.bytes(area, 0, HBIN_HEADER_SIZE)?);

    let cluster = space.cluster();
    if let Some(log) = log {
        log::write_log(log.as_mut(), &header, &space.dirty, &mut space.map, cluster)?;
    }

    primary
        .set_len((HBLOCK_SIZE + length as usize) as u64)
        .map_err(HiveError::Io)?;
    primary.write_at(0, header.as_bytes()).map_err(HiveError::Io)?;
    primary.flush().map_err(HiveError::Io)?;
    let mut written = 0;
    for (first, count) in space.dirty.runs() {
        let mut data = Vec::with_capacity(count * HSECTOR_SIZE);
        for sector in first..first + count {
            let offset = (sector * HSECTOR_SIZE) as u32;
            data.extend_from_slice(space.map.bytes(area, offset, HSECTOR_SIZE)?);
        }
        primary
            .write_at((HBLOCK_SIZE + first * HSECTOR_SIZE) as u64, &data)
            .map_err(HiveError::Io)?;
        written += count;
    }
    primary.flush().map_err(HiveError::Io)?;

    header.sequence2 = header.sequence1;
    header.update_checksum();
    primary.write_at(0, header.as_bytes()).map_err(HiveError::Io)?;
    primary.flush().map_err(HiveError::Io)?;

    *base = header;
    space.dirty.clear_all();
    if let Some(views) = space.map.views_mut() {
        views.clear_dirty();
    }
    debug!(
        "Flushed {} sectors, sequence {}, length 0x{:x}",
        written, header.sequence1, length
    );
    Ok(())
}
