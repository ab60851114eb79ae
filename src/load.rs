//! Bringing a hive's stable area into memory.
//!
//! The primary is read sequentially through a fixed-size buffer and sliced into bins as it goes.
//! When the header says the last flush never finished, the sectors recorded in the log are laid
//! over each buffer before it is sliced, so bins are only ever built from the repaired image.

use tracing::{debug, info, trace, warn};

use crate::{
    alloc::CellSpace,
    backend::StorageBackend,
    cell::{CellIndex, StorageType},
    config::{HealPolicy, HiveOptions},
    error::{FormatError, HiveError, HiveResult},
    format::{
        write_cell_size, BaseBlock, BinHeader, FileType, BIN_SIGNATURE, BOOT_SELF_HEAL,
        KEY_HIVE_ENTRY,
    },
    log::{self, LogOverlay},
    map::Backing,
    node,
    storage::ViewCache,
    HBIN_HEADER_SIZE, HBLOCK_SIZE, HSECTOR_SIZE,
};

/// What reading the base block told us.
#[derive(Debug)]
pub(crate) enum HeaderState {
    /// Checksum and sequence numbers are fine
    Clean(BaseBlock),
    /// The header is fine, but a flush was interrupted; the log has to be replayed
    RecoverData(BaseBlock),
    /// The header is unusable, but the first bin looks right; the header comes from the log
    RecoverHeader,
}

/// A stable area rebuilt from a primary (and maybe its log).
pub(crate) struct LoadedImage {
    pub base: BaseBlock,
    pub space: CellSpace,
    pub healed: bool,
}

pub(crate) fn read_header(primary: &mut dyn StorageBackend) -> HiveResult<HeaderState> {
    let len = primary.len().map_err(HiveError::Io)?;
    if len < (2 * HBLOCK_SIZE) as u64 {
        return Err(HiveError::NotHive);
    }
    let mut block = vec![0u8; HBLOCK_SIZE];
    primary.read_at(0, &mut block).map_err(HiveError::Io)?;
    let base = BaseBlock::from_bytes(&block);
    if base.checksum_ok() && base.validate(FileType::Primary).is_ok() {
        return Ok(if base.is_clean() {
            HeaderState::Clean(base)
        } else {
            HeaderState::RecoverData(base)
        });
    }
    let mut bin = [0u8; HBIN_HEADER_SIZE];
    primary
        .read_at(HBLOCK_SIZE as u64, &mut bin)
        .map_err(HiveError::Io)?;
    let first = BinHeader::read(&bin);
    if first.signature == BIN_SIGNATURE && first.file_offset == 0 {
        Ok(HeaderState::RecoverHeader)
    } else {
        Err(HiveError::NotHive)
    }
}

/// Load a hive from its primary, replaying the log if the last flush didn't complete.
pub(crate) fn load(
    primary: &mut dyn StorageBackend,
    mut log: Option<&mut Box<dyn StorageBackend>>,
    options: &HiveOptions,
) -> HiveResult<LoadedImage> {
    let policy = options.heal_policy;
    let mut healed = false;

    let (mut base, recover) = match read_header(primary)? {
        HeaderState::Clean(base) => (base, false),
        HeaderState::RecoverData(base) => {
            warn!(
                "Hive sequence numbers disagree ({} vs {}); the log will be replayed",
                base.sequence1, base.sequence2
            );
            (base, true)
        }
        HeaderState::RecoverHeader => {
            let l = log
                .as_deref_mut()
                .ok_or(HiveError::Corrupt(FormatError::HeaderChecksum))?;
            let mut header = log::read_log_header(l.as_mut())?;
            warn!("Primary header is damaged; taking it from the log");
            header.file_type = FileType::Primary as u32;
            header.sequence2 = header.sequence1.wrapping_sub(1);
            header.update_checksum();
            (header, true)
        }
    };
    if base.cluster == 0 || base.cluster as usize * HSECTOR_SIZE > HBLOCK_SIZE {
        return Err(FormatError::HeaderFields.into());
    }

    let mut overlay = None;
    if recover {
        let opened = match log.as_deref_mut() {
            Some(l) => LogOverlay::open(l.as_mut(), &base, policy, options.io_buffer_size),
            None => Err(FormatError::LogHeader.into()),
        };
        match opened {
            Ok(o) => {
                healed |= o.healed();
                overlay = Some(o);
            }
            Err(e) if policy == HealPolicy::SelfHeal => {
                warn!("Log can't be replayed ({}); loading the primary as it is", e);
                healed = true;
            }
            Err(e) => return Err(e),
        }
    }

    let views = map_views(primary, options, base.length)?;
    let mut space = CellSpace::new(
        options.allocator.clone(),
        views,
        options.max_log_size,
        base.cluster,
    );
    let mut bulk = BulkLoad {
        length: base.length,
        policy,
        healed: false,
        lenient: recover || policy == HealPolicy::SelfHeal,
        bins: Vec::new(),
    };
    bulk.run(primary, log, overlay.as_mut(), &mut space, options.io_buffer_size)?;
    healed |= bulk.healed;

    for &(offset, size) in &bulk.bins {
        if let Err(e) = space.enlist_bin(StorageType::Stable, offset, size) {
            if policy == HealPolicy::Strict {
                return Err(e);
            }
            warn!("Bin at 0x{:x} has a broken cell chain ({}); emptying it", offset, e);
            space.force_dirty(offset, size);
            let mem = space.map.bytes(StorageType::Stable, offset, size as usize)?;
            empty_bin(mem, offset);
            space.enlist_bin(StorageType::Stable, offset, size)?;
            healed = true;
        }
    }

    check_root(&mut space, base.root())?;
    clear_volatile(&mut space, base.root())?;

    if recover || healed {
        // The header on disk is stale either way; make sure the next flush rewrites it
        space.force_dirty(0, HSECTOR_SIZE as u32);
    }
    if healed {
        base.boot_type = BOOT_SELF_HEAL;
    }
    base.sequence2 = base.sequence1;
    base.update_checksum();
    info!(
        "Loaded hive \"{}\": 0x{:x} bytes in {} bins{}",
        base.file_name(),
        base.length,
        bulk.bins.len(),
        if healed { ", self-healed" } else { "" }
    );
    Ok(LoadedImage {
        base,
        space,
        healed,
    })
}

/// Set up views over the primary file, if the options ask for them and the backend has a file.
fn map_views(
    primary: &mut dyn StorageBackend,
    options: &HiveOptions,
    length: u32,
) -> HiveResult<Option<ViewCache>> {
    if !options.can_map() {
        return Ok(None);
    }
    let file_len = primary.len().map_err(HiveError::Io)?;
    let Some(file) = primary.as_file() else {
        debug!("Primary has no file to map; using pooled bins");
        return Ok(None);
    };
    let file = file.try_clone().map_err(HiveError::Io)?;
    let on_disk = file_len.saturating_sub(HBLOCK_SIZE as u64).min(length as u64);
    let on_disk = on_disk - on_disk % HBLOCK_SIZE as u64;
    Ok(Some(ViewCache::new(
        file,
        options.view_size,
        options.max_mapped_views,
        on_disk as u32,
    )))
}

struct BulkLoad {
    length: u32,
    policy: HealPolicy,
    healed: bool,
    /// Missing parts of the primary read as zeroes instead of failing the load
    lenient: bool,
    bins: Vec<(u32, u32)>,
}

impl BulkLoad {
    fn run(
        &mut self,
        primary: &mut dyn StorageBackend,
        mut log: Option<&mut Box<dyn StorageBackend>>,
        mut overlay: Option<&mut LogOverlay>,
        space: &mut CellSpace,
        io_buffer_size: usize,
    ) -> HiveResult<()> {
        let area = StorageType::Stable;
        space.dirty.resize(self.length as usize / HSECTOR_SIZE);
        let buf_len = (io_buffer_size / HBLOCK_SIZE).max(1) * HBLOCK_SIZE;
        let mut buf = vec![0u8; buf_len];
        let mut current: Option<(u32, u32, Backing)> = None;
        let mut pos = 0u32;

        while pos < self.length {
            let n = buf_len.min((self.length - pos) as usize);
            let chunk = &mut buf[..n];
            self.read_chunk(primary, pos, chunk)?;

            let mut replayed = Vec::new();
            if let (Some(o), Some(l)) = (overlay.as_deref_mut(), log.as_deref_mut()) {
                replayed = o.apply(l.as_mut(), pos, chunk, self.policy)?;
            }

            let mut at = 0usize;
            while at < n {
                let offset = pos + at as u32;
                let (bin, size, backing) = match current {
                    Some(c) => c,
                    None => {
                        let c = self.start_bin(space, &mut chunk[at..], offset)?;
                        self.bins.push((c.0, c.1));
                        c
                    }
                };
                let end = bin as usize + size as usize;
                let take = (end - offset as usize).min(n - at);
                if let Backing::Pool(_) = backing {
                    space
                        .map
                        .bytes(area, offset, take)?
                        .copy_from_slice(&chunk[at..at + take]);
                }
                at += take;
                current = if offset as usize + take == end {
                    None
                } else {
                    Some((bin, size, backing))
                };
            }

            // Replayed sectors are newer than the file, so they have to be flushed again. Mapped
            // bins only see the file, so the replayed bytes get copied into their views too.
            for (sector, count) in replayed {
                let offset = sector * HSECTOR_SIZE as u32;
                let len = count * HSECTOR_SIZE as u32;
                space.force_dirty(offset, len);
                for s in 0..count {
                    let at = offset + s * HSECTOR_SIZE as u32;
                    if space.map.entry(area, at).map(|e| e.backing) == Some(Backing::View) {
                        let src = (at - pos) as usize;
                        space
                            .map
                            .bytes(area, at, HSECTOR_SIZE)?
                            .copy_from_slice(&chunk[src..src + HSECTOR_SIZE]);
                    }
                }
            }
            pos += n as u32;
        }
        debug!("Bulk-loaded {} bins", self.bins.len());
        Ok(())
    }

    fn read_chunk(
        &mut self,
        primary: &mut dyn StorageBackend,
        pos: u32,
        chunk: &mut [u8],
    ) -> HiveResult<()> {
        let offset = (HBLOCK_SIZE + pos as usize) as u64;
        match primary.read_at(offset, chunk) {
            Ok(()) => Ok(()),
            Err(e) if !self.lenient => Err(HiveError::Io(e)),
            Err(e) => {
                trace!("Short read at 0x{:x} ({}); reading block by block", pos, e);
                for (i, block) in chunk.chunks_mut(HBLOCK_SIZE).enumerate() {
                    let at = offset + (i * HBLOCK_SIZE) as u64;
                    if primary.read_at(at, block).is_err() {
                        block.fill(0);
                    }
                }
                Ok(())
            }
        }
    }

    /// Map the bin starting at `offset`, whose first block is at the start of `data`.
    fn start_bin(
        &mut self,
        space: &mut CellSpace,
        data: &mut [u8],
        offset: u32,
    ) -> HiveResult<(u32, u32, Backing)> {
        let area = StorageType::Stable;
        let header = BinHeader::read(data);
        let mut size = header.size;
        let mut patched = false;
        if !header.is_valid_at(offset, self.length) {
            if self.policy == HealPolicy::Strict {
                return Err(FormatError::BinHeader { offset }.into());
            }
            warn!("Bin at 0x{:x} is invalid; replacing it with an empty block", offset);
            size = HBLOCK_SIZE as u32;
            empty_bin(&mut data[..HBLOCK_SIZE], offset);
            patched = true;
            self.healed = true;
        }
        let backing = if !patched && space.map.view_fits(offset, size as usize) {
            Backing::View
        } else {
            Backing::Pool(space.map.alloc_chunk(area, offset, size as usize)?)
        };
        space.map.map_bin(area, offset, size, backing);
        if patched {
            space.force_dirty(offset, size);
        }
        trace!("Bin at 0x{:x} (0x{:x} bytes, {:?})", offset, size, backing);
        Ok((offset, size, backing))
    }
}

/// Overwrite a bin with a valid header and a single free cell.
fn empty_bin(mem: &mut [u8], offset: u32) {
    mem.fill(0);
    let size = mem.len() as u32;
    BinHeader::new(offset, size).write(mem);
    write_cell_size(&mut mem[HBIN_HEADER_SIZE..], (size as usize - HBIN_HEADER_SIZE) as i32);
}

fn check_root(space: &mut CellSpace, root: CellIndex) -> HiveResult<()> {
    if root.is_nil() || root.storage() != StorageType::Stable {
        return Err(FormatError::Root(root.raw()).into());
    }
    match node::read_header(space, root) {
        Ok(n) if n.flags & KEY_HIVE_ENTRY != 0 => Ok(()),
        _ => Err(FormatError::Root(root.raw()).into()),
    }
}

/// Volatile children never survive a reload; forget about them in every stable node.
fn clear_volatile(space: &mut CellSpace, root: CellIndex) -> HiveResult<()> {
    let volatile = StorageType::Volatile.index();
    let mut stack = vec![root];
    let mut cleared = 0;
    while let Some(cell) = stack.pop() {
        let mut n = node::read_header(space, cell)?;
        if n.subkey_counts[volatile] != 0 || n.subkey_lists[volatile] != CellIndex::NIL.raw() {
            n.subkey_counts[volatile] = 0;
            n.subkey_lists[volatile] = CellIndex::NIL.raw();
            let size = space.map.cell_size(cell)?.unsigned_abs();
            space.force_dirty(cell.offset(), size);
            node::write_header(space, cell, &n)?;
            cleared += 1;
        }
        let children = node::read_index(space, n.subkey_list(StorageType::Stable))?;
        stack.extend(children.entries.iter().map(|e| e.cell));
    }
    if cleared > 0 {
        debug!("Dropped volatile children from {} nodes", cleared);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::MemoryBackend,
        hive::{Hive, HiveId},
    };

    fn fresh_image() -> (MemoryBackend, MemoryBackend) {
        let primary = MemoryBackend::new();
        let log = MemoryBackend::new();
        let hive = Hive::create(
            HiveId::new(1),
            &HiveOptions::default(),
            Some(Box::new(primary.clone())),
            Some(Box::new(log.clone())),
        )
        .unwrap();
        hive.flush().unwrap();
        (primary, log)
    }

    #[test]
    fn classify_headers() {
        let (primary, _) = fresh_image();
        let mut backend = primary.clone();
        assert!(matches!(read_header(&mut backend).unwrap(), HeaderState::Clean(_)));

        let mut image = primary.image();
        image[4] ^= 1;
        image[508] ^= 1; // keep the checksum right
        let mut dirty = MemoryBackend::from_image(image.clone());
        assert!(matches!(read_header(&mut dirty).unwrap(), HeaderState::RecoverData(_)));

        image[..HBLOCK_SIZE].fill(0);
        let mut headless = MemoryBackend::from_image(image.clone());
        assert!(matches!(read_header(&mut headless).unwrap(), HeaderState::RecoverHeader));

        image[HBLOCK_SIZE..HBLOCK_SIZE + 4].copy_from_slice(b"junk");
        let mut junk = MemoryBackend::from_image(image);
        assert!(matches!(read_header(&mut junk), Err(HiveError::NotHive)));
        let mut tiny = MemoryBackend::from_image(vec![0; 100]);
        assert!(matches!(read_header(&mut tiny), Err(HiveError::NotHive)));
    }

    #[test]
    fn strict_and_healing_loads() {
        let (primary, _) = fresh_image();
        let mut image = primary.image();
        // Wreck the cell chain of the only bin; the root goes with it
        image[HBLOCK_SIZE + HBIN_HEADER_SIZE..HBLOCK_SIZE + HBIN_HEADER_SIZE + 4]
            .copy_from_slice(&3i32.to_le_bytes());

        let mut strict = MemoryBackend::from_image(image.clone());
        let res = load(&mut strict, None, &HiveOptions::default());
        assert!(matches!(
            res,
            Err(HiveError::Corrupt(FormatError::CellChain { offset: 0 }))
        ));

        let mut opts = HiveOptions::default();
        opts.heal_policy(HealPolicy::SelfHeal);
        let mut healing = MemoryBackend::from_image(image);
        // The bin gets emptied, which leaves no root to hang a tree on
        let res = load(&mut healing, None, &opts);
        assert!(matches!(res, Err(HiveError::Corrupt(FormatError::Root(_)))));
    }

    #[test]
    fn bad_trailing_bin_is_patched() {
        let primary = MemoryBackend::new();
        let hive = Hive::create(
            HiveId::new(1),
            &HiveOptions::default(),
            Some(Box::new(primary.clone())),
            None,
        )
        .unwrap();
        {
            let mut store = hive.store.lock();
            // A second bin, left partly used
            store
                .space
                .allocate(5000, StorageType::Stable, CellIndex::NIL)
                .unwrap();
        }
        hive.flush().unwrap();
        let mut image = primary.image();
        assert_eq!(image.len(), HBLOCK_SIZE + 3 * HBLOCK_SIZE);
        image[2 * HBLOCK_SIZE..2 * HBLOCK_SIZE + 4].copy_from_slice(b"nope");

        let mut strict = MemoryBackend::from_image(image.clone());
        assert!(matches!(
            load(&mut strict, None, &HiveOptions::default()),
            Err(HiveError::Corrupt(FormatError::BinHeader { offset: 0x1000 }))
        ));

        let mut opts = HiveOptions::default();
        opts.heal_policy(HealPolicy::SelfHeal);
        let mut healing = MemoryBackend::from_image(image);
        let loaded = load(&mut healing, None, &opts).unwrap();
        assert!(loaded.healed);
        assert_eq!(loaded.base.boot_type, BOOT_SELF_HEAL);
        // The broken bin and the block after it each became an empty single-block bin
        let mut space = loaded.space;
        let bins = space.map.bins(StorageType::Stable).unwrap();
        println!("{:?}", bins);
        assert_eq!(bins, vec![(0, 0x1000), (0x1000, 0x1000), (0x2000, 0x1000)]);
        assert_eq!(space.map.length(StorageType::Stable), 3 * HBLOCK_SIZE as u32);
        assert_eq!(space.free_bin_bytes(StorageType::Stable), 2 * HBLOCK_SIZE);
    }
}
