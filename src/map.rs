//! Translation from cell handles to memory.
//!
//! Each storage area has a two-level directory of block entries. An entry records which bin owns
//! the block and where the bin's bytes live: in a pool chunk obtained from the allocation backend,
//! or in a mapped view of the primary file. A block without an entry isn't part of the area.

use std::sync::Arc;

use tracing::trace;

use crate::{
    backend::AllocBackend,
    cell::{CellIndex, StorageType},
    error::{FormatError, HiveError, HiveResult},
    format::{read_cell_size, BinHeader},
    storage::ViewCache,
    HBIN_HEADER_SIZE, HBLOCK_SIZE, HCELL_MIN_SIZE, MAX_CELL_SIZE,
};

/// Block entries per directory table.
pub(crate) const TABLE_ENTRIES: usize = 512;

/// Where the bytes of a block live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Backing {
    /// In the pool chunk with this id
    Pool(u32),
    /// In a view of the primary file
    View,
    /// Nowhere: the block belongs to a free bin whose memory was given back
    Discarded,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct MapEntry {
    /// Offset of the bin owning this block
    pub bin: u32,
    pub backing: Backing,
    /// The block is part of a free bin
    pub free_bin: bool,
}

struct MapTable {
    entries: [Option<MapEntry>; TABLE_ENTRIES],
}

/// A pool allocation holding one or more adjacent bins.
pub(crate) struct PoolChunk {
    pub start: u32,
    pub mem: Box<[u8]>,
}

impl PoolChunk {
    pub fn end(&self) -> u32 {
        self.start + self.mem.len() as u32
    }
}

#[derive(Default)]
struct AreaMap {
    directory: Vec<Option<Box<MapTable>>>,
    chunks: Vec<Option<PoolChunk>>,
    free_chunk_ids: Vec<u32>,
    length: u32,
}

impl AreaMap {
    fn entry(&self, block: usize) -> Option<MapEntry> {
        self.directory
            .get(block / TABLE_ENTRIES)?
            .as_ref()?
            .entries[block % TABLE_ENTRIES]
    }

    fn set_entry(&mut self, block: usize, entry: Option<MapEntry>) {
        let table = block / TABLE_ENTRIES;
        if self.directory.len() <= table {
            self.directory.resize_with(table + 1, || None);
        }
        let slot = self.directory[table].get_or_insert_with(|| {
            Box::new(MapTable {
                entries: [None; TABLE_ENTRIES],
            })
        });
        slot.entries[block % TABLE_ENTRIES] = entry;
    }
}

/// The block maps of both storage areas, plus the memory behind them.
pub(crate) struct BinMap {
    areas: [AreaMap; 2],
    views: Option<ViewCache>,
    allocator: Arc<dyn AllocBackend>,
}

impl BinMap {
    pub fn new(allocator: Arc<dyn AllocBackend>, views: Option<ViewCache>) -> Self {
        Self {
            areas: [AreaMap::default(), AreaMap::default()],
            views,
            allocator,
        }
    }

    pub fn views(&self) -> Option<&ViewCache> {
        self.views.as_ref()
    }

    pub fn views_mut(&mut self) -> Option<&mut ViewCache> {
        self.views.as_mut()
    }

    /// Bytes in use by an area, including free bins.
    pub fn length(&self, area: StorageType) -> u32 {
        self.areas[area.index()].length
    }

    pub fn entry(&self, area: StorageType, offset: u32) -> Option<MapEntry> {
        self.areas[area.index()].entry(offset as usize / HBLOCK_SIZE)
    }

    #[cfg(test)]
    pub fn is_mapped(&self, area: StorageType, offset: u32) -> bool {
        self.entry(area, offset).is_some()
    }

    /// Whether a new bin at `offset` of `size` bytes could be served by a view.
    pub fn view_fits(&self, offset: u32, size: usize) -> bool {
        self.views.as_ref().is_some_and(|v| v.fits(offset, size))
    }

    /// Get `size` zeroed bytes from the allocation backend and register them as a pool chunk
    /// starting at `start`. No blocks are mapped to it yet.
    pub fn alloc_chunk(&mut self, area: StorageType, start: u32, size: usize) -> HiveResult<u32> {
        let mem = self.allocator.alloc(size)?;
        Ok(self.add_chunk(area, start, mem))
    }

    pub fn add_chunk(&mut self, area: StorageType, start: u32, mem: Box<[u8]>) -> u32 {
        let map = &mut self.areas[area.index()];
        let chunk = PoolChunk { start, mem };
        if let Some(id) = map.free_chunk_ids.pop() {
            map.chunks[id as usize] = Some(chunk);
            id
        } else {
            map.chunks.push(Some(chunk));
            (map.chunks.len() - 1) as u32
        }
    }

    pub fn chunk(&self, area: StorageType, id: u32) -> Option<&PoolChunk> {
        self.areas[area.index()].chunks.get(id as usize)?.as_ref()
    }

    /// Give a chunk's memory back to the allocation backend. Entries still pointing at it must
    /// already have been changed.
    pub fn free_chunk(&mut self, area: StorageType, id: u32) {
        let map = &mut self.areas[area.index()];
        if let Some(chunk) = map.chunks.get_mut(id as usize).and_then(Option::take) {
            trace!("Releasing chunk at 0x{:x} (0x{:x} bytes)", chunk.start, chunk.mem.len());
            map.free_chunk_ids.push(id);
            self.allocator.free(chunk.mem);
        }
    }

    /// Point every block of a bin at its backing memory, growing the area if the bin ends past it.
    pub fn map_bin(&mut self, area: StorageType, offset: u32, size: u32, backing: Backing) {
        let map = &mut self.areas[area.index()];
        let first = offset as usize / HBLOCK_SIZE;
        let count = size as usize / HBLOCK_SIZE;
        for block in first..first + count {
            map.set_entry(
                block,
                Some(MapEntry {
                    bin: offset,
                    backing,
                    free_bin: false,
                }),
            );
        }
        map.length = map.length.max(offset + size);
    }

    /// Flag a run of blocks as belonging to a free bin, or not.
    pub fn set_free_bin(&mut self, area: StorageType, offset: u32, size: u32, free: bool) {
        let map = &mut self.areas[area.index()];
        let first = offset as usize / HBLOCK_SIZE;
        for block in first..first + size as usize / HBLOCK_SIZE {
            if let Some(mut entry) = map.entry(block) {
                entry.free_bin = free;
                map.set_entry(block, Some(entry));
            }
        }
    }

    /// Remove every block at or past `length` from the area. Chunks lying wholly past the new end
    /// are freed.
    pub fn truncate(&mut self, area: StorageType, length: u32) {
        let old = self.areas[area.index()].length;
        if length >= old {
            return;
        }
        let mut dead = Vec::new();
        {
            let map = &mut self.areas[area.index()];
            for block in (length as usize / HBLOCK_SIZE)..(old as usize / HBLOCK_SIZE) {
                map.set_entry(block, None);
            }
            for (id, chunk) in map.chunks.iter().enumerate() {
                if chunk.as_ref().is_some_and(|c| c.start >= length) {
                    dead.push(id as u32);
                }
            }
            map.length = length;
            let tables = (length as usize).div_ceil(HBLOCK_SIZE * TABLE_ENTRIES);
            map.directory.truncate(tables);
        }
        for id in dead {
            self.free_chunk(area, id);
        }
        if area == StorageType::Stable {
            if let Some(views) = self.views.as_mut() {
                views.truncate(length);
            }
        }
    }

    /// Resolve `len` bytes at `offset` of an area. The range must not leave the bin holding
    /// `offset`.
    pub fn bytes(&mut self, area: StorageType, offset: u32, len: usize) -> HiveResult<&mut [u8]> {
        let cell = CellIndex::new(area, offset);
        let entry = self.entry(area, offset).ok_or(HiveError::Unavailable(cell))?;
        match entry.backing {
            Backing::Pool(id) => {
                let chunk = self.areas[area.index()]
                    .chunks
                    .get_mut(id as usize)
                    .and_then(Option::as_mut)
                    .ok_or(HiveError::Unavailable(cell))?;
                let start = (offset - chunk.start) as usize;
                chunk
                    .mem
                    .get_mut(start..start + len)
                    .ok_or(HiveError::Unavailable(cell))
            }
            Backing::View => self
                .views
                .as_mut()
                .ok_or(HiveError::Unavailable(cell))?
                .slice(offset, len),
            Backing::Discarded => Err(HiveError::Unavailable(cell)),
        }
    }

    /// Read the header of the bin at `offset`.
    pub fn bin_header(&mut self, area: StorageType, offset: u32) -> HiveResult<BinHeader> {
        Ok(BinHeader::read(self.bytes(area, offset, HBIN_HEADER_SIZE)?))
    }

    /// Offset and size of the bin holding `cell`.
    pub fn bin_of(&mut self, cell: CellIndex) -> HiveResult<(u32, u32)> {
        let entry = self
            .entry(cell.storage(), cell.offset())
            .ok_or(HiveError::Unavailable(cell))?;
        let header = self.bin_header(cell.storage(), entry.bin)?;
        Ok((entry.bin, header.size))
    }

    /// The signed size prefix of a cell: negative when allocated, positive when free.
    pub fn cell_size(&mut self, cell: CellIndex) -> HiveResult<i32> {
        Ok(read_cell_size(self.bytes(cell.storage(), cell.offset(), 4)?))
    }

    /// The payload of an allocated cell, without its size prefix.
    pub fn cell(&mut self, cell: CellIndex) -> HiveResult<&mut [u8]> {
        if cell.is_nil() {
            return Err(FormatError::Record(cell.raw()).into());
        }
        let size = self.cell_size(cell)?;
        if size > -(HCELL_MIN_SIZE as i32) || size.unsigned_abs() as usize > MAX_CELL_SIZE {
            return Err(FormatError::Record(cell.raw()).into());
        }
        let len = size.unsigned_abs() as usize;
        let mem = self.bytes(cell.storage(), cell.offset(), len)?;
        Ok(&mut mem[4..])
    }

    /// Note that stable bytes at `offset` were (or will be) modified, so any view holding them
    /// has to stay mapped until the next flush.
    pub fn note_dirty(&mut self, offset: u32, len: u32) {
        if let Some(views) = self.views.as_mut() {
            views.mark_dirty(offset, len);
        }
    }

    /// Bins of an area in address order, read from their headers.
    pub fn bins(&mut self, area: StorageType) -> HiveResult<Vec<(u32, u32)>> {
        let mut out = Vec::new();
        let length = self.length(area);
        let mut offset = 0;
        while offset < length {
            let entry = self
                .entry(area, offset)
                .ok_or(HiveError::Corrupt(FormatError::Unmapped))?;
            debug_assert_eq!(entry.bin, offset);
            let size = if entry.backing == Backing::Discarded {
                // A discarded run always spans whole blocks up to the next live or missing entry
                let mut end = offset + HBLOCK_SIZE as u32;
                while end < length
                    && self
                        .entry(area, end)
                        .is_some_and(|e| e.backing == Backing::Discarded && e.bin == offset)
                {
                    end += HBLOCK_SIZE as u32;
                }
                end - offset
            } else {
                self.bin_header(area, offset)?.size
            };
            if size == 0 {
                return Err(FormatError::BinHeader { offset }.into());
            }
            out.push((offset, size));
            offset += size;
        }
        Ok(out)
    }
}

impl Drop for BinMap {
    fn drop(&mut self) {
        for area in StorageType::ALL {
            let ids: Vec<u32> = self.areas[area.index()]
                .chunks
                .iter()
                .enumerate()
                .filter(|(_, c)| c.is_some())
                .map(|(i, _)| i as u32)
                .collect();
            for id in ids {
                self.free_chunk(area, id);
            }
        }
    }
}
