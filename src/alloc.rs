//! The cell allocator.
//!
//! Free cells are kept in per-area buckets: exact sizes below 128 bytes, power-of-two ranges
//! above. Allocation takes the first fitting free cell (preferring one inside the same view as a
//! locality hint), and otherwise grows the area by a bin. Freeing coalesces with at most one
//! neighbor on each side; a bin that ends up entirely free leaves the free lists and becomes a
//! free bin, ready to be reused whole by a later bin addition.
//!
//! In the stable area nothing may be modified before it is marked dirty. Allocation dirties the
//! whole free cell it carves from before touching it, and freeing a cell requires the caller to
//! have dirtied it already, so that free itself can never fail.

use std::collections::BTreeMap;

use tracing::{debug, trace, warn};

use crate::{
    backend::AllocBackend,
    cell::{CellIndex, StorageType},
    dirty::DirtyVector,
    error::{FormatError, HiveError, HiveResult},
    format::{write_cell_size, BinHeader},
    log,
    map::{Backing, BinMap},
    storage::ViewCache,
    round_up, DEFAULT_VIEW_SIZE, FREE_DISPLAY_SIZE, HBIN_HEADER_SIZE, HBLOCK_SIZE, HCELL_MIN_SIZE,
    HCELL_PAD, HSECTOR_SIZE, LINEAR_BUCKET_LIMIT, MAX_CELL_SIZE, SIXTEEN_K,
};

/// Largest size either storage area may reach; bit 31 of a cell handle selects the area.
const MAX_AREA_SIZE: u64 = 0x7FFF_F000;

/// A bin that is entirely free, kept out of the free-cell lists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FreeBin {
    pub offset: u32,
    pub size: u32,
    /// Covers a whole pool allocation, so its memory can be dropped
    pub discardable: bool,
}

impl FreeBin {
    fn end(&self) -> u32 {
        self.offset + self.size
    }
}

/// Size of the cell (with its size prefix) that holds a payload of `size` bytes.
pub(crate) fn adjust_size(size: usize) -> HiveResult<usize> {
    let mut cell = round_up(size + 4, HCELL_PAD).max(HCELL_MIN_SIZE);
    if cell > SIXTEEN_K {
        cell = cell.next_power_of_two();
    }
    if cell > MAX_CELL_SIZE {
        return Err(HiveError::ResourceExhausted { requested: size });
    }
    Ok(cell)
}

/// Free-list bucket for a cell of `size` bytes.
pub(crate) fn bucket(size: usize) -> usize {
    if size < LINEAR_BUCKET_LIMIT {
        size / HCELL_PAD - 1
    } else {
        let log2 = (usize::BITS - 1 - size.leading_zeros()) as usize;
        let first_log = (LINEAR_BUCKET_LIMIT / HCELL_PAD) - 1;
        (first_log + log2 - LINEAR_BUCKET_LIMIT.trailing_zeros() as usize)
            .min(FREE_DISPLAY_SIZE - 1)
    }
}

#[derive(Default)]
struct FreeDisplay {
    /// Per bucket, free cell offset to size
    buckets: [BTreeMap<u32, u32>; FREE_DISPLAY_SIZE],
    bytes: usize,
}

/// The cells of a hive: the bin map, free space tracking for both areas, and the dirty vector of
/// the stable area.
pub(crate) struct CellSpace {
    pub map: BinMap,
    pub dirty: DirtyVector,
    free: [FreeDisplay; 2],
    free_bins: [BTreeMap<u32, FreeBin>; 2],
    max_log_size: Option<u64>,
    cluster: u32,
}

impl CellSpace {
    pub fn new(
        allocator: std::sync::Arc<dyn AllocBackend>,
        views: Option<ViewCache>,
        max_log_size: Option<u64>,
        cluster: u32,
    ) -> Self {
        Self {
            map: BinMap::new(allocator, views),
            dirty: DirtyVector::new(0),
            free: [FreeDisplay::default(), FreeDisplay::default()],
            free_bins: [BTreeMap::new(), BTreeMap::new()],
            max_log_size,
            cluster,
        }
    }

    pub fn cluster(&self) -> u32 {
        self.cluster
    }

    pub fn set_max_log_size(&mut self, limit: Option<u64>) {
        self.max_log_size = limit;
    }

    /// Bytes held in free cells of an area.
    pub fn free_bytes(&self, area: StorageType) -> usize {
        self.free[area.index()].bytes
    }

    /// Bytes held in entirely free bins of an area.
    pub fn free_bin_bytes(&self, area: StorageType) -> usize {
        self.free_bins[area.index()]
            .values()
            .map(|b| b.size as usize)
            .sum()
    }

    #[cfg(test)]
    pub fn free_bin_list(&self, area: StorageType) -> Vec<FreeBin> {
        self.free_bins[area.index()].values().copied().collect()
    }

    fn enlist(&mut self, area: StorageType, offset: u32, size: u32) {
        let display = &mut self.free[area.index()];
        let prev = display.buckets[bucket(size as usize)].insert(offset, size);
        debug_assert!(prev.is_none(), "free cell enlisted twice");
        display.bytes += size as usize;
    }

    fn delist(&mut self, area: StorageType, offset: u32, size: u32) {
        let display = &mut self.free[area.index()];
        let removed = display.buckets[bucket(size as usize)].remove(&offset);
        debug_assert!(removed.is_some(), "free cell missing from its bucket");
        if removed.is_some() {
            display.bytes -= size as usize;
        }
    }

    /// Find a free cell of at least `need` bytes, preferring one in the same view as `hint`.
    fn find_free(&self, area: StorageType, need: usize, hint: CellIndex) -> Option<(u32, u32)> {
        let display = &self.free[area.index()];
        let first = bucket(need);
        let fits = |(&off, &size): (&u32, &u32)| (size as usize >= need).then_some((off, size));
        if let Some(hint) = hint.get().filter(|h| h.storage() == area) {
            let window = self
                .map
                .views()
                .map(|v| v.view_size())
                .unwrap_or(DEFAULT_VIEW_SIZE) as u32;
            let lo = hint.offset() - hint.offset() % window;
            let hi = lo.saturating_add(window);
            for b in first..FREE_DISPLAY_SIZE {
                if let Some(found) = display.buckets[b].range(lo..hi).find_map(fits) {
                    return Some(found);
                }
            }
        }
        (first..FREE_DISPLAY_SIZE).find_map(|b| display.buckets[b].iter().find_map(fits))
    }

    /// Allocate a cell with room for `size` bytes of payload.
    pub fn allocate(
        &mut self,
        size: usize,
        area: StorageType,
        hint: CellIndex,
    ) -> HiveResult<CellIndex> {
        let need = adjust_size(size)?;
        let (offset, cell_size) = match self.find_free(area, need, hint) {
            Some(found) => found,
            None => self.add_bin(area, need)?,
        };
        // Everything that can fail happens before the free lists change
        self.map.bytes(area, offset, cell_size as usize)?;
        if area == StorageType::Stable {
            self.mark_range_dirty(offset, cell_size)?;
        }
        self.delist(area, offset, cell_size);

        let rest = cell_size as usize - need;
        let mem = self.map.bytes(area, offset, cell_size as usize)?;
        if rest >= HCELL_MIN_SIZE {
            write_cell_size(mem, -(need as i32));
            write_cell_size(&mut mem[need..], rest as i32);
            self.enlist(area, offset + need as u32, rest as u32);
        } else {
            write_cell_size(mem, -(cell_size as i32));
        }
        let cell = CellIndex::new(area, offset);
        trace!("Allocated {:?} (0x{:x} bytes)", cell, need);
        Ok(cell)
    }

    /// Add a bin with room for a cell of `need` bytes, returning the free cell spanning it.
    fn add_bin(&mut self, area: StorageType, need: usize) -> HiveResult<(u32, u32)> {
        let bin_size = round_up(need + HBIN_HEADER_SIZE, HBLOCK_SIZE) as u32;
        let reuse = self.free_bins[area.index()]
            .values()
            .find(|b| b.size >= bin_size)
            .copied();
        if let Some(free_bin) = reuse {
            return self.reuse_free_bin(area, free_bin, bin_size);
        }

        let offset = self.map.length(area);
        if offset as u64 + bin_size as u64 > MAX_AREA_SIZE {
            return Err(HiveError::ResourceExhausted {
                requested: bin_size as usize,
            });
        }
        let id = self.map.alloc_chunk(area, offset, bin_size as usize)?;
        if area == StorageType::Stable {
            self.dirty
                .resize((offset + bin_size) as usize / HSECTOR_SIZE);
            if let Err(e) = self.mark_range_dirty(offset, bin_size) {
                self.dirty.resize(offset as usize / HSECTOR_SIZE);
                self.map.free_chunk(area, id);
                return Err(e);
            }
        }
        self.map.map_bin(area, offset, bin_size, Backing::Pool(id));
        let mem = self.map.bytes(area, offset, bin_size as usize)?;
        BinHeader::new(offset, bin_size).write(mem);
        let free = bin_size - HBIN_HEADER_SIZE as u32;
        write_cell_size(&mut mem[HBIN_HEADER_SIZE..], free as i32);
        self.enlist(area, offset + HBIN_HEADER_SIZE as u32, free);
        debug!("Added {:?} bin at 0x{:x} (0x{:x} bytes)", area, offset, bin_size);
        Ok((offset + HBIN_HEADER_SIZE as u32, free))
    }

    /// Turn (part of) a free bin back into a live bin of at least `bin_size` bytes.
    fn reuse_free_bin(
        &mut self,
        area: StorageType,
        free_bin: FreeBin,
        bin_size: u32,
    ) -> HiveResult<(u32, u32)> {
        let rest = free_bin.size - bin_size;
        let take = if rest >= HBLOCK_SIZE as u32 {
            bin_size
        } else {
            free_bin.size
        };
        let rest = free_bin.size - take;
        let backing = self
            .map
            .entry(area, free_bin.offset)
            .map(|e| e.backing)
            .ok_or(HiveError::Corrupt(FormatError::Unmapped))?;

        let mut new_chunk = None;
        if backing == Backing::Discarded {
            new_chunk = Some(
                self.map
                    .alloc_chunk(area, free_bin.offset, free_bin.size as usize)?,
            );
        }
        if area == StorageType::Stable {
            let mut dirty = self.mark_range_dirty(free_bin.offset, take);
            if dirty.is_ok() && rest > 0 {
                dirty = self.mark_range_dirty(free_bin.offset + take, HSECTOR_SIZE as u32);
            }
            if let Err(e) = dirty {
                if let Some(id) = new_chunk {
                    self.map.free_chunk(area, id);
                }
                return Err(e);
            }
        }

        let backing = new_chunk.map(Backing::Pool).unwrap_or(backing);
        self.free_bins[area.index()].remove(&free_bin.offset);
        self.map.map_bin(area, free_bin.offset, take, backing);
        let mem = self.map.bytes(area, free_bin.offset, HBIN_HEADER_SIZE + 4)?;
        BinHeader::new(free_bin.offset, take).write(mem);
        write_cell_size(&mut mem[HBIN_HEADER_SIZE..], (take as usize - HBIN_HEADER_SIZE) as i32);
        if rest > 0 {
            let rest_offset = free_bin.offset + take;
            self.map.map_bin(area, rest_offset, rest, backing);
            self.map.set_free_bin(area, rest_offset, rest, true);
            let mem = self.map.bytes(area, rest_offset, HBIN_HEADER_SIZE + 4)?;
            BinHeader::new(rest_offset, rest).write(mem);
            write_cell_size(&mut mem[HBIN_HEADER_SIZE..], (rest as usize - HBIN_HEADER_SIZE) as i32);
            self.free_bins[area.index()].insert(
                rest_offset,
                FreeBin {
                    offset: rest_offset,
                    size: rest,
                    discardable: false,
                },
            );
        }
        let free = take - HBIN_HEADER_SIZE as u32;
        self.enlist(area, free_bin.offset + HBIN_HEADER_SIZE as u32, free);
        debug!(
            "Reused free {:?} bin at 0x{:x} (0x{:x} of 0x{:x} bytes)",
            area, free_bin.offset, take, free_bin.size
        );
        Ok((free_bin.offset + HBIN_HEADER_SIZE as u32, free))
    }

    /// Free a cell. In the stable area the cell must already be dirty.
    pub fn free(&mut self, cell: CellIndex) {
        if let Err(e) = self.try_free(cell) {
            debug_assert!(false, "freeing {:?} failed: {}", cell, e);
            warn!("Freeing {:?} failed: {}", cell, e);
        }
    }

    fn try_free(&mut self, cell: CellIndex) -> HiveResult<()> {
        let area = cell.storage();
        let offset = cell.offset();
        let size = self.map.cell_size(cell)?;
        debug_assert!(size < 0, "freeing {:?}, which is already free", cell);
        let size = size.unsigned_abs();
        debug_assert!(
            area == StorageType::Volatile || self.is_range_dirty(offset, size),
            "freeing {:?}, which was never marked dirty",
            cell
        );
        let (bin, bin_size) = self.map.bin_of(cell)?;
        let bin_end = bin + bin_size;
        let mut start = offset;
        let mut total = size;

        let next = offset + size;
        if next < bin_end {
            let next_size = self.map.cell_size(CellIndex::new(area, next))?;
            if next_size > 0 {
                self.delist(area, next, next_size as u32);
                total += next_size as u32;
            }
        }

        let mut prev = None;
        let mut at = bin + HBIN_HEADER_SIZE as u32;
        while at < offset {
            let s = self.map.cell_size(CellIndex::new(area, at))?;
            if s == 0 {
                return Err(FormatError::CellChain { offset: bin }.into());
            }
            prev = Some((at, s));
            at += s.unsigned_abs();
        }
        if let Some((prev_offset, prev_size)) = prev {
            // The neighbor's size prefix gets rewritten, so its sector has to be dirty already
            let writable = area == StorageType::Volatile
                || self.dirty.get(prev_offset as usize / HSECTOR_SIZE);
            if prev_size > 0 && writable {
                self.delist(area, prev_offset, prev_size as u32);
                start = prev_offset;
                total += prev_size as u32;
            }
        }

        write_cell_size(self.map.bytes(area, start, 4)?, total as i32);
        if bin != 0 && total == bin_size - HBIN_HEADER_SIZE as u32 {
            self.free_whole_bin(area, bin, bin_size);
        } else {
            self.enlist(area, start, total);
        }
        trace!("Freed {:?}", cell);
        Ok(())
    }

    /// Move an entirely free bin to the free-bin list, merging it with free bins sharing its pool
    /// allocation.
    fn free_whole_bin(&mut self, area: StorageType, bin: u32, bin_size: u32) {
        self.map.set_free_bin(area, bin, bin_size, true);
        let mut free_bin = FreeBin {
            offset: bin,
            size: bin_size,
            discardable: false,
        };
        let backing = self.map.entry(area, bin).map(|e| e.backing);
        let Some(Backing::Pool(id)) = backing else {
            self.free_bins[area.index()].insert(bin, free_bin);
            return;
        };
        let Some((chunk_start, chunk_end)) = self.map.chunk(area, id).map(|c| (c.start, c.end()))
        else {
            self.free_bins[area.index()].insert(bin, free_bin);
            return;
        };
        let bins = &mut self.free_bins[area.index()];
        if let Some(below) = bins
            .range(..free_bin.offset)
            .next_back()
            .map(|(_, b)| *b)
            .filter(|b| b.end() == free_bin.offset && b.offset >= chunk_start)
        {
            bins.remove(&below.offset);
            free_bin.offset = below.offset;
            free_bin.size += below.size;
        }
        if let Some(above) = bins
            .get(&free_bin.end())
            .copied()
            .filter(|b| b.end() <= chunk_end)
        {
            bins.remove(&above.offset);
            free_bin.size += above.size;
        }
        free_bin.discardable = free_bin.offset == chunk_start && free_bin.end() == chunk_end;

        if free_bin.discardable && area == StorageType::Volatile {
            // Volatile memory is never written anywhere, so it can go right away
            self.map
                .map_bin(area, free_bin.offset, free_bin.size, Backing::Discarded);
            self.map
                .set_free_bin(area, free_bin.offset, free_bin.size, true);
            self.map.free_chunk(area, id);
        }
        self.free_bins[area.index()].insert(free_bin.offset, free_bin);
    }

    /// Grow (or keep) a cell so it can hold `size` bytes of payload. Growing moves the payload to
    /// a new cell and frees the old one, which must already be dirty.
    pub fn reallocate(&mut self, cell: CellIndex, size: usize) -> HiveResult<CellIndex> {
        let need = adjust_size(size)?;
        let old = self.map.cell_size(cell)?.unsigned_abs() as usize;
        if need <= old {
            return Ok(cell);
        }
        let new = self.allocate(size, cell.storage(), cell)?;
        let data = self.map.cell(cell)?.to_vec();
        self.map.cell(new)?[..data.len()].copy_from_slice(&data);
        self.free(cell);
        Ok(new)
    }

    /// Allocate a cell in `area` the same size as `cell`, optionally copying its payload.
    pub fn duplicate(
        &mut self,
        cell: CellIndex,
        area: StorageType,
        copy_data: bool,
    ) -> HiveResult<CellIndex> {
        let data = self.map.cell(cell)?.to_vec();
        let new = self.allocate(data.len(), area, CellIndex::NIL)?;
        if copy_data {
            self.map.cell(new)?[..data.len()].copy_from_slice(&data);
        }
        Ok(new)
    }

    /// Payload of an allocated cell, for reading.
    pub fn cell(&mut self, cell: CellIndex) -> HiveResult<&[u8]> {
        self.map.cell(cell).map(|c| &*c)
    }

    /// Payload of an allocated cell, for writing. A stable cell must already be dirty.
    pub fn cell_mut(&mut self, cell: CellIndex) -> HiveResult<&mut [u8]> {
        debug_assert!(
            cell.storage() == StorageType::Volatile || self.is_cell_dirty(cell),
            "writing {:?}, which isn't dirty",
            cell
        );
        self.map.cell(cell)
    }

    /// Mark a cell dirty so it will be logged and flushed. Volatile cells need nothing.
    pub fn mark_dirty(&mut self, cell: CellIndex) -> HiveResult<()> {
        if cell.storage() == StorageType::Volatile || cell.is_nil() {
            return Ok(());
        }
        let size = self.map.cell_size(cell)?.unsigned_abs();
        self.mark_range_dirty(cell.offset(), size)
    }

    /// Mark a byte range of the stable area dirty, failing if the log would grow past its limit.
    pub fn mark_range_dirty(&mut self, offset: u32, len: u32) -> HiveResult<()> {
        let (first, count) = sector_span(offset, len);
        let newly = self.dirty.clear_in(first, count);
        if newly == 0 {
            return Ok(());
        }
        if let Some(limit) = self.max_log_size {
            let required = log::log_size(self.dirty.len(), self.dirty.count() + newly, self.cluster);
            if required > limit {
                debug!(
                    "Log space exhausted: 0x{:x} bytes needed, limit is 0x{:x}",
                    required, limit
                );
                return Err(HiveError::NoLogSpace);
            }
        }
        self.dirty.set(first, count);
        self.map.note_dirty(offset, len);
        Ok(())
    }

    /// Mark a range dirty regardless of the log size limit. Used while loading.
    pub fn force_dirty(&mut self, offset: u32, len: u32) {
        let (first, count) = sector_span(offset, len);
        self.dirty.set(first, count);
        self.map.note_dirty(offset, len);
    }

    pub fn is_range_dirty(&self, offset: u32, len: u32) -> bool {
        let (first, count) = sector_span(offset, len);
        self.dirty.all_set(first, count)
    }

    pub fn is_cell_dirty(&mut self, cell: CellIndex) -> bool {
        if cell.storage() == StorageType::Volatile {
            return true;
        }
        match self.map.cell_size(cell) {
            Ok(size) => self.is_range_dirty(cell.offset(), size.unsigned_abs()),
            Err(_) => false,
        }
    }

    /// Scan the cells of a freshly loaded bin, checking the cell chain and listing its free
    /// space. An entirely free bin (other than the first) becomes a free bin.
    pub fn enlist_bin(&mut self, area: StorageType, offset: u32, size: u32) -> HiveResult<()> {
        let end = offset + size;
        let mut at = offset + HBIN_HEADER_SIZE as u32;
        let mut free = Vec::new();
        while at < end {
            let s = self.map.cell_size(CellIndex::new(area, at))?;
            let len = s.unsigned_abs();
            if s == 0 || len as usize % HCELL_PAD != 0 || at as u64 + len as u64 > end as u64 {
                return Err(FormatError::CellChain { offset }.into());
            }
            if s > 0 {
                free.push((at, len));
            }
            at += len;
        }
        if offset != 0 && free.len() == 1 && free[0].1 == size - HBIN_HEADER_SIZE as u32 {
            self.free_whole_bin(area, offset, size);
        } else {
            for (at, len) in free {
                self.enlist(area, at, len);
            }
        }
        Ok(())
    }

    /// Drop entirely free bins from the end of the stable area, returning the new length.
    pub fn shrink(&mut self) -> u32 {
        let area = StorageType::Stable;
        let old = self.map.length(area);
        loop {
            let length = self.map.length(area);
            let tail = self.free_bins[area.index()]
                .values()
                .next_back()
                .copied()
                .filter(|b| b.end() == length);
            let Some(free_bin) = tail else {
                break;
            };
            self.free_bins[area.index()].remove(&free_bin.offset);
            self.map.truncate(area, free_bin.offset);
            self.dirty.resize(free_bin.offset as usize / HSECTOR_SIZE);
        }
        let length = self.map.length(area);
        if length != old {
            debug!("Shrunk stable area from 0x{:x} to 0x{:x}", old, length);
        }
        length
    }

    /// Offsets of all free cells in an area, for consistency checks.
    #[cfg(test)]
    pub fn free_cells(&self, area: StorageType) -> std::collections::BTreeSet<(u32, u32)> {
        self.free[area.index()]
            .buckets
            .iter()
            .flat_map(|b| b.iter().map(|(o, s)| (*o, *s)))
            .collect()
    }
}

fn sector_span(offset: u32, len: u32) -> (usize, usize) {
    let first = offset as usize / HSECTOR_SIZE;
    let last = (offset as usize + len.max(1) as usize - 1) / HSECTOR_SIZE;
    (first, last - first + 1)
}
