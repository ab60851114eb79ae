use std::{
    collections::{HashMap, HashSet},
    fs::File,
};

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, trace};

use crate::{
    cell::{CellIndex, StorageType},
    error::{HiveError, HiveResult},
    HBLOCK_SIZE,
};

struct View {
    map: MmapMut,
    last_use: u64,
}

/// Fixed-size, copy-on-write views of the stable area of a primary file.
///
/// Views are private mappings: writes to a view never reach the file on their own, so a view
/// holding modified data must stay mapped until the hive is flushed. Clean views are
/// dropped least-recently-used first once more than `max_views` are mapped.
pub(crate) struct ViewCache {
    file: File,
    view_size: usize,
    max_views: usize,
    /// Bytes of the stable area present in the file when the views were set up
    mapped_len: u32,
    views: HashMap<u32, View>,
    /// Views holding modified cells that haven't been flushed yet
    dirty: HashSet<u32>,
    tick: u64,
}

impl ViewCache {
    pub fn new(file: File, view_size: usize, max_views: usize, mapped_len: u32) -> Self {
        Self {
            file,
            view_size,
            max_views: max_views.max(1),
            mapped_len,
            views: HashMap::new(),
            dirty: HashSet::new(),
            tick: 0,
        }
    }

    pub fn view_size(&self) -> usize {
        self.view_size
    }

    #[cfg(test)]
    pub fn mapped_len(&self) -> u32 {
        self.mapped_len
    }

    pub fn view_of(&self, offset: u32) -> u32 {
        (offset as usize / self.view_size) as u32
    }

    /// Whether a bin at `offset` of `size` bytes can be served from a single view.
    pub fn fits(&self, offset: u32, size: usize) -> bool {
        let end = offset as usize + size;
        end <= self.mapped_len as usize
            && self.view_of(offset) as usize == (end - 1) / self.view_size
    }

    #[cfg(test)]
    pub fn mapped_views(&self) -> usize {
        self.views.len()
    }

    /// Get `len` bytes at stable-area `offset`, mapping the owning view if needed. Every page of
    /// the returned range is touched so that faults surface here rather than mid-update.
    pub fn slice(&mut self, offset: u32, len: usize) -> HiveResult<&mut [u8]> {
        let index = self.view_of(offset);
        if !self.views.contains_key(&index) {
            self.map_view(index, offset)?;
        }
        self.tick += 1;
        let tick = self.tick;
        let view_start = index as usize * self.view_size;
        let view = self
            .views
            .get_mut(&index)
            .ok_or(HiveError::Unavailable(CellIndex::new(StorageType::Stable, offset)))?;
        view.last_use = tick;
        let start = offset as usize - view_start;
        let mem = view
            .map
            .get_mut(start..start + len)
            .ok_or(HiveError::Unavailable(CellIndex::new(StorageType::Stable, offset)))?;
        touch_pages(mem);
        Ok(mem)
    }

    fn map_view(&mut self, index: u32, offset: u32) -> HiveResult<()> {
        if self.views.len() >= self.max_views {
            self.evict();
        }
        let view_start = index as usize * self.view_size;
        if view_start >= self.mapped_len as usize {
            return Err(HiveError::Unavailable(CellIndex::new(StorageType::Stable, offset)));
        }
        let len = self.view_size.min(self.mapped_len as usize - view_start);
        // SAFETY: the mapping is private, so nothing else writing the file can make our view
        // inconsistent with memory we've modified, and the hive holds an exclusive lock on the
        // file for as long as this cache exists.
        let map = unsafe {
            MmapOptions::new()
                .offset((HBLOCK_SIZE + view_start) as u64)
                .len(len)
                .map_copy(&self.file)
        }
        .map_err(|e| {
            debug!("Mapping view {} failed: {}", index, e);
            HiveError::Unavailable(CellIndex::new(StorageType::Stable, offset))
        })?;
        trace!("Mapped view {} (0x{:x} bytes)", index, len);
        self.views.insert(
            index,
            View {
                map,
                last_use: self.tick,
            },
        );
        Ok(())
    }

    /// Drop the least recently used clean view. Slices handed out by [`ViewCache::slice`] borrow
    /// the cache, so no view can go while one of them is alive.
    fn evict(&mut self) {
        let victim = self
            .views
            .iter()
            .filter(|(i, _)| !self.dirty.contains(i))
            .min_by_key(|(_, v)| v.last_use)
            .map(|(i, _)| *i);
        if let Some(index) = victim {
            trace!("Dropping view {}", index);
            self.views.remove(&index);
        }
    }

    /// Note that the views covering `len` bytes at `offset` carry unflushed changes. This may be
    /// called before the views are mapped.
    pub fn mark_dirty(&mut self, offset: u32, len: u32) {
        if offset >= self.mapped_len {
            return;
        }
        let end = (offset + len.max(1)).min(self.mapped_len);
        for index in self.view_of(offset)..=self.view_of(end - 1) {
            self.dirty.insert(index);
        }
    }

    #[cfg(test)]
    pub fn is_dirty(&self, offset: u32) -> bool {
        self.dirty.contains(&self.view_of(offset))
    }

    /// Everything has been written to the file; views may be dropped again.
    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
        while self.views.len() > self.max_views {
            let before = self.views.len();
            self.evict();
            if self.views.len() == before {
                break;
            }
        }
    }

    /// Stop mapping anything at or past `len`, after the file was shrunk.
    pub fn truncate(&mut self, len: u32) {
        if len >= self.mapped_len {
            return;
        }
        let view_size = self.view_size;
        self.views
            .retain(|index, _| (*index as usize * view_size) < len as usize);
        self.dirty
            .retain(|index| (*index as usize * view_size) < len as usize);
        self.mapped_len = len;
    }
}

fn touch_pages(mem: &[u8]) {
    let page = page_size::get();
    for i in (0..mem.len()).step_by(page) {
        std::hint::black_box(mem[i]);
    }
    if let Some(last) = mem.last() {
        std::hint::black_box(*last);
    }
}
