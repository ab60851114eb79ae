use std::{fmt, sync::Arc};

use crate::{
    backend::{AllocBackend, HeapPool},
    error::{HiveError, HiveResult},
    DEFAULT_VIEW_SIZE, HBLOCK_SIZE,
};

/// What to do when a hive or its log turns out to be structurally damaged at load time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HealPolicy {
    /// Refuse to load a damaged hive.
    #[default]
    Strict,
    /// Patch invalid bins to minimal empty bins and replay whatever part of the log is readable.
    /// The loaded hive reports that it was self-healed.
    SelfHeal,
}

/// How the bins of the stable area are backed in memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MapMode {
    /// Every bin is read into memory from the allocation backend.
    #[default]
    Pooled,
    /// Bins are left in the primary file and mapped on demand in fixed-size views. Requires a
    /// file-backed primary; other backends fall back to pooled storage.
    Mapped,
}

/// Options for creating or loading a hive.
#[derive(Clone)]
pub struct HiveOptions {
    pub(crate) heal_policy: HealPolicy,
    pub(crate) map_mode: MapMode,
    pub(crate) view_size: usize,
    pub(crate) max_mapped_views: usize,
    pub(crate) io_buffer_size: usize,
    pub(crate) cluster: u32,
    pub(crate) max_log_size: Option<u64>,
    pub(crate) file_name: String,
    pub(crate) allocator: Arc<dyn AllocBackend>,
}

impl Default for HiveOptions {
    fn default() -> Self {
        Self {
            heal_policy: HealPolicy::Strict,
            map_mode: MapMode::Pooled,
            view_size: DEFAULT_VIEW_SIZE,
            max_mapped_views: 64,
            io_buffer_size: 128 * 1024,
            cluster: 1,
            max_log_size: None,
            file_name: String::new(),
            allocator: Arc::new(HeapPool::default()),
        }
    }
}

impl fmt::Debug for HiveOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HiveOptions")
            .field("heal_policy", &self.heal_policy)
            .field("map_mode", &self.map_mode)
            .field("view_size", &self.view_size)
            .field("max_mapped_views", &self.max_mapped_views)
            .field("io_buffer_size", &self.io_buffer_size)
            .field("cluster", &self.cluster)
            .field("max_log_size", &self.max_log_size)
            .field("file_name", &self.file_name)
            .finish_non_exhaustive()
    }
}

impl HiveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how damaged images are handled. Defaults to [`HealPolicy::Strict`].
    pub fn heal_policy(&mut self, policy: HealPolicy) -> &mut Self {
        self.heal_policy = policy;
        self
    }

    /// Set how stable bins are held in memory. Defaults to [`MapMode::Pooled`].
    pub fn map_mode(&mut self, mode: MapMode) -> &mut Self {
        self.map_mode = mode;
        self
    }

    /// Set the size of a mapped view. It must be a multiple of both the hive block size and the
    /// system page size; this is checked by [`HiveOptions::validate`]. Defaults to 256 kiB.
    pub fn view_size(&mut self, size: usize) -> &mut Self {
        self.view_size = size;
        self
    }

    /// Set how many clean views may stay mapped before the least recently used ones are
    /// dropped. Defaults to 64.
    pub fn max_mapped_views(&mut self, views: usize) -> &mut Self {
        self.max_mapped_views = views;
        self
    }

    /// Set the size of the buffer used to bulk-load the primary file. Defaults to 128 kiB.
    pub fn io_buffer_size(&mut self, size: usize) -> &mut Self {
        self.io_buffer_size = size;
        self
    }

    /// Set the sector cluster factor used to align log writes. Defaults to 1.
    pub fn cluster(&mut self, cluster: u32) -> &mut Self {
        self.cluster = cluster;
        self
    }

    /// Cap the size of the log file. Marking a cell dirty fails with
    /// [`HiveError::NoLogSpace`] once the next flush would need a bigger log. Defaults to no cap.
    pub fn max_log_size(&mut self, size: Option<u64>) -> &mut Self {
        self.max_log_size = size;
        self
    }

    /// Set the file name recorded in the base block, for debugging.
    pub fn file_name(&mut self, name: &str) -> &mut Self {
        self.file_name = name.to_owned();
        self
    }

    /// Set the backend used for pool-resident bin memory. Defaults to an unbounded [`HeapPool`].
    pub fn allocator(&mut self, allocator: Arc<dyn AllocBackend>) -> &mut Self {
        self.allocator = allocator;
        self
    }

    /// Check the options for consistency.
    pub fn validate(&self) -> HiveResult<()> {
        if self.view_size == 0
            || self.view_size % HBLOCK_SIZE != 0
            || self.view_size % page_size::get() != 0
        {
            return Err(HiveError::InvalidParameter(
                "view size must be a multiple of the block size and the system page size",
            ));
        }
        if self.io_buffer_size < HBLOCK_SIZE {
            return Err(HiveError::InvalidParameter(
                "I/O buffer must hold at least one block",
            ));
        }
        if self.cluster == 0 || self.cluster as usize * crate::HSECTOR_SIZE > HBLOCK_SIZE {
            return Err(HiveError::InvalidParameter(
                "cluster factor must be between 1 and 8",
            ));
        }
        Ok(())
    }

    /// Whether mapped views can actually be used on this system. View offsets are block-aligned
    /// past the base block, so the system page size has to divide the block size.
    pub(crate) fn can_map(&self) -> bool {
        self.map_mode == MapMode::Mapped && HBLOCK_SIZE % page_size::get() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let opts = HiveOptions::default();
        assert!(opts.validate().is_ok());
        println!("{:?}", opts);
    }

    #[test]
    fn bad_options() {
        let mut opts = HiveOptions::new();
        opts.view_size(1000);
        assert!(matches!(opts.validate(), Err(HiveError::InvalidParameter(_))));
        let mut opts = HiveOptions::new();
        opts.cluster(0);
        assert!(opts.validate().is_err());
        let mut opts = HiveOptions::new();
        opts.io_buffer_size(512);
        assert!(opts.validate().is_err());
    }
}
