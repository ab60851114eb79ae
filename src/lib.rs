//! A transactional, hierarchical key-value store kept in a single hive file.
//!
//! A hive holds a tree of named nodes, each carrying a list of typed values. Storage is carved
//! into cells inside page-aligned bins; every change to the durable area is tracked per sector and
//! written through a write-ahead log on flush, so a hive interrupted mid-flush is repaired on the
//! next load by replaying the log.
//!
//! Callers work through a [`Registry`], which owns every loaded hive and hands out cursors
//! ([`KcbId`]) to nodes. All operations on a cursor go through the registry:
//!
//! ```no_run
//! use crab_hive::{HiveOptions, Registry, ValueType};
//!
//! let registry = Registry::new();
//! let hive = registry.create_hive(&HiveOptions::default(), None, None)?;
//! let root = registry.open_root(hive)?;
//! registry.set_value(root, "Foo", ValueType::STRING, b"bar")?;
//! # Ok::<(), crab_hive::HiveError>(())
//! ```

mod alloc;
mod backend;
mod buffer;
mod cell;
mod config;
mod dirty;
mod error;
pub mod format;
mod hive;
mod kcb;
mod load;
mod log;
mod map;
mod node;
mod registry;
mod storage;
mod tree;
mod value;

pub use backend::{AllocBackend, FileBackend, HeapPool, MemoryBackend, StorageBackend};
pub use buffer::{NodeInfoClass, ValueEntry, ValueInfoClass};
pub use cell::{CellIndex, StorageType};
pub use config::{HealPolicy, HiveOptions, MapMode};
pub use error::{ErrorKind, FormatError, HiveError, HiveResult};
pub use hive::{Hive, HiveId};
pub use kcb::KcbId;
pub use registry::{
    AccessCheck, AccessOp, AllowAll, ChangeEvent, ChangeKind, LoadedHive, NotifySink, Registry,
    UnloadState,
};
pub use value::ValueType;

/// Size of a hive block: the base block, and the granularity of bins.
pub const HBLOCK_SIZE: usize = 4096;

/// Size of a logged sector. The dirty vector holds one bit per sector.
pub const HSECTOR_SIZE: usize = 512;

/// Cell sizes are always a multiple of this.
pub const HCELL_PAD: usize = 8;

/// Size of the header at the start of every bin.
pub const HBIN_HEADER_SIZE: usize = 32;

/// Smallest cell, including its size prefix.
pub const HCELL_MIN_SIZE: usize = 8;

/// Requests above this size are rounded up to a power of two.
pub const SIXTEEN_K: usize = 16 * 1024;

/// Largest cell the allocator will ever hand out, including its size prefix.
pub const MAX_CELL_SIZE: usize = 1 << 20;

/// Default size of a mapped view of the primary file.
pub const DEFAULT_VIEW_SIZE: usize = 256 * 1024;

/// Number of free-list buckets per storage area.
pub(crate) const FREE_DISPLAY_SIZE: usize = 24;

/// Cells below this size are bucketed linearly, larger ones by power of two.
pub(crate) const LINEAR_BUCKET_LIMIT: usize = 128;

/// Round `value` up to a multiple of the power-of-two `align`.
#[inline]
pub(crate) const fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Current time as a 64-bit timestamp (100 ns ticks since the Unix epoch).
pub(crate) fn now_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| (d.as_nanos() / 100) as u64)
        .unwrap_or(0)
}
