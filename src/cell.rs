use std::fmt;

/// Which of a hive's two storage areas a cell lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum StorageType {
    /// Persisted, logged storage
    Stable = 0,
    /// Memory-only storage, never logged or flushed
    Volatile = 1,
}

impl StorageType {
    pub const ALL: [StorageType; 2] = [StorageType::Stable, StorageType::Volatile];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

const VOLATILE_BIT: u32 = 1 << 31;

/// Opaque handle to a cell: bit 31 selects the storage area, the rest is the byte offset of the
/// cell's size prefix within that area.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct CellIndex(u32);

impl CellIndex {
    /// The "no cell" marker, as stored on disk.
    pub const NIL: CellIndex = CellIndex(u32::MAX);

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn new(storage: StorageType, offset: u32) -> Self {
        debug_assert!(offset & VOLATILE_BIT == 0);
        match storage {
            StorageType::Stable => Self(offset),
            StorageType::Volatile => Self(offset | VOLATILE_BIT),
        }
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn is_nil(self) -> bool {
        self == Self::NIL
    }

    #[inline]
    pub fn storage(self) -> StorageType {
        if self.0 & VOLATILE_BIT != 0 {
            StorageType::Volatile
        } else {
            StorageType::Stable
        }
    }

    /// Byte offset of the cell within its storage area.
    #[inline]
    pub fn offset(self) -> u32 {
        self.0 & !VOLATILE_BIT
    }

    /// Block number (4 kiB granularity) within the storage area.
    #[inline]
    pub fn block(self) -> usize {
        (self.offset() as usize) / crate::HBLOCK_SIZE
    }

    /// Offset the cell by some number of bytes, staying in the same area.
    pub fn add(self, bytes: u32) -> Self {
        Self::new(self.storage(), self.offset() + bytes)
    }

    /// Convert into an optional cell, mapping NIL to `None`.
    pub fn get(self) -> Option<CellIndex> {
        if self.is_nil() {
            None
        } else {
            Some(self)
        }
    }
}

impl fmt::Debug for CellIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            return f.write_str("Cell(NIL)");
        }
        match self.storage() {
            StorageType::Stable => write!(f, "Cell(S:0x{:x})", self.offset()),
            StorageType::Volatile => write!(f, "Cell(V:0x{:x})", self.offset()),
        }
    }
}

impl fmt::Display for CellIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl fmt::LowerHex for CellIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding() {
        let c = CellIndex::new(StorageType::Volatile, 0x1020);
        assert_eq!(c.raw(), 0x8000_1020);
        assert_eq!(c.storage(), StorageType::Volatile);
        assert_eq!(c.offset(), 0x1020);
        assert_eq!(c.block(), 1);
        let s = CellIndex::new(StorageType::Stable, 0x20);
        assert_eq!(s.storage(), StorageType::Stable);
        assert_eq!(s.add(0x10).offset(), 0x30);
        assert!(CellIndex::NIL.is_nil());
        assert_eq!(CellIndex::NIL.get(), None);
        println!("{:?} {:?} {:?}", c, s, CellIndex::NIL);
    }
}
