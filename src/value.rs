//! Value data: inline, in one cell, or split into big-data segments.

use std::fmt;

use tracing::trace;

use crate::{
    alloc::CellSpace,
    cell::{CellIndex, StorageType},
    error::{FormatError, HiveError, HiveResult},
    format::{
        read_cell_list, write_cell_list, BigData, DataClass, KeyValue, BIG_DATA_SEGMENT,
        BIG_DATA_SIZE, INLINE_DATA_MAX,
    },
    node::{capacity, cell_with_room},
};

/// The type tag stored with a value. The hive doesn't interpret it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ValueType(pub u32);

impl ValueType {
    pub const NONE: Self = Self(0);
    pub const STRING: Self = Self(1);
    pub const EXPAND_STRING: Self = Self(2);
    pub const BINARY: Self = Self(3);
    pub const DWORD: Self = Self(4);
    pub const DWORD_BIG_ENDIAN: Self = Self(5);
    pub const LINK: Self = Self(6);
    pub const MULTI_STRING: Self = Self(7);
    pub const QWORD: Self = Self(11);
}

impl fmt::Debug for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::NONE => "NONE",
            Self::STRING => "STRING",
            Self::EXPAND_STRING => "EXPAND_STRING",
            Self::BINARY => "BINARY",
            Self::DWORD => "DWORD",
            Self::DWORD_BIG_ENDIAN => "DWORD_BIG_ENDIAN",
            Self::LINK => "LINK",
            Self::MULTI_STRING => "MULTI_STRING",
            Self::QWORD => "QWORD",
            Self(other) => return write!(f, "ValueType({})", other),
        };
        f.write_str(name)
    }
}

impl From<u32> for ValueType {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// Longest data a value can hold: the big-data segment count is 16 bits.
pub(crate) const MAX_DATA_LEN: usize = u16::MAX as usize * BIG_DATA_SEGMENT;

/// Read a value's data.
pub(crate) fn read_data(space: &mut CellSpace, value: &KeyValue) -> HiveResult<Vec<u8>> {
    let len = value.len();
    if len == 0 {
        return Ok(Vec::new());
    }
    if value.is_inline() {
        if len > INLINE_DATA_MAX {
            return Err(FormatError::Record(value.data).into());
        }
        return Ok(value.inline_data()[..len].to_vec());
    }
    let cell = value.data_cell();
    if len <= BIG_DATA_SEGMENT {
        return Ok(space
            .cell(cell)?
            .get(..len)
            .ok_or(FormatError::Record(cell.raw()))?
            .to_vec());
    }
    let (_, segments) = big_cells(space, cell, len)?;
    let mut out = Vec::with_capacity(len);
    for seg in segments {
        let take = (len - out.len()).min(BIG_DATA_SEGMENT);
        out.extend_from_slice(
            space
                .cell(seg)?
                .get(..take)
                .ok_or(FormatError::Record(seg.raw()))?,
        );
    }
    Ok(out)
}

/// The segment list and segments of a big-data cell.
fn big_cells(
    space: &mut CellSpace,
    cell: CellIndex,
    len: usize,
) -> HiveResult<(CellIndex, Vec<CellIndex>)> {
    let big = BigData::read(cell, space.cell(cell)?)?;
    let count = big.count as usize;
    if count != BigData::segments_for(len) {
        return Err(FormatError::Record(cell.raw()).into());
    }
    let list = big.list();
    let segments = read_cell_list(list, space.cell(list)?, count)?;
    Ok((list, segments))
}

/// Every cell holding a value's data, for dirtying, freeing, or copying.
pub(crate) fn data_cells(space: &mut CellSpace, value: &KeyValue) -> HiveResult<Vec<CellIndex>> {
    match value.data_class() {
        DataClass::Small => Ok(Vec::new()),
        DataClass::Normal => Ok(vec![value.data_cell()]),
        DataClass::Big => {
            let cell = value.data_cell();
            let (list, segments) = big_cells(space, cell, value.len())?;
            let mut out = vec![cell, list];
            out.extend(segments);
            Ok(out)
        }
    }
}

pub(crate) fn dirty_data(space: &mut CellSpace, value: &KeyValue) -> HiveResult<()> {
    for cell in data_cells(space, value)? {
        space.mark_dirty(cell)?;
    }
    Ok(())
}

/// Free a value's data cells, which must be dirty.
pub(crate) fn free_data(space: &mut CellSpace, value: &KeyValue) -> HiveResult<()> {
    for cell in data_cells(space, value)? {
        space.free(cell);
    }
    Ok(())
}

/// Store `data` in a single new cell.
pub(crate) fn alloc_normal(
    space: &mut CellSpace,
    area: StorageType,
    data: &[u8],
    hint: CellIndex,
) -> HiveResult<CellIndex> {
    let cell = space.allocate(data.len(), area, hint)?;
    space.cell_mut(cell)?[..data.len()].copy_from_slice(data);
    Ok(cell)
}

/// Rewrite a normal data cell, growing it into a new cell if it's too small. Returns the cell now
/// holding the data. The old cell must be dirty; if it was outgrown it has been freed.
pub(crate) fn rewrite_normal(
    space: &mut CellSpace,
    old: CellIndex,
    data: &[u8],
) -> HiveResult<CellIndex> {
    let cell = space.reallocate(old, data.len())?;
    space.cell_mut(cell)?[..data.len()].copy_from_slice(data);
    Ok(cell)
}

/// Store big data, reusing the cells of `old` (a big-data cell) where they still fit.
///
/// Every allocation is made before anything is written, so on failure the old data is intact and
/// nothing has leaked. Returns the big-data cell and the old cells that are no longer used, for
/// the caller to free once the value record points at the new data.
pub(crate) fn write_big(
    space: &mut CellSpace,
    area: StorageType,
    data: &[u8],
    old: Option<(CellIndex, usize)>,
    hint: CellIndex,
) -> HiveResult<(CellIndex, Vec<CellIndex>)> {
    let need = BigData::segments_for(data.len());
    if need > u16::MAX as usize {
        return Err(HiveError::InvalidParameter("value data is too long"));
    }
    let (old_big, old_list, old_segments) = match old {
        Some((cell, len)) => {
            let (list, segments) = big_cells(space, cell, len)?;
            (cell, list, segments)
        }
        None => (CellIndex::NIL, CellIndex::NIL, Vec::new()),
    };

    let mut fresh = Vec::new();
    let res = (|| -> HiveResult<(CellIndex, CellIndex, Vec<CellIndex>)> {
        let mut segments = Vec::with_capacity(need);
        for (i, chunk) in data.chunks(BIG_DATA_SEGMENT).enumerate() {
            let reuse = match old_segments.get(i) {
                Some(seg) if capacity(space, *seg)? >= chunk.len() => Some(*seg),
                _ => None,
            };
            let seg = match reuse {
                Some(seg) => seg,
                None => {
                    let seg = space.allocate(chunk.len(), area, hint)?;
                    fresh.push(seg);
                    seg
                }
            };
            segments.push(seg);
        }
        let list = cell_with_room(space, old_list, need * 4, area)?;
        if list != old_list {
            fresh.push(list);
        }
        let big = if old_big.is_nil() {
            let big = space.allocate(BIG_DATA_SIZE, area, hint)?;
            fresh.push(big);
            big
        } else {
            old_big
        };
        Ok((big, list, segments))
    })();
    let (big, list, segments) = match res {
        Ok(cells) => cells,
        Err(e) => {
            for cell in fresh {
                space.free(cell);
            }
            return Err(e);
        }
    };

    for (seg, chunk) in segments.iter().zip(data.chunks(BIG_DATA_SEGMENT)) {
        space.cell_mut(*seg)?[..chunk.len()].copy_from_slice(chunk);
    }
    write_cell_list(space.cell_mut(list)?, &segments);
    BigData::new(need, list).write(space.cell_mut(big)?);

    let mut stale: Vec<CellIndex> = old_segments
        .into_iter()
        .filter(|s| !segments.contains(s))
        .collect();
    if list != old_list && !old_list.is_nil() {
        stale.push(old_list);
    }
    trace!(
        "Big data: {} segments, {} reused cells dropped",
        need,
        stale.len()
    );
    Ok((big, stale))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::HeapPool;

    fn space() -> CellSpace {
        CellSpace::new(Arc::new(HeapPool::default()), None, None, 1)
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn external(space: &mut CellSpace, data: &[u8]) -> KeyValue {
        let mut value = KeyValue::new(0, ValueType::BINARY.0);
        let area = StorageType::Stable;
        let cell = if data.len() <= BIG_DATA_SEGMENT {
            alloc_normal(space, area, data, CellIndex::NIL).unwrap()
        } else {
            write_big(space, area, data, None, CellIndex::NIL).unwrap().0
        };
        value.set_external(cell, data.len());
        value
    }

    #[test]
    fn value_type_debug() {
        assert_eq!(format!("{:?}", ValueType::STRING), "STRING");
        assert_eq!(format!("{:?}", ValueType(99)), "ValueType(99)");
    }

    #[test]
    fn small_and_normal() {
        let mut space = space();
        let mut value = KeyValue::new(0, ValueType::DWORD.0);
        value.set_inline(&[1, 2, 3]);
        assert_eq!(read_data(&mut space, &value).unwrap(), vec![1, 2, 3]);
        assert!(data_cells(&mut space, &value).unwrap().is_empty());

        let data = pattern(100, 1);
        let value = external(&mut space, &data);
        assert_eq!(read_data(&mut space, &value).unwrap(), data);
        assert_eq!(data_cells(&mut space, &value).unwrap().len(), 1);

        let shorter = pattern(50, 2);
        let cell = rewrite_normal(&mut space, value.data_cell(), &shorter).unwrap();
        assert_eq!(cell, value.data_cell());
        assert_eq!(&space.cell(cell).unwrap()[..50], &shorter[..]);
    }

    #[test]
    fn outgrown_data_cell_is_freed() {
        let mut space = space();
        let data = pattern(100, 1);
        let value = external(&mut space, &data);
        let cell = value.data_cell();
        assert!(space.is_cell_dirty(cell));

        let longer = pattern(500, 3);
        let moved = rewrite_normal(&mut space, cell, &longer).unwrap();
        assert_ne!(moved, cell);
        println!("data moved from {:?} to {:?}", cell, moved);
        assert_eq!(&space.cell(moved).unwrap()[..500], &longer[..]);
        // the outgrown cell went back to the free list
        assert!(space.map.cell_size(cell).unwrap() > 0);
    }

    #[test]
    fn big_data_segments() {
        let mut space = space();
        let data = pattern(BIG_DATA_SEGMENT * 2 + 10, 7);
        let value = external(&mut space, &data);
        assert_eq!(value.data_class(), DataClass::Big);
        let cells = data_cells(&mut space, &value).unwrap();
        assert_eq!(cells.len(), 2 + 3);
        assert_eq!(read_data(&mut space, &value).unwrap(), data);

        // Shrinking to two segments reuses the first two and drops the third
        let smaller = pattern(BIG_DATA_SEGMENT + 1, 9);
        let (big, stale) = write_big(
            &mut space,
            StorageType::Stable,
            &smaller,
            Some((value.data_cell(), value.len())),
            CellIndex::NIL,
        )
        .unwrap();
        assert_eq!(big, value.data_cell());
        assert_eq!(stale, vec![cells[4]]);
        let mut value = value;
        value.set_external(big, smaller.len());
        assert_eq!(read_data(&mut space, &value).unwrap(), smaller);

        free_data(&mut space, &value).unwrap();
        for cell in stale {
            space.free(cell);
        }
        assert_all_free(&mut space);
    }

    /// Everything but the first bin is gone after a shrink, and the first bin is empty.
    fn assert_all_free(space: &mut CellSpace) {
        let area = StorageType::Stable;
        let first = space.map.bins(area).unwrap()[0].1 as usize;
        assert_eq!(space.shrink() as usize, first);
        assert_eq!(space.free_bytes(area), first - crate::HBIN_HEADER_SIZE);
    }

    #[test]
    fn failed_big_write_leaves_no_trace() {
        let pool = Arc::new(HeapPool::with_quota(64 * 1024));
        let mut space = CellSpace::new(pool.clone(), None, None, 1);
        let data = pattern(BIG_DATA_SEGMENT * 8, 1);
        let before = pool.used();
        let res = write_big(&mut space, StorageType::Stable, &data, None, CellIndex::NIL);
        assert!(matches!(res, Err(HiveError::ResourceExhausted { .. })));
        assert_all_free(&mut space);
        println!("pool: {} -> {}", before, pool.used());
        assert_eq!(pool.used(), space.map.length(StorageType::Stable) as usize);
    }
}
