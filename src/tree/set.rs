use tracing::trace;

use crate::{
    alloc::CellSpace,
    cell::CellIndex,
    error::{FormatError, HiveError, HiveResult},
    format::{DataClass, KeyValue},
    kcb::{KcbState, LoadedValue},
    node,
    value::{self, ValueType, MAX_DATA_LEN},
};

/// Set a value on the node at `cell`. Returns `false` if the value already held exactly this
/// type and data, in which case nothing was touched (not even the last write time).
pub(crate) fn set_value(
    space: &mut CellSpace,
    state: &mut KcbState,
    cell: CellIndex,
    name: &str,
    value_type: ValueType,
    data: &[u8],
    ts: u64,
) -> HiveResult<bool> {
    if data.len() > MAX_DATA_LEN {
        return Err(HiveError::InvalidParameter("value data is too long"));
    }
    let existing = state.values.find_mut(space, cell, name)?;
    if let Some((_, v)) = &existing {
        if v.value_type == value_type && v.data == data {
            trace!("Value \"{}\" is unchanged", name);
            return Ok(false);
        }
    }

    space.mark_dirty(cell)?;
    let mut node = node::read_header(space, cell)?;
    let stored_name = match existing {
        Some((index, old)) => {
            // An overwrite keeps the name as first spelled
            let record = overwrite(space, old.cell, value_type, data)?;
            debug_assert_eq!(record.len(), data.len());
            state.values.store(Some(index), loaded(old.cell, &old.name, &record, data));
            old.name.len()
        }
        None => {
            let (vcell, record) = append(space, &mut node, cell, name, value_type, data)?;
            debug_assert_eq!(record.len(), data.len());
            state.values.store(None, loaded(vcell, name, &record, data));
            name.len()
        }
    };

    node.max_value_name_len = node.max_value_name_len.max(stored_name as u32);
    node.max_value_data_len = node.max_value_data_len.max(data.len() as u32);
    node.set_last_write(ts);
    node::write_header(space, cell, &node)?;
    Ok(true)
}

fn loaded(cell: CellIndex, name: &str, record: &KeyValue, data: &[u8]) -> LoadedValue {
    LoadedValue {
        cell,
        name: name.to_string(),
        value_type: ValueType(record.value_type),
        data: data.to_vec(),
    }
}

/// Replace the data of an existing value cell.
fn overwrite(
    space: &mut CellSpace,
    vcell: CellIndex,
    value_type: ValueType,
    data: &[u8],
) -> HiveResult<KeyValue> {
    space.mark_dirty(vcell)?;
    let (mut record, _) = node::read_value(space, vcell)?;
    let old_cells = value::data_cells(space, &record)?;
    for c in &old_cells {
        space.mark_dirty(*c)?;
    }
    let area = vcell.storage();
    let len = data.len();

    // Allocate whatever the new data needs; the old cells stay live until the record moves off
    // them.
    let stale = match (record.data_class(), DataClass::of_len(len)) {
        (DataClass::Small, DataClass::Small) => {
            record.set_inline(data);
            Vec::new()
        }
        (DataClass::Small, DataClass::Normal) => {
            let new = value::alloc_normal(space, area, data, vcell)?;
            record.set_external(new, len);
            Vec::new()
        }
        (DataClass::Small, DataClass::Big) => {
            let (big, _) = value::write_big(space, area, data, None, vcell)?;
            record.set_external(big, len);
            Vec::new()
        }
        (DataClass::Normal, DataClass::Small) => {
            record.set_inline(data);
            old_cells
        }
        (DataClass::Normal, DataClass::Normal) => {
            // The allocator frees an outgrown cell itself
            let new = value::rewrite_normal(space, record.data_cell(), data)?;
            record.set_external(new, len);
            Vec::new()
        }
        (DataClass::Normal, DataClass::Big) => {
            let (big, _) = value::write_big(space, area, data, None, vcell)?;
            record.set_external(big, len);
            old_cells
        }
        (DataClass::Big, DataClass::Small) => {
            record.set_inline(data);
            old_cells
        }
        (DataClass::Big, DataClass::Normal) => {
            let new = value::alloc_normal(space, area, data, vcell)?;
            record.set_external(new, len);
            old_cells
        }
        (DataClass::Big, DataClass::Big) => {
            let old = (record.data_cell(), record.len());
            let (big, stale) = value::write_big(space, area, data, Some(old), vcell)?;
            record.set_external(big, len);
            stale
        }
    };
    record.value_type = value_type.0;
    node::write_value(space, vcell, &record)?;
    for c in stale {
        space.free(c);
    }
    Ok(record)
}

/// Add a new value to a node. On failure every cell allocated here is freed again.
fn append(
    space: &mut CellSpace,
    node: &mut crate::format::KeyNode,
    cell: CellIndex,
    name: &str,
    value_type: ValueType,
    data: &[u8],
) -> HiveResult<(CellIndex, KeyValue)> {
    let area = cell.storage();
    let old_list = node.value_list();
    space.mark_dirty(old_list)?;
    let mut cells = node::value_cells(space, node)?;

    let mut record = KeyValue::new(name.len(), value_type.0);
    let vcell = node::alloc_value(space, area, &record, name, cell)?;
    let data_res = match DataClass::of_len(data.len()) {
        DataClass::Small => {
            record.set_inline(data);
            Ok(())
        }
        DataClass::Normal => value::alloc_normal(space, area, data, vcell)
            .map(|c| record.set_external(c, data.len())),
        DataClass::Big => value::write_big(space, area, data, None, vcell)
            .map(|(big, _)| record.set_external(big, data.len())),
    };
    let list = data_res
        .and_then(|_| node::cell_with_room(space, old_list, (cells.len() + 1) * 4, area));
    let list = match list {
        Ok(list) => list,
        Err(e) => {
            value::free_data(space, &record)?;
            space.free(vcell);
            return Err(e);
        }
    };

    node::write_value(space, vcell, &record)?;
    cells.push(vcell);
    node::write_value_list(space, list, &cells)?;
    if list != old_list && !old_list.is_nil() {
        space.free(old_list);
    }
    node.value_list = list.raw();
    node.value_count = cells.len() as u32;
    Ok((vcell, record))
}

/// Remove a value from the node at `cell`.
pub(crate) fn delete_value(
    space: &mut CellSpace,
    state: &mut KcbState,
    cell: CellIndex,
    name: &str,
    ts: u64,
) -> HiveResult<()> {
    let (_, target) = state
        .values
        .find_mut(space, cell, name)?
        .ok_or(HiveError::NotFound)?;
    let vcell = target.cell;

    space.mark_dirty(cell)?;
    let mut node = node::read_header(space, cell)?;
    let list = node.value_list();
    space.mark_dirty(list)?;
    space.mark_dirty(vcell)?;
    let (record, _) = node::read_value(space, vcell)?;
    value::dirty_data(space, &record)?;

    let mut cells = node::value_cells(space, &node)?;
    let pos = cells
        .iter()
        .position(|c| *c == vcell)
        .ok_or(FormatError::Record(vcell.raw()))?;
    cells.remove(pos);
    if cells.is_empty() {
        node.value_list = CellIndex::NIL.raw();
    } else {
        node::write_value_list(space, list, &cells)?;
    }
    node.value_count = cells.len() as u32;
    node.set_last_write(ts);
    node::write_header(space, cell, &node)?;

    if cells.is_empty() {
        space.free(list);
    }
    value::free_data(space, &record)?;
    space.free(vcell);
    state.values.invalidate();
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        backend::HeapPool,
        cell::StorageType,
        format::BIG_DATA_SEGMENT,
        tree::test_util,
    };

    fn get(space: &mut CellSpace, cell: CellIndex, name: &str) -> Option<(ValueType, Vec<u8>)> {
        // Always read fresh, without any cache
        let mut cache = crate::kcb::ValueCache::default();
        cache
            .find_mut(space, cell, name)
            .unwrap()
            .map(|(_, v)| (v.value_type, v.data.clone()))
    }

    #[test]
    fn every_size_transition() {
        let sizes = [3, 200, BIG_DATA_SEGMENT + 100];
        for from in sizes {
            for to in sizes {
                let (mut space, root) = test_util::space();
                let mut state = KcbState::default();
                let area = StorageType::Stable;
                let baseline = space.free_bytes(area);
                let a = vec![0xa5u8; from];
                let b: Vec<u8> = (0..to).map(|i| i as u8).collect();
                set_value(&mut space, &mut state, root, "v", ValueType::BINARY, &a, 2).unwrap();
                set_value(&mut space, &mut state, root, "v", ValueType::DWORD, &b, 3).unwrap();
                assert_eq!(get(&mut space, root, "v"), Some((ValueType::DWORD, b.clone())));
                // The cache agrees with the hive
                let (_, cached) = state.values.find_mut(&mut space, root, "v").unwrap().unwrap();
                assert_eq!(cached.data, b);

                delete_value(&mut space, &mut state, root, "v", 4).unwrap();
                assert_eq!(get(&mut space, root, "v"), None);
                println!("{} -> {}: free 0x{:x}", from, to, space.free_bytes(area));
                // Everything but the root is free again
                space.shrink();
                assert_eq!(space.free_bin_bytes(area), 0);
                assert_eq!(space.free_bytes(area), baseline);
            }
        }
    }

    #[test]
    fn identical_set_is_a_no_op() {
        let (mut space, root) = test_util::space();
        let mut state = KcbState::default();
        assert!(set_value(&mut space, &mut state, root, "Foo", ValueType::STRING, b"bar", 10).unwrap());
        space.dirty.clear_all();
        assert!(!set_value(&mut space, &mut state, root, "foo", ValueType::STRING, b"bar", 20).unwrap());
        assert!(space.dirty.is_clean());
        let node = node::read_header(&mut space, root).unwrap();
        assert_eq!(node.last_write(), 10);

        // A different type isn't identical
        assert!(set_value(&mut space, &mut state, root, "Foo", ValueType::BINARY, b"bar", 30).unwrap());
        let node = node::read_header(&mut space, root).unwrap();
        assert_eq!(node.last_write(), 30);
        assert_eq!(node.value_count, 1);
    }

    #[test]
    fn out_of_line_to_inline() {
        let (mut space, root) = test_util::space();
        let mut state = KcbState::default();
        let area = StorageType::Stable;
        set_value(&mut space, &mut state, root, "v", ValueType::BINARY, &[7u8; 2000], 1).unwrap();
        let node = node::read_header(&mut space, root).unwrap();
        let cells = node::value_cells(&mut space, &node).unwrap();
        let (record, _) = node::read_value(&mut space, cells[0]).unwrap();
        let old = record.data_cell();
        let free_before = space.free_bytes(area);
        set_value(&mut space, &mut state, root, "v", ValueType::DWORD, &[1, 2, 3, 4], 2).unwrap();
        assert_eq!(get(&mut space, root, "v"), Some((ValueType::DWORD, vec![1, 2, 3, 4])));
        assert!(space.map.cell_size(old).unwrap() > 0, "old data cell is free");
        assert!(space.free_bytes(area) > free_before);
        let node = node::read_header(&mut space, root).unwrap();
        assert_eq!(node.max_value_data_len, 2000);
    }

    #[test]
    fn values_keep_their_order() {
        let (mut space, root) = test_util::space();
        let mut state = KcbState::default();
        for (i, name) in ["one", "two", "three", "four"].iter().enumerate() {
            set_value(&mut space, &mut state, root, name, ValueType::DWORD, &(i as u32).to_le_bytes(), 1)
                .unwrap();
        }
        delete_value(&mut space, &mut state, root, "TWO", 2).unwrap();
        assert!(matches!(
            delete_value(&mut space, &mut state, root, "two", 3),
            Err(HiveError::NotFound)
        ));
        let node = node::read_header(&mut space, root).unwrap();
        let names: Vec<_> = node::value_cells(&mut space, &node)
            .unwrap()
            .into_iter()
            .map(|c| node::read_value(&mut space, c).unwrap().1)
            .collect();
        assert_eq!(names, ["one", "three", "four"]);
        assert_eq!(node.max_value_name_len, 5);
    }

    #[test]
    fn failed_append_leaves_no_trace() {
        let mut space = CellSpace::new(Arc::new(HeapPool::with_quota(64 * 1024)), None, None, 1);
        let root = node::alloc_node(
            &mut space,
            StorageType::Stable,
            CellIndex::NIL,
            "",
            0,
            1,
            CellIndex::NIL,
        )
        .unwrap();
        let mut state = KcbState::default();
        set_value(&mut space, &mut state, root, "small", ValueType::DWORD, &[1, 0, 0, 0], 1).unwrap();
        let before = space.free_bytes(StorageType::Stable);
        let huge = vec![1u8; BIG_DATA_SEGMENT * 8];
        let e = set_value(&mut space, &mut state, root, "huge", ValueType::BINARY, &huge, 2)
            .unwrap_err();
        assert_eq!(e.kind(), crate::error::ErrorKind::ResourceExhausted);
        space.shrink();
        assert_eq!(space.free_bytes(StorageType::Stable), before);
        let node = node::read_header(&mut space, root).unwrap();
        assert_eq!(node.value_count, 1);
        assert_eq!(node.last_write(), 1);
        assert_eq!(get(&mut space, root, "huge"), None);
    }
}
