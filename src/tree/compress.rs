//! Whole-hive compaction: copy the live tree into a fresh, densely packed cell space.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, info};

use crate::{
    alloc::CellSpace,
    cell::{CellIndex, StorageType},
    config::HiveOptions,
    error::{FormatError, HiveResult},
    format::{DataClass, IndexEntry, IndexLeaf, KeyValue},
    hive::{write_out, HiveStore},
    node, value,
};

/// A compacted copy of a hive's tree.
pub(crate) struct Compacted {
    pub space: CellSpace,
    pub root: CellIndex,
    /// Old node cell to new node cell, for every node in the tree
    pub remap: HashMap<CellIndex, CellIndex>,
}

/// Copy every node reachable from `root`, breadth first, into a new space.
///
/// Nodes are placed first, each followed by its class and values; child indexes are built in a
/// second pass once every node's new cell is known.
pub(crate) fn compact(
    old: &mut CellSpace,
    root: CellIndex,
    options: &HiveOptions,
) -> HiveResult<Compacted> {
    let mut new = CellSpace::new(options.allocator.clone(), None, None, options.cluster);
    let mut remap = HashMap::new();
    let mut order = Vec::new();
    let mut queue = VecDeque::from([(root, CellIndex::NIL)]);
    while let Some((cell, parent)) = queue.pop_front() {
        let copy = copy_node(old, &mut new, cell, parent)?;
        remap.insert(cell, copy);
        order.push((cell, copy));
        let node = node::read_header(old, cell)?;
        for child in node::children(old, &node)? {
            queue.push_back((child, copy));
        }
    }
    for (cell, copy) in &order {
        copy_indexes(old, &mut new, &remap, *cell, *copy)?;
    }
    let root = remap
        .get(&root)
        .copied()
        .ok_or(FormatError::Root(root.raw()))?;
    debug!(
        "Compacted {} nodes into 0x{:x} bytes",
        order.len(),
        new.map.length(StorageType::Stable)
    );
    Ok(Compacted {
        space: new,
        root,
        remap,
    })
}

fn copy_node(
    old: &mut CellSpace,
    new: &mut CellSpace,
    cell: CellIndex,
    parent: CellIndex,
) -> HiveResult<CellIndex> {
    let (node, name) = node::read_node(old, cell)?;
    let area = cell.storage();
    let copy = node::alloc_node(new, area, parent, &name, node.flags, node.last_write(), parent)?;
    let mut header = node;
    header.parent = parent.raw();
    header.subkey_lists = [CellIndex::NIL.raw(); 2];
    header.subkey_counts = [0; 2];
    header.value_list = CellIndex::NIL.raw();
    header.value_count = 0;
    header.class = CellIndex::NIL.raw();

    if !node.class().is_nil() {
        let class = node::read_class(old, &node)?;
        let c = new.allocate(class.len(), area, copy)?;
        new.cell_mut(c)?[..class.len()].copy_from_slice(&class);
        header.class = c.raw();
    }

    let mut values = Vec::with_capacity(node.value_count as usize);
    for v in node::value_cells(old, &node)? {
        let (record, vname) = node::read_value(old, v)?;
        let data = value::read_data(old, &record)?;
        let mut fresh = KeyValue::new(vname.len(), record.value_type);
        fresh.flags = record.flags;
        let nv = node::alloc_value(new, area, &fresh, &vname, copy)?;
        match DataClass::of_len(data.len()) {
            DataClass::Small => fresh.set_inline(&data),
            DataClass::Normal => {
                let d = value::alloc_normal(new, area, &data, nv)?;
                fresh.set_external(d, data.len());
            }
            DataClass::Big => {
                let (big, _) = value::write_big(new, area, &data, None, nv)?;
                fresh.set_external(big, data.len());
            }
        }
        node::write_value(new, nv, &fresh)?;
        values.push(nv);
    }
    if !values.is_empty() {
        let list = new.allocate(values.len() * 4, area, copy)?;
        node::write_value_list(new, list, &values)?;
        header.value_list = list.raw();
        header.value_count = values.len() as u32;
    }
    node::write_header(new, copy, &header)?;
    Ok(copy)
}

fn copy_indexes(
    old: &mut CellSpace,
    new: &mut CellSpace,
    remap: &HashMap<CellIndex, CellIndex>,
    cell: CellIndex,
    copy: CellIndex,
) -> HiveResult<()> {
    let node = node::read_header(old, cell)?;
    let mut header = node::read_header(new, copy)?;
    for area in StorageType::ALL {
        let leaf = node::read_index(old, node.subkey_list(area))?;
        if leaf.entries.is_empty() {
            continue;
        }
        let entries = leaf
            .entries
            .iter()
            .map(|e| {
                let cell = remap
                    .get(&e.cell)
                    .copied()
                    .ok_or(FormatError::Record(e.cell.raw()))?;
                Ok(IndexEntry { cell, hash: e.hash })
            })
            .collect::<HiveResult<Vec<_>>>()?;
        let leaf = IndexLeaf { entries };
        let list = new.allocate(IndexLeaf::cell_size(leaf.entries.len()), area, copy)?;
        leaf.write(new.cell_mut(list)?);
        header.subkey_lists[area.index()] = list.raw();
        header.subkey_counts[area.index()] = leaf.entries.len() as u32;
    }
    node::write_header(new, copy, &header)
}

/// Compact a hive in place and write the result out.
///
/// Until the new image has been written through the log and the primary, the store still holds
/// the old space. If writing fails partway, the whole old stable area is marked dirty so the next
/// flush puts it back on disk. Returns the node remapping.
pub(crate) fn compress_store(store: &mut HiveStore) -> HiveResult<HashMap<CellIndex, CellIndex>> {
    let old_length = store.space.map.length(StorageType::Stable);
    let mut compacted = compact(&mut store.space, store.base.root(), &store.options)?;
    let mut base = store.base;
    base.root_cell = compacted.root.raw();
    match store.primary.as_mut() {
        Some(primary) => {
            if let Err(e) = write_out(
                primary.as_mut(),
                store.log.as_mut(),
                &mut base,
                &mut compacted.space,
            ) {
                store.space.force_dirty(0, old_length);
                return Err(e);
            }
        }
        None => {
            base.length = compacted.space.map.length(StorageType::Stable);
            base.update_checksum();
            compacted.space.dirty.clear_all();
        }
    }
    compacted.space.set_max_log_size(store.options.max_log_size);
    info!(
        "Compressed hive from 0x{:x} to 0x{:x} bytes",
        old_length, base.length
    );
    store.space = compacted.space;
    store.base = base;
    Ok(compacted.remap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        format::BIG_DATA_SEGMENT,
        kcb::{KcbState, ValueCache},
        tree::{create_node, delete_node, set_value, test_util},
        value::ValueType,
    };

    type Values = Vec<(String, ValueType, Vec<u8>)>;

    fn dump(space: &mut CellSpace, cell: CellIndex, out: &mut Vec<(String, Values)>) {
        let (node, name) = node::read_node(space, cell).unwrap();
        let mut cache = ValueCache::default();
        let mut values = Vec::new();
        for i in 0..node.value_count as usize {
            let v = cache.at_mut(space, cell, i).unwrap().unwrap();
            values.push((v.name.clone(), v.value_type, v.data.clone()));
        }
        out.push((name, values));
        for child in node::children(space, &node).unwrap() {
            dump(space, child, out);
        }
    }

    #[test]
    fn compaction_preserves_the_tree() {
        let (mut space, root) = test_util::space();
        let area = StorageType::Stable;
        let mut kids = Vec::new();
        for i in 0..20u8 {
            let c = create_node(&mut space, root, &format!("k{:02}", i), area, b"", 1).unwrap();
            let mut state = KcbState::default();
            set_value(&mut space, &mut state, c, "v", ValueType::BINARY, &[i; 300], 2).unwrap();
            kids.push(c);
        }
        for c in kids.iter().step_by(2) {
            delete_node(&mut space, *c, 3).unwrap();
        }
        let mut state = KcbState::default();
        let big = vec![7u8; BIG_DATA_SEGMENT + 5];
        set_value(&mut space, &mut state, root, "big", ValueType::BINARY, &big, 4).unwrap();
        let vol = create_node(&mut space, root, "vol", StorageType::Volatile, b"cls", 5).unwrap();

        let mut before = Vec::new();
        dump(&mut space, root, &mut before);
        let mut compacted = compact(&mut space, root, &HiveOptions::default()).unwrap();
        let mut after = Vec::new();
        dump(&mut compacted.space, compacted.root, &mut after);
        assert_eq!(before, after);

        assert_eq!(compacted.remap.len(), 12);
        assert_eq!(compacted.remap[&vol].storage(), StorageType::Volatile);
        let old_len = space.map.length(area);
        let new_len = compacted.space.map.length(area);
        println!("0x{:x} -> 0x{:x}", old_len, new_len);
        assert!(new_len <= old_len);
        let copy = node::read_header(&mut compacted.space, compacted.root).unwrap();
        assert_eq!(copy.subkey_counts, [10, 1]);
        assert_eq!(copy.last_write(), node::read_header(&mut space, root).unwrap().last_write());
    }
}
