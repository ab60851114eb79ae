//! Reading and rewriting node records, child indexes, and value lists.
//!
//! Nothing here dirties cells on its own. Callers mark every cell they are about to rewrite dirty
//! first, so a log space failure surfaces before anything has changed.

use std::cmp::Ordering;

use crate::{
    alloc::CellSpace,
    cell::{CellIndex, StorageType},
    error::{FormatError, HiveError, HiveResult},
    format::{
        compare_names, decode_name, name_hash, names_equal, read_cell_list, write_cell_list,
        IndexEntry, IndexLeaf, KeyNode, KeyValue, INDEX_MAX_ENTRIES, KEY_NODE_SIZE,
        KEY_VALUE_SIZE,
    },
};

pub(crate) fn read_node(space: &mut CellSpace, cell: CellIndex) -> HiveResult<(KeyNode, String)> {
    let (node, name) = KeyNode::read(cell, space.cell(cell)?)?;
    Ok((node, decode_name(cell, name)?))
}

pub(crate) fn read_header(space: &mut CellSpace, cell: CellIndex) -> HiveResult<KeyNode> {
    Ok(KeyNode::read(cell, space.cell(cell)?)?.0)
}

pub(crate) fn write_header(space: &mut CellSpace, cell: CellIndex, node: &KeyNode) -> HiveResult<()> {
    node.write(space.cell_mut(cell)?);
    Ok(())
}

/// Allocate and fill in a node cell. It isn't linked into any index.
pub(crate) fn alloc_node(
    space: &mut CellSpace,
    area: StorageType,
    parent: CellIndex,
    name: &str,
    flags: u16,
    ts: u64,
    hint: CellIndex,
) -> HiveResult<CellIndex> {
    let cell = space.allocate(KeyNode::cell_size(name.len()), area, hint)?;
    let payload = space.cell_mut(cell)?;
    KeyNode::new(parent, name.len(), flags, ts).write(payload);
    payload[KEY_NODE_SIZE..KEY_NODE_SIZE + name.len()].copy_from_slice(name.as_bytes());
    Ok(cell)
}

/// Payload bytes a cell can hold.
pub(crate) fn capacity(space: &mut CellSpace, cell: CellIndex) -> HiveResult<usize> {
    Ok((space.map.cell_size(cell)?.unsigned_abs() as usize).saturating_sub(4))
}

/// A cell able to hold `size` bytes: `old` if it is big enough, otherwise a new one. The old cell
/// is never freed here.
pub(crate) fn cell_with_room(
    space: &mut CellSpace,
    old: CellIndex,
    size: usize,
    area: StorageType,
) -> HiveResult<CellIndex> {
    if let Some(old) = old.get() {
        if capacity(space, old)? >= size {
            return Ok(old);
        }
    }
    space.allocate(size, area, old)
}

/// Mark a node and its index for `area` dirty.
pub(crate) fn dirty_with_index(
    space: &mut CellSpace,
    cell: CellIndex,
    area: StorageType,
) -> HiveResult<()> {
    space.mark_dirty(cell)?;
    let node = read_header(space, cell)?;
    space.mark_dirty(node.subkey_list(area))
}

pub(crate) fn read_index(space: &mut CellSpace, list: CellIndex) -> HiveResult<IndexLeaf> {
    if list.is_nil() {
        return Ok(IndexLeaf::default());
    }
    Ok(IndexLeaf::read(list, space.cell(list)?)?)
}

/// Children of a node, stable ones first.
pub(crate) fn children(space: &mut CellSpace, node: &KeyNode) -> HiveResult<Vec<CellIndex>> {
    let mut out = Vec::with_capacity(node.total_subkeys() as usize);
    for area in StorageType::ALL {
        let leaf = read_index(space, node.subkey_list(area))?;
        out.extend(leaf.entries.iter().map(|e| e.cell));
    }
    Ok(out)
}

/// The `index`th child, counting stable children before volatile ones.
pub(crate) fn child_at(
    space: &mut CellSpace,
    node: &KeyNode,
    index: u32,
) -> HiveResult<Option<CellIndex>> {
    let mut index = index as usize;
    for area in StorageType::ALL {
        let count = node.subkey_count(area) as usize;
        if index < count {
            let leaf = read_index(space, node.subkey_list(area))?;
            return Ok(leaf.entries.get(index).map(|e| e.cell));
        }
        index -= count;
    }
    Ok(None)
}

pub(crate) fn find_child(
    space: &mut CellSpace,
    node: &KeyNode,
    name: &str,
) -> HiveResult<Option<CellIndex>> {
    let hash = name_hash(name);
    for area in StorageType::ALL {
        let leaf = read_index(space, node.subkey_list(area))?;
        for entry in leaf.entries.iter().filter(|e| e.hash == hash) {
            let (_, child_name) = read_node(space, entry.cell)?;
            if names_equal(&child_name, name) {
                return Ok(Some(entry.cell));
            }
        }
    }
    Ok(None)
}

/// Where `name` belongs in a sorted index.
fn insert_position(space: &mut CellSpace, leaf: &IndexLeaf, name: &str) -> HiveResult<usize> {
    let (mut lo, mut hi) = (0, leaf.entries.len());
    while lo < hi {
        let mid = (lo + hi) / 2;
        let (_, other) = read_node(space, leaf.entries[mid].cell)?;
        if compare_names(&other, name) == Ordering::Less {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

/// Insert `child` into a copy of an index, keeping it sorted.
pub(crate) fn with_child(
    space: &mut CellSpace,
    mut leaf: IndexLeaf,
    child: CellIndex,
    name: &str,
) -> HiveResult<IndexLeaf> {
    if leaf.entries.len() >= INDEX_MAX_ENTRIES {
        return Err(HiveError::ResourceExhausted {
            requested: IndexLeaf::cell_size(leaf.entries.len() + 1),
        });
    }
    let pos = insert_position(space, &leaf, name)?;
    leaf.entries.insert(
        pos,
        IndexEntry {
            cell: child,
            hash: name_hash(name),
        },
    );
    Ok(leaf)
}

/// Link `child` into its parent's index for the child's area. The parent and that index must be
/// dirty. On failure nothing has changed.
pub(crate) fn add_child(
    space: &mut CellSpace,
    parent_cell: CellIndex,
    child: CellIndex,
    name: &str,
    class_len: usize,
    ts: u64,
) -> HiveResult<()> {
    let area = child.storage();
    let mut parent = read_header(space, parent_cell)?;
    let old_list = parent.subkey_list(area);
    let leaf = read_index(space, old_list)?;
    let leaf = with_child(space, leaf, child, name)?;
    let list = cell_with_room(space, old_list, IndexLeaf::cell_size(leaf.entries.len()), area)?;
    leaf.write(space.cell_mut(list)?);

    parent.subkey_lists[area.index()] = list.raw();
    parent.subkey_counts[area.index()] += 1;
    parent.max_name_len = parent.max_name_len.max(name.len() as u32);
    parent.max_class_len = parent.max_class_len.max(class_len as u32);
    parent.set_last_write(ts);
    write_header(space, parent_cell, &parent)?;
    if list != old_list && !old_list.is_nil() {
        space.free(old_list);
    }
    Ok(())
}

/// Unlink `child` from its parent's index. The parent and that index must be dirty.
pub(crate) fn remove_child(
    space: &mut CellSpace,
    parent_cell: CellIndex,
    child: CellIndex,
    ts: u64,
) -> HiveResult<()> {
    let area = child.storage();
    let mut parent = read_header(space, parent_cell)?;
    let list = parent.subkey_list(area);
    let mut leaf = read_index(space, list)?;
    let pos = leaf
        .entries
        .iter()
        .position(|e| e.cell == child)
        .ok_or(FormatError::Record(child.raw()))?;
    leaf.entries.remove(pos);
    parent.subkey_counts[area.index()] -= 1;
    parent.set_last_write(ts);
    if leaf.entries.is_empty() {
        parent.subkey_lists[area.index()] = CellIndex::NIL.raw();
        write_header(space, parent_cell, &parent)?;
        space.free(list);
    } else {
        leaf.write(space.cell_mut(list)?);
        write_header(space, parent_cell, &parent)?;
    }
    Ok(())
}

/// Point the parent's index slot for `old` at `new`, in place. The index must be dirty.
pub(crate) fn replace_child(
    space: &mut CellSpace,
    parent_cell: CellIndex,
    old: CellIndex,
    new: CellIndex,
) -> HiveResult<()> {
    let parent = read_header(space, parent_cell)?;
    let list = parent.subkey_list(old.storage());
    let mut leaf = read_index(space, list)?;
    let entry = leaf
        .entries
        .iter_mut()
        .find(|e| e.cell == old)
        .ok_or(FormatError::Record(old.raw()))?;
    entry.cell = new;
    leaf.write(space.cell_mut(list)?);
    Ok(())
}

/// Mark every child of a node dirty, ahead of rewriting their parent fields.
pub(crate) fn dirty_children(space: &mut CellSpace, node: &KeyNode) -> HiveResult<Vec<CellIndex>> {
    let children = children(space, node)?;
    for child in &children {
        space.mark_dirty(*child)?;
    }
    Ok(children)
}

/// Point each child's parent field at `parent`. The children must be dirty.
pub(crate) fn set_parent(
    space: &mut CellSpace,
    children: &[CellIndex],
    parent: CellIndex,
) -> HiveResult<()> {
    for child in children {
        let mut node = read_header(space, *child)?;
        node.parent = parent.raw();
        write_header(space, *child, &node)?;
    }
    Ok(())
}

pub(crate) fn value_cells(space: &mut CellSpace, node: &KeyNode) -> HiveResult<Vec<CellIndex>> {
    if node.value_count == 0 {
        return Ok(Vec::new());
    }
    let list = node.value_list();
    Ok(read_cell_list(list, space.cell(list)?, node.value_count as usize)?)
}

/// Write a value list into `list`, which must have room for it.
pub(crate) fn write_value_list(
    space: &mut CellSpace,
    list: CellIndex,
    cells: &[CellIndex],
) -> HiveResult<()> {
    write_cell_list(space.cell_mut(list)?, cells);
    Ok(())
}

pub(crate) fn read_value(space: &mut CellSpace, cell: CellIndex) -> HiveResult<(KeyValue, String)> {
    let (value, name) = KeyValue::read(cell, space.cell(cell)?)?;
    Ok((value, decode_name(cell, name)?))
}

/// Allocate a value cell holding `record` and `name`.
pub(crate) fn alloc_value(
    space: &mut CellSpace,
    area: StorageType,
    record: &KeyValue,
    name: &str,
    hint: CellIndex,
) -> HiveResult<CellIndex> {
    let cell = space.allocate(KeyValue::cell_size(name.len()), area, hint)?;
    let payload = space.cell_mut(cell)?;
    record.write(payload);
    payload[KEY_VALUE_SIZE..KEY_VALUE_SIZE + name.len()].copy_from_slice(name.as_bytes());
    Ok(cell)
}

pub(crate) fn write_value(
    space: &mut CellSpace,
    cell: CellIndex,
    record: &KeyValue,
) -> HiveResult<()> {
    record.write(space.cell_mut(cell)?);
    Ok(())
}

pub(crate) fn read_class(space: &mut CellSpace, node: &KeyNode) -> HiveResult<Vec<u8>> {
    let Some(class) = node.class().get() else {
        return Ok(Vec::new());
    };
    let len = node.class_length as usize;
    Ok(space
        .cell(class)?
        .get(..len)
        .ok_or(FormatError::Record(class.raw()))?
        .to_vec())
}
