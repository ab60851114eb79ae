use tracing::debug;

use crate::{
    alloc::CellSpace,
    cell::{CellIndex, StorageType},
    error::{HiveError, HiveResult},
    format::{IndexLeaf, KEY_HIVE_ENTRY, KEY_NO_DELETE, KEY_VOLATILE},
    node, value,
};

/// Create a child node under `parent` in `area`, with an optional class.
pub(crate) fn create_node(
    space: &mut CellSpace,
    parent: CellIndex,
    name: &str,
    area: StorageType,
    class: &[u8],
    ts: u64,
) -> HiveResult<CellIndex> {
    if area == StorageType::Stable && parent.storage() == StorageType::Volatile {
        return Err(HiveError::InvalidParameter(
            "a stable node can't live under a volatile one",
        ));
    }
    let parent_node = node::read_header(space, parent)?;
    if node::find_child(space, &parent_node, name)?.is_some() {
        return Err(HiveError::AlreadyExists);
    }
    node::dirty_with_index(space, parent, area)?;

    let flags = if area == StorageType::Volatile { KEY_VOLATILE } else { 0 };
    let child = node::alloc_node(space, area, parent, name, flags, ts, parent)?;
    let mut class_cell = CellIndex::NIL;
    let res = (|| -> HiveResult<()> {
        if !class.is_empty() {
            class_cell = space.allocate(class.len(), area, child)?;
            space.cell_mut(class_cell)?[..class.len()].copy_from_slice(class);
            let mut header = node::read_header(space, child)?;
            header.class = class_cell.raw();
            header.class_length = class.len() as u16;
            node::write_header(space, child, &header)?;
        }
        node::add_child(space, parent, child, name, class.len(), ts)
    })();
    if let Err(e) = res {
        if let Some(c) = class_cell.get() {
            space.free(c);
        }
        space.free(child);
        return Err(e);
    }
    Ok(child)
}

/// Delete a leaf node along with its values and class.
pub(crate) fn delete_node(space: &mut CellSpace, cell: CellIndex, ts: u64) -> HiveResult<()> {
    let node = node::read_header(space, cell)?;
    let parent = node.parent();
    if node.total_subkeys() > 0
        || node.flags & (KEY_HIVE_ENTRY | KEY_NO_DELETE) != 0
        || parent.is_nil()
    {
        return Err(HiveError::CannotDelete);
    }

    space.mark_dirty(cell)?;
    node::dirty_with_index(space, parent, cell.storage())?;
    space.mark_dirty(node.value_list())?;
    space.mark_dirty(node.class())?;
    let mut values = Vec::with_capacity(node.value_count as usize);
    for v in node::value_cells(space, &node)? {
        space.mark_dirty(v)?;
        let (record, _) = node::read_value(space, v)?;
        value::dirty_data(space, &record)?;
        values.push((v, record));
    }

    node::remove_child(space, parent, cell, ts)?;
    for (v, record) in values {
        value::free_data(space, &record)?;
        space.free(v);
    }
    if let Some(list) = node.value_list().get() {
        space.free(list);
    }
    if let Some(class) = node.class().get() {
        space.free(class);
    }
    space.free(cell);
    debug!("Deleted node {:?}", cell);
    Ok(())
}

/// Give a node a new name. The node moves to a new cell, which is returned.
///
/// The parent's index is rebuilt in a new cell holding the renamed entry, and swapped in only once
/// everything has been allocated. On failure the node, its old cell, and the parent's index are
/// exactly as they were.
pub(crate) fn rename_node(
    space: &mut CellSpace,
    cell: CellIndex,
    new_name: &str,
    ts: u64,
) -> HiveResult<CellIndex> {
    let node = node::read_header(space, cell)?;
    let parent_cell = node.parent();
    if parent_cell.is_nil() || node.flags & KEY_HIVE_ENTRY != 0 {
        return Err(HiveError::InvalidParameter("the hive root can't be renamed"));
    }
    let parent = node::read_header(space, parent_cell)?;
    match node::find_child(space, &parent, new_name)? {
        Some(other) if other != cell => return Err(HiveError::AlreadyExists),
        _ => {}
    }
    let area = cell.storage();
    space.mark_dirty(cell)?;
    node::dirty_with_index(space, parent_cell, area)?;
    let children = node::dirty_children(space, &node)?;

    let new = node::alloc_node(space, area, parent_cell, new_name, node.flags, ts, cell)?;
    let old_list = parent.subkey_list(area);
    let res = (|| -> HiveResult<CellIndex> {
        let mut copy = node;
        copy.name_length = new_name.len() as u16;
        copy.set_last_write(ts);
        node::write_header(space, new, &copy)?;

        let mut leaf = node::read_index(space, old_list)?;
        leaf.entries.retain(|e| e.cell != cell);
        let leaf = node::with_child(space, leaf, new, new_name)?;
        let list = space.allocate(IndexLeaf::cell_size(leaf.entries.len()), area, old_list)?;
        leaf.write(space.cell_mut(list)?);
        Ok(list)
    })();
    let list = match res {
        Ok(list) => list,
        Err(e) => {
            space.free(new);
            return Err(e);
        }
    };

    // Nothing below allocates
    let mut parent = parent;
    parent.subkey_lists[area.index()] = list.raw();
    parent.max_name_len = parent.max_name_len.max(new_name.len() as u32);
    node::write_header(space, parent_cell, &parent)?;
    node::set_parent(space, &children, new)?;
    space.free(old_list);
    space.free(cell);
    debug!("Renamed {:?} to \"{}\" at {:?}", cell, new_name, new);
    Ok(new)
}

/// Copy a node, its own-area child index, and its value list to fresh cells in the same area.
pub(crate) fn move_node(space: &mut CellSpace, cell: CellIndex) -> HiveResult<CellIndex> {
    let node = node::read_header(space, cell)?;
    let parent_cell = node.parent();
    if parent_cell.is_nil() {
        return Err(HiveError::InvalidParameter("the hive root can't be moved"));
    }
    let area = cell.storage();
    let index = node.subkey_list(area);
    let values = node.value_list();
    space.mark_dirty(cell)?;
    node::dirty_with_index(space, parent_cell, area)?;
    space.mark_dirty(index)?;
    space.mark_dirty(values)?;
    let children = node::dirty_children(space, &node)?;

    let mut fresh = Vec::with_capacity(3);
    let res = (|| -> HiveResult<(CellIndex, CellIndex, CellIndex)> {
        let new = space.duplicate(cell, area, true)?;
        fresh.push(new);
        let new_index = match index.get() {
            Some(index) => {
                let c = space.duplicate(index, area, true)?;
                fresh.push(c);
                c
            }
            None => CellIndex::NIL,
        };
        let new_values = match values.get() {
            Some(values) => {
                let c = space.duplicate(values, area, true)?;
                fresh.push(c);
                c
            }
            None => CellIndex::NIL,
        };
        let mut copy = node;
        copy.subkey_lists[area.index()] = new_index.raw();
        copy.value_list = new_values.raw();
        node::write_header(space, new, &copy)?;
        Ok((new, new_index, new_values))
    })();
    let new = match res {
        Ok((new, _, _)) => new,
        Err(e) => {
            for c in fresh {
                space.free(c);
            }
            return Err(e);
        }
    };

    // Point of no return: the parent now refers to the copy
    node::replace_child(space, parent_cell, cell, new)?;
    node::set_parent(space, &children, new)?;
    if let Some(index) = index.get() {
        space.free(index);
    }
    if let Some(values) = values.get() {
        space.free(values);
    }
    space.free(cell);
    debug!("Moved {:?} to {:?}", cell, new);
    Ok(new)
}

pub(crate) fn set_last_write_time(space: &mut CellSpace, cell: CellIndex, ts: u64) -> HiveResult<()> {
    space.mark_dirty(cell)?;
    let mut node = node::read_header(space, cell)?;
    node.set_last_write(ts);
    node::write_header(space, cell, &node)
}

pub(crate) fn set_user_flags(
    space: &mut CellSpace,
    cell: CellIndex,
    flags: u32,
    ts: u64,
) -> HiveResult<()> {
    space.mark_dirty(cell)?;
    let mut node = node::read_header(space, cell)?;
    node.user_flags = flags;
    node.set_last_write(ts);
    node::write_header(space, cell, &node)
}
