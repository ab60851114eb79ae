use std::sync::Arc;

use crate::{
    alloc::CellSpace,
    buffer::{self, NodeInfoClass},
    cell::CellIndex,
    error::{HiveError, HiveResult},
    kcb::{Access, CacheLookup, LoadedValue},
    node,
};

/// A node's info record.
pub(crate) fn node_record(
    space: &mut CellSpace,
    cell: CellIndex,
    class: NodeInfoClass,
) -> HiveResult<Vec<u8>> {
    let (node, name) = node::read_node(space, cell)?;
    let class_data = node::read_class(space, &node)?;
    Ok(buffer::node_record(class, &node, &name, &class_data))
}

/// The info record of a node's `index`th child.
pub(crate) fn child_record(
    space: &mut CellSpace,
    cell: CellIndex,
    index: u32,
    class: NodeInfoClass,
) -> HiveResult<Vec<u8>> {
    let node = node::read_header(space, cell)?;
    let child = node::child_at(space, &node, index)?.ok_or(HiveError::NotFound)?;
    node_record(space, child, class)
}

/// Walk a backslash-separated path down from `from`.
pub(crate) fn open_path(space: &mut CellSpace, from: CellIndex, path: &str) -> HiveResult<CellIndex> {
    let mut cell = from;
    for part in path.split('\\').filter(|p| !p.is_empty()) {
        let node = node::read_header(space, cell)?;
        cell = node::find_child(space, &node, part)?.ok_or(HiveError::NotFound)?;
    }
    Ok(cell)
}

/// Look a value up through the cursor's cache.
pub(crate) fn value_by_name(
    access: &mut Access<'_>,
    space: &mut CellSpace,
    cell: CellIndex,
    name: &str,
) -> HiveResult<CacheLookup<Arc<LoadedValue>>> {
    access.live()?;
    if let Some(state) = access.state_mut() {
        return Ok(match state.values.find_mut(space, cell, name)? {
            Some((_, v)) => CacheLookup::Found(v),
            None => CacheLookup::NotFound,
        });
    }
    Ok(match access.state().values.find(space, name)? {
        CacheLookup::Found((_, v)) => CacheLookup::Found(v),
        CacheLookup::NotFound => CacheLookup::NotFound,
        CacheLookup::NeedExclusive => CacheLookup::NeedExclusive,
    })
}

/// The `index`th value of the node, in value-list order.
pub(crate) fn value_at(
    access: &mut Access<'_>,
    space: &mut CellSpace,
    cell: CellIndex,
    index: usize,
) -> HiveResult<CacheLookup<Arc<LoadedValue>>> {
    access.live()?;
    if let Some(state) = access.state_mut() {
        return Ok(match state.values.at_mut(space, cell, index)? {
            Some(v) => CacheLookup::Found(v),
            None => CacheLookup::NotFound,
        });
    }
    access.state().values.at(space, index)
}
