use std::sync::Arc;

use tracing::trace;

use crate::{
    alloc::CellSpace,
    cell::CellIndex,
    error::HiveResult,
    format::{names_equal, KeyValue},
    node,
    value::{self, ValueType},
};

use super::CacheLookup;

/// A value read out of the hive in full.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct LoadedValue {
    pub cell: CellIndex,
    pub name: String,
    pub value_type: ValueType,
    pub data: Vec<u8>,
}

impl LoadedValue {
    fn read(space: &mut CellSpace, cell: CellIndex, record: &KeyValue, name: String) -> HiveResult<Self> {
        Ok(Self {
            cell,
            name,
            value_type: ValueType(record.value_type),
            data: value::read_data(space, record)?,
        })
    }
}

struct Entry {
    cell: CellIndex,
    loaded: Option<Arc<LoadedValue>>,
}

/// The values of one node, in value-list order.
///
/// Built lazily from the value list: entries start out as bare cell handles and are promoted to
/// fully read values the first time a holder of the exclusive cursor lock touches them. A shared
/// holder reads unpromoted entries straight from the hive without caching them.
#[derive(Default)]
pub(crate) struct ValueCache {
    entries: Option<Vec<Entry>>,
}

impl ValueCache {
    #[cfg(test)]
    pub fn is_valid(&self) -> bool {
        self.entries.is_some()
    }

    pub fn invalidate(&mut self) {
        if let Some(entries) = self.entries.take() {
            trace!("Dropping {} cached values", entries.len());
        }
    }

    fn rebuild(&mut self, space: &mut CellSpace, node_cell: CellIndex) -> HiveResult<&mut Vec<Entry>> {
        let node = node::read_header(space, node_cell)?;
        let cells = node::value_cells(space, &node)?;
        Ok(self.entries.insert(
            cells
                .into_iter()
                .map(|cell| Entry { cell, loaded: None })
                .collect(),
        ))
    }

    fn entries_mut(
        &mut self,
        space: &mut CellSpace,
        node_cell: CellIndex,
    ) -> HiveResult<&mut Vec<Entry>> {
        match self.entries {
            Some(ref mut entries) => Ok(entries),
            None => self.rebuild(space, node_cell),
        }
    }

    /// Find a value by name without touching the cache.
    pub fn find(
        &self,
        space: &mut CellSpace,
        name: &str,
    ) -> HiveResult<CacheLookup<(usize, Arc<LoadedValue>)>> {
        let Some(entries) = self.entries.as_ref() else {
            return Ok(CacheLookup::NeedExclusive);
        };
        for (i, entry) in entries.iter().enumerate() {
            match &entry.loaded {
                Some(v) if names_equal(&v.name, name) => {
                    return Ok(CacheLookup::Found((i, v.clone())));
                }
                Some(_) => {}
                None => {
                    let (record, n) = node::read_value(space, entry.cell)?;
                    if names_equal(&n, name) {
                        let v = LoadedValue::read(space, entry.cell, &record, n)?;
                        return Ok(CacheLookup::Found((i, Arc::new(v))));
                    }
                }
            }
        }
        Ok(CacheLookup::NotFound)
    }

    /// Find a value by name, filling the cache and promoting the entry as needed.
    pub fn find_mut(
        &mut self,
        space: &mut CellSpace,
        node_cell: CellIndex,
        name: &str,
    ) -> HiveResult<Option<(usize, Arc<LoadedValue>)>> {
        let entries = self.entries_mut(space, node_cell)?;
        for (i, entry) in entries.iter_mut().enumerate() {
            match &entry.loaded {
                Some(v) if names_equal(&v.name, name) => return Ok(Some((i, v.clone()))),
                Some(_) => {}
                None => {
                    let (record, n) = node::read_value(space, entry.cell)?;
                    if names_equal(&n, name) {
                        let v = Arc::new(LoadedValue::read(space, entry.cell, &record, n)?);
                        entry.loaded = Some(v.clone());
                        return Ok(Some((i, v)));
                    }
                }
            }
        }
        Ok(None)
    }

    /// The `index`th value, without touching the cache.
    pub fn at(
        &self,
        space: &mut CellSpace,
        index: usize,
    ) -> HiveResult<CacheLookup<Arc<LoadedValue>>> {
        let Some(entries) = self.entries.as_ref() else {
            return Ok(CacheLookup::NeedExclusive);
        };
        let Some(entry) = entries.get(index) else {
            return Ok(CacheLookup::NotFound);
        };
        if let Some(v) = &entry.loaded {
            return Ok(CacheLookup::Found(v.clone()));
        }
        let (record, name) = node::read_value(space, entry.cell)?;
        Ok(CacheLookup::Found(Arc::new(LoadedValue::read(
            space, entry.cell, &record, name,
        )?)))
    }

    pub fn at_mut(
        &mut self,
        space: &mut CellSpace,
        node_cell: CellIndex,
        index: usize,
    ) -> HiveResult<Option<Arc<LoadedValue>>> {
        let entries = self.entries_mut(space, node_cell)?;
        let Some(entry) = entries.get_mut(index) else {
            return Ok(None);
        };
        if entry.loaded.is_none() {
            let (record, name) = node::read_value(space, entry.cell)?;
            entry.loaded = Some(Arc::new(LoadedValue::read(space, entry.cell, &record, name)?));
        }
        Ok(entry.loaded.clone())
    }

    /// Record a value just written at `index` of the value list, or appended to it.
    pub fn store(&mut self, index: Option<usize>, value: LoadedValue) {
        let Some(entries) = self.entries.as_mut() else {
            return;
        };
        let entry = Entry {
            cell: value.cell,
            loaded: Some(Arc::new(value)),
        };
        match index {
            Some(i) if i < entries.len() => entries[i] = entry,
            _ => entries.push(entry),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{backend::HeapPool, cell::StorageType, format::KeyValue};

    fn node_with_values(names: &[&str]) -> (CellSpace, CellIndex) {
        let mut space = CellSpace::new(Arc::new(HeapPool::default()), None, None, 1);
        let area = StorageType::Stable;
        let cell =
            node::alloc_node(&mut space, area, CellIndex::NIL, "n", 0, 0, CellIndex::NIL).unwrap();
        let mut cells = Vec::new();
        for (i, name) in names.iter().enumerate() {
            let mut record = KeyValue::new(name.len(), ValueType::DWORD.0);
            record.set_inline(&(i as u32).to_le_bytes());
            cells.push(node::alloc_value(&mut space, area, &record, name, cell).unwrap());
        }
        let list = space.allocate(cells.len() * 4, area, cell).unwrap();
        node::write_value_list(&mut space, list, &cells).unwrap();
        let mut header = node::read_header(&mut space, cell).unwrap();
        header.value_list = list.raw();
        header.value_count = cells.len() as u32;
        node::write_header(&mut space, cell, &header).unwrap();
        (space, cell)
    }

    #[test]
    fn shared_lookups_need_a_built_cache() {
        let (mut space, cell) = node_with_values(&["one", "two"]);
        let mut cache = ValueCache::default();
        assert!(matches!(cache.find(&mut space, "one").unwrap(), CacheLookup::NeedExclusive));
        assert!(matches!(cache.at(&mut space, 0).unwrap(), CacheLookup::NeedExclusive));

        let (i, v) = cache.find_mut(&mut space, cell, "TWO").unwrap().unwrap();
        assert_eq!(i, 1);
        assert_eq!(v.data, 1u32.to_le_bytes());
        assert!(cache.is_valid());

        // Unpromoted entries are still readable under a shared lock
        match cache.find(&mut space, "one").unwrap() {
            CacheLookup::Found((i, v)) => {
                assert_eq!(i, 0);
                assert_eq!(v.name, "one");
            }
            _ => panic!("value not found"),
        }
        assert!(matches!(cache.find(&mut space, "three").unwrap(), CacheLookup::NotFound));
        assert!(matches!(cache.at(&mut space, 2).unwrap(), CacheLookup::NotFound));
    }

    #[test]
    fn stored_values_replace_entries() {
        let (mut space, cell) = node_with_values(&["a"]);
        let mut cache = ValueCache::default();
        let (_, v) = cache.find_mut(&mut space, cell, "a").unwrap().unwrap();
        let mut updated = (*v).clone();
        updated.data = vec![9, 9];
        cache.store(Some(0), updated.clone());
        let (_, v) = cache.find_mut(&mut space, cell, "a").unwrap().unwrap();
        assert_eq!(*v, updated);

        cache.invalidate();
        assert!(!cache.is_valid());
        // Back to what the hive holds
        let v = cache.at_mut(&mut space, cell, 0).unwrap().unwrap();
        assert_eq!(v.data, 0u32.to_le_bytes());
    }
}
