use std::cmp::Ordering;

use bytemuck::{Pod, Zeroable};
use byteorder::{ByteOrder, LittleEndian};

use crate::{
    cell::{CellIndex, StorageType},
    error::FormatError,
};

pub const NODE_SIGNATURE: [u8; 2] = *b"nk";
pub const VALUE_SIGNATURE: [u8; 2] = *b"vk";
pub const HASH_LEAF_SIGNATURE: [u8; 2] = *b"lh";
pub const BIG_DATA_SIGNATURE: [u8; 2] = *b"db";

// Node flags
pub const KEY_VOLATILE: u16 = 0x0001;
pub const KEY_HIVE_EXIT: u16 = 0x0002;
pub const KEY_HIVE_ENTRY: u16 = 0x0004;
pub const KEY_NO_DELETE: u16 = 0x0008;
pub const KEY_SYM_LINK: u16 = 0x0010;

/// Data lengths with this bit set are stored inline in the value record.
pub const VALUE_DATA_INLINE: u32 = 0x8000_0000;
/// Largest data stored inline in the value record.
pub const INLINE_DATA_MAX: usize = 4;
/// Largest data stored in a single data cell; also the big-data segment size.
pub const BIG_DATA_SEGMENT: usize = 16344;

/// Fixed part of a node cell. The name bytes follow directly.
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq)]
#[repr(C)]
pub struct KeyNode {
    pub signature: [u8; 2],
    pub flags: u16,
    pub last_write_low: u32,
    pub last_write_high: u32,
    pub user_flags: u32,
    pub parent: u32,
    pub subkey_counts: [u32; 2],
    pub subkey_lists: [u32; 2],
    pub value_count: u32,
    pub value_list: u32,
    pub security: u32,
    pub class: u32,
    pub max_name_len: u32,
    pub max_class_len: u32,
    pub max_value_name_len: u32,
    pub max_value_data_len: u32,
    pub work_var: u32,
    pub name_length: u16,
    pub class_length: u16,
}

pub const KEY_NODE_SIZE: usize = std::mem::size_of::<KeyNode>();
const _: () = assert!(KEY_NODE_SIZE == 76);

impl KeyNode {
    pub fn new(parent: CellIndex, name_length: usize, flags: u16, timestamp: u64) -> Self {
        let mut node = Self::zeroed();
        node.signature = NODE_SIGNATURE;
        node.flags = flags;
        node.set_last_write(timestamp);
        node.parent = parent.raw();
        node.subkey_lists = [CellIndex::NIL.raw(); 2];
        node.value_list = CellIndex::NIL.raw();
        node.security = CellIndex::NIL.raw();
        node.class = CellIndex::NIL.raw();
        node.name_length = name_length as u16;
        node
    }

    /// Size of a node cell holding a name of `name_len` bytes.
    pub fn cell_size(name_len: usize) -> usize {
        KEY_NODE_SIZE + name_len
    }

    /// Read the node record and its name from a cell payload.
    pub fn read(cell: CellIndex, payload: &[u8]) -> Result<(Self, &[u8]), FormatError> {
        if payload.len() < KEY_NODE_SIZE {
            return Err(FormatError::Record(cell.raw()));
        }
        let node: KeyNode = bytemuck::pod_read_unaligned(&payload[..KEY_NODE_SIZE]);
        if node.signature != NODE_SIGNATURE {
            return Err(FormatError::Record(cell.raw()));
        }
        let name = payload
            .get(KEY_NODE_SIZE..KEY_NODE_SIZE + node.name_length as usize)
            .ok_or(FormatError::Record(cell.raw()))?;
        Ok((node, name))
    }

    pub fn write(&self, payload: &mut [u8]) {
        payload[..KEY_NODE_SIZE].copy_from_slice(bytemuck::bytes_of(self));
    }

    pub fn last_write(&self) -> u64 {
        ((self.last_write_high as u64) << 32) | self.last_write_low as u64
    }

    pub fn set_last_write(&mut self, ts: u64) {
        self.last_write_low = ts as u32;
        self.last_write_high = (ts >> 32) as u32;
    }

    pub fn parent(&self) -> CellIndex {
        CellIndex::from_raw(self.parent)
    }

    pub fn subkey_list(&self, storage: StorageType) -> CellIndex {
        CellIndex::from_raw(self.subkey_lists[storage.index()])
    }

    pub fn subkey_count(&self, storage: StorageType) -> u32 {
        self.subkey_counts[storage.index()]
    }

    pub fn total_subkeys(&self) -> u32 {
        self.subkey_counts[0] + self.subkey_counts[1]
    }

    pub fn value_list(&self) -> CellIndex {
        CellIndex::from_raw(self.value_list)
    }

    pub fn class(&self) -> CellIndex {
        CellIndex::from_raw(self.class)
    }
}

/// Fixed part of a value cell. The name bytes follow directly.
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq)]
#[repr(C)]
pub struct KeyValue {
    pub signature: [u8; 2],
    pub name_length: u16,
    pub data_length: u32,
    /// Inline data, or the data cell
    pub data: u32,
    pub value_type: u32,
    pub flags: u16,
    pub spare: u16,
}

pub const KEY_VALUE_SIZE: usize = std::mem::size_of::<KeyValue>();
const _: () = assert!(KEY_VALUE_SIZE == 20);

impl KeyValue {
    pub fn new(name_length: usize, value_type: u32) -> Self {
        Self {
            signature: VALUE_SIGNATURE,
            name_length: name_length as u16,
            data_length: 0,
            data: CellIndex::NIL.raw(),
            value_type,
            flags: 0,
            spare: 0,
        }
    }

    pub fn cell_size(name_len: usize) -> usize {
        KEY_VALUE_SIZE + name_len
    }

    pub fn read(cell: CellIndex, payload: &[u8]) -> Result<(Self, &[u8]), FormatError> {
        if payload.len() < KEY_VALUE_SIZE {
            return Err(FormatError::Record(cell.raw()));
        }
        let value: KeyValue = bytemuck::pod_read_unaligned(&payload[..KEY_VALUE_SIZE]);
        if value.signature != VALUE_SIGNATURE {
            return Err(FormatError::Record(cell.raw()));
        }
        let name = payload
            .get(KEY_VALUE_SIZE..KEY_VALUE_SIZE + value.name_length as usize)
            .ok_or(FormatError::Record(cell.raw()))?;
        Ok((value, name))
    }

    pub fn write(&self, payload: &mut [u8]) {
        payload[..KEY_VALUE_SIZE].copy_from_slice(bytemuck::bytes_of(self));
    }

    /// Actual data length, without the inline marker.
    pub fn len(&self) -> usize {
        (self.data_length & !VALUE_DATA_INLINE) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_inline(&self) -> bool {
        self.data_length & VALUE_DATA_INLINE != 0
    }

    pub fn data_cell(&self) -> CellIndex {
        CellIndex::from_raw(self.data)
    }

    pub fn data_class(&self) -> DataClass {
        if self.is_inline() || self.len() == 0 {
            DataClass::Small
        } else {
            DataClass::of_len(self.len())
        }
    }

    /// Inline bytes of a small value.
    pub fn inline_data(&self) -> [u8; 4] {
        self.data.to_le_bytes()
    }

    /// Store small data inline, marking the length.
    pub fn set_inline(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= INLINE_DATA_MAX);
        let mut buf = [0u8; 4];
        buf[..data.len()].copy_from_slice(data);
        self.data = u32::from_le_bytes(buf);
        self.data_length = data.len() as u32 | VALUE_DATA_INLINE;
    }

    pub fn set_external(&mut self, cell: CellIndex, len: usize) {
        self.data = cell.raw();
        self.data_length = len as u32;
    }
}

/// The storage encoding of a value's data, decided purely by its length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataClass {
    /// Stored inline in the value record
    Small,
    /// A single data cell
    Normal,
    /// A big-data record pointing at a list of segment cells
    Big,
}

impl DataClass {
    pub fn of_len(len: usize) -> Self {
        if len <= INLINE_DATA_MAX {
            Self::Small
        } else if len <= BIG_DATA_SEGMENT {
            Self::Normal
        } else {
            Self::Big
        }
    }
}

/// Header of a big-data cell.
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq)]
#[repr(C)]
pub struct BigData {
    pub signature: [u8; 2],
    pub count: u16,
    pub list: u32,
}

pub const BIG_DATA_SIZE: usize = std::mem::size_of::<BigData>();

impl BigData {
    pub fn new(count: usize, list: CellIndex) -> Self {
        Self {
            signature: BIG_DATA_SIGNATURE,
            count: count as u16,
            list: list.raw(),
        }
    }

    pub fn read(cell: CellIndex, payload: &[u8]) -> Result<Self, FormatError> {
        if payload.len() < BIG_DATA_SIZE {
            return Err(FormatError::Record(cell.raw()));
        }
        let big: BigData = bytemuck::pod_read_unaligned(&payload[..BIG_DATA_SIZE]);
        if big.signature != BIG_DATA_SIGNATURE || big.count == 0 {
            return Err(FormatError::Record(cell.raw()));
        }
        Ok(big)
    }

    pub fn write(&self, payload: &mut [u8]) {
        payload[..BIG_DATA_SIZE].copy_from_slice(bytemuck::bytes_of(self));
    }

    pub fn list(&self) -> CellIndex {
        CellIndex::from_raw(self.list)
    }

    /// Number of segments needed for `len` bytes of data.
    pub fn segments_for(len: usize) -> usize {
        len.div_ceil(BIG_DATA_SEGMENT)
    }
}

/// Header of a hash-leaf child index. `count` entries of (cell, hash) follow.
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq)]
#[repr(C)]
pub struct IndexHeader {
    pub signature: [u8; 2],
    pub count: u16,
}

pub const INDEX_HEADER_SIZE: usize = std::mem::size_of::<IndexHeader>();
pub const INDEX_ENTRY_SIZE: usize = 8;
/// Most children a single hash leaf can index.
pub const INDEX_MAX_ENTRIES: usize = u16::MAX as usize;

/// One slot of a child index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub cell: CellIndex,
    pub hash: u32,
}

/// A decoded child index.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexLeaf {
    pub entries: Vec<IndexEntry>,
}

impl IndexLeaf {
    pub fn cell_size(count: usize) -> usize {
        INDEX_HEADER_SIZE + count * INDEX_ENTRY_SIZE
    }

    pub fn read(cell: CellIndex, payload: &[u8]) -> Result<Self, FormatError> {
        if payload.len() < INDEX_HEADER_SIZE {
            return Err(FormatError::Record(cell.raw()));
        }
        let header: IndexHeader = bytemuck::pod_read_unaligned(&payload[..INDEX_HEADER_SIZE]);
        if header.signature != HASH_LEAF_SIGNATURE {
            return Err(FormatError::Record(cell.raw()));
        }
        let count = header.count as usize;
        let body = payload
            .get(INDEX_HEADER_SIZE..Self::cell_size(count))
            .ok_or(FormatError::Record(cell.raw()))?;
        let entries = body
            .chunks_exact(INDEX_ENTRY_SIZE)
            .map(|e| IndexEntry {
                cell: CellIndex::from_raw(LittleEndian::read_u32(&e[0..4])),
                hash: LittleEndian::read_u32(&e[4..8]),
            })
            .collect();
        Ok(Self { entries })
    }

    pub fn write(&self, payload: &mut [u8]) {
        let header = IndexHeader {
            signature: HASH_LEAF_SIGNATURE,
            count: self.entries.len() as u16,
        };
        payload[..INDEX_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
        let body = &mut payload[INDEX_HEADER_SIZE..Self::cell_size(self.entries.len())];
        for (slot, e) in body.chunks_exact_mut(INDEX_ENTRY_SIZE).zip(self.entries.iter()) {
            LittleEndian::write_u32(&mut slot[0..4], e.cell.raw());
            LittleEndian::write_u32(&mut slot[4..8], e.hash);
        }
    }
}

/// Decode a value list (a bare array of value cells).
pub fn read_cell_list(cell: CellIndex, payload: &[u8], count: usize) -> Result<Vec<CellIndex>, FormatError> {
    let body = payload.get(..count * 4).ok_or(FormatError::Record(cell.raw()))?;
    Ok(body
        .chunks_exact(4)
        .map(|c| CellIndex::from_raw(LittleEndian::read_u32(c)))
        .collect())
}

pub fn write_cell_list(payload: &mut [u8], cells: &[CellIndex]) {
    for (slot, c) in payload.chunks_exact_mut(4).zip(cells.iter()) {
        LittleEndian::write_u32(slot, c.raw());
    }
}

/// Hash of an upper-cased name, as kept in hash-leaf entries.
pub fn name_hash(name: &str) -> u32 {
    name.chars()
        .flat_map(char::to_uppercase)
        .fold(0u32, |acc, c| acc.wrapping_mul(37).wrapping_add(c as u32))
}

/// Case-insensitive name ordering, used for child indexes and value lookups.
pub fn compare_names(a: &str, b: &str) -> Ordering {
    a.chars()
        .flat_map(char::to_uppercase)
        .cmp(b.chars().flat_map(char::to_uppercase))
}

pub fn names_equal(a: &str, b: &str) -> bool {
    compare_names(a, b) == Ordering::Equal
}

/// Decode a stored name.
pub fn decode_name(cell: CellIndex, bytes: &[u8]) -> Result<String, FormatError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| FormatError::Record(cell.raw()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_round_trip() {
        let mut payload = vec![0u8; KeyNode::cell_size(3)];
        let mut node = KeyNode::new(CellIndex::from_raw(0x20), 3, KEY_HIVE_ENTRY, 77);
        node.value_count = 2;
        node.write(&mut payload);
        payload[KEY_NODE_SIZE..].copy_from_slice(b"Foo");
        let (read, name) = KeyNode::read(CellIndex::from_raw(0x100), &payload).unwrap();
        assert_eq!(read, node);
        assert_eq!(name, b"Foo");
        assert_eq!(read.last_write(), 77);
        assert!(read.value_list().is_nil());

        payload[0] = b'x';
        assert_eq!(
            KeyNode::read(CellIndex::from_raw(0x100), &payload),
            Err(FormatError::Record(0x100))
        );
    }

    #[test]
    fn value_inline() {
        let mut v = KeyValue::new(3, 4);
        v.set_inline(&[1, 2, 3]);
        assert!(v.is_inline());
        assert_eq!(v.len(), 3);
        assert_eq!(&v.inline_data()[..3], &[1, 2, 3]);
        assert_eq!(v.data_class(), DataClass::Small);
        v.set_external(CellIndex::from_raw(0x400), 2000);
        assert!(!v.is_inline());
        assert_eq!(v.data_class(), DataClass::Normal);
        v.set_external(CellIndex::from_raw(0x400), BIG_DATA_SEGMENT + 1);
        assert_eq!(v.data_class(), DataClass::Big);
    }

    #[test]
    fn data_classes() {
        assert_eq!(DataClass::of_len(0), DataClass::Small);
        assert_eq!(DataClass::of_len(4), DataClass::Small);
        assert_eq!(DataClass::of_len(5), DataClass::Normal);
        assert_eq!(DataClass::of_len(BIG_DATA_SEGMENT), DataClass::Normal);
        assert_eq!(DataClass::of_len(BIG_DATA_SEGMENT + 1), DataClass::Big);
        assert_eq!(BigData::segments_for(BIG_DATA_SEGMENT * 2 + 1), 3);
    }

    #[test]
    fn index_round_trip() {
        let leaf = IndexLeaf {
            entries: vec![
                IndexEntry { cell: CellIndex::from_raw(0x20), hash: name_hash("a") },
                IndexEntry { cell: CellIndex::from_raw(0x80), hash: name_hash("B") },
            ],
        };
        let mut payload = vec![0u8; IndexLeaf::cell_size(2)];
        leaf.write(&mut payload);
        assert_eq!(&payload[..2], b"lh");
        assert_eq!(IndexLeaf::read(CellIndex::NIL, &payload).unwrap(), leaf);
    }

    #[test]
    fn names() {
        assert_eq!(name_hash("foo"), name_hash("FOO"));
        assert_ne!(name_hash("foo"), name_hash("bar"));
        assert_eq!(compare_names("abc", "ABD"), Ordering::Less);
        assert!(names_equal("Software", "SOFTWARE"));
        assert!(!names_equal("Software", "Softwar"));
    }

    #[test]
    fn cell_lists() {
        let cells = [CellIndex::from_raw(8), CellIndex::from_raw(0x8000_0010)];
        let mut buf = [0u8; 8];
        write_cell_list(&mut buf, &cells);
        assert_eq!(read_cell_list(CellIndex::NIL, &buf, 2).unwrap(), cells.to_vec());
        assert!(read_cell_list(CellIndex::NIL, &buf, 3).is_err());
    }
}
