//! Query results as flat little-endian records, and the bounds-checked copy into caller buffers.
//!
//! Every record starts with a fixed part. A buffer shorter than that gets nothing and
//! [`HiveError::BufferTooSmall`]; a buffer that holds the fixed part but not the whole record gets
//! as much as fits and [`HiveError::BufferOverflow`]. Both report the full size.

use byteorder::{ByteOrder, LittleEndian};

use crate::{
    error::{HiveError, HiveResult},
    format::KeyNode,
    value::ValueType,
};

/// Layouts a node can be queried in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeInfoClass {
    /// `last_write: u64, title_index: u32, name_len: u32`, then the name
    Basic,
    /// `last_write: u64, title_index: u32, class_offset: u32, class_len: u32, name_len: u32`,
    /// then the name and the class
    Node,
    /// `last_write: u64, title_index: u32, class_offset: u32, class_len: u32, subkeys: u32,
    /// max_name_len: u32, max_class_len: u32, values: u32, max_value_name_len: u32,
    /// max_value_data_len: u32`, then the class
    Full,
    /// `name_len: u32`, then the name
    Name,
}

impl NodeInfoClass {
    pub fn fixed_len(self) -> usize {
        match self {
            Self::Basic => 16,
            Self::Node => 24,
            Self::Full => 44,
            Self::Name => 4,
        }
    }
}

/// Layouts a value can be queried in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueInfoClass {
    /// `title_index: u32, type: u32, name_len: u32`, then the name
    Basic,
    /// `title_index: u32, type: u32, data_offset: u32, data_len: u32, name_len: u32`, then the
    /// name and the data
    Full,
    /// `title_index: u32, type: u32, data_len: u32`, then the data
    Partial,
}

impl ValueInfoClass {
    pub fn fixed_len(self) -> usize {
        match self {
            Self::Basic | Self::Partial => 12,
            Self::Full => 20,
        }
    }
}

/// Where one value landed in a multiple-value query's buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValueEntry {
    pub value_type: ValueType,
    pub offset: usize,
    pub len: usize,
}

/// Copy `record` into `buf`. Returns the bytes written.
pub(crate) fn copy_out(buf: &mut [u8], record: &[u8], fixed: usize) -> HiveResult<usize> {
    let required = record.len();
    if buf.len() < fixed {
        return Err(HiveError::BufferTooSmall { required });
    }
    if buf.len() < required {
        let n = buf.len();
        buf.copy_from_slice(&record[..n]);
        return Err(HiveError::BufferOverflow { required });
    }
    buf[..required].copy_from_slice(record);
    Ok(required)
}

pub(crate) fn node_record(class: NodeInfoClass, node: &KeyNode, name: &str, class_data: &[u8]) -> Vec<u8> {
    let fixed = class.fixed_len();
    let name = name.as_bytes();
    let mut out = vec![0u8; fixed];
    if class != NodeInfoClass::Name {
        LittleEndian::write_u64(&mut out[0..8], node.last_write());
    }
    match class {
        NodeInfoClass::Name => {
            LittleEndian::write_u32(&mut out[0..4], name.len() as u32);
            out.extend_from_slice(name);
        }
        NodeInfoClass::Basic => {
            LittleEndian::write_u32(&mut out[12..16], name.len() as u32);
            out.extend_from_slice(name);
        }
        NodeInfoClass::Node => {
            LittleEndian::write_u32(&mut out[12..16], (fixed + name.len()) as u32);
            LittleEndian::write_u32(&mut out[16..20], class_data.len() as u32);
            LittleEndian::write_u32(&mut out[20..24], name.len() as u32);
            out.extend_from_slice(name);
            out.extend_from_slice(class_data);
        }
        NodeInfoClass::Full => {
            let fields = [
                fixed as u32,
                class_data.len() as u32,
                node.total_subkeys(),
                node.max_name_len,
                node.max_class_len,
                node.value_count,
                node.max_value_name_len,
                node.max_value_data_len,
            ];
            for (i, v) in fields.into_iter().enumerate() {
                let at = 12 + i * 4;
                LittleEndian::write_u32(&mut out[at..at + 4], v);
            }
            out.extend_from_slice(class_data);
        }
    }
    out
}

pub(crate) fn value_record(class: ValueInfoClass, name: &str, value_type: ValueType, data: &[u8]) -> Vec<u8> {
    let fixed = class.fixed_len();
    let name = name.as_bytes();
    let mut out = vec![0u8; fixed];
    LittleEndian::write_u32(&mut out[4..8], value_type.0);
    match class {
        ValueInfoClass::Basic => {
            LittleEndian::write_u32(&mut out[8..12], name.len() as u32);
            out.extend_from_slice(name);
        }
        ValueInfoClass::Full => {
            LittleEndian::write_u32(&mut out[8..12], (fixed + name.len()) as u32);
            LittleEndian::write_u32(&mut out[12..16], data.len() as u32);
            LittleEndian::write_u32(&mut out[16..20], name.len() as u32);
            out.extend_from_slice(name);
            out.extend_from_slice(data);
        }
        ValueInfoClass::Partial => {
            LittleEndian::write_u32(&mut out[8..12], data.len() as u32);
            out.extend_from_slice(data);
        }
    }
    out
}

/// Lays the data of several values out back to back, each starting on a 4-byte boundary.
///
/// Once one value doesn't fit, nothing more is written but the required size keeps counting.
pub(crate) struct MultiValueWriter<'a> {
    buf: &'a mut [u8],
    used: usize,
    required: usize,
    full: bool,
    entries: Vec<ValueEntry>,
}

impl<'a> MultiValueWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            used: 0,
            required: 0,
            full: false,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, value_type: ValueType, data: &[u8]) {
        self.used = crate::round_up(self.used, 4);
        self.required = crate::round_up(self.required, 4);
        if !self.full && self.used + data.len() <= self.buf.len() {
            self.buf[self.used..self.used + data.len()].copy_from_slice(data);
            self.entries.push(ValueEntry {
                value_type,
                offset: self.used,
                len: data.len(),
            });
            self.used += data.len();
        } else {
            self.full = true;
        }
        self.required += data.len();
    }

    pub fn finish(self) -> HiveResult<Vec<ValueEntry>> {
        if self.full {
            Err(HiveError::BufferOverflow {
                required: self.required,
            })
        } else {
            Ok(self.entries)
        }
    }
}
