use bytemuck::{Pod, Zeroable};

use crate::{HBIN_HEADER_SIZE, HBLOCK_SIZE};

pub const BIN_SIGNATURE: [u8; 4] = *b"hbin";

/// Header at the start of every bin.
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq)]
#[repr(C)]
pub struct BinHeader {
    pub signature: [u8; 4],
    /// Offset of this bin within its storage area
    pub file_offset: u32,
    /// Total bin size, header included
    pub size: u32,
    pub reserved: [u32; 2],
    pub timestamp_low: u32,
    pub timestamp_high: u32,
    pub spare: u32,
}

const _: () = assert!(std::mem::size_of::<BinHeader>() == HBIN_HEADER_SIZE);

impl BinHeader {
    pub fn new(file_offset: u32, size: u32) -> Self {
        Self {
            signature: BIN_SIGNATURE,
            file_offset,
            size,
            reserved: [0; 2],
            timestamp_low: 0,
            timestamp_high: 0,
            spare: 0,
        }
    }

    pub fn read(bytes: &[u8]) -> Self {
        bytemuck::pod_read_unaligned(&bytes[..HBIN_HEADER_SIZE])
    }

    pub fn write(&self, bytes: &mut [u8]) {
        bytes[..HBIN_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(self));
    }

    pub fn timestamp(&self) -> u64 {
        ((self.timestamp_high as u64) << 32) | self.timestamp_low as u64
    }

    pub fn set_timestamp(&mut self, ts: u64) {
        self.timestamp_low = ts as u32;
        self.timestamp_high = (ts >> 32) as u32;
    }

    /// Check that this header describes a bin at `offset` that fits within an area of `length`
    /// bytes.
    pub fn is_valid_at(&self, offset: u32, length: u32) -> bool {
        let size = self.size as usize;
        self.signature == BIN_SIGNATURE
            && self.file_offset == offset
            && size >= HBLOCK_SIZE
            && size % HBLOCK_SIZE == 0
            && (offset as u64 + size as u64) <= length as u64
    }
}

/// Read the signed size prefix of a cell.
#[inline]
pub fn read_cell_size(bytes: &[u8]) -> i32 {
    i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Write the signed size prefix of a cell.
#[inline]
pub fn write_cell_size(bytes: &mut [u8], size: i32) {
    bytes[..4].copy_from_slice(&size.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity() {
        let h = BinHeader::new(0x2000, 0x1000);
        assert!(h.is_valid_at(0x2000, 0x3000));
        assert!(!h.is_valid_at(0x2000, 0x2fff));
        assert!(!h.is_valid_at(0x1000, 0x3000));
        let mut bad = h;
        bad.size = 0x800;
        assert!(!bad.is_valid_at(0x2000, 0x3000));
        let mut buf = [0u8; 64];
        h.write(&mut buf);
        assert_eq!(&buf[..4], b"hbin");
        assert_eq!(BinHeader::read(&buf), h);
    }

    #[test]
    fn cell_sizes() {
        let mut buf = [0u8; 8];
        write_cell_size(&mut buf, -0x40);
        assert_eq!(read_cell_size(&buf), -0x40);
        assert_eq!(buf[..4], [0xc0, 0xff, 0xff, 0xff]);
    }
}
