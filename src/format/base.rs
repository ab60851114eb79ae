use bytemuck::{Pod, Zeroable};

use crate::{cell::CellIndex, error::FormatError, HBLOCK_SIZE};

pub const BASE_SIGNATURE: [u8; 4] = *b"regf";
pub const HSYS_MAJOR: u32 = 1;
pub const HSYS_MINOR: u32 = 5;
pub const FORMAT_MEMORY: u32 = 1;
pub const FILE_NAME_LEN: usize = 64;

/// File type tags stored in the base block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum FileType {
    Primary = 0,
    Log = 1,
}

/// Byte offset of the checksum within the base block.
pub const CHECKSUM_OFFSET: usize = 508;

/// The 4 kiB header at the very start of a primary or log file.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct BaseBlock {
    pub signature: [u8; 4],
    pub sequence1: u32,
    pub sequence2: u32,
    pub timestamp_low: u32,
    pub timestamp_high: u32,
    pub major: u32,
    pub minor: u32,
    pub file_type: u32,
    pub format: u32,
    pub root_cell: u32,
    /// Length of the stable area, not counting this block
    pub length: u32,
    /// Sector cluster factor
    pub cluster: u32,
    pub file_name: [u8; FILE_NAME_LEN],
    /// Boot type; non-zero marks an image that was self-healed at load
    pub boot_type: u32,
    _reserved1: [u8; 392],
    pub checksum: u32,
    _reserved2: [u8; 3584],
}

const _: () = assert!(std::mem::size_of::<BaseBlock>() == HBLOCK_SIZE);

/// Marks a base block that was reconstructed by self-healing.
pub const BOOT_SELF_HEAL: u32 = 4;

impl BaseBlock {
    /// Build a fresh primary header for an empty hive.
    pub fn new(root_cell: CellIndex, length: u32, cluster: u32, timestamp: u64, name: &str) -> Self {
        let mut block = Self::zeroed();
        block.signature = BASE_SIGNATURE;
        block.sequence1 = 1;
        block.sequence2 = 1;
        block.set_timestamp(timestamp);
        block.major = HSYS_MAJOR;
        block.minor = HSYS_MINOR;
        block.file_type = FileType::Primary as u32;
        block.format = FORMAT_MEMORY;
        block.root_cell = root_cell.raw();
        block.length = length;
        block.cluster = cluster;
        block.set_file_name(name);
        block.checksum = block.compute_checksum();
        block
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        bytemuck::pod_read_unaligned(&bytes[..HBLOCK_SIZE])
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub fn timestamp(&self) -> u64 {
        ((self.timestamp_high as u64) << 32) | self.timestamp_low as u64
    }

    pub fn set_timestamp(&mut self, ts: u64) {
        self.timestamp_low = ts as u32;
        self.timestamp_high = (ts >> 32) as u32;
    }

    pub fn root(&self) -> CellIndex {
        CellIndex::from_raw(self.root_cell)
    }

    /// Store the tail of the file name, keeping the last bytes if it's too long.
    pub fn set_file_name(&mut self, name: &str) {
        self.file_name = [0; FILE_NAME_LEN];
        let bytes = name.as_bytes();
        let start = bytes.len().saturating_sub(FILE_NAME_LEN);
        let tail = &bytes[start..];
        self.file_name[..tail.len()].copy_from_slice(tail);
    }

    pub fn file_name(&self) -> String {
        let end = self
            .file_name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(FILE_NAME_LEN);
        String::from_utf8_lossy(&self.file_name[..end]).into_owned()
    }

    /// XOR of the first 127 words, with 0 and !0 remapped so a zeroed or erased sector never
    /// validates.
    pub fn compute_checksum(&self) -> u32 {
        checksum_words(&self.as_bytes()[..CHECKSUM_OFFSET])
    }

    pub fn checksum_ok(&self) -> bool {
        self.compute_checksum() == self.checksum
    }

    pub fn update_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Check the fields that say whether this is a hive we understand at all.
    pub fn validate(&self, file_type: FileType) -> Result<(), FormatError> {
        if self.signature != BASE_SIGNATURE
            || self.file_type != file_type as u32
            || self.major != HSYS_MAJOR
            || self.minor > HSYS_MINOR
            || self.format != FORMAT_MEMORY
        {
            return Err(FormatError::HeaderFields);
        }
        if (self.length as usize) % HBLOCK_SIZE != 0 {
            return Err(FormatError::Length(self.length));
        }
        Ok(())
    }

    pub fn is_clean(&self) -> bool {
        self.sequence1 == self.sequence2
    }
}

impl std::fmt::Debug for BaseBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseBlock")
            .field("sequence1", &self.sequence1)
            .field("sequence2", &self.sequence2)
            .field("timestamp", &self.timestamp())
            .field("file_type", &self.file_type)
            .field("root_cell", &self.root())
            .field("length", &self.length)
            .field("cluster", &self.cluster)
            .field("checksum", &self.checksum)
            .finish()
    }
}

pub(crate) fn checksum_words(bytes: &[u8]) -> u32 {
    let sum = bytes
        .chunks_exact(4)
        .fold(0u32, |acc, w| acc ^ u32::from_le_bytes([w[0], w[1], w[2], w[3]]));
    match sum {
        0 => 1,
        u32::MAX => u32::MAX - 1,
        s => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        assert_eq!(std::mem::offset_of!(BaseBlock, checksum), CHECKSUM_OFFSET);
        assert_eq!(std::mem::offset_of!(BaseBlock, file_name), 48);
        assert_eq!(std::mem::offset_of!(BaseBlock, root_cell), 36);
    }

    #[test]
    fn checksum() {
        let mut block = BaseBlock::new(CellIndex::from_raw(0x20), 4096, 1, 0x1234_5678_9abc, "SYSTEM");
        assert!(block.checksum_ok());
        assert!(block.validate(FileType::Primary).is_ok());
        assert!(block.validate(FileType::Log).is_err());
        block.sequence1 += 1;
        assert!(!block.checksum_ok());
        block.update_checksum();
        assert!(block.checksum_ok());
        assert!(!block.is_clean());
        assert_eq!(block.timestamp(), 0x1234_5678_9abc);
        assert_eq!(block.file_name(), "SYSTEM");

        // all-zero and all-ones sectors never validate
        assert_eq!(checksum_words(&[0u8; 508]), 1);
        let ones = [0xFFu8; 508];
        assert_eq!(checksum_words(&ones[..8]), 1);
        assert_eq!(checksum_words(&ones[..4]), u32::MAX - 1);
    }

    #[test]
    fn long_names_keep_tail() {
        let name = "x".repeat(70) + "tail";
        let block = BaseBlock::new(CellIndex::NIL, 0, 1, 0, &name);
        assert!(block.file_name().ends_with("tail"));
        assert_eq!(block.file_name().len(), FILE_NAME_LEN);
    }
}
