use thiserror::Error;

use crate::cell::CellIndex;

/// Structural problems found in a hive image.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum FormatError {
    #[error("Base block checksum doesn't match its contents")]
    HeaderChecksum,
    #[error("Base block has an unsupported signature, type, version, or format")]
    HeaderFields,
    #[error("Stable area length 0x{0:x} isn't a multiple of the block size")]
    Length(u32),
    #[error("Bin at offset 0x{offset:x} has an invalid header")]
    BinHeader { offset: u32 },
    #[error("Cell chain in the bin at offset 0x{offset:x} is broken")]
    CellChain { offset: u32 },
    #[error("Cell 0x{0:08x} doesn't hold the expected record")]
    Record(u32),
    #[error("Log file header is unreadable or belongs to a different hive")]
    LogHeader,
    #[error("Log dirty vector is missing or fails its integrity hash")]
    LogVector,
    #[error("Log file ends before all dirty sectors could be read")]
    LogTruncated,
    #[error("A block of the stable area isn't covered by any bin after recovery")]
    Unmapped,
    #[error("Root cell 0x{0:08x} is not a valid hive entry node")]
    Root(u32),
}

/// The error classes a caller can observe from any hive operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Deleted,
    BufferTooSmall,
    BufferOverflow,
    ResourceExhausted,
    NoLogSpace,
    AccessDenied,
    Corrupt,
    InvalidParameter,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HiveError {
    /// The named node or value doesn't exist
    #[error("The requested node or value doesn't exist")]
    NotFound,
    /// The cursor points at a node that has been deleted, or at an unloaded hive
    #[error("The node has been marked for deletion")]
    Deleted,
    /// The caller's buffer can't even hold the fixed part of the result
    #[error("Buffer too small: need at least 0x{required:x} bytes")]
    BufferTooSmall { required: usize },
    /// The caller's buffer got a partial result
    #[error("Buffer overflow: result was truncated, 0x{required:x} bytes are needed")]
    BufferOverflow { required: usize },
    /// Couldn't get memory from the allocation backend, or a cell couldn't be placed
    #[error("Can't allocate any more hive space. Tried to get 0x{requested:x} bytes")]
    ResourceExhausted { requested: usize },
    /// A view holding the cell couldn't be mapped
    #[error("Cell 0x{0:08x} couldn't be mapped into memory")]
    Unavailable(CellIndex),
    /// A cell couldn't be marked dirty because the log would overflow
    #[error("No log space left to record the change")]
    NoLogSpace,
    /// The access-check collaborator refused the operation
    #[error("Access denied")]
    AccessDenied,
    /// The hive image violates a structural invariant
    #[error("Hive is corrupt")]
    Corrupt(#[from] FormatError),
    /// Neither the base block nor the first bin look like a hive
    #[error("File is not a hive")]
    NotHive,
    /// A node with that name already exists under the parent
    #[error("A node with that name already exists")]
    AlreadyExists,
    /// The node still has children, or is the hive root
    #[error("The node can't be deleted")]
    CannotDelete,
    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),
    /// I/O failure on the primary or log backend
    #[error("I/O on the hive backing store failed")]
    Io(#[source] std::io::Error),
    /// Couldn't lock the backing file
    #[error("Failed to lock the backing file for exclusive use")]
    Lock(#[source] std::io::Error),
}

impl HiveError {
    /// Classify this error into one of the caller-visible result classes.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound => ErrorKind::NotFound,
            Self::Deleted => ErrorKind::Deleted,
            Self::BufferTooSmall { .. } => ErrorKind::BufferTooSmall,
            Self::BufferOverflow { .. } => ErrorKind::BufferOverflow,
            Self::ResourceExhausted { .. } | Self::Unavailable(_) | Self::Io(_) | Self::Lock(_) => {
                ErrorKind::ResourceExhausted
            }
            Self::NoLogSpace => ErrorKind::NoLogSpace,
            Self::AccessDenied => ErrorKind::AccessDenied,
            Self::Corrupt(_) | Self::NotHive => ErrorKind::Corrupt,
            Self::AlreadyExists | Self::CannotDelete | Self::InvalidParameter(_) => {
                ErrorKind::InvalidParameter
            }
        }
    }

    /// The size the caller's buffer needs to be, if this is a buffer sizing error.
    pub fn required_size(&self) -> Option<usize> {
        match self {
            Self::BufferTooSmall { required } | Self::BufferOverflow { required } => Some(*required),
            _ => None,
        }
    }
}

pub type HiveResult<T> = Result<T, HiveError>;
