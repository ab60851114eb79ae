//! Bit-exact records stored in hive cells and file headers.
//!
//! All records are little-endian `#[repr(C)]` structures copied in and out of cell memory with
//! `bytemuck`, so nothing here ever depends on the alignment of the backing memory.

mod base;
mod bin;
mod records;

pub use base::*;
pub use bin::*;
pub use records::*;
