//! The mutation engine and query surface over a hive's node tree.
//!
//! Functions here work on a [`CellSpace`](crate::alloc::CellSpace) and a cursor's
//! [`KcbState`](crate::kcb::KcbState); taking the locks that make that safe is the registry's
//! job. Every mutation dirties all the cells it will touch before it rewrites any of them, and
//! frees cells only once nothing points at them any more.

mod compress;
mod edit;
mod query;
mod set;

pub(crate) use compress::compress_store;
pub(crate) use edit::{
    create_node, delete_node, move_node, rename_node, set_last_write_time, set_user_flags,
};
pub(crate) use query::{child_record, node_record, open_path, value_at, value_by_name};
pub(crate) use set::{delete_value, set_value};

use crate::error::{HiveError, HiveResult};

/// Longest node or value name, in bytes.
pub(crate) const MAX_NAME_LEN: usize = 255;

/// Check a single path component.
pub(crate) fn validate_name(name: &str) -> HiveResult<()> {
    if name.is_empty() {
        return Err(HiveError::InvalidParameter("name is empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(HiveError::InvalidParameter("name is longer than 255 bytes"));
    }
    if name.contains('\\') {
        return Err(HiveError::InvalidParameter("name contains a path separator"));
    }
    Ok(())
}

/// Value names may be empty (the node's default value).
pub(crate) fn validate_value_name(name: &str) -> HiveResult<()> {
    if name.len() > MAX_NAME_LEN {
        return Err(HiveError::InvalidParameter("value name is longer than 255 bytes"));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn names() {
        assert!(validate_name("Software").is_ok());
        assert_eq!(validate_name("").unwrap_err().kind(), ErrorKind::InvalidParameter);
        assert!(validate_name("a\\b").is_err());
        assert!(validate_name(&"x".repeat(256)).is_err());
        assert!(validate_name(&"x".repeat(255)).is_ok());
        assert!(validate_value_name("").is_ok());
    }
}
