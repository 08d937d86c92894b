//! Builder for the parameters a store is opened or created with, mirroring
//! the teacher's `DiskBufferConfigBuilder::from_path(..).build()` shape.

use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::layout::record_len;

/// Whether the in-process mutex guarding the gate is engaged.
///
/// A single process opening one handle from one thread can skip it
/// entirely; anything sharing a handle across threads needs it, since
/// byte-range locks serialize processes, not threads within one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threading {
    SingleThreaded,
    MultiThreaded,
}

/// Validated parameters for [`crate::store::Store::open`].
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub(crate) path: PathBuf,
    pub(crate) key_count: u32,
    pub(crate) data_len: u32,
    pub(crate) threading: Threading,
}

/// Builds an [`OpenOptions`], validating `key_count`/`data_len`/`record_len`
/// arithmetic up front instead of deferring the failure into `open()`.
#[derive(Debug, Clone)]
pub struct OpenOptionsBuilder {
    path: PathBuf,
    key_count: Option<u32>,
    data_len: Option<u32>,
    threading: Threading,
}

impl OpenOptionsBuilder {
    pub fn from_path(path: impl AsRef<Path>) -> OpenOptionsBuilder {
        OpenOptionsBuilder {
            path: path.as_ref().to_path_buf(),
            key_count: None,
            data_len: None,
            threading: Threading::MultiThreaded,
        }
    }

    /// Number of independently balanced key indices the store maintains.
    /// Must be at least 1.
    pub fn key_count(mut self, key_count: u32) -> OpenOptionsBuilder {
        self.key_count = Some(key_count);
        self
    }

    /// Size, in bytes, of each record's payload. Must be at least wide
    /// enough to hold a `pid_t`, since cursor slots stamp one there.
    pub fn data_len(mut self, data_len: u32) -> OpenOptionsBuilder {
        self.data_len = Some(data_len);
        self
    }

    pub fn threading(mut self, threading: Threading) -> OpenOptionsBuilder {
        self.threading = threading;
        self
    }

    pub fn build(self) -> Result<OpenOptions, StoreError> {
        let key_count = self
            .key_count
            .ok_or_else(|| StoreError::invalid("key_count was not set"))?;
        let data_len = self
            .data_len
            .ok_or_else(|| StoreError::invalid("data_len was not set"))?;
        if key_count == 0 {
            return Err(StoreError::invalid("key_count must be at least 1"));
        }
        if data_len == 0 {
            return Err(StoreError::invalid("data_len must be at least 1"));
        }
        let pid_width = std::mem::size_of::<libc::pid_t>() as u32;
        if data_len < pid_width {
            return Err(StoreError::invalid(format!(
                "data_len must be at least {pid_width} bytes to hold a cursor's stamped pid"
            )));
        }
        let node_size = crate::layout::NODE_SIZE as u32;
        let offset_size = crate::layout::OFFSET_SIZE as u32;
        key_count
            .checked_mul(node_size)
            .and_then(|n| n.checked_add(2 * offset_size))
            .and_then(|n| n.checked_add(data_len))
            .ok_or_else(|| StoreError::invalid("key_count/data_len overflow record_len arithmetic"))?;
        debug_assert_eq!(record_len(key_count, data_len), {
            key_count * node_size + 2 * offset_size + data_len
        });

        Ok(OpenOptions {
            path: self.path,
            key_count,
            data_len,
            threading: self.threading,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_key_count() {
        let err = OpenOptionsBuilder::from_path("/tmp/does-not-matter.avl")
            .data_len(16)
            .build()
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument { .. }));
    }

    #[test]
    fn rejects_data_len_too_small_for_pid() {
        let err = OpenOptionsBuilder::from_path("/tmp/does-not-matter.avl")
            .key_count(1)
            .data_len(1)
            .build()
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument { .. }));
    }

    #[test]
    fn rejects_record_len_overflow() {
        let err = OpenOptionsBuilder::from_path("/tmp/does-not-matter.avl")
            .key_count(u32::MAX)
            .data_len(u32::MAX)
            .build()
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument { .. }));
    }

    #[test]
    fn accepts_reasonable_shape() {
        let opts = OpenOptionsBuilder::from_path("/tmp/does-not-matter.avl")
            .key_count(2)
            .data_len(32)
            .build()
            .expect("valid options");
        assert_eq!(opts.key_count, 2);
        assert_eq!(opts.data_len, 32);
    }
}
