//! The slot-addressed file arena.
//!
//! Bounded read/write by absolute offset; any read or write strictly past
//! the cached high-water mark is a fatal corruption signal, as is any short
//! I/O. The high-water mark is extended on every append and refreshed when
//! the file is truncated during compaction.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use snafu::ResultExt;

use crate::error::{IoSnafu, StoreError};

/// A slot-addressed file: bytes are addressed by absolute offset, and new
/// slots are appended past the current high-water mark.
#[derive(Debug)]
pub(crate) struct Arena {
    file: File,
    high_water_mark: u64,
}

impl Arena {
    /// Opens (creating if necessary) the backing file at `path`.
    pub(crate) fn open(path: &Path) -> Result<Arena, StoreError> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .context(IoSnafu)?;
        let len = file.metadata().context(IoSnafu)?.len();
        Ok(Arena {
            file,
            high_water_mark: len,
        })
    }

    pub(crate) fn len(&self) -> u64 {
        self.high_water_mark
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<(), StoreError> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| StoreError::corrupt("offset arithmetic overflow"))?;
        if end > self.high_water_mark {
            return Err(StoreError::corrupt(format!(
                "access to [{offset}, {end}) is past the arena's high-water mark ({})",
                self.high_water_mark
            )));
        }
        Ok(())
    }

    /// Reads exactly `len` bytes starting at `offset`.
    pub(crate) fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, StoreError> {
        self.check_bounds(offset, len)?;
        let mut buf = vec![0u8; len];
        self.file
            .read_exact_at(&mut buf, offset)
            .context(IoSnafu)?;
        Ok(buf)
    }

    /// Reads exactly `buf.len()` bytes starting at `offset` into `buf`.
    pub(crate) fn read_into_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StoreError> {
        self.check_bounds(offset, buf.len())?;
        self.file.read_exact_at(buf, offset).context(IoSnafu)?;
        Ok(())
    }

    /// Writes `data` at `offset`, which must lie entirely below the
    /// high-water mark (use [`Arena::append`] to grow the file).
    pub(crate) fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), StoreError> {
        self.check_bounds(offset, data.len())?;
        self.file.write_all_at(data, offset).context(IoSnafu)?;
        Ok(())
    }

    /// Appends `data` past the current high-water mark and returns the
    /// offset it was written at.
    pub(crate) fn append(&mut self, data: &[u8]) -> Result<u64, StoreError> {
        let offset = self.high_water_mark;
        self.file.write_all_at(data, offset).context(IoSnafu)?;
        self.high_water_mark = offset + data.len() as u64;
        Ok(offset)
    }

    /// Truncates the file to `len`, which must not exceed the current
    /// high-water mark.
    pub(crate) fn truncate(&mut self, len: u64) -> Result<(), StoreError> {
        debug_assert!(len <= self.high_water_mark);
        self.file.set_len(len).context(IoSnafu)?;
        self.high_water_mark = len;
        Ok(())
    }

    pub(crate) fn sync(&self) -> Result<(), StoreError> {
        self.file.sync_all().context(IoSnafu)?;
        Ok(())
    }

    pub(crate) fn raw_file(&self) -> &File {
        &self.file
    }
}
