//! The arena's fixed-plus-variable-length header.
//!
//! Layout (native-endian throughout, per the rest of the format):
//!
//! ```text
//! offset  size  field
//! 0       8     magic
//! 8       4     key_count
//! 12      4     data_len
//! 16      4     record_len
//! 20      8     live_count
//! 28      8     next_number
//! 36      8     head_seq
//! 44      8     head_empty
//! 52      8     head_cpr
//! 60      8*N   roots[key_count]
//! ```
//!
//! `record_len` is redundant with `key_count`/`data_len` (see
//! [`crate::layout::record_len`]) but is stamped on disk anyway so a second
//! opener can catch a mismatched configuration before touching a single
//! slot, the same cheap sanity check `record_len()` exists to support.

use crate::error::StoreError;
use crate::layout::{record_len, MAGIC, OFFSET_SIZE};

pub(crate) const MAGIC_OFFSET: u64 = 0;
pub(crate) const KEY_COUNT_OFFSET: u64 = 8;
pub(crate) const DATA_LEN_OFFSET: u64 = 12;
pub(crate) const RECORD_LEN_OFFSET: u64 = 16;
pub(crate) const LIVE_COUNT_OFFSET: u64 = 20;
pub(crate) const NEXT_NUMBER_OFFSET: u64 = 28;
pub(crate) const HEAD_SEQ_OFFSET: u64 = 36;
pub(crate) const HEAD_EMPTY_OFFSET: u64 = 44;
pub(crate) const HEAD_CPR_OFFSET: u64 = 52;
pub(crate) const ROOTS_OFFSET: u64 = 60;

/// Total header length for a store with `key_count` trees.
pub(crate) fn header_len(key_count: u32) -> u64 {
    ROOTS_OFFSET + key_count as u64 * OFFSET_SIZE as u64
}

/// The offset of tree `key`'s root pointer within the header.
pub(crate) fn root_offset(key: u32) -> u64 {
    ROOTS_OFFSET + key as u64 * OFFSET_SIZE as u64
}

/// In-memory mirror of the header. Callers mutate fields here and then
/// persist the ones that changed with the matching `write_*` helper;
/// nothing here implies the whole header gets rewritten on every update.
#[derive(Debug, Clone)]
pub(crate) struct Header {
    pub key_count: u32,
    pub data_len: u32,
    pub record_len: u32,
    pub live_count: i64,
    pub next_number: i64,
    pub head_seq: u64,
    pub head_empty: u64,
    pub head_cpr: u64,
    pub roots: Vec<u64>,
}

impl Header {
    /// Builds a fresh, empty header for a newly created arena.
    pub(crate) fn new(key_count: u32, data_len: u32) -> Result<Header, StoreError> {
        if key_count == 0 {
            return Err(StoreError::invalid("key_count must be at least 1"));
        }
        Ok(Header {
            key_count,
            data_len,
            record_len: record_len(key_count, data_len),
            live_count: 0,
            next_number: 0,
            head_seq: 0,
            head_empty: 0,
            head_cpr: 0,
            roots: vec![0u64; key_count as usize],
        })
    }

    /// Serializes the whole header, for the initial write of a new arena.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(header_len(self.key_count) as usize);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&self.key_count.to_ne_bytes());
        buf.extend_from_slice(&self.data_len.to_ne_bytes());
        buf.extend_from_slice(&self.record_len.to_ne_bytes());
        buf.extend_from_slice(&self.live_count.to_ne_bytes());
        buf.extend_from_slice(&self.next_number.to_ne_bytes());
        buf.extend_from_slice(&self.head_seq.to_ne_bytes());
        buf.extend_from_slice(&self.head_empty.to_ne_bytes());
        buf.extend_from_slice(&self.head_cpr.to_ne_bytes());
        for root in &self.roots {
            buf.extend_from_slice(&root.to_ne_bytes());
        }
        buf
    }

    /// Parses a header out of `bytes`, which must be at least
    /// [`ROOTS_OFFSET`] long; the caller is responsible for having read
    /// `key_count` first and supplying the full `header_len(key_count)`
    /// bytes.
    pub(crate) fn decode(bytes: &[u8]) -> Result<Header, StoreError> {
        if bytes.len() < ROOTS_OFFSET as usize {
            return Err(StoreError::corrupt("arena too short to hold a header"));
        }
        if &bytes[0..8] != MAGIC {
            return Err(StoreError::corrupt("bad magic"));
        }
        let key_count = read_u32(bytes, KEY_COUNT_OFFSET);
        let data_len = read_u32(bytes, DATA_LEN_OFFSET);
        let record_len_stamped = read_u32(bytes, RECORD_LEN_OFFSET);
        let expected = record_len(key_count, data_len);
        if record_len_stamped != expected {
            return Err(StoreError::corrupt(format!(
                "stamped record_len {record_len_stamped} does not match key_count/data_len ({expected})"
            )));
        }
        let want = header_len(key_count);
        if (bytes.len() as u64) < want {
            return Err(StoreError::corrupt("arena too short to hold its roots"));
        }
        let live_count = read_i64(bytes, LIVE_COUNT_OFFSET);
        let next_number = read_i64(bytes, NEXT_NUMBER_OFFSET);
        let head_seq = read_u64(bytes, HEAD_SEQ_OFFSET);
        let head_empty = read_u64(bytes, HEAD_EMPTY_OFFSET);
        let head_cpr = read_u64(bytes, HEAD_CPR_OFFSET);
        let mut roots = Vec::with_capacity(key_count as usize);
        for key in 0..key_count {
            roots.push(read_u64(bytes, root_offset(key)));
        }
        Ok(Header {
            key_count,
            data_len,
            record_len: record_len_stamped,
            live_count,
            next_number,
            head_seq,
            head_empty,
            head_cpr,
            roots,
        })
    }

    /// Validates that a caller-supplied `(key_count, data_len)` matches
    /// what's already stamped in the file.
    pub(crate) fn check_shape(&self, key_count: u32, data_len: u32) -> Result<(), StoreError> {
        if self.key_count != key_count || self.data_len != data_len {
            return Err(StoreError::invalid(format!(
                "arena was created with key_count={} data_len={}, opened with key_count={key_count} data_len={data_len}",
                self.key_count, self.data_len
            )));
        }
        Ok(())
    }
}

fn read_u32(bytes: &[u8], offset: u64) -> u32 {
    let o = offset as usize;
    u32::from_ne_bytes(bytes[o..o + 4].try_into().expect("4-byte slice"))
}

fn read_u64(bytes: &[u8], offset: u64) -> u64 {
    let o = offset as usize;
    u64::from_ne_bytes(bytes[o..o + 8].try_into().expect("8-byte slice"))
}

fn read_i64(bytes: &[u8], offset: u64) -> i64 {
    let o = offset as usize;
    i64::from_ne_bytes(bytes[o..o + 8].try_into().expect("8-byte slice"))
}
