//! Per-slot byte layout: `key_count` threaded AVL nodes, the sequential
//! list's two links, and the payload.
//!
//! ```text
//! offset                          size           field
//! 0                               NODE_SIZE       node[0]  (balance, left, right)
//! NODE_SIZE                       NODE_SIZE       node[1]
//! ...
//! key_count*NODE_SIZE             OFFSET_SIZE     prev_seq
//! key_count*NODE_SIZE+OFFSET_SIZE OFFSET_SIZE     next_seq
//! key_count*NODE_SIZE+2*OFFSET_SIZE  data_len     payload
//! ```
//!
//! A slot's kind is read off node 0's balance byte: a live record carries
//! an ordinary AVL balance factor in `{-2, -1, 0, 1, 2}` (`-2`/`2`
//! transiently, mid-rebalance), [`crate::layout::TAG_CURSOR`] marks an open
//! cursor, and [`crate::layout::TAG_FREE`] marks a slot on the free list.
//! Free and cursor slots don't use their node arrays at all; they chain
//! through `next_seq` instead (`prev_seq` is already claimed, for cursors,
//! by the read-sequence position — see `cursor.rs`).

use crate::layout::{Edge, Side, NODE_SIZE, OFFSET_SIZE, TAG_CURSOR, TAG_FREE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotKind {
    Live,
    Cursor,
    Free,
}

fn node_offset(key: u32) -> usize {
    key as usize * NODE_SIZE
}

fn balance_offset(key: u32) -> usize {
    node_offset(key)
}

fn left_offset(key: u32) -> usize {
    node_offset(key) + 1
}

fn right_offset(key: u32) -> usize {
    node_offset(key) + 1 + OFFSET_SIZE
}

fn prev_seq_offset(key_count: u32) -> usize {
    key_count as usize * NODE_SIZE
}

fn next_seq_offset(key_count: u32) -> usize {
    key_count as usize * NODE_SIZE + OFFSET_SIZE
}

fn payload_offset(key_count: u32) -> usize {
    key_count as usize * NODE_SIZE + 2 * OFFSET_SIZE
}

fn kind_of(balance_byte: i8) -> SlotKind {
    match balance_byte {
        TAG_CURSOR => SlotKind::Cursor,
        TAG_FREE => SlotKind::Free,
        _ => SlotKind::Live,
    }
}

/// A read-only view over one slot's raw bytes.
pub(crate) struct SlotView<'a> {
    bytes: &'a [u8],
    key_count: u32,
}

impl<'a> SlotView<'a> {
    pub(crate) fn new(bytes: &'a [u8], key_count: u32) -> SlotView<'a> {
        SlotView { bytes, key_count }
    }

    pub(crate) fn kind(&self) -> SlotKind {
        kind_of(self.balance(0))
    }

    pub(crate) fn balance(&self, key: u32) -> i8 {
        self.bytes[balance_offset(key)] as i8
    }

    pub(crate) fn edge(&self, key: u32, side: Side) -> Edge {
        let off = match side {
            Side::Left => left_offset(key),
            Side::Right => right_offset(key),
        };
        Edge::decode(read_i64(self.bytes, off))
    }

    pub(crate) fn left(&self, key: u32) -> Edge {
        self.edge(key, Side::Left)
    }

    pub(crate) fn right(&self, key: u32) -> Edge {
        self.edge(key, Side::Right)
    }

    pub(crate) fn prev_seq(&self) -> u64 {
        read_u64(self.bytes, prev_seq_offset(self.key_count))
    }

    pub(crate) fn next_seq(&self) -> u64 {
        read_u64(self.bytes, next_seq_offset(self.key_count))
    }

    pub(crate) fn payload(&self) -> &[u8] {
        &self.bytes[payload_offset(self.key_count)..]
    }
}

/// A mutable view over one slot's raw bytes.
pub(crate) struct SlotViewMut<'a> {
    bytes: &'a mut [u8],
    key_count: u32,
}

impl<'a> SlotViewMut<'a> {
    pub(crate) fn new(bytes: &'a mut [u8], key_count: u32) -> SlotViewMut<'a> {
        SlotViewMut { bytes, key_count }
    }

    pub(crate) fn as_view(&self) -> SlotView<'_> {
        SlotView::new(self.bytes, self.key_count)
    }

    pub(crate) fn kind(&self) -> SlotKind {
        self.as_view().kind()
    }

    pub(crate) fn set_balance(&mut self, key: u32, balance: i8) {
        self.bytes[balance_offset(key)] = balance as u8;
    }

    pub(crate) fn set_kind_tag(&mut self, tag: i8) {
        self.bytes[balance_offset(0)] = tag as u8;
    }

    pub(crate) fn set_edge(&mut self, key: u32, side: Side, edge: Edge) {
        let off = match side {
            Side::Left => left_offset(key),
            Side::Right => right_offset(key),
        };
        write_i64(self.bytes, off, edge.encode());
    }

    pub(crate) fn set_left(&mut self, key: u32, edge: Edge) {
        self.set_edge(key, Side::Left, edge);
    }

    pub(crate) fn set_right(&mut self, key: u32, edge: Edge) {
        self.set_edge(key, Side::Right, edge);
    }

    pub(crate) fn set_prev_seq(&mut self, offset: u64) {
        write_u64(self.bytes, prev_seq_offset(self.key_count), offset);
    }

    pub(crate) fn set_next_seq(&mut self, offset: u64) {
        write_u64(self.bytes, next_seq_offset(self.key_count), offset);
    }

    pub(crate) fn payload_mut(&mut self) -> &mut [u8] {
        let off = payload_offset(self.key_count);
        &mut self.bytes[off..]
    }

    pub(crate) fn set_payload(&mut self, data: &[u8]) {
        self.payload_mut().copy_from_slice(data);
    }

    /// Zeroes every node's balance/left/right, the sequential links, and the
    /// payload; used before a slot is reinitialized as a different kind.
    pub(crate) fn clear(&mut self) {
        self.bytes.fill(0);
    }
}

fn read_i64(bytes: &[u8], offset: usize) -> i64 {
    i64::from_ne_bytes(bytes[offset..offset + 8].try_into().expect("8-byte slice"))
}

fn write_i64(bytes: &mut [u8], offset: usize, value: i64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_ne_bytes(bytes[offset..offset + 8].try_into().expect("8-byte slice"))
}

fn write_u64(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
}
