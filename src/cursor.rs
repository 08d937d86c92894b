//! The cursor registry: per-opener iteration state persisted as a slot in
//! the same arena, linked on `HeadCpr`.
//!
//! A cursor slot repurposes the per-key node array as plain (non-threaded)
//! offset pairs — `left`/`right`, the next record `prev()`/`next()` will
//! yield on that key — and repurposes `PrevSeq` as the `readseq` walk
//! position. `NextSeq` still chains the slot onto `HeadCpr` (or, once
//! closed, onto `HeadEmpty`), exactly like a free slot does.
//!
//! This module only manages the slot's bookkeeping fields; the OS-level
//! byte-range lock that marks a cursor as "in use" for abandonment
//! detection is owned by `store.rs`'s handle type, since it needs its own
//! file descriptor independent of the arena's borrow.

use crate::arena::Arena;
use crate::chain;
use crate::error::StoreError;
use crate::header::Header;
use crate::layout::{Edge, TAG_CURSOR, TAG_FREE};
use crate::slot::{SlotView, SlotViewMut};

const PID_WIDTH: usize = std::mem::size_of::<libc::pid_t>();

fn load(arena: &Arena, header: &Header, offset: u64) -> Result<Vec<u8>, StoreError> {
    arena.read_at(offset, header.record_len as usize)
}

fn store(arena: &mut Arena, offset: u64, buf: &[u8]) -> Result<(), StoreError> {
    arena.write_at(offset, buf)
}

/// Cursor per-key fields are plain offsets, never real threads; both
/// `Edge` variants carry one (`0` meaning exhausted), so this just reads
/// it back out regardless of which variant `Edge::decode` produced.
fn edge_raw(edge: Edge) -> u64 {
    match edge {
        Edge::Child(off) | Edge::Thread(off) => off,
    }
}

fn raw_edge(offset: u64) -> Edge {
    if offset == 0 {
        Edge::Thread(0)
    } else {
        Edge::Child(offset)
    }
}

/// Reads the PID stamped in a cursor slot's payload.
pub(crate) fn pid_of(arena: &Arena, header: &Header, offset: u64) -> Result<libc::pid_t, StoreError> {
    let buf = load(arena, header, offset)?;
    let view = SlotView::new(&buf, header.key_count);
    let payload = view.payload();
    if payload.len() < PID_WIDTH {
        return Err(StoreError::corrupt("cursor payload too short to hold a pid"));
    }
    let mut raw = [0u8; PID_WIDTH];
    raw.copy_from_slice(&payload[..PID_WIDTH]);
    Ok(libc::pid_t::from_ne_bytes(raw))
}

fn set_pid(arena: &mut Arena, header: &Header, offset: u64, pid: libc::pid_t) -> Result<(), StoreError> {
    let mut buf = load(arena, header, offset)?;
    {
        let mut view = SlotViewMut::new(&mut buf, header.key_count);
        view.payload_mut()[..PID_WIDTH].copy_from_slice(&pid.to_ne_bytes());
    }
    store(arena, offset, &buf)
}

/// The offset `key`'s `next()` call on the cursor at `cursor_offset` will
/// yield, or `0` if exhausted.
pub(crate) fn right(arena: &Arena, header: &Header, cursor_offset: u64, key: u32) -> Result<u64, StoreError> {
    let buf = load(arena, header, cursor_offset)?;
    Ok(edge_raw(SlotView::new(&buf, header.key_count).right(key)))
}

/// The offset `key`'s `prev()` call on the cursor at `cursor_offset` will
/// yield, or `0` if exhausted.
pub(crate) fn left(arena: &Arena, header: &Header, cursor_offset: u64, key: u32) -> Result<u64, StoreError> {
    let buf = load(arena, header, cursor_offset)?;
    Ok(edge_raw(SlotView::new(&buf, header.key_count).left(key)))
}

pub(crate) fn set_right(
    arena: &mut Arena,
    header: &Header,
    cursor_offset: u64,
    key: u32,
    target: u64,
) -> Result<(), StoreError> {
    let mut buf = load(arena, header, cursor_offset)?;
    SlotViewMut::new(&mut buf, header.key_count).set_right(key, raw_edge(target));
    store(arena, cursor_offset, &buf)
}

pub(crate) fn set_left(
    arena: &mut Arena,
    header: &Header,
    cursor_offset: u64,
    key: u32,
    target: u64,
) -> Result<(), StoreError> {
    let mut buf = load(arena, header, cursor_offset)?;
    SlotViewMut::new(&mut buf, header.key_count).set_left(key, raw_edge(target));
    store(arena, cursor_offset, &buf)
}

/// The `readseq` walk position (reuses `PrevSeq`), or `0` if exhausted /
/// never started.
pub(crate) fn readseq_pos(arena: &Arena, header: &Header, cursor_offset: u64) -> Result<u64, StoreError> {
    let buf = load(arena, header, cursor_offset)?;
    Ok(SlotView::new(&buf, header.key_count).prev_seq())
}

pub(crate) fn set_readseq_pos(
    arena: &mut Arena,
    header: &Header,
    cursor_offset: u64,
    target: u64,
) -> Result<(), StoreError> {
    let mut buf = load(arena, header, cursor_offset)?;
    SlotViewMut::new(&mut buf, header.key_count).set_prev_seq(target);
    store(arena, cursor_offset, &buf)
}

/// Walks `HeadCpr` looking for a slot whose stamped PID differs from
/// `my_pid` and whose slot-length byte range `is_stealable` reports free.
/// Removes it from `HeadCpr` (the caller is about to re-chain it) and
/// returns its offset. Does not touch `HeadEmpty`.
fn steal_abandoned(
    arena: &mut Arena,
    header: &mut Header,
    my_pid: libc::pid_t,
    is_stealable: &dyn Fn(u64) -> Result<bool, StoreError>,
) -> Result<Option<u64>, StoreError> {
    let mut cur = header.head_cpr;
    while cur != 0 {
        let buf = load(arena, header, cur)?;
        let next = SlotView::new(&buf, header.key_count).next_seq();
        let owner = pid_of(arena, header, cur)?;
        if owner != my_pid && is_stealable(cur)? {
            chain::remove(arena, &mut header.head_cpr, header.key_count, header.record_len, cur)?;
            return Ok(Some(cur));
        }
        cur = next;
    }
    Ok(None)
}

/// Allocates a cursor slot for `my_pid`: steals an abandoned one if
/// `is_stealable` finds one on `HeadCpr`, otherwise reuses a free slot,
/// otherwise appends. The returned slot is already prepended to `HeadCpr`,
/// tagged, stamped, and zeroed — the caller still owns acquiring the
/// matching byte-range lock, since that needs its own file descriptor.
pub(crate) fn open_cursor(
    arena: &mut Arena,
    header: &mut Header,
    my_pid: libc::pid_t,
    is_stealable: &dyn Fn(u64) -> Result<bool, StoreError>,
) -> Result<u64, StoreError> {
    let kc = header.key_count;
    let offset = match steal_abandoned(arena, header, my_pid, is_stealable)? {
        Some(off) => off,
        None => match chain::pop_front(arena, &mut header.head_empty, kc, header.record_len)? {
            Some(off) => off,
            None => {
                let zeroed = vec![0u8; header.record_len as usize];
                arena.append(&zeroed)?
            }
        },
    };

    let mut buf = load(arena, header, offset)?;
    {
        let mut view = SlotViewMut::new(&mut buf, kc);
        view.clear();
        view.set_kind_tag(TAG_CURSOR);
        for key in 0..kc {
            view.set_left(key, Edge::Thread(0));
            view.set_right(key, Edge::Thread(0));
        }
        view.set_prev_seq(0);
        view.set_next_seq(0);
    }
    store(arena, offset, &buf)?;

    chain::push_front(arena, &mut header.head_cpr, kc, header.record_len, offset)?;
    set_pid(arena, header, offset, my_pid)?;
    Ok(offset)
}

/// Reverses [`open_cursor`]: unlinks `offset` from `HeadCpr`, clears it to
/// a free slot, and prepends it to `HeadEmpty`. The caller is responsible
/// for releasing the byte-range lock first.
pub(crate) fn close_cursor(arena: &mut Arena, header: &mut Header, offset: u64) -> Result<(), StoreError> {
    let kc = header.key_count;
    chain::remove(arena, &mut header.head_cpr, kc, header.record_len, offset)?;

    let mut buf = load(arena, header, offset)?;
    {
        let mut view = SlotViewMut::new(&mut buf, kc);
        view.clear();
        view.set_kind_tag(TAG_FREE);
    }
    store(arena, offset, &buf)?;

    chain::push_front(arena, &mut header.head_empty, kc, header.record_len, offset)
}

/// Walks `HeadCpr`, applying `patch` to every open cursor. Used by delete
/// (spec `§4.5`) to repoint any cursor referencing a just-removed record.
pub(crate) fn for_each_cursor(
    arena: &mut Arena,
    header: &mut Header,
    mut patch: impl FnMut(&mut Arena, &mut Header, u64) -> Result<(), StoreError>,
) -> Result<(), StoreError> {
    let mut cur = header.head_cpr;
    while cur != 0 {
        let buf = load(arena, header, cur)?;
        let next = SlotView::new(&buf, header.key_count).next_seq();
        patch(arena, header, cur)?;
        cur = next;
    }
    Ok(())
}

/// Repoints every per-key `left`/`right` field and the `readseq` position
/// on `cursor_offset` that currently references `old` to `new` (`new = 0`
/// meaning "exhausted" when the target had no further neighbor).
pub(crate) fn repoint(
    arena: &mut Arena,
    header: &mut Header,
    cursor_offset: u64,
    old: u64,
    new_left: u64,
    new_right: u64,
    new_seq: u64,
) -> Result<(), StoreError> {
    for key in 0..header.key_count {
        if left(arena, header, cursor_offset, key)? == old {
            set_left(arena, header, cursor_offset, key, new_left)?;
        }
        if right(arena, header, cursor_offset, key)? == old {
            set_right(arena, header, cursor_offset, key, new_right)?;
        }
    }
    if readseq_pos(arena, header, cursor_offset)? == old {
        set_readseq_pos(arena, header, cursor_offset, new_seq)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Header;

    fn fresh(key_count: u32, data_len: u32) -> (tempfile::NamedTempFile, Arena, Header) {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        let mut arena = Arena::open(file.path()).expect("open");
        let header = Header::new(key_count, data_len).expect("header");
        arena.append(&header.encode()).expect("append header");
        (file, arena, header)
    }

    #[test]
    fn open_then_close_round_trips_through_free_list() {
        let (_guard, mut arena, mut header) = fresh(2, 8);
        let off = open_cursor(&mut arena, &mut header, 42, &|_| Ok(false)).expect("open");
        assert_eq!(header.head_cpr, off);
        assert_eq!(pid_of(&arena, &header, off).expect("pid"), 42);
        assert_eq!(left(&arena, &header, off, 0).expect("left"), 0);

        close_cursor(&mut arena, &mut header, off).expect("close");
        assert_eq!(header.head_cpr, 0);
        assert_eq!(header.head_empty, off);
    }

    #[test]
    fn reopen_reuses_freed_slot() {
        let (_guard, mut arena, mut header) = fresh(1, 8);
        let first = open_cursor(&mut arena, &mut header, 1, &|_| Ok(false)).expect("open");
        close_cursor(&mut arena, &mut header, first).expect("close");
        let second = open_cursor(&mut arena, &mut header, 2, &|_| Ok(false)).expect("open");
        assert_eq!(first, second);
    }

    #[test]
    fn steals_abandoned_cursor_over_appending() {
        let (_guard, mut arena, mut header) = fresh(1, 8);
        let abandoned = open_cursor(&mut arena, &mut header, 1, &|_| Ok(false)).expect("open");
        let stolen = open_cursor(&mut arena, &mut header, 2, &|_| Ok(true)).expect("open");
        assert_eq!(abandoned, stolen);
        assert_eq!(pid_of(&arena, &header, stolen).expect("pid"), 2);
    }
}
