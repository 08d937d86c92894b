//! The sequential list: every live record linked through `prev_seq`/
//! `next_seq`, most recently inserted first.
//!
//! Insert prepends, delete unlinks; both run under the caller's already-held
//! gate and mutate `header.head_seq` in place, leaving the header write-back
//! to the caller.

use crate::arena::Arena;
use crate::error::StoreError;
use crate::header::Header;
use crate::slot::{SlotView, SlotViewMut};

fn load(arena: &Arena, header: &Header, offset: u64) -> Result<Vec<u8>, StoreError> {
    arena.read_at(offset, header.record_len as usize)
}

fn store(arena: &mut Arena, offset: u64, buf: &[u8]) -> Result<(), StoreError> {
    arena.write_at(offset, buf)
}

/// Prepends the slot at `offset` onto the sequential list.
pub(crate) fn prepend(
    arena: &mut Arena,
    header: &mut Header,
    offset: u64,
) -> Result<(), StoreError> {
    let old_head = header.head_seq;
    let mut buf = load(arena, header, offset)?;
    {
        let mut view = SlotViewMut::new(&mut buf, header.key_count);
        view.set_prev_seq(0);
        view.set_next_seq(old_head);
    }
    store(arena, offset, &buf)?;

    if old_head != 0 {
        let mut head_buf = load(arena, header, old_head)?;
        SlotViewMut::new(&mut head_buf, header.key_count).set_prev_seq(offset);
        store(arena, old_head, &head_buf)?;
    }

    header.head_seq = offset;
    Ok(())
}

/// Unlinks the slot at `offset` from the sequential list. Does not touch
/// the slot's own `prev_seq`/`next_seq`; the caller is about to repurpose
/// or clear them.
pub(crate) fn unlink(arena: &mut Arena, header: &mut Header, offset: u64) -> Result<(), StoreError> {
    let buf = load(arena, header, offset)?;
    let (prev, next) = {
        let view = SlotView::new(&buf, header.key_count);
        (view.prev_seq(), view.next_seq())
    };

    if prev != 0 {
        let mut prev_buf = load(arena, header, prev)?;
        SlotViewMut::new(&mut prev_buf, header.key_count).set_next_seq(next);
        store(arena, prev, &prev_buf)?;
    } else {
        header.head_seq = next;
    }

    if next != 0 {
        let mut next_buf = load(arena, header, next)?;
        SlotViewMut::new(&mut next_buf, header.key_count).set_prev_seq(prev);
        store(arena, next, &next_buf)?;
    }

    Ok(())
}
