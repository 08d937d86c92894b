//! Singly linked chains over `next_seq`, shared by the free list and the
//! cursor list (`HeadEmpty`/`HeadCpr`). Both reuse the same field the
//! sequential list uses for its forward link, since free and cursor slots
//! never belong to the sequential list and `prev_seq` on a cursor slot is
//! already the readseq position.

use crate::arena::Arena;
use crate::error::StoreError;
use crate::slot::{SlotView, SlotViewMut};

fn next_of(arena: &Arena, key_count: u32, record_len: u32, offset: u64) -> Result<u64, StoreError> {
    let buf = arena.read_at(offset, record_len as usize)?;
    Ok(SlotView::new(&buf, key_count).next_seq())
}

fn set_next(
    arena: &mut Arena,
    key_count: u32,
    record_len: u32,
    offset: u64,
    next: u64,
) -> Result<(), StoreError> {
    let mut buf = arena.read_at(offset, record_len as usize)?;
    SlotViewMut::new(&mut buf, key_count).set_next_seq(next);
    arena.write_at(offset, &buf)
}

/// Pushes `offset` onto the front of the chain rooted at `*head`.
pub(crate) fn push_front(
    arena: &mut Arena,
    head: &mut u64,
    key_count: u32,
    record_len: u32,
    offset: u64,
) -> Result<(), StoreError> {
    set_next(arena, key_count, record_len, offset, *head)?;
    *head = offset;
    Ok(())
}

/// Pops the slot at the front of the chain rooted at `*head`, if any.
pub(crate) fn pop_front(
    arena: &Arena,
    head: &mut u64,
    key_count: u32,
    record_len: u32,
) -> Result<Option<u64>, StoreError> {
    if *head == 0 {
        return Ok(None);
    }
    let offset = *head;
    *head = next_of(arena, key_count, record_len, offset)?;
    Ok(Some(offset))
}

/// Removes `target` from the chain rooted at `*head`, wherever it is.
/// Returns an error if `target` is not actually on the chain.
pub(crate) fn remove(
    arena: &mut Arena,
    head: &mut u64,
    key_count: u32,
    record_len: u32,
    target: u64,
) -> Result<(), StoreError> {
    if *head == target {
        *head = next_of(arena, key_count, record_len, target)?;
        return Ok(());
    }
    let mut cur = *head;
    while cur != 0 {
        let next = next_of(arena, key_count, record_len, cur)?;
        if next == target {
            let target_next = next_of(arena, key_count, record_len, target)?;
            set_next(arena, key_count, record_len, cur, target_next)?;
            return Ok(());
        }
        cur = next;
    }
    Err(StoreError::corrupt(format!(
        "offset {target} is not reachable on the expected chain"
    )))
}
