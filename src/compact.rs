//! The compactor: relocates live (and this opener's own cursor) slots down
//! into low free slots and truncates the file, per spec `§4.7`.
//!
//! Every relocation is a full rewrite pass: the moved slot's bytes are
//! copied verbatim (its own fields reference *other* offsets, which don't
//! move), then every pointer anywhere in the arena that referenced the old
//! offset — tree edges and threads across every key, the sequential list's
//! neighbors, and every open cursor's per-key position and `readseq`
//! walk — is rewritten to the new one.

use crate::arena::Arena;
use crate::chain;
use crate::cursor;
use crate::error::StoreError;
use crate::header::{self, Header};
use crate::layout::{Edge, TAG_FREE};
use crate::slot::{SlotKind, SlotView, SlotViewMut};

fn load(arena: &Arena, header: &Header, offset: u64) -> Result<Vec<u8>, StoreError> {
    arena.read_at(offset, header.record_len as usize)
}

fn store(arena: &mut Arena, offset: u64, buf: &[u8]) -> Result<(), StoreError> {
    arena.write_at(offset, buf)
}

fn slot_kind_at(arena: &Arena, header: &Header, offset: u64) -> Result<SlotKind, StoreError> {
    let buf = load(arena, header, offset)?;
    let view = SlotView::new(&buf, header.key_count);
    let kind = view.kind();
    if kind == SlotKind::Live {
        let bal = view.balance(0);
        if !(-2..=2).contains(&bal) {
            return Err(StoreError::corrupt(format!(
                "slot at {offset} has balance {bal}, neither a live node nor a recognized tag"
            )));
        }
    }
    Ok(kind)
}

/// The lowest offset currently on `HeadEmpty`, or `None` if the free list
/// is empty. The list is unordered, so this is a full walk.
fn lowest_free(arena: &Arena, header: &Header) -> Result<Option<u64>, StoreError> {
    let mut cur = header.head_empty;
    let mut min = None;
    while cur != 0 {
        min = Some(match min {
            Some(m) if m < cur => m,
            _ => cur,
        });
        let buf = load(arena, header, cur)?;
        cur = SlotView::new(&buf, header.key_count).next_seq();
    }
    Ok(min)
}

fn relocate_slot_bytes(arena: &mut Arena, header: &Header, old: u64, new: u64) -> Result<(), StoreError> {
    let buf = load(arena, header, old)?;
    store(arena, new, &buf)
}

/// Fixes the one `HeadCpr` link (a predecessor's `next_seq`, or the head
/// itself) that pointed at `old`.
fn relink_cursor_chain(arena: &mut Arena, header: &mut Header, old: u64, new: u64) -> Result<(), StoreError> {
    if header.head_cpr == old {
        header.head_cpr = new;
        return Ok(());
    }
    let mut cur = header.head_cpr;
    while cur != 0 {
        let buf = load(arena, header, cur)?;
        let next = SlotView::new(&buf, header.key_count).next_seq();
        if next == old {
            let mut buf = load(arena, header, cur)?;
            SlotViewMut::new(&mut buf, header.key_count).set_next_seq(new);
            return store(arena, cur, &buf);
        }
        cur = next;
    }
    Err(StoreError::corrupt(format!(
        "cursor slot {old} was not reachable on HeadCpr during compaction"
    )))
}

/// Fixes the sequential list's doubly linked neighbors (or `HeadSeq`) that
/// pointed at `old`, reading the moved record's own links from `new`.
fn relink_seqlist_neighbors(arena: &mut Arena, header: &mut Header, new: u64) -> Result<(), StoreError> {
    let buf = load(arena, header, new)?;
    let view = SlotView::new(&buf, header.key_count);
    let (prev, next) = (view.prev_seq(), view.next_seq());

    if prev != 0 {
        let mut pbuf = load(arena, header, prev)?;
        SlotViewMut::new(&mut pbuf, header.key_count).set_next_seq(new);
        store(arena, prev, &pbuf)?;
    } else {
        header.head_seq = new;
    }
    if next != 0 {
        let mut nbuf = load(arena, header, next)?;
        SlotViewMut::new(&mut nbuf, header.key_count).set_prev_seq(new);
        store(arena, next, &nbuf)?;
    }
    Ok(())
}

/// Walks key `key`'s tree rewriting every edge (child or thread) that
/// referenced `old` to `new`, including `Roots[key]` itself.
fn rewrite_tree_references(
    arena: &mut Arena,
    header: &mut Header,
    key: u32,
    old: u64,
    new: u64,
) -> Result<(), StoreError> {
    if header.roots[key as usize] == old {
        header.roots[key as usize] = new;
    }
    rewrite_subtree(arena, header, key, header.roots[key as usize], old, new)
}

fn rewrite_subtree(
    arena: &mut Arena,
    header: &Header,
    key: u32,
    offset: u64,
    old: u64,
    new: u64,
) -> Result<(), StoreError> {
    if offset == 0 {
        return Ok(());
    }
    let mut buf = load(arena, header, offset)?;
    let (left, right) = {
        let view = SlotView::new(&buf, header.key_count);
        (view.left(key), view.right(key))
    };
    let retarget = |edge: Edge| match edge {
        Edge::Child(c) if c == old => Edge::Child(new),
        Edge::Thread(t) if t == old => Edge::Thread(new),
        other => other,
    };
    let (new_left, new_right) = (retarget(left), retarget(right));
    if new_left != left || new_right != right {
        let mut view = SlotViewMut::new(&mut buf, header.key_count);
        view.set_left(key, new_left);
        view.set_right(key, new_right);
        store(arena, offset, &buf)?;
    }

    if let Edge::Child(c) = new_left {
        rewrite_subtree(arena, header, key, c, old, new)?;
    }
    if let Edge::Child(c) = new_right {
        rewrite_subtree(arena, header, key, c, old, new)?;
    }
    Ok(())
}

/// Reaps every cursor on `HeadCpr` owned by a PID other than `my_pid` whose
/// byte-range lock `is_free` reports acquirable (i.e. abandoned), freeing
/// each one. Collects candidates before mutating, since removal changes
/// the very `next_seq` links the walk depends on.
fn reap_abandoned_cursors(
    arena: &mut Arena,
    header: &mut Header,
    my_pid: libc::pid_t,
    is_free: &dyn Fn(u64) -> Result<bool, StoreError>,
) -> Result<u32, StoreError> {
    let kc = header.key_count;
    let mut candidates = Vec::new();
    let mut cur = header.head_cpr;
    while cur != 0 {
        let buf = load(arena, header, cur)?;
        let next = SlotView::new(&buf, kc).next_seq();
        if cursor::pid_of(arena, header, cur)? != my_pid && is_free(cur)? {
            candidates.push(cur);
        }
        cur = next;
    }

    for off in &candidates {
        chain::remove(arena, &mut header.head_cpr, kc, header.record_len, *off)?;
        let mut buf = load(arena, header, *off)?;
        {
            let mut view = SlotViewMut::new(&mut buf, kc);
            view.clear();
            view.set_kind_tag(TAG_FREE);
        }
        store(arena, *off, &buf)?;
        chain::push_front(arena, &mut header.head_empty, kc, header.record_len, *off)?;
    }
    Ok(candidates.len() as u32)
}

/// Runs compaction to completion (or until blocked by a foreign cursor
/// sitting at the tail, which is not an error — see spec `§4.7`).
///
/// `is_free` probes whether a cursor's byte-range lock is currently
/// acquirable (used both to reap abandoned cursors and, implicitly, to
/// confirm this opener's own cursor is the one being relocated).
/// `relocate_own_lock(old, new)` is called whenever this opener's own
/// cursor slot moves, so the caller can re-acquire its OS-level lock at
/// the new offset before the old range is truncated away.
pub(crate) fn squash(
    arena: &mut Arena,
    header: &mut Header,
    my_pid: libc::pid_t,
    is_free: &dyn Fn(u64) -> Result<bool, StoreError>,
    relocate_own_lock: &mut dyn FnMut(u64, u64) -> Result<(), StoreError>,
) -> Result<(), StoreError> {
    reap_abandoned_cursors(arena, header, my_pid, is_free)?;

    loop {
        let header_len = header::header_len(header.key_count);
        if arena.len() <= header_len {
            break;
        }
        let highest = arena.len() - header.record_len as u64;
        match slot_kind_at(arena, header, highest)? {
            SlotKind::Free => {
                chain::remove(arena, &mut header.head_empty, header.key_count, header.record_len, highest)?;
                arena.truncate(highest)?;
            }
            SlotKind::Cursor => {
                if cursor::pid_of(arena, header, highest)? != my_pid {
                    // A foreign opener's still-live cursor blocks further
                    // compaction; this is the documented terminal state,
                    // not a failure.
                    break;
                }
                let Some(lowest) = lowest_free(arena, header)?.filter(|&l| l < highest) else {
                    break;
                };
                chain::remove(arena, &mut header.head_empty, header.key_count, header.record_len, lowest)?;
                relocate_slot_bytes(arena, header, highest, lowest)?;
                relink_cursor_chain(arena, header, highest, lowest)?;
                relocate_own_lock(highest, lowest)?;
                arena.truncate(highest)?;
            }
            SlotKind::Live => {
                let Some(lowest) = lowest_free(arena, header)?.filter(|&l| l < highest) else {
                    break;
                };
                chain::remove(arena, &mut header.head_empty, header.key_count, header.record_len, lowest)?;
                relocate_slot_bytes(arena, header, highest, lowest)?;
                relink_seqlist_neighbors(arena, header, lowest)?;
                for key in 0..header.key_count {
                    rewrite_tree_references(arena, header, key, highest, lowest)?;
                }
                cursor::for_each_cursor(arena, header, |a, h, off| {
                    cursor::repoint(a, h, off, highest, lowest, lowest, lowest)
                })?;
                arena.truncate(highest)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree;

    fn fresh(key_count: u32, data_len: u32) -> (tempfile::NamedTempFile, Arena, Header) {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        let mut arena = Arena::open(file.path()).expect("open");
        let header = Header::new(key_count, data_len).expect("header");
        arena.append(&header.encode()).expect("append header");
        (file, arena, header)
    }

    fn cmp(_key: u32, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
        a.cmp(b)
    }

    fn insert_payload(arena: &mut Arena, header: &mut Header, payload: &[u8]) -> u64 {
        let mut buf = vec![0u8; header.record_len as usize];
        SlotViewMut::new(&mut buf, header.key_count).set_payload(payload);
        let off = arena.append(&buf).expect("append slot");
        crate::seqlist::prepend(arena, header, off).expect("seqlist prepend");
        for key in 0..header.key_count {
            tree::insert(arena, header, &cmp, key, off).expect("tree insert");
        }
        header.live_count += 1;
        off
    }

    #[test]
    fn squash_reclaims_deleted_slots_and_truncates() {
        let (_guard, mut arena, mut header) = fresh(1, 4);
        let offs: Vec<u64> = (0..5)
            .map(|i| insert_payload(&mut arena, &mut header, &(i as u32).to_ne_bytes()))
            .collect();

        for &off in &offs[..4] {
            crate::seqlist::unlink(&mut arena, &mut header, off).expect("unlink");
            tree::remove(&mut arena, &mut header, &cmp, 0, off).expect("remove");
            header.live_count -= 1;
            let mut buf = arena.read_at(off, header.record_len as usize).expect("read");
            SlotViewMut::new(&mut buf, header.key_count).clear();
            SlotViewMut::new(&mut buf, header.key_count).set_kind_tag(TAG_FREE);
            arena.write_at(off, &buf).expect("write free tag");
            chain::push_front(&mut arena, &mut header.head_empty, header.key_count, header.record_len, off)
                .expect("push free");
        }

        squash(&mut arena, &mut header, 1, &|_| Ok(false), &mut |_, _| Ok(())).expect("squash");

        let header_len = header::header_len(header.key_count);
        assert_eq!(arena.len(), header_len + header.record_len as u64);
        assert_eq!(header.live_count, 1);
        let report = tree::scan(&arena, &header, 0).expect("scan");
        assert!(report.divergence.is_none());
        assert_eq!(report.count, 1);
    }
}
