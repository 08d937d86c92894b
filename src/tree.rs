//! The AVL index set: one threaded AVL tree per key, all sharing the same
//! physical slots.
//!
//! Every function here operates on a single key index at a time; the
//! caller (`store.rs`) is responsible for looping over `0..key_count` when
//! a mutation (insert/delete) must be reflected in every tree. Comparisons
//! are delegated to the host through [`KeyComparator`], which is handed
//! only the `DataLen`-sized payload of each candidate record, never the
//! internal node bookkeeping.
//!
//! Rotations never change in-order sequence, only which edges are real
//! children versus threads; see the module-level comment in `layout.rs`
//! for the sign convention on edges. The stored balance factor is
//! `height(left) - height(right)` throughout this module: `+2` means
//! left-heavy (dispatched to the left child by `rotate_full`), `-2` means
//! right-heavy, and `scan_node` verifies the same `hl - hr` quantity. The
//! balance-factor tables used here (for both insertion and deletion) are
//! the standard ones for AVL trees; the deletion side additionally tracks
//! whether a rotation shortened the rebalanced subtree, since that
//! determines whether rebalancing must keep walking toward the root.

use std::cmp::Ordering;

use crate::arena::Arena;
use crate::error::StoreError;
use crate::header::Header;
use crate::layout::{Edge, Side};
use crate::slot::{SlotView, SlotViewMut};

/// Compares two payloads under a given key index, the same shape as the
/// host-supplied callback described in spec `§4.4`.
pub trait KeyComparator {
    fn compare(&self, key: u32, a: &[u8], b: &[u8]) -> Ordering;
}

impl<F> KeyComparator for F
where
    F: Fn(u32, &[u8], &[u8]) -> Ordering,
{
    fn compare(&self, key: u32, a: &[u8], b: &[u8]) -> Ordering {
        self(key, a, b)
    }
}

fn load(arena: &Arena, header: &Header, offset: u64) -> Result<Vec<u8>, StoreError> {
    arena.read_at(offset, header.record_len as usize)
}

fn store(arena: &mut Arena, offset: u64, buf: &[u8]) -> Result<(), StoreError> {
    arena.write_at(offset, buf)
}

fn child_or_zero(edge: Edge) -> u64 {
    match edge {
        Edge::Child(off) => off,
        Edge::Thread(_) => 0,
    }
}

/// The in-order successor of `offset` under `key`, or `0` if `offset` is
/// the last record in that tree's order.
pub(crate) fn in_order_successor(
    arena: &Arena,
    header: &Header,
    key: u32,
    offset: u64,
) -> Result<u64, StoreError> {
    let buf = load(arena, header, offset)?;
    match SlotView::new(&buf, header.key_count).right(key) {
        Edge::Thread(t) => Ok(t),
        Edge::Child(mut cur) => loop {
            let buf = load(arena, header, cur)?;
            match SlotView::new(&buf, header.key_count).left(key) {
                Edge::Child(l) => cur = l,
                Edge::Thread(_) => return Ok(cur),
            }
        },
    }
}

/// The in-order predecessor of `offset` under `key`, or `0` if `offset` is
/// the first record in that tree's order.
pub(crate) fn in_order_predecessor(
    arena: &Arena,
    header: &Header,
    key: u32,
    offset: u64,
) -> Result<u64, StoreError> {
    let buf = load(arena, header, offset)?;
    match SlotView::new(&buf, header.key_count).left(key) {
        Edge::Thread(t) => Ok(t),
        Edge::Child(mut cur) => loop {
            let buf = load(arena, header, cur)?;
            match SlotView::new(&buf, header.key_count).right(key) {
                Edge::Child(r) => cur = r,
                Edge::Thread(_) => return Ok(cur),
            }
        },
    }
}

/// Descends for the first record whose key-`key` comparison against `probe`
/// is equal. Returns [`StoreError::NotFound`] if the descent runs off the
/// tree without finding one.
pub(crate) fn find(
    arena: &Arena,
    header: &Header,
    cmp: &dyn KeyComparator,
    key: u32,
    probe: &[u8],
) -> Result<u64, StoreError> {
    let mut cur = header.roots[key as usize];
    if cur == 0 {
        return Err(StoreError::NotFound);
    }
    loop {
        let buf = load(arena, header, cur)?;
        let view = SlotView::new(&buf, header.key_count);
        match cmp.compare(key, probe, view.payload()) {
            Ordering::Equal => return Ok(cur),
            Ordering::Less => match view.left(key) {
                Edge::Child(l) => cur = l,
                Edge::Thread(_) => return Err(StoreError::NotFound),
            },
            Ordering::Greater => match view.right(key) {
                Edge::Child(r) => cur = r,
                Edge::Thread(_) => return Err(StoreError::NotFound),
            },
        }
    }
}

/// Descends for the first record with a key-`key` tie against `probe`, then
/// walks the in-order thread chain in both directions (the tie run is
/// always contiguous in-order, regardless of tree shape) looking for the
/// first candidate satisfying `is_match`. Used by delete (bytewise payload
/// equality) and update (cross-key equality).
pub(crate) fn locate(
    arena: &Arena,
    header: &Header,
    cmp: &dyn KeyComparator,
    key: u32,
    probe: &[u8],
    is_match: &dyn Fn(&[u8]) -> bool,
) -> Result<u64, StoreError> {
    let mut cur = header.roots[key as usize];
    if cur == 0 {
        return Err(StoreError::NotFound);
    }
    let start = loop {
        let buf = load(arena, header, cur)?;
        let view = SlotView::new(&buf, header.key_count);
        match cmp.compare(key, probe, view.payload()) {
            Ordering::Equal => break cur,
            Ordering::Less => match view.left(key) {
                Edge::Child(l) => cur = l,
                Edge::Thread(_) => return Err(StoreError::NotFound),
            },
            Ordering::Greater => match view.right(key) {
                Edge::Child(r) => cur = r,
                Edge::Thread(_) => return Err(StoreError::NotFound),
            },
        }
    };

    let start_buf = load(arena, header, start)?;
    if is_match(SlotView::new(&start_buf, header.key_count).payload()) {
        return Ok(start);
    }

    let mut p = in_order_predecessor(arena, header, key, start)?;
    while p != 0 {
        let buf = load(arena, header, p)?;
        let view = SlotView::new(&buf, header.key_count);
        if cmp.compare(key, probe, view.payload()) != Ordering::Equal {
            break;
        }
        if is_match(view.payload()) {
            return Ok(p);
        }
        p = in_order_predecessor(arena, header, key, p)?;
    }

    let mut s = in_order_successor(arena, header, key, start)?;
    while s != 0 {
        let buf = load(arena, header, s)?;
        let view = SlotView::new(&buf, header.key_count);
        if cmp.compare(key, probe, view.payload()) != Ordering::Equal {
            break;
        }
        if is_match(view.payload()) {
            return Ok(s);
        }
        s = in_order_successor(arena, header, key, s)?;
    }

    Err(StoreError::NotFound)
}

/// Finds the smallest record with key-`key` ≥ `probe`. On success, returns
/// `(predecessor_of_found, found, successor_of_found)`; the caller seeds a
/// cursor's `(left, right)` with the first and third so that `next()`/`prev()`
/// don't re-yield `found` itself.
pub(crate) fn start_ge(
    arena: &Arena,
    header: &Header,
    cmp: &dyn KeyComparator,
    key: u32,
    probe: &[u8],
) -> Result<(u64, u64, u64), StoreError> {
    let mut cur = header.roots[key as usize];
    let mut result = 0u64;
    while cur != 0 {
        let buf = load(arena, header, cur)?;
        let view = SlotView::new(&buf, header.key_count);
        if cmp.compare(key, probe, view.payload()) != Ordering::Greater {
            result = cur;
            cur = child_or_zero(view.left(key));
        } else {
            cur = child_or_zero(view.right(key));
        }
    }
    if result == 0 {
        return Err(StoreError::NotFound);
    }
    let pred = in_order_predecessor(arena, header, key, result)?;
    let succ = in_order_successor(arena, header, key, result)?;
    Ok((pred, result, succ))
}

/// Finds the largest record with key-`key` < `probe`. On success, returns
/// `(predecessor_of_found, found, successor_of_found)`; the caller seeds a
/// cursor's `(left, right)` with the first and third so that `next()`/`prev()`
/// don't re-yield `found` itself.
pub(crate) fn start_lt(
    arena: &Arena,
    header: &Header,
    cmp: &dyn KeyComparator,
    key: u32,
    probe: &[u8],
) -> Result<(u64, u64, u64), StoreError> {
    let mut cur = header.roots[key as usize];
    let mut result = 0u64;
    while cur != 0 {
        let buf = load(arena, header, cur)?;
        let view = SlotView::new(&buf, header.key_count);
        if cmp.compare(key, probe, view.payload()) == Ordering::Greater {
            result = cur;
            cur = child_or_zero(view.right(key));
        } else {
            cur = child_or_zero(view.left(key));
        }
    }
    if result == 0 {
        return Err(StoreError::NotFound);
    }
    let pred = in_order_predecessor(arena, header, key, result)?;
    let succ = in_order_successor(arena, header, key, result)?;
    Ok((pred, result, succ))
}

/// Inserts the already-allocated, already-populated slot at `offset` into
/// the key-`key` tree. The slot's payload must already be in place; its
/// key-`key` node fields must be zeroed (balance `0`, both edges
/// `Thread(0)`) before this is called.
pub(crate) fn insert(
    arena: &mut Arena,
    header: &mut Header,
    cmp: &dyn KeyComparator,
    key: u32,
    offset: u64,
) -> Result<(), StoreError> {
    let kc = header.key_count;
    if header.roots[key as usize] == 0 {
        let mut buf = load(arena, header, offset)?;
        {
            let mut view = SlotViewMut::new(&mut buf, kc);
            view.set_balance(key, 0);
            view.set_left(key, Edge::Thread(0));
            view.set_right(key, Edge::Thread(0));
        }
        store(arena, offset, &buf)?;
        header.roots[key as usize] = offset;
        return Ok(());
    }

    let new_payload = load(arena, header, offset)?;
    let new_payload = SlotView::new(&new_payload, kc).payload().to_vec();

    let mut ancestors: Vec<u64> = Vec::new();
    let mut dirs: Vec<Side> = Vec::new();
    let mut cur = header.roots[key as usize];
    let (attach_at, attach_side) = loop {
        let buf = load(arena, header, cur)?;
        let view = SlotView::new(&buf, kc);
        let side = match cmp.compare(key, &new_payload, view.payload()) {
            Ordering::Less => Side::Left,
            _ => Side::Right,
        };
        ancestors.push(cur);
        dirs.push(side);
        match view.edge(key, side) {
            Edge::Child(next) => cur = next,
            Edge::Thread(_) => break (cur, side),
        }
    };

    // Link the new leaf, inheriting the just-displaced thread and pointing
    // the other side back at the attachment node (its new neighbor).
    let mut attach_buf = load(arena, header, attach_at)?;
    let displaced_thread = SlotView::new(&attach_buf, kc).edge(key, attach_side).thread_value();
    let mut new_buf = load(arena, header, offset)?;
    {
        let mut view = SlotViewMut::new(&mut new_buf, kc);
        view.set_balance(key, 0);
        view.set_edge(key, attach_side, Edge::Thread(displaced_thread));
        view.set_edge(key, attach_side.flip(), Edge::Thread(attach_at));
    }
    store(arena, offset, &new_buf)?;
    {
        let mut view = SlotViewMut::new(&mut attach_buf, kc);
        view.set_edge(key, attach_side, Edge::Child(offset));
    }
    store(arena, attach_at, &attach_buf)?;

    rebalance_after_insert(arena, header, key, &ancestors, &dirs)
}

fn rebalance_after_insert(
    arena: &mut Arena,
    header: &mut Header,
    key: u32,
    ancestors: &[u64],
    dirs: &[Side],
) -> Result<(), StoreError> {
    let kc = header.key_count;
    let mut i = ancestors.len();
    while i > 0 {
        i -= 1;
        let node = ancestors[i];
        let d = dirs[i];
        let mut buf = load(arena, header, node)?;
        let mut bal = SlotView::new(&buf, kc).balance(key) as i32;
        // balance = height(left) - height(right): a left-side insertion grows
        // the left subtree, so it moves balance toward +1; a right-side
        // insertion moves it toward -1.
        bal += if d == Side::Left { 1 } else { -1 };

        if bal == 0 {
            SlotViewMut::new(&mut buf, kc).set_balance(key, 0);
            store(arena, node, &buf)?;
            return Ok(());
        } else if bal == 1 || bal == -1 {
            SlotViewMut::new(&mut buf, kc).set_balance(key, bal as i8);
            store(arena, node, &buf)?;
            continue;
        } else {
            let new_root = rotate(arena, header, key, node, bal as i8)?;
            if i == 0 {
                header.roots[key as usize] = new_root;
            } else {
                let parent = ancestors[i - 1];
                let pd = dirs[i - 1];
                let mut parent_buf = load(arena, header, parent)?;
                SlotViewMut::new(&mut parent_buf, kc).set_edge(key, pd, Edge::Child(new_root));
                store(arena, parent, &parent_buf)?;
            }
            return Ok(());
        }
    }
    Ok(())
}

struct RotationOutcome {
    new_root: u64,
    /// `true` if the rebalanced subtree's height decreased relative to
    /// before the deletion that triggered it; meaningless for insert.
    shrank: bool,
}

/// Performs the rotation needed to fix a node whose balance factor has
/// just become `±2`, and returns the new subtree root plus (for delete's
/// benefit) whether the subtree's height decreased.
fn rotate(
    arena: &mut Arena,
    header: &mut Header,
    key: u32,
    a_off: u64,
    a_bal: i8,
) -> Result<u64, StoreError> {
    Ok(rotate_full(arena, header, key, a_off, a_bal)?.new_root)
}

fn rotate_full(
    arena: &mut Arena,
    header: &mut Header,
    key: u32,
    a_off: u64,
    a_bal: i8,
) -> Result<RotationOutcome, StoreError> {
    let kc = header.key_count;
    let a_buf = load(arena, header, a_off)?;
    let a_view = SlotView::new(&a_buf, kc);

    if a_bal == 2 {
        let b_off = match a_view.left(key) {
            Edge::Child(b) => b,
            Edge::Thread(_) => return Err(StoreError::corrupt("rotation target has no left child")),
        };
        let b_bal = SlotView::new(&load(arena, header, b_off)?, kc).balance(key);
        if b_bal >= 0 {
            rotate_single(arena, header, key, a_off, b_off, b_bal, Side::Left)
        } else {
            let c_off = match SlotView::new(&load(arena, header, b_off)?, kc).right(key) {
                Edge::Child(c) => c,
                Edge::Thread(_) => return Err(StoreError::corrupt("LR rotation missing inner child")),
            };
            rotate_double(arena, header, key, a_off, b_off, c_off, Side::Left)
        }
    } else {
        let b_off = match a_view.right(key) {
            Edge::Child(b) => b,
            Edge::Thread(_) => return Err(StoreError::corrupt("rotation target has no right child")),
        };
        let b_bal = SlotView::new(&load(arena, header, b_off)?, kc).balance(key);
        if b_bal <= 0 {
            rotate_single(arena, header, key, a_off, b_off, b_bal, Side::Right)
        } else {
            let c_off = match SlotView::new(&load(arena, header, b_off)?, kc).left(key) {
                Edge::Child(c) => c,
                Edge::Thread(_) => return Err(StoreError::corrupt("RL rotation missing inner child")),
            };
            rotate_double(arena, header, key, a_off, b_off, c_off, Side::Right)
        }
    }
}

/// Single rotation. `heavy` is `Left` for LL (A left-heavy) or `Right` for
/// RR (A right-heavy); `b_off` is `A`'s child on that side.
fn rotate_single(
    arena: &mut Arena,
    header: &mut Header,
    key: u32,
    a_off: u64,
    b_off: u64,
    b_bal: i8,
    heavy: Side,
) -> Result<RotationOutcome, StoreError> {
    let kc = header.key_count;
    let mut a_buf = load(arena, header, a_off)?;
    let mut b_buf = load(arena, header, b_off)?;

    // B's edge facing A (the "inner" side) is what A inherits; B's edge
    // facing away from A becomes A's new edge toward B.
    let inner = heavy.flip();
    let b_inner_edge = SlotView::new(&b_buf, kc).edge(key, inner);
    let new_a_edge = match b_inner_edge {
        Edge::Child(x) => Edge::Child(x),
        Edge::Thread(_) => Edge::Thread(b_off),
    };
    SlotViewMut::new(&mut a_buf, kc).set_edge(key, heavy, new_a_edge);
    SlotViewMut::new(&mut b_buf, kc).set_edge(key, inner, Edge::Child(a_off));

    let (a_new_bal, b_new_bal, shrank) = if b_bal != 0 {
        (0i8, 0i8, true)
    } else {
        let (ab, bb) = match heavy {
            Side::Left => (1i8, -1i8),
            Side::Right => (-1i8, 1i8),
        };
        (ab, bb, false)
    };
    SlotViewMut::new(&mut a_buf, kc).set_balance(key, a_new_bal);
    SlotViewMut::new(&mut b_buf, kc).set_balance(key, b_new_bal);

    store(arena, a_off, &a_buf)?;
    store(arena, b_off, &b_buf)?;
    Ok(RotationOutcome { new_root: b_off, shrank })
}

/// Double rotation. `heavy` is `Left` for LR (A left-heavy, B right-heavy)
/// or `Right` for RL (A right-heavy, B left-heavy); `c_off` is B's child on
/// the side facing A.
fn rotate_double(
    arena: &mut Arena,
    header: &mut Header,
    key: u32,
    a_off: u64,
    b_off: u64,
    c_off: u64,
    heavy: Side,
) -> Result<RotationOutcome, StoreError> {
    let kc = header.key_count;
    let mut a_buf = load(arena, header, a_off)?;
    let mut b_buf = load(arena, header, b_off)?;
    let mut c_buf = load(arena, header, c_off)?;

    let c_view = SlotView::new(&c_buf, kc);
    let c_bal = c_view.balance(key);
    let c_left = c_view.edge(key, Side::Left);
    let c_right = c_view.edge(key, Side::Right);

    let derive = |e: Edge| match e {
        Edge::Child(x) => Edge::Child(x),
        Edge::Thread(_) => Edge::Thread(c_off),
    };

    // LR (heavy = Left): B.right <- C.left, A.left <- C.right, C = {B, A}.
    // RL (heavy = Right): B.left <- C.right, A.right <- C.left, C = {A, B}.
    match heavy {
        Side::Left => {
            SlotViewMut::new(&mut b_buf, kc).set_right(key, derive(c_left));
            SlotViewMut::new(&mut a_buf, kc).set_left(key, derive(c_right));
            SlotViewMut::new(&mut c_buf, kc).set_left(key, Edge::Child(b_off));
            SlotViewMut::new(&mut c_buf, kc).set_right(key, Edge::Child(a_off));
        }
        Side::Right => {
            SlotViewMut::new(&mut b_buf, kc).set_left(key, derive(c_right));
            SlotViewMut::new(&mut a_buf, kc).set_right(key, derive(c_left));
            SlotViewMut::new(&mut c_buf, kc).set_left(key, Edge::Child(a_off));
            SlotViewMut::new(&mut c_buf, kc).set_right(key, Edge::Child(b_off));
        }
    }

    let (a_new_bal, b_new_bal) = match (heavy, c_bal) {
        (Side::Left, 1) => (-1, 0),
        (Side::Left, -1) => (0, 1),
        (Side::Left, _) => (0, 0),
        (Side::Right, -1) => (1, 0),
        (Side::Right, 1) => (0, -1),
        (Side::Right, _) => (0, 0),
    };
    SlotViewMut::new(&mut a_buf, kc).set_balance(key, a_new_bal);
    SlotViewMut::new(&mut b_buf, kc).set_balance(key, b_new_bal);
    SlotViewMut::new(&mut c_buf, kc).set_balance(key, 0);

    store(arena, a_off, &a_buf)?;
    store(arena, b_off, &b_buf)?;
    store(arena, c_off, &c_buf)?;
    // Double rotations always restore height one shorter than before the
    // deletion that triggered them.
    Ok(RotationOutcome { new_root: c_off, shrank: true })
}

/// Removes `target_offset` from the key-`key` tree. The caller has already
/// located the offset (e.g. via [`locate`] against key 0); this performs
/// the structural descent, splice, and rebalance for one tree.
pub(crate) fn remove(
    arena: &mut Arena,
    header: &mut Header,
    cmp: &dyn KeyComparator,
    key: u32,
    target_offset: u64,
) -> Result<(), StoreError> {
    let kc = header.key_count;
    let target_payload = {
        let buf = load(arena, header, target_offset)?;
        SlotView::new(&buf, kc).payload().to_vec()
    };

    // Structural descent: ties always lie at the node itself or in its
    // right subtree (insert's tie-break sends equals right), so this
    // reaches `target_offset` deterministically regardless of how many
    // rotations have reshuffled the tie run since it was inserted.
    let mut ancestors: Vec<u64> = Vec::new();
    let mut dirs: Vec<Side> = Vec::new();
    let mut cur = header.roots[key as usize];
    if cur == 0 {
        return Err(StoreError::corrupt("delete target missing from its own tree"));
    }
    loop {
        if cur == target_offset {
            break;
        }
        let buf = load(arena, header, cur)?;
        let view = SlotView::new(&buf, kc);
        let c = cmp.compare(key, &target_payload, view.payload());
        let (side, next) = if c == Ordering::Less {
            (Side::Left, view.left(key))
        } else {
            (Side::Right, view.right(key))
        };
        ancestors.push(cur);
        dirs.push(side);
        match next {
            Edge::Child(n) => cur = n,
            Edge::Thread(_) => {
                return Err(StoreError::corrupt("delete target missing from its own tree"))
            }
        }
    }

    splice(arena, header, key, &mut ancestors, &mut dirs, target_offset)
}

/// Splices `node` (found at the end of `ancestors`/`dirs`, i.e. its parent
/// is `ancestors.last()`) out of the key-`key` tree and rebalances from
/// there to the root.
fn splice(
    arena: &mut Arena,
    header: &mut Header,
    key: u32,
    ancestors: &mut Vec<u64>,
    dirs: &mut Vec<Side>,
    node: u64,
) -> Result<(), StoreError> {
    let kc = header.key_count;
    let node_buf = load(arena, header, node)?;
    let node_view = SlotView::new(&node_buf, kc);
    let node_left = node_view.left(key);
    let node_right = node_view.right(key);
    let node_bal = node_view.balance(key);

    // Offset (and balance, for the two-children case) of whatever takes
    // `node`'s structural position, plus whether the subtree under it
    // shrank (so the caller knows whether to keep propagating).
    let (replacement, shrank) = match (node_left, node_right) {
        (Edge::Thread(p), Edge::Thread(t)) => {
            // Leaf: one of `p`/`t` is the parent itself (whichever side
            // `node` was attached on inherits its thread directly, fixed up
            // below via `link_removed`); the other, if it exists, is a
            // separate node whose thread pointed at `node` and must now
            // point at the parent instead.
            match dirs.last() {
                Some(Side::Left) if p != 0 => {
                    let mut p_buf = load(arena, header, p)?;
                    SlotViewMut::new(&mut p_buf, kc).set_right(key, Edge::Thread(t));
                    store(arena, p, &p_buf)?;
                }
                Some(Side::Right) if t != 0 => {
                    let mut t_buf = load(arena, header, t)?;
                    SlotViewMut::new(&mut t_buf, kc).set_left(key, Edge::Thread(p));
                    store(arena, t, &t_buf)?;
                }
                _ => {}
            }
            (None, true)
        }
        (Edge::Child(l), Edge::Thread(t)) => {
            // Only a left child: it takes `node`'s place directly; its
            // rightmost descendant's successor thread, which pointed at
            // `node`, must point past it to `node`'s old successor `t`. And
            // `t`, if it exists, had its predecessor thread pointing back at
            // `node`; that must now point at the new rightmost instead.
            let mut rightmost = l;
            loop {
                let buf = load(arena, header, rightmost)?;
                match SlotView::new(&buf, kc).right(key) {
                    Edge::Child(r) => rightmost = r,
                    Edge::Thread(_) => break,
                }
            }
            let mut rm_buf = load(arena, header, rightmost)?;
            SlotViewMut::new(&mut rm_buf, kc).set_right(key, node_right);
            store(arena, rightmost, &rm_buf)?;
            if t != 0 {
                let mut t_buf = load(arena, header, t)?;
                SlotViewMut::new(&mut t_buf, kc).set_left(key, Edge::Thread(rightmost));
                store(arena, t, &t_buf)?;
            }
            (Some(l), true)
        }
        (Edge::Thread(p), Edge::Child(r)) => {
            // Mirror: only a right child.
            let mut leftmost = r;
            loop {
                let buf = load(arena, header, leftmost)?;
                match SlotView::new(&buf, kc).left(key) {
                    Edge::Child(l) => leftmost = l,
                    Edge::Thread(_) => break,
                }
            }
            let mut lm_buf = load(arena, header, leftmost)?;
            SlotViewMut::new(&mut lm_buf, kc).set_left(key, node_left);
            store(arena, leftmost, &lm_buf)?;
            if p != 0 {
                let mut p_buf = load(arena, header, p)?;
                SlotViewMut::new(&mut p_buf, kc).set_right(key, Edge::Thread(leftmost));
                store(arena, p, &p_buf)?;
            }
            (Some(r), true)
        }
        (Edge::Child(l), Edge::Child(r)) => {
            let (succ, inner_shrank) = detach_successor(arena, header, key, node, l, r)?;
            (Some(succ), inner_shrank)
        }
    };

    match replacement {
        None => {
            let edge = match dirs.last().copied() {
                Some(Side::Left) => node_left,
                Some(Side::Right) => node_right,
                None => Edge::Thread(0),
            };
            link_removed(arena, header, key, ancestors, dirs, edge_as_link(edge))?;
        }
        Some(r) => {
            link_removed(arena, header, key, ancestors, dirs, LinkTarget::Node(r))?;
        }
    }
    let _ = node_bal;

    rebalance_after_delete(arena, header, key, ancestors, dirs, shrank)
}

/// What a parent's freed edge should become after splicing its child out:
/// either a real node (the promoted replacement) or a thread value.
enum LinkTarget {
    Node(u64),
    Thread(u64),
}

fn edge_as_link(edge: Edge) -> LinkTarget {
    match edge {
        Edge::Child(c) => LinkTarget::Node(c),
        Edge::Thread(t) => LinkTarget::Thread(t),
    }
}

fn link_removed(
    arena: &mut Arena,
    header: &mut Header,
    key: u32,
    ancestors: &[u64],
    dirs: &[Side],
    target: LinkTarget,
) -> Result<(), StoreError> {
    let kc = header.key_count;
    let edge = match target {
        LinkTarget::Node(off) => Edge::Child(off),
        LinkTarget::Thread(t) => Edge::Thread(t),
    };
    match (ancestors.last(), dirs.last()) {
        (Some(&parent), Some(&side)) => {
            let mut buf = load(arena, header, parent)?;
            SlotViewMut::new(&mut buf, kc).set_edge(key, side, edge);
            store(arena, parent, &buf)?;
        }
        _ => {
            header.roots[key as usize] = match edge {
                Edge::Child(off) => off,
                Edge::Thread(_) => 0,
            };
        }
    }
    Ok(())
}

/// `node_l`'s rightmost descendant is always `node`'s in-order predecessor,
/// so its right thread points at `node`. Once `new_successor` takes over
/// `node`'s structural position, that thread must follow it there.
fn fix_predecessor_thread(
    arena: &mut Arena,
    header: &mut Header,
    key: u32,
    node_l: u64,
    new_successor: u64,
) -> Result<(), StoreError> {
    let kc = header.key_count;
    let mut rightmost = node_l;
    loop {
        let buf = load(arena, header, rightmost)?;
        match SlotView::new(&buf, kc).right(key) {
            Edge::Child(r) => rightmost = r,
            Edge::Thread(_) => break,
        }
    }
    let mut buf = load(arena, header, rightmost)?;
    SlotViewMut::new(&mut buf, kc).set_right(key, Edge::Thread(new_successor));
    store(arena, rightmost, &buf)
}

/// Detaches the in-order successor of `node` (whose children are `node_l`,
/// `node_r`) from wherever it sits in `node_r`'s subtree, installs it in
/// `node`'s structural position with `node_l`/`node_r` as its new children,
/// and returns `(successor_offset, did_node's_subtree_height_shrink)`.
fn detach_successor(
    arena: &mut Arena,
    header: &mut Header,
    key: u32,
    node: u64,
    node_l: u64,
    node_r: u64,
) -> Result<(u64, bool), StoreError> {
    let kc = header.key_count;

    let r_left = { SlotView::new(&load(arena, header, node_r)?, kc).left(key) };
    if let Edge::Thread(_) = r_left {
        // `node_r` itself has no left child: it is the successor. Nothing
        // inside `node_r`'s subtree changed, so its own height is the same
        // as before; whether the subtree rooted here got shorter depends
        // only on `node`'s balance before the delete (if `node` was
        // right-heavy by exactly one, `node_r`'s now-absent left subtree
        // was already the shorter side, so promoting it in place costs a
        // level; otherwise it doesn't).
        let mut succ_buf = load(arena, header, node_r)?;
        let node_bal = SlotView::new(&load(arena, header, node)?, kc).balance(key) as i32;
        // `node_r`'s own left subtree (empty) is replaced by `node_l`, so its
        // new balance is `node`'s old one shifted toward left-heavy by one:
        // `node`'s right subtree was `1 + height(node_r.right)`, so
        // `height(node_l) - height(node_r.right) == node_bal + 1`.
        let new_bal = node_bal + 1;
        {
            let mut view = SlotViewMut::new(&mut succ_buf, kc);
            view.set_left(key, Edge::Child(node_l));
            view.set_balance(key, new_bal as i8);
        }
        store(arena, node_r, &succ_buf)?;
        fix_predecessor_thread(arena, header, key, node_l, node_r)?;
        if new_bal.abs() == 2 {
            let outcome = rotate_full(arena, header, key, node_r, new_bal as i8)?;
            return Ok((outcome.new_root, outcome.shrank));
        }
        return Ok((node_r, node_bal == -1));
    }

    // Walk left from `node_r`, tracking the path for an inner rebalance.
    let mut inner_ancestors: Vec<u64> = vec![node_r];
    let mut inner_dirs: Vec<Side> = vec![Side::Left];
    let mut cur = match r_left {
        Edge::Child(c) => c,
        Edge::Thread(_) => unreachable!(),
    };
    loop {
        let buf = load(arena, header, cur)?;
        match SlotView::new(&buf, kc).left(key) {
            Edge::Child(l) => {
                inner_ancestors.push(cur);
                inner_dirs.push(Side::Left);
                cur = l;
            }
            Edge::Thread(_) => break,
        }
    }
    let succ = cur;

    // `succ` has no left child; detach it from its parent the same way a
    // "left child missing" node is spliced (mirrored onto the left side).
    let succ_buf = load(arena, header, succ)?;
    let succ_view = SlotView::new(&succ_buf, kc);
    let succ_right = succ_view.right(key);
    let succ_left = succ_view.left(key);

    let parent = *inner_ancestors.last().unwrap();
    match succ_right {
        Edge::Thread(_) => {
            let mut parent_buf = load(arena, header, parent)?;
            SlotViewMut::new(&mut parent_buf, kc).set_left(key, succ_left);
            store(arena, parent, &parent_buf)?;
        }
        Edge::Child(sr) => {
            let mut parent_buf = load(arena, header, parent)?;
            SlotViewMut::new(&mut parent_buf, kc).set_left(key, Edge::Child(sr));
            store(arena, parent, &parent_buf)?;
            // Leftmost of `sr`'s subtree inherits `succ`'s old predecessor
            // thread, since `succ` (which sat just before it) is gone.
            let mut leftmost = sr;
            loop {
                let buf = load(arena, header, leftmost)?;
                match SlotView::new(&buf, kc).left(key) {
                    Edge::Child(l) => leftmost = l,
                    Edge::Thread(_) => break,
                }
            }
            let mut lm_buf = load(arena, header, leftmost)?;
            SlotViewMut::new(&mut lm_buf, kc).set_left(key, succ_left);
            store(arena, leftmost, &lm_buf)?;
        }
    }

    // Rebalance the inner path (all left-shrink steps), bottom-up, without
    // touching `header.roots` (the top of this path is `node_r`, which is
    // still below `node` and gets linked in afterward by the caller).
    let (inner_shrank, new_r_top) =
        rebalance_inner_delete(arena, header, key, &inner_ancestors, &inner_dirs)?;

    let node_bal = SlotView::new(&load(arena, header, node)?, kc).balance(key) as i32;
    // `node`'s right subtree height only changed if the inner path shrank;
    // `succ` inherits `node`'s old balance plus that one-level shift toward
    // left-heavy.
    let new_bal = if inner_shrank { node_bal + 1 } else { node_bal };
    {
        let mut succ_buf = load(arena, header, succ)?;
        let mut view = SlotViewMut::new(&mut succ_buf, kc);
        view.set_left(key, Edge::Child(node_l));
        view.set_right(key, Edge::Child(new_r_top));
        view.set_balance(key, new_bal as i8);
        store(arena, succ, &succ_buf)?;
    }
    fix_predecessor_thread(arena, header, key, node_l, succ)?;

    if new_bal.abs() == 2 {
        let outcome = rotate_full(arena, header, key, succ, new_bal as i8)?;
        return Ok((outcome.new_root, outcome.shrank));
    }
    Ok((succ, inner_shrank))
}

/// Rebalances the inner detach path (always left-shrink steps) and reports
/// `(height_decreased, new_top_offset)`, where `new_top_offset` is what now
/// occupies `ancestors[0]`'s (`node_r`'s) position — possibly `node_r`
/// itself, possibly a different offset if a rotation reached that far.
/// Unlike the top-level rebalance, this never touches `header.roots`; the
/// top of this path is relinked by the caller.
fn rebalance_inner_delete(
    arena: &mut Arena,
    header: &mut Header,
    key: u32,
    ancestors: &[u64],
    dirs: &[Side],
) -> Result<(bool, u64), StoreError> {
    let kc = header.key_count;
    let mut shrank = true;
    let mut top = ancestors[0];
    let mut i = ancestors.len();
    while i > 0 {
        i -= 1;
        let node = ancestors[i];
        let d = dirs[i];
        debug_assert_eq!(d, Side::Left);
        let mut buf = load(arena, header, node)?;
        let mut bal = SlotView::new(&buf, kc).balance(key) as i32;
        // balance = height(left) - height(right); the left side shrank.
        bal -= 1;

        if bal == 1 || bal == -1 {
            SlotViewMut::new(&mut buf, kc).set_balance(key, bal as i8);
            store(arena, node, &buf)?;
            shrank = false;
            break;
        } else if bal == 0 {
            SlotViewMut::new(&mut buf, kc).set_balance(key, 0);
            store(arena, node, &buf)?;
            shrank = true;
            if i == 0 {
                break;
            }
            continue;
        } else {
            let outcome = rotate_full(arena, header, key, node, bal as i8)?;
            if i == 0 {
                top = outcome.new_root;
            } else {
                let parent = ancestors[i - 1];
                let pd = dirs[i - 1];
                let mut parent_buf = load(arena, header, parent)?;
                SlotViewMut::new(&mut parent_buf, kc).set_edge(key, pd, Edge::Child(outcome.new_root));
                store(arena, parent, &parent_buf)?;
            }
            shrank = outcome.shrank;
            if i == 0 || !shrank {
                break;
            }
            continue;
        }
    }
    Ok((shrank, top))
}

/// Rebalances from `ancestors`/`dirs` (top-level, the tree's root path)
/// upward, given the immediate child subtree is known to have shrunk by
/// one (`shrank`). Mirrors [`rebalance_after_insert`] but with the
/// opposite balance-delta sign and an early continuation decision driven
/// by whether each rotation restored height or merely rebalanced it.
fn rebalance_after_delete(
    arena: &mut Arena,
    header: &mut Header,
    key: u32,
    ancestors: &[u64],
    dirs: &[Side],
    mut shrank: bool,
) -> Result<(), StoreError> {
    let kc = header.key_count;
    let mut i = ancestors.len();
    while i > 0 && shrank {
        i -= 1;
        let node = ancestors[i];
        let d = dirs[i];
        let mut buf = load(arena, header, node)?;
        let mut bal = SlotView::new(&buf, kc).balance(key) as i32;
        // balance = height(left) - height(right): a left-side deletion
        // shrinks the left subtree, moving balance toward -1.
        bal += if d == Side::Left { -1 } else { 1 };

        if bal == 1 || bal == -1 {
            SlotViewMut::new(&mut buf, kc).set_balance(key, bal as i8);
            store(arena, node, &buf)?;
            shrank = false;
        } else if bal == 0 {
            SlotViewMut::new(&mut buf, kc).set_balance(key, 0);
            store(arena, node, &buf)?;
            shrank = true;
        } else {
            let outcome = rotate_full(arena, header, key, node, bal as i8)?;
            if i == 0 {
                header.roots[key as usize] = outcome.new_root;
            } else {
                let parent = ancestors[i - 1];
                let pd = dirs[i - 1];
                let mut parent_buf = load(arena, header, parent)?;
                SlotViewMut::new(&mut parent_buf, kc).set_edge(key, pd, Edge::Child(outcome.new_root));
                store(arena, parent, &parent_buf)?;
            }
            shrank = outcome.shrank;
        }
    }
    Ok(())
}

/// The result of [`scan`]: the tree's height and a soft report of any
/// invariant violation found while walking it.
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub height: u32,
    pub count: u64,
    pub divergence: Option<String>,
}

/// Recursively verifies, at every node, that the stored balance equals
/// `height(left) - height(right)`, and that the total count of records
/// visited equals `LiveCount`. Mirrors spec `§4.4`'s scan contract.
pub(crate) fn scan(arena: &Arena, header: &Header, key: u32) -> Result<ScanReport, StoreError> {
    let mut count = 0u64;
    let mut divergence = None;
    let height = scan_node(arena, header, key, header.roots[key as usize], &mut count, &mut divergence)?;
    if divergence.is_none() && count as i64 != header.live_count {
        divergence = Some(format!(
            "key {key}: tree holds {count} records, header live_count is {}",
            header.live_count
        ));
    }
    Ok(ScanReport {
        height,
        count,
        divergence,
    })
}

fn scan_node(
    arena: &Arena,
    header: &Header,
    key: u32,
    offset: u64,
    count: &mut u64,
    divergence: &mut Option<String>,
) -> Result<u32, StoreError> {
    if offset == 0 {
        return Ok(0);
    }
    let buf = load(arena, header, offset)?;
    let view = SlotView::new(&buf, header.key_count);
    let hl = match view.left(key) {
        Edge::Child(l) => scan_node(arena, header, key, l, count, divergence)?,
        Edge::Thread(_) => 0,
    };
    let hr = match view.right(key) {
        Edge::Child(r) => scan_node(arena, header, key, r, count, divergence)?,
        Edge::Thread(_) => 0,
    };
    *count += 1;
    let expected_bal = hl as i32 - hr as i32;
    if divergence.is_none() && view.balance(key) as i32 != expected_bal {
        *divergence = Some(format!(
            "key {key}: offset {offset} has balance {} but height(left)-height(right) = {expected_bal}",
            view.balance(key)
        ));
    }
    Ok(1 + hl.max(hr))
}
