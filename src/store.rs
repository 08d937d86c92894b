//! The public handle: one open file, one embedded cursor, one comparator.
//!
//! Every operation here follows the same shape: validate arguments, take
//! the in-process mutex (a no-op unless the `multi-thread` feature is on
//! and the handle was opened with [`Threading::MultiThreaded`]), acquire
//! the gate for the call's duration, mutate/read through `arena`
//! and `header`, write the header back, and let the gate guard release on
//! drop. `insert`/`update`/`delete`/`find`/range-start/`next`/`prev` mirror
//! spec `§4.4`; `startseq`/`readseq` mirror `§4.3`; `squash` mirrors `§4.7`.

use std::cmp::Ordering;
use std::fs::File;

use crate::arena::Arena;
use crate::chain;
use crate::compact;
use crate::cursor;
use crate::error::StoreError;
use crate::header::{self, Header};
use crate::layout::TAG_FREE;
use crate::lock::{self, ByteRange, HeldLock, InProcessMutex, GATE_RANGE, USER_LOCK_RANGE};
use crate::options::{OpenOptions, Threading};
use crate::seqlist;
use crate::slot::{SlotView, SlotViewMut};
use crate::tree::{self, KeyComparator};

/// An open store. Owns the backing file (through `arena`), one embedded
/// cursor slot (per spec `§3`, one per open handle), and the host-supplied
/// comparator for the lifetime of the handle.
pub struct Store {
    arena: Arena,
    header: Header,
    cmp: Box<dyn KeyComparator>,
    /// A clone of the arena's file descriptor dedicated to locks that must
    /// outlive a single call: this handle's cursor-slot lock and the
    /// user-visible byte-1 lock. `HeldLock` ties its guard's lifetime to
    /// the file it borrows, so a lock held across calls can't live in a
    /// field that also borrows `arena` — this owned clone sidesteps that
    /// self-reference instead of reaching for `unsafe`.
    locks: File,
    cursor_offset: u64,
    user_locked: bool,
    mutex: InProcessMutex,
    /// Whether `mutex` is actually engaged for this handle. The
    /// `multi-thread` Cargo feature controls whether the crate carries the
    /// in-process mutex at all; `threading` is the finer-grained, per-handle
    /// choice from `OpenOptionsBuilder::threading` to skip taking it even
    /// when the feature is compiled in, for a caller that knows this handle
    /// never leaves the thread that opened it.
    threading: Threading,
    my_pid: libc::pid_t,
}

/// The result of [`Store::lock_guard`]: either a held in-process mutex
/// guard, or nothing, depending on `Store::threading` and whether the
/// `multi-thread` feature compiled the mutex in at all.
#[cfg(feature = "multi-thread")]
enum MutexGuard<'a> {
    Held(parking_lot::MutexGuard<'a, ()>),
    Skipped,
}

#[cfg(not(feature = "multi-thread"))]
struct MutexGuard;

impl Store {
    /// Opens (creating if necessary) the file at `options.path`, validates
    /// its stamped shape against `options` if it already existed, and
    /// allocates this handle's cursor slot.
    pub fn open(options: OpenOptions, cmp: impl KeyComparator + 'static) -> Result<Store, StoreError> {
        Self::open_inner(options, cmp).map_err(crate::error::record_diagnostic)
            .map_err(crate::error::escalate_corruption)
    }

    fn open_inner(options: OpenOptions, cmp: impl KeyComparator + 'static) -> Result<Store, StoreError> {
        let mut arena = Arena::open(&options.path)?;
        let locks = arena.raw_file().try_clone()?;
        let my_pid = nix::unistd::getpid().as_raw();

        // Every other gate-holding operation on this file, including ones
        // from other processes, serializes against the header read/creation
        // and cursor allocation below the same way it serializes against
        // later mutations.
        let _gate = HeldLock::acquire_wait(&locks, GATE_RANGE)?;

        let mut header = if arena.len() == 0 {
            tracing::debug!(path = %options.path.display(), "creating new store");
            let header = Header::new(options.key_count, options.data_len)?;
            arena.append(&header.encode())?;
            header
        } else {
            let prefix = arena.read_at(0, header::ROOTS_OFFSET as usize)?;
            let key_count = u32::from_ne_bytes(prefix[8..12].try_into().expect("4-byte slice"));
            let full = arena.read_at(0, header::header_len(key_count) as usize)?;
            let header = Header::decode(&full)?;
            header.check_shape(options.key_count, options.data_len)?;
            tracing::debug!(path = %options.path.display(), live = header.live_count, "opened existing store");
            header
        };

        let record_len = header.record_len as u64;
        let is_stealable = |offset: u64| -> Result<bool, StoreError> {
            Ok(!lock::is_locked_by_other(&locks, ByteRange::new(offset, record_len))?)
        };
        let cursor_offset = cursor::open_cursor(&mut arena, &mut header, my_pid, &is_stealable)?;
        lock::lock_wait(&locks, ByteRange::new(cursor_offset, record_len))?;
        arena.write_at(0, &header.encode())?;
        tracing::trace!(cursor_offset, "allocated cursor slot");
        drop(_gate);

        Ok(Store {
            arena,
            header,
            cmp: Box::new(cmp),
            locks,
            cursor_offset,
            user_locked: false,
            mutex: new_mutex(),
            threading: options.threading,
            my_pid,
        })
    }

    /// A free-standing helper, not a `&mut self` method: it borrows only
    /// `arena` and `header` explicitly, so callers can invoke it while the
    /// gate guard (itself borrowed off `self.locks`) is still live, instead
    /// of needing exclusive access to the whole handle.
    fn flush_header(arena: &mut Arena, header: &Header) -> Result<(), StoreError> {
        arena.write_at(0, &header.encode())
    }

    fn check_key(&self, key: u32) -> Result<(), StoreError> {
        if key >= self.header.key_count {
            return Err(StoreError::invalid(format!(
                "key index {key} out of range (key_count = {})",
                self.header.key_count
            )));
        }
        Ok(())
    }

    fn check_payload(&self, buf: &[u8]) -> Result<(), StoreError> {
        if buf.len() != self.header.data_len as usize {
            return Err(StoreError::invalid(format!(
                "payload is {} bytes, store was opened with data_len = {}",
                buf.len(),
                self.header.data_len
            )));
        }
        Ok(())
    }

    fn read_payload(&self, offset: u64) -> Result<Vec<u8>, StoreError> {
        let buf = self.arena.read_at(offset, self.header.record_len as usize)?;
        Ok(SlotView::new(&buf, self.header.key_count).payload().to_vec())
    }

    /// Acquires the gate for the call's duration. A free function, not a
    /// `&self` method: it must borrow only `self.locks`, so the rest of a
    /// caller's body stays free to mutably borrow `self.arena`/`self.header`
    /// (and, in `squash`, reassign `self.cursor_offset`) while the gate is
    /// still held. A method taking `&self` would tie the guard's lifetime to
    /// the whole handle instead of just this one field.
    fn gate(locks: &File) -> Result<HeldLock<'_>, StoreError> {
        Ok(HeldLock::acquire_wait(locks, GATE_RANGE)?)
    }

    /// Takes the in-process mutex, unless this handle was opened with
    /// [`Threading::SingleThreaded`] or the `multi-thread` feature is off,
    /// in which case it's a no-op.
    #[cfg(feature = "multi-thread")]
    fn lock_guard(&self) -> MutexGuard<'_> {
        match self.threading {
            Threading::MultiThreaded => MutexGuard::Held(self.mutex.lock()),
            Threading::SingleThreaded => MutexGuard::Skipped,
        }
    }

    #[cfg(not(feature = "multi-thread"))]
    fn lock_guard(&self) -> MutexGuard {
        MutexGuard
    }

    /// Closes the handle: releases this cursor back to the free list,
    /// releases the byte-range locks, and flushes the header one last
    /// time. Dropping a `Store` without calling `close` leaves the cursor
    /// slot on `HeadCpr` for a future opener to reclaim via abandonment
    /// detection, which is the intended behavior for a crashed process.
    pub fn close(self) -> Result<(), StoreError> {
        self.close_inner().map_err(crate::error::record_diagnostic)
            .map_err(crate::error::escalate_corruption)
    }

    fn close_inner(mut self) -> Result<(), StoreError> {
        let _guard = self.lock_guard();
        let _gate = Self::gate(&self.locks)?;
        cursor::close_cursor(&mut self.arena, &mut self.header, self.cursor_offset)?;
        Self::flush_header(&mut self.arena, &self.header)?;
        let record_len = self.header.record_len as u64;
        lock::unlock(&self.locks, ByteRange::new(self.cursor_offset, record_len))?;
        if self.user_locked {
            lock::unlock(&self.locks, USER_LOCK_RANGE)?;
            self.user_locked = false;
        }
        self.arena.sync()?;
        tracing::debug!("closed store");
        Ok(())
    }

    /// The number of live records currently in the store (`LiveCount`).
    pub fn live_count(&self) -> i64 {
        self.header.live_count
    }

    /// The store's key count, as validated at open time.
    pub fn key_count(&self) -> u32 {
        self.header.key_count
    }

    /// The fixed width of each slot, header excluded.
    pub fn record_len(&self) -> u32 {
        self.header.record_len
    }

    /// The backing file's current length in bytes, header plus every slot.
    pub fn file_len(&self) -> u64 {
        self.arena.len()
    }

    /// Atomically increments and returns `NextNumber`, per spec `§4.8`.
    pub fn getnum(&mut self) -> Result<i64, StoreError> {
        self.getnum_inner().map_err(crate::error::record_diagnostic)
            .map_err(crate::error::escalate_corruption)
    }

    fn getnum_inner(&mut self) -> Result<i64, StoreError> {
        let _guard = self.lock_guard();
        let _gate = Self::gate(&self.locks)?;
        self.header.next_number = self
            .header
            .next_number
            .checked_add(1)
            .ok_or_else(|| StoreError::exhausted("NextNumber counter overflowed"))?;
        Self::flush_header(&mut self.arena, &self.header)?;
        Ok(self.header.next_number)
    }

    /// Acquires the user-visible byte-1 lock, independent of the gate.
    /// Idempotent: locking an already-locked handle is a no-op.
    pub fn lock(&mut self) -> Result<(), StoreError> {
        self.lock_inner().map_err(crate::error::record_diagnostic)
            .map_err(crate::error::escalate_corruption)
    }

    fn lock_inner(&mut self) -> Result<(), StoreError> {
        if self.user_locked {
            return Ok(());
        }
        lock::lock_wait(&self.locks, USER_LOCK_RANGE)?;
        self.user_locked = true;
        Ok(())
    }

    /// Releases the user-visible lock. A no-op if not held.
    pub fn unlock(&mut self) -> Result<(), StoreError> {
        self.unlock_inner().map_err(crate::error::record_diagnostic)
            .map_err(crate::error::escalate_corruption)
    }

    fn unlock_inner(&mut self) -> Result<(), StoreError> {
        if !self.user_locked {
            return Ok(());
        }
        lock::unlock(&self.locks, USER_LOCK_RANGE)?;
        self.user_locked = false;
        Ok(())
    }

    /// Inserts `buf` as a new record, reusing a free slot if one exists.
    pub fn insert(&mut self, buf: &[u8]) -> Result<(), StoreError> {
        self.insert_inner(buf).map_err(crate::error::record_diagnostic)
            .map_err(crate::error::escalate_corruption)
    }

    fn insert_inner(&mut self, buf: &[u8]) -> Result<(), StoreError> {
        self.check_payload(buf)?;
        let _guard = self.lock_guard();
        let _gate = Self::gate(&self.locks)?;

        let kc = self.header.key_count;
        let offset = match chain::pop_front(&self.arena, &mut self.header.head_empty, kc, self.header.record_len)? {
            Some(off) => off,
            None => {
                let zeroed = vec![0u8; self.header.record_len as usize];
                self.arena.append(&zeroed)?
            }
        };

        let mut slot_buf = vec![0u8; self.header.record_len as usize];
        SlotViewMut::new(&mut slot_buf, kc).set_payload(buf);
        self.arena.write_at(offset, &slot_buf)?;

        for key in 0..kc {
            tree::insert(&mut self.arena, &mut self.header, self.cmp.as_ref(), key, offset)?;
        }
        seqlist::prepend(&mut self.arena, &mut self.header, offset)?;
        self.header.live_count = self
            .header
            .live_count
            .checked_add(1)
            .ok_or_else(|| StoreError::exhausted("LiveCount counter overflowed"))?;

        Self::flush_header(&mut self.arena, &self.header)?;
        tracing::trace!(offset, live = self.header.live_count, "inserted record");
        Ok(())
    }

    /// Overwrites the payload of the record that compares equal to `buf`
    /// under every key, per spec `§4.4`. Does not touch tree structure,
    /// since order is unchanged by definition.
    pub fn update(&mut self, buf: &[u8]) -> Result<(), StoreError> {
        self.update_inner(buf).map_err(crate::error::record_diagnostic)
            .map_err(crate::error::escalate_corruption)
    }

    fn update_inner(&mut self, buf: &[u8]) -> Result<(), StoreError> {
        self.check_payload(buf)?;
        let _guard = self.lock_guard();
        let _gate = Self::gate(&self.locks)?;

        let kc = self.header.key_count;
        let cmp = self.cmp.as_ref();
        let is_match = |candidate: &[u8]| (0..kc).all(|key| cmp.compare(key, buf, candidate) == Ordering::Equal);
        let target = tree::locate(&self.arena, &self.header, cmp, 0, buf, &is_match)?;

        let mut slot_buf = self.arena.read_at(target, self.header.record_len as usize)?;
        SlotViewMut::new(&mut slot_buf, kc).set_payload(buf);
        self.arena.write_at(target, &slot_buf)?;

        Self::flush_header(&mut self.arena, &self.header)?;
        tracing::trace!(offset = target, "updated record");
        Ok(())
    }

    /// Deletes the record whose payload is bytewise equal to `buf`, per
    /// spec `§4.4`'s duplicate-key fallback. Repoints any cursor
    /// referencing the deleted record's old offset per `§4.5`.
    pub fn delete(&mut self, buf: &[u8]) -> Result<(), StoreError> {
        self.delete_inner(buf).map_err(crate::error::record_diagnostic)
            .map_err(crate::error::escalate_corruption)
    }

    fn delete_inner(&mut self, buf: &[u8]) -> Result<(), StoreError> {
        self.check_payload(buf)?;
        let _guard = self.lock_guard();
        let _gate = Self::gate(&self.locks)?;

        let cmp = self.cmp.as_ref();
        let is_match = |candidate: &[u8]| candidate == buf;
        let target = tree::locate(&self.arena, &self.header, cmp, 0, buf, &is_match)?;

        let kc = self.header.key_count;
        let mut preds = vec![0u64; kc as usize];
        let mut succs = vec![0u64; kc as usize];
        for key in 0..kc {
            preds[key as usize] = tree::in_order_predecessor(&self.arena, &self.header, key, target)?;
            succs[key as usize] = tree::in_order_successor(&self.arena, &self.header, key, target)?;
        }
        let seq_next = {
            let buf = self.arena.read_at(target, self.header.record_len as usize)?;
            SlotView::new(&buf, kc).next_seq()
        };

        seqlist::unlink(&mut self.arena, &mut self.header, target)?;
        for key in 0..kc {
            tree::remove(&mut self.arena, &mut self.header, self.cmp.as_ref(), key, target)?;
        }
        self.header.live_count -= 1;

        let mut slot_buf = self.arena.read_at(target, self.header.record_len as usize)?;
        {
            let mut view = SlotViewMut::new(&mut slot_buf, kc);
            view.clear();
            view.set_kind_tag(TAG_FREE);
        }
        self.arena.write_at(target, &slot_buf)?;
        chain::push_front(&mut self.arena, &mut self.header.head_empty, kc, self.header.record_len, target)?;

        cursor::for_each_cursor(&mut self.arena, &mut self.header, |a, h, off| {
            for key in 0..kc {
                if cursor::left(a, h, off, key)? == target {
                    cursor::set_left(a, h, off, key, preds[key as usize])?;
                }
                if cursor::right(a, h, off, key)? == target {
                    cursor::set_right(a, h, off, key, succs[key as usize])?;
                }
            }
            if cursor::readseq_pos(a, h, off)? == target {
                cursor::set_readseq_pos(a, h, off, seq_next)?;
            }
            Ok(())
        })?;

        Self::flush_header(&mut self.arena, &self.header)?;
        tracing::trace!(offset = target, live = self.header.live_count, "deleted record");
        Ok(())
    }

    /// Returns the payload of the first record whose key-`key` comparison
    /// against `buf` is equal.
    pub fn find(&mut self, buf: &[u8], key: u32) -> Result<Vec<u8>, StoreError> {
        self.find_inner(buf, key).map_err(crate::error::record_diagnostic)
            .map_err(crate::error::escalate_corruption)
    }

    fn find_inner(&mut self, buf: &[u8], key: u32) -> Result<Vec<u8>, StoreError> {
        self.check_key(key)?;
        self.check_payload(buf)?;
        let _guard = self.lock_guard();
        let _gate = Self::gate(&self.locks)?;
        let offset = tree::find(&self.arena, &self.header, self.cmp.as_ref(), key, buf)?;
        self.read_payload(offset)
    }

    /// Seeds this handle's cursor to the smallest key-`key` record ≥ `buf`
    /// and returns its payload; subsequent `next(key)`/`prev(key)` calls
    /// walk from there.
    pub fn startge(&mut self, buf: &[u8], key: u32) -> Result<Vec<u8>, StoreError> {
        self.startge_inner(buf, key).map_err(crate::error::record_diagnostic)
            .map_err(crate::error::escalate_corruption)
    }

    fn startge_inner(&mut self, buf: &[u8], key: u32) -> Result<Vec<u8>, StoreError> {
        self.check_key(key)?;
        self.check_payload(buf)?;
        let _guard = self.lock_guard();
        let _gate = Self::gate(&self.locks)?;
        let (pred, found, succ) = tree::start_ge(&self.arena, &self.header, self.cmp.as_ref(), key, buf)?;
        cursor::set_left(&mut self.arena, &self.header, self.cursor_offset, key, pred)?;
        cursor::set_right(&mut self.arena, &self.header, self.cursor_offset, key, succ)?;
        self.read_payload(found)
    }

    /// Seeds this handle's cursor to the largest key-`key` record < `buf`
    /// and returns its payload.
    pub fn startlt(&mut self, buf: &[u8], key: u32) -> Result<Vec<u8>, StoreError> {
        self.startlt_inner(buf, key).map_err(crate::error::record_diagnostic)
            .map_err(crate::error::escalate_corruption)
    }

    fn startlt_inner(&mut self, buf: &[u8], key: u32) -> Result<Vec<u8>, StoreError> {
        self.check_key(key)?;
        self.check_payload(buf)?;
        let _guard = self.lock_guard();
        let _gate = Self::gate(&self.locks)?;
        let (pred, found, succ) = tree::start_lt(&self.arena, &self.header, self.cmp.as_ref(), key, buf)?;
        cursor::set_left(&mut self.arena, &self.header, self.cursor_offset, key, pred)?;
        cursor::set_right(&mut self.arena, &self.header, self.cursor_offset, key, succ)?;
        self.read_payload(found)
    }

    /// Returns the record at this cursor's key-`key` `right` position and
    /// advances it to that record's in-order successor.
    pub fn next(&mut self, key: u32) -> Result<Vec<u8>, StoreError> {
        self.next_inner(key).map_err(crate::error::record_diagnostic)
            .map_err(crate::error::escalate_corruption)
    }

    fn next_inner(&mut self, key: u32) -> Result<Vec<u8>, StoreError> {
        self.check_key(key)?;
        let _guard = self.lock_guard();
        let _gate = Self::gate(&self.locks)?;
        let offset = cursor::right(&self.arena, &self.header, self.cursor_offset, key)?;
        if offset == 0 {
            return Err(StoreError::NotFound);
        }
        let payload = self.read_payload(offset)?;
        let succ = tree::in_order_successor(&self.arena, &self.header, key, offset)?;
        cursor::set_right(&mut self.arena, &self.header, self.cursor_offset, key, succ)?;
        Ok(payload)
    }

    /// Returns the record at this cursor's key-`key` `left` position and
    /// advances it to that record's in-order predecessor.
    pub fn prev(&mut self, key: u32) -> Result<Vec<u8>, StoreError> {
        self.prev_inner(key).map_err(crate::error::record_diagnostic)
            .map_err(crate::error::escalate_corruption)
    }

    fn prev_inner(&mut self, key: u32) -> Result<Vec<u8>, StoreError> {
        self.check_key(key)?;
        let _guard = self.lock_guard();
        let _gate = Self::gate(&self.locks)?;
        let offset = cursor::left(&self.arena, &self.header, self.cursor_offset, key)?;
        if offset == 0 {
            return Err(StoreError::NotFound);
        }
        let payload = self.read_payload(offset)?;
        let pred = tree::in_order_predecessor(&self.arena, &self.header, key, offset)?;
        cursor::set_left(&mut self.arena, &self.header, self.cursor_offset, key, pred)?;
        Ok(payload)
    }

    /// Seeds this handle's `readseq` walk to the head of the sequential
    /// list (most recently inserted record first).
    pub fn startseq(&mut self) -> Result<(), StoreError> {
        self.startseq_inner().map_err(crate::error::record_diagnostic)
            .map_err(crate::error::escalate_corruption)
    }

    fn startseq_inner(&mut self) -> Result<(), StoreError> {
        let _guard = self.lock_guard();
        let _gate = Self::gate(&self.locks)?;
        cursor::set_readseq_pos(&mut self.arena, &self.header, self.cursor_offset, self.header.head_seq)?;
        Ok(())
    }

    /// Returns the record at this handle's `readseq` position and advances
    /// it through the sequential list.
    pub fn readseq(&mut self) -> Result<Vec<u8>, StoreError> {
        self.readseq_inner().map_err(crate::error::record_diagnostic)
            .map_err(crate::error::escalate_corruption)
    }

    fn readseq_inner(&mut self) -> Result<Vec<u8>, StoreError> {
        let _guard = self.lock_guard();
        let _gate = Self::gate(&self.locks)?;
        let pos = cursor::readseq_pos(&self.arena, &self.header, self.cursor_offset)?;
        if pos == 0 {
            return Err(StoreError::NotFound);
        }
        let payload = self.read_payload(pos)?;
        let next = {
            let buf = self.arena.read_at(pos, self.header.record_len as usize)?;
            SlotView::new(&buf, self.header.key_count).next_seq()
        };
        cursor::set_readseq_pos(&mut self.arena, &self.header, self.cursor_offset, next)?;
        Ok(payload)
    }

    /// Walks key `key`'s tree verifying balance/height/count invariants,
    /// logging any divergence, per spec `§4.4`.
    pub fn scan(&self, key: u32) -> Result<tree::ScanReport, StoreError> {
        self.scan_inner(key).map_err(crate::error::record_diagnostic)
            .map_err(crate::error::escalate_corruption)
    }

    fn scan_inner(&self, key: u32) -> Result<tree::ScanReport, StoreError> {
        self.check_key(key)?;
        let report = tree::scan(&self.arena, &self.header, key)?;
        if let Some(divergence) = &report.divergence {
            tracing::error!(key, %divergence, "scan found a tree invariant violation");
        }
        Ok(report)
    }

    /// Runs compaction to completion (or until blocked by a foreign
    /// opener's live cursor at the tail), per spec `§4.7`.
    pub fn squash(&mut self) -> Result<(), StoreError> {
        self.squash_inner().map_err(crate::error::record_diagnostic)
            .map_err(crate::error::escalate_corruption)
    }

    fn squash_inner(&mut self) -> Result<(), StoreError> {
        let _guard = self.lock_guard();
        let _gate = Self::gate(&self.locks)?;

        let my_pid = self.my_pid;
        let record_len = self.header.record_len as u64;
        let locks = &self.locks;
        let is_free = |offset: u64| -> Result<bool, StoreError> {
            Ok(!lock::is_locked_by_other(locks, ByteRange::new(offset, record_len))?)
        };
        let mut relocate_own = |old: u64, new: u64| -> Result<(), StoreError> {
            if old == self.cursor_offset {
                lock::unlock(locks, ByteRange::new(old, record_len))?;
                lock::lock_wait(locks, ByteRange::new(new, record_len))?;
                self.cursor_offset = new;
                tracing::trace!(old, new, "relocated this handle's cursor during squash");
            }
            Ok(())
        };

        compact::squash(&mut self.arena, &mut self.header, my_pid, &is_free, &mut relocate_own)?;
        Self::flush_header(&mut self.arena, &self.header)?;
        tracing::debug!("squash complete");
        Ok(())
    }
}

impl Drop for Store {
    /// Releases this handle's OS-level locks. Does not remove the cursor
    /// slot from `HeadCpr` — a process that drops without calling `close`
    /// leaves its cursor for a future opener's abandonment detection to
    /// reclaim, which is the intended crash-recovery story for this format.
    fn drop(&mut self) {
        let record_len = self.header.record_len as u64;
        let _ = lock::unlock(&self.locks, ByteRange::new(self.cursor_offset, record_len));
        if self.user_locked {
            let _ = lock::unlock(&self.locks, USER_LOCK_RANGE);
        }
    }
}

#[cfg(feature = "multi-thread")]
fn new_mutex() -> InProcessMutex {
    InProcessMutex::new(())
}

#[cfg(not(feature = "multi-thread"))]
fn new_mutex() -> InProcessMutex {
    InProcessMutex::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OpenOptionsBuilder;
    use std::cmp::Ordering as Ord2;

    fn cmp(key: u32, a: &[u8], b: &[u8]) -> Ord2 {
        let width = 4;
        let (ao, bo) = (key as usize * width, key as usize * width);
        a[ao..ao + width].cmp(&b[bo..bo + width])
    }

    fn payload(k0: u32, tag: u8) -> Vec<u8> {
        let mut buf = vec![0u8; 8];
        buf[0..4].copy_from_slice(&k0.to_ne_bytes());
        buf[4] = tag;
        buf
    }

    fn open(path: &std::path::Path) -> Store {
        let options = OpenOptionsBuilder::from_path(path)
            .key_count(1)
            .data_len(8)
            .build()
            .expect("options");
        Store::open(options, cmp).expect("open")
    }

    #[test]
    fn insert_startge_next_yields_ascending_order() {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        let mut store = open(file.path());

        store.insert(&payload(2, b'b')).expect("insert b");
        store.insert(&payload(1, b'a')).expect("insert a");
        store.insert(&payload(3, b'c')).expect("insert c");

        let probe = payload(0, 0);
        let first = store.startge(&probe, 0).expect("startge");
        assert_eq!(first[4], b'a');
        let second = store.next(0).expect("next");
        assert_eq!(second[4], b'b');
        let third = store.next(0).expect("next");
        assert_eq!(third[4], b'c');
        assert!(store.next(0).unwrap_err().is_not_found());
    }

    #[test]
    fn delete_exact_duplicate_leaves_the_others() {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        let mut store = open(file.path());

        store.insert(&payload(1, b'a')).expect("insert a");
        store.insert(&payload(1, b'b')).expect("insert b");
        store.insert(&payload(1, b'c')).expect("insert c");

        store.delete(&payload(1, b'b')).expect("delete b");

        let probe = payload(0, 0);
        let mut tags = Vec::new();
        let first = store.startge(&probe, 0).expect("startge");
        tags.push(first[4]);
        while let Ok(rec) = store.next(0) {
            tags.push(rec[4]);
        }
        tags.sort();
        assert_eq!(tags, vec![b'a', b'c']);
    }

    #[test]
    fn getnum_increments_and_survives_reopen() {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        let path = file.path().to_path_buf();
        let mut store = open(&path);
        assert_eq!(store.getnum().unwrap(), 1);
        assert_eq!(store.getnum().unwrap(), 2);
        store.close().expect("close");

        let mut reopened = open(&path);
        assert_eq!(reopened.getnum().unwrap(), 3);
    }

    #[test]
    fn update_replaces_only_the_matching_record() {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        let mut store = open(file.path());
        store.insert(&payload(5, b'x')).expect("insert x");
        store.insert(&payload(5, b'y')).expect("insert y");

        store.update(&payload(5, b'y')).expect("update no-op shape");
        let found = store.find(&payload(5, b'y'), 0).expect("find");
        assert_eq!(found[4], b'y');
    }
}
