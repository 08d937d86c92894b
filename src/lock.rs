//! Byte-range advisory locking and the gate.
//!
//! The corpus this crate is grounded on reaches for `fslock` for advisory
//! locking, but `fslock` only ever locks a whole file, and this format
//! needs independent locks on byte 0 (the gate), byte 1 (the user lock),
//! and an arbitrary `RecordLen`-wide range per open cursor slot. `nix` is
//! the one crate in the retrieved corpus's own dependency graph (the
//! `vector` workspace root) that can reach `fcntl(2)` directly, so
//! byte-range locks here are built on `libc::flock` + `F_SETLK`/`F_SETLKW`/
//! `F_GETLK`, with `nix::errno::Errno` for the error side.
//!
//! Note: POSIX record locks are associated with `(process, inode)`, not
//! with a file descriptor, and `F_GETLK` never reports a lock held by the
//! calling process as conflicting, only ones held by *other* processes.
//! That happens to be exactly what cursor-abandonment probing wants, but
//! it also means this scheme cannot detect two cursors opened by the same
//! process racing on the same slot; see DESIGN.md.

use std::fs::File;
use std::os::unix::io::AsRawFd;

use nix::errno::Errno;

/// An absolute `[offset, offset + len)` byte range within the arena file.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ByteRange {
    pub offset: u64,
    pub len: u64,
}

impl ByteRange {
    pub(crate) const fn new(offset: u64, len: u64) -> ByteRange {
        ByteRange { offset, len }
    }
}

/// Byte 0: serializes every gate-holding operation across processes.
pub(crate) const GATE_RANGE: ByteRange = ByteRange::new(0, 1);
/// Byte 1: the user-visible coarse lock, independent of the gate.
pub(crate) const USER_LOCK_RANGE: ByteRange = ByteRange::new(1, 1);

fn make_flock(kind: libc::c_short, range: ByteRange) -> libc::flock {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = kind;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = range.offset as libc::off_t;
    fl.l_len = range.len as libc::off_t;
    fl
}

fn raw_fcntl(file: &File, cmd: libc::c_int, fl: &mut libc::flock) -> Result<(), Errno> {
    let fd = file.as_raw_fd();
    let ret = unsafe { libc::fcntl(fd, cmd, fl as *mut libc::flock) };
    if ret == -1 {
        Err(Errno::last())
    } else {
        Ok(())
    }
}

/// Blocks until an exclusive lock on `range` is acquired.
pub(crate) fn lock_wait(file: &File, range: ByteRange) -> Result<(), Errno> {
    let mut fl = make_flock(libc::F_WRLCK as libc::c_short, range);
    raw_fcntl(file, libc::F_SETLKW, &mut fl)
}

/// Attempts to acquire an exclusive lock on `range` without blocking.
/// Returns `Ok(false)` (rather than an error) when the range is already
/// held by someone else.
pub(crate) fn try_lock(file: &File, range: ByteRange) -> Result<bool, Errno> {
    let mut fl = make_flock(libc::F_WRLCK as libc::c_short, range);
    match raw_fcntl(file, libc::F_SETLK, &mut fl) {
        Ok(()) => Ok(true),
        Err(Errno::EACCES) | Err(Errno::EAGAIN) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Releases a previously acquired lock on `range`.
pub(crate) fn unlock(file: &File, range: ByteRange) -> Result<(), Errno> {
    let mut fl = make_flock(libc::F_UNLCK as libc::c_short, range);
    raw_fcntl(file, libc::F_SETLK, &mut fl)
}

/// Probes whether `range` is currently held by *another* process, without
/// taking or releasing anything.
pub(crate) fn is_locked_by_other(file: &File, range: ByteRange) -> Result<bool, Errno> {
    let mut fl = make_flock(libc::F_WRLCK as libc::c_short, range);
    raw_fcntl(file, libc::F_GETLK, &mut fl)?;
    Ok(fl.l_type != libc::F_UNLCK as libc::c_short)
}

/// An acquired byte-range lock, released on drop.
pub(crate) struct HeldLock<'a> {
    file: &'a File,
    range: ByteRange,
}

impl<'a> HeldLock<'a> {
    pub(crate) fn acquire_wait(file: &'a File, range: ByteRange) -> Result<HeldLock<'a>, Errno> {
        lock_wait(file, range)?;
        Ok(HeldLock { file, range })
    }
}

impl Drop for HeldLock<'_> {
    fn drop(&mut self) {
        let _ = unlock(self.file, self.range);
    }
}

#[cfg(feature = "multi-thread")]
pub(crate) type InProcessMutex = parking_lot::Mutex<()>;

#[cfg(not(feature = "multi-thread"))]
pub(crate) struct InProcessMutex;

#[cfg(not(feature = "multi-thread"))]
impl InProcessMutex {
    pub(crate) fn new() -> InProcessMutex {
        InProcessMutex
    }

    pub(crate) fn lock(&self) {}
}
