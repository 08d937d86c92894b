//! Error taxonomy and the out-of-band diagnostic channel.
//!
//! Kinds mirror the propagation policy this store is built around: not
//! found / invalid argument / resource exhaustion surface as an ordinary
//! `Result`, while [`StoreError::Corrupt`] is escalated to a process abort
//! by the public API (see `store.rs`), never silently downgraded.

use std::cell::RefCell;

use snafu::Snafu;

/// Errors returned by fallible store operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    /// No matching or next record existed.
    #[snafu(display("no matching record"))]
    NotFound,

    /// A key index was out of range, or the file's stored metadata did not
    /// match what the caller opened with.
    #[snafu(display("invalid argument: {message}"))]
    InvalidArgument { message: String },

    /// In-process allocation failed, or a counter would overflow.
    #[snafu(display("resource exhausted: {message}"))]
    ResourceExhausted { message: String },

    /// The arena's advisory lock is held by another opener.
    #[snafu(display("lock already held: {message}"))]
    LockHeld { message: String },

    /// An I/O error occurred against the backing file.
    #[snafu(display("I/O error: {source}"))]
    Io { source: std::io::Error },

    /// The file is corrupt, or an invariant the library depends on to
    /// reason about the file was violated. Fatal: the caller-facing API
    /// turns this into a process abort rather than returning it.
    #[snafu(display("corruption detected: {message}"))]
    Corrupt { message: String },
}

impl StoreError {
    pub(crate) fn invalid(message: impl Into<String>) -> StoreError {
        StoreError::InvalidArgument {
            message: message.into(),
        }
    }

    pub(crate) fn corrupt(message: impl Into<String>) -> StoreError {
        StoreError::Corrupt {
            message: message.into(),
        }
    }

    pub(crate) fn exhausted(message: impl Into<String>) -> StoreError {
        StoreError::ResourceExhausted {
            message: message.into(),
        }
    }

    /// `true` for [`StoreError::NotFound`], the only kind every range/seek
    /// operation in this crate returns on exhaustion.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }

    /// Maps this error onto the `0 | -1` convention described in the
    /// external interfaces for hosts that want the original calling
    /// convention rather than `Result`.
    pub fn into_status(self) -> i32 {
        -1
    }
}

impl From<std::io::Error> for StoreError {
    fn from(source: std::io::Error) -> Self {
        StoreError::Io { source }
    }
}

impl From<nix::errno::Errno> for StoreError {
    fn from(errno: nix::errno::Errno) -> Self {
        StoreError::Io {
            source: std::io::Error::from_raw_os_error(errno as i32),
        }
    }
}

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Records `err` on the calling thread's diagnostic channel and returns it
/// unchanged, so this can sit in a `.map_err` / `?` chain.
///
/// Spec §6/§7 describe a single process-global, environment-variable-style
/// channel. DESIGN NOTES flags that shape as not thread-safe and recommends
/// promoting it; this crate keeps the channel's single-slot, "last error
/// wins" shape but scopes it per calling thread.
pub(crate) fn record_diagnostic(err: StoreError) -> StoreError {
    let message = err.to_string();
    LAST_ERROR.with(|cell| *cell.borrow_mut() = Some(message));
    err
}

/// Reads back the most recent diagnostic recorded on the calling thread, if
/// any public operation has failed there yet.
pub fn last_error() -> Option<String> {
    LAST_ERROR.with(|cell| cell.borrow().clone())
}

/// Escalates [`StoreError::Corrupt`] to a process abort; every other kind
/// passes through unchanged. Corruption means some invariant the rest of
/// this library leans on to reason about the file no longer holds, so
/// there's no well-defined `Result` to hand back to the caller — continuing
/// to run risks writing further damage on top of it.
pub(crate) fn escalate_corruption(err: StoreError) -> StoreError {
    if let StoreError::Corrupt { message } = &err {
        tracing::error!(%message, "corruption detected, aborting process");
        std::process::abort();
    }
    err
}
