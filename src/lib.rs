//! `avlfile`: an embeddable, file-backed associative store.
//!
//! A fixed-length record arena indexed by one or more user-defined, threaded
//! AVL trees sharing the arena's physical slots, with a doubly linked
//! sequential list, a free list, and a per-opener cursor registry all
//! persisted inside the same file. Concurrent processes cooperate through a
//! single advisory byte-range lock (the "gate") on the file's first byte;
//! concurrent threads of one process additionally cooperate through an
//! in-process mutex when the `multi-thread` feature is enabled (the
//! default).
//!
//! This is a library, not a server: every call runs on the caller's thread,
//! blocking as needed on file I/O and the gate. There is no in-memory cache
//! and no background compaction — the host decides when to call
//! [`Store::squash`].
//!
//! ```no_run
//! use std::cmp::Ordering;
//! use avlfile::{OpenOptionsBuilder, Store};
//!
//! let options = OpenOptionsBuilder::from_path("records.avl")
//!     .key_count(1)
//!     .data_len(16)
//!     .build()?;
//! let mut store = Store::open(options, |_key: u32, a: &[u8], b: &[u8]| a.cmp(b))?;
//! store.insert(&[0u8; 16])?;
//! store.close()?;
//! # Ok::<(), avlfile::StoreError>(())
//! ```

#[macro_use]
extern crate tracing;

mod arena;
mod chain;
mod compact;
mod cursor;
mod error;
mod header;
mod layout;
mod lock;
mod options;
mod seqlist;
mod slot;
mod store;
mod tree;

pub use error::{last_error, StoreError};
pub use options::{OpenOptions, OpenOptionsBuilder, Threading};
pub use store::Store;
pub use tree::{KeyComparator, ScanReport};
