//! An insertion-ordered, thread-safe dictionary for dynamic object runtimes.
//!
//! This crate provides [`Dict`], the associative container of a
//! dynamically-typed object model: it maps arbitrary hashable objects to
//! arbitrary objects, preserves insertion order, and stays coherent under
//! concurrent access. Hashing, equality, and rendering are not compile-time
//! properties of the keys here: they are runtime callbacks supplied by a
//! [`Host`], they can fail, and they can recursively call back into the very
//! dictionary that invoked them. Most of the engineering in this crate
//! exists to make that combination safe.
//!
//! # Design
//!
//! A dictionary owns a *table*: a dense, append-only array of entries in
//! insertion order, plus (above eight entries) an open-addressed array of
//! 1-based indices into it for hashed lookups. Entries pair an immutable
//! `(hash, key)` with an atomically-published value pointer; deleting a key
//! clears the value but leaves the entry in place as a tombstone, and
//! re-inserting the key appends a fresh entry at the end. That is what makes
//! "delete then insert moves the key to the back" fall out of the layout
//! instead of requiring bookkeeping.
//!
//! - **Readers take no lock.** A lookup loads the published table pointer,
//!   probes, and loads the entry's value pointer, all with acquire ordering
//!   against the writer's release stores. A full table is never mutated into
//!   a new shape; a replacement is built privately and installed with one
//!   atomic pointer store, so a reader sees either the old table or the new
//!   one, both complete.
//! - **Writers are serialized per dictionary** by a re-entrant mutex. The
//!   mutex must be re-entrant because the host's `hash`/`eq` callbacks run
//!   inside the write path and may operate on the same dictionary. A
//!   version counter is snapshotted around those callbacks; if it moves, the
//!   write raises rather than acting on a stale lookup.
//! - **Iterators are fail-fast.** An iterator snapshots the table and the
//!   version counter; every step, including steps after exhaustion,
//!   verifies the counter and raises if the dictionary was modified.
//!
//! # A note on `Guard` and memory use
//!
//! Replaced tables and overwritten values cannot be freed while a lock-free
//! reader might still be looking at them. This crate uses
//! [`crossbeam_epoch`](epoch) for that: read-path methods take an
//! [`epoch::Guard`] and return references that live as long as it. Acquire
//! guards with [`Dict::guard`]; a guard pinned by an unrelated collector is
//! rejected, since its collector would be free to reclaim this dictionary's
//! garbage out from under you. Holding a guard for a long time keeps every
//! table and value retired since then alive, so pin around operations, not
//! around program phases.
//!
//! # Hosts
//!
//! The [`Host`] trait is the seam to the surrounding runtime: object
//! references, fallible hashing/equality/rendering, the sequence protocol
//! used by [`Dict::update_pairs`], and typed error construction
//! ([`ErrorKind`]). [`StrHost`] is a small bundled host whose objects are
//! `Arc<str>`, enough for examples and tests; an interpreter would implement
//! `Host` for its frame or context type and thread that through.
//!
//! ```
//! use ledger::{Dict, StrHost};
//! use std::sync::Arc;
//!
//! let cx = &mut StrHost::new();
//! let dict = Dict::new();
//! let guard = dict.guard();
//!
//! dict.insert(cx, &Arc::from("a"), Arc::from("1"), &guard)?;
//! dict.insert(cx, &Arc::from("b"), Arc::from("2"), &guard)?;
//! dict.insert(cx, &Arc::from("a"), Arc::from("3"), &guard)?;
//!
//! // insertion order is preserved; overwriting does not move a key
//! let keys: Vec<String> = dict.keys().iter().map(|k| k.to_string()).collect();
//! assert_eq!(keys, ["a", "b"]);
//! # Ok::<(), ledger::DictError>(())
//! ```
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

mod host;
pub mod iter;
mod map;
mod node;
mod raw;

pub use crate::host::{DictError, ErrorKind, Host, StrHost};
pub use crate::map::Dict;

/// Re-export of [`crossbeam_epoch`], the source of the [`Guard`](epoch::Guard)
/// type the dictionary API works with.
pub use crossbeam_epoch as epoch;
