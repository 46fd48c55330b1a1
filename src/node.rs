use crate::host::Host;
use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use std::sync::atomic::Ordering;

/// One storage record: an immutable `(hash, key)` plus an atomically
/// published value pointer.
///
/// `hash` and `key` are set when the entry is created and never change, not
/// even on deletion, so they can be read without synchronization once the
/// entry itself has been published (the table publishes entries with release
/// stores; see `raw::Table`). The value moves through
/// absent -> present -> ... -> present -> absent; once cleared it is never
/// re-armed,
/// which is what keeps "delete then re-insert" producing a *new* entry at the
/// end of the insertion order.
pub(crate) struct Entry<H>
where
    H: Host,
{
    pub(crate) hash: u64,
    pub(crate) key: H::Obj,
    pub(crate) value: Atomic<H::Obj>,
}

impl<H> Entry<H>
where
    H: Host,
{
    pub(crate) fn new(hash: u64, key: H::Obj, value: H::Obj) -> Self {
        Self {
            hash,
            key,
            value: Atomic::new(value),
        }
    }

    /// Loads the current value, or `None` if this entry is a tombstone.
    pub(crate) fn load_value<'g>(&'g self, guard: &'g Guard) -> Option<&'g H::Obj> {
        let value = self.value.load(Ordering::Acquire, guard);
        if value.is_null() {
            None
        } else {
            // safety: a non-null value pointer was published with a release
            // store and is only released through the guard-based deferral in
            // `map.rs`, so it outlives `guard`.
            Some(unsafe { value.deref() })
        }
    }

    /// Swaps in a new value (or a tombstone), returning the previous value
    /// pointer. The caller owns deferring destruction of the returned
    /// pointer.
    pub(crate) fn swap_value<'g>(
        &self,
        value: Option<H::Obj>,
        guard: &'g Guard,
    ) -> Shared<'g, H::Obj> {
        match value {
            Some(value) => self.value.swap(Owned::new(value), Ordering::AcqRel, guard),
            None => self.value.swap(Shared::null(), Ordering::AcqRel, guard),
        }
    }
}
