use crate::host::Host;
use crate::node::Entry;
use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};

/// The largest number of entries a table can hold. Capacities are powers of
/// two; this is the largest power of two that still leaves the doubled
/// indices array addressable with a `u32`.
pub(crate) const MAXIMUM_CAPACITY: u32 = 1 << 30;

/// The smallest table ever allocated.
const MINIMUM_CAPACITY: u32 = 4;

/// Tables at or below this capacity carry no indices array; lookups scan the
/// entries directly.
const MAX_UNINDEXED_CAPACITY: u32 = 8;

/// Advances a probe sequence.
///
/// Starting from `i = hash & mask` with `perturb = hash`, collisions step to
/// `5·i + perturb + 1`, shifting `perturb` down five bits each time. The
/// perturbation scatters keys that share low hash bits; once it reaches zero
/// the recurrence `5·i + 1 (mod 2^k)` cycles through every slot, so the
/// sequence is exhaustive.
#[inline]
fn next_probe(i: u32, perturb: u64) -> (u32, u64) {
    (
        i.wrapping_mul(5).wrapping_add(perturb as u32).wrapping_add(1),
        perturb >> 5,
    )
}

/// The hash table backing a `Dict`: a dense, append-only `entries` array in
/// insertion order, and (for capacities above [`MAX_UNINDEXED_CAPACITY`]) an
/// open-addressed `indices` array of 1-based positions into it, twice as
/// long, where `0` means "never written".
///
/// The array identities are immutable once the table has been published;
/// afterwards only entry slots, value pointers inside entries, `used`, and
/// `fill` change, all through atomics. Entry slots are published with
/// release stores and a nonzero index (or a `fill` beyond the slot) is stored
/// with release ordering only after its entry, so a reader that observes
/// either sees a fully-constructed entry without taking any lock. A table
/// that must change shape is rebuilt privately and installed with a single
/// release store of the table pointer; readers keep using the table their
/// guard pinned.
pub(crate) struct Table<H>
where
    H: Host,
{
    /// Number of live entries (present values).
    used: AtomicU32,
    /// Number of entry slots ever written: live plus tombstoned. Doubles as
    /// the append cursor, so `used <= fill <= capacity`.
    fill: AtomicU32,
    capacity: u32,
    /// `indices.len() - 1`, or `0` for unindexed tables.
    mask: u32,
    indices: Box<[AtomicU32]>,
    entries: Box<[Atomic<Entry<H>>]>,
}

impl<H> Table<H>
where
    H: Host,
{
    /// Allocates a table that can hold at least `num_entries` entries.
    ///
    /// The capacity is `num_entries` rounded up to a power of two by bit
    /// fill, with a floor of [`MINIMUM_CAPACITY`]. The caller keeps requests
    /// within [`MAXIMUM_CAPACITY`].
    pub(crate) fn new(num_entries: u32) -> Self {
        let mut n = num_entries;
        if n <= MINIMUM_CAPACITY {
            n = MINIMUM_CAPACITY;
        } else if n & (n - 1) != 0 {
            n |= n >> 1;
            n |= n >> 2;
            n |= n >> 4;
            n |= n >> 8;
            n |= n >> 16;
            n += 1;
        }

        let (mask, indices) = if n > MAX_UNINDEXED_CAPACITY {
            let slots = (n * 2) as usize;
            (
                n * 2 - 1,
                (0..slots).map(|_| AtomicU32::new(0)).collect(),
            )
        } else {
            (0, Box::from([]))
        };

        Self {
            used: AtomicU32::new(0),
            fill: AtomicU32::new(0),
            capacity: n,
            mask,
            indices,
            entries: vec![Atomic::null(); n as usize].into_boxed_slice(),
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub(crate) fn used(&self) -> u32 {
        self.used.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn fill(&self) -> u32 {
        self.fill.load(Ordering::Acquire)
    }

    /// Loads the entry at position `eidx`, or `None` if that slot was never
    /// written.
    #[inline]
    pub(crate) fn entry<'g>(&'g self, eidx: u32, guard: &'g Guard) -> Option<&'g Entry<H>> {
        let entry = self.entries[eidx as usize].load(Ordering::Acquire, guard);
        if entry.is_null() {
            None
        } else {
            // safety: entry slots are written at most once, with release
            // ordering, and are only freed together with the table, which
            // `guard` keeps alive.
            Some(unsafe { entry.deref() })
        }
    }

    /// Finds the entry for `(hash, key)`.
    ///
    /// Returns the terminal probe index together with the matching entry, if
    /// any. The entry may be a tombstone; callers check its value. A miss on
    /// an indexed table returns the empty probe slot where the key's index
    /// would go.
    ///
    /// Equality runs through the host and may raise or re-enter the
    /// dictionary; no lock is held at this level, which is what makes that
    /// legal. Lookups are consistent without the dictionary lock: on
    /// unindexed tables they synchronize on `fill`, on indexed tables on the
    /// index slots, both of which are published after their entries.
    pub(crate) fn lookup<'g>(
        &'g self,
        cx: &mut H,
        hash: u64,
        key: &H::Obj,
        guard: &'g Guard,
    ) -> Result<(u32, Option<&'g Entry<H>>), H::Raised> {
        if self.mask == 0 {
            // scan in reverse so that a key re-inserted after a deletion is
            // found before its older tombstone
            for eidx in (0..self.fill()).rev() {
                if let Some(entry) = self.entry(eidx, guard) {
                    if entry.hash == hash && cx.eq(&entry.key, key)? {
                        return Ok((0, Some(entry)));
                    }
                }
            }
            return Ok((0, None));
        }

        let mut i = (hash as u32) & self.mask;
        let mut perturb = hash;
        let mut index = i & self.mask;
        loop {
            let idx = self.indices[index as usize].load(Ordering::Acquire);
            if idx == 0 {
                return Ok((index, None));
            }
            if let Some(entry) = self.entry(idx - 1, guard) {
                if entry.hash == hash && cx.eq(&entry.key, key)? {
                    return Ok((index, Some(entry)));
                }
            }
            let (next_i, next_perturb) = next_probe(i, perturb);
            i = next_i;
            perturb = next_perturb;
            index = i & self.mask;
        }
    }

    /// Adds `entry`, whose key the caller guarantees is absent, to a table
    /// that is not yet reachable by other threads. No key comparisons are
    /// needed, and no ordering is either: the table-pointer store that later
    /// publishes the table is the synchronization point.
    pub(crate) fn insert_absent(&self, entry: Entry<H>) {
        let fill = self.fill.load(Ordering::Relaxed);
        if fill == self.capacity {
            panic!("overrun");
        }
        if self.mask != 0 {
            let mut i = (entry.hash as u32) & self.mask;
            let mut perturb = entry.hash;
            let mut index = i;
            // the key is known to be absent, so probe for the first zero slot
            while self.indices[index as usize].load(Ordering::Relaxed) != 0 {
                let (next_i, next_perturb) = next_probe(i, perturb);
                i = next_i;
                perturb = next_perturb;
                index = i & self.mask;
            }
            self.indices[index as usize].store(fill + 1, Ordering::Relaxed);
        }
        self.entries[fill as usize].store(Owned::new(entry), Ordering::Relaxed);
        self.used.fetch_add(1, Ordering::Relaxed);
        self.fill.store(fill + 1, Ordering::Relaxed);
    }

    /// Publishes a new entry on a live table, at the probe position a
    /// preceding [`lookup`](Table::lookup) returned. The entry is stored
    /// first; the index slot and the counters follow with release stores, so
    /// a reader that observes any of them sees the whole entry. The caller
    /// has verified `fill < capacity` and holds the dictionary lock.
    pub(crate) fn write_new_entry(&self, index: u32, entry: Entry<H>) {
        let eidx = self.fill.load(Ordering::Relaxed);
        self.entries[eidx as usize].store(Owned::new(entry), Ordering::Release);
        if self.mask != 0 {
            // overwrites the index of a tombstone for the same key, if any
            self.indices[index as usize].store(eidx + 1, Ordering::Release);
        }
        self.used.fetch_add(1, Ordering::Release);
        self.fill.fetch_add(1, Ordering::Release);
    }

    /// Replaces the value of a non-tombstone entry, returning the previous
    /// value pointer; the caller owns deferring its destruction. Storing
    /// `None` tombstones the entry: the cleared value is published before the
    /// live count drops.
    pub(crate) fn write_value<'g>(
        &self,
        entry: &Entry<H>,
        value: Option<H::Obj>,
        guard: &'g Guard,
    ) -> Shared<'g, H::Obj> {
        let clearing = value.is_none();
        let old = entry.swap_value(value, guard);
        if clearing {
            self.used.fetch_sub(1, Ordering::Release);
        }
        old
    }

    /// Builds the replacement table for a full or tombstone-heavy one,
    /// walking the live entries in insertion order. Returns `None` when the
    /// table is already at [`MAXIMUM_CAPACITY`] and more than half full.
    pub(crate) fn grow(&self, guard: &Guard) -> Option<Table<H>> {
        let new_capacity = grown_capacity(self.used(), self.capacity)?;
        let new = Table::new(new_capacity);
        for eidx in 0..self.fill() {
            if let Some(entry) = self.entry(eidx, guard) {
                if let Some(value) = entry.load_value(guard) {
                    new.insert_absent(Entry::new(entry.hash, entry.key.clone(), value.clone()));
                }
            }
        }
        Some(new)
    }
}

/// The resize decision: compact down to `2·used` when less than half the
/// capacity is live, otherwise double, failing once doubling would pass
/// [`MAXIMUM_CAPACITY`].
fn grown_capacity(used: u32, capacity: u32) -> Option<u32> {
    if used < capacity / 2 {
        Some(used * 2)
    } else if capacity <= MAXIMUM_CAPACITY / 2 {
        Some(capacity * 2)
    } else {
        None
    }
}

impl<H> Drop for Table<H>
where
    H: Host,
{
    fn drop(&mut self) {
        // safety: a table is dropped only when no thread can reach it: via
        // `defer_destroy` after it was unpublished, or from `Dict::drop`,
        // which has exclusive access. Entries are never shared between
        // tables (rebuilds clone them), so everything here is owned.
        let guard = unsafe { crossbeam_epoch::unprotected() };

        for slot in Vec::from(mem::replace(&mut self.entries, Box::from([]))) {
            if slot.load(Ordering::Relaxed, guard).is_null() {
                // never written
                continue;
            }
            // safety: as above, the slot and its boxed entry are ours
            let entry = *unsafe { slot.into_owned() }.into_box();
            if !entry.value.load(Ordering::Relaxed, guard).is_null() {
                // safety: live values are released with their table
                let _ = unsafe { entry.value.into_owned() };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::StrHost;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn entry(cx: &mut StrHost, key: &str, value: &str) -> Entry<StrHost> {
        let key: Arc<str> = Arc::from(key);
        let hash = cx.hash(&key).unwrap();
        Entry::new(hash, key, Arc::from(value))
    }

    fn find<'g>(
        table: &'g Table<StrHost>,
        cx: &mut StrHost,
        key: &str,
        guard: &'g Guard,
    ) -> Option<&'g Entry<StrHost>> {
        let key: Arc<str> = Arc::from(key);
        let hash = cx.hash(&key).unwrap();
        table.lookup(cx, hash, &key, guard).unwrap().1
    }

    #[test]
    fn sizing_rounds_up_by_bit_fill() {
        for (requested, capacity) in [(0, 4), (3, 4), (4, 4), (5, 8), (8, 8), (9, 16), (33, 64)] {
            let table = Table::<StrHost>::new(requested);
            assert_eq!(table.capacity(), capacity, "requested {}", requested);
        }
    }

    #[test]
    fn small_tables_are_unindexed() {
        assert_eq!(Table::<StrHost>::new(8).mask, 0);
        let table = Table::<StrHost>::new(9);
        assert_eq!(table.mask, 31);
        assert_eq!(table.indices.len(), 32);
    }

    #[test]
    fn probe_sequence_visits_every_slot() {
        // once the perturbation is exhausted the recurrence is a
        // maximal-period LCG over the masked domain
        let mask = 31;
        let mut seen = HashSet::new();
        let mut i = 17;
        let mut perturb = 0;
        for _ in 0..32 {
            seen.insert(i & mask);
            let (next_i, next_perturb) = next_probe(i, perturb);
            i = next_i;
            perturb = next_perturb;
        }
        assert_eq!(seen.len(), 32);
    }

    #[test]
    fn lookup_unindexed() {
        let cx = &mut StrHost::new();
        let guard = &crossbeam_epoch::pin();
        let table = Table::new(4);
        table.insert_absent(entry(cx, "a", "1"));
        table.insert_absent(entry(cx, "b", "2"));

        assert_eq!(
            find(&table, cx, "a", guard)
                .and_then(|e| e.load_value(guard))
                .map(|v| &**v),
            Some("1")
        );
        assert!(find(&table, cx, "missing", guard).is_none());
        assert_eq!(table.used(), 2);
        assert_eq!(table.fill(), 2);
    }

    #[test]
    fn lookup_indexed() {
        let cx = &mut StrHost::new();
        let guard = &crossbeam_epoch::pin();
        let table = Table::new(16);
        for k in 0..12 {
            table.insert_absent(entry(cx, &k.to_string(), &(k * 10).to_string()));
        }
        for k in 0..12 {
            let value = find(&table, cx, &k.to_string(), guard)
                .and_then(|e| e.load_value(guard))
                .map(|v| v.to_string());
            assert_eq!(value, Some((k * 10).to_string()));
        }
        assert!(find(&table, cx, "12", guard).is_none());
    }

    #[test]
    fn reverse_scan_prefers_reinserted_entry() {
        let cx = &mut StrHost::new();
        let guard = &crossbeam_epoch::pin();
        let table = Table::new(4);
        table.insert_absent(entry(cx, "a", "old"));

        let tombstoned = find(&table, cx, "a", guard).unwrap();
        let old = table.write_value(tombstoned, None, guard);
        // safety: the table is private to this test, nothing else can read
        // the old value
        let _ = unsafe { old.into_owned() };
        assert_eq!(table.used(), 0);

        table.insert_absent(entry(cx, "a", "new"));
        assert_eq!(
            find(&table, cx, "a", guard)
                .and_then(|e| e.load_value(guard))
                .map(|v| &**v),
            Some("new")
        );
        assert_eq!(table.fill(), 2);
    }

    #[test]
    fn write_new_entry_overwrites_tombstone_index() {
        let cx = &mut StrHost::new();
        let guard = &crossbeam_epoch::pin();
        let table = Table::new(16);
        table.insert_absent(entry(cx, "a", "old"));

        let tombstoned = find(&table, cx, "a", guard).unwrap();
        let old = table.write_value(tombstoned, None, guard);
        let _ = unsafe { old.into_owned() };

        let key: Arc<str> = Arc::from("a");
        let hash = cx.hash(&key).unwrap();
        let (index, found) = table.lookup(cx, hash, &key, guard).unwrap();
        // the tombstone is still reachable through its index
        assert!(found.is_some());
        table.write_new_entry(index, entry(cx, "a", "new"));

        assert_eq!(
            find(&table, cx, "a", guard)
                .and_then(|e| e.load_value(guard))
                .map(|v| &**v),
            Some("new")
        );
        assert_eq!(table.used(), 1);
        assert_eq!(table.fill(), 2);
    }

    #[test]
    fn grow_compacts_tombstones_in_order() {
        let cx = &mut StrHost::new();
        let guard = &crossbeam_epoch::pin();
        let table = Table::new(4);
        for k in ["a", "b", "c", "d"] {
            table.insert_absent(entry(cx, k, k));
        }
        for k in ["a", "c", "d"] {
            let e = find(&table, cx, k, guard).unwrap();
            let old = table.write_value(e, None, guard);
            let _ = unsafe { old.into_owned() };
        }

        let grown = table.grow(guard).unwrap();
        // used == 1 < capacity/2, so this was a compaction
        assert_eq!(grown.capacity(), 4);
        assert_eq!(grown.fill(), 1);
        let keys: Vec<_> = (0..grown.fill())
            .filter_map(|i| grown.entry(i, guard))
            .map(|e| e.key.to_string())
            .collect();
        assert_eq!(keys, ["b"]);
    }

    #[test]
    fn grow_doubles_when_half_full() {
        let cx = &mut StrHost::new();
        let guard = &crossbeam_epoch::pin();
        let table = Table::new(4);
        for k in ["a", "b", "c", "d"] {
            table.insert_absent(entry(cx, k, k));
        }

        let grown = table.grow(guard).unwrap();
        assert_eq!(grown.capacity(), 8);
        assert_eq!(grown.used(), 4);
        let keys: Vec<_> = (0..grown.fill())
            .filter_map(|i| grown.entry(i, guard))
            .map(|e| e.key.to_string())
            .collect();
        assert_eq!(keys, ["a", "b", "c", "d"]);
    }

    #[test]
    fn grown_capacity_decision() {
        // compaction wins while less than half the table is live
        assert_eq!(grown_capacity(3, 8), Some(6));
        assert_eq!(grown_capacity(0, 4), Some(0));
        // otherwise double
        assert_eq!(grown_capacity(4, 8), Some(16));
        assert_eq!(grown_capacity(2, 4), Some(8));
        // at the ceiling, compaction is still allowed but doubling is not
        assert_eq!(
            grown_capacity(MAXIMUM_CAPACITY / 4, MAXIMUM_CAPACITY),
            Some(MAXIMUM_CAPACITY / 2)
        );
        assert_eq!(grown_capacity(MAXIMUM_CAPACITY / 2, MAXIMUM_CAPACITY), None);
    }
}
