use crate::host::{ErrorKind, Host};
use crate::map::Dict;
use crate::raw::Table;
use crossbeam_epoch::Guard;
use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};

/// A cursor over the entries of one table snapshot, in insertion order.
///
/// The cursor reads `fill` once per step and walks the dense prefix below
/// it, skipping tombstones. Keys are safe to read without further
/// synchronization because entries are immutable once published and `fill`
/// is loaded (acquire) after the entry stores it covers; values still go
/// through their atomic slot. The index advances with a fetch-add, so a
/// cursor may be shared.
pub(crate) struct EntryIter<'g, H>
where
    H: Host,
{
    table: &'g Table<H>,
    index: AtomicU32,
    guard: &'g Guard,
}

impl<'g, H> EntryIter<'g, H>
where
    H: Host,
{
    pub(crate) fn new(table: &'g Table<H>, guard: &'g Guard) -> Self {
        Self {
            table,
            index: AtomicU32::new(0),
            guard,
        }
    }

    /// Advances to the next live entry, or returns `None` at the end of the
    /// snapshot.
    pub(crate) fn next(&self) -> Option<(&'g H::Obj, &'g H::Obj)> {
        let fill = self.table.fill();
        loop {
            let index = self.index.fetch_add(1, Ordering::Relaxed);
            if index >= fill {
                // roll back so repeated exhaustion does not creep the index
                self.index.fetch_sub(1, Ordering::Relaxed);
                return None;
            }
            if let Some(entry) = self.table.entry(index, self.guard) {
                if let Some(value) = entry.load_value(self.guard) {
                    return Some((&entry.key, value));
                }
            }
            // tombstone; keep going
        }
    }
}

/// A snapshot of a dictionary's version counter, used to detect modification
/// at observation time.
pub(crate) struct VersionGuard<'g, H>
where
    H: Host,
{
    dict: &'g Dict<H>,
    version: u64,
}

impl<'g, H> VersionGuard<'g, H>
where
    H: Host,
{
    pub(crate) fn new(dict: &'g Dict<H>) -> Self {
        Self {
            dict,
            version: dict.load_version(),
        }
    }

    /// Returns `false` if the dictionary has changed since this guard was
    /// created.
    pub(crate) fn check(&self) -> bool {
        self.dict.load_version() == self.version
    }
}

/// The shared step: advance the cursor, then verify the version guard.
///
/// The guard is verified even when the cursor is exhausted, so an iterator
/// that has already returned its last item still reports a subsequent
/// modification instead of a quiet end-of-iteration.
fn next_guarded<'g, H>(
    cx: &mut H,
    entries: &EntryIter<'g, H>,
    version: &VersionGuard<'_, H>,
) -> Result<Option<(&'g H::Obj, &'g H::Obj)>, H::Raised>
where
    H: Host,
{
    let item = entries.next();
    if !version.check() {
        return Err(cx.raise(
            ErrorKind::Runtime,
            "dictionary changed during iteration".to_owned(),
        ));
    }
    Ok(item)
}

/// An iterator over a dictionary's key/value pairs, in insertion order.
///
/// See [`Dict::iter`](crate::Dict::iter) for details.
pub struct Items<'g, H>
where
    H: Host,
{
    pub(crate) entries: EntryIter<'g, H>,
    pub(crate) version: VersionGuard<'g, H>,
}

impl<'g, H> Items<'g, H>
where
    H: Host,
{
    /// Advances the iterator.
    ///
    /// Returns `Ok(None)` once the snapshot is exhausted. Raises a
    /// [`Runtime`](crate::ErrorKind::Runtime) error if the dictionary has
    /// been modified since the iterator was created, even after exhaustion.
    pub fn next(&self, cx: &mut H) -> Result<Option<(&'g H::Obj, &'g H::Obj)>, H::Raised> {
        next_guarded(cx, &self.entries, &self.version)
    }
}

impl<H> Debug for Items<'_, H>
where
    H: Host,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Items").finish_non_exhaustive()
    }
}

/// An iterator over a dictionary's keys, in insertion order.
///
/// See [`Dict::iter_keys`](crate::Dict::iter_keys) for details.
pub struct Keys<'g, H>
where
    H: Host,
{
    pub(crate) entries: EntryIter<'g, H>,
    pub(crate) version: VersionGuard<'g, H>,
}

impl<'g, H> Keys<'g, H>
where
    H: Host,
{
    /// Advances the iterator. See [`Items::next`] for the contract.
    pub fn next(&self, cx: &mut H) -> Result<Option<&'g H::Obj>, H::Raised> {
        Ok(next_guarded(cx, &self.entries, &self.version)?.map(|(key, _)| key))
    }
}

impl<H> Debug for Keys<'_, H>
where
    H: Host,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys").finish_non_exhaustive()
    }
}

/// An iterator over a dictionary's values, in insertion order.
///
/// See [`Dict::iter_values`](crate::Dict::iter_values) for details.
pub struct Values<'g, H>
where
    H: Host,
{
    pub(crate) entries: EntryIter<'g, H>,
    pub(crate) version: VersionGuard<'g, H>,
}

impl<'g, H> Values<'g, H>
where
    H: Host,
{
    /// Advances the iterator. See [`Items::next`] for the contract.
    pub fn next(&self, cx: &mut H) -> Result<Option<&'g H::Obj>, H::Raised> {
        Ok(next_guarded(cx, &self.entries, &self.version)?.map(|(_, value)| value))
    }
}

impl<H> Debug for Values<'_, H>
where
    H: Host,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Values").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use crate::{Dict, StrHost};
    use std::sync::Arc;

    fn obj(s: &str) -> Arc<str> {
        Arc::from(s)
    }

    #[test]
    fn items_in_insertion_order() {
        let cx = &mut StrHost::new();
        let dict = Dict::new();
        let guard = dict.guard();
        for (k, v) in [("a", "1"), ("b", "2"), ("c", "3")] {
            dict.insert(cx, &obj(k), obj(v), &guard).unwrap();
        }

        let iter = dict.iter(&guard);
        let mut seen = Vec::new();
        while let Some((k, v)) = iter.next(cx).unwrap() {
            seen.push((k.to_string(), v.to_string()));
        }
        assert_eq!(
            seen,
            [
                ("a".to_owned(), "1".to_owned()),
                ("b".to_owned(), "2".to_owned()),
                ("c".to_owned(), "3".to_owned()),
            ]
        );
    }

    #[test]
    fn keys_and_values_project() {
        let cx = &mut StrHost::new();
        let dict = Dict::new();
        let guard = dict.guard();
        dict.insert(cx, &obj("k"), obj("v"), &guard).unwrap();

        let keys = dict.iter_keys(&guard);
        assert_eq!(keys.next(cx).unwrap().map(|k| &**k), Some("k"));
        assert_eq!(keys.next(cx).unwrap(), None);

        let values = dict.iter_values(&guard);
        assert_eq!(values.next(cx).unwrap().map(|v| &**v), Some("v"));
        assert_eq!(values.next(cx).unwrap(), None);
    }

    #[test]
    fn tombstones_are_skipped() {
        let cx = &mut StrHost::new();
        let dict = Dict::new();
        let guard = dict.guard();
        for k in ["a", "b", "c"] {
            dict.insert(cx, &obj(k), obj(k), &guard).unwrap();
        }
        dict.remove(cx, &obj("b"), &guard).unwrap();

        let iter = dict.iter_keys(&guard);
        let mut seen = Vec::new();
        while let Some(k) = iter.next(cx).unwrap() {
            seen.push(k.to_string());
        }
        assert_eq!(seen, ["a", "c"]);
    }

    #[test]
    fn exhaustion_is_idempotent() {
        let cx = &mut StrHost::new();
        let dict = Dict::new();
        let guard = dict.guard();
        dict.insert(cx, &obj("a"), obj("1"), &guard).unwrap();

        let iter = dict.iter_keys(&guard);
        assert!(iter.next(cx).unwrap().is_some());
        assert_eq!(iter.next(cx).unwrap(), None);
        assert_eq!(iter.next(cx).unwrap(), None);
    }
}
