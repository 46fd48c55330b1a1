use crate::host::{ErrorKind, Host};
use crate::iter::{EntryIter, Items, Keys, Values, VersionGuard};
use crate::node::Entry;
use crate::raw::{Table, MAXIMUM_CAPACITY};
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use parking_lot::ReentrantMutex;
use std::fmt::{self, Debug, Formatter};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

/// An insertion-ordered, thread-safe dictionary.
///
/// A `Dict` maps host objects to host objects under the host's own notions of
/// hashing and equality (see [`Host`]). Reads never take a lock: they load
/// the published table pointer, probe, and load the entry's value pointer,
/// all with acquire ordering. Writes are serialized per dictionary by a
/// re-entrant mutex, because the hash and equality callbacks that run inside
/// the write path are allowed to call back into this same dictionary.
///
/// Like the map it is modeled on, a `Dict` hands out references tied to the
/// lifetime of an [`epoch::Guard`]; acquire one with [`Dict::guard`]. Guards
/// from any other source (including another dictionary) are rejected; see
/// the crate-level notes on guards and memory use.
///
/// Iteration yields entries in insertion order, where re-inserting a deleted
/// key moves it to the end. Iterators and cross-dictionary operations detect
/// concurrent modification through a version counter and raise a
/// [`Runtime`](ErrorKind::Runtime) error rather than returning data from a
/// state the dictionary was never in.
pub struct Dict<H>
where
    H: Host,
{
    /// The currently-published table. Replaced wholesale by resize and
    /// [`clear`](Dict::clear); superseded tables stay readable until every
    /// guard that could have loaded them is dropped.
    table: Atomic<Table<H>>,

    /// Serializes mutations. Re-entrant: a hash or equality callback running
    /// under this lock may legitimately re-enter the same dictionary.
    lock: ReentrantMutex<()>,

    /// Incremented on every observable content change. Iterators and the
    /// write path snapshot it to detect concurrent modification.
    version: AtomicU64,

    /// Collector that all `Guard` references used with this dictionary must
    /// be tied to. Accepting a guard from an unrelated collector would let
    /// that collector free values while a reader here still holds them.
    collector: epoch::Collector,
}

impl<H> Dict<H>
where
    H: Host,
{
    /// Creates an empty dictionary with the minimum capacity.
    ///
    /// # Examples
    ///
    /// ```
    /// use ledger::{Dict, StrHost};
    ///
    /// let dict: Dict<StrHost> = Dict::new();
    /// assert!(dict.is_empty());
    /// ```
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates an empty dictionary that can hold at least `capacity` entries
    /// before growing.
    ///
    /// The underlying table capacity is `capacity` rounded up to a power of
    /// two, at least 4.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` exceeds the maximum table size of 2³⁰ entries.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity <= MAXIMUM_CAPACITY as usize,
            "dictionary too big: {}",
            capacity
        );
        Self {
            table: Atomic::new(Table::new(capacity as u32)),
            lock: ReentrantMutex::new(()),
            version: AtomicU64::new(0),
            collector: epoch::Collector::new(),
        }
    }

    /// Pins a `Guard` for use with this dictionary.
    ///
    /// Keep in mind that for as long as you hold onto this guard, you are
    /// preventing the collection of garbage generated by the dictionary.
    pub fn guard(&self) -> epoch::Guard {
        self.collector.register().pin()
    }

    #[inline]
    fn check_guard(&self, guard: &Guard) {
        // guard.collector() is `None` for unprotected guards
        if let Some(collector) = guard.collector() {
            assert_eq!(collector, &self.collector);
        }
    }

    #[inline]
    pub(crate) fn load_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    #[inline]
    fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::Release);
    }

    /// Returns the number of live entries.
    ///
    /// # Examples
    ///
    /// ```
    /// use ledger::{Dict, StrHost};
    /// use std::sync::Arc;
    ///
    /// let cx = &mut StrHost::new();
    /// let dict = Dict::new();
    /// let guard = dict.guard();
    /// dict.insert(cx, &Arc::from("a"), Arc::from("1"), &guard)?;
    /// dict.insert(cx, &Arc::from("b"), Arc::from("2"), &guard)?;
    /// assert_eq!(dict.len(), 2);
    /// # Ok::<(), ledger::DictError>(())
    /// ```
    pub fn len(&self) -> usize {
        let guard = self.guard();
        let table = self.table.load(Ordering::Acquire, &guard);
        // safety: the published table is only retired through the guard
        // machinery, and we hold a guard
        unsafe { table.deref() }.used() as usize
    }

    /// Returns `true` if the dictionary holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    /// Returns the capacity of the current table.
    pub(crate) fn capacity(&self, guard: &Guard) -> usize {
        self.check_guard(guard);
        let table = self.table.load(Ordering::Acquire, guard);
        // safety: as in `len`
        unsafe { table.deref() }.capacity() as usize
    }

    /// Looks up `key`, returning its value if present.
    ///
    /// Lock-free: concurrent writers never block this call. Errors raised by
    /// the host's hash or equality callbacks propagate.
    ///
    /// # Examples
    ///
    /// ```
    /// use ledger::{Dict, StrHost};
    /// use std::sync::Arc;
    ///
    /// let cx = &mut StrHost::new();
    /// let dict = Dict::new();
    /// let guard = dict.guard();
    /// dict.insert(cx, &Arc::from("color"), Arc::from("teal"), &guard)?;
    /// assert_eq!(
    ///     dict.get(cx, &Arc::from("color"), &guard)?.map(|v| &**v),
    ///     Some("teal"),
    /// );
    /// assert_eq!(dict.get(cx, &Arc::from("shape"), &guard)?, None);
    /// # Ok::<(), ledger::DictError>(())
    /// ```
    pub fn get<'g>(
        &'g self,
        cx: &mut H,
        key: &H::Obj,
        guard: &'g Guard,
    ) -> Result<Option<&'g H::Obj>, H::Raised> {
        self.check_guard(guard);
        let hash = cx.hash(key)?;
        let table = self.table.load(Ordering::Acquire, guard);
        // safety: as in `len`
        let t = unsafe { table.deref() };
        let (_, entry) = t.lookup(cx, hash, key, guard)?;
        Ok(entry.and_then(|entry| entry.load_value(guard)))
    }

    /// Looks up `key`, raising a [`Key`](ErrorKind::Key) error naming the key
    /// if it is absent.
    pub fn get_item<'g>(
        &'g self,
        cx: &mut H,
        key: &H::Obj,
        guard: &'g Guard,
    ) -> Result<&'g H::Obj, H::Raised> {
        match self.get(cx, key, guard)? {
            Some(value) => Ok(value),
            None => {
                let repr = cx.repr(key)?;
                Err(cx.raise(ErrorKind::Key, repr))
            }
        }
    }

    /// Returns `true` if `key` is present.
    pub fn contains_key(&self, cx: &mut H, key: &H::Obj) -> Result<bool, H::Raised> {
        let guard = self.guard();
        Ok(self.get(cx, key, &guard)?.is_some())
    }

    /// Maps `key` to `value`, returning the previous value if the key was
    /// already present.
    ///
    /// A key re-inserted after a deletion becomes the newest entry in the
    /// iteration order; overwriting a live key leaves its position alone.
    ///
    /// Raises [`Overflow`](ErrorKind::Overflow) if the table is already at
    /// its maximum size, and [`Runtime`](ErrorKind::Runtime) if a hash or
    /// equality callback recursively modified this dictionary mid-write.
    ///
    /// # Examples
    ///
    /// ```
    /// use ledger::{Dict, StrHost};
    /// use std::sync::Arc;
    ///
    /// let cx = &mut StrHost::new();
    /// let dict = Dict::new();
    /// let guard = dict.guard();
    /// assert_eq!(dict.insert(cx, &Arc::from("a"), Arc::from("1"), &guard)?, None);
    /// assert_eq!(
    ///     dict.insert(cx, &Arc::from("a"), Arc::from("2"), &guard)?.map(|v| &**v),
    ///     Some("1"),
    /// );
    /// # Ok::<(), ledger::DictError>(())
    /// ```
    pub fn insert<'g>(
        &'g self,
        cx: &mut H,
        key: &H::Obj,
        value: H::Obj,
        guard: &'g Guard,
    ) -> Result<Option<&'g H::Obj>, H::Raised> {
        self.check_guard(guard);
        self.put_item(cx, key, Some(value), true, guard)
    }

    /// Removes `key`, returning its value if it was present.
    ///
    /// # Examples
    ///
    /// ```
    /// use ledger::{Dict, StrHost};
    /// use std::sync::Arc;
    ///
    /// let cx = &mut StrHost::new();
    /// let dict = Dict::new();
    /// let guard = dict.guard();
    /// dict.insert(cx, &Arc::from("a"), Arc::from("1"), &guard)?;
    /// assert_eq!(dict.remove(cx, &Arc::from("a"), &guard)?.map(|v| &**v), Some("1"));
    /// assert_eq!(dict.remove(cx, &Arc::from("a"), &guard)?, None);
    /// # Ok::<(), ledger::DictError>(())
    /// ```
    pub fn remove<'g>(
        &'g self,
        cx: &mut H,
        key: &H::Obj,
        guard: &'g Guard,
    ) -> Result<Option<&'g H::Obj>, H::Raised> {
        self.check_guard(guard);
        self.put_item(cx, key, None, true, guard)
    }

    /// Removes `key`, raising a [`Key`](ErrorKind::Key) error naming the key
    /// if it is absent.
    pub fn del_item(&self, cx: &mut H, key: &H::Obj) -> Result<(), H::Raised> {
        let guard = self.guard();
        if self.remove(cx, key, &guard)?.is_some() {
            Ok(())
        } else {
            let repr = cx.repr(key)?;
            Err(cx.raise(ErrorKind::Key, repr))
        }
    }

    /// Returns the value for `key`, inserting `default` first if the key is
    /// absent.
    ///
    /// The returned object is the one stored in the dictionary: calling this
    /// twice with fresh defaults hands back the same stored object.
    ///
    /// # Examples
    ///
    /// ```
    /// use ledger::{Dict, StrHost};
    /// use std::sync::Arc;
    ///
    /// let cx = &mut StrHost::new();
    /// let dict = Dict::new();
    /// let guard = dict.guard();
    /// let first = dict.set_default(cx, &Arc::from("k"), Arc::from("v"), &guard)?;
    /// let second = dict.set_default(cx, &Arc::from("k"), Arc::from("other"), &guard)?;
    /// assert!(Arc::ptr_eq(&first, &second));
    /// # Ok::<(), ledger::DictError>(())
    /// ```
    pub fn set_default(
        &self,
        cx: &mut H,
        key: &H::Obj,
        default: H::Obj,
        guard: &Guard,
    ) -> Result<H::Obj, H::Raised> {
        self.check_guard(guard);
        match self.put_item(cx, key, Some(default.clone()), false, guard)? {
            Some(existing) => Ok(existing.clone()),
            None => Ok(default),
        }
    }

    /// Removes and returns the last live `(key, value)` entry.
    ///
    /// Raises a [`Key`](ErrorKind::Key) error if the dictionary is empty.
    ///
    /// # Examples
    ///
    /// ```
    /// use ledger::{Dict, StrHost};
    /// use std::sync::Arc;
    ///
    /// let cx = &mut StrHost::new();
    /// let dict = Dict::new();
    /// let guard = dict.guard();
    /// dict.insert(cx, &Arc::from("a"), Arc::from("1"), &guard)?;
    /// dict.insert(cx, &Arc::from("b"), Arc::from("2"), &guard)?;
    /// let (key, value) = dict.pop_item(cx, &guard)?;
    /// assert_eq!((&**key, &**value), ("b", "2"));
    /// # Ok::<(), ledger::DictError>(())
    /// ```
    pub fn pop_item<'g>(
        &'g self,
        cx: &mut H,
        guard: &'g Guard,
    ) -> Result<(&'g H::Obj, &'g H::Obj), H::Raised> {
        self.check_guard(guard);
        let _serialized = self.lock.lock();
        let table = self.table.load(Ordering::Acquire, guard);
        // safety: as in `len`
        let t = unsafe { table.deref() };
        if t.used() == 0 {
            return Err(cx.raise(
                ErrorKind::Key,
                "popitem(): dictionary is empty".to_owned(),
            ));
        }
        for eidx in (0..t.fill()).rev() {
            if let Some(entry) = t.entry(eidx, guard) {
                if entry.load_value(guard).is_some() {
                    let old = t.write_value(entry, None, guard);
                    self.bump_version();
                    // safety: `old` was unlinked under the lock; readers may
                    // still hold it, so its destruction is deferred past
                    // every live guard, including ours
                    unsafe { guard.defer_destroy(old) };
                    return Ok((&entry.key, unsafe { old.deref() }));
                }
            }
        }
        unreachable!("a dictionary with a nonzero live count has a live entry");
    }

    /// Removes all entries by installing a fresh minimum-capacity table.
    ///
    /// # Examples
    ///
    /// ```
    /// use ledger::{Dict, StrHost};
    /// use std::sync::Arc;
    ///
    /// let cx = &mut StrHost::new();
    /// let dict = Dict::new();
    /// let guard = dict.guard();
    /// dict.insert(cx, &Arc::from("a"), Arc::from("1"), &guard)?;
    /// dict.clear(&guard);
    /// assert!(dict.is_empty());
    /// # Ok::<(), ledger::DictError>(())
    /// ```
    pub fn clear(&self, guard: &Guard) {
        self.check_guard(guard);
        let _serialized = self.lock.lock();
        let old = self
            .table
            .swap(Owned::new(Table::new(0)), Ordering::Release, guard);
        self.bump_version();
        // safety: readers may still hold the superseded table
        unsafe { guard.defer_destroy(old) };
    }

    /// Returns the keys as a snapshot list, in insertion order.
    ///
    /// Lock-free, like [`get`](Dict::get): the snapshot is the entry prefix
    /// of the table as of one atomic load of its fill count.
    pub fn keys(&self) -> Vec<H::Obj> {
        let guard = self.guard();
        let table = self.table.load(Ordering::Acquire, &guard);
        // safety: as in `len`
        let t = unsafe { table.deref() };
        let fill = t.fill();
        // `used` is loaded after `fill`, so the live entries in the prefix
        // cannot outnumber it
        let mut keys = Vec::with_capacity(t.used() as usize);
        for eidx in 0..fill {
            if let Some(entry) = t.entry(eidx, &guard) {
                if entry.load_value(&guard).is_some() {
                    keys.push(entry.key.clone());
                }
            }
        }
        keys
    }

    /// Returns the values as a list, in insertion order.
    ///
    /// Drains a guarded iterator, so a concurrent modification raises a
    /// [`Runtime`](ErrorKind::Runtime) error instead of producing a mixed
    /// view.
    pub fn values(&self, cx: &mut H) -> Result<Vec<H::Obj>, H::Raised> {
        let guard = self.guard();
        let iter = self.iter_values(&guard);
        let mut values = Vec::new();
        while let Some(value) = iter.next(cx)? {
            values.push(value.clone());
        }
        Ok(values)
    }

    /// Returns the `(key, value)` pairs as a list, in insertion order.
    ///
    /// Drains a guarded iterator; see [`values`](Dict::values).
    ///
    /// # Examples
    ///
    /// ```
    /// use ledger::{Dict, StrHost};
    /// use std::sync::Arc;
    ///
    /// let cx = &mut StrHost::new();
    /// let dict = Dict::new();
    /// let guard = dict.guard();
    /// dict.insert(cx, &Arc::from("a"), Arc::from("1"), &guard)?;
    /// dict.insert(cx, &Arc::from("b"), Arc::from("2"), &guard)?;
    /// dict.insert(cx, &Arc::from("a"), Arc::from("3"), &guard)?;
    ///
    /// let items: Vec<(String, String)> = dict
    ///     .items(cx)?
    ///     .into_iter()
    ///     .map(|(k, v)| (k.to_string(), v.to_string()))
    ///     .collect();
    /// assert_eq!(items, [("a".into(), "3".into()), ("b".into(), "2".into())]);
    /// # Ok::<(), ledger::DictError>(())
    /// ```
    pub fn items(&self, cx: &mut H) -> Result<Vec<(H::Obj, H::Obj)>, H::Raised> {
        let guard = self.guard();
        let iter = self.iter(&guard);
        let mut items = Vec::new();
        while let Some((key, value)) = iter.next(cx)? {
            items.push((key.clone(), value.clone()));
        }
        Ok(items)
    }

    /// An iterator over the `(key, value)` pairs, in insertion order.
    ///
    /// The iterator observes the entries published as of its creation and
    /// raises on any later modification; see [`Items::next`].
    pub fn iter<'g>(&'g self, guard: &'g Guard) -> Items<'g, H> {
        let (entries, version) = self.snapshot(guard);
        Items { entries, version }
    }

    /// An iterator over the keys, in insertion order.
    pub fn iter_keys<'g>(&'g self, guard: &'g Guard) -> Keys<'g, H> {
        let (entries, version) = self.snapshot(guard);
        Keys { entries, version }
    }

    /// An iterator over the values, in insertion order.
    pub fn iter_values<'g>(&'g self, guard: &'g Guard) -> Values<'g, H> {
        let (entries, version) = self.snapshot(guard);
        Values { entries, version }
    }

    /// Captures a consistent (table, version) pair for an iterator.
    fn snapshot<'g>(&'g self, guard: &'g Guard) -> (EntryIter<'g, H>, VersionGuard<'g, H>) {
        self.check_guard(guard);
        let _serialized = self.lock.lock();
        let table = self.table.load(Ordering::Acquire, guard);
        // safety: as in `len`
        let t = unsafe { table.deref() };
        (EntryIter::new(t, guard), VersionGuard::new(self))
    }

    /// Copies the entries of `other` into `self`, with `other`'s values
    /// winning on key collisions.
    ///
    /// A concurrent modification of `other` raises a
    /// [`Runtime`](ErrorKind::Runtime) error.
    ///
    /// # Examples
    ///
    /// ```
    /// use ledger::{Dict, StrHost};
    /// use std::sync::Arc;
    ///
    /// let cx = &mut StrHost::new();
    /// let a = Dict::new();
    /// let b = Dict::new();
    /// let guard = a.guard();
    /// a.insert(cx, &Arc::from("x"), Arc::from("1"), &guard)?;
    /// b.insert(cx, &Arc::from("x"), Arc::from("2"), &b.guard())?;
    /// b.insert(cx, &Arc::from("y"), Arc::from("3"), &b.guard())?;
    ///
    /// a.update(cx, &b)?;
    /// assert_eq!(a.get(cx, &Arc::from("x"), &guard)?.map(|v| &**v), Some("2"));
    /// assert_eq!(a.len(), 2);
    /// # Ok::<(), ledger::DictError>(())
    /// ```
    pub fn update(&self, cx: &mut H, other: &Dict<H>) -> Result<(), H::Raised> {
        let guard = self.guard();
        let other_guard = other.guard();
        let iter = other.iter(&other_guard);
        loop {
            match iter.next(cx)? {
                Some((key, value)) => {
                    self.insert(cx, key, value.clone(), &guard)?;
                }
                None => return Ok(()),
            }
        }
    }

    /// Copies key/value pairs into `self` from a sequence of pair objects,
    /// each decomposed through [`Host::elements`].
    ///
    /// Raises a [`Value`](ErrorKind::Value) error for an element whose
    /// length is not 2.
    ///
    /// # Examples
    ///
    /// ```
    /// use ledger::{Dict, StrHost};
    /// use std::sync::Arc;
    ///
    /// let cx = &mut StrHost::new();
    /// let dict = Dict::new();
    /// let guard = dict.guard();
    /// // StrHost's sequence protocol yields a string's characters
    /// dict.update_pairs(cx, [Arc::from("ab"), Arc::from("cd")])?;
    /// assert_eq!(dict.get(cx, &Arc::from("a"), &guard)?.map(|v| &**v), Some("b"));
    /// assert_eq!(dict.get(cx, &Arc::from("c"), &guard)?.map(|v| &**v), Some("d"));
    /// # Ok::<(), ledger::DictError>(())
    /// ```
    pub fn update_pairs<I>(&self, cx: &mut H, pairs: I) -> Result<(), H::Raised>
    where
        I: IntoIterator<Item = H::Obj>,
    {
        let guard = self.guard();
        for pair in pairs {
            let elements = cx.elements(&pair)?;
            if elements.len() != 2 {
                return Err(cx.raise(
                    ErrorKind::Value,
                    format!(
                        "dictionary update sequence element has length {}; 2 is required",
                        elements.len()
                    ),
                ));
            }
            self.insert(cx, &elements[0], elements[1].clone(), &guard)?;
        }
        Ok(())
    }

    /// Returns `true` if `self` and `other` hold equal keys mapping to equal
    /// values, under the host's equality.
    ///
    /// The two locks are never held at the same time, so two threads
    /// comparing in opposite directions cannot deadlock; instead, a
    /// modification that slips in between the snapshots raises a
    /// [`Runtime`](ErrorKind::Runtime) error.
    pub fn equals(&self, cx: &mut H, other: &Dict<H>) -> Result<bool, H::Raised> {
        if ptr::eq(self, other) {
            return Ok(true);
        }
        let guard = self.guard();
        let other_guard = other.guard();
        let (iter, self_version, self_len) = {
            let _serialized = self.lock.lock();
            let table = self.table.load(Ordering::Acquire, &guard);
            // safety: as in `len`
            let t = unsafe { table.deref() };
            (
                EntryIter::new(t, &guard),
                VersionGuard::new(self),
                t.used() as usize,
            )
        };
        let (other_version, other_len) = {
            let _serialized = other.lock.lock();
            (VersionGuard::new(other), other.len())
        };
        if self_len != other_len {
            return Ok(false);
        }
        let mut result = true;
        while result {
            match iter.next() {
                None => break,
                Some((key, value)) => match other.get(cx, key, &other_guard)? {
                    None => result = false,
                    Some(other_value) => result = cx.eq(value, other_value)?,
                },
            }
        }
        if !self_version.check() || !other_version.check() {
            return Err(cx.raise(
                ErrorKind::Runtime,
                "dictionary changed during iteration".to_owned(),
            ));
        }
        Ok(result)
    }

    /// Returns a new dictionary holding the same entries.
    pub fn copy(&self, cx: &mut H) -> Result<Dict<H>, H::Raised> {
        let copy = Dict::new();
        copy.update(cx, self)?;
        Ok(copy)
    }

    /// Renders the dictionary as `{key_repr: value_repr, ...}` in insertion
    /// order, or `{...}` when rendering re-enters a dictionary already being
    /// rendered (the host supplies the recursion guard).
    ///
    /// # Examples
    ///
    /// ```
    /// use ledger::{Dict, StrHost};
    /// use std::sync::Arc;
    ///
    /// let cx = &mut StrHost::new();
    /// let dict = Dict::new();
    /// let guard = dict.guard();
    /// dict.insert(cx, &Arc::from("a"), Arc::from("1"), &guard)?;
    /// dict.insert(cx, &Arc::from("b"), Arc::from("2"), &guard)?;
    /// assert_eq!(dict.repr(cx)?, "{'a': '1', 'b': '2'}");
    /// # Ok::<(), ledger::DictError>(())
    /// ```
    pub fn repr(&self, cx: &mut H) -> Result<String, H::Raised> {
        let identity = self as *const _ as usize;
        if cx.repr_enter(identity) {
            return Ok("{...}".to_owned());
        }
        let rendered = self.render(cx);
        cx.repr_leave(identity);
        rendered
    }

    fn render(&self, cx: &mut H) -> Result<String, H::Raised> {
        let guard = self.guard();
        // hold the lock so the rendering is a state the dictionary was
        // actually in
        let _serialized = self.lock.lock();
        let table = self.table.load(Ordering::Acquire, &guard);
        // safety: as in `len`
        let t = unsafe { table.deref() };
        let iter = EntryIter::new(t, &guard);
        let mut out = String::from("{");
        let mut first = true;
        while let Some((key, value)) = iter.next() {
            if !first {
                out.push_str(", ");
            }
            first = false;
            let key = cx.repr(key)?;
            out.push_str(&key);
            out.push_str(": ");
            let value = cx.repr(value)?;
            out.push_str(&value);
        }
        out.push('}');
        Ok(out)
    }

    /// The write path shared by `insert`, `remove`, and `set_default`.
    ///
    /// Under the lock, snapshots the table and version, performs the lookup
    /// (which may raise or re-enter through the host's callbacks), and then
    /// verifies that neither the version nor the published table pointer
    /// moved before acting. Passing `value: None` deletes; `overwrite:
    /// false` leaves a present value untouched. Returns the value the key
    /// mapped to before the call.
    fn put_item<'g>(
        &'g self,
        cx: &mut H,
        key: &H::Obj,
        value: Option<H::Obj>,
        overwrite: bool,
        guard: &'g Guard,
    ) -> Result<Option<&'g H::Obj>, H::Raised> {
        let hash = cx.hash(key)?;
        let _serialized = self.lock.lock();
        let table = self.table.load(Ordering::Acquire, guard);
        // safety: as in `len`
        let t = unsafe { table.deref() };
        let version = self.load_version();
        let (index, entry) = t.lookup(cx, hash, key, guard)?;
        if version != self.load_version()
            || self.table.load(Ordering::Acquire, guard).as_raw() != table.as_raw()
        {
            // a callback re-entered and mutated us; the lookup result may
            // point into a superseded table, so bail out instead of
            // recovering
            return Err(cx.raise(
                ErrorKind::Runtime,
                "dictionary changed during write".to_owned(),
            ));
        }

        let found = entry.and_then(|entry| {
            entry.load_value(guard).map(|_| entry)
        });
        let entry = match found {
            None => {
                // the key was never inserted, or its entry is a tombstone
                if let Some(value) = value {
                    if t.fill() == t.capacity() {
                        match t.grow(guard) {
                            Some(new_table) => {
                                new_table.insert_absent(Entry::new(hash, key.clone(), value));
                                // this store is the publication point for
                                // the privately-built table
                                let old = self.table.swap(
                                    Owned::new(new_table),
                                    Ordering::Release,
                                    guard,
                                );
                                // safety: readers may still hold the
                                // superseded table
                                unsafe { guard.defer_destroy(old) };
                            }
                            None => {
                                return Err(cx.raise(
                                    ErrorKind::Overflow,
                                    "result too large".to_owned(),
                                ));
                            }
                        }
                    } else {
                        t.write_new_entry(index, Entry::new(hash, key.clone(), value));
                    }
                    self.bump_version();
                }
                return Ok(None);
            }
            Some(entry) => entry,
        };

        let origin = entry.value.load(Ordering::Acquire, guard);
        if overwrite {
            let deleting = value.is_none();
            let old = t.write_value(entry, value, guard);
            // safety: the previous value was unlinked under the lock;
            // readers may still hold references to it
            unsafe { guard.defer_destroy(old) };
            self.bump_version();
            if deleting && t.used() < t.capacity() / 8 && t.fill() > t.capacity() / 8 * 5 {
                // rebuild to shed tombstones; the contents are unchanged, so
                // the version stays put
                match t.grow(guard) {
                    Some(new_table) => {
                        let old_table =
                            self.table.swap(Owned::new(new_table), Ordering::Release, guard);
                        // safety: as above
                        unsafe { guard.defer_destroy(old_table) };
                    }
                    None => unreachable!("compaction cannot exceed the maximum capacity"),
                }
            }
        }
        // safety: `origin` was loaded under our guard; if it was replaced
        // just now, its destruction is deferred past the guard
        Ok(Some(unsafe { origin.deref() }))
    }
}

impl<H> Default for Dict<H>
where
    H: Host,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<H> Debug for Dict<H>
where
    H: Host,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dict")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl<H> Drop for Dict<H>
where
    H: Host,
{
    fn drop(&mut self) {
        // safety: we have &mut self, so all references we have handed out
        // are gone and no reader can load the table any more
        let guard = unsafe { epoch::unprotected() };
        let table = self.table.swap(Shared::null(), Ordering::Relaxed, guard);
        // the table is always allocated
        drop(unsafe { table.into_owned() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StrHost;
    use std::sync::Arc;

    fn obj(s: &str) -> Arc<str> {
        Arc::from(s)
    }

    fn key(i: u32) -> Arc<str> {
        Arc::from(format!("key-{}", i))
    }

    #[test]
    fn minimum_capacity() {
        let dict: Dict<StrHost> = Dict::new();
        let guard = dict.guard();
        assert_eq!(dict.capacity(&guard), 4);
        let dict: Dict<StrHost> = Dict::with_capacity(7);
        let guard = dict.guard();
        assert_eq!(dict.capacity(&guard), 8);
    }

    #[test]
    fn insert_at_capacity_doubles() {
        let cx = &mut StrHost::new();
        let dict = Dict::with_capacity(4);
        let guard = dict.guard();
        for i in 0..4 {
            dict.insert(cx, &key(i), obj("v"), &guard).unwrap();
        }
        assert_eq!(dict.capacity(&guard), 4);
        dict.insert(cx, &key(4), obj("v"), &guard).unwrap();
        assert_eq!(dict.capacity(&guard), 8);
        for i in 0..5 {
            assert!(dict.get(cx, &key(i), &guard).unwrap().is_some());
        }
    }

    #[test]
    fn ninth_key_allocates_indices() {
        let cx = &mut StrHost::new();
        let dict = Dict::with_capacity(8);
        let guard = dict.guard();
        for i in 0..8 {
            dict.insert(cx, &key(i), obj("v"), &guard).unwrap();
        }
        // still the largest unindexed shape
        assert_eq!(dict.capacity(&guard), 8);
        dict.insert(cx, &key(8), obj("v"), &guard).unwrap();
        assert_eq!(dict.capacity(&guard), 16);
        for i in 0..9 {
            assert!(dict.get(cx, &key(i), &guard).unwrap().is_some());
        }
    }

    #[test]
    fn mass_deletion_compacts() {
        let cx = &mut StrHost::new();
        let dict = Dict::with_capacity(32);
        let guard = dict.guard();
        for i in 0..32 {
            dict.insert(cx, &key(i), obj("v"), &guard).unwrap();
        }
        for i in 0..28 {
            dict.remove(cx, &key(i), &guard).unwrap();
        }
        // used == 4, fill == 32: not yet below an eighth
        assert_eq!(dict.capacity(&guard), 32);

        let version = dict.load_version();
        dict.remove(cx, &key(28), &guard).unwrap();
        // used == 3 < 32/8 and fill == 32 > 5*32/8: compacted to eight slots,
        // and the rebuild itself did not bump the version
        assert_eq!(dict.capacity(&guard), 8);
        assert_eq!(dict.load_version(), version + 1);

        let keys: Vec<_> = dict.keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, ["key-29", "key-30", "key-31"]);
    }

    #[test]
    fn grow_after_deletions_compacts_tombstones() {
        let cx = &mut StrHost::new();
        let dict = Dict::with_capacity(8);
        let guard = dict.guard();
        for i in 0..8 {
            dict.insert(cx, &key(i), obj("v"), &guard).unwrap();
        }
        for i in 0..6 {
            dict.remove(cx, &key(i), &guard).unwrap();
        }
        // fill == capacity, so the next insert must resize; with two live
        // entries that is a compaction, not a doubling
        dict.insert(cx, &key(8), obj("v"), &guard).unwrap();
        assert_eq!(dict.capacity(&guard), 4);
        let keys: Vec<_> = dict.keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, ["key-6", "key-7", "key-8"]);
    }

    #[test]
    fn version_tracks_observable_changes() {
        let cx = &mut StrHost::new();
        let dict = Dict::new();
        let guard = dict.guard();
        let v0 = dict.load_version();

        dict.insert(cx, &obj("a"), obj("1"), &guard).unwrap();
        assert_eq!(dict.load_version(), v0 + 1);

        // overwriting counts, even with an identical value
        dict.insert(cx, &obj("a"), obj("1"), &guard).unwrap();
        assert_eq!(dict.load_version(), v0 + 2);

        dict.remove(cx, &obj("a"), &guard).unwrap();
        assert_eq!(dict.load_version(), v0 + 3);

        // deleting an absent key is not a change
        dict.remove(cx, &obj("a"), &guard).unwrap();
        assert_eq!(dict.load_version(), v0 + 3);

        dict.clear(&guard);
        assert_eq!(dict.load_version(), v0 + 4);
    }

    #[test]
    fn set_default_does_not_overwrite() {
        let cx = &mut StrHost::new();
        let dict = Dict::new();
        let guard = dict.guard();
        dict.insert(cx, &obj("k"), obj("v"), &guard).unwrap();
        let version = dict.load_version();
        let got = dict.set_default(cx, &obj("k"), obj("other"), &guard).unwrap();
        assert_eq!(&*got, "v");
        assert_eq!(dict.load_version(), version);
    }
}
