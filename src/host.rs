use std::collections::hash_map::DefaultHasher;
use std::error::Error;
use std::fmt::{self, Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// The object model a [`Dict`](crate::Dict) is parameterized over.
///
/// A dictionary stores opaque object references and delegates hashing,
/// equality, and textual rendering to its host runtime. All three are
/// fallible (a dynamic language can raise from `__hash__` or `__eq__`), and
/// all three may *re-enter* any dictionary, including the one that invoked
/// them. The dictionary is built to survive that: see the notes on the write
/// path in the crate-level documentation.
///
/// The `cx` value threaded through the dictionary API is an instance of this
/// trait. It stands in for whatever per-thread interpreter state (a frame, a
/// call context) the host runtime carries; the dictionary only ever passes it
/// through to these callbacks.
pub trait Host {
    /// An object reference.
    ///
    /// `Obj` is expected to behave like a handle: `Clone` duplicates the
    /// reference, not the referent. The dictionary clones keys on insertion
    /// and values on snapshot reads.
    type Obj: Clone + Send + Sync + 'static;

    /// An in-flight raised error.
    type Raised;

    /// Hashes an object.
    ///
    /// Must be consistent with [`eq`](Host::eq): objects that compare equal
    /// must hash equal.
    fn hash(&mut self, obj: &Self::Obj) -> Result<u64, Self::Raised>;

    /// Compares two objects for user-level equality.
    fn eq(&mut self, a: &Self::Obj, b: &Self::Obj) -> Result<bool, Self::Raised>;

    /// Renders an object for display.
    fn repr(&mut self, obj: &Self::Obj) -> Result<String, Self::Raised>;

    /// Decomposes an object into its elements via the host's sequence
    /// protocol. Used by [`Dict::update_pairs`](crate::Dict::update_pairs) to
    /// take key/value pairs apart.
    fn elements(&mut self, obj: &Self::Obj) -> Result<Vec<Self::Obj>, Self::Raised>;

    /// Constructs a raised error of the given kind.
    fn raise(&mut self, kind: ErrorKind, message: String) -> Self::Raised;

    /// Marks `dict` (identified by address) as currently being rendered.
    ///
    /// Returns `true` if it already was; the caller should then emit the
    /// placeholder form instead of recursing.
    fn repr_enter(&mut self, dict: usize) -> bool;

    /// Clears the mark set by [`repr_enter`](Host::repr_enter).
    fn repr_leave(&mut self, dict: usize);
}

/// The kinds of errors a dictionary raises through [`Host::raise`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A key that was required to be present is absent, or the dictionary is
    /// empty where an entry was required.
    Key,
    /// An object does not support a required protocol.
    Type,
    /// A well-typed object has an unusable value, such as an update pair
    /// whose length is not 2.
    Value,
    /// The dictionary was concurrently modified mid-operation.
    Runtime,
    /// The table cannot grow any further.
    Overflow,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Key => "KeyError",
            ErrorKind::Type => "TypeError",
            ErrorKind::Value => "ValueError",
            ErrorKind::Runtime => "RuntimeError",
            ErrorKind::Overflow => "OverflowError",
        })
    }
}

/// A ready-made `(kind, message)` error.
///
/// Hosts are free to use any error type as [`Host::Raised`]; this one is
/// provided for hosts that do not carry their own exception machinery. The
/// bundled [`StrHost`] raises it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DictError {
    /// Which kind of failure this is.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl Display for DictError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl Error for DictError {}

/// A minimal host whose objects are reference-counted strings.
///
/// Useful for examples, tests, and as a template for real hosts. Hashing uses
/// the standard library's [`DefaultHasher`], equality is string equality, and
/// the sequence protocol yields a string's characters (so a two-character
/// string works as an update pair).
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
/// assert_eq!(dict.get(cx, &Arc::from("color"), &guard)?.map(|v| &**v), Some("teal"));
/// # Ok::<(), ledger::DictError>(())
/// ```
pub struct StrHost {
    repr_stack: Vec<usize>,
}

impl StrHost {
    /// Creates a fresh host context.
    pub fn new() -> Self {
        Self {
            repr_stack: Vec::new(),
        }
    }
}

impl Default for StrHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for StrHost {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrHost").finish_non_exhaustive()
    }
}

impl Host for StrHost {
    type Obj = Arc<str>;
    type Raised = DictError;

    fn hash(&mut self, obj: &Self::Obj) -> Result<u64, Self::Raised> {
        let mut hasher = DefaultHasher::new();
        obj.hash(&mut hasher);
        Ok(hasher.finish())
    }

    fn eq(&mut self, a: &Self::Obj, b: &Self::Obj) -> Result<bool, Self::Raised> {
        Ok(a == b)
    }

    fn repr(&mut self, obj: &Self::Obj) -> Result<String, Self::Raised> {
        Ok(format!("'{}'", obj))
    }

    fn elements(&mut self, obj: &Self::Obj) -> Result<Vec<Self::Obj>, Self::Raised> {
        Ok(obj.chars().map(|c| Arc::from(c.to_string())).collect())
    }

    fn raise(&mut self, kind: ErrorKind, message: String) -> Self::Raised {
        DictError { kind, message }
    }

    fn repr_enter(&mut self, dict: usize) -> bool {
        if self.repr_stack.contains(&dict) {
            return true;
        }
        self.repr_stack.push(dict);
        false
    }

    fn repr_leave(&mut self, dict: usize) {
        if let Some(at) = self.repr_stack.iter().rposition(|&d| d == dict) {
            self.repr_stack.remove(at);
        }
    }
}
