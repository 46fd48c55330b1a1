#![allow(dead_code)]

use ledger::{Dict, DictError, ErrorKind, Host};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A small dynamic value universe for exercising the dictionary the way a
/// real runtime would: ints and strings are hashable, lists and dictionaries
/// are not, and a value can be another dictionary (which is what makes the
/// repr recursion guard reachable).
#[derive(Clone, Debug)]
pub enum Val {
    Int(i64),
    Str(Arc<str>),
    List(Arc<Vec<Val>>),
    Dict(Arc<Dict<Runtime>>),
}

impl PartialEq for Val {
    fn eq(&self, other: &Val) -> bool {
        match (self, other) {
            (Val::Int(a), Val::Int(b)) => a == b,
            (Val::Str(a), Val::Str(b)) => a == b,
            (Val::List(a), Val::List(b)) => a == b,
            (Val::Dict(a), Val::Dict(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

pub fn int(n: i64) -> Val {
    Val::Int(n)
}

pub fn s(x: &str) -> Val {
    Val::Str(Arc::from(x))
}

pub fn list(items: Vec<Val>) -> Val {
    Val::List(Arc::new(items))
}

/// The test host. Fault-injection knobs let individual tests drive the
/// error paths: `fail_hash` makes every hash raise, and `insert_during_eq`
/// makes the next equality callback re-enter the given dictionary with an
/// insertion before comparing.
pub struct Runtime {
    repr_stack: Vec<usize>,
    pub fail_hash: bool,
    pub insert_during_eq: Option<(Arc<Dict<Runtime>>, Val, Val)>,
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            repr_stack: Vec::new(),
            fail_hash: false,
            insert_during_eq: None,
        }
    }
}

impl Host for Runtime {
    type Obj = Val;
    type Raised = DictError;

    fn hash(&mut self, obj: &Val) -> Result<u64, DictError> {
        if self.fail_hash {
            return Err(self.raise(ErrorKind::Type, "unhashable test object".to_owned()));
        }
        match obj {
            Val::Int(n) => Ok(*n as u64),
            Val::Str(x) => {
                let mut hasher = DefaultHasher::new();
                x.hash(&mut hasher);
                Ok(hasher.finish())
            }
            Val::List(_) => Err(self.raise(ErrorKind::Type, "unhashable type: 'list'".to_owned())),
            Val::Dict(_) => Err(self.raise(ErrorKind::Type, "unhashable type: 'dict'".to_owned())),
        }
    }

    fn eq(&mut self, a: &Val, b: &Val) -> Result<bool, DictError> {
        if let Some((dict, key, value)) = self.insert_during_eq.take() {
            dict.insert(self, &key, value, &dict.guard())?;
        }
        Ok(a == b)
    }

    fn repr(&mut self, obj: &Val) -> Result<String, DictError> {
        match obj {
            Val::Int(n) => Ok(n.to_string()),
            Val::Str(x) => Ok(format!("'{}'", x)),
            Val::List(items) => {
                let mut out = String::from("[");
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&self.repr(item)?);
                }
                out.push(']');
                Ok(out)
            }
            Val::Dict(dict) => dict.repr(self),
        }
    }

    fn elements(&mut self, obj: &Val) -> Result<Vec<Val>, DictError> {
        match obj {
            Val::List(items) => Ok(items.as_ref().clone()),
            Val::Str(x) => Ok(x
                .chars()
                .map(|c| Val::Str(Arc::from(c.to_string())))
                .collect()),
            _ => Err(self.raise(ErrorKind::Type, "object is not iterable".to_owned())),
        }
    }

    fn raise(&mut self, kind: ErrorKind, message: String) -> DictError {
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
