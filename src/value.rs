use crate::hamt::PersistentMap;
use std::fmt::{self, Debug, Formatter};

/// A value that can cross a heap boundary: queues, the shared map, and broadcasts all
/// traffic in this type rather than in arbitrary user types.
///
/// `Map` and `Foreign` are the only variants shared by handle; every other variant is
/// copied on each hop. This mirrors the source system's distinction between values that
/// live in one heap's object graph and values that are safe to duplicate freely.
#[derive(Clone)]
pub enum Value {
    /// the unit value
    Null,
    /// a boolean
    Bool(bool),
    /// a 64-bit signed integer
    Int64(i64),
    /// a 64-bit float
    Float64(f64),
    /// an owned byte string
    Bytes(Vec<u8>),
    /// an owned UTF-8 string
    Str(String),
    /// a fixed-size heterogeneous tuple
    Tuple(Vec<Value>),
    /// a handle into the shared persistent map
    Map(PersistentMap<Value, Value>),
    /// an opaque handle to a foreign-heap object, tracked by the ref queue
    Foreign(ForeignHandle),
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int64(i) => write!(f, "Int64({i})"),
            Value::Float64(x) => write!(f, "Float64({x})"),
            Value::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::Tuple(t) => f.debug_tuple("Tuple").field(t).finish(),
            Value::Map(m) => write!(f, "Map(len={})", m.len()),
            Value::Foreign(h) => write!(f, "Foreign({:?})", h.id),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Float64(a), Value::Float64(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Foreign(a), Value::Foreign(b)) => a.id == b.id,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int64(i) => i.hash(state),
            Value::Float64(x) => x.to_bits().hash(state),
            Value::Bytes(b) => b.hash(state),
            Value::Str(s) => s.hash(state),
            Value::Tuple(t) => t.hash(state),
            // `PartialEq` on `Map` compares bindings as an unordered multiset (two maps
            // built through different `set`/`delete` lineages are equal if they hold the
            // same keys and values), so the hash has to fold entries order-independently
            // too, or equal maps could hash unequal.
            Value::Map(m) => {
                let mut acc: u64 = 0;
                for (k, v) in m.iter() {
                    let mut entry_hasher = std::collections::hash_map::DefaultHasher::new();
                    k.hash(&mut entry_hasher);
                    v.hash(&mut entry_hasher);
                    acc ^= entry_hasher.finish();
                }
                acc.hash(state);
            }
            Value::Foreign(h) => h.id.hash(state),
        }
    }
}

/// An opaque reference to an object allocated in a foreign heap, opened and closed
/// through [`RefQueue`](crate::refqueue::RefQueue) rather than copied.
#[derive(Clone, Debug)]
pub struct ForeignHandle {
    pub(crate) id: u64,
    pub(crate) owner: crate::refqueue::HeapId,
}

static NEXT_FOREIGN_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

impl ForeignHandle {
    /// Mints a fresh handle to an object that lives on `owner`'s heap. Every call
    /// produces a distinct id, process-wide.
    pub fn new(owner: crate::refqueue::HeapId) -> Self {
        let id = NEXT_FOREIGN_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Self { id, owner }
    }

    /// The id this handle's owning heap uses to track it in its [`RefQueue`](crate::refqueue::RefQueue).
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The heap this handle's referent was allocated on.
    pub fn owner(&self) -> crate::refqueue::HeapId {
        self.owner
    }
}

impl Value {
    /// Collects every [`ForeignHandle`] reachable from this value, recursing into
    /// tuples and map bindings. Used at queue/broadcast boundaries to post the
    /// matching ref-count deltas to each handle's owning heap.
    pub(crate) fn foreign_refs(&self) -> Vec<ForeignHandle> {
        let mut out = Vec::new();
        self.collect_foreign_refs(&mut out);
        out
    }

    fn collect_foreign_refs(&self, out: &mut Vec<ForeignHandle>) {
        match self {
            Value::Foreign(h) => out.push(h.clone()),
            Value::Tuple(items) => {
                for item in items {
                    item.collect_foreign_refs(out);
                }
            }
            Value::Map(m) => {
                for (k, v) in m.iter() {
                    k.collect_foreign_refs(out);
                    v.collect_foreign_refs(out);
                }
            }
            Value::Null
            | Value::Bool(_)
            | Value::Int64(_)
            | Value::Float64(_)
            | Value::Bytes(_)
            | Value::Str(_) => {}
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int64(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}
