//! A persistent, immutable hash array-mapped trie.
//!
//! Every published node is frozen: once reachable from a root, it is never mutated.
//! `set`/`delete` path-copy from the root to the changed leaf and share every untouched
//! subtree with the map they were called on, so a [`PersistentMap`] handle can be read
//! from any number of heaps while a writer produces new versions, with no locking on the
//! read path beyond the atomic load of the current root (see [`crate::hive`]).

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

const BITS_PER_LEVEL: u32 = 5;
const LEVEL_MASK: u32 = (1 << BITS_PER_LEVEL) - 1;
const ARRAY_PROMOTE_AT: usize = 16;
const ARRAY_DEMOTE_AT: usize = 8;

enum Child<K, V> {
    Leaf(Arc<(K, V)>),
    Node(Arc<Node<K, V>>),
}

impl<K, V> Clone for Child<K, V> {
    fn clone(&self) -> Self {
        match self {
            Child::Leaf(e) => Child::Leaf(Arc::clone(e)),
            Child::Node(n) => Child::Node(Arc::clone(n)),
        }
    }
}

enum Node<K, V> {
    Bitmap {
        bitmap: u32,
        children: Box<[Child<K, V>]>,
    },
    Array {
        children: Box<[Option<Child<K, V>>; 32]>,
    },
    Collision {
        hash: u32,
        entries: Vec<Arc<(K, V)>>,
    },
}

fn bucket(hash: u32, shift: u32) -> u32 {
    (hash >> shift) & LEVEL_MASK
}

fn fold_hash<K: Hash + ?Sized, S: BuildHasher>(hasher: &S, key: &K) -> u32 {
    let mut h = hasher.build_hasher();
    key.hash(&mut h);
    let full = h.finish();
    ((full >> 32) as u32) ^ (full as u32)
}

fn single_leaf<K, V>(hash: u32, shift: u32, key: K, value: V) -> Node<K, V> {
    let bit = 1u32 << bucket(hash, shift);
    Node::Bitmap {
        bitmap: bit,
        children: vec![Child::Leaf(Arc::new((key, value)))].into_boxed_slice(),
    }
}

fn promote<K, V>(bitmap: u32, children: Vec<Child<K, V>>) -> Node<K, V> {
    let mut array: Box<[Option<Child<K, V>>; 32]> = Box::new(std::array::from_fn(|_| None));
    let mut iter = children.into_iter();
    for bit_index in 0..32u32 {
        if bitmap & (1 << bit_index) != 0 {
            array[bit_index as usize] = iter.next();
        }
    }
    Node::Array { children: array }
}

fn demote<K, V>(children: &mut [Option<Child<K, V>>; 32]) -> Node<K, V> {
    let mut bitmap = 0u32;
    let mut out = Vec::with_capacity(ARRAY_DEMOTE_AT);
    for (i, slot) in children.iter_mut().enumerate() {
        if let Some(child) = slot.take() {
            bitmap |= 1 << i;
            out.push(child);
        }
    }
    Node::Bitmap {
        bitmap,
        children: out.into_boxed_slice(),
    }
}

/// Inserts `key`/`value`, returning the new root and whether the key was previously absent.
fn insert_rec<K, V, S>(
    node: Option<&Arc<Node<K, V>>>,
    hasher: &S,
    hash: u32,
    shift: u32,
    key: K,
    value: V,
) -> (Arc<Node<K, V>>, bool)
where
    K: Hash + Eq,
    S: BuildHasher,
{
    let Some(node) = node else {
        return (Arc::new(single_leaf(hash, shift, key, value)), true);
    };

    match &**node {
        Node::Bitmap { bitmap, children } => {
            let bit = 1u32 << bucket(hash, shift);
            let pos = (bitmap & (bit - 1)).count_ones() as usize;

            if bitmap & bit == 0 {
                let mut new_children = Vec::with_capacity(children.len() + 1);
                new_children.extend_from_slice(&children[..pos]);
                new_children.push(Child::Leaf(Arc::new((key, value))));
                new_children.extend_from_slice(&children[pos..]);
                let new_bitmap = bitmap | bit;

                let new_node = if new_children.len() > ARRAY_PROMOTE_AT {
                    promote(new_bitmap, new_children)
                } else {
                    Node::Bitmap {
                        bitmap: new_bitmap,
                        children: new_children.into_boxed_slice(),
                    }
                };
                (Arc::new(new_node), true)
            } else {
                let (new_child, inserted) =
                    insert_into_child(&children[pos], hasher, hash, shift, key, value);
                let mut new_children = children.clone().into_vec();
                new_children[pos] = new_child;
                (
                    Arc::new(Node::Bitmap {
                        bitmap: *bitmap,
                        children: new_children.into_boxed_slice(),
                    }),
                    inserted,
                )
            }
        }
        Node::Array { children } => {
            let idx = bucket(hash, shift) as usize;
            let mut new_children = children.clone();
            let inserted = match &children[idx] {
                None => {
                    new_children[idx] = Some(Child::Leaf(Arc::new((key, value))));
                    true
                }
                Some(existing) => {
                    let (new_child, inserted) =
                        insert_into_child(existing, hasher, hash, shift, key, value);
                    new_children[idx] = Some(new_child);
                    inserted
                }
            };
            (Arc::new(Node::Array { children: new_children }), inserted)
        }
        Node::Collision { hash: node_hash, entries } => {
            debug_assert_eq!(*node_hash, hash);
            let mut new_entries = entries.clone();
            let inserted = match new_entries.iter().position(|e| e.0 == key) {
                Some(i) => {
                    new_entries[i] = Arc::new((key, value));
                    false
                }
                None => {
                    new_entries.push(Arc::new((key, value)));
                    true
                }
            };
            (
                Arc::new(Node::Collision {
                    hash: *node_hash,
                    entries: new_entries,
                }),
                inserted,
            )
        }
    }
}

fn insert_into_child<K, V, S>(
    child: &Child<K, V>,
    hasher: &S,
    hash: u32,
    shift: u32,
    key: K,
    value: V,
) -> (Child<K, V>, bool)
where
    K: Hash + Eq,
    S: BuildHasher,
{
    match child {
        Child::Node(sub) => {
            let (new_sub, inserted) = insert_rec(Some(sub), hasher, hash, shift + BITS_PER_LEVEL, key, value);
            (Child::Node(new_sub), inserted)
        }
        Child::Leaf(entry) => {
            if entry.0 == key {
                (Child::Leaf(Arc::new((key, value))), false)
            } else if shift + BITS_PER_LEVEL >= 32 {
                let other_hash = fold_hash(hasher, &entry.0);
                debug_assert_eq!(other_hash, hash, "32-bit hash collision expected at max depth");
                let entries = vec![Arc::clone(entry), Arc::new((key, value))];
                (Child::Node(Arc::new(Node::Collision { hash, entries })), true)
            } else {
                let other_hash = fold_hash(hasher, &entry.0);
                let (new_sub, _) =
                    split_leaf(entry, other_hash, hasher, hash, shift + BITS_PER_LEVEL, key, value);
                (Child::Node(new_sub), true)
            }
        }
    }
}

/// Builds the subtree one level deeper that houses both the pre-existing leaf (whose hash
/// is `other_hash`) and the newly inserted key, recursing further if they still collide.
fn split_leaf<K, V, S>(
    existing: &Arc<(K, V)>,
    other_hash: u32,
    hasher: &S,
    hash: u32,
    shift: u32,
    key: K,
    value: V,
) -> (Arc<Node<K, V>>, bool)
where
    K: Hash + Eq,
    S: BuildHasher,
{
    let bit = 1u32 << bucket(other_hash, shift);
    let seed = Arc::new(Node::Bitmap {
        bitmap: bit,
        children: vec![Child::Leaf(Arc::clone(existing))].into_boxed_slice(),
    });
    insert_rec(Some(&seed), hasher, hash, shift, key, value)
}

fn get_rec<'a, K, V>(node: Option<&'a Arc<Node<K, V>>>, hash: u32, shift: u32, key: &K) -> Option<&'a V>
where
    K: Eq,
{
    let node = node?;
    match &**node {
        Node::Bitmap { bitmap, children } => {
            let bit = 1u32 << bucket(hash, shift);
            if bitmap & bit == 0 {
                return None;
            }
            let pos = (bitmap & (bit - 1)).count_ones() as usize;
            match &children[pos] {
                Child::Leaf(entry) => (entry.0 == *key).then_some(&entry.1),
                Child::Node(sub) => get_rec(Some(sub), hash, shift + BITS_PER_LEVEL, key),
            }
        }
        Node::Array { children } => match &children[bucket(hash, shift) as usize] {
            None => None,
            Some(Child::Leaf(entry)) => (entry.0 == *key).then_some(&entry.1),
            Some(Child::Node(sub)) => get_rec(Some(sub), hash, shift + BITS_PER_LEVEL, key),
        },
        Node::Collision { entries, .. } => entries.iter().find(|e| e.0 == *key).map(|e| &e.1),
    }
}

enum DeleteOutcome<K, V> {
    Unchanged,
    Pruned,
    Replaced(Arc<Node<K, V>>),
}

fn delete_rec<K, V>(node: Option<&Arc<Node<K, V>>>, hash: u32, shift: u32, key: &K) -> DeleteOutcome<K, V>
where
    K: Eq,
{
    let Some(node) = node else {
        return DeleteOutcome::Unchanged;
    };

    match &**node {
        Node::Bitmap { bitmap, children } => {
            let bit = 1u32 << bucket(hash, shift);
            if bitmap & bit == 0 {
                return DeleteOutcome::Unchanged;
            }
            let pos = (bitmap & (bit - 1)).count_ones() as usize;
            match &children[pos] {
                Child::Leaf(entry) => {
                    if entry.0 != *key {
                        return DeleteOutcome::Unchanged;
                    }
                    if children.len() == 1 {
                        return DeleteOutcome::Pruned;
                    }
                    let mut new_children = children.to_vec();
                    new_children.remove(pos);
                    DeleteOutcome::Replaced(Arc::new(Node::Bitmap {
                        bitmap: bitmap & !bit,
                        children: new_children.into_boxed_slice(),
                    }))
                }
                Child::Node(sub) => {
                    match delete_rec(Some(sub), hash, shift + BITS_PER_LEVEL, key) {
                        DeleteOutcome::Unchanged => DeleteOutcome::Unchanged,
                        DeleteOutcome::Pruned => {
                            if children.len() == 1 {
                                DeleteOutcome::Pruned
                            } else {
                                let mut new_children = children.to_vec();
                                new_children.remove(pos);
                                DeleteOutcome::Replaced(Arc::new(Node::Bitmap {
                                    bitmap: bitmap & !bit,
                                    children: new_children.into_boxed_slice(),
                                }))
                            }
                        }
                        DeleteOutcome::Replaced(new_sub) => {
                            let mut new_children = children.to_vec();
                            new_children[pos] = Child::Node(new_sub);
                            DeleteOutcome::Replaced(Arc::new(Node::Bitmap {
                                bitmap: *bitmap,
                                children: new_children.into_boxed_slice(),
                            }))
                        }
                    }
                }
            }
        }
        Node::Array { children } => {
            let idx = bucket(hash, shift) as usize;
            let outcome = match &children[idx] {
                None => return DeleteOutcome::Unchanged,
                Some(Child::Leaf(entry)) => {
                    if entry.0 != *key {
                        return DeleteOutcome::Unchanged;
                    }
                    None
                }
                Some(Child::Node(sub)) => {
                    match delete_rec(Some(sub), hash, shift + BITS_PER_LEVEL, key) {
                        DeleteOutcome::Unchanged => return DeleteOutcome::Unchanged,
                        DeleteOutcome::Pruned => None,
                        DeleteOutcome::Replaced(new_sub) => Some(Child::Node(new_sub)),
                    }
                }
            };
            let mut new_children = children.clone();
            new_children[idx] = outcome;
            let population = new_children.iter().filter(|c| c.is_some()).count();
            if population < ARRAY_DEMOTE_AT {
                DeleteOutcome::Replaced(Arc::new(demote(&mut new_children)))
            } else {
                DeleteOutcome::Replaced(Arc::new(Node::Array { children: new_children }))
            }
        }
        Node::Collision { hash: node_hash, entries } => {
            match entries.iter().position(|e| e.0 == *key) {
                None => DeleteOutcome::Unchanged,
                Some(i) => {
                    if entries.len() == 1 {
                        DeleteOutcome::Pruned
                    } else {
                        let mut new_entries = entries.clone();
                        new_entries.remove(i);
                        if new_entries.len() == 1 {
                            // A lone survivor becomes an ordinary leaf so it can live
                            // directly in a bitmap slot again.
                            let only = Arc::clone(&new_entries[0]);
                            DeleteOutcome::Replaced(Arc::new(Node::Bitmap {
                                bitmap: 1,
                                children: vec![Child::Leaf(only)].into_boxed_slice(),
                            }))
                        } else {
                            DeleteOutcome::Replaced(Arc::new(Node::Collision {
                                hash: *node_hash,
                                entries: new_entries,
                            }))
                        }
                    }
                }
            }
        }
    }
}

fn walk<'a, K, V>(node: &'a Node<K, V>, out: &mut Vec<(&'a K, &'a V)>) {
    match node {
        Node::Bitmap { children, .. } => {
            for child in children.iter() {
                walk_child(child, out);
            }
        }
        Node::Array { children } => {
            for child in children.iter().flatten() {
                walk_child(child, out);
            }
        }
        Node::Collision { entries, .. } => {
            out.extend(entries.iter().map(|e| (&e.0, &e.1)));
        }
    }
}

fn walk_child<'a, K, V>(child: &'a Child<K, V>, out: &mut Vec<(&'a K, &'a V)>) {
    match child {
        Child::Leaf(entry) => out.push((&entry.0, &entry.1)),
        Child::Node(sub) => walk(sub, out),
    }
}

/// A handle into a persistent, structurally-shared HAMT.
///
/// Cloning a `PersistentMap` is cheap (an `Arc` bump): every clone shares the same
/// immutable tree. `set`/`delete` never mutate `self`; they return a new handle whose
/// tree shares every node `self` did not touch.
pub struct PersistentMap<K, V, S = RandomState> {
    hasher: Arc<S>,
    root: Option<Arc<Node<K, V>>>,
    len: usize,
}

impl<K, V, S> Clone for PersistentMap<K, V, S> {
    fn clone(&self) -> Self {
        Self {
            hasher: Arc::clone(&self.hasher),
            root: self.root.clone(),
            len: self.len,
        }
    }
}

impl<K, V> PersistentMap<K, V, RandomState> {
    /// Creates an empty map with the default process hasher.
    pub fn new() -> Self {
        Self::with_hasher(RandomState::default())
    }
}

impl<K, V> Default for PersistentMap<K, V, RandomState> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> PersistentMap<K, V, S> {
    /// Creates an empty map using the given hasher builder.
    ///
    /// All maps derived from this one via `set`/`delete` share this same hasher
    /// instance, which is what keeps hash folding consistent across every version of
    /// the tree.
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            hasher: Arc::new(hasher),
            root: None,
            len: 0,
        }
    }

    /// Number of bindings currently in the map.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the map holds no bindings.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

}

impl<K, V, S> PersistentMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Looks up `key`, returning a clone of its value if present.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let hash = fold_hash(&*self.hasher, key);
        get_rec(self.root.as_ref(), hash, 0, key).cloned()
    }

    /// True if `key` is bound in this map.
    pub fn contains_key(&self, key: &K) -> bool {
        let hash = fold_hash(&*self.hasher, key);
        get_rec(self.root.as_ref(), hash, 0, key).is_some()
    }

    /// Returns a new map with `key` bound to `value`. `self` is left unmodified and keeps
    /// every node of its tree alive for as long as any other handle still references it.
    pub fn set(&self, key: K, value: V) -> Self {
        let hash = fold_hash(&*self.hasher, &key);
        let (new_root, inserted) = insert_rec(self.root.as_ref(), &*self.hasher, hash, 0, key, value);
        Self {
            hasher: Arc::clone(&self.hasher),
            root: Some(new_root),
            len: self.len + inserted as usize,
        }
    }

    /// Returns a new map with `key` removed, or `None` if `key` was not bound.
    pub fn delete(&self, key: &K) -> Option<Self> {
        let hash = fold_hash(&*self.hasher, key);
        match delete_rec(self.root.as_ref(), hash, 0, key) {
            DeleteOutcome::Unchanged => None,
            DeleteOutcome::Pruned => Some(Self {
                hasher: Arc::clone(&self.hasher),
                root: None,
                len: self.len - 1,
            }),
            DeleteOutcome::Replaced(new_root) => Some(Self {
                hasher: Arc::clone(&self.hasher),
                root: Some(new_root),
                len: self.len - 1,
            }),
        }
    }

    /// Iterates over every binding. Traversal order reflects trie layout, not insertion
    /// order, and is only stable for a fixed map value; callers that need a deterministic
    /// order must sort the result themselves.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        let mut out = Vec::with_capacity(self.len);
        if let Some(root) = &self.root {
            walk(root, &mut out);
        }
        out.into_iter()
    }
}

impl<K, V, S> PartialEq for PersistentMap<K, V, S>
where
    K: Hash + Eq,
    V: PartialEq,
    S: BuildHasher,
{
    fn eq(&self, other: &Self) -> bool {
        if self.len != other.len {
            return false;
        }
        match (&self.root, &other.root) {
            (None, None) => true,
            (Some(a), Some(b)) if Arc::ptr_eq(a, b) => true,
            _ => {
                let mut a: Vec<_> = self.iter().collect();
                let mut b: Vec<_> = other.iter().collect();
                // Values aren't required to be Ord, so compare as unordered multisets by
                // checking mutual containment instead of sorting.
                a.retain(|(k, v)| {
                    if let Some(pos) = b.iter().position(|(k2, v2)| k2 == k && v2 == v) {
                        b.remove(pos);
                        false
                    } else {
                        true
                    }
                });
                a.is_empty() && b.is_empty()
            }
        }
    }
}

impl<K, V, S> Eq for PersistentMap<K, V, S>
where
    K: Hash + Eq,
    V: PartialEq + Eq,
    S: BuildHasher,
{
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_set_roundtrip() {
        let m = PersistentMap::<String, i64>::new();
        let m = m.set("a".to_owned(), 1);
        let m = m.set("b".to_owned(), 2);
        assert_eq!(m.get(&"a".to_owned()), Some(1));
        assert_eq!(m.get(&"b".to_owned()), Some(2));
        assert_eq!(m.get(&"c".to_owned()), None);
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn set_is_pure_and_shares_structure() {
        let m0 = PersistentMap::<i64, i64>::new();
        let m1 = m0.set(1, 1);
        let m2 = m1.set(1, 2);
        assert_eq!(m1.get(&1), Some(1));
        assert_eq!(m2.get(&1), Some(2));
        assert_eq!(m0.len(), 0);
    }

    #[test]
    fn delete_restores_prior_map() {
        let m0 = PersistentMap::<i64, i64>::new();
        let m1 = m0.set(1, 10);
        let m2 = m1.set(1, 10).delete(&1).unwrap();
        assert_eq!(m2.len(), m0.len());
        assert_eq!(m2.get(&1), None);
    }

    #[test]
    fn many_keys_survive_promotion_and_demotion() {
        let mut m = PersistentMap::<i64, i64>::new();
        for i in 0..2000 {
            m = m.set(i, i * 2);
        }
        for i in 0..2000 {
            assert_eq!(m.get(&i), Some(i * 2));
        }
        for i in 0..1000 {
            m = m.delete(&i).unwrap();
        }
        for i in 0..1000 {
            assert_eq!(m.get(&i), None);
        }
        for i in 1000..2000 {
            assert_eq!(m.get(&i), Some(i * 2));
        }
    }

    struct ColliderHasher;

    impl std::hash::Hasher for ColliderHasher {
        fn finish(&self) -> u64 {
            0
        }
        fn write(&mut self, _bytes: &[u8]) {}
    }

    #[derive(Clone)]
    struct ColliderBuild;

    impl BuildHasher for ColliderBuild {
        type Hasher = ColliderHasher;
        fn build_hasher(&self) -> ColliderHasher {
            ColliderHasher
        }
    }

    #[test]
    fn hash_collisions_keep_both_keys() {
        let m = PersistentMap::<i64, i64, ColliderBuild>::with_hasher(ColliderBuild);
        let m = m.set(1, 10);
        let m = m.set(2, 20);
        assert_eq!(m.get(&1), Some(10));
        assert_eq!(m.get(&2), Some(20));
        assert_eq!(m.len(), 2);
    }
}
