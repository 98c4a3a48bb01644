//! The typed value model carried through the graph.
//!
//! A [`Key`] is a typed, hashable, immutable value: the unit a Params bag
//! holds and part of every task node's identity. Payloads are arbitrary Rust
//! values behind [`Value`]; identity is `(TypeId, content digest)`, where the
//! digest is computed from the payload's canonical JSON bytes at
//! construction time. Two keys with equal payloads are therefore equal
//! wherever they were built, which is what memoization needs.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::Serialize;

use crate::digest::Digest;

/// A type tag for Products and Params.
///
/// Tags are compared by name, so the authoring layer picks one stable name
/// per type (e.g. `"Path"`, `"LineCount"`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub &'static str);

impl TypeId {
    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeId({})", self.0)
    }
}

/// An immutable, shareable payload.
#[derive(Clone)]
pub struct Value(Arc<dyn Any + Send + Sync>);

impl Value {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Value(Arc::new(value))
    }

    /// Downcast to a concrete payload type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value(..)")
    }
}

/// A typed, hashable, immutable Param value.
///
/// Equality and hashing ignore the payload and use `(type_id, digest)`: the
/// digest is the SHA-256 of the payload's canonical JSON, computed once in
/// [`Key::new`].
#[derive(Clone)]
pub struct Key {
    type_id: TypeId,
    digest: Digest,
    value: Value,
}

impl Key {
    /// Build a key from a serializable payload.
    ///
    /// Serialization here exists only to fingerprint the payload; the stored
    /// [`Value`] is the live Rust value, not the JSON.
    pub fn new<T>(type_id: TypeId, value: T) -> Result<Self, serde_json::Error>
    where
        T: Serialize + Any + Send + Sync,
    {
        let canonical = serde_json::to_vec(&value)?;
        Ok(Key {
            type_id,
            digest: Digest::of_bytes(&canonical),
            value: Value::new(value),
        })
    }

    /// Build a key from an already-fingerprinted payload.
    ///
    /// Used for payloads that are not `Serialize` (e.g. engine-internal
    /// values); the caller vouches that equal payloads yield equal digests.
    pub fn from_value(type_id: TypeId, value: Value, digest: Digest) -> Self {
        Key {
            type_id,
            digest,
            value,
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn digest(&self) -> Digest {
        self.digest
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Downcast the payload.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.digest == other.digest
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        self.digest.hash(state);
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({}, {})", self.type_id, self.digest)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_id)
    }
}

/// A bag of Params: at most one [`Key`] per [`TypeId`].
///
/// Bags compose by union as Get requests introduce new types deeper in the
/// graph; a node's identity uses only the subset its rule can consume (see
/// [`Params::retain_subset`]). BTreeMap keeps iteration, hashing and Display
/// deterministic.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Params(BTreeMap<TypeId, Key>);

impl Params {
    pub fn new() -> Self {
        Params::default()
    }

    /// Build a bag from keys; later keys of the same type replace earlier ones.
    pub fn from_keys(keys: impl IntoIterator<Item = Key>) -> Self {
        let mut params = Params::new();
        for key in keys {
            params.insert(key);
        }
        params
    }

    /// Insert a key, replacing any existing key of the same type.
    pub fn insert(&mut self, key: Key) {
        self.0.insert(key.type_id(), key);
    }

    pub fn get(&self, type_id: TypeId) -> Option<&Key> {
        self.0.get(&type_id)
    }

    pub fn contains(&self, type_id: TypeId) -> bool {
        self.0.contains_key(&type_id)
    }

    /// The set of types present in the bag.
    pub fn type_ids(&self) -> BTreeSet<TypeId> {
        self.0.keys().copied().collect()
    }

    /// Union of this bag with `extra`; keys in `extra` shadow ours.
    pub fn union(&self, extra: impl IntoIterator<Item = Key>) -> Params {
        let mut out = self.clone();
        for key in extra {
            out.insert(key);
        }
        out
    }

    /// The sub-bag containing only the given types.
    ///
    /// Node identity is computed over this subset so that irrelevant inherited
    /// params do not split the memo space.
    pub fn retain_subset(&self, types: &BTreeSet<TypeId>) -> Params {
        Params(
            self.0
                .iter()
                .filter(|(t, _)| types.contains(t))
                .map(|(t, k)| (*t, k.clone()))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.0.values()
    }
}

impl Hash for Params {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for key in self.0.values() {
            key.hash(state);
        }
    }
}

impl fmt::Debug for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Params(")?;
        let mut first = true;
        for key in self.0.values() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{:?}", key)?;
            first = false;
        }
        write!(f, ")")
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.keys().map(|t| t.name()).collect();
        write!(f, "Params({})", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATH: TypeId = TypeId("Path");
    const COUNT: TypeId = TypeId("Count");

    #[test]
    fn equal_payloads_make_equal_keys() {
        let a = Key::new(PATH, "src/main.rs".to_string()).unwrap();
        let b = Key::new(PATH, "src/main.rs".to_string()).unwrap();
        assert_eq!(a, b);

        let c = Key::new(PATH, "src/lib.rs".to_string()).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn same_payload_different_type_differs() {
        let a = Key::new(PATH, 42u64).unwrap();
        let b = Key::new(COUNT, 42u64).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn key_downcast() {
        let key = Key::new(COUNT, 7u64).unwrap();
        assert_eq!(key.downcast_ref::<u64>(), Some(&7));
        assert!(key.downcast_ref::<String>().is_none());
    }

    #[test]
    fn params_hold_one_key_per_type() {
        let mut params = Params::new();
        params.insert(Key::new(PATH, "a".to_string()).unwrap());
        params.insert(Key::new(PATH, "b".to_string()).unwrap());
        assert_eq!(params.len(), 1);
        assert_eq!(
            params.get(PATH).unwrap().downcast_ref::<String>(),
            Some(&"b".to_string())
        );
    }

    #[test]
    fn retain_subset_prunes_irrelevant_types() {
        let params = Params::from_keys([
            Key::new(PATH, "a".to_string()).unwrap(),
            Key::new(COUNT, 1u64).unwrap(),
        ]);
        let subset = params.retain_subset(&[PATH].into_iter().collect());
        assert_eq!(subset.len(), 1);
        assert!(subset.contains(PATH));
        assert!(!subset.contains(COUNT));
    }

    #[test]
    fn union_shadows_existing_types() {
        let base = Params::from_keys([Key::new(COUNT, 1u64).unwrap()]);
        let merged = base.union([Key::new(COUNT, 2u64).unwrap()]);
        assert_eq!(merged.get(COUNT).unwrap().downcast_ref::<u64>(), Some(&2));
        // The original bag is untouched.
        assert_eq!(base.get(COUNT).unwrap().downcast_ref::<u64>(), Some(&1));
    }
}
