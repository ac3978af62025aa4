//! Key-to-OID index interface.
//!
//! The transactional core consumes a deliberately narrow surface: reserve a
//! key if absent, look a key up, and withdraw a failed reservation. The
//! full ordered structure behind it is an external collaborator; the two
//! in-crate implementations cover the ordered and hashed variants.

use crate::store::Oid;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

pub trait KeyIndex: Send + Sync {
    /// Bind `key` to `oid` unless the key is already present. Returns false
    /// (and changes nothing) when the key was taken.
    fn insert_if_absent(&self, key: &[u8], oid: Oid) -> bool;

    /// Look up the OID bound to `key`.
    fn search(&self, key: &[u8]) -> Option<Oid>;

    /// Withdraw a binding (failed insert cleanup). Only removes the entry
    /// if it still maps to `oid`.
    fn remove(&self, key: &[u8], oid: Oid);

    /// All bindings, for the checkpointer.
    fn entries(&self) -> Vec<(Vec<u8>, Oid)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ordered variant backed by a B-tree map.
#[derive(Default)]
pub struct OrderedIndex {
    map: RwLock<BTreeMap<Vec<u8>, Oid>>,
}

impl OrderedIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyIndex for OrderedIndex {
    fn insert_if_absent(&self, key: &[u8], oid: Oid) -> bool {
        let mut map = self.map.write();
        if map.contains_key(key) {
            return false;
        }
        map.insert(key.to_vec(), oid);
        true
    }

    fn search(&self, key: &[u8]) -> Option<Oid> {
        self.map.read().get(key).copied()
    }

    fn remove(&self, key: &[u8], oid: Oid) {
        let mut map = self.map.write();
        if map.get(key) == Some(&oid) {
            map.remove(key);
        }
    }

    fn entries(&self) -> Vec<(Vec<u8>, Oid)> {
        self.map
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    fn len(&self) -> usize {
        self.map.read().len()
    }
}

/// Hashed variant for point-lookup-only workloads.
#[derive(Default)]
pub struct HashedIndex {
    map: RwLock<HashMap<Vec<u8>, Oid>>,
}

impl HashedIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyIndex for HashedIndex {
    fn insert_if_absent(&self, key: &[u8], oid: Oid) -> bool {
        let mut map = self.map.write();
        if map.contains_key(key) {
            return false;
        }
        map.insert(key.to_vec(), oid);
        true
    }

    fn search(&self, key: &[u8]) -> Option<Oid> {
        self.map.read().get(key).copied()
    }

    fn remove(&self, key: &[u8], oid: Oid) {
        let mut map = self.map.write();
        if map.get(key) == Some(&oid) {
            map.remove(key);
        }
    }

    fn entries(&self) -> Vec<(Vec<u8>, Oid)> {
        self.map
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    fn len(&self) -> usize {
        self.map.read().len()
    }
}
