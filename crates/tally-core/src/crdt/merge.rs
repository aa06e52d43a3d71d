//! The semilattice merge trait.
//!
//! Implementors must satisfy the semilattice laws — commutative,
//! associative, idempotent — so that replicas converge regardless of the
//! order deltas arrive in.

use std::collections::BTreeMap;

/// Join another replica's state into this one.
pub trait Merge {
    /// Merge `other` into `self`.
    fn merge(&mut self, other: Self);
}

/// Keyed merge: union of keys, per-value join on collisions.
impl<K: Ord, V: Merge> Merge for BTreeMap<K, V> {
    fn merge(&mut self, other: Self) {
        for (key, value) in other {
            match self.entry(key) {
                std::collections::btree_map::Entry::Occupied(mut existing) => {
                    existing.get_mut().merge(value);
                }
                std::collections::btree_map::Entry::Vacant(slot) => {
                    slot.insert(value);
                }
            }
        }
    }
}
