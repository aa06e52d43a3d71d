//! Last-writer-wins register.
//!
//! One register per entity field. The merge uses a two-step deterministic
//! tie-break that guarantees bit-identical convergence across replicas:
//!
//! 1. **Lamport stamp**: the total order over `(counter, device)` decides
//!    almost every race — two devices can never issue the same stamp.
//! 2. **Op hash**: a device that somehow stamped two different values
//!    identically (restored-from-backup clock, duplicated device code) is
//!    still resolved deterministically by the lexicographically greater
//!    content hash. No ties remain after this step.

use serde::{Deserialize, Serialize};

use crate::clock::Stamp;
use crate::crdt::merge::Merge;

/// A last-writer-wins register holding one field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwRegister<T> {
    /// Current value.
    pub value: T,
    /// Stamp of the write that set it.
    pub stamp: Stamp,
    /// Hash of the op that set it; final tie-break.
    pub op_hash: String,
}

impl<T> LwwRegister<T> {
    /// Create a register from a write.
    pub fn new(value: T, stamp: Stamp, op_hash: String) -> Self {
        Self {
            value,
            stamp,
            op_hash,
        }
    }

    /// Returns `true` if `self` wins over `other`.
    fn wins_over(&self, other: &Self) -> bool {
        match self.stamp.cmp(&other.stamp) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.op_hash >= other.op_hash,
        }
    }
}

impl<T> Merge for LwwRegister<T> {
    fn merge(&mut self, other: Self) {
        if !self.wins_over(&other) {
            *self = other;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
