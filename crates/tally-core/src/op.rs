//! The replicated operation model.
//!
//! Every mutation — local or remote — is an [`Op`]: a versioned, hashed,
//! causally stamped record of one insert, update, or remove against one
//! entity. Documents converge by exchanging and replaying ops; nothing else
//! crosses the wire or the store for ledger state.
//!
//! # Canonical hashing
//!
//! `hash` is a BLAKE3 digest (`blake3:<hex>`) over the canonical JSON of
//! every other field. Canonical means object keys sorted, which
//! `serde_json::Value` guarantees. The hash is the op's identity: replay
//! dedup, log storage, and the last tie-break in LWW merges all key on it.
//!
//! # Forward compatibility
//!
//! Unknown entity kinds and op kinds decode into `Other` variants that
//! round-trip byte-equal. A replica that does not understand an op keeps it
//! in its log and re-gossips it; it never fails the parse or corrupts state.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::Stamp;
use crate::model::id::EntityId;

/// Current operation schema version.
pub const OP_VERSION: u8 = 1;

/// Field map payload of an insert or update.
pub type FieldMap = serde_json::Map<String, Value>;

// ---------------------------------------------------------------------------
// EntityKind
// ---------------------------------------------------------------------------

/// The kind of entity an op targets.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKind {
    /// A shared expense.
    Expense,
    /// A participant.
    Person,
    /// A settlement payment.
    Payment,
    /// An entity kind from a newer schema version, preserved verbatim.
    Other(String),
}

impl EntityKind {
    /// The known kinds, in catalog order.
    pub const KNOWN: [Self; 3] = [Self::Expense, Self::Person, Self::Payment];

    /// Canonical string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Expense => "expense",
            Self::Person => "person",
            Self::Payment => "payment",
            Self::Other(raw) => raw,
        }
    }

    fn from_raw(raw: &str) -> Self {
        match raw {
            "expense" => Self::Expense,
            "person" => Self::Person,
            "payment" => Self::Payment,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// OpKind
// ---------------------------------------------------------------------------

/// The mutation an op performs.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    /// Create an entity with the full field set.
    Insert {
        /// Serialized entity fields.
        fields: FieldMap,
    },
    /// Overwrite a subset of fields.
    Update {
        /// The fields being written.
        fields: FieldMap,
    },
    /// Tombstone the entity. Permanent; never retracted.
    Remove,
    /// An op kind from a newer schema version, preserved verbatim and
    /// skipped by apply.
    Other {
        /// The unrecognised discriminant.
        op: String,
        /// Whatever payload rode along, untouched.
        fields: Option<Value>,
    },
}

impl OpKind {
    /// Canonical string discriminant.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Update { .. } => "update",
            Self::Remove => "remove",
            Self::Other { op, .. } => op,
        }
    }
}

// ---------------------------------------------------------------------------
// Op
// ---------------------------------------------------------------------------

/// A single replicated operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Op {
    /// Operation schema version.
    pub v: u8,
    /// Target entity kind.
    pub entity: EntityKind,
    /// Target entity identifier.
    pub id: EntityId,
    /// The mutation.
    pub kind: OpKind,
    /// Lamport stamp issued by the originating device.
    pub stamp: Stamp,
    /// Wall time at the originating device, for display and retention only.
    pub wall_ts_us: i64,
    /// `blake3:<hex>` content hash; the op's identity.
    pub hash: String,
    /// Top-level fields from newer schema versions, preserved opaquely.
    pub extra: BTreeMap<String, Value>,
}

/// Wire/storage shape. Field layout is the schema; `Op` is the typed view.
#[derive(Serialize, Deserialize)]
struct RawOp {
    v: u8,
    entity: String,
    id: EntityId,
    op: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fields: Option<Value>,
    stamp: Stamp,
    wall_ts_us: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    hash: String,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

impl Op {
    /// Build a new op, computing its content hash.
    #[must_use]
    pub fn new(entity: EntityKind, id: EntityId, kind: OpKind, stamp: Stamp, wall_ts_us: i64) -> Self {
        let mut op = Self {
            v: OP_VERSION,
            entity,
            id,
            kind,
            stamp,
            wall_ts_us,
            hash: String::new(),
            extra: BTreeMap::new(),
        };
        op.hash = op.compute_hash();
        op
    }

    /// Compute the canonical content hash over every field except `hash`.
    #[must_use]
    pub fn compute_hash(&self) -> String {
        let mut raw = self.to_raw();
        raw.hash = String::new();
        // Round-tripping through Value sorts object keys, giving canonical
        // JSON regardless of struct field order.
        let canonical = serde_json::to_value(&raw)
            .and_then(|v| serde_json::to_string(&v))
            .unwrap_or_default();
        format!("blake3:{}", blake3::hash(canonical.as_bytes()).to_hex())
    }

    /// Whether this op's known-kind payload can be applied by this replica.
    #[must_use]
    pub fn is_known(&self) -> bool {
        !matches!(&self.kind, OpKind::Other { .. })
            && !matches!(&self.entity, EntityKind::Other(_))
    }

    fn to_raw(&self) -> RawOp {
        let (op, fields) = match &self.kind {
            OpKind::Insert { fields } => ("insert".to_string(), Some(Value::Object(fields.clone()))),
            OpKind::Update { fields } => ("update".to_string(), Some(Value::Object(fields.clone()))),
            OpKind::Remove => ("remove".to_string(), None),
            OpKind::Other { op, fields } => (op.clone(), fields.clone()),
        };
        RawOp {
            v: self.v,
            entity: self.entity.as_str().to_string(),
            id: self.id.clone(),
            op,
            fields,
            stamp: self.stamp.clone(),
            wall_ts_us: self.wall_ts_us,
            hash: self.hash.clone(),
            extra: self.extra.clone(),
        }
    }

    fn from_raw(raw: RawOp) -> Result<Self, String> {
        let kind = match raw.op.as_str() {
            "insert" | "update" => {
                let fields = match raw.fields {
                    Some(Value::Object(map)) => map,
                    _ => return Err(format!("{} op requires an object payload", raw.op)),
                };
                if raw.op == "insert" {
                    OpKind::Insert { fields }
                } else {
                    OpKind::Update { fields }
                }
            }
            "remove" => OpKind::Remove,
            other => OpKind::Other {
                op: other.to_string(),
                fields: raw.fields,
            },
        };
        Ok(Self {
            v: raw.v,
            entity: EntityKind::from_raw(&raw.entity),
            id: raw.id,
            kind,
            stamp: raw.stamp,
            wall_ts_us: raw.wall_ts_us,
            hash: raw.hash,
            extra: raw.extra,
        })
    }
}

impl Serialize for Op {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_raw().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Op {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawOp::deserialize(deserializer)?;
        Self::from_raw(raw).map_err(D::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::id::DeviceId;

    fn stamp(counter: u64, device: &str) -> Stamp {
        Stamp {
            counter,
            device: DeviceId::new_unchecked(device),
        }
    }

    fn eid(n: u8) -> EntityId {
        EntityId::new_unchecked(&format!("{n:032x}"))
    }

    fn fields(pairs: &[(&str, Value)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn hash_is_stable_and_content_sensitive() {
        let a = Op::new(
            EntityKind::Expense,
            eid(1),
            OpKind::Insert {
                fields: fields(&[("amount", Value::from(3000))]),
            },
            stamp(1, "A2B3C4"),
            100,
        );
        let same = Op::new(
            EntityKind::Expense,
            eid(1),
            OpKind::Insert {
                fields: fields(&[("amount", Value::from(3000))]),
            },
            stamp(1, "A2B3C4"),
            100,
        );
        let different = Op::new(
            EntityKind::Expense,
            eid(1),
            OpKind::Insert {
                fields: fields(&[("amount", Value::from(3001))]),
            },
            stamp(1, "A2B3C4"),
            100,
        );
        assert_eq!(a.hash, same.hash);
        assert_ne!(a.hash, different.hash);
        assert!(a.hash.starts_with("blake3:"));
    }

    #[test]
    fn serde_roundtrip() {
        let op = Op::new(
            EntityKind::Person,
            eid(2),
            OpKind::Update {
                fields: fields(&[("name", Value::from("Alice"))]),
            },
            stamp(7, "A2B3C4"),
            1_000,
        );
        let json = serde_json::to_string(&op).expect("serialize");
        let back: Op = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, op);
        assert_eq!(back.compute_hash(), op.hash);
    }

    #[test]
    fn remove_has_no_payload() {
        let op = Op::new(
            EntityKind::Payment,
            eid(3),
            OpKind::Remove,
            stamp(2, "A2B3C4"),
            50,
        );
        let json = serde_json::to_value(&op).expect("serialize");
        assert!(json.get("fields").is_none());
        let back: Op = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back.kind, OpKind::Remove);
    }

    #[test]
    fn unknown_op_kind_roundtrips_untouched() {
        let json = serde_json::json!({
            "v": 3,
            "entity": "expense",
            "id": "00000000000000000000000000000004",
            "op": "archive",
            "fields": {"reason": "old"},
            "stamp": {"counter": 9, "device": "A2B3C4"},
            "wall_ts_us": 77,
            "hash": "blake3:abc",
            "future_top_level": 1,
        });
        let op: Op = serde_json::from_value(json.clone()).expect("deserialize");
        assert!(!op.is_known());
        assert!(matches!(&op.kind, OpKind::Other { op, .. } if op == "archive"));
        assert_eq!(op.extra.get("future_top_level"), Some(&Value::from(1)));
        let back = serde_json::to_value(&op).expect("serialize");
        assert_eq!(back, json);
    }

    #[test]
    fn unknown_entity_kind_roundtrips() {
        let json = serde_json::json!({
            "v": 1,
            "entity": "budget",
            "id": "00000000000000000000000000000005",
            "op": "insert",
            "fields": {"cap": 100},
            "stamp": {"counter": 1, "device": "A2B3C4"},
            "wall_ts_us": 1,
            "hash": "blake3:def",
        });
        let op: Op = serde_json::from_value(json.clone()).expect("deserialize");
        assert_eq!(op.entity, EntityKind::Other("budget".to_string()));
        assert!(!op.is_known());
        assert_eq!(serde_json::to_value(&op).expect("serialize"), json);
    }

    #[test]
    fn insert_without_object_payload_is_rejected() {
        let json = serde_json::json!({
            "v": 1,
            "entity": "expense",
            "id": "00000000000000000000000000000006",
            "op": "insert",
            "stamp": {"counter": 1, "device": "A2B3C4"},
            "wall_ts_us": 1,
        });
        assert!(serde_json::from_value::<Op>(json).is_err());
    }
}
