//! The shared CRDT document.
//!
//! One [`Document`] per account per device. All mutation — local commits
//! and remote merges alike — funnels through [`Document::apply`], the
//! single serialized entry point, so the document itself needs no locking
//! discipline beyond "one mutation at a time" (the session wraps it in a
//! mutex).
//!
//! # Merge semantics
//!
//! - Ops are deduplicated by content hash; replaying an op is a no-op.
//! - Insertions from different devices with different identifiers coexist.
//! - A duplicate insert for the same identifier joins per-field with
//!   last-writer-wins registers.
//! - An insert and a tombstone for the same identifier resolve to
//!   "deleted" regardless of arrival order, and a tombstone is never
//!   retracted.
//! - Updates that arrive before their entity's insert are buffered and
//!   replayed when the insert lands (cross-link reordering); updates for a
//!   tombstoned entity are dropped.
//! - Ops with unknown kinds are kept in the log for re-gossip and
//!   otherwise skipped; they never fail the apply.
//!
//! Two documents that have applied the same set of ops, in any order, are
//! `==` over their logical state.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::clock::{DeviceClock, Stamp};
use crate::crdt::{LwwRegister, Merge};
use crate::model::entity::{Expense, Payment, Person};
use crate::model::id::{AccountId, DeviceId, EntityId};
use crate::op::{EntityKind, FieldMap, Op, OpKind};

// ---------------------------------------------------------------------------
// Tombstone
// ---------------------------------------------------------------------------

/// Marker that an entity was deleted, and when.
///
/// Tombstones are grow-only: once one exists for an identifier, no insert
/// or update for that identifier ever takes effect again. Two replicas
/// deleting the same entity concurrently converge on the earliest stamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    /// Stamp of the remove op.
    pub stamp: Stamp,
    /// Wall time of the deletion, for retention-based cleanup.
    pub wall_ts_us: i64,
}

impl Merge for Tombstone {
    fn merge(&mut self, other: Self) {
        if other.stamp < self.stamp {
            *self = other;
        }
    }
}

// ---------------------------------------------------------------------------
// StateVector
// ---------------------------------------------------------------------------

/// Per-device high-water marks: the largest counter seen from each device.
///
/// Used to compute deltas for the log exchange. Because each link delivers
/// a device's ops in generated order, "largest counter" is an accurate
/// summary; occasional re-sends across transitive gossip are harmless —
/// apply deduplicates by hash.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateVector(BTreeMap<DeviceId, u64>);

impl StateVector {
    /// An empty vector (nothing seen).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a stamp.
    pub fn observe(&mut self, stamp: &Stamp) {
        let seen = self.0.entry(stamp.device.clone()).or_insert(0);
        if stamp.counter > *seen {
            *seen = stamp.counter;
        }
    }

    /// Largest counter seen from `device`, or 0.
    #[must_use]
    pub fn seen(&self, device: &DeviceId) -> u64 {
        self.0.get(device).copied().unwrap_or(0)
    }

    /// Whether the stamp is already covered by this vector.
    #[must_use]
    pub fn contains(&self, stamp: &Stamp) -> bool {
        self.seen(&stamp.device) >= stamp.counter
    }
}

impl Merge for StateVector {
    fn merge(&mut self, other: Self) {
        for (device, counter) in other.0 {
            let seen = self.0.entry(device).or_insert(0);
            if counter > *seen {
                *seen = counter;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// One entity's replicated state: a last-writer-wins register per field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    fields: BTreeMap<String, LwwRegister<Value>>,
}

impl Record {
    fn from_fields(fields: &FieldMap, stamp: &Stamp, op_hash: &str) -> Self {
        let fields = fields
            .iter()
            .map(|(name, value)| {
                (
                    name.clone(),
                    LwwRegister::new(value.clone(), stamp.clone(), op_hash.to_string()),
                )
            })
            .collect();
        Self { fields }
    }

    fn write_fields(&mut self, fields: &FieldMap, stamp: &Stamp, op_hash: &str) {
        for (name, value) in fields {
            let incoming =
                LwwRegister::new(value.clone(), stamp.clone(), op_hash.to_string());
            match self.fields.entry(name.clone()) {
                std::collections::btree_map::Entry::Occupied(mut existing) => {
                    existing.get_mut().merge(incoming);
                }
                std::collections::btree_map::Entry::Vacant(slot) => {
                    slot.insert(incoming);
                }
            }
        }
    }

    /// Materialize the current field values as a JSON object.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let map: serde_json::Map<String, Value> = self
            .fields
            .iter()
            .map(|(name, register)| (name.clone(), register.value.clone()))
            .collect();
        Value::Object(map)
    }
}

impl Merge for Record {
    fn merge(&mut self, other: Self) {
        self.fields.merge(other.fields);
    }
}

// ---------------------------------------------------------------------------
// Change / Applied / DocEvent
// ---------------------------------------------------------------------------

/// A local mutation intent, turned into an [`Op`] by [`Document::commit`].
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Create an entity.
    Insert {
        /// Target kind.
        entity: EntityKind,
        /// Entity identifier (also present in `fields`).
        id: EntityId,
        /// Full serialized field set.
        fields: FieldMap,
    },
    /// Overwrite a subset of fields.
    Update {
        /// Target kind.
        entity: EntityKind,
        /// Entity identifier.
        id: EntityId,
        /// The fields being written.
        fields: FieldMap,
    },
    /// Tombstone an entity.
    Remove {
        /// Target kind.
        entity: EntityKind,
        /// Entity identifier.
        id: EntityId,
    },
}

impl Change {
    /// Build an insert from a serializable entity.
    ///
    /// # Errors
    ///
    /// Returns the serialization error if the entity does not serialize to
    /// a JSON object (it always does for the model types).
    pub fn insert<T: Serialize>(
        entity: EntityKind,
        id: EntityId,
        record: &T,
    ) -> Result<Self, serde_json::Error> {
        match serde_json::to_value(record)? {
            Value::Object(fields) => Ok(Self::Insert { entity, id, fields }),
            other => Err(serde::ser::Error::custom(format!(
                "entity serialized to non-object {other:?}"
            ))),
        }
    }

    /// The target entity kind.
    #[must_use]
    pub fn entity(&self) -> &EntityKind {
        match self {
            Self::Insert { entity, .. } | Self::Update { entity, .. } | Self::Remove { entity, .. } => {
                entity
            }
        }
    }

    /// The target entity identifier.
    #[must_use]
    pub fn id(&self) -> &EntityId {
        match self {
            Self::Insert { id, .. } | Self::Update { id, .. } | Self::Remove { id, .. } => id,
        }
    }
}

/// What applying an op did to the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// A new entity materialized.
    Inserted,
    /// An existing entity's fields changed (or joined a duplicate insert).
    Updated,
    /// The entity was tombstoned.
    Removed,
    /// Duplicate, tombstone-suppressed, buffered, or unknown-kind op.
    Ignored,
}

/// Change notification sent to document observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocEvent {
    /// Target entity kind.
    pub entity: EntityKind,
    /// Target entity identifier.
    pub id: EntityId,
    /// What happened.
    pub applied: Applied,
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// The CRDT state container for one account on one device.
#[derive(Debug)]
pub struct Document {
    account: AccountId,
    clock: DeviceClock,
    expenses: BTreeMap<EntityId, Record>,
    people: BTreeMap<EntityId, Record>,
    payments: BTreeMap<EntityId, Record>,
    tombstones: BTreeMap<EntityId, Tombstone>,
    /// Updates seen before their insert, keyed by entity then op hash.
    pending: BTreeMap<EntityId, BTreeMap<String, Op>>,
    /// Full op log keyed by op hash.
    log: BTreeMap<String, Op>,
    state: StateVector,
    observers: Vec<Sender<DocEvent>>,
}

impl Document {
    /// Create an empty document for `account`, owned by `device`.
    #[must_use]
    pub fn new(account: AccountId, device: DeviceId) -> Self {
        Self {
            account,
            clock: DeviceClock::new(device),
            expenses: BTreeMap::new(),
            people: BTreeMap::new(),
            payments: BTreeMap::new(),
            tombstones: BTreeMap::new(),
            pending: BTreeMap::new(),
            log: BTreeMap::new(),
            state: StateVector::new(),
            observers: Vec::new(),
        }
    }

    /// The account this document belongs to.
    #[must_use]
    pub fn account(&self) -> &AccountId {
        &self.account
    }

    /// The owning device.
    #[must_use]
    pub fn device(&self) -> &DeviceId {
        self.clock.device()
    }

    /// Current per-device high-water marks.
    #[must_use]
    pub fn state_vector(&self) -> &StateVector {
        &self.state
    }

    /// Subscribe to change notifications.
    ///
    /// Events are best-effort: a receiver that falls behind or is dropped
    /// is pruned on the next notification.
    pub fn subscribe(&mut self) -> Receiver<DocEvent> {
        let (tx, rx) = mpsc::channel();
        self.observers.push(tx);
        rx
    }

    /// Turn a local change into a stamped, hashed op and apply it.
    ///
    /// This is the local-write half of the document; remote ops go through
    /// [`Document::apply`] directly.
    pub fn commit(&mut self, change: Change, wall_ts_us: i64) -> Op {
        let stamp = self.clock.tick();
        let (entity, id, kind) = match change {
            Change::Insert { entity, id, fields } => (entity, id, OpKind::Insert { fields }),
            Change::Update { entity, id, fields } => (entity, id, OpKind::Update { fields }),
            Change::Remove { entity, id } => (entity, id, OpKind::Remove),
        };
        let op = Op::new(entity, id, kind, stamp, wall_ts_us);
        self.apply(&op);
        op
    }

    /// Apply one op — local or remote — to the document.
    ///
    /// Idempotent by op hash. Never fails: malformed or unknown ops are
    /// logged and skipped, not errors.
    pub fn apply(&mut self, op: &Op) -> Applied {
        let hash = if op.hash.is_empty() {
            // Tolerate hashless ops from older peers; identity is computed
            // locally and is stable for identical content.
            op.compute_hash()
        } else {
            op.hash.clone()
        };
        if self.log.contains_key(&hash) {
            return Applied::Ignored;
        }

        self.state.observe(&op.stamp);
        self.clock.witness(&op.stamp);

        let applied = match &op.kind {
            OpKind::Insert { fields } => self.apply_insert(op, fields, &hash),
            OpKind::Update { fields } => self.apply_update(op, fields, &hash),
            OpKind::Remove => self.apply_remove(op),
            OpKind::Other { op: kind, .. } => {
                debug!(kind = %kind, id = %op.id, "retaining op of unknown kind");
                Applied::Ignored
            }
        };

        self.log.insert(hash, op.clone());

        if applied != Applied::Ignored {
            self.notify(DocEvent {
                entity: op.entity.clone(),
                id: op.id.clone(),
                applied,
            });
        }
        applied
    }

    fn apply_insert(&mut self, op: &Op, fields: &FieldMap, hash: &str) -> Applied {
        if self.tombstones.contains_key(&op.id) {
            debug!(id = %op.id, "insert suppressed by tombstone");
            return Applied::Ignored;
        }
        let Some(collection) = Self::collection_mut(
            &mut self.expenses,
            &mut self.people,
            &mut self.payments,
            &op.entity,
        ) else {
            return Applied::Ignored;
        };

        let incoming = Record::from_fields(fields, &op.stamp, hash);
        match collection.entry(op.id.clone()) {
            std::collections::btree_map::Entry::Occupied(mut existing) => {
                // Duplicate insert for the same identifier: join per field.
                existing.get_mut().merge(incoming);
                Applied::Updated
            }
            std::collections::btree_map::Entry::Vacant(slot) => {
                let record = slot.insert(incoming);
                // Replay updates that raced ahead of this insert.
                if let Some(buffered) = self.pending.remove(&op.id) {
                    let mut ops: Vec<Op> = buffered.into_values().collect();
                    ops.sort_by(|a, b| a.stamp.cmp(&b.stamp));
                    for pending_op in ops {
                        if let OpKind::Update { fields } = &pending_op.kind {
                            record.write_fields(fields, &pending_op.stamp, &pending_op.hash);
                        }
                    }
                }
                Applied::Inserted
            }
        }
    }

    fn apply_update(&mut self, op: &Op, fields: &FieldMap, hash: &str) -> Applied {
        if self.tombstones.contains_key(&op.id) {
            debug!(id = %op.id, "update suppressed by tombstone");
            return Applied::Ignored;
        }
        let Some(collection) = Self::collection_mut(
            &mut self.expenses,
            &mut self.people,
            &mut self.payments,
            &op.entity,
        ) else {
            return Applied::Ignored;
        };

        if let Some(record) = collection.get_mut(&op.id) {
            record.write_fields(fields, &op.stamp, hash);
            Applied::Updated
        } else {
            // Insert not seen yet; buffer for replay.
            let mut buffered = op.clone();
            buffered.hash = hash.to_string();
            self.pending
                .entry(op.id.clone())
                .or_default()
                .insert(hash.to_string(), buffered);
            Applied::Ignored
        }
    }

    fn apply_remove(&mut self, op: &Op) -> Applied {
        let tombstone = Tombstone {
            stamp: op.stamp.clone(),
            wall_ts_us: op.wall_ts_us,
        };
        let first = !self.tombstones.contains_key(&op.id);
        match self.tombstones.entry(op.id.clone()) {
            std::collections::btree_map::Entry::Occupied(mut existing) => {
                existing.get_mut().merge(tombstone);
            }
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(tombstone);
            }
        }
        self.expenses.remove(&op.id);
        self.people.remove(&op.id);
        self.payments.remove(&op.id);
        self.pending.remove(&op.id);
        if first { Applied::Removed } else { Applied::Ignored }
    }

    fn collection_mut<'a>(
        expenses: &'a mut BTreeMap<EntityId, Record>,
        people: &'a mut BTreeMap<EntityId, Record>,
        payments: &'a mut BTreeMap<EntityId, Record>,
        entity: &EntityKind,
    ) -> Option<&'a mut BTreeMap<EntityId, Record>> {
        match entity {
            EntityKind::Expense => Some(expenses),
            EntityKind::Person => Some(people),
            EntityKind::Payment => Some(payments),
            EntityKind::Other(_) => None,
        }
    }

    fn notify(&mut self, event: DocEvent) {
        self.observers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    // -----------------------------------------------------------------------
    // Delta exchange
    // -----------------------------------------------------------------------

    /// Ops the remote has not seen, per its state vector.
    ///
    /// Ordered by `(device, counter)` so each device's ops arrive in
    /// generated order (causal delivery per link).
    #[must_use]
    pub fn ops_since(&self, remote: &StateVector) -> Vec<Op> {
        let mut ops: Vec<Op> = self
            .log
            .values()
            .filter(|op| !remote.contains(&op.stamp))
            .cloned()
            .collect();
        ops.sort_by(|a, b| a.stamp.cmp(&b.stamp));
        ops
    }

    /// Number of ops in the log.
    #[must_use]
    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    /// Iterate the full op log in stamp order.
    #[must_use]
    pub fn log_ops(&self) -> Vec<Op> {
        self.ops_since(&StateVector::new())
    }

    // -----------------------------------------------------------------------
    // Materialized reads
    // -----------------------------------------------------------------------

    /// Whether an identifier is tombstoned.
    #[must_use]
    pub fn is_tombstoned(&self, id: &EntityId) -> bool {
        self.tombstones.contains_key(id)
    }

    /// The tombstone map (id → deletion marker).
    #[must_use]
    pub fn tombstones(&self) -> &BTreeMap<EntityId, Tombstone> {
        &self.tombstones
    }

    /// Materialize one expense.
    #[must_use]
    pub fn expense(&self, id: &EntityId) -> Option<Expense> {
        Self::materialize(&self.expenses, id)
    }

    /// Materialize all expenses, in identifier order.
    #[must_use]
    pub fn expenses(&self) -> Vec<Expense> {
        Self::materialize_all(&self.expenses)
    }

    /// Materialize one person.
    #[must_use]
    pub fn person(&self, id: &EntityId) -> Option<Person> {
        Self::materialize(&self.people, id)
    }

    /// Materialize all people, in identifier order.
    #[must_use]
    pub fn people(&self) -> Vec<Person> {
        Self::materialize_all(&self.people)
    }

    /// Materialize one payment.
    #[must_use]
    pub fn payment(&self, id: &EntityId) -> Option<Payment> {
        Self::materialize(&self.payments, id)
    }

    /// Materialize all payments, in identifier order.
    #[must_use]
    pub fn payments(&self) -> Vec<Payment> {
        Self::materialize_all(&self.payments)
    }

    /// Raw record access, for the persistence projection.
    #[must_use]
    pub fn record(&self, entity: &EntityKind, id: &EntityId) -> Option<&Record> {
        match entity {
            EntityKind::Expense => self.expenses.get(id),
            EntityKind::Person => self.people.get(id),
            EntityKind::Payment => self.payments.get(id),
            EntityKind::Other(_) => None,
        }
    }

    fn materialize<T: serde::de::DeserializeOwned>(
        collection: &BTreeMap<EntityId, Record>,
        id: &EntityId,
    ) -> Option<T> {
        let record = collection.get(id)?;
        match serde_json::from_value(record.to_value()) {
            Ok(entity) => Some(entity),
            Err(err) => {
                warn!(%id, %err, "record does not materialize; skipping");
                None
            }
        }
    }

    fn materialize_all<T: serde::de::DeserializeOwned>(
        collection: &BTreeMap<EntityId, Record>,
    ) -> Vec<T> {
        collection
            .keys()
            .filter_map(|id| Self::materialize(collection, id))
            .collect()
    }
}

/// Logical-state equality: two documents that applied the same op set in
/// any order compare equal, regardless of which device owns them.
impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.account == other.account
            && self.expenses == other.expenses
            && self.people == other.people
            && self.payments == other.payments
            && self.tombstones == other.tombstones
            && self.pending == other.pending
            && self.log == other.log
            && self.state == other.state
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
