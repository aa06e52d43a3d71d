//! One-shot import of pre-CRDT local records into the document.
//!
//! Runs once per device, gated by a persisted marker in the store. The
//! import is idempotent two ways:
//!
//! - Entity identifiers are derived deterministically from the legacy keys
//!   (`blake3(account · kind · key)`), so an interrupted run that re-runs
//!   produces the same identifiers.
//! - Inserts are id-idempotent in the document — a duplicate of an
//!   already-imported entity joins to identical state.
//!
//! The marker is set only after every record is imported **and** flushed;
//! partial failure leaves it unset and the import retries on next launch.
//! Legacy source records are never modified or deleted by this engine.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::doc::{Change, Document};
use crate::error::SyncError;
use crate::model::entity::{Expense, Payment, Person};
use crate::model::id::{AccountId, EntityId};
use crate::model::money::{Money, SplitMode};
use crate::op::{EntityKind, Op};
use crate::store::Store;

// ---------------------------------------------------------------------------
// Legacy record shapes
// ---------------------------------------------------------------------------

/// A participant from the pre-CRDT store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyPerson {
    /// Local key in the legacy store (any shape).
    pub key: String,
    /// Display name.
    pub name: String,
}

/// An expense from the pre-CRDT store. Amounts are floats there — the one
/// place floats exist — and are rounded to cents on the way in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyExpense {
    /// Local key in the legacy store.
    pub key: String,
    /// Float amount in major units.
    pub amount: f64,
    /// Calendar date.
    pub date: NaiveDate,
    /// Legacy key of the payer.
    pub payer_key: String,
    /// Split mode.
    pub split: SplitMode,
    /// Explicit shares by legacy person key, for custom splits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shares: Option<BTreeMap<String, f64>>,
    /// Optional category tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Optional notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// A payment from the pre-CRDT store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyPayment {
    /// Local key in the legacy store.
    pub key: String,
    /// Legacy key of the payer.
    pub from_key: String,
    /// Legacy key of the payee.
    pub to_key: String,
    /// Float amount in major units.
    pub amount: f64,
    /// Calendar date.
    pub date: NaiveDate,
}

/// Everything the legacy store holds for one account.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LegacyRecords {
    /// Participants.
    #[serde(default)]
    pub people: Vec<LegacyPerson>,
    /// Expenses.
    #[serde(default)]
    pub expenses: Vec<LegacyExpense>,
    /// Payments.
    #[serde(default)]
    pub payments: Vec<LegacyPayment>,
}

/// Counts from a completed migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MigrationReport {
    /// People imported.
    pub people: usize,
    /// Expenses imported.
    pub expenses: usize,
    /// Payments imported.
    pub payments: usize,
    /// Records skipped (unresolvable references).
    pub skipped: usize,
    /// True if the marker was already set and nothing ran.
    pub already_complete: bool,
}

// ---------------------------------------------------------------------------
// Identifier derivation
// ---------------------------------------------------------------------------

/// Derive a stable entity identifier from a legacy key.
///
/// The same `(account, kind, key)` always maps to the same identifier, on
/// every run and every device that imports the same legacy data.
#[must_use]
pub fn derive_entity_id(account: &AccountId, kind: &EntityKind, key: &str) -> EntityId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(account.as_str().as_bytes());
    hasher.update(&[0x1f]);
    hasher.update(kind.as_str().as_bytes());
    hasher.update(&[0x1f]);
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.as_bytes()[..16]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();
    EntityId::new_unchecked(&hex)
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

/// Import legacy records into the document, committing one insert op per
/// record. Does not touch the marker; see [`run`].
///
/// Records with unresolvable person references are skipped (and counted),
/// not fatal — the rest of the import proceeds.
pub fn import_into(
    doc: &mut Document,
    records: &LegacyRecords,
    wall_ts_us: i64,
) -> (Vec<Op>, MigrationReport) {
    let account = doc.account().clone();
    let mut ops = Vec::new();
    let mut report = MigrationReport::default();

    let person_id =
        |key: &str| -> EntityId { derive_entity_id(&account, &EntityKind::Person, key) };

    for legacy in &records.people {
        let person = Person {
            id: person_id(&legacy.key),
            name: legacy.name.clone(),
            claimed_by: None,
            created_at_us: wall_ts_us,
            extra: BTreeMap::new(),
        };
        match Change::insert(EntityKind::Person, person.id.clone(), &person) {
            Ok(change) => {
                ops.push(doc.commit(change, wall_ts_us));
                report.people += 1;
            }
            Err(err) => {
                warn!(key = %legacy.key, %err, "skipping unserializable person");
                report.skipped += 1;
            }
        }
    }

    let known_person = |key: &str| records.people.iter().any(|p| p.key == key);

    for legacy in &records.expenses {
        if !known_person(&legacy.payer_key) {
            warn!(key = %legacy.key, payer = %legacy.payer_key, "skipping expense with unknown payer");
            report.skipped += 1;
            continue;
        }
        let shares = legacy.shares.as_ref().map(|shares| {
            shares
                .iter()
                .map(|(key, amount)| (person_id(key), Money::from_major_f64(*amount)))
                .collect()
        });
        let expense = Expense {
            id: derive_entity_id(&account, &EntityKind::Expense, &legacy.key),
            amount: Money::from_major_f64(legacy.amount),
            date: legacy.date,
            payer: person_id(&legacy.payer_key),
            split: legacy.split,
            shares,
            tag: legacy.tag.clone(),
            notes: legacy.notes.clone(),
            image: None,
            created_at_us: wall_ts_us,
            extra: BTreeMap::new(),
        };
        match Change::insert(EntityKind::Expense, expense.id.clone(), &expense) {
            Ok(change) => {
                ops.push(doc.commit(change, wall_ts_us));
                report.expenses += 1;
            }
            Err(err) => {
                warn!(key = %legacy.key, %err, "skipping unserializable expense");
                report.skipped += 1;
            }
        }
    }

    for legacy in &records.payments {
        if !known_person(&legacy.from_key) || !known_person(&legacy.to_key) {
            warn!(key = %legacy.key, "skipping payment with unknown endpoint");
            report.skipped += 1;
            continue;
        }
        let payment = Payment {
            id: derive_entity_id(&account, &EntityKind::Payment, &legacy.key),
            from: person_id(&legacy.from_key),
            to: person_id(&legacy.to_key),
            amount: Money::from_major_f64(legacy.amount),
            date: legacy.date,
            created_at_us: wall_ts_us,
            extra: BTreeMap::new(),
        };
        match Change::insert(EntityKind::Payment, payment.id.clone(), &payment) {
            Ok(change) => {
                ops.push(doc.commit(change, wall_ts_us));
                report.payments += 1;
            }
            Err(err) => {
                warn!(key = %legacy.key, %err, "skipping unserializable payment");
                report.skipped += 1;
            }
        }
    }

    (ops, report)
}

/// Run the full migration against the store: check the marker, import,
/// flush, then set the marker.
///
/// # Errors
///
/// Returns [`SyncError::MigrationFailure`] if the flush or marker write
/// fails; the marker stays unset and the next launch retries safely.
pub fn run(
    store: &mut Store,
    doc: &mut Document,
    records: &LegacyRecords,
    wall_ts_us: i64,
) -> Result<MigrationReport, SyncError> {
    let complete = store
        .migration_complete()
        .map_err(|err| SyncError::MigrationFailure(err.to_string()))?;
    if complete {
        return Ok(MigrationReport {
            already_complete: true,
            ..MigrationReport::default()
        });
    }

    let (ops, report) = import_into(doc, records, wall_ts_us);
    store
        .persist_ops(&ops, doc)
        .map_err(|err| SyncError::MigrationFailure(err.to_string()))?;
    store
        .set_migration_complete()
        .map_err(|err| SyncError::MigrationFailure(err.to_string()))?;
    info!(
        people = report.people,
        expenses = report.expenses,
        payments = report.payments,
        skipped = report.skipped,
        "legacy migration complete"
    );
    Ok(report)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::id::DeviceId;

    fn aid() -> AccountId {
        AccountId::new_unchecked("000000000000000000000000000000aa")
    }

    fn dev() -> DeviceId {
        DeviceId::new_unchecked("A2B3C4")
    }

    fn sample_records() -> LegacyRecords {
        LegacyRecords {
            people: vec![
                LegacyPerson {
                    key: "p-alice".to_string(),
                    name: "Alice".to_string(),
                },
                LegacyPerson {
                    key: "p-bob".to_string(),
                    name: "Bob".to_string(),
                },
            ],
            expenses: vec![LegacyExpense {
                key: "e-groceries".to_string(),
                amount: 30.005,
                date: NaiveDate::from_ymd_opt(2026, 7, 1).expect("valid date"),
                payer_key: "p-alice".to_string(),
                split: SplitMode::Equal,
                shares: None,
                tag: Some("food".to_string()),
                notes: None,
            }],
            payments: vec![LegacyPayment {
                key: "pay-1".to_string(),
                from_key: "p-bob".to_string(),
                to_key: "p-alice".to_string(),
                amount: 10.0,
                date: NaiveDate::from_ymd_opt(2026, 7, 2).expect("valid date"),
            }],
        }
    }

    #[test]
    fn derived_ids_are_stable_and_distinct() {
        let a = derive_entity_id(&aid(), &EntityKind::Person, "p-alice");
        let b = derive_entity_id(&aid(), &EntityKind::Person, "p-alice");
        let c = derive_entity_id(&aid(), &EntityKind::Person, "p-bob");
        let d = derive_entity_id(&aid(), &EntityKind::Expense, "p-alice");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn float_amounts_round_to_cents() {
        let mut doc = Document::new(aid(), dev());
        let (_, report) = import_into(&mut doc, &sample_records(), 1);
        assert_eq!(report.expenses, 1);
        let expenses = doc.expenses();
        assert_eq!(expenses[0].amount, Money::from_minor(3001));
    }

    #[test]
    fn running_twice_produces_same_entity_count() {
        let records = sample_records();
        let mut doc = Document::new(aid(), dev());

        let (_, first) = import_into(&mut doc, &records, 1);
        assert_eq!(first.people, 2);
        let people_after_first = doc.people().len();
        let expenses_after_first = doc.expenses().len();

        // Interrupted-and-retried import: same records again.
        let (_, second) = import_into(&mut doc, &records, 2);
        assert_eq!(second.people, 2);
        assert_eq!(doc.people().len(), people_after_first);
        assert_eq!(doc.expenses().len(), expenses_after_first);
        assert_eq!(doc.payments().len(), 1);
    }

    #[test]
    fn unknown_references_are_skipped_not_fatal() {
        let mut records = sample_records();
        records.expenses.push(LegacyExpense {
            key: "e-orphan".to_string(),
            amount: 5.0,
            date: NaiveDate::from_ymd_opt(2026, 7, 3).expect("valid date"),
            payer_key: "p-ghost".to_string(),
            split: SplitMode::Equal,
            shares: None,
            tag: None,
            notes: None,
        });
        let mut doc = Document::new(aid(), dev());
        let (_, report) = import_into(&mut doc, &records, 1);
        assert_eq!(report.expenses, 1);
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn run_sets_marker_only_after_success_and_is_once_only() {
        let mut store = Store::open_in_memory(&aid()).expect("open store");
        let mut doc = Document::new(aid(), dev());

        let report = run(&mut store, &mut doc, &sample_records(), 1).expect("migrate");
        assert!(!report.already_complete);
        assert_eq!(report.people, 2);
        assert!(store.migration_complete().expect("marker"));

        let again = run(&mut store, &mut doc, &sample_records(), 2).expect("migrate again");
        assert!(again.already_complete);
        assert_eq!(again.people, 0);

        // The persisted log replays to the same entity counts.
        let restored = store.load_document(dev()).expect("load");
        assert_eq!(restored.people().len(), 2);
        assert_eq!(restored.expenses().len(), 1);
        assert_eq!(restored.payments().len(), 1);
    }
}
