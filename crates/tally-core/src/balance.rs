//! Settlement balances: a pure projection over merged state.
//!
//! No hidden per-device aggregate is ever the source of truth — balances
//! are re-derived from the document on demand, and because splits use the
//! canonical integer rounding rule, every device derives identical numbers
//! from identical merged state.

use std::collections::BTreeMap;

use tracing::warn;

use crate::doc::Document;
use crate::model::id::EntityId;
use crate::model::money::{split_shares, Money};

/// Net balance per person, in minor units.
///
/// Positive means the person is owed money; negative means they owe.
/// Balances across all people sum to zero.
///
/// Expenses whose split cannot be computed (custom mode with a bad share
/// map after a partial merge) are skipped with a warning rather than
/// poisoning the whole projection; they are surfaced again once the
/// missing fields arrive.
#[must_use]
pub fn balances(doc: &Document) -> BTreeMap<EntityId, Money> {
    let mut net: BTreeMap<EntityId, i64> = BTreeMap::new();
    for person in doc.people() {
        net.insert(person.id, 0);
    }

    for expense in doc.expenses() {
        let participants: Vec<EntityId> = doc.people().into_iter().map(|p| p.id).collect();
        let shares = match split_shares(
            expense.amount,
            expense.split,
            &participants,
            &expense.payer,
            expense.shares.as_ref(),
        ) {
            Ok(shares) => shares,
            Err(err) => {
                warn!(expense = %expense.id, %err, "skipping unsplittable expense");
                continue;
            }
        };
        // The payer fronted the whole amount; every participant owes their
        // share (the payer's own share cancels against what they fronted).
        *net.entry(expense.payer.clone()).or_insert(0) += expense.amount.minor();
        for (person, share) in shares {
            *net.entry(person).or_insert(0) -= share.minor();
        }
    }

    for payment in doc.payments() {
        // Paying someone reduces your debt and their credit.
        *net.entry(payment.from.clone()).or_insert(0) += payment.amount.minor();
        *net.entry(payment.to.clone()).or_insert(0) -= payment.amount.minor();
    }

    net.into_iter()
        .map(|(person, minor)| (person, Money::from_minor(minor)))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
