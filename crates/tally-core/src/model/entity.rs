//! Ledger entities: expenses, people, payments, and the account they
//! belong to.
//!
//! Every replicated entity carries an opaque `extra` map: unknown fields
//! from newer schema versions are preserved and round-tripped untouched so
//! an older device never strips data it does not understand.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::model::id::{AccountId, DeviceId, EntityId};
use crate::model::money::{Money, SplitMode};

/// A shared expense.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expense {
    /// Globally unique identifier, generated by the creating device.
    pub id: EntityId,
    /// Amount in minor units.
    pub amount: Money,
    /// Calendar date of the spend.
    pub date: NaiveDate,
    /// The person who paid.
    pub payer: EntityId,
    /// How the amount is divided.
    pub split: SplitMode,
    /// Explicit per-participant shares, required for [`SplitMode::Custom`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shares: Option<BTreeMap<EntityId, Money>>,
    /// Optional category tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Optional free-form notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Receipt image reference. The blob itself is transferred lazily.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<EntityId>,
    /// Creation wall time, microseconds since Unix epoch. Display only.
    pub created_at_us: i64,
    /// Fields from newer schema versions, preserved opaquely.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A participant in the shared ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    /// Globally unique identifier.
    pub id: EntityId,
    /// Display name.
    pub name: String,
    /// Device that claimed this person as "this is me", if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<DeviceId>,
    /// Creation wall time, microseconds since Unix epoch.
    pub created_at_us: i64,
    /// Fields from newer schema versions, preserved opaquely.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A debt-reducing transfer between two people.
///
/// Payments are never mutated after creation; they can only be removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    /// Globally unique identifier.
    pub id: EntityId,
    /// The person who paid.
    pub from: EntityId,
    /// The person who was paid.
    pub to: EntityId,
    /// Amount in minor units.
    pub amount: Money,
    /// Calendar date of the transfer.
    pub date: NaiveDate,
    /// Creation wall time, microseconds since Unix epoch.
    pub created_at_us: i64,
    /// Fields from newer schema versions, preserved opaquely.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// Whether an account syncs with peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountMode {
    /// Local-only; no peers, no policy distinctions.
    Single,
    /// Multi-device; the creating device is the participant-management
    /// authority.
    Shared,
}

/// A ledger account (group).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Globally unique account identifier.
    pub id: AccountId,
    /// Sync mode.
    pub mode: AccountMode,
    /// ISO 4217 currency code for display.
    pub currency: String,
    /// The creating device, recorded at creation and propagated to joiners
    /// via the invite. `None` for single-mode accounts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_device: Option<DeviceId>,
    /// Display name of the group.
    pub name: String,
}

impl Account {
    /// Whether the given device is the group creator.
    #[must_use]
    pub fn is_host(&self, device: &DeviceId) -> bool {
        self.host_device.as_ref() == Some(device)
    }
}
