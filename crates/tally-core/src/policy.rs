//! Cooperative access policy for shared accounts.
//!
//! The group creator (host device) is the sole authority for participant
//! management and expense deletion; any member may add expenses, settle
//! with payments, and claim a person as "this is me".
//!
//! # Trust model
//!
//! This policy constrains the **local write path only** — it is checked
//! before a change is committed and broadcast, and it is deliberately NOT
//! applied to remote ops. It is cooperative and non-cryptographic: any
//! peer could construct privileged operations directly, and filtering
//! remote ops would only make compliant replicas diverge. Signed
//! operations and a device allow-list are future work.

use serde_json::Value;

use crate::doc::Change;
use crate::error::SyncError;
use crate::model::entity::{Account, AccountMode};
use crate::model::id::DeviceId;
use crate::op::EntityKind;

/// Check a local change against the account's policy.
///
/// # Errors
///
/// Returns [`SyncError::PolicyViolation`] if the device may not perform
/// the change.
pub fn check_local(account: &Account, device: &DeviceId, change: &Change) -> Result<(), SyncError> {
    // Single-mode accounts have no peers and no privilege distinctions.
    if account.mode == AccountMode::Single {
        return Ok(());
    }
    let host = account.is_host(device);

    match (change.entity(), change) {
        (EntityKind::Expense, Change::Insert { .. } | Change::Update { .. }) => Ok(()),
        (EntityKind::Expense, Change::Remove { .. }) => {
            require(host, "only the group creator may delete expenses")
        }

        (EntityKind::Person, Change::Insert { .. }) => {
            require(host, "only the group creator may add participants")
        }
        (EntityKind::Person, Change::Remove { .. }) => {
            require(host, "only the group creator may remove participants")
        }
        (EntityKind::Person, Change::Update { fields, .. }) => {
            if host || is_self_claim(fields, device) {
                Ok(())
            } else {
                Err(SyncError::PolicyViolation(
                    "members may only claim a participant as themselves".to_string(),
                ))
            }
        }

        (EntityKind::Payment, Change::Insert { .. } | Change::Remove { .. }) => Ok(()),
        (EntityKind::Payment, Change::Update { .. }) => Err(SyncError::PolicyViolation(
            "payments are immutable; remove and re-add instead".to_string(),
        )),

        (EntityKind::Other(kind), _) => Err(SyncError::PolicyViolation(format!(
            "unknown entity kind '{kind}' cannot be written locally"
        ))),
    }
}

/// A member's person-update is permitted only if it writes exactly
/// `claimed_by = <own device code>`.
fn is_self_claim(fields: &crate::op::FieldMap, device: &DeviceId) -> bool {
    fields.len() == 1
        && fields.get("claimed_by") == Some(&Value::String(device.as_str().to_string()))
}

fn require(ok: bool, reason: &str) -> Result<(), SyncError> {
    if ok {
        Ok(())
    } else {
        Err(SyncError::PolicyViolation(reason.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
