//! Fixed-point money and the canonical split rule.
//!
//! Amounts are an integer count of minor units (cents). No floating point
//! ever enters storage, the wire, or the merge path — float rounding drift
//! across devices would make balances diverge between replicas that hold
//! identical merged state.
//!
//! # Canonical rounding rule
//!
//! Equal splits round half-up per share in minor units; the remainder
//! (total minus the sum of rounded shares, possibly negative) is folded
//! into the payer's share. Every device computes the same shares from the
//! same merged expense, so balances are re-derivable identically anywhere.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::model::id::EntityId;

/// An amount in minor units (cents). Serialized as a bare integer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Money(i64);

/// Error returned when parsing a malformed decimal amount.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid money amount '{raw}'")]
pub struct ParseMoneyError {
    /// The rejected input.
    pub raw: String,
}

impl Money {
    /// Zero minor units.
    pub const ZERO: Self = Self(0);

    /// Construct from a minor-unit count.
    #[must_use]
    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    /// The minor-unit count.
    #[must_use]
    pub const fn minor(self) -> i64 {
        self.0
    }

    /// Convert a float major-unit amount to minor units, rounding half away
    /// from zero.
    ///
    /// This is the legacy-import boundary only: pre-CRDT records stored
    /// float amounts. Nothing else in the engine touches floats.
    #[must_use]
    pub fn from_major_f64(major: f64) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        Self((major * 100.0).round() as i64)
    }

    /// Checked addition.
    #[must_use]
    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    /// Checked subtraction.
    #[must_use]
    pub fn checked_sub(self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl FromStr for Money {
    type Err = ParseMoneyError;

    /// Parse a decimal amount: optional sign, integer part, optional `.`
    /// and at most two fraction digits. More precision than cents is
    /// rejected rather than silently rounded.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseMoneyError { raw: s.to_string() };

        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };

        let (int_part, frac_part) = match body.split_once('.') {
            Some((i, f)) => (i, f),
            None => (body, ""),
        };
        if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err());
        }
        if frac_part.len() > 2 || !frac_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err());
        }

        let units: i64 = int_part.parse().map_err(|_| err())?;
        let mut cents: i64 = if frac_part.is_empty() {
            0
        } else {
            frac_part.parse().map_err(|_| err())?
        };
        if frac_part.len() == 1 {
            cents *= 10;
        }

        let minor = units.checked_mul(100).and_then(|u| u.checked_add(cents)).ok_or_else(err)?;
        Ok(Self(if negative { -minor } else { minor }))
    }
}

// ---------------------------------------------------------------------------
// Splits
// ---------------------------------------------------------------------------

/// How an expense is divided among participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitMode {
    /// The payer carries the whole amount (personal expense, no debt).
    Full,
    /// Divided equally among all participants.
    Equal,
    /// Explicit per-participant share map.
    Custom,
}

/// Error returned when a split cannot be computed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SplitError {
    /// No participants were given for an equal split.
    #[error("equal split requires at least one participant")]
    NoParticipants,
    /// The payer is not among the participants.
    #[error("payer {0} is not a participant")]
    PayerNotParticipant(EntityId),
    /// A custom split was requested without a share map.
    #[error("custom split requires an explicit share map")]
    MissingShares,
    /// The custom share map does not sum to the expense total.
    #[error("custom shares sum to {got} but the total is {want}")]
    ShareSumMismatch {
        /// Sum of the provided shares.
        got: Money,
        /// The expense total.
        want: Money,
    },
}

/// Compute the per-participant shares of an expense total.
///
/// The result always sums to `total` exactly. See the module docs for the
/// canonical rounding rule.
///
/// # Errors
///
/// Returns a [`SplitError`] if the participant set or share map is
/// inconsistent with the requested mode.
pub fn split_shares(
    total: Money,
    mode: SplitMode,
    participants: &[EntityId],
    payer: &EntityId,
    custom: Option<&BTreeMap<EntityId, Money>>,
) -> Result<BTreeMap<EntityId, Money>, SplitError> {
    match mode {
        SplitMode::Full => Ok(BTreeMap::from([(payer.clone(), total)])),
        SplitMode::Equal => {
            if participants.is_empty() {
                return Err(SplitError::NoParticipants);
            }
            if !participants.contains(payer) {
                return Err(SplitError::PayerNotParticipant(payer.clone()));
            }
            #[allow(clippy::cast_possible_wrap)]
            let n = participants.len() as i64;
            // Round half-up per share in minor units.
            let share = (total.minor() * 2 + n).div_euclid(2 * n);

            let mut shares: BTreeMap<EntityId, Money> = participants
                .iter()
                .map(|p| (p.clone(), Money::from_minor(share)))
                .collect();
            let assigned: i64 = share * n;
            let remainder = total.minor() - assigned;
            if let Some(payer_share) = shares.get_mut(payer) {
                *payer_share = Money::from_minor(payer_share.minor() + remainder);
            }
            Ok(shares)
        }
        SplitMode::Custom => {
            let shares = custom.ok_or(SplitError::MissingShares)?;
            let sum: i64 = shares.values().map(|m| m.minor()).sum();
            if sum != total.minor() {
                return Err(SplitError::ShareSumMismatch {
                    got: Money::from_minor(sum),
                    want: total,
                });
            }
            Ok(shares.clone())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
