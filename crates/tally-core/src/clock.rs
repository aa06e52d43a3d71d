//! Logical clocks and the injected wall clock.
//!
//! Merge order never depends on wall-clock time across devices: operations
//! carry a Lamport [`Stamp`] and ties between devices are broken by the
//! device code, giving a total order over `(counter, device)`. Wall time is
//! carried on operations for display and retention decisions only.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::model::id::{DeviceId, ParseIdError};

/// A Lamport stamp: logical counter plus the issuing device.
///
/// The derived ordering compares `counter` first, then `device`
/// lexicographically — a total order, since a single device never issues
/// the same counter twice.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Stamp {
    /// Logical counter, strictly increasing per device.
    pub counter: u64,
    /// The device that issued this stamp.
    pub device: DeviceId,
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.device)
    }
}

/// Error returned when parsing a malformed stamp.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid stamp '{raw}'")]
pub struct ParseStampError {
    /// The rejected input.
    pub raw: String,
}

impl From<ParseIdError> for ParseStampError {
    fn from(err: ParseIdError) -> Self {
        Self { raw: err.raw }
    }
}

impl FromStr for Stamp {
    type Err = ParseStampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (counter, device) = s.split_once('@').ok_or_else(|| ParseStampError {
            raw: s.to_string(),
        })?;
        let counter: u64 = counter.parse().map_err(|_| ParseStampError {
            raw: s.to_string(),
        })?;
        let device: DeviceId = device.parse()?;
        Ok(Self { counter, device })
    }
}

// ---------------------------------------------------------------------------
// DeviceClock
// ---------------------------------------------------------------------------

/// Per-device Lamport clock.
///
/// `tick` issues the next local stamp; `witness` advances past any remote
/// stamp so that stamps issued after a merge causally dominate everything
/// already seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceClock {
    device: DeviceId,
    counter: u64,
}

impl DeviceClock {
    /// Create a clock for the given device, starting at zero.
    #[must_use]
    pub const fn new(device: DeviceId) -> Self {
        Self { device, counter: 0 }
    }

    /// The owning device.
    #[must_use]
    pub const fn device(&self) -> &DeviceId {
        &self.device
    }

    /// The last issued or witnessed counter.
    #[must_use]
    pub const fn current(&self) -> u64 {
        self.counter
    }

    /// Issue the next local stamp.
    pub fn tick(&mut self) -> Stamp {
        self.counter += 1;
        Stamp {
            counter: self.counter,
            device: self.device.clone(),
        }
    }

    /// Observe a remote stamp, advancing the local counter to at least it.
    pub fn witness(&mut self, stamp: &Stamp) {
        if stamp.counter > self.counter {
            self.counter = stamp.counter;
        }
    }
}

// ---------------------------------------------------------------------------
// Wall clock capability
// ---------------------------------------------------------------------------

/// Injected wall-clock capability.
///
/// Production code uses [`SystemClock`]; tests use [`FixedClock`] so that
/// timestamps are deterministic.
pub trait WallClock: Send + Sync {
    /// Current wall time in microseconds since the Unix epoch.
    fn now_us(&self) -> i64;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now_us(&self) -> i64 {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        i64::try_from(elapsed.as_micros()).unwrap_or(i64::MAX)
    }
}

/// A manually-advanced clock for tests.
#[derive(Debug, Default)]
pub struct FixedClock {
    now_us: AtomicI64,
}

impl FixedClock {
    /// Create a fixed clock at the given microsecond timestamp.
    #[must_use]
    pub fn at(now_us: i64) -> Self {
        Self {
            now_us: AtomicI64::new(now_us),
        }
    }

    /// Advance the clock.
    pub fn advance_us(&self, delta: i64) {
        self.now_us.fetch_add(delta, Ordering::SeqCst);
    }
}

impl WallClock for FixedClock {
    fn now_us(&self) -> i64 {
        self.now_us.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
