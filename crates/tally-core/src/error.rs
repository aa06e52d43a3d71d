//! Error taxonomy for the sync engine.
//!
//! Merge conflicts are deliberately absent: they are resolved
//! deterministically by the CRDT merge and never escalate. Nothing in this
//! taxonomy is allowed to terminate the process; the worst outcome is a
//! session degrading to offline, local-only operation.

use std::time::Duration;

use crate::model::id::{DeviceId, EntityId};

/// Errors surfaced by the sync engine.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Signaling or transport could not establish a link after the
    /// configured number of backoff attempts.
    #[error("connection to {device} failed after {attempts} attempts: {reason}")]
    ConnectionFailure {
        /// The remote device code that could not be reached.
        device: DeviceId,
        /// How many dial attempts were made before giving up.
        attempts: u32,
        /// Last transport-level failure, for logs.
        reason: String,
    },

    /// The ephemeral device code is already registered at the rendezvous.
    ///
    /// Handled internally by regenerating the code and retrying once; only
    /// surfaced if the retry collides again.
    #[error("device code {code} already taken at the rendezvous")]
    IdentifierCollision {
        /// The colliding code.
        code: DeviceId,
    },

    /// The requested image is not held by any reachable peer.
    #[error("image {image} unavailable from all connected peers")]
    AssetUnavailable {
        /// The image that could not be fetched.
        image: EntityId,
    },

    /// Legacy import failed partway. The migration marker is left unset so
    /// the import is retried on next start; source records are untouched.
    #[error("legacy migration failed: {0}")]
    MigrationFailure(String),

    /// A durable write failed. Fatal to that flush attempt only; the batch
    /// is retried on the next flush cycle.
    #[error("durable write failed: {0}")]
    PersistenceFailure(String),

    /// The cooperative access policy rejected a local write.
    #[error("not permitted: {0}")]
    PolicyViolation(String),

    /// An invite payload did not match either accepted form.
    #[error("invalid invite: {0}")]
    InvalidInvite(String),

    /// A bounded wait elapsed.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}
