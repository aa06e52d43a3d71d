//! Lazy receipt-image transfer.
//!
//! Images are referenced by identifier from expenses but never embedded in
//! the replicated document — that would bloat every device's copy whether
//! or not it ever looks at the receipt. Instead the requester asks
//! connected peers one at a time and waits a bounded interval per peer;
//! exhausting all peers surfaces as "unavailable", never a hang.
//!
//! Responses are idempotent: a late answer for an image the requester no
//! longer waits on (timed out, expense deleted meanwhile) is safe to store
//! or to discard — image identifiers are content-unique.

use std::collections::HashMap;
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use tally_core::error::SyncError;
use tally_core::model::id::{DeviceId, EntityId};
use tally_core::store::BlobStore;

use crate::config::SessionConfig;
use crate::transport::PeerChannel;
use crate::wire::WireMessage;

/// Tracks in-flight image requests so link receive loops can route
/// responses back to the waiting caller.
#[derive(Default)]
pub struct AssetExchange {
    pending: Mutex<HashMap<(DeviceId, EntityId), SyncSender<Option<Vec<u8>>>>>,
}

impl AssetExchange {
    /// Create an empty exchange.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch an image from the given peers, trying each in turn.
    ///
    /// The local blob store is filled on success so the next request is
    /// answered locally.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::AssetUnavailable`] once every peer has
    /// answered "not held" or timed out.
    pub fn request(
        &self,
        peers: &[(DeviceId, Arc<dyn PeerChannel>)],
        image_id: &EntityId,
        config: &SessionConfig,
        blobs: &dyn BlobStore,
    ) -> Result<Vec<u8>, SyncError> {
        for (peer, channel) in peers {
            let (tx, rx) = mpsc::sync_channel(1);
            self.insert_pending(peer, image_id, tx);

            let sent = channel.send(&WireMessage::ImageRequest {
                image_id: image_id.clone(),
            });
            if sent.is_err() {
                self.take_pending(peer, image_id);
                continue;
            }

            let answer = rx.recv_timeout(config.asset_timeout());
            self.take_pending(peer, image_id);
            match answer {
                Ok(Some(bytes)) => {
                    if let Err(err) = blobs.put(image_id, &bytes) {
                        warn!(%image_id, %err, "fetched image could not be cached");
                    }
                    return Ok(bytes);
                }
                Ok(None) => {
                    debug!(%peer, %image_id, "peer does not hold image");
                }
                Err(_) => {
                    debug!(%peer, %image_id, "image request timed out or was cancelled");
                }
            }
        }
        Err(SyncError::AssetUnavailable {
            image: image_id.clone(),
        })
    }

    /// Route a response from a link's receive loop to its waiter.
    ///
    /// Returns `true` if a caller was waiting for it.
    pub fn resolve(&self, peer: &DeviceId, image_id: &EntityId, bytes: Option<Vec<u8>>) -> bool {
        match self.take_pending(peer, image_id) {
            Some(tx) => tx.send(bytes).is_ok(),
            None => false,
        }
    }

    /// Cancel every in-flight request routed over a closing link.
    ///
    /// Waiters receive "not held" and move on to their next peer; requests
    /// on other links are unaffected.
    pub fn cancel_link(&self, peer: &DeviceId) {
        let cancelled: Vec<SyncSender<Option<Vec<u8>>>> = {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let keys: Vec<(DeviceId, EntityId)> = pending
                .keys()
                .filter(|(device, _)| device == peer)
                .cloned()
                .collect();
            keys.into_iter().filter_map(|key| pending.remove(&key)).collect()
        };
        for tx in cancelled {
            let _ = tx.send(None);
        }
    }

    fn insert_pending(
        &self,
        peer: &DeviceId,
        image_id: &EntityId,
        tx: SyncSender<Option<Vec<u8>>>,
    ) {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        pending.insert((peer.clone(), image_id.clone()), tx);
    }

    fn take_pending(
        &self,
        peer: &DeviceId,
        image_id: &EntityId,
    ) -> Option<SyncSender<Option<Vec<u8>>>> {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        pending.remove(&(peer.clone(), image_id.clone()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
