//! Write-coalescing bridge between the document and the store.
//!
//! Local commits and remote merges mark ops dirty; a background worker
//! drains the queue on a debounce interval and writes one transaction per
//! batch. The acceptable recovery point is "last successful flush" — a
//! failed flush keeps its batch and retries on the next cycle, and abrupt
//! termination loses at most the in-flight batch.
//!
//! One worker per account serializes all flushes for that account.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::doc::Document;
use crate::error::SyncError;
use crate::model::id::DeviceId;
use crate::op::Op;
use crate::store::Store;

enum Cmd {
    Dirty(Vec<Op>),
    Flush(SyncSender<Result<(), String>>),
    RememberPeer(DeviceId, i64),
    MarkMigrationComplete(SyncSender<Result<(), String>>),
    Shutdown,
}

/// Cloneable handle for enqueueing work from link threads.
#[derive(Clone)]
pub struct BridgeHandle {
    tx: Sender<Cmd>,
}

impl BridgeHandle {
    /// Queue ops for the next flush cycle.
    pub fn mark_dirty(&self, ops: Vec<Op>) {
        if ops.is_empty() {
            return;
        }
        if self.tx.send(Cmd::Dirty(ops)).is_err() {
            warn!("store bridge is gone; dropping dirty ops for this session");
        }
    }

    /// Record a peer device code for reconnect convenience.
    pub fn remember_peer(&self, device: &DeviceId, last_seen_us: i64) {
        let _ = self.tx.send(Cmd::RememberPeer(device.clone(), last_seen_us));
    }
}

/// The store worker: owns the connection, serializes flushes per account.
pub struct StoreBridge {
    tx: Sender<Cmd>,
    worker: Option<JoinHandle<()>>,
}

impl StoreBridge {
    /// Spawn the flush worker.
    #[must_use]
    pub fn spawn(store: Store, doc: Arc<Mutex<Document>>, debounce: Duration) -> Self {
        let (tx, rx) = mpsc::channel();
        let worker = std::thread::Builder::new()
            .name("tally-store-bridge".to_string())
            .spawn(move || run_worker(store, &doc, &rx, debounce))
            .ok();
        if worker.is_none() {
            error!("failed to spawn store bridge worker; persistence disabled");
        }
        Self { tx, worker }
    }

    /// A cloneable handle for other threads.
    #[must_use]
    pub fn handle(&self) -> BridgeHandle {
        BridgeHandle {
            tx: self.tx.clone(),
        }
    }

    /// Queue ops for the next flush cycle.
    pub fn mark_dirty(&self, ops: Vec<Op>) {
        self.handle().mark_dirty(ops);
    }

    /// Force a flush of everything queued so far and wait for the result.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::PersistenceFailure`] if the write failed, or
    /// [`SyncError::Timeout`] if the worker did not answer in time.
    pub fn flush(&self, timeout: Duration) -> Result<(), SyncError> {
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        self.tx
            .send(Cmd::Flush(ack_tx))
            .map_err(|_| SyncError::PersistenceFailure("store bridge is gone".to_string()))?;
        match ack_rx.recv_timeout(timeout) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(SyncError::PersistenceFailure(reason)),
            Err(_) => Err(SyncError::Timeout(timeout)),
        }
    }

    /// Flush, then persist the migration-complete marker.
    ///
    /// The marker is written only after the flush succeeds, so an
    /// interrupted migration is retried on next start.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MigrationFailure`] if either step fails.
    pub fn mark_migration_complete(&self, timeout: Duration) -> Result<(), SyncError> {
        self.flush(timeout)
            .map_err(|err| SyncError::MigrationFailure(err.to_string()))?;
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        self.tx
            .send(Cmd::MarkMigrationComplete(ack_tx))
            .map_err(|_| SyncError::MigrationFailure("store bridge is gone".to_string()))?;
        match ack_rx.recv_timeout(timeout) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(SyncError::MigrationFailure(reason)),
            Err(_) => Err(SyncError::MigrationFailure(format!(
                "marker write timed out after {timeout:?}"
            ))),
        }
    }

    /// Flush remaining work and stop the worker. Idempotent.
    pub fn close(&mut self) {
        let _ = self.tx.send(Cmd::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for StoreBridge {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_worker(
    mut store: Store,
    doc: &Arc<Mutex<Document>>,
    rx: &Receiver<Cmd>,
    debounce: Duration,
) {
    let mut dirty: Vec<Op> = Vec::new();
    loop {
        match rx.recv_timeout(debounce) {
            Ok(Cmd::Dirty(ops)) => dirty.extend(ops),
            Ok(Cmd::Flush(ack)) => {
                let result = write_batch(&mut store, doc, &mut dirty);
                let _ = ack.send(result);
            }
            Ok(Cmd::RememberPeer(device, last_seen_us)) => {
                if let Err(err) = store.remember_peer(&device, last_seen_us) {
                    warn!(%device, %err, "failed to remember peer");
                }
            }
            Ok(Cmd::MarkMigrationComplete(ack)) => {
                let result = write_batch(&mut store, doc, &mut dirty).and_then(|()| {
                    store
                        .set_migration_complete()
                        .map_err(|err| err.to_string())
                });
                let _ = ack.send(result);
            }
            Ok(Cmd::Shutdown) => {
                if let Err(err) = write_batch(&mut store, doc, &mut dirty) {
                    error!(%err, "final flush failed; losing last in-flight batch");
                }
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                if !dirty.is_empty() {
                    if let Err(err) = write_batch(&mut store, doc, &mut dirty) {
                        // Recoverable: the batch is retained and retried.
                        warn!(%err, queued = dirty.len(), "flush failed; will retry");
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = write_batch(&mut store, doc, &mut dirty);
                break;
            }
        }
    }
    debug!("store bridge worker stopped");
}

/// Write the queued batch in one transaction. On success the queue is
/// cleared; on failure it is kept for retry.
fn write_batch(
    store: &mut Store,
    doc: &Arc<Mutex<Document>>,
    dirty: &mut Vec<Op>,
) -> Result<(), String> {
    if dirty.is_empty() {
        return Ok(());
    }
    let result = {
        let doc = doc.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        store.persist_ops(dirty, &doc)
    };
    match result {
        Ok(()) => {
            debug!(count = dirty.len(), "flushed op batch");
            dirty.clear();
            Ok(())
        }
        Err(err) => Err(err.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::Change;
    use crate::model::entity::Person;
    use crate::model::id::{AccountId, EntityId};
    use crate::op::EntityKind;
    use std::collections::BTreeMap;

    fn aid() -> AccountId {
        AccountId::new_unchecked("000000000000000000000000000000aa")
    }

    fn dev(code: &str) -> DeviceId {
        DeviceId::new_unchecked(code)
    }

    #[test]
    fn dirty_ops_survive_flush_and_reload() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("tally.sqlite3");

        let store = Store::open(&path, &aid()).expect("open store");
        let doc = Arc::new(Mutex::new(Document::new(aid(), dev("A2B3C4"))));
        let mut bridge = StoreBridge::spawn(store, Arc::clone(&doc), Duration::from_millis(10));

        let op = {
            let mut doc = doc.lock().expect("lock");
            let alice = Person {
                id: EntityId::new_unchecked(&format!("{:032x}", 1)),
                name: "Alice".to_string(),
                claimed_by: None,
                created_at_us: 1,
                extra: BTreeMap::new(),
            };
            doc.commit(
                Change::insert(EntityKind::Person, alice.id.clone(), &alice).expect("change"),
                1,
            )
        };
        bridge.mark_dirty(vec![op]);
        bridge.flush(Duration::from_secs(5)).expect("flush");
        bridge.close();

        let store = Store::open(&path, &aid()).expect("reopen store");
        let restored = store.load_document(dev("A2B3C4")).expect("load");
        assert_eq!(restored.people().len(), 1);
    }

    #[test]
    fn flush_with_empty_queue_is_ok() {
        let store = Store::open_in_memory(&aid()).expect("open store");
        let doc = Arc::new(Mutex::new(Document::new(aid(), dev("A2B3C4"))));
        let mut bridge = StoreBridge::spawn(store, doc, Duration::from_millis(10));
        bridge.flush(Duration::from_secs(5)).expect("flush");
        bridge.close();
    }

    #[test]
    fn migration_marker_is_set_after_flush() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("tally.sqlite3");

        let store = Store::open(&path, &aid()).expect("open store");
        let doc = Arc::new(Mutex::new(Document::new(aid(), dev("A2B3C4"))));
        let mut bridge = StoreBridge::spawn(store, doc, Duration::from_millis(10));
        bridge
            .mark_migration_complete(Duration::from_secs(5))
            .expect("mark complete");
        bridge.close();

        let store = Store::open(&path, &aid()).expect("reopen store");
        assert!(store.migration_complete().expect("read marker"));
    }
}
