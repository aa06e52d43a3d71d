//! The session: one account, one device, one document.
//!
//! A [`Session`] is an explicitly constructed context object — no module
//! globals, no hidden singletons — that owns the shared document, the
//! store bridge, the peer-link registry, presence, and the asset exchange.
//! The UI layer drives it through a handful of calls:
//! [`Session::connect`], [`Session::disconnect`],
//! [`Session::broadcast_local_change`], [`Session::request_asset`],
//! [`Session::current_presence`], and [`Session::close`]. Multi-account
//! apps hold one session per account; nothing is shared between them.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use rand::rngs::OsRng;
use tracing::{debug, info, warn};

use tally_core::clock::{SystemClock, WallClock};
use tally_core::doc::{Change, DocEvent, Document};
use tally_core::error::SyncError;
use tally_core::migrate::{self, LegacyRecords, MigrationReport};
use tally_core::model::entity::{Account, AccountMode};
use tally_core::model::id::{DeviceId, EntityId};
use tally_core::op::Op;
use tally_core::policy;
use tally_core::store::bridge::StoreBridge;
use tally_core::store::{BlobStore, MemoryBlobStore, SqliteBlobStore, Store};

use crate::assets::AssetExchange;
use crate::config::SessionConfig;
use crate::invite::Invite;
use crate::link::{self, Link, LinkCtx};
use crate::presence::{PresenceEntry, PresenceMap, PresenceState};
use crate::transport::{SignalError, Signaling};
use crate::wire::WireMessage;

/// Everything needed to open a session.
pub struct SessionParams {
    /// The account to open.
    pub account: Account,
    /// Fixed device code; `None` generates a fresh one.
    pub device: Option<DeviceId>,
    /// Store location; `None` keeps everything in memory (tests,
    /// ephemeral sessions).
    pub store_path: Option<PathBuf>,
    /// Rendezvous capability.
    pub signaling: Arc<dyn Signaling>,
    /// Display name broadcast to peers.
    pub display_name: String,
    /// Display color broadcast to peers.
    pub display_color: String,
    /// Tuning knobs.
    pub config: SessionConfig,
    /// Wall clock; `None` uses the system clock.
    pub wall: Option<Arc<dyn WallClock>>,
}

/// A live sync session for one account on one device.
pub struct Session {
    account: Account,
    device: DeviceId,
    doc: Arc<Mutex<Document>>,
    bridge: StoreBridge,
    blobs: Arc<dyn BlobStore>,
    signaling: Arc<dyn Signaling>,
    presence: Arc<PresenceMap>,
    own_presence: Arc<Mutex<PresenceState>>,
    assets: Arc<AssetExchange>,
    links: Arc<Mutex<BTreeMap<DeviceId, Link>>>,
    remembered: Mutex<Vec<DeviceId>>,
    migrated: AtomicBool,
    wall: Arc<dyn WallClock>,
    config: SessionConfig,
    shutdown: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl Session {
    /// Open a session: restore the document from the store, register at
    /// the rendezvous, and start accepting inbound links.
    ///
    /// A device-code collision at the rendezvous is handled by
    /// regenerating the code and retrying once, transparently; if this
    /// session is the account host, the account's recorded host device
    /// follows the regenerated code.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::PersistenceFailure`] if the store cannot be
    /// opened, or [`SyncError::IdentifierCollision`] if even the
    /// regenerated code collides.
    pub fn open(params: SessionParams) -> Result<Self, SyncError> {
        let SessionParams {
            mut account,
            device,
            store_path,
            signaling,
            display_name,
            display_color,
            config,
            wall,
        } = params;
        let wall = wall.unwrap_or_else(|| Arc::new(SystemClock));

        // Claim a device code, regenerating once on collision.
        let initial = device.unwrap_or_else(|| DeviceId::generate(&mut OsRng));
        let device = match signaling.register(&initial) {
            Ok(()) => initial,
            Err(SignalError::CodeTaken) => {
                let regenerated = DeviceId::generate(&mut OsRng);
                debug!(old = %initial, new = %regenerated, "device code collision; regenerated");
                match signaling.register(&regenerated) {
                    Ok(()) => {
                        if account.host_device.as_ref() == Some(&initial) {
                            account.host_device = Some(regenerated.clone());
                        }
                        regenerated
                    }
                    Err(_) => return Err(SyncError::IdentifierCollision { code: regenerated }),
                }
            }
            Err(err) => {
                return Err(SyncError::ConnectionFailure {
                    device: initial,
                    attempts: 1,
                    reason: err.to_string(),
                });
            }
        };

        // Restore local history before any peer connects.
        let (store, blobs): (Store, Arc<dyn BlobStore>) = match &store_path {
            Some(path) => {
                let store = Store::open(path, &account.id)
                    .map_err(|err| SyncError::PersistenceFailure(err.to_string()))?;
                let blobs = SqliteBlobStore::open(path, &account.id)
                    .map_err(|err| SyncError::PersistenceFailure(err.to_string()))?;
                (store, Arc::new(blobs))
            }
            None => {
                let store = Store::open_in_memory(&account.id)
                    .map_err(|err| SyncError::PersistenceFailure(err.to_string()))?;
                (store, Arc::new(MemoryBlobStore::new()))
            }
        };
        let migrated = store
            .migration_complete()
            .map_err(|err| SyncError::PersistenceFailure(err.to_string()))?;
        let remembered = store
            .remembered_peers()
            .unwrap_or_else(|err| {
                warn!(%err, "could not read remembered peers");
                Vec::new()
            });
        let doc = store
            .load_document(device.clone())
            .map_err(|err| SyncError::PersistenceFailure(err.to_string()))?;
        let doc = Arc::new(Mutex::new(doc));
        let bridge = StoreBridge::spawn(store, Arc::clone(&doc), config.flush_debounce());

        let own_presence = Arc::new(Mutex::new(PresenceState {
            device: device.clone(),
            name: display_name,
            color: display_color,
        }));

        let mut session = Self {
            account,
            device,
            doc,
            bridge,
            blobs,
            signaling,
            presence: Arc::new(PresenceMap::new()),
            own_presence,
            assets: Arc::new(AssetExchange::new()),
            links: Arc::new(Mutex::new(BTreeMap::new())),
            remembered: Mutex::new(remembered),
            migrated: AtomicBool::new(migrated),
            wall,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            acceptor: None,
        };
        session.spawn_acceptor();
        info!(device = %session.device, account = %session.account.id, "session open");
        Ok(session)
    }

    fn ctx(&self) -> LinkCtx {
        LinkCtx {
            account: self.account.id.clone(),
            device: self.device.clone(),
            doc: Arc::clone(&self.doc),
            bridge: self.bridge.handle(),
            presence: Arc::clone(&self.presence),
            own_presence: Arc::clone(&self.own_presence),
            assets: Arc::clone(&self.assets),
            blobs: Arc::clone(&self.blobs),
            wall: Arc::clone(&self.wall),
            config: self.config.clone(),
        }
    }

    fn spawn_acceptor(&mut self) {
        if self.account.mode != AccountMode::Shared {
            return;
        }
        let ctx = self.ctx();
        let signaling = Arc::clone(&self.signaling);
        let shutdown = Arc::clone(&self.shutdown);
        let links = Arc::clone(&self.links);
        let device = self.device.clone();
        self.acceptor = std::thread::Builder::new()
            .name("tally-acceptor".to_string())
            .spawn(move || {
                let poll = ctx.config.idle_recv();
                while !shutdown.load(Ordering::SeqCst) {
                    match signaling.accept(&device, poll) {
                        Ok(incoming) => {
                            let peer = incoming.peer.clone();
                            match link::accept(&ctx, incoming) {
                                Ok(link) => {
                                    let mut links = lock(&links);
                                    links.insert(link.peer().clone(), link);
                                }
                                Err(err) => {
                                    warn!(%peer, %err, "inbound link failed");
                                }
                            }
                        }
                        Err(SignalError::Timeout) => {}
                        Err(_) => break,
                    }
                }
            })
            .ok();
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// This session's device code.
    #[must_use]
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// The account, including any host-device regeneration.
    #[must_use]
    pub fn account(&self) -> &Account {
        &self.account
    }

    /// The invite peers use to join this account (host side).
    #[must_use]
    pub fn invite(&self) -> Invite {
        Invite {
            account: self.account.id.clone(),
            host: self
                .account
                .host_device
                .clone()
                .unwrap_or_else(|| self.device.clone()),
            name: self.account.name.clone(),
        }
    }

    /// Run a closure against the merged document.
    pub fn with_document<R>(&self, f: impl FnOnce(&Document) -> R) -> R {
        let doc = lock(&self.doc);
        f(&doc)
    }

    /// Subscribe to document change notifications.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<DocEvent> {
        let mut doc = lock(&self.doc);
        doc.subscribe()
    }

    /// Previously-seen peer device codes, most recent first.
    #[must_use]
    pub fn remembered_peers(&self) -> Vec<DeviceId> {
        lock(&self.remembered).clone()
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    /// Connect to a peer device.
    ///
    /// # Errors
    ///
    /// [`SyncError::PolicyViolation`] for single-mode accounts, or
    /// [`SyncError::ConnectionFailure`] after the configured attempts.
    pub fn connect(&self, peer: &DeviceId) -> Result<(), SyncError> {
        if self.account.mode != AccountMode::Shared {
            return Err(SyncError::PolicyViolation(
                "single-mode accounts do not sync".to_string(),
            ));
        }
        if *peer == self.device {
            return Err(SyncError::PolicyViolation(
                "cannot connect to self".to_string(),
            ));
        }
        {
            let links = lock(&self.links);
            if links.get(peer).is_some_and(Link::is_live) {
                debug!(%peer, "already connected");
                return Ok(());
            }
        }

        let link = link::connect(&self.ctx(), self.signaling.as_ref(), peer)?;
        {
            let mut remembered = lock(&self.remembered);
            remembered.retain(|d| d != peer);
            remembered.insert(0, peer.clone());
        }
        let mut links = lock(&self.links);
        links.insert(link.peer().clone(), link);
        Ok(())
    }

    /// Join via an invite: validate the account and dial the host.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidInvite`] if the invite is for another account,
    /// otherwise as [`Session::connect`].
    pub fn connect_invite(&self, invite: &Invite) -> Result<(), SyncError> {
        if invite.account != self.account.id {
            return Err(SyncError::InvalidInvite(format!(
                "invite is for account {}, this session syncs {}",
                invite.account, self.account.id
            )));
        }
        self.connect(&invite.host)
    }

    /// Disconnect from a peer. In-flight asset requests over this link are
    /// cancelled; other links are unaffected.
    pub fn disconnect(&self, peer: &DeviceId) {
        let link = {
            let mut links = lock(&self.links);
            links.remove(peer)
        };
        if let Some(mut link) = link {
            link.shutdown();
        }
        self.presence.remove(peer);
        self.assets.cancel_link(peer);
    }

    /// Devices with a live link right now.
    #[must_use]
    pub fn connected_peers(&self) -> Vec<DeviceId> {
        let mut links = lock(&self.links);
        links.retain(|_, link| link.state() != crate::link::LinkState::Closed);
        links
            .values()
            .filter(|link| link.is_live())
            .map(|link| link.peer().clone())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Commit a local change and fan the op out to every connected peer.
    ///
    /// The change is policy-checked, applied to the document, queued for
    /// the next store flush, and broadcast. Peers that are unreachable
    /// right now catch up through their next hello exchange.
    ///
    /// # Errors
    ///
    /// [`SyncError::PolicyViolation`] if this device may not perform the
    /// change (§ access policy); the document is untouched in that case.
    pub fn broadcast_local_change(&self, change: Change) -> Result<Op, SyncError> {
        policy::check_local(&self.account, &self.device, &change)?;
        let op = {
            let mut doc = lock(&self.doc);
            doc.commit(change, self.wall.now_us())
        };
        self.bridge.mark_dirty(vec![op.clone()]);
        self.broadcast(&WireMessage::Ops {
            ops: vec![op.clone()],
        });
        Ok(op)
    }

    /// Update this device's display identity and broadcast it.
    pub fn set_presence(&self, name: &str, color: &str) {
        let state = {
            let mut own = lock(&self.own_presence);
            own.name = name.to_string();
            own.color = color.to_string();
            own.clone()
        };
        self.broadcast(&WireMessage::Presence { state });
    }

    fn broadcast(&self, msg: &WireMessage) {
        let channels: Vec<_> = {
            let links = lock(&self.links);
            links
                .values()
                .filter(|link| link.is_live())
                .map(|link| (link.peer().clone(), link.channel()))
                .collect()
        };
        for (peer, channel) in channels {
            if channel.send(msg).is_err() {
                debug!(%peer, "broadcast skipped a dead link");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Assets
    // -----------------------------------------------------------------------

    /// Store a receipt image locally so peers can request it.
    ///
    /// # Errors
    ///
    /// [`SyncError::PersistenceFailure`] on a blob-store failure.
    pub fn put_asset(&self, image_id: &EntityId, bytes: &[u8]) -> Result<(), SyncError> {
        self.blobs
            .put(image_id, bytes)
            .map_err(|err| SyncError::PersistenceFailure(err.to_string()))
    }

    /// Fetch a receipt image: local store first, then each connected peer
    /// in turn with a bounded wait.
    ///
    /// # Errors
    ///
    /// [`SyncError::AssetUnavailable`] when no reachable peer holds it.
    pub fn request_asset(&self, image_id: &EntityId) -> Result<Vec<u8>, SyncError> {
        if let Ok(Some(bytes)) = self.blobs.get(image_id) {
            return Ok(bytes);
        }
        let peers: Vec<_> = {
            let links = lock(&self.links);
            links
                .values()
                .filter(|link| link.is_live())
                .map(|link| (link.peer().clone(), link.channel()))
                .collect()
        };
        self.assets
            .request(&peers, image_id, &self.config, self.blobs.as_ref())
    }

    // -----------------------------------------------------------------------
    // Presence
    // -----------------------------------------------------------------------

    /// Current presence: this device first, then connected peers.
    #[must_use]
    pub fn current_presence(&self) -> Vec<PresenceEntry> {
        let own = PresenceEntry {
            state: lock(&self.own_presence).clone(),
            last_seen_us: self.wall.now_us(),
        };
        let mut entries = vec![own];
        entries.extend(self.presence.snapshot());
        entries
    }

    // -----------------------------------------------------------------------
    // Migration
    // -----------------------------------------------------------------------

    /// Import legacy pre-CRDT records, once per device.
    ///
    /// Safe to call on every launch: after the first success the persisted
    /// marker short-circuits. Partial failure leaves the marker unset and
    /// the next call retries; duplicates join idempotently.
    ///
    /// # Errors
    ///
    /// [`SyncError::MigrationFailure`] if the flush or marker write fails.
    pub fn migrate_legacy(&self, records: &LegacyRecords) -> Result<MigrationReport, SyncError> {
        if self.migrated.load(Ordering::SeqCst) {
            return Ok(MigrationReport {
                already_complete: true,
                ..MigrationReport::default()
            });
        }
        let (ops, report) = {
            let mut doc = lock(&self.doc);
            migrate::import_into(&mut doc, records, self.wall.now_us())
        };
        self.bridge.mark_dirty(ops.clone());
        self.bridge
            .mark_migration_complete(self.config.flush_timeout())?;
        self.migrated.store(true, Ordering::SeqCst);
        self.broadcast(&WireMessage::Ops { ops });
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Force a store flush and wait for it.
    ///
    /// # Errors
    ///
    /// [`SyncError::PersistenceFailure`] or [`SyncError::Timeout`].
    pub fn flush(&self) -> Result<(), SyncError> {
        self.bridge.flush(self.config.flush_timeout())
    }

    /// Tear the session down: say goodbye to peers, stop accepting, flush
    /// the store, and release the device code.
    pub fn close(mut self) {
        info!(device = %self.device, "session closing");
        self.shutdown.store(true, Ordering::SeqCst);

        let links = {
            let mut links = lock(&self.links);
            std::mem::take(&mut *links)
        };
        for (_, mut link) in links {
            link.shutdown();
        }
        self.signaling.unregister(&self.device);
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
        if let Err(err) = self.bridge.flush(self.config.flush_timeout()) {
            warn!(%err, "final flush failed; last batch may be lost");
        }
        self.bridge.close();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
