//! Per-peer link: state machine, handshake, and receive loop.
//!
//! One [`Link`] per remote device. States follow
//! `Idle → Connecting → Open → (Syncing) → Open → Closed`, with
//! `Connecting → Failed → Idle` on error. The handshake is symmetric:
//! both sides send a hello carrying their state vector, then push the ops
//! the other side is missing; afterwards the receive loop applies whatever
//! arrives. All merges funnel into the shared document's serialized apply,
//! so merge order across links cannot affect the final state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use tally_core::clock::WallClock;
use tally_core::doc::Document;
use tally_core::error::SyncError;
use tally_core::model::id::{AccountId, DeviceId};
use tally_core::store::{bridge::BridgeHandle, BlobStore};

use crate::assets::AssetExchange;
use crate::config::SessionConfig;
use crate::presence::{PresenceMap, PresenceState};
use crate::transport::{ChannelError, IncomingConn, PeerChannel, Signaling};
use crate::wire::{Hello, WireMessage};

/// Link lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not connected.
    Idle,
    /// Dialing / handshaking.
    Connecting,
    /// Connected, receive loop running.
    Open,
    /// Applying a batch from the peer.
    Syncing,
    /// Connection attempt gave up.
    Failed,
    /// Link torn down.
    Closed,
}

/// Everything a link needs from its session.
#[derive(Clone)]
pub(crate) struct LinkCtx {
    pub account: AccountId,
    pub device: DeviceId,
    pub doc: Arc<Mutex<Document>>,
    pub bridge: BridgeHandle,
    pub presence: Arc<PresenceMap>,
    pub own_presence: Arc<Mutex<PresenceState>>,
    pub assets: Arc<AssetExchange>,
    pub blobs: Arc<dyn BlobStore>,
    pub wall: Arc<dyn WallClock>,
    pub config: SessionConfig,
}

impl LinkCtx {
    fn hello(&self) -> WireMessage {
        let state = {
            let doc = lock(&self.doc);
            doc.state_vector().clone()
        };
        let presence = lock(&self.own_presence).clone();
        WireMessage::Hello(Hello {
            device: self.device.clone(),
            account: self.account.clone(),
            state,
            presence,
        })
    }
}

/// A live (or finished) link to one peer.
pub struct Link {
    peer: DeviceId,
    channel: Arc<dyn PeerChannel>,
    state: Arc<Mutex<LinkState>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Link {
    /// The remote device.
    #[must_use]
    pub fn peer(&self) -> &DeviceId {
        &self.peer
    }

    /// The underlying channel (for broadcasts and asset requests).
    #[must_use]
    pub fn channel(&self) -> Arc<dyn PeerChannel> {
        Arc::clone(&self.channel)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        *lock(&self.state)
    }

    /// Whether the receive loop is still running.
    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(self.state(), LinkState::Open | LinkState::Syncing)
    }

    /// Tear the link down: best-effort goodbye, close, join the loop.
    pub(crate) fn shutdown(&mut self) {
        let _ = self.channel.send(&WireMessage::Bye);
        self.stop.store(true, Ordering::SeqCst);
        self.channel.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        *lock(&self.state) = LinkState::Closed;
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Establishment
// ---------------------------------------------------------------------------

/// Dial a peer with backoff and run the handshake.
pub(crate) fn connect(
    ctx: &LinkCtx,
    signaling: &dyn Signaling,
    peer: &DeviceId,
) -> Result<Link, SyncError> {
    debug!(%peer, "link: idle -> connecting");
    let attempts = ctx.config.connect_attempts.max(1);
    let mut last_failure = String::new();
    for attempt in 1..=attempts {
        match signaling.dial(&ctx.device, peer, ctx.config.hello_timeout()) {
            Ok(channel) => return handshake(ctx, peer.clone(), channel),
            Err(err) => {
                last_failure = err.to_string();
                debug!(%peer, attempt, %last_failure, "dial failed");
                if attempt < attempts {
                    std::thread::sleep(ctx.config.backoff(attempt));
                }
            }
        }
    }
    debug!(%peer, "link: connecting -> failed -> idle");
    Err(SyncError::ConnectionFailure {
        device: peer.clone(),
        attempts,
        reason: last_failure,
    })
}

/// Run the handshake on an inbound connection.
pub(crate) fn accept(ctx: &LinkCtx, incoming: IncomingConn) -> Result<Link, SyncError> {
    handshake(ctx, incoming.peer, incoming.channel)
}

/// Symmetric hello exchange, initial delta push, and loop spawn.
fn handshake(
    ctx: &LinkCtx,
    peer: DeviceId,
    channel: Arc<dyn PeerChannel>,
) -> Result<Link, SyncError> {
    channel.send(&ctx.hello()).map_err(|err| {
        channel.close();
        SyncError::ConnectionFailure {
            device: peer.clone(),
            attempts: 1,
            reason: err.to_string(),
        }
    })?;

    let remote = match await_hello(ctx, &peer, &channel) {
        Ok(remote) => remote,
        Err(err) => {
            channel.close();
            return Err(err);
        }
    };
    if remote.account != ctx.account {
        channel.close();
        return Err(SyncError::ConnectionFailure {
            device: peer,
            attempts: 1,
            reason: "peer is syncing a different account".to_string(),
        });
    }
    // The hello is authoritative for the peer's identity.
    let peer = remote.device.clone();
    let now_us = ctx.wall.now_us();
    ctx.presence.update(remote.presence, now_us);
    ctx.bridge.remember_peer(&peer, now_us);

    // Initial sync: push everything the peer has not seen.
    let delta = {
        let doc = lock(&ctx.doc);
        doc.ops_since(&remote.state)
    };
    debug!(%peer, count = delta.len(), "link: syncing initial delta");
    channel.send(&WireMessage::Ops { ops: delta }).map_err(|err| {
        channel.close();
        SyncError::ConnectionFailure {
            device: peer.clone(),
            attempts: 1,
            reason: err.to_string(),
        }
    })?;

    let state = Arc::new(Mutex::new(LinkState::Open));
    let stop = Arc::new(AtomicBool::new(false));
    let thread = {
        let ctx = ctx.clone();
        let peer = peer.clone();
        let channel = Arc::clone(&channel);
        let state = Arc::clone(&state);
        let stop = Arc::clone(&stop);
        std::thread::Builder::new()
            .name(format!("tally-link-{peer}"))
            .spawn(move || run_loop(&ctx, &peer, &channel, &state, &stop))
            .ok()
    };
    if thread.is_none() {
        channel.close();
        return Err(SyncError::ConnectionFailure {
            device: peer,
            attempts: 1,
            reason: "could not spawn link thread".to_string(),
        });
    }
    info!(%peer, "link open");
    Ok(Link {
        peer,
        channel,
        state,
        stop,
        thread,
    })
}

/// Wait for the peer's hello, tolerating early non-hello chatter.
fn await_hello(
    ctx: &LinkCtx,
    peer: &DeviceId,
    channel: &Arc<dyn PeerChannel>,
) -> Result<Hello, SyncError> {
    let timeout = ctx.config.hello_timeout();
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining == Duration::ZERO {
            return Err(SyncError::Timeout(timeout));
        }
        match channel.recv_timeout(remaining) {
            Ok(WireMessage::Hello(hello)) => return Ok(hello),
            Ok(other) => {
                debug!(%peer, kind = ?message_kind(&other), "skipping pre-hello message");
            }
            Err(ChannelError::Timeout) => return Err(SyncError::Timeout(timeout)),
            Err(ChannelError::Closed) => {
                return Err(SyncError::ConnectionFailure {
                    device: peer.clone(),
                    attempts: 1,
                    reason: "channel closed during handshake".to_string(),
                });
            }
            Err(ChannelError::Malformed(reason)) => {
                warn!(%peer, %reason, "malformed frame during handshake");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Receive loop
// ---------------------------------------------------------------------------

enum Flow {
    Continue,
    Stop,
}

fn run_loop(
    ctx: &LinkCtx,
    peer: &DeviceId,
    channel: &Arc<dyn PeerChannel>,
    state: &Arc<Mutex<LinkState>>,
    stop: &Arc<AtomicBool>,
) {
    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match channel.recv_timeout(ctx.config.idle_recv()) {
            Ok(msg) => {
                if matches!(handle(ctx, peer, channel, state, msg), Flow::Stop) {
                    break;
                }
            }
            Err(ChannelError::Timeout) => {}
            Err(ChannelError::Closed) => break,
            Err(ChannelError::Malformed(reason)) => {
                warn!(%peer, %reason, "dropping malformed frame");
            }
        }
    }

    // Teardown: presence decays, in-flight asset requests over this link
    // are cancelled, requests to other peers are untouched.
    ctx.presence.remove(peer);
    ctx.assets.cancel_link(peer);
    channel.close();
    *lock(state) = LinkState::Closed;
    info!(%peer, "link closed");
}

fn handle(
    ctx: &LinkCtx,
    peer: &DeviceId,
    channel: &Arc<dyn PeerChannel>,
    state: &Arc<Mutex<LinkState>>,
    msg: WireMessage,
) -> Flow {
    match msg {
        WireMessage::Hello(hello) => {
            // Re-sync request mid-stream: answer with a fresh delta.
            ctx.presence.update(hello.presence, ctx.wall.now_us());
            let delta = {
                let doc = lock(&ctx.doc);
                doc.ops_since(&hello.state)
            };
            debug!(%peer, count = delta.len(), "re-sync requested");
            if channel.send(&WireMessage::Ops { ops: delta }).is_err() {
                return Flow::Stop;
            }
            Flow::Continue
        }
        WireMessage::Ops { ops } => {
            *lock(state) = LinkState::Syncing;
            {
                let mut doc = lock(&ctx.doc);
                for op in &ops {
                    doc.apply(op);
                }
            }
            debug!(%peer, count = ops.len(), "applied op batch");
            ctx.bridge.mark_dirty(ops);
            *lock(state) = LinkState::Open;
            Flow::Continue
        }
        WireMessage::Presence { state: presence } => {
            ctx.presence.update(presence, ctx.wall.now_us());
            Flow::Continue
        }
        WireMessage::ImageRequest { image_id } => {
            let bytes = ctx.blobs.get(&image_id).unwrap_or_else(|err| {
                warn!(%image_id, %err, "blob lookup failed; answering not-held");
                None
            });
            let _ = channel.send(&WireMessage::ImageResponse { image_id, bytes });
            Flow::Continue
        }
        WireMessage::ImageResponse { image_id, bytes } => {
            if !ctx.assets.resolve(peer, &image_id, bytes.clone()) {
                // Late answer nobody waits on: storing it is as safe as
                // discarding it, so keep it for the next request.
                if let Some(bytes) = bytes {
                    if let Err(err) = ctx.blobs.put(&image_id, &bytes) {
                        debug!(%image_id, %err, "could not cache late image response");
                    }
                }
            }
            Flow::Continue
        }
        WireMessage::Bye => Flow::Stop,
        WireMessage::Unknown(value) => {
            debug!(%peer, kind = value.get("type").and_then(serde_json::Value::as_str),
                "ignoring unknown wire message");
            Flow::Continue
        }
    }
}

fn message_kind(msg: &WireMessage) -> &'static str {
    match msg {
        WireMessage::Hello(_) => "hello",
        WireMessage::Ops { .. } => "ops",
        WireMessage::Presence { .. } => "presence",
        WireMessage::ImageRequest { .. } => "image_request",
        WireMessage::ImageResponse { .. } => "image_response",
        WireMessage::Bye => "bye",
        WireMessage::Unknown(_) => "unknown",
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
