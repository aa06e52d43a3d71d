//! Transport capabilities: signaling (rendezvous) and peer channels.
//!
//! The engine never talks to a socket directly. A [`Signaling`]
//! implementation registers short device codes and brokers direct
//! channels; a [`PeerChannel`] is an ordered, reliable, bidirectional
//! message stream. Production builds plug in a real rendezvous service;
//! tests use the in-memory [`memory::MemoryHub`], which exercises the full
//! wire codec end to end.

use std::sync::Arc;
use std::time::Duration;

use tally_core::model::id::DeviceId;

use crate::wire::WireMessage;

/// Channel-level errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The channel is closed (locally or by the peer).
    #[error("channel closed")]
    Closed,
    /// No message arrived within the wait.
    #[error("receive timed out")]
    Timeout,
    /// A frame arrived but did not decode.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Signaling-level errors.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    /// The device code is already registered by someone else.
    #[error("device code already taken")]
    CodeTaken,
    /// The dialed device is not registered or not answering.
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    /// No incoming connection within the wait.
    #[error("accept timed out")]
    Timeout,
    /// The signaling service itself is gone.
    #[error("signaling closed")]
    Closed,
}

/// An ordered, reliable, bidirectional message stream to one peer.
///
/// `send` may be called from any thread; `recv_timeout` is driven by the
/// link's receive loop. Per-link causal order is the transport's job:
/// messages arrive in the order the peer sent them.
pub trait PeerChannel: Send + Sync {
    /// Send a message.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] if the channel is down.
    fn send(&self, msg: &WireMessage) -> Result<(), ChannelError>;

    /// Wait up to `timeout` for the next message.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Timeout`] when nothing arrived,
    /// [`ChannelError::Closed`] when the peer is gone,
    /// [`ChannelError::Malformed`] for an undecodable frame.
    fn recv_timeout(&self, timeout: Duration) -> Result<WireMessage, ChannelError>;

    /// Close the channel. Idempotent.
    fn close(&self);
}

/// An inbound connection handed out by [`Signaling::accept`].
pub struct IncomingConn {
    /// The dialing device.
    pub peer: DeviceId,
    /// The channel to it.
    pub channel: Arc<dyn PeerChannel>,
}

/// Rendezvous capability: code registration and connection brokering.
pub trait Signaling: Send + Sync {
    /// Claim a device code.
    ///
    /// # Errors
    ///
    /// [`SignalError::CodeTaken`] if another live device holds the code —
    /// the caller regenerates its code and retries once.
    fn register(&self, device: &DeviceId) -> Result<(), SignalError>;

    /// Release a device code.
    fn unregister(&self, device: &DeviceId);

    /// Open a direct channel to a registered device.
    ///
    /// # Errors
    ///
    /// [`SignalError::Unreachable`] if the code is unknown or the peer does
    /// not answer within `timeout`.
    fn dial(
        &self,
        from: &DeviceId,
        to: &DeviceId,
        timeout: Duration,
    ) -> Result<Arc<dyn PeerChannel>, SignalError>;

    /// Wait up to `timeout` for an inbound connection.
    ///
    /// # Errors
    ///
    /// [`SignalError::Timeout`] when nothing arrived; [`SignalError::Closed`]
    /// when the device is no longer registered.
    fn accept(&self, device: &DeviceId, timeout: Duration) -> Result<IncomingConn, SignalError>;
}

// ---------------------------------------------------------------------------
// In-memory transport
// ---------------------------------------------------------------------------

/// In-memory signaling hub and channels.
///
/// Frames are the encoded wire strings, so tests cover serialization the
/// same way a real transport would.
pub mod memory {
    use std::collections::HashMap;
    use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tally_core::model::id::DeviceId;

    use super::{ChannelError, IncomingConn, PeerChannel, SignalError, Signaling};
    use crate::wire::WireMessage;

    struct Registration {
        accept_tx: Sender<IncomingConn>,
        accept_rx: Arc<Mutex<Receiver<IncomingConn>>>,
    }

    /// A process-local rendezvous: device code → accept queue.
    #[derive(Default)]
    pub struct MemoryHub {
        registry: Mutex<HashMap<DeviceId, Registration>>,
    }

    impl MemoryHub {
        /// Create an empty hub.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl Signaling for MemoryHub {
        fn register(&self, device: &DeviceId) -> Result<(), SignalError> {
            let mut registry = self
                .registry
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if registry.contains_key(device) {
                return Err(SignalError::CodeTaken);
            }
            let (accept_tx, accept_rx) = mpsc::channel();
            registry.insert(
                device.clone(),
                Registration {
                    accept_tx,
                    accept_rx: Arc::new(Mutex::new(accept_rx)),
                },
            );
            Ok(())
        }

        fn unregister(&self, device: &DeviceId) {
            let mut registry = self
                .registry
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            registry.remove(device);
        }

        fn dial(
            &self,
            from: &DeviceId,
            to: &DeviceId,
            _timeout: Duration,
        ) -> Result<Arc<dyn PeerChannel>, SignalError> {
            let accept_tx = {
                let registry = self
                    .registry
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                let target = registry
                    .get(to)
                    .ok_or_else(|| SignalError::Unreachable(format!("no such device {to}")))?;
                target.accept_tx.clone()
            };

            let (a_tx, a_rx) = mpsc::channel::<String>();
            let (b_tx, b_rx) = mpsc::channel::<String>();
            let local: Arc<dyn PeerChannel> = Arc::new(MemoryChannel::new(a_tx, b_rx));
            let remote: Arc<dyn PeerChannel> = Arc::new(MemoryChannel::new(b_tx, a_rx));

            accept_tx
                .send(IncomingConn {
                    peer: from.clone(),
                    channel: remote,
                })
                .map_err(|_| SignalError::Unreachable(format!("{to} stopped accepting")))?;
            Ok(local)
        }

        fn accept(
            &self,
            device: &DeviceId,
            timeout: Duration,
        ) -> Result<IncomingConn, SignalError> {
            let accept_rx = {
                let registry = self
                    .registry
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                let own = registry.get(device).ok_or(SignalError::Closed)?;
                Arc::clone(&own.accept_rx)
            };
            let accept_rx = accept_rx
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match accept_rx.recv_timeout(timeout) {
                Ok(incoming) => Ok(incoming),
                Err(RecvTimeoutError::Timeout) => Err(SignalError::Timeout),
                Err(RecvTimeoutError::Disconnected) => Err(SignalError::Closed),
            }
        }
    }

    /// One direction-pair of in-memory mpsc channels carrying encoded
    /// frames.
    pub struct MemoryChannel {
        tx: Mutex<Option<Sender<String>>>,
        rx: Mutex<Receiver<String>>,
    }

    impl MemoryChannel {
        fn new(tx: Sender<String>, rx: Receiver<String>) -> Self {
            Self {
                tx: Mutex::new(Some(tx)),
                rx: Mutex::new(rx),
            }
        }
    }

    impl PeerChannel for MemoryChannel {
        fn send(&self, msg: &WireMessage) -> Result<(), ChannelError> {
            let tx = self
                .tx
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let Some(tx) = tx.as_ref() else {
                return Err(ChannelError::Closed);
            };
            tx.send(msg.encode()).map_err(|_| ChannelError::Closed)
        }

        fn recv_timeout(&self, timeout: Duration) -> Result<WireMessage, ChannelError> {
            let frame = {
                let rx = self
                    .rx
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                match rx.recv_timeout(timeout) {
                    Ok(frame) => frame,
                    Err(RecvTimeoutError::Timeout) => return Err(ChannelError::Timeout),
                    Err(RecvTimeoutError::Disconnected) => return Err(ChannelError::Closed),
                }
            };
            WireMessage::decode(&frame).map_err(|err| ChannelError::Malformed(err.to_string()))
        }

        fn close(&self) {
            let mut tx = self
                .tx
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            // Dropping the sender lets the peer's recv observe Closed.
            tx.take();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::memory::MemoryHub;
    use super::*;

    fn dev(code: &str) -> DeviceId {
        DeviceId::new_unchecked(code)
    }

    const SHORT: Duration = Duration::from_millis(200);

    #[test]
    fn register_collision_is_reported() {
        let hub = MemoryHub::new();
        hub.register(&dev("A2B3C4")).expect("first registration");
        assert!(matches!(
            hub.register(&dev("A2B3C4")),
            Err(SignalError::CodeTaken)
        ));
        hub.unregister(&dev("A2B3C4"));
        hub.register(&dev("A2B3C4")).expect("code free again");
    }

    #[test]
    fn dial_unknown_code_is_unreachable() {
        let hub = MemoryHub::new();
        hub.register(&dev("A2B3C4")).expect("register");
        assert!(matches!(
            hub.dial(&dev("A2B3C4"), &dev("X2Y3Z4"), SHORT),
            Err(SignalError::Unreachable(_))
        ));
    }

    #[test]
    fn dial_accept_send_recv() {
        let hub = MemoryHub::new();
        hub.register(&dev("A2B3C4")).expect("register a");
        hub.register(&dev("X2Y3Z4")).expect("register b");

        let channel = hub
            .dial(&dev("A2B3C4"), &dev("X2Y3Z4"), SHORT)
            .expect("dial");
        let incoming = hub.accept(&dev("X2Y3Z4"), SHORT).expect("accept");
        assert_eq!(incoming.peer, dev("A2B3C4"));

        channel.send(&WireMessage::Bye).expect("send");
        let msg = incoming.channel.recv_timeout(SHORT).expect("recv");
        assert_eq!(msg, WireMessage::Bye);

        // And the reverse direction.
        incoming.channel.send(&WireMessage::Bye).expect("send back");
        assert_eq!(channel.recv_timeout(SHORT).expect("recv"), WireMessage::Bye);
    }

    #[test]
    fn close_surfaces_as_closed_on_the_peer() {
        let hub = MemoryHub::new();
        hub.register(&dev("A2B3C4")).expect("register a");
        hub.register(&dev("X2Y3Z4")).expect("register b");

        let channel = hub
            .dial(&dev("A2B3C4"), &dev("X2Y3Z4"), SHORT)
            .expect("dial");
        let incoming = hub.accept(&dev("X2Y3Z4"), SHORT).expect("accept");

        channel.close();
        assert!(matches!(
            incoming.channel.recv_timeout(SHORT),
            Err(ChannelError::Closed)
        ));
        // Sending on a closed channel fails locally too.
        assert!(channel.send(&WireMessage::Bye).is_err());
    }

    #[test]
    fn accept_times_out_when_quiet() {
        let hub = MemoryHub::new();
        hub.register(&dev("A2B3C4")).expect("register");
        assert!(matches!(
            hub.accept(&dev("A2B3C4"), Duration::from_millis(20)),
            Err(SignalError::Timeout)
        ));
    }
}
