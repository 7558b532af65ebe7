use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

use crate::core::{Error, Result};
use crate::protocol::{Telegram, TelegramCodec};
use crate::util::Hex;

/// One encoded telegram queued for the shared send socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub dest: SocketAddr,
    pub bytes: Bytes,
}

/// Queue drained by the socket loop that owns the send socket
pub type OutboundSender = mpsc::UnboundedSender<Datagram>;

struct Subscribers {
    next_id: u64,
    list: Vec<(u64, mpsc::UnboundedSender<Telegram>)>,
}

struct Shared {
    peer: Mutex<SocketAddr>,
    codec: TelegramCodec,
    outbound: OutboundSender,
    subscribers: Mutex<Subscribers>,
}

impl Shared {
    fn subscribers(&self) -> MutexGuard<'_, Subscribers> {
        // Nothing panics while holding the lock, but stay usable if something did
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn peer(&self) -> MutexGuard<'_, SocketAddr> {
        self.peer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Communication channel to one device.
///
/// Sends go out through the shared send socket to the current peer address.
/// Inbound telegrams routed to this transport are fanned out to every live
/// [`Subscription`] in arrival order.
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
}

impl Transport {
    /// Creates a transport bound to `peer`
    pub fn new(peer: SocketAddr, outbound: OutboundSender, codec: TelegramCodec) -> Self {
        Transport {
            shared: Arc::new(Shared {
                peer: Mutex::new(peer),
                codec,
                outbound,
                subscribers: Mutex::new(Subscribers {
                    next_id: 0,
                    list: Vec::new(),
                }),
            }),
        }
    }

    /// Address telegrams are sent to
    pub fn peer(&self) -> SocketAddr {
        *self.shared.peer()
    }

    /// Points the transport at a new address, for a device that roamed
    pub fn set_peer(&self, peer: SocketAddr) {
        *self.shared.peer() = peer;
    }

    /// Encodes a telegram and queues it for the peer
    pub fn send(&self, telegram: &Telegram) -> Result<()> {
        let bytes = self.shared.codec.encode_telegram(telegram)?;
        let dest = self.peer();
        trace!(peer = %dest, bytes = %Hex(&bytes), "SEND {}", telegram);
        self.shared
            .outbound
            .send(Datagram { dest, bytes })
            .map_err(|_| Error::network("send socket is closed"))
    }

    /// Registers a new subscriber. Dropping the subscription unsubscribes.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.shared.subscribers();
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        subscribers.list.push((id, tx));
        Subscription {
            id,
            rx,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Hands an inbound telegram to every subscriber, returning how many
    /// received it
    pub fn deliver(&self, telegram: Telegram) -> usize {
        trace!(peer = %self.peer(), "RECV {}", telegram);
        let mut subscribers = self.shared.subscribers();
        subscribers
            .list
            .retain(|(_, tx)| tx.send(telegram.clone()).is_ok());
        subscribers.list.len()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers().list.len()
    }
}

/// Receiving end of a transport subscription
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Telegram>,
    shared: Weak<Shared>,
}

impl Subscription {
    /// Waits for the next inbound telegram. Returns `None` once the
    /// transport is gone.
    pub async fn recv(&mut self) -> Option<Telegram> {
        self.rx.recv().await
    }

    /// Returns an already delivered telegram without waiting
    pub fn try_recv(&mut self) -> Option<Telegram> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.subscribers().list.retain(|(id, _)| *id != self.id);
        }
    }
}
