use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::ConfigCodec;
use crate::network::{Subscription, Transport};
use crate::protocol::text::{parse_state_telegram, state_object_id};

/// Latest state per configuration object id. An object whose last push could
/// not be decoded maps to `None`.
pub type LiveState<S> = BTreeMap<u32, Option<S>>;

/// Background task folding `#Y` pushes into a [`LiveState`] snapshot.
///
/// The task is aborted when the listener is dropped.
pub(crate) struct LiveStateListener {
    task: JoinHandle<()>,
}

impl LiveStateListener {
    /// Subscribes to `transport` and starts listening. The subscription is
    /// in place before this returns, so a state dump requested afterwards
    /// is seen in full.
    pub(crate) fn spawn<C: ConfigCodec>(
        transport: &Transport,
        codec: Arc<C>,
        config: C::Config,
        live: watch::Sender<LiveState<C::State>>,
    ) -> Self {
        let inbound = transport.subscribe();
        let peer = transport.peer();
        let task = tokio::spawn(listen(inbound, peer, codec, config, live));
        LiveStateListener { task }
    }

    /// Waits until the listener stops: once every handle to its transport
    /// has been dropped, or when the listener itself is dropped elsewhere
    pub(crate) async fn finished(&mut self) {
        let _ = (&mut self.task).await;
    }
}

impl Drop for LiveStateListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn listen<C: ConfigCodec>(
    mut inbound: Subscription,
    peer: SocketAddr,
    codec: Arc<C>,
    config: C::Config,
    live: watch::Sender<LiveState<C::State>>,
) {
    while let Some(telegram) = inbound.recv().await {
        if let Some(text) = telegram.as_text() {
            apply(codec.as_ref(), &config, &live, peer, text);
        }
    }
    trace!(%peer, "live-state listener stopped");
}

/// Applies one text telegram to the snapshot. Every `#Y` push with an object
/// id replaces that object's entry, with `None` when the push cannot be
/// decoded. Returns true if the snapshot was touched.
fn apply<C: ConfigCodec>(
    codec: &C,
    config: &C::Config,
    live: &watch::Sender<LiveState<C::State>>,
    peer: SocketAddr,
    text: &str,
) -> bool {
    let Some(object_id) = state_object_id(text) else {
        return false;
    };
    let state = parse_state_telegram(text)
        .filter(|update| update.object_id == object_id)
        .and_then(|update| codec.decode_state(config, object_id, &update.args));
    if state.is_some() {
        debug!(%peer, object_id, "live state updated");
    } else {
        trace!(%peer, object_id, "live-state push not decodable");
    }
    live.send_modify(|snapshot| {
        snapshot.insert(object_id, state);
    });
    true
}
