use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::core::{Config, Error, RequestError, Result, MAX_ADDRESS, MIN_ADDRESS, REQUEST_TIMEOUT, SWEEP_INTERVAL};
use crate::protocol::{Telegram, TelegramKind};
use super::transport::{Subscription, Transport};

/// Configuration for a request router
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Lowest pseudo-address handed out
    pub min_address: u8,
    /// One past the highest pseudo-address handed out
    pub max_address: u8,
    /// Timeout used by [`Router::send_with_response`]
    pub request_timeout: Duration,
    /// Period of the timeout sweep
    pub sweep_interval: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            min_address: MIN_ADDRESS,
            max_address: MAX_ADDRESS,
            request_timeout: REQUEST_TIMEOUT,
            sweep_interval: SWEEP_INTERVAL,
        }
    }
}

impl From<&Config> for RouterConfig {
    fn from(config: &Config) -> Self {
        RouterConfig {
            request_timeout: config.request_timeout,
            sweep_interval: config.sweep_interval,
            ..Default::default()
        }
    }
}

/// A request waiting for its reply
pub struct PendingRequest {
    pub expires_at: Instant,
    pub expected: TelegramKind,
    reply: oneshot::Sender<Result<Telegram>>,
}

impl PendingRequest {
    fn resolve(self, result: Result<Telegram>) {
        // The caller may have stopped waiting
        let _ = self.reply.send(result);
    }
}

/// Pseudo-address allocator and pending-request table.
///
/// At most one request is pending per address. Allocation scans forward
/// from a cursor that wraps at `max` so that freed addresses are not
/// reused straight away.
pub struct PendingTable {
    min: u8,
    max: u8,
    next: u8,
    slots: HashMap<u8, PendingRequest>,
}

impl PendingTable {
    /// Creates a table handing out addresses in `min..max`
    pub fn new(min: u8, max: u8) -> Self {
        let max = max.max(min);
        PendingTable {
            min,
            max,
            next: min,
            slots: HashMap::new(),
        }
    }

    /// Number of addresses in the pool
    pub fn capacity(&self) -> usize {
        usize::from(self.max - self.min)
    }

    /// Number of requests in flight
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    fn advance(&self, address: u8) -> u8 {
        let next = address + 1;
        if next >= self.max {
            self.min
        } else {
            next
        }
    }

    /// Picks the next free address and moves the cursor past it
    pub fn allocate(&mut self) -> Option<u8> {
        if self.is_full() {
            return None;
        }
        let mut address = self.next;
        while self.slots.contains_key(&address) {
            address = self.advance(address);
        }
        self.next = self.advance(address);
        Some(address)
    }

    pub fn insert(&mut self, address: u8, request: PendingRequest) {
        self.slots.insert(address, request);
    }

    pub fn remove(&mut self, address: u8) -> Option<PendingRequest> {
        self.slots.remove(&address)
    }

    /// Removes and returns the request this telegram answers, if any. A
    /// telegram of the wrong kind leaves the slot untouched.
    pub fn take_reply(&mut self, telegram: &Telegram) -> Option<PendingRequest> {
        let pending = self.slots.get(&telegram.dst)?;
        if pending.expected != telegram.kind() {
            return None;
        }
        self.slots.remove(&telegram.dst)
    }

    /// Removes every request that expired before `now`
    pub fn expire(&mut self, now: Instant) -> Vec<(u8, PendingRequest)> {
        let expired: Vec<u8> = self
            .slots
            .iter()
            .filter(|(_, pending)| pending.expires_at < now)
            .map(|(address, _)| *address)
            .collect();
        expired
            .into_iter()
            .filter_map(|address| self.slots.remove(&address).map(|p| (address, p)))
            .collect()
    }
}

enum Command {
    Request {
        telegram: Telegram,
        expected: TelegramKind,
        timeout: Duration,
        reply: oneshot::Sender<Result<Telegram>>,
    },
    PendingCount(oneshot::Sender<usize>),
}

/// Handle for correlated request/response exchanges with one device.
///
/// The pending table is owned by a dispatcher task; handles talk to it
/// over a channel. The task stops when every handle is dropped.
#[derive(Clone)]
pub struct Router {
    transport: Transport,
    commands: mpsc::UnboundedSender<Command>,
    request_timeout: Duration,
}

impl Router {
    /// Spawns the dispatcher task for `transport`
    pub fn spawn(transport: Transport, config: RouterConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = Dispatcher {
            transport: transport.clone(),
            inbound: transport.subscribe(),
            commands: rx,
            pending: PendingTable::new(config.min_address, config.max_address),
            sweep_interval: config.sweep_interval,
        };
        tokio::spawn(task.run());

        Router {
            transport,
            commands: tx,
            request_timeout: config.request_timeout,
        }
    }

    /// Transport this router sends through
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Sends a telegram without waiting for a reply
    pub fn send(&self, telegram: &Telegram) -> Result<()> {
        self.transport.send(telegram)
    }

    /// Sends a telegram and waits for a reply of kind `expected`, using the
    /// default timeout
    pub async fn send_with_response(&self, telegram: Telegram, expected: TelegramKind) -> Result<Telegram> {
        self.send_with_response_timeout(telegram, expected, self.request_timeout)
            .await
    }

    /// Sends a telegram and waits for a reply of kind `expected`.
    ///
    /// The telegram's `src` is overwritten with a free pseudo-address; the
    /// reply is the first telegram of the expected kind whose `dst` carries
    /// that address.
    pub async fn send_with_response_timeout(
        &self,
        telegram: Telegram,
        expected: TelegramKind,
        timeout: Duration,
    ) -> Result<Telegram> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Request {
                telegram,
                expected,
                timeout,
                reply: tx,
            })
            .map_err(|_| RequestError::Closed)?;
        rx.await.map_err(|_| RequestError::Closed)?
    }

    /// Sends a text command and returns the text of the reply
    pub async fn request_text(&self, command: &str) -> Result<String> {
        let reply = self
            .send_with_response(Telegram::text(command), TelegramKind::Text)
            .await?;
        match reply.as_text() {
            Some(text) => Ok(text.to_string()),
            None => Err(Error::network("text request answered with a non-text telegram")),
        }
    }

    /// Number of requests currently awaiting a reply. Inbound telegrams
    /// already delivered to the transport are processed first.
    pub async fn pending_count(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::PendingCount(tx))
            .map_err(|_| RequestError::Closed)?;
        Ok(rx.await.map_err(|_| RequestError::Closed)?)
    }
}

struct Dispatcher {
    transport: Transport,
    inbound: Subscription,
    commands: mpsc::UnboundedReceiver<Command>,
    pending: PendingTable,
    sweep_interval: Duration,
}

impl Dispatcher {
    async fn run(mut self) {
        let mut sweep = interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                telegram = self.inbound.recv() => match telegram {
                    Some(telegram) => self.dispatch(telegram),
                    None => break,
                },

                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },

                _ = sweep.tick() => self.sweep(Instant::now()),
            }
        }

        trace!(peer = %self.transport.peer(), pending = self.pending.len(), "router stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Request {
                mut telegram,
                expected,
                timeout,
                reply,
            } => {
                let Some(address) = self.pending.allocate() else {
                    warn!(peer = %self.transport.peer(), "no free response address");
                    let _ = reply.send(Err(RequestError::PoolExhausted.into()));
                    return;
                };

                telegram.src = address;
                self.pending.insert(
                    address,
                    PendingRequest {
                        expires_at: Instant::now() + timeout,
                        expected,
                        reply,
                    },
                );
                debug!(peer = %self.transport.peer(), address, ?expected, "request sent");

                if let Err(e) = self.transport.send(&telegram) {
                    if let Some(pending) = self.pending.remove(address) {
                        pending.resolve(Err(e));
                    }
                }
            }
            Command::PendingCount(reply) => {
                let _ = reply.send(self.pending.len());
            }
        }
    }

    fn dispatch(&mut self, telegram: Telegram) {
        let address = telegram.dst;
        match self.pending.take_reply(&telegram) {
            Some(pending) => {
                debug!(peer = %self.transport.peer(), address, "reply matched");
                pending.resolve(Ok(telegram));
            }
            None => trace!(
                peer = %self.transport.peer(),
                address,
                kind = ?telegram.kind(),
                "no pending request for telegram"
            ),
        }
    }

    fn sweep(&mut self, now: Instant) {
        for (address, pending) in self.pending.expire(now) {
            warn!(peer = %self.transport.peer(), address, "request timed out");
            pending.resolve(Err(RequestError::Timeout { address }.into()));
        }
    }
}
