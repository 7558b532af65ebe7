use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::socket::{bind_receive_socket, bind_send_socket};
use super::transport::{Datagram, OutboundSender};
use crate::core::{Config, Error, Result, Serial, MAX_DATAGRAM_SIZE};
use crate::device::{ConfigCodec, DeviceSession, LiveState, SessionHandle, SessionSummary};
use crate::protocol::text::{self, DiscoveryReply, BEACON};
use crate::protocol::{Telegram, TelegramCodec};
use crate::util::Hex;

enum Command<C: ConfigCodec> {
    Lookup {
        serial: Serial,
        reply: oneshot::Sender<Option<SessionHandle<C>>>,
    },
    Sessions(oneshot::Sender<Vec<SessionSummary>>),
    Shutdown,
}

/// Discovery and session manager.
///
/// Owns the process-wide send and receive sockets and the table of device
/// sessions keyed by serial. Beacons go out periodically; discovery replies
/// create or refresh sessions and every other datagram is routed to each
/// session whose current address matches the sender.
pub struct DeviceServer<C: ConfigCodec> {
    config: Config,
    codec: Arc<C>,
    telegram_codec: TelegramCodec,
    outbound: OutboundSender,
    outbound_rx: mpsc::UnboundedReceiver<Datagram>,
    commands: mpsc::UnboundedReceiver<Command<C>>,
    sessions: BTreeMap<Serial, DeviceSession<C>>,
}

impl<C: ConfigCodec> DeviceServer<C> {
    /// Creates a new device server and the handle used to reach it
    pub fn new(config: Config, codec: C) -> (Self, DeviceServerHandle<C>) {
        Self::with_telegram_codec(config, codec, TelegramCodec::new())
    }

    /// Creates a new device server decoding datagrams with `telegram_codec`,
    /// for callers that register extra telegram types
    pub fn with_telegram_codec(
        config: Config,
        codec: C,
        telegram_codec: TelegramCodec,
    ) -> (Self, DeviceServerHandle<C>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (command_tx, commands) = mpsc::unbounded_channel();
        let server = DeviceServer {
            config,
            codec: Arc::new(codec),
            telegram_codec,
            outbound,
            outbound_rx,
            commands,
            sessions: BTreeMap::new(),
        };
        (server, DeviceServerHandle { commands: command_tx })
    }

    /// Binds the configured sockets and runs until shut down
    pub async fn run(self) -> Result<()> {
        let recv = bind_receive_socket(self.config.listen_addr)?;
        let send = bind_send_socket(self.config.send_addr)?;
        info!(
            listen = %self.config.listen_addr,
            send = %self.config.send_addr,
            "device server started"
        );
        self.run_with_sockets(recv, send).await
    }

    /// Runs the server loop on already bound sockets until every handle is
    /// dropped or [`DeviceServerHandle::shutdown`] is called
    pub async fn run_with_sockets(mut self, recv: UdpSocket, send: UdpSocket) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        let mut beacon = interval(self.config.beacon_interval);
        beacon.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut eviction = interval(self.config.session_ttl.unwrap_or(self.config.sweep_interval));
        eviction.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let evicting = self.config.session_ttl.is_some();

        loop {
            tokio::select! {
                received = recv.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.handle_datagram(&buf[..len], from.ip()),
                    Err(e) => warn!(error = %e, "receive failed"),
                },

                Some(datagram) = self.outbound_rx.recv() => {
                    if let Err(e) = send.send_to(&datagram.bytes, datagram.dest).await {
                        warn!(dest = %datagram.dest, error = %e, "send failed");
                    }
                }

                _ = beacon.tick() => self.send_beacon(),

                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },

                _ = eviction.tick(), if evicting => self.evict_stale(Instant::now()),
            }
        }

        info!(sessions = self.sessions.len(), "device server stopped");
        Ok(())
    }

    /// Number of known sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Session for `serial`, if discovered
    pub fn session(&self, serial: &Serial) -> Option<&DeviceSession<C>> {
        self.sessions.get(serial)
    }

    /// Queues a discovery beacon for the broadcast address
    pub fn send_beacon(&self) {
        let beacon = Telegram::text(BEACON).with_addresses(0, 0);
        let bytes = match self.telegram_codec.encode_telegram(&beacon) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode beacon");
                return;
            }
        };
        trace!(dest = %self.config.beacon_addr(), "beacon");
        let _ = self.outbound.send(Datagram {
            dest: self.config.beacon_addr(),
            bytes,
        });
    }

    /// Handles one inbound datagram from `ip`
    pub fn handle_datagram(&mut self, bytes: &[u8], ip: IpAddr) {
        trace!(%ip, bytes = %Hex(bytes), "datagram received");
        let telegram = match self.telegram_codec.decode_datagram(bytes) {
            Ok(telegram) => telegram,
            Err(e) => {
                warn!(%ip, error = %e, "dropping undecodable datagram");
                return;
            }
        };

        if let Some(reply) = telegram.as_text().and_then(text::parse_discovery_reply) {
            self.register(reply, ip);
            return;
        }

        let mut routed = 0;
        for session in self.sessions.values().filter(|session| session.ip() == ip) {
            session.deliver(telegram.clone());
            routed += 1;
        }
        if routed == 0 {
            debug!(%ip, kind = ?telegram.kind(), "no session for datagram");
        }
    }

    fn register(&mut self, reply: DiscoveryReply, ip: IpAddr) {
        let DiscoveryReply { serial, model } = reply;
        if let Some(session) = self.sessions.get_mut(&serial) {
            let previous = session.ip();
            if session.touch(ip, model) {
                info!(%serial, %previous, %ip, "device changed address");
            } else {
                trace!(%serial, %ip, "device seen");
            }
            return;
        }

        info!(%serial, %ip, %model, "device discovered");
        let session = DeviceSession::start(
            serial.clone(),
            ip,
            model,
            self.outbound.clone(),
            self.telegram_codec.clone(),
            self.codec.clone(),
            &self.config,
        );
        self.sessions.insert(serial, session);
    }

    fn handle_command(&mut self, command: Command<C>) {
        match command {
            Command::Lookup { serial, reply } => {
                let _ = reply.send(self.sessions.get(&serial).map(|s| s.handle().clone()));
            }
            Command::Sessions(reply) => {
                let _ = reply.send(self.sessions.values().map(DeviceSession::summary).collect());
            }
            Command::Shutdown => {}
        }
    }

    /// Drops sessions not heard from within the configured time to live
    pub fn evict_stale(&mut self, now: Instant) {
        let Some(ttl) = self.config.session_ttl else {
            return;
        };
        self.sessions.retain(|serial, session| {
            let fresh = now.saturating_duration_since(session.seen_at()) <= ttl;
            if !fresh {
                info!(%serial, ip = %session.ip(), "evicting stale session");
            }
            fresh
        });
    }
}

/// External API of a running [`DeviceServer`].
///
/// Serials are matched case-insensitively. Operations on a serial that has
/// not been discovered return `None` or `false`.
pub struct DeviceServerHandle<C: ConfigCodec> {
    commands: mpsc::UnboundedSender<Command<C>>,
}

impl<C: ConfigCodec> Clone for DeviceServerHandle<C> {
    fn clone(&self) -> Self {
        DeviceServerHandle {
            commands: self.commands.clone(),
        }
    }
}

impl<C: ConfigCodec> DeviceServerHandle<C> {
    fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command<C>) -> Result<oneshot::Receiver<T>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| Error::network("device server is not running"))?;
        Ok(rx)
    }

    /// Handle of the session for `serial`
    pub async fn session(&self, serial: &str) -> Result<Option<SessionHandle<C>>> {
        let Some(serial) = Serial::parse(serial) else {
            return Ok(None);
        };
        let rx = self.request(|reply| Command::Lookup { serial, reply })?;
        rx.await
            .map_err(|_| Error::network("device server stopped before answering"))
    }

    /// Summaries of every known session
    pub async fn sessions(&self) -> Result<Vec<SessionSummary>> {
        let rx = self.request(Command::Sessions)?;
        rx.await
            .map_err(|_| Error::network("device server stopped before answering"))
    }

    /// Reads the configuration file of `serial`
    pub async fn download_config(&self, serial: &str) -> Result<Option<Bytes>> {
        match self.session(serial).await? {
            Some(session) => Ok(Some(session.download_config().await?)),
            None => Ok(None),
        }
    }

    /// Encodes and writes the configuration of `serial`. Returns false if the
    /// serial is unknown.
    pub async fn upload_config(&self, serial: &str, config: &C::Config) -> Result<bool> {
        match self.session(serial).await? {
            Some(session) => {
                session.upload_config(config).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Writes raw configuration bytes to `serial`. Returns false if the
    /// serial is unknown.
    pub async fn upload_config_bytes(&self, serial: &str, bytes: &[u8]) -> Result<bool> {
        match self.session(serial).await? {
            Some(session) => {
                session.upload_config_bytes(bytes).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Sends text commands to `serial` concurrently and returns the replies
    /// in command order
    pub async fn send_command<S: AsRef<str>>(&self, serial: &str, commands: &[S]) -> Result<Option<Vec<String>>> {
        match self.session(serial).await? {
            Some(session) => Ok(Some(session.send_commands(commands).await?)),
            None => Ok(None),
        }
    }

    /// Current live state of `serial`
    pub async fn live_state(&self, serial: &str) -> Result<Option<LiveState<C::State>>> {
        Ok(self.session(serial).await?.map(|session| session.live_state()))
    }

    /// Stops the server loop
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BootstrapStage, RawConfigCodec};
    use crate::network::Subscription;
    use crate::testing::FakeDevice;
    use std::time::Duration;

    const SERIAL: &str = "00AABBCCDDEE";

    fn server() -> (DeviceServer<RawConfigCodec>, DeviceServerHandle<RawConfigCodec>) {
        DeviceServer::new(Config::default(), RawConfigCodec)
    }

    fn encode(text: &str) -> Bytes {
        TelegramCodec::new().encode_telegram(&Telegram::text(text)).unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn subscribe(server: &DeviceServer<RawConfigCodec>, serial: &str) -> Subscription {
        let serial = Serial::parse(serial).unwrap();
        server.session(&serial).unwrap().handle().transport().subscribe()
    }

    #[tokio::test]
    async fn test_discovery_reply_creates_then_updates_session() {
        let (mut server, _handle) = server();

        server.handle_datagram(&encode("#I00AABBCCDDEE:H1000"), ip("192.168.1.10"));
        assert_eq!(server.session_count(), 1);

        server.handle_datagram(&encode("#I00aabbccddee:H1000"), ip("192.168.1.11"));
        assert_eq!(server.session_count(), 1);

        let session = server.session(&Serial::parse(SERIAL).unwrap()).unwrap();
        assert_eq!(session.ip(), ip("192.168.1.11"));
        assert_eq!(session.handle().transport().peer().ip(), ip("192.168.1.11"));
    }

    #[tokio::test]
    async fn test_datagrams_route_by_current_address() {
        let (mut server, _handle) = server();
        server.handle_datagram(&encode("#I00AABBCCDDEE:H1000"), ip("192.168.1.10"));
        server.handle_datagram(&encode("#I001122334455:H2000"), ip("192.168.1.10"));
        server.handle_datagram(&encode("#I00FFFFFFFFFF:T100"), ip("192.168.1.20"));

        let mut first = subscribe(&server, SERIAL);
        let mut second = subscribe(&server, "001122334455");
        let mut other = subscribe(&server, "00FFFFFFFFFF");

        server.handle_datagram(&encode("#Y1$1"), ip("192.168.1.10"));
        assert_eq!(first.try_recv(), Some(Telegram::text("#Y1$1")));
        assert_eq!(second.try_recv(), Some(Telegram::text("#Y1$1")));
        assert_eq!(other.try_recv(), None);
    }

    #[tokio::test]
    async fn test_undecodable_datagram_is_dropped() {
        let (mut server, _handle) = server();
        server.handle_datagram(&encode("#I00AABBCCDDEE:H1000"), ip("192.168.1.10"));
        let mut sub = subscribe(&server, SERIAL);

        let mut corrupt = encode("#Y1$1").to_vec();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;
        server.handle_datagram(&corrupt, ip("192.168.1.10"));
        server.handle_datagram(&[2, 77], ip("192.168.1.10"));

        assert_eq!(sub.try_recv(), None);
        assert_eq!(server.session_count(), 1);
    }

    #[tokio::test]
    async fn test_beacon_goes_to_broadcast_address() {
        let (mut server, _handle) = server();
        server.send_beacon();

        let datagram = server.outbound_rx.try_recv().unwrap();
        assert_eq!(datagram.dest, "255.255.255.255:49080".parse().unwrap());
        assert_eq!(
            datagram.bytes.as_ref(),
            &[2, 77, 108, 2, 0, 0, 3, 0x20, 0x23, 0x46, 0x6E, 0x91]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_sessions_are_evicted() {
        let config = Config {
            session_ttl: Some(Duration::from_secs(30)),
            ..Config::default()
        };
        let (mut server, _handle) = DeviceServer::new(config, RawConfigCodec);
        server.handle_datagram(&encode("#I00AABBCCDDEE:H1000"), ip("192.168.1.10"));

        tokio::time::advance(Duration::from_secs(20)).await;
        server.handle_datagram(&encode("#I001122334455:H2000"), ip("192.168.1.11"));
        tokio::time::advance(Duration::from_secs(15)).await;

        server.evict_stale(Instant::now());
        assert_eq!(server.session_count(), 1);
        assert!(server.session(&Serial::parse("001122334455").unwrap()).is_some());
    }

    /// Answers beacons with a discovery reply and everything else through a
    /// scripted device, over a real loopback socket
    async fn run_device(socket: UdpSocket, reply_to: std::net::SocketAddr, device: FakeDevice) {
        let codec = TelegramCodec::new();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let Ok(len) = socket.recv(&mut buf).await else {
                return;
            };
            let Ok(request) = codec.decode_datagram(&buf[..len]) else {
                continue;
            };
            let replies = if request.as_text() == Some(BEACON) {
                vec![Telegram::text(format!("#I{}:H1000", SERIAL))]
            } else {
                device.answer(&request)
            };
            for reply in replies {
                let bytes = codec.encode_telegram(&reply).unwrap();
                socket.send_to(&bytes, reply_to).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_end_to_end_over_loopback() {
        let device_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let recv = bind_receive_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        let send = bind_send_socket("127.0.0.1:0".parse().unwrap()).unwrap();

        let config = Config {
            broadcast_addr: "127.0.0.1".parse().unwrap(),
            device_port: device_socket.local_addr().unwrap().port(),
            ..Config::default()
        };
        let device = FakeDevice::new().with_file("config.txt", b"config body");
        let (server, handle) = DeviceServer::new(config, RawConfigCodec);

        // Devices answer on the listen port, not to the sending socket
        let reply_to = recv.local_addr().unwrap();
        tokio::spawn(run_device(device_socket, reply_to, device.clone()));
        let server_task = tokio::spawn(server.run_with_sockets(recv, send));

        let session = loop {
            if let Some(session) = handle.session(&SERIAL.to_lowercase()).await.unwrap() {
                break session;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(session.bootstrapped().await, BootstrapStage::Ready);

        let replies = handle.send_command(SERIAL, &["PING"]).await.unwrap();
        assert_eq!(replies, Some(vec!["OK:PING".to_string()]));

        let config = handle.download_config(SERIAL).await.unwrap();
        assert_eq!(config.as_deref(), Some(&b"config body"[..]));

        assert!(handle.upload_config_bytes(SERIAL, b"new body").await.unwrap());
        assert_eq!(device.file("config.txt"), Some(b"new body".to_vec()));

        assert_eq!(handle.send_command("001122334455", &["PING"]).await.unwrap(), None);
        assert_eq!(handle.download_config("not-a-serial").await.unwrap(), None);
        assert!(!handle.upload_config_bytes("001122334455", b"x").await.unwrap());

        let sessions = handle.sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].serial.as_str(), SERIAL);
        assert_eq!(sessions[0].ip, ip("127.0.0.1"));

        handle.shutdown();
        server_task.await.unwrap().unwrap();
    }
}
