use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use super::files::FileTransferManager;
use super::live_state::{LiveState, LiveStateListener};
use super::ConfigCodec;
use crate::core::{Config, DeviceInfo, Error, Result, Serial};
use crate::network::{OutboundSender, Router, RouterConfig, Transport};
use crate::protocol::text::{self, ALL_STATES_QUERY, VERSION_QUERY};
use crate::protocol::{Telegram, TelegramCodec};

/// Where a session's background bootstrap currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapStage {
    Created,
    FetchingConfig,
    StartingLiveState,
    QueryingVersion,
    Ready,
    /// The named step failed and the remaining ones were skipped
    Failed { stage: &'static str },
}

impl BootstrapStage {
    /// Short name of the stage
    pub fn name(&self) -> &'static str {
        match self {
            BootstrapStage::Created => "created",
            BootstrapStage::FetchingConfig => "fetching_config",
            BootstrapStage::StartingLiveState => "starting_live_state",
            BootstrapStage::QueryingVersion => "querying_version",
            BootstrapStage::Ready => "ready",
            BootstrapStage::Failed { .. } => "failed",
        }
    }

    /// Returns true once bootstrap has stopped, successfully or not
    pub fn is_finished(&self) -> bool {
        matches!(self, BootstrapStage::Ready | BootstrapStage::Failed { .. })
    }
}

impl fmt::Display for BootstrapStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapStage::Failed { stage } => write!(f, "failed while {}", stage),
            other => f.write_str(other.name()),
        }
    }
}

/// Snapshot of one session, as listed by the device server
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub serial: Serial,
    pub ip: IpAddr,
    pub model: String,
    pub last_seen: DateTime<Utc>,
    pub stage: BootstrapStage,
    pub info: Option<DeviceInfo>,
}

struct Shared<C: ConfigCodec> {
    serial: Serial,
    codec: Arc<C>,
    config_file: String,
    stage: watch::Receiver<BootstrapStage>,
    info: watch::Receiver<Option<DeviceInfo>>,
    config: watch::Receiver<Option<C::Config>>,
    live: watch::Receiver<LiveState<C::State>>,
}

/// Cloneable handle for on-demand operations on one device
pub struct SessionHandle<C: ConfigCodec> {
    router: Router,
    files: FileTransferManager,
    shared: Arc<Shared<C>>,
}

impl<C: ConfigCodec> Clone for SessionHandle<C> {
    fn clone(&self) -> Self {
        SessionHandle {
            router: self.router.clone(),
            files: self.files.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<C: ConfigCodec> SessionHandle<C> {
    pub fn serial(&self) -> &Serial {
        &self.shared.serial
    }

    pub fn transport(&self) -> &Transport {
        self.router.transport()
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn files(&self) -> &FileTransferManager {
        &self.files
    }

    /// Current bootstrap stage
    pub fn stage(&self) -> BootstrapStage {
        *self.shared.stage.borrow()
    }

    /// Version information, once the version query has been answered
    pub fn info(&self) -> Option<DeviceInfo> {
        self.shared.info.borrow().clone()
    }

    /// Configuration decoded during bootstrap
    pub fn config(&self) -> Option<C::Config> {
        self.shared.config.borrow().clone()
    }

    /// Copy of the current live state
    pub fn live_state(&self) -> LiveState<C::State> {
        self.shared.live.borrow().clone()
    }

    /// Receiver that is notified on every live-state change
    pub fn watch_live_state(&self) -> watch::Receiver<LiveState<C::State>> {
        self.shared.live.clone()
    }

    /// Waits until bootstrap has finished and returns the final stage
    pub async fn bootstrapped(&self) -> BootstrapStage {
        let mut stage = self.shared.stage.clone();
        // An error means the bootstrap task is gone; report wherever it stopped
        let _ = stage.wait_for(BootstrapStage::is_finished).await;
        let current = *stage.borrow();
        current
    }

    /// Reads the raw configuration file
    pub async fn download_config(&self) -> Result<Bytes> {
        self.files.read_file(&self.shared.config_file).await
    }

    /// Encodes `config` and writes it as the configuration file
    pub async fn upload_config(&self, config: &C::Config) -> Result<()> {
        let bytes = self.shared.codec.encode_config(config)?;
        self.upload_config_bytes(&bytes).await
    }

    /// Writes raw bytes as the configuration file
    pub async fn upload_config_bytes(&self, bytes: &[u8]) -> Result<()> {
        self.files.write_file(&self.shared.config_file, bytes).await
    }

    /// Sends every command concurrently and returns the reply texts in
    /// command order. Fails as soon as any command fails.
    pub async fn send_commands<S: AsRef<str>>(&self, commands: &[S]) -> Result<Vec<String>> {
        try_join_all(commands.iter().map(|command| self.router.request_text(command.as_ref()))).await
    }
}

/// Everything known about one discovered device
pub struct DeviceSession<C: ConfigCodec> {
    ip: IpAddr,
    device_port: u16,
    model: String,
    last_seen: DateTime<Utc>,
    seen_at: Instant,
    handle: SessionHandle<C>,
    bootstrap: JoinHandle<()>,
}

impl<C: ConfigCodec> DeviceSession<C> {
    /// Creates a session for a device that answered discovery from `ip`
    /// and starts its bootstrap in the background.
    pub fn start(
        serial: Serial,
        ip: IpAddr,
        model: String,
        outbound: OutboundSender,
        telegram_codec: TelegramCodec,
        codec: Arc<C>,
        config: &Config,
    ) -> Self {
        let transport = Transport::new(config.device_addr(ip), outbound, telegram_codec);
        let router = Router::spawn(transport, RouterConfig::from(config));
        let files = FileTransferManager::new(router.clone());

        let (stage_tx, stage) = watch::channel(BootstrapStage::Created);
        let (info_tx, info) = watch::channel(None);
        let (config_tx, config_rx) = watch::channel(None);
        let (live_tx, live) = watch::channel(LiveState::new());

        let handle = SessionHandle {
            router,
            files,
            shared: Arc::new(Shared {
                serial,
                codec,
                config_file: config.config_file.clone(),
                stage,
                info,
                config: config_rx,
                live,
            }),
        };

        let bootstrap = tokio::spawn(
            Bootstrap {
                handle: handle.clone(),
                stage: stage_tx,
                info: info_tx,
                config: config_tx,
                live: Some(live_tx),
            }
            .run(),
        );

        DeviceSession {
            ip,
            device_port: config.device_port,
            model,
            last_seen: Utc::now(),
            seen_at: Instant::now(),
            handle,
            bootstrap,
        }
    }

    pub fn serial(&self) -> &Serial {
        self.handle.serial()
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    /// Monotonic time of the last discovery reply
    pub fn seen_at(&self) -> Instant {
        self.seen_at
    }

    pub fn handle(&self) -> &SessionHandle<C> {
        &self.handle
    }

    /// Records a fresh discovery reply. Returns true if the device moved to
    /// a new address, in which case the transport follows it.
    pub fn touch(&mut self, ip: IpAddr, model: String) -> bool {
        self.model = model;
        self.last_seen = Utc::now();
        self.seen_at = Instant::now();
        if self.ip == ip {
            return false;
        }
        self.ip = ip;
        self.handle.transport().set_peer(SocketAddr::new(ip, self.device_port));
        true
    }

    /// Hands an inbound telegram from this session's address to its
    /// subscribers
    pub fn deliver(&self, telegram: Telegram) -> usize {
        self.handle.transport().deliver(telegram)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            serial: self.serial().clone(),
            ip: self.ip,
            model: self.model.clone(),
            last_seen: self.last_seen,
            stage: self.handle.stage(),
            info: self.handle.info(),
        }
    }
}

impl<C: ConfigCodec> Drop for DeviceSession<C> {
    fn drop(&mut self) {
        self.bootstrap.abort();
    }
}

/// Background bootstrap of one session. Owns the sending side of every
/// value the session publishes.
struct Bootstrap<C: ConfigCodec> {
    handle: SessionHandle<C>,
    stage: watch::Sender<BootstrapStage>,
    info: watch::Sender<Option<DeviceInfo>>,
    config: watch::Sender<Option<C::Config>>,
    live: Option<watch::Sender<LiveState<C::State>>>,
}

impl<C: ConfigCodec> Bootstrap<C> {
    async fn run(mut self) {
        let serial = self.handle.serial().clone();
        let mut listener = match self.steps().await {
            Ok(listener) => {
                info!(%serial, info = ?self.handle.info(), "device ready");
                listener
            }
            Err((stage, e)) => {
                warn!(%serial, stage = stage.name(), error = %e, "bootstrap failed");
                self.stage.send_replace(BootstrapStage::Failed { stage: stage.name() });
                return;
            }
        };

        // The listener alone keeps running, until the session's transport
        // goes away or the session aborts this task
        drop(self);
        listener.finished().await;
    }

    async fn steps(&mut self) -> std::result::Result<LiveStateListener, (BootstrapStage, Error)> {
        self.enter(BootstrapStage::FetchingConfig);
        let config = self
            .fetch_config()
            .await
            .map_err(|e| (BootstrapStage::FetchingConfig, e))?;
        self.config.send_replace(Some(config.clone()));

        self.enter(BootstrapStage::StartingLiveState);
        let listener = self
            .start_live_state(config)
            .map_err(|e| (BootstrapStage::StartingLiveState, e))?;

        self.enter(BootstrapStage::QueryingVersion);
        let info = self
            .query_version()
            .await
            .map_err(|e| (BootstrapStage::QueryingVersion, e))?;
        self.info.send_replace(Some(info));

        self.enter(BootstrapStage::Ready);
        Ok(listener)
    }

    fn enter(&self, stage: BootstrapStage) {
        self.stage.send_replace(stage);
    }

    async fn fetch_config(&self) -> Result<C::Config> {
        let bytes = self.handle.download_config().await?;
        self.handle.shared.codec.decode_config(&bytes)
    }

    fn start_live_state(&mut self, config: C::Config) -> Result<LiveStateListener> {
        let live = self
            .live
            .take()
            .ok_or_else(|| Error::network("live-state listener already started"))?;
        let listener = LiveStateListener::spawn(
            self.handle.transport(),
            self.handle.shared.codec.clone(),
            config,
            live,
        );
        self.handle.router().send(&Telegram::text(ALL_STATES_QUERY))?;
        Ok(listener)
    }

    async fn query_version(&self) -> Result<DeviceInfo> {
        let reply = self.handle.router().request_text(VERSION_QUERY).await?;
        text::parse_version_reply(&reply)
            .ok_or_else(|| Error::network(format!("unrecognised version reply {:?}", reply)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RawConfigCodec;
    use crate::protocol::ArgValue;
    use crate::testing::FakeDevice;
    use tokio::sync::mpsc;

    fn start(device: &FakeDevice) -> DeviceSession<RawConfigCodec> {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = DeviceSession::start(
            Serial::parse("00AABBCCDDEE").unwrap(),
            "10.0.0.30".parse().unwrap(),
            "H1000".to_string(),
            tx,
            TelegramCodec::new(),
            Arc::new(RawConfigCodec),
            &Config::default(),
        );
        let transport = session.handle().transport().clone();
        device.spawn(rx, move |_, reply| {
            transport.deliver(reply);
        });
        session
    }

    #[tokio::test]
    async fn test_bootstrap_reaches_ready() {
        let device = FakeDevice::new().with_file("config.txt", &text::encode_cp1251("Котёл"));
        let session = start(&device);
        let handle = session.handle().clone();

        assert_eq!(handle.bootstrapped().await, BootstrapStage::Ready);
        assert_eq!(handle.config().as_deref(), Some("Котёл"));

        let info = handle.info().unwrap();
        assert_eq!(info.model_code, "H1000");
        assert_eq!(info.firmware, 1234);

        let mut live = handle.watch_live_state();
        let state = live.wait_for(|state| state.len() == 2).await.unwrap().clone();
        assert_eq!(
            state[&1],
            Some(vec![ArgValue::Number(100.0), ArgValue::Text("on".into())])
        );

        let queries: Vec<_> = device.with_log(|log| {
            log.received
                .iter()
                .filter_map(|t| t.as_text().map(str::to_string))
                .collect()
        });
        assert_eq!(queries, vec![ALL_STATES_QUERY.to_string(), VERSION_QUERY.to_string()]);
    }

    #[tokio::test]
    async fn test_failed_config_fetch_skips_remaining_steps() {
        let device = FakeDevice::new();
        let session = start(&device);
        let handle = session.handle().clone();

        assert_eq!(
            handle.bootstrapped().await,
            BootstrapStage::Failed { stage: "fetching_config" }
        );
        assert!(handle.config().is_none());
        device.with_log(|log| assert!(log.received.iter().all(|t| t.as_text().is_none())));

        // Session remains usable on demand
        let replies = handle.send_commands(&["#S7?", "PING"]).await.unwrap();
        assert_eq!(replies, vec!["#S7=H1000 3 1234".to_string(), "OK:PING".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_version_query_fails_bootstrap() {
        let device = FakeDevice::new().with_file("config.txt", b"x").ignore(VERSION_QUERY);
        let session = start(&device);

        let stage = session.handle().bootstrapped().await;
        assert_eq!(stage, BootstrapStage::Failed { stage: "querying_version" });
        assert!(session.handle().info().is_none());
        assert_eq!(stage.to_string(), "failed while querying_version");
    }

    #[tokio::test]
    async fn test_touch_tracks_address_changes() {
        let device = FakeDevice::new();
        let mut session = start(&device);
        let ip = session.ip();

        assert!(!session.touch(ip, "H1000".into()));
        let moved: IpAddr = "10.0.0.31".parse().unwrap();
        assert!(session.touch(moved, "H2000".into()));

        assert_eq!(session.ip(), moved);
        assert_eq!(session.model(), "H2000");
        assert_eq!(session.handle().transport().peer(), SocketAddr::new(moved, 49080));
        assert_eq!(session.summary().ip, moved);
    }
}
