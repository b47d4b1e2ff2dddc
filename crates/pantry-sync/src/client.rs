//! # Connection Client
//!
//! The companion's single connection to the host: dialing, handshake
//! timeout, keep-alive, reconnect policy and the pairing state machine,
//! all owned by one actor task.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Connection Client States                             │
//! │                                                                         │
//! │  ┌────────────┐    connect()    ┌────────────┐   handshake timeout      │
//! │  │Disconnected│ ──────────────► │ Connecting │ ─────────────┐           │
//! │  └────────────┘                 └─────┬──────┘              │           │
//! │        ▲   ▲                          │ socket open         │           │
//! │        │   │                          ▼                     ▼           │
//! │        │   │                 ┌──────────────────┐   ┌──────────────┐    │
//! │        │   │                 │Connected(unpaired)│  │ reconnect in │    │
//! │        │   │                 └────────┬─────────┘   │ attempts*2s  │    │
//! │        │   │      paired /            │             └──────┬───────┘    │
//! │        │   │      connected{auth}     ▼                    │            │
//! │        │   │                 ┌──────────────────┐          │            │
//! │        │   └──── failure ─── │ Connected(paired)│          │            │
//! │        │                     └────────┬─────────┘          │            │
//! │        │                              │ unpaired           │            │
//! │        └──────────────────────────────┘                    │            │
//! │                                                            ▼            │
//! │                                      5th consecutive failure:           │
//! │                                      Error(reason), only connect()      │
//! │                                      retries                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Generations
//! Every dial, and every drop of a socket or dial, bumps a generation
//! counter. Dial results, socket frames and timer firings carry the
//! generation they were started under; anything from an older generation is
//! dropped on arrival, including frames a reader queued just before a write
//! failed.
//!
//! ## Failures
//! Retryable errors (refused, closed, timed out) go through the backoff.
//! Anything else (TLS, invalid handshake headers) ends in `Error` at once.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::discovery::normalize_server_url;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{self, Decoded, SyncMessage};
use crate::reconnect::LinearBackoff;
use crate::scheduler::TimerSlot;
use crate::transport::{Connector, DeviceHeaders, Frame, FrameSink, FrameStream, Link};
use pantry_core::validation::{normalize_device_name, validate_pairing_code_format};
use pantry_core::{
    ConnectionStatus, LinkStatus, PairingEffect, PairingEvent, PairingState, PairingStateMachine,
};
use pantry_db::CompanionStateRepository;

/// Capacity of the channel carrying domain messages to the dispatcher.
const INBOUND_CAPACITY: usize = 256;

/// Upper bound on delivering a close frame before the socket is dropped.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

// =============================================================================
// Client Options
// =============================================================================

/// Everything the client needs besides its connector and store.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub device: DeviceHeaders,
    /// Normalized host URL; `None` until configured or discovered.
    pub server_url: Option<String>,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    pub reconnect: LinearBackoff,
}

impl ClientOptions {
    pub fn from_config(config: &SyncConfig, device_id: String) -> SyncResult<Self> {
        let server_url = match config.client.server_url.as_deref() {
            Some(url) => Some(normalize_server_url(url)?),
            None => None,
        };

        Ok(ClientOptions {
            device: DeviceHeaders {
                device_id,
                device_type: config.device.device_type,
                device_name: normalize_device_name(Some(&config.device.name)),
            },
            server_url,
            connect_timeout: config.connect_timeout(),
            ping_interval: config.client_ping_interval(),
            reconnect: LinearBackoff::new(
                Duration::from_secs(config.client.reconnect_unit_secs),
                Duration::from_secs(config.client.reconnect_cap_secs),
                config.client.max_reconnect_attempts,
            ),
        })
    }
}

// =============================================================================
// Client Handle
// =============================================================================

enum Command {
    Connect(Option<String>),
    Offer(String),
    Disconnect,
    Send(SyncMessage),
    SubmitPairingCode(String),
    Shutdown,
}

/// Cloneable handle to the client actor.
#[derive(Clone)]
pub struct ClientHandle {
    commands_tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<LinkStatus>,
}

impl ClientHandle {
    async fn command(&self, command: Command) -> SyncResult<()> {
        self.commands_tx
            .send(command)
            .await
            .map_err(|_| SyncError::ShuttingDown)
    }

    /// Starts a connection attempt, optionally to a new address.
    ///
    /// No-op while an attempt is in flight or when no address is known.
    /// Resets the reconnect budget.
    pub async fn connect(&self, address: Option<String>) -> SyncResult<()> {
        self.command(Command::Connect(address)).await
    }

    /// Offers a discovered address. Adopted only when the client has no
    /// address yet or sits disconnected.
    pub async fn offer_address(&self, address: String) -> SyncResult<()> {
        self.command(Command::Offer(address)).await
    }

    /// Closes the link with "going away" and cancels all timers.
    pub async fn disconnect(&self) -> SyncResult<()> {
        self.command(Command::Disconnect).await
    }

    /// Queues a message. Dropped (and logged) unless connected and paired.
    pub async fn send(&self, message: SyncMessage) -> SyncResult<()> {
        self.command(Command::Send(message)).await
    }

    /// Sends `pair{code, deviceName}` to the host.
    pub async fn submit_pairing_code(&self, code: impl Into<String>) -> SyncResult<()> {
        self.command(Command::SubmitPairingCode(code.into())).await
    }

    /// Current status snapshot.
    pub fn status(&self) -> LinkStatus {
        self.status_rx.borrow().clone()
    }

    /// Receiver that wakes on every status change.
    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.status_rx.clone()
    }

    /// Triggers graceful shutdown.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.command(Command::Shutdown).await
    }
}

// =============================================================================
// Connection Client
// =============================================================================

enum Event {
    Opened { generation: u64, link: Link },
    DialFailed { generation: u64, error: SyncError },
    HandshakeTimeout { generation: u64 },
    Inbound { generation: u64, decoded: Decoded },
    Closed { generation: u64, error: SyncError },
    KeepAlive { generation: u64 },
    Reconnect { generation: u64 },
}

enum Phase {
    Idle,
    Dialing(JoinHandle<()>),
    Open {
        sink: FrameSink,
        reader: JoinHandle<()>,
    },
}

/// Companion-side connection actor.
///
/// ## Usage
/// ```rust,ignore
/// let options = ClientOptions::from_config(&config, device_id)?;
/// let (client, mut inbound) = ConnectionClient::spawn(WsConnector::new(), options, store);
///
/// client.connect(None).await?;
/// while let Some(message) = inbound.recv().await {
///     // domain messages only, and only while paired
/// }
/// ```
pub struct ConnectionClient {
    connector: Arc<dyn Connector>,
    device: DeviceHeaders,
    connect_timeout: Duration,
    ping_interval: Duration,
    store: CompanionStateRepository,

    address: Option<String>,
    generation: u64,
    phase: Phase,
    connection: ConnectionStatus,
    pairing: PairingStateMachine,
    backoff: LinearBackoff,

    handshake_timer: TimerSlot,
    keepalive_timer: TimerSlot,
    reconnect_timer: TimerSlot,

    status_tx: watch::Sender<LinkStatus>,
    commands_rx: mpsc::Receiver<Command>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    inbound_tx: mpsc::Sender<SyncMessage>,
}

impl ConnectionClient {
    /// Spawns the actor.
    ///
    /// Returns a handle and the receiver for domain messages from the host.
    pub fn spawn<C: Connector>(
        connector: C,
        options: ClientOptions,
        store: CompanionStateRepository,
    ) -> (ClientHandle, mpsc::Receiver<SyncMessage>) {
        let (client, handle, inbound) = Self::new(connector, options, store);
        tokio::spawn(client.run());
        (handle, inbound)
    }

    fn new<C: Connector>(
        connector: C,
        options: ClientOptions,
        store: CompanionStateRepository,
    ) -> (Self, ClientHandle, mpsc::Receiver<SyncMessage>) {
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (status_tx, status_rx) = watch::channel(LinkStatus::default());

        let client = ConnectionClient {
            connector: Arc::new(connector),
            device: options.device,
            connect_timeout: options.connect_timeout,
            ping_interval: options.ping_interval,
            store,
            address: options.server_url,
            generation: 0,
            phase: Phase::Idle,
            connection: ConnectionStatus::Disconnected,
            pairing: PairingStateMachine::new(),
            backoff: options.reconnect,
            handshake_timer: TimerSlot::new("handshake"),
            keepalive_timer: TimerSlot::new("keep-alive"),
            reconnect_timer: TimerSlot::new("reconnect"),
            status_tx,
            commands_rx,
            events_tx,
            events_rx,
            inbound_tx,
        };

        (
            client,
            ClientHandle {
                commands_tx,
                status_rx,
            },
            inbound_rx,
        )
    }

    async fn run(mut self) {
        info!(device_id = %self.device.device_id, "Connection client starting");

        loop {
            tokio::select! {
                command = self.commands_rx.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
            }
        }

        self.close_link().await;
        self.reconnect_timer.cancel();
        self.pairing.handle(PairingEvent::Disconnected);
        self.set_connection(ConnectionStatus::Disconnected);
        info!("Connection client stopped");
    }

    // =========================================================================
    // Commands
    // =========================================================================

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(address) => self.manual_connect(address).await,
            Command::Offer(address) => self.offer_address(address).await,
            Command::Disconnect => self.disconnect().await,
            Command::Send(message) => self.send_domain(message).await,
            Command::SubmitPairingCode(code) => self.submit_code(code).await,
            Command::Shutdown => {}
        }
    }

    async fn manual_connect(&mut self, address: Option<String>) {
        if let Some(raw) = address {
            let url = match normalize_server_url(&raw) {
                Ok(url) => url,
                Err(e) => {
                    warn!(?e, address = %raw, "Ignoring invalid server address");
                    return;
                }
            };

            if self.address.as_deref() != Some(url.as_str()) {
                if !matches!(self.phase, Phase::Idle) {
                    info!(%url, "Switching host address");
                    self.close_link().await;
                }
                self.adopt_address(url).await;
            }
        }

        match self.phase {
            Phase::Dialing(_) => {
                debug!("Connect ignored, attempt in flight");
                return;
            }
            Phase::Open { .. } => {
                debug!("Connect ignored, already connected");
                return;
            }
            Phase::Idle => {}
        }

        self.reconnect_timer.cancel();
        self.backoff.reset();
        self.dial();
    }

    async fn offer_address(&mut self, address: String) {
        let url = match normalize_server_url(&address) {
            Ok(url) => url,
            Err(e) => {
                debug!(?e, %address, "Ignoring discovered address");
                return;
            }
        };

        let idle = matches!(self.phase, Phase::Idle)
            && !self.reconnect_timer.is_armed()
            && self.connection == ConnectionStatus::Disconnected;

        if self.address.is_some() && !idle {
            debug!(%url, "Keeping current address");
            return;
        }

        info!(%url, "Using discovered host");
        self.adopt_address(url).await;
        if matches!(self.phase, Phase::Idle) {
            self.dial();
        }
    }

    async fn adopt_address(&mut self, url: String) {
        if let Err(e) = self.store.set_server_address(&url).await {
            warn!(?e, "Failed to persist server address");
        }
        self.address = Some(url);
    }

    async fn disconnect(&mut self) {
        self.close_link().await;
        self.reconnect_timer.cancel();
        self.generation += 1;
        self.pairing.handle(PairingEvent::Disconnected);
        self.set_connection(ConnectionStatus::Disconnected);
        info!("Disconnected on request");
    }

    async fn send_domain(&mut self, message: SyncMessage) {
        if !(self.connection.is_connected() && self.pairing.is_paired()) {
            warn!(msg_type = message.type_name(), "Dropping send, link is not paired");
            return;
        }
        self.write_or_fail(&message).await;
    }

    async fn submit_code(&mut self, code: String) {
        if !matches!(self.phase, Phase::Open { .. }) {
            warn!("Pairing code ignored, not connected");
            return;
        }
        if self.pairing.is_paired() {
            debug!("Pairing code ignored, already paired");
            return;
        }

        let code = code.trim();
        if let Err(e) = validate_pairing_code_format(code) {
            self.pairing.handle(PairingEvent::PairingFailed {
                message: e.to_string(),
            });
            self.publish();
            return;
        }

        let pair = SyncMessage::pair(code, &self.device.device_name);
        self.write_or_fail(&pair).await;
    }

    // =========================================================================
    // Events
    // =========================================================================

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Opened { generation, link } => {
                if generation != self.generation || !matches!(self.phase, Phase::Dialing(_)) {
                    debug!(generation, "Dropping stale link");
                    return;
                }
                self.handshake_timer.cancel();
                // Every socket starts unpaired until the host says otherwise.
                self.pairing.handle(PairingEvent::Disconnected);

                let Link { sink, stream } = link;
                let reader = self.spawn_reader(generation, stream);
                self.phase = Phase::Open { sink, reader };
                self.backoff.reset();
                self.arm_keepalive();
                self.set_connection(ConnectionStatus::Connected);
                info!(generation, "Connected to host");
            }
            Event::DialFailed { generation, error } => {
                if generation != self.generation || !matches!(self.phase, Phase::Dialing(_)) {
                    return;
                }
                self.on_failure(error);
            }
            Event::HandshakeTimeout { generation } => {
                if generation != self.generation || !matches!(self.phase, Phase::Dialing(_)) {
                    return;
                }
                self.on_failure(SyncError::Timeout(self.connect_timeout.as_secs()));
            }
            Event::Inbound { generation, decoded } => {
                if generation != self.generation || !matches!(self.phase, Phase::Open { .. }) {
                    debug!(generation, "Dropping frame from stale link");
                    return;
                }
                self.handle_inbound(decoded).await;
            }
            Event::Closed { generation, error } => {
                if generation != self.generation || !matches!(self.phase, Phase::Open { .. }) {
                    return;
                }
                self.on_failure(error);
            }
            Event::KeepAlive { generation } => {
                if generation != self.generation || !matches!(self.phase, Phase::Open { .. }) {
                    return;
                }
                match self.write(&SyncMessage::Ping).await {
                    Ok(()) => self.arm_keepalive(),
                    Err(e) => {
                        warn!(?e, "Keep-alive ping failed");
                        self.on_failure(e);
                    }
                }
            }
            Event::Reconnect { generation } => {
                if generation != self.generation || !matches!(self.phase, Phase::Idle) {
                    return;
                }
                self.dial();
            }
        }
    }

    async fn handle_inbound(&mut self, decoded: Decoded) {
        let message = match decoded {
            Decoded::Message(message) => message,
            Decoded::Unrecognized { kind } => {
                warn!(%kind, "Dropping message of unknown type");
                return;
            }
            Decoded::Malformed { reason } => {
                warn!(%reason, "Dropping malformed message");
                return;
            }
        };

        debug!(msg_type = message.type_name(), "Received message");

        let event = match message {
            SyncMessage::Ping => {
                self.write_or_fail(&SyncMessage::Pong).await;
                return;
            }
            SyncMessage::Pong => return,
            SyncMessage::Connected { authenticated } => PairingEvent::Connected { authenticated },
            SyncMessage::PairingRequired => PairingEvent::PairingRequired,
            SyncMessage::Paired => PairingEvent::Paired,
            SyncMessage::PairingFailed { message } => PairingEvent::PairingFailed { message },
            SyncMessage::PairingTimeout => PairingEvent::PairingTimeout,
            SyncMessage::Unpaired => PairingEvent::Unpaired,
            SyncMessage::Error(payload) if payload.is_not_authenticated() => {
                PairingEvent::NotAuthenticated
            }
            SyncMessage::Error(payload) => {
                warn!(message = %payload.message, "Host reported an error");
                return;
            }
            SyncMessage::Pair(_) => {
                warn!("Ignoring pair message from host");
                return;
            }
            domain => {
                self.forward(domain).await;
                return;
            }
        };

        let effect = self.pairing.handle(event);
        self.apply_effect(effect).await;
    }

    async fn forward(&mut self, message: SyncMessage) {
        if !self.pairing.is_paired() {
            warn!(
                msg_type = message.type_name(),
                "Dropping domain message on unpaired link"
            );
            return;
        }
        if self.inbound_tx.send(message).await.is_err() {
            debug!("Domain receiver dropped");
        }
    }

    async fn apply_effect(&mut self, effect: PairingEffect) {
        match effect {
            PairingEffect::None => {}
            PairingEffect::TrustGranted => {
                info!("Paired with host");
                self.persist_trust(true).await;
            }
            PairingEffect::PromptForCode { error: Some(message) } => {
                warn!(%message, "Pairing code rejected");
            }
            PairingEffect::PromptForCode { error: None } => {
                info!("Host requires a pairing code");
            }
            PairingEffect::ForceReconnect => {
                info!("Pairing window expired, reconnecting");
                self.close_link().await;
                self.dial();
                return;
            }
            PairingEffect::Revoked => {
                warn!("Trust revoked by host");
                self.persist_trust(false).await;
                self.close_link().await;
                self.reconnect_timer.cancel();
                self.generation += 1;
                self.set_connection(ConnectionStatus::Disconnected);
                return;
            }
            PairingEffect::ReauthRequired => {
                warn!("Host does not recognize this device, pairing again");
                self.persist_trust(false).await;
            }
        }
        self.publish();
    }

    async fn persist_trust(&mut self, trusted: bool) {
        if let Err(e) = self.store.set_trusted(trusted).await {
            warn!(?e, trusted, "Failed to persist trust marker");
        }
    }

    // =========================================================================
    // Socket
    // =========================================================================

    fn dial(&mut self) {
        let Some(url) = self.address.clone() else {
            warn!("Connect ignored, no server address configured");
            return;
        };

        self.drop_link();
        self.generation += 1;
        let generation = self.generation;

        info!(%url, generation, attempts = self.backoff.attempts(), "Connecting to host");

        let dial = self.connector.connect(&url, &self.device);
        let events = self.events_tx.clone();
        let task = tokio::spawn(async move {
            let event = match dial.await {
                Ok(link) => Event::Opened { generation, link },
                Err(error) => Event::DialFailed { generation, error },
            };
            let _ = events.send(event);
        });
        self.phase = Phase::Dialing(task);

        let fire = self.post(Event::HandshakeTimeout { generation });
        self.handshake_timer.schedule(self.connect_timeout, fire);
        self.set_connection(ConnectionStatus::Connecting);
    }

    fn spawn_reader(&self, generation: u64, mut stream: FrameStream) -> JoinHandle<()> {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let error = loop {
                let decoded = match stream.next().await {
                    Some(Ok(Frame::Text(text))) => protocol::decode(&text),
                    Some(Ok(Frame::Binary(bytes))) => protocol::decode_bytes(&bytes),
                    Some(Ok(Frame::Close)) | None => break SyncError::Disconnected,
                    Some(Err(e)) => break e,
                };
                if events.send(Event::Inbound { generation, decoded }).is_err() {
                    return;
                }
            };
            let _ = events.send(Event::Closed { generation, error });
        })
    }

    async fn write(&mut self, message: &SyncMessage) -> SyncResult<()> {
        let Phase::Open { sink, .. } = &mut self.phase else {
            return Err(SyncError::Disconnected);
        };
        let json = message.to_json()?;
        debug!(msg_type = message.type_name(), "Sending message");
        sink.send(Frame::Text(json)).await
    }

    /// Writes, treating a failed write as a lost link. A message that cannot
    /// be encoded is dropped and the link kept.
    async fn write_or_fail(&mut self, message: &SyncMessage) {
        match self.write(message).await {
            Ok(()) => {}
            Err(e) if e.is_protocol_error() => {
                warn!(?e, msg_type = message.type_name(), "Dropping unencodable message");
            }
            Err(e) => self.on_failure(e),
        }
    }

    /// Sends a close frame (bounded) and drops the socket.
    async fn close_link(&mut self) {
        if let Phase::Open { sink, .. } = &mut self.phase {
            match tokio::time::timeout(CLOSE_GRACE, sink.send(Frame::Close)).await {
                Ok(Ok(())) => debug!("Close frame sent"),
                Ok(Err(e)) => debug!(?e, "Close frame not delivered"),
                Err(_) => debug!("Close frame timed out"),
            }
        }
        self.drop_link();
    }

    /// Drops whatever socket or dial is held, with its timers.
    ///
    /// Bumps the generation so events the old link already queued are stale.
    fn drop_link(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => return,
            Phase::Dialing(task) => task.abort(),
            Phase::Open { reader, .. } => reader.abort(),
        }
        self.generation += 1;
        self.handshake_timer.cancel();
        self.keepalive_timer.cancel();
    }

    /// Transport failure: drop the socket and apply the reconnect policy.
    ///
    /// Errors a retry cannot fix stop the client without spending budget.
    fn on_failure(&mut self, error: SyncError) {
        self.drop_link();
        self.pairing.handle(PairingEvent::Disconnected);
        let reason = error.to_string();

        if !error.is_retryable() {
            if error.is_config_error() {
                error!(%reason, "Connection settings rejected, check host address and device");
            } else {
                error!(%reason, "Connection failed, not retrying");
            }
            self.reconnect_timer.cancel();
            self.set_connection(ConnectionStatus::Error { reason });
            return;
        }

        match self.backoff.next_backoff() {
            Some(delay) => {
                warn!(
                    %reason,
                    attempts = self.backoff.attempts(),
                    ?delay,
                    "Connection lost, scheduling reconnect"
                );
                let fire = self.post(Event::Reconnect {
                    generation: self.generation,
                });
                self.reconnect_timer.schedule(delay, fire);
                self.set_connection(ConnectionStatus::Disconnected);
            }
            None => {
                error!(
                    %reason,
                    attempts = self.backoff.attempts(),
                    "Reconnect ceiling reached, giving up"
                );
                self.reconnect_timer.cancel();
                self.set_connection(ConnectionStatus::Error { reason });
            }
        }
    }

    fn arm_keepalive(&mut self) {
        let fire = self.post(Event::KeepAlive {
            generation: self.generation,
        });
        self.keepalive_timer.schedule(self.ping_interval, fire);
    }

    fn post(&self, event: Event) -> impl Future<Output = ()> + Send + 'static {
        let events = self.events_tx.clone();
        async move {
            let _ = events.send(event);
        }
    }

    // =========================================================================
    // Status
    // =========================================================================

    fn set_connection(&mut self, connection: ConnectionStatus) {
        self.connection = connection;
        self.publish();
    }

    fn publish(&self) {
        let next = LinkStatus {
            connection: self.connection.clone(),
            pairing: if self.connection.is_connected() {
                self.pairing.state()
            } else {
                PairingState::Unpaired
            },
            reconnect_attempts: self.backoff.attempts(),
            pairing_error: self.pairing.last_error().map(str::to_owned),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{Dial, MemoryConnector, MemoryPeer};
    use pantry_core::DeviceType;
    use pantry_db::{Database, DbConfig};
    use serde_json::json;
    use tokio::time::timeout;

    // Long enough that paused-clock tests reach the 30s keep-alive first.
    const WAIT: Duration = Duration::from_secs(120);

    fn options() -> ClientOptions {
        ClientOptions {
            device: DeviceHeaders {
                device_id: "tablet-1".into(),
                device_type: DeviceType::Tablet,
                device_name: "Kitchen tablet".into(),
            },
            server_url: Some("ws://host.test:8080".into()),
            connect_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            reconnect: LinearBackoff::default(),
        }
    }

    async fn store() -> CompanionStateRepository {
        Database::new(DbConfig::in_memory())
            .await
            .unwrap()
            .companion_state()
    }

    async fn wait_status(
        handle: &ClientHandle,
        predicate: impl FnMut(&LinkStatus) -> bool,
    ) -> LinkStatus {
        let mut rx = handle.subscribe();
        let status = timeout(WAIT, rx.wait_for(predicate))
            .await
            .expect("status change timed out")
            .unwrap()
            .clone();
        status
    }

    async fn next_peer(peers: &mut mpsc::UnboundedReceiver<MemoryPeer>) -> MemoryPeer {
        timeout(WAIT, peers.recv()).await.unwrap().unwrap()
    }

    async fn paired_client() -> (
        ClientHandle,
        mpsc::Receiver<SyncMessage>,
        MemoryPeer,
        CompanionStateRepository,
    ) {
        let (connector, mut peers) = MemoryConnector::new();
        let store = store().await;
        let (handle, inbound) = ConnectionClient::spawn(connector, options(), store.clone());
        handle.connect(None).await.unwrap();
        let peer = next_peer(&mut peers).await;
        peer.push(&SyncMessage::Connected {
            authenticated: true,
        });
        wait_status(&handle, LinkStatus::is_ready).await;
        (handle, inbound, peer, store)
    }

    #[tokio::test]
    async fn test_handshake_carries_device_headers() {
        let (connector, mut peers) = MemoryConnector::new();
        let (handle, _inbound) = ConnectionClient::spawn(connector, options(), store().await);
        handle.connect(None).await.unwrap();

        let peer = next_peer(&mut peers).await;
        assert_eq!(peer.url, "ws://host.test:8080");
        assert_eq!(peer.headers.device_id, "tablet-1");
        assert_eq!(peer.headers.device_type, DeviceType::Tablet);

        let status = wait_status(&handle, |s| s.connection.is_connected()).await;
        assert_eq!(status.pairing, PairingState::Unpaired);
    }

    #[tokio::test]
    async fn test_connect_without_address_is_noop() {
        let (connector, _peers) = MemoryConnector::new();
        let mut opts = options();
        opts.server_url = None;
        let (handle, _inbound) = ConnectionClient::spawn(connector.clone(), opts, store().await);

        handle.connect(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connector.dials(), 0);
        assert_eq!(handle.status().connection, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_pairing_round_trip() {
        let (connector, mut peers) = MemoryConnector::new();
        let store = store().await;
        let (handle, _inbound) = ConnectionClient::spawn(connector.clone(), options(), store.clone());
        handle.connect(None).await.unwrap();

        let mut peer = next_peer(&mut peers).await;
        peer.push(&SyncMessage::Connected {
            authenticated: false,
        });
        peer.push(&SyncMessage::PairingRequired);
        wait_status(&handle, |s| s.pairing == PairingState::PairingRequired).await;

        handle.submit_pairing_code("111111").await.unwrap();
        assert_eq!(
            peer.recv().await,
            Some(SyncMessage::pair("111111", "Kitchen tablet"))
        );

        peer.push(&SyncMessage::pairing_failed("Invalid pairing code"));
        let status = wait_status(&handle, |s| s.pairing_error.is_some()).await;
        assert_eq!(status.pairing, PairingState::PairingRequired);
        assert_eq!(status.pairing_error.as_deref(), Some("Invalid pairing code"));

        // Retry on the same socket.
        handle.submit_pairing_code("424242").await.unwrap();
        assert_eq!(
            peer.recv().await,
            Some(SyncMessage::pair("424242", "Kitchen tablet"))
        );
        peer.push(&SyncMessage::Paired);

        let status = wait_status(&handle, LinkStatus::is_ready).await;
        assert!(status.pairing_error.is_none());
        assert_eq!(connector.dials(), 1);
        assert!(store.is_trusted().await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_code_rejected_locally() {
        let (connector, mut peers) = MemoryConnector::new();
        let (handle, _inbound) = ConnectionClient::spawn(connector, options(), store().await);
        handle.connect(None).await.unwrap();
        let mut peer = next_peer(&mut peers).await;
        peer.push(&SyncMessage::PairingRequired);
        wait_status(&handle, |s| s.pairing == PairingState::PairingRequired).await;

        handle.submit_pairing_code("12ab").await.unwrap();
        wait_status(&handle, |s| s.pairing_error.is_some()).await;

        handle.submit_pairing_code("123456").await.unwrap();
        assert_eq!(
            peer.recv().await,
            Some(SyncMessage::pair("123456", "Kitchen tablet"))
        );
    }

    #[tokio::test]
    async fn test_sends_dropped_until_paired() {
        let (connector, mut peers) = MemoryConnector::new();
        let (handle, _inbound) = ConnectionClient::spawn(connector, options(), store().await);
        handle.connect(None).await.unwrap();
        let mut peer = next_peer(&mut peers).await;
        peer.push(&SyncMessage::Connected {
            authenticated: false,
        });
        wait_status(&handle, |s| s.connection.is_connected()).await;

        handle.send(SyncMessage::RequestStoreList).await.unwrap();
        // Commands run in order: once the malformed code is reported, the
        // send above has been handled.
        handle.submit_pairing_code("12ab").await.unwrap();
        wait_status(&handle, |s| s.pairing_error.is_some()).await;

        peer.push(&SyncMessage::Connected {
            authenticated: true,
        });
        wait_status(&handle, LinkStatus::is_ready).await;
        handle.send(SyncMessage::RequestShoppingList).await.unwrap();

        assert_eq!(peer.recv().await, Some(SyncMessage::RequestShoppingList));
    }

    #[tokio::test]
    async fn test_receive_loop_stays_live() {
        let (_handle, mut inbound, peer, _store) = paired_client().await;

        for n in 0..1001 {
            peer.push(&SyncMessage::TodaysMeals {
                data: json!([{ "n": n }]),
            });
        }

        let mut last = None;
        for _ in 0..1001 {
            last = Some(timeout(WAIT, inbound.recv()).await.unwrap().unwrap());
        }
        assert_eq!(
            last,
            Some(SyncMessage::TodaysMeals {
                data: json!([{ "n": 1000 }])
            })
        );
    }

    #[tokio::test]
    async fn test_binary_and_fast_path_frames() {
        let (_handle, mut inbound, peer, _store) = paired_client().await;

        peer.push_raw(Frame::Binary(br#"{"type":"store_list","data":[1]}"#.to_vec()));
        peer.push_raw(Frame::Text(r#"{"meal_plan":{"days":[]}}"#.into()));
        peer.push_raw(Frame::Text(r#"{"type":"mystery"}"#.into()));
        peer.push_raw(Frame::Text("not json".into()));
        peer.push(&SyncMessage::SyncConfirmed);

        let received: Vec<_> = [
            timeout(WAIT, inbound.recv()).await.unwrap().unwrap(),
            timeout(WAIT, inbound.recv()).await.unwrap().unwrap(),
            timeout(WAIT, inbound.recv()).await.unwrap().unwrap(),
        ]
        .into();
        assert_eq!(
            received,
            vec![
                SyncMessage::StoreList { data: json!([1]) },
                SyncMessage::MealPlan {
                    meal_plan: json!({"days": []})
                },
                SyncMessage::SyncConfirmed,
            ]
        );
    }

    #[tokio::test]
    async fn test_host_ping_answered_with_pong() {
        let (_handle, _inbound, mut peer, _store) = paired_client().await;
        peer.push(&SyncMessage::Ping);
        assert_eq!(peer.recv().await, Some(SyncMessage::Pong));
    }

    #[tokio::test]
    async fn test_unpaired_revokes_trust_without_reconnect() {
        let (connector, mut peers) = MemoryConnector::new();
        let store = store().await;
        let (handle, _inbound) = ConnectionClient::spawn(connector.clone(), options(), store.clone());
        handle.connect(None).await.unwrap();
        let mut peer = next_peer(&mut peers).await;
        peer.push(&SyncMessage::Paired);
        wait_status(&handle, LinkStatus::is_ready).await;
        assert!(store.is_trusted().await.unwrap());

        peer.push(&SyncMessage::Unpaired);
        let status = wait_status(&handle, |s| {
            s.connection == ConnectionStatus::Disconnected
        })
        .await;
        assert_eq!(status.pairing, PairingState::Unpaired);
        assert_eq!(peer.recv().await, None);
        assert!(!store.is_trusted().await.unwrap());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(connector.dials(), 1);

        // Explicit connect goes through pairing again.
        handle.connect(None).await.unwrap();
        let peer = next_peer(&mut peers).await;
        peer.push(&SyncMessage::PairingRequired);
        wait_status(&handle, |s| s.pairing == PairingState::PairingRequired).await;
    }

    #[tokio::test]
    async fn test_not_authenticated_clears_trust_and_prompts() {
        let (handle, _inbound, peer, store) = paired_client().await;
        assert!(store.is_trusted().await.unwrap());

        peer.push(&SyncMessage::not_authenticated());
        wait_status(&handle, |s| s.pairing == PairingState::PairingRequired).await;
        assert!(!store.is_trusted().await.unwrap());
        assert!(handle.status().connection.is_connected());
    }

    #[tokio::test]
    async fn test_pairing_timeout_reconnects_without_spending_budget() {
        let (connector, mut peers) = MemoryConnector::new();
        let (handle, _inbound) = ConnectionClient::spawn(connector.clone(), options(), store().await);
        handle.connect(None).await.unwrap();
        let mut first = next_peer(&mut peers).await;
        first.push(&SyncMessage::PairingRequired);
        wait_status(&handle, |s| s.pairing == PairingState::PairingRequired).await;

        first.push(&SyncMessage::PairingTimeout);
        let second = next_peer(&mut peers).await;
        assert_eq!(first.recv().await, None);
        assert_eq!(connector.dials(), 2);

        second.push(&SyncMessage::PairingRequired);
        let status = wait_status(&handle, |s| s.pairing == PairingState::PairingRequired).await;
        assert_eq!(status.reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn test_disconnect_is_always_safe() {
        let (connector, mut peers) = MemoryConnector::new();
        let (handle, _inbound) = ConnectionClient::spawn(connector.clone(), options(), store().await);
        handle.disconnect().await.unwrap();

        handle.connect(None).await.unwrap();
        let mut peer = next_peer(&mut peers).await;
        peer.push(&SyncMessage::Paired);
        wait_status(&handle, LinkStatus::is_ready).await;

        handle.disconnect().await.unwrap();
        handle.disconnect().await.unwrap();
        assert_eq!(peer.recv().await, None);
        let status = wait_status(&handle, |s| s.connection == ConnectionStatus::Disconnected).await;
        assert_eq!(status.pairing, PairingState::Unpaired);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(connector.dials(), 1);
    }

    #[tokio::test]
    async fn test_offer_address_only_when_idle() {
        let (connector, mut peers) = MemoryConnector::new();
        let mut opts = options();
        opts.server_url = None;
        let store = store().await;
        let (handle, _inbound) = ConnectionClient::spawn(connector.clone(), opts, store.clone());

        handle.offer_address("192.168.1.20".into()).await.unwrap();
        let peer = next_peer(&mut peers).await;
        assert_eq!(peer.url, "ws://192.168.1.20:8080");
        wait_status(&handle, |s| s.connection.is_connected()).await;

        handle.offer_address("192.168.1.99".into()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connector.dials(), 1);
        assert_eq!(
            store.server_address().await.unwrap().as_deref(),
            Some("ws://192.168.1.20:8080")
        );
    }

    // =========================================================================
    // Timer-driven paths (paused clock; no database traffic after setup)
    // =========================================================================

    #[tokio::test]
    async fn test_keepalive_failure_goes_through_reconnect_policy() {
        let (connector, mut peers) = MemoryConnector::new();
        let (handle, _inbound) = ConnectionClient::spawn(connector.clone(), options(), store().await);
        tokio::time::pause();

        handle.connect(None).await.unwrap();
        let peer = next_peer(&mut peers).await;
        wait_status(&handle, |s| s.connection.is_connected()).await;

        // Host stops reading: the next keep-alive ping fails to send.
        let MemoryPeer {
            from_client,
            to_client,
            ..
        } = peer;
        drop(from_client);

        let started = tokio::time::Instant::now();
        let second = next_peer(&mut peers).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(32), "{:?}", elapsed);
        assert_eq!(connector.dials(), 2);
        assert_eq!(second.url, "ws://host.test:8080");
        drop(to_client);

        let status = wait_status(&handle, |s| s.connection.is_connected()).await;
        assert_eq!(status.reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn test_reconnect_ceiling_then_manual_connect() {
        let (connector, _peers) = MemoryConnector::new();
        connector.script([Dial::Refuse; 5]);
        let (handle, _inbound) = ConnectionClient::spawn(connector.clone(), options(), store().await);
        tokio::time::pause();

        let started = tokio::time::Instant::now();
        handle.connect(None).await.unwrap();
        let status = wait_status(&handle, |s| {
            matches!(s.connection, ConnectionStatus::Error { .. })
        })
        .await;

        // 2 + 4 + 6 + 8 seconds of backoff between five dials.
        let elapsed = started.elapsed();
        assert!(
            elapsed >= Duration::from_secs(20) && elapsed < Duration::from_secs(21),
            "{:?}",
            elapsed
        );
        assert_eq!(connector.dials(), 5);
        assert_eq!(status.reconnect_attempts, 5);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.dials(), 5);

        handle.connect(None).await.unwrap();
        let status = wait_status(&handle, |s| s.connection.is_connected()).await;
        assert_eq!(connector.dials(), 6);
        assert_eq!(status.reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn test_unfixable_failure_stops_without_retry() {
        let (connector, _peers) = MemoryConnector::new();
        connector.script([Dial::Reject]);
        let (handle, _inbound) = ConnectionClient::spawn(connector.clone(), options(), store().await);
        tokio::time::pause();

        handle.connect(None).await.unwrap();
        let status = wait_status(&handle, |s| {
            matches!(s.connection, ConnectionStatus::Error { .. })
        })
        .await;
        assert_eq!(status.reconnect_attempts, 0);
        assert!(
            matches!(&status.connection, ConnectionStatus::Error { reason } if reason.contains("TLS")),
            "{:?}",
            status.connection
        );

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.dials(), 1);
    }

    #[tokio::test]
    async fn test_handshake_timeout_schedules_reconnect() {
        let (connector, mut peers) = MemoryConnector::new();
        connector.script([Dial::Hang]);
        let (handle, _inbound) = ConnectionClient::spawn(connector.clone(), options(), store().await);
        tokio::time::pause();

        let started = tokio::time::Instant::now();
        handle.connect(None).await.unwrap();
        wait_status(&handle, |s| s.reconnect_attempts == 1).await;
        let elapsed = started.elapsed();
        assert!(
            elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11),
            "{:?}",
            elapsed
        );

        let _peer = next_peer(&mut peers).await;
        let elapsed = started.elapsed();
        assert!(
            elapsed >= Duration::from_secs(12) && elapsed < Duration::from_secs(13),
            "{:?}",
            elapsed
        );
        assert_eq!(connector.dials(), 2);
    }

    #[tokio::test]
    async fn test_connect_while_dialing_is_noop() {
        let (connector, _peers) = MemoryConnector::new();
        connector.script([Dial::Hang]);
        let (handle, _inbound) = ConnectionClient::spawn(connector.clone(), options(), store().await);
        tokio::time::pause();

        handle.connect(None).await.unwrap();
        wait_status(&handle, |s| s.connection == ConnectionStatus::Connecting).await;
        handle.connect(None).await.unwrap();
        handle.connect(None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(connector.dials(), 1);
    }

    // =========================================================================
    // Stale links (actor driven by hand)
    // =========================================================================

    async fn open_by_hand(client: &mut ConnectionClient) {
        client.dial();
        let opened = timeout(WAIT, client.events_rx.recv()).await.unwrap().unwrap();
        client.handle_event(opened).await;
        assert!(matches!(client.phase, Phase::Open { .. }));
    }

    #[tokio::test]
    async fn test_frames_queued_before_failure_are_dropped() {
        let (connector, mut peers) = MemoryConnector::new();
        let store = store().await;
        let (mut client, handle, mut inbound) =
            ConnectionClient::new(connector, options(), store.clone());
        open_by_hand(&mut client).await;
        let _peer = next_peer(&mut peers).await;
        let generation = client.generation;

        // The reader had already queued these when the write failed.
        client.on_failure(SyncError::Disconnected);
        for message in [
            SyncMessage::Paired,
            SyncMessage::StoreList { data: json!([]) },
        ] {
            client
                .handle_event(Event::Inbound {
                    generation,
                    decoded: Decoded::Message(message),
                })
                .await;
        }

        assert!(!client.pairing.is_paired());
        assert!(inbound.try_recv().is_err());
        assert!(!store.is_trusted().await.unwrap());
        assert!(!handle.status().is_ready());
    }

    #[tokio::test]
    async fn test_new_socket_starts_unpaired() {
        let (connector, mut peers) = MemoryConnector::new();
        let (mut client, handle, _inbound) =
            ConnectionClient::new(connector, options(), store().await);

        // Left over from a previous socket.
        client.pairing.handle(PairingEvent::Paired);

        open_by_hand(&mut client).await;
        let _peer = next_peer(&mut peers).await;
        assert_eq!(client.pairing.state(), PairingState::Unpaired);
        assert!(handle.status().connection.is_connected());
        assert!(!handle.status().is_ready());
    }
}
