//! # Host Server Module
//!
//! The desktop side of the device link: a WebSocket server that identifies
//! companions by header, gates them behind pairing, and routes their
//! messages to the host's domain layer.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Host Server Architecture                         │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                      HostServer (Axum)                          │   │
//! │  │                                                                 │   │
//! │  │  /        ──▶ headers checked ──▶ WebSocket upgrade             │   │
//! │  │  /health  ──▶ "OK"                    │                         │   │
//! │  │                                       ▼                         │   │
//! │  │                             ┌─────────────────┐                 │   │
//! │  │                             │     Session     │ ◀── one task    │   │
//! │  │                             │ (pairing gate)  │     per device  │   │
//! │  │                             └────────┬────────┘                 │   │
//! │  │                                      │                          │   │
//! │  │              ┌───────────────────────┼──────────────┐           │   │
//! │  │              ▼                       ▼              ▼           │   │
//! │  │      TrustStoreRepository     HostDispatcher    session registry│   │
//! │  │      (SQLite devices)         (domain layer)    (RwLock<HashMap>│   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  Session Flow:                                                          │
//! │  ─────────────                                                          │
//! │  1. Upgrade carries X-Device-ID / X-Device-Type / X-Device-Name        │
//! │  2. Trusted device   → connected{authenticated:true}                    │
//! │     Unknown device   → connected, pairing_required, 120s window         │
//! │  3. pair{code} match → paired (trust persisted)                         │
//! │     mismatch         → pairing_failed, window keeps running             │
//! │  4. Window expires   → pairing_timeout, session closed                  │
//! │  5. Paired sessions exchange domain messages via the dispatcher         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A device that reconnects while its previous socket is still open replaces
//! it: the newest session wins.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::dispatcher::{HostCollaborator, HostDispatcher, Outbound};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{self, Decoded, PairRequest, SyncMessage};
use crate::scheduler::TimerSlot;
use crate::transport::{DeviceHeaders, HEADER_DEVICE_ID, HEADER_DEVICE_NAME, HEADER_DEVICE_TYPE};
use pantry_core::validation::{normalize_device_name, validate_device_id};
use pantry_core::{DeviceIdentity, DeviceType, PairingCode};
use pantry_db::TrustStoreRepository;

// =============================================================================
// Constants
// =============================================================================

/// Maximum message size (1MB).
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Per-session outbound queue.
const OUTGOING_CAPACITY: usize = 64;

/// How long a closing session may take to flush its close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

const INVALID_CODE_MESSAGE: &str = "Invalid pairing code";

// =============================================================================
// Host Options
// =============================================================================

/// Runtime settings for the host server.
#[derive(Debug, Clone)]
pub struct HostOptions {
    /// `ip:port` to listen on; port 0 picks a free port.
    pub bind_address: String,
    pub ping_interval: Duration,
    /// Per-session window for submitting a pairing code.
    pub pairing_timeout: Duration,
    pub pairing_code_ttl: Duration,
}

impl HostOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        HostOptions {
            bind_address: config.host.bind_address(),
            ping_interval: config.host_ping_interval(),
            pairing_timeout: config.pairing_timeout(),
            pairing_code_ttl: config.pairing_code_ttl(),
        }
    }
}

impl Default for HostOptions {
    fn default() -> Self {
        HostOptions::from_config(&SyncConfig::default())
    }
}

// =============================================================================
// Session Registry
// =============================================================================

/// A live companion connection, as shown to the host operator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceType,
    pub addr: SocketAddr,
    pub paired: bool,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Instructions from outside the session task.
#[derive(Debug)]
enum Control {
    PairingTimeout,
    /// Trust withdrawn by the operator.
    Revoke,
    /// Same device opened a newer socket.
    Replaced,
}

struct SessionEntry {
    session_id: u64,
    info: SessionInfo,
    outgoing: mpsc::Sender<Message>,
    control: mpsc::UnboundedSender<Control>,
}

// =============================================================================
// Host State
// =============================================================================

/// Shared state for the host server.
pub struct HostState {
    options: HostOptions,
    trust: TrustStoreRepository,
    dispatcher: HostDispatcher,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    pairing: Mutex<PairingCode>,
    next_session_id: AtomicU64,
}

impl HostState {
    fn new(
        options: HostOptions,
        trust: TrustStoreRepository,
        collaborator: Arc<dyn HostCollaborator>,
    ) -> Self {
        let pairing = Mutex::new(PairingCode::generate(options.pairing_code_ttl));
        HostState {
            options,
            trust,
            dispatcher: HostDispatcher::new(collaborator),
            sessions: RwLock::new(HashMap::new()),
            pairing,
            next_session_id: AtomicU64::new(1),
        }
    }

    /// The active code, rotated first if it has expired.
    async fn pairing_code(&self) -> String {
        let mut code = self.pairing.lock().await;
        if code.is_expired() {
            *code = PairingCode::generate(self.options.pairing_code_ttl);
            info!("Pairing code expired, rotated");
        }
        code.code().to_string()
    }

    async fn rotate_pairing_code(&self) -> String {
        let mut code = self.pairing.lock().await;
        *code = PairingCode::generate(self.options.pairing_code_ttl);
        info!("Pairing code rotated");
        code.code().to_string()
    }

    async fn check_pairing_code(&self, candidate: &str) -> bool {
        let mut code = self.pairing.lock().await;
        if code.is_expired() {
            *code = PairingCode::generate(self.options.pairing_code_ttl);
            info!("Pairing code expired, rotated");
            return false;
        }
        code.matches(candidate)
    }

    /// Serializes once and queues on every paired session except `except`.
    async fn broadcast(&self, message: &SyncMessage, except: Option<&str>) -> SyncResult<usize> {
        let text = Utf8Bytes::from(message.to_json()?);

        let targets: Vec<(String, mpsc::Sender<Message>)> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| s.info.paired && Some(s.info.device_id.as_str()) != except)
                .map(|s| (s.info.device_id.clone(), s.outgoing.clone()))
                .collect()
        };

        let mut delivered = 0;
        for (device_id, outgoing) in targets {
            if outgoing.send(Message::Text(text.clone())).await.is_ok() {
                delivered += 1;
            } else {
                debug!(device_id = %device_id, "Session closed before broadcast");
            }
        }
        Ok(delivered)
    }

    async fn mark_paired(&self, device_id: &str, session_id: u64) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(device_id) {
            if entry.session_id == session_id {
                entry.info.paired = true;
            }
        }
    }

    async fn touch(&self, device_id: &str, session_id: u64) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(device_id) {
            if entry.session_id == session_id {
                entry.info.last_activity = Utc::now();
            }
        }
    }

    async fn remove_session(&self, device_id: &str, session_id: u64) {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(device_id)
            .is_some_and(|entry| entry.session_id == session_id)
        {
            sessions.remove(device_id);
        }
    }
}

// =============================================================================
// Host Server
// =============================================================================

/// The main host server that manages companion sessions.
pub struct HostServer {
    state: Arc<HostState>,
}

/// Handle for operating the host server.
#[derive(Clone)]
pub struct HostHandle {
    state: Arc<HostState>,
    local_addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
}

impl HostHandle {
    /// Current pairing code for display to the operator.
    pub async fn pairing_code(&self) -> String {
        self.state.pairing_code().await
    }

    pub async fn rotate_pairing_code(&self) -> String {
        self.state.rotate_pairing_code().await
    }

    /// Every device that ever completed a handshake.
    pub async fn devices(&self) -> SyncResult<Vec<DeviceIdentity>> {
        Ok(self.state.trust.list().await?)
    }

    /// Live sessions.
    pub async fn connected(&self) -> Vec<SessionInfo> {
        let sessions = self.state.sessions.read().await;
        let mut infos: Vec<_> = sessions.values().map(|s| s.info.clone()).collect();
        infos.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        infos
    }

    /// Deletes the device's identity and ends its live session with `unpaired`.
    pub async fn untrust(&self, device_id: &str) -> SyncResult<()> {
        let removed = self.state.trust.remove(device_id).await?;

        let live = {
            let sessions = self.state.sessions.read().await;
            sessions
                .get(device_id)
                .map(|entry| entry.control.send(Control::Revoke).is_ok())
                .unwrap_or(false)
        };

        if !removed && !live {
            return Err(SyncError::UnknownDevice(device_id.to_string()));
        }
        info!(device_id = %device_id, live, "Device untrusted");
        Ok(())
    }

    /// Pushes a domain event to every paired session. Returns how many got it.
    pub async fn publish(&self, message: &SyncMessage) -> SyncResult<usize> {
        self.state.broadcast(message, None).await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shuts down the host server.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Host shutdown channel closed".into()))
    }
}

impl HostServer {
    pub fn new(
        options: HostOptions,
        trust: TrustStoreRepository,
        collaborator: Arc<dyn HostCollaborator>,
    ) -> Self {
        HostServer {
            state: Arc::new(HostState::new(options, trust, collaborator)),
        }
    }

    /// Binds, starts serving and returns a handle.
    pub async fn start(self) -> SyncResult<HostHandle> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let app = Router::new()
            .route("/", get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(self.state.clone());

        let bind_addr = self.state.options.bind_address.clone();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| SyncError::BindFailed {
                addr: bind_addr.clone(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr().map_err(|e| SyncError::BindFailed {
            addr: bind_addr.clone(),
            reason: e.to_string(),
        })?;

        info!(addr = %local_addr, "Host server started");

        tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                shutdown_rx.recv().await;
                info!("Host server shutting down");
            })
            .await;

            if let Err(e) = result {
                error!(?e, "Host server stopped with error");
            }
        });

        Ok(HostHandle {
            state: self.state,
            local_addr,
            shutdown_tx,
        })
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler() -> impl IntoResponse {
    "OK"
}

/// Reads the identification headers. Only a missing or invalid id rejects.
fn identify(headers: &HeaderMap) -> Result<DeviceHeaders, (StatusCode, String)> {
    let header_text =
        |name: &str| headers.get(name).map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned());

    let device_id = header_text(HEADER_DEVICE_ID)
        .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("missing {} header", HEADER_DEVICE_ID)))?;
    validate_device_id(&device_id).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let device_type = match header_text(HEADER_DEVICE_TYPE) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(device_id = %device_id, device_type = %raw, "Unknown device type, assuming phone");
            DeviceType::Phone
        }),
        None => DeviceType::default(),
    };

    Ok(DeviceHeaders {
        device_name: normalize_device_name(header_text(HEADER_DEVICE_NAME).as_deref()),
        device_id,
        device_type,
    })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<HostState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let device = match identify(&headers) {
        Ok(device) => device,
        Err((status, reason)) => {
            warn!(addr = %addr, %reason, "Rejecting connection");
            return (status, reason).into_response();
        }
    };

    info!(
        addr = %addr,
        device_id = %device.device_id,
        device_type = %device.device_type,
        "New WebSocket connection"
    );
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, device, addr))
}

// =============================================================================
// Session
// =============================================================================

/// One companion connection, owned by its socket task.
struct Session {
    state: Arc<HostState>,
    id: u64,
    device: DeviceHeaders,
    paired: bool,
    outgoing: mpsc::Sender<Message>,
    control: mpsc::UnboundedSender<Control>,
    pairing_timer: TimerSlot,
}

impl Session {
    async fn send(&self, message: &SyncMessage) -> bool {
        match message.to_json() {
            Ok(json) => self.outgoing.send(Message::Text(json.into())).await.is_ok(),
            Err(e) => {
                warn!(device_id = %self.device.device_id, ?e, "Failed to serialize message");
                false
            }
        }
    }

    async fn close(&self, reason: &'static str) {
        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: reason.into(),
        };
        let _ = self.outgoing.send(Message::Close(Some(frame))).await;
    }

    /// Registers the session and runs the trust check. `false` ends it.
    async fn open(&mut self, addr: SocketAddr) -> bool {
        let device_id = self.device.device_id.clone();
        let now = Utc::now();

        {
            let mut sessions = self.state.sessions.write().await;
            let previous = sessions.insert(
                device_id.clone(),
                SessionEntry {
                    session_id: self.id,
                    info: SessionInfo {
                        device_id: device_id.clone(),
                        device_name: self.device.device_name.clone(),
                        device_type: self.device.device_type,
                        addr,
                        paired: false,
                        connected_at: now,
                        last_activity: now,
                    },
                    outgoing: self.outgoing.clone(),
                    control: self.control.clone(),
                },
            );
            if let Some(previous) = previous {
                info!(device_id = %device_id, "Replacing older session");
                let _ = previous.control.send(Control::Replaced);
            }
        }

        let identity = match self
            .state
            .trust
            .upsert_seen(&device_id, self.device.device_type, &self.device.device_name)
            .await
        {
            Ok(identity) => identity,
            Err(e) => {
                error!(device_id = %device_id, ?e, "Failed to record device");
                self.send(&SyncMessage::error("Host storage unavailable")).await;
                self.close("storage error").await;
                return false;
            }
        };

        if identity.trusted {
            self.paired = true;
            self.state.mark_paired(&device_id, self.id).await;
            info!(device_id = %device_id, "Trusted device connected");
            return self.send(&SyncMessage::Connected { authenticated: true }).await;
        }

        info!(device_id = %device_id, "Device requires pairing");
        if !self.send(&SyncMessage::Connected { authenticated: false }).await
            || !self.send(&SyncMessage::PairingRequired).await
        {
            return false;
        }

        let control = self.control.clone();
        self.pairing_timer
            .schedule(self.state.options.pairing_timeout, async move {
                let _ = control.send(Control::PairingTimeout);
            });
        true
    }

    /// Handles one decoded frame.
    async fn on_message(&mut self, message: SyncMessage) {
        match message {
            SyncMessage::Ping => {
                self.send(&SyncMessage::Pong).await;
            }
            SyncMessage::Pong => {}
            SyncMessage::Pair(request) => self.on_pair(request).await,
            message if !self.paired => {
                debug!(
                    device_id = %self.device.device_id,
                    msg_type = message.type_name(),
                    "Rejecting message from unpaired device"
                );
                self.send(&SyncMessage::not_authenticated()).await;
            }
            message => {
                let device_id = self.device.device_id.clone();
                for outbound in self.state.dispatcher.route(&device_id, message).await {
                    match outbound {
                        Outbound::Reply(reply) => {
                            self.send(&reply).await;
                        }
                        Outbound::Broadcast(message) => {
                            if let Err(e) = self.state.broadcast(&message, None).await {
                                warn!(?e, "Broadcast failed");
                            }
                        }
                        Outbound::BroadcastOthers(message) => {
                            if let Err(e) = self.state.broadcast(&message, Some(&device_id)).await {
                                warn!(?e, "Broadcast failed");
                            }
                        }
                    }
                }
            }
        }
    }

    async fn on_pair(&mut self, request: PairRequest) {
        let device_id = self.device.device_id.clone();

        if self.paired {
            debug!(device_id = %device_id, "Pair request from paired device");
            self.send(&SyncMessage::Paired).await;
            return;
        }

        if !self.state.check_pairing_code(&request.code).await {
            info!(device_id = %device_id, "Pairing code rejected");
            self.send(&SyncMessage::pairing_failed(INVALID_CODE_MESSAGE)).await;
            return;
        }

        if !request.device_name.trim().is_empty() {
            self.device.device_name = normalize_device_name(Some(&request.device_name));
        }

        let persisted = async {
            self.state
                .trust
                .upsert_seen(&device_id, self.device.device_type, &self.device.device_name)
                .await?;
            self.state.trust.set_trusted(&device_id, true).await
        };
        if let Err(e) = persisted.await {
            error!(device_id = %device_id, ?e, "Failed to persist trust");
            self.send(&SyncMessage::pairing_failed("Host could not save pairing")).await;
            return;
        }

        self.paired = true;
        self.pairing_timer.cancel();
        self.state.mark_paired(&device_id, self.id).await;
        info!(device_id = %device_id, device_name = %self.device.device_name, "Device paired");
        self.send(&SyncMessage::Paired).await;
    }

    /// Returns `false` when the session must end.
    async fn on_control(&mut self, control: Control) -> bool {
        let device_id = &self.device.device_id;
        match control {
            Control::PairingTimeout => {
                if self.paired {
                    return true;
                }
                info!(device_id = %device_id, "Pairing window expired");
                self.send(&SyncMessage::PairingTimeout).await;
                self.close("pairing timeout").await;
            }
            Control::Revoke => {
                self.send(&SyncMessage::Unpaired).await;
                self.close("unpaired").await;
            }
            Control::Replaced => {
                debug!(device_id = %device_id, "Session superseded");
                self.close("replaced").await;
            }
        }
        false
    }
}

/// Handles a WebSocket connection.
async fn handle_socket(
    socket: WebSocket,
    state: Arc<HostState>,
    device: DeviceHeaders,
    addr: SocketAddr,
) {
    let (mut sender, mut receiver) = socket.split();
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Message>(OUTGOING_CAPACITY);
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<Control>();

    // Outgoing message task
    let writer = tokio::spawn(async move {
        while let Some(msg) = outgoing_rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sender.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    // Ping task
    let outgoing_tx_ping = outgoing_tx.clone();
    let ping_every = state.options.ping_interval;
    let ping_handle = tokio::spawn(async move {
        let mut ping_interval = interval(ping_every);
        ping_interval.tick().await;
        loop {
            ping_interval.tick().await;
            if outgoing_tx_ping.send(Message::Ping(Default::default())).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session {
        id: state.next_session_id.fetch_add(1, Ordering::Relaxed),
        state: state.clone(),
        device,
        paired: false,
        outgoing: outgoing_tx,
        control: control_tx,
        pairing_timer: TimerSlot::new("pairing_window"),
    };
    let device_id = session.device.device_id.clone();

    if session.open(addr).await {
        // Main receive loop
        loop {
            tokio::select! {
                frame = receiver.next() => {
                    let decoded = match frame {
                        Some(Ok(Message::Text(text))) => protocol::decode(text.as_str()),
                        Some(Ok(Message::Binary(bytes))) => protocol::decode_bytes(&bytes),
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                            state.touch(&device_id, session.id).await;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!(device_id = %device_id, "Client requested close");
                            break;
                        }
                        Some(Err(e)) => {
                            warn!(device_id = %device_id, ?e, "WebSocket error");
                            break;
                        }
                        None => {
                            info!(device_id = %device_id, "Client disconnected");
                            break;
                        }
                    };
                    state.touch(&device_id, session.id).await;

                    match decoded {
                        Decoded::Message(message) => session.on_message(message).await,
                        Decoded::Unrecognized { kind } => {
                            warn!(device_id = %device_id, %kind, "Unknown message type");
                        }
                        Decoded::Malformed { reason } => {
                            warn!(device_id = %device_id, %reason, "Malformed frame");
                        }
                    }
                }
                Some(control) = control_rx.recv() => {
                    if !session.on_control(control).await {
                        break;
                    }
                }
            }
        }
    }

    // Cleanup
    ping_handle.abort();
    session.pairing_timer.cancel();
    state.remove_session(&device_id, session.id).await;
    drop(session);
    if tokio::time::timeout(CLOSE_GRACE, writer).await.is_err() {
        debug!(device_id = %device_id, "Writer did not finish in time");
    }
    debug!(device_id = %device_id, "Session ended");
}
