//! # Discovery Module
//!
//! LAN discovery between the desktop host and its companions over UDP
//! broadcast, plus normalization of user-entered host addresses.
//!
//! ## Discovery Protocol Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Discovery Protocol                                 │
//! │                                                                         │
//! │  HOST (Advertiser) Behavior:                                            │
//! │  ───────────────────────────                                            │
//! │  1. Bind UDP discovery port 5556                                        │
//! │  2. advertise(): broadcast one announce, remember it (last call wins)   │
//! │  3. Answer requests for our service type with a unicast announce        │
//! │                                                                         │
//! │  COMPANION (Resolver) Behavior:                                         │
//! │  ──────────────────────────────                                         │
//! │  1. Bind an ephemeral UDP port                                          │
//! │  2. Per attempt: broadcast a request, collect announces for 5 s         │
//! │  3. Yield every matching announce, then start the next attempt          │
//! │                                                                         │
//! │  ┌─────────────┐      UDP Broadcast        ┌─────────────┐              │
//! │  │  COMPANION  │ ══════════════════════▶   │    HOST     │              │
//! │  │             │      UDP Unicast Reply    │             │              │
//! │  │             │ ◀──────────────────────   │             │              │
//! │  └─────────────┘                           └─────────────┘              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Packet Layout
//! ```text
//! ┌──────────┬─────────┬──────┬───────────────────────────────────────────┐
//! │ "PNTY"   │ version │ type │ payload                                   │
//! │ 4 bytes  │ 1 byte  │ 1 b  │ request:  [len][service_type]             │
//! │          │         │      │ announce: [port u16 BE][len][service_type]│
//! │          │         │      │           [len][host_id][len][host_name]  │
//! └──────────┴─────────┴──────┴───────────────────────────────────────────┘
//! ```
//!
//! Network errors (unreachable broadcast, closed interfaces) are logged and
//! count as "no result this cycle"; discovery never takes the process down.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{timeout, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::config::DiscoverySettings;
use crate::error::{SyncError, SyncResult};
use pantry_core::DEFAULT_HOST_PORT;

// =============================================================================
// Constants
// =============================================================================

/// Service name the host advertises and companions look for.
pub const SERVICE_TYPE: &str = "_pantry-sync._tcp";

/// Default UDP discovery port.
pub const DEFAULT_DISCOVERY_PORT: u16 = 5556;

/// Discovery message magic bytes for validation.
const DISCOVERY_MAGIC: &[u8; 4] = b"PNTY";

/// Protocol version for discovery messages.
const DISCOVERY_PROTOCOL_VERSION: u8 = 1;

const HEADER_LEN: usize = 6;

const MAX_PACKET_LEN: usize = 1024;

// =============================================================================
// Discovery Messages
// =============================================================================

/// Discovery message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DiscoveryMessageType {
    /// Companion looking for a host.
    Request = 1,
    /// Host announcing itself.
    Announce = 2,
}

impl TryFrom<u8> for DiscoveryMessageType {
    type Error = SyncError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(DiscoveryMessageType::Request),
            2 => Ok(DiscoveryMessageType::Announce),
            _ => Err(SyncError::InvalidMessage(format!(
                "Unknown discovery message type: {}",
                value
            ))),
        }
    }
}

/// What the host puts on the wire when it announces itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAnnouncement {
    /// WebSocket port companions should dial.
    pub port: u16,
    pub service_type: String,
    pub host_id: String,
    pub host_name: String,
}

/// A parsed discovery packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryPacket {
    Request { service_type: String },
    Announce(HostAnnouncement),
}

/// A host found by the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHost {
    /// Source address of the announce.
    pub address: IpAddr,
    /// Announced WebSocket port.
    pub port: u16,
    pub host_id: String,
    pub host_name: String,
}

impl ResolvedHost {
    /// Returns the WebSocket URL for connecting to this host.
    pub fn ws_url(&self) -> String {
        format!("ws://{}", SocketAddr::new(self.address, self.port))
    }
}

fn header(msg_type: DiscoveryMessageType, capacity: usize) -> Vec<u8> {
    let mut msg = Vec::with_capacity(HEADER_LEN + capacity);
    msg.extend_from_slice(DISCOVERY_MAGIC);
    msg.push(DISCOVERY_PROTOCOL_VERSION);
    msg.push(msg_type as u8);
    msg
}

/// Appends a length-prefixed string, truncated to 255 bytes on a char boundary.
fn push_str(msg: &mut Vec<u8>, value: &str) {
    let mut end = value.len().min(u8::MAX as usize);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    msg.push(end as u8);
    msg.extend_from_slice(&value.as_bytes()[..end]);
}

/// Builds a discovery request for `service_type`.
pub fn build_request(service_type: &str) -> Vec<u8> {
    let mut msg = header(DiscoveryMessageType::Request, service_type.len() + 1);
    push_str(&mut msg, service_type);
    msg
}

/// Builds a host announcement.
pub fn build_announce(announce: &HostAnnouncement) -> Vec<u8> {
    let mut msg = header(DiscoveryMessageType::Announce, 64);
    msg.extend_from_slice(&announce.port.to_be_bytes());
    push_str(&mut msg, &announce.service_type);
    push_str(&mut msg, &announce.host_id);
    push_str(&mut msg, &announce.host_name);
    msg
}

struct PayloadReader<'a> {
    payload: &'a [u8],
    offset: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(payload: &'a [u8]) -> Self {
        Self { payload, offset: 0 }
    }

    fn take(&mut self, len: usize, what: &str) -> SyncResult<&'a [u8]> {
        let end = self.offset + len;
        if self.payload.len() < end {
            return Err(SyncError::InvalidMessage(format!("{} truncated", what)));
        }
        let slice = &self.payload[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u16(&mut self, what: &str) -> SyncResult<u16> {
        let bytes = self.take(2, what)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn string(&mut self, what: &str) -> SyncResult<String> {
        let len = self.take(1, what)?[0] as usize;
        let bytes = self.take(len, what)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| SyncError::InvalidMessage(format!("Invalid {} UTF-8", what)))
    }
}

/// Parses and validates a discovery packet.
pub fn parse_packet(data: &[u8]) -> SyncResult<DiscoveryPacket> {
    if data.len() < HEADER_LEN || &data[0..4] != DISCOVERY_MAGIC {
        return Err(SyncError::InvalidMessage("Invalid discovery magic".into()));
    }

    let version = data[4];
    if version != DISCOVERY_PROTOCOL_VERSION {
        return Err(SyncError::InvalidMessage(format!(
            "Unsupported discovery protocol version: {}",
            version
        )));
    }

    let mut reader = PayloadReader::new(&data[HEADER_LEN..]);
    match DiscoveryMessageType::try_from(data[5])? {
        DiscoveryMessageType::Request => Ok(DiscoveryPacket::Request {
            service_type: reader.string("service_type")?,
        }),
        DiscoveryMessageType::Announce => {
            let port = reader.u16("port")?;
            Ok(DiscoveryPacket::Announce(HostAnnouncement {
                port,
                service_type: reader.string("service_type")?,
                host_id: reader.string("host_id")?,
                host_name: reader.string("host_name")?,
            }))
        }
    }
}

// =============================================================================
// Address Normalization
// =============================================================================

/// Turns a user-entered host address into a WebSocket URL.
///
/// - `ws://…` / `wss://…` are used as-is
/// - `host` becomes `ws://host:8080`
/// - `host:port` becomes `ws://host:port`
pub fn normalize_server_url(input: &str) -> SyncResult<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(SyncError::InvalidUrl("empty address".into()));
    }

    let candidate = if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_string()
    } else if trimmed.contains("://") {
        return Err(SyncError::InvalidUrl(format!(
            "unsupported scheme in {}",
            trimmed
        )));
    } else {
        let authority = trimmed.trim_end_matches('/');
        if has_explicit_port(authority) {
            format!("ws://{}", authority)
        } else {
            format!("ws://{}:{}", authority, DEFAULT_HOST_PORT)
        }
    };

    let parsed = url::Url::parse(&candidate)?;
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(SyncError::InvalidUrl(format!("missing host in {}", trimmed)));
    }

    Ok(candidate)
}

fn has_explicit_port(authority: &str) -> bool {
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            !host.is_empty()
                && (!host.contains(':') || host.ends_with(']'))
                && port.parse::<u16>().is_ok()
        }
        None => false,
    }
}

// =============================================================================
// Advertiser (host side)
// =============================================================================

/// Handle for the running advertiser.
#[derive(Clone)]
pub struct AdvertiserHandle {
    socket: Arc<UdpSocket>,
    discovery_port: u16,
    host_id: String,
    host_name: String,
    current: Arc<RwLock<Option<HostAnnouncement>>>,
    shutdown_tx: mpsc::Sender<()>,
}

impl AdvertiserHandle {
    /// Starts (or replaces) the advertisement. Last call wins.
    ///
    /// Sends one broadcast announce; a failed broadcast is logged and the
    /// host still answers explicit requests.
    pub async fn advertise(&self, service_type: &str, host_port: u16) {
        let announce = HostAnnouncement {
            port: host_port,
            service_type: service_type.to_string(),
            host_id: self.host_id.clone(),
            host_name: self.host_name.clone(),
        };
        let msg = build_announce(&announce);
        *self.current.write().await = Some(announce);

        let broadcast_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), self.discovery_port);
        match self.socket.send_to(&msg, broadcast_addr).await {
            Ok(_) => info!(service_type, host_port, "Advertising host"),
            Err(e) => warn!(?e, "Failed to broadcast host announce"),
        }
    }

    /// Stops answering requests. Does not broadcast anything.
    pub async fn withdraw(&self) {
        *self.current.write().await = None;
    }

    /// The advertisement currently in effect.
    pub async fn current(&self) -> Option<HostAnnouncement> {
        self.current.read().await.clone()
    }

    /// Local address of the discovery socket.
    pub fn local_addr(&self) -> SyncResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Triggers graceful shutdown.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Advertiser shutdown channel closed".into()))
    }
}

/// Host-side discovery service.
pub struct Advertiser;

impl Advertiser {
    /// Binds the discovery port and starts answering requests.
    ///
    /// Port 0 binds an ephemeral port (see [`AdvertiserHandle::local_addr`]).
    pub async fn start(
        discovery_port: u16,
        host_id: impl Into<String>,
        host_name: impl Into<String>,
    ) -> SyncResult<AdvertiserHandle> {
        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, discovery_port);
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| SyncError::BindFailed {
                addr: bind_addr.to_string(),
                reason: e.to_string(),
            })?;

        if let Err(e) = socket.set_broadcast(true) {
            warn!(?e, "Failed to enable broadcast on discovery socket");
        }

        let socket = Arc::new(socket);
        let current = Arc::new(RwLock::new(None));
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        info!(port = discovery_port, "Discovery advertiser started");

        let listener_socket = socket.clone();
        let listener_current = current.clone();
        tokio::spawn(async move {
            Self::run_listener(listener_socket, listener_current, shutdown_rx).await;
        });

        Ok(AdvertiserHandle {
            socket,
            discovery_port,
            host_id: host_id.into(),
            host_name: host_name.into(),
            current,
            shutdown_tx,
        })
    }

    async fn run_listener(
        socket: Arc<UdpSocket>,
        current: Arc<RwLock<Option<HostAnnouncement>>>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let mut buf = [0u8; MAX_PACKET_LEN];

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Discovery advertiser shutting down");
                    break;
                }
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => {
                            if let Err(e) = Self::handle_packet(&buf[..len], from, &socket, &current).await {
                                debug!(?e, %from, "Dropped discovery packet");
                            }
                        }
                        Err(e) => warn!(?e, "Error receiving discovery packet"),
                    }
                }
            }
        }
    }

    async fn handle_packet(
        data: &[u8],
        from: SocketAddr,
        socket: &UdpSocket,
        current: &RwLock<Option<HostAnnouncement>>,
    ) -> SyncResult<()> {
        let DiscoveryPacket::Request { service_type } = parse_packet(data)? else {
            // Our own broadcast announce loops back; nothing to do.
            return Ok(());
        };

        let reply = match current.read().await.as_ref() {
            Some(announce) if announce.service_type == service_type => build_announce(announce),
            _ => {
                debug!(%from, %service_type, "Ignoring request for other service");
                return Ok(());
            }
        };

        debug!(%from, "Answering discovery request");
        socket
            .send_to(&reply, from)
            .await
            .map_err(|e| SyncError::ConnectionFailed(e.to_string()))?;
        Ok(())
    }
}

// =============================================================================
// Resolver (companion side)
// =============================================================================

/// Companion-side discovery: finds hosts advertising `service_type`.
#[derive(Debug, Clone)]
pub struct Resolver {
    service_type: String,
    target: SocketAddr,
    attempt_timeout: Duration,
}

impl Resolver {
    pub fn new(settings: &DiscoverySettings) -> Self {
        Resolver {
            service_type: settings.service_type.clone(),
            target: SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), settings.udp_port),
            attempt_timeout: Duration::from_secs(settings.timeout_secs),
        }
    }

    /// Sends requests to `target` instead of the broadcast address.
    pub fn with_target(mut self, target: SocketAddr) -> Self {
        self.target = target;
        self
    }

    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    /// Lazy, unbounded stream of resolved hosts.
    ///
    /// Runs attempts back to back until the stream is dropped. An attempt
    /// that finds nothing yields nothing.
    pub fn resolve(self) -> ReceiverStream<ResolvedHost> {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            self.run(tx).await;
        });
        ReceiverStream::new(rx)
    }

    async fn run(self, tx: mpsc::Sender<ResolvedHost>) {
        info!(service_type = %self.service_type, target = %self.target, "Resolver started");

        loop {
            let socket = match self.bind().await {
                Ok(socket) => socket,
                Err(e) => {
                    warn!(?e, "Resolver could not bind, no result this cycle");
                    tokio::select! {
                        _ = tokio::time::sleep(self.attempt_timeout) => continue,
                        _ = tx.closed() => break,
                    }
                }
            };

            loop {
                let found = tokio::select! {
                    found = self.attempt(&socket) => found,
                    _ = tx.closed() => {
                        debug!("Resolver stream dropped");
                        return;
                    }
                };

                for host in found {
                    if tx.send(host).await.is_err() {
                        return;
                    }
                }
            }
        }

        debug!("Resolver stopped");
    }

    async fn bind(&self) -> SyncResult<UdpSocket> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| SyncError::BindFailed {
                addr: "0.0.0.0:0".into(),
                reason: e.to_string(),
            })?;
        socket
            .set_broadcast(true)
            .map_err(|e| SyncError::ConnectionFailed(format!("Failed to enable broadcast: {}", e)))?;
        Ok(socket)
    }

    /// Runs a single attempt and returns the hosts found.
    pub async fn resolve_once(&self) -> SyncResult<Vec<ResolvedHost>> {
        let socket = self.bind().await?;
        Ok(self.attempt(&socket).await)
    }

    /// One request plus a collection window of `attempt_timeout`.
    async fn attempt(&self, socket: &UdpSocket) -> Vec<ResolvedHost> {
        let deadline = Instant::now() + self.attempt_timeout;

        if let Err(e) = socket
            .send_to(&build_request(&self.service_type), self.target)
            .await
        {
            warn!(?e, "Discovery request failed, no result this cycle");
            tokio::time::sleep_until(deadline).await;
            return Vec::new();
        }

        let mut hosts: HashMap<String, ResolvedHost> = HashMap::new();
        let mut buf = [0u8; MAX_PACKET_LEN];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match timeout(remaining, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, from))) => match parse_packet(&buf[..len]) {
                    Ok(DiscoveryPacket::Announce(announce))
                        if announce.service_type == self.service_type =>
                    {
                        debug!(host_id = %announce.host_id, %from, "Found host");
                        hosts.insert(
                            announce.host_id.clone(),
                            ResolvedHost {
                                address: from.ip(),
                                port: announce.port,
                                host_id: announce.host_id,
                                host_name: announce.host_name,
                            },
                        );
                    }
                    Ok(_) => {}
                    Err(e) => debug!(?e, %from, "Dropped discovery packet"),
                },
                Ok(Err(e)) => {
                    debug!(?e, "Error receiving discovery response");
                }
                Err(_) => break,
            }
        }

        hosts.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    fn announce() -> HostAnnouncement {
        HostAnnouncement {
            port: 8080,
            service_type: SERVICE_TYPE.into(),
            host_id: "host-1".into(),
            host_name: "Kitchen PC".into(),
        }
    }

    #[test]
    fn test_discovery_message_type() {
        assert_eq!(
            DiscoveryMessageType::try_from(1).unwrap(),
            DiscoveryMessageType::Request
        );
        assert_eq!(
            DiscoveryMessageType::try_from(2).unwrap(),
            DiscoveryMessageType::Announce
        );
        assert!(DiscoveryMessageType::try_from(3).is_err());
    }

    #[test]
    fn test_packet_header() {
        let msg = build_request(SERVICE_TYPE);
        assert_eq!(&msg[0..4], DISCOVERY_MAGIC);
        assert_eq!(msg[4], DISCOVERY_PROTOCOL_VERSION);
        assert_eq!(msg[5], DiscoveryMessageType::Request as u8);

        let msg = build_announce(&announce());
        assert_eq!(msg[5], DiscoveryMessageType::Announce as u8);
        assert_eq!(u16::from_be_bytes([msg[6], msg[7]]), 8080);
    }

    #[test]
    fn test_parse_announce() {
        let parsed = parse_packet(&build_announce(&announce())).unwrap();
        assert_eq!(parsed, DiscoveryPacket::Announce(announce()));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_packet(b"").is_err());
        assert!(parse_packet(b"TPOS\x01\x01").is_err());
        assert!(parse_packet(b"PNTY\x02\x01\x00").is_err());

        let mut truncated = build_announce(&announce());
        truncated.truncate(truncated.len() - 3);
        assert!(parse_packet(&truncated).is_err());
    }

    #[test]
    fn test_long_names_truncated_on_char_boundary() {
        let mut long = announce();
        long.host_name = "é".repeat(200);
        let parsed = parse_packet(&build_announce(&long)).unwrap();
        let DiscoveryPacket::Announce(parsed) = parsed else {
            panic!("expected announce");
        };
        assert_eq!(parsed.host_name.chars().count(), 127);
    }

    #[test]
    fn test_resolved_host_ws_url() {
        let host = ResolvedHost {
            address: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)),
            port: 8080,
            host_id: "h".into(),
            host_name: "Kitchen".into(),
        };
        assert_eq!(host.ws_url(), "ws://192.168.1.100:8080");
    }

    #[test]
    fn test_normalize_server_url() {
        assert_eq!(
            normalize_server_url("192.168.1.20").unwrap(),
            "ws://192.168.1.20:8080"
        );
        assert_eq!(
            normalize_server_url("kitchen.local:9000").unwrap(),
            "ws://kitchen.local:9000"
        );
        assert_eq!(
            normalize_server_url(" ws://10.0.0.2:8080/ ").unwrap(),
            "ws://10.0.0.2:8080/"
        );
        assert_eq!(
            normalize_server_url("wss://pantry.example.com").unwrap(),
            "wss://pantry.example.com"
        );
        assert_eq!(normalize_server_url("[::1]").unwrap(), "ws://[::1]:8080");
        assert_eq!(normalize_server_url("[::1]:81").unwrap(), "ws://[::1]:81");

        assert!(normalize_server_url("").is_err());
        assert!(normalize_server_url("http://example.com").is_err());
        assert!(normalize_server_url("ws://").is_err());
    }

    #[tokio::test]
    async fn test_advertise_and_resolve_on_loopback() {
        let advertiser = Advertiser::start(0, "host-1", "Kitchen PC").await.unwrap();
        let port = advertiser.local_addr().unwrap().port();

        let settings = DiscoverySettings::default();
        let resolver = Resolver::new(&settings)
            .with_target(SocketAddr::from(([127, 0, 0, 1], port)))
            .with_attempt_timeout(Duration::from_millis(300));

        // Not advertising yet: the attempt yields nothing.
        assert!(resolver.resolve_once().await.unwrap().is_empty());

        advertiser.advertise(SERVICE_TYPE, 9100).await;
        advertiser.advertise(SERVICE_TYPE, 9200).await;
        assert_eq!(advertiser.current().await.unwrap().port, 9200);

        let mut stream = resolver.resolve();
        let found = timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.port, 9200);
        assert_eq!(found.host_id, "host-1");
        assert_eq!(found.ws_url(), "ws://127.0.0.1:9200");

        advertiser.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_other_service_type_ignored() {
        let advertiser = Advertiser::start(0, "host-1", "Kitchen PC").await.unwrap();
        let port = advertiser.local_addr().unwrap().port();
        advertiser.advertise("_other._tcp", 9100).await;

        let resolver = Resolver::new(&DiscoverySettings::default())
            .with_target(SocketAddr::from(([127, 0, 0, 1], port)))
            .with_attempt_timeout(Duration::from_millis(200));
        assert!(resolver.resolve_once().await.unwrap().is_empty());
    }
}
