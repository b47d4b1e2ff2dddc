//! # WebSocket Transport
//!
//! Opens the companion's socket to the host and hands the connection
//! client a framed, boxed link. Reconnects, keep-alive and pairing live in
//! [`crate::client`]; this module only dials.
//!
//! ## Handshake
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Companion                                            Host              │
//! │                                                                         │
//! │  GET ws://host:8080/                                                    │
//! │    X-Device-ID:   3f1c…            ───────────────►   identify device   │
//! │    X-Device-Type: tablet                              (400 without ID)  │
//! │    X-Device-Name: Kitchen tablet                                        │
//! │                                    ◄───────────────   101 Switching     │
//! │                                                                         │
//! │  Link { sink: Frame ─►, stream: ◄─ Frame }                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The [`Connector`] trait is the seam between the state machine and the
//! network: production uses [`WsConnector`], state-machine tests use an
//! in-memory connector.

use std::pin::Pin;

use futures_util::future::{self, BoxFuture};
use futures_util::stream::BoxStream;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use pantry_core::DeviceType;

/// Header carrying the companion's stable device id.
pub const HEADER_DEVICE_ID: &str = "X-Device-ID";
pub const HEADER_DEVICE_TYPE: &str = "X-Device-Type";
pub const HEADER_DEVICE_NAME: &str = "X-Device-Name";

// =============================================================================
// Frames and Links
// =============================================================================

/// A data frame as the client sees it. WebSocket ping/pong frames are
/// answered by the socket layer and never surface here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// Close with "going away" (outbound) or a close from the peer (inbound).
    Close,
}

impl Frame {
    fn into_ws(self) -> WsMessage {
        match self {
            Frame::Text(text) => WsMessage::Text(text.into()),
            Frame::Binary(bytes) => WsMessage::Binary(bytes.into()),
            Frame::Close => WsMessage::Close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "going away".into(),
            })),
        }
    }

    fn from_ws(message: WsMessage) -> Option<Self> {
        match message {
            WsMessage::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
            WsMessage::Binary(bytes) => Some(Frame::Binary(bytes.to_vec())),
            WsMessage::Close(_) => Some(Frame::Close),
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => None,
        }
    }
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = SyncError> + Send>>;
pub type FrameStream = BoxStream<'static, SyncResult<Frame>>;

/// An open connection, split into its two halves.
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

/// Identification headers attached to every handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHeaders {
    pub device_id: String,
    pub device_type: DeviceType,
    pub device_name: String,
}

// =============================================================================
// Connector
// =============================================================================

/// Dials the host. Implementations must not retry; the client owns policy.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str, headers: &DeviceHeaders) -> BoxFuture<'static, SyncResult<Link>>;
}

/// tokio-tungstenite connector (ws:// and wss:// via native-tls).
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        WsConnector
    }
}

fn header_value(value: &str) -> SyncResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| SyncError::InvalidConfig(format!("invalid header value {:?}: {}", value, e)))
}

fn build_request(
    url: &str,
    headers: &DeviceHeaders,
) -> SyncResult<tokio_tungstenite::tungstenite::handshake::client::Request> {
    let mut request = url.into_client_request()?;
    let map = request.headers_mut();
    map.insert(HEADER_DEVICE_ID, header_value(&headers.device_id)?);
    map.insert(HEADER_DEVICE_TYPE, header_value(headers.device_type.as_str())?);
    map.insert(HEADER_DEVICE_NAME, header_value(&headers.device_name)?);
    Ok(request)
}

impl Connector for WsConnector {
    fn connect(&self, url: &str, headers: &DeviceHeaders) -> BoxFuture<'static, SyncResult<Link>> {
        let request = build_request(url, headers);

        Box::pin(async move {
            let (ws_stream, response) = connect_async(request?).await?;
            debug!(status = ?response.status(), "WebSocket handshake complete");

            let (write, read) = ws_stream.split();
            let sink = write.with(|frame: Frame| future::ready(Ok::<_, SyncError>(frame.into_ws())));
            let stream = read.filter_map(|result| {
                future::ready(match result {
                    Ok(message) => Frame::from_ws(message).map(Ok),
                    Err(e) => Some(Err(SyncError::from(e))),
                })
            });

            Ok(Link {
                sink: Box::pin(sink),
                stream: stream.boxed(),
            })
        })
    }
}

// =============================================================================
// In-memory connector (tests)
// =============================================================================
