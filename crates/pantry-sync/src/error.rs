//! # Sync Error Types
//!
//! Error types for the pairing and sync layer.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  InvalidMessage         │ │
//! │  │  InvalidUrl     │  │  Disconnected   │  │  Serialization          │ │
//! │  │  ConfigLoad/Save│  │  Timeout, TLS   │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Pairing      │  │    Storage      │  │      Internal           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │ NotAuthenticated│  │  DatabaseError  │  │  ShuttingDown           │ │
//! │  │  UnknownDevice  │  │  Domain         │  │  ChannelError           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Retryable transport errors feed the reconnect policy; other transport
//! errors (TLS, bad handshake headers) stop the client at once. Pairing
//! errors go to the user and never consume reconnect budget. Protocol errors
//! are logged and dropped without touching the link.

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all pairing and sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Invalid host URL.
    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Failed to establish WebSocket connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// WebSocket disconnected unexpectedly.
    #[error("Disconnected from host")]
    Disconnected,

    /// Handshake or keep-alive timeout.
    #[error("Connection timeout after {0} seconds")]
    Timeout(u64),

    /// TLS/SSL error.
    #[error("TLS error: {0}")]
    TlsError(String),

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Local socket could not be bound (host server, discovery).
    #[error("Failed to bind {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Invalid message received.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Failed to serialize or deserialize a message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Pairing Errors
    // =========================================================================
    /// A message was sent before the device was paired.
    #[error("Device is not authenticated")]
    NotAuthenticated,

    /// Unknown device id on an operator action.
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Database query failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Domain rule violation from pantry-core.
    #[error("{0}")]
    Domain(#[from] pantry_core::CoreError),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Component is shutting down.
    #[error("Sync component is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<pantry_db::DbError> for SyncError {
    fn from(err: pantry_db::DbError) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed => SyncError::Disconnected,
            WsError::AlreadyClosed => SyncError::Disconnected,
            WsError::Protocol(p) => SyncError::WebSocketError(p.to_string()),
            WsError::Io(io) => SyncError::ConnectionFailed(io.to_string()),
            WsError::Tls(tls) => SyncError::TlsError(tls.to_string()),
            other => SyncError::WebSocketError(other.to_string()),
        }
    }
}

impl From<axum::Error> for SyncError {
    fn from(err: axum::Error) -> Self {
        SyncError::WebSocketError(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the reconnect policy should handle this error.
    ///
    /// ## Retryable Errors
    /// - Connection failures (network issues)
    /// - Timeouts
    /// - Disconnections and WebSocket protocol failures
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionFailed(_)
                | SyncError::Disconnected
                | SyncError::Timeout(_)
                | SyncError::WebSocketError(_)
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if this error indicates a malformed or unexpected message.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidMessage(_) | SyncError::SerializationFailed(_)
        )
    }

    /// Returns true if the user has to pair before retrying.
    pub fn is_pairing_error(&self) -> bool {
        matches!(self, SyncError::NotAuthenticated)
    }
}
