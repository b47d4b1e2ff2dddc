//! # Domain Types
//!
//! Core domain types shared by the host and the companions.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │ DeviceIdentity  │   │   LinkStatus    │   │  ShoppingItem   │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  device_id      │   │  connection     │   │  id             │       │
//! │  │  device_type    │   │  pairing        │   │  name           │       │
//! │  │  device_name    │   │  attempts       │   │  purchased      │       │
//! │  │  trusted        │   └─────────────────┘   │  locally_added  │       │
//! │  └─────────────────┘                         └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │   DeviceType    │   │ConnectionStatus │   │  PairingState   │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  Tablet         │   │  Disconnected   │   │  Unpaired       │       │
//! │  │  Phone          │   │  Connecting     │   │  PairingRequired│       │
//! │  └─────────────────┘   │  Connected      │   │  Paired         │       │
//! │                        │  Error(reason)  │   └─────────────────┘       │
//! │                        └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ownership
//! - `device_id` is generated once by the companion and never changes
//! - `trusted` is owned by the host; companions only keep a local marker

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::CoreError;
use crate::merge::SyncItem;

// =============================================================================
// Device Type
// =============================================================================

/// Kind of companion device, sent in the `X-Device-Type` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Tablet,
    Phone,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Phone
    }
}

impl DeviceType {
    /// Header value for this device type.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Tablet => "tablet",
            DeviceType::Phone => "phone",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tablet" => Ok(DeviceType::Tablet),
            "phone" => Ok(DeviceType::Phone),
            other => Err(CoreError::UnknownDeviceType(other.to_string())),
        }
    }
}

// =============================================================================
// Device Identity
// =============================================================================

/// A companion device as known to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    /// Opaque stable identifier generated by the companion.
    pub device_id: String,
    pub device_type: DeviceType,
    /// Human-readable name shown in the host's device list.
    pub device_name: String,
    /// Whether the host operator (or a successful pairing) trusts this device.
    pub trusted: bool,
    #[ts(as = "String")]
    pub first_seen: DateTime<Utc>,
    #[ts(as = "String")]
    pub last_seen: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub paired_at: Option<DateTime<Utc>>,
}

impl DeviceIdentity {
    /// Creates an untrusted identity first seen now.
    pub fn new(
        device_id: impl Into<String>,
        device_type: DeviceType,
        device_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            device_id: device_id.into(),
            device_type,
            device_name: device_name.into(),
            trusted: false,
            first_seen: now,
            last_seen: now,
            paired_at: None,
        }
    }
}

// =============================================================================
// Connection Status
// =============================================================================

/// Socket-level status of a session or client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal failure; only an explicit connect retries.
    Error { reason: String },
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        ConnectionStatus::Disconnected
    }
}

impl ConnectionStatus {
    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Error { reason } => write!(f, "error: {}", reason),
        }
    }
}

// =============================================================================
// Pairing State
// =============================================================================

/// Trust state of the link as seen by the companion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum PairingState {
    Unpaired,
    PairingRequired,
    Paired,
}

impl Default for PairingState {
    fn default() -> Self {
        PairingState::Unpaired
    }
}

impl fmt::Display for PairingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingState::Unpaired => write!(f, "unpaired"),
            PairingState::PairingRequired => write!(f, "pairing_required"),
            PairingState::Paired => write!(f, "paired"),
        }
    }
}

// =============================================================================
// Link Status
// =============================================================================

/// Everything the UI observes about the link, published as one value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct LinkStatus {
    pub connection: ConnectionStatus,
    pub pairing: PairingState,
    pub reconnect_attempts: u32,
    /// User-facing message from the last pairing rejection.
    pub pairing_error: Option<String>,
}

impl LinkStatus {
    /// Connected and paired: the only state in which domain sends go out.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.connection.is_connected() && self.pairing == PairingState::Paired
    }
}

// =============================================================================
// Shopping Item
// =============================================================================

/// A shopping-list entry as mirrored on companions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ShoppingItem {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub purchased: bool,
    /// Added on this companion and not yet known to the host.
    #[serde(default)]
    pub locally_added: bool,
}

impl ShoppingItem {
    /// Creates a locally added item with a fresh id.
    pub fn new_local(name: impl Into<String>, quantity: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            quantity,
            category: None,
            purchased: false,
            locally_added: true,
        }
    }
}

impl SyncItem for ShoppingItem {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_completed(&self) -> bool {
        self.purchased
    }

    fn set_completed(&mut self, completed: bool) {
        self.purchased = completed;
    }

    fn is_local_only(&self) -> bool {
        self.locally_added
    }

    fn keep_local_edits(&self, incoming: &Self) -> Self {
        // Host owns name/quantity/category, the user owns the check mark.
        Self {
            purchased: self.purchased,
            locally_added: false,
            ..incoming.clone()
        }
    }

    fn same_user_state(&self, other: &Self) -> bool {
        self.purchased == other.purchased
    }
}

// =============================================================================
// Item Change
// =============================================================================

/// Kind of local edit carried in a `sync_changes` batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Add,
    Update,
    Delete,
}

/// One entry of a `sync_changes` batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemChange<T> {
    pub id: String,
    pub action: ChangeAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<T>,
}
