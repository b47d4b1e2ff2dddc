//! # Wire Protocol
//!
//! Message types exchanged between the desktop host and its companions.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Device Link Messages                             │
//! │                                                                         │
//! │  HANDSHAKE & PAIRING                                                   │
//! │  ───────────────────                                                   │
//! │  HOST      ───► connected { authenticated? }                           │
//! │  HOST      ───► pairing_required                                       │
//! │  COMPANION ───► pair { code, deviceName }                              │
//! │  HOST      ───► paired | pairing_failed { message } | pairing_timeout  │
//! │  HOST      ───► unpaired                                (revocation)   │
//! │                                                                         │
//! │  DOMAIN PUSHES (host → companion)                                      │
//! │  ────────────────────────────────                                      │
//! │  meal_plan, recipe              raw payload keyed by domain (fast path)│
//! │  todays_meals, store_list       { data }                               │
//! │  shopping_list(_update)         { data, version?, forceReplace? }      │
//! │                                                                         │
//! │  COMPANION EDITS                                                       │
//! │  ───────────────                                                       │
//! │  COMPANION ───► sync_changes { data: [change...] }                     │
//! │  HOST      ───► sync_confirmed                                         │
//! │  COMPANION ───► request_shopping_list | request_store_list             │
//! │                                                                         │
//! │  EITHER DIRECTION                                                      │
//! │  ────────────────                                                      │
//! │  ping / pong, timer_update { timers }, error { message, error? }       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! JSON text frames, internally tagged:
//! ```json
//! { "type": "pairing_failed", "message": "Invalid pairing code" }
//! ```
//!
//! Decoding never fails loudly: [`decode`] returns a [`Decoded`] that
//! separates known messages from unknown types and malformed frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use pantry_core::{ItemChange, ShoppingItem};

/// `error` code sent when an unpaired device talks out of turn.
pub const NOT_AUTHENTICATED: &str = "not_authenticated";

/// Every `type` tag this build understands.
pub const KNOWN_TYPES: &[&str] = &[
    "connected",
    "pairing_required",
    "pair",
    "paired",
    "pairing_failed",
    "pairing_timeout",
    "unpaired",
    "ping",
    "pong",
    "error",
    "meal_plan",
    "recipe",
    "todays_meals",
    "shopping_list",
    "shopping_list_update",
    "sync_changes",
    "sync_confirmed",
    "request_shopping_list",
    "request_store_list",
    "store_list",
    "timer_update",
];

/// Domains delivered through the raw fast path.
const FAST_PATH_KEYS: &[&str] = &["meal_plan", "recipe"];

// =============================================================================
// Main Message Enum (Tagged Union)
// =============================================================================

/// All device link messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    // =========================================================================
    // Handshake & Pairing
    // =========================================================================
    /// Handshake accepted; `authenticated` marks a recognized device.
    Connected {
        #[serde(default)]
        authenticated: bool,
    },

    PairingRequired,

    Pair(PairRequest),

    Paired,

    /// Rejected code; the socket stays open.
    PairingFailed { message: String },

    /// Pairing window expired; the host closes the session.
    PairingTimeout,

    /// Trust revoked by the host operator.
    Unpaired,

    // =========================================================================
    // Keep-alive & Errors
    // =========================================================================
    Ping,

    Pong,

    Error(ErrorPayload),

    // =========================================================================
    // Domain Pushes
    // =========================================================================
    MealPlan { meal_plan: Value },

    Recipe { recipe: Value },

    TodaysMeals { data: Value },

    ShoppingList(ShoppingListPayload),

    ShoppingListUpdate(ShoppingListPayload),

    StoreList { data: Value },

    // =========================================================================
    // Companion Edits
    // =========================================================================
    SyncChanges { data: Vec<ItemChange<ShoppingItem>> },

    SyncConfirmed,

    RequestShoppingList,

    RequestStoreList,

    /// Kitchen timers, relayed to every other paired device.
    TimerUpdate { timers: Vec<Value> },
}

// =============================================================================
// Payloads
// =============================================================================

/// Body of a `pair` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairRequest {
    pub code: String,
    #[serde(default)]
    pub device_name: String,
}

/// Body of an `error` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ErrorPayload {
    pub fn is_not_authenticated(&self) -> bool {
        self.error.as_deref() == Some(NOT_AUTHENTICATED)
    }
}

/// Body of `shopping_list` and `shopping_list_update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShoppingListPayload {
    pub data: Vec<ShoppingItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub force_replace: bool,
}

// =============================================================================
// Helper Methods
// =============================================================================

impl SyncMessage {
    /// Returns the wire `type` tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            SyncMessage::Connected { .. } => "connected",
            SyncMessage::PairingRequired => "pairing_required",
            SyncMessage::Pair(_) => "pair",
            SyncMessage::Paired => "paired",
            SyncMessage::PairingFailed { .. } => "pairing_failed",
            SyncMessage::PairingTimeout => "pairing_timeout",
            SyncMessage::Unpaired => "unpaired",
            SyncMessage::Ping => "ping",
            SyncMessage::Pong => "pong",
            SyncMessage::Error(_) => "error",
            SyncMessage::MealPlan { .. } => "meal_plan",
            SyncMessage::Recipe { .. } => "recipe",
            SyncMessage::TodaysMeals { .. } => "todays_meals",
            SyncMessage::ShoppingList(_) => "shopping_list",
            SyncMessage::ShoppingListUpdate(_) => "shopping_list_update",
            SyncMessage::StoreList { .. } => "store_list",
            SyncMessage::SyncChanges { .. } => "sync_changes",
            SyncMessage::SyncConfirmed => "sync_confirmed",
            SyncMessage::RequestShoppingList => "request_shopping_list",
            SyncMessage::RequestStoreList => "request_store_list",
            SyncMessage::TimerUpdate { .. } => "timer_update",
        }
    }

    /// Link-control messages are handled by the connection itself and never
    /// reach a domain dispatcher.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            SyncMessage::Connected { .. }
                | SyncMessage::PairingRequired
                | SyncMessage::Pair(_)
                | SyncMessage::Paired
                | SyncMessage::PairingFailed { .. }
                | SyncMessage::PairingTimeout
                | SyncMessage::Unpaired
                | SyncMessage::Ping
                | SyncMessage::Pong
                | SyncMessage::Error(_)
        )
    }

    pub fn pair(code: &str, device_name: &str) -> Self {
        SyncMessage::Pair(PairRequest {
            code: code.to_string(),
            device_name: device_name.to_string(),
        })
    }

    pub fn pairing_failed(message: &str) -> Self {
        SyncMessage::PairingFailed {
            message: message.to_string(),
        }
    }

    pub fn error(message: &str) -> Self {
        SyncMessage::Error(ErrorPayload {
            message: message.to_string(),
            error: None,
        })
    }

    pub fn not_authenticated() -> Self {
        SyncMessage::Error(ErrorPayload {
            message: "Device is not paired".to_string(),
            error: Some(NOT_AUTHENTICATED.to_string()),
        })
    }

    pub fn shopping_list(items: Vec<ShoppingItem>, version: Option<String>) -> Self {
        SyncMessage::ShoppingList(ShoppingListPayload {
            data: items,
            version,
            force_replace: false,
        })
    }

    pub fn shopping_list_update(items: Vec<ShoppingItem>, version: Option<String>) -> Self {
        SyncMessage::ShoppingListUpdate(ShoppingListPayload {
            data: items,
            version,
            force_replace: false,
        })
    }

    /// Serializes to a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// Decoding
// =============================================================================

/// Outcome of decoding one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(SyncMessage),
    /// Well-formed envelope with a `type` this build does not know.
    Unrecognized { kind: String },
    /// Not JSON, not an object, no `type`, or a payload of the wrong shape.
    Malformed { reason: String },
}

/// Decodes a text frame.
///
/// ## Order
/// 1. Raw domain fast path: an object with a `meal_plan` or `recipe` key
///    holding an object or array
/// 2. Generic `{ "type": ..., ... }` envelope
pub fn decode(text: &str) -> Decoded {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            return Decoded::Malformed {
                reason: format!("invalid JSON: {}", e),
            }
        }
    };

    let Some(object) = value.as_object() else {
        return Decoded::Malformed {
            reason: "frame is not a JSON object".to_string(),
        };
    };

    for key in FAST_PATH_KEYS {
        if let Some(payload) = object.get(*key) {
            if payload.is_object() || payload.is_array() {
                let payload = payload.clone();
                return Decoded::Message(match *key {
                    "meal_plan" => SyncMessage::MealPlan { meal_plan: payload },
                    _ => SyncMessage::Recipe { recipe: payload },
                });
            }
        }
    }

    let kind = match object.get("type").and_then(Value::as_str) {
        Some(kind) if !kind.is_empty() => kind.to_string(),
        _ => {
            return Decoded::Malformed {
                reason: "missing message type".to_string(),
            }
        }
    };

    if !KNOWN_TYPES.contains(&kind.as_str()) {
        return Decoded::Unrecognized { kind };
    }

    match serde_json::from_value::<SyncMessage>(value) {
        Ok(message) => Decoded::Message(message),
        Err(e) => Decoded::Malformed {
            reason: format!("bad {} payload: {}", kind, e),
        },
    }
}

/// Decodes a binary frame holding UTF-8 JSON.
pub fn decode_bytes(bytes: &[u8]) -> Decoded {
    match std::str::from_utf8(bytes) {
        Ok(text) => decode(text),
        Err(_) => Decoded::Malformed {
            reason: "binary frame is not UTF-8".to_string(),
        },
    }
}
