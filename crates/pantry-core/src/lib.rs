//! # pantry-core: Pure Logic for the Pantry Device Link
//!
//! This crate holds the deterministic half of device pairing and list sync.
//! It has zero I/O dependencies; the networking lives in `pantry-sync` and
//! persistence in `pantry-db`.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Pantry Device Link                                  │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │        pantry-sync (host server, companion client)              │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ pantry-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │  pairing  │  │   merge   │  │ validation│  │   │
//! │  │   │ Identity  │  │ Code      │  │ ListCache │  │  headers  │  │   │
//! │  │   │ Status    │  │ Machine   │  │ SyncItem  │  │  codes    │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                pantry-db (trust store, companion state)         │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Device identity, connection status, shopping items
//! - [`pairing`] - Pairing codes and the companion pairing state machine
//! - [`merge`] - Cached list with pending-edit-wins merge policy
//! - [`validation`] - Handshake and pairing input checks
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use pantry_core::merge::ListCache;
//! use pantry_core::ShoppingItem;
//!
//! let mut cache = ListCache::new();
//! cache.add(ShoppingItem::new_local("Milk", None)).unwrap();
//!
//! // The host has not seen the item yet, so an empty push is ignored.
//! let outcome = cache.update_from_server(Vec::new(), Some("v1"), false);
//! assert!(!outcome.changed());
//! assert_eq!(cache.items().len(), 1);
//! ```

pub mod error;
pub mod merge;
pub mod pairing;
pub mod types;
pub mod validation;

pub use error::{CoreError, CoreResult, ValidationError};
pub use merge::{ListCache, PendingEdit, PendingKind, SyncItem, UpdateOutcome};
pub use pairing::{PairingCode, PairingEffect, PairingEvent, PairingStateMachine};
pub use types::*;

/// Default WebSocket port of the host.
pub const DEFAULT_HOST_PORT: u16 = 8080;

/// Length of a pairing code.
pub const PAIRING_CODE_LEN: usize = 6;
