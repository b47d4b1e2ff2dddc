//! # pantry-sync: Device Link for the Pantry Meal Planner
//!
//! This crate pairs mobile companions with the desktop host and keeps their
//! view of the host's data live over a local WebSocket.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Device Link Architecture                         │
//! │                                                                         │
//! │  HOST (desktop)                          COMPANION (tablet / phone)     │
//! │  ──────────────                          ──────────────────────────     │
//! │  ┌────────────────┐                      ┌────────────────────────┐     │
//! │  │   Advertiser   │ ─── UDP announce ──► │       Resolver         │     │
//! │  └────────────────┘                      └───────────┬────────────┘     │
//! │                                                      │ ws://host:8080   │
//! │  ┌────────────────┐                      ┌───────────▼────────────┐     │
//! │  │   HostServer   │ ◄──── WebSocket ───► │   ConnectionClient     │     │
//! │  │  (sessions,    │                      │  (actor: reconnect,    │     │
//! │  │  pairing gate) │                      │   keep-alive, pairing) │     │
//! │  └───────┬────────┘                      └───────────┬────────────┘     │
//! │          │                                           │                  │
//! │  ┌───────▼────────┐                      ┌───────────▼────────────┐     │
//! │  │ HostDispatcher │                      │  CompanionDispatcher   │     │
//! │  │ → domain layer │                      │  → ListCache + UI      │     │
//! │  └────────────────┘                      └────────────────────────┘     │
//! │                                                                         │
//! │  Trust store: pantry-db (SQLite)         Durable state: pantry-db       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Shared
//! - [`config`] - Layered configuration (defaults, TOML, environment)
//! - [`error`] - Sync error types
//! - [`protocol`] - Wire messages and fail-closed decoding
//! - [`discovery`] - UDP advertiser/resolver and address normalization
//! - [`scheduler`] - Cancellable single-slot timers
//!
//! ### Host
//! - [`host`] - Axum WebSocket server and per-device sessions
//! - [`dispatcher`] - Message routing to the host's domain layer
//!
//! ### Companion
//! - [`transport`] - WebSocket dialing behind the `Connector` trait
//! - [`reconnect`] - Linear backoff with a failure ceiling
//! - [`client`] - Connection client actor
//! - [`dispatcher`] - Local state cache and pending-edit flushing
//! - [`companion`] - Orchestrator wiring it all together
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pantry_sync::{Companion, SyncConfig};
//! use pantry_db::{Database, DbConfig};
//!
//! let config = SyncConfig::load_or_default(None);
//! let db = Database::new(DbConfig::new(config.database_path())).await?;
//!
//! let companion = Companion::new(config).start(&db).await?;
//! companion.client().submit_pairing_code("482913").await?;
//!
//! let items = companion.dispatcher().shopping_list().await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;
pub mod protocol;
pub mod scheduler;

pub mod discovery;
pub mod dispatcher;
pub mod host;

pub mod client;
pub mod companion;
pub mod reconnect;
pub mod transport;

// =============================================================================
// Re-exports
// =============================================================================

pub use client::{ClientHandle, ClientOptions, ConnectionClient};
pub use companion::{Companion, CompanionHandle};
pub use config::SyncConfig;
pub use discovery::{Advertiser, AdvertiserHandle, ResolvedHost, Resolver};
pub use dispatcher::{
    CompanionDispatcher, HostCollaborator, HostDispatcher, InMemoryShoppingList, ListSnapshot,
    StateChange, StateObserver,
};
pub use error::{SyncError, SyncResult};
pub use host::{HostHandle, HostOptions, HostServer, SessionInfo};
pub use protocol::SyncMessage;
pub use reconnect::LinearBackoff;
pub use transport::{Connector, DeviceHeaders, WsConnector};
