//! # Repository Module
//!
//! Database repository implementations for the device link.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Host session task                   Companion dispatcher               │
//! │       │                                   │                             │
//! │       │  db.trust_store().is_trusted(id)  │  db.companion_state()       │
//! │       ▼                                   ▼       .save_list(..)        │
//! │  TrustStoreRepository               CompanionStateRepository            │
//! │  ├── upsert_seen                    ├── settings (id, address, trust)   │
//! │  ├── set_trusted                    ├── save_list / load_list           │
//! │  ├── list / list_trusted            └── save_snapshot / load_snapshot   │
//! │  └── remove                                                             │
//! │       │                                   │                             │
//! │       ▼                                   ▼                             │
//! │  SQLite Database                                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`devices::TrustStoreRepository`] - Host trust store
//! - [`companion::CompanionStateRepository`] - Companion settings and caches

pub mod companion;
pub mod devices;
