//! # pantry-db: Database Layer for the Pantry Device Link
//!
//! SQLite persistence for both ends of the link, using sqlx for async access.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Device Link Data Flow                            │
//! │                                                                         │
//! │  Host session (pairing)          Companion (cache, settings)           │
//! │       │                                   │                             │
//! │       ▼                                   ▼                             │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     pantry-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────┐   ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories  │   │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │                │   │  (embedded)  │  │   │
//! │  │   │ SqlitePool    │◄───│ TrustStore     │   │ 001_trust    │  │   │
//! │  │   │               │    │ CompanionState │   │ 002_companion│  │   │
//! │  │   └───────────────┘    └────────────────┘   └──────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │   SQLite file in the platform data dir (pantry-sync.db)         │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pantry_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("pantry-sync.db")).await?;
//! let trusted = db.trust_store().is_trusted("device-id").await?;
//! ```

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::companion::CompanionStateRepository;
pub use repository::devices::TrustStoreRepository;
