//! # Companion State Repository
//!
//! Everything a companion keeps across restarts.
//!
//! ## Tables
//! ```text
//! ┌──────────────────────┬──────────────────────────────────────────────────┐
//! │ companion_settings   │ device_id, server_address, trust marker          │
//! │ cached_lists         │ items + version + pending edits per list         │
//! │ cached_snapshots     │ raw host payloads (meal_plan, recipe, ...)       │
//! └──────────────────────┴──────────────────────────────────────────────────┘
//! ```
//!
//! Pending edits are written before any network round trip, so a crash
//! between a tap and `sync_confirmed` loses nothing.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;
use pantry_core::{ListCache, PendingEdit, SyncItem};

/// Setting key: the generated-once device id.
pub const KEY_DEVICE_ID: &str = "device_id";
/// Setting key: last known host address.
pub const KEY_SERVER_ADDRESS: &str = "server_address";
/// Setting key: local trust marker, `"1"` when the host accepted us.
pub const KEY_TRUSTED: &str = "trusted";

/// Repository for companion-side durable state.
#[derive(Debug, Clone)]
pub struct CompanionStateRepository {
    pool: SqlitePool,
}

impl CompanionStateRepository {
    /// Creates a new CompanionStateRepository.
    pub fn new(pool: SqlitePool) -> Self {
        CompanionStateRepository { pool }
    }

    // =========================================================================
    // Settings
    // =========================================================================

    pub async fn get_setting(&self, key: &str) -> DbResult<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM companion_settings WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO companion_settings (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_setting(&self, key: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM companion_settings WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Returns the stored device id, generating and persisting one on first use.
    pub async fn device_id_or_init(&self, generate: impl FnOnce() -> String) -> DbResult<String> {
        if let Some(id) = self.get_setting(KEY_DEVICE_ID).await? {
            return Ok(id);
        }
        let id = generate();
        self.set_setting(KEY_DEVICE_ID, &id).await?;
        debug!(device_id = %id, "Generated companion device id");
        Ok(id)
    }

    pub async fn server_address(&self) -> DbResult<Option<String>> {
        self.get_setting(KEY_SERVER_ADDRESS).await
    }

    pub async fn set_server_address(&self, address: &str) -> DbResult<()> {
        self.set_setting(KEY_SERVER_ADDRESS, address).await
    }

    pub async fn is_trusted(&self) -> DbResult<bool> {
        Ok(self.get_setting(KEY_TRUSTED).await?.as_deref() == Some("1"))
    }

    /// Sets or clears the local trust marker.
    pub async fn set_trusted(&self, trusted: bool) -> DbResult<()> {
        if trusted {
            self.set_setting(KEY_TRUSTED, "1").await
        } else {
            self.delete_setting(KEY_TRUSTED).await
        }
    }

    // =========================================================================
    // Cached lists
    // =========================================================================

    /// Persists a list cache: items, version and pending edits.
    pub async fn save_list<T>(&self, list_name: &str, cache: &ListCache<T>) -> DbResult<()>
    where
        T: SyncItem + Serialize,
    {
        let items_json = serde_json::to_string(cache.items())?;
        let pending_json = serde_json::to_string(cache.pending())?;

        sqlx::query(
            r#"
            INSERT INTO cached_lists (list_name, version, items_json, pending_json, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(list_name) DO UPDATE SET
                version = excluded.version,
                items_json = excluded.items_json,
                pending_json = excluded.pending_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(list_name)
        .bind(cache.version())
        .bind(items_json)
        .bind(pending_json)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        debug!(
            list = %list_name,
            items = cache.items().len(),
            pending = cache.pending().len(),
            "Cached list saved"
        );
        Ok(())
    }

    /// Restores a list cache, or `None` if it was never saved.
    pub async fn load_list<T>(&self, list_name: &str) -> DbResult<Option<ListCache<T>>>
    where
        T: SyncItem + DeserializeOwned,
    {
        let row: Option<(Option<String>, String, String)> = sqlx::query_as(
            "SELECT version, items_json, pending_json FROM cached_lists WHERE list_name = ?1",
        )
        .bind(list_name)
        .fetch_optional(&self.pool)
        .await?;

        let Some((version, items_json, pending_json)) = row else {
            return Ok(None);
        };

        let items: Vec<T> = serde_json::from_str(&items_json)?;
        let pending: BTreeMap<String, PendingEdit> = serde_json::from_str(&pending_json)?;
        Ok(Some(ListCache::restore(items, version, pending)))
    }

    // =========================================================================
    // Domain snapshots
    // =========================================================================

    /// Stores the latest raw payload for a domain (`meal_plan`, `recipe`, ...).
    pub async fn save_snapshot(&self, domain: &str, payload: &serde_json::Value) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cached_snapshots (domain, payload_json, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(domain) DO UPDATE SET
                payload_json = excluded.payload_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(domain)
        .bind(serde_json::to_string(payload)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_snapshot(&self, domain: &str) -> DbResult<Option<serde_json::Value>> {
        let json: Option<String> =
            sqlx::query_scalar("SELECT payload_json FROM cached_snapshots WHERE domain = ?1")
                .bind(domain)
                .fetch_optional(&self.pool)
                .await?;

        json.map(|j| serde_json::from_str(&j))
            .transpose()
            .map_err(Into::into)
    }
}
