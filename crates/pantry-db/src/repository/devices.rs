//! # Trust Store Repository
//!
//! Host-side record of every companion device and whether it is trusted.
//!
//! ## Lifecycle of a Row
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  WS handshake ──► upsert_seen()      trusted = 0, first_seen = now     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  pair{code} ok ──► set_trusted(true)  trusted = 1, paired_at = now     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  reconnect ──► upsert_seen()          last_seen = now, trust kept      │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  operator untrusts ──► remove()       row deleted                      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `device_id` is never updated; name and type follow the latest handshake.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use pantry_core::{DeviceIdentity, DeviceType};

const SELECT_DEVICE: &str = r#"
    SELECT device_id, device_type, device_name, trusted, first_seen, last_seen, paired_at
    FROM devices
"#;

/// Repository for the host's trust store.
#[derive(Debug, Clone)]
pub struct TrustStoreRepository {
    pool: SqlitePool,
}

impl TrustStoreRepository {
    /// Creates a new TrustStoreRepository.
    pub fn new(pool: SqlitePool) -> Self {
        TrustStoreRepository { pool }
    }

    /// Records a handshake from `device_id`, creating the row on first sight.
    ///
    /// Trust is never changed here.
    pub async fn upsert_seen(
        &self,
        device_id: &str,
        device_type: DeviceType,
        device_name: &str,
    ) -> DbResult<DeviceIdentity> {
        let now = Utc::now();

        debug!(device_id = %device_id, %device_type, "Recording device handshake");

        sqlx::query(
            r#"
            INSERT INTO devices (device_id, device_type, device_name, trusted, first_seen, last_seen)
            VALUES (?1, ?2, ?3, 0, ?4, ?4)
            ON CONFLICT(device_id) DO UPDATE SET
                device_type = excluded.device_type,
                device_name = excluded.device_name,
                last_seen = excluded.last_seen
            "#,
        )
        .bind(device_id)
        .bind(device_type)
        .bind(device_name)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get(device_id)
            .await?
            .ok_or_else(|| DbError::not_found("Device", device_id))
    }

    /// Fetches one device.
    pub async fn get(&self, device_id: &str) -> DbResult<Option<DeviceIdentity>> {
        let device = sqlx::query_as::<_, DeviceIdentity>(&format!(
            "{} WHERE device_id = ?1",
            SELECT_DEVICE
        ))
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(device)
    }

    /// Whether `device_id` exists and is trusted.
    pub async fn is_trusted(&self, device_id: &str) -> DbResult<bool> {
        let trusted: Option<bool> =
            sqlx::query_scalar("SELECT trusted FROM devices WHERE device_id = ?1")
                .bind(device_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(trusted.unwrap_or(false))
    }

    /// Grants or withdraws trust.
    ///
    /// ## Errors
    /// `DbError::NotFound` when the device never completed a handshake.
    pub async fn set_trusted(&self, device_id: &str, trusted: bool) -> DbResult<()> {
        let paired_at = trusted.then(Utc::now);

        let result = sqlx::query(
            r#"
            UPDATE devices SET
                trusted = ?2,
                paired_at = ?3
            WHERE device_id = ?1
            "#,
        )
        .bind(device_id)
        .bind(trusted)
        .bind(paired_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Device", device_id));
        }

        info!(device_id = %device_id, trusted, "Device trust updated");
        Ok(())
    }

    /// All known devices, most recently seen first.
    pub async fn list(&self) -> DbResult<Vec<DeviceIdentity>> {
        let devices = sqlx::query_as::<_, DeviceIdentity>(&format!(
            "{} ORDER BY last_seen DESC",
            SELECT_DEVICE
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(devices)
    }

    /// Trusted devices only.
    pub async fn list_trusted(&self) -> DbResult<Vec<DeviceIdentity>> {
        let devices = sqlx::query_as::<_, DeviceIdentity>(&format!(
            "{} WHERE trusted = 1 ORDER BY last_seen DESC",
            SELECT_DEVICE
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(devices)
    }

    /// Deletes a device identity. Returns whether a row was removed.
    pub async fn remove(&self, device_id: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM devices WHERE device_id = ?1")
            .bind(device_id)
            .execute(&self.pool)
            .await?;

        let removed = result.rows_affected() > 0;
        if removed {
            info!(device_id = %device_id, "Device removed from trust store");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};

    async fn repo() -> TrustStoreRepository {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.trust_store()
    }

    #[tokio::test]
    async fn test_first_handshake_is_untrusted() {
        let repo = repo().await;
        let device = repo
            .upsert_seen("tab-1", DeviceType::Tablet, "Kitchen tablet")
            .await
            .unwrap();

        assert_eq!(device.device_id, "tab-1");
        assert_eq!(device.device_type, DeviceType::Tablet);
        assert!(!device.trusted);
        assert!(device.paired_at.is_none());
        assert!(!repo.is_trusted("tab-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_trust_survives_reconnect() {
        let repo = repo().await;
        repo.upsert_seen("phone-1", DeviceType::Phone, "Phone")
            .await
            .unwrap();
        repo.set_trusted("phone-1", true).await.unwrap();

        let device = repo
            .upsert_seen("phone-1", DeviceType::Phone, "Renamed phone")
            .await
            .unwrap();
        assert!(device.trusted);
        assert!(device.paired_at.is_some());
        assert_eq!(device.device_name, "Renamed phone");
        assert!(device.last_seen >= device.first_seen);
    }

    #[tokio::test]
    async fn test_set_trusted_unknown_device() {
        let repo = repo().await;
        let err = repo.set_trusted("ghost", true).await.unwrap_err();
        assert!(matches!(err, DbError::NotFound { .. }));
        assert!(!repo.is_trusted("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_and_remove() {
        let repo = repo().await;
        repo.upsert_seen("a", DeviceType::Phone, "A").await.unwrap();
        repo.upsert_seen("b", DeviceType::Tablet, "B").await.unwrap();
        repo.set_trusted("b", true).await.unwrap();

        assert_eq!(repo.list().await.unwrap().len(), 2);
        let trusted = repo.list_trusted().await.unwrap();
        assert_eq!(trusted.len(), 1);
        assert_eq!(trusted[0].device_id, "b");

        assert!(repo.remove("b").await.unwrap());
        assert!(!repo.remove("b").await.unwrap());
        assert!(repo.get("b").await.unwrap().is_none());
    }
}
