//! Device registry: the authoritative device identity and status table.
//!
//! Registration is an idempotent per-key upsert. Message delivery upstream is
//! at-least-once, so a replayed registration must land on the same record.
//! The Postgres implementation relies on `INSERT .. ON CONFLICT DO UPDATE`
//! for that; the in-memory implementation holds the write lock across the
//! read-modify-write.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

/// Registered device state.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Device {
    /// Externally supplied device identifier, unique per device.
    pub device_id: String,
    /// Human-readable label, mutable across registrations.
    pub device_name: String,
    pub status: DeviceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Device lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "device_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Active,
    Inactive,
}

/// Registry failures. `NotFound` is expected and non-fatal; callers branch
/// on it separately from infrastructure faults.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device '{0}' is not registered")]
    NotFound(String),

    #[error("device store error: {0}")]
    Store(#[source] anyhow::Error),
}

/// Device identity and status operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Create the device with `status=active`, or overwrite its name and
    /// force `status=active` if it already exists. Atomic per `device_id`.
    async fn register_or_update(
        &self,
        device_id: &str,
        device_name: &str,
    ) -> Result<Device, RegistryError>;

    /// Set `status=inactive`, preserving the name. `NotFound` if the device
    /// was never registered.
    async fn mark_disconnected(&self, device_id: &str) -> Result<(), RegistryError>;

    async fn get(&self, device_id: &str) -> Result<Device, RegistryError>;

    async fn list(&self) -> Result<Vec<Device>, RegistryError>;
}

/// PostgreSQL-backed device registry.
pub struct PostgresDeviceRegistry {
    pool: PgPool,
}

impl PostgresDeviceRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn store_err(e: sqlx::Error) -> RegistryError {
    RegistryError::Store(e.into())
}

#[async_trait]
impl DeviceRegistry for PostgresDeviceRegistry {
    #[instrument(skip(self))]
    async fn register_or_update(
        &self,
        device_id: &str,
        device_name: &str,
    ) -> Result<Device, RegistryError> {
        let device = sqlx::query_as::<_, Device>(
            r#"
            INSERT INTO devices (device_id, device_name, status, created_at, updated_at)
            VALUES ($1, $2, 'active', NOW(), NOW())
            ON CONFLICT (device_id)
            DO UPDATE SET device_name = EXCLUDED.device_name,
                          status = 'active',
                          updated_at = NOW()
            RETURNING device_id, device_name, status, created_at, updated_at
            "#,
        )
        .bind(device_id)
        .bind(device_name)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;

        debug!(device_id = %device.device_id, "Device registered");

        Ok(device)
    }

    #[instrument(skip(self))]
    async fn mark_disconnected(&self, device_id: &str) -> Result<(), RegistryError> {
        let result = sqlx::query(
            r#"
            UPDATE devices
            SET status = 'inactive', updated_at = NOW()
            WHERE device_id = $1
            "#,
        )
        .bind(device_id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(device_id.to_string()));
        }

        debug!(device_id = %device_id, "Device marked inactive");

        Ok(())
    }

    async fn get(&self, device_id: &str) -> Result<Device, RegistryError> {
        sqlx::query_as::<_, Device>(
            r#"
            SELECT device_id, device_name, status, created_at, updated_at
            FROM devices
            WHERE device_id = $1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?
        .ok_or_else(|| RegistryError::NotFound(device_id.to_string()))
    }

    async fn list(&self) -> Result<Vec<Device>, RegistryError> {
        sqlx::query_as::<_, Device>(
            r#"
            SELECT device_id, device_name, status, created_at, updated_at
            FROM devices
            ORDER BY device_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)
    }
}

/// In-memory registry for tests and local development.
#[derive(Default)]
pub struct InMemoryDeviceRegistry {
    devices: RwLock<HashMap<String, Device>>,
}

impl InMemoryDeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceRegistry for InMemoryDeviceRegistry {
    async fn register_or_update(
        &self,
        device_id: &str,
        device_name: &str,
    ) -> Result<Device, RegistryError> {
        let now = Utc::now();
        // Write lock held across the read-modify-write keeps the upsert
        // atomic per key.
        let mut devices = self.devices.write().await;
        let device = devices
            .entry(device_id.to_string())
            .and_modify(|d| {
                d.device_name = device_name.to_string();
                d.status = DeviceStatus::Active;
                d.updated_at = now;
            })
            .or_insert_with(|| Device {
                device_id: device_id.to_string(),
                device_name: device_name.to_string(),
                status: DeviceStatus::Active,
                created_at: now,
                updated_at: now,
            });
        Ok(device.clone())
    }

    async fn mark_disconnected(&self, device_id: &str) -> Result<(), RegistryError> {
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(device_id)
            .ok_or_else(|| RegistryError::NotFound(device_id.to_string()))?;
        device.status = DeviceStatus::Inactive;
        device.updated_at = Utc::now();
        Ok(())
    }

    async fn get(&self, device_id: &str) -> Result<Device, RegistryError> {
        self.devices
            .read()
            .await
            .get(device_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(device_id.to_string()))
    }

    async fn list(&self) -> Result<Vec<Device>, RegistryError> {
        let mut devices: Vec<Device> = self.devices.read().await.values().cloned().collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(devices)
    }
}
