//! PostgreSQL-backed stores.
//!
//! The frequency index is a separate table rewritten in the same transaction
//! as its monitor row. The "at most one ongoing invocation" rule is a partial
//! unique index. Start and end writes for a pair also take a transaction-scoped
//! advisory lock, so a start never lands behind a newer end.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;
use tracing::info;

use super::error::StoreError;
use super::models::{
    validate_key_part, Alert, AlertInvocation, CheckFrequency, Monitor, ProbeResult,
    ResponseDescriptor, Severity,
};
use super::store::{AlertInvocationStore, AlertStore, MonitorStore, StatusStore};
use crate::notifications::encryption::ChannelCipher;
use crate::notifications::models::ChannelConfig;

const MIGRATIONS: &str = include_str!("../../migrations/20260101000000_create_core_tables.sql");

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    cipher: Option<ChannelCipher>,
}

impl PgStore {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        cipher: Option<ChannelCipher>,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self { pool, cipher })
    }

    pub fn from_pool(pool: PgPool, cipher: Option<ChannelCipher>) -> Self {
        Self { pool, cipher }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        info!("Running database migrations...");
        sqlx::raw_sql(MIGRATIONS).execute(&self.pool).await?;
        info!("Database migrations completed successfully.");
        Ok(())
    }

    fn seal(&self, plain: String) -> Result<String, StoreError> {
        match &self.cipher {
            Some(cipher) => cipher
                .encrypt(&plain)
                .map_err(|e| StoreError::Internal(e.to_string())),
            None => Ok(plain),
        }
    }

    fn unseal(&self, stored: String) -> Result<String, StoreError> {
        match &self.cipher {
            Some(cipher) => cipher
                .decrypt(&stored)
                .map_err(|e| StoreError::Internal(e.to_string())),
            None => Ok(stored),
        }
    }

    fn alert_from_row(&self, row: &PgRow) -> Result<Alert, StoreError> {
        let severity: String = row.try_get("severity")?;
        let channels: String = row.try_get("channels")?;
        let channels: Vec<ChannelConfig> = serde_json::from_str(&self.unseal(channels)?)?;
        Ok(Alert {
            owner_id: row.try_get("owner_id")?,
            alert_id: row.try_get("alert_id")?,
            name: row.try_get("name")?,
            severity: serde_json::from_value::<Severity>(serde_json::Value::String(severity))?,
            channels,
            enabled: row.try_get("enabled")?,
        })
    }

    fn invocation_from_row(&self, row: &PgRow) -> Result<AlertInvocation, StoreError> {
        let event_type: String = row.try_get("event_type")?;
        let alert: String = row.try_get("alert")?;
        Ok(AlertInvocation {
            alert_id: row.try_get("alert_id")?,
            monitor_id: row.try_get("monitor_id")?,
            timestamp: row.try_get("ts")?,
            event: event_type.parse().map_err(StoreError::Internal)?,
            ongoing: row.try_get("ongoing")?,
            alert: serde_json::from_str(&self.unseal(alert)?)?,
        })
    }

    async fn insert_invocation(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        invocation: &AlertInvocation,
    ) -> Result<u64, StoreError> {
        let snapshot = self.seal(serde_json::to_string(&invocation.alert)?)?;
        let result = sqlx::query(
            "INSERT INTO alert_invocations (alert_id, sort_key, monitor_id, ts, event_type, ongoing, alert)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT DO NOTHING",
        )
        .bind(&invocation.alert_id)
        .bind(invocation.sort_key())
        .bind(&invocation.monitor_id)
        .bind(invocation.timestamp)
        .bind(invocation.event.as_str())
        .bind(invocation.ongoing)
        .bind(snapshot)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Serialises start and end writes for one pair until the transaction ends.
async fn lock_pair(
    tx: &mut Transaction<'_, Postgres>,
    alert_id: &str,
    monitor_id: &str,
) -> Result<(), StoreError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1), hashtext($2))")
        .bind(alert_id)
        .bind(monitor_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn monitor_from_row(row: &PgRow) -> Result<Monitor, StoreError> {
    let Json(monitor): Json<Monitor> = row.try_get("config")?;
    Ok(monitor)
}

fn status_from_row(row: &PgRow) -> Result<ProbeResult, StoreError> {
    let status: String = row.try_get("status")?;
    let Json(response): Json<ResponseDescriptor> = row.try_get("response")?;
    Ok(ProbeResult {
        monitor_id: row.try_get("monitor_id")?,
        region: row.try_get("region")?,
        timestamp: row.try_get("ts")?,
        status: status.parse().map_err(StoreError::Internal)?,
        latency_ms: row.try_get("latency_ms")?,
        response,
    })
}

fn validate_monitor_keys(monitor: &Monitor) -> Result<(), StoreError> {
    validate_key_part("owner_id", &monitor.owner_id)?;
    validate_key_part("monitor_id", &monitor.monitor_id)?;
    for region in &monitor.regions {
        validate_key_part("region", region)?;
    }
    Ok(())
}

async fn write_frequency_index(
    tx: &mut Transaction<'_, Postgres>,
    monitor: &Monitor,
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM monitor_frequency_index WHERE owner_id = $1 AND monitor_id = $2")
        .bind(&monitor.owner_id)
        .bind(&monitor.monitor_id)
        .execute(&mut **tx)
        .await?;
    for region in &monitor.regions {
        sqlx::query(
            "INSERT INTO monitor_frequency_index (frequency_minutes, region, owner_id, monitor_id)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(monitor.frequency.minutes() as i32)
        .bind(region)
        .bind(&monitor.owner_id)
        .bind(&monitor.monitor_id)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

#[async_trait]
impl MonitorStore for PgStore {
    async fn get_monitor(&self, owner_id: &str, monitor_id: &str) -> Result<Monitor, StoreError> {
        let row = sqlx::query("SELECT config FROM monitors WHERE owner_id = $1 AND monitor_id = $2")
            .bind(owner_id)
            .bind(monitor_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("monitor {owner_id}/{monitor_id}")))?;
        monitor_from_row(&row)
    }

    async fn list_monitors_for_owner(&self, owner_id: &str) -> Result<Vec<Monitor>, StoreError> {
        let rows = sqlx::query("SELECT config FROM monitors WHERE owner_id = $1 ORDER BY monitor_id")
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(monitor_from_row).collect()
    }

    async fn monitors_by_frequency(
        &self,
        frequency: CheckFrequency,
        region: &str,
    ) -> Result<Vec<Monitor>, StoreError> {
        let rows = sqlx::query(
            "SELECT m.config FROM monitor_frequency_index i
             JOIN monitors m ON m.owner_id = i.owner_id AND m.monitor_id = i.monitor_id
             WHERE i.frequency_minutes = $1 AND i.region = $2
             ORDER BY i.owner_id, i.monitor_id",
        )
        .bind(frequency.minutes() as i32)
        .bind(region)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(monitor_from_row).collect()
    }

    async fn put_monitor(&self, monitor: &Monitor) -> Result<(), StoreError> {
        validate_monitor_keys(monitor)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO monitors (owner_id, monitor_id, frequency_minutes, regions, config, created_at, last_updated)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (owner_id, monitor_id) DO UPDATE SET
                frequency_minutes = EXCLUDED.frequency_minutes,
                regions = EXCLUDED.regions,
                config = EXCLUDED.config,
                last_updated = EXCLUDED.last_updated",
        )
        .bind(&monitor.owner_id)
        .bind(&monitor.monitor_id)
        .bind(monitor.frequency.minutes() as i32)
        .bind(&monitor.regions)
        .bind(Json(monitor))
        .bind(monitor.created_at)
        .bind(monitor.last_updated)
        .execute(&mut *tx)
        .await?;
        write_frequency_index(&mut tx, monitor).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_monitor(&self, monitor: &Monitor) -> Result<(), StoreError> {
        validate_monitor_keys(monitor)?;
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO monitors (owner_id, monitor_id, frequency_minutes, regions, config, created_at, last_updated)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT DO NOTHING",
        )
        .bind(&monitor.owner_id)
        .bind(&monitor.monitor_id)
        .bind(monitor.frequency.minutes() as i32)
        .bind(&monitor.regions)
        .bind(Json(monitor))
        .bind(monitor.created_at)
        .bind(monitor.last_updated)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if inserted == 0 {
            tx.rollback().await?;
            return Err(StoreError::ConditionFailed(format!(
                "monitor {}/{} already exists",
                monitor.owner_id, monitor.monitor_id
            )));
        }
        write_frequency_index(&mut tx, monitor).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_monitor(&self, owner_id: &str, monitor_id: &str) -> Result<Monitor, StoreError> {
        let row = sqlx::query(
            "DELETE FROM monitors WHERE owner_id = $1 AND monitor_id = $2 RETURNING config",
        )
        .bind(owner_id)
        .bind(monitor_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("monitor {owner_id}/{monitor_id}")))?;
        monitor_from_row(&row)
    }

    async fn touch_monitor(
        &self,
        owner_id: &str,
        monitor_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            "UPDATE monitors
             SET last_updated = $3,
                 config = jsonb_set(config, '{lastUpdated}', to_jsonb($3::timestamptz))
             WHERE owner_id = $1 AND monitor_id = $2",
        )
        .bind(owner_id)
        .bind(monitor_id)
        .bind(at)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound(format!("monitor {owner_id}/{monitor_id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl StatusStore for PgStore {
    async fn append_status(&self, result: &ProbeResult) -> Result<(), StoreError> {
        validate_key_part("monitor_id", &result.monitor_id)?;
        sqlx::query(
            "INSERT INTO monitor_statuses (monitor_id, region, ts, status, latency_ms, response)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT DO NOTHING",
        )
        .bind(&result.monitor_id)
        .bind(&result.region)
        .bind(result.timestamp)
        .bind(result.status.as_str())
        .bind(result.latency_ms)
        .bind(Json(&result.response))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_statuses(
        &self,
        monitor_id: &str,
        limit: usize,
    ) -> Result<Vec<ProbeResult>, StoreError> {
        let rows = sqlx::query(
            "SELECT monitor_id, region, ts, status, latency_ms, response FROM monitor_statuses
             WHERE monitor_id = $1 ORDER BY ts DESC LIMIT $2",
        )
        .bind(monitor_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(status_from_row).collect()
    }

    async fn statuses_between(
        &self,
        monitor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ProbeResult>, StoreError> {
        let rows = sqlx::query(
            "SELECT monitor_id, region, ts, status, latency_ms, response FROM monitor_statuses
             WHERE monitor_id = $1 AND ts >= $2 AND ts < $3 ORDER BY ts ASC",
        )
        .bind(monitor_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(status_from_row).collect()
    }

    async fn prune_statuses_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM monitor_statuses WHERE ts < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_statuses_for_monitor(&self, monitor_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM monitor_statuses WHERE monitor_id = $1")
            .bind(monitor_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl AlertStore for PgStore {
    async fn get_alert(&self, owner_id: &str, alert_id: &str) -> Result<Alert, StoreError> {
        let row = sqlx::query("SELECT * FROM alerts WHERE owner_id = $1 AND alert_id = $2")
            .bind(owner_id)
            .bind(alert_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("alert {owner_id}/{alert_id}")))?;
        self.alert_from_row(&row)
    }

    async fn list_alerts_for_owner(&self, owner_id: &str) -> Result<Vec<Alert>, StoreError> {
        let rows = sqlx::query("SELECT * FROM alerts WHERE owner_id = $1 ORDER BY alert_id")
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| self.alert_from_row(row)).collect()
    }

    async fn put_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        validate_key_part("owner_id", &alert.owner_id)?;
        validate_key_part("alert_id", &alert.alert_id)?;
        let channels = self.seal(serde_json::to_string(&alert.channels)?)?;
        sqlx::query(
            "INSERT INTO alerts (owner_id, alert_id, name, severity, enabled, channels)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (owner_id, alert_id) DO UPDATE SET
                name = EXCLUDED.name,
                severity = EXCLUDED.severity,
                enabled = EXCLUDED.enabled,
                channels = EXCLUDED.channels",
        )
        .bind(&alert.owner_id)
        .bind(&alert.alert_id)
        .bind(&alert.name)
        .bind(alert.severity.to_string())
        .bind(alert.enabled)
        .bind(channels)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_alert(&self, owner_id: &str, alert_id: &str) -> Result<Alert, StoreError> {
        let row = sqlx::query("DELETE FROM alerts WHERE owner_id = $1 AND alert_id = $2 RETURNING *")
            .bind(owner_id)
            .bind(alert_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("alert {owner_id}/{alert_id}")))?;
        self.alert_from_row(&row)
    }
}

#[async_trait]
impl AlertInvocationStore for PgStore {
    async fn get_invocation(
        &self,
        alert_id: &str,
        sort_key: &str,
    ) -> Result<AlertInvocation, StoreError> {
        super::models::parse_invocation_sort_key(sort_key)?;
        let row = sqlx::query("SELECT * FROM alert_invocations WHERE alert_id = $1 AND sort_key = $2")
            .bind(alert_id)
            .bind(sort_key)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("invocation {alert_id}/{sort_key}")))?;
        self.invocation_from_row(&row)
    }

    async fn open_invocation(
        &self,
        alert_id: &str,
        monitor_id: &str,
    ) -> Result<Option<AlertInvocation>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM alert_invocations WHERE alert_id = $1 AND monitor_id = $2 AND ongoing",
        )
        .bind(alert_id)
        .bind(monitor_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| self.invocation_from_row(&r)).transpose()
    }

    async fn start_incident(&self, start: &AlertInvocation) -> Result<(), StoreError> {
        validate_key_part("alert_id", &start.alert_id)?;
        validate_key_part("monitor_id", &start.monitor_id)?;
        let mut tx = self.pool.begin().await?;
        lock_pair(&mut tx, &start.alert_id, &start.monitor_id).await?;
        let superseded: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM alert_invocations
             WHERE alert_id = $1 AND monitor_id = $2 AND ts >= $3)",
        )
        .bind(&start.alert_id)
        .bind(&start.monitor_id)
        .bind(start.timestamp)
        .fetch_one(&mut *tx)
        .await?;
        if superseded {
            tx.rollback().await?;
            return Err(StoreError::ConditionFailed(format!(
                "invocation at or after {} already exists",
                start.sort_key()
            )));
        }
        let inserted = self.insert_invocation(&mut tx, start).await?;
        if inserted == 0 {
            tx.rollback().await?;
            return Err(StoreError::ConditionFailed(format!(
                "alert {} already ongoing for monitor {}",
                start.alert_id, start.monitor_id
            )));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn end_incident(
        &self,
        open: &AlertInvocation,
        end: &AlertInvocation,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        lock_pair(&mut tx, &open.alert_id, &open.monitor_id).await?;
        let closed = sqlx::query(
            "UPDATE alert_invocations SET ongoing = FALSE
             WHERE alert_id = $1 AND sort_key = $2 AND ongoing",
        )
        .bind(&open.alert_id)
        .bind(open.sort_key())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if closed == 0 {
            tx.rollback().await?;
            return Err(StoreError::ConditionFailed(format!(
                "invocation {} is no longer ongoing",
                open.sort_key()
            )));
        }
        if self.insert_invocation(&mut tx, end).await? == 0 {
            tx.rollback().await?;
            return Err(StoreError::ConditionFailed(format!(
                "invocation {} already exists",
                end.sort_key()
            )));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn invocations_for_pair(
        &self,
        alert_id: &str,
        monitor_id: &str,
    ) -> Result<Vec<AlertInvocation>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM alert_invocations WHERE alert_id = $1 AND monitor_id = $2 ORDER BY ts ASC",
        )
        .bind(alert_id)
        .bind(monitor_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|row| self.invocation_from_row(row)).collect()
    }

    async fn invocations_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AlertInvocation>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM alert_invocations WHERE ts >= $1 AND ts < $2 ORDER BY ts ASC",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|row| self.invocation_from_row(row)).collect()
    }

    async fn delete_invocations_for_monitor(&self, monitor_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM alert_invocations WHERE monitor_id = $1")
            .bind(monitor_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_invocations_for_alert(&self, alert_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM alert_invocations WHERE alert_id = $1")
            .bind(alert_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
