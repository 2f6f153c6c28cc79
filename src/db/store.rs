//! Access contracts for the three core tables plus alert configurations.
//!
//! Every store exposes point lookups, a range query over its secondary index,
//! conditional writes where the core needs them, and batched deletes used
//! when a monitor or alert is removed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::StoreError;
use super::models::{Alert, AlertInvocation, CheckFrequency, Monitor, ProbeResult};

#[async_trait]
pub trait MonitorStore: Send + Sync {
    async fn get_monitor(&self, owner_id: &str, monitor_id: &str) -> Result<Monitor, StoreError>;

    async fn list_monitors_for_owner(&self, owner_id: &str) -> Result<Vec<Monitor>, StoreError>;

    /// Range query over the `(frequency, region)` index.
    async fn monitors_by_frequency(
        &self,
        frequency: CheckFrequency,
        region: &str,
    ) -> Result<Vec<Monitor>, StoreError>;

    /// Inserts or replaces a monitor, rewriting its index entries atomically.
    async fn put_monitor(&self, monitor: &Monitor) -> Result<(), StoreError>;

    /// Fails with `ConditionFailed` if the monitor already exists.
    async fn insert_monitor(&self, monitor: &Monitor) -> Result<(), StoreError>;

    async fn delete_monitor(&self, owner_id: &str, monitor_id: &str) -> Result<Monitor, StoreError>;

    async fn touch_monitor(
        &self,
        owner_id: &str,
        monitor_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Appends one immutable result. Writing an identical row twice is a no-op.
    async fn append_status(&self, result: &ProbeResult) -> Result<(), StoreError>;

    /// The newest `limit` results for a monitor, newest first.
    async fn latest_statuses(
        &self,
        monitor_id: &str,
        limit: usize,
    ) -> Result<Vec<ProbeResult>, StoreError>;

    /// Results with `from <= timestamp < to`, oldest first.
    async fn statuses_between(
        &self,
        monitor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ProbeResult>, StoreError>;

    async fn prune_statuses_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn delete_statuses_for_monitor(&self, monitor_id: &str) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn get_alert(&self, owner_id: &str, alert_id: &str) -> Result<Alert, StoreError>;

    async fn list_alerts_for_owner(&self, owner_id: &str) -> Result<Vec<Alert>, StoreError>;

    async fn put_alert(&self, alert: &Alert) -> Result<(), StoreError>;

    async fn delete_alert(&self, owner_id: &str, alert_id: &str) -> Result<Alert, StoreError>;
}

#[async_trait]
pub trait AlertInvocationStore: Send + Sync {
    async fn get_invocation(
        &self,
        alert_id: &str,
        sort_key: &str,
    ) -> Result<AlertInvocation, StoreError>;

    /// The open `incident_start` for the pair, if any.
    async fn open_invocation(
        &self,
        alert_id: &str,
        monitor_id: &str,
    ) -> Result<Option<AlertInvocation>, StoreError>;

    /// Writes an `incident_start`. Fails with `ConditionFailed` when the pair
    /// already has an ongoing invocation, or any invocation at or after the
    /// start's timestamp.
    async fn start_incident(&self, start: &AlertInvocation) -> Result<(), StoreError>;

    /// Marks `open` resolved and writes `end` in one step. Fails with
    /// `ConditionFailed` when `open` is no longer ongoing.
    async fn end_incident(
        &self,
        open: &AlertInvocation,
        end: &AlertInvocation,
    ) -> Result<(), StoreError>;

    /// All invocations for the pair, oldest first.
    async fn invocations_for_pair(
        &self,
        alert_id: &str,
        monitor_id: &str,
    ) -> Result<Vec<AlertInvocation>, StoreError>;

    /// Range query over the timestamp index, oldest first.
    async fn invocations_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AlertInvocation>, StoreError>;

    async fn delete_invocations_for_monitor(&self, monitor_id: &str) -> Result<u64, StoreError>;

    async fn delete_invocations_for_alert(&self, alert_id: &str) -> Result<u64, StoreError>;
}
