//! In-process implementation of every store contract.
//!
//! Used when no database is configured and by the test suite. Conditional
//! writes on alert invocations hold the per-pair map entry while checking, so
//! they are atomic with respect to concurrent evaluators.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::error::StoreError;
use super::models::{
    parse_invocation_sort_key, validate_key_part, Alert, AlertInvocation, CheckFrequency,
    InvocationEvent, Monitor, ProbeResult,
};
use super::store::{AlertInvocationStore, AlertStore, MonitorStore, StatusStore};

type OwnerKey = (String, String);

#[derive(Default)]
struct MonitorTable {
    by_key: HashMap<OwnerKey, Monitor>,
    frequency_index: HashMap<(CheckFrequency, String), BTreeSet<OwnerKey>>,
}

impl MonitorTable {
    fn unindex(&mut self, monitor: &Monitor) {
        let key = (monitor.owner_id.clone(), monitor.monitor_id.clone());
        for region in &monitor.regions {
            let index_key = (monitor.frequency, region.clone());
            if let Some(entries) = self.frequency_index.get_mut(&index_key) {
                entries.remove(&key);
                if entries.is_empty() {
                    self.frequency_index.remove(&index_key);
                }
            }
        }
    }

    fn index(&mut self, monitor: &Monitor) {
        let key = (monitor.owner_id.clone(), monitor.monitor_id.clone());
        for region in &monitor.regions {
            self.frequency_index
                .entry((monitor.frequency, region.clone()))
                .or_default()
                .insert(key.clone());
        }
    }

    fn upsert(&mut self, monitor: &Monitor) {
        let key = (monitor.owner_id.clone(), monitor.monitor_id.clone());
        if let Some(previous) = self.by_key.remove(&key) {
            self.unindex(&previous);
        }
        self.index(monitor);
        self.by_key.insert(key, monitor.clone());
    }
}

#[derive(Default)]
pub struct MemoryStore {
    monitors: RwLock<MonitorTable>,
    statuses: DashMap<String, Vec<ProbeResult>>,
    alerts: DashMap<OwnerKey, Alert>,
    invocations: DashMap<OwnerKey, Vec<AlertInvocation>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_monitors(&self) -> Result<RwLockReadGuard<'_, MonitorTable>, StoreError> {
        self.monitors
            .read()
            .map_err(|_| StoreError::Internal("monitor table lock poisoned".to_string()))
    }

    fn write_monitors(&self) -> Result<RwLockWriteGuard<'_, MonitorTable>, StoreError> {
        self.monitors
            .write()
            .map_err(|_| StoreError::Internal("monitor table lock poisoned".to_string()))
    }
}

fn validate_monitor_keys(monitor: &Monitor) -> Result<(), StoreError> {
    validate_key_part("owner_id", &monitor.owner_id)?;
    validate_key_part("monitor_id", &monitor.monitor_id)?;
    for region in &monitor.regions {
        validate_key_part("region", region)?;
    }
    Ok(())
}

#[async_trait]
impl MonitorStore for MemoryStore {
    async fn get_monitor(&self, owner_id: &str, monitor_id: &str) -> Result<Monitor, StoreError> {
        let table = self.read_monitors()?;
        table
            .by_key
            .get(&(owner_id.to_string(), monitor_id.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("monitor {owner_id}/{monitor_id}")))
    }

    async fn list_monitors_for_owner(&self, owner_id: &str) -> Result<Vec<Monitor>, StoreError> {
        let table = self.read_monitors()?;
        let mut monitors: Vec<Monitor> = table
            .by_key
            .values()
            .filter(|m| m.owner_id == owner_id)
            .cloned()
            .collect();
        monitors.sort_by(|a, b| a.monitor_id.cmp(&b.monitor_id));
        Ok(monitors)
    }

    async fn monitors_by_frequency(
        &self,
        frequency: CheckFrequency,
        region: &str,
    ) -> Result<Vec<Monitor>, StoreError> {
        let table = self.read_monitors()?;
        let Some(keys) = table.frequency_index.get(&(frequency, region.to_string())) else {
            return Ok(Vec::new());
        };
        Ok(keys
            .iter()
            .filter_map(|key| table.by_key.get(key).cloned())
            .collect())
    }

    async fn put_monitor(&self, monitor: &Monitor) -> Result<(), StoreError> {
        validate_monitor_keys(monitor)?;
        let mut table = self.write_monitors()?;
        let taken = table
            .by_key
            .keys()
            .any(|(owner, id)| *id == monitor.monitor_id && *owner != monitor.owner_id);
        if taken {
            return Err(StoreError::ConditionFailed(format!(
                "monitor {} belongs to another owner",
                monitor.monitor_id
            )));
        }
        table.upsert(monitor);
        Ok(())
    }

    async fn insert_monitor(&self, monitor: &Monitor) -> Result<(), StoreError> {
        validate_monitor_keys(monitor)?;
        let mut table = self.write_monitors()?;
        if table.by_key.keys().any(|(_, id)| *id == monitor.monitor_id) {
            return Err(StoreError::ConditionFailed(format!(
                "monitor {} already exists",
                monitor.monitor_id
            )));
        }
        table.upsert(monitor);
        Ok(())
    }

    async fn delete_monitor(&self, owner_id: &str, monitor_id: &str) -> Result<Monitor, StoreError> {
        let mut table = self.write_monitors()?;
        let monitor = table
            .by_key
            .remove(&(owner_id.to_string(), monitor_id.to_string()))
            .ok_or_else(|| StoreError::NotFound(format!("monitor {owner_id}/{monitor_id}")))?;
        table.unindex(&monitor);
        Ok(monitor)
    }

    async fn touch_monitor(
        &self,
        owner_id: &str,
        monitor_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut table = self.write_monitors()?;
        let monitor = table
            .by_key
            .get_mut(&(owner_id.to_string(), monitor_id.to_string()))
            .ok_or_else(|| StoreError::NotFound(format!("monitor {owner_id}/{monitor_id}")))?;
        monitor.last_updated = at;
        Ok(())
    }
}

#[async_trait]
impl StatusStore for MemoryStore {
    async fn append_status(&self, result: &ProbeResult) -> Result<(), StoreError> {
        validate_key_part("monitor_id", &result.monitor_id)?;
        let mut rows = self.statuses.entry(result.monitor_id.clone()).or_default();
        if rows
            .iter()
            .any(|r| r.timestamp == result.timestamp && r.region == result.region)
        {
            return Ok(());
        }
        let pos = rows.partition_point(|r| r.timestamp <= result.timestamp);
        rows.insert(pos, result.clone());
        Ok(())
    }

    async fn latest_statuses(
        &self,
        monitor_id: &str,
        limit: usize,
    ) -> Result<Vec<ProbeResult>, StoreError> {
        Ok(self
            .statuses
            .get(monitor_id)
            .map(|rows| rows.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn statuses_between(
        &self,
        monitor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ProbeResult>, StoreError> {
        Ok(self
            .statuses
            .get(monitor_id)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.timestamp >= from && r.timestamp < to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn prune_statuses_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut removed = 0u64;
        for mut rows in self.statuses.iter_mut() {
            let before = rows.len();
            rows.retain(|r| r.timestamp >= cutoff);
            removed += (before - rows.len()) as u64;
        }
        self.statuses.retain(|_, rows| !rows.is_empty());
        Ok(removed)
    }

    async fn delete_statuses_for_monitor(&self, monitor_id: &str) -> Result<u64, StoreError> {
        Ok(self
            .statuses
            .remove(monitor_id)
            .map(|(_, rows)| rows.len() as u64)
            .unwrap_or(0))
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn get_alert(&self, owner_id: &str, alert_id: &str) -> Result<Alert, StoreError> {
        self.alerts
            .get(&(owner_id.to_string(), alert_id.to_string()))
            .map(|a| a.clone())
            .ok_or_else(|| StoreError::NotFound(format!("alert {owner_id}/{alert_id}")))
    }

    async fn list_alerts_for_owner(&self, owner_id: &str) -> Result<Vec<Alert>, StoreError> {
        let mut alerts: Vec<Alert> = self
            .alerts
            .iter()
            .filter(|a| a.owner_id == owner_id)
            .map(|a| a.clone())
            .collect();
        alerts.sort_by(|a, b| a.alert_id.cmp(&b.alert_id));
        Ok(alerts)
    }

    async fn put_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        validate_key_part("owner_id", &alert.owner_id)?;
        validate_key_part("alert_id", &alert.alert_id)?;
        let taken = self
            .alerts
            .iter()
            .any(|e| e.key().1 == alert.alert_id && e.key().0 != alert.owner_id);
        if taken {
            return Err(StoreError::ConditionFailed(format!(
                "alert {} belongs to another owner",
                alert.alert_id
            )));
        }
        self.alerts.insert(
            (alert.owner_id.clone(), alert.alert_id.clone()),
            alert.clone(),
        );
        Ok(())
    }

    async fn delete_alert(&self, owner_id: &str, alert_id: &str) -> Result<Alert, StoreError> {
        self.alerts
            .remove(&(owner_id.to_string(), alert_id.to_string()))
            .map(|(_, alert)| alert)
            .ok_or_else(|| StoreError::NotFound(format!("alert {owner_id}/{alert_id}")))
    }
}

#[async_trait]
impl AlertInvocationStore for MemoryStore {
    async fn get_invocation(
        &self,
        alert_id: &str,
        sort_key: &str,
    ) -> Result<AlertInvocation, StoreError> {
        let (monitor_id, _) = parse_invocation_sort_key(sort_key)?;
        self.invocations
            .get(&(alert_id.to_string(), monitor_id))
            .and_then(|rows| rows.iter().find(|i| i.sort_key() == sort_key).cloned())
            .ok_or_else(|| StoreError::NotFound(format!("invocation {alert_id}/{sort_key}")))
    }

    async fn open_invocation(
        &self,
        alert_id: &str,
        monitor_id: &str,
    ) -> Result<Option<AlertInvocation>, StoreError> {
        Ok(self
            .invocations
            .get(&(alert_id.to_string(), monitor_id.to_string()))
            .and_then(|rows| rows.iter().find(|i| i.ongoing).cloned()))
    }

    async fn start_incident(&self, start: &AlertInvocation) -> Result<(), StoreError> {
        validate_key_part("alert_id", &start.alert_id)?;
        validate_key_part("monitor_id", &start.monitor_id)?;
        if start.event != InvocationEvent::IncidentStart || !start.ongoing {
            return Err(StoreError::Internal(
                "start_incident expects an ongoing incident_start".to_string(),
            ));
        }
        let mut rows = self
            .invocations
            .entry((start.alert_id.clone(), start.monitor_id.clone()))
            .or_default();
        if rows.iter().any(|i| i.ongoing) {
            return Err(StoreError::ConditionFailed(format!(
                "alert {} already ongoing for monitor {}",
                start.alert_id, start.monitor_id
            )));
        }
        if rows.iter().any(|i| i.timestamp >= start.timestamp) {
            return Err(StoreError::ConditionFailed(format!(
                "invocation at or after {} already exists",
                start.sort_key()
            )));
        }
        rows.push(start.clone());
        rows.sort_by_key(|i| i.timestamp);
        Ok(())
    }

    async fn end_incident(
        &self,
        open: &AlertInvocation,
        end: &AlertInvocation,
    ) -> Result<(), StoreError> {
        if end.event != InvocationEvent::IncidentEnd || end.ongoing {
            return Err(StoreError::Internal(
                "end_incident expects a closed incident_end".to_string(),
            ));
        }
        let Some(mut rows) = self
            .invocations
            .get_mut(&(open.alert_id.clone(), open.monitor_id.clone()))
        else {
            return Err(StoreError::ConditionFailed(format!(
                "no open invocation for alert {} on monitor {}",
                open.alert_id, open.monitor_id
            )));
        };
        let open_key = open.sort_key();
        let Some(existing) = rows.iter_mut().find(|i| i.sort_key() == open_key && i.ongoing)
        else {
            return Err(StoreError::ConditionFailed(format!(
                "invocation {open_key} is no longer ongoing"
            )));
        };
        existing.ongoing = false;
        rows.push(end.clone());
        rows.sort_by_key(|i| i.timestamp);
        Ok(())
    }

    async fn invocations_for_pair(
        &self,
        alert_id: &str,
        monitor_id: &str,
    ) -> Result<Vec<AlertInvocation>, StoreError> {
        Ok(self
            .invocations
            .get(&(alert_id.to_string(), monitor_id.to_string()))
            .map(|rows| rows.clone())
            .unwrap_or_default())
    }

    async fn invocations_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AlertInvocation>, StoreError> {
        let mut found: Vec<AlertInvocation> = self
            .invocations
            .iter()
            .flat_map(|rows| {
                rows.iter()
                    .filter(|i| i.timestamp >= from && i.timestamp < to)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        found.sort_by_key(|i| i.timestamp);
        Ok(found)
    }

    async fn delete_invocations_for_monitor(&self, monitor_id: &str) -> Result<u64, StoreError> {
        let mut removed = 0u64;
        self.invocations.retain(|(_, m), rows| {
            if m == monitor_id {
                removed += rows.len() as u64;
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn delete_invocations_for_alert(&self, alert_id: &str) -> Result<u64, StoreError> {
        let mut removed = 0u64;
        self.invocations.retain(|(a, _), rows| {
            if a == alert_id {
                removed += rows.len() as u64;
                false
            } else {
                true
            }
        });
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{HttpRequestParams, Severity};
    use chrono::{Duration, TimeZone};

    fn monitor(id: &str, frequency: CheckFrequency, regions: &[&str]) -> Monitor {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Monitor {
            owner_id: "owner".to_string(),
            monitor_id: id.to_string(),
            name: id.to_string(),
            url: "https://example.com".to_string(),
            regions: regions.iter().map(|r| r.to_string()).collect(),
            frequency,
            failure_threshold: 2,
            request: HttpRequestParams::default(),
            up_conditions: Vec::new(),
            alert_ids: Vec::new(),
            webhook_url: None,
            created_at: now,
            last_updated: now,
        }
    }

    fn alert() -> Alert {
        Alert {
            owner_id: "owner".to_string(),
            alert_id: "a1".to_string(),
            name: "pager".to_string(),
            severity: Severity::Critical,
            channels: Vec::new(),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn frequency_index_follows_updates() {
        let store = MemoryStore::new();
        let mut m = monitor("m1", CheckFrequency::FiveMinutes, &["us-east-1", "eu-west-1"]);
        store.put_monitor(&m).await.unwrap();

        let east = store
            .monitors_by_frequency(CheckFrequency::FiveMinutes, "us-east-1")
            .await
            .unwrap();
        assert_eq!(east.len(), 1);

        m.frequency = CheckFrequency::OneHour;
        m.regions = vec!["eu-west-1".to_string()];
        store.put_monitor(&m).await.unwrap();

        assert!(store
            .monitors_by_frequency(CheckFrequency::FiveMinutes, "us-east-1")
            .await
            .unwrap()
            .is_empty());
        assert!(store
            .monitors_by_frequency(CheckFrequency::FiveMinutes, "eu-west-1")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            store
                .monitors_by_frequency(CheckFrequency::OneHour, "eu-west-1")
                .await
                .unwrap()
                .len(),
            1
        );

        store.delete_monitor("owner", "m1").await.unwrap();
        assert!(store
            .monitors_by_frequency(CheckFrequency::OneHour, "eu-west-1")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn insert_rejects_existing_monitor() {
        let store = MemoryStore::new();
        let m = monitor("m1", CheckFrequency::OneMinute, &["us-east-1"]);
        store.insert_monitor(&m).await.unwrap();
        let err = store.insert_monitor(&m).await.unwrap_err();
        assert!(err.is_condition_failed());

        let mut other_owner = m.clone();
        other_owner.owner_id = "someone-else".to_string();
        assert!(store.insert_monitor(&other_owner).await.unwrap_err().is_condition_failed());
        assert!(store.put_monitor(&other_owner).await.unwrap_err().is_condition_failed());
        assert!(matches!(
            store.get_monitor("someone-else", "m1").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn second_ongoing_start_is_rejected() {
        let store = MemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let first = AlertInvocation::incident_start(&alert(), "m1", t0);
        let second = AlertInvocation::incident_start(&alert(), "m1", t0 + Duration::minutes(1));

        store.start_incident(&first).await.unwrap();
        let err = store.start_incident(&second).await.unwrap_err();
        assert!(err.is_condition_failed());

        let open = store.open_invocation("a1", "m1").await.unwrap().unwrap();
        assert_eq!(open.timestamp, t0);
    }

    #[tokio::test]
    async fn start_behind_a_newer_end_is_rejected() {
        let store = MemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let start = AlertInvocation::incident_start(&alert(), "m1", t0);
        let end = AlertInvocation::incident_end(&alert(), "m1", t0 + Duration::minutes(2));
        store.start_incident(&start).await.unwrap();
        store.end_incident(&start, &end).await.unwrap();

        let stale = AlertInvocation::incident_start(&alert(), "m1", t0 + Duration::minutes(1));
        assert!(store
            .start_incident(&stale)
            .await
            .unwrap_err()
            .is_condition_failed());
        assert!(store.open_invocation("a1", "m1").await.unwrap().is_none());

        let fresh = AlertInvocation::incident_start(&alert(), "m1", t0 + Duration::minutes(3));
        store.start_incident(&fresh).await.unwrap();
    }

    #[tokio::test]
    async fn end_requires_the_open_invocation() {
        let store = MemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let start = AlertInvocation::incident_start(&alert(), "m1", t0);
        let end = AlertInvocation::incident_end(&alert(), "m1", t0 + Duration::minutes(5));

        assert!(store
            .end_incident(&start, &end)
            .await
            .unwrap_err()
            .is_condition_failed());

        store.start_incident(&start).await.unwrap();
        store.end_incident(&start, &end).await.unwrap();
        assert!(store.open_invocation("a1", "m1").await.unwrap().is_none());

        // A second close of the same incident loses.
        let late_end = AlertInvocation::incident_end(&alert(), "m1", t0 + Duration::minutes(6));
        assert!(store
            .end_incident(&start, &late_end)
            .await
            .unwrap_err()
            .is_condition_failed());

        let history = store.invocations_for_pair("a1", "m1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|i| !i.ongoing));

        let fetched = store.get_invocation("a1", &start.sort_key()).await.unwrap();
        assert_eq!(fetched.event, InvocationEvent::IncidentStart);
        assert!(!fetched.ongoing);
    }

    #[tokio::test]
    async fn statuses_are_ordered_and_prunable() {
        let store = MemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for minute in [10, 0, 5] {
            let r = ProbeResult::unreachable("m1", "us-east-1", t0 + Duration::minutes(minute), "x");
            store.append_status(&r).await.unwrap();
        }
        // Duplicate write of the same row is ignored.
        let dup = ProbeResult::unreachable("m1", "us-east-1", t0, "x");
        store.append_status(&dup).await.unwrap();

        let latest = store.latest_statuses("m1", 2).await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].timestamp, t0 + Duration::minutes(10));
        assert_eq!(latest[1].timestamp, t0 + Duration::minutes(5));

        let removed = store
            .prune_statuses_before(t0 + Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let window = store
            .statuses_between("m1", t0, t0 + Duration::minutes(60))
            .await
            .unwrap();
        assert_eq!(window.len(), 2);
    }
}
