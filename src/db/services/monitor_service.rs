//! Monitor management: validated create/update/delete.
//!
//! All configuration errors are raised here, at write time, so the scheduler
//! only ever sees monitors with a supported frequency and a parsable target.

use chrono::Utc;
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::ManagementError;
use crate::db::models::{validate_key_part, CheckFrequency, HttpRequestParams, Monitor, UpCondition};
use crate::db::store::{AlertInvocationStore, AlertStore, MonitorStore, StatusStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMonitor {
    pub name: String,
    pub url: String,
    pub regions: Vec<String>,
    pub frequency_minutes: u32,
    pub failure_threshold: Option<u32>,
    pub request: Option<HttpRequestParams>,
    #[serde(default)]
    pub up_conditions: Vec<UpCondition>,
    #[serde(default)]
    pub alert_ids: Vec<String>,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMonitor {
    pub name: Option<String>,
    pub url: Option<String>,
    pub regions: Option<Vec<String>>,
    pub frequency_minutes: Option<u32>,
    pub failure_threshold: Option<u32>,
    pub request: Option<HttpRequestParams>,
    pub up_conditions: Option<Vec<UpCondition>>,
    pub alert_ids: Option<Vec<String>>,
    /// `Some(None)` clears the webhook.
    pub webhook_url: Option<Option<String>>,
}

fn parse_frequency(minutes: u32) -> Result<CheckFrequency, ManagementError> {
    CheckFrequency::try_from(minutes).map_err(ManagementError::Configuration)
}

fn validate_http_url(kind: &str, raw: &str) -> Result<(), ManagementError> {
    let url = Url::parse(raw)
        .map_err(|e| ManagementError::Configuration(format!("invalid {kind} '{raw}': {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ManagementError::Configuration(format!(
            "unsupported {kind} scheme '{other}'"
        ))),
    }
}

/// Checks everything about a monitor that does not need the store.
pub fn validate_monitor(monitor: &Monitor) -> Result<(), ManagementError> {
    validate_key_part("owner_id", &monitor.owner_id)?;
    validate_key_part("monitor_id", &monitor.monitor_id)?;
    if monitor.name.trim().is_empty() {
        return Err(ManagementError::Configuration("name must not be empty".to_string()));
    }
    validate_http_url("url", &monitor.url)?;
    if monitor.regions.is_empty() {
        return Err(ManagementError::Configuration(
            "at least one region is required".to_string(),
        ));
    }
    for region in &monitor.regions {
        validate_key_part("region", region)?;
    }
    if monitor.failure_threshold < 1 {
        return Err(ManagementError::Configuration(
            "failure threshold must be at least 1".to_string(),
        ));
    }
    Method::from_bytes(monitor.request.method.to_uppercase().as_bytes()).map_err(|_| {
        ManagementError::Configuration(format!("invalid HTTP method '{}'", monitor.request.method))
    })?;
    for condition in &monitor.up_conditions {
        if let UpCondition::StatusCodeRange { min, max } = condition {
            if min > max || *min < 100 || *max > 599 {
                return Err(ManagementError::Configuration(format!(
                    "invalid status code range {min}..={max}"
                )));
            }
        }
    }
    if let Some(webhook) = &monitor.webhook_url {
        validate_http_url("webhook url", webhook)?;
    }
    Ok(())
}

async fn ensure_alerts_exist(
    alerts: &dyn AlertStore,
    owner_id: &str,
    alert_ids: &[String],
) -> Result<(), ManagementError> {
    for alert_id in alert_ids {
        alerts.get_alert(owner_id, alert_id).await.map_err(|e| match e {
            crate::db::StoreError::NotFound(_) => {
                ManagementError::Configuration(format!("unknown alert '{alert_id}'"))
            }
            other => other.into(),
        })?;
    }
    Ok(())
}

fn normalize_regions(mut regions: Vec<String>) -> Vec<String> {
    for region in regions.iter_mut() {
        *region = region.trim().to_string();
    }
    regions.sort();
    regions.dedup();
    regions
}

/// Creates a monitor under a freshly minted id. Status and invocation rows
/// are keyed by monitor id alone, so ids are never taken from the caller.
pub async fn create_monitor(
    monitors: &dyn MonitorStore,
    alerts: &dyn AlertStore,
    owner_id: &str,
    payload: CreateMonitor,
) -> Result<Monitor, ManagementError> {
    let now = Utc::now();
    let monitor = Monitor {
        owner_id: owner_id.to_string(),
        monitor_id: uuid::Uuid::new_v4().to_string(),
        name: payload.name,
        url: payload.url,
        regions: normalize_regions(payload.regions),
        frequency: parse_frequency(payload.frequency_minutes)?,
        failure_threshold: payload.failure_threshold.unwrap_or(1),
        request: payload.request.unwrap_or_default(),
        up_conditions: payload.up_conditions,
        alert_ids: payload.alert_ids,
        webhook_url: payload.webhook_url,
        created_at: now,
        last_updated: now,
    };
    validate_monitor(&monitor)?;
    ensure_alerts_exist(alerts, owner_id, &monitor.alert_ids).await?;

    monitors.insert_monitor(&monitor).await?;
    info!(owner_id, monitor_id = %monitor.monitor_id, frequency = %monitor.frequency, "Monitor created.");
    Ok(monitor)
}

pub async fn update_monitor(
    monitors: &dyn MonitorStore,
    alerts: &dyn AlertStore,
    owner_id: &str,
    monitor_id: &str,
    payload: UpdateMonitor,
) -> Result<Monitor, ManagementError> {
    let mut monitor = monitors.get_monitor(owner_id, monitor_id).await?;

    if let Some(name) = payload.name {
        monitor.name = name;
    }
    if let Some(url) = payload.url {
        monitor.url = url;
    }
    if let Some(regions) = payload.regions {
        monitor.regions = normalize_regions(regions);
    }
    if let Some(minutes) = payload.frequency_minutes {
        monitor.frequency = parse_frequency(minutes)?;
    }
    if let Some(threshold) = payload.failure_threshold {
        monitor.failure_threshold = threshold;
    }
    if let Some(request) = payload.request {
        monitor.request = request;
    }
    if let Some(conditions) = payload.up_conditions {
        monitor.up_conditions = conditions;
    }
    if let Some(alert_ids) = payload.alert_ids {
        monitor.alert_ids = alert_ids;
    }
    if let Some(webhook_url) = payload.webhook_url {
        monitor.webhook_url = webhook_url;
    }
    monitor.last_updated = Utc::now();

    validate_monitor(&monitor)?;
    ensure_alerts_exist(alerts, owner_id, &monitor.alert_ids).await?;

    monitors.put_monitor(&monitor).await?;
    info!(owner_id, monitor_id, "Monitor updated.");
    Ok(monitor)
}

/// Deletes a monitor, then best-effort removes its status and invocation rows.
pub async fn delete_monitor(
    monitors: &dyn MonitorStore,
    statuses: &dyn StatusStore,
    invocations: &dyn AlertInvocationStore,
    owner_id: &str,
    monitor_id: &str,
) -> Result<Monitor, ManagementError> {
    let monitor = monitors.delete_monitor(owner_id, monitor_id).await?;

    match statuses.delete_statuses_for_monitor(monitor_id).await {
        Ok(count) => info!(monitor_id, count, "Deleted status rows for monitor."),
        Err(e) => warn!(monitor_id, error = %e, "Failed to delete status rows for monitor."),
    }
    match invocations.delete_invocations_for_monitor(monitor_id).await {
        Ok(count) => info!(monitor_id, count, "Deleted alert invocations for monitor."),
        Err(e) => warn!(monitor_id, error = %e, "Failed to delete alert invocations for monitor."),
    }

    Ok(monitor)
}
