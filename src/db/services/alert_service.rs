use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::ManagementError;
use crate::db::models::{validate_key_part, Alert, Severity};
use crate::db::store::{AlertInvocationStore, AlertStore, MonitorStore};
use crate::notifications::models::ChannelConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAlert {
    pub name: String,
    pub severity: Severity,
    pub channels: Vec<ChannelConfig>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAlert {
    pub name: Option<String>,
    pub severity: Option<Severity>,
    pub channels: Option<Vec<ChannelConfig>>,
    pub enabled: Option<bool>,
}

fn validate_alert(alert: &Alert) -> Result<(), ManagementError> {
    validate_key_part("owner_id", &alert.owner_id)?;
    validate_key_part("alert_id", &alert.alert_id)?;
    if alert.name.trim().is_empty() {
        return Err(ManagementError::Configuration("alert name must not be empty".to_string()));
    }
    if alert.channels.is_empty() {
        return Err(ManagementError::Configuration(
            "an alert needs at least one delivery channel".to_string(),
        ));
    }
    for channel in &alert.channels {
        channel.validate().map_err(ManagementError::Configuration)?;
    }
    Ok(())
}

/// Creates an alert under a freshly minted id. Invocations are keyed by alert
/// id alone, so ids are never taken from the caller.
pub async fn create_alert(
    alerts: &dyn AlertStore,
    owner_id: &str,
    payload: CreateAlert,
) -> Result<Alert, ManagementError> {
    let alert = Alert {
        owner_id: owner_id.to_string(),
        alert_id: uuid::Uuid::new_v4().to_string(),
        name: payload.name,
        severity: payload.severity,
        channels: payload.channels,
        enabled: payload.enabled.unwrap_or(true),
    };
    validate_alert(&alert)?;

    alerts.put_alert(&alert).await?;
    info!(owner_id, alert_id = %alert.alert_id, "Alert created.");
    Ok(alert)
}

pub async fn update_alert(
    alerts: &dyn AlertStore,
    owner_id: &str,
    alert_id: &str,
    payload: UpdateAlert,
) -> Result<Alert, ManagementError> {
    let mut alert = alerts.get_alert(owner_id, alert_id).await?;
    if let Some(name) = payload.name {
        alert.name = name;
    }
    if let Some(severity) = payload.severity {
        alert.severity = severity;
    }
    if let Some(channels) = payload.channels {
        alert.channels = channels;
    }
    if let Some(enabled) = payload.enabled {
        alert.enabled = enabled;
    }
    validate_alert(&alert)?;
    alerts.put_alert(&alert).await?;
    Ok(alert)
}

/// Deletes an alert, detaches it from the owner's monitors and drops its
/// invocation history. Steps after the primary delete are best-effort.
pub async fn delete_alert(
    alerts: &dyn AlertStore,
    monitors: &dyn MonitorStore,
    invocations: &dyn AlertInvocationStore,
    owner_id: &str,
    alert_id: &str,
) -> Result<Alert, ManagementError> {
    let alert = alerts.delete_alert(owner_id, alert_id).await?;

    match monitors.list_monitors_for_owner(owner_id).await {
        Ok(owned) => {
            for mut monitor in owned.into_iter().filter(|m| m.alert_ids.iter().any(|a| a == alert_id)) {
                monitor.alert_ids.retain(|a| a != alert_id);
                if let Err(e) = monitors.put_monitor(&monitor).await {
                    warn!(alert_id, monitor_id = %monitor.monitor_id, error = %e, "Failed to detach alert from monitor.");
                }
            }
        }
        Err(e) => warn!(alert_id, error = %e, "Failed to list monitors while detaching alert."),
    }

    match invocations.delete_invocations_for_alert(alert_id).await {
        Ok(count) => info!(alert_id, count, "Deleted alert invocations."),
        Err(e) => warn!(alert_id, error = %e, "Failed to delete alert invocations."),
    }

    Ok(alert)
}
