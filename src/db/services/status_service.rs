//! Windowed uptime and latency aggregates over the status history.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::db::error::StoreError;
use crate::db::models::ProbeStatus;
use crate::db::store::StatusStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryWindow {
    Day,
    Week,
    Month,
}

impl SummaryWindow {
    pub fn duration(self) -> Duration {
        match self {
            SummaryWindow::Day => Duration::hours(24),
            SummaryWindow::Week => Duration::days(7),
            SummaryWindow::Month => Duration::days(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UptimeSummary {
    pub monitor_id: String,
    pub window: SummaryWindow,
    pub total_checks: usize,
    pub up_checks: usize,
    pub uptime_percent: Option<f64>,
    pub p50_latency_ms: Option<f64>,
    pub p95_latency_ms: Option<f64>,
    pub p99_latency_ms: Option<f64>,
}

/// Nearest-rank percentile over measured latencies.
///
/// Negative values (the no-response sentinel) are ignored. Returns `None`
/// when nothing measurable remains, or when `p` is outside `0..=100`.
pub fn percentile(latencies: &[i64], p: f64) -> Option<f64> {
    if !(0.0..=100.0).contains(&p) {
        return None;
    }
    let mut measured: Vec<i64> = latencies.iter().copied().filter(|l| *l >= 0).collect();
    if measured.is_empty() {
        return None;
    }
    measured.sort_unstable();
    let rank = ((p / 100.0) * measured.len() as f64).ceil() as usize;
    let index = rank.saturating_sub(1).min(measured.len() - 1);
    Some(measured[index] as f64)
}

pub async fn uptime_summary(
    statuses: &dyn StatusStore,
    monitor_id: &str,
    window: SummaryWindow,
    now: DateTime<Utc>,
) -> Result<UptimeSummary, StoreError> {
    let rows = statuses
        .statuses_between(monitor_id, now - window.duration(), now)
        .await?;

    let total_checks = rows.len();
    let up_checks = rows.iter().filter(|r| r.status == ProbeStatus::Up).count();
    let uptime_percent =
        (total_checks > 0).then(|| up_checks as f64 * 100.0 / total_checks as f64);
    let latencies: Vec<i64> = rows.iter().map(|r| r.latency_ms).collect();

    Ok(UptimeSummary {
        monitor_id: monitor_id.to_string(),
        window,
        total_checks,
        up_checks,
        uptime_percent,
        p50_latency_ms: percentile(&latencies, 50.0),
        p95_latency_ms: percentile(&latencies, 95.0),
        p99_latency_ms: percentile(&latencies, 99.0),
    })
}
