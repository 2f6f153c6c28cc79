use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::error::StoreError;
use crate::notifications::models::ChannelConfig;

/// Latency recorded when a probe got no response at all.
pub const NO_RESPONSE_LATENCY: i64 = -1;

/// Separator used in composite sort keys (`monitor_id#timestamp`).
pub const KEY_SEPARATOR: char = '#';

/// The fixed set of supported check intervals, in minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum CheckFrequency {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    ThreeHours,
    SixHours,
    TwelveHours,
    OneDay,
}

impl CheckFrequency {
    pub const ALL: [CheckFrequency; 9] = [
        CheckFrequency::OneMinute,
        CheckFrequency::FiveMinutes,
        CheckFrequency::FifteenMinutes,
        CheckFrequency::ThirtyMinutes,
        CheckFrequency::OneHour,
        CheckFrequency::ThreeHours,
        CheckFrequency::SixHours,
        CheckFrequency::TwelveHours,
        CheckFrequency::OneDay,
    ];

    pub fn minutes(self) -> u32 {
        match self {
            CheckFrequency::OneMinute => 1,
            CheckFrequency::FiveMinutes => 5,
            CheckFrequency::FifteenMinutes => 15,
            CheckFrequency::ThirtyMinutes => 30,
            CheckFrequency::OneHour => 60,
            CheckFrequency::ThreeHours => 180,
            CheckFrequency::SixHours => 360,
            CheckFrequency::TwelveHours => 720,
            CheckFrequency::OneDay => 1440,
        }
    }
}

impl TryFrom<u32> for CheckFrequency {
    type Error = String;

    fn try_from(minutes: u32) -> Result<Self, Self::Error> {
        CheckFrequency::ALL
            .into_iter()
            .find(|f| f.minutes() == minutes)
            .ok_or_else(|| format!("unsupported check frequency: {minutes} minutes"))
    }
}

impl From<CheckFrequency> for u32 {
    fn from(frequency: CheckFrequency) -> Self {
        frequency.minutes()
    }
}

impl fmt::Display for CheckFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}m", self.minutes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestParams {
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

impl Default for HttpRequestParams {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            headers: HashMap::new(),
            body: None,
        }
    }
}

/// A predicate a probe response must satisfy for the target to count as up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UpCondition {
    #[serde(rename_all = "camelCase")]
    StatusCodeRange { min: u16, max: u16 },
    #[serde(rename_all = "camelCase")]
    BodyContains { text: String },
    #[serde(rename_all = "camelCase")]
    LatencyBelow { max_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Monitor {
    pub owner_id: String,
    pub monitor_id: String,
    pub name: String,
    pub url: String,
    pub regions: Vec<String>,
    pub frequency: CheckFrequency,
    pub failure_threshold: u32,
    #[serde(default)]
    pub request: HttpRequestParams,
    #[serde(default)]
    pub up_conditions: Vec<UpCondition>,
    #[serde(default)]
    pub alert_ids: Vec<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Monitor {
    /// Threshold used by the evaluator; never below one.
    pub fn effective_threshold(&self) -> usize {
        self.failure_threshold.max(1) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Up,
    Down,
}

impl ProbeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProbeStatus::Up => "up",
            ProbeStatus::Down => "down",
        }
    }
}

impl std::str::FromStr for ProbeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(ProbeStatus::Up),
            "down" => Ok(ProbeStatus::Down),
            other => Err(format!("unknown probe status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseDescriptor {
    pub status_code: Option<u16>,
    pub message: Option<String>,
}

/// One immutable probe outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub monitor_id: String,
    pub region: String,
    pub timestamp: DateTime<Utc>,
    pub status: ProbeStatus,
    /// Milliseconds, or [`NO_RESPONSE_LATENCY`] when nothing answered.
    pub latency_ms: i64,
    #[serde(default)]
    pub response: ResponseDescriptor,
}

impl ProbeResult {
    pub fn unreachable(
        monitor_id: &str,
        region: &str,
        timestamp: DateTime<Utc>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            monitor_id: monitor_id.to_string(),
            region: region.to_string(),
            timestamp,
            status: ProbeStatus::Down,
            latency_ms: NO_RESPONSE_LATENCY,
            response: ResponseDescriptor {
                status_code: None,
                message: Some(message.into()),
            },
        }
    }

    pub fn latency(&self) -> Option<u64> {
        u64::try_from(self.latency_ms).ok()
    }

    pub fn is_down(&self) -> bool {
        self.status == ProbeStatus::Down
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub owner_id: String,
    pub alert_id: String,
    pub name: String,
    pub severity: Severity,
    pub channels: Vec<ChannelConfig>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationEvent {
    IncidentStart,
    IncidentEnd,
}

impl InvocationEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            InvocationEvent::IncidentStart => "incident_start",
            InvocationEvent::IncidentEnd => "incident_end",
        }
    }
}

impl std::str::FromStr for InvocationEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incident_start" => Ok(InvocationEvent::IncidentStart),
            "incident_end" => Ok(InvocationEvent::IncidentEnd),
            other => Err(format!("unknown invocation event: {other}")),
        }
    }
}

impl fmt::Display for InvocationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded alert lifecycle event for one `(alert_id, monitor_id)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertInvocation {
    pub alert_id: String,
    pub monitor_id: String,
    pub timestamp: DateTime<Utc>,
    pub event: InvocationEvent,
    pub ongoing: bool,
    pub alert: Alert,
}

impl AlertInvocation {
    pub fn incident_start(alert: &Alert, monitor_id: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            alert_id: alert.alert_id.clone(),
            monitor_id: monitor_id.to_string(),
            timestamp,
            event: InvocationEvent::IncidentStart,
            ongoing: true,
            alert: alert.clone(),
        }
    }

    pub fn incident_end(alert: &Alert, monitor_id: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            alert_id: alert.alert_id.clone(),
            monitor_id: monitor_id.to_string(),
            timestamp,
            event: InvocationEvent::IncidentEnd,
            ongoing: false,
            alert: alert.clone(),
        }
    }

    pub fn sort_key(&self) -> String {
        invocation_sort_key(&self.monitor_id, self.timestamp)
    }
}

/// Rejects ids that are empty or would break composite keys.
pub fn validate_key_part(kind: &str, value: &str) -> Result<(), StoreError> {
    if value.trim().is_empty() {
        return Err(StoreError::InvalidKey(format!("{kind} must not be empty")));
    }
    if value.contains(KEY_SEPARATOR) {
        return Err(StoreError::InvalidKey(format!(
            "{kind} must not contain '{KEY_SEPARATOR}': {value}"
        )));
    }
    Ok(())
}

/// Builds `monitor_id#<millis>`; millis are zero-padded so keys sort by time.
pub fn invocation_sort_key(monitor_id: &str, timestamp: DateTime<Utc>) -> String {
    format!(
        "{monitor_id}{KEY_SEPARATOR}{:015}",
        timestamp.timestamp_millis().max(0)
    )
}

pub fn parse_invocation_sort_key(key: &str) -> Result<(String, DateTime<Utc>), StoreError> {
    let (monitor_id, millis) = key
        .rsplit_once(KEY_SEPARATOR)
        .ok_or_else(|| StoreError::InvalidKey(format!("missing separator in key: {key}")))?;
    validate_key_part("monitor_id", monitor_id)?;
    let millis: i64 = millis
        .parse()
        .map_err(|_| StoreError::InvalidKey(format!("bad timestamp in key: {key}")))?;
    let timestamp = DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::InvalidKey(format!("timestamp out of range in key: {key}")))?;
    Ok((monitor_id.to_string(), timestamp))
}
